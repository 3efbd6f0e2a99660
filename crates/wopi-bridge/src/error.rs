//! Bridge-level configuration errors, fatal at startup.
//!
//! Request-handling failures are not funneled through a shared error type:
//! `/open` renders an HTML notice on failure while `/save` and `/list`
//! render JSON, so each handler in `handlers.rs` builds its own response
//! directly instead of going through a one-size-fits-all `IntoResponse`.

use thiserror::Error;

/// A message shown to end users when content may have been lost due to an
/// unanticipated failure.
pub const RECOVER_MSG: &str =
    "Please copy the content to a safe place and reopen the document again to paste it back.";

#[derive(Debug, Error)]
pub enum BridgeError {
    /// A mandatory setting or secret file was missing or malformed at startup.
    #[error("configuration error: {0}")]
    Config(String),
}
