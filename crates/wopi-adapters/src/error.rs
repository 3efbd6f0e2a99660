//! Errors raised by app adapters.

use thiserror::Error;
use wopi_client::WopiError;

/// Failures an [`crate::AppAdapter`] can raise.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// A mandatory setting or secret file was missing at adapter construction.
    #[error("adapter configuration error: {0}")]
    Config(String),

    /// Any unrecoverable failure talking to the app (connection error,
    /// unexpected status, malformed response).
    #[error("app failure: {0}")]
    AppFailure(String),

    /// A WOPI call made on behalf of the adapter failed.
    #[error(transparent)]
    Wopi(#[from] WopiError),
}
