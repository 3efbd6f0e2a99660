//! Error type returned by every [`crate::WopiClient`] call.

use thiserror::Error;

/// Failures observed while talking to a WOPI-enabled storage endpoint.
#[derive(Debug, Error)]
pub enum WopiError {
    /// Storage reported no lock, or a lock that does not match ours.
    ///
    /// `status` carries the HTTP status WOPI responded with: `404` means
    /// "no lock exists yet", anything else means a conflicting lock or a
    /// transport-level problem while asking for one.
    #[error("invalid lock (status {status}{})", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    InvalidLock {
        status: u16,
        reason: Option<String>,
    },

    /// Storage answered a request with a status this bridge doesn't treat
    /// as success for the verb being issued.
    #[error("unexpected WOPI response (verb {verb}, status {status})")]
    UnexpectedStatus { verb: &'static str, status: u16 },

    /// The underlying HTTP transport failed (connect/timeout/TLS/etc).
    #[error("WOPI transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl WopiError {
    /// True for the specific "no lock held yet" case, as opposed to a
    /// conflicting lock or a transport failure.
    pub fn is_missing_lock(&self) -> bool {
        matches!(self, WopiError::InvalidLock { status: 404, .. })
    }
}
