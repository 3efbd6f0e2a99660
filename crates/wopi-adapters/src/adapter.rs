//! The narrow contract every app plugin satisfies (§4.2 of the design).

use async_trait::async_trait;
use wopi_client::{FileMeta, WopiLock};

use crate::error::AdapterError;

/// A plugin that knows how to push a document from storage into a specific
/// collaborative app, and pull it back.
///
/// Implementations must be deterministic w.r.t. `docid`: given the same
/// `(wopisrc, docid)` pair, repeated [`AppAdapter::load_from_storage`] calls
/// converge on the same app-side document (possibly via server-side
/// aliasing, as the Markdown adapter does).
#[async_trait]
pub trait AppAdapter: Send + Sync {
    /// Short tag identifying this adapter, matching the `app` field stored
    /// in the WOPI lock (e.g. `md`, `mds`).
    fn tag(&self) -> &'static str;

    /// Fetch the file via WOPI and push it into the app under `docid`
    /// (or let the app assign one when `docid` is `None`, i.e. a read-only
    /// session), returning a freshly built WOPI lock.
    async fn load_from_storage(
        &self,
        filemd: &FileMeta,
        wopisrc: &str,
        acctok: &str,
        docid: Option<String>,
    ) -> Result<WopiLock, AdapterError>;

    /// Fetch the document back from the app, PUT it to storage, refresh the
    /// lock's digest, and return a user-facing `(body, status)` result.
    ///
    /// Most failure modes (a transient fetch error, a missing attachment)
    /// are reported through the returned status rather than `Err`: `Err` is
    /// reserved for adapter misconfiguration or truly unexpected failures.
    async fn save_to_storage(
        &self,
        wopisrc: &str,
        acctok: &str,
        isclose: bool,
        lock: &WopiLock,
    ) -> Result<(String, u16), AdapterError>;

    /// Compute the browser-facing URL the user is redirected to after `/open`.
    async fn get_redirect_url(
        &self,
        is_read_write: bool,
        wopisrc: &str,
        acctok: &str,
        lock: &WopiLock,
        display_name: &str,
    ) -> Result<String, AdapterError>;
}
