//! Thin, typed wrapper over the WOPI HTTP verbs the bridge consumes.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use tracing::debug;

use crate::error::WopiError;
use crate::filemeta::FileMeta;
use crate::lock::WopiLock;

const LOCK_FAILURE_REASON_HEADER: &str = "X-WOPI-LockFailureReason";
const WOPI_LOCK_HEADER: &str = "X-WOPI-Lock";
const WOPI_OVERRIDE_HEADER: &str = "X-WOPI-Override";
const SUGGESTED_TARGET_HEADER: &str = "X-WOPI-SuggestedTarget";

/// Optional overrides applied by [`WopiClient::refresh_lock`] before the
/// refreshed lock is pushed back to storage.
#[derive(Debug, Clone, Default)]
pub struct LockOverrides {
    pub digest: Option<String>,
    pub toclose: Option<HashMap<String, bool>>,
}

/// A small, stateless HTTP client talking the WOPI verbs this bridge needs.
///
/// Every call carries the client-wide timeout configured at construction;
/// a timeout surfaces to the caller as [`WopiError::Transport`].
#[derive(Debug, Clone)]
pub struct WopiClient {
    http: reqwest::Client,
}

impl WopiClient {
    pub fn new(timeout: Duration, skip_ssl_verify: bool) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(skip_ssl_verify)
            .build()
            .expect("static reqwest client configuration is always valid");
        Self { http }
    }

    fn authorized(&self, method: Method, url: &str, acctok: &str) -> reqwest::RequestBuilder {
        self.http.request(method, url).bearer_auth(acctok)
    }

    /// `GetFileInfo`: `GET <wopisrc>`.
    pub async fn get_file_info(&self, wopisrc: &str, acctok: &str) -> Result<FileMeta, WopiError> {
        let res = self
            .authorized(Method::GET, wopisrc, acctok)
            .send()
            .await?;
        let status = res.status();
        if status != StatusCode::OK {
            return Err(WopiError::UnexpectedStatus {
                verb: "GetFileInfo",
                status: status.as_u16(),
            });
        }
        Ok(res.json::<FileMeta>().await?)
    }

    /// `GetFile`: `GET <wopisrc>/contents`.
    pub async fn get_file(&self, wopisrc: &str, acctok: &str) -> Result<Bytes, WopiError> {
        let url = format!("{wopisrc}/contents");
        let res = self.authorized(Method::GET, &url, acctok).send().await?;
        let status = res.status();
        if status != StatusCode::OK {
            return Err(WopiError::UnexpectedStatus {
                verb: "GetFile",
                status: status.as_u16(),
            });
        }
        Ok(res.bytes().await?)
    }

    /// `GetLock`: ask storage whether a lock is currently held. A missing
    /// lock is reported as `InvalidLock { status: 404, .. }`.
    pub async fn get_lock(&self, wopisrc: &str, acctok: &str) -> Result<WopiLock, WopiError> {
        let res = self
            .authorized(Method::POST, wopisrc, acctok)
            .header(WOPI_OVERRIDE_HEADER, "GET_LOCK")
            .send()
            .await?;
        Self::lock_from_response(res).await
    }

    /// `Lock`: acquire a new lock, storing `lock` as its opaque payload.
    pub async fn lock(&self, wopisrc: &str, acctok: &str, lock: &WopiLock) -> Result<(), WopiError> {
        let res = self
            .authorized(Method::POST, wopisrc, acctok)
            .header(WOPI_OVERRIDE_HEADER, "LOCK")
            .header(WOPI_LOCK_HEADER, lock.to_wire())
            .send()
            .await?;
        Self::expect_ok("Lock", res).await.map(drop)
    }

    /// `Unlock`.
    pub async fn unlock(&self, wopisrc: &str, acctok: &str, lock: &WopiLock) -> Result<(), WopiError> {
        let res = self
            .authorized(Method::POST, wopisrc, acctok)
            .header(WOPI_OVERRIDE_HEADER, "UNLOCK")
            .header(WOPI_LOCK_HEADER, lock.to_wire())
            .send()
            .await?;
        Self::expect_ok("Unlock", res).await.map(drop)
    }

    /// `RefreshLock`, optionally overriding `digest` and/or `toclose` before
    /// the refreshed lock is pushed. Returns the lock as now stored, or
    /// `InvalidLock` if storage no longer agrees a lock is held.
    pub async fn refresh_lock(
        &self,
        wopisrc: &str,
        acctok: &str,
        lock: &WopiLock,
        overrides: LockOverrides,
    ) -> Result<WopiLock, WopiError> {
        let mut refreshed = lock.clone();
        if let Some(digest) = overrides.digest {
            refreshed.digest = digest;
        }
        if let Some(toclose) = overrides.toclose {
            refreshed.toclose = toclose;
        }
        let res = self
            .authorized(Method::POST, wopisrc, acctok)
            .header(WOPI_OVERRIDE_HEADER, "REFRESH_LOCK")
            .header(WOPI_LOCK_HEADER, refreshed.to_wire())
            .send()
            .await?;
        let status = res.status();
        if status != StatusCode::OK {
            let reason = res
                .headers()
                .get(LOCK_FAILURE_REASON_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            return Err(WopiError::InvalidLock {
                status: status.as_u16(),
                reason,
            });
        }
        Ok(refreshed)
    }

    /// `PutFile`: push new contents in place, carrying the current lock.
    pub async fn put_file(
        &self,
        wopisrc: &str,
        acctok: &str,
        lock: &WopiLock,
        contents: Bytes,
    ) -> Result<(), WopiError> {
        let url = format!("{wopisrc}/contents");
        let res = self
            .http
            .post(&url)
            .bearer_auth(acctok)
            .header(WOPI_LOCK_HEADER, lock.to_wire())
            .body(contents)
            .send()
            .await?;
        Self::expect_ok("PutFile", res).await.map(drop)
    }

    /// `PutRelativeFile`, used when the on-disk format changes (a bundle
    /// gains or loses its attachments on close).
    pub async fn save_as(
        &self,
        wopisrc: &str,
        acctok: &str,
        lock: &WopiLock,
        new_name: &str,
        contents: Bytes,
    ) -> Result<(), WopiError> {
        let res = self
            .authorized(Method::POST, wopisrc, acctok)
            .header(WOPI_OVERRIDE_HEADER, "PUT_RELATIVE")
            .header(SUGGESTED_TARGET_HEADER, new_name)
            .header(WOPI_LOCK_HEADER, lock.to_wire())
            .body(contents)
            .send()
            .await?;
        Self::expect_ok("PutRelativeFile", res).await.map(drop)
    }

    async fn lock_from_response(res: reqwest::Response) -> Result<WopiLock, WopiError> {
        let status = res.status();
        if status != StatusCode::OK {
            let reason = res
                .headers()
                .get(LOCK_FAILURE_REASON_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            return Err(WopiError::InvalidLock {
                status: status.as_u16(),
                reason,
            });
        }
        let header = res
            .headers()
            .get(WOPI_LOCK_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        match header {
            Some(s) if !s.is_empty() => WopiLock::from_wire(&s).map_err(|e| WopiError::InvalidLock {
                status: status.as_u16(),
                reason: Some(format!("malformed lock payload: {e}")),
            }),
            _ => Err(WopiError::InvalidLock {
                status: 404,
                reason: Some("no lock held".into()),
            }),
        }
    }

    async fn expect_ok(verb: &'static str, res: reqwest::Response) -> Result<reqwest::Response, WopiError> {
        let status = res.status();
        if status == StatusCode::OK {
            debug!(verb, "WOPI call succeeded");
            Ok(res)
        } else {
            Err(WopiError::UnexpectedStatus {
                verb,
                status: status.as_u16(),
            })
        }
    }
}

/// Body helper matching the original bridge's tiny JSON envelope for
/// user-facing messages (`{"message": "..."}`).
pub fn jsonify(msg: &str) -> String {
    serde_json::json!({ "message": msg }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonify_wraps_message() {
        let body = jsonify("hello");
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["message"], "hello");
    }
}
