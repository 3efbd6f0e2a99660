//! The bridge's four HTTP entry points: the info page, `/open`, `/save`,
//! and `/list`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use percent_encoding::percent_decode_str;
use tracing::{info, warn};
use wopi_client::{jsonify, short_token};

use crate::app::AppState;
use crate::docid::gen_docid;
use crate::error::RECOVER_MSG;

const WBVERSION: &str = env!("CARGO_PKG_VERSION");

fn gui_return(msg: &str) -> Html<String> {
    Html(format!(
        r#"<div align="center" style="color:#808080; padding-top:50px; font-family:Verdana">{msg}</div>"#
    ))
}

/// A coarse, three-letter platform tag derived from the client's
/// `User-Agent`, appended to `displayName` so concurrent sessions from the
/// same user on different devices are distinguishable in the app's UI.
/// Falls back to `"oth"` when the header is absent or unrecognized, same as
/// the original bridge falling back when the browser reports no platform
/// at all.
fn platform_prefix(user_agent: Option<&str>) -> &'static str {
    let Some(ua) = user_agent else { return "oth" };
    let ua = ua.to_ascii_lowercase();
    if ua.contains("windows") {
        "win"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "iph"
    } else if ua.contains("android") {
        "and"
    } else if ua.contains("mac os") || ua.contains("macintosh") {
        "mac"
    } else if ua.contains("linux") {
        "lin"
    } else {
        "oth"
    }
}

/// `GET /`, unprefixed: redirect into `APP_ROOT/`.
pub async fn redirect_to_root(State(state): State<Arc<AppState>>) -> Redirect {
    Redirect::temporary(&format!("{}/", state.config.app_root))
}

/// `GET {APP_ROOT}/`: static informational landing page.
pub async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    let extensions = crate::plugins::supported_extensions().join(", ");
    Html(format!(
        r#"<html><head><title>WOPI Bridge</title></head>
<body>
<div align="center" style="color:#000080; padding-top:50px; font-family:Verdana; size:11">
This is a WOPI HTTP bridge, to be used in conjunction with a WOPI-enabled EFSS.<br>
Supports: {extensions}.<br>
To use this service, please log in to your EFSS Storage and click on a supported document.</div>
<div style="position: absolute; bottom: 10px; left: 10px; width: 99%;"><hr>
<i>WOPI Bridge {WBVERSION}.</i></div>
</body>
</html>"#
    ))
}

#[derive(Debug, serde::Deserialize)]
pub struct OpenParams {
    #[serde(rename = "WOPISrc")]
    pub wopisrc: String,
    pub access_token: String,
}

/// `GET {APP_ROOT}/open`.
pub async fn open(State(state): State<Arc<AppState>>, Query(params): Query<OpenParams>, headers: HeaderMap) -> Response {
    let wopisrc = percent_decode_str(&params.wopisrc).decode_utf8_lossy().into_owned();
    let acctok = params.access_token;
    info!(token = short_token(&acctok), "open called");
    let platform = platform_prefix(headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok()));

    let mut filemd = match state.wopi.get_file_info(&wopisrc, &acctok).await {
        Ok(filemd) => filemd,
        Err(e) => {
            warn!(error = %e, "open: unable to fetch file WOPI metadata");
            return (StatusCode::NOT_FOUND, gui_return("Invalid WOPI context")).into_response();
        }
    };

    let ext = filemd.extension().to_ascii_lowercase();
    let Some(adapter_tag) = crate::plugins::adapter_tag_for_extension(&ext) else {
        warn!(filename = %filemd.file_name, "open: file type not supported");
        return (StatusCode::BAD_REQUEST, gui_return("File type not supported")).into_response();
    };
    let Some(adapter) = state.adapters.get(adapter_tag) else {
        return (StatusCode::BAD_REQUEST, gui_return("File type not supported")).into_response();
    };

    let wopilock = if filemd.user_can_write {
        match open_read_write(&state, &wopisrc, &acctok, &mut filemd, adapter.as_ref()).await {
            Ok(lock) => lock,
            Err(resp) => return resp,
        }
    } else {
        match adapter.load_from_storage(&filemd, &wopisrc, &acctok, None).await {
            Ok(lock) => lock,
            Err(e) => {
                warn!(error = %e, "open: unable to load the app");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    gui_return("Unable to load the app, please try again later or contact support"),
                )
                    .into_response();
            }
        }
    };

    let display_name = format!("{}@{}", filemd.user_friendly_name, platform);
    let display_name = urlencoding::encode(&display_name);
    let redirect_url = match adapter
        .get_redirect_url(filemd.user_can_write, &wopisrc, &acctok, &wopilock, &display_name)
        .await
    {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "open: unable to compute redirect url");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                gui_return("Unable to load the app, please try again later or contact support"),
            )
                .into_response();
        }
    };
    info!(redirecturl = %redirect_url, "redirecting client to the app");
    Redirect::found(&redirect_url).into_response()
}

async fn open_read_write(
    state: &AppState,
    wopisrc: &str,
    acctok: &str,
    filemd: &mut wopi_client::FileMeta,
    adapter: &dyn wopi_adapters::AppAdapter,
) -> Result<wopi_client::WopiLock, Response> {
    // `getlock` and, if it succeeds, `refreshlock` (to add this participant)
    // are treated as a single step: any failure from either one falls
    // through to the same "acquire the lock from scratch" path below,
    // exactly as the original bridge catches both under one `except
    // wopi.InvalidLock`.
    let wopilock = match reuse_existing_lock(state, wopisrc, acctok).await {
        Ok(lock) => lock,
        Err(e) => {
            if !e.is_missing_lock() {
                // A conflicting/invalid lock, as opposed to no lock yet:
                // force read-only, but still try to fetch and (re)lock below,
                // exactly as for the first user opening the file.
                info!(error = %e, "open: invalid lock, forcing read-only mode");
                filemd.user_can_write = false;
            }
            let docid = gen_docid(&state.config.hash_secret, wopisrc);
            match adapter.load_from_storage(filemd, wopisrc, acctok, Some(docid)).await {
                Ok(lock) => {
                    if let Err(e) = state.wopi.lock(wopisrc, acctok, &lock).await {
                        warn!(error = %e, "open: failed to lock the file, forcing read-only mode");
                        filemd.user_can_write = false;
                    }
                    lock
                }
                Err(e) => {
                    warn!(error = %e, "open: unable to load the app");
                    return Err((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        gui_return("Unable to load the app, please try again later or contact support"),
                    )
                        .into_response());
                }
            }
        }
    };

    // This function is only called while `UserCanWrite` was true on entry;
    // the registry bookkeeping tracks that original decision to open for
    // writing, independent of any later forced-read-only fallback above.
    state
        .registry
        .upsert_on_open(
            wopisrc,
            acctok,
            &wopilock.docid,
            wopilock.toclose.clone(),
            state.config.save_interval.as_secs(),
        )
        .await;
    Ok(wopilock)
}

/// Fetch the currently-held lock and, if this participant isn't in its
/// close-map yet, add it via `refreshLock`. Fails with the `getLock` or
/// `refreshLock` error, whichever happened.
async fn reuse_existing_lock(
    state: &AppState,
    wopisrc: &str,
    acctok: &str,
) -> Result<wopi_client::WopiLock, wopi_client::WopiError> {
    let lock = state.wopi.get_lock(wopisrc, acctok).await?;
    info!(token = short_token(acctok), "lock already held");
    if lock.toclose.contains_key(short_token(acctok)) {
        return Ok(lock);
    }
    let mut toclose = lock.toclose.clone();
    toclose.insert(short_token(acctok).to_string(), false);
    state
        .wopi
        .refresh_lock(
            wopisrc,
            acctok,
            &lock,
            wopi_client::LockOverrides {
                digest: None,
                toclose: Some(toclose),
            },
        )
        .await
}

#[derive(Debug, serde::Deserialize)]
pub struct SaveParams {
    #[serde(default)]
    pub close: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

/// `POST {APP_ROOT}/save`.
pub async fn save(State(state): State<Arc<AppState>>, headers: HeaderMap, Query(params): Query<SaveParams>) -> Response {
    let meta = match headers.get("X-EFSS-Metadata").and_then(|v| v.to_str().ok()) {
        Some(meta) => percent_decode_str(meta).decode_utf8_lossy().into_owned(),
        None => {
            warn!("save: malformed or missing metadata");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                jsonify(&format!("Malformed or missing metadata, could not save. {RECOVER_MSG}")),
            )
                .into_response();
        }
    };
    let Some(idx) = meta.find("?t=") else {
        warn!("save: malformed metadata, missing token marker");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            jsonify(&format!("Malformed or missing metadata, could not save. {RECOVER_MSG}")),
        )
            .into_response();
    };
    let wopisrc = meta[..idx].to_string();
    let acctok = meta[idx + 3..].to_string();
    let isclose = params.close.as_deref() == Some("true");
    let shorttok = short_token(&acctok).to_string();

    info!(isclose, docid = ?params.id, wopisrc = %wopisrc, token = %shorttok, "save: requested action");

    state
        .registry
        .mark_save(&wopisrc, &acctok, &shorttok, isclose, params.id.as_deref(), state.config.save_interval.as_secs())
        .await;

    if let Some(resp) = state.registry.take_save_response(&wopisrc).await {
        info!(status = resp.status, token = %shorttok, "save: returned response");
        return (StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK), resp.body).into_response();
    }
    info!(token = %shorttok, "save: enqueued action");
    (StatusCode::ACCEPTED, "{}".to_string()).into_response()
}

/// `GET {APP_ROOT}/list`.
pub async fn list(State(state): State<Arc<AppState>>, headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    let bearer_ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", state.config.hash_secret))
        .unwrap_or(false);
    let apikey_ok = params.get("apikey").map(|v| v == &state.config.hash_secret).unwrap_or(false);
    if !bearer_ok && !apikey_ok {
        warn!("list: unauthorized access attempt");
        return (StatusCode::UNAUTHORIZED, gui_return("Client not authorized")).into_response();
    }
    info!("list: returning list of open files");
    axum::Json(state.registry.dump_json().await).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_prefix_recognizes_common_user_agents() {
        assert_eq!(platform_prefix(Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64)")), "win");
        assert_eq!(platform_prefix(Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)")), "iph");
        assert_eq!(platform_prefix(Some("Mozilla/5.0 (Linux; Android 14)")), "and");
        assert_eq!(platform_prefix(Some("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15)")), "mac");
        assert_eq!(platform_prefix(Some("Mozilla/5.0 (X11; Linux x86_64)")), "lin");
    }

    #[test]
    fn platform_prefix_falls_back_to_oth() {
        assert_eq!(platform_prefix(None), "oth");
        assert_eq!(platform_prefix(Some("curl/8.0")), "oth");
    }
}
