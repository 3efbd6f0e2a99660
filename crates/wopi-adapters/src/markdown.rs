//! The Markdown adapter: a CodiMD-style collaborative editor, including
//! bundle (`.zmd`) handling for documents with attachments.

use std::io::{Cursor, Read, Write};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::StatusCode;
use regex::Regex;
use sha1::{Digest, Sha1};
use tracing::{debug, error, warn};
use wopi_client::{short_token, FileMeta, WopiClient, WopiLock, DIRTY_DIGEST};

use crate::adapter::AppAdapter;
use crate::error::AdapterError;

fn upload_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/uploads/upload_[0-9a-fA-F]{32}\.\w+").expect("static regex"))
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn is_bundle(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.eq_ignore_ascii_case("zmd"))
        .unwrap_or(false)
}

fn is_slides(doc: &[u8]) -> bool {
    doc.starts_with(b"---\ntitle") || doc.starts_with(b"---\ntype") || doc.starts_with(b"---\nslideOptions")
}

fn swap_bundle_extension(filename: &str, wants_bundle: bool) -> String {
    let stem = filename
        .strip_suffix(".zmd")
        .or_else(|| filename.strip_suffix(".md"))
        .unwrap_or(filename);
    format!("{stem}{}", if wants_bundle { ".zmd" } else { ".md" })
}

fn rename_with_random_letter(name: &str) -> String {
    let letter = (b'A' + rand::thread_rng().gen_range(0..26u8)) as char;
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{letter}.{ext}"),
        None => format!("{name}_{letter}"),
    }
}

fn location_last_segment(res: &reqwest::Response) -> Option<String> {
    res.headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|loc| loc.split('?').next())
        .and_then(|path| path.rsplit('/').next())
        .map(str::to_owned)
}

fn net_err(e: reqwest::Error) -> AdapterError {
    AdapterError::AppFailure(format!("connection error: {e}"))
}

/// A CodiMD-compatible collaborative Markdown/slides editor adapter.
pub struct MarkdownAdapter {
    wopi: Arc<WopiClient>,
    http: reqwest::Client,
    /// Internal base URL (trailing slash included), used for server-to-server calls.
    app_url: String,
    /// Browser-facing base URL (trailing slash included).
    app_ext_url: String,
    apikey: String,
}

impl MarkdownAdapter {
    pub fn new(
        wopi: Arc<WopiClient>,
        http: reqwest::Client,
        app_url: impl Into<String>,
        app_ext_url: impl Into<String>,
        apikey: impl Into<String>,
    ) -> Self {
        let norm = |mut u: String| {
            if !u.ends_with('/') {
                u.push('/');
            }
            u
        };
        Self {
            wopi,
            http,
            app_url: norm(app_url.into()),
            app_ext_url: norm(app_ext_url.into()),
            apikey: apikey.into(),
        }
    }

    async fn unzip_attachments(&self, input: &[u8]) -> Result<Bytes, AdapterError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(input))
            .map_err(|e| AdapterError::AppFailure(format!("invalid bundle: {e}")))?;
        let mut mddoc: Option<Vec<u8>> = None;
        let mut attachments: Vec<(String, Vec<u8>)> = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| AdapterError::AppFailure(format!("invalid bundle entry: {e}")))?;
            let name = entry.name().to_string();
            debug!(name, "extracting bundle entry");
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut buf)
                .map_err(|e| AdapterError::AppFailure(format!("invalid bundle entry: {e}")))?;
            if name.rsplit_once('.').map(|(_, e)| e == "md").unwrap_or(false) {
                mddoc = Some(buf);
            } else {
                attachments.push((name, buf));
            }
        }
        let mut mddoc = mddoc.ok_or_else(|| AdapterError::AppFailure("bundle has no markdown entry".into()))?;

        for (name, bytes) in attachments {
            let head = self
                .http
                .head(format!("{}uploads/{}", self.app_url, name))
                .send()
                .await;
            let mut target_name = name.clone();
            let skip = match &head {
                Ok(res) if res.status() == StatusCode::OK => {
                    let existing_len = res
                        .headers()
                        .get(CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<usize>().ok());
                    if existing_len == Some(bytes.len()) {
                        debug!(filename = %name, "skipped existing attachment");
                        true
                    } else {
                        warn!(filename = %name, "attachment collision detected");
                        let renamed = rename_with_random_letter(&name);
                        mddoc = replace_all(&mddoc, name.as_bytes(), renamed.as_bytes());
                        target_name = renamed;
                        false
                    }
                }
                _ => false,
            };
            if skip {
                continue;
            }
            debug!(filename = %target_name, "pushing attachment");
            let part = reqwest::multipart::Part::bytes(bytes).file_name(target_name.clone());
            let form = reqwest::multipart::Form::new().part("image", part);
            match self
                .http
                .post(format!("{}uploadimage", self.app_url))
                .query(&[("generateFilename", "false")])
                .multipart(form)
                .send()
                .await
            {
                Ok(res) if res.status() == StatusCode::OK => {}
                Ok(res) => error!(filename = %target_name, status = %res.status(), "failed to push attachment"),
                Err(e) => error!(filename = %target_name, error = %e, "failed to push attachment"),
            }
        }
        Ok(Bytes::from(mddoc))
    }

    async fn push_readonly(&self, mddoc: &[u8]) -> Result<String, AdapterError> {
        let res = self
            .http
            .post(format!("{}new", self.app_url))
            .query(&[("mode", "locked")])
            .header(CONTENT_TYPE, "text/markdown")
            .body(mddoc.to_vec())
            .send()
            .await
            .map_err(net_err)?;
        if res.status() != StatusCode::FOUND {
            return Err(AdapterError::AppFailure(format!(
                "unable to push read-only document (status {})",
                res.status()
            )));
        }
        location_last_segment(&res).ok_or_else(|| AdapterError::AppFailure("missing Location header".into()))
    }

    async fn push_readwrite(&self, mddoc: &[u8], docid: &str, acctok: &str) -> Result<String, AdapterError> {
        let head = self
            .http
            .head(format!("{}{}", self.app_url, docid))
            .query(&[("apiKey", self.apikey.as_str())])
            .send()
            .await
            .map_err(net_err)?;
        let docid = match head.status() {
            StatusCode::OK => docid.to_string(),
            StatusCode::FOUND => location_last_segment(&head)
                .ok_or_else(|| AdapterError::AppFailure("missing Location header".into()))?,
            other => {
                return Err(AdapterError::AppFailure(format!(
                    "unable to reserve docid (status {other})"
                )))
            }
        };
        let put = self
            .http
            .put(format!("{}api/notes/{}", self.app_url, docid))
            .query(&[("apiKey", self.apikey.as_str())])
            .json(&serde_json::json!({ "content": String::from_utf8_lossy(mddoc) }))
            .send()
            .await
            .map_err(net_err)?;
        match put.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => {
                warn!(token = short_token(acctok), "document being edited elsewhere, tolerated");
            }
            other => {
                return Err(AdapterError::AppFailure(format!(
                    "unable to push document (status {other})"
                )))
            }
        }
        Ok(docid)
    }

    async fn fetch_from_app(&self, docid: &str, acctok: &str) -> Result<Bytes, AdapterError> {
        let res = self
            .http
            .get(format!("{}{}/download", self.app_url, docid))
            .send()
            .await
            .map_err(net_err)?;
        if res.status() != StatusCode::OK {
            return Err(AdapterError::AppFailure(format!(
                "unable to fetch document from app (status {})",
                res.status()
            )));
        }
        res.bytes().await.map_err(net_err)
    }

    /// Scan `mddoc` for attachment references and re-assemble a bundle.
    /// Returns `(Some(zip_bytes), attachment_error)` when a bundle was
    /// produced, or `(None, attachment_error)` when `force_zip` is false and
    /// no attachment references were found.
    async fn get_attachments(
        &self,
        mddoc: &[u8],
        doc_filename: &str,
        force_zip: bool,
    ) -> (Option<Bytes>, Option<(String, u16)>) {
        let text = String::from_utf8_lossy(mddoc);
        let mut att_response = None;
        let mut buf = Vec::new();
        let mut any_attachment = false;
        {
            let mut writer = zip::ZipWriter::new(Cursor::new(&mut buf));
            let options: zip::write::FileOptions<()> =
                zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for m in upload_pattern().find_iter(&text) {
                let path = m.as_str();
                let name = path.rsplit('/').next().unwrap_or(path);
                debug!(url = path, "fetching attachment");
                match self.http.get(format!("{}{}", self.app_url.trim_end_matches('/'), path)).send().await {
                    Ok(res) if res.status() == StatusCode::OK => match res.bytes().await {
                        Ok(bytes) => {
                            any_attachment = true;
                            let _ = writer.start_file(name, options);
                            let _ = writer.write_all(&bytes);
                        }
                        Err(e) => {
                            error!(path, error = %e, "failed to read attachment body");
                            att_response = Some((
                                wopi_client::jsonify("Failed to include a referenced picture in the saved file"),
                                404,
                            ));
                        }
                    },
                    Ok(res) => {
                        error!(path, status = %res.status(), "failed to fetch included file, skipping");
                        att_response = Some((
                            wopi_client::jsonify("Failed to include a referenced picture in the saved file"),
                            404,
                        ));
                    }
                    Err(e) => {
                        error!(path, error = %e, "failed to fetch included file, skipping");
                        att_response = Some((
                            wopi_client::jsonify("Failed to include a referenced picture in the saved file"),
                            404,
                        ));
                    }
                }
            }
            if !force_zip && !any_attachment {
                let _ = writer.finish();
                return (None, att_response);
            }
            let _ = writer.start_file(doc_filename, options);
            let _ = writer.write_all(mddoc);
            let _ = writer.finish();
        }
        (Some(Bytes::from(buf)), att_response)
    }
}

fn replace_all(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }
    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

#[async_trait]
impl AppAdapter for MarkdownAdapter {
    fn tag(&self) -> &'static str {
        "md"
    }

    async fn load_from_storage(
        &self,
        filemd: &FileMeta,
        wopisrc: &str,
        acctok: &str,
        docid: Option<String>,
    ) -> Result<WopiLock, AdapterError> {
        let mdfile = self.wopi.get_file(wopisrc, acctok).await?;
        let was_bundle = is_bundle(&filemd.base_file_name);
        let mddoc = if was_bundle {
            self.unzip_attachments(&mdfile).await?
        } else {
            mdfile
        };

        let digest = sha1_hex(&mddoc);
        let docid = match docid {
            None => self.push_readonly(&mddoc).await?,
            Some(d) => self.push_readwrite(&mddoc, &d, acctok).await?,
        };
        let app_tag = if is_slides(&mddoc) { "mds" } else { "md" };
        Ok(WopiLock::new(
            docid,
            filemd.base_file_name.clone(),
            digest,
            app_tag,
            short_token(acctok),
            false,
        ))
    }

    async fn save_to_storage(
        &self,
        wopisrc: &str,
        acctok: &str,
        isclose: bool,
        lock: &WopiLock,
    ) -> Result<(String, u16), AdapterError> {
        let mddoc = match self.fetch_from_app(&lock.docid, acctok).await {
            Ok(b) => b,
            Err(e) => {
                error!(token = short_token(acctok), error = %e, "failed to fetch document from app");
                return Ok((
                    wopi_client::jsonify("Could not save file, failed to fetch document from the app"),
                    500,
                ));
            }
        };

        if isclose && !lock.is_dirty() {
            let digest = sha1_hex(&mddoc);
            if digest == lock.digest {
                debug!(token = short_token(acctok), "file unchanged, skipping save");
                return Ok(("{}".to_string(), 202));
            }
        }

        let was_bundle = is_bundle(&lock.filename);
        let force_zip = was_bundle && !isclose;
        let bundle_filename = lock.filename.replace(".zmd", ".md");
        let (bundle, att_response) = self.get_attachments(&mddoc, &bundle_filename, force_zip).await;
        let has_attachments = bundle.is_some();

        if (was_bundle ^ !has_attachments) || !isclose {
            let body: Bytes = if was_bundle {
                bundle.clone().unwrap_or_else(|| mddoc.clone())
            } else {
                mddoc.clone()
            };
            self.wopi.put_file(wopisrc, acctok, lock, body).await?;
            let new_digest = if isclose {
                sha1_hex(&mddoc)
            } else {
                DIRTY_DIGEST.to_string()
            };
            self.wopi
                .refresh_lock(
                    wopisrc,
                    acctok,
                    lock,
                    wopi_client::LockOverrides {
                        digest: Some(new_digest),
                        toclose: None,
                    },
                )
                .await?;
            debug!(filename = %lock.filename, isclose, token = short_token(acctok), "save completed");
            return Ok(att_response.unwrap_or_else(|| (wopi_client::jsonify("File saved successfully"), 200)));
        }

        // On close with a format switch: saveAs the new filename.
        let new_filename = swap_bundle_extension(&lock.filename, has_attachments);
        let new_body = bundle.unwrap_or(mddoc);
        self.wopi
            .save_as(wopisrc, acctok, lock, &new_filename, new_body)
            .await?;
        Ok((wopi_client::jsonify("File saved successfully"), 200))
    }

    async fn get_redirect_url(
        &self,
        is_read_write: bool,
        wopisrc: &str,
        acctok: &str,
        lock: &WopiLock,
        display_name: &str,
    ) -> Result<String, AdapterError> {
        if is_read_write {
            let metadata = urlencoding::encode(&format!("{wopisrc}?t={acctok}")).into_owned();
            return Ok(format!(
                "{}{}?metadata={}&apiKey={}&displayName={}",
                self.app_ext_url, lock.docid, metadata, self.apikey, display_name
            ));
        }
        let suffix = if lock.app != "mds" { "/publish" } else { "" };
        let res = self
            .http
            .head(format!("{}{}{}", self.app_url, lock.docid, suffix))
            .query(&[("apiKey", self.apikey.as_str())])
            .send()
            .await
            .map_err(net_err)?;
        if res.status() == StatusCode::FOUND {
            if let Some(slug) = location_last_segment(&res) {
                return Ok(format!("{}s/{}", self.app_ext_url, slug));
            }
        }
        Ok(format!(
            "{}{}{}?apiKey={}",
            self.app_ext_url, lock.docid, suffix, self.apikey
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_extension_detection() {
        assert!(is_bundle("doc.zmd"));
        assert!(!is_bundle("doc.md"));
        assert!(!is_bundle("doc"));
    }

    #[test]
    fn slide_prefixes_are_recognized() {
        assert!(is_slides(b"---\ntitle: hi\n---\n"));
        assert!(is_slides(b"---\ntype: slide\n"));
        assert!(is_slides(b"---\nslideOptions:\n  theme: white\n"));
        assert!(!is_slides(b"# Just a heading\n"));
    }

    #[test]
    fn swap_extension_round_trips() {
        assert_eq!(swap_bundle_extension("report.zmd", false), "report.md");
        assert_eq!(swap_bundle_extension("report.md", true), "report.zmd");
    }

    #[test]
    fn replace_all_rewrites_every_occurrence() {
        let haystack = b"see img.png and img.png again";
        let out = replace_all(haystack, b"img.png", b"img_A.png");
        assert_eq!(out, b"see img_A.png and img_A.png again");
    }

    #[test]
    fn upload_regex_matches_hashed_attachment_paths() {
        let text = "![x](/uploads/upload_0123456789abcdef0123456789abcdef.png)";
        let found: Vec<_> = upload_pattern().find_iter(text).map(|m| m.as_str()).collect();
        assert_eq!(found, vec!["/uploads/upload_0123456789abcdef0123456789abcdef.png"]);
    }

    #[test]
    fn renamed_attachment_keeps_extension() {
        let renamed = rename_with_random_letter("img.png");
        assert!(renamed.starts_with("img_"));
        assert!(renamed.ends_with(".png"));
    }
}
