//! Deterministic app-side document id derived from a WOPI source URL.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// `urlsafe-base64(HMAC-SHA1(secret, last-path-segment(wopisrc)))` with
/// trailing `=` padding stripped. Depends only on `secret` and the last
/// path segment of `wopisrc`.
pub fn gen_docid(secret: &str, wopisrc: &str) -> String {
    let last_segment = wopisrc.rsplit('/').next().unwrap_or(wopisrc);
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(last_segment.as_bytes());
    let digest = mac.finalize().into_bytes();
    URL_SAFE.encode(digest).trim_end_matches('=').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_secret_and_segment() {
        let a = gen_docid("secret", "https://efss.example/files/abc123");
        let b = gen_docid("secret", "https://other.example/path/to/abc123");
        assert_eq!(a, b, "only the last path segment should matter");
    }

    #[test]
    fn different_secrets_diverge() {
        let a = gen_docid("secret-one", "https://efss.example/files/abc123");
        let b = gen_docid("secret-two", "https://efss.example/files/abc123");
        assert_ne!(a, b);
    }

    #[test]
    fn has_no_padding() {
        let id = gen_docid("s", "wopisrc/x");
        assert!(!id.contains('='));
    }
}
