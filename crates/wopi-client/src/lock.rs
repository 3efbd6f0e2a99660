//! The WOPI lock: opaque to storage, structured for us.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sentinel `digest` value meaning "content changed since the last known
/// hash, recompute before comparing".
pub const DIRTY_DIGEST: &str = "dirty";

/// The bridge's soft state, persisted as JSON inside the WOPI lock string so
/// that it survives a bridge restart (storage treats it as opaque bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WopiLock {
    /// App-side document identifier.
    pub docid: String,
    /// Storage-side base file name; its extension tells us the bundle format.
    pub filename: String,
    /// Hex SHA-1 of the last-known content, or [`DIRTY_DIGEST`].
    pub digest: String,
    /// Short tag identifying the adapter that owns this document (`md`, `mds`, ...).
    pub app: String,
    /// `shorttok -> "has this participant signalled close"`.
    pub toclose: HashMap<String, bool>,
}

impl WopiLock {
    /// Build a lock for a single known participant, as produced by
    /// `loadFromStorage`/relock paths.
    pub fn new(
        docid: impl Into<String>,
        filename: impl Into<String>,
        digest: impl Into<String>,
        app: impl Into<String>,
        short_tok: impl Into<String>,
        isclose: bool,
    ) -> Self {
        let mut toclose = HashMap::new();
        toclose.insert(short_tok.into(), isclose);
        Self {
            docid: docid.into(),
            filename: filename.into(),
            digest: digest.into(),
            app: app.into(),
            toclose,
        }
    }

    /// Parse a lock from the JSON string stored in the `X-WOPI-Lock` header.
    pub fn from_wire(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Serialize for the `X-WOPI-Lock` header.
    pub fn to_wire(&self) -> String {
        // A lock is always a well-formed, small struct; this cannot fail.
        serde_json::to_string(self).expect("WopiLock always serializes")
    }

    pub fn is_dirty(&self) -> bool {
        self.digest == DIRTY_DIGEST
    }

    /// AND over all known participants: everyone has signalled close.
    pub fn all_closed(&self) -> bool {
        !self.toclose.is_empty() && self.toclose.values().all(|&v| v)
    }

    /// OR over all known participants: at least one has signalled close.
    pub fn any_closed(&self) -> bool {
        self.toclose.values().any(|&v| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_format() {
        let lock = WopiLock::new("doc1", "report.md", "abc123", "md", "tok1", false);
        let wire = lock.to_wire();
        let back = WopiLock::from_wire(&wire).unwrap();
        assert_eq!(lock, back);
    }

    #[test]
    fn all_closed_requires_nonempty_and_unanimous() {
        let mut lock = WopiLock::new("doc1", "a.md", DIRTY_DIGEST, "md", "t1", true);
        assert!(lock.all_closed());
        lock.toclose.insert("t2".into(), false);
        assert!(!lock.all_closed());
        assert!(lock.any_closed());
    }

    #[test]
    fn empty_toclose_is_not_all_closed() {
        let lock = WopiLock {
            docid: "d".into(),
            filename: "a.md".into(),
            digest: DIRTY_DIGEST.into(),
            app: "md".into(),
            toclose: HashMap::new(),
        };
        assert!(!lock.all_closed());
        assert!(!lock.any_closed());
    }
}
