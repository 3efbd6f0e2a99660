//! The open-files registry and the save-response map: the bridge's only
//! shared mutable state, guarded by one mutex and woken through one
//! [`tokio::sync::Notify`] (the async equivalent of a condition variable,
//! since the coordinator awaits HTTP calls while holding the lock's data).

use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Notify};

/// Per-document bookkeeping the coordinator and the HTTP handlers share.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub acctok: String,
    pub docid: String,
    pub tosave: bool,
    pub lastsave: u64,
    /// `shorttok -> has this participant signalled close`. Never empty for
    /// a live record.
    pub toclose: HashMap<String, bool>,
}

impl OpenFile {
    pub fn all_closed(&self) -> bool {
        !self.toclose.is_empty() && self.toclose.values().all(|&v| v)
    }

    pub fn any_closed(&self) -> bool {
        self.toclose.values().any(|&v| v)
    }
}

/// A deferred save result, consumed (removed) the first time it is read.
#[derive(Debug, Clone)]
pub struct SaveResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Default)]
struct Shared {
    open_files: HashMap<String, OpenFile>,
    save_responses: HashMap<String, SaveResponse>,
    active: bool,
}

/// The registry, the save-response map, and the notify channel that wakes
/// the save coordinator, bundled behind one lock.
pub struct Registry {
    state: Mutex<Shared>,
    notify: Notify,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Shared {
                open_files: HashMap::new(),
                save_responses: HashMap::new(),
                active: true,
            }),
            notify: Notify::new(),
        }
    }

    /// Current Unix time in seconds, used for `lastsave` bookkeeping.
    pub fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is after the epoch")
            .as_secs()
    }

    pub async fn upsert_on_open(&self, wopisrc: &str, acctok: &str, docid: &str, toclose: HashMap<String, bool>, save_interval_secs: u64) {
        let mut s = self.state.lock().await;
        if let Some(record) = s.open_files.get_mut(wopisrc) {
            record.acctok = acctok.to_string();
            record.toclose = toclose;
        } else {
            s.open_files.insert(
                wopisrc.to_string(),
                OpenFile {
                    acctok: acctok.to_string(),
                    docid: docid.to_string(),
                    tosave: false,
                    lastsave: Self::now_secs().saturating_sub(save_interval_secs),
                    toclose,
                },
            );
        }
        s.save_responses.remove(wopisrc);
    }

    /// Mark `shorttok`'s intent to save/close for `wopisrc`. Returns whether
    /// the coordinator should be woken immediately.
    pub async fn mark_save(&self, wopisrc: &str, acctok: &str, shorttok: &str, isclose: bool, docid: Option<&str>, save_interval_secs: u64) -> bool {
        let mut s = self.state.lock().await;
        let now = Self::now_secs();
        let donotify = isclose
            || !s.open_files.contains_key(wopisrc)
            || s.open_files[wopisrc].lastsave < now.saturating_sub(save_interval_secs);

        if let Some(record) = s.open_files.get_mut(wopisrc) {
            record.tosave = true;
            record.toclose.insert(shorttok.to_string(), isclose);
        } else {
            let mut toclose = HashMap::new();
            toclose.insert(shorttok.to_string(), isclose);
            s.open_files.insert(
                wopisrc.to_string(),
                OpenFile {
                    acctok: acctok.to_string(),
                    docid: docid.unwrap_or_default().to_string(),
                    tosave: true,
                    lastsave: now.saturating_sub(save_interval_secs),
                    toclose,
                },
            );
            s.save_responses.remove(wopisrc);
        }

        if donotify {
            self.notify.notify_one();
        }
        donotify
    }

    pub async fn take_save_response(&self, wopisrc: &str) -> Option<SaveResponse> {
        self.state.lock().await.save_responses.remove(wopisrc)
    }

    pub async fn set_save_response(&self, wopisrc: &str, status: u16, body: String) {
        self.state.lock().await.save_responses.insert(wopisrc.to_string(), SaveResponse { status, body });
    }

    pub async fn snapshot_keys(&self) -> Vec<String> {
        self.state.lock().await.open_files.keys().cloned().collect()
    }

    pub async fn get(&self, wopisrc: &str) -> Option<OpenFile> {
        self.state.lock().await.open_files.get(wopisrc).cloned()
    }

    pub async fn update<F>(&self, wopisrc: &str, f: F)
    where
        F: FnOnce(&mut OpenFile),
    {
        let mut s = self.state.lock().await;
        if let Some(record) = s.open_files.get_mut(wopisrc) {
            f(record);
        }
    }

    pub async fn remove(&self, wopisrc: &str) {
        self.state.lock().await.open_files.remove(wopisrc);
    }

    pub async fn dump_json(&self) -> serde_json::Value {
        let s = self.state.lock().await;
        let map: serde_json::Map<String, serde_json::Value> = s
            .open_files
            .iter()
            .map(|(wopisrc, f)| {
                (
                    wopisrc.clone(),
                    serde_json::json!({
                        "acctok": f.acctok,
                        "docid": f.docid,
                        "tosave": f.tosave,
                        "lastsave": f.lastsave,
                        "toclose": f.toclose,
                    }),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    /// Flip the shutdown flag and wake the coordinator so it observes it on
    /// its next wait.
    pub async fn shutdown(&self) {
        self.state.lock().await.active = false;
        self.notify.notify_one();
    }

    /// Block until either `timeout` elapses or the coordinator is notified.
    pub async fn wait(&self, timeout: std::time::Duration) {
        let deadline = Instant::now() + timeout;
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep_until(deadline.into()) => {}
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_creates_then_reuses_record() {
        let reg = Registry::new();
        let mut toclose = HashMap::new();
        toclose.insert("tok1".to_string(), false);
        reg.upsert_on_open("W", "acctokA", "doc1", toclose.clone(), 200).await;
        let rec = reg.get("W").await.unwrap();
        assert_eq!(rec.docid, "doc1");
        assert!(!rec.all_closed());

        let mut toclose2 = HashMap::new();
        toclose2.insert("tok2".to_string(), false);
        reg.upsert_on_open("W", "acctokB", "doc1", toclose2, 200).await;
        let rec = reg.get("W").await.unwrap();
        assert_eq!(rec.acctok, "acctokB");
        assert!(rec.toclose.contains_key("tok2"));
    }

    #[tokio::test]
    async fn mark_save_notifies_immediately_on_close() {
        let reg = Registry::new();
        let mut toclose = HashMap::new();
        toclose.insert("tok1".to_string(), false);
        reg.upsert_on_open("W", "acctokA", "doc1", toclose, 200).await;
        let donotify = reg.mark_save("W", "acctokA", "tok1", true, None, 200).await;
        assert!(donotify);
        let rec = reg.get("W").await.unwrap();
        assert!(rec.tosave);
        assert!(rec.all_closed());
    }

    #[tokio::test]
    async fn mark_save_repopulates_missing_record() {
        let reg = Registry::new();
        let donotify = reg.mark_save("W2", "acctokC", "tok3", false, Some("doc2"), 200).await;
        assert!(donotify, "a brand-new record should notify");
        let rec = reg.get("W2").await.unwrap();
        assert_eq!(rec.docid, "doc2");
        assert!(rec.tosave);
    }

    #[tokio::test]
    async fn save_response_is_consumed_on_read() {
        let reg = Registry::new();
        reg.set_save_response("W", 200, "{}".to_string()).await;
        assert!(reg.take_save_response("W").await.is_some());
        assert!(reg.take_save_response("W").await.is_none());
    }
}
