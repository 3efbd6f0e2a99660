//! The background save coordinator: the only task that unlocks and removes
//! registry entries, and the only task that retries a save left pending by
//! an HTTP handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use wopi_adapters::AppAdapter;
use wopi_client::{jsonify, LockOverrides, WopiClient, WopiLock};

use crate::config::BridgeConfig;
use crate::docid::gen_docid;
use crate::registry::{OpenFile, Registry};

const COORDINATOR_WAIT: Duration = Duration::from_secs(60);
const FORCE_CLOSE_MULTIPLIER: u64 = 4;

/// Owns the background loop; `run` is spawned once at startup and exits
/// when the registry's shutdown flag is observed.
pub struct SaveCoordinator {
    registry: Arc<Registry>,
    wopi: Arc<WopiClient>,
    adapters: Arc<HashMap<String, Arc<dyn AppAdapter>>>,
    config: Arc<BridgeConfig>,
}

impl SaveCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        wopi: Arc<WopiClient>,
        adapters: Arc<HashMap<String, Arc<dyn AppAdapter>>>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        Self {
            registry,
            wopi,
            adapters,
            config,
        }
    }

    pub async fn run(self) {
        info!("save coordinator starting");
        loop {
            self.registry.wait(COORDINATOR_WAIT).await;
            if !self.registry.is_active().await {
                break;
            }
            for wopisrc in self.registry.snapshot_keys().await {
                if let Err(e) = self.run_cycle(&wopisrc).await {
                    error!(wopisrc, error = %e, "unexpected exception in save coordinator cycle");
                }
            }
        }
        info!("save coordinator terminated, shutting down");
    }

    /// Re-fetches the record between phases rather than threading one
    /// snapshot through all three: `save_dirty` writes `lastsave`/`tosave`
    /// back to the registry, and `close_when_idle` writes `toclose` on a
    /// force-close, so each later phase must observe what the previous one
    /// actually left behind, not the values the cycle started with.
    async fn run_cycle(&self, wopisrc: &str) -> Result<(), String> {
        let Some(openfile) = self.registry.get(wopisrc).await else {
            return Ok(());
        };
        let lock = self.save_dirty(wopisrc, &openfile).await;

        let Some(openfile) = self.registry.get(wopisrc).await else {
            return Ok(());
        };
        let lock = self.close_when_idle(wopisrc, &openfile, lock).await;

        let Some(openfile) = self.registry.get(wopisrc).await else {
            return Ok(());
        };
        self.cleanup(wopisrc, &openfile, lock).await;
        Ok(())
    }

    /// Phase (a): flush documents dirty long enough, or whose participants
    /// have all signalled close.
    async fn save_dirty(&self, wopisrc: &str, openfile: &OpenFile) -> Option<WopiLock> {
        let now = Registry::now_secs();
        let due = openfile.lastsave < now.saturating_sub(self.config.save_interval.as_secs());
        if !(openfile.tosave && (openfile.all_closed() || due)) {
            return None;
        }

        let lock = match self.wopi.get_lock(wopisrc, &openfile.acctok).await {
            Ok(lock) => lock,
            Err(e @ wopi_client::WopiError::InvalidLock { .. }) => {
                debug!(token = wopi_client::short_token(&openfile.acctok), docid = %openfile.docid, error = %e, "attempting to relock file");
                match self.relock(wopisrc, &openfile.acctok, &openfile.docid, openfile.all_closed()).await {
                    Ok(lock) => lock,
                    Err(e) => {
                        self.registry
                            .set_save_response(wopisrc, 500, jsonify(&e.to_string()))
                            .await;
                        self.registry
                            .update(wopisrc, |record| {
                                record.lastsave = now;
                                record.tosave = false;
                                record.toclose = [("invalid-lock".to_string(), true)].into_iter().collect();
                            })
                            .await;
                        return None;
                    }
                }
            }
            Err(e) => {
                warn!(wopisrc, error = %e, "unexpected error fetching lock during save");
                return None;
            }
        };

        let adapter_tag = crate::plugins::adapter_tag_for_extension(&lock.app);
        match adapter_tag.and_then(|tag| self.adapters.get(tag)) {
            None => {
                error!(lock = ?lock, "malformed app attribute in WOPI lock");
                self.registry
                    .set_save_response(wopisrc, 400, jsonify("Unrecognized app for this file"))
                    .await;
            }
            Some(adapter) => {
                info!(token = wopi_client::short_token(&openfile.acctok), docid = %openfile.docid, "saving file");
                let (body, status) = match adapter.save_to_storage(wopisrc, &openfile.acctok, openfile.all_closed(), &lock).await {
                    Ok(result) => result,
                    Err(e) => (jsonify(&e.to_string()), 500),
                };
                self.registry.set_save_response(wopisrc, status, body).await;
            }
        }
        self.registry
            .update(wopisrc, |record| {
                record.lastsave = now;
                record.tosave = false;
            })
            .await;

        // `save_to_storage` refreshed the lock's digest on storage's side as
        // part of the save; re-fetch so later phases in this cycle don't
        // carry the stale pre-save digest into a `refreshLock` and revert it.
        match self.wopi.get_lock(wopisrc, &openfile.acctok).await {
            Ok(refreshed) => Some(refreshed),
            Err(_) => Some(lock),
        }
    }

    /// Phase (b): force-close documents idle for `4 * save_interval`; they
    /// get relocked transparently if the session resumes.
    async fn close_when_idle(&self, wopisrc: &str, openfile: &OpenFile, lock: Option<WopiLock>) -> Option<WopiLock> {
        let now = Registry::now_secs();
        let threshold = FORCE_CLOSE_MULTIPLIER * self.config.save_interval.as_secs();
        if openfile.lastsave >= now.saturating_sub(threshold) {
            return lock;
        }

        let lock = match lock {
            Some(lock) => Some(lock),
            None => match self.wopi.get_lock(wopisrc, &openfile.acctok).await {
                Ok(lock) => Some(lock),
                Err(e @ wopi_client::WopiError::InvalidLock { .. }) => {
                    warn!(wopisrc, error = %e, "cleaning up metadata, detected missed close event");
                    self.registry.remove(wopisrc).await;
                    return None;
                }
                Err(e) => {
                    warn!(wopisrc, error = %e, "unexpected error fetching lock during force-close check");
                    return None;
                }
            },
        };
        if lock.is_some() {
            info!(lastsave = openfile.lastsave, "force-closing document");
            self.registry
                .update(wopisrc, |record| {
                    record.toclose = record.toclose.keys().map(|t| (t.clone(), true)).collect();
                })
                .await;
        }
        lock
    }

    /// Phase (c): unlock and drop state for documents every participant has
    /// closed, or reconcile the close-map against storage's view.
    async fn cleanup(&self, wopisrc: &str, openfile: &OpenFile, lock: Option<WopiLock>) {
        if !(openfile.any_closed() && !openfile.tosave) {
            return;
        }

        let lock = match lock {
            Some(lock) => lock,
            None => match self.wopi.get_lock(wopisrc, &openfile.acctok).await {
                Ok(lock) => lock,
                Err(e @ wopi_client::WopiError::InvalidLock { .. }) => {
                    let now = Registry::now_secs();
                    if openfile.lastsave < now.saturating_sub(self.config.unlock_interval.as_secs()) {
                        info!(wopisrc, error = %e, "cleaning up metadata, file already unlocked");
                        self.registry.remove(wopisrc).await;
                    }
                    return;
                }
                Err(e) => {
                    warn!(wopisrc, error = %e, "unexpected error fetching lock during cleanup");
                    return;
                }
            },
        };

        let reconciled = reconcile_toclose(&lock.toclose, &openfile.toclose);
        let all_closed = !reconciled.is_empty() && reconciled.values().all(|&v| v);
        self.registry
            .update(wopisrc, |record| record.toclose = reconciled.clone())
            .await;

        let now = Registry::now_secs();
        if all_closed {
            if openfile.lastsave < now.saturating_sub(self.config.unlock_interval.as_secs()) {
                match self.wopi.unlock(wopisrc, &openfile.acctok, &lock).await {
                    Ok(()) => info!(lastsave = openfile.lastsave, "unlocked document"),
                    Err(e) => warn!(lastsave = openfile.lastsave, error = %e, "failed to unlock"),
                }
                self.registry.remove(wopisrc).await;
            }
        } else if reconciled != lock.toclose {
            if let Err(e) = self
                .wopi
                .refresh_lock(
                    wopisrc,
                    &openfile.acctok,
                    &lock,
                    LockOverrides {
                        digest: None,
                        toclose: Some(reconciled),
                    },
                )
                .await
            {
                warn!(wopisrc, error = %e, "failed to refresh lock during cleanup");
            }
        }
    }

    /// Re-acquire a lock that storage no longer holds: reload the document
    /// through its adapter and Lock it again under a fresh value.
    async fn relock(&self, wopisrc: &str, acctok: &str, docid: &str, isclose: bool) -> Result<WopiLock, String> {
        let filemd = self.wopi.get_file_info(wopisrc, acctok).await.map_err(|e| e.to_string())?;
        let ext = filemd.extension().to_ascii_lowercase();
        let adapter_tag = crate::plugins::adapter_tag_for_extension(&ext).ok_or_else(|| "unrecognized file extension".to_string())?;
        let adapter = self
            .adapters
            .get(adapter_tag)
            .ok_or_else(|| "adapter not initialized".to_string())?;
        let resolved_docid = if docid.is_empty() {
            gen_docid(&self.config.hash_secret, wopisrc)
        } else {
            docid.to_string()
        };
        let new_lock = adapter
            .load_from_storage(&filemd, wopisrc, acctok, Some(resolved_docid))
            .await
            .map_err(|e| e.to_string())?;
        let mut new_lock = new_lock;
        if isclose {
            new_lock.toclose = new_lock.toclose.keys().map(|t| (t.clone(), true)).collect();
        }
        self.wopi.lock(wopisrc, acctok, &new_lock).await.map_err(|e| e.to_string())?;
        Ok(new_lock)
    }
}

/// OR-merge the lock's authoritative close-map with the in-memory one: keys
/// come from the lock side, a participant is closed if either side says so.
fn reconcile_toclose(lock_toclose: &HashMap<String, bool>, local_toclose: &HashMap<String, bool>) -> HashMap<String, bool> {
    lock_toclose
        .iter()
        .map(|(t, &lockval)| {
            let local = local_toclose.get(t).copied().unwrap_or(false);
            (t.clone(), lockval || local)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_close_threshold_is_four_times_save_interval() {
        assert_eq!(FORCE_CLOSE_MULTIPLIER, 4);
    }

    #[test]
    fn reconcile_toclose_ors_both_sides() {
        let lock_side: HashMap<String, bool> = [("t1".to_string(), false), ("t2".to_string(), true)].into_iter().collect();
        let local_side: HashMap<String, bool> = [("t1".to_string(), true)].into_iter().collect();
        let merged = reconcile_toclose(&lock_side, &local_side);
        assert_eq!(merged.get("t1"), Some(&true));
        assert_eq!(merged.get("t2"), Some(&true));
    }

    #[test]
    fn reconcile_toclose_keys_come_from_lock_side() {
        let lock_side: HashMap<String, bool> = [("t1".to_string(), false)].into_iter().collect();
        let local_side: HashMap<String, bool> = [("t1".to_string(), false), ("stale".to_string(), true)].into_iter().collect();
        let merged = reconcile_toclose(&lock_side, &local_side);
        assert!(!merged.contains_key("stale"));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn reconcile_toclose_missing_local_entry_defaults_to_open() {
        let lock_side: HashMap<String, bool> = [("new-participant".to_string(), false)].into_iter().collect();
        let local_side: HashMap<String, bool> = HashMap::new();
        let merged = reconcile_toclose(&lock_side, &local_side);
        assert_eq!(merged.get("new-participant"), Some(&false));
    }
}
