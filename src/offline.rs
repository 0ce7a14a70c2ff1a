//! Offline file list and freshness checker
//!
//! Files pinned for offline use are tracked in a persisted list that
//! survives restarts. Server truth can drift underneath them — a rename, or
//! a re-upload that changes the storage address — so a periodic freshness
//! check compares the persisted records against fresh listings and
//! re-queues downloads where the local copy is stale.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::storage::DocStore;
use crate::transfer::TransferQueue;
use crate::types::{Item, SyncError};

/// One pinned file: the item snapshot it was downloaded as, plus where the
/// decrypted copy lives locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineEntry {
    pub item: Item,
    #[serde(rename = "localPath")]
    pub local_path: String,
}

/// Outcome of one freshness pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfflineCheckReport {
    /// Entries whose remote version drifted; a re-download was queued.
    pub requeued: usize,
    /// Entries whose remote file no longer exists; dropped from the list.
    pub removed: usize,
    pub unchanged: usize,
}

/// `true` when the remote record no longer matches what we downloaded.
/// A name change re-downloads too: the local copy is stored under the
/// decrypted name.
fn has_drifted(stored: &Item, fresh: &Item) -> bool {
    stored.name != fresh.name
        || stored.region != fresh.region
        || stored.bucket != fresh.bucket
        || stored.chunks != fresh.chunks
        || stored.rm != fresh.rm
}

/// The persisted offline list, scoped per user.
pub struct OfflineList {
    docs: Arc<dyn DocStore>,
    user_id: u64,
}

impl OfflineList {
    pub fn new(docs: Arc<dyn DocStore>, user_id: u64) -> Self {
        Self { docs, user_id }
    }

    fn key(&self) -> String {
        format!("offlineList:{}", self.user_id)
    }

    pub fn list(&self) -> Vec<OfflineEntry> {
        self.docs
            .get(&self.key())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn persist(&self, entries: &[OfflineEntry]) -> Result<(), SyncError> {
        let value =
            serde_json::to_value(entries).map_err(|e| SyncError::Storage(e.to_string()))?;
        self.docs.set(&self.key(), value)
    }

    /// Add or replace an entry (keyed by uuid).
    pub fn add(&self, entry: OfflineEntry) -> Result<(), SyncError> {
        let mut entries = self.list();
        entries.retain(|e| e.item.uuid != entry.item.uuid);
        entries.push(entry);
        self.persist(&entries)
    }

    /// Remove an entry; a uuid that is not present is a no-op.
    pub fn remove(&self, uuid: &str) -> Result<Option<OfflineEntry>, SyncError> {
        let mut entries = self.list();
        let removed = entries.iter().position(|e| e.item.uuid == uuid).map(|i| entries.remove(i));
        self.persist(&entries)?;
        Ok(removed)
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.list().iter().any(|e| e.item.uuid == uuid)
    }

    /// Compare the persisted entries against fresh server records.
    ///
    /// Drifted entries get a re-download queued and their stored snapshot
    /// updated; entries gone remotely are dropped and their local file
    /// deleted (best effort).
    pub async fn check_offline_items(
        &self,
        fresh: &[Item],
        queue: &dyn TransferQueue,
    ) -> Result<OfflineCheckReport, SyncError> {
        let mut report = OfflineCheckReport::default();
        let mut entries = self.list();
        let mut kept = Vec::with_capacity(entries.len());

        for mut entry in entries.drain(..) {
            match fresh.iter().find(|i| i.uuid == entry.item.uuid) {
                None => {
                    debug!("Offline item {} gone remotely, dropping", entry.item.uuid);
                    if let Err(e) = std::fs::remove_file(&entry.local_path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("Failed to delete stale offline copy {}: {}", entry.local_path, e);
                        }
                    }
                    report.removed += 1;
                }
                Some(remote) => {
                    if has_drifted(&entry.item, remote) {
                        debug!(
                            "Offline item {} drifted (name/version), re-downloading",
                            entry.item.uuid
                        );
                        queue.queue_download(remote, &entry.local_path).await?;
                        entry.item = Item {
                            offline: true,
                            ..remote.clone()
                        };
                        report.requeued += 1;
                    } else {
                        report.unchanged += 1;
                    }
                    kept.push(entry);
                }
            }
        }

        self.persist(&kept)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transfer::recording::RecordingQueue;
    use crate::types::{ItemType, ParentId};

    fn file(uuid: &str, name: &str, rm: &str) -> Item {
        Item {
            item_type: ItemType::File,
            region: "eu-central-1".into(),
            bucket: "bucket-a".into(),
            chunks: 1,
            rm: rm.into(),
            offline: true,
            ..Item::folder(uuid, name, ParentId::Base)
        }
    }

    fn list_with(entries: Vec<OfflineEntry>) -> OfflineList {
        let docs: Arc<dyn DocStore> = Arc::new(MemoryStore::new());
        let list = OfflineList::new(docs, 1);
        for e in entries {
            list.add(e).unwrap();
        }
        list
    }

    #[test]
    fn test_add_remove_roundtrip() {
        let list = list_with(vec![]);
        list.add(OfflineEntry {
            item: file("u1", "a.txt", "rm1"),
            local_path: "/tmp/a.txt".into(),
        })
        .unwrap();
        assert!(list.contains("u1"));

        // Re-adding the same uuid replaces, not duplicates.
        list.add(OfflineEntry {
            item: file("u1", "a-renamed.txt", "rm1"),
            local_path: "/tmp/a.txt".into(),
        })
        .unwrap();
        assert_eq!(list.list().len(), 1);
        assert_eq!(list.list()[0].item.name, "a-renamed.txt");

        assert!(list.remove("u1").unwrap().is_some());
        assert!(list.remove("u1").unwrap().is_none());
        assert!(!list.contains("u1"));
    }

    #[tokio::test]
    async fn test_unchanged_items_do_nothing() {
        let list = list_with(vec![OfflineEntry {
            item: file("u1", "a.txt", "rm1"),
            local_path: "/tmp/nonexistent-a".into(),
        }]);
        let queue = RecordingQueue::new();

        let fresh = vec![file("u1", "a.txt", "rm1")];
        let report = list.check_offline_items(&fresh, &queue).await.unwrap();
        assert_eq!(report, OfflineCheckReport { requeued: 0, removed: 0, unchanged: 1 });
        assert!(queue.downloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_drift_requeues_download() {
        let list = list_with(vec![OfflineEntry {
            item: file("u1", "a.txt", "rm1"),
            local_path: "/tmp/offline/a.txt".into(),
        }]);
        let queue = RecordingQueue::new();

        // Same name, new storage address: the file was re-uploaded.
        let fresh = vec![file("u1", "a.txt", "rm2")];
        let report = list.check_offline_items(&fresh, &queue).await.unwrap();
        assert_eq!(report.requeued, 1);

        let downloads = queue.downloads.lock().unwrap();
        assert_eq!(downloads[0], ("u1".to_string(), "/tmp/offline/a.txt".to_string()));

        // Stored snapshot updated so the next pass sees no drift.
        assert_eq!(list.list()[0].item.rm, "rm2");
    }

    #[tokio::test]
    async fn test_name_drift_requeues_download() {
        let list = list_with(vec![OfflineEntry {
            item: file("u1", "old.txt", "rm1"),
            local_path: "/tmp/offline/old.txt".into(),
        }]);
        let queue = RecordingQueue::new();

        let fresh = vec![file("u1", "new.txt", "rm1")];
        let report = list.check_offline_items(&fresh, &queue).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(list.list()[0].item.name, "new.txt");
    }

    #[tokio::test]
    async fn test_remotely_deleted_item_is_dropped_and_local_file_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let local = tmp.path().join("gone.txt");
        std::fs::write(&local, b"cached bytes").unwrap();

        let list = list_with(vec![OfflineEntry {
            item: file("u1", "gone.txt", "rm1"),
            local_path: local.to_string_lossy().to_string(),
        }]);
        let queue = RecordingQueue::new();

        let report = list.check_offline_items(&[], &queue).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(!list.contains("u1"));
        assert!(!local.exists());
    }
}
