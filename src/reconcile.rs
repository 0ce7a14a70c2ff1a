//! Share/link consistency layer
//!
//! Moving, renaming or creating an item can make its metadata visible to
//! share recipients and public links, each of which needs a copy sealed
//! under its own key. The checks for "is the parent shared" and "is the
//! parent linked" are independent and run concurrently; the operation
//! proceeds once both have completed.
//!
//! Fan-out is best effort: the primary mutation has already committed
//! server-side by the time we get here, so an individual recipient or link
//! push failure is logged and the remaining pushes continue.

use futures_util::future::join_all;
use secrecy::SecretString;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::types::{
    DirDownloadData, LinkInfo, LinkStatusData, LinkedItemStatusData, ShareStatusData, ShareUser,
    SharedItemStatusData,
};
use crate::api::ApiClient;
use crate::crypto::MetadataCipher;
use crate::decrypt::{decrypt_file_metadata, decrypt_folder_name, decrypt_link_key};
use crate::types::{Item, ItemType, SyncError};

/// Share/link state of a parent folder, fetched before propagation.
#[derive(Debug, Clone, Default)]
pub struct ParentFlags {
    pub share: ShareStatusData,
    pub link: LinkStatusData,
}

impl ParentFlags {
    pub fn needs_fanout(&self) -> bool {
        self.share.sharing || self.link.link
    }
}

/// Result of a fan-out pass. `failed` counts pushes that were attempted and
/// lost; they never fail the parent operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub pushed: usize,
    pub failed: usize,
}

impl FanoutReport {
    fn merge(&mut self, other: FanoutReport) {
        self.pushed += other.pushed;
        self.failed += other.failed;
    }
}

/// One metadata payload to propagate: an item (or subtree member) with its
/// plaintext metadata ready for per-recipient sealing.
#[derive(Debug, Clone)]
struct SharePayload {
    uuid: String,
    parent: String,
    item_type: ItemType,
    meta_plain: String,
}

/// Plaintext metadata for an item under a (possibly new) name.
fn metadata_plain(item: &Item, name: &str) -> String {
    match item.item_type {
        ItemType::Folder => json!({ "name": name }).to_string(),
        ItemType::File => json!({
            "name": name,
            "size": item.size,
            "mime": item.mime,
            "key": item.key,
            "lastModified": item.last_modified,
        })
        .to_string(),
    }
}

pub async fn is_sharing_folder(client: &ApiClient, uuid: &str) -> Result<ShareStatusData, SyncError> {
    let env = client
        .request("/v1/share/dir/status", json!({ "uuid": uuid }))
        .await?;
    env.data_as().map_err(SyncError::Api)
}

pub async fn is_public_linking_folder(
    client: &ApiClient,
    uuid: &str,
) -> Result<LinkStatusData, SyncError> {
    let env = client
        .request("/v1/link/dir/status", json!({ "uuid": uuid }))
        .await?;
    env.data_as().map_err(SyncError::Api)
}

pub async fn is_shared_item(client: &ApiClient, uuid: &str) -> Result<SharedItemStatusData, SyncError> {
    let env = client
        .request("/v1/user/shared/item/status", json!({ "uuid": uuid }))
        .await?;
    env.data_as().map_err(SyncError::Api)
}

pub async fn is_linked_item(client: &ApiClient, uuid: &str) -> Result<LinkedItemStatusData, SyncError> {
    let env = client
        .request("/v1/link/status", json!({ "uuid": uuid }))
        .await?;
    env.data_as().map_err(SyncError::Api)
}

/// Fetch both parent flags concurrently. Resolution requires both checks to
/// have completed, not either.
pub async fn parent_flags(client: &ApiClient, parent: &str) -> Result<ParentFlags, SyncError> {
    let (share, link) = tokio::join!(
        is_sharing_folder(client, parent),
        is_public_linking_folder(client, parent)
    );
    Ok(ParentFlags {
        share: share?,
        link: link?,
    })
}

/// Collect the payloads an item contributes to a fan-out: the item itself
/// and, for folders, its entire decrypted subtree.
async fn collect_payloads(
    client: &ApiClient,
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    item: &Item,
) -> Result<Vec<SharePayload>, SyncError> {
    let mut payloads = vec![SharePayload {
        uuid: item.uuid.clone(),
        parent: item.parent.as_wire().to_string(),
        item_type: item.item_type,
        meta_plain: metadata_plain(item, &item.name),
    }];

    if item.item_type == ItemType::Folder {
        let env = client
            .request("/v1/download/dir", json!({ "uuid": item.uuid }))
            .await?;
        let tree: DirDownloadData = env.data_as().map_err(SyncError::Api)?;

        for folder in &tree.folders {
            if folder.uuid == item.uuid {
                continue;
            }
            match decrypt_folder_name(cipher, keys, &folder.name, &folder.uuid) {
                Some(name) => payloads.push(SharePayload {
                    uuid: folder.uuid.clone(),
                    parent: folder.parent.clone(),
                    item_type: ItemType::Folder,
                    meta_plain: json!({ "name": name }).to_string(),
                }),
                None => debug!("Skipping undecryptable subtree folder {}", folder.uuid),
            }
        }
        for file in &tree.files {
            match decrypt_file_metadata(cipher, keys, &file.metadata, &file.uuid) {
                Some(meta) => payloads.push(SharePayload {
                    uuid: file.uuid.clone(),
                    parent: file.parent.clone(),
                    item_type: ItemType::File,
                    meta_plain: serde_json::to_string(&meta)
                        .map_err(|e| SyncError::Storage(e.to_string()))?,
                }),
                None => debug!("Skipping undecryptable subtree file {}", file.uuid),
            }
        }
    }

    Ok(payloads)
}

/// Push one share record per (payload × recipient).
async fn push_to_recipients(
    client: &ApiClient,
    cipher: &dyn MetadataCipher,
    payloads: &[SharePayload],
    users: &[ShareUser],
) -> FanoutReport {
    let mut pushes = Vec::new();
    for user in users {
        for payload in payloads {
            let sealed = match cipher.seal_for_recipient(&payload.meta_plain, &user.public_key) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Seal for {} failed on {}: {}", user.email, payload.uuid, e);
                    pushes.push(None);
                    continue;
                }
            };
            let body = json!({
                "uuid": payload.uuid,
                "parent": payload.parent,
                "email": user.email,
                "type": payload.item_type.to_string(),
                "metadata": sealed,
            });
            pushes.push(Some(async move {
                client.fanout_request("/v1/share", body).await
            }));
        }
    }

    let mut report = FanoutReport::default();
    let futures: Vec<_> = pushes.into_iter().flatten().collect();
    let seal_failures = users.len() * payloads.len() - futures.len();
    report.failed += seal_failures;

    for result in join_all(futures).await {
        match result {
            Ok(_) => report.pushed += 1,
            Err(e) => {
                warn!("Share push failed (continuing fan-out): {}", e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Push one link-add record per (payload × link), sealing with each link's
/// symmetric key.
async fn push_to_links(
    client: &ApiClient,
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    payloads: &[SharePayload],
    links: &[LinkInfo],
) -> FanoutReport {
    let mut report = FanoutReport::default();
    let mut futures = Vec::new();

    for link in links {
        let link_key = match decrypt_link_key(cipher, keys, &link.link_key) {
            Some(k) => k,
            None => {
                warn!("Cannot decrypt key for link {}, skipping", link.link_uuid);
                report.failed += payloads.len();
                continue;
            }
        };

        for payload in payloads {
            let sealed = match cipher.encrypt(&payload.meta_plain, &link_key) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Seal for link {} failed on {}: {}", link.link_uuid, payload.uuid, e);
                    report.failed += 1;
                    continue;
                }
            };
            let body = json!({
                "uuid": payload.uuid,
                "parent": payload.parent,
                "linkUUID": link.link_uuid,
                "type": payload.item_type.to_string(),
                "metadata": sealed,
                "key": link.link_key,
                "expiration": "never",
            });
            futures.push(async move { client.fanout_request("/v1/dir/link/add", body).await });
        }
    }

    for result in join_all(futures).await {
        match result {
            Ok(_) => report.pushed += 1,
            Err(e) => {
                warn!("Link push failed (continuing fan-out): {}", e);
                report.failed += 1;
            }
        }
    }
    report
}

/// Propagate an item that was created in or moved into `flags`' parent.
///
/// For a folder this covers the full subtree: every child is decrypted with
/// the owner's keys and re-sealed per recipient and per link.
pub async fn propagate_into_parent(
    client: &ApiClient,
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    item: &Item,
    flags: &ParentFlags,
) -> Result<FanoutReport, SyncError> {
    if !flags.needs_fanout() {
        return Ok(FanoutReport::default());
    }

    let payloads = collect_payloads(client, cipher, keys, item).await?;
    let mut report = FanoutReport::default();

    if flags.share.sharing {
        report.merge(push_to_recipients(client, cipher, &payloads, &flags.share.users).await);
    }
    if flags.link.link {
        report.merge(push_to_links(client, cipher, keys, &payloads, &flags.link.links).await);
    }

    debug!(
        "Fan-out for {}: {} pushed, {} failed",
        item.uuid, report.pushed, report.failed
    );
    Ok(report)
}

/// Propagate a rename to the shares and links the item itself participates
/// in. Renaming does not change parent relationships, so the queries target
/// the item, not its parent.
pub async fn propagate_rename(
    client: &ApiClient,
    cipher: &dyn MetadataCipher,
    keys: &[SecretString],
    item: &Item,
    new_name: &str,
) -> Result<FanoutReport, SyncError> {
    let (shared, linked) = tokio::join!(
        is_shared_item(client, &item.uuid),
        is_linked_item(client, &item.uuid)
    );
    let shared = shared?;
    let linked = linked?;

    let meta_plain = metadata_plain(item, new_name);
    let mut report = FanoutReport::default();

    if shared.sharing {
        let mut futures = Vec::new();
        for user in &shared.users {
            let sealed = match cipher.seal_for_recipient(&meta_plain, &user.public_key) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Seal rename for {} failed: {}", user.email, e);
                    report.failed += 1;
                    continue;
                }
            };
            let body = json!({
                "uuid": item.uuid,
                "receiverId": user.id,
                "metadata": sealed,
            });
            futures.push(async move {
                client
                    .fanout_request("/v1/user/shared/item/rename", body)
                    .await
            });
        }
        for result in join_all(futures).await {
            match result {
                Ok(_) => report.pushed += 1,
                Err(e) => {
                    warn!("Shared rename push failed (continuing): {}", e);
                    report.failed += 1;
                }
            }
        }
    }

    if linked.link {
        let mut futures = Vec::new();
        for link in &linked.links {
            let link_key = match decrypt_link_key(cipher, keys, &link.link_key) {
                Some(k) => k,
                None => {
                    warn!("Cannot decrypt key for link {}, skipping rename", link.link_uuid);
                    report.failed += 1;
                    continue;
                }
            };
            let sealed = match cipher.encrypt(&meta_plain, &link_key) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Seal rename for link {} failed: {}", link.link_uuid, e);
                    report.failed += 1;
                    continue;
                }
            };
            let body = json!({
                "uuid": item.uuid,
                "linkUUID": link.link_uuid,
                "metadata": sealed,
            });
            futures.push(async move { client.fanout_request("/v1/link/edit", body).await });
        }
        for result in join_all(futures).await {
            match result {
                Ok(_) => report.pushed += 1,
                Err(e) => {
                    warn!("Link rename push failed (continuing): {}", e);
                    report.failed += 1;
                }
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::scripted::ScriptedTransport;
    use crate::api::ApiClient;
    use crate::config::EngineConfig;
    use crate::crypto::SealedCipher;
    use crate::storage::MemoryStore;
    use crate::types::ParentId;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn master_keys() -> Vec<SecretString> {
        vec![SecretString::from("mk1".to_string())]
    }

    fn test_client(t: Arc<ScriptedTransport>) -> ApiClient {
        let config = EngineConfig {
            retry_delay_ms: 1,
            default_max_attempts: 2,
            ..EngineConfig::default()
        };
        ApiClient::new(t, Arc::new(MemoryStore::new()), &config, CancellationToken::new())
    }

    fn file_item(uuid: &str, parent: &str) -> Item {
        Item {
            item_type: ItemType::File,
            size: 10,
            mime: "text/plain".into(),
            key: "file-key".into(),
            last_modified: 99,
            ..Item::folder(uuid, "doc.txt", ParentId::Folder(parent.to_string()))
        }
    }

    fn share_status(users: &[(&str, &str)]) -> serde_json::Value {
        json!({
            "sharing": !users.is_empty(),
            "users": users.iter().enumerate().map(|(i, (email, pk))| json!({
                "id": i as u64 + 1,
                "email": email,
                "publicKey": pk,
            })).collect::<Vec<_>>(),
        })
    }

    #[tokio::test]
    async fn test_unshared_unlinked_parent_is_noop() {
        let t = Arc::new(ScriptedTransport::new());
        t.ok("/v1/share/dir/status", json!({"sharing": false, "users": []}));
        t.ok("/v1/link/dir/status", json!({"link": false, "links": []}));
        let client = test_client(t.clone());
        let cipher = SealedCipher::new();

        let flags = parent_flags(&client, "p1").await.unwrap();
        assert!(!flags.needs_fanout());

        let report = propagate_into_parent(&client, &cipher, &master_keys(), &file_item("f1", "p1"), &flags)
            .await
            .unwrap();
        assert_eq!(report, FanoutReport::default());
        assert_eq!(t.calls_to("/v1/share"), 0);
    }

    #[tokio::test]
    async fn test_move_file_into_shared_and_linked_parent() {
        // Scenario D: 2 share recipients + 1 active link = exactly 3 pushes.
        let cipher = SealedCipher::new();
        let sealed_link_key = cipher.encrypt("link-sym-key", "mk1").unwrap();

        let t = Arc::new(ScriptedTransport::new());
        t.ok(
            "/v1/share/dir/status",
            share_status(&[("u1@example.com", "pk-one"), ("u2@example.com", "pk-two")]),
        );
        t.ok(
            "/v1/link/dir/status",
            json!({"link": true, "links": [{"linkUUID": "l1", "linkKey": sealed_link_key}]}),
        );
        t.ok("/v1/share", json!({}));
        t.ok("/v1/dir/link/add", json!({}));
        let client = test_client(t.clone());

        let item = file_item("f1", "p1");
        let flags = parent_flags(&client, "p1").await.unwrap();
        let report = propagate_into_parent(&client, &cipher, &master_keys(), &item, &flags)
            .await
            .unwrap();

        assert_eq!(report.pushed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(t.calls_to("/v1/share"), 2);
        assert_eq!(t.calls_to("/v1/dir/link/add"), 1);

        // Each push carries independently re-encrypted metadata.
        let calls = t.calls.lock().unwrap();
        let metadatas: Vec<String> = calls
            .iter()
            .filter(|(e, _)| e == "/v1/share" || e == "/v1/dir/link/add")
            .map(|(_, b)| b["metadata"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(metadatas.len(), 3);
        assert_ne!(metadatas[0], metadatas[1]);
        assert_ne!(metadatas[1], metadatas[2]);

        // The link copy opens with the link's symmetric key.
        let link_call = calls.iter().find(|(e, _)| e == "/v1/dir/link/add").unwrap();
        let opened = cipher
            .try_decrypt(link_call.1["metadata"].as_str().unwrap(), "link-sym-key")
            .unwrap();
        assert!(opened.contains("doc.txt"));
    }

    #[tokio::test]
    async fn test_folder_fanout_covers_subtree() {
        let cipher = SealedCipher::new();
        let t = Arc::new(ScriptedTransport::new());
        t.ok("/v1/share/dir/status", share_status(&[("u1@x", "pk1"), ("u2@x", "pk2")]));
        t.ok("/v1/link/dir/status", json!({"link": false, "links": []}));
        t.ok(
            "/v1/download/dir",
            json!({
                "folders": [
                    {"uuid": "sub1", "name": cipher.encrypt("{\"name\":\"Sub\"}", "mk1").unwrap(), "parent": "dir1"},
                ],
                "files": [
                    {"uuid": "child1", "metadata": cipher.encrypt(
                        "{\"name\":\"c.txt\",\"size\":1,\"mime\":\"text/plain\",\"key\":\"k\",\"lastModified\":1}",
                        "mk1").unwrap(), "parent": "sub1"},
                ],
            }),
        );
        t.ok("/v1/share", json!({}));
        let client = test_client(t.clone());

        let folder = Item::folder("dir1", "Dir", ParentId::Folder("shared-parent".into()));
        let flags = parent_flags(&client, "shared-parent").await.unwrap();
        let report = propagate_into_parent(&client, &cipher, &master_keys(), &folder, &flags)
            .await
            .unwrap();

        // (folder itself + 1 subfolder + 1 file) × 2 recipients
        assert_eq!(report.pushed, 6);
        assert_eq!(t.calls_to("/v1/share"), 6);
    }

    #[tokio::test]
    async fn test_fanout_is_best_effort() {
        // Recipient #2's push fails; #1 and #3 still get theirs and the
        // overall operation resolves.
        let cipher = SealedCipher::new();
        let t = Arc::new(ScriptedTransport::new());
        t.ok(
            "/v1/share/dir/status",
            share_status(&[("u1@x", "pk1"), ("u2@x", "pk2"), ("u3@x", "pk3")]),
        );
        t.ok("/v1/link/dir/status", json!({"link": false, "links": []}));
        t.ok("/v1/share", json!({}));
        t.fail_when_body_contains("/v1/share", "u2@x");
        let client = test_client(t.clone());

        let item = file_item("f1", "p1");
        let flags = parent_flags(&client, "p1").await.unwrap();
        let report = propagate_into_parent(&client, &cipher, &master_keys(), &item, &flags)
            .await
            .unwrap();

        assert_eq!(report.pushed, 2);
        assert_eq!(report.failed, 1);

        let calls = t.calls.lock().unwrap();
        let delivered: Vec<&str> = calls
            .iter()
            .filter(|(e, _)| e == "/v1/share")
            .map(|(_, b)| b["email"].as_str().unwrap())
            .collect();
        assert!(delivered.contains(&"u1@x"));
        assert!(delivered.contains(&"u3@x"));
    }

    #[tokio::test]
    async fn test_rename_targets_item_shares_and_links() {
        let cipher = SealedCipher::new();
        let sealed_link_key = cipher.encrypt("lk", "mk1").unwrap();
        let t = Arc::new(ScriptedTransport::new());
        t.ok("/v1/user/shared/item/status", share_status(&[("u1@x", "pk1")]));
        t.ok(
            "/v1/link/status",
            json!({"link": true, "links": [{"linkUUID": "l1", "linkKey": sealed_link_key}]}),
        );
        t.ok("/v1/user/shared/item/rename", json!({}));
        t.ok("/v1/link/edit", json!({}));
        let client = test_client(t.clone());

        let item = file_item("f1", "p1");
        let report = propagate_rename(&client, &cipher, &master_keys(), &item, "new.txt")
            .await
            .unwrap();

        assert_eq!(report.pushed, 2);
        assert_eq!(t.calls_to("/v1/user/shared/item/rename"), 1);
        assert_eq!(t.calls_to("/v1/link/edit"), 1);

        let calls = t.calls.lock().unwrap();
        let link_edit = calls.iter().find(|(e, _)| e == "/v1/link/edit").unwrap();
        let opened = cipher
            .try_decrypt(link_edit.1["metadata"].as_str().unwrap(), "lk")
            .unwrap();
        assert!(opened.contains("new.txt"));
    }

    #[tokio::test]
    async fn test_undecryptable_link_key_skips_that_link_only() {
        let cipher = SealedCipher::new();
        let good_key = cipher.encrypt("lk-good", "mk1").unwrap();
        let t = Arc::new(ScriptedTransport::new());
        t.ok("/v1/share/dir/status", json!({"sharing": false, "users": []}));
        t.ok(
            "/v1/link/dir/status",
            json!({"link": true, "links": [
                {"linkUUID": "l-bad", "linkKey": "002nonsense-envelope"},
                {"linkUUID": "l-good", "linkKey": good_key},
            ]}),
        );
        t.ok("/v1/dir/link/add", json!({}));
        let client = test_client(t.clone());

        let item = file_item("f1", "p1");
        let flags = parent_flags(&client, "p1").await.unwrap();
        let report = propagate_into_parent(&client, &cipher, &master_keys(), &item, &flags)
            .await
            .unwrap();

        assert_eq!(report.pushed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(t.calls_to("/v1/dir/link/add"), 1);
    }
}
