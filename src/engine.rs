//! The sync engine
//!
//! [`SyncEngine`] owns everything the subsystem needs: the gateway client,
//! the item store, the persistence handles, the cipher and the master-key
//! history. Nothing lives in module globals — engines are constructed per
//! process (or per test) and passed by reference.
//!
//! Mutations follow one shape: patch the store optimistically where the UI
//! needs immediate feedback (rename, favorite, color), call the gateway,
//! roll the patch back on failure, then run the share/link fan-out as best
//! effort — a fan-out failure never fails the operation that already
//! committed.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::transport::Transport;
use crate::api::types::{DirContentData, DirSizeData, FileRecord, KeyPairInfoData};
use crate::api::ApiClient;
use crate::config::EngineConfig;
use crate::crypto::{hash_name, MetadataCipher};
use crate::decrypt::decrypt_link_key;
use crate::events::{
    self, file_item_from_record, folder_item_from_record, EventOutcome, SidecarEvent, SocketEvent,
};
use crate::offline::OfflineList;
use crate::storage::{DocStore, KvStore};
use crate::store::{route_key, screen, ItemStore};
use crate::types::{Item, ItemType, ParentId, SyncError};

pub struct SyncEngine {
    config: EngineConfig,
    client: Arc<ApiClient>,
    store: Arc<ItemStore>,
    kv: Arc<dyn KvStore>,
    docs: Arc<dyn DocStore>,
    cipher: Arc<dyn MetadataCipher>,
    master_keys: RwLock<Arc<Vec<SecretString>>>,
    user_id: u64,
    cancel: CancellationToken,
    sidecar_tx: broadcast::Sender<SidecarEvent>,
}

impl SyncEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        kv: Arc<dyn KvStore>,
        docs: Arc<dyn DocStore>,
        cipher: Arc<dyn MetadataCipher>,
        master_keys: Vec<SecretString>,
        user_id: u64,
    ) -> Self {
        let cancel = CancellationToken::new();
        let client = Arc::new(ApiClient::new(
            transport,
            docs.clone(),
            &config,
            cancel.clone(),
        ));

        // A dead credential stops in-flight retries immediately; the host
        // observes the cancellation and drives the full logout.
        let hook_cancel = cancel.clone();
        client.set_logout_hook(Box::new(move || hook_cancel.cancel()));

        let (sidecar_tx, _) = broadcast::channel(64);

        Self {
            config,
            client,
            store: Arc::new(ItemStore::new()),
            kv,
            docs,
            cipher,
            master_keys: RwLock::new(Arc::new(master_keys)),
            user_id,
            cancel,
            sidecar_tx,
        }
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    pub fn store(&self) -> &Arc<ItemStore> {
        &self.store
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The current master-key history, oldest first.
    pub fn master_keys(&self) -> Arc<Vec<SecretString>> {
        self.master_keys.read().unwrap().clone()
    }

    /// The offline list scoped to this engine's user.
    pub fn offline_list(&self) -> OfflineList {
        OfflineList::new(self.docs.clone(), self.user_id)
    }

    /// Receive chat/note sidecar events decoded from the push stream.
    pub fn subscribe_sidecar(&self) -> broadcast::Receiver<SidecarEvent> {
        self.sidecar_tx.subscribe()
    }

    // -- Listings -----------------------------------------------------------

    fn decode_listing(&self, data: &DirContentData) -> Vec<Item> {
        let keys = self.master_keys();
        let mut items = Vec::with_capacity(data.folders.len() + data.uploads.len());
        for folder in &data.folders {
            if let Some(item) = folder_item_from_record(self.cipher.as_ref(), &keys, folder) {
                items.push(item);
            }
        }
        for file in &data.uploads {
            if let Some(item) = file_item_from_record(self.cipher.as_ref(), &keys, file) {
                items.push(item);
            }
        }
        items
    }

    /// Fetch, decrypt and cache a listing for one route. When the raw
    /// payload is structurally identical to the route's snapshot the
    /// previously decrypted list is re-emitted without touching the cipher.
    async fn load_route(
        &self,
        route: &str,
        endpoint: &str,
        body: Value,
    ) -> Result<Vec<Item>, SyncError> {
        let envelope = self.client.request(endpoint, body).await?;
        let raw = envelope.data.clone().unwrap_or(Value::Null).to_string();

        if self.store.is_unchanged(route, &raw).await {
            debug!("{} unchanged, re-emitting cached items", route);
            return Ok(self.store.get(route).await.unwrap_or_default());
        }

        let data: DirContentData = envelope.data_as().map_err(SyncError::Api)?;
        let items = self.decode_listing(&data);
        self.store
            .set(route, items.clone(), Some(ItemStore::snapshot_of(&raw)))
            .await;
        Ok(items)
    }

    /// Load a folder listing (or base/trash via their sentinels).
    pub async fn load_drive(&self, parent: &ParentId) -> Result<Vec<Item>, SyncError> {
        let screen_name = match parent {
            ParentId::Trash => screen::TRASH,
            _ => screen::DRIVE,
        };
        let route = route_key(self.user_id, screen_name, parent.as_wire());
        self.load_route(&route, "/v1/dir/content", json!({ "uuid": parent.as_wire() }))
            .await
    }

    pub async fn load_recents(&self) -> Result<Vec<Item>, SyncError> {
        let route = route_key(self.user_id, screen::RECENTS, "recents");
        let envelope = self.client.request("/v1/user/recent", json!({})).await?;
        let raw = envelope.data.clone().unwrap_or(Value::Null).to_string();

        if self.store.is_unchanged(&route, &raw).await {
            return Ok(self.store.get(&route).await.unwrap_or_default());
        }

        let records: Vec<FileRecord> = envelope.data_as().map_err(SyncError::Api)?;
        let keys = self.master_keys();
        let items: Vec<Item> = records
            .iter()
            .filter_map(|r| file_item_from_record(self.cipher.as_ref(), &keys, r))
            .collect();
        self.store
            .set(&route, items.clone(), Some(ItemStore::snapshot_of(&raw)))
            .await;
        Ok(items)
    }

    pub async fn load_shared_in(&self) -> Result<Vec<Item>, SyncError> {
        let route = route_key(self.user_id, screen::SHARED_IN, "shared-in");
        self.load_route(&route, "/v1/user/shared/in", json!({ "uuid": "shared-in" }))
            .await
    }

    pub async fn load_shared_out(&self) -> Result<Vec<Item>, SyncError> {
        let route = route_key(self.user_id, screen::SHARED_OUT, "shared-out");
        self.load_route(&route, "/v1/user/shared/out", json!({ "uuid": "shared-out" }))
            .await
    }

    /// Total size of a folder subtree.
    pub async fn dir_size(&self, uuid: &str) -> Result<u64, SyncError> {
        let envelope = self.client.request("/v1/dir/size", json!({ "uuid": uuid })).await?;
        let data: DirSizeData = envelope.data_as().map_err(SyncError::Api)?;
        Ok(data.size)
    }

    pub async fn key_pair_info(&self) -> Result<KeyPairInfoData, SyncError> {
        let envelope = self
            .client
            .request("/v1/user/keyPair/info", json!({}))
            .await?;
        envelope.data_as().map_err(SyncError::Api)
    }

    // -- Mutations ----------------------------------------------------------

    /// Create a folder under `parent`. The decrypted item is added to the
    /// parent's cached route, then share/link fan-out runs best effort.
    pub async fn create_folder(
        &self,
        name: &str,
        parent: &ParentId,
    ) -> Result<Item, SyncError> {
        let uuid = uuid::Uuid::new_v4().to_string();
        let name_json = json!({ "name": name }).to_string();
        let keys = self.master_keys();
        let key = keys
            .first()
            .ok_or_else(|| SyncError::Crypto("no master key".to_string()))?;
        let encrypted_name = self.cipher.encrypt(&name_json, key.expose_secret())?;

        self.client
            .request(
                "/v1/dir/create",
                json!({
                    "uuid": uuid,
                    "name": encrypted_name,
                    "nameHashed": hash_name(name),
                    "parent": parent.as_wire(),
                }),
            )
            .await?;

        let item = Item::folder(uuid, name, parent.clone());
        let route = route_key(self.user_id, screen::DRIVE, parent.as_wire());
        self.store.add(&route, item.clone()).await;

        if let ParentId::Folder(parent_uuid) = parent {
            self.fanout_into_parent(&item, parent_uuid).await;
        }
        Ok(item)
    }

    /// Rename an item: optimistic patch, gateway call, rollback on failure,
    /// then best-effort propagation to the item's shares and links.
    pub async fn rename_item(&self, item: &Item, new_name: &str) -> Result<(), SyncError> {
        self.store.rename_everywhere(&item.uuid, new_name).await;

        let keys = self.master_keys();
        let key = keys
            .first()
            .ok_or_else(|| SyncError::Crypto("no master key".to_string()))?;
        let result = match item.item_type {
            ItemType::Folder => {
                let name_json = json!({ "name": new_name }).to_string();
                let encrypted_name = self.cipher.encrypt(&name_json, key.expose_secret())?;
                self.client
                    .request(
                        "/v1/dir/rename",
                        json!({
                            "uuid": item.uuid,
                            "name": encrypted_name,
                            "nameHashed": hash_name(new_name),
                        }),
                    )
                    .await
            }
            ItemType::File => {
                let metadata = json!({
                    "name": new_name,
                    "size": item.size,
                    "mime": item.mime,
                    "key": item.key,
                    "lastModified": item.last_modified,
                })
                .to_string();
                let encrypted_name = self.cipher.encrypt(new_name, key.expose_secret())?;
                let encrypted_metadata = self.cipher.encrypt(&metadata, key.expose_secret())?;
                self.client
                    .request(
                        "/v1/file/rename",
                        json!({
                            "uuid": item.uuid,
                            "name": encrypted_name,
                            "nameHashed": hash_name(new_name),
                            "metadata": encrypted_metadata,
                        }),
                    )
                    .await
            }
        };

        if let Err(e) = result {
            self.store.rename_everywhere(&item.uuid, &item.name).await;
            return Err(e);
        }

        let keys = self.master_keys();
        match crate::reconcile::propagate_rename(&self.client, self.cipher.as_ref(), &keys, item, new_name)
            .await
        {
            Ok(report) if report.failed > 0 => {
                warn!("Rename fan-out for {}: {} pushes lost", item.uuid, report.failed)
            }
            Ok(_) => {}
            Err(e) => warn!("Rename fan-out for {} failed: {}", item.uuid, e),
        }
        Ok(())
    }

    /// Move an item into another folder: optimistic relocation between the
    /// cached routes, gateway call, rollback on failure, then fan-out into
    /// the new parent.
    pub async fn move_item(&self, item: &Item, new_parent: &str) -> Result<(), SyncError> {
        let old_route = route_key(self.user_id, screen::DRIVE, item.parent.as_wire());
        let new_route = route_key(self.user_id, screen::DRIVE, new_parent);

        let mut moved = item.clone();
        moved.parent = ParentId::Folder(new_parent.to_string());
        self.store.remove(&old_route, &item.uuid).await;
        self.store.add(&new_route, moved.clone()).await;

        let endpoint = match item.item_type {
            ItemType::File => "/v1/file/move",
            ItemType::Folder => "/v1/dir/move",
        };
        let result = self
            .client
            .request(endpoint, json!({ "uuid": item.uuid, "to": new_parent }))
            .await;

        if let Err(e) = result {
            self.store.remove(&new_route, &item.uuid).await;
            self.store.add(&old_route, item.clone()).await;
            return Err(e);
        }

        self.fanout_into_parent(&moved, new_parent).await;
        Ok(())
    }

    /// Trash an item. The store patch is applied after the server confirms;
    /// push events keep other devices consistent.
    pub async fn trash_item(&self, item: &Item) -> Result<(), SyncError> {
        let endpoint = match item.item_type {
            ItemType::File => "/v1/file/trash",
            ItemType::Folder => "/v1/dir/trash",
        };
        self.client
            .request(endpoint, json!({ "uuid": item.uuid }))
            .await?;
        self.store.remove_everywhere(&item.uuid).await;
        Ok(())
    }

    pub async fn favorite_item(&self, item: &Item, value: bool) -> Result<(), SyncError> {
        self.store
            .update_everywhere(&item.uuid, |i| i.favorited = value)
            .await;

        let result = self
            .client
            .request(
                "/v1/item/favorite",
                json!({
                    "uuid": item.uuid,
                    "type": item.item_type.to_string(),
                    "value": if value { 1 } else { 0 },
                }),
            )
            .await;

        if let Err(e) = result {
            let rollback = item.favorited;
            self.store
                .update_everywhere(&item.uuid, |i| i.favorited = rollback)
                .await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn change_folder_color(
        &self,
        item: &Item,
        color: Option<String>,
    ) -> Result<(), SyncError> {
        let applied = color.clone();
        self.store
            .update_everywhere(&item.uuid, |i| i.color = applied.clone())
            .await;

        let result = self
            .client
            .request(
                "/v1/dir/color",
                json!({ "uuid": item.uuid, "color": color }),
            )
            .await;

        if let Err(e) = result {
            let rollback = item.color.clone();
            self.store
                .update_everywhere(&item.uuid, |i| i.color = rollback.clone())
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Empty the trash. The trash route cache is invalidated wholesale, not
    /// patched.
    pub async fn empty_trash(&self) -> Result<(), SyncError> {
        self.client.request("/v1/trash/empty", json!({})).await?;
        self.store
            .invalidate(&route_key(self.user_id, screen::TRASH, "trash"))
            .await;
        Ok(())
    }

    async fn fanout_into_parent(&self, item: &Item, parent_uuid: &str) {
        let keys = self.master_keys();
        let flags = match crate::reconcile::parent_flags(&self.client, parent_uuid).await {
            Ok(flags) => flags,
            Err(e) => {
                warn!("Parent flag check for {} failed: {}", parent_uuid, e);
                return;
            }
        };
        if !flags.needs_fanout() {
            return;
        }
        match crate::reconcile::propagate_into_parent(
            &self.client,
            self.cipher.as_ref(),
            &keys,
            item,
            &flags,
        )
        .await
        {
            Ok(report) if report.failed > 0 => {
                warn!("Fan-out for {}: {} pushes lost", item.uuid, report.failed)
            }
            Ok(_) => {}
            Err(e) => warn!("Fan-out for {} failed: {}", item.uuid, e),
        }
    }

    // -- Keys ---------------------------------------------------------------

    /// Re-fetch the master-key history. The response carries the key list
    /// sealed under an existing key, pipe-separated inside.
    pub async fn refresh_master_keys(&self) -> Result<usize, SyncError> {
        let current = self.master_keys();
        let key = current
            .first()
            .ok_or_else(|| SyncError::Crypto("no master key".to_string()))?;
        let joined = current
            .iter()
            .map(|k| k.expose_secret().to_string())
            .collect::<Vec<_>>()
            .join("|");
        let sealed = self.cipher.encrypt(&joined, key.expose_secret())?;

        let envelope = self
            .client
            .request("/v1/user/masterKeys", json!({ "masterKeys": sealed }))
            .await?;
        let data: crate::api::types::MasterKeysData = envelope.data_as().map_err(SyncError::Api)?;

        let opened = decrypt_link_key(self.cipher.as_ref(), &current, &data.keys)
            .ok_or_else(|| SyncError::Decrypt("master key list".to_string()))?;
        let keys: Vec<SecretString> = opened
            .split('|')
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.to_string()))
            .collect();
        if keys.is_empty() {
            return Err(SyncError::Decrypt("empty master key list".to_string()));
        }

        let count = keys.len();
        *self.master_keys.write().unwrap() = Arc::new(keys);
        info!("Master key history refreshed ({} keys)", count);
        Ok(count)
    }

    // -- Push events --------------------------------------------------------

    /// Consume one decoded push event from the socket transport.
    pub async fn handle_socket_event(&self, name: &str, data: Value) {
        let Some(event) = SocketEvent::decode(name, data) else {
            debug!("Dropping malformed '{}' event", name);
            return;
        };
        let keys = self.master_keys();
        match events::apply(&self.store, self.cipher.as_ref(), &keys, self.user_id, event).await {
            EventOutcome::Patched(routes) => {
                debug!("'{}' patched {} route(s)", name, routes);
            }
            EventOutcome::Sidecar(event) => {
                let _ = self.sidecar_tx.send(event);
            }
            EventOutcome::CredentialReset => {
                warn!("Server-side credential reset, logging out");
                self.logout().await;
            }
            EventOutcome::Ignored => {}
        }
    }

    // -- Lifecycle ----------------------------------------------------------

    pub fn set_online(&self, online: bool) {
        self.client.set_online(online);
    }

    /// Tear down: cancel in-flight retries, drop every route cache and
    /// cached response, zeroize the key history.
    pub async fn logout(&self) {
        self.cancel.cancel();
        self.store.clear_all().await;
        if let Err(e) = self.docs.clear() {
            warn!("Failed to clear cached responses on logout: {}", e);
        }
        *self.master_keys.write().unwrap() = Arc::new(Vec::new());
        info!("Engine logged out, caches cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::scripted::ScriptedTransport;
    use crate::api::transport::TransportError;
    use crate::crypto::SealedCipher;
    use crate::storage::MemoryStore;

    struct Rig {
        engine: SyncEngine,
        transport: Arc<ScriptedTransport>,
        cipher: SealedCipher,
    }

    fn rig() -> Rig {
        let transport = Arc::new(ScriptedTransport::new());
        let config = EngineConfig {
            retry_delay_ms: 1,
            default_max_attempts: 2,
            ..EngineConfig::default()
        };
        let engine = SyncEngine::new(
            config,
            transport.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(SealedCipher::new()),
            vec![SecretString::from("mk1".to_string())],
            1,
        );
        Rig {
            engine,
            transport,
            cipher: SealedCipher::new(),
        }
    }

    fn sealed_file_meta(cipher: &SealedCipher, name: &str) -> String {
        cipher
            .encrypt(
                &json!({"name": name, "size": 4, "mime": "text/plain", "key": "fk", "lastModified": 7}).to_string(),
                "mk1",
            )
            .unwrap()
    }

    fn listing(cipher: &SealedCipher) -> Value {
        json!({
            "folders": [
                {"uuid": "d1", "name": cipher.encrypt("{\"name\":\"Docs\"}", "mk1").unwrap(), "parent": "base"},
            ],
            "uploads": [
                {"uuid": "f1", "metadata": sealed_file_meta(cipher, "a.txt"), "parent": "base"},
            ],
        })
    }

    #[tokio::test]
    async fn test_load_drive_decrypts_and_caches() {
        let r = rig();
        r.transport.ok("/v1/dir/content", listing(&r.cipher));

        let items = r.engine.load_drive(&ParentId::Base).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "Docs");
        assert_eq!(items[1].name, "a.txt");
        assert_eq!(items[1].key, "fk");

        let route = route_key(1, screen::DRIVE, "base");
        assert!(r.engine.store().contains(&route, "f1").await);
    }

    #[tokio::test]
    async fn test_unchanged_payload_reemits_previous_list() {
        let r = rig();
        r.transport.ok("/v1/dir/content", listing(&r.cipher));
        r.engine.load_drive(&ParentId::Base).await.unwrap();

        // Patch the cached list; an identical payload must re-emit it
        // as-is instead of re-decrypting the records.
        let route = route_key(1, screen::DRIVE, "base");
        r.engine.store().rename(&route, "f1", "patched.txt").await;

        let again = r.engine.load_drive(&ParentId::Base).await.unwrap();
        let file = again.iter().find(|i| i.uuid == "f1").unwrap();
        assert_eq!(file.name, "patched.txt");
    }

    #[tokio::test]
    async fn test_changed_payload_redecrypts() {
        let r = rig();
        r.transport.push(
            "/v1/dir/content",
            Ok(crate::api::types::ApiEnvelope {
                status: true,
                message: None,
                data: Some(listing(&r.cipher)),
            }),
        );
        r.engine.load_drive(&ParentId::Base).await.unwrap();

        // Second fetch returns a different payload.
        r.transport.ok(
            "/v1/dir/content",
            json!({"folders": [], "uploads": [
                {"uuid": "f2", "metadata": sealed_file_meta(&r.cipher, "b.txt"), "parent": "base"},
            ]}),
        );
        let items = r.engine.load_drive(&ParentId::Base).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "b.txt");
    }

    #[tokio::test]
    async fn test_undecryptable_items_are_excluded_not_fatal() {
        let r = rig();
        r.transport.ok(
            "/v1/dir/content",
            json!({"folders": [], "uploads": [
                {"uuid": "good", "metadata": sealed_file_meta(&r.cipher, "ok.txt"), "parent": "base"},
                {"uuid": "bad", "metadata": "002sealed-under-a-retired-key", "parent": "base"},
            ]}),
        );
        let items = r.engine.load_drive(&ParentId::Base).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].uuid, "good");
    }

    #[tokio::test]
    async fn test_create_folder_patches_route_and_encrypts_name() {
        let r = rig();
        r.transport.ok("/v1/dir/content", json!({"folders": [], "uploads": []}));
        r.transport.ok("/v1/dir/create", json!({}));
        r.engine.load_drive(&ParentId::Base).await.unwrap();

        let item = r.engine.create_folder("New Folder", &ParentId::Base).await.unwrap();
        assert_eq!(item.name, "New Folder");

        let route = route_key(1, screen::DRIVE, "base");
        assert!(r.engine.store().contains(&route, &item.uuid).await);

        let calls = r.transport.calls.lock().unwrap();
        let (_, body) = calls.iter().find(|(e, _)| e == "/v1/dir/create").unwrap();
        let opened = r
            .cipher
            .try_decrypt(body["name"].as_str().unwrap(), "mk1")
            .unwrap();
        assert_eq!(opened, "{\"name\":\"New Folder\"}");
        assert_eq!(body["nameHashed"].as_str().unwrap(), hash_name("New Folder"));
    }

    #[tokio::test]
    async fn test_rename_rolls_back_on_gateway_failure() {
        let r = rig();
        let route = route_key(1, screen::DRIVE, "base");
        let item = Item::folder("d1", "Old", ParentId::Base);
        r.engine.store().set(&route, vec![item.clone()], None).await;
        r.transport.sticky("/v1/dir/rename", Err(TransportError::Network("down".into())));

        let result = r.engine.rename_item(&item, "New").await;
        assert!(result.is_err());
        assert_eq!(r.engine.store().get(&route).await.unwrap()[0].name, "Old");
    }

    #[tokio::test]
    async fn test_rename_file_pushes_fresh_metadata() {
        let r = rig();
        let mut item = Item::folder("f1", "old.txt", ParentId::Base);
        item.item_type = ItemType::File;
        item.key = "file-key".into();
        r.transport.ok("/v1/file/rename", json!({}));
        r.transport.ok("/v1/user/shared/item/status", json!({"sharing": false, "users": []}));
        r.transport.ok("/v1/link/status", json!({"link": false, "links": []}));

        r.engine.rename_item(&item, "new.txt").await.unwrap();

        let calls = r.transport.calls.lock().unwrap();
        let (_, body) = calls.iter().find(|(e, _)| e == "/v1/file/rename").unwrap();
        let meta = r
            .cipher
            .try_decrypt(body["metadata"].as_str().unwrap(), "mk1")
            .unwrap();
        assert!(meta.contains("new.txt"));
        assert!(meta.contains("file-key"));
    }

    #[tokio::test]
    async fn test_move_relocates_and_rolls_back() {
        let r = rig();
        let old_route = route_key(1, screen::DRIVE, "base");
        let new_route = route_key(1, screen::DRIVE, "dest");
        let mut item = Item::folder("f1", "doc", ParentId::Base);
        item.item_type = ItemType::File;
        r.engine.store().set(&old_route, vec![item.clone()], None).await;
        r.engine.store().set(&new_route, vec![], None).await;

        // Failure path first: rollback restores the old route.
        r.transport.push("/v1/file/move", Err(TransportError::Network("down".into())));
        r.transport.push("/v1/file/move", Err(TransportError::Network("down".into())));
        assert!(r.engine.move_item(&item, "dest").await.is_err());
        assert!(r.engine.store().contains(&old_route, "f1").await);
        assert!(!r.engine.store().contains(&new_route, "f1").await);

        // Success path: item lands in the destination route.
        r.transport.ok("/v1/file/move", json!({}));
        r.transport.ok("/v1/share/dir/status", json!({"sharing": false, "users": []}));
        r.transport.ok("/v1/link/dir/status", json!({"link": false, "links": []}));
        r.engine.move_item(&item, "dest").await.unwrap();
        assert!(!r.engine.store().contains(&old_route, "f1").await);
        assert!(r.engine.store().contains(&new_route, "f1").await);
    }

    #[tokio::test]
    async fn test_trash_removes_from_every_route() {
        let r = rig();
        let item = Item::folder("d1", "Docs", ParentId::Base);
        r.engine.store().set("1:drive:base", vec![item.clone()], None).await;
        r.engine.store().set("1:favorites:favorites", vec![item.clone()], None).await;
        r.transport.ok("/v1/dir/trash", json!({}));

        r.engine.trash_item(&item).await.unwrap();
        assert!(!r.engine.store().contains("1:drive:base", "d1").await);
        assert!(!r.engine.store().contains("1:favorites:favorites", "d1").await);
    }

    #[tokio::test]
    async fn test_favorite_rolls_back_on_failure() {
        let r = rig();
        let route = route_key(1, screen::DRIVE, "base");
        let item = Item::folder("d1", "Docs", ParentId::Base);
        r.engine.store().set(&route, vec![item.clone()], None).await;
        r.transport.sticky("/v1/item/favorite", Err(TransportError::Network("down".into())));

        assert!(r.engine.favorite_item(&item, true).await.is_err());
        assert!(!r.engine.store().get(&route).await.unwrap()[0].favorited);
    }

    #[tokio::test]
    async fn test_empty_trash_invalidates_route() {
        let r = rig();
        let trash = route_key(1, screen::TRASH, "trash");
        r.engine
            .store()
            .set(&trash, vec![Item::folder("x", "x", ParentId::Trash)], None)
            .await;
        r.transport.ok("/v1/trash/empty", json!({}));

        r.engine.empty_trash().await.unwrap();
        assert!(r.engine.store().get(&trash).await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_master_keys_extends_history() {
        let r = rig();
        let sealed = r.cipher.encrypt("mk0|mk1", "mk1").unwrap();
        r.transport.ok("/v1/user/masterKeys", json!({"keys": sealed}));

        let count = r.engine.refresh_master_keys().await.unwrap();
        assert_eq!(count, 2);
        let keys = r.engine.master_keys();
        assert_eq!(keys[0].expose_secret(), "mk0");
        assert_eq!(keys[1].expose_secret(), "mk1");
    }

    #[tokio::test]
    async fn test_socket_event_patches_store() {
        let r = rig();
        let route = route_key(1, screen::DRIVE, "base");
        let mut item = Item::folder("f1", "old.txt", ParentId::Base);
        item.item_type = ItemType::File;
        r.engine.store().set(&route, vec![item], None).await;

        let metadata = sealed_file_meta(&r.cipher, "pushed.txt");
        r.engine
            .handle_socket_event("file-rename", json!({"uuid": "f1", "metadata": metadata}))
            .await;
        assert_eq!(r.engine.store().get(&route).await.unwrap()[0].name, "pushed.txt");
    }

    #[tokio::test]
    async fn test_sidecar_events_are_broadcast() {
        let r = rig();
        let mut rx = r.engine.subscribe_sidecar();
        r.engine
            .handle_socket_event(
                "chatMessageNew",
                json!({"conversation": "c1", "senderId": 5, "message": "002enc"}),
            )
            .await;

        match rx.try_recv().unwrap() {
            SidecarEvent::ChatMessage(m) => assert_eq!(m.conversation, "c1"),
            other => panic!("unexpected sidecar event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let r = rig();
        r.engine.store().set("1:drive:base", vec![Item::folder("d", "D", ParentId::Base)], None).await;

        r.engine.logout().await;
        assert!(r.engine.store().get("1:drive:base").await.is_none());
        assert!(r.engine.master_keys().is_empty());
        assert!(r.engine.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_credential_rejection_cancels_engine() {
        let r = rig();
        r.transport.sticky(
            "/v1/dir/content",
            Ok(crate::api::types::ApiEnvelope {
                status: false,
                message: Some("Invalid API key".into()),
                data: None,
            }),
        );

        let result = r.engine.load_drive(&ParentId::Base).await;
        assert!(matches!(result, Err(SyncError::InvalidCredentials)));
        assert!(r.engine.cancellation().is_cancelled());
    }
}
