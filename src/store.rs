//! Per-route item cache
//!
//! Each cached view (a folder listing, trash, shared-in, photos, ...) is one
//! route: an ordered list of decrypted items plus a hash of the raw server
//! payload it was built from. Local mutations and socket push events patch
//! routes incrementally; a full refetch whose raw payload hashes identically
//! skips re-decryption entirely.
//!
//! Patch operations are idempotent by contract: removing or renaming a uuid
//! that is not present is a no-op, never an error.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::Item;

/// Screen identifiers used in route keys.
pub mod screen {
    pub const DRIVE: &str = "drive";
    pub const PHOTOS: &str = "photos";
    pub const RECENTS: &str = "recents";
    pub const TRASH: &str = "trash";
    pub const SHARED_IN: &str = "shared-in";
    pub const SHARED_OUT: &str = "shared-out";
    pub const LINKS: &str = "links";
    pub const FAVORITES: &str = "favorites";
    pub const OFFLINE: &str = "offline";
}

/// Compose a route key from user scope, screen and parent/filter state.
///
/// Routes are never shared across users, so the user id is always part of
/// the key.
pub fn route_key(user_id: u64, screen: &str, parent: &str) -> String {
    format!("{}:{}:{}", user_id, screen, parent)
}

#[derive(Debug, Clone, Default)]
struct RouteCache {
    items: Vec<Item>,
    /// SHA-256 of the raw server payload this listing was decrypted from.
    snapshot: Option<String>,
}

/// The item cache store. One per engine.
#[derive(Default)]
pub struct ItemStore {
    routes: RwLock<HashMap<String, RouteCache>>,
}

impl ItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a raw server payload for the no-op fast path.
    pub fn snapshot_of(raw: &str) -> String {
        hex::encode(Sha256::digest(raw.as_bytes()))
    }

    /// `true` when the route's stored snapshot matches this raw payload —
    /// the caller can re-emit the previous decrypted list and skip crypto.
    pub async fn is_unchanged(&self, route: &str, raw: &str) -> bool {
        let routes = self.routes.read().await;
        routes
            .get(route)
            .and_then(|r| r.snapshot.as_deref())
            .map(|s| s == Self::snapshot_of(raw))
            .unwrap_or(false)
    }

    pub async fn get(&self, route: &str) -> Option<Vec<Item>> {
        self.routes.read().await.get(route).map(|r| r.items.clone())
    }

    pub async fn contains(&self, route: &str, uuid: &str) -> bool {
        self.routes
            .read()
            .await
            .get(route)
            .map(|r| r.items.iter().any(|i| i.uuid == uuid))
            .unwrap_or(false)
    }

    /// Replace a route's listing wholesale, recording the payload snapshot.
    pub async fn set(&self, route: &str, items: Vec<Item>, snapshot: Option<String>) {
        let mut routes = self.routes.write().await;
        routes.insert(route.to_string(), RouteCache { items, snapshot });
    }

    /// Add an item to a cached route. If the uuid is already present it is
    /// replaced in place (re-adding is idempotent). Routes that have never
    /// been loaded are left untouched — a later full load owns them.
    pub async fn add(&self, route: &str, item: Item) {
        let mut routes = self.routes.write().await;
        if let Some(cache) = routes.get_mut(route) {
            if let Some(existing) = cache.items.iter_mut().find(|i| i.uuid == item.uuid) {
                *existing = item;
            } else {
                cache.items.push(item);
            }
        }
    }

    /// Like [`add`](Self::add) but inserts at the front (recents-style
    /// ordering).
    pub async fn add_front(&self, route: &str, item: Item) {
        let mut routes = self.routes.write().await;
        if let Some(cache) = routes.get_mut(route) {
            cache.items.retain(|i| i.uuid != item.uuid);
            cache.items.insert(0, item);
        }
    }

    pub async fn remove(&self, route: &str, uuid: &str) {
        let mut routes = self.routes.write().await;
        if let Some(cache) = routes.get_mut(route) {
            cache.items.retain(|i| i.uuid != uuid);
        }
    }

    pub async fn rename(&self, route: &str, uuid: &str, name: &str) {
        let mut routes = self.routes.write().await;
        if let Some(cache) = routes.get_mut(route) {
            if let Some(item) = cache.items.iter_mut().find(|i| i.uuid == uuid) {
                item.name = name.to_string();
            }
        }
    }

    /// Apply a field mutation to one item in one route.
    pub async fn update<F: FnOnce(&mut Item)>(&self, route: &str, uuid: &str, f: F) {
        let mut routes = self.routes.write().await;
        if let Some(cache) = routes.get_mut(route) {
            if let Some(item) = cache.items.iter_mut().find(|i| i.uuid == uuid) {
                f(item);
            }
        }
    }

    // -- Cross-route patches (socket events) --------------------------------
    //
    // A push event must land in every cached view referencing the uuid:
    // a file can sit in its folder's route, recents and favorites at once.

    /// Remove the uuid from every route containing it. Returns the number of
    /// routes touched.
    pub async fn remove_everywhere(&self, uuid: &str) -> usize {
        let mut routes = self.routes.write().await;
        let mut touched = 0;
        for cache in routes.values_mut() {
            let before = cache.items.len();
            cache.items.retain(|i| i.uuid != uuid);
            if cache.items.len() != before {
                touched += 1;
            }
        }
        touched
    }

    pub async fn rename_everywhere(&self, uuid: &str, name: &str) -> usize {
        self.update_everywhere(uuid, |item| item.name = name.to_string())
            .await
    }

    /// Apply a field mutation to the uuid in every route containing it.
    pub async fn update_everywhere(&self, uuid: &str, f: impl Fn(&mut Item)) -> usize {
        let mut routes = self.routes.write().await;
        let mut touched = 0;
        for cache in routes.values_mut() {
            if let Some(item) = cache.items.iter_mut().find(|i| i.uuid == uuid) {
                f(item);
                touched += 1;
            }
        }
        touched
    }

    pub async fn routes_containing(&self, uuid: &str) -> Vec<String> {
        let routes = self.routes.read().await;
        let mut keys: Vec<String> = routes
            .iter()
            .filter(|(_, cache)| cache.items.iter().any(|i| i.uuid == uuid))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    // -- Invalidation -------------------------------------------------------

    /// Drop one route wholesale (empty-trash, camera-upload reset).
    pub async fn invalidate(&self, route: &str) {
        self.routes.write().await.remove(route);
    }

    /// Drop every route. Used on logout.
    pub async fn clear_all(&self) {
        self.routes.write().await.clear();
    }
}
