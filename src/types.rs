//! Shared domain types for the sync engine
//!
//! This module contains the decrypted item records the engine operates on,
//! the parent sentinel type, and the error taxonomy shared across modules.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of a drive item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    File,
    Folder,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemType::File => write!(f, "file"),
            ItemType::Folder => write!(f, "folder"),
        }
    }
}

/// Parent of an item: a concrete folder uuid or one of the wire sentinels
/// (`"base"`, `"trash"`, `"recents"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParentId {
    Base,
    Trash,
    Recents,
    Folder(String),
}

impl ParentId {
    /// The string sent on the wire for this parent.
    pub fn as_wire(&self) -> &str {
        match self {
            ParentId::Base => "base",
            ParentId::Trash => "trash",
            ParentId::Recents => "recents",
            ParentId::Folder(uuid) => uuid,
        }
    }
}

impl From<String> for ParentId {
    fn from(s: String) -> Self {
        match s.as_str() {
            "base" => ParentId::Base,
            "trash" => ParentId::Trash,
            "recents" => ParentId::Recents,
            _ => ParentId::Folder(s),
        }
    }
}

impl From<ParentId> for String {
    fn from(p: ParentId) -> Self {
        p.as_wire().to_string()
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_wire())
    }
}

/// A decrypted file or folder record as held in the route caches.
///
/// `uuid` is globally unique and stable across rename/move. For files, `key`
/// is the per-file content key and never changes for a given uuid — rename
/// re-encrypts metadata, not content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub uuid: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mime: String,
    /// Per-file symmetric content key (files only; empty for folders).
    #[serde(default)]
    pub key: String,
    /// Milliseconds since epoch.
    #[serde(default)]
    pub last_modified: i64,
    pub parent: ParentId,
    #[serde(default)]
    pub favorited: bool,
    /// Folder label color (folders only).
    #[serde(default)]
    pub color: Option<String>,
    /// Present only in shared-in views.
    #[serde(default)]
    pub receiver_id: Option<u64>,
    /// Present only in shared-out views.
    #[serde(default)]
    pub sharer_id: Option<u64>,
    /// Whether the file is pinned for offline use (files only).
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub chunks: u32,
    #[serde(default)]
    pub rm: String,
}

impl Item {
    /// Empty folder skeleton; callers fill the fields they know.
    pub fn folder(uuid: impl Into<String>, name: impl Into<String>, parent: ParentId) -> Self {
        Self {
            uuid: uuid.into(),
            item_type: ItemType::Folder,
            name: name.into(),
            size: 0,
            mime: String::new(),
            key: String::new(),
            last_modified: 0,
            parent,
            favorited: false,
            color: None,
            receiver_id: None,
            sharer_id: None,
            offline: false,
            region: String::new(),
            bucket: String::new(),
            chunks: 0,
            rm: String::new(),
        }
    }

    pub fn is_file(&self) -> bool {
        self.item_type == ItemType::File
    }
}

/// Decrypted file metadata as carried inside the encrypted `metadata` blob:
/// `{"name":..., "size":..., "mime":..., "key":..., "lastModified":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mime: String,
    pub key: String,
    #[serde(rename = "lastModified", default)]
    pub last_modified: Option<i64>,
}

/// Engine error taxonomy.
///
/// `Network` is transient and retried by the gateway; `Api` is an
/// application-level rejection and never retried. Per-item decryption
/// failures do not surface here at all — they exclude the item from the
/// listing instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    Network(String),

    #[error("api error: {0}")]
    Api(String),

    #[error("invalid or expired credentials")]
    InvalidCredentials,

    #[error("metadata decryption failed: {0}")]
    Decrypt(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("camera upload is disabled")]
    Disabled,

    #[error("remote folder missing or trashed: {0}")]
    MissingRemoteFolder(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
