//! Local persistence contracts
//!
//! Two stores back the engine: a key-value store for small scalars and flags
//! (`KvStore`) and a document store for larger cached collections such as
//! route listings and gateway response snapshots (`DocStore`). Both speak
//! JSON-serializable values keyed by string; the engine never touches the
//! filesystem directly.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

use crate::types::SyncError;

/// Small scalars and flags (counters, toggles, fingerprints).
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<(), SyncError>;
    fn remove(&self, key: &str) -> Result<(), SyncError>;
}

/// Larger cached collections (listings, cached gateway responses).
pub trait DocStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value) -> Result<(), SyncError>;
    fn remove(&self, key: &str) -> Result<(), SyncError>;
    /// Drop every stored document. Used on logout.
    fn clear(&self) -> Result<(), SyncError>;
}

/// Typed read helper shared by both store kinds.
pub fn get_typed<T: DeserializeOwned>(value: Option<Value>) -> Option<T> {
    value.and_then(|v| serde_json::from_value(v).ok())
}

/// Typed write helper.
pub fn to_value<T: Serialize>(value: &T) -> Result<Value, SyncError> {
    serde_json::to_value(value).map_err(|e| SyncError::Storage(e.to_string()))
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory store used by tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SyncError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

impl DocStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SyncError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), SyncError> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JsonFileStore
// ---------------------------------------------------------------------------

/// One JSON file per key under a directory.
///
/// Keys may contain characters that are not filename-safe (`:`, `/`), so the
/// filename is the SHA-256 of the key. Writes are atomic: temp file + rename.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (creating the directory if needed).
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{}.json", digest))
    }

    fn read(&self, key: &str) -> Option<Value> {
        let path = self.path_for(key);
        let contents = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Discarding unparseable cache entry {}: {}", path.display(), e);
                None
            }
        }
    }

    fn write(&self, key: &str, value: &Value) -> Result<(), SyncError> {
        let path = self.path_for(key);
        let json =
            serde_json::to_string(value).map_err(|e| SyncError::Storage(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), SyncError> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_all(&self) -> Result<(), SyncError> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.read(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SyncError> {
        self.write(key, &value)
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.delete(key)
    }
}

impl DocStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.read(key)
    }

    fn set(&self, key: &str, value: Value) -> Result<(), SyncError> {
        self.write(key, &value)
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.delete(key)
    }

    fn clear(&self) -> Result<(), SyncError> {
        self.delete_all()
    }
}
