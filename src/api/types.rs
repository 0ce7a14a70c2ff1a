//! Wire types for the gateway API
//!
//! Every response arrives as an envelope `{status, message, data}`; the
//! payload shapes below are validated once at this boundary so the rest of
//! the engine works with typed records. Name/metadata fields are still
//! ciphertext here — decryption happens in the pipeline, not in serde.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic gateway response envelope.
///
/// `status: false` is an application-level rejection and is never retried;
/// `message` carries the server's reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub status: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ApiEnvelope {
    /// Deserialize the `data` payload into a typed record.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| format!("payload shape: {}", e))
    }
}

/// An encrypted folder record as returned by listing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRecord {
    pub uuid: String,
    /// Encrypted name (JSON `{"name":...}` or legacy raw string inside).
    pub name: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub favorited: u8,
    #[serde(default)]
    pub color: Option<String>,
}

/// An encrypted file record as returned by listing endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub uuid: String,
    /// Encrypted JSON: `{name, size, mime, key, lastModified}`.
    pub metadata: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub chunks: u32,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub favorited: u8,
    #[serde(default)]
    pub rm: String,
    #[serde(rename = "receiverId", default)]
    pub receiver_id: Option<u64>,
    #[serde(rename = "sharerId", default)]
    pub sharer_id: Option<u64>,
}

/// `/v1/dir/content` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirContentData {
    #[serde(default)]
    pub folders: Vec<FolderRecord>,
    #[serde(default)]
    pub uploads: Vec<FileRecord>,
}

/// `/v1/download/dir` payload: a folder's full subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirDownloadData {
    #[serde(default)]
    pub folders: Vec<FolderRecord>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

/// `/v1/user/baseFolders` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseFoldersData {
    #[serde(default)]
    pub folders: Vec<FolderRecord>,
}

/// One share recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareUser {
    pub id: u64,
    pub email: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// `/v1/share/dir/status` payload: is this folder shared, and with whom.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShareStatusData {
    #[serde(default)]
    pub sharing: bool,
    #[serde(default)]
    pub users: Vec<ShareUser>,
}

/// One active public link on a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    #[serde(rename = "linkUUID")]
    pub link_uuid: String,
    /// Link's symmetric key, sealed under the owner's master keys.
    #[serde(rename = "linkKey")]
    pub link_key: String,
}

/// `/v1/link/dir/status` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkStatusData {
    #[serde(default)]
    pub link: bool,
    #[serde(default)]
    pub links: Vec<LinkInfo>,
}

/// `/v1/user/shared/item/status` payload: is this item itself shared.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedItemStatusData {
    #[serde(default)]
    pub sharing: bool,
    #[serde(default)]
    pub users: Vec<ShareUser>,
}

/// `/v1/link/status` payload: is this item in any public link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkedItemStatusData {
    #[serde(default)]
    pub link: bool,
    #[serde(default)]
    pub links: Vec<LinkInfo>,
}

/// `/v1/dir/size` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirSizeData {
    #[serde(default)]
    pub size: u64,
}

/// `/v1/user/masterKeys` payload: the key history, sealed under the newest
/// master key, pipe-separated inside.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterKeysData {
    #[serde(default)]
    pub keys: String,
}

/// `/v1/user/keyPair/info` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyPairInfoData {
    #[serde(rename = "publicKey", default)]
    pub public_key: String,
    #[serde(rename = "privateKey", default)]
    pub private_key: String,
}
