//! Transfer subsystem contract
//!
//! Chunked upload/download itself (ingest/egest traffic, chunk encryption)
//! is an external collaborator. The engine only enqueues work through this
//! trait: the camera queue enqueues uploads with a precomputed content hash
//! so the remote dedup check can short-circuit, and the offline checker
//! re-queues downloads when it detects version drift.

use async_trait::async_trait;

use crate::types::{Item, SyncError};

/// An upload handed to the transfer subsystem.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadRequest {
    /// Scratch path holding the (possibly converted) bytes to upload.
    pub source_path: String,
    pub name: String,
    /// Target folder uuid.
    pub parent: String,
    pub mime: String,
    pub size: u64,
    /// Milliseconds since epoch.
    pub last_modified: i64,
    /// SHA-512 hex of the content, for remote dedup.
    pub content_hash: String,
}

#[async_trait]
pub trait TransferQueue: Send + Sync {
    /// Enqueue an upload. Resolves once the transfer subsystem has accepted
    /// the job, not once the upload finishes.
    async fn queue_upload(&self, request: UploadRequest) -> Result<(), SyncError>;

    /// Enqueue a (re-)download of a remote file to a local destination.
    async fn queue_download(&self, item: &Item, destination: &str) -> Result<(), SyncError>;
}
