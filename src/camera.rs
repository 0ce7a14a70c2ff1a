//! Camera / background upload queue
//!
//! Diffs the local media library against the remote camera folder and
//! enqueues what is missing. The cycle is `idle → scanning → diffing →
//! uploading → idle`, re-entered on a timer or run once (time-boxed) when
//! triggered as a background fetch.
//!
//! Dedup happens in two steps, cheap first: a case-insensitive filename
//! match against the remote folder, then a content-hash comparison against
//! the persisted set of previously uploaded hashes. An asset present
//! remotely by either check is never re-uploaded.

use async_trait::async_trait;
use futures_util::future::join_all;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::types::DirContentData;
use crate::api::ApiClient;
use crate::config::EngineConfig;
use crate::crypto::{content_hash, MetadataCipher};
use crate::decrypt::decrypt_file_metadata;
use crate::storage::{get_typed, KvStore};
use crate::store::{route_key, screen, ItemStore};
use crate::transfer::{TransferQueue, UploadRequest};
use crate::types::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

/// One asset in the local media library.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaAsset {
    /// Stable library-assigned identifier.
    pub id: String,
    pub name: String,
    /// Readable path to the asset bytes.
    pub path: String,
    pub size: u64,
    /// Milliseconds since epoch.
    pub taken_at: i64,
    pub kind: MediaKind,
}

/// Which asset kinds the user has opted into uploading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MediaFilter {
    pub photos: bool,
    pub videos: bool,
}

impl Default for MediaFilter {
    fn default() -> Self {
        Self { photos: true, videos: false }
    }
}

/// Local media library access (platform collaborator).
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    async fn enumerate(&self, filter: &MediaFilter) -> Result<Vec<MediaAsset>, SyncError>;
}

/// Converts an asset into its upload form in the scratch directory
/// (HEIC → JPEG on platforms that want it). Returns the converted path.
pub trait MediaConverter: Send + Sync {
    fn convert(&self, asset: &MediaAsset, scratch_dir: &Path) -> Result<PathBuf, SyncError>;
}

/// Default converter: a plain copy, no transcoding.
pub struct PassthroughConverter;

impl MediaConverter for PassthroughConverter {
    fn convert(&self, asset: &MediaAsset, scratch_dir: &Path) -> Result<PathBuf, SyncError> {
        let dest = scratch_dir.join(&asset.name);
        std::fs::copy(&asset.path, &dest)?;
        Ok(dest)
    }
}

/// Cheap monotonic fingerprint of one library enumeration. Identical
/// fingerprints mean the library has not changed since the last full pass,
/// so the whole cycle can be skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFingerprint {
    pub count: usize,
    pub first: String,
    pub last: String,
}

impl ScanFingerprint {
    pub fn of(assets: &[MediaAsset]) -> Self {
        Self {
            count: assets.len(),
            first: assets.first().map(|a| a.id.clone()).unwrap_or_default(),
            last: assets.last().map(|a| a.id.clone()).unwrap_or_default(),
        }
    }
}

/// Where the uploader currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraState {
    Idle,
    Scanning,
    Diffing,
    Uploading,
}

/// Outcome of one scan cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Library assets matching the filter.
    pub total: usize,
    /// Present remotely already (by name or hash).
    pub already_present: usize,
    /// Handed to the transfer subsystem this cycle.
    pub queued: usize,
    /// Candidates beyond the per-cycle bound; next tick picks them up.
    pub deferred: usize,
    /// Per-asset failures this cycle.
    pub failed: usize,
    /// Assets skipped because their failure counter is exhausted.
    pub skipped_failed: usize,
    /// The enumeration fingerprint matched — nothing was diffed.
    pub fingerprint_hit: bool,
    /// The run-once time box expired before the cycle finished.
    pub timed_out: bool,
}

/// The camera upload engine. All state that the original design kept in
/// module globals (`FAILED`, the running flag) lives on this struct; tests
/// construct as many instances as they like.
pub struct CameraUploader {
    client: Arc<ApiClient>,
    cipher: Arc<dyn MetadataCipher>,
    master_keys: Arc<Vec<SecretString>>,
    kv: Arc<dyn KvStore>,
    store: Arc<ItemStore>,
    media: Arc<dyn MediaLibrary>,
    queue: Arc<dyn TransferQueue>,
    converter: Arc<dyn MediaConverter>,
    scratch_dir: PathBuf,
    user_id: u64,
    folder_uuid: String,
    filter: MediaFilter,
    interval: Duration,
    run_once_timebox: Duration,
    max_queue: usize,
    max_failed: u32,
    upload_heic: bool,
    /// Per-asset failure counters, process-lifetime only: a restart retries
    /// each failed asset once more.
    failed: Mutex<HashMap<String, u32>>,
    state: Mutex<CameraState>,
    cancel: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl CameraUploader {
    pub fn new(
        client: Arc<ApiClient>,
        cipher: Arc<dyn MetadataCipher>,
        master_keys: Arc<Vec<SecretString>>,
        kv: Arc<dyn KvStore>,
        store: Arc<ItemStore>,
        media: Arc<dyn MediaLibrary>,
        queue: Arc<dyn TransferQueue>,
        converter: Arc<dyn MediaConverter>,
        scratch_dir: PathBuf,
        user_id: u64,
        folder_uuid: String,
        filter: MediaFilter,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            cipher,
            master_keys,
            kv,
            store,
            media,
            queue,
            converter,
            scratch_dir,
            user_id,
            folder_uuid,
            filter,
            interval: Duration::from_millis(config.camera_interval_ms),
            run_once_timebox: Duration::from_millis(config.camera_run_once_ms),
            max_queue: config.camera_max_queue,
            max_failed: config.camera_max_failed,
            upload_heic: config.camera_upload_heic,
            failed: Mutex::new(HashMap::new()),
            state: Mutex::new(CameraState::Idle),
            cancel,
        }
    }

    pub fn state(&self) -> CameraState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: CameraState) {
        *self.state.lock().unwrap() = state;
    }

    // -- Persisted per-user state -------------------------------------------

    fn key(&self, name: &str) -> String {
        format!("{}:{}", name, self.user_id)
    }

    pub fn is_enabled(&self) -> bool {
        get_typed::<bool>(self.kv.get(&self.key("cameraUploadEnabled"))).unwrap_or(false)
    }

    pub fn enable(&self) -> Result<(), SyncError> {
        self.kv.set(&self.key("cameraUploadEnabled"), json!(true))
    }

    /// Disable the feature. With `reset`, wipe counters, the enumeration
    /// fingerprint and the uploaded-hash set, and drop the photos route
    /// cache.
    pub async fn disable(&self, reset: bool) -> Result<(), SyncError> {
        self.kv.set(&self.key("cameraUploadEnabled"), json!(false))?;
        if reset {
            self.kv.remove(&self.key("cameraUploadTotal"))?;
            self.kv.remove(&self.key("cameraUploadUploaded"))?;
            self.kv.remove(&self.key("cameraUploadLastProcessed"))?;
            self.kv.remove(&self.key("cameraUploadRemoteHashes"))?;
            self.store
                .invalidate(&route_key(self.user_id, screen::PHOTOS, "photos"))
                .await;
        }
        Ok(())
    }

    pub fn counters(&self) -> (u64, u64) {
        let total = get_typed::<u64>(self.kv.get(&self.key("cameraUploadTotal"))).unwrap_or(0);
        let uploaded =
            get_typed::<u64>(self.kv.get(&self.key("cameraUploadUploaded"))).unwrap_or(0);
        (total, uploaded)
    }

    fn set_counters(&self, total: u64, uploaded: u64) -> Result<(), SyncError> {
        self.kv.set(&self.key("cameraUploadTotal"), json!(total))?;
        self.kv.set(&self.key("cameraUploadUploaded"), json!(uploaded))
    }

    fn last_processed(&self) -> Option<ScanFingerprint> {
        get_typed(self.kv.get(&self.key("cameraUploadLastProcessed")))
    }

    fn remote_hashes(&self) -> HashMap<String, bool> {
        get_typed(self.kv.get(&self.key("cameraUploadRemoteHashes"))).unwrap_or_default()
    }

    fn persist_remote_hashes(&self, hashes: &HashMap<String, bool>) -> Result<(), SyncError> {
        self.kv
            .set(&self.key("cameraUploadRemoteHashes"), serde_json::to_value(hashes).map_err(|e| SyncError::Storage(e.to_string()))?)
    }

    // -- Cycle --------------------------------------------------------------

    /// Fetch the remote camera folder and collect the lowercase names of
    /// everything already in it. A missing or trashed folder is fatal for
    /// the whole feature.
    async fn remote_names(&self) -> Result<HashSet<String>, SyncError> {
        let env = match self
            .client
            .request("/v1/dir/content", json!({ "uuid": self.folder_uuid }))
            .await
        {
            Ok(env) => env,
            Err(SyncError::Api(msg)) => {
                let lower = msg.to_lowercase();
                if lower.contains("not found") || lower.contains("trash") {
                    warn!("Camera folder {} is gone ({}), force-disabling", self.folder_uuid, msg);
                    self.disable(true).await?;
                    return Err(SyncError::MissingRemoteFolder(self.folder_uuid.clone()));
                }
                return Err(SyncError::Api(msg));
            }
            Err(e) => return Err(e),
        };

        let content: DirContentData = env.data_as().map_err(SyncError::Api)?;
        let mut names = HashSet::new();
        for file in &content.uploads {
            if let Some(meta) =
                decrypt_file_metadata(self.cipher.as_ref(), &self.master_keys, &file.metadata, &file.uuid)
            {
                names.insert(meta.name.to_lowercase());
            }
        }
        Ok(names)
    }

    fn wants_conversion(&self, asset: &MediaAsset) -> bool {
        if self.upload_heic || asset.kind != MediaKind::Photo {
            return false;
        }
        let lower = asset.name.to_lowercase();
        lower.ends_with(".heic") || lower.ends_with(".heif")
    }

    /// Copy (or convert) one asset into the scratch directory and build its
    /// upload request.
    fn prepare_upload(&self, asset: &MediaAsset) -> Result<UploadRequest, SyncError> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let staged = if self.wants_conversion(asset) {
            self.converter.convert(asset, &self.scratch_dir)?
        } else {
            let dest = self.scratch_dir.join(&asset.name);
            std::fs::copy(&asset.path, &dest)?;
            dest
        };

        let name = staged
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| asset.name.clone());
        let bytes = std::fs::read(&staged)?;
        let hash = content_hash(&bytes);
        let mime = mime_guess::from_path(&name).first_or_octet_stream().to_string();

        Ok(UploadRequest {
            source_path: staged.to_string_lossy().to_string(),
            name,
            parent: self.folder_uuid.clone(),
            mime,
            size: bytes.len() as u64,
            last_modified: asset.taken_at,
            content_hash: hash,
        })
    }

    /// One full scan/diff/upload cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        if !self.is_enabled() {
            return Err(SyncError::Disabled);
        }

        self.set_state(CameraState::Scanning);
        let result = self.cycle_inner().await;
        self.set_state(CameraState::Idle);
        result
    }

    async fn cycle_inner(&self) -> Result<CycleReport, SyncError> {
        let remote_names = self.remote_names().await?;
        let assets = self.media.enumerate(&self.filter).await?;
        let mut report = CycleReport {
            total: assets.len(),
            ..CycleReport::default()
        };

        // Fingerprint short-circuit: unchanged library means everything was
        // handled on a previous pass.
        let fingerprint = ScanFingerprint::of(&assets);
        if self.last_processed().as_ref() == Some(&fingerprint) {
            debug!("Camera scan fingerprint unchanged ({} assets), skipping", assets.len());
            self.set_counters(assets.len() as u64, assets.len() as u64)?;
            report.already_present = assets.len();
            report.fingerprint_hit = true;
            return Ok(report);
        }

        self.set_state(CameraState::Diffing);
        let mut remote_hashes = self.remote_hashes();
        let mut candidates: Vec<(MediaAsset, String)> = Vec::new();

        for asset in &assets {
            let failures = self.failed.lock().unwrap().get(&asset.id).copied().unwrap_or(0);
            if failures >= self.max_failed {
                report.skipped_failed += 1;
                continue;
            }

            // Cheap check first: case-insensitive filename.
            if remote_names.contains(&asset.name.to_lowercase()) {
                report.already_present += 1;
                continue;
            }

            // Expensive check: content hash.
            let bytes = match std::fs::read(&asset.path) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Cannot read asset {} ({}): {}", asset.id, asset.path, e);
                    *self.failed.lock().unwrap().entry(asset.id.clone()).or_insert(0) += 1;
                    report.failed += 1;
                    continue;
                }
            };
            let hash = content_hash(&bytes);
            if remote_hashes.contains_key(&hash) {
                report.already_present += 1;
                continue;
            }

            candidates.push((asset.clone(), hash));
        }

        self.set_state(CameraState::Uploading);
        let batch: Vec<_> = candidates.drain(..candidates.len().min(self.max_queue)).collect();
        report.deferred = candidates.len();

        let uploads = batch.iter().map(|(asset, hash)| {
            let prepared = self.prepare_upload(asset);
            async move {
                match prepared {
                    Ok(request) => (asset, hash, self.queue.queue_upload(request).await),
                    Err(e) => (asset, hash, Err(e)),
                }
            }
        });

        for (asset, hash, result) in join_all(uploads).await {
            match result {
                Ok(()) => {
                    report.queued += 1;
                    remote_hashes.insert(hash.clone(), true);
                }
                Err(e) => {
                    warn!("Camera upload of {} failed: {}", asset.name, e);
                    *self.failed.lock().unwrap().entry(asset.id.clone()).or_insert(0) += 1;
                    report.failed += 1;
                }
            }
        }

        self.persist_remote_hashes(&remote_hashes)?;
        self.set_counters(
            report.total as u64,
            (report.already_present + report.queued) as u64,
        )?;

        // Only remember the enumeration once nothing is left pending; a
        // stored fingerprint means "this library state is fully uploaded".
        if report.deferred == 0 && report.failed == 0 && report.skipped_failed == 0 {
            self.kv.set(
                &self.key("cameraUploadLastProcessed"),
                serde_json::to_value(&fingerprint).map_err(|e| SyncError::Storage(e.to_string()))?,
            )?;
        }

        info!(
            "Camera cycle: {} total, {} present, {} queued, {} deferred, {} failed",
            report.total, report.already_present, report.queued, report.deferred, report.failed
        );
        Ok(report)
    }

    /// One time-boxed cycle, for background-fetch triggers. On expiry the
    /// partial work stands (queued uploads keep running in the transfer
    /// subsystem) and the report says so.
    pub async fn run_once(&self) -> Result<CycleReport, SyncError> {
        match tokio::time::timeout(self.run_once_timebox, self.run_cycle()).await {
            Ok(result) => result,
            Err(_) => {
                self.set_state(CameraState::Idle);
                Ok(CycleReport {
                    timed_out: true,
                    ..CycleReport::default()
                })
            }
        }
    }

    /// Timer loop: a cycle every `interval`, until cancelled. Cycle errors
    /// are logged and the loop keeps going — except a dead credential or a
    /// vanished target folder, which stop it.
    pub async fn run(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.run_cycle().await {
                Ok(_) => {}
                Err(SyncError::Disabled) | Err(SyncError::MissingRemoteFolder(_)) => {
                    info!("Camera upload stopped");
                    return;
                }
                Err(SyncError::InvalidCredentials) | Err(SyncError::Cancelled) => return,
                Err(e) => warn!("Camera cycle failed: {}", e),
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
