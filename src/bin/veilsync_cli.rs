//! VeilSync CLI — operator tool for the sync engine
//!
//! Usage:
//!   veilsync-cli status                          Show effective config
//!   veilsync-cli ls [parent]                     List a folder via the engine
//!   veilsync-cli camera-scan <dir> <folder-uuid> One camera cycle over a local dir

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use secrecy::SecretString;

use veilsync::api::transport::HttpTransport;
use veilsync::camera::{
    CameraUploader, MediaAsset, MediaFilter, MediaKind, MediaLibrary, PassthroughConverter,
};
use veilsync::config::{config_path, load_config};
use veilsync::storage::JsonFileStore;
use veilsync::transfer::{TransferQueue, UploadRequest};
use veilsync::{Item, ParentId, SyncEngine, SyncError};

#[derive(Parser)]
#[command(
    name = "veilsync-cli",
    about = "VeilSync CLI — offline sync engine operator tool",
    version
)]
struct Cli {
    /// Gateway base URL (defaults to the configured one)
    #[arg(long)]
    gateway: Option<String>,

    /// API key for the gateway (required for ls / camera-scan)
    #[arg(long)]
    api_key: Option<String>,

    /// Master key, oldest first; repeat for the full key history
    #[arg(long = "master-key")]
    master_keys: Vec<String>,

    /// User id used to scope caches
    #[arg(long, default_value_t = 0)]
    user_id: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective engine configuration
    Status,
    /// List a folder (default: base)
    Ls {
        /// Parent folder uuid, or one of base/trash/recents
        #[arg(default_value = "base")]
        parent: String,
    },
    /// Run one camera upload cycle over a local directory
    CameraScan {
        /// Directory holding the media assets
        dir: PathBuf,
        /// Remote camera folder uuid
        folder: String,
    },
}

/// Media library over a plain directory: every regular file with a media
/// extension is an asset, identified by its filename.
struct DirMediaLibrary {
    dir: PathBuf,
}

const MEDIA_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "heic", "heif", "mp4", "mov"];

#[async_trait]
impl MediaLibrary for DirMediaLibrary {
    async fn enumerate(&self, filter: &MediaFilter) -> Result<Vec<MediaAsset>, SyncError> {
        let mut assets = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            if !MEDIA_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }
            let kind = match ext.as_str() {
                "mp4" | "mov" => MediaKind::Video,
                _ => MediaKind::Photo,
            };
            match kind {
                MediaKind::Photo if !filter.photos => continue,
                MediaKind::Video if !filter.videos => continue,
                _ => {}
            }
            let meta = entry.metadata()?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let taken_at = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            assets.push(MediaAsset {
                id: name.clone(),
                name,
                path: path.to_string_lossy().to_string(),
                size: meta.len(),
                taken_at,
                kind,
            });
        }
        assets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(assets)
    }
}

/// Prints what would be handed to the transfer subsystem. The CLI has no
/// chunk uploader; the app wires its own.
struct PrintQueue;

#[async_trait]
impl TransferQueue for PrintQueue {
    async fn queue_upload(&self, request: UploadRequest) -> Result<(), SyncError> {
        println!(
            "  queue upload: {} ({} bytes, {}) hash={}...",
            request.name,
            request.size,
            request.mime,
            &request.content_hash[..16]
        );
        Ok(())
    }

    async fn queue_download(&self, item: &Item, destination: &str) -> Result<(), SyncError> {
        println!("  queue download: {} -> {}", item.uuid, destination);
        Ok(())
    }
}

fn cache_dir() -> Result<PathBuf> {
    let base = dirs::cache_dir().context("cannot determine cache directory")?;
    Ok(base.join("veilsync"))
}

fn build_engine(cli: &Cli) -> Result<SyncEngine> {
    let path = config_path().map_err(anyhow::Error::msg)?;
    let mut config = load_config(&path);
    if let Some(gateway) = &cli.gateway {
        config.gateway_url = gateway.clone();
    }

    let Some(api_key) = &cli.api_key else {
        bail!("--api-key is required for this command");
    };
    if cli.master_keys.is_empty() {
        bail!("at least one --master-key is required for this command");
    }

    let transport = Arc::new(HttpTransport::new(
        config.gateway_url.clone(),
        SecretString::from(api_key.clone()),
    ));
    let cache = cache_dir()?;
    let kv = Arc::new(JsonFileStore::open(cache.join("kv"))?);
    let docs = Arc::new(JsonFileStore::open(cache.join("docs"))?);
    let keys: Vec<SecretString> = cli
        .master_keys
        .iter()
        .map(|k| SecretString::from(k.clone()))
        .collect();

    Ok(SyncEngine::new(
        config,
        transport,
        kv,
        docs,
        Arc::new(veilsync::crypto::SealedCipher::new()),
        keys,
        cli.user_id,
    ))
}

fn print_items(items: &[Item]) {
    for item in items {
        let kind = match item.item_type {
            veilsync::ItemType::Folder => "dir ",
            veilsync::ItemType::File => "file",
        };
        println!("{}  {:>12}  {}  {}", kind, item.size, item.uuid, item.name);
    }
    println!("{} item(s)", items.len());
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Status => {
            let path = config_path().map_err(anyhow::Error::msg)?;
            let config = load_config(&path);
            println!("config file : {}", path.display());
            println!("gateway     : {}", config.gateway_url);
            println!(
                "retry       : {} ms fixed delay, {} attempts cacheable / {} otherwise",
                config.retry_delay_ms, config.cacheable_max_attempts, config.default_max_attempts
            );
            println!(
                "limiters    : {} request permits, {} fan-out permits",
                config.request_permits, config.fanout_permits
            );
            println!(
                "camera      : every {} ms, max {} per cycle, HEIC upload {}",
                config.camera_interval_ms,
                config.camera_max_queue,
                if config.camera_upload_heic { "on" } else { "off" }
            );
            Ok(())
        }
        Commands::Ls { parent } => {
            let engine = build_engine(&cli)?;
            let parent = ParentId::from(parent.clone());
            let items = engine
                .load_drive(&parent)
                .await
                .with_context(|| format!("listing {}", parent))?;
            print_items(&items);
            Ok(())
        }
        Commands::CameraScan { dir, folder } => {
            if !Path::new(dir).is_dir() {
                bail!("{} is not a directory", dir.display());
            }
            let engine = build_engine(&cli)?;
            let scratch = cache_dir()?.join("camera-scratch");

            let uploader = CameraUploader::new(
                engine.client().clone(),
                Arc::new(veilsync::crypto::SealedCipher::new()),
                engine.master_keys(),
                engine.kv().clone(),
                engine.store().clone(),
                Arc::new(DirMediaLibrary { dir: dir.clone() }),
                Arc::new(PrintQueue),
                Arc::new(PassthroughConverter),
                scratch,
                cli.user_id,
                folder.clone(),
                MediaFilter { photos: true, videos: true },
                engine.config(),
                engine.cancellation().clone(),
            );
            uploader.enable()?;

            let report = uploader.run_once().await?;
            println!(
                "scan: {} total, {} present, {} queued, {} deferred, {} failed{}",
                report.total,
                report.already_present,
                report.queued,
                report.deferred,
                report.failed,
                if report.timed_out { " (timed out)" } else { "" }
            );
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    run(cli).await
}
