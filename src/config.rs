//! Engine configuration
//!
//! Persisted to a single JSON file (`engine_config.json` under the platform
//! config dir by default). Unparseable or missing files fall back to
//! defaults with a warning rather than failing startup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// Tunables for the gateway, reconciliation fan-out and camera upload loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Gateway base URL, e.g. `https://gateway.example.com`.
    pub gateway_url: String,
    /// Fixed delay between gateway retries, in milliseconds.
    pub retry_delay_ms: u64,
    /// Max attempts for allow-listed (cacheable) read endpoints.
    pub cacheable_max_attempts: u32,
    /// Max attempts for everything else. High on purpose: mutating calls
    /// should not silently give up.
    pub default_max_attempts: u32,
    /// Permits on the general request semaphore.
    pub request_permits: usize,
    /// Permits on the share/link fan-out semaphore.
    pub fanout_permits: usize,
    /// Camera upload scan interval in milliseconds.
    pub camera_interval_ms: u64,
    /// Total time box for a background-fetch camera run, in milliseconds.
    pub camera_run_once_ms: u64,
    /// Max simultaneous asset uploads per scan cycle.
    pub camera_max_queue: usize,
    /// Attempts per asset before it is skipped for the rest of the process.
    pub camera_max_failed: u32,
    /// When `false`, HEIC photos are converted to JPEG before upload.
    pub camera_upload_heic: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gateway_url: "https://gateway.veilsync.io".to_string(),
            retry_delay_ms: 1000,
            cacheable_max_attempts: 5,
            default_max_attempts: 1024,
            request_permits: 16,
            fanout_permits: 4,
            camera_interval_ms: 5000,
            camera_run_once_ms: 15000,
            camera_max_queue: 8,
            camera_max_failed: 1,
            camera_upload_heic: false,
        }
    }
}

impl EngineConfig {
    /// Clamp values that would stall or flood the engine.
    pub fn validate(&mut self) {
        if self.request_permits == 0 {
            self.request_permits = 1;
        }
        if self.fanout_permits == 0 {
            self.fanout_permits = 1;
        }
        if self.cacheable_max_attempts == 0 {
            self.cacheable_max_attempts = 1;
        }
        if self.default_max_attempts == 0 {
            self.default_max_attempts = 1;
        }
        if self.camera_max_queue == 0 {
            self.camera_max_queue = 1;
        }
    }
}

/// Resolve the default config file path.
pub fn config_path() -> Result<PathBuf, String> {
    let base = dirs::config_dir().ok_or_else(|| "Cannot determine config directory".to_string())?;
    Ok(base.join("veilsync").join("engine_config.json"))
}

/// Load the engine config, falling back to defaults when the file is absent
/// or unparseable.
pub fn load_config(path: &PathBuf) -> EngineConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<EngineConfig>(&contents) {
            Ok(mut config) => {
                config.validate();
                info!("Engine config loaded from {}", path.display());
                config
            }
            Err(e) => {
                warn!(
                    "Failed to parse engine config at {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                EngineConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => EngineConfig::default(),
        Err(e) => {
            warn!(
                "Failed to read engine config at {}: {}. Using defaults.",
                path.display(),
                e
            );
            EngineConfig::default()
        }
    }
}

/// Save the engine config. Creates the parent directory if missing; atomic
/// write via temp file + rename.
pub fn save_config(path: &PathBuf, config: &EngineConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {}: {}", parent.display(), e))?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize engine config: {}", e))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)
        .map_err(|e| format!("Failed to write temp config to {}: {}", tmp_path.display(), e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| format!("Failed to rename config file: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let c = EngineConfig::default();
        assert_eq!(c.retry_delay_ms, 1000);
        assert_eq!(c.cacheable_max_attempts, 5);
        assert_eq!(c.default_max_attempts, 1024);
        assert_eq!(c.request_permits, 16);
        assert_eq!(c.fanout_permits, 4);
        assert_eq!(c.camera_interval_ms, 5000);
        assert_eq!(c.camera_max_queue, 8);
        assert_eq!(c.camera_max_failed, 1);
        assert!(!c.camera_upload_heic);
    }

    #[test]
    fn test_validate_clamps_zeroes() {
        let mut c = EngineConfig {
            request_permits: 0,
            fanout_permits: 0,
            camera_max_queue: 0,
            cacheable_max_attempts: 0,
            default_max_attempts: 0,
            ..EngineConfig::default()
        };
        c.validate();
        assert_eq!(c.request_permits, 1);
        assert_eq!(c.fanout_permits, 1);
        assert_eq!(c.camera_max_queue, 1);
        assert_eq!(c.cacheable_max_attempts, 1);
        assert_eq!(c.default_max_attempts, 1);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("engine_config.json");
        let config = EngineConfig {
            gateway_url: "https://gw.test".to_string(),
            camera_interval_ms: 9000,
            ..EngineConfig::default()
        };
        save_config(&path, &config).unwrap();
        let loaded = load_config(&path);
        assert_eq!(loaded.gateway_url, "https://gw.test");
        assert_eq!(loaded.camera_interval_ms, 9000);
    }

    #[test]
    fn test_load_missing_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nope.json");
        let loaded = load_config(&path);
        assert_eq!(loaded.retry_delay_ms, 1000);
    }

    #[test]
    fn test_load_garbage_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("engine_config.json");
        std::fs::write(&path, "{not json").unwrap();
        let loaded = load_config(&path);
        assert_eq!(loaded.request_permits, 16);
    }
}
