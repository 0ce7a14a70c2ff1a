//! Request gateway
//!
//! Every remote call goes through [`ApiClient`]: concurrency limiting via
//! two semaphores (one for all requests, one for share/link fan-out),
//! bounded fixed-delay retry on transport failures, and a persistent
//! response cache for an allow-list of idempotent read endpoints.
//!
//! The contract callers rely on: for an allow-listed endpoint with a cached
//! prior response, `request` never fails on network trouble — it returns
//! the last good response instead. Everything else eventually rejects, but
//! only after exhausting its (deliberately large) attempt budget.

pub mod transport;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::storage::DocStore;
use crate::types::SyncError;
use transport::{Transport, TransportError};
use types::ApiEnvelope;

/// Idempotent read endpoints eligible for response caching and the bounded
/// 5-attempt retry budget.
const CACHEABLE_ENDPOINTS: &[&str] = &[
    "/v1/dir/content",
    "/v1/user/baseFolders",
    "/v1/user/shared/in",
    "/v1/user/shared/out",
    "/v1/user/recent",
    "/v1/user/keyPair/info",
    "/v1/user/keyPair/update",
    "/v1/user/keyPair/set",
    "/v1/dir/size",
    "/v1/user/masterKeys",
];

/// Server messages that mean the credential is gone, not the request.
const CREDENTIAL_ERRORS: &[&str] = &["api key not found", "invalid api key", "api key expired"];

pub fn is_cacheable(endpoint: &str) -> bool {
    CACHEABLE_ENDPOINTS.contains(&endpoint)
}

fn is_credential_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    CREDENTIAL_ERRORS.iter().any(|m| lower.contains(m))
}

type LogoutHook = Box<dyn Fn() + Send + Sync>;

/// The gateway. One instance per engine; all fields are owned here rather
/// than in module-level statics so engines can be constructed independently
/// (tests run many in parallel).
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn DocStore>,
    general: Arc<Semaphore>,
    fanout: Arc<Semaphore>,
    online: AtomicBool,
    cancel: CancellationToken,
    logout_hook: Mutex<Option<LogoutHook>>,
    retry_delay: Duration,
    cacheable_max_attempts: u32,
    default_max_attempts: u32,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn DocStore>,
        config: &EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            cache,
            general: Arc::new(Semaphore::new(config.request_permits)),
            fanout: Arc::new(Semaphore::new(config.fanout_permits)),
            online: AtomicBool::new(true),
            cancel,
            logout_hook: Mutex::new(None),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            cacheable_max_attempts: config.cacheable_max_attempts,
            default_max_attempts: config.default_max_attempts,
        }
    }

    /// Register the hook fired when the server reports the credential as
    /// invalid or expired.
    pub fn set_logout_hook(&self, hook: LogoutHook) {
        *self.logout_hook.lock().unwrap() = Some(hook);
    }

    /// Connectivity switch maintained by the host platform.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn cache_key(endpoint: &str, body: &Value) -> String {
        format!("POST:{}:{}", endpoint, body)
    }

    fn max_attempts(&self, endpoint: &str) -> u32 {
        if !self.is_online() {
            // Fail fast to cache.
            1
        } else if is_cacheable(endpoint) {
            self.cacheable_max_attempts
        } else {
            self.default_max_attempts
        }
    }

    /// POST to the gateway with retry, caching and the credential check.
    pub async fn request(&self, endpoint: &str, body: Value) -> Result<ApiEnvelope, SyncError> {
        let _permit = self
            .general
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        self.dispatch(endpoint, body).await
    }

    /// POST under the share/link fan-out limiter. Total in-flight fan-out
    /// pushes across the whole engine stay capped regardless of how many
    /// recipients or links are being targeted concurrently.
    pub async fn fanout_request(&self, endpoint: &str, body: Value) -> Result<ApiEnvelope, SyncError> {
        let _fanout_permit = self
            .fanout
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;
        let _permit = self
            .general
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        self.dispatch(endpoint, body).await
    }

    async fn dispatch(&self, endpoint: &str, body: Value) -> Result<ApiEnvelope, SyncError> {
        let cacheable = is_cacheable(endpoint);
        let max_attempts = self.max_attempts(endpoint).max(1);
        let key = Self::cache_key(endpoint, &body);

        let mut last_error: Option<TransportError> = None;

        for attempt in 0..max_attempts {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            match self.transport.post(endpoint, &body).await {
                Ok(envelope) => {
                    if !envelope.status {
                        // Application-level rejection: never retried.
                        let message = envelope
                            .message
                            .clone()
                            .unwrap_or_else(|| "request rejected".to_string());
                        if is_credential_error(&message) {
                            self.fire_logout();
                            return Err(SyncError::InvalidCredentials);
                        }
                        return Err(SyncError::Api(message));
                    }

                    if cacheable {
                        let serialized = serde_json::to_value(&envelope)
                            .map_err(|e| SyncError::Storage(e.to_string()))?;
                        if let Err(e) = self.cache.set(&key, serialized) {
                            warn!("Failed to persist response cache for {}: {}", endpoint, e);
                        }
                    }
                    return Ok(envelope);
                }
                Err(e) => {
                    debug!(
                        "{} attempt {}/{} failed: {}",
                        endpoint,
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                            _ = tokio::time::sleep(self.retry_delay) => {}
                        }
                    }
                }
            }
        }

        // Retries exhausted: allow-listed endpoints fall back to the last
        // cached response for this exact (endpoint, body) key.
        if cacheable {
            if let Some(cached) = self.cache.get(&key) {
                if let Ok(envelope) = serde_json::from_value::<ApiEnvelope>(cached) {
                    debug!("{} exhausted retries, serving cached response", endpoint);
                    return Ok(envelope);
                }
            }
        }

        Err(SyncError::Network(
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "request failed".to_string()),
        ))
    }

    fn fire_logout(&self) {
        if let Some(hook) = self.logout_hook.lock().unwrap().as_ref() {
            hook();
        }
    }
}
