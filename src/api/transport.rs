//! HTTP transport seam
//!
//! The gateway talks to the network through the [`Transport`] trait so the
//! retry/cache layer can be exercised against scripted responses in tests.
//! [`HttpTransport`] is the production implementation over `reqwest`.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;

use super::types::ApiEnvelope;

/// A transport-level failure: the request never produced a gateway envelope.
/// These are the errors the gateway retries.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// POST a JSON body to a gateway endpoint and decode the envelope.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, endpoint: &str, body: &Value) -> Result<ApiEnvelope, TransportError>;
}

/// Production transport: JSON-over-HTTPS with Bearer auth.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, endpoint: &str, body: &Value) -> Result<ApiEnvelope, TransportError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        resp.json::<ApiEnvelope>()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Scripted transport (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Per-endpoint script: a queue of one-shot responses, then a sticky
    /// response repeated forever.
    #[derive(Default)]
    struct Script {
        seq: VecDeque<Result<ApiEnvelope, TransportError>>,
        sticky: Option<Result<ApiEnvelope, TransportError>>,
    }

    /// In-memory transport driven by scripted responses, recording every
    /// call it sees.
    #[derive(Default)]
    pub struct ScriptedTransport {
        scripts: Mutex<HashMap<String, Script>>,
        /// Fail any call whose (endpoint, body-substring) matches.
        fail_matching: Mutex<Vec<(String, String)>>,
        pub calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Push a one-shot response for an endpoint (consumed in order).
        pub fn push(&self, endpoint: &str, result: Result<ApiEnvelope, TransportError>) {
            self.scripts
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_default()
                .seq
                .push_back(result);
        }

        /// Set the response repeated for every call once the queue is empty.
        pub fn sticky(&self, endpoint: &str, result: Result<ApiEnvelope, TransportError>) {
            self.scripts
                .lock()
                .unwrap()
                .entry(endpoint.to_string())
                .or_default()
                .sticky = Some(result);
        }

        /// Convenience: sticky `{status: true, data}` response.
        pub fn ok(&self, endpoint: &str, data: Value) {
            self.sticky(
                endpoint,
                Ok(ApiEnvelope {
                    status: true,
                    message: None,
                    data: Some(data),
                }),
            );
        }

        /// Fail calls to `endpoint` whose serialized body contains `needle`,
        /// regardless of scripts. Deterministic under concurrent fan-out.
        pub fn fail_when_body_contains(&self, endpoint: &str, needle: &str) {
            self.fail_matching
                .lock()
                .unwrap()
                .push((endpoint.to_string(), needle.to_string()));
        }

        pub fn calls_to(&self, endpoint: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _)| e == endpoint)
                .count()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(&self, endpoint: &str, body: &Value) -> Result<ApiEnvelope, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((endpoint.to_string(), body.clone()));

            let serialized = body.to_string();
            for (e, needle) in self.fail_matching.lock().unwrap().iter() {
                if e == endpoint && serialized.contains(needle) {
                    return Err(TransportError::Network("scripted failure".to_string()));
                }
            }

            let mut scripts = self.scripts.lock().unwrap();
            let script = scripts.entry(endpoint.to_string()).or_default();
            if let Some(result) = script.seq.pop_front() {
                return result;
            }
            if let Some(sticky) = &script.sticky {
                return sticky.clone();
            }
            Err(TransportError::Network(format!("unscripted endpoint {}", endpoint)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedTransport;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_scripted_sequence_then_sticky() {
        let t = ScriptedTransport::new();
        t.push("/v1/ping", Err(TransportError::Network("down".into())));
        t.ok("/v1/ping", json!({"pong": true}));

        let first = t.post("/v1/ping", &json!({})).await;
        assert!(first.is_err());
        let second = t.post("/v1/ping", &json!({})).await.unwrap();
        assert!(second.status);
        let third = t.post("/v1/ping", &json!({})).await.unwrap();
        assert_eq!(third.data, Some(json!({"pong": true})));
        assert_eq!(t.calls_to("/v1/ping"), 3);
    }

    #[tokio::test]
    async fn test_scripted_body_matcher() {
        let t = ScriptedTransport::new();
        t.ok("/v1/share", json!({}));
        t.fail_when_body_contains("/v1/share", "user2@example.com");

        assert!(t
            .post("/v1/share", &json!({"email": "user1@example.com"}))
            .await
            .is_ok());
        assert!(t
            .post("/v1/share", &json!({"email": "user2@example.com"}))
            .await
            .is_err());
    }
}
