//! Health probes and the factory registry that builds them from config.
//!
//! A probe answers one question: is the target reachable and answering
//! correctly right now? Timeouts and retries are applied by the checker.
//!
//! ## Usage
//!
//! ```ignore
//! let probe = FnProbe::new(|| async { Ok(()) });
//!
//! let registry = ProbeRegistry::with_defaults();
//! let http = registry.create("http", &json!({"endpoint": "https://api.example.com/health"}))?;
//! ```

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use rampart_core::Classify;

/// Errors from health probes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("Probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Unexpected status: expected {expected}, got {actual}")]
    UnexpectedStatus { expected: u16, actual: u16 },

    #[error("Response body did not contain {0:?}")]
    UnexpectedBody(String),

    #[error("Probe not configured: {0}")]
    NotConfigured(String),

    #[error("Probe failed: {0}")]
    Failed(String),
}

impl Classify for ProbeError {
    fn error_code(&self) -> Option<&str> {
        Some(match self {
            ProbeError::Timeout(_) => "TIMEOUT",
            ProbeError::Connection(_) => "CONNECTION_FAILED",
            ProbeError::UnexpectedStatus { .. } => "UNEXPECTED_STATUS",
            ProbeError::UnexpectedBody(_) => "UNEXPECTED_BODY",
            ProbeError::NotConfigured(_) => "NOT_CONFIGURED",
            ProbeError::Failed(_) => "PROBE_FAILED",
        })
    }

    fn is_recoverable(&self) -> bool {
        !matches!(self, ProbeError::NotConfigured(_))
    }

    fn describe(&self) -> Option<String> {
        Some(self.to_string())
    }
}

/// Availability check for one target.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Succeeds when the target is reachable and answering correctly.
    async fn check(&self) -> Result<(), ProbeError>;

    /// Short label used in logs.
    fn kind(&self) -> &str {
        "custom"
    }
}

/// Opaque availability check backed by a closure.
pub struct FnProbe<F> {
    check: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProbeError>> + Send,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F, Fut> Probe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ProbeError>> + Send,
{
    async fn check(&self) -> Result<(), ProbeError> {
        (self.check)().await
    }

    fn kind(&self) -> &str {
        "fn"
    }
}

/// Factory for creating probes from JSON configuration.
pub trait ProbeFactory: Send + Sync {
    /// Unique identifier for this probe type (e.g., "http").
    fn probe_type(&self) -> &'static str;

    fn create(&self, config: &JsonValue) -> Result<Arc<dyn Probe>, ProbeError>;

    /// Validate configuration without creating a probe.
    fn validate_config(&self, config: &JsonValue) -> Result<(), ProbeError>;

    fn description(&self) -> &'static str {
        "Health probe"
    }
}

/// Registry of available probe factories.
#[derive(Default)]
pub struct ProbeRegistry {
    factories: BTreeMap<String, Arc<dyn ProbeFactory>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any factory of the same type.
    pub fn register(&mut self, factory: Arc<dyn ProbeFactory>) {
        self.factories
            .insert(factory.probe_type().to_string(), factory);
    }

    pub fn create(&self, probe_type: &str, config: &JsonValue) -> Result<Arc<dyn Probe>, ProbeError> {
        self.factory(probe_type)?.create(config)
    }

    pub fn validate(&self, probe_type: &str, config: &JsonValue) -> Result<(), ProbeError> {
        self.factory(probe_type)?.validate_config(config)
    }

    pub fn available_types(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn has_probe(&self, probe_type: &str) -> bool {
        self.factories.contains_key(probe_type)
    }

    /// Registry with every built-in factory enabled by features.
    #[cfg(feature = "http")]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(http::HttpProbeFactory));
        registry
    }

    /// Registry with every built-in factory enabled by features.
    #[cfg(not(feature = "http"))]
    pub fn with_defaults() -> Self {
        Self::new()
    }

    fn factory(&self, probe_type: &str) -> Result<&Arc<dyn ProbeFactory>, ProbeError> {
        self.factories.get(probe_type).ok_or_else(|| {
            ProbeError::NotConfigured(format!(
                "Unknown probe type: '{}'. Available: {:?}",
                probe_type,
                self.available_types()
            ))
        })
    }
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegistry")
            .field("probes", &self.available_types())
            .finish()
    }
}

#[cfg(feature = "http")]
pub use http::{HttpProbe, HttpProbeFactory};

#[cfg(feature = "http")]
mod http {
    use super::*;
    use secrecy::{ExposeSecret, SecretString};

    /// HTTP health endpoint check.
    ///
    /// The optional bearer token is held in a [`SecretString`] and only
    /// exposed when the request header is built.
    pub struct HttpProbe {
        endpoint: String,
        expected_status: u16,
        expected_body: Option<String>,
        token: Option<SecretString>,
        client: reqwest::Client,
    }

    impl HttpProbe {
        pub fn new(endpoint: impl Into<String>) -> Self {
            Self {
                endpoint: endpoint.into(),
                expected_status: 200,
                expected_body: None,
                token: None,
                client: reqwest::Client::new(),
            }
        }

        pub fn expect_status(mut self, status: u16) -> Self {
            self.expected_status = status;
            self
        }

        /// Require the response body to contain `needle`.
        pub fn expect_body_contains(mut self, needle: impl Into<String>) -> Self {
            self.expected_body = Some(needle.into());
            self
        }

        pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
            self.token = Some(SecretString::from(token.into()));
            self
        }

        pub fn endpoint(&self) -> &str {
            &self.endpoint
        }
    }

    impl std::fmt::Debug for HttpProbe {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("HttpProbe")
                .field("endpoint", &self.endpoint)
                .field("expected_status", &self.expected_status)
                .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
                .finish()
        }
    }

    #[async_trait]
    impl Probe for HttpProbe {
        async fn check(&self) -> Result<(), ProbeError> {
            let mut request = self.client.get(&self.endpoint);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token.expose_secret());
            }

            let response = request
                .send()
                .await
                .map_err(|e| ProbeError::Connection(e.to_string()))?;

            let actual = response.status().as_u16();
            if actual != self.expected_status {
                return Err(ProbeError::UnexpectedStatus {
                    expected: self.expected_status,
                    actual,
                });
            }

            if let Some(needle) = &self.expected_body {
                let body = response
                    .text()
                    .await
                    .map_err(|e| ProbeError::Connection(e.to_string()))?;
                if !body.contains(needle.as_str()) {
                    return Err(ProbeError::UnexpectedBody(needle.clone()));
                }
            }

            Ok(())
        }

        fn kind(&self) -> &str {
            "http"
        }
    }

    /// Builds [`HttpProbe`]s from `{"endpoint", "expected_status",
    /// "expected_body", "bearer_token" | "bearer_token_env"}`.
    pub struct HttpProbeFactory;

    impl ProbeFactory for HttpProbeFactory {
        fn probe_type(&self) -> &'static str {
            "http"
        }

        fn create(&self, config: &JsonValue) -> Result<Arc<dyn Probe>, ProbeError> {
            self.validate_config(config)?;

            let endpoint = config["endpoint"].as_str().unwrap_or_default();
            let mut probe = HttpProbe::new(endpoint);

            if let Some(status) = config.get("expected_status").and_then(|v| v.as_u64()) {
                probe = probe.expect_status(status as u16);
            }
            if let Some(body) = config.get("expected_body").and_then(|v| v.as_str()) {
                probe = probe.expect_body_contains(body);
            }
            if let Some(token) = config.get("bearer_token").and_then(|v| v.as_str()) {
                probe = probe.bearer_token(token);
            } else if let Some(var) = config.get("bearer_token_env").and_then(|v| v.as_str()) {
                let token = std::env::var(var).map_err(|_| {
                    ProbeError::NotConfigured(format!(
                        "bearer token not set: configure '{var}' environment variable"
                    ))
                })?;
                probe = probe.bearer_token(token);
            }

            Ok(Arc::new(probe))
        }

        fn validate_config(&self, config: &JsonValue) -> Result<(), ProbeError> {
            let endpoint = config
                .get("endpoint")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProbeError::NotConfigured("'endpoint' is required".to_string()))?;

            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(ProbeError::NotConfigured(format!(
                    "endpoint must be an http(s) URL, got '{endpoint}'"
                )));
            }

            if let Some(status) = config.get("expected_status") {
                match status.as_u64() {
                    Some(code) if (100..600).contains(&code) => {}
                    _ => {
                        return Err(ProbeError::NotConfigured(
                            "'expected_status' must be an HTTP status code".to_string(),
                        ))
                    }
                }
            }

            Ok(())
        }

        fn description(&self) -> &'static str {
            "HTTP health endpoint probe"
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn test_validate_http_config() {
            let factory = HttpProbeFactory;
            assert!(factory
                .validate_config(&json!({"endpoint": "https://api.example.com/health"}))
                .is_ok());
            assert!(factory.validate_config(&json!({})).is_err());
            assert!(factory
                .validate_config(&json!({"endpoint": "ftp://example.com"}))
                .is_err());
            assert!(factory
                .validate_config(&json!({"endpoint": "http://x", "expected_status": 42}))
                .is_err());
        }

        #[test]
        fn test_token_is_redacted() {
            let probe = HttpProbe::new("https://api.example.com/health").bearer_token("sk-secret");
            let debug = format!("{probe:?}");
            assert!(!debug.contains("sk-secret"));
            assert!(debug.contains("[REDACTED]"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticProbeFactory;

    impl ProbeFactory for StaticProbeFactory {
        fn probe_type(&self) -> &'static str {
            "static"
        }

        fn create(&self, config: &JsonValue) -> Result<Arc<dyn Probe>, ProbeError> {
            self.validate_config(config)?;
            let healthy = config["healthy"].as_bool().unwrap_or(false);
            Ok(Arc::new(FnProbe::new(move || async move {
                if healthy {
                    Ok(())
                } else {
                    Err(ProbeError::Failed("configured unhealthy".to_string()))
                }
            })))
        }

        fn validate_config(&self, config: &JsonValue) -> Result<(), ProbeError> {
            config
                .get("healthy")
                .and_then(|v| v.as_bool())
                .map(|_| ())
                .ok_or_else(|| ProbeError::NotConfigured("'healthy' is required".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fn_probe_runs_closure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let probe = FnProbe::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        assert!(probe.check().await.is_ok());
        assert!(probe.check().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(probe.kind(), "fn");
    }

    #[tokio::test]
    async fn test_registry_creates_registered_type() {
        let mut registry = ProbeRegistry::new();
        registry.register(Arc::new(StaticProbeFactory));

        assert!(registry.has_probe("static"));
        let probe = registry.create("static", &json!({"healthy": true})).unwrap();
        assert!(probe.check().await.is_ok());

        let probe = registry.create("static", &json!({"healthy": false})).unwrap();
        assert!(probe.check().await.is_err());
    }

    #[test]
    fn test_unknown_type_lists_available() {
        let mut registry = ProbeRegistry::new();
        registry.register(Arc::new(StaticProbeFactory));

        match registry.create("grpc", &json!({})) {
            Err(ProbeError::NotConfigured(msg)) => assert!(msg.contains("static")),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("unknown type should not resolve"),
        }
        assert!(registry.validate("static", &json!({})).is_err());
    }

    #[test]
    fn test_not_configured_is_not_retryable() {
        assert!(!rampart_core::is_retryable(
            &ProbeError::NotConfigured("x".into()),
            &[]
        ));
        assert!(rampart_core::is_retryable(&ProbeError::Connection("reset".into()), &[]));
    }
}
