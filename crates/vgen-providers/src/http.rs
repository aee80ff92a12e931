//! HTTP generation provider.
//!
//! `POST {base_url}/generate` with the JSON request; a 2xx response body is
//! the artifact. An optional `x-duration-secs` header carries the media
//! duration.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;
use vgen_models::TaskKind;

use crate::error::{ProviderError, ProviderResult};
use crate::provider::GenerationProvider;
use crate::types::{GeneratedArtifact, GenerationRequest};

/// Response header carrying the generated media duration.
pub const DURATION_HEADER: &str = "x-duration-secs";

/// Longest error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Configuration for one HTTP provider.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub kind: TaskKind,
    /// Base URL of the provider service
    pub base_url: String,
    /// Bearer token, if the service requires one
    pub api_token: Option<String>,
    /// Client-side request rate cap
    pub requests_per_minute: Option<u32>,
    /// Request timeout
    pub timeout: Duration,
}

impl HttpProviderConfig {
    pub fn new(kind: TaskKind, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            api_token: None,
            requests_per_minute: None,
            timeout: Duration::from_secs(900),
        }
    }

    /// Whether `VGEN_{KIND}_PROVIDER_URL` is set.
    pub fn is_configured(kind: TaskKind) -> bool {
        std::env::var(url_var(kind)).is_ok()
    }

    /// Create config from `VGEN_{KIND}_PROVIDER_*` environment variables.
    pub fn from_env(kind: TaskKind) -> ProviderResult<Self> {
        let prefix = env_prefix(kind);
        let url_var = url_var(kind);

        let base_url = std::env::var(&url_var)
            .map_err(|_| ProviderError::permanent(format!("{} not set", url_var)))?;

        Ok(Self {
            kind,
            base_url,
            api_token: std::env::var(format!("{}_PROVIDER_TOKEN", prefix)).ok(),
            requests_per_minute: std::env::var(format!("{}_REQUESTS_PER_MINUTE", prefix))
                .ok()
                .and_then(|s| s.parse().ok()),
            timeout: Duration::from_secs(
                std::env::var(format!("{}_PROVIDER_HTTP_TIMEOUT_SECS", prefix))
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(900),
            ),
        })
    }
}

fn env_prefix(kind: TaskKind) -> String {
    format!("VGEN_{}", kind.as_str().to_ascii_uppercase())
}

fn url_var(kind: TaskKind) -> String {
    format!("{}_PROVIDER_URL", env_prefix(kind))
}

/// Client for a remote generation service.
pub struct HttpProvider {
    http: Client,
    endpoint: Url,
    config: HttpProviderConfig,
    limiter: Option<Arc<DirectRateLimiter>>,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> ProviderResult<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| ProviderError::permanent(format!("invalid provider URL: {}", e)))?;
        let endpoint = base
            .join("generate")
            .map_err(|e| ProviderError::permanent(format!("invalid provider URL: {}", e)))?;

        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::permanent(format!("failed to build HTTP client: {}", e)))?;

        let limiter = config
            .requests_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));

        Ok(Self {
            http,
            endpoint,
            config,
            limiter,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    /// Takes one cell of the request quota. `generate` itself never waits
    /// on the limiter.
    async fn ready(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> ProviderResult<GeneratedArtifact> {
        debug!(
            kind = %self.config.kind,
            task_id = %request.task_id,
            attempt = request.attempt,
            "Sending generation request to {}",
            self.endpoint
        );

        let mut builder = self.http.post(self.endpoint.clone()).json(request);
        if let Some(token) = &self.config.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport(e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(MAX_ERROR_BODY);
            let message = format!("{} returned {}: {}", self.config.kind, status, body);
            warn!(task_id = %request.task_id, "{}", message);
            return Err(classify_status(status, message));
        }

        let duration_secs = response
            .headers()
            .get(DURATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport(e, self.config.timeout))?;

        if bytes.is_empty() {
            return Err(ProviderError::transient(format!(
                "{} returned an empty body",
                self.config.kind
            )));
        }

        Ok(GeneratedArtifact {
            bytes: bytes.to_vec(),
            duration_secs,
        })
    }
}

/// 408, 429 and 5xx are transient; every other non-success status is permanent.
fn classify_status(status: StatusCode, message: String) -> ProviderError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

fn classify_transport(error: reqwest::Error, timeout: Duration) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout)
    } else if error.is_builder() {
        ProviderError::permanent(error.to_string())
    } else {
        ProviderError::transient(error.to_string())
    }
}
