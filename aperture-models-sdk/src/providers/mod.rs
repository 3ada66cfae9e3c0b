//! Provider abstraction: the uniform interface every upstream LLM/image API
//! is adapted to, plus the bits of per-provider bookkeeping (config, health)
//! that sit above the HTTP wire format.
//!
//! The registry (`crate::registry`) is what decides *which* provider backs a
//! canonical model; this module only defines what a provider *is*.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, ImageRequest, ImageResponse, StreamChunk};
use crate::registry::RawModel;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

pub mod http_client;
pub mod image;
pub mod openai_compatible;
pub mod vertex;

pub type StreamResult = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Uniform contract every provider adapter implements.
///
/// # Examples
///
/// ```rust
/// use aperture_models_sdk::providers::{Provider, ProviderConfig};
/// use aperture_models_sdk::models::{ChatRequest, ChatResponse};
/// use aperture_models_sdk::error::ProviderError;
/// use async_trait::async_trait;
///
/// struct Echo(ProviderConfig);
///
/// #[async_trait]
/// impl Provider for Echo {
///     fn name(&self) -> &str { "echo" }
///     fn supports_streaming(&self) -> bool { false }
///     fn supports_function_calling(&self) -> bool { false }
///     fn supported_models(&self) -> Vec<String> { vec!["echo-1".into()] }
///
///     async fn chat_completion(&self, _req: ChatRequest) -> Result<ChatResponse, ProviderError> {
///         todo!()
///     }
///
///     async fn stream_chat_completion(
///         &self,
///         _req: ChatRequest,
///     ) -> Result<aperture_models_sdk::providers::StreamResult, ProviderError> {
///         todo!()
///     }
///
///     async fn health_check(&self) -> Result<aperture_models_sdk::providers::ProviderHealth, ProviderError> {
///         todo!()
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn supports_streaming(&self) -> bool;
    fn supports_function_calling(&self) -> bool;
    fn supported_models(&self) -> Vec<String>;

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<StreamResult, ProviderError>;

    /// Generate images from a text prompt. Default: unsupported.
    async fn image_generation(
        &self,
        _request: ImageRequest,
    ) -> Result<ImageResponse, ProviderError> {
        Err(ProviderError::Configuration {
            message: format!("Image generation not supported by {}", self.name()),
        })
    }

    /// Fetch this provider's own model catalog, for the registry's startup
    /// (and manual-refresh) ingestion pass. Default: no discoverable catalog
    /// — the registry falls back to its static overlay for this provider
    /// (e.g. Vertex, which has no public list-models endpoint of this shape).
    async fn list_models(&self) -> Result<Vec<RawModel>, ProviderError> {
        Ok(Vec::new())
    }

    async fn health_check(&self) -> Result<ProviderHealth, ProviderError>;
}

/// Configuration for a single provider adapter instance.
///
/// # Examples
///
/// ```rust
/// use aperture_models_sdk::providers::ProviderConfig;
/// use std::time::Duration;
///
/// let config = ProviderConfig::new("openrouter", "sk-...")
///     .with_base_url("https://openrouter.ai/api/v1")
///     .with_timeout(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(with = "crate::common::duration_serde")]
    pub timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "crate::common::duration_serde")]
    pub retry_delay: Duration,
    pub rate_limit: Option<RateLimit>,
    pub model_mapping: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub enabled: bool,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: api_key.into(),
            base_url: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            rate_limit: None,
            model_mapping: HashMap::new(),
            headers: HashMap::new(),
            enabled: true,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub latency_ms: Option<u64>,
    pub error_rate: f64,
    pub last_check: chrono::DateTime<chrono::Utc>,
    pub details: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}
