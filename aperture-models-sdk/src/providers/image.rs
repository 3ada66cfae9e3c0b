//! Image generation adapter for OpenAI-compatible `/images/generations`
//! endpoints (DeepInfra, Portkey-routed providers, etc). Chat completions
//! aren't supported here — this adapter only ever gets selected for
//! image-capable canonical models.
//!
//! Each provider hits the same style of endpoint, differing mainly in which
//! extra header carries provider routing (e.g. Portkey's virtual key).

use super::http_client::{AuthStrategy, HttpProviderClient};
use super::{HealthStatus, Provider, ProviderConfig, ProviderHealth, StreamResult};
use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, ImageRequest, ImageResponse};
use std::collections::HashMap;
use std::time::Instant;

pub struct ImageProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
}

impl ImageProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.openai.com/v1",
            &config.headers,
            AuthStrategy::Bearer {
                token: config.api_key.clone(),
            },
        )?;
        Ok(Self { http, config })
    }

    fn map_model(&self, model: &str) -> String {
        self.config
            .model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

#[async_trait::async_trait]
impl Provider for ImageProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn supports_function_calling(&self) -> bool {
        false
    }

    fn supported_models(&self) -> Vec<String> {
        self.config.model_mapping.keys().cloned().collect()
    }

    async fn chat_completion(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::Configuration {
            message: format!("{} is an image-only provider", self.config.name),
        })
    }

    async fn stream_chat_completion(
        &self,
        _request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        Err(ProviderError::Configuration {
            message: format!("{} is an image-only provider", self.config.name),
        })
    }

    async fn image_generation(&self, mut request: ImageRequest) -> Result<ImageResponse, ProviderError> {
        if let Some(model) = &request.model {
            request.model = Some(self.map_model(model));
        }
        self.http.post_json("/images/generations", &request).await
    }

    async fn health_check(&self) -> Result<ProviderHealth, ProviderError> {
        let start = Instant::now();
        let result: Result<serde_json::Value, ProviderError> = self.http.get_json("/models").await;
        let latency_ms = start.elapsed().as_millis() as u64;

        Ok(ProviderHealth {
            status: if result.is_ok() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            latency_ms: Some(latency_ms),
            error_rate: if result.is_ok() { 0.0 } else { 1.0 },
            last_check: chrono::Utc::now(),
            details: HashMap::new(),
        })
    }
}
