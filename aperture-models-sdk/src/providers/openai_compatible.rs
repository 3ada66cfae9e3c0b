//! Adapter for any provider that speaks the OpenAI chat-completions wire
//! format verbatim: OpenRouter, Fireworks, Together, DeepInfra, Portkey,
//! and similar. The only thing that differs between them is `base_url`,
//! the auth header shape, and the model catalog, all of which come from
//! `ProviderConfig`.

use super::http_client::{AuthStrategy, HttpProviderClient};
use super::{HealthStatus, Provider, ProviderConfig, ProviderHealth, StreamResult};
use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, StreamChunk};
use crate::registry::RawModel;
use async_stream::stream;
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Instant;

/// Shape of the `GET /models` response every OpenAI-compatible provider
/// serves (OpenRouter, Fireworks, Together, DeepInfra, Portkey all agree on
/// this envelope even though their model id namespaces differ).
#[derive(Debug, Deserialize)]
struct ModelsListResponse {
    data: Vec<ModelListing>,
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context_length: Option<u32>,
}

pub struct OpenAICompatibleProvider {
    http: HttpProviderClient,
    config: ProviderConfig,
}

impl OpenAICompatibleProvider {
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
            .to_lowercase()
    }
}

#[async_trait::async_trait]
impl Provider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_function_calling(&self) -> bool {
        true
    }

    fn supported_models(&self) -> Vec<String> {
        self.config.model_mapping.keys().cloned().collect()
    }

    async fn chat_completion(&self, mut request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        request.model = self.map_model(&request.model);
        request.stream = Some(false);
        self.http.post_json("/chat/completions", &request).await
    }

    async fn stream_chat_completion(
        &self,
        mut request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        request.model = self.map_model(&request.model);
        request.stream = Some(true);

        let response = self.http.post_json_raw("/chat/completions", &request).await?;
        if !response.status().is_success() {
            return Err(super::http_client::map_error_response(response).await);
        }

        let byte_stream = response.bytes_stream();

        let out = stream! {
            let mut buf = String::new();
            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(ProviderError::Http(e));
                        continue;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<StreamChunk>(data) {
                        Ok(chunk) => yield Ok(chunk),
                        Err(e) => yield Err(ProviderError::Serialization(e)),
                    }
                }
            }
        };

        Ok(Box::pin(out))
    }

    async fn list_models(&self) -> Result<Vec<RawModel>, ProviderError> {
        let response: ModelsListResponse = self.http.get_json("/models").await?;
        Ok(response
            .data
            .into_iter()
            .map(|m| RawModel {
                native_id: m.id,
                display_name: m.name,
                context_length: m.context_length,
            })
            .collect())
    }

    async fn health_check(&self) -> Result<ProviderHealth, ProviderError> {
        let start = Instant::now();
        let result: Result<serde_json::Value, ProviderError> = self.http.get_json("/models").await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let status = if result.is_ok() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };

        Ok(ProviderHealth {
            status,
            latency_ms: Some(latency_ms),
            error_rate: if result.is_ok() { 0.0 } else { 1.0 },
            last_check: chrono::Utc::now(),
            details: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn maps_configured_model_aliases() {
        let mut config = ProviderConfig::new("openrouter", "sk-test");
        config.model_mapping.insert(
            "gpt-4o".to_string(),
            "openai/gpt-4o".to_string(),
        );
        let provider = OpenAICompatibleProvider::new(config).unwrap();
        assert_eq!(provider.map_model("gpt-4o"), "openai/gpt-4o");
        assert_eq!(provider.map_model("unmapped"), "unmapped");
    }

    #[tokio::test]
    async fn list_models_parses_openai_style_catalog_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"id": "openai/gpt-4o", "name": "GPT-4o", "context_length": 128000},
                    {"id": "meta-llama/llama-3p1-70b"},
                ]
            })))
            .mount(&server)
            .await;

        let config = ProviderConfig::new("openrouter", "sk-test").with_base_url(server.uri());
        let provider = OpenAICompatibleProvider::new(config).unwrap();
        let models = provider.list_models().await.unwrap();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].native_id, "openai/gpt-4o");
        assert_eq!(models[0].display_name.as_deref(), Some("GPT-4o"));
        assert_eq!(models[0].context_length, Some(128_000));
        assert_eq!(models[1].native_id, "meta-llama/llama-3p1-70b");
        assert_eq!(models[1].display_name, None);
    }
}
