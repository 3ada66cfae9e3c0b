//! Google Vertex AI (Gemini) adapter.
//!
//! Unlike every other provider here, Vertex doesn't take a long-lived API
//! key: it authenticates service accounts via a self-signed JWT exchanged
//! for a short-lived OAuth2 access token, since a static bearer token can't
//! talk to the real API.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, Choice, Message, Role, StreamChunk, Usage};
use crate::providers::{HealthStatus, Provider, ProviderConfig, ProviderHealth, StreamResult};
use async_stream::stream;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

const TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_EXPIRY_SECONDS: i64 = 3600;
/// Refresh this many seconds before the cached token actually expires.
const REFRESH_SKEW_SECONDS: u64 = 60;

#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
}

#[derive(Debug, Serialize)]
struct Claims {
    iss: String,
    scope: String,
    aud: String,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    id_token: Option<String>,
    expires_in: Option<u64>,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

pub struct VertexProvider {
    http: reqwest::Client,
    config: ProviderConfig,
    service_account: ServiceAccountKey,
    project_id: String,
    location: String,
    cached_token: Arc<RwLock<Option<CachedToken>>>,
}

impl VertexProvider {
    /// `config.api_key` carries the raw service-account JSON blob;
    /// `config.headers` carries `project_id` / `location`, set from the
    /// gateway's `[vertex]` config section.
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let service_account: ServiceAccountKey = serde_json::from_str(&config.api_key)
            .map_err(|e| ProviderError::Configuration {
                message: format!("invalid Vertex service account JSON: {e}"),
            })?;

        let project_id = config
            .headers
            .get("project_id")
            .cloned()
            .ok_or_else(|| ProviderError::Configuration {
                message: "Vertex provider missing project_id".to_string(),
            })?;
        let location = config
            .headers
            .get("location")
            .cloned()
            .unwrap_or_else(|| "us-central1".to_string());

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Configuration {
                message: format!("failed to build Vertex HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config,
            service_account,
            project_id,
            location,
            cached_token: Arc::new(RwLock::new(None)),
        })
    }

    fn build_jwt_assertion(&self) -> Result<String, ProviderError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: self.service_account.client_email.clone(),
            scope: "https://www.googleapis.com/auth/cloud-platform".to_string(),
            aud: TOKEN_URI.to_string(),
            exp: now + JWT_EXPIRY_SECONDS,
            iat: now,
        };

        let key = EncodingKey::from_rsa_pem(self.service_account.private_key.as_bytes())
            .map_err(|e| ProviderError::AuthenticationFailed {
                reason: format!("invalid service account private key: {e}"),
            })?;

        encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| {
            ProviderError::AuthenticationFailed {
                reason: format!("failed to sign JWT assertion: {e}"),
            }
        })
    }

    async fn exchange_jwt_for_access_token(&self, jwt: &str) -> Result<(String, u64), ProviderError> {
        let params = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
            ("assertion", jwt),
        ];

        let resp = self
            .http
            .post(TOKEN_URI)
            .form(&params)
            .send()
            .await
            .map_err(ProviderError::Http)?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::AuthenticationFailed {
                reason: format!("token exchange failed: {body}"),
            });
        }

        let parsed: TokenResponse = resp.json().await.map_err(ProviderError::Http)?;
        let expires_in = parsed.expires_in.unwrap_or(3600);

        match parsed.access_token.or(parsed.id_token) {
            Some(token) => Ok((token, expires_in)),
            None => Err(ProviderError::AuthenticationFailed {
                reason: "token exchange response had neither access_token nor id_token"
                    .to_string(),
            }),
        }
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        {
            let cached = self.cached_token.read().await;
            if let Some(entry) = cached.as_ref() {
                if entry.expires_at > Instant::now() {
                    return Ok(entry.token.clone());
                }
            }
        }

        let jwt = self.build_jwt_assertion()?;
        let (token, expires_in) = self.exchange_jwt_for_access_token(&jwt).await?;

        let expires_at = Instant::now()
            + Duration::from_secs(expires_in.saturating_sub(REFRESH_SKEW_SECONDS));
        let mut cached = self.cached_token.write().await;
        *cached = Some(CachedToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "https://{}-aiplatform.googleapis.com/v1/projects/{}/locations/{}/publishers/google/models/{}:{}",
            self.location, self.project_id, self.location, model, method
        )
    }

    fn map_model(&self, model: &str) -> String {
        self.config
            .model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
    #[serde(default)]
    finish_reason: Option<String>,
}

/// Vertex reports its own finish-reason vocabulary (`STOP`, `MAX_TOKENS`,
/// `SAFETY`, ...); callers and usage accounting expect the OpenAI-shaped
/// `stop` / `length` / `content_filter` strings.
fn map_finish_reason(raw: Option<String>) -> Option<String> {
    raw.map(|reason| {
        match reason.as_str() {
            "STOP" => "stop",
            "MAX_TOKENS" => "length",
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
                "content_filter"
            }
            "FINISH_REASON_UNSPECIFIED" | "OTHER" => "unknown",
            _ => "stop",
        }
        .to_string()
    })
}

#[derive(Debug, Deserialize, Default)]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

fn to_generate_content_request(request: &ChatRequest) -> GenerateContentRequest {
    let mut contents = Vec::new();
    let mut system_instruction = None;

    for message in &request.messages {
        let part = Part {
            text: message.content.clone(),
        };
        match message.role {
            Role::System => {
                system_instruction = Some(Content {
                    role: None,
                    parts: vec![part],
                });
            }
            Role::User | Role::Tool => contents.push(Content {
                role: Some("user".to_string()),
                parts: vec![part],
            }),
            Role::Assistant => contents.push(Content {
                role: Some("model".to_string()),
                parts: vec![part],
            }),
        }
    }

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: Some(GenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
            top_p: request.top_p,
            stop_sequences: request.stop.clone(),
        }),
    }
}

fn from_generate_content_response(
    model: &str,
    response: GenerateContentResponse,
) -> ChatResponse {
    let usage = response
        .usage_metadata
        .map(|u| Usage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        })
        .unwrap_or_default();

    let choices = response
        .candidates
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| {
            let text = candidate
                .content
                .parts
                .into_iter()
                .map(|p| p.text)
                .collect::<Vec<_>>()
                .join("");
            Choice {
                index: index as u32,
                message: Message::assistant(text),
                finish_reason: map_finish_reason(candidate.finish_reason),
                logprobs: None,
            }
        })
        .collect();

    ChatResponse {
        id: uuid::Uuid::new_v4().to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices,
        usage,
        system_fingerprint: None,
    }
}

/// Splits a completed `ChatResponse` into the two SSE chunks a real
/// streaming backend would have produced: content first, finish reason
/// and usage last. Kept as a pure function so the synthesis logic is
/// testable without going through the HTTP/auth layer.
fn synthesize_stream_chunks(response: ChatResponse) -> [StreamChunk; 2] {
    use crate::models::{Delta, StreamChoice};

    let choice = response.choices.into_iter().next();
    let content = choice
        .as_ref()
        .map(|c| c.message.content.clone())
        .unwrap_or_default();
    let finish_reason = choice
        .and_then(|c| c.finish_reason)
        .unwrap_or_else(|| "stop".to_string());

    let content_chunk = StreamChunk {
        id: response.id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: response.created,
        model: response.model.clone(),
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta {
                role: Some(Role::Assistant),
                content: Some(content),
                tool_calls: None,
            },
            finish_reason: None,
        }],
        usage: None,
    };

    let finish_chunk = StreamChunk {
        id: response.id,
        object: "chat.completion.chunk".to_string(),
        created: response.created,
        model: response.model,
        choices: vec![StreamChoice {
            index: 0,
            delta: Delta {
                role: None,
                content: None,
                tool_calls: None,
            },
            finish_reason: Some(finish_reason),
        }],
        usage: Some(response.usage),
    };

    [content_chunk, finish_chunk]
}

#[async_trait::async_trait]
impl Provider for VertexProvider {
    fn name(&self) -> &str {
        "vertex"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_function_calling(&self) -> bool {
        false
    }

    fn supported_models(&self) -> Vec<String> {
        self.config.model_mapping.keys().cloned().collect()
    }

    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let model = self.map_model(&request.model);
        let token = self.access_token().await?;
        let body = to_generate_content_request(&request);

        let resp = self
            .http
            .post(self.endpoint(&model, "generateContent"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(ProviderError::Http)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(match status {
                401 | 403 => ProviderError::AuthenticationFailed { reason: message },
                404 => ProviderError::ModelNotFound { model },
                429 => ProviderError::RateLimit,
                code => ProviderError::Api { code, message },
            });
        }

        let parsed: GenerateContentResponse = resp.json().await.map_err(ProviderError::Http)?;
        Ok(from_generate_content_response(&model, parsed))
    }

    /// Vertex's `:generateContent` backend has no native streaming
    /// equivalent for this adapter's model set, so this synthesises a
    /// streaming response the same way the original client did: issue the
    /// ordinary unary call, then yield it back as a two-chunk SSE sequence
    /// — one chunk carrying the full content with `finish_reason: null`,
    /// a second carrying only the `finish_reason`.
    async fn stream_chat_completion(
        &self,
        request: ChatRequest,
    ) -> Result<StreamResult, ProviderError> {
        let response = self.chat_completion(request).await?;
        let [first, second] = synthesize_stream_chunks(response);

        let out = stream! {
            yield Ok(first);
            yield Ok(second);
        };

        Ok(Box::pin(out))
    }

    async fn health_check(&self) -> Result<ProviderHealth, ProviderError> {
        let start = Instant::now();
        let result = self.access_token().await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    #[test]
    fn splits_system_message_into_system_instruction() {
        let request = ChatRequest {
            model: "gemini-1.5-pro".to_string(),
            messages: vec![
                Message::system("be terse"),
                Message::user("hello"),
            ],
            ..Default::default()
        };
        let body = to_generate_content_request(&request);
        assert!(body.system_instruction.is_some());
        assert_eq!(body.contents.len(), 1);
        assert_eq!(body.contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn finish_reason_maps_to_openai_vocabulary() {
        assert_eq!(map_finish_reason(Some("STOP".to_string())).as_deref(), Some("stop"));
        assert_eq!(map_finish_reason(Some("MAX_TOKENS".to_string())).as_deref(), Some("length"));
        assert_eq!(map_finish_reason(Some("SAFETY".to_string())).as_deref(), Some("content_filter"));
        assert_eq!(map_finish_reason(None), None);
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let request = ChatRequest {
            model: "gemini-1.5-pro".to_string(),
            messages: vec![Message::assistant("prior reply")],
            ..Default::default()
        };
        let body = to_generate_content_request(&request);
        assert_eq!(body.contents[0].role.as_deref(), Some("model"));
    }

    #[test]
    fn stream_synthesis_yields_content_then_finish_reason() {
        let response = from_generate_content_response(
            "gemini-1.5-pro",
            GenerateContentResponse {
                candidates: vec![Candidate {
                    content: Content {
                        role: Some("model".to_string()),
                        parts: vec![Part {
                            text: "hello there".to_string(),
                        }],
                    },
                    finish_reason: Some("STOP".to_string()),
                }],
                usage_metadata: Some(UsageMetadata {
                    prompt_token_count: 3,
                    candidates_token_count: 2,
                    total_token_count: 5,
                }),
            },
        );

        let [first, second] = synthesize_stream_chunks(response);

        assert_eq!(first.choices[0].delta.content.as_deref(), Some("hello there"));
        assert_eq!(first.choices[0].finish_reason, None);
        assert!(first.usage.is_none());

        assert!(second.choices[0].delta.content.is_none());
        assert_eq!(second.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(second.usage.as_ref().unwrap().total_tokens, 5);
    }
}
