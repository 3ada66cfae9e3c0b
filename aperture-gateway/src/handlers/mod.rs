//! HTTP handlers for the gateway's public surface.
//!
//! Each handler is thin: extract the bearer credential and run it through
//! `auth.rs`'s gate, then hand the validated request to `orchestrator.rs`
//! for entitlement/rate-limit/provider-selection/accounting, and shape the
//! result into the wire response. Streaming uses a channel-plus-
//! `Sse::new(ReceiverStream::new(rx))` pattern, draining the upstream
//! stream in a spawned task and settling credit/usage accounting once
//! it's done.

use crate::auth::{self, AuthContext, RequestMetadata};
use crate::gateway_error::GatewayError;
use crate::server::AppState;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use aperture_models_sdk::models::{ChatRequest, ImageRequest};

fn extract_metadata(headers: &HeaderMap) -> RequestMetadata {
    RequestMetadata {
        ip: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').next().unwrap_or(v).trim().to_string()),
        referer: headers
            .get(axum::http::header::REFERER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
        user_agent: headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
    }
}

async fn authenticate_request(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, GatewayError> {
    let secret = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(GatewayError::InvalidCredential)?;
    let metadata = extract_metadata(headers);
    auth::authenticate(&state.store, secret, &metadata).await
}

/// `POST /v1/chat/completions`. Dispatches to SSE streaming when the
/// request sets `stream: true`; otherwise returns the OpenAI-shape
/// completion with `gateway_usage` appended.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, GatewayError> {
    let auth = authenticate_request(&state, &headers).await?;
    if !auth::authorize(&auth.scopes, "chat", &request.model) {
        return Err(GatewayError::InsufficientScope {
            action: "chat".to_string(),
            resource: request.model.clone(),
        });
    }

    if request.stream.unwrap_or(false) {
        return stream_chat_completions(state, auth, request)
            .await
            .map(IntoResponse::into_response);
    }

    let started_at = std::time::Instant::now();
    let outcome = state.orchestrator.chat_completion(&auth, request).await?;
    let request_ms = started_at.elapsed().as_millis() as u64;

    let user = state.store.get_user(&auth.user.id).await.unwrap_or_else(|_| auth.user.clone());
    let key_prefix: String = auth.key.secret.chars().take(8).collect();

    let mut body = serde_json::to_value(&outcome.response)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "gateway_usage".to_string(),
            json!({
                "tokens_charged": outcome.response.usage.total_tokens,
                "request_ms": request_ms,
                "user_balance_after": user.credits_micro,
                "user_api_key": key_prefix,
            }),
        );
    }

    Ok(Json(body).into_response())
}

async fn stream_chat_completions(
    state: AppState,
    auth: AuthContext,
    request: ChatRequest,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let request_messages = request.messages.clone();
    let outcome = state.orchestrator.stream_chat_completion(&auth, request).await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(100);
    let orchestrator = state.orchestrator.clone();

    tokio::spawn(async move {
        let mut outcome = outcome;
        let mut content = String::new();
        let mut finish_reason = None;

        while let Some(chunk_result) = outcome.stream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    if let Some(choice) = chunk.choices.first() {
                        if let Some(text) = &choice.delta.content {
                            content.push_str(text);
                        }
                        if choice.finish_reason.is_some() {
                            finish_reason = choice.finish_reason.clone();
                        }
                    }
                    let event_data = serde_json::to_string(&chunk).unwrap_or_default();
                    if tx.send(Ok(Event::default().data(event_data))).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "stream error");
                    let _ = tx
                        .send(Ok(Event::default().data(format!("{{\"error\": \"{e}\"}}"))))
                        .await;
                    break;
                }
            }
        }

        let _ = tx.send(Ok(Event::default().data("[DONE]"))).await;

        orchestrator
            .finalize_stream(&auth, &outcome, &request_messages, &content, finish_reason)
            .await;
    });

    Ok(Sse::new(ReceiverStream::new(rx)))
}

/// `POST /v1/images/generations`.
pub async fn image_generations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ImageRequest>,
) -> Result<Response, GatewayError> {
    let auth = authenticate_request(&state, &headers).await?;
    let resource = request.model.clone().unwrap_or_else(|| "*".to_string());
    if !auth::authorize(&auth.scopes, "images", &resource) {
        return Err(GatewayError::InsufficientScope {
            action: "images".to_string(),
            resource,
        });
    }

    let started_at = std::time::Instant::now();
    let outcome = state.orchestrator.image_generation(&auth, request).await?;
    let request_ms = started_at.elapsed().as_millis() as u64;

    let user = state.store.get_user(&auth.user.id).await.unwrap_or_else(|_| auth.user.clone());
    let key_prefix: String = auth.key.secret.chars().take(8).collect();

    let mut body = serde_json::to_value(&outcome.response)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    if let Some(obj) = body.as_object_mut() {
        obj.insert("provider".to_string(), json!(outcome.provider));
        obj.insert(
            "gateway_usage".to_string(),
            json!({
                "tokens_charged": 0,
                "request_ms": request_ms,
                "user_balance_after": user.credits_micro,
                "user_api_key": key_prefix,
            }),
        );
    }

    Ok(Json(body).into_response())
}

/// `GET /v1/models` and `GET /models`: the canonical catalog with a
/// provider summary, pricing, and context length per model. Unauthenticated
/// — the catalog isn't tenant-specific.
pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let models: Vec<serde_json::Value> = state
        .registry
        .list_models()
        .into_iter()
        .map(|model| {
            let providers: Vec<serde_json::Value> = model
                .enabled_providers()
                .into_iter()
                .map(|p| {
                    json!({
                        "provider": p.provider,
                        "priority": p.priority,
                        "cost_per_1k_input": p.cost_per_1k_input,
                        "cost_per_1k_output": p.cost_per_1k_output,
                        "supports_streaming": p.supports_streaming,
                        "supports_function_calling": p.supports_function_calling,
                    })
                })
                .collect();
            json!({
                "id": model.id,
                "object": "model",
                "display_name": model.display_name,
                "context_length": model.context_length,
                "modalities": model.modalities,
                "providers": providers,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": models }))
}

/// `GET /health`: liveness plus a best-effort check of the store and a
/// snapshot of registry/provider counts. Always `200` unless the process is
/// unable to reach its own in-memory store, which would indicate something
/// seriously wrong rather than a transient dependency outage.
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store_ok = state.store.list_plans().await.is_ok();
    Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store": if store_ok { "ok" } else { "unreachable" },
        "models_registered": state.registry.list_models().len(),
        "providers_configured": state.orchestrator.providers.names().len(),
    }))
}

fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> Result<(), GatewayError> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if auth::is_admin_secret(&state.config.admin.api_key, presented) {
        Ok(())
    } else {
        Err(GatewayError::AdminAuthRequired)
    }
}

/// `GET /admin/providers`: configured provider adapters, enabled flag, base
/// URL and timeout — no credential material.
pub async fn admin_providers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    authenticate_admin(&state, &headers)?;
    let providers: Vec<serde_json::Value> = state
        .config
        .providers
        .iter()
        .map(|(name, config)| {
            json!({
                "name": name,
                "enabled": config.enabled,
                "base_url": config.base_url,
                "timeout_secs": config.timeout.as_secs(),
            })
        })
        .collect();
    Ok(Json(json!({ "providers": providers })))
}

/// `GET /admin/config`: a sanitized snapshot of the running config, with no
/// credential material (api keys, admin secret).
pub async fn admin_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    authenticate_admin(&state, &headers)?;
    Ok(Json(json!({
        "server": {
            "host": state.config.server.host,
            "port": state.config.server.port,
            "timeout_secs": state.config.server.timeout.as_secs(),
        },
        "providers": state.config.providers.keys().collect::<Vec<_>>(),
        "registry": {
            "models_loaded": state.config.registry.models.len(),
        },
        "rate_limiting": {
            "plans": state.config.rate_limiting.plans.keys().collect::<Vec<_>>(),
        },
        "circuit_breaker": {
            "failure_threshold": state.config.circuit_breaker.failure_threshold,
            "timeout_seconds": state.config.circuit_breaker.timeout_seconds,
        },
    })))
}

/// `POST /admin/registry/refresh`: re-fetches every provider's catalog and
/// merges it with the static overlay, same as happens once at startup.
pub async fn admin_refresh_registry(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    authenticate_admin(&state, &headers)?;
    let models_loaded =
        crate::server::refresh_registry(&state.registry, &state.config, &state.orchestrator.providers)
            .await;
    Ok(Json(json!({ "models_loaded": models_loaded })))
}

/// `GET /admin/circuit-breakers`: per-(model, provider) breaker state.
pub async fn admin_circuit_breakers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    authenticate_admin(&state, &headers)?;
    let breakers: Vec<serde_json::Value> = state
        .orchestrator
        .health
        .snapshot()
        .await
        .into_iter()
        .map(|status| {
            json!({
                "model_id": status.model_id,
                "provider": status.provider,
                "consecutive_failures": status.consecutive_failures,
                "open": status.open,
            })
        })
        .collect();
    Ok(Json(json!({ "breakers": breakers })))
}
