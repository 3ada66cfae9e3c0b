//! HTTP server assembly: builds `AppState` from a loaded `Config` and wires
//! it into the Axum router fronting chat, image, catalog, health, and
//! admin-status endpoints.
//!
//! `AppState` holds config behind an `Arc`, is cloned into every handler,
//! and middleware is applied via `ServiceBuilder` before `.with_state`.
//! There is no plugin manager, cache manager, or websocket manager —
//! admin/dashboard surfaces are out of scope — only the components this
//! gateway actually needs: the store, the canonical registry, the circuit
//! breaker's health tracker, the provider table, and the orchestrator that
//! ties them together.

use crate::config::Config;
use crate::handlers;
use crate::middleware::{cors_layer, request_logging_middleware};
use crate::orchestrator::Orchestrator;
use crate::providers::ProviderTable;
use crate::rate_limiter;
use crate::store::{InMemoryStore, Store};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use aperture_models_sdk::registry::{ingest_catalogs, CanonicalModel, Registry};
use aperture_models_sdk::selector::{CircuitBreakerConfig, HealthTracker};

/// Shared state handed to every handler. Cheap to clone: every field is an
/// `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<Registry>,
    pub orchestrator: Arc<Orchestrator>,
}

/// Fetches every configured chat adapter's own model catalog in parallel.
/// A provider with no discoverable catalog (the trait default, e.g. Vertex)
/// or one whose fetch fails contributes nothing and is logged, not fatal —
/// the registry still has its static overlay to fall back on.
async fn fetch_catalogs(providers: &ProviderTable) -> Vec<(String, Vec<aperture_models_sdk::registry::RawModel>)> {
    let fetches = providers.all_chat().into_iter().map(|(name, provider)| async move {
        match provider.list_models().await {
            Ok(models) => Some((name, models)),
            Err(err) => {
                tracing::warn!(provider = %name, error = %err, "catalog fetch failed; falling back to static overlay");
                None
            }
        }
    });
    futures::future::join_all(fetches)
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Builds the canonical registry by fetching each provider's catalog and
/// merging it with `[registry.models]`'s static overlay via
/// `ingest_catalogs`. Overlay entries take priority on id collisions, so a
/// hand-tuned entry (e.g. Vertex-primary-with-OpenRouter-fallback pricing)
/// survives a refresh even if a generic adapter also reports that model.
/// `/admin/registry/refresh` reruns this same merge against the current
/// provider table on demand.
pub async fn build_registry(config: &Config, providers: &ProviderTable) -> Registry {
    let catalogs = fetch_catalogs(providers).await;
    let merged = ingest_catalogs(catalogs, config.registry.models.clone());
    Registry::new(merged)
}

/// Re-fetches every provider's catalog and swaps it into `registry` via
/// `Registry::reload`, returning the number of canonical models afterward.
pub async fn refresh_registry(
    registry: &Registry,
    config: &Config,
    providers: &ProviderTable,
) -> usize {
    let catalogs = fetch_catalogs(providers).await;
    let merged: Vec<CanonicalModel> = ingest_catalogs(catalogs, config.registry.models.clone());
    let count = merged.len();
    registry.reload(merged);
    count
}

fn build_health_tracker(config: &Config) -> HealthTracker {
    HealthTracker::new(CircuitBreakerConfig {
        failure_threshold: config.circuit_breaker.failure_threshold,
        timeout: std::time::Duration::from_secs(config.circuit_breaker.timeout_seconds),
    })
}

pub async fn create_server(config: Config) -> anyhow::Result<Router> {
    if config.server.cors.enabled && config.server.cors.allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!(
            "cors is enabled with wildcard origins; configure explicit allowed_origins for production"
        );
    }

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let providers = Arc::new(ProviderTable::build(&config)?);
    let registry = Arc::new(build_registry(&config, &providers).await);
    let health = Arc::new(build_health_tracker(&config));
    let config = Arc::new(config);

    let orchestrator = Arc::new(Orchestrator {
        config: config.clone(),
        store: store.clone(),
        registry: registry.clone(),
        health,
        providers,
        concurrency: Arc::new(rate_limiter::ConcurrencyTracker::new()),
    });

    let state = AppState {
        config: config.clone(),
        store,
        registry,
        orchestrator,
    };

    let app = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/images/generations", post(handlers::image_generations))
        .route("/v1/models", get(handlers::list_models))
        .route("/models", get(handlers::list_models))
        .route("/health", get(handlers::health_check))
        .route("/admin/providers", get(handlers::admin_providers))
        .route("/admin/config", get(handlers::admin_config))
        .route("/admin/circuit-breakers", get(handlers::admin_circuit_breakers))
        .route("/admin/registry/refresh", post(handlers::admin_refresh_registry))
        .layer(
            ServiceBuilder::new()
                .layer(cors_layer(&config.server.cors))
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(TimeoutLayer::new(config.server.timeout)),
        )
        .with_state(state);

    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.server.port = 0;
        config
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let app = create_server(test_config()).await.unwrap();
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server.get("/health").await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn unauthenticated_chat_completion_is_rejected() {
        let app = create_server(test_config()).await.unwrap();
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server
            .post("/v1/chat/completions")
            .json(&serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .await;
        response.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn models_listing_is_public() {
        let app = create_server(test_config()).await.unwrap();
        let server = axum_test::TestServer::new(app).unwrap();
        let response = server.get("/v1/models").await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn admin_routes_require_admin_secret() {
        let mut config = test_config();
        config.admin.api_key = Some("admin-secret".to_string());
        let app = create_server(config).await.unwrap();
        let server = axum_test::TestServer::new(app).unwrap();

        let unauthenticated = server.get("/admin/providers").await;
        unauthenticated.assert_status(axum::http::StatusCode::UNAUTHORIZED);

        let authenticated = server
            .get("/admin/config")
            .add_header(
                axum::http::header::AUTHORIZATION,
                "Bearer admin-secret",
            )
            .await;
        authenticated.assert_status_ok();
    }

    #[tokio::test]
    async fn registry_refresh_requires_admin_secret_and_reports_model_count() {
        let mut config = test_config();
        config.admin.api_key = Some("admin-secret".to_string());
        let app = create_server(config).await.unwrap();
        let server = axum_test::TestServer::new(app).unwrap();

        let unauthenticated = server.post("/admin/registry/refresh").await;
        unauthenticated.assert_status(axum::http::StatusCode::UNAUTHORIZED);

        let response = server
            .post("/admin/registry/refresh")
            .add_header(axum::http::header::AUTHORIZATION, "Bearer admin-secret")
            .await;
        response.assert_status_ok();
        let body: serde_json::Value = response.json();
        assert!(body.get("models_loaded").is_some());
    }
}
