//! # Aperture Gateway
//!
//! A multi-tenant AI inference gateway: one HTTP surface in front of
//! several upstream LLM/image providers, metering usage against per-user
//! credit balances and plan entitlements, with per-(model, provider)
//! circuit breaking and failover when an upstream misbehaves.
//!
//! ## Architecture
//!
//! - **`store`**: typed accessors over users, keys, plans, rate windows,
//!   usage, and the audit log, plus an in-memory reference implementation.
//! - **`config`**: TOML configuration with environment-variable overrides.
//! - **`auth`**: resolves a bearer credential to an authenticated principal.
//! - **`entitlement`**: resolves a user's plan/trial state and enforces its
//!   daily/monthly caps.
//! - **`rate_limiter`**: sliding-window admission control and usage
//!   recording, independent of entitlement caps.
//! - **`providers`**: builds the concrete provider adapters (from
//!   `aperture-models-sdk`) this gateway dispatches to.
//! - **`orchestrator`**: the request pipeline tying the above together —
//!   entitlement, admission, provider selection with failover, and the
//!   credit/usage accounting that runs once a provider has answered.
//! - **`audit`**: fire-and-forget audit log writes.
//! - **`handlers`** / **`server`** / **`middleware`**: the Axum HTTP layer.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use aperture_gateway::{config::Config, server::create_server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml")?;
//!     let app = create_server(config).await?;
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod auth;
pub mod config;
pub mod entitlement;
pub mod gateway_error;
pub mod handlers;
pub mod middleware;
pub mod orchestrator;
pub mod providers;
pub mod rate_limiter;
pub mod server;
pub mod store;

pub use server::create_server;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::StatusCode;
    use axum_test::TestServer;

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let app = create_server(Config::default()).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server.get("/health").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn models_endpoint_lists_registry_overlay() {
        let mut config = Config::default();
        config.registry.models.push(aperture_models_sdk::registry::CanonicalModel {
            id: "gpt-4o".to_string(),
            display_name: "GPT-4o".to_string(),
            description: None,
            context_length: Some(128_000),
            modalities: vec!["text".to_string()],
            providers: vec![],
        });
        let app = create_server(config).await.unwrap();
        let server = TestServer::new(app).unwrap();
        let response = server.get("/v1/models").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body = response.json::<serde_json::Value>();
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }
}
