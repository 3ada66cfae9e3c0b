//! Builds the provider adapter instances the orchestrator dispatches to,
//! from `[providers.*]` config. One `Arc<dyn Provider>` per configured,
//! enabled adapter; Vertex additionally pulls its service-account material
//! from `[vertex]` rather than the generic `api_key` field.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use crate::config::{Config, VertexConfig};
use std::collections::HashMap;
use std::sync::Arc;
use aperture_models_sdk::providers::image::ImageProvider;
use aperture_models_sdk::providers::openai_compatible::OpenAICompatibleProvider;
use aperture_models_sdk::providers::vertex::VertexProvider;
use aperture_models_sdk::providers::{Provider, ProviderConfig};

/// Chat-capable and image-capable adapters, keyed by provider name. Most
/// OpenAI-compatible providers appear in both tables (the same upstream
/// serves both endpoint families); Vertex is chat-only.
pub struct ProviderTable {
    chat: HashMap<String, Arc<dyn Provider>>,
    image: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderTable {
    pub fn build(config: &Config) -> anyhow::Result<Self> {
        let mut chat = HashMap::new();
        let mut image = HashMap::new();

        for (name, provider_config) in &config.providers {
            if !provider_config.enabled {
                continue;
            }

            if name == "vertex" {
                let resolved = resolve_vertex_config(provider_config, &config.vertex)?;
                let provider = VertexProvider::new(resolved)?;
                chat.insert(name.clone(), Arc::new(provider) as Arc<dyn Provider>);
                continue;
            }

            let provider = OpenAICompatibleProvider::new(provider_config.clone())?;
            chat.insert(name.clone(), Arc::new(provider) as Arc<dyn Provider>);

            let image_provider = ImageProvider::new(provider_config.clone())?;
            image.insert(name.clone(), Arc::new(image_provider) as Arc<dyn Provider>);
        }

        Ok(Self { chat, image })
    }

    pub fn chat(&self, provider_name: &str) -> Option<Arc<dyn Provider>> {
        self.chat.get(provider_name).cloned()
    }

    pub fn image(&self, provider_name: &str) -> Option<Arc<dyn Provider>> {
        self.image.get(provider_name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.chat.keys().cloned().collect()
    }

    /// Every configured chat adapter, for catalog-ingestion fan-out. Image
    /// adapters aren't included: they're the same upstream under a
    /// different endpoint, not a distinct model catalog.
    pub fn all_chat(&self) -> Vec<(String, Arc<dyn Provider>)> {
        self.chat
            .iter()
            .map(|(name, provider)| (name.clone(), provider.clone()))
            .collect()
    }
}

/// Vertex's adapter expects `api_key` to carry the raw service-account JSON
/// and `headers["project_id"/"location"]` to carry routing info, neither of
/// which fits the generic `[providers.vertex]` shape, so those fields are
/// filled in from `[vertex]` here rather than asking operators to duplicate
/// them into `api_key`/`headers` by hand.
fn resolve_vertex_config(
    base: &ProviderConfig,
    vertex: &VertexConfig,
) -> anyhow::Result<ProviderConfig> {
    let mut config = base.clone();

    if config.api_key.is_empty() {
        if let Some(json) = &vertex.credentials_json {
            config.api_key = decode_credentials_json(json)?;
        } else if let Some(path) = &vertex.credentials_file {
            config.api_key = decode_credentials_json(&std::fs::read_to_string(path)?)?;
        } else {
            anyhow::bail!("vertex provider enabled but no credentials configured");
        }
    }

    if let Some(project_id) = &vertex.project_id {
        config
            .headers
            .entry("project_id".to_string())
            .or_insert_with(|| project_id.clone());
    }
    if let Some(location) = &vertex.location {
        config
            .headers
            .entry("location".to_string())
            .or_insert_with(|| location.clone());
    }

    Ok(config)
}

/// Accepts the service-account JSON either raw or base64-encoded, per
/// `GOOGLE_VERTEX_CREDENTIALS_JSON`'s documented either/or. A raw payload
/// always starts with `{` once whitespace is trimmed; anything else is
/// assumed to be base64 and decoded before being handed to `VertexProvider`.
fn decode_credentials_json(raw: &str) -> anyhow::Result<String> {
    if raw.trim_start().starts_with('{') {
        return Ok(raw.to_string());
    }
    let decoded = BASE64_STANDARD
        .decode(raw.trim())
        .map_err(|e| anyhow::anyhow!("vertex credentials are neither raw JSON nor valid base64: {e}"))?;
    String::from_utf8(decoded).map_err(|e| anyhow::anyhow!("decoded vertex credentials are not valid utf-8: {e}"))
}
