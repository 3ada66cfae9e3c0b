//! Canonical model registry.
//!
//! A canonical model id (what callers put in `ChatRequest.model`, e.g.
//! `"gpt-4o"`) maps to an ordered list of providers that can serve it,
//! each with its own cost, feature set, and provider-side raw model id.
//! The registry also resolves the reverse direction: a provider + its own
//! model id back to the canonical id, needed when a provider reports
//! errors or usage keyed on its own naming.
//!
//! Reads are lock-free: the whole registry is held behind an `ArcSwap` and
//! snapshotted, so request handling never blocks on a writer reloading
//! config or refreshing provider catalogs.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One model as a provider's own catalog describes it, before it has been
/// normalised into a canonical id and merged into a `CanonicalModel`. This is
/// the "tagged union of adapter-specific descriptors" the design notes call
/// for: every adapter's `list_models()` produces these, regardless of how
/// heterogeneous the upstream catalog response actually is.
#[derive(Debug, Clone)]
pub struct RawModel {
    pub native_id: String,
    pub display_name: Option<String>,
    pub context_length: Option<u32>,
}

/// Prefixes a provider's catalog commonly hangs off its model ids that carry
/// no information once the provider is already known from context.
const KNOWN_ID_PREFIXES: &[&str] = &[
    "openai/",
    "google/",
    "anthropic/",
    "meta-llama/",
    "mistralai/",
    "models/",
    "publishers/google/models/",
];

/// Fixed provider-reliability ordering used to assign a default priority to
/// ingested catalog entries. Lower sorts first (see `RegistryProviderEntry`).
/// First-party router/primary adapters are tried before generic pass-through
/// aggregators; anything unlisted falls to the back of the queue.
fn provider_reliability_priority(provider: &str) -> u32 {
    match provider {
        "vertex" => 1,
        "openrouter" => 2,
        "fireworks" => 3,
        "together" => 4,
        "deepinfra" => 5,
        "portkey" => 6,
        _ => 50,
    }
}

/// Normalises a provider-native model id into a canonical id: strips a known
/// provider prefix, lower-cases, and collapses `3p1`-style version variants
/// (used by ids that can't carry a literal `.`) into `3.1`.
pub fn canonicalize_native_id(native_id: &str) -> String {
    let mut id = native_id.trim().to_lowercase();
    for prefix in KNOWN_ID_PREFIXES {
        if let Some(stripped) = id.strip_prefix(prefix) {
            id = stripped.to_string();
            break;
        }
    }
    collapse_version_variant(&id)
}

fn collapse_version_variant(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    let mut out = String::with_capacity(id.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_ascii_digit()
            && i + 2 < chars.len()
            && chars[i + 1] == 'p'
            && chars[i + 2].is_ascii_digit()
        {
            out.push(chars[i]);
            out.push('.');
            i += 2;
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Merges per-provider catalogs (as ingested via `Provider::list_models`)
/// into canonical models, on top of a static first-party overlay (e.g. the
/// Google family with Vertex primary + OpenRouter fallback, configured by
/// hand rather than discovered). Overlay entries win ties on canonical id:
/// an ingested provider is appended to an overlay model's provider list
/// rather than replacing it, so hand-tuned priority/pricing on the overlay
/// entry survives a refresh.
pub fn ingest_catalogs(
    catalogs: Vec<(String, Vec<RawModel>)>,
    overlay: Vec<CanonicalModel>,
) -> Vec<CanonicalModel> {
    let mut models: HashMap<String, CanonicalModel> = HashMap::new();
    for model in overlay {
        models.insert(model.id.clone(), model);
    }

    for (provider, raws) in catalogs {
        for raw in raws {
            let canonical_id = canonicalize_native_id(&raw.native_id);
            let already_present = models.get(&canonical_id).map(|m| {
                m.providers
                    .iter()
                    .any(|p| p.provider == provider && p.provider_model_id == raw.native_id)
            });
            if already_present == Some(true) {
                continue;
            }

            let entry = RegistryProviderEntry {
                provider: provider.clone(),
                provider_model_id: raw.native_id.clone(),
                priority: provider_reliability_priority(&provider),
                cost_per_1k_input: None,
                cost_per_1k_output: None,
                max_tokens: None,
                features: vec![],
                supports_streaming: true,
                supports_function_calling: true,
                requires_credentials: true,
                enabled: true,
            };

            models
                .entry(canonical_id.clone())
                .or_insert_with(|| CanonicalModel {
                    id: canonical_id.clone(),
                    display_name: raw
                        .display_name
                        .clone()
                        .unwrap_or_else(|| canonical_id.clone()),
                    description: None,
                    context_length: raw.context_length,
                    modalities: vec!["text".to_string()],
                    providers: vec![],
                })
                .providers
                .push(entry);
        }
    }

    models.into_values().collect()
}

/// One provider's offering of a canonical model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryProviderEntry {
    /// Provider adapter name, e.g. "openrouter", "vertex".
    pub provider: String,
    /// The model id as that provider expects it, e.g. "openai/gpt-4o".
    pub provider_model_id: String,
    /// Lower sorts first; primary candidate during selection.
    pub priority: u32,
    pub cost_per_1k_input: Option<f64>,
    pub cost_per_1k_output: Option<f64>,
    /// Provider-declared output cap for this model, if it differs from the
    /// gateway-wide hard cap.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub features: Vec<String>,
    pub supports_streaming: bool,
    pub supports_function_calling: bool,
    /// Whether this provider entry needs a configured credential to be
    /// usable; `false` for adapters that work unauthenticated.
    #[serde(default = "default_true")]
    pub requires_credentials: bool,
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The full set of providers that can serve one logical model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalModel {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub context_length: Option<u32>,
    /// What this model accepts/produces, e.g. `["text"]`, `["text", "image"]`.
    #[serde(default)]
    pub modalities: Vec<String>,
    pub providers: Vec<RegistryProviderEntry>,
}

impl CanonicalModel {
    /// Providers able to serve this model right now, cheapest-priority first.
    pub fn enabled_providers(&self) -> Vec<&RegistryProviderEntry> {
        let mut enabled: Vec<&RegistryProviderEntry> =
            self.providers.iter().filter(|p| p.enabled).collect();
        enabled.sort_by_key(|p| p.priority);
        enabled
    }

    pub fn primary_provider(&self) -> Option<&RegistryProviderEntry> {
        self.enabled_providers().into_iter().next()
    }
}

#[derive(Debug, Default)]
struct RegistrySnapshot {
    models: HashMap<String, CanonicalModel>,
    /// (provider, provider_model_id) -> canonical id, for error/usage resolution.
    bridge: HashMap<(String, String), String>,
}

fn build_snapshot(models: Vec<CanonicalModel>) -> RegistrySnapshot {
    let mut snapshot = RegistrySnapshot::default();
    for model in models {
        for provider in &model.providers {
            snapshot.bridge.insert(
                (provider.provider.clone(), provider.provider_model_id.clone()),
                model.id.clone(),
            );
        }
        snapshot.models.insert(model.id.clone(), model);
    }
    snapshot
}

/// Lock-free, atomically-swappable registry of canonical models.
pub struct Registry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl Registry {
    pub fn new(models: Vec<CanonicalModel>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(build_snapshot(models)),
        }
    }

    /// Atomically replace the whole model set, e.g. after a periodic refresh
    /// or an admin-triggered reload of the static overlay config.
    pub fn reload(&self, models: Vec<CanonicalModel>) {
        self.snapshot.store(Arc::new(build_snapshot(models)));
    }

    pub fn get(&self, canonical_id: &str) -> Option<CanonicalModel> {
        self.snapshot.load().models.get(canonical_id).cloned()
    }

    pub fn resolve_canonical_id(&self, provider: &str, provider_model_id: &str) -> Option<String> {
        self.snapshot
            .load()
            .bridge
            .get(&(provider.to_string(), provider_model_id.to_string()))
            .cloned()
    }

    pub fn list_models(&self) -> Vec<CanonicalModel> {
        self.snapshot.load().models.values().cloned().collect()
    }

    /// Case-insensitive substring search over id and display name, capped at
    /// `limit` results. Used by the `/v1/models` listing's `?search=` param.
    pub fn search(&self, query: &str, limit: usize) -> Vec<CanonicalModel> {
        let needle = query.to_lowercase();
        let snapshot = self.snapshot.load();
        let mut matches: Vec<CanonicalModel> = snapshot
            .models
            .values()
            .filter(|model| {
                model.id.to_lowercase().contains(&needle)
                    || model.display_name.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id.cmp(&b.id));
        matches.truncate(limit);
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_model() -> CanonicalModel {
        CanonicalModel {
            id: "gpt-4o".to_string(),
            display_name: "GPT-4o".to_string(),
            description: Some("OpenAI's multimodal flagship".to_string()),
            context_length: Some(128_000),
            modalities: vec!["text".to_string(), "image".to_string()],
            providers: vec![
                RegistryProviderEntry {
                    provider: "openrouter".to_string(),
                    provider_model_id: "openai/gpt-4o".to_string(),
                    priority: 10,
                    cost_per_1k_input: Some(0.005),
                    cost_per_1k_output: Some(0.015),
                    max_tokens: Some(4096),
                    features: vec!["function_calling".to_string()],
                    supports_streaming: true,
                    supports_function_calling: true,
                    requires_credentials: true,
                    enabled: true,
                },
                RegistryProviderEntry {
                    provider: "vertex".to_string(),
                    provider_model_id: "gpt-4o".to_string(),
                    priority: 5,
                    cost_per_1k_input: None,
                    cost_per_1k_output: None,
                    max_tokens: None,
                    features: vec![],
                    supports_streaming: true,
                    supports_function_calling: false,
                    requires_credentials: true,
                    enabled: true,
                },
            ],
        }
    }

    #[test]
    fn primary_provider_is_lowest_priority_number() {
        let model = sample_model();
        assert_eq!(model.primary_provider().unwrap().provider, "vertex");
    }

    #[test]
    fn disabled_providers_are_excluded() {
        let mut model = sample_model();
        model.providers[0].enabled = false;
        let enabled = model.enabled_providers();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].provider, "vertex");
    }

    #[test]
    fn resolves_provider_model_id_back_to_canonical() {
        let registry = Registry::new(vec![sample_model()]);
        assert_eq!(
            registry.resolve_canonical_id("openrouter", "openai/gpt-4o"),
            Some("gpt-4o".to_string())
        );
        assert_eq!(registry.resolve_canonical_id("openrouter", "nope"), None);
    }

    #[test]
    fn search_matches_id_and_display_name_case_insensitively() {
        let registry = Registry::new(vec![sample_model()]);
        assert_eq!(registry.search("GPT-4O", 10).len(), 1);
        assert_eq!(registry.search("multimodal", 10).len(), 0);
        assert_eq!(registry.search("nonexistent", 10).len(), 0);
    }

    #[test]
    fn reload_replaces_snapshot_atomically() {
        let registry = Registry::new(vec![sample_model()]);
        assert!(registry.get("gpt-4o").is_some());
        registry.reload(vec![]);
        assert!(registry.get("gpt-4o").is_none());
    }

    #[test]
    fn canonicalize_strips_known_prefixes_and_lowercases() {
        assert_eq!(canonicalize_native_id("openai/GPT-4o"), "gpt-4o");
        assert_eq!(canonicalize_native_id("google/gemini-1.5-pro"), "gemini-1.5-pro");
    }

    #[test]
    fn canonicalize_collapses_p_separated_version_variants() {
        assert_eq!(canonicalize_native_id("meta-llama/llama-3p1-70b"), "llama-3.1-70b");
    }

    #[test]
    fn ingest_groups_raw_models_by_canonical_id_with_reliability_priority() {
        let catalogs = vec![
            (
                "openrouter".to_string(),
                vec![RawModel {
                    native_id: "openai/gpt-4o".to_string(),
                    display_name: None,
                    context_length: Some(128_000),
                }],
            ),
            (
                "vertex".to_string(),
                vec![RawModel {
                    native_id: "gpt-4o".to_string(),
                    display_name: None,
                    context_length: None,
                }],
            ),
        ];
        let models = ingest_catalogs(catalogs, vec![]);
        assert_eq!(models.len(), 1);
        let model = &models[0];
        assert_eq!(model.id, "gpt-4o");
        let primary = model.primary_provider().unwrap();
        assert_eq!(primary.provider, "vertex");
    }

    #[test]
    fn ingest_appends_to_overlay_rather_than_replacing_it() {
        let overlay = vec![sample_model()];
        let catalogs = vec![(
            "deepinfra".to_string(),
            vec![RawModel {
                native_id: "gpt-4o".to_string(),
                display_name: None,
                context_length: None,
            }],
        )];
        let models = ingest_catalogs(catalogs, overlay);
        assert_eq!(models.len(), 1);
        let model = &models[0];
        assert_eq!(model.providers.len(), 3);
        assert!(model.providers.iter().any(|p| p.provider == "deepinfra"));
        assert!(model.providers.iter().any(|p| p.provider == "openrouter"));
    }

    #[test]
    fn ingest_is_idempotent_on_repeated_refresh() {
        let catalogs = || {
            vec![(
                "openrouter".to_string(),
                vec![RawModel {
                    native_id: "openai/gpt-4o".to_string(),
                    display_name: None,
                    context_length: None,
                }],
            )]
        };
        let models = ingest_catalogs(catalogs(), ingest_catalogs(catalogs(), vec![]));
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].providers.len(), 1);
    }
}
