//! Configuration: TOML file plus environment-variable overrides, loaded in
//! three phases — `load` / `apply_env_overrides` / `validate`. Sections:
//! `[server]`, `[store]`, `[registry]`, `[providers]`,
//! `[rate_limiting.plans]`, `[circuit_breaker]`, `[vertex]`, `[admin]`,
//! `[pricing]`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use aperture_models_sdk::providers::ProviderConfig;
use aperture_models_sdk::registry::CanonicalModel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    /// Provider adapter configs keyed by adapter name ("openrouter", "vertex", ...).
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub rate_limiting: RateLimitingConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub vertex: VertexConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "aperture_models_sdk::common::duration_serde")]
    pub timeout: Duration,
    pub max_body_size: usize,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
}

/// Only `kind = "memory"` ships today; the field and env vars exist so a
/// future external backend is a drop-in, not a breaking change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(with = "aperture_models_sdk::common::duration_serde")]
    pub refresh_interval: Duration,
    /// Static overlay of first-party canonical models, loaded at startup.
    #[serde(default)]
    pub models: Vec<CanonicalModel>,
}

/// Per-plan request/token windows. Field names match `PlanType` values
/// lower-cased ("free", "dev", "team", "customize").
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PlanLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub requests_per_day: u64,
    pub tokens_per_minute: u64,
    pub tokens_per_hour: u64,
    pub tokens_per_day: u64,
    pub burst: u64,
    pub max_concurrent_requests: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    pub plans: HashMap<String, PlanLimits>,
}

impl RateLimitingConfig {
    /// `free`/`dev`/`team`/`customize` plan defaults.
    pub fn defaults() -> Self {
        let mut plans = HashMap::new();
        plans.insert(
            "free".to_string(),
            PlanLimits {
                requests_per_minute: 60,
                requests_per_hour: 1000,
                requests_per_day: 10000,
                tokens_per_minute: 10000,
                tokens_per_hour: 100000,
                tokens_per_day: 1000000,
                burst: 10,
                max_concurrent_requests: 5,
            },
        );
        plans.insert(
            "dev".to_string(),
            PlanLimits {
                requests_per_minute: 300,
                requests_per_hour: 5000,
                requests_per_day: 50000,
                tokens_per_minute: 50000,
                tokens_per_hour: 500000,
                tokens_per_day: 5000000,
                burst: 50,
                max_concurrent_requests: 20,
            },
        );
        let team_and_up = PlanLimits {
            requests_per_minute: 1000,
            requests_per_hour: 20000,
            requests_per_day: 200000,
            tokens_per_minute: 200000,
            tokens_per_hour: 2000000,
            tokens_per_day: 20000000,
            burst: 100,
            max_concurrent_requests: 50,
        };
        plans.insert("team".to_string(), team_and_up);
        plans.insert("customize".to_string(), team_and_up);
        Self { plans }
    }

    pub fn for_plan(&self, plan_type: &str) -> PlanLimits {
        self.plans
            .get(plan_type)
            .copied()
            .unwrap_or_else(|| {
                self.plans
                    .get("free")
                    .copied()
                    .expect("free plan defaults always present")
            })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_seconds: 300,
        }
    }
}

/// Google Vertex AI service-account and project settings. Left empty unless
/// the deployment actually routes to Vertex.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertexConfig {
    pub project_id: Option<String>,
    pub location: Option<String>,
    /// Raw or base64-encoded service-account JSON.
    pub credentials_json: Option<String>,
    /// Path to a service-account JSON file, used when `credentials_json` is unset.
    pub credentials_file: Option<String>,
    pub endpoint_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub api_key: Option<String>,
}

/// Whether provider-reported per-token rates win over the legacy flat
/// conversion when computing credit cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricingConfig {
    pub prefer_provider_rates: bool,
    pub flat_rate_credit_per_token: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            prefer_provider_rates: true,
            flat_rate_credit_per_token: 0.00002,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogOutput {
    Stdout,
    File { path: String },
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("GATEWAY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port_str) = env::var("GATEWAY_PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid GATEWAY_PORT: {}", port_str))?;
            self.server.port = port;
        }
        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            let valid = ["trace", "debug", "info", "warn", "error"];
            if valid.contains(&level.as_str()) {
                self.logging.level = level;
            } else {
                return Err(anyhow::anyhow!(
                    "invalid GATEWAY_LOG_LEVEL: {}. use: {:?}",
                    level,
                    valid
                ));
            }
        }

        if let Ok(url) = env::var("STORE_URL") {
            self.store.url = Some(url);
        }
        if let Ok(key) = env::var("STORE_KEY") {
            self.store.key = Some(key);
        }

        for (provider_name, provider_config) in &mut self.providers {
            let env_key = format!("{}_API_KEY", provider_name.to_uppercase().replace('-', "_"));
            if let Ok(api_key) = env::var(&env_key) {
                if !api_key.is_empty() {
                    provider_config.api_key = api_key;
                }
            }
        }
        if let Ok(site_url) = env::var("OPENROUTER_SITE_URL") {
            if let Some(openrouter) = self.providers.get_mut("openrouter") {
                openrouter
                    .headers
                    .insert("HTTP-Referer".to_string(), site_url);
            }
        }
        if let Ok(site_name) = env::var("OPENROUTER_SITE_NAME") {
            if let Some(openrouter) = self.providers.get_mut("openrouter") {
                openrouter
                    .headers
                    .insert("X-Title".to_string(), site_name);
            }
        }

        if let Ok(project_id) = env::var("GOOGLE_PROJECT_ID") {
            self.vertex.project_id = Some(project_id);
        }
        if let Ok(location) = env::var("GOOGLE_VERTEX_LOCATION") {
            self.vertex.location = Some(location);
        }
        if let Ok(creds) = env::var("GOOGLE_VERTEX_CREDENTIALS_JSON") {
            self.vertex.credentials_json = Some(creds);
        }
        if let Ok(path) = env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            self.vertex.credentials_file = Some(path);
        }
        if let Ok(endpoint_id) = env::var("GOOGLE_VERTEX_ENDPOINT_ID") {
            self.vertex.endpoint_id = Some(endpoint_id);
        }

        if let Ok(admin_key) = env::var("ADMIN_API_KEY") {
            self.admin.api_key = Some(admin_key);
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("server host cannot be empty"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port must be between 1 and 65535"));
        }
        if self.server.timeout.as_secs() == 0 {
            return Err(anyhow::anyhow!("server timeout cannot be 0"));
        }
        if self.server.cors.enabled && self.server.cors.allowed_origins.is_empty() {
            return Err(anyhow::anyhow!(
                "cors enabled but no allowed_origins configured"
            ));
        }

        if self.store.kind != "memory" {
            return Err(anyhow::anyhow!(
                "unsupported store.kind: {} (only \"memory\" ships)",
                self.store.kind
            ));
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(anyhow::anyhow!("circuit_breaker.failure_threshold cannot be 0"));
        }
        if self.circuit_breaker.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("circuit_breaker.timeout_seconds cannot be 0"));
        }

        if !self.rate_limiting.plans.contains_key("free") {
            return Err(anyhow::anyhow!(
                "rate_limiting.plans must define a \"free\" tier as the fallback default"
            ));
        }
        for (plan, limits) in &self.rate_limiting.plans {
            if limits.requests_per_minute == 0 {
                return Err(anyhow::anyhow!(
                    "plan {} has a zero requests_per_minute limit",
                    plan
                ));
            }
            if limits.max_concurrent_requests == 0 {
                return Err(anyhow::anyhow!(
                    "plan {} has a zero max_concurrent_requests limit",
                    plan
                ));
            }
        }

        for (name, provider) in &self.providers {
            if !provider.enabled {
                continue;
            }
            if provider.timeout.as_secs() == 0 {
                return Err(anyhow::anyhow!("provider {} has a zero timeout", name));
            }
            if let Some(base_url) = &provider.base_url {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    return Err(anyhow::anyhow!(
                        "provider {} base_url must start with http:// or https://",
                        name
                    ));
                }
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "invalid logging.level: {}. must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                timeout: Duration::from_secs(120),
                max_body_size: 10 * 1024 * 1024,
                cors: CorsConfig {
                    enabled: true,
                    allowed_origins: vec!["*".to_string()],
                    allowed_methods: vec!["GET".to_string(), "POST".to_string()],
                    allowed_headers: vec!["*".to_string()],
                },
            },
            store: StoreConfig {
                kind: "memory".to_string(),
                url: None,
                key: None,
            },
            registry: RegistryConfig {
                refresh_interval: Duration::from_secs(300),
                models: vec![],
            },
            providers: HashMap::new(),
            rate_limiting: RateLimitingConfig::defaults(),
            circuit_breaker: CircuitBreakerSettings::default(),
            vertex: VertexConfig::default(),
            admin: AdminConfig { api_key: None },
            pricing: PricingConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: LogFormat::Pretty,
                output: LogOutput::Stdout,
            },
        }
    }
}

pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    aperture_models_sdk::common::duration_serde::parse_duration(s).map_err(|e| anyhow::anyhow!(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_memory_store_kind_fails_validation() {
        let mut config = Config::default();
        config.store.kind = "postgres".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rate_limiting_defaults_match_plan_table() {
        let limits = RateLimitingConfig::defaults();
        assert_eq!(limits.for_plan("free").requests_per_minute, 60);
        assert_eq!(limits.for_plan("dev").requests_per_minute, 300);
        assert_eq!(limits.for_plan("team").requests_per_minute, 1000);
        assert_eq!(limits.for_plan("customize").requests_per_day, 200000);
        assert_eq!(limits.for_plan("unknown-plan").requests_per_minute, 60);
    }

    #[test]
    fn env_overrides_apply_host_and_port() {
        std::env::set_var("GATEWAY_HOST", "0.0.0.0");
        std::env::set_var("GATEWAY_PORT", "8080");
        let mut config = Config::default();
        config.apply_env_overrides().unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        std::env::remove_var("GATEWAY_HOST");
        std::env::remove_var("GATEWAY_PORT");
    }
}
