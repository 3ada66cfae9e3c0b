//! Provider selection with per-(model, provider) circuit breaking and
//! failover.
//!
//! Health is tracked per `(canonical_model_id, provider_name)` pair using
//! a two-state model: closed, then open until `timeout_seconds` elapses,
//! at which point the next call is let through and success/failure
//! decides whether it reopens or resets to closed. This is deliberately
//! simpler than a generic 3-state breaker with half-open call counting
//! and a single globally tracked provider health — the per-(model,
//! provider) granularity this gateway needs doesn't call for it.

use crate::registry::{CanonicalModel, Registry, RegistryProviderEntry};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
}

/// Tracks consecutive-failure counts and open/disabled windows per
/// (canonical_model_id, provider_name) pair.
pub struct HealthTracker {
    config: CircuitBreakerConfig,
    entries: DashMap<(String, String), Arc<RwLock<BreakerEntry>>>,
}

impl HealthTracker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    fn entry(&self, model_id: &str, provider: &str) -> Arc<RwLock<BreakerEntry>> {
        self.entries
            .entry((model_id.to_string(), provider.to_string()))
            .or_insert_with(|| Arc::new(RwLock::new(BreakerEntry::default())))
            .clone()
    }

    /// Whether this provider can currently be tried for this model. Lazily
    /// clears an expired disabled window (resetting failures to zero) so a
    /// provider naturally re-enters rotation without a background sweep.
    pub async fn is_available(&self, model_id: &str, provider: &str) -> bool {
        let entry = self.entry(model_id, provider);
        let mut guard = entry.write().await;
        if let Some(disabled_until) = guard.disabled_until {
            if Instant::now() >= disabled_until {
                guard.disabled_until = None;
                guard.consecutive_failures = 0;
            } else {
                return false;
            }
        }
        true
    }

    pub async fn record_success(&self, model_id: &str, provider: &str) {
        let entry = self.entry(model_id, provider);
        let mut guard = entry.write().await;
        guard.consecutive_failures = 0;
        guard.disabled_until = None;
    }

    /// Point-in-time view of every (model, provider) breaker that has ever
    /// recorded a failure or success, for read-only status reporting.
    pub async fn snapshot(&self) -> Vec<BreakerStatus> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in self.entries.iter() {
            let (model_id, provider) = entry.key().clone();
            let guard = entry.value().read().await;
            out.push(BreakerStatus {
                model_id,
                provider,
                consecutive_failures: guard.consecutive_failures,
                open: guard.disabled_until.map(|until| until > Instant::now()).unwrap_or(false),
            });
        }
        out
    }

    /// Returns `true` if this failure tripped the breaker open.
    pub async fn record_failure(&self, model_id: &str, provider: &str) -> bool {
        let entry = self.entry(model_id, provider);
        let mut guard = entry.write().await;
        guard.consecutive_failures += 1;
        if guard.consecutive_failures >= self.config.failure_threshold {
            guard.disabled_until = Some(Instant::now() + self.config.timeout);
            tracing::warn!(
                model_id,
                provider,
                failures = guard.consecutive_failures,
                "circuit opened for provider"
            );
            true
        } else {
            false
        }
    }
}

/// Read-only view of one (model, provider) breaker's state.
#[derive(Debug, Clone)]
pub struct BreakerStatus {
    pub model_id: String,
    pub provider: String,
    pub consecutive_failures: u32,
    pub open: bool,
}

/// Outcome of a failover attempt across candidate providers for one model.
pub struct SelectorOutcome<T> {
    pub response: T,
    pub provider: String,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum SelectorError<E> {
    #[error("no enabled provider available for model {model_id}")]
    NoProviderAvailable { model_id: String },
    #[error("model {0} is not registered")]
    UnknownModel(String),
    #[error("all providers failed")]
    AllFailed { attempts: u32, last_error: E },
}

/// Candidate filters applied before trying a provider.
#[derive(Default, Clone)]
pub struct SelectionFilter {
    pub preferred_provider: Option<String>,
    pub required_features: Vec<String>,
}

/// Priority-ordered, feature-filtered, preferred-provider-promoted
/// candidates, with circuit-open providers already excluded. Trimming to
/// `max_candidates` happens last so a circuit-open provider never occupies
/// a retry slot a healthy lower-priority provider could have used.
async fn candidate_providers(
    model: &CanonicalModel,
    filter: &SelectionFilter,
    health: &HealthTracker,
    canonical_model_id: &str,
    max_candidates: usize,
) -> Vec<RegistryProviderEntry> {
    let mut candidates = model.enabled_providers();

    if !filter.required_features.is_empty() {
        candidates.retain(|p| {
            filter
                .required_features
                .iter()
                .all(|feature| match feature.as_str() {
                    "streaming" => p.supports_streaming,
                    "function_calling" => p.supports_function_calling,
                    _ => true,
                })
        });
    }

    if let Some(preferred) = &filter.preferred_provider {
        if let Some(pos) = candidates.iter().position(|p| &p.provider == preferred) {
            let chosen = candidates.remove(pos);
            candidates.insert(0, chosen);
        }
    }

    let mut available = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if health.is_available(canonical_model_id, &candidate.provider).await {
            available.push(candidate.clone());
        }
    }

    available.into_iter().take(max_candidates).collect()
}

/// Try candidate providers for `canonical_model_id` in priority order,
/// skipping ones whose circuit is currently open, invoking `do_call` for
/// each attempt until one succeeds or candidates are exhausted.
pub async fn execute_with_failover<T, E, F, Fut>(
    registry: &Registry,
    health: &HealthTracker,
    canonical_model_id: &str,
    filter: SelectionFilter,
    max_retries: u32,
    mut do_call: F,
) -> Result<SelectorOutcome<T>, SelectorError<E>>
where
    F: FnMut(RegistryProviderEntry) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let model = registry
        .get(canonical_model_id)
        .ok_or_else(|| SelectorError::UnknownModel(canonical_model_id.to_string()))?;

    let candidates = candidate_providers(
        &model,
        &filter,
        health,
        canonical_model_id,
        max_retries.max(1) as usize,
    )
    .await;
    if candidates.is_empty() {
        return Err(SelectorError::NoProviderAvailable {
            model_id: canonical_model_id.to_string(),
        });
    }

    let mut attempts = 0u32;
    let mut last_error = None;

    for candidate in candidates {
        attempts += 1;
        match do_call(candidate.clone()).await {
            Ok(response) => {
                health.record_success(canonical_model_id, &candidate.provider).await;
                return Ok(SelectorOutcome {
                    response,
                    provider: candidate.provider,
                    attempts,
                });
            }
            Err(error) => {
                health.record_failure(canonical_model_id, &candidate.provider).await;
                last_error = Some(error);
            }
        }
    }

    match last_error {
        Some(last_error) => Err(SelectorError::AllFailed {
            attempts,
            last_error,
        }),
        None => Err(SelectorError::NoProviderAvailable {
            model_id: canonical_model_id.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CanonicalModel;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn model_with_two_providers() -> CanonicalModel {
        CanonicalModel {
            id: "m".to_string(),
            display_name: "m".to_string(),
            description: None,
            context_length: None,
            modalities: vec!["text".to_string()],
            providers: vec![
                RegistryProviderEntry {
                    provider: "a".to_string(),
                    provider_model_id: "a-model".to_string(),
                    priority: 1,
                    cost_per_1k_input: None,
                    cost_per_1k_output: None,
                    max_tokens: None,
                    features: vec![],
                    supports_streaming: true,
                    supports_function_calling: true,
                    requires_credentials: true,
                    enabled: true,
                },
                RegistryProviderEntry {
                    provider: "b".to_string(),
                    provider_model_id: "b-model".to_string(),
                    priority: 2,
                    cost_per_1k_input: None,
                    cost_per_1k_output: None,
                    max_tokens: None,
                    features: vec![],
                    supports_streaming: true,
                    supports_function_calling: true,
                    requires_credentials: true,
                    enabled: true,
                },
            ],
        }
    }

    #[tokio::test]
    async fn failover_tries_next_provider_on_error() {
        let registry = Registry::new(vec![model_with_two_providers()]);
        let health = HealthTracker::new(CircuitBreakerConfig::default());

        let outcome = execute_with_failover::<_, &'static str, _, _>(
            &registry,
            &health,
            "m",
            SelectionFilter::default(),
            3,
            |candidate| async move {
                if candidate.provider == "a" {
                    Err("boom")
                } else {
                    Ok(42)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.response, 42);
        assert_eq!(outcome.provider, "b");
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_skips_provider() {
        let registry = Registry::new(vec![model_with_two_providers()]);
        let health = HealthTracker::new(CircuitBreakerConfig {
            failure_threshold: 2,
            timeout: Duration::from_secs(300),
        });
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let _ = execute_with_failover::<_, &'static str, _, _>(
                &registry,
                &health,
                "m",
                SelectionFilter {
                    preferred_provider: Some("a".to_string()),
                    required_features: vec![],
                },
                1,
                move |_candidate| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err("boom") }
                },
            )
            .await;
        }

        assert!(!health.is_available("m", "a").await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn snapshot_reports_open_breaker() {
        let registry = Registry::new(vec![model_with_two_providers()]);
        let health = HealthTracker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(300),
        });
        health.record_failure("m", "a").await;

        let snapshot = health.snapshot().await;
        let entry = snapshot.iter().find(|s| s.provider == "a").unwrap();
        assert!(entry.open);
        assert_eq!(entry.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn open_circuit_does_not_consume_a_retry_slot() {
        let mut model = model_with_two_providers();
        model.providers.push(RegistryProviderEntry {
            provider: "c".to_string(),
            provider_model_id: "c-model".to_string(),
            priority: 3,
            cost_per_1k_input: None,
            cost_per_1k_output: None,
            max_tokens: None,
            features: vec![],
            supports_streaming: true,
            supports_function_calling: true,
            requires_credentials: true,
            enabled: true,
        });
        let registry = Registry::new(vec![model]);
        let health = HealthTracker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(300),
        });
        // Open the circuit for the top-priority provider "a" directly,
        // without consuming a failover attempt against it.
        health.record_failure("m", "a").await;
        assert!(!health.is_available("m", "a").await);

        // max_retries=2 with "a" open: if the trim happened before the
        // circuit-open filter, candidates would be [a, b] trimmed from
        // [a, b, c], "a" would then be skipped inside the loop, and only
        // "b" would ever be tried — "c" is healthy and available but would
        // never be reached. With the fix, the open "a" is filtered out
        // before trimming, so the two live candidates are [b, c].
        let outcome = execute_with_failover::<_, &'static str, _, _>(
            &registry,
            &health,
            "m",
            SelectionFilter::default(),
            2,
            |candidate| async move {
                if candidate.provider == "b" {
                    Err("boom")
                } else {
                    Ok(candidate.provider)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.provider, "c");
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn unknown_model_is_an_error() {
        let registry = Registry::new(vec![]);
        let health = HealthTracker::new(CircuitBreakerConfig::default());
        let result = execute_with_failover::<_, &'static str, _, _>(
            &registry,
            &health,
            "missing",
            SelectionFilter::default(),
            3,
            |_candidate| async move { Ok(1) },
        )
        .await;
        assert!(matches!(result, Err(SelectorError::UnknownModel(_))));
    }
}
