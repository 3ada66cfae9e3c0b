//! Chat Orchestrator: the pipeline each chat/image request runs
//! through once it has passed authentication — entitlement resolution,
//! admission rate limiting, parameter clamping, provider selection with
//! failover, and the credit/usage accounting that only happens once a
//! provider has actually answered.
//!
//! Separates "resolve -> call provider -> record metrics" into stages,
//! generalized to entitlements, credits, and per-(model, provider)
//! failover instead of a single client call.

use crate::audit;
use crate::auth::AuthContext;
use crate::config::{Config, PlanLimits};
use crate::entitlement::{self, Entitlement};
use crate::gateway_error::{GatewayError, RateLimitKind, TrialContext};
use crate::providers::ProviderTable;
use crate::rate_limiter::{self, ConcurrencyGuard, ConcurrencyTracker};
use crate::store::{Store, UsageRecord, MICRO_CREDITS_PER_CREDIT};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use aperture_models_sdk::error::ProviderError;
use aperture_models_sdk::models::{ChatRequest, ChatResponse, ImageRequest, ImageResponse, Message};
use aperture_models_sdk::providers::StreamResult;
use aperture_models_sdk::registry::{Registry, RegistryProviderEntry};
use aperture_models_sdk::selector::{self, HealthTracker, SelectionFilter, SelectorError, SelectorOutcome};

/// Applied when the caller doesn't set `max_tokens`.
pub const DEFAULT_MAX_TOKENS: u32 = 950;
/// No request, regardless of what it asks for, gets more than this.
pub const HARD_MAX_TOKENS: u32 = 1000;
/// Candidate providers tried per request before giving up.
const MAX_FAILOVER_ATTEMPTS: u32 = 3;

pub struct Orchestrator {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub registry: Arc<Registry>,
    pub health: Arc<HealthTracker>,
    pub providers: Arc<ProviderTable>,
    pub concurrency: Arc<ConcurrencyTracker>,
}

pub struct ChatOutcome {
    pub response: ChatResponse,
    pub provider: String,
}

pub struct ImageOutcome {
    pub response: ImageResponse,
    pub provider: String,
}

/// Everything a caller needs to drive a streamed response to completion and
/// then settle accounting once the last chunk has been sent.
pub struct StreamOutcome {
    pub stream: StreamResult,
    pub provider: String,
    pub canonical_model_id: String,
    entitlement: Entitlement,
    plan_limits: PlanLimits,
    started_at: Instant,
    /// Held for the lifetime of the streamed response; releases the
    /// per-key concurrency slot once the caller drops this outcome
    /// (after the stream has drained or been aborted).
    _concurrency: ConcurrencyGuard,
}

/// Clamps sampling parameters into the ranges the gateway will actually
/// forward upstream, logging when a request's values get adjusted.
/// `max_tokens <= 0` is rejected outright rather than silently clamped,
/// since it almost always indicates a caller bug.
fn clamp_chat_params(request: &mut ChatRequest) -> Result<(), GatewayError> {
    match request.max_tokens {
        None => request.max_tokens = Some(DEFAULT_MAX_TOKENS),
        Some(0) => {
            return Err(GatewayError::ParameterInvalid {
                field: "max_tokens".to_string(),
            })
        }
        Some(v) if v > HARD_MAX_TOKENS => {
            tracing::debug!(requested = v, cap = HARD_MAX_TOKENS, "clamping max_tokens");
            request.max_tokens = Some(HARD_MAX_TOKENS);
        }
        Some(_) => {}
    }

    if let Some(t) = request.temperature {
        let clamped = t.clamp(0.0, 2.0);
        if clamped != t {
            tracing::debug!(requested = t, clamped, "clamping temperature");
        }
        request.temperature = Some(clamped);
    }
    if let Some(p) = request.top_p {
        request.top_p = Some(p.clamp(0.0, 1.0));
    }
    if let Some(p) = request.frequency_penalty {
        request.frequency_penalty = Some(p.clamp(-2.0, 2.0));
    }
    if let Some(p) = request.presence_penalty {
        request.presence_penalty = Some(p.clamp(-2.0, 2.0));
    }

    Ok(())
}

/// ~4 characters per token, the standard rough estimator used when a
/// provider doesn't report exact usage (streaming responses from most
/// OpenAI-compatible adapters omit it unless `stream_options` is set).
fn estimate_tokens(text: &str) -> u32 {
    ((text.len() as f64) / 4.0).ceil() as u32
}

fn map_selector_error<E: Into<GatewayError>>(err: SelectorError<E>) -> GatewayError {
    match err {
        SelectorError::NoProviderAvailable { model_id } => GatewayError::CircuitOpen(model_id),
        SelectorError::UnknownModel(model_id) => GatewayError::ModelUnknown(model_id),
        SelectorError::AllFailed { last_error, .. } => last_error.into(),
    }
}

/// Maps an entitlement-level denial reason to the response the client sees.
/// Daily plan/trial caps are surfaced the same way the per-key limiter's day
/// window is: `RateLimited`, since both are "try again after the window
/// rolls over" denials from the caller's point of view.
fn entitlement_denial(reason: Option<&'static str>, trial: &entitlement::TrialStatus) -> GatewayError {
    match reason {
        Some("trial_expired") => GatewayError::TrialExpired(TrialContext {
            trial_end_date: trial.trial_end_at.map(|t| t.to_rfc3339()),
            remaining_tokens: Some(trial.remaining_tokens),
            remaining_requests: Some(trial.remaining_requests),
            remaining_credits: Some(trial.remaining_credits),
        }),
        _ => GatewayError::RateLimited(RateLimitKind::Day),
    }
}

fn rate_limit_denial(reason: Option<rate_limiter::DeniedWindow>) -> GatewayError {
    let kind = match reason {
        Some(rate_limiter::DeniedWindow::Minute) => RateLimitKind::Minute,
        Some(rate_limiter::DeniedWindow::Hour) => RateLimitKind::Hour,
        Some(rate_limiter::DeniedWindow::Day) | None => RateLimitKind::Day,
    };
    GatewayError::RateLimited(kind)
}

fn registry_entry_for(
    registry: &Registry,
    canonical_model_id: &str,
    provider_name: &str,
) -> Option<RegistryProviderEntry> {
    registry
        .get(canonical_model_id)
        .and_then(|model| model.providers.into_iter().find(|p| p.provider == provider_name))
}

/// Cost in micro-credits for `prompt_tokens`/`completion_tokens` of this
/// model/provider pair. Prefers the provider's own declared per-1k rates
/// (credits, not dollars, to keep the whole ledger in one unit) when
/// `pricing.prefer_provider_rates` is set and the registry entry has them;
/// otherwise falls back to the gateway-wide flat per-token rate.
fn compute_cost_micro(
    config: &Config,
    registry_entry: Option<&RegistryProviderEntry>,
    prompt_tokens: u32,
    completion_tokens: u32,
) -> i64 {
    let pricing = &config.pricing;

    if pricing.prefer_provider_rates {
        if let Some(entry) = registry_entry {
            if let (Some(input_rate), Some(output_rate)) =
                (entry.cost_per_1k_input, entry.cost_per_1k_output)
            {
                let credits = (prompt_tokens as f64 / 1000.0) * input_rate
                    + (completion_tokens as f64 / 1000.0) * output_rate;
                return (credits * MICRO_CREDITS_PER_CREDIT as f64).round() as i64;
            }
        }
    }

    let total_tokens = (prompt_tokens + completion_tokens) as f64;
    (total_tokens * pricing.flat_rate_credit_per_token * MICRO_CREDITS_PER_CREDIT as f64).round()
        as i64
}

impl Orchestrator {
    fn plan_limits_for(&self, entitlement: &Entitlement) -> PlanLimits {
        self.config.rate_limiting.for_plan(&entitlement.plan_name)
    }

    async fn resolve_and_check_entitlement(
        &self,
        auth: &AuthContext,
        now: chrono::DateTime<Utc>,
    ) -> Result<Entitlement, GatewayError> {
        let entitlement = entitlement::resolve_entitlement(&self.store, &auth.user, now).await?;

        if entitlement.plan_was_expired {
            return Err(GatewayError::PlanExpired);
        }

        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time")
            .and_utc();
        let usage_totals = self.store.sum_usage(&auth.user.id, day_start).await?;

        let decision = entitlement::enforce(
            &entitlement,
            &auth.key.environment_tag,
            usage_totals.requests,
            usage_totals.tokens,
        );
        if !decision.allowed {
            return Err(entitlement_denial(decision.reason, &entitlement.trial));
        }

        Ok(entitlement)
    }

    async fn check_admission(
        &self,
        auth: &AuthContext,
        entitlement: &Entitlement,
        plan_limits: &PlanLimits,
    ) -> Result<ConcurrencyGuard, GatewayError> {
        let admission = rate_limiter::check_admission(
            &self.store,
            &auth.key.id,
            plan_limits,
            &auth.key.environment_tag,
        )
        .await;
        if !admission.allowed {
            audit::spawn_record(
                self.store.clone(),
                Some(auth.user.id.clone()),
                Some(auth.key.id.clone()),
                audit::EVENT_RATE_LIMIT_EXCEEDED,
                serde_json::json!({ "window": format!("{:?}", admission.reason) }),
                None,
            );
            return Err(rate_limit_denial(admission.reason));
        }

        if !entitlement.trial.is_trial && auth.user.credits_micro <= 0 {
            return Err(GatewayError::InsufficientCredits {
                required: 1,
                available: auth.user.credits_micro,
            });
        }

        // Concurrency is capped and rejected outright rather than queued:
        // checked last so a request that would fail admission for another
        // reason never occupies a concurrency slot.
        match self
            .concurrency
            .try_acquire(&auth.key.id, plan_limits.max_concurrent_requests)
        {
            Some(guard) => Ok(guard),
            None => {
                audit::spawn_record(
                    self.store.clone(),
                    Some(auth.user.id.clone()),
                    Some(auth.key.id.clone()),
                    audit::EVENT_RATE_LIMIT_EXCEEDED,
                    serde_json::json!({ "window": "concurrency" }),
                    None,
                );
                Err(GatewayError::RateLimited(RateLimitKind::Concurrency))
            }
        }
    }

    async fn settle(
        &self,
        auth: &AuthContext,
        entitlement: &Entitlement,
        plan_limits: &PlanLimits,
        canonical_model_id: &str,
        provider_name: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
        latency_ms: u64,
        finish_reason: Option<String>,
    ) {
        let registry_entry = registry_entry_for(&self.registry, canonical_model_id, provider_name);
        let cost_micro = compute_cost_micro(&self.config, registry_entry.as_ref(), prompt_tokens, completion_tokens);

        if !entitlement.trial.is_trial {
            if let Err(err) = self.store.deduct_credits(&auth.user.id, cost_micro).await {
                // The provider already answered; the request isn't failed
                // retroactively. Floor the balance at zero instead and log
                // the overspend so it's visible for reconciliation (§8
                // scenario 5).
                let _ = self
                    .store
                    .deduct_credits_floored(&auth.user.id, cost_micro)
                    .await;
                audit::spawn_record(
                    self.store.clone(),
                    Some(auth.user.id.clone()),
                    Some(auth.key.id.clone()),
                    audit::EVENT_CREDIT_OVERSPEND,
                    serde_json::json!({ "cost_micro": cost_micro, "error": err.to_string() }),
                    None,
                );
            }
        }

        let record = UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: auth.user.id.clone(),
            key_id: auth.key.id.clone(),
            model: canonical_model_id.to_string(),
            provider: provider_name.to_string(),
            tokens_prompt: prompt_tokens as u64,
            tokens_completion: completion_tokens as u64,
            cost_micro,
            latency_ms,
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            finish_reason,
        };
        if let Err(err) = self.store.record_usage(record).await {
            tracing::warn!(error = %err, "failed to record usage");
        }

        let total_tokens = (prompt_tokens + completion_tokens) as u64;
        let post_check = rate_limiter::record_usage(
            &self.store,
            &auth.key.id,
            plan_limits,
            &auth.key.environment_tag,
            total_tokens,
        )
        .await;
        if !post_check.allowed {
            tracing::debug!(key_id = %auth.key.id, "rate window exceeded by this request's actual usage");
        }
    }

    pub async fn chat_completion(
        &self,
        auth: &AuthContext,
        mut request: ChatRequest,
    ) -> Result<ChatOutcome, GatewayError> {
        let now = Utc::now();
        clamp_chat_params(&mut request)?;

        let entitlement = self.resolve_and_check_entitlement(auth, now).await?;
        let plan_limits = self.plan_limits_for(&entitlement);
        let _concurrency = self.check_admission(auth, &entitlement, &plan_limits).await?;

        let canonical_model_id = request.model.clone();
        let filter = SelectionFilter::default();
        let providers = self.providers.clone();
        let base_request = request.clone();

        let started_at = Instant::now();
        let outcome = selector::execute_with_failover(
            &self.registry,
            &self.health,
            &canonical_model_id,
            filter,
            MAX_FAILOVER_ATTEMPTS,
            move |candidate| {
                let providers = providers.clone();
                let mut req = base_request.clone();
                req.model = candidate.provider_model_id.clone();
                async move {
                    let provider = providers.chat(&candidate.provider).ok_or_else(|| {
                        ProviderError::ModelNotFound { model: candidate.provider_model_id.clone() }
                    })?;
                    provider.chat_completion(req).await
                }
            },
        )
        .await;

        match outcome {
            Ok(SelectorOutcome { response, provider, .. }) => {
                let latency_ms = started_at.elapsed().as_millis() as u64;
                let finish_reason = response.choices.first().and_then(|c| c.finish_reason.clone());
                self.settle(
                    auth,
                    &entitlement,
                    &plan_limits,
                    &canonical_model_id,
                    &provider,
                    response.usage.prompt_tokens,
                    response.usage.completion_tokens,
                    latency_ms,
                    finish_reason,
                )
                .await;
                Ok(ChatOutcome { response, provider })
            }
            Err(err) => Err(map_selector_error(err)),
        }
    }

    pub async fn stream_chat_completion(
        &self,
        auth: &AuthContext,
        mut request: ChatRequest,
    ) -> Result<StreamOutcome, GatewayError> {
        let now = Utc::now();
        clamp_chat_params(&mut request)?;

        let entitlement = self.resolve_and_check_entitlement(auth, now).await?;
        let plan_limits = self.plan_limits_for(&entitlement);
        let concurrency_guard = self.check_admission(auth, &entitlement, &plan_limits).await?;

        let canonical_model_id = request.model.clone();
        let filter = SelectionFilter {
            preferred_provider: None,
            required_features: vec!["streaming".to_string()],
        };
        let providers = self.providers.clone();
        let base_request = request.clone();

        let started_at = Instant::now();
        let outcome = selector::execute_with_failover(
            &self.registry,
            &self.health,
            &canonical_model_id,
            filter,
            MAX_FAILOVER_ATTEMPTS,
            move |candidate| {
                let providers = providers.clone();
                let mut req = base_request.clone();
                req.model = candidate.provider_model_id.clone();
                async move {
                    let provider = providers.chat(&candidate.provider).ok_or_else(|| {
                        ProviderError::ModelNotFound { model: candidate.provider_model_id.clone() }
                    })?;
                    provider.stream_chat_completion(req).await
                }
            },
        )
        .await;

        match outcome {
            Ok(SelectorOutcome { response, provider, .. }) => Ok(StreamOutcome {
                stream: response,
                provider,
                canonical_model_id,
                entitlement,
                plan_limits,
                started_at,
                _concurrency: concurrency_guard,
            }),
            Err(err) => Err(map_selector_error(err)),
        }
    }

    /// Settles credit/usage accounting for a streamed request once the
    /// caller has drained (or aborted) the stream. `request_messages` feeds
    /// the prompt-token estimate; `streamed_content` is the concatenation of
    /// every delta's text seen so far.
    pub async fn finalize_stream(
        &self,
        auth: &AuthContext,
        outcome: &StreamOutcome,
        request_messages: &[Message],
        streamed_content: &str,
        finish_reason: Option<String>,
    ) {
        let prompt_tokens: u32 = request_messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        let completion_tokens = estimate_tokens(streamed_content);
        let latency_ms = outcome.started_at.elapsed().as_millis() as u64;

        self.settle(
            auth,
            &outcome.entitlement,
            &outcome.plan_limits,
            &outcome.canonical_model_id,
            &outcome.provider,
            prompt_tokens,
            completion_tokens,
            latency_ms,
            finish_reason,
        )
        .await;
    }

    pub async fn image_generation(
        &self,
        auth: &AuthContext,
        request: ImageRequest,
    ) -> Result<ImageOutcome, GatewayError> {
        let now = Utc::now();

        let entitlement = self.resolve_and_check_entitlement(auth, now).await?;
        let plan_limits = self.plan_limits_for(&entitlement);
        let _concurrency = self.check_admission(auth, &entitlement, &plan_limits).await?;

        let canonical_model_id = request.model.clone().unwrap_or_else(|| "dall-e-3".to_string());
        let filter = SelectionFilter::default();
        let providers = self.providers.clone();
        let base_request = request.clone();

        let started_at = Instant::now();
        let outcome = selector::execute_with_failover(
            &self.registry,
            &self.health,
            &canonical_model_id,
            filter,
            MAX_FAILOVER_ATTEMPTS,
            move |candidate| {
                let providers = providers.clone();
                let mut req = base_request.clone();
                req.model = Some(candidate.provider_model_id.clone());
                async move {
                    let provider = providers.image(&candidate.provider).ok_or_else(|| {
                        ProviderError::ModelNotFound { model: candidate.provider_model_id.clone() }
                    })?;
                    provider.image_generation(req).await
                }
            },
        )
        .await;

        match outcome {
            Ok(SelectorOutcome { response, provider, .. }) => {
                let latency_ms = started_at.elapsed().as_millis() as u64;
                let images = response.data.len() as u32;
                let registry_entry =
                    registry_entry_for(&self.registry, &canonical_model_id, &provider);
                let per_image_credits = registry_entry
                    .as_ref()
                    .and_then(|e| e.cost_per_1k_output)
                    .unwrap_or(self.config.pricing.flat_rate_credit_per_token * 1000.0);
                let cost_micro =
                    (per_image_credits * images as f64 * MICRO_CREDITS_PER_CREDIT as f64) as i64;

                if !entitlement.trial.is_trial {
                    if let Err(err) = self.store.deduct_credits(&auth.user.id, cost_micro).await {
                        let _ = self
                            .store
                            .deduct_credits_floored(&auth.user.id, cost_micro)
                            .await;
                        audit::spawn_record(
                            self.store.clone(),
                            Some(auth.user.id.clone()),
                            Some(auth.key.id.clone()),
                            audit::EVENT_CREDIT_OVERSPEND,
                            serde_json::json!({ "cost_micro": cost_micro, "error": err.to_string() }),
                            None,
                        );
                    }
                }

                let record = UsageRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    user_id: auth.user.id.clone(),
                    key_id: auth.key.id.clone(),
                    model: canonical_model_id.clone(),
                    provider: provider.clone(),
                    tokens_prompt: 0,
                    tokens_completion: 0,
                    cost_micro,
                    latency_ms,
                    request_id: uuid::Uuid::new_v4().to_string(),
                    timestamp: Utc::now(),
                    finish_reason: None,
                };
                if let Err(err) = self.store.record_usage(record).await {
                    tracing::warn!(error = %err, "failed to record usage");
                }

                rate_limiter::record_usage(&self.store, &auth.key.id, &plan_limits, &auth.key.environment_tag, 0)
                    .await;

                Ok(ImageOutcome { response, provider })
            }
            Err(err) => Err(map_selector_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rejects_zero_max_tokens() {
        let mut request = ChatRequest { max_tokens: Some(0), ..Default::default() };
        assert!(matches!(
            clamp_chat_params(&mut request),
            Err(GatewayError::ParameterInvalid { .. })
        ));
    }

    #[test]
    fn clamp_applies_default_when_unset() {
        let mut request = ChatRequest::default();
        clamp_chat_params(&mut request).unwrap();
        assert_eq!(request.max_tokens, Some(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn clamp_caps_max_tokens_at_hard_limit() {
        let mut request = ChatRequest { max_tokens: Some(5000), ..Default::default() };
        clamp_chat_params(&mut request).unwrap();
        assert_eq!(request.max_tokens, Some(HARD_MAX_TOKENS));
    }

    #[test]
    fn clamp_bounds_temperature_and_penalties() {
        let mut request = ChatRequest {
            temperature: Some(5.0),
            top_p: Some(-1.0),
            frequency_penalty: Some(10.0),
            presence_penalty: Some(-10.0),
            ..Default::default()
        };
        clamp_chat_params(&mut request).unwrap();
        assert_eq!(request.temperature, Some(2.0));
        assert_eq!(request.top_p, Some(0.0));
        assert_eq!(request.frequency_penalty, Some(2.0));
        assert_eq!(request.presence_penalty, Some(-2.0));
    }

    #[test]
    fn flat_rate_pricing_applies_when_no_provider_rate() {
        let config = Config::default();
        let cost = compute_cost_micro(&config, None, 1000, 1000);
        let expected = (2000.0 * config.pricing.flat_rate_credit_per_token
            * MICRO_CREDITS_PER_CREDIT as f64)
            .round() as i64;
        assert_eq!(cost, expected);
    }

    #[test]
    fn provider_rate_wins_when_preferred_and_present() {
        let config = Config::default();
        let entry = RegistryProviderEntry {
            provider: "openrouter".to_string(),
            provider_model_id: "openai/gpt-4o".to_string(),
            priority: 1,
            cost_per_1k_input: Some(0.01),
            cost_per_1k_output: Some(0.03),
            max_tokens: None,
            features: vec![],
            supports_streaming: true,
            supports_function_calling: true,
            requires_credentials: true,
            enabled: true,
        };
        let cost = compute_cost_micro(&config, Some(&entry), 1000, 1000);
        assert_eq!(cost, ((0.01 + 0.03) * MICRO_CREDITS_PER_CREDIT as f64).round() as i64);
    }

    #[test]
    fn token_estimate_rounds_up_quarter_characters() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
