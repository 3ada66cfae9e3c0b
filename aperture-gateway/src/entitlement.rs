//! Entitlement Engine: resolves a user's current plan/trial budget.
//!
//! Expressed as a pure function over `Store` reads so it composes cleanly
//! with the orchestrator's call sequence.

use crate::store::{Plan, Store, SubscriptionStatus, UserRecord};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Trial-specific remaining budget, tracked separately from plan windows.
#[derive(Debug, Clone, Default)]
pub struct TrialStatus {
    pub is_trial: bool,
    pub is_expired: bool,
    pub remaining_tokens: u64,
    pub remaining_requests: u64,
    pub remaining_credits: i64,
    pub trial_end_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Entitlement {
    pub has_plan: bool,
    pub plan_name: String,
    pub daily_request_limit: u64,
    pub daily_token_limit: u64,
    pub monthly_request_limit: u64,
    pub monthly_token_limit: u64,
    pub features: Vec<String>,
    pub trial: TrialStatus,
    /// Set when the user once held an active `UserPlan` that has since
    /// expired, as opposed to never having held one. The orchestrator uses
    /// this to tell `PlanExpired` apart from `TrialExpired` — both fall
    /// through to the same zeroed-budget shape otherwise.
    pub plan_was_expired: bool,
}

/// Trial defaults used for users who are neither on an active plan nor in a
/// live trial window: everything reads as expired/zero.
fn expired_trial_entitlement() -> Entitlement {
    Entitlement {
        has_plan: false,
        plan_name: "free".to_string(),
        daily_request_limit: 0,
        daily_token_limit: 0,
        monthly_request_limit: 0,
        monthly_token_limit: 0,
        features: vec![],
        trial: TrialStatus {
            is_trial: true,
            is_expired: true,
            remaining_tokens: 0,
            remaining_requests: 0,
            remaining_credits: 0,
            trial_end_at: None,
        },
        plan_was_expired: false,
    }
}

fn expired_plan_entitlement() -> Entitlement {
    Entitlement {
        plan_was_expired: true,
        ..expired_trial_entitlement()
    }
}

fn live_trial_entitlement(user: &UserRecord, trial_end_at: DateTime<Utc>) -> Entitlement {
    let free_plan = crate::config::RateLimitingConfig::defaults().for_plan("free");
    Entitlement {
        has_plan: false,
        plan_name: "free".to_string(),
        daily_request_limit: free_plan.requests_per_day,
        daily_token_limit: free_plan.tokens_per_day,
        monthly_request_limit: 0,
        monthly_token_limit: 0,
        features: vec![],
        trial: TrialStatus {
            is_trial: true,
            is_expired: false,
            remaining_tokens: free_plan.tokens_per_day,
            remaining_requests: free_plan.requests_per_day,
            remaining_credits: user.credits_micro,
            trial_end_at: Some(trial_end_at),
        },
        plan_was_expired: false,
    }
}

fn plan_entitlement(plan: &Plan) -> Entitlement {
    Entitlement {
        has_plan: true,
        plan_name: plan.name.clone(),
        daily_request_limit: plan.daily_request_limit,
        daily_token_limit: plan.daily_token_limit,
        monthly_request_limit: plan.monthly_request_limit,
        monthly_token_limit: plan.monthly_token_limit,
        features: plan.features.clone(),
        trial: TrialStatus::default(),
        plan_was_expired: false,
    }
}

/// Resolution order: (1) active UserPlan -> its Plan fields; (2) an expired
/// UserPlan marks the user's subscription expired and returns the expired
/// trial defaults; (3) no UserPlan but the user is within a live trial
/// window -> trial entitlements; (4) otherwise expired trial defaults.
pub async fn resolve_entitlement(
    store: &Arc<dyn Store>,
    user: &UserRecord,
    now: DateTime<Utc>,
) -> Result<Entitlement, crate::gateway_error::GatewayError> {
    if let Some((user_plan, plan)) = store.get_active_user_plan(&user.id).await? {
        if let Some(expires_at) = user_plan.expires_at {
            if expires_at < now {
                // Persist the expiry rather than just computing a value for
                // this call: deactivate the stale UserPlan row and flip the
                // user's subscription status so every other reader stops
                // seeing a plan that's actually lapsed.
                store
                    .deactivate_expired_user_plan(&user.id, &user_plan.id)
                    .await?;
                return Ok(expired_plan_entitlement());
            }
        }
        return Ok(plan_entitlement(&plan));
    }

    if user.subscription_status == SubscriptionStatus::Trial {
        if let Some(trial_end_at) = user.trial_end_at {
            if trial_end_at >= now {
                return Ok(live_trial_entitlement(user, trial_end_at));
            }
        }
    }

    Ok(expired_trial_entitlement())
}

/// Environment-tag multiplier applied to the numeric limits before
/// comparing against usage: live deployments get the full limit, everything
/// else (test/staging/development) runs at half to discourage treating
/// non-production keys as production capacity.
pub fn environment_multiplier(environment_tag: &str) -> f64 {
    match environment_tag {
        "live" => 1.0,
        _ => 0.5,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnforceDecision {
    pub allowed: bool,
    pub reason: Option<&'static str>,
}

/// Applies the environment multiplier to the entitlement's daily limits and
/// compares against already-used totals for this window. Used as a
/// plan-level check distinct from the per-key sliding-window rate limiter.
pub fn enforce(
    entitlement: &Entitlement,
    environment_tag: &str,
    requests_used_today: u64,
    tokens_used_today: u64,
) -> EnforceDecision {
    if entitlement.trial.is_trial && entitlement.trial.is_expired {
        return EnforceDecision {
            allowed: false,
            reason: Some("trial_expired"),
        };
    }

    let multiplier = environment_multiplier(environment_tag);
    let request_cap = (entitlement.daily_request_limit as f64 * multiplier) as u64;
    let token_cap = (entitlement.daily_token_limit as f64 * multiplier) as u64;

    if request_cap > 0 && requests_used_today >= request_cap {
        return EnforceDecision {
            allowed: false,
            reason: Some("daily_request_limit"),
        };
    }
    if token_cap > 0 && tokens_used_today >= token_cap {
        return EnforceDecision {
            allowed: false,
            reason: Some("daily_token_limit"),
        };
    }

    EnforceDecision {
        allowed: true,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::Duration as ChronoDuration;

    fn base_user(status: SubscriptionStatus, trial_end_at: Option<DateTime<Utc>>) -> UserRecord {
        UserRecord {
            id: "u1".to_string(),
            identity_subject: "sub".to_string(),
            email: "u1@example.com".to_string(),
            credits_micro: 1_000_000,
            subscription_status: status,
            trial_end_at,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn active_plan_wins_over_trial_state() {
        let mem = InMemoryStore::new();
        mem.insert_plan(crate::store::Plan {
            id: "p1".to_string(),
            name: "dev".to_string(),
            plan_type: crate::store::PlanType::Dev,
            daily_request_limit: 5000,
            monthly_request_limit: 50000,
            daily_token_limit: 500000,
            monthly_token_limit: 5000000,
            max_concurrent_requests: 20,
            features: vec!["streaming".to_string()],
            price: 9.0,
            is_active: true,
        });
        mem.insert_user_plan(crate::store::UserPlan {
            id: "up1".to_string(),
            user_id: "u1".to_string(),
            plan_id: "p1".to_string(),
            started_at: Utc::now(),
            expires_at: None,
            is_active: true,
        });
        let store: Arc<dyn Store> = Arc::new(mem);
        let now = Utc::now();
        let user = base_user(SubscriptionStatus::Active, None);
        let entitlement = resolve_entitlement(&store, &user, now).await.unwrap();
        assert!(entitlement.has_plan);
        assert_eq!(entitlement.plan_name, "dev");
    }

    #[tokio::test]
    async fn expired_trial_returns_defaults() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let user = base_user(SubscriptionStatus::Trial, Some(now - ChronoDuration::days(1)));
        let entitlement = resolve_entitlement(&store, &user, now).await.unwrap();
        assert!(!entitlement.has_plan);
        assert!(entitlement.trial.is_expired);
    }

    #[tokio::test]
    async fn live_trial_returns_nonexpired_budget() {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let user = base_user(SubscriptionStatus::Trial, Some(now + ChronoDuration::days(1)));
        let entitlement = resolve_entitlement(&store, &user, now).await.unwrap();
        assert!(!entitlement.has_plan);
        assert!(!entitlement.trial.is_expired);
        assert!(entitlement.trial.remaining_credits > 0);
    }

    #[test]
    fn environment_multiplier_halves_non_live_tags() {
        assert_eq!(environment_multiplier("live"), 1.0);
        assert_eq!(environment_multiplier("test"), 0.5);
        assert_eq!(environment_multiplier("staging"), 0.5);
    }

    #[test]
    fn enforce_denies_when_daily_request_cap_reached() {
        let entitlement = Entitlement {
            has_plan: true,
            plan_name: "dev".to_string(),
            daily_request_limit: 10,
            daily_token_limit: 10000,
            monthly_request_limit: 0,
            monthly_token_limit: 0,
            features: vec![],
            trial: TrialStatus::default(),
            plan_was_expired: false,
        };
        let decision = enforce(&entitlement, "live", 10, 0);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some("daily_request_limit"));
    }
}
