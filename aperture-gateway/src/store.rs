//! Store Adapter: typed accessors over the persistent state the
//! gateway needs — users, keys, plans, rate windows, usage, and the audit
//! log — plus an in-memory reference implementation.
//!
//! Shared state is `DashMap`-backed, guarded by small per-row critical
//! sections rather than a single global `Mutex`. The persisted layout
//! collapses what would otherwise be overlapping key/usage/plan tables
//! into the canonical shapes below (see DESIGN.md's Open Question ledger).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// 1 credit = 1_000_000 micro-credits. All deduction paths are integer
/// arithmetic; floating point is only used for display.
pub const MICRO_CREDITS_PER_CREDIT: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    Expired,
    Cancelled,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub identity_subject: String,
    pub email: String,
    pub credits_micro: i64,
    pub subscription_status: SubscriptionStatus,
    pub trial_end_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub secret: String,
    pub name: String,
    pub is_active: bool,
    pub is_primary: bool,
    pub environment_tag: String,
    /// action -> resources; `*` is a wildcard on either side.
    pub scopes: HashMap<String, Vec<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_requests: Option<u64>,
    pub requests_used: u64,
    pub ip_allowlist: Vec<String>,
    pub referer_allowlist: Vec<String>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    /// Structural usability, independent of IP/referer checks which need
    /// request context and are enforced by `auth.rs`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.expires_at.map(|exp| exp > now).unwrap_or(true)
            && self
                .max_requests
                .map(|cap| self.requests_used < cap)
                .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    Dev,
    Team,
    Customize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub plan_type: PlanType,
    pub daily_request_limit: u64,
    pub monthly_request_limit: u64,
    pub daily_token_limit: u64,
    pub monthly_token_limit: u64,
    pub max_concurrent_requests: u32,
    pub features: Vec<String>,
    pub price: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPlan {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    /// Seconds in one bucket of this kind, used to floor a timestamp to its
    /// `window_start`.
    pub fn bucket_secs(self) -> i64 {
        match self {
            WindowKind::Minute => 60,
            WindowKind::Hour => 3600,
            WindowKind::Day => 86400,
        }
    }

    pub fn window_start(self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.bucket_secs();
        let floored = (at.timestamp() / secs) * secs;
        DateTime::from_timestamp(floored, 0).unwrap_or(at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub key_id: String,
    pub window_kind: WindowKind,
    pub window_start: DateTime<Utc>,
    pub requests_count: u64,
    pub tokens_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindows {
    pub minute: RateLimitWindow,
    pub hour: RateLimitWindow,
    pub day: RateLimitWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub key_id: String,
    pub model: String,
    pub provider: String,
    pub tokens_prompt: u64,
    pub tokens_completion: u64,
    pub cost_micro: i64,
    pub latency_ms: u64,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub tokens: u64,
    pub cost_micro: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: Option<String>,
    pub key_id: Option<String>,
    pub action: String,
    pub details: serde_json::Value,
    pub ip: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("not found")]
    NotFound,
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("conflict on write")]
    ConflictOnWrite,
    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Result<UserRecord, StoreError>;
    async fn get_key_by_secret(&self, secret: &str) -> Result<ApiKeyRecord, StoreError>;
    async fn get_user_by_credential(
        &self,
        secret: &str,
    ) -> Result<(UserRecord, ApiKeyRecord), StoreError> {
        let key = self.get_key_by_secret(secret).await?;
        let user = self.get_user(&key.user_id).await?;
        Ok((user, key))
    }
    async fn touch_key_last_used(&self, key_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Atomically subtracts `amount_micro` from the user's balance. Never
    /// lets the balance go negative: returns `InsufficientCredits` instead,
    /// reporting the balance that was actually available.
    async fn deduct_credits(&self, user_id: &str, amount_micro: i64) -> Result<i64, StoreError>;

    /// Floors the user's balance at zero rather than rejecting the
    /// deduction. Used only for the post-response overspend path (§8
    /// scenario 5): the provider has already answered, so the request isn't
    /// failed retroactively, but the ledger can't go negative either.
    async fn deduct_credits_floored(&self, user_id: &str, amount_micro: i64) -> Result<i64, StoreError>;

    async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError>;

    async fn upsert_rate_window(
        &self,
        key_id: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
        requests_delta: u64,
        tokens_delta: u64,
    ) -> Result<RateLimitWindow, StoreError>;

    async fn get_rate_windows(
        &self,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateWindows, StoreError>;

    async fn get_active_user_plan(
        &self,
        user_id: &str,
    ) -> Result<Option<(UserPlan, Plan)>, StoreError>;

    /// Deactivates the given `UserPlan` row and flips the owning user's
    /// `subscription_status` to `Expired`, atomically from the caller's
    /// point of view. Called by the entitlement engine when it finds an
    /// active `UserPlan` whose `expires_at` has already passed — the plan
    /// must not keep reading back as active on the next lookup.
    async fn deactivate_expired_user_plan(
        &self,
        user_id: &str,
        user_plan_id: &str,
    ) -> Result<(), StoreError>;

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;

    async fn sum_usage(&self, user_id: &str, since: DateTime<Utc>) -> Result<UsageTotals, StoreError>;

    async fn check_key_name_unique(
        &self,
        user_id: &str,
        name: &str,
        excluding_id: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn insert_audit(&self, entry: AuditEntry) -> Result<(), StoreError>;
}

/// `DashMap`-backed reference `Store`. Used as the default backend for
/// `cargo run` and by every integration test.
#[derive(Default)]
pub struct InMemoryStore {
    users: DashMap<String, UserRecord>,
    credits: DashMap<String, AtomicI64>,
    keys_by_id: DashMap<String, ApiKeyRecord>,
    plans: DashMap<String, Plan>,
    user_plans: DashMap<String, Vec<UserPlan>>,
    usage: DashMap<String, UsageRecord>,
    rate_windows: DashMap<(String, WindowKind, i64), RateLimitWindow>,
    audit_log: DashMap<String, AuditEntry>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: UserRecord) {
        self.credits.insert(user.id.clone(), AtomicI64::new(user.credits_micro));
        self.users.insert(user.id.clone(), user);
    }

    pub fn insert_key(&self, key: ApiKeyRecord) {
        self.keys_by_id.insert(key.id.clone(), key);
    }

    pub fn insert_plan(&self, plan: Plan) {
        self.plans.insert(plan.id.clone(), plan);
    }

    pub fn insert_user_plan(&self, user_plan: UserPlan) {
        self.user_plans
            .entry(user_plan.user_id.clone())
            .or_default()
            .push(user_plan);
    }

    fn window_key(key_id: &str, kind: WindowKind, window_start: DateTime<Utc>) -> (String, WindowKind, i64) {
        (key_id.to_string(), kind, window_start.timestamp())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<UserRecord, StoreError> {
        self.users
            .get(user_id)
            .map(|entry| entry.clone())
            .ok_or(StoreError::NotFound)
    }

    /// Secrets are opaque, unhashed strings in this reference store; the
    /// lookup is a linear scan using `subtle::ConstantTimeEq` on every
    /// candidate so a mismatched secret takes the same time regardless of
    /// where the first differing byte falls (see DESIGN.md).
    async fn get_key_by_secret(&self, secret: &str) -> Result<ApiKeyRecord, StoreError> {
        let needle = secret.as_bytes();
        for entry in self.keys_by_id.iter() {
            let candidate = entry.value().secret.as_bytes();
            if candidate.len() == needle.len() && bool::from(candidate.ct_eq(needle)) {
                return Ok(entry.value().clone());
            }
        }
        Err(StoreError::NotFound)
    }

    async fn touch_key_last_used(&self, key_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        match self.keys_by_id.get_mut(key_id) {
            Some(mut entry) => {
                entry.last_used_at = Some(at);
                entry.requests_used += 1;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn deduct_credits(&self, user_id: &str, amount_micro: i64) -> Result<i64, StoreError> {
        let slot = self.credits.get(user_id).ok_or(StoreError::NotFound)?;
        loop {
            let current = slot.load(Ordering::SeqCst);
            let next = current - amount_micro;
            if next < 0 {
                return Err(StoreError::InsufficientCredits {
                    required: amount_micro,
                    available: current,
                });
            }
            if slot
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(mut user) = self.users.get_mut(user_id) {
                    user.credits_micro = next;
                }
                return Ok(next);
            }
        }
    }

    async fn deduct_credits_floored(&self, user_id: &str, amount_micro: i64) -> Result<i64, StoreError> {
        let slot = self.credits.get(user_id).ok_or(StoreError::NotFound)?;
        loop {
            let current = slot.load(Ordering::SeqCst);
            let next = (current - amount_micro).max(0);
            if slot
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if let Some(mut user) = self.users.get_mut(user_id) {
                    user.credits_micro = next;
                }
                return Ok(next);
            }
        }
    }

    async fn record_usage(&self, record: UsageRecord) -> Result<(), StoreError> {
        if self.usage.contains_key(&record.request_id) {
            return Err(StoreError::ConstraintViolation(format!(
                "duplicate request_id {}",
                record.request_id
            )));
        }
        self.usage.insert(record.request_id.clone(), record);
        Ok(())
    }

    async fn upsert_rate_window(
        &self,
        key_id: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
        requests_delta: u64,
        tokens_delta: u64,
    ) -> Result<RateLimitWindow, StoreError> {
        let map_key = Self::window_key(key_id, kind, window_start);
        let mut entry = self
            .rate_windows
            .entry(map_key)
            .or_insert_with(|| RateLimitWindow {
                key_id: key_id.to_string(),
                window_kind: kind,
                window_start,
                requests_count: 0,
                tokens_count: 0,
            });
        entry.requests_count += requests_delta;
        entry.tokens_count += tokens_delta;
        Ok(entry.clone())
    }

    async fn get_rate_windows(
        &self,
        key_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RateWindows, StoreError> {
        let snapshot = |kind: WindowKind| -> RateLimitWindow {
            let window_start = kind.window_start(now);
            let map_key = Self::window_key(key_id, kind, window_start);
            self.rate_windows
                .get(&map_key)
                .map(|entry| entry.clone())
                .unwrap_or(RateLimitWindow {
                    key_id: key_id.to_string(),
                    window_kind: kind,
                    window_start,
                    requests_count: 0,
                    tokens_count: 0,
                })
        };
        Ok(RateWindows {
            minute: snapshot(WindowKind::Minute),
            hour: snapshot(WindowKind::Hour),
            day: snapshot(WindowKind::Day),
        })
    }

    async fn get_active_user_plan(
        &self,
        user_id: &str,
    ) -> Result<Option<(UserPlan, Plan)>, StoreError> {
        let Some(plans) = self.user_plans.get(user_id) else {
            return Ok(None);
        };
        let Some(active) = plans.iter().find(|p| p.is_active) else {
            return Ok(None);
        };
        let plan = self
            .plans
            .get(&active.plan_id)
            .map(|entry| entry.clone())
            .ok_or(StoreError::NotFound)?;
        Ok(Some((active.clone(), plan)))
    }

    async fn deactivate_expired_user_plan(
        &self,
        user_id: &str,
        user_plan_id: &str,
    ) -> Result<(), StoreError> {
        let mut plans = self.user_plans.get_mut(user_id).ok_or(StoreError::NotFound)?;
        let plan = plans
            .iter_mut()
            .find(|p| p.id == user_plan_id)
            .ok_or(StoreError::NotFound)?;
        plan.is_active = false;
        drop(plans);

        let mut user = self.users.get_mut(user_id).ok_or(StoreError::NotFound)?;
        user.subscription_status = SubscriptionStatus::Expired;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        Ok(self.plans.iter().map(|entry| entry.clone()).collect())
    }

    async fn sum_usage(&self, user_id: &str, since: DateTime<Utc>) -> Result<UsageTotals, StoreError> {
        let mut totals = UsageTotals::default();
        for entry in self.usage.iter() {
            let record = entry.value();
            if record.user_id == user_id && record.timestamp >= since {
                totals.requests += 1;
                totals.tokens += record.tokens_prompt + record.tokens_completion;
                totals.cost_micro += record.cost_micro;
            }
        }
        Ok(totals)
    }

    async fn check_key_name_unique(
        &self,
        user_id: &str,
        name: &str,
        excluding_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let clashes = self.keys_by_id.iter().any(|entry| {
            let key = entry.value();
            key.user_id == user_id
                && key.name == name
                && excluding_id.map(|id| id != key.id).unwrap_or(true)
        });
        Ok(!clashes)
    }

    async fn insert_audit(&self, entry: AuditEntry) -> Result<(), StoreError> {
        self.audit_log.insert(uuid::Uuid::new_v4().to_string(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_user(credits_micro: i64) -> UserRecord {
        UserRecord {
            id: "u1".to_string(),
            identity_subject: "sub-1".to_string(),
            email: "u1@example.com".to_string(),
            credits_micro,
            subscription_status: SubscriptionStatus::Active,
            trial_end_at: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn deduct_credits_never_goes_negative() {
        let store = InMemoryStore::new();
        store.insert_user(sample_user(5 * MICRO_CREDITS_PER_CREDIT));

        let ok = store.deduct_credits("u1", 3 * MICRO_CREDITS_PER_CREDIT).await.unwrap();
        assert_eq!(ok, 2 * MICRO_CREDITS_PER_CREDIT);

        let err = store.deduct_credits("u1", 3 * MICRO_CREDITS_PER_CREDIT).await;
        assert!(matches!(err, Err(StoreError::InsufficientCredits { .. })));
    }

    #[tokio::test]
    async fn concurrent_deductions_leave_correct_balance() {
        use std::sync::Arc;
        let store = Arc::new(InMemoryStore::new());
        store.insert_user(sample_user(100 * MICRO_CREDITS_PER_CREDIT));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.deduct_credits("u1", MICRO_CREDITS_PER_CREDIT).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let user = store.get_user("u1").await.unwrap();
        assert_eq!(user.credits_micro, 80 * MICRO_CREDITS_PER_CREDIT);
    }

    #[tokio::test]
    async fn deduct_credits_floored_never_goes_negative() {
        let store = InMemoryStore::new();
        store.insert_user(sample_user(MICRO_CREDITS_PER_CREDIT / 10));

        let balance = store
            .deduct_credits_floored("u1", MICRO_CREDITS_PER_CREDIT)
            .await
            .unwrap();
        assert_eq!(balance, 0);
        assert_eq!(store.get_user("u1").await.unwrap().credits_micro, 0);
    }

    #[tokio::test]
    async fn key_lookup_requires_exact_secret() {
        let store = InMemoryStore::new();
        store.insert_key(ApiKeyRecord {
            id: "k1".to_string(),
            user_id: "u1".to_string(),
            secret: "gw_live_abc123".to_string(),
            name: "primary".to_string(),
            is_active: true,
            is_primary: true,
            environment_tag: "live".to_string(),
            scopes: HashMap::new(),
            expires_at: None,
            max_requests: None,
            requests_used: 0,
            ip_allowlist: vec![],
            referer_allowlist: vec![],
            last_used_at: None,
        });

        assert!(store.get_key_by_secret("gw_live_abc123").await.is_ok());
        assert!(matches!(
            store.get_key_by_secret("gw_live_abc124").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn rate_window_counters_accumulate_within_bucket() {
        let store = InMemoryStore::new();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store
            .upsert_rate_window("k1", WindowKind::Minute, WindowKind::Minute.window_start(now), 1, 100)
            .await
            .unwrap();
        store
            .upsert_rate_window("k1", WindowKind::Minute, WindowKind::Minute.window_start(now), 1, 50)
            .await
            .unwrap();

        let windows = store.get_rate_windows("k1", now).await.unwrap();
        assert_eq!(windows.minute.requests_count, 2);
        assert_eq!(windows.minute.tokens_count, 150);
    }

    #[tokio::test]
    async fn usage_record_is_unique_per_request_id() {
        let store = InMemoryStore::new();
        let record = UsageRecord {
            id: "r1".to_string(),
            user_id: "u1".to_string(),
            key_id: "k1".to_string(),
            model: "gpt-4o".to_string(),
            provider: "openrouter".to_string(),
            tokens_prompt: 10,
            tokens_completion: 20,
            cost_micro: 100,
            latency_ms: 50,
            request_id: "req-1".to_string(),
            timestamp: Utc::now(),
            finish_reason: Some("stop".to_string()),
        };
        store.record_usage(record.clone()).await.unwrap();
        assert!(store.record_usage(record).await.is_err());
    }
}
