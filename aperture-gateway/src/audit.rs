//! Audit Log Sink: fire-and-forget append to the store's audit log.
//!
//! Never on the critical path — failures are logged and dropped rather than
//! propagated back to the caller.

use crate::store::{AuditEntry, Store};
use std::sync::Arc;

pub const EVENT_API_KEY_CREATED: &str = "api_key_created";
pub const EVENT_API_KEY_UPDATED: &str = "api_key_updated";
pub const EVENT_API_KEY_DELETED: &str = "api_key_deleted";
pub const EVENT_API_KEY_ROTATED: &str = "api_key_rotated";
pub const EVENT_PLAN_ASSIGNED: &str = "plan_assigned";
pub const EVENT_RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
pub const EVENT_RATE_LIMITER_FAIL_OPEN: &str = "rate_limiter_fail_open";
pub const EVENT_SECURITY_VIOLATION: &str = "security_violation";
pub const EVENT_TRIAL_CONVERTED: &str = "trial_converted";
pub const EVENT_CREDIT_OVERSPEND: &str = "credit_overspend";

/// Appends one audit entry. Spawned as a detached task by callers that want
/// it to be truly fire-and-forget; callable directly (and awaited) from
/// tests or synchronous call sites that don't need to detach.
pub async fn record(
    store: &Arc<dyn Store>,
    user_id: Option<String>,
    key_id: Option<String>,
    action: &str,
    details: serde_json::Value,
    ip: Option<String>,
) {
    let entry = AuditEntry {
        user_id,
        key_id,
        action: action.to_string(),
        details,
        ip,
        at: chrono::Utc::now(),
    };
    if let Err(err) = store.insert_audit(entry).await {
        tracing::warn!(action, error = %err, "failed to append audit entry");
    }
}

/// Spawns `record` on its own task so the caller never waits on the audit
/// store. Requires `Store` behind an `Arc` that is `'static`, which the
/// gateway's `AppState` always provides.
pub fn spawn_record(
    store: Arc<dyn Store>,
    user_id: Option<String>,
    key_id: Option<String>,
    action: &'static str,
    details: serde_json::Value,
    ip: Option<String>,
) {
    tokio::spawn(async move {
        record(&store, user_id, key_id, action, details, ip).await;
    });
}
