//! Auth & Access Gate: resolves a bearer credential to an
//! authenticated principal and enforces key-level access rules.
//!
//! Resolution produces an `AuthContext`, but the lookup itself goes
//! through the `Store` trait rather than a JWT/session layer —
//! this gateway's credentials are opaque per-tenant API key secrets,
//! not signed tokens. Key comparison is constant-time
//! (`subtle::ConstantTimeEq`) since the primary lookup path works
//! against unhashed secrets held in the store (see DESIGN.md).

use crate::gateway_error::GatewayError;
use crate::store::{ApiKeyRecord, Store, UserRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Per-request context the handlers don't have direct access to otherwise.
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub ip: Option<String>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: UserRecord,
    pub key: ApiKeyRecord,
    pub scopes: HashMap<String, Vec<String>>,
}

/// Resolves `secret` to an `AuthContext`, enforcing checks in order:
/// `is_active`, `expires_at`, `max_requests`, `ip_allowlist`,
/// `referer_allowlist`. Rejects with the first failing reason.
pub async fn authenticate(
    store: &Arc<dyn Store>,
    secret: &str,
    metadata: &RequestMetadata,
) -> Result<AuthContext, GatewayError> {
    let (user, key) = store
        .get_user_by_credential(secret)
        .await
        .map_err(|_| GatewayError::InvalidCredential)?;

    if !user.is_active {
        return Err(GatewayError::KeyInactive);
    }

    let now = Utc::now();

    if !key.is_active {
        return Err(GatewayError::KeyInactive);
    }
    if let Some(expires_at) = key.expires_at {
        if expires_at <= now {
            return Err(GatewayError::KeyExpired);
        }
    }
    if let Some(max_requests) = key.max_requests {
        if key.requests_used >= max_requests {
            return Err(GatewayError::KeyLimitReached);
        }
    }
    if !key.ip_allowlist.is_empty() {
        let allowed = metadata
            .ip
            .as_ref()
            .map(|ip| key.ip_allowlist.iter().any(|allowed_ip| allowed_ip == ip))
            .unwrap_or(false);
        if !allowed {
            return Err(GatewayError::IpNotAllowed);
        }
    }
    if !key.referer_allowlist.is_empty() {
        let allowed = metadata
            .referer
            .as_ref()
            .map(|referer| {
                key.referer_allowlist
                    .iter()
                    .any(|substring| referer.contains(substring.as_str()))
            })
            .unwrap_or(false);
        if !allowed {
            return Err(GatewayError::RefererNotAllowed);
        }
    }

    if let Err(err) = store.touch_key_last_used(&key.id, now).await {
        tracing::debug!(key_id = %key.id, error = %err, "failed to touch last_used_at");
    }

    let scopes = key.scopes.clone();
    Ok(AuthContext { user, key, scopes })
}

/// `true` when the scope map is empty (default-allow), when `action` maps to
/// a list containing `*` or `resource`, or when the wildcard action `*` maps
/// to `*`/`resource`.
pub fn authorize(scopes: &HashMap<String, Vec<String>>, action: &str, resource: &str) -> bool {
    if scopes.is_empty() {
        return true;
    }
    let grants = |resources: &[String]| resources.iter().any(|r| r == "*" || r == resource);

    if let Some(resources) = scopes.get(action) {
        if grants(resources) {
            return true;
        }
    }
    if let Some(resources) = scopes.get("*") {
        if grants(resources) {
            return true;
        }
    }
    false
}

/// Constant-time comparison of the presented admin bearer token against the
/// configured `ADMIN_API_KEY`.
pub fn is_admin_secret(configured: &Option<String>, presented: Option<&str>) -> bool {
    match (configured, presented) {
        (Some(expected), Some(got)) => {
            expected.as_bytes().len() == got.as_bytes().len()
                && bool::from(expected.as_bytes().ct_eq(got.as_bytes()))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::store::{SubscriptionStatus, UserRecord as Rec};
    use chrono::Duration as ChronoDuration;

    fn user() -> Rec {
        Rec {
            id: "u1".to_string(),
            identity_subject: "sub".to_string(),
            email: "u1@example.com".to_string(),
            credits_micro: 1_000_000,
            subscription_status: SubscriptionStatus::Active,
            trial_end_at: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn key(overrides: impl FnOnce(&mut ApiKeyRecord)) -> ApiKeyRecord {
        let mut key = ApiKeyRecord {
            id: "k1".to_string(),
            user_id: "u1".to_string(),
            secret: "gw_live_abc".to_string(),
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
        };
        overrides(&mut key);
        key
    }

    fn store_with(key: ApiKeyRecord) -> Arc<dyn Store> {
        let store = InMemoryStore::new();
        store.insert_user(user());
        store.insert_key(key);
        Arc::new(store)
    }

    #[tokio::test]
    async fn unknown_secret_is_rejected() {
        let store = store_with(key(|_| {}));
        let result = authenticate(&store, "nope", &RequestMetadata::default()).await;
        assert!(matches!(result, Err(GatewayError::InvalidCredential)));
    }

    #[tokio::test]
    async fn inactive_key_is_rejected() {
        let store = store_with(key(|k| k.is_active = false));
        let result = authenticate(&store, "gw_live_abc", &RequestMetadata::default()).await;
        assert!(matches!(result, Err(GatewayError::KeyInactive)));
    }

    #[tokio::test]
    async fn expired_key_is_rejected() {
        let store = store_with(key(|k| k.expires_at = Some(Utc::now() - ChronoDuration::seconds(1))));
        let result = authenticate(&store, "gw_live_abc", &RequestMetadata::default()).await;
        assert!(matches!(result, Err(GatewayError::KeyExpired)));
    }

    #[tokio::test]
    async fn ip_allowlist_rejects_unlisted_addresses() {
        let store = store_with(key(|k| k.ip_allowlist = vec!["10.0.0.1".to_string()]));
        let metadata = RequestMetadata {
            ip: Some("10.0.0.2".to_string()),
            ..Default::default()
        };
        let result = authenticate(&store, "gw_live_abc", &metadata).await;
        assert!(matches!(result, Err(GatewayError::IpNotAllowed)));
    }

    #[tokio::test]
    async fn referer_allowlist_matches_by_substring() {
        let store = store_with(key(|k| k.referer_allowlist = vec!["example.com".to_string()]));
        let metadata = RequestMetadata {
            referer: Some("https://app.example.com/dashboard".to_string()),
            ..Default::default()
        };
        let result = authenticate(&store, "gw_live_abc", &metadata).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn valid_key_succeeds_with_no_restrictions() {
        let store = store_with(key(|_| {}));
        let result = authenticate(&store, "gw_live_abc", &RequestMetadata::default()).await;
        assert!(result.is_ok());
    }

    #[test]
    fn authorize_default_allows_when_scopes_empty() {
        assert!(authorize(&HashMap::new(), "chat", "gpt-4o"));
    }

    #[test]
    fn authorize_denies_when_action_not_granted() {
        let mut scopes = HashMap::new();
        scopes.insert("images".to_string(), vec!["*".to_string()]);
        assert!(!authorize(&scopes, "chat", "gpt-4o"));
    }

    #[test]
    fn authorize_wildcard_action_grants_any_resource() {
        let mut scopes = HashMap::new();
        scopes.insert("*".to_string(), vec!["*".to_string()]);
        assert!(authorize(&scopes, "chat", "gpt-4o"));
    }

    #[test]
    fn admin_secret_requires_exact_match() {
        let configured = Some("super-secret".to_string());
        assert!(is_admin_secret(&configured, Some("super-secret")));
        assert!(!is_admin_secret(&configured, Some("super-secre")));
        assert!(!is_admin_secret(&configured, None));
    }
}
