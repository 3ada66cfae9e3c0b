//! Gateway-facing error taxonomy and its HTTP response mapping.
//!
//! Every handler returns `Result<_, GatewayError>`. `IntoResponse` turns any
//! variant into the `{"error": {"message", "type", "code"}}` JSON envelope,
//! picking the status code and any extra headers (trial/retry hints) the
//! variant carries.

use crate::store::StoreError;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use aperture_models_sdk::error::{ClientError, ProviderError};

/// Which rate-limit window was exceeded, carried through to `Retry-After`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    Minute,
    Hour,
    Day,
    Concurrency,
}

impl RateLimitKind {
    fn retry_after_secs(self) -> u64 {
        match self {
            RateLimitKind::Minute => 60,
            RateLimitKind::Hour => 3600,
            RateLimitKind::Day => 86400,
            RateLimitKind::Concurrency => 1,
        }
    }
}

/// Trial-exhaustion context surfaced to the client via `X-Trial-*` headers.
#[derive(Debug, Clone, Default)]
pub struct TrialContext {
    pub trial_end_date: Option<String>,
    pub remaining_tokens: Option<u64>,
    pub remaining_requests: Option<u64>,
    pub remaining_credits: Option<i64>,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid credential")]
    InvalidCredential,

    #[error("api key is inactive")]
    KeyInactive,

    #[error("api key has expired")]
    KeyExpired,

    #[error("api key request limit reached")]
    KeyLimitReached,

    #[error("request origin ip is not allowed for this key")]
    IpNotAllowed,

    #[error("request referer is not allowed for this key")]
    RefererNotAllowed,

    #[error("key scope does not permit {action} on {resource}")]
    InsufficientScope { action: String, resource: String },

    #[error("subscription plan has expired")]
    PlanExpired,

    #[error("trial period has expired")]
    TrialExpired(TrialContext),

    #[error("rate limit exceeded")]
    RateLimited(RateLimitKind),

    #[error("insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("unknown model: {0}")]
    ModelUnknown(String),

    #[error("invalid parameter: {field}")]
    ParameterInvalid { field: String },

    #[error("upstream provider timed out")]
    ProviderTimeout,

    #[error("upstream provider unavailable")]
    ProviderUnavailable,

    #[error("upstream provider rejected credentials")]
    ProviderAuthError,

    #[error("upstream provider returned {status}")]
    ProviderHttpError { status: u16 },

    #[error("upstream provider rejected the request: {message}")]
    ProviderInvalidRequest { status: u16, message: String },

    #[error("store is unavailable")]
    StoreUnavailable,

    #[error("circuit open for model {0}")]
    CircuitOpen(String),

    #[error("admin credential required")]
    AdminAuthRequired,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => GatewayError::InvalidCredential,
            StoreError::StoreUnavailable => GatewayError::StoreUnavailable,
            StoreError::ConflictOnWrite => GatewayError::StoreUnavailable,
            StoreError::InsufficientCredits { required, available } => {
                GatewayError::InsufficientCredits { required, available }
            }
            StoreError::ConstraintViolation(message) => GatewayError::Internal(message),
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => GatewayError::ProviderTimeout,
            ProviderError::ServiceUnavailable => GatewayError::ProviderUnavailable,
            ProviderError::InvalidApiKey | ProviderError::AuthenticationFailed { .. } => {
                GatewayError::ProviderAuthError
            }
            ProviderError::RateLimit | ProviderError::QuotaExceeded => {
                GatewayError::ProviderHttpError { status: 429 }
            }
            ProviderError::ModelNotFound { model } => GatewayError::ModelUnknown(model),
            ProviderError::Api { code, message } => {
                GatewayError::ProviderInvalidRequest { status: code, message }
            }
            ProviderError::ValidationError { field, .. } => {
                GatewayError::ParameterInvalid { field }
            }
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Provider(e) => e.into(),
            ClientError::Timeout => GatewayError::ProviderTimeout,
            ClientError::RateLimit => GatewayError::ProviderHttpError { status: 429 },
            ClientError::Authentication { .. } => GatewayError::ProviderAuthError,
            ClientError::InvalidRequest { message } => {
                GatewayError::ParameterInvalid { field: message }
            }
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl GatewayError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            GatewayError::InvalidCredential => (StatusCode::UNAUTHORIZED, "invalid_credential"),
            GatewayError::KeyInactive => (StatusCode::UNAUTHORIZED, "key_inactive"),
            GatewayError::KeyExpired => (StatusCode::UNAUTHORIZED, "key_expired"),
            GatewayError::KeyLimitReached => (StatusCode::TOO_MANY_REQUESTS, "key_limit_reached"),
            GatewayError::IpNotAllowed => (StatusCode::FORBIDDEN, "ip_not_allowed"),
            GatewayError::RefererNotAllowed => (StatusCode::FORBIDDEN, "referer_not_allowed"),
            GatewayError::InsufficientScope { .. } => {
                (StatusCode::FORBIDDEN, "insufficient_scope")
            }
            GatewayError::PlanExpired => (StatusCode::FORBIDDEN, "plan_expired"),
            GatewayError::TrialExpired(_) => (StatusCode::FORBIDDEN, "trial_expired"),
            GatewayError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            GatewayError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
            }
            GatewayError::ModelUnknown(_) => (StatusCode::NOT_FOUND, "model_unknown"),
            GatewayError::ParameterInvalid { .. } => {
                (StatusCode::BAD_REQUEST, "parameter_invalid")
            }
            GatewayError::ProviderTimeout => (StatusCode::GATEWAY_TIMEOUT, "provider_timeout"),
            GatewayError::ProviderUnavailable => {
                (StatusCode::BAD_GATEWAY, "provider_unavailable")
            }
            GatewayError::ProviderAuthError => (StatusCode::BAD_GATEWAY, "provider_auth_error"),
            GatewayError::ProviderHttpError { .. } => {
                (StatusCode::BAD_GATEWAY, "provider_http_error")
            }
            GatewayError::ProviderInvalidRequest { .. } => {
                (StatusCode::BAD_REQUEST, "provider_invalid_request")
            }
            GatewayError::StoreUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
            }
            GatewayError::CircuitOpen(_) => (StatusCode::SERVICE_UNAVAILABLE, "circuit_open"),
            GatewayError::AdminAuthRequired => {
                (StatusCode::UNAUTHORIZED, "admin_auth_required")
            }
            GatewayError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();
        let message = self.to_string();

        let mut headers = HeaderMap::new();
        match &self {
            GatewayError::RateLimited(kind) => {
                if let Ok(value) = HeaderValue::from_str(&kind.retry_after_secs().to_string()) {
                    headers.insert("Retry-After", value);
                }
            }
            GatewayError::TrialExpired(ctx) => {
                headers.insert("X-Trial-Expired", HeaderValue::from_static("true"));
                if let Some(end) = &ctx.trial_end_date {
                    if let Ok(v) = HeaderValue::from_str(end) {
                        headers.insert("X-Trial-End-Date", v);
                    }
                }
                if let Some(tokens) = ctx.remaining_tokens {
                    if let Ok(v) = HeaderValue::from_str(&tokens.to_string()) {
                        headers.insert("X-Trial-Remaining-Tokens", v);
                    }
                }
                if let Some(requests) = ctx.remaining_requests {
                    if let Ok(v) = HeaderValue::from_str(&requests.to_string()) {
                        headers.insert("X-Trial-Remaining-Requests", v);
                    }
                }
                if let Some(credits) = ctx.remaining_credits {
                    if let Ok(v) = HeaderValue::from_str(&credits.to_string()) {
                        headers.insert("X-Trial-Remaining-Credits", v);
                    }
                }
            }
            _ => {}
        }

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
            }
        }));

        (status, headers, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credits_maps_to_payment_required() {
        let err = GatewayError::InsufficientCredits {
            required: 100,
            available: 10,
        };
        assert_eq!(err.status_and_type().0, StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn store_not_found_becomes_invalid_credential() {
        let err: GatewayError = StoreError::NotFound.into();
        assert!(matches!(err, GatewayError::InvalidCredential));
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = GatewayError::RateLimited(RateLimitKind::Minute).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "60");
    }
}
