//! Error types for provider adapters and the client-facing SDK surface.
//!
//! `ProviderError` covers failures talking to a single upstream provider.
//! `ClientError` is the SDK-level error returned to callers (the gateway's
//! orchestrator maps both onto its own `GatewayError` for the HTTP surface).

use thiserror::Error;

/// High-level SDK operation errors.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Timeout error")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },
}

/// Provider-specific API and communication errors.
///
/// # Examples
///
/// ```rust
/// use aperture_models_sdk::ProviderError;
///
/// match provider_result {
///     Ok(_) => {}
///     Err(ProviderError::InvalidApiKey) => println!("bad key"),
///     Err(ProviderError::RateLimit) => println!("backoff and retry"),
///     Err(e) => println!("other error: {}", e),
/// }
/// # let provider_result: Result<(), ProviderError> = Ok(());
/// ```
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider API error with the upstream status code and message.
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Quota exceeded")]
    QuotaExceeded,

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Timeout")]
    Timeout,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid response format")]
    InvalidResponse,

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Provider not supported: {provider}")]
    ProviderNotSupported { provider: String },

    #[error("Feature not supported: {feature}")]
    FeatureNotSupported { feature: String },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Request validation failed: {field} - {message}")]
    ValidationError { field: String, message: String },

    #[error("Network error: {message}")]
    NetworkError { message: String },

    #[error("Retryable error: {message}")]
    RetryableError { message: String },
}

impl ProviderError {
    /// Whether a failed call against this provider should count towards
    /// the circuit breaker's consecutive-failure tally.
    ///
    /// Validation errors are the caller's fault, not the provider's, so they
    /// don't trip the breaker.
    pub fn trips_circuit_breaker(&self) -> bool {
        !matches!(
            self,
            ProviderError::ValidationError { .. } | ProviderError::ModelNotFound { .. }
        )
    }
}
