//! # Aperture Models SDK
//!
//! Provider adapters, the canonical model registry, and circuit-breaker
//! failover selection that back the Aperture gateway. This crate has no
//! opinion about tenants, credits, or HTTP — it only knows how to talk to
//! upstream model providers and how to pick one when another is failing.
//!
//! ## Modules
//!
//! - [`models`] — wire types shared by every adapter (chat, tools, images, streaming)
//! - [`error`] — `ProviderError` / `ClientError`
//! - [`providers`] — the `Provider` trait plus adapters: `openai_compatible`, `vertex`, `image`
//! - [`registry`] — canonical model id -> ordered provider list, lock-free reads
//! - [`selector`] — per-(model, provider) circuit breaker and `execute_with_failover`
//!
//! ## Example
//!
//! ```rust
//! use aperture_models_sdk::providers::{openai_compatible::OpenAICompatibleProvider, Provider, ProviderConfig};
//!
//! let config = ProviderConfig::new("openrouter", "sk-...")
//!     .with_base_url("https://openrouter.ai/api/v1");
//! let provider = OpenAICompatibleProvider::new(config).unwrap();
//! assert_eq!(provider.name(), "openrouter");
//! ```

pub mod common;
pub mod error;
pub mod models;
pub mod providers;
pub mod registry;
pub mod selector;

pub use error::{ClientError, ProviderError};
pub use models::{ChatRequest, ChatResponse, Choice, ImageRequest, ImageResponse, Message, Role, Usage};
pub use providers::{Provider, ProviderConfig};
pub use registry::{CanonicalModel, Registry, RegistryProviderEntry};

pub type Result<T> = std::result::Result<T, ClientError>;
