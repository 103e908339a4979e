//! # autoswap-core
//!
//! A multi-provider AI model routing and arbitration gateway. Given a task
//! kind and a caller identity, it selects the best model across a
//! federation of LLM backends, enforces per-tier spending limits, caches
//! responses, records performance, and falls back across providers on
//! failure.
//!
//! ## Core Components
//!
//! - **Provider**: one driver per vendor behind a uniform capability trait
//! - **Registry**: driver lifecycle, model catalog, health monitoring
//! - **Router**: candidate scoring and fallback-chain execution
//! - **Gate**: cost estimation, tier limits, circuit breaker
//! - **Cache**: two-tier TTL response cache with deterministic fingerprints
//! - **Gateway**: the `process` facade tying it all together
//!
//! ## Example
//!
//! ```rust,ignore
//! use autoswap_core::{
//!     Gateway, GatewayConfig, ProcessRequest, ProviderCredentials,
//!     ProviderId, RequestContent, TaskKind, UserTier,
//! };
//!
//! let config = GatewayConfig::new()
//!     .with_provider(ProviderId::OpenAi, ProviderCredentials::new(api_key));
//! let gateway = Gateway::new(&config)?;
//! gateway.initialize().await?;
//!
//! let request = ProcessRequest::new(
//!     TaskKind::Summarization,
//!     RequestContent::text("Long chat export to summarize…"),
//!     "user-123",
//! )
//! .with_tier(UserTier::Clawback);
//!
//! let response = gateway.process(request).await?;
//! println!("{} via {}", response.model_id, response.provider);
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod ledger;
pub mod provider;
pub mod registry;
pub mod router;
pub mod session;

// Re-exports for convenience
pub use cache::{fingerprint, CachedResponse, HttpKv, RemoteKv, ResponseCache};
pub use config::{GatewayConfig, ProviderCredentials, RemoteCacheConfig};
pub use error::{AttemptFailure, Error, ErrorEnvelope, ErrorKind, Result};
pub use gate::{
    Admission, CostGate, SecurityLevel, SpendingLimits, SpendingState, UserApiKey, UserTier,
};
pub use gateway::{
    Gateway, MultiModelMode, ProcessRequest, ProcessResponse, TemplateStore,
};
pub use ledger::{
    LedgerStore, PerformanceEvent, PerformanceLedger, PerformanceRecord, SqliteLedgerStore,
};
pub use provider::{
    AnthropicDriver, ChatMessage, DeepSeekDriver, DriverRequest, GenerationParams,
    HuggingFaceDriver, MistralDriver, ModelDescriptor, OpenAiDriver, OpenRouterDriver, Priority,
    ProviderDriver, ProviderHealth, ProviderId, ProviderResponse, ProviderState, QwenDriver,
    RequestContent, ResponseContent, Role, TaskKind,
};
pub use registry::{ProviderRegistry, RegistryStats};
pub use router::{Candidate, RouteConstraints, RoutedOutcome, RoutedRequest, RoutingStats, TaskRouter};
pub use session::{SessionContext, SessionStore};
