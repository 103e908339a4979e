//! Provider abstraction: a uniform capability interface over the federated
//! vendor APIs, one driver per provider.
//!
//! Drivers translate canonical requests into each vendor's wire format,
//! parse the responses back, and classify failures. They never retry on
//! their own; fallback policy lives in the router.

pub mod anthropic;
pub mod deepseek;
pub mod driver;
pub mod huggingface;
pub mod mistral;
pub mod openai;
pub(crate) mod openai_compat;
pub mod openrouter;
pub mod qwen;
pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use anthropic::AnthropicDriver;
pub use deepseek::DeepSeekDriver;
pub use driver::ProviderDriver;
pub use huggingface::HuggingFaceDriver;
pub use mistral::MistralDriver;
pub use openai::OpenAiDriver;
pub use openrouter::OpenRouterDriver;
pub use qwen::QwenDriver;
pub use types::{
    ChatMessage, DriverRequest, GenerationParams, ModelDescriptor, Priority, ProviderHealth,
    ProviderId, ProviderResponse, ProviderState, RequestContent, ResponseContent, Role, TaskKind,
};
