//! Core types for providers, models, tasks, and canonical requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::error::{Error, Result};

/// AI provider identity. Closed set; each variant has exactly one driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProviderId {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "huggingface")]
    HuggingFace,
    #[serde(rename = "mistral")]
    Mistral,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "qwen")]
    Qwen,
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl ProviderId {
    /// All provider ids, in registry initialization order.
    pub const ALL: [ProviderId; 7] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::HuggingFace,
        ProviderId::Mistral,
        ProviderId::DeepSeek,
        ProviderId::Qwen,
        ProviderId::OpenRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::HuggingFace => "huggingface",
            Self::Mistral => "mistral",
            Self::DeepSeek => "deepseek",
            Self::Qwen => "qwen",
            Self::OpenRouter => "openrouter",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "huggingface" => Ok(Self::HuggingFace),
            "mistral" => Ok(Self::Mistral),
            "deepseek" => Ok(Self::DeepSeek),
            "qwen" => Ok(Self::Qwen),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(Error::validation(format!("unknown provider: {}", other))),
        }
    }
}

/// Kind of work a request asks for. Wire names are snake_case and stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    TextGeneration,
    Summarization,
    TopicExtraction,
    Classification,
    Embedding,
    Sensemaking,
    Planning,
    MediaAnalysis,
    Translation,
    Chat,
    System,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextGeneration => "text_generation",
            Self::Summarization => "summarization",
            Self::TopicExtraction => "topic_extraction",
            Self::Classification => "classification",
            Self::Embedding => "embedding",
            Self::Sensemaking => "sensemaking",
            Self::Planning => "planning",
            Self::MediaAnalysis => "media_analysis",
            Self::Translation => "translation",
            Self::Chat => "chat",
            Self::System => "system",
        }
    }

    /// Default system prompt injected when the caller supplies none.
    pub fn system_prompt(&self) -> Option<&'static str> {
        match self {
            Self::Summarization => Some(
                "You are an expert at creating concise, accurate summaries. \
                 Focus on the key points and main ideas while preserving important context.",
            ),
            Self::TopicExtraction => Some(
                "You are an expert at identifying and extracting key topics and themes \
                 from text. Provide clear, relevant topics with brief explanations.",
            ),
            Self::Classification => Some(
                "You are an expert at text classification. Analyze the content carefully \
                 and provide accurate, well-reasoned classifications.",
            ),
            Self::Sensemaking => Some(
                "You are an expert at analyzing complex information and making sense of \
                 patterns, relationships, and insights. Think deeply about connections \
                 and implications.",
            ),
            Self::Planning => Some(
                "You are an expert at creating structured plans and organizing \
                 information logically. Break down complex tasks into manageable steps.",
            ),
            Self::Translation => Some(
                "You are an expert translator. Provide accurate, natural translations \
                 while preserving meaning, context, and cultural nuances.",
            ),
            Self::MediaAnalysis => Some(
                "You are an expert at analyzing visual content. Describe what you see in \
                 detail and provide insights about the content.",
            ),
            _ => None,
        }
    }

    /// Whether the task is shaped as a chat transcript when sent to vendors.
    /// Embeddings and classification use dedicated request shapes.
    pub fn uses_chat_framing(&self) -> bool {
        !matches!(self, Self::Embedding | Self::Classification)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request priority. Higher priorities favor models with higher intrinsic
/// scores during selection.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// One model in a provider's catalog, with pricing and capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Stable model identifier (e.g., "gpt-4o")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Owning provider
    pub provider: ProviderId,
    /// Maximum context window in tokens
    pub max_context_tokens: u32,
    /// Tasks this model can perform
    pub capabilities: BTreeSet<TaskKind>,
    /// Supports streamed responses
    pub streaming: bool,
    /// Supports function/tool calling
    pub functions: bool,
    /// Supports image inputs
    pub vision: bool,
    /// Cost per 1000 prompt tokens (currency units)
    pub cost_per_1k_prompt: f64,
    /// Cost per 1000 completion tokens (currency units)
    pub cost_per_1k_completion: f64,
    /// Intrinsic selection score, higher is better
    pub priority_score: f64,
    /// Whether the model is currently offered
    pub available: bool,
}

/// Fraction of an estimate attributed to prompt tokens; the rest is
/// attributed to the completion.
pub const PROMPT_TOKEN_FRACTION: f64 = 0.7;

impl ModelDescriptor {
    /// Check structural invariants: positive context window, non-negative
    /// costs, at least one capability.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::validation("model id must not be empty"));
        }
        if self.max_context_tokens == 0 {
            return Err(Error::validation(format!(
                "model {} has zero context window",
                self.id
            )));
        }
        if self.cost_per_1k_prompt < 0.0 || self.cost_per_1k_completion < 0.0 {
            return Err(Error::validation(format!(
                "model {} has negative cost",
                self.id
            )));
        }
        if self.capabilities.is_empty() {
            return Err(Error::validation(format!(
                "model {} declares no capabilities",
                self.id
            )));
        }
        Ok(())
    }

    pub fn supports(&self, task: TaskKind) -> bool {
        self.capabilities.contains(&task)
    }

    /// The higher of the two per-1k unit costs. Tier access ceilings compare
    /// against this value.
    pub fn unit_cost(&self) -> f64 {
        self.cost_per_1k_prompt.max(self.cost_per_1k_completion)
    }

    /// Estimated cost for a token budget, assuming the standard 70/30
    /// prompt/completion split.
    pub fn estimate_cost(&self, estimated_tokens: u32) -> f64 {
        let prompt_tokens = (estimated_tokens as f64 * PROMPT_TOKEN_FRACTION).floor();
        let completion_tokens = (estimated_tokens as f64 * (1.0 - PROMPT_TOKEN_FRACTION)).floor();
        (prompt_tokens / 1000.0) * self.cost_per_1k_prompt
            + (completion_tokens / 1000.0) * self.cost_per_1k_completion
    }
}

/// Role of a chat participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Canonical request payload: plain text, an ordered transcript, or raw
/// media bytes for vision-capable models.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum RequestContent {
    Text { text: String },
    Messages { messages: Vec<ChatMessage> },
    Media {
        #[serde(with = "media_bytes")]
        data: Vec<u8>,
        mime_type: String,
        prompt: Option<String>,
    },
}

/// Base64 transport encoding for media payloads.
mod media_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

impl RequestContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn messages(messages: Vec<ChatMessage>) -> Self {
        Self::Messages { messages }
    }

    /// Flatten to plain text for vendors without a transcript shape.
    pub fn as_plain_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Messages { messages } => messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
            Self::Media { prompt, .. } => prompt.clone().unwrap_or_default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text { text } => text.is_empty(),
            Self::Messages { messages } => messages.is_empty(),
            Self::Media { data, .. } => data.is_empty(),
        }
    }
}

pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.95;

/// Sampling and length parameters. Unset fields are omitted from outbound
/// vendor requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    /// Sampling temperature in [0, 2]
    pub temperature: Option<f64>,
    /// Nucleus sampling in [0, 1]
    pub top_p: Option<f64>,
    /// Frequency penalty in [-2, 2]
    pub frequency_penalty: Option<f64>,
    /// Presence penalty in [-2, 2]
    pub presence_penalty: Option<f64>,
    pub stop_sequences: Option<Vec<String>>,
}

impl GenerationParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p.clamp(0.0, 1.0));
        self
    }

    pub fn with_frequency_penalty(mut self, penalty: f64) -> Self {
        self.frequency_penalty = Some(penalty.clamp(-2.0, 2.0));
        self
    }

    pub fn with_presence_penalty(mut self, penalty: f64) -> Self {
        self.presence_penalty = Some(penalty.clamp(-2.0, 2.0));
        self
    }

    pub fn with_stop_sequences(mut self, stop: Vec<String>) -> Self {
        self.stop_sequences = Some(stop);
        self
    }
}

/// A driver-level processing request, assembled by the router from the
/// caller's canonical request plus session state.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub task: TaskKind,
    pub model_id: String,
    pub content: RequestContent,
    pub params: GenerationParams,
    /// Prior transcript from the caller's session, oldest first
    pub session_messages: Vec<ChatMessage>,
    /// Candidate labels for zero-shot classification
    pub candidate_labels: Option<Vec<String>>,
}

impl DriverRequest {
    pub fn new(task: TaskKind, model_id: impl Into<String>, content: RequestContent) -> Self {
        Self {
            task,
            model_id: model_id.into(),
            content,
            params: GenerationParams::default(),
            session_messages: Vec::new(),
            candidate_labels: None,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_session_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.session_messages = messages;
        self
    }

    pub fn with_candidate_labels(mut self, labels: Vec<String>) -> Self {
        self.candidate_labels = Some(labels);
        self
    }
}

/// Generated payload in a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ResponseContent {
    Text(String),
    Json(Value),
    Vector(Vec<f32>),
    Vectors(Vec<Vec<f32>>),
}

impl ResponseContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Canonical result of one driver call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: ResponseContent,
    /// Model that actually served the request
    pub model_id: String,
    /// Total tokens consumed, when the vendor reports them
    pub tokens_used: Option<u32>,
    pub finish_reason: Option<String>,
    /// Free-form vendor metadata; carries input/output token counts when
    /// reported
    pub metadata: HashMap<String, Value>,
}

impl ProviderResponse {
    pub fn text(model_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content: ResponseContent::Text(content.into()),
            model_id: model_id.into(),
            tokens_used: None,
            finish_reason: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_tokens(mut self, input: u32, output: u32) -> Self {
        self.tokens_used = Some(input + output);
        self.metadata
            .insert("input_tokens".into(), Value::from(input));
        self.metadata
            .insert("output_tokens".into(), Value::from(output));
        self
    }

    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    pub fn input_tokens(&self) -> Option<u64> {
        self.metadata.get("input_tokens").and_then(Value::as_u64)
    }

    pub fn output_tokens(&self) -> Option<u64> {
        self.metadata.get("output_tokens").and_then(Value::as_u64)
    }
}

/// Driver lifecycle state.
///
/// `initialize` moves Uninitialized through Initializing to Ready. Health
/// checks toggle Ready and Degraded. `shutdown` moves any state through
/// ShuttingDown to Terminated. Only Ready and Degraded accept work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Uninitialized,
    Initializing,
    Ready,
    Degraded,
    ShuttingDown,
    Terminated,
}

impl ProviderState {
    /// Whether `process` may be dispatched in this state.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Ready | Self::Degraded)
    }
}

/// Health snapshot kept by the registry per provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub state: ProviderState,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            state: ProviderState::Uninitialized,
            last_check: None,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, prompt_cost: f64, completion_cost: f64) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            name: id.into(),
            provider: ProviderId::OpenAi,
            max_context_tokens: 128_000,
            capabilities: [TaskKind::Chat, TaskKind::Summarization].into_iter().collect(),
            streaming: true,
            functions: false,
            vision: false,
            cost_per_1k_prompt: prompt_cost,
            cost_per_1k_completion: completion_cost,
            priority_score: 8.0,
            available: true,
        }
    }

    #[test]
    fn test_provider_id_round_trip() {
        for provider in ProviderId::ALL {
            let parsed: ProviderId = provider.as_str().parse().unwrap();
            assert_eq!(parsed, provider);
            let json = serde_json::to_string(&provider).unwrap();
            assert_eq!(json, format!("\"{}\"", provider.as_str()));
        }
    }

    #[test]
    fn test_task_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskKind::TopicExtraction).unwrap(),
            "\"topic_extraction\""
        );
        assert_eq!(TaskKind::MediaAnalysis.as_str(), "media_analysis");
    }

    #[test]
    fn test_task_system_prompts() {
        assert!(TaskKind::Summarization.system_prompt().unwrap().contains("summaries"));
        assert!(TaskKind::Translation.system_prompt().unwrap().contains("translator"));
        assert!(TaskKind::Chat.system_prompt().is_none());
        assert!(TaskKind::TextGeneration.system_prompt().is_none());
        assert!(TaskKind::Embedding.system_prompt().is_none());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(descriptor("gpt-4o", 0.005, 0.015).validate().is_ok());

        let mut zero_context = descriptor("m", 0.001, 0.001);
        zero_context.max_context_tokens = 0;
        assert!(zero_context.validate().is_err());

        let mut negative_cost = descriptor("m", -0.1, 0.0);
        assert!(negative_cost.validate().is_err());
        negative_cost.cost_per_1k_prompt = 0.0;
        assert!(negative_cost.validate().is_ok());

        let mut no_caps = descriptor("m", 0.001, 0.001);
        no_caps.capabilities.clear();
        assert!(no_caps.validate().is_err());
    }

    #[test]
    fn test_unit_cost_is_max_component() {
        let model = descriptor("m", 0.002, 0.006);
        assert_eq!(model.unit_cost(), 0.006);
    }

    #[test]
    fn test_estimate_cost_split() {
        let model = descriptor("m", 0.010, 0.030);
        // 1000 tokens: 700 prompt at 0.010/1k + 300 completion at 0.030/1k
        let cost = model.estimate_cost(1000);
        assert!((cost - (0.7 * 0.010 + 0.3 * 0.030)).abs() < 1e-9);
    }

    #[test]
    fn test_generation_params_clamping() {
        let params = GenerationParams::new()
            .with_temperature(5.0)
            .with_top_p(1.5)
            .with_frequency_penalty(-3.0)
            .with_presence_penalty(9.0);
        assert_eq!(params.temperature, Some(2.0));
        assert_eq!(params.top_p, Some(1.0));
        assert_eq!(params.frequency_penalty, Some(-2.0));
        assert_eq!(params.presence_penalty, Some(2.0));
    }

    #[test]
    fn test_unset_params_serialize_as_null_free_defaults() {
        let params = GenerationParams::default();
        assert!(params.max_tokens.is_none());
        assert!(params.temperature.is_none());
    }

    #[test]
    fn test_request_content_plain_text() {
        let content = RequestContent::messages(vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("second"),
        ]);
        assert_eq!(content.as_plain_text(), "first\n\nsecond");
    }

    #[test]
    fn test_media_content_round_trip() {
        let content = RequestContent::Media {
            data: vec![0xde, 0xad, 0xbe, 0xef],
            mime_type: "image/png".into(),
            prompt: Some("what is this".into()),
        };
        let json = serde_json::to_string(&content).unwrap();
        let back: RequestContent = serde_json::from_str(&json).unwrap();
        match back {
            RequestContent::Media { data, .. } => assert_eq!(data, vec![0xde, 0xad, 0xbe, 0xef]),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_provider_response_token_metadata() {
        let response = ProviderResponse::text("gpt-4o", "hello").with_tokens(120, 40);
        assert_eq!(response.tokens_used, Some(160));
        assert_eq!(response.input_tokens(), Some(120));
        assert_eq!(response.output_tokens(), Some(40));
    }

    #[test]
    fn test_provider_state_accepts_work() {
        assert!(ProviderState::Ready.accepts_work());
        assert!(ProviderState::Degraded.accepts_work());
        assert!(!ProviderState::Uninitialized.accepts_work());
        assert!(!ProviderState::ShuttingDown.accepts_work());
        assert!(!ProviderState::Terminated.accepts_work());
    }
}
