//! Provider driver trait and shared request-shaping helpers.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::error::{Error, Result};

use super::types::{
    ChatMessage, DriverRequest, ModelDescriptor, ProviderId, ProviderResponse, RequestContent,
    Role, TaskKind,
};

/// Default per-provider HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Neutral opener inserted when a strict-alternation vendor would otherwise
/// see a transcript that does not start with a user turn.
pub const NEUTRAL_USER_OPENER: &str = "Please help me with the following:";

/// Uniform capability interface over one external provider API.
///
/// A driver translates canonical requests into the vendor's wire format and
/// parses the vendor's response back into a [`ProviderResponse`]. Drivers
/// classify failures but never retry; the router owns fallback policy.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// Which provider this driver speaks to.
    fn provider_id(&self) -> ProviderId;

    /// Human-readable provider name.
    fn display_name(&self) -> &str;

    /// Validate credentials and load the model catalog.
    async fn initialize(&self) -> Result<()>;

    /// Release vendor connections. Idempotent.
    async fn shutdown(&self) -> Result<()>;

    /// The provider's model catalog.
    fn list_models(&self) -> Vec<ModelDescriptor>;

    /// Whether the given model can perform the given task.
    fn supports_task(&self, model_id: &str, task: TaskKind) -> bool {
        self.list_models()
            .iter()
            .any(|m| m.id == model_id && m.supports(task))
    }

    /// Execute one request against the vendor.
    async fn process(&self, request: &DriverRequest) -> Result<ProviderResponse>;

    /// Cheap liveness probe. Err means unhealthy, with the reason.
    async fn health_check(&self) -> Result<()>;
}

/// Build the reqwest client a driver uses for its lifetime.
pub(crate) fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::internal(format!("failed to build HTTP client: {}", e)))
}

/// Look up a model in a catalog, distinguishing a missing model from one
/// that cannot serve the task.
pub(crate) fn require_model<'a>(
    models: &'a [ModelDescriptor],
    model_id: &str,
    task: TaskKind,
) -> Result<&'a ModelDescriptor> {
    let model = models
        .iter()
        .find(|m| m.id == model_id)
        .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))?;
    if !model.supports(task) {
        return Err(Error::TaskNotSupported {
            model_id: model_id.to_string(),
            task: task.to_string(),
        });
    }
    Ok(model)
}

/// Assemble the chat transcript for a generation-like task: task system
/// prompt, prior session messages, then the current content. Consecutive
/// messages with the same role are merged.
pub(crate) fn assemble_transcript(
    task: TaskKind,
    content: &RequestContent,
    session_messages: &[ChatMessage],
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();

    if let Some(prompt) = task.system_prompt() {
        messages.push(ChatMessage::system(prompt));
    }

    messages.extend_from_slice(session_messages);

    match content {
        RequestContent::Text { text } => messages.push(ChatMessage::user(text.clone())),
        RequestContent::Messages { messages: current } => messages.extend_from_slice(current),
        RequestContent::Media { prompt, .. } => {
            let text = prompt
                .clone()
                .unwrap_or_else(|| "Describe this content.".to_string());
            messages.push(ChatMessage::user(text));
        }
    }

    merge_consecutive_roles(messages)
}

/// Merge adjacent messages that share a role into one, preserving order.
pub(crate) fn merge_consecutive_roles(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    for message in messages {
        match merged.last_mut() {
            Some(last) if last.role == message.role => {
                last.content.push_str("\n\n");
                last.content.push_str(&message.content);
            }
            _ => merged.push(message),
        }
    }
    merged
}

/// Split a transcript for vendors that take the system prompt as a top-level
/// field and require the remaining turns to start with `user`.
pub(crate) fn split_system_and_alternate(
    messages: Vec<ChatMessage>,
) -> (Option<String>, Vec<ChatMessage>) {
    let mut system_parts = Vec::new();
    let mut rest = Vec::new();

    for message in messages {
        if message.role == Role::System {
            system_parts.push(message.content);
        } else {
            rest.push(message);
        }
    }

    let mut rest = merge_consecutive_roles(rest);
    if rest.first().map(|m| m.role) != Some(Role::User) {
        rest.insert(0, ChatMessage::user(NEUTRAL_USER_OPENER));
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, rest)
}

/// Map an HTTP error status from a vendor to the internal error taxonomy.
pub(crate) fn classify_http_status(
    provider: ProviderId,
    status: StatusCode,
    body: &str,
    retry_after_ms: Option<u64>,
) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::authentication(provider.to_string(), summarize_body(body))
        }
        StatusCode::NOT_FOUND => Error::ModelNotFound(summarize_body(body)),
        StatusCode::TOO_MANY_REQUESTS => {
            Error::rate_limited(provider.to_string(), retry_after_ms)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            Error::validation(summarize_body(body))
        }
        s if s.is_server_error() => {
            Error::provider_unavailable(provider.to_string(), format!("HTTP {}", s.as_u16()))
        }
        s => Error::internal(format!(
            "{} API error ({}): {}",
            provider,
            s.as_u16(),
            summarize_body(body)
        )),
    }
}

/// Map a transport-level reqwest failure: timeouts become deadline errors,
/// connection failures mark the provider unavailable.
pub(crate) fn classify_transport_error(provider: ProviderId, error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::DeadlineExceeded { elapsed_ms: 0 }
    } else if error.is_connect() {
        Error::provider_unavailable(provider.to_string(), error.to_string())
    } else {
        Error::internal(format!("{} request failed: {}", provider, error))
    }
}

fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= 160 {
        trimmed.to_string()
    } else {
        let mut cut = 160;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &trimmed[..cut])
    }
}

/// Read a Retry-After header into milliseconds, if present and parseable.
pub(crate) fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(|secs| secs * 1000)
}
