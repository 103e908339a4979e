//! Anthropic driver. Messages API with a top-level system prompt and
//! strict user/assistant alternation.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProviderCredentials;
use crate::error::{Error, Result};

use super::driver::{
    assemble_transcript, build_http_client, classify_http_status, classify_transport_error,
    require_model, retry_after_ms, split_system_and_alternate, ProviderDriver,
};
use super::types::{
    DriverRequest, ModelDescriptor, ProviderId, ProviderResponse, RequestContent, Role, TaskKind,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicDriver {
    http: Client,
    base_url: String,
    api_key: String,
    models: Vec<ModelDescriptor>,
}

fn catalog() -> Vec<ModelDescriptor> {
    use TaskKind::*;
    let full: Vec<TaskKind> = vec![
        TextGeneration,
        Summarization,
        TopicExtraction,
        Classification,
        Sensemaking,
        Planning,
        Translation,
        Chat,
    ];
    let light: Vec<TaskKind> = vec![
        TextGeneration,
        Summarization,
        TopicExtraction,
        Classification,
        Translation,
        Chat,
    ];

    vec![
        ModelDescriptor {
            id: "claude-3-5-sonnet-20241022".into(),
            name: "Claude 3.5 Sonnet".into(),
            provider: ProviderId::Anthropic,
            max_context_tokens: 200_000,
            capabilities: full.iter().copied().chain([MediaAnalysis]).collect(),
            streaming: true,
            functions: false,
            vision: true,
            cost_per_1k_prompt: 0.003,
            cost_per_1k_completion: 0.015,
            priority_score: 10.0,
            available: true,
        },
        ModelDescriptor {
            id: "claude-3-opus-20240229".into(),
            name: "Claude 3 Opus".into(),
            provider: ProviderId::Anthropic,
            max_context_tokens: 200_000,
            capabilities: full.iter().copied().collect(),
            streaming: true,
            functions: false,
            vision: false,
            cost_per_1k_prompt: 0.015,
            cost_per_1k_completion: 0.075,
            priority_score: 9.5,
            available: true,
        },
        ModelDescriptor {
            id: "claude-3-sonnet-20240229".into(),
            name: "Claude 3 Sonnet".into(),
            provider: ProviderId::Anthropic,
            max_context_tokens: 200_000,
            capabilities: full.iter().copied().collect(),
            streaming: true,
            functions: false,
            vision: false,
            cost_per_1k_prompt: 0.003,
            cost_per_1k_completion: 0.015,
            priority_score: 8.5,
            available: true,
        },
        ModelDescriptor {
            id: "claude-3-haiku-20240307".into(),
            name: "Claude 3 Haiku".into(),
            provider: ProviderId::Anthropic,
            max_context_tokens: 200_000,
            capabilities: light.iter().copied().collect(),
            streaming: true,
            functions: false,
            vision: false,
            cost_per_1k_prompt: 0.00025,
            cost_per_1k_completion: 0.00125,
            priority_score: 7.0,
            available: true,
        },
    ]
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Image { source: ImageSource },
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl AnthropicDriver {
    pub fn new(credentials: &ProviderCredentials) -> Result<Self> {
        Ok(Self {
            http: build_http_client(credentials.timeout_secs)?,
            base_url: credentials
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: credentials.api_key.clone(),
            models: catalog(),
        })
    }

    fn wire_messages(
        &self,
        request: &DriverRequest,
        vision: bool,
    ) -> Result<(Option<String>, Vec<WireMessage>)> {
        let transcript =
            assemble_transcript(request.task, &request.content, &request.session_messages);
        let (system, turns) = split_system_and_alternate(transcript);

        let mut messages: Vec<WireMessage> = turns
            .into_iter()
            .map(|m| WireMessage {
                role: if m.role == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                },
                content: WireContent::Text(m.content),
            })
            .collect();

        if let RequestContent::Media {
            data, mime_type, ..
        } = &request.content
        {
            if !vision {
                return Err(Error::TaskNotSupported {
                    model_id: request.model_id.clone(),
                    task: TaskKind::MediaAnalysis.to_string(),
                });
            }
            if let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == "user") {
                let text = match &last_user.content {
                    WireContent::Text(text) => text.clone(),
                    WireContent::Blocks(_) => String::new(),
                };
                last_user.content = WireContent::Blocks(vec![
                    ContentBlock::Image {
                        source: ImageSource {
                            source_type: "base64",
                            media_type: mime_type.clone(),
                            data: BASE64.encode(data),
                        },
                    },
                    ContentBlock::Text { text },
                ]);
            }
        }

        Ok((system, messages))
    }
}

#[async_trait]
impl ProviderDriver for AnthropicDriver {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Anthropic
    }

    fn display_name(&self) -> &str {
        "Anthropic Claude"
    }

    async fn initialize(&self) -> Result<()> {
        for model in &self.models {
            model.validate()?;
        }
        tracing::info!(models = self.models.len(), "anthropic driver initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn list_models(&self) -> Vec<ModelDescriptor> {
        self.models.clone()
    }

    async fn process(&self, request: &DriverRequest) -> Result<ProviderResponse> {
        let model = require_model(&self.models, &request.model_id, request.task)?;
        let (system, messages) = self.wire_messages(request, model.vision)?;

        let api_request = MessagesRequest {
            model: request.model_id.clone(),
            messages,
            max_tokens: request.params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system,
            // Anthropic caps temperature at 1.0
            temperature: request.params.temperature.map(|t| t.min(1.0)),
            top_p: request.params.top_p,
            stop_sequences: request.params.stop_sequences.clone(),
        };

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Anthropic, e))?;

        let status = response.status();
        let retry_after = retry_after_ms(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Anthropic, e))?;

        if !status.is_success() {
            return Err(classify_http_status(
                ProviderId::Anthropic,
                status,
                &body,
                retry_after,
            ));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| Error::internal(format!("anthropic response parse failed: {}", e)))?;

        let text = parsed
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let mut out = ProviderResponse::text(parsed.model, text)
            .with_tokens(parsed.usage.input_tokens, parsed.usage.output_tokens);
        if let Some(reason) = parsed.stop_reason {
            out = out.with_finish_reason(reason);
        }
        Ok(out)
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Anthropic, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_ms(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status(
                ProviderId::Anthropic,
                status,
                &body,
                retry_after,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::ChatMessage;

    fn driver() -> AnthropicDriver {
        AnthropicDriver::new(&ProviderCredentials::new("sk-ant-test")).unwrap()
    }

    #[test]
    fn test_catalog() {
        let models = driver().list_models();
        assert_eq!(models.len(), 4);
        for model in &models {
            model.validate().unwrap();
            assert_eq!(model.max_context_tokens, 200_000);
        }
        assert!(models.iter().any(|m| m.vision));
    }

    #[test]
    fn test_wire_messages_extracts_system_and_alternates() {
        let request = DriverRequest::new(
            TaskKind::Summarization,
            "claude-3-5-sonnet-20241022",
            RequestContent::text("a long report"),
        )
        .with_session_messages(vec![ChatMessage::assistant("earlier reply")]);

        let (system, messages) = driver().wire_messages(&request, true).unwrap();
        assert!(system.unwrap().contains("summaries"));
        // Assistant-first transcript gets the neutral user opener.
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn test_request_serialization_omits_empty_fields() {
        let api_request = MessagesRequest {
            model: "claude-3-haiku-20240307".into(),
            messages: vec![WireMessage {
                role: "user",
                content: WireContent::Text("hi".into()),
            }],
            max_tokens: 4096,
            system: None,
            temperature: None,
            top_p: None,
            stop_sequences: None,
        };
        let json = serde_json::to_string(&api_request).unwrap();
        assert!(!json.contains("system"));
        assert!(!json.contains("temperature"));
        assert!(json.contains("\"max_tokens\":4096"));
    }

    #[test]
    fn test_temperature_clamped_to_vendor_max() {
        let params = crate::provider::types::GenerationParams::new().with_temperature(1.8);
        // The crate-wide range allows 1.8; the driver narrows it.
        assert_eq!(params.temperature, Some(1.8));
        assert_eq!(params.temperature.map(|t| t.min(1.0)), Some(1.0));
    }

    #[test]
    fn test_response_parse_joins_blocks() {
        let body = r#"{
            "id": "msg_1",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "Hello "}, {"type": "text", "text": "world"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 2}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(body).unwrap();
        let text: String = parsed
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect();
        assert_eq!(text, "Hello world");
    }
}
