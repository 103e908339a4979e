//! Qwen driver. DashScope text-generation endpoint with its nested
//! `{input, parameters}` envelope.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ProviderCredentials;
use crate::error::{Error, Result};

use super::driver::{
    assemble_transcript, build_http_client, classify_http_status, classify_transport_error,
    require_model, retry_after_ms, ProviderDriver,
};
use super::types::{
    ChatMessage, DriverRequest, GenerationParams, ModelDescriptor, ProviderId, ProviderResponse,
    TaskKind,
};

const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/api/v1";
const GENERATION_PATH: &str = "/services/aigc/text-generation/generation";

pub struct QwenDriver {
    http: Client,
    base_url: String,
    api_key: String,
    models: Vec<ModelDescriptor>,
}

fn catalog() -> Vec<ModelDescriptor> {
    use TaskKind::*;
    let light: Vec<TaskKind> = vec![
        TextGeneration,
        Summarization,
        TopicExtraction,
        Classification,
        Translation,
        Chat,
    ];
    let full: Vec<TaskKind> = light
        .iter()
        .copied()
        .chain([Sensemaking, Planning])
        .collect();

    let base = |id: &str,
                name: &str,
                context: u32,
                caps: &[TaskKind],
                prompt: f64,
                completion: f64,
                score: f64| {
        ModelDescriptor {
            id: id.into(),
            name: name.into(),
            provider: ProviderId::Qwen,
            max_context_tokens: context,
            capabilities: caps.iter().copied().collect(),
            streaming: true,
            functions: false,
            vision: false,
            cost_per_1k_prompt: prompt,
            cost_per_1k_completion: completion,
            priority_score: score,
            available: true,
        }
    };

    // DashScope prices completion tokens above prompt tokens: 2x for
    // turbo, 2.5x for plus, 4x for max.
    vec![
        base("qwen-turbo", "Qwen Turbo", 8_192, &light, 0.002, 0.004, 7.0),
        base("qwen-plus", "Qwen Plus", 32_768, &full, 0.004, 0.010, 8.0),
        base("qwen-max", "Qwen Max", 32_768, &full, 0.02, 0.08, 8.5),
    ]
}

#[derive(Debug, Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    input: GenerationInput,
    parameters: GenerationParameters,
}

#[derive(Debug, Serialize)]
struct GenerationInput {
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct GenerationParameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

impl GenerationParameters {
    fn from_params(params: &GenerationParams) -> Self {
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
            stop: params.stop_sequences.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerationResponse {
    output: GenerationOutput,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct GenerationOutput {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl QwenDriver {
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

    async fn generate(
        &self,
        model_id: &str,
        transcript: &[ChatMessage],
        parameters: GenerationParameters,
    ) -> Result<ProviderResponse> {
        let request = GenerationRequest {
            model: model_id,
            input: GenerationInput {
                messages: transcript
                    .iter()
                    .map(|m| WireMessage {
                        role: m.role.to_string(),
                        content: m.content.clone(),
                    })
                    .collect(),
            },
            parameters,
        };

        let url = format!("{}{}", self.base_url, GENERATION_PATH);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Qwen, e))?;

        let status = response.status();
        let retry_after = retry_after_ms(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(ProviderId::Qwen, e))?;

        if !status.is_success() {
            return Err(classify_http_status(ProviderId::Qwen, status, &body, retry_after));
        }

        let parsed: GenerationResponse = serde_json::from_str(&body)
            .map_err(|e| Error::internal(format!("qwen response parse failed: {}", e)))?;

        let mut out =
            ProviderResponse::text(model_id, parsed.output.text.unwrap_or_default());
        if let Some(usage) = parsed.usage {
            out = out.with_tokens(usage.input_tokens, usage.output_tokens);
        }
        if let Some(reason) = parsed.output.finish_reason {
            out = out.with_finish_reason(reason);
        }
        Ok(out)
    }
}

#[async_trait]
impl ProviderDriver for QwenDriver {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Qwen
    }

    fn display_name(&self) -> &str {
        "Qwen"
    }

    async fn initialize(&self) -> Result<()> {
        for model in &self.models {
            model.validate()?;
        }
        tracing::info!(models = self.models.len(), "qwen driver initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn list_models(&self) -> Vec<ModelDescriptor> {
        self.models.clone()
    }

    async fn process(&self, request: &DriverRequest) -> Result<ProviderResponse> {
        require_model(&self.models, &request.model_id, request.task)?;
        let transcript =
            assemble_transcript(request.task, &request.content, &request.session_messages);
        self.generate(
            &request.model_id,
            &transcript,
            GenerationParameters::from_params(&request.params),
        )
        .await
    }

    async fn health_check(&self) -> Result<()> {
        // DashScope has no listing endpoint; probe with a one-token call on
        // the cheapest model.
        let transcript = vec![ChatMessage::user("ping")];
        let parameters = GenerationParameters {
            temperature: Some(0.0),
            top_p: None,
            max_tokens: Some(1),
            stop: None,
        };
        self.generate("qwen-turbo", &transcript, parameters).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog() {
        let driver = QwenDriver::new(&ProviderCredentials::new("key")).unwrap();
        let models = driver.list_models();
        assert_eq!(models.len(), 3);
        assert!(driver.supports_task("qwen-max", TaskKind::Translation));
        assert!(!driver.supports_task("qwen-turbo", TaskKind::Planning));
        for model in &models {
            model.validate().unwrap();
            assert!(model.cost_per_1k_completion > model.cost_per_1k_prompt);
            assert_eq!(model.unit_cost(), model.cost_per_1k_completion);
        }
    }

    #[test]
    fn test_envelope_shape() {
        let request = GenerationRequest {
            model: "qwen-plus",
            input: GenerationInput {
                messages: vec![WireMessage {
                    role: "user".into(),
                    content: "hello".into(),
                }],
            },
            parameters: GenerationParameters {
                temperature: Some(0.7),
                top_p: None,
                max_tokens: Some(256),
                stop: None,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json["input"]["messages"][0]["content"].is_string());
        assert_eq!(json["parameters"]["max_tokens"], 256);
        assert!(json["parameters"].get("top_p").is_none());
    }

    #[test]
    fn test_response_parse() {
        let body = r#"{
            "output": {"text": "你好", "finish_reason": "stop"},
            "usage": {"input_tokens": 5, "output_tokens": 2, "total_tokens": 7},
            "request_id": "r-1"
        }"#;
        let parsed: GenerationResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.output.text.as_deref(), Some("你好"));
        assert_eq!(parsed.usage.unwrap().input_tokens, 5);
    }
}
