//! OpenAI driver: chat completions plus the embeddings endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderCredentials;
use crate::error::{Error, Result};

use super::driver::{assemble_transcript, require_model, ProviderDriver};
use super::openai_compat::ChatEndpoint;
use super::types::{
    DriverRequest, ModelDescriptor, ProviderId, ProviderResponse, RequestContent,
    ResponseContent, TaskKind,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-large";

pub struct OpenAiDriver {
    endpoint: ChatEndpoint,
    models: Vec<ModelDescriptor>,
}

fn catalog() -> Vec<ModelDescriptor> {
    use TaskKind::*;
    let generation: Vec<TaskKind> = vec![
        TextGeneration,
        Summarization,
        TopicExtraction,
        Classification,
        Sensemaking,
        Planning,
        Translation,
        Chat,
    ];

    vec![
        ModelDescriptor {
            id: "gpt-4o".into(),
            name: "GPT-4o".into(),
            provider: ProviderId::OpenAi,
            max_context_tokens: 128_000,
            capabilities: generation
                .iter()
                .copied()
                .chain([MediaAnalysis])
                .collect(),
            streaming: true,
            functions: true,
            vision: true,
            cost_per_1k_prompt: 0.005,
            cost_per_1k_completion: 0.015,
            priority_score: 9.5,
            available: true,
        },
        ModelDescriptor {
            id: "gpt-4-turbo".into(),
            name: "GPT-4 Turbo".into(),
            provider: ProviderId::OpenAi,
            max_context_tokens: 128_000,
            capabilities: generation
                .iter()
                .copied()
                .chain([MediaAnalysis])
                .collect(),
            streaming: true,
            functions: true,
            vision: true,
            cost_per_1k_prompt: 0.010,
            cost_per_1k_completion: 0.030,
            priority_score: 9.0,
            available: true,
        },
        ModelDescriptor {
            id: "gpt-3.5-turbo".into(),
            name: "GPT-3.5 Turbo".into(),
            provider: ProviderId::OpenAi,
            max_context_tokens: 16_385,
            capabilities: [
                TextGeneration,
                Summarization,
                TopicExtraction,
                Classification,
                Translation,
                Chat,
            ]
            .into_iter()
            .collect(),
            streaming: true,
            functions: true,
            vision: false,
            cost_per_1k_prompt: 0.0005,
            cost_per_1k_completion: 0.0015,
            priority_score: 7.5,
            available: true,
        },
        ModelDescriptor {
            id: "text-embedding-3-large".into(),
            name: "Text Embedding 3 Large".into(),
            provider: ProviderId::OpenAi,
            max_context_tokens: 8191,
            capabilities: [Embedding].into_iter().collect(),
            streaming: false,
            functions: false,
            vision: false,
            cost_per_1k_prompt: 0.00013,
            cost_per_1k_completion: 0.0,
            priority_score: 9.0,
            available: true,
        },
        ModelDescriptor {
            id: "text-embedding-3-small".into(),
            name: "Text Embedding 3 Small".into(),
            provider: ProviderId::OpenAi,
            max_context_tokens: 8191,
            capabilities: [Embedding].into_iter().collect(),
            streaming: false,
            functions: false,
            vision: false,
            cost_per_1k_prompt: 0.00002,
            cost_per_1k_completion: 0.0,
            priority_score: 8.0,
            available: true,
        },
    ]
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<String>,
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    #[serde(default)]
    prompt_tokens: u32,
}

impl OpenAiDriver {
    pub fn new(credentials: &ProviderCredentials) -> Result<Self> {
        let mut endpoint = ChatEndpoint::new(ProviderId::OpenAi, credentials, DEFAULT_BASE_URL)?;
        if let Some(org) = &credentials.organization_id {
            endpoint = endpoint.with_header("OpenAI-Organization", org.clone());
        }
        Ok(Self {
            endpoint,
            models: catalog(),
        })
    }

    async fn embed(&self, request: &DriverRequest) -> Result<ProviderResponse> {
        let model_id = if request.model_id.is_empty() {
            DEFAULT_EMBEDDING_MODEL
        } else {
            &request.model_id
        };

        let (inputs, single) = match &request.content {
            RequestContent::Text { text } => (vec![text.clone()], true),
            RequestContent::Messages { messages } => (
                messages.iter().map(|m| m.content.clone()).collect(),
                false,
            ),
            RequestContent::Media { .. } => {
                return Err(Error::validation("embedding input must be text"))
            }
        };

        let payload = EmbeddingRequest {
            model: model_id,
            input: inputs,
            encoding_format: "float",
        };

        let parsed: EmbeddingResponse = self.endpoint.post_json("/embeddings", &payload).await?;
        let mut vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|d| d.embedding).collect();
        if vectors.is_empty() {
            return Err(Error::internal("openai returned no embeddings"));
        }

        let content = if single {
            ResponseContent::Vector(vectors.remove(0))
        } else {
            ResponseContent::Vectors(vectors)
        };

        let mut response = ProviderResponse {
            content,
            model_id: model_id.to_string(),
            tokens_used: None,
            finish_reason: Some("completed".into()),
            metadata: Default::default(),
        };
        if let Some(usage) = parsed.usage {
            response = ProviderResponse {
                tokens_used: Some(usage.prompt_tokens),
                ..response
            };
        }
        Ok(response)
    }
}

#[async_trait]
impl ProviderDriver for OpenAiDriver {
    fn provider_id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn display_name(&self) -> &str {
        "OpenAI"
    }

    async fn initialize(&self) -> Result<()> {
        for model in &self.models {
            model.validate()?;
        }
        tracing::info!(models = self.models.len(), "openai driver initialized");
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

        if request.task == TaskKind::Embedding {
            return self.embed(request).await;
        }

        let image = match &request.content {
            RequestContent::Media {
                data, mime_type, ..
            } => {
                if !model.vision {
                    return Err(Error::TaskNotSupported {
                        model_id: model.id.clone(),
                        task: TaskKind::MediaAnalysis.to_string(),
                    });
                }
                Some((data.as_slice(), mime_type.as_str()))
            }
            _ => None,
        };

        let transcript =
            assemble_transcript(request.task, &request.content, &request.session_messages);
        self.endpoint
            .chat(&request.model_id, &transcript, &request.params, image)
            .await
    }

    async fn health_check(&self) -> Result<()> {
        let _: serde_json::Value = self.endpoint.get_json("/models").await?;
        Ok(())
    }
}
