//! Mistral driver. Speaks the chat-completions dialect on Mistral's
//! La Plateforme endpoint.

use async_trait::async_trait;

use crate::config::ProviderCredentials;
use crate::error::Result;

use super::driver::{assemble_transcript, require_model, ProviderDriver};
use super::openai_compat::ChatEndpoint;
use super::types::{
    DriverRequest, ModelDescriptor, ProviderId, ProviderResponse, TaskKind,
};

const DEFAULT_BASE_URL: &str = "https://api.mistral.ai/v1";

pub struct MistralDriver {
    endpoint: ChatEndpoint,
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

    let base = |id: &str, name: &str, caps: &[TaskKind], prompt: f64, completion: f64, score: f64| {
        ModelDescriptor {
            id: id.into(),
            name: name.into(),
            provider: ProviderId::Mistral,
            max_context_tokens: 32_768,
            capabilities: caps.iter().copied().collect(),
            streaming: true,
            functions: true,
            vision: false,
            cost_per_1k_prompt: prompt,
            cost_per_1k_completion: completion,
            priority_score: score,
            available: true,
        }
    };

    vec![
        base("mistral-large-latest", "Mistral Large", &full, 0.004, 0.012, 8.5),
        base("mistral-medium-latest", "Mistral Medium", &full, 0.0027, 0.0081, 8.0),
        base("mistral-small-latest", "Mistral Small", &light, 0.001, 0.003, 7.0),
    ]
}

impl MistralDriver {
    pub fn new(credentials: &ProviderCredentials) -> Result<Self> {
        Ok(Self {
            endpoint: ChatEndpoint::new(ProviderId::Mistral, credentials, DEFAULT_BASE_URL)?,
            models: catalog(),
        })
    }
}

#[async_trait]
impl ProviderDriver for MistralDriver {
    fn provider_id(&self) -> ProviderId {
        ProviderId::Mistral
    }

    fn display_name(&self) -> &str {
        "Mistral AI"
    }

    async fn initialize(&self) -> Result<()> {
        for model in &self.models {
            model.validate()?;
        }
        tracing::info!(models = self.models.len(), "mistral driver initialized");
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
        self.endpoint
            .chat(&request.model_id, &transcript, &request.params, None)
            .await
    }

    async fn health_check(&self) -> Result<()> {
        let _: serde_json::Value = self.endpoint.get_json("/models").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog() {
        let driver = MistralDriver::new(&ProviderCredentials::new("key")).unwrap();
        let models = driver.list_models();
        assert_eq!(models.len(), 3);
        for model in &models {
            model.validate().unwrap();
            assert_eq!(model.provider, ProviderId::Mistral);
        }
        assert!(driver.supports_task("mistral-large-latest", TaskKind::Planning));
        assert!(!driver.supports_task("mistral-small-latest", TaskKind::Planning));
        assert!(!driver.supports_task("mistral-large-latest", TaskKind::Embedding));
    }
}
