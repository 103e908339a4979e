//! DeepSeek driver. Chat-completions dialect; strong on reasoning-heavy
//! tasks at low cost.

use async_trait::async_trait;

use crate::config::ProviderCredentials;
use crate::error::Result;

use super::driver::{assemble_transcript, require_model, ProviderDriver};
use super::openai_compat::ChatEndpoint;
use super::types::{
    DriverRequest, ModelDescriptor, ProviderId, ProviderResponse, TaskKind,
};

const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";

pub struct DeepSeekDriver {
    endpoint: ChatEndpoint,
    models: Vec<ModelDescriptor>,
}

// Catalog reconstructed from public model listings; the upstream snapshot
// this port derives from wires the provider in without shipping its file.
fn catalog() -> Vec<ModelDescriptor> {
    use TaskKind::*;
    vec![
        ModelDescriptor {
            id: "deepseek-chat".into(),
            name: "DeepSeek Chat".into(),
            provider: ProviderId::DeepSeek,
            max_context_tokens: 64_000,
            capabilities: [
                TextGeneration,
                Summarization,
                TopicExtraction,
                Classification,
                Sensemaking,
                Planning,
                Translation,
                Chat,
            ]
            .into_iter()
            .collect(),
            streaming: true,
            functions: true,
            vision: false,
            cost_per_1k_prompt: 0.00027,
            cost_per_1k_completion: 0.0011,
            priority_score: 7.5,
            available: true,
        },
        ModelDescriptor {
            id: "deepseek-reasoner".into(),
            name: "DeepSeek Reasoner".into(),
            provider: ProviderId::DeepSeek,
            max_context_tokens: 64_000,
            capabilities: [TextGeneration, Sensemaking, Planning, Chat]
                .into_iter()
                .collect(),
            streaming: true,
            functions: false,
            vision: false,
            cost_per_1k_prompt: 0.00055,
            cost_per_1k_completion: 0.00219,
            priority_score: 8.0,
            available: true,
        },
    ]
}

impl DeepSeekDriver {
    pub fn new(credentials: &ProviderCredentials) -> Result<Self> {
        Ok(Self {
            endpoint: ChatEndpoint::new(ProviderId::DeepSeek, credentials, DEFAULT_BASE_URL)?,
            models: catalog(),
        })
    }
}

#[async_trait]
impl ProviderDriver for DeepSeekDriver {
    fn provider_id(&self) -> ProviderId {
        ProviderId::DeepSeek
    }

    fn display_name(&self) -> &str {
        "DeepSeek"
    }

    async fn initialize(&self) -> Result<()> {
        for model in &self.models {
            model.validate()?;
        }
        tracing::info!(models = self.models.len(), "deepseek driver initialized");
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
        let driver = DeepSeekDriver::new(&ProviderCredentials::new("key")).unwrap();
        let models = driver.list_models();
        assert_eq!(models.len(), 2);
        assert!(driver.supports_task("deepseek-reasoner", TaskKind::Sensemaking));
        assert!(!driver.supports_task("deepseek-reasoner", TaskKind::Summarization));
    }
}
