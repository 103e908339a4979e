//! OpenRouter driver. Chat-completions dialect with the referer/title
//! header pair OpenRouter requires, and a model catalog fetched from the
//! service at startup.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::RwLock;

use crate::config::ProviderCredentials;
use crate::error::Result;

use super::driver::{assemble_transcript, require_model, ProviderDriver};
use super::openai_compat::ChatEndpoint;
use super::types::{
    DriverRequest, ModelDescriptor, ProviderId, ProviderResponse, TaskKind,
};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_APP_URL: &str = "https://github.com/chatchonk/autoswap";
const DEFAULT_APP_NAME: &str = "autoswap";

pub struct OpenRouterDriver {
    endpoint: ChatEndpoint,
    models: RwLock<Vec<ModelDescriptor>>,
}

#[derive(Debug, Deserialize)]
struct ModelListing {
    data: Vec<ListedModel>,
}

#[derive(Debug, Deserialize)]
struct ListedModel {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    context_length: Option<u32>,
    #[serde(default)]
    pricing: Option<ListedPricing>,
}

#[derive(Debug, Deserialize)]
struct ListedPricing {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    completion: Option<String>,
}

/// Infer task support from the model id. OpenRouter lists hundreds of
/// models with no capability metadata, so this mirrors how the catalog is
/// curated by hand: generation everywhere, extras keyed off the name.
fn infer_capabilities(model_id: &str) -> std::collections::BTreeSet<TaskKind> {
    use TaskKind::*;
    let id = model_id.to_lowercase();
    let mut caps: std::collections::BTreeSet<TaskKind> =
        [TextGeneration, Chat, Summarization, Translation].into_iter().collect();

    if id.contains("gpt-4") || id.contains("claude") || id.contains("llama-3") {
        caps.extend([TopicExtraction, Classification, Sensemaking, Planning]);
    }
    if id.contains("vision") || id.contains("gpt-4o") || id.contains("claude-3") {
        caps.insert(MediaAnalysis);
    }
    caps
}

fn infer_priority(model_id: &str) -> f64 {
    let id = model_id.to_lowercase();
    if id.contains("gpt-4o") || id.contains("claude-3.5") {
        8.5
    } else if id.contains("gpt-4") || id.contains("claude-3") {
        8.0
    } else if id.contains("llama-3") {
        7.0
    } else {
        5.0
    }
}

/// Per-token price strings from the listing become per-1k costs.
fn parse_price(price: Option<&str>) -> f64 {
    price
        .and_then(|p| p.parse::<f64>().ok())
        .map(|per_token| per_token * 1000.0)
        .unwrap_or(0.0)
        .max(0.0)
}

fn descriptor_from_listing(listed: ListedModel) -> ModelDescriptor {
    let capabilities = infer_capabilities(&listed.id);
    let vision = capabilities.contains(&TaskKind::MediaAnalysis);
    let pricing = listed.pricing.as_ref();
    ModelDescriptor {
        name: listed.name.unwrap_or_else(|| listed.id.clone()),
        priority_score: infer_priority(&listed.id),
        max_context_tokens: listed.context_length.unwrap_or(4096).max(1),
        capabilities,
        streaming: true,
        functions: false,
        vision,
        cost_per_1k_prompt: parse_price(pricing.and_then(|p| p.prompt.as_deref())),
        cost_per_1k_completion: parse_price(pricing.and_then(|p| p.completion.as_deref())),
        available: true,
        provider: ProviderId::OpenRouter,
        id: listed.id,
    }
}

/// Known-good subset used when the listing endpoint is unreachable.
fn fallback_catalog() -> Vec<ModelDescriptor> {
    ["openai/gpt-4o", "anthropic/claude-3.5-sonnet", "meta-llama/llama-3.1-70b-instruct"]
        .into_iter()
        .map(|id| {
            descriptor_from_listing(ListedModel {
                id: id.to_string(),
                name: None,
                context_length: Some(128_000),
                pricing: None,
            })
        })
        .collect()
}

impl OpenRouterDriver {
    pub fn new(credentials: &ProviderCredentials) -> Result<Self> {
        let endpoint = ChatEndpoint::new(ProviderId::OpenRouter, credentials, DEFAULT_BASE_URL)?
            .with_header("HTTP-Referer", DEFAULT_APP_URL)
            .with_header("X-Title", DEFAULT_APP_NAME);
        Ok(Self {
            endpoint,
            models: RwLock::new(Vec::new()),
        })
    }

    fn snapshot_models(&self) -> Vec<ModelDescriptor> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProviderDriver for OpenRouterDriver {
    fn provider_id(&self) -> ProviderId {
        ProviderId::OpenRouter
    }

    fn display_name(&self) -> &str {
        "OpenRouter"
    }

    async fn initialize(&self) -> Result<()> {
        let loaded = match self.endpoint.get_json::<ModelListing>("/models").await {
            Ok(listing) => listing
                .data
                .into_iter()
                .filter(|m| !m.id.is_empty())
                .map(descriptor_from_listing)
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "openrouter model listing failed, using fallback catalog");
                fallback_catalog()
            }
        };

        let count = loaded.len();
        *self.models.write().unwrap_or_else(|e| e.into_inner()) = loaded;
        tracing::info!(models = count, "openrouter driver initialized");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.models.write().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    fn list_models(&self) -> Vec<ModelDescriptor> {
        self.snapshot_models()
    }

    async fn process(&self, request: &DriverRequest) -> Result<ProviderResponse> {
        let models = self.snapshot_models();
        require_model(&models, &request.model_id, request.task)?;
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
