//! HuggingFace driver. Inference API with task-specific request envelopes
//! for embeddings, classification, summarization, and generation.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::config::ProviderCredentials;
use crate::error::{Error, Result};

use super::driver::{
    build_http_client, classify_http_status, classify_transport_error, require_model,
    retry_after_ms, ProviderDriver,
};
use super::types::{
    DriverRequest, ModelDescriptor, ProviderId, ProviderResponse, RequestContent,
    ResponseContent, TaskKind,
};

const DEFAULT_BASE_URL: &str = "https://api-inference.huggingface.co";

pub struct HuggingFaceDriver {
    http: Client,
    base_url: String,
    api_key: String,
    models: Vec<ModelDescriptor>,
}

fn catalog() -> Vec<ModelDescriptor> {
    use TaskKind::*;
    let base = |id: &str, name: &str, context: u32, caps: &[TaskKind], score: f64| {
        ModelDescriptor {
            id: id.into(),
            name: name.into(),
            provider: ProviderId::HuggingFace,
            max_context_tokens: context,
            capabilities: caps.iter().copied().collect(),
            streaming: false,
            functions: false,
            vision: false,
            // Inference API free tier
            cost_per_1k_prompt: 0.0,
            cost_per_1k_completion: 0.0,
            priority_score: score,
            available: true,
        }
    };

    vec![
        base(
            "microsoft/DialoGPT-large",
            "DialoGPT Large",
            1024,
            &[TextGeneration, Chat],
            6.0,
        ),
        base(
            "google/flan-t5-large",
            "FLAN-T5 Large",
            512,
            &[TextGeneration, Summarization, Translation, Classification],
            7.0,
        ),
        base(
            "sentence-transformers/all-MiniLM-L6-v2",
            "All-MiniLM-L6-v2",
            256,
            &[Embedding],
            8.0,
        ),
        base(
            "sentence-transformers/all-mpnet-base-v2",
            "All-MPNet-Base-v2",
            384,
            &[Embedding],
            8.5,
        ),
        base(
            "cardiffnlp/twitter-roberta-base-sentiment-latest",
            "Twitter RoBERTa Sentiment",
            512,
            &[Classification],
            7.5,
        ),
        base(
            "facebook/bart-large-mnli",
            "BART Large MNLI",
            1024,
            &[Classification, TopicExtraction],
            8.0,
        ),
        base(
            "facebook/bart-large-cnn",
            "BART Large CNN",
            1024,
            &[Summarization],
            7.5,
        ),
        base(
            "google/pegasus-xsum",
            "Pegasus XSum",
            512,
            &[Summarization],
            7.0,
        ),
    ]
}

#[derive(Debug, Serialize)]
struct InferencePayload {
    inputs: Value,
    #[serde(skip_serializing_if = "Value::is_null")]
    parameters: Value,
}

/// Feature-extraction models return one vector per input, but the single
/// input case may come back as a flat array rather than a nested one.
fn parse_embedding_vectors(result: Value) -> Result<Vec<Vec<f32>>> {
    if let Ok(nested) = serde_json::from_value::<Vec<Vec<f32>>>(result.clone()) {
        return Ok(nested);
    }
    serde_json::from_value::<Vec<f32>>(result)
        .map(|flat| vec![flat])
        .map_err(|e| Error::internal(format!("unexpected embedding shape: {}", e)))
}

impl HuggingFaceDriver {
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

    async fn post_inference(&self, model_id: &str, payload: &InferencePayload) -> Result<Value> {
        let url = format!("{}/models/{}", self.base_url, model_id);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| classify_transport_error(ProviderId::HuggingFace, e))?;

        let status = response.status();
        let retry_after = retry_after_ms(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| classify_transport_error(ProviderId::HuggingFace, e))?;

        if !status.is_success() {
            return Err(classify_http_status(
                ProviderId::HuggingFace,
                status,
                &body,
                retry_after,
            ));
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::internal(format!("huggingface response parse failed: {}", e)))
    }

    async fn embed(&self, request: &DriverRequest) -> Result<ProviderResponse> {
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

        let payload = InferencePayload {
            inputs: Value::from(inputs),
            parameters: Value::Null,
        };
        let result = self.post_inference(&request.model_id, &payload).await?;

        let vectors = parse_embedding_vectors(result)?;
        if vectors.is_empty() {
            return Err(Error::internal("huggingface returned no embeddings"));
        }

        let content = if single {
            ResponseContent::Vector(vectors.into_iter().next().unwrap_or_default())
        } else {
            ResponseContent::Vectors(vectors)
        };

        Ok(ProviderResponse {
            content,
            model_id: request.model_id.clone(),
            tokens_used: None,
            finish_reason: Some("completed".into()),
            metadata: Default::default(),
        })
    }

    async fn classify(&self, request: &DriverRequest) -> Result<ProviderResponse> {
        let text = request.content.as_plain_text();
        // Zero-shot models take the caller's candidate labels; the rest
        // return their native label set.
        let parameters = if request.model_id.to_lowercase().contains("mnli") {
            let labels = request
                .candidate_labels
                .clone()
                .unwrap_or_else(|| vec!["positive".into(), "negative".into(), "neutral".into()]);
            serde_json::json!({ "candidate_labels": labels })
        } else {
            Value::Null
        };

        let payload = InferencePayload {
            inputs: Value::from(text),
            parameters,
        };
        let result = self.post_inference(&request.model_id, &payload).await?;

        Ok(ProviderResponse {
            content: ResponseContent::Json(result),
            model_id: request.model_id.clone(),
            tokens_used: None,
            finish_reason: Some("completed".into()),
            metadata: Default::default(),
        })
    }

    async fn summarize(&self, request: &DriverRequest) -> Result<ProviderResponse> {
        let parameters = match request.params.max_tokens {
            Some(max) => serde_json::json!({ "max_length": max }),
            None => Value::Null,
        };
        let payload = InferencePayload {
            inputs: Value::from(request.content.as_plain_text()),
            parameters,
        };
        let result = self.post_inference(&request.model_id, &payload).await?;

        let summary = result
            .get(0)
            .and_then(|entry| entry.get("summary_text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| result.to_string());

        Ok(ProviderResponse::text(request.model_id.clone(), summary)
            .with_finish_reason("completed"))
    }

    async fn generate(&self, request: &DriverRequest) -> Result<ProviderResponse> {
        let mut parameters = serde_json::json!({ "return_full_text": false });
        if let Some(temperature) = request.params.temperature {
            parameters["temperature"] = Value::from(temperature);
        }
        if let Some(max) = request.params.max_tokens {
            parameters["max_new_tokens"] = Value::from(max);
        }

        let payload = InferencePayload {
            inputs: Value::from(request.content.as_plain_text()),
            parameters,
        };
        let result = self.post_inference(&request.model_id, &payload).await?;

        let text = result
            .get(0)
            .and_then(|entry| entry.get("generated_text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| result.to_string());

        Ok(ProviderResponse::text(request.model_id.clone(), text)
            .with_finish_reason("completed"))
    }
}

#[async_trait]
impl ProviderDriver for HuggingFaceDriver {
    fn provider_id(&self) -> ProviderId {
        ProviderId::HuggingFace
    }

    fn display_name(&self) -> &str {
        "HuggingFace"
    }

    async fn initialize(&self) -> Result<()> {
        for model in &self.models {
            model.validate()?;
        }
        tracing::info!(models = self.models.len(), "huggingface driver initialized");
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
        match request.task {
            TaskKind::Embedding => self.embed(request).await,
            TaskKind::Classification => self.classify(request).await,
            TaskKind::Summarization => self.summarize(request).await,
            _ => self.generate(request).await,
        }
    }

    async fn health_check(&self) -> Result<()> {
        // Minimal one-token generation against the cheapest generation model.
        let request = DriverRequest::new(
            TaskKind::TextGeneration,
            "google/flan-t5-large",
            RequestContent::text("Hello"),
        )
        .with_params(
            crate::provider::types::GenerationParams::new()
                .with_max_tokens(1)
                .with_temperature(0.0),
        );
        self.generate(&request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> HuggingFaceDriver {
        HuggingFaceDriver::new(&ProviderCredentials::new("hf_test")).unwrap()
    }

    #[test]
    fn test_catalog() {
        let models = driver().list_models();
        assert_eq!(models.len(), 8);
        for model in &models {
            model.validate().unwrap();
            assert_eq!(model.unit_cost(), 0.0);
        }
    }

    #[test]
    fn test_task_dispatch_surface() {
        let driver = driver();
        assert!(driver.supports_task("facebook/bart-large-cnn", TaskKind::Summarization));
        assert!(!driver.supports_task("facebook/bart-large-cnn", TaskKind::Chat));
        assert!(driver.supports_task("facebook/bart-large-mnli", TaskKind::TopicExtraction));
        assert!(driver.supports_task(
            "sentence-transformers/all-mpnet-base-v2",
            TaskKind::Embedding
        ));
    }

    #[test]
    fn test_embedding_parse_handles_both_shapes() {
        let nested = serde_json::json!([[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]);
        let vectors = parse_embedding_vectors(nested).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 3);

        let flat = serde_json::json!([0.1, 0.2, 0.3]);
        let vectors = parse_embedding_vectors(flat).unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0], vec![0.1f32, 0.2, 0.3]);

        let bogus = serde_json::json!({"error": "loading"});
        assert!(parse_embedding_vectors(bogus).is_err());
    }

    #[test]
    fn test_inference_payload_omits_null_parameters() {
        let payload = InferencePayload {
            inputs: Value::from("text"),
            parameters: Value::Null,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("parameters"));

        let payload = InferencePayload {
            inputs: Value::from("text"),
            parameters: serde_json::json!({"max_length": 100}),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("max_length"));
    }
}
