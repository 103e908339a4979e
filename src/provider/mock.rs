//! Scriptable in-memory driver used across the crate's tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

use super::driver::ProviderDriver;
use super::types::{DriverRequest, ModelDescriptor, ProviderId, ProviderResponse, TaskKind};

/// Outcome the mock produces for one call, popped FIFO. When the script is
/// exhausted every call succeeds with the default reply.
#[derive(Debug, Clone)]
pub(crate) enum MockOutcome {
    Reply(String),
    RateLimited,
    Deadline,
    Unavailable,
    AuthFailed,
    Internal,
}

pub(crate) struct MockDriver {
    provider: ProviderId,
    models: Vec<ModelDescriptor>,
    script: Mutex<VecDeque<MockOutcome>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
    healthy: Mutex<bool>,
}

impl MockDriver {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            models: Vec::new(),
            script: Mutex::new(VecDeque::new()),
            delay: None,
            calls: Mutex::new(Vec::new()),
            healthy: Mutex::new(true),
        }
    }

    pub fn with_model(mut self, model: ModelDescriptor) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_script(self, outcomes: Vec<MockOutcome>) -> Self {
        *self.script.lock().unwrap() = outcomes.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock().unwrap() = healthy;
    }

    /// Model ids this driver was asked to process, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Convenience descriptor for mock catalogs.
    pub fn model(
        provider: ProviderId,
        id: &str,
        tasks: &[TaskKind],
        unit_cost: f64,
        priority_score: f64,
    ) -> ModelDescriptor {
        ModelDescriptor {
            id: id.into(),
            name: id.into(),
            provider,
            max_context_tokens: 32_768,
            capabilities: tasks.iter().copied().collect(),
            streaming: false,
            functions: false,
            vision: false,
            cost_per_1k_prompt: unit_cost,
            cost_per_1k_completion: unit_cost,
            priority_score,
            available: true,
        }
    }
}

#[async_trait]
impl ProviderDriver for MockDriver {
    fn provider_id(&self) -> ProviderId {
        self.provider
    }

    fn display_name(&self) -> &str {
        "Mock"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn list_models(&self) -> Vec<ModelDescriptor> {
        self.models.clone()
    }

    async fn process(&self, request: &DriverRequest) -> Result<ProviderResponse> {
        self.calls.lock().unwrap().push(request.model_id.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self.script.lock().unwrap().pop_front();
        match outcome {
            None => Ok(
                ProviderResponse::text(request.model_id.clone(), "mock reply")
                    .with_tokens(10, 5)
                    .with_finish_reason("stop"),
            ),
            Some(MockOutcome::Reply(text)) => Ok(
                ProviderResponse::text(request.model_id.clone(), text)
                    .with_tokens(10, 5)
                    .with_finish_reason("stop"),
            ),
            Some(MockOutcome::RateLimited) => {
                Err(Error::rate_limited(self.provider.to_string(), Some(1000)))
            }
            Some(MockOutcome::Deadline) => Err(Error::DeadlineExceeded { elapsed_ms: 60_000 }),
            Some(MockOutcome::Unavailable) => Err(Error::provider_unavailable(
                self.provider.to_string(),
                "mock outage",
            )),
            Some(MockOutcome::AuthFailed) => {
                Err(Error::authentication(self.provider.to_string(), "mock 401"))
            }
            Some(MockOutcome::Internal) => Err(Error::internal("mock internal failure")),
        }
    }

    async fn health_check(&self) -> Result<()> {
        if *self.healthy.lock().unwrap() {
            Ok(())
        } else {
            Err(Error::provider_unavailable(
                self.provider.to_string(),
                "mock unhealthy",
            ))
        }
    }
}
