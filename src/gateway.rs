//! Gateway facade: the single `process` entry point wiring cache, router,
//! gate, drivers, ledger, and sessions together.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::cache::{fingerprint, CachedResponse, HttpKv, ResponseCache};
use crate::config::GatewayConfig;
use crate::error::{Error, ErrorEnvelope, Result};
use crate::gate::{CostGate, UserTier};
use crate::ledger::{PerformanceLedger, PerformanceRecord, SqliteLedgerStore};
use crate::provider::types::{
    ChatMessage, GenerationParams, ModelDescriptor, Priority, ProviderId, RequestContent,
    ResponseContent, TaskKind,
};
use crate::registry::{ProviderRegistry, RegistryStats};
use crate::router::{RouteConstraints, RoutedRequest, RoutingStats, TaskRouter, DEFAULT_DEADLINE};
use crate::session::{SessionContext, SessionStore};

/// Canonical inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub task: TaskKind,
    pub content: RequestContent,
    /// Pin to one provider
    pub provider: Option<ProviderId>,
    /// Pin to one model
    pub model_id: Option<String>,
    pub params: GenerationParams,
    pub session_id: Option<String>,
    pub template_id: Option<String>,
    pub priority: Priority,
    pub use_cache: bool,
    pub user_id: String,
    pub user_tier: UserTier,
    /// Token budget for cost estimation; derived from the content when unset
    pub estimated_tokens: Option<u32>,
    pub use_user_keys: bool,
    /// Labels for zero-shot classification
    pub candidate_labels: Option<Vec<String>>,
    pub preferred_providers: Vec<ProviderId>,
    pub excluded_providers: HashSet<ProviderId>,
    pub min_context_tokens: Option<u32>,
    pub required_capabilities: Vec<TaskKind>,
    pub max_cost: Option<f64>,
    pub deadline_secs: Option<u64>,
    pub metadata: HashMap<String, Value>,
}

impl ProcessRequest {
    pub fn new(task: TaskKind, content: RequestContent, user_id: impl Into<String>) -> Self {
        Self {
            task,
            content,
            provider: None,
            model_id: None,
            params: GenerationParams::default(),
            session_id: None,
            template_id: None,
            priority: Priority::default(),
            use_cache: true,
            user_id: user_id.into(),
            user_tier: UserTier::default(),
            estimated_tokens: None,
            use_user_keys: false,
            candidate_labels: None,
            preferred_providers: Vec::new(),
            excluded_providers: HashSet::new(),
            min_context_tokens: None,
            required_capabilities: Vec::new(),
            max_cost: None,
            deadline_secs: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_tier(mut self, tier: UserTier) -> Self {
        self.user_tier = tier;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn pinned(mut self, provider: ProviderId, model_id: impl Into<String>) -> Self {
        self.provider = Some(provider);
        self.model_id = Some(model_id.into());
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u32) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    /// Token budget used for pre-flight estimation: the caller's figure, or
    /// a rough chars/4 reading of the content plus the completion budget.
    fn token_estimate(&self) -> u32 {
        if let Some(tokens) = self.estimated_tokens {
            return tokens;
        }
        let content_tokens = (self.content.as_plain_text().len() / 4) as u32;
        let completion_budget = self.params.max_tokens.unwrap_or(500);
        (content_tokens + completion_budget).max(1)
    }
}

/// Canonical outbound response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub request_id: String,
    pub task: TaskKind,
    pub provider: ProviderId,
    pub model_id: String,
    pub content: ResponseContent,
    pub tokens_used: Option<u32>,
    /// Wall-clock processing time in seconds
    pub processing_time: f64,
    pub cached: bool,
    pub session_id: Option<String>,
    pub metadata: HashMap<String, Value>,
}

/// How `process_with_models` treats branch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiModelMode {
    /// Return every branch outcome, failures included.
    CollectAll,
    /// Any success wins; error only when every branch failed.
    FirstSuccess,
}

/// Source of prompt templates. `process` passes content through untouched
/// unless a template id resolves to a definition here.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn fetch(&self, template_id: &str) -> Result<Option<String>>;
}

/// The model-routing gateway. Owns every subsystem and exposes the
/// canonical operations.
pub struct Gateway {
    registry: Arc<ProviderRegistry>,
    ledger: Arc<PerformanceLedger>,
    cache: Arc<ResponseCache>,
    gate: Arc<CostGate>,
    router: TaskRouter,
    sessions: SessionStore,
    templates: Option<Arc<dyn TemplateStore>>,
    default_provider: Option<ProviderId>,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Gateway {
    /// Compose the gateway from configuration. Subsystems come up in
    /// dependency order: registry, ledger, cache, gate, router.
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let registry = Arc::new(ProviderRegistry::from_config(config)?);
        Ok(Self::assemble(registry, config, None))
    }

    /// Compose around an existing registry (custom or test drivers).
    pub fn with_registry(registry: Arc<ProviderRegistry>, config: &GatewayConfig) -> Self {
        Self::assemble(registry, config, None)
    }

    /// Attach a sqlite-backed ledger store at the given path.
    pub fn new_with_ledger_store(
        config: &GatewayConfig,
        ledger_path: impl AsRef<std::path::Path>,
    ) -> Result<Self> {
        let registry = Arc::new(ProviderRegistry::from_config(config)?);
        let store = Arc::new(SqliteLedgerStore::open(ledger_path)?);
        Ok(Self::assemble(registry, config, Some(store)))
    }

    fn assemble(
        registry: Arc<ProviderRegistry>,
        config: &GatewayConfig,
        store: Option<Arc<SqliteLedgerStore>>,
    ) -> Self {
        let mut ledger = PerformanceLedger::new(config.max_performance_events);
        if let Some(store) = store {
            ledger = ledger.with_store(store);
        }
        let ledger = Arc::new(ledger);

        let mut cache = ResponseCache::new(config.cache_ttl_secs);
        if let Some(remote) = &config.remote_cache {
            match HttpKv::new(remote.url.clone(), remote.token.clone()) {
                Ok(kv) => cache = cache.with_remote(Arc::new(kv)),
                Err(e) => tracing::warn!(error = %e, "remote cache unavailable, local tier only"),
            }
        }
        let cache = Arc::new(cache);

        let gate = Arc::new(CostGate::new(
            config.emergency_cost_ceiling,
            config.emergency_hourly_request_ceiling,
        ));
        let router = TaskRouter::new(Arc::clone(&registry), Arc::clone(&ledger));

        Self {
            registry,
            ledger,
            cache,
            gate,
            router,
            sessions: SessionStore::new(),
            templates: None,
            default_provider: config.default_provider,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_template_store(mut self, templates: Arc<dyn TemplateStore>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Bring up drivers and background tasks.
    pub async fn initialize(&self) -> Result<()> {
        self.registry.initialize().await?;
        let handle = ResponseCache::start_sweeper(Arc::clone(&self.cache));
        *self.sweeper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Tear down in reverse order of initialization.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.registry.shutdown().await;
    }

    /// Single public processing entry point.
    pub async fn process(&self, request: ProcessRequest) -> Result<ProcessResponse> {
        let request_id = Uuid::new_v4().to_string();
        self.process_inner(request, request_id).await
    }

    /// [`Gateway::process`], with errors wrapped in the structured envelope.
    pub async fn process_enveloped(
        &self,
        request: ProcessRequest,
    ) -> std::result::Result<ProcessResponse, ErrorEnvelope> {
        let request_id = Uuid::new_v4().to_string();
        self.process_inner(request, request_id.clone())
            .await
            .map_err(|e| ErrorEnvelope::from_error(&e, request_id))
    }

    async fn process_inner(
        &self,
        mut request: ProcessRequest,
        request_id: String,
    ) -> Result<ProcessResponse> {
        let started = std::time::Instant::now();

        if request.content.is_empty() {
            return Err(Error::validation("content must not be empty"));
        }
        if request.user_id.is_empty() {
            return Err(Error::validation("user id must not be empty"));
        }

        // Serialize calls within a session: the lock is held until the
        // response (and the session update) is complete.
        let session_handle = request.session_id.as_ref().map(|id| self.sessions.handle(id));
        let mut session_guard = match &session_handle {
            Some(handle) => Some(handle.lock().await),
            None => None,
        };
        let session_messages: Vec<ChatMessage> = session_guard
            .as_ref()
            .map(|guard| guard.messages.clone())
            .unwrap_or_default();

        self.apply_template(&mut request).await?;

        let key = fingerprint(
            request.task,
            &request.content,
            request.provider,
            request.model_id.as_deref(),
            request.params.max_tokens,
            request.params.temperature,
            request.template_id.as_deref(),
        );

        if request.use_cache {
            if let Some(hit) = self.cache.get(&key).await {
                tracing::debug!(task = %request.task, "cache hit");
                let mut metadata = request.metadata.clone();
                metadata.insert("cache_key".into(), Value::from(key));
                return Ok(ProcessResponse {
                    request_id,
                    task: request.task,
                    provider: hit.provider,
                    model_id: hit.model_id,
                    content: hit.content,
                    tokens_used: hit.tokens_used,
                    processing_time: started.elapsed().as_secs_f64(),
                    cached: true,
                    session_id: request.session_id,
                    metadata,
                });
            }
        }

        let estimated_tokens = request.token_estimate();
        let mut constraints = RouteConstraints::new(request.user_tier, estimated_tokens);
        constraints.preferred_providers = if request.preferred_providers.is_empty() {
            self.default_provider.into_iter().collect()
        } else {
            request.preferred_providers.clone()
        };
        constraints.excluded_providers = request.excluded_providers.clone();
        constraints.min_context_tokens = request.min_context_tokens;
        constraints.required_capabilities = request.required_capabilities.clone();
        constraints.max_cost = request.max_cost;
        constraints.pinned_provider = request.provider;
        constraints.pinned_model = request.model_id.clone();

        // Pre-flight: the gate vets the selection before any driver runs.
        // A pinned selection that cannot route at all gets its one
        // unpinned pass here, mirroring the execution-time rule.
        let candidates = match self.router.route(request.task, request.priority, &constraints) {
            Ok(candidates) => candidates,
            Err(e)
                if constraints.is_pinned()
                    && e.fallback_disposition()
                        == crate::error::FallbackDisposition::UnpinAndRetry =>
            {
                constraints = constraints.without_pins();
                self.router.route(request.task, request.priority, &constraints)?
            }
            Err(e) => return Err(e),
        };
        let top = candidates
            .first()
            .ok_or_else(|| Error::ModelNotFound(format!("no candidates for {}", request.task)))?;
        let admission = self.gate.admit(
            &request.user_id,
            request.user_tier,
            &top.model,
            estimated_tokens,
            request.use_user_keys,
        )?;

        let routed = RoutedRequest {
            task: request.task,
            priority: request.priority,
            content: request.content.clone(),
            params: request.params.clone(),
            session_messages,
            candidate_labels: request.candidate_labels.clone(),
            deadline: request
                .deadline_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_DEADLINE),
        };

        let outcome = self
            .router
            .execute(&routed, &constraints, Some(&request.user_id))
            .await?;

        let tokens_used = outcome.response.tokens_used;
        self.gate.record_usage(
            &request.user_id,
            outcome.cost,
            tokens_used.unwrap_or(estimated_tokens) as u64,
        );

        if let Some(guard) = session_guard.as_mut() {
            if request.task.uses_chat_framing() {
                if let Some(reply) = outcome.response.content.as_text() {
                    guard.record_exchange(
                        ChatMessage::user(request.content.as_plain_text()),
                        ChatMessage::assistant(reply),
                    );
                }
            }
        }

        if request.use_cache {
            self.cache
                .put(
                    &key,
                    CachedResponse {
                        content: outcome.response.content.clone(),
                        model_id: outcome.model_id.clone(),
                        provider: outcome.provider,
                        tokens_used,
                        stored_at: Utc::now(),
                        ttl_secs: self.cache.ttl_secs(),
                    },
                )
                .await;
        }

        let mut metadata = request.metadata.clone();
        metadata.insert(
            "security_level".into(),
            serde_json::to_value(admission.security_level)?,
        );
        metadata.insert("estimated_cost".into(), Value::from(admission.estimated_cost));
        metadata.insert("attempts".into(), Value::from(outcome.attempts as u64));
        if let Some(input) = outcome.response.input_tokens() {
            metadata.insert("input_tokens".into(), Value::from(input));
        }
        if let Some(output) = outcome.response.output_tokens() {
            metadata.insert("output_tokens".into(), Value::from(output));
        }

        Ok(ProcessResponse {
            request_id,
            task: request.task,
            provider: outcome.provider,
            model_id: outcome.model_id,
            content: outcome.response.content,
            tokens_used,
            processing_time: started.elapsed().as_secs_f64(),
            cached: false,
            session_id: request.session_id,
            metadata,
        })
    }

    async fn apply_template(&self, request: &mut ProcessRequest) -> Result<()> {
        let Some(template_id) = &request.template_id else {
            return Ok(());
        };
        let Some(store) = &self.templates else {
            return Ok(());
        };
        if let Some(template) = store.fetch(template_id).await? {
            let rendered = template.replace("{content}", &request.content.as_plain_text());
            request.content = RequestContent::text(rendered);
        }
        Ok(())
    }

    /// Diagnostic fan-out: run the same request against several specific
    /// (provider, model) selections in parallel. Results preserve the input
    /// order; a branch failure never aborts its siblings.
    pub async fn process_with_models(
        &self,
        request: ProcessRequest,
        selections: &[(ProviderId, String)],
        mode: MultiModelMode,
    ) -> Result<Vec<Result<ProcessResponse>>> {
        if selections.is_empty() {
            return Err(Error::validation("no model selections given"));
        }

        let branches = selections.iter().map(|(provider, model_id)| {
            let branch_request = ProcessRequest {
                provider: Some(*provider),
                model_id: Some(model_id.clone()),
                // Branches bypass the cache so each model really runs.
                use_cache: false,
                session_id: None,
                ..request.clone()
            };
            self.process(branch_request)
        });

        let results: Vec<Result<ProcessResponse>> = join_all(branches).await;

        if mode == MultiModelMode::FirstSuccess && results.iter().all(|r| r.is_err()) {
            let attempts = results
                .iter()
                .zip(selections)
                .filter_map(|(result, (provider, model_id))| {
                    result.as_ref().err().map(|e| crate::error::AttemptFailure {
                        model_id: model_id.clone(),
                        provider: provider.to_string(),
                        kind: e.kind(),
                        message: e.redacted_message(),
                    })
                })
                .collect::<Vec<_>>();
            let last_message = attempts
                .last()
                .map(|a| a.message.clone())
                .unwrap_or_default();
            return Err(Error::AllCandidatesFailed {
                attempts,
                last_message,
            });
        }

        Ok(results)
    }

    /// Route raw media to a vision-capable model.
    pub async fn process_media(
        &self,
        data: Vec<u8>,
        mime_type: impl Into<String>,
        prompt: Option<String>,
        user_id: impl Into<String>,
        tier: UserTier,
    ) -> Result<ProcessResponse> {
        let mut request = ProcessRequest::new(
            TaskKind::MediaAnalysis,
            RequestContent::Media {
                data,
                mime_type: mime_type.into(),
                prompt,
            },
            user_id,
        )
        .with_tier(tier);
        request.required_capabilities.push(TaskKind::MediaAnalysis);
        self.process(request).await
    }

    /// The merged model catalog.
    pub fn list_models(&self) -> Vec<ModelDescriptor> {
        self.registry.models()
    }

    /// Running per-model statistics.
    pub fn performance_metrics(&self) -> Vec<PerformanceRecord> {
        self.ledger.snapshot_all()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.registry.registry_stats()
    }

    pub fn routing_stats(&self) -> RoutingStats {
        self.router.routing_stats()
    }

    /// Create a fresh session and return its id.
    pub fn create_session(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.handle(&session_id);
        session_id
    }

    /// Drop a session immediately.
    pub fn delete_session(&self, session_id: &str) -> bool {
        self.sessions.delete(session_id)
    }

    pub async fn session_context(&self, session_id: &str) -> Option<SessionContext> {
        self.sessions.context(session_id).await
    }

    /// Override the provider preference order for a task kind.
    pub fn set_task_model_preferences(&self, task: TaskKind, providers: Vec<ProviderId>) {
        self.router.set_task_preferences(task, providers);
    }

    /// Run provider health checks if they are due.
    pub async fn health_check(&self) {
        self.registry.health_check_if_needed().await;
    }

    #[cfg(test)]
    pub(crate) fn gate(&self) -> &CostGate {
        &self.gate
    }

    #[cfg(test)]
    pub(crate) fn ledger(&self) -> &PerformanceLedger {
        &self.ledger
    }
}
