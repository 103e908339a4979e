//! Task router: candidate filtering, composite scoring, and fallback-chain
//! execution across providers.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::error::{AttemptFailure, Error, FallbackDisposition, Result};
use crate::gate::UserTier;
use crate::ledger::{PerformanceEvent, PerformanceLedger};
use crate::provider::types::{
    ChatMessage, DriverRequest, GenerationParams, ModelDescriptor, Priority, ProviderId,
    RequestContent, TaskKind,
};
use crate::provider::ProviderResponse;
use crate::registry::ProviderRegistry;

/// Default per-attempt deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);
/// Reference cost anchoring the cost component of the composite score.
const REFERENCE_COST: f64 = 1.00;

/// Caller constraints narrowing the candidate set.
#[derive(Debug, Clone, Default)]
pub struct RouteConstraints {
    /// Providers to try first, in order. Overrides the task's default chain.
    pub preferred_providers: Vec<ProviderId>,
    pub excluded_providers: HashSet<ProviderId>,
    pub min_context_tokens: Option<u32>,
    pub required_capabilities: Vec<TaskKind>,
    /// Cap on the estimated request cost, in currency units
    pub max_cost: Option<f64>,
    pub user_tier: UserTier,
    pub estimated_tokens: u32,
    pub pinned_provider: Option<ProviderId>,
    pub pinned_model: Option<String>,
}

impl RouteConstraints {
    pub fn new(user_tier: UserTier, estimated_tokens: u32) -> Self {
        Self {
            user_tier,
            estimated_tokens,
            ..Default::default()
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_provider.is_some() || self.pinned_model.is_some()
    }

    pub(crate) fn without_pins(&self) -> Self {
        let mut unpinned = self.clone();
        unpinned.pinned_provider = None;
        unpinned.pinned_model = None;
        unpinned
    }
}

/// One scored candidate, as returned by [`TaskRouter::route`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub model: ModelDescriptor,
    pub score: f64,
    pub estimated_cost: f64,
}

/// Work order for [`TaskRouter::execute`].
#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub task: TaskKind,
    pub priority: Priority,
    pub content: RequestContent,
    pub params: GenerationParams,
    pub session_messages: Vec<ChatMessage>,
    pub candidate_labels: Option<Vec<String>>,
    pub deadline: Duration,
}

impl RoutedRequest {
    pub fn new(task: TaskKind, content: RequestContent) -> Self {
        Self {
            task,
            priority: Priority::default(),
            content,
            params: GenerationParams::default(),
            session_messages: Vec::new(),
            candidate_labels: None,
            deadline: DEFAULT_DEADLINE,
        }
    }
}

/// Successful execution result with attribution.
#[derive(Debug, Clone)]
pub struct RoutedOutcome {
    pub response: ProviderResponse,
    pub provider: ProviderId,
    pub model_id: String,
    /// Attempts made, including the successful one
    pub attempts: usize,
    pub latency_secs: f64,
    /// Actual cost when token counts were reported, estimate otherwise
    pub cost: f64,
}

/// Per-provider share of routed traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingStats {
    pub total_requests: u64,
    pub provider_requests: HashMap<ProviderId, u64>,
}

fn default_chains() -> HashMap<TaskKind, Vec<ProviderId>> {
    use ProviderId::*;
    use TaskKind::*;
    HashMap::from([
        (TextGeneration, vec![OpenAi, Anthropic, Mistral, DeepSeek, Qwen, HuggingFace]),
        (Summarization, vec![Anthropic, OpenAi, Mistral, Qwen, HuggingFace]),
        (TopicExtraction, vec![Anthropic, OpenAi, HuggingFace, Mistral, Qwen]),
        (Classification, vec![HuggingFace, OpenAi, Anthropic, Mistral, Qwen]),
        (Embedding, vec![OpenAi, HuggingFace]),
        (Sensemaking, vec![Anthropic, OpenAi, DeepSeek, Mistral, Qwen]),
        (Planning, vec![Anthropic, OpenAi, DeepSeek, Mistral, Qwen]),
        (MediaAnalysis, vec![OpenAi, Anthropic]),
        (Translation, vec![Qwen, OpenAi, Anthropic, Mistral, HuggingFace]),
        (Chat, vec![OpenAi, Anthropic, Mistral, DeepSeek, Qwen, HuggingFace]),
    ])
}

/// Scores candidate models for a task and executes the fallback chain.
///
/// Holds a non-owning reference to the registry; metrics flow through the
/// shared ledger.
pub struct TaskRouter {
    registry: Arc<ProviderRegistry>,
    ledger: Arc<PerformanceLedger>,
    chains: RwLock<HashMap<TaskKind, Vec<ProviderId>>>,
    load_counters: Mutex<HashMap<ProviderId, u64>>,
}

impl TaskRouter {
    pub fn new(registry: Arc<ProviderRegistry>, ledger: Arc<PerformanceLedger>) -> Self {
        Self {
            registry,
            ledger,
            chains: RwLock::new(default_chains()),
            load_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Override the default provider preference order for a task kind.
    pub fn set_task_preferences(&self, task: TaskKind, providers: Vec<ProviderId>) {
        self.chains
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task, providers);
    }

    fn chain_for(&self, task: TaskKind) -> Vec<ProviderId> {
        self.chains
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task)
            .cloned()
            .unwrap_or_default()
    }

    fn load_of(&self, provider: ProviderId) -> u64 {
        *self
            .load_counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&provider)
            .unwrap_or(&0)
    }

    fn bump_load(&self, provider: ProviderId) {
        *self
            .load_counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(provider)
            .or_insert(0) += 1;
    }

    /// Return the ordered candidate list for a request, best first.
    ///
    /// Every returned candidate supports the task, is available on a
    /// healthy provider, passes the caller's numeric constraints, and sits
    /// within the tier's model cost ceiling. Scores are non-increasing.
    pub fn route(
        &self,
        task: TaskKind,
        priority: Priority,
        constraints: &RouteConstraints,
    ) -> Result<Vec<Candidate>> {
        let pool: Vec<ModelDescriptor> = match &constraints.pinned_model {
            Some(model_id) => {
                let model = self
                    .registry
                    .model(model_id)
                    .ok_or_else(|| Error::ModelNotFound(model_id.clone()))?;
                if !model.supports(task) {
                    return Err(Error::TaskNotSupported {
                        model_id: model_id.clone(),
                        task: task.to_string(),
                    });
                }
                if !model.available || !self.registry.provider_usable(model.provider) {
                    return Err(Error::provider_unavailable(
                        model.provider.to_string(),
                        "pinned model's provider is not accepting work",
                    ));
                }
                // A pinned model above the tier ceiling is a hard refusal.
                if model.unit_cost() > constraints.user_tier.model_cost_ceiling() {
                    return Err(Error::TierForbidden(format!(
                        "tier {:?} cannot access model {}",
                        constraints.user_tier, model_id
                    )));
                }
                vec![model]
            }
            None => self.registry.models_for_task(task),
        };

        let ceiling = constraints.user_tier.model_cost_ceiling();
        let filtered: Vec<ModelDescriptor> = pool
            .into_iter()
            .filter(|m| m.supports(task))
            .filter(|m| !constraints.excluded_providers.contains(&m.provider))
            .filter(|m| {
                constraints
                    .pinned_provider
                    .map_or(true, |p| m.provider == p)
            })
            .filter(|m| {
                constraints
                    .min_context_tokens
                    .map_or(true, |min| m.max_context_tokens >= min)
            })
            .filter(|m| {
                constraints
                    .required_capabilities
                    .iter()
                    .all(|cap| m.supports(*cap))
            })
            .filter(|m| {
                constraints
                    .max_cost
                    .map_or(true, |max| m.estimate_cost(constraints.estimated_tokens) <= max)
            })
            .filter(|m| m.unit_cost() <= ceiling)
            .collect();

        if filtered.is_empty() {
            if constraints.pinned_provider.is_some() {
                return Err(Error::provider_unavailable(
                    constraints
                        .pinned_provider
                        .map(|p| p.to_string())
                        .unwrap_or_default(),
                    "no eligible models on pinned provider",
                ));
            }
            return Err(Error::ModelNotFound(format!(
                "no suitable models for task {}",
                task
            )));
        }

        let preference = if constraints.preferred_providers.is_empty() {
            self.chain_for(task)
        } else {
            constraints.preferred_providers.clone()
        };
        let preference_index = |provider: ProviderId| {
            preference
                .iter()
                .position(|p| *p == provider)
                .unwrap_or(preference.len())
        };

        let mut scored: Vec<(usize, Candidate)> = filtered
            .into_iter()
            .enumerate()
            .map(|(index, model)| {
                let estimated_cost = model.estimate_cost(constraints.estimated_tokens);
                let score = self.score(&model, priority, estimated_cost);
                (
                    index,
                    Candidate {
                        model,
                        score,
                        estimated_cost,
                    },
                )
            })
            .collect();

        scored.sort_by(|(ia, a), (ib, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    preference_index(a.model.provider).cmp(&preference_index(b.model.provider))
                })
                .then_with(|| {
                    b.model
                        .priority_score
                        .partial_cmp(&a.model.priority_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| self.load_of(a.model.provider).cmp(&self.load_of(b.model.provider)))
                .then_with(|| ia.cmp(ib))
        });

        Ok(scored.into_iter().map(|(_, c)| c).collect())
    }

    /// Composite candidate score in [0, 100].
    fn score(&self, model: &ModelDescriptor, priority: Priority, estimated_cost: f64) -> f64 {
        let stats = self.ledger.snapshot(&model.id);
        let reliability = stats.as_ref().map(|s| s.success_rate()).unwrap_or(1.0);
        let avg_latency_ms = stats.as_ref().map(|s| s.avg_latency_ms()).unwrap_or(0.0);
        let error_rate = stats.as_ref().map(|s| s.error_rate).unwrap_or(0.0);

        let reliability_component = 40.0 * reliability;
        let latency_component = 30.0 * (1.0 - avg_latency_ms / 10_000.0).max(0.0);
        let cost_component = 30.0 * (1.0 - estimated_cost / REFERENCE_COST).max(0.0);

        let mut score = reliability_component + latency_component + cost_component;

        match priority {
            Priority::High if avg_latency_ms < 2_000.0 => score += 10.0,
            Priority::Low => score += cost_component * 0.5,
            _ => {}
        }

        if error_rate > 0.1 {
            score *= 1.0 - error_rate;
        }

        // Sluggish recent history degrades the composite by up to 20%.
        let avg_secs = avg_latency_ms / 1000.0;
        if avg_secs > 0.0 {
            let time_penalty = (avg_secs / 10.0).min(0.2);
            score *= 1.0 - time_penalty;
        }

        match priority {
            Priority::Critical if model.priority_score < 9.0 => score *= 0.7,
            Priority::High if model.priority_score < 8.0 => score *= 0.8,
            _ => {}
        }

        score.clamp(0.0, 100.0)
    }

    /// Execute the fallback chain for a request: try candidates in order,
    /// record every attempt in the ledger, and return the first success.
    ///
    /// When the request pinned a provider or model and the pinned pass
    /// fails, exactly one more routing pass runs with pinning removed.
    pub async fn execute(
        &self,
        request: &RoutedRequest,
        constraints: &RouteConstraints,
        user_id: Option<&str>,
    ) -> Result<RoutedOutcome> {
        match self.execute_pass(request, constraints, user_id).await {
            Ok(outcome) => Ok(outcome),
            Err(error) if constraints.is_pinned() => {
                if error.fallback_disposition() == FallbackDisposition::Surface {
                    return Err(error);
                }
                tracing::info!(
                    error = %error,
                    "pinned selection failed, retrying once without pinning"
                );
                self.execute_pass(request, &constraints.without_pins(), user_id)
                    .await
            }
            Err(error) => Err(error),
        }
    }

    async fn execute_pass(
        &self,
        request: &RoutedRequest,
        constraints: &RouteConstraints,
        user_id: Option<&str>,
    ) -> Result<RoutedOutcome> {
        let candidates = self.route(request.task, request.priority, constraints)?;
        let mut attempts: Vec<AttemptFailure> = Vec::new();

        for candidate in &candidates {
            let model = &candidate.model;
            let Some(driver) = self.registry.driver(model.provider) else {
                continue;
            };

            let driver_request = DriverRequest::new(
                request.task,
                model.id.clone(),
                request.content.clone(),
            )
            .with_params(request.params.clone());
            let mut driver_request =
                driver_request.with_session_messages(request.session_messages.clone());
            if let Some(labels) = &request.candidate_labels {
                driver_request = driver_request.with_candidate_labels(labels.clone());
            }

            let _permit = self.registry.acquire_slot(model.provider).await?;
            let start = Instant::now();
            let attempt = tokio::time::timeout(request.deadline, driver.process(&driver_request))
                .await;
            let latency = start.elapsed().as_secs_f64();
            drop(_permit);

            let error = match attempt {
                Ok(Ok(response)) => {
                    let cost = actual_cost(model, &response, candidate.estimated_cost);
                    let mut event = PerformanceEvent::success(
                        model.id.clone(),
                        model.provider,
                        request.task,
                        latency,
                    )
                    .with_tokens(
                        response.input_tokens().unwrap_or(0) as u32,
                        response.output_tokens().unwrap_or(0) as u32,
                    )
                    .with_cost(cost);
                    if let Some(user) = user_id {
                        event = event.with_user(user);
                    }
                    self.ledger.record(event);
                    self.bump_load(model.provider);

                    tracing::info!(
                        task = %request.task,
                        model = %model.id,
                        attempts = attempts.len() + 1,
                        "task completed"
                    );
                    return Ok(RoutedOutcome {
                        response,
                        provider: model.provider,
                        model_id: model.id.clone(),
                        attempts: attempts.len() + 1,
                        latency_secs: latency,
                        cost,
                    });
                }
                Ok(Err(error)) => error,
                Err(_) => Error::DeadlineExceeded {
                    elapsed_ms: request.deadline.as_millis() as u64,
                },
            };

            let mut event = PerformanceEvent::failure(
                model.id.clone(),
                model.provider,
                request.task,
                latency,
                error.kind(),
            );
            if let Some(user) = user_id {
                event = event.with_user(user);
            }
            self.ledger.record(event);
            tracing::warn!(model = %model.id, error = %error, "attempt failed");

            match error.fallback_disposition() {
                FallbackDisposition::Surface => return Err(error),
                FallbackDisposition::NextCandidate => {
                    attempts.push(AttemptFailure {
                        model_id: model.id.clone(),
                        provider: model.provider.to_string(),
                        kind: error.kind(),
                        message: error.redacted_message(),
                    });
                }
                FallbackDisposition::UnpinAndRetry => {
                    // Systemic failure for this selection; the pinned retry
                    // (if any) happens one level up.
                    attempts.push(AttemptFailure {
                        model_id: model.id.clone(),
                        provider: model.provider.to_string(),
                        kind: error.kind(),
                        message: error.redacted_message(),
                    });
                    if !constraints.is_pinned() {
                        return Err(error);
                    }
                }
            }
        }

        let last_message = attempts
            .last()
            .map(|a| a.message.clone())
            .unwrap_or_else(|| "no candidates attempted".to_string());
        Err(Error::AllCandidatesFailed {
            attempts,
            last_message,
        })
    }

    pub fn routing_stats(&self) -> RoutingStats {
        let counters = self
            .load_counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        RoutingStats {
            total_requests: counters.values().sum(),
            provider_requests: counters,
        }
    }
}

/// Cost of a completed call from reported token counts, falling back to the
/// pre-flight estimate when the vendor reports none.
fn actual_cost(model: &ModelDescriptor, response: &ProviderResponse, estimate: f64) -> f64 {
    match (response.input_tokens(), response.output_tokens()) {
        (Some(input), Some(output)) => {
            (input as f64 / 1000.0) * model.cost_per_1k_prompt
                + (output as f64 / 1000.0) * model.cost_per_1k_completion
        }
        _ => estimate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::mock::{MockDriver, MockOutcome};
    use crate::provider::ProviderDriver;

    fn registry_with(drivers: Vec<Arc<dyn ProviderDriver>>) -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::from_drivers(
            drivers,
            8,
            Duration::from_secs(300),
        ))
    }

    async fn simple_router() -> (TaskRouter, Arc<PerformanceLedger>) {
        let openai = MockDriver::new(ProviderId::OpenAi)
            .with_model(MockDriver::model(
                ProviderId::OpenAi,
                "gpt-4o",
                &[TaskKind::Chat, TaskKind::Summarization],
                0.005,
                9.5,
            ))
            .with_model(MockDriver::model(
                ProviderId::OpenAi,
                "gpt-3.5-turbo",
                &[TaskKind::Chat, TaskKind::Summarization],
                0.0005,
                7.5,
            ));
        let huggingface = MockDriver::new(ProviderId::HuggingFace).with_model(MockDriver::model(
            ProviderId::HuggingFace,
            "facebook/bart-large-cnn",
            &[TaskKind::Summarization],
            0.0,
            7.5,
        ));

        let registry = registry_with(vec![Arc::new(openai), Arc::new(huggingface)]);
        registry.initialize().await.unwrap();
        let ledger = Arc::new(PerformanceLedger::new(1000));
        (TaskRouter::new(registry, ledger.clone()), ledger)
    }

    #[tokio::test]
    async fn test_candidates_all_support_task() {
        let (router, _) = simple_router().await;
        let constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        let candidates = router
            .route(TaskKind::Summarization, Priority::Medium, &constraints)
            .unwrap();
        assert_eq!(candidates.len(), 3);
        for candidate in &candidates {
            assert!(candidate.model.supports(TaskKind::Summarization));
        }

        // Chat excludes the summarization-only HF model.
        let candidates = router
            .route(TaskKind::Chat, Priority::Medium, &constraints)
            .unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_scores_non_increasing() {
        let (router, ledger) = simple_router().await;
        // Uneven histories so scores differ.
        ledger.record(PerformanceEvent::success(
            "gpt-4o",
            ProviderId::OpenAi,
            TaskKind::Summarization,
            4.0,
        ));
        for _ in 0..5 {
            ledger.record(PerformanceEvent::failure(
                "gpt-3.5-turbo",
                ProviderId::OpenAi,
                TaskKind::Summarization,
                1.0,
                ErrorKind::Internal,
            ));
        }

        let constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        let candidates = router
            .route(TaskKind::Summarization, Priority::Medium, &constraints)
            .unwrap();
        for pair in candidates.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_tier_ceiling_filters_models() {
        let (router, _) = simple_router().await;
        // Free ceiling is 0.001/1k: gpt-4o (0.005) and gpt-3.5 (0.0005).
        let constraints = RouteConstraints::new(UserTier::Free, 400);
        let candidates = router
            .route(TaskKind::Summarization, Priority::Medium, &constraints)
            .unwrap();
        assert!(candidates.iter().all(|c| c.model.unit_cost() <= 0.001));
        assert!(candidates.iter().any(|c| c.model.id == "gpt-3.5-turbo"));
        assert!(candidates.iter().all(|c| c.model.id != "gpt-4o"));
    }

    #[tokio::test]
    async fn test_pinned_model_above_tier_is_forbidden() {
        let (router, _) = simple_router().await;
        let mut constraints = RouteConstraints::new(UserTier::Free, 400);
        constraints.pinned_model = Some("gpt-4o".into());
        let err = router
            .route(TaskKind::Chat, Priority::Medium, &constraints)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TierForbidden);
    }

    #[tokio::test]
    async fn test_context_length_boundary() {
        let (router, _) = simple_router().await;
        let mut constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        // Mock models advertise exactly 32_768 context tokens.
        constraints.min_context_tokens = Some(32_768);
        assert!(!router
            .route(TaskKind::Chat, Priority::Medium, &constraints)
            .unwrap()
            .is_empty());

        constraints.min_context_tokens = Some(32_769);
        assert!(router
            .route(TaskKind::Chat, Priority::Medium, &constraints)
            .is_err());
    }

    #[tokio::test]
    async fn test_excluded_provider_filtered() {
        let (router, _) = simple_router().await;
        let mut constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        constraints.excluded_providers.insert(ProviderId::OpenAi);
        let candidates = router
            .route(TaskKind::Summarization, Priority::Medium, &constraints)
            .unwrap();
        assert!(candidates
            .iter()
            .all(|c| c.model.provider == ProviderId::HuggingFace));
    }

    #[tokio::test]
    async fn test_error_rate_degrades_score() {
        let (router, ledger) = simple_router().await;
        let constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);

        let before = router
            .route(TaskKind::Chat, Priority::Medium, &constraints)
            .unwrap();
        let baseline = before
            .iter()
            .find(|c| c.model.id == "gpt-4o")
            .unwrap()
            .score;

        for _ in 0..4 {
            ledger.record(PerformanceEvent::failure(
                "gpt-4o",
                ProviderId::OpenAi,
                TaskKind::Chat,
                1.0,
                ErrorKind::RateLimited,
            ));
        }
        ledger.record(PerformanceEvent::success(
            "gpt-4o",
            ProviderId::OpenAi,
            TaskKind::Chat,
            1.0,
        ));

        let after = router
            .route(TaskKind::Chat, Priority::Medium, &constraints)
            .unwrap();
        let degraded = after
            .iter()
            .find(|c| c.model.id == "gpt-4o")
            .unwrap()
            .score;
        assert!(degraded < baseline);
    }

    #[tokio::test]
    async fn test_fallback_cascade_records_both_attempts() {
        let anthropic = MockDriver::new(ProviderId::Anthropic)
            .with_model(MockDriver::model(
                ProviderId::Anthropic,
                "claude-3-opus-20240229",
                &[TaskKind::Summarization],
                0.015,
                9.5,
            ))
            .with_script(vec![MockOutcome::RateLimited]);
        let openai = MockDriver::new(ProviderId::OpenAi).with_model(MockDriver::model(
            ProviderId::OpenAi,
            "gpt-4o",
            &[TaskKind::Summarization],
            0.005,
            9.0,
        ));

        let registry = registry_with(vec![Arc::new(anthropic), Arc::new(openai)]);
        registry.initialize().await.unwrap();
        let ledger = Arc::new(PerformanceLedger::new(1000));
        let router = TaskRouter::new(registry, ledger.clone());

        let mut constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        constraints.pinned_provider = Some(ProviderId::Anthropic);
        constraints.pinned_model = Some("claude-3-opus-20240229".into());

        let request = RoutedRequest::new(
            TaskKind::Summarization,
            RequestContent::text("summarize me"),
        );
        let outcome = router.execute(&request, &constraints, None).await.unwrap();

        assert_eq!(outcome.provider, ProviderId::OpenAi);
        assert_eq!(outcome.model_id, "gpt-4o");

        let events = ledger.recent_events();
        assert_eq!(events.len(), 2);
        assert!(!events[0].success);
        assert_eq!(events[0].error, Some(ErrorKind::RateLimited));
        assert_eq!(events[0].model_id, "claude-3-opus-20240229");
        assert!(events[1].success);
        assert_eq!(events[1].model_id, "gpt-4o");
    }

    #[tokio::test]
    async fn test_unpinned_fallback_walks_chain() {
        let openai = MockDriver::new(ProviderId::OpenAi)
            .with_model(MockDriver::model(
                ProviderId::OpenAi,
                "gpt-4o",
                &[TaskKind::Chat],
                0.005,
                9.5,
            ))
            .with_script(vec![MockOutcome::Internal]);
        // Costlier than gpt-4o so it ranks second and only serves fallback.
        let mistral = MockDriver::new(ProviderId::Mistral).with_model(MockDriver::model(
            ProviderId::Mistral,
            "mistral-large-latest",
            &[TaskKind::Chat],
            0.006,
            8.5,
        ));

        let registry = registry_with(vec![Arc::new(openai), Arc::new(mistral)]);
        registry.initialize().await.unwrap();
        let ledger = Arc::new(PerformanceLedger::new(1000));
        let router = TaskRouter::new(registry, ledger);

        let constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        let request = RoutedRequest::new(TaskKind::Chat, RequestContent::text("hello"));
        let outcome = router.execute(&request, &constraints, None).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.provider, ProviderId::Mistral);
    }

    #[tokio::test]
    async fn test_all_candidates_failing_yields_composite() {
        let openai = MockDriver::new(ProviderId::OpenAi)
            .with_model(MockDriver::model(
                ProviderId::OpenAi,
                "gpt-4o",
                &[TaskKind::Chat],
                0.005,
                9.5,
            ))
            .with_script(vec![MockOutcome::RateLimited]);
        let mistral = MockDriver::new(ProviderId::Mistral)
            .with_model(MockDriver::model(
                ProviderId::Mistral,
                "mistral-large-latest",
                &[TaskKind::Chat],
                0.006,
                8.5,
            ))
            .with_script(vec![MockOutcome::Deadline]);

        let registry = registry_with(vec![Arc::new(openai), Arc::new(mistral)]);
        registry.initialize().await.unwrap();
        let router = TaskRouter::new(registry, Arc::new(PerformanceLedger::new(1000)));

        let constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        let request = RoutedRequest::new(TaskKind::Chat, RequestContent::text("hello"));
        let err = router.execute(&request, &constraints, None).await.unwrap_err();

        match err {
            Error::AllCandidatesFailed { attempts, .. } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].kind, ErrorKind::RateLimited);
                assert_eq!(attempts[1].kind, ErrorKind::DeadlineExceeded);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_moves_to_next_candidate() {
        let slow = MockDriver::new(ProviderId::OpenAi)
            .with_model(MockDriver::model(
                ProviderId::OpenAi,
                "gpt-4o",
                &[TaskKind::Chat],
                0.005,
                9.5,
            ))
            .with_delay(Duration::from_secs(65));
        let fast = MockDriver::new(ProviderId::Mistral).with_model(MockDriver::model(
            ProviderId::Mistral,
            "mistral-large-latest",
            &[TaskKind::Chat],
            0.006,
            8.5,
        ));

        let registry = registry_with(vec![Arc::new(slow), Arc::new(fast)]);
        registry.initialize().await.unwrap();
        let ledger = Arc::new(PerformanceLedger::new(1000));
        let router = TaskRouter::new(registry, ledger.clone());

        let constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        let request = RoutedRequest::new(TaskKind::Chat, RequestContent::text("hello"));
        let outcome = router.execute(&request, &constraints, None).await.unwrap();

        assert_eq!(outcome.provider, ProviderId::Mistral);
        let events = ledger.recent_events();
        assert_eq!(events[0].error, Some(ErrorKind::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_pinned_auth_failure_retries_unpinned() {
        let anthropic = MockDriver::new(ProviderId::Anthropic)
            .with_model(MockDriver::model(
                ProviderId::Anthropic,
                "claude-3-opus-20240229",
                &[TaskKind::Chat],
                0.015,
                9.5,
            ))
            .with_script(vec![MockOutcome::AuthFailed]);
        let openai = MockDriver::new(ProviderId::OpenAi).with_model(MockDriver::model(
            ProviderId::OpenAi,
            "gpt-4o",
            &[TaskKind::Chat],
            0.005,
            9.0,
        ));

        let registry = registry_with(vec![Arc::new(anthropic), Arc::new(openai)]);
        registry.initialize().await.unwrap();
        let router = TaskRouter::new(registry, Arc::new(PerformanceLedger::new(1000)));

        let mut constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        constraints.pinned_model = Some("claude-3-opus-20240229".into());

        let request = RoutedRequest::new(TaskKind::Chat, RequestContent::text("hello"));
        let outcome = router.execute(&request, &constraints, None).await.unwrap();
        assert_eq!(outcome.provider, ProviderId::OpenAi);

        // Without pinning the same failure is surfaced, not retried.
        let anthropic_only = MockDriver::new(ProviderId::Anthropic)
            .with_model(MockDriver::model(
                ProviderId::Anthropic,
                "claude-3-opus-20240229",
                &[TaskKind::Chat],
                0.015,
                9.5,
            ))
            .with_script(vec![MockOutcome::AuthFailed]);
        let registry = registry_with(vec![Arc::new(anthropic_only)]);
        registry.initialize().await.unwrap();
        let router = TaskRouter::new(registry, Arc::new(PerformanceLedger::new(1000)));

        let constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        let err = router.execute(&request, &constraints, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_load_balancing_counts_successes() {
        let (router, _) = simple_router().await;
        let constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        let request = RoutedRequest::new(TaskKind::Chat, RequestContent::text("hello"));
        router.execute(&request, &constraints, None).await.unwrap();
        router.execute(&request, &constraints, None).await.unwrap();

        let stats = router.routing_stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.provider_requests.get(&ProviderId::OpenAi), Some(&2));
    }

    #[tokio::test]
    async fn test_task_preference_override() {
        let (router, _) = simple_router().await;
        router.set_task_preferences(
            TaskKind::Summarization,
            vec![ProviderId::HuggingFace, ProviderId::OpenAi],
        );
        let chain = router.chain_for(TaskKind::Summarization);
        assert_eq!(chain[0], ProviderId::HuggingFace);
    }

    #[tokio::test]
    async fn test_unknown_pinned_model_is_model_not_found() {
        let (router, _) = simple_router().await;
        let mut constraints = RouteConstraints::new(UserTier::Meowtrix, 1000);
        constraints.pinned_model = Some("no-such-model".into());
        let err = router
            .route(TaskKind::Chat, Priority::Medium, &constraints)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelNotFound);
    }
}
