//! Provider registry: driver lifecycle, the merged model catalog, and
//! health monitoring.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::provider::{
    AnthropicDriver, DeepSeekDriver, HuggingFaceDriver, MistralDriver, OpenAiDriver,
    OpenRouterDriver, ProviderDriver, QwenDriver,
};
use crate::provider::types::{
    ModelDescriptor, ProviderHealth, ProviderId, ProviderState, TaskKind,
};

/// Minimum spacing between two health checks of the same provider.
const MIN_HEALTH_CHECK_SPACING: Duration = Duration::from_secs(60);

struct ProviderHandle {
    driver: Arc<dyn ProviderDriver>,
    health: RwLock<ProviderHealth>,
    /// Serializes health checks per provider
    check_guard: Mutex<()>,
    /// Bounds concurrent outbound requests per provider
    semaphore: Arc<Semaphore>,
    priority: i32,
}

impl ProviderHandle {
    fn state(&self) -> ProviderState {
        self.health.read().unwrap_or_else(|e| e.into_inner()).state
    }

    fn set_state(&self, state: ProviderState) {
        self.health
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .state = state;
    }

    fn record_check(&self, result: &Result<()>) {
        let mut health = self.health.write().unwrap_or_else(|e| e.into_inner());
        health.last_check = Some(Utc::now());
        match result {
            Ok(()) => {
                health.state = ProviderState::Ready;
                health.last_error = None;
            }
            Err(e) => {
                if health.state == ProviderState::Ready {
                    health.state = ProviderState::Degraded;
                }
                health.last_error = Some(e.redacted_message());
            }
        }
    }
}

/// Per-provider slice of [`RegistryStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub name: String,
    pub state: ProviderState,
    pub models: usize,
    pub last_check: Option<chrono::DateTime<Utc>>,
}

/// Summary of the registry's current shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_providers: usize,
    pub healthy_providers: usize,
    pub total_models: usize,
    pub available_models: usize,
    pub providers: HashMap<ProviderId, ProviderStats>,
}

/// Owns the provider drivers and their model catalogs.
pub struct ProviderRegistry {
    handles: HashMap<ProviderId, ProviderHandle>,
    catalog: RwLock<HashMap<String, ModelDescriptor>>,
    health_check_interval: Duration,
}

impl ProviderRegistry {
    /// Construct drivers for every provider with usable credentials.
    /// Providers without credentials are skipped with a warning.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let mut handles = HashMap::new();

        for provider in config.configured_providers() {
            let Some(credentials) = config.providers.get(&provider) else {
                continue;
            };

            let driver: Arc<dyn ProviderDriver> = match provider {
                ProviderId::OpenAi => Arc::new(OpenAiDriver::new(credentials)?),
                ProviderId::Anthropic => Arc::new(AnthropicDriver::new(credentials)?),
                ProviderId::HuggingFace => Arc::new(HuggingFaceDriver::new(credentials)?),
                ProviderId::Mistral => Arc::new(MistralDriver::new(credentials)?),
                ProviderId::DeepSeek => Arc::new(DeepSeekDriver::new(credentials)?),
                ProviderId::Qwen => Arc::new(QwenDriver::new(credentials)?),
                ProviderId::OpenRouter => Arc::new(OpenRouterDriver::new(credentials)?),
            };

            handles.insert(
                provider,
                ProviderHandle {
                    driver,
                    health: RwLock::new(ProviderHealth::default()),
                    check_guard: Mutex::new(()),
                    semaphore: Arc::new(Semaphore::new(config.outbound_concurrency_per_provider)),
                    priority: credentials.priority,
                },
            );
        }

        for provider in ProviderId::ALL {
            if !handles.contains_key(&provider) {
                tracing::warn!(provider = %provider, "no credentials, provider skipped");
            }
        }

        Ok(Self {
            handles,
            catalog: RwLock::new(HashMap::new()),
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
        })
    }

    /// Build a registry from pre-constructed drivers. Useful for embedding
    /// applications that bring their own transport.
    pub fn from_drivers(
        drivers: Vec<Arc<dyn ProviderDriver>>,
        outbound_concurrency: usize,
        health_check_interval: Duration,
    ) -> Self {
        let handles = drivers
            .into_iter()
            .map(|driver| {
                let provider = driver.provider_id();
                (
                    provider,
                    ProviderHandle {
                        driver,
                        health: RwLock::new(ProviderHealth::default()),
                        check_guard: Mutex::new(()),
                        semaphore: Arc::new(Semaphore::new(outbound_concurrency.max(1))),
                        priority: 0,
                    },
                )
            })
            .collect();

        Self {
            handles,
            catalog: RwLock::new(HashMap::new()),
            health_check_interval,
        }
    }

    /// Initialize every driver and load its catalog. A provider whose
    /// initialization fails stays out of rotation but remains registered
    /// for later health checks.
    pub async fn initialize(&self) -> Result<()> {
        for (provider, handle) in &self.handles {
            handle.set_state(ProviderState::Initializing);
            match handle.driver.initialize().await {
                Ok(()) => {
                    handle.set_state(ProviderState::Ready);
                    let models = handle.driver.list_models();
                    let mut catalog = self.catalog.write().unwrap_or_else(|e| e.into_inner());
                    for model in models {
                        if let Err(e) = model.validate() {
                            tracing::warn!(model = %model.id, error = %e, "invalid model skipped");
                            continue;
                        }
                        catalog.insert(model.id.clone(), model);
                    }
                    tracing::info!(provider = %provider, "provider initialized");
                }
                Err(e) => {
                    let mut health = handle.health.write().unwrap_or_else(|e| e.into_inner());
                    health.state = ProviderState::Uninitialized;
                    health.last_error = Some(e.redacted_message());
                    tracing::error!(provider = %provider, error = %e, "provider initialization failed");
                }
            }
        }

        let catalog_len = self.catalog.read().unwrap_or_else(|e| e.into_inner()).len();
        tracing::info!(
            providers = self.handles.len(),
            models = catalog_len,
            "registry initialized"
        );
        Ok(())
    }

    /// Shut every driver down, reverse of initialization.
    pub async fn shutdown(&self) {
        for (provider, handle) in &self.handles {
            handle.set_state(ProviderState::ShuttingDown);
            if let Err(e) = handle.driver.shutdown().await {
                tracing::error!(provider = %provider, error = %e, "driver shutdown failed");
            }
            handle.set_state(ProviderState::Terminated);
        }
        self.catalog
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn driver(&self, provider: ProviderId) -> Option<Arc<dyn ProviderDriver>> {
        self.handles.get(&provider).map(|h| Arc::clone(&h.driver))
    }

    /// Reserve an outbound slot for the provider. Held for the duration of
    /// one driver call.
    pub async fn acquire_slot(&self, provider: ProviderId) -> Result<OwnedSemaphorePermit> {
        let handle = self
            .handles
            .get(&provider)
            .ok_or_else(|| Error::provider_unavailable(provider.to_string(), "not registered"))?;
        Arc::clone(&handle.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::provider_unavailable(provider.to_string(), "shutting down"))
    }

    pub fn provider_health(&self, provider: ProviderId) -> Option<ProviderHealth> {
        self.handles
            .get(&provider)
            .map(|h| h.health.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    /// Whether the provider is currently accepting work.
    pub fn provider_usable(&self, provider: ProviderId) -> bool {
        self.handles
            .get(&provider)
            .map(|h| h.state().accepts_work())
            .unwrap_or(false)
    }

    pub fn provider_priority(&self, provider: ProviderId) -> i32 {
        self.handles.get(&provider).map(|h| h.priority).unwrap_or(0)
    }

    pub fn model(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_id)
            .cloned()
    }

    /// The merged catalog across providers.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        let mut models: Vec<ModelDescriptor> = self
            .catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Models that can serve a task right now: capability declared, model
    /// available, owning provider accepting work.
    pub fn models_for_task(&self, task: TaskKind) -> Vec<ModelDescriptor> {
        self.models()
            .into_iter()
            .filter(|m| m.supports(task) && m.available && self.provider_usable(m.provider))
            .collect()
    }

    /// Run due health checks. A provider is checked when its last check is
    /// older than the configured interval, never more often than once a
    /// minute, and never concurrently with itself.
    pub async fn health_check_if_needed(&self) {
        for (provider, handle) in &self.handles {
            if !matches!(
                handle.state(),
                ProviderState::Ready | ProviderState::Degraded
            ) {
                continue;
            }

            let due = {
                let health = handle.health.read().unwrap_or_else(|e| e.into_inner());
                match health.last_check {
                    None => true,
                    Some(last) => {
                        let elapsed = (Utc::now() - last)
                            .to_std()
                            .unwrap_or(Duration::ZERO);
                        elapsed >= self.health_check_interval
                    }
                }
            };
            if !due {
                continue;
            }

            // Another task may already be checking this provider.
            let Ok(_guard) = handle.check_guard.try_lock() else {
                continue;
            };

            // Re-read under the guard: a check may have just finished.
            let recently_checked = {
                let health = handle.health.read().unwrap_or_else(|e| e.into_inner());
                health.last_check.is_some_and(|last| {
                    (Utc::now() - last).to_std().unwrap_or(Duration::ZERO)
                        < MIN_HEALTH_CHECK_SPACING
                })
            };
            if recently_checked {
                continue;
            }

            let result = handle.driver.health_check().await;
            if let Err(e) = &result {
                tracing::warn!(provider = %provider, error = %e, "health check failed");
            }
            handle.record_check(&result);
        }
    }

    pub fn registry_stats(&self) -> RegistryStats {
        let models = self.models();
        let available = models
            .iter()
            .filter(|m| m.available && self.provider_usable(m.provider))
            .count();

        let providers: HashMap<ProviderId, ProviderStats> = self
            .handles
            .iter()
            .map(|(provider, handle)| {
                let health = handle.health.read().unwrap_or_else(|e| e.into_inner());
                (
                    *provider,
                    ProviderStats {
                        name: handle.driver.display_name().to_string(),
                        state: health.state,
                        models: models.iter().filter(|m| m.provider == *provider).count(),
                        last_check: health.last_check,
                    },
                )
            })
            .collect();

        RegistryStats {
            total_providers: self.handles.len(),
            healthy_providers: self
                .handles
                .values()
                .filter(|h| h.state() == ProviderState::Ready)
                .count(),
            total_models: models.len(),
            available_models: available,
            providers,
        }
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, provider: ProviderId, state: ProviderState) {
        if let Some(handle) = self.handles.get(&provider) {
            handle.set_state(state);
        }
    }
}
