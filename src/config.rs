//! Gateway configuration: provider credentials and tunables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::provider::types::ProviderId;

/// Default response-cache TTL in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
/// Default interval between provider health checks.
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
/// Hard refusal threshold for a single request's estimated cost.
pub const DEFAULT_EMERGENCY_COST_CEILING: f64 = 50.0;
/// Hard refusal threshold for global hourly request volume.
pub const DEFAULT_EMERGENCY_HOURLY_REQUESTS: u64 = 10_000;
/// Bound on the in-memory performance event list.
pub const DEFAULT_MAX_PERFORMANCE_EVENTS: usize = 1000;
/// Bound on concurrent outbound requests per provider.
pub const DEFAULT_OUTBOUND_CONCURRENCY: usize = 32;

/// Credentials and transport settings for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub api_key: String,
    /// Base URL override; each driver has its vendor default
    pub base_url: Option<String>,
    pub organization_id: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Priority weight applied at registry level
    pub priority: i32,
    pub enabled: bool,
    /// Regions this provider may be used from; empty means unrestricted
    pub regions: Vec<String>,
}

impl ProviderCredentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            organization_id: None,
            timeout_secs: crate::provider::driver::DEFAULT_TIMEOUT_SECS,
            priority: 0,
            enabled: true,
            regions: Vec::new(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization_id = Some(org.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Credentials for the remote KV tier of the response cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCacheConfig {
    /// REST endpoint of the KV service
    pub url: String,
    pub token: String,
}

/// Full configuration surface for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-provider credentials; providers without an entry are skipped
    pub providers: HashMap<ProviderId, ProviderCredentials>,
    pub default_provider: Option<ProviderId>,
    pub cache_ttl_secs: u64,
    pub remote_cache: Option<RemoteCacheConfig>,
    pub health_check_interval_secs: u64,
    pub emergency_cost_ceiling: f64,
    pub emergency_hourly_request_ceiling: u64,
    pub max_performance_events: usize,
    pub outbound_concurrency_per_provider: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            remote_cache: None,
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            emergency_cost_ceiling: DEFAULT_EMERGENCY_COST_CEILING,
            emergency_hourly_request_ceiling: DEFAULT_EMERGENCY_HOURLY_REQUESTS,
            max_performance_events: DEFAULT_MAX_PERFORMANCE_EVENTS,
            outbound_concurrency_per_provider: DEFAULT_OUTBOUND_CONCURRENCY,
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, id: ProviderId, credentials: ProviderCredentials) -> Self {
        self.providers.insert(id, credentials);
        self
    }

    pub fn with_default_provider(mut self, id: ProviderId) -> Self {
        self.default_provider = Some(id);
        self
    }

    pub fn with_cache_ttl(mut self, secs: u64) -> Self {
        self.cache_ttl_secs = secs;
        self
    }

    pub fn with_remote_cache(mut self, remote: RemoteCacheConfig) -> Self {
        self.remote_cache = Some(remote);
        self
    }

    pub fn with_health_check_interval(mut self, secs: u64) -> Self {
        self.health_check_interval_secs = secs;
        self
    }

    /// Read credentials from the conventional environment variables
    /// (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`, `HUGGINGFACE_API_KEY`,
    /// `MISTRAL_API_KEY`, `DEEPSEEK_API_KEY`, `QWEN_API_KEY`,
    /// `OPENROUTER_API_KEY`). Unset providers are simply absent.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        for provider in ProviderId::ALL {
            let var = format!("{}_API_KEY", provider.as_str().to_uppercase());
            if let Ok(key) = std::env::var(&var) {
                if !key.is_empty() {
                    config
                        .providers
                        .insert(provider, ProviderCredentials::new(key));
                }
            }
        }
        if let (Ok(url), Ok(token)) = (
            std::env::var("CACHE_KV_REST_URL"),
            std::env::var("CACHE_KV_REST_TOKEN"),
        ) {
            if !url.is_empty() && !token.is_empty() {
                config.remote_cache = Some(RemoteCacheConfig { url, token });
            }
        }
        config
    }

    /// Providers that have usable credentials, in canonical order.
    pub fn configured_providers(&self) -> Vec<ProviderId> {
        ProviderId::ALL
            .into_iter()
            .filter(|p| {
                self.providers
                    .get(p)
                    .map(|c| c.enabled && !c.api_key.is_empty())
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.cache_ttl_secs, 3600);
        assert_eq!(config.health_check_interval_secs, 300);
        assert_eq!(config.emergency_hourly_request_ceiling, 10_000);
        assert_eq!(config.outbound_concurrency_per_provider, 32);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_configured_providers_skips_missing_and_disabled() {
        let config = GatewayConfig::new()
            .with_provider(ProviderId::OpenAi, ProviderCredentials::new("sk-test"))
            .with_provider(
                ProviderId::Qwen,
                ProviderCredentials::new("qk-test").disabled(),
            )
            .with_provider(ProviderId::Mistral, ProviderCredentials::new(""));

        assert_eq!(config.configured_providers(), vec![ProviderId::OpenAi]);
    }

    #[test]
    fn test_credentials_builder() {
        let creds = ProviderCredentials::new("key")
            .with_base_url("https://proxy.internal/v1")
            .with_organization("org-1")
            .with_timeout(30)
            .with_priority(10);
        assert_eq!(creds.base_url.as_deref(), Some("https://proxy.internal/v1"));
        assert_eq!(creds.organization_id.as_deref(), Some("org-1"));
        assert_eq!(creds.timeout_secs, 30);
        assert_eq!(creds.priority, 10);
        assert!(creds.enabled);
    }
}
