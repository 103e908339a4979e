//! Response cache: deterministic request fingerprinting and a two-tier
//! TTL store (remote KV when configured, bounded local map always).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provider::types::{ProviderId, RequestContent, ResponseContent, TaskKind};

/// How often the background sweeper clears expired local entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Bound on the local tier.
const MAX_LOCAL_ENTRIES: usize = 10_000;

/// 64-bit stable digest of request content: the first eight bytes of a
/// SHA-256, hex-encoded. Strings hash their UTF-8 bytes; transcripts hash
/// the order-preserving `{role, content}` JSON form.
pub fn content_digest(content: &RequestContent) -> String {
    let mut hasher = Sha256::new();
    match content {
        RequestContent::Text { text } => hasher.update(text.as_bytes()),
        RequestContent::Messages { messages } => {
            let canonical: Vec<serde_json::Value> = messages
                .iter()
                .map(|m| {
                    serde_json::json!({
                        "role": m.role.to_string(),
                        "content": m.content,
                    })
                })
                .collect();
            let json = serde_json::to_string(&canonical).unwrap_or_default();
            hasher.update(json.as_bytes());
        }
        RequestContent::Media {
            data, mime_type, prompt,
        } => {
            hasher.update(mime_type.as_bytes());
            hasher.update(data);
            if let Some(prompt) = prompt {
                hasher.update(prompt.as_bytes());
            }
        }
    }
    let hash = hasher.finalize();
    hash[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Build the cache key for a request: every parameter that affects the
/// response, separator-joined.
#[allow(clippy::too_many_arguments)]
pub fn fingerprint(
    task: TaskKind,
    content: &RequestContent,
    provider: Option<ProviderId>,
    model_id: Option<&str>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    template_id: Option<&str>,
) -> String {
    [
        task.as_str().to_string(),
        content_digest(content),
        provider.map(|p| p.as_str().to_string()).unwrap_or_default(),
        model_id.unwrap_or_default().to_string(),
        max_tokens.map(|t| t.to_string()).unwrap_or_default(),
        temperature.map(|t| t.to_string()).unwrap_or_default(),
        template_id.unwrap_or_default().to_string(),
    ]
    .join(":")
}

/// One cached response with its freshness window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub content: ResponseContent,
    pub model_id: String,
    pub provider: ProviderId,
    pub tokens_used: Option<u32>,
    pub stored_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CachedResponse {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.stored_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// Remote key-value tier. Values are opaque strings with a TTL.
#[async_trait]
pub trait RemoteKv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// REST KV client (Upstash-style endpoint: `GET /get/{key}`,
/// `POST /set/{key}?EX={ttl}`, `POST /del/{key}`, bearer auth).
pub struct HttpKv {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct KvResult {
    result: Option<String>,
}

impl HttpKv {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::internal(format!("failed to build KV client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl RemoteKv for HttpKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = format!("{}/get/{}", self.base_url, key);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("remote cache get failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "remote cache get returned {}",
                response.status()
            )));
        }
        let parsed: KvResult = response
            .json()
            .await
            .map_err(|e| Error::Storage(format!("remote cache get parse failed: {}", e)))?;
        Ok(parsed.result)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let url = format!("{}/set/{}?EX={}", self.base_url, key, ttl_secs);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| Error::Storage(format!("remote cache set failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::Storage(format!(
                "remote cache set returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let url = format!("{}/del/{}", self.base_url, key);
        self.http
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("remote cache delete failed: {}", e)))?;
        Ok(())
    }
}

/// Two-tier response cache. Reads consult the remote tier first and fall
/// back to the local map on miss or remote failure; writes go to both, and
/// a remote write failure degrades silently to local-only.
///
/// The local map offers at-most-once insert per key under concurrent
/// writers; it does not coalesce concurrent misses.
pub struct ResponseCache {
    local: RwLock<HashMap<String, CachedResponse>>,
    remote: Option<Arc<dyn RemoteKv>>,
    ttl_secs: u64,
}

impl ResponseCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            remote: None,
            ttl_secs,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteKv>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Look up a fingerprint. Expired entries are treated as misses and
    /// removed from the local tier.
    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        let now = Utc::now();

        if let Some(remote) = &self.remote {
            match remote.get(key).await {
                Ok(Some(raw)) => match serde_json::from_str::<CachedResponse>(&raw) {
                    Ok(entry) if !entry.is_expired(now) => return Some(entry),
                    Ok(_) => {
                        if let Err(e) = remote.delete(key).await {
                            tracing::debug!(error = %e, "expired remote entry not deleted");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "remote cache entry undecodable, ignoring");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "remote cache read failed, using local tier");
                }
            }
        }

        let hit = {
            let local = self.local.read().unwrap_or_else(|e| e.into_inner());
            local.get(key).cloned()
        };
        match hit {
            Some(entry) if !entry.is_expired(now) => Some(entry),
            Some(_) => {
                let mut local = self.local.write().unwrap_or_else(|e| e.into_inner());
                local.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a response under a fingerprint. The first writer wins; a
    /// concurrent duplicate insert leaves the existing fresh entry alone.
    pub async fn put(&self, key: &str, entry: CachedResponse) {
        if let Some(remote) = &self.remote {
            match serde_json::to_string(&entry) {
                Ok(raw) => {
                    if let Err(e) = remote.set(key, &raw, entry.ttl_secs).await {
                        tracing::warn!(error = %e, "remote cache write failed, local tier only");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "cache entry serialization failed"),
            }
        }

        let now = Utc::now();
        let mut local = self.local.write().unwrap_or_else(|e| e.into_inner());
        if local.len() >= MAX_LOCAL_ENTRIES {
            // Drop the oldest entry to stay bounded.
            if let Some(oldest) = local
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone())
            {
                local.remove(&oldest);
            }
        }
        match local.entry(key.to_string()) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(entry);
                }
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete(key).await {
                tracing::debug!(error = %e, "remote cache delete failed");
            }
        }
        self.local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Remove expired local entries. The sweeper calls this once a minute.
    pub fn sweep(&self) {
        let now = Utc::now();
        let mut local = self.local.write().unwrap_or_else(|e| e.into_inner());
        let before = local.len();
        local.retain(|_, entry| !entry.is_expired(now));
        let removed = before - local.len();
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
    }

    pub fn local_len(&self) -> usize {
        self.local.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Spawn the periodic local-tier sweeper. The caller owns the handle
    /// and aborts it at shutdown.
    pub fn start_sweeper(cache: Arc<ResponseCache>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        })
    }
}
