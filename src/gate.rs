//! Cost and security gate: per-tier spending limits, pre-flight cost
//! estimation, the emergency circuit breaker, and user-key policy.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::provider::types::{ModelDescriptor, ProviderId};

/// Subscription tier. Total order; higher tiers unlock larger limits and
/// costlier models.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    #[default]
    Free,
    Lilbean,
    Clawback,
    Bigchonk,
    Meowtrix,
}

impl UserTier {
    /// Default spending-limit bundle for this tier.
    pub fn limits(&self) -> SpendingLimits {
        match self {
            Self::Free => SpendingLimits {
                daily_cost: 1.00,
                daily_requests: 50,
                daily_tokens: 10_000,
                hourly_cost: 0.25,
                hourly_requests: 15,
                per_request_cost: 0.10,
                per_request_tokens: 2_000,
            },
            Self::Lilbean => SpendingLimits {
                daily_cost: 5.00,
                daily_requests: 200,
                daily_tokens: 50_000,
                hourly_cost: 1.00,
                hourly_requests: 50,
                per_request_cost: 0.50,
                per_request_tokens: 4_000,
            },
            Self::Clawback => SpendingLimits {
                daily_cost: 25.00,
                daily_requests: 1_000,
                daily_tokens: 250_000,
                hourly_cost: 5.00,
                hourly_requests: 200,
                per_request_cost: 2.00,
                per_request_tokens: 8_000,
            },
            Self::Bigchonk => SpendingLimits {
                daily_cost: 100.00,
                daily_requests: 5_000,
                daily_tokens: 1_000_000,
                hourly_cost: 20.00,
                hourly_requests: 500,
                per_request_cost: 10.00,
                per_request_tokens: 16_000,
            },
            Self::Meowtrix => SpendingLimits {
                daily_cost: 500.00,
                daily_requests: 25_000,
                daily_tokens: 5_000_000,
                hourly_cost: 100.00,
                hourly_requests: 2_000,
                per_request_cost: 50.00,
                per_request_tokens: 32_000,
            },
        }
    }

    /// Ceiling on a model's per-1k unit cost for this tier.
    pub fn model_cost_ceiling(&self) -> f64 {
        match self {
            Self::Free => 0.001,
            Self::Lilbean => 0.005,
            Self::Clawback => 0.020,
            Self::Bigchonk => 0.100,
            Self::Meowtrix => 1.000,
        }
    }

    /// Whether this tier may route through caller-supplied provider keys.
    pub fn allows_user_keys(&self) -> bool {
        *self >= Self::Clawback
    }
}

/// Spending-limit bundle. Per-request caps are tighter than hourly caps,
/// which are tighter than daily caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingLimits {
    pub daily_cost: f64,
    pub daily_requests: u64,
    pub daily_tokens: u64,
    pub hourly_cost: f64,
    pub hourly_requests: u64,
    pub per_request_cost: f64,
    pub per_request_tokens: u64,
}

/// Whose credentials a selection will execute with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    System,
    User,
}

/// A caller-supplied provider key. Never printed in full, and deliberately
/// not serializable.
#[derive(Clone)]
pub struct UserApiKey(String);

impl UserApiKey {
    /// Accept a key after a format check: printable URL-safe characters,
    /// at least 20 of them.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.len() < 20 {
            return Err(Error::validation("user API key too short"));
        }
        let url_safe = raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'));
        if !url_safe {
            return Err(Error::validation("user API key contains invalid characters"));
        }
        Ok(Self(raw))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for UserApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserApiKey(\"…{}\")", &self.0[self.0.len() - 4..])
    }
}

/// Running counters for one user, with their window anchors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendingState {
    pub daily_cost: f64,
    pub daily_requests: u64,
    pub daily_tokens: u64,
    pub hourly_cost: f64,
    pub hourly_requests: u64,
    day_start: DateTime<Utc>,
    hour_start: DateTime<Utc>,
}

fn hour_anchor(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn day_anchor(now: DateTime<Utc>) -> DateTime<Utc> {
    hour_anchor(now).with_hour(0).unwrap_or(now)
}

impl SpendingState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_cost: 0.0,
            daily_requests: 0,
            daily_tokens: 0,
            hourly_cost: 0.0,
            hourly_requests: 0,
            day_start: day_anchor(now),
            hour_start: hour_anchor(now),
        }
    }

    /// Zero any counter whose window has rolled over. Idempotent: comparing
    /// anchors makes a second call in the same window a no-op.
    fn reset_windows(&mut self, now: DateTime<Utc>) {
        let hour = hour_anchor(now);
        if hour != self.hour_start {
            self.hour_start = hour;
            self.hourly_cost = 0.0;
            self.hourly_requests = 0;
        }
        let day = day_anchor(now);
        if day != self.day_start {
            self.day_start = day;
            self.daily_cost = 0.0;
            self.daily_requests = 0;
            self.daily_tokens = 0;
        }
    }
}

/// Outcome of a successful pre-flight check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Admission {
    pub estimated_cost: f64,
    pub security_level: SecurityLevel,
}

/// Pre-flight gatekeeper. User state is sharded by user id so one user's
/// bookkeeping never blocks another's.
pub struct CostGate {
    states: RwLock<HashMap<String, Arc<Mutex<SpendingState>>>>,
    global_hour: Mutex<(DateTime<Utc>, u64)>,
    user_keys: RwLock<HashMap<(String, ProviderId), UserApiKey>>,
    emergency_cost_ceiling: f64,
    emergency_hourly_requests: u64,
}

impl CostGate {
    pub fn new(emergency_cost_ceiling: f64, emergency_hourly_requests: u64) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            global_hour: Mutex::new((hour_anchor(Utc::now()), 0)),
            user_keys: RwLock::new(HashMap::new()),
            emergency_cost_ceiling,
            emergency_hourly_requests,
        }
    }

    /// Accept a caller-supplied provider key for a high-tier user. The key
    /// must pass the format check and the tier must permit it. Keys live in
    /// memory only and are never logged in full.
    pub fn register_user_key(
        &self,
        user_id: &str,
        tier: UserTier,
        provider: ProviderId,
        raw_key: impl Into<String>,
    ) -> Result<()> {
        if !tier.allows_user_keys() {
            return Err(Error::TierForbidden(format!(
                "tier {:?} may not register provider keys",
                tier
            )));
        }
        let key = UserApiKey::new(raw_key)?;
        self.user_keys
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((user_id.to_string(), provider), key);
        tracing::info!(user = user_id, provider = %provider, "user provider key registered");
        Ok(())
    }

    /// Look up a registered key for a user/provider pair.
    pub fn user_key(&self, user_id: &str, provider: ProviderId) -> Option<UserApiKey> {
        self.user_keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(user_id.to_string(), provider))
            .cloned()
    }

    fn state_handle(&self, user_id: &str, now: DateTime<Utc>) -> Arc<Mutex<SpendingState>> {
        if let Some(handle) = self
            .states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
        {
            return Arc::clone(handle);
        }
        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            states
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SpendingState::new(now)))),
        )
    }

    /// Run the pre-flight checks for one request against one candidate
    /// model. Counters do not move here; [`CostGate::record_usage`] moves
    /// them once the call completes.
    pub fn admit(
        &self,
        user_id: &str,
        tier: UserTier,
        model: &ModelDescriptor,
        estimated_tokens: u32,
        use_user_keys: bool,
    ) -> Result<Admission> {
        self.admit_at(user_id, tier, model, estimated_tokens, use_user_keys, Utc::now())
    }

    /// [`CostGate::admit`] with an explicit clock, for deterministic
    /// window-boundary behavior.
    pub fn admit_at(
        &self,
        user_id: &str,
        tier: UserTier,
        model: &ModelDescriptor,
        estimated_tokens: u32,
        use_user_keys: bool,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let security_level = self.security_level(tier, use_user_keys)?;
        let limits = tier.limits();
        let estimated_cost = model.estimate_cost(estimated_tokens);

        if estimated_cost > limits.per_request_cost {
            return Err(Error::CostLimitExceeded(format!(
                "estimated cost {:.4} exceeds per-request limit {:.2}",
                estimated_cost, limits.per_request_cost
            )));
        }

        if estimated_tokens as u64 > limits.per_request_tokens {
            return Err(Error::CostLimitExceeded(format!(
                "requested {} tokens exceeds per-request limit {}",
                estimated_tokens, limits.per_request_tokens
            )));
        }

        let handle = self.state_handle(user_id, now);
        {
            let mut state = handle.lock().unwrap_or_else(|e| e.into_inner());
            state.reset_windows(now);

            if state.hourly_cost + estimated_cost > limits.hourly_cost {
                return Err(Error::CostLimitExceeded(format!(
                    "request would exceed hourly spending limit {:.2}",
                    limits.hourly_cost
                )));
            }
            if state.hourly_requests + 1 > limits.hourly_requests {
                return Err(Error::CostLimitExceeded(format!(
                    "request would exceed hourly request limit {}",
                    limits.hourly_requests
                )));
            }

            if state.daily_cost + estimated_cost > limits.daily_cost {
                return Err(Error::CostLimitExceeded(format!(
                    "request would exceed daily spending limit {:.2}",
                    limits.daily_cost
                )));
            }
            if state.daily_requests + 1 > limits.daily_requests {
                return Err(Error::CostLimitExceeded(format!(
                    "request would exceed daily request limit {}",
                    limits.daily_requests
                )));
            }
            if state.daily_tokens + estimated_tokens as u64 > limits.daily_tokens {
                return Err(Error::CostLimitExceeded(format!(
                    "request would exceed daily token limit {}",
                    limits.daily_tokens
                )));
            }
        }

        // Emergency circuit breaker, unconditional.
        if estimated_cost > self.emergency_cost_ceiling {
            return Err(Error::CostLimitExceeded(format!(
                "estimated cost {:.2} exceeds emergency ceiling {:.2}",
                estimated_cost, self.emergency_cost_ceiling
            )));
        }
        {
            let mut global = self.global_hour.lock().unwrap_or_else(|e| e.into_inner());
            let hour = hour_anchor(now);
            if global.0 != hour {
                *global = (hour, 0);
            }
            if global.1 + 1 > self.emergency_hourly_requests {
                return Err(Error::CostLimitExceeded(format!(
                    "global hourly request volume exceeds {}",
                    self.emergency_hourly_requests
                )));
            }
            global.1 += 1;
        }

        Ok(Admission {
            estimated_cost,
            security_level,
        })
    }

    /// Whether the selection runs on system or user credentials. User keys
    /// are a privilege of the upper tiers.
    pub fn security_level(&self, tier: UserTier, use_user_keys: bool) -> Result<SecurityLevel> {
        if !use_user_keys {
            return Ok(SecurityLevel::System);
        }
        if !tier.allows_user_keys() {
            return Err(Error::TierForbidden(format!(
                "tier {:?} may not use caller-supplied provider keys",
                tier
            )));
        }
        Ok(SecurityLevel::User)
    }

    /// Move the counters after a completed call.
    pub fn record_usage(&self, user_id: &str, cost: f64, tokens: u64) {
        self.record_usage_at(user_id, cost, tokens, Utc::now())
    }

    pub fn record_usage_at(&self, user_id: &str, cost: f64, tokens: u64, now: DateTime<Utc>) {
        let handle = self.state_handle(user_id, now);
        let mut state = handle.lock().unwrap_or_else(|e| e.into_inner());
        state.reset_windows(now);
        state.daily_cost += cost;
        state.daily_requests += 1;
        state.daily_tokens += tokens;
        state.hourly_cost += cost;
        state.hourly_requests += 1;
    }

    /// Current counters for a user, if any usage has been recorded.
    pub fn spending_snapshot(&self, user_id: &str) -> Option<SpendingState> {
        self.states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .map(|handle| handle.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{ProviderId, TaskKind};
    use chrono::TimeZone;

    fn model(prompt_cost: f64, completion_cost: f64) -> ModelDescriptor {
        ModelDescriptor {
            id: "m".into(),
            name: "M".into(),
            provider: ProviderId::OpenAi,
            max_context_tokens: 128_000,
            capabilities: [TaskKind::Chat].into_iter().collect(),
            streaming: false,
            functions: false,
            vision: false,
            cost_per_1k_prompt: prompt_cost,
            cost_per_1k_completion: completion_cost,
            priority_score: 8.0,
            available: true,
        }
    }

    fn gate() -> CostGate {
        CostGate::new(50.0, 10_000)
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_free_tier_admits_small_request() {
        let gate = gate();
        let model = model(0.0005, 0.0015);
        let admission = gate
            .admit("u1", UserTier::Free, &model, 400, false)
            .unwrap();
        assert!(admission.estimated_cost < 0.01);
        assert_eq!(admission.security_level, SecurityLevel::System);
    }

    #[test]
    fn test_large_request_rejected_before_any_usage() {
        let gate = gate();
        let model = model(0.03, 0.06);
        let err = gate
            .admit("u1", UserTier::Free, &model, 100_000, false)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CostLimitExceeded);
        // Rejection leaves no counter movement.
        assert!(gate
            .spending_snapshot("u1")
            .map(|s| s.daily_requests == 0)
            .unwrap_or(true));
    }

    #[test]
    fn test_per_request_token_cap() {
        let gate = gate();
        let model = model(0.0, 0.0);
        let err = gate
            .admit("u1", UserTier::Free, &model, 2_001, false)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CostLimitExceeded);
        assert!(gate.admit("u1", UserTier::Free, &model, 2_000, false).is_ok());
    }

    #[test]
    fn test_exact_hourly_boundary_admitted_one_over_rejected() {
        let gate = gate();
        // 1000 tokens at 0.1/1k both ways costs exactly 0.1.
        let model = model(0.1, 0.1);
        let now = at(10, 0);

        // Free tier hourly cap is 0.25. Spend 0.15, leaving exactly 0.10.
        gate.record_usage_at("u1", 0.15, 100, now);
        assert!(gate
            .admit_at("u1", UserTier::Free, &model, 1000, false, now)
            .is_ok());

        // One unit above the remaining allowance is rejected.
        gate.record_usage_at("u1", 0.0001, 0, now);
        let err = gate
            .admit_at("u1", UserTier::Free, &model, 1000, false, now)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CostLimitExceeded);
    }

    #[test]
    fn test_hourly_window_reset_is_idempotent() {
        let gate = gate();
        let model = model(0.1, 0.1);
        gate.record_usage_at("u1", 0.25, 500, at(10, 30));

        // Saturated at 10:xx, admitted again after the top of the hour.
        assert!(gate
            .admit_at("u1", UserTier::Free, &model, 1000, false, at(10, 45))
            .is_err());
        assert!(gate
            .admit_at("u1", UserTier::Free, &model, 1000, false, at(11, 1))
            .is_ok());
        // A second check in the same window does not reset anything extra.
        assert!(gate
            .admit_at("u1", UserTier::Free, &model, 1000, false, at(11, 2))
            .is_ok());

        let snapshot = gate.spending_snapshot("u1").unwrap();
        assert_eq!(snapshot.daily_requests, 1);
    }

    #[test]
    fn test_daily_counters_survive_hour_reset() {
        let gate = gate();
        gate.record_usage_at("u1", 0.2, 1000, at(9, 0));
        gate.record_usage_at("u1", 0.2, 1000, at(10, 0));

        let snapshot = gate.spending_snapshot("u1").unwrap();
        assert!((snapshot.daily_cost - 0.4).abs() < 1e-9);
        assert!((snapshot.hourly_cost - 0.2).abs() < 1e-9);
        assert_eq!(snapshot.daily_tokens, 2000);
    }

    #[test]
    fn test_emergency_cost_ceiling() {
        // Breaker configured below the tier cap so it trips first.
        let tight = CostGate::new(5.0, 10_000);
        let model = model(100.0, 100.0);
        let err = tight
            .admit("u1", UserTier::Meowtrix, &model, 400, false)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CostLimitExceeded);
    }

    #[test]
    fn test_emergency_hourly_volume() {
        let gate = CostGate::new(50.0, 2);
        let model = model(0.0, 0.0);
        let now = at(12, 0);
        assert!(gate
            .admit_at("a", UserTier::Meowtrix, &model, 10, false, now)
            .is_ok());
        assert!(gate
            .admit_at("b", UserTier::Meowtrix, &model, 10, false, now)
            .is_ok());
        let err = gate
            .admit_at("c", UserTier::Meowtrix, &model, 10, false, now)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CostLimitExceeded);
        // The global window rolls over with the hour.
        assert!(gate
            .admit_at("c", UserTier::Meowtrix, &model, 10, false, at(13, 0))
            .is_ok());
    }

    #[test]
    fn test_user_keys_tier_policy() {
        let gate = gate();
        assert_eq!(
            gate.security_level(UserTier::Meowtrix, true).unwrap(),
            SecurityLevel::User
        );
        assert_eq!(
            gate.security_level(UserTier::Clawback, true).unwrap(),
            SecurityLevel::User
        );
        let err = gate.security_level(UserTier::Lilbean, true).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TierForbidden);
        assert_eq!(
            gate.security_level(UserTier::Free, false).unwrap(),
            SecurityLevel::System
        );
    }

    #[test]
    fn test_user_api_key_format() {
        assert!(UserApiKey::new("sk-or-v1-abcdef0123456789").is_ok());
        assert!(UserApiKey::new("short").is_err());
        assert!(UserApiKey::new("has spaces in the key value").is_err());

        let key = UserApiKey::new("sk-or-v1-abcdef0123456789").unwrap();
        let debug = format!("{:?}", key);
        assert!(!debug.contains("abcdef0123456789"));
        assert!(debug.contains("6789"));
    }

    #[test]
    fn test_user_key_registration_respects_tier() {
        let gate = gate();
        let err = gate
            .register_user_key("u1", UserTier::Free, ProviderId::OpenAi, "sk-abcdef0123456789abcd")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TierForbidden);
        assert!(gate.user_key("u1", ProviderId::OpenAi).is_none());

        gate.register_user_key(
            "u2",
            UserTier::Bigchonk,
            ProviderId::OpenAi,
            "sk-abcdef0123456789abcd",
        )
        .unwrap();
        let key = gate.user_key("u2", ProviderId::OpenAi).unwrap();
        assert_eq!(key.expose(), "sk-abcdef0123456789abcd");
        assert!(gate.user_key("u2", ProviderId::Anthropic).is_none());
    }

    #[test]
    fn test_tier_ordering_and_ceilings() {
        assert!(UserTier::Free < UserTier::Lilbean);
        assert!(UserTier::Bigchonk < UserTier::Meowtrix);
        assert!(UserTier::Free.model_cost_ceiling() < UserTier::Lilbean.model_cost_ceiling());
        // Per-request <= hourly <= daily holds for every tier.
        for tier in [
            UserTier::Free,
            UserTier::Lilbean,
            UserTier::Clawback,
            UserTier::Bigchonk,
            UserTier::Meowtrix,
        ] {
            let limits = tier.limits();
            assert!(limits.per_request_cost <= limits.hourly_cost);
            assert!(limits.hourly_cost <= limits.daily_cost);
            assert!(limits.hourly_requests <= limits.daily_requests);
            assert!(limits.per_request_tokens <= limits.daily_tokens);
        }
    }
}
