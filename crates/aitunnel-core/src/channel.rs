use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use aitunnel_common::{ChannelConfig, HealthCheckConfig, KeyStrategy, TunnelConfig};

/// Consecutive failures after which a credential is taken out of rotation.
const KEY_DISABLE_THRESHOLD: u32 = 3;
/// Consecutive request failures after which a channel is demoted.
const CHANNEL_UNHEALTHY_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
struct ApiKey {
    value: String,
    alive: bool,
    consecutive_failures: u32,
}

impl ApiKey {
    fn new(value: String) -> Self {
        Self {
            value,
            alive: true,
            consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub fail_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_request_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Management-API view of a channel. Key material never appears here,
/// only counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub name: String,
    pub target: String,
    pub enabled: bool,
    pub health: Health,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub weight: u32,
    pub fallback: bool,
    pub key_strategy: KeyStrategy,
    pub total_keys: usize,
    pub alive_keys: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelConfig>,
    pub stats: ChannelStats,
}

struct ChannelInner {
    keys: Vec<ApiKey>,
    cursor: usize,
    enabled: bool,
    health: Health,
    latency_ms: Option<u64>,
    consecutive_fails: u32,
    stats: ChannelStats,
}

/// One upstream endpoint with its credential pool, health and counters.
///
/// All mutable state sits behind a per-channel mutex that is never held
/// across an await point; callers get short atomic operations and a
/// consistent `(total, success, fail)` triple on every read.
pub struct Channel {
    name: String,
    target: String,
    weight: u32,
    fallback: bool,
    strategy: KeyStrategy,
    tunnel: Option<TunnelConfig>,
    health_check: Option<HealthCheckConfig>,
    inner: Mutex<ChannelInner>,
}

impl Channel {
    pub fn from_config(config: &ChannelConfig) -> Self {
        let keys = config
            .keys
            .iter()
            .filter(|key| !key.trim().is_empty())
            .map(|key| ApiKey::new(key.clone()))
            .collect();
        Self {
            name: config.name.clone(),
            target: config.target.trim_end_matches('/').to_string(),
            weight: config.weight,
            fallback: config.fallback,
            strategy: config.key_strategy,
            tunnel: config.tunnel.clone(),
            health_check: config.health_check.clone(),
            inner: Mutex::new(ChannelInner {
                keys,
                cursor: 0,
                enabled: true,
                health: Health::Unknown,
                latency_ms: None,
                consecutive_fails: 0,
                stats: ChannelStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target origin, without a trailing slash.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn fallback(&self) -> bool {
        self.fallback
    }

    pub fn tunnel(&self) -> Option<&TunnelConfig> {
        self.tunnel.as_ref()
    }

    pub fn health_check(&self) -> Option<&HealthCheckConfig> {
        self.health_check.as_ref()
    }

    /// Select a credential. Round-robin scans from the cursor and parks it
    /// one past the returned slot; random samples uniformly among alive
    /// keys. Returns `None` when no credential is alive.
    pub fn pick_key(&self) -> Option<(String, usize)> {
        let mut inner = self.lock();
        if inner.keys.is_empty() {
            return None;
        }
        match self.strategy {
            KeyStrategy::RoundRobin => {
                let len = inner.keys.len();
                let start = inner.cursor % len;
                for offset in 0..len {
                    let index = (start + offset) % len;
                    if inner.keys[index].alive {
                        inner.cursor = (index + 1) % len;
                        return Some((inner.keys[index].value.clone(), index));
                    }
                }
                None
            }
            KeyStrategy::Random => {
                let alive: Vec<usize> = inner
                    .keys
                    .iter()
                    .enumerate()
                    .filter(|(_, key)| key.alive)
                    .map(|(index, _)| index)
                    .collect();
                if alive.is_empty() {
                    return None;
                }
                let index = alive[rand::thread_rng().gen_range(0..alive.len())];
                Some((inner.keys[index].value.clone(), index))
            }
        }
    }

    /// Three strikes disable the credential; further calls on a dead key
    /// are no-ops.
    pub fn mark_key_failed(&self, index: usize) {
        let mut inner = self.lock();
        let Some(key) = inner.keys.get_mut(index) else {
            return;
        };
        if !key.alive {
            return;
        }
        key.consecutive_failures += 1;
        if key.consecutive_failures >= KEY_DISABLE_THRESHOLD {
            key.alive = false;
        }
    }

    /// Clears the failure streak and revives the key. A later good
    /// response self-heals a credential that was disabled by a transient
    /// provider blip.
    pub fn mark_key_success(&self, index: usize) {
        let mut inner = self.lock();
        if let Some(key) = inner.keys.get_mut(index) {
            key.consecutive_failures = 0;
            key.alive = true;
        }
    }

    pub fn record_success(&self, latency_ms: u64) {
        let mut inner = self.lock();
        inner.stats.total_requests += 1;
        inner.stats.success_count += 1;
        inner.stats.last_request_at = Some(OffsetDateTime::now_utc());
        inner.latency_ms = Some(latency_ms);
        inner.consecutive_fails = 0;
        inner.health = Health::Healthy;
    }

    /// Returns true when this failure demoted the channel to unhealthy.
    pub fn record_failure(&self, reason: impl Into<String>) -> bool {
        let mut inner = self.lock();
        inner.stats.total_requests += 1;
        inner.stats.fail_count += 1;
        inner.stats.last_request_at = Some(OffsetDateTime::now_utc());
        inner.stats.last_error = Some(reason.into());
        inner.consecutive_fails += 1;
        if inner.consecutive_fails >= CHANNEL_UNHEALTHY_THRESHOLD && inner.health != Health::Unhealthy
        {
            inner.health = Health::Unhealthy;
            return true;
        }
        false
    }

    /// Prober-only health write. Returns true when the state changed.
    pub fn set_health(&self, health: Health, latency_ms: Option<u64>) -> bool {
        let mut inner = self.lock();
        if let Some(latency) = latency_ms {
            inner.latency_ms = Some(latency);
        }
        if health == Health::Healthy {
            inner.consecutive_fails = 0;
        }
        if inner.health == health {
            return false;
        }
        inner.health = health;
        true
    }

    pub fn add_key(&self, value: String) {
        let mut inner = self.lock();
        inner.keys.push(ApiKey::new(value));
    }

    /// Removing a slot at or past the cursor resets the cursor so the
    /// next scan cannot skip survivors; removing below it shifts the
    /// cursor down with the indices.
    pub fn remove_key(&self, index: usize) -> bool {
        let mut inner = self.lock();
        if index >= inner.keys.len() {
            return false;
        }
        inner.keys.remove(index);
        if index >= inner.cursor {
            inner.cursor = 0;
        } else {
            inner.cursor -= 1;
        }
        true
    }

    /// First alive credential, used by the health prober's Bearer header.
    pub fn first_alive_key(&self) -> Option<String> {
        let inner = self.lock();
        inner
            .keys
            .iter()
            .find(|key| key.alive)
            .map(|key| key.value.clone())
    }

    pub fn alive_keys(&self) -> usize {
        self.lock().keys.iter().filter(|key| key.alive).count()
    }

    pub fn total_keys(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Flips the operator switch and returns the new value.
    pub fn toggle(&self) -> bool {
        let mut inner = self.lock();
        inner.enabled = !inner.enabled;
        inner.enabled
    }

    pub fn health(&self) -> Health {
        self.lock().health
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.lock().latency_ms
    }

    pub fn stats(&self) -> ChannelStats {
        self.lock().stats.clone()
    }

    /// Routable: enabled, not known-unhealthy, and at least one live key.
    pub fn is_available(&self) -> bool {
        let inner = self.lock();
        inner.enabled
            && inner.health != Health::Unhealthy
            && inner.keys.iter().any(|key| key.alive)
    }

    pub fn summary(&self) -> ChannelSummary {
        let inner = self.lock();
        ChannelSummary {
            name: self.name.clone(),
            target: self.target.clone(),
            enabled: inner.enabled,
            health: inner.health,
            latency_ms: inner.latency_ms,
            weight: self.weight,
            fallback: self.fallback,
            key_strategy: self.strategy,
            total_keys: inner.keys.len(),
            alive_keys: inner.keys.iter().filter(|key| key.alive).count(),
            tunnel: self.tunnel.clone(),
            stats: inner.stats.clone(),
        }
    }
}
