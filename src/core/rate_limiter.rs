//! Sliding-window rate limiter with pluggable stores.
//!
//! Every identifier keeps the timestamps of its admitted requests within the
//! window. [`RateLimiter::check`] both evaluates and consumes: the store
//! prunes, counts and appends in one critical section per identifier, so two
//! concurrent callers can never both take the last slot.
//!
//! Stores are keyed as `rate_limit:<identifier>`. The in-memory store shards
//! its locks by key hash; the SQLite store uses an immediate transaction so
//! several processes can share limits.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapters::SqliteStore;

const SHARD_COUNT: usize = 16;

static SHARED: OnceLock<Arc<RateLimiter>> = OnceLock::new();

/// Errors raised by a rate store
#[derive(Debug, Error)]
pub enum RateStoreError {
    #[error("rate store error: {0}")]
    Backend(String),
}

/// Outcome of one atomic window update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Whether a timestamp was appended
    pub admitted: bool,

    /// Requests in the window after this hit
    pub count: u32,

    /// Age of the oldest timestamp still in the window
    pub oldest_age: Option<Duration>,
}

/// Per-identifier timestamp windows
#[async_trait]
pub trait RateStore: Send + Sync {
    fn name(&self) -> &str;

    /// Prune, count and (if under `limit`) append in one critical section
    async fn hit(&self, key: &str, limit: u32, window: Duration) -> Result<WindowHit, RateStoreError>;

    /// Drop the window for `key`
    async fn reset(&self, key: &str) -> Result<bool, RateStoreError>;
}

type Window = VecDeque<Instant>;

/// In-process store with hash-sharded locks
pub struct MemoryRateStore {
    shards: Vec<Mutex<HashMap<String, Window>>>,
}

impl MemoryRateStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Window>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }
}

impl Default for MemoryRateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateStore for MemoryRateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn hit(&self, key: &str, limit: u32, window: Duration) -> Result<WindowHit, RateStoreError> {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();
        let timestamps = shard.entry(key.to_string()).or_default();

        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        let admitted = (timestamps.len() as u32) < limit;
        if admitted {
            timestamps.push_back(now);
        }

        Ok(WindowHit {
            admitted,
            count: timestamps.len() as u32,
            oldest_age: timestamps.front().map(|t| now.duration_since(*t)),
        })
    }

    async fn reset(&self, key: &str) -> Result<bool, RateStoreError> {
        Ok(self.shard(key).lock().remove(key).is_some())
    }
}

/// Which store the shared limiter uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateStoreKind {
    #[default]
    Memory,
    Sqlite,
}

/// Rate limit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_window")]
    pub window_seconds: u64,

    /// Ceiling for callers without a tier
    #[serde(default = "default_limit")]
    pub default_limit: u32,

    /// Ceiling for authenticated callers; tiers scale from it
    #[serde(default = "default_authenticated_limit")]
    pub authenticated_limit: u32,

    /// Extra or overriding tiers
    #[serde(default)]
    pub tiers: HashMap<String, u32>,

    #[serde(default)]
    pub store: RateStoreKind,
}

fn default_enabled() -> bool {
    true
}
fn default_window() -> u64 {
    3600
}
fn default_limit() -> u32 {
    100
}
fn default_authenticated_limit() -> u32 {
    1000
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            window_seconds: default_window(),
            default_limit: default_limit(),
            authenticated_limit: default_authenticated_limit(),
            tiers: HashMap::new(),
            store: RateStoreKind::default(),
        }
    }
}

impl RateLimitSettings {
    /// Built-in tiers plus configured overrides
    pub fn tier_limits(&self) -> HashMap<String, u32> {
        let mut tiers = HashMap::from([
            ("free".to_string(), self.default_limit),
            ("basic".to_string(), self.authenticated_limit),
            ("premium".to_string(), self.authenticated_limit.saturating_mul(2)),
            ("enterprise".to_string(), self.authenticated_limit.saturating_mul(10)),
        ]);
        tiers.extend(self.tiers.iter().map(|(k, v)| (k.clone(), *v)));
        tiers
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,

    /// Time until the oldest request leaves the window
    pub reset_after: Duration,

    /// Set only when rejected; at least one second
    pub retry_after: Option<Duration>,
}

impl RateLimitResult {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: 0,
            remaining: 0,
            reset_after: Duration::ZERO,
            retry_after: None,
        }
    }

    /// Wall-clock time the window resets
    pub fn reset_at(&self) -> DateTime<Utc> {
        let delta = chrono::Duration::from_std(self.reset_after).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + delta
    }
}

fn ceil_secs(d: Duration) -> Duration {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    Duration::from_secs(secs.max(1))
}

/// Sliding-window admission control
pub struct RateLimiter {
    enabled: AtomicBool,
    window: Duration,
    default_limit: u32,
    tiers: HashMap<String, u32>,
    store: Arc<dyn RateStore>,
    fallback: MemoryRateStore,
}

impl RateLimiter {
    /// In-memory limiter
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            enabled: AtomicBool::new(settings.enabled),
            window: Duration::from_secs(settings.window_seconds),
            default_limit: settings.default_limit,
            tiers: settings.tier_limits(),
            store: Arc::new(MemoryRateStore::new()),
            fallback: MemoryRateStore::new(),
        }
    }

    /// Swap the primary store
    pub fn with_store(mut self, store: Arc<dyn RateStore>) -> Self {
        self.store = store;
        self
    }

    /// Build from settings, opening the SQLite store under `home` if asked
    pub fn from_settings(settings: &RateLimitSettings, home: &Path) -> Self {
        let limiter = Self::new(settings);
        match settings.store {
            RateStoreKind::Memory => limiter,
            RateStoreKind::Sqlite => {
                let path = home.join("cache.db");
                match SqliteStore::open(&path) {
                    Ok(store) => limiter.with_store(Arc::new(store)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to open rate store, using in-memory store");
                        limiter
                    }
                }
            }
        }
    }

    /// Process-wide limiter built from the global configuration
    pub fn shared() -> Arc<RateLimiter> {
        SHARED
            .get_or_init(|| match crate::config::config() {
                Ok(cfg) => Arc::new(Self::from_settings(&cfg.rate_limit, &cfg.home)),
                Err(e) => {
                    warn!(error = %e, "Configuration unavailable, using default rate limits");
                    Arc::new(Self::new(&RateLimitSettings::default()))
                }
            })
            .clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Global switch; when off every check is admitted without touching state
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Ceiling for a tier; unknown or missing tiers get the default
    pub fn limit_for(&self, tier: Option<&str>) -> u32 {
        match tier {
            Some(name) => match self.tiers.get(name) {
                Some(limit) => *limit,
                None => {
                    debug!(tier = name, "Unknown rate limit tier, using default");
                    self.default_limit
                }
            },
            None => self.default_limit,
        }
    }

    fn key(identifier: &str) -> String {
        format!("rate_limit:{}", identifier)
    }

    /// Check and consume one request for `identifier`
    pub async fn check(&self, identifier: &str, tier: Option<&str>) -> RateLimitResult {
        if !self.is_enabled() {
            return RateLimitResult::unlimited();
        }
        self.check_with_limit(identifier, self.limit_for(tier)).await
    }

    /// Check and consume against an explicit ceiling
    pub async fn check_with_limit(&self, identifier: &str, limit: u32) -> RateLimitResult {
        if !self.is_enabled() {
            return RateLimitResult::unlimited();
        }

        let key = Self::key(identifier);
        let hit = match self.store.hit(&key, limit, self.window).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "Rate store failed, using local window");
                // Memory store is infallible
                self.fallback
                    .hit(&key, limit, self.window)
                    .await
                    .unwrap_or(WindowHit {
                        admitted: true,
                        count: 0,
                        oldest_age: None,
                    })
            }
        };

        let reset_after = hit
            .oldest_age
            .map(|age| self.window.saturating_sub(age))
            .unwrap_or(self.window);

        let retry_after = if hit.admitted {
            None
        } else {
            debug!(identifier, limit, "Rate limit exceeded");
            Some(ceil_secs(reset_after))
        };

        RateLimitResult {
            allowed: hit.admitted,
            limit,
            remaining: limit.saturating_sub(hit.count),
            reset_after,
            retry_after,
        }
    }

    /// Forget every request recorded for `identifier`
    pub async fn reset(&self, identifier: &str) -> bool {
        let key = Self::key(identifier);
        let local = self.fallback.reset(&key).await.unwrap_or(false);
        match self.store.reset(&key).await {
            Ok(removed) => removed || local,
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "Rate store reset failed");
                false
            }
        }
    }
}
