//! Namespaced key/value cache with TTL and a degrading remote backend.
//!
//! Keys are laid out as `verifact:<namespace>:<key>`, with `%` and `:`
//! percent-encoded in the namespace so one namespace is never a prefix of
//! another. Composite keys are
//! serialized canonically (object fields sorted) and hashed with SHA-256, so
//! equal logical requests map to the same entry regardless of field order.
//!
//! When a remote [`CacheBackend`] is configured every operation goes there
//! first. Any backend error is logged and the operation is served from the
//! in-process [`LocalStore`] instead; callers never see a cache failure.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapters::SqliteStore;

/// Prefix shared by every cache key
pub const KEY_PREFIX: &str = "verifact";

/// Well-known namespaces
pub mod namespaces {
    pub const CLAIMS: &str = "claims";
    pub const ENTITIES: &str = "entities";
    pub const SEARCH_RESULTS: &str = "search_results";
    pub const MODEL_RESPONSES: &str = "model_responses";
    pub const EVIDENCE: &str = "evidence";
}

const SHARD_COUNT: usize = 16;

static SHARED: OnceLock<Arc<Cache>> = OnceLock::new();

/// Errors raised by a cache backend
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Byte-oriented store behind the cache (shared across processes)
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete every key starting with `prefix`, returning how many went
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

/// Which backend the shared cache uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    /// In-process only
    Memory,

    /// SQLite file under the verifact home directory
    Sqlite,
}

impl Default for CacheBackendKind {
    fn default() -> Self {
        Self::Memory
    }
}

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,

    #[serde(default)]
    pub backend: CacheBackendKind,

    /// Bound on the in-process map
    #[serde(default = "default_max_local_entries")]
    pub max_local_entries: usize,
}

fn default_enabled() -> bool {
    true
}
fn default_ttl() -> u64 {
    3600
}
fn default_max_local_entries() -> usize {
    1000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_ttl_seconds: default_ttl(),
            backend: CacheBackendKind::default(),
            max_local_entries: default_max_local_entries(),
        }
    }
}

/// Hash a key. Plain strings are used as-is.
pub fn hash_key<K: Serialize + ?Sized>(key: &K) -> Result<String, serde_json::Error> {
    match serde_json::to_value(key)? {
        Value::String(s) => Ok(s),
        value => {
            let digest = Sha256::digest(canonical_json(&value).as_bytes());
            Ok(hex::encode(digest))
        }
    }
}

/// Serialize with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Namespace segment with the key separator escaped
fn encode_namespace(namespace: &str) -> String {
    let mut encoded = String::with_capacity(namespace.len());
    for c in namespace.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            ':' => encoded.push_str("%3A"),
            c => encoded.push(c),
        }
    }
    encoded
}

/// Full storage key for a namespace and an already hashed key
pub fn namespaced_key(namespace: &str, hashed: &str) -> String {
    format!("{}{}", namespace_prefix(namespace), hashed)
}

fn namespace_prefix(namespace: &str) -> String {
    format!("{}:{}:", KEY_PREFIX, encode_namespace(namespace))
}

/// A stored value and its expiry. Never leaves this module.
#[derive(Debug, Clone)]
struct CacheEntry {
    key: String,
    value: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<String, CacheEntry>,
    /// Insertion order, oldest first
    order: VecDeque<String>,
}

impl Shard {
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| !e.is_live(now))
            .map(|e| e.key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }
}

/// Bounded in-process map with TTL expiry and insertion-order eviction.
///
/// Locks are sharded by key hash so writers to unrelated keys do not
/// contend.
#[derive(Debug)]
pub struct LocalStore {
    shards: Vec<Mutex<Shard>>,
    per_shard_capacity: usize,
}

impl LocalStore {
    pub fn new(max_entries: usize) -> Self {
        let per_shard_capacity = max_entries.div_ceil(SHARD_COUNT).max(1);
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(Shard::default())).collect(),
            per_shard_capacity,
        }
    }

    fn shard(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();
        match shard.entries.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                shard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let now = Instant::now();
        let mut shard = self.shard(key).lock();

        shard.remove(key);
        if shard.entries.len() >= self.per_shard_capacity {
            shard.purge_expired(now);
        }
        while shard.entries.len() >= self.per_shard_capacity {
            match shard.order.pop_front() {
                Some(oldest) => {
                    shard.entries.remove(&oldest);
                }
                None => break,
            }
        }

        shard.order.push_back(key.to_string());
        shard.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.shard(key).lock().remove(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove every key under `prefix`, one shard at a time
    pub fn delete_prefix(&self, prefix: &str) -> u64 {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let keys: Vec<String> = shard
                .entries
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            for key in keys {
                if shard.remove(&key) {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Live and not-yet-purged entries
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new(default_max_local_entries())
    }
}

/// Namespaced cache with TTL and remote-then-local degradation
pub struct Cache {
    enabled: bool,
    default_ttl: Duration,
    local: LocalStore,
    remote: Option<Arc<dyn CacheBackend>>,
}

impl Cache {
    /// In-process cache using the given settings
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            default_ttl: Duration::from_secs(settings.default_ttl_seconds),
            local: LocalStore::new(settings.max_local_entries),
            remote: None,
        }
    }

    /// In-process cache with default settings
    pub fn in_memory() -> Self {
        Self::new(&CacheSettings::default())
    }

    /// Route operations through a remote backend first
    pub fn with_remote(mut self, remote: Arc<dyn CacheBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Build from settings, opening the SQLite store under `home` if asked.
    /// A store that cannot be opened degrades to in-process only.
    pub fn from_settings(settings: &CacheSettings, home: &Path) -> Self {
        let cache = Self::new(settings);
        match settings.backend {
            CacheBackendKind::Memory => cache,
            CacheBackendKind::Sqlite => {
                let path = home.join("cache.db");
                match SqliteStore::open(&path) {
                    Ok(store) => cache.with_remote(Arc::new(store)),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to open cache store, using in-memory cache");
                        cache
                    }
                }
            }
        }
    }

    /// Process-wide cache built from the global configuration
    pub fn shared() -> Arc<Cache> {
        SHARED
            .get_or_init(|| match crate::config::config() {
                Ok(cfg) => Arc::new(Self::from_settings(&cfg.cache, &cfg.home)),
                Err(e) => {
                    warn!(error = %e, "Configuration unavailable, using default cache settings");
                    Arc::new(Self::in_memory())
                }
            })
            .clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Handle bound to one namespace
    pub fn namespace(self: &Arc<Self>, namespace: impl Into<String>) -> NamespacedCache {
        NamespacedCache {
            cache: Arc::clone(self),
            namespace: namespace.into(),
        }
    }

    fn storage_key<K: Serialize + ?Sized>(&self, namespace: &str, key: &K) -> Option<String> {
        match hash_key(key) {
            Ok(hashed) => Some(namespaced_key(namespace, &hashed)),
            Err(e) => {
                warn!(namespace, error = %e, "Cache key could not be serialized");
                None
            }
        }
    }

    /// Look up a value; any failure is a miss
    pub async fn get<K, V>(&self, namespace: &str, key: &K) -> Option<V>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        if !self.enabled {
            return None;
        }
        let storage_key = self.storage_key(namespace, key)?;

        let mut bytes = None;
        if let Some(ref remote) = self.remote {
            match remote.get(&storage_key).await {
                Ok(found) => bytes = found,
                Err(e) => {
                    warn!(backend = remote.name(), error = %e, "Cache get failed, using local store")
                }
            }
        }
        let bytes = match bytes {
            Some(b) => b,
            None => self.local.get(&storage_key)?,
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => {
                debug!(key = %storage_key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Cached value could not be decoded");
                None
            }
        }
    }

    /// Store a value; `ttl` defaults to the configured TTL
    pub async fn set<K, V>(&self, namespace: &str, key: &K, value: &V, ttl: Option<Duration>) -> bool
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        if !self.enabled {
            return false;
        }
        let Some(storage_key) = self.storage_key(namespace, key) else {
            return false;
        };
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Value could not be encoded for cache");
                return false;
            }
        };
        let ttl = ttl.unwrap_or(self.default_ttl);

        if let Some(ref remote) = self.remote {
            match remote.set(&storage_key, bytes.clone(), ttl).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(backend = remote.name(), error = %e, "Cache set failed, using local store")
                }
            }
        }
        self.local.set(&storage_key, bytes, ttl);
        true
    }

    /// Remove a key from both stores
    pub async fn delete<K: Serialize + ?Sized>(&self, namespace: &str, key: &K) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(storage_key) = self.storage_key(namespace, key) else {
            return false;
        };

        let mut remote_deleted = false;
        if let Some(ref remote) = self.remote {
            match remote.delete(&storage_key).await {
                Ok(deleted) => remote_deleted = deleted,
                Err(e) => warn!(backend = remote.name(), error = %e, "Cache delete failed"),
            }
        }
        let local_deleted = self.local.delete(&storage_key);
        local_deleted || remote_deleted
    }

    /// Remove every key under a namespace. Returns false if the remote
    /// backend failed; the local store is cleared regardless.
    pub async fn clear_namespace(&self, namespace: &str) -> bool {
        let prefix = namespace_prefix(namespace);

        let mut ok = true;
        if let Some(ref remote) = self.remote {
            if let Err(e) = remote.delete_prefix(&prefix).await {
                warn!(backend = remote.name(), namespace, error = %e, "Cache clear failed");
                ok = false;
            }
        }
        let removed = self.local.delete_prefix(&prefix);
        debug!(namespace, removed, "Cleared local cache namespace");
        ok
    }

    pub async fn exists<K: Serialize + ?Sized>(&self, namespace: &str, key: &K) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(storage_key) = self.storage_key(namespace, key) else {
            return false;
        };

        if let Some(ref remote) = self.remote {
            match remote.exists(&storage_key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(backend = remote.name(), error = %e, "Cache exists failed"),
            }
        }
        self.local.exists(&storage_key)
    }
}

/// A cache handle bound to one namespace
#[derive(Clone)]
pub struct NamespacedCache {
    cache: Arc<Cache>,
    namespace: String,
}

impl NamespacedCache {
    pub fn name(&self) -> &str {
        &self.namespace
    }

    pub async fn get<K, V>(&self, key: &K) -> Option<V>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        self.cache.get(&self.namespace, key).await
    }

    pub async fn set<K, V>(&self, key: &K, value: &V, ttl: Option<Duration>) -> bool
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        self.cache.set(&self.namespace, key, value, ttl).await
    }

    pub async fn delete<K: Serialize + ?Sized>(&self, key: &K) -> bool {
        self.cache.delete(&self.namespace, key).await
    }

    pub async fn exists<K: Serialize + ?Sized>(&self, key: &K) -> bool {
        self.cache.exists(&self.namespace, key).await
    }

    pub async fn clear(&self) -> bool {
        self.cache.clear_namespace(&self.namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<u64, CacheError> {
            Err(CacheError::Backend("connection refused".into()))
        }
    }

    #[test]
    fn test_hash_key_is_order_independent() {
        let a = hash_key(&json!({"model": "m", "messages": ["hi"], "temperature": 0.1})).unwrap();
        let b = hash_key(&json!({"temperature": 0.1, "messages": ["hi"], "model": "m"})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_namespace_segment_is_escaped() {
        assert_eq!(namespaced_key("claims", "k"), "verifact:claims:k");
        assert_eq!(namespaced_key("a:b", "c"), "verifact:a%3Ab:c");
        assert_ne!(namespaced_key("a", "b:c"), namespaced_key("a:b", "c"));
        assert!(!namespaced_key("a:b", "k").starts_with(&namespace_prefix("a")));
        assert_ne!(namespace_prefix("a%3Ab"), namespace_prefix("a:b"));
    }

    #[test]
    fn test_hash_key_passes_strings_through() {
        assert_eq!(hash_key("plain-key").unwrap(), "plain-key");
        assert_ne!(hash_key(&("a", 1)).unwrap(), hash_key(&("a", 2)).unwrap());
    }

    #[test]
    fn test_local_store_evicts_oldest() {
        // One entry per shard so that same-shard inserts evict
        let store = LocalStore::new(1);
        let ttl = Duration::from_secs(60);

        store.set("k1", b"1".to_vec(), ttl);
        store.set("k1", b"2".to_vec(), ttl);
        assert_eq!(store.get("k1"), Some(b"2".to_vec()));

        for i in 0..100 {
            store.set(&format!("key-{}", i), vec![i as u8], ttl);
        }
        assert!(store.len() <= SHARD_COUNT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_store_expiry() {
        let store = LocalStore::default();
        store.set("k", b"v".to_vec(), Duration::from_secs(10));
        assert!(store.exists("k"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.exists("k"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_broken_remote_degrades_to_local() {
        let cache = Cache::in_memory().with_remote(Arc::new(BrokenBackend));

        assert!(cache.set("claims", "k", &json!({"a": 1}), None).await);
        let value: Option<serde_json::Value> = cache.get("claims", "k").await;
        assert_eq!(value, Some(json!({"a": 1})));
        assert!(cache.exists("claims", "k").await);
        assert!(cache.delete("claims", "k").await);
        assert!(!cache.exists("claims", "k").await);
        // Remote failure is reported but local clear still happens
        assert!(!cache.clear_namespace("claims").await);
    }

    #[tokio::test]
    async fn test_disabled_cache_is_a_no_op() {
        let cache = Cache::new(&CacheSettings {
            enabled: false,
            ..Default::default()
        });
        assert!(!cache.set("claims", "k", &1u32, None).await);
        assert_eq!(cache.get::<_, u32>("claims", "k").await, None);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_a_miss() {
        let cache = Cache::in_memory();
        cache.set("claims", "k", "not a number", None).await;
        assert_eq!(cache.get::<_, u32>("claims", "k").await, None);
    }

    #[tokio::test]
    async fn test_namespaced_handle() {
        let cache = Arc::new(Cache::in_memory());
        let claims = cache.namespace(namespaces::CLAIMS);
        let evidence = cache.namespace(namespaces::EVIDENCE);

        claims.set("k", &1u32, None).await;
        evidence.set("k", &2u32, None).await;

        assert_eq!(claims.get::<_, u32>("k").await, Some(1));
        assert_eq!(evidence.get::<_, u32>("k").await, Some(2));

        assert!(claims.clear().await);
        assert!(!claims.exists("k").await);
        assert!(evidence.exists("k").await);
    }
}
