//! TTL-scoped response cache with eviction policy and optional disk
//! persistence (§4.1).

pub mod entry;
pub mod key;
pub mod persist;
pub mod policy;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::gateway::RefreshHandler;
use crate::value::{Params, Value};

pub use entry::CacheEntry;
pub use key::CacheKey;
pub use policy::{CachePolicy, EvictionStrategy};

/// Outcome of [`ResponseCache::get`].
#[derive(Debug)]
pub struct GetResult {
    pub hit: bool,
    pub data: Option<Value>,
    pub needs_refresh: bool,
    pub metadata: BTreeMap<String, Value>,
}

/// Outcome of [`ResponseCache::put`].
#[derive(Debug)]
pub struct PutResult {
    pub key_hash: String,
    pub metadata: BTreeMap<String, Value>,
}

/// Outcome of [`ResponseCache::refresh`].
pub type RefreshResult = Result<PutResult, CacheError>;

/// Counters plus derived ratios, returned by [`ResponseCache::get_stats`].
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired_hits: u64,
    pub refreshes: u64,
    pub evictions: u64,
    pub bytes_stored: u64,
    pub entry_count: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn miss_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        }
    }
}

struct Inner {
    entries: HashMap<[u8; 32], CacheEntry>,
    stats: CacheStats,
    total_inserts: u64,
}

/// The response cache. Cheap to clone — internal state is `Arc`-shared, the
/// way `tako`'s plugins clone a `Config` but share a `DashMap`-backed store.
#[derive(Clone)]
pub struct ResponseCache {
    policy: Arc<CachePolicy>,
    config: CacheConfig,
    inner: Arc<Mutex<Inner>>,
    refresh_handlers: Arc<Mutex<HashMap<String, Arc<dyn RefreshHandler>>>>,
}

impl ResponseCache {
    /// Builds a cache from `config`, loading any persisted entries from disk
    /// if `config.persist_cache` is set.
    pub fn new(config: CacheConfig) -> Self {
        let policy = Arc::new(config.policy.clone());
        let mut entries = HashMap::new();
        let mut bytes_stored: u64 = 0;

        if config.persist_cache {
            for entry in persist::load_dir(&config.cache_dir) {
                bytes_stored += entry.byte_size as u64;
                entries.insert(entry.key.hash(), entry);
            }
        }

        debug!(loaded = entries.len(), "cache initialized");

        ResponseCache {
            policy,
            config,
            inner: Arc::new(Mutex::new(Inner {
                stats: CacheStats {
                    bytes_stored,
                    entry_count: entries.len(),
                    ..Default::default()
                },
                entries,
                total_inserts: 0,
            })),
            refresh_handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[instrument(skip(self, params), fields(plugin, operation))]
    pub fn get(&self, plugin: &str, operation: &str, params: Params, bypass: bool) -> GetResult {
        if bypass {
            return GetResult {
                hit: false,
                data: None,
                needs_refresh: false,
                metadata: metadata_bool("bypass_cache", true),
            };
        }

        let key = CacheKey::new(plugin, operation, params);
        let hash = key.hash();

        let mut inner_guard = self.inner.lock();
        let inner = &mut *inner_guard;
        let Some(entry) = inner.entries.get_mut(&hash) else {
            inner.stats.misses += 1;
            return GetResult {
                hit: false,
                data: None,
                needs_refresh: false,
                metadata: metadata_str("key_hash", key.hex()),
            };
        };

        if entry.is_expired() {
            inner.stats.expired_hits += 1;
            let refreshable = self.policy.should_refresh(entry) && self.can_refresh(&key.plugin_name);
            if refreshable {
                entry.access();
                let data = entry.data.clone();
                let meta = entry_metadata(entry, Some(true), Some(true));
                return GetResult {
                    hit: true,
                    data: Some(data),
                    needs_refresh: true,
                    metadata: meta,
                };
            }
            self.remove_locked(inner, hash);
            inner.stats.misses += 1;
            return GetResult {
                hit: false,
                data: None,
                needs_refresh: false,
                metadata: metadata_str("key_hash", key.hex()),
            };
        }

        entry.access();
        inner.stats.hits += 1;
        let data = entry.data.clone();
        let meta = entry_metadata(entry, None, None);
        GetResult {
            hit: true,
            data: Some(data),
            needs_refresh: false,
            metadata: meta,
        }
    }

    #[instrument(skip(self, params, data), fields(plugin, operation))]
    pub fn put(&self, plugin: &str, operation: &str, params: Params, data: Value, ttl: Option<std::time::Duration>) -> PutResult {
        let key = CacheKey::new(plugin, operation, params);
        let ttl = ttl.or_else(|| self.policy.resolve_ttl(plugin, operation));

        let mut inner = self.inner.lock();
        self.enforce_limits_locked(&mut inner, plugin);

        let entry = CacheEntry::new(key.clone(), data, ttl);
        let hash = key.hash();

        if let Some(old) = inner.entries.get(&hash) {
            inner.stats.bytes_stored = inner.stats.bytes_stored.saturating_sub(old.byte_size as u64);
        }
        inner.stats.bytes_stored += entry.byte_size as u64;
        inner.total_inserts += 1;

        if self.config.persist_cache {
            if let Err(e) = persist::persist_entry(&self.config.cache_dir, &entry) {
                warn!(error = %e, "failed to persist cache entry");
            }
        }

        let meta = entry_metadata(&entry, None, None);
        inner.entries.insert(hash, entry);
        inner.stats.entry_count = inner.entries.len();

        PutResult {
            key_hash: key.hex(),
            metadata: meta,
        }
    }

    /// Registers a refresh handler for `plugin`. Absence disables
    /// auto-refresh for that plugin.
    pub fn register_refresh_handler(&self, plugin: impl Into<String>, handler: Arc<dyn RefreshHandler>) {
        self.refresh_handlers.lock().insert(plugin.into(), handler);
    }

    pub fn unregister_refresh_handler(&self, plugin: &str) -> bool {
        self.refresh_handlers.lock().remove(plugin).is_some()
    }

    fn can_refresh(&self, plugin: &str) -> bool {
        self.refresh_handlers.lock().contains_key(plugin)
    }

    /// Refreshes a cached entry through its plugin's registered handler.
    /// The handler is invoked after the entry is cloned out and the lock is
    /// released — handlers must never re-enter the cache, but the cache
    /// never holds its mutex across the call regardless.
    pub async fn refresh(&self, plugin: &str, operation: &str, params: Params, force: bool) -> RefreshResult {
        let key = CacheKey::new(plugin, operation, params.clone());
        let hash = key.hash();

        let (old_data, handler) = {
            let inner = self.inner.lock();
            let entry = inner.entries.get(&hash).ok_or(CacheError::EntryNotFound)?;
            if !force && !entry.is_expired() && !self.policy.should_refresh(entry) {
                return Err(CacheError::RefreshNotNeeded);
            }
            let handler = self
                .refresh_handlers
                .lock()
                .get(plugin)
                .cloned()
                .ok_or_else(|| CacheError::NoRefreshHandler(plugin.to_string()))?;
            (entry.data.clone(), handler)
        };

        let result = handler.refresh(operation, &params, &old_data).await;
        if !result.success {
            return Err(CacheError::RefreshHandlerFailed(
                result.error.unwrap_or_else(|| "refresh handler failed".to_string()),
            ));
        }

        self.inner.lock().stats.refreshes += 1;
        let new_data = result.data.unwrap_or(Value::Null);
        Ok(self.put(plugin, operation, params, new_data, None))
    }

    /// Removes entries matching the given filters conjunctively. All three
    /// present is a point lookup; otherwise a full scan.
    pub fn invalidate(&self, plugin: Option<&str>, operation: Option<&str>, params: Option<&Params>) -> Vec<String> {
        let mut inner = self.inner.lock();

        if let (Some(plugin), Some(operation), Some(params)) = (plugin, operation, params) {
            let key = CacheKey::new(plugin, operation, params.clone());
            let hash = key.hash();
            return if inner.entries.contains_key(&hash) {
                self.remove_locked(&mut inner, hash);
                vec![key.hex()]
            } else {
                Vec::new()
            };
        }

        let to_remove: Vec<[u8; 32]> = inner
            .entries
            .values()
            .filter(|entry| {
                if let Some(plugin) = plugin {
                    if entry.key.plugin_name != plugin {
                        return false;
                    }
                }
                if let Some(operation) = operation {
                    if entry.key.operation != operation {
                        return false;
                    }
                }
                if let Some(params) = params {
                    for (k, v) in params {
                        if entry.key.parameters.get(k) != Some(v) {
                            return false;
                        }
                    }
                }
                true
            })
            .map(|entry| entry.key.hash())
            .collect();

        let mut removed = Vec::with_capacity(to_remove.len());
        for hash in to_remove {
            removed.push(hex::encode(hash));
            self.remove_locked(&mut inner, hash);
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.stats.bytes_stored = 0;
        inner.stats.entry_count = 0;
        if self.config.persist_cache {
            if let Err(e) = persist::clear_dir(&self.config.cache_dir) {
                warn!(error = %e, "failed to clear disk cache");
            }
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    pub fn get_all_entries(&self) -> Vec<CacheEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Rewrites the disk cache from the current in-memory set.
    pub fn compact(&self) -> Result<usize, CacheError> {
        if !self.config.persist_cache {
            return Err(CacheError::PersistenceDisabled);
        }
        let entries: Vec<CacheEntry> = self.inner.lock().entries.values().cloned().collect();
        persist::compact(&self.config.cache_dir, &entries).map_err(|e| {
            warn!(error = %e, "disk compaction failed");
            CacheError::PersistenceDisabled
        })
    }

    fn remove_locked(&self, inner: &mut Inner, hash: [u8; 32]) {
        if let Some(entry) = inner.entries.remove(&hash) {
            inner.stats.bytes_stored = inner.stats.bytes_stored.saturating_sub(entry.byte_size as u64);
            inner.stats.entry_count = inner.entries.len();
            if self.config.persist_cache {
                if let Err(e) = persist::remove_entry(&self.config.cache_dir, &hex::encode(hash)) {
                    warn!(error = %e, "failed to remove persisted cache entry");
                }
            }
        }
    }

    /// On each `put`: if `item_count >= max_items` evict one entry; if
    /// `bytes_stored >= max_bytes` evict until 20% of `max_bytes` is
    /// reclaimed. Per-plugin item caps are enforced the same way against
    /// that plugin's own entry count.
    fn enforce_limits_locked(&self, inner: &mut Inner, plugin: &str) {
        if let Some(max_items) = self.policy.max_items {
            if inner.entries.len() >= max_items {
                self.evict_n_locked(inner, 1);
            }
        }
        if let Some(max_bytes) = self.policy.max_bytes {
            if inner.stats.bytes_stored >= max_bytes as u64 {
                let to_free = (inner.stats.bytes_stored as f64 * 0.2) as u64;
                self.evict_bytes_locked(inner, to_free);
            }
        }
        if let Some(plugin_limit) = self.policy.plugin_limit(plugin) {
            let plugin_count = inner.entries.values().filter(|e| e.key.plugin_name == plugin).count();
            if plugin_count >= plugin_limit {
                self.evict_n_for_plugin_locked(inner, plugin, 1);
            }
        }
    }

    fn sorted_victims(&self, inner: &Inner) -> Vec<[u8; 32]> {
        let mut entries: Vec<&CacheEntry> = inner.entries.values().collect();
        self.sort_by_strategy(&mut entries);
        entries.iter().map(|e| e.key.hash()).collect()
    }

    fn sort_by_strategy(&self, entries: &mut [&CacheEntry]) {
        match self.policy.eviction_strategy {
            EvictionStrategy::Lru => entries.sort_by(|a, b| {
                a.last_accessed
                    .partial_cmp(&b.last_accessed)
                    .unwrap()
                    .then(a.created_at.partial_cmp(&b.created_at).unwrap())
            }),
            EvictionStrategy::Lfu => entries.sort_by(|a, b| {
                a.access_count
                    .cmp(&b.access_count)
                    .then(a.created_at.partial_cmp(&b.created_at).unwrap())
            }),
            EvictionStrategy::Fifo => {
                entries.sort_by(|a, b| a.created_at.partial_cmp(&b.created_at).unwrap())
            }
        }
    }

    fn evict_n_locked(&self, inner: &mut Inner, count: usize) {
        let victims = self.sorted_victims(inner);
        for hash in victims.into_iter().take(count) {
            self.remove_locked(inner, hash);
            inner.stats.evictions += 1;
        }
    }

    fn evict_bytes_locked(&self, inner: &mut Inner, bytes_to_free: u64) {
        let victims = self.sorted_victims(inner);
        let mut freed = 0u64;
        for hash in victims {
            if freed >= bytes_to_free {
                break;
            }
            if let Some(entry) = inner.entries.get(&hash) {
                freed += entry.byte_size as u64;
            }
            self.remove_locked(inner, hash);
            inner.stats.evictions += 1;
        }
    }

    fn evict_n_for_plugin_locked(&self, inner: &mut Inner, plugin: &str, count: usize) {
        let mut entries: Vec<&CacheEntry> = inner
            .entries
            .values()
            .filter(|e| e.key.plugin_name == plugin)
            .collect();
        self.sort_by_strategy(&mut entries);
        let victims: Vec<[u8; 32]> = entries.iter().take(count).map(|e| e.key.hash()).collect();
        for hash in victims {
            self.remove_locked(inner, hash);
            inner.stats.evictions += 1;
        }
    }
}

fn entry_metadata(entry: &CacheEntry, is_stale: Option<bool>, needs_refresh: Option<bool>) -> BTreeMap<String, Value> {
    let mut meta = BTreeMap::new();
    meta.insert("key_hash".to_string(), Value::Str(entry.key.hex()));
    meta.insert("plugin_name".to_string(), Value::Str(entry.key.plugin_name.clone()));
    meta.insert("operation".to_string(), Value::Str(entry.key.operation.clone()));
    meta.insert("created_at".to_string(), Value::Float(entry.created_at));
    meta.insert(
        "expires_at".to_string(),
        entry.expires_at.map(Value::Float).unwrap_or(Value::Null),
    );
    meta.insert("last_accessed".to_string(), Value::Float(entry.last_accessed));
    meta.insert("access_count".to_string(), Value::Int(entry.access_count as i64));
    meta.insert("byte_size".to_string(), Value::Int(entry.byte_size as i64));
    if let Some(is_stale) = is_stale {
        meta.insert("is_stale".to_string(), Value::Bool(is_stale));
    }
    if let Some(needs_refresh) = needs_refresh {
        meta.insert("needs_refresh".to_string(), Value::Bool(needs_refresh));
    }
    meta
}

fn metadata_bool(key: &str, value: bool) -> BTreeMap<String, Value> {
    BTreeMap::from([(key.to_string(), Value::Bool(value))])
}

fn metadata_str(key: &str, value: String) -> BTreeMap<String, Value> {
    BTreeMap::from([(key.to_string(), Value::Str(value))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfigBuilder;
    use crate::gateway::Envelope;
    use async_trait::async_trait;
    use std::time::Duration;

    fn cache_with(max_items: Option<usize>, strategy: EvictionStrategy) -> ResponseCache {
        let mut policy = CachePolicy::builder().eviction_strategy(strategy);
        if let Some(n) = max_items {
            policy = policy.max_items(n);
        }
        let dir = std::env::temp_dir().join(format!("api-fabric-cache-{}", uuid::Uuid::new_v4()));
        ResponseCache::new(
            CacheConfigBuilder::new()
                .policy(policy.build())
                .cache_dir(dir)
                .persist_cache(false)
                .build(),
        )
    }

    #[test]
    fn hit_after_miss() {
        let cache = cache_with(None, EvictionStrategy::Lru);
        let params = Params::new();

        let miss = cache.get("p", "op", params.clone(), false);
        assert!(!miss.hit);

        cache.put("p", "op", params.clone(), Value::Str("X".into()), None);
        let hit = cache.get("p", "op", params, false);
        assert!(hit.hit);
        assert_eq!(hit.data, Some(Value::Str("X".into())));
    }

    #[test]
    fn lru_eviction_keeps_recently_accessed() {
        let cache = cache_with(Some(2), EvictionStrategy::Lru);
        cache.put("p", "op", Params::from([("k".into(), Value::Int(1))]), Value::Int(1), None);
        cache.put("p", "op", Params::from([("k".into(), Value::Int(2))]), Value::Int(2), None);

        // touch k1 so it becomes most-recently-used
        let hit = cache.get("p", "op", Params::from([("k".into(), Value::Int(1))]), false);
        assert!(hit.hit);

        cache.put("p", "op", Params::from([("k".into(), Value::Int(3))]), Value::Int(3), None);

        let k1 = cache.get("p", "op", Params::from([("k".into(), Value::Int(1))]), false);
        let k2 = cache.get("p", "op", Params::from([("k".into(), Value::Int(2))]), false);
        let k3 = cache.get("p", "op", Params::from([("k".into(), Value::Int(3))]), false);
        assert!(k1.hit);
        assert!(!k2.hit);
        assert!(k3.hit);
    }

    #[test]
    fn bytes_stored_tracks_sum_of_entry_sizes() {
        let cache = cache_with(None, EvictionStrategy::Lru);
        cache.put("p", "op", Params::from([("k".into(), Value::Int(1))]), Value::Str("aaaa".into()), None);
        cache.put("p", "op", Params::from([("k".into(), Value::Int(2))]), Value::Str("bbbb".into()), None);

        let stats = cache.get_stats();
        let expected: u64 = cache.get_all_entries().iter().map(|e| e.byte_size as u64).sum();
        assert_eq!(stats.bytes_stored, expected);
    }

    #[test]
    fn evictions_plus_entry_count_tracks_total_inserts() {
        let cache = cache_with(Some(2), EvictionStrategy::Fifo);
        let total_inserts: i64 = 5;
        for i in 0..total_inserts {
            cache.put("p", "op", Params::from([("k".into(), Value::Int(i))]), Value::Int(i), None);
        }

        let stats = cache.get_stats();
        assert_eq!(stats.evictions + stats.entry_count as u64, total_inserts as u64);
    }

    #[test]
    fn invalidate_point_lookup_removes_exact_match() {
        let cache = cache_with(None, EvictionStrategy::Lru);
        let params = Params::from([("k".into(), Value::Int(1))]);
        cache.put("p", "op", params.clone(), Value::Int(1), None);

        let removed = cache.invalidate(Some("p"), Some("op"), Some(&params));
        assert_eq!(removed.len(), 1);
        assert!(!cache.get("p", "op", params, false).hit);
    }

    struct EchoRefresh;
    #[async_trait]
    impl RefreshHandler for EchoRefresh {
        async fn refresh(&self, _operation: &str, _params: &Params, _old_data: &Value) -> Envelope {
            Envelope::ok(Value::Str("refreshed".into()))
        }
    }

    #[tokio::test]
    async fn refresh_updates_entry_via_handler() {
        let cache = cache_with(None, EvictionStrategy::Lru);
        let params = Params::new();
        cache.put("p", "op", params.clone(), Value::Str("stale".into()), Some(Duration::from_secs(3600)));
        cache.register_refresh_handler("p", Arc::new(EchoRefresh));

        let result = cache.refresh("p", "op", params.clone(), true).await;
        assert!(result.is_ok());
        let hit = cache.get("p", "op", params, false);
        assert_eq!(hit.data, Some(Value::Str("refreshed".into())));
    }

    #[test]
    fn expired_without_auto_refresh_is_evicted_on_access() {
        let cache = cache_with(None, EvictionStrategy::Lru);
        let params = Params::new();
        cache.put("p", "op", params.clone(), Value::Int(1), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));

        let result = cache.get("p", "op", params, false);
        assert!(!result.hit);
        assert_eq!(cache.get_all_entries().len(), 0);
    }
}
