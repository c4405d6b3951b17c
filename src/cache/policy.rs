//! Cache eviction strategy, TTL resolution, and auto-refresh policy.
//!
//! A [`CachePolicy`] is immutable for the lifetime of a cache, built with
//! [`CachePolicyBuilder`] the way the teacher builds
//! `rate_limiter::Config`/`RateLimiterBuilder`.

use std::collections::HashMap;
use std::time::Duration;

use crate::cache::entry::CacheEntry;

/// Ordering used to pick eviction victims.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Evict ascending `last_accessed` — least recently used first.
    Lru,
    /// Evict ascending `access_count` — least frequently used first.
    Lfu,
    /// Evict ascending `created_at` — oldest first.
    Fifo,
}

#[derive(Clone, Debug)]
pub struct CachePolicy {
    pub max_bytes: Option<usize>,
    pub max_items: Option<usize>,
    pub default_ttl: Option<Duration>,
    pub eviction_strategy: EvictionStrategy,
    pub auto_refresh_enabled: bool,
    pub refresh_threshold: f64,
    /// Per-plugin item caps, distinct from `per_operation_ttl`. The source
    /// this fabric replaces conflates per-plugin and per-operation TTL
    /// lookups into a single map (`CachePolicy.get_ttl` checks
    /// `"plugin:op"` then falls back to checking `plugin_name` against the
    /// *same* map); this port treats them as the two distinct maps the spec
    /// calls for.
    pub per_plugin_limits: HashMap<String, usize>,
    pub per_plugin_ttl: HashMap<String, Duration>,
    pub per_operation_ttl: HashMap<String, Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        CachePolicy {
            max_bytes: None,
            max_items: Some(10_000),
            default_ttl: Some(Duration::from_secs(3600)),
            eviction_strategy: EvictionStrategy::Lru,
            auto_refresh_enabled: false,
            refresh_threshold: 0.8,
            per_plugin_limits: HashMap::new(),
            per_plugin_ttl: HashMap::new(),
            per_operation_ttl: HashMap::new(),
        }
    }
}

impl CachePolicy {
    pub fn builder() -> CachePolicyBuilder {
        CachePolicyBuilder::new()
    }

    /// TTL resolution order: per-operation override (`"plugin:operation"`)
    /// → per-plugin override (`"plugin"`) → policy default → none.
    pub fn resolve_ttl(&self, plugin_name: &str, operation: &str) -> Option<Duration> {
        let combined = format!("{plugin_name}:{operation}");
        if let Some(ttl) = self.per_operation_ttl.get(&combined) {
            return Some(*ttl);
        }
        if let Some(ttl) = self.per_plugin_ttl.get(plugin_name) {
            return Some(*ttl);
        }
        self.default_ttl
    }

    pub fn plugin_limit(&self, plugin_name: &str) -> Option<usize> {
        self.per_plugin_limits.get(plugin_name).copied()
    }

    /// `should_refresh(entry) ≡ auto_refresh_enabled ∧ expires_at set ∧
    /// (now − created_at) / (expires_at − created_at) > refresh_threshold`.
    pub fn should_refresh(&self, entry: &CacheEntry) -> bool {
        if !self.auto_refresh_enabled {
            return false;
        }
        let Some(expires_at) = entry.expires_at else {
            return false;
        };
        let ttl = expires_at - entry.created_at;
        if ttl <= 0.0 {
            return false;
        }
        let elapsed = entry.age();
        elapsed / ttl > self.refresh_threshold
    }
}

#[derive(Default)]
pub struct CachePolicyBuilder(CachePolicy);

impl CachePolicyBuilder {
    pub fn new() -> Self {
        Self(CachePolicy::default())
    }
    pub fn max_bytes(mut self, n: usize) -> Self {
        self.0.max_bytes = Some(n);
        self
    }
    pub fn max_items(mut self, n: usize) -> Self {
        self.0.max_items = Some(n);
        self
    }
    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.0.default_ttl = ttl;
        self
    }
    pub fn eviction_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.0.eviction_strategy = strategy;
        self
    }
    pub fn auto_refresh(mut self, enabled: bool, threshold: f64) -> Self {
        self.0.auto_refresh_enabled = enabled;
        self.0.refresh_threshold = threshold;
        self
    }
    pub fn per_plugin_limit(mut self, plugin: impl Into<String>, limit: usize) -> Self {
        self.0.per_plugin_limits.insert(plugin.into(), limit);
        self
    }
    pub fn per_plugin_ttl(mut self, plugin: impl Into<String>, ttl: Duration) -> Self {
        self.0.per_plugin_ttl.insert(plugin.into(), ttl);
        self
    }
    pub fn per_operation_ttl(mut self, plugin_operation: impl Into<String>, ttl: Duration) -> Self {
        self.0.per_operation_ttl.insert(plugin_operation.into(), ttl);
        self
    }
    pub fn build(self) -> CachePolicy {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::CacheKey;
    use crate::value::{Params, Value};

    #[test]
    fn ttl_resolution_prefers_operation_over_plugin_over_default() {
        let policy = CachePolicy::builder()
            .default_ttl(Some(Duration::from_secs(10)))
            .per_plugin_ttl("p", Duration::from_secs(20))
            .per_operation_ttl("p:op", Duration::from_secs(30))
            .build();

        assert_eq!(policy.resolve_ttl("p", "op"), Some(Duration::from_secs(30)));
        assert_eq!(policy.resolve_ttl("p", "other"), Some(Duration::from_secs(20)));
        assert_eq!(policy.resolve_ttl("q", "op"), Some(Duration::from_secs(10)));
    }

    #[test]
    fn should_refresh_respects_threshold_and_flag() {
        let policy = CachePolicy::builder().auto_refresh(true, 0.5).build();
        let key = CacheKey::new("p", "op", Params::new());
        let mut entry = CacheEntry::new(key, Value::Int(1), Some(Duration::from_millis(20)));
        assert!(!policy.should_refresh(&entry));
        std::thread::sleep(Duration::from_millis(15));
        assert!(policy.should_refresh(&entry));

        entry.expires_at = None;
        assert!(!policy.should_refresh(&entry));
    }

    #[test]
    fn should_refresh_false_when_disabled() {
        let policy = CachePolicy::builder().auto_refresh(false, 0.1).build();
        let key = CacheKey::new("p", "op", Params::new());
        let entry = CacheEntry::new(key, Value::Int(1), Some(Duration::from_millis(1)));
        assert!(!policy.should_refresh(&entry));
    }
}
