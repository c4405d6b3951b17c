//! Cache entries: the payload plus its lifecycle metadata.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::key::CacheKey;
use crate::value::Value;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A cached response plus the bookkeeping the cache needs to evict, refresh,
/// and report on it.
///
/// Invariants (enforced by construction and by [`CacheEntry::access`]):
/// `last_accessed >= created_at`; `access_count >= 1` after any successful
/// read; `expires_at`, if set, equals `created_at + ttl`.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data: Value,
    pub created_at: f64,
    pub expires_at: Option<f64>,
    pub last_accessed: f64,
    pub access_count: u64,
    pub byte_size: usize,
}

impl CacheEntry {
    pub fn new(key: CacheKey, data: Value, ttl: Option<Duration>) -> Self {
        let created_at = now_secs();
        let byte_size = Self::estimate_size(&data);
        CacheEntry {
            expires_at: ttl.map(|d| created_at + d.as_secs_f64()),
            last_accessed: created_at,
            access_count: 0,
            byte_size,
            created_at,
            key,
            data,
        }
    }

    /// Approximate serialized size of the payload, frozen at construction.
    /// Falls back to a string-length estimate if the value can't be
    /// serialized, matching the "serialization failures fall back to a
    /// string-length estimate" failure semantics.
    fn estimate_size(data: &Value) -> usize {
        match serde_json::to_vec(&data.to_json()) {
            Ok(bytes) => bytes.len(),
            Err(_) => format!("{data:?}").len(),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => now_secs() > expires_at,
            None => false,
        }
    }

    /// Records a read: bumps `last_accessed` and `access_count`.
    pub fn access(&mut self) {
        self.last_accessed = now_secs();
        self.access_count += 1;
    }

    pub fn age(&self) -> f64 {
        now_secs() - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Params;

    #[test]
    fn fresh_entry_is_not_expired_without_ttl() {
        let key = CacheKey::new("p", "op", Params::new());
        let entry = CacheEntry::new(key, Value::Str("x".into()), None);
        assert!(!entry.is_expired());
        assert_eq!(entry.access_count, 0);
    }

    #[test]
    fn access_bumps_counters() {
        let key = CacheKey::new("p", "op", Params::new());
        let mut entry = CacheEntry::new(key, Value::Int(1), None);
        entry.access();
        entry.access();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_accessed >= entry.created_at);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let key = CacheKey::new("p", "op", Params::new());
        let entry = CacheEntry::new(key, Value::Int(1), Some(Duration::from_secs(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(entry.is_expired());
    }
}
