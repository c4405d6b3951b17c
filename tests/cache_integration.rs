use std::sync::Arc;
use std::time::Duration;

use api_fabric::cache::{CachePolicy, EvictionStrategy, ResponseCache};
use api_fabric::config::CacheConfigBuilder;
use api_fabric::gateway::test_util::{MockGateway, ScriptedCall};
use api_fabric::gateway::{Envelope, Gateway, RefreshHandler};
use api_fabric::value::{Params, Value};
use async_trait::async_trait;

fn temp_cache(policy: CachePolicy, persist: bool) -> ResponseCache {
    let dir = std::env::temp_dir().join(format!("api-fabric-it-cache-{}", uuid::Uuid::new_v4()));
    ResponseCache::new(
        CacheConfigBuilder::new()
            .policy(policy)
            .cache_dir(dir)
            .persist_cache(persist)
            .build(),
    )
}

#[test]
fn put_then_get_round_trips_value() {
    let cache = temp_cache(CachePolicy::default(), false);
    let params = Params::from([("symbol".to_string(), Value::Str("ACME".to_string()))]);
    cache.put("stocks", "quote", params.clone(), Value::Int(42), Some(Duration::from_secs(60)));

    let result = cache.get("stocks", "quote", params, false);
    assert!(result.hit);
    assert_eq!(result.data, Some(Value::Int(42)));
}

#[test]
fn persisted_cache_survives_reconstruction() {
    let dir = std::env::temp_dir().join(format!("api-fabric-it-persist-{}", uuid::Uuid::new_v4()));
    let config = CacheConfigBuilder::new().cache_dir(dir.clone()).persist_cache(true).build();

    {
        let cache = ResponseCache::new(config.clone());
        cache.put("weather", "current", Params::new(), Value::Str("sunny".to_string()), Some(Duration::from_secs(300)));
    }

    let reloaded = ResponseCache::new(config);
    let result = reloaded.get("weather", "current", Params::new(), false);
    assert!(result.hit);
    assert_eq!(result.data, Some(Value::Str("sunny".to_string())));
}

struct CountingRefresh {
    calls: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl RefreshHandler for CountingRefresh {
    async fn refresh(&self, _operation: &str, _params: &Params, _old_data: &Value) -> Envelope {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Envelope::ok(Value::Str("fresh".to_string()))
    }
}

#[tokio::test]
async fn forced_refresh_replaces_stale_value_via_handler() {
    let cache = temp_cache(CachePolicy::default(), false);
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    cache.register_refresh_handler("news", Arc::new(CountingRefresh { calls: calls.clone() }));

    let params = Params::new();
    cache.put("news", "headlines", params.clone(), Value::Str("stale".to_string()), Some(Duration::from_secs(3600)));

    let result = cache.refresh("news", "headlines", params.clone(), true).await;
    assert!(result.is_ok());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let hit = cache.get("news", "headlines", params, false);
    assert_eq!(hit.data, Some(Value::Str("fresh".to_string())));
}

#[test]
fn fifo_eviction_drops_oldest_regardless_of_access() {
    let cache = temp_cache(CachePolicy::builder().max_items(2).eviction_strategy(EvictionStrategy::Fifo).build(), false);

    cache.put("p", "op", Params::from([("k".to_string(), Value::Int(1))]), Value::Int(1), None);
    std::thread::sleep(Duration::from_millis(5));
    cache.put("p", "op", Params::from([("k".to_string(), Value::Int(2))]), Value::Int(2), None);

    // Touching k1 shouldn't save it from FIFO eviction, unlike LRU.
    cache.get("p", "op", Params::from([("k".to_string(), Value::Int(1))]), false);
    std::thread::sleep(Duration::from_millis(5));
    cache.put("p", "op", Params::from([("k".to_string(), Value::Int(3))]), Value::Int(3), None);

    let k1 = cache.get("p", "op", Params::from([("k".to_string(), Value::Int(1))]), false);
    assert!(!k1.hit, "FIFO must evict the oldest entry even if recently accessed");
}

#[tokio::test]
async fn bypass_skips_lookup_even_on_hit() {
    let cache = temp_cache(CachePolicy::default(), false);
    let params = Params::new();
    cache.put("p", "op", params.clone(), Value::Int(1), None);

    let bypassed = cache.get("p", "op", params, true);
    assert!(!bypassed.hit);
}

#[tokio::test]
async fn mock_gateway_scripted_envelope_is_independent_of_cache() {
    let gateway = MockGateway::new();
    gateway.script("weather", "current", vec![ScriptedCall::from(Envelope::ok(Value::Str("rainy".to_string())))]);
    let envelope = gateway.execute_operation("weather", "current", &Params::new()).await;
    assert!(envelope.success);
    assert_eq!(gateway.call_count(), 1);
}
