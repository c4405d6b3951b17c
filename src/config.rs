//! Per-subsystem configuration knobs (§6 of the design).
//!
//! Every config is a plain `Clone` struct with a `Default` matching the
//! enumerated defaults, plus a fluent builder for the handful of settings
//! worth chaining — the same shape the teacher uses for
//! `rate_limiter::Config`/`RateLimiterBuilder` and
//! `idempotency::Config`/`IdempotencyBuilder`. There is no file-based
//! configuration format: the system this replaces has none either, only an
//! in-process dict, so builders plus `Default` are the faithful rendition.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::policy::CachePolicy;

/// Configuration for the response cache, covering persistence in addition to
/// the eviction/TTL policy.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub policy: CachePolicy,
    pub cache_dir: PathBuf,
    pub persist_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            policy: CachePolicy::default(),
            cache_dir: PathBuf::from("./cache/api_cache"),
            persist_cache: true,
        }
    }
}

/// Builder for [`CacheConfig`].
#[derive(Default)]
pub struct CacheConfigBuilder(CacheConfig);

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self(CacheConfig::default())
    }
    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.0.policy = policy;
        self
    }
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.0.cache_dir = dir.into();
        self
    }
    pub fn persist_cache(mut self, yes: bool) -> Self {
        self.0.persist_cache = yes;
        self
    }
    pub fn build(self) -> CacheConfig {
        self.0
    }
}

/// Configuration for the batch processor.
#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub max_concurrent_jobs: usize,
    pub max_operation_concurrency: usize,
    pub default_timeout: Option<Duration>,
    pub default_max_retries: u32,
    pub default_retry_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_concurrent_jobs: 5,
            max_operation_concurrency: 10,
            default_timeout: Some(Duration::from_secs(3600)),
            default_max_retries: 3,
            default_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Builder for [`BatchConfig`].
#[derive(Default)]
pub struct BatchConfigBuilder(BatchConfig);

impl BatchConfigBuilder {
    pub fn new() -> Self {
        Self(BatchConfig::default())
    }
    pub fn max_concurrent_jobs(mut self, n: usize) -> Self {
        self.0.max_concurrent_jobs = n;
        self
    }
    pub fn max_operation_concurrency(mut self, n: usize) -> Self {
        self.0.max_operation_concurrency = n;
        self
    }
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.0.default_timeout = timeout;
        self
    }
    pub fn default_max_retries(mut self, n: u32) -> Self {
        self.0.default_max_retries = n;
        self
    }
    pub fn default_retry_delay(mut self, d: Duration) -> Self {
        self.0.default_retry_delay = d;
        self
    }
    pub fn build(self) -> BatchConfig {
        self.0
    }
}

/// Configuration for the polling manager.
#[derive(Clone, Debug)]
pub struct PollingConfig {
    pub min_interval: Duration,
    pub max_concurrent_jobs: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            min_interval: Duration::from_secs(60),
            max_concurrent_jobs: 10,
        }
    }
}

/// Configuration for the webhook manager.
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub host: String,
    pub port: u16,
    pub base_url: Option<String>,
    pub verification_tokens: HashMap<String, String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            host: "0.0.0.0".to_string(),
            port: 5000,
            base_url: None,
            verification_tokens: HashMap::new(),
        }
    }
}

/// Builder for [`WebhookConfig`].
#[derive(Default)]
pub struct WebhookConfigBuilder(WebhookConfig);

impl WebhookConfigBuilder {
    pub fn new() -> Self {
        Self(WebhookConfig::default())
    }
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.0.host = host.into();
        self
    }
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = port;
        self
    }
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.0.base_url = Some(url.into());
        self
    }
    pub fn verification_token(mut self, api_name: impl Into<String>, token: impl Into<String>) -> Self {
        self.0.verification_tokens.insert(api_name.into(), token.into());
        self
    }
    pub fn build(self) -> WebhookConfig {
        self.0
    }
}
