//! Shared error types for the cache, batch, polling, and webhook subsystems.
//!
//! The fabric has no global exception channel: asynchronous failures are
//! materialized as state fields on a job or cache entry, never as a second
//! error path alongside a successful return. [`FabricError`] exists for the
//! synchronous failure modes a caller can act on directly — empty batch
//! operation lists, malformed webhook configuration, and the like.

use thiserror::Error;

/// Top-level error returned by synchronous fabric operations.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Polling(#[from] PollingError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),
}

/// Errors surfaced synchronously by the response cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry not found")]
    EntryNotFound,

    #[error("cache entry does not need refresh")]
    RefreshNotNeeded,

    #[error("no refresh handler registered for plugin `{0}`")]
    NoRefreshHandler(String),

    #[error("refresh handler failed: {0}")]
    RefreshHandlerFailed(String),

    #[error("disk cache is not enabled")]
    PersistenceDisabled,
}

/// Errors surfaced synchronously by the batch processor.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("operations list cannot be empty")]
    EmptyOperations,

    #[error("job `{0}` does not exist")]
    JobNotFound(String),

    #[error("job `{0}` is already running")]
    AlreadyRunning(String),

    #[error("job `{0}` has already reached a terminal state")]
    AlreadyTerminal(String),

    #[error("too many active jobs ({active}/{limit}), cannot start job `{job_id}`")]
    TooManyActiveJobs {
        job_id: String,
        active: usize,
        limit: usize,
    },
}

/// Errors surfaced synchronously by the polling manager.
#[derive(Debug, Error)]
pub enum PollingError {
    #[error("job `{0}` does not exist")]
    JobNotFound(String),
}

/// Errors surfaced synchronously by the webhook manager.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("webhook `{0}` does not exist")]
    NotFound(String),

    #[error("webhook signature mismatch")]
    SignatureMismatch,

    #[error("unsupported signature algorithm `{0}`")]
    UnsupportedAlgorithm(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
