//! A mid-tier fabric that sits between application code and many heterogeneous
//! external HTTP APIs, providing uniform response caching, bounded-concurrency
//! batch execution with retries, scheduled polling with change detection, and
//! inbound webhook reception with signature verification.
//!
//! Every subsystem calls out to application code through a single
//! [`gateway::Gateway`] implementation, which knows how to invoke a named
//! operation of a named plugin with a parameter mapping and return a
//! [`gateway::Envelope`]. The fabric itself never knows how a plugin talks to
//! its remote API — it only coordinates when and how often `execute_operation`
//! is called.
//!
//! # Subsystems
//! - [cache] — TTL-scoped response cache with LRU/LFU/FIFO eviction and
//!   optional disk persistence.
//! - [batch] — bounded-concurrency executor for heterogeneous operation lists
//!   with per-operation retries and job timeouts.
//! - [polling] — scheduler that periodically invokes an operation and diffs
//!   consecutive results to detect change events.
//! - [webhook] — embedded HTTP receiver that authenticates, routes, and
//!   dispatches inbound callbacks from third parties.
//!
//! # Feature flags
//! - `tracing-init` — pulls in `tracing-subscriber` and exposes
//!   [logging::init] for applications that want a ready-made subscriber.

/// Batch job execution: bounded concurrency, retries, and lifecycle tracking.
pub mod batch;

/// TTL-scoped response cache with eviction policy and disk persistence.
pub mod cache;

/// Per-subsystem configuration knobs and their builders.
pub mod config;

/// Shared error types for every subsystem.
pub mod error;

/// Gateway contract consumed by every subsystem, and the result envelope shape.
pub mod gateway;

/// Tracing subscriber bootstrap, mirroring the teacher's optional tracing feature.
#[cfg(feature = "tracing-init")]
pub mod logging;

/// Scheduled polling with change detection and event dispatch.
pub mod polling;

/// Canonical parameter/payload value model and cache-key canonicalization.
pub mod value;

/// Embedded HTTP receiver for inbound webhook callbacks.
pub mod webhook;

pub use error::FabricError;
pub use gateway::{Envelope, Gateway, RefreshHandler};
pub use value::{Params, Value};
