//! Structured logging bootstrap for applications embedding the fabric.
//!
//! The fabric itself never installs a global subscriber — every subsystem
//! just emits spans and events at its own `tracing` call sites, scoped by
//! module path, replacing the module-level `logging.getLogger(__name__)`
//! singletons the source system carried. [`init`] is an optional convenience
//! for binaries that want a sane default subscriber without pulling in
//! `tracing-subscriber` themselves, gated behind the `tracing-init` feature.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, Layer};

/// Installs a formatted, span-aware subscriber at `DEBUG` level.
pub fn init() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_filter(LevelFilter::DEBUG),
        )
        .init();
}
