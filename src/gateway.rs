//! The Gateway contract every subsystem calls out through.
//!
//! Application code owns the concrete [`Gateway`] implementation — it is the
//! collaborator that knows how to load a named plugin and invoke one of its
//! operations. This crate never implements plugin loading; it only consumes
//! the trait. A [`Gateway`] must be safe to call concurrently, since the
//! batch processor, polling manager, and webhook handlers may all invoke it
//! from different tasks at once.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::value::{Params, Value};

/// Uniform success/error shape returned by every operation executed through
/// a [`Gateway`]. Additional fields beyond `success`/`data`/`error` are
/// opaque to the fabric and round-trip through `extra`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Envelope {
    /// Builds a success envelope carrying `data`.
    pub fn ok(data: Value) -> Self {
        Envelope {
            success: true,
            data: Some(data),
            error: None,
            extra: BTreeMap::new(),
        }
    }

    /// Builds a failure envelope carrying a human-readable `error`.
    pub fn err(error: impl Into<String>) -> Self {
        Envelope {
            success: false,
            data: None,
            error: Some(error.into()),
            extra: BTreeMap::new(),
        }
    }
}

/// Executes a named operation of a named plugin with a parameter mapping.
///
/// Blocking in the sense that callers await completion before proceeding —
/// implementations are expected to perform their own network I/O
/// asynchronously rather than parking a thread.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn execute_operation(
        &self,
        plugin_name: &str,
        operation: &str,
        params: &Params,
    ) -> Envelope;
}

/// Per-plugin cache refresh callback. Invoked from within the cache's locked
/// region only after the stale entry has been cloned out and the lock
/// dropped; must not re-enter the cache that invoked it.
#[async_trait]
pub trait RefreshHandler: Send + Sync {
    async fn refresh(&self, operation: &str, params: &Params, old_data: &Value) -> Envelope;
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_util {
    //! An in-memory [`Gateway`] used by every subsystem's test suite to
    //! script canned or sequenced envelopes and injected delays, grounded on
    //! the teacher's dev-dependency-gated test helpers.

    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::time::sleep;

    use super::*;

    /// A scripted response: either an immediate envelope or a delay followed
    /// by one.
    #[derive(Clone)]
    pub struct ScriptedCall {
        pub envelope: Envelope,
        pub delay: Option<Duration>,
    }

    impl From<Envelope> for ScriptedCall {
        fn from(envelope: Envelope) -> Self {
            ScriptedCall {
                envelope,
                delay: None,
            }
        }
    }

    /// A [`Gateway`] whose responses are pre-scripted per `(plugin, operation)`
    /// key, consumed in call order, and replayed forever once a key is
    /// exhausted (matching a stub that would otherwise keep returning its
    /// last envelope).
    #[derive(Default)]
    pub struct MockGateway {
        scripts: Mutex<std::collections::HashMap<String, Vec<ScriptedCall>>>,
        calls: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, plugin: &str, operation: &str, calls: Vec<ScriptedCall>) {
            self.scripts
                .lock()
                .insert(format!("{plugin}:{operation}"), calls);
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        pub fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Gateway for MockGateway {
        async fn execute_operation(
            &self,
            plugin_name: &str,
            operation: &str,
            _params: &Params,
        ) -> Envelope {
            self.calls
                .lock()
                .push((plugin_name.to_string(), operation.to_string()));

            let key = format!("{plugin_name}:{operation}");
            let next = {
                let mut scripts = self.scripts.lock();
                let Some(queue) = scripts.get_mut(&key) else {
                    return Envelope::err(format!("no script for {key}"));
                };
                if queue.is_empty() {
                    return Envelope::err(format!("script exhausted for {key}"));
                }
                if queue.len() == 1 {
                    queue[0].clone()
                } else {
                    queue.remove(0)
                }
            };

            if let Some(delay) = next.delay {
                sleep(delay).await;
            }
            next.envelope
        }
    }
}
