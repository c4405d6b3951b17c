//! Scheduled polling of gateway operations with change detection (§4.3).

pub mod job;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub use job::{Comparator, ComparatorOutcome, PollEvent, PollingJob};

use crate::config::PollingConfig;
use crate::error::PollingError;
use crate::gateway::Gateway;
use crate::value::Params;

/// Boxed async event handler, invoked for every detected change on a job.
pub type EventHandler = Arc<dyn Fn(PollEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct JobEntry {
    job: PollingJob,
    comparator: Option<Arc<dyn Comparator>>,
}

struct Tasks {
    scheduler: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Runs registered jobs on a schedule, dispatching detected changes to
/// per-job handlers.
///
/// Cheap to clone — internal state lives behind `Arc`/`DashMap`.
#[derive(Clone)]
pub struct PollingManager {
    config: PollingConfig,
    gateway: Arc<dyn Gateway>,
    jobs: Arc<DashMap<String, JobEntry>>,
    handlers: Arc<DashMap<String, Vec<EventHandler>>>,
    running: Arc<AtomicBool>,
    tasks: Arc<Mutex<Option<Tasks>>>,
    events_tx: Arc<Mutex<Option<mpsc::UnboundedSender<PollEvent>>>>,
}

impl PollingManager {
    pub fn new(config: PollingConfig, gateway: Arc<dyn Gateway>) -> Self {
        info!("polling manager initialized");
        PollingManager {
            config,
            gateway,
            jobs: Arc::new(DashMap::new()),
            handlers: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(None)),
            events_tx: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the 1Hz scheduler loop and the event-dispatch loop. A no-op if
    /// already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("polling manager already running");
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.events_tx.lock() = Some(tx);

        let scheduler = {
            let this = self.clone();
            tokio::spawn(async move { this.scheduler_loop().await })
        };
        let dispatcher = {
            let this = self.clone();
            tokio::spawn(async move { this.dispatch_loop(rx).await })
        };

        *self.tasks.lock() = Some(Tasks { scheduler, dispatcher });
        info!("polling manager started");
    }

    /// Stops both background tasks. A no-op if not running.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("polling manager not running");
            return;
        }
        *self.events_tx.lock() = None;
        if let Some(tasks) = self.tasks.lock().take() {
            tasks.scheduler.abort();
            tasks.dispatcher.abort();
        }
        info!("polling manager stopped");
    }

    /// Creates a job. `interval` is clamped up to `config.min_interval`.
    pub fn create_job(
        &self,
        api_name: impl Into<String>,
        plugin_name: impl Into<String>,
        operation: impl Into<String>,
        parameters: Params,
        interval: Duration,
        comparator: Option<Arc<dyn Comparator>>,
        job_id: Option<String>,
        enabled: bool,
        description: Option<String>,
    ) -> String {
        let interval = interval.max(self.config.min_interval);
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let job = PollingJob::new(
            job_id.clone(),
            api_name.into(),
            plugin_name.into(),
            operation.into(),
            parameters,
            interval,
            enabled,
            description,
        );

        info!(job_id = %job_id, interval_secs = interval.as_secs(), "created polling job");
        self.jobs.insert(job_id.clone(), JobEntry { job, comparator });
        job_id
    }

    pub fn delete_job(&self, job_id: &str) -> Result<(), PollingError> {
        self.jobs
            .remove(job_id)
            .ok_or_else(|| PollingError::JobNotFound(job_id.to_string()))?;
        self.handlers.remove(job_id);
        Ok(())
    }

    pub fn update_job(
        &self,
        job_id: &str,
        parameters: Option<Params>,
        interval: Option<Duration>,
        enabled: Option<bool>,
        description: Option<String>,
    ) -> Result<(), PollingError> {
        let mut entry = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| PollingError::JobNotFound(job_id.to_string()))?;

        if let Some(parameters) = parameters {
            entry.job.parameters = parameters;
        }
        if let Some(interval) = interval {
            entry.job.interval = interval.max(self.config.min_interval);
            entry.job.update_next_run();
        }
        if let Some(enabled) = enabled {
            entry.job.enabled = enabled;
        }
        if let Some(description) = description {
            entry.job.description = Some(description);
        }
        entry.job.updated_at = job_now_secs();
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Option<PollingJob> {
        self.jobs.get(job_id).map(|e| e.job.clone())
    }

    pub fn get_all_jobs(&self) -> Vec<PollingJob> {
        self.jobs.iter().map(|e| e.job.clone()).collect()
    }

    pub fn register_job_handler(&self, job_id: impl Into<String>, handler: EventHandler) {
        self.handlers.entry(job_id.into()).or_default().push(handler);
    }

    pub fn unregister_job_handlers(&self, job_id: &str) -> bool {
        self.handlers.remove(job_id).is_some()
    }

    /// Runs a job immediately, outside its schedule, and returns its result
    /// without waiting for event dispatch.
    #[instrument(skip(self))]
    pub async fn force_execute_job(&self, job_id: &str) -> Result<crate::gateway::Envelope, PollingError> {
        let (plugin_name, operation, parameters) = {
            let mut entry = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| PollingError::JobNotFound(job_id.to_string()))?;
            entry.job.record_run_start();
            (
                entry.job.plugin_name.clone(),
                entry.job.operation.clone(),
                entry.job.parameters.clone(),
            )
        };

        let result = self.gateway.execute_operation(&plugin_name, &operation, &parameters).await;
        self.handle_poll_result(job_id, result.clone());
        Ok(result)
    }

    async fn scheduler_loop(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;

            let due: Vec<(String, String, String, Params)> = {
                let now = job_now_secs();
                let mut due = Vec::new();
                for mut entry in self.jobs.iter_mut() {
                    if entry.job.is_due(now) {
                        entry.job.update_next_run();
                        due.push((
                            entry.job.job_id.clone(),
                            entry.job.plugin_name.clone(),
                            entry.job.operation.clone(),
                            entry.job.parameters.clone(),
                        ));
                    }
                }
                due
            };

            let due: Vec<_> = due.into_iter().take(self.config.max_concurrent_jobs).collect();

            for (job_id, plugin_name, operation, parameters) in due {
                if let Some(mut entry) = self.jobs.get_mut(&job_id) {
                    entry.job.record_run_start();
                }
                let result = self.gateway.execute_operation(&plugin_name, &operation, &parameters).await;
                self.handle_poll_result(&job_id, result);
            }
        }
    }

    fn handle_poll_result(&self, job_id: &str, result: crate::gateway::Envelope) {
        if !result.success {
            let error = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
            warn!(job_id, %error, "polling job failed");
            if let Some(mut entry) = self.jobs.get_mut(job_id) {
                entry.job.record_error(error);
            }
            return;
        }

        let change = {
            let Some(mut entry) = self.jobs.get_mut(job_id) else {
                return;
            };
            let comparator = entry.comparator.clone();
            entry
                .job
                .record_success(result.clone(), comparator.as_deref())
        };

        let Some(change_details) = change else {
            return;
        };

        let Some(entry) = self.jobs.get(job_id) else {
            return;
        };
        let event = PollEvent {
            event_id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            api_name: entry.job.api_name.clone(),
            plugin_name: entry.job.plugin_name.clone(),
            operation: entry.job.operation.clone(),
            parameters: entry.job.parameters.clone(),
            timestamp: job_now_secs(),
            result,
            change_details: Some(change_details),
        };
        drop(entry);

        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    async fn dispatch_loop(&self, mut rx: mpsc::UnboundedReceiver<PollEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(handlers) = self.handlers.get(&event.job_id).map(|h| h.clone()) else {
                continue;
            };
            for handler in handlers {
                let event = event.clone();
                let job_id = event.job_id.clone();
                if let Err(e) = tokio::spawn(async move { handler(event).await }).await {
                    error!(job_id, error = %e, "poll event handler panicked");
                }
            }
        }
    }
}

fn job_now_secs() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
