//! Concurrent execution of batches of gateway operations, with per-operation
//! retries and cooperative cancellation (§4.2).

pub mod job;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::gateway::{Envelope, Gateway};
pub use job::{BatchJob, JobStatus, OperationDescriptor, OperationSnapshot, OperationStatus};

/// Boxed async completion handler, invoked once a job reaches a terminal
/// state.
pub type JobHandler = Arc<dyn Fn(BatchJob) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct JobRecord {
    job: BatchJob,
    cancel_tx: Option<watch::Sender<bool>>,
}

/// Drives batch jobs of gateway operations: bounded per-job and per-operation
/// concurrency, tail-requeue retries, timeouts, and cooperative cancellation.
///
/// Cheap to clone — internal state lives behind `Arc`/`DashMap`, mirroring
/// the teacher's `SignalArbiter`.
#[derive(Clone)]
pub struct BatchProcessor {
    config: BatchConfig,
    gateway: Arc<dyn Gateway>,
    jobs: Arc<DashMap<String, JobRecord>>,
    active_jobs: Arc<DashMap<String, ()>>,
    handlers: Arc<DashMap<String, Vec<JobHandler>>>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig, gateway: Arc<dyn Gateway>) -> Self {
        info!("batch processor initialized");
        BatchProcessor {
            config,
            gateway,
            jobs: Arc::new(DashMap::new()),
            active_jobs: Arc::new(DashMap::new()),
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// Creates a job without starting it. Returns the assigned job id
    /// (a fresh UUID if `job_id` is `None`).
    pub fn create_job(
        &self,
        api_name: impl Into<String>,
        plugin_name: impl Into<String>,
        operations: Vec<OperationDescriptor>,
        job_id: Option<String>,
        description: Option<String>,
    ) -> Result<String, BatchError> {
        if operations.is_empty() {
            return Err(BatchError::EmptyOperations);
        }

        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let max_concurrency = self.config.max_operation_concurrency.min(operations.len()).max(1);

        let job = BatchJob::new(
            job_id.clone(),
            api_name.into(),
            plugin_name.into(),
            operations,
            max_concurrency,
            self.config.default_timeout,
            self.config.default_max_retries,
            self.config.default_retry_delay,
            description,
        );

        info!(job_id = %job_id, operations = job.operation_count(), "created batch job");
        self.jobs.insert(
            job_id.clone(),
            JobRecord {
                job,
                cancel_tx: None,
            },
        );
        Ok(job_id)
    }

    /// Starts a created job as a background task. Returns an error if the
    /// job is missing, already running/terminal, or the concurrent-job limit
    /// is reached.
    #[instrument(skip(self))]
    pub fn start_job(&self, job_id: &str) -> Result<(), BatchError> {
        {
            let mut record = self
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| BatchError::JobNotFound(job_id.to_string()))?;

            if record.job.status == JobStatus::Running {
                return Err(BatchError::AlreadyRunning(job_id.to_string()));
            }
            if record.job.status.is_terminal() {
                return Err(BatchError::AlreadyTerminal(job_id.to_string()));
            }
            if self.active_jobs.len() >= self.config.max_concurrent_jobs {
                return Err(BatchError::TooManyActiveJobs {
                    job_id: job_id.to_string(),
                    active: self.active_jobs.len(),
                    limit: self.config.max_concurrent_jobs,
                });
            }

            let (cancel_tx, _) = watch::channel(false);
            record.cancel_tx = Some(cancel_tx);
            record.job.mark_started();
        }

        self.active_jobs.insert(job_id.to_string(), ());
        info!(job_id, "started batch job");

        let this = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            this.run_job(job_id).await;
        });
        Ok(())
    }

    /// Requests cancellation of a running (or not-yet-started) job.
    pub fn cancel_job(&self, job_id: &str) -> Result<(), BatchError> {
        let mut record = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| BatchError::JobNotFound(job_id.to_string()))?;

        if record.job.status.is_terminal() {
            return Err(BatchError::AlreadyTerminal(job_id.to_string()));
        }

        if let Some(tx) = &record.cancel_tx {
            let _ = tx.send(true);
        }
        record.job.cancel();
        self.active_jobs.remove(job_id);
        info!(job_id, "cancelled batch job");
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> Option<BatchJob> {
        self.jobs.get(job_id).map(|r| r.job.clone())
    }

    pub fn get_all_jobs(&self) -> Vec<BatchJob> {
        self.jobs.iter().map(|r| r.job.clone()).collect()
    }

    pub fn register_job_handler(&self, job_id: impl Into<String>, handler: JobHandler) {
        self.handlers.entry(job_id.into()).or_default().push(handler);
    }

    /// Removes all handlers registered for `job_id`. Individual removal by
    /// identity isn't supported since handlers are opaque closures.
    pub fn unregister_job_handlers(&self, job_id: &str) -> bool {
        self.handlers.remove(job_id).is_some()
    }

    /// Drops terminal jobs older than `max_age`, returning how many were
    /// removed.
    pub fn cleanup_completed_jobs(&self, max_age: std::time::Duration) -> usize {
        let cutoff = job_now_secs() - max_age.as_secs_f64();
        let stale: Vec<String> = self
            .jobs
            .iter()
            .filter(|r| r.job.status.is_terminal() && r.job.updated_at < cutoff)
            .map(|r| r.key().clone())
            .collect();
        for job_id in &stale {
            self.jobs.remove(job_id);
            self.handlers.remove(job_id);
        }
        stale.len()
    }

    /// Streams operations through the gateway, polling in-flight handles
    /// rather than awaiting a batch to completion, so cancellation and the
    /// job timeout are observed while operations are still running — not
    /// only between batches. Mirrors the original's `while pending or
    /// active` poll loop (`batch_processor.py`), which checks `future.done()`
    /// and sleeps 0.1s between checks instead of blocking on any one future.
    async fn run_job(&self, job_id: String) {
        let (plugin_name, descriptors, max_concurrency, timeout_dur, retry_delay) = {
            let record = self.jobs.get(&job_id).expect("job record vanished mid-run");
            (
                record.job.plugin_name.clone(),
                record.job.descriptors(),
                record.job.max_concurrency,
                record.job.timeout,
                record.job.retry_delay,
            )
        };

        let mut cancel_rx = self
            .jobs
            .get(&job_id)
            .and_then(|r| r.cancel_tx.as_ref().map(|tx| tx.subscribe()))
            .expect("start_job always installs a cancel channel");

        let deadline = timeout_dur.map(|d| tokio::time::Instant::now() + d);
        let mut pending: VecDeque<usize> = (0..descriptors.len()).collect();
        let mut active: Vec<(usize, JoinHandle<Envelope>)> = Vec::new();

        loop {
            if *cancel_rx.borrow() {
                for (_, handle) in active.drain(..) {
                    handle.abort();
                }
                self.finish_cancelled(&job_id);
                return;
            }
            if let Some(deadline) = deadline {
                if tokio::time::Instant::now() > deadline {
                    for (_, handle) in active.drain(..) {
                        handle.abort();
                    }
                    self.finish_failed(
                        &job_id,
                        format!("Timed out after {} seconds", timeout_dur.unwrap().as_secs()),
                    );
                    return;
                }
            }

            while active.len() < max_concurrency {
                let Some(index) = pending.pop_front() else { break };
                let gateway = self.gateway.clone();
                let plugin_name = plugin_name.clone();
                let descriptor = descriptors[index].clone();
                if let Some(mut record) = self.jobs.get_mut(&job_id) {
                    record.job.mark_op_running(index);
                }
                let handle = tokio::spawn(async move {
                    gateway
                        .execute_operation(&plugin_name, &descriptor.operation, &descriptor.parameters)
                        .await
                });
                active.push((index, handle));
            }

            if active.is_empty() && pending.is_empty() {
                break;
            }

            let (done, still_running): (Vec<_>, Vec<_>) = active.drain(..).partition(|(_, h)| h.is_finished());
            active = still_running;

            if done.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            for (index, handle) in done {
                let result = handle
                    .await
                    .unwrap_or_else(|e| Envelope::err(format!("operation panicked: {e}")));

                if result.success {
                    if let Some(mut record) = self.jobs.get_mut(&job_id) {
                        record.job.mark_op_completed(index, result);
                    }
                } else {
                    let error = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
                    let should_retry = self
                        .jobs
                        .get_mut(&job_id)
                        .map(|mut r| r.job.mark_op_failed_or_retry(index, error))
                        .unwrap_or(false);
                    if should_retry {
                        tokio::time::sleep(retry_delay).await;
                        pending.push_back(index);
                    }
                }
            }
        }

        self.finish_job(&job_id).await;
    }

    /// No-ops if the job already reached a terminal state by some other path
    /// (cancellation racing the final batch, for instance) so a late
    /// `finish()` never overwrites `Cancelled` with `Completed`/`Failed`.
    async fn finish_job(&self, job_id: &str) {
        let job = {
            let mut record = match self.jobs.get_mut(job_id) {
                Some(r) => r,
                None => return,
            };
            if record.job.status.is_terminal() {
                return;
            }
            record.job.finish();
            record.job.clone()
        };
        self.active_jobs.remove(job_id);
        info!(job_id, status = ?job.status, "batch job finished");
        self.dispatch_handlers(job_id, job).await;
    }

    fn finish_failed(&self, job_id: &str, error: String) {
        let already_terminal = match self.jobs.get_mut(job_id) {
            Some(mut record) if record.job.status.is_terminal() => true,
            Some(mut record) => {
                record.job.fail(error);
                false
            }
            None => return,
        };
        self.active_jobs.remove(job_id);
        if already_terminal {
            return;
        }
        let job_id = job_id.to_string();
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(job) = this.get_job(&job_id) {
                this.dispatch_handlers(&job_id, job).await;
            }
        });
    }

    fn finish_cancelled(&self, job_id: &str) {
        self.active_jobs.remove(job_id);
        let job_id = job_id.to_string();
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(job) = this.get_job(&job_id) {
                this.dispatch_handlers(&job_id, job).await;
            }
        });
    }

    /// Runs each handler on its own task so a panicking handler can't abort
    /// its siblings or poison the caller.
    async fn dispatch_handlers(&self, job_id: &str, job: BatchJob) {
        let Some(handlers) = self.handlers.get(job_id).map(|h| h.clone()) else {
            return;
        };
        for handler in handlers {
            let job = job.clone();
            if let Err(e) = tokio::spawn(async move { handler(job).await }).await {
                error!(job_id, error = %e, "batch job handler panicked");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::test_util::{MockGateway, ScriptedCall};
    use crate::value::Params;
    use std::time::Duration as StdDuration;

    fn descriptor(id: &str, op: &str) -> OperationDescriptor {
        OperationDescriptor {
            id: id.to_string(),
            operation: op.to_string(),
            parameters: Params::new(),
        }
    }

    #[tokio::test]
    async fn job_completes_when_all_operations_succeed() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script("p", "op", vec![ScriptedCall::from(Envelope::ok(crate::value::Value::Int(1)))]);
        gateway.script("p", "op2", vec![ScriptedCall::from(Envelope::ok(crate::value::Value::Int(2)))]);

        let processor = BatchProcessor::new(BatchConfig::default(), gateway);
        let job_id = processor
            .create_job("api", "p", vec![descriptor("a", "op"), descriptor("b", "op2")], None, None)
            .unwrap();
        processor.start_job(&job_id).unwrap();

        for _ in 0..50 {
            if let Some(job) = processor.get_job(&job_id) {
                if job.status.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        let job = processor.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_operations, 2);
        assert_eq!(job.progress, 100);
    }

    #[tokio::test]
    async fn failed_operation_retries_then_fails_job() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script("p", "op", vec![ScriptedCall::from(Envelope::err("boom"))]);

        let config = retrying_config();
        let processor = BatchProcessor::new(config, gateway);
        let job_id = processor
            .create_job("api", "p", vec![descriptor("a", "op")], None, None)
            .unwrap();
        processor.start_job(&job_id).unwrap();

        for _ in 0..100 {
            if let Some(job) = processor.get_job(&job_id) {
                if job.status.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }

        let job = processor.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_operations, 1);
    }

    fn retrying_config() -> BatchConfig {
        crate::config::BatchConfigBuilder::new()
            .default_max_retries(1)
            .default_retry_delay(StdDuration::from_millis(5))
            .build()
    }

    #[tokio::test]
    async fn empty_operations_rejected() {
        let gateway = Arc::new(MockGateway::new());
        let processor = BatchProcessor::new(BatchConfig::default(), gateway);
        let result = processor.create_job("api", "p", vec![], None, None);
        assert!(matches!(result, Err(BatchError::EmptyOperations)));
    }

    #[tokio::test]
    async fn cancel_job_sets_cancelled_status() {
        let gateway = Arc::new(MockGateway::new());
        gateway.script(
            "p",
            "op",
            vec![ScriptedCall {
                envelope: Envelope::ok(crate::value::Value::Int(1)),
                delay: Some(StdDuration::from_millis(200)),
            }],
        );

        let processor = BatchProcessor::new(BatchConfig::default(), gateway);
        let job_id = processor
            .create_job("api", "p", vec![descriptor("a", "op")], None, None)
            .unwrap();
        processor.start_job(&job_id).unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        processor.cancel_job(&job_id).unwrap();

        let job = processor.get_job(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }
}
