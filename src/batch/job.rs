//! Batch job state: operations, their per-operation status, and the job's
//! overall lifecycle.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::gateway::Envelope;
use crate::value::Params;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A single operation to run through the gateway as part of a batch.
#[derive(Clone, Debug)]
pub struct OperationDescriptor {
    pub id: String,
    pub operation: String,
    pub parameters: Params,
}

/// Per-operation lifecycle state, tracked independently of the job's overall
/// status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

/// Overall job lifecycle. `Created` → `Running` → one of the three terminal
/// states; there is no path back to `Created` or `Running` from a terminal
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }
}

#[derive(Clone, Debug)]
struct OperationState {
    descriptor: OperationDescriptor,
    status: OperationStatus,
    retries: u32,
    error: Option<String>,
    result: Option<Envelope>,
}

/// A batch of operations plus the concurrency/retry/timeout policy they run
/// under, and the mutable state accumulated as they execute.
#[derive(Clone, Debug)]
pub struct BatchJob {
    pub job_id: String,
    pub api_name: String,
    pub plugin_name: String,
    pub max_concurrency: usize,
    pub timeout: Option<Duration>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub description: Option<String>,

    pub status: JobStatus,
    pub created_at: f64,
    pub updated_at: f64,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub error: Option<String>,
    pub progress: u8,
    pub completed_operations: usize,
    pub failed_operations: usize,

    operations: Vec<OperationState>,
}

impl BatchJob {
    pub fn new(
        job_id: String,
        api_name: String,
        plugin_name: String,
        operations: Vec<OperationDescriptor>,
        max_concurrency: usize,
        timeout: Option<Duration>,
        max_retries: u32,
        retry_delay: Duration,
        description: Option<String>,
    ) -> Self {
        let now = now_secs();
        let operations = operations
            .into_iter()
            .map(|descriptor| OperationState {
                descriptor,
                status: OperationStatus::Pending,
                retries: 0,
                error: None,
                result: None,
            })
            .collect();

        BatchJob {
            job_id,
            api_name,
            plugin_name,
            max_concurrency,
            timeout,
            max_retries,
            retry_delay,
            description,
            status: JobStatus::Created,
            created_at: now,
            updated_at: now,
            start_time: None,
            end_time: None,
            error: None,
            progress: 0,
            completed_operations: 0,
            failed_operations: 0,
            operations,
        }
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn descriptors(&self) -> Vec<OperationDescriptor> {
        self.operations.iter().map(|op| op.descriptor.clone()).collect()
    }

    pub fn mark_started(&mut self) {
        self.status = JobStatus::Running;
        self.start_time = Some(now_secs());
        self.updated_at = now_secs();
    }

    pub fn mark_op_running(&mut self, index: usize) {
        self.operations[index].status = OperationStatus::Running;
        self.updated_at = now_secs();
    }

    pub fn mark_op_completed(&mut self, index: usize, result: Envelope) {
        let op = &mut self.operations[index];
        op.status = OperationStatus::Completed;
        op.result = Some(result);
        self.completed_operations += 1;
        self.recompute_progress();
    }

    /// Returns `true` if the retry was accepted (budget remains), `false` if
    /// the operation has exhausted `max_retries` and has been marked failed.
    pub fn mark_op_failed_or_retry(&mut self, index: usize, error: String) -> bool {
        let retries = self.operations[index].retries;
        if retries < self.max_retries {
            let op = &mut self.operations[index];
            op.retries += 1;
            op.status = OperationStatus::Retrying;
            op.error = Some(error);
            self.updated_at = now_secs();
            true
        } else {
            let op = &mut self.operations[index];
            op.status = OperationStatus::Failed;
            op.error = Some(error);
            self.failed_operations += 1;
            self.recompute_progress();
            false
        }
    }

    pub fn recompute_progress(&mut self) {
        let total = self.operations.len();
        let done = self.completed_operations + self.failed_operations;
        self.progress = if total == 0 {
            0
        } else {
            ((done * 100) / total) as u8
        };
        self.updated_at = now_secs();
    }

    pub fn finish(&mut self) {
        self.end_time = Some(now_secs());
        self.updated_at = now_secs();
        if self.failed_operations == 0 {
            self.status = JobStatus::Completed;
            self.progress = 100;
        } else {
            self.status = JobStatus::Failed;
            self.error = Some(format!("{} operations failed", self.failed_operations));
        }
    }

    pub fn fail(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.end_time = Some(now_secs());
        self.updated_at = now_secs();
        self.error = Some(error);
    }

    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.end_time = Some(now_secs());
        self.updated_at = now_secs();
        self.error = Some("cancelled by caller".to_string());
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) if end >= start => Some(Duration::from_secs_f64(end - start)),
            _ => None,
        }
    }

    /// Snapshot of per-operation `(id, status, retries, error)` for reporting.
    pub fn operation_snapshots(&self) -> Vec<OperationSnapshot> {
        self.operations
            .iter()
            .map(|op| OperationSnapshot {
                id: op.descriptor.id.clone(),
                status: op.status,
                retries: op.retries,
                error: op.error.clone(),
                result: op.result.clone(),
            })
            .collect()
    }

    pub fn results(&self) -> BTreeMap<String, Envelope> {
        self.operations
            .iter()
            .filter_map(|op| op.result.clone().map(|r| (op.descriptor.id.clone(), r)))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct OperationSnapshot {
    pub id: String,
    pub status: OperationStatus,
    pub retries: u32,
    pub error: Option<String>,
    pub result: Option<Envelope>,
}
