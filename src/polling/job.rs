//! Polling job state and the change-detection comparator trait.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::gateway::Envelope;
use crate::value::Params;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Result of comparing a job's previous and current poll result.
#[derive(Clone, Debug)]
pub enum ComparatorOutcome {
    /// Changed or not, with no further detail.
    Changed(bool),
    /// Changed or not, with a human-readable explanation.
    ChangedWithDetail(bool, String),
}

impl ComparatorOutcome {
    pub fn changed(&self) -> bool {
        match self {
            ComparatorOutcome::Changed(c) => *c,
            ComparatorOutcome::ChangedWithDetail(c, _) => *c,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            ComparatorOutcome::Changed(_) => None,
            ComparatorOutcome::ChangedWithDetail(_, detail) => Some(detail),
        }
    }
}

/// Custom change-detection logic for a polling job. Replaces the default
/// equality check on `Envelope::data` when registered.
pub trait Comparator: Send + Sync {
    fn compare(&self, previous: &Envelope, current: &Envelope) -> ComparatorOutcome;
}

/// A detected change, queued for dispatch to the job's registered handlers.
#[derive(Clone, Debug)]
pub struct PollEvent {
    pub event_id: String,
    pub job_id: String,
    pub api_name: String,
    pub plugin_name: String,
    pub operation: String,
    pub parameters: Params,
    pub timestamp: f64,
    pub result: Envelope,
    pub change_details: Option<String>,
}

/// A scheduled poll against a single gateway operation.
#[derive(Clone, Debug)]
pub struct PollingJob {
    pub job_id: String,
    pub api_name: String,
    pub plugin_name: String,
    pub operation: String,
    pub parameters: Params,
    pub interval: Duration,
    pub enabled: bool,
    pub description: Option<String>,

    pub last_run: Option<f64>,
    pub last_result: Option<Envelope>,
    pub last_error: Option<String>,
    pub next_run: f64,
    pub run_count: u64,
    pub error_count: u64,
    pub success_count: u64,
    pub created_at: f64,
    pub updated_at: f64,
}

impl PollingJob {
    pub fn new(
        job_id: String,
        api_name: String,
        plugin_name: String,
        operation: String,
        parameters: Params,
        interval: Duration,
        enabled: bool,
        description: Option<String>,
    ) -> Self {
        let now = now_secs();
        PollingJob {
            job_id,
            api_name,
            plugin_name,
            operation,
            parameters,
            interval,
            enabled,
            description,
            last_run: None,
            last_result: None,
            last_error: None,
            next_run: now + interval.as_secs_f64(),
            run_count: 0,
            error_count: 0,
            success_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_next_run(&mut self) {
        self.next_run = now_secs() + self.interval.as_secs_f64();
    }

    pub fn is_due(&self, now: f64) -> bool {
        self.enabled && self.next_run <= now
    }

    pub fn record_run_start(&mut self) {
        self.last_run = Some(now_secs());
        self.run_count += 1;
        self.updated_at = now_secs();
    }

    pub fn record_error(&mut self, error: String) {
        self.error_count += 1;
        self.last_error = Some(error);
        self.updated_at = now_secs();
    }

    /// Compares `result` against the previous poll and updates `last_result`.
    /// A missing previous result is always a change ("initial poll").
    pub fn record_success(
        &mut self,
        result: Envelope,
        comparator: Option<&dyn Comparator>,
    ) -> Option<String> {
        self.success_count += 1;
        self.updated_at = now_secs();

        let outcome = match &self.last_result {
            None => ComparatorOutcome::ChangedWithDetail(true, "initial poll".to_string()),
            Some(previous) => {
                if let Some(comparator) = comparator {
                    comparator.compare(previous, &result)
                } else {
                    let changed = previous.data != result.data;
                    if changed {
                        ComparatorOutcome::ChangedWithDetail(true, "data changed".to_string())
                    } else {
                        ComparatorOutcome::Changed(false)
                    }
                }
            }
        };

        self.last_result = Some(result);

        if outcome.changed() {
            Some(outcome.detail().unwrap_or("changed").to_string())
        } else {
            None
        }
    }
}
