use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use api_fabric::batch::{BatchJob, BatchProcessor, JobStatus, OperationDescriptor};
use api_fabric::config::{BatchConfig, BatchConfigBuilder};
use api_fabric::error::BatchError;
use api_fabric::gateway::test_util::{MockGateway, ScriptedCall};
use api_fabric::value::{Params, Value};
use api_fabric::Envelope;

fn op(id: &str, operation: &str) -> OperationDescriptor {
    OperationDescriptor {
        id: id.to_string(),
        operation: operation.to_string(),
        parameters: Params::new(),
    }
}

async fn wait_for_terminal(processor: &BatchProcessor, job_id: &str) -> BatchJob {
    for _ in 0..200 {
        if let Some(job) = processor.get_job(job_id) {
            if job.status.is_terminal() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn mixed_batch_completes_with_one_retry_and_one_immediate_success() {
    let gateway = Arc::new(MockGateway::new());
    gateway.script(
        "p",
        "flaky",
        vec![ScriptedCall::from(Envelope::err("transient")), ScriptedCall::from(Envelope::ok(Value::Int(7)))],
    );
    gateway.script("p", "steady", vec![ScriptedCall::from(Envelope::ok(Value::Int(1)))]);

    let config = BatchConfigBuilder::new()
        .default_max_retries(2)
        .default_retry_delay(Duration::from_millis(5))
        .build();
    let processor = BatchProcessor::new(config, gateway);

    let job_id = processor
        .create_job("api", "p", vec![op("a", "flaky"), op("b", "steady")], None, Some("mixed".to_string()))
        .unwrap();
    processor.start_job(&job_id).unwrap();

    let job = wait_for_terminal(&processor, &job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_operations, 2);
    assert_eq!(job.failed_operations, 0);

    let snapshots = job.operation_snapshots();
    let flaky = snapshots.iter().find(|s| s.id == "a").unwrap();
    assert_eq!(flaky.retries, 1);
}

#[tokio::test]
async fn job_handler_fires_once_job_reaches_terminal_state() {
    let gateway = Arc::new(MockGateway::new());
    gateway.script("p", "op", vec![ScriptedCall::from(Envelope::ok(Value::Int(1)))]);

    let processor = BatchProcessor::new(BatchConfig::default(), gateway);
    let job_id = processor.create_job("api", "p", vec![op("a", "op")], None, None).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        processor.register_job_handler(
            job_id.clone(),
            Arc::new(move |job| {
                let fired = fired.clone();
                Box::pin(async move {
                    assert_eq!(job.status, JobStatus::Completed);
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );
    }

    processor.start_job(&job_id).unwrap();
    wait_for_terminal(&processor, &job_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn too_many_active_jobs_is_rejected() {
    let gateway = Arc::new(MockGateway::new());
    gateway.script(
        "p",
        "slow",
        vec![ScriptedCall {
            envelope: Envelope::ok(Value::Int(1)),
            delay: Some(Duration::from_millis(300)),
        }],
    );

    let config = BatchConfigBuilder::new().max_concurrent_jobs(1).build();
    let processor = BatchProcessor::new(config, gateway);

    let first = processor.create_job("api", "p", vec![op("a", "slow")], None, None).unwrap();
    processor.start_job(&first).unwrap();

    let second = processor.create_job("api", "p", vec![op("b", "slow")], None, None).unwrap();
    let result = processor.start_job(&second);
    assert!(matches!(result, Err(BatchError::TooManyActiveJobs { .. })));
}

#[tokio::test]
async fn operation_longer_than_job_timeout_fails_the_job_without_waiting_for_it() {
    let gateway = Arc::new(MockGateway::new());
    gateway.script(
        "p",
        "slow",
        vec![ScriptedCall {
            envelope: Envelope::ok(Value::Int(1)),
            delay: Some(Duration::from_secs(10)),
        }],
    );

    let config = BatchConfigBuilder::new().default_timeout(Some(Duration::from_secs(1))).build();
    let processor = BatchProcessor::new(config, gateway);

    let job_id = processor.create_job("api", "p", vec![op("a", "slow")], None, None).unwrap();
    let started = tokio::time::Instant::now();
    processor.start_job(&job_id).unwrap();

    let job = wait_for_terminal(&processor, &job_id).await;
    assert!(started.elapsed() < Duration::from_secs(5), "job should fail on the timeout, not the op's own delay");
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap_or_default().contains("Timed out after 1"), "error was: {:?}", job.error);
}

#[tokio::test]
async fn cleanup_completed_jobs_removes_only_stale_terminal_jobs() {
    let gateway = Arc::new(MockGateway::new());
    gateway.script("p", "op", vec![ScriptedCall::from(Envelope::ok(Value::Int(1)))]);

    let processor = BatchProcessor::new(BatchConfig::default(), gateway);
    let job_id = processor.create_job("api", "p", vec![op("a", "op")], None, None).unwrap();
    processor.start_job(&job_id).unwrap();
    wait_for_terminal(&processor, &job_id).await;

    let removed = processor.cleanup_completed_jobs(Duration::from_secs(3600));
    assert_eq!(removed, 0, "job is too recent to be swept");

    let removed = processor.cleanup_completed_jobs(Duration::from_secs(0));
    assert_eq!(removed, 1);
    assert!(processor.get_job(&job_id).is_none());
}
