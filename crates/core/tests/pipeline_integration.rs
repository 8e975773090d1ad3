//! Integration tests for composed handler pipelines

#![cfg(feature = "runtime")]

mod common;

use std::time::Duration;

use common::{init_tracing, ServiceError};
use faultline_core::testing::CallCounter;
use faultline_core::{
    assert_eventually, AsyncExecutor, Bulkhead, BulkheadConfig, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, ErrorKind, Fallback, FaultTolerance, FtError, RetryConfig,
    RetryEngine, Scheduler, TimeoutConfig, TimeoutGuard, WorkerPool,
};

/// Validates a full stack: timeout, breaker, retry and async dispatch.
///
/// # Test Steps
/// 1. Compose timeout (innermost), breaker, retry and executor (outermost)
/// 2. Let the first attempt hang past the timeout
/// 3. Verify the second attempt succeeds and the breaker saw both attempts
#[tokio::test(flavor = "multi_thread")]
async fn test_full_stack_recovers_from_hang() {
    init_tracing();
    let scheduler = Scheduler::current().unwrap();
    let guard = TimeoutGuard::with_scheduler(
        TimeoutConfig::builder().timeout(Duration::from_millis(50)).build().unwrap(),
        scheduler.clone(),
    )
    .unwrap();
    let breaker =
        CircuitBreaker::with_scheduler(CircuitBreakerConfig::default(), scheduler.clone()).unwrap();
    let retry = RetryEngine::with_scheduler(
        RetryConfig::builder().fixed_delay(3, Duration::from_millis(5)).build().unwrap(),
        scheduler,
    )
    .unwrap();
    let pipeline = FaultTolerance::builder()
        .add_timeout(guard)
        .add_breaker(breaker.clone())
        .add_retry(retry.clone())
        .add_async(AsyncExecutor::with_pool(WorkerPool::current().unwrap()))
        .build();

    let counter = CallCounter::new();
    let hits = counter.clone();
    let value = pipeline
        .invoke(move || {
            let call = hits.hit();
            async move {
                if call == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, FtError>(call)
            }
        })
        .await
        .unwrap();

    assert_eq!(value, 1);
    assert_eq!(counter.count(), 2);
    assert_eq!(retry.retry_counter(), 1);
    let snapshot = breaker.snapshot();
    assert_eq!(snapshot.window_len, 2);
    assert_eq!(snapshot.window_failures, 1);
}

/// Validates that a breaker inside a pipeline opens and later recovers.
///
/// # Test Steps
/// 1. Fail enough calls to open the breaker
/// 2. Verify further calls short-circuit without running the work
/// 3. Wait for half-open and verify a good call closes it again
#[tokio::test(flavor = "multi_thread")]
async fn test_breaker_in_pipeline_recovers() {
    init_tracing();
    let breaker = CircuitBreaker::with_scheduler(
        CircuitBreakerConfig::builder()
            .volume(3)
            .ratio(60)
            .delay(Duration::from_millis(200))
            .build()
            .unwrap(),
        Scheduler::current().unwrap(),
    )
    .unwrap();
    let pipeline = FaultTolerance::builder().add(breaker.clone()).build();

    for _ in 0..3 {
        let error = pipeline
            .invoke(|| async { Err::<(), _>(ServiceError::new("backend down")) })
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Failed);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let counter = CallCounter::new();
    let hits = counter.clone();
    let error = pipeline
        .invoke(move || {
            hits.hit();
            async { Ok::<_, FtError>(()) }
        })
        .await
        .unwrap_err();
    assert!(error.is_circuit_open());
    assert_eq!(counter.count(), 0);

    assert_eventually!(Duration::from_secs(2), breaker.state() == CircuitState::HalfOpen);
    pipeline.invoke(|| async { Ok::<_, FtError>(()) }).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Validates a bulkhead shared by concurrent callers with a fallback for
/// rejected calls.
///
/// # Test Steps
/// 1. Compose a bulkhead (2 running, 1 queued) with a rejection fallback
/// 2. Start six slow calls at once from separate tasks
/// 3. Verify three ran, three were answered by the fallback and nothing is
///    left in flight
#[tokio::test(flavor = "multi_thread")]
async fn test_bulkhead_sheds_load_to_fallback() {
    init_tracing();
    let bulkhead = Bulkhead::with_scheduler(
        BulkheadConfig::builder().max_concurrent(2).max_queue(1).build().unwrap(),
        Scheduler::current().unwrap(),
    )
    .unwrap();
    let fallback = Fallback::builder(|_error| async { Ok("shed") })
        .apply_on_kind(ErrorKind::Rejected)
        .build();
    let pipeline =
        FaultTolerance::builder().add_bulkhead(bulkhead.clone()).add_fallback(fallback).build();

    let counter = CallCounter::new();
    let handles: Vec<_> = (0..6)
        .map(|_| {
            let hits = counter.clone();
            pipeline.invoke(move || {
                hits.hit();
                async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, ServiceError>("served")
                }
            })
        })
        .collect();
    let mut tasks = Vec::new();
    for handle in handles {
        tasks.push(tokio::spawn(handle));
    }

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().unwrap());
    }

    assert_eq!(outcomes.iter().filter(|outcome| **outcome == "served").count(), 3);
    assert_eq!(outcomes.iter().filter(|outcome| **outcome == "shed").count(), 3);
    assert_eq!(counter.count(), 3);
    let snapshot = bulkhead.snapshot();
    assert_eq!((snapshot.in_flight, snapshot.queued, snapshot.rejected), (0, 0, 3));
}
