//! Backoff schedule and retry timing
//!
//! The wait after attempt k is min(base_delay * 2^(k-1), max_delay), and a
//! file that succeeds only on its final attempt accumulates every scheduled
//! wait before finishing.

use async_trait::async_trait;
use bytes::Bytes;
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use quota_engine::uploader::{
    FileRef, JobStatus, ProgressReporter, UploadBatchConfig, UploadFailure,
    UploadRetryCoordinator, UploadTransport,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[quickcheck]
fn prop_backoff_doubles_until_cap(base_ms: u16, attempt: u8) -> TestResult {
    if base_ms == 0 || attempt == 0 || attempt > 20 {
        return TestResult::discard();
    }
    let config = UploadBatchConfig {
        base_delay: Duration::from_millis(base_ms as u64),
        max_delay: Duration::from_millis(base_ms as u64 * 16),
        ..Default::default()
    };
    let expected_uncapped = base_ms as u128 * (1u128 << (attempt as u32 - 1));
    let expected = expected_uncapped.min(config.max_delay.as_millis());
    TestResult::from_bool(config.backoff_delay(attempt as u32).as_millis() == expected)
}

#[quickcheck]
fn prop_backoff_monotonic_and_capped(base_ms: u16, max_ms: u16) -> TestResult {
    if base_ms == 0 || max_ms == 0 {
        return TestResult::discard();
    }
    let config = UploadBatchConfig {
        base_delay: Duration::from_millis(base_ms as u64),
        max_delay: Duration::from_millis(max_ms as u64),
        ..Default::default()
    };
    let mut previous = Duration::ZERO;
    for attempt in 1..=40u32 {
        let delay = config.backoff_delay(attempt);
        if delay > config.max_delay || delay < previous {
            return TestResult::failed();
        }
        previous = delay;
    }
    TestResult::passed()
}

/// Transport that fails every attempt until the last allowed one.
struct SucceedOnFinalAttempt {
    succeed_on: u32,
    calls: AtomicU32,
}

#[async_trait]
impl UploadTransport for SucceedOnFinalAttempt {
    async fn upload(
        &self,
        _file: &FileRef,
        progress: &ProgressReporter,
    ) -> std::result::Result<(), UploadFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call < self.succeed_on {
            return Err(UploadFailure::Http {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }
        progress.set_percent(100);
        Ok(())
    }
}

fn one_file() -> FileRef {
    FileRef {
        id: "f1".to_string(),
        principal_id: "p1".to_string(),
        blob_path: "uploads/p1/f1".to_string(),
        size_bytes: 16,
        content: Bytes::from_static(&[0u8; 16]),
    }
}

#[tokio::test]
async fn test_elapsed_covers_every_scheduled_wait() {
    let config = UploadBatchConfig {
        max_parallel: 3,
        max_retries: 3,
        base_delay: Duration::from_millis(40),
        max_delay: Duration::from_millis(400),
        attempt_timeout: Duration::from_secs(5),
    };
    let transport = Arc::new(SucceedOnFinalAttempt {
        succeed_on: 3,
        calls: AtomicU32::new(0),
    });
    let coordinator = UploadRetryCoordinator::new(transport.clone(), config.clone());

    let start = Instant::now();
    let results = coordinator.upload_batch(vec![one_file()]).await;
    let elapsed = start.elapsed();

    assert_eq!(results[0].status, JobStatus::Succeeded);
    assert_eq!(results[0].attempts, 3);
    // Waits after attempts 1 and 2: 40ms + 80ms.
    let scheduled = config.backoff_delay(1) + config.backoff_delay(2);
    assert!(
        elapsed >= scheduled,
        "elapsed {:?} shorter than scheduled backoff {:?}",
        elapsed,
        scheduled
    );
}

#[tokio::test]
async fn test_no_wait_after_final_failed_attempt() {
    // All three attempts fail; the terminal attempt must not sleep.
    let config = UploadBatchConfig {
        max_parallel: 3,
        max_retries: 3,
        base_delay: Duration::from_millis(30),
        max_delay: Duration::from_millis(300),
        attempt_timeout: Duration::from_secs(5),
    };
    let transport = Arc::new(SucceedOnFinalAttempt {
        succeed_on: u32::MAX,
        calls: AtomicU32::new(0),
    });
    let coordinator = UploadRetryCoordinator::new(transport.clone(), config.clone());

    let start = Instant::now();
    let results = coordinator.upload_batch(vec![one_file()]).await;
    let elapsed = start.elapsed();

    assert_eq!(results[0].status, JobStatus::FailedTerminal);
    assert_eq!(results[0].attempts, 3);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    // Only the two inter-attempt waits plus slack, never a third.
    let ceiling = config.backoff_delay(1) + config.backoff_delay(2) + Duration::from_millis(150);
    assert!(
        elapsed < ceiling,
        "elapsed {:?} suggests a wait after the terminal attempt",
        elapsed
    );
}
