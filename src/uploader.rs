//! Upload Retry Coordinator
//!
//! Submits file uploads in bounded-size parallel groups, classifies
//! failures as retryable vs terminal, and applies capped exponential
//! backoff between attempts. Groups of `max_parallel` files run
//! concurrently; groups execute sequentially. One file exhausting its
//! retries never blocks siblings or later groups.
//!
//! The backoff loop is a plain state machine over explicit result
//! variants; no errors are thrown for control flow, so every transition
//! is testable without a failure harness.

use crate::store::BlobStore;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Recognized batch options and their defaults.
#[derive(Debug, Clone)]
pub struct UploadBatchConfig {
    /// Files uploaded concurrently within one group.
    pub max_parallel: usize,
    /// Total attempts per file, including the first.
    pub max_retries: u32,
    /// Backoff before the second attempt; doubles per retry.
    pub base_delay: Duration,
    /// Ceiling on any single backoff wait.
    pub max_delay: Duration,
    /// Per-attempt upload timeout; expiry classifies as retryable.
    pub attempt_timeout: Duration,
}

impl Default for UploadBatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl UploadBatchConfig {
    /// Backoff after attempt `attempt` (1-based):
    /// `min(base_delay * 2^(attempt-1), max_delay)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

/// One file to upload: destination path plus its bytes.
#[derive(Debug, Clone)]
pub struct FileRef {
    pub id: String,
    pub principal_id: String,
    pub blob_path: String,
    pub size_bytes: u64,
    pub content: Bytes,
}

/// Classified upload attempt failure.
#[derive(Debug, Clone)]
pub enum UploadFailure {
    /// Connection-level failure. Retryable.
    Network(String),
    /// Attempt exceeded its timeout. Retryable.
    Timeout(String),
    /// HTTP-style status from the transport. 429 and 5xx are retryable.
    Http { status: u16, message: String },
    /// Rejected input. Terminal.
    Validation(String),
    /// Quota denied after admission changed mid-flight. Terminal, never
    /// retried.
    QuotaDenied(String),
}

impl UploadFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadFailure::Network(_) | UploadFailure::Timeout(_) => true,
            UploadFailure::Http { status, .. } => *status == 429 || *status >= 500,
            UploadFailure::Validation(_) | UploadFailure::QuotaDenied(_) => false,
        }
    }
}

impl fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadFailure::Network(msg) => write!(f, "network error: {}", msg),
            UploadFailure::Timeout(msg) => write!(f, "timeout: {}", msg),
            UploadFailure::Http { status, message } => {
                write!(f, "http {}: {}", status, message)
            }
            UploadFailure::Validation(msg) => write!(f, "validation error: {}", msg),
            UploadFailure::QuotaDenied(msg) => write!(f, "quota denied: {}", msg),
        }
    }
}

/// Lifecycle of one upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    Pending = 0,
    InFlight = 1,
    Succeeded = 2,
    FailedRetryable = 3,
    FailedTerminal = 4,
}

impl JobStatus {
    fn from_u8(value: u8) -> JobStatus {
        match value {
            1 => JobStatus::InFlight,
            2 => JobStatus::Succeeded,
            3 => JobStatus::FailedRetryable,
            4 => JobStatus::FailedTerminal,
            _ => JobStatus::Pending,
        }
    }
}

/// Shared, independently observable state of one upload job. Cheap to
/// clone; all fields are atomics so callers can poll while the job is in
/// flight.
#[derive(Clone)]
pub struct JobHandle {
    file_id: String,
    progress_percent: Arc<AtomicU64>,
    attempts: Arc<AtomicU32>,
    status: Arc<AtomicU8>,
}

impl JobHandle {
    fn new(file_id: String) -> Self {
        Self {
            file_id,
            progress_percent: Arc::new(AtomicU64::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
            status: Arc::new(AtomicU8::new(JobStatus::Pending as u8)),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// Progress 0-100. Reset to 0 when a retry starts; attempt count is
    /// preserved for diagnostics.
    pub fn progress_percent(&self) -> u64 {
        self.progress_percent.load(Ordering::Relaxed)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    fn set_status(&self, status: JobStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }
}

/// Write handle the transport uses to report attempt progress.
pub struct ProgressReporter {
    percent: Arc<AtomicU64>,
}

impl ProgressReporter {
    pub fn set_percent(&self, percent: u64) {
        self.percent.store(percent.min(100), Ordering::Relaxed);
    }
}

/// Transport seam: performs one upload attempt and classifies its own
/// failures. The coordinator owns retries and backoff.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn upload(
        &self,
        file: &FileRef,
        progress: &ProgressReporter,
    ) -> std::result::Result<(), UploadFailure>;
}

/// Transport writing to the blob store boundary. Failures are classified
/// from the store error message, mirroring how S3-style clients sniff
/// status codes out of error strings.
pub struct BlobStoreTransport {
    blob_store: Arc<dyn BlobStore>,
}

impl BlobStoreTransport {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        Self { blob_store }
    }

    fn classify(message: &str) -> UploadFailure {
        for status in [500u16, 502, 503, 429] {
            if message.contains(&status.to_string()) {
                return UploadFailure::Http {
                    status,
                    message: message.to_string(),
                };
            }
        }
        if message.contains("timeout") || message.contains("timed out") {
            return UploadFailure::Timeout(message.to_string());
        }
        if message.contains("connection") || message.contains("reset") {
            return UploadFailure::Network(message.to_string());
        }
        UploadFailure::Network(message.to_string())
    }
}

#[async_trait]
impl UploadTransport for BlobStoreTransport {
    async fn upload(
        &self,
        file: &FileRef,
        progress: &ProgressReporter,
    ) -> std::result::Result<(), UploadFailure> {
        progress.set_percent(0);
        self.blob_store
            .put(&file.blob_path, file.content.clone())
            .await
            .map_err(|e| Self::classify(&e.to_string()))?;
        progress.set_percent(100);
        Ok(())
    }
}

/// Terminal outcome of one upload job.
#[derive(Debug, Clone)]
pub struct UploadResult {
    pub file_id: String,
    pub blob_path: String,
    pub size_bytes: u64,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl UploadResult {
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Succeeded
    }
}

/// One file moving through the retry loop.
pub struct UploadJob {
    file: FileRef,
    handle: JobHandle,
}

impl UploadJob {
    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }
}

/// Orchestrates batched, retrying uploads against a transport.
pub struct UploadRetryCoordinator {
    transport: Arc<dyn UploadTransport>,
    config: UploadBatchConfig,
}

impl UploadRetryCoordinator {
    pub fn new(transport: Arc<dyn UploadTransport>, config: UploadBatchConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &UploadBatchConfig {
        &self.config
    }

    /// Wrap files into observable jobs without starting them.
    pub fn prepare(&self, files: Vec<FileRef>) -> Vec<UploadJob> {
        files
            .into_iter()
            .map(|file| UploadJob {
                handle: JobHandle::new(file.id.clone()),
                file,
            })
            .collect()
    }

    /// Upload a batch to terminal results, one per input file, in input
    /// order within each group.
    pub async fn upload_batch(&self, files: Vec<FileRef>) -> Vec<UploadResult> {
        let jobs = self.prepare(files);
        self.run(jobs).await
    }

    /// Run prepared jobs: groups of `max_parallel` concurrently, groups
    /// sequentially.
    pub async fn run(&self, mut jobs: Vec<UploadJob>) -> Vec<UploadResult> {
        let mut results = Vec::with_capacity(jobs.len());
        let group_size = self.config.max_parallel.max(1);

        while !jobs.is_empty() {
            let take = group_size.min(jobs.len());
            let group: Vec<UploadJob> = jobs.drain(..take).collect();
            let group_results =
                join_all(group.into_iter().map(|job| self.run_job(job))).await;
            results.extend(group_results);
        }
        results
    }

    async fn run_job(&self, job: UploadJob) -> UploadResult {
        let handle = job.handle.clone();
        let file = job.file;
        let mut last_failure: Option<UploadFailure> = None;

        handle.set_status(JobStatus::InFlight);
        for attempt in 1..=self.config.max_retries.max(1) {
            handle.attempts.store(attempt, Ordering::Relaxed);
            // Retry restarts the attempt from zero progress; the transport
            // does not support resumption.
            handle.progress_percent.store(0, Ordering::Relaxed);
            handle.set_status(JobStatus::InFlight);

            let reporter = ProgressReporter {
                percent: handle.progress_percent.clone(),
            };
            let outcome = timeout(
                self.config.attempt_timeout,
                self.transport.upload(&file, &reporter),
            )
            .await;

            let failure = match outcome {
                Ok(Ok(())) => {
                    handle.progress_percent.store(100, Ordering::Relaxed);
                    handle.set_status(JobStatus::Succeeded);
                    return UploadResult {
                        file_id: file.id,
                        blob_path: file.blob_path,
                        size_bytes: file.size_bytes,
                        status: JobStatus::Succeeded,
                        attempts: attempt,
                        last_error: None,
                    };
                }
                Ok(Err(failure)) => failure,
                Err(_) => UploadFailure::Timeout(format!(
                    "attempt exceeded {}ms",
                    self.config.attempt_timeout.as_millis()
                )),
            };

            if failure.is_retryable() && attempt < self.config.max_retries {
                let delay = self.config.backoff_delay(attempt);
                debug!(
                    file_id = %handle.file_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "upload attempt failed, backing off"
                );
                handle.set_status(JobStatus::FailedRetryable);
                last_failure = Some(failure);
                sleep(delay).await;
                continue;
            }

            warn!(
                file_id = %handle.file_id(),
                attempt,
                error = %failure,
                "upload failed terminally"
            );
            handle.set_status(JobStatus::FailedTerminal);
            return UploadResult {
                file_id: file.id,
                blob_path: file.blob_path,
                size_bytes: file.size_bytes,
                status: JobStatus::FailedTerminal,
                attempts: attempt,
                last_error: Some(failure.to_string()),
            };
        }

        // Only reachable with max_retries == 0 clamped to one attempt.
        handle.set_status(JobStatus::FailedTerminal);
        UploadResult {
            file_id: file.id,
            blob_path: file.blob_path,
            size_bytes: file.size_bytes,
            status: JobStatus::FailedTerminal,
            attempts: handle.attempts(),
            last_error: last_failure.map(|f| f.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Transport that fails the first `failures_before_success` attempts
    /// per file with the configured failure.
    struct FlakyTransport {
        failures_before_success: std::collections::HashMap<String, u32>,
        attempts_seen: dashmap::DashMap<String, u32>,
        failure: fn() -> UploadFailure,
    }

    impl FlakyTransport {
        fn new(failures: &[(&str, u32)], failure: fn() -> UploadFailure) -> Self {
            Self {
                failures_before_success: failures
                    .iter()
                    .map(|(id, n)| (id.to_string(), *n))
                    .collect(),
                attempts_seen: dashmap::DashMap::new(),
                failure,
            }
        }
    }

    #[async_trait]
    impl UploadTransport for FlakyTransport {
        async fn upload(
            &self,
            file: &FileRef,
            progress: &ProgressReporter,
        ) -> std::result::Result<(), UploadFailure> {
            let mut seen = self.attempts_seen.entry(file.id.clone()).or_insert(0);
            *seen += 1;
            let budget = self
                .failures_before_success
                .get(&file.id)
                .copied()
                .unwrap_or(0);
            if *seen <= budget {
                return Err((self.failure)());
            }
            progress.set_percent(100);
            Ok(())
        }
    }

    fn file(id: &str, size: u64) -> FileRef {
        FileRef {
            id: id.to_string(),
            principal_id: "p1".to_string(),
            blob_path: format!("uploads/p1/{}", id),
            size_bytes: size,
            content: Bytes::from(vec![0u8; size as usize]),
        }
    }

    fn fast_config() -> UploadBatchConfig {
        UploadBatchConfig {
            max_parallel: 3,
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_delay_doubles_then_caps() {
        let config = UploadBatchConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(8000));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(10000));
        assert_eq!(config.backoff_delay(30), Duration::from_millis(10000));
    }

    #[test]
    fn test_failure_classification() {
        assert!(UploadFailure::Network("reset".into()).is_retryable());
        assert!(UploadFailure::Timeout("t".into()).is_retryable());
        assert!(UploadFailure::Http {
            status: 503,
            message: "slow down".into()
        }
        .is_retryable());
        assert!(UploadFailure::Http {
            status: 429,
            message: "rate".into()
        }
        .is_retryable());
        assert!(!UploadFailure::Http {
            status: 403,
            message: "forbidden".into()
        }
        .is_retryable());
        assert!(!UploadFailure::Validation("bad".into()).is_retryable());
        assert!(!UploadFailure::QuotaDenied("over".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_batch_of_five_with_two_503_retries() {
        // Scenario: five files, two fail with 503 on the first attempt and
        // succeed on the second.
        let transport = Arc::new(FlakyTransport::new(
            &[("f2", 1), ("f4", 1)],
            || UploadFailure::Http {
                status: 503,
                message: "Service Unavailable".into(),
            },
        ));
        let coordinator = UploadRetryCoordinator::new(transport, fast_config());

        let files = (1..=5).map(|i| file(&format!("f{}", i), 10)).collect();
        let results = coordinator.upload_batch(files).await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.succeeded()));
        for result in &results {
            let expected = if result.file_id == "f2" || result.file_id == "f4" {
                2
            } else {
                1
            };
            assert_eq!(result.attempts, expected, "file {}", result.file_id);
        }
    }

    #[tokio::test]
    async fn test_retryable_exhaustion_is_terminal_after_max_retries() {
        let transport = Arc::new(FlakyTransport::new(&[("f1", 100)], || {
            UploadFailure::Network("connection reset".into())
        }));
        let coordinator = UploadRetryCoordinator::new(transport.clone(), fast_config());

        let results = coordinator.upload_batch(vec![file("f1", 10)]).await;
        assert_eq!(results[0].status, JobStatus::FailedTerminal);
        assert_eq!(results[0].attempts, 3);
        assert!(results[0].last_error.as_deref().unwrap().contains("reset"));
        assert_eq!(*transport.attempts_seen.get("f1").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_terminal_failure_never_retried() {
        let transport = Arc::new(FlakyTransport::new(&[("f1", 100)], || {
            UploadFailure::QuotaDenied("quota changed mid-flight".into())
        }));
        let coordinator = UploadRetryCoordinator::new(transport.clone(), fast_config());

        let results = coordinator.upload_batch(vec![file("f1", 10)]).await;
        assert_eq!(results[0].status, JobStatus::FailedTerminal);
        assert_eq!(results[0].attempts, 1);
        assert_eq!(*transport.attempts_seen.get("f1").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_file_does_not_block_siblings() {
        let transport = Arc::new(FlakyTransport::new(&[("f1", 100)], || {
            UploadFailure::Validation("rejected".into())
        }));
        let coordinator = UploadRetryCoordinator::new(transport, fast_config());

        let results = coordinator
            .upload_batch(vec![file("f1", 10), file("f2", 10), file("f3", 10), file("f4", 10)])
            .await;
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].status, JobStatus::FailedTerminal);
        assert!(results[1..].iter().all(|r| r.succeeded()));
    }

    #[tokio::test]
    async fn test_attempt_timeout_classified_retryable() {
        struct HangingTransport {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl UploadTransport for HangingTransport {
            async fn upload(
                &self,
                _file: &FileRef,
                progress: &ProgressReporter,
            ) -> std::result::Result<(), UploadFailure> {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    sleep(Duration::from_secs(60)).await;
                }
                progress.set_percent(100);
                Ok(())
            }
        }

        let config = UploadBatchConfig {
            attempt_timeout: Duration::from_millis(20),
            base_delay: Duration::from_millis(1),
            ..fast_config()
        };
        let coordinator = UploadRetryCoordinator::new(
            Arc::new(HangingTransport {
                calls: AtomicUsize::new(0),
            }),
            config,
        );

        let results = coordinator.upload_batch(vec![file("f1", 10)]).await;
        assert!(results[0].succeeded());
        assert_eq!(results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_handle_observability_across_retries() {
        let transport = Arc::new(FlakyTransport::new(&[("f1", 2)], || {
            UploadFailure::Http {
                status: 502,
                message: "bad gateway".into(),
            }
        }));
        let coordinator = UploadRetryCoordinator::new(transport, fast_config());

        let jobs = coordinator.prepare(vec![file("f1", 10)]);
        let handle = jobs[0].handle();
        assert_eq!(handle.status(), JobStatus::Pending);
        assert_eq!(handle.progress_percent(), 0);

        let results = coordinator.run(jobs).await;
        assert!(results[0].succeeded());
        // Attempt history survives retries; progress lands at 100.
        assert_eq!(handle.attempts(), 3);
        assert_eq!(handle.progress_percent(), 100);
        assert_eq!(handle.status(), JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_blob_transport_classifies_injected_503() {
        let blob_store = Arc::new(crate::store::MemoryBlobStore::new());
        blob_store.fail_next_puts(1);
        let transport = BlobStoreTransport::new(blob_store.clone());
        let reporter = ProgressReporter {
            percent: Arc::new(AtomicU64::new(0)),
        };

        let failure = transport
            .upload(&file("f1", 4), &reporter)
            .await
            .unwrap_err();
        assert!(failure.is_retryable());
        assert!(matches!(failure, UploadFailure::Http { status: 503, .. }));

        transport.upload(&file("f1", 4), &reporter).await.unwrap();
        assert!(blob_store.contains("uploads/p1/f1").await);
    }
}
