//! Cleanup Reconciler
//!
//! Scheduled sweep that repairs drift between the durable record store
//! and the blob store. Phase 1 reclaims upload records that never
//! completed past an age threshold, deleting the record and its blob and
//! crediting back any optimistically counted bytes. Phase 2 lists blobs
//! under the upload prefix and deletes any with no matching record.
//!
//! Every deletion is logged before it executes, and the sweep is
//! idempotent: a second pass with no intervening uploads reports zeros.
//! A candidate whose deletion fails is logged and skipped, not fatal; it
//! is picked up again on the next sweep. Usage corrections go through the
//! usage update queue, never through a transaction shared with the
//! flusher.

use crate::shutdown::ShutdownSignal;
use crate::store::{BlobStore, RecordStore};
use crate::types::SweepReport;
use crate::usage_queue::UsageUpdateQueue;
use crate::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Default age past which an incomplete upload is reclaimed.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(24 * 3600);

/// Default interval between scheduled sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Singleton periodic task auditing store consistency.
pub struct CleanupReconciler {
    record_store: Arc<dyn RecordStore>,
    blob_store: Arc<dyn BlobStore>,
    usage_queue: Arc<UsageUpdateQueue>,
    stale_threshold: Duration,
    /// Listing prefix under which this deployment's upload blobs live.
    blob_prefix: String,
    sweeps_completed: AtomicU64,
}

impl CleanupReconciler {
    pub fn new(
        record_store: Arc<dyn RecordStore>,
        blob_store: Arc<dyn BlobStore>,
        usage_queue: Arc<UsageUpdateQueue>,
        stale_threshold: Duration,
        blob_prefix: String,
    ) -> Self {
        Self {
            record_store,
            blob_store,
            usage_queue,
            stale_threshold,
            blob_prefix,
            sweeps_completed: AtomicU64::new(0),
        }
    }

    /// Spawn the periodic sweep loop. Exactly one instance per deployment;
    /// multi-process deployments serialize this externally.
    pub fn start(
        self: &Arc<Self>,
        sweep_interval: Duration,
        mut shutdown: ShutdownSignal,
    ) -> JoinHandle<()> {
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = sweep_interval.as_secs(),
                "cleanup reconciler started"
            );
            let mut ticker = interval(sweep_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match reconciler.run_sweep().await {
                            Ok(report) if !report.is_empty() => {
                                info!(
                                    records_removed = report.records_removed,
                                    blobs_removed = report.blobs_removed,
                                    usage_bytes_corrected = report.usage_bytes_corrected,
                                    "reconciliation sweep corrected drift"
                                );
                            }
                            Ok(_) => debug!("reconciliation sweep found nothing to repair"),
                            Err(e) => warn!(error = %e, "reconciliation sweep failed"),
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        info!("cleanup reconciler received shutdown signal");
                        break;
                    }
                }
            }
        })
    }

    /// Run one full sweep: stale partial uploads, then orphaned blobs.
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.sweep_stale_partials(&mut report).await?;
        self.sweep_orphan_blobs(&mut report).await?;
        self.sweeps_completed.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    pub fn sweeps_completed(&self) -> u64 {
        self.sweeps_completed.load(Ordering::Relaxed)
    }

    /// Phase 1: records of uploads that never completed within the
    /// threshold. The record and any blob it points at are removed, and
    /// optimistically counted bytes are credited back via the queue.
    async fn sweep_stale_partials(&self, report: &mut SweepReport) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let stale = self.record_store.incomplete_uploads_before(cutoff).await?;

        for record in stale {
            info!(
                upload_id = %record.id,
                principal_id = %record.principal_id,
                blob_path = %record.blob_path,
                size_bytes = record.size_bytes,
                "removing stale partial upload"
            );

            // Blob first, then record, then credit. A failure at any step
            // leaves the record in place so the next sweep retries the
            // whole candidate; the credit is only enqueued once the record
            // is gone, so it can never be applied twice.
            match self.blob_exists(&record.blob_path).await {
                Ok(true) => match self.blob_store.delete(&record.blob_path).await {
                    Ok(()) => report.blobs_removed += 1,
                    Err(e) => {
                        warn!(
                            blob_path = %record.blob_path,
                            error = %e,
                            "failed to delete stale partial blob, skipping candidate"
                        );
                        continue;
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        blob_path = %record.blob_path,
                        error = %e,
                        "failed to probe stale partial blob, skipping candidate"
                    );
                    continue;
                }
            }

            if let Err(e) = self.record_store.delete_upload_record(&record.id).await {
                warn!(
                    upload_id = %record.id,
                    error = %e,
                    "failed to delete stale upload record, skipping candidate"
                );
                continue;
            }
            report.records_removed += 1;

            if record.size_counted {
                self.usage_queue
                    .enqueue(&record.principal_id, -(record.size_bytes as i64));
                report.usage_bytes_corrected += record.size_bytes;
            }
        }
        Ok(())
    }

    /// Phase 2: blobs under the prefix with no matching record. The known
    /// path set is read after phase 1 so freshly deleted records cannot
    /// keep their blobs alive.
    async fn sweep_orphan_blobs(&self, report: &mut SweepReport) -> Result<()> {
        let known_paths = self.record_store.known_blob_paths().await?;
        let mut page_token = None;

        loop {
            let (page, next_token) = self
                .blob_store
                .list(&self.blob_prefix, page_token)
                .await?;

            for object in page {
                if !known_paths.contains(&object.path) {
                    info!(
                        blob_path = %object.path,
                        size_bytes = object.size_bytes,
                        "removing orphaned blob"
                    );
                    match self.blob_store.delete(&object.path).await {
                        Ok(()) => report.blobs_removed += 1,
                        Err(e) => warn!(
                            blob_path = %object.path,
                            error = %e,
                            "failed to delete orphaned blob, skipping"
                        ),
                    }
                }
            }

            match next_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(())
    }

    /// Presence probe expressed through the listing contract: a one-page
    /// listing keyed at the exact path.
    async fn blob_exists(&self, path: &str) -> Result<bool> {
        let (page, _) = self.blob_store.list(path, None).await?;
        Ok(page.iter().any(|object| object.path == path))
    }
}
