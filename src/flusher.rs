//! Background Flusher
//!
//! Singleton periodic task that drains the usage update queue and commits
//! accumulated deltas to the durable record store, one additive update per
//! principal. Decouples upload latency from persistence latency: uploads
//! only enqueue, and usage becomes durable within one flush interval.
//!
//! Failure handling: a principal whose durable update fails has its delta
//! merged back into the live map and retried next cycle; a bounded streak
//! of consecutive failures is logged as a persistent anomaly but never
//! halts the loop. A delta for a deleted principal is logged and dropped,
//! since no durable counter remains to credit.

use crate::shutdown::ShutdownSignal;
use crate::store::RecordStore;
use crate::usage_queue::UsageUpdateQueue;
use crate::QuotaError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Default interval between flush cycles.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive per-principal failures before the anomaly log fires.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Outcome of one flush cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushCycleReport {
    /// Principals whose delta was committed this cycle.
    pub principals_flushed: u64,
    /// Net bytes applied across all committed deltas (absolute sum).
    pub bytes_applied: u64,
    /// Principals whose delta failed and was re-enqueued.
    pub failures: u64,
    /// Deltas dropped because the principal no longer exists.
    pub dropped_missing_principal: u64,
    pub duration_ms: u64,
}

/// Periodic task committing pending usage deltas to durable storage.
pub struct BackgroundFlusher {
    queue: Arc<UsageUpdateQueue>,
    record_store: Arc<dyn RecordStore>,
    flush_interval: Duration,
    /// Consecutive failure streak per principal, cleared on success.
    failure_streaks: Mutex<HashMap<String, u32>>,
    cycles_completed: AtomicU64,
    total_flushed: AtomicU64,
}

impl BackgroundFlusher {
    pub fn new(
        queue: Arc<UsageUpdateQueue>,
        record_store: Arc<dyn RecordStore>,
        flush_interval: Duration,
    ) -> Self {
        Self {
            queue,
            record_store,
            flush_interval,
            failure_streaks: Mutex::new(HashMap::new()),
            cycles_completed: AtomicU64::new(0),
            total_flushed: AtomicU64::new(0),
        }
    }

    /// Spawn the periodic flush loop. Exactly one instance per deployment
    /// must run; multi-process deployments serialize this externally.
    pub fn start(self: &Arc<Self>, mut shutdown: ShutdownSignal) -> JoinHandle<()> {
        let flusher = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                interval_secs = flusher.flush_interval.as_secs(),
                "background flusher started"
            );
            let mut ticker = interval(flusher.flush_interval);
            // The first tick fires immediately; skip it so an enqueue racing
            // startup still sees a full interval of batching.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = flusher.run_cycle().await;
                        if report.principals_flushed > 0 || report.failures > 0 {
                            debug!(
                                flushed = report.principals_flushed,
                                bytes = report.bytes_applied,
                                failures = report.failures,
                                duration_ms = report.duration_ms,
                                "flush cycle completed"
                            );
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => {
                        info!("background flusher received shutdown signal, draining");
                        let report = flusher.drain().await;
                        info!(
                            flushed = report.principals_flushed,
                            failures = report.failures,
                            "final flush drain completed"
                        );
                        break;
                    }
                }
            }
        })
    }

    /// Run exactly one flush cycle: swap the pending map, then apply one
    /// durable additive update per principal. Public so tests (and the
    /// shutdown drain) can drive cycles deterministically.
    pub async fn run_cycle(&self) -> FlushCycleReport {
        let start = Instant::now();
        let snapshot = self.queue.swap();
        let mut report = FlushCycleReport::default();

        for (principal_id, delta) in snapshot {
            if delta == 0 {
                continue;
            }
            match self.record_store.add_storage_used(&principal_id, delta).await {
                Ok(()) => {
                    report.principals_flushed += 1;
                    report.bytes_applied += delta.unsigned_abs();
                    self.clear_streak(&principal_id);
                }
                Err(QuotaError::PrincipalNotFound(_)) => {
                    // Principal deleted with a delta still pending: nothing
                    // durable remains to credit, so the delta is dropped.
                    warn!(
                        principal_id,
                        delta, "dropping pending delta for deleted principal"
                    );
                    report.dropped_missing_principal += 1;
                    self.clear_streak(&principal_id);
                }
                Err(e) => {
                    // Merge back into the live map so the delta is retried
                    // next cycle rather than lost.
                    self.queue.enqueue(&principal_id, delta);
                    report.failures += 1;
                    let streak = self.bump_streak(&principal_id);
                    if streak >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            principal_id,
                            consecutive_failures = streak,
                            error = %e,
                            "persistent flush failure for principal"
                        );
                    } else {
                        warn!(principal_id, error = %e, "flush failed, delta re-enqueued");
                    }
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.total_flushed
            .fetch_add(report.principals_flushed, Ordering::Relaxed);
        report
    }

    /// Final synchronous drain on graceful shutdown. Runs one cycle; a
    /// delta that fails here is back in the in-memory map and is lost with
    /// the process, which is the accepted crash trade-off.
    pub async fn drain(&self) -> FlushCycleReport {
        self.run_cycle().await
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    fn bump_streak(&self, principal_id: &str) -> u32 {
        let mut streaks = self
            .failure_streaks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let streak = streaks.entry(principal_id.to_string()).or_insert(0);
        *streak += 1;
        *streak
    }

    fn clear_streak(&self, principal_id: &str) {
        let mut streaks = self
            .failure_streaks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        streaks.remove(principal_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use crate::types::{Principal, SubscriptionTier};

    async fn seed(store: &MemoryRecordStore, id: &str, used: u64) {
        store
            .insert_principal(Principal {
                id: id.to_string(),
                tier: SubscriptionTier::Pro,
                storage_used_bytes: used,
                last_quota_warning_at: None,
            })
            .await;
    }

    fn flusher(
        queue: Arc<UsageUpdateQueue>,
        store: Arc<MemoryRecordStore>,
    ) -> BackgroundFlusher {
        BackgroundFlusher::new(queue, store, DEFAULT_FLUSH_INTERVAL)
    }

    #[tokio::test]
    async fn test_single_cycle_commits_merged_delta() {
        let queue = Arc::new(UsageUpdateQueue::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed(&store, "p1", 1_000).await;

        queue.enqueue("p1", 100);
        queue.enqueue("p1", 200);

        let report = flusher(queue.clone(), store.clone()).run_cycle().await;
        assert_eq!(report.principals_flushed, 1);
        assert_eq!(report.bytes_applied, 300);

        let p = store.get_principal("p1").await.unwrap().unwrap();
        assert_eq!(p.storage_used_bytes, 1_300);
        assert_eq!(queue.pending_for("p1"), 0);
    }

    #[tokio::test]
    async fn test_failed_delta_requeued_and_retried() {
        let queue = Arc::new(UsageUpdateQueue::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed(&store, "p1", 0).await;

        queue.enqueue("p1", 500);
        store.fail_next_usage_updates(1);

        let flusher = flusher(queue.clone(), store.clone());
        let first = flusher.run_cycle().await;
        assert_eq!(first.failures, 1);
        assert_eq!(first.principals_flushed, 0);
        // Delta is back in the live map, not lost.
        assert_eq!(queue.pending_for("p1"), 500);

        let second = flusher.run_cycle().await;
        assert_eq!(second.principals_flushed, 1);
        let p = store.get_principal("p1").await.unwrap().unwrap();
        assert_eq!(p.storage_used_bytes, 500);
    }

    #[tokio::test]
    async fn test_one_principal_failure_does_not_block_others() {
        let queue = Arc::new(UsageUpdateQueue::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed(&store, "p1", 0).await;
        seed(&store, "p2", 0).await;

        queue.enqueue("p1", 100);
        queue.enqueue("p2", 200);
        // Exactly one of the two per-principal updates fails.
        store.fail_next_usage_updates(1);

        let report = flusher(queue.clone(), store.clone()).run_cycle().await;
        assert_eq!(report.principals_flushed, 1);
        assert_eq!(report.failures, 1);

        let flushed: u64 = store.get_principal("p1").await.unwrap().unwrap().storage_used_bytes
            + store.get_principal("p2").await.unwrap().unwrap().storage_used_bytes;
        // Whichever order the map iterated, exactly one delta landed.
        assert!(flushed == 100 || flushed == 200);
    }

    #[tokio::test]
    async fn test_deleted_principal_delta_dropped() {
        let queue = Arc::new(UsageUpdateQueue::new());
        let store = Arc::new(MemoryRecordStore::new());
        queue.enqueue("ghost", 1_000);

        let report = flusher(queue.clone(), store).run_cycle().await;
        assert_eq!(report.dropped_missing_principal, 1);
        assert_eq!(report.failures, 0);
        assert_eq!(queue.pending_for("ghost"), 0);
    }

    #[tokio::test]
    async fn test_negative_delta_reduces_usage() {
        let queue = Arc::new(UsageUpdateQueue::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed(&store, "p1", 1_000).await;

        queue.enqueue("p1", -400);
        flusher(queue, store.clone()).run_cycle().await;

        let p = store.get_principal("p1").await.unwrap().unwrap();
        assert_eq!(p.storage_used_bytes, 600);
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending() {
        let queue = Arc::new(UsageUpdateQueue::new());
        let store = Arc::new(MemoryRecordStore::new());
        seed(&store, "p1", 0).await;

        let flusher = Arc::new(BackgroundFlusher::new(
            queue.clone(),
            store.clone(),
            Duration::from_secs(3600), // never ticks during the test
        ));
        let coordinator = crate::shutdown::ShutdownCoordinator::new(Duration::from_secs(5));
        let handle = flusher.start(coordinator.subscribe());

        queue.enqueue("p1", 250);
        coordinator.signal_shutdown();
        handle.await.unwrap();

        let p = store.get_principal("p1").await.unwrap().unwrap();
        assert_eq!(p.storage_used_bytes, 250);
    }
}
