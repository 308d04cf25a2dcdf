//! Usage Update Queue
//!
//! In-memory accumulator that coalesces many small "add N bytes" events
//! into one pending delta per principal. Upload completions enqueue here
//! instead of writing `storage_used_bytes` synchronously; the background
//! flusher drains the queue on its interval.
//!
//! The whole map is swapped out atomically at flush time (`std::mem::take`
//! under the lock), so enqueues racing a flush land in the fresh map:
//! never lost, never double-counted. Additive merges commute, so no
//! per-principal ordering lock is needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::warn;

/// Pending, unflushed usage deltas keyed by principal id.
///
/// Deltas may be negative (cleanup reconciliation credits bytes back).
/// State is process-local and intentionally not durable: pending deltas
/// lost on an ungraceful crash are a bounded-staleness trade-off, repaired
/// by the reconciler's drift correction.
pub struct UsageUpdateQueue {
    pending: Mutex<HashMap<String, i64>>,
    deltas_enqueued: AtomicU64,
    maps_swapped: AtomicU64,
}

impl UsageUpdateQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            deltas_enqueued: AtomicU64::new(0),
            maps_swapped: AtomicU64::new(0),
        }
    }

    /// Merge a delta into the principal's pending entry. Non-blocking
    /// beyond a short map lock; O(1).
    pub fn enqueue(&self, principal_id: &str, delta_bytes: i64) {
        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                // A panic while holding this lock leaves the map intact;
                // keep accepting deltas rather than dropping usage events.
                warn!("pending-delta map lock poisoned, continuing");
                poisoned.into_inner()
            }
        };
        *pending.entry(principal_id.to_string()).or_insert(0) += delta_bytes;
        self.deltas_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Live pending delta for one principal. Admission adds this to the
    /// durable figure so a burst of approvals inside one flush window
    /// cannot oversubscribe the quota.
    pub fn pending_for(&self, principal_id: &str) -> i64 {
        match self.pending.lock() {
            Ok(pending) => pending.get(principal_id).copied().unwrap_or(0),
            Err(poisoned) => poisoned
                .into_inner()
                .get(principal_id)
                .copied()
                .unwrap_or(0),
        }
    }

    /// Atomically replace the pending map with an empty one and return the
    /// snapshot. Concurrent enqueues during the subsequent flush land in
    /// the new map.
    pub fn swap(&self) -> HashMap<String, i64> {
        let snapshot = {
            let mut pending = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *pending)
        };
        self.maps_swapped.fetch_add(1, Ordering::Relaxed);
        snapshot
    }

    /// Number of principals with a pending delta.
    pub fn pending_principals(&self) -> usize {
        match self.pending.lock() {
            Ok(pending) => pending.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn deltas_enqueued(&self) -> u64 {
        self.deltas_enqueued.load(Ordering::Relaxed)
    }
}

impl Default for UsageUpdateQueue {
    fn default() -> Self {
        Self::new()
    }
}
