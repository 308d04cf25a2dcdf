//! Quota Admission Service
//!
//! Synchronous gate invoked before any upload proceeds. Checks, in order
//! and short-circuiting: rate limit, principal resolution, per-file size
//! limit, projected usage against the tier's storage limit. The projected
//! figure is the durable usage plus the principal's still-pending delta,
//! so a burst of approvals within one flush window cannot oversubscribe
//! the quota.
//!
//! Admission never mutates `storage_used_bytes` and never raises errors
//! for control flow: every call returns a structured `AdmissionResult`.
//! Infrastructure failures (store unreachable, read timeout) resolve to
//! `AdmissionUnavailable`, which is a deny — the gate fails closed.

use crate::policy::PolicyTable;
use crate::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::store::RecordStore;
use crate::types::{AdmissionReason, AdmissionResult, Principal, UploadAttemptRecord};
use crate::usage_queue::UsageUpdateQueue;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default bound on the durable principal read.
pub const DEFAULT_ADMISSION_TIMEOUT: Duration = Duration::from_secs(2);

/// The admission-control gate.
pub struct AdmissionService {
    record_store: Arc<dyn RecordStore>,
    rate_limiter: Arc<RateLimiter>,
    policies: PolicyTable,
    usage_queue: Arc<UsageUpdateQueue>,
    admission_timeout: Duration,
}

impl AdmissionService {
    pub fn new(
        record_store: Arc<dyn RecordStore>,
        rate_limiter: Arc<RateLimiter>,
        policies: PolicyTable,
        usage_queue: Arc<UsageUpdateQueue>,
        admission_timeout: Duration,
    ) -> Self {
        Self {
            record_store,
            rate_limiter,
            policies,
            usage_queue,
            admission_timeout,
        }
    }

    /// Decide whether an upload of `requested_bytes` may proceed for the
    /// principal. One audit row is appended per call; audit failures are
    /// logged and never change the decision.
    pub async fn check_admission(
        &self,
        principal_id: &str,
        requested_bytes: u64,
        client_addr: Option<&str>,
    ) -> AdmissionResult {
        if requested_bytes == 0 {
            let result = AdmissionResult::denied(AdmissionReason::InvalidRequest, 0);
            self.audit(principal_id, requested_bytes, &result, None, client_addr)
                .await;
            return result;
        }

        // Rate limit first. A denied acquire records nothing, so the denial
        // itself does not consume a second slot; an admitted acquire counts
        // regardless of how the remaining checks resolve, since either way
        // the attempt represented load.
        if let RateLimitDecision::Limited { retry_after_secs } =
            self.rate_limiter.try_acquire(principal_id)
        {
            let mut result = AdmissionResult::denied(AdmissionReason::RateLimitExceeded, 0);
            result.retry_after_secs = Some(retry_after_secs);
            self.audit(principal_id, requested_bytes, &result, None, client_addr)
                .await;
            return result;
        }

        // Live read of the durable source of truth, bounded. On timeout or
        // store failure the gate fails closed.
        let principal = match timeout(
            self.admission_timeout,
            self.record_store.get_principal(principal_id),
        )
        .await
        {
            Err(_) => {
                warn!(
                    principal_id,
                    timeout_ms = self.admission_timeout.as_millis() as u64,
                    "admission read timed out, denying"
                );
                let result = AdmissionResult::denied(AdmissionReason::AdmissionUnavailable, 0);
                self.audit(principal_id, requested_bytes, &result, None, client_addr)
                    .await;
                return result;
            }
            Ok(Err(e)) => {
                warn!(principal_id, error = %e, "admission read failed, denying");
                let result = AdmissionResult::denied(AdmissionReason::AdmissionUnavailable, 0);
                self.audit(principal_id, requested_bytes, &result, None, client_addr)
                    .await;
                return result;
            }
            Ok(Ok(None)) => {
                let result = AdmissionResult::denied(AdmissionReason::PrincipalNotFound, 0);
                self.audit(principal_id, requested_bytes, &result, None, client_addr)
                    .await;
                return result;
            }
            Ok(Ok(Some(principal))) => principal,
        };

        let policy = self.policies.policy_for(principal.tier);

        if requested_bytes > policy.max_file_size_bytes {
            let mut result = AdmissionResult::denied(
                AdmissionReason::FileTooLarge,
                principal.storage_used_bytes,
            );
            result.limit = Some(policy.storage_limit_bytes);
            result.requested_bytes = Some(requested_bytes);
            result.max_file_size_bytes = Some(policy.max_file_size_bytes);
            self.audit(
                principal_id,
                requested_bytes,
                &result,
                Some(&principal),
                client_addr,
            )
            .await;
            return result;
        }

        // Projected usage must include the not-yet-flushed delta, otherwise
        // many uploads could be approved before the first flush lands.
        let pending = self.usage_queue.pending_for(principal_id);
        let projected = saturating_add_signed(principal.storage_used_bytes, pending);

        if projected.saturating_add(requested_bytes) > policy.storage_limit_bytes {
            let mut result = AdmissionResult::denied(AdmissionReason::QuotaExceeded, projected);
            result.limit = Some(policy.storage_limit_bytes);
            result.requested_bytes = Some(requested_bytes);
            result.available_bytes = Some(policy.storage_limit_bytes.saturating_sub(projected));
            self.audit(
                principal_id,
                requested_bytes,
                &result,
                Some(&principal),
                client_addr,
            )
            .await;
            return result;
        }

        debug!(
            principal_id,
            requested_bytes,
            projected,
            limit = policy.storage_limit_bytes,
            "admission allowed"
        );
        let result = AdmissionResult::allowed(projected, policy.storage_limit_bytes);
        self.audit(
            principal_id,
            requested_bytes,
            &result,
            Some(&principal),
            client_addr,
        )
        .await;
        result
    }

    async fn audit(
        &self,
        principal_id: &str,
        requested_bytes: u64,
        result: &AdmissionResult,
        principal: Option<&Principal>,
        client_addr: Option<&str>,
    ) {
        let record = UploadAttemptRecord {
            principal_id: principal_id.to_string(),
            requested_bytes,
            allowed: result.allowed,
            reason: result.reason.clone(),
            tier: principal.map(|p| p.tier),
            timestamp: Utc::now(),
            client_addr: client_addr.map(|a| a.to_string()),
        };
        if let Err(e) = self.record_store.append_attempt(record).await {
            warn!(principal_id, error = %e, "failed to append admission audit record");
        }
    }
}

fn saturating_add_signed(base: u64, delta: i64) -> u64 {
    if delta >= 0 {
        base.saturating_add(delta as u64)
    } else {
        base.saturating_sub(delta.unsigned_abs())
    }
}
