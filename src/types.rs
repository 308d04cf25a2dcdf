//! Core Types Module
//!
//! Shared domain types for quota admission, usage accounting, uploads,
//! and reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subscription tier of a principal. Quota policy is a pure function of this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Business,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Pro => "pro",
            SubscriptionTier::Business => "business",
        }
    }
}

/// The quota-bearing entity (a user or workspace).
///
/// `storage_used_bytes` is the durable source of truth for usage. It is
/// adjusted only by the background flusher (additive) and the cleanup
/// reconciler (corrective); request-handling code never writes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub tier: SubscriptionTier,
    pub storage_used_bytes: u64,
    /// Advisory only; set when a usage warning was last surfaced to the user.
    #[serde(default)]
    pub last_quota_warning_at: Option<DateTime<Utc>>,
}

/// Storage limits derived from a subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub storage_limit_bytes: u64,
    pub max_file_size_bytes: u64,
}

/// Reason code attached to an admission decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionReason {
    Allowed,
    InvalidRequest,
    PrincipalNotFound,
    RateLimitExceeded,
    FileTooLarge,
    QuotaExceeded,
    /// Infrastructure failure (store unreachable or timed out). Always a deny.
    AdmissionUnavailable,
}

/// Structured result of an admission check. Never raised as an error;
/// callers branch on `allowed` / `reason`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionResult {
    pub allowed: bool,
    pub reason: AdmissionReason,
    /// Durable usage plus any pending (unflushed) delta at decision time.
    pub current_usage: u64,
    /// Storage limit for the principal's tier, if it could be resolved.
    pub limit: Option<u64>,
    /// Remaining space, populated on `QuotaExceeded` for user messaging.
    pub available_bytes: Option<u64>,
    /// Requested file size, echoed back on `FileTooLarge`.
    pub requested_bytes: Option<u64>,
    /// Max file size for the tier, populated on `FileTooLarge`.
    pub max_file_size_bytes: Option<u64>,
    /// Suggested wait before retrying, populated on `RateLimitExceeded`.
    pub retry_after_secs: Option<u64>,
}

impl AdmissionResult {
    /// Denied result carrying only a reason and the usage known at the time.
    pub fn denied(reason: AdmissionReason, current_usage: u64) -> Self {
        Self {
            allowed: false,
            reason,
            current_usage,
            limit: None,
            available_bytes: None,
            requested_bytes: None,
            max_file_size_bytes: None,
            retry_after_secs: None,
        }
    }

    pub fn allowed(current_usage: u64, limit: u64) -> Self {
        Self {
            allowed: true,
            reason: AdmissionReason::Allowed,
            current_usage,
            limit: Some(limit),
            available_bytes: Some(limit.saturating_sub(current_usage)),
            requested_bytes: None,
            max_file_size_bytes: None,
            retry_after_secs: None,
        }
    }
}

/// Append-only audit row, one per admission check. Used for observability
/// only, never for quota arithmetic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAttemptRecord {
    pub principal_id: String,
    pub requested_bytes: u64,
    pub allowed: bool,
    pub reason: AdmissionReason,
    pub tier: Option<SubscriptionTier>,
    pub timestamp: DateTime<Utc>,
    pub client_addr: Option<String>,
}

/// Durable row describing one upload. Created when an admitted upload
/// starts; `completed_at` is set once the blob write succeeded. Rows that
/// never complete are reclaimed by the cleanup reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    pub principal_id: String,
    pub blob_path: String,
    pub size_bytes: u64,
    /// Whether `size_bytes` was optimistically counted toward usage before
    /// completion. Reclaiming such a row must credit the bytes back.
    pub size_counted: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A blob as returned from a paginated store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub path: String,
    pub size_bytes: u64,
}

/// Report produced by one reconciliation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub records_removed: u64,
    pub blobs_removed: u64,
    /// Absolute bytes credited back to principals for reclaimed records.
    pub usage_bytes_corrected: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.records_removed == 0 && self.blobs_removed == 0 && self.usage_bytes_corrected == 0
    }
}
