//! Property-based tests for the sliding-window rate limiter
//!
//! *For any* window capacity k, the (k+1)th attempt inside the window is
//! denied, the denial consumes no slot, and once the window elapses a
//! subsequent attempt is admitted again.

use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use quota_engine::admission::AdmissionService;
use quota_engine::policy::PolicyTable;
use quota_engine::rate_limiter::{RateLimitDecision, RateLimiter};
use quota_engine::store::MemoryRecordStore;
use quota_engine::types::{AdmissionReason, Principal, SubscriptionTier};
use quota_engine::usage_queue::UsageUpdateQueue;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[quickcheck]
fn prop_k_plus_first_attempt_denied(k: u8) -> TestResult {
    if k == 0 || k > 100 {
        return TestResult::discard();
    }
    let limiter = RateLimiter::new(k as u32, Duration::from_secs(60));
    let now = Instant::now();

    for i in 0..k {
        if limiter.try_acquire_at("p1", now) != RateLimitDecision::Admitted {
            return TestResult::error(format!("attempt {} unexpectedly denied", i + 1));
        }
    }
    match limiter.try_acquire_at("p1", now) {
        RateLimitDecision::Limited { .. } => {}
        RateLimitDecision::Admitted => {
            return TestResult::error("attempt k+1 unexpectedly admitted")
        }
    }
    // The denial consumed nothing.
    if limiter.attempts_in_window("p1") != k as usize {
        return TestResult::error("denied attempt consumed a slot");
    }
    TestResult::passed()
}

#[quickcheck]
fn prop_window_elapse_readmits(k: u8, extra_secs: u8) -> TestResult {
    if k == 0 || k > 50 {
        return TestResult::discard();
    }
    let window = Duration::from_secs(60);
    let limiter = RateLimiter::new(k as u32, window);
    let start = Instant::now();

    for _ in 0..k {
        limiter.try_acquire_at("p1", start);
    }
    let after = start + window + Duration::from_secs(extra_secs as u64);
    match limiter.try_acquire_at("p1", after) {
        RateLimitDecision::Admitted => TestResult::passed(),
        RateLimitDecision::Limited { .. } => {
            TestResult::error("attempt after window elapse still denied")
        }
    }
}

#[quickcheck]
fn prop_retry_after_never_exceeds_window(k: u8) -> TestResult {
    if k == 0 || k > 50 {
        return TestResult::discard();
    }
    let limiter = RateLimiter::new(k as u32, Duration::from_secs(60));
    let now = Instant::now();
    for _ in 0..k {
        limiter.try_acquire_at("p1", now);
    }
    match limiter.try_acquire_at("p1", now) {
        RateLimitDecision::Limited { retry_after_secs } => {
            if retry_after_secs > 60 {
                TestResult::error(format!("retry_after {} exceeds window", retry_after_secs))
            } else {
                TestResult::passed()
            }
        }
        RateLimitDecision::Admitted => TestResult::error("expected denial"),
    }
}

#[tokio::test]
async fn test_eleventh_admission_check_rate_limited() {
    // 11 admission checks inside one 60s window with a ceiling of 10: the
    // 11th must deny with a retry-after suggestion.
    let store = Arc::new(MemoryRecordStore::new());
    store
        .insert_principal(Principal {
            id: "p1".to_string(),
            tier: SubscriptionTier::Business,
            storage_used_bytes: 0,
            last_quota_warning_at: None,
        })
        .await;

    let service = AdmissionService::new(
        store,
        Arc::new(RateLimiter::new(10, Duration::from_secs(60))),
        PolicyTable::default(),
        Arc::new(UsageUpdateQueue::new()),
        Duration::from_secs(2),
    );

    for i in 0..10 {
        let result = service.check_admission("p1", 1_000, None).await;
        assert!(result.allowed, "check {} should pass", i + 1);
    }

    let eleventh = service.check_admission("p1", 1_000, None).await;
    assert!(!eleventh.allowed);
    assert_eq!(eleventh.reason, AdmissionReason::RateLimitExceeded);
    assert!(eleventh.retry_after_secs.is_some());
}

#[tokio::test]
async fn test_denied_admission_checks_still_consume_slots() {
    // Denials other than rate-limit denials represent load and count
    // against the window.
    let store = Arc::new(MemoryRecordStore::new());
    store
        .insert_principal(Principal {
            id: "p1".to_string(),
            tier: SubscriptionTier::Free,
            storage_used_bytes: 0,
            last_quota_warning_at: None,
        })
        .await;

    let limiter = Arc::new(RateLimiter::new(3, Duration::from_secs(60)));
    let service = AdmissionService::new(
        store,
        limiter.clone(),
        PolicyTable::default(),
        Arc::new(UsageUpdateQueue::new()),
        Duration::from_secs(2),
    );

    // Three oversized requests: each denied FileTooLarge, each consuming
    // a slot.
    for _ in 0..3 {
        let result = service.check_admission("p1", 50_000_000, None).await;
        assert_eq!(result.reason, AdmissionReason::FileTooLarge);
    }
    let fourth = service.check_admission("p1", 1_000, None).await;
    assert_eq!(fourth.reason, AdmissionReason::RateLimitExceeded);
}
