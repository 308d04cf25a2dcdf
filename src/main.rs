use quota_engine::{
    admission::AdmissionService,
    api::{self, ApiState},
    config::Config,
    flusher::BackgroundFlusher,
    logging::init_logging,
    policy::PolicyTable,
    rate_limiter::RateLimiter,
    reconciler::CleanupReconciler,
    shutdown::ShutdownCoordinator,
    store::{MemoryBlobStore, MemoryRecordStore, RecordStore},
    types::{Principal, SubscriptionTier},
    uploader::BlobStoreTransport,
    usage_queue::UsageUpdateQueue,
    Result,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    let _log_guard = init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting quota engine"
    );

    // The binary runs against in-memory stores; a deployment embeds the
    // library and provides its database- and object-store-backed
    // implementations of the same traits.
    let record_store = Arc::new(MemoryRecordStore::new());
    let blob_store = Arc::new(MemoryBlobStore::new());
    seed_demo_principals(&record_store).await;

    let usage_queue = Arc::new(UsageUpdateQueue::new());
    let rate_limiter = Arc::new(RateLimiter::new(
        config.quota.rate_limit.max_attempts_per_window,
        config.quota.rate_limit.window,
    ));
    let policies = PolicyTable::from_overrides(&config.quota.tiers);

    let admission = Arc::new(AdmissionService::new(
        record_store.clone() as Arc<dyn RecordStore>,
        rate_limiter,
        policies,
        usage_queue.clone(),
        config.quota.admission_timeout,
    ));

    let flusher = Arc::new(BackgroundFlusher::new(
        usage_queue.clone(),
        record_store.clone(),
        config.flush.interval,
    ));

    let reconciler = Arc::new(CleanupReconciler::new(
        record_store.clone(),
        blob_store.clone(),
        usage_queue.clone(),
        config.cleanup.stale_threshold,
        config.cleanup.blob_prefix.clone(),
    ));

    let coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);

    // Singleton periodic tasks. One instance of each per deployment; a
    // multi-process deployment must serialize these externally.
    let flusher_handle = flusher.start(coordinator.subscribe());
    let reconciler_handle = if config.cleanup.enabled {
        Some(reconciler.start(config.cleanup.sweep_interval, coordinator.subscribe()))
    } else {
        warn!("cleanup reconciler disabled by configuration");
        None
    };

    let state = Arc::new(ApiState::new(
        admission,
        record_store.clone(),
        Arc::new(BlobStoreTransport::new(blob_store)),
        usage_queue,
        flusher.clone(),
        reconciler,
        config.upload.clone(),
        &config.server,
        config.cleanup.blob_prefix.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.bind_addr, config.server.port)
        .parse()
        .map_err(|e| {
            quota_engine::QuotaError::ConfigError(format!("Invalid bind address: {}", e))
        })?;

    let api_shutdown = coordinator.subscribe();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(addr, state, api_shutdown).await {
            error!("API server failed: {}", e);
        }
    });

    coordinator.listen_for_signals().await?;

    // Bound the drain of background work; the flusher runs its final
    // synchronous drain inside its own shutdown path.
    let shutdown_timeout = coordinator.shutdown_timeout();
    if timeout(shutdown_timeout, flusher_handle).await.is_err() {
        warn!("flusher did not drain within the shutdown timeout");
    }
    if let Some(handle) = reconciler_handle {
        if timeout(shutdown_timeout, handle).await.is_err() {
            warn!("reconciler did not stop within the shutdown timeout");
        }
    }
    if timeout(shutdown_timeout, api_handle).await.is_err() {
        warn!("API server did not stop within the shutdown timeout");
    }

    info!("quota engine stopped");
    Ok(())
}

/// Seed a few principals so the in-memory demo answers admission checks
/// out of the box.
async fn seed_demo_principals(store: &MemoryRecordStore) {
    for (id, tier) in [
        ("demo-free", SubscriptionTier::Free),
        ("demo-pro", SubscriptionTier::Pro),
        ("demo-business", SubscriptionTier::Business),
    ] {
        store
            .insert_principal(Principal {
                id: id.to_string(),
                tier,
                storage_used_bytes: 0,
                last_quota_warning_at: None,
            })
            .await;
    }
    info!("seeded demo principals: demo-free, demo-pro, demo-business");
}
