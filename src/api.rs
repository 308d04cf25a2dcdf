//! HTTP API Module
//!
//! Thin hyper surface over the engine's boundary contracts: the admission
//! check consumed by the upload route handler, the batch upload endpoint,
//! the scheduler-triggered cleanup sweep, and a health snapshot. Route
//! handling beyond these contracts (auth, tenant routing, UI) lives in
//! the surrounding application, not here.

use crate::admission::AdmissionService;
use crate::config::{ServerConfig, UploadConfig};
use crate::flusher::BackgroundFlusher;
use crate::reconciler::CleanupReconciler;
use crate::shutdown::ShutdownSignal;
use crate::store::RecordStore;
use crate::types::{AdmissionResult, UploadRecord};
use crate::uploader::{
    FileRef, JobStatus, UploadBatchConfig, UploadResult, UploadRetryCoordinator, UploadTransport,
};
use crate::usage_queue::UsageUpdateQueue;
use crate::{QuotaError, Result};
use bytes::Bytes;
use chrono::Utc;
use http_body_util::BodyExt;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Request body for `POST /quota/check`.
#[derive(Debug, Deserialize)]
pub struct QuotaCheckRequest {
    pub principal_id: String,
    pub file_size: u64,
    #[serde(default)]
    pub client_addr: Option<String>,
}

/// One file descriptor in a batch upload request. Content is carried
/// inline; the wire protocol of a real blob store is out of scope here.
#[derive(Debug, Deserialize)]
pub struct BatchFileDescriptor {
    pub name: String,
    pub content: String,
}

/// Request body for `POST /uploads/batch`. Unset options fall back to the
/// configured defaults.
#[derive(Debug, Deserialize)]
pub struct BatchUploadRequest {
    pub principal_id: String,
    pub files: Vec<BatchFileDescriptor>,
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub base_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub client_addr: Option<String>,
}

/// Terminal per-file outcome reported to the caller.
#[derive(Debug, Serialize)]
pub struct BatchFileResult {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob_path: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Admission result for files denied before any upload attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission: Option<AdmissionResult>,
}

#[derive(Debug, Serialize)]
struct BatchUploadResponse {
    results: Vec<BatchFileResult>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    pending_principals: usize,
    flush_cycles_completed: u64,
    sweeps_completed: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Shared state behind every API connection.
pub struct ApiState {
    admission: Arc<AdmissionService>,
    record_store: Arc<dyn RecordStore>,
    transport: Arc<dyn UploadTransport>,
    usage_queue: Arc<UsageUpdateQueue>,
    flusher: Arc<BackgroundFlusher>,
    reconciler: Arc<CleanupReconciler>,
    upload_defaults: UploadConfig,
    admin_token: String,
    blob_prefix: String,
    start_time: SystemTime,
}

impl ApiState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        admission: Arc<AdmissionService>,
        record_store: Arc<dyn RecordStore>,
        transport: Arc<dyn UploadTransport>,
        usage_queue: Arc<UsageUpdateQueue>,
        flusher: Arc<BackgroundFlusher>,
        reconciler: Arc<CleanupReconciler>,
        upload_defaults: UploadConfig,
        server: &ServerConfig,
        blob_prefix: String,
    ) -> Self {
        Self {
            admission,
            record_store,
            transport,
            usage_queue,
            flusher,
            reconciler,
            upload_defaults,
            admin_token: server.admin_token.clone(),
            blob_prefix,
            start_time: SystemTime::now(),
        }
    }

    /// Dispatch one request. Always answers with JSON; infrastructure
    /// failures become a 500, never a dropped connection.
    pub async fn handle_request(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<String>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let response = match (&method, path.as_str()) {
            (&Method::POST, "/quota/check") => self.handle_quota_check(req).await,
            (&Method::POST, "/uploads/batch") => self.handle_batch_upload(req).await,
            (&Method::POST, "/admin/sweep") => self.handle_sweep(req).await,
            (&Method::GET, "/health") => self.handle_health().await,
            _ => json_response(
                StatusCode::NOT_FOUND,
                &ErrorResponse {
                    error: format!("no route for {} {}", method, path),
                },
            ),
        };

        match response {
            Ok(response) => Ok(response),
            Err(e) => {
                error!(method = %method, path = %path, error = %e, "request handling failed");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &ErrorResponse {
                        error: e.to_string(),
                    },
                )
            }
        }
    }

    async fn handle_quota_check(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<String>> {
        let body = collect_body(req).await?;
        let check: QuotaCheckRequest = match serde_json::from_slice(&body) {
            Ok(check) => check,
            Err(e) => return bad_request(&format!("invalid quota check body: {}", e)),
        };

        let result = self
            .admission
            .check_admission(
                &check.principal_id,
                check.file_size,
                check.client_addr.as_deref(),
            )
            .await;
        json_response(StatusCode::OK, &result)
    }

    async fn handle_batch_upload(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<String>> {
        let body = collect_body(req).await?;
        let batch: BatchUploadRequest = match serde_json::from_slice(&body) {
            Ok(batch) => batch,
            Err(e) => return bad_request(&format!("invalid batch upload body: {}", e)),
        };
        if batch.files.is_empty() {
            return bad_request("batch contains no files");
        }

        let config = self.batch_config(&batch);
        let coordinator = UploadRetryCoordinator::new(self.transport.clone(), config);

        // Admission-gate each file first; only admitted files enter the
        // retry coordinator.
        let mut results: Vec<BatchFileResult> = Vec::with_capacity(batch.files.len());
        let mut admitted: Vec<FileRef> = Vec::new();
        let mut admitted_names: Vec<String> = Vec::new();

        for descriptor in &batch.files {
            let content = Bytes::from(descriptor.content.clone().into_bytes());
            let size_bytes = content.len() as u64;
            let admission = self
                .admission
                .check_admission(
                    &batch.principal_id,
                    size_bytes,
                    batch.client_addr.as_deref(),
                )
                .await;

            if !admission.allowed {
                results.push(BatchFileResult {
                    name: descriptor.name.clone(),
                    status: "denied".to_string(),
                    file_id: None,
                    blob_path: None,
                    attempts: 0,
                    error: None,
                    admission: Some(admission),
                });
                continue;
            }

            let file_id = Uuid::new_v4().to_string();
            let blob_path = format!(
                "{}{}/{}",
                self.blob_prefix, batch.principal_id, file_id
            );

            // The record exists before the blob, so a concurrent sweep can
            // never mistake an in-flight blob for an orphan.
            self.record_store
                .create_upload_record(UploadRecord {
                    id: file_id.clone(),
                    principal_id: batch.principal_id.clone(),
                    blob_path: blob_path.clone(),
                    size_bytes,
                    size_counted: false,
                    created_at: Utc::now(),
                    completed_at: None,
                })
                .await?;

            admitted_names.push(descriptor.name.clone());
            admitted.push(FileRef {
                id: file_id,
                principal_id: batch.principal_id.clone(),
                blob_path,
                size_bytes,
                content,
            });
        }

        let upload_results = coordinator.upload_batch(admitted).await;

        for (name, result) in admitted_names.into_iter().zip(upload_results) {
            results.push(
                self.finalize_upload(&batch.principal_id, name, result)
                    .await,
            );
        }

        json_response(StatusCode::OK, &BatchUploadResponse { results })
    }

    /// Settle one terminal upload result against the record store and the
    /// usage queue. Completion is made durable before the bytes are
    /// counted: a record whose completion fails stays uncounted, so a
    /// later sweep reclaims it without owing a usage credit. Settlement
    /// never aborts the batch; each file reports its own outcome.
    async fn finalize_upload(
        &self,
        principal_id: &str,
        name: String,
        result: UploadResult,
    ) -> BatchFileResult {
        if result.status == JobStatus::Succeeded {
            match self
                .record_store
                .complete_upload_record(&result.file_id, Utc::now())
                .await
            {
                Ok(()) => {
                    // Usage is enqueued, not written synchronously; the
                    // flusher persists it within one interval.
                    self.usage_queue
                        .enqueue(principal_id, result.size_bytes as i64);
                    BatchFileResult {
                        name,
                        status: "succeeded".to_string(),
                        file_id: Some(result.file_id),
                        blob_path: Some(result.blob_path),
                        attempts: result.attempts,
                        error: None,
                        admission: None,
                    }
                }
                Err(e) => {
                    warn!(
                        file_id = %result.file_id,
                        error = %e,
                        "blob stored but completion failed, leaving record for reclamation"
                    );
                    BatchFileResult {
                        name,
                        status: "failed_terminal".to_string(),
                        file_id: Some(result.file_id),
                        blob_path: Some(result.blob_path),
                        attempts: result.attempts,
                        error: Some(format!("completion failed: {}", e)),
                        admission: None,
                    }
                }
            }
        } else {
            warn!(
                file_id = %result.file_id,
                error = result.last_error.as_deref().unwrap_or("unknown"),
                "batch upload file failed terminally"
            );
            // Best effort; a record that survives here is reclaimed by the
            // next sweep, along with any blob fragment a half-applied put
            // left behind.
            if let Err(e) = self
                .record_store
                .delete_upload_record(&result.file_id)
                .await
            {
                warn!(
                    file_id = %result.file_id,
                    error = %e,
                    "failed to remove record for failed upload"
                );
            }
            BatchFileResult {
                name,
                status: "failed_terminal".to_string(),
                file_id: Some(result.file_id),
                blob_path: Some(result.blob_path),
                attempts: result.attempts,
                error: result.last_error,
                admission: None,
            }
        }
    }

    async fn handle_sweep(
        &self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<String>> {
        let authorized = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {}", self.admin_token))
            .unwrap_or(false);
        if !authorized {
            return json_response(
                StatusCode::UNAUTHORIZED,
                &ErrorResponse {
                    error: "invalid or missing admin token".to_string(),
                },
            );
        }

        let report = self.reconciler.run_sweep().await?;
        json_response(StatusCode::OK, &report)
    }

    async fn handle_health(&self) -> Result<Response<String>> {
        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or(Duration::from_secs(0))
            .as_secs();
        let health = HealthResponse {
            status: "healthy".to_string(),
            uptime_seconds: uptime,
            pending_principals: self.usage_queue.pending_principals(),
            flush_cycles_completed: self.flusher.cycles_completed(),
            sweeps_completed: self.reconciler.sweeps_completed(),
        };
        json_response(StatusCode::OK, &health)
    }

    fn batch_config(&self, batch: &BatchUploadRequest) -> UploadBatchConfig {
        UploadBatchConfig {
            max_parallel: batch
                .max_parallel
                .unwrap_or(self.upload_defaults.max_parallel)
                .max(1),
            max_retries: batch
                .max_retries
                .unwrap_or(self.upload_defaults.max_retries)
                .max(1),
            base_delay: batch
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(self.upload_defaults.base_delay),
            max_delay: batch
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(self.upload_defaults.max_delay),
            attempt_timeout: self.upload_defaults.attempt_timeout,
        }
    }
}

async fn collect_body(req: Request<hyper::body::Incoming>) -> Result<Bytes> {
    Ok(req
        .into_body()
        .collect()
        .await
        .map_err(|e| QuotaError::HttpError(format!("Failed to read request body: {}", e)))?
        .to_bytes())
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Result<Response<String>> {
    let body = serde_json::to_string_pretty(body)
        .map_err(|e| QuotaError::SerializationError(format!("Failed to serialize: {}", e)))?;
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(body)
        .map_err(|e| QuotaError::HttpError(format!("Failed to build response: {}", e)))
}

fn bad_request(message: &str) -> Result<Response<String>> {
    json_response(
        StatusCode::BAD_REQUEST,
        &ErrorResponse {
            error: message.to_string(),
        },
    )
}

/// Accept loop for the API listener; exits on shutdown broadcast.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<ApiState>,
    mut shutdown: ShutdownSignal,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| QuotaError::IoError(format!("Failed to bind API server: {}", e)))?;

    info!("API server listening on {}", addr);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, _) = accept_result.map_err(|e| {
                    QuotaError::IoError(format!("Failed to accept connection: {}", e))
                })?;

                let io = TokioIo::new(stream);
                let state = state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = state.clone();
                        async move { state.handle_request(req).await }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving API connection: {}", e);
                    }
                });
            }
            _ = shutdown.wait_for_shutdown() => {
                info!("API server received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyTable;
    use crate::rate_limiter::RateLimiter;
    use crate::store::{MemoryBlobStore, MemoryRecordStore};
    use crate::types::{Principal, SubscriptionTier};
    use crate::uploader::BlobStoreTransport;

    fn state() -> (Arc<MemoryRecordStore>, Arc<UsageUpdateQueue>, ApiState) {
        let record_store = Arc::new(MemoryRecordStore::new());
        let blob_store = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(UsageUpdateQueue::new());
        let admission = Arc::new(AdmissionService::new(
            record_store.clone(),
            Arc::new(RateLimiter::default()),
            PolicyTable::default(),
            queue.clone(),
            Duration::from_secs(2),
        ));
        let flusher = Arc::new(BackgroundFlusher::new(
            queue.clone(),
            record_store.clone(),
            Duration::from_secs(5),
        ));
        let reconciler = Arc::new(CleanupReconciler::new(
            record_store.clone(),
            blob_store.clone(),
            queue.clone(),
            Duration::from_secs(24 * 3600),
            "uploads/".to_string(),
        ));
        let state = ApiState::new(
            admission,
            record_store.clone(),
            Arc::new(BlobStoreTransport::new(blob_store)),
            queue.clone(),
            flusher,
            reconciler,
            UploadConfig::default(),
            &ServerConfig::default(),
            "uploads/".to_string(),
        );
        (record_store, queue, state)
    }

    fn succeeded(file_id: &str, size: u64) -> UploadResult {
        UploadResult {
            file_id: file_id.to_string(),
            blob_path: format!("uploads/p1/{}", file_id),
            size_bytes: size,
            status: JobStatus::Succeeded,
            attempts: 1,
            last_error: None,
        }
    }

    fn record(file_id: &str, size: u64) -> UploadRecord {
        UploadRecord {
            id: file_id.to_string(),
            principal_id: "p1".to_string(),
            blob_path: format!("uploads/p1/{}", file_id),
            size_bytes: size,
            size_counted: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_bytes_counted_only_after_completion_is_durable() {
        let (record_store, queue, state) = state();
        record_store.create_upload_record(record("f1", 500)).await.unwrap();
        record_store
            .insert_principal(Principal {
                id: "p1".to_string(),
                tier: SubscriptionTier::Free,
                storage_used_bytes: 0,
                last_quota_warning_at: None,
            })
            .await;

        let settled = state.finalize_upload("p1", "a.txt".to_string(), succeeded("f1", 500)).await;
        assert_eq!(settled.status, "succeeded");
        assert_eq!(queue.pending_for("p1"), 500);
        let completed = record_store.upload_record("f1").await.unwrap();
        assert!(completed.completed_at.is_some());
        assert!(completed.size_counted);
    }

    #[tokio::test]
    async fn test_completion_failure_enqueues_nothing_and_spares_siblings() {
        let (record_store, queue, state) = state();
        record_store.create_upload_record(record("f1", 500)).await.unwrap();
        // "f2" has no record, so its completion fails the way a real store
        // error would, mid-settlement.

        let first = state.finalize_upload("p1", "a.txt".to_string(), succeeded("f1", 500)).await;
        let second = state.finalize_upload("p1", "b.txt".to_string(), succeeded("f2", 700)).await;

        // The failed file reports its own error; the sibling settled fine.
        assert_eq!(first.status, "succeeded");
        assert_eq!(second.status, "failed_terminal");
        assert!(second.error.as_deref().unwrap().contains("completion failed"));

        // No delta for a record that never completed: the sweep will
        // reclaim the blob without owing a credit.
        assert_eq!(queue.pending_for("p1"), 500);
    }

    #[tokio::test]
    async fn test_failed_upload_record_removed_without_enqueue() {
        let (record_store, queue, state) = state();
        record_store.create_upload_record(record("f1", 500)).await.unwrap();

        let result = UploadResult {
            status: JobStatus::FailedTerminal,
            last_error: Some("http 503: Service Unavailable".to_string()),
            attempts: 3,
            ..succeeded("f1", 500)
        };
        let settled = state.finalize_upload("p1", "a.txt".to_string(), result).await;

        assert_eq!(settled.status, "failed_terminal");
        assert_eq!(queue.pending_for("p1"), 0);
        assert!(record_store.upload_record("f1").await.is_none());
    }
}
