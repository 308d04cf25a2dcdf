//! Store Boundary Module
//!
//! Traits for the two external collaborators the engine depends on: the
//! durable record store (principals, upload records, audit rows) and the
//! blob store (opaque put/delete/list). Both are excluded infrastructure;
//! the engine only assumes the narrow contracts below.
//!
//! In-memory implementations are provided for the demo binary and tests,
//! with injectable latency and failures so admission timeouts and flush
//! retry paths can be exercised deterministically.

use crate::types::{ObjectRef, Principal, UploadAttemptRecord, UploadRecord};
use crate::{QuotaError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Durable record store boundary: principal usage, upload records, audit.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a principal row by id. `Ok(None)` means the principal does not
    /// exist (as opposed to an infrastructure failure).
    async fn get_principal(&self, id: &str) -> Result<Option<Principal>>;

    /// Single-row additive update of `storage_used_bytes`. The result is
    /// floored at zero; usage can never go negative.
    async fn add_storage_used(&self, id: &str, delta_bytes: i64) -> Result<()>;

    /// Append one audit row. Append-only; rows are never mutated.
    async fn append_attempt(&self, record: UploadAttemptRecord) -> Result<()>;

    /// Insert a new upload record.
    async fn create_upload_record(&self, record: UploadRecord) -> Result<()>;

    /// Set the completion marker on an upload record. Completion also
    /// marks the record's bytes as counted, since the success path
    /// enqueues the usage delta at the same moment.
    async fn complete_upload_record(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Upload records with no completion marker created before `cutoff`.
    async fn incomplete_uploads_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadRecord>>;

    /// Delete an upload record by id. Deleting a missing record is a no-op.
    async fn delete_upload_record(&self, id: &str) -> Result<()>;

    /// All blob paths referenced by any upload record. Used by the
    /// reconciler to cross-reference store listings.
    async fn known_blob_paths(&self) -> Result<HashSet<String>>;
}

/// Opaque blob store boundary. Assumed at-least-once durable on a
/// successful acknowledgment.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<()>;

    /// Delete a blob. Deleting a missing blob is a no-op, which keeps
    /// reconciliation sweeps idempotent.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Paginated listing under a prefix. `page_token` of `None` starts
    /// from the beginning; a returned token of `None` means the listing
    /// is exhausted.
    async fn list(
        &self,
        prefix: &str,
        page_token: Option<String>,
    ) -> Result<(Vec<ObjectRef>, Option<String>)>;
}

#[derive(Default)]
struct RecordStoreInner {
    principals: HashMap<String, Principal>,
    uploads: HashMap<String, UploadRecord>,
    attempts: Vec<UploadAttemptRecord>,
}

/// In-memory record store with latency and failure injection.
pub struct MemoryRecordStore {
    inner: RwLock<RecordStoreInner>,
    /// Artificial delay applied to principal reads (admission timeout tests).
    read_delay: RwLock<Option<Duration>>,
    /// Fail the next N `add_storage_used` calls (flush retry tests).
    fail_usage_updates: AtomicU32,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RecordStoreInner::default()),
            read_delay: RwLock::new(None),
            fail_usage_updates: AtomicU32::new(0),
        }
    }

    /// Seed a principal row.
    pub async fn insert_principal(&self, principal: Principal) {
        let mut inner = self.inner.write().await;
        inner.principals.insert(principal.id.clone(), principal);
    }

    /// Remove a principal row, as the upstream application would on
    /// account deletion.
    pub async fn remove_principal(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.principals.remove(id);
    }

    /// Inject latency into subsequent principal reads.
    pub async fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.write().await = delay;
    }

    /// Make the next `n` usage updates fail with a store error.
    pub fn fail_next_usage_updates(&self, n: u32) {
        self.fail_usage_updates.store(n, Ordering::SeqCst);
    }

    /// Audit rows appended so far, oldest first.
    pub async fn attempts(&self) -> Vec<UploadAttemptRecord> {
        self.inner.read().await.attempts.clone()
    }

    pub async fn upload_record(&self, id: &str) -> Option<UploadRecord> {
        self.inner.read().await.uploads.get(id).cloned()
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_principal(&self, id: &str) -> Result<Option<Principal>> {
        let delay = *self.read_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.inner.read().await.principals.get(id).cloned())
    }

    async fn add_storage_used(&self, id: &str, delta_bytes: i64) -> Result<()> {
        if self.fail_usage_updates.load(Ordering::SeqCst) > 0 {
            self.fail_usage_updates.fetch_sub(1, Ordering::SeqCst);
            return Err(QuotaError::StoreError(format!(
                "injected usage update failure for principal {}",
                id
            )));
        }

        let mut inner = self.inner.write().await;
        let principal = inner
            .principals
            .get_mut(id)
            .ok_or_else(|| QuotaError::PrincipalNotFound(id.to_string()))?;

        principal.storage_used_bytes = if delta_bytes >= 0 {
            principal.storage_used_bytes.saturating_add(delta_bytes as u64)
        } else {
            principal
                .storage_used_bytes
                .saturating_sub(delta_bytes.unsigned_abs())
        };
        Ok(())
    }

    async fn append_attempt(&self, record: UploadAttemptRecord) -> Result<()> {
        self.inner.write().await.attempts.push(record);
        Ok(())
    }

    async fn create_upload_record(&self, record: UploadRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.uploads.insert(record.id.clone(), record);
        Ok(())
    }

    async fn complete_upload_record(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.uploads.get_mut(id) {
            Some(record) => {
                record.completed_at = Some(at);
                record.size_counted = true;
                Ok(())
            }
            None => Err(QuotaError::StoreError(format!(
                "upload record not found: {}",
                id
            ))),
        }
    }

    async fn incomplete_uploads_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<UploadRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .uploads
            .values()
            .filter(|r| r.completed_at.is_none() && r.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_upload_record(&self, id: &str) -> Result<()> {
        self.inner.write().await.uploads.remove(id);
        Ok(())
    }

    async fn known_blob_paths(&self) -> Result<HashSet<String>> {
        let inner = self.inner.read().await;
        Ok(inner.uploads.values().map(|r| r.blob_path.clone()).collect())
    }
}

/// In-memory blob store backed by a sorted map so listings paginate in a
/// stable order.
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    page_size: usize,
    /// Fail the next N `put` calls (upload retry tests).
    fail_puts: AtomicU32,
    /// Fail the next N `delete` calls (sweep failure tests).
    fail_deletes: AtomicU32,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            page_size: page_size.max(1),
            fail_puts: AtomicU32::new(0),
            fail_deletes: AtomicU32::new(0),
        }
    }

    /// Make the next `n` puts fail with a retryable-looking blob error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` deletes fail.
    pub fn fail_next_deletes(&self, n: u32) {
        self.fail_deletes.store(n, Ordering::SeqCst);
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.objects.read().await.contains_key(path)
    }

    pub async fn object_count(&self) -> usize {
        self.objects.read().await.len()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) > 0 {
            self.fail_puts.fetch_sub(1, Ordering::SeqCst);
            return Err(QuotaError::BlobError(
                "injected 503 Service Unavailable".to_string(),
            ));
        }
        self.objects.write().await.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) > 0 {
            self.fail_deletes.fetch_sub(1, Ordering::SeqCst);
            return Err(QuotaError::BlobError(
                "injected 503 Service Unavailable".to_string(),
            ));
        }
        self.objects.write().await.remove(path);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        page_token: Option<String>,
    ) -> Result<(Vec<ObjectRef>, Option<String>)> {
        let objects = self.objects.read().await;
        let start = page_token.unwrap_or_else(|| prefix.to_string());

        let page: Vec<ObjectRef> = objects
            .range(start.clone()..)
            .filter(|(path, _)| path.starts_with(prefix))
            .take(self.page_size)
            .map(|(path, bytes)| ObjectRef {
                path: path.clone(),
                size_bytes: bytes.len() as u64,
            })
            .collect();

        // The next token is the first key strictly after this page.
        let next_token = if page.len() == self.page_size {
            page.last().map(|last| format!("{}\0", last.path))
        } else {
            None
        };

        Ok((page, next_token))
    }
}
