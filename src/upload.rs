//! Per-document upload state machine.
//!
//! `LocalOnly -> Uploading(progress) -> Uploaded | Failed(reason)`, with at
//! most one upload in flight per document. A document only becomes
//! `Uploaded` once its metadata record is written; a blob whose metadata
//! write failed is kept in the orphan ledger until `reconcile_orphans`.

use crate::remote::{
    BlobError, BlobEvent, BlobEventStream, BlobStore, CollectionPath, IdentityProvider,
    RemoteDocumentStore, StoreError, blob_path,
};
use crate::types::{Document, DocumentKey, FieldValue, StoredRecord, UploadState};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const UPDATE_CAPACITY: usize = 128;

// ============================================
// Error Types
// ============================================

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no authenticated user")]
    NotAuthenticated,

    #[error("an upload for {0} is already in progress")]
    ConcurrentUpload(DocumentKey),

    #[error("document {0} has no local file")]
    MissingLocalFile(DocumentKey),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("blob {orphan} was uploaded but its metadata write failed: {source}")]
    OrphanedBlob {
        orphan: OrphanedBlob,
        #[source]
        source: StoreError,
    },

    #[error("upload was cancelled")]
    Cancelled,

    #[error("document {0} has a remote URL but no metadata record id")]
    MissingRemoteReference(DocumentKey),
}

/// A blob stored remotely with no metadata record pointing at it.
#[derive(Clone, Debug, PartialEq)]
pub struct OrphanedBlob {
    pub key: DocumentKey,
    pub storage_path: String,
    pub url: String,
}

impl fmt::Display for OrphanedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.storage_path)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Orphans whose metadata record turned out to exist.
    pub adopted: usize,
    pub deleted: usize,
    /// Orphans still in the ledger because their blob could not be deleted.
    pub remaining: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UploadUpdate {
    pub key: DocumentKey,
    pub state: UploadState,
}

// ============================================
// Scoped file access
// ============================================

/// Grants temporary read access to files outside the application's own
/// storage, e.g. user-picked files on sandboxed platforms.
pub trait FileAccess: Send + Sync {
    fn acquire(&self, path: &Path) -> io::Result<()>;
    fn release(&self, path: &Path);
}

/// Access that is always granted.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnrestrictedAccess;

impl FileAccess for UnrestrictedAccess {
    fn acquire(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn release(&self, _path: &Path) {}
}

/// Holds access to one path; released on drop.
pub struct ScopedAccess {
    access: Arc<dyn FileAccess>,
    path: PathBuf,
}

impl ScopedAccess {
    pub fn acquire(access: Arc<dyn FileAccess>, path: &Path) -> io::Result<Self> {
        access.acquire(path)?;
        Ok(Self {
            access,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ScopedAccess {
    fn drop(&mut self) {
        self.access.release(&self.path);
    }
}

// ============================================
// Coordinator
// ============================================

pub struct UploadCoordinator {
    store: Arc<dyn RemoteDocumentStore>,
    blobs: Arc<dyn BlobStore>,
    identity: Arc<dyn IdentityProvider>,
    access: Arc<dyn FileAccess>,
    state: Mutex<CoordinatorState>,
    updates: broadcast::Sender<UploadUpdate>,
}

#[derive(Default)]
struct CoordinatorState {
    states: HashMap<DocumentKey, UploadState>,
    in_flight: HashMap<DocumentKey, InFlight>,
    orphans: Vec<OrphanedBlob>,
    next_ticket: u64,
}

struct InFlight {
    ticket: u64,
    cancel: CancellationToken,
}

/// Marks one upload as the owner of its key. Dropping it before `finish`
/// fails the upload.
struct UploadTicket<'a> {
    coordinator: &'a UploadCoordinator,
    key: DocumentKey,
    ticket: u64,
    cancel: CancellationToken,
}

impl Drop for UploadTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.lock();
        if state.owns(&self.key, self.ticket) {
            state.in_flight.remove(&self.key);
            let failed = UploadState::Failed {
                reason: "upload interrupted".to_string(),
            };
            self.coordinator.set_state(&mut state, &self.key, failed);
        }
    }
}

impl CoordinatorState {
    fn owns(&self, key: &DocumentKey, ticket: u64) -> bool {
        self.in_flight
            .get(key)
            .is_some_and(|flight| flight.ticket == ticket)
    }
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn RemoteDocumentStore>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self::with_file_access(store, blobs, identity, Arc::new(UnrestrictedAccess))
    }

    pub fn with_file_access(
        store: Arc<dyn RemoteDocumentStore>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
        access: Arc<dyn FileAccess>,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            store,
            blobs,
            identity,
            access,
            state: Mutex::new(CoordinatorState::default()),
            updates,
        }
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<UploadUpdate> {
        self.updates.subscribe()
    }

    /// Last known state for `key`, if this coordinator has seen it.
    pub fn state(&self, key: &DocumentKey) -> Option<UploadState> {
        self.lock().states.get(key).cloned()
    }

    pub fn is_uploading(&self, key: &DocumentKey) -> bool {
        self.lock().in_flight.contains_key(key)
    }

    pub fn orphaned_blobs(&self) -> Vec<OrphanedBlob> {
        self.lock().orphans.clone()
    }

    /// Uploads the document's local file and writes its metadata record.
    ///
    /// Returns the document as it now exists remotely, with `id`,
    /// `remote_url` and `Uploaded` state set.
    pub async fn upload(&self, document: &Document) -> Result<Document, UploadError> {
        let key = document.key();
        let user_id = self
            .identity
            .current_user_id()
            .ok_or(UploadError::NotAuthenticated)?;
        let local_path = document
            .local_path
            .clone()
            .ok_or_else(|| UploadError::MissingLocalFile(key.clone()))?;

        let ticket = self.begin(&key)?;
        let outcome = self.transfer(&ticket, document, &user_id, &local_path).await;
        self.finish(ticket, &user_id, outcome).await
    }

    /// Stops the in-flight upload for `key`. Returns whether one was running.
    pub fn cancel(&self, key: &DocumentKey) -> bool {
        let mut state = self.lock();
        let Some(flight) = state.in_flight.remove(key) else {
            return false;
        };
        flight.cancel.cancel();
        let cancelled = UploadState::Failed {
            reason: "cancelled".to_string(),
        };
        self.set_state(&mut state, key, cancelled);
        info!(document = %key, "upload cancelled");
        true
    }

    /// Removes the document's blob and metadata record, then forgets it.
    ///
    /// Either remote failure is returned and the tracked state is kept.
    /// Already-missing remote objects count as deleted.
    pub async fn delete(&self, document: &Document) -> Result<(), UploadError> {
        let key = document.key();
        self.cancel(&key);

        if let Some(url) = &document.remote_url {
            let id = document
                .id
                .as_deref()
                .ok_or_else(|| UploadError::MissingRemoteReference(key.clone()))?;
            let user_id = self
                .identity
                .current_user_id()
                .ok_or(UploadError::NotAuthenticated)?;

            match self.blobs.delete(url).await {
                Ok(()) => debug!(document = %key, "deleted blob"),
                Err(BlobError::NotFound(_)) => debug!(document = %key, "blob already gone"),
                Err(err) => return Err(err.into()),
            }
            match self
                .store
                .delete(&CollectionPath::documents(&user_id), id)
                .await
            {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            info!(document = %key, "deleted remote document");
        }

        self.lock().states.remove(&key);
        Ok(())
    }

    /// Resolves every orphaned blob: adopts it if a metadata record for its
    /// storage path exists, otherwise deletes it.
    pub async fn reconcile_orphans(&self) -> Result<ReconcileReport, UploadError> {
        let orphans = self.orphaned_blobs();
        if orphans.is_empty() {
            return Ok(ReconcileReport::default());
        }
        let user_id = self
            .identity
            .current_user_id()
            .ok_or(UploadError::NotAuthenticated)?;
        let records = self
            .store
            .get_all(&CollectionPath::documents(&user_id))
            .await?;

        let mut report = ReconcileReport::default();
        for orphan in orphans {
            let resolved = if find_by_storage_path(&records, &orphan.storage_path).is_some() {
                report.adopted += 1;
                true
            } else {
                match self.blobs.delete(&orphan.url).await {
                    Ok(()) | Err(BlobError::NotFound(_)) => {
                        report.deleted += 1;
                        true
                    }
                    Err(err) => {
                        warn!(orphan = %orphan, error = %err, "could not delete orphaned blob");
                        report.remaining += 1;
                        false
                    }
                }
            };
            if resolved {
                self.lock().orphans.retain(|known| known != &orphan);
            }
        }
        info!(?report, "reconciled orphaned blobs");
        Ok(report)
    }

    fn begin(&self, key: &DocumentKey) -> Result<UploadTicket<'_>, UploadError> {
        let mut state = self.lock();
        if state.in_flight.contains_key(key) {
            return Err(UploadError::ConcurrentUpload(key.clone()));
        }
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        let cancel = CancellationToken::new();
        state.in_flight.insert(
            key.clone(),
            InFlight {
                ticket,
                cancel: cancel.clone(),
            },
        );
        self.set_state(&mut state, key, UploadState::Uploading { progress: 0.0 });
        debug!(document = %key, ticket, "upload started");

        Ok(UploadTicket {
            coordinator: self,
            key: key.clone(),
            ticket,
            cancel,
        })
    }

    async fn transfer(
        &self,
        ticket: &UploadTicket<'_>,
        document: &Document,
        user_id: &str,
        local_path: &Path,
    ) -> Result<Document, UploadError> {
        let io_error = |source| UploadError::Io {
            path: local_path.to_path_buf(),
            source,
        };
        let bytes = {
            let _access = ScopedAccess::acquire(Arc::clone(&self.access), local_path)
                .map_err(io_error)?;
            tokio::fs::read(local_path).await.map_err(io_error)?
        };

        let storage_path = blob_path(user_id, &document.name);
        let content_type = mime_guess::from_path(local_path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        let metadata = BTreeMap::from([
            ("uploadedBy".to_string(), user_id.to_string()),
            ("originalName".to_string(), document.name.clone()),
        ]);

        let mut events = self
            .blobs
            .put(&storage_path, bytes, &content_type, metadata);
        let mut progress = 0.0;
        let url = loop {
            let event = tokio::select! {
                _ = ticket.cancel.cancelled() => None,
                event = events.next() => Some(event),
            };
            let Some(event) = event else {
                self.discard_when_complete(&ticket.key, events);
                return Err(UploadError::Cancelled);
            };
            match event {
                Some(BlobEvent::Progress { completed, total }) => {
                    let fraction = if total == 0 {
                        1.0
                    } else {
                        (completed as f64 / total as f64).clamp(0.0, 1.0)
                    };
                    if fraction > progress {
                        progress = fraction;
                        self.report_progress(ticket, progress);
                    }
                }
                Some(BlobEvent::Completed { url }) => break url,
                Some(BlobEvent::Failed(err)) => return Err(err.into()),
                None => {
                    return Err(BlobError::Upload("upload ended without a result".to_string()).into());
                }
            }
        };
        debug!(document = %ticket.key, url = %url, "blob stored");

        if ticket.cancel.is_cancelled() {
            self.discard_blob(&ticket.key, &url).await;
            return Err(UploadError::Cancelled);
        }

        let mut uploaded = document.clone();
        uploaded.remote_url = Some(url.clone());
        let orphaned = |source| UploadError::OrphanedBlob {
            orphan: OrphanedBlob {
                key: ticket.key.clone(),
                storage_path: storage_path.clone(),
                url: url.clone(),
            },
            source,
        };

        // One record per storage path: a record left by an earlier attempt
        // or an earlier version is rewritten with this upload's metadata.
        let path = CollectionPath::documents(user_id);
        let existing = self.store.get_all(&path).await.map_err(orphaned)?;
        let record = uploaded.to_metadata_record(user_id, &storage_path);
        let reused = match find_by_storage_path(&existing, &storage_path) {
            Some(found) => match self.store.update(&path, &found.id, record.clone()).await {
                Ok(()) => {
                    info!(document = %ticket.key, id = %found.id, "refreshed existing metadata record");
                    Some(found.id.clone())
                }
                Err(StoreError::NotFound { .. }) => None,
                Err(err) => return Err(orphaned(err)),
            },
            None => None,
        };
        let id = match reused {
            Some(id) => id,
            None => self.store.add(&path, record).await.map_err(orphaned)?,
        };

        uploaded.id = Some(id);
        uploaded.upload_state = UploadState::Uploaded;
        Ok(uploaded)
    }

    async fn finish(
        &self,
        ticket: UploadTicket<'_>,
        user_id: &str,
        outcome: Result<Document, UploadError>,
    ) -> Result<Document, UploadError> {
        let stale = {
            let mut state = self.lock();
            if state.owns(&ticket.key, ticket.ticket) {
                state.in_flight.remove(&ticket.key);
                return self.settle(&mut state, &ticket.key, outcome);
            }
            outcome
        };

        // Cancelled after the transfer got past its last cancellation check.
        match stale {
            Ok(document) => {
                info!(document = %ticket.key, "removing upload that completed after cancel");
                self.discard_upload(&ticket.key, user_id, &document).await;
                Err(UploadError::Cancelled)
            }
            Err(UploadError::OrphanedBlob { orphan, source }) => {
                self.lock().orphans.push(orphan.clone());
                Err(UploadError::OrphanedBlob { orphan, source })
            }
            Err(_) => Err(UploadError::Cancelled),
        }
    }

    fn settle(
        &self,
        state: &mut CoordinatorState,
        key: &DocumentKey,
        outcome: Result<Document, UploadError>,
    ) -> Result<Document, UploadError> {
        match outcome {
            Ok(document) => {
                state.orphans.retain(|orphan| &orphan.key != key);
                self.set_state(state, key, UploadState::Uploaded);
                info!(document = %key, "upload complete");
                Ok(document)
            }
            Err(err) => {
                if let UploadError::OrphanedBlob { orphan, .. } = &err {
                    warn!(orphan = %orphan, "blob orphaned by failed metadata write");
                    state.orphans.push(orphan.clone());
                }
                let failed = UploadState::Failed {
                    reason: err.to_string(),
                };
                self.set_state(state, key, failed);
                warn!(document = %key, error = %err, "upload failed");
                Err(err)
            }
        }
    }

    fn report_progress(&self, ticket: &UploadTicket<'_>, progress: f64) {
        let mut state = self.lock();
        if state.owns(&ticket.key, ticket.ticket) {
            self.set_state(&mut state, &ticket.key, UploadState::Uploading { progress });
        }
    }

    /// Lets a cancelled transfer run to its end and deletes what it stored.
    fn discard_when_complete(&self, key: &DocumentKey, mut events: BlobEventStream) {
        let blobs = Arc::clone(&self.blobs);
        let key = key.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let BlobEvent::Completed { url } = event {
                    if let Err(err) = blobs.delete(&url).await {
                        warn!(document = %key, url, error = %err, "could not discard blob of cancelled upload");
                    }
                    break;
                }
            }
        });
    }

    /// Deletes the record and blob written by an upload that was cancelled
    /// while its metadata write was in flight. A blob that cannot be deleted
    /// goes to the orphan ledger.
    async fn discard_upload(&self, key: &DocumentKey, user_id: &str, document: &Document) {
        let Some(url) = document.remote_url.clone() else {
            return;
        };
        if let Some(id) = &document.id {
            match self
                .store
                .delete(&CollectionPath::documents(user_id), id)
                .await
            {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => {
                    warn!(document = %key, id = %id, error = %err, "could not remove record of cancelled upload");
                }
            }
        }
        match self.blobs.delete(&url).await {
            Ok(()) | Err(BlobError::NotFound(_)) => debug!(document = %key, "discarded blob of cancelled upload"),
            Err(err) => {
                warn!(document = %key, url = %url, error = %err, "could not discard blob of cancelled upload");
                self.lock().orphans.push(OrphanedBlob {
                    key: key.clone(),
                    storage_path: blob_path(user_id, &document.name),
                    url,
                });
            }
        }
    }

    async fn discard_blob(&self, key: &DocumentKey, url: &str) {
        if let Err(err) = self.blobs.delete(url).await {
            warn!(document = %key, url, error = %err, "could not discard blob of cancelled upload");
        }
    }

    fn set_state(&self, state: &mut CoordinatorState, key: &DocumentKey, upload: UploadState) {
        state.states.insert(key.clone(), upload.clone());
        let _ = self.updates.send(UploadUpdate {
            key: key.clone(),
            state: upload,
        });
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_by_storage_path<'a>(
    records: &'a [StoredRecord],
    storage_path: &str,
) -> Option<&'a StoredRecord> {
    records.iter().find(|record| {
        record.fields.get("storagePath").and_then(FieldValue::as_str) == Some(storage_path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryBlobStore, MemoryDocumentStore, StaticIdentity};
    use crate::types::now;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        store: Arc<MemoryDocumentStore>,
        blobs: Arc<MemoryBlobStore>,
        coordinator: Arc<UploadCoordinator>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryDocumentStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let coordinator = Arc::new(UploadCoordinator::new(
            store.clone(),
            blobs.clone(),
            Arc::new(StaticIdentity::signed_in("u1")),
        ));
        Fixture {
            store,
            blobs,
            coordinator,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn local_doc(dir: &Path, name: &str, len: usize) -> Document {
        let path = dir.join(name);
        std::fs::write(&path, vec![b'x'; len]).unwrap();
        Document::local(name, path, len as u64, now())
    }

    #[derive(Default)]
    struct CountingAccess {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    impl FileAccess for CountingAccess {
        fn acquire(&self, _path: &Path) -> io::Result<()> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn release(&self, _path: &Path) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn upload_writes_blob_and_metadata() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "notes.pdf", 64);

        let uploaded = f.coordinator.upload(&doc).await.unwrap();

        assert_eq!(uploaded.upload_state, UploadState::Uploaded);
        assert!(uploaded.id.is_some());
        let url = uploaded.remote_url.clone().unwrap();
        let blob = f.blobs.blob(&url).unwrap();
        assert_eq!(blob.content_type, "application/pdf");
        assert_eq!(blob.metadata["uploadedBy"], "u1");
        assert_eq!(f.store.records(&CollectionPath::documents("u1")).len(), 1);
        assert_eq!(f.coordinator.state(&doc.key()), Some(UploadState::Uploaded));
    }

    #[tokio::test]
    async fn second_upload_of_same_document_is_rejected() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "a.pdf", 32);
        f.blobs.hold_uploads();
        let mut updates = f.coordinator.subscribe_updates();

        let coordinator = f.coordinator.clone();
        let first_doc = doc.clone();
        let first = tokio::spawn(async move { coordinator.upload(&first_doc).await });
        let started = updates.recv().await.unwrap();
        assert!(started.state.is_uploading());

        let second = f.coordinator.upload(&doc).await;
        assert!(matches!(second, Err(UploadError::ConcurrentUpload(_))));

        f.blobs.release_uploads();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(f.blobs.put_count(), 1);
    }

    #[tokio::test]
    async fn progress_is_reported_monotonically() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "big.pdf", 4096);
        let mut updates = f.coordinator.subscribe_updates();

        f.coordinator.upload(&doc).await.unwrap();

        let mut last = -1.0;
        let mut saw_uploaded = false;
        while let Ok(update) = updates.try_recv() {
            match update.state {
                UploadState::Uploading { progress } => {
                    assert!(!saw_uploaded);
                    assert!(progress >= last);
                    last = progress;
                }
                UploadState::Uploaded => saw_uploaded = true,
                other => panic!("unexpected state {other:?}"),
            }
        }
        assert!(saw_uploaded);
        assert!(last > 0.0);
    }

    #[tokio::test]
    async fn metadata_failure_orphans_the_blob() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "a.pdf", 16);
        f.store
            .fail_next_add(StoreError::Unavailable("offline".to_string()));

        let err = f.coordinator.upload(&doc).await.unwrap_err();
        assert!(matches!(err, UploadError::OrphanedBlob { .. }));
        assert!(matches!(
            f.coordinator.state(&doc.key()),
            Some(UploadState::Failed { .. })
        ));
        assert_eq!(f.coordinator.orphaned_blobs().len(), 1);
        assert_eq!(f.blobs.blob_count(), 1);

        let report = f.coordinator.reconcile_orphans().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(f.blobs.blob_count(), 0);
        assert!(f.coordinator.orphaned_blobs().is_empty());
    }

    #[tokio::test]
    async fn retry_after_lost_acknowledgement_reuses_the_record() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "a.pdf", 16);
        f.store
            .fail_next_add_after_write(StoreError::Unavailable("timeout".to_string()));

        assert!(f.coordinator.upload(&doc).await.is_err());
        let retried = f.coordinator.upload(&doc).await.unwrap();

        let records = f.store.records(&CollectionPath::documents("u1"));
        assert_eq!(records.len(), 1);
        assert_eq!(retried.id.as_deref(), Some(records[0].id.as_str()));
        assert!(f.coordinator.orphaned_blobs().is_empty());
    }

    #[tokio::test]
    async fn reupload_refreshes_the_existing_record() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "notes.pdf", 16);
        let first = f.coordinator.upload(&doc).await.unwrap();

        let changed = local_doc(f.dir.path(), "notes.pdf", 64);
        let second = f.coordinator.upload(&changed).await.unwrap();

        let records = f.store.records(&CollectionPath::documents("u1"));
        assert_eq!(records.len(), 1);
        assert_eq!(second.id, first.id);
        assert_eq!(records[0].fields["size"], FieldValue::Int(64));
        let url = second.remote_url.unwrap();
        assert_eq!(f.blobs.blob(&url).unwrap().bytes.len(), 64);
    }

    #[tokio::test]
    async fn failed_record_lookup_orphans_the_blob() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "a.pdf", 16);
        f.store
            .fail_next_get_all(StoreError::Unavailable("offline".to_string()));

        let err = f.coordinator.upload(&doc).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::OrphanedBlob {
                source: StoreError::Unavailable(_),
                ..
            }
        ));
        assert_eq!(f.coordinator.orphaned_blobs().len(), 1);

        f.coordinator.upload(&doc).await.unwrap();
        assert!(f.coordinator.orphaned_blobs().is_empty());
        assert_eq!(f.store.records(&CollectionPath::documents("u1")).len(), 1);
    }

    #[tokio::test]
    async fn delete_during_metadata_write_leaves_nothing_behind() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "a.pdf", 16);
        f.store.hold_writes();

        let coordinator = f.coordinator.clone();
        let pending_doc = doc.clone();
        let pending = tokio::spawn(async move { coordinator.upload(&pending_doc).await });
        for _ in 0..100 {
            if f.store.held_writes() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(f.store.held_writes(), 1);
        assert_eq!(f.blobs.blob_count(), 1);

        f.coordinator.delete(&doc).await.unwrap();
        f.store.release_writes();

        assert!(matches!(
            pending.await.unwrap(),
            Err(UploadError::Cancelled)
        ));
        assert!(f.store.records(&CollectionPath::documents("u1")).is_empty());
        assert_eq!(f.blobs.blob_count(), 0);
        assert!(f.coordinator.orphaned_blobs().is_empty());
        assert_eq!(f.coordinator.state(&doc.key()), None);
    }

    #[tokio::test]
    async fn file_access_is_released_when_the_read_fails() {
        let store = Arc::new(MemoryDocumentStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let access = Arc::new(CountingAccess::default());
        let coordinator = UploadCoordinator::with_file_access(
            store,
            blobs,
            Arc::new(StaticIdentity::signed_in("u1")),
            access.clone(),
        );
        let doc = Document::local("gone.pdf", PathBuf::from("/nonexistent/gone.pdf"), 1, now());

        let err = coordinator.upload(&doc).await.unwrap_err();
        assert!(matches!(err, UploadError::Io { .. }));
        assert_eq!(access.acquired.load(Ordering::SeqCst), 1);
        assert_eq!(access.released.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_uploading(&doc.key()));
    }

    #[tokio::test]
    async fn cancelled_upload_reports_cancelled() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "a.pdf", 16);
        f.blobs.hold_uploads();
        let mut updates = f.coordinator.subscribe_updates();

        let coordinator = f.coordinator.clone();
        let pending_doc = doc.clone();
        let pending = tokio::spawn(async move { coordinator.upload(&pending_doc).await });
        updates.recv().await.unwrap();

        assert!(f.coordinator.cancel(&doc.key()));
        assert!(matches!(
            pending.await.unwrap(),
            Err(UploadError::Cancelled)
        ));
        f.blobs.release_uploads();
        for _ in 0..100 {
            if f.blobs.put_count() == 1 && f.blobs.blob_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(f.store.records(&CollectionPath::documents("u1")).is_empty());
    }

    #[tokio::test]
    async fn delete_keeps_state_when_blob_delete_fails() {
        let f = fixture();
        let doc = local_doc(f.dir.path(), "a.pdf", 16);
        let uploaded = f.coordinator.upload(&doc).await.unwrap();

        f.blobs
            .fail_next_delete(BlobError::Delete("denied".to_string()));
        assert!(matches!(
            f.coordinator.delete(&uploaded).await,
            Err(UploadError::Blob(_))
        ));
        assert_eq!(f.coordinator.state(&doc.key()), Some(UploadState::Uploaded));
        assert_eq!(f.store.records(&CollectionPath::documents("u1")).len(), 1);

        f.coordinator.delete(&uploaded).await.unwrap();
        assert!(f.store.records(&CollectionPath::documents("u1")).is_empty());
        assert_eq!(f.blobs.blob_count(), 0);
        assert_eq!(f.coordinator.state(&doc.key()), None);
    }
}
