//! In-process store, blob and identity backends.
//!
//! Used by the console binary and by tests. Each backend can be told to fail
//! its next call so the failure paths of the sync core can be exercised.

use super::{
    BlobError, BlobEvent, BlobEventStream, BlobStore, CollectionPath, IdentityProvider,
    RemoteDocumentStore, Snapshot, SnapshotStream, StoreError,
};
use crate::cache::{CacheError, ContentKey, ContentSource, read_local};
use crate::types::{Record, StoredRecord};
use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::Semaphore;

// ============================================
// Document store
// ============================================

#[derive(Default)]
pub struct MemoryDocumentStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<String, Vec<StoredRecord>>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
    adds: usize,
    faults: StoreFaults,
    write_gate: Option<Arc<Semaphore>>,
    held_writes: usize,
}

struct Subscriber {
    order_by: String,
    sender: mpsc::UnboundedSender<Result<Snapshot, StoreError>>,
}

#[derive(Default)]
struct StoreFaults {
    add: Option<StoreError>,
    add_after_write: Option<StoreError>,
    delete: Option<StoreError>,
    get_all: Option<StoreError>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `add` fails without writing anything.
    pub fn fail_next_add(&self, err: StoreError) {
        self.lock().faults.add = Some(err);
    }

    /// The next `add` writes the record but still reports `err`, as when
    /// the acknowledgement is lost.
    pub fn fail_next_add_after_write(&self, err: StoreError) {
        self.lock().faults.add_after_write = Some(err);
    }

    pub fn fail_next_delete(&self, err: StoreError) {
        self.lock().faults.delete = Some(err);
    }

    pub fn fail_next_get_all(&self, err: StoreError) {
        self.lock().faults.get_all = Some(err);
    }

    /// Delivers an error to every live subscription on `path`.
    pub fn push_feed_error(&self, path: &CollectionPath, err: StoreError) {
        let mut state = self.lock();
        if let Some(subscribers) = state.subscribers.get_mut(path.as_str()) {
            subscribers.retain(|sub| sub.sender.unbounded_send(Err(err.clone())).is_ok());
        }
    }

    /// `add` and `update` calls made from now on wait until
    /// `release_writes` is called.
    pub fn hold_writes(&self) {
        self.lock().write_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_writes(&self) {
        if let Some(gate) = self.lock().write_gate.take() {
            gate.close();
        }
    }

    /// Writes currently waiting on `hold_writes`.
    pub fn held_writes(&self) -> usize {
        self.lock().held_writes
    }

    /// Writes a record directly, bypassing fault injection.
    pub fn seed(&self, path: &CollectionPath, record: Record) -> String {
        self.lock().insert(path.as_str(), record)
    }

    pub fn records(&self, path: &CollectionPath) -> Vec<StoredRecord> {
        self.lock()
            .collections
            .get(path.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Number of records written through `add`.
    pub fn add_count(&self) -> usize {
        self.lock().adds
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait_for_write_gate(&self) {
        let gate = self.lock().write_gate.clone();
        if let Some(gate) = gate {
            self.lock().held_writes += 1;
            // Closed on release; either outcome lets the write through.
            let _ = gate.acquire().await;
            self.lock().held_writes -= 1;
        }
    }
}

impl StoreState {
    fn insert(&mut self, path: &str, fields: Record) -> String {
        self.next_id += 1;
        let id = format!("rec-{:06}", self.next_id);
        self.collections
            .entry(path.to_string())
            .or_default()
            .push(StoredRecord {
                id: id.clone(),
                fields,
            });
        self.notify(path);
        id
    }

    fn snapshot(&self, path: &str, order_by: &str) -> Snapshot {
        let mut records = self.collections.get(path).cloned().unwrap_or_default();
        records.sort_by(|a, b| {
            match (a.fields.get(order_by), b.fields.get(order_by)) {
                (Some(a), Some(b)) => a.order(b),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
        records
    }

    fn notify(&mut self, path: &str) {
        let Some(subscribers) = self.subscribers.remove(path) else {
            return;
        };
        let live: Vec<Subscriber> = subscribers
            .into_iter()
            .filter(|sub| {
                let snapshot = self.snapshot(path, &sub.order_by);
                sub.sender.unbounded_send(Ok(snapshot)).is_ok()
            })
            .collect();
        self.subscribers.insert(path.to_string(), live);
    }
}

#[async_trait]
impl RemoteDocumentStore for MemoryDocumentStore {
    async fn subscribe(
        &self,
        path: &CollectionPath,
        order_by: &str,
    ) -> Result<SnapshotStream, StoreError> {
        let (sender, receiver) = mpsc::unbounded();
        let mut state = self.lock();
        let initial = state.snapshot(path.as_str(), order_by);
        sender
            .unbounded_send(Ok(initial))
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        state
            .subscribers
            .entry(path.as_str().to_string())
            .or_default()
            .push(Subscriber {
                order_by: order_by.to_string(),
                sender,
            });
        Ok(receiver.boxed())
    }

    async fn add(&self, path: &CollectionPath, record: Record) -> Result<String, StoreError> {
        self.wait_for_write_gate().await;
        let mut state = self.lock();
        if let Some(err) = state.faults.add.take() {
            return Err(err);
        }
        let id = state.insert(path.as_str(), record);
        state.adds += 1;
        if let Some(err) = state.faults.add_after_write.take() {
            return Err(err);
        }
        Ok(id)
    }

    async fn update(
        &self,
        path: &CollectionPath,
        id: &str,
        record: Record,
    ) -> Result<(), StoreError> {
        self.wait_for_write_gate().await;
        let mut state = self.lock();
        let Some(existing) = state
            .collections
            .get_mut(path.as_str())
            .and_then(|records| records.iter_mut().find(|existing| existing.id == id))
        else {
            return Err(StoreError::NotFound {
                path: path.to_string(),
                id: id.to_string(),
            });
        };
        existing.fields = record;
        state.notify(path.as_str());
        Ok(())
    }

    async fn delete(&self, path: &CollectionPath, id: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(err) = state.faults.delete.take() {
            return Err(err);
        }
        let records = state.collections.entry(path.as_str().to_string()).or_default();
        let Some(position) = records.iter().position(|record| record.id == id) else {
            return Err(StoreError::NotFound {
                path: path.to_string(),
                id: id.to_string(),
            });
        };
        records.remove(position);
        state.notify(path.as_str());
        Ok(())
    }

    async fn get_all(&self, path: &CollectionPath) -> Result<Vec<StoredRecord>, StoreError> {
        let mut state = self.lock();
        if let Some(err) = state.faults.get_all.take() {
            return Err(err);
        }
        Ok(state
            .collections
            .get(path.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================
// Blob store
// ============================================

#[derive(Clone, Debug, PartialEq)]
pub struct StoredBlob {
    pub path: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
}

pub struct MemoryBlobStore {
    state: Arc<Mutex<BlobState>>,
    progress_steps: u64,
}

#[derive(Default)]
struct BlobState {
    blobs: HashMap<String, StoredBlob>,
    puts: usize,
    gate: Option<Arc<Semaphore>>,
    fail_next_put: Option<BlobError>,
    fail_next_delete: Option<BlobError>,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_progress_steps(4)
    }

    /// Each upload reports `steps` progress events before completing.
    pub fn with_progress_steps(steps: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(BlobState::default())),
            progress_steps: steps.max(1),
        }
    }

    /// Uploads started from now on report progress but do not complete
    /// until `release_uploads` is called.
    pub fn hold_uploads(&self) {
        self.lock().gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_uploads(&self) {
        if let Some(gate) = self.lock().gate.take() {
            gate.close();
        }
    }

    pub fn fail_next_put(&self, err: BlobError) {
        self.lock().fail_next_put = Some(err);
    }

    pub fn fail_next_delete(&self, err: BlobError) {
        self.lock().fail_next_delete = Some(err);
    }

    pub fn blob(&self, url: &str) -> Option<StoredBlob> {
        self.lock().blobs.get(url).cloned()
    }

    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    pub fn put_count(&self) -> usize {
        self.lock().puts
    }

    fn lock(&self) -> MutexGuard<'_, BlobState> {
        lock_blobs(&self.state)
    }
}

fn lock_blobs(state: &Mutex<BlobState>) -> MutexGuard<'_, BlobState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> BlobEventStream {
        let (sender, receiver) = mpsc::unbounded();
        let (fault, gate) = {
            let mut state = self.lock();
            state.puts += 1;
            (state.fail_next_put.take(), state.gate.clone())
        };
        let state = Arc::clone(&self.state);
        let steps = self.progress_steps;
        let blob = StoredBlob {
            path: path.to_string(),
            bytes,
            content_type: content_type.to_string(),
            metadata,
        };

        tokio::spawn(async move {
            let total = blob.bytes.len() as u64;
            for step in 1..steps {
                let _ = sender.unbounded_send(BlobEvent::Progress {
                    completed: total * step / steps,
                    total,
                });
            }
            if let Some(gate) = gate {
                // Closed on release; either outcome lets the upload finish.
                let _ = gate.acquire().await;
            }
            if let Some(err) = fault {
                let _ = sender.unbounded_send(BlobEvent::Failed(err));
                return;
            }
            let _ = sender.unbounded_send(BlobEvent::Progress {
                completed: total,
                total,
            });
            let url = format!("memory://{}", blob.path);
            lock_blobs(&state).blobs.insert(url.clone(), blob);
            let _ = sender.unbounded_send(BlobEvent::Completed { url });
        });

        receiver.boxed()
    }

    async fn delete(&self, url: &str) -> Result<(), BlobError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_next_delete.take() {
            return Err(err);
        }
        state
            .blobs
            .remove(url)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(url.to_string()))
    }
}

#[async_trait]
impl ContentSource for MemoryBlobStore {
    async fn read(&self, key: &ContentKey) -> Result<Vec<u8>, CacheError> {
        match key {
            ContentKey::Local(path) => read_local(path).await,
            ContentKey::Remote(url) => self
                .blob(url)
                .map(|blob| blob.bytes)
                .ok_or_else(|| CacheError::NotFound(url.clone())),
        }
    }
}

// ============================================
// Identity
// ============================================

#[derive(Default)]
pub struct StaticIdentity {
    user: RwLock<Option<String>>,
}

impl StaticIdentity {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = Some(user_id.into());
    }

    pub fn sign_out(&self) {
        *self.user.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
