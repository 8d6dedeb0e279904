//! Contracts for the remote collaborators the sync core talks to.
//!
//! - `RemoteDocumentStore` - ordered record collections with live snapshots
//! - `BlobStore` - binary uploads with progress events
//! - `IdentityProvider` - the signed-in user, required for every store path
//!
//! `memory` holds in-process implementations of all three.
pub mod memory;

use crate::types::{Record, StoredRecord};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;

pub use memory::{MemoryBlobStore, MemoryDocumentStore, StaticIdentity};

// ============================================
// Error Types
// ============================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("record {id} not found in {path}")]
    NotFound { path: String, id: String },

    #[error("document store rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlobError {
    #[error("upload failed: {0}")]
    Upload(String),

    #[error("delete failed: {0}")]
    Delete(String),

    #[error("blob not found: {0}")]
    NotFound(String),
}

// ============================================
// Paths
// ============================================

/// A per-user record collection, e.g. `users/{id}/messages`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    pub fn messages(user_id: &str) -> Self {
        Self(format!("users/{user_id}/messages"))
    }

    pub fn documents(user_id: &str) -> Self {
        Self(format!("users/{user_id}/pdfs"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blob location of an uploaded document.
pub fn blob_path(user_id: &str, name: &str) -> String {
    format!("users/{user_id}/pdfs/{name}")
}

// ============================================
// Collaborators
// ============================================

/// The full, ordered contents of a collection after a change.
pub type Snapshot = Vec<StoredRecord>;

pub type SnapshotStream = BoxStream<'static, Result<Snapshot, StoreError>>;

#[async_trait]
pub trait RemoteDocumentStore: Send + Sync {
    /// Live snapshots of `path` ordered ascending by `order_by`. The current
    /// contents are delivered first, then a new snapshot on every change.
    async fn subscribe(
        &self,
        path: &CollectionPath,
        order_by: &str,
    ) -> Result<SnapshotStream, StoreError>;

    /// Persists a record and returns the identifier the store assigned.
    async fn add(&self, path: &CollectionPath, record: Record) -> Result<String, StoreError>;

    /// Replaces the fields of an existing record.
    async fn update(
        &self,
        path: &CollectionPath,
        id: &str,
        record: Record,
    ) -> Result<(), StoreError>;

    async fn delete(&self, path: &CollectionPath, id: &str) -> Result<(), StoreError>;

    async fn get_all(&self, path: &CollectionPath) -> Result<Vec<StoredRecord>, StoreError>;
}

#[derive(Clone, Debug, PartialEq)]
pub enum BlobEvent {
    Progress { completed: u64, total: u64 },
    Completed { url: String },
    Failed(BlobError),
}

pub type BlobEventStream = BoxStream<'static, BlobEvent>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Starts an upload. The returned stream yields progress and ends with
    /// either `Completed` carrying the durable URL or `Failed`.
    fn put(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: BTreeMap<String, String>,
    ) -> BlobEventStream;

    async fn delete(&self, url: &str) -> Result<(), BlobError>;
}

pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}
