//! Catalog of documents, merged from the working directory and the
//! current user's remote metadata.

use crate::cache::{CacheError, ContentDecoder, ContentKey, DocumentCacheManager, PdfDecoder};
use crate::remote::{CollectionPath, IdentityProvider, RemoteDocumentStore, StoreError};
use crate::types::{Document, DocumentKey, UploadState, now};
use crate::upload::{UploadCoordinator, UploadError};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("no authenticated user")]
    NotAuthenticated,

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("not a file name: {0}")]
    InvalidSource(PathBuf),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("document {0} has no content source")]
    NotFound(String),

    #[error("upload task stopped before reporting a result")]
    Interrupted,
}

impl IndexError {
    fn io(path: &Path, source: io::Error) -> Self {
        IndexError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// An imported document whose upload is still running.
pub struct PendingUpload {
    document: Document,
    handle: JoinHandle<Result<Document, IndexError>>,
}

impl PendingUpload {
    /// The `LocalOnly` entry inserted into the list.
    pub fn document(&self) -> &Document {
        &self.document
    }

    /// The uploaded document, or the failure that rolled the entry back.
    pub async fn wait(self) -> Result<Document, IndexError> {
        self.handle.await.map_err(|_| IndexError::Interrupted)?
    }
}

pub struct DocumentIndex<D: ContentDecoder = PdfDecoder> {
    inner: Arc<IndexInner<D>>,
}

impl<D: ContentDecoder> Clone for DocumentIndex<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct IndexInner<D: ContentDecoder> {
    dir: PathBuf,
    extensions: Vec<String>,
    store: Arc<dyn RemoteDocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    uploads: Arc<UploadCoordinator>,
    cache: DocumentCacheManager<D>,
    documents: Mutex<Vec<Document>>,
}

/// What an optimistic insert displaced, so a failed upload can undo it.
struct Insertion {
    document: Document,
    replaced: Option<(usize, Document)>,
    created_file: bool,
}

impl<D: ContentDecoder> DocumentIndex<D> {
    /// Creates the working directory if needed and loads the catalog.
    pub async fn open(
        dir: impl Into<PathBuf>,
        extensions: Vec<String>,
        store: Arc<dyn RemoteDocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        uploads: Arc<UploadCoordinator>,
        cache: DocumentCacheManager<D>,
    ) -> Result<Self, IndexError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| IndexError::io(&dir, err))?;
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.to_ascii_lowercase())
            .collect();

        let index = Self {
            inner: Arc::new(IndexInner {
                dir,
                extensions,
                store,
                identity,
                uploads,
                cache,
                documents: Mutex::new(Vec::new()),
            }),
        };
        index.refresh().await?;
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Rebuilds the catalog from remote metadata and the working directory.
    /// A remote record and a local file with the same name are one document.
    pub async fn refresh(&self) -> Result<(), IndexError> {
        let user_id = self
            .inner
            .identity
            .current_user_id()
            .ok_or(IndexError::NotAuthenticated)?;
        let records = self
            .inner
            .store
            .get_all(&CollectionPath::documents(&user_id))
            .await?;

        let mut merged: BTreeMap<String, Document> = records
            .iter()
            .filter_map(Document::from_metadata)
            .map(|doc| (doc.name.clone(), doc))
            .collect();
        let remote_count = merged.len();

        for local in self.inner.scan_local().await? {
            match merged.get_mut(&local.name) {
                Some(remote) => remote.local_path = local.local_path,
                None => {
                    merged.insert(local.name.clone(), local);
                }
            }
        }

        let mut documents: Vec<Document> = merged.into_values().collect();
        documents.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        info!(
            total = documents.len(),
            remote = remote_count,
            "document catalog refreshed"
        );
        *self.inner.lock() = documents;
        Ok(())
    }

    /// Visible documents, newest first, with live upload progress applied.
    ///
    /// A failure is only shown on entries that were never uploaded; an
    /// uploaded entry restored by a rollback keeps its own state.
    pub fn list(&self) -> Vec<Document> {
        let mut documents = self.inner.lock().clone();
        for document in &mut documents {
            let Some(state) = self.inner.uploads.state(&document.key()) else {
                continue;
            };
            let shown = match state {
                UploadState::Uploading { .. } => true,
                UploadState::Failed { .. } => document.upload_state != UploadState::Uploaded,
                _ => false,
            };
            if shown {
                document.upload_state = state;
            }
        }
        documents
    }

    /// Documents whose name contains `text`, ignoring case.
    pub fn search(&self, text: &str) -> Vec<Document> {
        let needle = text.trim().to_lowercase();
        self.list()
            .into_iter()
            .filter(|doc| needle.is_empty() || doc.name.to_lowercase().contains(&needle))
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Document> {
        self.list().into_iter().find(|doc| doc.name == name)
    }

    /// Imports `source` into the working directory, overwriting a same-name
    /// file, lists it as `LocalOnly` and starts its upload.
    ///
    /// If the upload fails the entry is taken out of the list again and any
    /// entry it replaced is restored.
    pub async fn add(&self, source: &Path) -> Result<PendingUpload, IndexError> {
        if self.inner.identity.current_user_id().is_none() {
            return Err(IndexError::NotAuthenticated);
        }
        let name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| IndexError::InvalidSource(source.to_path_buf()))?
            .to_string();
        let key = DocumentKey::new(&name);
        if self.inner.uploads.is_uploading(&key) {
            return Err(UploadError::ConcurrentUpload(key).into());
        }

        let destination = self.inner.dir.join(&name);
        let created_file = !tokio::fs::try_exists(&destination)
            .await
            .map_err(|err| IndexError::io(&destination, err))?;
        if !same_file(source, &destination).await {
            tokio::fs::copy(source, &destination)
                .await
                .map_err(|err| IndexError::io(source, err))?;
        }
        let size = tokio::fs::metadata(&destination)
            .await
            .map_err(|err| IndexError::io(&destination, err))?
            .len();

        let local_key = ContentKey::Local(destination.clone());
        if let Err(err) = self.inner.cache.invalidate(&local_key).await {
            warn!(identity = %local_key, error = %err, "could not invalidate cached content");
        }

        let document = Document::local(&name, destination, size, now());
        let replaced = {
            let mut documents = self.inner.lock();
            let position = documents.iter().position(|doc| doc.name == name);
            let replaced = position.map(|position| (position, documents.remove(position)));
            documents.insert(0, document.clone());
            replaced
        };
        debug!(document = %key, size, "imported document");

        let insertion = Insertion {
            document: document.clone(),
            replaced,
            created_file,
        };
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.complete_upload(insertion).await });
        Ok(PendingUpload { document, handle })
    }

    /// Deletes the local file, then the remote copy.
    ///
    /// Once the local file is gone the entry leaves the list even if the
    /// remote removal fails; that failure is still returned. A document
    /// with no local file stays listed until its remote removal succeeds.
    pub async fn remove(&self, document: &Document) -> Result<(), IndexError> {
        if let Some(path) = &document.local_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(IndexError::io(path, err)),
            }
            self.inner.forget_content(&ContentKey::Local(path.clone())).await;
        }
        if let Some(url) = &document.remote_url {
            self.inner.forget_content(&ContentKey::Remote(url.clone())).await;
        }

        let remote = self.inner.uploads.delete(document).await;
        if document.local_path.is_some() || remote.is_ok() {
            self.inner.lock().retain(|doc| doc.name != document.name);
            info!(document = %document.name, "removed document");
        }
        remote.map_err(IndexError::from)
    }

    /// Decoded content, preferring the local copy.
    pub async fn content(&self, document: &Document) -> Result<Arc<D::Output>, IndexError> {
        let key = match (&document.local_path, &document.remote_url) {
            (Some(path), remote) => {
                let present = tokio::fs::try_exists(path).await.unwrap_or(false);
                match (present, remote) {
                    (true, _) => ContentKey::Local(path.clone()),
                    (false, Some(url)) => ContentKey::Remote(url.clone()),
                    (false, None) => return Err(IndexError::NotFound(document.name.clone())),
                }
            }
            (None, Some(url)) => ContentKey::Remote(url.clone()),
            (None, None) => return Err(IndexError::NotFound(document.name.clone())),
        };
        Ok(self.inner.cache.fetch(&key).await?)
    }
}

impl<D: ContentDecoder> IndexInner<D> {
    fn lock(&self) -> MutexGuard<'_, Vec<Document>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn scan_local(&self) -> Result<Vec<Document>, IndexError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|err| IndexError::io(&self.dir, err))?;
        let mut documents = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| IndexError::io(&self.dir, err))?
        {
            let path = entry.path();
            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase);
            if !extension.is_some_and(|ext| self.extensions.contains(&ext)) {
                continue;
            }
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let created_at = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map(OffsetDateTime::from)
                .unwrap_or_else(|_| now());
            documents.push(Document::local(
                name,
                path.clone(),
                metadata.len(),
                created_at,
            ));
        }
        Ok(documents)
    }

    async fn complete_upload(&self, insertion: Insertion) -> Result<Document, IndexError> {
        match self.uploads.upload(&insertion.document).await {
            Ok(uploaded) => {
                let mut documents = self.lock();
                if let Some(entry) = documents.iter_mut().find(|doc| doc.name == uploaded.name) {
                    *entry = uploaded.clone();
                }
                Ok(uploaded)
            }
            Err(err) => {
                warn!(document = %insertion.document.name, error = %err, "upload failed, rolling back");
                self.roll_back(insertion).await;
                Err(err.into())
            }
        }
    }

    async fn roll_back(&self, insertion: Insertion) {
        let removed = {
            let mut documents = self.lock();
            match documents
                .iter()
                .position(|doc| is_same_entry(doc, &insertion.document))
            {
                Some(position) => {
                    documents.remove(position);
                    if let Some((old_position, old)) = insertion.replaced {
                        let position = old_position.min(documents.len());
                        documents.insert(position, old);
                    }
                    true
                }
                None => false,
            }
        };

        if removed && insertion.created_file {
            if let Some(path) = &insertion.document.local_path {
                if let Err(err) = tokio::fs::remove_file(path).await {
                    warn!(path = %path.display(), error = %err, "could not remove imported file");
                }
            }
        }
    }

    async fn forget_content(&self, key: &ContentKey) {
        if let Err(err) = self.cache.invalidate(key).await {
            warn!(identity = %key, error = %err, "could not invalidate cached content");
        }
    }
}

/// The optimistic entry, not a later one with the same name.
fn is_same_entry(entry: &Document, inserted: &Document) -> bool {
    entry.name == inserted.name
        && entry.local_path == inserted.local_path
        && entry.created_at == inserted.created_at
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
