//! Two-tier cache for document content.
//!
//! The memory tier holds decoded content for at most `capacity` identities and
//! evicts the least recently accessed entry. The disk tier keeps the raw bytes
//! of every identity ever fetched until `clear`. Concurrent fetches of the same
//! identity share one underlying load.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// ============================================
// Error Types
// ============================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("failed to fetch {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("content not found: {0}")]
    NotFound(String),

    #[error("could not decode {identity}: {reason}")]
    Decode { identity: String, reason: String },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        CacheError::Io {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }
}

// ============================================
// Identities, sources and decoders
// ============================================

/// Where a piece of content comes from: a local file or a remote URL.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContentKey {
    Local(PathBuf),
    Remote(String),
}

impl ContentKey {
    /// `file://` URLs and plain paths are local; anything else with a
    /// scheme is remote.
    pub fn parse(identity: &str) -> Self {
        if let Some(path) = identity.strip_prefix("file://") {
            return ContentKey::Local(PathBuf::from(path));
        }
        if identity.contains("://") {
            ContentKey::Remote(identity.to_string())
        } else {
            ContentKey::Local(PathBuf::from(identity))
        }
    }

    fn disk_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        format!("{}.bin", hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentKey::Local(path) => write!(f, "file://{}", path.display()),
            ContentKey::Remote(url) => f.write_str(url),
        }
    }
}

/// Produces the raw bytes of an identity on a total cache miss.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn read(&self, key: &ContentKey) -> Result<Vec<u8>, CacheError>;
}

pub async fn read_local(path: &Path) -> Result<Vec<u8>, CacheError> {
    tokio::fs::read(path)
        .await
        .map_err(|err| CacheError::io(path, err))
}

/// Reads local files from disk and fetches remote URLs over HTTP.
pub struct HttpSource {
    client: reqwest::Client,
}

impl Default for HttpSource {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ContentSource for HttpSource {
    async fn read(&self, key: &ContentKey) -> Result<Vec<u8>, CacheError> {
        let url = match key {
            ContentKey::Local(path) => return read_local(path).await,
            ContentKey::Remote(url) => url,
        };
        let network = |err: reqwest::Error| CacheError::Network {
            url: url.clone(),
            reason: err.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(network)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CacheError::NotFound(url.clone()));
        }
        if !status.is_success() {
            return Err(CacheError::Network {
                url: url.clone(),
                reason: format!("status {status}"),
            });
        }
        let bytes = response.bytes().await.map_err(network)?;
        Ok(bytes.to_vec())
    }
}

/// Turns raw bytes into the in-memory representation held by the cache.
pub trait ContentDecoder: Send + Sync + 'static {
    type Output: Send + Sync + 'static;

    fn decode(&self, key: &ContentKey, bytes: &[u8]) -> Result<Self::Output, CacheError>;
}

/// Keeps the bytes as they are.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawDecoder;

impl ContentDecoder for RawDecoder {
    type Output = Vec<u8>;

    fn decode(&self, _key: &ContentKey, bytes: &[u8]) -> Result<Vec<u8>, CacheError> {
        Ok(bytes.to_vec())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PdfContent {
    pub version: String,
    pub bytes: Vec<u8>,
}

/// Accepts only content that starts with a `%PDF-` header.
#[derive(Clone, Copy, Debug, Default)]
pub struct PdfDecoder;

const PDF_MAGIC: &[u8] = b"%PDF-";

impl ContentDecoder for PdfDecoder {
    type Output = PdfContent;

    fn decode(&self, key: &ContentKey, bytes: &[u8]) -> Result<PdfContent, CacheError> {
        let Some(rest) = bytes.strip_prefix(PDF_MAGIC) else {
            return Err(CacheError::Decode {
                identity: key.to_string(),
                reason: "missing %PDF- header".to_string(),
            });
        };
        let version = rest
            .iter()
            .take_while(|b| b.is_ascii_digit() || **b == b'.')
            .map(|b| *b as char)
            .collect::<String>();
        Ok(PdfContent {
            version,
            bytes: bytes.to_vec(),
        })
    }
}

// ============================================
// Cache manager
// ============================================

type PendingFetch<T> = Shared<BoxFuture<'static, Result<Arc<T>, CacheError>>>;

pub struct DocumentCacheManager<D: ContentDecoder = PdfDecoder> {
    inner: Arc<CacheInner<D>>,
}

impl<D: ContentDecoder> Clone for DocumentCacheManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<D: ContentDecoder> {
    dir: PathBuf,
    capacity: usize,
    source: Arc<dyn ContentSource>,
    decoder: D,
    state: Mutex<CacheState<D::Output>>,
    /// Disk writes hold this shared; `clear` holds it exclusively so no
    /// write lands while the directory is being removed.
    disk: RwLock<()>,
}

struct CacheState<T> {
    memory: HashMap<ContentKey, MemoryEntry<T>>,
    pending: HashMap<ContentKey, PendingFetch<T>>,
    clock: u64,
}

struct MemoryEntry<T> {
    value: Arc<T>,
    last_access: u64,
}

impl<T> CacheState<T> {
    fn touch(&mut self, key: &ContentKey) -> Option<Arc<T>> {
        self.clock += 1;
        let clock = self.clock;
        let entry = self.memory.get_mut(key)?;
        entry.last_access = clock;
        Some(Arc::clone(&entry.value))
    }

    fn insert(&mut self, key: ContentKey, value: Arc<T>, capacity: usize) {
        self.clock += 1;
        self.memory.insert(
            key,
            MemoryEntry {
                value,
                last_access: self.clock,
            },
        );
        while self.memory.len() > capacity {
            let Some(oldest) = self
                .memory
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.memory.remove(&oldest);
            debug!(identity = %oldest, "evicted from memory cache");
        }
    }
}

impl<D: ContentDecoder> DocumentCacheManager<D> {
    /// `capacity` bounds the memory tier and is raised to at least one.
    pub fn new(
        dir: impl Into<PathBuf>,
        capacity: usize,
        source: Arc<dyn ContentSource>,
        decoder: D,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                dir: dir.into(),
                capacity: capacity.max(1),
                source,
                decoder,
                state: Mutex::new(CacheState {
                    memory: HashMap::new(),
                    pending: HashMap::new(),
                    clock: 0,
                }),
                disk: RwLock::new(()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Returns the decoded content for `key`, consulting memory, then disk,
    /// then the content source.
    pub async fn fetch(&self, key: &ContentKey) -> Result<Arc<D::Output>, CacheError> {
        let pending = {
            let mut state = self.inner.lock_state();
            if let Some(value) = state.touch(key) {
                debug!(identity = %key, "memory cache hit");
                return Ok(value);
            }
            match state.pending.get(key) {
                Some(pending) => {
                    debug!(identity = %key, "joining in-flight fetch");
                    pending.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let owned = key.clone();
                    let pending = async move { inner.load(owned).await }.boxed().shared();
                    state.pending.insert(key.clone(), pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Drops `key` from both tiers.
    pub async fn invalidate(&self, key: &ContentKey) -> Result<(), CacheError> {
        let _guard = self.inner.disk.write().await;
        self.inner.lock_state().memory.remove(key);
        let path = self.inner.dir.join(key.disk_name());
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CacheError::io(&path, err)),
        }
    }

    /// Removes every cached file and memory entry. Fetches already in flight
    /// may repopulate the cache once they finish.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let _guard = self.inner.disk.write().await;
        self.inner.lock_state().memory.clear();

        let dir = &self.inner.dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(CacheError::io(dir, err)),
        }
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| CacheError::io(dir, err))?;
        info!(dir = %dir.display(), "document cache cleared");
        Ok(())
    }

    pub fn memory_len(&self) -> usize {
        self.inner.lock_state().memory.len()
    }

    pub fn is_memory_resident(&self, key: &ContentKey) -> bool {
        self.inner.lock_state().memory.contains_key(key)
    }

    pub async fn is_disk_resident(&self, key: &ContentKey) -> bool {
        tokio::fs::try_exists(self.inner.dir.join(key.disk_name()))
            .await
            .unwrap_or(false)
    }
}

impl<D: ContentDecoder> CacheInner<D> {
    fn lock_state(&self) -> MutexGuard<'_, CacheState<D::Output>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn load(self: Arc<Self>, key: ContentKey) -> Result<Arc<D::Output>, CacheError> {
        let result = self.load_uncached(&key).await.map(Arc::new);
        let mut state = self.lock_state();
        state.pending.remove(&key);
        if let Ok(value) = &result {
            state.insert(key, Arc::clone(value), self.capacity);
        }
        result
    }

    async fn load_uncached(&self, key: &ContentKey) -> Result<D::Output, CacheError> {
        let path = self.dir.join(key.disk_name());
        if let Some(bytes) = self.read_disk(&path).await {
            match self.decoder.decode(key, &bytes) {
                Ok(value) => {
                    debug!(identity = %key, "disk cache hit");
                    return Ok(value);
                }
                Err(err) => warn!(identity = %key, error = %err, "discarding unreadable disk entry"),
            }
        }

        debug!(identity = %key, "cache miss, fetching content");
        let bytes = self.source.read(key).await?;
        let value = self.decoder.decode(key, &bytes)?;
        if let Err(err) = self.write_disk(&path, &bytes).await {
            warn!(identity = %key, error = %err, "failed to persist disk cache entry");
        }
        Ok(value)
    }

    async fn read_disk(&self, path: &Path) -> Option<Vec<u8>> {
        let _guard = self.disk.read().await;
        match tokio::fs::read(path).await {
            Ok(bytes) => Some(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "disk cache read failed");
                None
            }
        }
    }

    async fn write_disk(&self, path: &Path, bytes: &[u8]) -> Result<(), CacheError> {
        let _guard = self.disk.read().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| CacheError::io(&self.dir, err))?;
        let partial = path.with_extension("part");
        tokio::fs::write(&partial, bytes)
            .await
            .map_err(|err| CacheError::io(&partial, err))?;
        tokio::fs::rename(&partial, path)
            .await
            .map_err(|err| CacheError::io(path, err))
    }
}
