//! Integration tests for the document index, upload coordinator and cache
//!
//! Uses temp directories for the working directory and disk cache, and the
//! in-memory store and blob backends.

use chatvault::cache::{DocumentCacheManager, PdfDecoder};
use chatvault::index::{DocumentIndex, IndexError};
use chatvault::remote::{
    BlobError, CollectionPath, MemoryBlobStore, MemoryDocumentStore, StaticIdentity, StoreError,
};
use chatvault::types::UploadState;
use chatvault::upload::{UploadCoordinator, UploadError};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const USER: &str = "u1";

struct Setup {
    store: Arc<MemoryDocumentStore>,
    blobs: Arc<MemoryBlobStore>,
    uploads: Arc<UploadCoordinator>,
    index: DocumentIndex<PdfDecoder>,
    root: TempDir,
}

impl Setup {
    async fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryDocumentStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let identity = Arc::new(StaticIdentity::signed_in(USER));
        let uploads = Arc::new(UploadCoordinator::new(
            store.clone(),
            blobs.clone(),
            identity.clone(),
        ));
        let cache =
            DocumentCacheManager::new(root.path().join("cache"), 8, blobs.clone(), PdfDecoder);
        let index = DocumentIndex::open(
            root.path().join("documents"),
            vec!["pdf".to_string()],
            store.clone(),
            identity,
            uploads.clone(),
            cache,
        )
        .await
        .expect("open index");

        Self {
            store,
            blobs,
            uploads,
            index,
            root,
        }
    }

    /// Writes a PDF outside the working directory, as if picked by the user.
    fn source(&self, name: &str, len: usize) -> PathBuf {
        let dir = self.root.path().join("picked");
        std::fs::create_dir_all(&dir).expect("picked dir");
        let mut bytes = b"%PDF-1.5\n".to_vec();
        bytes.resize(len.max(bytes.len()), b' ');
        let path = dir.join(name);
        std::fs::write(&path, bytes).expect("write source");
        path
    }

    fn metadata_count(&self) -> usize {
        self.store.records(&CollectionPath::documents(USER)).len()
    }
}

mod add_tests {
    use super::*;

    #[tokio::test]
    async fn test_two_megabyte_pdf_is_listed_then_uploaded() {
        let setup = Setup::new().await;
        let source = setup.source("notes.pdf", 2 * 1024 * 1024);

        let pending = setup.index.add(&source).await.expect("add");

        // Visible straight away, before the upload has run
        let listed = setup.index.get("notes.pdf").expect("listed");
        assert_eq!(listed.upload_state, UploadState::LocalOnly);
        assert_eq!(listed.formatted_size(), "2.0 MB");
        assert!(listed.local_path.is_some());

        let uploaded = pending.wait().await.expect("upload");
        assert_eq!(uploaded.upload_state, UploadState::Uploaded);

        let listed = setup.index.get("notes.pdf").expect("listed");
        assert_eq!(listed.upload_state, UploadState::Uploaded);
        assert!(listed.remote_url.as_deref().is_some_and(|url| !url.is_empty()));
        assert!(listed.id.is_some());
        assert_eq!(setup.index.list().len(), 1);
        assert_eq!(setup.metadata_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_rolls_back() {
        let setup = Setup::new().await;
        let source = setup.source("report.pdf", 512);
        setup
            .blobs
            .fail_next_put(BlobError::Upload("connection reset".to_string()));

        let pending = setup.index.add(&source).await.expect("add");
        let err = pending.wait().await.unwrap_err();

        assert!(matches!(
            err,
            IndexError::Upload(UploadError::Blob(BlobError::Upload(_)))
        ));
        assert!(setup.index.get("report.pdf").is_none());
        assert!(!setup.index.dir().join("report.pdf").exists());
        assert_eq!(setup.metadata_count(), 0);
    }

    #[tokio::test]
    async fn test_metadata_failure_reports_orphan() {
        let setup = Setup::new().await;
        let source = setup.source("report.pdf", 512);
        setup
            .store
            .fail_next_add(StoreError::Unavailable("offline".to_string()));

        let err = setup
            .index
            .add(&source)
            .await
            .expect("add")
            .wait()
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IndexError::Upload(UploadError::OrphanedBlob { .. })
        ));
        assert!(setup.index.get("report.pdf").is_none());
        let orphans = setup.uploads.orphaned_blobs();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].storage_path, "users/u1/pdfs/report.pdf");
        assert_eq!(setup.blobs.blob_count(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_remote_metadata() {
        let setup = Setup::new().await;
        let first = setup.source("plan.pdf", 100);
        setup
            .index
            .add(&first)
            .await
            .expect("add")
            .wait()
            .await
            .expect("first upload");

        let second = setup.source("plan.pdf", 300);
        let uploaded = setup
            .index
            .add(&second)
            .await
            .expect("add")
            .wait()
            .await
            .expect("second upload");
        assert_eq!(uploaded.size, 300);

        setup.index.refresh().await.expect("refresh");
        let listed = setup.index.get("plan.pdf").expect("listed");
        assert_eq!(listed.size, 300);
        assert_eq!(listed.id, uploaded.id);
        assert_eq!(setup.metadata_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_overwrite_restores_previous_entry() {
        let setup = Setup::new().await;
        let first = setup.source("plan.pdf", 100);
        setup
            .index
            .add(&first)
            .await
            .expect("add")
            .wait()
            .await
            .expect("first upload");

        let second = setup.source("plan.pdf", 300);
        setup
            .blobs
            .fail_next_put(BlobError::Upload("connection reset".to_string()));
        let result = setup.index.add(&second).await.expect("add").wait().await;
        assert!(result.is_err());

        let restored = setup.index.get("plan.pdf").expect("restored");
        assert_eq!(restored.size, 100);
        assert!(restored.id.is_some());
        assert_eq!(restored.upload_state, UploadState::Uploaded);
        assert_eq!(setup.metadata_count(), 1);

        // Still shown as synced after reloading the catalog
        setup.index.refresh().await.expect("refresh");
        let reloaded = setup.index.get("plan.pdf").expect("reloaded");
        assert_eq!(reloaded.upload_state, UploadState::Uploaded);
    }

    #[tokio::test]
    async fn test_second_add_during_upload_is_rejected() {
        let setup = Setup::new().await;
        let source = setup.source("a.pdf", 64);
        setup.blobs.hold_uploads();
        let mut updates = setup.uploads.subscribe_updates();

        let pending = setup.index.add(&source).await.expect("add");
        let started = updates.recv().await.expect("update");
        assert!(started.state.is_uploading());
        assert!(setup.index.get("a.pdf").expect("listed").upload_state.is_uploading());

        let err = setup.index.add(&source).await.err().expect("rejected");
        assert!(matches!(
            err,
            IndexError::Upload(UploadError::ConcurrentUpload(_))
        ));

        setup.blobs.release_uploads();
        pending.wait().await.expect("upload");
        assert_eq!(setup.blobs.put_count(), 1);
    }
}

mod remove_tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_deletes_everywhere() {
        let setup = Setup::new().await;
        let source = setup.source("a.pdf", 64);
        let doc = setup
            .index
            .add(&source)
            .await
            .expect("add")
            .wait()
            .await
            .expect("upload");

        setup.index.remove(&doc).await.expect("remove");

        assert!(setup.index.list().is_empty());
        assert_eq!(setup.metadata_count(), 0);
        assert_eq!(setup.blobs.blob_count(), 0);
        assert!(!setup.index.dir().join("a.pdf").exists());
    }

    #[tokio::test]
    async fn test_remote_failure_still_drops_local_entry() {
        let setup = Setup::new().await;
        let source = setup.source("a.pdf", 64);
        let doc = setup
            .index
            .add(&source)
            .await
            .expect("add")
            .wait()
            .await
            .expect("upload");
        setup
            .blobs
            .fail_next_delete(BlobError::Delete("denied".to_string()));

        let err = setup.index.remove(&doc).await.unwrap_err();

        assert!(matches!(err, IndexError::Upload(UploadError::Blob(_))));
        assert!(setup.index.get("a.pdf").is_none());
        assert_eq!(setup.metadata_count(), 1);
    }
}

mod catalog_tests {
    use super::*;

    #[tokio::test]
    async fn test_refresh_merges_uploaded_and_local_copies() {
        let setup = Setup::new().await;
        let source = setup.source("a.pdf", 64);
        setup
            .index
            .add(&source)
            .await
            .expect("add")
            .wait()
            .await
            .expect("upload");

        setup.index.refresh().await.expect("refresh");

        let docs = setup.index.list();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].local_path.is_some());
        assert!(docs[0].remote_url.is_some());
        assert_eq!(docs[0].upload_state, UploadState::Uploaded);
    }

    #[tokio::test]
    async fn test_content_is_decoded_through_the_cache() {
        let setup = Setup::new().await;
        let source = setup.source("a.pdf", 64);
        let doc = setup
            .index
            .add(&source)
            .await
            .expect("add")
            .wait()
            .await
            .expect("upload");

        let content = setup.index.content(&doc).await.expect("content");
        assert_eq!(content.version, "1.5");

        // With the local copy gone the uploaded blob is used instead
        std::fs::remove_file(doc.local_path.as_ref().expect("local")).expect("remove local");
        let remote = setup.index.content(&doc).await.expect("remote content");
        assert_eq!(remote.bytes.len(), 64);
    }
}
