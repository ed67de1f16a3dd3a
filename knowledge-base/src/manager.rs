use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use common::{
    document::Chunk,
    error::AppError,
    parser::DocumentParser,
};
use retrieval_pipeline::{HybridRetriever, RerankerPool, RetrievalTuning};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::{
    chunk_store::ChunkStore,
    hash_registry::{hash_file, FileHashRegistry},
    pending::{PendingDeletions, ReclaimSummary},
    vector_store::{StoredCollection, VectorStore},
};

use common::utils::embedding::EmbeddingProvider;

const STORAGE_DIR: &str = "kb_storage";
const VECTOR_DIR: &str = "vector_store";
const CONFIG_DIR: &str = ".rag_config";

/// Stable collection id for a document name. Pure: equal names always map
/// to the same id, across processes and restarts.
pub fn collection_id(document_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_name.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
    pub file_hash: Option<String>,
    pub chunk_count: Option<usize>,
    pub indexed: bool,
}

/// Owns every piece of per-document state: the stored file, the persisted
/// index, the chunk cache, the retriever cache, the hash registry and the
/// pending-deletion set.
///
/// The facade methods (`ingest`, `update`, `delete`) absorb errors: they
/// log and report failure through their return value instead of raising
/// across the boundary. A failed ingest or update leaves the hash registry
/// untouched so the next attempt is not short-circuited.
pub struct KnowledgeBase {
    storage_dir: PathBuf,
    parser: Arc<dyn DocumentParser>,
    embedder: Arc<EmbeddingProvider>,
    reranker: Option<Arc<RerankerPool>>,
    tuning: RetrievalTuning,
    vector_store: VectorStore,
    chunk_store: ChunkStore,
    retrievers: RwLock<HashMap<String, Arc<HybridRetriever>>>,
    hashes: Mutex<FileHashRegistry>,
    pending: Mutex<PendingDeletions>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// True when both paths resolve to the same underlying file. Textual path
/// comparison is not enough: relative spellings of the stored path alias
/// the same inode, and copying a file onto itself truncates it.
fn is_same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

impl KnowledgeBase {
    pub fn open(
        data_dir: &Path,
        parser: Arc<dyn DocumentParser>,
        embedder: Arc<EmbeddingProvider>,
        reranker: Option<Arc<RerankerPool>>,
        tuning: RetrievalTuning,
    ) -> Result<Self, AppError> {
        let storage_dir = data_dir.join(STORAGE_DIR);
        let config_dir = data_dir.join(CONFIG_DIR);
        std::fs::create_dir_all(&storage_dir)?;
        std::fs::create_dir_all(&config_dir)?;

        let vector_store = VectorStore::open(data_dir.join(VECTOR_DIR))?;
        let hashes = FileHashRegistry::load(config_dir.join("file_hashes.json"));
        let pending = PendingDeletions::load(config_dir.join("pending_deletions.json"));

        let kb = Self {
            storage_dir,
            parser,
            embedder,
            reranker,
            tuning,
            vector_store,
            chunk_store: ChunkStore::new(),
            retrievers: RwLock::new(HashMap::new()),
            hashes: Mutex::new(hashes),
            pending: Mutex::new(pending),
        };

        let summary = kb.reconcile_pending();
        if summary.reclaimed > 0 || summary.still_locked > 0 {
            info!(
                reclaimed = summary.reclaimed,
                still_locked = summary.still_locked,
                "Pending deletion reconciliation finished"
            );
        }

        Ok(kb)
    }

    /// Retries removal of every deferred index directory. Directories that
    /// are gone or removable leave the set; still-locked ones stay for the
    /// next pass. Safe to call repeatedly.
    pub fn reconcile_pending(&self) -> ReclaimSummary {
        let mut summary = ReclaimSummary::default();
        let ids = lock(&self.pending).ids();

        for id in ids {
            match self.vector_store.remove_collection(&id) {
                Ok(()) => {
                    lock(&self.pending).unmark(&id);
                    summary.reclaimed += 1;
                }
                Err(e) => {
                    warn!("Index directory {id} still locked: {e}");
                    summary.still_locked += 1;
                }
            }
        }

        summary
    }

    /// Adds a document to the knowledge base. Returns the document name on
    /// success, `None` on any failure.
    pub async fn ingest(&self, source: &Path, name: Option<&str>) -> Option<String> {
        match self.ingest_inner(source, name).await {
            Ok(document_name) => Some(document_name),
            Err(e) => {
                error!("Ingest failed for {}: {e}", source.display());
                None
            }
        }
    }

    async fn ingest_inner(&self, source: &Path, name: Option<&str>) -> Result<String, AppError> {
        self.parser.validate(source)?;

        let document_name = match name {
            Some(name) => name.to_owned(),
            None => source
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .ok_or_else(|| {
                    AppError::Validation(format!("invalid file name: {}", source.display()))
                })?,
        };

        let stored_path = self.storage_dir.join(&document_name);
        if !stored_path.exists() {
            std::fs::copy(source, &stored_path)?;
        }

        let id = collection_id(&document_name);
        if self
            .retrievers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
        {
            info!("Document {document_name} is already indexed");
            return Ok(document_name);
        }

        let content_hash = hash_file(&stored_path)?;
        let chunks = Arc::new(self.parser.parse(&stored_path)?);

        let collection = self
            .vector_store
            .create_collection(&id, &document_name, &chunks, &content_hash, &self.embedder)
            .await?;

        self.chunk_store.insert(&id, Arc::clone(&chunks));
        let retriever = self.build_retriever(chunks, &collection);
        self.retrievers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), retriever);

        // Only recorded once indexing has fully succeeded.
        if let Err(e) = lock(&self.hashes).set(&document_name, &content_hash) {
            warn!("Failed to persist hash registry: {e}");
        }
        // A re-created collection no longer needs deferred removal.
        lock(&self.pending).unmark(&id);

        info!("Ingested {document_name}");
        Ok(document_name)
    }

    /// Re-indexes a document when its content changed, or unconditionally
    /// with `force`. An unknown document is ingested instead. Returns the
    /// document name on success.
    pub async fn update(&self, source: &Path, force: bool) -> Option<String> {
        match self.update_inner(source, force).await {
            Ok(document_name) => Some(document_name),
            Err(e) => {
                error!("Update failed for {}: {e}", source.display());
                None
            }
        }
    }

    async fn update_inner(&self, source: &Path, force: bool) -> Result<String, AppError> {
        let document_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                AppError::Validation(format!("invalid file name: {}", source.display()))
            })?;

        let stored_path = self.storage_dir.join(&document_name);
        if !stored_path.exists() {
            return self.ingest_inner(source, None).await;
        }

        self.parser.validate(source)?;
        let new_hash = hash_file(source)?;
        let recorded = lock(&self.hashes).get(&document_name);
        if !force && recorded.as_deref() == Some(new_hash.as_str()) {
            info!("Document {document_name} unchanged, skipping re-index");
            return Ok(document_name);
        }

        let id = collection_id(&document_name);

        // Release all cached state before touching the persisted index.
        self.retrievers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.chunk_store.remove(&id);
        if let Err(e) = self.vector_store.remove_collection(&id) {
            warn!("Old index for {document_name} is locked, deferring removal: {e}");
            lock(&self.pending).mark(&id);
        }

        if !is_same_file(source, &stored_path) {
            std::fs::copy(source, &stored_path)?;
        }

        let chunks = Arc::new(self.parser.parse(&stored_path)?);
        let collection = self
            .vector_store
            .create_collection(&id, &document_name, &chunks, &new_hash, &self.embedder)
            .await?;

        self.chunk_store.insert(&id, Arc::clone(&chunks));
        let retriever = self.build_retriever(chunks, &collection);
        self.retrievers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), retriever);

        if let Err(e) = lock(&self.hashes).set(&document_name, &new_hash) {
            warn!("Failed to persist hash registry: {e}");
        }
        lock(&self.pending).unmark(&id);

        info!("Updated {document_name}");
        Ok(document_name)
    }

    /// Removes a document and all derived state. When the index directory
    /// cannot be removed its id is parked in the pending-deletion set and
    /// the deletion still succeeds; the document is no longer visible.
    pub fn delete(&self, document_name: &str) -> bool {
        let stored_path = self.storage_dir.join(document_name);
        if !stored_path.exists() {
            warn!("Cannot delete unknown document {document_name}");
            return false;
        }

        let id = collection_id(document_name);

        self.retrievers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.chunk_store.remove(&id);
        self.vector_store.release(&id);
        if let Err(e) = lock(&self.hashes).remove(document_name) {
            warn!("Failed to persist hash registry: {e}");
        }

        if let Err(e) = std::fs::remove_file(&stored_path) {
            error!("Failed to remove stored file for {document_name}: {e}");
            return false;
        }

        if let Err(e) = self.vector_store.remove_collection(&id) {
            warn!("Index directory for {document_name} is locked, deferring removal: {e}");
            lock(&self.pending).mark(&id);
        }

        info!("Deleted {document_name}");
        true
    }

    /// Returns the retriever for a document, rebuilding it from persisted
    /// state when it is not cached.
    pub async fn get_retriever(&self, document_name: &str) -> Option<Arc<HybridRetriever>> {
        let id = collection_id(document_name);
        if let Some(retriever) = self
            .retrievers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Some(Arc::clone(retriever));
        }

        match self.rebuild_retriever(document_name, &id).await {
            Ok(retriever) => Some(retriever),
            Err(e) => {
                warn!("No retriever available for {document_name}: {e}");
                None
            }
        }
    }

    async fn rebuild_retriever(
        &self,
        document_name: &str,
        id: &str,
    ) -> Result<Arc<HybridRetriever>, AppError> {
        let collection = self
            .vector_store
            .get_collection(id)
            .ok_or_else(|| AppError::NotFound(format!("no persisted index for {document_name}")))?;

        let chunks = match self.chunk_store.get(id) {
            Some(chunks) => chunks,
            None => {
                let parsed = Arc::new(self.parser.parse(&self.storage_dir.join(document_name))?);
                self.chunk_store.insert(id, Arc::clone(&parsed));
                parsed
            }
        };

        // The stored file drifted from the persisted index; re-embed.
        let collection = if collection.embeddings.len() == chunks.len() {
            collection
        } else {
            warn!("Persisted index for {document_name} is stale, re-indexing");
            let content_hash = hash_file(&self.storage_dir.join(document_name))?;
            self.vector_store
                .create_collection(id, document_name, &chunks, &content_hash, &self.embedder)
                .await?
        };

        let retriever = self.build_retriever(chunks, &collection);
        self.retrievers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_owned(), Arc::clone(&retriever));
        Ok(retriever)
    }

    fn build_retriever(
        &self,
        chunks: Arc<Vec<Chunk>>,
        collection: &StoredCollection,
    ) -> Arc<HybridRetriever> {
        Arc::new(HybridRetriever::new(
            chunks,
            collection.embeddings.clone(),
            Arc::clone(&self.embedder),
            self.reranker.clone(),
            self.tuning,
        ))
    }

    /// Sorted names of the stored, non-hidden documents.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.storage_dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    pub fn info(&self, document_name: &str) -> Option<DocumentInfo> {
        let path = self.storage_dir.join(document_name);
        let metadata = std::fs::metadata(&path).ok()?;
        let id = collection_id(document_name);

        Some(DocumentInfo {
            name: document_name.to_owned(),
            size_bytes: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            file_hash: lock(&self.hashes).get(document_name),
            chunk_count: self.chunk_store.get(&id).map(|chunks| chunks.len()),
            indexed: self
                .retrievers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&id)
                || self.vector_store.has_persisted(&id),
            path,
        })
    }

    /// Re-ingests every stored document, typically at startup.
    pub async fn preload(&self) -> usize {
        let mut loaded = 0;
        for name in self.list() {
            let path = self.storage_dir.join(&name);
            if self.ingest(&path, None).await.is_some() {
                loaded += 1;
            } else {
                warn!("Failed to preload {name}");
            }
        }
        loaded
    }

    pub fn cached_chunks(&self, document_name: &str) -> Option<Arc<Vec<Chunk>>> {
        self.chunk_store.get(&collection_id(document_name))
    }

    pub fn is_pending_deletion(&self, collection_id: &str) -> bool {
        lock(&self.pending).contains(collection_id)
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn index_dir(&self, collection_id: &str) -> PathBuf {
        self.vector_store.collection_path(collection_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::parser::TextDocumentParser;
    use std::io::Write;

    fn test_kb(data_dir: &Path) -> KnowledgeBase {
        let parser = Arc::new(TextDocumentParser::new(100, 20));
        let embedder =
            Arc::new(EmbeddingProvider::new_hashed(32).expect("Failed to create provider"));
        KnowledgeBase::open(data_dir, parser, embedder, None, RetrievalTuning::default())
            .expect("Failed to open knowledge base")
    }

    fn write_doc(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).expect("Failed to create document");
        file.write_all(content.as_bytes())
            .expect("Failed to write document");
        path
    }

    #[test]
    fn test_collection_id_is_pure() {
        let a = collection_id("report.txt");
        let b = collection_id("report.txt");
        let c = collection_id("other.txt");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_ingest_then_list_and_info() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = test_kb(dir.path());
        let source = write_doc(dir.path(), "notes.txt", &"river valley flour mill ".repeat(40));

        let name = kb.ingest(&source, None).await.expect("ingest");
        assert_eq!(name, "notes.txt");
        assert_eq!(kb.list(), vec!["notes.txt".to_string()]);

        let info = kb.info("notes.txt").expect("info");
        assert!(info.indexed);
        assert!(info.file_hash.is_some());
        assert!(info.chunk_count.expect("chunk count") > 0);
        assert!(info.size_bytes > 0);
    }

    #[tokio::test]
    async fn test_ingest_rejects_unsupported_format() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = test_kb(dir.path());
        let source = write_doc(dir.path(), "deck.pptx", "unused");

        assert!(kb.ingest(&source, None).await.is_none());
        assert!(kb.list().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_update_is_noop() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = test_kb(dir.path());
        let source = write_doc(dir.path(), "notes.txt", &"stable content ".repeat(50));

        kb.ingest(&source, None).await.expect("ingest");
        let before = kb.get_retriever("notes.txt").await.expect("retriever");

        kb.update(&source, false).await.expect("update");
        let after = kb.get_retriever("notes.txt").await.expect("retriever");
        assert!(
            Arc::ptr_eq(&before, &after),
            "Unchanged update must not rebuild the retriever"
        );
    }

    #[tokio::test]
    async fn test_forced_update_rebuilds() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = test_kb(dir.path());
        let source = write_doc(dir.path(), "notes.txt", &"stable content ".repeat(50));

        kb.ingest(&source, None).await.expect("ingest");
        let before = kb.get_retriever("notes.txt").await.expect("retriever");

        kb.update(&source, true).await.expect("forced update");
        let after = kb.get_retriever("notes.txt").await.expect("retriever");
        assert!(
            !Arc::ptr_eq(&before, &after),
            "Forced update must rebuild the retriever"
        );
    }

    #[tokio::test]
    async fn test_forced_update_from_aliased_storage_path_keeps_content() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = test_kb(dir.path());
        let source = write_doc(dir.path(), "notes.txt", &"surviving content ".repeat(50));
        kb.ingest(&source, None).await.expect("ingest");

        // The stored file itself, spelled with a redundant path component so
        // it does not compare equal to the managed path textually
        let alias = kb.storage_dir().join(".").join("notes.txt");
        kb.update(&alias, true).await.expect("forced update");

        let stored = std::fs::read_to_string(kb.storage_dir().join("notes.txt"))
            .expect("Failed to read stored document");
        assert!(
            !stored.is_empty(),
            "Stored document must survive a forced update from its own path"
        );
        assert!(stored.contains("surviving content"));
        assert!(
            kb.info("notes.txt")
                .expect("info")
                .chunk_count
                .expect("chunk count")
                > 0
        );
    }

    #[tokio::test]
    async fn test_changed_update_reindexes() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = test_kb(dir.path());
        let source = write_doc(dir.path(), "notes.txt", &"first version ".repeat(50));
        kb.ingest(&source, None).await.expect("ingest");
        let first_hash = kb.info("notes.txt").expect("info").file_hash;

        write_doc(dir.path(), "notes.txt", &"second version ".repeat(60));
        kb.update(&source, false).await.expect("update");
        let second_hash = kb.info("notes.txt").expect("info").file_hash;

        assert_ne!(first_hash, second_hash);
    }

    #[tokio::test]
    async fn test_delete_removes_all_visible_state() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = test_kb(dir.path());
        let source = write_doc(dir.path(), "notes.txt", &"to be deleted ".repeat(40));
        kb.ingest(&source, None).await.expect("ingest");

        assert!(kb.delete("notes.txt"));
        assert!(kb.list().is_empty());
        assert!(kb.info("notes.txt").is_none());
        assert!(kb.get_retriever("notes.txt").await.is_none());
        assert!(!kb.delete("notes.txt"), "Second delete must report failure");
    }

    #[tokio::test]
    async fn test_get_retriever_rebuilds_after_cache_loss() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source_content = "persistent index content ".repeat(40);

        {
            let kb = test_kb(dir.path());
            let source = write_doc(dir.path(), "notes.txt", &source_content);
            kb.ingest(&source, None).await.expect("ingest");
        }

        // New instance: caches are empty, persisted state remains
        let kb = test_kb(dir.path());
        let retriever = kb
            .get_retriever("notes.txt")
            .await
            .expect("rebuilt retriever");
        assert!(retriever.chunk_count() > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_deferred_deletion_lifecycle() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let kb = test_kb(dir.path());
        let source = write_doc(dir.path(), "locked.txt", &"locked index content ".repeat(40));
        kb.ingest(&source, None).await.expect("ingest");

        let id = collection_id("locked.txt");
        let index_dir = kb.index_dir(&id);

        // Simulate another process holding the directory open
        std::fs::set_permissions(&index_dir, std::fs::Permissions::from_mode(0o555))
            .expect("Failed to lock index dir");

        assert!(kb.delete("locked.txt"), "Delete must succeed despite lock");
        assert!(kb.list().is_empty());
        assert!(kb.info("locked.txt").is_none());
        assert!(kb.is_pending_deletion(&id));

        // Still locked: reconciliation keeps the entry
        let summary = kb.reconcile_pending();
        assert_eq!(summary.still_locked, 1);
        assert!(kb.is_pending_deletion(&id));

        // Release the lock and reconcile again
        std::fs::set_permissions(&index_dir, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to unlock index dir");
        let summary = kb.reconcile_pending();
        assert_eq!(summary.reclaimed, 1);
        assert!(!kb.is_pending_deletion(&id));
        assert!(!index_dir.exists());
    }
}
