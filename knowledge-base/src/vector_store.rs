use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use common::{document::Chunk, error::AppError, utils::embedding::EmbeddingProvider};
use serde::{Deserialize, Serialize};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info};

const COLLECTION_FILE: &str = "collection.json";

/// Persisted per-collection index: the embeddings for every chunk of one
/// document, aligned with the parse order of the document.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredCollection {
    pub collection_id: String,
    pub document_name: String,
    pub content_hash: String,
    pub dimension: usize,
    pub embeddings: Vec<Vec<f32>>,
}

/// File-backed vector store with one directory per collection.
///
/// Indexing is full-replace: a collection is rewritten as a whole, never
/// patched. Directory removal can fail while another process holds the
/// directory open; callers defer such removals.
pub struct VectorStore {
    root: PathBuf,
    open: RwLock<HashMap<String, Arc<StoredCollection>>>,
}

impl VectorStore {
    pub fn open(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            open: RwLock::new(HashMap::new()),
        })
    }

    fn collection_dir(&self, collection_id: &str) -> PathBuf {
        self.root.join(collection_id)
    }

    fn collection_file(&self, collection_id: &str) -> PathBuf {
        self.collection_dir(collection_id).join(COLLECTION_FILE)
    }

    /// Embeds the chunks and persists the collection, replacing any prior
    /// version. When the persisted collection already carries the same
    /// content hash and dimension, its embeddings are reused without
    /// calling the embedding backend.
    pub async fn create_collection(
        &self,
        collection_id: &str,
        document_name: &str,
        chunks: &[Chunk],
        content_hash: &str,
        embedder: &EmbeddingProvider,
    ) -> Result<Arc<StoredCollection>, AppError> {
        if let Some(existing) = self.load_from_disk(collection_id) {
            if existing.content_hash == content_hash
                && existing.dimension == embedder.dimension()
                && existing.embeddings.len() == chunks.len()
            {
                debug!("Reusing persisted embeddings for collection {collection_id}");
                let existing = Arc::new(existing);
                self.cache(collection_id, Arc::clone(&existing));
                return Ok(existing);
            }
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        let retry_strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        let embeddings = Retry::spawn(retry_strategy, || {
            let texts = texts.clone();
            async move { embedder.embed_batch(texts).await }
        })
        .await
        .map_err(|e| AppError::Embedding(e.to_string()))?;

        let collection = StoredCollection {
            collection_id: collection_id.to_owned(),
            document_name: document_name.to_owned(),
            content_hash: content_hash.to_owned(),
            dimension: embedder.dimension(),
            embeddings,
        };

        // Embeddings are complete before the old index is touched, so a
        // failed embedding run leaves the previous collection intact.
        let dir = self.collection_dir(collection_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        let bytes = serde_json::to_vec(&collection)?;
        std::fs::write(self.collection_file(collection_id), bytes)?;

        info!(
            collection_id,
            document_name,
            chunk_count = chunks.len(),
            "Collection indexed"
        );

        let collection = Arc::new(collection);
        self.cache(collection_id, Arc::clone(&collection));
        Ok(collection)
    }

    /// Returns the open handle, loading from disk on first access.
    pub fn get_collection(&self, collection_id: &str) -> Option<Arc<StoredCollection>> {
        if let Some(collection) = self
            .open
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection_id)
        {
            return Some(Arc::clone(collection));
        }

        let loaded = Arc::new(self.load_from_disk(collection_id)?);
        self.cache(collection_id, Arc::clone(&loaded));
        Some(loaded)
    }

    /// Drops the in-memory handle without touching the persisted files.
    pub fn release(&self, collection_id: &str) {
        self.open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(collection_id);
    }

    /// Removes the persisted collection directory. A missing directory
    /// counts as removed.
    pub fn remove_collection(&self, collection_id: &str) -> std::io::Result<()> {
        self.release(collection_id);
        let dir = self.collection_dir(collection_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn has_persisted(&self, collection_id: &str) -> bool {
        self.collection_file(collection_id).is_file()
    }

    pub fn collection_path(&self, collection_id: &str) -> PathBuf {
        self.collection_dir(collection_id)
    }

    fn load_from_disk(&self, collection_id: &str) -> Option<StoredCollection> {
        let bytes = std::fs::read(self.collection_file(collection_id)).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    fn cache(&self, collection_id: &str, collection: Arc<StoredCollection>) {
        self.open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection_id.to_owned(), collection);
    }
}

impl VectorStore {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(count: usize) -> Vec<Chunk> {
        (0..count)
            .map(|i| Chunk::new(format!("chunk body {i}"), "doc.txt".to_string(), i))
            .collect()
    }

    fn embedder() -> EmbeddingProvider {
        EmbeddingProvider::new_hashed(32).expect("Failed to create hashed provider")
    }

    #[tokio::test]
    async fn test_create_and_reload_collection() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = VectorStore::open(dir.path().to_path_buf()).expect("open store");
        let embedder = embedder();

        let created = store
            .create_collection("col-1", "doc.txt", &chunks(3), "hash-1", &embedder)
            .await
            .expect("create collection");
        assert_eq!(created.embeddings.len(), 3);
        assert!(store.has_persisted("col-1"));

        // Fresh store instance reads from disk
        let reopened = VectorStore::open(dir.path().to_path_buf()).expect("reopen store");
        let loaded = reopened.get_collection("col-1").expect("load collection");
        assert_eq!(loaded.content_hash, "hash-1");
        assert_eq!(loaded.embeddings, created.embeddings);
    }

    #[tokio::test]
    async fn test_matching_hash_reuses_embeddings() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = VectorStore::open(dir.path().to_path_buf()).expect("open store");
        let embedder = embedder();

        let first = store
            .create_collection("col-1", "doc.txt", &chunks(2), "hash-1", &embedder)
            .await
            .expect("create collection");
        let second = store
            .create_collection("col-1", "doc.txt", &chunks(2), "hash-1", &embedder)
            .await
            .expect("recreate collection");
        assert_eq!(first.embeddings, second.embeddings);
    }

    #[tokio::test]
    async fn test_remove_collection_is_idempotent() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = VectorStore::open(dir.path().to_path_buf()).expect("open store");
        let embedder = embedder();

        store
            .create_collection("col-1", "doc.txt", &chunks(1), "hash-1", &embedder)
            .await
            .expect("create collection");

        store.remove_collection("col-1").expect("remove");
        assert!(!store.has_persisted("col-1"));
        // Removing again is fine
        store.remove_collection("col-1").expect("remove again");
    }
}
