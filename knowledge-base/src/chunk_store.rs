use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use common::document::Chunk;

/// In-memory cache of parsed chunks keyed by collection id.
///
/// Entries are recoverable: a missing entry is repopulated by re-parsing
/// the stored source file, so eviction is never fatal.
#[derive(Default)]
pub struct ChunkStore {
    inner: RwLock<HashMap<String, Arc<Vec<Chunk>>>>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, collection_id: &str, chunks: Arc<Vec<Chunk>>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(collection_id.to_owned(), chunks);
    }

    pub fn get(&self, collection_id: &str) -> Option<Arc<Vec<Chunk>>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection_id)
            .cloned()
    }

    pub fn remove(&self, collection_id: &str) -> Option<Arc<Vec<Chunk>>> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(collection_id)
    }

    pub fn contains(&self, collection_id: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(collection_id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove_roundtrip() {
        let store = ChunkStore::new();
        let chunks = Arc::new(vec![Chunk::new(
            "body".to_string(),
            "a.txt".to_string(),
            0,
        )]);

        store.insert("id-1", Arc::clone(&chunks));
        assert!(store.contains("id-1"));
        assert_eq!(store.len(), 1);

        let fetched = store.get("id-1").expect("cached chunks");
        assert!(Arc::ptr_eq(&fetched, &chunks));

        assert!(store.remove("id-1").is_some());
        assert!(store.get("id-1").is_none());
        assert!(store.is_empty());
    }
}
