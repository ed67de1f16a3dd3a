use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use tracing::warn;

/// Persisted map of document name to content hash, used for change
/// detection on update.
pub struct FileHashRegistry {
    path: PathBuf,
    hashes: HashMap<String, String>,
}

impl FileHashRegistry {
    /// Loads the registry, starting empty when the file is missing or
    /// unreadable.
    pub fn load(path: PathBuf) -> Self {
        let hashes = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(hashes) => hashes,
                Err(e) => {
                    warn!("Malformed hash registry at {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, hashes }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.hashes.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hashes.contains_key(name)
    }

    pub fn set(&mut self, name: &str, hash: &str) -> std::io::Result<()> {
        self.hashes.insert(name.to_owned(), hash.to_owned());
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> std::io::Result<()> {
        self.hashes.remove(name);
        self.save()
    }

    fn save(&self) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.hashes)?;
        std::fs::write(&self.path, bytes)
    }
}

/// Streams the file through sha256 in 8KB reads.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(buffer.get(..read).unwrap_or_default());
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_registry_persists_across_loads() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("file_hashes.json");

        let mut registry = FileHashRegistry::load(path.clone());
        registry
            .set("notes.txt", "abc123")
            .expect("Failed to save registry");

        let reloaded = FileHashRegistry::load(path);
        assert_eq!(reloaded.get("notes.txt"), Some("abc123".to_string()));
        assert!(!reloaded.contains("other.txt"));
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("file_hashes.json");

        let mut registry = FileHashRegistry::load(path.clone());
        registry.set("a.txt", "h1").expect("save");
        registry.remove("a.txt").expect("save");

        let reloaded = FileHashRegistry::load(path);
        assert!(!reloaded.contains("a.txt"));
    }

    #[test]
    fn test_hash_file_changes_with_content() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("doc.txt");

        let mut file = File::create(&path).expect("Failed to create file");
        file.write_all(b"first version").expect("write");
        drop(file);
        let first = hash_file(&path).expect("hash");

        let mut file = File::create(&path).expect("Failed to recreate file");
        file.write_all(b"second version").expect("write");
        drop(file);
        let second = hash_file(&path).expect("hash");

        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }
}
