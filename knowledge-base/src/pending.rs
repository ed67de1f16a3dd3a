use std::{
    collections::BTreeSet,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Collection ids whose index directories could not be removed when their
/// document was deleted or replaced.
///
/// A collection moves Active -> PendingDelete when directory removal fails,
/// and PendingDelete -> Reclaimed when a later reconciliation pass manages
/// to remove it. The set only ever holds PendingDelete ids, so replaying
/// reconciliation is idempotent.
pub struct PendingDeletions {
    path: PathBuf,
    ids: BTreeSet<String>,
}

#[derive(Serialize, Deserialize, Default)]
struct PendingFile {
    collections: Vec<String>,
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimSummary {
    pub reclaimed: usize,
    pub still_locked: usize,
}

impl PendingDeletions {
    pub fn load(path: PathBuf) -> Self {
        let ids = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<PendingFile>(&bytes) {
                Ok(file) => file.collections.into_iter().collect(),
                Err(e) => {
                    warn!("Malformed pending-deletion file at {}: {e}", path.display());
                    BTreeSet::new()
                }
            },
            Err(_) => BTreeSet::new(),
        };
        Self { path, ids }
    }

    pub fn mark(&mut self, collection_id: &str) {
        if self.ids.insert(collection_id.to_owned()) {
            self.save();
        }
    }

    pub fn unmark(&mut self, collection_id: &str) {
        if self.ids.remove(collection_id) {
            self.save();
        }
    }

    pub fn contains(&self, collection_id: &str) -> bool {
        self.ids.contains(collection_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn save(&self) {
        let file = PendingFile {
            collections: self.ids.iter().cloned().collect(),
        };
        match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    warn!(
                        "Failed to persist pending deletions to {}: {e}",
                        self.path.display()
                    );
                }
            }
            Err(e) => warn!("Failed to serialize pending deletions: {e}"),
        }
    }
}
