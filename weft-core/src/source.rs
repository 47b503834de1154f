//! File-Change Boundary
//!
//! The engine does not watch the filesystem itself; an external watcher
//! feeds add/update/remove events into a `KeyedCollection<PathBuf,
//! FileRecord>`. The helpers here enforce the boundary contract: an
//! update whose content hash is unchanged never reaches the collection,
//! so touch-only events (metadata writes, editor save dances) cause no
//! downstream work.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::collection::keyed::KeyedCollection;
use crate::error::CollectionError;

/// One source file as seen by the build graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub content: String,
    pub content_hash: u64,
    pub modified: SystemTime,
}

impl FileRecord {
    /// Build a record, hashing the content.
    pub fn new(path: impl Into<PathBuf>, content: impl Into<String>, modified: SystemTime) -> Self {
        let content = content.into();
        let content_hash = hash_content(&content);
        Self {
            path: path.into(),
            content,
            content_hash,
            modified,
        }
    }
}

/// Stable content hash used for change suppression.
pub fn hash_content(content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

/// Feed one add-or-update event into the collection.
///
/// Inserts unknown paths; for known paths, compares content hashes first
/// and drops the event when unchanged, so a modification-time-only change
/// never triggers a rebuild. Returns whether the collection changed.
pub fn apply_change(
    files: &KeyedCollection<PathBuf, FileRecord>,
    record: FileRecord,
) -> Result<bool, CollectionError> {
    let path = record.path.clone();
    match files.get_untracked(&path) {
        None => {
            files.insert(path, record)?;
            Ok(true)
        }
        Some(existing) if existing.content_hash == record.content_hash => Ok(false),
        Some(_) => files.update(&path, record),
    }
}

/// Feed one removal event into the collection.
pub fn apply_removal(
    files: &KeyedCollection<PathBuf, FileRecord>,
    path: &PathBuf,
) -> Option<FileRecord> {
    files.remove(path)
}
