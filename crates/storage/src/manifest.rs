//! Level membership and compaction frontier, persisted atomically.
//!
//! The manifest is the authority on which SSTable files are live. Files on
//! disk that the manifest does not reference are leftovers from interrupted
//! flushes or compactions and are deleted at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest parse error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Current level membership. `levels[0]` is L0, ordered newest-first;
/// deeper levels hold non-overlapping tables ordered by key range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub next_table_id: u64,
    pub wal_epoch: u64,
    pub levels: Vec<Vec<u64>>,
}

impl Manifest {
    /// Load from `path`, or a fresh manifest when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ManifestError::Io(e)),
        }
    }

    /// Persist via temp file + rename so a crash never leaves a torn
    /// manifest.
    pub fn store(&self, path: &Path) -> Result<(), ManifestError> {
        let tmp = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn allocate_table_id(&mut self) -> u64 {
        let id = self.next_table_id;
        self.next_table_id += 1;
        id
    }

    /// All `(level, id)` pairs currently live.
    pub fn live_tables(&self) -> Vec<(usize, u64)> {
        self.levels
            .iter()
            .enumerate()
            .flat_map(|(level, ids)| ids.iter().map(move |&id| (level, id)))
            .collect()
    }
}

/// Path of a table file: `<root>/sst/L<level>/<id>.sst`.
pub fn table_path(root: &Path, level: usize, id: u64) -> PathBuf {
    root.join("sst").join(format!("L{level}")).join(format!("{id}.sst"))
}
