//! meridian-storage: the per-node LSM storage engine.
//!
//! Composes a segmented write-ahead log, an in-memory sorted memtable,
//! immutable on-disk SSTables arranged in levels, and background flush and
//! compaction. All operations are synchronous (blocking I/O); the async
//! boundary is at the caller (the KV layer).

pub mod bloom;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod record;
pub mod sstable;
pub mod wal;

pub use engine::{LsmEngine, StorageOptions};
pub use record::{Record, RecordMeta, RecordOrder};
pub use wal::FsyncPolicy;

/// Errors surfaced by the storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] wal::WalError),
    #[error("SSTable error: {0}")]
    Table(#[from] sstable::TableError),
    #[error("manifest error: {0}")]
    Manifest(#[from] manifest::ManifestError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(String),
}
