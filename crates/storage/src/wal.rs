//! Segmented write-ahead log.
//!
//! One segment per flush epoch at `wal/<epoch>.log`. Each entry is framed as
//! `[4-byte CRC32][4-byte length][JSON payload]`. Replay applies all valid
//! entries in epoch order; a torn tail on the newest segment is truncated
//! with a warning, corruption anywhere else aborts startup.

use crate::record::Record;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("WAL segment {epoch} corrupt at entry {entry}")]
    Corrupt { epoch: u64, entry: u64 },
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every append.
    Always,
    /// Fsync periodically (caller controls via `sync`).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// A logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalEntry {
    Put { record: Record },
    Delete { record: Record },
    TxBegin { tx_id: String },
    TxPrepare { tx_id: String },
    TxCommit { tx_id: String },
    TxAbort { tx_id: String },
}

impl WalEntry {
    /// The record carried by data entries, if any.
    pub fn record(&self) -> Option<&Record> {
        match self {
            WalEntry::Put { record } | WalEntry::Delete { record } => Some(record),
            _ => None,
        }
    }
}

fn segment_path(dir: &Path, epoch: u64) -> PathBuf {
    dir.join(format!("{epoch}.log"))
}

/// An open, append-only WAL segment.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    epoch: u64,
    writer: BufWriter<File>,
    fsync: FsyncPolicy,
    entries_written: u64,
}

impl Wal {
    /// Open (or create) the segment for `epoch` under `dir`.
    pub fn open(dir: &Path, epoch: u64, fsync: FsyncPolicy) -> Result<Self, WalError> {
        std::fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, epoch))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            epoch,
            writer: BufWriter::new(file),
            fsync,
            entries_written: 0,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Append an entry, flushed (and fsynced per policy) before returning.
    pub fn append(&mut self, entry: &WalEntry) -> Result<(), WalError> {
        let payload = serde_json::to_vec(entry)?;

        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();
        let len = payload.len() as u32;

        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Explicitly fsync (batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Start a new segment for `new_epoch`. The previous segment stays on
    /// disk until the caller has persisted its contents and removes it.
    pub fn rotate(&mut self, new_epoch: u64) -> Result<(), WalError> {
        self.sync()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, new_epoch))?;
        self.writer = BufWriter::new(file);
        self.epoch = new_epoch;
        self.entries_written = 0;
        Ok(())
    }

    /// Delete a fully-persisted segment.
    pub fn remove_segment(dir: &Path, epoch: u64) -> Result<(), WalError> {
        let path = segment_path(dir, epoch);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WalError::Io(e)),
        }
    }

    /// Epochs of all segments present under `dir`, ascending.
    pub fn list_segments(dir: &Path) -> Result<Vec<u64>, WalError> {
        let mut epochs = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(epochs),
            Err(e) => return Err(WalError::Io(e)),
        };
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Ok(epoch) = stem.parse() {
                    epochs.push(epoch);
                }
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Replay all segments under `dir` in epoch order.
    ///
    /// A torn or CRC-mismatched tail on the newest segment stops that
    /// segment's replay with a warning; the same damage in an older
    /// segment is fatal.
    pub fn replay_dir(dir: &Path) -> Result<Vec<(u64, WalEntry)>, WalError> {
        let epochs = Self::list_segments(dir)?;
        let mut entries = Vec::new();
        for (i, &epoch) in epochs.iter().enumerate() {
            let is_newest = i == epochs.len() - 1;
            let segment = Self::replay_segment(dir, epoch, is_newest)?;
            entries.extend(segment.into_iter().map(|e| (epoch, e)));
        }
        Ok(entries)
    }

    fn replay_segment(
        dir: &Path,
        epoch: u64,
        tolerate_tail: bool,
    ) -> Result<Vec<WalEntry>, WalError> {
        let file = match File::open(segment_path(dir, epoch)) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut entry_num = 0u64;

        loop {
            // CRC (4 bytes); clean EOF here ends the segment.
            let mut crc_buf = [0u8; 4];
            match io::Read::read_exact(&mut reader, &mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(WalError::Io(e)),
            }
            let expected_crc = u32::from_le_bytes(crc_buf);

            // Treat EOF mid-entry as a torn tail.
            macro_rules! read_or_tear {
                ($buf:expr) => {
                    match io::Read::read_exact(&mut reader, $buf) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            if tolerate_tail {
                                tracing::warn!(
                                    epoch,
                                    entry = entry_num,
                                    "WAL truncated mid-entry; stopping replay"
                                );
                                break;
                            }
                            return Err(WalError::Corrupt {
                                epoch,
                                entry: entry_num,
                            });
                        }
                        Err(e) => return Err(WalError::Io(e)),
                    }
                };
            }

            let mut len_buf = [0u8; 4];
            read_or_tear!(&mut len_buf);
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            read_or_tear!(&mut payload);

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != expected_crc {
                if tolerate_tail {
                    tracing::warn!(
                        epoch,
                        entry = entry_num,
                        "WAL CRC mismatch; truncating replay at last valid record"
                    );
                    break;
                }
                return Err(WalError::Corrupt {
                    epoch,
                    entry: entry_num,
                });
            }

            let entry: WalEntry = serde_json::from_slice(&payload)?;
            entries.push(entry);
            entry_num += 1;
        }

        Ok(entries)
    }
}
