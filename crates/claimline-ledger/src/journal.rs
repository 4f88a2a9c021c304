//! Durable storage for audit entries

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::entry::AuditEntry;
use crate::error::Result;

/// Append-only store behind the ledger.
///
/// Appends happen under the ledger lock, so implementations should return
/// quickly.
pub trait AuditJournal: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<()>;

    /// Every entry in append order.
    fn load(&self) -> Result<Vec<AuditEntry>>;
}

/// In-memory journal for testing
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite the stored entries directly.
    pub fn tamper<F: FnOnce(&mut Vec<AuditEntry>)>(&self, f: F) {
        f(&mut self.entries.lock());
    }
}

impl AuditJournal for MemoryJournal {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.entries.lock().clone())
    }
}

/// JSON-lines journal. Each append is flushed before returning.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditJournal for FileJournal {
    fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<AuditEntry>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AuditOutcome;
    use claimline_types::{Checkpoint, Fingerprint, ItemId};

    fn entry(sequence: u64) -> AuditEntry {
        AuditEntry::seal(
            sequence,
            ItemId::new(),
            0,
            Checkpoint::Output,
            Fingerprint::hash(b"x"),
            AuditOutcome::Recorded,
            None,
        )
    }

    #[test]
    fn file_journal_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("ledger.jsonl");

        let journal = FileJournal::open(&path).unwrap();
        journal.append(&entry(0)).unwrap();
        journal.append(&entry(1)).unwrap();
        drop(journal);

        let reopened = FileJournal::open(&path).unwrap();
        let loaded = reopened.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].sequence, 1);
    }

    #[test]
    fn memory_journal_round_trip() {
        let journal = MemoryJournal::new();
        journal.append(&entry(0)).unwrap();
        assert_eq!(journal.load().unwrap().len(), 1);
        journal.tamper(|entries| entries.clear());
        assert!(journal.load().unwrap().is_empty());
    }
}
