//! The per-operation changeset.
//!
//! Collects the direct B-tree mutations of the current public
//! operation. The finalizer either clears it (transactions carry their
//! own journal records) or, when recovery is on and transactions are
//! off, flushes it as a single journal record under a fresh LSN before
//! the operation returns.

use crate::journal::{ChangesetEntry, Journal};
use crate::types::{EraseFlags, InsertFlags, Lsn};
use crate::error::Result;

/// The mutations accumulated by the current operation.
#[derive(Debug, Default)]
pub struct Changeset {
    entries: Vec<ChangesetEntry>,
}

impl Changeset {
    /// Creates an empty changeset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a direct insert.
    pub fn record_insert(&mut self, key: &[u8], record: &[u8], flags: InsertFlags) {
        self.entries.push(ChangesetEntry::Insert {
            key: key.to_vec(),
            record: record.to_vec(),
            flags: flags.to_bits(),
        });
    }

    /// Records a direct erase.
    pub fn record_erase(&mut self, key: &[u8], dupe: u32, flags: EraseFlags) {
        self.entries.push(ChangesetEntry::Erase {
            key: key.to_vec(),
            dupe,
            flags: flags.to_bits(),
        });
    }

    /// Returns true if no mutations were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards all recorded mutations.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Writes the recorded mutations to the journal and clears.
    ///
    /// The batch is forced to durable storage before the call returns.
    pub fn flush(&mut self, journal: &mut Journal, db: u16, lsn: Lsn) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.entries);
        journal.append_changeset(db, lsn, entries)?;
        journal.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::JournalRecord;
    use graftdb_storage::MemoryBackend;

    #[test]
    fn starts_empty() {
        let changeset = Changeset::new();
        assert!(changeset.is_empty());
    }

    #[test]
    fn clear_discards_entries() {
        let mut changeset = Changeset::new();
        changeset.record_insert(b"k", b"v", InsertFlags::new());
        assert!(!changeset.is_empty());
        changeset.clear();
        assert!(changeset.is_empty());
    }

    #[test]
    fn flush_writes_one_record_and_clears() {
        let mut changeset = Changeset::new();
        changeset.record_insert(b"k", b"v", InsertFlags::new());
        changeset.record_erase(b"j", 0, EraseFlags::all_duplicates());

        let mut journal = Journal::new(Box::new(MemoryBackend::new()), false);
        changeset.flush(&mut journal, 1, Lsn::new(9)).unwrap();
        assert!(changeset.is_empty());

        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        match &records[0].1 {
            JournalRecord::Changeset { db, lsn, entries } => {
                assert_eq!(*db, 1);
                assert_eq!(lsn.as_u64(), 9);
                assert_eq!(entries.len(), 2);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn empty_flush_writes_nothing() {
        let mut changeset = Changeset::new();
        let mut journal = Journal::new(Box::new(MemoryBackend::new()), false);
        changeset.flush(&mut journal, 1, Lsn::new(1)).unwrap();
        assert!(journal.is_empty().unwrap());
    }
}
