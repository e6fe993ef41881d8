//! The recovery journal.
//!
//! An append-only log of transactional operations and non-transactional
//! changesets. Records are framed with a magic/version/type/length
//! envelope and a CRC32 trailer; a torn tail record (from a crash
//! mid-append) terminates reading, a damaged earlier record is reported
//! as corruption.

mod record;

pub use record::{
    compute_crc32, ChangesetEntry, JournalRecord, JournalRecordType, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};

use crate::error::{Error, Result};
use crate::types::{Lsn, TransactionId};
use graftdb_storage::StorageBackend;
use tracing::{debug, warn};

/// Envelope size: magic (4) + version (2) + type (1) + length (4).
const HEADER_SIZE: usize = 11;

/// CRC trailer size.
const CRC_SIZE: usize = 4;

/// The append-only recovery journal.
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_append: bool,
}

impl Journal {
    /// Creates a journal over `backend`.
    ///
    /// With `sync_on_append` every appended record is forced to durable
    /// storage before the call returns.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_append: bool) -> Self {
        Self {
            backend,
            sync_on_append,
        }
    }

    /// Appends a record and returns the offset it was written at.
    pub fn append(&mut self, record: &JournalRecord) -> Result<u64> {
        let data = encode_frame(record);
        let offset = self.backend.append(&data)?;
        if self.sync_on_append {
            self.backend.sync()?;
        } else {
            self.backend.flush()?;
        }
        Ok(offset)
    }

    /// Appends an insert operation record.
    pub fn append_insert(
        &mut self,
        db: u16,
        txn: TransactionId,
        key: &[u8],
        record: &[u8],
        flags: u32,
        lsn: Lsn,
    ) -> Result<()> {
        self.append(&JournalRecord::Insert {
            db,
            txn,
            key: key.to_vec(),
            record: record.to_vec(),
            flags,
            lsn,
        })?;
        Ok(())
    }

    /// Appends an erase operation record.
    pub fn append_erase(
        &mut self,
        db: u16,
        txn: TransactionId,
        key: &[u8],
        dupe: u32,
        flags: u32,
        lsn: Lsn,
    ) -> Result<()> {
        self.append(&JournalRecord::Erase {
            db,
            txn,
            key: key.to_vec(),
            dupe,
            flags,
            lsn,
        })?;
        Ok(())
    }

    /// Appends a transaction-begin record.
    pub fn append_txn_begin(&mut self, txn: TransactionId, lsn: Lsn) -> Result<()> {
        self.append(&JournalRecord::TxnBegin { txn, lsn })?;
        Ok(())
    }

    /// Appends a transaction-commit record.
    pub fn append_txn_commit(&mut self, txn: TransactionId, lsn: Lsn) -> Result<()> {
        self.append(&JournalRecord::TxnCommit { txn, lsn })?;
        Ok(())
    }

    /// Appends a transaction-abort record.
    pub fn append_txn_abort(&mut self, txn: TransactionId, lsn: Lsn) -> Result<()> {
        self.append(&JournalRecord::TxnAbort { txn, lsn })?;
        Ok(())
    }

    /// Appends a changeset batch record.
    pub fn append_changeset(
        &mut self,
        db: u16,
        lsn: Lsn,
        entries: Vec<ChangesetEntry>,
    ) -> Result<()> {
        self.append(&JournalRecord::Changeset { db, lsn, entries })?;
        Ok(())
    }

    /// Reads all records from the journal, in append order.
    ///
    /// A torn record at the tail ends the scan; damage before the tail
    /// is reported as corruption.
    pub fn read_all(&mut self) -> Result<Vec<(u64, JournalRecord)>> {
        let size = self.backend.len()?;
        let mut records = Vec::new();
        let mut offset = 0u64;

        while offset < size {
            if offset + (HEADER_SIZE as u64) > size {
                warn!(offset, "torn journal header, ignoring tail");
                break;
            }
            let header = self.backend.read_at(offset, HEADER_SIZE)?;
            if header[0..4] != JOURNAL_MAGIC {
                return Err(Error::journal_corruption(format!(
                    "bad record magic at offset {offset}"
                )));
            }
            let version = u16::from_le_bytes(header[4..6].try_into().expect("header size"));
            if version != JOURNAL_VERSION {
                return Err(Error::journal_corruption(format!(
                    "unsupported journal version {version}"
                )));
            }
            let record_type = JournalRecordType::from_byte(header[6]).ok_or_else(|| {
                Error::journal_corruption(format!("unknown record type {}", header[6]))
            })?;
            let payload_len =
                u32::from_le_bytes(header[7..11].try_into().expect("header size")) as usize;

            let total = HEADER_SIZE + payload_len + CRC_SIZE;
            if offset + (total as u64) > size {
                warn!(offset, "torn journal record, ignoring tail");
                break;
            }
            let frame = self.backend.read_at(offset, total)?;
            let stored_crc = u32::from_le_bytes(
                frame[total - CRC_SIZE..].try_into().expect("frame size"),
            );
            let computed = compute_crc32(&frame[..total - CRC_SIZE]);
            if stored_crc != computed {
                return Err(Error::journal_corruption(format!(
                    "checksum mismatch at offset {offset}: stored {stored_crc:08x}, computed {computed:08x}"
                )));
            }

            let payload = &frame[HEADER_SIZE..HEADER_SIZE + payload_len];
            let record = JournalRecord::decode_payload(record_type, payload)?;
            records.push((offset, record));
            offset += total as u64;
        }

        debug!(records = records.len(), "journal read");
        Ok(records)
    }

    /// Returns the journal size in bytes.
    pub fn size(&mut self) -> Result<u64> {
        Ok(self.backend.len()?)
    }

    /// Returns true if the journal holds no records.
    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.backend.is_empty()?)
    }

    /// Forces all appended records to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.backend.sync()?;
        Ok(())
    }

    /// Drops all records.
    pub fn clear(&mut self) -> Result<()> {
        self.backend.truncate(0)?;
        Ok(())
    }
}

fn encode_frame(record: &JournalRecord) -> Vec<u8> {
    let payload = record.encode_payload();
    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&JOURNAL_MAGIC);
    data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    data.push(record.record_type().as_byte());
    data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    data.extend_from_slice(&payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    data
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_append", &self.sync_on_append)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graftdb_storage::MemoryBackend;

    fn create_journal() -> Journal {
        Journal::new(Box::new(MemoryBackend::new()), false)
    }

    fn begin(txn: u64, lsn: u64) -> JournalRecord {
        JournalRecord::TxnBegin {
            txn: TransactionId::new(txn),
            lsn: Lsn::new(lsn),
        }
    }

    #[test]
    fn append_and_read_back() {
        let mut journal = create_journal();
        journal.append(&begin(1, 1)).unwrap();
        journal
            .append_insert(1, TransactionId::new(1), b"key", b"value", 0, Lsn::new(2))
            .unwrap();
        journal
            .append_txn_commit(TransactionId::new(1), Lsn::new(3))
            .unwrap();

        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].1, begin(1, 1));
        assert!(matches!(records[1].1, JournalRecord::Insert { .. }));
        assert!(matches!(records[2].1, JournalRecord::TxnCommit { .. }));
    }

    #[test]
    fn read_empty_journal() {
        let mut journal = create_journal();
        assert!(journal.read_all().unwrap().is_empty());
        assert!(journal.is_empty().unwrap());
    }

    #[test]
    fn torn_tail_is_ignored() {
        let mut data = encode_frame(&begin(1, 1));
        let second = encode_frame(&begin(2, 2));
        // crash mid-append: only half of the second frame made it
        data.extend_from_slice(&second[..second.len() / 2]);

        let mut journal = Journal::new(Box::new(MemoryBackend::with_data(data)), false);
        let records = journal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, begin(1, 1));
    }

    #[test]
    fn flipped_bit_is_reported() {
        let mut data = encode_frame(&begin(1, 1));
        let last = data.len() - CRC_SIZE - 1;
        data[last] ^= 0x40;

        let mut journal = Journal::new(Box::new(MemoryBackend::with_data(data)), false);
        assert!(matches!(
            journal.read_all(),
            Err(Error::JournalCorruption { .. })
        ));
    }

    #[test]
    fn corrupted_magic_is_reported() {
        let mut data = Vec::new();
        data.extend_from_slice(b"XXXX");
        data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        data.push(JournalRecordType::TxnBegin.as_byte());
        data.extend_from_slice(&16u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 20]);

        let mut journal = Journal::new(Box::new(MemoryBackend::with_data(data)), false);
        assert!(matches!(
            journal.read_all(),
            Err(Error::JournalCorruption { .. })
        ));
    }

    #[test]
    fn clear_drops_records() {
        let mut journal = create_journal();
        journal.append(&begin(1, 1)).unwrap();
        assert!(!journal.is_empty().unwrap());
        journal.clear().unwrap();
        assert!(journal.is_empty().unwrap());
        assert!(journal.read_all().unwrap().is_empty());
    }
}
