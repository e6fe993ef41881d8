//! Journal record types and serialization.

use crate::error::{Error, Result};
use crate::types::{Lsn, TransactionId};

/// Magic bytes identifying a journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"GJNL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// Type of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JournalRecordType {
    /// A transaction began.
    TxnBegin = 1,
    /// A transaction committed.
    TxnCommit = 2,
    /// A transaction aborted.
    TxnAbort = 3,
    /// A transactional insert.
    Insert = 4,
    /// A transactional erase.
    Erase = 5,
    /// A batch of non-transactional mutations.
    Changeset = 6,
}

impl JournalRecordType {
    /// Converts a byte to a record type.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::TxnBegin),
            2 => Some(Self::TxnCommit),
            3 => Some(Self::TxnAbort),
            4 => Some(Self::Insert),
            5 => Some(Self::Erase),
            6 => Some(Self::Changeset),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A single mutation inside a [`JournalRecord::Changeset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesetEntry {
    /// A direct B-tree insert.
    Insert {
        /// The key.
        key: Vec<u8>,
        /// The record.
        record: Vec<u8>,
        /// Encoded [`crate::types::InsertFlags`].
        flags: u32,
    },
    /// A direct B-tree erase.
    Erase {
        /// The key.
        key: Vec<u8>,
        /// The 1-based duplicate index, 0 for the whole key.
        dupe: u32,
        /// Encoded [`crate::types::EraseFlags`].
        flags: u32,
    },
}

/// A journal record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// A transaction began.
    TxnBegin {
        /// Transaction id.
        txn: TransactionId,
        /// LSN of the event.
        lsn: Lsn,
    },

    /// A transaction committed.
    TxnCommit {
        /// Transaction id.
        txn: TransactionId,
        /// LSN of the event.
        lsn: Lsn,
    },

    /// A transaction aborted.
    TxnAbort {
        /// Transaction id.
        txn: TransactionId,
        /// LSN of the event.
        lsn: Lsn,
    },

    /// A transactional insert operation.
    Insert {
        /// Database name.
        db: u16,
        /// Owning transaction.
        txn: TransactionId,
        /// The key.
        key: Vec<u8>,
        /// The record.
        record: Vec<u8>,
        /// Encoded caller flags.
        flags: u32,
        /// LSN of the operation.
        lsn: Lsn,
    },

    /// A transactional erase operation.
    Erase {
        /// Database name.
        db: u16,
        /// Owning transaction.
        txn: TransactionId,
        /// The key.
        key: Vec<u8>,
        /// The 1-based duplicate index, 0 for the whole key.
        dupe: u32,
        /// Encoded caller flags.
        flags: u32,
        /// LSN of the operation.
        lsn: Lsn,
    },

    /// The mutations of one non-transactional operation.
    Changeset {
        /// Database name.
        db: u16,
        /// LSN of the batch.
        lsn: Lsn,
        /// The mutations, in application order.
        entries: Vec<ChangesetEntry>,
    },
}

impl JournalRecord {
    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> JournalRecordType {
        match self {
            Self::TxnBegin { .. } => JournalRecordType::TxnBegin,
            Self::TxnCommit { .. } => JournalRecordType::TxnCommit,
            Self::TxnAbort { .. } => JournalRecordType::TxnAbort,
            Self::Insert { .. } => JournalRecordType::Insert,
            Self::Erase { .. } => JournalRecordType::Erase,
            Self::Changeset { .. } => JournalRecordType::Changeset,
        }
    }

    /// Returns the record's LSN.
    #[must_use]
    pub fn lsn(&self) -> Lsn {
        match self {
            Self::TxnBegin { lsn, .. }
            | Self::TxnCommit { lsn, .. }
            | Self::TxnAbort { lsn, .. }
            | Self::Insert { lsn, .. }
            | Self::Erase { lsn, .. }
            | Self::Changeset { lsn, .. } => *lsn,
        }
    }

    /// Returns the transaction id if the record belongs to one.
    #[must_use]
    pub fn txn(&self) -> Option<TransactionId> {
        match self {
            Self::TxnBegin { txn, .. }
            | Self::TxnCommit { txn, .. }
            | Self::TxnAbort { txn, .. }
            | Self::Insert { txn, .. }
            | Self::Erase { txn, .. } => Some(*txn),
            Self::Changeset { .. } => None,
        }
    }

    /// Serializes the record payload (without envelope).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::TxnBegin { txn, lsn }
            | Self::TxnCommit { txn, lsn }
            | Self::TxnAbort { txn, lsn } => {
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                buf.extend_from_slice(&lsn.as_u64().to_le_bytes());
            }

            Self::Insert {
                db,
                txn,
                key,
                record,
                flags,
                lsn,
            } => {
                buf.extend_from_slice(&db.to_le_bytes());
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                buf.extend_from_slice(&lsn.as_u64().to_le_bytes());
                buf.extend_from_slice(&flags.to_le_bytes());
                write_bytes(&mut buf, key);
                write_bytes(&mut buf, record);
            }

            Self::Erase {
                db,
                txn,
                key,
                dupe,
                flags,
                lsn,
            } => {
                buf.extend_from_slice(&db.to_le_bytes());
                buf.extend_from_slice(&txn.as_u64().to_le_bytes());
                buf.extend_from_slice(&lsn.as_u64().to_le_bytes());
                buf.extend_from_slice(&flags.to_le_bytes());
                buf.extend_from_slice(&dupe.to_le_bytes());
                write_bytes(&mut buf, key);
            }

            Self::Changeset { db, lsn, entries } => {
                buf.extend_from_slice(&db.to_le_bytes());
                buf.extend_from_slice(&lsn.as_u64().to_le_bytes());
                buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for entry in entries {
                    match entry {
                        ChangesetEntry::Insert { key, record, flags } => {
                            buf.push(1);
                            buf.extend_from_slice(&flags.to_le_bytes());
                            write_bytes(&mut buf, key);
                            write_bytes(&mut buf, record);
                        }
                        ChangesetEntry::Erase { key, dupe, flags } => {
                            buf.push(2);
                            buf.extend_from_slice(&flags.to_le_bytes());
                            buf.extend_from_slice(&dupe.to_le_bytes());
                            write_bytes(&mut buf, key);
                        }
                    }
                }
            }
        }
        buf
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: JournalRecordType, payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor {
            payload,
            position: 0,
        };

        let record = match record_type {
            JournalRecordType::TxnBegin => Self::TxnBegin {
                txn: TransactionId::new(cursor.read_u64()?),
                lsn: Lsn::new(cursor.read_u64()?),
            },
            JournalRecordType::TxnCommit => Self::TxnCommit {
                txn: TransactionId::new(cursor.read_u64()?),
                lsn: Lsn::new(cursor.read_u64()?),
            },
            JournalRecordType::TxnAbort => Self::TxnAbort {
                txn: TransactionId::new(cursor.read_u64()?),
                lsn: Lsn::new(cursor.read_u64()?),
            },
            JournalRecordType::Insert => {
                let db = cursor.read_u16()?;
                let txn = TransactionId::new(cursor.read_u64()?);
                let lsn = Lsn::new(cursor.read_u64()?);
                let flags = cursor.read_u32()?;
                let key = cursor.read_bytes()?;
                let record = cursor.read_bytes()?;
                Self::Insert {
                    db,
                    txn,
                    key,
                    record,
                    flags,
                    lsn,
                }
            }
            JournalRecordType::Erase => {
                let db = cursor.read_u16()?;
                let txn = TransactionId::new(cursor.read_u64()?);
                let lsn = Lsn::new(cursor.read_u64()?);
                let flags = cursor.read_u32()?;
                let dupe = cursor.read_u32()?;
                let key = cursor.read_bytes()?;
                Self::Erase {
                    db,
                    txn,
                    key,
                    dupe,
                    flags,
                    lsn,
                }
            }
            JournalRecordType::Changeset => {
                let db = cursor.read_u16()?;
                let lsn = Lsn::new(cursor.read_u64()?);
                let count = cursor.read_u32()?;
                let mut entries = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let kind = cursor.read_u8()?;
                    match kind {
                        1 => {
                            let flags = cursor.read_u32()?;
                            let key = cursor.read_bytes()?;
                            let record = cursor.read_bytes()?;
                            entries.push(ChangesetEntry::Insert { key, record, flags });
                        }
                        2 => {
                            let flags = cursor.read_u32()?;
                            let dupe = cursor.read_u32()?;
                            let key = cursor.read_bytes()?;
                            entries.push(ChangesetEntry::Erase { key, dupe, flags });
                        }
                        other => {
                            return Err(Error::journal_corruption(format!(
                                "unknown changeset entry kind {other}"
                            )))
                        }
                    }
                }
                Self::Changeset { db, lsn, entries }
            }
        };

        if cursor.position != payload.len() {
            return Err(Error::journal_corruption(format!(
                "trailing bytes in {record_type:?} record: consumed {}, got {}",
                cursor.position,
                payload.len()
            )));
        }
        Ok(record)
    }
}

fn write_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
}

struct Cursor<'a> {
    payload: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.position + len > self.payload.len() {
            return Err(Error::journal_corruption("unexpected end of payload"));
        }
        let slice = &self.payload[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().expect("length checked");
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("length checked");
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("length checked");
        Ok(u64::from_le_bytes(bytes))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Computes the CRC32 checksum (IEEE polynomial) of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}
