//! Transactional operations.

use crate::cursor::CursorId;
use crate::types::{Lsn, TransactionId};

/// Stable identity of an overlay operation.
///
/// Cursors reference their coupled operation through this id instead of
/// a pointer, so no ownership cycle exists between cursors, operations
/// and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

/// What an overlay operation does to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// No effect; skipped by every traversal.
    Nop,
    /// Insert a new key.
    Insert,
    /// Insert, replacing an existing record.
    InsertOverwrite,
    /// Insert another record under the same key.
    InsertDuplicate,
    /// Erase the key or one of its duplicates.
    Erase,
}

impl OpKind {
    /// Returns true for the insert variants.
    #[must_use]
    pub fn is_insert(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::InsertOverwrite | Self::InsertDuplicate
        )
    }
}

/// One operation in a key's overlay log.
#[derive(Debug, Clone)]
pub struct TransactionOperation {
    /// The owning transaction.
    pub txn: TransactionId,
    /// What the operation does.
    pub kind: OpKind,
    /// Set once the operation has been applied to the B-tree; flushed
    /// operations are invisible to overlay traversals but keep their
    /// slot so attached cursors can still resolve them.
    pub flushed: bool,
    /// The original caller flags, encoded for the journal.
    pub orig_flags: u32,
    /// The operation's log sequence number.
    pub lsn: Lsn,
    /// 1-based duplicate index the operation refers to; 0 addresses
    /// the whole key.
    pub referenced_dupe: u32,
    /// The record, for insert variants.
    pub record: Option<Vec<u8>>,
    /// The owning node's key.
    pub key: Vec<u8>,
    /// Cursors currently coupled to this operation.
    pub cursors: Vec<CursorId>,
}

impl TransactionOperation {
    /// Attaches a cursor to the operation.
    pub fn attach_cursor(&mut self, cursor: CursorId) {
        if !self.cursors.contains(&cursor) {
            self.cursors.push(cursor);
        }
    }

    /// Detaches a cursor from the operation.
    pub fn detach_cursor(&mut self, cursor: CursorId) {
        self.cursors.retain(|c| *c != cursor);
    }
}
