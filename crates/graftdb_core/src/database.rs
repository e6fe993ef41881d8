//! The database facade.
//!
//! `Database` arbitrates between the transactional overlay, the B-tree
//! index, the cursors, the journal and the transaction manager. Writes
//! land in per-key overlay operation logs and are journaled; committed
//! operations are flushed into the B-tree. Reads merge the overlay with
//! the B-tree under the visibility rules of the operation logs.

use crate::btree::{BtreeIndex, BtreePos, ScanVisitor};
use crate::changeset::Changeset;
use crate::config::Config;
use crate::cursor::{Coupling, Cursor, CursorArena, CursorId, CursorSlot, DupeLine, LastOp};
use crate::error::{Error, Result};
use crate::journal::{ChangesetEntry, Journal, JournalRecord};
use crate::txn::{OpId, OpKind, Transaction, TransactionIndex, TransactionOperation, TxnManager, TxnStatus};
use crate::types::{
    CursorMove, DuplicatePosition, EraseFlags, FindFlags, InsertFlags, Lsn, Match, RecordNumber,
    TransactionId,
};
use graftdb_storage::{FileBackend, MemoryBackend, StorageBackend};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, warn};

/// Key size assumed for leaf capacity estimates when keys are
/// variable-length.
const VARIABLE_KEY_ESTIMATE: usize = 32;

/// A database parameter readable through [`Database::get_parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    /// The configured key size (0 = variable).
    KeySize,
    /// The configured key type discriminant.
    KeyType,
    /// The configured record size (0 = variable).
    RecordSize,
    /// The run-time flags word.
    Flags,
    /// The database name.
    DatabaseName,
    /// The computed leaf capacity.
    MaxKeysPerPage,
    /// Record compression (always 0).
    RecordCompression,
    /// Key compression (always 0).
    KeyCompression,
}

/// A key being resolved by the overlay/B-tree merge.
#[derive(Debug, Clone)]
struct SearchKey {
    data: Vec<u8>,
    approximate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    Skip,
    Visible,
    Conflict,
}

/// An embedded key-value database handle.
///
/// All public entry points serialize on one internal lock; the engine
/// itself runs with exclusive access to its state.
pub struct Database {
    inner: Mutex<DatabaseInner>,
}

struct DatabaseInner {
    config: Config,
    btree: BtreeIndex,
    txn_index: TransactionIndex,
    txn_manager: TxnManager,
    journal: Option<Journal>,
    changeset: Changeset,
    cursors: CursorArena,
    recno: u64,
    open: bool,
}

impl Database {
    /// Creates a fresh in-memory database.
    ///
    /// With recovery enabled the journal lives in memory too; it backs
    /// the changeset/journal machinery but does not survive the
    /// process.
    pub fn create_in_memory(config: Config) -> Result<Self> {
        let backend: Option<Box<dyn StorageBackend>> = if config.enable_recovery {
            Some(Box::new(MemoryBackend::new()))
        } else {
            None
        };
        Self::build(config, backend, false)
    }

    /// Creates a fresh database whose journal lives at `path`.
    ///
    /// An existing journal at `path` is discarded. Without
    /// `enable_recovery` the path is not touched and the database is
    /// purely in-memory.
    pub fn create(path: &Path, config: Config) -> Result<Self> {
        let backend: Option<Box<dyn StorageBackend>> = if config.enable_recovery {
            let mut file = FileBackend::open_with_create_dirs(path)?;
            let len = file.len()?;
            file.truncate(0).map_err(|e| {
                warn!(?len, "failed to reset journal file");
                e
            })?;
            Some(Box::new(file))
        } else {
            None
        };
        Self::build(config, backend, false)
    }

    /// Opens a database from the journal at `path`, replaying committed
    /// transactions and changesets.
    pub fn open(path: &Path, config: Config) -> Result<Self> {
        let backend: Option<Box<dyn StorageBackend>> = if config.enable_recovery {
            Some(Box::new(FileBackend::open_with_create_dirs(path)?))
        } else {
            None
        };
        Self::build(config, backend, true)
    }

    /// Creates a fresh database over a caller-supplied journal backend.
    pub fn create_with_backend(
        backend: Box<dyn StorageBackend>,
        config: Config,
    ) -> Result<Self> {
        Self::build(config, Some(backend), false)
    }

    /// Opens a database from a caller-supplied journal backend,
    /// replaying its records.
    pub fn open_with_backend(backend: Box<dyn StorageBackend>, config: Config) -> Result<Self> {
        Self::build(config, Some(backend), true)
    }

    fn build(
        mut config: Config,
        journal_backend: Option<Box<dyn StorageBackend>>,
        replay: bool,
    ) -> Result<Self> {
        apply_sizing_policy(&mut config)?;
        let mut journal = journal_backend.map(|b| Journal::new(b, config.enable_fsync));
        let mut btree = BtreeIndex::new(leaf_capacity(&config));
        let mut next_txn = 1u64;
        let mut next_lsn = 1u64;

        if replay {
            if let Some(journal) = journal.as_mut() {
                let records = journal.read_all()?;
                let (t, l) = replay_records(&records, &mut btree)?;
                next_txn = t;
                next_lsn = l;
                debug!(records = records.len(), "journal replayed");
            }
        }

        let recno = seed_recno(&config, &btree);

        Ok(Self {
            inner: Mutex::new(DatabaseInner {
                config,
                btree,
                txn_index: TransactionIndex::new(),
                txn_manager: TxnManager::with_counters(next_txn, next_lsn),
                journal,
                changeset: Changeset::new(),
                cursors: CursorArena::new(),
                recno,
                open: true,
            }),
        })
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> Result<Transaction> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        if !inner.config.enable_transactions {
            return Err(Error::inv_parameter("transactions are not enabled"));
        }
        let id = inner.begin_txn(false)?;
        Ok(Transaction { id })
    }

    /// Commits a transaction.
    ///
    /// The committed operations stay in the overlay until
    /// [`Database::flush_committed_txns`] (or close) applies them to
    /// the B-tree.
    pub fn commit(&self, txn: Transaction) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.commit_txn(txn.id)
    }

    /// Aborts a transaction; its operations become invisible at once.
    pub fn abort(&self, txn: Transaction) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.abort_txn(txn.id)
    }

    /// Applies all committed transactions to the B-tree, in commit
    /// order, and garbage-collects flushed and aborted operations.
    pub fn flush_committed_txns(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.flush_committed_txns()
    }

    /// Inserts `record` under `key`.
    ///
    /// Returns the key actually used, which differs from the input for
    /// record-number databases.
    pub fn insert(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.insert_impl(None, txn.map(|t| t.id), key, record, flags)
    }

    /// Looks up `key` under the given match flags.
    pub fn find(&self, txn: Option<&Transaction>, key: &[u8], flags: FindFlags) -> Result<Match> {
        let mut inner = self.inner.lock();
        inner.find(txn.map(|t| t.id), key, flags)
    }

    /// Erases `key` (or, with flags, all its duplicates).
    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8], flags: EraseFlags) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.erase_impl(None, txn.map(|t| t.id), Some(key), flags)
    }

    /// Returns the number of keys (`distinct`) or records visible to
    /// `txn`, merging the B-tree with the overlay.
    pub fn count(&self, txn: Option<&Transaction>, distinct: bool) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.count(txn.map(|t| t.id), distinct)
    }

    /// Visits every visible key in order.
    pub fn scan(
        &self,
        txn: Option<&Transaction>,
        visitor: &mut dyn ScanVisitor,
        distinct: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.scan(txn.map(|t| t.id), visitor, distinct)
    }

    /// Reads a database parameter.
    pub fn get_parameter(&self, parameter: Parameter) -> Result<u64> {
        let inner = self.inner.lock();
        if !inner.open {
            return Err(Error::DatabaseClosed);
        }
        Ok(match parameter {
            Parameter::KeySize => inner.config.key_size.unwrap_or(0) as u64,
            Parameter::KeyType => inner.config.key_type.as_u64(),
            Parameter::RecordSize => inner.config.record_size.unwrap_or(0) as u64,
            Parameter::Flags => inner.config.flags(),
            Parameter::DatabaseName => u64::from(inner.config.name),
            Parameter::MaxKeysPerPage => inner.btree.max_keys_per_leaf() as u64,
            Parameter::RecordCompression | Parameter::KeyCompression => 0,
        })
    }

    /// Validates B-tree ordering and overlay invariants.
    pub fn check_integrity(&self) -> Result<()> {
        let inner = self.inner.lock();
        if !inner.open {
            return Err(Error::DatabaseClosed);
        }
        inner.check_integrity()
    }

    /// Closes the database.
    ///
    /// Fails with [`Error::TxnStillOpen`] while any active transaction
    /// holds an operation; otherwise flushes committed transactions and
    /// syncs the journal. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.close_impl()
    }

    /// Returns true if the database is open.
    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// Releases the B-tree contents; called when the database is
    /// removed from its environment.
    pub fn erase_me(&self) {
        self.inner.lock().btree.release();
    }

    /// Creates a cursor, optionally bound to a transaction.
    pub fn cursor_create(&self, txn: Option<&Transaction>) -> Result<Cursor> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let id = inner.cursors.alloc(CursorSlot::new(txn.map(|t| t.id)));
        Ok(Cursor { id })
    }

    /// Clones a cursor, including its coupling and duplicate cache.
    pub fn cursor_clone(&self, cursor: &Cursor) -> Result<Cursor> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        inner.cursor_clone(cursor.id).map(|id| Cursor { id })
    }

    /// Closes a cursor.
    pub fn cursor_close(&self, cursor: Cursor) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.cursor_close(cursor.id)
    }

    /// Inserts through a cursor; the cursor ends up coupled to the new
    /// record.
    pub fn cursor_insert(
        &self,
        cursor: &Cursor,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        let txn = inner.cursor_txn(cursor.id)?;
        inner.insert_impl(Some(cursor.id), txn, key, record, flags)
    }

    /// Looks up a key through a cursor, building the duplicate cache
    /// and coupling the cursor to the first duplicate.
    pub fn cursor_find(&self, cursor: &Cursor, key: &[u8], flags: FindFlags) -> Result<Match> {
        let mut inner = self.inner.lock();
        inner.cursor_find_inner(cursor.id, key, flags)
    }

    /// Erases the key (or duplicate) the cursor points at.
    pub fn cursor_erase(&self, cursor: &Cursor, flags: EraseFlags) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.cursor_erase_inner(cursor.id, flags)
    }

    /// Moves the cursor and returns the key/record it lands on.
    pub fn cursor_move(&self, cursor: &Cursor, direction: CursorMove) -> Result<Match> {
        let mut inner = self.inner.lock();
        inner.cursor_move_inner(cursor.id, direction)
    }

    /// Overwrites the record of the key the cursor points at.
    pub fn cursor_overwrite(&self, cursor: &Cursor, record: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.cursor_overwrite_inner(cursor.id, record)
    }

    /// Returns the number of duplicates of the cursor's current key.
    pub fn cursor_get_record_count(&self, cursor: &Cursor) -> Result<u32> {
        let mut inner = self.inner.lock();
        inner.cursor_get_record_count(cursor.id)
    }

    /// Returns the size of the cursor's current record.
    pub fn cursor_get_record_size(&self, cursor: &Cursor) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.cursor_get_record_size(cursor.id)
    }

    /// Returns the 0-based duplicate position of the cursor.
    pub fn cursor_get_duplicate_position(&self, cursor: &Cursor) -> Result<u32> {
        let inner = self.inner.lock();
        let slot = inner
            .cursors
            .get(cursor.id)
            .ok_or(Error::CursorIsNil)?;
        if slot.is_nil() {
            return Err(Error::CursorIsNil);
        }
        if slot.dupecache_index > 0 {
            Ok(slot.dupecache_index - 1)
        } else {
            Ok(slot.btree_pos.as_ref().map_or(0, |p| p.dupe))
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.inner.lock().close_impl();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Database")
            .field("open", &inner.open)
            .field("name", &inner.config.name)
            .field("overlay_nodes", &inner.txn_index.len())
            .finish_non_exhaustive()
    }
}

fn apply_sizing_policy(config: &mut Config) -> Result<()> {
    match config.record_number {
        RecordNumber::Disabled => {
            if let Some(size) = config.key_type.fixed_size() {
                config.key_size = Some(size);
            }
        }
        RecordNumber::Recno32 => {
            config.key_type = crate::types::KeyType::UInt32;
            config.key_size = Some(4);
        }
        RecordNumber::Recno64 => {
            config.key_type = crate::types::KeyType::UInt64;
            config.key_size = Some(8);
        }
    }

    if let Some(key_size) = config.key_size {
        if config.page_size / (key_size + 8) < crate::config::MIN_KEYS_PER_PAGE {
            warn!(
                key_size,
                page_size = config.page_size,
                "key size too large; increase page_size or decrease key size"
            );
            return Err(Error::InvKeySize {
                expected: config.page_size / crate::config::MIN_KEYS_PER_PAGE - 8,
                actual: key_size,
            });
        }
    }

    // small fixed-size records are stored inline in the leaves
    if let Some(record_size) = config.record_size {
        let key_size = config.key_size.unwrap_or(VARIABLE_KEY_ESTIMATE);
        if record_size <= 8
            || (record_size <= crate::config::INLINE_RECORD_THRESHOLD
                && config.page_size / (key_size + record_size)
                    > crate::config::MIN_INLINE_PAIRS_PER_PAGE)
        {
            config.force_records_inline = true;
        }
    }

    Ok(())
}

fn leaf_capacity(config: &Config) -> usize {
    let key_size = config.key_size.unwrap_or(VARIABLE_KEY_ESTIMATE);
    let record_size = if config.force_records_inline {
        config.record_size.unwrap_or(8)
    } else {
        8
    };
    (config.page_size / (key_size + record_size)).max(2)
}

fn replay_records(
    records: &[(u64, JournalRecord)],
    btree: &mut BtreeIndex,
) -> Result<(u64, u64)> {
    use std::collections::HashSet;

    let mut committed: HashSet<TransactionId> = HashSet::new();
    let mut max_txn = 0u64;
    let mut max_lsn = 0u64;
    for (_, record) in records {
        if let Some(txn) = record.txn() {
            max_txn = max_txn.max(txn.as_u64());
        }
        max_lsn = max_lsn.max(record.lsn().as_u64());
        if let JournalRecord::TxnCommit { txn, .. } = record {
            committed.insert(*txn);
        }
    }

    for (_, record) in records {
        match record {
            JournalRecord::Insert {
                txn, key, record, flags, ..
            } if committed.contains(txn) => {
                btree.insert(key, record, InsertFlags::from_bits(*flags), 0)?;
            }
            JournalRecord::Erase {
                txn, key, dupe, flags, ..
            } if committed.contains(txn) => {
                match btree.erase(key, *dupe, EraseFlags::from_bits(*flags)) {
                    Err(Error::KeyNotFound) | Ok(()) => {}
                    Err(e) => return Err(e),
                }
            }
            JournalRecord::Changeset { entries, .. } => {
                for entry in entries {
                    match entry {
                        ChangesetEntry::Insert { key, record, flags } => {
                            btree.insert(key, record, InsertFlags::from_bits(*flags), 0)?;
                        }
                        ChangesetEntry::Erase { key, dupe, flags } => {
                            match btree.erase(key, *dupe, EraseFlags::from_bits(*flags)) {
                                Err(Error::KeyNotFound) | Ok(()) => {}
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok((max_txn + 1, max_lsn + 1))
}

fn seed_recno(config: &Config, btree: &BtreeIndex) -> u64 {
    match config.record_number {
        RecordNumber::Disabled => 0,
        RecordNumber::Recno32 => btree
            .last_key()
            .and_then(|k| k.try_into().ok())
            .map_or(0, |b: [u8; 4]| u64::from(u32::from_be_bytes(b))),
        RecordNumber::Recno64 => btree
            .last_key()
            .and_then(|k| k.try_into().ok())
            .map_or(0, u64::from_be_bytes),
    }
}

fn encode_recno(mode: RecordNumber, recno: u64) -> Vec<u8> {
    match mode {
        RecordNumber::Recno32 => (recno as u32).to_be_bytes().to_vec(),
        _ => recno.to_be_bytes().to_vec(),
    }
}

impl DatabaseInner {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::DatabaseClosed)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.config.read_only {
            Err(Error::inv_parameter("database is read-only"))
        } else {
            Ok(())
        }
    }

    fn journaling(&self) -> bool {
        self.journal.is_some() && self.config.enable_recovery && self.config.enable_transactions
    }

    // ------------------------------------------------------------------
    // transaction lifecycle
    // ------------------------------------------------------------------

    fn begin_txn(&mut self, temporary: bool) -> Result<TransactionId> {
        let id = self.txn_manager.begin(temporary);
        if self.journaling() {
            let lsn = self.txn_manager.next_lsn();
            self.journal
                .as_mut()
                .expect("journaling checked")
                .append_txn_begin(id, lsn)?;
        }
        debug!(%id, temporary, "transaction begun");
        Ok(id)
    }

    fn commit_txn(&mut self, id: TransactionId) -> Result<()> {
        self.txn_manager.commit(id)?;
        if self.journaling() {
            let lsn = self.txn_manager.next_lsn();
            self.journal
                .as_mut()
                .expect("journaling checked")
                .append_txn_commit(id, lsn)?;
        }
        debug!(%id, "transaction committed");
        Ok(())
    }

    fn abort_txn(&mut self, id: TransactionId) -> Result<()> {
        self.txn_manager.abort(id)?;
        if self.journaling() {
            let lsn = self.txn_manager.next_lsn();
            self.journal
                .as_mut()
                .expect("journaling checked")
                .append_txn_abort(id, lsn)?;
        }
        // cursors coupled to the aborted operations lose their overlay side
        for op_id in self.txn_manager.ops_of(id) {
            let attached = self
                .txn_index
                .op(op_id)
                .map(|o| o.cursors.clone())
                .unwrap_or_default();
            for cid in attached {
                self.nil_cursor_txn_side(cid);
            }
        }
        debug!(%id, "transaction aborted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // visibility and conflicts
    // ------------------------------------------------------------------

    fn visibility(&self, txn: Option<TransactionId>, op: &TransactionOperation) -> Visibility {
        match self.txn_manager.status(op.txn) {
            // retired states belong to fully flushed transactions
            None => Visibility::Skip,
            Some(TxnStatus::Aborted) => Visibility::Skip,
            Some(TxnStatus::Active) if txn != Some(op.txn) => Visibility::Conflict,
            Some(_) => {
                if op.flushed || op.kind == OpKind::Nop {
                    Visibility::Skip
                } else {
                    Visibility::Visible
                }
            }
        }
    }

    /// Walks a node's operations newest → oldest and decides whether an
    /// insert may proceed.
    fn check_insert_conflicts(
        &self,
        txn: TransactionId,
        key: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        if let Some(node) = self.txn_index.node(key) {
            for op_id in node.ops_newest_first() {
                let op = self.txn_index.op(op_id).expect("op listed in node");
                match self.visibility(Some(txn), op) {
                    Visibility::Skip => continue,
                    Visibility::Conflict => return Err(Error::TxnConflict),
                    Visibility::Visible => match op.kind {
                        // an erased key can be inserted again
                        OpKind::Erase => return Ok(()),
                        k if k.is_insert() => {
                            return if flags.overwrite || flags.duplicate {
                                Ok(())
                            } else {
                                Err(Error::DuplicateKey)
                            };
                        }
                        _ => continue,
                    },
                }
            }
        }

        // the overlay is silent; the flushed state (the B-tree) decides,
        // unless uniqueness does not matter
        if flags.overwrite
            || flags.duplicate
            || self.config.record_number != RecordNumber::Disabled
        {
            return Ok(());
        }
        match self.btree.find(key, FindFlags::exact()) {
            Err(Error::KeyNotFound) => Ok(()),
            Ok(_) => Err(Error::DuplicateKey),
            Err(e) => Err(e),
        }
    }

    /// Walks a node's operations newest → oldest and decides whether an
    /// erase may proceed.
    fn check_erase_conflicts(&self, txn: TransactionId, key: &[u8]) -> Result<()> {
        if let Some(node) = self.txn_index.node(key) {
            for op_id in node.ops_newest_first() {
                let op = self.txn_index.op(op_id).expect("op listed in node");
                match self.visibility(Some(txn), op) {
                    Visibility::Skip => continue,
                    Visibility::Conflict => return Err(Error::TxnConflict),
                    Visibility::Visible => match op.kind {
                        OpKind::Erase => return Err(Error::KeyNotFound),
                        k if k.is_insert() => return Ok(()),
                        _ => continue,
                    },
                }
            }
        }
        self.btree.find(key, FindFlags::exact()).map(|_| ())
    }

    // ------------------------------------------------------------------
    // overlay writes
    // ------------------------------------------------------------------

    fn insert_txn(
        &mut self,
        txn: TransactionId,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        cursor: Option<CursorId>,
    ) -> Result<()> {
        let node_created = self.txn_index.ensure_node(key);

        if let Err(e) = self.check_insert_conflicts(txn, key, flags) {
            if node_created {
                self.txn_index.remove_node_if_empty(key);
            }
            return Err(e);
        }

        let kind = if flags.duplicate {
            OpKind::InsertDuplicate
        } else if flags.overwrite {
            OpKind::InsertOverwrite
        } else {
            OpKind::Insert
        };
        let lsn = self.txn_manager.next_lsn();
        let op_id = self.txn_index.append_op(TransactionOperation {
            txn,
            kind,
            flushed: false,
            orig_flags: flags.to_bits(),
            lsn,
            referenced_dupe: 0,
            record: Some(record.to_vec()),
            key: key.to_vec(),
            cursors: Vec::new(),
        });
        self.txn_manager.record_op(txn, op_id);

        // couple the initiating cursor and remember which duplicate it
        // anchored the operation at
        let anchor = if let Some(c) = cursor {
            let dupe = self.cursors.get(c).map_or(0, |s| s.dupecache_index);
            if dupe > 0 {
                self.txn_index
                    .op_mut(op_id)
                    .expect("op just appended")
                    .referenced_dupe = dupe;
            }
            self.couple_cursor_to_op(c, op_id);
            dupe
        } else {
            0
        };

        // a duplicate insert at logical position p shifts every other
        // cursor on this key whose duplicate index is greater than p
        if kind == OpKind::InsertDuplicate {
            let start = match flags.position {
                DuplicatePosition::First => Some(0),
                DuplicatePosition::Last => None,
                DuplicatePosition::Before => Some(anchor.saturating_sub(1)),
                DuplicatePosition::After => Some(anchor),
            };
            if let Some(start) = start {
                self.increment_dupe_index(key, cursor, start);
            }
        }

        if self.journaling() {
            // materialize overwrite for replay unless this is a duplicate
            let journal_flags = if flags.duplicate {
                flags
            } else {
                InsertFlags {
                    overwrite: true,
                    ..flags
                }
            };
            let db = self.config.name;
            self.journal
                .as_mut()
                .expect("journaling checked")
                .append_insert(db, txn, key, record, journal_flags.to_bits(), lsn)?;
        }

        debug!(key_len = key.len(), ?kind, %lsn, "overlay insert");
        Ok(())
    }

    fn erase_txn(
        &mut self,
        txn: TransactionId,
        key: &[u8],
        flags: EraseFlags,
        cursor: Option<CursorId>,
    ) -> Result<()> {
        let cursor_dupe = cursor
            .and_then(|c| self.cursors.get(c))
            .map_or(0, |s| s.dupecache_index);

        let node_created = self.txn_index.ensure_node(key);

        // a cursor targeting one duplicate skips the conflict check;
        // the duplicate was validated when the cursor coupled to it
        if cursor_dupe == 0 {
            if let Err(e) = self.check_erase_conflicts(txn, key) {
                if node_created {
                    self.txn_index.remove_node_if_empty(key);
                }
                return Err(e);
            }
        }

        let lsn = self.txn_manager.next_lsn();
        let op_id = self.txn_index.append_op(TransactionOperation {
            txn,
            kind: OpKind::Erase,
            flushed: false,
            orig_flags: flags.to_bits(),
            lsn,
            referenced_dupe: cursor_dupe,
            record: None,
            key: key.to_vec(),
            cursors: Vec::new(),
        });
        self.txn_manager.record_op(txn, op_id);

        // every other cursor in the node loses its overlay side, every
        // other cursor on the same B-tree key loses its B-tree side
        self.nil_all_cursors_in_node(cursor, key);
        self.nil_all_cursors_in_btree(cursor, key);

        if self.journaling() {
            let (dupe, journal_flags) = if cursor_dupe > 0 {
                (cursor_dupe, flags)
            } else {
                (0, EraseFlags::all_duplicates())
            };
            let db = self.config.name;
            self.journal
                .as_mut()
                .expect("journaling checked")
                .append_erase(db, txn, key, dupe, journal_flags.to_bits(), lsn)?;
        }

        debug!(key_len = key.len(), cursor_dupe, %lsn, "overlay erase");
        Ok(())
    }

    // ------------------------------------------------------------------
    // the overlay / B-tree merge lookup
    // ------------------------------------------------------------------

    fn find_txn(
        &mut self,
        cursor: Option<CursorId>,
        txn: TransactionId,
        key: &mut SearchKey,
        flags: FindFlags,
        depth: u8,
    ) -> Result<Vec<u8>> {
        key.approximate = false;
        let mut exact_is_erased = false;
        let mut first_loop = true;

        // locate the starting node; a direction flag may land on a
        // sibling when the exact node does not exist
        let mut node_key: Option<Vec<u8>> = if self.txn_index.node(&key.data).is_some() {
            Some(key.data.clone())
        } else if flags.gt {
            let k = self.txn_index.next_key(&key.data);
            key.approximate |= k.is_some();
            k
        } else if flags.lt {
            let k = self.txn_index.prev_key(&key.data);
            key.approximate |= k.is_some();
            k
        } else {
            None
        };

        let mut visible_insert: Option<OpId> = None;

        'retry: while let Some(nk) = node_key.clone() {
            let op_ids: Vec<OpId> = self
                .txn_index
                .node(&nk)
                .map(|n| n.ops_newest_first().collect())
                .unwrap_or_default();
            for op_id in op_ids {
                let (vis, kind, ref_dupe, op_record) = {
                    let op = self.txn_index.op(op_id).expect("op listed in node");
                    (
                        self.visibility(Some(txn), op),
                        op.kind,
                        op.referenced_dupe,
                        op.record.clone(),
                    )
                };
                match vis {
                    Visibility::Skip => continue,
                    Visibility::Conflict => return Err(Error::TxnConflict),
                    Visibility::Visible => match kind {
                        OpKind::Erase => {
                            if first_loop && !key.approximate {
                                exact_is_erased = true;
                            }
                            first_loop = false;
                            if flags.lt {
                                node_key = self.txn_index.prev_key(&nk);
                                if node_key.is_none() {
                                    break 'retry;
                                }
                                key.approximate = true;
                                continue 'retry;
                            }
                            if flags.gt {
                                node_key = self.txn_index.next_key(&nk);
                                if node_key.is_none() {
                                    break 'retry;
                                }
                                key.approximate = true;
                                continue 'retry;
                            }
                            // exact lookup of an erased key: duplicates
                            // may survive the partial erase
                            if ref_dupe == 0 {
                                return Err(Error::KeyNotFound);
                            }
                            let Some(c) = cursor else {
                                return Err(Error::KeyNotFound);
                            };
                            if ref_dupe == 1 {
                                let is_equal = self.cursor_sync_for_key(c, &key.data)?;
                                if !is_equal {
                                    if let Some(slot) = self.cursors.get_mut(c) {
                                        slot.nil_btree_side();
                                    }
                                }
                            }
                            let lines = self.build_dupe_lines(Some(txn), &key.data)?;
                            if lines.is_empty() {
                                return Err(Error::KeyNotFound);
                            }
                            let record = self.resolve_line(&key.data, lines[0])?;
                            if let Some(slot) = self.cursors.get_mut(c) {
                                slot.dupecache = lines;
                                slot.dupecache_index = 1;
                            }
                            self.couple_cursor_to_op(c, op_id);
                            return Ok(record);
                        }
                        k if k.is_insert() => {
                            if let Some(c) = cursor {
                                self.couple_cursor_to_op(c, op_id);
                            }
                            if key.approximate {
                                // a sibling matched; the B-tree may still
                                // hold something closer
                                visible_insert = Some(op_id);
                                break 'retry;
                            }
                            return Ok(op_record.unwrap_or_default());
                        }
                        _ => continue,
                    },
                }
            }
            break;
        }

        // an overlay sibling answered an approximate query: compare it
        // against the B-tree's candidate and pick the closer side
        if let Some(op_id) = visible_insert {
            let (txnkey, op_record) = {
                let op = self.txn_index.op(op_id).expect("visible op");
                (op.key.clone(), op.record.clone().unwrap_or_default())
            };
            key.approximate = false;
            let mut bflags = flags;
            if exact_is_erased {
                bflags.exact = false;
            }
            if let Some(c) = cursor {
                if let Some(slot) = self.cursors.get_mut(c) {
                    slot.nil_btree_side();
                }
            }
            return match self.btree.find(&key.data, bflags) {
                Err(Error::KeyNotFound) => {
                    key.data = txnkey;
                    key.approximate = true;
                    if let Some(c) = cursor {
                        self.couple_cursor_to_op(c, op_id);
                    }
                    Ok(op_record)
                }
                Err(e) => Err(e),
                Ok(bm) => {
                    if !bm.approximate && bflags.exact {
                        // the B-tree has the requested key itself
                        if let Some(c) = cursor {
                            self.couple_cursor_to_btree(
                                c,
                                BtreePos {
                                    key: bm.key.clone(),
                                    dupe: 0,
                                },
                            );
                        }
                        key.data = bm.key;
                        return Ok(bm.record);
                    }
                    let cmp = BtreeIndex::compare_keys(&bm.key, &txnkey);
                    let use_btree = (flags.gt && cmp == Ordering::Less)
                        || (flags.lt && cmp == Ordering::Greater);
                    if use_btree {
                        // the B-tree candidate is closer, but it must not
                        // be shadowed by a live erase; re-enter once with
                        // an exact match
                        if depth == 0 {
                            key.data = bm.key;
                            let record = self.find_txn(
                                cursor,
                                txn,
                                key,
                                FindFlags {
                                    exact: true,
                                    ..flags
                                },
                                depth + 1,
                            )?;
                            key.approximate = true;
                            Ok(record)
                        } else {
                            // recursion is bounded at one level; decide by
                            // direct visibility instead of re-entering
                            let lines = self.build_dupe_lines(Some(txn), &bm.key)?;
                            if lines.is_empty() {
                                key.data = txnkey;
                                key.approximate = true;
                                if let Some(c) = cursor {
                                    self.couple_cursor_to_op(c, op_id);
                                }
                                Ok(op_record)
                            } else {
                                if let Some(c) = cursor {
                                    self.couple_cursor_to_btree(
                                        c,
                                        BtreePos {
                                            key: bm.key.clone(),
                                            dupe: 0,
                                        },
                                    );
                                }
                                key.data = bm.key;
                                key.approximate = true;
                                Ok(bm.record)
                            }
                        }
                    } else {
                        key.data = txnkey;
                        key.approximate = true;
                        if let Some(c) = cursor {
                            self.couple_cursor_to_op(c, op_id);
                        }
                        Ok(op_record)
                    }
                }
            };
        }

        // no visible overlay operation: the B-tree answers the query
        let bm = self.btree.find(&key.data, flags)?;
        if let Some(c) = cursor {
            self.couple_cursor_to_btree(
                c,
                BtreePos {
                    key: bm.key.clone(),
                    dupe: 0,
                },
            );
        }
        key.data = bm.key;
        key.approximate = bm.approximate;
        Ok(bm.record)
    }

    // ------------------------------------------------------------------
    // duplicate cache
    // ------------------------------------------------------------------

    /// Merges the B-tree duplicates of `key` with the visible overlay
    /// operations into the flattened duplicate view.
    fn build_dupe_lines(
        &self,
        txn: Option<TransactionId>,
        key: &[u8],
    ) -> Result<Vec<DupeLine>> {
        let mut lines: Vec<DupeLine> = (0..self.btree.dupe_count(key))
            .map(|dupe| DupeLine::Btree { dupe })
            .collect();

        if let Some(node) = self.txn_index.node(key) {
            for op_id in node.ops_oldest_first() {
                let op = self.txn_index.op(op_id).expect("op listed in node");
                match self.visibility(txn, op) {
                    Visibility::Skip => continue,
                    Visibility::Conflict => return Err(Error::TxnConflict),
                    Visibility::Visible => {}
                }
                match op.kind {
                    OpKind::Insert => {
                        if lines.is_empty() {
                            lines.push(DupeLine::Txn { op: op_id });
                        } else {
                            lines[0] = DupeLine::Txn { op: op_id };
                        }
                    }
                    OpKind::InsertOverwrite => {
                        let at = op.referenced_dupe.saturating_sub(1) as usize;
                        if at < lines.len() {
                            lines[at] = DupeLine::Txn { op: op_id };
                        } else {
                            lines.push(DupeLine::Txn { op: op_id });
                        }
                    }
                    OpKind::InsertDuplicate => {
                        let flags = InsertFlags::from_bits(op.orig_flags);
                        let at = match flags.position {
                            DuplicatePosition::First => 0,
                            DuplicatePosition::Last => lines.len(),
                            DuplicatePosition::Before => {
                                op.referenced_dupe.saturating_sub(1) as usize
                            }
                            DuplicatePosition::After => op.referenced_dupe as usize,
                        };
                        let at = at.min(lines.len());
                        lines.insert(at, DupeLine::Txn { op: op_id });
                    }
                    OpKind::Erase => {
                        if op.referenced_dupe == 0 {
                            lines.clear();
                        } else {
                            let at = op.referenced_dupe as usize - 1;
                            if at < lines.len() {
                                lines.remove(at);
                            }
                        }
                    }
                    OpKind::Nop => {}
                }
            }
        }

        Ok(lines)
    }

    fn resolve_line(&self, key: &[u8], line: DupeLine) -> Result<Vec<u8>> {
        match line {
            DupeLine::Btree { dupe } => {
                self.btree.record(key, dupe).ok_or(Error::KeyNotFound)
            }
            DupeLine::Txn { op } => self
                .txn_index
                .op(op)
                .and_then(|o| o.record.clone())
                .ok_or(Error::KeyNotFound),
        }
    }

    /// Couples the cursor's B-tree side to `key` when the B-tree holds
    /// an equal key; returns whether it does.
    fn cursor_sync_for_key(&mut self, cursor: CursorId, key: &[u8]) -> Result<bool> {
        let equal = self.btree.contains(key);
        if equal {
            if let Some(slot) = self.cursors.get_mut(cursor) {
                slot.btree_pos = Some(BtreePos {
                    key: key.to_vec(),
                    dupe: 0,
                });
            }
        }
        Ok(equal)
    }

    // ------------------------------------------------------------------
    // cursor coupling bookkeeping
    // ------------------------------------------------------------------

    fn couple_cursor_to_op(&mut self, cursor: CursorId, op_id: OpId) {
        self.nil_cursor_txn_side(cursor);
        if let Some(op) = self.txn_index.op_mut(op_id) {
            op.attach_cursor(cursor);
        }
        if let Some(slot) = self.cursors.get_mut(cursor) {
            slot.txn_op = Some(op_id);
            slot.coupling = Coupling::Txn;
            // a cursor is never coupled to both sides at once
            slot.btree_pos = None;
        }
    }

    fn couple_cursor_to_btree(&mut self, cursor: CursorId, pos: BtreePos) {
        self.nil_cursor_txn_side(cursor);
        if let Some(slot) = self.cursors.get_mut(cursor) {
            slot.btree_pos = Some(pos);
            slot.coupling = Coupling::Btree;
        }
    }

    fn nil_cursor_txn_side(&mut self, cursor: CursorId) {
        let op_id = self.cursors.get(cursor).and_then(|s| s.txn_op);
        if let Some(op_id) = op_id {
            if let Some(op) = self.txn_index.op_mut(op_id) {
                op.detach_cursor(cursor);
            }
        }
        if let Some(slot) = self.cursors.get_mut(cursor) {
            slot.txn_op = None;
            if slot.coupling == Coupling::Txn {
                slot.coupling = Coupling::Nil;
            }
        }
    }

    fn nil_cursor_fully(&mut self, cursor: CursorId) {
        self.nil_cursor_txn_side(cursor);
        if let Some(slot) = self.cursors.get_mut(cursor) {
            slot.btree_pos = None;
            slot.coupling = Coupling::Nil;
            slot.clear_dupecache();
        }
    }

    /// Detaches every cursor attached to any operation of the node,
    /// adjusting duplicate indexes relative to the initiating cursor.
    fn nil_all_cursors_in_node(&mut self, current: Option<CursorId>, key: &[u8]) {
        let current_dupe = current
            .and_then(|c| self.cursors.get(c))
            .map_or(0, |s| s.dupecache_index);
        let op_ids: Vec<OpId> = self
            .txn_index
            .node(key)
            .map(|n| n.ops_newest_first().collect())
            .unwrap_or_default();
        for op_id in op_ids {
            let attached: Vec<CursorId> = self
                .txn_index
                .op(op_id)
                .map(|o| o.cursors.clone())
                .unwrap_or_default();
            for cid in attached {
                if Some(cid) == current {
                    continue;
                }
                if self.cursors.get(cid).is_none() {
                    if let Some(op) = self.txn_index.op_mut(op_id) {
                        op.detach_cursor(cid);
                    }
                    continue;
                }
                let slot = self.cursors.get_mut(cid).expect("live cursor");
                if current_dupe > 0 {
                    if current_dupe < slot.dupecache_index {
                        slot.dupecache_index -= 1;
                        continue;
                    }
                    if current_dupe > slot.dupecache_index {
                        continue;
                    }
                }
                slot.txn_op = None;
                slot.coupling = if slot.btree_pos.is_some() {
                    Coupling::Btree
                } else {
                    Coupling::Nil
                };
                slot.lastop = LastOp::LookupOrInsert;
                if let Some(op) = self.txn_index.op_mut(op_id) {
                    op.detach_cursor(cid);
                }
            }
        }
    }

    /// Nils the B-tree side of every other cursor pointing at `key`.
    fn nil_all_cursors_in_btree(&mut self, current: Option<CursorId>, key: &[u8]) {
        let current_dupe = current
            .and_then(|c| self.cursors.get(c))
            .map_or(0, |s| s.dupecache_index);
        for cid in self.cursors.live_ids() {
            if Some(cid) == current {
                continue;
            }
            let Some(slot) = self.cursors.get(cid) else {
                continue;
            };
            if slot.is_nil() || slot.coupling == Coupling::Txn {
                continue;
            }
            let points_here = slot
                .btree_pos
                .as_ref()
                .is_some_and(|p| p.key.as_slice() == key);
            if !points_here {
                continue;
            }
            let slot = self.cursors.get_mut(cid).expect("live cursor");
            if current_dupe > 0 {
                if current_dupe < slot.dupecache_index {
                    slot.dupecache_index -= 1;
                    continue;
                }
                if current_dupe > slot.dupecache_index {
                    continue;
                }
            }
            slot.btree_pos = None;
            slot.txn_op = None;
            slot.coupling = Coupling::Nil;
        }
    }

    /// Shifts the duplicate index of every cursor on `key` whose index
    /// is greater than `start`.
    fn increment_dupe_index(&mut self, key: &[u8], skip: Option<CursorId>, start: u32) {
        for cid in self.cursors.live_ids() {
            if Some(cid) == skip {
                continue;
            }
            let Some(slot) = self.cursors.get(cid) else {
                continue;
            };
            if slot.is_nil() {
                continue;
            }
            let hit = match slot.coupling {
                Coupling::Txn => slot
                    .txn_op
                    .and_then(|o| self.txn_index.op(o))
                    .is_some_and(|o| o.key.as_slice() == key),
                Coupling::Btree => slot
                    .btree_pos
                    .as_ref()
                    .is_some_and(|p| p.key.as_slice() == key),
                Coupling::Nil => false,
            };
            if hit {
                let slot = self.cursors.get_mut(cid).expect("live cursor");
                if slot.dupecache_index > start {
                    slot.dupecache_index += 1;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // flush of committed transactions
    // ------------------------------------------------------------------

    fn flush_committed_txns(&mut self) -> Result<()> {
        let committed = self.txn_manager.take_committed();
        for txn in committed {
            for op_id in self.txn_manager.ops_of(txn) {
                self.flush_txn_operation(op_id)?;
            }
            debug!(%txn, "transaction flushed");
        }
        self.gc_flushed();
        Ok(())
    }

    /// Applies one committed operation to the B-tree and re-couples the
    /// attached cursors to the resulting position.
    fn flush_txn_operation(&mut self, op_id: OpId) -> Result<()> {
        let (kind, key, record, orig_flags, ref_dupe, attached) = {
            let op = self.txn_index.op(op_id).expect("flushing a live op");
            (
                op.kind,
                op.key.clone(),
                op.record.clone(),
                op.orig_flags,
                op.referenced_dupe,
                op.cursors.clone(),
            )
        };

        match kind {
            k if k.is_insert() => {
                let mut flags = InsertFlags::from_bits(orig_flags);
                if kind == OpKind::InsertDuplicate {
                    flags.duplicate = true;
                } else {
                    flags.overwrite = true;
                    flags.duplicate = false;
                }
                let pos = self.btree.insert(
                    &key,
                    record.as_deref().unwrap_or(&[]),
                    flags,
                    ref_dupe,
                )?;
                for cid in attached {
                    self.couple_cursor_to_btree(cid, pos.clone());
                }
            }
            OpKind::Erase => {
                // the overlay may have superseded the B-tree state
                match self
                    .btree
                    .erase(&key, ref_dupe, EraseFlags::from_bits(orig_flags))
                {
                    Err(Error::KeyNotFound) | Ok(()) => {}
                    Err(e) => return Err(e),
                }
            }
            OpKind::Nop => {}
            _ => {}
        }

        self.txn_index
            .op_mut(op_id)
            .expect("flushing a live op")
            .flushed = true;
        Ok(())
    }

    /// Drops flushed and aborted operations, removes empty nodes, and
    /// retires transaction states nothing references anymore.
    fn gc_flushed(&mut self) {
        for key in self.txn_index.node_keys() {
            let op_ids: Vec<OpId> = self
                .txn_index
                .node(&key)
                .map(|n| n.ops_oldest_first().collect())
                .unwrap_or_default();
            for op_id in op_ids {
                let removable = {
                    let op = self.txn_index.op(op_id).expect("op listed in node");
                    match self.txn_manager.status(op.txn) {
                        Some(TxnStatus::Active) => false,
                        Some(TxnStatus::Committed) => op.flushed,
                        Some(TxnStatus::Aborted) | None => true,
                    }
                };
                if removable {
                    if let Some(op) = self.txn_index.remove_op(op_id) {
                        for cid in op.cursors {
                            if let Some(slot) = self.cursors.get_mut(cid) {
                                slot.txn_op = None;
                                if slot.coupling == Coupling::Txn {
                                    slot.coupling = Coupling::Nil;
                                }
                            }
                        }
                    }
                }
            }
        }
        for txn in self.txn_manager.terminated() {
            let ops = self.txn_manager.ops_of(txn);
            if ops.iter().all(|o| self.txn_index.op(*o).is_none()) {
                self.txn_manager.retire(txn);
            }
        }
    }

    // ------------------------------------------------------------------
    // wrappers
    // ------------------------------------------------------------------

    fn validate_insert(&self, flags: InsertFlags, cursor: Option<CursorId>) -> Result<()> {
        if flags.duplicate && !self.config.enable_duplicate_keys {
            return Err(Error::inv_parameter(
                "duplicate insert requires duplicate keys to be enabled",
            ));
        }
        if flags.duplicate && flags.overwrite {
            return Err(Error::inv_parameter(
                "overwrite and duplicate are mutually exclusive",
            ));
        }
        if matches!(
            flags.position,
            DuplicatePosition::Before | DuplicatePosition::After
        ) && cursor.is_none()
        {
            return Err(Error::inv_parameter(
                "relative duplicate position requires a cursor",
            ));
        }
        if flags.position != DuplicatePosition::Last && !flags.duplicate {
            return Err(Error::inv_parameter(
                "duplicate position requires the duplicate flag",
            ));
        }
        Ok(())
    }

    /// Assigns or validates the key of a record-number insert.
    fn resolve_insert_key(&mut self, key: &[u8], flags: InsertFlags) -> Result<Vec<u8>> {
        let mode = self.config.record_number;
        if mode == RecordNumber::Disabled {
            if let Some(expected) = self.config.key_size {
                if key.len() != expected {
                    warn!(expected, actual = key.len(), "invalid key size");
                    return Err(Error::InvKeySize {
                        expected,
                        actual: key.len(),
                    });
                }
            }
            return Ok(key.to_vec());
        }

        let width = mode.key_size().expect("record numbers enabled");
        if flags.overwrite {
            if key.len() != width {
                warn!(
                    expected = width,
                    actual = key.len(),
                    "record-number overwrite needs an explicit key"
                );
                return Err(Error::inv_parameter(
                    "record-number overwrite requires a full-width key",
                ));
            }
            return Ok(key.to_vec());
        }
        if !key.is_empty() {
            if key.len() != width {
                return Err(Error::InvKeySize {
                    expected: width,
                    actual: key.len(),
                });
            }
            // a supplied key is ignored; record numbers are assigned
        }
        self.recno += 1;
        Ok(encode_recno(mode, self.recno))
    }

    fn insert_impl(
        &mut self,
        cursor: Option<CursorId>,
        txn: Option<TransactionId>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.ensure_writable()?;
        self.validate_insert(flags, cursor)?;
        if let Some(expected) = self.config.record_size {
            if record.len() != expected {
                warn!(expected, actual = record.len(), "invalid record size");
                return Err(Error::InvRecordSize {
                    expected,
                    actual: record.len(),
                });
            }
        }
        let key_buf = self.resolve_insert_key(key, flags)?;

        let mut temp: Option<TransactionId> = None;
        let txn_id = match txn {
            Some(id) => {
                if !self.txn_manager.is_active(id) {
                    return Err(Error::inv_parameter("transaction is not active"));
                }
                Some(id)
            }
            None if self.config.enable_transactions => {
                let id = self.begin_txn(true)?;
                temp = Some(id);
                if let Some(c) = cursor {
                    if let Some(slot) = self.cursors.get_mut(c) {
                        slot.txn = Some(id);
                    }
                }
                Some(id)
            }
            None => None,
        };

        let mut direct_pos: Option<BtreePos> = None;
        let result: Result<()> = match txn_id {
            Some(id) => self.insert_txn(id, &key_buf, record, flags, cursor),
            None => {
                let ref_dupe = cursor
                    .and_then(|c| self.cursors.get(c))
                    .and_then(|s| s.btree_pos.as_ref())
                    .map_or(0, |p| p.dupe + 1);
                match self.btree.insert(&key_buf, record, flags, ref_dupe) {
                    Ok(pos) => {
                        self.changeset.record_insert(&key_buf, record, flags);
                        direct_pos = Some(pos);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        };

        if let (Some(c), Some(_)) = (cursor, temp) {
            if let Some(slot) = self.cursors.get_mut(c) {
                slot.txn = None;
            }
        }

        if result.is_ok() {
            if let Some(c) = cursor {
                self.fixup_cursor_after_insert(c, txn_id, &key_buf, direct_pos);
            }
        }

        self.finalize(result.map(|()| key_buf), temp)
    }

    fn fixup_cursor_after_insert(
        &mut self,
        cursor: CursorId,
        txn: Option<TransactionId>,
        key: &[u8],
        direct_pos: Option<BtreePos>,
    ) {
        if self.config.enable_transactions {
            let coupled_op = self.cursors.get(cursor).and_then(|s| s.txn_op);
            if let Some(slot) = self.cursors.get_mut(cursor) {
                // the overlay op is authoritative; a stale B-tree side
                // would short-circuit the next duplicate sync
                slot.btree_pos = None;
                slot.clear_dupecache();
            }
            if self.config.enable_duplicate_keys {
                let lines = self.build_dupe_lines(txn, key).unwrap_or_default();
                let index = coupled_op.and_then(|op| {
                    lines
                        .iter()
                        .position(|l| matches!(l, DupeLine::Txn { op: o } if *o == op))
                });
                if let Some(slot) = self.cursors.get_mut(cursor) {
                    slot.dupecache = lines;
                    slot.dupecache_index = index.map_or(0, |i| i as u32 + 1);
                }
            }
        } else if let Some(pos) = direct_pos {
            self.couple_cursor_to_btree(cursor, pos);
        }
        if let Some(slot) = self.cursors.get_mut(cursor) {
            slot.lastop = LastOp::LookupOrInsert;
            slot.first_use = false;
        }
    }

    fn validate_lookup_key(&self, key: &[u8]) -> Result<()> {
        if let Some(width) = self.config.record_number.key_size() {
            if key.len() != width {
                return Err(Error::inv_parameter(
                    "record-number keys must be full-width",
                ));
            }
            return Ok(());
        }
        if let Some(expected) = self.config.key_size {
            if key.len() != expected {
                warn!(expected, actual = key.len(), "invalid key size");
                return Err(Error::InvKeySize {
                    expected,
                    actual: key.len(),
                });
            }
        }
        Ok(())
    }

    fn find(&mut self, txn: Option<TransactionId>, key: &[u8], flags: FindFlags) -> Result<Match> {
        self.ensure_open()?;
        if flags.lt && flags.gt {
            return Err(Error::inv_parameter("at most one match direction"));
        }
        // a duplicate-key database resolves finds through a cursor so
        // the duplicate cache is built
        if self.config.enable_duplicate_keys
            && (txn.is_some() || self.config.enable_transactions)
        {
            let c = self.cursors.alloc(CursorSlot::new(txn));
            let result = self.cursor_find_inner(c, key, flags);
            self.nil_cursor_fully(c);
            self.cursors.remove(c);
            return result;
        }
        self.find_impl(None, txn, key, flags)
    }

    fn find_impl(
        &mut self,
        cursor: Option<CursorId>,
        txn: Option<TransactionId>,
        key: &[u8],
        flags: FindFlags,
    ) -> Result<Match> {
        self.ensure_open()?;
        if flags.lt && flags.gt {
            return Err(Error::inv_parameter("at most one match direction"));
        }
        self.validate_lookup_key(key)?;

        let mut temp: Option<TransactionId> = None;
        let txn_id = match txn {
            Some(id) => Some(id),
            None if self.config.enable_transactions => {
                let id = self.begin_txn(true)?;
                temp = Some(id);
                if let Some(c) = cursor {
                    if let Some(slot) = self.cursors.get_mut(c) {
                        slot.txn = Some(id);
                    }
                }
                Some(id)
            }
            None => None,
        };

        let mut skey = SearchKey {
            data: key.to_vec(),
            approximate: false,
        };
        let result: Result<Vec<u8>> = match txn_id {
            Some(id) => self.find_txn(cursor, id, &mut skey, flags, 0),
            None => match self.btree.find(key, flags) {
                Ok(bm) => {
                    if let Some(c) = cursor {
                        self.couple_cursor_to_btree(
                            c,
                            BtreePos {
                                key: bm.key.clone(),
                                dupe: 0,
                            },
                        );
                    }
                    skey.data = bm.key;
                    skey.approximate = bm.approximate;
                    Ok(bm.record)
                }
                Err(e) => Err(e),
            },
        };

        if let (Some(c), Some(_)) = (cursor, temp) {
            if let Some(slot) = self.cursors.get_mut(c) {
                slot.txn = None;
            }
        }

        self.finalize(
            result.map(|record| Match {
                key: skey.data,
                record,
                approximate: skey.approximate,
            }),
            temp,
        )
    }

    fn erase_impl(
        &mut self,
        cursor: Option<CursorId>,
        txn: Option<TransactionId>,
        key: Option<&[u8]>,
        flags: EraseFlags,
    ) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        if let Some(key) = key {
            self.validate_lookup_key(key)?;
        }

        let mut temp: Option<TransactionId> = None;
        let txn_id = match txn {
            Some(id) => {
                if !self.txn_manager.is_active(id) {
                    return Err(Error::inv_parameter("transaction is not active"));
                }
                Some(id)
            }
            None if self.config.enable_transactions => {
                let id = self.begin_txn(true)?;
                temp = Some(id);
                if let Some(c) = cursor {
                    if let Some(slot) = self.cursors.get_mut(c) {
                        slot.txn = Some(id);
                    }
                }
                Some(id)
            }
            None => None,
        };

        let result: Result<()> = match txn_id {
            None => {
                let target = match (key, cursor) {
                    (Some(k), _) => Ok((k.to_vec(), 0)),
                    (None, Some(c)) => self
                        .cursors
                        .get(c)
                        .and_then(|s| s.btree_pos.clone())
                        .map(|pos| (pos.key, pos.dupe + 1))
                        .ok_or(Error::CursorIsNil),
                    (None, None) => Err(Error::inv_parameter("erase needs a key or a cursor")),
                };
                match target {
                    Ok((erase_key, dupe)) => match self.btree.erase(&erase_key, dupe, flags) {
                        Ok(()) => {
                            self.changeset.record_erase(&erase_key, dupe, flags);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                }
            }
            Some(id) => match cursor {
                Some(c) => {
                    // the erase targets whichever key the cursor points at
                    match self.cursor_current_key(c).ok_or(Error::CursorIsNil) {
                        Ok(k) => self.erase_txn(id, &k, EraseFlags::new(), Some(c)),
                        Err(e) => Err(e),
                    }
                }
                None => match key {
                    Some(k) => self.erase_txn(id, k, flags, None),
                    None => Err(Error::inv_parameter("erase needs a key or a cursor")),
                },
            },
        };

        if let (Some(c), Some(_)) = (cursor, temp) {
            if let Some(slot) = self.cursors.get_mut(c) {
                slot.txn = None;
            }
        }

        if result.is_ok() {
            if let Some(c) = cursor {
                self.nil_cursor_fully(c);
            }
        }

        self.finalize(result, temp)
    }

    /// Runs on every wrapper exit path: terminates the temporary
    /// transaction and clears or flushes the changeset.
    fn finalize<T>(&mut self, result: Result<T>, temp: Option<TransactionId>) -> Result<T> {
        match result {
            Err(e) => {
                if let Some(id) = temp {
                    self.changeset.clear();
                    if let Err(abort_err) = self.abort_txn(id) {
                        warn!(%id, ?abort_err, "failed to abort temporary transaction");
                    }
                } else {
                    if self.config.enable_recovery && !self.config.enable_transactions {
                        let lsn = self.txn_manager.next_lsn();
                        let db = self.config.name;
                        if let Some(journal) = self.journal.as_mut() {
                            if let Err(flush_err) = self.changeset.flush(journal, db, lsn) {
                                warn!(?flush_err, "failed to flush changeset");
                            }
                        }
                    }
                    self.changeset.clear();
                }
                Err(e)
            }
            Ok(value) => {
                if let Some(id) = temp {
                    self.changeset.clear();
                    self.commit_txn(id)?;
                } else if self.config.enable_recovery && !self.config.enable_transactions {
                    let lsn = self.txn_manager.next_lsn();
                    let db = self.config.name;
                    if let Some(journal) = self.journal.as_mut() {
                        self.changeset.flush(journal, db, lsn)?;
                    }
                } else {
                    self.changeset.clear();
                }
                Ok(value)
            }
        }
    }

    // ------------------------------------------------------------------
    // cursors
    // ------------------------------------------------------------------

    fn cursor_txn(&self, cursor: CursorId) -> Result<Option<TransactionId>> {
        self.cursors
            .get(cursor)
            .map(|s| s.txn)
            .ok_or(Error::CursorIsNil)
    }

    fn cursor_clone(&mut self, cursor: CursorId) -> Result<CursorId> {
        let slot = self
            .cursors
            .get(cursor)
            .cloned()
            .ok_or(Error::CursorIsNil)?;
        let coupled_op = slot.txn_op;
        let id = self.cursors.alloc(slot);
        if let Some(op_id) = coupled_op {
            if let Some(op) = self.txn_index.op_mut(op_id) {
                op.attach_cursor(id);
            }
        }
        Ok(id)
    }

    fn cursor_close(&mut self, cursor: CursorId) -> Result<()> {
        self.nil_cursor_txn_side(cursor);
        self.cursors.remove(cursor).ok_or(Error::CursorIsNil)?;
        Ok(())
    }

    fn cursor_current_key(&self, cursor: CursorId) -> Option<Vec<u8>> {
        let slot = self.cursors.get(cursor)?;
        match slot.coupling {
            Coupling::Txn => slot
                .txn_op
                .and_then(|o| self.txn_index.op(o))
                .map(|o| o.key.clone()),
            Coupling::Btree => slot.btree_pos.as_ref().map(|p| p.key.clone()),
            Coupling::Nil => None,
        }
    }

    fn cursor_find_inner(&mut self, cursor: CursorId, key: &[u8], flags: FindFlags) -> Result<Match> {
        self.ensure_open()?;
        self.cursors.get(cursor).ok_or(Error::CursorIsNil)?;
        self.nil_cursor_fully(cursor);
        let txn = self.cursor_txn(cursor)?;

        let mut m = self.find_impl(Some(cursor), txn, key, flags)?;

        if self.config.enable_transactions {
            let is_equal = self.cursor_sync_for_key(cursor, &m.key)?;
            if !is_equal {
                if let Some(slot) = self.cursors.get_mut(cursor) {
                    slot.nil_btree_side();
                }
            }
        }

        // with duplicates, couple to the first (oldest) duplicate
        if self.config.enable_duplicate_keys {
            let lines = self.build_dupe_lines(txn, &m.key)?;
            if !lines.is_empty() {
                m.record = self.resolve_line(&m.key, lines[0])?;
                match lines[0] {
                    DupeLine::Btree { dupe } => self.couple_cursor_to_btree(
                        cursor,
                        BtreePos {
                            key: m.key.clone(),
                            dupe,
                        },
                    ),
                    DupeLine::Txn { op } => self.couple_cursor_to_op(cursor, op),
                }
                if let Some(slot) = self.cursors.get_mut(cursor) {
                    slot.dupecache = lines;
                    slot.dupecache_index = 1;
                }
            }
        }

        if let Some(slot) = self.cursors.get_mut(cursor) {
            slot.lastop = LastOp::LookupOrInsert;
            slot.first_use = false;
        }
        Ok(m)
    }

    fn cursor_erase_inner(&mut self, cursor: CursorId, flags: EraseFlags) -> Result<()> {
        self.ensure_open()?;
        let slot = self.cursors.get(cursor).ok_or(Error::CursorIsNil)?;
        if slot.is_nil() {
            return Err(Error::CursorIsNil);
        }
        let txn = slot.txn;
        self.erase_impl(Some(cursor), txn, None, flags)
    }

    fn cursor_overwrite_inner(&mut self, cursor: CursorId, record: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.ensure_writable()?;
        let slot = self.cursors.get(cursor).ok_or(Error::CursorIsNil)?;
        if slot.is_nil() {
            return Err(Error::CursorIsNil);
        }
        let txn = slot.txn;
        let key = self.cursor_current_key(cursor).ok_or(Error::CursorIsNil)?;

        if !self.config.enable_transactions {
            let dupe = self
                .cursors
                .get(cursor)
                .and_then(|s| s.btree_pos.as_ref())
                .map_or(0, |p| p.dupe + 1);
            return self
                .btree
                .insert(&key, record, InsertFlags::overwrite(), dupe)
                .map(|_| ());
        }

        let mut temp: Option<TransactionId> = None;
        let txn_id = match txn {
            Some(id) => id,
            None => {
                let id = self.begin_txn(true)?;
                temp = Some(id);
                if let Some(slot) = self.cursors.get_mut(cursor) {
                    slot.txn = Some(id);
                }
                id
            }
        };

        let result = self.insert_txn(txn_id, &key, record, InsertFlags::overwrite(), Some(cursor));

        if temp.is_some() {
            if let Some(slot) = self.cursors.get_mut(cursor) {
                slot.txn = None;
            }
        }
        self.finalize(result, temp)
    }

    fn cursor_get_record_count(&mut self, cursor: CursorId) -> Result<u32> {
        self.ensure_open()?;
        let slot = self.cursors.get(cursor).ok_or(Error::CursorIsNil)?;
        if slot.is_nil() {
            return Err(Error::CursorIsNil);
        }
        let txn = slot.txn;
        let key = self.cursor_current_key(cursor).ok_or(Error::CursorIsNil)?;
        if self.config.enable_transactions {
            let lines = self.build_dupe_lines(txn, &key)?;
            Ok(lines.len() as u32)
        } else {
            Ok(self.btree.dupe_count(&key))
        }
    }

    fn cursor_get_record_size(&mut self, cursor: CursorId) -> Result<u64> {
        self.ensure_open()?;
        let slot = self.cursors.get(cursor).ok_or(Error::CursorIsNil)?;
        if slot.is_nil() {
            return Err(Error::CursorIsNil);
        }
        let record = self.cursor_current_record(cursor)?;
        Ok(record.len() as u64)
    }

    fn cursor_current_record(&self, cursor: CursorId) -> Result<Vec<u8>> {
        let slot = self.cursors.get(cursor).ok_or(Error::CursorIsNil)?;
        if slot.dupecache_index > 0 {
            if let Some(line) = slot.dupecache.get(slot.dupecache_index as usize - 1) {
                let key = self.cursor_current_key(cursor).ok_or(Error::CursorIsNil)?;
                return self.resolve_line(&key, *line);
            }
        }
        match slot.coupling {
            Coupling::Txn => slot
                .txn_op
                .and_then(|o| self.txn_index.op(o))
                .and_then(|o| o.record.clone())
                .ok_or(Error::CursorIsNil),
            Coupling::Btree => {
                let pos = slot.btree_pos.as_ref().ok_or(Error::CursorIsNil)?;
                self.btree
                    .record(&pos.key, pos.dupe)
                    .ok_or(Error::KeyNotFound)
            }
            Coupling::Nil => Err(Error::CursorIsNil),
        }
    }

    // ------------------------------------------------------------------
    // cursor movement
    // ------------------------------------------------------------------

    fn cursor_move_inner(&mut self, cursor: CursorId, direction: CursorMove) -> Result<Match> {
        self.ensure_open()?;
        let (is_nil, first_use, txn) = {
            let slot = self.cursors.get(cursor).ok_or(Error::CursorIsNil)?;
            (slot.is_nil(), slot.first_use, slot.txn)
        };

        // a nil cursor re-enters at one of the ends: fresh cursors move
        // to the requested end, exhausted ones to the opposite one
        let direction = if is_nil {
            match direction {
                CursorMove::Next => {
                    if first_use {
                        CursorMove::First
                    } else {
                        CursorMove::Last
                    }
                }
                CursorMove::Previous => {
                    if first_use {
                        CursorMove::Last
                    } else {
                        CursorMove::First
                    }
                }
                d => d,
            }
        } else {
            direction
        };

        let result = if self.config.enable_transactions {
            match direction {
                CursorMove::First => self.merged_move_to_end(cursor, txn, true),
                CursorMove::Last => self.merged_move_to_end(cursor, txn, false),
                CursorMove::Next => self.merged_step(cursor, txn, true),
                CursorMove::Previous => self.merged_step(cursor, txn, false),
            }
        } else {
            self.btree_cursor_move(cursor, direction)
        };

        if let Some(slot) = self.cursors.get_mut(cursor) {
            slot.first_use = false;
            slot.lastop = match (&result, direction) {
                (Ok(_), CursorMove::Next) => LastOp::Next,
                (Ok(_), CursorMove::Previous) => LastOp::Previous,
                (Ok(_), _) => LastOp::None,
                (Err(_), _) => LastOp::None,
            };
        }
        result
    }

    fn btree_cursor_move(&mut self, cursor: CursorId, direction: CursorMove) -> Result<Match> {
        let pos = self
            .cursors
            .get(cursor)
            .and_then(|s| s.btree_pos.clone());
        let target = match direction {
            CursorMove::First => self.btree.first_key().map(|key| BtreePos { key, dupe: 0 }),
            CursorMove::Last => self.btree.last_key().map(|key| {
                let dupe = self.btree.dupe_count(&key).saturating_sub(1);
                BtreePos { key, dupe }
            }),
            CursorMove::Next => {
                let pos = pos.ok_or(Error::CursorIsNil)?;
                if self.btree.contains(&pos.key) && pos.dupe + 1 < self.btree.dupe_count(&pos.key)
                {
                    Some(BtreePos {
                        key: pos.key,
                        dupe: pos.dupe + 1,
                    })
                } else {
                    self.btree
                        .next_key(&pos.key)
                        .map(|key| BtreePos { key, dupe: 0 })
                }
            }
            CursorMove::Previous => {
                let pos = pos.ok_or(Error::CursorIsNil)?;
                if pos.dupe > 0 && self.btree.contains(&pos.key) {
                    Some(BtreePos {
                        key: pos.key,
                        dupe: pos.dupe - 1,
                    })
                } else {
                    self.btree.prev_key(&pos.key).map(|key| {
                        let dupe = self.btree.dupe_count(&key).saturating_sub(1);
                        BtreePos { key, dupe }
                    })
                }
            }
        };
        let target = target.ok_or(Error::KeyNotFound)?;
        let record = self
            .btree
            .record(&target.key, target.dupe)
            .ok_or(Error::KeyNotFound)?;
        let key = target.key.clone();
        self.couple_cursor_to_btree(cursor, target);
        Ok(Match {
            key,
            record,
            approximate: false,
        })
    }

    /// Moves to the first or last visible key of the merged view.
    fn merged_move_to_end(
        &mut self,
        cursor: CursorId,
        txn: Option<TransactionId>,
        forward: bool,
    ) -> Result<Match> {
        let mut candidate = self.edge_key(forward);
        while let Some(key) = candidate {
            let lines = self.build_dupe_lines(txn, &key)?;
            if !lines.is_empty() {
                return self.land_on(cursor, &key, lines, forward);
            }
            candidate = self.neighbor_key(&key, forward);
        }
        Err(Error::KeyNotFound)
    }

    /// Steps to the neighboring visible key (or duplicate).
    fn merged_step(
        &mut self,
        cursor: CursorId,
        txn: Option<TransactionId>,
        forward: bool,
    ) -> Result<Match> {
        // move within the duplicates of the current key first
        if self.config.enable_duplicate_keys {
            let slot = self.cursors.get(cursor).ok_or(Error::CursorIsNil)?;
            let index = slot.dupecache_index;
            let count = slot.dupecache.len() as u32;
            if index > 0 {
                let next_index = if forward { index + 1 } else { index - 1 };
                if next_index >= 1 && next_index <= count {
                    let key = self.cursor_current_key(cursor).ok_or(Error::CursorIsNil)?;
                    let line = self.cursors.get(cursor).expect("live cursor").dupecache
                        [next_index as usize - 1];
                    let record = self.resolve_line(&key, line)?;
                    match line {
                        DupeLine::Btree { dupe } => self.couple_cursor_to_btree(
                            cursor,
                            BtreePos {
                                key: key.clone(),
                                dupe,
                            },
                        ),
                        DupeLine::Txn { op } => self.couple_cursor_to_op(cursor, op),
                    }
                    if let Some(slot) = self.cursors.get_mut(cursor) {
                        slot.dupecache_index = next_index;
                    }
                    return Ok(Match {
                        key,
                        record,
                        approximate: false,
                    });
                }
            }
        }

        let current = self
            .cursor_current_key(cursor)
            .ok_or(Error::CursorIsNil)?;
        let mut candidate = self.neighbor_key(&current, forward);
        while let Some(key) = candidate {
            let lines = self.build_dupe_lines(txn, &key)?;
            if !lines.is_empty() {
                return self.land_on(cursor, &key, lines, forward);
            }
            candidate = self.neighbor_key(&key, forward);
        }
        Err(Error::KeyNotFound)
    }

    fn edge_key(&self, forward: bool) -> Option<Vec<u8>> {
        let b = if forward {
            self.btree.first_key()
        } else {
            self.btree.last_key()
        };
        let t = if forward {
            self.txn_index.first_key()
        } else {
            self.txn_index.last_key()
        };
        pick_closer(b, t, forward)
    }

    fn neighbor_key(&self, key: &[u8], forward: bool) -> Option<Vec<u8>> {
        let b = if forward {
            self.btree.next_key(key)
        } else {
            self.btree.prev_key(key)
        };
        let t = if forward {
            self.txn_index.next_key(key)
        } else {
            self.txn_index.prev_key(key)
        };
        pick_closer(b, t, forward)
    }

    fn land_on(
        &mut self,
        cursor: CursorId,
        key: &[u8],
        lines: Vec<DupeLine>,
        forward: bool,
    ) -> Result<Match> {
        let index = if forward { 0 } else { lines.len() - 1 };
        let line = lines[index];
        let record = self.resolve_line(key, line)?;
        match line {
            DupeLine::Btree { dupe } => self.couple_cursor_to_btree(
                cursor,
                BtreePos {
                    key: key.to_vec(),
                    dupe,
                },
            ),
            DupeLine::Txn { op } => self.couple_cursor_to_op(cursor, op),
        }
        if let Some(slot) = self.cursors.get_mut(cursor) {
            if self.config.enable_duplicate_keys {
                slot.dupecache = lines;
                slot.dupecache_index = index as u32 + 1;
            } else {
                slot.clear_dupecache();
            }
        }
        Ok(Match {
            key: key.to_vec(),
            record,
            approximate: false,
        })
    }

    // ------------------------------------------------------------------
    // count, scan, integrity, close
    // ------------------------------------------------------------------

    fn count(&mut self, txn: Option<TransactionId>, distinct: bool) -> Result<u64> {
        self.ensure_open()?;

        let mut temp: Option<TransactionId> = None;
        let txn_id = match txn {
            Some(id) => Some(id),
            None if self.config.enable_transactions => {
                let id = self.begin_txn(true)?;
                temp = Some(id);
                Some(id)
            }
            None => None,
        };

        let result = self.count_inner(txn_id, distinct);
        self.finalize(result, temp)
    }

    fn count_inner(&mut self, txn: Option<TransactionId>, distinct: bool) -> Result<u64> {
        let mut total = self.btree.count(distinct) as i64;
        if self.config.enable_transactions {
            for key in self.txn_index.node_keys() {
                let lines = self.build_dupe_lines(txn, &key)?;
                let btree_dupes = self.btree.dupe_count(&key) as i64;
                if distinct {
                    if lines.is_empty() && btree_dupes > 0 {
                        total -= 1;
                    } else if !lines.is_empty() && btree_dupes == 0 {
                        total += 1;
                    }
                } else {
                    total += lines.len() as i64 - btree_dupes;
                }
            }
        }
        Ok(total.max(0) as u64)
    }

    fn scan(
        &mut self,
        txn: Option<TransactionId>,
        visitor: &mut dyn ScanVisitor,
        distinct: bool,
    ) -> Result<()> {
        self.ensure_open()?;
        let cursor = self.cursors.alloc(CursorSlot::new(txn));
        let result = self.scan_inner(cursor, visitor, distinct);
        self.nil_cursor_fully(cursor);
        self.cursors.remove(cursor);
        match result {
            Err(Error::KeyNotFound) => Ok(()),
            other => other,
        }
    }

    fn scan_record_count(&self, cursor: CursorId, distinct: bool) -> u64 {
        if !distinct {
            return 1;
        }
        self.cursors
            .get(cursor)
            .map_or(1, |s| s.dupecache.len().max(1) as u64)
    }

    /// Advances the scan cursor to the next key, stepping over the
    /// remaining duplicates of the current one.
    fn scan_advance(&mut self, cursor: CursorId, current_key: &[u8]) -> Result<Match> {
        loop {
            let m = self.cursor_move_inner(cursor, CursorMove::Next)?;
            if m.key != current_key {
                return Ok(m);
            }
        }
    }

    fn scan_inner(
        &mut self,
        cursor: CursorId,
        visitor: &mut dyn ScanVisitor,
        distinct: bool,
    ) -> Result<()> {
        let mut current = self.cursor_move_inner(cursor, CursorMove::First)?;

        // transactions disabled: hand whole leaves to the B-tree
        if !self.config.enable_transactions {
            for leaf in 0..self.btree.leaf_count() {
                self.btree.scan_leaf(leaf, 0, distinct, visitor);
            }
            return Ok(());
        }

        // keys may live in both layers; walk leaf by leaf and delegate
        // leaves the overlay does not touch
        loop {
            let coupling = self
                .cursors
                .get(cursor)
                .map(|s| s.coupling)
                .unwrap_or(Coupling::Nil);
            if coupling != Coupling::Btree {
                break;
            }
            let Some(leaf) = self.btree.leaf_of(&current.key) else {
                break;
            };
            let Some((low, high)) = self.btree.leaf_bounds(leaf) else {
                break;
            };
            if self.txn_index.has_key_in_range(&low, &high) {
                // merge order through the cursor until the leaf is done
                loop {
                    visitor.visit(&current.key, self.scan_record_count(cursor, distinct));
                    let key = current.key.clone();
                    current = match self.scan_advance(cursor, &key) {
                        Ok(m) => m,
                        Err(Error::KeyNotFound) => return Ok(()),
                        Err(e) => return Err(e),
                    };
                    let still_btree = self
                        .cursors
                        .get(cursor)
                        .is_some_and(|s| s.coupling == Coupling::Btree);
                    if !still_btree || self.btree.leaf_of(&current.key) != Some(leaf) {
                        break;
                    }
                }
            } else {
                // the whole leaf is untouched; bulk-scan it
                let slot_index = self
                    .btree
                    .slot_of(&current.key)
                    .map_or(0, |(_, slot)| slot);
                self.btree.scan_leaf(leaf, slot_index, distinct, visitor);
                // reposition past the leaf without revisiting
                loop {
                    let key = current.key.clone();
                    current = match self.scan_advance(cursor, &key) {
                        Ok(m) => m,
                        Err(Error::KeyNotFound) => return Ok(()),
                        Err(e) => return Err(e),
                    };
                    if BtreeIndex::compare_keys(&current.key, &high) == Ordering::Greater {
                        break;
                    }
                }
            }
        }

        // drain the rest through the merged cursor
        loop {
            visitor.visit(&current.key, self.scan_record_count(cursor, distinct));
            let key = current.key.clone();
            current = match self.scan_advance(cursor, &key) {
                Ok(m) => m,
                Err(Error::KeyNotFound) => return Ok(()),
                Err(e) => return Err(e),
            };
        }
    }

    fn check_integrity(&self) -> Result<()> {
        self.btree.check_integrity()?;

        for key in self.txn_index.node_keys() {
            let node = self.txn_index.node(&key).expect("listed node");
            let mut prev_lsn: Option<Lsn> = None;
            for op_id in node.ops_oldest_first() {
                let op = self
                    .txn_index
                    .op(op_id)
                    .ok_or_else(|| Error::integrity("node lists a removed op"))?;
                if op.key != key {
                    return Err(Error::integrity("op does not belong to its node"));
                }
                if let Some(prev) = prev_lsn {
                    if op.lsn <= prev {
                        return Err(Error::integrity("op LSNs out of order within node"));
                    }
                }
                prev_lsn = Some(op.lsn);
            }
        }
        Ok(())
    }

    fn close_impl(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }

        // refuse while an active transaction still owns operations
        for key in self.txn_index.node_keys() {
            let node = self.txn_index.node(&key).expect("listed node");
            for op_id in node.ops_newest_first() {
                let op = self.txn_index.op(op_id).expect("op listed in node");
                if self.txn_manager.status(op.txn) == Some(TxnStatus::Active) {
                    warn!("cannot close a database modified by an active transaction");
                    return Err(Error::TxnStillOpen);
                }
            }
        }

        self.flush_committed_txns()?;
        if let Some(journal) = self.journal.as_mut() {
            journal.sync()?;
        }
        self.open = false;
        debug!("database closed");
        Ok(())
    }
}

fn pick_closer(a: Option<Vec<u8>>, b: Option<Vec<u8>>, forward: bool) -> Option<Vec<u8>> {
    match (a, b) {
        (None, None) => None,
        (Some(k), None) | (None, Some(k)) => Some(k),
        (Some(x), Some(y)) => {
            let use_x = if forward { x <= y } else { x >= y };
            Some(if use_x { x } else { y })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyType;

    fn create_db() -> Database {
        Database::create_in_memory(Config::new()).unwrap()
    }

    fn db_without_txns() -> Database {
        Database::create_in_memory(Config::new().enable_transactions(false)).unwrap()
    }

    /// Seeds keys through autocommit and flushes them into the B-tree.
    fn seed_flushed(db: &Database, pairs: &[(&[u8], &[u8])]) {
        for (k, v) in pairs {
            db.insert(None, k, v, InsertFlags::new()).unwrap();
        }
        db.flush_committed_txns().unwrap();
    }

    #[test]
    fn create_and_close() {
        let db = create_db();
        assert!(db.is_open());
        db.close().unwrap();
        assert!(!db.is_open());
        assert!(matches!(
            db.find(None, b"k", FindFlags::exact()),
            Err(Error::DatabaseClosed)
        ));
    }

    #[test]
    fn autocommit_insert_and_find() {
        let db = create_db();
        db.insert(None, b"key", b"value", InsertFlags::new()).unwrap();
        let m = db.find(None, b"key", FindFlags::exact()).unwrap();
        assert_eq!(m.key, b"key");
        assert_eq!(m.record, b"value");
        assert!(!m.approximate);
    }

    #[test]
    fn find_missing_key() {
        let db = create_db();
        assert!(matches!(
            db.find(None, b"nope", FindFlags::exact()),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn duplicate_key_rejected_without_overwrite() {
        let db = create_db();
        db.insert(None, b"k", b"v", InsertFlags::new()).unwrap();
        assert!(matches!(
            db.insert(None, b"k", b"w", InsertFlags::new()),
            Err(Error::DuplicateKey)
        ));
        // the temporary transaction of the failed insert was aborted
        db.close().unwrap();
    }

    #[test]
    fn overwrite_replaces_record() {
        let db = create_db();
        db.insert(None, b"k", b"v", InsertFlags::new()).unwrap();
        db.insert(None, b"k", b"w", InsertFlags::overwrite()).unwrap();
        let m = db.find(None, b"k", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"w");
    }

    #[test]
    fn erase_hides_key() {
        let db = create_db();
        db.insert(None, b"k", b"v", InsertFlags::new()).unwrap();
        db.erase(None, b"k", EraseFlags::new()).unwrap();
        assert!(matches!(
            db.find(None, b"k", FindFlags::exact()),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn erase_missing_key_fails() {
        let db = create_db();
        assert!(matches!(
            db.erase(None, b"k", EraseFlags::new()),
            Err(Error::KeyNotFound)
        ));
        db.close().unwrap();
    }

    #[test]
    fn read_your_writes() {
        let db = create_db();
        seed_flushed(&db, &[(&b"k"[..], &b"old"[..])]);

        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"k", b"new", InsertFlags::overwrite())
            .unwrap();
        let m = db.find(Some(&txn), b"k", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"new");
        db.abort(txn).unwrap();
    }

    #[test]
    fn isolation_conflict_on_same_key() {
        let db = create_db();
        let t1 = db.begin().unwrap();
        db.insert(Some(&t1), b"a", b"1", InsertFlags::new()).unwrap();

        let t2 = db.begin().unwrap();
        assert!(matches!(
            db.find(Some(&t2), b"a", FindFlags::exact()),
            Err(Error::TxnConflict)
        ));
        assert!(matches!(
            db.insert(Some(&t2), b"a", b"2", InsertFlags::new()),
            Err(Error::TxnConflict)
        ));
        assert!(matches!(
            db.erase(Some(&t2), b"a", EraseFlags::new()),
            Err(Error::TxnConflict)
        ));

        db.commit(t1).unwrap();
        let m = db.find(Some(&t2), b"a", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"1");
        db.abort(t2).unwrap();
    }

    #[test]
    fn conflict_released_by_abort() {
        let db = create_db();
        let t1 = db.begin().unwrap();
        db.insert(Some(&t1), b"x", b"1", InsertFlags::new()).unwrap();

        let t2 = db.begin().unwrap();
        assert!(matches!(
            db.insert(Some(&t2), b"x", b"2", InsertFlags::new()),
            Err(Error::TxnConflict)
        ));

        db.abort(t1).unwrap();
        db.insert(Some(&t2), b"x", b"2", InsertFlags::new()).unwrap();
        let m = db.find(Some(&t2), b"x", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"2");
        db.commit(t2).unwrap();
    }

    #[test]
    fn commit_propagates_to_fresh_transactions() {
        let db = create_db();
        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"k", b"v", InsertFlags::new()).unwrap();
        db.commit(txn).unwrap();
        db.flush_committed_txns().unwrap();

        let reader = db.begin().unwrap();
        let m = db.find(Some(&reader), b"k", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"v");
        db.abort(reader).unwrap();
        assert_eq!(db.count(None, true).unwrap(), 1);
    }

    #[test]
    fn aborted_writes_are_invisible() {
        let db = create_db();
        seed_flushed(&db, &[(&b"k"[..], &b"old"[..])]);

        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"k", b"new", InsertFlags::overwrite())
            .unwrap();
        db.abort(txn).unwrap();

        let m = db.find(None, b"k", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"old");
    }

    #[test]
    fn close_refused_while_transaction_open() {
        let db = create_db();
        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"k", b"v", InsertFlags::new()).unwrap();

        assert!(matches!(db.close(), Err(Error::TxnStillOpen)));
        assert!(db.is_open());

        db.abort(txn).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn erased_key_with_approximate_match() {
        let db = create_db();
        seed_flushed(&db, &[(&b"b"[..], &b"B"[..]), (&b"c"[..], &b"C"[..]), (&b"d"[..], &b"D"[..])]);

        let t1 = db.begin().unwrap();
        db.erase(Some(&t1), b"c", EraseFlags::new()).unwrap();
        db.commit(t1).unwrap();
        // committed but not yet flushed: the erase only exists in the overlay

        let t2 = db.begin().unwrap();
        let m = db.find(Some(&t2), b"c", FindFlags::gt_match()).unwrap();
        assert_eq!(m.key, b"d");
        assert_eq!(m.record, b"D");
        assert!(m.approximate);

        let m = db.find(Some(&t2), b"c", FindFlags::lt_match()).unwrap();
        assert_eq!(m.key, b"b");
        assert_eq!(m.record, b"B");
        assert!(m.approximate);

        assert!(matches!(
            db.find(Some(&t2), b"c", FindFlags::exact()),
            Err(Error::KeyNotFound)
        ));
        db.abort(t2).unwrap();
    }

    #[test]
    fn approximate_match_prefers_closer_overlay_key() {
        let db = create_db();
        seed_flushed(&db, &[(&b"a"[..], &b"A"[..]), (&b"d"[..], &b"D"[..])]);

        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"c", b"C", InsertFlags::new()).unwrap();

        // candidates: overlay "c" and B-tree "d"; "c" is closer
        let m = db.find(Some(&txn), b"b", FindFlags::gt_match()).unwrap();
        assert_eq!(m.key, b"c");
        assert_eq!(m.record, b"C");
        assert!(m.approximate);
        db.abort(txn).unwrap();
    }

    #[test]
    fn approximate_match_prefers_closer_btree_key() {
        let db = create_db();
        seed_flushed(&db, &[(&b"d"[..], &b"D"[..])]);

        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"e", b"E", InsertFlags::new()).unwrap();

        // candidates: B-tree "d" and overlay "e"; "d" is closer and not
        // shadowed, so the re-validated B-tree side wins
        let m = db.find(Some(&txn), b"b", FindFlags::gt_match()).unwrap();
        assert_eq!(m.key, b"d");
        assert_eq!(m.record, b"D");
        assert!(m.approximate);
        db.abort(txn).unwrap();
    }

    #[test]
    fn approximate_match_revalidates_shadowed_btree_key() {
        let db = create_db();
        seed_flushed(&db, &[(&b"d"[..], &b"D"[..])]);

        let t1 = db.begin().unwrap();
        db.erase(Some(&t1), b"d", EraseFlags::new()).unwrap();
        db.insert(Some(&t1), b"e", b"E", InsertFlags::new()).unwrap();
        db.commit(t1).unwrap();

        // the B-tree offers "d", but a committed erase shadows it; the
        // overlay's "e" is the closest visible key
        let m = db.find(None, b"b", FindFlags::gt_match()).unwrap();
        assert_eq!(m.key, b"e");
        assert_eq!(m.record, b"E");
        assert!(m.approximate);
    }

    #[test]
    fn overlay_answers_before_btree() {
        let db = create_db();
        seed_flushed(&db, &[(&b"k"[..], &b"btree"[..])]);

        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"k", b"overlay", InsertFlags::overwrite())
            .unwrap();
        db.commit(txn).unwrap();

        // not flushed: the overlay supersedes the B-tree for this key
        let m = db.find(None, b"k", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"overlay");
    }

    #[test]
    fn count_merges_overlay_and_btree() {
        let db = create_db();
        seed_flushed(&db, &[(&b"a"[..], &b"A"[..]), (&b"b"[..], &b"B"[..])]);

        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"c", b"C", InsertFlags::new()).unwrap();
        db.erase(Some(&txn), b"a", EraseFlags::new()).unwrap();

        assert_eq!(db.count(Some(&txn), true).unwrap(), 2);
        db.commit(txn).unwrap();
        assert_eq!(db.count(None, true).unwrap(), 2);
        db.flush_committed_txns().unwrap();
        assert_eq!(db.count(None, true).unwrap(), 2);
    }

    #[test]
    fn flush_applies_committed_operations() {
        let db = create_db();
        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"k", b"v", InsertFlags::new()).unwrap();
        db.commit(txn).unwrap();
        db.flush_committed_txns().unwrap();

        // the overlay node is gone; the B-tree answers directly
        let m = db.find(None, b"k", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"v");
        db.check_integrity().unwrap();
    }

    #[test]
    fn flushed_erase_tolerates_missing_btree_key() {
        let db = create_db();
        // insert and erase inside the same transaction; at flush time the
        // erase finds no B-tree key
        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"k", b"v", InsertFlags::new()).unwrap();
        db.erase(Some(&txn), b"k", EraseFlags::new()).unwrap();
        db.commit(txn).unwrap();
        db.flush_committed_txns().unwrap();
        assert!(matches!(
            db.find(None, b"k", FindFlags::exact()),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn record_number_keys_auto_increment() {
        let db = Database::create_in_memory(
            Config::new().record_number(RecordNumber::Recno64),
        )
        .unwrap();

        let k1 = db.insert(None, b"", b"one", InsertFlags::new()).unwrap();
        let k2 = db.insert(None, b"", b"two", InsertFlags::new()).unwrap();
        let k3 = db.insert(None, b"", b"three", InsertFlags::new()).unwrap();
        assert_eq!(k1, 1u64.to_be_bytes());
        assert_eq!(k2, 2u64.to_be_bytes());
        assert_eq!(k3, 3u64.to_be_bytes());

        // overwrite with an explicit key does not bump the counter
        db.insert(None, &2u64.to_be_bytes(), b"TWO", InsertFlags::overwrite())
            .unwrap();
        let m = db
            .find(None, &2u64.to_be_bytes(), FindFlags::exact())
            .unwrap();
        assert_eq!(m.record, b"TWO");

        let k4 = db.insert(None, b"", b"four", InsertFlags::new()).unwrap();
        assert_eq!(k4, 4u64.to_be_bytes());
    }

    #[test]
    fn record_number32_keys() {
        let db = Database::create_in_memory(
            Config::new().record_number(RecordNumber::Recno32),
        )
        .unwrap();
        let k1 = db.insert(None, b"", b"one", InsertFlags::new()).unwrap();
        assert_eq!(k1, 1u32.to_be_bytes());
        assert_eq!(db.get_parameter(Parameter::KeySize).unwrap(), 4);
    }

    #[test]
    fn fixed_key_size_is_validated() {
        let db = Database::create_in_memory(Config::new().key_type(KeyType::UInt32)).unwrap();
        assert!(matches!(
            db.insert(None, b"toolong", b"v", InsertFlags::new()),
            Err(Error::InvKeySize { expected: 4, .. })
        ));
        db.insert(None, &7u32.to_be_bytes(), b"v", InsertFlags::new())
            .unwrap();
    }

    #[test]
    fn fixed_record_size_is_validated() {
        let db =
            Database::create_in_memory(Config::new().record_size(4)).unwrap();
        assert!(matches!(
            db.insert(None, b"k", b"toolong", InsertFlags::new()),
            Err(Error::InvRecordSize { expected: 4, .. })
        ));
        db.insert(None, b"k", b"1234", InsertFlags::new()).unwrap();
    }

    #[test]
    fn oversized_keys_rejected_at_create() {
        let result = Database::create_in_memory(
            Config::new().key_size(4096).page_size(1024),
        );
        assert!(matches!(result, Err(Error::InvKeySize { .. })));
    }

    #[test]
    fn duplicate_flag_requires_configuration() {
        let db = create_db();
        assert!(matches!(
            db.insert(None, b"k", b"v", InsertFlags::duplicate()),
            Err(Error::InvParameter { .. })
        ));
    }

    #[test]
    fn conflicting_find_directions_rejected() {
        let db = create_db();
        let flags = FindFlags {
            exact: false,
            lt: true,
            gt: true,
        };
        assert!(matches!(
            db.find(None, b"k", flags),
            Err(Error::InvParameter { .. })
        ));
    }

    #[test]
    fn begin_requires_transactions() {
        let db = db_without_txns();
        assert!(matches!(db.begin(), Err(Error::InvParameter { .. })));
    }

    #[test]
    fn read_only_rejects_writes() {
        let db = Database::create_in_memory(Config::new().read_only(true)).unwrap();
        assert!(matches!(
            db.insert(None, b"k", b"v", InsertFlags::new()),
            Err(Error::InvParameter { .. })
        ));
    }

    #[test]
    fn direct_btree_mode_without_transactions() {
        let db = db_without_txns();
        db.insert(None, b"k", b"v", InsertFlags::new()).unwrap();
        let m = db.find(None, b"k", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"v");
        db.erase(None, b"k", EraseFlags::new()).unwrap();
        assert!(matches!(
            db.find(None, b"k", FindFlags::exact()),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn get_parameters() {
        let db = Database::create_in_memory(
            Config::new().key_type(KeyType::UInt64).name(7),
        )
        .unwrap();
        assert_eq!(db.get_parameter(Parameter::KeySize).unwrap(), 8);
        assert_eq!(
            db.get_parameter(Parameter::KeyType).unwrap(),
            KeyType::UInt64.as_u64()
        );
        assert_eq!(db.get_parameter(Parameter::DatabaseName).unwrap(), 7);
        assert!(db.get_parameter(Parameter::MaxKeysPerPage).unwrap() >= 2);
        assert_eq!(db.get_parameter(Parameter::RecordCompression).unwrap(), 0);
        assert_eq!(db.get_parameter(Parameter::KeyCompression).unwrap(), 0);
        assert_ne!(
            db.get_parameter(Parameter::Flags).unwrap()
                & crate::config::FLAG_ENABLE_TRANSACTIONS,
            0
        );
    }

    #[test]
    fn integrity_holds_under_mixed_load() {
        let db = create_db();
        seed_flushed(&db, &[(&b"a"[..], &b"1"[..]), (&b"b"[..], &b"2"[..]), (&b"c"[..], &b"3"[..])]);
        let txn = db.begin().unwrap();
        db.insert(Some(&txn), b"d", b"4", InsertFlags::new()).unwrap();
        db.erase(Some(&txn), b"b", EraseFlags::new()).unwrap();
        db.check_integrity().unwrap();
        db.commit(txn).unwrap();
        db.check_integrity().unwrap();
        db.flush_committed_txns().unwrap();
        db.check_integrity().unwrap();
    }

    #[test]
    fn erase_me_releases_btree() {
        let db = create_db();
        seed_flushed(&db, &[(&b"a"[..], &b"1"[..])]);
        db.erase_me();
        assert_eq!(db.count(None, true).unwrap(), 0);
    }
}


#[cfg(test)]
mod scan_tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        keys: Vec<Vec<u8>>,
        counts: Vec<u64>,
    }

    impl ScanVisitor for Collect {
        fn visit(&mut self, key: &[u8], record_count: u64) {
            self.keys.push(key.to_vec());
            self.counts.push(record_count);
        }
    }

    fn keys(collect: &Collect) -> Vec<&[u8]> {
        collect.keys.iter().map(Vec::as_slice).collect()
    }

    #[test]
    fn scan_empty_database() {
        let db = Database::create_in_memory(Config::new()).unwrap();
        let mut collect = Collect::default();
        db.scan(None, &mut collect, false).unwrap();
        assert!(collect.keys.is_empty());
    }

    #[test]
    fn scan_btree_only() {
        let db = Database::create_in_memory(Config::new().enable_transactions(false)).unwrap();
        for k in [b"c", b"a", b"b"] {
            db.insert(None, k, b"v", InsertFlags::new()).unwrap();
        }
        let mut collect = Collect::default();
        db.scan(None, &mut collect, false).unwrap();
        assert_eq!(keys(&collect), vec![&b"a"[..], b"b", b"c"]);
    }

    #[test]
    fn scan_overlay_only() {
        let db = Database::create_in_memory(Config::new()).unwrap();
        for k in [b"c", b"a", b"b"] {
            db.insert(None, k, b"v", InsertFlags::new()).unwrap();
        }
        // nothing flushed: all keys live in the overlay
        let mut collect = Collect::default();
        db.scan(None, &mut collect, false).unwrap();
        assert_eq!(keys(&collect), vec![&b"a"[..], b"b", b"c"]);
    }

    #[test]
    fn scan_merges_and_skips_erased() {
        let db = Database::create_in_memory(Config::new()).unwrap();
        for k in [b"a", b"c", b"e"] {
            db.insert(None, k, b"v", InsertFlags::new()).unwrap();
        }
        db.flush_committed_txns().unwrap();
        for k in [b"b", b"d"] {
            db.insert(None, k, b"v", InsertFlags::new()).unwrap();
        }
        db.erase(None, b"c", EraseFlags::new()).unwrap();

        let mut collect = Collect::default();
        db.scan(None, &mut collect, false).unwrap();
        assert_eq!(keys(&collect), vec![&b"a"[..], b"b", b"d", b"e"]);
    }

    #[test]
    fn scan_distinct_reports_duplicate_counts() {
        let db = Database::create_in_memory(
            Config::new().enable_duplicate_keys(true),
        )
        .unwrap();
        db.insert(None, b"k", b"v1", InsertFlags::duplicate()).unwrap();
        db.insert(None, b"k", b"v2", InsertFlags::duplicate()).unwrap();
        db.insert(None, b"solo", b"v", InsertFlags::new()).unwrap();

        let mut collect = Collect::default();
        db.scan(None, &mut collect, true).unwrap();
        assert_eq!(keys(&collect), vec![&b"k"[..], b"solo"]);
        assert_eq!(collect.counts, vec![2, 1]);
    }

    #[test]
    fn scan_delegates_untouched_leaves() {
        // many flushed keys and one overlay key far to the right forces
        // the leaf-delegation path
        let db = Database::create_in_memory(Config::new().page_size(512)).unwrap();
        let mut expected = Vec::new();
        for i in 0u32..60 {
            let key = format!("key{i:04}").into_bytes();
            db.insert(None, &key, b"v", InsertFlags::new()).unwrap();
            expected.push(key);
        }
        db.flush_committed_txns().unwrap();
        db.insert(None, b"zzz", b"v", InsertFlags::new()).unwrap();
        expected.push(b"zzz".to_vec());

        let mut collect = Collect::default();
        db.scan(None, &mut collect, false).unwrap();
        assert_eq!(collect.keys, expected);
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use tempfile::tempdir;

    fn recovery_config() -> Config {
        Config::new().enable_recovery(true)
    }

    #[test]
    fn committed_operations_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graft.jnl");

        {
            let db = Database::create(&path, recovery_config()).unwrap();
            db.insert(None, b"k", b"v", InsertFlags::new()).unwrap();
            db.erase(None, b"gone", EraseFlags::new()).unwrap_err();
            // no explicit close: the journal already holds the commit
        }

        let db = Database::open(&path, recovery_config()).unwrap();
        let m = db.find(None, b"k", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"v");
    }

    #[test]
    fn uncommitted_transaction_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graft.jnl");

        {
            let db = Database::create(&path, recovery_config()).unwrap();
            db.insert(None, b"kept", b"v", InsertFlags::new()).unwrap();
            let txn = db.begin().unwrap();
            db.insert(Some(&txn), b"lost", b"v", InsertFlags::new()).unwrap();
            // dropped while the transaction is open: the close fails and
            // no commit record is journaled
        }

        let db = Database::open(&path, recovery_config()).unwrap();
        assert!(db.find(None, b"kept", FindFlags::exact()).is_ok());
        assert!(matches!(
            db.find(None, b"lost", FindFlags::exact()),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn erase_replay_hides_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graft.jnl");

        {
            let db = Database::create(&path, recovery_config()).unwrap();
            db.insert(None, b"k", b"v", InsertFlags::new()).unwrap();
            db.erase(None, b"k", EraseFlags::new()).unwrap();
            db.close().unwrap();
        }

        let db = Database::open(&path, recovery_config()).unwrap();
        assert!(matches!(
            db.find(None, b"k", FindFlags::exact()),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn record_number_counter_is_reseeded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graft.jnl");
        let config = recovery_config().record_number(RecordNumber::Recno64);

        {
            let db = Database::create(&path, config.clone()).unwrap();
            for _ in 0..3 {
                db.insert(None, b"", b"v", InsertFlags::new()).unwrap();
            }
            db.close().unwrap();
        }

        let db = Database::open(&path, config).unwrap();
        let k = db.insert(None, b"", b"v", InsertFlags::new()).unwrap();
        assert_eq!(k, 4u64.to_be_bytes());
    }

    #[test]
    fn changeset_mode_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graft.jnl");
        let config = recovery_config().enable_transactions(false);

        {
            let db = Database::create(&path, config.clone()).unwrap();
            db.insert(None, b"a", b"1", InsertFlags::new()).unwrap();
            db.insert(None, b"b", b"2", InsertFlags::new()).unwrap();
            db.erase(None, b"a", EraseFlags::new()).unwrap();
            db.close().unwrap();
        }

        let db = Database::open(&path, config).unwrap();
        assert!(matches!(
            db.find(None, b"a", FindFlags::exact()),
            Err(Error::KeyNotFound)
        ));
        let m = db.find(None, b"b", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"2");
    }

    #[test]
    fn create_truncates_previous_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("graft.jnl");

        {
            let db = Database::create(&path, recovery_config()).unwrap();
            db.insert(None, b"old", b"v", InsertFlags::new()).unwrap();
            db.close().unwrap();
        }
        {
            let db = Database::create(&path, recovery_config()).unwrap();
            assert!(matches!(
                db.find(None, b"old", FindFlags::exact()),
                Err(Error::KeyNotFound)
            ));
            db.close().unwrap();
        }
    }
}
