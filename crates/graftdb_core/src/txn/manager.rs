//! Transaction lifecycle management.

use crate::error::{Error, Result};
use crate::txn::op::OpId;
use crate::types::{Lsn, TransactionId};
use std::collections::HashMap;

/// A transaction handle.
///
/// Obtained from [`crate::Database::begin`]; consumed by commit and
/// abort so a terminated transaction cannot be used again.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) id: TransactionId,
}

impl Transaction {
    /// Returns the transaction id.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// The transaction can still perform operations.
    Active,
    /// The transaction committed; its operations await flushing.
    Committed,
    /// The transaction aborted; its operations are invisible.
    Aborted,
}

#[derive(Debug)]
struct TxnState {
    status: TxnStatus,
    temporary: bool,
    ops: Vec<OpId>,
}

/// Tracks transaction states, commit order, and the LSN counter.
#[derive(Debug)]
pub struct TxnManager {
    next_txn: u64,
    next_lsn: u64,
    states: HashMap<TransactionId, TxnState>,
    /// Committed but not yet flushed, in commit order.
    commit_queue: Vec<TransactionId>,
}

impl TxnManager {
    /// Creates a manager with fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::with_counters(1, 1)
    }

    /// Creates a manager seeded from recovery.
    #[must_use]
    pub fn with_counters(next_txn: u64, next_lsn: u64) -> Self {
        Self {
            next_txn,
            next_lsn,
            states: HashMap::new(),
            commit_queue: Vec::new(),
        }
    }

    /// Returns the next LSN; LSNs are handed out exactly once.
    pub fn next_lsn(&mut self) -> Lsn {
        let lsn = Lsn::new(self.next_lsn);
        self.next_lsn += 1;
        lsn
    }

    /// Begins a new transaction.
    pub fn begin(&mut self, temporary: bool) -> TransactionId {
        let id = TransactionId::new(self.next_txn);
        self.next_txn += 1;
        self.states.insert(
            id,
            TxnState {
                status: TxnStatus::Active,
                temporary,
                ops: Vec::new(),
            },
        );
        id
    }

    /// Commits a transaction.
    pub fn commit(&mut self, id: TransactionId) -> Result<()> {
        let state = self.active_state(id)?;
        state.status = TxnStatus::Committed;
        self.commit_queue.push(id);
        Ok(())
    }

    /// Aborts a transaction; its operations become invisible at once.
    pub fn abort(&mut self, id: TransactionId) -> Result<()> {
        let state = self.active_state(id)?;
        state.status = TxnStatus::Aborted;
        Ok(())
    }

    fn active_state(&mut self, id: TransactionId) -> Result<&mut TxnState> {
        let state = self
            .states
            .get_mut(&id)
            .ok_or_else(|| Error::inv_parameter(format!("unknown transaction {id}")))?;
        if state.status != TxnStatus::Active {
            return Err(Error::inv_parameter(format!("{id} is not active")));
        }
        Ok(state)
    }

    /// Returns the status of a transaction, if it is still tracked.
    #[must_use]
    pub fn status(&self, id: TransactionId) -> Option<TxnStatus> {
        self.states.get(&id).map(|s| s.status)
    }

    /// Returns true if the transaction is active.
    #[must_use]
    pub fn is_active(&self, id: TransactionId) -> bool {
        self.status(id) == Some(TxnStatus::Active)
    }

    /// Returns true if the transaction was begun as a temporary one.
    #[must_use]
    pub fn is_temporary(&self, id: TransactionId) -> bool {
        self.states.get(&id).is_some_and(|s| s.temporary)
    }

    /// Records an operation appended by the transaction.
    pub fn record_op(&mut self, id: TransactionId, op: OpId) {
        if let Some(state) = self.states.get_mut(&id) {
            state.ops.push(op);
        }
    }

    /// Returns the operations of a transaction, in append order.
    #[must_use]
    pub fn ops_of(&self, id: TransactionId) -> Vec<OpId> {
        self.states.get(&id).map(|s| s.ops.clone()).unwrap_or_default()
    }

    /// Drains the queue of committed, unflushed transactions.
    pub fn take_committed(&mut self) -> Vec<TransactionId> {
        std::mem::take(&mut self.commit_queue)
    }

    /// Drops the state of a fully flushed, terminated transaction.
    pub fn retire(&mut self, id: TransactionId) {
        self.states.remove(&id);
    }

    /// Returns the ids of terminated transactions.
    #[must_use]
    pub fn terminated(&self) -> Vec<TransactionId> {
        self.states
            .iter()
            .filter(|(_, s)| s.status != TxnStatus::Active)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Returns the number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| s.status == TxnStatus::Active)
            .count()
    }
}

impl Default for TxnManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_assigns_increasing_ids() {
        let mut mgr = TxnManager::new();
        let a = mgr.begin(false);
        let b = mgr.begin(false);
        assert!(a < b);
        assert_eq!(mgr.active_count(), 2);
    }

    #[test]
    fn lsns_strictly_increase() {
        let mut mgr = TxnManager::new();
        let a = mgr.next_lsn();
        let b = mgr.next_lsn();
        assert!(a < b);
    }

    #[test]
    fn commit_moves_to_queue() {
        let mut mgr = TxnManager::new();
        let id = mgr.begin(false);
        mgr.commit(id).unwrap();
        assert_eq!(mgr.status(id), Some(TxnStatus::Committed));
        assert_eq!(mgr.take_committed(), vec![id]);
        assert!(mgr.take_committed().is_empty());
    }

    #[test]
    fn abort_is_terminal() {
        let mut mgr = TxnManager::new();
        let id = mgr.begin(false);
        mgr.abort(id).unwrap();
        assert_eq!(mgr.status(id), Some(TxnStatus::Aborted));
        assert!(mgr.commit(id).is_err());
    }

    #[test]
    fn cannot_commit_twice() {
        let mut mgr = TxnManager::new();
        let id = mgr.begin(false);
        mgr.commit(id).unwrap();
        assert!(mgr.commit(id).is_err());
        assert!(mgr.abort(id).is_err());
    }

    #[test]
    fn records_ops_in_order() {
        let mut mgr = TxnManager::new();
        let id = mgr.begin(false);
        mgr.record_op(id, OpId(5));
        mgr.record_op(id, OpId(9));
        assert_eq!(mgr.ops_of(id), vec![OpId(5), OpId(9)]);
    }

    #[test]
    fn retire_drops_state() {
        let mut mgr = TxnManager::new();
        let id = mgr.begin(true);
        assert!(mgr.is_temporary(id));
        mgr.commit(id).unwrap();
        mgr.retire(id);
        assert_eq!(mgr.status(id), None);
    }
}
