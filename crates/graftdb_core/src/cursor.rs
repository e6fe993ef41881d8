//! Cursors and the cursor slot arena.
//!
//! A cursor is a slot in a per-database arena, referenced by a
//! generational id. At any moment it is coupled to nothing, to an
//! overlay operation, or to a B-tree position; never to both sides at
//! once.

use crate::btree::BtreePos;
use crate::txn::OpId;
use crate::types::TransactionId;

/// A cursor handle.
///
/// Obtained from [`crate::Database::cursor_create`]; all cursor
/// operations go through the owning database.
#[derive(Debug)]
pub struct Cursor {
    pub(crate) id: CursorId,
}

/// Generational slot id of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId {
    pub(crate) slot: u32,
    pub(crate) gen: u32,
}

/// Which side a cursor is coupled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coupling {
    /// Not coupled.
    #[default]
    Nil,
    /// Coupled to an overlay operation.
    Txn,
    /// Coupled to a B-tree position.
    Btree,
}

/// Memo of the last completed cursor operation, used to disambiguate
/// repeated moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LastOp {
    /// No operation recorded.
    #[default]
    None,
    /// The last move went forward.
    Next,
    /// The last move went backward.
    Previous,
    /// The cursor completed a lookup or insert.
    LookupOrInsert,
}

/// One duplicate of the current key, as seen through the merged
/// overlay/B-tree view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupeLine {
    /// The duplicate lives in a B-tree leaf.
    Btree {
        /// 0-based duplicate index within the key.
        dupe: u32,
    },
    /// The duplicate is an overlay operation's record.
    Txn {
        /// The operation holding the record.
        op: OpId,
    },
}

/// The state behind a cursor handle.
#[derive(Debug, Clone, Default)]
pub(crate) struct CursorSlot {
    /// The transaction the cursor operates in, if any. Temporary
    /// transactions are bound here for the duration of one wrapper
    /// call.
    pub txn: Option<TransactionId>,
    /// Which side is live.
    pub coupling: Coupling,
    /// The overlay side.
    pub txn_op: Option<OpId>,
    /// The B-tree side.
    pub btree_pos: Option<BtreePos>,
    /// Flattened duplicates of the current key.
    pub dupecache: Vec<DupeLine>,
    /// 1-based position within the dupecache; 0 = not on a duplicate.
    pub dupecache_index: u32,
    /// Memo of the last completed operation.
    pub lastop: LastOp,
    /// True until the cursor's first successful use.
    pub first_use: bool,
}

impl CursorSlot {
    pub(crate) fn new(txn: Option<TransactionId>) -> Self {
        Self {
            txn,
            first_use: true,
            ..Self::default()
        }
    }

    /// Returns true if neither side is live.
    pub(crate) fn is_nil(&self) -> bool {
        match self.coupling {
            Coupling::Nil => true,
            Coupling::Txn => self.txn_op.is_none(),
            Coupling::Btree => self.btree_pos.is_none(),
        }
    }

    /// Drops the B-tree side.
    pub(crate) fn nil_btree_side(&mut self) {
        self.btree_pos = None;
        if self.coupling == Coupling::Btree {
            self.coupling = Coupling::Nil;
        }
    }

    /// Clears the duplicate cache.
    pub(crate) fn clear_dupecache(&mut self) {
        self.dupecache.clear();
        self.dupecache_index = 0;
    }
}

#[derive(Debug, Default)]
struct Entry {
    gen: u32,
    slot: Option<CursorSlot>,
}

/// Arena of cursor slots with a free list.
///
/// Slots are reused; the generation counter invalidates ids of closed
/// cursors.
#[derive(Debug, Default)]
pub(crate) struct CursorArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
}

impl CursorArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates a slot and returns its id.
    pub(crate) fn alloc(&mut self, slot: CursorSlot) -> CursorId {
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.slot = Some(slot);
            CursorId {
                slot: index,
                gen: entry.gen,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry { gen: 0, slot: Some(slot) });
            CursorId { slot: index, gen: 0 }
        }
    }

    /// Returns the slot behind `id`, if the id is still valid.
    pub(crate) fn get(&self, id: CursorId) -> Option<&CursorSlot> {
        let entry = self.entries.get(id.slot as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        entry.slot.as_ref()
    }

    /// Returns the slot behind `id`, mutably.
    pub(crate) fn get_mut(&mut self, id: CursorId) -> Option<&mut CursorSlot> {
        let entry = self.entries.get_mut(id.slot as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        entry.slot.as_mut()
    }

    /// Frees the slot behind `id` and returns its final state.
    pub(crate) fn remove(&mut self, id: CursorId) -> Option<CursorSlot> {
        let entry = self.entries.get_mut(id.slot as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        let slot = entry.slot.take()?;
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(id.slot);
        Some(slot)
    }

    /// Returns the ids of all live cursors.
    pub(crate) fn live_ids(&self) -> Vec<CursorId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.slot.is_some())
            .map(|(i, e)| CursorId {
                slot: i as u32,
                gen: e.gen,
            })
            .collect()
    }

    /// Returns the number of live cursors.
    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_get() {
        let mut arena = CursorArena::new();
        let id = arena.alloc(CursorSlot::new(None));
        assert!(arena.get(id).is_some());
        assert!(arena.get(id).unwrap().first_use);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn removed_id_is_invalid() {
        let mut arena = CursorArena::new();
        let id = arena.alloc(CursorSlot::new(None));
        arena.remove(id).unwrap();
        assert!(arena.get(id).is_none());
        assert_eq!(arena.len(), 0);
    }

    #[test]
    fn reused_slot_gets_fresh_generation() {
        let mut arena = CursorArena::new();
        let old = arena.alloc(CursorSlot::new(None));
        arena.remove(old).unwrap();
        let new = arena.alloc(CursorSlot::new(None));
        assert_eq!(old.slot, new.slot);
        assert_ne!(old.gen, new.gen);
        assert!(arena.get(old).is_none());
        assert!(arena.get(new).is_some());
    }

    #[test]
    fn live_ids_lists_open_cursors() {
        let mut arena = CursorArena::new();
        let a = arena.alloc(CursorSlot::new(None));
        let b = arena.alloc(CursorSlot::new(None));
        arena.remove(a).unwrap();
        assert_eq!(arena.live_ids(), vec![b]);
    }

    #[test]
    fn nil_states() {
        let mut slot = CursorSlot::new(None);
        assert!(slot.is_nil());
        slot.coupling = Coupling::Btree;
        assert!(slot.is_nil());
        slot.btree_pos = Some(crate::btree::BtreePos {
            key: b"k".to_vec(),
            dupe: 0,
        });
        assert!(!slot.is_nil());
        slot.nil_btree_side();
        assert!(slot.is_nil());
        assert_eq!(slot.coupling, Coupling::Nil);
    }
}
