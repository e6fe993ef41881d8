//! The persistent B-tree index.
//!
//! An ordered map from keys to duplicate lists, organized as a sorted
//! sequence of leaves sized by the configured page capacity. The
//! transactional overlay consults it whenever a query cannot be
//! resolved from the in-memory operation logs, and committed
//! operations are flushed into it.

use crate::error::{Error, Result};
use crate::types::{DuplicatePosition, EraseFlags, FindFlags, InsertFlags};
use std::cmp::Ordering;

/// Visitor invoked by full-table scans.
pub trait ScanVisitor {
    /// Called once per key in key order.
    fn visit(&mut self, key: &[u8], record_count: u64);
}

/// A coupled B-tree position: a key plus the addressed duplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreePos {
    /// The key the cursor points at.
    pub key: Vec<u8>,
    /// The 0-based duplicate index within the key.
    pub dupe: u32,
}

/// The result of a B-tree lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreeMatch {
    /// The key that was found.
    pub key: Vec<u8>,
    /// The first record stored under the key.
    pub record: Vec<u8>,
    /// True if the key is a neighbor of the requested key.
    pub approximate: bool,
}

#[derive(Debug, Clone)]
struct LeafEntry {
    key: Vec<u8>,
    records: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Clone)]
struct Leaf {
    entries: Vec<LeafEntry>,
}

/// The ordered, paged index.
#[derive(Debug)]
pub struct BtreeIndex {
    leaves: Vec<Leaf>,
    max_keys_per_leaf: usize,
}

struct SearchPos {
    leaf: usize,
    slot: usize,
    found: bool,
}

impl BtreeIndex {
    /// Creates an empty index whose leaves hold up to
    /// `max_keys_per_leaf` keys.
    #[must_use]
    pub fn new(max_keys_per_leaf: usize) -> Self {
        Self {
            leaves: Vec::new(),
            max_keys_per_leaf: max_keys_per_leaf.max(2),
        }
    }

    /// Compares two keys.
    ///
    /// Keys are unsigned byte strings; fixed-width integer keys are
    /// big-endian encoded, so this single comparator is shared by the
    /// index and the transactional overlay.
    #[must_use]
    pub fn compare_keys(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    /// Returns the leaf capacity, reported as max-keys-per-page.
    #[must_use]
    pub fn max_keys_per_leaf(&self) -> usize {
        self.max_keys_per_leaf
    }

    /// Returns true if the index holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    fn search(&self, key: &[u8]) -> SearchPos {
        if self.leaves.is_empty() {
            return SearchPos {
                leaf: 0,
                slot: 0,
                found: false,
            };
        }
        // first leaf whose last key is >= key; keys beyond every leaf
        // land at the end of the last leaf
        let leaf = self
            .leaves
            .partition_point(|l| l.entries.last().is_some_and(|e| e.key.as_slice() < key));
        if leaf == self.leaves.len() {
            return SearchPos {
                leaf: leaf - 1,
                slot: self.leaves[leaf - 1].entries.len(),
                found: false,
            };
        }
        match self.leaves[leaf]
            .entries
            .binary_search_by(|e| Self::compare_keys(&e.key, key))
        {
            Ok(slot) => SearchPos {
                leaf,
                slot,
                found: true,
            },
            Err(slot) => SearchPos {
                leaf,
                slot,
                found: false,
            },
        }
    }

    fn entry(&self, key: &[u8]) -> Option<&LeafEntry> {
        let pos = self.search(key);
        if pos.found {
            Some(&self.leaves[pos.leaf].entries[pos.slot])
        } else {
            None
        }
    }

    /// Looks up `key` under the given match flags.
    ///
    /// With a direction flag the nearest neighbor is returned and
    /// marked approximate; `exact` combined with a direction accepts
    /// the key itself first.
    pub fn find(&self, key: &[u8], flags: FindFlags) -> Result<BtreeMatch> {
        let pos = self.search(key);
        let exact = flags.exact || !flags.is_approximate();
        if pos.found && exact {
            let entry = &self.leaves[pos.leaf].entries[pos.slot];
            return Ok(BtreeMatch {
                key: entry.key.clone(),
                record: entry.records[0].clone(),
                approximate: false,
            });
        }
        if flags.gt {
            if let Some(entry) = self.neighbor_after(&pos, key) {
                return Ok(BtreeMatch {
                    key: entry.key.clone(),
                    record: entry.records[0].clone(),
                    approximate: true,
                });
            }
        } else if flags.lt {
            if let Some(entry) = self.neighbor_before(&pos) {
                return Ok(BtreeMatch {
                    key: entry.key.clone(),
                    record: entry.records[0].clone(),
                    approximate: true,
                });
            }
        }
        Err(Error::KeyNotFound)
    }

    fn neighbor_after(&self, pos: &SearchPos, key: &[u8]) -> Option<&LeafEntry> {
        let mut leaf = pos.leaf;
        let mut slot = pos.slot;
        if pos.found {
            slot += 1;
        }
        loop {
            match self.leaves.get(leaf) {
                None => return None,
                Some(l) => match l.entries.get(slot) {
                    Some(entry) if entry.key.as_slice() > key => return Some(entry),
                    Some(_) => slot += 1,
                    None => {
                        leaf += 1;
                        slot = 0;
                    }
                },
            }
        }
    }

    fn neighbor_before(&self, pos: &SearchPos) -> Option<&LeafEntry> {
        let mut leaf = pos.leaf;
        let mut slot = pos.slot;
        loop {
            if slot > 0 {
                return Some(&self.leaves[leaf].entries[slot - 1]);
            }
            if leaf == 0 {
                return None;
            }
            leaf -= 1;
            slot = self.leaves[leaf].entries.len();
        }
    }

    /// Inserts `record` under `key`.
    ///
    /// `ref_dupe` is the 1-based duplicate the initiating cursor points
    /// at; it anchors `Before`/`After` placement and selects the record
    /// replaced by an overwrite. Returns the coupled position.
    pub fn insert(
        &mut self,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
        ref_dupe: u32,
    ) -> Result<BtreePos> {
        let pos = self.search(key);
        if pos.found {
            let entry = &mut self.leaves[pos.leaf].entries[pos.slot];
            if flags.duplicate {
                let at = match flags.position {
                    DuplicatePosition::First => 0,
                    DuplicatePosition::Last => entry.records.len(),
                    DuplicatePosition::Before => ref_dupe.saturating_sub(1) as usize,
                    DuplicatePosition::After => ref_dupe as usize,
                };
                let at = at.min(entry.records.len());
                entry.records.insert(at, record.to_vec());
                return Ok(BtreePos {
                    key: key.to_vec(),
                    dupe: at as u32,
                });
            }
            if flags.overwrite {
                let at = if ref_dupe > 0 {
                    (ref_dupe as usize - 1).min(entry.records.len() - 1)
                } else {
                    0
                };
                entry.records[at] = record.to_vec();
                return Ok(BtreePos {
                    key: key.to_vec(),
                    dupe: at as u32,
                });
            }
            return Err(Error::DuplicateKey);
        }

        let entry = LeafEntry {
            key: key.to_vec(),
            records: vec![record.to_vec()],
        };
        if self.leaves.is_empty() {
            self.leaves.push(Leaf::default());
        }
        self.leaves[pos.leaf].entries.insert(pos.slot, entry);
        if self.leaves[pos.leaf].entries.len() > self.max_keys_per_leaf {
            self.split_leaf(pos.leaf);
        }
        Ok(BtreePos {
            key: key.to_vec(),
            dupe: 0,
        })
    }

    fn split_leaf(&mut self, leaf: usize) {
        let half = self.leaves[leaf].entries.len() / 2;
        let tail = self.leaves[leaf].entries.split_off(half);
        self.leaves.insert(leaf + 1, Leaf { entries: tail });
    }

    /// Erases `key`, or one of its duplicates.
    ///
    /// `dupe` is 1-based; 0 removes the whole key, as does
    /// `all_duplicates`. Removing the last duplicate removes the key.
    pub fn erase(&mut self, key: &[u8], dupe: u32, flags: EraseFlags) -> Result<()> {
        let pos = self.search(key);
        if !pos.found {
            return Err(Error::KeyNotFound);
        }
        let entry = &mut self.leaves[pos.leaf].entries[pos.slot];
        if flags.all_duplicates || dupe == 0 {
            self.leaves[pos.leaf].entries.remove(pos.slot);
        } else {
            let at = dupe as usize - 1;
            if at >= entry.records.len() {
                return Err(Error::KeyNotFound);
            }
            entry.records.remove(at);
            if entry.records.is_empty() {
                self.leaves[pos.leaf].entries.remove(pos.slot);
            }
        }
        if self.leaves[pos.leaf].entries.is_empty() {
            self.leaves.remove(pos.leaf);
        }
        Ok(())
    }

    /// Returns true if the key exists.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.search(key).found
    }

    /// Returns the number of duplicates stored under `key`, 0 if the
    /// key does not exist.
    #[must_use]
    pub fn dupe_count(&self, key: &[u8]) -> u32 {
        self.entry(key).map_or(0, |e| e.records.len() as u32)
    }

    /// Returns the record at 0-based duplicate index `dupe` of `key`.
    #[must_use]
    pub fn record(&self, key: &[u8], dupe: u32) -> Option<Vec<u8>> {
        self.entry(key)
            .and_then(|e| e.records.get(dupe as usize))
            .cloned()
    }

    /// Returns the number of keys (`distinct`) or records.
    #[must_use]
    pub fn count(&self, distinct: bool) -> u64 {
        self.leaves
            .iter()
            .flat_map(|l| l.entries.iter())
            .map(|e| if distinct { 1 } else { e.records.len() as u64 })
            .sum()
    }

    /// Returns the smallest key.
    #[must_use]
    pub fn first_key(&self) -> Option<Vec<u8>> {
        self.leaves
            .first()
            .and_then(|l| l.entries.first())
            .map(|e| e.key.clone())
    }

    /// Returns the largest key.
    #[must_use]
    pub fn last_key(&self) -> Option<Vec<u8>> {
        self.leaves
            .last()
            .and_then(|l| l.entries.last())
            .map(|e| e.key.clone())
    }

    /// Returns the smallest key strictly greater than `key`.
    #[must_use]
    pub fn next_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        let pos = self.search(key);
        self.neighbor_after(&pos, key).map(|e| e.key.clone())
    }

    /// Returns the largest key strictly smaller than `key`.
    #[must_use]
    pub fn prev_key(&self, key: &[u8]) -> Option<Vec<u8>> {
        let pos = self.search(key);
        self.neighbor_before(&pos).map(|e| e.key.clone())
    }

    /// Returns the index of the leaf holding `key`, if the key exists.
    #[must_use]
    pub fn leaf_of(&self, key: &[u8]) -> Option<usize> {
        self.slot_of(key).map(|(leaf, _)| leaf)
    }

    /// Returns the leaf and slot of `key`, if the key exists.
    #[must_use]
    pub fn slot_of(&self, key: &[u8]) -> Option<(usize, usize)> {
        let pos = self.search(key);
        pos.found.then_some((pos.leaf, pos.slot))
    }

    /// Returns the first and last key of a leaf.
    #[must_use]
    pub fn leaf_bounds(&self, leaf: usize) -> Option<(Vec<u8>, Vec<u8>)> {
        let l = self.leaves.get(leaf)?;
        let first = l.entries.first()?;
        let last = l.entries.last()?;
        Some((first.key.clone(), last.key.clone()))
    }

    /// Visits every key of one leaf, starting at `start_slot`.
    pub fn scan_leaf(
        &self,
        leaf: usize,
        start_slot: usize,
        distinct: bool,
        visitor: &mut dyn ScanVisitor,
    ) {
        if let Some(l) = self.leaves.get(leaf) {
            for entry in l.entries.iter().skip(start_slot) {
                let count = if distinct { entry.records.len() as u64 } else { 1 };
                visitor.visit(&entry.key, count);
            }
        }
    }

    /// Returns the number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Drops all keys and leaves.
    pub fn release(&mut self) {
        self.leaves.clear();
    }

    /// Validates leaf ordering and sizing.
    pub fn check_integrity(&self) -> Result<()> {
        let mut prev: Option<&[u8]> = None;
        for (i, leaf) in self.leaves.iter().enumerate() {
            if leaf.entries.is_empty() {
                return Err(Error::integrity(format!("leaf {i} is empty")));
            }
            if leaf.entries.len() > self.max_keys_per_leaf {
                return Err(Error::integrity(format!("leaf {i} overflows its page")));
            }
            for entry in &leaf.entries {
                if entry.records.is_empty() {
                    return Err(Error::integrity("key without records"));
                }
                if let Some(p) = prev {
                    if Self::compare_keys(p, &entry.key) != Ordering::Less {
                        return Err(Error::integrity("keys out of order"));
                    }
                }
                prev = Some(&entry.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_index() -> BtreeIndex {
        BtreeIndex::new(4)
    }

    fn filled_index() -> BtreeIndex {
        let mut index = create_index();
        for k in [b"b", b"d", b"f", b"h", b"j", b"l", b"n"] {
            index.insert(k, b"r", InsertFlags::new(), 0).unwrap();
        }
        index
    }

    #[test]
    fn insert_and_find_exact() {
        let mut index = create_index();
        index.insert(b"key", b"value", InsertFlags::new(), 0).unwrap();
        let m = index.find(b"key", FindFlags::exact()).unwrap();
        assert_eq!(m.key, b"key");
        assert_eq!(m.record, b"value");
        assert!(!m.approximate);
    }

    #[test]
    fn duplicate_insert_without_flag_fails() {
        let mut index = create_index();
        index.insert(b"key", b"v1", InsertFlags::new(), 0).unwrap();
        assert!(matches!(
            index.insert(b"key", b"v2", InsertFlags::new(), 0),
            Err(Error::DuplicateKey)
        ));
    }

    #[test]
    fn overwrite_replaces_record() {
        let mut index = create_index();
        index.insert(b"key", b"v1", InsertFlags::new(), 0).unwrap();
        index.insert(b"key", b"v2", InsertFlags::overwrite(), 0).unwrap();
        let m = index.find(b"key", FindFlags::exact()).unwrap();
        assert_eq!(m.record, b"v2");
        assert_eq!(index.count(false), 1);
    }

    #[test]
    fn gt_and_lt_matches() {
        let index = filled_index();
        let m = index.find(b"e", FindFlags::gt_match()).unwrap();
        assert_eq!(m.key, b"f");
        assert!(m.approximate);

        let m = index.find(b"e", FindFlags::lt_match()).unwrap();
        assert_eq!(m.key, b"d");
        assert!(m.approximate);
    }

    #[test]
    fn strict_direction_skips_exact_hit() {
        let index = filled_index();
        let m = index.find(b"f", FindFlags::gt_match()).unwrap();
        assert_eq!(m.key, b"h");
        let m = index.find(b"f", FindFlags::lt_match()).unwrap();
        assert_eq!(m.key, b"d");
    }

    #[test]
    fn geq_prefers_exact_hit() {
        let index = filled_index();
        let m = index.find(b"f", FindFlags::geq_match()).unwrap();
        assert_eq!(m.key, b"f");
        assert!(!m.approximate);

        let m = index.find(b"g", FindFlags::geq_match()).unwrap();
        assert_eq!(m.key, b"h");
        assert!(m.approximate);
    }

    #[test]
    fn no_neighbor_is_key_not_found() {
        let index = filled_index();
        assert!(matches!(
            index.find(b"a", FindFlags::lt_match()),
            Err(Error::KeyNotFound)
        ));
        assert!(matches!(
            index.find(b"z", FindFlags::gt_match()),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn duplicates_keep_insertion_order() {
        let mut index = create_index();
        index.insert(b"k", b"v1", InsertFlags::duplicate(), 0).unwrap();
        index.insert(b"k", b"v2", InsertFlags::duplicate(), 0).unwrap();
        index
            .insert(
                b"k",
                b"v0",
                InsertFlags::duplicate_at(DuplicatePosition::First),
                0,
            )
            .unwrap();
        assert_eq!(index.dupe_count(b"k"), 3);
        assert_eq!(index.record(b"k", 0).unwrap(), b"v0");
        assert_eq!(index.record(b"k", 1).unwrap(), b"v1");
        assert_eq!(index.record(b"k", 2).unwrap(), b"v2");
    }

    #[test]
    fn duplicate_before_and_after_anchor_on_ref() {
        let mut index = create_index();
        index.insert(b"k", b"v1", InsertFlags::duplicate(), 0).unwrap();
        index.insert(b"k", b"v3", InsertFlags::duplicate(), 0).unwrap();
        // before the second duplicate
        index
            .insert(
                b"k",
                b"v2",
                InsertFlags::duplicate_at(DuplicatePosition::Before),
                2,
            )
            .unwrap();
        assert_eq!(index.record(b"k", 1).unwrap(), b"v2");
        // after the third duplicate
        index
            .insert(
                b"k",
                b"v4",
                InsertFlags::duplicate_at(DuplicatePosition::After),
                3,
            )
            .unwrap();
        assert_eq!(index.record(b"k", 3).unwrap(), b"v4");
    }

    #[test]
    fn erase_single_duplicate() {
        let mut index = create_index();
        index.insert(b"k", b"v1", InsertFlags::duplicate(), 0).unwrap();
        index.insert(b"k", b"v2", InsertFlags::duplicate(), 0).unwrap();
        index.erase(b"k", 1, EraseFlags::new()).unwrap();
        assert_eq!(index.dupe_count(b"k"), 1);
        assert_eq!(index.record(b"k", 0).unwrap(), b"v2");
    }

    #[test]
    fn erase_last_duplicate_removes_key() {
        let mut index = create_index();
        index.insert(b"k", b"v1", InsertFlags::new(), 0).unwrap();
        index.erase(b"k", 1, EraseFlags::new()).unwrap();
        assert!(!index.contains(b"k"));
        assert!(index.is_empty());
    }

    #[test]
    fn erase_all_duplicates() {
        let mut index = create_index();
        for v in [b"v1", b"v2", b"v3"] {
            index.insert(b"k", v, InsertFlags::duplicate(), 0).unwrap();
        }
        index.erase(b"k", 0, EraseFlags::all_duplicates()).unwrap();
        assert!(!index.contains(b"k"));
    }

    #[test]
    fn erase_missing_key_fails() {
        let mut index = create_index();
        assert!(matches!(
            index.erase(b"nope", 0, EraseFlags::new()),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn leaves_split_on_overflow() {
        let index = filled_index();
        assert!(index.leaf_count() > 1);
        index.check_integrity().unwrap();
        // all keys still reachable
        for k in [b"b", b"d", b"f", b"h", b"j", b"l", b"n"] {
            assert!(index.contains(k));
        }
    }

    #[test]
    fn key_navigation() {
        let index = filled_index();
        assert_eq!(index.first_key().unwrap(), b"b");
        assert_eq!(index.last_key().unwrap(), b"n");
        assert_eq!(index.next_key(b"b").unwrap(), b"d");
        assert_eq!(index.prev_key(b"d").unwrap(), b"b");
        assert!(index.next_key(b"n").is_none());
        assert!(index.prev_key(b"b").is_none());
    }

    #[test]
    fn count_distinct_and_total() {
        let mut index = create_index();
        index.insert(b"a", b"v", InsertFlags::new(), 0).unwrap();
        index.insert(b"b", b"v1", InsertFlags::duplicate(), 0).unwrap();
        index.insert(b"b", b"v2", InsertFlags::duplicate(), 0).unwrap();
        assert_eq!(index.count(true), 2);
        assert_eq!(index.count(false), 3);
    }

    #[test]
    fn scan_leaf_visits_in_order() {
        struct Collect(Vec<Vec<u8>>);
        impl ScanVisitor for Collect {
            fn visit(&mut self, key: &[u8], _record_count: u64) {
                self.0.push(key.to_vec());
            }
        }

        let index = filled_index();
        let mut collect = Collect(Vec::new());
        for leaf in 0..index.leaf_count() {
            index.scan_leaf(leaf, 0, false, &mut collect);
        }
        let expected: Vec<Vec<u8>> = [b"b", b"d", b"f", b"h", b"j", b"l", b"n"]
            .iter()
            .map(|k| k.to_vec())
            .collect();
        assert_eq!(collect.0, expected);
    }

    #[test]
    fn release_drops_everything() {
        let mut index = filled_index();
        index.release();
        assert!(index.is_empty());
        assert_eq!(index.count(true), 0);
    }
}
