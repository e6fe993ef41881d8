//! Core type definitions for GraftDB.

use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction ids are monotonically increasing and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Log sequence number.
///
/// Every transactional operation carries an LSN; LSNs are strictly
/// increasing across the whole environment and define the total order
/// used by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Creates a new LSN.
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw LSN value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Declared type of the database's keys.
///
/// Fixed-width integer keys are encoded big-endian so that the byte
/// comparator and numeric order coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    /// Variable-length byte strings.
    #[default]
    Binary,
    /// Unsigned 8-bit integers.
    UInt8,
    /// Unsigned 16-bit integers.
    UInt16,
    /// Unsigned 32-bit integers.
    UInt32,
    /// Unsigned 64-bit integers.
    UInt64,
}

impl KeyType {
    /// Returns the forced key size of a fixed-width type.
    #[must_use]
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::Binary => None,
            Self::UInt8 => Some(1),
            Self::UInt16 => Some(2),
            Self::UInt32 => Some(4),
            Self::UInt64 => Some(8),
        }
    }

    /// Returns a numeric discriminant for parameter reporting.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        match self {
            Self::Binary => 0,
            Self::UInt8 => 1,
            Self::UInt16 => 2,
            Self::UInt32 => 3,
            Self::UInt64 => 4,
        }
    }
}

/// Automatic record-number key assignment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordNumber {
    /// Keys are supplied by the caller.
    #[default]
    Disabled,
    /// 32-bit monotonically increasing keys.
    Recno32,
    /// 64-bit monotonically increasing keys.
    Recno64,
}

impl RecordNumber {
    /// Returns the key width in bytes, if enabled.
    #[must_use]
    pub const fn key_size(self) -> Option<usize> {
        match self {
            Self::Disabled => None,
            Self::Recno32 => Some(4),
            Self::Recno64 => Some(8),
        }
    }
}

/// Where a duplicate insert places the new record within the
/// duplicate list of its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePosition {
    /// Append after all existing duplicates.
    #[default]
    Last,
    /// Insert before all existing duplicates.
    First,
    /// Insert before the duplicate the initiating cursor points at.
    Before,
    /// Insert after the duplicate the initiating cursor points at.
    After,
}

/// Options for insert operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertFlags {
    /// Replace the record if the key already exists.
    pub overwrite: bool,
    /// Add another record under the same key.
    pub duplicate: bool,
    /// Placement of a duplicate insert.
    pub position: DuplicatePosition,
    /// The record is a partial write; carried through to the journal.
    pub partial: bool,
}

const BIT_OVERWRITE: u32 = 0x0001;
const BIT_DUPLICATE: u32 = 0x0002;
const BIT_DUP_FIRST: u32 = 0x0004;
const BIT_DUP_BEFORE: u32 = 0x0008;
const BIT_DUP_AFTER: u32 = 0x0010;
const BIT_PARTIAL: u32 = 0x0020;
const BIT_ERASE_ALL_DUPLICATES: u32 = 0x0001;

impl InsertFlags {
    /// Plain insert, failing on an existing key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert that overwrites an existing record.
    #[must_use]
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            ..Self::default()
        }
    }

    /// Insert that adds a duplicate record.
    #[must_use]
    pub fn duplicate() -> Self {
        Self {
            duplicate: true,
            ..Self::default()
        }
    }

    /// Duplicate insert at an explicit position.
    #[must_use]
    pub fn duplicate_at(position: DuplicatePosition) -> Self {
        Self {
            duplicate: true,
            position,
            ..Self::default()
        }
    }

    /// Encodes the flags for the journal.
    #[must_use]
    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.overwrite {
            bits |= BIT_OVERWRITE;
        }
        if self.duplicate {
            bits |= BIT_DUPLICATE;
        }
        match self.position {
            DuplicatePosition::Last => {}
            DuplicatePosition::First => bits |= BIT_DUP_FIRST,
            DuplicatePosition::Before => bits |= BIT_DUP_BEFORE,
            DuplicatePosition::After => bits |= BIT_DUP_AFTER,
        }
        if self.partial {
            bits |= BIT_PARTIAL;
        }
        bits
    }

    /// Decodes flags from their journal representation.
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        let position = if bits & BIT_DUP_FIRST != 0 {
            DuplicatePosition::First
        } else if bits & BIT_DUP_BEFORE != 0 {
            DuplicatePosition::Before
        } else if bits & BIT_DUP_AFTER != 0 {
            DuplicatePosition::After
        } else {
            DuplicatePosition::Last
        };
        Self {
            overwrite: bits & BIT_OVERWRITE != 0,
            duplicate: bits & BIT_DUPLICATE != 0,
            position,
            partial: bits & BIT_PARTIAL != 0,
        }
    }
}

/// Options for lookup operations.
///
/// At most one of `lt` and `gt` may be set; combined with `exact` they
/// express less-or-equal and greater-or-equal lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FindFlags {
    /// Accept the key itself.
    pub exact: bool,
    /// Accept the nearest smaller key.
    pub lt: bool,
    /// Accept the nearest greater key.
    pub gt: bool,
}

impl FindFlags {
    /// Exact-match lookup.
    #[must_use]
    pub fn exact() -> Self {
        Self {
            exact: true,
            ..Self::default()
        }
    }

    /// Strictly-less lookup.
    #[must_use]
    pub fn lt_match() -> Self {
        Self {
            lt: true,
            ..Self::default()
        }
    }

    /// Strictly-greater lookup.
    #[must_use]
    pub fn gt_match() -> Self {
        Self {
            gt: true,
            ..Self::default()
        }
    }

    /// Less-or-equal lookup.
    #[must_use]
    pub fn leq_match() -> Self {
        Self {
            exact: true,
            lt: true,
            gt: false,
        }
    }

    /// Greater-or-equal lookup.
    #[must_use]
    pub fn geq_match() -> Self {
        Self {
            exact: true,
            lt: false,
            gt: true,
        }
    }

    /// Returns true if a direction bit is set.
    #[must_use]
    pub fn is_approximate(self) -> bool {
        self.lt || self.gt
    }
}

/// Options for erase operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseFlags {
    /// Remove all duplicates of the key, not a single one.
    pub all_duplicates: bool,
}

impl EraseFlags {
    /// Erase of a single record (or the whole key when it has no
    /// duplicates).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Erase of the key with all its duplicates.
    #[must_use]
    pub fn all_duplicates() -> Self {
        Self {
            all_duplicates: true,
        }
    }

    /// Encodes the flags for the journal.
    #[must_use]
    pub fn to_bits(self) -> u32 {
        if self.all_duplicates {
            BIT_ERASE_ALL_DUPLICATES
        } else {
            0
        }
    }

    /// Decodes flags from their journal representation.
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        Self {
            all_duplicates: bits & BIT_ERASE_ALL_DUPLICATES != 0,
        }
    }
}

/// Direction of a cursor movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    /// Move to the first key.
    First,
    /// Move to the last key.
    Last,
    /// Move to the next key (or next duplicate).
    Next,
    /// Move to the previous key (or previous duplicate).
    Previous,
}

/// The result of a successful lookup or cursor movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// The key that was found.
    pub key: Vec<u8>,
    /// The record stored under the key (the addressed duplicate).
    pub record: Vec<u8>,
    /// True if the key is a nearest match, not the requested key.
    pub approximate: bool,
}
