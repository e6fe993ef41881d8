//! Database configuration.

use crate::types::{KeyType, RecordNumber};

/// Default page size used to compute leaf capacity.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Records up to this size may be forced inline into leaves.
pub const INLINE_RECORD_THRESHOLD: usize = 32;

/// A page must hold at least this many fixed-size keys.
pub const MIN_KEYS_PER_PAGE: usize = 10;

/// Inline records require at least this many key/record pairs per page.
pub const MIN_INLINE_PAIRS_PER_PAGE: usize = 500;

/// Flag bit reported for enabled transactions.
pub const FLAG_ENABLE_TRANSACTIONS: u64 = 0x0001;
/// Flag bit reported for enabled recovery.
pub const FLAG_ENABLE_RECOVERY: u64 = 0x0002;
/// Flag bit reported for enabled duplicate keys.
pub const FLAG_ENABLE_DUPLICATE_KEYS: u64 = 0x0004;
/// Flag bit reported for 32-bit record-number keys.
pub const FLAG_RECORD_NUMBER32: u64 = 0x0008;
/// Flag bit reported for 64-bit record-number keys.
pub const FLAG_RECORD_NUMBER64: u64 = 0x0010;
/// Flag bit reported for inline record storage.
pub const FLAG_FORCE_RECORDS_INLINE: u64 = 0x0020;
/// Flag bit reported for a read-only handle.
pub const FLAG_READ_ONLY: u64 = 0x0040;
/// Flag bit reported for fsync-on-commit.
pub const FLAG_ENABLE_FSYNC: u64 = 0x0080;
/// Flag bit reported for automatic journal replay on open.
pub const FLAG_AUTO_RECOVERY: u64 = 0x0100;
/// Flag bit reported for an unlimited page cache.
pub const FLAG_CACHE_UNLIMITED: u64 = 0x0200;
/// Flag bit reported for disabled memory mapping.
pub const FLAG_DISABLE_MMAP: u64 = 0x0400;

/// Configuration for creating or opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Declared key type.
    pub key_type: KeyType,

    /// Fixed key size in bytes; `None` means variable-length keys.
    /// Forced by fixed-width key types and record-number modes.
    pub key_size: Option<usize>,

    /// Fixed record size in bytes; `None` means variable-length records.
    pub record_size: Option<usize>,

    /// Page size used to size B-tree leaves.
    pub page_size: usize,

    /// Database name, reported through `get_parameter`.
    pub name: u16,

    /// Route writes through the transactional overlay.
    pub enable_transactions: bool,

    /// Journal operations for crash recovery.
    pub enable_recovery: bool,

    /// Allow multiple records per key.
    pub enable_duplicate_keys: bool,

    /// Automatic record-number key assignment.
    pub record_number: RecordNumber,

    /// Reject all mutating operations.
    pub read_only: bool,

    /// Sync the journal after every commit.
    pub enable_fsync: bool,

    /// Replay the journal automatically on open. Reported through the
    /// flags word; opening a recovery-enabled database always replays.
    pub auto_recovery: bool,

    /// Never evict cached pages. A per-session hint with no effect on
    /// the stored data.
    pub cache_unlimited: bool,

    /// Do not memory-map the device. A per-session hint with no effect
    /// on the stored data.
    pub disable_mmap: bool,

    /// Store fixed-size records inline in leaves. Computed at create
    /// time from the sizing policy; persisted with the database.
    pub force_records_inline: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_type: KeyType::Binary,
            key_size: None,
            record_size: None,
            page_size: DEFAULT_PAGE_SIZE,
            name: 1,
            enable_transactions: true,
            enable_recovery: false,
            enable_duplicate_keys: false,
            record_number: RecordNumber::Disabled,
            read_only: false,
            enable_fsync: false,
            auto_recovery: false,
            cache_unlimited: false,
            disable_mmap: false,
            force_records_inline: false,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key type.
    #[must_use]
    pub const fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    /// Sets a fixed key size.
    #[must_use]
    pub const fn key_size(mut self, size: usize) -> Self {
        self.key_size = Some(size);
        self
    }

    /// Sets a fixed record size.
    #[must_use]
    pub const fn record_size(mut self, size: usize) -> Self {
        self.record_size = Some(size);
        self
    }

    /// Sets the page size.
    #[must_use]
    pub const fn page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the database name.
    #[must_use]
    pub const fn name(mut self, name: u16) -> Self {
        self.name = name;
        self
    }

    /// Enables or disables transactions.
    #[must_use]
    pub const fn enable_transactions(mut self, value: bool) -> Self {
        self.enable_transactions = value;
        self
    }

    /// Enables or disables recovery journaling.
    #[must_use]
    pub const fn enable_recovery(mut self, value: bool) -> Self {
        self.enable_recovery = value;
        self
    }

    /// Enables or disables duplicate keys.
    #[must_use]
    pub const fn enable_duplicate_keys(mut self, value: bool) -> Self {
        self.enable_duplicate_keys = value;
        self
    }

    /// Sets the record-number mode.
    #[must_use]
    pub const fn record_number(mut self, mode: RecordNumber) -> Self {
        self.record_number = mode;
        self
    }

    /// Marks the handle read-only.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Enables fsync-on-commit.
    #[must_use]
    pub const fn enable_fsync(mut self, value: bool) -> Self {
        self.enable_fsync = value;
        self
    }

    /// Enables automatic journal replay on open.
    #[must_use]
    pub const fn auto_recovery(mut self, value: bool) -> Self {
        self.auto_recovery = value;
        self
    }

    /// Returns the full run-time flags word.
    #[must_use]
    pub fn flags(&self) -> u64 {
        let mut flags = 0;
        if self.enable_transactions {
            flags |= FLAG_ENABLE_TRANSACTIONS;
        }
        if self.enable_recovery {
            flags |= FLAG_ENABLE_RECOVERY;
        }
        if self.enable_duplicate_keys {
            flags |= FLAG_ENABLE_DUPLICATE_KEYS;
        }
        match self.record_number {
            RecordNumber::Disabled => {}
            RecordNumber::Recno32 => flags |= FLAG_RECORD_NUMBER32,
            RecordNumber::Recno64 => flags |= FLAG_RECORD_NUMBER64,
        }
        if self.force_records_inline {
            flags |= FLAG_FORCE_RECORDS_INLINE;
        }
        if self.read_only {
            flags |= FLAG_READ_ONLY;
        }
        if self.enable_fsync {
            flags |= FLAG_ENABLE_FSYNC;
        }
        if self.auto_recovery {
            flags |= FLAG_AUTO_RECOVERY;
        }
        if self.cache_unlimited {
            flags |= FLAG_CACHE_UNLIMITED;
        }
        if self.disable_mmap {
            flags |= FLAG_DISABLE_MMAP;
        }
        flags
    }

    /// Returns the flags word with per-session bits stripped, the form
    /// stored with the database rather than the handle.
    #[must_use]
    pub fn persistent_flags(&self) -> u64 {
        self.flags()
            & !(FLAG_ENABLE_TRANSACTIONS
                | FLAG_ENABLE_RECOVERY
                | FLAG_AUTO_RECOVERY
                | FLAG_READ_ONLY
                | FLAG_ENABLE_FSYNC
                | FLAG_CACHE_UNLIMITED
                | FLAG_DISABLE_MMAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.enable_transactions);
        assert!(!config.enable_recovery);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.key_size, None);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .key_type(KeyType::UInt32)
            .record_size(8)
            .enable_recovery(true)
            .name(7);
        assert_eq!(config.key_type, KeyType::UInt32);
        assert_eq!(config.record_size, Some(8));
        assert!(config.enable_recovery);
        assert_eq!(config.name, 7);
    }

    #[test]
    fn persistent_flags_strip_session_bits() {
        let config = Config::new()
            .enable_transactions(true)
            .enable_recovery(true)
            .auto_recovery(true)
            .enable_fsync(true)
            .read_only(true)
            .enable_duplicate_keys(true);
        let persistent = config.persistent_flags();
        assert_eq!(persistent & FLAG_ENABLE_TRANSACTIONS, 0);
        assert_eq!(persistent & FLAG_ENABLE_RECOVERY, 0);
        assert_eq!(persistent & FLAG_AUTO_RECOVERY, 0);
        assert_eq!(persistent & FLAG_READ_ONLY, 0);
        assert_eq!(persistent & FLAG_ENABLE_FSYNC, 0);
        assert_ne!(persistent & FLAG_ENABLE_DUPLICATE_KEYS, 0);
    }
}
