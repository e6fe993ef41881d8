//! # GraftDB Core
//!
//! An embedded, single-process key-value database. Writes land in an
//! in-memory, multi-version transactional overlay (per-key operation
//! logs) and are journaled for crash recovery; committed operations are
//! flushed into an ordered, paged B-tree index. Reads merge the overlay
//! with the B-tree so every transaction observes a consistent view.
//!
//! ## Example
//!
//! ```rust
//! use graftdb_core::{Config, Database, FindFlags, InsertFlags};
//!
//! let db = Database::create_in_memory(Config::new()).unwrap();
//!
//! let txn = db.begin().unwrap();
//! db.insert(Some(&txn), b"key", b"value", InsertFlags::new()).unwrap();
//! db.commit(txn).unwrap();
//!
//! let m = db.find(None, b"key", FindFlags::exact()).unwrap();
//! assert_eq!(m.record, b"value");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod btree;
mod changeset;
mod config;
mod cursor;
mod database;
mod error;
pub mod journal;
pub mod txn;
mod types;

pub use btree::{BtreeIndex, BtreeMatch, BtreePos, ScanVisitor};
pub use config::Config;
pub use cursor::Cursor;
pub use database::{Database, Parameter};
pub use error::{Error, Result};
pub use txn::Transaction;
pub use types::{
    CursorMove, DuplicatePosition, EraseFlags, FindFlags, InsertFlags, KeyType, Lsn, Match,
    RecordNumber, TransactionId,
};
