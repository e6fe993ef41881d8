//! # GraftDB Storage
//!
//! Append-only storage backends for GraftDB.
//!
//! A backend is an opaque byte store with sequential appends and random
//! reads. The journal is the only consumer; all format interpretation
//! (record envelopes, checksums) happens above this crate.
//!
//! ## Available backends
//!
//! - [`MemoryBackend`] - for tests and ephemeral databases
//! - [`FileBackend`] - persistent storage via OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use graftdb_storage::{MemoryBackend, StorageBackend};
//!
//! let mut backend = MemoryBackend::new();
//! let offset = backend.append(b"hello world").unwrap();
//! let data = backend.read_at(offset, 11).unwrap();
//! assert_eq!(&data, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::MemoryBackend;
