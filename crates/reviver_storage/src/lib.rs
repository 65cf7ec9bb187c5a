//! # Reviver Storage
//!
//! Positioned byte I/O for Reviver.
//!
//! This crate is the lowest layer of the repair stack. Backends are
//! **opaque byte stores**: they read and write ranges of a file by offset
//! and never interpret the bytes. Page, WAL and SHM formats are owned by
//! `reviver_core`.
//!
//! ## Design Principles
//!
//! - Every read names its offset explicitly (no shared cursor)
//! - Short reads are explicit: [`StorageBackend::read_at`] fails,
//!   [`StorageBackend::read_up_to`] returns what is there
//! - Read-only backends refuse writes instead of silently opening for write
//! - Must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and synthetic files
//! - [`FileBackend`] - For real files using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use reviver_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.write_at(4, b"page").unwrap();
//! assert_eq!(backend.size().unwrap(), 8);
//! assert_eq!(&backend.read_at(4, 4).unwrap(), b"page");
//! assert_eq!(backend.read_up_to(6, 10).unwrap(), b"ge".to_vec());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, OpenMode};
pub use memory::InMemoryBackend;
