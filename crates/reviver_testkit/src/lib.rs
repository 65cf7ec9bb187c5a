//! # Reviver Testkit
//!
//! Test utilities for Reviver.
//!
//! This crate provides:
//! - Temporary databases and prebuilt scenarios
//! - Page-level damage helpers (zeroed pages, cyclic children, bit flips)
//! - Synthetic WAL and SHM files with controllable checksums
//! - Property-based generators using proptest
//! - Test logging and JSON repair reports
//!
//! ## Usage
//!
//! ```rust,ignore
//! use reviver_testkit::prelude::*;
//!
//! #[test]
//! fn repairs_lost_root() {
//!     let database = scenarios::many_tables(3, 10);
//!     zero_page(database.path(), database.root_page("t_01"));
//!     // ... run a repair into database.sibling("fixed.db")
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod corruption;
pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod report;
pub mod wal;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::corruption::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::report::*;
    pub use crate::wal::*;
}

pub use corruption::*;
pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use report::*;
pub use wal::*;
