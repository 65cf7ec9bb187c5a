//! # Reviver Core
//!
//! Corruption repair, handle pooling and background maintenance for
//! SQLite databases.
//!
//! This crate provides:
//! - Raw page recovery of damaged databases ([`repair`])
//! - Materials: schema and page-hash backups that guide later repairs
//! - Layered read/write locks between backups, repairs and checkpoints
//! - Pools of configured, recyclable handles per database ([`handle`])
//! - Background migration, checkpoint and backup queues ([`queue`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use reviver_core::{Core, CoreConfig};
//! use std::path::Path;
//!
//! let core = Core::new(CoreConfig::default());
//! let path = Path::new("app.db");
//! core.backup(path).unwrap();
//!
//! let result = core.repair(path, Path::new("app.recovered.db"), None);
//! println!("recovered {} tables, score {:.2}", result.recovered_table_count, result.score);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod instance;
mod migration;
mod progress;

pub mod handle;
pub mod lock;
pub mod queue;
pub mod repair;
pub mod threaded_error;

pub use config::{CoreConfig, RepairConfig};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use instance::Core;
pub use migration::{Migration, MigrationInfo, MigrationStep};
pub use progress::{Cancellation, Progress, ProgressCallback};
pub use repair::{RepairError, RepairResult, Repairman};
pub use threaded_error::ThreadedError;
