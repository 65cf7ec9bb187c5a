//! Exclusion between raw-page sessions and checkpoints.
//!
//! Locking is layered: an in-process reader/writer registry per path,
//! then the storage engine's own file locks. Both layers must be taken
//! before a backup or repair reads the live files.

mod backup_handle;
mod engine;
mod locker;
mod process;

pub use backup_handle::BackupHandle;
pub use engine::{HandleReadLocker, HandleWriteLocker};
pub use locker::{CompositeLocker, Locker};
pub use process::{PathLockRegistry, ProcessReadLocker, ProcessWriteLocker};
