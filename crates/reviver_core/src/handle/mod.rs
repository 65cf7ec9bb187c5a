//! Pooled, configured handles.
//!
//! A [`DatabaseRegistry`] owns one [`HandlePool`] per database path. Pools
//! hand out [`RecyclableHandle`]s that carry a [`Configs`] chain and go
//! back to the pool when dropped.

mod config;
mod configured;
mod connection;
mod pool;
mod recyclable;
mod registry;

pub use config::{
    Configs, HandleConfig, JournalMode, Synchronous, PRIORITY_DEFAULT, PRIORITY_HIGH, PRIORITY_LOW,
};
pub use configured::ConfiguredHandle;
pub use connection::{Checkpoint, CheckpointMode, Handle};
pub use pool::{HandleId, HandlePool, RecyclableHandle};
pub use recyclable::Recyclable;
pub use registry::{DatabaseRegistry, RecyclableDatabase};
