//! Background work.
//!
//! - [`AsyncQueue`]: a named worker thread that runs one body at a time.
//! - [`TimedQueue`]: keyed deadlines with debounce semantics.
//! - [`OperationQueue`]: migration, checkpoint and backup scheduling on
//!   top of both.
//!
//! Workers wait on condition variables and never poll.

mod async_queue;
mod operation;
mod timed_queue;

pub use async_queue::{AsyncQueue, StopSignal};
pub use operation::{OperationEvent, OperationKind, OperationQueue};
pub use timed_queue::{Expired, Mode, TimedQueue};
