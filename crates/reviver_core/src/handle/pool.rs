//! Bounded pool of configured handles for one database.
//!
//! Handles live in an arena of slots. A slot is free, idle (holding its
//! handle) or checked out (its handle is with a caller). Every handle
//! leaves the pool tagged with its slot index and the slot's generation;
//! [`HandlePool::purge`] and [`HandlePool::close`] bump generations, so a
//! handle coming back with a stale tag is closed instead of reused.
//!
//! All state changes happen under one mutex, including opening and
//! configuring new handles, so two callers never race on construction and
//! no handle is ever given to two callers.

use crate::error::{CoreError, CoreResult};
use crate::handle::config::Configs;
use crate::handle::configured::ConfiguredHandle;
use crate::handle::connection::Handle;
use crate::handle::recyclable::Recyclable;
use crate::handle::registry::RecyclableDatabase;
use crate::threaded_error;
use parking_lot::Mutex;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Identifies a checked-out handle within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: usize,
    generation: u32,
}

impl HandleId {
    /// Returns the slot index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.index
    }

    /// Returns the slot generation at checkout.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
enum SlotState {
    Free,
    Idle(ConfiguredHandle),
    CheckedOut,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    state: SlotState,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
    idle: Vec<usize>,
    free: Vec<usize>,
    checked_out: usize,
    closed: bool,
}

impl PoolState {
    fn allocate(&mut self) -> usize {
        match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    state: SlotState::Free,
                });
                self.slots.len() - 1
            }
        }
    }

    fn release_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = SlotState::Free;
        self.free.push(index);
    }

    /// Frees idle slots and invalidates checked-out ones. Returns the idle
    /// handles for closing outside the lock.
    fn purge(&mut self) -> Vec<ConfiguredHandle> {
        let mut closing = Vec::new();
        for index in std::mem::take(&mut self.idle) {
            let slot = &mut self.slots[index];
            if let SlotState::Idle(handle) = std::mem::replace(&mut slot.state, SlotState::Free) {
                closing.push(handle);
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index);
        }
        for slot in &mut self.slots {
            if matches!(slot.state, SlotState::CheckedOut) {
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        closing
    }
}

/// Pool of handles to one database.
pub struct HandlePool {
    path: PathBuf,
    max_handles: usize,
    state: Mutex<PoolState>,
}

impl HandlePool {
    /// Creates an empty pool for `path` allowing `max_handles` handles.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_handles: usize) -> Self {
        Self {
            path: path.into(),
            max_handles,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Returns the database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the maximum number of handles.
    #[must_use]
    pub fn max_handles(&self) -> usize {
        self.max_handles
    }

    /// Returns the number of handles currently with callers.
    #[must_use]
    pub fn checked_out(&self) -> usize {
        self.state.lock().checked_out
    }

    /// Returns the number of idle handles.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Returns true once [`HandlePool::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Checks out a handle configured with `configs`.
    ///
    /// An idle handle already running `configs` is preferred; any other
    /// idle handle is reconfigured; otherwise a new handle is opened.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PoolClosed`] after close,
    /// [`CoreError::PoolExhausted`] when `max_handles` handles exist and
    /// none is idle, and open or configuration errors. Failures are also
    /// recorded in [`threaded_error`].
    pub fn acquire(self: &Arc<Self>, configs: &Configs) -> CoreResult<RecyclableHandle> {
        let result = self.checkout(configs);
        if let Err(error) = &result {
            threaded_error::record(&self.path, error);
        }
        let (id, handle) = result?;
        let pool = Arc::downgrade(self);
        Ok(RecyclableHandle {
            id,
            handle: Recyclable::new(handle, move |handle| recycle(&pool, id, handle)),
            database: None,
        })
    }

    fn checkout(&self, configs: &Configs) -> CoreResult<(HandleId, ConfiguredHandle)> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(CoreError::PoolClosed {
                path: self.path.clone(),
            });
        }

        let reusable = state
            .idle
            .iter()
            .rposition(|&index| match &state.slots[index].state {
                SlotState::Idle(handle) => handle.configs() == Some(configs),
                _ => false,
            })
            .or_else(|| state.idle.len().checked_sub(1));

        let (index, handle) = match reusable {
            Some(position) => {
                let index = state.idle.remove(position);
                let slot = &mut state.slots[index];
                let SlotState::Idle(mut handle) = std::mem::replace(&mut slot.state, SlotState::CheckedOut)
                else {
                    return Err(CoreError::invalid_operation("idle list points at a busy slot"));
                };
                if let Err(error) = handle.reconfigure(configs) {
                    state.release_slot(index);
                    drop(state);
                    close_handle(handle);
                    return Err(error);
                }
                (index, handle)
            }
            None => {
                if state.checked_out >= self.max_handles {
                    return Err(CoreError::PoolExhausted {
                        path: self.path.clone(),
                        max: self.max_handles,
                    });
                }
                let mut handle = ConfiguredHandle::new(Handle::open(&self.path)?);
                if let Err(error) = handle.reconfigure(configs) {
                    drop(state);
                    close_handle(handle);
                    return Err(error);
                }
                let index = state.allocate();
                state.slots[index].state = SlotState::CheckedOut;
                debug!(path = %self.path.display(), slot = index, "handle created");
                (index, handle)
            }
        };

        state.checked_out += 1;
        let id = HandleId {
            index,
            generation: state.slots[index].generation,
        };
        Ok((id, handle))
    }

    fn give_back(&self, id: HandleId, handle: ConfiguredHandle) {
        if let Err(error) = handle.rollback_if_needed() {
            warn!(path = %self.path.display(), error = %error, "returned handle cannot roll back");
        }

        let mut state = self.state.lock();
        state.checked_out = state.checked_out.saturating_sub(1);
        let Some(slot) = state.slots.get(id.index) else {
            drop(state);
            close_handle(handle);
            return;
        };
        let current = slot.generation == id.generation;
        let reusable = current && !state.closed && handle.is_configured() && !handle.is_in_transaction();
        if reusable {
            state.slots[id.index].state = SlotState::Idle(handle);
            state.idle.push(id.index);
            return;
        }
        if current {
            state.release_slot(id.index);
        } else if matches!(state.slots[id.index].state, SlotState::CheckedOut) {
            state.slots[id.index].state = SlotState::Free;
            state.free.push(id.index);
        }
        drop(state);
        close_handle(handle);
    }

    /// Closes every idle handle. Handles out with callers are closed when
    /// they come back.
    pub fn purge(&self) {
        let closing = self.state.lock().purge();
        if !closing.is_empty() {
            debug!(path = %self.path.display(), handles = closing.len(), "pool purged");
        }
        closing.into_iter().for_each(close_handle);
    }

    /// Closes the pool. Later acquisitions fail; returned handles are
    /// closed instead of recycled.
    pub fn close(&self) {
        let closing = {
            let mut state = self.state.lock();
            state.closed = true;
            state.purge()
        };
        info!(path = %self.path.display(), "pool closed");
        closing.into_iter().for_each(close_handle);
    }
}

impl Drop for HandlePool {
    fn drop(&mut self) {
        let closing = self.state.get_mut().purge();
        closing.into_iter().for_each(close_handle);
    }
}

impl std::fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HandlePool")
            .field("path", &self.path)
            .field("max_handles", &self.max_handles)
            .field("checked_out", &state.checked_out)
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .finish()
    }
}

fn recycle(pool: &Weak<HandlePool>, id: HandleId, handle: ConfiguredHandle) {
    match pool.upgrade() {
        Some(pool) => pool.give_back(id, handle),
        None => close_handle(handle),
    }
}

fn close_handle(handle: ConfiguredHandle) {
    let handle = handle.into_handle();
    let path = handle.path().to_path_buf();
    if let Err(error) = handle.close() {
        warn!(path = %path.display(), error = %error, "closing handle failed");
    }
}

/// A checked-out handle; returns to its pool on drop.
///
/// Any transaction still open on return is rolled back.
pub struct RecyclableHandle {
    id: HandleId,
    handle: Recyclable<ConfiguredHandle>,
    database: Option<RecyclableDatabase>,
}

impl RecyclableHandle {
    /// Returns the handle's pool slot.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Keeps `database` referenced until the handle is returned.
    pub(crate) fn hold(&mut self, database: RecyclableDatabase) {
        self.database = Some(database);
    }
}

impl Deref for RecyclableHandle {
    type Target = ConfiguredHandle;

    fn deref(&self) -> &ConfiguredHandle {
        &self.handle
    }
}

impl std::fmt::Debug for RecyclableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecyclableHandle")
            .field("id", &self.id)
            .field("path", &self.handle.path())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::handle::config::HandleConfig;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn pool(dir: &Path, max: usize) -> Arc<HandlePool> {
        Arc::new(HandlePool::new(dir.join("a.db"), max))
    }

    #[test]
    fn returned_handles_are_reused() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 4);
        let configs = Configs::new();

        let first = pool.acquire(&configs).unwrap().id();
        assert_eq!(pool.idle(), 1);
        let second = pool.acquire(&configs).unwrap();
        assert_eq!(second.id(), first);
        assert_eq!(pool.checked_out(), 1);
    }

    #[test]
    fn exhaustion_is_invalid_operation() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 2);
        let configs = Configs::new();
        let _a = pool.acquire(&configs).unwrap();
        let _b = pool.acquire(&configs).unwrap();

        let error = pool.acquire(&configs).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidOperation);
        assert_eq!(threaded_error::take().unwrap().kind, ErrorKind::InvalidOperation);
    }

    #[test]
    fn open_transaction_is_rolled_back_on_return() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 2);
        let configs = Configs::new();
        {
            let handle = pool.acquire(&configs).unwrap();
            handle
                .execute_batch("CREATE TABLE t(a); BEGIN; INSERT INTO t VALUES(1);")
                .unwrap();
        }
        let handle = pool.acquire(&configs).unwrap();
        assert!(!handle.is_in_transaction());
        let count: i64 = handle
            .connection()
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn failed_configuration_is_not_retained() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 2);
        let broken = Configs::new().with(HandleConfig::Custom {
            name: "broken".to_string(),
            invoke_sql: "NOT SQL".to_string(),
            uninvoke_sql: None,
        });

        assert_eq!(pool.acquire(&broken).unwrap_err().kind(), ErrorKind::Config);
        assert_eq!((pool.idle(), pool.checked_out()), (0, 0));

        drop(pool.acquire(&Configs::new()).unwrap());
        assert_eq!(pool.acquire(&broken).unwrap_err().kind(), ErrorKind::Config);
        assert_eq!((pool.idle(), pool.checked_out()), (0, 0));
    }

    #[test]
    fn idle_handle_with_matching_configs_is_preferred() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 4);
        let plain = Configs::new();
        let tuned = Configs::new().with(HandleConfig::BusyTimeout(Duration::from_millis(250)));

        let a = pool.acquire(&plain).unwrap();
        let b = pool.acquire(&tuned).unwrap();
        let tuned_id = b.id();
        drop(b);
        drop(a);

        let again = pool.acquire(&tuned).unwrap();
        assert_eq!(again.id(), tuned_id);
        assert_eq!(again.configs(), Some(&tuned));
    }

    #[test]
    fn handles_returned_after_close_are_closed() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 2);
        let handle = pool.acquire(&Configs::new()).unwrap();

        pool.close();
        assert_eq!(pool.acquire(&Configs::new()).unwrap_err().kind(), ErrorKind::InvalidOperation);
        drop(handle);
        assert_eq!((pool.idle(), pool.checked_out()), (0, 0));
    }

    #[test]
    fn purge_invalidates_checked_out_handles() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 2);
        let kept = pool.acquire(&Configs::new()).unwrap();
        drop(pool.acquire(&Configs::new()).unwrap());
        assert_eq!(pool.idle(), 1);

        pool.purge();
        assert_eq!(pool.idle(), 0);
        drop(kept);
        assert_eq!(pool.idle(), 0);
        assert!(pool.acquire(&Configs::new()).is_ok());
    }

    #[test]
    fn concurrent_acquires_never_share_a_handle() {
        let dir = tempdir().unwrap();
        let pool = pool(dir.path(), 8);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.acquire(&Configs::new()).map(|handle| (handle.id(), handle)))
            })
            .collect();
        let handles: Vec<_> = workers
            .into_iter()
            .map(|worker| worker.join().unwrap().unwrap())
            .collect();

        let ids: HashSet<usize> = handles.iter().map(|(id, _)| id.index()).collect();
        assert_eq!(ids.len(), 8);
        assert_eq!(pool.checked_out(), 8);
    }
}
