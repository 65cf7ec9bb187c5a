//! Per-thread record of the last handle failure.
//!
//! When a pool fails to open or configure a handle, the error is returned
//! to the caller and also stored here. Layers that only propagate a
//! success flag can retrieve the detail afterwards on the same thread.

use crate::error::{CoreError, ErrorKind};
use std::cell::RefCell;
use std::path::{Path, PathBuf};

/// Detail of the most recent handle failure on this thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadedError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Rendered error message.
    pub message: String,
    /// Database path the failure relates to.
    pub path: PathBuf,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<ThreadedError>> = const { RefCell::new(None) };
}

/// Records `error` as the latest failure for this thread.
pub fn record(path: &Path, error: &CoreError) {
    let entry = ThreadedError {
        kind: error.kind(),
        message: error.to_string(),
        path: path.to_path_buf(),
    };
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(entry));
}

/// Returns a copy of the latest failure without clearing it.
#[must_use]
pub fn peek() -> Option<ThreadedError> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Removes and returns the latest failure.
pub fn take() -> Option<ThreadedError> {
    LAST_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Clears the slot.
pub fn clear() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn slot_is_per_thread() {
        clear();
        record(Path::new("/tmp/a.db"), &CoreError::config("busy_timeout", "bad"));

        let other = thread::spawn(peek).join().unwrap();
        assert!(other.is_none());

        let mine = peek().unwrap();
        assert_eq!(mine.kind, ErrorKind::Config);
        assert_eq!(mine.path, PathBuf::from("/tmp/a.db"));

        assert!(take().is_some());
        assert!(peek().is_none());
    }
}
