//! The lock strategy trait and its composition.

use crate::error::CoreResult;
use tracing::warn;

/// One way of excluding conflicting work on a database.
///
/// Lockers never retry. A failed `acquire` leaves the locker released and
/// the caller decides when to try again.
pub trait Locker: Send {
    /// Takes the lock. Taking a held lock again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a lock error on timeout or conflict, or the error that
    /// prevented the attempt.
    fn acquire(&mut self) -> CoreResult<()>;

    /// Releases the lock. Releasing a free lock is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying release; the locker counts as
    /// released afterwards.
    fn release(&mut self) -> CoreResult<()>;

    /// Returns true while the lock is held.
    fn is_held(&self) -> bool;
}

/// Several lockers acting as one.
///
/// Members are acquired in order and released in reverse order. When a
/// member fails, the ones already taken are released again.
#[derive(Default)]
pub struct CompositeLocker {
    members: Vec<Box<dyn Locker>>,
}

impl CompositeLocker {
    /// Creates an empty composite.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a member.
    #[must_use]
    pub fn with(mut self, locker: Box<dyn Locker>) -> Self {
        self.members.push(locker);
        self
    }

    /// Returns the number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true without members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl std::fmt::Debug for CompositeLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeLocker")
            .field("members", &self.members.len())
            .field("held", &self.is_held())
            .finish()
    }
}

impl Locker for CompositeLocker {
    fn acquire(&mut self) -> CoreResult<()> {
        for index in 0..self.members.len() {
            if let Err(error) = self.members[index].acquire() {
                for taken in self.members[..index].iter_mut().rev() {
                    if let Err(undo) = taken.release() {
                        warn!(error = %undo, "releasing partially acquired lock failed");
                    }
                }
                return Err(error);
            }
        }
        Ok(())
    }

    fn release(&mut self) -> CoreResult<()> {
        let mut first_error = None;
        for member in self.members.iter_mut().rev() {
            if let Err(error) = member.release() {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn is_held(&self) -> bool {
        !self.members.is_empty() && self.members.iter().all(|member| member.is_held())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Recording {
        name: &'static str,
        fail: bool,
        held: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Locker for Recording {
        fn acquire(&mut self) -> CoreResult<()> {
            if self.fail {
                return Err(CoreError::lock_conflict(self.name));
            }
            self.held = true;
            self.log.lock().push(format!("+{}", self.name));
            Ok(())
        }

        fn release(&mut self) -> CoreResult<()> {
            if self.held {
                self.held = false;
                self.log.lock().push(format!("-{}", self.name));
            }
            Ok(())
        }

        fn is_held(&self) -> bool {
            self.held
        }
    }

    fn member(name: &'static str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Box<dyn Locker> {
        Box::new(Recording {
            name,
            fail,
            held: false,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn acquires_in_order_releases_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut composite = CompositeLocker::new()
            .with(member("a", false, &log))
            .with(member("b", false, &log));

        composite.acquire().unwrap();
        assert!(composite.is_held());
        composite.release().unwrap();
        assert!(!composite.is_held());
        assert_eq!(*log.lock(), vec!["+a", "+b", "-b", "-a"]);
    }

    #[test]
    fn partial_acquisition_is_rolled_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut composite = CompositeLocker::new()
            .with(member("a", false, &log))
            .with(member("b", false, &log))
            .with(member("c", true, &log));

        assert!(composite.acquire().is_err());
        assert!(!composite.is_held());
        assert_eq!(*log.lock(), vec!["+a", "+b", "-b", "-a"]);
    }
}
