//! Progress reporting and cooperative cancellation for long sessions.

use crate::error::{CoreError, CoreResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback receiving `(fraction, score)`, both in `0.0..=1.0`.
pub type ProgressCallback = Box<dyn FnMut(f64, f64) + Send>;

/// Shared flag used to cancel a repair or backup from another thread.
///
/// Sessions check the flag at page and table boundaries only.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
}

impl Cancellation {
    /// Creates a new, unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Accumulates work done and forwards it to an optional callback.
pub struct Progress {
    total: u64,
    done: u64,
    score: f64,
    last_reported: f64,
    callback: Option<ProgressCallback>,
    cancellation: Cancellation,
}

impl Progress {
    /// Creates a progress tracker with no callback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total: 0,
            done: 0,
            score: 0.0,
            last_reported: -1.0,
            callback: None,
            cancellation: Cancellation::new(),
        }
    }

    /// Sets the callback.
    #[must_use]
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Shares a cancellation flag with the caller.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Sets the expected amount of work.
    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    /// Adds `units` of finished work and reports.
    pub fn increase(&mut self, units: u64) {
        self.done = self.done.saturating_add(units);
        self.report();
    }

    /// Updates the running score and reports.
    pub fn set_score(&mut self, score: f64) {
        self.score = score.clamp(0.0, 1.0);
        self.report();
    }

    /// Marks all work as done and reports a final fraction of 1.
    pub fn finish(&mut self) {
        self.done = self.total.max(self.done);
        self.report();
    }

    /// Returns the completed fraction.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.done as f64 / self.total as f64).min(1.0)
    }

    /// Returns the last score set.
    #[must_use]
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Returns true when the caller asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fails with [`CoreError::Cancelled`] when the caller asked to stop.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the flag is set.
    pub fn check_cancelled(&self) -> CoreResult<()> {
        if self.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        Ok(())
    }

    fn report(&mut self) {
        let fraction = self.fraction();
        // Skip sub-permille updates.
        if (fraction - self.last_reported).abs() < 0.001 && fraction < 1.0 {
            return;
        }
        self.last_reported = fraction;
        if let Some(callback) = self.callback.as_mut() {
            callback(fraction, self.score);
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("total", &self.total)
            .field("done", &self.done)
            .field("score", &self.score)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn reports_monotonic_fraction() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut progress = Progress::new().with_callback(Box::new(move |fraction, score| {
            sink.lock().push((fraction, score));
        }));
        progress.set_total(4);
        progress.increase(1);
        progress.increase(1);
        progress.set_score(0.5);
        progress.finish();

        let seen = seen.lock();
        assert_eq!(seen.first().copied(), Some((0.25, 0.0)));
        assert_eq!(seen.last().copied(), Some((1.0, 0.5)));
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn cancellation_is_shared() {
        let cancellation = Cancellation::new();
        let progress = Progress::new().with_cancellation(cancellation.clone());
        assert!(progress.check_cancelled().is_ok());

        cancellation.cancel();
        assert!(matches!(progress.check_cancelled(), Err(CoreError::Cancelled)));
    }

    #[test]
    fn fraction_without_total_is_zero() {
        let mut progress = Progress::new();
        progress.increase(10);
        assert_eq!(progress.fraction(), 0.0);
    }
}
