//! Single-flight worker thread.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Stop flag handed to the worker body.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    /// Returns true once the owner asked the worker to stop.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs at most one body on a named thread at a time.
///
/// [`AsyncQueue::run`] while a body is active is refused rather than
/// queued or run twice.
#[derive(Debug)]
pub struct AsyncQueue {
    name: String,
    running: Arc<AtomicBool>,
    signal: Mutex<StopSignal>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncQueue {
    /// Creates an idle queue whose thread will be called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            running: Arc::new(AtomicBool::new(false)),
            signal: Mutex::new(StopSignal::default()),
            worker: Mutex::new(None),
        }
    }

    /// Returns the thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true while a body is executing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts `body` on the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] while a previous body is
    /// still running, and an I/O error if the thread cannot be spawned.
    pub fn run(&self, body: impl FnOnce(StopSignal) + Send + 'static) -> CoreResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(CoreError::invalid_operation(format!(
                "queue {} is already running",
                self.name
            )));
        }

        let mut worker = self.worker.lock();
        if let Some(finished) = worker.take() {
            let _ = finished.join();
        }
        let signal = StopSignal::default();
        *self.signal.lock() = signal.clone();

        let guard = RunningGuard(Arc::clone(&self.running));
        let spawned = thread::Builder::new().name(self.name.clone()).spawn(move || {
            let _guard = guard;
            body(signal);
        });
        match spawned {
            Ok(handle) => {
                debug!(queue = %self.name, "worker started");
                *worker = Some(handle);
                Ok(())
            }
            Err(error) => {
                warn!(queue = %self.name, error = %error, "worker cannot be spawned");
                Err(error.into())
            }
        }
    }

    /// Asks the running body to stop. The body observes this through its
    /// [`StopSignal`]; owners waiting on other primitives must wake it.
    pub fn stop(&self) {
        self.signal.lock().stopped.store(true, Ordering::Release);
    }

    /// Waits for the current body to return.
    ///
    /// Does nothing when called from the worker thread itself.
    pub fn join(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                *self.worker.lock() = Some(handle);
                return;
            }
            if handle.join().is_err() {
                warn!(queue = %self.name, "worker panicked");
            }
            debug!(queue = %self.name, "worker joined");
        }
    }
}

impl Drop for AsyncQueue {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn second_run_is_refused_while_active() {
        let queue = AsyncQueue::new("test-queue");
        let runs = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let counter = Arc::clone(&runs);
        queue
            .run(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.recv();
            })
            .unwrap();
        assert!(queue.is_running());

        let counter = Arc::clone(&runs);
        let refused = queue.run(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(refused.unwrap_err().kind(), ErrorKind::InvalidOperation);

        release_tx.send(()).unwrap();
        queue.join();
        assert!(!queue.is_running());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runs_again_after_completion() {
        let queue = AsyncQueue::new("test-queue");
        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        queue.run(move |_| first.send(1).unwrap()).unwrap();
        queue.join();
        queue.run(move |_| tx.send(2).unwrap()).unwrap();
        queue.join();
        assert_eq!(rx.iter().take(2).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn stop_is_visible_to_body() {
        let queue = AsyncQueue::new("test-queue");
        queue
            .run(|signal| {
                while !signal.is_stopped() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        queue.stop();
        queue.join();
        assert!(!queue.is_running());
    }

    #[test]
    fn worker_thread_is_named() {
        let queue = AsyncQueue::new("named-worker");
        let (tx, rx) = mpsc::channel();
        queue
            .run(move |_| tx.send(thread::current().name().map(str::to_string)).unwrap())
            .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("named-worker"));
    }
}
