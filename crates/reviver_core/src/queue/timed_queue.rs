//! Keyed delay queue.
//!
//! Every key has at most one pending deadline. Re-queueing a key either
//! replaces its deadline ([`Mode::Reset`]) or keeps the earlier one
//! ([`Mode::ForwardOnly`]), which debounces bursts of requests into one
//! expiry.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};
use tracing::trace;

/// How a re-queue treats an already pending key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// The new deadline replaces the pending one.
    #[default]
    Reset,
    /// The pending deadline is kept unless the new one is earlier.
    ForwardOnly,
}

/// What to do with a key after its expiry callback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expired {
    /// Forget the key.
    Done,
    /// Expire the key again after the given delay.
    Retry(Duration),
}

#[derive(Debug)]
struct Item<V> {
    deadline: Instant,
    sequence: u64,
    value: V,
}

#[derive(Debug)]
struct State<K, V> {
    items: HashMap<K, Item<V>>,
    order: BTreeMap<(Instant, u64), K>,
    sequence: u64,
    stopped: bool,
}

impl<K: Eq + Hash + Clone, V> State<K, V> {
    fn insert(&mut self, key: K, deadline: Instant, value: V) {
        self.remove(&key);
        self.sequence += 1;
        self.order.insert((deadline, self.sequence), key.clone());
        self.items.insert(
            key,
            Item {
                deadline,
                sequence: self.sequence,
                value,
            },
        );
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let item = self.items.remove(key)?;
        self.order.remove(&(item.deadline, item.sequence));
        Some(item.value)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.order.keys().next().map(|(deadline, _)| *deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Option<(K, V)> {
        let (&(deadline, sequence), _) = self.order.iter().next()?;
        if deadline > now {
            return None;
        }
        let key = self.order.remove(&(deadline, sequence))?;
        let item = self.items.remove(&key)?;
        Some((key, item.value))
    }
}

/// A set of keys, each expiring at its own deadline.
#[derive(Debug)]
pub struct TimedQueue<K, V> {
    mode: Mode,
    state: Mutex<State<K, V>>,
    changed: Condvar,
}

impl<K: Eq + Hash + Clone, V> TimedQueue<K, V> {
    /// Creates an empty queue whose plain [`TimedQueue::re_queue`] uses `mode`.
    #[must_use]
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            state: Mutex::new(State {
                items: HashMap::new(),
                order: BTreeMap::new(),
                sequence: 0,
                stopped: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Schedules `key` to expire after `delay` using the queue's mode.
    pub fn re_queue(&self, key: K, delay: Duration, value: V) {
        self.re_queue_with(key, delay, value, self.mode);
    }

    /// Schedules `key` to expire after `delay` using `mode`.
    ///
    /// In [`Mode::ForwardOnly`] a pending key keeps its deadline and value
    /// when that deadline is not later than the new one.
    pub fn re_queue_with(&self, key: K, delay: Duration, value: V, mode: Mode) {
        let deadline = Instant::now() + delay;
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        if mode == Mode::ForwardOnly {
            if let Some(item) = state.items.get(&key) {
                if item.deadline <= deadline {
                    return;
                }
            }
        }
        state.insert(key, deadline, value);
        drop(state);
        self.changed.notify_all();
    }

    /// Cancels the pending expiry of `key`.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.state.lock().remove(key);
        if removed.is_some() {
            self.changed.notify_all();
        }
        removed
    }

    /// Returns true if `key` is pending.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().items.contains_key(key)
    }

    /// Returns the time left until `key` expires.
    #[must_use]
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        self.state
            .lock()
            .items
            .get(key)
            .map(|item| item.deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the number of pending keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Returns true if no key is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Makes [`TimedQueue::run_loop`] return and drops pending keys.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.items.clear();
        state.order.clear();
        drop(state);
        self.changed.notify_all();
    }

    /// Returns true once [`TimedQueue::stop`] was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Calls `on_expired` for every key whose deadline passed, until the
    /// queue is stopped.
    ///
    /// The callback runs without the queue locked, so it may re-queue or
    /// remove keys. A [`Expired::Retry`] result is ignored when the key was
    /// re-queued during the callback.
    pub fn run_loop(&self, mut on_expired: impl FnMut(&K, &V) -> Expired) {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return;
            }
            let now = Instant::now();
            if let Some((key, value)) = state.pop_due(now) {
                drop(state);
                let outcome = on_expired(&key, &value);
                state = self.state.lock();
                if let Expired::Retry(delay) = outcome {
                    if !state.stopped && !state.items.contains_key(&key) {
                        trace!(delay_ms = delay.as_millis() as u64, "key re-queued by callback");
                        state.insert(key, Instant::now() + delay, value);
                    }
                }
                continue;
            }
            match state.next_deadline() {
                Some(deadline) => {
                    let _ = self.changed.wait_until(&mut state, deadline);
                }
                None => self.changed.wait(&mut state),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{mpsc, Arc};
    use std::thread;

    fn spawn_loop(
        queue: &Arc<TimedQueue<&'static str, u32>>,
        outcome: impl Fn(&str) -> Expired + Send + 'static,
    ) -> (thread::JoinHandle<()>, mpsc::Receiver<(&'static str, u32)>) {
        let (tx, rx) = mpsc::channel();
        let queue = Arc::clone(queue);
        let worker = thread::spawn(move || {
            queue.run_loop(|key, value| {
                let _ = tx.send((*key, *value));
                outcome(key)
            });
        });
        (worker, rx)
    }

    #[test]
    fn keys_expire_in_deadline_order() {
        let queue = Arc::new(TimedQueue::new(Mode::Reset));
        queue.re_queue("late", Duration::from_millis(60), 2);
        queue.re_queue("early", Duration::from_millis(10), 1);
        let (worker, rx) = spawn_loop(&queue, |_| Expired::Done);

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, ("early", 1));
        assert_eq!(second, ("late", 2));

        queue.stop();
        worker.join().unwrap();
    }

    #[test]
    fn reset_replaces_pending_deadline() {
        let queue = TimedQueue::new(Mode::Reset);
        queue.re_queue("a", Duration::from_secs(60), 1);
        queue.re_queue("a", Duration::from_millis(1), 2);
        assert_eq!(queue.len(), 1);
        assert!(queue.remaining(&"a").unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn forward_only_keeps_earlier_deadline() {
        let queue = TimedQueue::new(Mode::ForwardOnly);
        queue.re_queue("a", Duration::from_millis(500), 1);
        for _ in 0..10 {
            queue.re_queue("a", Duration::from_secs(60), 9);
        }
        assert_eq!(queue.len(), 1);
        assert!(queue.remaining(&"a").unwrap() <= Duration::from_millis(500));

        queue.re_queue("a", Duration::from_millis(1), 3);
        assert!(queue.remaining(&"a").unwrap() <= Duration::from_millis(1));
    }

    #[test]
    fn burst_of_requests_expires_once() {
        let queue = Arc::new(TimedQueue::new(Mode::ForwardOnly));
        for value in 0..20 {
            queue.re_queue("backup", Duration::from_millis(30), value);
        }
        let (worker, rx) = spawn_loop(&queue, |_| Expired::Done);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), ("backup", 0));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        queue.stop();
        worker.join().unwrap();
    }

    #[test]
    fn retry_expires_again() {
        let queue = Arc::new(TimedQueue::new(Mode::Reset));
        queue.re_queue("a", Duration::ZERO, 7);
        let (worker, rx) = spawn_loop(&queue, |_| Expired::Retry(Duration::from_millis(5)));

        for _ in 0..3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), ("a", 7));
        }

        queue.stop();
        worker.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn removed_key_never_expires() {
        let queue = Arc::new(TimedQueue::new(Mode::Reset));
        queue.re_queue("a", Duration::from_millis(30), 1);
        assert_eq!(queue.remove(&"a"), Some(1));
        let (worker, rx) = spawn_loop(&queue, |_| Expired::Done);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        queue.stop();
        worker.join().unwrap();
    }

    #[test]
    fn stop_wakes_idle_loop() {
        let queue = Arc::new(TimedQueue::<&'static str, u32>::new(Mode::Reset));
        let (worker, _rx) = spawn_loop(&queue, |_| Expired::Done);
        thread::sleep(Duration::from_millis(20));
        queue.stop();
        worker.join().unwrap();

        queue.re_queue("a", Duration::ZERO, 1);
        assert!(queue.is_empty());
    }
}
