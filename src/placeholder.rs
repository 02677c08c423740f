use crate::env_var::config;

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum State<T> {
    Pending(Vec<Box<dyn FnOnce(T) + Send>>),
    Ready(T),
}

struct PlaceholderInner<T> {
    state: Mutex<State<T>>,
    avail: Condvar,
}

/// A single-assignment slot for a value that may be produced locally or delivered from a
/// remote PE.
///
/// A placeholder is set exactly once. Readers may block until the value is available ([get][Placeholder::get]),
/// probe for readiness without blocking ([probe][Placeholder::probe]), or register a one-shot callback that is invoked
/// exactly once at the moment the value is assigned ([on_ready][Placeholder::on_ready]). Clones share the same slot.
///
/// Setting a placeholder twice is a fatal error, values are only ever assigned once per slot.
pub struct Placeholder<T> {
    inner: Arc<PlaceholderInner<T>>,
}

impl<T> Clone for Placeholder<T> {
    fn clone(&self) -> Self {
        Placeholder {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Placeholder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Placeholder {{ ready: {:?} }}", self.probe())
    }
}

impl<T> Placeholder<T> {
    /// Construct an empty placeholder
    pub fn new() -> Placeholder<T> {
        Placeholder {
            inner: Arc::new(PlaceholderInner {
                state: Mutex::new(State::Pending(Vec::new())),
                avail: Condvar::new(),
            }),
        }
    }

    /// Construct a placeholder that already holds `value`
    pub fn ready(value: T) -> Placeholder<T> {
        Placeholder {
            inner: Arc::new(PlaceholderInner {
                state: Mutex::new(State::Ready(value)),
                avail: Condvar::new(),
            }),
        }
    }

    /// Returns true once the value has been assigned
    pub fn probe(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Ready(_))
    }
}

impl<T: Clone + Send + 'static> Placeholder<T> {
    /// Assign the value, waking blocked readers and draining registered callbacks.
    ///
    /// Each callback receives its own copy of the value and runs on the calling thread,
    /// synchronously with the assignment.
    pub fn set(&self, value: T) {
        let mut state = self.inner.state.lock();
        let callbacks = match &mut *state {
            State::Pending(callbacks) => std::mem::take(callbacks),
            State::Ready(_) => panic!("placeholder assigned more than once"),
        };
        let mut copies: Vec<T> = Vec::with_capacity(callbacks.len());
        for _ in 0..callbacks.len() {
            copies.push(value.clone());
        }
        *state = State::Ready(value);
        self.inner.avail.notify_all();
        drop(state);
        for (callback, copy) in callbacks.into_iter().zip(copies) {
            callback(copy);
        }
    }

    /// Register a one-shot callback invoked exactly once with the value.
    ///
    /// If the value is already assigned the callback runs immediately on the calling thread,
    /// otherwise it runs on the thread that eventually performs the assignment.
    pub fn on_ready<F>(&self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending(callbacks) => {
                callbacks.push(Box::new(f));
            }
            State::Ready(value) => {
                let value = value.clone();
                drop(state);
                f(value);
            }
        }
    }

    /// Return a copy of the value if it has been assigned
    pub fn try_get(&self) -> Option<T> {
        match &*self.inner.state.lock() {
            State::Ready(value) => Some(value.clone()),
            State::Pending(_) => None,
        }
    }

    /// Block the calling thread until the value is assigned and return a copy of it.
    ///
    /// This is a user-facing synchronous API. It must not be called from within a runtime task,
    /// a worker thread blocked here cannot help drain the task queues that would satisfy it.
    pub fn get(&self) -> T {
        let mut state = self.inner.state.lock();
        let mut timer = Instant::now();
        loop {
            if let State::Ready(value) = &*state {
                return value.clone();
            }
            self.inner
                .avail
                .wait_for(&mut state, Duration::from_secs_f64(1.0));
            if timer.elapsed().as_secs_f64() > config().deadlock_warning_timeout {
                println!(
                    "[{:?}] [TESSELLAR WARNING] Potential deadlock detected.\n\
                    Blocked waiting for a placeholder that has not been assigned for {:?} seconds.\n\
                    A placeholder is assigned by a local `set` or by a value delivered from a remote PE, \
                    an exchange key that is never satisfied will block dependents indefinitely.\n\
                    The deadlock timeout can be set via the TESSELLAR_DEADLOCK_WARNING_TIMEOUT environment variable",
                    std::thread::current().id(),
                    config().deadlock_warning_timeout,
                );
                timer = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn set_then_probe_and_get() {
        let slot = Placeholder::new();
        assert!(!slot.probe());
        assert_eq!(slot.try_get(), None);
        slot.set(7usize);
        assert!(slot.probe());
        assert_eq!(slot.try_get(), Some(7));
        assert_eq!(slot.get(), 7);
    }

    #[test]
    fn callback_after_set_runs_immediately() {
        let slot = Placeholder::ready(3usize);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        slot.on_ready(move |v| {
            assert_eq!(v, 3);
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_before_set_runs_on_assignment() {
        let slot = Placeholder::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        slot.on_ready(move |v: usize| {
            assert_eq!(v, 11);
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        slot.set(11);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clones_share_the_slot() {
        let slot = Placeholder::new();
        let alias = slot.clone();
        slot.set(vec![1u8, 2, 3]);
        assert_eq!(alias.get(), vec![1, 2, 3]);
    }

    #[test]
    fn blocked_get_wakes_on_set() {
        let slot = Placeholder::new();
        let alias = slot.clone();
        let reader = std::thread::spawn(move || alias.get());
        std::thread::sleep(Duration::from_millis(10));
        slot.set(19usize);
        assert_eq!(reader.join().unwrap(), 19);
    }

    #[test]
    #[should_panic]
    fn double_set_panics() {
        let slot = Placeholder::new();
        slot.set(1usize);
        slot.set(2usize);
    }
}
