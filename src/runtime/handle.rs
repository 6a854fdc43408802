//! One-shot capability tokens.
//!
//! Every subscription, activation and in-flight request hands out a `Handle`.
//! Closing it runs its release action exactly once, synchronously on the
//! closing thread. Clones share the same underlying token, so the worker can
//! close a request handle to signal completion while the caller waits on it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

type ReleaseFn = Box<dyn FnOnce() + Send>;

struct HandleInner {
    name: String,
    closed: AtomicBool,
    release: Mutex<Option<ReleaseFn>>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

/// A single-use token whose release action runs when it is closed.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    /// Opens a handle that runs `on_close` when closed.
    pub fn open<F>(name: impl Into<String>, on_close: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_release(name.into(), Some(Box::new(on_close)))
    }

    /// Opens a handle with no release action.
    pub fn detached(name: impl Into<String>) -> Self {
        Self::with_release(name.into(), None)
    }

    fn with_release(name: String, release: Option<ReleaseFn>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name,
                closed: AtomicBool::new(false),
                release: Mutex::new(release),
                done: Mutex::new(false),
                done_cv: Condvar::new(),
            }),
        }
    }

    /// Closes the handle, running its release action.
    ///
    /// Returns `false` if the handle was already closed; the release action
    /// is never run twice.
    pub fn close(&self) -> bool {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(handle = %self.inner.name, "Handle closed twice");
            return false;
        }

        trace!(handle = %self.inner.name, "Closing handle");

        let release = self.inner.release.lock().take();
        if let Some(release) = release {
            release();
        }

        *self.inner.done.lock() = true;
        self.inner.done_cv.notify_all();
        true
    }

    /// Returns true until the handle is closed.
    pub fn is_valid(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Blocks until the handle is closed or `timeout` elapses.
    ///
    /// Returns true if the handle was closed (and its release action has
    /// finished) within the timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock();
        while !*done {
            if self
                .inner
                .done_cv
                .wait_until(&mut done, deadline)
                .timed_out()
            {
                break;
            }
        }
        *done
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("name", &self.inner.name)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_close_runs_release_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = Handle::open("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(handle.is_valid());
        assert!(handle.close());
        assert!(!handle.is_valid());
        assert!(!handle.close());
        assert!(!handle.clone().close());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_close() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = Handle::open("race", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                thread::spawn(move || handle.close())
            })
            .collect();
        let closed: usize = threads
            .into_iter()
            .map(|t| t.join().unwrap() as usize)
            .sum();

        assert_eq!(closed, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_for_close() {
        let handle = Handle::detached("waiter");
        assert!(!handle.wait(Duration::from_millis(10)));

        let remote = handle.clone();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.close();
        });

        assert!(handle.wait(Duration::from_secs(5)));
        closer.join().unwrap();
    }
}
