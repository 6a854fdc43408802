//! The dedicated content thread.
//!
//! - Single long-lived thread, spawned lazily on first use
//! - Serial FIFO queue plus delayed tasks, fed through a flume channel
//! - Queued tasks can be cancelled until they start running
//! - A panicking task is logged and the loop moves on to the next one

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::error::CatalogError;

/// A unit of work executed on the worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a posted task so it can be cancelled before it runs.
pub type TaskId = u64;

enum Message {
    Run { id: TaskId, job: Job },
    Delayed { id: TaskId, due: Instant, job: Job },
    Shutdown,
}

struct Timer {
    due: Instant,
    id: TaskId,
    job: Job,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// State shared between the handle side and the running thread.
struct Shared {
    /// Tasks posted but not yet started. A task runs only if it can remove itself.
    pending: Mutex<HashSet<TaskId>>,
    next_id: AtomicU64,
    thread_id: OnceCell<ThreadId>,
    completed: AtomicU64,
    panicked: AtomicU64,
}

struct Runtime {
    tx: Sender<Message>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Serial background executor owning all catalog mutation.
pub struct WorkerThread {
    name: String,
    shared: Arc<Shared>,
    runtime: OnceCell<Runtime>,
}

impl WorkerThread {
    /// Creates the worker. The thread itself starts on the first posted task.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                pending: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                thread_id: OnceCell::new(),
                completed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
            }),
            runtime: OnceCell::new(),
        }
    }

    /// Starts the thread if needed. Idempotent.
    pub fn start(&self) -> Result<(), CatalogError> {
        self.runtime().map(|_| ())
    }

    fn runtime(&self) -> Result<&Runtime, CatalogError> {
        self.runtime.get_or_try_init(|| {
            let (tx, rx) = flume::unbounded();
            let shared = Arc::clone(&self.shared);
            let name = self.name.clone();

            let join = thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || worker_loop(name, rx, shared))
                .map_err(|e| {
                    error!(error = ?e, "Failed to spawn catalog worker");
                    CatalogError::WorkerUnavailable
                })?;

            debug!(worker = %self.name, "Started catalog worker");
            Ok(Runtime {
                tx,
                join: Mutex::new(Some(join)),
            })
        })
    }

    /// Queues `job` behind every task already posted.
    pub fn post<F>(&self, job: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.register();
        self.send(
            id,
            Message::Run {
                id,
                job: Box::new(job),
            },
        );
        id
    }

    /// Runs `job` once `delay` has elapsed.
    pub fn post_delayed<F>(&self, delay: Duration, job: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.register();
        self.send(
            id,
            Message::Delayed {
                id,
                due: Instant::now() + delay,
                job: Box::new(job),
            },
        );
        id
    }

    fn register(&self) -> TaskId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.pending.lock().insert(id);
        id
    }

    fn send(&self, id: TaskId, msg: Message) {
        let sent = match self.runtime() {
            Ok(rt) => rt.tx.send(msg).is_ok(),
            Err(_) => false,
        };
        if !sent {
            error!(task = id, worker = %self.name, "Catalog worker is gone, dropping task");
            self.shared.pending.lock().remove(&id);
        }
    }

    /// Cancels a task that has not started yet.
    ///
    /// Returns false if the task already ran, is running, or was cancelled.
    pub fn cancel(&self, id: TaskId) -> bool {
        let removed = self.shared.pending.lock().remove(&id);
        if removed {
            trace!(task = id, "Cancelled queued task");
        }
        removed
    }

    /// Returns true when called from the worker thread itself.
    pub fn is_current(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    /// Waits until every task posted before this call has run.
    ///
    /// Delayed tasks that are not yet due are not waited for.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.is_current() {
            return true;
        }
        let (tx, rx) = flume::bounded(1);
        self.post(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(timeout).is_ok()
    }

    /// Number of tasks posted but not yet started.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Number of tasks that panicked while running.
    pub fn panicked_count(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the thread after the tasks already queued ahead of the request.
    pub fn shutdown(&self) {
        let Some(rt) = self.runtime.get() else {
            return;
        };
        debug!(worker = %self.name, "Shutting down catalog worker");
        let _ = rt.tx.send(Message::Shutdown);

        // Joining from the worker itself would deadlock.
        if self.is_current() {
            return;
        }
        if let Some(join) = rt.join.lock().take() {
            let _ = join.join();
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(name: String, rx: Receiver<Message>, shared: Arc<Shared>) {
    let _ = shared.thread_id.set(thread::current().id());
    debug!(worker = %name, "Catalog worker running");

    let mut timers: BinaryHeap<Timer> = BinaryHeap::new();

    loop {
        let now = Instant::now();
        while timers.peek().is_some_and(|t| t.due <= now) {
            if let Some(timer) = timers.pop() {
                run_job(&shared, timer.id, timer.job);
            }
        }

        let next = match timers.peek() {
            Some(timer) => match rx.recv_deadline(timer.due) {
                Ok(msg) => msg,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            },
        };

        match next {
            Message::Run { id, job } => run_job(&shared, id, job),
            Message::Delayed { id, due, job } => timers.push(Timer { due, id, job }),
            Message::Shutdown => break,
        }
    }

    shared.pending.lock().clear();
    debug!(worker = %name, "Catalog worker stopped");
}

fn run_job(shared: &Shared, id: TaskId, job: Job) {
    if !shared.pending.lock().remove(&id) {
        trace!(task = id, "Skipping cancelled task");
        return;
    }

    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(()) => {
            shared.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(payload) => {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(task = id, panic = %message, "Catalog worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_tasks_run_in_order() {
        let worker = WorkerThread::new("test-order");
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let seen = Arc::clone(&seen);
            worker.post(move || seen.lock().push(i));
        }

        assert!(worker.flush(WAIT));
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_lazy_start() {
        let worker = WorkerThread::new("test-lazy");
        assert!(!worker.is_current());
        assert!(worker.runtime.get().is_none());
        worker.start().unwrap();
        worker.start().unwrap();
        assert!(worker.runtime.get().is_some());
    }

    #[test]
    fn test_panic_does_not_kill_worker() {
        let worker = WorkerThread::new("test-panic");
        let ran = Arc::new(AtomicUsize::new(0));

        worker.post(|| panic!("boom"));
        let counter = Arc::clone(&ran);
        worker.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(worker.flush(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(worker.panicked_count(), 1);
    }

    #[test]
    fn test_cancel_before_run() {
        let worker = WorkerThread::new("test-cancel");
        let (gate_tx, gate_rx) = flume::bounded::<()>(1);
        let ran = Arc::new(AtomicUsize::new(0));

        // Block the worker so the next task stays queued.
        worker.post(move || {
            let _ = gate_rx.recv_timeout(WAIT);
        });
        let counter = Arc::clone(&ran);
        let id = worker.post(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(worker.cancel(id));
        assert!(!worker.cancel(id));
        gate_tx.send(()).unwrap();

        assert!(worker.flush(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delayed_task() {
        let worker = WorkerThread::new("test-delay");
        let (tx, rx) = flume::bounded(1);
        let start = Instant::now();

        worker.post_delayed(Duration::from_millis(50), move || {
            let _ = tx.send(Instant::now());
        });

        let ran_at = rx.recv_timeout(WAIT).unwrap();
        assert!(ran_at.duration_since(start) >= Duration::from_millis(50));
    }

    #[test]
    fn test_cancel_delayed_task() {
        let worker = WorkerThread::new("test-delay-cancel");
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let id = worker.post_delayed(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(worker.cancel(id));

        thread::sleep(Duration::from_millis(100));
        assert!(worker.flush(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_is_current_inside_task() {
        let worker = Arc::new(WorkerThread::new("test-current"));
        let (tx, rx) = flume::bounded(1);
        let inner = Arc::clone(&worker);
        worker.post(move || {
            let _ = tx.send(inner.is_current());
        });
        assert!(rx.recv_timeout(WAIT).unwrap());
    }
}
