//! Thread-affine callback delivery.
//!
//! A registration stores a callback together with the context it wants to be
//! called on. Delivery posts to that context when the emitting thread is a
//! different one, and calls inline otherwise.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::trace;

use super::handle::Handle;
use super::worker::{Job, WorkerThread};

/// An execution context that callbacks can be marshalled onto.
pub trait DeliveryContext: Send + Sync {
    /// Returns true if the calling thread already is this context.
    fn is_current(&self) -> bool;

    /// Queues `job` to run on this context.
    fn post(&self, job: Job);
}

impl DeliveryContext for WorkerThread {
    fn is_current(&self) -> bool {
        WorkerThread::is_current(self)
    }

    fn post(&self, job: Job) {
        WorkerThread::post(self, job);
    }
}

/// Runs `job` inline when `context` is absent or current, otherwise posts it.
pub fn deliver(context: Option<&Arc<dyn DeliveryContext>>, job: Job) {
    match context {
        Some(ctx) if !ctx.is_current() => ctx.post(job),
        _ => job(),
    }
}

/// A consumer-owned event loop, drained explicitly by its owning thread.
///
/// Stands in for a UI main loop: callbacks registered with this context are
/// queued until the owner calls [`LoopContext::pump`].
pub struct LoopContext {
    owner: Mutex<ThreadId>,
    tx: Sender<Job>,
    rx: Receiver<Job>,
}

impl LoopContext {
    /// Creates a loop owned by the calling thread.
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            owner: Mutex::new(thread::current().id()),
            tx,
            rx,
        }
    }

    /// Makes the calling thread the owner of this loop.
    pub fn bind_current(&self) {
        *self.owner.lock() = thread::current().id();
    }

    /// Runs every queued job without blocking. Returns the number run.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Runs queued jobs as they arrive until `duration` has elapsed.
    pub fn pump_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        ran
    }

    /// Pumps until `done` returns true or `timeout` elapses.
    pub fn pump_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let step = (deadline - now).min(Duration::from_millis(10));
            if let Ok(job) = self.rx.recv_timeout(step) {
                job();
            }
        }
    }

    /// Number of jobs waiting to be pumped.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

impl Default for LoopContext {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryContext for LoopContext {
    fn is_current(&self) -> bool {
        *self.owner.lock() == thread::current().id()
    }

    fn post(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

/// Callback invoked with each emitted event.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    id: u64,
    callback: Callback<E>,
    context: Option<Arc<dyn DeliveryContext>>,
}

/// A list of (callback, delivery context) registrations for one event type.
///
/// Events reach each subscriber in emission order; there is no ordering
/// between different subscribers.
pub struct Subscribers<E> {
    name: &'static str,
    next_id: AtomicU64,
    entries: Mutex<Vec<Subscriber<E>>>,
}

impl<E> Subscribers<E>
where
    E: Clone + Send + 'static,
{
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Registers `callback`; closing the returned handle unregisters it.
    pub fn subscribe<F>(
        self: &Arc<Self>,
        callback: F,
        context: Option<Arc<dyn DeliveryContext>>,
    ) -> Handle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Subscriber {
            id,
            callback: Arc::new(callback),
            context,
        });
        trace!(list = self.name, id, "Subscribed");

        let weak = Arc::downgrade(self);
        Handle::open(format!("{}#{}", self.name, id), move || {
            if let Some(list) = weak.upgrade() {
                list.entries.lock().retain(|s| s.id != id);
            }
        })
    }

    /// Delivers `event` to every subscriber.
    pub fn emit(&self, event: E) {
        // Snapshot first so callbacks can subscribe or unsubscribe freely.
        let targets: Vec<(Callback<E>, Option<Arc<dyn DeliveryContext>>)> = self
            .entries
            .lock()
            .iter()
            .map(|s| (Arc::clone(&s.callback), s.context.clone()))
            .collect();

        for (callback, context) in targets {
            match context {
                Some(ctx) if !ctx.is_current() => {
                    let event = event.clone();
                    ctx.post(Box::new(move || callback(&event)));
                }
                _ => callback(&event),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
