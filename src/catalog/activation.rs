//! Reference-counted activation with delayed teardown.
//!
//! The first activation starts the catalog on the worker. Closing the last
//! activation handle only schedules teardown after a grace delay; activating
//! again within the grace window cancels it, so short deactivate/activate
//! flickers keep the loaded state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::runtime::{Handle, TaskId, WorkerThread};

/// Start or stop hook, run on the worker.
pub type Hook = Box<dyn Fn() + Send + Sync>;

struct GateState {
    refs: usize,
    live: bool,
    teardown: Option<(u64, TaskId)>,
    generation: u64,
}

struct GateShared {
    worker: Arc<WorkerThread>,
    grace: Duration,
    state: Mutex<GateState>,
    on_start: Hook,
    on_stop: Hook,
    starts: AtomicU64,
    stops: AtomicU64,
}

impl GateShared {
    fn post_start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.worker.post(move || {
            if let Some(shared) = weak.upgrade() {
                shared.start();
            }
        });
    }

    fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.live || state.refs == 0 {
                trace!(live = state.live, refs = state.refs, "Skipping start");
                return;
            }
            state.live = true;
        }
        info!("Activating catalog");
        self.starts.fetch_add(1, Ordering::Relaxed);
        (self.on_start)();
    }

    fn deactivate(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.refs == 0 {
            warn!("Deactivated more often than activated");
            return;
        }
        state.refs -= 1;
        if state.refs > 0 {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let weak: Weak<GateShared> = Arc::downgrade(self);
        let task = self.worker.post_delayed(self.grace, move || {
            if let Some(shared) = weak.upgrade() {
                shared.teardown(generation);
            }
        });
        state.teardown = Some((generation, task));
        debug!(grace = ?self.grace, "Scheduled catalog teardown");
    }

    fn teardown(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.teardown.is_some_and(|(g, _)| g == generation) {
                state.teardown = None;
            }
            if state.refs > 0 || !state.live {
                trace!(refs = state.refs, "Skipping teardown");
                return;
            }
            state.live = false;
        }
        info!("Tearing down catalog");
        self.stops.fetch_add(1, Ordering::Relaxed);
        (self.on_stop)();
    }
}

/// Counts activations and drives start/stop hooks on the worker.
pub struct ActivationGate {
    shared: Arc<GateShared>,
}

impl ActivationGate {
    pub fn new(worker: Arc<WorkerThread>, grace: Duration, on_start: Hook, on_stop: Hook) -> Self {
        Self {
            shared: Arc::new(GateShared {
                worker,
                grace,
                state: Mutex::new(GateState {
                    refs: 0,
                    live: false,
                    teardown: None,
                    generation: 0,
                }),
                on_start,
                on_stop,
                starts: AtomicU64::new(0),
                stops: AtomicU64::new(0),
            }),
        }
    }

    /// Takes one activation reference. Close the handle to give it back.
    pub fn activate(&self) -> Handle {
        let refs = {
            let mut state = self.shared.state.lock();
            state.refs += 1;
            if state.refs == 1 {
                let cancelled = state
                    .teardown
                    .take()
                    .is_some_and(|(_, task)| self.shared.worker.cancel(task));
                if cancelled {
                    debug!("Cancelled pending teardown");
                }
                // A start skipped while the count was back at zero has to be redone.
                if !cancelled || !state.live {
                    self.shared.post_start();
                }
            }
            state.refs
        };
        trace!(refs, "Activated");

        let weak = Arc::downgrade(&self.shared);
        Handle::open("activation", move || {
            if let Some(shared) = weak.upgrade() {
                shared.deactivate();
            }
        })
    }

    /// True while at least one activation handle is open.
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().refs > 0
    }

    /// True between a completed start and the matching teardown.
    pub fn is_live(&self) -> bool {
        self.shared.state.lock().live
    }

    pub fn ref_count(&self) -> usize {
        self.shared.state.lock().refs
    }

    pub fn teardown_pending(&self) -> bool {
        self.shared.state.lock().teardown.is_some()
    }

    pub fn start_count(&self) -> u64 {
        self.shared.starts.load(Ordering::Relaxed)
    }

    pub fn stop_count(&self) -> u64 {
        self.shared.stops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const GRACE: Duration = Duration::from_millis(150);
    const WAIT: Duration = Duration::from_secs(5);

    fn gate() -> (Arc<WorkerThread>, ActivationGate) {
        let worker = Arc::new(WorkerThread::new("test-gate"));
        let gate = ActivationGate::new(Arc::clone(&worker), GRACE, Box::new(|| {}), Box::new(|| {}));
        (worker, gate)
    }

    #[test]
    fn test_activate_then_close_before_start_skips_start() {
        let (worker, gate) = gate();
        let (gate_tx, gate_rx) = flume::bounded::<()>(1);
        worker.post(move || {
            let _ = gate_rx.recv_timeout(WAIT);
        });

        gate.activate().close();
        gate_tx.send(()).unwrap();
        thread::sleep(GRACE * 3);
        assert!(worker.flush(WAIT));

        assert!(!gate.is_live());
        assert_eq!(gate.start_count(), 0);
        assert_eq!(gate.stop_count(), 0);

        let _again = gate.activate();
        assert!(worker.flush(WAIT));
        assert!(gate.is_live());
    }

    #[test]
    fn test_ref_counting() {
        let (worker, gate) = gate();
        let a = gate.activate();
        let b = gate.activate();
        assert!(worker.flush(WAIT));
        assert!(gate.is_live());
        assert_eq!(gate.start_count(), 1);

        a.close();
        assert!(gate.is_active());
        assert!(!gate.teardown_pending());

        b.close();
        assert!(!gate.is_active());
        assert!(gate.teardown_pending());
        assert!(gate.is_live(), "teardown waits for the grace delay");

        thread::sleep(GRACE * 3);
        assert!(worker.flush(WAIT));
        assert!(!gate.is_live());
        assert_eq!(gate.stop_count(), 1);
    }

    #[test]
    fn test_reactivation_cancels_teardown() {
        let (worker, gate) = gate();
        let first = gate.activate();
        assert!(worker.flush(WAIT));
        first.close();
        assert!(gate.teardown_pending());

        let second = gate.activate();
        assert!(!gate.teardown_pending());
        thread::sleep(GRACE * 3);
        assert!(worker.flush(WAIT));

        assert!(gate.is_live());
        assert_eq!(gate.start_count(), 1);
        assert_eq!(gate.stop_count(), 0);
        second.close();
    }

    #[test]
    fn test_restart_after_teardown() {
        let (worker, gate) = gate();
        let first = gate.activate();
        assert!(worker.flush(WAIT));
        first.close();
        thread::sleep(GRACE * 3);
        assert!(worker.flush(WAIT));
        assert!(!gate.is_live());

        let _again = gate.activate();
        assert!(worker.flush(WAIT));
        assert!(gate.is_live());
        assert_eq!(gate.start_count(), 2);
        assert_eq!(gate.stop_count(), 1);
    }

    #[test]
    fn test_hooks_run_on_worker() {
        let worker = Arc::new(WorkerThread::new("test-gate-hooks"));
        let (tx, rx) = flume::unbounded();
        let (start_tx, stop_tx) = (tx.clone(), tx);
        let gate = ActivationGate::new(
            Arc::clone(&worker),
            Duration::ZERO,
            Box::new(move || {
                let _ = start_tx.send(("start", thread::current().name().map(String::from)));
            }),
            Box::new(move || {
                let _ = stop_tx.send(("stop", thread::current().name().map(String::from)));
            }),
        );

        let handle = gate.activate();
        assert!(worker.flush(WAIT));
        handle.close();
        let name = Some("test-gate-hooks".to_string());
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("start", name.clone()));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ("stop", name));
    }
}
