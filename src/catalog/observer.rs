//! Debounced change notifications per source locator.
//!
//! Native signals carry no payload and tend to arrive in bursts. Each watched
//! locator runs a small state machine on the worker:
//!
//! - `Idle` + signal: record it, schedule a check after the settle interval
//! - `PendingCheck` + signal: record it only
//! - check: notify every registration if active and anything arrived, back to `Idle`
//!
//! The native subscription for a locator exists only while the hub is active
//! and at least one callback is registered for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::runtime::{deliver, DeliveryContext, Handle, TaskId, WorkerThread};
use crate::source::{ChangeNotifier, Locator, MediaSource};

/// Callback invoked with the locator that changed.
pub type ChangeCallback = Arc<dyn Fn(&Locator) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchState {
    Idle,
    PendingCheck,
}

struct Registration {
    id: u64,
    callback: ChangeCallback,
    context: Option<Arc<dyn DeliveryContext>>,
}

struct Watch {
    state: WatchState,
    last_signal: Option<Instant>,
    signals_since_check: u64,
    registrations: Vec<Registration>,
    subscription: Option<Handle>,
    check_task: Option<TaskId>,
}

impl Watch {
    fn new() -> Self {
        Self {
            state: WatchState::Idle,
            last_signal: None,
            signals_since_check: 0,
            registrations: Vec::new(),
            subscription: None,
            check_task: None,
        }
    }
}

/// Counters for diagnostics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub raw_signals: u64,
    pub scheduled_checks: u64,
    pub notifications: u64,
}

#[derive(Default)]
struct Counters {
    raw_signals: AtomicU64,
    scheduled_checks: AtomicU64,
    notifications: AtomicU64,
}

struct HubShared {
    worker: Arc<WorkerThread>,
    source: Arc<dyn MediaSource>,
    settle: Duration,
    watches: Mutex<HashMap<Locator, Watch>>,
    active: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
}

impl HubShared {
    /// Posts `f` to the worker with a weak reference to the hub.
    fn post<F>(self: &Arc<Self>, f: F) -> TaskId
    where
        F: FnOnce(&Arc<HubShared>) + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        self.worker.post(move || {
            if let Some(shared) = weak.upgrade() {
                f(&shared);
            }
        })
    }

    fn signal(self: &Arc<Self>, locator: Locator) {
        self.counters.raw_signals.fetch_add(1, Ordering::Relaxed);
        self.post(move |shared| shared.on_signal(&locator));
    }

    fn on_signal(self: &Arc<Self>, locator: &Locator) {
        let mut watches = self.watches.lock();
        let Some(watch) = watches.get_mut(locator) else {
            trace!(%locator, "Signal for unwatched locator");
            return;
        };

        watch.last_signal = Some(Instant::now());
        watch.signals_since_check += 1;
        if watch.state == WatchState::PendingCheck {
            return;
        }

        watch.state = WatchState::PendingCheck;
        self.counters.scheduled_checks.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(self);
        let target = locator.clone();
        watch.check_task = Some(self.worker.post_delayed(self.settle, move || {
            if let Some(shared) = weak.upgrade() {
                shared.check(&target);
            }
        }));
        trace!(%locator, settle = ?self.settle, "Scheduled change check");
    }

    fn check(&self, locator: &Locator) {
        let targets: Vec<(ChangeCallback, Option<Arc<dyn DeliveryContext>>)> = {
            let mut watches = self.watches.lock();
            let Some(watch) = watches.get_mut(locator) else {
                return;
            };
            watch.state = WatchState::Idle;
            watch.check_task = None;
            let signals = std::mem::take(&mut watch.signals_since_check);
            if signals == 0 || !self.active.load(Ordering::Acquire) {
                return;
            }
            debug!(%locator, signals, "Change settled, notifying");
            watch
                .registrations
                .iter()
                .map(|r| (Arc::clone(&r.callback), r.context.clone()))
                .collect()
        };

        self.counters.notifications.fetch_add(1, Ordering::Relaxed);
        for (callback, context) in targets {
            let locator = locator.clone();
            deliver(context.as_ref(), Box::new(move || callback(&locator)));
        }
    }

    fn subscribe_native(self: &Arc<Self>, locator: &Locator) -> Option<Handle> {
        let weak: Weak<HubShared> = Arc::downgrade(self);
        let target = locator.clone();
        let notifier: ChangeNotifier = Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.signal(target.clone());
            }
        });

        match self.source.watch(locator, notifier) {
            Ok(handle) => {
                debug!(%locator, "Subscribed to native change notifications");
                Some(handle)
            }
            Err(e) => {
                warn!(%locator, error = %e, "Failed to subscribe to change notifications");
                None
            }
        }
    }

    fn add_registration(self: &Arc<Self>, locator: Locator, registration: Registration) {
        let needs_subscription = {
            let mut watches = self.watches.lock();
            let watch = watches.entry(locator.clone()).or_insert_with(Watch::new);
            watch.registrations.push(registration);
            watch.subscription.is_none() && self.active.load(Ordering::Acquire)
        };
        if needs_subscription {
            self.attach(&locator);
        }
    }

    fn remove_registration(&self, locator: &Locator, id: u64) {
        let teardown = {
            let mut watches = self.watches.lock();
            let Some(watch) = watches.get_mut(locator) else {
                return;
            };
            watch.registrations.retain(|r| r.id != id);
            if !watch.registrations.is_empty() {
                return;
            }
            watches.remove(locator)
        };

        if let Some(watch) = teardown {
            debug!(%locator, "Last callback gone, dropping watch");
            self.detach(watch);
        }
    }

    fn attach(self: &Arc<Self>, locator: &Locator) {
        let handle = self.subscribe_native(locator);
        let mut watches = self.watches.lock();
        match watches.get_mut(locator) {
            Some(watch) if watch.subscription.is_none() => watch.subscription = handle,
            _ => {
                if let Some(handle) = handle {
                    handle.close();
                }
            }
        }
    }

    fn detach(&self, mut watch: Watch) {
        if let Some(task) = watch.check_task.take() {
            self.worker.cancel(task);
        }
        if let Some(subscription) = watch.subscription.take() {
            subscription.close();
        }
    }

    fn apply_active(self: &Arc<Self>, active: bool) {
        if self.active.swap(active, Ordering::AcqRel) == active {
            return;
        }

        if active {
            let locators: Vec<Locator> = self
                .watches
                .lock()
                .iter()
                .filter(|(_, w)| w.subscription.is_none() && !w.registrations.is_empty())
                .map(|(l, _)| l.clone())
                .collect();
            for locator in &locators {
                self.attach(locator);
            }
            debug!(count = locators.len(), "Change observer hub active");
        } else {
            let stale: Vec<(Option<TaskId>, Option<Handle>)> = self
                .watches
                .lock()
                .values_mut()
                .map(|w| {
                    w.state = WatchState::Idle;
                    w.signals_since_check = 0;
                    (w.check_task.take(), w.subscription.take())
                })
                .collect();
            for (task, subscription) in stale {
                if let Some(task) = task {
                    self.worker.cancel(task);
                }
                if let Some(subscription) = subscription {
                    subscription.close();
                }
            }
            debug!("Change observer hub inactive");
        }
    }
}

/// Fans debounced change notifications out to registered callbacks.
#[derive(Clone)]
pub struct ChangeObserverHub {
    shared: Arc<HubShared>,
}

impl ChangeObserverHub {
    pub fn new(worker: Arc<WorkerThread>, source: Arc<dyn MediaSource>, settle: Duration) -> Self {
        Self {
            shared: Arc::new(HubShared {
                worker,
                source,
                settle,
                watches: Mutex::new(HashMap::new()),
                active: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    /// Registers `callback` for settled changes of `locator`.
    ///
    /// Registration and removal are carried out on the worker. The callback
    /// runs on `context` (inline when that is the worker or absent).
    pub fn register<F>(
        &self,
        locator: Locator,
        callback: F,
        context: Option<Arc<dyn DeliveryContext>>,
    ) -> Handle
    where
        F: Fn(&Locator) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            id,
            callback: Arc::new(callback),
            context,
        };
        let name = format!("observer:{}#{}", locator, id);

        let target = locator.clone();
        self.shared
            .post(move |shared| shared.add_registration(target, registration));

        let weak = Arc::downgrade(&self.shared);
        Handle::open(name, move || {
            if let Some(shared) = weak.upgrade() {
                shared.post(move |shared| shared.remove_registration(&locator, id));
            }
        })
    }

    /// Injects a raw change signal, as a native subscription would.
    pub fn signal(&self, locator: &Locator) {
        self.shared.signal(locator.clone());
    }

    /// Turns native subscriptions and notifications on or off.
    pub fn set_active(&self, active: bool) {
        if self.shared.worker.is_current() {
            self.shared.apply_active(active);
        } else {
            self.shared.post(move |shared| shared.apply_active(active));
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::Acquire)
    }

    /// True while a native subscription for `locator` is held.
    pub fn is_subscribed(&self, locator: &Locator) -> bool {
        self.shared
            .watches
            .lock()
            .get(locator)
            .is_some_and(|w| w.subscription.is_some())
    }

    pub fn registration_count(&self, locator: &Locator) -> usize {
        self.shared
            .watches
            .lock()
            .get(locator)
            .map_or(0, |w| w.registrations.len())
    }

    /// When the last raw signal for `locator` arrived.
    pub fn last_signal(&self, locator: &Locator) -> Option<Instant> {
        self.shared
            .watches
            .lock()
            .get(locator)
            .and_then(|w| w.last_signal)
    }

    pub fn stats(&self) -> HubStats {
        let counters = &self.shared.counters;
        HubStats {
            raw_signals: counters.raw_signals.load(Ordering::Relaxed),
            scheduled_checks: counters.scheduled_checks.load(Ordering::Relaxed),
            notifications: counters.notifications.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaRow;
    use crate::runtime::LoopContext;
    use crate::source::MemorySource;
    use std::thread;

    const SETTLE: Duration = Duration::from_millis(100);
    const WAIT: Duration = Duration::from_secs(5);

    fn hub(source: &MemorySource) -> (Arc<WorkerThread>, ChangeObserverHub) {
        let worker = Arc::new(WorkerThread::new("test-hub"));
        let hub = ChangeObserverHub::new(Arc::clone(&worker), Arc::new(source.clone()), SETTLE);
        (worker, hub)
    }

    fn counter(hub: &ChangeObserverHub, locator: Locator) -> (Arc<AtomicU64>, Handle) {
        let hits = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&hits);
        let handle = hub.register(
            locator,
            move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        (hits, handle)
    }

    #[test]
    fn test_burst_collapses_into_one_check() {
        let source = MemorySource::new();
        let (worker, hub) = hub(&source);
        let (hits, _handle) = counter(&hub, Locator::MEDIA);
        hub.set_active(true);
        assert!(worker.flush(WAIT));

        for i in 0..10 {
            source.upsert(MediaRow::new(i, format!("/{i}.jpg"), i));
        }
        thread::sleep(SETTLE * 3);
        assert!(worker.flush(WAIT));

        let stats = hub.stats();
        assert_eq!(stats.raw_signals, 10);
        assert_eq!(stats.scheduled_checks, 1);
        assert_eq!(stats.notifications, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spaced_signals_each_checked() {
        let source = MemorySource::new();
        let (worker, hub) = hub(&source);
        let (hits, _handle) = counter(&hub, Locator::MEDIA);
        hub.set_active(true);
        assert!(worker.flush(WAIT));

        for _ in 0..3 {
            source.touch(&Locator::MEDIA);
            thread::sleep(SETTLE * 3);
        }
        assert!(worker.flush(WAIT));

        assert_eq!(hub.stats().scheduled_checks, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_inactive_hub_holds_no_subscription() {
        let source = MemorySource::new();
        let (worker, hub) = hub(&source);
        let (hits, handle) = counter(&hub, Locator::MEDIA);
        assert!(worker.flush(WAIT));
        assert_eq!(source.watcher_count(), 0);

        hub.set_active(true);
        assert!(worker.flush(WAIT));
        assert!(hub.is_subscribed(&Locator::MEDIA));
        assert_eq!(source.watcher_count(), 1);

        // Signals injected while inactive are not delivered.
        hub.set_active(false);
        hub.signal(&Locator::MEDIA);
        thread::sleep(SETTLE * 3);
        assert!(worker.flush(WAIT));
        assert_eq!(source.watcher_count(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(handle.close());
        assert!(worker.flush(WAIT));
        assert_eq!(hub.registration_count(&Locator::MEDIA), 0);
    }

    #[test]
    fn test_last_unregister_tears_down_subscription() {
        let source = MemorySource::new();
        let (worker, hub) = hub(&source);
        hub.set_active(true);
        let (_a, first) = counter(&hub, Locator::MEDIA);
        let (_b, second) = counter(&hub, Locator::MEDIA);
        assert!(worker.flush(WAIT));
        assert_eq!(source.watcher_count(), 1);
        assert_eq!(hub.registration_count(&Locator::MEDIA), 2);

        first.close();
        assert!(worker.flush(WAIT));
        assert_eq!(source.watcher_count(), 1);

        second.close();
        assert!(worker.flush(WAIT));
        assert_eq!(source.watcher_count(), 0);
        assert!(!hub.is_subscribed(&Locator::MEDIA));
    }

    #[test]
    fn test_delivery_on_loop_context() {
        let source = MemorySource::new();
        let (worker, hub) = hub(&source);
        let main = Arc::new(LoopContext::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx: Arc<dyn DeliveryContext> = main.clone();
        let _handle = hub.register(
            Locator::CONTAINERS,
            move |locator| sink.lock().push((locator.clone(), thread::current().id())),
            Some(ctx),
        );
        hub.set_active(true);
        assert!(worker.flush(WAIT));

        source.touch(&Locator::CONTAINERS);
        assert!(main.pump_until(WAIT, || !seen.lock().is_empty()));
        assert_eq!(
            *seen.lock(),
            vec![(Locator::CONTAINERS, thread::current().id())]
        );
        assert!(hub.last_signal(&Locator::CONTAINERS).is_some());
    }
}
