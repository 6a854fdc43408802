//! Serialized access to the external media source.
//!
//! Every request runs as one task on the catalog worker with the shared,
//! lazily opened source connection. Source failures and panics are logged
//! and turned into "no result"; a failing request drops the connection so the
//! next one reconnects.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::SourceResult;
use crate::runtime::{deliver, DeliveryContext, Handle, TaskId, WorkerThread};
use crate::source::{Locator, MediaSource, SourceConnection};

struct BrokerShared {
    worker: Arc<WorkerThread>,
    source: Arc<dyn MediaSource>,
    connection: Mutex<Option<Box<dyn SourceConnection>>>,
    failures: AtomicU64,
}

impl BrokerShared {
    /// Runs `query` with the cached connection. Worker thread only.
    fn run<T, Q>(&self, locator: &Locator, query: Q) -> Option<T>
    where
        Q: FnOnce(&mut dyn SourceConnection, &Locator) -> SourceResult<T>,
    {
        // Taken out of the slot so a nested request cannot deadlock on it.
        let cached = self.connection.lock().take();
        let mut conn = match cached {
            Some(conn) => conn,
            None => match self.source.connect() {
                Ok(conn) => {
                    debug!(%locator, "Opened media source connection");
                    conn
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%locator, error = %e, "Failed to connect to media source");
                    return None;
                }
            },
        };

        match catch_unwind(AssertUnwindSafe(|| query(conn.as_mut(), locator))) {
            Ok(Ok(value)) => {
                let mut slot = self.connection.lock();
                if slot.is_none() {
                    *slot = Some(conn);
                }
                Some(value)
            }
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(%locator, error = %e, "Media source request failed");
                None
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(%locator, "Media source request panicked");
                None
            }
        }
    }
}

/// Marshals source requests onto the catalog worker, one at a time.
#[derive(Clone)]
pub struct ContentBroker {
    shared: Arc<BrokerShared>,
}

impl ContentBroker {
    pub fn new(worker: Arc<WorkerThread>, source: Arc<dyn MediaSource>) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                worker,
                source,
                connection: Mutex::new(None),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Queues `callback` to run with a source connection.
    ///
    /// Never blocks. The returned handle closes itself when the callback has
    /// finished; closing it earlier cancels the queued task.
    pub fn access<F>(&self, locator: Locator, callback: F) -> Handle
    where
        F: FnOnce(&mut dyn SourceConnection, &Locator) -> SourceResult<()> + Send + 'static,
    {
        self.request(locator, callback, |_: Option<()>| {}, None)
    }

    /// Queues `query` and delivers its result to `on_done` on `context`.
    ///
    /// `on_done` receives `None` when the source failed. It is not called at
    /// all if the handle was closed before the query completed.
    pub fn request<T, Q, D>(
        &self,
        locator: Locator,
        query: Q,
        on_done: D,
        context: Option<Arc<dyn DeliveryContext>>,
    ) -> Handle
    where
        T: Send + 'static,
        Q: FnOnce(&mut dyn SourceConnection, &Locator) -> SourceResult<T> + Send + 'static,
        D: FnOnce(Option<T>) + Send + 'static,
    {
        let task: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
        let handle = {
            let task = Arc::clone(&task);
            let worker = Arc::downgrade(&self.shared.worker);
            Handle::open(format!("request:{}", locator), move || {
                let id: TaskId = task.load(Ordering::Acquire);
                if id == 0 {
                    return;
                }
                if let Some(worker) = worker.upgrade() {
                    worker.cancel(id);
                }
            })
        };

        let shared = Arc::clone(&self.shared);
        let completion = handle.clone();
        let id = self.shared.worker.post(move || {
            if !completion.is_valid() {
                trace!(%locator, "Skipping request closed before it ran");
                return;
            }
            let result = shared.run(&locator, query);
            if !completion.is_valid() {
                trace!(%locator, "Suppressing completion of closed request");
                return;
            }
            completion.close();
            deliver(context.as_ref(), Box::new(move || on_done(result)));
        });
        task.store(id, Ordering::Release);
        handle
    }

    /// Runs `query` and waits up to `timeout` for its result.
    ///
    /// Runs inline when called on the worker itself. On timeout the request
    /// is cancelled and `None` is returned.
    pub fn request_blocking<T, Q>(&self, locator: Locator, query: Q, timeout: Duration) -> Option<T>
    where
        T: Send + 'static,
        Q: FnOnce(&mut dyn SourceConnection, &Locator) -> SourceResult<T> + Send + 'static,
    {
        if self.shared.worker.is_current() {
            return self.shared.run(&locator, query);
        }

        let (tx, rx) = flume::bounded(1);
        let handle = self.request(
            locator,
            query,
            move |result| {
                let _ = tx.send(result);
            },
            None,
        );

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(_) => {
                if handle.is_valid() {
                    handle.close();
                }
                debug!(handle = handle.name(), ?timeout, "Blocking request timed out");
                None
            }
        }
    }

    /// Runs `query` immediately. Must be called on the catalog worker.
    pub(crate) fn run_inline<T, Q>(&self, locator: &Locator, query: Q) -> Option<T>
    where
        Q: FnOnce(&mut dyn SourceConnection, &Locator) -> SourceResult<T>,
    {
        debug_assert!(self.shared.worker.is_current(), "run_inline off the catalog worker");
        self.shared.run(locator, query)
    }

    /// Drops the cached connection.
    pub(crate) fn reset_connection(&self) {
        if self.shared.connection.lock().take().is_some() {
            debug!("Closed media source connection");
        }
    }

    /// Number of requests that ended without a result.
    pub fn failure_count(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaRow;
    use crate::runtime::LoopContext;
    use crate::source::MemorySource;

    const WAIT: Duration = Duration::from_secs(5);

    fn broker(source: &MemorySource) -> (Arc<WorkerThread>, ContentBroker) {
        let worker = Arc::new(WorkerThread::new("test-broker"));
        let broker = ContentBroker::new(Arc::clone(&worker), Arc::new(source.clone()));
        (worker, broker)
    }

    #[test]
    fn test_access_closes_handle_on_completion() {
        let source = MemorySource::with_rows([MediaRow::new(1, "/1.jpg", 1)]);
        let (_worker, broker) = broker(&source);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let handle = broker.access(Locator::MEDIA, move |conn, locator| {
            sink.lock().push((locator.clone(), conn.media_ids()?));
            Ok(())
        });

        assert!(handle.wait(WAIT));
        assert!(!handle.is_valid());
        assert_eq!(*seen.lock(), vec![(Locator::MEDIA, vec![1])]);
    }

    #[test]
    fn test_connection_is_shared_and_reset_on_error() {
        let source = MemorySource::with_rows([MediaRow::new(1, "/1.jpg", 1)]);
        let (_worker, broker) = broker(&source);

        for _ in 0..3 {
            let ids = broker.request_blocking(Locator::MEDIA, |conn, _| conn.media_ids(), WAIT);
            assert_eq!(ids, Some(vec![1]));
        }
        assert_eq!(source.connect_count(), 1);

        source.fail_next_queries(1);
        let failed = broker.request_blocking(Locator::MEDIA, |conn, _| conn.media_ids(), WAIT);
        assert_eq!(failed, None);
        assert_eq!(broker.failure_count(), 1);

        let ids = broker.request_blocking(Locator::MEDIA, |conn, _| conn.media_ids(), WAIT);
        assert_eq!(ids, Some(vec![1]));
        assert_eq!(source.connect_count(), 2);
    }

    #[test]
    fn test_offline_source_yields_no_result() {
        let source = MemorySource::new();
        source.set_offline(true);
        let (_worker, broker) = broker(&source);
        let result = broker.request_blocking(Locator::MEDIA, |conn, _| conn.media_ids(), WAIT);
        assert!(result.is_none());
    }

    #[test]
    fn test_cancel_before_run() {
        let source = MemorySource::with_rows([MediaRow::new(1, "/1.jpg", 1)]);
        let (worker, broker) = broker(&source);
        let (gate_tx, gate_rx) = flume::bounded::<()>(1);
        worker.post(move || {
            let _ = gate_rx.recv_timeout(WAIT);
        });

        let ran = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ran);
        let handle = broker.access(Locator::MEDIA, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(handle.close());
        gate_tx.send(()).unwrap();

        assert!(worker.flush(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(source.connect_count(), 0);
    }

    #[test]
    fn test_panicking_query_is_contained() {
        let source = MemorySource::with_rows([MediaRow::new(1, "/1.jpg", 1)]);
        let (worker, broker) = broker(&source);
        let result: Option<u32> =
            broker.request_blocking(Locator::MEDIA, |_, _| panic!("bad query"), Duration::from_millis(300));
        assert!(result.is_none());
        assert_eq!(worker.panicked_count(), 0);

        let ids = broker.request_blocking(Locator::MEDIA, |conn, _| conn.media_ids(), WAIT);
        assert_eq!(ids, Some(vec![1]));
    }

    #[test]
    fn test_request_delivers_on_context() {
        let source = MemorySource::with_rows([MediaRow::new(7, "/7.jpg", 1)]);
        let (_worker, broker) = broker(&source);
        let main = Arc::new(LoopContext::new());
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);

        let ctx: Arc<dyn DeliveryContext> = main.clone();
        let handle = broker.request(
            Locator::MEDIA,
            |conn, _| conn.media_ids(),
            move |ids| *sink.lock() = Some(ids),
            Some(ctx),
        );

        assert!(handle.wait(WAIT));
        assert!(main.pump_until(WAIT, || result.lock().is_some()));
        assert_eq!(*result.lock(), Some(Some(vec![7])));
    }

    #[test]
    fn test_request_blocking_inline_on_worker() {
        let source = MemorySource::with_rows([MediaRow::new(1, "/1.jpg", 1)]);
        let (worker, broker) = broker(&source);
        let (tx, rx) = flume::bounded(1);
        let inner = broker.clone();
        worker.post(move || {
            let ids = inner.request_blocking(Locator::MEDIA, |conn, _| conn.media_ids(), WAIT);
            let _ = tx.send(ids);
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(vec![1]));
    }
}
