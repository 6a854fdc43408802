//! The catalog engine.
//!
//! `MediaCatalog` owns one worker thread and everything that runs on it: the
//! source broker, the change observer hub, the identity-mapped table, container
//! discovery and the registry of live views. It is an explicit instance rather
//! than process-wide state; clones share the same engine.
//!
//! Lifecycle:
//! - `activate()` hands out reference-counted activation handles
//! - the first activation sets up (or resynchronizes) the table, discovers
//!   containers and fills every registered view
//! - settled change notifications resynchronize the table and patch views
//! - after the last handle closes and the grace delay passes, views are
//!   emptied, containers forgotten and the table released

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::activation::ActivationGate;
use super::broker::ContentBroker;
use super::discovery::SetDiscovery;
use super::observer::{ChangeObserverHub, HubStats};
use super::table::{CatalogTable, Lookup, Obtained, RecordEvent, TableStats};
use crate::config::CatalogConfig;
use crate::error::{CatalogError, CatalogResult, SourceResult};
use crate::models::{
    Container, ContainerId, FlagStore, MediaFlags, MediaId, MediaRecord, MediaRow,
};
use crate::runtime::{DeliveryContext, Handle, TaskId, WorkerThread};
use crate::source::{Locator, MediaSource, SourceConnection};
use crate::views::{MaterializedView, ViewChange, ViewSpec};

/// Snapshot of engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogStats {
    pub table: TableStats,
    pub hub: HubStats,
    pub views: usize,
    pub containers: usize,
    pub source_failures: u64,
    pub worker_panics: u64,
}

struct Inner {
    config: CatalogConfig,
    worker: Arc<WorkerThread>,
    broker: ContentBroker,
    hub: ChangeObserverHub,
    table: CatalogTable,
    discovery: SetDiscovery,
    gate: ActivationGate,
    views: Mutex<Vec<MaterializedView>>,
    flags: Option<Arc<FlagStore>>,
    observers: Mutex<Vec<Handle>>,
    poll_task: Mutex<Option<TaskId>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.worker.shutdown();
    }
}

/// Runs `f` on the upgraded engine, if it is still alive.
fn with_inner(weak: &Weak<Inner>, f: impl FnOnce(&Arc<Inner>)) {
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

impl Inner {
    fn live_views(&self) -> Vec<MaterializedView> {
        self.views.lock().clone()
    }

    /// Start hook: runs on the worker for the 0 -> 1 activation transition.
    fn start(self: &Arc<Self>) {
        self.hub.set_active(true);
        self.table.touch();

        let table = &self.table;
        if table.is_initialized() {
            // Identities survived the last teardown; only the difference is fetched.
            let outcome = self
                .broker
                .run_inline(&Locator::MEDIA, |conn, _| table.synchronize(conn));
            trace!(resynced = outcome.is_some(), "Resynchronized retained identities");
        } else {
            let count = self
                .broker
                .run_inline(&Locator::MEDIA, |conn, _| table.setup(conn));
            if count.is_some() {
                self.prune_flags();
            }
        }

        self.refresh_containers();

        let views = self.live_views();
        if !views.is_empty() {
            let records = self.hydrate_all(&views);
            for view in &views {
                view.populate(&records);
            }
        }

        self.schedule_poll();
        info!(
            items = self.table.len(),
            views = views.len(),
            containers = self.discovery.len(),
            "Media catalog active"
        );
    }

    /// Stop hook: runs on the worker after the grace delay.
    fn stop(&self) {
        if let Some(task) = self.poll_task.lock().take() {
            self.worker.cancel(task);
        }
        self.hub.set_active(false);

        for view in self.live_views() {
            view.clear();
        }
        self.discovery.release();
        let kept = self.table.release_idle(self.config.retain_ids_window);
        self.broker.reset_connection();
        info!(kept_ids = kept, "Media catalog inactive");
    }

    fn prune_flags(&self) {
        let Some(store) = &self.flags else {
            return;
        };
        let live = self.table.ids().into_iter().collect();
        if let Err(e) = store.prune(&live) {
            warn!(error = ?e, "Failed to prune media flags");
        }
    }

    /// Materializes every row the table knows about.
    ///
    /// Records created or changed on the way are routed to every live view
    /// except `populating`, which the caller fills from the returned batch.
    fn hydrate_all(&self, populating: &[MaterializedView]) -> Vec<Arc<MediaRecord>> {
        let rows = self
            .broker
            .run_inline(&Locator::MEDIA, |conn, _| conn.query_media(None))
            .unwrap_or_default();
        let others: Vec<MaterializedView> = self
            .live_views()
            .into_iter()
            .filter(|view| populating.iter().all(|p| p.id() != view.id()))
            .collect();

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = match self.table.obtain(row) {
                Obtained::Created(record) => {
                    for view in &others {
                        view.apply_created(&record);
                    }
                    record
                }
                Obtained::Updated(record) => {
                    for view in &others {
                        view.apply_updated(&record);
                    }
                    record
                }
                Obtained::Unchanged(record) => record,
                Obtained::Absent => continue,
            };
            records.push(record);
        }
        debug!(count = records.len(), "Hydrated media records");
        records
    }

    /// Tops up bounded views that lost members, from the loaded records.
    fn refill_views(&self) {
        let mut candidates: Option<Vec<Arc<MediaRecord>>> = None;
        for view in self.live_views() {
            if view.needs_refill() {
                let records = candidates.get_or_insert_with(|| self.table.loaded_records());
                view.refill(records);
            }
        }
    }

    fn on_media_changed(&self) {
        if !self.gate.is_live() {
            return;
        }
        self.table.touch();

        let table = &self.table;
        let Some(outcome) = self
            .broker
            .run_inline(&Locator::MEDIA, |conn, _| table.synchronize(conn))
        else {
            return;
        };

        if !outcome.created.is_empty() || !outcome.deleted.is_empty() {
            for view in self.live_views() {
                view.apply_batch(&outcome.created, &outcome.deleted);
            }
        }

        if self.config.refresh_loaded_on_change {
            self.refresh_loaded();
        }
        self.refill_views();
    }

    /// Re-reads rows of materialized records so field changes surface.
    fn refresh_loaded(&self) {
        let ids = self.table.loaded_ids();
        if ids.is_empty() {
            return;
        }
        let Some(rows) = self
            .broker
            .run_inline(&Locator::MEDIA, |conn, _| conn.query_media(Some(&ids)))
        else {
            return;
        };

        let views = self.live_views();
        let mut updated = 0;
        for row in &rows {
            match self.table.obtain(row) {
                Obtained::Updated(record) => {
                    updated += 1;
                    for view in &views {
                        view.apply_updated(&record);
                    }
                }
                Obtained::Created(record) => {
                    for view in &views {
                        view.apply_created(&record);
                    }
                }
                Obtained::Unchanged(_) | Obtained::Absent => {}
            }
        }
        if updated > 0 {
            debug!(updated, "Refreshed materialized records");
        }
    }

    fn refresh_containers(&self) {
        let discovery = &self.discovery;
        self.broker
            .run_inline(&Locator::CONTAINERS, |conn, _| discovery.refresh(conn));
    }

    fn on_containers_changed(&self) {
        if self.gate.is_live() {
            self.refresh_containers();
        }
    }

    fn schedule_poll(self: &Arc<Self>) {
        let Some(interval) = self.config.poll_interval else {
            return;
        };
        let weak = Arc::downgrade(self);
        let task = self.worker.post_delayed(interval, move || {
            with_inner(&weak, |inner| {
                if !inner.gate.is_live() {
                    return;
                }
                trace!("Polling media source");
                inner.on_media_changed();
                inner.refresh_containers();
                inner.schedule_poll();
            });
        });
        *self.poll_task.lock() = Some(task);
    }

    /// Hydrates or updates one row and routes the result to views. Worker only.
    fn admit(&self, row: &MediaRow) -> Option<Arc<MediaRecord>> {
        let record = match self.table.obtain(row) {
            Obtained::Created(record) => {
                for view in self.live_views() {
                    view.apply_created(&record);
                }
                record
            }
            Obtained::Updated(record) => {
                for view in self.live_views() {
                    view.apply_updated(&record);
                }
                self.refill_views();
                record
            }
            Obtained::Unchanged(record) => record,
            Obtained::Absent => return None,
        };
        Some(record)
    }

    fn forget(&self, id: MediaId) {
        if self.table.remove(id) {
            for view in self.live_views() {
                view.apply_deleted(id);
            }
            self.refill_views();
        }
    }

    fn apply_flags(&self, id: MediaId, flags: MediaFlags) {
        if let Some(record) = self.table.apply_flags(id, flags) {
            for view in self.live_views() {
                view.apply_updated(&record);
            }
            self.refill_views();
        }
    }
}

/// Builder for [`MediaCatalog`].
pub struct CatalogBuilder {
    config: CatalogConfig,
    flags: Option<Arc<FlagStore>>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self {
            config: CatalogConfig::default(),
            flags: None,
        }
    }

    pub fn config(mut self, config: CatalogConfig) -> Self {
        self.config = config;
        self
    }

    pub fn settle_interval(mut self, interval: Duration) -> Self {
        self.config.settle_interval = interval;
        self
    }

    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.config.teardown_grace = grace;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn retain_ids_window(mut self, window: Duration) -> Self {
        self.config.retain_ids_window = window;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = Some(interval);
        self
    }

    pub fn refresh_loaded_on_change(mut self, enabled: bool) -> Self {
        self.config.refresh_loaded_on_change = enabled;
        self
    }

    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.config.worker_name = name.into();
        self
    }

    pub fn flag_store(mut self, store: Arc<FlagStore>) -> Self {
        self.flags = Some(store);
        self
    }

    pub fn build(self, source: Arc<dyn MediaSource>) -> MediaCatalog {
        let config = self.config;
        let flags = self.flags;
        let worker = Arc::new(WorkerThread::new(config.worker_name.clone()));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let on_start = {
                let weak = weak.clone();
                Box::new(move || with_inner(&weak, |inner| inner.start()))
            };
            let on_stop = {
                let weak = weak.clone();
                Box::new(move || with_inner(&weak, |inner| inner.stop()))
            };

            Inner {
                broker: ContentBroker::new(Arc::clone(&worker), Arc::clone(&source)),
                hub: ChangeObserverHub::new(
                    Arc::clone(&worker),
                    Arc::clone(&source),
                    config.settle_interval,
                ),
                table: CatalogTable::new(flags.clone()),
                discovery: SetDiscovery::new(),
                gate: ActivationGate::new(
                    Arc::clone(&worker),
                    config.teardown_grace,
                    on_start,
                    on_stop,
                ),
                views: Mutex::new(Vec::new()),
                flags,
                observers: Mutex::new(Vec::new()),
                poll_task: Mutex::new(None),
                worker,
                config,
            }
        });

        let catalog = MediaCatalog { inner };
        catalog.install_observers();
        catalog
    }
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A live, incrementally maintained catalog of media items.
#[derive(Clone)]
pub struct MediaCatalog {
    inner: Arc<Inner>,
}

impl MediaCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    /// Builds a catalog with the default configuration.
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        CatalogBuilder::new().build(source)
    }

    fn install_observers(&self) {
        let worker: Arc<dyn DeliveryContext> = self.inner.worker.clone();

        let weak = Arc::downgrade(&self.inner);
        let media = self.inner.hub.register(
            Locator::MEDIA,
            move |_| with_inner(&weak, |inner| inner.on_media_changed()),
            Some(Arc::clone(&worker)),
        );

        let weak = Arc::downgrade(&self.inner);
        let containers = self.inner.hub.register(
            Locator::CONTAINERS,
            move |_| with_inner(&weak, |inner| inner.on_containers_changed()),
            Some(worker),
        );

        self.inner.observers.lock().extend([media, containers]);
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.inner.config
    }

    /// Takes an activation reference. The catalog stays live while any is open.
    pub fn activate(&self) -> Handle {
        let activation = self.inner.gate.activate();
        let weak = Arc::downgrade(&self.inner);
        // Idle time for the teardown policy counts from the last close.
        Handle::open("catalog-activation", move || {
            with_inner(&weak, |inner| inner.table.touch());
            activation.close();
        })
    }

    /// True while at least one activation handle is open.
    pub fn is_active(&self) -> bool {
        self.inner.gate.is_active()
    }

    /// True while the catalog is started on the worker.
    pub fn is_live(&self) -> bool {
        self.inner.gate.is_live()
    }

    /// Registers a new view. It is filled now if the catalog is live,
    /// otherwise on the next activation.
    pub fn create_view(&self, spec: ViewSpec) -> MaterializedView {
        let view = MaterializedView::new(spec);
        self.inner.views.lock().push(view.clone());

        let weak = Arc::downgrade(&self.inner);
        let target = view.clone();
        self.inner.worker.post(move || {
            with_inner(&weak, |inner| {
                if !inner.gate.is_live() || target.is_released() {
                    return;
                }
                let records = inner.hydrate_all(std::slice::from_ref(&target));
                target.populate(&records);
                inner.refill_views();
            });
        });
        debug!(view = view.id(), "Created view");
        view
    }

    /// Stops maintaining `view` and empties it.
    pub fn release(&self, view: &MaterializedView) {
        if !view.mark_released() {
            warn!(view = view.id(), "View released twice");
            return;
        }
        self.inner.views.lock().retain(|v| v.id() != view.id());
        let target = view.clone();
        self.inner.worker.post(move || target.clear());
        debug!(view = view.id(), "Released view");
    }

    pub fn views(&self) -> Vec<MaterializedView> {
        self.inner.live_views()
    }

    /// Registers a callback for settled changes of `locator`.
    pub fn register_change_callback<F>(
        &self,
        locator: Locator,
        callback: F,
        context: Option<Arc<dyn DeliveryContext>>,
    ) -> Handle
    where
        F: Fn(&Locator) + Send + Sync + 'static,
    {
        self.inner.hub.register(locator, callback, context)
    }

    /// Subscribes to created/updated/deleted record events.
    pub fn subscribe_records<F>(&self, callback: F, context: Option<Arc<dyn DeliveryContext>>) -> Handle
    where
        F: Fn(&RecordEvent) + Send + Sync + 'static,
    {
        self.inner.table.subscribe(callback, context)
    }

    /// Returns the live record for `id`, loading it if it is only a placeholder.
    ///
    /// Waits at most the configured request timeout; a slow or failing source
    /// yields `None`.
    pub fn obtain_record(&self, id: MediaId) -> Option<Arc<MediaRecord>> {
        self.inner.table.touch();
        match self.inner.table.lookup(id) {
            Lookup::Loaded(record) => return Some(record),
            Lookup::Absent => return None,
            Lookup::Placeholder => {}
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .broker
            .request_blocking(
                Locator::MEDIA,
                move |conn, _| {
                    let Some(row) = conn.query_row(id)? else {
                        return Ok(None);
                    };
                    Ok(weak.upgrade().and_then(|inner| inner.admit(&row)))
                },
                self.inner.config.request_timeout,
            )
            .flatten()
    }

    /// Looks up a record without touching the source.
    pub fn lookup(&self, id: MediaId) -> Lookup {
        self.inner.table.lookup(id)
    }

    /// Runs a point write on the worker and waits for its outcome.
    fn point_write<F>(&self, write: F) -> CatalogResult<bool>
    where
        F: FnOnce(&mut dyn SourceConnection, &Weak<Inner>) -> SourceResult<bool>
            + Send
            + 'static,
    {
        let timeout = self.inner.config.request_timeout;
        let weak = Arc::downgrade(&self.inner);
        let result = self.inner.broker.request_blocking(
            Locator::MEDIA,
            move |conn, _| Ok(write(conn, &weak)),
            timeout,
        );

        match result {
            Some(Ok(written)) => Ok(written),
            Some(Err(e)) => Err(e.into()),
            None => Err(CatalogError::Timeout(timeout)),
        }
    }

    /// Deletes one item from the source and the catalog.
    pub fn delete(&self, id: MediaId) -> CatalogResult<bool> {
        let deleted = self.point_write(move |conn, weak| {
            let deleted = conn.delete(id)?;
            if deleted {
                with_inner(weak, |inner| inner.forget(id));
            }
            Ok(deleted)
        })?;
        debug!(id, deleted, "Deleted media item");
        Ok(deleted)
    }

    /// Writes one row back to the source and applies it to the live record.
    pub fn update(&self, row: MediaRow) -> CatalogResult<bool> {
        let id = row.id;
        let updated = self.point_write(move |conn, weak| {
            let updated = conn.update(&row)?;
            if updated {
                with_inner(weak, |inner| {
                    inner.admit(&row);
                });
            }
            Ok(updated)
        })?;
        debug!(id, updated, "Updated media item");
        Ok(updated)
    }

    /// Sets or clears the favorite flag of one item.
    pub fn set_favorite(&self, id: MediaId, favorite: bool) -> CatalogResult<()> {
        let store = self
            .inner
            .flags
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no flag store configured"))?;
        let mut flags = store.get(id)?;
        flags.favorite = favorite;
        store.put(id, flags)?;

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .worker
            .post(move || with_inner(&weak, |inner| inner.apply_flags(id, flags)));
        Ok(())
    }

    /// Containers in display order.
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.inner.discovery.containers()
    }

    /// Media count of one container as of the last discovery pass.
    pub fn container_count(&self, id: ContainerId) -> usize {
        self.inner.discovery.count_for(id)
    }

    pub fn subscribe_containers<F>(
        &self,
        callback: F,
        context: Option<Arc<dyn DeliveryContext>>,
    ) -> Handle
    where
        F: Fn(&ViewChange) + Send + Sync + 'static,
    {
        self.inner.discovery.subscribe(callback, context)
    }

    /// Waits until every task queued on the worker so far has run.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.inner.worker.flush(timeout)
    }

    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            table: self.inner.table.stats(),
            hub: self.inner.hub.stats(),
            views: self.inner.views.lock().len(),
            containers: self.inner.discovery.len(),
            source_failures: self.inner.broker.failure_count(),
            worker_panics: self.inner.worker.panicked_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContainerKind, ContainerRow};
    use crate::runtime::LoopContext;
    use crate::source::MemorySource;
    use crate::views::{MediaFilter, SortOrder};
    use std::thread;

    const SETTLE: Duration = Duration::from_millis(80);
    const GRACE: Duration = Duration::from_millis(150);
    const WAIT: Duration = Duration::from_secs(5);

    fn row(id: MediaId) -> MediaRow {
        MediaRow::new(id, format!("/media/{id}.jpg"), id * 100)
    }

    fn catalog(source: &MemorySource) -> MediaCatalog {
        MediaCatalog::builder()
            .settle_interval(SETTLE)
            .teardown_grace(GRACE)
            .request_timeout(WAIT)
            .worker_name("test-catalog")
            .build(Arc::new(source.clone()))
    }

    fn settle(catalog: &MediaCatalog) {
        thread::sleep(SETTLE * 3);
        assert!(catalog.flush(WAIT));
        // Work posted by the settled check itself.
        assert!(catalog.flush(WAIT));
    }

    #[test]
    fn test_activation_sets_up_placeholders() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        assert!(!catalog.is_active());

        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));

        assert!(catalog.is_live());
        assert_eq!(source.enumeration_count(), 1);
        assert_eq!(
            catalog.stats().table,
            TableStats {
                placeholders: 3,
                loaded: 0
            }
        );
        assert_eq!(source.watcher_count(), 2);
    }

    #[test]
    fn test_obtain_record_identity() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));

        let first = catalog.obtain_record(2).unwrap();
        let second = catalog.obtain_record(2).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.taken_at(), 200);
        assert!(catalog.obtain_record(42).is_none());
    }

    #[test]
    fn test_view_populated_and_follows_changes() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        let view = catalog.create_view(ViewSpec::new(SortOrder::TakenDesc));
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        assert_eq!(view.ids(), vec![3, 2, 1]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = view.subscribe(move |c| sink.lock().push(*c), None);

        source.remove(1);
        source.upsert(row(4));
        settle(&catalog);

        assert_eq!(view.ids(), vec![4, 3, 2]);
        assert_eq!(
            *seen.lock(),
            vec![
                ViewChange::Removed { start: 2, count: 1 },
                ViewChange::Added { start: 0, count: 1 },
            ]
        );

        // Same object from the view and from the table.
        let from_view = view.get(0).unwrap();
        assert!(Arc::ptr_eq(&from_view, &catalog.obtain_record(4).unwrap()));
    }

    #[test]
    fn test_burst_of_changes_is_one_resync() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        let before = source.enumeration_count();

        for id in 10..20 {
            source.upsert(row(id));
        }
        settle(&catalog);

        assert_eq!(source.enumeration_count(), before + 1);
        assert_eq!(catalog.stats().hub.scheduled_checks, 2, "one per locator");
        assert_eq!(catalog.stats().table.loaded, 10);
    }

    #[test]
    fn test_field_update_reaches_record_subscribers() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        let view = catalog.create_view(ViewSpec::new(SortOrder::TakenAsc));
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        let record = catalog.obtain_record(1).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = catalog.subscribe_records(move |e| sink.lock().push(e.id()), None);

        let mut changed = row(1);
        changed.taken_at = 1_000;
        source.upsert(changed);
        settle(&catalog);

        assert_eq!(record.taken_at(), 1_000);
        assert_eq!(*events.lock(), vec![1]);
        assert_eq!(view.ids(), vec![2, 3, 1]);
    }

    #[test]
    fn test_reactivation_within_grace_keeps_table() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        let view = catalog.create_view(ViewSpec::default());

        let a = catalog.activate();
        let b = catalog.activate();
        assert!(catalog.flush(WAIT));
        let record = catalog.obtain_record(1).unwrap();
        let enumerations = source.enumeration_count();

        a.close();
        assert!(catalog.is_active());
        b.close();
        assert!(!catalog.is_active());

        let _c = catalog.activate();
        thread::sleep(GRACE * 3);
        assert!(catalog.flush(WAIT));

        assert!(catalog.is_live());
        assert_eq!(source.enumeration_count(), enumerations);
        assert_eq!(view.len(), 3);
        assert!(Arc::ptr_eq(&record, &catalog.obtain_record(1).unwrap()));
    }

    #[test]
    fn test_teardown_empties_views_and_restart_refills() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        let view = catalog.create_view(ViewSpec::default());

        let active = catalog.activate();
        assert!(catalog.flush(WAIT));
        assert_eq!(view.len(), 3);

        active.close();
        thread::sleep(GRACE * 3);
        assert!(catalog.flush(WAIT));
        assert!(!catalog.is_live());
        assert!(view.is_empty());
        assert!(catalog.containers().is_empty());
        assert_eq!(source.watcher_count(), 0);
        assert_eq!(catalog.stats().table.loaded, 0);

        // Recently used: identities were kept, so restart resynchronizes.
        source.upsert(row(4));
        let _again = catalog.activate();
        assert!(catalog.flush(WAIT));
        assert_eq!(view.ids(), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_idle_teardown_clears_table() {
        let source = MemorySource::with_rows((1..=2).map(row));
        let catalog = MediaCatalog::builder()
            .settle_interval(SETTLE)
            .teardown_grace(GRACE)
            .retain_ids_window(Duration::ZERO)
            .build(Arc::new(source.clone()));

        let active = catalog.activate();
        assert!(catalog.flush(WAIT));
        active.close();
        thread::sleep(GRACE * 3);
        assert!(catalog.flush(WAIT));

        assert_eq!(catalog.stats().table, TableStats::default());
        assert!(matches!(catalog.lookup(1), Lookup::Absent));
    }

    #[test]
    fn test_delete_updates_views_immediately() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        let view = catalog.create_view(ViewSpec::default());
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));

        assert!(catalog.delete(2).unwrap());
        assert_eq!(view.ids(), vec![3, 1]);
        assert!(!source.ids().contains(&2));
        assert!(!catalog.delete(2).unwrap());
        assert!(matches!(catalog.lookup(2), Lookup::Absent));
    }

    #[test]
    fn test_update_writes_through() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = catalog(&source);
        let view = catalog.create_view(ViewSpec::new(SortOrder::TakenDesc));
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        let record = catalog.obtain_record(1).unwrap();

        let mut changed = row(1);
        changed.taken_at = 10_000;
        assert!(catalog.update(changed).unwrap());
        assert_eq!(record.taken_at(), 10_000);
        assert_eq!(view.ids(), vec![1, 3, 2]);

        assert!(!catalog.update(row(99)).unwrap());
    }

    #[test]
    fn test_favorites_view() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let store = Arc::new(FlagStore::open_in_memory().unwrap());
        let catalog = MediaCatalog::builder()
            .settle_interval(SETTLE)
            .teardown_grace(GRACE)
            .flag_store(Arc::clone(&store))
            .build(Arc::new(source.clone()));
        let favorites = catalog.create_view(ViewSpec::default().filter(MediaFilter::Favorites));
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        assert!(favorites.is_empty());

        catalog.set_favorite(2, true).unwrap();
        assert!(catalog.flush(WAIT));
        assert_eq!(favorites.ids(), vec![2]);
        assert!(store.get(2).unwrap().favorite);

        catalog.set_favorite(2, false).unwrap();
        assert!(catalog.flush(WAIT));
        assert!(favorites.is_empty());
    }

    #[test]
    fn test_set_favorite_requires_flag_store() {
        let source = MemorySource::with_rows([row(1)]);
        let catalog = catalog(&source);
        assert!(matches!(
            catalog.set_favorite(1, true),
            Err(CatalogError::FlagStore(_))
        ));
    }

    #[test]
    fn test_transient_failure_recovers() {
        let source = MemorySource::with_rows((1..=2).map(row));
        let catalog = catalog(&source);
        let view = catalog.create_view(ViewSpec::default());
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));

        source.fail_next_queries(1);
        source.upsert(row(3));
        settle(&catalog);
        assert!(catalog.stats().source_failures >= 1);

        // The next change notification catches up.
        source.touch(&Locator::MEDIA);
        settle(&catalog);
        assert_eq!(view.ids(), vec![3, 2, 1]);
        assert_eq!(catalog.stats().worker_panics, 0);
    }

    #[test]
    fn test_containers_discovered_and_tracked() {
        let source = MemorySource::with_rows([
            row(1).with_container(10),
            row(2).with_container(20),
        ]);
        source.define_container(ContainerRow::new(10, "Camera", ContainerKind::System));
        source.define_container(ContainerRow::new(20, "Holidays", ContainerKind::User));
        let catalog = catalog(&source);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _sub = catalog.subscribe_containers(move |c| sink.lock().push(*c), None);

        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        let names: Vec<String> = catalog.containers().iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec!["Camera", "Holidays"]);
        assert_eq!(*changes.lock(), vec![ViewChange::Added { start: 0, count: 2 }]);

        source.remove(2);
        settle(&catalog);
        assert_eq!(catalog.containers().len(), 1);
        assert_eq!(catalog.container_count(10), 1);
    }

    #[test]
    fn test_change_callback_on_loop_context() {
        let source = MemorySource::with_rows([row(1)]);
        let catalog = catalog(&source);
        let main = Arc::new(LoopContext::new());
        let hits = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&hits);
        let ctx: Arc<dyn DeliveryContext> = main.clone();
        let _registration = catalog.register_change_callback(
            Locator::MEDIA,
            move |_| *sink.lock() += 1,
            Some(ctx),
        );
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));

        source.upsert(row(2));
        source.upsert(row(3));
        assert!(main.pump_until(WAIT, || *hits.lock() > 0));
        main.pump_for(SETTLE * 2);
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn test_capacity_bounded_view() {
        let source = MemorySource::with_rows((1..=10).map(row));
        let catalog = catalog(&source);
        let top = catalog.create_view(ViewSpec::new(SortOrder::TakenDesc).capacity(3));
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        assert_eq!(top.ids(), vec![10, 9, 8]);

        source.upsert(row(20));
        settle(&catalog);
        assert_eq!(top.ids(), vec![20, 10, 9]);

        catalog.release(&top);
        assert!(catalog.flush(WAIT));
        assert!(top.is_empty());
        assert_eq!(catalog.stats().views, 0);
    }

    #[test]
    fn test_new_view_keeps_existing_views_sorted() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let catalog = MediaCatalog::builder()
            .settle_interval(Duration::from_secs(60))
            .teardown_grace(GRACE)
            .request_timeout(WAIT)
            .build(Arc::new(source.clone()));
        let first = catalog.create_view(ViewSpec::new(SortOrder::TakenDesc));
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        assert_eq!(first.ids(), vec![3, 2, 1]);

        // The edit is still inside the settle window when the second view loads it.
        let mut edited = row(1);
        edited.taken_at = 1000;
        source.upsert(edited);
        let second = catalog.create_view(ViewSpec::new(SortOrder::TakenDesc));
        assert!(catalog.flush(WAIT));

        assert_eq!(second.ids(), vec![1, 3, 2]);
        assert_eq!(first.ids(), vec![1, 3, 2]);
    }

    #[test]
    fn test_bounded_view_backfills() {
        let source = MemorySource::with_rows((1..=10).map(row));
        let catalog = catalog(&source);
        let top = catalog.create_view(ViewSpec::new(SortOrder::TakenDesc).capacity(3));
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));
        assert_eq!(top.ids(), vec![10, 9, 8]);

        assert!(catalog.delete(10).unwrap());
        assert_eq!(top.ids(), vec![9, 8, 7]);

        source.remove(9);
        settle(&catalog);
        assert_eq!(top.ids(), vec![8, 7, 6]);

        // A member that sinks below the evicted records is replaced.
        let mut sunk = row(8);
        sunk.taken_at = 1;
        assert!(catalog.update(sunk).unwrap());
        assert_eq!(top.ids(), vec![7, 6, 5]);
    }

    #[test]
    fn test_teardown_keeps_ids_after_long_activation() {
        let source = MemorySource::with_rows((1..=2).map(row));
        let catalog = MediaCatalog::builder()
            .settle_interval(SETTLE)
            .teardown_grace(GRACE)
            .retain_ids_window(GRACE * 3)
            .build(Arc::new(source.clone()));

        let active = catalog.activate();
        assert!(catalog.flush(WAIT));
        // In use for longer than the retain window, with no source changes.
        thread::sleep(GRACE * 4);
        active.close();
        thread::sleep(GRACE * 2);
        assert!(catalog.flush(WAIT));

        assert!(!catalog.is_live());
        assert!(matches!(catalog.lookup(1), Lookup::Placeholder));
        assert_eq!(catalog.stats().table.placeholders, 2);
    }

    #[test]
    fn test_polling_without_native_signals() {
        let source = MemorySource::with_rows([row(1)]);
        let catalog = MediaCatalog::builder()
            .settle_interval(Duration::from_secs(60))
            .teardown_grace(GRACE)
            .poll_interval(Duration::from_millis(50))
            .build(Arc::new(source.clone()));
        let view = catalog.create_view(ViewSpec::default());
        let _active = catalog.activate();
        assert!(catalog.flush(WAIT));

        source.upsert(row(2));
        thread::sleep(Duration::from_millis(300));
        assert!(catalog.flush(WAIT));
        assert_eq!(view.ids(), vec![2, 1]);
    }
}
