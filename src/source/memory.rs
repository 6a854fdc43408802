//! In-process media source with controllable contents.
//!
//! Mutations fire change notifications to every watcher of the affected
//! locators, like a system media index would. Enumeration counters and failure
//! injection make the engine's resync behaviour observable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::{ChangeNotifier, Locator, MediaSource, SourceConnection};
use crate::error::{SourceError, SourceResult};
use crate::models::{ContainerId, ContainerKind, ContainerRow, MediaId, MediaRow};
use crate::runtime::Handle;

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<MediaId, MediaRow>,
    containers: BTreeMap<ContainerId, ContainerRow>,
    watchers: HashMap<u64, (Locator, ChangeNotifier)>,
    next_watch: u64,
    fail_queries: u32,
    offline: bool,
}

#[derive(Default)]
struct Counters {
    connects: AtomicU64,
    enumerations: AtomicU64,
    row_queries: AtomicU64,
    container_queries: AtomicU64,
}

/// A media source held entirely in memory.
#[derive(Clone, Default)]
pub struct MemorySource {
    state: Arc<RwLock<MemoryState>>,
    counters: Arc<Counters>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a source pre-filled with `rows`, without notifying anyone.
    pub fn with_rows(rows: impl IntoIterator<Item = MediaRow>) -> Self {
        let source = Self::new();
        {
            let mut state = source.state.write();
            for row in rows {
                state.rows.insert(row.id, row);
            }
        }
        source
    }

    /// Registers naming information for a container id.
    pub fn define_container(&self, row: ContainerRow) {
        self.state.write().containers.insert(row.id, row);
        self.notify(&[Locator::CONTAINERS]);
    }

    /// Inserts or replaces a row and notifies watchers.
    pub fn upsert(&self, row: MediaRow) {
        self.state.write().rows.insert(row.id, row);
        self.notify(&[Locator::MEDIA, Locator::CONTAINERS]);
    }

    /// Removes a row and notifies watchers. Returns true if it existed.
    pub fn remove(&self, id: MediaId) -> bool {
        let existed = self.state.write().rows.remove(&id).is_some();
        if existed {
            self.notify(&[Locator::MEDIA, Locator::CONTAINERS]);
        }
        existed
    }

    /// Emits a change signal for `locator` without changing anything.
    pub fn touch(&self, locator: &Locator) {
        self.notify(std::slice::from_ref(locator));
    }

    /// Makes the next `count` queries fail with a query error.
    pub fn fail_next_queries(&self, count: u32) {
        self.state.write().fail_queries = count;
    }

    /// While offline, `connect` fails.
    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }

    pub fn ids(&self) -> Vec<MediaId> {
        self.state.read().rows.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().rows.is_empty()
    }

    /// Number of active native subscriptions.
    pub fn watcher_count(&self) -> usize {
        self.state.read().watchers.len()
    }

    /// Number of bulk id enumerations served.
    pub fn enumeration_count(&self) -> u64 {
        self.counters.enumerations.load(Ordering::SeqCst)
    }

    pub fn row_query_count(&self) -> u64 {
        self.counters.row_queries.load(Ordering::SeqCst)
    }

    pub fn container_query_count(&self) -> u64 {
        self.counters.container_queries.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> u64 {
        self.counters.connects.load(Ordering::SeqCst)
    }

    fn notify(&self, locators: &[Locator]) {
        // Collect first; notifiers run without the state lock held.
        let targets: Vec<ChangeNotifier> = self
            .state
            .read()
            .watchers
            .values()
            .filter(|(locator, _)| locators.contains(locator))
            .map(|(_, notify)| Arc::clone(notify))
            .collect();

        trace!(count = targets.len(), "Notifying memory source watchers");
        for notify in targets {
            notify();
        }
    }
}

impl MediaSource for MemorySource {
    fn connect(&self) -> SourceResult<Box<dyn SourceConnection>> {
        if self.state.read().offline {
            return Err(SourceError::Unavailable("memory source is offline".into()));
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            notifier: self.clone(),
        }))
    }

    fn watch(&self, locator: &Locator, notify: ChangeNotifier) -> SourceResult<Handle> {
        let id = {
            let mut state = self.state.write();
            state.next_watch += 1;
            let id = state.next_watch;
            state.watchers.insert(id, (locator.clone(), notify));
            id
        };

        let state = Arc::downgrade(&self.state);
        Ok(Handle::open(format!("memory-watch:{}", locator), move || {
            if let Some(state) = state.upgrade() {
                state.write().watchers.remove(&id);
            }
        }))
    }
}

struct MemoryConnection {
    state: Arc<RwLock<MemoryState>>,
    counters: Arc<Counters>,
    notifier: MemorySource,
}

impl MemoryConnection {
    fn check_failure(&self) -> SourceResult<()> {
        let mut state = self.state.write();
        if state.fail_queries > 0 {
            state.fail_queries -= 1;
            return Err(SourceError::Query("injected failure".into()));
        }
        Ok(())
    }
}

impl SourceConnection for MemoryConnection {
    fn media_ids(&mut self) -> SourceResult<Vec<MediaId>> {
        self.check_failure()?;
        self.counters.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.read().rows.keys().copied().collect())
    }

    fn query_media(&mut self, ids: Option<&[MediaId]>) -> SourceResult<Vec<MediaRow>> {
        self.check_failure()?;
        self.counters.row_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read();
        let rows = match ids {
            Some(ids) => ids
                .iter()
                .filter_map(|id| state.rows.get(id).cloned())
                .collect(),
            None => state.rows.values().cloned().collect(),
        };
        Ok(rows)
    }

    fn containers(&mut self) -> SourceResult<Vec<ContainerRow>> {
        self.check_failure()?;
        self.counters.container_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read();

        let mut counts: BTreeMap<ContainerId, usize> = BTreeMap::new();
        for row in state.rows.values() {
            *counts.entry(row.container_id).or_default() += 1;
        }

        Ok(counts
            .into_iter()
            .map(|(id, count)| {
                let mut row = state.containers.get(&id).cloned().unwrap_or_else(|| {
                    ContainerRow::new(id, format!("bucket-{}", id), ContainerKind::Other)
                });
                row.count = count;
                row
            })
            .collect())
    }

    fn delete(&mut self, id: MediaId) -> SourceResult<bool> {
        self.check_failure()?;
        Ok(self.notifier.remove(id))
    }

    fn update(&mut self, row: &MediaRow) -> SourceResult<bool> {
        self.check_failure()?;
        let existed = self.state.read().rows.contains_key(&row.id);
        if existed {
            self.notifier.upsert(row.clone());
        }
        Ok(existed)
    }
}
