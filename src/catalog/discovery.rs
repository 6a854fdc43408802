//! Container discovery.
//!
//! Reconciles the set of grouping containers against the source the same way
//! the table reconciles media, at container granularity. A container object is
//! built once per identity and reused until the catalog is torn down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::SourceResult;
use crate::models::{Container, ContainerId, ContainerRow};
use crate::runtime::{DeliveryContext, Handle, Subscribers};
use crate::source::SourceConnection;
use crate::views::{SortedList, ViewChange};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    pub added: Vec<ContainerId>,
    pub removed: Vec<ContainerId>,
}

pub struct SetDiscovery {
    cache: Mutex<HashMap<ContainerId, Arc<Container>>>,
    list: Mutex<SortedList<Arc<Container>>>,
    counts: Mutex<HashMap<ContainerId, usize>>,
    subscribers: Arc<Subscribers<ViewChange>>,
    refreshes: AtomicU64,
}

impl SetDiscovery {
    pub fn new() -> Self {
        let order = Arc::new(|a: &Arc<Container>, b: &Arc<Container>| Container::display_order(a, b));
        Self {
            cache: Mutex::new(HashMap::new()),
            list: Mutex::new(SortedList::new(order, None)),
            counts: Mutex::new(HashMap::new()),
            subscribers: Subscribers::new("containers"),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Re-derives the container set from the source and emits list changes.
    pub fn refresh(&self, conn: &mut dyn SourceConnection) -> SourceResult<DiscoveryOutcome> {
        let rows: Vec<ContainerRow> = conn
            .containers()?
            .into_iter()
            .filter(|row| row.count > 0)
            .collect();
        self.refreshes.fetch_add(1, Ordering::Relaxed);

        let current: HashSet<ContainerId> = rows.iter().map(|row| row.id).collect();
        let known: HashSet<ContainerId> = self
            .list
            .lock()
            .items()
            .iter()
            .map(|c| c.id)
            .collect();

        let mut outcome = DiscoveryOutcome {
            added: current.difference(&known).copied().collect(),
            removed: known.difference(&current).copied().collect(),
        };
        outcome.added.sort_unstable();
        outcome.removed.sort_unstable();

        let fresh: Vec<Arc<Container>> = {
            let mut cache = self.cache.lock();
            rows.iter()
                .filter(|row| !known.contains(&row.id))
                .map(|row| {
                    Arc::clone(
                        cache
                            .entry(row.id)
                            .or_insert_with(|| Container::from_row(row)),
                    )
                })
                .collect()
        };

        *self.counts.lock() = rows.iter().map(|row| (row.id, row.count)).collect();

        let changes = {
            let mut list = self.list.lock();
            list.remove_many(outcome.removed.iter().copied());
            list.insert_batch(fresh, false);
            list.take_changes()
        };
        for change in changes {
            self.subscribers.emit(change);
        }

        if !outcome.added.is_empty() || !outcome.removed.is_empty() {
            debug!(
                added = outcome.added.len(),
                removed = outcome.removed.len(),
                total = current.len(),
                "Containers changed"
            );
        }
        Ok(outcome)
    }

    /// Forgets every container, emptying the list with one event.
    pub fn release(&self) {
        self.cache.lock().clear();
        self.counts.lock().clear();
        let changes = {
            let mut list = self.list.lock();
            list.clear();
            list.take_changes()
        };
        for change in changes {
            self.subscribers.emit(change);
        }
    }

    pub fn subscribe<F>(&self, callback: F, context: Option<Arc<dyn DeliveryContext>>) -> Handle
    where
        F: Fn(&ViewChange) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback, context)
    }

    /// Containers in display order.
    pub fn containers(&self) -> Vec<Arc<Container>> {
        self.list.lock().items().to_vec()
    }

    pub fn get(&self, id: ContainerId) -> Option<Arc<Container>> {
        self.cache.lock().get(&id).cloned()
    }

    /// Media count reported by the last refresh.
    pub fn count_for(&self, id: ContainerId) -> usize {
        self.counts.lock().get(&id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

impl Default for SetDiscovery {
    fn default() -> Self {
        Self::new()
    }
}
