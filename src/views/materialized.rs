//! Live projections of the catalog table.
//!
//! A `MaterializedView` is a filtered, ordered and optionally bounded list of
//! shared records. Mutations happen on the catalog worker; reads are safe from
//! any thread. Change events are emitted after the list lock is released so a
//! subscriber may read the view from inside its callback.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::sorted_list::{Comparator, SortedList, ViewChange};
use crate::models::{ContainerId, MediaId, MediaKind, MediaRecord};
use crate::runtime::{DeliveryContext, Handle, Subscribers};

/// Built-in sort orders. Every order breaks ties by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Newest capture time first.
    #[default]
    TakenDesc,
    TakenAsc,
    ModifiedDesc,
    NameAsc,
    SizeDesc,
}

impl SortOrder {
    pub fn comparator(self) -> Comparator<Arc<MediaRecord>> {
        match self {
            SortOrder::TakenDesc => Arc::new(|a: &Arc<MediaRecord>, b: &Arc<MediaRecord>| {
                b.taken_at().cmp(&a.taken_at()).then_with(|| by_id(a, b))
            }),
            SortOrder::TakenAsc => Arc::new(|a: &Arc<MediaRecord>, b: &Arc<MediaRecord>| {
                a.taken_at().cmp(&b.taken_at()).then_with(|| by_id(a, b))
            }),
            SortOrder::ModifiedDesc => Arc::new(|a: &Arc<MediaRecord>, b: &Arc<MediaRecord>| {
                b.mtime().cmp(&a.mtime()).then_with(|| by_id(a, b))
            }),
            SortOrder::NameAsc => Arc::new(|a: &Arc<MediaRecord>, b: &Arc<MediaRecord>| {
                a.display_name()
                    .to_lowercase()
                    .cmp(&b.display_name().to_lowercase())
                    .then_with(|| by_id(a, b))
            }),
            SortOrder::SizeDesc => Arc::new(|a: &Arc<MediaRecord>, b: &Arc<MediaRecord>| {
                b.size().cmp(&a.size()).then_with(|| by_id(a, b))
            }),
        }
    }
}

fn by_id(a: &Arc<MediaRecord>, b: &Arc<MediaRecord>) -> Ordering {
    a.id().cmp(&b.id())
}

/// Which records a view admits. Hidden records are never admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaFilter {
    #[default]
    All,
    Kind(MediaKind),
    Container(ContainerId),
    Favorites,
}

impl MediaFilter {
    pub fn matches(&self, record: &MediaRecord) -> bool {
        let flags = record.flags();
        if flags.hidden {
            return false;
        }
        match *self {
            MediaFilter::All => true,
            MediaFilter::Kind(kind) => record.kind() == kind,
            MediaFilter::Container(id) => record.container_id() == id,
            MediaFilter::Favorites => flags.favorite,
        }
    }
}

/// Parameters for [`MediaCatalog::create_view`](crate::MediaCatalog::create_view).
#[derive(Clone)]
pub struct ViewSpec {
    pub comparator: Comparator<Arc<MediaRecord>>,
    pub capacity: Option<usize>,
    pub filter: MediaFilter,
}

impl ViewSpec {
    pub fn new(order: SortOrder) -> Self {
        Self {
            comparator: order.comparator(),
            capacity: None,
            filter: MediaFilter::All,
        }
    }

    /// Orders the view with a caller-supplied total order.
    pub fn with_comparator<F>(compare: F) -> Self
    where
        F: Fn(&Arc<MediaRecord>, &Arc<MediaRecord>) -> Ordering + Send + Sync + 'static,
    {
        Self {
            comparator: Arc::new(compare),
            capacity: None,
            filter: MediaFilter::All,
        }
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn filter(mut self, filter: MediaFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl Default for ViewSpec {
    fn default() -> Self {
        Self::new(SortOrder::default())
    }
}

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

struct ViewInner {
    id: u64,
    filter: MediaFilter,
    list: Mutex<SortedList<Arc<MediaRecord>>>,
    subscribers: Arc<Subscribers<ViewChange>>,
    released: AtomicBool,
    // Set when a bounded view may no longer hold the best candidates.
    needs_refill: AtomicBool,
}

/// An ordered, deduplicated projection of catalog records.
#[derive(Clone)]
pub struct MaterializedView {
    inner: Arc<ViewInner>,
}

impl MaterializedView {
    pub(crate) fn new(spec: ViewSpec) -> Self {
        Self {
            inner: Arc::new(ViewInner {
                id: NEXT_VIEW_ID.fetch_add(1, AtomicOrdering::Relaxed),
                filter: spec.filter,
                list: Mutex::new(SortedList::new(spec.comparator, spec.capacity)),
                subscribers: Subscribers::new("view"),
                released: AtomicBool::new(false),
                needs_refill: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn filter(&self) -> MediaFilter {
        self.inner.filter
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.list.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.inner.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.list.lock().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Arc<MediaRecord>> {
        self.inner.list.lock().get(index).cloned()
    }

    pub fn contains(&self, id: MediaId) -> bool {
        self.inner.list.lock().contains(id)
    }

    /// Copy of the current ordered contents.
    pub fn snapshot(&self) -> Vec<Arc<MediaRecord>> {
        self.inner.list.lock().items().to_vec()
    }

    pub fn ids(&self) -> Vec<MediaId> {
        self.inner
            .list
            .lock()
            .items()
            .iter()
            .map(|record| record.id())
            .collect()
    }

    /// Subscribes to index-range change events.
    pub fn subscribe<F>(&self, callback: F, context: Option<Arc<dyn DeliveryContext>>) -> Handle
    where
        F: Fn(&ViewChange) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(callback, context)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn mark_released(&self) -> bool {
        !self.inner.released.swap(true, AtomicOrdering::AcqRel)
    }

    /// True if a bounded view lost a member or a member sank to its tail.
    pub(crate) fn needs_refill(&self) -> bool {
        self.inner.needs_refill.load(AtomicOrdering::Acquire)
    }

    fn flag_refill(&self, list: &SortedList<Arc<MediaRecord>>) {
        if list.capacity().is_some() {
            self.inner.needs_refill.store(true, AtomicOrdering::Release);
        }
    }

    /// Tops a bounded view back up from every record the catalog holds.
    pub(crate) fn refill(&self, records: &[Arc<MediaRecord>]) {
        if !self.inner.needs_refill.swap(false, AtomicOrdering::AcqRel) {
            return;
        }
        let admitted = records
            .iter()
            .filter(|record| self.inner.filter.matches(record))
            .cloned();
        self.mutate(|list| list.refill(admitted));
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut SortedList<Arc<MediaRecord>>) -> R) -> R {
        let (result, changes) = {
            let mut list = self.inner.list.lock();
            let result = f(&mut list);
            (result, list.take_changes())
        };
        for change in changes {
            trace!(view = self.inner.id, ?change, "View change");
            self.inner.subscribers.emit(change);
        }
        result
    }

    /// Fills the view from a batch of records in arbitrary order.
    pub(crate) fn populate(&self, records: &[Arc<MediaRecord>]) {
        let admitted: Vec<Arc<MediaRecord>> = records
            .iter()
            .filter(|record| self.inner.filter.matches(record))
            .cloned()
            .collect();
        debug!(view = self.inner.id, count = admitted.len(), "Populating view");
        self.mutate(|list| list.insert_batch(admitted, false));
    }

    /// Applies the outcome of one synchronization pass.
    pub(crate) fn apply_batch(&self, created: &[Arc<MediaRecord>], deleted: &[MediaId]) {
        let admitted: Vec<Arc<MediaRecord>> = created
            .iter()
            .filter(|record| self.inner.filter.matches(record))
            .cloned()
            .collect();
        self.mutate(|list| {
            if !deleted.is_empty() && list.remove_many(deleted.iter().copied()) > 0 {
                self.flag_refill(list);
            }
            if !admitted.is_empty() {
                list.insert_batch(admitted, false);
            }
        });
    }

    pub(crate) fn apply_created(&self, record: &Arc<MediaRecord>) {
        if self.inner.filter.matches(record) {
            self.mutate(|list| list.insert_one(Arc::clone(record)));
        }
    }

    pub(crate) fn apply_deleted(&self, id: MediaId) {
        self.mutate(|list| {
            if list.remove_key(id).is_some() {
                self.flag_refill(list);
            }
        });
    }

    /// Re-evaluates membership and position after an in-place update.
    pub(crate) fn apply_updated(&self, record: &Arc<MediaRecord>) {
        let admitted = self.inner.filter.matches(record);
        self.mutate(|list| {
            let member = list.contains(record.id());
            match (member, admitted) {
                (true, true) => {
                    list.reposition(record.id());
                    // A better record may have been evicted earlier.
                    if list.is_full() && list.position(record.id()) == Some(list.len() - 1) {
                        self.flag_refill(list);
                    }
                }
                (true, false) => {
                    list.remove_key(record.id());
                    self.flag_refill(list);
                }
                (false, true) => {
                    list.insert_one(Arc::clone(record));
                }
                (false, false) => {}
            }
        });
    }

    /// Empties the view with a single event.
    pub(crate) fn clear(&self) {
        self.inner.needs_refill.store(false, AtomicOrdering::Release);
        self.mutate(|list| list.clear());
    }
}
