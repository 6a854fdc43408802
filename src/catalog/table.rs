//! The identity-mapped media table.
//!
//! Every key is either a placeholder (known to exist, not loaded yet) or a
//! loaded record. A loaded record is the only live object for its identity:
//! updates mutate it in place. Mutation is reserved for the catalog worker;
//! the map itself sits behind a mutex so other threads can read it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::SourceResult;
use crate::models::{FlagStore, MediaFlags, MediaId, MediaRecord, MediaRow};
use crate::runtime::{DeliveryContext, Handle, Subscribers};
use crate::source::SourceConnection;

/// Record-level change events.
#[derive(Debug, Clone)]
pub enum RecordEvent {
    Created(Arc<MediaRecord>),
    Updated(Arc<MediaRecord>),
    /// The last-known record, when one was loaded.
    Deleted {
        id: MediaId,
        record: Option<Arc<MediaRecord>>,
    },
}

impl RecordEvent {
    pub fn id(&self) -> MediaId {
        match self {
            RecordEvent::Created(record) | RecordEvent::Updated(record) => record.id(),
            RecordEvent::Deleted { id, .. } => *id,
        }
    }
}

enum Slot {
    Placeholder,
    Loaded(Arc<MediaRecord>),
}

/// What the table holds for an identity.
#[derive(Debug, Clone)]
pub enum Lookup {
    Absent,
    Placeholder,
    Loaded(Arc<MediaRecord>),
}

/// Result of [`CatalogTable::obtain`].
#[derive(Debug, Clone)]
pub enum Obtained {
    /// A placeholder was hydrated into a new record.
    Created(Arc<MediaRecord>),
    /// The live record changed in place.
    Updated(Arc<MediaRecord>),
    Unchanged(Arc<MediaRecord>),
    /// The identity is not in the table.
    Absent,
}

impl Obtained {
    pub fn record(&self) -> Option<&Arc<MediaRecord>> {
        match self {
            Obtained::Created(r) | Obtained::Updated(r) | Obtained::Unchanged(r) => Some(r),
            Obtained::Absent => None,
        }
    }

    pub fn into_record(self) -> Option<Arc<MediaRecord>> {
        match self {
            Obtained::Created(r) | Obtained::Updated(r) | Obtained::Unchanged(r) => Some(r),
            Obtained::Absent => None,
        }
    }
}

/// Outcome of one set-difference pass.
#[derive(Debug, Default, Clone)]
pub struct SyncOutcome {
    pub created: Vec<Arc<MediaRecord>>,
    pub deleted: Vec<MediaId>,
    /// New identities whose rows could not be read; kept as placeholders.
    pub unresolved: usize,
}

impl SyncOutcome {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty() && self.unresolved == 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub placeholders: usize,
    pub loaded: usize,
}

pub struct CatalogTable {
    entries: Mutex<HashMap<MediaId, Slot>>,
    flags: Option<Arc<FlagStore>>,
    events: Arc<Subscribers<RecordEvent>>,
    last_activity: Mutex<Option<Instant>>,
    initialized: AtomicBool,
}

impl CatalogTable {
    pub fn new(flags: Option<Arc<FlagStore>>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            flags,
            events: Subscribers::new("records"),
            last_activity: Mutex::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// True once `setup` has populated the key set and until it is cleared.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn subscribe<F>(&self, callback: F, context: Option<Arc<dyn DeliveryContext>>) -> Handle
    where
        F: Fn(&RecordEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback, context)
    }

    /// Records that the table is in use, for the teardown policy.
    pub fn touch(&self) {
        *self.last_activity.lock() = Some(Instant::now());
    }

    fn flags_for(&self, id: MediaId) -> MediaFlags {
        let Some(store) = &self.flags else {
            return MediaFlags::default();
        };
        store.get(id).unwrap_or_else(|e| {
            warn!(id, error = ?e, "Failed to read media flags");
            MediaFlags::default()
        })
    }

    /// Enumerates every identity and inserts it as a placeholder. No events.
    pub fn setup(&self, conn: &mut dyn SourceConnection) -> SourceResult<usize> {
        let ids = conn.media_ids()?;
        let count = ids.len();
        {
            let mut entries = self.entries.lock();
            entries.reserve(count);
            for id in ids {
                entries.entry(id).or_insert(Slot::Placeholder);
            }
        }
        self.initialized.store(true, Ordering::Release);
        debug!(count, "Catalog table set up");
        Ok(count)
    }

    /// Reconciles the key set against a fresh enumeration.
    ///
    /// New identities are hydrated eagerly and announced as `Created`;
    /// vanished identities are removed and announced as `Deleted`.
    pub fn synchronize(&self, conn: &mut dyn SourceConnection) -> SourceResult<SyncOutcome> {
        let after: HashSet<MediaId> = conn.media_ids()?.into_iter().collect();

        let (added, removed): (Vec<MediaId>, Vec<MediaId>) = {
            let entries = self.entries.lock();
            let added = after
                .iter()
                .filter(|id| !entries.contains_key(id))
                .copied()
                .collect();
            let removed = entries
                .keys()
                .filter(|id| !after.contains(id))
                .copied()
                .collect();
            (added, removed)
        };
        self.initialized.store(true, Ordering::Release);

        if added.is_empty() && removed.is_empty() {
            trace!("Synchronize found no membership changes");
            return Ok(SyncOutcome::default());
        }

        let mut rows: HashMap<MediaId, MediaRow> = if added.is_empty() {
            HashMap::new()
        } else {
            match conn.query_media(Some(&added)) {
                Ok(rows) => rows.into_iter().map(|row| (row.id, row)).collect(),
                Err(e) => {
                    warn!(count = added.len(), error = %e, "Failed to hydrate new media rows");
                    HashMap::new()
                }
            }
        };
        let hydrated: Vec<(MediaRow, MediaFlags)> = added
            .iter()
            .filter_map(|id| rows.remove(id))
            .map(|row| {
                let flags = self.flags_for(row.id);
                (row, flags)
            })
            .collect();

        let mut outcome = SyncOutcome::default();
        let mut events = Vec::with_capacity(added.len() + removed.len());
        {
            let mut entries = self.entries.lock();
            for id in &added {
                entries.insert(*id, Slot::Placeholder);
            }
            outcome.unresolved = added.len() - hydrated.len();
            for (row, flags) in hydrated {
                let record = MediaRecord::new(row, flags);
                entries.insert(record.id(), Slot::Loaded(Arc::clone(&record)));
                events.push(RecordEvent::Created(Arc::clone(&record)));
                outcome.created.push(record);
            }
            for id in removed {
                let record = match entries.remove(&id) {
                    Some(Slot::Loaded(record)) => Some(record),
                    _ => None,
                };
                events.push(RecordEvent::Deleted { id, record });
                outcome.deleted.push(id);
            }
        }

        debug!(
            created = outcome.created.len(),
            deleted = outcome.deleted.len(),
            unresolved = outcome.unresolved,
            "Synchronized catalog table"
        );

        self.forget_flags(&outcome.deleted);
        for event in events {
            self.events.emit(event);
        }
        Ok(outcome)
    }

    /// Hydrates or updates the record for `row.id`.
    ///
    /// This is the one place records are created, so it must only run on the
    /// catalog worker.
    pub fn obtain(&self, row: &MediaRow) -> Obtained {
        let id = row.id;
        let current = match self.entries.lock().get(&id) {
            None => return Obtained::Absent,
            Some(Slot::Placeholder) => None,
            Some(Slot::Loaded(record)) => Some(Arc::clone(record)),
        };

        if let Some(record) = current {
            if record.apply_row(row) {
                trace!(id, "Media record updated");
                self.events.emit(RecordEvent::Updated(Arc::clone(&record)));
                return Obtained::Updated(record);
            }
            return Obtained::Unchanged(record);
        }

        let record = MediaRecord::new(row.clone(), self.flags_for(id));
        {
            let mut entries = self.entries.lock();
            // Removed while the flags were read.
            let Some(slot) = entries.get_mut(&id) else {
                return Obtained::Absent;
            };
            *slot = Slot::Loaded(Arc::clone(&record));
        }
        trace!(id, "Media record created");
        self.events.emit(RecordEvent::Created(Arc::clone(&record)));
        Obtained::Created(record)
    }

    /// Removes one identity after a point delete. Returns false if unknown.
    pub fn remove(&self, id: MediaId) -> bool {
        let record = match self.entries.lock().remove(&id) {
            None => return false,
            Some(Slot::Placeholder) => None,
            Some(Slot::Loaded(record)) => Some(record),
        };
        self.forget_flags(&[id]);
        self.events.emit(RecordEvent::Deleted { id, record });
        true
    }

    /// Applies new auxiliary flags to a loaded record.
    pub fn apply_flags(&self, id: MediaId, flags: MediaFlags) -> Option<Arc<MediaRecord>> {
        let record = match self.lookup(id) {
            Lookup::Loaded(record) => record,
            _ => return None,
        };
        if !record.apply_flags(flags) {
            return None;
        }
        self.events.emit(RecordEvent::Updated(Arc::clone(&record)));
        Some(record)
    }

    fn forget_flags(&self, ids: &[MediaId]) {
        let Some(store) = &self.flags else {
            return;
        };
        for id in ids {
            if let Err(e) = store.delete(*id) {
                warn!(id, error = ?e, "Failed to delete media flags");
            }
        }
    }

    /// Drops loaded data at teardown.
    ///
    /// With `keep_ids` every record degrades to a placeholder and the key set
    /// survives; otherwise the table is emptied and must be set up again.
    pub fn release(&self, keep_ids: bool) {
        let mut entries = self.entries.lock();
        if keep_ids {
            for slot in entries.values_mut() {
                *slot = Slot::Placeholder;
            }
        } else {
            entries.clear();
            entries.shrink_to_fit();
            self.initialized.store(false, Ordering::Release);
        }
        debug!(keep_ids, count = entries.len(), "Released catalog table");
    }

    /// Releases according to how recently the table was used.
    ///
    /// Returns true if identities were kept.
    pub fn release_idle(&self, retain_window: Duration) -> bool {
        let keep_ids = self
            .last_activity
            .lock()
            .is_some_and(|at| at.elapsed() < retain_window);
        self.release(keep_ids);
        keep_ids
    }

    pub fn lookup(&self, id: MediaId) -> Lookup {
        match self.entries.lock().get(&id) {
            None => Lookup::Absent,
            Some(Slot::Placeholder) => Lookup::Placeholder,
            Some(Slot::Loaded(record)) => Lookup::Loaded(Arc::clone(record)),
        }
    }

    pub fn contains(&self, id: MediaId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<MediaId> {
        let mut ids: Vec<MediaId> = self.entries.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn loaded_ids(&self) -> Vec<MediaId> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Loaded(_)))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Every materialized record, in no particular order.
    pub fn loaded_records(&self) -> Vec<Arc<MediaRecord>> {
        self.entries
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Loaded(record) => Some(Arc::clone(record)),
                Slot::Placeholder => None,
            })
            .collect()
    }

    pub fn stats(&self) -> TableStats {
        let entries = self.entries.lock();
        let loaded = entries
            .values()
            .filter(|slot| matches!(slot, Slot::Loaded(_)))
            .count();
        TableStats {
            placeholders: entries.len() - loaded,
            loaded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MediaSource, MemorySource};

    fn row(id: MediaId) -> MediaRow {
        MediaRow::new(id, format!("/media/{id}.jpg"), id * 10)
    }

    fn recorder(table: &CatalogTable) -> (Arc<Mutex<Vec<RecordEvent>>>, Handle) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = table.subscribe(move |e| sink.lock().push(e.clone()), None);
        (seen, handle)
    }

    #[test]
    fn test_setup_inserts_placeholders_silently() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let mut conn = source.connect().unwrap();
        let table = CatalogTable::new(None);
        let (seen, _handle) = recorder(&table);

        assert_eq!(table.setup(conn.as_mut()).unwrap(), 3);
        assert!(table.is_initialized());
        assert_eq!(table.ids(), vec![1, 2, 3]);
        assert_eq!(
            table.stats(),
            TableStats {
                placeholders: 3,
                loaded: 0
            }
        );
        assert!(seen.lock().is_empty());
        assert_eq!(source.row_query_count(), 0);
    }

    #[test]
    fn test_synchronize_set_difference() {
        let source = MemorySource::with_rows((1..=3).map(row));
        let mut conn = source.connect().unwrap();
        let table = CatalogTable::new(None);
        table.setup(conn.as_mut()).unwrap();
        let (seen, _handle) = recorder(&table);

        source.remove(1);
        source.upsert(row(4));
        let outcome = table.synchronize(conn.as_mut()).unwrap();

        assert_eq!(table.ids(), vec![2, 3, 4]);
        assert_eq!(outcome.deleted, vec![1]);
        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.created[0].id(), 4);

        let events = seen.lock();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RecordEvent::Created(r) if r.id() == 4));
        assert!(matches!(&events[1], RecordEvent::Deleted { id: 1, record: None }));
    }

    #[test]
    fn test_obtain_identity_and_updates() {
        let source = MemorySource::with_rows([row(1)]);
        let mut conn = source.connect().unwrap();
        let table = CatalogTable::new(None);
        table.setup(conn.as_mut()).unwrap();
        let (seen, _handle) = recorder(&table);

        let first = table.obtain(&row(1));
        assert!(matches!(first, Obtained::Created(_)));
        let first = first.into_record().unwrap();

        let again = table.obtain(&row(1));
        assert!(matches!(again, Obtained::Unchanged(_)));
        assert!(Arc::ptr_eq(&first, again.record().unwrap()));

        let changed = row(1).with_size(4096);
        let updated = table.obtain(&changed).into_record().unwrap();
        assert!(Arc::ptr_eq(&first, &updated));
        assert_eq!(first.size(), 4096);

        assert!(matches!(table.obtain(&row(99)), Obtained::Absent));
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_deleted_carries_loaded_record() {
        let source = MemorySource::with_rows([row(1), row(2)]);
        let mut conn = source.connect().unwrap();
        let table = CatalogTable::new(None);
        table.setup(conn.as_mut()).unwrap();
        let record = table.obtain(&row(1)).into_record().unwrap();
        let (seen, _handle) = recorder(&table);

        source.remove(1);
        table.synchronize(conn.as_mut()).unwrap();

        let events = seen.lock();
        match &events[0] {
            RecordEvent::Deleted {
                id: 1,
                record: Some(r),
            } => assert!(Arc::ptr_eq(r, &record)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_rows_stay_placeholders() {
        let source = MemorySource::with_rows([row(1)]);
        let mut conn = source.connect().unwrap();
        let table = CatalogTable::new(None);
        table.setup(conn.as_mut()).unwrap();
        let (seen, _handle) = recorder(&table);

        source.upsert(row(2));

        // The enumeration succeeds, the row query that follows fails.
        struct FlakyRows<'a>(&'a mut dyn SourceConnection);
        impl SourceConnection for FlakyRows<'_> {
            fn media_ids(&mut self) -> SourceResult<Vec<MediaId>> {
                self.0.media_ids()
            }
            fn query_media(&mut self, _ids: Option<&[MediaId]>) -> SourceResult<Vec<MediaRow>> {
                Err(crate::error::SourceError::Query("flaky".into()))
            }
            fn containers(&mut self) -> SourceResult<Vec<crate::models::ContainerRow>> {
                self.0.containers()
            }
            fn delete(&mut self, id: MediaId) -> SourceResult<bool> {
                self.0.delete(id)
            }
            fn update(&mut self, row: &MediaRow) -> SourceResult<bool> {
                self.0.update(row)
            }
        }

        let outcome = table
            .synchronize(&mut FlakyRows(conn.as_mut()))
            .unwrap();
        assert_eq!(outcome.unresolved, 1);
        assert!(seen.lock().is_empty());
        assert!(matches!(table.lookup(2), Lookup::Placeholder));

        // Materializing it later announces the creation.
        assert!(matches!(table.obtain(&row(2)), Obtained::Created(_)));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_release_modes() {
        let source = MemorySource::with_rows((1..=2).map(row));
        let mut conn = source.connect().unwrap();
        let table = CatalogTable::new(None);
        table.setup(conn.as_mut()).unwrap();
        table.obtain(&row(1));

        table.release(true);
        assert_eq!(
            table.stats(),
            TableStats {
                placeholders: 2,
                loaded: 0
            }
        );
        assert!(table.is_initialized());

        table.touch();
        assert!(table.release_idle(Duration::from_secs(60)));
        assert!(!table.release_idle(Duration::ZERO));
        assert!(table.is_empty());
        assert!(!table.is_initialized());
    }

    #[test]
    fn test_flags_hydrated_and_forgotten() {
        let store = Arc::new(FlagStore::open_in_memory().unwrap());
        store
            .put(
                1,
                MediaFlags {
                    favorite: true,
                    hidden: false,
                },
            )
            .unwrap();
        let source = MemorySource::with_rows([row(1)]);
        let mut conn = source.connect().unwrap();
        let table = CatalogTable::new(Some(Arc::clone(&store)));
        table.setup(conn.as_mut()).unwrap();

        let record = table.obtain(&row(1)).into_record().unwrap();
        assert!(record.is_favorite());

        let updated = table.apply_flags(1, MediaFlags::default()).unwrap();
        assert!(!updated.is_favorite());
        assert!(table.apply_flags(1, MediaFlags::default()).is_none());

        store
            .put(
                1,
                MediaFlags {
                    favorite: true,
                    hidden: false,
                },
            )
            .unwrap();
        assert!(table.remove(1));
        assert!(!store.get(1).unwrap().favorite);
    }
}
