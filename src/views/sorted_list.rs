//! Comparator-ordered, optionally capacity-bounded list with range events.
//!
//! Every mutation records `ViewChange` events describing the exact index spans
//! that changed, in the order a consumer must apply them. Batch insertion takes
//! bulk fast paths when it can and otherwise coalesces contiguous single
//! insertions into one event.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tracing::trace;

use crate::models::{Container, ContainerId, MediaId, MediaRecord};

/// A change to a list, in terms of index ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChange {
    /// `count` items now occupy `start..start + count`.
    Added { start: usize, count: usize },
    /// The `count` items at `start..start + count` are gone.
    Removed { start: usize, count: usize },
}

/// Items with a stable identity used for de-duplication.
pub trait Keyed {
    type Key: Copy + Eq + Hash + fmt::Debug;

    fn key(&self) -> Self::Key;
}

impl Keyed for Arc<MediaRecord> {
    type Key = MediaId;

    fn key(&self) -> MediaId {
        self.id()
    }
}

impl Keyed for Arc<Container> {
    type Key = ContainerId;

    fn key(&self) -> ContainerId {
        self.id
    }
}

/// Total order over list items.
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

pub struct SortedList<T: Keyed> {
    items: Vec<T>,
    members: HashSet<T::Key>,
    compare: Comparator<T>,
    capacity: Option<usize>,
    changes: Vec<ViewChange>,
}

impl<T: Keyed> SortedList<T> {
    pub fn new(compare: Comparator<T>, capacity: Option<usize>) -> Self {
        Self {
            items: Vec::new(),
            members: HashSet::new(),
            compare,
            capacity,
            changes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn contains(&self, key: T::Key) -> bool {
        self.members.contains(&key)
    }

    /// Drains the change events recorded since the last call.
    pub fn take_changes(&mut self) -> Vec<ViewChange> {
        std::mem::take(&mut self.changes)
    }

    /// Index after every item that does not sort after `item`.
    fn insertion_index(&self, item: &T) -> usize {
        self.items
            .partition_point(|probe| (self.compare)(probe, item) != Ordering::Greater)
    }

    /// An index at or past the capacity boundary is never admitted.
    fn admits(&self, index: usize) -> bool {
        self.capacity.map_or(true, |cap| index < cap)
    }

    /// Drops the tail beyond capacity, recording one removal.
    fn evict_overflow(&mut self) {
        let Some(cap) = self.capacity else {
            return;
        };
        if self.items.len() <= cap {
            return;
        }
        let count = self.items.len() - cap;
        for evicted in self.items.drain(cap..) {
            self.members.remove(&evicted.key());
        }
        trace!(count, "Evicted view tail");
        self.changes.push(ViewChange::Removed { start: cap, count });
    }

    /// Inserts one item at its sorted position.
    ///
    /// Returns false if the item is already present or would land beyond
    /// the capacity boundary.
    pub fn insert_one(&mut self, item: T) -> bool {
        let key = item.key();
        if self.members.contains(&key) {
            return false;
        }
        let index = self.insertion_index(&item);
        if !self.admits(index) {
            trace!(?key, index, "Rejected insertion beyond capacity");
            return false;
        }

        self.items.insert(index, item);
        self.members.insert(key);
        self.changes.push(ViewChange::Added {
            start: index,
            count: 1,
        });
        self.evict_overflow();
        true
    }

    /// Inserts many items, emitting as few events as possible.
    ///
    /// `pre_sorted` promises the batch is already in comparator order.
    pub fn insert_batch(&mut self, items: Vec<T>, pre_sorted: bool) {
        let mut seen = HashSet::with_capacity(items.len());
        let mut batch: Vec<T> = items
            .into_iter()
            .filter(|item| {
                let key = item.key();
                !self.members.contains(&key) && seen.insert(key)
            })
            .collect();
        if batch.is_empty() {
            return;
        }

        if self.items.is_empty() {
            if !pre_sorted {
                let compare = Arc::clone(&self.compare);
                batch.sort_by(|a, b| compare(a, b));
            }
            self.assign(batch);
            return;
        }

        if pre_sorted {
            batch = match self.try_splice(batch) {
                Ok(()) => return,
                Err(batch) => batch,
            };
        }

        self.insert_coalesced(batch);
    }

    /// Bulk-assigns a sorted batch into an empty list.
    fn assign(&mut self, mut batch: Vec<T>) {
        if let Some(cap) = self.capacity {
            batch.truncate(cap);
        }
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        self.members.extend(batch.iter().map(|item| item.key()));
        self.items = batch;
        self.changes.push(ViewChange::Added { start: 0, count });
    }

    /// Splices a sorted batch that lies entirely before the head or after the tail.
    fn try_splice(&mut self, mut batch: Vec<T>) -> Result<(), Vec<T>> {
        let (Some(head), Some(tail)) = (self.items.first(), self.items.last()) else {
            return Err(batch);
        };
        let (Some(batch_first), Some(batch_last)) = (batch.first(), batch.last()) else {
            return Ok(());
        };

        if (self.compare)(batch_last, head) == Ordering::Less {
            if let Some(cap) = self.capacity {
                batch.truncate(cap);
            }
            let count = batch.len();
            self.members.extend(batch.iter().map(|item| item.key()));
            self.items.splice(0..0, batch);
            self.changes.push(ViewChange::Added { start: 0, count });
            self.evict_overflow();
            return Ok(());
        }

        if (self.compare)(batch_first, tail) == Ordering::Greater {
            let room = self
                .capacity
                .map_or(batch.len(), |cap| cap.saturating_sub(self.items.len()));
            batch.truncate(room);
            if batch.is_empty() {
                return Ok(());
            }
            let start = self.items.len();
            let count = batch.len();
            self.members.extend(batch.iter().map(|item| item.key()));
            self.items.extend(batch);
            self.changes.push(ViewChange::Added { start, count });
            return Ok(());
        }

        Err(batch)
    }

    /// Per-item insertion, flushing one event per contiguous run.
    fn insert_coalesced(&mut self, batch: Vec<T>) {
        let mut run: Option<(usize, usize)> = None;

        for item in batch {
            let index = self.insertion_index(&item);
            if !self.admits(index) {
                continue;
            }

            if let Some((start, count)) = run {
                if index < start || index > start + count {
                    self.changes.push(ViewChange::Added { start, count });
                    run = None;
                }
            }

            let key = item.key();
            self.items.insert(index, item);
            self.members.insert(key);
            run = Some(match run {
                Some((start, count)) => (start, count + 1),
                None => (index, 1),
            });

            let Some(cap) = self.capacity else {
                continue;
            };
            if self.items.len() <= cap {
                continue;
            }

            // Exactly one item overflows: the tail at index `cap`.
            match run {
                Some((start, count)) if start + count > cap => {
                    // The tail is part of the unflushed run; nobody has seen it.
                    if let Some(evicted) = self.items.pop() {
                        self.members.remove(&evicted.key());
                    }
                    run = if count > 1 {
                        Some((start, count - 1))
                    } else {
                        None
                    };
                }
                _ => {
                    if let Some((start, count)) = run.take() {
                        self.changes.push(ViewChange::Added { start, count });
                    }
                    self.evict_overflow();
                }
            }
        }

        if let Some((start, count)) = run {
            self.changes.push(ViewChange::Added { start, count });
        }
    }

    /// Current index of the item with `key`.
    pub fn position(&self, key: T::Key) -> Option<usize> {
        if !self.members.contains(&key) {
            return None;
        }
        self.items.iter().position(|item| item.key() == key)
    }

    /// Removes `item`, locating it by binary search.
    pub fn remove_one(&mut self, item: &T) -> Option<T> {
        let key = item.key();
        if !self.members.contains(&key) {
            return None;
        }
        let index = match self
            .items
            .binary_search_by(|probe| (self.compare)(probe, item))
        {
            Ok(i) if self.items[i].key() == key => Some(i),
            // The sort key changed in place; fall back to a scan.
            _ => self.position(key),
        }?;
        Some(self.remove_at(index))
    }

    /// Removes the item with `key`, wherever it is.
    pub fn remove_key(&mut self, key: T::Key) -> Option<T> {
        let index = self.position(key)?;
        Some(self.remove_at(index))
    }

    fn remove_at(&mut self, index: usize) -> T {
        let removed = self.items.remove(index);
        self.members.remove(&removed.key());
        self.changes.push(ViewChange::Removed {
            start: index,
            count: 1,
        });
        removed
    }

    /// Removes `start..end` (clamped to the list).
    pub fn remove_range(&mut self, start: usize, end: usize) -> Vec<T> {
        let end = end.min(self.items.len());
        if start >= end {
            return Vec::new();
        }
        let removed: Vec<T> = self.items.drain(start..end).collect();
        for item in &removed {
            self.members.remove(&item.key());
        }
        self.changes.push(ViewChange::Removed {
            start,
            count: removed.len(),
        });
        removed
    }

    /// Removes every listed key, one event per contiguous run, highest first.
    pub fn remove_many<I>(&mut self, keys: I) -> usize
    where
        I: IntoIterator<Item = T::Key>,
    {
        let doomed: HashSet<T::Key> = keys
            .into_iter()
            .filter(|key| self.members.contains(key))
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        let mut indices: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| doomed.contains(&item.key()))
            .map(|(i, _)| i)
            .collect();
        indices.reverse();

        let mut runs: Vec<(usize, usize)> = Vec::new();
        for index in indices {
            match runs.last_mut() {
                Some((start, count)) if index + 1 == *start => {
                    *start = index;
                    *count += 1;
                }
                _ => runs.push((index, 1)),
            }
        }

        let mut removed = 0;
        for (start, count) in runs {
            removed += self.remove_range(start, start + count).len();
        }
        removed
    }

    /// Moves an item whose sort key changed in place back into order.
    ///
    /// Returns true if its index changed.
    pub fn reposition(&mut self, key: T::Key) -> bool {
        let Some(index) = self.position(key) else {
            return false;
        };

        let item = self.items.remove(index);
        let target = self.insertion_index(&item);
        self.items.insert(target, item);
        if target == index {
            return false;
        }

        self.changes.push(ViewChange::Removed {
            start: index,
            count: 1,
        });
        self.changes.push(ViewChange::Added {
            start: target,
            count: 1,
        });
        true
    }

    /// True when a bounded list holds as many items as it may.
    pub fn is_full(&self) -> bool {
        self.capacity.is_some_and(|cap| self.items.len() >= cap)
    }

    /// Restores a bounded list to the best `capacity` items of `candidates`.
    ///
    /// `candidates` must cover every item that may belong in the list, current
    /// members included. Members that rank below a better candidate are
    /// dropped and the freed slots are filled in order. Unbounded lists are
    /// left alone.
    pub fn refill<I>(&mut self, candidates: I)
    where
        I: IntoIterator<Item = T>,
    {
        let Some(cap) = self.capacity else {
            return;
        };

        let mut seen = HashSet::new();
        let mut best: Vec<T> = candidates
            .into_iter()
            .filter(|item| seen.insert(item.key()))
            .collect();
        let compare = Arc::clone(&self.compare);
        if cap == 0 {
            best.clear();
        } else if best.len() > cap {
            best.select_nth_unstable_by(cap - 1, |a, b| compare(a, b));
            best.truncate(cap);
        }
        best.sort_by(|a, b| compare(a, b));

        let wanted: HashSet<T::Key> = best.iter().map(|item| item.key()).collect();
        let outranked: Vec<T::Key> = self
            .items
            .iter()
            .map(|item| item.key())
            .filter(|key| !wanted.contains(key))
            .collect();
        self.remove_many(outranked);

        let missing: Vec<T> = best
            .into_iter()
            .filter(|item| !self.members.contains(&item.key()))
            .collect();
        if !missing.is_empty() {
            trace!(count = missing.len(), "Refilling bounded list");
            self.insert_batch(missing, true);
        }
    }

    /// Removes everything with a single event.
    pub fn clear(&mut self) {
        let count = self.items.len();
        if count == 0 {
            return;
        }
        self.items.clear();
        self.members.clear();
        self.changes.push(ViewChange::Removed { start: 0, count });
    }
}
