#![forbid(unsafe_code)]
//! Block-extent to log-entry index.
//!
//! Maps block extents to (portions of) live log entries. The map never
//! contains two overlapping entries: inserting a new entry removes,
//! shrinks, or splits any older map entries it occludes, so a lookup for
//! any block finds exactly the newest write covering it.
//!
//! The index is generic over the entry type through [`IndexedEntry`], which
//! also carries the referring-map-entries accounting: one callback per map
//! entry created or destroyed for a given log entry.

use parking_lot::Mutex;
use rwl_types::BlockExtent;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// A log entry as seen by the index.
pub trait IndexedEntry: Send + Sync {
    /// Full block extent the entry's write covers.
    fn block_extent(&self) -> BlockExtent;
    /// A map entry now refers to this log entry.
    fn map_ref_added(&self);
    /// A map entry referring to this log entry was removed.
    fn map_ref_removed(&self);
}

/// A contiguous live portion of a log entry.
#[derive(Debug)]
pub struct MapEntry<E> {
    pub extent: BlockExtent,
    pub entry: Arc<E>,
}

impl<E> Clone for MapEntry<E> {
    fn clone(&self) -> Self {
        Self {
            extent: self.extent,
            entry: Arc::clone(&self.entry),
        }
    }
}

struct MapInner<E> {
    /// Map entries keyed by extent start. Invariant: no two overlap.
    by_start: BTreeMap<u64, MapEntry<E>>,
}

impl<E: IndexedEntry> MapInner<E> {
    /// Start keys of every map entry overlapping `extent`, in block order.
    fn overlap_keys(&self, extent: BlockExtent) -> Vec<u64> {
        let mut keys = Vec::new();
        for (&start, slot) in self.by_start.range(..=extent.end).rev() {
            if slot.extent.end < extent.start {
                break;
            }
            keys.push(start);
        }
        keys.reverse();
        keys
    }

    fn insert(&mut self, extent: BlockExtent, entry: Arc<E>) {
        entry.map_ref_added();
        self.by_start.insert(extent.start, MapEntry { extent, entry });
    }

    fn remove(&mut self, start: u64) -> MapEntry<E> {
        let slot = self
            .by_start
            .remove(&start)
            .unwrap_or_else(|| unreachable!("map entry at start {start} vanished"));
        slot.entry.map_ref_removed();
        slot
    }

    /// Re-key an entry to a narrower extent without touching its ref count.
    fn adjust(&mut self, start: u64, new_extent: BlockExtent) {
        let slot = self
            .by_start
            .remove(&start)
            .unwrap_or_else(|| unreachable!("map entry at start {start} vanished"));
        self.by_start.insert(
            new_extent.start,
            MapEntry {
                extent: new_extent,
                entry: slot.entry,
            },
        );
    }

    fn add_entry(&mut self, entry: &Arc<E>) {
        let new_extent = entry.block_extent();
        for start in self.overlap_keys(new_extent) {
            let old = self.by_start[&start].extent;
            if new_extent.start <= old.start {
                if new_extent.end >= old.end {
                    // Old entry completely occluded.
                    trace!(event = "map_occluded", start = old.start, end = old.end);
                    self.remove(start);
                } else {
                    // New entry occludes the beginning of the old one.
                    self.adjust(start, BlockExtent::new(new_extent.end + 1, old.end));
                }
            } else if new_extent.end >= old.end {
                // New entry occludes the end of the old one.
                self.adjust(start, BlockExtent::new(old.start, new_extent.start - 1));
            } else {
                // New entry splits the old one; the right remainder is a
                // second map entry referring to the same log entry.
                let split = self.remove(start);
                self.insert(
                    BlockExtent::new(old.start, new_extent.start - 1),
                    Arc::clone(&split.entry),
                );
                self.insert(BlockExtent::new(new_extent.end + 1, old.end), split.entry);
            }
        }
        self.insert(new_extent, Arc::clone(entry));
    }
}

/// The shared index; interior mutex, caller holds any outer read/write
/// coordination (e.g. the entry-reader lock during retire).
pub struct WriteLogMap<E> {
    inner: Mutex<MapInner<E>>,
}

impl<E: IndexedEntry> Default for WriteLogMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: IndexedEntry> WriteLogMap<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MapInner {
                by_start: BTreeMap::new(),
            }),
        }
    }

    /// Insert a log entry covering its full block extent. Older map
    /// entries it overlaps are removed, shrunk, or split.
    pub fn add(&self, entry: &Arc<E>) {
        self.inner.lock().add_entry(entry);
    }

    pub fn add_all(&self, entries: &[Arc<E>]) {
        let mut inner = self.inner.lock();
        for entry in entries {
            inner.add_entry(entry);
        }
    }

    /// Drop every map entry that still refers to `entry`.
    pub fn remove(&self, entry: &Arc<E>) {
        let mut inner = self.inner.lock();
        for start in inner.overlap_keys(entry.block_extent()) {
            if Arc::ptr_eq(&inner.by_start[&start].entry, entry) {
                inner.remove(start);
            }
        }
    }

    /// Drop every map entry overlapping `extent`, making reads of the
    /// range miss to the lower layer. Returns the number removed.
    pub fn remove_range(&self, extent: BlockExtent) -> usize {
        let mut inner = self.inner.lock();
        let keys = inner.overlap_keys(extent);
        let removed = keys.len();
        for start in keys {
            inner.remove(start);
        }
        removed
    }

    /// All map entries overlapping `extent`, in block order.
    #[must_use]
    pub fn find_map_entries(&self, extent: BlockExtent) -> Vec<MapEntry<E>> {
        let inner = self.inner.lock();
        inner
            .overlap_keys(extent)
            .into_iter()
            .map(|start| inner.by_start[&start].clone())
            .collect()
    }

    /// The log entries behind [`Self::find_map_entries`]; an entry appears
    /// once per map entry referring to it, so duplicates are possible.
    #[must_use]
    pub fn find_entries(&self, extent: BlockExtent) -> Vec<Arc<E>> {
        self.find_map_entries(extent)
            .into_iter()
            .map(|map_entry| map_entry.entry)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_start.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
