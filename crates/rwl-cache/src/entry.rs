//! The volatile side of a log entry: a RAM mirror of the persistent
//! record plus runtime bookkeeping (ring index, map references, reader
//! refcounts, completion/flush state).

use parking_lot::Mutex;
use rwl_map::IndexedEntry;
use rwl_types::{BlockExtent, LogEntrySlot};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// One live write in the log. Shared between the write request that
/// created it, the extent index, the dirty list, and in-flight readers;
/// it outlives the request and is dropped at retirement.
pub struct LogEntry {
    /// RAM mirror of the persistent record. Written during dispatch and
    /// append, copied into the pool slot at append time.
    ram: Mutex<LogEntrySlot>,
    index: AtomicU32,
    referring_map_entries: AtomicU32,
    reader_count: AtomicU32,
    completed: AtomicBool,
    flushing: AtomicBool,
    flushed: AtomicBool,
}

impl LogEntry {
    #[must_use]
    pub fn new(image_offset_bytes: u64, write_bytes: u64) -> Self {
        Self {
            ram: Mutex::new(LogEntrySlot::new(image_offset_bytes, write_bytes)),
            index: AtomicU32::new(0),
            referring_map_entries: AtomicU32::new(0),
            reader_count: AtomicU32::new(0),
            completed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            flushed: AtomicBool::new(false),
        }
    }

    /// Rebuild an entry from a persisted record during replay.
    #[must_use]
    pub(crate) fn from_slot(index: u32, slot: LogEntrySlot) -> Self {
        let entry = Self::new(slot.image_offset_bytes, slot.write_bytes);
        *entry.ram.lock() = slot;
        entry.index.store(index, Ordering::SeqCst);
        entry.completed.store(true, Ordering::SeqCst);
        entry
    }

    #[must_use]
    pub(crate) fn ram(&self) -> LogEntrySlot {
        *self.ram.lock()
    }

    pub(crate) fn update_ram(&self, update: impl FnOnce(&mut LogEntrySlot)) {
        update(&mut self.ram.lock());
    }

    #[must_use]
    pub fn image_offset_bytes(&self) -> u64 {
        self.ram.lock().image_offset_bytes
    }

    #[must_use]
    pub fn write_bytes(&self) -> u64 {
        self.ram.lock().write_bytes
    }

    /// Absolute pool offset of the entry's data buffer.
    #[must_use]
    pub fn buffer_offset(&self) -> u64 {
        self.ram.lock().data_buffer_offset
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.ram.lock().has_data()
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.index.load(Ordering::SeqCst)
    }

    pub(crate) fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::SeqCst);
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_completed(&self, value: bool) {
        self.completed.store(value, Ordering::SeqCst);
    }

    #[must_use]
    pub fn flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_flushing(&self, value: bool) {
        self.flushing.store(value, Ordering::SeqCst);
    }

    #[must_use]
    pub fn flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_flushed(&self, value: bool) {
        self.flushed.store(value, Ordering::SeqCst);
    }

    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.reader_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn referring_map_entries(&self) -> u32 {
        self.referring_map_entries.load(Ordering::SeqCst)
    }

    /// Take a scoped reader reference; the entry cannot retire while any
    /// guard is alive.
    #[must_use]
    pub(crate) fn add_reader(self: &Arc<Self>) -> ReaderGuard {
        self.reader_count.fetch_add(1, Ordering::SeqCst);
        ReaderGuard {
            entry: Arc::clone(self),
        }
    }
}

impl IndexedEntry for LogEntry {
    fn block_extent(&self) -> BlockExtent {
        self.ram.lock().block_extent()
    }

    fn map_ref_added(&self) {
        self.referring_map_entries.fetch_add(1, Ordering::SeqCst);
    }

    fn map_ref_removed(&self) {
        let prev = self.referring_map_entries.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }
}

impl std::fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEntry")
            .field("ram", &format_args!("{}", self.ram.lock()))
            .field("index", &self.index())
            .field("referring_map_entries", &self.referring_map_entries())
            .field("reader_count", &self.reader_count())
            .field("completed", &self.completed())
            .field("flushing", &self.flushing())
            .field("flushed", &self.flushed())
            .finish()
    }
}

/// Scoped reader reference on a log entry's pool buffer.
pub(crate) struct ReaderGuard {
    entry: Arc<LogEntry>,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        let prev = self.entry.reader_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_guard_scopes_the_refcount() {
        let entry = Arc::new(LogEntry::new(0, 512));
        let a = entry.add_reader();
        let b = entry.add_reader();
        assert_eq!(entry.reader_count(), 2);
        drop(a);
        assert_eq!(entry.reader_count(), 1);
        drop(b);
        assert_eq!(entry.reader_count(), 0);
    }

    #[test]
    fn replayed_entry_is_completed_but_not_flushed() {
        let mut slot = LogEntrySlot::new(1024, 512);
        slot.sync_gen_number = 3;
        let entry = LogEntry::from_slot(5, slot);
        assert!(entry.completed());
        assert!(!entry.flushed());
        assert_eq!(entry.index(), 5);
        assert_eq!(entry.image_offset_bytes(), 1024);
    }
}
