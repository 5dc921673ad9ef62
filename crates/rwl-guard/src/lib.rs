#![forbid(unsafe_code)]
//! Block guard: serializes overlapping block-range operations.
//!
//! Each in-flight range holds a *cell*. A request whose range is free
//! acquires a new cell immediately; a request overlapping an in-flight
//! range is queued (detained) behind the first cell it overlaps. Releasing
//! a cell hands its queued requests back to the caller, which re-submits
//! them so they can finally acquire (or queue again behind another cell).
//!
//! Cells never overlap each other, so they live in a `BTreeMap` keyed by
//! range start and overlap lookups walk backwards from the query end.

use parking_lot::Mutex;
use rwl_types::BlockExtent;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::trace;

/// Opaque handle to an acquired cell. Must be passed back to
/// [`BlockGuard::release`] exactly once.
#[derive(Debug)]
pub struct CellHandle {
    id: u64,
}

impl CellHandle {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Outcome of [`BlockGuard::detain`].
#[derive(Debug)]
pub enum Detain<T> {
    /// The range was free: the cell is issued and the request is handed
    /// back so the caller can run it.
    Acquired { cell: CellHandle, request: T },
    /// The range overlaps an in-flight cell: the request is queued and
    /// will be returned from `release` of the cell it waits on.
    Queued,
}

struct Cell<T> {
    id: u64,
    extent: BlockExtent,
    waiters: VecDeque<T>,
}

struct GuardInner<T> {
    /// Cells keyed by range start. Invariant: no two cells overlap.
    cells: BTreeMap<u64, Cell<T>>,
    /// Cell id to range start, for release lookups.
    starts: HashMap<u64, u64>,
    next_id: u64,
}

impl<T> GuardInner<T> {
    /// Start key of the lowest-start cell overlapping `extent`, if any.
    fn first_overlap(&self, extent: BlockExtent) -> Option<u64> {
        let mut found = None;
        for (&start, cell) in self.cells.range(..=extent.end).rev() {
            if cell.extent.end < extent.start {
                break;
            }
            found = Some(start);
        }
        found
    }
}

/// Serializes overlapping block-range operations; see the module docs.
pub struct BlockGuard<T> {
    inner: Mutex<GuardInner<T>>,
}

impl<T> Default for BlockGuard<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockGuard<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(GuardInner {
                cells: BTreeMap::new(),
                starts: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Acquire a cell for `extent`, or queue `request` behind the first
    /// overlapping in-flight cell.
    pub fn detain(&self, extent: BlockExtent, request: T) -> Detain<T> {
        let mut inner = self.inner.lock();
        if let Some(start) = inner.first_overlap(extent) {
            let cell = inner.cells.get_mut(&start).unwrap_or_else(|| {
                unreachable!("overlap scan returned a vacant start key")
            });
            trace!(
                event = "guard_detained",
                start = extent.start,
                end = extent.end,
                behind_cell = cell.id
            );
            cell.waiters.push_back(request);
            return Detain::Queued;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.starts.insert(id, extent.start);
        inner.cells.insert(
            extent.start,
            Cell {
                id,
                extent,
                waiters: VecDeque::new(),
            },
        );
        trace!(
            event = "guard_acquired",
            start = extent.start,
            end = extent.end,
            cell = id
        );
        Detain::Acquired {
            cell: CellHandle { id },
            request,
        }
    }

    /// Drop `cell` and hand back the requests queued behind it, in FIFO
    /// order. The caller re-submits each via `detain`.
    pub fn release(&self, cell: CellHandle) -> Vec<T> {
        let mut inner = self.inner.lock();
        let start = inner
            .starts
            .remove(&cell.id)
            .unwrap_or_else(|| unreachable!("released cell {} twice", cell.id));
        let released = inner
            .cells
            .remove(&start)
            .unwrap_or_else(|| unreachable!("cell {} missing from range map", cell.id));
        debug_assert_eq!(released.id, cell.id);
        trace!(
            event = "guard_released",
            cell = cell.id,
            waiters = released.waiters.len()
        );
        released.waiters.into()
    }

    /// Number of cells currently issued.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().cells.len()
    }
}
