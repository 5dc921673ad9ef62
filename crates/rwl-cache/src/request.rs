//! Per-write request and operation state.
//!
//! A `WriteRequest` owns the block-guard cell for its range and lives
//! until the write persists; the user may be answered earlier in
//! persist-on-flush mode. Each image extent of the request becomes one
//! `Operation` with its own log entry; the operations of one request form
//! an `OperationSet` bound to a single sync point.

use crate::entry::LogEntry;
use crate::gather::{Gather, GatherSub};
use crate::sync_point::SyncPoint;
use crate::{Completion, Status};
use parking_lot::Mutex;
use rwl_guard::CellHandle;
use rwl_pool::Reservation;
use rwl_types::{BlockExtent, ExtentsSummary, ImageExtent};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Instant;
use tracing::trace;

/// A request waiting on (or holding) a block-guard cell.
pub(crate) struct GuardedRequest {
    pub extent: BlockExtent,
    pub detained: bool,
    pub on_acquire: Box<dyn FnOnce(CellHandle, bool) + Send>,
}

#[derive(Debug, Default)]
pub(crate) struct WriteResources {
    pub allocated: bool,
    pub buffers: Vec<Reservation>,
}

pub(crate) struct WriteRequest {
    pub image_extents: Vec<ImageExtent>,
    pub data: Vec<u8>,
    pub summary: ExtentsSummary,
    pub arrived: Instant,
    pub detained: AtomicBool,
    pub cell: Mutex<Option<CellHandle>>,
    pub resources: Mutex<WriteResources>,
    pub op_set: Mutex<Option<Arc<OperationSet>>>,
    pub allocated_at: Mutex<Option<Instant>>,
    pub dispatched_at: Mutex<Option<Instant>>,
    user_completion: Mutex<Option<Completion>>,
}

impl WriteRequest {
    pub(crate) fn new(
        image_extents: Vec<ImageExtent>,
        data: Vec<u8>,
        on_finish: Completion,
        arrived: Instant,
    ) -> Self {
        let summary = ExtentsSummary::new(&image_extents);
        Self {
            image_extents,
            data,
            summary,
            arrived,
            detained: AtomicBool::new(false),
            cell: Mutex::new(None),
            resources: Mutex::new(WriteResources::default()),
            op_set: Mutex::new(None),
            allocated_at: Mutex::new(None),
            dispatched_at: Mutex::new(None),
            user_completion: Mutex::new(Some(on_finish)),
        }
    }

    /// Answer the caller exactly once; later completions are ignored.
    pub(crate) fn complete_user(&self, status: Status) {
        if let Some(on_finish) = self.user_completion.lock().take() {
            on_finish(status);
        } else {
            trace!(event = "user_request_already_completed");
        }
    }

    pub(crate) fn num_extents(&self) -> u32 {
        self.image_extents.len() as u32
    }
}

/// Timing stamps over an operation's pipeline stages.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct OpTimes {
    pub buf_persist: Option<Instant>,
    pub buf_persist_comp: Option<Instant>,
    pub append: Option<Instant>,
    pub append_comp: Option<Instant>,
}

/// One log append: a log entry plus its payload and buffer reservation.
pub(crate) struct Operation {
    pub log_entry: Arc<LogEntry>,
    pub sync_point: Arc<SyncPoint>,
    /// This operation's slice of the request payload.
    pub data: Vec<u8>,
    pub reservation: Reservation,
    pub dispatched: Instant,
    pub times: Mutex<OpTimes>,
    on_write_persist: Mutex<Option<GatherSub>>,
}

impl Operation {
    pub(crate) fn new(
        set: &OperationSet,
        log_entry: Arc<LogEntry>,
        data: Vec<u8>,
        reservation: Reservation,
    ) -> Self {
        Self {
            log_entry,
            sync_point: Arc::clone(&set.sync_point),
            data,
            reservation,
            dispatched: set.dispatched,
            times: Mutex::new(OpTimes::default()),
            on_write_persist: Mutex::new(Some(set.extent_ops.sub())),
        }
    }

    /// Fired when the operation is persisted in the log.
    pub(crate) fn complete(&self, status: Status) {
        if let Some(sub) = self.on_write_persist.lock().take() {
            sub.complete(status);
        }
    }
}

/// The operations of one write request: one sync point, one guard cell,
/// one gather over the per-extent sub-operations.
pub(crate) struct OperationSet {
    pub extent: BlockExtent,
    pub persist_on_flush: bool,
    pub sync_point: Arc<SyncPoint>,
    pub extent_ops: Gather,
    pub operations: Mutex<Vec<Arc<Operation>>>,
    pub dispatched: Instant,
}

impl OperationSet {
    pub(crate) fn new(
        sync_point: Arc<SyncPoint>,
        persist_on_flush: bool,
        extent: BlockExtent,
        dispatched: Instant,
    ) -> Self {
        Self {
            extent,
            persist_on_flush,
            sync_point,
            extent_ops: Gather::new(),
            operations: Mutex::new(Vec::new()),
            dispatched,
        }
    }
}
