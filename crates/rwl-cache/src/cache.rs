//! The write-log cache core: facade entry points, the write pipeline,
//! the deferred-write dispatcher, the read path, and the writeback and
//! retire engine driven by the cooperative work loop.
//!
//! Lock order (never acquire an earlier lock while holding a later one):
//! entry-reader rwlock, deferred-dispatch mutex, append mutex, then the
//! big state mutex. Guard, map, pool, gather, sync-point, and tracker
//! mutexes are leaves. Completions never run under any of these.

use crate::entry::{LogEntry, ReaderGuard};
use crate::request::{GuardedRequest, Operation, OperationSet, WriteRequest};
use crate::sync_point::SyncPoint;
use crate::work::{OpTracker, WorkQueue};
use crate::{
    Completion, ImageCache, LogStats, MetricCounters, ReadCompletion, Status, WriteLogConfig,
    WriteLogMetrics, IN_FLIGHT_FLUSH_BYTES_LIMIT, IN_FLIGHT_FLUSH_WRITE_LIMIT,
    MAX_ALLOC_PER_TRANSACTION, OPS_FLUSHED_TOGETHER,
};
use parking_lot::{Mutex, RwLock};
use rwl_error::{Result, RwlError};
use rwl_guard::{BlockGuard, CellHandle, Detain};
use rwl_map::WriteLogMap;
use rwl_pool::{LogPool, PoolTransaction};
use rwl_types::{
    is_block_aligned, slot_flags, BlockExtent, ImageExtent, MIN_WRITE_SIZE,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Rounds of deferred-dispatch / writeback / retire per work-loop wake,
/// bounding starvation of other queued work.
const PROCESS_WORK_ITERATIONS: u32 = 4;

#[derive(Default)]
struct LogState {
    total_log_entries: u32,
    free_log_entries: u32,
    first_free_entry: u32,
    first_valid_entry: u32,
    current_sync_gen: u64,
    current_sync_point: Option<Arc<SyncPoint>>,
    last_op_sequence_num: u64,
    persist_on_flush: bool,
    flush_seen: bool,
    wake_up_requested: bool,
    wake_up_scheduled: bool,
    wake_up_enabled: bool,
    ops_to_flush: VecDeque<Arc<Operation>>,
    ops_to_append: VecDeque<Arc<Operation>>,
    /// Live entries, oldest (ring head) first.
    log_entries: VecDeque<Arc<LogEntry>>,
    dirty_log_entries: VecDeque<Arc<LogEntry>>,
    flush_ops_in_flight: u32,
    flush_bytes_in_flight: u64,
    deferred_writes: VecDeque<Arc<WriteRequest>>,
    free_lanes: u32,
    unpublished_reserves: u32,
    flush_complete_contexts: Vec<Completion>,
}

struct Inner {
    config: WriteLogConfig,
    lower: Arc<dyn ImageCache>,
    pool: Mutex<Option<Arc<LogPool>>>,
    guard: BlockGuard<GuardedRequest>,
    map: WriteLogMap<LogEntry>,
    entry_reader_lock: RwLock<()>,
    deferred_dispatch_lock: Mutex<()>,
    append_lock: Mutex<()>,
    state: Mutex<LogState>,
    work: WorkQueue,
    tracker: OpTracker,
    counters: MetricCounters,
    read_only: AtomicBool,
}

/// Client-side write-back cache journaling writes to a persistent log
/// pool in front of a lower [`ImageCache`] layer.
pub struct WriteLogCache {
    inner: Arc<Inner>,
}

impl WriteLogCache {
    /// Build a cache over `lower`. The pool is not touched until `init`.
    pub fn new(config: WriteLogConfig, lower: Arc<dyn ImageCache>) -> Result<Self> {
        let config = config.validate()?;
        let read_only = config.read_only;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                lower,
                pool: Mutex::new(None),
                guard: BlockGuard::new(),
                map: WriteLogMap::new(),
                entry_reader_lock: RwLock::new(()),
                deferred_dispatch_lock: Mutex::new(()),
                append_lock: Mutex::new(()),
                state: Mutex::new(LogState::default()),
                work: WorkQueue::new("rwl-work"),
                tracker: OpTracker::new(),
                counters: MetricCounters::default(),
                read_only: AtomicBool::new(read_only),
            }),
        })
    }

    /// Mark the image read-only (snapshot current) or writable again.
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::SeqCst);
    }

    #[must_use]
    pub fn metrics(&self) -> WriteLogMetrics {
        self.inner.counters.snapshot()
    }

    #[must_use]
    pub fn log_stats(&self) -> LogStats {
        let state = self.inner.state.lock();
        LogStats {
            total_log_entries: state.total_log_entries,
            free_log_entries: state.free_log_entries,
            first_free_entry: state.first_free_entry,
            first_valid_entry: state.first_valid_entry,
            live_entries: state.log_entries.len(),
            dirty_entries: state.dirty_log_entries.len(),
            free_lanes: state.free_lanes,
            flush_ops_in_flight: state.flush_ops_in_flight,
            deferred_writes: state.deferred_writes.len(),
        }
    }
}

impl ImageCache for WriteLogCache {
    fn read(&self, extents: Vec<ImageExtent>, on_finish: ReadCompletion) {
        self.inner.read(extents, on_finish);
    }

    fn write(&self, extents: Vec<ImageExtent>, data: Vec<u8>, on_finish: Completion) {
        self.inner.write(extents, data, on_finish);
    }

    fn discard(&self, offset: u64, length: u64, skip_partial: bool, on_finish: Completion) {
        self.inner.discard(offset, length, skip_partial, on_finish);
    }

    fn flush(&self, on_finish: Completion) {
        self.inner.aio_flush(on_finish);
    }

    fn writesame(&self, offset: u64, length: u64, data: Vec<u8>, on_finish: Completion) {
        self.inner.writesame(offset, length, data, on_finish);
    }

    fn compare_and_write(
        &self,
        extents: Vec<ImageExtent>,
        cmp_data: Vec<u8>,
        data: Vec<u8>,
        on_finish: Completion,
    ) {
        self.inner.compare_and_write(extents, cmp_data, data, on_finish);
    }

    fn invalidate(&self, on_finish: Completion) {
        self.inner.invalidate(on_finish);
    }

    fn init(&self, on_finish: Completion) {
        self.inner.clone().init(on_finish);
    }

    fn shut_down(&self, on_finish: Completion) {
        self.inner.clone().shut_down(on_finish);
    }
}

/// First error wins when chaining step statuses.
fn first_err(a: Status, b: Status) -> Status {
    if a.is_err() { a } else { b }
}

enum ReadSegment {
    Hit {
        entry: Arc<LogEntry>,
        /// Offset of this hit inside the entry's data buffer.
        buffer_offset: u64,
        length: u64,
        _guard: ReaderGuard,
    },
    Miss {
        length: u64,
    },
}

impl Inner {
    fn pool(&self) -> Result<Arc<LogPool>> {
        self.pool.lock().clone().ok_or(RwlError::ShutDown)
    }

    fn check_writable(&self) -> Status {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(RwlError::ReadOnly);
        }
        Ok(())
    }

    // ── Init and shutdown ───────────────────────────────────────────────

    fn init(self: Arc<Self>, on_finish: Completion) {
        let inner = Arc::clone(&self);
        // The layer below initializes first.
        self.lower.init(Box::new(move |result| match result {
            Ok(()) => inner.rwl_init(on_finish),
            Err(err) => on_finish(Err(err)),
        }));
    }

    fn rwl_init(self: &Arc<Self>, on_finish: Completion) {
        if !self.config.enabled {
            on_finish(Err(RwlError::Layout(
                "write log is disabled by configuration".to_owned(),
            )));
            return;
        }
        let poolset = self.config.poolset_file();
        let pool_file = if poolset.exists() {
            poolset
        } else {
            self.config.pool_file()
        };
        info!(
            event = "rwl_init",
            pool = %pool_file.display(),
            pool_size = self.config.size,
            image_size = self.config.image_size
        );

        let block_size = MIN_WRITE_SIZE as u32;
        let opened = if pool_file.exists() {
            LogPool::open(&pool_file, block_size).map(|(pool, replay)| (pool, Some(replay)))
        } else {
            LogPool::create(&pool_file, self.config.size, block_size).map(|pool| (pool, None))
        };
        let (pool, replay) = match opened {
            Ok(result) => result,
            Err(err) => {
                error!(event = "rwl_init_failed", error = %err);
                on_finish(Err(err));
                return;
            }
        };
        let pool = Arc::new(pool);
        let total = pool.num_log_entries();
        *self.pool.lock() = Some(Arc::clone(&pool));

        {
            let mut state = self.state.lock();
            state.total_log_entries = total;
            state.free_log_entries = total;
            state.free_lanes = self.config.max_concurrent_writes;
            state.persist_on_flush = false;
            state.wake_up_enabled = true;

            if let Some(replay) = replay {
                state.first_free_entry = replay.first_free_entry;
                state.first_valid_entry = replay.first_valid_entry;
                let mut max_gen = 0_u64;
                let mut max_seq = 0_u64;
                for recovered in &replay.entries {
                    let entry = Arc::new(LogEntry::from_slot(recovered.index, recovered.slot));
                    max_gen = max_gen.max(recovered.slot.sync_gen_number);
                    max_seq = max_seq.max(recovered.slot.write_sequence_number);
                    // Insertion in ring order keeps later writes on top.
                    self.map.add(&entry);
                    state.log_entries.push_back(Arc::clone(&entry));
                    // Flushed state is not persisted; replayed entries are
                    // written to the lower layer again.
                    state.dirty_log_entries.push_back(entry);
                }
                state.free_log_entries = total - replay.entries.len() as u32;
                if !replay.entries.is_empty() {
                    state.current_sync_gen = max_gen + 1;
                    state.last_op_sequence_num = max_seq;
                }
                info!(
                    event = "rwl_replayed",
                    entries = replay.entries.len(),
                    sync_gen = state.current_sync_gen
                );
            }

            self.new_sync_point(&mut state);
            if !state.dirty_log_entries.is_empty() {
                self.wake_up(&mut state);
            }
        }
        on_finish(Ok(()));
    }

    fn shut_down(self: Arc<Self>, on_finish: Completion) {
        info!(event = "shutdown_begin");
        let inner = Arc::clone(&self);
        // Wait for in-flight operations, then flush the log down, wait for
        // the internal machinery to go idle, tear down, and shut the lower
        // layer last.
        self.tracker.wait_for_idle(Box::new(move |_| {
            let inner2 = Arc::clone(&inner);
            inner.flush_dirty(Box::new(move |flush_status| {
                {
                    let mut state = inner2.state.lock();
                    state.wake_up_enabled = false;
                }
                let inner3 = Arc::clone(&inner2);
                inner2.tracker.wait_for_idle(Box::new(move |_| {
                    let teardown_status = inner3.teardown();
                    let acc = first_err(flush_status, teardown_status);
                    debug!(event = "shutdown_lower");
                    inner3.lower.shut_down(Box::new(move |lower_status| {
                        let status = first_err(acc, lower_status);
                        info!(event = "shutdown_complete");
                        on_finish(status);
                    }));
                }));
            }));
        }));
    }

    fn teardown(&self) -> Status {
        let entries: Vec<Arc<LogEntry>> = {
            let mut state = self.state.lock();
            if !state.dirty_log_entries.is_empty() {
                warn!(
                    event = "shutdown_dirty_entries",
                    count = state.dirty_log_entries.len()
                );
            }
            state.dirty_log_entries.clear();
            state.current_sync_point = None;
            state.log_entries.drain(..).collect()
        };
        for entry in entries {
            self.map.remove(&entry);
            debug_assert_eq!(entry.referring_map_entries(), 0);
            debug_assert_eq!(entry.reader_count(), 0);
            debug_assert!(!entry.flushing());
        }
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            info!(event = "pool_close", path = %pool.path().display());
            pool.drain()?;
        }
        Ok(())
    }

    // ── Block guard admission ───────────────────────────────────────────

    fn detain_guarded_request(self: &Arc<Self>, request: GuardedRequest) {
        let extent = request.extent;
        match self.guard.detain(extent, request) {
            Detain::Acquired { cell, request } => {
                trace!(
                    event = "guard_issue",
                    start = extent.start,
                    end = extent.end,
                    detained = request.detained
                );
                (request.on_acquire)(cell, request.detained);
            }
            Detain::Queued => {
                debug!(
                    event = "guard_queue",
                    start = extent.start,
                    end = extent.end
                );
            }
        }
    }

    fn release_guarded_request(self: &Arc<Self>, cell: CellHandle) {
        let waiters = self.guard.release(cell);
        for mut waiter in waiters {
            waiter.detained = true;
            self.detain_guarded_request(waiter);
        }
    }

    // ── Write path ──────────────────────────────────────────────────────

    fn write(self: &Arc<Self>, image_extents: Vec<ImageExtent>, data: Vec<u8>, on_finish: Completion) {
        let now = Instant::now();
        self.counters.wr_req.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.check_writable() {
            on_finish(Err(err));
            return;
        }
        if image_extents.is_empty() {
            on_finish(Ok(()));
            return;
        }
        if let Some(bad) = image_extents
            .iter()
            .find(|e| !e.is_block_aligned() || e.length_bytes == 0)
        {
            warn!(
                event = "unaligned_write",
                offset = bad.offset_bytes,
                length = bad.length_bytes
            );
            on_finish(Err(RwlError::Unaligned {
                offset: bad.offset_bytes,
                length: bad.length_bytes,
            }));
            return;
        }
        let total: u64 = image_extents.iter().map(|e| e.length_bytes).sum();
        if total != data.len() as u64 {
            on_finish(Err(RwlError::Layout(format!(
                "payload is {} bytes but extents cover {total}",
                data.len()
            ))));
            return;
        }
        if self.pool.lock().is_none() {
            on_finish(Err(RwlError::ShutDown));
            return;
        }
        self.counters.wr_bytes.fetch_add(total, Ordering::Relaxed);

        let request = Arc::new(WriteRequest::new(image_extents, data, on_finish, now));
        let inner = Arc::clone(self);
        let request_cb = Arc::clone(&request);
        let guarded = GuardedRequest {
            extent: request.summary.block_extent(),
            detained: false,
            on_acquire: Box::new(move |cell, detained| {
                request_cb.detained.store(detained, Ordering::SeqCst);
                if detained {
                    inner.counters.wr_req_overlap.fetch_add(1, Ordering::Relaxed);
                }
                *request_cb.cell.lock() = Some(cell);
                inner.alloc_and_dispatch_write(request_cb);
            }),
        };
        self.detain_guarded_request(guarded);
    }

    /// Dispatch now if nothing is already waiting and resources allocate;
    /// otherwise queue at the back of the deferred FIFO.
    fn alloc_and_dispatch_write(self: &Arc<Self>, request: Arc<WriteRequest>) {
        let mut dispatch_here = self.state.lock().deferred_writes.is_empty();
        if dispatch_here {
            dispatch_here = self.alloc_write_resources(&request);
        }
        if dispatch_here {
            self.dispatch_write(request);
        } else {
            self.counters.wr_req_deferred.fetch_add(1, Ordering::Relaxed);
            let depth = {
                let mut state = self.state.lock();
                state.deferred_writes.push_back(request);
                state.deferred_writes.len()
            };
            debug!(event = "write_deferred", depth);
            self.dispatch_deferred_writes();
        }
    }

    /// All-or-nothing: one lane, one ring slot, and one data buffer per
    /// extent. Buffer reservations happen outside the big lock; the
    /// counters are re-verified after.
    fn alloc_write_resources(self: &Arc<Self>, request: &Arc<WriteRequest>) -> bool {
        let num_extents = request.num_extents();
        debug_assert!(!request.resources.lock().allocated);
        {
            let state = self.state.lock();
            if state.free_lanes < num_extents {
                debug!(
                    event = "alloc_short_lanes",
                    need = num_extents,
                    have = state.free_lanes
                );
                return false;
            }
            if state.free_log_entries < num_extents {
                debug!(
                    event = "alloc_short_entries",
                    need = num_extents,
                    have = state.free_log_entries
                );
                return false;
            }
        }

        let Ok(pool) = self.pool() else {
            return false;
        };
        let mut buffers = Vec::with_capacity(num_extents as usize);
        let mut alloc_succeeds = true;
        for extent in &request.image_extents {
            match pool.reserve(extent.length_bytes) {
                Ok(reservation) => buffers.push(reservation),
                Err(err) => {
                    debug!(event = "alloc_buffer_failed", error = %err);
                    alloc_succeeds = false;
                    break;
                }
            }
        }

        if alloc_succeeds {
            let mut state = self.state.lock();
            if state.free_lanes >= num_extents && state.free_log_entries >= num_extents {
                state.free_lanes -= num_extents;
                state.free_log_entries -= num_extents;
                state.unpublished_reserves += num_extents;
                let mut resources = request.resources.lock();
                resources.allocated = true;
                resources.buffers = buffers;
                *request.allocated_at.lock() = Some(Instant::now());
                return true;
            }
            alloc_succeeds = false;
        }

        pool.cancel(&buffers);
        *request.allocated_at.lock() = Some(Instant::now());
        alloc_succeeds
    }

    /// Build the operation set, copy payloads into the pool, link entries
    /// into the index and the current sync point, and hand the operations
    /// to the persist/append stages. Resources must be allocated.
    fn dispatch_write(self: &Arc<Self>, request: Arc<WriteRequest>) {
        let now = Instant::now();
        *request.dispatched_at.lock() = Some(now);

        let set;
        let log_entries;
        let ops;
        {
            let mut state = self.state.lock();
            let Some(sync_point) = state.current_sync_point.clone() else {
                drop(state);
                request.complete_user(Err(RwlError::ShutDown));
                // Return everything the allocation took.
                let buffers = std::mem::take(&mut request.resources.lock().buffers);
                if let Ok(pool) = self.pool() {
                    pool.cancel(&buffers);
                }
                {
                    let mut state = self.state.lock();
                    let mut resources = request.resources.lock();
                    debug_assert!(resources.allocated);
                    resources.allocated = false;
                    let num_extents = request.num_extents();
                    state.free_lanes += num_extents;
                    state.free_log_entries += num_extents;
                    state.unpublished_reserves -= num_extents;
                }
                if let Some(cell) = request.cell.lock().take() {
                    self.release_guarded_request(cell);
                }
                return;
            };
            let persist_on_flush = state.persist_on_flush;
            set = Arc::new(OperationSet::new(
                Arc::clone(&sync_point),
                persist_on_flush,
                request.summary.block_extent(),
                now,
            ));

            // The set completing means every operation persisted: tell the
            // sync point, then finish the request.
            let on_ops_persist = sync_point.prior_log_entries_persisted.sub();
            let inner = Arc::clone(self);
            let request_done = Arc::clone(&request);
            set.extent_ops.set_finisher(Box::new(move |status| {
                on_ops_persist.complete(status.clone());
                inner.complete_write_request(&request_done, status);
            }));

            debug_assert!(request.resources.lock().allocated);
            let buffers = request.resources.lock().buffers.clone();
            debug_assert_eq!(buffers.len(), request.image_extents.len());
            let mut entries = Vec::with_capacity(buffers.len());
            let mut buffer_offset = 0_usize;
            {
                let mut operations = set.operations.lock();
                for (extent, reservation) in request.image_extents.iter().zip(buffers) {
                    let entry = Arc::new(LogEntry::new(extent.offset_bytes, extent.length_bytes));
                    let sequence = if persist_on_flush {
                        // Sequence 0 is never used.
                        0
                    } else {
                        state.last_op_sequence_num += 1;
                        state.last_op_sequence_num
                    };
                    let sync_gen = state.current_sync_gen;
                    entry.update_ram(|ram| {
                        ram.sync_gen_number = sync_gen;
                        ram.write_sequence_number = sequence;
                        ram.data_buffer_offset = reservation.offset;
                        ram.set_flag(slot_flags::HAS_DATA, true);
                        ram.set_flag(slot_flags::SEQUENCED, sequence != 0);
                        ram.set_flag(slot_flags::SYNC_POINT, false);
                        ram.set_flag(slot_flags::UNMAP, false);
                    });
                    let payload =
                        request.data[buffer_offset..buffer_offset + extent.length_bytes as usize]
                            .to_vec();
                    buffer_offset += extent.length_bytes as usize;
                    let op = Arc::new(Operation::new(&set, Arc::clone(&entry), payload, reservation));
                    operations.push(op);
                    entries.push(entry);
                    self.counters.log_ops.fetch_add(1, Ordering::Relaxed);
                }
            }
            {
                let mut sp_state = sync_point.state.lock();
                sp_state.writes += request.num_extents() as u64;
                sp_state.bytes += request.summary.total_bytes;
            }
            log_entries = entries;
            ops = set.operations.lock().clone();
            *request.op_set.lock() = Some(Arc::clone(&set));
        }

        // All extent-op subs are created.
        set.extent_ops.activate();

        // Copy payloads into their reserved pool buffers.
        for op in &ops {
            if let Ok(pool) = self.pool() {
                if let Err(err) = pool.write_buffer(op.reservation.offset, &op.data) {
                    error!(event = "buffer_copy_failed", error = %err);
                }
            }
            self.counters
                .log_op_bytes
                .fetch_add(op.data.len() as u64, Ordering::Relaxed);
        }

        self.map.add_all(&log_entries);

        if set.persist_on_flush {
            // Done with the caller's buffer; persistence is deferred to
            // the next flush. The guard cell is held until persist.
            request.complete_user(Ok(()));
            self.schedule_flush_and_append(ops);
        } else {
            // The caller is waiting for persistence; use its thread for
            // the buffer flush.
            if let Err(err) = self.flush_pmem_buffers(&ops) {
                error!(event = "buffer_flush_failed", error = %err);
                self.complete_op_log_entries(ops, Err(err));
                return;
            }
            self.schedule_append(ops);
        }
    }

    fn complete_write_request(self: &Arc<Self>, request: &Arc<WriteRequest>, status: Status) {
        let persist_on_flush = request
            .op_set
            .lock()
            .as_ref()
            .is_some_and(|set| set.persist_on_flush);
        if !persist_on_flush {
            request.complete_user(status);
        }
        let arrived_to_alloc = request
            .allocated_at
            .lock()
            .map_or(0, |at| at.duration_since(request.arrived).as_micros() as u64);
        let arrived_to_dispatch = request
            .dispatched_at
            .lock()
            .map_or(0, |at| at.duration_since(request.arrived).as_micros() as u64);
        trace!(
            event = "write_persisted",
            latency_us = request.arrived.elapsed().as_micros() as u64,
            arr_to_all_us = arrived_to_alloc,
            arr_to_dis_us = arrived_to_dispatch,
            detained = request.detained.load(Ordering::SeqCst)
        );
        self.release_write_lanes(request);
        if let Some(cell) = request.cell.lock().take() {
            self.release_guarded_request(cell);
        }
    }

    fn release_write_lanes(self: &Arc<Self>, request: &Arc<WriteRequest>) {
        {
            let mut state = self.state.lock();
            let mut resources = request.resources.lock();
            debug_assert!(resources.allocated);
            state.free_lanes += request.num_extents();
            resources.allocated = false;
        }
        self.dispatch_deferred_writes();
    }

    /// Retry the head of the deferred FIFO until one fails to allocate;
    /// never reorders, never skips.
    fn dispatch_deferred_writes(self: &Arc<Self>) {
        loop {
            let mut dispatched = None;
            {
                let _dispatch = self.deferred_dispatch_lock.lock();
                let front = self.state.lock().deferred_writes.front().cloned();
                let Some(request) = front else {
                    break;
                };
                if self.alloc_write_resources(&request) {
                    let mut state = self.state.lock();
                    let popped = state.deferred_writes.pop_front();
                    debug_assert!(popped.is_some_and(|p| Arc::ptr_eq(&p, &request)));
                    if !state.deferred_writes.is_empty() {
                        self.wake_up(&mut state);
                    }
                    dispatched = Some(request);
                }
            }
            match dispatched {
                Some(request) => self.dispatch_write(request),
                None => break,
            }
        }
    }

    // ── Persist and append stages ───────────────────────────────────────

    fn schedule_flush_and_append(self: &Arc<Self>, ops: Vec<Arc<Operation>>) {
        let need_worker = {
            let mut state = self.state.lock();
            let need = state.ops_to_flush.is_empty();
            state.ops_to_flush.extend(ops);
            trace!(event = "ops_to_flush", depth = state.ops_to_flush.len());
            need
        };
        if need_worker {
            self.tracker.start_op();
            let inner = Arc::clone(self);
            self.work.queue(Box::new(move || {
                inner.flush_then_append_scheduled_ops();
                inner.tracker.finish_op();
            }));
        }
    }

    /// Drain `ops_to_flush` in bounded batches: persist the data buffers
    /// of each batch with one drain, then move them to the append stage.
    fn flush_then_append_scheduled_ops(self: &Arc<Self>) {
        loop {
            let (ops, remain) = {
                let mut state = self.state.lock();
                let count = state.ops_to_flush.len().min(OPS_FLUSHED_TOGETHER);
                let ops: Vec<_> = state.ops_to_flush.drain(..count).collect();
                (ops, !state.ops_to_flush.is_empty())
            };
            if !ops.is_empty() {
                trace!(event = "flush_batch", ops = ops.len());
                match self.flush_pmem_buffers(&ops) {
                    Ok(()) => self.schedule_append(ops),
                    Err(err) => {
                        error!(event = "buffer_flush_failed", error = %err);
                        self.complete_op_log_entries(ops, Err(err));
                    }
                }
            }
            if !remain {
                break;
            }
        }
        self.append_scheduled_ops();
    }

    fn schedule_append(self: &Arc<Self>, ops: Vec<Arc<Operation>>) {
        let need_worker = {
            let mut state = self.state.lock();
            let need = state.ops_to_append.is_empty();
            state.ops_to_append.extend(ops);
            trace!(event = "ops_to_append", depth = state.ops_to_append.len());
            need
        };
        if need_worker {
            self.tracker.start_op();
            let inner = Arc::clone(self);
            self.work.queue(Box::new(move || {
                inner.append_scheduled_ops();
                inner.tracker.finish_op();
            }));
        }
    }

    /// Drain `ops_to_append` in transaction-sized batches under the
    /// append lock.
    fn append_scheduled_ops(self: &Arc<Self>) {
        loop {
            let mut append_status: Status = Ok(());
            let (ops, remain) = {
                let _append = self.append_lock.lock();
                let (ops, remain) = {
                    let mut state = self.state.lock();
                    let count = state.ops_to_append.len().min(MAX_ALLOC_PER_TRANSACTION);
                    let ops: Vec<_> = state.ops_to_append.drain(..count).collect();
                    (ops, !state.ops_to_append.is_empty())
                };
                if !ops.is_empty() {
                    debug!(event = "append_batch", ops = ops.len());
                    match self.pool() {
                        Ok(pool) => {
                            self.alloc_op_log_entries(&ops);
                            append_status = self.append_op_log_entries(&pool, &ops);
                        }
                        Err(err) => append_status = Err(err),
                    }
                }
                (ops, remain)
            };
            let num_ops = ops.len() as u32;
            if num_ops > 0 {
                if let Err(err) = &append_status {
                    error!(event = "append_failed", ops = num_ops, error = %err);
                }
                self.complete_op_log_entries(ops, append_status);
                let mut state = self.state.lock();
                state.unpublished_reserves -= num_ops;
                // New entries may be flushable.
                self.wake_up(&mut state);
            }
            if !remain {
                break;
            }
        }
    }

    /// Stage the data buffers of a batch and fence once.
    fn flush_pmem_buffers(&self, ops: &[Arc<Operation>]) -> Status {
        let pool = self.pool()?;
        let now = Instant::now();
        for op in ops {
            op.times.lock().buf_persist = Some(now);
            pool.flush_buffer(op.reservation.offset, op.log_entry.write_bytes());
        }
        pool.drain()?;
        let comp = Instant::now();
        for op in ops {
            op.times.lock().buf_persist_comp = Some(comp);
        }
        Ok(())
    }

    /// Assign ring slots to the (already reserved) log entries of a batch
    /// and put them on the live and dirty lists.
    fn alloc_op_log_entries(&self, ops: &[Arc<Operation>]) {
        let mut state = self.state.lock();
        // One physical slot beyond the usable count stays unusable so a
        // full ring is distinguishable from an empty one.
        let ring_slots = state.total_log_entries + 1;
        for op in ops {
            op.log_entry.set_index(state.first_free_entry);
            state.first_free_entry = (state.first_free_entry + 1) % ring_slots;
            op.log_entry
                .update_ram(|ram| ram.set_flag(slot_flags::ENTRY_VALID, true));
            state.log_entries.push_back(Arc::clone(&op.log_entry));
            state.dirty_log_entries.push_back(Arc::clone(&op.log_entry));
            trace!(
                event = "log_entry_alloc",
                index = op.log_entry.index(),
                offset = op.log_entry.image_offset_bytes(),
                bytes = op.log_entry.write_bytes()
            );
        }
    }

    /// Copy each record into its ring slot, persist the slot ranges
    /// (split at the ring wrap), then atomically advance `first_free` and
    /// publish the batch's buffer allocations.
    fn append_op_log_entries(&self, pool: &Arc<LogPool>, ops: &[Arc<Operation>]) -> Status {
        if ops.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let mut range_first = 0_u32;
        let mut range_count = 0_u32;
        for op in ops {
            let index = op.log_entry.index();
            if range_count > 0 && index != range_first + range_count {
                // The batch wraps the end of the ring; persist the range
                // accumulated so far.
                debug!(event = "append_wrap_split", first = range_first, count = range_count);
                pool.flush_slots(range_first, range_count);
                range_count = 0;
            }
            if range_count == 0 {
                range_first = index;
            }
            op.times.lock().append = Some(now);
            pool.write_slot(index, &op.log_entry.ram())?;
            range_count += 1;
        }
        pool.flush_slots(range_first, range_count);
        pool.drain()?;

        let first_free = self.state.lock().first_free_entry;
        let tx = PoolTransaction {
            first_free_entry: Some(first_free),
            publish: ops.iter().map(|op| op.reservation).collect(),
            ..PoolTransaction::default()
        };
        pool.commit(&tx)?;

        let comp = Instant::now();
        for op in ops {
            op.times.lock().append_comp = Some(comp);
        }
        Ok(())
    }

    /// Mark the batch's entries completed and fire their persist
    /// completions from the work queue.
    fn complete_op_log_entries(self: &Arc<Self>, ops: Vec<Arc<Operation>>, status: Status) {
        self.tracker.start_op();
        let inner = Arc::clone(self);
        self.work.queue(Box::new(move || {
            for op in &ops {
                op.log_entry.set_completed(true);
                op.sync_point.state.lock().writes_completed += 1;
                let times = *op.times.lock();
                if let (Some(buf), Some(buf_comp), Some(app), Some(app_comp)) = (
                    times.buf_persist,
                    times.buf_persist_comp,
                    times.append,
                    times.append_comp,
                ) {
                    trace!(
                        event = "log_op_complete",
                        index = op.log_entry.index(),
                        buf_persist_us = buf_comp.duration_since(buf).as_micros() as u64,
                        append_us = app_comp.duration_since(app).as_micros() as u64,
                        total_us = op.dispatched.elapsed().as_micros() as u64
                    );
                }
                op.complete(status.clone());
            }
            inner.tracker.finish_op();
        }));
    }

    // ── Sync points ─────────────────────────────────────────────────────

    /// Seal the current sync point (if any) and start its successor.
    /// Caller holds the big lock.
    fn new_sync_point(self: &Arc<Self>, state: &mut LogState) {
        let old_sync_point = state.current_sync_point.clone();
        if old_sync_point.is_some() {
            state.current_sync_gen += 1;
        }
        let new_sync_point = Arc::new(SyncPoint::new(state.current_sync_gen));
        state.current_sync_point = Some(Arc::clone(&new_sync_point));

        if let Some(old) = &old_sync_point {
            {
                let mut old_state = old.state.lock();
                old_state.later = Arc::downgrade(&new_sync_point);
                old_state.final_op_sequence_num = state.last_op_sequence_num;
                new_sync_point.state.lock().earlier = Some(Arc::clone(old));
                // The new sync point cannot append until the old one has
                // persisted.
                let sub = new_sync_point.prior_log_entries_persisted.sub();
                old_state
                    .on_persisted
                    .push(Box::new(move |status| sub.complete(status)));
            }
        }

        // When the gather fires, the sync point is appendable; run that
        // on the work queue so activation under the big lock stays safe.
        let inner = Arc::clone(self);
        let appendable = Arc::clone(&new_sync_point);
        new_sync_point
            .prior_log_entries_persisted
            .set_finisher(Box::new(move |status| {
                inner.tracker.start_op();
                let inner2 = Arc::clone(&inner);
                inner.work.queue(Box::new(move || {
                    inner2.append_sync_point(&appendable, status);
                    inner2.tracker.finish_op();
                }));
            }));

        if let Some(old) = &old_sync_point {
            // This sync point acquires no more sub-ops.
            old.prior_log_entries_persisted.activate();
            debug!(
                event = "sync_point_new",
                sync_gen = new_sync_point.sync_gen_num,
                prior = old.sync_gen_num
            );
        } else {
            debug!(event = "sync_point_first", sync_gen = new_sync_point.sync_gen_num);
        }
    }

    /// The sync point's gather has fired: record the status, unlink it
    /// from its successor, and complete everything waiting on it.
    fn append_sync_point(self: &Arc<Self>, sync_point: &Arc<SyncPoint>, status: Status) {
        let contexts = {
            let _state = self.state.lock();
            let mut sp_state = sync_point.state.lock();
            sp_state.persisted = true;
            sp_state.persisted_status = status.clone();
            if let Some(later) = sp_state.later.upgrade() {
                later.state.lock().earlier = None;
            }
            std::mem::take(&mut sp_state.on_persisted)
        };
        debug!(
            event = "sync_point_persisted",
            sync_gen = sync_point.sync_gen_num,
            waiters = contexts.len()
        );
        for context in contexts {
            context(status.clone());
        }
    }

    // ── Flush entry points ──────────────────────────────────────────────

    /// User-visible flush: guarantees previously completed writes are
    /// persistent in the log. Does not flush the layers below.
    fn aio_flush(self: &Arc<Self>, on_finish: Completion) {
        self.counters.aio_flushes.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.check_writable() {
            on_finish(Err(err));
            return;
        }
        let mut context = Some(on_finish);
        let mut raced_status: Status = Ok(());
        {
            let mut state = self.state.lock();
            if !state.flush_seen {
                state.flush_seen = true;
                if !state.persist_on_flush && self.config.persist_on_write_until_flush {
                    state.persist_on_flush = true;
                    info!(event = "persist_on_flush_enabled");
                }
            }

            if state.persist_on_flush {
                if let Some(current) = state.current_sync_point.clone() {
                    let writes = current.state.lock().writes;
                    if writes > 0 {
                        // Complete this flush when the current sync point
                        // (with all its writes) persists.
                        let ctx = context.take().unwrap_or_else(|| unreachable!());
                        current.state.lock().on_persisted.push(ctx);
                        self.new_sync_point(&mut state);
                    } else {
                        let earlier = current.state.lock().earlier.clone();
                        if let Some(earlier) = earlier {
                            let mut e_state = earlier.state.lock();
                            if e_state.persisted {
                                // Raced with persistence; complete below
                                // with the status it persisted with.
                                raced_status = e_state.persisted_status.clone();
                            } else {
                                let ctx = context.take().unwrap_or_else(|| unreachable!());
                                e_state.on_persisted.push(ctx);
                            }
                        }
                    }
                }
            }
        }
        if let Some(context) = context {
            context(raced_status);
        }
    }

    /// Internal flush: drain every dirty entry down to the lower layer.
    fn flush_dirty(self: &Arc<Self>, on_finish: Completion) {
        self.counters.internal_flushes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.flush_ops_in_flight == 0 && state.dirty_log_entries.is_empty() {
            drop(state);
            debug!(event = "flush_all_clean");
            on_finish(Ok(()));
            return;
        }
        debug!(
            event = "flush_dirty_wait",
            dirty = state.dirty_log_entries.len(),
            in_flight = state.flush_ops_in_flight
        );
        let inner = Arc::clone(self);
        state
            .flush_complete_contexts
            .push(Box::new(move |_| inner.flush_dirty(on_finish)));
        self.wake_up(&mut state);
    }

    fn drain_flush_complete_contexts(&self) {
        let contexts = std::mem::take(&mut self.state.lock().flush_complete_contexts);
        for context in contexts {
            context(Ok(()));
        }
    }

    // ── Read path ───────────────────────────────────────────────────────

    fn read(self: &Arc<Self>, extents: Vec<ImageExtent>, on_finish: ReadCompletion) {
        self.counters.rd_req.fetch_add(1, Ordering::Relaxed);
        if !is_block_aligned(&extents) || extents.iter().any(|e| e.length_bytes == 0) {
            let bad = extents
                .iter()
                .find(|e| !e.is_block_aligned() || e.length_bytes == 0);
            warn!(event = "unaligned_read");
            on_finish(Err(RwlError::Unaligned {
                offset: bad.map_or(0, |e| e.offset_bytes),
                length: bad.map_or(0, |e| e.length_bytes),
            }));
            return;
        }
        let total_bytes: u64 = extents.iter().map(|e| e.length_bytes).sum();
        self.counters.rd_bytes.fetch_add(total_bytes, Ordering::Relaxed);

        // Split each extent into hit segments (backed by log-entry pool
        // buffers, pinned by reader refs) and miss ranges for the layer
        // below.
        let mut segments: Vec<ReadSegment> = Vec::new();
        let mut miss_extents: Vec<ImageExtent> = Vec::new();
        let mut hit_bytes = 0_u64;
        for extent in &extents {
            let _reader = self.entry_reader_lock.read();
            let map_entries = self.map.find_map_entries(extent.block_extent());
            let mut extent_offset = 0_u64;
            for map_entry in map_entries {
                let entry_image = map_entry.extent.image_extent();
                let current = extent.offset_bytes + extent_offset;
                if entry_image.offset_bytes > current {
                    let miss_len = entry_image.offset_bytes - current;
                    miss_extents.push(ImageExtent::new(current, miss_len));
                    segments.push(ReadSegment::Miss { length: miss_len });
                    extent_offset += miss_len;
                }
                let current = extent.offset_bytes + extent_offset;
                debug_assert!(entry_image.offset_bytes <= current);
                let entry_offset = current - entry_image.offset_bytes;
                let hit_len = (entry_image.length_bytes - entry_offset)
                    .min(extent.length_bytes - extent_offset);
                let buffer_offset = (entry_image.offset_bytes
                    - map_entry.entry.image_offset_bytes())
                    + entry_offset;
                let guard = map_entry.entry.add_reader();
                segments.push(ReadSegment::Hit {
                    entry: Arc::clone(&map_entry.entry),
                    buffer_offset,
                    length: hit_len,
                    _guard: guard,
                });
                extent_offset += hit_len;
                hit_bytes += hit_len;
            }
            if extent.length_bytes > extent_offset {
                let current = extent.offset_bytes + extent_offset;
                let miss_len = extent.length_bytes - extent_offset;
                miss_extents.push(ImageExtent::new(current, miss_len));
                segments.push(ReadSegment::Miss { length: miss_len });
            }
        }
        self.counters.rd_hit_bytes.fetch_add(hit_bytes, Ordering::Relaxed);

        let inner = Arc::clone(self);
        if miss_extents.is_empty() {
            // Entirely from the log; no lower-layer read.
            self.counters.rd_hit_req.fetch_add(1, Ordering::Relaxed);
            on_finish(inner.assemble_read(&segments, &[]));
        } else {
            if hit_bytes > 0 {
                self.counters.rd_part_hit_req.fetch_add(1, Ordering::Relaxed);
            }
            self.lower.read(
                miss_extents,
                Box::new(move |result| match result {
                    Ok(miss_data) => on_finish(inner.assemble_read(&segments, &miss_data)),
                    Err(err) => on_finish(Err(err)),
                }),
            );
        }
    }

    /// Splice hit bytes (from the pool) and miss bytes (from the lower
    /// layer) back together in request order.
    fn assemble_read(&self, segments: &[ReadSegment], miss_data: &[u8]) -> Result<Vec<u8>> {
        let total: u64 = segments
            .iter()
            .map(|s| match s {
                ReadSegment::Hit { length, .. } | ReadSegment::Miss { length } => *length,
            })
            .sum();
        let mut out = Vec::with_capacity(total as usize);
        let mut miss_offset = 0_usize;
        for segment in segments {
            match segment {
                ReadSegment::Hit {
                    entry,
                    buffer_offset,
                    length,
                    ..
                } => {
                    let pool = self.pool()?;
                    let start = out.len();
                    out.resize(start + *length as usize, 0);
                    pool.read_buffer(entry.buffer_offset() + buffer_offset, &mut out[start..])?;
                }
                ReadSegment::Miss { length } => {
                    let end = miss_offset + *length as usize;
                    let bytes = miss_data.get(miss_offset..end).ok_or_else(|| {
                        RwlError::Layout("lower layer returned short read".to_owned())
                    })?;
                    out.extend_from_slice(bytes);
                    miss_offset = end;
                }
            }
        }
        Ok(out)
    }

    // ── Discard, writesame, compare-and-write, invalidate ──────────────

    fn discard(self: &Arc<Self>, offset: u64, length: u64, skip_partial: bool, on_finish: Completion) {
        self.counters.discards.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.check_writable() {
            on_finish(Err(err));
            return;
        }
        if length == 0 {
            on_finish(Ok(()));
            return;
        }
        let discard_extent = ImageExtent::new(offset, length);
        // The block-aligned superset guards and invalidates; the original
        // extent goes to the layer below.
        let adjusted = discard_extent.block_extent().image_extent();
        debug!(
            event = "discard",
            offset,
            length,
            adjusted_offset = adjusted.offset_bytes,
            adjusted_length = adjusted.length_bytes
        );

        let inner = Arc::clone(self);
        let guarded = GuardedRequest {
            extent: adjusted.block_extent(),
            detained: false,
            on_acquire: Box::new(move |cell, _detained| {
                // Flush the log, drop log coverage of the region, then
                // forward the discard; the first error wins but every
                // step still runs.
                let inner2 = Arc::clone(&inner);
                inner.flush_dirty(Box::new(move |flush_status| {
                    let invalidate_status = inner2.invalidate_extent(adjusted.block_extent());
                    let acc = first_err(flush_status, invalidate_status);
                    let inner3 = Arc::clone(&inner2);
                    inner2.lower.discard(
                        offset,
                        length,
                        skip_partial,
                        Box::new(move |lower_status| {
                            on_finish(first_err(acc, lower_status));
                            inner3.release_guarded_request(cell);
                        }),
                    );
                }));
            }),
        };
        self.detain_guarded_request(guarded);
    }

    fn writesame(self: &Arc<Self>, offset: u64, length: u64, data: Vec<u8>, on_finish: Completion) {
        if let Err(err) = self.check_writable() {
            on_finish(Err(err));
            return;
        }
        // Not journaled yet; delegated to the layer below.
        self.lower.writesame(offset, length, data, on_finish);
    }

    fn compare_and_write(
        self: &Arc<Self>,
        extents: Vec<ImageExtent>,
        cmp_data: Vec<u8>,
        data: Vec<u8>,
        on_finish: Completion,
    ) {
        if let Err(err) = self.check_writable() {
            on_finish(Err(err));
            return;
        }
        // Not journaled yet; delegated to the layer below.
        self.lower.compare_and_write(extents, cmp_data, data, on_finish);
    }

    /// Full-image invalidate: serialized against all in-flight writes by
    /// the block guard, dropped from the log index, then forwarded below.
    fn invalidate(self: &Arc<Self>, on_finish: Completion) {
        self.counters.invalidates.fetch_add(1, Ordering::Relaxed);
        let full_image = ImageExtent::new(0, self.config.image_size);
        debug_assert!(full_image.is_block_aligned());

        let inner = Arc::clone(self);
        let guarded = GuardedRequest {
            extent: full_image.block_extent(),
            detained: false,
            on_acquire: Box::new(move |cell, _detained| {
                let invalidate_status = inner.invalidate_extent(full_image.block_extent());
                let inner2 = Arc::clone(&inner);
                inner.lower.invalidate(Box::new(move |lower_status| {
                    on_finish(first_err(invalidate_status, lower_status));
                    inner2.release_guarded_request(cell);
                }));
            }),
        };
        self.detain_guarded_request(guarded);
    }

    /// Drop log coverage of a block range so subsequent reads miss to the
    /// lower layer. Entries stay in the ring until flushed and retired.
    fn invalidate_extent(&self, extent: BlockExtent) -> Status {
        let removed = self.map.remove_range(extent);
        info!(
            event = "invalidate_extent",
            start = extent.start,
            end = extent.end,
            map_entries_removed = removed
        );
        Ok(())
    }

    // ── Work loop: deferred dispatch, writeback, retire ────────────────

    /// Request a work-loop pass. Caller holds the big lock.
    fn wake_up(self: &Arc<Self>, state: &mut LogState) {
        if !state.wake_up_enabled {
            debug!(event = "wake_up_disabled");
            return;
        }
        state.wake_up_requested = true;
        if state.wake_up_scheduled {
            return;
        }
        state.wake_up_scheduled = true;
        self.tracker.start_op();
        let inner = Arc::clone(self);
        self.work.queue(Box::new(move || {
            inner.process_work();
            inner.tracker.finish_op();
        }));
    }

    fn process_work(self: &Arc<Self>) {
        let mut iterations = PROCESS_WORK_ITERATIONS;
        loop {
            self.state.lock().wake_up_requested = false;
            self.dispatch_deferred_writes();
            self.process_writeback_dirty_entries();
            while self.retire_entries() {}

            iterations -= 1;
            let requested = self.state.lock().wake_up_requested;
            if !requested || iterations == 0 {
                break;
            }
        }
        let mut state = self.state.lock();
        state.wake_up_scheduled = false;
        if state.wake_up_requested {
            self.wake_up(&mut state);
        }
    }

    fn can_flush_entry(&self, state: &LogState, entry: &Arc<LogEntry>) -> bool {
        entry.completed()
            && state.flush_ops_in_flight < IN_FLIGHT_FLUSH_WRITE_LIMIT
            && state.flush_bytes_in_flight < IN_FLIGHT_FLUSH_BYTES_LIMIT
    }

    /// Pop flushable entries off the dirty list head and send each to the
    /// lower layer; failures requeue at the head for retry.
    fn process_writeback_dirty_entries(self: &Arc<Self>) {
        let mut flush_jobs: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        let all_clean;
        {
            let _reader = self.entry_reader_lock.read();
            let mut state = self.state.lock();
            loop {
                let Some(front) = state.dirty_log_entries.front().cloned() else {
                    break;
                };
                if !self.can_flush_entry(&state, &front) {
                    trace!(event = "writeback_head_not_flushable");
                    break;
                }
                state.dirty_log_entries.pop_front();
                flush_jobs.push(self.construct_flush_job(&mut state, front));
            }
            all_clean = state.flush_ops_in_flight == 0 && state.dirty_log_entries.is_empty();
        }
        for job in flush_jobs {
            job();
        }
        if all_clean {
            self.drain_flush_complete_contexts();
        }
    }

    /// Account the writeback and build the deferred write to the lower
    /// layer. Caller holds the big lock; the job runs outside it.
    fn construct_flush_job(
        self: &Arc<Self>,
        state: &mut LogState,
        entry: Arc<LogEntry>,
    ) -> Box<dyn FnOnce() + Send> {
        let write_bytes = entry.write_bytes();
        state.flush_ops_in_flight += 1;
        state.flush_bytes_in_flight += write_bytes;
        entry.set_flushing(true);
        // Hold a reader ref on the pool buffer until the write completes.
        let guard = entry.add_reader();

        let inner = Arc::clone(self);
        Box::new(move || {
            let extent = ImageExtent::new(entry.image_offset_bytes(), write_bytes);
            let payload = inner.pool().and_then(|pool| {
                let mut buf = vec![0_u8; write_bytes as usize];
                pool.read_buffer(entry.buffer_offset(), &mut buf)?;
                Ok(buf)
            });
            match payload {
                Ok(payload) => {
                    inner.counters.writeback_ops.fetch_add(1, Ordering::Relaxed);
                    inner
                        .counters
                        .writeback_bytes
                        .fetch_add(write_bytes, Ordering::Relaxed);
                    trace!(
                        event = "writeback_start",
                        index = entry.index(),
                        offset = extent.offset_bytes,
                        bytes = write_bytes
                    );
                    let inner2 = Arc::clone(&inner);
                    let entry2 = Arc::clone(&entry);
                    inner.lower.write(
                        vec![extent],
                        payload,
                        Box::new(move |result| {
                            let _guard = guard;
                            inner2.finish_writeback(&entry2, write_bytes, result);
                        }),
                    );
                }
                Err(err) => {
                    drop(guard);
                    error!(event = "writeback_read_failed", error = %err);
                    inner.finish_writeback(&entry, write_bytes, Err(err));
                }
            }
        })
    }

    fn finish_writeback(self: &Arc<Self>, entry: &Arc<LogEntry>, write_bytes: u64, result: Status) {
        let mut state = self.state.lock();
        state.flush_ops_in_flight -= 1;
        state.flush_bytes_in_flight -= write_bytes;
        entry.set_flushing(false);
        match result {
            Ok(()) => {
                entry.set_flushed(true);
                trace!(event = "writeback_done", index = entry.index());
            }
            Err(err) => {
                error!(event = "writeback_failed", index = entry.index(), error = %err);
                state.dirty_log_entries.push_front(Arc::clone(entry));
            }
        }
        self.wake_up(&mut state);
    }

    fn can_retire_entry(entry: &Arc<LogEntry>) -> bool {
        entry.completed() && entry.flushed() && !entry.flushing() && entry.reader_count() == 0
    }

    /// Retire up to one transaction's worth of eligible entries from the
    /// head of the ring: drop them from the index, then atomically
    /// advance `first_valid` and free their data buffers.
    fn retire_entries(self: &Arc<Self>) -> bool {
        let mut retiring: Vec<Arc<LogEntry>> = Vec::new();
        let first_valid_after;
        {
            // Entry readers can't be added while the write half is held.
            let _writer = self.entry_reader_lock.write();
            let mut state = self.state.lock();
            let ring_slots = state.total_log_entries + 1;
            let mut first_valid = state.first_valid_entry;
            while retiring.len() < MAX_ALLOC_PER_TRANSACTION {
                let Some(front) = state.log_entries.front().cloned() else {
                    break;
                };
                if !Self::can_retire_entry(&front) {
                    break;
                }
                debug_assert_eq!(front.index(), first_valid);
                first_valid = (first_valid + 1) % ring_slots;
                state.log_entries.pop_front();
                // No more readers can appear once the map entry is gone.
                self.map.remove(&front);
                debug_assert_eq!(front.referring_map_entries(), 0);
                debug_assert_eq!(front.reader_count(), 0);
                retiring.push(front);
            }
            first_valid_after = first_valid;
        }
        if retiring.is_empty() {
            return false;
        }

        let Ok(pool) = self.pool() else {
            return false;
        };
        let tx = PoolTransaction {
            first_valid_entry: Some(first_valid_after),
            free: retiring
                .iter()
                .filter(|entry| entry.has_data())
                .map(|entry| {
                    (
                        entry.buffer_offset(),
                        rwl_pool::alloc_size(entry.write_bytes()),
                    )
                })
                .collect(),
            ..PoolTransaction::default()
        };
        {
            let _append = self.append_lock.lock();
            if let Err(err) = pool.commit(&tx) {
                error!(event = "retire_commit_failed", error = %err);
                return false;
            }
        }
        {
            let mut state = self.state.lock();
            state.first_valid_entry = first_valid_after;
            state.free_log_entries += retiring.len() as u32;
        }
        self.counters
            .retired_entries
            .fetch_add(retiring.len() as u64, Ordering::Relaxed);
        debug!(
            event = "entries_retired",
            count = retiring.len(),
            first_valid = first_valid_after
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullLower;

    impl ImageCache for NullLower {
        fn read(&self, extents: Vec<ImageExtent>, on_finish: ReadCompletion) {
            let total: u64 = extents.iter().map(|e| e.length_bytes).sum();
            on_finish(Ok(vec![0_u8; total as usize]));
        }
        fn write(&self, _extents: Vec<ImageExtent>, _data: Vec<u8>, on_finish: Completion) {
            on_finish(Ok(()));
        }
        fn discard(&self, _offset: u64, _length: u64, _skip_partial: bool, on_finish: Completion) {
            on_finish(Ok(()));
        }
        fn flush(&self, on_finish: Completion) {
            on_finish(Ok(()));
        }
        fn writesame(&self, _offset: u64, _length: u64, _data: Vec<u8>, on_finish: Completion) {
            on_finish(Ok(()));
        }
        fn compare_and_write(
            &self,
            _extents: Vec<ImageExtent>,
            _cmp_data: Vec<u8>,
            _data: Vec<u8>,
            on_finish: Completion,
        ) {
            on_finish(Ok(()));
        }
        fn invalidate(&self, on_finish: Completion) {
            on_finish(Ok(()));
        }
        fn init(&self, on_finish: Completion) {
            on_finish(Ok(()));
        }
        fn shut_down(&self, on_finish: Completion) {
            on_finish(Ok(()));
        }
    }

    fn status_of<F>(run: F) -> Status
    where
        F: FnOnce(Completion),
    {
        let (tx, rx) = std::sync::mpsc::channel();
        run(Box::new(move |status| {
            let _ = tx.send(status);
        }));
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn write_before_init_is_rejected() {
        let cache = WriteLogCache::new(WriteLogConfig::default(), Arc::new(NullLower)).unwrap();
        let status = status_of(|done| {
            cache.write(
                vec![ImageExtent::new(0, MIN_WRITE_SIZE)],
                vec![0_u8; MIN_WRITE_SIZE as usize],
                done,
            );
        });
        assert!(matches!(status, Err(RwlError::ShutDown)));
    }

    #[test]
    fn read_only_cache_rejects_writes() {
        let config = WriteLogConfig {
            read_only: true,
            ..WriteLogConfig::default()
        };
        let cache = WriteLogCache::new(config, Arc::new(NullLower)).unwrap();
        let status = status_of(|done| {
            cache.write(
                vec![ImageExtent::new(0, MIN_WRITE_SIZE)],
                vec![0_u8; MIN_WRITE_SIZE as usize],
                done,
            );
        });
        assert!(matches!(status, Err(RwlError::ReadOnly)));

        let status = status_of(|done| cache.discard(0, MIN_WRITE_SIZE, false, done));
        assert!(matches!(status, Err(RwlError::ReadOnly)));
    }

    #[test]
    fn unaligned_write_is_rejected_without_state_change() {
        let cache = WriteLogCache::new(WriteLogConfig::default(), Arc::new(NullLower)).unwrap();
        let before = cache.log_stats();
        let status = status_of(|done| {
            cache.write(vec![ImageExtent::new(1, 100)], vec![0_u8; 100], done);
        });
        assert!(matches!(status, Err(RwlError::Unaligned { .. })));
        assert_eq!(cache.log_stats(), before);
    }
}
