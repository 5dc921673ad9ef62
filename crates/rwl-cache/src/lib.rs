#![forbid(unsafe_code)]
//! Write-back block cache journaling to a persistent log pool.
//!
//! `WriteLogCache` sits between a block-device client and a lower image
//! layer. Aligned writes are persisted to a log pool and acknowledged as
//! soon as persistence is guaranteed; reads are served from the log where
//! it still holds the newest data; a background engine drains dirty log
//! entries to the lower layer and retires them from the head of the ring.
//!
//! The write path runs in stages: block-guard admission (overlapping
//! ranges are serialized), resource allocation (lanes, ring slots, data
//! buffers), dispatch (payload copied into the pool, entries linked into
//! the extent index and the current sync point), buffer persist, batched
//! log append under one transaction, and completion.

mod cache;
mod entry;
mod gather;
mod request;
mod sync_point;
mod work;

pub use cache::WriteLogCache;
pub use entry::LogEntry;

use rwl_error::Result;
use rwl_types::{DEFAULT_POOL_SIZE, MIN_POOL_SIZE, MIN_WRITE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome delivered to a completion callback.
pub type Status = Result<()>;

/// Completion callback for operations without payload.
pub type Completion = Box<dyn FnOnce(Status) + Send>;

/// Completion callback for reads; carries the assembled bytes.
pub type ReadCompletion = Box<dyn FnOnce(Result<Vec<u8>>) + Send>;

/// Throttle on writes concurrently allocating and persisting.
pub const MAX_CONCURRENT_WRITES: u32 = 256;

/// Operations coalescing one buffer flush+drain round trip.
pub const OPS_FLUSHED_TOGETHER: usize = 4;

/// Operations sharing one append (or retire) transaction.
pub const MAX_ALLOC_PER_TRANSACTION: usize = 8;

/// Bound on concurrent writeback writes to the lower layer.
pub const IN_FLIGHT_FLUSH_WRITE_LIMIT: u32 = 8;

/// Bound on writeback bytes in flight to the lower layer.
pub const IN_FLIGHT_FLUSH_BYTES_LIMIT: u64 = 1024 * 1024;

/// The image-cache surface, implemented by `WriteLogCache` and consumed
/// from the lower layer it caches for.
///
/// All operations are asynchronous: the completion may run on the caller
/// thread (for immediate outcomes) or on an internal worker or lower-layer
/// completion thread. Implementations must accept calls from each other's
/// completion contexts.
pub trait ImageCache: Send + Sync {
    fn read(&self, extents: Vec<rwl_types::ImageExtent>, on_finish: ReadCompletion);
    fn write(&self, extents: Vec<rwl_types::ImageExtent>, data: Vec<u8>, on_finish: Completion);
    fn discard(&self, offset: u64, length: u64, skip_partial: bool, on_finish: Completion);
    fn flush(&self, on_finish: Completion);
    fn writesame(&self, offset: u64, length: u64, data: Vec<u8>, on_finish: Completion);
    fn compare_and_write(
        &self,
        extents: Vec<rwl_types::ImageExtent>,
        cmp_data: Vec<u8>,
        data: Vec<u8>,
        on_finish: Completion,
    );
    fn invalidate(&self, on_finish: Completion);
    fn init(&self, on_finish: Completion);
    fn shut_down(&self, on_finish: Completion);
}

/// Configuration for a [`WriteLogCache`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteLogConfig {
    /// Whether the write log is active. When false, `init` fails and the
    /// owner should use the lower layer directly.
    pub enabled: bool,
    /// Directory holding pool files.
    pub path: PathBuf,
    /// Target pool size in bytes; floored to the pool minimum.
    pub size: u64,
    /// Start in persist-on-write mode and switch to persist-on-flush on
    /// the first user flush. When false, stay in persist-on-write.
    pub persist_on_write_until_flush: bool,
    /// Image identity, used in pool file names.
    pub image_id: String,
    /// Logical image size in bytes (block aligned).
    pub image_size: u64,
    /// Reject writes when set; the owner flips this for snapshots.
    pub read_only: bool,
    /// Lane count; overridable for tests, defaults to
    /// [`MAX_CONCURRENT_WRITES`].
    pub max_concurrent_writes: u32,
}

impl Default for WriteLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("/tmp"),
            size: DEFAULT_POOL_SIZE,
            persist_on_write_until_flush: true,
            image_id: "image".to_owned(),
            image_size: 1 << 30,
            read_only: false,
            max_concurrent_writes: MAX_CONCURRENT_WRITES,
        }
    }
}

impl WriteLogConfig {
    /// Normalize and sanity-check the configuration.
    pub fn validate(mut self) -> Result<Self> {
        self.size = self.size.max(MIN_POOL_SIZE);
        if self.image_id.is_empty() {
            return Err(rwl_error::RwlError::Layout(
                "image_id must not be empty".to_owned(),
            ));
        }
        if self.image_size == 0 || self.image_size % MIN_WRITE_SIZE != 0 {
            return Err(rwl_error::RwlError::Layout(
                "image_size must be a positive multiple of the block size".to_owned(),
            ));
        }
        if self.max_concurrent_writes == 0 {
            return Err(rwl_error::RwlError::Layout(
                "max_concurrent_writes must be > 0".to_owned(),
            ));
        }
        Ok(self)
    }

    /// Pool file for this image; the replicated poolset variant is
    /// preferred at init when present.
    #[must_use]
    pub fn pool_file(&self) -> PathBuf {
        self.path.join(format!("rbd-rwl.{}.pool", self.image_id))
    }

    #[must_use]
    pub fn poolset_file(&self) -> PathBuf {
        self.path.join(format!("rbd-rwl.{}.poolset", self.image_id))
    }
}

/// Monotonic operation counters, snapshot via [`WriteLogCache::metrics`].
#[derive(Debug, Default)]
pub(crate) struct MetricCounters {
    pub rd_req: AtomicU64,
    pub rd_bytes: AtomicU64,
    pub rd_hit_req: AtomicU64,
    pub rd_hit_bytes: AtomicU64,
    pub rd_part_hit_req: AtomicU64,
    pub wr_req: AtomicU64,
    pub wr_bytes: AtomicU64,
    pub wr_req_deferred: AtomicU64,
    pub wr_req_overlap: AtomicU64,
    pub log_ops: AtomicU64,
    pub log_op_bytes: AtomicU64,
    pub discards: AtomicU64,
    pub aio_flushes: AtomicU64,
    pub internal_flushes: AtomicU64,
    pub writeback_ops: AtomicU64,
    pub writeback_bytes: AtomicU64,
    pub retired_entries: AtomicU64,
    pub invalidates: AtomicU64,
}

impl MetricCounters {
    pub(crate) fn snapshot(&self) -> WriteLogMetrics {
        WriteLogMetrics {
            rd_req: self.rd_req.load(Ordering::Relaxed),
            rd_bytes: self.rd_bytes.load(Ordering::Relaxed),
            rd_hit_req: self.rd_hit_req.load(Ordering::Relaxed),
            rd_hit_bytes: self.rd_hit_bytes.load(Ordering::Relaxed),
            rd_part_hit_req: self.rd_part_hit_req.load(Ordering::Relaxed),
            wr_req: self.wr_req.load(Ordering::Relaxed),
            wr_bytes: self.wr_bytes.load(Ordering::Relaxed),
            wr_req_deferred: self.wr_req_deferred.load(Ordering::Relaxed),
            wr_req_overlap: self.wr_req_overlap.load(Ordering::Relaxed),
            log_ops: self.log_ops.load(Ordering::Relaxed),
            log_op_bytes: self.log_op_bytes.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            aio_flushes: self.aio_flushes.load(Ordering::Relaxed),
            internal_flushes: self.internal_flushes.load(Ordering::Relaxed),
            writeback_ops: self.writeback_ops.load(Ordering::Relaxed),
            writeback_bytes: self.writeback_bytes.load(Ordering::Relaxed),
            retired_entries: self.retired_entries.load(Ordering::Relaxed),
            invalidates: self.invalidates.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the cache's operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteLogMetrics {
    pub rd_req: u64,
    pub rd_bytes: u64,
    pub rd_hit_req: u64,
    pub rd_hit_bytes: u64,
    pub rd_part_hit_req: u64,
    pub wr_req: u64,
    pub wr_bytes: u64,
    pub wr_req_deferred: u64,
    pub wr_req_overlap: u64,
    pub log_ops: u64,
    pub log_op_bytes: u64,
    pub discards: u64,
    pub aio_flushes: u64,
    pub internal_flushes: u64,
    pub writeback_ops: u64,
    pub writeback_bytes: u64,
    pub retired_entries: u64,
    pub invalidates: u64,
}

/// Point-in-time view of the log ring and resource counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub total_log_entries: u32,
    pub free_log_entries: u32,
    pub first_free_entry: u32,
    pub first_valid_entry: u32,
    pub live_entries: usize,
    pub dirty_entries: usize,
    pub free_lanes: u32,
    pub flush_ops_in_flight: u32,
    pub deferred_writes: usize,
}
