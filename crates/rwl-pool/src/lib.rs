#![forbid(unsafe_code)]
//! The persistent log pool.
//!
//! A pool file holds, in order: a root header page, a transaction-journal
//! page, a fixed ring of 64-byte log-entry slots, and a variable-size data
//! arena. The whole pool is mirrored in RAM; mutations touch the mirror
//! first and reach the file through two durability paths:
//!
//! - `flush` stages a byte range, `drain` writes every staged range and
//!   issues one fsync (the flush/fence split of persistent memory).
//! - `commit` applies a transaction (root-cursor updates plus data-buffer
//!   publishes and frees) through a crc-checked redo journal: the record
//!   is written and synced, the patches are applied and synced, then the
//!   journal is invalidated. A record found at open is replayed, so a
//!   crash on either side of the apply leaves the pool consistent.
//!
//! Data-buffer reservations are volatile until published by a commit.
//! Occupancy is reconstructed at open by scanning the live ring slots, so
//! the allocator keeps no persistent metadata of its own.

use parking_lot::Mutex;
use rwl_error::{Result, RwlError};
use rwl_types::{
    LOG_ENTRY_SLOT_SIZE, LogEntrySlot, MAX_LOG_ENTRIES, MIN_WRITE_ALLOC_SIZE, RWL_POOL_VERSION,
    read_le_u32, read_le_u64, BLOCK_ALLOC_OVERHEAD_BYTES, USABLE_SIZE,
};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn};

const POOL_MAGIC: u64 = u64::from_le_bytes(*b"rwlpool1");
const JOURNAL_MAGIC: u32 = u32::from_le_bytes(*b"rwlj");

const HEADER_PAGE_SIZE: u64 = 4096;
const JOURNAL_OFFSET: u64 = HEADER_PAGE_SIZE;
const JOURNAL_SIZE: u64 = 4096;
const RING_OFFSET: u64 = JOURNAL_OFFSET + JOURNAL_SIZE;

const HDR_MAGIC: usize = 0;
const HDR_VERSION: usize = 8;
const HDR_BLOCK_SIZE: usize = 12;
const HDR_NUM_LOG_ENTRIES: usize = 16;
const HDR_FIRST_FREE: usize = 20;
const HDR_FIRST_VALID: usize = 24;
const HDR_POOL_SIZE: usize = 28;
const HDR_DATA_OFFSET: usize = 36;
const HDR_LEN: usize = 44;

/// A not-yet-published data-buffer allocation.
///
/// Invisible to other pool users and to a reopened pool until a `commit`
/// publishes it; `cancel` returns the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Absolute file offset of the buffer.
    pub offset: u64,
    /// Allocated length (at least the rounded-up request).
    pub len: u64,
}

/// Actions applied atomically by [`LogPool::commit`].
#[derive(Debug, Default)]
pub struct PoolTransaction {
    pub first_free_entry: Option<u32>,
    pub first_valid_entry: Option<u32>,
    /// Reservations made durable by this commit.
    pub publish: Vec<Reservation>,
    /// Buffers released by this commit (`(offset, allocated_len)`).
    pub free: Vec<(u64, u64)>,
}

impl PoolTransaction {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_free_entry.is_none()
            && self.first_valid_entry.is_none()
            && self.publish.is_empty()
            && self.free.is_empty()
    }
}

/// One live slot recovered at open.
#[derive(Debug, Clone, Copy)]
pub struct ReplayEntry {
    pub index: u32,
    pub slot: LogEntrySlot,
}

/// State recovered from an existing pool at open.
#[derive(Debug)]
pub struct PoolReplay {
    pub first_free_entry: u32,
    pub first_valid_entry: u32,
    /// Live entries in ring order, oldest first.
    pub entries: Vec<ReplayEntry>,
}

#[derive(Debug, Clone, Copy)]
struct PoolHeader {
    block_size: u32,
    num_log_entries: u32,
    first_free_entry: u32,
    first_valid_entry: u32,
    pool_size: u64,
    data_offset: u64,
}

impl PoolHeader {
    fn encode(&self) -> [u8; HDR_LEN] {
        let mut out = [0_u8; HDR_LEN];
        out[HDR_MAGIC..HDR_MAGIC + 8].copy_from_slice(&POOL_MAGIC.to_le_bytes());
        out[HDR_VERSION] = RWL_POOL_VERSION;
        out[HDR_BLOCK_SIZE..HDR_BLOCK_SIZE + 4].copy_from_slice(&self.block_size.to_le_bytes());
        out[HDR_NUM_LOG_ENTRIES..HDR_NUM_LOG_ENTRIES + 4]
            .copy_from_slice(&self.num_log_entries.to_le_bytes());
        out[HDR_FIRST_FREE..HDR_FIRST_FREE + 4]
            .copy_from_slice(&self.first_free_entry.to_le_bytes());
        out[HDR_FIRST_VALID..HDR_FIRST_VALID + 4]
            .copy_from_slice(&self.first_valid_entry.to_le_bytes());
        out[HDR_POOL_SIZE..HDR_POOL_SIZE + 8].copy_from_slice(&self.pool_size.to_le_bytes());
        out[HDR_DATA_OFFSET..HDR_DATA_OFFSET + 8].copy_from_slice(&self.data_offset.to_le_bytes());
        out
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let magic = read_le_u64(data, HDR_MAGIC)?;
        if magic != POOL_MAGIC {
            return Err(RwlError::Layout(format!(
                "bad pool magic {magic:#x}, expected {POOL_MAGIC:#x}"
            )));
        }
        let version = data[HDR_VERSION];
        if version != RWL_POOL_VERSION {
            return Err(RwlError::Layout(format!(
                "pool layout version {version}, expected {RWL_POOL_VERSION}"
            )));
        }
        Ok(Self {
            block_size: read_le_u32(data, HDR_BLOCK_SIZE)?,
            num_log_entries: read_le_u32(data, HDR_NUM_LOG_ENTRIES)?,
            first_free_entry: read_le_u32(data, HDR_FIRST_FREE)?,
            first_valid_entry: read_le_u32(data, HDR_FIRST_VALID)?,
            pool_size: read_le_u64(data, HDR_POOL_SIZE)?,
            data_offset: read_le_u64(data, HDR_DATA_OFFSET)?,
        })
    }
}

/// First-fit free list over the data arena, with eager coalescing.
#[derive(Debug, Default)]
struct FreeList {
    /// Free spans, offset to length.
    free: BTreeMap<u64, u64>,
    /// Outstanding (unpublished) reservations, offset to length.
    reserved: HashMap<u64, u64>,
}

impl FreeList {
    fn insert_free(&mut self, mut offset: u64, mut len: u64) {
        if len == 0 {
            return;
        }
        if let Some((&prev_off, &prev_len)) = self.free.range(..offset).next_back() {
            debug_assert!(prev_off + prev_len <= offset);
            if prev_off + prev_len == offset {
                self.free.remove(&prev_off);
                offset = prev_off;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }
        self.free.insert(offset, len);
    }

    fn reserve(&mut self, len: u64) -> Option<u64> {
        let (offset, span) = self
            .free
            .iter()
            .find(|(_, &span)| span >= len)
            .map(|(&offset, &span)| (offset, span))?;
        self.free.remove(&offset);
        if span > len {
            self.free.insert(offset + len, span - len);
        }
        self.reserved.insert(offset, len);
        Some(offset)
    }

    fn cancel(&mut self, offset: u64) {
        if let Some(len) = self.reserved.remove(&offset) {
            self.insert_free(offset, len);
        }
    }

    fn publish(&mut self, offset: u64) {
        let published = self.reserved.remove(&offset);
        debug_assert!(published.is_some(), "publish of unreserved buffer");
    }

    fn free_bytes(&self) -> u64 {
        self.free.values().sum()
    }
}

#[derive(Debug)]
struct PoolCore {
    arena: Vec<u8>,
    header: PoolHeader,
    /// Staged dirty ranges, start to end (exclusive), coalesced.
    staged: BTreeMap<u64, u64>,
    alloc: FreeList,
}

impl PoolCore {
    fn stage(&mut self, start: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = start;
        let mut end = start + len;
        // Merge every staged range that touches [start, end).
        let keys: Vec<u64> = self
            .staged
            .range(..=end)
            .filter(|(_, &range_end)| range_end >= start)
            .map(|(&range_start, _)| range_start)
            .collect();
        for key in keys {
            if let Some(range_end) = self.staged.remove(&key) {
                start = start.min(key);
                end = end.max(range_end);
            }
        }
        self.staged.insert(start, end);
    }
}

/// Handle to an open pool file and its RAM mirror.
#[derive(Debug)]
pub struct LogPool {
    file: File,
    path: PathBuf,
    core: Mutex<PoolCore>,
}

/// Allocated size for a data buffer holding `bytes` payload bytes.
#[must_use]
pub fn alloc_size(bytes: u64) -> u64 {
    let want = bytes.max(MIN_WRITE_ALLOC_SIZE);
    want.div_ceil(MIN_WRITE_ALLOC_SIZE) * MIN_WRITE_ALLOC_SIZE
}

/// Ring slots (including the one kept unusable) for a pool of this size.
fn ring_slots(pool_size: u64) -> u64 {
    let effective = (pool_size as f64 * USABLE_SIZE) as u64;
    let per_entry = MIN_WRITE_ALLOC_SIZE + BLOCK_ALLOC_OVERHEAD_BYTES + LOG_ENTRY_SLOT_SIZE;
    (effective / per_entry).min(MAX_LOG_ENTRIES)
}

impl LogPool {
    /// Create a new pool file laid out for `pool_size` bytes.
    ///
    /// The ring is zeroed (every slot free) and both cursors start at 0.
    pub fn create(path: &Path, pool_size: u64, block_size: u32) -> Result<Self> {
        let slots = ring_slots(pool_size);
        if slots < 2 {
            return Err(RwlError::Layout(format!(
                "pool of {pool_size} bytes is too small for a log ring"
            )));
        }
        let ring_bytes = slots * LOG_ENTRY_SLOT_SIZE;
        let data_offset = (RING_OFFSET + ring_bytes).div_ceil(HEADER_PAGE_SIZE) * HEADER_PAGE_SIZE;
        if data_offset + MIN_WRITE_ALLOC_SIZE > pool_size {
            return Err(RwlError::Layout(format!(
                "pool of {pool_size} bytes leaves no room for a data arena"
            )));
        }

        let header = PoolHeader {
            block_size,
            num_log_entries: (slots - 1) as u32,
            first_free_entry: 0,
            first_valid_entry: 0,
            pool_size,
            data_offset,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(pool_size)?;

        let mut arena = vec![0_u8; pool_size as usize];
        arena[..HDR_LEN].copy_from_slice(&header.encode());
        file.write_all_at(&arena[..HEADER_PAGE_SIZE as usize], 0)?;
        file.sync_all()?;

        let mut alloc = FreeList::default();
        alloc.insert_free(data_offset, pool_size - data_offset);

        info!(
            event = "pool_created",
            path = %path.display(),
            pool_size,
            num_log_entries = header.num_log_entries,
            data_offset
        );

        Ok(Self {
            file,
            path: path.to_owned(),
            core: Mutex::new(PoolCore {
                arena,
                header,
                staged: BTreeMap::new(),
                alloc,
            }),
        })
    }

    /// Open an existing pool, replaying a pending transaction journal and
    /// scanning the ring to recover live entries and arena occupancy.
    pub fn open(path: &Path, block_size: u32) -> Result<(Self, PoolReplay)> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < RING_OFFSET + LOG_ENTRY_SLOT_SIZE {
            return Err(RwlError::Layout(format!(
                "pool file of {file_len} bytes is too small to hold a layout"
            )));
        }
        let mut arena = vec![0_u8; file_len as usize];
        file.read_exact_at(&mut arena, 0)?;

        replay_journal(&file, &mut arena)?;

        let header = PoolHeader::decode(&arena)?;
        if header.block_size != block_size {
            return Err(RwlError::Layout(format!(
                "pool block size is {}, expected {block_size}",
                header.block_size
            )));
        }
        if header.pool_size != file_len {
            return Err(RwlError::Layout(format!(
                "pool file is {file_len} bytes, header says {}",
                header.pool_size
            )));
        }

        let total_slots = u64::from(header.num_log_entries) + 1;
        let mut entries = Vec::new();
        let mut live_buffers: Vec<(u64, u64)> = Vec::new();
        let mut index = header.first_valid_entry;
        while index != header.first_free_entry {
            let slot_start = (RING_OFFSET + u64::from(index) * LOG_ENTRY_SLOT_SIZE) as usize;
            let slot =
                LogEntrySlot::decode(&arena[slot_start..slot_start + LOG_ENTRY_SLOT_SIZE as usize])?;
            if !slot.is_valid() {
                return Err(RwlError::Layout(format!(
                    "slot {index} inside the valid window is not marked valid"
                )));
            }
            if slot.has_data() {
                let len = alloc_size(slot.write_bytes);
                if slot.data_buffer_offset < header.data_offset
                    || slot.data_buffer_offset + len > header.pool_size
                {
                    return Err(RwlError::Layout(format!(
                        "slot {index} references buffer outside the arena"
                    )));
                }
                live_buffers.push((slot.data_buffer_offset, len));
            }
            entries.push(ReplayEntry { index, slot });
            index = (index + 1) % total_slots as u32;
        }

        // Rebuild the free list as the arena minus the live buffers.
        live_buffers.sort_unstable();
        let mut alloc = FreeList::default();
        let mut cursor = header.data_offset;
        for (offset, len) in &live_buffers {
            if *offset < cursor {
                return Err(RwlError::Layout(
                    "live data buffers overlap each other".to_owned(),
                ));
            }
            alloc.insert_free(cursor, offset - cursor);
            cursor = offset + len;
        }
        alloc.insert_free(cursor, header.pool_size - cursor);

        info!(
            event = "pool_opened",
            path = %path.display(),
            num_log_entries = header.num_log_entries,
            live_entries = entries.len(),
            first_free = header.first_free_entry,
            first_valid = header.first_valid_entry
        );

        let replay = PoolReplay {
            first_free_entry: header.first_free_entry,
            first_valid_entry: header.first_valid_entry,
            entries,
        };
        Ok((
            Self {
                file,
                path: path.to_owned(),
                core: Mutex::new(PoolCore {
                    arena,
                    header,
                    staged: BTreeMap::new(),
                    alloc,
                }),
            },
            replay,
        ))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn num_log_entries(&self) -> u32 {
        self.core.lock().header.num_log_entries
    }

    #[must_use]
    pub fn free_arena_bytes(&self) -> u64 {
        self.core.lock().alloc.free_bytes()
    }

    /// Best-effort reservation of a data buffer for `bytes` payload bytes.
    ///
    /// Not durable and not visible to a reopened pool until published by a
    /// commit. Fails with `PoolExhausted` when no span is large enough.
    pub fn reserve(&self, bytes: u64) -> Result<Reservation> {
        let len = alloc_size(bytes);
        let mut core = self.core.lock();
        match core.alloc.reserve(len) {
            Some(offset) => {
                trace!(event = "buffer_reserved", offset, len);
                Ok(Reservation { offset, len })
            }
            None => {
                debug!(event = "buffer_reserve_failed", bytes = len);
                Err(RwlError::PoolExhausted { bytes: len })
            }
        }
    }

    /// Roll back reservations that will never be published.
    pub fn cancel(&self, reservations: &[Reservation]) {
        let mut core = self.core.lock();
        for reservation in reservations {
            core.alloc.cancel(reservation.offset);
        }
        trace!(event = "buffers_cancelled", count = reservations.len());
    }

    /// Copy payload bytes into a reserved (or published) buffer.
    pub fn write_buffer(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut core = self.core.lock();
        let end = offset + data.len() as u64;
        if offset < core.header.data_offset || end > core.header.pool_size {
            return Err(RwlError::Layout(format!(
                "buffer write [{offset}, {end}) outside the arena"
            )));
        }
        core.arena[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes out of a data buffer.
    pub fn read_buffer(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let core = self.core.lock();
        let end = offset + out.len() as u64;
        if offset < core.header.data_offset || end > core.header.pool_size {
            return Err(RwlError::Layout(format!(
                "buffer read [{offset}, {end}) outside the arena"
            )));
        }
        out.copy_from_slice(&core.arena[offset as usize..end as usize]);
        Ok(())
    }

    /// Stage a buffer range for the next `drain`.
    pub fn flush_buffer(&self, offset: u64, len: u64) {
        self.core.lock().stage(offset, len);
    }

    /// Write a log-entry record into its ring slot (RAM mirror only).
    pub fn write_slot(&self, index: u32, slot: &LogEntrySlot) -> Result<()> {
        let mut core = self.core.lock();
        let start = slot_offset(index) as usize;
        slot.encode_into(&mut core.arena[start..start + LOG_ENTRY_SLOT_SIZE as usize])?;
        Ok(())
    }

    /// Decode the record currently in a ring slot.
    pub fn read_slot(&self, index: u32) -> Result<LogEntrySlot> {
        let core = self.core.lock();
        let start = slot_offset(index) as usize;
        Ok(LogEntrySlot::decode(
            &core.arena[start..start + LOG_ENTRY_SLOT_SIZE as usize],
        )?)
    }

    /// Stage `count` contiguous ring slots starting at `first` for the
    /// next `drain`. The range must not wrap the ring; callers split
    /// wrapping batches.
    pub fn flush_slots(&self, first: u32, count: u32) {
        if count == 0 {
            return;
        }
        self.core.lock().stage(
            slot_offset(first),
            u64::from(count) * LOG_ENTRY_SLOT_SIZE,
        );
    }

    /// Write every staged range to the file and fence with one fsync.
    pub fn drain(&self) -> Result<()> {
        let mut core = self.core.lock();
        if core.staged.is_empty() {
            return Ok(());
        }
        let ranges: Vec<(u64, u64)> = core.staged.iter().map(|(&s, &e)| (s, e)).collect();
        for (start, end) in &ranges {
            self.file
                .write_all_at(&core.arena[*start as usize..*end as usize], *start)?;
        }
        self.file.sync_data()?;
        trace!(event = "pool_drain", ranges = ranges.len());
        core.staged.clear();
        Ok(())
    }

    /// Atomically apply a transaction: journal it, sync, patch the header,
    /// sync, then invalidate the journal. Publishes and frees take effect
    /// on the allocator only after the journal is durable.
    ///
    /// Any failure here is fatal to the caller; the error is reported as
    /// `TxAborted` and the pool must not be used for further appends.
    pub fn commit(&self, tx: &PoolTransaction) -> Result<()> {
        let mut core = self.core.lock();
        if let Some(first_free) = tx.first_free_entry {
            core.header.first_free_entry = first_free;
        }
        if let Some(first_valid) = tx.first_valid_entry {
            core.header.first_valid_entry = first_valid;
        }
        let encoded = core.header.encode();
        core.arena[..HDR_LEN].copy_from_slice(&encoded);

        // One patch: the whole header. Tiny, and self-describing enough
        // for replay at open.
        let mut payload = Vec::with_capacity(HDR_LEN + 12);
        payload.extend_from_slice(&0_u64.to_le_bytes());
        payload.extend_from_slice(&(HDR_LEN as u32).to_le_bytes());
        payload.extend_from_slice(&encoded);

        let mut record = Vec::with_capacity(payload.len() + 16);
        record.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        record.extend_from_slice(&1_u32.to_le_bytes());
        record.extend_from_slice(&payload);
        debug_assert!(record.len() as u64 <= JOURNAL_SIZE);

        let commit_io = || -> Result<()> {
            self.file.write_all_at(&record, JOURNAL_OFFSET)?;
            self.file.sync_data()?;
            self.file.write_all_at(&encoded, 0)?;
            self.file.sync_data()?;
            self.file.write_all_at(&[0_u8; 4], JOURNAL_OFFSET)?;
            self.file.sync_data()?;
            Ok(())
        };
        if let Err(err) = commit_io() {
            error!(
                event = "pool_commit_failed",
                path = %self.path.display(),
                error = %err
            );
            return Err(RwlError::TxAborted(err.to_string()));
        }

        for reservation in &tx.publish {
            core.alloc.publish(reservation.offset);
        }
        for (offset, len) in &tx.free {
            core.alloc.insert_free(*offset, *len);
        }
        trace!(
            event = "pool_commit",
            first_free = core.header.first_free_entry,
            first_valid = core.header.first_valid_entry,
            published = tx.publish.len(),
            freed = tx.free.len()
        );
        Ok(())
    }
}

fn slot_offset(index: u32) -> u64 {
    RING_OFFSET + u64::from(index) * LOG_ENTRY_SLOT_SIZE
}

/// Apply a pending journal record to the mirror and the file, or discard
/// a torn one.
fn replay_journal(file: &File, arena: &mut [u8]) -> Result<()> {
    let journal = &arena[JOURNAL_OFFSET as usize..(JOURNAL_OFFSET + JOURNAL_SIZE) as usize];
    let magic = read_le_u32(journal, 0)?;
    if magic != JOURNAL_MAGIC {
        return Ok(());
    }
    let payload_len = read_le_u32(journal, 4)? as usize;
    let crc = read_le_u32(journal, 8)?;
    let patch_count = read_le_u32(journal, 12)?;
    if 16 + payload_len > journal.len() {
        warn!(event = "journal_truncated", payload_len);
        return clear_journal(file, arena);
    }
    let payload = journal[16..16 + payload_len].to_vec();
    if crc32c::crc32c(&payload) != crc {
        warn!(event = "journal_torn", payload_len);
        return clear_journal(file, arena);
    }

    debug!(event = "journal_replay", patch_count);
    let mut cursor = 0_usize;
    for _ in 0..patch_count {
        let offset = read_le_u64(&payload, cursor)?;
        let len = read_le_u32(&payload, cursor + 8)? as usize;
        cursor += 12;
        let bytes = payload
            .get(cursor..cursor + len)
            .ok_or_else(|| RwlError::Layout("journal patch overruns record".to_owned()))?
            .to_vec();
        cursor += len;
        arena[offset as usize..offset as usize + len].copy_from_slice(&bytes);
        file.write_all_at(&bytes, offset)?;
    }
    file.sync_data()?;
    clear_journal(file, arena)
}

fn clear_journal(file: &File, arena: &mut [u8]) -> Result<()> {
    arena[JOURNAL_OFFSET as usize..JOURNAL_OFFSET as usize + 4].fill(0);
    file.write_all_at(&[0_u8; 4], JOURNAL_OFFSET)?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rwl_types::{slot_flags, MIN_POOL_SIZE};
    use std::io::{Read, Seek, SeekFrom, Write};
    use tempfile::TempDir;

    const BLOCK_SIZE: u32 = rwl_types::MIN_WRITE_SIZE as u32;

    fn pool_path(dir: &TempDir) -> PathBuf {
        dir.path().join("test.pool")
    }

    fn make_pool(dir: &TempDir) -> LogPool {
        LogPool::create(&pool_path(dir), MIN_POOL_SIZE, BLOCK_SIZE).unwrap()
    }

    #[test]
    fn create_then_open_restores_geometry() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let entries = pool.num_log_entries();
        assert!(entries > 0);
        drop(pool);

        let (pool, replay) = LogPool::open(&pool_path(&dir), BLOCK_SIZE).unwrap();
        assert_eq!(pool.num_log_entries(), entries);
        assert_eq!(replay.first_free_entry, 0);
        assert_eq!(replay.first_valid_entry, 0);
        assert!(replay.entries.is_empty());
    }

    #[test]
    fn entry_count_matches_size_formula() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let effective = (MIN_POOL_SIZE as f64 * USABLE_SIZE) as u64;
        let per_entry = MIN_WRITE_ALLOC_SIZE + BLOCK_ALLOC_OVERHEAD_BYTES + LOG_ENTRY_SLOT_SIZE;
        assert_eq!(u64::from(pool.num_log_entries()), effective / per_entry - 1);
    }

    #[test]
    fn open_rejects_wrong_block_size() {
        let dir = TempDir::new().unwrap();
        drop(make_pool(&dir));
        let err = LogPool::open(&pool_path(&dir), BLOCK_SIZE * 2).unwrap_err();
        assert!(matches!(err, RwlError::Layout(_)));
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        drop(make_pool(&dir));
        let mut file = OpenOptions::new()
            .write(true)
            .open(pool_path(&dir))
            .unwrap();
        file.write_all(b"not a pool").unwrap();
        file.sync_all().unwrap();
        let err = LogPool::open(&pool_path(&dir), BLOCK_SIZE).unwrap_err();
        assert!(matches!(err, RwlError::Layout(_)));
    }

    #[test]
    fn reserve_rounds_up_and_cancel_restores_space() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let free_before = pool.free_arena_bytes();

        let reservation = pool.reserve(1).unwrap();
        assert_eq!(reservation.len, MIN_WRITE_ALLOC_SIZE);
        let reservation_big = pool.reserve(MIN_WRITE_ALLOC_SIZE + 1).unwrap();
        assert_eq!(reservation_big.len, MIN_WRITE_ALLOC_SIZE * 2);
        assert_eq!(
            pool.free_arena_bytes(),
            free_before - MIN_WRITE_ALLOC_SIZE * 3
        );

        pool.cancel(&[reservation, reservation_big]);
        assert_eq!(pool.free_arena_bytes(), free_before);
    }

    #[test]
    fn reserve_fails_when_no_span_fits() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let err = pool.reserve(pool.free_arena_bytes() + 1).unwrap_err();
        assert!(matches!(err, RwlError::PoolExhausted { .. }));
    }

    #[test]
    fn drained_buffer_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let reservation = pool.reserve(512).unwrap();
        let payload = vec![0xAB_u8; 512];
        pool.write_buffer(reservation.offset, &payload).unwrap();
        pool.flush_buffer(reservation.offset, 512);
        pool.drain().unwrap();
        drop(pool);

        let (pool, _) = LogPool::open(&pool_path(&dir), BLOCK_SIZE).unwrap();
        let mut out = vec![0_u8; 512];
        pool.read_buffer(reservation.offset, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn commit_persists_cursors_and_occupancy() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let reservation = pool.reserve(512).unwrap();

        let mut slot = LogEntrySlot::new(0, 512);
        slot.data_buffer_offset = reservation.offset;
        slot.set_flag(slot_flags::ENTRY_VALID, true);
        slot.set_flag(slot_flags::HAS_DATA, true);
        pool.write_slot(0, &slot).unwrap();
        pool.flush_slots(0, 1);
        pool.drain().unwrap();

        pool.commit(&PoolTransaction {
            first_free_entry: Some(1),
            publish: vec![reservation],
            ..PoolTransaction::default()
        })
        .unwrap();
        let free_after = pool.free_arena_bytes();
        drop(pool);

        let (pool, replay) = LogPool::open(&pool_path(&dir), BLOCK_SIZE).unwrap();
        assert_eq!(replay.first_free_entry, 1);
        assert_eq!(replay.first_valid_entry, 0);
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.entries[0].index, 0);
        assert_eq!(replay.entries[0].slot.data_buffer_offset, reservation.offset);
        // The published buffer stays allocated across reopen.
        assert_eq!(pool.free_arena_bytes(), free_after);
    }

    #[test]
    fn free_in_commit_reclaims_buffer() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let free_before = pool.free_arena_bytes();
        let reservation = pool.reserve(512).unwrap();
        pool.commit(&PoolTransaction {
            publish: vec![reservation],
            ..PoolTransaction::default()
        })
        .unwrap();
        pool.commit(&PoolTransaction {
            free: vec![(reservation.offset, reservation.len)],
            ..PoolTransaction::default()
        })
        .unwrap();
        assert_eq!(pool.free_arena_bytes(), free_before);
    }

    #[test]
    fn torn_journal_is_discarded() {
        let dir = TempDir::new().unwrap();
        drop(make_pool(&dir));

        // A record with a valid magic but corrupt checksum.
        let mut record = Vec::new();
        record.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        record.extend_from_slice(&8_u32.to_le_bytes());
        record.extend_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
        record.extend_from_slice(&1_u32.to_le_bytes());
        record.extend_from_slice(&[0_u8; 8]);
        let mut file = OpenOptions::new()
            .write(true)
            .open(pool_path(&dir))
            .unwrap();
        file.seek(SeekFrom::Start(JOURNAL_OFFSET)).unwrap();
        file.write_all(&record).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let (_, replay) = LogPool::open(&pool_path(&dir), BLOCK_SIZE).unwrap();
        assert_eq!(replay.first_free_entry, 0);

        // The journal was invalidated on disk.
        let mut file = File::open(pool_path(&dir)).unwrap();
        file.seek(SeekFrom::Start(JOURNAL_OFFSET)).unwrap();
        let mut magic = [0_u8; 4];
        file.read_exact(&mut magic).unwrap();
        assert_eq!(magic, [0_u8; 4]);
    }

    #[test]
    fn valid_journal_is_replayed_at_open() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        drop(pool);

        // Hand-build a journal record that patches first_free_entry to 3,
        // simulating a crash after the journal sync but before the apply.
        let (pool, _) = LogPool::open(&pool_path(&dir), BLOCK_SIZE).unwrap();
        let mut header = pool.core.lock().header;
        drop(pool);
        header.first_free_entry = 3;
        // The patched window stays empty (first_valid == first_free would
        // not hold), so point first_valid at it too.
        header.first_valid_entry = 3;
        let encoded = header.encode();

        let mut payload = Vec::new();
        payload.extend_from_slice(&0_u64.to_le_bytes());
        payload.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        payload.extend_from_slice(&encoded);
        let mut record = Vec::new();
        record.extend_from_slice(&JOURNAL_MAGIC.to_le_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32c::crc32c(&payload).to_le_bytes());
        record.extend_from_slice(&1_u32.to_le_bytes());
        record.extend_from_slice(&payload);

        let mut file = OpenOptions::new()
            .write(true)
            .open(pool_path(&dir))
            .unwrap();
        file.seek(SeekFrom::Start(JOURNAL_OFFSET)).unwrap();
        file.write_all(&record).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let (_, replay) = LogPool::open(&pool_path(&dir), BLOCK_SIZE).unwrap();
        assert_eq!(replay.first_free_entry, 3);
        assert_eq!(replay.first_valid_entry, 3);
    }

    #[test]
    fn replay_scans_across_the_ring_wrap() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let ring_slots = pool.num_log_entries() + 1;

        // Four live entries straddling the wrap point.
        let indices = [ring_slots - 2, ring_slots - 1, 0, 1];
        let mut reservations = Vec::new();
        for (seq, &index) in indices.iter().enumerate() {
            let reservation = pool.reserve(512).unwrap();
            let mut slot = LogEntrySlot::new(u64::from(index) * 512, 512);
            slot.write_sequence_number = seq as u64 + 1;
            slot.data_buffer_offset = reservation.offset;
            slot.set_flag(slot_flags::ENTRY_VALID, true);
            slot.set_flag(slot_flags::SEQUENCED, true);
            slot.set_flag(slot_flags::HAS_DATA, true);
            pool.write_slot(index, &slot).unwrap();
            reservations.push(reservation);
        }
        pool.flush_slots(ring_slots - 2, 2);
        pool.flush_slots(0, 2);
        pool.drain().unwrap();
        pool.commit(&PoolTransaction {
            first_free_entry: Some(2),
            first_valid_entry: Some(ring_slots - 2),
            publish: reservations,
            ..PoolTransaction::default()
        })
        .unwrap();
        drop(pool);

        let (_, replay) = LogPool::open(&pool_path(&dir), BLOCK_SIZE).unwrap();
        let scanned: Vec<u32> = replay.entries.iter().map(|e| e.index).collect();
        assert_eq!(scanned, indices);
        let sequences: Vec<u64> = replay
            .entries
            .iter()
            .map(|e| e.slot.write_sequence_number)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4]);
    }

    #[test]
    fn slot_round_trip_through_ring() {
        let dir = TempDir::new().unwrap();
        let pool = make_pool(&dir);
        let mut slot = LogEntrySlot::new(1024, 512);
        slot.sync_gen_number = 2;
        slot.set_flag(slot_flags::ENTRY_VALID, true);
        pool.write_slot(7, &slot).unwrap();
        assert_eq!(pool.read_slot(7).unwrap(), slot);
        assert!(!pool.read_slot(8).unwrap().is_valid());
    }

    #[test]
    fn free_list_coalesces_neighbors() {
        let mut list = FreeList::default();
        list.insert_free(0, 512);
        list.insert_free(1024, 512);
        assert_eq!(list.free.len(), 2);
        list.insert_free(512, 512);
        assert_eq!(list.free.len(), 1);
        assert_eq!(list.free.get(&0), Some(&1536));
    }
}
