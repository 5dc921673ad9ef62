#![forbid(unsafe_code)]
//! End-to-end scenarios for the write log over an in-memory lower layer.

use parking_lot::Mutex;
use rwl_cache::{Completion, ImageCache, ReadCompletion, WriteLogCache, WriteLogConfig};
use rwl_error::{Result, RwlError};
use rwl_pool::{LogPool, PoolTransaction};
use rwl_types::{slot_flags, ImageExtent, LogEntrySlot, MIN_POOL_SIZE, MIN_WRITE_SIZE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const BLOCK: u64 = MIN_WRITE_SIZE;
const IMAGE_SIZE: u64 = 64 * BLOCK;

/// In-memory image standing in for the lower cache layer.
struct FakeImage {
    bytes: Mutex<Vec<u8>>,
    read_log: Mutex<Vec<ImageExtent>>,
    discard_log: Mutex<Vec<(u64, u64)>>,
    write_count: AtomicUsize,
    invalidate_count: AtomicUsize,
    init_count: AtomicUsize,
    shutdown_count: AtomicUsize,
}

impl FakeImage {
    fn new(len: u64) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0_u8; len as usize]),
            read_log: Mutex::new(Vec::new()),
            discard_log: Mutex::new(Vec::new()),
            write_count: AtomicUsize::new(0),
            invalidate_count: AtomicUsize::new(0),
            init_count: AtomicUsize::new(0),
            shutdown_count: AtomicUsize::new(0),
        })
    }

    fn fill(&self, offset: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock();
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    fn contents(&self, offset: u64, len: u64) -> Vec<u8> {
        let bytes = self.bytes.lock();
        bytes[offset as usize..(offset + len) as usize].to_vec()
    }

    fn reads(&self) -> Vec<ImageExtent> {
        self.read_log.lock().clone()
    }
}

impl ImageCache for FakeImage {
    fn read(&self, extents: Vec<ImageExtent>, on_finish: ReadCompletion) {
        let mut out = Vec::new();
        let bytes = self.bytes.lock();
        for extent in &extents {
            let start = extent.offset_bytes as usize;
            out.extend_from_slice(&bytes[start..start + extent.length_bytes as usize]);
        }
        drop(bytes);
        self.read_log.lock().extend(extents);
        on_finish(Ok(out));
    }

    fn write(&self, extents: Vec<ImageExtent>, data: Vec<u8>, on_finish: Completion) {
        self.write_count.fetch_add(1, Ordering::SeqCst);
        let mut bytes = self.bytes.lock();
        let mut data_offset = 0_usize;
        for extent in &extents {
            let start = extent.offset_bytes as usize;
            let len = extent.length_bytes as usize;
            bytes[start..start + len].copy_from_slice(&data[data_offset..data_offset + len]);
            data_offset += len;
        }
        drop(bytes);
        on_finish(Ok(()));
    }

    fn discard(&self, offset: u64, length: u64, _skip_partial: bool, on_finish: Completion) {
        self.discard_log.lock().push((offset, length));
        let mut bytes = self.bytes.lock();
        bytes[offset as usize..(offset + length) as usize].fill(0);
        drop(bytes);
        on_finish(Ok(()));
    }

    fn flush(&self, on_finish: Completion) {
        on_finish(Ok(()));
    }

    fn writesame(&self, offset: u64, length: u64, data: Vec<u8>, on_finish: Completion) {
        let mut bytes = self.bytes.lock();
        for chunk_start in (0..length).step_by(data.len().max(1)) {
            let start = (offset + chunk_start) as usize;
            let len = data.len().min((length - chunk_start) as usize);
            bytes[start..start + len].copy_from_slice(&data[..len]);
        }
        drop(bytes);
        on_finish(Ok(()));
    }

    fn compare_and_write(
        &self,
        extents: Vec<ImageExtent>,
        cmp_data: Vec<u8>,
        data: Vec<u8>,
        on_finish: Completion,
    ) {
        let current = {
            let bytes = self.bytes.lock();
            let mut current = Vec::new();
            for extent in &extents {
                let start = extent.offset_bytes as usize;
                current.extend_from_slice(&bytes[start..start + extent.length_bytes as usize]);
            }
            current
        };
        if let Some(offset) = current.iter().zip(&cmp_data).position(|(a, b)| a != b) {
            on_finish(Err(RwlError::CompareMismatch {
                offset: offset as u64,
            }));
            return;
        }
        self.write(extents, data, on_finish);
    }

    fn invalidate(&self, on_finish: Completion) {
        self.invalidate_count.fetch_add(1, Ordering::SeqCst);
        on_finish(Ok(()));
    }

    fn init(&self, on_finish: Completion) {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        on_finish(Ok(()));
    }

    fn shut_down(&self, on_finish: Completion) {
        self.shutdown_count.fetch_add(1, Ordering::SeqCst);
        on_finish(Ok(()));
    }
}

fn test_config(dir: &TempDir) -> WriteLogConfig {
    WriteLogConfig {
        path: dir.path().to_owned(),
        size: MIN_POOL_SIZE,
        image_id: "e2e".to_owned(),
        image_size: IMAGE_SIZE,
        ..WriteLogConfig::default()
    }
}

fn new_cache(dir: &TempDir, config: WriteLogConfig) -> (WriteLogCache, Arc<FakeImage>) {
    let lower = FakeImage::new(IMAGE_SIZE);
    let cache = new_cache_over(config, lower.clone());
    (cache, lower)
}

fn new_cache_over(config: WriteLogConfig, lower: Arc<FakeImage>) -> WriteLogCache {
    let cache = WriteLogCache::new(config, lower as Arc<dyn ImageCache>).unwrap();
    wait_status(|done| cache.init(done)).unwrap();
    cache
}

fn wait_status<F: FnOnce(Completion)>(run: F) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    run(Box::new(move |status| {
        let _ = tx.send(status);
    }));
    rx.recv_timeout(Duration::from_secs(10)).expect("timed out")
}

fn do_write(cache: &WriteLogCache, offset: u64, data: Vec<u8>) {
    let len = data.len() as u64;
    wait_status(|done| cache.write(vec![ImageExtent::new(offset, len)], data, done)).unwrap();
}

fn do_read(cache: &WriteLogCache, offset: u64, len: u64) -> Vec<u8> {
    let (tx, rx) = mpsc::channel();
    cache.read(
        vec![ImageExtent::new(offset, len)],
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv_timeout(Duration::from_secs(10))
        .expect("timed out")
        .unwrap()
}

fn wait_until(mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !pred() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn write_then_read_hits_the_log() {
    let dir = TempDir::new().unwrap();
    let (cache, lower) = new_cache(&dir, test_config(&dir));

    do_write(&cache, 0, vec![b'A'; BLOCK as usize]);
    let out = do_read(&cache, 0, BLOCK);
    assert_eq!(out, vec![b'A'; BLOCK as usize]);

    // Fully-hit read: the lower layer saw no read at all.
    assert!(lower.reads().is_empty());
    let metrics = cache.metrics();
    assert_eq!(metrics.rd_hit_req, 1);
    assert_eq!(metrics.log_ops, 1);

    assert_eq!(cache.log_stats().first_free_entry, 1);
    // Lanes return to the pool once the request fully releases.
    wait_until(|| cache.log_stats().free_lanes == rwl_cache::MAX_CONCURRENT_WRITES);
}

#[test]
fn overlapping_writes_read_last_writer() {
    let dir = TempDir::new().unwrap();
    let (cache, lower) = new_cache(&dir, test_config(&dir));

    do_write(&cache, 0, vec![b'A'; 2 * BLOCK as usize]);
    do_write(&cache, BLOCK, vec![b'B'; BLOCK as usize]);

    let mut expected = vec![b'A'; BLOCK as usize];
    expected.extend(vec![b'B'; BLOCK as usize]);
    assert_eq!(do_read(&cache, 0, 2 * BLOCK), expected);

    // The overlap is settled in the log; the backing image converges to
    // the same bytes once writeback drains.
    wait_until(|| cache.log_stats().dirty_entries == 0);
    assert_eq!(lower.contents(0, 2 * BLOCK), expected);
}

#[test]
fn partial_hit_reads_only_misses_from_below() {
    let dir = TempDir::new().unwrap();
    let (cache, lower) = new_cache(&dir, test_config(&dir));
    lower.fill(0, &vec![b'X'; BLOCK as usize]);

    do_write(&cache, BLOCK, vec![b'B'; BLOCK as usize]);
    let out = do_read(&cache, 0, 2 * BLOCK);

    let mut expected = vec![b'X'; BLOCK as usize];
    expected.extend(vec![b'B'; BLOCK as usize]);
    assert_eq!(out, expected);

    // Only the miss range went to the lower layer.
    assert_eq!(lower.reads(), vec![ImageExtent::new(0, BLOCK)]);
    assert_eq!(cache.metrics().rd_part_hit_req, 1);
}

#[test]
fn writeback_drains_and_entries_retire() {
    let dir = TempDir::new().unwrap();
    let (cache, lower) = new_cache(&dir, test_config(&dir));
    let total = cache.log_stats().total_log_entries;

    for block in 0..4_u64 {
        do_write(&cache, block * BLOCK, vec![b'a' + block as u8; BLOCK as usize]);
    }

    // The work loop flushes dirty entries oldest-first and retires them
    // from the ring head, restoring every slot and freeing the buffers.
    wait_until(|| {
        let stats = cache.log_stats();
        stats.dirty_entries == 0 && stats.live_entries == 0 && stats.free_log_entries == total
    });
    let stats = cache.log_stats();
    assert_eq!(stats.first_free_entry, stats.first_valid_entry);
    assert!(cache.metrics().retired_entries >= 4);
    for block in 0..4_u64 {
        assert_eq!(
            lower.contents(block * BLOCK, BLOCK),
            vec![b'a' + block as u8; BLOCK as usize]
        );
    }
}

#[test]
fn flush_completes_immediately_when_clean() {
    let dir = TempDir::new().unwrap();
    let (cache, _lower) = new_cache(&dir, test_config(&dir));
    wait_status(|done| cache.flush(done)).unwrap();
    assert_eq!(cache.metrics().aio_flushes, 1);
}

#[test]
fn persist_on_flush_mode_switches_on_first_flush() {
    let dir = TempDir::new().unwrap();
    let (cache, _lower) = new_cache(&dir, test_config(&dir));

    // Persist-on-write until the first flush.
    do_write(&cache, 0, vec![1; BLOCK as usize]);
    wait_status(|done| cache.flush(done)).unwrap();

    // Now persist-on-flush: writes are acknowledged at dispatch and a
    // flush gathers them under a new sync point.
    do_write(&cache, BLOCK, vec![2; BLOCK as usize]);
    do_write(&cache, 2 * BLOCK, vec![3; BLOCK as usize]);
    wait_status(|done| cache.flush(done)).unwrap();

    assert_eq!(do_read(&cache, BLOCK, BLOCK), vec![2; BLOCK as usize]);
    assert_eq!(cache.metrics().aio_flushes, 3);

    // A flush with no intervening writes also completes.
    wait_status(|done| cache.flush(done)).unwrap();
}

#[test]
fn overlapping_writes_complete_in_submission_order() {
    let dir = TempDir::new().unwrap();
    let (cache, _lower) = new_cache(&dir, test_config(&dir));

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for tag in 0..3_u32 {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        cache.write(
            vec![ImageExtent::new(0, BLOCK)],
            vec![tag as u8; BLOCK as usize],
            Box::new(move |status| {
                status.unwrap();
                order.lock().push(tag);
                let _ = tx.send(());
            }),
        );
    }
    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
    assert!(cache.metrics().wr_req_overlap >= 1);
    assert_eq!(do_read(&cache, 0, BLOCK), vec![2; BLOCK as usize]);
}

#[test]
fn exhausted_lanes_defer_writes_fifo() {
    let dir = TempDir::new().unwrap();
    let config = WriteLogConfig {
        max_concurrent_writes: 1,
        ..test_config(&dir)
    };
    let (cache, _lower) = new_cache(&dir, config);

    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for tag in 0..3_u32 {
        let order = Arc::clone(&order);
        let tx = tx.clone();
        // Disjoint ranges: only the single lane serializes them.
        cache.write(
            vec![ImageExtent::new(u64::from(tag) * BLOCK, BLOCK)],
            vec![tag as u8; BLOCK as usize],
            Box::new(move |status| {
                status.unwrap();
                order.lock().push(tag);
                let _ = tx.send(());
            }),
        );
    }
    for _ in 0..3 {
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);
    assert!(cache.metrics().wr_req_deferred >= 1);
    assert_eq!(cache.log_stats().deferred_writes, 0);
}

#[test]
fn unaligned_io_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (cache, _lower) = new_cache(&dir, test_config(&dir));

    let status = wait_status(|done| {
        cache.write(vec![ImageExtent::new(7, BLOCK)], vec![0; BLOCK as usize], done)
    });
    assert!(matches!(status, Err(RwlError::Unaligned { .. })));

    let (tx, rx) = mpsc::channel();
    cache.read(
        vec![ImageExtent::new(0, 100)],
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(matches!(result, Err(RwlError::Unaligned { .. })));
}

#[test]
fn discard_flushes_invalidates_and_forwards() {
    let dir = TempDir::new().unwrap();
    let (cache, lower) = new_cache(&dir, test_config(&dir));

    do_write(&cache, 0, vec![b'D'; BLOCK as usize]);
    wait_status(|done| cache.discard(0, BLOCK, false, done)).unwrap();

    assert_eq!(*lower.discard_log.lock(), vec![(0, BLOCK)]);
    // Log coverage is gone: the read goes to the lower layer, which has
    // the flushed-then-discarded (zeroed) bytes.
    assert_eq!(do_read(&cache, 0, BLOCK), vec![0; BLOCK as usize]);
    assert!(lower.reads().contains(&ImageExtent::new(0, BLOCK)));
}

#[test]
fn invalidate_drops_all_log_coverage() {
    let dir = TempDir::new().unwrap();
    let (cache, lower) = new_cache(&dir, test_config(&dir));

    do_write(&cache, 0, vec![b'V'; BLOCK as usize]);
    wait_status(|done| cache.invalidate(done)).unwrap();

    assert_eq!(lower.invalidate_count.load(Ordering::SeqCst), 1);
    // Subsequent reads miss to the lower layer.
    do_read(&cache, 0, BLOCK);
    assert!(lower.reads().contains(&ImageExtent::new(0, BLOCK)));
}

#[test]
fn writesame_and_compare_and_write_delegate() {
    let dir = TempDir::new().unwrap();
    let (cache, lower) = new_cache(&dir, test_config(&dir));

    wait_status(|done| cache.writesame(0, 2 * BLOCK, vec![b'S'; BLOCK as usize], done)).unwrap();
    assert_eq!(lower.contents(0, 2 * BLOCK), vec![b'S'; 2 * BLOCK as usize]);

    let status = wait_status(|done| {
        cache.compare_and_write(
            vec![ImageExtent::new(0, BLOCK)],
            vec![b'S'; BLOCK as usize],
            vec![b'T'; BLOCK as usize],
            done,
        )
    });
    status.unwrap();
    assert_eq!(lower.contents(0, BLOCK), vec![b'T'; BLOCK as usize]);

    let status = wait_status(|done| {
        cache.compare_and_write(
            vec![ImageExtent::new(0, BLOCK)],
            vec![b'S'; BLOCK as usize],
            vec![b'U'; BLOCK as usize],
            done,
        )
    });
    assert!(matches!(status, Err(RwlError::CompareMismatch { .. })));
}

#[test]
fn shutdown_flushes_writes_to_the_image() {
    let dir = TempDir::new().unwrap();
    let (cache, lower) = new_cache(&dir, test_config(&dir));

    do_write(&cache, 0, vec![b'A'; 2 * BLOCK as usize]);
    do_write(&cache, BLOCK, vec![b'B'; BLOCK as usize]);
    wait_status(|done| cache.flush(done)).unwrap();
    wait_status(|done| cache.shut_down(done)).unwrap();

    assert_eq!(lower.shutdown_count.load(Ordering::SeqCst), 1);
    // The backing image equals the serial last-writer-wins application.
    let mut expected = vec![b'A'; BLOCK as usize];
    expected.extend(vec![b'B'; BLOCK as usize]);
    assert_eq!(lower.contents(0, 2 * BLOCK), expected);
}

#[test]
fn reinit_after_clean_shutdown_restores_empty_state() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let lower = FakeImage::new(IMAGE_SIZE);
    {
        let cache = new_cache_over(config.clone(), lower.clone());
        for block in 0..8_u64 {
            do_write(&cache, block * BLOCK, vec![block as u8; BLOCK as usize]);
        }
        // Fully drained and retired before shutting down.
        wait_until(|| cache.log_stats().live_entries == 0);
        wait_status(|done| cache.shut_down(done)).unwrap();
    }

    // Same backing image, fresh cache over the same pool.
    let cache = new_cache_over(config, lower.clone());
    let stats = cache.log_stats();
    assert_eq!(stats.first_free_entry, stats.first_valid_entry);
    assert_eq!(stats.free_log_entries, stats.total_log_entries);
    for block in 0..8_u64 {
        assert_eq!(
            do_read(&cache, block * BLOCK, BLOCK),
            vec![block as u8; BLOCK as usize]
        );
    }
}

#[test]
fn init_replays_a_populated_pool() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);

    // Build a pool with one live entry directly, as an unclean shutdown
    // would leave it.
    let payload = vec![b'R'; BLOCK as usize];
    {
        let pool = LogPool::create(&config.pool_file(), config.size, BLOCK as u32).unwrap();
        let reservation = pool.reserve(BLOCK).unwrap();
        pool.write_buffer(reservation.offset, &payload).unwrap();
        pool.flush_buffer(reservation.offset, BLOCK);

        let mut slot = LogEntrySlot::new(3 * BLOCK, BLOCK);
        slot.sync_gen_number = 2;
        slot.write_sequence_number = 9;
        slot.data_buffer_offset = reservation.offset;
        slot.set_flag(slot_flags::ENTRY_VALID, true);
        slot.set_flag(slot_flags::SEQUENCED, true);
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
    }

    let (cache, lower) = new_cache(&dir, config);

    // The recovered write reads back correctly, from the log while the
    // entry lives and from the re-flushed image after it retires.
    assert_eq!(do_read(&cache, 3 * BLOCK, BLOCK), payload);

    // Replayed entries are treated as dirty and re-flushed below.
    wait_until(|| cache.log_stats().dirty_entries == 0);
    assert_eq!(lower.contents(3 * BLOCK, BLOCK), payload);
    wait_until(|| cache.metrics().retired_entries == 1);
}

#[test]
fn multi_extent_write_creates_one_entry_per_extent() {
    let dir = TempDir::new().unwrap();
    let (cache, _lower) = new_cache(&dir, test_config(&dir));

    let mut data = vec![b'1'; BLOCK as usize];
    data.extend(vec![b'2'; BLOCK as usize]);
    wait_status(|done| {
        cache.write(
            vec![
                ImageExtent::new(0, BLOCK),
                ImageExtent::new(4 * BLOCK, BLOCK),
            ],
            data,
            done,
        )
    })
    .unwrap();

    assert_eq!(cache.metrics().log_ops, 2);
    assert_eq!(do_read(&cache, 0, BLOCK), vec![b'1'; BLOCK as usize]);
    assert_eq!(do_read(&cache, 4 * BLOCK, BLOCK), vec![b'2'; BLOCK as usize]);
}
