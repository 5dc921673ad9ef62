#![forbid(unsafe_code)]
//! Core value types for the write log: image and block extents, the
//! persistent 64-byte log-entry record, and shared pool-geometry constants.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Block size of the cache. All external I/O must be a whole number of
/// blocks starting on a block boundary.
pub const MIN_WRITE_SIZE: u64 = 512;

/// Allocation granularity for data buffers in the pool.
pub const MIN_WRITE_ALLOC_SIZE: u64 = 512;

/// Size of one persistent log-entry record.
pub const LOG_ENTRY_SLOT_SIZE: u64 = 64;

/// Per-allocation bookkeeping overhead charged when sizing the entry ring.
pub const BLOCK_ALLOC_OVERHEAD_BYTES: u64 = 16;

/// Upper bound on ring slots regardless of pool size.
pub const MAX_LOG_ENTRIES: u64 = 1 << 20;

/// Smallest pool a cache will operate on.
pub const MIN_POOL_SIZE: u64 = 1 << 23;

/// Pool size used when the configuration does not specify one.
pub const DEFAULT_POOL_SIZE: u64 = 1 << 30;

/// Fraction of the pool usable for entries and data after overheads.
pub const USABLE_SIZE: f64 = 7.0 / 10.0;

/// Layout version stamped into the pool root header.
pub const RWL_POOL_VERSION: u8 = 1;

/// A byte extent in the logical image: `(offset, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageExtent {
    pub offset_bytes: u64,
    pub length_bytes: u64,
}

impl ImageExtent {
    #[must_use]
    pub fn new(offset_bytes: u64, length_bytes: u64) -> Self {
        Self {
            offset_bytes,
            length_bytes,
        }
    }

    /// First byte past the end of the extent.
    #[must_use]
    pub fn end_bytes(self) -> u64 {
        self.offset_bytes + self.length_bytes
    }

    /// Whether offset and length both fall on block boundaries.
    #[must_use]
    pub fn is_block_aligned(self) -> bool {
        self.offset_bytes % MIN_WRITE_SIZE == 0 && self.length_bytes % MIN_WRITE_SIZE == 0
    }

    /// The block extent covering this image extent.
    ///
    /// For unaligned extents this is the enclosing block-aligned superset.
    #[must_use]
    pub fn block_extent(self) -> BlockExtent {
        block_extent(self.offset_bytes, self.length_bytes)
    }
}

impl fmt::Display for ImageExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}~{}]", self.offset_bytes, self.length_bytes)
    }
}

/// An inclusive `[start, end]` interval in block units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockExtent {
    pub start: u64,
    pub end: u64,
}

impl BlockExtent {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Number of blocks covered.
    #[must_use]
    pub fn blocks(self) -> u64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub fn overlaps(self, other: BlockExtent) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    #[must_use]
    pub fn contains(self, other: BlockExtent) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// The image extent covering exactly these blocks.
    #[must_use]
    pub fn image_extent(self) -> ImageExtent {
        ImageExtent::new(self.start * MIN_WRITE_SIZE, self.blocks() * MIN_WRITE_SIZE)
    }
}

impl fmt::Display for BlockExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

/// Block extent enclosing `length` bytes at `offset`.
#[must_use]
pub fn block_extent(offset_bytes: u64, length_bytes: u64) -> BlockExtent {
    debug_assert!(length_bytes > 0);
    BlockExtent {
        start: offset_bytes / MIN_WRITE_SIZE,
        end: (offset_bytes + length_bytes - 1) / MIN_WRITE_SIZE,
    }
}

/// Whether every extent is block aligned.
#[must_use]
pub fn is_block_aligned(extents: &[ImageExtent]) -> bool {
    extents.iter().all(|extent| extent.is_block_aligned())
}

/// Aggregate byte and block bounds across a request's extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentsSummary {
    pub total_bytes: u64,
    pub first_image_byte: u64,
    pub last_image_byte: u64,
    pub first_block: u64,
    pub last_block: u64,
}

impl ExtentsSummary {
    #[must_use]
    pub fn new(extents: &[ImageExtent]) -> Self {
        let Some(front) = extents.first() else {
            return Self::default();
        };
        let mut summary = Self {
            total_bytes: 0,
            first_image_byte: front.offset_bytes,
            last_image_byte: front.end_bytes(),
            first_block: 0,
            last_block: 0,
        };
        for extent in extents {
            summary.total_bytes += extent.length_bytes;
            summary.first_image_byte = summary.first_image_byte.min(extent.offset_bytes);
            summary.last_image_byte = summary.last_image_byte.max(extent.end_bytes());
        }
        summary.first_block = summary.first_image_byte / MIN_WRITE_SIZE;
        summary.last_block = (summary.last_image_byte - 1) / MIN_WRITE_SIZE;
        summary
    }

    /// Guard range covering every block the request touches.
    #[must_use]
    pub fn block_extent(&self) -> BlockExtent {
        BlockExtent::new(self.first_block, self.last_block)
    }
}

/// Flag bits of a persistent log-entry record.
pub mod slot_flags {
    /// Record occupies a live ring slot; if clear the slot is free.
    pub const ENTRY_VALID: u8 = 1 << 0;
    /// Record marks a sync point (no data, no sequence number).
    pub const SYNC_POINT: u8 = 1 << 1;
    /// `write_sequence_number` is valid.
    pub const SEQUENCED: u8 = 1 << 2;
    /// `data_buffer_offset` refers to a live data buffer.
    pub const HAS_DATA: u8 = 1 << 3;
    /// Record describes an unmap; `HAS_DATA` is clear.
    pub const UNMAP: u8 = 1 << 4;
}

/// The persistent log-entry record, exactly [`LOG_ENTRY_SLOT_SIZE`] bytes
/// on the medium. The in-pool copy is authoritative; volatile state lives
/// alongside a RAM mirror of this struct in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogEntrySlot {
    pub sync_gen_number: u64,
    pub write_sequence_number: u64,
    pub image_offset_bytes: u64,
    pub write_bytes: u64,
    /// Arena-relative offset of the data buffer; meaningful iff `HAS_DATA`.
    pub data_buffer_offset: u64,
    pub flags: u8,
}

impl LogEntrySlot {
    #[must_use]
    pub fn new(image_offset_bytes: u64, write_bytes: u64) -> Self {
        Self {
            image_offset_bytes,
            write_bytes,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.has_flag(slot_flags::ENTRY_VALID)
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.has_flag(slot_flags::HAS_DATA)
    }

    #[must_use]
    pub fn block_extent(&self) -> BlockExtent {
        block_extent(self.image_offset_bytes, self.write_bytes)
    }

    /// Serialize into a slot-sized buffer. Bytes past the flags are zero.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if out.len() < LOG_ENTRY_SLOT_SIZE as usize {
            return Err(ParseError::InsufficientData {
                needed: LOG_ENTRY_SLOT_SIZE as usize,
                actual: out.len(),
            });
        }
        out[..LOG_ENTRY_SLOT_SIZE as usize].fill(0);
        out[0..8].copy_from_slice(&self.sync_gen_number.to_le_bytes());
        out[8..16].copy_from_slice(&self.write_sequence_number.to_le_bytes());
        out[16..24].copy_from_slice(&self.image_offset_bytes.to_le_bytes());
        out[24..32].copy_from_slice(&self.write_bytes.to_le_bytes());
        out[32..40].copy_from_slice(&self.data_buffer_offset.to_le_bytes());
        out[40] = self.flags;
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < LOG_ENTRY_SLOT_SIZE as usize {
            return Err(ParseError::InsufficientData {
                needed: LOG_ENTRY_SLOT_SIZE as usize,
                actual: data.len(),
            });
        }
        let flags = data[40];
        let known = slot_flags::ENTRY_VALID
            | slot_flags::SYNC_POINT
            | slot_flags::SEQUENCED
            | slot_flags::HAS_DATA
            | slot_flags::UNMAP;
        if flags & !known != 0 {
            return Err(ParseError::InvalidField {
                field: "flags",
                reason: "unknown flag bits set",
            });
        }
        Ok(Self {
            sync_gen_number: read_le_u64(data, 0)?,
            write_sequence_number: read_le_u64(data, 8)?,
            image_offset_bytes: read_le_u64(data, 16)?,
            write_bytes: read_le_u64(data, 24)?,
            data_buffer_offset: read_le_u64(data, 32)?,
            flags,
        })
    }
}

impl fmt::Display for LogEntrySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "valid={} sync_point={} sequenced={} has_data={} gen={} seq={} offset={} bytes={}",
            self.is_valid(),
            self.has_flag(slot_flags::SYNC_POINT),
            self.has_flag(slot_flags::SEQUENCED),
            self.has_data(),
            self.sync_gen_number,
            self.write_sequence_number,
            self.image_offset_bytes,
            self.write_bytes,
        )
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes, got {actual}")]
    InsufficientData { needed: usize, actual: usize },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_extent_round_trip() {
        let image = ImageExtent::new(MIN_WRITE_SIZE * 3, MIN_WRITE_SIZE * 4);
        let blocks = image.block_extent();
        assert_eq!(blocks, BlockExtent::new(3, 6));
        assert_eq!(blocks.image_extent(), image);
    }

    #[test]
    fn block_extent_is_inclusive() {
        let extent = block_extent(0, MIN_WRITE_SIZE);
        assert_eq!(extent, BlockExtent::new(0, 0));
        assert_eq!(extent.blocks(), 1);
    }

    #[test]
    fn unaligned_extent_inflates_to_enclosing_blocks() {
        let extent = ImageExtent::new(100, 100);
        assert!(!extent.is_block_aligned());
        assert_eq!(extent.block_extent(), BlockExtent::new(0, 0));

        let extent = ImageExtent::new(MIN_WRITE_SIZE - 1, 2);
        assert_eq!(extent.block_extent(), BlockExtent::new(0, 1));
    }

    #[test]
    fn overlap_predicates() {
        let a = BlockExtent::new(2, 5);
        assert!(a.overlaps(BlockExtent::new(5, 9)));
        assert!(a.overlaps(BlockExtent::new(0, 2)));
        assert!(!a.overlaps(BlockExtent::new(6, 9)));
        assert!(a.contains(BlockExtent::new(3, 4)));
        assert!(!a.contains(BlockExtent::new(3, 6)));
    }

    #[test]
    fn summary_spans_unordered_extents() {
        let extents = [
            ImageExtent::new(MIN_WRITE_SIZE * 8, MIN_WRITE_SIZE),
            ImageExtent::new(0, MIN_WRITE_SIZE * 2),
        ];
        let summary = ExtentsSummary::new(&extents);
        assert_eq!(summary.total_bytes, MIN_WRITE_SIZE * 3);
        assert_eq!(summary.first_image_byte, 0);
        assert_eq!(summary.last_image_byte, MIN_WRITE_SIZE * 9);
        assert_eq!(summary.block_extent(), BlockExtent::new(0, 8));
    }

    #[test]
    fn slot_encode_decode_round_trip() {
        let mut slot = LogEntrySlot::new(4096, 1024);
        slot.sync_gen_number = 7;
        slot.write_sequence_number = 42;
        slot.data_buffer_offset = 8192;
        slot.set_flag(slot_flags::ENTRY_VALID, true);
        slot.set_flag(slot_flags::SEQUENCED, true);
        slot.set_flag(slot_flags::HAS_DATA, true);

        let mut buf = [0_u8; LOG_ENTRY_SLOT_SIZE as usize];
        slot.encode_into(&mut buf).unwrap();
        let decoded = LogEntrySlot::decode(&buf).unwrap();
        assert_eq!(decoded, slot);
        assert_eq!(decoded.block_extent(), BlockExtent::new(8, 9));
    }

    #[test]
    fn slot_decode_rejects_unknown_flags() {
        let mut buf = [0_u8; LOG_ENTRY_SLOT_SIZE as usize];
        buf[40] = 0x80;
        assert!(matches!(
            LogEntrySlot::decode(&buf),
            Err(ParseError::InvalidField { field: "flags", .. })
        ));
    }

    #[test]
    fn slot_decode_rejects_short_input() {
        let buf = [0_u8; 32];
        assert!(matches!(
            LogEntrySlot::decode(&buf),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn zeroed_slot_is_free() {
        let slot = LogEntrySlot::decode(&[0_u8; LOG_ENTRY_SLOT_SIZE as usize]).unwrap();
        assert!(!slot.is_valid());
    }
}
