#![forbid(unsafe_code)]
//! Core types for the Grist data block manager.
//!
//! Newtypes for block/transaction/extent identities, validated geometry
//! (block and extent sizes), tuning knobs, and the on-disk block header
//! codec shared by the write path, GC, and read-ahead.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Alignment required for direct-I/O submission buffers.
pub const DEVICE_BLOCK_SIZE: usize = 4096;

/// Bytes of header prepended to every on-disk block: `{block_id, txn_id}`.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Compile-time cap on simultaneously active data extents.
///
/// The runtime `num_active_extents` knob may be anything up to this; slots
/// above it can still be drained after a restart with a smaller setting.
pub const MAX_ACTIVE_EXTENTS: usize = 64;

/// Sentinel byte offset meaning "no extent" in metablock slots.
pub const NULL_OFFSET: u64 = u64::MAX;

/// Logical block identity, assigned by the caller. Zero is reserved and
/// never names a live block (read-ahead relies on this).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Index of an extent on the device: `byte_offset / extent_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtentIndex(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ExtentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration validation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Validated serialized-block size (power of two in 512..=65536, and large
/// enough to hold the block header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ConfigError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ConfigError::InvalidField {
                field: "block_size",
                reason: "must be a power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Payload capacity of one block (everything after the header).
    #[must_use]
    pub fn payload_len(self) -> usize {
        self.0 as usize - BLOCK_HEADER_SIZE
    }
}

/// Validated extent size (power of two, at least one block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExtentSize(u64);

impl ExtentSize {
    pub fn new(value: u64, block_size: BlockSize) -> Result<Self, ConfigError> {
        if !value.is_power_of_two() {
            return Err(ConfigError::InvalidField {
                field: "extent_size",
                reason: "must be a power of two",
            });
        }
        if value < u64::from(block_size.get()) {
            return Err(ConfigError::InvalidField {
                field: "extent_size",
                reason: "must hold at least one block",
            });
        }
        if value / u64::from(block_size.get()) > u64::from(u32::MAX) {
            return Err(ConfigError::InvalidField {
                field: "extent_size",
                reason: "blocks per extent must fit in u32",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Fixed on-disk geometry of the data block region.
///
/// Everything the manager needs to translate between byte offsets,
/// extent indices, and block slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    block_size: BlockSize,
    extent_size: ExtentSize,
}

impl Geometry {
    pub fn new(block_size: BlockSize, extent_size: ExtentSize) -> Self {
        Self {
            block_size,
            extent_size,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size.get()
    }

    #[must_use]
    pub fn extent_size(&self) -> u64 {
        self.extent_size.get()
    }

    #[must_use]
    pub fn blocks_per_extent(&self) -> u32 {
        #[expect(clippy::cast_possible_truncation)] // validated in ExtentSize::new
        {
            (self.extent_size.get() / u64::from(self.block_size.get())) as u32
        }
    }

    /// Extent containing the given byte offset.
    #[must_use]
    pub fn extent_index(&self, offset: u64) -> ExtentIndex {
        ExtentIndex(offset / self.extent_size.get())
    }

    /// Byte offset of the start of an extent.
    #[must_use]
    pub fn extent_offset(&self, index: ExtentIndex) -> u64 {
        index.0 * self.extent_size.get()
    }

    /// Block slot within its extent for the given byte offset.
    #[must_use]
    pub fn block_index(&self, offset: u64) -> u32 {
        #[expect(clippy::cast_possible_truncation)] // slot < blocks_per_extent
        {
            ((offset % self.extent_size.get()) / u64::from(self.block_size.get())) as u32
        }
    }

    /// Byte offset of slot `slot` within the extent starting at `extent_offset`.
    #[must_use]
    pub fn slot_offset(&self, extent_offset: u64, slot: u32) -> u64 {
        extent_offset + u64::from(slot) * u64::from(self.block_size.get())
    }

    #[must_use]
    pub fn is_block_aligned(&self, offset: u64) -> bool {
        offset % u64::from(self.block_size.get()) == 0
    }
}

/// Runtime tuning for allocation, GC thresholds, and read-ahead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    /// Active extents the allocator round-robins over (<= `MAX_ACTIVE_EXTENTS`).
    pub num_active_extents: u32,
    /// GC keeps running while the garbage ratio exceeds this.
    pub gc_low_ratio: f32,
    /// GC starts once the garbage ratio exceeds this.
    pub gc_high_ratio: f32,
    /// Young queue length beyond which extents age into the GC queue.
    pub young_extent_max: usize,
    /// Age in microseconds beyond which a young extent ages into the GC queue.
    pub young_extent_timelimit_micros: u64,
    /// Read-ahead window cap, in blocks. Must be a power of two so windows
    /// tile an extent exactly.
    pub max_read_ahead_blocks: u32,
    /// Device priority for GC I/O under normal pressure.
    pub gc_io_priority_nice: u32,
    /// Device priority for GC I/O once the garbage ratio runs away.
    pub gc_io_priority_high: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            num_active_extents: 1,
            gc_low_ratio: 0.15,
            gc_high_ratio: 0.30,
            young_extent_max: 50,
            young_extent_timelimit_micros: 50_000,
            max_read_ahead_blocks: 32,
            gc_io_priority_nice: 8,
            gc_io_priority_high: 64,
        }
    }
}

impl Tuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_active_extents == 0 || self.num_active_extents as usize > MAX_ACTIVE_EXTENTS {
            return Err(ConfigError::InvalidField {
                field: "num_active_extents",
                reason: "must be in 1..=MAX_ACTIVE_EXTENTS",
            });
        }
        if !(0.0..1.0).contains(&self.gc_low_ratio) || !(0.0..1.0).contains(&self.gc_high_ratio) {
            return Err(ConfigError::InvalidField {
                field: "gc_ratio",
                reason: "ratios must be in [0, 1)",
            });
        }
        if self.gc_low_ratio >= self.gc_high_ratio {
            return Err(ConfigError::InvalidField {
                field: "gc_low_ratio",
                reason: "must be strictly below gc_high_ratio",
            });
        }
        if !self.max_read_ahead_blocks.is_power_of_two() {
            return Err(ConfigError::InvalidField {
                field: "max_read_ahead_blocks",
                reason: "must be a power of two",
            });
        }
        Ok(())
    }
}

/// On-disk block header, written immediately before the payload.
///
/// Encoded little-endian: `block_id` then `txn_id`, 8 bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_id: BlockId,
    pub txn_id: TxnId,
}

impl BlockHeader {
    /// Stamp the header into the first `BLOCK_HEADER_SIZE` bytes of `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` is shorter than the header.
    pub fn write_to(&self, block: &mut [u8]) {
        block[0..8].copy_from_slice(&self.block_id.0.to_le_bytes());
        block[8..16].copy_from_slice(&self.txn_id.0.to_le_bytes());
    }

    /// Decode the header from the start of `block`, or `None` if the slice
    /// is too short.
    #[must_use]
    pub fn read_from(block: &[u8]) -> Option<Self> {
        if block.len() < BLOCK_HEADER_SIZE {
            return None;
        }
        let block_id = u64::from_le_bytes(block[0..8].try_into().ok()?);
        let txn_id = u64::from_le_bytes(block[8..16].try_into().ok()?);
        Some(Self {
            block_id: BlockId(block_id),
            txn_id: TxnId(txn_id),
        })
    }
}
