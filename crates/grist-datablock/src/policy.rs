//! GC start/stop thresholds, I/O priority selection, and the garbage-ratio
//! arithmetic behind them. Kept as pure functions so threshold behavior is
//! testable against exact numbers.

use grist_device::IoPriority;
use grist_types::Tuning;

/// Counters and gauges exported by the manager.
///
/// Counters are monotonic for the life of the manager; the `old_*` gauges
/// track the extents currently sitting in (or being rewritten out of) the
/// GC queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataBlockStats {
    /// Extents currently tracked in the extent table.
    pub data_extents: u64,
    /// Fresh extents activated by the allocator.
    pub extents_allocated: u64,
    /// Fully-garbage extents returned to the extent manager.
    pub extents_reclaimed: u64,
    /// GC rounds that selected a victim.
    pub extents_gced: u64,
    /// Data blocks written (user writes and GC rewrites alike).
    pub blocks_written: u64,
    /// `blocks_per_extent x |old or in-GC extents|`.
    pub old_total_blocks: u64,
    /// Garbage blocks across the same set.
    pub old_garbage_blocks: u64,
}

/// Fraction of old capacity that is garbage, discounted by held-but-unused
/// extents the allocator could draw on without any GC at all. Zero when
/// nothing is old.
pub(crate) fn garbage_ratio(
    old_garbage_blocks: u64,
    old_total_blocks: u64,
    held_extents: u64,
    blocks_per_extent: u32,
) -> f32 {
    if old_total_blocks == 0 {
        return 0.0;
    }
    #[expect(clippy::cast_precision_loss)] // block counts are far below 2^24
    {
        old_garbage_blocks as f32
            / (old_total_blocks + held_extents * u64::from(blocks_per_extent)) as f32
    }
}

/// Should a GC round that is already running continue with another victim?
pub(crate) fn should_keep_gcing(stopped: bool, ratio: f32, tuning: &Tuning) -> bool {
    !stopped && ratio > tuning.gc_low_ratio
}

/// Is it worth kicking GC off at all?
pub(crate) fn wants_gc_start(stopped: bool, ratio: f32, tuning: &Tuning) -> bool {
    !stopped && ratio > tuning.gc_high_ratio
}

/// Device priority for the next batch of GC I/O.
///
/// Stays on the nice account until the ratio runs 2% past the start
/// threshold; the band keeps the choice from flapping right at the
/// threshold.
pub(crate) fn gc_io_priority(ratio: f32, tuning: &Tuning) -> IoPriority {
    if ratio > tuning.gc_high_ratio * 1.02 {
        IoPriority(tuning.gc_io_priority_high)
    } else {
        IoPriority(tuning.gc_io_priority_nice)
    }
}
