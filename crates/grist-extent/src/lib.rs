#![forbid(unsafe_code)]
//! Extent allocation: hands raw device extents to the data block manager
//! and takes them back when GC or retirement empties them.
//!
//! The manager only needs three operations, expressed by [`ExtentManager`];
//! [`FreeListExtents`] is the standard implementation, reusing reclaimed
//! extents FIFO before growing into fresh device space.

use grist_error::{GristError, Result};
use grist_types::ExtentSize;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Source of raw extents.
///
/// Offsets are byte offsets on the device, always extent-aligned.
pub trait ExtentManager: Send {
    /// Acquire an extent for exclusive use. Fails with `NoSpace` when the
    /// device region is exhausted.
    fn gen_extent(&mut self) -> Result<u64>;

    /// Return a previously acquired extent to the free pool.
    fn release_extent(&mut self, offset: u64);

    /// Number of extents sitting in the free pool: capacity the allocator
    /// can hand out again without growing the used region.
    fn held_extents(&self) -> u64;
}

/// FIFO free-list allocator over a bounded device region.
#[derive(Debug)]
pub struct FreeListExtents {
    extent_size: u64,
    /// Exclusive end of the region extents may be carved from.
    region_end: u64,
    /// High-water mark: next never-used offset.
    tip: u64,
    free: VecDeque<u64>,
}

impl FreeListExtents {
    /// Manage the region `[0, region_len)` of the device.
    #[must_use]
    pub fn new(extent_size: ExtentSize, region_len: u64) -> Self {
        let size = extent_size.get();
        Self {
            extent_size: size,
            region_end: region_len - region_len % size,
            tip: 0,
            free: VecDeque::new(),
        }
    }

    /// Rebuild the in-use picture at startup: every extent containing a
    /// live block (or named by the metablock) is claimed before normal
    /// allocation resumes.
    pub fn note_in_use(&mut self, offset: u64) {
        debug_assert_eq!(offset % self.extent_size, 0, "unaligned extent offset");
        if offset >= self.tip {
            // Everything between the old tip and this extent was unused;
            // keep it allocatable.
            let mut gap = self.tip;
            while gap < offset {
                self.free.push_back(gap);
                gap += self.extent_size;
            }
            self.tip = offset + self.extent_size;
        } else if let Some(pos) = self.free.iter().position(|f| *f == offset) {
            self.free.remove(pos);
        }
    }

    #[must_use]
    pub fn extents_in_use(&self) -> u64 {
        self.tip / self.extent_size - self.free.len() as u64
    }
}

impl ExtentManager for FreeListExtents {
    fn gen_extent(&mut self) -> Result<u64> {
        if let Some(offset) = self.free.pop_front() {
            trace!(target: "grist::extent", event = "reuse", offset);
            return Ok(offset);
        }
        if self.tip + self.extent_size > self.region_end {
            debug!(target: "grist::extent", event = "exhausted", tip = self.tip);
            return Err(GristError::NoSpace);
        }
        let offset = self.tip;
        self.tip += self.extent_size;
        trace!(target: "grist::extent", event = "grow", offset);
        Ok(offset)
    }

    fn release_extent(&mut self, offset: u64) {
        debug_assert_eq!(offset % self.extent_size, 0, "unaligned extent offset");
        debug_assert!(offset < self.tip, "releasing an extent that was never handed out");
        debug_assert!(
            !self.free.contains(&offset),
            "double release of extent at {offset}"
        );
        self.free.push_back(offset);
    }

    fn held_extents(&self) -> u64 {
        self.free.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grist_types::BlockSize;

    fn extents(extent: u64, region: u64) -> FreeListExtents {
        let bs = BlockSize::new(512).unwrap();
        FreeListExtents::new(ExtentSize::new(extent, bs).unwrap(), region)
    }

    #[test]
    fn grows_then_reuses_fifo() {
        let mut em = extents(2048, 1 << 20);
        let a = em.gen_extent().unwrap();
        let b = em.gen_extent().unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 2048);
        assert_eq!(em.held_extents(), 0);

        em.release_extent(a);
        em.release_extent(b);
        assert_eq!(em.held_extents(), 2);

        // FIFO: the first released comes back first.
        assert_eq!(em.gen_extent().unwrap(), a);
        assert_eq!(em.gen_extent().unwrap(), b);
    }

    #[test]
    fn runs_out_of_space_at_region_end() {
        let mut em = extents(2048, 4096);
        em.gen_extent().unwrap();
        em.gen_extent().unwrap();
        assert!(matches!(em.gen_extent(), Err(GristError::NoSpace)));

        em.release_extent(0);
        assert_eq!(em.gen_extent().unwrap(), 0);
    }

    #[test]
    fn note_in_use_skips_claimed_extents() {
        let mut em = extents(2048, 1 << 20);
        em.note_in_use(4096);
        em.note_in_use(8192);

        // The gaps below and between claimed extents stay allocatable.
        assert_eq!(em.held_extents(), 3);
        assert_eq!(em.gen_extent().unwrap(), 0);
        assert_eq!(em.gen_extent().unwrap(), 2048);
        assert_eq!(em.gen_extent().unwrap(), 6144);
        // Fresh growth resumes past the claimed area.
        assert_eq!(em.gen_extent().unwrap(), 10240);
        assert_eq!(em.extents_in_use(), 6);
    }
}
