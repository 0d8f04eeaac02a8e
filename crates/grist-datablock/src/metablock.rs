//! The manager's slice of the metablock: which extents were active at the
//! last checkpoint and how far each had filled. Everything else about an
//! extent is reconstructed from the startup liveness scan.

use grist_types::{MAX_ACTIVE_EXTENTS, NULL_OFFSET};
use serde::{Deserialize, Serialize};

/// Active-extent state carried through the metablock.
///
/// Slot `i` describes active slot `i`: the extent's byte offset (or
/// [`NULL_OFFSET`] for an empty slot) and the number of blocks already
/// allocated in it. Both vectors always have `MAX_ACTIVE_EXTENTS` entries
/// so a restart with a smaller `num_active_extents` still sees, and can
/// drain, the extra slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlockMetablock {
    pub active_offset: Vec<u64>,
    pub blocks_in_active: Vec<u32>,
}

impl Default for DataBlockMetablock {
    fn default() -> Self {
        Self {
            active_offset: vec![NULL_OFFSET; MAX_ACTIVE_EXTENTS],
            blocks_in_active: vec![0; MAX_ACTIVE_EXTENTS],
        }
    }
}

impl DataBlockMetablock {
    #[must_use]
    pub fn slot(&self, i: usize) -> Option<(u64, u32)> {
        if self.active_offset[i] == NULL_OFFSET {
            None
        } else {
            Some((self.active_offset[i], self.blocks_in_active[i]))
        }
    }
}
