//! Per-extent liveness accounting.
//!
//! An [`ExtentEntry`] records, for one extent, which block slots hold
//! garbage, what lifecycle state the extent is in, and when it was created.
//! The [`ExtentTable`] owns every entry, keyed by extent index; queues and
//! the GC engine refer to entries by index and must drop those references
//! before an entry is destroyed.

use grist_types::ExtentIndex;

/// Garbage bitmap over the block slots of one extent. Bit `i` set means
/// "slot `i` is garbage"; fresh extents start all-garbage and slots are
/// cleared as blocks are written into them.
#[derive(Debug, Clone)]
pub(crate) struct GArray {
    words: Vec<u64>,
    len: u32,
    ones: u32,
}

impl GArray {
    /// All-garbage bitmap of `len` slots.
    pub(crate) fn all_garbage(len: u32) -> Self {
        let word_count = (len as usize).div_ceil(64);
        let mut words = vec![!0_u64; word_count];
        let tail = len as usize % 64;
        if tail != 0 {
            words[word_count - 1] = (1_u64 << tail) - 1;
        }
        Self { words, len, ones: len }
    }

    pub(crate) fn get(&self, slot: u32) -> bool {
        debug_assert!(slot < self.len);
        (self.words[slot as usize / 64] >> (slot % 64)) & 1 == 1
    }

    /// Mark `slot` garbage. No-op if already set.
    pub(crate) fn set(&mut self, slot: u32) {
        debug_assert!(slot < self.len);
        let word = &mut self.words[slot as usize / 64];
        let mask = 1_u64 << (slot % 64);
        if *word & mask == 0 {
            *word |= mask;
            self.ones += 1;
        }
    }

    /// Mark `slot` live. No-op if already clear.
    pub(crate) fn clear(&mut self, slot: u32) {
        debug_assert!(slot < self.len);
        let word = &mut self.words[slot as usize / 64];
        let mask = 1_u64 << (slot % 64);
        if *word & mask != 0 {
            *word &= !mask;
            self.ones -= 1;
        }
    }

    /// Number of garbage slots. O(1).
    pub(crate) fn count(&self) -> u32 {
        self.ones
    }

    pub(crate) fn len(&self) -> u32 {
        self.len
    }

    /// True when every slot is garbage.
    pub(crate) fn is_full(&self) -> bool {
        self.ones == self.len
    }
}

/// Lifecycle state of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentState {
    /// Created during startup liveness reconstruction.
    Reconstructing,
    /// Receiving new writes; never a GC candidate.
    Active,
    /// Recently filled; parked in the young queue before aging.
    Young,
    /// Aged into the GC priority queue.
    Old,
    /// Currently being rewritten by the GC engine.
    InGc,
}

#[derive(Debug)]
pub(crate) struct ExtentEntry {
    /// Byte offset of the extent on the device.
    pub(crate) offset: u64,
    pub(crate) g_array: GArray,
    pub(crate) state: ExtentState,
    /// Creation time, used by the young-extent age policy.
    pub(crate) timestamp_micros: u64,
}

impl ExtentEntry {
    pub(crate) fn new_active(offset: u64, blocks_per_extent: u32, now_micros: u64) -> Self {
        Self {
            offset,
            g_array: GArray::all_garbage(blocks_per_extent),
            state: ExtentState::Active,
            timestamp_micros: now_micros,
        }
    }

    pub(crate) fn new_reconstructing(offset: u64, blocks_per_extent: u32, now_micros: u64) -> Self {
        Self {
            offset,
            g_array: GArray::all_garbage(blocks_per_extent),
            state: ExtentState::Reconstructing,
            timestamp_micros: now_micros,
        }
    }
}

/// Sparse map extent-index -> entry, dense over the used prefix of the
/// device. Lookup is O(1); growth is amortized O(1).
#[derive(Debug, Default)]
pub(crate) struct ExtentTable {
    slots: Vec<Option<ExtentEntry>>,
    present: usize,
}

impl ExtentTable {
    pub(crate) fn get(&self, index: ExtentIndex) -> Option<&ExtentEntry> {
        self.slots.get(index.0 as usize).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, index: ExtentIndex) -> Option<&mut ExtentEntry> {
        self.slots.get_mut(index.0 as usize).and_then(Option::as_mut)
    }

    pub(crate) fn insert(&mut self, index: ExtentIndex, entry: ExtentEntry) {
        let i = index.0 as usize;
        if i >= self.slots.len() {
            self.slots.resize_with(i + 1, || None);
        }
        debug_assert!(self.slots[i].is_none(), "extent {index} already present");
        self.slots[i] = Some(entry);
        self.present += 1;
    }

    pub(crate) fn remove(&mut self, index: ExtentIndex) -> Option<ExtentEntry> {
        let removed = self.slots.get_mut(index.0 as usize).and_then(Option::take);
        if removed.is_some() {
            self.present -= 1;
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.present
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ExtentIndex, &ExtentEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (ExtentIndex(i as u64), e)))
    }
}
