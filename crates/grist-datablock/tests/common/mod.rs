//! Shared test rig: a simulated serializer host (LBA index, cooperative
//! main mutex, GC rewrite plumbing), an in-memory device with pumped
//! completions, and a free-list extent manager.
#![allow(dead_code)]

use grist_datablock::{
    DataBlockManager, DataBlockMetablock, GcWrite, Host, LbaEntry, LbaIndex, ManualClock,
    SharedExtents, UserCompletion,
};
use grist_device::{AlignedVec, DeviceFile, IoPriority, MemDevice};
use grist_extent::FreeListExtents;
use grist_types::{
    BLOCK_HEADER_SIZE, BlockHeader, BlockId, BlockSize, ExtentSize, Geometry, Tuning, TxnId,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
pub struct SimLba {
    pub entries: HashMap<BlockId, LbaEntry>,
    pub recency: HashMap<BlockId, u64>,
}

impl LbaIndex for SimLba {
    fn block_offset(&self, id: BlockId) -> Option<LbaEntry> {
        self.entries.get(&id).copied()
    }

    fn block_recency(&self, id: BlockId) -> u64 {
        self.recency.get(&id).copied().unwrap_or(0)
    }
}

/// Serializer stand-in. The main mutex is cooperative: grants are inline
/// unless `defer_mutex` is set, in which case the test hands them out with
/// `grant_lock` + `on_lock_available`. GC rewrite batches apply inline
/// unless `defer_gc_writes` is set.
pub struct SimHost {
    pub lba: SimLba,
    pub read_ahead: bool,
    pub accept_offers: bool,
    /// Offered read-ahead blocks: `(id, raw block, recency)`.
    pub offers: Vec<(BlockId, Vec<u8>, u64)>,
    pub mutex_locked: bool,
    pub defer_mutex: bool,
    pub lock_pending: bool,
    pub defer_gc_writes: bool,
    pub pending_gc: Option<(Vec<GcWrite>, IoPriority)>,
    /// Every `write_gcs` call: `(batch len, priority)`.
    pub gc_write_batches: Vec<(usize, IoPriority)>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self {
            lba: SimLba::default(),
            read_ahead: false,
            accept_offers: true,
            offers: Vec::new(),
            mutex_locked: false,
            defer_mutex: false,
            lock_pending: false,
            defer_gc_writes: false,
            pending_gc: None,
            gc_write_batches: Vec::new(),
        }
    }
}

impl SimHost {
    /// Grant a deferred mutex request. The caller follows up with
    /// `manager.on_lock_available`.
    pub fn grant_lock(&mut self) {
        assert!(self.lock_pending, "no lock request pending");
        assert!(!self.mutex_locked, "mutex already held");
        self.lock_pending = false;
        self.mutex_locked = true;
    }

    /// Apply a deferred GC batch. The caller follows up with
    /// `manager.on_gc_write_done`.
    pub fn flush_gc_writes(&mut self, manager: &mut DataBlockManager) {
        let (writes, priority) = self.pending_gc.take().expect("no GC batch pending");
        self.apply_gc_writes(manager, writes, priority);
    }

    fn apply_gc_writes(
        &mut self,
        manager: &mut DataBlockManager,
        writes: Vec<GcWrite>,
        priority: IoPriority,
    ) {
        for w in writes {
            let old = self.lba.entries[&w.block_id].offset;
            let (new_offset, _ticket) = manager
                .write(w.block, w.block_id, None, priority)
                .expect("GC rewrite");
            self.lba.entries.insert(
                w.block_id,
                LbaEntry {
                    offset: new_offset,
                    deleted: false,
                },
            );
            manager.mark_garbage(old);
        }
    }
}

impl Host for SimHost {
    fn request_main_mutex(&mut self) -> bool {
        if self.defer_mutex {
            self.lock_pending = true;
            false
        } else {
            assert!(!self.mutex_locked, "re-entrant mutex request");
            self.mutex_locked = true;
            true
        }
    }

    fn release_main_mutex(&mut self) {
        assert!(self.mutex_locked, "releasing an unheld mutex");
        self.mutex_locked = false;
    }

    fn write_gcs(
        &mut self,
        manager: &mut DataBlockManager,
        writes: Vec<GcWrite>,
        priority: IoPriority,
    ) -> bool {
        self.release_main_mutex();
        self.gc_write_batches.push((writes.len(), priority));
        if self.defer_gc_writes {
            self.pending_gc = Some((writes, priority));
            false
        } else {
            self.apply_gc_writes(manager, writes, priority);
            true
        }
    }

    fn should_perform_read_ahead(&self) -> bool {
        self.read_ahead
    }

    fn offer_read_ahead_block(&mut self, id: BlockId, block: AlignedVec, recency: u64) -> bool {
        if self.accept_offers {
            self.offers.push((id, block.into_vec(), recency));
            true
        } else {
            false
        }
    }

    fn lba(&self) -> &dyn LbaIndex {
        &self.lba
    }
}

pub struct Rig {
    pub mgr: DataBlockManager,
    pub host: SimHost,
    pub device: Arc<MemDevice>,
    pub clock: ManualClock,
    pub extents: Arc<Mutex<FreeListExtents>>,
    pub geo: Geometry,
}

pub const DEVICE_LEN: usize = 1 << 20;

/// Standard small geometry: 512-byte blocks, 4 blocks per extent.
pub fn small_geometry() -> Geometry {
    let bs = BlockSize::new(512).unwrap();
    Geometry::new(bs, ExtentSize::new(2048, bs).unwrap())
}

/// Build an un-started rig; call `start` (or drive reconstruction by hand).
pub fn rig_with(geo: Geometry, tuning: Tuning) -> Rig {
    let es = ExtentSize::new(geo.extent_size(), BlockSize::new(geo.block_size()).unwrap()).unwrap();
    let extents = Arc::new(Mutex::new(FreeListExtents::new(es, DEVICE_LEN as u64)));
    let shared: SharedExtents = extents.clone();
    let clock = ManualClock::default();
    let mgr = DataBlockManager::new(geo, tuning, shared, Box::new(clock.clone())).unwrap();
    Rig {
        mgr,
        host: SimHost::default(),
        device: Arc::new(MemDevice::new(DEVICE_LEN)),
        clock,
        extents,
        geo,
    }
}

/// Small-geometry rig with scenario-friendly GC thresholds.
pub fn rig(num_active: u32, young_max: usize) -> Rig {
    let tuning = Tuning {
        num_active_extents: num_active,
        young_extent_max: young_max,
        gc_low_ratio: 0.3,
        gc_high_ratio: 0.5,
        ..Tuning::default()
    };
    rig_with(small_geometry(), tuning)
}

/// Empty-device startup.
pub fn start(r: &mut Rig) {
    start_with(r, &DataBlockMetablock::default());
}

pub fn start_with(r: &mut Rig, metablock: &DataBlockMetablock) {
    r.mgr.start_reconstruct();
    r.mgr.end_reconstruct();
    let device: Arc<dyn DeviceFile> = r.device.clone();
    r.mgr.start_existing(device, metablock);
}

/// A full block image whose payload bytes are all `fill`.
pub fn block_with_payload(block_len: usize, fill: u8) -> AlignedVec {
    let mut block = AlignedVec::new(block_len);
    block.as_mut_slice()[BLOCK_HEADER_SIZE..].fill(fill);
    block
}

/// Raw on-disk block bytes with a stamped header (device test fixtures).
pub fn raw_block(block_len: usize, id: u64, txn: u64, fill: u8) -> Vec<u8> {
    let mut bytes = vec![fill; block_len];
    BlockHeader {
        block_id: BlockId(id),
        txn_id: TxnId(txn),
    }
    .write_to(&mut bytes);
    bytes
}

/// Write a block through the manager and record it in the simulated LBA.
pub fn write_block(r: &mut Rig, id: u64) -> u64 {
    let block_len = r.geo.block_size() as usize;
    #[expect(clippy::cast_possible_truncation)]
    let (offset, _ticket) = r
        .mgr
        .write(
            block_with_payload(block_len, id as u8),
            BlockId(id),
            Some(TxnId(1)),
            IoPriority::default(),
        )
        .expect("write");
    r.host.lba.entries.insert(
        BlockId(id),
        LbaEntry {
            offset,
            deleted: false,
        },
    );
    r.host.lba.recency.entry(BlockId(id)).or_insert(0);
    offset
}

/// Drop a block: forget it in the LBA and mark its old location garbage.
pub fn retire_block(r: &mut Rig, id: u64) {
    let entry = r
        .host
        .lba
        .entries
        .remove(&BlockId(id))
        .expect("retiring unknown block");
    r.mgr.mark_garbage(entry.offset);
}

/// Pump the device and route completions until the system settles.
/// Returns the user-visible completions, in delivery order.
pub fn drain(r: &mut Rig) -> Vec<UserCompletion> {
    let mut out = Vec::new();
    loop {
        r.device.pump_all();
        let completions = r.device.poll_completions();
        if completions.is_empty() {
            break;
        }
        for c in completions {
            if let Some(user) = r.mgr.on_io_complete(&mut r.host, c) {
                out.push(user);
            }
        }
    }
    out
}
