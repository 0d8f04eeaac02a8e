#![forbid(unsafe_code)]
//! The data block manager: owns the on-disk region of fixed-size data
//! blocks inside a log-structured serializer.
//!
//! Responsibilities:
//!
//! - append-only allocation of block offsets across a small set of active
//!   extents (round-robin, promoting filled extents toward GC);
//! - per-block liveness accounting for every extent;
//! - a cost-driven garbage collector that rewrites the live remainder of
//!   mostly-garbage extents through the enclosing serializer;
//! - opportunistic read-ahead on point reads;
//! - metablock handoff of active-extent state and startup reconstruction
//!   of liveness from an external scan.
//!
//! ## Execution model
//!
//! Everything runs on one I/O thread, cooperatively. Device I/O is
//! submitted through [`grist_device::DeviceFile`] and completes later; the
//! driving loop feeds completions back through
//! [`DataBlockManager::on_io_complete`], which advances the GC state
//! machine for its own I/O and hands finished user operations back to the
//! caller. Between a submission and its completion any other entry point
//! (`write`, `mark_garbage`, ...) may run; the GC engine re-validates its
//! victim after every such gap.

mod entry;
mod gc;
mod hooks;
mod metablock;
mod policy;
mod pq;
mod read_ahead;

pub use entry::ExtentState;
pub use gc::GcStep;
pub use hooks::{GcWrite, Host, LbaEntry, LbaIndex};
pub use metablock::DataBlockMetablock;
pub use policy::DataBlockStats;

use crate::entry::{ExtentEntry, ExtentTable};
use crate::gc::{GcGauges, GcState};
use crate::pq::GcPq;
use grist_device::{AlignedVec, DeviceFile, IoCompletion, IoOp, IoOutcome, IoPriority, IoTicket};
use grist_error::{GristError, Result};
use grist_extent::ExtentManager;
use grist_types::{
    BlockHeader, BlockId, ExtentIndex, Geometry, MAX_ACTIVE_EXTENTS, Tuning, TxnId,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, trace};

/// Extent manager handle shared with the rest of the serializer.
pub type SharedExtents = Arc<Mutex<dyn ExtentManager>>;

// ── Clock seam ──────────────────────────────────────────────────────────────

/// Time source for young-extent aging.
pub trait Clock: Send {
    fn now_micros(&self) -> u64;
}

/// Monotonic wall-clock time since manager construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Hand-advanced clock for tests: clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn advance(&self, delta_micros: u64) {
        self.micros.fetch_add(delta_micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_micros(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

// ── Completion routing ──────────────────────────────────────────────────────

/// What a submitted device operation was for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IoPurpose {
    UserWrite,
    UserRead,
    ReadAheadWindow { requested: u64, base: u64 },
    GcRead { slot: u32 },
}

/// A finished user-visible operation, returned from
/// [`DataBlockManager::on_io_complete`] for exactly-once delivery to the
/// original caller.
#[derive(Debug)]
pub enum UserCompletion {
    Write {
        ticket: IoTicket,
        result: Result<()>,
    },
    Read {
        ticket: IoTicket,
        result: Result<AlignedVec>,
    },
}

/// Observability snapshot of one extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentReport {
    pub offset: u64,
    pub state: ExtentState,
    pub garbage_blocks: u32,
    pub blocks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ManagerState {
    Unstarted,
    Ready,
    ShuttingDown,
    ShutDown,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) extents_allocated: u64,
    pub(crate) extents_reclaimed: u64,
    pub(crate) extents_gced: u64,
    pub(crate) blocks_written: u64,
}

// ── The manager ─────────────────────────────────────────────────────────────

pub struct DataBlockManager {
    pub(crate) geo: Geometry,
    pub(crate) tuning: Tuning,
    pub(crate) state: ManagerState,
    pub(crate) dbfile: Option<Arc<dyn DeviceFile>>,
    pub(crate) extents: SharedExtents,
    pub(crate) clock: Box<dyn Clock>,

    pub(crate) table: ExtentTable,
    /// Active-extent slots; `None` entries are refilled on demand, but only
    /// for slots below `num_active_extents`.
    pub(crate) active: Vec<Option<ExtentIndex>>,
    pub(crate) blocks_in_active: Vec<u32>,
    pub(crate) next_active: usize,
    pub(crate) young: VecDeque<ExtentIndex>,
    /// Entries created by `mark_live` and not yet claimed by
    /// `start_existing`.
    pub(crate) reconstructed: Vec<ExtentIndex>,
    pub(crate) pq: GcPq,
    pub(crate) gc: GcState,
    pub(crate) gauges: GcGauges,
    pub(crate) counters: Counters,

    pub(crate) inflight: HashMap<IoTicket, IoPurpose>,
    pub(crate) shutdown_cb: Option<Box<dyn FnOnce()>>,
}

impl std::fmt::Debug for DataBlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlockManager")
            .field("state", &self.state)
            .field("gc_step", &self.gc.step)
            .field("extents", &self.table.len())
            .finish_non_exhaustive()
    }
}

impl DataBlockManager {
    pub fn new(
        geo: Geometry,
        tuning: Tuning,
        extents: SharedExtents,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        tuning.validate()?;
        let staging = AlignedVec::new(
            usize::try_from(geo.extent_size())
                .map_err(|_| GristError::Format("extent size does not fit usize".to_owned()))?,
        );
        Ok(Self {
            geo,
            tuning,
            state: ManagerState::Unstarted,
            dbfile: None,
            extents,
            clock,
            table: ExtentTable::default(),
            active: vec![None; MAX_ACTIVE_EXTENTS],
            blocks_in_active: vec![0; MAX_ACTIVE_EXTENTS],
            next_active: 0,
            young: VecDeque::new(),
            reconstructed: Vec::new(),
            pq: GcPq::default(),
            gc: GcState::new(staging),
            gauges: GcGauges::default(),
            counters: Counters::default(),
            inflight: HashMap::new(),
            shutdown_cb: None,
        })
    }

    pub(crate) fn entry(&self, index: ExtentIndex) -> &ExtentEntry {
        self.table
            .get(index)
            .unwrap_or_else(|| panic!("no extent entry at index {index}"))
    }

    pub(crate) fn entry_mut(&mut self, index: ExtentIndex) -> &mut ExtentEntry {
        self.table
            .get_mut(index)
            .unwrap_or_else(|| panic!("no extent entry at index {index}"))
    }

    // ── Lifecycle: reconstruction and startup ───────────────────────────

    /// Enter reconstruction: all blocks are presumed garbage until
    /// [`Self::mark_live`] says otherwise.
    pub fn start_reconstruct(&mut self) {
        assert_eq!(self.state, ManagerState::Unstarted);
        self.gc.step = GcStep::Reconstruct;
    }

    /// Mark the block at `offset` live, creating its extent entry on first
    /// touch. Idempotent per offset; only legal during reconstruction.
    pub fn mark_live(&mut self, offset: u64) {
        if self.gc.step != GcStep::Reconstruct {
            error!(
                target: "grist::datablock",
                event = "mark_live_outside_reconstruct",
                offset
            );
            panic!("mark_live({offset}) outside reconstruction");
        }

        let index = self.geo.extent_index(offset);
        if self.table.get(index).is_none() {
            let entry = ExtentEntry::new_reconstructing(
                self.geo.extent_offset(index),
                self.geo.blocks_per_extent(),
                self.clock.now_micros(),
            );
            self.table.insert(index, entry);
            self.reconstructed.push(index);
        }
        let slot = self.geo.block_index(offset);
        self.entry_mut(index).g_array.clear(slot);
    }

    pub fn end_reconstruct(&mut self) {
        assert_eq!(self.state, ManagerState::Unstarted);
        self.set_gc_step(GcStep::Ready);
    }

    /// Finish startup against an existing device: re-adopt the active
    /// extents named by the metablock, then age every other reconstructed
    /// extent straight into the GC queue.
    pub fn start_existing(&mut self, file: Arc<dyn DeviceFile>, metablock: &DataBlockMetablock) {
        assert_eq!(self.state, ManagerState::Unstarted);
        self.dbfile = Some(file);

        let bpe = self.geo.blocks_per_extent();
        for i in 0..MAX_ACTIVE_EXTENTS {
            let Some((offset, blocks)) = metablock.slot(i) else {
                self.active[i] = None;
                continue;
            };
            let index = self.geo.extent_index(offset);
            // An active extent with no live blocks yet has no entry from
            // the scan; give it one.
            if self.table.get(index).is_none() {
                let now = self.clock.now_micros();
                self.table
                    .insert(index, ExtentEntry::new_reconstructing(offset, bpe, now));
            } else {
                self.reconstructed.retain(|r| *r != index);
            }

            let entry = self.entry_mut(index);
            assert_eq!(entry.state, ExtentState::Reconstructing);
            entry.state = ExtentState::Active;
            debug_assert!(
                blocks >= bpe || entry.g_array.get(blocks),
                "metablock fill level disagrees with liveness scan"
            );
            self.active[i] = Some(index);
            self.blocks_in_active[i] = blocks;
        }

        for index in std::mem::take(&mut self.reconstructed) {
            let entry = self.entry_mut(index);
            assert_eq!(entry.state, ExtentState::Reconstructing);
            entry.state = ExtentState::Old;
            let (offset, garbage) = (entry.offset, entry.g_array.count());
            self.pq.push(index, offset, garbage);
            self.gauges.old_total_blocks += u64::from(bpe);
            self.gauges.old_garbage_blocks += u64::from(garbage);
        }

        self.state = ManagerState::Ready;
        info!(
            target: "grist::datablock",
            event = "started",
            extents = self.table.len(),
            old = self.pq.len(),
        );
    }

    // ── Metablock handoff ───────────────────────────────────────────────

    /// Fill a metablock for a freshly created database: no active extents.
    pub fn prepare_initial_metablock(metablock: &mut DataBlockMetablock) {
        *metablock = DataBlockMetablock::default();
    }

    /// Record the current active-extent state into `metablock`.
    pub fn prepare_metablock(&self, metablock: &mut DataBlockMetablock) {
        assert!(
            self.state == ManagerState::Ready || self.state == ManagerState::ShuttingDown,
            "prepare_metablock before startup"
        );
        for i in 0..MAX_ACTIVE_EXTENTS {
            match self.active[i] {
                Some(index) => {
                    metablock.active_offset[i] = self.entry(index).offset;
                    metablock.blocks_in_active[i] = self.blocks_in_active[i];
                }
                None => {
                    metablock.active_offset[i] = grist_types::NULL_OFFSET;
                    metablock.blocks_in_active[i] = 0;
                }
            }
        }
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Hand out the next block offset, opening a fresh active extent when
    /// the current slot is empty and retiring it to the young queue when it
    /// fills.
    fn next_offset(&mut self) -> Result<u64> {
        let slot = self.next_active;
        let bpe = self.geo.blocks_per_extent();

        if self.active[slot].is_none() {
            let offset = self.extents.lock().gen_extent()?;
            let index = self.geo.extent_index(offset);
            let entry = ExtentEntry::new_active(offset, bpe, self.clock.now_micros());
            self.table.insert(index, entry);
            self.active[slot] = Some(index);
            self.blocks_in_active[slot] = 0;
            self.counters.extents_allocated += 1;
            trace!(
                target: "grist::datablock::alloc",
                event = "extent_activated",
                slot,
                offset
            );
        }

        let index = self.active[slot].expect("just ensured");
        let in_extent = self.blocks_in_active[slot];
        let block_len = u64::from(self.geo.block_size());
        let offset = {
            let entry = self.entry_mut(index);
            debug_assert_eq!(entry.state, ExtentState::Active);
            debug_assert!(in_extent < bpe);
            debug_assert!(
                entry.g_array.get(in_extent),
                "allocating a slot that is not garbage"
            );
            entry.g_array.clear(in_extent);
            entry.offset + u64::from(in_extent) * block_len
        };
        self.blocks_in_active[slot] = in_extent + 1;

        if self.blocks_in_active[slot] == bpe {
            let entry = self.entry_mut(index);
            debug_assert!(entry.g_array.count() < bpe);
            entry.state = ExtentState::Young;
            self.young.push_back(index);
            self.active[slot] = None;
            debug!(
                target: "grist::datablock::alloc",
                event = "extent_filled",
                slot,
                extent = index.0
            );
            self.mark_unyoung_entries();
        }

        // Advance round-robin. Slots at or above num_active_extents are
        // legacy slots from a larger previous configuration: keep visiting
        // them while they hold an active extent, stop refilling them once
        // drained.
        loop {
            self.next_active = (self.next_active + 1) % MAX_ACTIVE_EXTENTS;
            if (self.next_active as u32) < self.tuning.num_active_extents
                || self.active[self.next_active].is_some()
            {
                break;
            }
        }

        Ok(offset)
    }

    // ── Write / read ────────────────────────────────────────────────────

    /// Write one block. `block` is the full on-disk image (header region +
    /// payload) and must be exactly one block long.
    ///
    /// The offset is assigned synchronously and returned together with the
    /// ticket whose completion signals durability of the submission. When
    /// `txn_id` is given a fresh header is stamped; otherwise the block
    /// must already carry a header naming `block_id`.
    pub fn write(
        &mut self,
        mut block: AlignedVec,
        block_id: BlockId,
        txn_id: Option<TxnId>,
        priority: IoPriority,
    ) -> Result<(u64, IoTicket)> {
        let gc_rewrite =
            self.state == ManagerState::ShuttingDown && self.gc.step == GcStep::Write;
        if self.state != ManagerState::Ready && !gc_rewrite {
            error!(
                target: "grist::datablock",
                event = "write_rejected",
                state = ?self.state,
                block_id = block_id.0
            );
            panic!("write({block_id}) while not ready");
        }
        if block.len() != self.geo.block_size() as usize {
            return Err(GristError::Format(format!(
                "write buffer is {} bytes, block size is {}",
                block.len(),
                self.geo.block_size()
            )));
        }

        let offset = self.next_offset()?;
        self.counters.blocks_written += 1;

        match txn_id {
            Some(txn_id) => BlockHeader { block_id, txn_id }.write_to(block.as_mut_slice()),
            None => {
                let header =
                    BlockHeader::read_from(block.as_slice()).expect("block holds a header");
                if header.block_id != block_id {
                    error!(
                        target: "grist::datablock",
                        event = "header_mismatch",
                        expected = block_id.0,
                        found = header.block_id.0,
                        offset
                    );
                    panic!("block header names {} but caller says {block_id}", header.block_id);
                }
            }
        }

        let ticket = self
            .dbfile()
            .submit(IoOp::Write { offset, data: block }, priority)?;
        self.inflight.insert(ticket, IoPurpose::UserWrite);
        trace!(
            target: "grist::datablock",
            event = "block_write",
            block_id = block_id.0,
            offset
        );
        Ok((offset, ticket))
    }

    /// Read the block at `offset`. When the host wants read-ahead, a whole
    /// stripe around the offset is fetched and live neighbors are offered
    /// to the host; either way the requested block arrives through the
    /// returned ticket's [`UserCompletion::Read`].
    pub fn read(&mut self, host: &dyn Host, offset: u64, priority: IoPriority) -> Result<IoTicket> {
        assert_eq!(self.state, ManagerState::Ready, "read before startup");
        if !self.geo.is_block_aligned(offset) {
            return Err(GristError::Format(format!(
                "read offset {offset} is not block-aligned"
            )));
        }

        let block_len = self.geo.block_size() as usize;
        let ticket = if host.should_perform_read_ahead() {
            let window = read_ahead::window_for(&self.geo, self.tuning.max_read_ahead_blocks, offset);
            let ticket = self.dbfile().submit(
                IoOp::Read {
                    offset: window.base,
                    len: window.len,
                },
                priority,
            )?;
            self.inflight.insert(
                ticket,
                IoPurpose::ReadAheadWindow {
                    requested: offset,
                    base: window.base,
                },
            );
            ticket
        } else {
            let ticket = self.dbfile().submit(
                IoOp::Read {
                    offset,
                    len: block_len,
                },
                priority,
            )?;
            self.inflight.insert(ticket, IoPurpose::UserRead);
            ticket
        };
        Ok(ticket)
    }

    // ── Liveness accounting ─────────────────────────────────────────────

    /// Mark the block at `offset` garbage. The slot must currently be
    /// live. Fully-garbage non-active extents are destroyed on the spot;
    /// an extent mid-GC is instead handed back to the engine as a
    /// retirement notice.
    pub fn mark_garbage(&mut self, offset: u64) {
        let index = self.geo.extent_index(offset);
        let slot = self.geo.block_index(offset);
        let bpe = self.geo.blocks_per_extent();

        let (state, garbage) = {
            let entry = self.entry_mut(index);
            if entry.g_array.get(slot) {
                error!(
                    target: "grist::datablock",
                    event = "double_mark_garbage",
                    offset
                );
                panic!("mark_garbage({offset}) on a slot that is already garbage");
            }
            entry.g_array.set(slot);
            (entry.state, entry.g_array.count())
        };

        if state == ExtentState::Old {
            self.gauges.old_garbage_blocks += 1;
        }

        if garbage == bpe && state != ExtentState::Active {
            match state {
                ExtentState::Reconstructing => {
                    error!(
                        target: "grist::datablock",
                        event = "garbage_during_reconstruct",
                        offset
                    );
                    panic!("mark_garbage({offset}) during reconstruction");
                }
                ExtentState::Active => unreachable!(),
                ExtentState::Young => {
                    let at = self
                        .young
                        .iter()
                        .position(|&i| i == index)
                        .expect("young extent in young queue");
                    let _ = self.young.remove(at);
                }
                ExtentState::Old => {
                    self.pq.remove(index);
                    self.gauges.old_total_blocks -= u64::from(bpe);
                    self.gauges.old_garbage_blocks -= u64::from(bpe);
                }
                ExtentState::InGc => {
                    debug_assert_eq!(self.gc.current, Some(index));
                    self.gc.current = None;
                }
            }
            self.counters.extents_reclaimed += 1;
            self.destroy_entry(index);
        } else if state == ExtentState::Old {
            self.pq.update_key(index, garbage);
        }
    }

    /// Tear down a fully-garbage entry: out of the table, extent back to
    /// the extent manager. Callers must have removed it from every queue.
    fn destroy_entry(&mut self, index: ExtentIndex) {
        let entry = self
            .table
            .remove(index)
            .unwrap_or_else(|| panic!("destroying absent extent {index}"));
        debug_assert!(entry.g_array.is_full());
        self.extents.lock().release_extent(entry.offset);
        debug!(
            target: "grist::datablock",
            event = "extent_reclaimed",
            offset = entry.offset
        );
    }

    // ── Completion routing ──────────────────────────────────────────────

    /// Feed one device completion into the manager.
    ///
    /// GC-internal completions advance the state machine and return `None`;
    /// completions of user submissions come back as a [`UserCompletion`]
    /// for the driving loop to deliver, exactly once, to the original
    /// caller.
    pub fn on_io_complete(
        &mut self,
        host: &mut dyn Host,
        completion: IoCompletion,
    ) -> Option<UserCompletion> {
        let IoCompletion { ticket, result } = completion;
        let purpose = self
            .inflight
            .remove(&ticket)
            .unwrap_or_else(|| panic!("completion for unknown ticket {ticket:?}"));

        match purpose {
            IoPurpose::UserWrite => Some(UserCompletion::Write {
                ticket,
                result: result.map(|_| ()),
            }),
            IoPurpose::UserRead => Some(UserCompletion::Read {
                ticket,
                result: result.map(|outcome| match outcome {
                    IoOutcome::Read(buf) => buf,
                    IoOutcome::Write => panic!("read ticket completed as a write"),
                }),
            }),
            IoPurpose::ReadAheadWindow { requested, base } => {
                Some(self.finish_read_ahead(host, ticket, requested, base, result))
            }
            IoPurpose::GcRead { slot } => {
                self.finish_gc_read(host, slot, result);
                None
            }
        }
    }

    fn finish_read_ahead(
        &mut self,
        host: &mut dyn Host,
        ticket: IoTicket,
        requested: u64,
        base: u64,
        result: Result<IoOutcome>,
    ) -> UserCompletion {
        let window = match result {
            Ok(IoOutcome::Read(buf)) => buf,
            Ok(IoOutcome::Write) => panic!("read-ahead ticket completed as a write"),
            Err(e) => {
                return UserCompletion::Read {
                    ticket,
                    result: Err(e),
                };
            }
        };

        let block_len = self.geo.block_size() as usize;
        let mut requested_block = None;

        for (i, chunk) in window.as_slice().chunks_exact(block_len).enumerate() {
            let slot_offset = base + (i * block_len) as u64;

            if slot_offset == requested {
                let mut block = AlignedVec::new(block_len);
                block.as_mut_slice().copy_from_slice(chunk);
                requested_block = Some(block);
                continue;
            }

            // A neighbor is worth offering only if the LBA index still
            // places this block id at exactly this offset.
            let header = BlockHeader::read_from(chunk).expect("block holds a header");
            let id = header.block_id;
            if id.0 == 0 {
                continue;
            }
            let Some(lba_entry) = host.lba().block_offset(id) else {
                continue;
            };
            if lba_entry.deleted || lba_entry.offset != slot_offset {
                continue;
            }
            let recency = host.lba().block_recency(id);

            let mut block = AlignedVec::new(block_len);
            block.as_mut_slice().copy_from_slice(chunk);
            if host.offer_read_ahead_block(id, block, recency) {
                trace!(
                    target: "grist::datablock::read_ahead",
                    event = "block_offered",
                    block_id = id.0,
                    offset = slot_offset
                );
            }
        }

        let block = requested_block
            .unwrap_or_else(|| panic!("offset {requested} not covered by its read-ahead window"));
        UserCompletion::Read {
            ticket,
            result: Ok(block),
        }
    }

    // ── Shutdown and GC gating ──────────────────────────────────────────

    /// Begin shutdown. Returns true if the manager is already quiescent
    /// (callback is not invoked); otherwise the callback fires once the
    /// in-flight GC round finishes.
    pub fn shutdown(&mut self, cb: Box<dyn FnOnce()>) -> bool {
        assert_eq!(self.state, ManagerState::Ready);
        self.state = ManagerState::ShuttingDown;

        if self.gc.step == GcStep::Ready {
            self.shutdown_cb = None;
            self.actually_shutdown();
            true
        } else {
            debug!(
                target: "grist::datablock",
                event = "shutdown_deferred",
                gc_step = ?self.gc.step
            );
            self.shutdown_cb = Some(cb);
            false
        }
    }

    pub(crate) fn actually_shutdown(&mut self) {
        assert_eq!(self.state, ManagerState::ShuttingDown);
        self.state = ManagerState::ShutDown;

        assert!(
            self.reconstructed.is_empty(),
            "reconstructed extents left at shutdown"
        );
        debug_assert!(self.gc.current.is_none());

        // Entries hold live data; the extents stay owned by the region and
        // are not released to the free pool.
        for slot in 0..MAX_ACTIVE_EXTENTS {
            if let Some(index) = self.active[slot].take() {
                let _ = self.table.remove(index);
            }
        }
        while let Some(index) = self.young.pop_front() {
            let _ = self.table.remove(index);
        }
        while let Some(index) = self.pq.pop() {
            let _ = self.table.remove(index);
        }

        info!(target: "grist::datablock", event = "shut_down");
        if let Some(cb) = self.shutdown_cb.take() {
            cb();
        }
    }

    /// Stop starting new GC rounds. Returns true (and calls `cb`) if GC is
    /// already idle; otherwise `cb` fires when the engine next reaches
    /// `Ready`.
    pub fn disable_gc(&mut self, cb: Box<dyn FnOnce()>) -> bool {
        assert!(self.gc.disable_cb.is_none(), "disable_gc already pending");
        self.gc.stopped = true;

        if self.gc.step == GcStep::Ready || self.gc.step == GcStep::Reconstruct {
            cb();
            true
        } else {
            self.gc.disable_cb = Some(cb);
            false
        }
    }

    pub fn enable_gc(&mut self) {
        self.gc.stopped = false;
    }

    // ── Stats and introspection ─────────────────────────────────────────

    /// Garbage ratio over old extents, discounted by held free capacity.
    pub fn garbage_ratio(&self) -> f32 {
        let held = self.extents.lock().held_extents();
        policy::garbage_ratio(
            self.gauges.old_garbage_blocks,
            self.gauges.old_total_blocks,
            held,
            self.geo.blocks_per_extent(),
        )
    }

    /// Whether the write path should kick off a GC round now.
    pub fn wants_gc(&self) -> bool {
        policy::wants_gc_start(self.gc.stopped, self.garbage_ratio(), &self.tuning)
    }

    pub fn stats(&self) -> DataBlockStats {
        DataBlockStats {
            data_extents: self.table.len() as u64,
            extents_allocated: self.counters.extents_allocated,
            extents_reclaimed: self.counters.extents_reclaimed,
            extents_gced: self.counters.extents_gced,
            blocks_written: self.counters.blocks_written,
            old_total_blocks: self.gauges.old_total_blocks,
            old_garbage_blocks: self.gauges.old_garbage_blocks,
        }
    }

    pub fn gc_step(&self) -> GcStep {
        self.gc.step
    }

    pub fn gc_queue_len(&self) -> usize {
        self.pq.len()
    }

    pub fn young_len(&self) -> usize {
        self.young.len()
    }

    /// Offset of the extent currently being collected, if any.
    pub fn current_gc_extent(&self) -> Option<u64> {
        self.gc.current.map(|index| self.entry(index).offset)
    }

    /// Whether the block slot at `offset` is currently garbage, or `None`
    /// when no extent entry covers it.
    pub fn is_garbage(&self, offset: u64) -> Option<bool> {
        let index = self.geo.extent_index(offset);
        self.table
            .get(index)
            .map(|entry| entry.g_array.get(self.geo.block_index(offset)))
    }

    /// Per-extent state snapshot, ordered by offset.
    pub fn extent_report(&self) -> Vec<ExtentReport> {
        self.table
            .iter()
            .map(|(_, entry)| ExtentReport {
                offset: entry.offset,
                state: entry.state,
                garbage_blocks: entry.g_array.count(),
                blocks: entry.g_array.len(),
            })
            .collect()
    }

    /// Active slots as `(extent_offset, blocks_allocated)`.
    pub fn active_slots(&self) -> Vec<Option<(u64, u32)>> {
        (0..MAX_ACTIVE_EXTENTS)
            .map(|i| {
                self.active[i].map(|index| (self.entry(index).offset, self.blocks_in_active[i]))
            })
            .collect()
    }

    pub(crate) fn dbfile(&self) -> Arc<dyn DeviceFile> {
        Arc::clone(self.dbfile.as_ref().expect("manager not started"))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
