//! The GC engine: a multi-step state machine that picks the garbage-richest
//! old extent, stages its live blocks, and rewrites them through the host
//! under the serializer's main write mutex.
//!
//! Progress is driven by four triggers: an external [`start_gc`] tick, the
//! host's lock grant ([`on_lock_available`]), GC read completions, and the
//! host's rewrite-batch completion ([`on_gc_write_done`]). Each trigger runs
//! the `run_again` loop until the engine either finishes a round or parks
//! waiting for the next trigger.
//!
//! Between any suspension point and the next step, `mark_garbage` may retire
//! the victim entirely; the engine observes that as `current == None` and
//! abandons the round. The staging buffer is owned by the engine, never the
//! entry, so a retired victim leaves no dangling reads.
//!
//! [`start_gc`]: DataBlockManager::start_gc
//! [`on_lock_available`]: DataBlockManager::on_lock_available
//! [`on_gc_write_done`]: DataBlockManager::on_gc_write_done

use crate::entry::ExtentState;
use crate::hooks::{GcWrite, Host};
use crate::{DataBlockManager, IoPurpose, ManagerState, policy};
use grist_device::{AlignedVec, IoOp, IoOutcome, IoPriority};
use grist_error::Result;
use grist_types::{BlockHeader, ExtentIndex};
use tracing::{debug, error};

/// Engine step. `Reconstruct` only at startup; the working loop cycles
/// through the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcStep {
    /// Idle between rounds.
    Ready,
    /// Waiting for the main mutex before victim selection.
    ReadyLockAvailable,
    /// Live-block reads in flight.
    Read,
    /// Waiting for the main mutex before the rewrite batch.
    ReadLockAvailable,
    /// Rewrite batch handed to the host.
    Write,
    /// Startup liveness reconstruction.
    Reconstruct,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct GcGauges {
    pub(crate) old_total_blocks: u64,
    pub(crate) old_garbage_blocks: u64,
}

pub(crate) struct GcState {
    pub(crate) step: GcStep,
    /// The victim, while one is in flight. Cleared by `mark_garbage` if the
    /// extent empties out from under the engine.
    pub(crate) current: Option<ExtentIndex>,
    /// Outstanding GC reads for the current victim.
    pub(crate) refcount: u32,
    /// Extent-sized staging buffer the live blocks are read into. Reused
    /// across rounds.
    pub(crate) blocks: AlignedVec,
    /// Set by `disable_gc`: no new round starts while true.
    pub(crate) stopped: bool,
    pub(crate) disable_cb: Option<Box<dyn FnOnce()>>,
}

impl GcState {
    pub(crate) fn new(blocks: AlignedVec) -> Self {
        Self {
            step: GcStep::Reconstruct,
            current: None,
            refcount: 0,
            blocks,
            stopped: false,
            disable_cb: None,
        }
    }
}

impl std::fmt::Debug for GcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcState")
            .field("step", &self.step)
            .field("current", &self.current)
            .field("refcount", &self.refcount)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl DataBlockManager {
    /// External GC tick. A no-op unless the engine is idle.
    pub fn start_gc(&mut self, host: &mut dyn Host) {
        if self.gc.step == GcStep::Ready {
            self.run_gc(host);
        }
    }

    /// The host granted the main mutex requested in a `*LockAvailable`
    /// step.
    pub fn on_lock_available(&mut self, host: &mut dyn Host) {
        assert!(
            matches!(
                self.gc.step,
                GcStep::ReadyLockAvailable | GcStep::ReadLockAvailable
            ),
            "lock grant in step {:?}",
            self.gc.step
        );
        self.run_gc(host);
    }

    /// The host finished an asynchronous [`Host::write_gcs`] batch.
    pub fn on_gc_write_done(&mut self, host: &mut dyn Host) {
        assert_eq!(self.gc.step, GcStep::Write, "stray GC write completion");
        self.run_gc(host);
    }

    pub(crate) fn run_gc(&mut self, host: &mut dyn Host) {
        let mut run_again = true;
        while run_again {
            run_again = false;
            match self.gc.step {
                GcStep::Ready => {
                    if self.pq.is_empty() || !self.should_keep_gcing() {
                        return;
                    }
                    self.gc.step = GcStep::ReadyLockAvailable;
                    if host.request_main_mutex() {
                        run_again = true;
                    }
                }

                GcStep::ReadyLockAvailable => {
                    host.release_main_mutex();

                    // The world may have changed while we waited for the
                    // mutex; re-check before committing to a victim.
                    if self.pq.is_empty() || !self.should_keep_gcing() {
                        self.set_gc_step(GcStep::Ready);
                        return;
                    }

                    self.counters.extents_gced += 1;
                    let index = self.pq.pop().expect("queue checked non-empty");
                    let bpe = self.geo.blocks_per_extent();
                    let (offset, garbage, live_slots) = {
                        let entry = self.entry_mut(index);
                        debug_assert_eq!(entry.state, ExtentState::Old);
                        entry.state = ExtentState::InGc;
                        let garbage = entry.g_array.count();
                        let live: Vec<u32> =
                            (0..bpe).filter(|s| !entry.g_array.get(*s)).collect();
                        (entry.offset, garbage, live)
                    };
                    self.gc.current = Some(index);
                    self.gauges.old_garbage_blocks -= u64::from(garbage);
                    self.gauges.old_total_blocks -= u64::from(bpe);
                    debug!(
                        target: "grist::datablock::gc",
                        event = "victim_selected",
                        extent = index.0,
                        offset,
                        garbage,
                        live = live_slots.len()
                    );

                    let priority = self.gc_io_priority();
                    let device = self.dbfile();
                    let block_len = u64::from(self.geo.block_size());
                    debug_assert_eq!(self.gc.refcount, 0);
                    for slot in live_slots {
                        let ticket = device
                            .submit(
                                IoOp::Read {
                                    offset: offset + u64::from(slot) * block_len,
                                    len: block_len as usize,
                                },
                                priority,
                            )
                            .unwrap_or_else(|e| panic!("GC read submission failed: {e}"));
                        self.inflight.insert(ticket, IoPurpose::GcRead { slot });
                        self.gc.refcount += 1;
                    }
                    assert!(self.gc.refcount > 0, "GC victim has no live blocks");
                    self.gc.step = GcStep::Read;
                    // Completions drive the next transition.
                }

                GcStep::Read => {
                    self.gc.refcount -= 1;
                    if self.gc.refcount > 0 {
                        break;
                    }
                    self.gc.step = GcStep::ReadLockAvailable;
                    // The mutex is released inside the host's rewrite call.
                    if host.request_main_mutex() {
                        run_again = true;
                    }
                }

                GcStep::ReadLockAvailable => {
                    // mark_garbage retired the victim while the reads were
                    // in flight; nothing left to rewrite.
                    let Some(index) = self.gc.current else {
                        debug!(
                            target: "grist::datablock::gc",
                            event = "victim_retired_mid_flight"
                        );
                        host.release_main_mutex();
                        self.set_gc_step(GcStep::Ready);
                        break;
                    };

                    let writes = self.collect_gc_writes(index);
                    self.gc.step = GcStep::Write;
                    let priority = self.gc_io_priority();
                    let done = host.write_gcs(self, writes, priority);
                    if done {
                        run_again = true;
                    }
                }

                GcStep::Write => {
                    // Re-run the age policy here so a steady write load
                    // cannot park everything in the young queue and starve
                    // the engine onto the same victim forever.
                    self.mark_unyoung_entries();

                    if let Some(index) = self.gc.current {
                        let live =
                            self.geo.blocks_per_extent() - self.entry(index).g_array.count();
                        error!(
                            target: "grist::datablock::gc",
                            event = "victim_survived_rewrites",
                            extent = index.0,
                            live
                        );
                        panic!("{live} live blocks left on the extent after GC rewrites");
                    }
                    debug_assert_eq!(self.gc.refcount, 0);
                    self.set_gc_step(GcStep::Ready);

                    if self.state == ManagerState::ShuttingDown {
                        self.actually_shutdown();
                        return;
                    }
                    run_again = true;
                }

                GcStep::Reconstruct => {
                    error!(target: "grist::datablock::gc", event = "gc_during_reconstruct");
                    panic!("GC stepped during reconstruction");
                }
            }
        }
    }

    /// Copy one completed GC read into the staging buffer and advance.
    pub(crate) fn finish_gc_read(
        &mut self,
        host: &mut dyn Host,
        slot: u32,
        result: Result<IoOutcome>,
    ) {
        assert_eq!(self.gc.step, GcStep::Read, "stray GC read completion");
        let buf = match result {
            Ok(IoOutcome::Read(buf)) => buf,
            Ok(IoOutcome::Write) => panic!("GC read ticket completed as a write"),
            Err(e) => {
                error!(target: "grist::datablock::gc", event = "gc_read_failed", %e);
                panic!("GC read failed: {e}");
            }
        };
        let block_len = self.geo.block_size() as usize;
        let start = slot as usize * block_len;
        self.gc.blocks.as_mut_slice()[start..start + block_len].copy_from_slice(buf.as_slice());
        self.run_gc(host);
    }

    /// Build the rewrite batch for the victim, re-checking the garbage
    /// bitmap: anything marked garbage since the reads were issued is
    /// skipped rather than clobbering newer data.
    fn collect_gc_writes(&self, index: ExtentIndex) -> Vec<GcWrite> {
        let entry = self.entry(index);
        let block_len = self.geo.block_size() as usize;
        let bpe = self.geo.blocks_per_extent();
        let mut writes = Vec::with_capacity((bpe - entry.g_array.count()) as usize);

        for slot in 0..bpe {
            if entry.g_array.get(slot) {
                continue;
            }
            let start = slot as usize * block_len;
            let chunk = &self.gc.blocks.as_slice()[start..start + block_len];
            let header = BlockHeader::read_from(chunk).expect("block holds a header");
            assert!(header.block_id.0 != 0, "live GC block without an id");
            let mut block = AlignedVec::new(block_len);
            block.as_mut_slice().copy_from_slice(chunk);
            writes.push(GcWrite {
                block_id: header.block_id,
                block,
            });
        }
        writes
    }

    // ── Age policy ──────────────────────────────────────────────────────

    /// Drain the young queue while it is over-long or its head is over-age,
    /// pushing each drained extent into the GC priority queue.
    pub(crate) fn mark_unyoung_entries(&mut self) {
        while self.young.len() > self.tuning.young_extent_max {
            self.remove_last_unyoung_entry();
        }

        let now = self.clock.now_micros();
        while let Some(&head) = self.young.front() {
            let age = now.saturating_sub(self.entry(head).timestamp_micros);
            if age > self.tuning.young_extent_timelimit_micros {
                self.remove_last_unyoung_entry();
            } else {
                break;
            }
        }
    }

    fn remove_last_unyoung_entry(&mut self) {
        let index = self.young.pop_front().expect("young queue non-empty");
        let bpe = self.geo.blocks_per_extent();
        let (offset, garbage) = {
            let entry = self.entry_mut(index);
            debug_assert_eq!(entry.state, ExtentState::Young);
            entry.state = ExtentState::Old;
            (entry.offset, entry.g_array.count())
        };
        self.pq.push(index, offset, garbage);
        self.gauges.old_total_blocks += u64::from(bpe);
        self.gauges.old_garbage_blocks += u64::from(garbage);
        debug!(
            target: "grist::datablock::gc",
            event = "extent_aged",
            extent = index.0,
            garbage
        );
    }

    // ── Policy glue ─────────────────────────────────────────────────────

    pub(crate) fn set_gc_step(&mut self, step: GcStep) {
        self.gc.step = step;
        if step == GcStep::Ready
            && let Some(cb) = self.gc.disable_cb.take()
        {
            cb();
        }
    }

    fn should_keep_gcing(&self) -> bool {
        policy::should_keep_gcing(self.gc.stopped, self.garbage_ratio(), &self.tuning)
    }

    fn gc_io_priority(&self) -> IoPriority {
        policy::gc_io_priority(self.garbage_ratio(), &self.tuning)
    }
}
