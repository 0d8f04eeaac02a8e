//! End-to-end manager tests: GC rounds against the simulated serializer,
//! reconstruction, metablock handoff, read-ahead delivery, and the
//! shutdown/disable races.

mod common;

use common::*;
use grist_datablock::{DataBlockMetablock, ExtentState, GcStep, UserCompletion};
use grist_device::{DeviceFile, IoPriority};
use grist_extent::ExtentManager;
use grist_types::{BlockId, BlockSize, ExtentSize, Geometry, Tuning};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn fill_extent(r: &mut Rig, first_id: u64) -> Vec<u64> {
    (first_id..first_id + 4).map(|id| write_block(r, id)).collect()
}

#[test]
fn write_then_read_returns_the_same_payload() {
    let mut r = rig(1, 50);
    start(&mut r);

    let offset = write_block(&mut r, 7);
    let done = drain(&mut r);
    assert!(matches!(
        done.as_slice(),
        [UserCompletion::Write { result: Ok(()), .. }]
    ));

    let ticket = r.mgr.read(&r.host, offset, IoPriority::default()).unwrap();
    let done = drain(&mut r);
    match done.as_slice() {
        [UserCompletion::Read { ticket: t, result: Ok(block) }] => {
            assert_eq!(*t, ticket);
            let expected = block_with_payload(512, 7);
            assert_eq!(block.as_slice()[16..], expected.as_slice()[16..]);
        }
        other => panic!("unexpected completions: {other:?}"),
    }
}

// Spec scenario: basic allocate-and-retire with B = 4 and one active slot.
#[test]
fn filling_and_retiring_an_extent_reclaims_it() {
    let mut r = rig(1, 0);
    start(&mut r);

    let offsets = fill_extent(&mut r, 1);
    assert_eq!(offsets, vec![0, 512, 1024, 1536]);
    // young_extent_max = 0: the filled extent ages straight to Old.
    let report = r.mgr.extent_report();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].state, ExtentState::Old);

    for id in 1..=4 {
        retire_block(&mut r, id);
    }
    assert_eq!(r.mgr.stats().extents_reclaimed, 1);
    assert!(r.mgr.extent_report().is_empty());
    assert_eq!(r.mgr.gc_queue_len(), 0);
    assert_eq!(r.extents.lock().held_extents(), 1);
}

// Spec scenario: with E1 at 3/4 garbage and E2 at 2/4, GC takes E1, moves
// its one live block, and leaves E2 alone.
#[test]
fn gc_picks_the_garbage_richest_victim() {
    let mut r = rig(1, 0);
    start(&mut r);

    fill_extent(&mut r, 1); // E1 at offset 0, ids 1..=4
    fill_extent(&mut r, 5); // E2 at offset 2048, ids 5..=8
    for id in [1, 2, 3, 5, 6] {
        retire_block(&mut r, id);
    }
    assert_eq!(r.mgr.stats().old_total_blocks, 8);
    assert_eq!(r.mgr.stats().old_garbage_blocks, 5);
    assert!(r.mgr.wants_gc());

    r.mgr.start_gc(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::Read);
    assert_eq!(r.mgr.current_gc_extent(), Some(0));
    drain(&mut r);

    // E1 is gone, its survivor rewritten into a fresh extent.
    assert_eq!(r.mgr.gc_step(), GcStep::Ready);
    assert_eq!(r.mgr.stats().extents_gced, 1);
    assert_eq!(r.mgr.stats().extents_reclaimed, 1);
    assert_eq!(r.host.gc_write_batches, vec![(1, IoPriority(8))]);

    let new_offset = r.host.lba.entries[&BlockId(4)].offset;
    assert_eq!(new_offset, 4096);
    let moved = r.device.snapshot(new_offset, 512);
    assert!(moved[16..].iter().all(|b| *b == 4));

    // E2 survives untouched with its two garbage blocks.
    let report = r.mgr.extent_report();
    let e2 = report.iter().find(|e| e.offset == 2048).unwrap();
    assert_eq!(e2.state, ExtentState::Old);
    assert_eq!(e2.garbage_blocks, 2);
    assert_eq!(r.mgr.stats().old_total_blocks, 4);
    assert_eq!(r.mgr.stats().old_garbage_blocks, 2);

    // The GC read went out on the nice account (the post-selection ratio
    // sits inside the hysteresis band).
    let gc_read = r
        .device
        .submissions()
        .into_iter()
        .find(|s| !s.is_write)
        .unwrap();
    assert_eq!(gc_read.offset, 1536);
    assert_eq!(gc_read.priority, IoPriority(8));
}

// Spec scenario: the last live block goes to garbage between the read
// phase and the rewrite; the engine must abandon the round.
#[test]
fn victim_retired_mid_flight_abandons_the_round() {
    let mut r = rig(1, 0);
    start(&mut r);

    fill_extent(&mut r, 1);
    for id in [1, 2, 3] {
        retire_block(&mut r, id);
    }

    r.mgr.start_gc(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::Read);

    // The read for block 4 is still in flight when the caller drops it.
    retire_block(&mut r, 4);
    assert_eq!(r.mgr.current_gc_extent(), None);
    assert_eq!(r.mgr.stats().extents_reclaimed, 1);

    drain(&mut r);
    assert_eq!(r.mgr.gc_step(), GcStep::Ready);
    assert!(r.host.gc_write_batches.is_empty());
    assert!(!r.host.mutex_locked);
    assert!(r.mgr.extent_report().is_empty());
}

#[test]
fn gc_waits_for_deferred_lock_grants_and_write_batches() {
    let mut r = rig(1, 0);
    start(&mut r);

    fill_extent(&mut r, 1);
    for id in [1, 2, 3] {
        retire_block(&mut r, id);
    }

    r.host.defer_mutex = true;
    r.host.defer_gc_writes = true;

    r.mgr.start_gc(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::ReadyLockAvailable);
    assert!(r.host.lock_pending);

    r.host.grant_lock();
    r.mgr.on_lock_available(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::Read);
    assert!(!r.host.mutex_locked);

    drain(&mut r);
    assert_eq!(r.mgr.gc_step(), GcStep::ReadLockAvailable);
    assert!(r.host.lock_pending);

    r.host.grant_lock();
    r.mgr.on_lock_available(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::Write);
    assert!(r.host.pending_gc.is_some());
    assert!(!r.host.mutex_locked);

    r.host.flush_gc_writes(&mut r.mgr);
    r.mgr.on_gc_write_done(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::Ready);
    assert_eq!(r.mgr.stats().extents_reclaimed, 1);
    drain(&mut r);
}

#[test]
fn gc_with_an_empty_queue_is_a_no_op() {
    let mut r = rig(1, 0);
    start(&mut r);

    r.mgr.start_gc(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::Ready);
    assert!(!r.host.mutex_locked);
    assert!(r.host.gc_write_batches.is_empty());
}

#[test]
fn shutdown_while_idle_completes_synchronously() {
    let mut r = rig(1, 0);
    start(&mut r);
    write_block(&mut r, 1);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let done = r.mgr.shutdown(Box::new(move || flag.store(true, Ordering::SeqCst)));
    assert!(done);
    // Synchronous shutdown does not invoke the callback.
    assert!(!fired.load(Ordering::SeqCst));
    assert!(r.mgr.extent_report().is_empty());
}

#[test]
fn shutdown_during_gc_finishes_the_round_then_calls_back() {
    let mut r = rig(1, 0);
    start(&mut r);

    fill_extent(&mut r, 1);
    for id in [1, 2, 3] {
        retire_block(&mut r, id);
    }
    r.mgr.start_gc(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::Read);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let done = r.mgr.shutdown(Box::new(move || flag.store(true, Ordering::SeqCst)));
    assert!(!done);
    assert!(!fired.load(Ordering::SeqCst));

    // The in-flight round runs to completion; its rewrite is the only
    // write allowed during shutdown.
    drain(&mut r);
    assert!(fired.load(Ordering::SeqCst));
    assert!(r.mgr.extent_report().is_empty());
    assert_eq!(r.mgr.gc_queue_len(), 0);
    assert_eq!(r.mgr.young_len(), 0);
}

#[test]
fn disable_gc_mid_round_calls_back_once_idle() {
    let mut r = rig(1, 0);
    start(&mut r);

    fill_extent(&mut r, 1);
    for id in [1, 2, 3] {
        retire_block(&mut r, id);
    }
    r.mgr.start_gc(&mut r.host);
    assert_eq!(r.mgr.gc_step(), GcStep::Read);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let done = r
        .mgr
        .disable_gc(Box::new(move || flag.store(true, Ordering::SeqCst)));
    assert!(!done);

    drain(&mut r);
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(r.mgr.gc_step(), GcStep::Ready);
    // The already-started round still ran.
    assert_eq!(r.host.gc_write_batches.len(), 1);

    // While stopped, a fresh garbage-heavy extent does not trigger GC.
    fill_extent(&mut r, 10);
    for id in [10, 11, 12] {
        retire_block(&mut r, id);
    }
    assert!(!r.mgr.wants_gc());
    r.mgr.start_gc(&mut r.host);
    assert_eq!(r.host.gc_write_batches.len(), 1);

    r.mgr.enable_gc();
    assert!(r.mgr.wants_gc());
}

#[test]
fn disable_gc_while_idle_calls_back_inline() {
    let mut r = rig(1, 0);
    start(&mut r);

    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    assert!(r.mgr.disable_gc(Box::new(move || flag.store(true, Ordering::SeqCst))));
    assert!(fired.load(Ordering::SeqCst));
}

// Spec scenario: reconstruction with one metablock-active extent and one
// scanned extent; prepare_metablock is a fixpoint of start_existing.
#[test]
fn reconstruction_restores_active_and_ages_the_rest() {
    let mut r = rig(1, 0);

    r.mgr.start_reconstruct();
    // Extent X (offset 0): two live blocks, named active by the metablock.
    r.mgr.mark_live(0);
    r.mgr.mark_live(512);
    // mark_live is idempotent per offset.
    r.mgr.mark_live(512);
    // Extent Y (offset 2048): two live blocks, not active.
    r.mgr.mark_live(2048);
    r.mgr.mark_live(2048 + 512);
    r.mgr.end_reconstruct();

    let mut mb = DataBlockMetablock::default();
    mb.active_offset[0] = 0;
    mb.blocks_in_active[0] = 2;
    let device: Arc<dyn DeviceFile> = r.device.clone();
    r.mgr.start_existing(device, &mb);

    let mut report = r.mgr.extent_report();
    report.sort_by_key(|e| e.offset);
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].offset, 0);
    assert_eq!(report[0].state, ExtentState::Active);
    assert_eq!(report[0].garbage_blocks, 2);
    assert_eq!(report[1].offset, 2048);
    assert_eq!(report[1].state, ExtentState::Old);
    assert_eq!(report[1].garbage_blocks, 2);
    assert_eq!(r.mgr.gc_queue_len(), 1);
    assert_eq!(r.mgr.stats().old_total_blocks, 4);
    assert_eq!(r.mgr.stats().old_garbage_blocks, 2);

    // Fixpoint: writing the metablock back out reproduces the input.
    let mut out = DataBlockMetablock::default();
    r.mgr.prepare_metablock(&mut out);
    assert_eq!(out, mb);

    // Allocation resumes exactly where the metablock said.
    let offset = write_block(&mut r, 9);
    assert_eq!(offset, 1024);
}

#[test]
fn legacy_active_slots_drain_but_are_not_refilled() {
    let mut r = rig(1, 50);

    r.mgr.start_reconstruct();
    // A leftover active extent in slot 1 from a run with num_active = 2.
    r.mgr.mark_live(4096);
    r.mgr.mark_live(4096 + 512);
    r.mgr.end_reconstruct();

    let mut mb = DataBlockMetablock::default();
    mb.active_offset[1] = 4096;
    mb.blocks_in_active[1] = 2;
    let device: Arc<dyn DeviceFile> = r.device.clone();
    r.mgr.start_existing(device, &mb);

    let offsets: Vec<u64> = (1..=7).map(|id| write_block(&mut r, id)).collect();
    // Round-robin alternates slot 0 and the legacy slot until the legacy
    // extent fills, then sticks to slot 0.
    assert_eq!(offsets, vec![0, 5120, 512, 5632, 1024, 1536, 2048]);

    let slots = r.mgr.active_slots();
    assert_eq!(slots[1], None);
    assert_eq!(r.mgr.young_len(), 2);
}

// Spec scenario: read-ahead offers exactly the neighbors the LBA index
// still vouches for.
#[test]
fn read_ahead_offers_live_neighbors_only() {
    let geo = {
        let bs = BlockSize::new(512).unwrap();
        Geometry::new(bs, ExtentSize::new(8192, bs).unwrap())
    };
    let tuning = Tuning {
        num_active_extents: 1,
        max_read_ahead_blocks: 4,
        ..Tuning::default()
    };
    let mut r = rig_with(geo, tuning);
    start(&mut r);
    r.host.read_ahead = true;

    // Window [0, 2048): requested block R, live B2, stale B3, empty B4.
    r.device.fill(0, &raw_block(512, 1, 1, 0xA1));
    r.device.fill(512, &raw_block(512, 2, 1, 0xB2));
    r.device.fill(1024, &raw_block(512, 3, 1, 0xB3));
    r.device.fill(1536, &raw_block(512, 0, 0, 0xB4));
    r.host.lba.entries.insert(
        BlockId(1),
        grist_datablock::LbaEntry { offset: 0, deleted: false },
    );
    r.host.lba.entries.insert(
        BlockId(2),
        grist_datablock::LbaEntry { offset: 512, deleted: false },
    );
    // B3's id now lives somewhere else entirely.
    r.host.lba.entries.insert(
        BlockId(3),
        grist_datablock::LbaEntry { offset: 4096, deleted: false },
    );
    r.host.lba.recency.insert(BlockId(2), 777);

    let ticket = r.mgr.read(&r.host, 0, IoPriority::default()).unwrap();
    let done = drain(&mut r);

    match done.as_slice() {
        [UserCompletion::Read { ticket: t, result: Ok(block) }] => {
            assert_eq!(*t, ticket);
            assert_eq!(block.as_slice(), raw_block(512, 1, 1, 0xA1).as_slice());
        }
        other => panic!("unexpected completions: {other:?}"),
    }

    // Exactly B2 was offered, with its recency.
    assert_eq!(r.host.offers.len(), 1);
    assert_eq!(r.host.offers[0].0, BlockId(2));
    assert_eq!(r.host.offers[0].2, 777);
    assert_eq!(r.host.offers[0].1, raw_block(512, 2, 1, 0xB2));

    // One window-sized submission, not a single block.
    let subs = r.device.submissions();
    assert_eq!(subs.last().unwrap().len, 2048);
    assert_eq!(subs.last().unwrap().offset, 0);
}

#[test]
fn read_ahead_window_stays_inside_its_extent() {
    let geo = {
        let bs = BlockSize::new(512).unwrap();
        Geometry::new(bs, ExtentSize::new(8192, bs).unwrap())
    };
    let tuning = Tuning {
        num_active_extents: 1,
        max_read_ahead_blocks: 4,
        ..Tuning::default()
    };
    let mut r = rig_with(geo, tuning);
    start(&mut r);
    r.host.read_ahead = true;

    // Read exactly at the second extent's boundary.
    r.mgr.read(&r.host, 8192, IoPriority::default()).unwrap();
    drain(&mut r);
    let subs = r.device.submissions();
    assert_eq!(subs.last().unwrap().offset, 8192);
    assert_eq!(subs.last().unwrap().len, 2048);

    // Read in the last stripe of extent 1.
    r.mgr
        .read(&r.host, 8192 + 15 * 512, IoPriority::default())
        .unwrap();
    drain(&mut r);
    let subs = r.device.submissions();
    assert_eq!(subs.last().unwrap().offset, 8192 + 8192 - 2048);
    assert_eq!(subs.last().unwrap().offset + subs.last().unwrap().len as u64, 2 * 8192);
}

#[test]
fn declined_read_ahead_offers_are_dropped() {
    let mut r = rig(1, 50);
    start(&mut r);
    r.host.read_ahead = true;
    r.host.accept_offers = false;

    r.device.fill(0, &raw_block(512, 1, 1, 0x11));
    r.device.fill(512, &raw_block(512, 2, 1, 0x22));
    r.host.lba.entries.insert(
        BlockId(2),
        grist_datablock::LbaEntry { offset: 512, deleted: false },
    );

    r.mgr.read(&r.host, 0, IoPriority::default()).unwrap();
    drain(&mut r);
    assert!(r.host.offers.is_empty());
}

#[test]
fn all_active_slots_round_robin_without_error() {
    let tuning = Tuning {
        num_active_extents: grist_types::MAX_ACTIVE_EXTENTS as u32,
        young_extent_max: 50,
        ..Tuning::default()
    };
    let mut r = rig_with(small_geometry(), tuning);
    start(&mut r);

    let offsets: Vec<u64> = (1..=128).map(|id| write_block(&mut r, id)).collect();
    assert_eq!(r.mgr.stats().extents_allocated, 64);
    assert_eq!(r.mgr.stats().blocks_written, 128);

    let mut unique = offsets.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), offsets.len());
}

#[test]
fn metablock_reflects_partial_active_extents() {
    let mut r = rig(1, 50);
    start(&mut r);

    write_block(&mut r, 1);
    write_block(&mut r, 2);

    let mut mb = DataBlockMetablock::default();
    r.mgr.prepare_metablock(&mut mb);
    assert_eq!(mb.slot(0), Some((0, 2)));
    assert_eq!(mb.slot(1), None);

    let mut initial = mb.clone();
    grist_datablock::DataBlockManager::prepare_initial_metablock(&mut initial);
    assert_eq!(initial, DataBlockMetablock::default());
}
