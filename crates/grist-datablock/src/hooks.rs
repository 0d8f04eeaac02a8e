//! Collaborator interfaces: the enclosing serializer ([`Host`]) and the
//! logical block address index ([`LbaIndex`]).
//!
//! The manager never owns these; every operation that needs them takes them
//! as arguments, so the serializer keeps a single mutable manager and hands
//! it back in during callbacks (notably [`Host::write_gcs`]).

use crate::DataBlockManager;
use grist_device::{AlignedVec, IoPriority};
use grist_types::BlockId;

/// One block the GC engine wants rewritten: the full on-disk image
/// (header + payload) of a still-live block from the victim extent.
#[derive(Debug)]
pub struct GcWrite {
    pub block_id: BlockId,
    pub block: AlignedVec,
}

/// Where the LBA index currently places a logical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaEntry {
    pub offset: u64,
    pub deleted: bool,
}

/// Authoritative mapping of logical block id to physical placement.
pub trait LbaIndex {
    /// Current placement, or `None` if the id is unknown.
    fn block_offset(&self, id: BlockId) -> Option<LbaEntry>;

    /// Recency timestamp for the block, surfaced with read-ahead offers.
    fn block_recency(&self, id: BlockId) -> u64;
}

/// The enclosing serializer, as seen from the data block manager.
pub trait Host {
    /// Ask for the serializer's main write mutex.
    ///
    /// Returns true if the mutex was acquired inline; otherwise the host
    /// must call [`DataBlockManager::on_lock_available`] once it is.
    fn request_main_mutex(&mut self) -> bool;

    /// Release the main write mutex (held by the GC engine).
    fn release_main_mutex(&mut self);

    /// Rewrite a batch of live blocks on behalf of GC.
    ///
    /// The host must release the main mutex before returning, and must
    /// perform each rewrite through `manager.write(...)` followed by
    /// `manager.mark_garbage(old_offset)`. When the whole batch completes
    /// within this call, return true; the engine's post-write bookkeeping
    /// relies on those `mark_garbage` calls having happened synchronously.
    /// Otherwise return false and call
    /// [`DataBlockManager::on_gc_write_done`] when the batch finishes.
    fn write_gcs(
        &mut self,
        manager: &mut DataBlockManager,
        writes: Vec<GcWrite>,
        priority: IoPriority,
    ) -> bool;

    /// Whether point reads should pull in a read-ahead window.
    fn should_perform_read_ahead(&self) -> bool;

    /// Offer an opportunistically-read block. Returns false if the host has
    /// no interest; the buffer is dropped in that case.
    fn offer_read_ahead_block(
        &mut self,
        id: BlockId,
        block: AlignedVec,
        recency_micros: u64,
    ) -> bool;

    /// The LBA index, used to filter read-ahead candidates.
    fn lba(&self) -> &dyn LbaIndex;
}
