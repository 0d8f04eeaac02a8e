#![forbid(unsafe_code)]
//! Device layer: aligned buffers and the asynchronous block-file interface.
//!
//! The manager talks to storage through [`DeviceFile`]: positioned reads and
//! writes are *submitted* with an I/O priority and complete later through a
//! completion queue the driving loop drains. This models both a synchronous
//! backend (each submission executes inline and its completion is queued
//! immediately) and queue-based backends, while letting tests hold
//! completions back to exercise the suspension points between submission
//! and completion.

use grist_error::{GristError, Result};
use grist_types::DEVICE_BLOCK_SIZE;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

// ── Aligned buffers ─────────────────────────────────────────────────────────

/// Owned byte buffer whose exposed slice starts on a `DEVICE_BLOCK_SIZE`
/// boundary, as required for direct-I/O submission.
///
/// Stays fully safe by over-allocating and exposing an aligned subslice.
#[derive(Debug, Clone)]
pub struct AlignedVec {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedVec {
    /// Allocate a zeroed buffer of `size` bytes.
    #[must_use]
    pub fn new(size: usize) -> Self {
        if size == 0 {
            return Self {
                storage: Vec::new(),
                start: 0,
                len: 0,
            };
        }

        let storage = vec![0_u8; size + DEVICE_BLOCK_SIZE - 1];
        let base = storage.as_ptr() as usize;
        let misalignment = base & (DEVICE_BLOCK_SIZE - 1);
        let start = if misalignment == 0 {
            0
        } else {
            DEVICE_BLOCK_SIZE - misalignment
        };
        debug_assert!(start + size <= storage.len());
        Self {
            storage,
            start,
            len: size,
        }
    }

    /// Build an aligned buffer holding a copy of `bytes` (no copy if the
    /// allocation happens to be aligned already).
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return Self::new(0);
        }
        if (bytes.as_ptr() as usize) % DEVICE_BLOCK_SIZE == 0 {
            let len = bytes.len();
            return Self {
                storage: bytes,
                start: 0,
                len,
            };
        }
        let mut aligned = Self::new(bytes.len());
        aligned.as_mut_slice().copy_from_slice(&bytes);
        aligned
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let start = self.start;
        let end = start + self.len;
        &mut self.storage[start..end]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        if self.len == 0 {
            return Vec::new();
        }
        if self.start == 0 && self.len == self.storage.len() {
            return self.storage;
        }
        self.storage[self.start..self.start + self.len].to_vec()
    }
}

impl PartialEq for AlignedVec {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for AlignedVec {}

// ── Submissions and completions ─────────────────────────────────────────────

/// Device scheduling priority for a submission. Higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IoPriority(pub u32);

impl Default for IoPriority {
    fn default() -> Self {
        Self(16)
    }
}

/// Identity of one submitted operation, echoed back in its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoTicket(pub u64);

/// A single positioned operation.
#[derive(Debug)]
pub enum IoOp {
    /// Read `len` bytes starting at `offset`.
    Read { offset: u64, len: usize },
    /// Write all of `data` starting at `offset`.
    Write { offset: u64, data: AlignedVec },
}

/// Successful outcome of a completed operation.
#[derive(Debug)]
pub enum IoOutcome {
    Read(AlignedVec),
    Write,
}

/// A finished operation, delivered exactly once via [`DeviceFile::poll_completions`].
#[derive(Debug)]
pub struct IoCompletion {
    pub ticket: IoTicket,
    pub result: Result<IoOutcome>,
}

/// Monotonic per-device I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Asynchronous positioned-I/O file.
///
/// `submit` enqueues an operation and returns its ticket; the operation's
/// completion appears in `poll_completions` exactly once. Submission errors
/// (malformed requests, out-of-bounds ranges) are reported synchronously;
/// I/O errors travel in the completion.
pub trait DeviceFile: Send + Sync {
    fn submit(&self, op: IoOp, priority: IoPriority) -> Result<IoTicket>;

    /// Drain every completion that is ready, oldest first.
    fn poll_completions(&self) -> Vec<IoCompletion>;

    /// Total device length in bytes.
    fn len_bytes(&self) -> u64;

    fn stats(&self) -> DeviceStats;
}

fn check_bounds(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(u64::try_from(len).map_err(|_| {
            GristError::Format("I/O length overflows u64".to_owned())
        })?)
        .ok_or_else(|| GristError::Format("I/O range overflows u64".to_owned()))?;
    if end > device_len {
        return Err(GristError::Format(format!(
            "I/O out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

// ── File-backed device ──────────────────────────────────────────────────────

/// File-backed device using `pread`/`pwrite` style positioned I/O.
///
/// Operations execute inline at submission; their completions are queued
/// for the next `poll_completions` so the caller-visible contract is the
/// same as for a genuinely asynchronous backend.
pub struct FileDevice {
    file: Arc<File>,
    len: u64,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    done: VecDeque<IoCompletion>,
    stats: DeviceStats,
}

impl QueueState {
    fn take_ticket(&mut self) -> IoTicket {
        let ticket = IoTicket(self.next_ticket);
        self.next_ticket += 1;
        ticket
    }
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            state: Mutex::new(QueueState::default()),
        })
    }
}

impl std::fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDevice")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl DeviceFile for FileDevice {
    fn submit(&self, op: IoOp, priority: IoPriority) -> Result<IoTicket> {
        let mut state = self.state.lock();
        let ticket = state.take_ticket();

        let result = match op {
            IoOp::Read { offset, len } => {
                check_bounds(offset, len, self.len)?;
                trace!(
                    target: "grist::device",
                    event = "read_submit",
                    offset,
                    len,
                    priority = priority.0
                );
                let mut buf = AlignedVec::new(len);
                match self.file.read_exact_at(buf.as_mut_slice(), offset) {
                    Ok(()) => {
                        state.stats.reads += 1;
                        state.stats.bytes_read += len as u64;
                        Ok(IoOutcome::Read(buf))
                    }
                    Err(e) => Err(GristError::Io(e)),
                }
            }
            IoOp::Write { offset, data } => {
                check_bounds(offset, data.len(), self.len)?;
                trace!(
                    target: "grist::device",
                    event = "write_submit",
                    offset,
                    len = data.len(),
                    priority = priority.0
                );
                match self.file.write_all_at(data.as_slice(), offset) {
                    Ok(()) => {
                        state.stats.writes += 1;
                        state.stats.bytes_written += data.len() as u64;
                        Ok(IoOutcome::Write)
                    }
                    Err(e) => Err(GristError::Io(e)),
                }
            }
        };

        state.done.push_back(IoCompletion { ticket, result });
        Ok(ticket)
    }

    fn poll_completions(&self) -> Vec<IoCompletion> {
        self.state.lock().done.drain(..).collect()
    }

    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn stats(&self) -> DeviceStats {
        self.state.lock().stats
    }
}

// ── In-memory device ────────────────────────────────────────────────────────

/// One submission parked in a [`MemDevice`] until the test pumps it.
struct PendingOp {
    ticket: IoTicket,
    op: IoOp,
}

/// Record of a submission, for assertions on offsets and priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub ticket: IoTicket,
    pub offset: u64,
    pub len: usize,
    pub is_write: bool,
    pub priority: IoPriority,
}

struct MemState {
    data: Vec<u8>,
    queue: QueueState,
    pending: VecDeque<PendingOp>,
    log: Vec<SubmissionRecord>,
}

/// In-memory device with explicitly pumped completions.
///
/// Submissions park in a pending queue; `pump_one`/`pump_all` execute them
/// against the backing memory and move them to the completion queue. Tests
/// interleave other manager calls between submission and pump to exercise
/// the cooperative suspension points.
pub struct MemDevice {
    state: Mutex<MemState>,
}

impl MemDevice {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(MemState {
                data: vec![0_u8; size],
                queue: QueueState::default(),
                pending: VecDeque::new(),
                log: Vec::new(),
            }),
        }
    }

    /// Execute the oldest pending operation. Returns false if none was
    /// pending.
    pub fn pump_one(&self) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.pop_front() else {
            return false;
        };
        Self::execute(&mut state, pending);
        true
    }

    /// Execute every pending operation in submission order.
    pub fn pump_all(&self) {
        while self.pump_one() {}
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// All submissions seen so far, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().log.clone()
    }

    /// Poke raw bytes into the backing memory (test setup).
    pub fn fill(&self, offset: u64, bytes: &[u8]) {
        let mut state = self.state.lock();
        let start = usize::try_from(offset).expect("offset fits usize");
        state.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Copy raw bytes out of the backing memory (test inspection).
    #[must_use]
    pub fn snapshot(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state.lock();
        let start = usize::try_from(offset).expect("offset fits usize");
        state.data[start..start + len].to_vec()
    }

    fn execute(state: &mut MemState, pending: PendingOp) {
        let PendingOp { ticket, op } = pending;
        let result = match op {
            IoOp::Read { offset, len } => {
                let start = offset as usize;
                let mut buf = AlignedVec::new(len);
                buf.as_mut_slice().copy_from_slice(&state.data[start..start + len]);
                state.queue.stats.reads += 1;
                state.queue.stats.bytes_read += len as u64;
                Ok(IoOutcome::Read(buf))
            }
            IoOp::Write { offset, data } => {
                let start = offset as usize;
                let end = start + data.len();
                state.data[start..end].copy_from_slice(data.as_slice());
                state.queue.stats.writes += 1;
                state.queue.stats.bytes_written += data.len() as u64;
                Ok(IoOutcome::Write)
            }
        };
        state.queue.done.push_back(IoCompletion { ticket, result });
    }
}

impl std::fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemDevice")
            .field("len", &state.data.len())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

impl DeviceFile for MemDevice {
    fn submit(&self, op: IoOp, priority: IoPriority) -> Result<IoTicket> {
        let mut state = self.state.lock();
        let device_len = state.data.len() as u64;
        let (offset, len, is_write) = match &op {
            IoOp::Read { offset, len } => (*offset, *len, false),
            IoOp::Write { offset, data } => (*offset, data.len(), true),
        };
        check_bounds(offset, len, device_len)?;

        let ticket = state.queue.take_ticket();
        state.log.push(SubmissionRecord {
            ticket,
            offset,
            len,
            is_write,
            priority,
        });
        state.pending.push_back(PendingOp { ticket, op });
        Ok(ticket)
    }

    fn poll_completions(&self) -> Vec<IoCompletion> {
        self.state.lock().queue.done.drain(..).collect()
    }

    fn len_bytes(&self) -> u64 {
        self.state.lock().data.len() as u64
    }

    fn stats(&self) -> DeviceStats {
        self.state.lock().queue.stats
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
