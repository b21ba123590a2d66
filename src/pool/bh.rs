#![forbid(unsafe_code)]

//! Buffer headers.
//!
//! Every frame of the pool is owned by exactly one [`BufferHeader`] for the
//! pool's lifetime. The header pairs the frame latch with a small state block
//! guarded by a leaf mutex; the hash index, the flush list and the IO queue
//! refer to headers by [`BhId`] only.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::file::MpoolFile;
use crate::options::CachePriority;
use crate::primitives::concurrency::{
    LockRank, RankToken, RwLatch, RwLatchReadGuard, RwLatchWriteGuard,
};
use crate::types::{BhId, Lsn, MpoolError, PageId, Result};

/// Lifecycle state of a buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferState {
    /// On the free list, no page assigned.
    Empty,
    /// A read into the frame is in flight.
    Reading,
    /// Frame matches the page on disk.
    Clean,
    /// Frame holds logged changes not yet written.
    Dirty,
    /// A write of the frame is in flight.
    Writing,
    /// An IO error invalidated the frame; it is never written again.
    Discarded,
}

impl BufferState {
    /// Whether the frame content may be used.
    pub fn is_valid(self) -> bool {
        matches!(self, BufferState::Clean | BufferState::Dirty)
    }

    /// Whether an IO is in flight.
    pub fn in_io(self) -> bool {
        matches!(self, BufferState::Reading | BufferState::Writing)
    }
}

pub(crate) struct BhMeta {
    pub pid: Option<PageId>,
    pub file: Option<Arc<MpoolFile>>,
    pub state: BufferState,
    pub pin: u16,
    pub io_waiters: u16,
    pub priority: u32,
    pub touched: u32,
    pub class: CachePriority,
    pub oldest: Lsn,
    pub newest: Lsn,
    pub discardable: bool,
    pub io_error: Option<MpoolError>,
}

impl BhMeta {
    fn empty() -> Self {
        Self {
            pid: None,
            file: None,
            state: BufferState::Empty,
            pin: 0,
            io_waiters: 0,
            priority: 0,
            touched: 0,
            class: CachePriority::Default,
            oldest: Lsn::ZERO,
            newest: Lsn::ZERO,
            discardable: false,
            io_error: None,
        }
    }

    /// Assigns a page to an empty buffer; the caller holds the only pin.
    pub fn assign(&mut self, pid: PageId, file: Arc<MpoolFile>, state: BufferState) {
        debug_assert_eq!(self.state, BufferState::Empty);
        self.class = file.priority();
        file.block_acquired();
        self.pid = Some(pid);
        self.file = Some(file);
        self.state = state;
        self.pin = 1;
        self.io_waiters = 0;
        self.oldest = Lsn::ZERO;
        self.newest = Lsn::ZERO;
        self.discardable = false;
        self.io_error = None;
    }

    /// Returns the buffer to the empty state and hands back its file record.
    pub fn reset(&mut self) -> Option<Arc<MpoolFile>> {
        let file = self.file.take();
        *self = BhMeta::empty();
        file
    }

    pub fn add_pin(&mut self) -> Result<()> {
        self.pin = self
            .pin
            .checked_add(1)
            .ok_or(MpoolError::Invalid("pin count overflow"))?;
        Ok(())
    }

    /// Whether eviction or a flusher may start a write of this buffer.
    pub fn writable_now(&self) -> bool {
        self.state == BufferState::Dirty && self.pin == 0
    }

}

pub(crate) struct BufferHeader {
    pub id: BhId,
    latch: RwLatch<BytesMut>,
    pub meta: Mutex<BhMeta>,
    pub io_done: Condvar,
}

impl BufferHeader {
    pub fn new(id: BhId, frame: BytesMut) -> Self {
        Self {
            id,
            latch: RwLatch::new(frame),
            meta: Mutex::new(BhMeta::empty()),
            io_done: Condvar::new(),
        }
    }

    /// Shared page latch.
    pub fn read(&self) -> PageRead<'_> {
        let rank = RankToken::acquire(LockRank::PageLatch);
        PageRead {
            guard: self.latch.read(),
            _rank: rank,
        }
    }

    /// Exclusive page latch.
    pub fn write(&self) -> PageWrite<'_> {
        let rank = RankToken::acquire(LockRank::PageLatch);
        PageWrite {
            guard: self.latch.write(),
            _rank: rank,
        }
    }

    #[cfg(test)]
    pub fn latch_state(&self) -> crate::primitives::concurrency::LatchSnapshot {
        crate::primitives::concurrency::latch_snapshot(&self.latch)
    }

    /// Blocks until no IO is in flight on this buffer.
    pub fn wait_io(&self, meta: &mut MutexGuard<'_, BhMeta>) {
        while meta.state.in_io() {
            self.io_done.wait(meta);
        }
    }

    /// Moves the frame out; only used once the pool is quiescent.
    pub fn take_frame(&self) -> BytesMut {
        std::mem::take(&mut *self.latch.write())
    }
}

/// Shared latch on a page frame.
pub struct PageRead<'a> {
    guard: RwLatchReadGuard<'a, BytesMut>,
    _rank: RankToken,
}

impl Deref for PageRead<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive latch on a page frame.
pub struct PageWrite<'a> {
    guard: RwLatchWriteGuard<'a, BytesMut>,
    _rank: RankToken,
}

impl Deref for PageWrite<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageWrite<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}
