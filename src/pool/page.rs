#![forbid(unsafe_code)]

use std::fmt;

use super::bh::{BufferState, PageRead};
use super::PoolShared;
use crate::options::CachePriority;
use crate::types::{BhId, PageId};

/// Options for [`Pool::pin`](super::Pool::pin).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PinFlags {
    /// A page at or beyond end of file is created zero-filled instead of
    /// failing with a short read.
    pub create: bool,
}

impl PinFlags {
    /// Flags that create missing pages.
    pub fn create() -> Self {
        Self { create: true }
    }
}

/// A page held in the pool.
///
/// While pinned the buffer is never evicted, so [`frame_addr`](Self::frame_addr)
/// stays stable. Dropping the handle unpins.
pub struct PinnedPage<'a> {
    pool: &'a PoolShared,
    id: BhId,
    pid: PageId,
    released: bool,
}

impl<'a> PinnedPage<'a> {
    pub(crate) fn new(pool: &'a PoolShared, id: BhId, pid: PageId) -> Self {
        Self {
            pool,
            id,
            pid,
            released: false,
        }
    }

    /// Identity of the pinned page.
    pub fn page_id(&self) -> PageId {
        self.pid
    }

    /// Buffer header slot holding the page.
    pub fn bh(&self) -> BhId {
        self.id
    }

    /// Takes the page latch shared and returns the frame.
    pub fn read(&self) -> PageRead<'_> {
        self.pool.bh(self.id).read()
    }

    /// Address of the frame.
    pub fn frame_addr(&self) -> usize {
        self.read().as_ptr() as usize
    }

    /// Current buffer state.
    pub fn state(&self) -> BufferState {
        self.pool.bh(self.id).meta.lock().state
    }

    /// Replacement class applied when the page is released.
    pub fn set_priority(&self, priority: CachePriority) {
        self.pool.bh(self.id).meta.lock().class = priority;
    }

    /// Makes the page the first eviction candidate once released.
    pub fn set_discardable(&self) {
        self.pool.bh(self.id).meta.lock().discardable = true;
    }

    /// Releases the pin.
    pub fn unpin(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.unpin(self.id);
        }
    }
}

impl fmt::Debug for PinnedPage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedPage")
            .field("page", &self.pid)
            .field("bh", &self.id)
            .finish()
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
