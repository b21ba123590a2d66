#![forbid(unsafe_code)]

//! Frame reservation and the free list.

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::debug;

use crate::primitives::alloc::{FrameCarving, RegionAllocator, RegionUsage};
use crate::types::{BhId, MpoolError, Result, CACHE_LINE};

pub(crate) struct FrameArena {
    region: Box<dyn RegionAllocator>,
    carving: Mutex<Option<FrameCarving>>,
    free: Mutex<Vec<BhId>>,
}

impl FrameArena {
    /// Reserves `count` frames of `frame_size` bytes from one region block.
    ///
    /// Frames are aligned to the frame size and to the cache line.
    pub fn reserve(
        region: Box<dyn RegionAllocator>,
        count: usize,
        frame_size: usize,
    ) -> Result<(Self, Vec<BytesMut>)> {
        let total = count
            .checked_mul(frame_size)
            .ok_or(MpoolError::Invalid("pool size overflows"))?;
        let align = frame_size.max(CACHE_LINE);
        let block = region.alloc(total, align)?;
        debug!(
            region = region.name(),
            count,
            frame_size,
            addr = block.addr(),
            "pool.frames.reserve"
        );
        let (carving, frames) = block.carve(frame_size)?;
        // Pop order hands out low frames first.
        let free = (0..count as u32).rev().map(BhId).collect();
        Ok((
            Self {
                region,
                carving: Mutex::new(Some(carving)),
                free: Mutex::new(free),
            },
            frames,
        ))
    }

    pub fn pop_free(&self) -> Option<BhId> {
        self.free.lock().pop()
    }

    pub fn push_free(&self, id: BhId) {
        self.free.lock().push(id);
    }

    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn usage(&self) -> RegionUsage {
        self.region.usage()
    }

    /// Rejoins every frame and returns the block to the region, which checks
    /// its bookkeeping.
    pub fn release(&self, frames: Vec<BytesMut>) -> Result<()> {
        let Some(carving) = self.carving.lock().take() else {
            return Ok(());
        };
        let block = carving.reassemble(frames)?;
        self.region.free(block)?;
        debug!(region = self.region.name(), "pool.frames.release");
        Ok(())
    }
}
