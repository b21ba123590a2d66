#![forbid(unsafe_code)]

//! Aligned buffers and the region allocators frames are carved from.

mod region;

pub use region::SharedRegion;

use std::ops::{Deref, DerefMut, Range};

use bytes::{Buf, BytesMut};

use crate::types::{MpoolError, Result};

/// Allocates `size` zeroed bytes whose first byte is aligned to `align`.
///
/// `align` must be a power of two. The returned buffer owns a slightly larger
/// allocation; dropping it (or passing it to [`aligned_free`]) releases it.
pub fn aligned_alloc(size: usize, align: usize) -> Result<BytesMut> {
    if !align.is_power_of_two() {
        return Err(MpoolError::Invalid("alignment must be a power of two"));
    }
    let total = size
        .checked_add(align)
        .ok_or(MpoolError::Invalid("aligned allocation overflow"))?;
    let mut buf = BytesMut::zeroed(total);
    let offset = buf.as_ptr().align_offset(align);
    if offset >= align {
        return Err(MpoolError::Invalid("cannot align allocation"));
    }
    buf.advance(offset);
    buf.truncate(size);
    Ok(buf)
}

/// Releases a buffer obtained from [`aligned_alloc`].
pub fn aligned_free(buf: BytesMut) {
    drop(buf);
}

/// Memory handed out by a [`RegionAllocator`].
///
/// Dereferences to the usable payload; any bookkeeping bytes around it belong
/// to the allocator.
#[derive(Default)]
pub struct RegionBlock {
    buf: BytesMut,
    payload: Range<usize>,
}

impl RegionBlock {
    fn new(buf: BytesMut, payload: Range<usize>) -> Self {
        Self { buf, payload }
    }

    /// Address of the first payload byte.
    pub fn addr(&self) -> usize {
        self.deref().as_ptr() as usize
    }

    /// Whether the block has no payload (a placeholder).
    pub fn is_placeholder(&self) -> bool {
        self.payload.is_empty()
    }

    /// Splits the payload into `frame_size` frames.
    ///
    /// The frames stay inside the block's memory; hand them back to
    /// [`FrameCarving::reassemble`] before freeing the block.
    pub fn carve(self, frame_size: usize) -> Result<(FrameCarving, Vec<BytesMut>)> {
        if frame_size == 0 || self.payload.len() % frame_size != 0 {
            return Err(MpoolError::Invalid("payload is not a multiple of the frame size"));
        }
        let RegionBlock { mut buf, payload } = self;
        let mut body = buf.split_off(payload.start);
        let suffix = body.split_off(payload.len());
        let count = payload.len() / frame_size;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(body.split_to(frame_size));
        }
        Ok((
            FrameCarving {
                prefix: buf,
                suffix,
                payload,
                frame_size,
                count,
            },
            frames,
        ))
    }

    fn into_parts(self) -> (BytesMut, Range<usize>) {
        (self.buf, self.payload)
    }
}

/// Remainder of a [`RegionBlock`] whose payload was carved into frames.
pub struct FrameCarving {
    prefix: BytesMut,
    suffix: BytesMut,
    payload: Range<usize>,
    frame_size: usize,
    count: usize,
}

impl FrameCarving {
    /// Number of frames carved.
    pub fn frame_count(&self) -> usize {
        self.count
    }

    /// Rejoins the frames, in carving order, into the original block.
    pub fn reassemble(self, frames: Vec<BytesMut>) -> Result<RegionBlock> {
        if frames.len() != self.count || frames.iter().any(|f| f.len() != self.frame_size) {
            return Err(MpoolError::Corruption("frame set does not match carving"));
        }
        let FrameCarving {
            mut prefix,
            suffix,
            payload,
            ..
        } = self;
        for frame in frames {
            prefix.unsplit(frame);
        }
        prefix.unsplit(suffix);
        Ok(RegionBlock::new(prefix, payload))
    }
}

impl Deref for RegionBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[self.payload.clone()]
    }
}

impl DerefMut for RegionBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        let range = self.payload.clone();
        &mut self.buf[range]
    }
}

/// Usage counters of a region.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct RegionUsage {
    /// Bytes the region may hand out, zero when unbounded.
    pub capacity: usize,
    /// Bytes currently allocated, bookkeeping included.
    pub in_use: usize,
    /// Live blocks.
    pub blocks: usize,
    /// Free extents, one when fully coalesced.
    pub free_extents: usize,
}

/// Source of pool memory.
///
/// The heap allocator serves ordinary processes; [`SharedRegion`] lays every
/// block out inside one reservation the way a mapped region would.
pub trait RegionAllocator: Send + Sync {
    /// Allocates a zeroed block of `size` bytes aligned to `align`.
    fn alloc(&self, size: usize, align: usize) -> Result<RegionBlock>;
    /// Returns a block, validating its bookkeeping.
    fn free(&self, block: RegionBlock) -> Result<()>;
    /// Current usage.
    fn usage(&self) -> RegionUsage;
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Allocator backed by the global heap.
#[derive(Default)]
pub struct HeapRegion {
    stats: parking_lot::Mutex<RegionUsage>,
}

impl HeapRegion {
    /// Creates an unbounded heap region.
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegionAllocator for HeapRegion {
    fn alloc(&self, size: usize, align: usize) -> Result<RegionBlock> {
        let buf = aligned_alloc(size, align)?;
        let mut stats = self.stats.lock();
        stats.in_use += size;
        stats.blocks += 1;
        Ok(RegionBlock::new(buf, 0..size))
    }

    fn free(&self, block: RegionBlock) -> Result<()> {
        if block.is_placeholder() {
            return Ok(());
        }
        let (buf, payload) = block.into_parts();
        let mut stats = self.stats.lock();
        stats.in_use = stats.in_use.saturating_sub(payload.len());
        stats.blocks = stats.blocks.saturating_sub(1);
        aligned_free(buf);
        Ok(())
    }

    fn usage(&self) -> RegionUsage {
        *self.stats.lock()
    }

    fn name(&self) -> &'static str {
        "heap"
    }
}
