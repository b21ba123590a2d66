#![forbid(unsafe_code)]

//! First-fit allocator over a single reservation.
//!
//! Block layout: `[padding][header][payload][guard]`. The header stores the
//! payload size, the padding length and a magic word; the guard is a fixed
//! byte pattern checked when the block is freed. Free extents are kept sorted
//! by offset and merged with their neighbours on free.

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, error};

use super::{aligned_alloc, RegionAllocator, RegionBlock, RegionUsage};
use crate::types::{MpoolError, Result, CACHE_LINE};

const HEADER_LEN: usize = 16;
const GUARD_LEN: usize = 16;
const GUARD_BYTE: u8 = 0xFD;
const BLOCK_MAGIC: u32 = 0x4D50_4C42;
const MIN_SPLIT: usize = HEADER_LEN + GUARD_LEN + CACHE_LINE;

struct Extent {
    offset: usize,
    buf: BytesMut,
}

struct RegionState {
    free: Vec<Extent>,
    usage: RegionUsage,
}

/// Region that serves every block from one up-front reservation.
pub struct SharedRegion {
    base: usize,
    capacity: usize,
    state: Mutex<RegionState>,
}

impl SharedRegion {
    /// Reserves `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < MIN_SPLIT {
            return Err(MpoolError::RegionFull(capacity));
        }
        let arena = aligned_alloc(capacity, CACHE_LINE)?;
        let base = arena.as_ptr() as usize;
        debug!(capacity, "region.shared.reserve");
        Ok(Self {
            base,
            capacity,
            state: Mutex::new(RegionState {
                free: vec![Extent {
                    offset: 0,
                    buf: arena,
                }],
                usage: RegionUsage {
                    capacity,
                    in_use: 0,
                    blocks: 0,
                    free_extents: 1,
                },
            }),
        })
    }

    fn offset_of(&self, buf: &BytesMut) -> Result<usize> {
        let addr = buf.as_ptr() as usize;
        if addr < self.base || addr + buf.len() > self.base + self.capacity {
            return Err(MpoolError::Invalid("block does not belong to this region"));
        }
        Ok(addr - self.base)
    }

    fn layout(&self, extent: &Extent, size: usize, align: usize) -> Option<(usize, usize)> {
        let addr = self.base + extent.offset + HEADER_LEN;
        let padding = (align - addr % align) % align;
        let needed = padding + HEADER_LEN + size + GUARD_LEN;
        (extent.buf.len() >= needed).then_some((padding, needed))
    }

    fn write_bookkeeping(block: &mut BytesMut, padding: usize, size: usize) {
        let header = &mut block[padding..padding + HEADER_LEN];
        header[0..8].copy_from_slice(&(size as u64).to_le_bytes());
        header[8..12].copy_from_slice(&(padding as u32).to_le_bytes());
        header[12..16].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        let guard_start = padding + HEADER_LEN + size;
        block[guard_start..guard_start + GUARD_LEN].fill(GUARD_BYTE);
    }

    fn check_bookkeeping(block: &RegionBlock) -> Result<()> {
        let raw = &block.buf;
        let start = block.payload.start;
        if start < HEADER_LEN {
            return Err(MpoolError::Corruption("region block header missing"));
        }
        let header = &raw[start - HEADER_LEN..start];
        let size = u64::from_le_bytes(header[0..8].try_into().unwrap_or([0; 8])) as usize;
        let magic = u32::from_le_bytes(header[12..16].try_into().unwrap_or([0; 4]));
        if magic != BLOCK_MAGIC || size != block.payload.len() {
            error!(size, magic, "region.shared.header_damaged");
            return Err(MpoolError::Corruption("region block header damaged"));
        }
        let guard = &raw[block.payload.end..block.payload.end + GUARD_LEN];
        if guard.iter().any(|&b| b != GUARD_BYTE) {
            error!(size, "region.shared.guard_damaged");
            return Err(MpoolError::Corruption("guard byte damaged"));
        }
        Ok(())
    }

    fn coalesce(free: &mut Vec<Extent>, idx: usize) {
        if idx + 1 < free.len() && free[idx].offset + free[idx].buf.len() == free[idx + 1].offset {
            let next = free.remove(idx + 1);
            free[idx].buf.unsplit(next.buf);
        }
        if idx > 0 && free[idx - 1].offset + free[idx - 1].buf.len() == free[idx].offset {
            let cur = free.remove(idx);
            free[idx - 1].buf.unsplit(cur.buf);
        }
    }
}

impl RegionAllocator for SharedRegion {
    fn alloc(&self, size: usize, align: usize) -> Result<RegionBlock> {
        if !align.is_power_of_two() {
            return Err(MpoolError::Invalid("alignment must be a power of two"));
        }
        let mut state = self.state.lock();
        let found = state
            .free
            .iter()
            .enumerate()
            .find_map(|(idx, extent)| self.layout(extent, size, align).map(|l| (idx, l)));
        let Some((idx, (padding, needed))) = found else {
            debug!(size, align, "region.shared.exhausted");
            return Err(MpoolError::RegionFull(size));
        };
        let extent = &mut state.free[idx];
        let mut raw = if extent.buf.len() - needed < MIN_SPLIT {
            let whole = std::mem::take(&mut extent.buf);
            state.free.remove(idx);
            whole
        } else {
            extent.offset += needed;
            extent.buf.split_to(needed)
        };
        raw.fill(0);
        Self::write_bookkeeping(&mut raw, padding, size);
        state.usage.in_use += raw.len();
        state.usage.blocks += 1;
        state.usage.free_extents = state.free.len();
        let start = padding + HEADER_LEN;
        Ok(RegionBlock::new(raw, start..start + size))
    }

    fn free(&self, block: RegionBlock) -> Result<()> {
        if block.is_placeholder() {
            return Ok(());
        }
        Self::check_bookkeeping(&block)?;
        let (raw, _) = block.into_parts();
        let offset = self.offset_of(&raw)?;
        let len = raw.len();
        let mut state = self.state.lock();
        let idx = state.free.partition_point(|e| e.offset < offset);
        let overlaps_prev =
            idx > 0 && state.free[idx - 1].offset + state.free[idx - 1].buf.len() > offset;
        let overlaps_next = idx < state.free.len() && offset + len > state.free[idx].offset;
        if overlaps_prev || overlaps_next {
            return Err(MpoolError::Corruption("region double free"));
        }
        state.free.insert(idx, Extent { offset, buf: raw });
        Self::coalesce(&mut state.free, idx);
        state.usage.in_use = state.usage.in_use.saturating_sub(len);
        state.usage.blocks = state.usage.blocks.saturating_sub(1);
        state.usage.free_extents = state.free.len();
        Ok(())
    }

    fn usage(&self) -> RegionUsage {
        self.state.lock().usage
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}
