#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::admission::AdmissionStats;
use crate::primitives::log::LogStats;
use crate::primitives::queue::QueueStats;

/// Snapshot of pool activity counters and gauges.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PoolStats {
    /// Pins satisfied by a resident page.
    pub hits: u64,
    /// Pins that had to bring the page in.
    pub misses: u64,
    /// Buffers reclaimed for another page.
    pub evictions: u64,
    /// Dirty buffers handed to the IO queue by eviction or the cleaner.
    pub dirty_writebacks: u64,
    /// Dirty buffers of dead files dropped without a write.
    pub dead_drops: u64,
    /// Completed page reads.
    pub reads: u64,
    /// Pages created beyond end of file without a read.
    pub creates: u64,
    /// Completed page writes.
    pub writes: u64,
    /// Failed page reads.
    pub read_errors: u64,
    /// Failed page writes.
    pub write_errors: u64,
    /// Pins that waited for an in-flight IO.
    pub io_waits: u64,
    /// Frame allocation attempts that found nothing and slept.
    pub alloc_retries: u64,
    /// Completed checkpoints.
    pub checkpoints: u64,
    /// Checkpoints skipped below their thresholds.
    pub checkpoints_skipped: u64,
    /// Frames in the pool.
    pub pool_pages: usize,
    /// Frames on the free list.
    pub free_frames: usize,
    /// Buffers in the flush list.
    pub dirty_pages: usize,
    /// IO queue traffic.
    pub queue: QueueStats,
    /// Log traffic.
    pub log: LogStats,
    /// Admission control traffic.
    pub admission: AdmissionStats,
}

#[derive(Default)]
pub(crate) struct PoolCounters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub dirty_writebacks: AtomicU64,
    pub dead_drops: AtomicU64,
    pub reads: AtomicU64,
    pub creates: AtomicU64,
    pub writes: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
    pub io_waits: AtomicU64,
    pub alloc_retries: AtomicU64,
    pub checkpoints: AtomicU64,
    pub checkpoints_skipped: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PoolCounters {
    /// Fills the counter fields of `stats`.
    pub fn fill(&self, stats: &mut PoolStats) {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        stats.hits = load(&self.hits);
        stats.misses = load(&self.misses);
        stats.evictions = load(&self.evictions);
        stats.dirty_writebacks = load(&self.dirty_writebacks);
        stats.dead_drops = load(&self.dead_drops);
        stats.reads = load(&self.reads);
        stats.creates = load(&self.creates);
        stats.writes = load(&self.writes);
        stats.read_errors = load(&self.read_errors);
        stats.write_errors = load(&self.write_errors);
        stats.io_waits = load(&self.io_waits);
        stats.alloc_retries = load(&self.alloc_retries);
        stats.checkpoints = load(&self.checkpoints);
        stats.checkpoints_skipped = load(&self.checkpoints_skipped);
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Acquire)
    }
}
