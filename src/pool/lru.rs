#![forbid(unsafe_code)]

//! Replacement priorities.
//!
//! A global counter advances on every unpin; a released buffer's priority is
//! the counter value shifted by its priority class. Lower priorities are
//! evicted first. When the counter climbs into the top quarter of its range
//! every priority is rebased downward by a fixed decrement so relative order
//! survives without overflow.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::options::CachePriority;

/// Counter value at which priorities are rebased.
pub(crate) const REBASE_AT: u32 = u32::MAX - u32::MAX / 4;
/// Amount subtracted from the counter and every priority on rebase.
pub(crate) const BASE_DECREMENT: u32 = u32::MAX / 2;

pub(crate) struct Tick {
    pub now: u32,
    pub rebase: bool,
}

pub(crate) struct LruClock {
    counter: AtomicU32,
    pool_pages: u32,
    rebase_at: u32,
    decrement: u32,
    rebasing: AtomicBool,
}

impl LruClock {
    pub fn new(pool_pages: usize) -> Self {
        Self::with_limits(pool_pages, REBASE_AT, BASE_DECREMENT)
    }

    pub fn with_limits(pool_pages: usize, rebase_at: u32, decrement: u32) -> Self {
        Self {
            counter: AtomicU32::new(0),
            pool_pages: u32::try_from(pool_pages).unwrap_or(u32::MAX),
            rebase_at,
            decrement: decrement.min(rebase_at),
            rebasing: AtomicBool::new(false),
        }
    }

    pub fn now(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Advances the counter; at most one caller at a time is told to rebase.
    pub fn tick(&self) -> Tick {
        let now = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let rebase = now >= self.rebase_at
            && self
                .rebasing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok();
        Tick { now, rebase }
    }

    /// Lowers the counter by the decrement and returns the amount to subtract
    /// from every stored priority. Pair with [`LruClock::finish_rebase`].
    pub fn rebase_counter(&self) -> u32 {
        let dec = self.decrement;
        // Concurrent ticks only add, so the value never drops below `rebase_at - dec`.
        self.counter.fetch_sub(dec, Ordering::Relaxed);
        dec
    }

    pub fn finish_rebase(&self) {
        self.rebasing.store(false, Ordering::Release);
    }

    fn quarter(&self) -> u32 {
        (self.pool_pages / 4).max(1)
    }

    /// Priority of a buffer released at `now` with the given class.
    pub fn priority(&self, class: CachePriority, now: u32, dirty: bool) -> u32 {
        let base = match class {
            CachePriority::VeryLow => return 0,
            CachePriority::Low => now.saturating_sub(self.quarter()),
            CachePriority::Default => now,
            CachePriority::High => now.saturating_add(self.quarter()),
            CachePriority::VeryHigh => now.saturating_add(self.pool_pages),
        };
        if dirty {
            base.saturating_add(self.quarter())
        } else {
            base
        }
    }

    /// Priority floor applied when a buffer turns dirty.
    pub fn dirty_boost(&self) -> u32 {
        self.now().saturating_add(self.quarter())
    }
}
