#![forbid(unsafe_code)]

//! Page identity to buffer header index.
//!
//! Open chaining with one ranked mutex per bucket. Each bucket also carries a
//! lower bound on the replacement priority of its entries so the eviction
//! scan can skip buckets without locking them.

use std::sync::atomic::{AtomicU32, Ordering};

use xxhash_rust::xxh64::xxh64;

use crate::primitives::concurrency::{LockRank, RankedGuard, RankedMutex};
use crate::types::{BhId, PageId};

const HASH_SEED: u64 = 0x6d70_6f6f_6c5f_6874;

pub(crate) struct Bucket {
    chain: RankedMutex<Vec<(PageId, BhId)>>,
    hint: AtomicU32,
}

impl Bucket {
    fn new() -> Self {
        Self {
            chain: RankedMutex::new(LockRank::HashBucket, Vec::new()),
            hint: AtomicU32::new(u32::MAX),
        }
    }

    pub fn lock(&self) -> Chain<'_> {
        Chain {
            entries: self.chain.lock(),
            hint: &self.hint,
        }
    }

    /// Lower bound on the priority of any entry; `u32::MAX` when empty.
    pub fn hint(&self) -> u32 {
        self.hint.load(Ordering::Relaxed)
    }

    pub fn lower_hint(&self, priority: u32) {
        self.hint.fetch_min(priority, Ordering::Relaxed);
    }

    pub fn reset_hint(&self, value: u32) {
        self.hint.store(value, Ordering::Relaxed);
    }
}

/// Locked bucket chain.
pub(crate) struct Chain<'a> {
    entries: RankedGuard<'a, Vec<(PageId, BhId)>>,
    hint: &'a AtomicU32,
}

impl Chain<'_> {
    pub fn lookup(&self, pid: PageId) -> Option<BhId> {
        self.entries
            .iter()
            .find_map(|&(p, id)| (p == pid).then_some(id))
    }

    /// Links `id` under `pid`; the caller has checked for a duplicate.
    pub fn insert(&mut self, pid: PageId, id: BhId, priority: u32) {
        debug_assert!(self.lookup(pid).is_none(), "duplicate page {pid} in hash");
        self.entries.push((pid, id));
        self.hint.fetch_min(priority, Ordering::Relaxed);
    }

    pub fn remove(&mut self, pid: PageId, id: BhId) -> bool {
        match self.entries.iter().position(|&e| e == (pid, id)) {
            Some(pos) => {
                self.entries.swap_remove(pos);
                if self.entries.is_empty() {
                    self.hint.store(u32::MAX, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[(PageId, BhId)] {
        &self.entries
    }

    pub fn set_hint(&self, priority: u32) {
        self.hint.store(priority, Ordering::Relaxed);
    }
}

pub(crate) struct HashIndex {
    buckets: Box<[Bucket]>,
    mask: usize,
}

impl HashIndex {
    /// Sizes the table to the next power of two at or above `pool_pages`.
    pub fn new(pool_pages: usize) -> Self {
        let count = pool_pages.max(1).next_power_of_two();
        Self {
            buckets: (0..count).map(|_| Bucket::new()).collect(),
            mask: count - 1,
        }
    }

    /// Bucket index; both the tablespace and the page number feed the hash so
    /// page 0 of distinct files spreads across buckets.
    pub fn bucket_of(&self, pid: PageId) -> usize {
        (xxh64(&pid.to_be_bytes(), HASH_SEED) as usize) & self.mask
    }

    pub fn lock(&self, pid: PageId) -> Chain<'_> {
        self.buckets[self.bucket_of(pid)].lock()
    }

    pub fn bucket(&self, idx: usize) -> &Bucket {
        &self.buckets[idx]
    }

    pub fn bucket_for(&self, pid: PageId) -> &Bucket {
        &self.buckets[self.bucket_of(pid)]
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}
