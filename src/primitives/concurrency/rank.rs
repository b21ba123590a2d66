#![forbid(unsafe_code)]

//! Lock ranks and the per-thread ordering checker.
//!
//! Every blocking acquisition of a ranked lock must be strictly above every
//! rank the thread already holds. Page latches may be stacked (siblings).
//! Try-locks skip the check but are still recorded, so a later blocking
//! acquisition is validated against them. Release builds compile the
//! tracking away.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

/// Position of a lock in the global acquisition order, lowest first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum LockRank {
    /// Checkpoint serialization mutex.
    Checkpoint = 10,
    /// Per-page latch; several may be held together.
    PageLatch = 20,
    /// Hash bucket chain mutex.
    HashBucket = 30,
    /// Log buffer and LSN mutex.
    Log = 40,
    /// Flush-list ordering mutex.
    FlushOrder = 50,
}

impl LockRank {
    /// Whether two locks of this rank may be held at once.
    pub fn allows_siblings(self) -> bool {
        matches!(self, LockRank::PageLatch)
    }

    /// Short lowercase name for diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            LockRank::Checkpoint => "checkpoint",
            LockRank::PageLatch => "page_latch",
            LockRank::HashBucket => "hash_bucket",
            LockRank::Log => "log",
            LockRank::FlushOrder => "flush_order",
        }
    }
}

#[cfg(debug_assertions)]
mod tracker {
    use std::cell::RefCell;

    use smallvec::SmallVec;

    use super::LockRank;

    thread_local! {
        static HELD: RefCell<SmallVec<[LockRank; 8]>> = RefCell::new(SmallVec::new());
    }

    pub fn check(rank: LockRank) {
        HELD.with(|held| {
            let held = held.borrow();
            if let Some(&top) = held.iter().max() {
                let ok = top < rank || (top == rank && rank.allows_siblings());
                if !ok {
                    panic!(
                        "lock order violation: acquiring {} while holding {} (held: {:?})",
                        rank.as_str(),
                        top.as_str(),
                        &held[..]
                    );
                }
            }
        });
    }

    pub fn push(rank: LockRank) {
        HELD.with(|held| held.borrow_mut().push(rank));
    }

    pub fn pop(rank: LockRank) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == rank) {
                held.remove(pos);
            }
        });
    }

    pub fn held() -> Vec<LockRank> {
        HELD.with(|held| held.borrow().to_vec())
    }
}

#[cfg(not(debug_assertions))]
mod tracker {
    use super::LockRank;

    #[inline]
    pub fn check(_rank: LockRank) {}

    #[inline]
    pub fn push(_rank: LockRank) {}

    #[inline]
    pub fn pop(_rank: LockRank) {}

    pub fn held() -> Vec<LockRank> {
        Vec::new()
    }
}

/// Ranks held by the calling thread, in acquisition order.
///
/// Always empty in release builds.
pub fn held_ranks() -> Vec<LockRank> {
    tracker::held()
}

/// Proof that the calling thread holds a lock of `rank`.
///
/// Dropping the token removes the rank from the thread's held set. Tokens are
/// not `Send`: a rank is released by the thread that took it.
#[derive(Debug)]
pub struct RankToken {
    rank: LockRank,
    _not_send: PhantomData<*const ()>,
}

impl RankToken {
    /// Validates and records a blocking acquisition of `rank`.
    ///
    /// Call before blocking on the lock itself.
    pub fn acquire(rank: LockRank) -> Self {
        tracker::check(rank);
        tracker::push(rank);
        Self {
            rank,
            _not_send: PhantomData,
        }
    }

    /// Records a successful try-lock without validating order.
    pub fn acquired_without_wait(rank: LockRank) -> Self {
        tracker::push(rank);
        Self {
            rank,
            _not_send: PhantomData,
        }
    }

    /// Rank this token stands for.
    pub fn rank(&self) -> LockRank {
        self.rank
    }
}

impl Drop for RankToken {
    fn drop(&mut self) {
        tracker::pop(self.rank);
    }
}

/// A `parking_lot` mutex that participates in rank checking.
pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    /// Wraps `value` in a mutex of the given rank.
    pub fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    /// Rank of this mutex.
    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Blocks until the mutex is held.
    pub fn lock(&self) -> RankedGuard<'_, T> {
        let token = RankToken::acquire(self.rank);
        let guard = self.inner.lock();
        RankedGuard {
            guard,
            _token: token,
        }
    }

    /// Takes the mutex only if it is free; exempt from rank checking.
    pub fn try_lock(&self) -> Option<RankedGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        Some(RankedGuard {
            guard,
            _token: RankToken::acquired_without_wait(self.rank),
        })
    }

    /// Mutable access without locking; requires exclusive ownership.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Guard for [`RankedMutex`].
pub struct RankedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _token: RankToken,
}

impl<T> Deref for RankedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
