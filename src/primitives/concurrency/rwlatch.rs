#![allow(unsafe_code)]

//! Fair reader/writer latch.
//!
//! Arrivals that cannot be granted immediately join a FIFO queue. A queued
//! reader proceeds once no writer holds the latch and every waiter ahead of it
//! is also a reader. A queued writer proceeds once it is at the head and the
//! latch is idle. New arrivals never overtake queued waiters.

use std::collections::VecDeque;

use parking_lot::lock_api::{self, GuardNoSend, RawRwLock};
use parking_lot::{Condvar, Mutex};

/// Raw latch implementing [`lock_api::RawRwLock`] with FIFO fairness.
pub struct FairRawRwLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

struct LatchState {
    readers: u32,
    writer: bool,
    next_ticket: u64,
    queue: VecDeque<Waiter>,
}

#[derive(Clone, Copy)]
struct Waiter {
    ticket: u64,
    exclusive: bool,
}

/// Point-in-time view of a latch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LatchSnapshot {
    /// Threads holding the latch shared.
    pub readers: u32,
    /// Whether a writer holds the latch.
    pub writer: bool,
    /// Threads queued for the latch.
    pub waiting: usize,
}

impl LatchState {
    const fn new() -> Self {
        Self {
            readers: 0,
            writer: false,
            next_ticket: 0,
            queue: VecDeque::new(),
        }
    }

    fn enqueue(&mut self, exclusive: bool) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.queue.push_back(Waiter { ticket, exclusive });
        ticket
    }

    fn position(&self, ticket: u64) -> usize {
        self.queue
            .iter()
            .position(|w| w.ticket == ticket)
            .unwrap_or(0)
    }

    fn reader_may_enter(&self, ticket: u64) -> bool {
        if self.writer {
            return false;
        }
        let pos = self.position(ticket);
        self.queue.iter().take(pos).all(|w| !w.exclusive)
    }

    fn writer_may_enter(&self, ticket: u64) -> bool {
        !self.writer
            && self.readers == 0
            && self.queue.front().map(|w| w.ticket) == Some(ticket)
    }

    fn dequeue(&mut self, ticket: u64) {
        if let Some(pos) = self.queue.iter().position(|w| w.ticket == ticket) {
            self.queue.remove(pos);
        }
    }
}

impl FairRawRwLatch {
    /// Current holder and waiter counts.
    pub fn snapshot(&self) -> LatchSnapshot {
        let state = self.state.lock();
        LatchSnapshot {
            readers: state.readers,
            writer: state.writer,
            waiting: state.queue.len(),
        }
    }

    fn wake(&self, state: &LatchState) {
        if !state.queue.is_empty() {
            // Readers and writers share one condvar, so everyone re-checks.
            self.cond.notify_all();
        }
    }
}

unsafe impl RawRwLock for FairRawRwLatch {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: FairRawRwLatch = FairRawRwLatch {
        state: parking_lot::const_mutex(LatchState::new()),
        cond: Condvar::new(),
    };

    type GuardMarker = GuardNoSend;

    fn lock_shared(&self) {
        let mut state = self.state.lock();
        if !state.writer && state.queue.is_empty() {
            state.readers += 1;
            return;
        }
        let ticket = state.enqueue(false);
        while !state.reader_may_enter(ticket) {
            self.cond.wait(&mut state);
        }
        state.dequeue(ticket);
        state.readers += 1;
    }

    fn try_lock_shared(&self) -> bool {
        let mut state = self.state.lock();
        if !state.writer && state.queue.is_empty() {
            state.readers += 1;
            true
        } else {
            false
        }
    }

    unsafe fn unlock_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.readers > 0, "shared unlock without holder");
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.wake(&state);
        }
    }

    fn lock_exclusive(&self) {
        let mut state = self.state.lock();
        if !state.writer && state.readers == 0 && state.queue.is_empty() {
            state.writer = true;
            return;
        }
        let ticket = state.enqueue(true);
        while !state.writer_may_enter(ticket) {
            self.cond.wait(&mut state);
        }
        state.dequeue(ticket);
        state.writer = true;
    }

    fn try_lock_exclusive(&self) -> bool {
        let mut state = self.state.lock();
        if !state.writer && state.readers == 0 && state.queue.is_empty() {
            state.writer = true;
            true
        } else {
            false
        }
    }

    unsafe fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer, "exclusive unlock without holder");
        state.writer = false;
        self.wake(&state);
    }
}

/// Fair reader/writer latch protecting a `T`.
pub type RwLatch<T> = lock_api::RwLock<FairRawRwLatch, T>;

/// Shared guard of an [`RwLatch`].
pub type RwLatchReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, FairRawRwLatch, T>;

/// Exclusive guard of an [`RwLatch`].
pub type RwLatchWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, FairRawRwLatch, T>;

/// Reads the holder and waiter counts of `latch`.
pub fn latch_snapshot<T: ?Sized>(latch: &RwLatch<T>) -> LatchSnapshot {
    // SAFETY: the raw latch is only inspected, never unlocked through this
    // reference.
    unsafe { latch.raw() }.snapshot()
}
