#![forbid(unsafe_code)]

//! Bounded FIFO with producer flow control and close propagation.
//!
//! Producers block while the queue holds `limit` items and are released once
//! consumers drain it down to the resume threshold. Closing wakes every waiter:
//! producers fail with [`MpoolError::QueueClosed`], consumers drain what is left
//! and then fail the same way.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::types::{MpoolError, Result};

/// Rejected [`BoundedQueue::try_push`], handing the item back.
pub enum TryPushError<T> {
    /// The queue is at its limit.
    Full(T),
    /// The queue has been closed.
    Closed(T),
}

impl<T> TryPushError<T> {
    /// Recovers the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(item) | TryPushError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPushError::Full(_) => f.write_str("Full(..)"),
            TryPushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> From<TryPushError<T>> for MpoolError {
    fn from(err: TryPushError<T>) -> Self {
        match err {
            TryPushError::Full(_) => MpoolError::WouldBlock("queue full"),
            TryPushError::Closed(_) => MpoolError::QueueClosed,
        }
    }
}

/// Counters describing queue traffic.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct QueueStats {
    /// Items accepted.
    pub pushed: u64,
    /// Items handed to consumers.
    pub popped: u64,
    /// Largest length observed.
    pub high_water: usize,
    /// Times a producer had to wait for room.
    pub producer_waits: u64,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    stats: QueueStats,
}

/// Bounded multi-producer, multi-consumer FIFO.
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    limit: usize,
    resume: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue that resumes producers at half of `limit`.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self::with_resume(limit, limit / 2)
    }

    /// Creates a queue with an explicit resume threshold.
    ///
    /// `resume` is clamped below `limit`.
    pub fn with_resume(limit: usize, resume: usize) -> Self {
        let limit = limit.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(limit.min(4096)),
                closed: false,
                stats: QueueStats::default(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            limit,
            resume: resume.min(limit - 1),
        }
    }

    /// Appends `item`, waiting while the queue is full.
    pub fn push(&self, item: T) -> Result<()> {
        let mut state = self.state.lock();
        if state.items.len() >= self.limit && !state.closed {
            state.stats.producer_waits += 1;
            // Once blocked, stay blocked until consumers reach the resume mark.
            while state.items.len() > self.resume && !state.closed {
                self.not_full.wait(&mut state);
            }
        }
        if state.closed {
            return Err(MpoolError::QueueClosed);
        }
        Self::accept(&mut state, item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Appends `item` only if there is room right now.
    pub fn try_push(&self, item: T) -> std::result::Result<(), TryPushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TryPushError::Closed(item));
        }
        if state.items.len() >= self.limit {
            return Err(TryPushError::Full(item));
        }
        Self::accept(&mut state, item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    fn accept(state: &mut QueueState<T>, item: T) {
        state.items.push_back(item);
        state.stats.pushed += 1;
        state.stats.high_water = state.stats.high_water.max(state.items.len());
    }

    /// Removes the oldest item, waiting while the queue is empty.
    ///
    /// After close, remaining items are still returned; once drained every
    /// call fails with [`MpoolError::QueueClosed`].
    pub fn pop(&self) -> Result<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = self.take(&mut state) {
                return Ok(item);
            }
            if state.closed {
                return Err(MpoolError::QueueClosed);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let mut state = self.state.lock();
        if let Some(item) = self.take(&mut state) {
            return Ok(Some(item));
        }
        if state.closed {
            return Err(MpoolError::QueueClosed);
        }
        let _ = self.not_empty.wait_for(&mut state, timeout);
        if let Some(item) = self.take(&mut state) {
            return Ok(Some(item));
        }
        if state.closed {
            return Err(MpoolError::QueueClosed);
        }
        Ok(None)
    }

    fn take(&self, state: &mut QueueState<T>) -> Option<T> {
        let item = state.items.pop_front()?;
        state.stats.popped += 1;
        if state.items.len() <= self.resume {
            self.not_full.notify_all();
        }
        Some(item)
    }

    /// Marks the queue closed and wakes every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Length at or below which blocked producers are released.
    pub fn resume_threshold(&self) -> usize {
        self.resume
    }

    /// Traffic counters.
    pub fn stats(&self) -> QueueStats {
        self.state.lock().stats
    }
}
