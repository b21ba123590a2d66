#![forbid(unsafe_code)]

//! Owner-tracking mutex that detects self-deadlock and runaway recursion.

use std::panic::Location;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::types::{MpoolError, Result};

/// How a [`DebugRecursiveMutex`] treats re-entry by its owner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LatchKind {
    /// Re-entry is a self-deadlock and is refused.
    Plain,
    /// Re-entry is allowed up to `limit` nested holds.
    Recursive {
        /// Maximum nesting depth, including the first hold.
        limit: u32,
    },
}

#[derive(Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    depth: u32,
    acquired_at: Option<&'static Location<'static>>,
}

/// Mutex recording its owner thread, nesting depth and acquisition site.
///
/// Misuse (re-entry of a plain mutex, depth beyond the limit, release by a
/// thread that does not own it) is reported as
/// [`MpoolError::ProtocolViolation`] carrying the offending call site.
pub struct DebugRecursiveMutex {
    name: &'static str,
    kind: LatchKind,
    state: Mutex<OwnerState>,
    released: Condvar,
}

impl DebugRecursiveMutex {
    /// Creates an unowned mutex.
    pub fn new(name: &'static str, kind: LatchKind) -> Self {
        Self {
            name,
            kind,
            state: Mutex::new(OwnerState::default()),
            released: Condvar::new(),
        }
    }

    /// Name given at construction.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the mutex, blocking while another thread owns it.
    #[track_caller]
    pub fn acquire(&self) -> Result<()> {
        let me = thread::current().id();
        let caller = Location::caller();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            return match self.kind {
                LatchKind::Recursive { limit } if state.depth < limit => {
                    state.depth += 1;
                    Ok(())
                }
                LatchKind::Recursive { limit } => {
                    warn!(
                        mutex = self.name,
                        limit,
                        first = ?state.acquired_at,
                        "latch.recursive.depth_exceeded"
                    );
                    Err(MpoolError::ProtocolViolation {
                        what: "recursion depth exceeded",
                        location: caller,
                    })
                }
                LatchKind::Plain => Err(MpoolError::ProtocolViolation {
                    what: "self-deadlock on non-recursive mutex",
                    location: caller,
                }),
            };
        }
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = 1;
        state.acquired_at = Some(caller);
        Ok(())
    }

    /// Acquires the mutex only if no other thread owns it.
    #[track_caller]
    pub fn try_acquire(&self) -> Result<bool> {
        let me = thread::current().id();
        {
            let state = self.state.lock();
            if state.owner.is_some() && state.owner != Some(me) {
                return Ok(false);
            }
        }
        self.acquire().map(|()| true)
    }

    /// Releases one level of nesting held by the calling thread.
    #[track_caller]
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            None => Err(MpoolError::protocol("unlock without lock")),
            Some(owner) if owner != me => Err(MpoolError::protocol("unlock by non-owner")),
            Some(_) => {
                state.depth -= 1;
                if state.depth == 0 {
                    state.owner = None;
                    state.acquired_at = None;
                    self.released.notify_one();
                }
                Ok(())
            }
        }
    }

    /// Acquires the mutex and returns a guard releasing it on drop.
    #[track_caller]
    pub fn lock(&self) -> Result<RecursiveGuard<'_>> {
        self.acquire()?;
        Ok(RecursiveGuard { mutex: self })
    }

    /// Nesting depth held by the current owner, zero when free.
    pub fn depth(&self) -> u32 {
        self.state.lock().depth
    }

    /// Whether the calling thread owns the mutex.
    pub fn is_owned_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Call site of the outermost acquisition by the current owner.
    pub fn owner_location(&self) -> Option<&'static Location<'static>> {
        self.state.lock().acquired_at
    }
}

/// Guard for one nesting level of a [`DebugRecursiveMutex`].
pub struct RecursiveGuard<'a> {
    mutex: &'a DebugRecursiveMutex,
}

impl RecursiveGuard<'_> {
    /// The guarded mutex.
    pub fn mutex(&self) -> &DebugRecursiveMutex {
        self.mutex
    }
}

impl Drop for RecursiveGuard<'_> {
    fn drop(&mut self) {
        // The guard is only created by the owner, so release cannot fail.
        let _ = self.mutex.release();
    }
}
