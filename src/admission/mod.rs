#![forbid(unsafe_code)]

//! Admission control.
//!
//! Caps the number of threads working inside the engine. A thread entering
//! takes a batch of tickets and may re-enter without contending until they
//! run out. Threads that find the engine full sleep and retry; the sleep
//! length adapts to how long waiters have recently had to wait.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::options::PoolOptions;
use crate::types::{MpoolError, Result};

/// Sleeps at or below this many microseconds are not shortened further.
const MIN_ADAPTIVE_SLEEP_US: u64 = 20;

/// Admission parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AdmissionConfig {
    /// Maximum threads inside; zero disables admission control.
    pub concurrency_limit: u32,
    /// Tickets granted per successful entry.
    pub free_tickets: u32,
    /// Initial sleep between attempts, in microseconds.
    pub thread_sleep_us: u64,
    /// Upper bound of the adaptive sleep; zero keeps the sleep fixed.
    pub adaptive_sleep_max_us: u64,
}

impl From<&PoolOptions> for AdmissionConfig {
    fn from(opts: &PoolOptions) -> Self {
        Self {
            concurrency_limit: opts.concurrency_limit,
            free_tickets: opts.free_tickets_per_query.max(1),
            thread_sleep_us: opts.thread_sleep_us,
            adaptive_sleep_max_us: opts.adaptive_sleep_max_us,
        }
    }
}

/// Per-thread admission state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AdmissionSlot {
    n_tickets: u32,
    declared_inside: bool,
    waiting_marked: bool,
}

impl AdmissionSlot {
    /// Whether the holder is currently inside.
    pub fn is_inside(&self) -> bool {
        self.declared_inside
    }

    /// Tickets left before the holder has to contend again.
    pub fn tickets(&self) -> u32 {
        self.n_tickets
    }
}

/// Cross-thread interrupt request for a waiting thread.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Creates a cleared flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the waiter to give up.
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clears a previous request.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether an interrupt is pending.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Admission counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct AdmissionStats {
    /// Successful entries, ticket reuse included.
    pub entries: u64,
    /// Entries that took a fresh batch of tickets.
    pub grants: u64,
    /// Entries that had to wait at least once.
    pub waits: u64,
    /// Sleeps taken while waiting.
    pub sleeps: u64,
    /// Waits abandoned on interrupt.
    pub interrupts: u64,
    /// Most threads observed inside at once.
    pub max_active: u32,
    /// Current adaptive sleep in microseconds.
    pub sleep_us: u64,
}

#[derive(Default)]
struct Counters {
    entries: AtomicU64,
    grants: AtomicU64,
    waits: AtomicU64,
    sleeps: AtomicU64,
    interrupts: AtomicU64,
    max_active: AtomicU32,
}

/// The admission controller.
pub struct Admission {
    config: AdmissionConfig,
    active: AtomicU32,
    waiting: AtomicU32,
    sleep_us: AtomicU64,
    saturated: AtomicBool,
    counters: Counters,
}

impl Admission {
    /// Creates a controller with nobody inside.
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            active: AtomicU32::new(0),
            waiting: AtomicU32::new(0),
            sleep_us: AtomicU64::new(config.thread_sleep_us),
            saturated: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Parameters in effect.
    pub fn config(&self) -> AdmissionConfig {
        self.config
    }

    /// Threads inside.
    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// Threads waiting to enter.
    pub fn waiting(&self) -> u32 {
        self.waiting.load(Ordering::Acquire)
    }

    /// Current sleep between entry attempts, in microseconds.
    pub fn sleep_us(&self) -> u64 {
        self.sleep_us.load(Ordering::Relaxed)
    }

    /// Enters the engine, sleeping while it is full.
    ///
    /// Returns [`MpoolError::Interrupted`] when `interrupt` is raised while
    /// waiting; the slot is then left outside and holds no tickets.
    #[track_caller]
    pub fn enter(&self, slot: &mut AdmissionSlot, interrupt: Option<&InterruptFlag>) -> Result<()> {
        if slot.declared_inside {
            return Err(MpoolError::protocol("admission entered twice"));
        }
        let limit = self.config.concurrency_limit;
        if limit == 0 {
            slot.declared_inside = true;
            return Ok(());
        }
        if slot.n_tickets > 0 {
            slot.declared_inside = true;
            self.counters.entries.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let waiters_on_entry = self.waiting() > 0;
        let mut sleeps = 0u32;
        loop {
            if interrupt.is_some_and(InterruptFlag::is_set) {
                if slot.waiting_marked {
                    slot.waiting_marked = false;
                    self.waiting.fetch_sub(1, Ordering::AcqRel);
                }
                self.counters.interrupts.fetch_add(1, Ordering::Relaxed);
                debug!(sleeps, "admission.interrupted");
                return Err(MpoolError::Interrupted);
            }

            let inside = self.active.fetch_add(1, Ordering::AcqRel) + 1;
            if inside <= limit {
                if slot.waiting_marked {
                    slot.waiting_marked = false;
                    self.waiting.fetch_sub(1, Ordering::AcqRel);
                }
                slot.n_tickets = self.config.free_tickets;
                slot.declared_inside = true;
                self.counters.entries.fetch_add(1, Ordering::Relaxed);
                self.counters.grants.fetch_add(1, Ordering::Relaxed);
                self.counters.max_active.fetch_max(inside, Ordering::Relaxed);
                if sleeps > 0 {
                    self.counters.waits.fetch_add(1, Ordering::Relaxed);
                }
                self.adapt(sleeps, waiters_on_entry);
                trace!(inside, sleeps, "admission.enter");
                return Ok(());
            }
            self.active.fetch_sub(1, Ordering::AcqRel);

            if !slot.waiting_marked {
                slot.waiting_marked = true;
                self.waiting.fetch_add(1, Ordering::AcqRel);
            }
            let pause = self.current_sleep();
            self.counters.sleeps.fetch_add(1, Ordering::Relaxed);
            sleeps += 1;
            if pause.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(pause);
            }
        }
    }

    fn current_sleep(&self) -> Duration {
        let mut us = self.sleep_us();
        if self.config.adaptive_sleep_max_us > 0 {
            us = us.min(self.config.adaptive_sleep_max_us);
        }
        Duration::from_micros(us)
    }

    fn adapt(&self, sleeps: u32, waiters_on_entry: bool) {
        let max = self.config.adaptive_sleep_max_us;
        if max == 0 {
            return;
        }
        let current = self.sleep_us();
        let next = if sleeps == 1 {
            if current > MIN_ADAPTIVE_SLEEP_US {
                current - 1
            } else {
                current
            }
        } else if sleeps == 0 && !waiters_on_entry {
            current / 2
        } else if sleeps > 1 {
            current + 1
        } else {
            current
        };
        let capped = next.min(max);
        if next >= max {
            if !self.saturated.swap(true, Ordering::Relaxed) {
                warn!(sleep_us = capped, max_us = max, "admission.sleep.saturated");
            }
        } else {
            self.saturated.store(false, Ordering::Relaxed);
        }
        self.sleep_us.store(capped, Ordering::Relaxed);
    }

    /// Leaves the engine, giving up one ticket. The slot stays counted as
    /// active until its tickets run out.
    #[track_caller]
    pub fn leave(&self, slot: &mut AdmissionSlot) -> Result<()> {
        if !slot.declared_inside {
            return Err(MpoolError::protocol("admission left without entering"));
        }
        slot.declared_inside = false;
        if self.config.concurrency_limit == 0 {
            return Ok(());
        }
        slot.n_tickets = slot.n_tickets.saturating_sub(1);
        if slot.n_tickets == 0 {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Gives up every remaining ticket so the slot no longer counts as
    /// active. Used when a holder stops issuing work.
    pub fn release(&self, slot: &mut AdmissionSlot) {
        let held = slot.n_tickets > 0;
        slot.n_tickets = 0;
        slot.declared_inside = false;
        if held && self.config.concurrency_limit > 0 {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AdmissionStats {
        let c = &self.counters;
        AdmissionStats {
            entries: c.entries.load(Ordering::Relaxed),
            grants: c.grants.load(Ordering::Relaxed),
            waits: c.waits.load(Ordering::Relaxed),
            sleeps: c.sleeps.load(Ordering::Relaxed),
            interrupts: c.interrupts.load(Ordering::Relaxed),
            max_active: c.max_active.load(Ordering::Relaxed),
            sleep_us: self.sleep_us(),
        }
    }
}
