#![forbid(unsafe_code)]

//! Checkpoints and the region header.
//!
//! A checkpoint picks the oldest begin LSN among active transactions (or the
//! current LSN when none has one), writes every page whose first unflushed
//! modification lies below it, and then logs a checkpoint record. The region
//! header's checkpoint LSN only ever moves forward.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::pool::{PoolShared, PoolStats};
use crate::primitives::alloc::RegionUsage;
use crate::primitives::concurrency::{LockRank, RankedMutex};
use crate::primitives::log::{LogHeader, LsnRange, CHECKPOINT_REC, SINGLE_REC_FLAG};
use crate::types::{Lsn, MpoolError, Result, TxnId};

/// Length of an encoded checkpoint record.
pub const CHECKPOINT_RECORD_LEN: usize = 1 + 5 * 8;

/// What a checkpoint call did.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckpointOutcome {
    /// Neither threshold was reached, or nothing was logged since the last one.
    Skipped,
    /// Read-only pool: pages were written but no record was logged.
    FlushedOnly,
    /// A checkpoint record was written.
    Completed {
        /// LSN the record vouches for.
        ckp_lsn: Lsn,
        /// Where the record landed in the log.
        #[serde(skip)]
        record: LsnRange,
        /// Generation stamped into the record.
        generation: u64,
    },
}

/// Checkpoint record contents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CheckpointRecord {
    /// Every page modified below this LSN was on disk when it was written.
    pub ckp_lsn: Lsn,
    /// Checkpoint LSN of the previous record.
    pub prev_ckp_lsn: Lsn,
    /// Wall-clock seconds since the epoch.
    pub time_secs: u64,
    /// Environment id.
    pub env_id: u64,
    /// Generation counter.
    pub generation: u64,
}

impl CheckpointRecord {
    /// Encodes the record with its single-record framing bit set.
    pub fn encode(&self) -> [u8; CHECKPOINT_RECORD_LEN] {
        let mut buf = [0u8; CHECKPOINT_RECORD_LEN];
        buf[0] = CHECKPOINT_REC | SINGLE_REC_FLAG;
        let fields = [
            self.ckp_lsn.0,
            self.prev_ckp_lsn.0,
            self.time_secs,
            self.env_id,
            self.generation,
        ];
        for (chunk, value) in buf[1..].chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&value.to_be_bytes());
        }
        buf
    }

    /// Decodes a record written by [`encode`](Self::encode).
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < CHECKPOINT_RECORD_LEN || src[0] != CHECKPOINT_REC | SINGLE_REC_FLAG {
            return Err(MpoolError::Corruption("not a checkpoint record"));
        }
        let field = |idx: usize| {
            let start = 1 + idx * 8;
            crate::primitives::log::be_u64(&src[start..start + 8])
        };
        Ok(Self {
            ckp_lsn: Lsn(field(0)),
            prev_ckp_lsn: Lsn(field(1)),
            time_secs: field(2),
            env_id: field(3),
            generation: field(4),
        })
    }
}

/// Active transaction as seen by a snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct TxnSnapshot {
    /// Transaction id.
    pub id: TxnId,
    /// First LSN the transaction logged, if any.
    pub begin_lsn: Option<Lsn>,
}

/// Registry of active transactions.
#[derive(Default)]
pub struct TxnRegistry {
    inner: Mutex<TxnState>,
}

#[derive(Default)]
struct TxnState {
    next: u64,
    active: BTreeMap<TxnId, Option<Lsn>>,
}

impl TxnRegistry {
    /// Registers a new transaction without a begin LSN.
    pub fn begin(&self) -> TxnId {
        let mut state = self.inner.lock();
        state.next += 1;
        let id = TxnId(state.next);
        state.active.insert(id, None);
        id
    }

    /// Sets the begin LSN of `txn`.
    pub fn set_begin_lsn(&self, txn: TxnId, lsn: Lsn) -> Result<()> {
        let mut state = self.inner.lock();
        let slot = state.active.get_mut(&txn).ok_or(MpoolError::NotFound)?;
        *slot = Some(lsn);
        Ok(())
    }

    /// Records a commit on behalf of `txn`; only the first one sets the
    /// begin LSN. Unknown transactions are ignored.
    pub fn note_commit(&self, txn: TxnId, start: Lsn) {
        let mut state = self.inner.lock();
        if let Some(slot @ None) = state.active.get_mut(&txn) {
            *slot = Some(start);
        }
    }

    /// Removes `txn`.
    pub fn end(&self, txn: TxnId) -> Result<()> {
        self.inner
            .lock()
            .active
            .remove(&txn)
            .map(|_| ())
            .ok_or(MpoolError::NotFound)
    }

    /// Smallest begin LSN among active transactions that have one.
    pub fn oldest_begin(&self) -> Option<Lsn> {
        self.inner.lock().active.values().flatten().min().copied()
    }

    /// Active transactions in id order.
    pub fn snapshot(&self) -> Vec<TxnSnapshot> {
        self.inner
            .lock()
            .active
            .iter()
            .map(|(&id, &begin_lsn)| TxnSnapshot { id, begin_lsn })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct RegionHeader {
    last_ckp_lsn: Lsn,
    last_ckp_time_secs: u64,
    generation: u64,
    env_id: u64,
}

struct CkpState {
    last_end: Lsn,
    last_run: Instant,
}

/// Point-in-time view of the region header, active transactions and pool
/// statistics.
#[derive(Clone, Debug, Serialize)]
pub struct RegionSnapshot {
    /// LSN recorded by the last completed checkpoint.
    pub last_ckp_lsn: Lsn,
    /// Wall-clock seconds of the last checkpoint.
    pub last_ckp_time_secs: u64,
    /// Checkpoint generation.
    pub generation: u64,
    /// Environment id.
    pub env_id: u64,
    /// Active transactions.
    pub active_txns: Vec<TxnSnapshot>,
    /// Pool statistics.
    pub stats: PoolStats,
    /// Frame region usage.
    pub region: RegionUsage,
}

/// Checkpoint mutex, region header and transaction registry.
pub(crate) struct Checkpointer {
    state: RankedMutex<CkpState>,
    region: Mutex<RegionHeader>,
    txns: TxnRegistry,
}

impl Checkpointer {
    pub fn new(header: LogHeader, current: Lsn) -> Self {
        Self {
            state: RankedMutex::new(
                LockRank::Checkpoint,
                CkpState {
                    last_end: current,
                    last_run: Instant::now(),
                },
            ),
            region: Mutex::new(RegionHeader {
                last_ckp_lsn: header.last_ckp_lsn,
                last_ckp_time_secs: header.ckp_time_secs,
                generation: header.generation,
                env_id: header.env_id,
            }),
            txns: TxnRegistry::default(),
        }
    }

    pub fn txns(&self) -> &TxnRegistry {
        &self.txns
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.region.lock().last_ckp_lsn
    }

    pub fn snapshot(&self, stats: PoolStats, region: RegionUsage) -> RegionSnapshot {
        let header = *self.region.lock();
        RegionSnapshot {
            last_ckp_lsn: header.last_ckp_lsn,
            last_ckp_time_secs: header.last_ckp_time_secs,
            generation: header.generation,
            env_id: header.env_id,
            active_txns: self.txns.snapshot(),
            stats,
            region,
        }
    }

    /// Moves the region header forward; an older LSN leaves it unchanged.
    fn advance(&self, ckp_lsn: Lsn, time_secs: u64, generation: u64) -> bool {
        let mut region = self.region.lock();
        region.generation = region.generation.max(generation);
        if ckp_lsn > region.last_ckp_lsn {
            region.last_ckp_lsn = ckp_lsn;
            region.last_ckp_time_secs = time_secs;
            true
        } else {
            false
        }
    }
}

fn thresholds_reached(opts: &crate::options::PoolOptions, logged: u64, since: Duration) -> bool {
    if opts.checkpoint_kbytes == 0 && opts.checkpoint_minutes == 0 {
        return true;
    }
    let by_size = opts.checkpoint_kbytes > 0 && logged / 1024 >= opts.checkpoint_kbytes;
    let by_time = opts.checkpoint_minutes > 0
        && since >= Duration::from_secs(opts.checkpoint_minutes.saturating_mul(60));
    by_size || by_time
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Runs one checkpoint against `pool`.
pub(crate) fn run(pool: &PoolShared, force: bool) -> Result<CheckpointOutcome> {
    let started = Instant::now();
    let ckp = &pool.ckp;
    let mut state = ckp.state.lock();
    let current = pool.log.current_lsn();
    if !force {
        let logged = current.0.saturating_sub(state.last_end.0);
        if logged == 0 || !thresholds_reached(&pool.opts, logged, state.last_run.elapsed()) {
            pool.note_checkpoint(false);
            debug!(current = current.0, last_end = state.last_end.0, "checkpoint.skipped");
            return Ok(CheckpointOutcome::Skipped);
        }
    }

    if pool.opts.read_only {
        pool.flush_until("checkpoint", |_, _| true)?;
        pool.sync_files()?;
        state.last_run = Instant::now();
        info!("checkpoint.flushed_only");
        return Ok(CheckpointOutcome::FlushedOnly);
    }

    let ckp_lsn = ckp.txns.oldest_begin().unwrap_or(current);
    let oldest_dirty = pool.flush.lock().head_lsn();
    debug!(
        ckp_lsn = ckp_lsn.0,
        oldest_dirty = ?oldest_dirty.map(|l| l.0),
        "checkpoint.begin"
    );
    pool.flush_until("checkpoint", |_, oldest| oldest < ckp_lsn)?;
    pool.sync_files()?;

    let header = pool.log.header();
    let time_secs = now_secs();
    let record = CheckpointRecord {
        ckp_lsn,
        prev_ckp_lsn: header.last_ckp_lsn,
        time_secs,
        env_id: header.env_id,
        generation: header.generation + 1,
    };
    let range = pool.log.append_checkpoint(&record.encode())?;
    pool.log.flush(range.end)?;
    let stored = pool
        .log
        .record_checkpoint(header.last_ckp_lsn.max(ckp_lsn), time_secs)?;
    let advanced = ckp.advance(ckp_lsn, time_secs, stored.generation);

    state.last_end = range.end;
    state.last_run = Instant::now();
    pool.note_checkpoint(true);
    info!(
        ckp_lsn = ckp_lsn.0,
        prev = header.last_ckp_lsn.0,
        record_end = range.end.0,
        generation = record.generation,
        advanced,
        forced = force,
        duration_ms = started.elapsed().as_secs_f64() * 1_000.0,
        "checkpoint.complete"
    );
    Ok(CheckpointOutcome::Completed {
        ckp_lsn,
        record: range,
        generation: record.generation,
    })
}
