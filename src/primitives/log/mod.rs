#![forbid(unsafe_code)]

//! Log manager: LSN allocation, the log buffer and the optional log file.
//!
//! LSNs are byte positions in the log, so a record written at `start` of
//! length `n` ends at `start + n`. The first [`LOG_HEADER_LEN`] bytes of the
//! log file hold a checksummed control header; the first record therefore
//! starts at that LSN and LSN zero is never assigned.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::primitives::concurrency::{LockRank, ProcessLock, RankedGuard, RankedMutex};
use crate::primitives::io::{FileIo, OpenFlags, StdFileIo};
use crate::types::{Lsn, MpoolError, Result};

const LOG_MAGIC: [u8; 4] = *b"MPLG";
const LOG_FORMAT_VERSION: u16 = 1;

/// Length of the control header at the start of the log file.
pub const LOG_HEADER_LEN: usize = 64;

/// Bit set on the first byte of an mtr's log when it holds a single record.
pub const SINGLE_REC_FLAG: u8 = 0x80;

/// Record type terminating a multi-record mtr log.
pub const MULTI_REC_END: u8 = 31;

/// Record type of a checkpoint record.
pub const CHECKPOINT_REC: u8 = 0x38;

/// Half-open LSN range `[start, end)` occupied by one log write.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct LsnRange {
    /// First byte of the write.
    pub start: Lsn,
    /// One past the last byte of the write.
    pub end: Lsn,
}

/// Log configuration.
#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    /// Log file path; `None` keeps the log in memory.
    pub path: Option<PathBuf>,
    /// Bytes buffered before the log is written out.
    pub buffer_bytes: usize,
    /// Maximum log bytes past the last checkpoint, zero for unbounded.
    pub capacity_bytes: u64,
    /// Fsync the log file on every flush.
    pub sync: bool,
    /// Environment identifier stamped into the header.
    pub env_id: u64,
}

/// Control header persisted at the start of the log file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LogHeader {
    /// LSN of the first record.
    pub base_lsn: Lsn,
    /// LSN recorded by the last completed checkpoint.
    pub last_ckp_lsn: Lsn,
    /// Wall-clock seconds of the last checkpoint.
    pub ckp_time_secs: u64,
    /// Checkpoint generation counter.
    pub generation: u64,
    /// Environment identifier.
    pub env_id: u64,
}

impl LogHeader {
    fn encode(&self) -> [u8; LOG_HEADER_LEN] {
        let mut buf = [0u8; LOG_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.base_lsn.0.to_be_bytes());
        buf[16..24].copy_from_slice(&self.last_ckp_lsn.0.to_be_bytes());
        buf[24..32].copy_from_slice(&self.ckp_time_secs.to_be_bytes());
        buf[32..40].copy_from_slice(&self.generation.to_be_bytes());
        buf[40..48].copy_from_slice(&self.env_id.to_be_bytes());
        let crc = crc32fast::hash(&buf[..LOG_HEADER_LEN - 4]);
        buf[LOG_HEADER_LEN - 4..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LOG_HEADER_LEN {
            return Err(MpoolError::Corruption("log header truncated"));
        }
        if src[0..4] != LOG_MAGIC {
            return Err(MpoolError::Corruption("log magic mismatch"));
        }
        if be_u16(&src[4..6]) != LOG_FORMAT_VERSION {
            return Err(MpoolError::Corruption("log format version mismatch"));
        }
        let stored = be_u32(&src[LOG_HEADER_LEN - 4..LOG_HEADER_LEN]);
        if crc32fast::hash(&src[..LOG_HEADER_LEN - 4]) != stored {
            return Err(MpoolError::Corruption("log header crc mismatch"));
        }
        Ok(Self {
            base_lsn: Lsn(be_u64(&src[8..16])),
            last_ckp_lsn: Lsn(be_u64(&src[16..24])),
            ckp_time_secs: be_u64(&src[24..32]),
            generation: be_u64(&src[32..40]),
            env_id: be_u64(&src[40..48]),
        })
    }
}

fn be_u16(src: &[u8]) -> u16 {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(&src[..2]);
    u16::from_be_bytes(raw)
}

fn be_u32(src: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[..4]);
    u32::from_be_bytes(raw)
}

/// Decodes a big-endian `u64` from the first eight bytes of `src`.
pub fn be_u64(src: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[..8]);
    u64::from_be_bytes(raw)
}

/// Counters describing log traffic.
#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct LogStats {
    /// Writes appended.
    pub writes: u64,
    /// Bytes appended.
    pub bytes: u64,
    /// Writes that took the uncontended inline path.
    pub fast_path: u64,
    /// Writes that waited for the mutex or spilled the buffer.
    pub general_path: u64,
    /// Buffer write-outs.
    pub flushes: u64,
    /// Log file fsyncs.
    pub syncs: u64,
}

#[derive(Default)]
struct LogCounters {
    writes: AtomicU64,
    bytes: AtomicU64,
    fast_path: AtomicU64,
    general_path: AtomicU64,
    flushes: AtomicU64,
    syncs: AtomicU64,
}

struct LogState {
    lsn: Lsn,
    buf: Vec<u8>,
    buf_start: Lsn,
    ckp_floor: Lsn,
    header: LogHeader,
    io: Option<Arc<StdFileIo>>,
}

impl LogState {
    fn write_out(&mut self, sync: bool, counters: &LogCounters) -> Result<()> {
        if let Some(io) = &self.io {
            if !self.buf.is_empty() {
                io.write_at(self.buf_start.0, &self.buf)?;
            }
            if sync {
                io.sync_all()?;
                counters.syncs.fetch_add(1, Ordering::Relaxed);
            }
        }
        counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.buf.clear();
        self.buf_start = self.lsn;
        Ok(())
    }
}

/// Owner of the log mutex and the LSN sequence.
pub struct LogManager {
    state: RankedMutex<LogState>,
    flushed: AtomicU64,
    buffer_bytes: usize,
    capacity_bytes: u64,
    sync: bool,
    counters: LogCounters,
    _lock: Option<ProcessLock>,
}

impl LogManager {
    /// Opens the log, creating the file and header when absent.
    pub fn open(options: LogOptions) -> Result<Self> {
        let base = Lsn(LOG_HEADER_LEN as u64);
        let (io, lock, header, end) = match &options.path {
            Some(path) => {
                let io = Arc::new(StdFileIo::open_with(
                    path,
                    OpenFlags {
                        create: true,
                        ..OpenFlags::default()
                    },
                )?);
                let lock = ProcessLock::try_exclusive(Arc::clone(io.file()), 0, LOG_HEADER_LEN as u64)?
                    .ok_or(MpoolError::Invalid("log file locked by another process"))?;
                let len = io.len()?;
                let (header, end) = if len == 0 {
                    let header = LogHeader {
                        base_lsn: base,
                        env_id: options.env_id,
                        ..LogHeader::default()
                    };
                    io.write_at(0, &header.encode())?;
                    io.sync_all()?;
                    (header, base)
                } else {
                    let mut raw = [0u8; LOG_HEADER_LEN];
                    io.read_at(0, &mut raw)?;
                    let header = LogHeader::decode(&raw)?;
                    (header, Lsn(len.max(base.0)))
                };
                info!(
                    path = %path.display(),
                    end_lsn = end.0,
                    last_ckp = header.last_ckp_lsn.0,
                    generation = header.generation,
                    "log.open"
                );
                (Some(io), Some(lock), header, end)
            }
            None => {
                let header = LogHeader {
                    base_lsn: base,
                    env_id: options.env_id,
                    ..LogHeader::default()
                };
                (None, None, header, base)
            }
        };
        let ckp_floor = if header.last_ckp_lsn.is_zero() {
            header.base_lsn
        } else {
            header.last_ckp_lsn
        };
        Ok(Self {
            state: RankedMutex::new(
                LockRank::Log,
                LogState {
                    lsn: end,
                    buf: Vec::with_capacity(options.buffer_bytes.min(1 << 20)),
                    buf_start: end,
                    ckp_floor,
                    header,
                    io,
                },
            ),
            flushed: AtomicU64::new(end.0),
            buffer_bytes: options.buffer_bytes.max(1),
            capacity_bytes: options.capacity_bytes,
            sync: options.sync,
            counters: LogCounters::default(),
            _lock: lock,
        })
    }

    /// Takes the log mutex, blocking.
    pub fn lock(&self) -> LogGuard<'_> {
        LogGuard {
            state: self.state.lock(),
            mgr: self,
            fast: false,
        }
    }

    /// Takes the log mutex only if it is uncontended.
    pub fn try_lock(&self) -> Option<LogGuard<'_>> {
        self.state.try_lock().map(|state| LogGuard {
            state,
            mgr: self,
            fast: true,
        })
    }

    /// Takes the log mutex for appending: the uncontended path when the mutex
    /// is free, otherwise a blocking wait. The guard remembers which.
    pub fn lock_for_append(&self) -> LogGuard<'_> {
        self.try_lock().unwrap_or_else(|| self.lock())
    }

    /// Appends `bytes` as one write and returns its LSN range.
    pub fn append(&self, bytes: &[u8]) -> Result<LsnRange> {
        self.lock_for_append().append(bytes)
    }

    /// Appends a checkpoint record, ignoring the capacity bound.
    pub fn append_checkpoint(&self, record: &[u8]) -> Result<LsnRange> {
        self.lock().append_unreserved(record)
    }

    /// LSN the next write will start at.
    pub fn current_lsn(&self) -> Lsn {
        self.state.lock().lsn
    }

    /// Everything below this LSN has been written out.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.flushed.load(Ordering::Acquire))
    }

    /// Writes the log out at least up to `upto`.
    pub fn flush(&self, upto: Lsn) -> Result<()> {
        if self.flushed_lsn() >= upto {
            return Ok(());
        }
        let mut state = self.state.lock();
        if self.flushed_lsn() >= upto {
            return Ok(());
        }
        state.write_out(self.sync, &self.counters)?;
        self.flushed.store(state.lsn.0, Ordering::Release);
        debug!(flushed_lsn = state.lsn.0, "log.flush");
        Ok(())
    }

    /// Writes out and (if configured) fsyncs the whole log.
    pub fn flush_all(&self) -> Result<()> {
        let upto = self.current_lsn();
        self.flush(upto)
    }

    /// Current control header.
    pub fn header(&self) -> LogHeader {
        self.state.lock().header
    }

    /// Records a completed checkpoint in the header and frees log capacity.
    pub fn record_checkpoint(&self, ckp_lsn: Lsn, time_secs: u64) -> Result<LogHeader> {
        let mut state = self.state.lock();
        let mut header = state.header;
        header.last_ckp_lsn = ckp_lsn;
        header.ckp_time_secs = time_secs;
        header.generation = header.generation.wrapping_add(1);
        if let Some(io) = &state.io {
            io.write_at(0, &header.encode())?;
            io.sync_all()?;
            self.counters.syncs.fetch_add(1, Ordering::Relaxed);
        }
        state.header = header;
        state.ckp_floor = state.ckp_floor.max(ckp_lsn);
        Ok(header)
    }

    /// Reads back `[start, end)` from the log file after flushing it.
    pub fn read_range(&self, range: LsnRange) -> Result<Vec<u8>> {
        self.flush(range.end)?;
        let state = self.state.lock();
        let io = state
            .io
            .as_ref()
            .ok_or(MpoolError::Invalid("in-memory log cannot be read back"))?;
        let mut out = vec![0u8; (range.end.0 - range.start.0) as usize];
        io.read_at(range.start.0, &mut out)?;
        Ok(out)
    }

    /// Whether the log lives in a file.
    pub fn is_persistent(&self) -> bool {
        self.state.lock().io.is_some()
    }

    /// Traffic counters.
    pub fn stats(&self) -> LogStats {
        let c = &self.counters;
        LogStats {
            writes: c.writes.load(Ordering::Relaxed),
            bytes: c.bytes.load(Ordering::Relaxed),
            fast_path: c.fast_path.load(Ordering::Relaxed),
            general_path: c.general_path.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            syncs: c.syncs.load(Ordering::Relaxed),
        }
    }
}

/// Held log mutex.
pub struct LogGuard<'a> {
    state: RankedGuard<'a, LogState>,
    mgr: &'a LogManager,
    fast: bool,
}

impl LogGuard<'_> {
    /// LSN the next write will start at.
    pub fn current_lsn(&self) -> Lsn {
        self.state.lsn
    }

    /// Checks that `len` more bytes fit within the log capacity.
    pub fn reserve(&self, len: usize) -> Result<()> {
        let capacity = self.mgr.capacity_bytes;
        if capacity == 0 {
            return Ok(());
        }
        let used = self.state.lsn.0.saturating_sub(self.state.ckp_floor.0);
        let needed = len as u64;
        if used + needed > capacity {
            return Err(MpoolError::LogFull {
                needed,
                available: capacity.saturating_sub(used),
            });
        }
        Ok(())
    }

    /// Appends `bytes` and returns the LSN range they occupy.
    pub fn append(&mut self, bytes: &[u8]) -> Result<LsnRange> {
        self.reserve(bytes.len())?;
        self.append_unreserved(bytes)
    }

    /// Appends without the capacity check. Checkpoint records use this so a
    /// full log can still be checkpointed.
    pub fn append_unreserved(&mut self, bytes: &[u8]) -> Result<LsnRange> {
        let mgr = self.mgr;
        let fits = self.state.buf.len() + bytes.len() <= mgr.buffer_bytes;
        if self.fast && fits {
            mgr.counters.fast_path.fetch_add(1, Ordering::Relaxed);
        } else {
            mgr.counters.general_path.fetch_add(1, Ordering::Relaxed);
        }
        if !fits && !self.state.buf.is_empty() {
            self.state.write_out(mgr.sync, &mgr.counters)?;
            mgr.flushed.store(self.state.buf_start.0, Ordering::Release);
        }
        let start = self.state.lsn;
        self.state.buf.extend_from_slice(bytes);
        self.state.lsn = start.advance(bytes.len() as u64);
        if self.state.buf.len() > mgr.buffer_bytes {
            self.state.write_out(mgr.sync, &mgr.counters)?;
            mgr.flushed.store(self.state.buf_start.0, Ordering::Release);
        }
        mgr.counters.writes.fetch_add(1, Ordering::Relaxed);
        mgr.counters
            .bytes
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(LsnRange {
            start,
            end: self.state.lsn,
        })
    }
}
