#![forbid(unsafe_code)]

//! IO workers.
//!
//! Workers drain one bounded queue of page reads and writes. A read fills the
//! frame and runs the page-in hook before the buffer turns clean; a write
//! flushes the log up to the page's newest modification, runs the page-out
//! hook on a scratch copy and writes it. Waiters park on the buffer's IO
//! condition variable.

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use super::bh::BufferState;
use super::file::MpoolFile;
use super::stats::bump;
use super::PoolShared;
use crate::primitives::alloc::aligned_alloc;
use crate::primitives::io::FileIo;
use crate::types::{clone_error, BhId, Lsn, MpoolError, PageId, Result, CACHE_LINE};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum IoKind {
    /// Fill the frame from disk; an empty read zero-fills when `create` is set.
    Read { create: bool },
    Write,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct IoRequest {
    pub id: BhId,
    pub kind: IoKind,
}

impl IoRequest {
    pub fn read(id: BhId, create: bool) -> Self {
        Self {
            id,
            kind: IoKind::Read { create },
        }
    }

    pub fn write(id: BhId) -> Self {
        Self {
            id,
            kind: IoKind::Write,
        }
    }
}

/// Completion counter that flush loops wait on.
#[derive(Default)]
pub(crate) struct FlushEvent {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl FlushEvent {
    pub fn current(&self) -> u64 {
        *self.seq.lock()
    }

    pub fn notify(&self) {
        *self.seq.lock() += 1;
        self.cond.notify_all();
    }

    /// Waits until the counter moves past `seen` or `timeout` elapses.
    pub fn wait(&self, seen: u64, timeout: Duration) {
        let mut seq = self.seq.lock();
        if *seq == seen {
            let _ = self.cond.wait_for(&mut seq, timeout);
        }
    }
}

enum ReadOutcome {
    Read,
    Created,
}

fn read_page(file: &MpoolFile, pid: PageId, frame: &mut [u8], create: bool) -> Result<ReadOutcome> {
    let read = file.io().read_upto(file.page_offset(pid.page_no), frame)?;
    if read < frame.len() {
        if read == 0 && create {
            frame.fill(0);
            return Ok(ReadOutcome::Created);
        }
        return Err(MpoolError::ShortRead { page: pid, read });
    }
    file.hooks().page_in(pid, frame, file.cookie())?;
    Ok(ReadOutcome::Read)
}

impl PoolShared {
    pub(crate) fn io_worker(&self, worker: usize) {
        let mut scratch = match aligned_alloc(self.page_size, self.page_size.max(CACHE_LINE)) {
            Ok(buf) => buf,
            Err(err) => {
                error!(worker, error = %err, "pool.io.worker.scratch_failed");
                return;
            }
        };
        debug!(worker, "pool.io.worker.start");
        while let Ok(req) = self.queue.pop() {
            trace!(worker, bh = req.id.0, kind = ?req.kind, "pool.io.worker.request");
            match req.kind {
                IoKind::Read { create } => self.complete_read(req.id, create),
                IoKind::Write => self.complete_write(req.id, &mut scratch),
            }
        }
        debug!(worker, "pool.io.worker.stop");
    }

    fn complete_read(&self, id: BhId, create: bool) {
        let bh = self.bh(id);
        let (pid, file) = {
            let meta = bh.meta.lock();
            (meta.pid, meta.file.clone())
        };
        let (Some(pid), Some(file)) = (pid, file) else {
            error!(bh = id.0, "pool.io.read.unassigned");
            return;
        };
        let result = {
            let mut frame = bh.write();
            read_page(&file, pid, &mut frame, create)
        };
        match result {
            Ok(outcome) => {
                {
                    let mut meta = bh.meta.lock();
                    meta.state = BufferState::Clean;
                }
                bh.io_done.notify_all();
                match outcome {
                    ReadOutcome::Read => bump(&self.counters.reads),
                    ReadOutcome::Created => bump(&self.counters.creates),
                }
                trace!(bh = id.0, page = %pid, "pool.io.read.done");
            }
            Err(err) => {
                bump(&self.counters.read_errors);
                warn!(bh = id.0, page = %pid, error = %err, "pool.io.read_failed");
                self.discard(id, err);
            }
        }
    }

    fn complete_write(&self, id: BhId, scratch: &mut BytesMut) {
        let bh = self.bh(id);
        let (pid, file, newest) = {
            let meta = bh.meta.lock();
            if meta.state != BufferState::Writing {
                error!(bh = id.0, state = ?meta.state, "pool.io.write.unexpected_state");
                return;
            }
            (meta.pid, meta.file.clone(), meta.newest)
        };
        let (Some(pid), Some(file)) = (pid, file) else {
            error!(bh = id.0, "pool.io.write.unassigned");
            return;
        };
        if file.is_dead() {
            bump(&self.counters.dead_drops);
            debug!(bh = id.0, page = %pid, "pool.io.write.dead_file_dropped");
            self.discard(id, MpoolError::Invalid("page of a dead file was dropped"));
            return;
        }
        match self.write_page(id, &file, pid, newest, scratch) {
            Ok(()) => {
                {
                    let mut links = self.flush.lock();
                    let mut meta = bh.meta.lock();
                    links.remove(id);
                    meta.state = BufferState::Clean;
                    meta.oldest = Lsn::ZERO;
                    meta.newest = Lsn::ZERO;
                }
                bh.io_done.notify_all();
                bump(&self.counters.writes);
                trace!(bh = id.0, page = %pid, newest = newest.0, "pool.io.write.done");
            }
            Err(err) => {
                *self.last_io_error.lock() = Some(clone_error(&err));
                self.counters.write_errors.fetch_add(1, Ordering::Release);
                warn!(bh = id.0, page = %pid, error = %err, "pool.io.write_failed");
                self.discard(id, err);
            }
        }
        self.flush_event.notify();
    }

    fn write_page(
        &self,
        id: BhId,
        file: &MpoolFile,
        pid: PageId,
        newest: Lsn,
        scratch: &mut BytesMut,
    ) -> Result<()> {
        if file.is_readonly() {
            return Err(MpoolError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "dirty page in a read-only file",
            )));
        }
        let frame = self.bh(id).write();
        // Write-ahead rule: the log covering this page goes first.
        self.log.flush(newest)?;
        scratch.copy_from_slice(&frame);
        file.hooks().page_out(pid, scratch, file.cookie())?;
        file.io().write_at(file.page_offset(pid.page_no), scratch)?;
        file.note_write();
        drop(frame);
        Ok(())
    }

    /// Invalidates a buffer after an IO failure: it leaves the hash and the
    /// flush list, waiters receive `err`, and the frame is recycled once the
    /// last pin is gone.
    pub(crate) fn discard(&self, id: BhId, err: MpoolError) {
        let bh = self.bh(id);
        let pid = bh.meta.lock().pid;
        let recycle = {
            let chain = pid.map(|pid| self.hash.lock(pid));
            let mut links = self.flush.lock();
            let mut meta = bh.meta.lock();
            if let (Some(mut chain), Some(pid)) = (chain, pid) {
                chain.remove(pid, id);
            }
            links.remove(id);
            meta.state = BufferState::Discarded;
            meta.io_error = Some(err);
            meta.pin == 0 && meta.io_waiters == 0
        };
        bh.io_done.notify_all();
        if recycle {
            self.recycle(id);
        }
    }
}
