#![forbid(unsafe_code)]

//! Mini-transactions.
//!
//! An [`Mtr`] collects latched pages and log bytes, then commits them as one
//! atomic log write. Commit links every modified page into the flush list
//! while still ordered behind the log mutex, so the flush list stays sorted
//! by the LSN of each page's first modification.
//!
//! Dropping an mtr that was neither committed nor aborted releases its memo
//! and then panics.

use std::fmt;
use std::sync::Arc;
use std::thread;

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::pool::{
    BufferState, FileHandle, MpoolFile, PageRead, PageWrite, PinFlags, Pool, PoolShared,
};
use crate::primitives::log::{LsnRange, MULTI_REC_END, SINGLE_REC_FLAG};
use crate::types::{BhId, MpoolError, PageId, Result, TxnId};

/// How a page is held by a mini-transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LatchMode {
    /// Shared page latch.
    Shared,
    /// Exclusive page latch; required by [`Mtr::modify`].
    Exclusive,
}

/// Index of an entry in a mini-transaction's memo.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemoSlot(usize);

enum MemoEntry<'a> {
    PageS {
        id: BhId,
        pid: PageId,
        guard: PageRead<'a>,
    },
    PageX {
        id: BhId,
        pid: PageId,
        guard: PageWrite<'a>,
        before: Option<Box<[u8]>>,
    },
    BufferFix {
        id: BhId,
    },
    Latch {
        file: Arc<MpoolFile>,
    },
}

impl MemoEntry<'_> {
    fn kind(&self) -> &'static str {
        match self {
            MemoEntry::PageS { .. } => "page-s",
            MemoEntry::PageX { .. } => "page-x",
            MemoEntry::BufferFix { .. } => "buffer-fix",
            MemoEntry::Latch { .. } => "latch",
        }
    }
}

/// A mini-transaction.
pub struct Mtr<'a> {
    pool: &'a Pool,
    memo: SmallVec<[MemoEntry<'a>; 8]>,
    log: Vec<u8>,
    n_records: usize,
    txn: Option<TxnId>,
    finished: bool,
}

impl<'a> Mtr<'a> {
    pub(crate) fn new(pool: &'a Pool) -> Self {
        Self {
            pool,
            memo: SmallVec::new(),
            log: Vec::new(),
            n_records: 0,
            txn: None,
            finished: false,
        }
    }

    fn shared(&self) -> &'a PoolShared {
        self.pool.shared()
    }

    /// Binds the mtr to a registered transaction; its first commit sets the
    /// transaction's begin LSN.
    pub fn bind_txn(&mut self, txn: TxnId) {
        self.txn = Some(txn);
    }

    /// Pins a page and latches it in `mode`.
    ///
    /// A page already latched by this mtr is returned from the memo: an
    /// exclusive latch serves either mode, a shared latch serves shared
    /// requests, and asking to upgrade shared to exclusive is rejected.
    pub fn get_page(
        &mut self,
        file: &FileHandle,
        page_no: u32,
        mode: LatchMode,
        flags: PinFlags,
    ) -> Result<MemoSlot> {
        self.pool.check_handle(file)?;
        let pid = file.page_id(page_no);
        if let Some(slot) = self.latched(pid, mode)? {
            trace!(page = %pid, ?mode, "mtr.page.reused");
            return Ok(slot);
        }
        let shared = self.shared();
        let id = shared.pin_page(file.file(), page_no, flags)?;
        let bh = shared.bh(id);
        let entry = match mode {
            LatchMode::Shared => MemoEntry::PageS {
                id,
                pid,
                guard: bh.read(),
            },
            LatchMode::Exclusive => MemoEntry::PageX {
                id,
                pid,
                guard: bh.write(),
                before: None,
            },
        };
        trace!(page = %pid, bh = id.0, ?mode, "mtr.page.latched");
        Ok(self.push(entry))
    }

    fn latched(&self, pid: PageId, mode: LatchMode) -> Result<Option<MemoSlot>> {
        for (at, entry) in self.memo.iter().enumerate() {
            match entry {
                MemoEntry::PageX { pid: held, .. } if *held == pid => {
                    return Ok(Some(MemoSlot(at)));
                }
                MemoEntry::PageS { pid: held, .. } if *held == pid => {
                    return match mode {
                        LatchMode::Shared => Ok(Some(MemoSlot(at))),
                        LatchMode::Exclusive => Err(MpoolError::protocol(
                            "page already latched shared by this mini-transaction",
                        )),
                    };
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Pins a page without latching it.
    pub fn buffer_fix(&mut self, file: &FileHandle, page_no: u32, flags: PinFlags) -> Result<MemoSlot> {
        self.pool.check_handle(file)?;
        let id = self.shared().pin_page(file.file(), page_no, flags)?;
        Ok(self.push(MemoEntry::BufferFix { id }))
    }

    /// Takes the file's recursive mutex until the mtr ends.
    #[track_caller]
    pub fn lock_file(&mut self, file: &FileHandle) -> Result<MemoSlot> {
        self.pool.check_handle(file)?;
        file.file().mutex().acquire()?;
        Ok(self.push(MemoEntry::Latch {
            file: Arc::clone(file.file()),
        }))
    }

    fn push(&mut self, entry: MemoEntry<'a>) -> MemoSlot {
        self.memo.push(entry);
        MemoSlot(self.memo.len() - 1)
    }

    /// Frame of a latched page.
    #[track_caller]
    pub fn page(&self, slot: MemoSlot) -> Result<&[u8]> {
        match self.memo.get(slot.0) {
            Some(MemoEntry::PageS { guard, .. }) => Ok(&guard[..]),
            Some(MemoEntry::PageX { guard, .. }) => Ok(&guard[..]),
            _ => Err(MpoolError::protocol("memo slot holds no page latch")),
        }
    }

    /// Mutable frame of an exclusively latched page. The first call snapshots
    /// the page so an abort can restore it.
    #[track_caller]
    pub fn modify(&mut self, slot: MemoSlot) -> Result<&mut [u8]> {
        match self.memo.get_mut(slot.0) {
            Some(MemoEntry::PageX { guard, before, .. }) => {
                if before.is_none() {
                    *before = Some(Box::from(&guard[..]));
                }
                Ok(&mut guard[..])
            }
            Some(MemoEntry::PageS { .. }) => {
                Err(MpoolError::protocol("modify requires an exclusive latch"))
            }
            _ => Err(MpoolError::protocol("memo slot holds no page latch")),
        }
    }

    /// Page identity behind a page slot.
    pub fn page_id(&self, slot: MemoSlot) -> Option<PageId> {
        match self.memo.get(slot.0)? {
            MemoEntry::PageS { pid, .. } | MemoEntry::PageX { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    /// Appends one log record.
    pub fn append_log(&mut self, record: &[u8]) {
        if record.is_empty() {
            return;
        }
        self.log.extend_from_slice(record);
        self.n_records += 1;
    }

    /// Records appended so far.
    pub fn n_records(&self) -> usize {
        self.n_records
    }

    /// Log bytes buffered so far, before framing.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    fn modified(&self) -> impl Iterator<Item = BhId> + '_ {
        self.memo.iter().filter_map(|entry| match entry {
            MemoEntry::PageX {
                id,
                before: Some(_),
                ..
            } => Some(*id),
            _ => None,
        })
    }

    /// Writes the log, links modified pages into the flush list and releases
    /// the memo. Returns the LSN range written, or `None` when there was no
    /// log to write.
    ///
    /// On failure the mtr is aborted: modified pages get their before-images
    /// back and nothing is marked dirty.
    #[track_caller]
    pub fn commit(mut self) -> Result<Option<LsnRange>> {
        let has_changes = self.modified().next().is_some();
        if self.log.is_empty() {
            if has_changes {
                let err = MpoolError::protocol("pages modified without log records");
                self.rollback();
                return Err(err);
            }
            self.release_memo();
            return Ok(None);
        }
        self.frame_records();
        match self.write_and_link() {
            Ok(range) => {
                debug!(
                    start = range.start.0,
                    end = range.end.0,
                    records = self.n_records,
                    pages = self.modified().count(),
                    "mtr.commit"
                );
                self.release_memo();
                Ok(Some(range))
            }
            Err(err) => {
                warn!(error = %err, "mtr.commit.failed");
                self.rollback();
                Err(err)
            }
        }
    }

    fn frame_records(&mut self) {
        if self.n_records > 1 {
            self.log.push(MULTI_REC_END);
        } else if let Some(first) = self.log.first_mut() {
            *first |= SINGLE_REC_FLAG;
        }
    }

    fn write_and_link(&self) -> Result<LsnRange> {
        let shared = self.shared();
        let mut log = shared.log.lock_for_append();
        let range = log.append(&self.log)?;
        // Under the log mutex, so a checkpoint that reads the current LSN
        // after this append also sees the transaction's begin LSN.
        if let Some(txn) = self.txn {
            shared.ckp.txns().note_commit(txn, range.start);
        }
        // Taken before the log mutex is released so commits reach the flush
        // list in LSN order.
        let mut links = shared.flush.lock();
        drop(log);
        let boost = shared.dirty_boost();
        for id in self.modified() {
            let mut meta = shared.bh(id).meta.lock();
            if meta.state == BufferState::Clean {
                meta.state = BufferState::Dirty;
                meta.oldest = range.start;
            }
            meta.newest = range.end;
            meta.priority = meta.priority.max(boost);
            links.insert(id, meta.oldest);
        }
        Ok(range)
    }

    /// Restores before-images and releases the memo without writing log.
    pub fn abort(mut self) {
        debug!(records = self.n_records, "mtr.abort");
        self.rollback();
    }

    fn rollback(&mut self) {
        for entry in self.memo.iter_mut() {
            if let MemoEntry::PageX {
                guard,
                before: Some(image),
                ..
            } = entry
            {
                guard.copy_from_slice(image);
            }
        }
        self.release_memo();
    }

    fn release_memo(&mut self) {
        self.finished = true;
        let shared = self.shared();
        while let Some(entry) = self.memo.pop() {
            match entry {
                MemoEntry::PageS { id, guard, .. } => {
                    drop(guard);
                    shared.unpin(id);
                }
                MemoEntry::PageX { id, guard, .. } => {
                    drop(guard);
                    shared.unpin(id);
                }
                MemoEntry::BufferFix { id } => shared.unpin(id),
                MemoEntry::Latch { file } => {
                    if let Err(err) = file.mutex().release() {
                        warn!(file = file.id().0, error = %err, "mtr.latch.release_failed");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Mtr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = self.memo.iter().map(MemoEntry::kind).collect();
        f.debug_struct("Mtr")
            .field("memo", &kinds)
            .field("log_len", &self.log.len())
            .field("n_records", &self.n_records)
            .field("txn", &self.txn)
            .finish()
    }
}

impl Drop for Mtr<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.release_memo();
        if !thread::panicking() {
            panic!("mini-transaction dropped without commit or abort");
        }
    }
}
