#![forbid(unsafe_code)]

//! The buffer pool.
//!
//! A fixed set of frames, each owned by a buffer header, serves pages of the
//! open tablespaces. Lookup goes through the hash index; misses take a frame
//! from the free list or from the eviction scan and are filled by the IO
//! workers. Dirty buffers sit in the flush list ordered by their oldest
//! modification until a worker writes them back.
//!
//! Lock order (lowest first): checkpoint, page latches, hash buckets, log,
//! flush order. Buffer state words, the free list, the file registry and the
//! queue internals are leaves.

mod bh;
mod file;
mod flush;
mod frames;
mod hash;
mod io;
mod lru;
mod page;
mod stats;

pub use bh::{BufferState, PageRead, PageWrite};
pub use file::{FileHandle, MpoolFile, PageHookFn, PageHooks};
pub use flush::FlushEntry;
pub use page::{PinFlags, PinnedPage};
pub use stats::PoolStats;

pub(crate) use bh::BufferHeader;
pub(crate) use io::IoRequest;

use std::io as stdio;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, AdmissionConfig};
use crate::checkpoint::{self, CheckpointOutcome, Checkpointer, RegionSnapshot};
use crate::mtr::Mtr;
use crate::options::{FileOptions, PoolOptions, RegionMode};
use crate::primitives::alloc::{HeapRegion, RegionAllocator, SharedRegion};
use crate::primitives::log::{LogManager, LogOptions};
use crate::primitives::queue::BoundedQueue;
use crate::types::{clone_error, BhId, Lsn, MpoolError, PageId, Result, TxnId};

use file::FileRegistry;
use flush::FlushList;
use frames::FrameArena;
use hash::HashIndex;
use io::FlushEvent;
use lru::LruClock;
use stats::{bump, PoolCounters};

#[derive(Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    fn signal(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    /// Sleeps up to `period`; returns true once shutdown was signalled.
    fn wait(&self, period: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.cond.wait_for(&mut stopped, period);
        }
        *stopped
    }
}

/// State shared by the pool handle, its workers and its background threads.
pub(crate) struct PoolShared {
    pub opts: PoolOptions,
    pub page_size: usize,
    bhs: Box<[BufferHeader]>,
    hash: HashIndex,
    frames: FrameArena,
    lru: LruClock,
    pub flush: FlushList,
    pub queue: BoundedQueue<IoRequest>,
    pub log: LogManager,
    pub files: FileRegistry,
    pub counters: PoolCounters,
    pub ckp: Checkpointer,
    pub admission: Admission,
    last_checked: AtomicUsize,
    flush_event: FlushEvent,
    last_io_error: Mutex<Option<MpoolError>>,
    shutdown: Shutdown,
}

struct Candidate {
    priority: u32,
    dirty: bool,
    /// Oldest modification LSN when dirty, last-touch tick when clean.
    age: u64,
    bucket: usize,
    id: BhId,
    pid: PageId,
}

impl Candidate {
    /// Lower priority wins; on a tie clean beats dirty, and only then is
    /// `age` compared, so LSNs and ticks never meet.
    fn beats(&self, other: &Candidate) -> bool {
        (self.priority, self.dirty, self.age) < (other.priority, other.dirty, other.age)
    }
}

impl PoolShared {
    pub(crate) fn bh(&self, id: BhId) -> &BufferHeader {
        &self.bhs[id.index()]
    }

    pub(crate) fn note_checkpoint(&self, completed: bool) {
        if completed {
            bump(&self.counters.checkpoints);
        } else {
            bump(&self.counters.checkpoints_skipped);
        }
    }

    pub(crate) fn dirty_boost(&self) -> u32 {
        self.lru.dirty_boost()
    }

    /// Pins `page_no` of `file`, bringing it in when absent.
    pub(crate) fn pin_page(&self, file: &Arc<MpoolFile>, page_no: u32, flags: PinFlags) -> Result<BhId> {
        let pid = PageId {
            space: file.id(),
            page_no,
        };
        loop {
            if let Some(id) = self.pin_resident(pid)? {
                return Ok(id);
            }
            let id = self.alloc_frame()?;
            let mut chain = self.hash.lock(pid);
            if chain.lookup(pid).is_some() {
                // Someone else brought the page in meanwhile.
                drop(chain);
                self.frames.push_free(id);
                continue;
            }
            {
                let mut meta = self.bh(id).meta.lock();
                meta.assign(pid, Arc::clone(file), BufferState::Reading);
                meta.priority = self.lru.now();
                meta.touched = meta.priority;
                chain.insert(pid, id, meta.priority);
            }
            drop(chain);
            bump(&self.counters.misses);
            self.fill_frame(id, pid, file, flags)?;
            return Ok(id);
        }
    }

    /// Pins a resident page, waiting out any IO in flight on it.
    fn pin_resident(&self, pid: PageId) -> Result<Option<BhId>> {
        let chain = self.hash.lock(pid);
        let Some(id) = chain.lookup(pid) else {
            return Ok(None);
        };
        let bh = self.bh(id);
        let mut meta = bh.meta.lock();
        drop(chain);
        match meta.state {
            BufferState::Clean | BufferState::Dirty => {
                meta.add_pin()?;
                bump(&self.counters.hits);
                Ok(Some(id))
            }
            BufferState::Reading | BufferState::Writing => {
                meta.add_pin()?;
                meta.io_waiters += 1;
                bump(&self.counters.io_waits);
                bh.wait_io(&mut meta);
                meta.io_waiters -= 1;
                if meta.state == BufferState::Discarded {
                    let err = meta
                        .io_error
                        .as_ref()
                        .map(clone_error)
                        .unwrap_or(MpoolError::Corruption("discarded buffer without error"));
                    drop(meta);
                    self.unpin(id);
                    return Err(err);
                }
                bump(&self.counters.hits);
                Ok(Some(id))
            }
            BufferState::Empty | BufferState::Discarded => {
                error!(bh = id.0, page = %pid, state = ?meta.state, "pool.hash.stale_entry");
                Err(MpoolError::Corruption("hash invariant broken"))
            }
        }
    }

    /// Fills a freshly hashed buffer in the `Reading` state.
    fn fill_frame(&self, id: BhId, pid: PageId, file: &MpoolFile, flags: PinFlags) -> Result<()> {
        let bh = self.bh(id);
        let beyond_eof = if flags.create {
            match file.beyond_eof(pid.page_no) {
                Ok(beyond) => beyond,
                Err(err) => return Err(self.abandon_fill(id, err)),
            }
        } else {
            false
        };
        if beyond_eof {
            bh.write().fill(0);
            bh.meta.lock().state = BufferState::Clean;
            bh.io_done.notify_all();
            bump(&self.counters.creates);
            debug!(bh = id.0, page = %pid, "pool.pin.created");
            return Ok(());
        }
        if let Err(err) = self.queue.push(IoRequest::read(id, flags.create)) {
            return Err(self.abandon_fill(id, err));
        }
        let mut meta = bh.meta.lock();
        bh.wait_io(&mut meta);
        if meta.state == BufferState::Discarded {
            let err = meta
                .io_error
                .as_ref()
                .map(clone_error)
                .unwrap_or(MpoolError::Corruption("discarded buffer without error"));
            drop(meta);
            self.unpin(id);
            return Err(err);
        }
        Ok(())
    }

    fn abandon_fill(&self, id: BhId, err: MpoolError) -> MpoolError {
        let ret = clone_error(&err);
        self.discard(id, err);
        self.unpin(id);
        ret
    }

    /// Releases one pin and recomputes the buffer's replacement priority.
    pub(crate) fn unpin(&self, id: BhId) {
        let bh = self.bh(id);
        let tick = self.lru.tick();
        let (pid, priority, recycle) = {
            let mut meta = bh.meta.lock();
            debug_assert!(meta.pin > 0, "unpin of an unpinned buffer");
            meta.pin = meta.pin.saturating_sub(1);
            let dirty = meta.state == BufferState::Dirty;
            meta.priority = if meta.discardable {
                0
            } else {
                self.lru.priority(meta.class, tick.now, dirty)
            };
            meta.touched = tick.now;
            let recycle =
                meta.state == BufferState::Discarded && meta.pin == 0 && meta.io_waiters == 0;
            (meta.pid, meta.priority, recycle)
        };
        if recycle {
            self.recycle(id);
        } else if let Some(pid) = pid {
            self.hash.bucket_for(pid).lower_hint(priority);
        }
        if tick.rebase {
            self.rebase_priorities();
        }
    }

    /// Returns a discarded or evicted buffer to the free list.
    pub(crate) fn recycle(&self, id: BhId) {
        let file = self.bh(id).meta.lock().reset();
        if let Some(file) = file {
            if file.block_released() {
                self.files.discard(&file);
            }
        }
        self.frames.push_free(id);
    }

    fn rebase_priorities(&self) {
        let dec = self.lru.rebase_counter();
        for bh in self.bhs.iter() {
            let mut meta = bh.meta.lock();
            meta.priority = meta.priority.saturating_sub(dec);
            meta.touched = meta.touched.saturating_sub(dec);
        }
        for idx in 0..self.hash.len() {
            self.hash.bucket(idx).reset_hint(0);
        }
        self.lru.finish_rebase();
        info!(decrement = dec, "pool.lru.rebase");
    }

    /// Finds a frame for a new page: the free list first, then eviction.
    fn alloc_frame(&self) -> Result<BhId> {
        let delay = Duration::from_micros(self.opts.eviction_retry_delay_us);
        for _ in 0..self.opts.eviction_retries.max(1) {
            if let Some(id) = self.frames.pop_free() {
                return Ok(id);
            }
            if let Some(id) = self.evict()? {
                return Ok(id);
            }
            if self.queue.is_closed() {
                return Err(MpoolError::QueueClosed);
            }
            bump(&self.counters.alloc_retries);
            thread::sleep(delay);
        }
        warn!(
            pool_pages = self.bhs.len(),
            dirty = self.flush.lock().len(),
            "pool.alloc.out_of_frames"
        );
        Err(MpoolError::OutOfFrames)
    }

    /// One eviction pass. Returns a reclaimed empty buffer, or `None` when
    /// nothing clean was evictable; dirty candidates met on the way are
    /// handed to the IO workers so a retry can succeed.
    fn evict(&self) -> Result<Option<BhId>> {
        let n = self.hash.len();
        let start = self.last_checked.load(Ordering::Relaxed) % n;
        let mut best: Option<Candidate> = None;
        let mut writes = Vec::new();
        for step in 0..n {
            let b = (start + step) % n;
            let bucket = self.hash.bucket(b);
            let hint = bucket.hint();
            if hint == u32::MAX || best.as_ref().is_some_and(|c| hint > c.priority) {
                continue;
            }
            let chain = bucket.lock();
            let mut min_priority = u32::MAX;
            let mut local: Option<Candidate> = None;
            for &(pid, id) in chain.entries() {
                let meta = self.bh(id).meta.lock();
                min_priority = min_priority.min(meta.priority);
                if meta.pin > 0 || !meta.state.is_valid() {
                    continue;
                }
                let dirty = meta.state == BufferState::Dirty;
                let cand = Candidate {
                    priority: meta.priority,
                    dirty,
                    age: if dirty {
                        meta.oldest.0
                    } else {
                        u64::from(meta.touched)
                    },
                    bucket: b,
                    id,
                    pid,
                };
                if local.as_ref().map_or(true, |l| cand.beats(l)) {
                    local = Some(cand);
                }
            }
            chain.set_hint(min_priority);
            let Some(cand) = local else {
                continue;
            };
            if cand.dirty {
                let mut meta = self.bh(cand.id).meta.lock();
                if meta.writable_now() {
                    meta.state = BufferState::Writing;
                    writes.push(cand.id);
                }
                continue;
            }
            if best.as_ref().map_or(true, |b| cand.beats(b)) {
                let stop = cand.priority == 0;
                best = Some(cand);
                if stop {
                    break;
                }
            }
        }
        self.dispatch_writes(writes)?;
        let Some(victim) = best else {
            return Ok(None);
        };
        let file = {
            let mut chain = self.hash.bucket(victim.bucket).lock();
            let mut meta = self.bh(victim.id).meta.lock();
            if meta.pid != Some(victim.pid) || meta.pin > 0 || meta.state != BufferState::Clean {
                return Ok(None);
            }
            chain.remove(victim.pid, victim.id);
            meta.reset()
        };
        self.last_checked
            .store((victim.bucket + 1) % n, Ordering::Relaxed);
        bump(&self.counters.evictions);
        debug!(
            bh = victim.id.0,
            page = %victim.pid,
            priority = victim.priority,
            "pool.evict.victim"
        );
        if let Some(file) = file {
            if file.block_released() {
                self.files.discard(&file);
            }
        }
        Ok(Some(victim.id))
    }

    fn dispatch_writes(&self, ids: Vec<BhId>) -> Result<()> {
        let mut ids = ids.into_iter();
        while let Some(id) = ids.next() {
            bump(&self.counters.dirty_writebacks);
            if let Err(err) = self.queue.push(IoRequest::write(id)) {
                self.revert_writing(id);
                for rest in ids {
                    self.revert_writing(rest);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn revert_writing(&self, id: BhId) {
        let bh = self.bh(id);
        bh.meta.lock().state = BufferState::Dirty;
        bh.io_done.notify_all();
    }

    /// Starts a write of every listed buffer that is dirty and unpinned.
    pub(crate) fn schedule_writes(&self, ids: &[BhId]) -> Result<usize> {
        let mut ready = Vec::with_capacity(ids.len());
        for &id in ids {
            let mut meta = self.bh(id).meta.lock();
            if meta.writable_now() {
                meta.state = BufferState::Writing;
                ready.push(id);
            }
        }
        let queued = ready.len();
        self.dispatch_writes(ready)?;
        Ok(queued)
    }

    /// Writes back every flush-list buffer selected by `pred` and waits until
    /// none is left. Pinned dirty buffers are retried until the flush
    /// timeout; a write failure during the wait aborts with that error.
    pub(crate) fn flush_until<F>(&self, what: &'static str, pred: F) -> Result<()>
    where
        F: Fn(BhId, Lsn) -> bool,
    {
        let errors_before = self.counters.write_errors();
        let deadline =
            Instant::now() + Duration::from_millis(self.opts.checkpoint_flush_timeout_ms);
        loop {
            let pending: Vec<BhId> = {
                let links = self.flush.lock();
                links
                    .iter()
                    .filter(|&(id, lsn)| pred(id, lsn))
                    .map(|(id, _)| id)
                    .collect()
            };
            if self.counters.write_errors() > errors_before {
                return Err(self.last_write_error());
            }
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(what, pending = pending.len(), "pool.flush.timeout");
                return Err(MpoolError::Timeout(what));
            }
            let seen = self.flush_event.current();
            self.schedule_writes(&pending)?;
            self.flush_event.wait(seen, Duration::from_millis(10));
        }
    }

    fn last_write_error(&self) -> MpoolError {
        self.last_io_error
            .lock()
            .as_ref()
            .map(clone_error)
            .unwrap_or_else(|| MpoolError::Io(stdio::Error::other("page write failed")))
    }

    /// Fsyncs every file written since its last sync.
    pub(crate) fn sync_files(&self) -> Result<()> {
        for file in self.files.all() {
            if file.sync_if_needed()? {
                debug!(file = file.id().0, "pool.file.sync");
            }
        }
        Ok(())
    }

    pub(crate) fn flush_everything(&self) -> Result<()> {
        self.flush_until("flush all", |_, _| true)?;
        self.sync_files()?;
        self.log.flush_all()
    }

    fn sync_one(&self, file: &Arc<MpoolFile>) -> Result<()> {
        let space = file.id();
        self.flush_until("sync file", |id, _| {
            self.bh(id)
                .meta
                .lock()
                .pid
                .is_some_and(|pid| pid.space == space)
        })?;
        file.sync_if_needed()?;
        Ok(())
    }

    fn run_cleaner(&self) {
        let period = Duration::from_millis(self.opts.flusher_interval_ms);
        let target = self.bhs.len() * usize::from(self.opts.dirty_flush_pct) / 100;
        while !self.shutdown.wait(period) {
            let excess: Vec<BhId> = {
                let links = self.flush.lock();
                if links.len() <= target {
                    continue;
                }
                links
                    .iter()
                    .take(links.len() - target)
                    .map(|(id, _)| id)
                    .collect()
            };
            match self.schedule_writes(&excess) {
                Ok(queued) => debug!(candidates = excess.len(), queued, "pool.cleaner.pass"),
                Err(err) => {
                    warn!(error = %err, "pool.cleaner.failed");
                    break;
                }
            }
        }
        debug!("pool.cleaner.stop");
    }

    fn run_checkpointer(&self) {
        let period = Duration::from_millis(self.opts.checkpoint_interval_ms);
        while !self.shutdown.wait(period) {
            match checkpoint::run(self, false) {
                Ok(_) => {}
                // Pinned pages held past the flush timeout; the next period retries.
                Err(err) if err.is_transient() => {
                    debug!(error = %err, "checkpoint.background.deferred")
                }
                Err(err) => warn!(error = %err, "checkpoint.background.failed"),
            }
        }
        debug!("checkpoint.background.stop");
    }

    fn verify(&self) -> Result<()> {
        let mut seen = FxHashSet::default();
        for idx in 0..self.hash.len() {
            let chain = self.hash.bucket(idx).lock();
            for &(pid, id) in chain.entries() {
                if !seen.insert(pid) {
                    error!(page = %pid, "pool.verify.duplicate_page");
                    return Err(MpoolError::Corruption("hash invariant broken"));
                }
                let meta = self.bh(id).meta.lock();
                if meta.pid != Some(pid)
                    || matches!(meta.state, BufferState::Empty | BufferState::Discarded)
                {
                    error!(page = %pid, bh = id.0, state = ?meta.state, "pool.verify.stale_entry");
                    return Err(MpoolError::Corruption("hash invariant broken"));
                }
            }
        }
        let links = self.flush.lock();
        let mut prev = Lsn::ZERO;
        for (id, lsn) in links.iter() {
            if lsn < prev {
                error!(bh = id.0, lsn = lsn.0, prev = prev.0, "pool.verify.flush_order");
                return Err(MpoolError::Corruption("flush list out of order"));
            }
            prev = lsn;
            let meta = self.bh(id).meta.lock();
            let linked_ok = matches!(meta.state, BufferState::Dirty | BufferState::Writing)
                && meta.oldest == lsn
                && meta.oldest <= meta.newest;
            if !linked_ok {
                error!(bh = id.0, state = ?meta.state, "pool.verify.flush_entry");
                return Err(MpoolError::Corruption("flush list entry not dirty"));
            }
        }
        for bh in self.bhs.iter() {
            let dirty = bh.meta.lock().state == BufferState::Dirty;
            if dirty && !links.contains(bh.id) {
                error!(bh = bh.id.0, "pool.verify.dirty_unlinked");
                return Err(MpoolError::Corruption("dirty buffer missing from flush list"));
            }
        }
        Ok(())
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            pool_pages: self.bhs.len(),
            free_frames: self.frames.free_len(),
            dirty_pages: self.flush.lock().len(),
            queue: self.queue.stats(),
            log: self.log.stats(),
            admission: self.admission.stats(),
            ..PoolStats::default()
        };
        self.counters.fill(&mut stats);
        stats
    }
}

/// Handle on a buffer pool.
///
/// All pool operations go through this handle. [`Pool::close`] flushes and
/// shuts down cleanly; dropping the handle stops the threads without
/// flushing.
pub struct Pool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    closed: bool,
}

impl Pool {
    /// Reserves the frames, opens the log and starts the worker threads.
    pub fn open(opts: PoolOptions) -> Result<Self> {
        opts.validate()?;
        let page_size = opts.page_size as usize;
        let region: Box<dyn RegionAllocator> = match opts.region {
            RegionMode::Heap => Box::new(HeapRegion::new()),
            RegionMode::Shared { bytes } => Box::new(SharedRegion::new(bytes)?),
        };
        let (frames, bufs) = FrameArena::reserve(region, opts.pool_pages, page_size)?;
        let bhs: Box<[BufferHeader]> = bufs
            .into_iter()
            .enumerate()
            .map(|(idx, frame)| BufferHeader::new(BhId(idx as u32), frame))
            .collect();
        let log = LogManager::open(LogOptions {
            path: opts.log_path.clone(),
            buffer_bytes: opts.log_buffer_bytes,
            capacity_bytes: opts.log_capacity_bytes,
            sync: opts.log_sync,
            env_id: opts.env_id,
        })?;
        let ckp = Checkpointer::new(log.header(), log.current_lsn());
        let shared = Arc::new(PoolShared {
            page_size,
            hash: HashIndex::new(opts.pool_pages),
            lru: LruClock::new(opts.pool_pages),
            flush: FlushList::new(opts.pool_pages),
            queue: BoundedQueue::with_resume(opts.write_queue_limit, opts.queue_resume()),
            files: FileRegistry::new(page_size, opts.recursion_limit),
            counters: PoolCounters::default(),
            admission: Admission::new(AdmissionConfig::from(&opts)),
            last_checked: AtomicUsize::new(0),
            flush_event: FlushEvent::default(),
            last_io_error: Mutex::new(None),
            shutdown: Shutdown::default(),
            bhs,
            frames,
            log,
            ckp,
            opts,
        });
        let mut pool = Self {
            shared,
            workers: Vec::new(),
            background: Vec::new(),
            closed: false,
        };
        pool.start_threads()?;
        let opts = &pool.shared.opts;
        info!(
            pool_pages = opts.pool_pages,
            page_size = opts.page_size,
            io_workers = opts.io_workers,
            region = ?opts.region,
            log = ?opts.log_path,
            "pool.open"
        );
        Ok(pool)
    }

    fn start_threads(&mut self) -> Result<()> {
        for idx in 0..self.shared.opts.io_workers {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("mpool-io-{idx}"))
                .spawn(move || shared.io_worker(idx))?;
            self.workers.push(handle);
        }
        if self.shared.opts.flusher_interval_ms > 0 {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("mpool-cleaner".into())
                .spawn(move || shared.run_cleaner())?;
            self.background.push(handle);
        }
        if self.shared.opts.checkpoint_interval_ms > 0 {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("mpool-checkpoint".into())
                .spawn(move || shared.run_checkpointer())?;
            self.background.push(handle);
        }
        Ok(())
    }

    fn stop_background(&mut self) {
        self.shared.shutdown.signal();
        for handle in self.background.drain(..) {
            if handle.join().is_err() {
                error!("pool.background.panicked");
            }
        }
    }

    fn stop_workers(&mut self) {
        self.shared.queue.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("pool.io.worker.panicked");
            }
        }
    }

    pub(crate) fn shared(&self) -> &PoolShared {
        &self.shared
    }

    /// Options the pool was opened with.
    pub fn options(&self) -> &PoolOptions {
        &self.shared.opts
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.shared.page_size
    }

    /// Registers page-in/page-out hooks for a file type.
    pub fn register_file_type(&self, file_type: u32, hooks: PageHooks) {
        self.shared.files.register_type(file_type, hooks);
    }

    /// Opens (or re-opens) a tablespace file.
    pub fn open_file(&self, path: impl AsRef<Path>, opts: FileOptions) -> Result<FileHandle> {
        self.shared.files.open(&self.shared, path.as_ref(), opts)
    }

    /// Pins a page, reading it in if needed.
    pub fn pin(&self, file: &FileHandle, page_no: u32, flags: PinFlags) -> Result<PinnedPage<'_>> {
        self.check_handle(file)?;
        let id = self.shared.pin_page(file.file(), page_no, flags)?;
        Ok(PinnedPage::new(&self.shared, id, file.page_id(page_no)))
    }

    pub(crate) fn check_handle(&self, file: &FileHandle) -> Result<()> {
        if file.belongs_to(&self.shared) {
            Ok(())
        } else {
            Err(MpoolError::Invalid("file handle belongs to another pool"))
        }
    }

    /// Starts a mini-transaction.
    pub fn mtr(&self) -> Mtr<'_> {
        Mtr::new(self)
    }

    /// Runs a checkpoint; without `force` it is skipped below the thresholds.
    pub fn checkpoint(&self, force: bool) -> Result<CheckpointOutcome> {
        checkpoint::run(&self.shared, force)
    }

    /// LSN recorded by the last completed checkpoint.
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.shared.ckp.last_checkpoint_lsn()
    }

    /// LSN the next log write will start at.
    pub fn current_lsn(&self) -> Lsn {
        self.shared.log.current_lsn()
    }

    /// Writes the whole log out.
    pub fn flush_log(&self) -> Result<()> {
        self.shared.log.flush_all()
    }

    /// Registers a transaction with no begin LSN yet.
    pub fn begin_txn(&self) -> TxnId {
        self.shared.ckp.txns().begin()
    }

    /// Sets the begin LSN of an active transaction.
    pub fn set_txn_begin_lsn(&self, txn: TxnId, lsn: Lsn) -> Result<()> {
        self.shared.ckp.txns().set_begin_lsn(txn, lsn)
    }

    /// Removes a transaction from the active list.
    pub fn end_txn(&self, txn: TxnId) -> Result<()> {
        self.shared.ckp.txns().end(txn)
    }

    /// Writes every dirty page of `file` and fsyncs it.
    pub fn sync_file(&self, file: &FileHandle) -> Result<()> {
        self.check_handle(file)?;
        self.shared.sync_one(file.file())
    }

    /// Writes every dirty page, fsyncs the files and flushes the log.
    pub fn flush_all(&self) -> Result<()> {
        self.shared.flush_everything()
    }

    /// Checks hash uniqueness, flush-list order and dirty-buffer linkage.
    pub fn verify(&self) -> Result<()> {
        self.shared.verify()
    }

    /// Activity counters.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Flush list from oldest to newest modification.
    pub fn flush_list_snapshot(&self) -> Vec<FlushEntry> {
        let links = self.shared.flush.lock();
        links
            .iter()
            .filter_map(|(id, oldest)| {
                let meta = self.shared.bh(id).meta.lock();
                meta.pid.map(|page| FlushEntry {
                    bh: id,
                    page,
                    oldest,
                    newest: meta.newest,
                })
            })
            .collect()
    }

    /// Pages currently held by valid buffers.
    pub fn resident_pages(&self) -> Vec<PageId> {
        let mut pages: Vec<PageId> = self
            .shared
            .bhs
            .iter()
            .filter_map(|bh| {
                let meta = bh.meta.lock();
                let held = meta.state.is_valid() || meta.state == BufferState::Writing;
                held.then_some(meta.pid).flatten()
            })
            .collect();
        pages.sort_unstable();
        pages
    }

    /// Region header, active transactions and statistics.
    pub fn region_snapshot(&self) -> RegionSnapshot {
        self.shared
            .ckp
            .snapshot(self.shared.stats(), self.shared.frames.usage())
    }

    /// The admission controller.
    pub fn admission(&self) -> &Admission {
        &self.shared.admission
    }

    /// Flushes everything, stops the threads and returns the frames to the
    /// region allocator, which validates its guard bytes.
    pub fn close(mut self) -> Result<()> {
        self.stop_background();
        let flushed = self.shared.flush_everything();
        self.stop_workers();
        self.closed = true;
        let frames = self.shared.bhs.iter().map(|bh| bh.take_frame()).collect();
        let released = self.shared.frames.release(frames);
        match (&flushed, &released) {
            (Ok(()), Ok(())) => info!("pool.close"),
            _ => warn!(
                flush_ok = flushed.is_ok(),
                release_ok = released.is_ok(),
                "pool.close.incomplete"
            ),
        }
        flushed.and(released)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.stop_background();
        self.stop_workers();
        let dirty = self.shared.flush.lock().len();
        if dirty > 0 {
            warn!(dirty, "pool.drop.dirty_pages_lost");
        }
    }
}
