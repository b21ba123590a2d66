#![forbid(unsafe_code)]

//! Open tablespace files, their handles and page conversion hooks.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::PoolShared;
use crate::options::{CachePriority, FileOptions};
use crate::primitives::concurrency::{DebugRecursiveMutex, LatchKind};
use crate::primitives::io::{FileIo, IoCapabilities, OpenFlags, StdFileIo};
use crate::types::{FileId, MpoolError, PageId, Result};

/// Page conversion callback: `(page, frame, cookie)`.
pub type PageHookFn =
    Arc<dyn Fn(PageId, &mut [u8], &[u8]) -> std::result::Result<(), String> + Send + Sync>;

/// Page-in and page-out conversions registered for a file type.
///
/// `pgin` runs on a freshly read frame before it becomes visible; `pgout` runs
/// on a copy of the frame just before it is written. A missing hook is the
/// identity.
#[derive(Clone, Default)]
pub struct PageHooks {
    pgin: Option<PageHookFn>,
    pgout: Option<PageHookFn>,
}

impl PageHooks {
    /// Hooks that leave pages untouched.
    pub fn identity() -> Self {
        Self::default()
    }

    /// Hooks from explicit page-in and page-out functions.
    pub fn new<I, O>(pgin: I, pgout: O) -> Self
    where
        I: Fn(PageId, &mut [u8], &[u8]) -> std::result::Result<(), String> + Send + Sync + 'static,
        O: Fn(PageId, &mut [u8], &[u8]) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            pgin: Some(Arc::new(pgin)),
            pgout: Some(Arc::new(pgout)),
        }
    }

    /// Sets only the page-in hook.
    pub fn with_pgin<I>(mut self, pgin: I) -> Self
    where
        I: Fn(PageId, &mut [u8], &[u8]) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.pgin = Some(Arc::new(pgin));
        self
    }

    /// Sets only the page-out hook.
    pub fn with_pgout<O>(mut self, pgout: O) -> Self
    where
        O: Fn(PageId, &mut [u8], &[u8]) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.pgout = Some(Arc::new(pgout));
        self
    }

    /// Stamps a CRC-32 of the page body into the last four bytes on write and
    /// verifies it on read. All-zero pages (never written) pass.
    pub fn crc32() -> Self {
        Self::new(
            |pid, frame, _cookie| {
                if frame.iter().all(|&b| b == 0) {
                    return Ok(());
                }
                let (body, tail) = frame.split_at(frame.len() - 4);
                let stored = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
                let actual = crc32fast::hash(body);
                if stored != actual {
                    return Err(format!(
                        "checksum mismatch on {pid}: stored {stored:#010x}, computed {actual:#010x}"
                    ));
                }
                Ok(())
            },
            |_pid, frame, _cookie| {
                let split = frame.len() - 4;
                let crc = crc32fast::hash(&frame[..split]);
                frame[split..].copy_from_slice(&crc.to_be_bytes());
                Ok(())
            },
        )
    }

    pub(crate) fn page_in(&self, pid: PageId, frame: &mut [u8], cookie: &[u8]) -> Result<()> {
        match &self.pgin {
            Some(hook) => hook(pid, frame, cookie)
                .map_err(|reason| MpoolError::PageHook { page: pid, reason }),
            None => Ok(()),
        }
    }

    pub(crate) fn page_out(&self, pid: PageId, frame: &mut [u8], cookie: &[u8]) -> Result<()> {
        match &self.pgout {
            Some(hook) => hook(pid, frame, cookie)
                .map_err(|reason| MpoolError::PageHook { page: pid, reason }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PageHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHooks")
            .field("pgin", &self.pgin.is_some())
            .field("pgout", &self.pgout.is_some())
            .finish()
    }
}

/// Pool-side record of one open tablespace.
pub struct MpoolFile {
    id: FileId,
    path: PathBuf,
    io: StdFileIo,
    page_size: usize,
    file_type: u32,
    hooks: PageHooks,
    cookie: Vec<u8>,
    readonly: bool,
    temporary: bool,
    can_mmap: bool,
    priority: CachePriority,
    dead: AtomicBool,
    needs_sync: AtomicBool,
    handles: AtomicUsize,
    blocks: AtomicUsize,
    mutex: DebugRecursiveMutex,
}

impl MpoolFile {
    /// Tablespace id.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size of the pool the file belongs to.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Registered file type.
    pub fn file_type(&self) -> u32 {
        self.file_type
    }

    /// Opened without write access.
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Removed from disk once the last handle and buffer are gone.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Memory mapping was requested. Pages are still served from frames.
    pub fn can_mmap(&self) -> bool {
        self.can_mmap
    }

    /// IO modes granted by the platform.
    pub fn capabilities(&self) -> IoCapabilities {
        self.io.capabilities()
    }

    /// Whether dirty buffers of this file are dropped instead of written.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Open handles.
    pub fn handle_count(&self) -> usize {
        self.handles.load(Ordering::Acquire)
    }

    /// Buffers of this file resident in the pool.
    pub fn block_count(&self) -> usize {
        self.blocks.load(Ordering::Acquire)
    }

    /// The file's recursive mutex.
    pub fn mutex(&self) -> &DebugRecursiveMutex {
        &self.mutex
    }

    pub(crate) fn priority(&self) -> CachePriority {
        self.priority
    }

    pub(crate) fn io(&self) -> &StdFileIo {
        &self.io
    }

    pub(crate) fn hooks(&self) -> &PageHooks {
        &self.hooks
    }

    pub(crate) fn cookie(&self) -> &[u8] {
        &self.cookie
    }

    pub(crate) fn page_offset(&self, page_no: u32) -> u64 {
        u64::from(page_no) * self.page_size as u64
    }

    /// Whether `page_no` lies at or beyond the current end of file.
    pub(crate) fn beyond_eof(&self, page_no: u32) -> Result<bool> {
        Ok(self.page_offset(page_no) >= self.io.len()?)
    }

    pub(crate) fn note_write(&self) {
        self.needs_sync.store(true, Ordering::Release);
    }

    /// Fsyncs if a page was written since the last sync and the handle is
    /// not already synchronous.
    pub(crate) fn sync_if_needed(&self) -> Result<bool> {
        if !self.needs_sync.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        if !self.io.capabilities().needs_fsync() {
            return Ok(false);
        }
        if let Err(err) = self.io.sync_all() {
            self.needs_sync.store(true, Ordering::Release);
            return Err(err);
        }
        Ok(true)
    }

    pub(crate) fn block_acquired(&self) {
        self.blocks.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true when this was the last buffer and no handle remains.
    pub(crate) fn block_released(&self) -> bool {
        self.blocks.fetch_sub(1, Ordering::AcqRel) == 1 && self.handle_count() == 0
    }

    fn discardable(&self) -> bool {
        self.handle_count() == 0 && self.block_count() == 0
    }
}

impl fmt::Debug for MpoolFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpoolFile")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("file_type", &self.file_type)
            .field("dead", &self.is_dead())
            .field("handles", &self.handle_count())
            .field("blocks", &self.block_count())
            .finish()
    }
}

/// Caller's handle on an open tablespace.
///
/// Dropping the last handle releases the file record once none of its pages
/// remain in the pool; temporary files are deleted at that point.
pub struct FileHandle {
    file: Arc<MpoolFile>,
    pool: Weak<PoolShared>,
}

impl FileHandle {
    /// Tablespace id.
    pub fn id(&self) -> FileId {
        self.file.id
    }

    /// Page identity of `page_no` in this file.
    pub fn page_id(&self, page_no: u32) -> PageId {
        PageId {
            space: self.file.id,
            page_no,
        }
    }

    /// The underlying file record.
    pub fn file(&self) -> &Arc<MpoolFile> {
        &self.file
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        std::ptr::eq(self.pool.as_ptr(), Arc::as_ptr(pool))
    }

    /// Marks the file dead: its dirty buffers are dropped instead of written.
    pub fn mark_dead(&self) {
        if !self.file.dead.swap(true, Ordering::AcqRel) {
            info!(file = self.file.id.0, path = %self.file.path.display(), "pool.file.dead");
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileHandle").field(&self.file).finish()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let last = self.file.handles.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && self.file.block_count() == 0 {
            if let Some(pool) = self.pool.upgrade() {
                pool.files.discard(&self.file);
            } else {
                remove_temporary(&self.file);
            }
        }
    }
}

fn remove_temporary(file: &MpoolFile) {
    if !file.temporary {
        return;
    }
    if let Err(err) = fs::remove_file(&file.path) {
        warn!(path = %file.path.display(), error = %err, "pool.file.remove_temporary_failed");
    }
}

struct RegistryInner {
    files: FxHashMap<FileId, Arc<MpoolFile>>,
    by_path: FxHashMap<PathBuf, FileId>,
    types: FxHashMap<u32, PageHooks>,
    next_space: u32,
}

/// Open files and registered file types.
pub(crate) struct FileRegistry {
    inner: Mutex<RegistryInner>,
    page_size: usize,
    recursion_limit: u32,
}

impl FileRegistry {
    pub fn new(page_size: usize, recursion_limit: u32) -> Self {
        let mut types = FxHashMap::default();
        types.insert(0, PageHooks::identity());
        Self {
            inner: Mutex::new(RegistryInner {
                files: FxHashMap::default(),
                by_path: FxHashMap::default(),
                types,
                next_space: 1,
            }),
            page_size,
            recursion_limit,
        }
    }

    pub fn register_type(&self, file_type: u32, hooks: PageHooks) {
        debug!(file_type, ?hooks, "pool.file.register_type");
        self.inner.lock().types.insert(file_type, hooks);
    }

    pub fn open(&self, pool: &Arc<PoolShared>, path: &Path, opts: FileOptions) -> Result<FileHandle> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.by_path.get(path).copied() {
            if let Some(file) = inner.files.get(&id).cloned() {
                if opts.space_id.is_some_and(|s| s != id.0) {
                    return Err(MpoolError::Invalid("file already open under another space id"));
                }
                file.handles.fetch_add(1, Ordering::AcqRel);
                return Ok(FileHandle {
                    file,
                    pool: Arc::downgrade(pool),
                });
            }
        }
        let hooks = inner
            .types
            .get(&opts.file_type)
            .cloned()
            .ok_or(MpoolError::Invalid("file type not registered"))?;
        let id = match opts.space_id {
            Some(space) => {
                if inner.files.contains_key(&FileId(space)) {
                    return Err(MpoolError::Invalid("space id already in use"));
                }
                FileId(space)
            }
            None => {
                while inner.files.contains_key(&FileId(inner.next_space)) {
                    inner.next_space += 1;
                }
                FileId(inner.next_space)
            }
        };
        let io = StdFileIo::open_with(
            path,
            OpenFlags {
                readonly: opts.readonly,
                create: opts.create || opts.temporary,
                direct_io: opts.direct_io,
                dsync: opts.dsync,
            },
        )?;
        let file = Arc::new(MpoolFile {
            id,
            path: path.to_path_buf(),
            io,
            page_size: self.page_size,
            file_type: opts.file_type,
            hooks,
            cookie: opts.cookie,
            readonly: opts.readonly,
            temporary: opts.temporary,
            can_mmap: opts.can_mmap,
            priority: opts.priority,
            dead: AtomicBool::new(false),
            needs_sync: AtomicBool::new(false),
            handles: AtomicUsize::new(1),
            blocks: AtomicUsize::new(0),
            mutex: DebugRecursiveMutex::new(
                "mpool_file",
                LatchKind::Recursive {
                    limit: self.recursion_limit,
                },
            ),
        });
        inner.files.insert(id, Arc::clone(&file));
        inner.by_path.insert(path.to_path_buf(), id);
        info!(
            file = id.0,
            path = %path.display(),
            file_type = opts.file_type,
            direct_io = file.capabilities().direct_io,
            dsync = file.capabilities().dsync,
            "pool.file.open"
        );
        Ok(FileHandle {
            file,
            pool: Arc::downgrade(pool),
        })
    }

    /// Forgets `file` if it has neither handles nor buffers left.
    pub fn discard(&self, file: &Arc<MpoolFile>) {
        let mut inner = self.inner.lock();
        if !file.discardable() {
            return;
        }
        let present = inner
            .files
            .get(&file.id)
            .is_some_and(|f| Arc::ptr_eq(f, file));
        if !present {
            return;
        }
        inner.files.remove(&file.id);
        inner.by_path.remove(&file.path);
        drop(inner);
        debug!(file = file.id.0, "pool.file.discard");
        remove_temporary(file);
    }

    pub fn all(&self) -> Vec<Arc<MpoolFile>> {
        self.inner.lock().files.values().cloned().collect()
    }
}
