#![allow(unsafe_code)]

//! Latches, ranked mutexes and the cross-process file lock.

mod rank;
mod recursive;
mod rwlatch;

pub use rank::{held_ranks, LockRank, RankToken, RankedGuard, RankedMutex};
pub use recursive::{DebugRecursiveMutex, LatchKind, RecursiveGuard};
pub use rwlatch::{
    latch_snapshot, FairRawRwLatch, LatchSnapshot, RwLatch, RwLatchReadGuard, RwLatchWriteGuard,
};

use std::fs::File;
use std::io;
use std::sync::Arc;

use crate::types::{MpoolError, Result};

/// Advisory exclusive lock on a byte range of a file, held for the lifetime of
/// the value. Keeps a second process from opening the same log.
pub struct ProcessLock {
    file: Arc<File>,
    start: u64,
    len: u64,
}

impl ProcessLock {
    /// Attempts to lock `[start, start + len)` exclusively without blocking.
    ///
    /// Returns `Ok(None)` when another process holds a conflicting lock.
    pub fn try_exclusive(file: Arc<File>, start: u64, len: u64) -> Result<Option<Self>> {
        if lock_range(&file, start, len)? {
            Ok(Some(Self { file, start, len }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(_err) = unlock_range(&self.file, self.start, self.len) {
            #[cfg(debug_assertions)]
            eprintln!(
                "failed to unlock range [{}, {}): {:?}",
                self.start,
                self.start + self.len,
                _err
            );
        }
    }
}

fn lock_range(file: &Arc<File>, start: u64, len: u64) -> Result<bool> {
    #[cfg(unix)]
    {
        unix::lock_region(file, start, len).map_err(MpoolError::from)
    }
    #[cfg(windows)]
    {
        windows::lock_region(file, start, len).map_err(MpoolError::from)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Err(MpoolError::Invalid("file locking unsupported on this platform"))
    }
}

fn unlock_range(file: &Arc<File>, start: u64, len: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        unix::unlock_region(file, start, len)
    }
    #[cfg(windows)]
    {
        windows::unlock_region(file, start, len)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = (file, start, len);
        Ok(())
    }
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn flock(l_type: libc::c_short, start: u64, len: u64) -> libc::flock {
        // SAFETY: flock is a plain C struct; all-zero is a valid value and the
        // fields we care about are set below.
        let mut lock: libc::flock = unsafe { std::mem::zeroed() };
        lock.l_type = l_type;
        lock.l_whence = libc::SEEK_SET as _;
        lock.l_start = start as libc::off_t;
        lock.l_len = len as libc::off_t;
        lock
    }

    pub fn lock_region(file: &Arc<File>, start: u64, len: u64) -> io::Result<bool> {
        let fd = file.as_raw_fd();
        let mut lock = flock(libc::F_WRLCK as libc::c_short, start, len);
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) };
        if res == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EACCES) => Ok(false),
            _ => Err(err),
        }
    }

    pub fn unlock_region(file: &Arc<File>, start: u64, len: u64) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let mut lock = flock(libc::F_UNLCK as libc::c_short, start, len);
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut lock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    pub fn lock_region(file: &Arc<File>, start: u64, len: u64) -> io::Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
            let res = LockFileEx(
                handle as isize,
                flags,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            if matches!(err.raw_os_error(), Some(code) if code as u32 == ERROR_LOCK_VIOLATION) {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }

    pub fn unlock_region(file: &Arc<File>, start: u64, len: u64) -> io::Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            overlapped.Anonymous.Anonymous.Offset = start as u32;
            overlapped.Anonymous.Anonymous.OffsetHigh = (start >> 32) as u32;
            let res = UnlockFileEx(
                handle as isize,
                0,
                len as u32,
                (len >> 32) as u32,
                &mut overlapped,
            );
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error())
            }
        }
    }
}
