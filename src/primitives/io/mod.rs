#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::Arc,
};

use tracing::{debug, trace};

use crate::types::{MpoolError, Result};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Reads up to `dst.len()` bytes at `off`, returning the count; short only at EOF.
    fn read_upto(&self, off: u64, dst: &mut [u8]) -> Result<usize>;
    /// Writes all of `src` at `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
    /// Capabilities in effect for this handle.
    fn capabilities(&self) -> IoCapabilities {
        IoCapabilities::default()
    }
}

/// IO modes requested when opening a file.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OpenFlags {
    /// Open without write access.
    pub readonly: bool,
    /// Create the file if missing.
    pub create: bool,
    /// Bypass the OS page cache.
    pub direct_io: bool,
    /// Make every write durable before it returns.
    pub dsync: bool,
}

/// IO modes actually granted by the platform.
///
/// A requested mode that is not granted falls back to buffered IO; callers
/// then rely on an explicit [`FileIo::sync_all`] at commit points.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct IoCapabilities {
    /// Page cache bypass is active.
    pub direct_io: bool,
    /// Writes are synchronous.
    pub dsync: bool,
    /// Pages may be served from a memory mapping.
    pub mmap: bool,
}

impl IoCapabilities {
    /// Whether explicit fsyncs are needed for durability.
    pub fn needs_fsync(self) -> bool {
        !self.dsync
    }
}

#[cfg(unix)]
/// Unix-specific file I/O operations using POSIX APIs.
pub mod stdio_unix {
    use std::{
        fs::{File, OpenOptions},
        io::{self, ErrorKind},
        os::unix::fs::{FileExt, OpenOptionsExt},
    };

    use super::OpenFlags;

    /// Adds the platform flags for direct and synchronous IO.
    pub fn apply_flags(opts: &mut OpenOptions, flags: OpenFlags) {
        let mut custom = 0;
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        if flags.direct_io {
            custom |= libc::O_DIRECT;
        }
        if flags.dsync {
            custom |= libc::O_DSYNC;
        }
        if custom != 0 {
            opts.custom_flags(custom);
        }
    }

    /// Whether the platform has a direct IO open flag at all.
    pub fn direct_io_supported() -> bool {
        cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd"
        ))
    }

    /// Reads until `dst` is full or EOF, using pread semantics.
    pub fn read_upto(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < dst.len() {
            match file.read_at(&mut dst[filled..], off) {
                Ok(0) => break,
                Ok(read) => {
                    filled += read;
                    off += read as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    /// Writes all bytes at offset using pwrite semantics.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            match file.write_at(src, off) {
                Ok(0) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "write_at wrote zero bytes",
                    ))
                }
                Ok(written) => {
                    src = &src[written..];
                    off += written as u64;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(windows)]
/// Windows-specific file I/O operations using Windows APIs.
pub mod stdio_win {
    use std::{
        fs::{File, OpenOptions},
        io::{self, ErrorKind},
        os::windows::fs::{FileExt, OpenOptionsExt},
    };

    use windows_sys::Win32::Storage::FileSystem::{
        FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH,
    };

    use super::OpenFlags;

    /// Adds the platform flags for direct and synchronous IO.
    pub fn apply_flags(opts: &mut OpenOptions, flags: OpenFlags) {
        let mut custom = 0u32;
        if flags.direct_io {
            custom |= FILE_FLAG_NO_BUFFERING;
        }
        if flags.dsync {
            custom |= FILE_FLAG_WRITE_THROUGH;
        }
        if custom != 0 {
            opts.custom_flags(custom);
        }
    }

    /// Whether the platform has a direct IO open flag at all.
    pub fn direct_io_supported() -> bool {
        true
    }

    /// Reads until `dst` is full or EOF, using seek_read semantics.
    pub fn read_upto(file: &File, mut off: u64, dst: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < dst.len() {
            let read = file.seek_read(&mut dst[filled..], off)?;
            if read == 0 {
                break;
            }
            filled += read;
            off += read as u64;
        }
        Ok(filled)
    }

    /// Writes all bytes at offset using seek_write semantics.
    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

/// Standard file I/O implementation using `Arc<File>`.
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
    caps: IoCapabilities,
}

impl StdFileIo {
    /// Creates a new StdFileIo from an existing File handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
            caps: IoCapabilities::default(),
        }
    }

    /// Opens or creates a file for buffered read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(
            path,
            OpenFlags {
                create: true,
                ..OpenFlags::default()
            },
        )
    }

    /// Opens a file honoring `flags` where the platform allows.
    ///
    /// If direct or synchronous IO is refused the file is reopened buffered and
    /// the returned capabilities say so.
    pub fn open_with(path: impl AsRef<Path>, flags: OpenFlags) -> Result<Self> {
        let path = path.as_ref();
        let wants_direct = flags.direct_io && direct_io_supported();
        let special = OpenFlags {
            direct_io: wants_direct,
            ..flags
        };
        if special.direct_io || special.dsync {
            match open_raw(path, special) {
                Ok(file) => {
                    return Ok(Self {
                        inner: Arc::new(file),
                        caps: IoCapabilities {
                            direct_io: special.direct_io,
                            dsync: special.dsync,
                            mmap: false,
                        },
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::InvalidInput => {
                    debug!(
                        path = %path.display(),
                        direct_io = special.direct_io,
                        dsync = special.dsync,
                        error = %err,
                        "io.open.fallback_buffered"
                    );
                }
                Err(err) => return Err(MpoolError::from(err)),
            }
        }
        let plain = OpenFlags {
            direct_io: false,
            dsync: false,
            ..flags
        };
        let file = open_raw(path, plain).map_err(MpoolError::from)?;
        Ok(Self::new(file))
    }

    /// Shared handle to the underlying file.
    pub fn file(&self) -> &Arc<File> {
        &self.inner
    }

    #[cfg(unix)]
    fn read_upto_impl(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_unix::read_upto(&self.inner, off, dst)
    }

    #[cfg(windows)]
    fn read_upto_impl(&self, off: u64, dst: &mut [u8]) -> io::Result<usize> {
        stdio_win::read_upto(&self.inner, off, dst)
    }

    #[cfg(unix)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_unix::write_all(&self.inner, off, src)
    }

    #[cfg(windows)]
    fn write_all(&self, off: u64, src: &[u8]) -> io::Result<()> {
        stdio_win::write_all(&self.inner, off, src)
    }

    #[cfg(not(any(unix, windows)))]
    fn read_upto_impl(&self, _off: u64, _dst: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }

    #[cfg(not(any(unix, windows)))]
    fn write_all(&self, _off: u64, _src: &[u8]) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "StdFileIo unsupported on this platform",
        ))
    }
}

fn direct_io_supported() -> bool {
    #[cfg(unix)]
    {
        stdio_unix::direct_io_supported()
    }
    #[cfg(windows)]
    {
        stdio_win::direct_io_supported()
    }
    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

fn open_raw(path: &Path, flags: OpenFlags) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if !flags.readonly {
        opts.write(true).create(flags.create).truncate(false);
    }
    #[cfg(unix)]
    stdio_unix::apply_flags(&mut opts, flags);
    #[cfg(windows)]
    stdio_win::apply_flags(&mut opts, flags);
    opts.open(path)
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let read = self.read_upto(off, dst)?;
        if read < dst.len() {
            return Err(MpoolError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read_at reached EOF",
            )));
        }
        Ok(())
    }

    fn read_upto(&self, off: u64, dst: &mut [u8]) -> Result<usize> {
        trace!(off, len = dst.len(), "io.read");
        self.read_upto_impl(off, dst).map_err(MpoolError::from)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write");
        self.write_all(off, src).map_err(MpoolError::from)
    }

    fn sync_all(&self) -> Result<()> {
        trace!("io.sync_all");
        self.inner.sync_all().map_err(MpoolError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata().map_err(MpoolError::from)?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(MpoolError::from)
    }

    fn capabilities(&self) -> IoCapabilities {
        self.caps
    }
}
