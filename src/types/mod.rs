#![forbid(unsafe_code)]

//! Identifiers shared by every pool component, plus the crate error type.

use std::fmt;

mod error;

pub use error::{clone_error, ErrorKind, MpoolError, Result};

/// Tablespace identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, serde::Serialize)]
#[serde(transparent)]
pub struct FileId(pub u32);

/// Page identity: a tablespace and a page number inside it.
///
/// Ordering is by tablespace first, then page number.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
pub struct PageId {
    /// Owning tablespace.
    pub space: FileId,
    /// Page number within the tablespace.
    pub page_no: u32,
}

impl PageId {
    /// Builds a page identity from raw parts.
    pub const fn new(space: u32, page_no: u32) -> Self {
        Self {
            space: FileId(space),
            page_no,
        }
    }

    /// Byte offset of this page inside its tablespace file.
    pub fn offset(self, page_size: usize) -> u64 {
        u64::from(self.page_no) * page_size as u64
    }

    /// Packs the identity into the eight bytes hashed by the page index.
    pub fn to_be_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&self.space.0.to_be_bytes());
        buf[4..].copy_from_slice(&self.page_no.to_be_bytes());
        buf
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space.0, self.page_no)
    }
}

/// Log sequence number: byte position in the log.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, serde::Serialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The unset LSN.
    pub const ZERO: Lsn = Lsn(0);

    /// Returns `self + bytes`.
    pub fn advance(self, bytes: u64) -> Lsn {
        Lsn(self.0.saturating_add(bytes))
    }

    /// Returns true for the unset LSN.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable index of a buffer header inside the pool arena.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
#[serde(transparent)]
pub struct BhId(pub u32);

impl BhId {
    /// Arena slot of this header.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BhId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered transaction.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize)]
#[serde(transparent)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 16 * 1024;

/// Smallest page size the pool accepts.
pub const MIN_PAGE_SIZE: u32 = 512;

/// Cache line size assumed for frame alignment.
pub const CACHE_LINE: usize = 64;
