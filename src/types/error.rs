use std::io;
use std::panic::Location;

use thiserror::Error;

use super::PageId;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, MpoolError>;

/// Errors surfaced by the pool and its components.
#[derive(Debug, Error)]
pub enum MpoolError {
    /// Underlying file operation failed.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// A page read returned fewer bytes than a full page.
    #[error("short read on page {page}: {read} bytes")]
    ShortRead {
        /// Page being read.
        page: PageId,
        /// Bytes actually returned.
        read: usize,
    },
    /// A page-in or page-out hook rejected the page.
    #[error("page hook failed on {page}: {reason}")]
    PageHook {
        /// Page being converted.
        page: PageId,
        /// Hook-supplied reason.
        reason: String,
    },
    /// The waiting thread was interrupted.
    #[error("interrupted")]
    Interrupted,
    /// A non-blocking operation could not proceed.
    #[error("would block: {0}")]
    WouldBlock(&'static str),
    /// The queue was closed while the operation was pending.
    #[error("queue closed")]
    QueueClosed,
    /// A bounded wait expired.
    #[error("timed out: {0}")]
    Timeout(&'static str),
    /// No frame could be freed for a new page.
    #[error("out of frames")]
    OutOfFrames,
    /// The log has no room for the record.
    #[error("log full: need {needed} bytes, {available} available")]
    LogFull {
        /// Bytes the record requires.
        needed: u64,
        /// Bytes left before the capacity limit.
        available: u64,
    },
    /// The region allocator is exhausted.
    #[error("region full: requested {0} bytes")]
    RegionFull(usize),
    /// A latch or mini-transaction was used against its protocol.
    #[error("protocol violation: {what} at {location}")]
    ProtocolViolation {
        /// What went wrong.
        what: &'static str,
        /// Source location of the offending call.
        location: &'static Location<'static>,
    },
    /// Internal structures failed a consistency check.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Owned variant of [`MpoolError::Invalid`] for formatted messages.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// The requested object does not exist.
    #[error("not found")]
    NotFound,
}

/// Error taxonomy used to decide propagation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Retried by the caller with backoff.
    Transient,
    /// Read, write, fsync or hook failure.
    Io,
    /// Frames, log or region exhausted.
    ResourceExhausted,
    /// Misuse of a latch or mini-transaction.
    ProtocolViolation,
    /// Broken invariant; the pool cannot be trusted.
    Fatal,
    /// Bad input from the caller.
    Usage,
}

impl MpoolError {
    /// Builds a protocol violation attributed to the caller.
    #[track_caller]
    pub fn protocol(what: &'static str) -> Self {
        MpoolError::ProtocolViolation {
            what,
            location: Location::caller(),
        }
    }

    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MpoolError::Interrupted
            | MpoolError::WouldBlock(_)
            | MpoolError::Timeout(_) => ErrorKind::Transient,
            MpoolError::Io(_) | MpoolError::ShortRead { .. } | MpoolError::PageHook { .. } => {
                ErrorKind::Io
            }
            MpoolError::OutOfFrames | MpoolError::LogFull { .. } | MpoolError::RegionFull(_) => {
                ErrorKind::ResourceExhausted
            }
            MpoolError::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            MpoolError::Corruption(_) => ErrorKind::Fatal,
            MpoolError::QueueClosed
            | MpoolError::Invalid(_)
            | MpoolError::InvalidOwned(_)
            | MpoolError::NotFound => ErrorKind::Usage,
        }
    }

    /// Returns true when a bounded retry may succeed.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

/// Duplicates an error so it can be delivered to several waiters.
pub fn clone_error(err: &MpoolError) -> MpoolError {
    match err {
        MpoolError::Io(io_err) => MpoolError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        MpoolError::ShortRead { page, read } => MpoolError::ShortRead {
            page: *page,
            read: *read,
        },
        MpoolError::PageHook { page, reason } => MpoolError::PageHook {
            page: *page,
            reason: reason.clone(),
        },
        MpoolError::Interrupted => MpoolError::Interrupted,
        MpoolError::WouldBlock(msg) => MpoolError::WouldBlock(*msg),
        MpoolError::QueueClosed => MpoolError::QueueClosed,
        MpoolError::Timeout(msg) => MpoolError::Timeout(*msg),
        MpoolError::OutOfFrames => MpoolError::OutOfFrames,
        MpoolError::LogFull { needed, available } => MpoolError::LogFull {
            needed: *needed,
            available: *available,
        },
        MpoolError::RegionFull(bytes) => MpoolError::RegionFull(*bytes),
        MpoolError::ProtocolViolation { what, location } => MpoolError::ProtocolViolation {
            what: *what,
            location: *location,
        },
        MpoolError::Corruption(msg) => MpoolError::Corruption(*msg),
        MpoolError::Invalid(msg) => MpoolError::Invalid(*msg),
        MpoolError::InvalidOwned(msg) => MpoolError::InvalidOwned(msg.clone()),
        MpoolError::NotFound => MpoolError::NotFound,
    }
}
