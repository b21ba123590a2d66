//! mpool: a shared page cache with write-back, mini-transactions,
//! checkpoints and admission control.
//!
//! Open a [`Pool`], open tablespaces with [`Pool::open_file`], then either
//! pin pages directly or group modifications under a [`Mtr`].

#![warn(missing_docs)]

/// Admission control for threads entering the engine.
pub mod admission;
/// Checkpoint protocol, region header and transaction registry.
pub mod checkpoint;
/// Mini-transactions.
pub mod mtr;
/// Pool and file configuration.
pub mod options;
/// The buffer pool.
pub mod pool;
pub mod primitives;
pub mod types;

pub use admission::{Admission, AdmissionConfig, AdmissionSlot, AdmissionStats, InterruptFlag};
pub use checkpoint::{CheckpointOutcome, CheckpointRecord, RegionSnapshot, TxnSnapshot};
pub use mtr::{LatchMode, MemoSlot, Mtr};
pub use options::{CachePriority, FileOptions, PoolOptions, RegionMode};
pub use pool::{
    BufferState, FileHandle, FlushEntry, MpoolFile, PageHookFn, PageHooks, PageRead, PinFlags,
    PinnedPage, Pool, PoolStats,
};
pub use primitives::log::LsnRange;
pub use types::{BhId, ErrorKind, FileId, Lsn, MpoolError, PageId, Result, TxnId};
