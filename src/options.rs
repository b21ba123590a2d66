#![forbid(unsafe_code)]

//! Pool and file configuration.
//!
//! Options are layered: [`Default`], then an optional TOML document, then
//! `MPOOL_*` environment variables. Malformed values are usage errors.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{MpoolError, Result, DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};

/// Where frame memory comes from.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RegionMode {
    /// Frames carved from an ordinary heap reservation.
    #[default]
    Heap,
    /// Frames carved from a fixed-size region with an embedded allocator.
    Shared {
        /// Region size in bytes.
        bytes: usize,
    },
}

/// Replacement priority class of a page.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePriority {
    /// Evicted first.
    VeryLow,
    /// Ages faster than default.
    Low,
    /// Plain LRU position.
    #[default]
    Default,
    /// Kept longer than default.
    High,
    /// Kept longest.
    VeryHigh,
}

impl CachePriority {
    /// Returns the lowercase name of the class.
    pub fn as_str(self) -> &'static str {
        match self {
            CachePriority::VeryLow => "very_low",
            CachePriority::Low => "low",
            CachePriority::Default => "default",
            CachePriority::High => "high",
            CachePriority::VeryHigh => "very_high",
        }
    }
}

impl FromStr for CachePriority {
    type Err = MpoolError;

    /// Parses a class name (case-insensitive, `-` or `_` separated).
    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "very_low" => Ok(CachePriority::VeryLow),
            "low" => Ok(CachePriority::Low),
            "default" => Ok(CachePriority::Default),
            "high" => Ok(CachePriority::High),
            "very_high" => Ok(CachePriority::VeryHigh),
            _ => Err(MpoolError::InvalidOwned(format!(
                "unknown cache priority {value:?}"
            ))),
        }
    }
}

/// Configuration options for a pool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Size of each page in bytes; a power of two of at least 512.
    pub page_size: u32,
    /// Number of frames in the pool.
    pub pool_pages: usize,
    /// IO worker threads.
    pub io_workers: usize,
    /// Write queue length at which producers block.
    pub write_queue_limit: usize,
    /// Length at which blocked producers resume; `None` means half the limit.
    pub write_queue_resume: Option<usize>,
    /// Maximum threads inside the engine, zero to disable admission control.
    pub concurrency_limit: u32,
    /// Tickets granted on admission.
    pub free_tickets_per_query: u32,
    /// Initial admission back-off in microseconds.
    pub thread_sleep_us: u64,
    /// Cap on the adaptive admission back-off in microseconds.
    pub adaptive_sleep_max_us: u64,
    /// Checkpoint once this many KiB of log accumulated, zero disables.
    pub checkpoint_kbytes: u64,
    /// Checkpoint once this many minutes passed, zero disables.
    pub checkpoint_minutes: u64,
    /// Background checkpointer period in milliseconds, zero disables.
    pub checkpoint_interval_ms: u64,
    /// How long a checkpoint waits for its pages to reach disk.
    pub checkpoint_flush_timeout_ms: u64,
    /// Background page cleaner period in milliseconds, zero disables.
    pub flusher_interval_ms: u64,
    /// Dirty share of the pool (percent) above which the cleaner writes.
    pub dirty_flush_pct: u8,
    /// Frame allocation attempts before giving up with out-of-frames.
    pub eviction_retries: u32,
    /// Delay between frame allocation attempts in microseconds.
    pub eviction_retry_delay_us: u64,
    /// Log file; `None` keeps the log in memory.
    pub log_path: Option<PathBuf>,
    /// Log buffer size in bytes.
    pub log_buffer_bytes: usize,
    /// Log bytes allowed past the last checkpoint, zero for unbounded.
    pub log_capacity_bytes: u64,
    /// Fsync the log whenever it is written out.
    pub log_sync: bool,
    /// Replica mode: checkpoints only flush pages.
    pub read_only: bool,
    /// Nesting limit of per-file recursive mutexes.
    pub recursion_limit: u32,
    /// Frame memory source.
    pub region: RegionMode,
    /// Environment identifier recorded in checkpoints.
    pub env_id: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_pages: 1024,
            io_workers: 2,
            write_queue_limit: 256,
            write_queue_resume: None,
            concurrency_limit: 0,
            free_tickets_per_query: 500,
            thread_sleep_us: 10_000,
            adaptive_sleep_max_us: 150_000,
            checkpoint_kbytes: 0,
            checkpoint_minutes: 0,
            checkpoint_interval_ms: 0,
            checkpoint_flush_timeout_ms: 30_000,
            flusher_interval_ms: 0,
            dirty_flush_pct: 75,
            eviction_retries: 100,
            eviction_retry_delay_us: 1_000,
            log_path: None,
            log_buffer_bytes: 64 * 1024,
            log_capacity_bytes: 0,
            log_sync: false,
            read_only: false,
            recursion_limit: 8,
            region: RegionMode::Heap,
            env_id: 0,
        }
    }
}

impl PoolOptions {
    /// Parses options from a TOML document; absent keys keep their defaults.
    pub fn from_toml_str(doc: &str) -> Result<Self> {
        toml::from_str(doc).map_err(|err| MpoolError::InvalidOwned(format!("pool options: {err}")))
    }

    /// Defaults overridden by `MPOOL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Applies `MPOOL_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|name| env::var(name).ok())
    }

    /// Applies overrides looked up through `lookup`, keyed by variable name.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "MPOOL_POOL_PAGES")? {
            self.pool_pages = v;
        }
        if let Some(v) = parse_var(&lookup, "MPOOL_PAGE_SIZE")? {
            self.page_size = v;
        }
        if let Some(v) = parse_var(&lookup, "MPOOL_CONCURRENCY_LIMIT")? {
            self.concurrency_limit = v;
        }
        if let Some(v) = parse_var(&lookup, "MPOOL_ADAPTIVE_SLEEP_MAX_US")? {
            self.adaptive_sleep_max_us = v;
        }
        if let Some(v) = parse_var(&lookup, "MPOOL_CHECKPOINT_KBYTES")? {
            self.checkpoint_kbytes = v;
        }
        if let Some(v) = parse_var(&lookup, "MPOOL_CHECKPOINT_MINUTES")? {
            self.checkpoint_minutes = v;
        }
        if let Some(v) = parse_var(&lookup, "MPOOL_IO_WORKERS")? {
            self.io_workers = v;
        }
        Ok(self)
    }

    /// Effective resume threshold of the write queue.
    pub fn queue_resume(&self) -> usize {
        self.write_queue_resume
            .unwrap_or(self.write_queue_limit / 2)
    }

    /// Rejects inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.pool_pages == 0 {
            return Err(MpoolError::Invalid("pool_pages must be positive"));
        }
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(MpoolError::Invalid(
                "page_size must be a power of two of at least 512",
            ));
        }
        if self.io_workers == 0 {
            return Err(MpoolError::Invalid("io_workers must be positive"));
        }
        if self.write_queue_limit == 0 {
            return Err(MpoolError::Invalid("write_queue_limit must be positive"));
        }
        if self.queue_resume() >= self.write_queue_limit {
            return Err(MpoolError::Invalid(
                "write_queue_resume must be below write_queue_limit",
            ));
        }
        if self.dirty_flush_pct > 100 {
            return Err(MpoolError::Invalid("dirty_flush_pct must be at most 100"));
        }
        if self.recursion_limit == 0 {
            return Err(MpoolError::Invalid("recursion_limit must be positive"));
        }
        if self.log_buffer_bytes == 0 {
            return Err(MpoolError::Invalid("log_buffer_bytes must be positive"));
        }
        Ok(())
    }
}

fn parse_var<F, T>(lookup: &F, name: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| MpoolError::InvalidOwned(format!("{name}: invalid value {raw:?}"))),
    }
}

/// Options for one opened tablespace file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOptions {
    /// Tablespace id; assigned by the pool when `None`.
    pub space_id: Option<u32>,
    /// Registered file type whose page hooks apply; zero is the identity type.
    pub file_type: u32,
    /// Opaque bytes handed to the page hooks.
    pub cookie: Vec<u8>,
    /// Open without write access.
    pub readonly: bool,
    /// Create the file if missing.
    pub create: bool,
    /// Remove the file when its last handle closes.
    pub temporary: bool,
    /// Request page-cache bypass.
    pub direct_io: bool,
    /// Request synchronous writes.
    pub dsync: bool,
    /// Allow serving pages from a memory mapping.
    pub can_mmap: bool,
    /// Replacement class applied when pages of this file are released.
    pub priority: CachePriority,
}

impl FileOptions {
    /// Options for creating (or opening) a read-write file.
    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::default()
        }
    }
}
