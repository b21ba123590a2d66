//! Low-level primitives the pool is assembled from.
//!
//! Includes aligned memory and region allocation, latches and lock ranks,
//! the bounded work queue, positioned file IO, and the log manager.

/// Aligned allocation and region allocators.
///
/// Frames are carved from one reservation obtained through a region allocator.
pub mod alloc;

/// Latches, ranked mutexes and lock-order checking.
///
/// Fair reader/writer latch, owner-tracking recursive mutex, rank table.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Positioned reads and writes plus direct/synchronous IO capability probing.
pub mod io;

/// Log manager.
///
/// LSN allocation, log buffer, log file control header.
pub mod log;

/// Bounded FIFO with flow control and close.
pub mod queue;
