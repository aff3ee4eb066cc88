//! Embedded, persistent FIFO byte-message queue backed by memory-mapped
//! arena files.
//!
//! The queue stores its data in a single directory: a sequence of fixed-size
//! `arena_<n>.dat` files holding length-prefixed records, plus a
//! `metadata.dat` file holding the tail pointer, the per-consumer head
//! pointers, and the consumer directory. Everything survives process
//! restarts; durability is best-effort between flushes and guaranteed after
//! [`MmapQueue::flush`] or [`MmapQueue::close`].
//!
//! ## Architecture Overview
//!
//! - **Arena manager**: maps arena files on demand, evicts under a
//!   configurable memory cap, and deletes files every consumer has read past
//! - **Record codec**: writes an 8-byte little-endian length prefix plus the
//!   payload, spilling payloads across arena boundaries as needed
//! - **Metadata store**: one mapped file for the tail, the queue head, the
//!   arena size, and the packed consumer directory
//! - **Durability controller**: a background task flushing after a number of
//!   mutations or a period of time, whichever trips first
//!
//! ## Example
//!
//! ```no_run
//! use mmapq::{MmapQueue, QueueOptions};
//!
//! let queue = QueueOptions::new()
//!     .arena_size(4 * 1024 * 1024)?
//!     .open("/var/lib/myapp/queue")?;
//!
//! queue.enqueue(b"first")?;
//! queue.enqueue_str("second")?;
//!
//! assert_eq!(queue.dequeue()?, b"first");
//! assert_eq!(queue.dequeue_string()?, "second");
//!
//! // independent named cursors over the same stream
//! let audit = queue.consumer("audit")?;
//! assert!(audit.is_empty());
//!
//! queue.close()?;
//! # Ok::<(), mmapq::QueueError>(())
//! ```
//!
//! ## Thread Safety
//!
//! An [`MmapQueue`] and its [`Consumer`] handles are `Send + Sync`. One
//! process-wide write lock per queue serializes all operations; enqueues are
//! totally ordered by lock acquisition and each consumer observes records in
//! enqueue order. The queue directory must not be opened by more than one
//! process at a time.

pub mod clock;
pub mod config;
pub mod error;
pub mod flush;

mod arena;
mod codec;
mod fs;
mod manager;
mod meta;
mod queue;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ArenaId, Position, QueueConfig, QueueOptions};
pub use error::{QueueError, QueueResult, MIN_IN_MEMORY_ARENAS};
pub use flush::FlushMetricsSnapshot;
pub use queue::{Consumer, MmapQueue, DEFAULT_CONSUMER};
