//! Single-producer, single-consumer byte queue that spills to disk.
//!
//! A [`ByteQueue`] decouples one writer thread from one reader thread over an
//! unbounded byte stream while keeping memory use bounded. It has two stages:
//!
//! - [`MemoryBuffer`]: a fixed-capacity ring every queue starts with
//! - [`DiskBuffer`]: a sequence of chunk files, created the first time a
//!   write does not fit in the ring
//!
//! The writer never waits for the reader. The reader drains the ring, then
//! the chunks, so bytes reach the sink exactly once and in write order.
//!
//! # Example
//!
//! ```
//! use giztoy_bytequeue::{ByteQueue, QueueConfig};
//!
//! let dir = std::env::temp_dir();
//! let config = QueueConfig::new(&dir, format!("lib-doc-{}", std::process::id()))
//!     .with_memory_capacity(16)
//!     .with_chunk_size(8);
//! let queue = ByteQueue::new(config).unwrap();
//!
//! queue.write(b"more than sixteen bytes").unwrap();
//! assert!(queue.is_spilled());
//! queue.close().unwrap();
//!
//! let mut out = Vec::new();
//! queue.drain(&mut out).unwrap();
//! assert_eq!(out, b"more than sixteen bytes");
//! queue.cleanup().unwrap();
//! ```
//!
//! # Closing
//!
//! `close()` ends the stream. Everything written before it is still
//! delivered, even when `drain()` only starts afterwards.
//!
//! # Errors seen by the writer
//!
//! A sink failure while the reader drains spilled chunks cannot be returned
//! to the writer directly. It is recorded in the disk buffer's
//! [`FailureCell`] and returned as [`QueueError::SinkFailed`] by every later
//! `write`.
//!
//! # Chunk files
//!
//! Chunks are named `{prefix}_{sequence}` inside
//! [`QueueConfig::temp_dir`]. Queues sharing a directory need distinct
//! prefixes; [`IdGen`] hands them out.

mod config;
mod disk;
mod error;
mod fifo;
mod memory;
mod queue;
mod stage;

pub use config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_LOW_WATER, DEFAULT_MEMORY_CAPACITY, DEFAULT_PREFIX, IdGen,
    QueueConfig,
};
pub use disk::{DiskBuffer, FailureCell};
pub use error::{QueueError, Result};
pub use memory::MemoryBuffer;
pub use queue::{ByteQueue, QueueStats};
pub use stage::Buffer;
