//! Queue configuration.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Default in-memory ring capacity (64KB).
pub const DEFAULT_MEMORY_CAPACITY: usize = 64 * 1024;

/// Default size at which a disk chunk is sealed (1MB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default low-water threshold (4KB).
pub const DEFAULT_LOW_WATER: usize = 4 * 1024;

/// Default chunk filename prefix.
pub const DEFAULT_PREFIX: &str = "bytequeue";

/// Byte queue configuration.
///
/// Every field has a default, so a partial JSON/YAML document deserializes
/// into a usable config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory that receives spilled chunk files.
    pub temp_dir: PathBuf,
    /// Chunk filename prefix; files are named `{prefix}_{sequence}`.
    pub prefix: String,
    /// Capacity of the in-memory ring in bytes.
    pub memory_capacity: usize,
    /// Size in bytes at which the open chunk is sealed and handed to the reader.
    pub chunk_size: u64,
    /// Unread byte count that wakes a blocked reader. Clamped to
    /// `1..=memory_capacity`.
    pub low_water: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            temp_dir: env::temp_dir(),
            prefix: DEFAULT_PREFIX.to_string(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_water: DEFAULT_LOW_WATER,
        }
    }
}

impl QueueConfig {
    /// Create a config spilling into `temp_dir` with the given filename prefix.
    pub fn new(temp_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Set the in-memory ring capacity.
    pub fn with_memory_capacity(mut self, bytes: usize) -> Self {
        self.memory_capacity = bytes;
        self
    }

    /// Set the chunk size.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Set the low-water threshold.
    pub fn with_low_water(mut self, bytes: usize) -> Self {
        self.low_water = bytes;
        self
    }

    /// Check that the config can back a queue.
    pub fn validate(&self) -> Result<()> {
        if self.memory_capacity == 0 {
            return Err(QueueError::InvalidConfig(
                "memory_capacity must be greater than 0".into(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(QueueError::InvalidConfig(
                "chunk_size must be greater than 0".into(),
            ));
        }
        if self.prefix.is_empty() {
            return Err(QueueError::InvalidConfig("prefix must not be empty".into()));
        }
        if self.prefix.contains(['/', '\\']) {
            return Err(QueueError::InvalidConfig(format!(
                "prefix must not contain path separators: {:?}",
                self.prefix
            )));
        }
        Ok(())
    }

    /// Low-water threshold actually used by the memory buffer.
    pub(crate) fn effective_low_water(&self) -> usize {
        self.low_water.clamp(1, self.memory_capacity.max(1))
    }
}

pub(crate) fn chunk_path(dir: &Path, prefix: &str, sequence: u64) -> PathBuf {
    dir.join(format!("{}_{}", prefix, sequence))
}

/// Caller-owned generator of unique ids.
///
/// Queues sharing a temp directory need distinct prefixes. Hand each one a
/// prefix from the same `IdGen` instead of relying on a global counter.
#[derive(Debug)]
pub struct IdGen {
    next_id: AtomicU64,
}

impl IdGen {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Get the next unique id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the next unique prefix, `{base}-{id}`.
    pub fn next_prefix(&self, base: &str) -> String {
        format!("{}-{}", base, self.next_id())
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}
