//! Error types for byte queue operations.

use std::io;
use std::sync::Arc;

/// Result type alias for byte queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Byte queue operation error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue was closed (write after `close()`, or a second drain after
    /// the stream was fully delivered).
    #[error("bytequeue: closed")]
    Closed,

    /// IO error from a chunk file or the sink.
    #[error("bytequeue: io error: {0}")]
    Io(#[from] io::Error),

    /// A blocking wait inside `drain` was interrupted.
    #[error("bytequeue: interrupted")]
    Interrupted,

    /// The reader failed to deliver spilled data to its sink. Remembered by
    /// the disk buffer and re-raised on every later write.
    #[error("bytequeue: sink failed while draining spilled data: {0}")]
    SinkFailed(#[source] Arc<io::Error>),

    /// Invalid configuration.
    #[error("bytequeue: invalid config: {0}")]
    InvalidConfig(String),

    /// `write_region` called with a range outside the source slice.
    #[error("bytequeue: invalid range: offset {offset} + len {len} exceeds {size}")]
    InvalidRange {
        offset: usize,
        len: usize,
        size: usize,
    },
}

impl QueueError {
    /// Returns true if this error is [`QueueError::Closed`].
    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::Closed)
    }

    /// Returns true if this error is [`QueueError::Interrupted`].
    pub fn is_interrupted(&self) -> bool {
        matches!(self, QueueError::Interrupted)
    }
}

impl From<QueueError> for io::Error {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Io(e) => e,
            QueueError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, err),
            QueueError::InvalidRange { .. } | QueueError::InvalidConfig(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            other => io::Error::other(other),
        }
    }
}
