//! The buffer capability shared by both queue stages.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::disk::DiskBuffer;
use crate::error::Result;
use crate::memory::MemoryBuffer;

/// One stage of a byte queue.
///
/// Implemented by [`MemoryBuffer`] (bounded ring) and [`DiskBuffer`]
/// (unbounded chunk files). Writes come from exactly one writer thread and
/// `drain_to` runs on exactly one reader thread.
pub trait Buffer: Send + Sync {
    /// Bytes that can be written without overflowing this stage.
    fn free_bytes(&self) -> usize;

    /// Appends `data`. Callers size the write with [`Buffer::free_bytes`] first.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Makes buffered bytes available to the reader sooner.
    fn flush(&self) -> Result<()>;

    /// Ends the stage. The reader sees end-of-stream once everything already
    /// written has been drained. Idempotent.
    fn close(&self) -> Result<()>;

    /// Copies everything written to `sink`, blocking for more data until the
    /// stage is closed and empty. Returns the number of bytes delivered.
    fn drain_to(&self, sink: &mut dyn Write) -> Result<u64>;

    /// Releases resources left behind after close and drain.
    fn cleanup(&self) -> Result<()>;

    /// Wakes a blocked `drain_to` so it can observe a pending interrupt.
    fn wake(&self);
}

/// A pending-interrupt flag shared by every stage of one queue.
///
/// The wait that observes the flag consumes it.
#[derive(Debug, Default)]
pub(crate) struct Interrupt {
    pending: AtomicBool,
}

impl Interrupt {
    pub(crate) fn raise(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }
}

/// The stage a queue is currently writing to or reading from.
#[derive(Clone)]
pub(crate) enum Stage {
    Memory(Arc<MemoryBuffer>),
    Disk(Arc<DiskBuffer>),
}

impl Stage {
    pub(crate) fn buffer(&self) -> &dyn Buffer {
        match self {
            Stage::Memory(memory) => memory.as_ref(),
            Stage::Disk(disk) => disk.as_ref(),
        }
    }

    pub(crate) fn is_disk(&self) -> bool {
        matches!(self, Stage::Disk(_))
    }

    /// Returns true if both refer to the same underlying buffer.
    pub(crate) fn same(&self, other: &Stage) -> bool {
        match (self, other) {
            (Stage::Memory(a), Stage::Memory(b)) => Arc::ptr_eq(a, b),
            (Stage::Disk(a), Stage::Disk(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Stage::Memory(_) => "memory",
            Stage::Disk(_) => "disk",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_is_consumed() {
        let interrupt = Interrupt::default();
        assert!(!interrupt.take());

        interrupt.raise();
        assert!(interrupt.take());
        assert!(!interrupt.take());
    }

    #[test]
    fn test_stage_identity() {
        let a = Stage::Memory(Arc::new(MemoryBuffer::new(8, 4)));
        let b = Stage::Memory(Arc::new(MemoryBuffer::new(8, 4)));

        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        assert!(!a.is_disk());
        assert_eq!(a.name(), "memory");
        assert_eq!(a.buffer().free_bytes(), 8);
    }
}
