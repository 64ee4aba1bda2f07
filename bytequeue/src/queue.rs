//! The byte queue controller.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::disk::DiskBuffer;
use crate::error::{QueueError, Result};
use crate::memory::MemoryBuffer;
use crate::stage::{Buffer, Interrupt, Stage};

/// A single-producer, single-consumer byte queue that spills to disk.
///
/// Bytes are held in a fixed-size ring until a write no longer fits. At that
/// point the ring is closed and every later write goes to chunk files in the
/// configured temp directory. The reader drains the ring first and then the
/// chunks, so the sink sees the bytes exactly once and in write order.
///
/// `ByteQueue` is a cheap handle: clone it and give one clone to the writer
/// thread and one to the reader thread. Exactly one thread may write and
/// exactly one thread may drain.
///
/// # Example
///
/// ```
/// use giztoy_bytequeue::{ByteQueue, QueueConfig};
/// use std::thread;
///
/// let dir = std::env::temp_dir();
/// let config = QueueConfig::new(&dir, format!("doc-{}", std::process::id()))
///     .with_memory_capacity(16)
///     .with_chunk_size(8);
/// let queue = ByteQueue::new(config).unwrap();
/// let reader = queue.clone();
///
/// let handle = thread::spawn(move || {
///     let mut out = Vec::new();
///     reader.drain(&mut out).unwrap();
///     out
/// });
///
/// queue.write(&[b'A'; 20]).unwrap();
/// queue.close().unwrap();
///
/// assert_eq!(handle.join().unwrap(), vec![b'A'; 20]);
/// queue.cleanup().unwrap();
/// ```
#[derive(Clone)]
pub struct ByteQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    interrupt: Arc<Interrupt>,
    bytes_written: AtomicU64,
    bytes_drained: AtomicU64,
}

struct QueueState {
    write: Stage,
    read: Stage,
    closed: bool,
    drained: bool,
    failed: Option<Arc<io::Error>>,
}

/// Counters describing a queue's lifetime so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Bytes accepted by `write`.
    pub bytes_written: u64,
    /// Bytes delivered to the sink by `drain`.
    pub bytes_drained: u64,
    /// Chunk files created since the spill.
    pub chunks_created: u64,
    /// Whether the queue has moved to disk.
    pub spilled: bool,
}

impl ByteQueue {
    /// Creates a queue backed by an in-memory ring of
    /// `config.memory_capacity` bytes.
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;

        let interrupt = Arc::new(Interrupt::default());
        let memory = Arc::new(MemoryBuffer::with_interrupt(
            config.memory_capacity,
            config.effective_low_water(),
            Arc::clone(&interrupt),
        ));
        let stage = Stage::Memory(memory);

        Ok(ByteQueue {
            inner: Arc::new(QueueInner {
                config,
                state: Mutex::new(QueueState {
                    write: stage.clone(),
                    read: stage,
                    closed: false,
                    drained: false,
                    failed: None,
                }),
                interrupt,
                bytes_written: AtomicU64::new(0),
                bytes_drained: AtomicU64::new(0),
            }),
        })
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Writes `data` to the queue.
    ///
    /// Moves the queue to disk the first time `data` does not fit in the
    /// ring. Fails with `Closed` after [`ByteQueue::close`], and with
    /// `SinkFailed` once the reader has failed to deliver spilled data.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if data.is_empty() {
            return Ok(());
        }

        if data.len() > state.write.buffer().free_bytes() {
            self.spill(&mut state)?;
        }
        state.write.buffer().write(data)?;

        self.inner
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Writes a single byte.
    pub fn write_byte(&self, byte: u8) -> Result<()> {
        self.write(&[byte])
    }

    /// Writes `len` bytes of `data` starting at `offset`.
    pub fn write_region(&self, data: &[u8], offset: usize, len: usize) -> Result<()> {
        let region = offset
            .checked_add(len)
            .and_then(|end| data.get(offset..end))
            .ok_or(QueueError::InvalidRange {
                offset,
                len,
                size: data.len(),
            })?;
        self.write(region)
    }

    /// Swaps the write target from the ring to a new disk buffer.
    ///
    /// Runs under the state lock so the reader never observes a closed ring
    /// without the disk buffer that replaced it.
    fn spill(&self, state: &mut QueueState) -> Result<()> {
        let Stage::Memory(memory) = &state.write else {
            return Ok(());
        };

        let disk = DiskBuffer::with_interrupt(&self.inner.config, Arc::clone(&self.inner.interrupt))?;
        memory.close()?;
        debug!(
            dir = %self.inner.config.temp_dir.display(),
            prefix = %self.inner.config.prefix,
            buffered = memory.len(),
            "bytequeue: memory buffer full, spilling to disk"
        );
        state.write = Stage::Disk(Arc::new(disk));
        Ok(())
    }

    /// Asks the active write buffer to hand buffered bytes to the reader
    /// sooner. A no-op once the queue is closed.
    pub fn flush(&self) -> Result<()> {
        let state = self.inner.state.lock();
        if state.closed {
            return Ok(());
        }
        state.write.buffer().flush()
    }

    /// Closes the queue.
    ///
    /// Further writes fail; a blocked `drain` delivers what is buffered and
    /// returns. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let result = state.write.buffer().close();
        if !state.read.same(&state.write) {
            state.read.buffer().close()?;
        }
        debug!(
            stage = state.write.name(),
            written = self.inner.bytes_written.load(Ordering::Relaxed),
            "bytequeue: closed"
        );
        result
    }

    /// Copies the whole stream to `sink`, blocking until the queue is closed
    /// and everything has been delivered. Returns the number of bytes
    /// delivered by this call.
    ///
    /// Runs on the reader thread. If the wait is interrupted with
    /// [`ByteQueue::interrupt`] the call returns `Interrupted`, and calling
    /// `drain` again continues where it stopped.
    ///
    /// Any other error ends the stream: bytes already taken from the queue
    /// may not have reached `sink`, so later calls fail with `SinkFailed`
    /// instead of resuming. A sink failure while delivering spilled data is
    /// returned here and is also raised to the writer by its next
    /// [`ByteQueue::write`]. Fails with `Closed` if a previous `drain`
    /// already delivered the whole stream, or after [`ByteQueue::cleanup`].
    pub fn drain<W: Write>(&self, sink: &mut W) -> Result<u64> {
        {
            let state = self.inner.state.lock();
            if let Some(err) = &state.failed {
                return Err(QueueError::SinkFailed(Arc::clone(err)));
            }
            if state.drained {
                return Err(QueueError::Closed);
            }
        }

        let mut sink = CountingSink {
            inner: sink,
            count: &self.inner.bytes_drained,
        };
        let mut total = 0u64;
        loop {
            let read = self.inner.state.lock().read.clone();
            match read.buffer().drain_to(&mut sink) {
                Ok(n) => total += n,
                Err(e) => return Err(self.end_drain(e, total)),
            }

            let mut state = self.inner.state.lock();
            if state.read.same(&state.write) {
                state.drained = true;
                return Ok(total);
            }
            debug!(
                from = state.read.name(),
                to = state.write.name(),
                delivered = total,
                "bytequeue: read buffer exhausted, advancing"
            );
            state.read = state.write.clone();
        }
    }

    /// Marks the stream unreadable after a failed drain. `Interrupted` is
    /// passed through untouched since the wait can be resumed.
    fn end_drain(&self, err: QueueError, delivered: u64) -> QueueError {
        if err.is_interrupted() {
            return err;
        }

        let failure = match &err {
            QueueError::SinkFailed(e) => Arc::clone(e),
            QueueError::Io(e) => Arc::new(io::Error::new(e.kind(), e.to_string())),
            other => Arc::new(io::Error::other(other.to_string())),
        };
        let mut state = self.inner.state.lock();
        warn!(
            stage = state.read.name(),
            delivered,
            error = %err,
            "bytequeue: drain failed, stream ended"
        );
        state.drained = true;
        state.failed.get_or_insert(failure);
        err
    }

    /// Removes chunk files left behind.
    ///
    /// Call only after both [`ByteQueue::close`] and a completed
    /// [`ByteQueue::drain`] have returned, or when no reader will ever run.
    /// A `drain` started afterwards fails with `Closed`.
    pub fn cleanup(&self) -> Result<()> {
        let write = {
            let mut state = self.inner.state.lock();
            state.drained = true;
            state.write.clone()
        };
        write.buffer().cleanup()
    }

    /// Interrupts a `drain` blocked waiting for data.
    ///
    /// If no drain is waiting, the next wait returns `Interrupted` at once.
    pub fn interrupt(&self) {
        self.inner.interrupt.raise();

        let state = self.inner.state.lock();
        state.read.buffer().wake();
        if !state.read.same(&state.write) {
            state.write.buffer().wake();
        }
        debug!(stage = state.read.name(), "bytequeue: interrupt raised");
    }

    /// Returns true once [`ByteQueue::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Returns true once the queue has moved to disk.
    pub fn is_spilled(&self) -> bool {
        self.inner.state.lock().write.is_disk()
    }

    /// Returns the sink failure recorded while draining spilled data, if any.
    pub fn sink_failure(&self) -> Option<Arc<io::Error>> {
        match &self.inner.state.lock().write {
            Stage::Disk(disk) => disk.failure(),
            Stage::Memory(_) => None,
        }
    }

    /// Returns the queue counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let chunks_created = match &state.write {
            Stage::Disk(disk) => disk.chunks_created(),
            Stage::Memory(_) => 0,
        };
        QueueStats {
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
            bytes_drained: self.inner.bytes_drained.load(Ordering::Relaxed),
            chunks_created,
            spilled: state.write.is_disk(),
        }
    }
}

impl Write for ByteQueue {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ByteQueue::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        ByteQueue::flush(self)?;
        Ok(())
    }
}

/// Sink wrapper that counts delivered bytes as they are written.
struct CountingSink<'a, W> {
    inner: &'a mut W,
    count: &'a AtomicU64,
}

impl<W: Write> Write for CountingSink<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
