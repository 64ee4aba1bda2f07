//! Fixed-capacity in-memory stage.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::error::{QueueError, Result};
use crate::stage::{Buffer, Interrupt};

/// A fixed-capacity circular byte buffer.
///
/// `MemoryBuffer` is the first stage of every queue. It never grows and
/// never blocks the writer: the controller checks [`Buffer::free_bytes`]
/// before every write and moves to disk when the ring cannot take it.
///
/// # Semantics
///
/// - **Write**: Never blocks; the write must fit in the free space
/// - **Drain**: Blocks until the low-water threshold is reached, a flush is
///   requested, or the buffer is closed
/// - **Close**: Wakes the reader, which drains what is left and returns
pub struct MemoryBuffer {
    state: Mutex<MemoryState>,
    readable: Condvar,
    low_water: usize,
    interrupt: Arc<Interrupt>,
}

struct MemoryState {
    buf: Box<[u8]>,
    head: usize, // read position
    tail: usize, // write position
    unread: usize,
    free: usize,
    closed: bool,
    flush_pending: bool,
}

impl MemoryState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn check_invariant(&self) {
        debug_assert_eq!(self.unread + self.free, self.capacity());
    }

    /// Appends `data` at the tail, wrapping at the end of the ring.
    fn push(&mut self, data: &[u8]) {
        let capacity = self.capacity();
        let first = data.len().min(capacity - self.tail);
        self.buf[self.tail..self.tail + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);

        self.tail = (self.tail + data.len()) % capacity;
        self.unread += data.len();
        self.free -= data.len();
        self.check_invariant();
    }

    /// Moves every unread byte into `out` as at most two contiguous copies.
    fn take_unread(&mut self, out: &mut Vec<u8>) {
        let capacity = self.capacity();
        let first = self.unread.min(capacity - self.head);
        out.extend_from_slice(&self.buf[self.head..self.head + first]);
        out.extend_from_slice(&self.buf[..self.unread - first]);

        self.head = (self.head + self.unread) % capacity;
        self.free += self.unread;
        self.unread = 0;
        self.check_invariant();
    }
}

impl MemoryBuffer {
    /// Creates a MemoryBuffer with the specified capacity.
    ///
    /// `low_water` is clamped to `1..=capacity`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, low_water: usize) -> Self {
        Self::with_interrupt(capacity, low_water, Arc::new(Interrupt::default()))
    }

    pub(crate) fn with_interrupt(
        capacity: usize,
        low_water: usize,
        interrupt: Arc<Interrupt>,
    ) -> Self {
        assert!(capacity > 0, "capacity must be greater than 0");

        MemoryBuffer {
            state: Mutex::new(MemoryState {
                buf: vec![0; capacity].into_boxed_slice(),
                head: 0,
                tail: 0,
                unread: 0,
                free: capacity,
                closed: false,
                flush_pending: false,
            }),
            readable: Condvar::new(),
            low_water: low_water.clamp(1, capacity),
            interrupt,
        }
    }

    /// Returns the ring capacity.
    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Returns the number of bytes written but not yet drained.
    pub fn len(&self) -> usize {
        self.state.lock().unread
    }

    /// Returns true if there is nothing to drain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the buffer has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Buffer for MemoryBuffer {
    fn free_bytes(&self) -> usize {
        self.state.lock().free
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if data.len() > state.free {
            return Err(QueueError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!(
                    "memory buffer: write of {} bytes exceeds {} free",
                    data.len(),
                    state.free
                ),
            )));
        }

        let before = state.unread;
        state.push(data);
        if before < self.low_water && state.unread >= self.low_water {
            self.readable.notify_one();
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.unread > 0 {
            state.flush_pending = true;
            self.readable.notify_one();
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.readable.notify_all();
        Ok(())
    }

    fn drain_to(&self, sink: &mut dyn Write) -> Result<u64> {
        let mut batch = Vec::new();
        let mut total = 0u64;

        loop {
            let finished = {
                let mut state = self.state.lock();
                while !state.closed && !state.flush_pending && state.unread < self.low_water {
                    if self.interrupt.take() {
                        debug!(unread = state.unread, "bytequeue: memory drain interrupted");
                        return Err(QueueError::Interrupted);
                    }
                    self.readable.wait(&mut state);
                }
                state.flush_pending = false;

                batch.clear();
                state.take_unread(&mut batch);
                state.closed
            };

            if !batch.is_empty() {
                sink.write_all(&batch)?;
                sink.flush()?;
                total += batch.len() as u64;
            }
            if finished {
                return Ok(total);
            }
        }
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn wake(&self) {
        let _state = self.state.lock();
        self.readable.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn buffer(capacity: usize, low_water: usize) -> Arc<MemoryBuffer> {
        Arc::new(MemoryBuffer::new(capacity, low_water))
    }

    #[test]
    fn test_write_then_drain() {
        let buf = buffer(8, 4);
        buf.write(b"abc").unwrap();
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.free_bytes(), 5);
        buf.close().unwrap();

        let mut out = Vec::new();
        let n = buf.drain_to(&mut out).unwrap();
        assert_eq!(n, 3);
        assert_eq!(out, b"abc");
        assert!(buf.is_empty());
        assert_eq!(buf.free_bytes(), 8);
    }

    #[test]
    fn test_exact_fit() {
        let buf = buffer(4, 4);
        buf.write(b"abcd").unwrap();
        assert_eq!(buf.free_bytes(), 0);
        assert!(buf.write(b"e").is_err());
    }

    #[test]
    fn test_wrap_around() {
        let buf = buffer(4, 1);
        let mut state = buf.state.lock();
        state.push(b"abc");
        let mut out = Vec::new();
        state.take_unread(&mut out);
        assert_eq!(out, b"abc");

        // Tail is at 3; this write wraps.
        state.push(b"defg");
        assert_eq!(state.tail, 3);
        out.clear();
        state.take_unread(&mut out);
        assert_eq!(out, b"defg");
        assert_eq!(state.free, 4);
    }

    #[test]
    fn test_write_after_close() {
        let buf = buffer(4, 1);
        buf.close().unwrap();
        assert!(matches!(buf.write(b"a"), Err(QueueError::Closed)));
        assert!(buf.is_closed());
    }

    #[test]
    fn test_reader_waits_for_low_water() {
        let buf = buffer(16, 4);
        let reader_buf = Arc::clone(&buf);
        let (tx, rx) = mpsc::channel();

        let reader = thread::spawn(move || {
            let mut sink = ChannelSink(tx);
            reader_buf.drain_to(&mut sink).unwrap()
        });

        buf.write(b"ab").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        buf.write(b"cd").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"abcd");

        buf.close().unwrap();
        assert_eq!(reader.join().unwrap(), 4);
    }

    #[test]
    fn test_flush_wakes_reader() {
        let buf = buffer(16, 8);
        let reader_buf = Arc::clone(&buf);
        let (tx, rx) = mpsc::channel();

        let reader = thread::spawn(move || {
            let mut sink = ChannelSink(tx);
            reader_buf.drain_to(&mut sink).unwrap()
        });

        buf.write(b"hi").unwrap();
        buf.flush().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"hi");

        buf.close().unwrap();
        assert_eq!(reader.join().unwrap(), 2);
    }

    #[test]
    fn test_interrupt_wakes_reader() {
        let interrupt = Arc::new(Interrupt::default());
        let buf = Arc::new(MemoryBuffer::with_interrupt(16, 8, Arc::clone(&interrupt)));
        let reader_buf = Arc::clone(&buf);

        let reader = thread::spawn(move || reader_buf.drain_to(&mut Vec::new()));

        thread::sleep(Duration::from_millis(20));
        interrupt.raise();
        buf.wake();

        assert!(matches!(
            reader.join().unwrap(),
            Err(QueueError::Interrupted)
        ));
    }

    #[test]
    fn test_sink_error_propagates() {
        let buf = buffer(8, 1);
        buf.write(b"abc").unwrap();
        buf.close().unwrap();

        let mut sink = FailingSink;
        assert!(matches!(buf.drain_to(&mut sink), Err(QueueError::Io(_))));
    }

    struct ChannelSink(mpsc::Sender<Vec<u8>>);

    impl Write for ChannelSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0
                .send(buf.to_vec())
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
