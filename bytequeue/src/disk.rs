//! Disk-backed overflow stage.
//!
//! Spilled bytes are appended to a sequence of chunk files named
//! `{prefix}_{sequence}`. A chunk is flushed and closed before its path is
//! queued for the reader, and the reader deletes each chunk once it has been
//! copied to the sink.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{QueueConfig, chunk_path};
use crate::error::{QueueError, Result};
use crate::fifo::Fifo;
use crate::stage::{Buffer, Interrupt};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// A consumer-side failure remembered for the writer.
///
/// The reader cannot stop the writer directly, so a sink failure during the
/// disk phase is parked here and re-raised by the next write. The first
/// failure wins and stays recorded.
#[derive(Debug, Default)]
pub struct FailureCell {
    slot: Mutex<Option<Arc<io::Error>>>,
}

impl FailureCell {
    /// Records `err` unless a failure is already recorded.
    pub fn record(&self, err: Arc<io::Error>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Returns the recorded failure, if any.
    pub fn get(&self) -> Option<Arc<io::Error>> {
        self.slot.lock().clone()
    }

    /// Fails with [`QueueError::SinkFailed`] if a failure is recorded.
    pub fn check(&self) -> Result<()> {
        match self.get() {
            Some(err) => Err(QueueError::SinkFailed(err)),
            None => Ok(()),
        }
    }
}

enum ChunkMsg {
    Ready(PathBuf),
    End,
}

struct OpenChunk {
    path: PathBuf,
    file: BufWriter<File>,
    written: u64,
}

struct ChunkWriter {
    current: Option<OpenChunk>,
    next_sequence: u64,
    closed: bool,
}

/// The unbounded, disk-backed stage of a queue.
pub struct DiskBuffer {
    dir: PathBuf,
    prefix: String,
    chunk_size: u64,
    writer: Mutex<ChunkWriter>,
    ready: Fifo<ChunkMsg>,
    failure: FailureCell,
    interrupt: Arc<Interrupt>,
}

impl DiskBuffer {
    /// Creates the disk stage and opens its first chunk in
    /// `config.temp_dir`.
    pub fn create(config: &QueueConfig) -> Result<Self> {
        Self::with_interrupt(config, Arc::new(Interrupt::default()))
    }

    pub(crate) fn with_interrupt(config: &QueueConfig, interrupt: Arc<Interrupt>) -> Result<Self> {
        let disk = DiskBuffer {
            dir: config.temp_dir.clone(),
            prefix: config.prefix.clone(),
            chunk_size: config.chunk_size,
            writer: Mutex::new(ChunkWriter {
                current: None,
                next_sequence: 0,
                closed: false,
            }),
            ready: Fifo::new(),
            failure: FailureCell::default(),
            interrupt,
        };

        {
            let mut writer = disk.writer.lock();
            let chunk = disk.open_chunk(&mut writer)?;
            writer.current = Some(chunk);
        }
        Ok(disk)
    }

    /// Returns the number of chunk files created so far.
    pub fn chunks_created(&self) -> u64 {
        self.writer.lock().next_sequence
    }

    /// Returns the number of sealed chunks waiting for the reader.
    pub fn pending_chunks(&self) -> usize {
        self.ready.len()
    }

    /// Returns the remembered consumer-side failure, if any.
    pub fn failure(&self) -> Option<Arc<io::Error>> {
        self.failure.get()
    }

    fn open_chunk(&self, writer: &mut ChunkWriter) -> Result<OpenChunk> {
        let path = chunk_path(&self.dir, &self.prefix, writer.next_sequence);
        let file = File::options().write(true).create_new(true).open(&path)?;
        writer.next_sequence += 1;
        trace!(path = %path.display(), "bytequeue: chunk opened");
        Ok(OpenChunk {
            path,
            file: BufWriter::new(file),
            written: 0,
        })
    }

    /// Flushes and closes the open chunk, then hands it to the reader.
    fn seal_current(&self, writer: &mut ChunkWriter) -> Result<()> {
        let Some(chunk) = writer.current.take() else {
            return Ok(());
        };

        let file = match chunk.file.into_inner() {
            Ok(file) => file,
            Err(e) => {
                let err = e.into_error();
                remove_quietly(&chunk.path);
                return Err(err.into());
            }
        };
        drop(file);

        trace!(
            path = %chunk.path.display(),
            bytes = chunk.written,
            "bytequeue: chunk sealed"
        );
        self.ready.push(ChunkMsg::Ready(chunk.path));
        Ok(())
    }

    /// Copies one chunk to `sink` and deletes it.
    ///
    /// On failure the chunk is put back at the head of the FIFO so that
    /// `cleanup` can remove it.
    fn consume_chunk(&self, path: PathBuf, sink: &mut dyn Write) -> Result<u64> {
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                self.ready.push_front(ChunkMsg::Ready(path));
                return Err(e.into());
            }
        };

        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut copied = 0u64;
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.ready.push_front(ChunkMsg::Ready(path));
                    return Err(e.into());
                }
            };
            if let Err(e) = sink.write_all(&buf[..n]) {
                return Err(self.sink_failed(path, e));
            }
            copied += n as u64;
        }
        if let Err(e) = sink.flush() {
            return Err(self.sink_failed(path, e));
        }
        drop(file);

        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "bytequeue: failed to delete consumed chunk");
        } else {
            trace!(path = %path.display(), bytes = copied, "bytequeue: chunk consumed");
        }
        Ok(copied)
    }

    fn sink_failed(&self, path: PathBuf, err: io::Error) -> QueueError {
        warn!(
            path = %path.display(),
            error = %err,
            "bytequeue: sink failed while draining spilled data"
        );
        self.ready.push_front(ChunkMsg::Ready(path));
        let err = Arc::new(err);
        self.failure.record(Arc::clone(&err));
        QueueError::SinkFailed(err)
    }
}

impl Buffer for DiskBuffer {
    fn free_bytes(&self) -> usize {
        usize::MAX
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.failure.check()?;
        if data.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        if writer.closed {
            return Err(QueueError::Closed);
        }
        if writer.current.is_none() {
            let chunk = self.open_chunk(&mut writer)?;
            writer.current = Some(chunk);
        }

        let full = match writer.current.as_mut() {
            Some(chunk) => {
                chunk.file.write_all(data)?;
                chunk.written += data.len() as u64;
                chunk.written >= self.chunk_size
            }
            None => false,
        };

        if full {
            self.seal_current(&mut writer)?;
            let chunk = self.open_chunk(&mut writer)?;
            writer.current = Some(chunk);
        }
        Ok(())
    }

    /// Pushes buffered bytes to the open chunk file. They reach the reader
    /// when the chunk is sealed.
    fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if let Some(chunk) = writer.current.as_mut() {
            chunk.file.flush()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if writer.closed {
            return Ok(());
        }
        writer.closed = true;

        let result = self.seal_current(&mut writer);
        self.ready.push(ChunkMsg::End);
        debug!(
            chunks = writer.next_sequence,
            "bytequeue: disk buffer closed"
        );
        result
    }

    fn drain_to(&self, sink: &mut dyn Write) -> Result<u64> {
        let mut total = 0u64;
        loop {
            match self.ready.pop(&self.interrupt) {
                Ok(ChunkMsg::Ready(path)) => total += self.consume_chunk(path, sink)?,
                Ok(ChunkMsg::End) => return Ok(total),
                Err(e) => {
                    debug!(drained = total, "bytequeue: disk drain interrupted");
                    return Err(e);
                }
            }
        }
    }

    fn cleanup(&self) -> Result<()> {
        let mut first_err = None;
        let mut removed = 0usize;
        let mut ended = false;

        while let Some(msg) = self.ready.try_pop() {
            let ChunkMsg::Ready(path) = msg else {
                ended = true;
                continue;
            };
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "bytequeue: failed to remove chunk");
                    first_err.get_or_insert(e);
                }
            }
        }

        // A later drain_to must still see end-of-stream.
        if ended {
            self.ready.push(ChunkMsg::End);
        }

        debug!(removed, "bytequeue: disk cleanup");
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn wake(&self) {
        self.ready.wake();
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        let writer = self.writer.get_mut();
        if let Some(chunk) = writer.current.take() {
            drop(chunk.file);
            remove_quietly(&chunk.path);
        }
        for msg in self.ready.take_all() {
            if let ChunkMsg::Ready(path) = msg {
                remove_quietly(&path);
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "bytequeue: failed to remove chunk"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn chunk_files(dir: &Path) -> usize {
        fs::read_dir(dir).unwrap().count()
    }

    fn disk(dir: &Path, chunk_size: u64) -> Arc<DiskBuffer> {
        let config = QueueConfig::new(dir, "test").with_chunk_size(chunk_size);
        Arc::new(DiskBuffer::create(&config).unwrap())
    }

    #[test]
    fn test_first_chunk_opened_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let buf = disk(dir.path(), 8);
        assert_eq!(buf.chunks_created(), 1);
        assert!(dir.path().join("test_0").exists());
        assert_eq!(buf.free_bytes(), usize::MAX);
    }

    #[test]
    fn test_chunks_sealed_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let buf = disk(dir.path(), 8);

        buf.write(b"0123").unwrap();
        assert_eq!(buf.pending_chunks(), 0);

        buf.write(b"4567").unwrap();
        assert_eq!(buf.pending_chunks(), 1);
        assert_eq!(buf.chunks_created(), 2);
        assert_eq!(fs::read(dir.path().join("test_0")).unwrap(), b"01234567");

        buf.close().unwrap();
        // Sealed final chunk plus the end marker.
        assert_eq!(buf.pending_chunks(), 3);
    }

    #[test]
    fn test_drain_deletes_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let buf = disk(dir.path(), 4);
        buf.write(b"hello ").unwrap();
        buf.write(b"world").unwrap();
        buf.close().unwrap();

        let mut out = Vec::new();
        assert_eq!(buf.drain_to(&mut out).unwrap(), 11);
        assert_eq!(out, b"hello world");
        assert_eq!(chunk_files(dir.path()), 0);
    }

    #[test]
    fn test_concurrent_drain() {
        let dir = tempfile::tempdir().unwrap();
        let buf = disk(dir.path(), 16);
        let reader_buf = Arc::clone(&buf);

        let reader = thread::spawn(move || {
            let mut out = Vec::new();
            reader_buf.drain_to(&mut out).unwrap();
            out
        });

        let mut expected = Vec::new();
        for i in 0..100u8 {
            buf.write(&[i; 3]).unwrap();
            expected.extend_from_slice(&[i; 3]);
        }
        buf.close().unwrap();

        assert_eq!(reader.join().unwrap(), expected);
    }

    #[test]
    fn test_write_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let buf = disk(dir.path(), 8);
        buf.close().unwrap();
        assert!(matches!(buf.write(b"x"), Err(QueueError::Closed)));
    }

    #[test]
    fn test_cleanup_without_reader() {
        let dir = tempfile::tempdir().unwrap();
        let buf = disk(dir.path(), 2);
        buf.write(b"abcdef").unwrap();
        buf.write(b"gh").unwrap();
        buf.close().unwrap();
        assert_eq!(chunk_files(dir.path()), 3);

        buf.cleanup().unwrap();
        assert_eq!(chunk_files(dir.path()), 0);

        // The end marker survives the sweep, so a late drain does not hang.
        let mut out = Vec::new();
        assert_eq!(buf.drain_to(&mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_sink_failure_reaches_writer() {
        let dir = tempfile::tempdir().unwrap();
        let buf = disk(dir.path(), 4);
        buf.write(b"abcd").unwrap();

        let mut sink = FailingSink;
        let err = buf.drain_to(&mut sink).unwrap_err();
        assert!(matches!(err, QueueError::SinkFailed(_)));
        assert!(buf.failure().is_some());

        // The writer learns about it on its next write.
        assert!(matches!(buf.write(b"e"), Err(QueueError::SinkFailed(_))));

        buf.close().unwrap();
        buf.cleanup().unwrap();
        assert_eq!(chunk_files(dir.path()), 0);
    }

    #[test]
    fn test_interrupted_drain() {
        let dir = tempfile::tempdir().unwrap();
        let interrupt = Arc::new(Interrupt::default());
        let config = QueueConfig::new(dir.path(), "test").with_chunk_size(8);
        let buf = Arc::new(DiskBuffer::with_interrupt(&config, Arc::clone(&interrupt)).unwrap());
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
    fn test_drop_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let buf = disk(dir.path(), 2);
        buf.write(b"abcd").unwrap();
        assert_eq!(chunk_files(dir.path()), 2);

        drop(buf);
        assert_eq!(chunk_files(dir.path()), 0);
    }

    #[test]
    fn test_failure_cell_first_wins() {
        let cell = FailureCell::default();
        assert!(cell.check().is_ok());

        cell.record(Arc::new(io::Error::new(io::ErrorKind::BrokenPipe, "first")));
        cell.record(Arc::new(io::Error::new(io::ErrorKind::Other, "second")));
        assert_eq!(cell.get().unwrap().to_string(), "first");
        assert!(matches!(cell.check(), Err(QueueError::SinkFailed(_))));
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
