//! A reader/writer coupler over a growing file.
//!
//! [`ConcurrentReadWriter`] wraps a random-access file so that one producer
//! can append to it while any number of readers stream the same bytes,
//! blocking for more data until the producer declares the stream complete.

use std::{
    fs::File,
    io::{self, Write},
    sync::Arc,
};

use tokio::sync::watch;

/// Stream state broadcast to blocked readers.
///
/// The version increases on every append; a reader snapshots it before a
/// positional read and awaits a change when the read comes up short.
#[derive(Debug, Clone, Copy, Default)]
struct StreamState {
    version: u64,
    closed: bool,
}

struct Shared {
    file: File,
    wake: watch::Sender<StreamState>,
    readers: watch::Sender<usize>,
}

/// Couples one appending producer with any number of blocking readers over a
/// single file.
///
/// Readers only observe end-of-stream once [`close`](Self::close) has been
/// called and the file has no bytes left at their offset.
pub(crate) struct ConcurrentReadWriter {
    shared: Arc<Shared>,
}

impl ConcurrentReadWriter {
    /// Wraps `file`, returning the coupler, the unique producer handle and
    /// an initial reader.
    pub(crate) fn new(file: File) -> (Self, StreamWriter, StreamReader) {
        let (wake, _) = watch::channel(StreamState::default());
        let (readers, _) = watch::channel(1usize);
        let shared = Arc::new(Shared {
            file,
            wake,
            readers,
        });
        let crw = Self {
            shared: shared.clone(),
        };
        let writer = StreamWriter {
            shared: shared.clone(),
        };
        let reader = StreamReader {
            shared,
            offset: 0,
            closed: false,
        };
        (crw, writer, reader)
    }

    /// Registers a new reader, or `None` when the stream is already closed.
    pub(crate) fn reader(&self) -> Option<StreamReader> {
        if self.shared.wake.borrow().closed {
            return None;
        }
        self.shared.readers.send_modify(|count| *count += 1);
        Some(StreamReader {
            shared: self.shared.clone(),
            offset: 0,
            closed: false,
        })
    }

    /// Marks the stream complete and waits for every reader to close.
    ///
    /// Blocked readers wake up, drain whatever the file still holds past
    /// their offset and then observe end-of-stream. The underlying file is
    /// released once the last handle drops.
    pub(crate) async fn close(&self) {
        self.shared.wake.send_modify(|state| state.closed = true);
        let mut readers = self.shared.readers.subscribe();
        // Cannot fail: `self.shared` keeps the sender alive for the wait.
        let _ = readers.wait_for(|count| *count == 0).await;
    }
}

/// The unique producing half of a [`ConcurrentReadWriter`].
///
/// Writes are strictly appending. Every append wakes all blocked readers.
pub struct StreamWriter {
    shared: Arc<Shared>,
}

impl Write for StreamWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let result = (&self.shared.file).write(buf);
        self.shared
            .wake
            .send_modify(|state| state.version = state.version.wrapping_add(1));
        result
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.shared.file).flush()
    }
}

/// A per-consumer cursor over a [`ConcurrentReadWriter`].
pub struct StreamReader {
    shared: Arc<Shared>,
    offset: u64,
    closed: bool,
}

impl StreamReader {
    /// Reads at the cursor, advancing it by the number of bytes returned.
    ///
    /// Returns `Ok(0)` only when the stream is complete and fully consumed,
    /// or when this reader has been closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.offset).await?;
        self.offset += n as u64;
        Ok(n)
    }

    /// Reads at `offset` without touching the cursor.
    ///
    /// Fills as much of `buf` as the file currently holds before parking, so
    /// a partially satisfied read does not re-park until it has drained what
    /// is already there. End-of-stream is never reported while the producer
    /// may still append.
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut filled = 0;
        loop {
            if self.closed {
                return Ok(0);
            }
            let mut wake = self.shared.wake.subscribe();
            let state = *wake.borrow_and_update();
            let n = read_file_at(&self.shared.file, &mut buf[filled..], offset + filled as u64)?;
            filled += n;
            if filled == buf.len() {
                return Ok(filled);
            }
            if n > 0 {
                // Keep draining until the file comes up empty.
                continue;
            }
            if state.closed {
                return Ok(filled);
            }
            // The snapshot above predates the read, so a write landing in
            // between makes this resolve immediately.
            let _ = wake.changed().await;
        }
    }

    /// Closes the reader. Idempotent; later reads return end-of-stream.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.readers.send_modify(|count| *count -= 1);
        }
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
pub(crate) fn read_file_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    loop {
        match file.read_at(buf, offset) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

#[cfg(windows)]
pub(crate) fn read_file_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
