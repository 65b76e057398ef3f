//! Byte streams exposed by the facade.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{trace, warn};

use super::submit_send;
use crate::config::STREAM_BUFFER_CAPACITY;
use crate::device::DeviceDriver;
use crate::queue::OperationQueue;

struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
    dropped: u64,
}

/// Buffer between the stream bridge and readers of the device stream.
///
/// Holds at most `capacity` bytes; when nobody reads, the oldest bytes go.
pub(crate) struct StreamBuffer {
    pipe: Mutex<Pipe>,
    readable: Condvar,
    capacity: usize,
}

impl StreamBuffer {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_capacity(STREAM_BUFFER_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            pipe: Mutex::new(Pipe {
                data: VecDeque::new(),
                closed: false,
                dropped: 0,
            }),
            readable: Condvar::new(),
            capacity: capacity.max(1),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Pipe> {
        self.pipe
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn push(&self, data: &[u8]) {
        let mut pipe = self.lock();
        if pipe.closed {
            return;
        }
        pipe.data.extend(data.iter().copied());
        let overflow = pipe.data.len().saturating_sub(self.capacity);
        if overflow > 0 {
            pipe.data.drain(..overflow);
            if pipe.dropped == 0 {
                warn!(
                    "Device stream is not being read, dropping oldest bytes beyond {}",
                    self.capacity
                );
            }
            pipe.dropped += overflow as u64;
        }
        self.readable.notify_all();
    }

    /// Bytes discarded because the buffer was full.
    pub(crate) fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    /// Readers drain what is left and then see end of stream.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
    }

    pub(crate) fn available(&self) -> usize {
        self.lock().data.len()
    }

    /// Wait for data, end of stream or the optional deadline.
    fn read(&self, buffer: &mut [u8], timeout: Option<Duration>) -> usize {
        if buffer.is_empty() {
            return 0;
        }
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut pipe = self.lock();

        while pipe.data.is_empty() && !pipe.closed {
            pipe = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return 0;
                    }
                    self.readable
                        .wait_timeout(pipe, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .readable
                    .wait(pipe)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            };
        }

        let count = buffer.len().min(pipe.data.len());
        for (slot, byte) in buffer.iter_mut().zip(pipe.data.drain(..count)) {
            *slot = byte;
        }
        count
    }
}

/// Live data sent by the device outside of any operation.
///
/// Clones share one buffer, so each byte goes to exactly one reader.
/// `read` blocks until data arrives and returns 0 once the facade is closed
/// and the buffer is drained.
#[derive(Clone)]
pub struct DeviceInputStream {
    buffer: Arc<StreamBuffer>,
}

impl DeviceInputStream {
    pub(crate) fn new(buffer: Arc<StreamBuffer>) -> Self {
        Self { buffer }
    }

    /// Bytes that can be read without blocking.
    pub fn available(&self) -> usize {
        self.buffer.available()
    }

    /// Like `read`, but gives up after `timeout`.
    ///
    /// # Returns
    /// Number of bytes read, 0 on timeout or end of stream.
    pub fn read_timeout(&mut self, buffer: &mut [u8], timeout: Duration) -> io::Result<usize> {
        Ok(self.buffer.read(buffer, Some(timeout)))
    }
}

impl Read for DeviceInputStream {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        Ok(self.buffer.read(buffer, None))
    }
}

/// Writer that turns flushed bytes into queued send operations.
///
/// Writes are buffered; `flush` submits them as one send and waits for it.
/// Dropping the stream flushes what is left.
pub struct DeviceOutputStream {
    driver: Arc<DeviceDriver>,
    queue: Arc<OperationQueue>,
    timeout: Duration,
    pending: Vec<u8>,
}

impl DeviceOutputStream {
    pub(crate) fn new(
        driver: Arc<DeviceDriver>,
        queue: Arc<OperationQueue>,
        timeout: Duration,
    ) -> Self {
        Self {
            driver,
            queue,
            timeout,
            pending: Vec::new(),
        }
    }
}

impl Write for DeviceOutputStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.pending);
        trace!("Flushing {} bytes to the device", data.len());
        submit_send(&self.driver, &self.queue, data, self.timeout)
            .and_then(|future| future.get())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl Drop for DeviceOutputStream {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
