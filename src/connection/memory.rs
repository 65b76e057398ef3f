//! In-memory connection.
//!
//! Bytes written are handed to a responder whose output becomes readable
//! input. The mock device uses an echoing responder; tests plug in
//! simulated bootloaders.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use super::{Connection, DataAvailableListener, SerialPortMode};
use crate::config::DEFAULT_NORMAL_BAUD;
use crate::error::{DriverError, DriverResult};

/// Produces the bytes "the device" answers to one write.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// Control line or port setting change recorded by [`MemoryConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Dtr(bool),
    Rts(bool),
    Baud(u32),
    Mode(SerialPortMode),
}

struct Wire {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    events: Vec<ControlEvent>,
    baud_rate: u32,
    connected: bool,
}

/// [`Connection`] that lives entirely in memory.
pub struct MemoryConnection {
    wire: Mutex<Wire>,
    readable: Condvar,
    responder: Mutex<Option<Responder>>,
    listeners: RwLock<Vec<DataAvailableListener>>,
}

impl MemoryConnection {
    fn build(responder: Option<Responder>) -> Self {
        Self {
            wire: Mutex::new(Wire {
                inbound: VecDeque::new(),
                written: Vec::new(),
                events: Vec::new(),
                baud_rate: DEFAULT_NORMAL_BAUD,
                connected: true,
            }),
            readable: Condvar::new(),
            responder: Mutex::new(responder),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// A connection whose peer never answers.
    pub fn silent() -> Self {
        Self::build(None)
    }

    /// A connection whose peer echoes every write.
    pub fn echo() -> Self {
        Self::build(Some(Box::new(|data: &[u8]| data.to_vec())))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self::build(Some(Box::new(responder)))
    }

    /// Make `data` readable as if the peer had sent it.
    pub fn inject(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.lock_wire().inbound.extend(data.iter().copied());
        self.readable.notify_all();
        self.fire_listeners();
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock_wire().written.clone()
    }

    /// Control line and setting changes in the order they happened.
    pub fn events(&self) -> Vec<ControlEvent> {
        self.lock_wire().events.clone()
    }

    fn lock_wire(&self) -> MutexGuard<'_, Wire> {
        self.wire
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connected_wire(&self) -> DriverResult<MutexGuard<'_, Wire>> {
        let wire = self.lock_wire();
        if !wire.connected {
            return Err(DriverError::NotConnected);
        }
        Ok(wire)
    }

    fn fire_listeners(&self) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for listener in listeners.iter() {
            listener();
        }
    }
}

impl Connection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.lock_wire().connected
    }

    fn write(&self, data: &[u8]) -> DriverResult<()> {
        self.connected_wire()?.written.extend_from_slice(data);

        let reply = {
            let mut responder = self
                .responder
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match responder.as_mut() {
                Some(respond) => respond(data),
                None => Vec::new(),
            }
        };
        self.inject(&reply);
        Ok(())
    }

    fn read(&self, buffer: &mut [u8], timeout: Duration) -> DriverResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut wire = self.connected_wire()?;

        while wire.inbound.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            wire = self
                .readable
                .wait_timeout(wire, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            if !wire.connected {
                return Err(DriverError::NotConnected);
            }
        }

        let count = buffer.len().min(wire.inbound.len());
        for (slot, byte) in buffer.iter_mut().zip(wire.inbound.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn bytes_available(&self) -> DriverResult<usize> {
        Ok(self.connected_wire()?.inbound.len())
    }

    fn flush(&self) -> DriverResult<()> {
        self.connected_wire().map(|_| ())
    }

    fn clear_input(&self) -> DriverResult<()> {
        self.connected_wire()?.inbound.clear();
        Ok(())
    }

    fn set_mode(&self, mode: SerialPortMode) -> DriverResult<()> {
        self.connected_wire()?.events.push(ControlEvent::Mode(mode));
        Ok(())
    }

    fn baud_rate(&self) -> DriverResult<u32> {
        Ok(self.connected_wire()?.baud_rate)
    }

    fn set_baud_rate(&self, baud_rate: u32) -> DriverResult<()> {
        let mut wire = self.connected_wire()?;
        wire.baud_rate = baud_rate;
        wire.events.push(ControlEvent::Baud(baud_rate));
        Ok(())
    }

    fn set_dtr(&self, level: bool) -> DriverResult<()> {
        self.connected_wire()?.events.push(ControlEvent::Dtr(level));
        Ok(())
    }

    fn set_rts(&self, level: bool) -> DriverResult<()> {
        self.connected_wire()?.events.push(ControlEvent::Rts(level));
        Ok(())
    }

    fn add_data_available_listener(&self, listener: DataAvailableListener) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }

    fn close(&self) -> DriverResult<()> {
        self.lock_wire().connected = false;
        self.readable.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_echo_round_trip() {
        let connection = MemoryConnection::echo();
        connection.write(b"ping").unwrap();

        let mut buffer = [0u8; 8];
        let read = connection
            .read(&mut buffer, Duration::from_millis(10))
            .unwrap();
        assert_eq!(&buffer[..read], b"ping");
        assert_eq!(connection.written(), b"ping");
    }

    #[test]
    fn test_read_times_out_with_zero() {
        let connection = MemoryConnection::silent();
        let mut buffer = [0u8; 4];
        let read = connection
            .read(&mut buffer, Duration::from_millis(20))
            .unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn test_read_wakes_on_inject() {
        let connection = Arc::new(MemoryConnection::silent());
        let injector = Arc::clone(&connection);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            injector.inject(&[0x90]);
        });

        let mut buffer = [0u8; 1];
        let read = connection.read(&mut buffer, Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
        assert_eq!(read, 1);
        assert_eq!(buffer[0], 0x90);
    }

    #[test]
    fn test_listeners_fire_on_inbound_data() {
        let connection = MemoryConnection::silent();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        connection.add_data_available_listener(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        connection.inject(&[1, 2]);
        connection.inject(&[]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_connection_rejects_io() {
        let connection = MemoryConnection::echo();
        connection.close().unwrap();
        assert!(!connection.is_connected());
        assert!(matches!(
            connection.write(b"x"),
            Err(DriverError::NotConnected)
        ));
    }

    #[test]
    fn test_records_control_events() {
        let connection = MemoryConnection::silent();
        connection.set_rts(true).unwrap();
        connection.set_dtr(false).unwrap();
        connection.set_baud_rate(9600).unwrap();
        assert_eq!(
            connection.events(),
            vec![
                ControlEvent::Rts(true),
                ControlEvent::Dtr(false),
                ControlEvent::Baud(9600)
            ]
        );
        assert_eq!(connection.baud_rate().unwrap(), 9600);
    }
}
