//! Byte-stream connections to a device.
//!
//! Engines and operations only see the [`Connection`] trait. The serial
//! implementation talks to real hardware; the in-memory one backs the mock
//! device and the simulated bootloaders used in tests.

mod memory;
mod serial;

use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::error::DriverResult;

pub use memory::{ControlEvent, MemoryConnection, Responder};
pub use serial::{ProgramLines, SerialPortConnection, SerialSettings};

/// Callback fired from a transport-owned thread when inbound bytes arrive.
pub type DataAvailableListener = Box<dyn Fn() + Send + Sync>;

/// Electrical and line configuration of the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPortMode {
    /// Application firmware is running.
    Normal,
    /// A bootloader is expected on the other end.
    Program,
}

/// Bidirectional byte stream shared by the queue worker and the stream bridge.
///
/// All methods take `&self`; implementations synchronize internally.
#[cfg_attr(test, automock)]
pub trait Connection: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Write all of `data`.
    fn write(&self, data: &[u8]) -> DriverResult<()>;

    /// Read up to `buffer.len()` bytes, waiting at most `timeout`.
    ///
    /// # Returns
    /// Number of bytes read, 0 on timeout.
    fn read(&self, buffer: &mut [u8], timeout: Duration) -> DriverResult<usize>;

    /// Bytes that can be read without blocking.
    fn bytes_available(&self) -> DriverResult<usize>;

    /// Flush buffered output.
    fn flush(&self) -> DriverResult<()>;

    /// Discard pending input.
    fn clear_input(&self) -> DriverResult<()>;

    /// Switch between normal and programming configuration.
    fn set_mode(&self, mode: SerialPortMode) -> DriverResult<()>;

    fn baud_rate(&self) -> DriverResult<u32>;

    fn set_baud_rate(&self, baud_rate: u32) -> DriverResult<()>;

    /// Drive the DTR control line.
    fn set_dtr(&self, level: bool) -> DriverResult<()>;

    /// Drive the RTS control line.
    fn set_rts(&self, level: bool) -> DriverResult<()>;

    fn add_data_available_listener(&self, listener: DataAvailableListener);

    fn close(&self) -> DriverResult<()>;
}

/// Read a single byte, waiting at most `timeout`.
pub fn read_byte(connection: &dyn Connection, timeout: Duration) -> DriverResult<Option<u8>> {
    let mut byte = [0u8; 1];
    match connection.read(&mut byte, timeout)? {
        0 => Ok(None),
        _ => Ok(Some(byte[0])),
    }
}

/// Drop everything currently waiting in the input buffer.
pub fn drain_input(connection: &dyn Connection) -> DriverResult<usize> {
    let mut drained = 0;
    let mut buffer = [0u8; 256];
    loop {
        let available = connection.bytes_available()?;
        if available == 0 {
            return Ok(drained);
        }
        let chunk = available.min(buffer.len());
        let read = connection.read(&mut buffer[..chunk], Duration::ZERO)?;
        if read == 0 {
            return Ok(drained);
        }
        drained += read;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_byte_maps_timeout_to_none() {
        let mut connection = MockConnection::new();
        connection.expect_read().returning(|_, _| Ok(0));
        assert_eq!(
            read_byte(&connection, Duration::from_millis(1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_read_byte_returns_byte() {
        let mut connection = MockConnection::new();
        connection.expect_read().returning(|buffer, _| {
            buffer[0] = 0x90;
            Ok(1)
        });
        assert_eq!(
            read_byte(&connection, Duration::from_millis(1)).unwrap(),
            Some(0x90)
        );
    }

    #[test]
    fn test_drain_input() {
        let connection = MemoryConnection::silent();
        connection.inject(&[1, 2, 3, 4]);
        assert_eq!(drain_input(&connection).unwrap(), 4);
        assert_eq!(connection.bytes_available().unwrap(), 0);
    }
}
