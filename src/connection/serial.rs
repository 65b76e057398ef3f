//! Serial port connection.
//!
//! Wraps a `serialport` handle behind a mutex so the queue worker and the
//! stream bridge can share it, and runs a small monitor thread that tells
//! listeners when inbound bytes are waiting.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use serialport::SerialPort;

use super::{Connection, DataAvailableListener, SerialPortMode};
use crate::config::{
    DriverConfig, DATA_MONITOR_INTERVAL, DEFAULT_NORMAL_BAUD, DEFAULT_PROGRAM_BAUD,
    PORT_OPEN_RETRIES, PORT_OPEN_RETRY_DELAY, RESET_PULSE, SERIAL_READ_TIMEOUT,
};
use crate::error::{DriverError, DriverResult};

/// How the control lines are driven when entering programming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramLines {
    /// Only the baud rate changes.
    None,
    /// Hold DTR while pulsing RTS, which resets the chip into its bootloader.
    ResetPulse,
}

/// Baud rates and line policy of a serial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub normal_baud_rate: u32,
    pub program_baud_rate: u32,
    pub program_lines: ProgramLines,
}

impl SerialSettings {
    pub fn from_config(config: &DriverConfig, program_lines: ProgramLines) -> Self {
        Self {
            normal_baud_rate: config.normal_baud_rate,
            program_baud_rate: config.program_baud_rate,
            program_lines,
        }
    }
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            normal_baud_rate: DEFAULT_NORMAL_BAUD,
            program_baud_rate: DEFAULT_PROGRAM_BAUD,
            program_lines: ProgramLines::None,
        }
    }
}

type SharedPort = Arc<Mutex<Option<Box<dyn SerialPort>>>>;
type Listeners = Arc<RwLock<Vec<DataAvailableListener>>>;

/// [`Connection`] backed by an operating system serial port.
pub struct SerialPortConnection {
    port_name: String,
    settings: SerialSettings,
    port: SharedPort,
    listeners: Listeners,
    monitor_running: Arc<AtomicBool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl SerialPortConnection {
    /// Open `port_name` at the normal baud rate.
    ///
    /// Transient failures seen while a USB adapter re-enumerates are retried.
    pub fn open(port_name: &str, settings: SerialSettings) -> DriverResult<Self> {
        let normalized_name = normalize_port_name(port_name);
        let mut last_error: Option<serialport::Error> = None;

        for attempt in 0..PORT_OPEN_RETRIES {
            match serialport::new(&normalized_name, settings.normal_baud_rate)
                .timeout(SERIAL_READ_TIMEOUT)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
            {
                Ok(mut port) => {
                    // Both lines released so the chip runs its application.
                    port.write_data_terminal_ready(false).ok();
                    port.write_request_to_send(false).ok();
                    port.clear(serialport::ClearBuffer::Input).ok();

                    info!(
                        "Opened {} at {} baud",
                        normalized_name, settings.normal_baud_rate
                    );
                    return Ok(Self {
                        port_name: normalized_name,
                        settings,
                        port: Arc::new(Mutex::new(Some(port))),
                        listeners: Arc::new(RwLock::new(Vec::new())),
                        monitor_running: Arc::new(AtomicBool::new(false)),
                        monitor: Mutex::new(None),
                    });
                }
                Err(e) => {
                    let err_str = e.to_string().to_lowercase();
                    let is_transient = err_str.contains("not functioning")
                        || err_str.contains("temporarily unavailable")
                        || err_str.contains("interrupted");

                    if is_transient && attempt < PORT_OPEN_RETRIES - 1 {
                        debug!(
                            "Transient error opening {} (attempt {}): {}",
                            normalized_name,
                            attempt + 1,
                            e
                        );
                        thread::sleep(PORT_OPEN_RETRY_DELAY);
                        last_error = Some(e);
                        continue;
                    }

                    return Err(map_open_error(port_name, e));
                }
            }
        }

        Err(match last_error {
            Some(e) => DriverError::Serial(e),
            None => DriverError::PortNotFound {
                port: port_name.to_string(),
            },
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn settings(&self) -> SerialSettings {
        self.settings
    }

    fn lock_port(&self) -> MutexGuard<'_, Option<Box<dyn SerialPort>>> {
        self.port
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_port<R>(
        &self,
        f: impl FnOnce(&mut Box<dyn SerialPort>) -> DriverResult<R>,
    ) -> DriverResult<R> {
        let mut guard = self.lock_port();
        let port = guard.as_mut().ok_or(DriverError::NotConnected)?;
        f(port)
    }

    fn start_monitor(&self) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let port = Arc::clone(&self.port);
        let listeners = Arc::clone(&self.listeners);
        let running = Arc::clone(&self.monitor_running);
        let spawned = thread::Builder::new()
            .name(format!("serial-monitor-{}", self.port_name))
            .spawn(move || monitor_loop(port, listeners, running));

        match spawned {
            Ok(handle) => {
                *self
                    .monitor
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
            }
            Err(e) => {
                warn!("Could not start data monitor for {}: {}", self.port_name, e);
                self.monitor_running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn stop_monitor(&self) {
        self.monitor_running.store(false, Ordering::SeqCst);
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn monitor_loop(port: SharedPort, listeners: Listeners, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let available = {
            let guard = port.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match guard.as_ref() {
                Some(port) => port.bytes_to_read().unwrap_or(0),
                None => break,
            }
        };

        if available > 0 {
            let listeners = listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for listener in listeners.iter() {
                listener();
            }
        }

        thread::sleep(DATA_MONITOR_INTERVAL);
    }
}

fn map_open_error(port_name: &str, e: serialport::Error) -> DriverError {
    let err_str = e.to_string().to_lowercase();
    match e.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            DriverError::PortPermissionDenied {
                port: port_name.to_string(),
            }
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) | serialport::ErrorKind::NoDevice => {
            DriverError::PortNotFound {
                port: port_name.to_string(),
            }
        }
        _ if err_str.contains("busy") || err_str.contains("in use") => DriverError::PortBusy {
            port: port_name.to_string(),
        },
        _ => DriverError::Serial(e),
    }
}

impl Connection for SerialPortConnection {
    fn is_connected(&self) -> bool {
        self.lock_port().is_some()
    }

    fn write(&self, data: &[u8]) -> DriverResult<()> {
        self.with_port(|port| {
            port.write_all(data)?;
            Ok(())
        })
    }

    fn read(&self, buffer: &mut [u8], timeout: Duration) -> DriverResult<usize> {
        self.with_port(|port| {
            // A zero timeout would block forever on some platforms.
            port.set_timeout(timeout.max(Duration::from_millis(1)))?;
            match port.read(buffer) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(DriverError::Io(e)),
            }
        })
    }

    fn bytes_available(&self) -> DriverResult<usize> {
        self.with_port(|port| Ok(port.bytes_to_read()? as usize))
    }

    fn flush(&self) -> DriverResult<()> {
        self.with_port(|port| {
            port.flush()?;
            Ok(())
        })
    }

    fn clear_input(&self) -> DriverResult<()> {
        self.with_port(|port| {
            port.clear(serialport::ClearBuffer::Input)?;
            Ok(())
        })
    }

    fn set_mode(&self, mode: SerialPortMode) -> DriverResult<()> {
        debug!("Switching {} to {:?} mode", self.port_name, mode);
        let settings = self.settings;
        self.with_port(|port| {
            match (mode, settings.program_lines) {
                (SerialPortMode::Program, ProgramLines::ResetPulse) => {
                    port.write_data_terminal_ready(true)?;
                    port.write_request_to_send(true)?;
                    thread::sleep(RESET_PULSE);
                    port.write_request_to_send(false)?;
                    thread::sleep(RESET_PULSE);
                    port.write_data_terminal_ready(false)?;
                }
                (SerialPortMode::Normal, ProgramLines::ResetPulse) => {
                    port.write_data_terminal_ready(false)?;
                    port.write_request_to_send(false)?;
                }
                (_, ProgramLines::None) => {}
            }

            let baud_rate = match mode {
                SerialPortMode::Normal => settings.normal_baud_rate,
                SerialPortMode::Program => settings.program_baud_rate,
            };
            port.set_baud_rate(baud_rate)?;
            port.clear(serialport::ClearBuffer::Input)?;
            Ok(())
        })
    }

    fn baud_rate(&self) -> DriverResult<u32> {
        self.with_port(|port| Ok(port.baud_rate()?))
    }

    fn set_baud_rate(&self, baud_rate: u32) -> DriverResult<()> {
        debug!("Setting {} to {} baud", self.port_name, baud_rate);
        self.with_port(|port| Ok(port.set_baud_rate(baud_rate)?))
    }

    fn set_dtr(&self, level: bool) -> DriverResult<()> {
        self.with_port(|port| Ok(port.write_data_terminal_ready(level)?))
    }

    fn set_rts(&self, level: bool) -> DriverResult<()> {
        self.with_port(|port| Ok(port.write_request_to_send(level)?))
    }

    fn add_data_available_listener(&self, listener: DataAvailableListener) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
        self.start_monitor();
    }

    fn close(&self) -> DriverResult<()> {
        self.stop_monitor();
        if self.lock_port().take().is_some() {
            info!("Closed {}", self.port_name);
        }
        Ok(())
    }
}

impl Drop for SerialPortConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_port_name_passthrough() {
        assert_eq!(normalize_port_name("/dev/ttyUSB0"), "/dev/ttyUSB0");
        assert_eq!(normalize_port_name("COM1"), "COM1");
    }

    #[cfg(target_os = "windows")]
    #[test]
    fn test_normalize_port_name_windows_high_com() {
        assert_eq!(normalize_port_name("COM9"), "COM9");
        assert_eq!(normalize_port_name("COM10"), "\\\\.\\COM10");
    }

    #[test]
    fn test_settings_from_config() {
        let config = DriverConfig {
            normal_baud_rate: 9600,
            program_baud_rate: 19200,
            ..DriverConfig::default()
        };
        let settings = SerialSettings::from_config(&config, ProgramLines::ResetPulse);
        assert_eq!(settings.normal_baud_rate, 9600);
        assert_eq!(settings.program_baud_rate, 19200);
        assert_eq!(settings.program_lines, ProgramLines::ResetPulse);
    }

    #[test]
    fn test_open_missing_port_fails() {
        let result = SerialPortConnection::open(
            "/dev/wsn-drivers-no-such-port",
            SerialSettings::default(),
        );
        assert!(result.is_err());
    }
}
