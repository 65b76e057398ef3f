//! Drivers for wireless sensor node boards.
//!
//! The crate flashes and talks to TelosB (MSP430 BSL), Jennic and Pacemate
//! nodes over a serial line, and offers a mock device for front ends
//! without hardware.
//!
//! # Overview
//!
//! 1. **Connection** - byte stream to the board ([`connection`])
//! 2. **Operations** - cancellable, timeout-bounded units of work with
//!    nested progress ([`operation`])
//! 3. **Queue** - runs operations one at a time ([`queue`])
//! 4. **Devices** - per-family operation factories ([`device`])
//! 5. **Facade** - queued commands plus a live data stream ([`facade`])
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wsn_drivers::connection::{ProgramLines, SerialSettings};
//! use wsn_drivers::{create_device_async, AsyncAdapter, DeviceType, DriverConfig, SerialPortConnection};
//!
//! let config = DriverConfig::default();
//! let settings = SerialSettings::from_config(&config, ProgramLines::None);
//! let connection = SerialPortConnection::open("/dev/ttyUSB0", settings)?;
//! let device = create_device_async(DeviceType::Telosb, Arc::new(connection), &config)?;
//!
//! let image = std::fs::read("app.ihex")?;
//! device.program(image, 120_000, AsyncAdapter)?.get()?;
//! device.close();
//! ```

pub mod bsl;
pub mod config;
pub mod connection;
pub mod datalogger;
pub mod device;
pub mod error;
pub mod facade;
pub mod operation;
pub mod queue;

#[cfg(test)]
mod test_helpers;

pub use config::DriverConfig;
pub use connection::{Connection, MemoryConnection, SerialPortConnection, SerialPortMode};
pub use datalogger::{BracketFilter, DataLogger};
pub use device::{ChipType, DeviceDriver, DeviceType, MacAddress};
pub use error::{DriverError, DriverResult};
pub use facade::{
    create_device_async, create_mock_device_async, DeviceAsync, DeviceInputStream,
    DeviceOutputStream,
};
pub use operation::{AsyncAdapter, AsyncCallback, Operation, OperationContext, State};
pub use queue::{OperationFuture, OperationQueue, OperationQueueListener};
