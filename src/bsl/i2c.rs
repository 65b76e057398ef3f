//! Bit-banged I2C over the serial control lines.
//!
//! TelosB boards route the modem lines to an I2C switch that drives the
//! MSP430 reset and TCK pins. SCL is the inverted RTS line, SDA the
//! inverted DTR line.

use crate::connection::Connection;
use crate::error::DriverResult;

/// Base address byte of the switch; the 3-bit device address is shifted in.
const SWITCH_ADDRESS: u8 = 0x90;

/// Switch commands that start the bootloader.
pub const INVOKE_BSL_SEQUENCE: [u8; 7] = [1, 3, 1, 3, 2, 0, 0];

/// Switch commands that restart the application.
pub const RESET_SEQUENCE: [u8; 3] = [3, 2, 0];

pub struct I2cBus<'a> {
    connection: &'a dyn Connection,
}

impl<'a> I2cBus<'a> {
    pub fn new(connection: &'a dyn Connection) -> Self {
        Self { connection }
    }

    fn set_scl(&self, level: bool) -> DriverResult<()> {
        self.connection.set_rts(!level)
    }

    fn set_sda(&self, level: bool) -> DriverResult<()> {
        self.connection.set_dtr(!level)
    }

    fn start(&self) -> DriverResult<()> {
        self.set_sda(true)?;
        self.set_scl(true)?;
        self.set_sda(false)
    }

    fn stop(&self) -> DriverResult<()> {
        self.set_sda(false)?;
        self.set_scl(true)?;
        self.set_sda(true)
    }

    fn write_bit(&self, bit: bool) -> DriverResult<()> {
        self.set_scl(false)?;
        self.set_sda(bit)?;
        self.set_scl(true)?;
        self.set_scl(false)
    }

    /// Write a byte MSB first followed by a zero acknowledge bit.
    fn write_byte(&self, byte: u8) -> DriverResult<()> {
        for shift in (0..8).rev() {
            self.write_bit(byte & (1 << shift) != 0)?;
        }
        self.write_bit(false)
    }

    /// Send one command byte to the switch at `address`.
    pub fn write_command(&self, address: u8, command: u8) -> DriverResult<()> {
        self.start()?;
        self.write_byte(SWITCH_ADDRESS | (address << 1))?;
        self.write_byte(command)?;
        self.stop()
    }

    pub fn write_sequence(&self, address: u8, commands: &[u8]) -> DriverResult<()> {
        for &command in commands {
            self.write_command(address, command)?;
        }
        Ok(())
    }
}
