//! Protocol constants and runtime tunables.
//!
//! Constants are fixed by the bootloader firmware and must stay bit-exact.
//! Tunables live in [`DriverConfig`], which can be loaded from a JSON file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DriverResult;

// ============================================================================
// MSP430 BSL Command Bytes
// ============================================================================

/// Mass erase.
pub const CMD_MASSERASE: u8 = 0x18;

/// Transmit password.
pub const CMD_TXPASSWORD: u8 = 0x10;

/// Transmit data block (flash write).
pub const CMD_TXDATABLOCK: u8 = 0x12;

/// Load program counter.
pub const CMD_LOADPC: u8 = 0x1A;

/// Receive data block (flash read).
pub const CMD_RXDATABLOCK: u8 = 0x14;

/// Receive BSL version.
pub const CMD_RXBSLVERSION: u8 = 0x1E;

/// Change baud rate.
pub const CMD_CHANGEBAUD: u8 = 0x20;

// ============================================================================
// MSP430 BSL Reply Bytes
// ============================================================================

/// Data acknowledge.
pub const DATA_ACK: u8 = 0x90;

/// Data not acknowledged.
pub const DATA_NACK: u8 = 0xA0;

/// Synchronization byte sent before every command.
pub const BSL_SYNC: u8 = 0x80;

/// Synchronization acknowledge.
pub const SYNC_ACK: u8 = 0x90;

/// First byte of every command and data frame.
pub const BSL_HDR: u8 = 0x80;

/// Fill byte for odd payloads.
pub const BSL_PAD: u8 = 0xFF;

// ============================================================================
// MSP430 BSL Framing
// ============================================================================

/// Maximum number of pure data bytes in one frame.
pub const BSL_MAX_DATA: usize = 250;

/// Length of the BSL password block.
pub const BSL_PASSWORD_LENGTH: usize = 32;

/// Start address of the BSL 1.10 patch.
pub const BSL_PATCH_ADDRESS: u16 = 0x0220;

/// Address and length words that unlock a mass erase.
pub const MASS_ERASE_ADDRESS: u16 = 0xFF00;
pub const MASS_ERASE_LENGTH: u16 = 0xA506;

/// Erased flash cells read back as all bits set.
pub const ERASED_CELL: u8 = 0xFF;

/// CHANGEBAUD parameters per baud rate: (address word, length word).
///
/// The address word carries the DCO and basic clock settings for the
/// F1x family; the length word selects the baud divider.
pub const BSL_BAUD_TABLE: [(u32, u16, u16); 3] = [
    (9600, 0x8580, 0x0000),
    (19200, 0x85E0, 0x0001),
    (38400, 0x87E0, 0x0002),
];

// ============================================================================
// MSP430 BSL Timing and Retries
// ============================================================================

/// Time to wait for a reply frame.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 2000;

/// Time to wait for the answer to a single sync byte.
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 500;

/// Maximum sync attempts when the caller does not ask to wait forever.
pub const DEFAULT_SYNC_RETRIES: u32 = 10;

/// Resynchronization rounds when the bootloader answers sync with garbage.
pub const SYNC_RECOVERY_ATTEMPTS: u32 = 3;

/// Retries while reading the remainder of a reply header.
pub const HEADER_READ_RETRIES: u32 = 3;

/// Retries while reading reply payload bytes.
pub const PAYLOAD_READ_RETRIES: u32 = 5;

/// Slice used while polling for inbound data.
pub const DATA_AVAILABLE_POLL: Duration = Duration::from_millis(50);

/// Oscillator settle time after the I2C reset sequences.
pub const OSCILLATOR_SETTLE: Duration = Duration::from_millis(250);

/// Baud rate the BSL starts with after every reset.
pub const BSL_INITIAL_BAUD: u32 = 9600;

// ============================================================================
// Jennic Bootloader
// ============================================================================

/// Largest payload accepted by one flash program message.
pub const JENNIC_BLOCK_SIZE: usize = 128;

/// Block size used for flash reads.
pub const FLASH_READ_BLOCK_SIZE: usize = 32;

/// Sector size shared by all supported Jennic flash parts.
pub const JENNIC_SECTOR_SIZE: usize = 0x8000;

/// Number of flash sectors on a Jennic module.
pub const JENNIC_SECTOR_COUNT: usize = 4;

/// RAM word holding the chip identification on bootloaders without a chip
/// id command.
pub const JENNIC_CHIP_ID_RAM_ADDRESS: u32 = 0x1000_00FC;

// ============================================================================
// Pacemate ISP
// ============================================================================

/// Crystal frequency reported during autobaud, in kHz.
pub const PACEMATE_CRYSTAL_KHZ: u32 = 14746;

/// Part identifier of the LPC2136.
pub const LPC2136_PART_ID: &str = "196387";

/// Highest flash sector of the LPC2136.
pub const LPC2136_LAST_SECTOR: u32 = 10;

// ============================================================================
// Device Control Lines
// ============================================================================

/// Hold time of a reset pulse on RTS.
pub const RESET_PULSE: Duration = Duration::from_millis(200);

/// Default baud rate of the application firmware.
pub const DEFAULT_NORMAL_BAUD: u32 = 115_200;

/// Default baud rate of the bootloaders.
pub const DEFAULT_PROGRAM_BAUD: u32 = 38_400;

/// Read timeout configured when a port is opened.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Attempts to open a port that reports a transient error.
pub const PORT_OPEN_RETRIES: u32 = 10;

/// Delay between port open attempts.
pub const PORT_OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Interval of the inbound data monitor of a serial connection.
pub const DATA_MONITOR_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Stream Bridge and Mock Device
// ============================================================================

/// Poll interval of the live data bridge.
pub const BRIDGE_POLL_INTERVAL_MS: u64 = 50;

/// Bytes the live data stream holds for readers before dropping the oldest.
pub const STREAM_BUFFER_CAPACITY: usize = 64 * 1024;

/// Iterations of a mock operation.
pub const MOCK_DEFAULT_STEPS: u32 = 10;

/// Sleep between mock operation iterations.
pub const MOCK_DEFAULT_SLEEP_MS: u64 = 100;

/// Size of the simulated flash of the mock device.
pub const MOCK_FLASH_SIZE: usize = 0x2_0000;

/// Runtime tunables for engines and the facade.
///
/// Every field falls back to its default when missing from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverConfig {
    /// Time to wait for a reply frame, in milliseconds.
    pub reply_timeout_ms: u64,

    /// Time to wait for a sync acknowledge, in milliseconds.
    pub sync_timeout_ms: u64,

    /// Sync attempts before giving up.
    pub sync_retries: u32,

    /// Baud rate used while the application firmware runs.
    pub normal_baud_rate: u32,

    /// Baud rate used while a bootloader is active.
    pub program_baud_rate: u32,

    /// Read back every written block and compare it.
    pub verify_writes: bool,

    /// Poll interval of the live data bridge, in milliseconds.
    pub bridge_poll_interval_ms: u64,

    /// Iterations of a mock operation.
    pub mock_steps: u32,

    /// Sleep between mock iterations, in milliseconds.
    pub mock_sleep_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            sync_retries: DEFAULT_SYNC_RETRIES,
            normal_baud_rate: DEFAULT_NORMAL_BAUD,
            program_baud_rate: DEFAULT_PROGRAM_BAUD,
            verify_writes: true,
            bridge_poll_interval_ms: BRIDGE_POLL_INTERVAL_MS,
            mock_steps: MOCK_DEFAULT_STEPS,
            mock_sleep_ms: MOCK_DEFAULT_SLEEP_MS,
        }
    }
}

impl DriverConfig {
    /// Load configuration from disk, returning defaults if the file doesn't exist.
    pub fn load(path: &Path) -> DriverResult<Self> {
        if !path.exists() {
            log::debug!("No driver config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: DriverConfig = serde_json::from_str(&content)?;
        log::debug!("Loaded driver config from {}", path.display());
        Ok(config)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn bridge_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bridge_poll_interval_ms)
    }

    pub fn mock_sleep(&self) -> Duration {
        Duration::from_millis(self.mock_sleep_ms)
    }
}
