//! Jennic JN51xx modules.
//!
//! The ROM bootloader speaks length-prefixed messages:
//!
//! ```text
//! [length][type][payload...][xor]
//! ```
//!
//! `length` counts type, payload and checksum; `xor` covers every byte
//! before it. Replies carry a status byte first, zero meaning success.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use super::common::in_program_mode;
use super::{
    ChipType, DeviceType, EnterProgramModeOperation, JennicImage, LeaveProgramModeOperation,
    MacAddress, OperationFactory, PulseResetOperation,
};
use crate::config::{
    DriverConfig, DATA_AVAILABLE_POLL, ERASED_CELL, FLASH_READ_BLOCK_SIZE, JENNIC_BLOCK_SIZE,
    JENNIC_CHIP_ID_RAM_ADDRESS, JENNIC_SECTOR_COUNT, JENNIC_SECTOR_SIZE,
};
use crate::connection::Connection;
use crate::error::{DriverError, DriverResult};
use crate::operation::{BoxedOperation, CancellationToken, Operation, OperationContext};

// ============================================================================
// Message Types
// ============================================================================

pub(crate) const SECTOR_ERASE_REQUEST: u8 = 0x0D;
pub(crate) const SECTOR_ERASE_RESPONSE: u8 = 0x0E;
pub(crate) const WRITE_SR_REQUEST: u8 = 0x0F;
pub(crate) const WRITE_SR_RESPONSE: u8 = 0x10;
pub(crate) const PROGRAM_REQUEST: u8 = 0x09;
pub(crate) const PROGRAM_RESPONSE: u8 = 0x0A;
pub(crate) const READ_REQUEST: u8 = 0x0B;
pub(crate) const READ_RESPONSE: u8 = 0x0C;
pub(crate) const RAM_READ_REQUEST: u8 = 0x1F;
pub(crate) const RAM_READ_RESPONSE: u8 = 0x20;
pub(crate) const FLASH_ID_REQUEST: u8 = 0x25;
pub(crate) const FLASH_ID_RESPONSE: u8 = 0x26;
pub(crate) const SELECT_FLASH_REQUEST: u8 = 0x2C;
pub(crate) const SELECT_FLASH_RESPONSE: u8 = 0x2D;
pub(crate) const CHIP_ID_REQUEST: u8 = 0x32;
pub(crate) const CHIP_ID_RESPONSE: u8 = 0x33;

/// Flash parts the bootloader can drive: (manufacturer, device, selector).
const FLASH_TYPES: [(u8, u8, u8); 6] = [
    (0x10, 0x10, 0), // ST M25P10-A
    (0xBF, 0x49, 1), // SST 25VF010A
    (0x1F, 0x60, 2), // Atmel AT25F512
    (0x05, 0x05, 4), // ST M25P05-A
    (0x12, 0x12, 5), // ST M25P40-A
    (0xCC, 0xEE, 8), // JN5148 internal
];

/// Chip id words reported by JN5148 revisions.
const JN5148_CHIP_IDS: [[u8; 4]; 2] = [[0x10, 0x40, 0x46, 0x86], [0x10, 0x80, 0x46, 0x86]];

/// Encode one bootloader message.
pub(crate) fn encode_message(message_type: u8, payload: &[u8]) -> DriverResult<Vec<u8>> {
    if payload.len() > u8::MAX as usize - 2 {
        return Err(DriverError::invalid_argument(format!(
            "message payload of {} bytes does not fit a length byte",
            payload.len()
        )));
    }
    let mut message = Vec::with_capacity(payload.len() + 3);
    message.push(payload.len() as u8 + 2);
    message.push(message_type);
    message.extend_from_slice(payload);
    message.push(xor(&message));
    Ok(message)
}

pub(crate) fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, byte| acc ^ byte)
}

fn address_payload(address: u32, tail: &[u8]) -> Vec<u8> {
    let mut payload = address.to_le_bytes().to_vec();
    payload.extend_from_slice(tail);
    payload
}

// ============================================================================
// Bootloader
// ============================================================================

/// Message level access to the Jennic ROM bootloader.
pub struct JennicBootloader {
    connection: Arc<dyn Connection>,
    reply_timeout: Duration,
    cancellation: Option<CancellationToken>,
}

impl JennicBootloader {
    pub fn new(connection: Arc<dyn Connection>, reply_timeout: Duration) -> Self {
        Self {
            connection,
            reply_timeout,
            cancellation: None,
        }
    }

    /// Observe `token` while waiting for replies.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn check_canceled(&self) -> DriverResult<()> {
        match &self.cancellation {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }

    fn read_exact(&self, buffer: &mut [u8]) -> DriverResult<()> {
        let deadline = Instant::now() + self.reply_timeout;
        let mut filled = 0;
        while filled < buffer.len() {
            self.check_canceled()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DriverError::timeout(format!(
                    "bootloader reply: received {} of {} bytes",
                    filled,
                    buffer.len()
                )));
            }
            filled += self
                .connection
                .read(&mut buffer[filled..], remaining.min(DATA_AVAILABLE_POLL))?;
        }
        Ok(())
    }

    pub fn send(&self, message_type: u8, payload: &[u8]) -> DriverResult<()> {
        let message = encode_message(message_type, payload)?;
        trace!("TX {}", hex::encode(&message));
        self.connection.write(&message)?;
        self.connection.flush()
    }

    /// Read one reply and return its body after the type byte.
    ///
    /// # Errors
    /// `UnexpectedResponse` when the reply type is not `expected`.
    pub fn receive(&self, expected: u8) -> DriverResult<Vec<u8>> {
        let mut length = [0u8; 1];
        self.read_exact(&mut length)?;
        if length[0] < 2 {
            return Err(DriverError::incorrect_data(format!(
                "reply length {} is too short",
                length[0]
            )));
        }

        let mut rest = vec![0u8; length[0] as usize];
        self.read_exact(&mut rest)?;
        trace!("RX {:02x}{}", length[0], hex::encode(&rest));

        let received = rest.pop().unwrap_or_default();
        let computed = xor(&length) ^ xor(&rest);
        if computed != received {
            return Err(DriverError::InvalidChecksum {
                expected: computed as u16,
                actual: received as u16,
            });
        }
        if rest[0] != expected {
            return Err(DriverError::UnexpectedResponse {
                expected,
                received: rest[0],
                context: "bootloader reply".into(),
            });
        }
        Ok(rest.split_off(1))
    }

    /// Send a request and return the reply body, starting with the status.
    pub fn request(&self, request: u8, payload: &[u8], response: u8) -> DriverResult<Vec<u8>> {
        self.send(request, payload)?;
        let body = self.receive(response)?;
        if body.is_empty() {
            return Err(DriverError::incorrect_data("reply carries no status byte"));
        }
        Ok(body)
    }

    /// Status byte of the reply to `request`.
    fn status_of(&self, request: u8, payload: &[u8], response: u8) -> DriverResult<u8> {
        let body = self.request(request, payload, response)?;
        Ok(body[0])
    }

    /// Identify the chip.
    ///
    /// Bootloaders without the chip id command answer it with another
    /// message type; the id word is then read from RAM.
    pub fn chip_type(&self) -> DriverResult<ChipType> {
        match self.request(CHIP_ID_REQUEST, &[], CHIP_ID_RESPONSE) {
            Ok(body) => {
                debug!("Chip id reply {}", hex::encode(&body));
                let known = JN5148_CHIP_IDS.iter().any(|id| body[1..] == id[..]);
                if body.len() == 5 && body[0] == 0 && known {
                    return Ok(ChipType::Jn5148);
                }
                warn!("Unrecognized chip id reply {}", hex::encode(&body));
                Ok(ChipType::Unknown)
            }
            Err(DriverError::UnexpectedResponse { received, .. }) => {
                debug!("Chip id answered with 0x{:02X}, reading RAM", received);
                self.chip_type_from_ram()
            }
            Err(e) => Err(e),
        }
    }

    fn chip_type_from_ram(&self) -> DriverResult<ChipType> {
        let id = self.read_ram(JENNIC_CHIP_ID_RAM_ADDRESS, 4)?;
        let chip_type = match (id[0], id[1]) {
            (0x00, 0x20) => ChipType::Jn513x,
            (0x10, 0x00) => ChipType::Jn513xR1,
            (0x20, 0x00) => ChipType::Jn5121,
            (first, second) => {
                warn!(
                    "Chip id {:02x}{:02x} unknown, assuming {}",
                    first,
                    second,
                    ChipType::Jn5121
                );
                ChipType::Jn5121
            }
        };
        debug!("Chip identified as {}", chip_type);
        Ok(chip_type)
    }

    pub fn read_ram(&self, address: u32, length: u16) -> DriverResult<Vec<u8>> {
        let payload = address_payload(address, &length.to_le_bytes());
        let body = self.request(RAM_READ_REQUEST, &payload, RAM_READ_RESPONSE)?;
        if body[0] != 0 {
            return Err(DriverError::incorrect_data(format!(
                "RAM read at 0x{:08X} failed with status 0x{:02X}",
                address, body[0]
            )));
        }
        if body.len() != length as usize + 1 {
            return Err(DriverError::incorrect_data(format!(
                "RAM read returned {} bytes, {} requested",
                body.len() - 1,
                length
            )));
        }
        Ok(body[1..].to_vec())
    }

    /// Manufacturer and device id of the attached flash.
    pub fn flash_id(&self) -> DriverResult<(u8, u8)> {
        let body = self.request(FLASH_ID_REQUEST, &[], FLASH_ID_RESPONSE)?;
        if body[0] != 0 || body.len() < 3 {
            return Err(DriverError::incorrect_data(format!(
                "flash id reply {}",
                hex::encode(&body)
            )));
        }
        Ok((body[1], body[2]))
    }

    /// Select the flash part and lift its write protection.
    pub fn configure_flash(&self, chip_type: ChipType) -> DriverResult<()> {
        let (manufacturer, device) = self.flash_id()?;
        let selector = FLASH_TYPES
            .iter()
            .find(|(m, d, _)| *m == manufacturer && *d == device)
            .map(|(_, _, selector)| *selector)
            .ok_or_else(|| {
                DriverError::incorrect_data(format!(
                    "unsupported flash {:02x}{:02x} on {}",
                    manufacturer, device, chip_type
                ))
            })?;

        let status = self.status_of(
            SELECT_FLASH_REQUEST,
            &[selector, 0, 0, 0, 0],
            SELECT_FLASH_RESPONSE,
        )?;
        if status != 0 {
            return Err(DriverError::incorrect_data(format!(
                "flash type {} was not accepted",
                selector
            )));
        }

        let status = self.status_of(WRITE_SR_REQUEST, &[0x00], WRITE_SR_RESPONSE)?;
        if status != 0 {
            return Err(DriverError::incorrect_data(
                "flash status register was not written",
            ));
        }
        debug!("Flash {:02x}{:02x} configured", manufacturer, device);
        Ok(())
    }

    pub fn erase_sector(&self, sector: u8) -> DriverResult<()> {
        let status = self.status_of(SECTOR_ERASE_REQUEST, &[sector], SECTOR_ERASE_RESPONSE)?;
        if status != 0 {
            return Err(DriverError::EraseFailed {
                reason: format!("sector {} answered status 0x{:02X}", sector, status),
            });
        }
        debug!("Erased sector {}", sector);
        Ok(())
    }

    pub fn write_flash(&self, address: u32, data: &[u8]) -> DriverResult<()> {
        let status = self.status_of(
            PROGRAM_REQUEST,
            &address_payload(address, data),
            PROGRAM_RESPONSE,
        )?;
        if status != 0 {
            return Err(DriverError::ProgramFailed {
                address,
                reason: format!("bootloader answered status 0x{:02X}", status),
            });
        }
        Ok(())
    }

    pub fn read_flash(&self, address: u32, length: u16) -> DriverResult<Vec<u8>> {
        let payload = address_payload(address, &length.to_le_bytes());
        let body = self.request(READ_REQUEST, &payload, READ_RESPONSE)?;
        if body[0] != 0 {
            return Err(DriverError::incorrect_data(format!(
                "flash read at 0x{:X} failed with status 0x{:02X}",
                address, body[0]
            )));
        }
        if body.len() != length as usize + 1 {
            return Err(DriverError::incorrect_data(format!(
                "flash read returned {} bytes, {} requested",
                body.len() - 1,
                length
            )));
        }
        Ok(body[1..].to_vec())
    }

    /// Read `length` bytes in blocks of `block` bytes, reporting progress.
    fn read_range(
        &self,
        address: u32,
        length: u32,
        block: usize,
        context: &mut OperationContext,
    ) -> DriverResult<Vec<u8>> {
        check_no_wrap(address, length as usize)?;
        let mut data = Vec::with_capacity(length as usize);
        let total = length.max(1) as f32;
        while (data.len() as u32) < length {
            context.check_canceled()?;
            let offset = data.len() as u32;
            let chunk = (length - offset).min(block as u32);
            data.extend(self.read_flash(flash_address(address, offset)?, chunk as u16)?);
            context.set_progress(data.len() as f32 / total);
        }
        Ok(data)
    }

    fn write_range(
        &self,
        address: u32,
        data: &[u8],
        context: &mut OperationContext,
    ) -> DriverResult<()> {
        check_no_wrap(address, data.len())?;
        let blocks = data.len().div_ceil(JENNIC_BLOCK_SIZE).max(1) as f32;
        for (index, chunk) in data.chunks(JENNIC_BLOCK_SIZE).enumerate() {
            context.check_canceled()?;
            let offset = (index * JENNIC_BLOCK_SIZE) as u32;
            self.write_flash(flash_address(address, offset)?, chunk)?;
            context.worked(1.0 / blocks);
        }
        Ok(())
    }
}

fn flash_address(base: u32, offset: u32) -> DriverResult<u32> {
    base.checked_add(offset).ok_or_else(|| {
        DriverError::invalid_argument(format!("0x{:X} + {} overflows the address", base, offset))
    })
}

fn check_no_wrap(address: u32, length: usize) -> DriverResult<()> {
    if address as u64 + length as u64 > u32::MAX as u64 + 1 {
        return Err(DriverError::invalid_argument(format!(
            "0x{:X} + {} bytes wraps around the address space",
            address, length
        )));
    }
    Ok(())
}

fn check_range(address: u32, length: usize) -> DriverResult<()> {
    let flash_size = (JENNIC_SECTOR_SIZE * JENNIC_SECTOR_COUNT) as u64;
    if address as u64 + length as u64 > flash_size {
        return Err(DriverError::invalid_argument(format!(
            "0x{:X} + {} bytes is outside the {} KiB flash",
            address,
            length,
            flash_size / 1024
        )));
    }
    Ok(())
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Clone)]
struct Shared {
    connection: Arc<dyn Connection>,
    reply_timeout: Duration,
}

impl Shared {
    fn bootloader(&self, context: &OperationContext) -> JennicBootloader {
        JennicBootloader::new(Arc::clone(&self.connection), self.reply_timeout)
            .with_cancellation(context.token().clone())
    }

    fn program_mode(&self) -> (EnterProgramModeOperation, LeaveProgramModeOperation) {
        (
            EnterProgramModeOperation::new(Arc::clone(&self.connection)),
            LeaveProgramModeOperation::new(Arc::clone(&self.connection)),
        )
    }

    /// Run `body` against the bootloader between entering and leaving
    /// program mode.
    fn in_bootloader<T, F>(
        &self,
        context: &mut OperationContext,
        fractions: (f32, f32, f32),
        body: F,
    ) -> DriverResult<T>
    where
        F: FnOnce(&JennicBootloader, &mut OperationContext) -> DriverResult<T>,
    {
        let (mut enter, mut leave) = self.program_mode();
        let (enter_fraction, body_fraction, leave_fraction) = fractions;
        in_program_mode(
            context,
            (&mut enter, enter_fraction),
            body_fraction,
            (&mut leave, leave_fraction),
            |body_context| {
                let bootloader = self.bootloader(body_context);
                body(&bootloader, body_context)
            },
        )
    }
}

struct ChipTypeOperation {
    shared: Shared,
}

impl Operation for ChipTypeOperation {
    type Output = ChipType;

    fn name(&self) -> &'static str {
        "get-chip-type"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<ChipType> {
        let chip_type = self
            .shared
            .in_bootloader(context, (0.5, 0.0, 0.5), |bootloader, _| bootloader.chip_type())?;
        info!("Chip type is {}", chip_type);
        Ok(chip_type)
    }
}

/// Read the vendor flash header the device carries.
struct FlashHeaderOperation {
    shared: Shared,
}

impl Operation for FlashHeaderOperation {
    type Output = Vec<u8>;

    fn name(&self) -> &'static str {
        "get-flash-header"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<Vec<u8>> {
        // Every Jennic chip shares the header location.
        let start = ChipType::Jn5121.header_start().unwrap_or_default();
        let length = ChipType::Jn5121.header_length().unwrap_or_default();
        self.shared
            .in_bootloader(context, (0.25, 0.5, 0.25), |bootloader, body| {
                bootloader.read_range(start, length, FLASH_READ_BLOCK_SIZE, body)
            })
    }
}

struct ProgramOperation {
    shared: Shared,
    image: Vec<u8>,
}

impl ProgramOperation {
    fn program(
        bootloader: &JennicBootloader,
        chip_type: ChipType,
        image: &JennicImage,
        context: &mut OperationContext,
    ) -> DriverResult<()> {
        let data = image.data();
        let sectors = data.len().div_ceil(JENNIC_SECTOR_SIZE);
        if sectors > JENNIC_SECTOR_COUNT {
            return Err(DriverError::InvalidImage {
                reason: format!("{} bytes do not fit into flash", data.len()),
            });
        }

        bootloader.configure_flash(chip_type)?;
        for sector in 0..sectors {
            context.check_canceled()?;
            bootloader.erase_sector(sector as u8)?;
        }

        let blocks = image.to_binary_image(JENNIC_BLOCK_SIZE);
        let total = blocks.block_count().max(1) as f32;
        for block in blocks.blocks() {
            context.check_canceled()?;
            bootloader.write_flash(block.address, &block.data)?;
            context.worked(1.0 / total);
        }
        Ok(())
    }
}

impl Operation for ProgramOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "program"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        let mut image = JennicImage::parse(std::mem::take(&mut self.image))?;

        let mut chip_operation = ChipTypeOperation {
            shared: self.shared.clone(),
        };
        let chip_type = context.execute_sub_operation(&mut chip_operation, 0.0625)?;
        if !chip_type.accepts_image_for(image.chip_type()) {
            return Err(DriverError::ChipMismatch {
                detected: chip_type,
                image: image.chip_type(),
            });
        }

        let mut header_operation = FlashHeaderOperation {
            shared: self.shared.clone(),
        };
        let header = context.execute_sub_operation(&mut header_operation, 0.0625)?;
        image.insert_header(&header)?;
        info!(
            "Programming {} bytes for {}",
            image.data().len(),
            image.chip_type()
        );

        let shared = &self.shared;
        let programmed = shared.in_bootloader(context, (0.0625, 0.75, 0.0125), |bootloader, body| {
            Self::program(bootloader, chip_type, &image, body)
        });

        let mut reset = PulseResetOperation::new(Arc::clone(&shared.connection));
        let mut reset_context = context.create_sub(0.05);
        let reset_result = reset.execute(&mut reset_context);

        match (programmed, reset_result) {
            (Ok(()), result) => {
                result?;
                info!("Programming finished");
                Ok(())
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(reset_error)) => {
                debug!("Reset after failed programming failed too: {}", reset_error);
                Err(e)
            }
        }
    }
}

struct EraseOperation {
    shared: Shared,
}

impl Operation for EraseOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "erase-flash"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        let mut chip_operation = ChipTypeOperation {
            shared: self.shared.clone(),
        };
        let chip_type = context.execute_sub_operation(&mut chip_operation, 0.1)?;
        self.shared
            .in_bootloader(context, (0.1, 0.7, 0.1), |bootloader, body| {
                bootloader.configure_flash(chip_type)?;
                for sector in 0..JENNIC_SECTOR_COUNT {
                    body.check_canceled()?;
                    bootloader.erase_sector(sector as u8)?;
                    body.worked(1.0 / JENNIC_SECTOR_COUNT as f32);
                }
                Ok(())
            })?;
        info!("Flash erased");
        Ok(())
    }
}

struct ReadFlashOperation {
    shared: Shared,
    address: u32,
    length: u32,
}

impl Operation for ReadFlashOperation {
    type Output = Vec<u8>;

    fn name(&self) -> &'static str {
        "read-flash"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<Vec<u8>> {
        let (address, length) = (self.address, self.length);
        self.shared
            .in_bootloader(context, (0.1, 0.8, 0.1), |bootloader, body| {
                bootloader.read_range(address, length, FLASH_READ_BLOCK_SIZE, body)
            })
    }
}

struct WriteFlashOperation {
    shared: Shared,
    address: u32,
    data: Vec<u8>,
}

impl Operation for WriteFlashOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "write-flash"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        let (address, data) = (self.address, &self.data);
        self.shared
            .in_bootloader(context, (0.1, 0.8, 0.1), |bootloader, body| {
                bootloader.write_range(address, data, body)
            })
    }
}

struct ReadMacOperation {
    shared: Shared,
}

impl Operation for ReadMacOperation {
    type Output = MacAddress;

    fn name(&self) -> &'static str {
        "read-mac"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<MacAddress> {
        let mut chip_operation = ChipTypeOperation {
            shared: self.shared.clone(),
        };
        let chip_type = context.execute_sub_operation(&mut chip_operation, 0.3)?;
        let start = chip_type.mac_in_flash_start().ok_or_else(|| {
            DriverError::incorrect_data(format!("{} keeps no MAC address in flash", chip_type))
        })?;

        let bytes = self
            .shared
            .in_bootloader(context, (0.2, 0.3, 0.2), |bootloader, body| {
                bootloader.read_range(start, MacAddress::LENGTH as u32, MacAddress::LENGTH, body)
            })?;
        let mac = MacAddress::from_slice(&bytes)?;
        info!("Read MAC address {}", mac);
        Ok(mac)
    }
}

struct WriteMacOperation {
    shared: Shared,
    mac: MacAddress,
}

impl Operation for WriteMacOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "write-mac"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        let mut chip_operation = ChipTypeOperation {
            shared: self.shared.clone(),
        };
        let chip_type = context.execute_sub_operation(&mut chip_operation, 0.1)?;
        let start = chip_type.mac_in_flash_start().ok_or_else(|| {
            DriverError::incorrect_data(format!("{} keeps no MAC address in flash", chip_type))
        })? as usize;
        let mac = self.mac;

        self.shared
            .in_bootloader(context, (0.1, 0.7, 0.1), |bootloader, body| {
                let mut sector = {
                    let mut read_context = body.create_sub(0.4);
                    bootloader.read_range(
                        0,
                        JENNIC_SECTOR_SIZE as u32,
                        JENNIC_BLOCK_SIZE,
                        &mut read_context,
                    )?
                };
                sector[start..start + MacAddress::LENGTH].copy_from_slice(mac.as_bytes());

                bootloader.configure_flash(chip_type)?;
                bootloader.erase_sector(0)?;

                // Skip trailing erased cells; they already read back as erased.
                let used = sector
                    .iter()
                    .rposition(|&byte| byte != ERASED_CELL)
                    .map_or(0, |last| last + 1);
                let mut write_context = body.create_sub(0.6);
                bootloader.write_range(0, &sector[..used], &mut write_context)
            })?;
        info!("Wrote MAC address {}", mac);
        Ok(())
    }
}

// ============================================================================
// Device
// ============================================================================

/// Jennic module on one connection.
pub struct JennicDevice {
    shared: Shared,
}

impl JennicDevice {
    pub fn new(connection: Arc<dyn Connection>, config: &DriverConfig) -> Self {
        Self {
            shared: Shared {
                connection,
                reply_timeout: config.reply_timeout(),
            },
        }
    }

    /// Read the vendor flash header stored on the device.
    pub fn flash_header_operation(&self) -> BoxedOperation<Vec<u8>> {
        Box::new(FlashHeaderOperation {
            shared: self.shared.clone(),
        })
    }
}

impl OperationFactory for JennicDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Jennic
    }

    fn connection(&self) -> &Arc<dyn Connection> {
        &self.shared.connection
    }

    fn chip_type_operation(&self) -> DriverResult<BoxedOperation<ChipType>> {
        Ok(Box::new(ChipTypeOperation {
            shared: self.shared.clone(),
        }))
    }

    fn erase_flash_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(EraseOperation {
            shared: self.shared.clone(),
        }))
    }

    fn program_operation(&self, image: Vec<u8>) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(ProgramOperation {
            shared: self.shared.clone(),
            image,
        }))
    }

    fn read_flash_operation(
        &self,
        address: u32,
        length: u32,
    ) -> DriverResult<BoxedOperation<Vec<u8>>> {
        check_range(address, length as usize)?;
        Ok(Box::new(ReadFlashOperation {
            shared: self.shared.clone(),
            address,
            length,
        }))
    }

    fn write_flash_operation(
        &self,
        address: u32,
        data: Vec<u8>,
    ) -> DriverResult<BoxedOperation<()>> {
        check_range(address, data.len())?;
        Ok(Box::new(WriteFlashOperation {
            shared: self.shared.clone(),
            address,
            data,
        }))
    }

    fn read_mac_operation(&self) -> DriverResult<BoxedOperation<MacAddress>> {
        Ok(Box::new(ReadMacOperation {
            shared: self.shared.clone(),
        }))
    }

    fn write_mac_operation(&self, mac: MacAddress) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(WriteMacOperation {
            shared: self.shared.clone(),
            mac,
        }))
    }

    fn reset_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(PulseResetOperation::new(Arc::clone(
            &self.shared.connection,
        ))))
    }
}
