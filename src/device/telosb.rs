//! TelosB boards: MSP430F1611 behind the bootstrap loader.
//!
//! All operations of one device share a single [`BslTelosb`] engine so the
//! baud and patch state of the link survives from one operation to the
//! next. The engine is locked per step, never across a nested operation.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use super::common::in_program_mode;
use super::{BinaryImage, ChipType, DeviceType, OperationFactory};
use crate::bsl::BslTelosb;
use crate::config::{DriverConfig, BSL_MAX_DATA, FLASH_READ_BLOCK_SIZE, SYNC_RECOVERY_ATTEMPTS};
use crate::connection::Connection;
use crate::error::{DriverError, DriverResult};
use crate::operation::{BoxedOperation, Operation, OperationContext};

/// Size of the MSP430 address space.
const ADDRESS_SPACE: u32 = 0x1_0000;

type SharedBsl = Arc<Mutex<BslTelosb>>;

/// Lock the engine and bind it to the running operation's token.
fn engine<'a>(bsl: &'a Mutex<BslTelosb>, context: &OperationContext) -> MutexGuard<'a, BslTelosb> {
    let mut engine = bsl
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    engine.set_cancellation(Some(context.token().clone()));
    engine
}

fn check_range(address: u32, length: usize) -> DriverResult<()> {
    if address as u64 + length as u64 > ADDRESS_SPACE as u64 {
        return Err(DriverError::invalid_argument(format!(
            "0x{:X} + {} bytes is outside the 64 KiB address space",
            address, length
        )));
    }
    Ok(())
}

// ============================================================================
// Program Mode
// ============================================================================

/// Start the bootloader and unlock it with the default password.
struct EnterBootloaderOperation {
    bsl: SharedBsl,
}

impl Operation for EnterBootloaderOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "enter-program-mode"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        context.check_canceled()?;
        let mut bsl = engine(&self.bsl, context);
        bsl.set_bsl_baud_rate()?;
        bsl.invoke_bsl()?;
        context.set_progress(0.4);

        bsl.synchronize_with_recovery(SYNC_RECOVERY_ATTEMPTS)?;
        context.set_progress(0.7);

        if !bsl.transmit_password(None, false)? {
            warn!("Bootloader rejected the default password");
        }
        debug!("Bootloader ready");
        context.done();
        Ok(())
    }
}

/// Flush and give the port back its application baud rate.
struct LeaveBootloaderOperation {
    bsl: SharedBsl,
}

impl Operation for LeaveBootloaderOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "leave-program-mode"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        let mut bsl = self
            .bsl
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bsl.connection().flush()?;
        context.set_progress(0.5);
        bsl.restore_non_bsl_baud_rate()?;
        bsl.set_cancellation(None);
        context.set_progress(1.0);
        Ok(())
    }
}

fn program_mode(bsl: &SharedBsl) -> (EnterBootloaderOperation, LeaveBootloaderOperation) {
    (
        EnterBootloaderOperation {
            bsl: Arc::clone(bsl),
        },
        LeaveBootloaderOperation {
            bsl: Arc::clone(bsl),
        },
    )
}

// ============================================================================
// Operations
// ============================================================================

struct ChipTypeOperation;

impl Operation for ChipTypeOperation {
    type Output = ChipType;

    fn name(&self) -> &'static str {
        "get-chip-type"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<ChipType> {
        context.check_canceled()?;
        context.done();
        Ok(ChipType::Telosb)
    }
}

/// Restart the application through the I2C reset switch.
struct ResetOperation {
    bsl: SharedBsl,
}

impl Operation for ResetOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "reset"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        engine(&self.bsl, context).reset()?;
        context.done();
        Ok(())
    }
}

struct EraseOperation {
    bsl: SharedBsl,
}

impl Operation for EraseOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "erase-flash"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        let (mut enter, mut leave) = program_mode(&self.bsl);
        let bsl = &self.bsl;
        in_program_mode(context, (&mut enter, 0.3), 0.5, (&mut leave, 0.2), |body| {
            let mut bsl = engine(bsl, body);
            bsl.mass_erase()?;
            body.set_progress(0.7);
            // The password is all 0xFF after an erase.
            if !bsl.transmit_password(None, false)? {
                warn!("Bootloader rejected the erased-device password");
            }
            Ok(())
        })?;
        info!("Flash erased");
        Ok(())
    }
}

/// Write blocks of at most one frame each, optionally reading them back.
fn write_blocks(
    bsl: &Mutex<BslTelosb>,
    blocks: &[(u32, &[u8])],
    verify: bool,
    context: &mut OperationContext,
) -> DriverResult<()> {
    let total = blocks.len().max(1) as f32;
    for (index, &(address, data)) in blocks.iter().enumerate() {
        context.check_canceled()?;
        {
            let mut bsl = engine(bsl, context);
            bsl.write_flash(address as u16, data)?;
            if verify && !bsl.verify_block(address as u16, data.len() as u16, Some(data))? {
                return Err(DriverError::ProgramFailed {
                    address,
                    reason: "read back differs from written data".into(),
                });
            }
        }
        context.set_progress((index + 1) as f32 / total);
    }
    Ok(())
}

struct ProgramOperation {
    bsl: SharedBsl,
    image: Vec<u8>,
    verify: bool,
}

impl Operation for ProgramOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "program"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        let image = BinaryImage::from_intel_hex(&self.image, BSL_MAX_DATA)?;
        for block in image.blocks() {
            check_range(block.address, block.data.len()).map_err(|_| {
                DriverError::InvalidImage {
                    reason: format!("block at 0x{:X} does not fit into flash", block.address),
                }
            })?;
        }
        info!(
            "Programming {} bytes in {} blocks (sha256 {})",
            image.len(),
            image.block_count(),
            image.fingerprint()
        );

        let blocks: Vec<(u32, &[u8])> = image
            .blocks()
            .iter()
            .map(|block| (block.address, block.data.as_slice()))
            .collect();
        let (mut enter, mut leave) = program_mode(&self.bsl);
        let bsl = &self.bsl;
        let verify = self.verify;
        in_program_mode(context, (&mut enter, 0.05), 0.85, (&mut leave, 0.05), |body| {
            write_blocks(bsl, &blocks, verify, body)
        })?;

        let mut reset = ResetOperation {
            bsl: Arc::clone(&self.bsl),
        };
        context.execute_sub_operation(&mut reset, 0.05)?;
        info!("Programming finished");
        Ok(())
    }
}

struct ReadFlashOperation {
    bsl: SharedBsl,
    address: u32,
    length: u32,
}

impl Operation for ReadFlashOperation {
    type Output = Vec<u8>;

    fn name(&self) -> &'static str {
        "read-flash"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<Vec<u8>> {
        let (mut enter, mut leave) = program_mode(&self.bsl);
        let bsl = &self.bsl;
        let (start, length) = (self.address, self.length);
        in_program_mode(context, (&mut enter, 0.1), 0.8, (&mut leave, 0.1), |body| {
            let mut data = Vec::with_capacity(length as usize);
            let total = length.max(1) as f32;
            while (data.len() as u32) < length {
                body.check_canceled()?;
                let address = start + data.len() as u32;
                let chunk = (length - data.len() as u32).min(FLASH_READ_BLOCK_SIZE as u32);
                let block = engine(bsl, body).read_block(address as u16, chunk as u16)?;
                data.extend_from_slice(&block);
                body.set_progress(data.len() as f32 / total);
            }
            Ok(data)
        })
    }
}

struct WriteFlashOperation {
    bsl: SharedBsl,
    address: u32,
    data: Vec<u8>,
    verify: bool,
}

impl Operation for WriteFlashOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "write-flash"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        let blocks: Vec<(u32, &[u8])> = self
            .data
            .chunks(BSL_MAX_DATA)
            .enumerate()
            .map(|(index, chunk)| (self.address + (index * BSL_MAX_DATA) as u32, chunk))
            .collect();
        let (mut enter, mut leave) = program_mode(&self.bsl);
        let bsl = &self.bsl;
        let verify = self.verify;
        in_program_mode(context, (&mut enter, 0.1), 0.8, (&mut leave, 0.1), |body| {
            write_blocks(bsl, &blocks, verify, body)
        })
    }
}

// ============================================================================
// Device
// ============================================================================

/// TelosB board on one connection.
pub struct TelosbDevice {
    connection: Arc<dyn Connection>,
    bsl: SharedBsl,
    verify_writes: bool,
}

impl TelosbDevice {
    pub fn new(connection: Arc<dyn Connection>, config: &DriverConfig) -> Self {
        let bsl = BslTelosb::new(Arc::clone(&connection), config);
        Self {
            connection,
            bsl: Arc::new(Mutex::new(bsl)),
            verify_writes: config.verify_writes,
        }
    }

    /// The engine shared by this device's operations.
    pub fn bsl(&self) -> &Arc<Mutex<BslTelosb>> {
        &self.bsl
    }
}

impl OperationFactory for TelosbDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Telosb
    }

    fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    fn chip_type_operation(&self) -> DriverResult<BoxedOperation<ChipType>> {
        Ok(Box::new(ChipTypeOperation))
    }

    fn erase_flash_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(EraseOperation {
            bsl: Arc::clone(&self.bsl),
        }))
    }

    fn program_operation(&self, image: Vec<u8>) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(ProgramOperation {
            bsl: Arc::clone(&self.bsl),
            image,
            verify: self.verify_writes,
        }))
    }

    fn read_flash_operation(
        &self,
        address: u32,
        length: u32,
    ) -> DriverResult<BoxedOperation<Vec<u8>>> {
        check_range(address, length as usize)?;
        Ok(Box::new(ReadFlashOperation {
            bsl: Arc::clone(&self.bsl),
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
            bsl: Arc::clone(&self.bsl),
            address,
            data,
            verify: self.verify_writes,
        }))
    }

    fn reset_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(ResetOperation {
            bsl: Arc::clone(&self.bsl),
        }))
    }
}
