//! Pacemate boards: NXP LPC2136 behind the ISP bootloader.
//!
//! The ISP protocol is line based ASCII. After the autobaud handshake echo
//! is switched off and every command answers with a numeric return code.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use super::common::in_program_mode;
use super::{
    ChipType, DeviceType, EnterProgramModeOperation, LeaveProgramModeOperation, OperationFactory,
    PulseResetOperation,
};
use crate::config::{
    DriverConfig, DATA_AVAILABLE_POLL, LPC2136_LAST_SECTOR, LPC2136_PART_ID,
    PACEMATE_CRYSTAL_KHZ,
};
use crate::connection::Connection;
use crate::error::{DriverError, DriverResult};
use crate::operation::{BoxedOperation, CancellationToken, Operation, OperationContext};

const SYNCHRONIZED: &str = "Synchronized";

/// Code that unlocks flash write and erase commands.
const UNLOCK_CODE: u32 = 23130;

/// Names of the ISP return codes, indexed by code.
const RETURN_CODES: [&str; 20] = [
    "CMD_SUCCESS",
    "INVALID_COMMAND",
    "SRC_ADDR_ERROR",
    "DST_ADDR_ERROR",
    "SRC_ADDR_NOT_MAPPED",
    "DST_ADDR_NOT_MAPPED",
    "COUNT_ERROR",
    "INVALID_SECTOR",
    "SECTOR_NOT_BLANK",
    "SECTOR_NOT_PREPARED_FOR_WRITE_OPERATION",
    "COMPARE_ERROR",
    "BUSY",
    "PARAM_ERROR",
    "ADDR_ERROR",
    "ADDR_NOT_MAPPED",
    "CMD_LOCKED",
    "INVALID_CODE",
    "INVALID_BAUD_RATE",
    "INVALID_STOP_BIT",
    "CODE_READ_PROTECTION_ENABLED",
];

fn return_code_name(code: u32) -> &'static str {
    RETURN_CODES
        .get(code as usize)
        .copied()
        .unwrap_or("UNKNOWN_RETURN_CODE")
}

/// Line level access to the LPC2136 ISP bootloader.
pub struct PacemateBootloader {
    connection: Arc<dyn Connection>,
    reply_timeout: Duration,
    cancellation: Option<CancellationToken>,
}

impl PacemateBootloader {
    pub fn new(connection: Arc<dyn Connection>, reply_timeout: Duration) -> Self {
        Self {
            connection,
            reply_timeout,
            cancellation: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn write_line(&self, line: &str) -> DriverResult<()> {
        trace!("TX {:?}", line);
        self.connection.write(format!("{}\r\n", line).as_bytes())?;
        self.connection.flush()
    }

    /// Read one line without its terminator. Blank lines are skipped.
    pub fn read_line(&self) -> DriverResult<String> {
        let deadline = Instant::now() + self.reply_timeout;
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            if let Some(token) = &self.cancellation {
                token.check()?;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DriverError::timeout(format!(
                    "ISP reply, received {:?} so far",
                    String::from_utf8_lossy(&line)
                )));
            }
            if self
                .connection
                .read(&mut byte, remaining.min(DATA_AVAILABLE_POLL))?
                == 0
            {
                continue;
            }
            match byte[0] {
                b'\n' if line.is_empty() => {}
                b'\n' => break,
                b'\r' => {}
                other => line.push(other),
            }
        }
        let line = String::from_utf8_lossy(&line).into_owned();
        trace!("RX {:?}", line);
        Ok(line)
    }

    fn expect_line(&self, expected: &str) -> DriverResult<()> {
        let line = self.read_line()?;
        if line != expected {
            return Err(DriverError::incorrect_data(format!(
                "expected {:?}, received {:?}",
                expected, line
            )));
        }
        Ok(())
    }

    /// Autobaud handshake, crystal frequency and echo off.
    pub fn synchronize(&self) -> DriverResult<()> {
        self.connection.write(b"?")?;
        self.connection.flush()?;
        self.expect_line(SYNCHRONIZED)?;

        self.write_line(SYNCHRONIZED)?;
        self.expect_line(SYNCHRONIZED)?;
        self.expect_line("OK")?;

        let crystal = PACEMATE_CRYSTAL_KHZ.to_string();
        self.write_line(&crystal)?;
        self.expect_line(&crystal)?;
        self.expect_line("OK")?;

        self.write_line("A 0")?;
        self.expect_line("A 0")?;
        self.check_return_code("A 0")?;
        debug!("ISP synchronized, echo off");
        Ok(())
    }

    fn return_code(&self) -> DriverResult<u32> {
        let line = self.read_line()?;
        line.trim().parse().map_err(|_| {
            DriverError::incorrect_data(format!("{:?} is not a return code", line))
        })
    }

    fn check_return_code(&self, command: &str) -> DriverResult<()> {
        match self.return_code()? {
            0 => Ok(()),
            code => Err(DriverError::incorrect_data(format!(
                "{} answered {} ({})",
                command,
                code,
                return_code_name(code)
            ))),
        }
    }

    /// Send `command` and return its code.
    pub fn command(&self, command: &str) -> DriverResult<u32> {
        self.write_line(command)?;
        self.return_code()
    }

    pub fn part_id(&self) -> DriverResult<String> {
        self.write_line("J")?;
        self.check_return_code("J")?;
        self.read_line()
    }

    pub fn chip_type(&self) -> DriverResult<ChipType> {
        let part_id = self.part_id()?;
        if part_id != LPC2136_PART_ID {
            warn!("Part id {} unknown, assuming {}", part_id, ChipType::Lpc2136);
        }
        Ok(ChipType::Lpc2136)
    }

    pub fn unlock(&self) -> DriverResult<()> {
        let command = format!("U {}", UNLOCK_CODE);
        self.write_line(&command)?;
        self.check_return_code(&command)
    }

    pub fn prepare_sectors(&self, first: u32, last: u32) -> DriverResult<()> {
        let command = format!("P {} {}", first, last);
        self.write_line(&command)?;
        self.check_return_code(&command)
    }

    pub fn erase_sectors(&self, first: u32, last: u32) -> DriverResult<()> {
        match self.command(&format!("E {} {}", first, last))? {
            0 => Ok(()),
            code => Err(DriverError::EraseFailed {
                reason: format!(
                    "sectors {}..={} answered {} ({})",
                    first,
                    last,
                    code,
                    return_code_name(code)
                ),
            }),
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

fn in_isp<T, F>(
    connection: &Arc<dyn Connection>,
    reply_timeout: Duration,
    context: &mut OperationContext,
    fractions: (f32, f32, f32),
    body: F,
) -> DriverResult<T>
where
    F: FnOnce(&PacemateBootloader, &mut OperationContext) -> DriverResult<T>,
{
    let mut enter = EnterProgramModeOperation::new(Arc::clone(connection));
    let mut leave = LeaveProgramModeOperation::new(Arc::clone(connection));
    in_program_mode(
        context,
        (&mut enter, fractions.0),
        fractions.1,
        (&mut leave, fractions.2),
        |body_context| {
            let bootloader = PacemateBootloader::new(Arc::clone(connection), reply_timeout)
                .with_cancellation(body_context.token().clone());
            bootloader.synchronize()?;
            body(&bootloader, body_context)
        },
    )
}

struct ChipTypeOperation {
    connection: Arc<dyn Connection>,
    reply_timeout: Duration,
}

impl Operation for ChipTypeOperation {
    type Output = ChipType;

    fn name(&self) -> &'static str {
        "get-chip-type"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<ChipType> {
        in_isp(
            &self.connection,
            self.reply_timeout,
            context,
            (0.25, 0.25, 0.5),
            |bootloader, _| bootloader.chip_type(),
        )
    }
}

struct EraseOperation {
    connection: Arc<dyn Connection>,
    reply_timeout: Duration,
}

impl Operation for EraseOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "erase-flash"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        in_isp(
            &self.connection,
            self.reply_timeout,
            context,
            (0.2, 0.6, 0.2),
            |bootloader, body| {
                bootloader.unlock()?;
                body.set_progress(0.3);
                bootloader.prepare_sectors(0, LPC2136_LAST_SECTOR)?;
                body.set_progress(0.6);
                bootloader.erase_sectors(0, LPC2136_LAST_SECTOR)
            },
        )?;
        info!("Flash erased");
        Ok(())
    }
}

/// Pacemate board on one connection.
pub struct PacemateDevice {
    connection: Arc<dyn Connection>,
    reply_timeout: Duration,
}

impl PacemateDevice {
    pub fn new(connection: Arc<dyn Connection>, config: &DriverConfig) -> Self {
        Self {
            connection,
            reply_timeout: config.reply_timeout(),
        }
    }
}

impl OperationFactory for PacemateDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Pacemate
    }

    fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    fn chip_type_operation(&self) -> DriverResult<BoxedOperation<ChipType>> {
        Ok(Box::new(ChipTypeOperation {
            connection: Arc::clone(&self.connection),
            reply_timeout: self.reply_timeout,
        }))
    }

    fn erase_flash_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(EraseOperation {
            connection: Arc::clone(&self.connection),
            reply_timeout: self.reply_timeout,
        }))
    }

    fn reset_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(PulseResetOperation::new(Arc::clone(
            &self.connection,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ControlEvent, MemoryConnection, SerialPortMode};
    use crate::test_helpers::fast_config;
    use std::sync::Mutex;

    /// ISP peer answering the handshake and the commands used here.
    fn isp(part_id: &'static str, erase_code: u32) -> (Arc<MemoryConnection>, Arc<Mutex<Vec<String>>>) {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&commands);
        let connection = MemoryConnection::with_responder(move |data| {
            let line = String::from_utf8_lossy(data).trim_end().to_string();
            log.lock().unwrap().push(line.clone());
            let reply = match line.as_str() {
                "?" => "Synchronized\r\n".to_string(),
                "Synchronized" => "Synchronized\r\nOK\r\n".to_string(),
                "14746" => "14746\r\nOK\r\n".to_string(),
                "A 0" => "A 0\r\n0\r\n".to_string(),
                "J" => format!("0\r\n{}\r\n", part_id),
                "U 23130" | "P 0 10" => "0\r\n".to_string(),
                "E 0 10" => format!("{}\r\n", erase_code),
                _ => "1\r\n".to_string(),
            };
            reply.into_bytes()
        });
        (Arc::new(connection), commands)
    }

    fn device(connection: &Arc<MemoryConnection>) -> PacemateDevice {
        PacemateDevice::new(connection.clone(), &fast_config())
    }

    #[test]
    fn test_chip_type_reads_part_id() {
        let (connection, commands) = isp("196387", 0);
        let mut operation = device(&connection).chip_type_operation().unwrap();

        let chip = operation.execute(&mut OperationContext::detached()).unwrap();
        assert_eq!(chip, ChipType::Lpc2136);
        assert_eq!(commands.lock().unwrap().last().map(String::as_str), Some("J"));
        assert_eq!(
            connection.events(),
            vec![
                ControlEvent::Mode(SerialPortMode::Program),
                ControlEvent::Mode(SerialPortMode::Normal)
            ]
        );
    }

    #[test]
    fn test_unknown_part_defaults_to_lpc2136() {
        let (connection, _) = isp("123456", 0);
        let mut operation = device(&connection).chip_type_operation().unwrap();
        assert_eq!(
            operation.execute(&mut OperationContext::detached()).unwrap(),
            ChipType::Lpc2136
        );
    }

    #[test]
    fn test_erase_unlocks_prepares_and_erases() {
        let (connection, commands) = isp("196387", 0);
        let mut operation = device(&connection).erase_flash_operation().unwrap();
        operation.execute(&mut OperationContext::detached()).unwrap();

        let commands = commands.lock().unwrap();
        let tail: Vec<&str> = commands.iter().rev().take(3).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["U 23130", "P 0 10", "E 0 10"]);
    }

    #[test]
    fn test_erase_failure_carries_code_name() {
        let (connection, _) = isp("196387", 9);
        let mut operation = device(&connection).erase_flash_operation().unwrap();
        match operation.execute(&mut OperationContext::detached()) {
            Err(DriverError::EraseFailed { reason }) => {
                assert!(reason.contains("SECTOR_NOT_PREPARED_FOR_WRITE_OPERATION"))
            }
            other => panic!("expected EraseFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_silent_bootloader_times_out() {
        let connection: Arc<dyn Connection> = Arc::new(MemoryConnection::silent());
        let bootloader = PacemateBootloader::new(connection, Duration::from_millis(20));
        assert!(matches!(
            bootloader.synchronize(),
            Err(DriverError::Timeout { .. })
        ));
    }

    #[test]
    fn test_program_is_unsupported() {
        let (connection, _) = isp("196387", 0);
        assert!(matches!(
            device(&connection).program_operation(vec![0; 16]),
            Err(DriverError::Unsupported {
                operation: "program",
                device: "Pacemate"
            })
        ));
    }
}
