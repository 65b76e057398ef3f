//! TelosB bootstrap loader engine.
//!
//! Every command is one request/reply cycle:
//! 1. Sync - send 0x80, expect 0x90
//! 2. Send - write the checksummed frame
//! 3. Reply - ACK, NACK or a data frame

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use super::frame::{build_frame, checksum};
use super::i2c::{I2cBus, INVOKE_BSL_SEQUENCE, RESET_SEQUENCE};
use super::session::{baud_rate_parameters, ConnectionSession};
use crate::config::{
    DriverConfig, BSL_HDR, BSL_INITIAL_BAUD, BSL_MAX_DATA, BSL_PASSWORD_LENGTH,
    BSL_PATCH_ADDRESS, BSL_SYNC, CMD_CHANGEBAUD, CMD_LOADPC, CMD_MASSERASE, CMD_RXDATABLOCK,
    CMD_TXDATABLOCK, CMD_TXPASSWORD, DATA_ACK, DATA_AVAILABLE_POLL, DATA_NACK, ERASED_CELL,
    HEADER_READ_RETRIES, MASS_ERASE_ADDRESS, MASS_ERASE_LENGTH, OSCILLATOR_SETTLE,
    PAYLOAD_READ_RETRIES, SYNC_ACK,
};
use crate::connection::Connection;
use crate::error::{DriverError, DriverResult};
use crate::operation::CancellationToken;

/// I2C address of the reset switch on TelosB boards.
const SWITCH_DEVICE: u8 = 0;

/// Decoded bootloader reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BslReply {
    Ack,
    Nack,
    /// Payload of a data frame with verified checksum.
    Data(Vec<u8>),
}

impl BslReply {
    fn first_byte(&self) -> u8 {
        match self {
            BslReply::Ack => DATA_ACK,
            BslReply::Nack => DATA_NACK,
            BslReply::Data(_) => BSL_HDR,
        }
    }
}

/// Protocol engine for the MSP430 bootstrap loader on TelosB boards.
///
/// Reads wait in short slices and observe the attached cancellation token,
/// so an abandoned operation stops touching the wire within one slice. A
/// read already blocked inside the operating system is not interrupted.
pub struct BslTelosb {
    connection: Arc<dyn Connection>,
    session: ConnectionSession,
    reply_timeout: Duration,
    sync_timeout: Duration,
    sync_retries: u32,
    cancellation: Option<CancellationToken>,
}

impl BslTelosb {
    pub fn new(connection: Arc<dyn Connection>, config: &DriverConfig) -> Self {
        Self {
            connection,
            session: ConnectionSession::default(),
            reply_timeout: config.reply_timeout(),
            sync_timeout: config.sync_timeout(),
            sync_retries: config.sync_retries,
            cancellation: None,
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Token observed by every wait until replaced.
    pub fn set_cancellation(&mut self, token: Option<CancellationToken>) {
        self.cancellation = token;
    }

    fn check_canceled(&self) -> DriverResult<()> {
        match &self.cancellation {
            Some(token) => token.check(),
            None => Ok(()),
        }
    }

    fn sleep(&self, duration: Duration) -> DriverResult<()> {
        match &self.cancellation {
            Some(token) => token.sleep(duration),
            None => {
                thread::sleep(duration);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Wire Access
    // ========================================================================

    /// Read whatever arrives first, waiting at most `timeout` in poll slices.
    fn read_some(&self, buffer: &mut [u8], timeout: Duration) -> DriverResult<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_canceled()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let read = self
                .connection
                .read(buffer, remaining.min(DATA_AVAILABLE_POLL))?;
            if read > 0 || remaining <= DATA_AVAILABLE_POLL {
                return Ok(read);
            }
        }
    }

    /// Fill `buffer`, allowing `retries` reply timeouts without progress.
    fn read_exact(&self, buffer: &mut [u8], retries: u32, context: &str) -> DriverResult<()> {
        let mut filled = 0;
        let mut misses = 0;
        while filled < buffer.len() {
            let read = self.read_some(&mut buffer[filled..], self.reply_timeout)?;
            if read > 0 {
                filled += read;
                continue;
            }

            misses += 1;
            if misses > retries {
                return Err(DriverError::timeout(format!(
                    "{}: received {} of {} bytes",
                    context,
                    filled,
                    buffer.len()
                )));
            }
            debug!("No data for {}, retry {}/{}", context, misses, retries);
        }
        Ok(())
    }

    // ========================================================================
    // Request / Reply Cycle
    // ========================================================================

    /// Perform the sync handshake.
    ///
    /// Silence is retried up to the configured bound, or forever when `wait`
    /// is set. Any answer other than the acknowledge fails immediately with
    /// [`DriverError::NotSynchronized`].
    pub fn synchronize(&mut self, wait: bool) -> DriverResult<()> {
        let mut tries = self.sync_retries;
        while wait || tries > 0 {
            tries = tries.saturating_sub(1);
            self.check_canceled()?;
            self.connection.clear_input()?;
            self.connection.write(&[BSL_SYNC])?;

            let mut answer = [0u8; 1];
            if self.read_some(&mut answer, self.sync_timeout)? == 0 {
                trace!("No sync answer, {} tries left", tries);
                continue;
            }

            return match answer[0] {
                SYNC_ACK => {
                    trace!("Bootloader synchronized");
                    Ok(())
                }
                received => {
                    debug!("Sync answered with 0x{:02X}", received);
                    Err(DriverError::NotSynchronized { received })
                }
            };
        }

        Err(DriverError::timeout(format!(
            "no sync acknowledge after {} attempts",
            self.sync_retries
        )))
    }

    /// Synchronize, retrying whole handshakes that were answered with garbage.
    ///
    /// Only [`DriverError::NotSynchronized`] is retried; every other failure
    /// is returned at once.
    pub fn synchronize_with_recovery(&mut self, attempts: u32) -> DriverResult<()> {
        let mut attempt = 1;
        loop {
            match self.synchronize(false) {
                Err(DriverError::NotSynchronized { received }) if attempt < attempts => {
                    warn!(
                        "Bootloader not synchronized (0x{:02X}), attempt {}/{}",
                        received, attempt, attempts
                    );
                    attempt += 1;
                    self.sleep(DATA_AVAILABLE_POLL)?;
                }
                result => return result,
            }
        }
    }

    /// Read and validate one reply.
    pub fn receive_reply(&mut self) -> DriverResult<BslReply> {
        let mut first = [0u8; 1];
        if self.read_some(&mut first, self.reply_timeout)? == 0 {
            return Err(DriverError::timeout("waiting for bootloader reply"));
        }

        match first[0] {
            DATA_ACK => Ok(BslReply::Ack),
            DATA_NACK => Ok(BslReply::Nack),
            BSL_HDR => self.receive_data_frame(),
            received => Err(DriverError::UnexpectedResponse {
                expected: DATA_ACK,
                received,
                context: "bootloader reply".into(),
            }),
        }
    }

    fn receive_data_frame(&mut self) -> DriverResult<BslReply> {
        let mut frame = vec![BSL_HDR, 0, 0, 0];
        self.read_exact(&mut frame[1..], HEADER_READ_RETRIES, "reply header")?;

        if frame[1] != 0 || frame[2] != frame[3] {
            return Err(DriverError::incorrect_data(format!(
                "malformed reply header {}",
                hex::encode(&frame)
            )));
        }

        let length = frame[2] as usize;
        frame.resize(4 + length, 0);
        self.read_exact(&mut frame[4..], PAYLOAD_READ_RETRIES, "reply payload")?;

        let mut ck = [0u8; 2];
        self.read_exact(&mut ck, HEADER_READ_RETRIES, "reply checksum")?;

        trace!("RX {} {}", hex::encode(&frame), hex::encode(ck));
        let expected = checksum(&frame);
        let actual = u16::from_le_bytes(ck);
        if expected != actual {
            return Err(DriverError::InvalidChecksum { expected, actual });
        }

        Ok(BslReply::Data(frame.split_off(4)))
    }

    /// Sync, send one command frame and return the reply.
    pub fn send_command(
        &mut self,
        command: u8,
        address: u16,
        length: u16,
        data: &[u8],
        wait: bool,
    ) -> DriverResult<BslReply> {
        let frame = build_frame(command, address, length, data)?;
        self.synchronize(wait)?;

        trace!("TX {}", hex::encode(&frame));
        self.connection.write(&frame)?;
        self.connection.flush()?;
        self.receive_reply()
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Unlock the bootloader.
    ///
    /// Without a password the erased-device password of 32 × 0xFF is sent.
    /// A password of the wrong length is rejected without touching the wire.
    pub fn transmit_password(&mut self, password: Option<&[u8]>, wait: bool) -> DriverResult<bool> {
        let default_password = [ERASED_CELL; BSL_PASSWORD_LENGTH];
        let password = password.unwrap_or(&default_password);
        if password.len() != BSL_PASSWORD_LENGTH {
            warn!(
                "Password has {} bytes, {} required",
                password.len(),
                BSL_PASSWORD_LENGTH
            );
            return Ok(false);
        }

        match self.send_command(
            CMD_TXPASSWORD,
            0,
            BSL_PASSWORD_LENGTH as u16,
            password,
            wait,
        )? {
            BslReply::Ack => Ok(true),
            BslReply::Nack => Ok(false),
            reply => Err(unexpected(reply, "password reply")),
        }
    }

    /// Erase main and information memory.
    pub fn mass_erase(&mut self) -> DriverResult<()> {
        info!("Mass erasing flash");
        match self.send_command(CMD_MASSERASE, MASS_ERASE_ADDRESS, MASS_ERASE_LENGTH, &[], false)? {
            BslReply::Ack => Ok(()),
            reply => Err(DriverError::EraseFailed {
                reason: format!("bootloader answered 0x{:02X}", reply.first_byte()),
            }),
        }
    }

    /// Program one block of at most 250 bytes.
    ///
    /// Anything but an ACK is a failure; the block is not retried.
    pub fn write_flash(&mut self, address: u16, data: &[u8]) -> DriverResult<()> {
        self.execute_patch()?;
        match self.send_command(CMD_TXDATABLOCK, address, data.len() as u16, data, false)? {
            BslReply::Ack => Ok(()),
            reply => Err(DriverError::ProgramFailed {
                address: address as u32,
                reason: format!("bootloader answered 0x{:02X}", reply.first_byte()),
            }),
        }
    }

    /// Read `length` bytes starting at `address`.
    pub fn read_block(&mut self, address: u16, length: u16) -> DriverResult<Vec<u8>> {
        match self.send_command(CMD_RXDATABLOCK, address, length, &[], false)? {
            BslReply::Data(data) if data.len() == length as usize => Ok(data),
            BslReply::Data(data) => Err(DriverError::incorrect_data(format!(
                "requested {} bytes at 0x{:04X}, received {}",
                length,
                address,
                data.len()
            ))),
            BslReply::Nack => Err(DriverError::incorrect_data(format!(
                "read at 0x{:04X} was not acknowledged",
                address
            ))),
            BslReply::Ack => Err(DriverError::incorrect_data(format!(
                "read at 0x{:04X} returned no data",
                address
            ))),
        }
    }

    /// Compare flash contents with `expected`, or with erased cells.
    ///
    /// A mismatch is `Ok(false)`; a NACK or a short reply is
    /// [`DriverError::IncorrectData`].
    pub fn verify_block(
        &mut self,
        address: u16,
        length: u16,
        expected: Option<&[u8]>,
    ) -> DriverResult<bool> {
        if let Some(expected) = expected {
            if expected.len() != length as usize {
                return Err(DriverError::invalid_argument(format!(
                    "expected data has {} bytes, length is {}",
                    expected.len(),
                    length
                )));
            }
        }

        let data = self.read_block(address, length)?;
        let matches = match expected {
            Some(expected) => data == expected,
            None => data.iter().all(|&byte| byte == ERASED_CELL),
        };
        if !matches {
            debug!("Verify mismatch at 0x{:04X}", address);
        }
        Ok(matches)
    }

    /// Load a RAM patch and remember that it must run before flash writes.
    pub fn load_patch(&mut self, patch: &[u8]) -> DriverResult<()> {
        let mut address = BSL_PATCH_ADDRESS;
        for chunk in patch.chunks(BSL_MAX_DATA) {
            match self.send_command(CMD_TXDATABLOCK, address, chunk.len() as u16, chunk, false)? {
                BslReply::Ack => address = address.wrapping_add(chunk.len() as u16),
                reply => {
                    return Err(DriverError::ProgramFailed {
                        address: address as u32,
                        reason: format!("patch block answered 0x{:02X}", reply.first_byte()),
                    })
                }
            }
        }
        self.session.set_patch_loaded(true);
        debug!("Loaded {} byte patch", patch.len());
        Ok(())
    }

    /// Jump into the loaded patch. Without a patch this does nothing.
    pub fn execute_patch(&mut self) -> DriverResult<()> {
        if !self.session.is_patch_loaded() {
            return Ok(());
        }
        match self.send_command(CMD_LOADPC, BSL_PATCH_ADDRESS, 0, &[], false)? {
            BslReply::Ack => Ok(()),
            reply => Err(unexpected(reply, "patch execution")),
        }
    }

    /// Ask the bootloader to switch to `baud_rate`.
    ///
    /// The port follows only after an ACK; on NACK it is left unchanged and
    /// `false` is returned.
    pub fn change_baud_rate(&mut self, baud_rate: u32) -> DriverResult<bool> {
        let (address, length) = baud_rate_parameters(baud_rate)?;
        match self.send_command(CMD_CHANGEBAUD, address, length, &[], false)? {
            BslReply::Ack => {
                self.connection.set_baud_rate(baud_rate)?;
                self.session.set_bsl_baud_rate(baud_rate);
                debug!("Bootloader now at {} baud", baud_rate);
                Ok(true)
            }
            BslReply::Nack => {
                warn!("Bootloader refused {} baud", baud_rate);
                Ok(false)
            }
            reply => Err(unexpected(reply, "baud rate change")),
        }
    }

    /// Run the port at the bootloader's current rate, saving the prior rate
    /// once.
    pub fn set_bsl_baud_rate(&mut self) -> DriverResult<()> {
        if self.session.is_bsl_baud_applied() {
            return Ok(());
        }
        let current = self.connection.baud_rate()?;
        let bsl_baud_rate = self.session.bsl_baud_rate();
        self.connection.set_baud_rate(bsl_baud_rate)?;
        self.session.save_baud_rate(current);
        debug!(
            "Port switched from {} to {} baud for the bootloader",
            current, bsl_baud_rate
        );
        Ok(())
    }

    /// Put the port back to the rate saved by [`Self::set_bsl_baud_rate`].
    pub fn restore_non_bsl_baud_rate(&mut self) -> DriverResult<()> {
        if let Some(baud_rate) = self.session.take_saved_baud_rate() {
            debug!("Restoring port to {} baud", baud_rate);
            self.connection.set_baud_rate(baud_rate)?;
        }
        Ok(())
    }

    // ========================================================================
    // Reset Lines
    // ========================================================================

    /// Start the bootloader through the I2C reset switch.
    pub fn invoke_bsl(&mut self) -> DriverResult<()> {
        debug!("Invoking bootloader");
        self.restart(&INVOKE_BSL_SEQUENCE)
    }

    /// Restart the application through the I2C reset switch.
    pub fn reset(&mut self) -> DriverResult<()> {
        debug!("Resetting device");
        self.restart(&RESET_SEQUENCE)
    }

    fn restart(&mut self, sequence: &[u8]) -> DriverResult<()> {
        self.check_canceled()?;
        I2cBus::new(self.connection.as_ref()).write_sequence(SWITCH_DEVICE, sequence)?;
        self.sleep(OSCILLATOR_SETTLE)?;
        self.connection.clear_input()?;
        self.session.bootloader_restarted();
        if self.session.is_bsl_baud_applied() {
            self.connection.set_baud_rate(BSL_INITIAL_BAUD)?;
        }
        Ok(())
    }
}

fn unexpected(reply: BslReply, context: &str) -> DriverError {
    DriverError::UnexpectedResponse {
        expected: DATA_ACK,
        received: reply.first_byte(),
        context: context.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bsl::parse_frame;
    use crate::connection::{ControlEvent, MemoryConnection};
    use crate::test_helpers::SimulatedBsl;

    fn fast_config(sync_retries: u32) -> DriverConfig {
        DriverConfig {
            reply_timeout_ms: 30,
            sync_timeout_ms: 20,
            sync_retries,
            ..DriverConfig::default()
        }
    }

    fn engine(bsl: &SimulatedBsl, sync_retries: u32) -> BslTelosb {
        BslTelosb::new(Arc::new(bsl.connection()), &fast_config(sync_retries))
    }

    #[test]
    fn test_sync_succeeds_when_retries_exceed_silent_answers() {
        let bsl = SimulatedBsl::new();
        bsl.state().sync_replies.extend([None, None, None]);
        let mut engine = engine(&bsl, 4);

        engine.synchronize(false).unwrap();
        assert_eq!(bsl.state().sync_count, 4);
    }

    #[test]
    fn test_sync_times_out_when_retries_do_not_exceed_silent_answers() {
        let bsl = SimulatedBsl::new();
        bsl.state().sync_replies.extend([None, None, None]);
        let mut engine = engine(&bsl, 3);

        let err = engine.synchronize(false).unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
        assert_eq!(bsl.state().sync_count, 3);
    }

    #[test]
    fn test_sync_garbage_fails_without_retry() {
        let bsl = SimulatedBsl::new();
        bsl.state().sync_replies.push_back(Some(DATA_NACK));
        let mut engine = engine(&bsl, 10);

        let err = engine.synchronize(false).unwrap_err();
        assert!(matches!(
            err,
            DriverError::NotSynchronized { received: DATA_NACK }
        ));
        assert_eq!(bsl.state().sync_count, 1);
    }

    #[test]
    fn test_sync_recovery_retries_only_garbage() {
        let bsl = SimulatedBsl::new();
        bsl.state()
            .sync_replies
            .extend([Some(DATA_NACK), Some(0x00)]);
        let mut engine = engine(&bsl, 2);
        engine.synchronize_with_recovery(3).unwrap();
        assert_eq!(bsl.state().sync_count, 3);

        bsl.state().sync_replies.extend([None, None]);
        let err = engine.synchronize_with_recovery(3).unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
    }

    #[test]
    fn test_write_flash_nack_fails_without_retry() {
        let bsl = SimulatedBsl::new();
        bsl.state().nack_commands.push(CMD_TXDATABLOCK);
        let mut engine = engine(&bsl, 3);

        let err = engine.write_flash(0x4000, &[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(
            err,
            DriverError::ProgramFailed { address: 0x4000, .. }
        ));
        assert_eq!(bsl.state().frames_with(CMD_TXDATABLOCK), 1);
    }

    #[test]
    fn test_write_then_read_block() {
        let bsl = SimulatedBsl::new();
        let mut engine = engine(&bsl, 3);

        engine.write_flash(0x4000, &[0xDE, 0xAD, 0xBE]).unwrap();
        assert_eq!(
            engine.read_block(0x4000, 4).unwrap(),
            vec![0xDE, 0xAD, 0xBE, 0xFF]
        );
    }

    #[test]
    fn test_verify_block_against_data_and_erased_cells() {
        let bsl = SimulatedBsl::new();
        let mut engine = engine(&bsl, 3);
        engine.write_flash(0x5000, &[1, 2]).unwrap();

        assert!(engine.verify_block(0x5000, 2, Some(&[1, 2])).unwrap());
        assert!(!engine.verify_block(0x5000, 2, Some(&[1, 3])).unwrap());
        assert!(engine.verify_block(0x6000, 8, None).unwrap());
        assert!(!engine.verify_block(0x5000, 2, None).unwrap());
    }

    #[test]
    fn test_verify_block_nack_is_incorrect_data() {
        let bsl = SimulatedBsl::new();
        bsl.state().nack_commands.push(CMD_RXDATABLOCK);
        let mut engine = engine(&bsl, 3);

        let err = engine.verify_block(0x5000, 2, None).unwrap_err();
        assert!(matches!(err, DriverError::IncorrectData { .. }));
    }

    #[test]
    fn test_short_reply_is_incorrect_data() {
        let bsl = SimulatedBsl::new();
        bsl.state().short_replies = true;
        let mut engine = engine(&bsl, 3);

        let err = engine.read_block(0x5000, 4).unwrap_err();
        assert!(matches!(err, DriverError::IncorrectData { .. }));
    }

    #[test]
    fn test_corrupt_reply_is_invalid_checksum() {
        let bsl = SimulatedBsl::new();
        bsl.state().corrupt_replies = true;
        let mut engine = engine(&bsl, 3);

        let err = engine.read_block(0x5000, 2).unwrap_err();
        assert!(matches!(err, DriverError::InvalidChecksum { .. }));
    }

    #[test]
    fn test_malformed_header_is_incorrect_data() {
        let bsl = SimulatedBsl::new();
        bsl.state().malformed_replies = true;
        let mut engine = engine(&bsl, 3);

        let err = engine.read_block(0x5000, 2).unwrap_err();
        assert!(matches!(err, DriverError::IncorrectData { .. }));
    }

    #[test]
    fn test_missing_reply_times_out() {
        let bsl = SimulatedBsl::new();
        bsl.state().mute_commands.push(CMD_MASSERASE);
        let mut engine = engine(&bsl, 3);

        let err = engine.mass_erase().unwrap_err();
        assert!(matches!(err, DriverError::Timeout { .. }));
    }

    #[test]
    fn test_mass_erase_nack_is_erase_failed() {
        let bsl = SimulatedBsl::new();
        bsl.state().nack_commands.push(CMD_MASSERASE);
        let mut engine = engine(&bsl, 3);

        assert!(matches!(
            engine.mass_erase(),
            Err(DriverError::EraseFailed { .. })
        ));
    }

    #[test]
    fn test_mass_erase_frame() {
        let bsl = SimulatedBsl::new();
        let mut engine = engine(&bsl, 3);
        engine.mass_erase().unwrap();

        let state = bsl.state();
        let frame = state.frames.last().unwrap();
        assert_eq!(frame.command, CMD_MASSERASE);
        assert_eq!(frame.address, MASS_ERASE_ADDRESS);
        assert_eq!(frame.length, MASS_ERASE_LENGTH);
    }

    #[test]
    fn test_default_password_is_erased_cells() {
        let bsl = SimulatedBsl::new();
        let mut engine = engine(&bsl, 3);

        assert!(engine.transmit_password(None, false).unwrap());
        let state = bsl.state();
        let frame = state.frames.last().unwrap();
        assert_eq!(frame.command, CMD_TXPASSWORD);
        assert_eq!(frame.data, vec![0xFF; BSL_PASSWORD_LENGTH]);
    }

    #[test]
    fn test_password_of_wrong_length_is_refused_locally() {
        let bsl = SimulatedBsl::new();
        let mut engine = engine(&bsl, 3);

        assert!(!engine.transmit_password(Some(&[0u8; 16]), false).unwrap());
        assert_eq!(bsl.state().sync_count, 0);
    }

    #[test]
    fn test_password_nack_is_false() {
        let bsl = SimulatedBsl::new();
        bsl.state().nack_commands.push(CMD_TXPASSWORD);
        let mut engine = engine(&bsl, 3);
        assert!(!engine.transmit_password(None, false).unwrap());
    }

    #[test]
    fn test_change_baud_rate_nack_leaves_port_unchanged() {
        let bsl = SimulatedBsl::new();
        bsl.state().nack_commands.push(CMD_CHANGEBAUD);
        let connection = Arc::new(bsl.connection());
        connection.set_baud_rate(9600).unwrap();
        let mut engine = BslTelosb::new(connection.clone(), &fast_config(3));

        assert!(!engine.change_baud_rate(38400).unwrap());
        assert_eq!(connection.baud_rate().unwrap(), 9600);
        assert_eq!(engine.session().bsl_baud_rate(), 9600);
    }

    #[test]
    fn test_bsl_baud_rate_is_saved_and_restored() {
        let bsl = SimulatedBsl::new();
        let connection = Arc::new(bsl.connection());
        connection.set_baud_rate(115_200).unwrap();
        let mut engine = BslTelosb::new(connection.clone(), &fast_config(3));

        engine.set_bsl_baud_rate().unwrap();
        assert_eq!(connection.baud_rate().unwrap(), BSL_INITIAL_BAUD);
        assert!(engine.session().is_bsl_baud_applied());

        assert!(engine.change_baud_rate(38400).unwrap());
        let frame = bsl.state().frames.last().cloned().unwrap();
        assert_eq!((frame.address, frame.length), (0x87E0, 2));
        assert_eq!(connection.baud_rate().unwrap(), 38400);

        // Saved rate survives a second switch.
        engine.set_bsl_baud_rate().unwrap();
        engine.restore_non_bsl_baud_rate().unwrap();
        assert_eq!(connection.baud_rate().unwrap(), 115_200);
        assert!(!engine.session().is_bsl_baud_applied());
    }

    #[test]
    fn test_patch_runs_before_flash_writes_once_loaded() {
        let bsl = SimulatedBsl::new();
        let mut engine = engine(&bsl, 3);

        engine.execute_patch().unwrap();
        assert_eq!(bsl.state().frames_with(CMD_LOADPC), 0);

        engine.load_patch(&[0x31, 0x40, 0x1A, 0x02]).unwrap();
        assert!(engine.session().is_patch_loaded());
        engine.write_flash(0x4000, &[1, 2]).unwrap();
        assert_eq!(bsl.state().frames_with(CMD_LOADPC), 1);
    }

    #[test]
    fn test_invoke_bsl_drives_lines_and_resets_baud() {
        let bsl = SimulatedBsl::new();
        let connection = Arc::new(bsl.connection());
        let mut engine = BslTelosb::new(connection.clone(), &fast_config(3));
        engine.set_bsl_baud_rate().unwrap();
        assert!(engine.change_baud_rate(38400).unwrap());
        let before = connection.events().len();

        engine.invoke_bsl().unwrap();
        let events = connection.events().split_off(before);
        let line_changes = events
            .iter()
            .filter(|event| matches!(event, ControlEvent::Dtr(_) | ControlEvent::Rts(_)))
            .count();
        assert_eq!(line_changes, INVOKE_BSL_SEQUENCE.len() * 78);
        assert_eq!(events.last(), Some(&ControlEvent::Baud(BSL_INITIAL_BAUD)));
        assert_eq!(engine.session().bsl_baud_rate(), BSL_INITIAL_BAUD);
    }

    #[test]
    fn test_reset_keeps_normal_baud_outside_bootloader() {
        let connection = Arc::new(MemoryConnection::silent());
        connection.set_baud_rate(115_200).unwrap();
        let mut engine = BslTelosb::new(connection.clone(), &fast_config(3));

        engine.reset().unwrap();
        assert_eq!(connection.baud_rate().unwrap(), 115_200);
    }

    #[test]
    fn test_canceled_token_stops_waiting() {
        let connection = Arc::new(MemoryConnection::silent());
        let mut engine = BslTelosb::new(connection, &DriverConfig::default());
        let token = CancellationToken::new();
        token.cancel();
        engine.set_cancellation(Some(token));

        let started = Instant::now();
        assert!(matches!(
            engine.synchronize(true),
            Err(DriverError::Canceled)
        ));
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_frames_on_the_wire_are_valid() {
        let bsl = SimulatedBsl::new();
        let connection = Arc::new(bsl.connection());
        let mut engine = BslTelosb::new(connection.clone(), &fast_config(3));
        engine.write_flash(0x4000, &[9; 7]).unwrap();

        let written = connection.written();
        // Sync byte, then one frame.
        assert_eq!(written[0], BSL_SYNC);
        let frame = parse_frame(&written[1..]).unwrap();
        assert_eq!(frame.data, vec![9; 7]);
    }
}
