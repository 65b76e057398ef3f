//! Operations every serial-attached family shares.

use std::sync::Arc;

use log::{debug, warn};

use crate::config::RESET_PULSE;
use crate::connection::{Connection, SerialPortMode};
use crate::error::DriverResult;
use crate::operation::{Operation, OperationContext};

/// Write a message to the device and flush it.
pub struct SendOperation {
    connection: Arc<dyn Connection>,
    data: Vec<u8>,
}

impl SendOperation {
    pub fn new(connection: Arc<dyn Connection>, data: Vec<u8>) -> Self {
        Self { connection, data }
    }
}

impl Operation for SendOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "send"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        context.check_canceled()?;
        self.connection.write(&self.data)?;
        self.connection.flush()?;
        context.done();
        Ok(())
    }
}

/// Switch the port into its programming configuration.
pub struct EnterProgramModeOperation {
    connection: Arc<dyn Connection>,
}

impl EnterProgramModeOperation {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }
}

impl Operation for EnterProgramModeOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "enter-program-mode"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        context.check_canceled()?;
        self.connection.set_mode(SerialPortMode::Program)?;
        self.connection.clear_input()?;
        debug!("Entered program mode");
        context.done();
        Ok(())
    }
}

/// Switch the port back to its normal configuration.
pub struct LeaveProgramModeOperation {
    connection: Arc<dyn Connection>,
}

impl LeaveProgramModeOperation {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }
}

impl Operation for LeaveProgramModeOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "leave-program-mode"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        self.connection.flush()?;
        context.set_progress(0.5);
        self.connection.set_mode(SerialPortMode::Normal)?;
        context.set_progress(1.0);
        debug!("Left program mode");
        Ok(())
    }
}

/// Reset the chip with a pulse on the RTS line.
pub struct PulseResetOperation {
    connection: Arc<dyn Connection>,
}

impl PulseResetOperation {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self { connection }
    }
}

impl Operation for PulseResetOperation {
    type Output = ();

    fn name(&self) -> &'static str {
        "reset"
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<()> {
        context.check_canceled()?;
        self.connection.set_dtr(false)?;
        self.connection.set_rts(true)?;
        context.sleep(RESET_PULSE)?;
        context.set_progress(0.5);
        self.connection.set_rts(false)?;
        debug!("Reset pulse sent");
        context.done();
        Ok(())
    }
}

/// Run `body` between `enter` and `leave`.
///
/// `leave` runs even when `body` fails; in that case the body's error is
/// returned and a failure to leave is only logged.
pub(crate) fn in_program_mode<T, E, L, F>(
    context: &mut OperationContext,
    enter: (&mut E, f32),
    body_fraction: f32,
    leave: (&mut L, f32),
    body: F,
) -> DriverResult<T>
where
    E: Operation<Output = ()> + ?Sized,
    L: Operation<Output = ()> + ?Sized,
    F: FnOnce(&mut OperationContext) -> DriverResult<T>,
{
    context.execute_sub_operation(enter.0, enter.1)?;

    let mut body_context = context.create_sub(body_fraction);
    let result = body(&mut body_context);
    if result.is_ok() {
        body_context.done();
    }

    // Leaving must not be skipped because the caller canceled.
    let mut leave_context = context.create_sub(leave.1);
    let left = leave.0.execute(&mut leave_context);

    match (result, left) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(leave_error)) => {
            warn!("Failed to leave program mode after error: {}", leave_error);
            Err(e)
        }
    }
}
