//! Device without hardware.
//!
//! Every command runs a fixed number of sleeping, cancellable steps and then
//! acts on an in-memory flash and MAC address. Useful to exercise queues,
//! callbacks and front ends.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use super::{ChipType, DeviceType, MacAddress, OperationFactory};
use crate::config::{DriverConfig, ERASED_CELL, MOCK_FLASH_SIZE};
use crate::connection::Connection;
use crate::error::{DriverError, DriverResult};
use crate::operation::{BoxedOperation, Operation, OperationContext};

/// Simulated memory of the mock device.
#[derive(Debug, Clone)]
pub struct MockState {
    pub flash: Vec<u8>,
    pub mac: MacAddress,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            flash: vec![ERASED_CELL; MOCK_FLASH_SIZE],
            mac: MacAddress::default(),
        }
    }
}

struct MockOperation<T, F> {
    name: &'static str,
    steps: u32,
    sleep: Duration,
    state: Arc<Mutex<MockState>>,
    action: Option<F>,
    _output: PhantomData<fn() -> T>,
}

impl<T, F> Operation for MockOperation<T, F>
where
    T: Send + 'static,
    F: FnOnce(&mut MockState) -> DriverResult<T> + Send,
{
    type Output = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&mut self, context: &mut OperationContext) -> DriverResult<T> {
        let steps = self.steps.max(1);
        for step in 0..steps {
            context.check_canceled()?;
            context.sleep(self.sleep)?;
            context.worked(1.0 / steps as f32);
            debug!("{} step {}/{}", self.name, step + 1, steps);
        }

        let action = self.action.take().ok_or_else(|| {
            DriverError::illegal_state(format!("{} already ran", self.name))
        })?;
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        action(&mut state)
    }
}

fn check_range(address: u32, length: usize) -> DriverResult<()> {
    if address as usize + length > MOCK_FLASH_SIZE {
        return Err(DriverError::invalid_argument(format!(
            "0x{:X} + {} bytes is outside the simulated flash",
            address, length
        )));
    }
    Ok(())
}

/// Device that simulates every command.
pub struct MockDevice {
    connection: Arc<dyn Connection>,
    state: Arc<Mutex<MockState>>,
    steps: u32,
    sleep: Duration,
}

impl MockDevice {
    pub fn new(connection: Arc<dyn Connection>, config: &DriverConfig) -> Self {
        Self {
            connection,
            state: Arc::new(Mutex::new(MockState::default())),
            steps: config.mock_steps,
            sleep: config.mock_sleep(),
        }
    }

    /// Snapshot of the simulated memory.
    pub fn state(&self) -> MockState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn operation<T, F>(&self, name: &'static str, action: F) -> BoxedOperation<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut MockState) -> DriverResult<T> + Send + 'static,
    {
        Box::new(MockOperation {
            name,
            steps: self.steps,
            sleep: self.sleep,
            state: Arc::clone(&self.state),
            action: Some(action),
            _output: PhantomData,
        })
    }
}

impl OperationFactory for MockDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Mock
    }

    fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    fn chip_type_operation(&self) -> DriverResult<BoxedOperation<ChipType>> {
        Ok(self.operation("get-chip-type", |_| Ok(ChipType::Unknown)))
    }

    fn erase_flash_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Ok(self.operation("erase-flash", |state| {
            state.flash.fill(ERASED_CELL);
            Ok(())
        }))
    }

    fn program_operation(&self, image: Vec<u8>) -> DriverResult<BoxedOperation<()>> {
        Ok(self.operation("program", move |state| {
            if image.len() > state.flash.len() {
                return Err(DriverError::InvalidImage {
                    reason: format!("{} bytes do not fit into flash", image.len()),
                });
            }
            state.flash.fill(ERASED_CELL);
            state.flash[..image.len()].copy_from_slice(&image);
            Ok(())
        }))
    }

    fn read_flash_operation(
        &self,
        address: u32,
        length: u32,
    ) -> DriverResult<BoxedOperation<Vec<u8>>> {
        check_range(address, length as usize)?;
        Ok(self.operation("read-flash", move |state| {
            let start = address as usize;
            Ok(state.flash[start..start + length as usize].to_vec())
        }))
    }

    fn write_flash_operation(
        &self,
        address: u32,
        data: Vec<u8>,
    ) -> DriverResult<BoxedOperation<()>> {
        check_range(address, data.len())?;
        Ok(self.operation("write-flash", move |state| {
            let start = address as usize;
            state.flash[start..start + data.len()].copy_from_slice(&data);
            Ok(())
        }))
    }

    fn read_mac_operation(&self) -> DriverResult<BoxedOperation<MacAddress>> {
        Ok(self.operation("read-mac", |state| Ok(state.mac)))
    }

    fn write_mac_operation(&self, mac: MacAddress) -> DriverResult<BoxedOperation<()>> {
        Ok(self.operation("write-mac", move |state| {
            state.mac = mac;
            Ok(())
        }))
    }

    fn reset_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Ok(self.operation("reset", |_| Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use crate::operation::{CancellationToken, ProgressScope, ProgressTracker};
    use crate::test_helpers::fast_config;

    fn device() -> MockDevice {
        MockDevice::new(Arc::new(MemoryConnection::echo()), &fast_config())
    }

    #[test]
    fn test_write_then_read_flash() {
        let device = device();
        let mut write = device.write_flash_operation(0x100, vec![1, 2, 3]).unwrap();
        write.execute(&mut OperationContext::detached()).unwrap();

        let mut read = device.read_flash_operation(0xFF, 5).unwrap();
        let data = read.execute(&mut OperationContext::detached()).unwrap();
        assert_eq!(data, vec![0xFF, 1, 2, 3, 0xFF]);
    }

    #[test]
    fn test_mac_round_trip() {
        let device = device();
        let mac = MacAddress::from(0x0015_8d00_0000_abcd_u64);
        device
            .write_mac_operation(mac)
            .unwrap()
            .execute(&mut OperationContext::detached())
            .unwrap();
        let read = device
            .read_mac_operation()
            .unwrap()
            .execute(&mut OperationContext::detached())
            .unwrap();
        assert_eq!(read, mac);
    }

    #[test]
    fn test_steps_report_progress() {
        let device = device();
        let tracker = ProgressTracker::detached();
        let mut context = OperationContext::new(
            CancellationToken::new(),
            ProgressScope::root(Arc::clone(&tracker)),
        );
        device
            .reset_operation()
            .unwrap()
            .execute(&mut context)
            .unwrap();
        assert!((tracker.value() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_cancel_stops_before_acting() {
        let device = device();
        let mut erase = device.erase_flash_operation().unwrap();
        device
            .write_flash_operation(0, vec![0])
            .unwrap()
            .execute(&mut OperationContext::detached())
            .unwrap();

        let mut context = OperationContext::detached();
        context.token().cancel();
        assert!(matches!(erase.execute(&mut context), Err(DriverError::Canceled)));
        assert_eq!(device.state().flash[0], 0);
    }

    #[test]
    fn test_out_of_range_read_is_rejected() {
        let device = device();
        assert!(matches!(
            device.read_flash_operation(MOCK_FLASH_SIZE as u32, 1),
            Err(DriverError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_program_replaces_flash() {
        let device = device();
        device
            .program_operation(vec![9; 4])
            .unwrap()
            .execute(&mut OperationContext::detached())
            .unwrap();
        let state = device.state();
        assert_eq!(&state.flash[..5], &[9, 9, 9, 9, 0xFF]);
        assert!(device.connection().is_connected());
    }
}
