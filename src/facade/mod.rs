//! Asynchronous device facade.
//!
//! [`DeviceAsync`] validates requests, turns them into operations and hands
//! them to its [`OperationQueue`]. Every command returns immediately with an
//! [`OperationFuture`]. Data the device emits on its own is bridged into a
//! [`DeviceInputStream`] whenever no operation owns the wire.

mod bridge;
mod stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use crate::config::DriverConfig;
use crate::connection::{Connection, MemoryConnection};
use crate::device::{ChipType, DeviceDriver, DeviceType, MacAddress};
use crate::error::{DriverError, DriverResult};
use crate::operation::{AsyncAdapter, AsyncCallback};
use crate::queue::{OperationFuture, OperationQueue};

use bridge::StreamBridge;
use stream::StreamBuffer;

pub use stream::{DeviceInputStream, DeviceOutputStream};

// ============================================================================
// Argument validation
// ============================================================================

fn timeout_from_ms(timeout_ms: i64) -> DriverResult<Duration> {
    if timeout_ms < 0 {
        return Err(DriverError::invalid_argument(
            "negative timeout is not allowed",
        ));
    }
    Ok(Duration::from_millis(timeout_ms as u64))
}

fn non_negative(value: i64, what: &str) -> DriverResult<u32> {
    if value < 0 {
        return Err(DriverError::invalid_argument(format!(
            "negative {} is not allowed",
            what
        )));
    }
    u32::try_from(value)
        .map_err(|_| DriverError::invalid_argument(format!("{} {} is too large", what, value)))
}

pub(crate) fn submit_send(
    driver: &DeviceDriver,
    queue: &OperationQueue,
    data: Vec<u8>,
    timeout: Duration,
) -> DriverResult<OperationFuture<()>> {
    let operation = driver.send_operation(data)?;
    queue.add_operation(operation, timeout, AsyncAdapter)
}

// ============================================================================
// Facade
// ============================================================================

/// Queued, callback driven access to one device.
pub struct DeviceAsync {
    driver: Arc<DeviceDriver>,
    queue: Arc<OperationQueue>,
    buffer: Arc<StreamBuffer>,
    bridge: StreamBridge,
    closed: AtomicBool,
}

impl DeviceAsync {
    /// Start a queue and a stream bridge for `driver`.
    pub fn new(driver: DeviceDriver, config: &DriverConfig) -> DriverResult<Self> {
        let queue = Arc::new(OperationQueue::new()?);
        let buffer = StreamBuffer::new();
        let bridge = StreamBridge::start(
            Arc::clone(driver.connection()),
            Arc::clone(&buffer),
            config.bridge_poll_interval(),
        )?;
        queue.add_listener(bridge.gate());

        debug!("Device facade for {} ready", driver.device_type());
        Ok(Self {
            driver: Arc::new(driver),
            queue,
            buffer,
            bridge,
            closed: AtomicBool::new(false),
        })
    }

    pub fn device_type(&self) -> DeviceType {
        self.driver.device_type()
    }

    /// The queue scheduling this device's operations.
    ///
    /// Useful to register listeners or to pause scheduling.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn get_chip_type<C>(
        &self,
        timeout_ms: i64,
        callback: C,
    ) -> DriverResult<OperationFuture<ChipType>>
    where
        C: AsyncCallback<ChipType> + 'static,
    {
        trace!("Reading chip type (timeout: {}ms)", timeout_ms);
        let timeout = timeout_from_ms(timeout_ms)?;
        let operation = self.driver.chip_type_operation()?;
        self.queue.add_operation(operation, timeout, callback)
    }

    pub fn erase_flash<C>(&self, timeout_ms: i64, callback: C) -> DriverResult<OperationFuture<()>>
    where
        C: AsyncCallback<()> + 'static,
    {
        trace!("Erasing flash (timeout: {}ms)", timeout_ms);
        let timeout = timeout_from_ms(timeout_ms)?;
        let operation = self.driver.erase_flash_operation()?;
        self.queue.add_operation(operation, timeout, callback)
    }

    /// Write `image` to the device. The image format depends on the family.
    pub fn program<C>(
        &self,
        image: Vec<u8>,
        timeout_ms: i64,
        callback: C,
    ) -> DriverResult<OperationFuture<()>>
    where
        C: AsyncCallback<()> + 'static,
    {
        trace!(
            "Programming {} bytes (timeout: {}ms)",
            image.len(),
            timeout_ms
        );
        let timeout = timeout_from_ms(timeout_ms)?;
        let operation = self.driver.program_operation(image)?;
        self.queue.add_operation(operation, timeout, callback)
    }

    pub fn read_flash<C>(
        &self,
        address: i64,
        length: i64,
        timeout_ms: i64,
        callback: C,
    ) -> DriverResult<OperationFuture<Vec<u8>>>
    where
        C: AsyncCallback<Vec<u8>> + 'static,
    {
        trace!(
            "Reading flash (address: {}, length: {}, timeout: {}ms)",
            address,
            length,
            timeout_ms
        );
        let address = non_negative(address, "address")?;
        let length = non_negative(length, "length")?;
        let timeout = timeout_from_ms(timeout_ms)?;
        let operation = self.driver.read_flash_operation(address, length)?;
        self.queue.add_operation(operation, timeout, callback)
    }

    pub fn read_mac<C>(
        &self,
        timeout_ms: i64,
        callback: C,
    ) -> DriverResult<OperationFuture<MacAddress>>
    where
        C: AsyncCallback<MacAddress> + 'static,
    {
        trace!("Reading MAC address (timeout: {}ms)", timeout_ms);
        let timeout = timeout_from_ms(timeout_ms)?;
        let operation = self.driver.read_mac_operation()?;
        self.queue.add_operation(operation, timeout, callback)
    }

    pub fn write_mac<C>(
        &self,
        mac: MacAddress,
        timeout_ms: i64,
        callback: C,
    ) -> DriverResult<OperationFuture<()>>
    where
        C: AsyncCallback<()> + 'static,
    {
        trace!("Writing MAC address {} (timeout: {}ms)", mac, timeout_ms);
        let timeout = timeout_from_ms(timeout_ms)?;
        let operation = self.driver.write_mac_operation(mac)?;
        self.queue.add_operation(operation, timeout, callback)
    }

    pub fn reset<C>(&self, timeout_ms: i64, callback: C) -> DriverResult<OperationFuture<()>>
    where
        C: AsyncCallback<()> + 'static,
    {
        trace!("Resetting device (timeout: {}ms)", timeout_ms);
        let timeout = timeout_from_ms(timeout_ms)?;
        let operation = self.driver.reset_operation()?;
        self.queue.add_operation(operation, timeout, callback)
    }

    /// Send raw bytes to the application running on the device.
    pub fn send<C>(
        &self,
        message: Vec<u8>,
        timeout_ms: i64,
        callback: C,
    ) -> DriverResult<OperationFuture<()>>
    where
        C: AsyncCallback<()> + 'static,
    {
        trace!(
            "Sending {} bytes (timeout: {}ms)",
            message.len(),
            timeout_ms
        );
        let timeout = timeout_from_ms(timeout_ms)?;
        let operation = self.driver.send_operation(message)?;
        self.queue.add_operation(operation, timeout, callback)
    }

    /// Write the first `length` bytes of `data` at `address`.
    pub fn write_flash<C>(
        &self,
        address: i64,
        data: &[u8],
        length: i64,
        timeout_ms: i64,
        callback: C,
    ) -> DriverResult<OperationFuture<()>>
    where
        C: AsyncCallback<()> + 'static,
    {
        trace!(
            "Writing flash (address: {}, length: {}, timeout: {}ms)",
            address,
            length,
            timeout_ms
        );
        let address = non_negative(address, "address")?;
        let length = non_negative(length, "length")? as usize;
        let timeout = timeout_from_ms(timeout_ms)?;
        if length > data.len() {
            return Err(DriverError::invalid_argument(format!(
                "length {} exceeds the {} bytes given",
                length,
                data.len()
            )));
        }
        let operation = self
            .driver
            .write_flash_operation(address, data[..length].to_vec())?;
        self.queue.add_operation(operation, timeout, callback)
    }

    /// Reader for data the device sends outside of operations.
    pub fn input_stream(&self) -> DeviceInputStream {
        DeviceInputStream::new(Arc::clone(&self.buffer))
    }

    /// Writer whose flushes become send operations bounded by `timeout_ms`.
    pub fn output_stream(&self, timeout_ms: i64) -> DriverResult<DeviceOutputStream> {
        let timeout = timeout_from_ms(timeout_ms)?;
        Ok(DeviceOutputStream::new(
            Arc::clone(&self.driver),
            Arc::clone(&self.queue),
            timeout,
        ))
    }

    /// Stop the stream bridge and end the input stream.
    ///
    /// Blocks until the bridge thread has exited. Queued operations are not
    /// touched; the queue shuts down when the facade is dropped.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bridge.stop();
        self.buffer.close();
        debug!("Device facade for {} closed", self.driver.device_type());
    }
}

impl Drop for DeviceAsync {
    fn drop(&mut self) {
        self.close();
        self.queue.shutdown();
    }
}

/// Build a facade for `device_type` on `connection`.
pub fn create_device_async(
    device_type: DeviceType,
    connection: Arc<dyn Connection>,
    config: &DriverConfig,
) -> DriverResult<DeviceAsync> {
    let driver = DeviceDriver::new(device_type, connection, config);
    DeviceAsync::new(driver, config)
}

/// Facade over a mock device on an echoing in-memory connection.
pub fn create_mock_device_async(config: &DriverConfig) -> DriverResult<DeviceAsync> {
    create_device_async(DeviceType::Mock, Arc::new(MemoryConnection::echo()), config)
}
