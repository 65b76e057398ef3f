//! Device families and the operations they offer.
//!
//! [`DeviceDriver`] is the closed set of supported families. It hands out
//! boxed operations ready to be queued, or `Unsupported` when a family has
//! no implementation for a command.

mod common;
mod image;
pub(crate) mod jennic;
mod mac;
mod mock;
mod pacemate;
mod telosb;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::DriverConfig;
use crate::connection::Connection;
use crate::error::{DriverError, DriverResult};
use crate::operation::BoxedOperation;

pub use common::{
    EnterProgramModeOperation, LeaveProgramModeOperation, PulseResetOperation, SendOperation,
};
pub use image::{BinaryImage, ImageBlock, JennicImage};
pub use jennic::{JennicBootloader, JennicDevice};
pub use mac::MacAddress;
pub use mock::{MockDevice, MockState};
pub use pacemate::{PacemateBootloader, PacemateDevice};
pub use telosb::TelosbDevice;

/// Supported board families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Jennic,
    Pacemate,
    Telosb,
    Mock,
}

impl DeviceType {
    pub fn name(self) -> &'static str {
        match self {
            DeviceType::Jennic => "Jennic",
            DeviceType::Pacemate => "Pacemate",
            DeviceType::Telosb => "TelosB",
            DeviceType::Mock => "Mock",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DeviceType {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jennic" | "isense" => Ok(DeviceType::Jennic),
            "pacemate" => Ok(DeviceType::Pacemate),
            "telosb" => Ok(DeviceType::Telosb),
            "mock" => Ok(DeviceType::Mock),
            other => Err(DriverError::invalid_argument(format!(
                "unknown device type '{}'",
                other
            ))),
        }
    }
}

/// Microcontroller found on a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipType {
    Jn513x,
    Jn513xR1,
    Jn5121,
    Jn5148,
    Lpc2136,
    Telosb,
    Unknown,
}

/// Offset of the vendor flash header in Jennic images and flash.
const JENNIC_HEADER_START: u32 = 0x30;

/// Length of the vendor flash header.
const JENNIC_HEADER_LENGTH: u32 = 16;

/// Offset of the MAC address within Jennic flash.
const JENNIC_MAC_START: u32 = 0x30;

impl ChipType {
    pub fn is_jennic(self) -> bool {
        matches!(
            self,
            ChipType::Jn513x | ChipType::Jn513xR1 | ChipType::Jn5121 | ChipType::Jn5148
        )
    }

    /// Flash offset of the vendor header, for chips that have one.
    pub fn header_start(self) -> Option<u32> {
        self.is_jennic().then_some(JENNIC_HEADER_START)
    }

    pub fn header_length(self) -> Option<u32> {
        self.is_jennic().then_some(JENNIC_HEADER_LENGTH)
    }

    /// Flash offset of the MAC address, for chips that store it in flash.
    pub fn mac_in_flash_start(self) -> Option<u32> {
        self.is_jennic().then_some(JENNIC_MAC_START)
    }

    /// Big-endian tag at offset 0 of an image built for this chip.
    ///
    /// The tags reuse the identification words the chips report.
    pub fn image_tag(self) -> Option<u32> {
        match self {
            ChipType::Jn513x => Some(0x0020_0000),
            ChipType::Jn513xR1 => Some(0x1000_0000),
            ChipType::Jn5121 => Some(0x2000_0000),
            ChipType::Jn5148 => Some(0x1040_4686),
            _ => None,
        }
    }

    pub fn from_image_tag(tag: u32) -> Option<Self> {
        [
            ChipType::Jn513x,
            ChipType::Jn513xR1,
            ChipType::Jn5121,
            ChipType::Jn5148,
        ]
        .into_iter()
        .find(|chip| chip.image_tag() == Some(tag))
    }

    /// Whether an image built for `image` runs on this chip.
    ///
    /// Both JN513x revisions share one image format.
    pub fn accepts_image_for(self, image: ChipType) -> bool {
        match (self, image) {
            (ChipType::Jn513x, ChipType::Jn513xR1) | (ChipType::Jn513xR1, ChipType::Jn513x) => {
                true
            }
            _ => self == image,
        }
    }
}

impl fmt::Display for ChipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChipType::Jn513x => "JN513X",
            ChipType::Jn513xR1 => "JN513XR1",
            ChipType::Jn5121 => "JN5121",
            ChipType::Jn5148 => "JN5148",
            ChipType::Lpc2136 => "LPC2136",
            ChipType::Telosb => "TelosB",
            ChipType::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

pub(crate) fn unsupported(operation: &'static str, device: DeviceType) -> DriverError {
    DriverError::Unsupported {
        operation,
        device: device.name(),
    }
}

/// Per-family operation factory.
///
/// Every command defaults to `Unsupported`; families override what they
/// implement.
pub(crate) trait OperationFactory: Send + Sync {
    fn device_type(&self) -> DeviceType;

    fn connection(&self) -> &Arc<dyn Connection>;

    fn chip_type_operation(&self) -> DriverResult<BoxedOperation<ChipType>> {
        Err(unsupported("get_chip_type", self.device_type()))
    }

    fn erase_flash_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Err(unsupported("erase_flash", self.device_type()))
    }

    fn program_operation(&self, _image: Vec<u8>) -> DriverResult<BoxedOperation<()>> {
        Err(unsupported("program", self.device_type()))
    }

    fn read_flash_operation(
        &self,
        _address: u32,
        _length: u32,
    ) -> DriverResult<BoxedOperation<Vec<u8>>> {
        Err(unsupported("read_flash", self.device_type()))
    }

    fn write_flash_operation(
        &self,
        _address: u32,
        _data: Vec<u8>,
    ) -> DriverResult<BoxedOperation<()>> {
        Err(unsupported("write_flash", self.device_type()))
    }

    fn read_mac_operation(&self) -> DriverResult<BoxedOperation<MacAddress>> {
        Err(unsupported("read_mac", self.device_type()))
    }

    fn write_mac_operation(&self, _mac: MacAddress) -> DriverResult<BoxedOperation<()>> {
        Err(unsupported("write_mac", self.device_type()))
    }

    fn reset_operation(&self) -> DriverResult<BoxedOperation<()>> {
        Err(unsupported("reset", self.device_type()))
    }

    fn send_operation(&self, data: Vec<u8>) -> DriverResult<BoxedOperation<()>> {
        Ok(Box::new(SendOperation::new(
            Arc::clone(self.connection()),
            data,
        )))
    }
}

/// A board attached to one connection.
pub enum DeviceDriver {
    Jennic(JennicDevice),
    Pacemate(PacemateDevice),
    Telosb(TelosbDevice),
    Mock(MockDevice),
}

impl DeviceDriver {
    pub fn new(
        device_type: DeviceType,
        connection: Arc<dyn Connection>,
        config: &DriverConfig,
    ) -> Self {
        match device_type {
            DeviceType::Jennic => DeviceDriver::Jennic(JennicDevice::new(connection, config)),
            DeviceType::Pacemate => {
                DeviceDriver::Pacemate(PacemateDevice::new(connection, config))
            }
            DeviceType::Telosb => DeviceDriver::Telosb(TelosbDevice::new(connection, config)),
            DeviceType::Mock => DeviceDriver::Mock(MockDevice::new(connection, config)),
        }
    }

    fn factory(&self) -> &dyn OperationFactory {
        match self {
            DeviceDriver::Jennic(device) => device,
            DeviceDriver::Pacemate(device) => device,
            DeviceDriver::Telosb(device) => device,
            DeviceDriver::Mock(device) => device,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.factory().device_type()
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        self.factory().connection()
    }

    pub fn chip_type_operation(&self) -> DriverResult<BoxedOperation<ChipType>> {
        self.factory().chip_type_operation()
    }

    pub fn erase_flash_operation(&self) -> DriverResult<BoxedOperation<()>> {
        self.factory().erase_flash_operation()
    }

    pub fn program_operation(&self, image: Vec<u8>) -> DriverResult<BoxedOperation<()>> {
        self.factory().program_operation(image)
    }

    pub fn read_flash_operation(
        &self,
        address: u32,
        length: u32,
    ) -> DriverResult<BoxedOperation<Vec<u8>>> {
        self.factory().read_flash_operation(address, length)
    }

    pub fn write_flash_operation(
        &self,
        address: u32,
        data: Vec<u8>,
    ) -> DriverResult<BoxedOperation<()>> {
        self.factory().write_flash_operation(address, data)
    }

    pub fn read_mac_operation(&self) -> DriverResult<BoxedOperation<MacAddress>> {
        self.factory().read_mac_operation()
    }

    pub fn write_mac_operation(&self, mac: MacAddress) -> DriverResult<BoxedOperation<()>> {
        self.factory().write_mac_operation(mac)
    }

    pub fn reset_operation(&self) -> DriverResult<BoxedOperation<()>> {
        self.factory().reset_operation()
    }

    pub fn send_operation(&self, data: Vec<u8>) -> DriverResult<BoxedOperation<()>> {
        self.factory().send_operation(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;

    #[test]
    fn test_device_type_from_str() {
        assert_eq!("TelosB".parse::<DeviceType>().unwrap(), DeviceType::Telosb);
        assert_eq!(" jennic ".parse::<DeviceType>().unwrap(), DeviceType::Jennic);
        assert_eq!("isense".parse::<DeviceType>().unwrap(), DeviceType::Jennic);
        assert!(matches!(
            "arduino".parse::<DeviceType>(),
            Err(DriverError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_image_tags_round_trip_for_jennic_chips() {
        for chip in [
            ChipType::Jn513x,
            ChipType::Jn513xR1,
            ChipType::Jn5121,
            ChipType::Jn5148,
        ] {
            let tag = chip.image_tag().unwrap();
            assert_eq!(ChipType::from_image_tag(tag), Some(chip));
        }
        assert_eq!(ChipType::Telosb.image_tag(), None);
        assert_eq!(ChipType::from_image_tag(0xDEAD_BEEF), None);
    }

    #[test]
    fn test_jn513x_revisions_share_images() {
        assert!(ChipType::Jn513xR1.accepts_image_for(ChipType::Jn513x));
        assert!(ChipType::Jn513x.accepts_image_for(ChipType::Jn513xR1));
        assert!(!ChipType::Jn5148.accepts_image_for(ChipType::Jn5121));
    }

    #[test]
    fn test_unsupported_operations_name_device() {
        let connection: Arc<dyn Connection> = Arc::new(MemoryConnection::silent());
        let driver = DeviceDriver::new(DeviceType::Telosb, connection, &DriverConfig::default());

        match driver.read_mac_operation() {
            Err(DriverError::Unsupported { operation, device }) => {
                assert_eq!(operation, "read_mac");
                assert_eq!(device, "TelosB");
            }
            other => panic!("expected Unsupported, got {:?}", other.map(|op| op.name())),
        }
    }

    #[test]
    fn test_every_family_can_send() {
        for device_type in [
            DeviceType::Jennic,
            DeviceType::Pacemate,
            DeviceType::Telosb,
            DeviceType::Mock,
        ] {
            let connection: Arc<dyn Connection> = Arc::new(MemoryConnection::silent());
            let driver = DeviceDriver::new(device_type, connection, &DriverConfig::default());
            assert_eq!(driver.device_type(), device_type);
            assert!(driver.send_operation(vec![1, 2, 3]).is_ok());
        }
    }
}
