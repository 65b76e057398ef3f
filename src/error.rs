//! Error types shared by the protocol engines, operations and the queue.

use thiserror::Error;

use crate::device::ChipType;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur while talking to a device or running an operation.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error for configuration files.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid regular expression given to the data logger.
    #[error("Invalid filter expression: {0}")]
    Regex(#[from] regex::Error),

    /// Port could not be opened because another process holds it.
    #[error("Port {port} is busy")]
    PortBusy { port: String },

    /// Insufficient permissions to open the port.
    #[error("Permission denied opening port {port}")]
    PortPermissionDenied { port: String },

    /// The port does not exist.
    #[error("No device found at {port}")]
    PortNotFound { port: String },

    /// A caller supplied argument failed validation.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The device family has no implementation for the requested command.
    #[error("The operation {operation} is not available for {device} devices")]
    Unsupported {
        operation: &'static str,
        device: &'static str,
    },

    /// No reply arrived within the read bound.
    #[error("Timeout: {context}")]
    Timeout { context: String },

    /// Received frame failed checksum validation.
    #[error("Invalid checksum: expected 0x{expected:04X}, got 0x{actual:04X}")]
    InvalidChecksum { expected: u16, actual: u16 },

    /// Reply was well formed but its contents cannot be used.
    #[error("Received incorrect data: {reason}")]
    IncorrectData { reason: String },

    /// Reply type was not in the expected set.
    #[error("{context}: expected 0x{expected:02X}, received 0x{received:02X}")]
    UnexpectedResponse {
        expected: u8,
        received: u8,
        context: String,
    },

    /// The bootloader answered the sync byte with something other than an ACK.
    #[error("Bootloader not synchronized (answer was 0x{received:02X})")]
    NotSynchronized { received: u8 },

    /// Flash write was not acknowledged.
    #[error("Failed to program flash at 0x{address:04X}: {reason}")]
    ProgramFailed { address: u32, reason: String },

    /// Flash erase was not acknowledged.
    #[error("Failed to erase flash: {reason}")]
    EraseFailed { reason: String },

    /// The image was built for another chip than the one attached.
    #[error("Chip type ({detected}) and image type ({image}) do not match")]
    ChipMismatch { detected: ChipType, image: ChipType },

    /// Image could not be parsed.
    #[error("Invalid image: {reason}")]
    InvalidImage { reason: String },

    /// Operation was canceled by the caller.
    #[error("Operation canceled")]
    Canceled,

    /// Operation exceeded its queue timeout.
    #[error("Operation timed out after {timeout_ms}ms")]
    OperationTimedOut { timeout_ms: u64 },

    /// A call was made in a state that does not allow it.
    #[error("Illegal state: {reason}")]
    IllegalState { reason: String },

    /// The connection is closed or was never opened.
    #[error("Connection is not connected")]
    NotConnected,

    /// The queue no longer accepts work.
    #[error("Operation queue is shut down")]
    QueueClosed,

    /// The thread running an operation body ended without a result.
    #[error("Operation thread for {operation} terminated unexpectedly")]
    ThreadTerminated { operation: &'static str },
}

impl DriverError {
    /// Check if this error is retriable (transient wire errors that may succeed on retry).
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout { .. }
                | DriverError::InvalidChecksum { .. }
                | DriverError::NotSynchronized { .. }
        )
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DriverError::Serial(_) => "WSN-001",
            DriverError::Io(_) => "WSN-002",
            DriverError::Json(_) => "WSN-003",
            DriverError::Regex(_) => "WSN-004",
            DriverError::PortBusy { .. } => "WSN-005",
            DriverError::PortPermissionDenied { .. } => "WSN-006",
            DriverError::PortNotFound { .. } => "WSN-007",
            DriverError::InvalidArgument { .. } => "WSN-010",
            DriverError::Unsupported { .. } => "WSN-011",
            DriverError::Timeout { .. } => "WSN-020",
            DriverError::InvalidChecksum { .. } => "WSN-021",
            DriverError::IncorrectData { .. } => "WSN-022",
            DriverError::UnexpectedResponse { .. } => "WSN-023",
            DriverError::NotSynchronized { .. } => "WSN-024",
            DriverError::ProgramFailed { .. } => "WSN-030",
            DriverError::EraseFailed { .. } => "WSN-031",
            DriverError::ChipMismatch { .. } => "WSN-040",
            DriverError::InvalidImage { .. } => "WSN-041",
            DriverError::Canceled => "WSN-050",
            DriverError::OperationTimedOut { .. } => "WSN-051",
            DriverError::IllegalState { .. } => "WSN-052",
            DriverError::ThreadTerminated { .. } => "WSN-053",
            DriverError::NotConnected => "WSN-060",
            DriverError::QueueClosed => "WSN-061",
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        DriverError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn timeout(context: impl Into<String>) -> Self {
        DriverError::Timeout {
            context: context.into(),
        }
    }

    pub(crate) fn incorrect_data(reason: impl Into<String>) -> Self {
        DriverError::IncorrectData {
            reason: reason.into(),
        }
    }

    pub(crate) fn illegal_state(reason: impl Into<String>) -> Self {
        DriverError::IllegalState {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retriable() {
        assert!(DriverError::timeout("sync").is_retriable());
        assert!(DriverError::InvalidChecksum {
            expected: 0x1234,
            actual: 0x5678
        }
        .is_retriable());
        assert!(DriverError::NotSynchronized { received: 0xA0 }.is_retriable());
        assert!(!DriverError::Canceled.is_retriable());
        assert!(!DriverError::ProgramFailed {
            address: 0x4000,
            reason: "NACK".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DriverError::timeout("x").error_code(), "WSN-020");
        assert_eq!(DriverError::Canceled.error_code(), "WSN-050");
        assert_eq!(DriverError::QueueClosed.error_code(), "WSN-061");
    }

    #[test]
    fn test_chip_mismatch_message_names_both_types() {
        let err = DriverError::ChipMismatch {
            detected: ChipType::Jn5148,
            image: ChipType::Jn5121,
        };
        let message = err.to_string();
        assert!(message.contains("JN5148"));
        assert!(message.contains("JN5121"));
    }
}
