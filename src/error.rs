//! Error types for the ble-gatt-client crate.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No matching device was found before the scan deadline.
    #[error("No matching device found within {elapsed:?}")]
    ScanTimeout {
        /// How long the scan ran before giving up.
        elapsed: Duration,
    },

    /// The scan was cancelled by the caller.
    #[error("Scan cancelled")]
    ScanCancelled,

    /// Failed to establish a connection, or it dropped before service
    /// enumeration completed.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// The connected device does not expose the expected service.
    #[error("Service not found: {uuid}")]
    ServiceNotFound {
        /// The UUID of the service that was not found.
        uuid: Uuid,
    },

    /// Characteristic not found on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: Uuid,
    },

    /// The session was closed; no further operations are possible.
    #[error("Session closed")]
    SessionClosed,

    /// The requested operation is not supported.
    #[error("Operation not supported: {operation}")]
    NotSupported {
        /// Description of the unsupported operation.
        operation: String,
    },

    /// The peripheral rejected or failed an operation.
    #[error("Peripheral reported error: {message}")]
    PeripheralError {
        /// The error message.
        message: String,
    },

    /// The configuration could not be loaded or is inconsistent.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },
}

impl Error {
    /// Check whether this error ends a run (as opposed to being recorded
    /// against a single characteristic).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ScanTimeout { .. }
                | Self::ScanCancelled
                | Self::ConnectionFailed { .. }
                | Self::ServiceNotFound { .. }
                | Self::BluetoothUnavailable
                | Self::InvalidConfig { .. }
        )
    }
}

/// Failure scoped to a single characteristic during the protocol pass.
///
/// These are recorded in the driver report and never abort the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CharacteristicError {
    /// Reading the value failed.
    #[error("read failed: {0}")]
    Read(String),

    /// Writing the value failed or was rejected.
    #[error("write failed: {0}")]
    Write(String),

    /// Subscribing to or unsubscribing from notifications failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// The value is not valid UTF-8 text.
    #[error("value is not valid UTF-8: {bytes:02X?}")]
    Decode {
        /// The raw bytes that failed to decode.
        bytes: Vec<u8>,
    },

    /// The value read back after a write differs from what was written.
    #[error("expected {expected:?} after write, read back {actual:?}")]
    VerifyMismatch {
        /// The value that was written.
        expected: String,
        /// The value that was read back.
        actual: String,
    },
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ScanCancelled.is_fatal());
        assert!(Error::ConnectionFailed {
            reason: "link lost".to_string()
        }
        .is_fatal());
        assert!(!Error::SessionClosed.is_fatal());
        assert!(!Error::CharacteristicNotFound { uuid: Uuid::nil() }.is_fatal());
    }

    #[test]
    fn test_characteristic_error_display() {
        let err = CharacteristicError::VerifyMismatch {
            expected: "1".to_string(),
            actual: "0".to_string(),
        };
        assert_eq!(err.to_string(), "expected \"1\" after write, read back \"0\"");
    }
}
