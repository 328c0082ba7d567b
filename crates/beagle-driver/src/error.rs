//! Error types for Beagle driver operations.

use thiserror::Error;

use crate::usb::dfu::{DfuState, DfuStatusCode};

/// Result type alias for Beagle operations.
pub type Result<T> = std::result::Result<T, BeagleError>;

/// Errors that can occur during Beagle operations.
#[derive(Debug, Error)]
pub enum BeagleError {
    /// No Beagle devices detected on the bus.
    #[error("no Beagle devices detected")]
    NoDevicesFound,

    /// Device index out of range.
    #[error("device index {index} out of range (have {count} devices)")]
    InvalidIndex {
        /// Requested index.
        index: usize,
        /// Number of available devices.
        count: usize,
    },

    /// Operation attempted on a closed device handle.
    #[error("device is not open")]
    NotOpen,

    /// Transfer timed out.
    #[error("transfer timed out after {duration_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds.
        duration_ms: u64,
    },

    /// Device detached from the bus mid-operation.
    #[error("device disconnected")]
    Disconnected,

    /// Endpoint returned a STALL handshake.
    #[error("endpoint stalled")]
    Stall,

    /// Transfer was cancelled before completion.
    #[error("transfer cancelled")]
    Cancelled,

    /// Data transfer failed for a reason with no dedicated variant.
    #[error("transfer failed: {reason}")]
    TransferFailed {
        /// Reason for failure.
        reason: String,
    },

    /// Bulk-out transfer sent fewer bytes than requested.
    ///
    /// Short writes are data loss; short reads are not an error and report
    /// the actual count instead.
    #[error("short write on endpoint {endpoint:#04x}: sent {actual} of {expected} bytes")]
    ShortWrite {
        /// Endpoint address.
        endpoint: u8,
        /// Bytes requested.
        expected: usize,
        /// Bytes actually sent.
        actual: usize,
    },

    /// Descriptor bytes from the device could not be parsed.
    ///
    /// Distinct from transfer failure: the wire operation succeeded but the
    /// payload is corrupt or truncated.
    #[error("malformed descriptor: {reason}")]
    MalformedDescriptor {
        /// What failed to parse.
        reason: String,
    },

    /// The DFU device-side state machine rejected an operation.
    #[error("DFU device reported {status:?} in state {state:?}")]
    DfuProtocol {
        /// Device-reported status code.
        status: DfuStatusCode,
        /// Device-reported state.
        state: DfuState,
    },

    /// Firmware read-back did not match the downloaded image.
    #[error("firmware verification mismatch at byte {offset}")]
    FirmwareMismatch {
        /// First differing byte offset.
        offset: usize,
    },

    /// Operation attempted in the wrong driver-side state.
    #[error("invalid state: {state}")]
    InvalidState {
        /// Current state description.
        state: String,
    },

    /// Chip variant does not implement the requested feature.
    #[error("{name} is not supported on this chip variant")]
    Unsupported {
        /// Feature or register group name.
        name: String,
    },

    /// Buffer or async-transfer-slot allocation failed.
    #[error("resource exhausted: {resource}")]
    ResourceExhausted {
        /// Resource that ran out.
        resource: String,
    },

    /// A required descriptor or interface was absent.
    #[error("{what} not found")]
    NotFound {
        /// What was being looked for.
        what: String,
    },

    /// USB stack error with no more specific mapping.
    #[error("USB error: {source}")]
    Usb {
        /// Underlying libusb error.
        #[from]
        source: rusb::Error,
    },
}

impl BeagleError {
    /// Create a transfer failed error.
    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Create a malformed descriptor error.
    pub fn malformed_descriptor(reason: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create an unsupported feature error.
    pub fn unsupported(name: impl Into<String>) -> Self {
        Self::Unsupported { name: name.into() }
    }

    /// Create a resource exhaustion error.
    pub fn resource_exhausted(resource: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
        }
    }

    /// Create a not found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Map a libusb error from a transfer bounded by `timeout` into the
    /// driver taxonomy.
    #[must_use]
    pub fn from_transfer(err: rusb::Error, timeout: std::time::Duration) -> Self {
        match err {
            rusb::Error::Timeout => Self::Timeout {
                duration_ms: timeout.as_millis() as u64,
            },
            rusb::Error::NoDevice => Self::Disconnected,
            rusb::Error::Pipe => Self::Stall,
            other => Self::Usb { source: other },
        }
    }
}

impl From<beagle_chip::ConfigError> for BeagleError {
    fn from(err: beagle_chip::ConfigError) -> Self {
        let beagle_chip::ConfigError::Unsupported { accessor, variant } = err;
        Self::Unsupported {
            name: format!("{accessor:?} on {variant:?}"),
        }
    }
}
