//! Error types for ET-SoC-1 host operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ET-SoC-1 operations
pub type Result<T> = std::result::Result<T, EtError>;

/// Errors that can occur while talking to a device
#[derive(Debug, Error)]
pub enum EtError {
    /// Device node not found at the expected path
    #[error("Device not found: {path}")]
    DeviceNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// No devices detected on the system
    #[error("No ET-SoC-1 devices detected")]
    NoDevicesFound,

    /// Device index out of range
    #[error("Device index {index} out of range (have {count} devices)")]
    InvalidIndex {
        /// Requested index
        index: usize,
        /// Number of available devices
        count: usize,
    },

    /// Caller supplied an argument the device would reject
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// A control transfer or readiness wait failed
    #[error("Transport fault: {reason}")]
    TransportFault {
        /// Reason for failure
        reason: String,
    },

    /// The readiness wait was interrupted by a signal
    #[error("Readiness wait interrupted")]
    Interrupted,

    /// Malformed frame or descriptor
    #[error("Protocol fault: {reason}")]
    Protocol {
        /// What could not be parsed
        reason: String,
    },

    /// Descriptor checksum does not match its contents
    #[error("Descriptor checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// Checksum published by firmware
        expected: u32,
        /// Checksum computed by the host
        computed: u32,
    },

    /// Firmware reported a boot failure
    #[error("Bring-up failed: {reason}")]
    BringUp {
        /// Reason for failure
        reason: String,
    },

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Admission lock not acquired before the deadline
    #[error("Device {device} busy")]
    Busy {
        /// Device index
        device: usize,
    },

    /// Device is in an invalid state
    #[error("Device in invalid state: {state}")]
    InvalidState {
        /// Current state description
        state: String,
    },

    /// Non-zero status in a well-formed response
    #[error("Device returned status {status} for command {msg_id}")]
    DeviceStatus {
        /// Command id
        msg_id: u16,
        /// Status field of the response
        status: u32,
    },
}

impl EtError {
    /// Create a device not found error
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a transport fault
    pub fn transport_fault(reason: impl Into<String>) -> Self {
        Self::TransportFault {
            reason: reason.into(),
        }
    }

    /// Create a protocol fault
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Create a bring-up failure
    pub fn bring_up(reason: impl Into<String>) -> Self {
        Self::BringUp {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a timeout error from a duration
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// Service request status code for this error.
    ///
    /// | Status | Errors |
    /// |--------|--------|
    /// | `-EINVAL` | bad index, bad argument, missing node |
    /// | `-EAGAIN` | busy, timeout |
    /// | `-EIO` | everything reaching the device or transport |
    pub const fn status(&self) -> i32 {
        match self {
            Self::InvalidIndex { .. }
            | Self::InvalidArgument { .. }
            | Self::DeviceNotFound { .. }
            | Self::NoDevicesFound => -libc::EINVAL,
            Self::Busy { .. } | Self::Timeout { .. } | Self::Interrupted => -libc::EAGAIN,
            Self::Io { .. }
            | Self::TransportFault { .. }
            | Self::Protocol { .. }
            | Self::ChecksumMismatch { .. }
            | Self::BringUp { .. }
            | Self::InvalidState { .. }
            | Self::DeviceStatus { .. } => -libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_taxonomy() {
        assert_eq!(EtError::invalid_argument("x").status(), -libc::EINVAL);
        assert_eq!(EtError::InvalidIndex { index: 4, count: 1 }.status(), -libc::EINVAL);
        assert_eq!(EtError::Busy { device: 0 }.status(), -libc::EAGAIN);
        assert_eq!(EtError::timeout(Duration::from_millis(5)).status(), -libc::EAGAIN);
        assert_eq!(EtError::DeviceStatus { msg_id: 1, status: 1 }.status(), -libc::EIO);
        assert_eq!(EtError::transport_fault("ioctl").status(), -libc::EIO);
    }

    #[test]
    fn display_includes_details() {
        let e = EtError::ChecksumMismatch {
            expected: 0x1234,
            computed: 0xABCD,
        };
        assert_eq!(
            e.to_string(),
            "Descriptor checksum mismatch: expected 0x00001234, computed 0x0000abcd"
        );
    }
}
