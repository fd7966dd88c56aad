use thiserror::Error;

/// Errors that can occur when working with Zone workout bands
#[derive(Error, Debug)]
pub enum ZoneError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// The Bluetooth radio is not powered on
    #[error("Bluetooth radio is powered off")]
    RadioOff,

    /// Device not found during scanning
    #[error("Zone device not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Connection attempt timed out
    ///
    /// Distinct from a peripheral-reported failure: the pending connect was
    /// cancelled by the session manager, not refused by the device.
    #[error("Connection timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// No write channel has been established on the active connection
    #[error("No write channel available - command not sent")]
    NoWriteChannel,

    /// A transport write failed mid-operation
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Firmware image smaller than the header + tail regions it must contain
    #[error("Firmware image too small: {len} bytes, need at least {min}")]
    FirmwareTooSmall {
        /// Actual image length in bytes
        len: usize,
        /// Minimum acceptable length in bytes
        min: usize,
    },

    /// A hex-text firmware file could not be parsed
    #[error("Malformed firmware file: {0}")]
    MalformedFirmwareFile(String),

    /// No firmware transfer is in progress
    #[error("No firmware transfer in progress")]
    NoTransferInProgress,

    /// A recording finished with no captured samples
    #[error("No telemetry data was captured")]
    NoRecordedData,

    /// A recorded export line could not be parsed
    #[error("Failed to parse export line: {0}")]
    ParseError(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for Zone operations
pub type Result<T> = std::result::Result<T, ZoneError>;

impl ZoneError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Timeout { .. }
        )
    }

    /// Check if this error was caused by a connection timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is a fail-fast validation error raised before any
    /// transport call was made
    #[must_use]
    pub const fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::FirmwareTooSmall { .. } | Self::MalformedFirmwareFile(_)
        )
    }
}
