use crate::error::ZoneError;
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf};

/// Stable identity of a Zone device
///
/// Peripheral handles are not stable across OS-level re-discovery, so the
/// vendor serial number is preferred whenever it has been learned; the
/// platform connection handle is the fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceId {
    /// Vendor serial number extracted from advertisement data or read from
    /// the device information service
    Serial(String),
    /// Opaque platform peripheral identifier
    Peripheral(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(serial) => write!(f, "serial:{serial}"),
            Self::Peripheral(key) => write!(f, "peripheral:{key}"),
        }
    }
}

/// A Zone device sighted during scanning
///
/// Created on the first matching advertisement and updated in place on every
/// subsequent sighting; survives disconnect/reconnect as the same logical
/// entity keyed by serial number when available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Opaque platform peripheral identifier used for transport calls
    pub peripheral_key: String,
    /// Advertised device name
    pub name: Option<String>,
    /// Signal strength (RSSI) from the most recent sighting
    pub rssi: Option<i16>,
    /// Vendor serial number, once learned
    pub serial: Option<String>,
    /// Firmware revision string, once read
    pub firmware_revision: Option<String>,
}

impl DiscoveredDevice {
    /// Create a new discovered device from a first sighting
    #[must_use]
    pub const fn new(peripheral_key: String, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            peripheral_key,
            name,
            rssi,
            serial: None,
            firmware_revision: None,
        }
    }

    /// Stable identity for this device (serial preferred)
    #[must_use]
    pub fn identity(&self) -> DeviceId {
        self.serial.as_ref().map_or_else(
            || DeviceId::Peripheral(self.peripheral_key.clone()),
            |serial| DeviceId::Serial(serial.clone()),
        )
    }

    /// Resolve the user-visible label for this device
    ///
    /// Looks up a user-chosen override keyed by serial number (falling back to
    /// the peripheral identity), then the advertised name, then the serial.
    #[must_use]
    pub fn display_name(&self, overrides: &dyn NameOverrides) -> String {
        let key = self
            .serial
            .clone()
            .unwrap_or_else(|| self.peripheral_key.clone());
        if let Some(label) = overrides.label_for(&key) {
            return label;
        }
        if let Some(name) = &self.name {
            return name.clone();
        }
        self.serial.clone().unwrap_or(key)
    }
}

/// Read-only lookup of user-chosen device labels
///
/// Writing the override table is a UI concern; the session engine only ever
/// reads from it.
pub trait NameOverrides {
    /// Look up the label for a device key (serial number, or peripheral
    /// identifier when no serial is known)
    fn label_for(&self, key: &str) -> Option<String>;
}

impl NameOverrides for std::collections::HashMap<String, String> {
    fn label_for(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// One reassembled telemetry sample
///
/// The timestamp is the wall-clock capture time at extraction, not a value
/// embedded in the payload. The payload is the full marker-prefixed frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Unix epoch seconds at extraction time
    pub timestamp: u64,
    /// Fixed-length frame bytes, beginning with the telemetry marker
    pub payload: Vec<u8>,
}

/// Battery state reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryReading {
    /// Battery level value
    pub level: u16,
    /// Battery voltage in millivolts; only present on later firmware
    /// generations
    pub voltage_mv: Option<u16>,
}

/// Firmware transfer progress
///
/// `bytes_sent` is monotonically non-decreasing and clamps to the tail
/// boundary during the chunk stage, so the header's overlap with the body
/// region is never double-counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// Bytes of the source image sent so far
    pub bytes_sent: usize,
    /// Total source image length
    pub total_bytes: usize,
}

impl TransferProgress {
    /// Completion ratio in percent
    #[must_use]
    pub fn percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            (self.bytes_sent as f32 / self.total_bytes as f32) * 100.0
        }
    }
}

/// Session manager configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connection attempt timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Delay from connection-established to the one-time post-connect
    /// initialization command, in milliseconds
    ///
    /// This is a firmware timing requirement of the band, not a UI nicety.
    pub init_delay_ms: u64,
    /// Delay from the initialization command to the follow-up battery query,
    /// in milliseconds
    pub battery_query_delay_ms: u64,
    /// Interval at which buffered advertisement sightings are flushed to the
    /// discovered-device list, in milliseconds
    pub scan_flush_interval_ms: u64,
    /// Delay between discovering the device information service and the
    /// general service sweep, in milliseconds
    pub service_sweep_delay_ms: u64,
    /// Total telemetry sample length including the 2-byte marker
    ///
    /// Firmware-generation dependent; see [`crate::stream::SAMPLE_LEN_GEN1`]
    /// and [`crate::stream::SAMPLE_LEN_GEN2`]. There is no negotiation
    /// mechanism, so this must be configured per device generation.
    pub sample_len: usize,
    /// Number of reconnect attempts after an unexpected disconnect
    pub reconnect_attempts: u32,
    /// Delay between reconnect attempts in milliseconds
    pub reconnect_delay_ms: u64,
    /// Directory where workout recordings are written
    pub recording_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            init_delay_ms: 1_000,
            battery_query_delay_ms: 200,
            scan_flush_interval_ms: 500,
            service_sweep_delay_ms: 300,
            sample_len: crate::stream::SAMPLE_LEN_GEN1,
            reconnect_attempts: 3,
            reconnect_delay_ms: 2_000,
            recording_dir: PathBuf::from("recordings"),
        }
    }
}

/// Events emitted by the session manager to its observer
///
/// All transport-boundary outcomes are reported through this channel rather
/// than thrown across the transport boundary.
#[derive(Debug)]
pub enum SessionEvent {
    /// The discovered-device list changed (throttled flush)
    DevicesUpdated(Vec<DiscoveredDevice>),
    /// A connection was established and the session is ready
    Connected(DiscoveredDevice),
    /// A connection attempt failed; `error.is_timeout()` distinguishes a
    /// timeout from a peripheral-reported failure
    ConnectionFailed {
        /// The device the attempt targeted
        device: DiscoveredDevice,
        /// The failure cause
        error: ZoneError,
    },
    /// The connection ended
    Disconnected {
        /// Whether the disconnect was caller-initiated
        requested: bool,
    },
    /// The device serial number was read
    SerialNumber(String),
    /// The device firmware revision was read
    FirmwareRevision(String),
    /// A battery reply was received
    Battery(BatteryReading),
    /// The device acknowledged a workout start; recording has begun
    WorkoutStarted,
    /// One telemetry sample was reassembled
    Sample(Sample),
    /// Firmware transfer progress advanced
    TransferProgress(TransferProgress),
    /// Firmware transfer completed
    TransferCompleted,
    /// Firmware transfer failed and its context was cleared
    TransferFailed(ZoneError),
    /// A finished recording was finalized for export
    RecordingSaved(PathBuf),
    /// A recording ended with no captured samples and was discarded
    RecordingEmpty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_identity_prefers_serial() {
        let mut device = DiscoveredDevice::new("AA:BB:CC".to_string(), None, Some(-40));
        assert_eq!(
            device.identity(),
            DeviceId::Peripheral("AA:BB:CC".to_string())
        );

        device.serial = Some("1260042".to_string());
        assert_eq!(device.identity(), DeviceId::Serial("1260042".to_string()));
    }

    #[test]
    fn test_display_name_resolution() {
        let mut overrides = HashMap::new();
        overrides.insert("1260042".to_string(), "Gym Band".to_string());

        let mut device = DiscoveredDevice::new(
            "AA:BB:CC".to_string(),
            Some("ZoneBand".to_string()),
            Some(-40),
        );
        assert_eq!(device.display_name(&overrides), "ZoneBand");

        device.serial = Some("1260042".to_string());
        assert_eq!(device.display_name(&overrides), "Gym Band");
    }

    #[test]
    fn test_transfer_progress_percent() {
        let progress = TransferProgress {
            bytes_sent: 64,
            total_bytes: 128,
        };
        assert!((progress.percent() - 50.0).abs() < f32::EPSILON);

        let empty = TransferProgress {
            bytes_sent: 0,
            total_bytes: 0,
        };
        assert!(empty.percent().abs() < f32::EPSILON);
    }

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();

        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.init_delay_ms, 1_000);
        assert_eq!(config.battery_query_delay_ms, 200);
        assert_eq!(config.scan_flush_interval_ms, 500);
        assert_eq!(config.sample_len, crate::stream::SAMPLE_LEN_GEN1);
        assert_eq!(config.reconnect_attempts, 3);
    }
}
