//! Device discovery filtering and registry.
//!
//! Advertisements are filtered by vendor name substring and by a serial
//! number derived from manufacturer data; anything else is dropped silently.
//! Matching sightings are buffered and flushed to the registry on a fixed
//! interval rather than per-advertisement, bounding observer churn. The
//! registry keys devices by stable identity so a device survives
//! disconnect/reconnect as the same logical entry.

use crate::{
    transport::Advertisement,
    types::{DeviceId, DiscoveredDevice},
    ZONE_NAME_SUBSTRING, ZONE_SERIAL_PREFIX,
};
use std::collections::HashMap;
use tracing::debug;

/// Number of trailing manufacturer-data bytes encoding the serial number
const SERIAL_BYTE_LEN: usize = 6;

/// Extract the vendor serial number from advertisement manufacturer data
///
/// The serial is the decimal rendering of the big-endian integer held in the
/// final six manufacturer-data bytes.
#[must_use]
pub fn extract_serial(manufacturer_data: &[u8]) -> Option<String> {
    if manufacturer_data.len() < SERIAL_BYTE_LEN {
        return None;
    }

    let tail = &manufacturer_data[manufacturer_data.len() - SERIAL_BYTE_LEN..];
    let mut value: u64 = 0;
    for byte in tail {
        value = (value << 8) | u64::from(*byte);
    }
    Some(value.to_string())
}

/// Whether an advertisement passes the vendor discovery filter
///
/// Requires a name containing the vendor substring (case-insensitive) and a
/// manufacturer-data serial starting with the vendor prefix. Non-matching
/// advertisements are dropped silently.
#[must_use]
pub fn matches_filter(advertisement: &Advertisement) -> bool {
    let name_ok = advertisement
        .local_name
        .as_ref()
        .is_some_and(|name| name.to_lowercase().contains(ZONE_NAME_SUBSTRING));
    if !name_ok {
        return false;
    }

    extract_serial(&advertisement.manufacturer_data)
        .is_some_and(|serial| serial.starts_with(ZONE_SERIAL_PREFIX))
}

/// Buffer of matching sightings awaiting the next throttled flush
///
/// Only the latest sighting per peripheral is kept between flushes.
#[derive(Debug, Default)]
pub struct SightingBuffer {
    pending: HashMap<String, Advertisement>,
}

impl SightingBuffer {
    /// Create an empty buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting, replacing any earlier one for the same peripheral
    pub fn record(&mut self, advertisement: Advertisement) {
        self.pending
            .insert(advertisement.peripheral_key.clone(), advertisement);
    }

    /// Whether any sightings are waiting to be flushed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take all buffered sightings
    pub fn drain(&mut self) -> Vec<Advertisement> {
        self.pending.drain().map(|(_, adv)| adv).collect()
    }
}

/// Discovered-device list keyed by stable identity
///
/// Entries are created on first sighting and updated in place afterwards;
/// they are never deleted except by [`DeviceRegistry::clear`]. A merge
/// preserves a previously-learned serial number while refreshing the signal
/// strength.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DiscoveredDevice>,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one advertisement sighting into the registry
    pub fn observe(&mut self, advertisement: &Advertisement) {
        let serial = extract_serial(&advertisement.manufacturer_data);
        let identity = serial.clone().map_or_else(
            || DeviceId::Peripheral(advertisement.peripheral_key.clone()),
            DeviceId::Serial,
        );

        let entry = self.devices.entry(identity).or_insert_with(|| {
            debug!(key = %advertisement.peripheral_key, "new device discovered");
            DiscoveredDevice::new(
                advertisement.peripheral_key.clone(),
                advertisement.local_name.clone(),
                advertisement.rssi,
            )
        });

        // Update in place: refresh the volatile fields, keep learned ones.
        entry.peripheral_key = advertisement.peripheral_key.clone();
        entry.rssi = advertisement.rssi;
        if advertisement.local_name.is_some() {
            entry.name = advertisement.local_name.clone();
        }
        if entry.serial.is_none() {
            entry.serial = serial;
        }
    }

    /// Record the canonical serial read from the device information service
    ///
    /// Re-keys the entry from its peripheral fallback identity to the serial
    /// identity if needed.
    pub fn record_serial(&mut self, peripheral_key: &str, serial: &str) {
        let fallback = DeviceId::Peripheral(peripheral_key.to_string());
        if let Some(mut device) = self.devices.remove(&fallback) {
            device.serial = Some(serial.to_string());
            self.devices.insert(device.identity(), device);
            return;
        }

        if let Some(device) = self
            .devices
            .values_mut()
            .find(|d| d.peripheral_key == peripheral_key)
        {
            device.serial = Some(serial.to_string());
        }
    }

    /// Record a firmware revision read from the device information service
    pub fn record_firmware_revision(&mut self, peripheral_key: &str, revision: &str) {
        if let Some(device) = self
            .devices
            .values_mut()
            .find(|d| d.peripheral_key == peripheral_key)
        {
            device.firmware_revision = Some(revision.to_string());
        }
    }

    /// Look up a device by peripheral key
    #[must_use]
    pub fn by_peripheral(&self, peripheral_key: &str) -> Option<&DiscoveredDevice> {
        self.devices
            .values()
            .find(|d| d.peripheral_key == peripheral_key)
    }

    /// Snapshot of all known devices, strongest signal first
    #[must_use]
    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<DiscoveredDevice> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.rssi.unwrap_or(i16::MIN).cmp(&a.rssi.unwrap_or(i16::MIN)));
        devices
    }

    /// Number of known devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Forget every device
    pub fn clear(&mut self) {
        self.devices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manufacturer_data_for(serial: u64) -> Vec<u8> {
        let mut data = vec![0x5A, 0x01];
        data.extend_from_slice(&serial.to_be_bytes()[2..]);
        data
    }

    fn advertisement(name: &str, serial: u64, rssi: i16) -> Advertisement {
        Advertisement {
            peripheral_key: format!("peer-{serial}"),
            local_name: Some(name.to_string()),
            rssi: Some(rssi),
            manufacturer_data: manufacturer_data_for(serial),
        }
    }

    #[test]
    fn test_extract_serial() {
        assert_eq!(
            extract_serial(&manufacturer_data_for(1_260_042)),
            Some("1260042".to_string())
        );
        assert_eq!(extract_serial(&[0x01, 0x02]), None);
    }

    #[test]
    fn test_filter_accepts_vendor_device() {
        assert!(matches_filter(&advertisement("ZoneBand", 1_260_042, -40)));
    }

    #[test]
    fn test_filter_rejects_wrong_name() {
        assert!(!matches_filter(&advertisement(
            "OtherDevice",
            1_260_042,
            -40
        )));
    }

    #[test]
    fn test_filter_rejects_wrong_serial_prefix() {
        assert!(!matches_filter(&advertisement("ZoneBand", 9_980_001, -40)));
    }

    #[test]
    fn test_filter_rejects_missing_name() {
        let mut adv = advertisement("ZoneBand", 1_260_042, -40);
        adv.local_name = None;
        assert!(!matches_filter(&adv));
    }

    #[test]
    fn test_registry_updates_in_place() {
        let mut registry = DeviceRegistry::new();

        registry.observe(&advertisement("ZoneBand", 1_260_042, -60));
        registry.observe(&advertisement("ZoneBand", 1_260_042, -42));

        assert_eq!(registry.len(), 1);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].rssi, Some(-42));
        assert_eq!(snapshot[0].serial, Some("1260042".to_string()));
    }

    #[test]
    fn test_registry_sorts_by_signal() {
        let mut registry = DeviceRegistry::new();
        registry.observe(&advertisement("ZoneBand A", 1_260_001, -80));
        registry.observe(&advertisement("ZoneBand B", 1_260_002, -30));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].serial, Some("1260002".to_string()));
    }

    #[test]
    fn test_record_serial_rekeys_entry() {
        let mut registry = DeviceRegistry::new();
        let adv = Advertisement {
            peripheral_key: "peer-x".to_string(),
            local_name: Some("ZoneBand".to_string()),
            rssi: Some(-50),
            manufacturer_data: Vec::new(),
        };
        registry.observe(&adv);
        assert!(registry.snapshot()[0].serial.is_none());

        registry.record_serial("peer-x", "1260099");
        assert_eq!(registry.len(), 1);
        let device = registry.by_peripheral("peer-x").unwrap();
        assert_eq!(device.identity(), DeviceId::Serial("1260099".to_string()));
    }

    #[test]
    fn test_sighting_buffer_keeps_latest() {
        let mut buffer = SightingBuffer::new();
        let mut first = advertisement("ZoneBand", 1_260_042, -70);
        first.peripheral_key = "peer".to_string();
        let mut second = advertisement("ZoneBand", 1_260_042, -41);
        second.peripheral_key = "peer".to_string();

        buffer.record(first);
        buffer.record(second);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].rssi, Some(-41));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut registry = DeviceRegistry::new();
        registry.observe(&advertisement("ZoneBand", 1_260_042, -40));
        registry.clear();
        assert!(registry.is_empty());
    }
}
