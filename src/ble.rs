//! Bluetooth Low Energy transport backed by `btleplug`.
//!
//! Implements [`Transport`] over the platform adapter. The session manager
//! never touches `btleplug` types directly; peripherals are addressed by the
//! string form of their platform identifier, and a cache maps those keys back
//! to live peripheral handles.

use btleplug::{
    api::{
        Central, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::{BoxStream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{Result, ZoneError},
    transport::{Advertisement, GattCharacteristic, Notification, Transport, TransportEvent},
};
use async_trait::async_trait;

/// BLE transport over the first available platform adapter
pub struct BtleTransport {
    central: Adapter,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BtleTransport {
    /// Create a transport over the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::Ble`] if the Bluetooth stack cannot be
    /// initialized, or [`ZoneError::RadioOff`] if no adapter is present.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ZoneError::RadioOff)?;

        Ok(Self {
            central,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Resolve a peripheral key to a live handle
    async fn peripheral(&self, key: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.lock().await.get(key) {
            return Ok(peripheral.clone());
        }

        for peripheral in self.central.peripherals().await? {
            let id = peripheral.id().to_string();
            if id == key {
                self.peripherals
                    .lock()
                    .await
                    .insert(id, peripheral.clone());
                return Ok(peripheral);
            }
        }

        Err(ZoneError::DeviceNotFound)
    }

    async fn characteristic(&self, key: &str, uuid: Uuid) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(key).await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| ZoneError::Protocol(format!("Characteristic {uuid} not found")))?;
        Ok((peripheral, characteristic))
    }
}

async fn advertisement_for(
    central: &Adapter,
    cache: &Mutex<HashMap<String, Peripheral>>,
    id: &PeripheralId,
) -> Option<Advertisement> {
    let peripheral = central.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    cache.lock().await.insert(id.to_string(), peripheral);

    // The band advertises a single vendor entry; picking the lowest company
    // id keeps the result deterministic if the platform merges adverts.
    let manufacturer_data = properties
        .manufacturer_data
        .iter()
        .min_by_key(|(company, _)| **company)
        .map(|(_, data)| data.clone())
        .unwrap_or_default();

    Some(Advertisement {
        peripheral_key: id.to_string(),
        local_name: properties.local_name,
        rssi: properties.rssi,
        manufacturer_data,
    })
}

fn map_characteristic(characteristic: &Characteristic) -> GattCharacteristic {
    let props = characteristic.properties;
    GattCharacteristic {
        uuid: characteristic.uuid,
        service_uuid: characteristic.service_uuid,
        readable: props.contains(CharPropFlags::READ),
        writable: props.contains(CharPropFlags::WRITE)
            || props.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notifiable: props.contains(CharPropFlags::NOTIFY)
            || props.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn is_powered(&self) -> Result<bool> {
        Ok(self.central.adapter_state().await? == CentralState::PoweredOn)
    }

    async fn start_scan(&self) -> Result<()> {
        // Vendor filtering happens at the session layer; the radio scans wide.
        self.central.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.central.stop_scan().await?;
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>> {
        let events = self.central.events().await?;
        let central = self.central.clone();
        let cache = Arc::clone(&self.peripherals);

        let stream = events.filter_map(move |event| {
            let central = central.clone();
            let cache = Arc::clone(&cache);
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                        advertisement_for(&central, &cache, &id)
                            .await
                            .map(TransportEvent::Advertisement)
                    }
                    CentralEvent::DeviceDisconnected(id) => Some(TransportEvent::Disconnected {
                        peripheral_key: id.to_string(),
                    }),
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn connect(&self, peripheral_key: &str) -> Result<()> {
        let peripheral = self.peripheral(peripheral_key).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| ZoneError::ConnectionFailed(e.to_string()))
    }

    async fn cancel_connect(&self, peripheral_key: &str) -> Result<()> {
        // btleplug has no dedicated cancel; dropping the link tears down a
        // still-pending attempt on every supported platform.
        self.peripheral(peripheral_key).await?.disconnect().await?;
        Ok(())
    }

    async fn disconnect(&self, peripheral_key: &str) -> Result<()> {
        self.peripheral(peripheral_key).await?.disconnect().await?;
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peripheral_key: &str,
        service: Option<Uuid>,
    ) -> Result<Vec<GattCharacteristic>> {
        let peripheral = self.peripheral(peripheral_key).await?;
        peripheral.discover_services().await?;

        let characteristics: Vec<GattCharacteristic> = peripheral
            .characteristics()
            .iter()
            .filter(|c| service.map_or(true, |s| c.service_uuid == s))
            .map(map_characteristic)
            .collect();

        debug!(
            count = characteristics.len(),
            ?service,
            "discovered characteristics"
        );
        Ok(characteristics)
    }

    async fn read(&self, peripheral_key: &str, characteristic: Uuid) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(peripheral_key, characteristic).await?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write(
        &self,
        peripheral_key: &str,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(peripheral_key, characteristic).await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        peripheral
            .write(&characteristic, payload, write_type)
            .await
            .map_err(|e| ZoneError::WriteFailed(e.to_string()))
    }

    async fn subscribe(&self, peripheral_key: &str, characteristic: Uuid) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(peripheral_key, characteristic).await?;
        peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn notifications(
        &self,
        peripheral_key: &str,
    ) -> Result<BoxStream<'static, Notification>> {
        let peripheral = self.peripheral(peripheral_key).await?;
        let stream = peripheral.notifications().await?.map(|n| Notification {
            characteristic: n.uuid,
            value: n.value,
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DEVICE_INFORMATION_SERVICE_UUID, FIRMWARE_REVISION_CHAR_UUID, SERIAL_NUMBER_CHAR_UUID,
        ZONE_WRITE_CHAR_UUID,
    };
    use std::collections::BTreeSet;

    #[test]
    fn test_uuid_constants_parse() {
        for uuid in [
            DEVICE_INFORMATION_SERVICE_UUID,
            SERIAL_NUMBER_CHAR_UUID,
            FIRMWARE_REVISION_CHAR_UUID,
            ZONE_WRITE_CHAR_UUID,
        ] {
            assert!(Uuid::parse_str(uuid).is_ok(), "bad UUID constant: {uuid}");
        }
    }

    #[test]
    fn test_characteristic_mapping() {
        let characteristic = Characteristic {
            uuid: Uuid::parse_str(ZONE_WRITE_CHAR_UUID).unwrap(),
            service_uuid: Uuid::parse_str(DEVICE_INFORMATION_SERVICE_UUID).unwrap(),
            properties: CharPropFlags::WRITE_WITHOUT_RESPONSE | CharPropFlags::NOTIFY,
            descriptors: BTreeSet::new(),
        };

        let mapped = map_characteristic(&characteristic);
        assert!(mapped.writable);
        assert!(mapped.notifiable);
        assert!(!mapped.readable);
    }
}
