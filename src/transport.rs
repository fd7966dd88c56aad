//! Transport abstraction over the BLE radio.
//!
//! The session manager talks to the radio exclusively through this trait, so
//! the production `btleplug` backend and the fake backend used in tests are
//! interchangeable. Events the radio pushes (advertisements, unexpected
//! disconnects) arrive on a stream; notification bytes for the connected
//! peripheral arrive on a second stream with transport-guaranteed FIFO order
//! per characteristic.

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

/// One advertisement sighting
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Opaque platform peripheral identifier
    pub peripheral_key: String,
    /// Advertised local name, if present
    pub local_name: Option<String>,
    /// Signal strength of this sighting
    pub rssi: Option<i16>,
    /// Raw vendor manufacturer-data payload
    pub manufacturer_data: Vec<u8>,
}

/// Events pushed by the radio
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// An advertisement was sighted during scanning
    Advertisement(Advertisement),
    /// A connected peripheral disconnected
    Disconnected {
        /// The peripheral that dropped
        peripheral_key: String,
    },
}

/// One characteristic discovered on a connected peripheral
#[derive(Debug, Clone)]
pub struct GattCharacteristic {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// UUID of the owning service
    pub service_uuid: Uuid,
    /// Supports read
    pub readable: bool,
    /// Supports write (with or without response)
    pub writable: bool,
    /// Supports notifications
    pub notifiable: bool,
}

/// One inbound notification delivery
#[derive(Debug, Clone)]
pub struct Notification {
    /// Source characteristic
    pub characteristic: Uuid,
    /// Raw delivered bytes
    pub value: Vec<u8>,
}

/// Async boundary to the BLE radio
///
/// All methods report failures through [`crate::ZoneError`]; no transport
/// error is ever thrown across this boundary as a panic.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the radio is powered on
    async fn is_powered(&self) -> Result<bool>;

    /// Start advertisement scanning
    async fn start_scan(&self) -> Result<()>;

    /// Stop advertisement scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Stream of radio-pushed events (advertisements, disconnects)
    async fn events(&self) -> Result<BoxStream<'static, TransportEvent>>;

    /// Connect to a peripheral
    async fn connect(&self, peripheral_key: &str) -> Result<()>;

    /// Cancel a pending connection attempt
    async fn cancel_connect(&self, peripheral_key: &str) -> Result<()>;

    /// Disconnect an established connection
    async fn disconnect(&self, peripheral_key: &str) -> Result<()>;

    /// Discover characteristics, optionally restricted to one service
    async fn discover_characteristics(
        &self,
        peripheral_key: &str,
        service: Option<Uuid>,
    ) -> Result<Vec<GattCharacteristic>>;

    /// Read a characteristic value
    async fn read(&self, peripheral_key: &str, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write bytes to a characteristic
    async fn write(
        &self,
        peripheral_key: &str,
        characteristic: Uuid,
        payload: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enable notifications on a characteristic
    async fn subscribe(&self, peripheral_key: &str, characteristic: Uuid) -> Result<()>;

    /// Stream of notification deliveries from a connected peripheral
    ///
    /// Ordering is FIFO per characteristic; the reassembler and the firmware
    /// machine rely on this.
    async fn notifications(&self, peripheral_key: &str) -> Result<BoxStream<'static, Notification>>;
}
