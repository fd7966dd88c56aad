#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Zoneband
//!
//! A Rust library for controlling Zone workout bands via Bluetooth Low Energy.
//!
//! Zone devices speak an asynchronous, acknowledgement-driven binary protocol
//! over a single writable characteristic, and stream fixed-length telemetry
//! samples back over notify characteristics while a workout is running. This
//! crate implements the full session engine for that protocol:
//!
//! - **Discovery**: scanning with vendor name and serial-number filtering,
//!   throttled device-list updates, and stable device identity across
//!   reconnects.
//! - **Connection lifecycle**: connect with timeout, staged service discovery,
//!   write-channel election, and the firmware-mandated post-connect
//!   initialization sequence.
//! - **Command encoding**: the fixed binary command frames for workout
//!   start/stop, device time, battery queries, and firmware updates.
//! - **Telemetry reassembly**: recovering marker-prefixed fixed-length samples
//!   from arbitrarily chunked inbound deliveries, with resynchronization.
//! - **Firmware updates**: the three-stage (header, chunked body, tail)
//!   acknowledgement-driven transfer state machine with progress reporting.
//! - **Workout recording**: crash-safe incremental capture of the sample
//!   stream to a plain-text export format.
//!
//! ## Quick Start
//!
//! ```no_run
//! use zoneband::{BtleTransport, SessionConfig, SessionEvent, ZoneSession};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BtleTransport::new().await?);
//!     let (session, mut events) = ZoneSession::new(transport, SessionConfig::default());
//!
//!     session.start_scan().await?;
//!     while let Some(event) = events.recv().await {
//!         if let SessionEvent::DevicesUpdated(devices) = event {
//!             if let Some(device) = devices.first() {
//!                 session.connect(device.clone()).await?;
//!                 break;
//!             }
//!         }
//!     }
//!
//!     session.start_workout().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport backed by `btleplug`
pub mod ble;
/// Connection/session manager
pub mod device;
/// Error types and handling
pub mod error;
/// Firmware transfer state machine
pub mod firmware;
/// Binary command encoding and inbound frame classification
pub mod protocol;
/// Workout session recording and export
pub mod recorder;
/// Device discovery filtering and registry
pub mod scan;
/// Telemetry stream reassembly
pub mod stream;
/// Transport abstraction over the BLE radio
pub mod transport;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::BtleTransport;
pub use device::ZoneSession;
pub use error::{Result, ZoneError};
pub use firmware::{FirmwareTransfer, TransferStage};
pub use recorder::SessionRecorder;
pub use scan::DeviceRegistry;
pub use stream::SampleAssembler;
pub use transport::Transport;
pub use types::{
    BatteryReading, DeviceId, DiscoveredDevice, NameOverrides, Sample, SessionConfig, SessionEvent,
    TransferProgress,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Standard Device Information service UUID
///
/// Zone bands expose their vendor serial number and firmware revision through
/// this service. It is discovered first, before the general service sweep,
/// because the band exposes it faster than its vendor service and callers
/// want serial/firmware data as early as possible.
pub const DEVICE_INFORMATION_SERVICE_UUID: &str = "0000180A-0000-1000-8000-00805F9B34FB";

/// Standard Serial Number String characteristic UUID
///
/// Read immediately on discovery; the decoded string becomes the device's
/// stable identity (peripheral handles are not stable across re-discovery).
pub const SERIAL_NUMBER_CHAR_UUID: &str = "00002A25-0000-1000-8000-00805F9B34FB";

/// Standard Firmware Revision String characteristic UUID
pub const FIRMWARE_REVISION_CHAR_UUID: &str = "00002A26-0000-1000-8000-00805F9B34FB";

/// Preferred outbound write characteristic UUID
///
/// All commands are written to a single channel. When this characteristic is
/// present it is always elected; otherwise the first writable characteristic
/// encountered during discovery wins and is never displaced.
pub const ZONE_WRITE_CHAR_UUID: &str = "0000FFF2-0000-1000-8000-00805F9B34FB";

/// Vendor substring a device name must contain (case-insensitive) to pass the
/// discovery filter
pub const ZONE_NAME_SUBSTRING: &str = "zone";

/// Decimal prefix a manufacturer-data-derived serial number must start with
/// to pass the discovery filter
pub const ZONE_SERIAL_PREFIX: &str = "126";
