use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};
use zoneband::{BtleTransport, Result, SessionConfig, SessionEvent, ZoneError, ZoneSession};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let Some(firmware_path) = std::env::args().nth(1) else {
        error!("Usage: firmware_update <firmware.hex>");
        return Err(ZoneError::Other("missing firmware file argument".to_string()));
    };

    info!("⚙️  Zoneband Firmware Update Example");
    info!("Searching for Zone devices...");

    let transport = Arc::new(BtleTransport::new().await?);
    let (session, mut events) = ZoneSession::new(transport, SessionConfig::default());

    session.start_scan().await?;

    let device = loop {
        match events.recv().await {
            Some(SessionEvent::DevicesUpdated(devices)) => {
                if let Some(device) = devices.into_iter().next() {
                    break device;
                }
            }
            Some(_) => {}
            None => return Err(ZoneError::DeviceNotFound),
        }
    };

    info!("✅ Found device: {}", device.identity());
    session.connect(device).await?;

    loop {
        match events.recv().await {
            Some(SessionEvent::Connected(device)) => {
                if let Some(revision) = &device.firmware_revision {
                    info!("🔗 Connected, current firmware: {revision}");
                } else {
                    info!("🔗 Connected");
                }
                break;
            }
            Some(SessionEvent::ConnectionFailed { error, .. }) => {
                error!("❌ Connection failed: {error}");
                return Err(ZoneError::ConnectionFailed(error.to_string()));
            }
            Some(_) => {}
            None => return Err(ZoneError::Disconnected),
        }
    }

    // Let the post-connect initialization finish before the transfer
    sleep(Duration::from_secs(2)).await;

    info!("📦 Uploading {firmware_path}...");
    session.start_firmware_update_from_file(&firmware_path).await?;

    let mut last_percent = 0u32;
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::TransferProgress(progress) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let percent = progress.percent() as u32;
                if percent / 10 > last_percent / 10 {
                    info!(
                        "📊 {percent}% ({}/{} bytes)",
                        progress.bytes_sent, progress.total_bytes
                    );
                }
                last_percent = percent;
            }
            SessionEvent::TransferCompleted => {
                info!("✅ Firmware transfer completed");
                break;
            }
            SessionEvent::TransferFailed(error) => {
                error!("❌ Firmware transfer failed: {error}");
                break;
            }
            SessionEvent::Disconnected { .. } => {
                error!("❌ Device disconnected mid-transfer");
                break;
            }
            _ => {}
        }
    }

    session.disconnect().await?;
    info!("🎉 Done!");
    Ok(())
}
