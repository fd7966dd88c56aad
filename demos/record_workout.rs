use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use zoneband::{BtleTransport, Result, SessionConfig, SessionEvent, ZoneSession};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🏋️ Zoneband Workout Recording Example");
    info!("Searching for Zone devices...");

    let transport = Arc::new(BtleTransport::new().await?);
    let (session, mut events) = ZoneSession::new(transport, SessionConfig::default());

    session.start_scan().await?;

    // Connect to the first Zone band that shows up
    let device = loop {
        match timeout(Duration::from_secs(30), events.recv()).await {
            Ok(Some(SessionEvent::DevicesUpdated(devices))) => {
                if let Some(device) = devices.into_iter().next() {
                    break device;
                }
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                error!("❌ No Zone device found");
                return Ok(());
            }
        }
    };

    info!("✅ Found device: {}", device.identity());
    session.connect(device).await?;

    loop {
        match events.recv().await {
            Some(SessionEvent::Connected(device)) => {
                info!("🔗 Connected to {}", device.identity());
                break;
            }
            Some(SessionEvent::ConnectionFailed { error, .. }) => {
                error!("❌ Connection failed: {error}");
                return Ok(());
            }
            Some(_) => {}
            None => return Ok(()),
        }
    }

    // Give the band its post-connect initialization window
    sleep(Duration::from_secs(2)).await;

    info!("▶️  Starting workout...");
    session.start_workout().await?;

    let deadline = sleep(Duration::from_secs(60));
    tokio::pin!(deadline);
    let mut sample_count = 0u32;

    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = events.recv() => match event {
                Some(SessionEvent::WorkoutStarted) => info!("✅ Workout started, recording..."),
                Some(SessionEvent::Sample(sample)) => {
                    sample_count += 1;
                    if sample_count % 10 == 0 {
                        info!("📈 {sample_count} samples captured ({} bytes each)", sample.payload.len());
                    }
                }
                Some(SessionEvent::Battery(reading)) => info!("🔋 Battery level: {}", reading.level),
                Some(SessionEvent::Disconnected { .. }) => {
                    warn!("⚠️  Device disconnected");
                    break;
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    info!("⏹️  Stopping workout...");
    session.stop_workout().await?;

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::RecordingSaved(path) => {
                info!("💾 Recording saved to {}", path.display());
                break;
            }
            SessionEvent::RecordingEmpty => {
                warn!("⚠️  No samples captured, nothing to save");
                break;
            }
            _ => {}
        }
    }

    session.disconnect().await?;
    info!("🎉 Done!");
    Ok(())
}
