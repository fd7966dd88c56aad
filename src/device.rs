//! Connection and session management for Zone workout bands.
//!
//! [`ZoneSession`] owns the whole device lifecycle: throttled discovery,
//! connection with timeout, staged service discovery with write-channel
//! election, the one-shot post-connect initialization the band firmware
//! requires, workout recording, and firmware transfers. All outcomes flow to
//! the caller over an unbounded event channel; the public methods return
//! errors only for failures local to the call itself.

use crate::{
    error::{Result, ZoneError},
    firmware::{self, FirmwareTransfer, TransferAck, TransferStep},
    protocol::{self, InboundFrame},
    recorder::SessionRecorder,
    scan::{matches_filter, DeviceRegistry, SightingBuffer},
    stream::SampleAssembler,
    transport::{GattCharacteristic, Transport, TransportEvent},
    types::{DiscoveredDevice, SessionConfig, SessionEvent},
    DEVICE_INFORMATION_SERVICE_UUID, FIRMWARE_REVISION_CHAR_UUID, SERIAL_NUMBER_CHAR_UUID,
    ZONE_WRITE_CHAR_UUID,
};
use futures::StreamExt;
use std::{
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Session manager for one Zone band
///
/// Created together with its event receiver; see the crate-level Quick Start.
/// Cheap handles to the internal state are cloned into background tasks, so
/// dropping the session aborts the tasks it spawned.
pub struct ZoneSession {
    ctx: SessionCtx,
    pump_task: JoinHandle<()>,
}

/// State and handles shared between the session facade and its tasks
#[derive(Clone)]
struct SessionCtx {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    state: Arc<Mutex<SessionState>>,
}

#[derive(Default)]
struct SessionState {
    scanning: bool,
    sightings: SightingBuffer,
    registry: DeviceRegistry,
    flush_task: Option<JoinHandle<()>>,
    connection: Option<ActiveConnection>,
}

struct ActiveConnection {
    device: DiscoveredDevice,
    peripheral_key: String,
    connected_at: Instant,
    write_char: Option<Uuid>,
    init_done: bool,
    workout_pending: bool,
    assembler: SampleAssembler,
    recorder: Option<SessionRecorder>,
    transfer: Option<FirmwareTransfer>,
    init_task: Option<JoinHandle<()>>,
    router_task: Option<JoinHandle<()>>,
    sweep_task: Option<JoinHandle<()>>,
}

impl ActiveConnection {
    fn new(device: DiscoveredDevice, connected_at: Instant, sample_len: usize) -> Self {
        let peripheral_key = device.peripheral_key.clone();
        Self {
            device,
            peripheral_key,
            connected_at,
            write_char: None,
            init_done: false,
            workout_pending: false,
            assembler: SampleAssembler::new(sample_len),
            recorder: None,
            transfer: None,
            init_task: None,
            router_task: None,
            sweep_task: None,
        }
    }

    fn abort_tasks(&mut self) {
        for task in [
            self.init_task.take(),
            self.router_task.take(),
            self.sweep_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

impl ZoneSession {
    /// Create a session over a transport
    ///
    /// Spawns the transport event pump; must be called within a Tokio runtime.
    /// Returns the session and the receiver for its [`SessionEvent`] stream.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let ctx = SessionCtx {
            transport,
            config,
            events,
            state: Arc::new(Mutex::new(SessionState::default())),
        };

        let pump_ctx = ctx.clone();
        let pump_task = tokio::spawn(async move { pump_ctx.run_event_pump().await });

        (Self { ctx, pump_task }, receiver)
    }

    /// Start (or restart) scanning for Zone devices
    ///
    /// Matching sightings are merged into the device list and surfaced as
    /// [`SessionEvent::DevicesUpdated`] on the configured flush interval.
    /// Calling while already scanning restarts the scan.
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::RadioOff`] if the radio is not powered, or a
    /// transport error if the scan cannot be started.
    pub async fn start_scan(&self) -> Result<()> {
        if !self.ctx.transport.is_powered().await? {
            return Err(ZoneError::RadioOff);
        }

        let restarting = {
            let mut state = self.ctx.state.lock().await;
            let was_scanning = state.scanning;
            state.scanning = true;
            if let Some(task) = state.flush_task.take() {
                task.abort();
            }
            was_scanning
        };
        if restarting {
            debug!("restarting scan");
            if let Err(e) = self.ctx.transport.stop_scan().await {
                debug!(error = %e, "stop before scan restart failed");
            }
        }

        self.ctx.transport.start_scan().await?;

        let flush_ctx = self.ctx.clone();
        let flush_task = tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(
                flush_ctx.config.scan_flush_interval_ms,
            ));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                flush_ctx.flush_sightings().await;
            }
        });
        self.ctx.state.lock().await.flush_task = Some(flush_task);

        info!("scanning started");
        Ok(())
    }

    /// Stop scanning
    ///
    /// Any buffered sightings are flushed to the device list first, so a
    /// device seen just before the stop is not lost.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the scan cannot be stopped.
    pub async fn stop_scan(&self) -> Result<()> {
        {
            let mut state = self.ctx.state.lock().await;
            if !state.scanning {
                return Ok(());
            }
            state.scanning = false;
            if let Some(task) = state.flush_task.take() {
                task.abort();
            }
        }

        self.ctx.flush_sightings().await;
        self.ctx.transport.stop_scan().await
    }

    /// Connect to a discovered device
    ///
    /// Stops any active scan first. The outcome is reported through the event
    /// stream: [`SessionEvent::Connected`] on success, or exactly one
    /// [`SessionEvent::ConnectionFailed`] whose error distinguishes a timeout
    /// (the pending attempt is cancelled at the transport) from a
    /// peripheral-reported failure.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the preceding scan stop fails.
    pub async fn connect(&self, device: DiscoveredDevice) -> Result<()> {
        self.stop_scan().await?;
        self.disconnect().await?;
        self.ctx.establish(device, true).await;
        Ok(())
    }

    /// Disconnect the active connection, if any
    ///
    /// An in-progress recording is finalized first. Emits
    /// [`SessionEvent::Disconnected`] with `requested: true`; a no-op when
    /// nothing is connected.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the link teardown fails.
    pub async fn disconnect(&self) -> Result<()> {
        let (key, recorder) = {
            let mut state = self.ctx.state.lock().await;
            let Some(mut conn) = state.connection.take() else {
                return Ok(());
            };
            conn.abort_tasks();
            let recorder = conn.recorder.take();
            (conn.peripheral_key, recorder)
        };

        if let Some(recorder) = recorder {
            self.ctx.finish_recording(recorder);
        }

        let result = self.ctx.transport.disconnect(&key).await;
        self.ctx.emit(SessionEvent::Disconnected { requested: true });
        info!(peripheral = %key, "disconnected");
        result
    }

    /// Whether a device is currently connected
    pub async fn is_connected(&self) -> bool {
        self.ctx.state.lock().await.connection.is_some()
    }

    /// Snapshot of all discovered devices, strongest signal first
    pub async fn devices(&self) -> Vec<DiscoveredDevice> {
        self.ctx.state.lock().await.registry.snapshot()
    }

    /// Forget all discovered devices
    pub async fn clear_devices(&self) {
        self.ctx.state.lock().await.registry.clear();
    }

    /// Write a raw command frame to the device's write channel
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::Disconnected`] if nothing is connected,
    /// [`ZoneError::NoWriteChannel`] if no writable characteristic has been
    /// elected yet, or a transport error if the write fails.
    pub async fn send_command(&self, frame: &[u8]) -> Result<()> {
        self.ctx.send_frame(frame).await
    }

    /// Query the device's battery state
    ///
    /// The reply arrives as [`SessionEvent::Battery`].
    ///
    /// # Errors
    ///
    /// See [`ZoneSession::send_command`].
    pub async fn query_battery(&self) -> Result<()> {
        self.ctx.send_frame(&protocol::BATTERY_QUERY).await
    }

    /// Push the current wall-clock time to the device
    ///
    /// # Errors
    ///
    /// See [`ZoneSession::send_command`].
    pub async fn sync_device_time(&self) -> Result<()> {
        self.ctx
            .send_frame(&protocol::set_device_time(epoch_secs()))
            .await
    }

    /// Start a workout on the device
    ///
    /// Pushes the current time first, then the start command. Recording
    /// begins when the device acknowledges the start
    /// ([`SessionEvent::WorkoutStarted`]); telemetry samples then stream as
    /// [`SessionEvent::Sample`].
    ///
    /// # Errors
    ///
    /// See [`ZoneSession::send_command`].
    pub async fn start_workout(&self) -> Result<()> {
        self.sync_device_time().await?;

        {
            let mut state = self.ctx.state.lock().await;
            let conn = state.connection.as_mut().ok_or(ZoneError::Disconnected)?;
            conn.workout_pending = true;
        }

        if let Err(e) = self.ctx.send_frame(&protocol::START_WORKOUT).await {
            let mut state = self.ctx.state.lock().await;
            if let Some(conn) = state.connection.as_mut() {
                conn.workout_pending = false;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop the running workout and finalize its recording
    ///
    /// Emits [`SessionEvent::RecordingSaved`] with the export path, or
    /// [`SessionEvent::RecordingEmpty`] if no samples were captured.
    ///
    /// # Errors
    ///
    /// See [`ZoneSession::send_command`].
    pub async fn stop_workout(&self) -> Result<()> {
        self.ctx.send_frame(&protocol::STOP_WORKOUT).await?;

        let recorder = {
            let mut state = self.ctx.state.lock().await;
            let conn = state.connection.as_mut().ok_or(ZoneError::Disconnected)?;
            conn.workout_pending = false;
            conn.assembler.reset();
            conn.recorder.take()
        };

        if let Some(recorder) = recorder {
            self.ctx.finish_recording(recorder);
        }
        Ok(())
    }

    /// Delete the in-progress recording without exporting it
    ///
    /// A no-op when nothing is being recorded.
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::Io`] if the recording file cannot be removed.
    pub async fn discard_recording(&self) -> Result<()> {
        let recorder = {
            let mut state = self.ctx.state.lock().await;
            state
                .connection
                .as_mut()
                .and_then(|conn| conn.recorder.take())
        };
        match recorder {
            Some(recorder) => recorder.discard(),
            None => Ok(()),
        }
    }

    /// Start a firmware transfer from raw image bytes
    ///
    /// The image is validated before any transport call. Progress and
    /// completion arrive as [`SessionEvent::TransferProgress`] /
    /// [`SessionEvent::TransferCompleted`]; a mid-transfer write failure
    /// emits [`SessionEvent::TransferFailed`] and clears the transfer.
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::FirmwareTooSmall`] for an undersized image,
    /// [`ZoneError::Disconnected`] if nothing is connected, or a transport
    /// error if the header write fails.
    pub async fn start_firmware_update(&self, image: Vec<u8>) -> Result<()> {
        let mut transfer = FirmwareTransfer::new(image)?;
        let header = transfer
            .begin()
            .ok_or_else(|| ZoneError::Other("transfer already started".to_string()))?;

        {
            let mut state = self.ctx.state.lock().await;
            let conn = state.connection.as_mut().ok_or(ZoneError::Disconnected)?;
            if conn.transfer.is_some() {
                return Err(ZoneError::Other(
                    "a firmware transfer is already in progress".to_string(),
                ));
            }
            info!(total = transfer.progress().total_bytes, "firmware transfer starting");
            conn.transfer = Some(transfer);
        }

        if let Err(e) = self.ctx.send_frame(&header).await {
            self.ctx.clear_failed_transfer(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// Start a firmware transfer from a hex-text firmware file
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::Io`] or [`ZoneError::MalformedFirmwareFile`] if
    /// the file cannot be loaded, plus the errors of
    /// [`ZoneSession::start_firmware_update`].
    pub async fn start_firmware_update_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let image = firmware::load_hex_file(path)?;
        self.start_firmware_update(image).await
    }

    /// Cancel the in-progress firmware transfer
    ///
    /// Nothing is sent to the device; the session simply stops scheduling
    /// further frames and drops the transfer context.
    ///
    /// # Errors
    ///
    /// Returns [`ZoneError::NoTransferInProgress`] if no transfer is active.
    pub async fn cancel_firmware_update(&self) -> Result<()> {
        let mut state = self.ctx.state.lock().await;
        let conn = state.connection.as_mut().ok_or(ZoneError::Disconnected)?;
        let mut transfer = conn
            .transfer
            .take()
            .ok_or(ZoneError::NoTransferInProgress)?;
        transfer.cancel();
        info!("firmware transfer cancelled");
        Ok(())
    }
}

impl Drop for ZoneSession {
    fn drop(&mut self) {
        self.pump_task.abort();
        if let Ok(mut state) = self.ctx.state.try_lock() {
            if let Some(task) = state.flush_task.take() {
                task.abort();
            }
            if let Some(conn) = state.connection.as_mut() {
                conn.abort_tasks();
            }
        }
    }
}

impl SessionCtx {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Consume radio-pushed events for the session's lifetime
    async fn run_event_pump(self) {
        let mut events = match self.transport.events().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "transport event stream unavailable");
                return;
            }
        };

        while let Some(event) = events.next().await {
            match event {
                TransportEvent::Advertisement(advertisement) => {
                    if !matches_filter(&advertisement) {
                        continue;
                    }
                    let mut state = self.state.lock().await;
                    if state.scanning {
                        state.sightings.record(advertisement);
                    }
                }
                TransportEvent::Disconnected { peripheral_key } => {
                    self.handle_unexpected_disconnect(&peripheral_key).await;
                }
            }
        }
    }

    async fn flush_sightings(&self) {
        let snapshot = {
            let mut state = self.state.lock().await;
            if state.sightings.is_empty() {
                return;
            }
            for advertisement in state.sightings.drain() {
                state.registry.observe(&advertisement);
            }
            state.registry.snapshot()
        };
        self.emit(SessionEvent::DevicesUpdated(snapshot));
    }

    /// Attempt a connection; reports the outcome via events when `report` is
    /// set and returns whether the session is now connected
    async fn establish(&self, device: DiscoveredDevice, report: bool) -> bool {
        let key = device.peripheral_key.clone();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        info!(device = %device.identity(), "connecting");

        let outcome = timeout(connect_timeout, self.transport.connect(&key)).await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => {
                // Abandon the pending attempt so the radio cannot complete it
                // after the caller has given up on it.
                if let Err(e) = self.transport.cancel_connect(&key).await {
                    debug!(error = %e, "cancel of pending connect failed");
                }
                Some(ZoneError::Timeout {
                    timeout_ms: self.config.connect_timeout_ms,
                })
            }
        };

        if let Some(error) = error {
            if report {
                self.emit(SessionEvent::ConnectionFailed { device, error });
            } else {
                debug!(error = %error, "connection attempt failed");
            }
            return false;
        }

        let connected_at = Instant::now();
        {
            let mut state = self.state.lock().await;
            state.connection = Some(ActiveConnection::new(
                device.clone(),
                connected_at,
                self.config.sample_len,
            ));
        }

        if let Err(e) = self.post_connect(&key).await {
            warn!(error = %e, "post-connect setup failed");
        }

        let connected_device = {
            let state = self.state.lock().await;
            state
                .registry
                .by_peripheral(&key)
                .cloned()
                .unwrap_or(device)
        };
        info!(device = %connected_device.identity(), "connected");
        self.emit(SessionEvent::Connected(connected_device));
        true
    }

    /// Staged setup after the link comes up: device information service
    /// first, then the notification router, then the delayed full sweep
    async fn post_connect(&self, key: &str) -> Result<()> {
        let information_service = parse_uuid(DEVICE_INFORMATION_SERVICE_UUID)?;
        match self
            .transport
            .discover_characteristics(key, Some(information_service))
            .await
        {
            Ok(characteristics) => self.process_characteristics(key, &characteristics).await,
            Err(e) => debug!(error = %e, "device information service not available yet"),
        }

        let notifications = self.transport.notifications(key).await?;
        let router_ctx = self.clone();
        let router_key = key.to_string();
        let router_task = tokio::spawn(async move {
            let mut notifications = notifications;
            while let Some(notification) = notifications.next().await {
                router_ctx
                    .route_inbound(&router_key, &notification.value)
                    .await;
            }
        });

        // The band exposes its vendor service noticeably later than the
        // device information service; sweep everything after a grace period.
        let sweep_ctx = self.clone();
        let sweep_key = key.to_string();
        let sweep_task = tokio::spawn(async move {
            sleep(Duration::from_millis(sweep_ctx.config.service_sweep_delay_ms)).await;
            match sweep_ctx
                .transport
                .discover_characteristics(&sweep_key, None)
                .await
            {
                Ok(characteristics) => {
                    sweep_ctx
                        .process_characteristics(&sweep_key, &characteristics)
                        .await;
                }
                Err(e) => warn!(error = %e, "service sweep failed"),
            }
        });

        let mut state = self.state.lock().await;
        match state.connection.as_mut() {
            Some(conn) if conn.peripheral_key == key => {
                conn.router_task = Some(router_task);
                conn.sweep_task = Some(sweep_task);
            }
            _ => {
                router_task.abort();
                sweep_task.abort();
            }
        }
        Ok(())
    }

    /// Elect the write channel, subscribe notify characteristics, and read
    /// the device information strings
    ///
    /// Runs once per discovery pass; the preferred write characteristic
    /// always wins the election, any other writable characteristic wins only
    /// while no channel is held and is never displaced afterwards.
    async fn process_characteristics(&self, key: &str, characteristics: &[GattCharacteristic]) {
        let preferred = Uuid::parse_str(ZONE_WRITE_CHAR_UUID).ok();
        let serial_char = Uuid::parse_str(SERIAL_NUMBER_CHAR_UUID).ok();
        let firmware_char = Uuid::parse_str(FIRMWARE_REVISION_CHAR_UUID).ok();

        let elected = {
            let mut state = self.state.lock().await;
            let Some(conn) = state.connection.as_mut() else {
                return;
            };
            if conn.peripheral_key != key {
                return;
            }

            let mut elected = None;
            for characteristic in characteristics.iter().filter(|c| c.writable) {
                if Some(characteristic.uuid) == preferred {
                    if conn.write_char != Some(characteristic.uuid) {
                        conn.write_char = Some(characteristic.uuid);
                        elected = Some(characteristic.uuid);
                    }
                } else if conn.write_char.is_none() {
                    conn.write_char = Some(characteristic.uuid);
                    elected = Some(characteristic.uuid);
                }
            }
            elected
        };

        if let Some(uuid) = elected {
            debug!(%uuid, "write channel elected");
            self.arm_init(key.to_string()).await;
        }

        for characteristic in characteristics.iter().filter(|c| c.notifiable) {
            if let Err(e) = self.transport.subscribe(key, characteristic.uuid).await {
                debug!(uuid = %characteristic.uuid, error = %e, "subscribe failed");
            }
        }

        // Later passes re-read the same strings; only a changed value is
        // recorded and reported.
        for characteristic in characteristics.iter().filter(|c| c.readable) {
            if Some(characteristic.uuid) == serial_char {
                if let Some(serial) = self.read_string(key, characteristic.uuid).await {
                    let changed = {
                        let mut state = self.state.lock().await;
                        state.registry.record_serial(key, &serial);
                        match state.connection.as_mut() {
                            Some(conn) if conn.device.serial.as_deref() != Some(serial.as_str()) => {
                                conn.device.serial = Some(serial.clone());
                                true
                            }
                            _ => false,
                        }
                    };
                    if changed {
                        self.emit(SessionEvent::SerialNumber(serial));
                    }
                }
            } else if Some(characteristic.uuid) == firmware_char {
                if let Some(revision) = self.read_string(key, characteristic.uuid).await {
                    let changed = {
                        let mut state = self.state.lock().await;
                        state.registry.record_firmware_revision(key, &revision);
                        match state.connection.as_mut() {
                            Some(conn)
                                if conn.device.firmware_revision.as_deref()
                                    != Some(revision.as_str()) =>
                            {
                                conn.device.firmware_revision = Some(revision.clone());
                                true
                            }
                            _ => false,
                        }
                    };
                    if changed {
                        self.emit(SessionEvent::FirmwareRevision(revision));
                    }
                }
            }
        }
    }

    async fn read_string(&self, key: &str, characteristic: Uuid) -> Option<String> {
        match self.transport.read(key, characteristic).await {
            Ok(bytes) => {
                let value = String::from_utf8_lossy(&bytes).trim().to_string();
                (!value.is_empty()).then_some(value)
            }
            Err(e) => {
                debug!(uuid = %characteristic, error = %e, "characteristic read failed");
                None
            }
        }
    }

    /// Arm (or re-arm) the one-shot post-connect initialization
    ///
    /// The band ignores commands until it has received the initialization
    /// frame, which must arrive at a fixed delay after the link came up, not
    /// after channel discovery. Re-arming keeps the original absolute
    /// deadline; the init fires at most once per connection.
    async fn arm_init(&self, key: String) {
        let deadline = {
            let state = self.state.lock().await;
            match state.connection.as_ref() {
                Some(conn) if conn.peripheral_key == key && !conn.init_done => {
                    conn.connected_at + Duration::from_millis(self.config.init_delay_ms)
                }
                _ => return,
            }
        };

        let ctx = self.clone();
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;

            let due = {
                let mut state = ctx.state.lock().await;
                match state.connection.as_mut() {
                    Some(conn) if conn.peripheral_key == key && !conn.init_done => {
                        conn.init_done = true;
                        true
                    }
                    _ => false,
                }
            };
            if !due {
                return;
            }

            info!("sending post-connect initialization");
            if let Err(e) = ctx.send_frame(&protocol::LED_INIT).await {
                warn!(error = %e, "initialization command failed");
                return;
            }

            sleep(Duration::from_millis(ctx.config.battery_query_delay_ms)).await;
            if let Err(e) = ctx.send_frame(&protocol::BATTERY_QUERY).await {
                warn!(error = %e, "post-init battery query failed");
            }
        });

        let mut state = self.state.lock().await;
        match state.connection.as_mut() {
            Some(conn) => {
                if let Some(previous) = conn.init_task.replace(task) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }
    }

    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let (key, write_char) = {
            let state = self.state.lock().await;
            let conn = state.connection.as_ref().ok_or(ZoneError::Disconnected)?;
            let write_char = conn.write_char.ok_or(ZoneError::NoWriteChannel)?;
            (conn.peripheral_key.clone(), write_char)
        };

        debug!(frame = ?frame, "sending command");
        self.transport.write(&key, write_char, frame, false).await
    }

    /// Route one inbound notification delivery
    async fn route_inbound(&self, key: &str, data: &[u8]) {
        match protocol::classify(data) {
            InboundFrame::HeaderAck => self.advance_transfer(key, TransferAck::Header).await,
            InboundFrame::ChunkAck => self.advance_transfer(key, TransferAck::Chunk).await,
            InboundFrame::TailAck => self.advance_transfer(key, TransferAck::Tail).await,
            InboundFrame::Battery(reading) => {
                debug!(level = reading.level, "battery reply");
                self.emit(SessionEvent::Battery(reading));
            }
            InboundFrame::StartAck { rest } => {
                let started = {
                    let mut state = self.state.lock().await;
                    match state.connection.as_mut() {
                        Some(conn) if conn.peripheral_key == key && conn.workout_pending => {
                            conn.workout_pending = false;
                            if conn.recorder.is_none() {
                                match SessionRecorder::create(&self.config.recording_dir) {
                                    Ok(recorder) => conn.recorder = Some(recorder),
                                    Err(e) => warn!(error = %e, "could not open recording"),
                                }
                            }
                            true
                        }
                        _ => false,
                    }
                };
                if started {
                    info!("workout started");
                    self.emit(SessionEvent::WorkoutStarted);
                }
                if !rest.is_empty() {
                    self.ingest_telemetry(key, rest).await;
                }
            }
            InboundFrame::Telemetry(bytes) => self.ingest_telemetry(key, bytes).await,
        }
    }

    async fn ingest_telemetry(&self, key: &str, bytes: &[u8]) {
        let samples = {
            let mut state = self.state.lock().await;
            let Some(conn) = state.connection.as_mut() else {
                return;
            };
            if conn.peripheral_key != key {
                return;
            }

            let samples = conn.assembler.push(bytes);
            if let Some(recorder) = conn.recorder.as_mut() {
                for sample in &samples {
                    if let Err(e) = recorder.append(sample) {
                        warn!(error = %e, "sample write failed");
                    }
                }
            }
            samples
        };

        for sample in samples {
            self.emit(SessionEvent::Sample(sample));
        }
    }

    /// Feed a transfer acknowledgement and write the next frame it yields
    async fn advance_transfer(&self, key: &str, ack: TransferAck) {
        let pending = {
            let mut state = self.state.lock().await;
            let Some(conn) = state.connection.as_mut() else {
                return;
            };
            if conn.peripheral_key != key {
                return;
            }
            let Some(transfer) = conn.transfer.as_mut() else {
                return;
            };
            let Some(step) = transfer.handle_ack(ack) else {
                return;
            };

            match step {
                TransferStep::Send { frame, progress } => {
                    let Some(write_char) = conn.write_char else {
                        conn.transfer = None;
                        drop(state);
                        self.emit(SessionEvent::TransferFailed(ZoneError::NoWriteChannel));
                        return;
                    };
                    (frame, progress, conn.peripheral_key.clone(), write_char)
                }
                TransferStep::Completed { progress } => {
                    conn.transfer = None;
                    drop(state);
                    info!("firmware transfer completed");
                    self.emit(SessionEvent::TransferProgress(progress));
                    self.emit(SessionEvent::TransferCompleted);
                    return;
                }
            }
        };

        let (frame, progress, peripheral_key, write_char) = pending;
        self.emit(SessionEvent::TransferProgress(progress));
        if let Err(e) = self
            .transport
            .write(&peripheral_key, write_char, &frame, false)
            .await
        {
            warn!(error = %e, "firmware frame write failed");
            let mut state = self.state.lock().await;
            if let Some(conn) = state.connection.as_mut() {
                if let Some(transfer) = conn.transfer.as_mut() {
                    transfer.fail();
                }
                conn.transfer = None;
            }
            drop(state);
            self.emit(SessionEvent::TransferFailed(e));
        }
    }

    async fn clear_failed_transfer(&self, error: &ZoneError) {
        let mut state = self.state.lock().await;
        if let Some(conn) = state.connection.as_mut() {
            if let Some(transfer) = conn.transfer.as_mut() {
                transfer.fail();
            }
            conn.transfer = None;
        }
        drop(state);
        self.emit(SessionEvent::TransferFailed(ZoneError::WriteFailed(
            error.to_string(),
        )));
    }

    /// React to a transport-reported disconnect of the active connection
    async fn handle_unexpected_disconnect(&self, key: &str) {
        let (device, recorder) = {
            let mut state = self.state.lock().await;
            match state.connection.as_ref() {
                Some(conn) if conn.peripheral_key == key => {}
                _ => return,
            }
            let Some(mut conn) = state.connection.take() else {
                return;
            };
            conn.abort_tasks();
            let recorder = conn.recorder.take();
            (conn.device, recorder)
        };

        warn!(device = %device.identity(), "device disconnected unexpectedly");
        self.emit(SessionEvent::Disconnected { requested: false });
        if let Some(recorder) = recorder {
            self.finish_recording(recorder);
        }

        let ctx = self.clone();
        tokio::spawn(async move { ctx.reconnect(device).await });
    }

    /// Bounded reconnection after an unexpected disconnect
    ///
    /// Individual attempt failures are suppressed; only the final exhaustion
    /// is reported as a connection failure.
    async fn reconnect(&self, device: DiscoveredDevice) {
        for attempt in 1..=self.config.reconnect_attempts {
            sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;
            debug!(attempt, device = %device.identity(), "reconnecting");
            if self.establish(device.clone(), false).await {
                return;
            }
        }

        self.emit(SessionEvent::ConnectionFailed {
            device,
            error: ZoneError::ConnectionFailed("reconnect attempts exhausted".to_string()),
        });
    }

    fn finish_recording(&self, recorder: SessionRecorder) {
        match recorder.finalize() {
            Ok(path) => self.emit(SessionEvent::RecordingSaved(path)),
            Err(ZoneError::NoRecordedData) => self.emit(SessionEvent::RecordingEmpty),
            Err(e) => warn!(error = %e, "recording finalize failed"),
        }
    }
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| ZoneError::Protocol(format!("Invalid UUID: {e}")))
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
