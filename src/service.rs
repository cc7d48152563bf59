//! Wiring of transport, decoder, protocol actor, pipeline and watchdog.
//!
//! ```text
//! SerialTransport ──lines──> dispatcher ──> FrameDecoder
//!                                              │
//!                    ┌─────────────────────────┼─────────────────────┐
//!              Measurement               Coefficients / Info     (every frame)
//!                    │                         │                     │
//!          MeasurementPipeline       CommandSynchronizer        LinkWatchdog
//! ```

use crate::alerting::Alerting;
use crate::config::MonitorConfig;
use crate::error::AppResult;
use crate::feed::{LiveEvent, LiveFeed, TelemetrySnapshot};
use crate::pipeline::MeasurementPipeline;
use crate::protocol::{Decoded, DecoderStats, Frame, FrameDecoder};
use crate::storage::Storage;
use crate::sync::CommandSynchronizer;
use crate::transport::{DeviceLink, DynSerial, SerialTransport};
use crate::watchdog::{LinkTransition, LinkWatchdog};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Raw lines buffered between the transport reader and the dispatcher.
const LINE_BUFFER: usize = 256;

#[derive(Clone)]
struct Dispatcher {
    decoder: Arc<FrameDecoder>,
    pipeline: Arc<MeasurementPipeline>,
    watchdog: Arc<LinkWatchdog>,
    sync: CommandSynchronizer,
}

impl Dispatcher {
    async fn dispatch(&self, raw: &str) {
        let Decoded::Frame(frame) = self.decoder.decode(raw) else {
            return;
        };

        self.watchdog.touch();
        match frame {
            Frame::Measurement { voltage, current } => {
                self.pipeline.accept(voltage, current).await;
            }
            Frame::Coefficients(readback) => self.sync.handle_coefficients(readback).await,
            Frame::Info(version) => self.sync.handle_info(version).await,
        }
    }

    async fn run(self, mut lines: mpsc::Receiver<String>) {
        while let Some(line) = lines.recv().await {
            self.dispatch(&line).await;
        }
        debug!("Line dispatcher stopped");
    }
}

/// The monitor: one serial peer, its protocol state and its telemetry path.
///
/// Must be created inside a Tokio runtime (the protocol actor is spawned
/// immediately).
pub struct MonitorService {
    config: MonitorConfig,
    transport: Arc<SerialTransport>,
    dispatcher: Dispatcher,
    feed: LiveFeed,
    storage: Arc<dyn Storage>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorService {
    /// Build the service with commands going out over its own transport.
    pub fn new(
        config: MonitorConfig,
        storage: Arc<dyn Storage>,
        alerting: Arc<dyn Alerting>,
    ) -> Self {
        let transport = Arc::new(SerialTransport::new());
        let link: Arc<dyn DeviceLink> = transport.clone();
        Self::build(config, transport, link, storage, alerting)
    }

    /// Build the service with commands going out through `link` instead of
    /// the transport. Used by simulators and tests.
    pub fn with_link(
        config: MonitorConfig,
        link: Arc<dyn DeviceLink>,
        storage: Arc<dyn Storage>,
        alerting: Arc<dyn Alerting>,
    ) -> Self {
        Self::build(
            config,
            Arc::new(SerialTransport::new()),
            link,
            storage,
            alerting,
        )
    }

    fn build(
        config: MonitorConfig,
        transport: Arc<SerialTransport>,
        link: Arc<dyn DeviceLink>,
        storage: Arc<dyn Storage>,
        alerting: Arc<dyn Alerting>,
    ) -> Self {
        let feed = LiveFeed::new(config.live.capacity);
        let watchdog = Arc::new(LinkWatchdog::new(
            &config.watchdog,
            config.application.environment,
            alerting,
        ));
        let pipeline = Arc::new(MeasurementPipeline::new(
            config.measurement.clone(),
            Arc::clone(&storage),
            feed.clone(),
            Arc::clone(&watchdog),
        ));
        let (sync, sync_task) = CommandSynchronizer::spawn(
            &config.protocol,
            config.calibration.target(),
            link,
            Arc::clone(&storage),
            feed.clone(),
        );

        Self {
            config,
            transport,
            dispatcher: Dispatcher {
                decoder: Arc::new(FrameDecoder::new()),
                pipeline,
                watchdog,
                sync,
            },
            feed,
            storage,
            sync_task: Mutex::new(Some(sync_task)),
            dispatch_task: Mutex::new(None),
        }
    }

    fn spawn_dispatcher(&self) -> mpsc::Sender<String> {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let task = tokio::spawn(self.dispatcher.clone().run(rx));
        if let Some(previous) = self.dispatch_task.lock().replace(task) {
            previous.abort();
        }
        tx
    }

    /// Open the configured serial port and perform the initial handshake.
    pub async fn start(&self) -> AppResult<()> {
        let on_line = self.spawn_dispatcher();
        self.transport
            .open(&self.config.serial.port, self.config.serial.baud_rate, on_line)
            .await?;
        self.handshake().await;
        Ok(())
    }

    /// Like [`start`](Self::start), over an already-open stream.
    pub async fn start_with_stream(&self, stream: DynSerial, label: &str) {
        let on_line = self.spawn_dispatcher();
        self.transport.attach(stream, label, on_line).await;
        self.handshake().await;
    }

    async fn handshake(&self) {
        self.transport.wait_opened().await;
        info!("Serial link open; querying board version and programming calibration");
        self.dispatcher.sync.query_build_date().await;
        self.dispatcher.sync.program_calibration(None).await;
    }

    /// Decode and route one raw line, as the dispatcher does.
    pub async fn handle_line(&self, raw: &str) {
        self.dispatcher.dispatch(raw).await;
    }

    /// Periodic liveness hook.
    pub async fn check_link(&self) -> LinkTransition {
        self.dispatcher.watchdog.check().await
    }

    /// Periodic telemetry hook: push a status snapshot to live subscribers.
    pub fn publish_telemetry(&self) -> TelemetrySnapshot {
        let state = self.dispatcher.watchdog.state();
        let snapshot = TelemetrySnapshot {
            link_up: state.link_up,
            seconds_since_last_frame: state.last_frame_at.elapsed().as_secs_f64(),
            last_reading: self.dispatcher.pipeline.last_reading(),
        };
        let delivered = self.feed.publish(LiveEvent::Telemetry(snapshot.clone()));
        debug!(delivered, link_up = snapshot.link_up, "Telemetry published");
        snapshot
    }

    /// Close the transport, stop the dispatcher and the protocol actor, and
    /// flush storage. Idempotent.
    pub async fn stop(&self) {
        self.transport.close().await;
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }

        self.dispatcher.sync.shutdown().await;
        let sync_task = self.sync_task.lock().take();
        if let Some(task) = sync_task {
            if let Err(err) = task.await {
                error!("Protocol actor ended abnormally: {err}");
            }
        }

        if let Err(err) = self.storage.flush().await {
            error!("Failed to flush storage on shutdown: {err}");
        }
        info!("Monitor service stopped");
    }

    /// Live fan-out hub.
    pub fn feed(&self) -> &LiveFeed {
        &self.feed
    }

    /// Handle to the protocol actor.
    pub fn synchronizer(&self) -> &CommandSynchronizer {
        &self.dispatcher.sync
    }

    /// The link liveness monitor.
    pub fn watchdog(&self) -> &LinkWatchdog {
        &self.dispatcher.watchdog
    }

    /// Whether the serial transport is open.
    pub fn is_link_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Decoder counters.
    pub fn decoder_stats(&self) -> DecoderStats {
        self.dispatcher.decoder.stats()
    }

    /// The loaded configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}
