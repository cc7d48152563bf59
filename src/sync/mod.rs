//! Command/acknowledgment synchronization with the meter.
//!
//! The device never acknowledges a command directly. Confirmation is
//! inferred from a later frame:
//!
//! | Command | Confirmed by |
//! |---|---|
//! | `d` (build date query) | any `info` frame |
//! | `s<V>:<I>:<PF>` (program) | a `coefficients` frame equal to what was sent |
//!
//! Each kind keeps its own [`PendingCommand`]. An unconfirmed command is
//! re-sent every `retry_delay` until `max_attempts` writes have gone out,
//! after which it is abandoned with an error log.
//!
//! # Architecture
//!
//! All protocol state lives in a single [`SyncActor`] task. The
//! [`CommandSynchronizer`] handle and the retry timers talk to it through an
//! mpsc mailbox, so every mutation is serialized:
//!
//! ```text
//! dispatcher / scheduler ──┐
//!                          ├──> mailbox ──> SyncActor ──> DeviceLink (writes)
//! retry timers (weak tx) ──┘                         ├──> Storage (settings)
//!                                                    └──> LiveFeed
//! ```
//!
//! Retry ticks carry the generation of the send that scheduled them; a tick
//! from a superseded send is ignored.

mod pending;

pub use pending::{CommandKind, PendingCommand, RetryDecision};

use crate::config::ProtocolConfig;
use crate::feed::{LiveEvent, LiveFeed};
use crate::measurement_types::{BoardVersion, CalibrationTarget};
use crate::protocol::DeviceCommand;
use crate::storage::{Storage, BOARD_VERSION_KEY, COEFFICIENTS_KEY};
use crate::transport::DeviceLink;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Messages accepted by the [`SyncActor`].
#[derive(Debug)]
pub enum SyncMessage {
    /// Issue `d`
    QueryBuildDate,
    /// Issue `i`
    QueryCoefficients,
    /// Issue `s…`; `Some` replaces the configured target first
    ProgramCalibration {
        /// New target, or `None` to re-program the current one
        target: Option<CalibrationTarget>,
    },
    /// An `info` frame arrived
    InfoReceived(BoardVersion),
    /// A `coefficients` frame arrived
    CoefficientsReceived(CalibrationTarget),
    /// A retry timer fired
    RetryElapsed {
        /// Which command the timer belongs to
        kind: CommandKind,
        /// Generation of the send that armed it
        generation: u64,
    },
    /// Read the current protocol state
    Snapshot {
        /// Reply channel
        response: oneshot::Sender<SyncSnapshot>,
    },
    /// Abort timers and stop the actor
    Shutdown {
        /// Signalled once the actor has stopped
        response: oneshot::Sender<()>,
    },
}

/// Point-in-time copy of the protocol state.
#[derive(Debug, Clone)]
pub struct SyncSnapshot {
    /// Target the server wants the device to run with
    pub target: CalibrationTarget,
    /// Latest build date query, if one was issued
    pub build_date: Option<PendingCommand<()>>,
    /// Latest calibration program, if one was issued
    pub program: Option<PendingCommand<CalibrationTarget>>,
    /// Consecutive corrective re-sends since the last confirmation
    pub corrective_resends: u32,
    /// Last firmware identification received
    pub board_version: Option<BoardVersion>,
    /// Last calibration the device confirmed
    pub confirmed_calibration: Option<CalibrationTarget>,
}

/// Clonable handle to the protocol actor.
#[derive(Debug, Clone)]
pub struct CommandSynchronizer {
    tx: mpsc::Sender<SyncMessage>,
}

impl CommandSynchronizer {
    /// Spawn the actor task and return a handle to it.
    pub fn spawn(
        config: &ProtocolConfig,
        target: CalibrationTarget,
        link: Arc<dyn DeviceLink>,
        storage: Arc<dyn Storage>,
        feed: LiveFeed,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let actor = SyncActor {
            config: config.clone(),
            target,
            link,
            storage,
            feed,
            mailbox: tx.downgrade(),
            build_date: None,
            program: None,
            build_date_timer: None,
            program_timer: None,
            generation: 0,
            corrective_resends: 0,
            board_version: None,
            confirmed_calibration: None,
        };
        let handle = tokio::spawn(actor.run(rx));
        (Self { tx }, handle)
    }

    async fn send(&self, message: SyncMessage) {
        if let Err(err) = self.tx.send(message).await {
            warn!("Protocol actor stopped; dropping {:?}", err.0);
        }
    }

    /// Ask the device for its firmware version and build date.
    pub async fn query_build_date(&self) {
        self.send(SyncMessage::QueryBuildDate).await;
    }

    /// Ask the device to report the calibration it is using.
    pub async fn query_coefficients(&self) {
        self.send(SyncMessage::QueryCoefficients).await;
    }

    /// Program a calibration. `Some(target)` also becomes the configured target.
    pub async fn program_calibration(&self, target: Option<CalibrationTarget>) {
        self.send(SyncMessage::ProgramCalibration { target }).await;
    }

    /// Feed a decoded `info` frame.
    pub async fn handle_info(&self, version: BoardVersion) {
        self.send(SyncMessage::InfoReceived(version)).await;
    }

    /// Feed a decoded `coefficients` frame.
    pub async fn handle_coefficients(&self, readback: CalibrationTarget) {
        self.send(SyncMessage::CoefficientsReceived(readback)).await;
    }

    /// Current protocol state, or `None` once the actor has stopped.
    ///
    /// Messages sent earlier through this handle are processed first.
    pub async fn snapshot(&self) -> Option<SyncSnapshot> {
        let (response, rx) = oneshot::channel();
        self.send(SyncMessage::Snapshot { response }).await;
        rx.await.ok()
    }

    /// Stop the actor and its retry timers. Idempotent.
    pub async fn shutdown(&self) {
        let (response, rx) = oneshot::channel();
        if self.tx.send(SyncMessage::Shutdown { response }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Sole owner of protocol state.
pub struct SyncActor {
    config: ProtocolConfig,
    target: CalibrationTarget,
    link: Arc<dyn DeviceLink>,
    storage: Arc<dyn Storage>,
    feed: LiveFeed,
    mailbox: mpsc::WeakSender<SyncMessage>,
    build_date: Option<PendingCommand<()>>,
    program: Option<PendingCommand<CalibrationTarget>>,
    build_date_timer: Option<JoinHandle<()>>,
    program_timer: Option<JoinHandle<()>>,
    generation: u64,
    corrective_resends: u32,
    board_version: Option<BoardVersion>,
    confirmed_calibration: Option<CalibrationTarget>,
}

impl SyncActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SyncMessage>) {
        info!(calibration = %self.target, "Command synchronizer started");

        while let Some(message) = rx.recv().await {
            match message {
                SyncMessage::QueryBuildDate => self.send_build_date_query(false).await,
                SyncMessage::QueryCoefficients => {
                    self.link
                        .write(&DeviceCommand::QueryCoefficients.to_wire())
                        .await;
                    info!("Requested calibration readback");
                }
                SyncMessage::ProgramCalibration { target } => {
                    if let Some(target) = target {
                        info!(old = %self.target, new = %target, "Calibration target changed");
                        self.target = target;
                    }
                    self.corrective_resends = 0;
                    self.send_program(false).await;
                }
                SyncMessage::InfoReceived(version) => self.on_info(version).await,
                SyncMessage::CoefficientsReceived(readback) => {
                    self.on_coefficients(readback).await;
                }
                SyncMessage::RetryElapsed { kind, generation } => {
                    self.on_retry_elapsed(kind, generation).await;
                }
                SyncMessage::Snapshot { response } => {
                    let _ = response.send(self.snapshot());
                }
                SyncMessage::Shutdown { response } => {
                    self.abort_timers();
                    let _ = response.send(());
                    break;
                }
            }
        }

        self.abort_timers();
        info!("Command synchronizer stopped");
    }

    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            target: self.target,
            build_date: self.build_date.clone(),
            program: self.program.clone(),
            corrective_resends: self.corrective_resends,
            board_version: self.board_version.clone(),
            confirmed_calibration: self.confirmed_calibration,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    async fn send_build_date_query(&mut self, is_retry: bool) {
        if !is_retry {
            let generation = self.next_generation();
            self.build_date = Some(PendingCommand::new((), generation));
        }
        let Some(pending) = self.build_date.as_mut() else {
            return;
        };
        pending.record_send();
        let (attempt, generation) = (pending.attempt, pending.generation);

        self.link
            .write(&DeviceCommand::QueryBuildDate.to_wire())
            .await;
        info!(
            attempt,
            max = self.config.max_attempts,
            "Sent build date query ({attempt}/{})",
            self.config.max_attempts
        );
        self.schedule_retry(CommandKind::BuildDateQuery, generation);
    }

    async fn send_program(&mut self, is_retry: bool) {
        if !is_retry {
            let generation = self.next_generation();
            self.program = Some(PendingCommand::new(self.target, generation));
        }
        let Some(pending) = self.program.as_mut() else {
            return;
        };
        pending.record_send();
        let (attempt, generation, expected) =
            (pending.attempt, pending.generation, pending.expected);

        let command = DeviceCommand::ProgramCalibration(expected);
        self.link.write(&command.to_wire()).await;
        info!(
            attempt,
            max = self.config.max_attempts,
            "Sent calibration program '{command}' ({attempt}/{})",
            self.config.max_attempts
        );
        self.schedule_retry(CommandKind::CoefficientProgram, generation);
    }

    fn schedule_retry(&mut self, kind: CommandKind, generation: u64) {
        let mailbox = self.mailbox.clone();
        let delay = self.config.retry_delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(SyncMessage::RetryElapsed { kind, generation }).await;
            }
        });

        let slot = match kind {
            CommandKind::BuildDateQuery => &mut self.build_date_timer,
            CommandKind::CoefficientProgram => &mut self.program_timer,
        };
        if let Some(previous) = slot.replace(timer) {
            previous.abort();
        }
    }

    fn abort_timers(&mut self) {
        for timer in [self.build_date_timer.take(), self.program_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }

    async fn on_retry_elapsed(&mut self, kind: CommandKind, generation: u64) {
        let max_attempts = self.config.max_attempts;
        let decision = match kind {
            CommandKind::BuildDateQuery => self
                .build_date
                .as_mut()
                .map(|p| (p.on_retry_tick(generation, max_attempts), p.attempt)),
            CommandKind::CoefficientProgram => self
                .program
                .as_mut()
                .map(|p| (p.on_retry_tick(generation, max_attempts), p.attempt)),
        };

        match decision {
            Some((RetryDecision::Retry, _)) => match kind {
                CommandKind::BuildDateQuery => self.send_build_date_query(true).await,
                CommandKind::CoefficientProgram => self.send_program(true).await,
            },
            Some((RetryDecision::Exhausted, attempts)) => {
                error!(
                    attempts,
                    "No confirmation for {kind} after {attempts} attempts; giving up"
                );
            }
            Some((RetryDecision::Confirmed, _)) => {
                debug!("Retry tick for {kind} after confirmation; nothing to do");
            }
            Some((RetryDecision::Stale, _)) | None => {
                debug!(generation, "Ignoring stale retry tick for {kind}");
            }
        }
    }

    async fn on_info(&mut self, version: BoardVersion) {
        match self.build_date.as_mut() {
            Some(pending) if !pending.confirmed => {
                let latency = pending.confirm();
                info!(
                    latency_ms = latency.as_millis() as u64,
                    attempt = pending.attempt,
                    "Build date query confirmed"
                );
            }
            _ => debug!("Unsolicited info frame"),
        }

        info!(
            version = %version.version,
            build_date = %version.build_date_raw,
            "Board version reported"
        );
        self.persist(BOARD_VERSION_KEY, &version).await;
        self.feed.publish(LiveEvent::BoardVersion(version.clone()));
        self.board_version = Some(version);
    }

    async fn on_coefficients(&mut self, readback: CalibrationTarget) {
        let confirmed = match self.program.as_mut() {
            Some(pending) if pending.is_outstanding() => {
                if readback == pending.expected {
                    let latency = pending.confirm();
                    info!(
                        latency_ms = latency.as_millis() as u64,
                        attempt = pending.attempt,
                        "Calibration '{readback}' confirmed"
                    );
                    true
                } else {
                    error!(
                        expected = %pending.expected,
                        received = %readback,
                        "Calibration readback does not match the pending program"
                    );
                    false
                }
            }
            _ => {
                if readback == self.target {
                    debug!("Calibration '{readback}' matches configured target");
                    true
                } else {
                    error!(
                        expected = %self.target,
                        received = %readback,
                        "Device calibration differs from configured target"
                    );
                    false
                }
            }
        };

        if confirmed {
            self.corrective_resends = 0;
            self.persist(COEFFICIENTS_KEY, &readback).await;
            self.feed.publish(LiveEvent::Calibration(readback));
            self.confirmed_calibration = Some(readback);
        } else {
            self.correct_mismatch().await;
        }
    }

    async fn correct_mismatch(&mut self) {
        if self.corrective_resends >= self.config.max_corrective_resends {
            error!(
                resends = self.corrective_resends,
                "Corrective re-send budget exhausted; waiting for an explicit program"
            );
            return;
        }
        self.corrective_resends += 1;
        warn!(
            resend = self.corrective_resends,
            max = self.config.max_corrective_resends,
            "Re-programming calibration '{}'",
            self.target
        );
        self.send_program(false).await;
    }

    async fn persist<T: Serialize>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(err) => {
                error!("Failed to serialize setting '{key}': {err}");
                return;
            }
        };
        if let Err(err) = self.storage.set_named_setting(key, value).await {
            error!("Failed to persist setting '{key}': {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingLink;
    use crate::storage::MemoryStorage;
    use std::time::Duration;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            retry_delay: Duration::from_secs(2),
            max_attempts: 3,
            max_corrective_resends: 2,
            mailbox_capacity: 16,
        }
    }

    fn spawn(
        target: CalibrationTarget,
    ) -> (CommandSynchronizer, Arc<RecordingLink>, Arc<MemoryStorage>) {
        let link = Arc::new(RecordingLink::new());
        let storage = Arc::new(MemoryStorage::new());
        let (sync, _) = CommandSynchronizer::spawn(
            &config(),
            target,
            link.clone(),
            storage.clone(),
            LiveFeed::new(16),
        );
        (sync, link, storage)
    }

    #[tokio::test(start_paused = true)]
    async fn info_confirms_build_date_query() {
        let (sync, link, storage) = spawn(CalibrationTarget::default());
        sync.query_build_date().await;
        sync.handle_info(BoardVersion::from_raw("2.0", "2024-01-01T00:00:00"))
            .await;

        let snapshot = sync.snapshot().await.unwrap();
        let pending = snapshot.build_date.unwrap();
        assert!(pending.confirmed);
        assert_eq!(pending.attempt, 1);
        assert!(storage.setting(BOARD_VERSION_KEY).is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(link.writes(), vec!["d\n".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn corrective_budget_is_capped() {
        let (sync, link, _) = spawn(CalibrationTarget::default());
        let wrong = CalibrationTarget::new(2.0, 1.0, 1.0);
        for _ in 0..4 {
            sync.handle_coefficients(wrong).await;
        }

        let snapshot = sync.snapshot().await.unwrap();
        assert_eq!(snapshot.corrective_resends, 2);
        assert_eq!(link.writes(), vec!["s1:1:1\n".to_string(); 2]);

        // An explicit program resets the budget.
        sync.program_calibration(None).await;
        let snapshot = sync.snapshot().await.unwrap();
        assert_eq!(snapshot.corrective_resends, 0);
        sync.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn runtime_target_change() {
        let (sync, link, storage) = spawn(CalibrationTarget::default());
        let new_target = CalibrationTarget::new(1.02, 0.98, 1.0);
        sync.program_calibration(Some(new_target)).await;
        sync.handle_coefficients(new_target).await;

        let snapshot = sync.snapshot().await.unwrap();
        assert_eq!(snapshot.target, new_target);
        assert!(snapshot.program.unwrap().confirmed);
        assert_eq!(snapshot.confirmed_calibration, Some(new_target));
        assert_eq!(link.writes(), vec!["s1.02:0.98:1\n".to_string()]);
        assert_eq!(
            storage.setting(COEFFICIENTS_KEY),
            Some(serde_json::to_value(new_target).unwrap())
        );
    }

    #[tokio::test]
    async fn query_coefficients_writes_without_pending_state() {
        let (sync, link, _) = spawn(CalibrationTarget::default());
        sync.query_coefficients().await;
        let snapshot = sync.snapshot().await.unwrap();
        assert!(snapshot.program.is_none());
        assert_eq!(link.writes(), vec!["i\n".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (sync, _, _) = spawn(CalibrationTarget::default());
        sync.shutdown().await;
        sync.shutdown().await;
        assert!(sync.snapshot().await.is_none());
    }
}
