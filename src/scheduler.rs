//! Lifecycle and periodic hooks.
//!
//! The scheduler calls [`MonitorService::start`] once, runs the link check
//! every `watchdog.check_interval` and the telemetry snapshot every
//! `scheduler.telemetry_interval`, and calls [`MonitorService::stop`] once on
//! shutdown.
//!
//! It also owns the shutdown marker. A clean stop writes the marker file; the
//! next start finds it and deletes it. A start without the marker means the
//! previous run ended unexpectedly (power loss, crash). The marker is not used
//! in the development environment.

use crate::config::{Environment, MonitorConfig};
use crate::service::MonitorService;
use futures::future::join_all;
use parking_lot::Mutex;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Contents written to the shutdown marker.
const MARKER_CONTENTS: &str = "server.off";

/// How the previous run ended, as far as the marker file can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousShutdown {
    /// Marker found: the last run stopped cleanly
    Clean,
    /// Marker missing: the last run stopped unexpectedly
    Unexpected,
    /// Development environment; not tracked
    NotTracked,
}

/// Drives a [`MonitorService`].
pub struct Scheduler {
    service: Arc<MonitorService>,
    environment: Environment,
    marker: PathBuf,
    check_interval: Duration,
    telemetry_interval: Duration,
    tickers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler; nothing runs until [`start`](Self::start).
    pub fn new(service: Arc<MonitorService>, config: &MonitorConfig) -> Self {
        Self {
            service,
            environment: config.application.environment,
            marker: config.scheduler.shutdown_marker.clone(),
            check_interval: config.watchdog.check_interval,
            telemetry_interval: config.scheduler.telemetry_interval,
            tickers: Mutex::new(Vec::new()),
        }
    }

    /// Check the shutdown marker, start the service and the periodic hooks.
    ///
    /// A service that fails to open its port is logged; the hooks still run,
    /// so the watchdog reports the missing data.
    pub async fn start(&self) -> PreviousShutdown {
        let previous = self.check_shutdown_marker().await;

        match self.service.start().await {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => {
                warn!("Failed to start monitor service: {err}");
            }
            Err(err) => error!("Failed to start monitor service: {err}"),
        }

        let service = Arc::clone(&self.service);
        let watchdog = spawn_ticker("link check", self.check_interval, move || {
            let service = Arc::clone(&service);
            async move {
                service.check_link().await;
            }
        });
        let service = Arc::clone(&self.service);
        let telemetry = spawn_ticker("telemetry", self.telemetry_interval, move || {
            let service = Arc::clone(&service);
            async move {
                service.publish_telemetry();
            }
        });
        self.tickers.lock().extend([watchdog, telemetry]);

        info!(
            check_interval = ?self.check_interval,
            telemetry_interval = ?self.telemetry_interval,
            "Scheduler started"
        );
        previous
    }

    /// Stop the periodic hooks, record a clean shutdown and stop the service.
    pub async fn stop(&self, signal: &str) {
        info!("Received shutdown signal: '{signal}'");

        let tickers: Vec<_> = self.tickers.lock().drain(..).collect();
        for ticker in &tickers {
            ticker.abort();
        }
        for result in join_all(tickers).await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    error!("Periodic task ended abnormally: {err}");
                }
            }
        }

        self.write_shutdown_marker().await;
        self.service.stop().await;
        info!("Scheduler stopped");
    }

    async fn check_shutdown_marker(&self) -> PreviousShutdown {
        if self.environment.is_development() {
            debug!("Development environment; shutdown marker not checked");
            return PreviousShutdown::NotTracked;
        }

        if tokio::fs::try_exists(&self.marker).await.unwrap_or(false) {
            info!("Server stopped correctly.");
            if let Err(err) = tokio::fs::remove_file(&self.marker).await {
                error!(
                    "Failed to remove shutdown marker {}: {err}",
                    self.marker.display()
                );
            }
            PreviousShutdown::Clean
        } else {
            error!("Server stopped unexpectedly.");
            PreviousShutdown::Unexpected
        }
    }

    async fn write_shutdown_marker(&self) {
        if self.environment.is_development() {
            return;
        }
        if let Err(err) = tokio::fs::write(&self.marker, MARKER_CONTENTS).await {
            error!(
                "Error creating shutdown marker {}: {err}",
                self.marker.display()
            );
        }
    }
}

fn spawn_ticker<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            debug!("Running {name} tick");
            tick().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{RecordingAlerting, RecordingLink};
    use crate::storage::MemoryStorage;
    use crate::watchdog::LINK_DOWN_ALERT;

    fn scheduler(env: Environment, marker: PathBuf) -> (Scheduler, Arc<RecordingAlerting>) {
        let mut config = MonitorConfig::default();
        config.application.environment = env;
        config.scheduler.shutdown_marker = marker;
        let alerting = Arc::new(RecordingAlerting::default());
        let service = Arc::new(MonitorService::with_link(
            config.clone(),
            Arc::new(RecordingLink::new()),
            Arc::new(MemoryStorage::new()),
            alerting.clone(),
        ));
        (Scheduler::new(service, &config), alerting)
    }

    #[tokio::test]
    async fn marker_round_trip_in_production() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("server.off");

        let (first, _) = scheduler(Environment::Production, marker.clone());
        assert_eq!(first.start().await, PreviousShutdown::Unexpected);
        first.stop("SIGTERM").await;
        assert!(marker.exists());

        let (second, _) = scheduler(Environment::Production, marker.clone());
        assert_eq!(second.start().await, PreviousShutdown::Clean);
        assert!(!marker.exists());
        second.stop("SIGINT").await;
    }

    #[tokio::test]
    async fn development_skips_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("server.off");

        let (scheduler, _) = scheduler(Environment::Development, marker.clone());
        assert_eq!(scheduler.start().await, PreviousShutdown::NotTracked);
        scheduler.stop("SIGTERM").await;
        assert!(!marker.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_tick_raises_one_alert() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, alerting) =
            scheduler(Environment::Production, dir.path().join("server.off"));
        scheduler.start().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(alerting.messages(), vec![LINK_DOWN_ALERT.to_string()]);
        scheduler.stop("SIGTERM").await;
    }
}
