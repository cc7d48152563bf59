//! Serial link liveness.
//!
//! Every decoded frame calls [`LinkWatchdog::touch`]. A periodic
//! [`LinkWatchdog::check`] declares the link unavailable once no frame has
//! arrived for `inactivity_timeout`, and raises exactly one alert for that
//! outage. Only a fresh frame brings the link back.

use crate::alerting::Alerting;
use crate::config::{Environment, WatchdogConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// Alert text sent when the link goes quiet.
pub const LINK_DOWN_ALERT: &str = "PowerMonitor serial data is not available";

/// Shared liveness state.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogState {
    /// When the last frame of any type was decoded
    pub last_frame_at: Instant,
    /// Whether the link is considered available
    pub link_up: bool,
}

/// Result of a periodic check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTransition {
    /// Nothing changed
    Unchanged,
    /// Available → Unavailable on this tick
    WentDown,
}

/// Liveness monitor over received-frame timestamps.
pub struct LinkWatchdog {
    state: Mutex<WatchdogState>,
    inactivity_timeout: Duration,
    environment: Environment,
    alerting: Arc<dyn Alerting>,
}

impl LinkWatchdog {
    /// Start in the available state with the clock at "now".
    pub fn new(
        config: &WatchdogConfig,
        environment: Environment,
        alerting: Arc<dyn Alerting>,
    ) -> Self {
        Self {
            state: Mutex::new(WatchdogState {
                last_frame_at: Instant::now(),
                link_up: true,
            }),
            inactivity_timeout: config.inactivity_timeout,
            environment,
            alerting,
        }
    }

    /// Record a received frame. Returns true if this restored the link.
    pub fn touch(&self) -> bool {
        let restored = {
            let mut state = self.state.lock();
            state.last_frame_at = Instant::now();
            !std::mem::replace(&mut state.link_up, true)
        };
        if restored {
            info!("Serial data is available again");
        }
        restored
    }

    /// Periodic liveness check.
    ///
    /// While already unavailable this is a no-op; it never flips the state back.
    pub async fn check(&self) -> LinkTransition {
        let silent_for = {
            let mut state = self.state.lock();
            let silent_for = state.last_frame_at.elapsed();
            if !state.link_up || silent_for <= self.inactivity_timeout {
                return LinkTransition::Unchanged;
            }
            state.link_up = false;
            silent_for
        };

        error!(
            silent_ms = silent_for.as_millis() as u64,
            "Serial data is not available"
        );
        if self.environment.is_development() {
            info!("Development environment; availability alert suppressed");
        } else if let Err(err) = self.alerting.notify(LINK_DOWN_ALERT).await {
            error!("Failed to send availability alert: {err}");
        }
        LinkTransition::WentDown
    }

    /// Copy of the current state.
    pub fn state(&self) -> WatchdogState {
        *self.state.lock()
    }

    /// Whether the link is currently considered available.
    pub fn is_link_up(&self) -> bool {
        self.state.lock().link_up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingAlerting;

    fn watchdog(env: Environment) -> (LinkWatchdog, Arc<RecordingAlerting>) {
        let alerting = Arc::new(RecordingAlerting::default());
        let config = WatchdogConfig {
            check_interval: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(20),
        };
        (LinkWatchdog::new(&config, env, alerting.clone()), alerting)
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_link_goes_down_once() {
        let (dog, alerts) = watchdog(Environment::Production);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(dog.check().await, LinkTransition::Unchanged);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(dog.check().await, LinkTransition::WentDown);
        assert!(!dog.is_link_up());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(dog.check().await, LinkTransition::Unchanged);
        assert_eq!(alerts.messages(), vec![LINK_DOWN_ALERT.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn frame_restores_link() {
        let (dog, alerts) = watchdog(Environment::Production);
        tokio::time::advance(Duration::from_secs(30)).await;
        dog.check().await;

        assert!(dog.touch());
        assert!(dog.is_link_up());
        assert!(!dog.touch());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(dog.check().await, LinkTransition::WentDown);
        assert_eq!(alerts.messages().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn development_suppresses_alert() {
        let (dog, alerts) = watchdog(Environment::Development);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(dog.check().await, LinkTransition::WentDown);
        assert!(alerts.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn alert_failure_is_swallowed() {
        let (dog, alerts) = watchdog(Environment::Production);
        alerts.trigger_failure();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(dog.check().await, LinkTransition::WentDown);
        assert!(!dog.is_link_up());
    }
}
