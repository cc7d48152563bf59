//! Outbound alert collaborator.

use crate::error::AppResult;
use async_trait::async_trait;
use tracing::warn;

/// Receives operator-facing alerts. Delivery is best effort.
#[async_trait]
pub trait Alerting: Send + Sync {
    /// Deliver one alert message.
    async fn notify(&self, message: &str) -> AppResult<()>;
}

/// Writes alerts to the log. Default sink when no transport is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerting;

#[async_trait]
impl Alerting for LogAlerting {
    async fn notify(&self, message: &str) -> AppResult<()> {
        warn!(alert = true, "{message}");
        Ok(())
    }
}
