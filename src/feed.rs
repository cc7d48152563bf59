//! Live fan-out to in-process subscribers.
//!
//! [`LiveFeed`] wraps a `tokio::sync::broadcast` channel. Publishing never
//! blocks: a subscriber that falls more than `capacity` events behind skips
//! ahead and is told how many events it lost.
//!
//! Subscribers are counted through the [`FeedSubscription`] guard. While
//! nobody is listening, [`LiveFeed::publish`] returns without cloning the
//! event.

use crate::measurement_types::{BoardVersion, CalibrationTarget, SensorReading};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, info, warn};

/// An event pushed to live subscribers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum LiveEvent {
    /// An accepted measurement
    Reading(SensorReading),
    /// Calibration confirmed by the device
    Calibration(CalibrationTarget),
    /// Firmware identification reported by the device
    BoardVersion(BoardVersion),
    /// Periodic link/reading snapshot
    Telemetry(TelemetrySnapshot),
}

/// Periodic status snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    /// Whether the watchdog currently considers the link available
    pub link_up: bool,
    /// Seconds since the last decoded frame
    pub seconds_since_last_frame: f64,
    /// Most recent accepted reading, if any
    pub last_reading: Option<SensorReading>,
}

/// Broadcast hub for [`LiveEvent`]s. Cheap to clone.
#[derive(Clone, Debug)]
pub struct LiveFeed {
    sender: broadcast::Sender<LiveEvent>,
    subscribers: Arc<AtomicUsize>,
}

impl LiveFeed {
    /// Create a feed buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start receiving events published from now on.
    pub fn subscribe(&self) -> FeedSubscription {
        let receiver = self.sender.subscribe();
        let previous = self.subscribers.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            info!("Live fan-out active");
        }
        FeedSubscription {
            receiver,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Number of live subscription guards.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Push an event to every subscriber. Returns how many received it.
    pub fn publish(&self, event: LiveEvent) -> usize {
        if self.subscriber_count() == 0 {
            return 0;
        }
        // A subscriber may drop between the check and the send.
        self.sender.send(event).unwrap_or(0)
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct FeedSubscription {
    receiver: broadcast::Receiver<LiveEvent>,
    subscribers: Arc<AtomicUsize>,
}

impl FeedSubscription {
    /// Wait for the next event. `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Live subscriber lagging; events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Live subscriber lagging; events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if self.subscribers.fetch_sub(1, Ordering::SeqCst) == 1 {
            debug!("Last live subscriber left; fan-out idle");
        }
    }
}
