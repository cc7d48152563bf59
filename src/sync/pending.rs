//! Per-command-kind retry bookkeeping.

use std::time::Duration;
use tokio::time::Instant;

/// The two command kinds that wait for a confirming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// `d`, confirmed by an `info` frame
    BuildDateQuery,
    /// `s<V>:<I>:<PF>`, confirmed by a matching `coefficients` frame
    CoefficientProgram,
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::BuildDateQuery => f.write_str("build date query"),
            CommandKind::CoefficientProgram => f.write_str("calibration program"),
        }
    }
}

/// What a retry tick should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-send the same command
    Retry,
    /// Already confirmed; nothing to do
    Confirmed,
    /// The tick belongs to a superseded send
    Stale,
    /// Budget spent; the command is abandoned
    Exhausted,
}

/// State of one outstanding (or finished) command.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand<E> {
    /// When the latest attempt was written
    pub sent_at: Instant,
    /// 1-based attempt counter
    pub attempt: u32,
    /// Set once a correlating frame arrived
    pub confirmed: bool,
    /// What the confirming frame must carry
    pub expected: E,
    /// Set when the retry budget ran out unconfirmed
    pub gave_up: bool,
    /// Identifies the send sequence retry ticks belong to
    pub generation: u64,
}

impl<E> PendingCommand<E> {
    /// A fresh command that has not been written yet.
    pub fn new(expected: E, generation: u64) -> Self {
        Self {
            sent_at: Instant::now(),
            attempt: 0,
            confirmed: false,
            expected,
            gave_up: false,
            generation,
        }
    }

    /// Count one write.
    pub fn record_send(&mut self) {
        self.attempt += 1;
        self.sent_at = Instant::now();
    }

    /// Still waiting for confirmation and not abandoned.
    pub fn is_outstanding(&self) -> bool {
        !self.confirmed && !self.gave_up
    }

    /// Mark confirmed, returning the round-trip time of the latest attempt.
    pub fn confirm(&mut self) -> Duration {
        self.confirmed = true;
        self.sent_at.elapsed()
    }

    /// Decide what a retry tick for `generation` should do.
    pub fn on_retry_tick(&mut self, generation: u64, max_attempts: u32) -> RetryDecision {
        if generation != self.generation {
            RetryDecision::Stale
        } else if self.confirmed {
            RetryDecision::Confirmed
        } else if self.attempt >= max_attempts {
            self.gave_up = true;
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_until_budget_spent() {
        let mut pending = PendingCommand::new((), 7);
        pending.record_send();
        assert_eq!(pending.on_retry_tick(7, 3), RetryDecision::Retry);
        pending.record_send();
        assert_eq!(pending.on_retry_tick(7, 3), RetryDecision::Retry);
        pending.record_send();
        assert_eq!(pending.on_retry_tick(7, 3), RetryDecision::Exhausted);
        assert!(pending.gave_up);
        assert!(!pending.confirmed);
        assert_eq!(pending.attempt, 3);
        assert!(!pending.is_outstanding());
    }

    #[test]
    fn stale_and_confirmed_ticks() {
        let mut pending = PendingCommand::new(1.0_f64, 2);
        pending.record_send();
        assert_eq!(pending.on_retry_tick(1, 3), RetryDecision::Stale);
        pending.confirm();
        assert_eq!(pending.on_retry_tick(2, 3), RetryDecision::Confirmed);
    }

    #[test]
    fn single_attempt_budget() {
        let mut pending = PendingCommand::new((), 0);
        pending.record_send();
        assert_eq!(pending.on_retry_tick(0, 1), RetryDecision::Exhausted);
    }
}
