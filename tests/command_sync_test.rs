//! Command/confirm/retry protocol against a recording link.
//!
//! Time is paused in every test, so retry delays are deterministic.

use power_monitor::config::ProtocolConfig;
use power_monitor::feed::{LiveEvent, LiveFeed};
use power_monitor::measurement_types::CalibrationTarget;
use power_monitor::mock::RecordingLink;
use power_monitor::storage::{MemoryStorage, COEFFICIENTS_KEY};
use power_monitor::sync::CommandSynchronizer;
use std::sync::Arc;
use std::time::Duration;

const RETRY_DELAY: Duration = Duration::from_secs(2);

struct Harness {
    sync: CommandSynchronizer,
    link: Arc<RecordingLink>,
    storage: Arc<MemoryStorage>,
    feed: LiveFeed,
}

fn harness(target: CalibrationTarget) -> Harness {
    let config = ProtocolConfig {
        retry_delay: RETRY_DELAY,
        max_attempts: 3,
        max_corrective_resends: 3,
        mailbox_capacity: 16,
    };
    let link = Arc::new(RecordingLink::new());
    let storage = Arc::new(MemoryStorage::new());
    let feed = LiveFeed::new(16);
    let (sync, _task) = CommandSynchronizer::spawn(
        &config,
        target,
        link.clone(),
        storage.clone(),
        feed.clone(),
    );
    Harness {
        sync,
        link,
        storage,
        feed,
    }
}

fn unit_target() -> CalibrationTarget {
    CalibrationTarget::new(1.0, 1.0, 1.0)
}

#[tokio::test(start_paused = true)]
async fn unanswered_query_is_sent_exactly_max_attempts_times() {
    let h = harness(unit_target());

    h.sync.query_build_date().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.link.writes(), vec!["d\n".to_string(); 3]);
    let times = h.link.write_times();
    assert_eq!(times[1] - times[0], RETRY_DELAY);
    assert_eq!(times[2] - times[1], RETRY_DELAY);

    let snapshot = h.sync.snapshot().await.unwrap();
    let pending = snapshot.build_date.unwrap();
    assert_eq!(pending.attempt, 3);
    assert!(pending.gave_up);
    assert!(!pending.confirmed);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_program_is_sent_exactly_max_attempts_times() {
    let h = harness(unit_target());

    h.sync.program_calibration(None).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.link.writes(), vec!["s1:1:1\n".to_string(); 3]);
    let times = h.link.write_times();
    assert_eq!(times[1] - times[0], RETRY_DELAY);
    assert_eq!(times[2] - times[1], RETRY_DELAY);

    let snapshot = h.sync.snapshot().await.unwrap();
    let program = snapshot.program.unwrap();
    assert_eq!(program.attempt, 3);
    assert!(program.gave_up);
    assert!(!program.confirmed);
    assert!(snapshot.confirmed_calibration.is_none());
    assert!(h.storage.setting(COEFFICIENTS_KEY).is_none());
}

#[tokio::test(start_paused = true)]
async fn confirmation_stops_further_retries() {
    let h = harness(unit_target());

    h.sync.program_calibration(None).await;
    tokio::time::sleep(RETRY_DELAY + Duration::from_millis(100)).await;
    assert_eq!(h.link.writes().len(), 2);

    h.sync.handle_coefficients(unit_target()).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(h.link.writes(), vec!["s1:1:1\n".to_string(); 2]);
    let snapshot = h.sync.snapshot().await.unwrap();
    let program = snapshot.program.unwrap();
    assert!(program.confirmed);
    assert_eq!(program.attempt, 2);
    assert_eq!(snapshot.confirmed_calibration, Some(unit_target()));
}

#[tokio::test(start_paused = true)]
async fn any_single_field_mismatch_triggers_a_corrective_resend() {
    let readbacks = [
        CalibrationTarget::new(1.1, 1.0, 1.0),
        CalibrationTarget::new(1.0, 1.1, 1.0),
        CalibrationTarget::new(1.0, 1.0, 1.1),
    ];

    for readback in readbacks {
        let h = harness(unit_target());
        h.sync.program_calibration(None).await;
        h.sync.handle_coefficients(readback).await;

        let snapshot = h.sync.snapshot().await.unwrap();
        assert_eq!(h.link.writes(), vec!["s1:1:1\n".to_string(); 2]);
        assert_eq!(snapshot.corrective_resends, 1);
        let program = snapshot.program.unwrap();
        assert!(!program.confirmed);
        assert_eq!(program.attempt, 1);
        assert_eq!(program.expected, unit_target());
        assert!(h.storage.setting(COEFFICIENTS_KEY).is_none());
    }
}

#[tokio::test(start_paused = true)]
async fn readback_of_superseded_target_is_a_mismatch() {
    let h = harness(unit_target());
    let first = CalibrationTarget::new(1.02, 0.98, 1.0);
    let second = CalibrationTarget::new(1.05, 0.97, 0.99);

    h.sync.program_calibration(Some(first)).await;
    h.sync.program_calibration(Some(second)).await;
    h.sync.handle_coefficients(first).await;

    let snapshot = h.sync.snapshot().await.unwrap();
    assert_eq!(
        h.link.writes(),
        vec![
            "s1.02:0.98:1\n".to_string(),
            "s1.05:0.97:0.99\n".to_string(),
            "s1.05:0.97:0.99\n".to_string(),
        ]
    );
    assert_eq!(snapshot.target, second);
    assert_eq!(snapshot.corrective_resends, 1);
    assert!(snapshot.confirmed_calibration.is_none());
}

#[tokio::test(start_paused = true)]
async fn corrective_resends_are_capped() {
    let h = harness(unit_target());
    let wrong = CalibrationTarget::new(2.0, 2.0, 2.0);

    h.sync.program_calibration(None).await;
    for _ in 0..6 {
        h.sync.handle_coefficients(wrong).await;
    }

    let snapshot = h.sync.snapshot().await.unwrap();
    // Initial program plus three corrective re-sends.
    assert_eq!(h.link.writes().len(), 4);
    assert_eq!(snapshot.corrective_resends, 3);
}

#[tokio::test(start_paused = true)]
async fn unsolicited_matching_readbacks_are_each_persisted_and_published() {
    let h = harness(unit_target());
    let mut subscriber = h.feed.subscribe();

    h.sync.handle_coefficients(unit_target()).await;
    h.sync.handle_coefficients(unit_target()).await;
    h.sync.snapshot().await.unwrap();

    assert!(h.link.writes().is_empty());
    assert_eq!(h.storage.stats().settings_written, 2);
    assert_eq!(
        subscriber.try_recv(),
        Some(LiveEvent::Calibration(unit_target()))
    );
    assert_eq!(
        subscriber.try_recv(),
        Some(LiveEvent::Calibration(unit_target()))
    );
    assert_eq!(subscriber.try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn stale_retry_after_reissue_does_not_double_send() {
    let h = harness(unit_target());

    h.sync.query_build_date().await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.sync.query_build_date().await;
    // Only the re-issued query's timer is live; one retry at t = 3s.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let snapshot = h.sync.snapshot().await.unwrap();
    assert_eq!(h.link.writes().len(), 3);
    assert_eq!(snapshot.build_date.unwrap().attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn closed_link_drops_writes_but_keeps_counting_attempts() {
    let h = harness(unit_target());
    h.link.set_open(false);

    h.sync.query_build_date().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let snapshot = h.sync.snapshot().await.unwrap();
    assert!(h.link.writes().is_empty());
    assert!(snapshot.build_date.unwrap().gave_up);
}
