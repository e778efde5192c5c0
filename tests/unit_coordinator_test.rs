// tests/unit_coordinator_test.rs

use shunt::core::stats::LoadGauge;
use shunt::server::coordinator::{WaitGroup, evaluate_rebalance};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_wait_group_releases_at_zero() {
    let group = Arc::new(WaitGroup::new());
    group.add(3);
    let worker_side = Arc::clone(&group);
    let handle = std::thread::spawn(move || {
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(10));
            worker_side.done();
        }
    });
    group.wait();
    handle.join().expect("signaller finishes");
}

#[test]
fn test_wait_group_timeout_reports_pending_work() {
    let group = WaitGroup::new();
    group.add(1);
    assert!(!group.wait_timeout(Duration::from_millis(50)));
    group.done();
    assert!(group.wait_timeout(Duration::from_millis(50)));
}

#[test]
fn test_wait_group_with_nothing_pending_returns_immediately() {
    let group = WaitGroup::new();
    group.wait();
    assert!(group.wait_timeout(Duration::from_millis(1)));
}

#[test]
fn test_rebalance_needs_two_workers() {
    assert!(evaluate_rebalance(&[], 20).is_none());
    assert!(evaluate_rebalance(&[90], 20).is_none());
}

#[test]
fn test_rebalance_below_threshold_is_noop() {
    assert!(evaluate_rebalance(&[50, 40, 45], 20).is_none());
}

#[test]
fn test_rebalance_picks_busiest_and_quietest() {
    let (busiest, quietest, diff) =
        evaluate_rebalance(&[30, 80, 10, 55], 20).expect("spread exceeds threshold");
    assert_eq!(busiest, 1);
    assert_eq!(quietest, 2);
    assert_eq!(diff, 70);
}

#[test]
fn test_load_gauge_tracks_windows() {
    let gauge = LoadGauge::new();
    gauge.record_window(80);
    let reading = gauge.read();
    assert_eq!(reading.one_sec, 80);
    assert!(reading.one_min <= 80);

    // Values past 100 are clamped; the gauge reports percentages.
    gauge.record_window(500);
    assert_eq!(gauge.read().one_sec, 100);
}

#[test]
fn test_load_gauge_longer_horizons_smooth() {
    let gauge = LoadGauge::new();
    for _ in 0..120 {
        gauge.record_window(60);
    }
    let reading = gauge.read();
    assert_eq!(reading.one_sec, 60);
    assert!(reading.one_min > 30, "a sustained load converges the minute average");
    assert!(reading.one_hour < reading.one_min);
}
