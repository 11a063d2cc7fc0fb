//! Statistics Module Tests
//!
//! Exercises event recording, rollup math, hourly bucketing, flush
//! transactions, and the per-day registry.

use super::aggregator::{iso_day, StatsRegistry};
use super::types::CompletionRecord;
use crate::runtime::clock::ManualClock;
use crate::runtime::ids::{ServerId, TaskId};
use crate::runtime::storage::MemoryBackend;
use std::sync::Arc;

// 2024-01-06 09:30:00 UTC
const JAN_6_0930: u64 = 1_704_533_400_000;

fn registry_at(now_ms: u64) -> (Arc<ManualClock>, Arc<MemoryBackend>, Arc<StatsRegistry>) {
    let clock = ManualClock::new(now_ms);
    let backend = MemoryBackend::new();
    let stats = StatsRegistry::new(clock.clone(), backend.clone());
    (clock, backend, stats)
}

fn complete(server: Option<&str>, success: bool, duration_ms: u64, retries: u32) -> CompletionRecord {
    CompletionRecord {
        task_id: TaskId::new(),
        server_id: server.map(|s| ServerId(s.to_string())),
        success,
        duration_ms,
        retries,
    }
}

#[test]
fn iso_day_formats_utc_dates() {
    assert_eq!(iso_day(JAN_6_0930), "2024-01-06");
    assert_eq!(iso_day(0), "1970-01-01");
}

#[tokio::test]
async fn start_and_complete_update_counters() {
    let (_clock, _backend, stats) = registry_at(JAN_6_0930);
    let day = stats.today();

    day.record_task_start(TaskId::new(), ServerId("s1".to_string()))
        .await;
    day.record_task_start(TaskId::new(), ServerId("s1".to_string()))
        .await;
    day.record_task_complete(complete(Some("s1"), true, 400, 0))
        .await;
    day.record_task_complete(complete(Some("s1"), false, 100, 2))
        .await;

    let snapshot = day.get_stats().await;
    assert_eq!(snapshot.totals.total_tasks, 2);
    assert_eq!(snapshot.totals.pending_tasks, 0);
    assert_eq!(snapshot.totals.successful_tasks, 1);
    assert_eq!(snapshot.totals.failed_tasks, 1);
    assert_eq!(snapshot.totals.retried_tasks, 1);
    assert_eq!(snapshot.totals.total_success_duration_ms, 400);
    assert!((snapshot.totals.average_processing_time_ms - 400.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn pending_never_goes_negative() {
    let (_clock, _backend, stats) = registry_at(JAN_6_0930);
    let day = stats.today();

    // A completion with no matching start (e.g. recovery) floors at zero.
    day.record_task_complete(complete(Some("s1"), false, 10, 0))
        .await;

    let snapshot = day.get_stats().await;
    assert_eq!(snapshot.totals.pending_tasks, 0);
    assert_eq!(snapshot.totals.failed_tasks, 1);
}

#[tokio::test]
async fn per_server_rollup_tracks_rates() {
    let (_clock, _backend, stats) = registry_at(JAN_6_0930);
    let day = stats.today();

    day.record_task_complete(complete(Some("s1"), true, 200, 0))
        .await;
    day.record_task_complete(complete(Some("s1"), true, 400, 0))
        .await;
    day.record_task_complete(complete(Some("s1"), false, 600, 1))
        .await;

    let record = day.get_server_stats(&ServerId("s1".to_string())).await;
    assert_eq!(record.tasks_processed, 3);
    assert_eq!(record.successes, 2);
    assert_eq!(record.failures, 1);
    assert_eq!(record.total_duration_ms, 1_200);
    assert!((record.success_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!((record.average_response_time_ms - 400.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn unknown_server_returns_empty_record() {
    let (_clock, _backend, stats) = registry_at(JAN_6_0930);
    let day = stats.today();

    let record = day.get_server_stats(&ServerId("ghost".to_string())).await;
    assert_eq!(record.tasks_processed, 0);
    assert_eq!(record.last_active, 0);
}

#[tokio::test]
async fn completion_without_server_skips_server_rollup() {
    let (_clock, _backend, stats) = registry_at(JAN_6_0930);
    let day = stats.today();

    // Tasks that failed before assignment have no server.
    day.record_task_complete(complete(None, false, 0, 0)).await;

    let snapshot = day.get_stats().await;
    assert_eq!(snapshot.totals.failed_tasks, 1);
    assert!(snapshot.top_servers.is_empty());
}

#[tokio::test]
async fn hourly_report_buckets_by_utc_hour() {
    let (clock, _backend, stats) = registry_at(JAN_6_0930);
    let day = stats.today();

    day.record_task_start(TaskId::new(), ServerId("s1".to_string()))
        .await;
    day.record_task_complete(complete(Some("s1"), true, 50, 0))
        .await;

    // Move to 11:30 and record another completion.
    clock.advance(2 * 3_600_000);
    day.record_task_complete(complete(Some("s1"), false, 50, 0))
        .await;

    let report = day.get_hourly_report().await;
    assert_eq!(report.len(), 24);
    assert_eq!(report[9].period, "9:00-9:59");
    assert_eq!(report[9].tasks, 1);
    assert_eq!(report[9].completed, 1);
    assert_eq!(report[11].failed, 1);
    assert_eq!(report[10].tasks, 0);
}

#[tokio::test]
async fn top_servers_ranks_by_tasks_processed() {
    let (_clock, _backend, stats) = registry_at(JAN_6_0930);
    let day = stats.today();

    for _ in 0..3 {
        day.record_task_complete(complete(Some("busy"), true, 10, 0))
            .await;
    }
    day.record_task_complete(complete(Some("quiet"), true, 10, 0))
        .await;

    let snapshot = day.get_stats().await;
    assert_eq!(snapshot.top_servers[0].server_id, "busy");
    assert_eq!(snapshot.top_servers[0].tasks_processed, 3);
    assert_eq!(snapshot.top_servers[1].server_id, "quiet");
}

#[tokio::test]
async fn flush_persists_rollups_and_events() {
    let (_clock, backend, stats) = registry_at(JAN_6_0930);
    let day = stats.today();

    day.record_task_start(TaskId::new(), ServerId("s1".to_string()))
        .await;
    day.record_task_complete(complete(Some("s1"), true, 75, 0))
        .await;
    day.flush().await.unwrap();

    let store = backend.namespace("stats:2024-01-06");
    let persisted = store.get("stats").expect("counters persisted");
    assert_eq!(persisted["totalTasks"], 1);
    assert_eq!(persisted["successfulTasks"], 1);

    let events = store
        .get(&format!("events-{}", JAN_6_0930))
        .expect("event batch persisted");
    assert_eq!(events.as_array().unwrap().len(), 2);

    // A second flush with an empty buffer re-persists counters but writes
    // no new event batch.
    day.flush().await.unwrap();
    assert!(store.get("stats").is_some());
}

#[tokio::test]
async fn counters_survive_aggregator_restart() {
    let clock = ManualClock::new(JAN_6_0930);
    let backend = MemoryBackend::new();

    {
        let stats = StatsRegistry::new(clock.clone(), backend.clone());
        let day = stats.today();
        day.record_task_complete(complete(Some("s1"), true, 30, 0))
            .await;
        day.flush().await.unwrap();
    }

    // A fresh registry over the same backend recovers the flushed rollups.
    let stats = StatsRegistry::new(clock.clone(), backend.clone());
    let snapshot = stats.today().get_stats().await;
    assert_eq!(snapshot.totals.successful_tasks, 1);
    assert_eq!(snapshot.top_servers[0].server_id, "s1");
}

#[tokio::test]
async fn registry_returns_same_actor_per_day() {
    let (_clock, _backend, stats) = registry_at(JAN_6_0930);

    let a = stats.for_day("2024-01-06");
    let b = stats.for_day("2024-01-06");
    let other = stats.for_day("2024-01-07");

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &other));
    assert_eq!(other.day(), "2024-01-07");
}
