use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::types::*;
use crate::runtime::clock::Clock;
use crate::runtime::ids::{ServerId, TaskId};
use crate::runtime::storage::{get_as, MemoryBackend, Storage};

const FLUSH_INTERVAL: Duration = Duration::from_millis(10_000);
const FLUSH_THRESHOLD: usize = 1_000;

/// Per-day statistics actor. All operations serialize through the state
/// mutex; recording is cheap and flushing happens on a timer or when the
/// buffer crosses the threshold.
pub struct StatsAggregator {
    day: String,
    clock: Arc<dyn Clock>,
    store: Arc<dyn Storage>,
    state: Mutex<AggregatorState>,
}

struct AggregatorState {
    buffer: Vec<TaskEvent>,
    rollup: DayRollup,
    last_flush_hour: Option<u32>,
}

impl StatsAggregator {
    fn new(day: String, clock: Arc<dyn Clock>, store: Arc<dyn Storage>) -> Arc<Self> {
        // Counters are re-persisted at every flush, so whatever is in
        // storage is the recovery point.
        let rollup = DayRollup {
            stats: get_as(store.as_ref(), "stats").unwrap_or_default(),
            server_stats: get_as(store.as_ref(), "serverStats").unwrap_or_default(),
            hourly: get_as(store.as_ref(), "hourlyStats").unwrap_or_default(),
        };

        Arc::new(Self {
            day,
            clock,
            store,
            state: Mutex::new(AggregatorState {
                buffer: Vec::new(),
                rollup,
                last_flush_hour: None,
            }),
        })
    }

    pub fn day(&self) -> &str {
        &self.day
    }

    pub async fn record_task_start(&self, task_id: TaskId, server_id: ServerId) {
        let now = self.clock.now_ms();
        let hour = hour_of(now);

        let mut state = self.state.lock().await;
        state.buffer.push(TaskEvent::Start {
            task_id,
            server_id,
            timestamp: now,
        });

        state.rollup.stats.total_tasks += 1;
        state.rollup.stats.pending_tasks += 1;
        state.rollup.hourly.entry(hour).or_default().tasks += 1;

        if state.buffer.len() >= FLUSH_THRESHOLD {
            self.flush_locked(&mut state);
        }
    }

    pub async fn record_task_complete(&self, record: CompletionRecord) {
        let now = self.clock.now_ms();
        let hour = hour_of(now);

        let mut state = self.state.lock().await;
        state.buffer.push(TaskEvent::Complete {
            task_id: record.task_id,
            server_id: record.server_id.clone(),
            success: record.success,
            duration_ms: record.duration_ms,
            retries: record.retries,
            timestamp: now,
        });

        let stats = &mut state.rollup.stats;
        stats.pending_tasks = stats.pending_tasks.saturating_sub(1);
        if record.success {
            stats.successful_tasks += 1;
            stats.total_success_duration_ms += record.duration_ms;
        } else {
            stats.failed_tasks += 1;
        }
        if record.retries > 0 {
            stats.retried_tasks += 1;
        }
        if stats.successful_tasks > 0 {
            stats.average_processing_time_ms =
                stats.total_success_duration_ms as f64 / stats.successful_tasks as f64;
        }

        if let Some(server_id) = &record.server_id {
            let entry = state
                .rollup
                .server_stats
                .entry(server_id.0.clone())
                .or_default();
            entry.tasks_processed += 1;
            if record.success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
            entry.total_duration_ms += record.duration_ms;
            entry.success_rate = entry.successes as f64 / entry.tasks_processed as f64;
            entry.average_response_time_ms =
                entry.total_duration_ms as f64 / entry.tasks_processed as f64;
            entry.last_active = now;
        }

        let bucket = state.rollup.hourly.entry(hour).or_default();
        if record.success {
            bucket.completed += 1;
        } else {
            bucket.failed += 1;
        }

        if state.buffer.len() >= FLUSH_THRESHOLD {
            self.flush_locked(&mut state);
        }
    }

    pub async fn get_stats(&self) -> Statistics {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state);

        let mut top: Vec<TopServer> = state
            .rollup
            .server_stats
            .iter()
            .map(|(id, record)| TopServer {
                server_id: id.clone(),
                tasks_processed: record.tasks_processed,
            })
            .collect();
        top.sort_by(|a, b| b.tasks_processed.cmp(&a.tasks_processed));
        top.truncate(5);

        Statistics {
            totals: state.rollup.stats.clone(),
            top_servers: top,
            hourly_trend: hourly_report(&state.rollup.hourly),
        }
    }

    /// Returns the named server's record, or a zeroed record if the server
    /// did nothing today.
    pub async fn get_server_stats(&self, server_id: &ServerId) -> ServerStatistics {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state);

        state
            .rollup
            .server_stats
            .get(&server_id.0)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_hourly_report(&self) -> Vec<HourlyReport> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state);
        hourly_report(&state.rollup.hourly)
    }

    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state);
        Ok(())
    }

    /// Drains the buffer and re-persists every rollup in one transaction.
    /// On failure the buffer is kept so the next flush retries.
    fn flush_locked(&self, state: &mut AggregatorState) {
        let now = self.clock.now_ms();

        let mut entries = vec![
            ("stats".to_string(), json!(state.rollup.stats)),
            ("serverStats".to_string(), json!(state.rollup.server_stats)),
            ("hourlyStats".to_string(), json!(state.rollup.hourly)),
        ];
        if !state.buffer.is_empty() {
            entries.push((format!("events-{}", now), json!(state.buffer)));
        }

        match self.store.put_many(entries) {
            Ok(()) => {
                tracing::debug!(
                    "stats[{}] flushed {} buffered events",
                    self.day,
                    state.buffer.len()
                );
                state.buffer.clear();
            }
            Err(err) => {
                tracing::warn!("stats[{}] flush failed, will retry: {}", self.day, err);
            }
        }
    }

    /// Timer body: flush, and clear the hourly map the first time a flush
    /// lands past midnight.
    async fn run_flush_cycle(&self) {
        let hour = hour_of(self.clock.now_ms());

        let mut state = self.state.lock().await;
        self.flush_locked(&mut state);

        if hour == 0 && state.last_flush_hour.map(|h| h != 0).unwrap_or(false) {
            tracing::info!("stats[{}] hour rolled past midnight, resetting hourly buckets", self.day);
            state.rollup.hourly.clear();
        }
        state.last_flush_hour = Some(hour);
    }
}

fn hour_of(timestamp_ms: u64) -> u32 {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms as i64)
        .map(|dt| dt.hour())
        .unwrap_or(0)
}

fn hourly_report(hourly: &BTreeMap<u32, HourlyStats>) -> Vec<HourlyReport> {
    (0..24)
        .map(|hour| {
            let bucket = hourly.get(&hour).cloned().unwrap_or_default();
            HourlyReport {
                period: format!("{}:00-{}:59", hour, hour),
                tasks: bucket.tasks,
                completed: bucket.completed,
                failed: bucket.failed,
            }
        })
        .collect()
}

/// Lookup table of per-day aggregators. `for_day` returns the existing actor
/// or creates one on demand, spawning its flush loop.
pub struct StatsRegistry {
    clock: Arc<dyn Clock>,
    backend: Arc<MemoryBackend>,
    days: DashMap<String, Arc<StatsAggregator>>,
}

impl StatsRegistry {
    pub fn new(clock: Arc<dyn Clock>, backend: Arc<MemoryBackend>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            backend,
            days: DashMap::new(),
        })
    }

    pub fn for_day(&self, day: &str) -> Arc<StatsAggregator> {
        if let Some(existing) = self.days.get(day) {
            return existing.clone();
        }

        let aggregator = StatsAggregator::new(
            day.to_string(),
            self.clock.clone(),
            self.backend.namespace(&format!("stats:{}", day)),
        );
        self.days.insert(day.to_string(), aggregator.clone());

        let looper = aggregator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                interval.tick().await;
                looper.run_flush_cycle().await;
            }
        });

        tracing::info!("stats aggregator started for {}", day);
        aggregator
    }

    /// The aggregator for the current calendar day (UTC).
    pub fn today(&self) -> Arc<StatsAggregator> {
        self.for_day(&iso_day(self.clock.now_ms()))
    }
}

pub fn iso_day(timestamp_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms as i64)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".to_string())
}
