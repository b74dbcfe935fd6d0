//! Sliding-window metrics.
//!
//! Four bounded buffers of timestamped samples (requests, pipeline runs,
//! phase executions, errors). Samples older than the retention window are
//! purged; aggregates are derived on demand.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MetricsSettings;

#[derive(Debug, Clone)]
struct Sample<T> {
    at: DateTime<Utc>,
    data: T,
}

#[derive(Debug)]
struct Window<T> {
    samples: VecDeque<Sample<T>>,
    capacity: usize,
}

impl<T> Window<T> {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, at: DateTime<Utc>, data: T) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { at, data });
    }

    fn purge(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.samples.len();
        self.samples.retain(|s| s.at >= cutoff);
        before - self.samples.len()
    }

    fn since(&self, from: DateTime<Utc>) -> impl Iterator<Item = &Sample<T>> {
        self.samples.iter().filter(move |s| s.at >= from)
    }
}

#[derive(Debug, Clone)]
struct Outcome {
    duration_ms: f64,
    success: bool,
}

#[derive(Debug, Clone)]
struct PhaseSample {
    phase: String,
    outcome: Outcome,
}

#[derive(Debug, Clone)]
struct ErrorSample {
    error_type: String,
}

#[derive(Debug)]
struct Buffers {
    requests: Window<Outcome>,
    runs: Window<Outcome>,
    phases: Window<PhaseSample>,
    errors: Window<ErrorSample>,
}

/// Per-phase execution statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub executions: usize,
    pub success_rate_pct: f64,
    pub avg_duration_ms: f64,
}

/// Derived view over the retained samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetrics {
    pub generated_at: DateTime<Utc>,
    pub total_requests: usize,
    /// Requests seen during the last minute
    pub requests_per_minute: f64,
    pub avg_latency_ms: f64,
    pub error_rate_pct: f64,
    pub total_pipeline_runs: usize,
    /// Pipeline runs finished during the last hour
    pub pipeline_runs_per_hour: f64,
    pub pipeline_success_rate_pct: f64,
    pub phases: BTreeMap<String, PhaseStats>,
    pub errors_by_type: BTreeMap<String, usize>,
}

pub struct MetricsCollector {
    buffers: Mutex<Buffers>,
    retention: Duration,
}

impl MetricsCollector {
    pub fn new(settings: &MetricsSettings) -> Self {
        let capacity = settings.max_samples_per_buffer;
        Self {
            buffers: Mutex::new(Buffers {
                requests: Window::new(capacity),
                runs: Window::new(capacity),
                phases: Window::new(capacity),
                errors: Window::new(capacity),
            }),
            retention: Duration::hours(settings.retention_hours),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_request(&self, latency_ms: f64, success: bool) {
        self.record_request_at(Utc::now(), latency_ms, success);
    }

    pub fn record_request_at(&self, at: DateTime<Utc>, latency_ms: f64, success: bool) {
        self.lock().requests.push(
            at,
            Outcome {
                duration_ms: latency_ms,
                success,
            },
        );
    }

    pub fn record_pipeline_run(&self, duration_ms: f64, success: bool) {
        self.record_pipeline_run_at(Utc::now(), duration_ms, success);
    }

    pub fn record_pipeline_run_at(&self, at: DateTime<Utc>, duration_ms: f64, success: bool) {
        self.lock().runs.push(
            at,
            Outcome {
                duration_ms,
                success,
            },
        );
    }

    pub fn record_phase(&self, phase: &str, duration_ms: f64, success: bool) {
        self.record_phase_at(Utc::now(), phase, duration_ms, success);
    }

    pub fn record_phase_at(&self, at: DateTime<Utc>, phase: &str, duration_ms: f64, success: bool) {
        self.lock().phases.push(
            at,
            PhaseSample {
                phase: phase.to_string(),
                outcome: Outcome {
                    duration_ms,
                    success,
                },
            },
        );
    }

    pub fn record_error(&self, error_type: &str) {
        self.record_error_at(Utc::now(), error_type);
    }

    pub fn record_error_at(&self, at: DateTime<Utc>, error_type: &str) {
        self.lock().errors.push(
            at,
            ErrorSample {
                error_type: error_type.to_string(),
            },
        );
    }

    /// Drop samples older than the retention window. Returns how many were removed.
    pub fn purge(&self) -> usize {
        self.purge_before(Utc::now() - self.retention)
    }

    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut b = self.lock();
        let removed = b.requests.purge(cutoff)
            + b.runs.purge(cutoff)
            + b.phases.purge(cutoff)
            + b.errors.purge(cutoff);
        if removed > 0 {
            tracing::debug!(removed, "Purged expired metric samples");
        }
        removed
    }

    pub fn get_aggregated_metrics(&self) -> AggregatedMetrics {
        self.aggregate_at(Utc::now())
    }

    /// Aggregates over samples inside the retention window ending at `now`.
    pub fn aggregate_at(&self, now: DateTime<Utc>) -> AggregatedMetrics {
        let b = self.lock();
        let window_start = now - self.retention;

        let requests: Vec<&Outcome> = b.requests.since(window_start).map(|s| &s.data).collect();
        let last_minute = b.requests.since(now - Duration::minutes(1)).count();
        let failed = requests.iter().filter(|r| !r.success).count();

        let runs: Vec<&Outcome> = b.runs.since(window_start).map(|s| &s.data).collect();
        let runs_last_hour = b.runs.since(now - Duration::hours(1)).count();
        let runs_ok = runs.iter().filter(|r| r.success).count();

        let mut grouped: BTreeMap<String, Vec<&Outcome>> = BTreeMap::new();
        for s in b.phases.since(window_start) {
            grouped.entry(s.data.phase.clone()).or_default().push(&s.data.outcome);
        }
        let phases = grouped
            .into_iter()
            .map(|(phase, outcomes)| {
                let ok = outcomes.iter().filter(|o| o.success).count();
                (
                    phase,
                    PhaseStats {
                        executions: outcomes.len(),
                        success_rate_pct: pct(ok, outcomes.len()),
                        avg_duration_ms: mean(outcomes.iter().map(|o| o.duration_ms)),
                    },
                )
            })
            .collect();

        let mut errors_by_type = BTreeMap::new();
        for s in b.errors.since(window_start) {
            *errors_by_type.entry(s.data.error_type.clone()).or_insert(0) += 1;
        }

        AggregatedMetrics {
            generated_at: now,
            total_requests: requests.len(),
            requests_per_minute: last_minute as f64,
            avg_latency_ms: mean(requests.iter().map(|r| r.duration_ms)),
            error_rate_pct: pct(failed, requests.len()),
            total_pipeline_runs: runs.len(),
            pipeline_runs_per_hour: runs_last_hour as f64,
            pipeline_success_rate_pct: pct(runs_ok, runs.len()),
            phases,
            errors_by_type,
        }
    }

    /// Purge expired samples every `interval` until `cancel` fires.
    pub fn spawn_purge_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.purge();
                    }
                }
            }
        })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        round2(sum / n as f64)
    }
}

fn pct(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        round2(part as f64 * 100.0 / total as f64)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> MetricsCollector {
        MetricsCollector::new(&MetricsSettings::default())
    }

    #[test]
    fn request_aggregates() {
        let m = collector();
        let now = Utc::now();
        m.record_request_at(now - Duration::seconds(10), 100.0, true);
        m.record_request_at(now - Duration::seconds(20), 300.0, false);
        m.record_request_at(now - Duration::minutes(10), 200.0, true);
        m.record_request_at(now - Duration::minutes(30), 400.0, true);

        let agg = m.aggregate_at(now);
        assert_eq!(agg.total_requests, 4);
        assert_eq!(agg.requests_per_minute, 2.0);
        assert_eq!(agg.avg_latency_ms, 250.0);
        assert_eq!(agg.error_rate_pct, 25.0);
    }

    #[test]
    fn phase_and_run_aggregates() {
        let m = collector();
        m.record_phase("fase_1_triaje", 100.0, true);
        m.record_phase("fase_1_triaje", 300.0, false);
        m.record_phase("fase_2_extraccion", 50.0, true);
        m.record_pipeline_run(1000.0, true);
        m.record_pipeline_run(2000.0, false);
        m.record_error("TerminalAPIError");
        m.record_error("TerminalAPIError");

        let agg = m.get_aggregated_metrics();
        let triage = &agg.phases["fase_1_triaje"];
        assert_eq!(triage.executions, 2);
        assert_eq!(triage.success_rate_pct, 50.0);
        assert_eq!(triage.avg_duration_ms, 200.0);
        assert_eq!(agg.phases["fase_2_extraccion"].success_rate_pct, 100.0);
        assert_eq!(agg.pipeline_runs_per_hour, 2.0);
        assert_eq!(agg.pipeline_success_rate_pct, 50.0);
        assert_eq!(agg.errors_by_type["TerminalAPIError"], 2);
    }

    #[test]
    fn empty_collector_reports_zeroes() {
        let agg = collector().get_aggregated_metrics();
        assert_eq!(agg.total_requests, 0);
        assert_eq!(agg.avg_latency_ms, 0.0);
        assert_eq!(agg.error_rate_pct, 0.0);
        assert!(agg.phases.is_empty());
    }

    #[test]
    fn purge_drops_samples_past_retention() {
        let m = collector();
        let now = Utc::now();
        m.record_request_at(now - Duration::hours(25), 10.0, true);
        m.record_error_at(now - Duration::hours(30), "ValidationError");
        m.record_request_at(now, 10.0, true);

        assert_eq!(m.purge(), 2);
        assert_eq!(m.get_aggregated_metrics().total_requests, 1);
    }

    #[test]
    fn buffers_are_bounded() {
        let m = MetricsCollector::new(&MetricsSettings {
            max_samples_per_buffer: 3,
            ..Default::default()
        });
        for i in 0..10 {
            m.record_request(i as f64, true);
        }
        let agg = m.get_aggregated_metrics();
        assert_eq!(agg.total_requests, 3);
        assert_eq!(agg.avg_latency_ms, 8.0);
    }
}
