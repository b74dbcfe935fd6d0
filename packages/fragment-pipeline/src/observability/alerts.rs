//! Alerting on the structured event stream.
//!
//! Rules:
//! - API failure: an ERROR event tagged with a `service` field
//! - High latency: `latency_ms` or `duration_ms` above the threshold
//! - High error rate: share of `outcome = "error"` events in a rolling window
//!
//! Alerts with the same key are throttled to one per `throttle_secs`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AlertSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    ApiFailure,
    HighLatency,
    HighErrorRate,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ApiFailure => "api_failure",
            AlertType::HighLatency => "high_latency",
            AlertType::HighErrorRate => "high_error_rate",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    /// Throttling key, e.g. `api_failure:llm`
    pub key: String,
    pub message: String,
    pub context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Severity of an observed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&tracing::Level> for EventLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::ERROR => EventLevel::Error,
            tracing::Level::WARN => EventLevel::Warn,
            tracing::Level::INFO => EventLevel::Info,
            tracing::Level::DEBUG => EventLevel::Debug,
            tracing::Level::TRACE => EventLevel::Trace,
        }
    }
}

/// One structured log event, as seen by the rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEvent {
    pub at: DateTime<Utc>,
    pub level: EventLevel,
    pub message: String,
    pub fields: Map<String, Value>,
}

impl ObservedEvent {
    pub fn new(level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            message: message.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    fn number_field(&self, key: &str) -> Option<f64> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total: usize,
    pub active: usize,
    pub by_type: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct AlertState {
    alerts: Vec<Alert>,
    last_emitted: HashMap<String, DateTime<Utc>>,
    outcomes: VecDeque<(DateTime<Utc>, bool)>,
}

pub struct AlertManager {
    settings: AlertSettings,
    state: Mutex<AlertState>,
}

impl AlertManager {
    pub fn new(settings: AlertSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(AlertState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AlertState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run every rule against `event`. Returns the alerts actually emitted.
    pub fn observe(&self, event: &ObservedEvent) -> Vec<Alert> {
        let mut state = self.lock();
        let mut candidates = Vec::new();

        if event.level == EventLevel::Error {
            if let Some(service) = event.str_field("service") {
                let mut context = Map::new();
                context.insert("service".into(), service.into());
                for key in ["phase", "error_kind", "attempt"] {
                    if let Some(v) = event.fields.get(key) {
                        context.insert(key.into(), v.clone());
                    }
                }
                candidates.push((
                    AlertType::ApiFailure,
                    AlertSeverity::Critical,
                    format!("{}:{}", AlertType::ApiFailure, service),
                    format!("API failure on {}: {}", service, event.message),
                    context,
                ));
            }
        }

        let latency = event
            .number_field("latency_ms")
            .or_else(|| event.number_field("duration_ms"));
        if let Some(latency) = latency {
            if latency > self.settings.latency_threshold_ms {
                let scope = event
                    .str_field("phase")
                    .or_else(|| event.str_field("service"))
                    .unwrap_or("pipeline")
                    .to_string();
                let mut context = Map::new();
                context.insert("latency_ms".into(), latency.into());
                context.insert("threshold_ms".into(), self.settings.latency_threshold_ms.into());
                candidates.push((
                    AlertType::HighLatency,
                    AlertSeverity::Warning,
                    format!("{}:{}", AlertType::HighLatency, scope),
                    format!(
                        "Latency {:.0}ms above {:.0}ms in {}",
                        latency, self.settings.latency_threshold_ms, scope
                    ),
                    context,
                ));
            }
        }

        if let Some(outcome) = event.str_field("outcome") {
            let window_start = event.at - Duration::seconds(self.settings.error_rate_window_secs);
            state.outcomes.push_back((event.at, outcome != "success"));
            while state.outcomes.front().is_some_and(|(at, _)| *at < window_start) {
                state.outcomes.pop_front();
            }

            let total = state.outcomes.len();
            let failed = state.outcomes.iter().filter(|(_, failed)| *failed).count();
            let rate = failed as f64 * 100.0 / total as f64;
            if total >= self.settings.error_rate_min_samples
                && rate > self.settings.error_rate_threshold_pct
            {
                let mut context = Map::new();
                context.insert("error_rate_pct".into(), ((rate * 100.0).round() / 100.0).into());
                context.insert("samples".into(), total.into());
                candidates.push((
                    AlertType::HighErrorRate,
                    AlertSeverity::Critical,
                    AlertType::HighErrorRate.to_string(),
                    format!(
                        "Error rate {:.1}% above {:.1}% over the last {}s",
                        rate, self.settings.error_rate_threshold_pct, self.settings.error_rate_window_secs
                    ),
                    context,
                ));
            }
        }

        let throttle = Duration::seconds(self.settings.throttle_secs);
        let mut emitted = Vec::new();
        for (alert_type, severity, key, message, context) in candidates {
            if let Some(last) = state.last_emitted.get(&key) {
                if event.at - *last < throttle {
                    continue;
                }
            }
            state.last_emitted.insert(key.clone(), event.at);
            let alert = Alert {
                id: Uuid::new_v4().to_string(),
                alert_type,
                severity,
                key,
                message,
                context,
                created_at: event.at,
                resolved_at: None,
            };
            tracing::warn!(
                alert_id = %alert.id,
                alert_type = %alert.alert_type,
                key = %alert.key,
                "{}",
                alert.message
            );
            state.alerts.push(alert.clone());
            emitted.push(alert);
        }
        emitted
    }

    /// Mark an alert resolved. False when unknown or already resolved.
    pub fn resolve(&self, alert_id: &str) -> bool {
        let mut state = self.lock();
        match state.alerts.iter_mut().find(|a| a.id == alert_id && a.is_active()) {
            Some(alert) => {
                alert.resolved_at = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Alerts newest first.
    pub fn list(&self, active_only: bool) -> Vec<Alert> {
        self.lock()
            .alerts
            .iter()
            .rev()
            .filter(|a| !active_only || a.is_active())
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> AlertSummary {
        let state = self.lock();
        let mut by_type = BTreeMap::new();
        for alert in &state.alerts {
            *by_type.entry(alert.alert_type.to_string()).or_insert(0) += 1;
        }
        AlertSummary {
            total: state.alerts.len(),
            active: state.alerts.iter().filter(|a| a.is_active()).count(),
            by_type,
        }
    }

    /// Drop alert history older than the retention window.
    pub fn purge(&self) -> usize {
        self.purge_before(Utc::now() - Duration::hours(self.settings.retention_hours))
    }

    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.lock();
        let before = state.alerts.len();
        state.alerts.retain(|a| a.created_at >= cutoff);
        state.last_emitted.retain(|_, at| *at >= cutoff);
        before - state.alerts.len()
    }

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

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AlertManager {
        AlertManager::new(AlertSettings::default())
    }

    fn api_error(at: DateTime<Utc>) -> ObservedEvent {
        ObservedEvent::new(EventLevel::Error, "LLM call failed")
            .with_field("service", "llm")
            .with_field("phase", "fase_2_extraccion")
            .at(at)
    }

    #[test]
    fn api_failures_are_throttled_per_service() {
        let m = manager();
        let t0 = Utc::now();

        assert_eq!(m.observe(&api_error(t0)).len(), 1);
        assert!(m.observe(&api_error(t0 + Duration::seconds(30))).is_empty());
        assert_eq!(m.observe(&api_error(t0 + Duration::seconds(61))).len(), 1);

        let db = ObservedEvent::new(EventLevel::Error, "rpc failed")
            .with_field("service", "db_rpc")
            .at(t0 + Duration::seconds(1));
        assert_eq!(m.observe(&db)[0].key, "api_failure:db_rpc");
        assert_eq!(m.summary().by_type["api_failure"], 3);
    }

    #[test]
    fn warnings_with_service_do_not_alert() {
        let m = manager();
        let retry = ObservedEvent::new(EventLevel::Warn, "retrying").with_field("service", "llm");
        assert!(m.observe(&retry).is_empty());
    }

    #[test]
    fn latency_above_threshold() {
        let m = manager();
        let slow = ObservedEvent::new(EventLevel::Info, "Fragment run finished")
            .with_field("duration_ms", 7500u64);
        let fast = ObservedEvent::new(EventLevel::Info, "Fragment run finished")
            .with_field("duration_ms", 120u64);

        assert!(m.observe(&fast).is_empty());
        let alerts = m.observe(&slow);
        assert_eq!(alerts[0].alert_type, AlertType::HighLatency);
        assert_eq!(alerts[0].key, "high_latency:pipeline");
    }

    #[test]
    fn error_rate_needs_enough_samples() {
        let m = manager();
        let t0 = Utc::now();
        let outcome = |i: i64, o: &str| {
            ObservedEvent::new(EventLevel::Info, "run")
                .with_field("outcome", o)
                .at(t0 + Duration::seconds(i))
        };

        for i in 0..8 {
            assert!(m.observe(&outcome(i, "error")).is_empty());
        }
        m.observe(&outcome(8, "success"));
        let alerts = m.observe(&outcome(9, "error"));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::HighErrorRate);
        assert_eq!(alerts[0].context["samples"], 10);
    }

    #[test]
    fn resolve_and_list() {
        let m = manager();
        let alert = m.observe(&api_error(Utc::now())).remove(0);

        assert_eq!(m.list(true).len(), 1);
        assert!(m.resolve(&alert.id));
        assert!(!m.resolve(&alert.id));
        assert!(m.list(true).is_empty());
        assert_eq!(m.list(false).len(), 1);

        let summary = m.summary();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.active, 0);
    }

    #[test]
    fn purge_drops_old_history() {
        let m = manager();
        m.observe(&api_error(Utc::now() - Duration::hours(25)));
        m.observe(&api_error(Utc::now()));
        assert_eq!(m.purge(), 1);
        assert_eq!(m.list(false).len(), 1);
    }
}
