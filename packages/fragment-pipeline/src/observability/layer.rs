//! Bridges `tracing` events into the [`AlertManager`].

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use super::alerts::{AlertManager, EventLevel, ObservedEvent};

/// Events emitted by the observability module itself are ignored so an
/// alert log line can never trigger another alert.
const SELF_TARGET: &str = "fragment_pipeline::observability";

pub struct AlertLayer {
    manager: Arc<AlertManager>,
}

impl AlertLayer {
    pub fn new(manager: Arc<AlertManager>) -> Self {
        Self { manager }
    }
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(SELF_TARGET) {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut observed = ObservedEvent::new(EventLevel::from(metadata.level()), visitor.message);
        observed.fields = visitor.fields;
        self.manager.observe(&observed);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), Value::String(rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertSettings;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn error_events_with_service_raise_alerts() {
        let manager = Arc::new(AlertManager::new(AlertSettings::default()));
        let subscriber = tracing_subscriber::registry().with(AlertLayer::new(manager.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(service = "llm", phase = "fase_1_triaje", attempt = 3u32, "LLM call failed");
            tracing::info!(duration_ms = 9000u64, outcome = "success", "Fragment run finished");
        });

        let alerts = manager.list(false);
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().any(|a| a.key == "api_failure:llm"));
        assert!(alerts.iter().any(|a| a.key == "high_latency:pipeline"));
    }

    #[test]
    fn display_fields_are_recorded_as_strings() {
        let manager = Arc::new(AlertManager::new(AlertSettings::default()));
        let subscriber = tracing_subscriber::registry().with(AlertLayer::new(manager.clone()));
        let service = crate::retry::Service::DbRpc;

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(service = %service, "RPC failed");
        });

        assert_eq!(manager.list(true)[0].key, "api_failure:db_rpc");
    }
}
