//! Metrics and alerting.
//!
//! Both services are independently locked and never block each other or
//! the job tracker.

pub mod alerts;
pub mod layer;
pub mod metrics;

pub use alerts::{Alert, AlertManager, AlertSeverity, AlertSummary, AlertType, EventLevel, ObservedEvent};
pub use layer::AlertLayer;
pub use metrics::{AggregatedMetrics, MetricsCollector, PhaseStats};
