//! Logging setup.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ConfigError;
use crate::observability::{AlertLayer, AlertManager};

pub const DEFAULT_FILTER: &str = "info,fragment_pipeline=debug";

/// Install the global subscriber: `RUST_LOG` (or `filter`, or
/// [`DEFAULT_FILTER`]), a fmt layer, and the alert bridge when a manager is
/// given. Fails if a global subscriber is already set.
pub fn init_tracing(filter: Option<&str>, alerts: Option<Arc<AlertManager>>) -> Result<(), ConfigError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.unwrap_or(DEFAULT_FILTER).into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .with(alerts.map(AlertLayer::new))
        .try_init()
        .map_err(|e| ConfigError::Telemetry(e.to_string()))
}
