//! Global subscriber installation. Kept in its own test binary because the
//! subscriber can only be set once per process.

use std::sync::Arc;

use fragment_pipeline::config::AlertSettings;
use fragment_pipeline::observability::{AlertManager, AlertType};
use fragment_pipeline::telemetry::init_tracing;

#[test]
fn installed_subscriber_feeds_the_alert_manager() {
    let alerts = Arc::new(AlertManager::new(AlertSettings::default()));
    init_tracing(Some("info"), Some(alerts.clone())).unwrap();

    tracing::error!(service = "db_rpc", phase = "persistencia", "External call failed");

    let active = alerts.list(true);
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].alert_type, AlertType::ApiFailure);

    // A second global subscriber is refused
    assert!(init_tracing(None, None).is_err());
}
