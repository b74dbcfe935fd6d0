//! Shared services and their background maintenance loops.

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::jobs::JobTracker;
use crate::observability::{AlertManager, MetricsCollector};

/// Job tracker, metrics collector and alert manager, created on first use.
///
/// Hand out `Arc`s from here instead of reaching for globals. `start`
/// spawns the cleanup loops; `shutdown` cancels them and waits for them.
pub struct Services {
    config: Arc<PipelineConfig>,
    jobs: OnceLock<Arc<JobTracker>>,
    metrics: OnceLock<Arc<MetricsCollector>>,
    alerts: OnceLock<Arc<AlertManager>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Services {
    /// Services without maintenance loops.
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            jobs: OnceLock::new(),
            metrics: OnceLock::new(),
            alerts: OnceLock::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Services with job cleanup, metric purge and alert purge loops
    /// running. Must be called from within a Tokio runtime.
    pub fn start(config: PipelineConfig) -> Arc<Self> {
        let services = Arc::new(Self::new(config));
        let jobs = &services.config.jobs;
        let handles = vec![
            services.jobs().spawn_cleanup_loop(
                Duration::from_secs(jobs.cleanup_interval_secs.max(1)),
                jobs.retention_minutes,
                services.cancel.child_token(),
            ),
            services.metrics().spawn_purge_loop(
                Duration::from_secs(services.config.metrics.purge_interval_secs.max(1)),
                services.cancel.child_token(),
            ),
            services.alerts().spawn_purge_loop(
                Duration::from_secs(services.config.metrics.purge_interval_secs.max(1)),
                services.cancel.child_token(),
            ),
        ];
        services.lock_tasks().extend(handles);
        tracing::info!(
            async_threshold_chars = services.config.jobs.async_threshold_chars,
            worker_pool_size = services.config.jobs.worker_pool_size,
            "Services started"
        );
        services
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn jobs(&self) -> Arc<JobTracker> {
        self.jobs.get_or_init(|| Arc::new(JobTracker::new())).clone()
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics
            .get_or_init(|| Arc::new(MetricsCollector::new(&self.config.metrics)))
            .clone()
    }

    pub fn alerts(&self) -> Arc<AlertManager> {
        self.alerts
            .get_or_init(|| Arc::new(AlertManager::new(self.config.alerts.clone())))
            .clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the maintenance loops and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.lock_tasks());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
        tracing::info!("Services stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_return_the_same_instance() {
        let services = Services::new(PipelineConfig::default());
        assert!(Arc::ptr_eq(&services.jobs(), &services.jobs()));
        assert!(Arc::ptr_eq(&services.metrics(), &services.metrics()));
        assert!(Arc::ptr_eq(&services.alerts(), &services.alerts()));
    }

    #[tokio::test]
    async fn shutdown_stops_loops() {
        let services = Services::start(PipelineConfig::default());
        assert_eq!(services.lock_tasks().len(), 3);
        services.shutdown().await;
        assert!(services.is_shutting_down());
        assert!(services.lock_tasks().is_empty());
    }
}
