//! Inbound operations: process-fragment, process-article and job-status.
//!
//! Inputs longer than `async_threshold_chars` are dispatched to a bounded
//! worker pool shared by fragment and article jobs, and answered immediately
//! with a job id; shorter ones run inline. Every run is isolated in its own task so a panic fails that run
//! only.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

use super::article::{fragments_for, ArticleRequest};
use super::lifecycle::Services;
use crate::error::{truncate_message, PipelineError, ProcessingError, Result};
use crate::jobs::{JobError, JobSnapshot, JobStatus, JobTracker};
use crate::observability::{AggregatedMetrics, AlertManager, AlertSeverity, MetricsCollector};
use crate::pipeline::{FragmentRun, FragmentState, PipelineCoordinator, RunTiming, StateObserver};
use crate::types::{ArticleMetadata, ElementCounts, Fragment};

// ============================================================================
// Requests and responses
// ============================================================================

/// Inbound fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentRequest {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: ArticleMetadata,
    #[serde(default)]
    pub source_article_id: Option<String>,
    #[serde(default)]
    pub order_in_article: Option<u32>,
}

impl FragmentRequest {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: ArticleMetadata::default(),
            source_article_id: None,
            order_in_article: None,
        }
    }

    pub fn with_metadata(mut self, metadata: ArticleMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    fn into_fragment(self) -> Result<Fragment> {
        self.metadata.validate()?;
        let source = self.source_article_id.unwrap_or_else(|| self.id.clone());
        let fragment = Fragment::new(self.id, source, self.order_in_article.unwrap_or(0), self.text)?;
        Ok(fragment.with_metadata(self.metadata))
    }
}

/// Outcome of a fragment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FragmentResponse {
    Inline(Box<FragmentRun>),
    Accepted { job_id: String, status: JobStatus },
}

impl FragmentResponse {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            FragmentResponse::Accepted { job_id, .. } => Some(job_id),
            FragmentResponse::Inline(_) => None,
        }
    }

    pub fn run(&self) -> Option<&FragmentRun> {
        match self {
            FragmentResponse::Inline(run) => Some(run),
            FragmentResponse::Accepted { .. } => None,
        }
    }
}

/// Per-article outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleReport {
    pub article_id: String,
    pub fragments_total: usize,
    pub fragments_persisted: usize,
    pub fragments_failed: usize,
    pub element_counts: ElementCounts,
    pub runs: Vec<FragmentRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArticleResponse {
    Inline(ArticleReport),
    Accepted { job_id: String, status: JobStatus },
}

/// Result stored on a completed fragment job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedFragment {
    pub persisted_id: Option<String>,
    pub estado: FragmentState,
    pub timing: RunTiming,
    pub element_counts: ElementCounts,
}

/// Caller view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl From<JobSnapshot> for JobStatusView {
    fn from(snapshot: JobSnapshot) -> Self {
        Self {
            progress: snapshot.progress(),
            job_id: snapshot.job_id,
            status: snapshot.status,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
            result: snapshot.result,
            error: snapshot.error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub jobs: BTreeMap<String, usize>,
    pub active_alerts: usize,
    pub metrics: AggregatedMetrics,
}

// ============================================================================
// Job observer
// ============================================================================

/// Mirrors pipeline state changes into the job's metadata.
struct JobObserver {
    jobs: Arc<JobTracker>,
    job_id: String,
}

impl StateObserver for JobObserver {
    fn on_transition(&self, _fragment_id: &str, _from: FragmentState, to: FragmentState) {
        let mut patch = Map::new();
        patch.insert("estado".into(), to.as_str().into());
        self.jobs
            .update_status(&self.job_id, JobStatus::Processing, None, None, Some(patch));
    }
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct ProcessingService {
    coordinator: PipelineCoordinator,
    jobs: Arc<JobTracker>,
    metrics: Arc<MetricsCollector>,
    alerts: Arc<AlertManager>,
    workers: Arc<Semaphore>,
}

impl ProcessingService {
    pub fn new(coordinator: PipelineCoordinator, services: &Services) -> Self {
        let pool = coordinator.config().jobs.worker_pool_size.max(1);
        Self {
            coordinator,
            jobs: services.jobs(),
            metrics: services.metrics(),
            alerts: services.alerts(),
            workers: Arc::new(Semaphore::new(pool)),
        }
    }

    fn async_threshold(&self) -> usize {
        self.coordinator.config().jobs.async_threshold_chars
    }

    /// Process one fragment, inline or as a background job.
    pub async fn process_fragment(&self, request: FragmentRequest) -> Result<FragmentResponse> {
        let started = Instant::now();
        let fragment = match request.into_fragment() {
            Ok(f) => f,
            Err(e) => {
                self.metrics.record_request(elapsed_ms(started), false);
                self.metrics.record_error(e.error_type());
                return Err(e);
            }
        };

        if fragment.char_len() > self.async_threshold() {
            let job_id = self.dispatch_fragment(fragment);
            self.metrics.record_request(elapsed_ms(started), true);
            return Ok(FragmentResponse::Accepted {
                job_id,
                status: JobStatus::Processing,
            });
        }

        let result = self.run_isolated(fragment, None).await;
        self.metrics.record_request(elapsed_ms(started), result.is_ok());
        Ok(FragmentResponse::Inline(Box::new(result?)))
    }

    fn dispatch_fragment(&self, fragment: Fragment) -> String {
        let mut metadata = Map::new();
        metadata.insert("fragment_id".into(), fragment.fragment_id().into());
        metadata.insert("caracteres".into(), fragment.char_len().into());
        let job_id = self.jobs.create_job(None, metadata);
        self.jobs
            .update_status(&job_id, JobStatus::Processing, None, None, None);
        tracing::info!(
            job_id = %job_id,
            fragment_id = fragment.fragment_id(),
            chars = fragment.char_len(),
            "Fragment dispatched to background"
        );

        let this = self.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            // Permit held for the whole run bounds the worker pool
            let _permit = this.workers.clone().acquire_owned().await;
            match this.run_isolated(fragment, Some(id.as_str())).await {
                Ok(run) => this.complete_fragment_job(&id, &run),
                Err(e) => this.fail_job(&id, &e, None),
            }
        });
        job_id
    }

    fn complete_fragment_job(&self, job_id: &str, run: &FragmentRun) {
        if run.is_persisted() {
            let completed = CompletedFragment {
                persisted_id: run.persisted.as_ref().map(|p| p.persisted_id.clone()),
                estado: run.state,
                timing: run.timing.clone(),
                element_counts: run.element_counts(),
            };
            let result = serde_json::to_value(&completed).unwrap_or(Value::Null);
            self.settle_job(job_id, JobStatus::Completed, Some(result), None);
            return;
        }

        let error = match &run.failure {
            Some(f) => JobError {
                error_type: f.error_type.clone(),
                message: f.message.clone(),
                phase: f.phase.clone(),
            },
            None => JobError {
                error_type: "ProcessingError".into(),
                message: format!("run ended in state {}", run.state),
                phase: "coordinador".into(),
            },
        };
        self.settle_job(job_id, JobStatus::Failed, None, Some(error));
    }

    /// Move a job to a terminal status, through `processing` when it is
    /// still pending.
    fn settle_job(&self, job_id: &str, status: JobStatus, result: Option<Value>, error: Option<JobError>) {
        let pending = self
            .jobs
            .get_status(job_id)
            .is_some_and(|j| j.status == JobStatus::Pending);
        if pending {
            self.jobs
                .update_status(job_id, JobStatus::Processing, None, None, None);
        }
        if !self.jobs.update_status(job_id, status, result, error, None) {
            tracing::warn!(job_id, status = %status, "Job could not be settled");
        }
    }

    fn fail_job(&self, job_id: &str, error: &PipelineError, phase: Option<&str>) {
        let error = JobError {
            error_type: error.error_type().to_string(),
            message: truncate_message(&error.to_string()),
            phase: error.phase().or(phase).unwrap_or("coordinador").to_string(),
        };
        self.settle_job(job_id, JobStatus::Failed, None, Some(error));
    }

    /// Run a fragment in its own task and record its metrics.
    async fn run_isolated(&self, fragment: Fragment, job_id: Option<&str>) -> Result<FragmentRun> {
        let coordinator = self.coordinator.clone();
        let observer = job_id.map(|id| JobObserver {
            jobs: self.jobs.clone(),
            job_id: id.to_string(),
        });
        let fragment_id = fragment.fragment_id().to_string();

        let handle = tokio::spawn(async move {
            match observer {
                Some(observer) => coordinator.run_observed(fragment, &observer).await,
                None => coordinator.run(fragment).await,
            }
        });

        match handle.await {
            Ok(run) => {
                self.record_run(&run);
                Ok(run)
            }
            Err(e) => {
                tracing::error!(fragment_id = %fragment_id, error = %e, "Fragment task aborted");
                self.metrics.record_pipeline_run(0.0, false);
                self.metrics.record_error("ProcessingError");
                Err(ProcessingError::TaskAborted(e.to_string()).into())
            }
        }
    }

    fn record_run(&self, run: &FragmentRun) {
        self.metrics
            .record_pipeline_run(run.timing.total_ms as f64, run.is_persisted());
        for audit in run.audits.iter().filter(|a| !a.skipped) {
            self.metrics
                .record_phase(audit.phase.as_str(), audit.duration_ms as f64, audit.fallbacks.is_empty());
        }
        if let Some(failure) = &run.failure {
            self.metrics.record_error(&failure.error_type);
        }
    }

    /// Split an article and process its fragments with bounded concurrency.
    ///
    /// Fails only when every fragment failed.
    pub async fn process_article(&self, request: ArticleRequest) -> Result<ArticleResponse> {
        let started = Instant::now();
        let config = self.coordinator.config();
        let fragments = match fragments_for(&request, config.phases.max_fragment_chars) {
            Ok(f) => f,
            Err(e) => {
                self.metrics.record_request(elapsed_ms(started), false);
                return Err(e.into());
            }
        };

        if request.text.chars().count() > self.async_threshold() {
            let mut metadata = Map::new();
            metadata.insert("article_id".into(), request.article_id.clone().into());
            metadata.insert("fragmentos_totales".into(), fragments.len().into());
            metadata.insert("fragmentos_completados".into(), 0.into());
            let job_id = self.jobs.create_job(None, metadata);
            self.jobs
                .update_status(&job_id, JobStatus::Processing, None, None, None);

            let this = self.clone();
            let id = job_id.clone();
            let article_id = request.article_id.clone();
            tokio::spawn(async move {
                // Article jobs draw from the same pool as fragment jobs
                let _permit = this.workers.clone().acquire_owned().await;
                let report = this.run_article(&article_id, fragments, Some(id.as_str())).await;
                match report {
                    Ok(report) => {
                        let result = json!({
                            "fragmentos_persistidos": report.fragments_persisted,
                            "fragmentos_fallidos": report.fragments_failed,
                            "element_counts": report.element_counts,
                        });
                        this.settle_job(&id, JobStatus::Completed, Some(result), None);
                    }
                    Err(e) => this.fail_job(&id, &e, Some("articulo")),
                }
            });

            self.metrics.record_request(elapsed_ms(started), true);
            return Ok(ArticleResponse::Accepted {
                job_id,
                status: JobStatus::Processing,
            });
        }

        let report = self.run_article(&request.article_id, fragments, None).await;
        self.metrics.record_request(elapsed_ms(started), report.is_ok());
        Ok(ArticleResponse::Inline(report?))
    }

    async fn run_article(
        &self,
        article_id: &str,
        fragments: Vec<Fragment>,
        job_id: Option<&str>,
    ) -> Result<ArticleReport> {
        let total = fragments.len();
        let concurrency = self.coordinator.config().jobs.article_concurrency.max(1);
        tracing::info!(article_id, fragments = total, concurrency, "Processing article");

        let mut results = stream::iter(fragments)
            .map(|fragment| {
                let fragment_id = fragment.fragment_id().to_string();
                async move { (fragment_id, self.run_isolated(fragment, None).await) }
            })
            .buffer_unordered(concurrency);

        let mut runs = Vec::with_capacity(total);
        let mut done = 0usize;
        let mut failed = 0;
        let mut last_error = None;
        while let Some((fragment_id, result)) = results.next().await {
            match result {
                Ok(run) => {
                    if !run.is_persisted() {
                        failed += 1;
                    }
                    runs.push(run);
                }
                Err(e) => {
                    tracing::warn!(article_id, fragment_id = %fragment_id, error = %e, "Fragment failed");
                    failed += 1;
                    last_error = Some(e);
                }
            }
            done += 1;
            if let Some(job_id) = job_id {
                let mut patch = Map::new();
                patch.insert("fragmentos_completados".into(), done.into());
                self.jobs
                    .update_status(job_id, JobStatus::Processing, None, None, Some(patch));
            }
        }

        if failed == total {
            let phase = runs
                .iter()
                .find_map(|r| r.failure.as_ref().map(|f| f.phase.clone()))
                .unwrap_or_else(|| "articulo".to_string());
            return Err(match last_error {
                Some(e) if runs.is_empty() => e,
                _ => ProcessingError::Phase {
                    phase,
                    message: format!("all {} fragments of article {} failed", total, article_id),
                }
                .into(),
            });
        }

        runs.sort_by_key(|r| {
            r.payload
                .as_ref()
                .map(|p| p.metadata.order_in_article)
                .unwrap_or(u32::MAX)
        });
        let mut element_counts = ElementCounts::default();
        for run in &runs {
            element_counts += run.element_counts();
        }

        Ok(ArticleReport {
            article_id: article_id.to_string(),
            fragments_total: total,
            fragments_persisted: runs.iter().filter(|r| r.is_persisted()).count(),
            fragments_failed: failed,
            element_counts,
            runs,
        })
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatusView> {
        self.jobs.get_status(job_id).map(JobStatusView::from)
    }

    pub fn metrics(&self) -> AggregatedMetrics {
        self.metrics.get_aggregated_metrics()
    }

    /// Degraded while any critical alert is unresolved.
    pub fn health(&self) -> HealthReport {
        let active = self.alerts.list(true);
        let critical = active
            .iter()
            .any(|a| a.severity == AlertSeverity::Critical);
        let jobs = self
            .jobs
            .counts_by_status()
            .into_iter()
            .map(|(status, n)| (status.as_str().to_string(), n))
            .collect();

        HealthReport {
            status: if critical {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            },
            jobs,
            active_alerts: active.len(),
            metrics: self.metrics.get_aggregated_metrics(),
        }
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
