//! In-memory tracker for asynchronously processed fragments and articles.
//!
//! One coarse mutex guards the job table; every operation is a short
//! critical section, never held across an await.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pipeline::state::FragmentState;

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `pending -> processing -> {completed | failed}`. Re-entering
    /// `processing` is allowed to refresh metadata.
    pub fn can_move_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (
                    JobStatus::Processing,
                    JobStatus::Processing | JobStatus::Completed | JobStatus::Failed
                )
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Caller-visible failure of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub error_type: String,
    pub message: String,
    pub phase: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
}

impl JobSnapshot {
    /// Progress estimate in [0, 1].
    pub fn progress(&self) -> f64 {
        match self.status {
            JobStatus::Pending => 0.0,
            JobStatus::Completed | JobStatus::Failed => 1.0,
            JobStatus::Processing => self.processing_progress(),
        }
    }

    fn processing_progress(&self) -> f64 {
        let done = self.metadata.get("fragmentos_completados").and_then(Value::as_u64);
        let total = self.metadata.get("fragmentos_totales").and_then(Value::as_u64);
        if let (Some(done), Some(total)) = (done, total) {
            if total > 0 {
                return (done as f64 / total as f64).clamp(0.0, 1.0);
            }
        }

        self.metadata
            .get("estado")
            .and_then(Value::as_str)
            .and_then(FragmentState::parse)
            .map(|s| s.progress())
            .unwrap_or(0.0)
    }
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: Mutex<HashMap<String, JobSnapshot>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobSnapshot>> {
        // A panicking writer cannot leave a snapshot half-written
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a pending job. A generated UUID is used when `job_id` is None.
    ///
    /// An id that is already tracked is returned as is; the existing job
    /// keeps its status, result and metadata.
    pub fn create_job(&self, job_id: Option<String>, metadata: Map<String, Value>) -> String {
        let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut jobs = self.lock();
        if let Some(existing) = jobs.get(&job_id) {
            tracing::warn!(job_id = %job_id, status = %existing.status, "Job id already tracked");
            return job_id;
        }

        let now = Utc::now();
        jobs.insert(
            job_id.clone(),
            JobSnapshot {
                job_id: job_id.clone(),
                status: JobStatus::Pending,
                created_at: now,
                updated_at: now,
                metadata,
                result: None,
                error: None,
            },
        );
        tracing::debug!(job_id = %job_id, "Job created");
        job_id
    }

    /// Move a job forward. Returns false for unknown jobs and rejected transitions.
    pub fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<JobError>,
        metadata_patch: Option<Map<String, Value>>,
    ) -> bool {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(job_id) else {
            tracing::warn!(job_id, "Status update for unknown job");
            return false;
        };

        if !job.status.can_move_to(status) {
            tracing::warn!(
                job_id,
                from = %job.status,
                to = %status,
                "Rejected job status transition"
            );
            return false;
        }

        job.status = status;
        job.updated_at = Utc::now();
        if result.is_some() {
            job.result = result;
        }
        if error.is_some() {
            job.error = error;
        }
        if let Some(patch) = metadata_patch {
            job.metadata.extend(patch);
        }
        true
    }

    pub fn get_status(&self, job_id: &str) -> Option<JobSnapshot> {
        self.lock().get(job_id).cloned()
    }

    /// Jobs, optionally filtered by status, oldest first.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self
            .lock()
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn counts_by_status(&self) -> HashMap<JobStatus, usize> {
        let mut counts: HashMap<JobStatus, usize> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for job in self.lock().values() {
            *counts.entry(job.status).or_default() += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove terminal jobs last updated more than `retention_minutes` ago.
    pub fn cleanup_old_jobs(&self, retention_minutes: i64) -> usize {
        self.cleanup_old_jobs_at(Utc::now(), retention_minutes)
    }

    /// `cleanup_old_jobs` evaluated at `now`.
    pub fn cleanup_old_jobs_at(&self, now: DateTime<Utc>, retention_minutes: i64) -> usize {
        self.cleanup_older_than(now - Duration::minutes(retention_minutes))
    }

    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < cutoff));
        let removed = before - jobs.len();
        if removed > 0 {
            tracing::info!(removed, remaining = jobs.len(), "Cleaned up old jobs");
        }
        removed
    }

    /// Run `cleanup_old_jobs` every `interval` until `cancel` fires.
    pub fn spawn_cleanup_loop(
        self: Arc<Self>,
        interval: std::time::Duration,
        retention_minutes: i64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Job cleanup loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.cleanup_old_jobs(retention_minutes);
                    }
                }
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, job_id: &str, minutes: i64) {
        if let Some(job) = self.lock().get_mut(job_id) {
            job.updated_at = Utc::now() - Duration::minutes(minutes);
        }
    }
}
