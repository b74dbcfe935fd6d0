//! Dispatch, job tracking and service-level behavior.

use chrono::{Duration, Utc};
use serde_json::Map;
use std::sync::Arc;

use fragment_pipeline::jobs::{JobStatus, JobTracker};
use fragment_pipeline::service::{
    ArticleRequest, ArticleResponse, FragmentRequest, FragmentResponse, HealthStatus,
    JobStatusView, ProcessingService, Services,
};
use fragment_pipeline::testing::{fast_config, MockLlm, MockPersistence, MockPreprocessor};
use fragment_pipeline::{ApiError, ArticleMetadata, PipelineConfig, PipelineCoordinator};

fn service_with(llm: MockLlm, db: Arc<MockPersistence>, config: PipelineConfig) -> (ProcessingService, Arc<Services>) {
    let services = Arc::new(Services::new(config.clone()));
    let coordinator = PipelineCoordinator::new(Arc::new(llm), Arc::new(MockPreprocessor::new()), db, config);
    (ProcessingService::new(coordinator, &services), services)
}

async fn wait_for_terminal(service: &ProcessingService, job_id: &str) -> JobStatusView {
    for _ in 0..200 {
        if let Some(view) = service.job_status(job_id) {
            if view.status.is_terminal() {
                return view;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("job {} did not finish", job_id);
}

#[tokio::test]
async fn scenario_b_short_fragments_run_inline_long_ones_in_background() {
    let db = Arc::new(MockPersistence::new());
    let (service, _services) = service_with(MockLlm::new(), db.clone(), fast_config());

    let short = "a".repeat(500);
    let response = service
        .process_fragment(FragmentRequest::new("short", short))
        .await
        .unwrap();
    let run = response.run().expect("inline run");
    assert!(run.is_persisted());
    assert!(response.job_id().is_none());

    let long = "palabra ".repeat(1500);
    assert_eq!(long.chars().count(), 12_000);
    let response = service
        .process_fragment(FragmentRequest::new("long", long))
        .await
        .unwrap();
    let FragmentResponse::Accepted { job_id, status } = response else {
        panic!("expected a background job");
    };
    assert_eq!(status, JobStatus::Processing);

    let view = wait_for_terminal(&service, &job_id).await;
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.progress, 1.0);
    let result = view.result.unwrap();
    assert_eq!(result["persisted_id"], "persisted-long");
    assert!(result["timing"]["total_ms"].is_u64());
    assert_eq!(result["element_counts"]["hechos"], 0);
    assert_eq!(db.upserts().len(), 2);
}

#[tokio::test]
async fn background_persist_failure_marks_job_failed() {
    let db = Arc::new(MockPersistence::new().failing_upserts(ApiError::connection("db down")));
    let config = fast_config().with_async_threshold(10);
    let (service, _services) = service_with(MockLlm::new(), db, config);

    let response = service
        .process_fragment(FragmentRequest::new("f", "un texto algo más largo"))
        .await
        .unwrap();
    let job_id = response.job_id().unwrap().to_string();

    let view = wait_for_terminal(&service, &job_id).await;
    assert_eq!(view.status, JobStatus::Failed);
    let error = view.error.unwrap();
    assert_eq!(error.error_type, "TerminalAPIError");
    assert_eq!(error.phase, "persistencia");
    assert!(view.result.is_none());
}

#[tokio::test]
async fn empty_fragment_is_a_validation_error() {
    let (service, _services) = service_with(MockLlm::new(), Arc::new(MockPersistence::new()), fast_config());
    let err = service
        .process_fragment(FragmentRequest::new("f", "   "))
        .await
        .unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");
    assert_eq!(service.metrics().errors_by_type["ValidationError"], 1);
}

#[tokio::test]
async fn malformed_metadata_is_rejected_before_any_phase() {
    let llm = MockLlm::new();
    let db = Arc::new(MockPersistence::new());
    let (service, _services) = service_with(llm.clone(), db.clone(), fast_config());

    let request = FragmentRequest::new("f-meta", "Texto con metadatos inválidos")
        .with_metadata(ArticleMetadata::default().with_fecha_publicacion("12/05/2024"));
    let err = service.process_fragment(request).await.unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");
    assert_eq!(err.phase(), None);

    let article = ArticleRequest {
        article_id: "art-meta".into(),
        text: "Un párrafo.".into(),
        metadata: ArticleMetadata::default().with_url("no es una url"),
    };
    let err = service.process_article(article).await.unwrap_err();
    assert_eq!(err.error_type(), "ValidationError");

    assert!(llm.calls().is_empty());
    assert_eq!(db.upsert_attempts(), 0);
}

#[tokio::test]
async fn article_fragments_are_processed_and_counted() {
    let db = Arc::new(MockPersistence::new());
    let config = fast_config().with_max_fragment_chars(40);
    let (service, _services) = service_with(MockLlm::new(), db.clone(), config);

    let request = ArticleRequest {
        article_id: "art-9".into(),
        text: "Primer párrafo del artículo.\n\nSegundo párrafo con una cita.\n\nTercer párrafo con cifras.".into(),
        metadata: ArticleMetadata::default().with_medio("La Gaceta"),
    };
    let ArticleResponse::Inline(report) = service.process_article(request).await.unwrap() else {
        panic!("expected inline processing");
    };

    assert_eq!(report.fragments_total, 3);
    assert_eq!(report.fragments_persisted, 3);
    assert_eq!(report.fragments_failed, 0);
    let mut ids: Vec<_> = db
        .upserts()
        .iter()
        .map(|p| p.metadata.fragment_id.clone())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["art-9_f0", "art-9_f1", "art-9_f2"]);
    assert!(db
        .upserts()
        .iter()
        .all(|p| p.metadata.medio.as_deref() == Some("La Gaceta")));
}

#[tokio::test]
async fn article_jobs_wait_for_a_free_worker() {
    let llm = MockLlm::new().with_delay(std::time::Duration::from_millis(20));
    let config = fast_config().with_async_threshold(10).with_worker_pool_size(1);
    let (service, _services) = service_with(llm.clone(), Arc::new(MockPersistence::new()), config);

    let mut job_ids = Vec::new();
    for article_id in ["art-a", "art-b"] {
        let request = ArticleRequest {
            article_id: article_id.into(),
            text: "Un artículo corto procesado en segundo plano.".into(),
            metadata: ArticleMetadata::default(),
        };
        let ArticleResponse::Accepted { job_id, status } = service.process_article(request).await.unwrap() else {
            panic!("expected a background job");
        };
        assert_eq!(status, JobStatus::Processing);
        job_ids.push(job_id);
    }

    for job_id in &job_ids {
        assert_eq!(wait_for_terminal(&service, job_id).await.status, JobStatus::Completed);
    }
    assert_eq!(llm.triage_calls(), 2);
    // One worker: the second article only starts once the first is done
    assert_eq!(llm.max_concurrent_calls(), 1);
}

#[tokio::test]
async fn article_fails_only_when_every_fragment_fails() {
    let db = Arc::new(MockPersistence::new().failing_upserts(ApiError::validation("schema")));
    let config = fast_config().with_max_fragment_chars(10);
    let (service, _services) = service_with(MockLlm::new(), db, config);

    let request = ArticleRequest {
        article_id: "art".into(),
        text: "Uno dos.\n\nTres cuatro.".into(),
        metadata: ArticleMetadata::default(),
    };
    let err = service.process_article(request).await.unwrap_err();
    assert_eq!(err.phase(), Some("persistencia"));
}

#[tokio::test]
async fn metrics_and_health_reflect_runs() {
    let (service, services) = service_with(MockLlm::new(), Arc::new(MockPersistence::new()), fast_config());
    service
        .process_fragment(FragmentRequest::new("f1", "Texto de prueba"))
        .await
        .unwrap();

    let metrics = service.metrics();
    assert_eq!(metrics.total_requests, 1);
    assert_eq!(metrics.total_pipeline_runs, 1);
    assert_eq!(metrics.pipeline_success_rate_pct, 100.0);
    assert!(metrics.phases.contains_key("fase_1_triaje"));

    let health = service.health();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.active_alerts, 0);

    let alert = services.alerts().observe(
        &fragment_pipeline::observability::ObservedEvent::new(
            fragment_pipeline::observability::EventLevel::Error,
            "External call failed",
        )
        .with_field("service", "llm"),
    );
    assert_eq!(alert.len(), 1);
    assert_eq!(service.health().status, HealthStatus::Degraded);
}

#[test]
fn scenario_e_cleanup_removes_only_old_terminal_jobs() {
    let tracker = JobTracker::new();
    let completed = tracker.create_job(None, Map::new());
    assert!(tracker.update_status(&completed, JobStatus::Processing, None, None, None));
    assert!(tracker.update_status(&completed, JobStatus::Completed, None, None, None));
    let processing = tracker.create_job(None, Map::new());
    assert!(tracker.update_status(&processing, JobStatus::Processing, None, None, None));

    // Evaluated 120 minutes later, both jobs are past the 60 minute window
    let removed = tracker.cleanup_old_jobs_at(Utc::now() + Duration::minutes(120), 60);
    assert_eq!(removed, 1);
    assert!(tracker.get_status(&completed).is_none());
    assert_eq!(tracker.get_status(&processing).unwrap().status, JobStatus::Processing);

    // Nothing is old enough yet
    let fresh = tracker.create_job(None, Map::new());
    tracker.update_status(&fresh, JobStatus::Processing, None, None, None);
    tracker.update_status(&fresh, JobStatus::Failed, None, None, None);
    assert_eq!(tracker.cleanup_old_jobs(60), 0);
}

#[test]
fn job_status_sequence_is_forward_only() {
    let tracker = JobTracker::new();
    let id = tracker.create_job(Some("job-1".into()), Map::new());
    let mut seen = vec![tracker.get_status(&id).unwrap().status];

    for next in [
        JobStatus::Completed,
        JobStatus::Processing,
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Processing,
        JobStatus::Failed,
    ] {
        tracker.update_status(&id, next, None, None, None);
        let current = tracker.get_status(&id).unwrap().status;
        if seen.last() != Some(&current) {
            seen.push(current);
        }
    }

    assert_eq!(
        seen,
        vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
    );
    // Reads between writes are stable
    assert_eq!(tracker.get_status(&id), tracker.get_status(&id));
}
