//! Pipeline coordinator.
//!
//! Runs the phases of one fragment strictly in order, short-circuits
//! irrelevant fragments to a minimal payload, builds and validates the
//! payload and hands it to persistence. A run never panics or returns an
//! error: failures are recorded in the returned [`FragmentRun`].

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

use super::state::{FragmentState, NoopObserver, StateMachine, StateObserver};
use super::{extract, normalize, quotes, triage, PhaseContext};
use crate::clients::limit_shared;
use crate::config::PipelineConfig;
use crate::error::{truncate_message, PipelineError, ProcessingError};
use crate::ids::{AllocatorStats, IdAllocator};
use crate::payload::{build_payload, PayloadInput, PersistencePayload};
use crate::traits::{LlmClient, PersistOutcome, PersistenceClient, Preprocessor};
use crate::types::{
    ElementCounts, Fragment, NormalizationStatus, PhaseAudit, PhaseId, TriageDecision,
};

/// Why a run did not end in `Persisted`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub error_type: String,
    pub message: String,
    pub phase: String,
}

impl RunFailure {
    pub fn from_error(error: &PipelineError, current_phase: PhaseId) -> Self {
        Self {
            error_type: error.error_type().to_string(),
            message: truncate_message(&error.to_string()),
            phase: error
                .phase()
                .unwrap_or(current_phase.as_str())
                .to_string(),
        }
    }
}

/// Wall-clock timing of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunTiming {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_ms: u64,
    /// Phase → duration, in execution order
    pub phases_ms: IndexMap<String, u64>,
}

/// Everything known about one fragment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentRun {
    pub fragment_id: String,
    pub state: FragmentState,
    pub history: Vec<FragmentState>,
    pub decision: Option<TriageDecision>,
    pub normalization: Option<NormalizationStatus>,
    pub audits: Vec<PhaseAudit>,
    pub allocation: AllocatorStats,
    pub payload: Option<PersistencePayload>,
    pub persisted: Option<PersistOutcome>,
    pub failure: Option<RunFailure>,
    pub timing: RunTiming,
}

impl FragmentRun {
    pub fn is_persisted(&self) -> bool {
        self.state == FragmentState::Persisted
    }

    pub fn is_discarded(&self) -> bool {
        self.history.contains(&FragmentState::Discarded)
    }

    pub fn element_counts(&self) -> ElementCounts {
        self.payload
            .as_ref()
            .map(PersistencePayload::counts)
            .unwrap_or_default()
    }

    /// Fallbacks fired in any phase, as `phase: reason`.
    pub fn fallbacks(&self) -> Vec<String> {
        self.audits
            .iter()
            .flat_map(|a| a.fallbacks.iter().map(move |f| format!("{}: {}", a.phase, f)))
            .collect()
    }

    /// Every phase warning, in order.
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.audits.iter().flat_map(|a| a.warnings.iter().map(String::as_str))
    }
}

/// Mutable bookkeeping while a run is in flight.
struct RunState<'a> {
    fragment_id: &'a str,
    machine: StateMachine,
    observer: &'a dyn StateObserver,
    phase: PhaseId,
    decision: Option<TriageDecision>,
    normalization: Option<NormalizationStatus>,
    audits: Vec<PhaseAudit>,
    payload: Option<PersistencePayload>,
    persisted: Option<PersistOutcome>,
    failure: Option<RunFailure>,
}

impl<'a> RunState<'a> {
    fn advance(&mut self, next: FragmentState) -> Result<(), ProcessingError> {
        let from = self.machine.transition(next)?;
        tracing::debug!(fragment_id = self.fragment_id, from = %from, to = %next, "State transition");
        self.observer.on_transition(self.fragment_id, from, next);
        Ok(())
    }

    fn fail(&mut self, error: PipelineError) {
        let failure = RunFailure::from_error(&error, self.phase);
        tracing::error!(
            fragment_id = self.fragment_id,
            phase = %failure.phase,
            error_type = %failure.error_type,
            error = %failure.message,
            "Fragment run failed"
        );
        self.failure = Some(failure);
        if let Ok(from) = self.machine.transition(FragmentState::Failed) {
            self.observer
                .on_transition(self.fragment_id, from, FragmentState::Failed);
        }
    }
}

/// Drives fragments through the pipeline.
#[derive(Clone)]
pub struct PipelineCoordinator {
    llm: Arc<dyn LlmClient>,
    preprocessor: Arc<dyn Preprocessor>,
    persistence: Arc<dyn PersistenceClient>,
    config: Arc<PipelineConfig>,
}

impl PipelineCoordinator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        preprocessor: Arc<dyn Preprocessor>,
        persistence: Arc<dyn PersistenceClient>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            // Client-side quota from `retry.llm_requests_per_second`
            llm: limit_shared(llm, &config.retry),
            preprocessor,
            persistence,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one fragment through every phase.
    pub async fn run(&self, fragment: Fragment) -> FragmentRun {
        self.run_observed(fragment, &NoopObserver).await
    }

    /// Like [`run`](Self::run), reporting every state change to `observer`.
    pub async fn run_observed(&self, fragment: Fragment, observer: &dyn StateObserver) -> FragmentRun {
        let started = Instant::now();
        let started_at = Utc::now();
        let mut allocator = IdAllocator::new(fragment.fragment_id());
        let mut run = RunState {
            fragment_id: fragment.fragment_id(),
            machine: StateMachine::default(),
            observer,
            phase: PhaseId::Triage,
            decision: None,
            normalization: None,
            audits: Vec::new(),
            payload: None,
            persisted: None,
            failure: None,
        };

        if let Err(e) = self.drive(&fragment, &mut allocator, &mut run).await {
            run.fail(e);
        }

        let total_ms = started.elapsed().as_millis() as u64;
        let state = run.machine.current();
        tracing::info!(
            fragment_id = run.fragment_id,
            state = %state,
            outcome = if state == FragmentState::Persisted { "success" } else { "error" },
            duration_ms = total_ms,
            "Fragment run finished"
        );

        let phases_ms = run
            .audits
            .iter()
            .filter(|a| !a.skipped)
            .map(|a| (a.phase.to_string(), a.duration_ms))
            .collect();

        FragmentRun {
            fragment_id: fragment.fragment_id().to_string(),
            state,
            history: run.machine.history().to_vec(),
            decision: run.decision,
            normalization: run.normalization,
            audits: run.audits,
            allocation: allocator.get_stats(),
            payload: run.payload,
            persisted: run.persisted,
            failure: run.failure,
            timing: RunTiming {
                started_at,
                finished_at: Utc::now(),
                total_ms,
                phases_ms,
            },
        }
    }

    async fn drive(
        &self,
        fragment: &Fragment,
        allocator: &mut IdAllocator,
        run: &mut RunState<'_>,
    ) -> Result<(), PipelineError> {
        let ctx = PhaseContext {
            fragment_id: fragment.fragment_id(),
            llm: self.llm.as_ref(),
            preprocessor: self.preprocessor.as_ref(),
            persistence: self.persistence.as_ref(),
            config: &self.config,
        };

        run.phase = PhaseId::Triage;
        let phase1 = triage::run(&ctx, fragment.raw_text()).await;
        run.decision = Some(phase1.decision);
        run.audits.push(phase1.audit.clone());
        run.advance(FragmentState::Triaged)?;

        let final_phase = if phase1.es_relevante {
            run.phase = PhaseId::Extraction;
            let phase2 = extract::run(&ctx, &phase1, allocator).await;
            run.audits.push(phase2.audit.clone());
            run.advance(FragmentState::Extracted)?;

            run.phase = PhaseId::QuotesData;
            let phase3 = quotes::run(&ctx, phase2, allocator).await;
            run.audits.push(phase3.audit.clone());
            run.advance(FragmentState::CitasDatos)?;

            run.phase = PhaseId::Normalization;
            let phase4 = normalize::run(&ctx, phase3).await;
            run.audits.push(phase4.audit.clone());
            run.normalization = Some(phase4.estado);
            run.advance(FragmentState::Normalized)?;
            Some(phase4)
        } else {
            run.advance(FragmentState::Discarded)?;
            for phase in [PhaseId::Extraction, PhaseId::QuotesData, PhaseId::Normalization] {
                run.audits
                    .push(PhaseAudit::skipped(phase, "fragmento descartado en triaje"));
            }
            run.normalization = Some(NormalizationStatus::NoRequerido);
            None
        };

        run.phase = PhaseId::Payload;
        let payload = build_payload(PayloadInput {
            fragment,
            triage: &phase1,
            contenido: final_phase.as_ref().map(|p| &p.contenido),
            normalizaciones: final_phase
                .as_ref()
                .map(|p| p.normalizaciones.as_slice())
                .unwrap_or(&[]),
            estado_normalizacion: run.normalization.unwrap_or(NormalizationStatus::NoRequerido),
            audits: &run.audits,
        })?;
        run.advance(FragmentState::PayloadBuilt)?;

        run.phase = PhaseId::Persistence;
        let db = self.persistence.as_ref();
        let persisted = ctx
            .rpc_policy()
            .call(PhaseId::Persistence.as_str(), || db.upsert_payload(&payload))
            .await;
        run.payload = Some(payload);

        match persisted {
            Ok(outcome) => {
                run.persisted = Some(outcome);
                run.advance(FragmentState::Persisted)?;
            }
            Err(e) => {
                let failure = RunFailure::from_error(&PipelineError::from(e), PhaseId::Persistence);
                tracing::error!(
                    fragment_id = run.fragment_id,
                    phase = %PhaseId::Persistence,
                    error = %failure.message,
                    "Payload persistence failed"
                );
                run.failure = Some(failure);
                run.advance(FragmentState::PersistFailed)?;
            }
        }
        Ok(())
    }
}
