//! The four-phase fragment pipeline.
//!
//! - [`triage`] - Phase 1, relevance decision (JSON or text answer)
//! - [`extract`] - Phase 2, facts, entities and their relations
//! - [`quotes`] - Phase 3, quotes and quantitative data grounded on Phase 2 ids
//! - [`normalize`] - Phase 4, entity matching against the catalogue
//! - [`coordinator`] - drives the phases for one fragment and persists the payload
//!
//! Phases never return errors. External failures become fallbacks recorded in
//! the phase audit, so a fragment always reaches the payload builder.

pub mod coordinator;
pub mod extract;
pub mod normalize;
pub mod parse;
pub mod prompts;
pub mod quotes;
pub mod sanitize;
pub mod state;
pub mod triage;

use crate::config::PipelineConfig;
use crate::error::TerminalApiError;
use crate::retry::RetryPolicy;
use crate::traits::{LlmClient, PersistenceClient, Preprocessor, ResponseFormat};
use crate::types::PhaseId;

pub use coordinator::{FragmentRun, PipelineCoordinator, RunFailure, RunTiming};
pub use parse::LlmResponse;
pub use prompts::prompt_hash;
pub use state::{FragmentState, NoopObserver, StateMachine, StateObserver};

/// Collaborators and settings a phase runs with, borrowed for one fragment.
pub struct PhaseContext<'a> {
    pub fragment_id: &'a str,
    pub llm: &'a dyn LlmClient,
    pub preprocessor: &'a dyn Preprocessor,
    pub persistence: &'a dyn PersistenceClient,
    pub config: &'a PipelineConfig,
}

impl<'a> PhaseContext<'a> {
    pub fn llm_policy(&self) -> RetryPolicy {
        RetryPolicy::llm(&self.config.retry)
    }

    pub fn rpc_policy(&self) -> RetryPolicy {
        RetryPolicy::db_rpc(&self.config.retry)
    }

    /// One LLM completion under the LLM retry policy.
    pub async fn call_llm(
        &self,
        phase: PhaseId,
        prompt: &str,
        format: ResponseFormat,
    ) -> Result<String, TerminalApiError> {
        let llm = self.llm;
        self.llm_policy()
            .call(phase.as_str(), || llm.complete(prompt, format))
            .await
    }
}
