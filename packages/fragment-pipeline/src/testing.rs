//! Testing utilities including mock collaborators.
//!
//! These let applications exercise the whole pipeline without a real LLM,
//! translator or database.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{PipelineConfig, RetrySettings};
use crate::error::ApiError;
use crate::payload::PersistencePayload;
use crate::pipeline::prompts::{EXTRACTION_HEADER, QUOTES_DATA_HEADER, TRIAGE_HEADER};
use crate::traits::{
    LlmClient, PersistOutcome, PersistenceClient, Preprocessor, ResponseFormat, SimilarEntity,
};

/// Triage answer used when none was configured: relevant, good scores.
pub const DEFAULT_TRIAGE_ANSWER: &str = r#"{"puntuaciones": {"relevancia_tematica": 5, "actualidad": 4, "impacto": 4, "fiabilidad": 4, "densidad_informativa": 3}, "decision": "PROCESAR", "justificacion": "Contenido informativo", "elementos_clave": []}"#;
pub const DEFAULT_EXTRACTION_ANSWER: &str = r#"{"hechos": [], "entidades": []}"#;
pub const DEFAULT_QUOTES_DATA_ANSWER: &str = r#"{"citas": [], "datos": []}"#;

/// Config with zero backoff delays, for fast retry tests.
pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        retry: RetrySettings {
            llm_max_attempts: 3,
            llm_base_delay_ms: 0,
            llm_max_delay_ms: 0,
            rpc_max_attempts: 2,
            rpc_retry_delay_ms: 0,
            llm_requests_per_second: 0,
        },
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MockPhase {
    Triage,
    Extraction,
    QuotesData,
    Other,
}

impl MockPhase {
    fn detect(prompt: &str) -> Self {
        if prompt.starts_with(TRIAGE_HEADER) {
            MockPhase::Triage
        } else if prompt.starts_with(EXTRACTION_HEADER) {
            MockPhase::Extraction
        } else if prompt.starts_with(QUOTES_DATA_HEADER) {
            MockPhase::QuotesData
        } else {
            MockPhase::Other
        }
    }

    fn default_answer(&self) -> &'static str {
        match self {
            MockPhase::Triage => DEFAULT_TRIAGE_ANSWER,
            MockPhase::Extraction => DEFAULT_EXTRACTION_ANSWER,
            MockPhase::QuotesData => DEFAULT_QUOTES_DATA_ANSWER,
            MockPhase::Other => "{}",
        }
    }
}

/// Record of a call made to the mock LLM.
#[derive(Debug, Clone)]
pub struct MockLlmCall {
    pub prompt: String,
    pub format: ResponseFormat,
}

/// A mock LLM that answers per phase, detected from the prompt header.
///
/// Each phase has a queue of answers. Answers are consumed in order and
/// the last one keeps being returned, so a single error exhausts retries.
#[derive(Clone, Default)]
pub struct MockLlm {
    answers: Arc<RwLock<HashMap<MockPhase, VecDeque<Result<String, ApiError>>>>>,
    calls: Arc<RwLock<Vec<MockLlmCall>>>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, phase: MockPhase, answer: Result<String, ApiError>) -> Self {
        self.answers
            .write()
            .unwrap()
            .entry(phase)
            .or_default()
            .push_back(answer);
        self
    }

    pub fn with_triage(self, answer: impl Into<String>) -> Self {
        self.push(MockPhase::Triage, Ok(answer.into()))
    }

    pub fn with_triage_error(self, error: ApiError) -> Self {
        self.push(MockPhase::Triage, Err(error))
    }

    pub fn with_extraction(self, answer: impl Into<String>) -> Self {
        self.push(MockPhase::Extraction, Ok(answer.into()))
    }

    pub fn with_extraction_error(self, error: ApiError) -> Self {
        self.push(MockPhase::Extraction, Err(error))
    }

    pub fn with_quotes(self, answer: impl Into<String>) -> Self {
        self.push(MockPhase::QuotesData, Ok(answer.into()))
    }

    pub fn with_quotes_error(self, error: ApiError) -> Self {
        self.push(MockPhase::QuotesData, Err(error))
    }

    /// Every call sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<MockLlmCall> {
        self.calls.read().unwrap().clone()
    }

    fn count(&self, phase: MockPhase) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| MockPhase::detect(&c.prompt) == phase)
            .count()
    }

    pub fn triage_calls(&self) -> usize {
        self.count(MockPhase::Triage)
    }

    pub fn extraction_calls(&self) -> usize {
        self.count(MockPhase::Extraction)
    }

    pub fn quotes_calls(&self) -> usize {
        self.count(MockPhase::QuotesData)
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String, ApiError> {
        self.calls.write().unwrap().push(MockLlmCall {
            prompt: prompt.to_string(),
            format,
        });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let phase = MockPhase::detect(prompt);
        let mut answers = self.answers.write().unwrap();
        match answers.get_mut(&phase) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => Ok(phase.default_answer().to_string()),
        }
    }

    fn model_name(&self) -> String {
        "mock-llm".to_string()
    }
}

/// A mock preprocessor: whitespace cleanup, fixed language, canned translation.
#[derive(Clone)]
pub struct MockPreprocessor {
    language: String,
    translation: Option<Result<String, ApiError>>,
    translations: Arc<RwLock<Vec<(String, String)>>>,
}

impl Default for MockPreprocessor {
    fn default() -> Self {
        Self {
            language: "es".to_string(),
            translation: None,
            translations: Arc::default(),
        }
    }
}

impl MockPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_translation(mut self, text: impl Into<String>) -> Self {
        self.translation = Some(Ok(text.into()));
        self
    }

    pub fn with_translation_error(mut self, error: ApiError) -> Self {
        self.translation = Some(Err(error));
        self
    }

    /// `(text, source language)` for every translate call.
    pub fn translations(&self) -> Vec<(String, String)> {
        self.translations.read().unwrap().clone()
    }
}

#[async_trait]
impl Preprocessor for MockPreprocessor {
    fn clean(&self, text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn detect_language(&self, _text: &str) -> String {
        self.language.clone()
    }

    async fn translate(&self, text: &str, from: &str) -> Result<String, ApiError> {
        self.translations
            .write()
            .unwrap()
            .push((text.to_string(), from.to_string()));
        match &self.translation {
            Some(result) => result.clone(),
            None => Ok(text.to_string()),
        }
    }
}

/// A mock persistence client that records payloads and serves canned
/// similarity results.
#[derive(Clone, Default)]
pub struct MockPersistence {
    similar: Arc<RwLock<HashMap<String, Vec<SimilarEntity>>>>,
    upsert_error: Option<ApiError>,
    similarity_error: Option<ApiError>,
    upserts: Arc<RwLock<Vec<PersistencePayload>>>,
    upsert_attempts: Arc<RwLock<usize>>,
    similarity_calls: Arc<RwLock<Vec<(String, String)>>>,
}

impl MockPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Candidates returned for `name` (case-insensitive).
    pub fn with_similar(self, name: &str, candidates: Vec<SimilarEntity>) -> Self {
        self.similar
            .write()
            .unwrap()
            .insert(name.to_lowercase(), candidates);
        self
    }

    /// Every upsert fails with `error`.
    pub fn failing_upserts(mut self, error: ApiError) -> Self {
        self.upsert_error = Some(error);
        self
    }

    /// Every similarity search fails with `error`.
    pub fn failing_similarity(mut self, error: ApiError) -> Self {
        self.similarity_error = Some(error);
        self
    }

    /// Payloads successfully stored.
    pub fn upserts(&self) -> Vec<PersistencePayload> {
        self.upserts.read().unwrap().clone()
    }

    /// Upsert calls, failed ones included.
    pub fn upsert_attempts(&self) -> usize {
        *self.upsert_attempts.read().unwrap()
    }

    pub fn similarity_calls(&self) -> usize {
        self.similarity_calls.read().unwrap().len()
    }
}

#[async_trait]
impl PersistenceClient for MockPersistence {
    async fn upsert_payload(&self, payload: &PersistencePayload) -> Result<PersistOutcome, ApiError> {
        *self.upsert_attempts.write().unwrap() += 1;
        if let Some(error) = &self.upsert_error {
            return Err(error.clone());
        }

        let ids = payload
            .hechos
            .iter()
            .map(|h| h.id_temporal.clone())
            .chain(payload.entidades.iter().map(|e| e.id_temporal.clone()))
            .enumerate()
            .map(|(i, temporal)| (temporal, format!("db-{}", i + 1)))
            .collect();
        self.upserts.write().unwrap().push(payload.clone());

        Ok(PersistOutcome {
            persisted_id: format!("persisted-{}", payload.metadata.fragment_id),
            ids,
            counts: payload.counts(),
        })
    }

    async fn find_similar_entity(
        &self,
        name: &str,
        entity_type: &str,
        _threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarEntity>, ApiError> {
        self.similarity_calls
            .write()
            .unwrap()
            .push((name.to_string(), entity_type.to_string()));
        if let Some(error) = &self.similarity_error {
            return Err(error.clone());
        }
        let mut found = self
            .similar
            .read()
            .unwrap()
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_default();
        found.truncate(limit);
        Ok(found)
    }
}
