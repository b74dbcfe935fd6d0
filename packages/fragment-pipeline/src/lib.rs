//! Four-phase LLM extraction pipeline for news article fragments.
//!
//! Each fragment goes through triage, fact and entity extraction, quote and
//! quantitative data extraction, and entity normalization. The result is
//! turned into a validated, checksummed persistence payload.
//!
//! # Design Philosophy
//!
//! - Every external call goes through an explicit retry policy
//! - Phases degrade to fallback-accepted results instead of failing
//! - Integer ids are allocated per fragment and only become temporal ids
//!   in the payload
//! - Collaborators (LLM, preprocessor, database) are traits; the library
//!   handles mechanics, the application handles providers
//!
//! # Usage
//!
//! ```rust,ignore
//! use fragment_pipeline::{PipelineConfig, PipelineCoordinator, ProcessingService, Services};
//! use fragment_pipeline::service::FragmentRequest;
//!
//! let config = PipelineConfig::from_env()?;
//! let services = Services::start(config.clone());
//! let coordinator = PipelineCoordinator::new(llm, preprocessor, persistence, config);
//! let processing = ProcessingService::new(coordinator, &services);
//!
//! let response = processing
//!     .process_fragment(FragmentRequest::new("frag-1", text))
//!     .await?;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Collaborator abstractions (LLM, Preprocessor, Persistence)
//! - [`types`] - Fragments, extracted elements and phase results
//! - [`pipeline`] - Phases and the coordinator
//! - [`payload`] - Persistence payload builder and validator
//! - [`jobs`] - Background job tracking
//! - [`observability`] - Metrics and alerts
//! - [`service`] - Inbound operations and service lifecycle
//! - [`testing`] - Mock collaborators for testing

pub mod clients;
pub mod config;
pub mod error;
pub mod ids;
pub mod jobs;
pub mod observability;
pub mod payload;
pub mod pipeline;
pub mod retry;
pub mod service;
pub mod telemetry;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use config::{ConfigError, PipelineConfig};
pub use error::{
    ApiError, ApiErrorKind, PipelineError, ProcessingError, Result, TerminalApiError,
    ValidationError,
};
pub use ids::{parse_global_reference, ElementKind, GlobalReference, IdAllocator};
pub use retry::{RetryPolicy, Service};
pub use traits::{
    LlmClient, PassthroughPreprocessor, PersistOutcome, PersistenceClient, Preprocessor,
    ResponseFormat, SimilarEntity,
};
pub use types::{ArticleMetadata, ExtractedContent, Fragment};

// Pipeline
pub use pipeline::{FragmentRun, FragmentState, PipelineCoordinator, StateObserver};

// Payload
pub use payload::{build_payload, validate_payload, PayloadValidationError, PersistencePayload};

// Services
pub use clients::RateLimitedLlm;
pub use jobs::{JobStatus, JobTracker};
pub use observability::{AlertManager, MetricsCollector};
pub use service::{ProcessingService, Services};
