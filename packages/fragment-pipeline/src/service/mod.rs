//! Inbound surface: shared services, fragment and article processing, job status.

pub mod article;
pub mod lifecycle;
pub mod processing;

pub use article::{fragment_id, split_article, ArticleRequest};
pub use lifecycle::Services;
pub use processing::{
    ArticleReport, ArticleResponse, CompletedFragment, FragmentRequest, FragmentResponse,
    HealthReport, HealthStatus, JobStatusView, ProcessingService,
};
