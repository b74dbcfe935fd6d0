//! LLM client trait.
//!
//! The pipeline only needs one capability from a language model: complete a
//! prompt, either as free text or as a JSON document. Provider specifics
//! (HTTP, auth, model selection) live in the implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Shape the caller expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// A JSON object (providers with a JSON mode should enable it)
    Json,
    /// Free text
    Text,
}

/// Language model completion.
///
/// Implementations report failures as [`ApiError`] with the right kind so the
/// retry policy can tell transient failures from permanent ones.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String, ApiError>;

    /// Model identifier, recorded in phase audits.
    fn model_name(&self) -> String {
        "unknown".to_string()
    }
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for std::sync::Arc<T> {
    async fn complete(&self, prompt: &str, format: ResponseFormat) -> Result<String, ApiError> {
        (**self).complete(prompt, format).await
    }

    fn model_name(&self) -> String {
        (**self).model_name()
    }
}
