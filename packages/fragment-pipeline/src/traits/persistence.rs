//! Persistence collaborator trait.
//!
//! The database side exposes two RPCs: an idempotent upsert of a fragment
//! payload and a similarity search over known entities. Delivery is
//! at-least-once, so `upsert_payload` must tolerate replays of the same
//! payload (same checksum).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ApiError;
use crate::payload::PersistencePayload;
use crate::types::ElementCounts;

/// What the database returned for a persisted payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistOutcome {
    /// Identifier of the stored fragment record
    pub persisted_id: String,

    /// Temporal id → database id
    #[serde(default)]
    pub ids: HashMap<String, String>,

    pub counts: ElementCounts,
}

/// A candidate returned by the entity similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarEntity {
    pub id: String,
    pub nombre: String,
    pub tipo: String,
    pub score: f64,
}

/// Database RPCs used by the pipeline.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PersistenceClient: Send + Sync {
    /// Store a validated payload. Must be idempotent.
    async fn upsert_payload(&self, payload: &PersistencePayload) -> Result<PersistOutcome, ApiError>;

    /// Known entities similar to `name`, best first, at most `limit`.
    async fn find_similar_entity(
        &self,
        name: &str,
        entity_type: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarEntity>, ApiError>;
}

#[async_trait]
impl<T: PersistenceClient + ?Sized> PersistenceClient for std::sync::Arc<T> {
    async fn upsert_payload(&self, payload: &PersistencePayload) -> Result<PersistOutcome, ApiError> {
        (**self).upsert_payload(payload).await
    }

    async fn find_similar_entity(
        &self,
        name: &str,
        entity_type: &str,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<SimilarEntity>, ApiError> {
        (**self).find_similar_entity(name, entity_type, threshold, limit).await
    }
}
