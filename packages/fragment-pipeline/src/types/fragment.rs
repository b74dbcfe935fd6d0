//! Fragment input types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::payload::{is_http_uri, is_iso_date};

/// Article-level metadata carried by every fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleMetadata {
    /// Article headline
    #[serde(default)]
    pub titulo: Option<String>,

    /// Publishing outlet
    #[serde(default)]
    pub medio: Option<String>,

    /// Canonical article URL
    #[serde(default)]
    pub url: Option<String>,

    /// Publication date (ISO-8601, date or datetime)
    #[serde(default)]
    pub fecha_publicacion: Option<String>,

    /// ISO country code of the outlet
    #[serde(default)]
    pub pais: Option<String>,

    /// Anything else the caller sent
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl ArticleMetadata {
    pub fn with_titulo(mut self, titulo: impl Into<String>) -> Self {
        self.titulo = Some(titulo.into());
        self
    }

    pub fn with_medio(mut self, medio: impl Into<String>) -> Self {
        self.medio = Some(medio.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_fecha_publicacion(mut self, fecha: impl Into<String>) -> Self {
        self.fecha_publicacion = Some(fecha.into());
        self
    }

    /// Check the fields the payload validator would reject later, so bad
    /// input fails before any LLM call.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(url) = &self.url {
            if !is_http_uri(url) {
                return Err(ValidationError::InvalidField {
                    field: "metadata.url".to_string(),
                    reason: format!("'{}' is not an absolute http(s) URL", url),
                });
            }
        }
        if let Some(fecha) = &self.fecha_publicacion {
            if !is_iso_date(fecha) {
                return Err(ValidationError::InvalidField {
                    field: "metadata.fecha_publicacion".to_string(),
                    reason: format!("'{}' is not an ISO-8601 date", fecha),
                });
            }
        }
        Ok(())
    }
}

/// One piece of an article submitted to the pipeline. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    fragment_id: String,
    source_article_id: String,
    order_in_article: u32,
    raw_text: String,
    metadata: ArticleMetadata,
    received_at: DateTime<Utc>,
}

impl Fragment {
    /// Build a fragment, rejecting empty ids and blank text.
    pub fn new(
        fragment_id: impl Into<String>,
        source_article_id: impl Into<String>,
        order_in_article: u32,
        raw_text: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let fragment_id = fragment_id.into();
        let source_article_id = source_article_id.into();
        let raw_text = raw_text.into();

        if fragment_id.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "fragment_id" });
        }
        if source_article_id.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                field: "source_article_id",
            });
        }
        if raw_text.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "text" });
        }

        Ok(Self {
            fragment_id,
            source_article_id,
            order_in_article,
            raw_text,
            metadata: ArticleMetadata::default(),
            received_at: Utc::now(),
        })
    }

    /// A fragment that is a whole article on its own.
    pub fn standalone(id: impl Into<String>, text: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        Self::new(id.clone(), id, 0, text)
    }

    pub fn with_metadata(mut self, metadata: ArticleMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn fragment_id(&self) -> &str {
        &self.fragment_id
    }

    pub fn source_article_id(&self) -> &str {
        &self.source_article_id
    }

    pub fn order_in_article(&self) -> u32 {
        self.order_in_article
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn metadata(&self) -> &ArticleMetadata {
        &self.metadata
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Length in characters, as compared against the async threshold.
    pub fn char_len(&self) -> usize {
        self.raw_text.chars().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_is_rejected() {
        let err = Fragment::new("f1", "a1", 0, "   \n").unwrap_err();
        assert_eq!(err, ValidationError::EmptyField { field: "text" });
    }

    #[test]
    fn standalone_fragment_uses_id_as_article() {
        let fragment = Fragment::standalone("nota-1", "Texto").unwrap();
        assert_eq!(fragment.source_article_id(), "nota-1");
        assert_eq!(fragment.order_in_article(), 0);
    }

    #[test]
    fn metadata_validation() {
        assert!(ArticleMetadata::default().validate().is_ok());
        assert!(ArticleMetadata::default()
            .with_url("https://diario.example/nota")
            .with_fecha_publicacion("2024-05-12")
            .validate()
            .is_ok());

        let err = ArticleMetadata::default()
            .with_fecha_publicacion("12/05/2024")
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { ref field, .. } if field == "metadata.fecha_publicacion"
        ));

        let err = ArticleMetadata::default().with_url("diario/nota").validate().unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidField { ref field, .. } if field == "metadata.url"
        ));
    }

    #[test]
    fn metadata_keeps_unknown_keys() {
        let meta: ArticleMetadata = serde_json::from_value(serde_json::json!({
            "titulo": "Crisis hídrica",
            "autor": "Redacción"
        }))
        .unwrap();
        assert_eq!(meta.titulo.as_deref(), Some("Crisis hídrica"));
        assert_eq!(meta.extra["autor"], "Redacción");
    }
}
