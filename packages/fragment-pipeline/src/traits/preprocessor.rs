//! Text preprocessing collaborator.

use async_trait::async_trait;

use crate::error::ApiError;

/// Cleaning, language detection and translation of raw fragment text.
///
/// Cleaning and detection are local and cannot fail. Translation usually calls
/// an external service and may fail; the pipeline then keeps the
/// untranslated text.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Normalize the raw text (markup, whitespace, boilerplate).
    fn clean(&self, text: &str) -> String;

    /// ISO 639-1 code of the text's language.
    fn detect_language(&self, text: &str) -> String;

    /// Translate `text` from language `from` into the pipeline's language.
    async fn translate(&self, text: &str, from: &str) -> Result<String, ApiError>;
}

/// Preprocessor that only collapses whitespace and assumes the target
/// language. Useful when the caller already cleaned the text.
#[derive(Debug, Clone)]
pub struct PassthroughPreprocessor {
    language: String,
}

impl PassthroughPreprocessor {
    pub fn new(language: impl Into<String>) -> Self {
        Self {
            language: language.into(),
        }
    }
}

impl Default for PassthroughPreprocessor {
    fn default() -> Self {
        Self::new("es")
    }
}

#[async_trait]
impl Preprocessor for PassthroughPreprocessor {
    fn clean(&self, text: &str) -> String {
        text.lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    fn detect_language(&self, _text: &str) -> String {
        self.language.clone()
    }

    async fn translate(&self, text: &str, _from: &str) -> Result<String, ApiError> {
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_keeps_lines_and_collapses_spaces() {
        let pre = PassthroughPreprocessor::default();
        assert_eq!(pre.clean("  uno   dos \n\ttres  "), "uno dos\ntres");
        assert_eq!(pre.detect_language("hola"), "es");
    }
}
