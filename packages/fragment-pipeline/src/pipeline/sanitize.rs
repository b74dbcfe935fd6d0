//! Field sanitization for LLM-produced elements.
//!
//! Free text is stripped of control characters, whitespace-collapsed,
//! escaped and truncated. Numeric fields are range-checked; every correction
//! leaves a warning in the phase audit.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;

use crate::config::PhaseSettings;
use crate::pipeline::parse;
use crate::types::PhaseAudit;

/// Clean a free-text field: no control characters, single spaces, `<`/`>`
/// escaped, at most `max_chars` characters.
pub fn sanitize_text(raw: &str, max_chars: usize) -> String {
    let collapsed = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let truncated: String = collapsed.chars().take(max_chars).collect();
    truncated.replace('<', "&lt;").replace('>', "&gt;")
}

/// Normalize a date to `YYYY-MM-DD`.
///
/// Accepts full dates, RFC 3339 datetimes, `DD/MM/YYYY`, `YYYY-MM` (first of
/// the month) and `YYYY` (first of the year).
pub fn normalize_date(raw: &str) -> Option<String> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
        .or_else(|| NaiveDate::parse_from_str(s, "%d/%m/%Y").ok())
        .or_else(|| NaiveDate::parse_from_str(&format!("{}-01", s), "%Y-%m-%d").ok())
        .or_else(|| {
            (s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit()))
                .then(|| NaiveDate::parse_from_str(&format!("{}-01-01", s), "%Y-%m-%d").ok())
                .flatten()
        })?;

    Some(date.format("%Y-%m-%d").to_string())
}

/// Applies the field rules for one fragment and records corrections.
pub struct FieldSanitizer<'a> {
    settings: &'a PhaseSettings,
    audit: &'a mut PhaseAudit,
    fragment_id: &'a str,
}

impl<'a> FieldSanitizer<'a> {
    pub fn new(settings: &'a PhaseSettings, audit: &'a mut PhaseAudit, fragment_id: &'a str) -> Self {
        Self {
            settings,
            audit,
            fragment_id,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.audit.warn(self.fragment_id, message);
    }

    /// Sanitized free text, `None` when nothing is left.
    pub fn text(&self, raw: Option<String>) -> Option<String> {
        raw.map(|s| sanitize_text(&s, self.settings.max_text_field_chars))
            .filter(|s| !s.is_empty())
    }

    /// Confidence in [0, 1]. Missing values take the default silently;
    /// out-of-range or non-numeric values take it with a warning.
    pub fn confidence(&mut self, label: &str, raw: Option<&Value>) -> f64 {
        let default = self.settings.default_confidence;
        let value = match raw {
            None | Some(Value::Null) => return default,
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => parse::parse_number(s),
            Some(_) => None,
        };

        match value {
            Some(v) if (0.0..=1.0).contains(&v) => v,
            Some(v) => {
                self.warn(format!(
                    "confianza fuera de rango en {}: {}, se usa {}",
                    label, v, default
                ));
                default
            }
            None => {
                self.warn(format!(
                    "confianza no numérica en {}, se usa {}",
                    label, default
                ));
                default
            }
        }
    }

    /// Relevance in [0, 1]. Missing means 0.5; out-of-range values are clamped.
    pub fn relevance(&mut self, label: &str, raw: Option<f64>) -> f64 {
        self.unit_interval(label, "relevancia", raw, 0.5)
    }

    /// Strength/score in [0, 1], clamped with a warning.
    pub fn unit_interval(&mut self, label: &str, field: &str, raw: Option<f64>, default: f64) -> f64 {
        match raw {
            None => default,
            Some(v) if (0.0..=1.0).contains(&v) => v,
            Some(v) => {
                let clamped = v.clamp(0.0, 1.0);
                self.warn(format!(
                    "{} fuera de rango en {}: {}, se ajusta a {}",
                    field, label, v, clamped
                ));
                clamped
            }
        }
    }

    /// Character offsets; both are dropped when `end < start`.
    pub fn offsets(
        &mut self,
        label: &str,
        start: Option<u32>,
        end: Option<u32>,
    ) -> (Option<usize>, Option<usize>) {
        match (start, end) {
            (Some(s), Some(e)) if e < s => {
                self.warn(format!(
                    "offsets inválidos en {}: fin {} < inicio {}, se anulan",
                    label, e, s
                ));
                (None, None)
            }
            (s, e) => (s.map(|v| v as usize), e.map(|v| v as usize)),
        }
    }

    /// ISO date, or `None` with a warning when the value is not a date.
    pub fn date(&mut self, label: &str, field: &str, raw: Option<String>) -> Option<String> {
        let raw = raw?;
        match normalize_date(&raw) {
            Some(date) => Some(date),
            None => {
                self.warn(format!("fecha inválida en {}.{}: '{}'", label, field, raw));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhaseId;
    use serde_json::json;

    #[test]
    fn text_is_cleaned_escaped_and_truncated() {
        assert_eq!(
            sanitize_text("  <b>Hola</b>\n\u{0000}mundo  ", 100),
            "&lt;b&gt;Hola&lt;/b&gt; mundo"
        );
        assert_eq!(sanitize_text("abcdef", 3), "abc");
    }

    #[test]
    fn dates_are_normalized() {
        assert_eq!(normalize_date("2024-03-05").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("05/03/2024").as_deref(), Some("2024-03-05"));
        assert_eq!(normalize_date("2024-03").as_deref(), Some("2024-03-01"));
        assert_eq!(normalize_date("2024").as_deref(), Some("2024-01-01"));
        assert_eq!(
            normalize_date("2024-03-05T10:00:00+01:00").as_deref(),
            Some("2024-03-05")
        );
        assert_eq!(normalize_date("ayer"), None);
        assert_eq!(normalize_date("2024-13-40"), None);
    }

    #[test]
    fn out_of_range_confidence_takes_default_with_warning() {
        let settings = PhaseSettings::default();
        let mut audit = PhaseAudit::new(PhaseId::Extraction);
        let mut s = FieldSanitizer::new(&settings, &mut audit, "f1");

        assert_eq!(s.confidence("hecho 1", Some(&json!(1.5))), 0.8);
        assert_eq!(s.confidence("hecho 2", Some(&json!(-0.3))), 0.8);
        assert_eq!(s.confidence("hecho 3", Some(&json!(0.42))), 0.42);
        assert_eq!(s.confidence("hecho 4", None), 0.8);

        assert_eq!(audit.warnings.len(), 2);
        assert!(audit.warnings[0].contains("1.5"));
        assert!(audit.warnings[1].contains("-0.3"));
    }

    #[test]
    fn inverted_offsets_are_nulled() {
        let settings = PhaseSettings::default();
        let mut audit = PhaseAudit::new(PhaseId::Extraction);
        let mut s = FieldSanitizer::new(&settings, &mut audit, "f1");

        assert_eq!(s.offsets("hecho 1", Some(10), Some(4)), (None, None));
        assert_eq!(s.offsets("hecho 2", Some(4), Some(10)), (Some(4), Some(10)));
        assert_eq!(s.offsets("hecho 3", None, Some(10)), (None, Some(10)));
        assert_eq!(audit.warnings.len(), 1);
    }

    #[test]
    fn relevance_is_clamped() {
        let settings = PhaseSettings::default();
        let mut audit = PhaseAudit::new(PhaseId::Extraction);
        let mut s = FieldSanitizer::new(&settings, &mut audit, "f1");

        assert_eq!(s.relevance("e", Some(7.0)), 1.0);
        assert_eq!(s.relevance("e", Some(-0.2)), 0.0);
        assert_eq!(s.relevance("e", Some(0.7)), 0.7);
        assert_eq!(s.relevance("e", None), 0.5);
        assert_eq!(audit.warnings.len(), 2);
    }
}
