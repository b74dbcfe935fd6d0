//! Per-phase results and audit metadata.
//!
//! Each phase consumes the result of the previous one only. Extracted content
//! moves forward through the results: Phase 2 creates it, Phase 3 adds quotes
//! and data, Phase 4 attaches normalization verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

use super::elements::ExtractedContent;

/// Pipeline step, as recorded in audits, logs and job errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseId {
    #[serde(rename = "fase_1_triaje")]
    Triage,
    #[serde(rename = "fase_2_extraccion")]
    Extraction,
    #[serde(rename = "fase_3_citas_datos")]
    QuotesData,
    #[serde(rename = "fase_4_normalizacion")]
    Normalization,
    #[serde(rename = "payload")]
    Payload,
    #[serde(rename = "persistencia")]
    Persistence,
}

impl PhaseId {
    pub const PIPELINE: [PhaseId; 4] = [
        PhaseId::Triage,
        PhaseId::Extraction,
        PhaseId::QuotesData,
        PhaseId::Normalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Triage => "fase_1_triaje",
            PhaseId::Extraction => "fase_2_extraccion",
            PhaseId::QuotesData => "fase_3_citas_datos",
            PhaseId::Normalization => "fase_4_normalizacion",
            PhaseId::Payload => "payload",
            PhaseId::Persistence => "persistencia",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a phase accepted content it could not fully process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackReason {
    /// The LLM call failed for good
    #[serde(rename = "FALLBACK_ACEPTADO_ERROR_LLM")]
    ErrorLlm,
    /// The LLM answered but the answer could not be parsed
    #[serde(rename = "FALLBACK_ACEPTADO_ERROR_PARSEO")]
    ErrorParseo,
    /// Translation failed; the untranslated text went forward
    #[serde(rename = "FALLBACK_TEXTO_SIN_TRADUCIR")]
    TextoSinTraducir,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::ErrorLlm => "FALLBACK_ACEPTADO_ERROR_LLM",
            FallbackReason::ErrorParseo => "FALLBACK_ACEPTADO_ERROR_PARSEO",
            FallbackReason::TextoSinTraducir => "FALLBACK_TEXTO_SIN_TRADUCIR",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an LLM answer was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Json,
    Regex,
}

/// Audit record of one phase execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseAudit {
    pub phase: PhaseId,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Model that answered, when the phase called the LLM
    pub model: Option<String>,
    /// Hash of the prompt template used
    pub prompt_hash: Option<String>,
    pub parse_mode: Option<ParseMode>,
    #[serde(default)]
    pub fallbacks: Vec<FallbackReason>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// The phase did not run (irrelevant fragment, nothing to work on)
    #[serde(default)]
    pub skipped: bool,
}

impl PhaseAudit {
    pub fn new(phase: PhaseId) -> Self {
        Self {
            phase,
            started_at: Utc::now(),
            duration_ms: 0,
            model: None,
            prompt_hash: None,
            parse_mode: None,
            fallbacks: Vec::new(),
            warnings: Vec::new(),
            skipped: false,
        }
    }

    /// Audit of a phase that did not run.
    pub fn skipped(phase: PhaseId, reason: impl Into<String>) -> Self {
        let mut audit = Self::new(phase);
        audit.skipped = true;
        audit.warnings.push(reason.into());
        audit
    }

    /// Record a warning and log it.
    pub fn warn(&mut self, fragment_id: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(fragment_id, phase = %self.phase, warning = %message, "Phase warning");
        self.warnings.push(message);
    }

    pub fn fallback(&mut self, reason: FallbackReason) {
        self.fallbacks.push(reason);
    }

    /// Stamp the elapsed time since `started`.
    pub fn finish(mut self, started: Instant) -> Self {
        self.duration_ms = started.elapsed().as_millis() as u64;
        self
    }
}

/// Triage decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriageDecision {
    #[serde(rename = "PROCESAR")]
    Procesar,
    #[serde(rename = "DESCARTAR")]
    Descartar,
    #[serde(rename = "FALLBACK_ACEPTADO_ERROR_LLM")]
    FallbackErrorLlm,
    #[serde(rename = "FALLBACK_ACEPTADO_ERROR_PARSEO")]
    FallbackErrorParseo,
}

impl TriageDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriageDecision::Procesar => "PROCESAR",
            TriageDecision::Descartar => "DESCARTAR",
            TriageDecision::FallbackErrorLlm => "FALLBACK_ACEPTADO_ERROR_LLM",
            TriageDecision::FallbackErrorParseo => "FALLBACK_ACEPTADO_ERROR_PARSEO",
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            TriageDecision::FallbackErrorLlm | TriageDecision::FallbackErrorParseo
        )
    }
}

impl fmt::Display for TriageDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five triage subscores, each out of 5.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TriageScores {
    pub relevancia_tematica: u8,
    pub actualidad: u8,
    pub impacto: u8,
    pub fiabilidad: u8,
    pub densidad_informativa: u8,
}

impl TriageScores {
    /// Weights of the subscores, in field order. They sum to 5, so the
    /// weighted total is out of 25.
    pub const WEIGHTS: [f64; 5] = [1.4, 1.0, 1.2, 0.8, 0.6];

    pub fn as_array(&self) -> [u8; 5] {
        [
            self.relevancia_tematica,
            self.actualidad,
            self.impacto,
            self.fiabilidad,
            self.densidad_informativa,
        ]
    }

    pub fn weighted_total(&self) -> f64 {
        let total: f64 = self
            .as_array()
            .iter()
            .zip(Self::WEIGHTS)
            .map(|(score, weight)| f64::from(*score) * weight)
            .sum();
        (total * 100.0).round() / 100.0
    }
}

/// Result of Phase 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase1Result {
    pub es_relevante: bool,
    pub decision: TriageDecision,
    pub puntuaciones: Option<TriageScores>,
    /// Weighted total out of 25
    pub puntuacion_total: Option<f64>,
    pub justificacion: Option<String>,
    #[serde(default)]
    pub elementos_clave: Vec<String>,
    pub idioma_detectado: String,
    /// Cleaned source text, never translated. Quotes are grounded on it.
    #[serde(default)]
    pub texto_limpio: String,
    /// Text the next phases work on
    pub texto_para_siguiente_fase: String,
    pub audit: PhaseAudit,
}

/// Result of Phase 2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase2Result {
    pub contenido: ExtractedContent,
    /// Text the extraction ran on (translated when needed)
    pub texto: String,
    /// Cleaned source text carried over from Phase 1
    #[serde(default)]
    pub texto_original: String,
    pub audit: PhaseAudit,
}

/// Result of Phase 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase3Result {
    pub contenido: ExtractedContent,
    pub audit: PhaseAudit,
}

/// Outcome of normalizing one entity against the existing catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultado", rename_all = "snake_case")]
pub enum NormalizationVerdict {
    /// Same entity as an existing record
    Match {
        entidad_existente_id: String,
        nombre_existente: String,
        similitud: f64,
    },
    /// No candidate above the threshold
    New,
    /// The similarity search failed
    Error { mensaje: String },
}

impl NormalizationVerdict {
    pub fn is_error(&self) -> bool {
        matches!(self, NormalizationVerdict::Error { .. })
    }
}

/// Verdict for one Phase 2 entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNormalization {
    pub entidad_id: u32,
    pub verdict: NormalizationVerdict,
}

/// Overall normalization outcome for a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizationStatus {
    /// Every entity got a verdict
    Completo,
    /// Some searches failed
    Parcial,
    /// Every search failed
    Fallido,
    /// No entities to normalize
    #[serde(rename = "No_Requerido")]
    NoRequerido,
}

impl NormalizationStatus {
    pub fn from_verdicts(verdicts: &[EntityNormalization]) -> Self {
        if verdicts.is_empty() {
            return NormalizationStatus::NoRequerido;
        }
        let errors = verdicts.iter().filter(|v| v.verdict.is_error()).count();
        if errors == 0 {
            NormalizationStatus::Completo
        } else if errors == verdicts.len() {
            NormalizationStatus::Fallido
        } else {
            NormalizationStatus::Parcial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NormalizationStatus::Completo => "Completo",
            NormalizationStatus::Parcial => "Parcial",
            NormalizationStatus::Fallido => "Fallido",
            NormalizationStatus::NoRequerido => "No_Requerido",
        }
    }
}

/// Result of Phase 4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase4Result {
    pub contenido: ExtractedContent,
    pub normalizaciones: Vec<EntityNormalization>,
    pub estado: NormalizationStatus,
    pub audit: PhaseAudit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_total_is_out_of_twenty_five() {
        let max = TriageScores {
            relevancia_tematica: 5,
            actualidad: 5,
            impacto: 5,
            fiabilidad: 5,
            densidad_informativa: 5,
        };
        assert!((max.weighted_total() - 25.0).abs() < 1e-9);

        let mixed = TriageScores {
            relevancia_tematica: 4,
            actualidad: 3,
            impacto: 2,
            fiabilidad: 5,
            densidad_informativa: 1,
        };
        // 5.6 + 3.0 + 2.4 + 4.0 + 0.6
        assert!((mixed.weighted_total() - 15.6).abs() < 1e-9);
    }

    #[test]
    fn normalization_status_from_verdicts() {
        let ok = EntityNormalization {
            entidad_id: 1,
            verdict: NormalizationVerdict::New,
        };
        let failed = EntityNormalization {
            entidad_id: 2,
            verdict: NormalizationVerdict::Error {
                mensaje: "down".into(),
            },
        };

        assert_eq!(NormalizationStatus::from_verdicts(&[]), NormalizationStatus::NoRequerido);
        assert_eq!(
            NormalizationStatus::from_verdicts(&[ok.clone()]),
            NormalizationStatus::Completo
        );
        assert_eq!(
            NormalizationStatus::from_verdicts(&[ok, failed.clone()]),
            NormalizationStatus::Parcial
        );
        assert_eq!(
            NormalizationStatus::from_verdicts(&[failed]),
            NormalizationStatus::Fallido
        );
    }

    #[test]
    fn statuses_serialize_with_their_public_names() {
        assert_eq!(
            serde_json::to_string(&NormalizationStatus::NoRequerido).unwrap(),
            "\"No_Requerido\""
        );
        assert_eq!(
            serde_json::to_string(&PhaseId::QuotesData).unwrap(),
            "\"fase_3_citas_datos\""
        );
    }
}
