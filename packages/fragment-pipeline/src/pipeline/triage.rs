//! Phase 1: relevance triage.
//!
//! Cleans the fragment, translates it when needed, and asks the LLM whether
//! it is worth processing. The answer may be JSON or the labelled text format
//! (five weighted subscores out of 5, a total out of 25, a decision keyword,
//! a justification and a bulleted list of key elements).
//!
//! Triage never fails a fragment: when the LLM cannot be reached or its
//! answer cannot be read, the fragment is accepted by fallback and the
//! cleaned, untranslated text goes forward.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::time::Instant;

use super::parse::{self, LlmResponse};
use super::prompts;
use super::PhaseContext;
use crate::traits::ResponseFormat;
use crate::types::{
    FallbackReason, ParseMode, Phase1Result, PhaseAudit, PhaseId, TriageDecision, TriageScores,
};

lazy_static! {
    // One pattern per subscore, in TriageScores field order
    static ref SCORE_REGEXES: Vec<Regex> = [
        r"RELEVANCIA\s+TEM[AÁ]TICA",
        r"ACTUALIDAD",
        r"IMPACTO",
        r"FIABILIDAD",
        r"DENSIDAD\s+INFORMATIVA",
    ]
    .iter()
    .map(|label| {
        Regex::new(&format!(r"(?im)^[\s\-*•]*{}\s*:\s*\**\s*(\d+(?:[.,]\d+)?)\s*/\s*5\b", label))
            .unwrap()
    })
    .collect();

    static ref TOTAL_REGEX: Regex = Regex::new(
        r"(?im)PUNTUACI[OÓ]N\s+TOTAL\s*:\s*\**\s*(\d+(?:[.,]\d+)?)\s*/\s*25\b"
    ).unwrap();

    static ref DECISION_REGEX: Regex = Regex::new(
        r"(?im)DECISI[OÓ]N\s*:\s*\**\s*(PROCESAR|DESCARTAR)"
    ).unwrap();

    static ref JUSTIFICATION_REGEX: Regex = Regex::new(
        r"(?im)^[\s\-*•]*JUSTIFICACI[OÓ]N\s*:\s*\**\s*(.+?)\s*$"
    ).unwrap();

    static ref KEY_ELEMENTS_REGEX: Regex = Regex::new(
        r"(?is)ELEMENTOS\s+CLAVE\s*:\s*\**(.*)"
    ).unwrap();
}

/// Fields read from a text-format triage answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextTriage {
    pub scores: [Option<u8>; 5],
    pub total: Option<f64>,
    /// `Some(true)` for PROCESAR
    pub procesar: Option<bool>,
    pub justificacion: Option<String>,
    pub elementos_clave: Vec<String>,
}

/// Read the labelled text format. `None` when neither a decision nor the
/// full set of subscores is present.
pub fn parse_triage_text(answer: &str) -> Option<TextTriage> {
    let mut parsed = TextTriage::default();

    for (slot, re) in parsed.scores.iter_mut().zip(SCORE_REGEXES.iter()) {
        *slot = re
            .captures(answer)
            .and_then(|c| parse::parse_number(&c[1]))
            .map(|n| n.round().clamp(0.0, 5.0) as u8);
    }
    parsed.total = TOTAL_REGEX
        .captures(answer)
        .and_then(|c| parse::parse_number(&c[1]));
    parsed.procesar = DECISION_REGEX
        .captures(answer)
        .map(|c| c[1].eq_ignore_ascii_case("PROCESAR"));
    parsed.justificacion = JUSTIFICATION_REGEX
        .captures(answer)
        .map(|c| c[1].trim_matches('*').trim().to_string())
        .filter(|s| !s.is_empty());

    if let Some(c) = KEY_ELEMENTS_REGEX.captures(answer) {
        parsed.elementos_clave = c[1]
            .lines()
            .map(str::trim)
            .skip_while(|l| l.is_empty())
            .take_while(|l| l.starts_with(['-', '*', '•']))
            .map(|l| l.trim_start_matches(['-', '*', '•']).trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
    }

    let all_scores = parsed.scores.iter().all(Option::is_some);
    (parsed.procesar.is_some() || all_scores).then_some(parsed)
}

/// Triage reading in a shape shared by both answer formats.
struct TriageReading {
    scores: Option<TriageScores>,
    total: Option<f64>,
    procesar: Option<bool>,
    justificacion: Option<String>,
    elementos_clave: Vec<String>,
}

fn scores_from_array(values: [Option<u8>; 5]) -> Option<TriageScores> {
    let [Some(a), Some(b), Some(c), Some(d), Some(e)] = values else {
        return None;
    };
    Some(TriageScores {
        relevancia_tematica: a,
        actualidad: b,
        impacto: c,
        fiabilidad: d,
        densidad_informativa: e,
    })
}

fn reading_from_json(obj: &Map<String, Value>) -> Option<TriageReading> {
    const KEYS: [&str; 5] = [
        "relevancia_tematica",
        "actualidad",
        "impacto",
        "fiabilidad",
        "densidad_informativa",
    ];

    let score_source = match obj.get("puntuaciones") {
        Some(Value::Object(inner)) => inner,
        _ => obj,
    };
    let scores = scores_from_array(KEYS.map(|k| {
        parse::number(score_source, k).map(|n| n.round().clamp(0.0, 5.0) as u8)
    }));

    let procesar = parse::string(obj, "decision")
        .or_else(|| parse::string(obj, "decisión"))
        .and_then(|d| match d.to_uppercase().as_str() {
            "PROCESAR" => Some(true),
            "DESCARTAR" => Some(false),
            _ => None,
        })
        .or_else(|| parse::boolean(obj, "es_relevante"));

    if scores.is_none() && procesar.is_none() {
        return None;
    }

    Some(TriageReading {
        scores,
        total: parse::number(obj, "puntuacion_total"),
        procesar,
        justificacion: parse::string(obj, "justificacion"),
        elementos_clave: parse::string_list(obj, "elementos_clave"),
    })
}

fn reading_from_text(text: TextTriage) -> TriageReading {
    TriageReading {
        scores: scores_from_array(text.scores),
        total: text.total,
        procesar: text.procesar,
        justificacion: text.justificacion,
        elementos_clave: text.elementos_clave,
    }
}

/// Run Phase 1 for one fragment.
pub async fn run(ctx: &PhaseContext<'_>, raw_text: &str) -> Phase1Result {
    let started = Instant::now();
    let settings = &ctx.config.phases;
    let mut audit = PhaseAudit::new(PhaseId::Triage);
    audit.model = Some(ctx.llm.model_name());
    audit.prompt_hash = Some(prompts::prompt_hash(prompts::TRIAGE_PROMPT));

    let cleaned = ctx.preprocessor.clean(raw_text);
    let idioma = ctx.preprocessor.detect_language(&cleaned);

    let text_for_llm = if idioma.eq_ignore_ascii_case(&settings.target_language) {
        cleaned.clone()
    } else {
        match ctx.preprocessor.translate(&cleaned, &idioma).await {
            Ok(translated) if !translated.trim().is_empty() => translated,
            Ok(_) => {
                audit.fallback(FallbackReason::TextoSinTraducir);
                audit.warn(ctx.fragment_id, "traducción vacía, se usa el texto original");
                cleaned.clone()
            }
            Err(e) => {
                audit.fallback(FallbackReason::TextoSinTraducir);
                audit.warn(
                    ctx.fragment_id,
                    format!("traducción fallida desde '{}': {}", idioma, e),
                );
                cleaned.clone()
            }
        }
    };

    let prompt = prompts::format_triage_prompt(&text_for_llm);
    let answer = match ctx.call_llm(PhaseId::Triage, &prompt, ResponseFormat::Text).await {
        Ok(answer) => answer,
        Err(e) => {
            audit.fallback(FallbackReason::ErrorLlm);
            audit.warn(ctx.fragment_id, crate::error::truncate_message(&e.to_string()));
            return fallback_result(TriageDecision::FallbackErrorLlm, idioma, cleaned, audit, started);
        }
    };

    let reading = match LlmResponse::parse(&answer, parse_triage_text) {
        LlmResponse::Json(obj) => {
            audit.parse_mode = Some(ParseMode::Json);
            reading_from_json(&obj)
        }
        LlmResponse::Regex(text) => {
            audit.parse_mode = Some(ParseMode::Regex);
            Some(reading_from_text(text))
        }
        LlmResponse::Error(reason) => {
            audit.warn(ctx.fragment_id, reason);
            None
        }
    };

    let Some(reading) = reading else {
        audit.fallback(FallbackReason::ErrorParseo);
        return fallback_result(TriageDecision::FallbackErrorParseo, idioma, cleaned, audit, started);
    };

    let total = reading
        .scores
        .map(|s| s.weighted_total())
        .or(reading.total.map(|t| t.clamp(0.0, 25.0)));

    let es_relevante = match reading.procesar {
        Some(procesar) => procesar,
        None => total.is_some_and(|t| t >= settings.relevance_threshold),
    };
    let decision = if es_relevante {
        TriageDecision::Procesar
    } else {
        TriageDecision::Descartar
    };

    let audit = audit.finish(started);
    tracing::info!(
        fragment_id = ctx.fragment_id,
        phase = %PhaseId::Triage,
        decision = %decision,
        puntuacion_total = total.unwrap_or_default(),
        duration_ms = audit.duration_ms,
        "Triage completed"
    );

    Phase1Result {
        es_relevante,
        decision,
        puntuaciones: reading.scores,
        puntuacion_total: total,
        justificacion: reading
            .justificacion
            .map(|j| super::sanitize::sanitize_text(&j, settings.max_text_field_chars)),
        elementos_clave: reading.elementos_clave,
        idioma_detectado: idioma,
        texto_limpio: cleaned,
        texto_para_siguiente_fase: text_for_llm,
        audit,
    }
}

fn fallback_result(
    decision: TriageDecision,
    idioma: String,
    cleaned: String,
    audit: PhaseAudit,
    started: Instant,
) -> Phase1Result {
    let audit = audit.finish(started);
    tracing::warn!(
        phase = %PhaseId::Triage,
        decision = %decision,
        duration_ms = audit.duration_ms,
        "Triage accepted by fallback"
    );
    Phase1Result {
        es_relevante: true,
        decision,
        puntuaciones: None,
        puntuacion_total: None,
        justificacion: None,
        elementos_clave: Vec::new(),
        idioma_detectado: idioma,
        texto_limpio: cleaned.clone(),
        texto_para_siguiente_fase: cleaned,
        audit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::ApiError;
    use crate::testing::{fast_config, MockLlm, MockPersistence, MockPreprocessor};
    use crate::traits::preprocessor::MockPreprocessor as AutoPreprocessor;

    const TEXT_ANSWER: &str = "\
RELEVANCIA TEMÁTICA: 4/5
ACTUALIDAD: 3/5
IMPACTO: 2/5
FIABILIDAD: 5/5
DENSIDAD INFORMATIVA: 1/5
PUNTUACIÓN TOTAL: 15.6/25
DECISIÓN: PROCESAR
JUSTIFICACIÓN: Anuncio oficial con cifras.
ELEMENTOS CLAVE:
- presupuesto
- ministerio de salud
";

    #[test]
    fn text_grammar_is_parsed() {
        let parsed = parse_triage_text(TEXT_ANSWER).unwrap();
        assert_eq!(parsed.scores, [Some(4), Some(3), Some(2), Some(5), Some(1)]);
        assert_eq!(parsed.total, Some(15.6));
        assert_eq!(parsed.procesar, Some(true));
        assert_eq!(parsed.justificacion.as_deref(), Some("Anuncio oficial con cifras."));
        assert_eq!(parsed.elementos_clave, vec!["presupuesto", "ministerio de salud"]);
    }

    #[test]
    fn text_grammar_tolerates_case_and_missing_accents() {
        let parsed = parse_triage_text("decision: descartar\njustificacion: ruido").unwrap();
        assert_eq!(parsed.procesar, Some(false));
        assert_eq!(parsed.justificacion.as_deref(), Some("ruido"));
    }

    #[test]
    fn unrelated_text_does_not_parse() {
        assert!(parse_triage_text("Me parece un texto interesante.").is_none());
    }

    fn ctx<'a>(
        llm: &'a MockLlm,
        pre: &'a dyn crate::traits::Preprocessor,
        db: &'a MockPersistence,
        config: &'a PipelineConfig,
    ) -> PhaseContext<'a> {
        PhaseContext {
            fragment_id: "f1",
            llm,
            preprocessor: pre,
            persistence: db,
            config,
        }
    }

    #[tokio::test]
    async fn text_answer_without_decision_uses_threshold() {
        let answer = TEXT_ANSWER.replace("DECISIÓN: PROCESAR\n", "");
        let llm = MockLlm::new().with_triage(answer);
        let pre = MockPreprocessor::new();
        let db = MockPersistence::new();
        let config = fast_config();

        let result = run(&ctx(&llm, &pre, &db, &config), "Texto de prueba").await;
        // 15.6 >= 13
        assert!(result.es_relevante);
        assert_eq!(result.decision, TriageDecision::Procesar);
        assert_eq!(result.audit.parse_mode, Some(ParseMode::Regex));
        assert_eq!(result.puntuacion_total, Some(15.6));
    }

    #[tokio::test]
    async fn json_answer_can_discard() {
        let llm = MockLlm::new().with_triage(
            r#"{"puntuaciones": {"relevancia_tematica": 1, "actualidad": 1, "impacto": 1,
                "fiabilidad": 2, "densidad_informativa": 1},
               "decision": "DESCARTAR", "justificacion": "Publicidad"}"#,
        );
        let pre = MockPreprocessor::new();
        let db = MockPersistence::new();
        let config = fast_config();

        let result = run(&ctx(&llm, &pre, &db, &config), "Compre ya").await;
        assert!(!result.es_relevante);
        assert_eq!(result.decision, TriageDecision::Descartar);
        assert_eq!(result.audit.parse_mode, Some(ParseMode::Json));
    }

    #[tokio::test]
    async fn exhausted_llm_accepts_cleaned_untranslated_text() {
        let llm = MockLlm::new().with_triage_error(ApiError::connection("refused"));
        let pre = MockPreprocessor::new()
            .with_language("en")
            .with_translation("texto traducido");
        let db = MockPersistence::new();
        let config = fast_config();

        let result = run(&ctx(&llm, &pre, &db, &config), "  Raw   english text ").await;
        assert!(result.es_relevante);
        assert_eq!(result.decision, TriageDecision::FallbackErrorLlm);
        assert_eq!(result.texto_para_siguiente_fase, "Raw english text");
        assert_eq!(result.audit.fallbacks, vec![FallbackReason::ErrorLlm]);
        assert_eq!(llm.triage_calls(), config.retry.llm_max_attempts as usize);
    }

    #[tokio::test]
    async fn unreadable_answer_is_a_parse_fallback() {
        let llm = MockLlm::new().with_triage("No sé qué decir.");
        let pre = MockPreprocessor::new();
        let db = MockPersistence::new();
        let config = fast_config();

        let result = run(&ctx(&llm, &pre, &db, &config), "Texto").await;
        assert!(result.es_relevante);
        assert_eq!(result.decision, TriageDecision::FallbackErrorParseo);
    }

    #[tokio::test]
    async fn translation_failure_keeps_original_text() {
        let mut pre = AutoPreprocessor::new();
        pre.expect_clean().returning(|t| t.trim().to_string());
        pre.expect_detect_language().returning(|_| "fr".to_string());
        pre.expect_translate()
            .times(1)
            .returning(|_, _| Err(ApiError::timeout("translator down")));

        let llm = MockLlm::new();
        let db = MockPersistence::new();
        let config = fast_config();

        let result = run(&ctx(&llm, &pre, &db, &config), " Bonjour ").await;
        assert_eq!(result.texto_para_siguiente_fase, "Bonjour");
        assert!(result.audit.fallbacks.contains(&FallbackReason::TextoSinTraducir));
        assert_eq!(result.idioma_detectado, "fr");
    }
}
