//! Reading LLM answers.
//!
//! Models wrap JSON in prose or code fences, quote numbers, and leave fields
//! out. The helpers here locate the JSON object in an answer and read fields
//! leniently; judging the values is left to each phase.

use serde_json::{Map, Value};

/// An LLM answer after the first parsing step.
///
/// Phase 1 accepts JSON or its labelled text format; one mapping step turns
/// any variant into a phase result.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmResponse<F> {
    /// A JSON object was found
    Json(Map<String, Value>),
    /// No JSON, but the text grammar matched
    Regex(F),
    /// Neither format could be read
    Error(String),
}

impl<F> LlmResponse<F> {
    /// Classify an answer: JSON first, then `text_parser`.
    pub fn parse(answer: &str, text_parser: impl FnOnce(&str) -> Option<F>) -> Self {
        if let Some(obj) = extract_json_object(answer) {
            return LlmResponse::Json(obj);
        }
        match text_parser(answer) {
            Some(parsed) => LlmResponse::Regex(parsed),
            None => LlmResponse::Error(format!(
                "answer is neither JSON nor the text format ({} chars)",
                answer.chars().count()
            )),
        }
    }
}

/// Find a JSON object in an LLM answer.
///
/// Tries, in order: the whole answer, a fenced code block, and the span from
/// the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let trimmed = text.trim();

    let as_object = |candidate: &str| match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    };

    if let Some(map) = as_object(trimmed) {
        return Some(map);
    }

    let fenced = if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        after.find("```").map(|end| &after[..end])
    } else if let Some(start) = trimmed.find("```\n") {
        let after = &trimmed[start + 4..];
        after.find("```").map(|end| &after[..end])
    } else {
        None
    };
    if let Some(map) = fenced.and_then(as_object) {
        return Some(map);
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => as_object(&trimmed[start..=end]),
        _ => None,
    }
}

/// Array field, empty when missing or of another type.
pub fn array<'a>(obj: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    match obj.get(key) {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

/// Non-empty string field. Numbers are accepted and rendered.
pub fn string(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty() && !s.eq_ignore_ascii_case("null")).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric field. Numeric strings are accepted, with `,` as decimal mark.
pub fn number(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

/// Unsigned integer field; accepts `3`, `3.0` and `"3"`.
pub fn unsigned(obj: &Map<String, Value>, key: &str) -> Option<u32> {
    let n = number(obj, key)?;
    (n >= 0.0 && n.fract() == 0.0 && n <= f64::from(u32::MAX)).then_some(n as u32)
}

/// Boolean field; accepts `true`, `"true"`, `"si"`, `"sí"`.
pub fn boolean(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    match obj.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "si" | "sí" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Integer list field; non-integer items are skipped.
pub fn unsigned_list(obj: &Map<String, Value>, key: &str) -> Vec<u32> {
    array(obj, key)
        .iter()
        .filter_map(|v| match v {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect()
}

/// String list field; blank items are skipped.
pub fn string_list(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    array(obj, key)
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a number written by a model: `1.234,5`, `12,5`, `1 200`, `45%`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut s: String = raw
        .trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if s.is_empty() {
        return None;
    }
    if s.contains(',') {
        // Spanish notation: '.' groups thousands, ',' marks decimals
        s = s.replace('.', "").replace(',', ".");
    }
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}
