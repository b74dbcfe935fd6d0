//! Payload validation.
//!
//! Checks referential integrity and field-level rules, collecting every
//! violation instead of stopping at the first one.

use chrono::{DateTime, NaiveDate};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use super::types::{PayloadNormalization, PersistencePayload};

/// One broken rule in a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// A reference to a temporal id that is not defined (or of the wrong kind)
    DanglingReference {
        element: String,
        field: String,
        target: String,
    },
    DuplicateId {
        id: String,
    },
    InvalidDate {
        element: String,
        field: String,
        value: String,
    },
    OutOfRange {
        element: String,
        field: String,
        value: f64,
        range: &'static str,
    },
    InvalidUri {
        element: String,
        field: String,
        value: String,
    },
    EmptyField {
        element: String,
        field: String,
    },
}

impl Violation {
    pub fn is_referential(&self) -> bool {
        matches!(
            self,
            Violation::DanglingReference { .. } | Violation::DuplicateId { .. }
        )
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::DanglingReference { element, field, target } => {
                write!(f, "{}.{} references undefined '{}'", element, field, target)
            }
            Violation::DuplicateId { id } => write!(f, "duplicate temporal id '{}'", id),
            Violation::InvalidDate { element, field, value } => {
                write!(f, "{}.{} is not an ISO-8601 date: '{}'", element, field, value)
            }
            Violation::OutOfRange { element, field, value, range } => {
                write!(f, "{}.{} = {} outside {}", element, field, value, range)
            }
            Violation::InvalidUri { element, field, value } => {
                write!(f, "{}.{} is not a valid URI: '{}'", element, field, value)
            }
            Violation::EmptyField { element, field } => {
                write!(f, "{}.{} must not be empty", element, field)
            }
        }
    }
}

/// Every violation found in a payload.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("payload failed validation with {} violation(s): {}", .violations.len(), join(.violations))]
pub struct PayloadValidationError {
    pub violations: Vec<Violation>,
}

fn join(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PayloadValidationError {
    /// `ReferentialIntegrityError` when any reference is broken, otherwise
    /// `ValidationError`.
    pub fn error_type(&self) -> &'static str {
        if self.is_referential() {
            "ReferentialIntegrityError"
        } else {
            "ValidationError"
        }
    }

    pub fn is_referential(&self) -> bool {
        self.violations.iter().any(Violation::is_referential)
    }
}

/// Accepts `YYYY-MM-DD` and RFC 3339 datetimes.
pub fn is_iso_date(value: &str) -> bool {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() || DateTime::parse_from_rfc3339(value).is_ok()
}

/// Absolute `http`/`https` URL with a host.
pub fn is_http_uri(value: &str) -> bool {
    url::Url::parse(value)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

struct Checker {
    violations: Vec<Violation>,
}

impl Checker {
    fn reference(&mut self, defined: &HashSet<&str>, element: &str, field: &str, target: Option<&str>) {
        if let Some(target) = target {
            if !defined.contains(target) {
                self.violations.push(Violation::DanglingReference {
                    element: element.to_string(),
                    field: field.to_string(),
                    target: target.to_string(),
                });
            }
        }
    }

    fn date(&mut self, element: &str, field: &str, value: Option<&str>) {
        if let Some(value) = value {
            if !is_iso_date(value) {
                self.violations.push(Violation::InvalidDate {
                    element: element.to_string(),
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
        }
    }

    fn range(&mut self, element: &str, field: &str, value: f64, min: f64, max: f64, range: &'static str) {
        if !(min..=max).contains(&value) {
            self.violations.push(Violation::OutOfRange {
                element: element.to_string(),
                field: field.to_string(),
                value,
                range,
            });
        }
    }

    fn non_empty(&mut self, element: &str, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.violations.push(Violation::EmptyField {
                element: element.to_string(),
                field: field.to_string(),
            });
        }
    }

    fn uri(&mut self, element: &str, field: &str, value: Option<&str>) {
        let Some(value) = value else { return };
        if !is_http_uri(value) {
            self.violations.push(Violation::InvalidUri {
                element: element.to_string(),
                field: field.to_string(),
                value: value.to_string(),
            });
        }
    }
}

/// Validate a payload, reporting all violations at once.
pub fn validate_payload(payload: &PersistencePayload) -> Result<(), PayloadValidationError> {
    let mut c = Checker {
        violations: Vec::new(),
    };

    // Temporal ids are unique across the whole payload
    let mut seen = HashSet::new();
    let all_ids = payload
        .hechos
        .iter()
        .map(|h| h.id_temporal.as_str())
        .chain(payload.entidades.iter().map(|e| e.id_temporal.as_str()))
        .chain(payload.citas.iter().map(|x| x.id_temporal.as_str()))
        .chain(payload.datos_cuantitativos.iter().map(|d| d.id_temporal.as_str()))
        .chain(payload.relaciones_hechos.iter().map(|r| r.id_temporal.as_str()))
        .chain(payload.relaciones_entidades.iter().map(|r| r.id_temporal.as_str()))
        .chain(payload.contradicciones.iter().map(|r| r.id_temporal.as_str()));
    for id in all_ids {
        if id.trim().is_empty() {
            c.non_empty("payload", "id_temporal", id);
        } else if !seen.insert(id) {
            c.violations.push(Violation::DuplicateId { id: id.to_string() });
        }
    }

    let hechos: HashSet<&str> = payload.hechos.iter().map(|h| h.id_temporal.as_str()).collect();
    let entidades: HashSet<&str> = payload.entidades.iter().map(|e| e.id_temporal.as_str()).collect();

    let m = &payload.metadata;
    c.non_empty("metadata", "fragment_id", &m.fragment_id);
    c.non_empty("metadata", "source_article_id", &m.source_article_id);
    c.non_empty("metadata", "checksum", &m.checksum);
    c.date("metadata", "fecha_publicacion", m.fecha_publicacion.as_deref());
    c.uri("metadata", "url", m.url.as_deref());
    if let Some(score) = m.puntuacion_triaje {
        c.range("metadata", "puntuacion_triaje", score, 0.0, 25.0, "[0, 25]");
    }

    for h in &payload.hechos {
        let el = h.id_temporal.as_str();
        c.non_empty(el, "contenido", &h.contenido);
        c.date(el, "fecha_ocurrencia", h.fecha_ocurrencia.as_deref());
        c.range(el, "confianza", h.confianza, 0.0, 1.0, "[0, 1]");
        c.range(el, "relevancia", h.relevancia, 0.0, 1.0, "[0, 1]");
        if let (Some(start), Some(end)) = (h.offset_inicio, h.offset_fin) {
            if end < start {
                c.range(el, "offset_fin", end as f64, start as f64, f64::INFINITY, "[offset_inicio, ∞)");
            }
        }
        for entidad in &h.entidades {
            c.reference(&entidades, el, "entidades", Some(entidad));
        }
    }

    for e in &payload.entidades {
        let el = e.id_temporal.as_str();
        c.non_empty(el, "nombre", &e.nombre);
        c.range(el, "relevancia", e.relevancia, 0.0, 1.0, "[0, 1]");
        if let PayloadNormalization::Existente { similitud, .. } = &e.normalizacion {
            c.range(el, "similitud", *similitud, 0.0, 1.0, "[0, 1]");
        }
    }

    for x in &payload.citas {
        let el = x.id_temporal.as_str();
        c.non_empty(el, "texto", &x.texto);
        c.date(el, "fecha", x.fecha.as_deref());
        c.range(el, "confianza", x.confianza, 0.0, 1.0, "[0, 1]");
        c.range(el, "relevancia", x.relevancia, 0.0, 1.0, "[0, 1]");
        c.reference(&hechos, el, "hecho", x.hecho.as_deref());
        c.reference(&entidades, el, "entidad_emisora", x.entidad_emisora.as_deref());
    }

    for d in &payload.datos_cuantitativos {
        let el = d.id_temporal.as_str();
        c.non_empty(el, "indicador", &d.indicador);
        if !d.valor.is_finite() {
            c.range(el, "valor", d.valor, f64::MIN, f64::MAX, "finite");
        }
        c.range(el, "confianza", d.confianza, 0.0, 1.0, "[0, 1]");
        c.date(el, "periodo_inicio", d.periodo_inicio.as_deref());
        c.date(el, "periodo_fin", d.periodo_fin.as_deref());
        c.reference(&hechos, el, "hecho", d.hecho.as_deref());
        c.reference(&entidades, el, "entidad", d.entidad.as_deref());
    }

    for r in &payload.relaciones_hechos {
        let el = r.id_temporal.as_str();
        c.reference(&hechos, el, "hecho_origen", Some(&r.hecho_origen));
        c.reference(&hechos, el, "hecho_destino", Some(&r.hecho_destino));
        c.range(el, "fuerza", r.fuerza, 0.0, 1.0, "[0, 1]");
    }

    for r in &payload.relaciones_entidades {
        let el = r.id_temporal.as_str();
        c.reference(&entidades, el, "entidad_origen", Some(&r.entidad_origen));
        c.reference(&entidades, el, "entidad_destino", Some(&r.entidad_destino));
    }

    for r in &payload.contradicciones {
        let el = r.id_temporal.as_str();
        c.reference(&hechos, el, "hecho_principal", Some(&r.hecho_principal));
        c.reference(&hechos, el, "hecho_contradictorio", Some(&r.hecho_contradictorio));
        c.range(el, "grado", f64::from(r.grado), 1.0, 5.0, "[1, 5]");
    }

    if c.violations.is_empty() {
        Ok(())
    } else {
        Err(PayloadValidationError {
            violations: c.violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_dates() {
        assert!(is_iso_date("2024-02-29"));
        assert!(is_iso_date("2024-02-29T12:00:00Z"));
        assert!(!is_iso_date("2023-02-29"));
        assert!(!is_iso_date("29/02/2024"));
    }

    #[test]
    fn error_type_depends_on_violation_kinds() {
        let field_only = PayloadValidationError {
            violations: vec![Violation::EmptyField {
                element: "hecho_1".into(),
                field: "contenido".into(),
            }],
        };
        assert_eq!(field_only.error_type(), "ValidationError");

        let mixed = PayloadValidationError {
            violations: vec![
                Violation::EmptyField {
                    element: "hecho_1".into(),
                    field: "contenido".into(),
                },
                Violation::DanglingReference {
                    element: "cita_1".into(),
                    field: "hecho".into(),
                    target: "hecho_9".into(),
                },
            ],
        };
        assert_eq!(mixed.error_type(), "ReferentialIntegrityError");
        assert!(mixed.to_string().contains("2 violation(s)"));
        assert!(mixed.to_string().contains("cita_1.hecho references undefined 'hecho_9'"));
    }
}
