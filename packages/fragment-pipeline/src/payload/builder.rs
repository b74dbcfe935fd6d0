//! Payload construction.
//!
//! This is the only place integer element ids become string temporal ids.
//! The builder also merges normalization verdicts into entities, gathers the
//! audit notes of every phase, validates, and stamps the checksum.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::types::*;
use super::validate::{validate_payload, PayloadValidationError};
use crate::ids::ElementKind;
use crate::types::{
    EntityNormalization, ExtractedContent, Fragment, NormalizationStatus, NormalizationVerdict,
    Phase1Result, PhaseAudit,
};

/// Temporal id of an element: `hecho_3`, `entidad_1`...
pub fn temporal_id(kind: ElementKind, id: u32) -> String {
    format!("{}_{}", kind, id)
}

fn temporal_ref(kind: ElementKind, id: Option<u32>) -> Option<String> {
    id.map(|id| temporal_id(kind, id))
}

/// Everything a payload is built from.
pub struct PayloadInput<'a> {
    pub fragment: &'a Fragment,
    pub triage: &'a Phase1Result,
    /// Content after the last phase that ran; `None` for discarded fragments
    pub contenido: Option<&'a ExtractedContent>,
    pub normalizaciones: &'a [EntityNormalization],
    pub estado_normalizacion: NormalizationStatus,
    /// Audits of every phase, in order
    pub audits: &'a [PhaseAudit],
}

/// Build, validate and checksum the payload of one fragment.
pub fn build_payload(input: PayloadInput<'_>) -> Result<PersistencePayload, PayloadValidationError> {
    let PayloadInput {
        fragment,
        triage,
        contenido,
        normalizaciones,
        estado_normalizacion,
        audits,
    } = input;
    let meta = fragment.metadata();

    let fallbacks = audits
        .iter()
        .flat_map(|a| a.fallbacks.iter().map(move |f| format!("{}: {}", a.phase, f)))
        .collect();
    let advertencias = audits
        .iter()
        .flat_map(|a| a.warnings.iter().map(move |w| format!("{}: {}", a.phase, w)))
        .collect();

    let mut payload = PersistencePayload {
        metadata: PayloadMetadata {
            fragment_id: fragment.fragment_id().to_string(),
            source_article_id: fragment.source_article_id().to_string(),
            order_in_article: fragment.order_in_article(),
            titulo: meta.titulo.clone(),
            medio: meta.medio.clone(),
            url: meta.url.clone(),
            fecha_publicacion: meta.fecha_publicacion.clone(),
            pais: meta.pais.clone(),
            es_relevante: triage.es_relevante,
            decision_triaje: triage.decision.to_string(),
            puntuacion_triaje: triage.puntuacion_total,
            justificacion_triaje: triage.justificacion.clone(),
            idioma_original: triage.idioma_detectado.clone(),
            estado_normalizacion,
            modelo: audits.iter().find_map(|a| a.model.clone()),
            fallbacks,
            advertencias,
            generado_en: Utc::now(),
            checksum: String::new(),
        },
        hechos: Vec::new(),
        entidades: Vec::new(),
        citas: Vec::new(),
        datos_cuantitativos: Vec::new(),
        relaciones_hechos: Vec::new(),
        relaciones_entidades: Vec::new(),
        contradicciones: Vec::new(),
    };

    if let Some(content) = contenido {
        fill_elements(&mut payload, content, normalizaciones);
    }

    payload.metadata.checksum = compute_checksum(&payload);
    validate_payload(&payload)?;
    Ok(payload)
}

fn fill_elements(
    payload: &mut PersistencePayload,
    content: &ExtractedContent,
    normalizaciones: &[EntityNormalization],
) {
    use ElementKind::{Cita, Dato, Entidad, Hecho};

    payload.hechos = content
        .hechos
        .iter()
        .map(|h| PayloadHecho {
            id_temporal: temporal_id(Hecho, h.id),
            contenido: h.contenido.clone(),
            fecha_ocurrencia: h.fecha_ocurrencia.clone(),
            tipo_hecho: h.tipo_hecho.clone(),
            pais: h.pais.clone(),
            region: h.region.clone(),
            ciudad: h.ciudad.clone(),
            es_futuro: h.es_futuro,
            confianza: h.confianza,
            relevancia: h.relevancia,
            offset_inicio: h.offset_inicio,
            offset_fin: h.offset_fin,
            entidades: h.entidades.iter().map(|id| temporal_id(Entidad, *id)).collect(),
        })
        .collect();

    payload.entidades = content
        .entidades
        .iter()
        .map(|e| {
            let verdict = normalizaciones
                .iter()
                .find(|n| n.entidad_id == e.id)
                .map(|n| &n.verdict);
            let normalizacion = match verdict {
                Some(NormalizationVerdict::Match {
                    entidad_existente_id,
                    similitud,
                    ..
                }) => PayloadNormalization::Existente {
                    entidad_existente_id: entidad_existente_id.clone(),
                    similitud: *similitud,
                },
                Some(NormalizationVerdict::New) => PayloadNormalization::Nueva,
                Some(NormalizationVerdict::Error { .. }) | None => PayloadNormalization::Pendiente,
            };
            PayloadEntidad {
                id_temporal: temporal_id(Entidad, e.id),
                nombre: e.nombre.clone(),
                tipo: e.tipo.to_string(),
                descripcion: e.descripcion.clone(),
                alias: e.alias.clone(),
                relevancia: e.relevancia,
                normalizacion,
            }
        })
        .collect();

    payload.citas = content
        .citas
        .iter()
        .map(|c| PayloadCita {
            id_temporal: temporal_id(Cita, c.id),
            texto: c.texto.clone(),
            emisor: c.emisor.clone(),
            entidad_emisora: temporal_ref(Entidad, c.entidad_emisora_id),
            hecho: temporal_ref(Hecho, c.hecho_id),
            fecha: c.fecha.clone(),
            contexto: c.contexto.clone(),
            confianza: c.confianza,
            relevancia: c.relevancia,
        })
        .collect();

    payload.datos_cuantitativos = content
        .datos
        .iter()
        .map(|d| PayloadDato {
            id_temporal: temporal_id(Dato, d.id),
            indicador: d.indicador.clone(),
            categoria: d.categoria.clone(),
            valor: d.valor,
            unidad: d.unidad.clone(),
            ambito_geografico: d.ambito_geografico.clone(),
            periodo_inicio: d.periodo_inicio.clone(),
            periodo_fin: d.periodo_fin.clone(),
            fuente: d.fuente.clone(),
            hecho: temporal_ref(Hecho, d.hecho_id),
            entidad: temporal_ref(Entidad, d.entidad_id),
            confianza: d.confianza,
        })
        .collect();

    payload.relaciones_hechos = content
        .relaciones_hechos
        .iter()
        .enumerate()
        .map(|(i, r)| PayloadRelacionHechos {
            id_temporal: format!("rel_hecho_{}", i + 1),
            hecho_origen: temporal_id(Hecho, r.hecho_origen_id),
            hecho_destino: temporal_id(Hecho, r.hecho_destino_id),
            tipo_relacion: r.tipo_relacion.clone(),
            fuerza: r.fuerza,
        })
        .collect();

    payload.relaciones_entidades = content
        .relaciones_entidades
        .iter()
        .enumerate()
        .map(|(i, r)| PayloadRelacionEntidades {
            id_temporal: format!("rel_entidad_{}", i + 1),
            entidad_origen: temporal_id(Entidad, r.entidad_origen_id),
            entidad_destino: temporal_id(Entidad, r.entidad_destino_id),
            tipo_relacion: r.tipo_relacion.clone(),
            descripcion: r.descripcion.clone(),
        })
        .collect();

    payload.contradicciones = content
        .contradicciones
        .iter()
        .enumerate()
        .map(|(i, r)| PayloadContradiccion {
            id_temporal: format!("contradiccion_{}", i + 1),
            hecho_principal: temporal_id(Hecho, r.hecho_principal_id),
            hecho_contradictorio: temporal_id(Hecho, r.hecho_contradictorio_id),
            tipo_contradiccion: r.tipo_contradiccion.clone(),
            grado: r.grado,
            descripcion: r.descripcion.clone(),
        })
        .collect();
}

#[derive(Serialize)]
struct ChecksumView<'a> {
    fragment_id: &'a str,
    source_article_id: &'a str,
    order_in_article: u32,
    hechos: &'a [PayloadHecho],
    entidades: &'a [PayloadEntidad],
    citas: &'a [PayloadCita],
    datos_cuantitativos: &'a [PayloadDato],
    relaciones_hechos: &'a [PayloadRelacionHechos],
    relaciones_entidades: &'a [PayloadRelacionEntidades],
    contradicciones: &'a [PayloadContradiccion],
}

/// SHA-256 (hex) of the payload content. Timestamps and the checksum field
/// itself are excluded, so rebuilding the same content yields the same value.
pub fn compute_checksum(payload: &PersistencePayload) -> String {
    let view = ChecksumView {
        fragment_id: &payload.metadata.fragment_id,
        source_article_id: &payload.metadata.source_article_id,
        order_in_article: payload.metadata.order_in_article,
        hechos: &payload.hechos,
        entidades: &payload.entidades,
        citas: &payload.citas,
        datos_cuantitativos: &payload.datos_cuantitativos,
        relaciones_hechos: &payload.relaciones_hechos,
        relaciones_entidades: &payload.relaciones_entidades,
        contradicciones: &payload.contradicciones,
    };

    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&view).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::validate::Violation;
    use crate::types::{
        Cita as CitaEl, Entidad as EntidadEl, Hecho as HechoEl, PhaseId, RelacionHechos,
        TipoEntidad, TriageDecision,
    };

    fn triage() -> Phase1Result {
        Phase1Result {
            es_relevante: true,
            decision: TriageDecision::Procesar,
            puntuaciones: None,
            puntuacion_total: Some(18.0),
            justificacion: None,
            elementos_clave: vec![],
            idioma_detectado: "es".into(),
            texto_limpio: "texto".into(),
            texto_para_siguiente_fase: "texto".into(),
            audit: PhaseAudit::new(PhaseId::Triage),
        }
    }

    fn hecho(id: u32, entidades: Vec<u32>) -> HechoEl {
        HechoEl {
            id,
            contenido: format!("hecho {}", id),
            fecha_ocurrencia: Some("2024-05-01".into()),
            tipo_hecho: None,
            pais: None,
            region: None,
            ciudad: None,
            es_futuro: false,
            confianza: 0.9,
            relevancia: 0.6,
            offset_inicio: None,
            offset_fin: None,
            entidades,
        }
    }

    fn entidad(id: u32) -> EntidadEl {
        EntidadEl {
            id,
            nombre: format!("entidad {}", id),
            tipo: TipoEntidad::Persona,
            descripcion: None,
            alias: vec![],
            relevancia: 0.5,
            offset_inicio: None,
            offset_fin: None,
        }
    }

    fn cita(id: u32, hecho_id: Option<u32>) -> CitaEl {
        CitaEl {
            id,
            texto: "dijo algo".into(),
            emisor: None,
            entidad_emisora_id: Some(1),
            hecho_id,
            fecha: None,
            contexto: None,
            confianza: 0.7,
            relevancia: 0.4,
        }
    }

    fn content() -> ExtractedContent {
        ExtractedContent {
            hechos: vec![hecho(1, vec![1]), hecho(2, vec![])],
            entidades: vec![entidad(1)],
            citas: vec![cita(1, Some(2))],
            relaciones_hechos: vec![RelacionHechos {
                hecho_origen_id: 1,
                hecho_destino_id: 2,
                tipo_relacion: "causa".into(),
                fuerza: 0.6,
            }],
            ..Default::default()
        }
    }

    fn build(content: &ExtractedContent) -> Result<PersistencePayload, PayloadValidationError> {
        let fragment = Fragment::new("art_f0", "art", 0, "texto").unwrap();
        let triage = triage();
        build_payload(PayloadInput {
            fragment: &fragment,
            triage: &triage,
            contenido: Some(content),
            normalizaciones: &[EntityNormalization {
                entidad_id: 1,
                verdict: NormalizationVerdict::New,
            }],
            estado_normalizacion: NormalizationStatus::Completo,
            audits: &[],
        })
    }

    #[test]
    fn integer_ids_become_temporal_ids() {
        let payload = build(&content()).unwrap();

        assert_eq!(payload.hechos[0].id_temporal, "hecho_1");
        assert_eq!(payload.hechos[0].entidades, vec!["entidad_1"]);
        assert_eq!(payload.citas[0].hecho.as_deref(), Some("hecho_2"));
        assert_eq!(payload.citas[0].entidad_emisora.as_deref(), Some("entidad_1"));
        assert_eq!(payload.relaciones_hechos[0].id_temporal, "rel_hecho_1");
        assert_eq!(payload.entidades[0].normalizacion, PayloadNormalization::Nueva);
        assert_eq!(payload.metadata.checksum.len(), 64);
    }

    #[test]
    fn checksum_ignores_timestamps() {
        let a = build(&content()).unwrap();
        let mut b = a.clone();
        b.metadata.generado_en = b.metadata.generado_en + chrono::Duration::hours(3);
        assert_eq!(compute_checksum(&a), compute_checksum(&b));
        assert_eq!(a.metadata.checksum, build(&content()).unwrap().metadata.checksum);

        let mut c = a.clone();
        c.hechos[0].contenido.push('!');
        assert_ne!(compute_checksum(&a), compute_checksum(&c));
    }

    #[test]
    fn all_violations_are_reported_together() {
        let mut broken = content();
        broken.citas.push(cita(2, Some(9)));
        broken.hechos[1].confianza = 1.4;
        broken.hechos[0].entidades.push(3);

        let err = build(&broken).unwrap_err();
        assert_eq!(err.violations.len(), 3);
        assert_eq!(err.error_type(), "ReferentialIntegrityError");
        assert!(err.violations.contains(&Violation::DanglingReference {
            element: "cita_2".into(),
            field: "hecho".into(),
            target: "hecho_9".into(),
        }));
    }
}
