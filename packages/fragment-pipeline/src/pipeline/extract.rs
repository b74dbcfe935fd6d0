//! Phase 2: fact and entity extraction.
//!
//! One JSON-only LLM call. The model numbers its own facts and entities;
//! those numbers are only used to wire references inside the answer. Every
//! element gets an allocator-issued id and references are remapped through
//! it. References that cannot be remapped are dropped with a warning.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Instant;

use super::parse;
use super::prompts;
use super::sanitize::FieldSanitizer;
use super::PhaseContext;
use crate::ids::{EchoCheck, ElementKind, IdAllocator};
use crate::traits::ResponseFormat;
use crate::types::{
    Contradiccion, Entidad, ExtractedContent, FallbackReason, Hecho, ParseMode, Phase1Result,
    Phase2Result, PhaseAudit, PhaseId, RelacionEntidades, RelacionHechos, TipoEntidad,
};

/// LLM-local id → allocator id, for one element kind.
#[derive(Debug, Default)]
struct IdMap {
    ids: HashMap<u32, u32>,
}

impl IdMap {
    fn insert(&mut self, local: u32, allocated: u32) -> bool {
        if self.ids.contains_key(&local) {
            return false;
        }
        self.ids.insert(local, allocated);
        true
    }

    fn get(&self, local: u32) -> Option<u32> {
        self.ids.get(&local).copied()
    }
}

/// Run Phase 2 on the text Phase 1 forwarded.
pub async fn run(ctx: &PhaseContext<'_>, phase1: &Phase1Result, allocator: &mut IdAllocator) -> Phase2Result {
    let started = Instant::now();
    let mut audit = PhaseAudit::new(PhaseId::Extraction);
    audit.model = Some(ctx.llm.model_name());
    audit.prompt_hash = Some(prompts::prompt_hash(prompts::EXTRACTION_PROMPT));

    let texto = phase1.texto_para_siguiente_fase.clone();
    let prompt = prompts::format_extraction_prompt(&texto, &ctx.config.phases.target_language);

    let contenido = match ctx.call_llm(PhaseId::Extraction, &prompt, ResponseFormat::Json).await {
        Err(e) => {
            audit.fallback(FallbackReason::ErrorLlm);
            audit.warn(ctx.fragment_id, crate::error::truncate_message(&e.to_string()));
            ExtractedContent::default()
        }
        Ok(answer) => match parse::extract_json_object(&answer) {
            None => {
                audit.fallback(FallbackReason::ErrorParseo);
                audit.warn(ctx.fragment_id, "respuesta de extracción sin JSON válido");
                ExtractedContent::default()
            }
            Some(obj) => {
                audit.parse_mode = Some(ParseMode::Json);
                let mut sanitizer = FieldSanitizer::new(&ctx.config.phases, &mut audit, ctx.fragment_id);
                map_extraction(&obj, allocator, &mut sanitizer)
            }
        },
    };

    let audit = audit.finish(started);
    tracing::info!(
        fragment_id = ctx.fragment_id,
        phase = %PhaseId::Extraction,
        hechos = contenido.hechos.len(),
        entidades = contenido.entidades.len(),
        warnings = audit.warnings.len(),
        duration_ms = audit.duration_ms,
        "Extraction completed"
    );

    Phase2Result {
        contenido,
        texto,
        texto_original: phase1.texto_limpio.clone(),
        audit,
    }
}

/// Turn the extraction JSON into elements with allocator ids.
fn map_extraction(
    obj: &Map<String, Value>,
    allocator: &mut IdAllocator,
    s: &mut FieldSanitizer<'_>,
) -> ExtractedContent {
    let mut content = ExtractedContent::default();
    let mut entity_ids = IdMap::default();
    let mut fact_ids = IdMap::default();

    // Entities first so facts can reference them
    for (index, item) in parse::array(obj, "entidades").iter().enumerate() {
        let Some(e) = item.as_object() else {
            s.warn(format!("entidad #{} no es un objeto, se omite", index + 1));
            continue;
        };
        let Some(nombre) = s.text(parse::string(e, "nombre")) else {
            s.warn(format!("entidad #{} sin nombre, se omite", index + 1));
            continue;
        };

        let id = allocator.next_entidad_id(&nombre);
        let local = register_local(allocator, ElementKind::Entidad, parse::unsigned(e, "id"), index, id);
        if !entity_ids.insert(local, id) {
            s.warn(format!("id de entidad duplicado en la respuesta: {}", local));
        }

        let label = format!("entidad {}", id);
        let (offset_inicio, offset_fin) =
            s.offsets(&label, parse::unsigned(e, "offset_inicio"), parse::unsigned(e, "offset_fin"));
        content.entidades.push(Entidad {
            id,
            tipo: parse::string(e, "tipo")
                .map(|t| TipoEntidad::from_label(&t))
                .unwrap_or(TipoEntidad::Otro),
            descripcion: s.text(parse::string(e, "descripcion")),
            alias: parse::string_list(e, "alias")
                .into_iter()
                .filter_map(|a| s.text(Some(a)))
                .collect(),
            relevancia: s.relevance(&label, parse::number(e, "relevancia")),
            offset_inicio,
            offset_fin,
            nombre,
        });
    }

    for (index, item) in parse::array(obj, "hechos").iter().enumerate() {
        let Some(h) = item.as_object() else {
            s.warn(format!("hecho #{} no es un objeto, se omite", index + 1));
            continue;
        };
        let Some(contenido) = s.text(parse::string(h, "contenido")) else {
            s.warn(format!("hecho #{} sin contenido, se omite", index + 1));
            continue;
        };

        let id = allocator.next_hecho_id(&contenido);
        let local = register_local(allocator, ElementKind::Hecho, parse::unsigned(h, "id"), index, id);
        if !fact_ids.insert(local, id) {
            s.warn(format!("id de hecho duplicado en la respuesta: {}", local));
        }

        let label = format!("hecho {}", id);
        let mut entidades = Vec::new();
        for local_entity in parse::unsigned_list(h, "entidades") {
            match entity_ids.get(local_entity) {
                Some(mapped) if !entidades.contains(&mapped) => entidades.push(mapped),
                Some(_) => {}
                None => s.warn(format!(
                    "{} referencia entidad inexistente: {}",
                    label, local_entity
                )),
            }
        }

        let (offset_inicio, offset_fin) =
            s.offsets(&label, parse::unsigned(h, "offset_inicio"), parse::unsigned(h, "offset_fin"));
        content.hechos.push(Hecho {
            id,
            fecha_ocurrencia: s.date(&label, "fecha_ocurrencia", parse::string(h, "fecha_ocurrencia")),
            tipo_hecho: s.text(parse::string(h, "tipo_hecho")),
            pais: s.text(parse::string(h, "pais")),
            region: s.text(parse::string(h, "region")),
            ciudad: s.text(parse::string(h, "ciudad")),
            es_futuro: parse::boolean(h, "es_futuro").unwrap_or(false),
            confianza: s.confidence(&label, h.get("confianza")),
            relevancia: s.relevance(&label, parse::number(h, "relevancia")),
            offset_inicio,
            offset_fin,
            entidades,
            contenido,
        });
    }

    for item in parse::array(obj, "relaciones_hechos") {
        let Some(r) = item.as_object() else { continue };
        let Some((origen, destino)) = remap_pair(
            s,
            &fact_ids,
            "relación de hechos",
            parse::unsigned(r, "hecho_origen_id"),
            parse::unsigned(r, "hecho_destino_id"),
        ) else {
            continue;
        };
        let label = format!("relación hecho {}→{}", origen, destino);
        content.relaciones_hechos.push(RelacionHechos {
            hecho_origen_id: origen,
            hecho_destino_id: destino,
            tipo_relacion: s
                .text(parse::string(r, "tipo_relacion"))
                .unwrap_or_else(|| "relacionado".to_string()),
            fuerza: s.unit_interval(&label, "fuerza", parse::number(r, "fuerza"), 0.5),
        });
    }

    for item in parse::array(obj, "relaciones_entidades") {
        let Some(r) = item.as_object() else { continue };
        let Some((origen, destino)) = remap_pair(
            s,
            &entity_ids,
            "relación de entidades",
            parse::unsigned(r, "entidad_origen_id"),
            parse::unsigned(r, "entidad_destino_id"),
        ) else {
            continue;
        };
        content.relaciones_entidades.push(RelacionEntidades {
            entidad_origen_id: origen,
            entidad_destino_id: destino,
            tipo_relacion: s
                .text(parse::string(r, "tipo_relacion"))
                .unwrap_or_else(|| "relacionado".to_string()),
            descripcion: s.text(parse::string(r, "descripcion")),
        });
    }

    for item in parse::array(obj, "contradicciones") {
        let Some(c) = item.as_object() else { continue };
        let Some((principal, contradictorio)) = remap_pair(
            s,
            &fact_ids,
            "contradicción",
            parse::unsigned(c, "hecho_principal_id"),
            parse::unsigned(c, "hecho_contradictorio_id"),
        ) else {
            continue;
        };
        let grado = match parse::number(c, "grado") {
            None => 3,
            Some(g) if (1.0..=5.0).contains(&g.round()) => g.round() as u8,
            Some(g) => {
                let clamped = g.round().clamp(1.0, 5.0) as u8;
                s.warn(format!(
                    "grado fuera de rango en contradicción {}→{}: {}, se ajusta a {}",
                    principal, contradictorio, g, clamped
                ));
                clamped
            }
        };
        content.contradicciones.push(Contradiccion {
            hecho_principal_id: principal,
            hecho_contradictorio_id: contradictorio,
            tipo_contradiccion: s
                .text(parse::string(c, "tipo_contradiccion"))
                .unwrap_or_else(|| "factual".to_string()),
            grado,
            descripcion: s.text(parse::string(c, "descripcion")),
        });
    }

    content
}

/// The LLM-local id of an element: the echoed one, or its 1-based position.
fn register_local(
    allocator: &IdAllocator,
    kind: ElementKind,
    echoed: Option<u32>,
    index: usize,
    allocated: u32,
) -> u32 {
    match allocator.check_echoed_id(kind, echoed, allocated) {
        EchoCheck::Consistent => allocated,
        EchoCheck::Mismatch { echoed, .. } => echoed,
        EchoCheck::Missing => index as u32 + 1,
    }
}

fn remap_pair(
    s: &mut FieldSanitizer<'_>,
    ids: &IdMap,
    what: &str,
    from: Option<u32>,
    to: Option<u32>,
) -> Option<(u32, u32)> {
    let (Some(from), Some(to)) = (from, to) else {
        s.warn(format!("{} sin extremos, se descarta", what));
        return None;
    };
    match (ids.get(from), ids.get(to)) {
        (Some(a), Some(b)) if a != b => Some((a, b)),
        (Some(_), Some(_)) => {
            s.warn(format!("{} {}→{} es reflexiva, se descarta", what, from, to));
            None
        }
        _ => {
            s.warn(format!(
                "{} {}→{} con referencia inexistente, se descarta",
                what, from, to
            ));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PhaseSettings;
    use serde_json::json;

    fn map(value: Value) -> (ExtractedContent, PhaseAudit, IdAllocator) {
        let settings = PhaseSettings::default();
        let mut audit = PhaseAudit::new(PhaseId::Extraction);
        let mut allocator = IdAllocator::new("f1");
        let content = {
            let mut s = FieldSanitizer::new(&settings, &mut audit, "f1");
            map_extraction(value.as_object().unwrap(), &mut allocator, &mut s)
        };
        (content, audit, allocator)
    }

    #[test]
    fn llm_ids_are_remapped_to_allocated_ids() {
        let (content, _, allocator) = map(json!({
            "entidades": [
                {"id": 7, "nombre": "Ministerio de Salud", "tipo": "institución"},
                {"id": 9, "nombre": "OMS", "tipo": "ORGANIZACION"}
            ],
            "hechos": [
                {"id": 3, "contenido": "Se aprobó el plan", "entidades": [9, 7], "confianza": 0.9, "relevancia": 0.8}
            ],
            "relaciones_entidades": [
                {"entidad_origen_id": 7, "entidad_destino_id": 9, "tipo_relacion": "miembro_de"}
            ]
        }));

        assert_eq!(content.entidades[0].id, 1);
        assert_eq!(content.entidades[0].tipo, TipoEntidad::Institucion);
        assert_eq!(content.entidades[1].id, 2);
        assert_eq!(content.hechos[0].id, 1);
        assert_eq!(content.hechos[0].entidades, vec![2, 1]);
        assert_eq!(content.relaciones_entidades[0].entidad_origen_id, 1);
        assert_eq!(content.relaciones_entidades[0].entidad_destino_id, 2);
        assert_eq!(allocator.get_stats().total(), 3);
    }

    #[test]
    fn out_of_range_confidences_default_with_warnings() {
        let (content, audit, _) = map(json!({
            "hechos": [
                {"contenido": "A", "confianza": 1.5},
                {"contenido": "B", "confianza": -0.3}
            ]
        }));

        assert_eq!(content.hechos[0].confianza, 0.8);
        assert_eq!(content.hechos[1].confianza, 0.8);
        let confidence_warnings = audit
            .warnings
            .iter()
            .filter(|w| w.starts_with("confianza fuera de rango"))
            .count();
        assert_eq!(confidence_warnings, 2);
    }

    #[test]
    fn dangling_relations_are_dropped_with_warning() {
        let (content, audit, _) = map(json!({
            "hechos": [{"id": 1, "contenido": "A"}, {"id": 2, "contenido": "B"}],
            "relaciones_hechos": [
                {"hecho_origen_id": 1, "hecho_destino_id": 2, "tipo_relacion": "causa", "fuerza": 1.7},
                {"hecho_origen_id": 1, "hecho_destino_id": 5}
            ],
            "contradicciones": [
                {"hecho_principal_id": 2, "hecho_contradictorio_id": 1, "grado": 9}
            ]
        }));

        assert_eq!(content.relaciones_hechos.len(), 1);
        assert_eq!(content.relaciones_hechos[0].fuerza, 1.0);
        assert_eq!(content.contradicciones[0].grado, 5);
        assert!(audit.warnings.iter().any(|w| w.contains("1→5")));
    }

    #[test]
    fn elements_without_text_are_skipped_and_offsets_checked() {
        let (content, audit, allocator) = map(json!({
            "hechos": [
                {"contenido": "   "},
                {"contenido": "<script>x</script>", "offset_inicio": 50, "offset_fin": 10,
                 "fecha_ocurrencia": "15/02/2024"}
            ]
        }));

        assert_eq!(content.hechos.len(), 1);
        let hecho = &content.hechos[0];
        assert_eq!(hecho.id, 1);
        assert_eq!(hecho.contenido, "&lt;script&gt;x&lt;/script&gt;");
        assert_eq!(hecho.offset_inicio, None);
        assert_eq!(hecho.offset_fin, None);
        assert_eq!(hecho.fecha_ocurrencia.as_deref(), Some("2024-02-15"));
        assert_eq!(allocator.issued(ElementKind::Hecho), 1);
        assert_eq!(audit.warnings.len(), 2);
    }
}
