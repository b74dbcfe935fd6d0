//! Phase 3: quotes and quantitative data.
//!
//! The LLM gets a compact JSON snapshot of the Phase 2 facts and entities so
//! it can reference them by id. The prompt carries the cleaned source text,
//! not its translation. References to ids that do not exist are
//! cleared with a warning; the quote or datum itself is kept.

use serde::Serialize;
use serde_json::{Map, Value};
use std::time::Instant;

use super::parse;
use super::prompts;
use super::sanitize::FieldSanitizer;
use super::PhaseContext;
use crate::ids::IdAllocator;
use crate::traits::ResponseFormat;
use crate::types::{
    Cita, DatoCuantitativo, ExtractedContent, FallbackReason, ParseMode, Phase2Result,
    Phase3Result, PhaseAudit, PhaseId,
};

#[derive(Serialize)]
struct SnapshotHecho<'a> {
    id: u32,
    contenido: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fecha: Option<&'a str>,
}

#[derive(Serialize)]
struct SnapshotEntidad<'a> {
    id: u32,
    nombre: &'a str,
    tipo: &'a str,
}

#[derive(Serialize)]
struct Snapshot<'a> {
    hechos: Vec<SnapshotHecho<'a>>,
    entidades: Vec<SnapshotEntidad<'a>>,
}

/// Compact JSON view of the Phase 2 ids, with fact text cut to `fact_chars`.
pub fn build_snapshot(content: &ExtractedContent, fact_chars: usize) -> String {
    let snapshot = Snapshot {
        hechos: content
            .hechos
            .iter()
            .map(|h| SnapshotHecho {
                id: h.id,
                contenido: h.contenido.chars().take(fact_chars).collect(),
                fecha: h.fecha_ocurrencia.as_deref(),
            })
            .collect(),
        entidades: content
            .entidades
            .iter()
            .map(|e| SnapshotEntidad {
                id: e.id,
                nombre: &e.nombre,
                tipo: e.tipo.as_str(),
            })
            .collect(),
    };
    // Plain structs of strings and integers always serialize
    serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
}

/// Run Phase 3 on the Phase 2 result.
pub async fn run(ctx: &PhaseContext<'_>, phase2: Phase2Result, allocator: &mut IdAllocator) -> Phase3Result {
    let Phase2Result {
        mut contenido,
        texto,
        texto_original,
        ..
    } = phase2;
    // Quotes must be verbatim, so they are read from the untranslated text
    let fuente = if texto_original.is_empty() {
        texto
    } else {
        texto_original
    };

    if contenido.is_empty() {
        tracing::debug!(fragment_id = ctx.fragment_id, "No facts or entities, skipping quotes/data");
        return Phase3Result {
            contenido,
            audit: PhaseAudit::skipped(PhaseId::QuotesData, "sin hechos ni entidades en fase 2"),
        };
    }

    let started = Instant::now();
    let mut audit = PhaseAudit::new(PhaseId::QuotesData);
    audit.model = Some(ctx.llm.model_name());
    audit.prompt_hash = Some(prompts::prompt_hash(prompts::QUOTES_DATA_PROMPT));

    let snapshot = build_snapshot(&contenido, ctx.config.phases.snapshot_fact_chars);
    let prompt = prompts::format_quotes_data_prompt(&fuente, &snapshot);

    match ctx.call_llm(PhaseId::QuotesData, &prompt, ResponseFormat::Json).await {
        Err(e) => {
            audit.fallback(FallbackReason::ErrorLlm);
            audit.warn(ctx.fragment_id, crate::error::truncate_message(&e.to_string()));
        }
        Ok(answer) => match parse::extract_json_object(&answer) {
            None => {
                audit.fallback(FallbackReason::ErrorParseo);
                audit.warn(ctx.fragment_id, "respuesta de citas/datos sin JSON válido");
            }
            Some(obj) => {
                audit.parse_mode = Some(ParseMode::Json);
                let mut sanitizer = FieldSanitizer::new(&ctx.config.phases, &mut audit, ctx.fragment_id);
                let (citas, datos) = map_quotes_data(&obj, &contenido, allocator, &mut sanitizer);
                contenido.citas = citas;
                contenido.datos = datos;
            }
        },
    }

    let audit = audit.finish(started);
    tracing::info!(
        fragment_id = ctx.fragment_id,
        phase = %PhaseId::QuotesData,
        citas = contenido.citas.len(),
        datos = contenido.datos.len(),
        warnings = audit.warnings.len(),
        duration_ms = audit.duration_ms,
        "Quotes/data extraction completed"
    );

    Phase3Result { contenido, audit }
}

/// Keep a reference only when it points at an existing element.
fn checked_reference(
    s: &mut FieldSanitizer<'_>,
    id: Option<u32>,
    exists: impl Fn(u32) -> bool,
    kind: &str,
) -> Option<u32> {
    let id = id?;
    if exists(id) {
        Some(id)
    } else {
        s.warn(format!("referencia {} inexistente: {}", kind, id));
        None
    }
}

/// Entity whose name or alias equals `speaker`, ignoring case.
fn entity_by_name(content: &ExtractedContent, speaker: &str) -> Option<u32> {
    let speaker = speaker.to_lowercase();
    content
        .entidades
        .iter()
        .find(|e| {
            e.nombre.to_lowercase() == speaker || e.alias.iter().any(|a| a.to_lowercase() == speaker)
        })
        .map(|e| e.id)
}

fn map_quotes_data(
    obj: &Map<String, Value>,
    content: &ExtractedContent,
    allocator: &mut IdAllocator,
    s: &mut FieldSanitizer<'_>,
) -> (Vec<Cita>, Vec<DatoCuantitativo>) {
    let mut citas = Vec::new();
    for (index, item) in parse::array(obj, "citas").iter().enumerate() {
        let Some(c) = item.as_object() else { continue };
        let Some(texto) = s.text(parse::string(c, "texto")) else {
            s.warn(format!("cita #{} sin texto, se omite", index + 1));
            continue;
        };

        let id = allocator.next_cita_id(&texto);
        let label = format!("cita {}", id);
        let emisor = s.text(parse::string(c, "emisor"));
        let entidad_emisora_id = checked_reference(
            s,
            parse::unsigned(c, "entidad_emisora_id"),
            |id| content.has_entidad(id),
            "entidad",
        )
        .or_else(|| emisor.as_deref().and_then(|name| entity_by_name(content, name)));

        citas.push(Cita {
            id,
            hecho_id: checked_reference(s, parse::unsigned(c, "hecho_id"), |id| content.has_hecho(id), "hecho"),
            entidad_emisora_id,
            emisor,
            fecha: s.date(&label, "fecha", parse::string(c, "fecha")),
            contexto: s.text(parse::string(c, "contexto")),
            confianza: s.confidence(&label, c.get("confianza")),
            relevancia: s.relevance(&label, parse::number(c, "relevancia")),
            texto,
        });
    }

    let mut datos = Vec::new();
    for (index, item) in parse::array(obj, "datos").iter().enumerate() {
        let Some(d) = item.as_object() else { continue };
        let Some(indicador) = s.text(parse::string(d, "indicador")) else {
            s.warn(format!("dato #{} sin indicador, se omite", index + 1));
            continue;
        };
        let Some(valor) = parse::number(d, "valor") else {
            s.warn(format!("valor no numérico en dato '{}', se omite", indicador));
            continue;
        };

        let id = allocator.next_dato_id(&indicador);
        let label = format!("dato {}", id);
        let mut periodo_inicio = s.date(&label, "periodo_inicio", parse::string(d, "periodo_inicio"));
        let mut periodo_fin = s.date(&label, "periodo_fin", parse::string(d, "periodo_fin"));
        if let (Some(inicio), Some(fin)) = (&periodo_inicio, &periodo_fin) {
            // Both are YYYY-MM-DD, so string order is date order
            if inicio > fin {
                s.warn(format!(
                    "periodo invertido en {}: {} > {}, se intercambian",
                    label, inicio, fin
                ));
                std::mem::swap(&mut periodo_inicio, &mut periodo_fin);
            }
        }

        datos.push(DatoCuantitativo {
            id,
            categoria: s.text(parse::string(d, "categoria")),
            valor,
            unidad: s.text(parse::string(d, "unidad")),
            ambito_geografico: s.text(parse::string(d, "ambito_geografico")),
            periodo_inicio,
            periodo_fin,
            fuente: s.text(parse::string(d, "fuente")),
            hecho_id: checked_reference(s, parse::unsigned(d, "hecho_id"), |id| content.has_hecho(id), "hecho"),
            entidad_id: checked_reference(
                s,
                parse::unsigned(d, "entidad_id"),
                |id| content.has_entidad(id),
                "entidad",
            ),
            confianza: s.confidence(&label, d.get("confianza")),
            indicador,
        });
    }

    (citas, datos)
}
