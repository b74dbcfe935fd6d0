//! Phase 4: entity normalization.
//!
//! Each Phase 2 entity is looked up in the existing catalogue with one
//! similarity RPC. A candidate at or above the threshold is a match;
//! otherwise the entity is new. Failed lookups do not fail the fragment,
//! they lower the overall status to `Parcial` or `Fallido`.

use std::time::Instant;

use super::PhaseContext;
use crate::error::truncate_message;
use crate::traits::SimilarEntity;
use crate::types::{
    EntityNormalization, NormalizationStatus, NormalizationVerdict, Phase3Result, Phase4Result,
    PhaseAudit, PhaseId,
};

/// Best candidate, with scores clamped to [0, 1].
fn best_candidate(candidates: Vec<SimilarEntity>) -> Option<SimilarEntity> {
    candidates
        .into_iter()
        .filter(|c| c.score.is_finite())
        .map(|mut c| {
            c.score = c.score.clamp(0.0, 1.0);
            c
        })
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

/// Run Phase 4 on the Phase 3 result.
pub async fn run(ctx: &PhaseContext<'_>, phase3: Phase3Result) -> Phase4Result {
    let contenido = phase3.contenido;
    if contenido.entidades.is_empty() {
        return Phase4Result {
            contenido,
            normalizaciones: Vec::new(),
            estado: NormalizationStatus::NoRequerido,
            audit: PhaseAudit::skipped(PhaseId::Normalization, "sin entidades que normalizar"),
        };
    }

    let started = Instant::now();
    let mut audit = PhaseAudit::new(PhaseId::Normalization);
    let settings = &ctx.config.phases;
    let policy = ctx.rpc_policy();
    let db = ctx.persistence;

    let mut normalizaciones = Vec::with_capacity(contenido.entidades.len());
    for entidad in &contenido.entidades {
        let nombre = entidad.nombre.as_str();
        let tipo = entidad.tipo.as_str();
        let result = policy
            .call(PhaseId::Normalization.as_str(), || {
                db.find_similar_entity(nombre, tipo, settings.similarity_threshold, settings.similarity_limit)
            })
            .await;

        let verdict = match result {
            Ok(candidates) => match best_candidate(candidates) {
                Some(best) if best.score >= settings.similarity_threshold => NormalizationVerdict::Match {
                    entidad_existente_id: best.id,
                    nombre_existente: best.nombre,
                    similitud: best.score,
                },
                _ => NormalizationVerdict::New,
            },
            Err(e) => {
                let mensaje = truncate_message(&e.to_string());
                audit.warn(
                    ctx.fragment_id,
                    format!("normalización fallida para entidad {}: {}", entidad.id, mensaje),
                );
                NormalizationVerdict::Error { mensaje }
            }
        };

        normalizaciones.push(EntityNormalization {
            entidad_id: entidad.id,
            verdict,
        });
    }

    let estado = NormalizationStatus::from_verdicts(&normalizaciones);
    let audit = audit.finish(started);
    tracing::info!(
        fragment_id = ctx.fragment_id,
        phase = %PhaseId::Normalization,
        entidades = normalizaciones.len(),
        estado = estado.as_str(),
        duration_ms = audit.duration_ms,
        "Normalization completed"
    );

    Phase4Result {
        contenido,
        normalizaciones,
        estado,
        audit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use crate::testing::{fast_config, MockLlm, MockPreprocessor};
    use crate::traits::persistence::MockPersistenceClient;
    use crate::types::{Entidad, ExtractedContent, TipoEntidad};

    fn entity(id: u32, nombre: &str) -> Entidad {
        Entidad {
            id,
            nombre: nombre.to_string(),
            tipo: TipoEntidad::Organizacion,
            descripcion: None,
            alias: vec![],
            relevancia: 0.5,
            offset_inicio: None,
            offset_fin: None,
        }
    }

    fn phase3(entidades: Vec<Entidad>) -> Phase3Result {
        Phase3Result {
            contenido: ExtractedContent {
                entidades,
                ..Default::default()
            },
            audit: PhaseAudit::new(PhaseId::QuotesData),
        }
    }

    async fn normalize(db: &MockPersistenceClient, entidades: Vec<Entidad>) -> Phase4Result {
        let llm = MockLlm::new();
        let pre = MockPreprocessor::new();
        let config = fast_config();
        let ctx = PhaseContext {
            fragment_id: "f1",
            llm: &llm,
            preprocessor: &pre,
            persistence: db,
            config: &config,
        };
        run(&ctx, phase3(entidades)).await
    }

    #[tokio::test]
    async fn matches_above_threshold_and_new_below() {
        let mut db = MockPersistenceClient::new();
        db.expect_find_similar_entity()
            .returning(|name, tipo, _, _| {
                let score = if name == "ONU" { 0.93 } else { 0.4 };
                Ok(vec![SimilarEntity {
                    id: format!("db-{}", name),
                    nombre: name.to_string(),
                    tipo: tipo.to_string(),
                    score,
                }])
            });

        let result = normalize(&db, vec![entity(1, "ONU"), entity(2, "Club local")]).await;

        assert_eq!(result.estado, NormalizationStatus::Completo);
        assert!(matches!(
            &result.normalizaciones[0].verdict,
            NormalizationVerdict::Match { entidad_existente_id, .. } if entidad_existente_id == "db-ONU"
        ));
        assert_eq!(result.normalizaciones[1].verdict, NormalizationVerdict::New);
    }

    #[tokio::test]
    async fn connection_error_is_retried_once() {
        let mut db = MockPersistenceClient::new();
        db.expect_find_similar_entity()
            .times(2)
            .returning(|_, _, _, _| Err(ApiError::connection("reset by peer")));

        let result = normalize(&db, vec![entity(1, "ONU")]).await;

        assert_eq!(result.estado, NormalizationStatus::Fallido);
        assert!(result.normalizaciones[0].verdict.is_error());
        assert_eq!(result.audit.warnings.len(), 1);
    }

    #[tokio::test]
    async fn partial_when_some_lookups_fail() {
        let mut db = MockPersistenceClient::new();
        db.expect_find_similar_entity()
            .returning(|name, _, _, _| {
                if name == "ONU" {
                    Err(ApiError::validation("bad type"))
                } else {
                    Ok(vec![])
                }
            });

        let result = normalize(&db, vec![entity(1, "ONU"), entity(2, "UE")]).await;
        assert_eq!(result.estado, NormalizationStatus::Parcial);
    }

    #[tokio::test]
    async fn no_entities_needs_no_normalization() {
        let db = MockPersistenceClient::new();
        let result = normalize(&db, vec![]).await;
        assert_eq!(result.estado, NormalizationStatus::NoRequerido);
        assert!(result.audit.skipped);
    }

    #[test]
    fn scores_are_clamped_before_comparison() {
        let best = best_candidate(vec![
            SimilarEntity { id: "a".into(), nombre: "A".into(), tipo: "X".into(), score: 1.7 },
            SimilarEntity { id: "b".into(), nombre: "B".into(), tipo: "X".into(), score: 0.9 },
        ])
        .unwrap();
        assert_eq!(best.id, "a");
        assert_eq!(best.score, 1.0);
    }
}
