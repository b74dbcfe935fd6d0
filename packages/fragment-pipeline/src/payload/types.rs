//! Persistence payload types.
//!
//! Every element is keyed by a payload-unique temporal id (`hecho_3`,
//! `entidad_1`...) and references other elements by those keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ElementCounts, NormalizationStatus};

/// Fragment-level metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMetadata {
    pub fragment_id: String,
    pub source_article_id: String,
    pub order_in_article: u32,

    pub titulo: Option<String>,
    pub medio: Option<String>,
    pub url: Option<String>,
    pub fecha_publicacion: Option<String>,
    pub pais: Option<String>,

    pub es_relevante: bool,
    pub decision_triaje: String,
    pub puntuacion_triaje: Option<f64>,
    pub justificacion_triaje: Option<String>,
    pub idioma_original: String,

    pub estado_normalizacion: NormalizationStatus,
    pub modelo: Option<String>,

    /// Fallbacks fired during the run
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Warnings from every phase, prefixed by phase
    #[serde(default)]
    pub advertencias: Vec<String>,

    pub generado_en: DateTime<Utc>,

    /// SHA-256 of the content (timestamps excluded)
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadHecho {
    pub id_temporal: String,
    pub contenido: String,
    pub fecha_ocurrencia: Option<String>,
    pub tipo_hecho: Option<String>,
    pub pais: Option<String>,
    pub region: Option<String>,
    pub ciudad: Option<String>,
    pub es_futuro: bool,
    pub confianza: f64,
    pub relevancia: f64,
    pub offset_inicio: Option<usize>,
    pub offset_fin: Option<usize>,
    pub entidades: Vec<String>,
}

/// How an entity relates to the existing catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resultado", rename_all = "snake_case")]
pub enum PayloadNormalization {
    Existente {
        entidad_existente_id: String,
        similitud: f64,
    },
    Nueva,
    /// Lookup failed; persistence decides
    Pendiente,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadEntidad {
    pub id_temporal: String,
    pub nombre: String,
    pub tipo: String,
    pub descripcion: Option<String>,
    pub alias: Vec<String>,
    pub relevancia: f64,
    pub normalizacion: PayloadNormalization,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadCita {
    pub id_temporal: String,
    pub texto: String,
    pub emisor: Option<String>,
    pub entidad_emisora: Option<String>,
    pub hecho: Option<String>,
    pub fecha: Option<String>,
    pub contexto: Option<String>,
    pub confianza: f64,
    pub relevancia: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadDato {
    pub id_temporal: String,
    pub indicador: String,
    pub categoria: Option<String>,
    pub valor: f64,
    pub unidad: Option<String>,
    pub ambito_geografico: Option<String>,
    pub periodo_inicio: Option<String>,
    pub periodo_fin: Option<String>,
    pub fuente: Option<String>,
    pub hecho: Option<String>,
    pub entidad: Option<String>,
    pub confianza: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRelacionHechos {
    pub id_temporal: String,
    pub hecho_origen: String,
    pub hecho_destino: String,
    pub tipo_relacion: String,
    pub fuerza: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadRelacionEntidades {
    pub id_temporal: String,
    pub entidad_origen: String,
    pub entidad_destino: String,
    pub tipo_relacion: String,
    pub descripcion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadContradiccion {
    pub id_temporal: String,
    pub hecho_principal: String,
    pub hecho_contradictorio: String,
    pub tipo_contradiccion: String,
    pub grado: u8,
    pub descripcion: Option<String>,
}

/// What is handed to the persistence collaborator for one fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistencePayload {
    pub metadata: PayloadMetadata,
    pub hechos: Vec<PayloadHecho>,
    pub entidades: Vec<PayloadEntidad>,
    pub citas: Vec<PayloadCita>,
    pub datos_cuantitativos: Vec<PayloadDato>,
    pub relaciones_hechos: Vec<PayloadRelacionHechos>,
    pub relaciones_entidades: Vec<PayloadRelacionEntidades>,
    pub contradicciones: Vec<PayloadContradiccion>,
}

impl PersistencePayload {
    pub fn counts(&self) -> ElementCounts {
        ElementCounts {
            hechos: self.hechos.len(),
            entidades: self.entidades.len(),
            citas: self.citas.len(),
            datos_cuantitativos: self.datos_cuantitativos.len(),
            relaciones: self.relaciones_hechos.len()
                + self.relaciones_entidades.len()
                + self.contradicciones.len(),
        }
    }

    /// A payload for a discarded fragment carries metadata only.
    pub fn is_minimal(&self) -> bool {
        self.counts() == ElementCounts::default()
    }
}
