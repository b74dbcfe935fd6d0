//! Extracted elements.
//!
//! Elements carry the fragment-scoped integer IDs issued by the
//! [`IdAllocator`](crate::ids::IdAllocator). References between elements use
//! those integers; only the payload builder turns them into string keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fact stated in the fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hecho {
    pub id: u32,

    /// What happened, sanitized
    pub contenido: String,

    /// When it happened (ISO-8601 date)
    pub fecha_ocurrencia: Option<String>,

    /// Free classification (evento, declaracion, decision...)
    pub tipo_hecho: Option<String>,

    pub pais: Option<String>,
    pub region: Option<String>,
    pub ciudad: Option<String>,

    /// The fact is announced or expected, not yet happened
    #[serde(default)]
    pub es_futuro: bool,

    /// Extraction confidence in [0, 1]
    pub confianza: f64,

    /// Editorial relevance in [0, 1]
    pub relevancia: f64,

    /// Character offsets in the fragment text
    pub offset_inicio: Option<usize>,
    pub offset_fin: Option<usize>,

    /// Entities involved in the fact
    #[serde(default)]
    pub entidades: Vec<u32>,
}

/// Category of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TipoEntidad {
    Persona,
    Organizacion,
    Institucion,
    Lugar,
    Evento,
    Normativa,
    Concepto,
    Otro,
}

impl TipoEntidad {
    pub fn as_str(&self) -> &'static str {
        match self {
            TipoEntidad::Persona => "PERSONA",
            TipoEntidad::Organizacion => "ORGANIZACION",
            TipoEntidad::Institucion => "INSTITUCION",
            TipoEntidad::Lugar => "LUGAR",
            TipoEntidad::Evento => "EVENTO",
            TipoEntidad::Normativa => "NORMATIVA",
            TipoEntidad::Concepto => "CONCEPTO",
            TipoEntidad::Otro => "OTRO",
        }
    }

    /// Lenient parse of what an LLM writes; unknown labels become `Otro`.
    pub fn from_label(label: &str) -> Self {
        let normalized: String = label
            .trim()
            .to_uppercase()
            .chars()
            .map(|c| match c {
                'Á' => 'A',
                'É' => 'E',
                'Í' => 'I',
                'Ó' => 'O',
                'Ú' => 'U',
                ' ' | '-' => '_',
                other => other,
            })
            .collect();

        match normalized.as_str() {
            "PERSONA" | "PERSON" => TipoEntidad::Persona,
            "ORGANIZACION" | "ORGANIZATION" | "EMPRESA" | "PARTIDO" => TipoEntidad::Organizacion,
            "INSTITUCION" | "INSTITUTION" | "ORGANISMO" => TipoEntidad::Institucion,
            "LUGAR" | "LOCATION" | "UBICACION" | "PAIS" | "CIUDAD" => TipoEntidad::Lugar,
            "EVENTO" | "EVENT" => TipoEntidad::Evento,
            "NORMATIVA" | "LEY" | "NORMA" => TipoEntidad::Normativa,
            "CONCEPTO" | "CONCEPT" => TipoEntidad::Concepto,
            _ => TipoEntidad::Otro,
        }
    }
}

impl fmt::Display for TipoEntidad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named entity mentioned in the fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entidad {
    pub id: u32,
    pub nombre: String,
    pub tipo: TipoEntidad,
    pub descripcion: Option<String>,
    #[serde(default)]
    pub alias: Vec<String>,
    pub relevancia: f64,
    pub offset_inicio: Option<usize>,
    pub offset_fin: Option<usize>,
}

/// A quote attributed to someone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cita {
    pub id: u32,
    pub texto: String,
    /// Speaker as written in the text
    pub emisor: Option<String>,
    /// Speaker, when it is a Phase 2 entity
    pub entidad_emisora_id: Option<u32>,
    /// Fact the quote belongs to
    pub hecho_id: Option<u32>,
    pub fecha: Option<String>,
    pub contexto: Option<String>,
    pub confianza: f64,
    pub relevancia: f64,
}

/// A quantitative datum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatoCuantitativo {
    pub id: u32,
    pub indicador: String,
    pub categoria: Option<String>,
    pub valor: f64,
    pub unidad: Option<String>,
    pub ambito_geografico: Option<String>,
    pub periodo_inicio: Option<String>,
    pub periodo_fin: Option<String>,
    pub fuente: Option<String>,
    pub hecho_id: Option<u32>,
    pub entidad_id: Option<u32>,
    pub confianza: f64,
}

/// Directed relation between two facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelacionHechos {
    pub hecho_origen_id: u32,
    pub hecho_destino_id: u32,
    /// causa, consecuencia, contexto...
    pub tipo_relacion: String,
    /// Strength in [0, 1]
    pub fuerza: f64,
}

/// Directed relation between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelacionEntidades {
    pub entidad_origen_id: u32,
    pub entidad_destino_id: u32,
    pub tipo_relacion: String,
    pub descripcion: Option<String>,
}

/// Two facts that contradict each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiccion {
    pub hecho_principal_id: u32,
    pub hecho_contradictorio_id: u32,
    pub tipo_contradiccion: String,
    /// Severity, 1 to 5
    pub grado: u8,
    pub descripcion: Option<String>,
}

/// Everything extracted from one fragment so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub hechos: Vec<Hecho>,
    pub entidades: Vec<Entidad>,
    pub citas: Vec<Cita>,
    pub datos: Vec<DatoCuantitativo>,
    pub relaciones_hechos: Vec<RelacionHechos>,
    pub relaciones_entidades: Vec<RelacionEntidades>,
    pub contradicciones: Vec<Contradiccion>,
}

impl ExtractedContent {
    pub fn is_empty(&self) -> bool {
        self.hechos.is_empty() && self.entidades.is_empty()
    }

    pub fn has_hecho(&self, id: u32) -> bool {
        self.hechos.iter().any(|h| h.id == id)
    }

    pub fn has_entidad(&self, id: u32) -> bool {
        self.entidades.iter().any(|e| e.id == id)
    }

    pub fn counts(&self) -> ElementCounts {
        ElementCounts {
            hechos: self.hechos.len(),
            entidades: self.entidades.len(),
            citas: self.citas.len(),
            datos_cuantitativos: self.datos.len(),
            relaciones: self.relaciones_hechos.len()
                + self.relaciones_entidades.len()
                + self.contradicciones.len(),
        }
    }
}

/// Number of elements per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementCounts {
    pub hechos: usize,
    pub entidades: usize,
    pub citas: usize,
    pub datos_cuantitativos: usize,
    pub relaciones: usize,
}

impl std::ops::AddAssign for ElementCounts {
    fn add_assign(&mut self, other: Self) {
        self.hechos += other.hechos;
        self.entidades += other.entidades;
        self.citas += other.citas;
        self.datos_cuantitativos += other.datos_cuantitativos;
        self.relaciones += other.relaciones;
    }
}
