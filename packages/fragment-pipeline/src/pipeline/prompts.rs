//! LLM prompts for the three LLM-backed phases.
//!
//! Each template starts with a fixed header line so responses can be
//! attributed to a phase, and each has a short hash recorded in the phase
//! audit so results can be traced back to a prompt version.

use sha2::{Digest, Sha256};

/// Header of the triage prompt.
pub const TRIAGE_HEADER: &str = "TRIAJE DE FRAGMENTO PERIODÍSTICO";

/// Header of the fact/entity extraction prompt.
pub const EXTRACTION_HEADER: &str = "EXTRACCIÓN DE HECHOS Y ENTIDADES";

/// Header of the quotes/data prompt.
pub const QUOTES_DATA_HEADER: &str = "EXTRACCIÓN DE CITAS Y DATOS CUANTITATIVOS";

/// Phase 1: relevance triage. Accepts JSON or the labelled text format.
pub const TRIAGE_PROMPT: &str = r#"TRIAJE DE FRAGMENTO PERIODÍSTICO

Evalúa si el siguiente fragmento contiene información noticiosa que merezca ser
procesada. Puntúa cada criterio de 1 a 5:

- RELEVANCIA TEMÁTICA: ¿trata temas de interés público?
- ACTUALIDAD: ¿describe hechos recientes o vigentes?
- IMPACTO: ¿afecta a muchas personas o instituciones?
- FIABILIDAD: ¿las afirmaciones tienen fuentes identificables?
- DENSIDAD INFORMATIVA: ¿contiene hechos, datos o citas concretas?

Responde en JSON:
{
    "puntuaciones": {
        "relevancia_tematica": 1-5,
        "actualidad": 1-5,
        "impacto": 1-5,
        "fiabilidad": 1-5,
        "densidad_informativa": 1-5
    },
    "decision": "PROCESAR" o "DESCARTAR",
    "justificacion": "una frase",
    "elementos_clave": ["palabras o temas clave"]
}

o, si no puedes producir JSON, en este formato exacto:

RELEVANCIA TEMÁTICA: n/5
ACTUALIDAD: n/5
IMPACTO: n/5
FIABILIDAD: n/5
DENSIDAD INFORMATIVA: n/5
PUNTUACIÓN TOTAL: x/25
DECISIÓN: PROCESAR | DESCARTAR
JUSTIFICACIÓN: una frase
ELEMENTOS CLAVE:
- elemento
- elemento

Fragmento:
{texto}"#;

/// Phase 2: facts, entities and their relations. JSON only.
pub const EXTRACTION_PROMPT: &str = r#"EXTRACCIÓN DE HECHOS Y ENTIDADES

Extrae del fragmento los hechos verificables y las entidades mencionadas.
Numera hechos y entidades por separado empezando en 1 y usa esos números en
las referencias cruzadas.

Responde SOLO con JSON:
{
    "hechos": [
        {
            "id": 1,
            "contenido": "descripción concisa del hecho",
            "fecha_ocurrencia": "AAAA-MM-DD o null",
            "tipo_hecho": "EVENTO | DECLARACION | DECISION | ANUNCIO | OTRO",
            "pais": "país o null",
            "region": "región o null",
            "ciudad": "ciudad o null",
            "es_futuro": false,
            "confianza": 0.0-1.0,
            "relevancia": 0.0-1.0,
            "offset_inicio": posición inicial o null,
            "offset_fin": posición final o null,
            "entidades": [ids de entidades implicadas]
        }
    ],
    "entidades": [
        {
            "id": 1,
            "nombre": "nombre canónico",
            "tipo": "PERSONA | ORGANIZACION | INSTITUCION | LUGAR | EVENTO | NORMATIVA | CONCEPTO | OTRO",
            "descripcion": "rol en el texto o null",
            "alias": ["otras formas de nombrarla"],
            "relevancia": 0.0-1.0,
            "offset_inicio": null,
            "offset_fin": null
        }
    ],
    "relaciones_hechos": [
        {"hecho_origen_id": 1, "hecho_destino_id": 2, "tipo_relacion": "causa | consecuencia | contexto | secuencia", "fuerza": 0.0-1.0}
    ],
    "relaciones_entidades": [
        {"entidad_origen_id": 1, "entidad_destino_id": 2, "tipo_relacion": "miembro_de | dirige | aliado | opositor | otro", "descripcion": "texto o null"}
    ],
    "contradicciones": [
        {"hecho_principal_id": 1, "hecho_contradictorio_id": 2, "tipo_contradiccion": "texto", "grado": 1-5, "descripcion": "texto o null"}
    ]
}

Fragmento ({idioma}):
{texto}"#;

/// Phase 3: quotes and quantitative data, grounded on the Phase 2 ids.
pub const QUOTES_DATA_PROMPT: &str = r#"EXTRACCIÓN DE CITAS Y DATOS CUANTITATIVOS

Estos son los hechos y entidades ya identificados en el fragmento. Cuando una
cita o un dato se refiera a uno de ellos, usa su id exacto; si no, deja la
referencia en null. No inventes ids.

{snapshot}

Responde SOLO con JSON:
{
    "citas": [
        {
            "texto": "cita textual",
            "emisor": "quién la dice",
            "entidad_emisora_id": id de entidad o null,
            "hecho_id": id de hecho o null,
            "fecha": "AAAA-MM-DD o null",
            "contexto": "circunstancia o null",
            "confianza": 0.0-1.0,
            "relevancia": 0.0-1.0
        }
    ],
    "datos": [
        {
            "indicador": "qué se mide",
            "categoria": "economico | social | demografico | otro",
            "valor": número,
            "unidad": "unidad o null",
            "ambito_geografico": "ámbito o null",
            "periodo_inicio": "AAAA-MM-DD o null",
            "periodo_fin": "AAAA-MM-DD o null",
            "fuente": "fuente o null",
            "hecho_id": id de hecho o null,
            "entidad_id": id de entidad o null,
            "confianza": 0.0-1.0
        }
    ]
}

Fragmento:
{texto}"#;

/// Short hash of a prompt template (first 16 hex chars of its SHA-256).
pub fn prompt_hash(template: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Format the triage prompt.
pub fn format_triage_prompt(text: &str) -> String {
    TRIAGE_PROMPT.replace("{texto}", text)
}

/// Format the extraction prompt.
pub fn format_extraction_prompt(text: &str, language: &str) -> String {
    EXTRACTION_PROMPT
        .replace("{idioma}", language)
        .replace("{texto}", text)
}

/// Format the quotes/data prompt with the JSON snapshot of Phase 2 ids.
pub fn format_quotes_data_prompt(text: &str, snapshot: &str) -> String {
    QUOTES_DATA_PROMPT
        .replace("{snapshot}", snapshot)
        .replace("{texto}", text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_hash_is_short_and_stable() {
        let a = prompt_hash(TRIAGE_PROMPT);
        assert_eq!(a, prompt_hash(TRIAGE_PROMPT));
        assert_eq!(a.len(), 16);
        assert_ne!(a, prompt_hash(EXTRACTION_PROMPT));
    }

    #[test]
    fn prompts_start_with_their_header() {
        assert!(format_triage_prompt("x").starts_with(TRIAGE_HEADER));
        assert!(format_extraction_prompt("x", "es").starts_with(EXTRACTION_HEADER));
        assert!(format_quotes_data_prompt("x", "{}").starts_with(QUOTES_DATA_HEADER));
    }

    #[test]
    fn snapshot_is_inserted_before_text() {
        let prompt = format_quotes_data_prompt("El ministro dijo...", r#"{"hechos":[]}"#);
        let snapshot_at = prompt.find(r#"{"hechos":[]}"#).unwrap();
        let text_at = prompt.find("El ministro dijo").unwrap();
        assert!(snapshot_at < text_at);
    }
}
