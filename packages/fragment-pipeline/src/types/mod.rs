//! Data types flowing through the pipeline.

pub mod elements;
pub mod fragment;
pub mod phase;

pub use elements::{
    Cita, Contradiccion, DatoCuantitativo, ElementCounts, Entidad, ExtractedContent, Hecho,
    RelacionEntidades, RelacionHechos, TipoEntidad,
};
pub use fragment::{ArticleMetadata, Fragment};
pub use phase::{
    EntityNormalization, FallbackReason, NormalizationStatus, NormalizationVerdict, ParseMode,
    Phase1Result, Phase2Result, Phase3Result, Phase4Result, PhaseAudit, PhaseId, TriageDecision,
    TriageScores,
};
