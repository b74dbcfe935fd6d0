//! Persistence payload: construction, validation and checksum.

pub mod builder;
pub mod types;
pub mod validate;

pub use builder::{build_payload, compute_checksum, temporal_id, PayloadInput};
pub use types::{
    PayloadCita, PayloadContradiccion, PayloadDato, PayloadEntidad, PayloadHecho, PayloadMetadata,
    PayloadNormalization, PayloadRelacionEntidades, PayloadRelacionHechos, PersistencePayload,
};
pub use validate::{is_http_uri, is_iso_date, validate_payload, PayloadValidationError, Violation};
