//! Collaborator traits.
//!
//! The pipeline talks to the outside world through these three seams:
//! the language model, the text preprocessor and the database.

pub mod llm;
pub mod persistence;
pub mod preprocessor;

pub use llm::{LlmClient, ResponseFormat};
pub use persistence::{PersistOutcome, PersistenceClient, SimilarEntity};
pub use preprocessor::{PassthroughPreprocessor, Preprocessor};
