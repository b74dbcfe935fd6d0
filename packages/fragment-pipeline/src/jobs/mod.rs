//! Job tracking for fragments processed in the background.

pub mod tracker;

pub use tracker::{JobError, JobSnapshot, JobStatus, JobTracker};
