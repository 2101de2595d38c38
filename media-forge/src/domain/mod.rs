//! Domain types: jobs, artifacts and value objects.

pub mod artifact;
pub mod job;
pub mod value_objects;

pub use artifact::Artifact;
pub use job::{Job, JobErrorDetail, JobErrorKind, JobPatch, JobStatus, Progress};
pub use value_objects::{MediaKind, MediaRef, PipelineKind, Priority};
