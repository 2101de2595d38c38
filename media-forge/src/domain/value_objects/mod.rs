//! Value objects shared across the orchestrator.

pub mod media;
pub mod pipeline_kind;
pub mod priority;

pub use media::{MediaKind, MediaRef};
pub use pipeline_kind::PipelineKind;
pub use priority::Priority;
