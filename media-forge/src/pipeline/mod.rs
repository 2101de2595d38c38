//! Pipelines: stage contract, registry, catalog and the scheduler that runs them.

pub mod catalog;
pub mod command;
pub mod progress;
pub mod purge;
pub mod registry;
mod runner;
pub mod scheduler;
pub mod stage;

pub use catalog::PipelineCatalog;
pub use command::{CommandStage, CommandStageSpec, parse_progress_line};
pub use progress::{ProgressReporter, ProgressUpdate, progress_channel, spawn_progress_aggregator};
pub use purge::{ArtifactPurgeConfig, ArtifactPurgeService};
pub use registry::{PipelineDefinition, PipelineRegistry, PipelineRegistryBuilder};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use stage::{
    DurationClass, ResourceClass, Stage, StageContext, StageError, StageInput, StageOutput,
};
