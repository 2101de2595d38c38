//! Stage trait and related types.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::progress::ProgressReporter;
use crate::domain::{JobErrorKind, MediaKind, MediaRef};

/// Resource class a stage needs (determines whether a device lease is held).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResourceClass {
    /// Runs on the CPU; may execute concurrently with other jobs' stages.
    LightCpu,
    /// Needs exclusive use of the GPU device.
    GpuExclusive,
}

impl ResourceClass {
    pub fn needs_device(&self) -> bool {
        matches!(self, Self::GpuExclusive)
    }
}

/// Expected duration of one invocation. Informational.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DurationClass {
    /// Seconds.
    Short,
    #[default]
    Medium,
    /// Minutes to hours (generation, enhancement of long videos).
    Long,
}

/// Input for one stage invocation.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub job_id: String,
    pub stage_index: usize,
    /// Output of the previous stage, or the job's primary input for stage 0.
    pub primary: MediaRef,
    /// All inputs the job was submitted with (e.g. face image + target video).
    pub sources: Vec<MediaRef>,
    /// Where the stage must write its output. A directory for frame outputs.
    pub output_path: PathBuf,
    pub output_kind: MediaKind,
    /// Pipeline parameters from the submission.
    pub params: serde_json::Value,
}

/// Signals available to a running stage.
#[derive(Clone)]
pub struct StageContext {
    /// Cancelled when the job is cancelled or the scheduler shuts down.
    pub cancel: CancellationToken,
    /// Cancelled when the device lease backing this stage is revoked.
    /// `None` for CPU stages.
    pub lease_revoked: Option<CancellationToken>,
    pub progress: ProgressReporter,
}

impl StageContext {
    /// Resolves once the job is cancelled or the device lease is revoked.
    pub async fn stopped(&self) {
        match &self.lease_revoked {
            Some(revoked) => tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = revoked.cancelled() => {}
            },
            None => self.cancel.cancelled().await,
        }
    }

    pub fn report(&self, percent: u8, note: Option<String>) {
        self.progress.report(percent, note);
    }
}

/// Result of a successful stage. The artifact itself is at `output_path`.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Free-text note shown as the stage's final progress note.
    pub note: Option<String>,
}

/// Typed failure of a stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Internal(String),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Persisted error category. `None` for cancellation, which is not a failure.
    pub fn job_error_kind(&self) -> Option<JobErrorKind> {
        match self {
            Self::InvalidInput(_) => Some(JobErrorKind::InputValidation),
            Self::ResourceExhausted(_) => Some(JobErrorKind::ResourceExhaustion),
            Self::Internal(_) => Some(JobErrorKind::StageInternal),
            Self::Timeout(_) => Some(JobErrorKind::Timeout),
            Self::Cancelled => None,
        }
    }
}

/// A single named processing unit.
///
/// Stages are constructed once at startup and shared as `Arc<dyn Stage>`;
/// whatever model state they hold lives for the process lifetime. A stage
/// never touches the job store or the device arbiter.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn resource_class(&self) -> ResourceClass;

    fn duration_class(&self) -> DurationClass {
        DurationClass::Medium
    }

    /// Media kinds accepted as primary input.
    fn input_kinds(&self) -> &[MediaKind];

    fn output_kind(&self) -> MediaKind;

    /// Deadline for one invocation. `None` falls back to the scheduler default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Whether the stage may be aborted mid-computation.
    ///
    /// When `false` the scheduler lets the invocation finish and observes
    /// cancellation at the next stage boundary.
    fn supports_interrupt(&self) -> bool {
        false
    }

    /// Check the primary input against this stage's contract.
    async fn validate(&self, input: &MediaRef) -> Result<(), StageError> {
        if !self.input_kinds().contains(&input.kind) {
            return Err(StageError::invalid_input(format!(
                "stage '{}' does not accept {} input",
                self.name(),
                input.kind
            )));
        }
        if !tokio::fs::try_exists(&input.path).await.unwrap_or(false) {
            return Err(StageError::invalid_input(format!(
                "input {} does not exist",
                input.path.display()
            )));
        }
        Ok(())
    }

    /// Run the stage.
    ///
    /// # Cancel Safety
    ///
    /// If [`supports_interrupt`](Self::supports_interrupt) returns `true`, or
    /// the stage has a deadline, the scheduler may drop this future. Anything
    /// written to `output_path` is discarded by the scheduler in that case.
    async fn execute(&self, input: StageInput, ctx: StageContext) -> Result<StageOutput, StageError>;
}
