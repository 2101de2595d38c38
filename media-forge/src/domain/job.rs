//! Job entity, status state machine and patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use super::value_objects::{MediaRef, PipelineKind, Priority};

/// Job status values.
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
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed by a worker; stages are executing.
    Running,
    /// A stage reported a failure; the job is about to be finalized as failed.
    StageFailed,
    /// Cancelled by request.
    Cancelled,
    /// Final stage succeeded; `output` is set.
    Completed,
    /// Finished unsuccessfully.
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::StageFailed => "stage_failed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "stage_failed" => Some(Self::StageFailed),
            "cancelled" => Some(Self::Cancelled),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is an allowed forward transition.
    ///
    /// `running -> running` is the only self-transition (stage advance).
    /// Re-queueing an orphaned `running` job is a recovery operation and is
    /// not expressed through this table.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Running)
                | (Running, StageFailed)
                | (Running, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (StageFailed, Failed)
        )
    }
}

/// Category of a job failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    InputValidation,
    ResourceExhaustion,
    StageInternal,
    Timeout,
    StoreInconsistency,
}

/// Persisted failure detail, always readable through get-status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobErrorDetail {
    pub kind: JobErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<usize>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl JobErrorDetail {
    pub fn new(kind: JobErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage_name: None,
            stage_index: None,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn at_stage(mut self, index: usize, name: impl Into<String>) -> Self {
        self.stage_index = Some(index);
        self.stage_name = Some(name.into());
        self
    }

    /// Human-readable cause.
    pub fn cause(&self) -> String {
        match &self.stage_name {
            Some(stage) => format!("stage '{}' failed ({}): {}", stage, self.kind, self.message),
            None => format!("{}: {}", self.kind, self.message),
        }
    }
}

/// Progress of the current stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// 0..=100
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Progress {
    pub fn new(percent: u8, note: Option<String>) -> Self {
        Self {
            percent: percent.min(100),
            note,
        }
    }
}

/// A job as seen by the rest of the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub pipeline: PipelineKind,
    pub status: JobStatus,
    pub priority: Priority,
    /// Index of the next stage to execute (== number of completed stages).
    pub stage_index: usize,
    pub stage_count: usize,
    pub inputs: Vec<MediaRef>,
    pub params: serde_json::Value,
    pub progress: Progress,
    /// Latest finalized intermediate artifact.
    pub current_artifact: Option<Artifact>,
    /// Final output, present only when completed.
    pub output: Option<Artifact>,
    pub error: Option<JobErrorDetail>,
    pub cancel_requested: bool,
    /// Id of the job this one was resubmitted from.
    pub retry_of: Option<String>,
    pub artifacts_purged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(pipeline: PipelineKind, stage_count: usize, inputs: Vec<MediaRef>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline,
            status: JobStatus::Queued,
            priority: Priority::Normal,
            stage_index: 0,
            stage_count,
            inputs,
            params: serde_json::Value::Object(Default::default()),
            progress: Progress::default(),
            current_artifact: None,
            output: None,
            error: None,
            cancel_requested: false,
            retry_of: None,
            artifacts_purged: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry_of(mut self, id: impl Into<String>) -> Self {
        self.retry_of = Some(id.into());
        self
    }

    /// Input for the next stage: the latest intermediate, or the primary job input.
    pub fn next_stage_input(&self) -> Option<MediaRef> {
        match &self.current_artifact {
            Some(artifact) => Some(artifact.media_ref()),
            None => self.inputs.first().cloned(),
        }
    }
}

/// Field-level update applied atomically by the job store.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub stage_index: Option<usize>,
    pub progress: Option<Progress>,
    /// `Some(None)` clears the current artifact.
    pub current_artifact: Option<Option<Artifact>>,
    pub output: Option<Artifact>,
    pub error: Option<JobErrorDetail>,
    pub artifacts_purged: Option<bool>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage_index(mut self, index: usize) -> Self {
        self.stage_index = Some(index);
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn current_artifact(mut self, artifact: Option<Artifact>) -> Self {
        self.current_artifact = Some(artifact);
        self
    }

    pub fn output(mut self, artifact: Artifact) -> Self {
        self.output = Some(artifact);
        self
    }

    pub fn error(mut self, error: JobErrorDetail) -> Self {
        self.error = Some(error);
        self
    }

    pub fn artifacts_purged(mut self, purged: bool) -> Self {
        self.artifacts_purged = Some(purged);
        self
    }

    /// The single write that finishes a job: past its last stage, output
    /// recorded, intermediate reference cleared.
    pub fn completed(stage_count: usize, output: Artifact) -> Self {
        Self::new()
            .status(JobStatus::Completed)
            .stage_index(stage_count)
            .current_artifact(None)
            .output(output)
            .progress(Progress::new(100, Some("completed".to_string())))
    }

    /// Apply the patch to `job`, enforcing the job invariants.
    ///
    /// Returns a description of the violated invariant on failure; `job`
    /// is left untouched in that case.
    pub fn apply_to(&self, job: &Job) -> Result<Job, String> {
        let mut next = job.clone();
        let now = Utc::now();

        if let Some(status) = self.status
            && status != job.status
        {
            if !job.status.can_transition_to(status) {
                return Err(format!("status transition {} -> {}", job.status, status));
            }
            next.status = status;
            if status == JobStatus::Running && next.started_at.is_none() {
                next.started_at = Some(now);
            }
            if status.is_terminal() {
                next.completed_at = Some(now);
            }
        }

        if let Some(index) = self.stage_index {
            if index < job.stage_index {
                return Err(format!(
                    "stage index regression {} -> {}",
                    job.stage_index, index
                ));
            }
            if index > job.stage_count {
                return Err(format!(
                    "stage index {} exceeds stage count {}",
                    index, job.stage_count
                ));
            }
            // The completion patch advances to `stage_count` in the same write
            // that leaves `running`, so both checks look at the stored status.
            if index != job.stage_index && job.status != JobStatus::Running {
                return Err(format!("stage index advanced while {}", job.status));
            }
            if next.status == JobStatus::Completed && index != job.stage_count {
                return Err(format!(
                    "completed at stage {} of {}",
                    index, job.stage_count
                ));
            }
            next.stage_index = index;
        }

        if let Some(progress) = &self.progress {
            if job.status != JobStatus::Running {
                return Err(format!("progress update while {}", job.status));
            }
            next.progress = Progress::new(progress.percent, progress.note.clone());
        }

        if let Some(artifact) = &self.current_artifact {
            next.current_artifact = artifact.clone();
        }

        if let Some(output) = &self.output {
            if next.status != JobStatus::Completed {
                return Err(format!("output set while {}", next.status));
            }
            next.output = Some(output.clone());
        }
        if next.status == JobStatus::Completed && next.output.is_none() {
            return Err("completed without output".to_string());
        }

        if let Some(error) = &self.error {
            next.error = Some(error.clone());
        }

        if let Some(purged) = self.artifacts_purged {
            next.artifacts_purged = purged;
        }

        next.updated_at = now;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::MediaKind;
    use std::path::PathBuf;

    fn running_job(stage_count: usize) -> Job {
        let mut job = Job::new(
            PipelineKind::FaceSwap,
            stage_count,
            vec![MediaRef::new("/in/target.mp4", MediaKind::Video)],
        );
        job.status = JobStatus::Running;
        job
    }

    fn artifact(stage_index: usize) -> Artifact {
        Artifact {
            job_id: "job".to_string(),
            stage_index,
            path: PathBuf::from(format!("/tmp/stage-{}.mp4", stage_index)),
            kind: MediaKind::Video,
            size_bytes: 3,
            checksum: "abc".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::StageFailed.is_terminal());
    }

    #[test]
    fn test_terminal_states_are_final() {
        use strum::IntoEnumIterator;
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in JobStatus::iter() {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_status_string_roundtrip() {
        use strum::IntoEnumIterator;
        for status in JobStatus::iter() {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
            assert_eq!(status.to_string(), status.as_str());
        }
    }

    #[test]
    fn test_stage_advance() {
        let job = running_job(3);
        let next = JobPatch::new()
            .status(JobStatus::Running)
            .stage_index(1)
            .current_artifact(Some(artifact(0)))
            .apply_to(&job)
            .unwrap();
        assert_eq!(next.stage_index, 1);
        assert_eq!(next.current_artifact.unwrap().stage_index, 0);
    }

    #[test]
    fn test_stage_regression_rejected() {
        let mut job = running_job(3);
        job.stage_index = 2;
        let err = JobPatch::new().stage_index(1).apply_to(&job).unwrap_err();
        assert!(err.contains("regression"));
    }

    #[test]
    fn test_stage_index_bounded_by_count() {
        let job = running_job(2);
        assert!(JobPatch::new().stage_index(3).apply_to(&job).is_err());
        assert!(JobPatch::new().stage_index(2).apply_to(&job).is_ok());
    }

    #[test]
    fn test_completed_requires_output() {
        let job = running_job(1);
        assert!(
            JobPatch::new()
                .status(JobStatus::Completed)
                .apply_to(&job)
                .is_err()
        );
        let done = JobPatch::new()
            .status(JobStatus::Completed)
            .stage_index(1)
            .output(artifact(0))
            .apply_to(&job)
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_completion_patch_from_last_stage() {
        let mut job = running_job(3);
        job.stage_index = 2;
        job.current_artifact = Some(artifact(1));

        let done = JobPatch::completed(3, artifact(2)).apply_to(&job).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.stage_index, 3);
        assert_eq!(done.progress.percent, 100);
        assert!(done.current_artifact.is_none());
        assert_eq!(done.output.unwrap().stage_index, 2);

        // Completing short of the last stage is rejected.
        let err = JobPatch::completed(2, artifact(2)).apply_to(&job).unwrap_err();
        assert!(err.contains("completed at stage"), "{err}");

        // A job that already left `running` cannot be completed.
        job.status = JobStatus::Cancelled;
        assert!(JobPatch::completed(3, artifact(2)).apply_to(&job).is_err());
    }

    #[test]
    fn test_no_running_after_terminal() {
        let mut job = running_job(1);
        job.status = JobStatus::Failed;
        assert!(
            JobPatch::new()
                .status(JobStatus::Running)
                .apply_to(&job)
                .is_err()
        );
        assert!(
            JobPatch::new()
                .progress(Progress::new(50, None))
                .apply_to(&job)
                .is_err()
        );
    }

    #[test]
    fn test_progress_is_clamped() {
        let job = running_job(1);
        let next = JobPatch::new()
            .progress(Progress {
                percent: 250,
                note: None,
            })
            .apply_to(&job)
            .unwrap();
        assert_eq!(next.progress.percent, 100);
    }

    #[test]
    fn test_error_cause_mentions_stage() {
        let detail =
            JobErrorDetail::new(JobErrorKind::StageInternal, "model crashed").at_stage(1, "stage-2");
        let cause = detail.cause();
        assert!(cause.contains("stage-2"));
        assert!(cause.contains("stage_internal"));
        assert!(cause.contains("model crashed"));
    }
}
