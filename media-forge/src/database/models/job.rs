//! Job database models.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::{Artifact, Job, JobErrorDetail, JobStatus, PipelineKind, Priority, Progress};
use crate::{Error, Result};

/// Job database model.
///
/// Structured fields (inputs, artifacts, error) are stored as JSON text.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Pipeline kind, kebab-case.
    pub pipeline: String,
    /// queued, running, stage_failed, cancelled, completed, failed
    pub status: String,
    /// 3 = high, 2 = normal, 1 = low
    pub priority: i64,
    pub stage_index: i64,
    pub stage_count: i64,
    pub inputs: String,
    pub params: String,
    pub progress: i64,
    pub progress_note: Option<String>,
    pub current_artifact: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub retry_of: Option<String>,
    pub artifacts_purged: bool,
    /// Unix epoch milliseconds (UTC)
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

fn to_json_opt<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(Error::from)
}

fn from_json_opt<T: for<'de> Deserialize<'de>>(value: &Option<String>) -> Result<Option<T>> {
    value
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(Error::from)
}

impl JobDbModel {
    pub fn from_domain(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            pipeline: job.pipeline.to_string(),
            status: job.status.as_str().to_string(),
            priority: job.priority.numeric_value(),
            stage_index: job.stage_index as i64,
            stage_count: job.stage_count as i64,
            inputs: serde_json::to_string(&job.inputs)?,
            params: serde_json::to_string(&job.params)?,
            progress: i64::from(job.progress.percent),
            progress_note: job.progress.note.clone(),
            current_artifact: to_json_opt(&job.current_artifact)?,
            output: to_json_opt(&job.output)?,
            error: to_json_opt(&job.error)?,
            cancel_requested: job.cancel_requested,
            retry_of: job.retry_of.clone(),
            artifacts_purged: job.artifacts_purged,
            created_at: datetime_to_ms(job.created_at),
            updated_at: datetime_to_ms(job.updated_at),
            started_at: job.started_at.map(datetime_to_ms),
            completed_at: job.completed_at.map(datetime_to_ms),
        })
    }

    pub fn into_domain(self) -> Result<Job> {
        let pipeline = PipelineKind::from_str(&self.pipeline).map_err(|_| {
            Error::Database(format!(
                "job {} has unknown pipeline '{}'",
                self.id, self.pipeline
            ))
        })?;
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            Error::Database(format!("job {} has unknown status '{}'", self.id, self.status))
        })?;
        let current_artifact: Option<Artifact> = from_json_opt(&self.current_artifact)?;
        let output: Option<Artifact> = from_json_opt(&self.output)?;
        let error: Option<JobErrorDetail> = from_json_opt(&self.error)?;

        Ok(Job {
            pipeline,
            status,
            priority: Priority::from_numeric(self.priority),
            stage_index: self.stage_index.max(0) as usize,
            stage_count: self.stage_count.max(0) as usize,
            inputs: serde_json::from_str(&self.inputs)?,
            params: serde_json::from_str(&self.params)?,
            progress: Progress::new(self.progress.clamp(0, 100) as u8, self.progress_note),
            current_artifact,
            output,
            error,
            cancel_requested: self.cancel_requested,
            retry_of: self.retry_of,
            artifacts_purged: self.artifacts_purged,
            created_at: ms_to_datetime(self.created_at),
            updated_at: ms_to_datetime(self.updated_at),
            started_at: self.started_at.map(ms_to_datetime),
            completed_at: self.completed_at.map(ms_to_datetime),
            id: self.id,
        })
    }
}

/// Job execution log database model.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobExecutionLogDbModel {
    pub id: String,
    pub job_id: String,
    /// info, warn, error
    pub level: String,
    pub message: String,
    /// Unix epoch milliseconds (UTC)
    pub created_at: i64,
}

impl JobExecutionLogDbModel {
    pub fn new(job_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            level: level.to_string(),
            message: message.into(),
            created_at: crate::database::time::now_ms(),
        }
    }

    pub fn info(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Info, message)
    }

    pub fn warn(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Warn, message)
    }

    pub fn error(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(job_id, LogLevel::Error, message)
    }
}

/// Execution log levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MediaKind, MediaRef};

    #[test]
    fn test_domain_roundtrip_preserves_fields() {
        let mut job = Job::new(
            PipelineKind::LipSync,
            3,
            vec![
                MediaRef::new("/in/face.mp4", MediaKind::Video),
                MediaRef::new("/in/voice.wav", MediaKind::Audio),
            ],
        )
        .with_priority(Priority::High)
        .with_params(serde_json::json!({"emotion": "happy"}));
        job.status = JobStatus::Running;
        job.stage_index = 2;
        job.progress = Progress::new(40, Some("syncing".into()));

        let model = JobDbModel::from_domain(&job).unwrap();
        assert_eq!(model.status, "running");
        assert_eq!(model.pipeline, "lip-sync");
        assert_eq!(model.priority, 3);

        let back = model.into_domain().unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.pipeline, PipelineKind::LipSync);
        assert_eq!(back.stage_index, 2);
        assert_eq!(back.inputs, job.inputs);
        assert_eq!(back.params["emotion"], "happy");
        assert_eq!(back.progress.note.as_deref(), Some("syncing"));
        assert_eq!(
            back.created_at.timestamp_millis(),
            job.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let job = Job::new(PipelineKind::Separator, 1, vec![]);
        let mut model = JobDbModel::from_domain(&job).unwrap();
        model.status = "paused".to_string();
        assert!(model.into_domain().is_err());
    }
}
