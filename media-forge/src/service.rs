//! Ingress facade: submit, inspect, cancel, retry and purge jobs.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifact::{ArtifactManager, PurgeReport};
use crate::database::models::{JobExecutionLogDbModel, LogLevel};
use crate::domain::{
    Job, JobErrorDetail, JobPatch, JobStatus, MediaRef, PipelineKind, Priority, Progress,
};
use crate::pipeline::{PipelineRegistry, Scheduler};
use crate::store::{JobFilter, JobStore};
use crate::{Error, Result};

/// A request to run a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub pipeline: PipelineKind,
    /// Primary input first; further inputs are passed to stages as sources.
    pub inputs: Vec<MediaRef>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl SubmitRequest {
    pub fn new(pipeline: PipelineKind, inputs: Vec<MediaRef>) -> Self {
        Self {
            pipeline,
            inputs,
            priority: Priority::default(),
            params: empty_params(),
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
}

/// What get-status returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: String,
    pub pipeline: PipelineKind,
    pub status: JobStatus,
    pub priority: Priority,
    pub stage_index: usize,
    pub stage_count: usize,
    /// Name of the stage being executed, while running.
    pub current_stage: Option<String>,
    pub progress: Progress,
    /// Human-readable description of where the job stands.
    pub message: String,
    pub error: Option<JobErrorDetail>,
    pub output: Option<PathBuf>,
    pub cancel_requested: bool,
    pub retry_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Acknowledgement of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case", tag = "ack", content = "status")]
pub enum CancelAck {
    /// The job had not started and is now `cancelled`.
    Cancelled,
    /// The job is running; it stops at the next stage boundary or
    /// interruption point.
    CancelRequested,
    /// Nothing to cancel.
    AlreadyTerminal(JobStatus),
}

pub struct JobService {
    store: Arc<JobStore>,
    registry: Arc<PipelineRegistry>,
    artifacts: Arc<ArtifactManager>,
    /// Present when jobs execute in this process.
    scheduler: Option<Arc<Scheduler>>,
}

impl JobService {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<PipelineRegistry>,
        artifacts: Arc<ArtifactManager>,
    ) -> Self {
        Self {
            store,
            registry,
            artifacts,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Validate and queue a job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<String> {
        self.enqueue(request, None).await
    }

    async fn enqueue(&self, request: SubmitRequest, retry_of: Option<&str>) -> Result<String> {
        let definition = self.registry.resolve(request.pipeline)?;

        let Some(primary) = request.inputs.first() else {
            return Err(Error::validation("at least one input is required"));
        };
        for input in &request.inputs {
            let exists = tokio::fs::try_exists(&input.path)
                .await
                .map_err(|e| Error::io_path("checking input", &input.path, e))?;
            if !exists {
                return Err(Error::validation(format!(
                    "input {} does not exist",
                    input.path.display()
                )));
            }
        }

        if let Some(first) = definition.stage(0)
            && !first.input_kinds().contains(&primary.kind)
        {
            return Err(Error::validation(format!(
                "pipeline '{}' cannot start from {} input (stage '{}' accepts {})",
                request.pipeline,
                primary.kind,
                first.name(),
                first
                    .input_kinds()
                    .iter()
                    .map(|k| k.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        if !request.params.is_object() {
            return Err(Error::validation("params must be a JSON object"));
        }

        let mut job = Job::new(request.pipeline, definition.stage_count(), request.inputs)
            .with_priority(request.priority)
            .with_params(request.params);
        if let Some(original) = retry_of {
            job = job.with_retry_of(original);
        }
        let id = self.store.create(&job).await?;
        info!(job_id = %id, pipeline = %job.pipeline, priority = %job.priority, "Job submitted");
        Ok(id)
    }

    pub async fn get_status(&self, id: &str) -> Result<JobStatusView> {
        let job = self.store.get(id).await?;
        Ok(self.view(job))
    }

    /// Cancel a job.
    ///
    /// A queued job is cancelled on the spot. For a running job the request
    /// is persisted and signalled; the scheduler finishes the cancellation.
    pub async fn cancel(&self, id: &str) -> Result<CancelAck> {
        let job = self.store.get(id).await?;
        if job.status.is_terminal() {
            return Ok(CancelAck::AlreadyTerminal(job.status));
        }

        if !self.store.request_cancel(id).await? {
            let current = self.store.get(id).await?;
            return Ok(CancelAck::AlreadyTerminal(current.status));
        }

        if job.status == JobStatus::Queued {
            let patch = JobPatch::new()
                .status(JobStatus::Cancelled)
                .artifacts_purged(true);
            if self
                .store
                .update_if(id, JobStatus::Queued, patch)
                .await?
                .is_some()
            {
                self.artifacts.purge(id).await?;
                self.store
                    .log(id, LogLevel::Info, "cancelled before start")
                    .await;
                info!(job_id = %id, "Queued job cancelled");
                return Ok(CancelAck::Cancelled);
            }
            // Claimed in the meantime; the scheduler sees the persisted flag.
        }

        if let Some(scheduler) = &self.scheduler
            && !scheduler.cancel(id)
        {
            debug!(job_id = %id, "Job not executing here; relying on persisted request");
        }
        Ok(CancelAck::CancelRequested)
    }

    /// Jobs matching `filter`, oldest first.
    pub async fn list(&self, filter: JobFilter) -> Result<Vec<JobStatusView>> {
        let jobs = self.store.list_all(filter).await?;
        Ok(jobs.into_iter().map(|job| self.view(job)).collect())
    }

    /// Submit a new job with the inputs, parameters and priority of a
    /// finished one.
    pub async fn retry(&self, id: &str) -> Result<String> {
        let job = self.store.get(id).await?;
        if !job.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: job.status.to_string(),
                to: "retried".to_string(),
            });
        }

        let request = SubmitRequest::new(job.pipeline, job.inputs)
            .with_priority(job.priority)
            .with_params(job.params);
        let new_id = self.enqueue(request, Some(id)).await?;
        info!(job_id = %new_id, retry_of = %id, "Job resubmitted");
        Ok(new_id)
    }

    /// Remove the intermediates of a terminal job. The final output stays.
    pub async fn purge(&self, id: &str) -> Result<PurgeReport> {
        let job = self.store.get(id).await?;
        if !job.status.is_terminal() {
            return Err(Error::validation(format!(
                "job {} is {}; only finished jobs can be purged",
                id, job.status
            )));
        }
        let report = self.artifacts.purge(id).await?;
        self.store
            .update_if(id, job.status, JobPatch::new().artifacts_purged(true))
            .await?;
        Ok(report)
    }

    /// Delete the promoted final output of a completed job.
    ///
    /// The job stays `completed`; its output reference then points at a
    /// removed file.
    pub async fn purge_output(&self, id: &str) -> Result<bool> {
        let job = self.store.get(id).await?;
        let Some(output) = job.output.as_ref() else {
            return Err(Error::validation(format!("job {} has no output", id)));
        };
        let removed = self.artifacts.purge_output(output).await?;
        if removed {
            self.store
                .log(id, LogLevel::Info, format!("output {} purged", output.path.display()))
                .await;
        }
        Ok(removed)
    }

    pub async fn logs(&self, id: &str) -> Result<Vec<JobExecutionLogDbModel>> {
        self.store.get(id).await?;
        self.store.logs(id).await
    }

    fn view(&self, job: Job) -> JobStatusView {
        let current_stage = (job.status == JobStatus::Running)
            .then(|| self.registry.resolve(job.pipeline).ok())
            .flatten()
            .and_then(|def| def.stage(job.stage_index).map(|s| s.name().to_string()));

        let message = match job.status {
            JobStatus::Queued if job.cancel_requested => "queued, cancellation requested".to_string(),
            JobStatus::Queued => "waiting for a worker".to_string(),
            JobStatus::Running => {
                let stage = current_stage.as_deref().unwrap_or("unknown");
                let mut msg = format!(
                    "running stage {}/{} ({}) {}%",
                    job.stage_index + 1,
                    job.stage_count,
                    stage,
                    job.progress.percent
                );
                if let Some(note) = &job.progress.note {
                    msg.push_str(": ");
                    msg.push_str(note);
                }
                if job.cancel_requested {
                    msg.push_str(", cancellation requested");
                }
                msg
            }
            JobStatus::StageFailed | JobStatus::Failed => job
                .error
                .as_ref()
                .map(JobErrorDetail::cause)
                .unwrap_or_else(|| "failed without a recorded cause".to_string()),
            JobStatus::Cancelled => "cancelled by request".to_string(),
            JobStatus::Completed => match &job.output {
                Some(output) => format!("completed: {}", output.path.display()),
                None => "completed".to_string(),
            },
        };

        JobStatusView {
            output: job.output.as_ref().map(|o| o.path.clone()),
            id: job.id,
            pipeline: job.pipeline,
            status: job.status,
            priority: job.priority,
            stage_index: job.stage_index,
            stage_count: job.stage_count,
            current_stage,
            progress: job.progress,
            message,
            error: job.error,
            cancel_requested: job.cancel_requested,
            retry_of: job.retry_of,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
