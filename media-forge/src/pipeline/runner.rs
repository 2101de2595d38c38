//! Drives one claimed job through its remaining stages.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::{ProgressReporter, ProgressUpdate};
use super::registry::{PipelineDefinition, PipelineRegistry};
use super::scheduler::SchedulerConfig;
use super::stage::{Stage, StageContext, StageError, StageInput};
use crate::artifact::ArtifactManager;
use crate::database::models::LogLevel;
use crate::device::{DeviceArbiter, Lease};
use crate::domain::{
    Artifact, Job, JobErrorDetail, JobErrorKind, JobPatch, JobStatus, MediaRef, Progress,
};
use crate::store::JobStore;
use crate::{Error, Result};

/// State shared by the scheduler and every job it runs.
pub(super) struct SchedulerShared {
    pub config: SchedulerConfig,
    pub store: Arc<JobStore>,
    pub registry: Arc<PipelineRegistry>,
    pub arbiter: DeviceArbiter,
    pub artifacts: Arc<ArtifactManager>,
    /// Execution slots for CPU work. A job gives its slot up while it
    /// waits for or uses the device.
    pub slots: Arc<Semaphore>,
    /// Cancellation tokens of the jobs this process is executing.
    pub active: DashMap<String, CancellationToken>,
    pub shutdown: CancellationToken,
}

/// How a job run ended.
#[derive(Debug)]
enum RunOutcome {
    /// Final stage finished; its artifact is still in the job directory.
    Completed { output: Artifact },
    Failed(JobErrorDetail),
    Cancelled,
    /// The process is shutting down. The job stays `running` and resumes
    /// at its last persisted stage on the next start.
    Interrupted,
}

#[derive(Clone)]
pub(super) struct JobRunner {
    shared: Arc<SchedulerShared>,
    progress_tx: mpsc::Sender<ProgressUpdate>,
}

impl JobRunner {
    pub fn new(shared: Arc<SchedulerShared>, progress_tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            shared,
            progress_tx,
        }
    }

    /// Run `job` to a terminal state (or until shutdown). Never fails; every
    /// error ends up recorded on the job.
    ///
    /// `slot` is the execution slot the job was claimed with.
    pub async fn run(&self, job: Job, slot: OwnedSemaphorePermit) {
        let job_id = job.id.clone();
        let token = self.shared.shutdown.child_token();
        self.shared.active.insert(job_id.clone(), token.clone());

        info!(
            job_id = %job_id,
            pipeline = %job.pipeline,
            stage_index = job.stage_index,
            stage_count = job.stage_count,
            "Running job"
        );

        let mut slot = Some(slot);
        let outcome = self.drive(job, &mut slot, &token).await;
        drop(slot);

        // Any lease still pending or held by this job is gone after this.
        if self.shared.arbiter.try_cancel(&job_id) {
            debug!(job_id = %job_id, "Revoked leftover device lease");
        }

        let finished = match outcome {
            Ok(outcome) => self.finish(&job_id, outcome).await,
            Err(e) => Err(e),
        };
        if let Err(e) = finished {
            self.force_fail(&job_id, e).await;
        }

        self.shared.active.remove(&job_id);
    }

    async fn drive(
        &self,
        mut job: Job,
        slot: &mut Option<OwnedSemaphorePermit>,
        token: &CancellationToken,
    ) -> Result<RunOutcome> {
        let definition = match self.shared.registry.resolve(job.pipeline) {
            Ok(definition) => definition,
            Err(e) => {
                return Ok(RunOutcome::Failed(JobErrorDetail::new(
                    JobErrorKind::InputValidation,
                    e.to_string(),
                )));
            }
        };
        if definition.stage_count() != job.stage_count {
            return Err(Error::inconsistency(
                &job.id,
                format!(
                    "job has {} stages but pipeline '{}' defines {}",
                    job.stage_count,
                    job.pipeline,
                    definition.stage_count()
                ),
            ));
        }

        if job.stage_index > 0 {
            let pruned = self
                .shared
                .artifacts
                .prune_superseded(&job.id, job.stage_index, job.current_artifact.as_ref())
                .await?;
            if pruned > 0 {
                info!(job_id = %job.id, pruned, "Removed intermediates left by an earlier run");
            }
        }

        let mut lease: Option<Lease> = None;

        while job.stage_index < job.stage_count {
            if let Some(outcome) = self.check_boundary(&job, token).await? {
                return Ok(outcome);
            }

            let index = job.stage_index;
            let Some(stage) = definition.stage(index).cloned() else {
                return Err(Error::inconsistency(&job.id, format!("no stage {}", index)));
            };

            let Some(input) = job.next_stage_input() else {
                return Ok(RunOutcome::Failed(
                    JobErrorDetail::new(JobErrorKind::InputValidation, "job has no inputs")
                        .at_stage(index, stage.name()),
                ));
            };
            if let Err(e) = stage.validate(&input).await {
                return Ok(self.stage_failed(&job, index, stage.as_ref(), e));
            }

            let artifact = match self
                .shared
                .artifacts
                .existing(&job.id, index, stage.output_kind())
                .await?
            {
                Some(artifact) => {
                    info!(
                        job_id = %job.id,
                        stage = %stage.name(),
                        stage_index = index,
                        "Reusing finalized output from an earlier run"
                    );
                    artifact
                }
                None => {
                    match self
                        .execute_with_retries(&job, index, &stage, input, &mut lease, slot, token)
                        .await?
                    {
                        Ok(artifact) => artifact,
                        Err(StageError::Cancelled) => return self.cancelled_or_interrupted(&job.id).await,
                        Err(e) => return Ok(self.stage_failed(&job, index, stage.as_ref(), e)),
                    }
                }
            };

            self.shared
                .store
                .log(
                    &job.id,
                    LogLevel::Info,
                    format!("stage '{}' finished ({} bytes)", stage.name(), artifact.size_bytes),
                )
                .await;

            if index + 1 == job.stage_count {
                // A cancel that arrived during a non-interruptible last stage
                // still wins; the finished output is purged with the rest.
                if let Some(outcome) = self.check_boundary(&job, token).await? {
                    return Ok(outcome);
                }
                return Ok(RunOutcome::Completed { output: artifact });
            }

            job = self.advance(&job, artifact).await?;
            Self::keep_or_release(&mut lease, &definition, job.stage_index);
        }

        Err(Error::inconsistency(
            &job.id,
            format!(
                "running job has stage index {} of {}",
                job.stage_index, job.stage_count
            ),
        ))
    }

    /// Observe cancellation and the persisted record before a stage starts.
    async fn check_boundary(
        &self,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<Option<RunOutcome>> {
        if token.is_cancelled() {
            return self.cancelled_or_interrupted(&job.id).await.map(Some);
        }

        let fresh = self.shared.store.get(&job.id).await?;
        if fresh.cancel_requested {
            token.cancel();
            return Ok(Some(RunOutcome::Cancelled));
        }
        if fresh.status != JobStatus::Running || fresh.stage_index != job.stage_index {
            return Err(Error::inconsistency(
                &job.id,
                format!(
                    "expected running at stage {}, found {} at stage {}",
                    job.stage_index, fresh.status, fresh.stage_index
                ),
            ));
        }
        Ok(None)
    }

    /// Persist the stage advance, then drop the intermediate it supersedes.
    async fn advance(&self, job: &Job, artifact: Artifact) -> Result<Job> {
        let superseded = job.current_artifact.clone();
        let patch = JobPatch::new()
            .stage_index(job.stage_index + 1)
            .current_artifact(Some(artifact))
            .progress(Progress::default());

        let next = self
            .shared
            .store
            .update_if(&job.id, JobStatus::Running, patch)
            .await?
            .ok_or_else(|| Error::inconsistency(&job.id, "job left running during a stage"))?;

        if let Some(old) = superseded
            && next.current_artifact.as_ref().is_none_or(|a| a.path != old.path)
        {
            if let Err(e) = self.shared.artifacts.remove(&old).await {
                warn!(job_id = %job.id, "Failed to remove superseded intermediate: {}", e);
            }
        }

        debug!(job_id = %job.id, stage_index = next.stage_index, "Stage advance persisted");
        Ok(next)
    }

    /// Hold the lease only while the next stage needs the device.
    fn keep_or_release(lease: &mut Option<Lease>, definition: &PipelineDefinition, next: usize) {
        let next_needs_device = definition
            .stage(next)
            .is_some_and(|s| s.resource_class().needs_device());
        if !next_needs_device && let Some(released) = lease.take() {
            debug!(job_id = %released.job_id(), lease_id = released.id(), "Releasing device before CPU stage");
        }
    }

    /// Hold an execution slot for CPU stages only.
    ///
    /// Returns `false` if the job was cancelled while waiting.
    async fn ensure_slot(
        &self,
        stage: &dyn Stage,
        slot: &mut Option<OwnedSemaphorePermit>,
        token: &CancellationToken,
    ) -> bool {
        if stage.resource_class().needs_device() {
            *slot = None;
            return true;
        }
        if slot.is_some() {
            return true;
        }
        tokio::select! {
            _ = token.cancelled() => false,
            permit = self.shared.slots.clone().acquire_owned() => match permit {
                Ok(permit) => {
                    *slot = Some(permit);
                    true
                }
                Err(_) => false,
            }
        }
    }

    /// Ensure a live lease is held when `stage` needs the device.
    ///
    /// Returns `false` if the job was cancelled while waiting.
    async fn ensure_lease(
        &self,
        job: &Job,
        stage: &dyn Stage,
        lease: &mut Option<Lease>,
        token: &CancellationToken,
    ) -> bool {
        if !stage.resource_class().needs_device() {
            *lease = None;
            return true;
        }
        if lease.as_ref().is_some_and(|l| !l.is_revoked()) {
            return true;
        }
        *lease = None;

        debug!(job_id = %job.id, stage = %stage.name(), "Waiting for device");
        tokio::select! {
            _ = token.cancelled() => false,
            acquired = self.shared.arbiter.acquire(&job.id, job.priority) => match acquired {
                Ok(granted) => {
                    debug!(job_id = %job.id, lease_id = granted.id(), "Device acquired");
                    *lease = Some(granted);
                    true
                }
                Err(e) => {
                    debug!(job_id = %job.id, "{}", e);
                    false
                }
            }
        }
    }

    /// Run one stage, retrying resource exhaustion as configured.
    ///
    /// The outer `Result` carries store errors; the inner one the stage result.
    async fn execute_with_retries(
        &self,
        job: &Job,
        index: usize,
        stage: &Arc<dyn Stage>,
        input: MediaRef,
        lease: &mut Option<Lease>,
        slot: &mut Option<OwnedSemaphorePermit>,
        token: &CancellationToken,
    ) -> Result<std::result::Result<Artifact, StageError>> {
        let max_retries = self.shared.config.resource_exhaustion_retries;
        let mut attempt = 0u32;

        loop {
            if !self.ensure_slot(stage.as_ref(), slot, token).await
                || !self.ensure_lease(job, stage.as_ref(), lease, token).await
            {
                return Ok(Err(StageError::Cancelled));
            }

            self.shared
                .store
                .log(
                    &job.id,
                    LogLevel::Info,
                    format!("stage '{}' started (attempt {})", stage.name(), attempt + 1),
                )
                .await;

            let result = self
                .execute_stage(job, index, stage, input.clone(), lease.as_ref(), token)
                .await;

            match result {
                Err(StageError::ResourceExhausted(msg)) if attempt < max_retries => {
                    attempt += 1;
                    let backoff = self.shared.config.resource_retry_backoff() * attempt;
                    warn!(
                        job_id = %job.id,
                        stage = %stage.name(),
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Stage ran out of resources, retrying: {}",
                        msg
                    );
                    self.shared
                        .store
                        .log(
                            &job.id,
                            LogLevel::Warn,
                            format!("stage '{}' ran out of resources, retry {}", stage.name(), attempt),
                        )
                        .await;
                    // Let other jobs use the device while backing off.
                    *lease = None;
                    tokio::select! {
                        _ = token.cancelled() => return Ok(Err(StageError::Cancelled)),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                other => return Ok(other),
            }
        }
    }

    async fn execute_stage(
        &self,
        job: &Job,
        index: usize,
        stage: &Arc<dyn Stage>,
        input: MediaRef,
        lease: Option<&Lease>,
        token: &CancellationToken,
    ) -> std::result::Result<Artifact, StageError> {
        let artifacts = &self.shared.artifacts;
        let handle = artifacts
            .allocate(&job.id, index, stage.output_kind())
            .await
            .map_err(|e| StageError::internal(e.to_string()))?;

        let deadline = stage.timeout().or(self.shared.config.default_stage_timeout());
        if let Some(lease) = lease {
            lease.set_deadline(deadline);
        }

        let progress = ProgressReporter::new(&job.id, index, self.progress_tx.clone());
        progress.report(0, Some(format!("{} started", stage.name())));
        let ctx = StageContext {
            cancel: token.clone(),
            lease_revoked: lease.map(Lease::revoked),
            progress,
        };
        let stage_input = StageInput {
            job_id: job.id.clone(),
            stage_index: index,
            primary: input,
            sources: job.inputs.clone(),
            output_path: handle.staging_path.clone(),
            output_kind: stage.output_kind(),
            params: job.params.clone(),
        };

        let execution = async {
            match deadline {
                Some(limit) => tokio::time::timeout(limit, stage.execute(stage_input, ctx))
                    .await
                    .unwrap_or(Err(StageError::Timeout(limit))),
                None => stage.execute(stage_input, ctx).await,
            }
        };
        let revoked = async {
            match lease {
                Some(lease) => lease.revoked().cancelled_owned().await,
                None => std::future::pending().await,
            }
        };
        // Non-interruptible stages finish even when the job is cancelled;
        // shutdown still drops them.
        let interrupt = async {
            if stage.supports_interrupt() {
                token.cancelled().await
            } else {
                self.shared.shutdown.cancelled().await
            }
        };

        let result = tokio::select! {
            result = execution => result,
            _ = revoked => Err(StageError::Timeout(deadline.unwrap_or_default())),
            _ = interrupt => Err(StageError::Cancelled),
        };

        if let Some(lease) = lease {
            lease.set_deadline(None);
        }

        match result {
            Ok(output) => {
                let artifact = artifacts.finalize(&handle).await.map_err(|e| match e {
                    Error::Validation(msg) => StageError::Internal(msg),
                    other => StageError::internal(other.to_string()),
                })?;
                if let Some(note) = output.note {
                    debug!(job_id = %job.id, stage = %stage.name(), "{}", note);
                }
                Ok(artifact)
            }
            Err(e) => {
                if let Err(discard) = artifacts.discard(&handle).await {
                    warn!(job_id = %job.id, "Failed to discard partial output: {}", discard);
                }
                Err(e)
            }
        }
    }

    fn stage_failed(&self, job: &Job, index: usize, stage: &dyn Stage, e: StageError) -> RunOutcome {
        let kind = e.job_error_kind().unwrap_or(JobErrorKind::StageInternal);
        warn!(
            job_id = %job.id,
            stage = %stage.name(),
            stage_index = index,
            kind = %kind,
            "Stage failed: {}",
            e
        );
        RunOutcome::Failed(JobErrorDetail::new(kind, e.to_string()).at_stage(index, stage.name()))
    }

    async fn cancelled_or_interrupted(&self, job_id: &str) -> Result<RunOutcome> {
        if !self.shared.shutdown.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        let job = self.shared.store.get(job_id).await?;
        Ok(if job.cancel_requested {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Interrupted
        })
    }

    async fn finish(&self, job_id: &str, outcome: RunOutcome) -> Result<()> {
        let store = &self.shared.store;
        let artifacts = &self.shared.artifacts;

        match outcome {
            RunOutcome::Completed { output } => {
                let job = store.get(job_id).await?;
                let promoted = artifacts.promote(&output, job.pipeline).await?;
                let written = store
                    .update_if(
                        job_id,
                        JobStatus::Running,
                        JobPatch::completed(job.stage_count, promoted.clone()),
                    )
                    .await
                    .and_then(|updated| {
                        updated.ok_or_else(|| {
                            Error::inconsistency(job_id, "job left running before completion")
                        })
                    });
                if let Err(e) = written {
                    // The job will not be completed; keep its output with the
                    // other intermediates.
                    if let Err(undo) = artifacts.unpromote(&promoted, &output).await {
                        warn!(job_id = %job_id, "Failed to return promoted output: {}", undo);
                    }
                    return Err(e);
                }

                artifacts.purge(job_id).await?;
                store
                    .update_if(
                        job_id,
                        JobStatus::Completed,
                        JobPatch::new().artifacts_purged(true),
                    )
                    .await?;
                store
                    .log(job_id, LogLevel::Info, format!("completed: {}", promoted.path.display()))
                    .await;
                info!(job_id = %job_id, output = %promoted.path.display(), "Job completed");
            }
            RunOutcome::Failed(detail) => {
                let cause = detail.cause();
                let patch = JobPatch::new().status(JobStatus::StageFailed).error(detail);
                if store.update_if(job_id, JobStatus::Running, patch).await?.is_none() {
                    return Err(Error::inconsistency(job_id, "job left running before failure"));
                }
                store
                    .update_if(job_id, JobStatus::StageFailed, JobPatch::new().status(JobStatus::Failed))
                    .await?;
                store.log(job_id, LogLevel::Error, cause.clone()).await;
                error!(job_id = %job_id, "Job failed: {}", cause);
            }
            RunOutcome::Cancelled => {
                let report = artifacts.purge(job_id).await?;
                let patch = JobPatch::new()
                    .status(JobStatus::Cancelled)
                    .artifacts_purged(true);
                if store.update_if(job_id, JobStatus::Running, patch).await?.is_none() {
                    warn!(job_id = %job_id, "Cancelled job was no longer running");
                }
                store
                    .log(
                        job_id,
                        LogLevel::Info,
                        format!("cancelled, {} artifact entries removed", report.removed_entries),
                    )
                    .await;
                info!(job_id = %job_id, "Job cancelled");
            }
            RunOutcome::Interrupted => {
                info!(job_id = %job_id, "Job interrupted by shutdown, will resume on restart");
            }
        }
        Ok(())
    }

    async fn force_fail(&self, job_id: &str, e: Error) {
        let kind = match e {
            Error::StoreInconsistency { .. } => JobErrorKind::StoreInconsistency,
            _ => JobErrorKind::StageInternal,
        };
        error!(job_id = %job_id, "Job aborted: {}", e);
        let detail = JobErrorDetail::new(kind, e.to_string());
        match self.shared.store.force_fail(job_id, &detail).await {
            Ok(_) => {
                self.shared
                    .store
                    .log(job_id, LogLevel::Error, detail.cause())
                    .await;
            }
            Err(store_err) => {
                error!(job_id = %job_id, "Failed to record job failure: {}", store_err);
            }
        }
    }
}
