//! On-disk artifact lifecycle.
//!
//! Layout under the data home:
//!
//! ```text
//! jobs/<job_id>/stage-00.<ext>           finalized intermediate of stage 0
//! jobs/<job_id>/stage-01.<ext>.partial   output being written by stage 1
//! content/<folder>/<job_id>.<ext>        promoted final output
//! ```
//!
//! Stages write to the `.partial` path; [`ArtifactManager::finalize`]
//! checksums the content and renames it into place. A finalized path
//! therefore always holds a complete artifact, which is what lets a resumed
//! job reuse it instead of re-running the stage.

mod checksum;

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::domain::{Artifact, MediaKind, PipelineKind};
use crate::utils::KeyedLocks;
use crate::utils::fs::{
    ensure_dir_all, ensure_parent_dir, remove_dir_if_empty, remove_path_if_exists, replace_path,
};
use crate::{Error, Result};

pub use checksum::{ContentDigest, digest_path};

const PARTIAL_SUFFIX: &str = ".partial";

/// Write target for one stage's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub job_id: String,
    pub stage_index: usize,
    pub kind: MediaKind,
    /// Where the stage writes. A directory for [`MediaKind::Frames`].
    pub staging_path: PathBuf,
    /// Where the artifact lives once finalized.
    pub final_path: PathBuf,
}

/// Summary of a purge call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub removed_entries: usize,
}

pub struct ArtifactManager {
    jobs_root: PathBuf,
    content_root: PathBuf,
    locks: KeyedLocks,
}

impl ArtifactManager {
    pub fn new(jobs_root: impl Into<PathBuf>, content_root: impl Into<PathBuf>) -> Self {
        Self {
            jobs_root: jobs_root.into(),
            content_root: content_root.into(),
            locks: KeyedLocks::new(),
        }
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.jobs_root.join(job_id)
    }

    /// Deterministic finalized path for a job's stage output.
    pub fn stage_path(&self, job_id: &str, stage_index: usize, kind: MediaKind) -> PathBuf {
        let name = match kind.extension() {
            Some(ext) => format!("stage-{:02}.{}", stage_index, ext),
            None => format!("stage-{:02}", stage_index),
        };
        self.job_dir(job_id).join(name)
    }

    fn staging_path_for(final_path: &Path) -> PathBuf {
        let mut os = final_path.as_os_str().to_owned();
        os.push(PARTIAL_SUFFIX);
        PathBuf::from(os)
    }

    /// Reserve a write target for `stage_index` of `job_id`.
    ///
    /// Any leftover `.partial` from an interrupted attempt is removed, so the
    /// stage always starts from an empty target.
    pub async fn allocate(
        &self,
        job_id: &str,
        stage_index: usize,
        kind: MediaKind,
    ) -> Result<ArtifactHandle> {
        let _guard = self.locks.lock(job_id).await;
        let final_path = self.stage_path(job_id, stage_index, kind);
        let staging_path = Self::staging_path_for(&final_path);

        ensure_dir_all(&self.job_dir(job_id)).await?;
        if remove_path_if_exists(&staging_path).await? {
            debug!(job_id = %job_id, stage_index, "Removed stale partial output");
        }
        if kind.is_directory() {
            ensure_dir_all(&staging_path).await?;
        }

        Ok(ArtifactHandle {
            job_id: job_id.to_string(),
            stage_index,
            kind,
            staging_path,
            final_path,
        })
    }

    /// Checksum the staged output and move it to its final path.
    pub async fn finalize(&self, handle: &ArtifactHandle) -> Result<Artifact> {
        let _guard = self.locks.lock(&handle.job_id).await;
        if tokio::fs::symlink_metadata(&handle.staging_path)
            .await
            .is_err()
        {
            return Err(Error::validation(format!(
                "stage {} of job {} produced no output at {}",
                handle.stage_index,
                handle.job_id,
                handle.staging_path.display()
            )));
        }

        let digest = digest_path(&handle.staging_path).await?;
        replace_path(&handle.staging_path, &handle.final_path).await?;

        Ok(Artifact {
            job_id: handle.job_id.clone(),
            stage_index: handle.stage_index,
            path: handle.final_path.clone(),
            kind: handle.kind,
            size_bytes: digest.size_bytes,
            checksum: digest.sha256,
            created_at: Utc::now(),
        })
    }

    /// Drop a staged output that will not be finalized.
    pub async fn discard(&self, handle: &ArtifactHandle) -> Result<()> {
        let _guard = self.locks.lock(&handle.job_id).await;
        remove_path_if_exists(&handle.staging_path).await?;
        Ok(())
    }

    /// A finalized artifact already on disk for this stage, if any.
    ///
    /// Used when a job resumes after a crash that happened between
    /// finalizing a stage's output and persisting the stage advance.
    pub async fn existing(
        &self,
        job_id: &str,
        stage_index: usize,
        kind: MediaKind,
    ) -> Result<Option<Artifact>> {
        let _guard = self.locks.lock(job_id).await;
        let path = self.stage_path(job_id, stage_index, kind);
        if tokio::fs::symlink_metadata(&path).await.is_err() {
            return Ok(None);
        }
        let digest = digest_path(&path).await?;
        Ok(Some(Artifact {
            job_id: job_id.to_string(),
            stage_index,
            path,
            kind,
            size_bytes: digest.size_bytes,
            checksum: digest.sha256,
            created_at: Utc::now(),
        }))
    }

    /// Delete a superseded intermediate.
    pub async fn remove(&self, artifact: &Artifact) -> Result<()> {
        let _guard = self.locks.lock(&artifact.job_id).await;
        if remove_path_if_exists(&artifact.path).await? {
            debug!(
                job_id = %artifact.job_id,
                stage_index = artifact.stage_index,
                "Removed superseded intermediate"
            );
        }
        Ok(())
    }

    /// Remove stage outputs of `job_id` older than `before_stage`, except
    /// `keep`.
    ///
    /// Clears intermediates left behind by a crash between persisting a
    /// stage advance and deleting the output it superseded.
    pub async fn prune_superseded(
        &self,
        job_id: &str,
        before_stage: usize,
        keep: Option<&Artifact>,
    ) -> Result<usize> {
        let _guard = self.locks.lock(job_id).await;
        let dir = self.job_dir(job_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io_path("reading directory", &dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path("reading directory", &dir, e))?
        {
            let path = entry.path();
            let stale = entry
                .file_name()
                .to_str()
                .and_then(stage_index_of)
                .is_some_and(|index| index < before_stage);
            if stale
                && keep.is_none_or(|k| k.path != path)
                && remove_path_if_exists(&path).await?
            {
                debug!(job_id = %job_id, path = %path.display(), "Removed stale intermediate");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Move a job's final artifact into the pipeline's content folder.
    pub async fn promote(&self, artifact: &Artifact, pipeline: PipelineKind) -> Result<Artifact> {
        let _guard = self.locks.lock(&artifact.job_id).await;
        let mut target = self
            .content_root
            .join(pipeline.content_folder())
            .join(&artifact.job_id);
        if let Some(ext) = artifact.kind.extension() {
            target.set_extension(ext);
        }
        ensure_parent_dir(&target).await?;
        replace_path(&artifact.path, &target).await?;
        info!(
            job_id = %artifact.job_id,
            path = %target.display(),
            "Promoted final output"
        );

        Ok(Artifact {
            path: target,
            ..artifact.clone()
        })
    }

    /// Undo [`promote`](Self::promote): move the output back to its
    /// intermediate path.
    pub async fn unpromote(&self, promoted: &Artifact, original: &Artifact) -> Result<()> {
        let _guard = self.locks.lock(&promoted.job_id).await;
        ensure_parent_dir(&original.path).await?;
        replace_path(&promoted.path, &original.path).await?;
        debug!(job_id = %promoted.job_id, "Returned promoted output to the job directory");
        Ok(())
    }

    /// Remove every intermediate of `job_id`.
    ///
    /// Promoted outputs live outside the job directory and are never
    /// touched. Calling this again is a no-op.
    pub async fn purge(&self, job_id: &str) -> Result<PurgeReport> {
        let _guard = self.locks.lock(job_id).await;
        let dir = self.job_dir(job_id);
        let mut report = PurgeReport::default();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(Error::io_path("reading directory", &dir, e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path("reading directory", &dir, e))?
        {
            if remove_path_if_exists(&entry.path()).await? {
                report.removed_entries += 1;
            }
        }
        remove_dir_if_empty(&dir).await?;

        if report.removed_entries > 0 {
            info!(
                job_id = %job_id,
                removed = report.removed_entries,
                "Purged job artifacts"
            );
        }
        Ok(report)
    }

    /// Explicitly delete a promoted final output.
    pub async fn purge_output(&self, output: &Artifact) -> Result<bool> {
        let _guard = self.locks.lock(&output.job_id).await;
        remove_path_if_exists(&output.path).await
    }
}

/// Stage index encoded in a `stage-NN[.ext][.partial]` file name.
fn stage_index_of(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("stage-")?;
    let digits = rest.split('.').next()?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ArtifactManager {
        ArtifactManager::new(dir.path().join("jobs"), dir.path().join("content"))
    }

    async fn produce(manager: &ArtifactManager, job: &str, stage: usize) -> Artifact {
        let handle = manager.allocate(job, stage, MediaKind::Video).await.unwrap();
        tokio::fs::write(&handle.staging_path, format!("{}-{}", job, stage))
            .await
            .unwrap();
        manager.finalize(&handle).await.unwrap()
    }

    #[tokio::test]
    async fn test_paths_never_collide() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let a0 = m.allocate("a", 0, MediaKind::Video).await.unwrap();
        let a1 = m.allocate("a", 1, MediaKind::Video).await.unwrap();
        let b0 = m.allocate("b", 0, MediaKind::Video).await.unwrap();
        assert_ne!(a0.final_path, a1.final_path);
        assert_ne!(a0.final_path, b0.final_path);
        assert!(a0.staging_path.to_string_lossy().ends_with(".mp4.partial"));
    }

    #[tokio::test]
    async fn test_finalize_checksums_and_renames() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let artifact = produce(&m, "job", 0).await;
        assert!(artifact.path.exists());
        assert_eq!(artifact.size_bytes, "job-0".len() as u64);
        assert_eq!(artifact.checksum.len(), 64);
        assert!(!ArtifactManager::staging_path_for(&artifact.path).exists());
    }

    #[tokio::test]
    async fn test_finalize_without_output_fails() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let handle = m.allocate("job", 0, MediaKind::Image).await.unwrap();
        assert!(matches!(
            m.finalize(&handle).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_frames_directory_artifact() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let handle = m.allocate("job", 0, MediaKind::Frames).await.unwrap();
        assert!(handle.staging_path.is_dir());
        tokio::fs::write(handle.staging_path.join("0001.png"), b"f1")
            .await
            .unwrap();
        tokio::fs::write(handle.staging_path.join("0002.png"), b"f2")
            .await
            .unwrap();
        let artifact = m.finalize(&handle).await.unwrap();
        assert!(artifact.path.is_dir());
        assert_eq!(artifact.size_bytes, 4);
    }

    #[tokio::test]
    async fn test_existing_reuses_finalized_output() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        assert!(m.existing("job", 0, MediaKind::Video).await.unwrap().is_none());
        let produced = produce(&m, "job", 0).await;
        let found = m.existing("job", 0, MediaKind::Video).await.unwrap().unwrap();
        assert_eq!(found.path, produced.path);
        assert_eq!(found.checksum, produced.checksum);
    }

    #[tokio::test]
    async fn test_purge_keeps_promoted_output_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let first = produce(&m, "job", 0).await;
        let last = produce(&m, "job", 1).await;
        let output = m.promote(&last, PipelineKind::FaceSwap).await.unwrap();
        assert!(output.path.starts_with(dir.path().join("content").join("face_swap")));

        let report = m.purge("job").await.unwrap();
        assert_eq!(report.removed_entries, 1);
        assert!(!first.path.exists());
        assert!(!m.job_dir("job").exists());
        assert!(output.path.exists());

        assert_eq!(m.purge("job").await.unwrap(), PurgeReport::default());

        assert!(m.purge_output(&output).await.unwrap());
        assert!(!output.path.exists());
    }

    #[tokio::test]
    async fn test_unpromote_restores_intermediate() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let last = produce(&m, "job", 0).await;
        let output = m.promote(&last, PipelineKind::Inpaint).await.unwrap();
        assert!(!last.path.exists());

        m.unpromote(&output, &last).await.unwrap();
        assert!(last.path.exists());
        assert!(!output.path.exists());
        assert_eq!(std::fs::read_to_string(&last.path).unwrap(), "job-0");
    }

    #[tokio::test]
    async fn test_prune_superseded_keeps_current_and_later() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let stale = produce(&m, "job", 0).await;
        let current = produce(&m, "job", 1).await;
        let next = produce(&m, "job", 2).await;
        std::fs::write(m.job_dir("job").join("notes.txt"), b"x").unwrap();

        let removed = m.prune_superseded("job", 2, Some(&current)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!stale.path.exists());
        assert!(current.path.exists());
        assert!(next.path.exists());
        assert!(m.job_dir("job").join("notes.txt").exists());

        assert_eq!(m.prune_superseded("missing", 3, None).await.unwrap(), 0);
    }

    #[test]
    fn test_stage_index_of() {
        assert_eq!(stage_index_of("stage-03.mp4"), Some(3));
        assert_eq!(stage_index_of("stage-12"), Some(12));
        assert_eq!(stage_index_of("stage-01.wav.partial"), Some(1));
        assert_eq!(stage_index_of("notes.txt"), None);
    }
}
