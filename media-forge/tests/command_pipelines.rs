//! Built-in catalog driven end to end through an external runner.
//!
//! Everything runs in a single test: writing an executable while other
//! threads fork can make exec fail with ETXTBSY.
#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::json;
use tempfile::TempDir;

use common::{test_config, wait_terminal, write_input};
use media_forge::app::App;
use media_forge::domain::{JobErrorKind, JobStatus, PipelineKind};
use media_forge::service::SubmitRequest;

const RUNNER: &str = r#"#!/bin/sh
cmd="$1"; shift
out=""; extra=""
while [ $# -gt 0 ]; do
  case "$1" in
    --output) out="$2"; shift 2 ;;
    --text|--stem) extra="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if [ "$extra" = "oom" ]; then
  echo "CUDA out of memory" >&2
  exit 86
fi
echo "PROGRESS 50 $cmd halfway"
printf '%s %s' "$cmd" "$extra" > "$out"
echo "PROGRESS 100"
"#;

fn install_runner(dir: &Path) -> PathBuf {
    let path = dir.join("fake-runner.sh");
    std::fs::write(&path, RUNNER).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[tokio::test]
async fn builtin_catalog_runs_through_external_runner() {
    let dir = TempDir::new().unwrap();
    let runner = install_runner(dir.path());

    let mut config = test_config(dir.path());
    config.pipelines.runner_program = Some(runner.to_string_lossy().into_owned());
    let app = App::init(config).await.unwrap();
    app.scheduler.start().await.unwrap();

    let reference = write_input(dir.path(), "reference.wav");

    // Two stages, the second one parameterised.
    let cloned = app
        .service
        .submit(
            SubmitRequest::new(PipelineKind::VoiceClone, vec![reference.clone()])
                .with_params(json!({ "text": "hello" })),
        )
        .await
        .unwrap();
    let job = wait_terminal(&app, &cloned).await;
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    let output = job.output.unwrap();
    assert_eq!(std::fs::read_to_string(&output.path).unwrap(), "voice-clone hello");
    assert!(output.path.starts_with(app.config.paths.content_dir().join("voice_clone")));

    // A missing template parameter fails the stage that needs it.
    let unparameterised = app
        .service
        .submit(SubmitRequest::new(PipelineKind::VoiceClone, vec![reference.clone()]))
        .await
        .unwrap();
    let job = wait_terminal(&app, &unparameterised).await;
    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, JobErrorKind::InputValidation);
    assert_eq!(error.stage_name.as_deref(), Some("clone"));
    assert!(job.current_artifact.unwrap().path.exists());

    // The OOM exit code maps to resource exhaustion.
    let oom = app
        .service
        .submit(
            SubmitRequest::new(PipelineKind::Separator, vec![reference])
                .with_params(json!({ "stem": "oom" })),
        )
        .await
        .unwrap();
    let job = wait_terminal(&app, &oom).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().kind, JobErrorKind::ResourceExhaustion);

    assert!(app.arbiter.holder().is_none());
    app.scheduler.stop().await;
}
