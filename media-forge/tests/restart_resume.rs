mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;

use common::{Behavior, ScriptedStage, start_app, test_config, wait_count, wait_for, wait_terminal, write_input};
use media_forge::app::App;
use media_forge::domain::{JobStatus, MediaKind, PipelineKind};
use media_forge::pipeline::PipelineRegistry;
use media_forge::service::SubmitRequest;

struct Counters {
    extract: Arc<AtomicUsize>,
    upscale: Arc<AtomicUsize>,
    encode: Arc<AtomicUsize>,
}

/// extract (cpu) -> upscale (gpu) -> encode (cpu)
fn super_resolution(upscale: Behavior) -> (PipelineRegistry, Counters) {
    let extract = ScriptedStage::cpu("extract", MediaKind::Video, MediaKind::Frames);
    let upscale = ScriptedStage::gpu("upscale", MediaKind::Frames, MediaKind::Frames).behavior(upscale);
    let encode = ScriptedStage::cpu("encode", MediaKind::Frames, MediaKind::Video).non_interruptible();
    let counters = Counters {
        extract: extract.invocations(),
        upscale: upscale.invocations(),
        encode: encode.invocations(),
    };
    let registry = PipelineRegistry::builder()
        .with(
            PipelineKind::SuperResolution,
            vec![extract.into_arc(), upscale.into_arc(), encode.into_arc()],
        )
        .unwrap()
        .build();
    (registry, counters)
}

/// Run a job until it is parked inside `upscale`, then stop the process.
async fn interrupt_during_upscale(dir: &TempDir) -> String {
    let (registry, counters) = super_resolution(Behavior::BlockUntilCancelled);
    let app = start_app(test_config(dir.path()), registry).await;

    let video = write_input(dir.path(), "movie.mp4");
    let id = app
        .service
        .submit(SubmitRequest::new(PipelineKind::SuperResolution, vec![video]))
        .await
        .unwrap();

    wait_count(&counters.upscale, 1).await;
    assert_eq!(counters.extract.load(Ordering::SeqCst), 1);

    shut_down(app).await;
    id
}

async fn shut_down(app: App) {
    app.scheduler.stop().await;
    app.pool.close().await;
}

#[tokio::test]
async fn restart_resumes_at_the_interrupted_stage() {
    let dir = TempDir::new().unwrap();
    let id = interrupt_during_upscale(&dir).await;

    // After shutdown the job is still running at stage 1 with stage 0's
    // output recorded.
    let (registry, counters) = super_resolution(Behavior::Succeed);
    let app = App::with_registry(test_config(dir.path()), registry)
        .await
        .unwrap();
    let parked = app.store.get(&id).await.unwrap();
    assert_eq!(parked.status, JobStatus::Running);
    assert_eq!(parked.stage_index, 1);
    let first_output = parked.current_artifact.clone().unwrap();
    assert_eq!(first_output.stage_index, 0);
    assert!(first_output.path.exists());

    app.scheduler.start().await.unwrap();
    let job = wait_terminal(&app, &id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(counters.extract.load(Ordering::SeqCst), 0, "stage 0 must not run again");
    assert_eq!(counters.upscale.load(Ordering::SeqCst), 1);
    assert_eq!(counters.encode.load(Ordering::SeqCst), 1);
    assert!(job.output.unwrap().path.exists());
    assert!(!app.artifacts.job_dir(&id).exists());

    shut_down(app).await;
}

#[tokio::test]
async fn finalized_output_is_reused_after_a_crash() {
    let dir = TempDir::new().unwrap();
    let id = interrupt_during_upscale(&dir).await;

    // Simulate a crash after `upscale` finalized its output but before the
    // stage advance was persisted.
    let (registry, counters) = super_resolution(Behavior::Succeed);
    let app = App::with_registry(test_config(dir.path()), registry)
        .await
        .unwrap();
    let finalized = app.artifacts.stage_path(&id, 1, MediaKind::Frames);
    std::fs::create_dir_all(&finalized).unwrap();
    std::fs::write(finalized.join("frame_0001.png"), b"upscaled").unwrap();

    app.scheduler.start().await.unwrap();
    let job = wait_terminal(&app, &id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(counters.upscale.load(Ordering::SeqCst), 0);
    assert_eq!(counters.encode.load(Ordering::SeqCst), 1);

    shut_down(app).await;
}

#[tokio::test]
async fn cancel_requested_while_down_is_honoured_on_restart() {
    let dir = TempDir::new().unwrap();
    let id = interrupt_during_upscale(&dir).await;

    let (registry, counters) = super_resolution(Behavior::Succeed);
    let app = App::with_registry(test_config(dir.path()), registry)
        .await
        .unwrap();
    assert!(app.store.request_cancel(&id).await.unwrap());

    app.scheduler.start().await.unwrap();
    let job = wait_for(&app, &id, |job| job.status == JobStatus::Cancelled).await;

    assert!(job.artifacts_purged);
    assert_eq!(counters.upscale.load(Ordering::SeqCst), 0);
    assert!(!app.artifacts.job_dir(&id).exists());

    shut_down(app).await;
}
