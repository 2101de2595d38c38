#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use media_forge::app::App;
use media_forge::config::AppConfig;
use media_forge::device::ArbiterEvent;
use media_forge::domain::{Job, MediaKind, MediaRef};
use media_forge::pipeline::{
    PipelineRegistry, ResourceClass, Stage, StageContext, StageError, StageInput, StageOutput,
};

/// What a scripted stage does when invoked.
#[derive(Clone)]
pub enum Behavior {
    Succeed,
    Sleep(Duration),
    Fail(StageError),
    /// Fail with the error for the first `n` invocations, then succeed.
    FailTimes(usize, StageError),
    /// Park until the job is cancelled or the scheduler stops.
    BlockUntilCancelled,
}

pub struct ScriptedStage {
    name: String,
    class: ResourceClass,
    accepts: Vec<MediaKind>,
    produces: MediaKind,
    behavior: Behavior,
    interruptible: bool,
    invocations: Arc<AtomicUsize>,
}

impl ScriptedStage {
    pub fn gpu(name: &str, accepts: MediaKind, produces: MediaKind) -> Self {
        Self::new(name, ResourceClass::GpuExclusive, accepts, produces)
    }

    pub fn cpu(name: &str, accepts: MediaKind, produces: MediaKind) -> Self {
        Self::new(name, ResourceClass::LightCpu, accepts, produces)
    }

    fn new(name: &str, class: ResourceClass, accepts: MediaKind, produces: MediaKind) -> Self {
        Self {
            name: name.to_string(),
            class,
            accepts: vec![accepts],
            produces,
            behavior: Behavior::Succeed,
            interruptible: true,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn non_interruptible(mut self) -> Self {
        self.interruptible = false;
        self
    }

    pub fn invocations(&self) -> Arc<AtomicUsize> {
        self.invocations.clone()
    }

    pub fn into_arc(self) -> Arc<dyn Stage> {
        Arc::new(self)
    }

    async fn write_output(&self, input: &StageInput) -> Result<(), StageError> {
        let io = |e: std::io::Error| StageError::internal(e.to_string());
        if input.output_kind.is_directory() {
            tokio::fs::create_dir_all(&input.output_path).await.map_err(io)?;
            tokio::fs::write(input.output_path.join("frame_0001.png"), self.name.as_bytes())
                .await
                .map_err(io)
        } else {
            tokio::fs::write(&input.output_path, self.name.as_bytes())
                .await
                .map_err(io)
        }
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn resource_class(&self) -> ResourceClass {
        self.class
    }

    fn input_kinds(&self) -> &[MediaKind] {
        &self.accepts
    }

    fn output_kind(&self) -> MediaKind {
        self.produces
    }

    fn supports_interrupt(&self) -> bool {
        self.interruptible
    }

    async fn execute(&self, input: StageInput, ctx: StageContext) -> Result<StageOutput, StageError> {
        let call = self.invocations.fetch_add(1, Ordering::SeqCst);
        ctx.report(10, Some(format!("{} working", self.name)));

        match &self.behavior {
            Behavior::Succeed => {}
            Behavior::Sleep(duration) => tokio::time::sleep(*duration).await,
            Behavior::Fail(e) => return Err(e.clone()),
            Behavior::FailTimes(n, e) if call < *n => return Err(e.clone()),
            Behavior::FailTimes(..) => {}
            Behavior::BlockUntilCancelled => {
                ctx.stopped().await;
                return Err(StageError::Cancelled);
            }
        }

        self.write_output(&input).await?;
        ctx.report(100, None);
        Ok(StageOutput::default())
    }
}

/// Configuration rooted at `home` with timings suitable for tests.
pub fn test_config(home: &Path) -> AppConfig {
    let mut config = AppConfig::with_home(home);
    config.scheduler = config
        .scheduler
        .with_max_workers(2)
        .with_poll_interval_ms(10)
        .with_resource_retry_backoff_ms(10)
        .with_watchdog_grace_secs(1);
    config.scheduler.watchdog_interval_secs = 1;
    config
}

pub async fn start_app(config: AppConfig, registry: PipelineRegistry) -> App {
    let app = App::with_registry(config, registry).await.unwrap();
    app.scheduler.start().await.unwrap();
    app
}

/// Like [`start_app`], subscribing to arbiter events before any job runs.
pub async fn start_app_with_events(
    config: AppConfig,
    registry: PipelineRegistry,
) -> (App, broadcast::Receiver<ArbiterEvent>) {
    let app = App::with_registry(config, registry).await.unwrap();
    let events = app.arbiter.subscribe();
    app.scheduler.start().await.unwrap();
    (app, events)
}

/// Write a small input file and reference it.
pub fn write_input(dir: &Path, name: &str) -> MediaRef {
    let path = dir.join(name);
    std::fs::write(&path, name.as_bytes()).unwrap();
    MediaRef::infer(path).unwrap()
}

/// Poll the store until `done` holds for the job.
pub async fn wait_for(app: &App, id: &str, done: impl Fn(&Job) -> bool) -> Job {
    let poll = async {
        loop {
            let job = app.store.get(id).await.unwrap();
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(20), poll)
        .await
        .unwrap_or_else(|_| panic!("job {} did not reach the expected state", id))
}

pub async fn wait_terminal(app: &App, id: &str) -> Job {
    wait_for(app, id, |job| job.status.is_terminal()).await
}

pub async fn wait_count(counter: &AtomicUsize, expected: usize) {
    let poll = async {
        while counter.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(20), poll)
        .await
        .expect("stage was not invoked in time");
}

pub fn dir_is_empty_or_missing(path: &Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}
