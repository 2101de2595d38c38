//! Component wiring shared by the CLI and the tests.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::artifact::ArtifactManager;
use crate::config::AppConfig;
use crate::database::repositories::SqlxJobRepository;
use crate::database::{self, DbPool};
use crate::device::DeviceArbiter;
use crate::pipeline::{ArtifactPurgeService, PipelineCatalog, PipelineRegistry, Scheduler};
use crate::service::JobService;
use crate::store::JobStore;

/// Every long-lived component, built once at startup.
pub struct App {
    pub config: AppConfig,
    pub pool: DbPool,
    pub store: Arc<JobStore>,
    pub registry: Arc<PipelineRegistry>,
    pub arbiter: DeviceArbiter,
    pub artifacts: Arc<ArtifactManager>,
    pub scheduler: Arc<Scheduler>,
    pub service: Arc<JobService>,
}

impl App {
    /// Build the app with the configured pipeline catalog.
    pub async fn init(config: AppConfig) -> Result<Self> {
        let mut catalog =
            PipelineCatalog::load_or_builtin(config.pipelines.catalog_path.as_deref()).await?;
        if let Some(program) = &config.pipelines.runner_program {
            catalog = catalog.with_program(program);
        }
        let registry = catalog.into_registry()?;
        Self::with_registry(config, registry).await
    }

    /// Build the app around an already validated registry.
    pub async fn with_registry(config: AppConfig, registry: PipelineRegistry) -> Result<Self> {
        config.ensure_dirs()?;

        let pool = database::init_pool(&config.database_url).await?;
        database::run_migrations(&pool).await?;

        let store = Arc::new(JobStore::new(Arc::new(SqlxJobRepository::new(pool.clone()))));
        let registry = Arc::new(registry);
        let arbiter = DeviceArbiter::new();
        let artifacts = Arc::new(ArtifactManager::new(
            config.paths.jobs_dir(),
            config.paths.content_dir(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler.clone(),
            store.clone(),
            registry.clone(),
            arbiter.clone(),
            artifacts.clone(),
        ));
        let service = Arc::new(
            JobService::new(store.clone(), registry.clone(), artifacts.clone())
                .with_scheduler(scheduler.clone()),
        );

        info!(
            home = %config.home().display(),
            pipelines = registry.len(),
            "media-forge initialized"
        );

        Ok(Self {
            config,
            pool,
            store,
            registry,
            arbiter,
            artifacts,
            scheduler,
            service,
        })
    }

    /// Run the scheduler and the artifact sweeper until `shutdown` fires.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<()> {
        self.scheduler.start().await?;
        for (status, count) in self.store.counts().await? {
            info!(status = %status, count, "Jobs in store");
        }

        let purge = Arc::new(ArtifactPurgeService::new(
            self.config.purge.clone(),
            self.store.clone(),
            self.artifacts.clone(),
        ));
        let purge_task = purge.start_background_task(shutdown.clone());

        shutdown.cancelled().await;

        self.scheduler.stop().await;
        let _ = purge_task.await;
        self.pool.close().await;
        Ok(())
    }
}
