//! Orchestrator wiring: stores, dispatcher, recovery, projector, stream gateway.

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use studyforge_ai::TemplateGenerator;
use studyforge_infra::OrchestratorConfig;
use studyforge_infra::jobs::{
    BuildDispatcher, BuildJobStore, BuildJobs, Collaborators, InMemoryBuildJobStore,
    PostgresBuildJobStore, RecoveryService, RecoverySweeper,
};
use studyforge_infra::program::{InMemoryProgramStore, PostgresProgramStore, ProgramStore};
use studyforge_infra::projections::BuildViewProjector;
use studyforge_infra::stream::StreamGateway;

use crate::config::ApiConfig;

/// Which backing stores the services run on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    InMemory,
    Postgres,
}

/// Everything the handlers need, shared behind an `Arc`.
#[derive(Clone)]
pub struct AppServices {
    pub backend: StoreBackend,
    pub jobs: BuildJobs,
    pub dispatcher: BuildDispatcher,
    pub recovery: RecoveryService,
    pub projector: BuildViewProjector,
    pub gateway: StreamGateway,
    pub config: OrchestratorConfig,
    /// Stops background tasks (the recovery sweeper).
    pub shutdown: CancellationToken,
}

impl AppServices {
    pub fn new(
        backend: StoreBackend,
        job_store: Arc<dyn BuildJobStore>,
        program_store: Arc<dyn ProgramStore>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        let jobs = BuildJobs::new(job_store.clone(), &config);
        let dispatcher = BuildDispatcher::new(
            job_store.clone(),
            program_store.clone(),
            collaborators,
            config.clone(),
        );
        let recovery =
            RecoveryService::new(jobs.clone(), &config).with_dispatcher(dispatcher.clone());
        let projector = BuildViewProjector::new(job_store, program_store);
        let gateway = StreamGateway::new(jobs.clone(), projector.clone(), &config)
            .with_dispatcher(dispatcher.clone());

        Self {
            backend,
            jobs,
            dispatcher,
            recovery,
            projector,
            gateway,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// In-memory stores and the template generator (dev/test).
    pub fn in_memory(config: OrchestratorConfig) -> Self {
        Self::in_memory_with(
            Collaborators::from_generator(Arc::new(TemplateGenerator::new())),
            config,
        )
    }

    pub fn in_memory_with(collaborators: Collaborators, config: OrchestratorConfig) -> Self {
        let job_store: Arc<dyn BuildJobStore> = InMemoryBuildJobStore::arc();
        let program_store: Arc<dyn ProgramStore> = InMemoryProgramStore::arc();
        Self::new(
            StoreBackend::InMemory,
            job_store,
            program_store,
            collaborators,
            config,
        )
    }

    /// Postgres-backed stores. Creates the tables when missing.
    pub async fn persistent(
        database_url: &str,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .context("failed to connect to Postgres")?;

        let job_store = PostgresBuildJobStore::new(pool.clone());
        job_store
            .ensure_schema()
            .await
            .context("failed to create build job tables")?;

        let program_store = PostgresProgramStore::new(pool);
        program_store
            .ensure_schema()
            .await
            .context("failed to create program table")?;

        Ok(Self::new(
            StoreBackend::Postgres,
            Arc::new(job_store),
            Arc::new(program_store),
            collaborators,
            config,
        ))
    }

    /// Start the periodic stale-job sweep when an interval is configured.
    pub fn spawn_recovery_sweeper(&self) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.config.recovery_sweep_interval?;
        tracing::info!(interval_secs = interval.as_secs(), "recovery sweeper enabled");
        Some(RecoverySweeper::new(self.recovery.clone(), interval).spawn(self.shutdown.clone()))
    }
}

pub async fn build_services(config: &ApiConfig) -> anyhow::Result<AppServices> {
    let collaborators = Collaborators::from_generator(Arc::new(TemplateGenerator::new()));

    let services = match (config.use_persistent_stores, config.database_url.as_deref()) {
        (true, Some(url)) => {
            AppServices::persistent(url, collaborators, config.orchestrator.clone()).await?
        }
        (true, None) => {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but DATABASE_URL is not set, falling back to in-memory"
            );
            AppServices::in_memory_with(collaborators, config.orchestrator.clone())
        }
        (false, _) => AppServices::in_memory_with(collaborators, config.orchestrator.clone()),
    };

    tracing::info!(backend = ?services.backend, "services ready");
    services.spawn_recovery_sweeper();
    Ok(services)
}
