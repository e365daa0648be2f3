//! specd - Spec Orchestrator Daemon
//!
//! Library components for the daemon process: storage, the two backend
//! clients, the chunk pipeline, the spec sequencer, the orchestrator, the
//! git workspace manager, and the service facade.

pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod pipeline;
pub mod reviewer;
pub mod sequencer;
pub mod service;
pub mod storage;
pub mod workspace;

use events::EventHub;
use executor::ExecutorClient;
use orchestrator::Orchestrator;
use pipeline::{ChunkPipeline, PipelineConfig};
use reviewer::ReviewerClient;
use sequencer::{SequencerConfig, SpecSequencer};
use service::SpecService;
use spec_core::{Config, SpecStatus};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::Storage;
use tracing::{info, warn};
use workspace::GitWorkspace;

/// Type alias for application-level errors with context.
pub type AppResult<T> = eyre::Result<T>;

/// Interval between orphan/stale worktree scans.
const SCAN_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Grace period for in-flight pipelines to unwind during shutdown.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// Optional explicit config file; defaults apply when absent.
    pub config_path: Option<PathBuf>,
    /// Override for the configured worker cap.
    pub max_concurrency: Option<usize>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            config_path: None,
            max_concurrency: None,
        }
    }
}

/// Get the default database path (~/.specwright/specd.db).
fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".specwright")
        .join("specd.db")
}

/// Daemon state.
#[derive(Debug)]
pub struct Daemon {
    config: Config,
    storage: Arc<Storage>,
    orchestrator: Arc<Orchestrator>,
    service: Arc<SpecService>,
    workspace: GitWorkspace,
}

impl Daemon {
    /// Assemble the daemon: storage, clients, pipeline, sequencer,
    /// orchestrator, and the service facade.
    pub async fn new(daemon_config: DaemonConfig) -> AppResult<Self> {
        let mut config = match &daemon_config.config_path {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(max) = daemon_config.max_concurrency {
            config.max_concurrency = max;
        }
        config.validate()?;

        let storage = Storage::new(&daemon_config.db_path).await?;
        storage.migrate_embedded().await?;
        let storage = Arc::new(storage);

        let executor = Arc::new(ExecutorClient::new(&config.executor.endpoint));
        let reviewer = Arc::new(ReviewerClient::new(&config.reviewer.cli_path));
        let workspace = GitWorkspace::new(&config.base_branch, config.worktrees);
        let hub = EventHub::new();

        let pipeline = Arc::new(ChunkPipeline::new(
            Arc::clone(&storage),
            Arc::clone(&executor),
            Arc::clone(&reviewer),
            workspace.clone(),
            PipelineConfig::from_config(&config),
        ));
        let sequencer = Arc::new(SpecSequencer::new(
            Arc::clone(&storage),
            Arc::clone(&pipeline),
            Arc::clone(&reviewer),
            workspace.clone(),
            SequencerConfig::from_config(&config),
        ));
        let orchestrator = Orchestrator::new(
            Arc::clone(&storage),
            Arc::clone(&sequencer),
            Arc::clone(&hub),
            config.max_concurrency,
        );
        let service = SpecService::new(
            Arc::clone(&storage),
            Arc::clone(&orchestrator),
            Arc::clone(&hub),
            Arc::clone(&pipeline),
            Arc::clone(&reviewer),
            workspace.clone(),
            config.clone(),
        );

        Ok(Self {
            config,
            storage,
            orchestrator,
            service,
            workspace,
        })
    }

    pub fn service(&self) -> &Arc<SpecService> {
        &self.service
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Run the daemon: boot recovery, queue dispatch, and the periodic
    /// worktree scan, until shutdown.
    pub async fn run(&self) -> AppResult<()> {
        info!("specd starting");
        info!("max concurrent workers: {}", self.config.max_concurrency);
        info!("executor endpoint: {}", self.config.executor.endpoint);

        // Reconcile interrupted workers and reload the persisted queue.
        self.orchestrator.start().await?;

        let mut scan_timer = tokio::time::interval(SCAN_INTERVAL);
        scan_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            scan_timer.tick().await;
            self.scan_worktrees().await;
        }
    }

    /// One orphan/stale sweep across all projects.
    ///
    /// Flagged worktrees are surfaced in the log; removal stays an explicit
    /// operator action through the workspace API.
    pub async fn scan_worktrees(&self) {
        let projects = match self.storage.list_projects().await {
            Ok(projects) => projects,
            Err(e) => {
                warn!(error = %e, "worktree scan could not list projects");
                return;
            }
        };

        for project in projects {
            let project_dir = Path::new(&project.path);
            let specs = match self.storage.list_specs(&project.id).await {
                Ok(specs) => specs,
                Err(e) => {
                    warn!(project_id = %project.id, error = %e, "worktree scan could not list specs");
                    continue;
                }
            };

            let live_ids: BTreeSet<String> =
                specs.iter().map(|s| s.id.to_string()).collect();
            for orphan in self.workspace.scan_orphans(project_dir, &live_ids) {
                warn!(
                    project_id = %project.id,
                    path = %orphan.path.display(),
                    "orphaned worktree (no matching spec)"
                );
            }

            let unmerged: BTreeSet<String> = specs
                .iter()
                .filter(|s| s.status != SpecStatus::Merged)
                .map(|s| s.id.to_string())
                .collect();
            for stale in self
                .workspace
                .scan_stale(project_dir, self.config.stale_worktree_days)
            {
                if unmerged.contains(&stale.spec_id) {
                    warn!(
                        project_id = %project.id,
                        path = %stale.path.display(),
                        age_days = stale.age_days,
                        "stale worktree (PR not merged)"
                    );
                }
            }
        }
    }

    /// Signal the daemon to shut down.
    pub async fn shutdown(&self) {
        info!("shutdown requested");
        self.orchestrator.stop().await;
        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}
