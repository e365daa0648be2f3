//! Service facade consumed by the HTTP layer.
//!
//! Thin, typed boundary over the orchestrator, pipeline, and event hub. All
//! operations are idempotent with respect to terminal states: aborting a
//! finished spec or chunk is a no-op success.

use crate::events::{EventHub, Subscription};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::pipeline::ChunkPipeline;
use crate::reviewer::{ExecOptions, ReviewerClient, ReviewerError};
use crate::storage::{Storage, StorageError};
use crate::workspace::GitWorkspace;
use chrono::Utc;
use spec_core::review::parse_verdict;
use spec_core::{
    prompt, Chunk, ChunkStatus, Config, Id, QueueItem, ReviewLog, ReviewStatus, WorkerStats,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("reviewer error: {0}")]
    Reviewer(#[from] ReviewerError),
    #[error("{0}")]
    Orchestrator(#[from] OrchestratorError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Response to a start request.
#[derive(Debug, Clone)]
pub struct StartResponse {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl StartResponse {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Result of an on-demand chunk review.
#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub status: ReviewStatus,
    pub feedback: String,
}

/// Facade over the core, exposed to the HTTP layer.
#[derive(Debug)]
pub struct SpecService {
    storage: Arc<Storage>,
    orchestrator: Arc<Orchestrator>,
    hub: Arc<EventHub>,
    pipeline: Arc<ChunkPipeline>,
    reviewer: Arc<ReviewerClient>,
    workspace: GitWorkspace,
    config: Config,
    /// Cancellation tokens for out-of-band single-chunk runs.
    chunk_runs: Mutex<HashMap<String, CancellationToken>>,
}

impl SpecService {
    pub fn new(
        storage: Arc<Storage>,
        orchestrator: Arc<Orchestrator>,
        hub: Arc<EventHub>,
        pipeline: Arc<ChunkPipeline>,
        reviewer: Arc<ReviewerClient>,
        workspace: GitWorkspace,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            orchestrator,
            hub,
            pipeline,
            reviewer,
            workspace,
            config,
            chunk_runs: Mutex::new(HashMap::new()),
        })
    }

    /// Start a spec directly, bypassing the queue.
    pub async fn start_spec(&self, spec_id: &Id) -> Result<StartResponse> {
        match self.orchestrator.start_worker(spec_id).await {
            Ok(()) => Ok(StartResponse::accepted()),
            Err(OrchestratorError::AtCapacity(_)) => Ok(StartResponse::rejected("capacity")),
            Err(OrchestratorError::AlreadyRunning(_)) => {
                Ok(StartResponse::rejected("already running"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Enqueue a spec for execution when capacity frees up.
    pub async fn queue_spec(&self, spec_id: &Id, priority: i64) -> Result<QueueItem> {
        Ok(self.orchestrator.enqueue(spec_id, priority).await?)
    }

    /// Abort a running or queued spec. No-op for terminal specs.
    pub async fn abort_spec(&self, spec_id: &Id) -> Result<()> {
        self.orchestrator.abort_spec(spec_id).await?;
        Ok(())
    }

    /// Run a single chunk out of band.
    ///
    /// Rejected while the owning spec has a live worker (the per-spec
    /// serialisation invariant) or the chunk is already running. The run
    /// holds the init/cleanup pairing for its single-chunk scope.
    pub async fn start_chunk(self: &Arc<Self>, chunk_id: &Id) -> Result<StartResponse> {
        let chunk = self.storage.get_chunk(chunk_id).await?;
        if chunk.status == ChunkStatus::Running {
            return Ok(StartResponse::rejected("chunk already running"));
        }
        let spec = self.storage.get_spec(&chunk.spec_id).await?;
        if spec.status.is_terminal() {
            return Ok(StartResponse::rejected("spec is merged"));
        }
        if self.orchestrator.is_running(&spec.id).await {
            return Ok(StartResponse::rejected("spec has a live worker"));
        }
        let project = self.storage.get_project(&spec.project_id).await?;

        let cancel = {
            let mut runs = self.chunk_runs.lock().expect("chunk runs lock poisoned");
            if runs.contains_key(chunk_id.as_ref()) {
                return Ok(StartResponse::rejected("chunk already running"));
            }
            let token = CancellationToken::new();
            runs.insert(chunk_id.to_string(), token.clone());
            token
        };

        let service = Arc::clone(self);
        let chunk_id = chunk_id.clone();
        tokio::spawn(async move {
            let project_dir = std::path::PathBuf::from(&project.path);
            let emitter = service.hub.emitter(&spec.id);

            match service.workspace.init(&spec, &project_dir) {
                Ok(state) => {
                    if let Err(e) = service
                        .pipeline
                        .run(&spec, &chunk_id, &state, &emitter, &cancel)
                        .await
                    {
                        warn!(chunk_id = %chunk_id, error = %e, "single-chunk run failed");
                    }
                    let commits = service
                        .storage
                        .get_chunks_by_spec(&spec.id)
                        .await
                        .map(|chunks| chunks.iter().filter(|c| c.commit_hash.is_some()).count())
                        .unwrap_or(0);
                    service.workspace.cleanup(&project_dir, &state, commits);
                }
                Err(e) => {
                    warn!(chunk_id = %chunk_id, error = %e, "workspace init failed");
                }
            }

            service
                .chunk_runs
                .lock()
                .expect("chunk runs lock poisoned")
                .remove(chunk_id.as_ref());
        });

        Ok(StartResponse::accepted())
    }

    /// Cancel an out-of-band chunk run. No-op when none is active.
    pub fn abort_chunk(&self, chunk_id: &Id) {
        let runs = self.chunk_runs.lock().expect("chunk runs lock poisoned");
        if let Some(token) = runs.get(chunk_id.as_ref()) {
            info!(chunk_id = %chunk_id, "aborting chunk run");
            token.cancel();
        }
    }

    /// Run the reviewer over a chunk's captured output on demand.
    pub async fn review_chunk(&self, chunk_id: &Id) -> Result<ReviewResult> {
        let chunk = self.storage.get_chunk(chunk_id).await?;
        let spec = self.storage.get_spec(&chunk.spec_id).await?;
        let project = self.storage.get_project(&spec.project_id).await?;

        let review_prompt = prompt::build_review_prompt(&chunk);
        let options = ExecOptions {
            model: self.config.reviewer.model.clone(),
            working_dir: std::path::PathBuf::from(&project.path),
            system_prompt: None,
            timeout: Duration::from_secs(self.config.reviewer.timeout_sec),
        };

        let start = std::time::Instant::now();
        let result = self.reviewer.execute(&review_prompt, &options).await?;

        let (status, feedback) = match parse_verdict(&result.output) {
            Ok(verdict) => (verdict.status, verdict.feedback),
            Err(e) => (ReviewStatus::Error, e.to_string()),
        };

        let log = ReviewLog {
            id: Id::new(),
            chunk_id: chunk_id.clone(),
            status,
            feedback: (!feedback.is_empty()).then(|| feedback.clone()),
            model: self.config.reviewer.model.clone(),
            duration_ms: start.elapsed().as_millis() as i64,
            created_at: Utc::now(),
        };
        self.storage.insert_review_log(&log).await?;

        Ok(ReviewResult { status, feedback })
    }

    /// Subscribe to a spec's event stream; the handle unsubscribes on drop.
    pub fn subscribe_spec(&self, spec_id: &Id) -> Subscription {
        self.hub.subscribe(spec_id)
    }

    pub async fn worker_stats(&self) -> WorkerStats {
        self.orchestrator.worker_stats().await
    }

    /// Tool calls recorded for a chunk, in insertion order.
    pub async fn tool_calls(&self, chunk_id: &Id) -> Result<Vec<spec_core::ToolCall>> {
        Ok(self.storage.get_tool_calls_by_chunk(chunk_id).await?)
    }

    /// Chunks of a spec in ordinal order.
    pub async fn chunks(&self, spec_id: &Id) -> Result<Vec<Chunk>> {
        Ok(self.storage.get_chunks_by_spec(spec_id).await?)
    }
}
