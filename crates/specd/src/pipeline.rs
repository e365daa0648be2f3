//! The per-chunk pipeline: execute → validate → review → commit.
//!
//! Runs a single chunk to a terminal outcome and guarantees cleanup of
//! transient side effects on every exit path: failures reset the worktree
//! to the pre-stage snapshot, cancellation additionally closes any open
//! tool calls and aborts the active backend. At most one pipeline runs per
//! chunk id at any instant, enforced by a per-chunk run lock.

use crate::events::Emitter;
use crate::executor::{ExecutorClient, ExecutorError, ExecutorEvent, PromptRequest};
use crate::reviewer::{ExecOptions, ReviewerClient, ReviewerError};
use crate::storage::{ChunkPatch, Storage, StorageError};
use crate::workspace::{GitError, GitWorkspace, Snapshot};
use chrono::Utc;
use spec_core::events::{
    ErrorPayload, EventPayload, GitCommitPayload, GitResetPayload, ReviewCompletePayload,
    ReviewStartPayload, TextPayload, ToolCallPayload, ValidationCompletePayload,
    ValidationStartPayload,
};
use spec_core::review::{parse_verdict, ReviewVerdict};
use spec_core::{
    prompt, Chunk, ChunkStatus, Config, GitState, Id, ReviewLog, ReviewStatus, Spec, ToolCall,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Backoff before the single transient-error retry in the execute stage.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Keywords that mark a chunk description as demanding code changes.
const CODE_CHANGE_KEYWORDS: [&str; 4] = ["create", "implement", "add", "fix"];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("pipeline already active for chunk {0}")]
    AlreadyRunning(Id),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Terminal outcome of one pipeline run.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Review passed; a commit was created (hash absent when git is disabled
    /// or the chunk legitimately changed nothing).
    Committed { commit_hash: Option<String> },
    /// Review requested changes; a fix chunk was created and linked.
    NeedsFix { fix_chunk: Chunk },
    Failed { reason: String },
    Cancelled,
}

/// Pipeline tuning derived from the project config.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub executor_model: String,
    pub execute_timeout: Duration,
    pub reviewer_model: String,
    pub review_timeout: Duration,
    pub auto_approve: bool,
    pub strict_no_change: bool,
    pub build_command: Option<String>,
    pub build_failure_fatal: bool,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            executor_model: config.executor.model.clone(),
            execute_timeout: Duration::from_secs(config.executor.timeout_sec),
            reviewer_model: config.reviewer.model.clone(),
            review_timeout: Duration::from_secs(config.reviewer.timeout_sec),
            auto_approve: config.reviewer.auto_approve,
            strict_no_change: config.strict_no_change,
            build_command: config.build_command.clone(),
            build_failure_fatal: config.build_failure_fatal,
        }
    }
}

/// Why a stage unwound instead of producing a value.
#[derive(Debug)]
enum StageError {
    Cancelled,
    Failed {
        kind: &'static str,
        message: String,
        remediation: Option<String>,
    },
}

impl StageError {
    fn failed(kind: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
            remediation: None,
        }
    }
}

type StageResult<T> = std::result::Result<T, StageError>;

/// Runs chunks through the four stages.
#[derive(Debug)]
pub struct ChunkPipeline {
    storage: Arc<Storage>,
    executor: Arc<ExecutorClient>,
    reviewer: Arc<ReviewerClient>,
    workspace: GitWorkspace,
    config: PipelineConfig,
    /// Chunk ids with an active pipeline run.
    locks: Mutex<HashSet<String>>,
}

struct RunLock<'a> {
    locks: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(&self.id);
        }
    }
}

impl ChunkPipeline {
    pub fn new(
        storage: Arc<Storage>,
        executor: Arc<ExecutorClient>,
        reviewer: Arc<ReviewerClient>,
        workspace: GitWorkspace,
        config: PipelineConfig,
    ) -> Self {
        Self {
            storage,
            executor,
            reviewer,
            workspace,
            config,
            locks: Mutex::new(HashSet::new()),
        }
    }

    fn acquire_lock(&self, chunk_id: &Id) -> Result<RunLock<'_>> {
        let mut locks = self.locks.lock().expect("pipeline lock poisoned");
        if !locks.insert(chunk_id.to_string()) {
            return Err(PipelineError::AlreadyRunning(chunk_id.clone()));
        }
        Ok(RunLock {
            locks: &self.locks,
            id: chunk_id.to_string(),
        })
    }

    /// Run one chunk end to end.
    pub async fn run(
        &self,
        spec: &Spec,
        chunk_id: &Id,
        state: &GitState,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Result<ChunkOutcome> {
        let _lock = self.acquire_lock(chunk_id)?;

        let chunk = self.storage.get_chunk(chunk_id).await?;
        self.storage
            .update_chunk(
                chunk_id,
                ChunkPatch {
                    status: Some(ChunkStatus::Running),
                    ..ChunkPatch::default()
                },
            )
            .await?;

        let snapshot = if state.enabled {
            Some(self.workspace.snapshot(state)?)
        } else {
            None
        };

        info!(chunk_id = %chunk_id, title = %chunk.title, "pipeline start");

        // --- Stage 1: execute ---
        let output = match self.execute_stage(spec, &chunk, state, emitter, cancel).await {
            Ok(output) => output,
            Err(e) => {
                return self
                    .unwind(chunk_id, state, snapshot.as_ref(), emitter, e)
                    .await
            }
        };
        self.storage
            .update_chunk(
                chunk_id,
                ChunkPatch {
                    output: Some(output.clone()),
                    ..ChunkPatch::default()
                },
            )
            .await?;

        // --- Stage 2: validate ---
        if let Err(e) = self.validate_stage(&chunk, state, emitter, cancel).await {
            return self
                .unwind(chunk_id, state, snapshot.as_ref(), emitter, e)
                .await;
        }

        // --- Stage 3: review ---
        let mut reviewed = chunk.clone();
        reviewed.output = Some(output.clone());
        let verdict = match self.review_stage(&reviewed, state, emitter, cancel).await {
            Ok(verdict) => verdict,
            Err(e) => {
                return self
                    .unwind(chunk_id, state, snapshot.as_ref(), emitter, e)
                    .await
            }
        };

        // --- Stage 4: commit ---
        match verdict.status {
            ReviewStatus::Pass | ReviewStatus::Skipped => {
                let commit = if state.enabled {
                    let message = prompt::commit_message(&chunk.title, &output);
                    match self.workspace.commit(state, &message) {
                        Ok(commit) => commit,
                        Err(e) => {
                            return self
                                .unwind(
                                    chunk_id,
                                    state,
                                    snapshot.as_ref(),
                                    emitter,
                                    StageError::failed("commit_failed", e.to_string()),
                                )
                                .await
                        }
                    }
                } else {
                    crate::workspace::CommitResult::default()
                };

                if let Some(hash) = &commit.hash {
                    emitter.emit(
                        Some(chunk_id),
                        EventPayload::GitCommit(GitCommitPayload {
                            chunk_id: chunk_id.clone(),
                            hash: hash.clone(),
                            files_changed: commit.files_changed,
                        }),
                    );
                }

                self.storage
                    .update_chunk(
                        chunk_id,
                        ChunkPatch {
                            status: Some(ChunkStatus::Completed),
                            review_status: Some(verdict.status),
                            review_feedback: Some(verdict.feedback),
                            commit_hash: commit.hash.clone(),
                            ..ChunkPatch::default()
                        },
                    )
                    .await?;

                info!(chunk_id = %chunk_id, commit = ?commit.hash, "chunk completed");
                Ok(ChunkOutcome::Committed {
                    commit_hash: commit.hash,
                })
            }
            ReviewStatus::NeedsFix => {
                let (title, description) = match &verdict.fix_chunk {
                    Some(fix) => (fix.title.clone(), fix.description.clone()),
                    None => (
                        format!("Fix: {}", chunk.title),
                        verdict.feedback.clone(),
                    ),
                };
                let fix_chunk = self
                    .storage
                    .insert_fix_chunk(chunk_id, &title, &description, None)
                    .await?;

                // No commit: the working tree keeps the chunk's changes so
                // the fix chunk builds on them.
                self.storage
                    .update_chunk(
                        chunk_id,
                        ChunkPatch {
                            status: Some(ChunkStatus::NeedsFix),
                            review_status: Some(ReviewStatus::NeedsFix),
                            review_feedback: Some(verdict.feedback),
                            ..ChunkPatch::default()
                        },
                    )
                    .await?;

                info!(chunk_id = %chunk_id, fix_chunk = %fix_chunk.id, "chunk needs fix");
                Ok(ChunkOutcome::NeedsFix { fix_chunk })
            }
            ReviewStatus::Fail | ReviewStatus::Error => {
                let reason = if verdict.feedback.is_empty() {
                    "review failed".to_string()
                } else {
                    verdict.feedback.clone()
                };
                self.unwind(
                    chunk_id,
                    state,
                    snapshot.as_ref(),
                    emitter,
                    StageError::failed("review_fail", reason),
                )
                .await
            }
        }
    }

    /// Drive the executor for one chunk, returning the assembled output.
    async fn execute_stage(
        &self,
        spec: &Spec,
        chunk: &Chunk,
        state: &GitState,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> StageResult<String> {
        let working_dir = state.working_dir.to_string_lossy().to_string();
        let chunk_prompt = prompt::build_chunk_prompt(spec, chunk);

        let mut last_error = String::new();
        for attempt in 0..2u32 {
            if attempt > 0 {
                debug!(chunk_id = %chunk.id, "retrying execute stage");
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            match self
                .execute_attempt(chunk, &working_dir, &chunk_prompt, emitter, cancel)
                .await
            {
                Ok(output) => return Ok(output),
                Err(StageError::Failed { kind, message, .. }) if kind == "backend_error" => {
                    warn!(chunk_id = %chunk.id, error = %message, "execute attempt failed");
                    last_error = message;
                }
                Err(other) => return Err(other),
            }
        }

        Err(StageError::failed("execute_failed", last_error))
    }

    async fn execute_attempt(
        &self,
        chunk: &Chunk,
        working_dir: &str,
        chunk_prompt: &str,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> StageResult<String> {
        let session_id = match self
            .executor
            .create_session(working_dir, &chunk.title)
            .await
        {
            Ok(id) => id,
            Err(ExecutorError::ConnectionFailed { addr }) => {
                return Err(StageError::Failed {
                    kind: "backend_not_found",
                    message: format!("executor not reachable at {addr}"),
                    remediation: Some("start the opencode server or fix executor.endpoint".into()),
                })
            }
            Err(e) => return Err(StageError::failed("backend_error", e.to_string())),
        };

        // Subscribe before prompting so no events are missed.
        let mut subscription = self.executor.subscribe(&session_id);

        let request = PromptRequest {
            text: chunk_prompt.to_string(),
            model: self.config.executor_model.clone(),
            system_prompt: None,
        };
        if let Err(e) = self
            .executor
            .send_prompt(&session_id, working_dir, &request)
            .await
        {
            let _ = self.executor.delete_session(&session_id).await;
            return Err(StageError::failed("backend_error", e.to_string()));
        }

        let deadline = tokio::time::Instant::now() + self.config.execute_timeout;
        let mut text_buffer = String::new();
        let mut seen_calls: HashSet<String> = HashSet::new();
        let mut idle = false;

        while !idle {
            tokio::select! {
                event = subscription.rx.recv() => match event {
                    Some(ExecutorEvent::ToolCall(update)) => {
                        self.record_tool_call(&chunk.id, &update, &mut seen_calls).await;
                        emitter.emit(
                            Some(&chunk.id),
                            EventPayload::ToolCall(ToolCallPayload {
                                chunk_id: chunk.id.clone(),
                                call_id: update.call_id,
                                name: update.name,
                                status: update.status,
                            }),
                        );
                    }
                    Some(ExecutorEvent::Text(text)) => {
                        text_buffer.push_str(&text);
                        emitter.emit(
                            Some(&chunk.id),
                            EventPayload::Text(TextPayload {
                                chunk_id: chunk.id.clone(),
                                text,
                            }),
                        );
                    }
                    Some(ExecutorEvent::Idle) => idle = true,
                    Some(ExecutorEvent::Status(crate::executor::SessionStatus::Error)) => {
                        let _ = self.executor.delete_session(&session_id).await;
                        return Err(StageError::failed("backend_error", "session errored"));
                    }
                    Some(ExecutorEvent::Status(_)) => {}
                    Some(ExecutorEvent::FileEdited(file)) => {
                        debug!(chunk_id = %chunk.id, file = %file, "file edited");
                    }
                    Some(ExecutorEvent::Connection(connected)) => {
                        debug!(chunk_id = %chunk.id, connected, "executor connection state");
                    }
                    None => {
                        return Err(StageError::failed("backend_error", "event stream closed"));
                    }
                },
                () = cancel.cancelled() => {
                    // Backend-specific abort, then unwind.
                    let _ = self.executor.abort_session(&session_id).await;
                    let _ = self.executor.delete_session(&session_id).await;
                    return Err(StageError::Cancelled);
                }
                () = tokio::time::sleep_until(deadline) => {
                    warn!(chunk_id = %chunk.id, "execute stage timed out");
                    let _ = self.executor.abort_session(&session_id).await;
                    let _ = self.executor.delete_session(&session_id).await;
                    return Err(StageError::failed(
                        "execute_timeout",
                        format!("execute stage exceeded {:?}", self.config.execute_timeout),
                    ));
                }
            }
        }

        // On idle, the message trail is authoritative for the final output;
        // fall back to the streamed text if the readback fails.
        let output = match self.executor.session_messages(&session_id).await {
            Ok(messages) => {
                let assembled = crate::executor::assemble_output(&messages);
                if assembled.is_empty() {
                    text_buffer
                } else {
                    assembled
                }
            }
            Err(e) => {
                debug!(chunk_id = %chunk.id, error = %e, "message readback failed");
                text_buffer
            }
        };

        let _ = self.executor.delete_session(&session_id).await;
        Ok(output)
    }

    /// Persist a tool-call stream update, inserting on first sight.
    async fn record_tool_call(
        &self,
        chunk_id: &Id,
        update: &crate::executor::ToolCallUpdate,
        seen: &mut HashSet<String>,
    ) {
        if seen.insert(update.call_id.clone()) {
            let now = Utc::now();
            let call = ToolCall {
                id: Id::new(),
                chunk_id: chunk_id.clone(),
                call_id: update.call_id.clone(),
                name: update.name.clone(),
                input: update.input.clone(),
                status: update.status,
                output: update.output.clone(),
                created_at: now,
                updated_at: now,
            };
            if let Err(e) = self.storage.insert_tool_call(&call).await {
                warn!(chunk_id = %chunk_id, error = %e, "failed to persist tool call");
            }
            return;
        }

        match self
            .storage
            .update_tool_call(chunk_id, &update.call_id, update.status, update.output.as_ref())
            .await
        {
            Ok(()) => {}
            Err(StorageError::InvariantViolation(msg)) => {
                // Backends occasionally replay terminal updates; drop them.
                debug!(chunk_id = %chunk_id, msg = %msg, "dropping stale tool call update");
            }
            Err(e) => warn!(chunk_id = %chunk_id, error = %e, "failed to update tool call"),
        }
    }

    /// Diff the working tree, apply the no-change heuristic, and run the
    /// optional build command.
    async fn validate_stage(
        &self,
        chunk: &Chunk,
        state: &GitState,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> StageResult<()> {
        if cancel.is_cancelled() {
            return Err(StageError::Cancelled);
        }

        emitter.emit(
            Some(&chunk.id),
            EventPayload::ValidationStart(ValidationStartPayload {
                chunk_id: chunk.id.clone(),
            }),
        );

        let changed = if state.enabled {
            self.workspace
                .changed_files(state)
                .map_err(|e| StageError::failed("validation_failed", e.to_string()))?
        } else {
            Vec::new()
        };

        let auto_failed = state.enabled
            && changed.is_empty()
            && (self.config.strict_no_change || demands_code_change(&chunk.description));

        let build_success = if auto_failed {
            None
        } else {
            match &self.config.build_command {
                Some(cmd) => Some(self.run_build(cmd, state, cancel).await?),
                None => None,
            }
        };

        emitter.emit(
            Some(&chunk.id),
            EventPayload::ValidationComplete(ValidationCompletePayload {
                chunk_id: chunk.id.clone(),
                files_changed: changed.len(),
                build_success,
                auto_failed,
            }),
        );

        if auto_failed {
            return Err(StageError::failed(
                "validation_failed",
                "no files changed but the chunk description demands code changes",
            ));
        }
        if build_success == Some(false) && self.config.build_failure_fatal {
            return Err(StageError::failed("validation_failed", "build command failed"));
        }
        Ok(())
    }

    async fn run_build(
        &self,
        cmd: &str,
        state: &GitState,
        cancel: &CancellationToken,
    ) -> StageResult<bool> {
        debug!(cmd = %cmd, "running build command");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&state.working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StageError::failed("validation_failed", e.to_string()))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| StageError::failed("validation_failed", e.to_string()))?;
                Ok(status.success())
            }
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(StageError::Cancelled)
            }
        }
    }

    /// Ask the reviewer for a verdict, persisting a review log.
    async fn review_stage(
        &self,
        chunk: &Chunk,
        state: &GitState,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> StageResult<ReviewVerdict> {
        if self.config.auto_approve {
            let verdict = ReviewVerdict {
                status: ReviewStatus::Skipped,
                feedback: String::new(),
                fix_chunk: None,
            };
            emitter.emit(
                Some(&chunk.id),
                EventPayload::ReviewComplete(ReviewCompletePayload {
                    chunk_id: chunk.id.clone(),
                    status: ReviewStatus::Skipped,
                    feedback: None,
                }),
            );
            return Ok(verdict);
        }

        emitter.emit(
            Some(&chunk.id),
            EventPayload::ReviewStart(ReviewStartPayload {
                chunk_id: chunk.id.clone(),
            }),
        );

        let review_prompt = prompt::build_review_prompt(chunk);
        let options = ExecOptions {
            model: self.config.reviewer_model.clone(),
            working_dir: state.working_dir.clone(),
            system_prompt: None,
            timeout: self.config.review_timeout,
        };

        let start = std::time::Instant::now();
        let result = self
            .reviewer
            .execute_with_cancel(&review_prompt, &options, cancel)
            .await;

        let verdict = match result {
            Ok(exec) => match parse_verdict(&exec.output) {
                Ok(verdict) => verdict,
                Err(e) => {
                    // Unparseable response: record an errored review and
                    // treat the chunk as needs-fix with synthetic feedback.
                    warn!(chunk_id = %chunk.id, error = %e, "review verdict unparseable");
                    self.log_review(chunk, ReviewStatus::Error, &e.to_string(), start)
                        .await;
                    let verdict = ReviewVerdict {
                        status: ReviewStatus::NeedsFix,
                        feedback: format!(
                            "reviewer response could not be parsed ({e}); re-run this task and \
                             address any issues it raised"
                        ),
                        fix_chunk: None,
                    };
                    emitter.emit(
                        Some(&chunk.id),
                        EventPayload::ReviewComplete(ReviewCompletePayload {
                            chunk_id: chunk.id.clone(),
                            status: ReviewStatus::Error,
                            feedback: Some(verdict.feedback.clone()),
                        }),
                    );
                    return Ok(verdict);
                }
            },
            Err(ReviewerError::NotFound { path }) => {
                return Err(StageError::Failed {
                    kind: "backend_not_found",
                    message: format!("reviewer CLI not found at '{path}'"),
                    remediation: Some("install the reviewer CLI or fix reviewer.cli_path".into()),
                })
            }
            Err(ReviewerError::Timeout(t)) => {
                return Err(StageError::failed(
                    "review_timeout",
                    format!("review stage exceeded {t:?}"),
                ))
            }
            Err(ReviewerError::Cancelled) => return Err(StageError::Cancelled),
            Err(e) => return Err(StageError::failed("review_failed", e.to_string())),
        };

        self.log_review(chunk, verdict.status, &verdict.feedback, start)
            .await;
        emitter.emit(
            Some(&chunk.id),
            EventPayload::ReviewComplete(ReviewCompletePayload {
                chunk_id: chunk.id.clone(),
                status: verdict.status,
                feedback: (!verdict.feedback.is_empty()).then(|| verdict.feedback.clone()),
            }),
        );
        Ok(verdict)
    }

    async fn log_review(
        &self,
        chunk: &Chunk,
        status: ReviewStatus,
        feedback: &str,
        start: std::time::Instant,
    ) {
        let log = ReviewLog {
            id: Id::new(),
            chunk_id: chunk.id.clone(),
            status,
            feedback: (!feedback.is_empty()).then(|| feedback.to_string()),
            model: self.config.reviewer_model.clone(),
            duration_ms: start.elapsed().as_millis() as i64,
            created_at: Utc::now(),
        };
        if let Err(e) = self.storage.insert_review_log(&log).await {
            warn!(chunk_id = %chunk.id, error = %e, "failed to persist review log");
        }
    }

    /// Unwind a failed or cancelled run: reset the worktree, close open tool
    /// calls, finalise the chunk row, emit the error event.
    async fn unwind(
        &self,
        chunk_id: &Id,
        state: &GitState,
        snapshot: Option<&Snapshot>,
        emitter: &Emitter,
        error: StageError,
    ) -> Result<ChunkOutcome> {
        if let Some(snapshot) = snapshot {
            match self.workspace.reset(state, snapshot) {
                Ok(()) => emitter.emit(
                    Some(chunk_id),
                    EventPayload::GitReset(GitResetPayload {
                        chunk_id: chunk_id.clone(),
                        head: snapshot.head.clone(),
                    }),
                ),
                Err(e) => warn!(chunk_id = %chunk_id, error = %e, "worktree reset failed"),
            }
        }

        match error {
            StageError::Cancelled => {
                self.storage.close_open_tool_calls(chunk_id).await?;
                self.storage
                    .update_chunk(
                        chunk_id,
                        ChunkPatch {
                            status: Some(ChunkStatus::Failed),
                            error: Some("cancelled".to_string()),
                            ..ChunkPatch::default()
                        },
                    )
                    .await?;
                info!(chunk_id = %chunk_id, "pipeline cancelled");
                Ok(ChunkOutcome::Cancelled)
            }
            StageError::Failed {
                kind,
                message,
                remediation,
            } => {
                emitter.emit(
                    Some(chunk_id),
                    EventPayload::Error(ErrorPayload {
                        kind: kind.to_string(),
                        message: message.clone(),
                        remediation,
                    }),
                );
                self.storage
                    .update_chunk(
                        chunk_id,
                        ChunkPatch {
                            status: Some(ChunkStatus::Failed),
                            error: Some(message.clone()),
                            ..ChunkPatch::default()
                        },
                    )
                    .await?;
                warn!(chunk_id = %chunk_id, kind, error = %message, "pipeline failed");
                Ok(ChunkOutcome::Failed { reason: message })
            }
        }
    }
}

/// Heuristic: does the description demand code changes?
fn demands_code_change(description: &str) -> bool {
    let lower = description.to_lowercase();
    CODE_CHANGE_KEYWORDS
        .iter()
        .any(|keyword| lower.split(|c: char| !c.is_alphanumeric()).any(|w| w == *keyword))
}
