//! The spec-level sequencer.
//!
//! Drives all chunks of one spec to terminal states: dependency-aware
//! selection, fix-chunk lineage with an iteration limit, fail-fast policy,
//! and the git surround (init before the first chunk, push + PR when at
//! least one chunk committed, cleanup on every exit path). Chunk state is
//! re-read from storage before each selection pass, so edits made while the
//! spec runs land between pipelines, never mid-pipeline.

use crate::events::Emitter;
use crate::pipeline::{ChunkOutcome, ChunkPipeline};
use crate::reviewer::{ExecOptions, ReviewerClient};
use crate::storage::{ChunkPatch, Storage};
use crate::workspace::{diff_range, GitWorkspace};
use spec_core::events::{
    ChunkCompletePayload, ChunkSkippedPayload, ChunkStartPayload, DependencyBlockedPayload,
    ErrorPayload, EventPayload, FinalReviewCompletePayload, FinalReviewFixChunksPayload,
    FinalReviewStartPayload, GitPushPayload, GitWorkflowInitPayload, PrCreatedPayload,
    SpecAbortedPayload, SpecCompletePayload, SpecStartPayload, SpecStats,
};
use spec_core::review::parse_verdict;
use spec_core::{
    prompt, Chunk, ChunkStatus, Config, GitState, Id, ReviewStatus, Spec, SpecStatus,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Sequencer policy derived from the project config.
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub max_iterations: u32,
    pub fail_fast: bool,
    pub final_review: bool,
    pub final_review_passes: u32,
    pub base_branch: String,
    pub reviewer_model: String,
    pub review_timeout: Duration,
}

impl SequencerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_iterations: config.max_iterations,
            fail_fast: config.fail_fast,
            final_review: config.final_review,
            final_review_passes: config.final_review_passes,
            base_branch: config.base_branch.clone(),
            reviewer_model: config.reviewer.model.clone(),
            review_timeout: Duration::from_secs(config.reviewer.timeout_sec),
        }
    }
}

/// How a spec run ended.
#[derive(Debug, Clone)]
pub enum SpecRunOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// How the chunk loop exited.
enum LoopEnd {
    /// No pending chunks remain (some may have failed or blocked).
    Drained,
    Aborted,
}

/// Drives one spec's chunks to terminal states.
#[derive(Debug)]
pub struct SpecSequencer {
    storage: Arc<Storage>,
    pipeline: Arc<ChunkPipeline>,
    reviewer: Arc<ReviewerClient>,
    workspace: GitWorkspace,
    config: SequencerConfig,
}

impl SpecSequencer {
    pub fn new(
        storage: Arc<Storage>,
        pipeline: Arc<ChunkPipeline>,
        reviewer: Arc<ReviewerClient>,
        workspace: GitWorkspace,
        config: SequencerConfig,
    ) -> Self {
        Self {
            storage,
            pipeline,
            reviewer,
            workspace,
            config,
        }
    }

    /// Run a spec to a terminal state. Never panics; internal errors become
    /// a `Failed` outcome the orchestrator records on the worker.
    pub async fn run(
        &self,
        spec_id: &Id,
        worker_id: Option<&Id>,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> SpecRunOutcome {
        let started = std::time::Instant::now();

        let spec = match self.storage.get_spec(spec_id).await {
            Ok(spec) => spec,
            Err(e) => return SpecRunOutcome::Failed(e.to_string()),
        };
        if spec.status.is_terminal() {
            return SpecRunOutcome::Failed(format!(
                "spec {spec_id} is {} and cannot be re-run",
                spec.status.as_str()
            ));
        }
        let project = match self.storage.get_project(&spec.project_id).await {
            Ok(project) => project,
            Err(e) => return SpecRunOutcome::Failed(e.to_string()),
        };
        if let Err(e) = self
            .storage
            .update_spec_status(spec_id, SpecStatus::Running, None)
            .await
        {
            return SpecRunOutcome::Failed(e.to_string());
        }

        let project_dir = std::path::PathBuf::from(&project.path);
        let state = match self.workspace.init(&spec, &project_dir) {
            Ok(state) => state,
            Err(e) => {
                let reason = format!("git init failed: {e}");
                let _ = self
                    .storage
                    .update_spec_status(spec_id, SpecStatus::Failed, Some(&reason))
                    .await;
                return SpecRunOutcome::Failed(reason);
            }
        };

        // Init is paired with cleanup on every exit path from here on.
        let outcome = self
            .run_inner(&spec, &state, worker_id, emitter, cancel, started)
            .await;

        let commits = self
            .storage
            .get_chunks_by_spec(spec_id)
            .await
            .map(|chunks| chunks.iter().filter(|c| c.commit_hash.is_some()).count())
            .unwrap_or(0);
        self.workspace.cleanup(&project_dir, &state, commits);

        outcome
    }

    async fn run_inner(
        &self,
        spec: &Spec,
        state: &GitState,
        worker_id: Option<&Id>,
        emitter: &Emitter,
        cancel: &CancellationToken,
        started: std::time::Instant,
    ) -> SpecRunOutcome {
        if state.enabled {
            if let Some(branch) = state.branch.as_deref() {
                if let Err(e) = self.storage.set_spec_branch(&spec.id, branch).await {
                    warn!(spec_id = %spec.id, error = %e, "failed to record spec branch");
                }
            }
        }
        emitter.emit(
            None,
            EventPayload::GitWorkflowInit(GitWorkflowInitPayload {
                spec_id: spec.id.clone(),
                branch: state.branch.clone(),
                worktree: state.worktree,
                working_dir: state.working_dir.to_string_lossy().to_string(),
            }),
        );

        let total_chunks = match self.storage.get_chunks_by_spec(&spec.id).await {
            Ok(chunks) => chunks.len(),
            Err(e) => return self.finalise_failed(spec, emitter, e.to_string()).await,
        };
        emitter.emit(
            None,
            EventPayload::SpecStart(SpecStartPayload {
                spec_id: spec.id.clone(),
                total_chunks,
            }),
        );
        info!(spec_id = %spec.id, total_chunks, "spec run started");

        // Main chunk loop, re-entered after final-review fix chunks.
        let mut final_pass = 0u32;
        let end = loop {
            let end = match self.chunk_loop(spec, state, worker_id, emitter, cancel).await {
                Ok(end) => end,
                Err(reason) => return self.finalise_failed(spec, emitter, reason).await,
            };
            if matches!(end, LoopEnd::Aborted) {
                break end;
            }

            if !self.config.final_review || final_pass >= self.config.final_review_passes {
                break end;
            }
            match self.final_review_pass(spec, state, emitter, final_pass + 1).await {
                Ok(true) => {
                    final_pass += 1;
                    // Fix chunks were spawned; run the loop again.
                }
                Ok(false) => break end,
                Err(reason) => return self.finalise_failed(spec, emitter, reason).await,
            }
        };

        if matches!(end, LoopEnd::Aborted) {
            return self.finalise_aborted(spec, emitter).await;
        }

        self.finalise(spec, state, emitter, started).await
    }

    /// Run ready chunks until none are pending or the run aborts.
    async fn chunk_loop(
        &self,
        spec: &Spec,
        state: &GitState,
        worker_id: Option<&Id>,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> std::result::Result<LoopEnd, String> {
        loop {
            if cancel.is_cancelled() {
                return Ok(LoopEnd::Aborted);
            }

            // Snapshot-per-iteration: edits land between pipelines.
            let chunks = self
                .storage
                .get_chunks_by_spec(&spec.id)
                .await
                .map_err(|e| e.to_string())?;
            let by_id: HashMap<&str, &Chunk> =
                chunks.iter().map(|c| (c.id.as_ref(), c)).collect();

            let pending: Vec<&Chunk> = chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Pending)
                .collect();
            if pending.is_empty() {
                return Ok(LoopEnd::Drained);
            }

            let ready: Vec<&Chunk> = pending
                .iter()
                .copied()
                .filter(|c| {
                    c.depends_on
                        .iter()
                        .all(|dep| dependency_satisfied(dep, &by_id))
                })
                .collect();

            if ready.is_empty() {
                // Every remaining chunk waits on a predecessor that will
                // never commit.
                for chunk in &pending {
                    let blocked_on = chunk
                        .depends_on
                        .iter()
                        .find(|dep| !dependency_satisfied(dep, &by_id))
                        .cloned()
                        .unwrap_or_else(|| chunk.id.clone());
                    emitter.emit(
                        Some(&chunk.id),
                        EventPayload::DependencyBlocked(DependencyBlockedPayload {
                            chunk_id: chunk.id.clone(),
                            blocked_on,
                        }),
                    );
                    self.storage
                        .update_chunk(
                            &chunk.id,
                            ChunkPatch {
                                status: Some(ChunkStatus::Failed),
                                error: Some("dependency blocked".to_string()),
                                ..ChunkPatch::default()
                            },
                        )
                        .await
                        .map_err(|e| e.to_string())?;
                }
                return Ok(LoopEnd::Drained);
            }

            // Lowest ordinal first, id ascending as the tiebreak; the query
            // already orders that way, so the first ready chunk wins.
            let next = ready[0];
            let root = lineage_root(next, &by_id);

            if let Some(worker_id) = worker_id {
                let _ = self
                    .storage
                    .update_worker(
                        worker_id,
                        spec_core::WorkerStatus::Running,
                        Some(&next.id),
                        None,
                    )
                    .await;
            }

            emitter.emit(
                Some(&next.id),
                EventPayload::ChunkStart(ChunkStartPayload {
                    chunk_id: next.id.clone(),
                    title: next.title.clone(),
                    attempt: root.attempts + 1,
                }),
            );

            let outcome = self
                .pipeline
                .run(spec, &next.id, state, emitter, cancel)
                .await
                .map_err(|e| e.to_string())?;

            match outcome {
                ChunkOutcome::Committed { commit_hash } => {
                    emitter.emit(
                        Some(&next.id),
                        EventPayload::ChunkComplete(ChunkCompletePayload {
                            chunk_id: next.id.clone(),
                            status: ChunkStatus::Completed,
                            commit_hash,
                        }),
                    );
                }
                ChunkOutcome::NeedsFix { fix_chunk } => {
                    emitter.emit(
                        Some(&next.id),
                        EventPayload::ChunkComplete(ChunkCompletePayload {
                            chunk_id: next.id.clone(),
                            status: ChunkStatus::NeedsFix,
                            commit_hash: None,
                        }),
                    );

                    // Attempts are tracked on the lineage root so a chain of
                    // fix chunks shares one budget.
                    let attempts = root.attempts + 1;
                    let root_id = root.id.clone();
                    self.storage
                        .update_chunk(
                            &root_id,
                            ChunkPatch {
                                attempts: Some(attempts),
                                ..ChunkPatch::default()
                            },
                        )
                        .await
                        .map_err(|e| e.to_string())?;

                    if attempts >= i64::from(self.config.max_iterations) {
                        warn!(
                            spec_id = %spec.id,
                            chunk_id = %root_id,
                            attempts,
                            "iteration limit reached; escalating lineage to failed"
                        );
                        self.storage
                            .update_chunk(
                                &root_id,
                                ChunkPatch {
                                    status: Some(ChunkStatus::Failed),
                                    error: Some(format!(
                                        "exceeded {} fix iterations",
                                        self.config.max_iterations
                                    )),
                                    ..ChunkPatch::default()
                                },
                            )
                            .await
                            .map_err(|e| e.to_string())?;
                        self.storage
                            .update_chunk(
                                &fix_chunk.id,
                                ChunkPatch {
                                    status: Some(ChunkStatus::Skipped),
                                    error: Some("iteration limit reached".to_string()),
                                    ..ChunkPatch::default()
                                },
                            )
                            .await
                            .map_err(|e| e.to_string())?;
                        emitter.emit(
                            Some(&fix_chunk.id),
                            EventPayload::ChunkSkipped(ChunkSkippedPayload {
                                chunk_id: fix_chunk.id.clone(),
                                reason: "iteration limit reached".to_string(),
                            }),
                        );
                    }
                }
                ChunkOutcome::Failed { .. } => {
                    emitter.emit(
                        Some(&next.id),
                        EventPayload::ChunkComplete(ChunkCompletePayload {
                            chunk_id: next.id.clone(),
                            status: ChunkStatus::Failed,
                            commit_hash: None,
                        }),
                    );

                    if self.config.fail_fast {
                        for chunk in pending.iter().filter(|c| c.id != next.id) {
                            self.storage
                                .update_chunk(
                                    &chunk.id,
                                    ChunkPatch {
                                        status: Some(ChunkStatus::Skipped),
                                        error: Some("fail-fast abort".to_string()),
                                        ..ChunkPatch::default()
                                    },
                                )
                                .await
                                .map_err(|e| e.to_string())?;
                            emitter.emit(
                                Some(&chunk.id),
                                EventPayload::ChunkSkipped(ChunkSkippedPayload {
                                    chunk_id: chunk.id.clone(),
                                    reason: "fail-fast abort".to_string(),
                                }),
                            );
                        }
                        return Ok(LoopEnd::Drained);
                    }
                    // Default policy: independent chunks keep running;
                    // dependents block on the next pass.
                }
                ChunkOutcome::Cancelled => return Ok(LoopEnd::Aborted),
            }
        }
    }

    /// One final-review pass over `base..HEAD`.
    ///
    /// Returns true when fix chunks were spawned (the chunk loop re-enters).
    /// Protocol errors force acceptance; the offending output is logged.
    async fn final_review_pass(
        &self,
        spec: &Spec,
        state: &GitState,
        emitter: &Emitter,
        pass: u32,
    ) -> std::result::Result<bool, String> {
        if !state.enabled {
            return Ok(false);
        }
        let chunks = self
            .storage
            .get_chunks_by_spec(&spec.id)
            .await
            .map_err(|e| e.to_string())?;
        let last_committed = chunks
            .iter()
            .filter(|c| c.commit_hash.is_some())
            .max_by_key(|c| c.updated_at);
        let Some(last_committed) = last_committed else {
            return Ok(false);
        };

        emitter.emit(
            None,
            EventPayload::FinalReviewStart(FinalReviewStartPayload {
                spec_id: spec.id.clone(),
                pass,
            }),
        );

        let diff = diff_range(&state.working_dir, &state.base_branch, "HEAD")
            .map_err(|e| e.to_string())?;
        let review_prompt = prompt::build_final_review_prompt(spec, &diff);
        let options = ExecOptions {
            model: self.config.reviewer_model.clone(),
            working_dir: state.working_dir.clone(),
            system_prompt: None,
            timeout: self.config.review_timeout,
        };

        let result = match self.reviewer.execute(&review_prompt, &options).await {
            Ok(result) => result,
            Err(e) => {
                warn!(spec_id = %spec.id, error = %e, "final review failed; forcing accept");
                emitter.emit(
                    None,
                    EventPayload::FinalReviewComplete(FinalReviewCompletePayload {
                        spec_id: spec.id.clone(),
                        pass,
                        status: ReviewStatus::Error,
                    }),
                );
                return Ok(false);
            }
        };

        let verdict = match parse_verdict(&result.output) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(spec_id = %spec.id, error = %e, "final review verdict unparseable; forcing accept");
                emitter.emit(
                    None,
                    EventPayload::FinalReviewComplete(FinalReviewCompletePayload {
                        spec_id: spec.id.clone(),
                        pass,
                        status: ReviewStatus::Error,
                    }),
                );
                return Ok(false);
            }
        };

        emitter.emit(
            None,
            EventPayload::FinalReviewComplete(FinalReviewCompletePayload {
                spec_id: spec.id.clone(),
                pass,
                status: verdict.status,
            }),
        );

        if verdict.status != ReviewStatus::NeedsFix {
            return Ok(false);
        }

        // Spawn a fix chunk depending on the most recently committed chunk,
        // so the ready-set rule orders it after all landed work.
        let (title, description) = match &verdict.fix_chunk {
            Some(fix) => (fix.title.clone(), fix.description.clone()),
            None => (
                format!("Final review fixes for {}", spec.title),
                verdict.feedback.clone(),
            ),
        };
        let fix = self
            .storage
            .insert_fix_chunk(
                &last_committed.id,
                &title,
                &description,
                Some(vec![last_committed.id.clone()]),
            )
            .await
            .map_err(|e| e.to_string())?;

        emitter.emit(
            None,
            EventPayload::FinalReviewFixChunks(FinalReviewFixChunksPayload {
                spec_id: spec.id.clone(),
                chunk_ids: vec![fix.id.clone()],
            }),
        );
        info!(spec_id = %spec.id, fix_chunk = %fix.id, "final review spawned fix chunk");
        Ok(true)
    }

    /// Push, open the PR, and settle the spec's terminal status.
    async fn finalise(
        &self,
        spec: &Spec,
        state: &GitState,
        emitter: &Emitter,
        started: std::time::Instant,
    ) -> SpecRunOutcome {
        let chunks = match self.storage.get_chunks_by_spec(&spec.id).await {
            Ok(chunks) => chunks,
            Err(e) => return self.finalise_failed(spec, emitter, e.to_string()).await,
        };

        let stats = SpecStats {
            completed: chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Completed)
                .count(),
            failed: chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Failed)
                .count(),
            skipped: chunks
                .iter()
                .filter(|c| c.status == ChunkStatus::Skipped)
                .count(),
            commits: chunks.iter().filter(|c| c.commit_hash.is_some()).count(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        // Push + PR iff at least one chunk committed, regardless of later
        // failures; partial work still reaches review.
        let mut pr_opened = false;
        if state.enabled && stats.commits > 0 {
            match self.workspace.push(state) {
                Ok(()) => {
                    emitter.emit(
                        None,
                        EventPayload::GitPush(GitPushPayload {
                            spec_id: spec.id.clone(),
                            branch: state.branch.clone().unwrap_or_default(),
                        }),
                    );

                    let body = pr_body(spec, &chunks);
                    match self
                        .workspace
                        .open_pr(state, &spec.title, &body, &self.config.base_branch)
                    {
                        Ok(pr) => {
                            pr_opened = true;
                            if let Err(e) =
                                self.storage.set_spec_pr(&spec.id, pr.number, &pr.url).await
                            {
                                warn!(spec_id = %spec.id, error = %e, "failed to record PR");
                            }
                            emitter.emit(
                                None,
                                EventPayload::PrCreated(PrCreatedPayload {
                                    spec_id: spec.id.clone(),
                                    number: pr.number,
                                    url: pr.url,
                                }),
                            );
                        }
                        Err(e) => {
                            // Provider failure leaves commits intact.
                            warn!(spec_id = %spec.id, error = %e, "PR creation failed");
                            emitter.emit(
                                None,
                                EventPayload::Error(ErrorPayload {
                                    kind: "pr_failed".to_string(),
                                    message: e.to_string(),
                                    remediation: None,
                                }),
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(spec_id = %spec.id, error = %e, "push failed");
                    emitter.emit(
                        None,
                        EventPayload::Error(ErrorPayload {
                            kind: "push_failed".to_string(),
                            message: e.to_string(),
                            remediation: None,
                        }),
                    );
                }
            }
        }

        emitter.emit(
            None,
            EventPayload::SpecComplete(SpecCompletePayload {
                spec_id: spec.id.clone(),
                stats: stats.clone(),
            }),
        );

        if stats.failed > 0 {
            let reason = format!("{} chunk(s) failed", stats.failed);
            let _ = self
                .storage
                .update_spec_status(&spec.id, SpecStatus::Failed, Some(&reason))
                .await;
            info!(spec_id = %spec.id, reason = %reason, "spec failed");
            return SpecRunOutcome::Failed(reason);
        }

        let status = if pr_opened {
            SpecStatus::Review
        } else {
            SpecStatus::Completed
        };
        let _ = self
            .storage
            .update_spec_status(&spec.id, status, None)
            .await;
        info!(spec_id = %spec.id, status = status.as_str(), "spec run complete");
        SpecRunOutcome::Completed
    }

    async fn finalise_failed(
        &self,
        spec: &Spec,
        emitter: &Emitter,
        reason: String,
    ) -> SpecRunOutcome {
        emitter.emit(
            None,
            EventPayload::Error(ErrorPayload {
                kind: "spec_failed".to_string(),
                message: reason.clone(),
                remediation: None,
            }),
        );
        let _ = self
            .storage
            .update_spec_status(&spec.id, SpecStatus::Failed, Some(&reason))
            .await;
        SpecRunOutcome::Failed(reason)
    }

    async fn finalise_aborted(&self, spec: &Spec, emitter: &Emitter) -> SpecRunOutcome {
        emitter.emit(
            None,
            EventPayload::SpecAborted(SpecAbortedPayload {
                spec_id: spec.id.clone(),
                reason: "aborted".to_string(),
            }),
        );
        let _ = self
            .storage
            .update_spec_status(&spec.id, SpecStatus::Failed, Some("aborted"))
            .await;
        info!(spec_id = %spec.id, "spec aborted");
        SpecRunOutcome::Cancelled
    }
}

/// A dependency is satisfied when the chunk (or a committed fix chunk in its
/// lineage) reached a committed state: completed with a commit hash, or
/// skipped.
fn dependency_satisfied(dep_id: &Id, by_id: &HashMap<&str, &Chunk>) -> bool {
    let mut current = match by_id.get(dep_id.as_ref()) {
        Some(chunk) => *chunk,
        None => return false,
    };
    loop {
        if current.is_committed() {
            return true;
        }
        // Follow the fix lineage downward; the fix chunk carries the work.
        let child = by_id
            .values()
            .find(|c| c.parent_chunk_id.as_ref() == Some(&current.id));
        match child {
            Some(child) => current = child,
            None => return false,
        }
    }
}

/// Walk fix lineage upward to the chunk that owns the attempt budget.
fn lineage_root<'a>(chunk: &'a Chunk, by_id: &HashMap<&str, &'a Chunk>) -> &'a Chunk {
    let mut current = chunk;
    while let Some(parent_id) = &current.parent_chunk_id {
        match by_id.get(parent_id.as_ref()) {
            Some(parent) => current = parent,
            None => break,
        }
    }
    current
}

fn pr_body(spec: &Spec, chunks: &[Chunk]) -> String {
    let mut body = format!(
        "Automated implementation of spec **{}** (version {}).\n\n## Chunks\n\n",
        spec.title, spec.version
    );
    for chunk in chunks {
        let marker = match chunk.status {
            ChunkStatus::Completed => "x",
            _ => " ",
        };
        body.push_str(&format!("- [{marker}] {} ({})\n", chunk.title, chunk.status.as_str()));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(id: &str, status: ChunkStatus, commit: Option<&str>, parent: Option<&str>) -> Chunk {
        let now = Utc::now();
        Chunk {
            id: Id::from_string(id),
            spec_id: Id::from_string("spec"),
            title: id.to_string(),
            description: String::new(),
            ordinal: 0,
            status,
            output: None,
            error: None,
            review_status: None,
            review_feedback: None,
            depends_on: Vec::new(),
            parent_chunk_id: parent.map(Id::from_string),
            commit_hash: commit.map(String::from),
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn committed_dependency_is_satisfied() {
        let a = chunk("a", ChunkStatus::Completed, Some("abc"), None);
        let by_id: HashMap<&str, &Chunk> = [("a", &a)].into_iter().collect();
        assert!(dependency_satisfied(&Id::from_string("a"), &by_id));
    }

    #[test]
    fn skipped_dependency_is_satisfied() {
        let a = chunk("a", ChunkStatus::Skipped, None, None);
        let by_id: HashMap<&str, &Chunk> = [("a", &a)].into_iter().collect();
        assert!(dependency_satisfied(&Id::from_string("a"), &by_id));
    }

    #[test]
    fn pending_or_failed_dependency_is_not_satisfied() {
        let a = chunk("a", ChunkStatus::Pending, None, None);
        let b = chunk("b", ChunkStatus::Failed, None, None);
        let by_id: HashMap<&str, &Chunk> = [("a", &a), ("b", &b)].into_iter().collect();
        assert!(!dependency_satisfied(&Id::from_string("a"), &by_id));
        assert!(!dependency_satisfied(&Id::from_string("b"), &by_id));
    }

    #[test]
    fn needs_fix_dependency_satisfied_through_committed_fix() {
        let parent = chunk("parent", ChunkStatus::NeedsFix, None, None);
        let fix = chunk("fix", ChunkStatus::Completed, Some("def"), Some("parent"));
        let by_id: HashMap<&str, &Chunk> =
            [("parent", &parent), ("fix", &fix)].into_iter().collect();
        assert!(dependency_satisfied(&Id::from_string("parent"), &by_id));
    }

    #[test]
    fn needs_fix_dependency_with_pending_fix_is_not_satisfied() {
        let parent = chunk("parent", ChunkStatus::NeedsFix, None, None);
        let fix = chunk("fix", ChunkStatus::Pending, None, Some("parent"));
        let by_id: HashMap<&str, &Chunk> =
            [("parent", &parent), ("fix", &fix)].into_iter().collect();
        assert!(!dependency_satisfied(&Id::from_string("parent"), &by_id));
    }

    #[test]
    fn unknown_dependency_is_not_satisfied() {
        let by_id: HashMap<&str, &Chunk> = HashMap::new();
        assert!(!dependency_satisfied(&Id::from_string("ghost"), &by_id));
    }

    #[test]
    fn lineage_root_walks_to_top() {
        let root = chunk("root", ChunkStatus::NeedsFix, None, None);
        let mid = chunk("mid", ChunkStatus::NeedsFix, None, Some("root"));
        let leaf = chunk("leaf", ChunkStatus::Pending, None, Some("mid"));
        let by_id: HashMap<&str, &Chunk> = [("root", &root), ("mid", &mid), ("leaf", &leaf)]
            .into_iter()
            .collect();
        assert_eq!(lineage_root(&leaf, &by_id).id.as_ref(), "root");
        assert_eq!(lineage_root(&root, &by_id).id.as_ref(), "root");
    }

    #[test]
    fn pr_body_lists_chunks() {
        let now = Utc::now();
        let spec = Spec {
            id: Id::from_string("s"),
            project_id: Id::from_string("p"),
            title: "Big Feature".to_string(),
            content: String::new(),
            status: SpecStatus::Running,
            branch_name: None,
            pr_number: None,
            pr_url: None,
            version: 2,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let chunks = vec![
            chunk("a", ChunkStatus::Completed, Some("abc"), None),
            chunk("b", ChunkStatus::Failed, None, None),
        ];
        let body = pr_body(&spec, &chunks);
        assert!(body.contains("Big Feature"));
        assert!(body.contains("- [x] a (completed)"));
        assert!(body.contains("- [ ] b (failed)"));
    }
}
