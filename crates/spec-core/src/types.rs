//! Core types for the spec orchestrator.
//!
//! These mirror the persisted data model: projects own specs, specs own
//! ordered chunks, chunks accumulate tool calls and review logs while a
//! worker drives them through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for projects, specs, chunks, and the rest.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// First seven characters, used in branch names.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(7);
        &self.0[..end]
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Spec lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecStatus {
    Draft,
    Ready,
    Running,
    Review,
    Completed,
    Merged,
    Failed,
}

impl SpecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Review => "review",
            Self::Completed => "completed",
            Self::Merged => "merged",
            Self::Failed => "failed",
        }
    }

    /// A merged spec is terminal; its chunks are never re-run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged)
    }
}

/// Chunk execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NeedsFix,
    Skipped,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NeedsFix => "needs_fix",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::NeedsFix | Self::Skipped
        )
    }
}

/// Review outcome for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pass,
    NeedsFix,
    Fail,
    Error,
    Skipped,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::NeedsFix => "needs_fix",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

/// Tool call lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Tool calls are append-only once terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Non-terminal workers count against the concurrency cap.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

// --- Core types ---

/// Durable identity for a working copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
    /// Absolute path to the project directory.
    pub path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of delivery. Every spec runs against exactly one branch/worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub id: Id,
    pub project_id: Id,
    pub title: String,
    /// Markdown spec body.
    pub content: String,
    pub status: SpecStatus,
    /// Git branch the spec's chunks commit into.
    pub branch_name: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    /// Monotone counter, bumped on content change.
    pub version: i64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task unit inside a spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Id,
    pub spec_id: Id,
    pub title: String,
    /// Prompt body sent to the executor.
    pub description: String,
    /// Position within the spec; unique per spec, reorderable.
    pub ordinal: i64,
    pub status: ChunkStatus,
    /// Captured executor output.
    pub output: Option<String>,
    pub error: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub review_feedback: Option<String>,
    /// Ids of chunks (same spec) that must commit before this one runs.
    pub depends_on: Vec<Id>,
    /// Set on fix chunks: the chunk whose review spawned this one.
    pub parent_chunk_id: Option<Id>,
    /// Commit created for this chunk, once review passed.
    pub commit_hash: Option<String>,
    /// Fix-lineage attempt counter, tracked on the lineage root.
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    /// Whether the chunk's work landed: committed, or explicitly skipped.
    pub fn is_committed(&self) -> bool {
        matches!(self.status, ChunkStatus::Skipped)
            || (self.status == ChunkStatus::Completed && self.commit_hash.is_some())
    }
}

/// A side-effect record emitted by a backend during chunk execution.
/// Append-only; never mutated after reaching a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: Id,
    pub chunk_id: Id,
    /// Backend-assigned call id, used to correlate stream updates.
    pub call_id: String,
    pub name: String,
    pub input: serde_json::Value,
    pub status: ToolCallStatus,
    pub output: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pending spec awaiting a worker. Unique per spec id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Id,
    pub spec_id: Id,
    pub project_id: Id,
    /// Higher priority dispatches earlier.
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
}

/// The transient per-spec execution context, occupying one capacity slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Id,
    pub spec_id: Id,
    pub status: WorkerStatus,
    pub current_chunk_id: Option<Id>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Transient per-spec git workspace state.
///
/// Produced by workspace init, consumed by the pipeline and sequencer,
/// destroyed by cleanup. When the project directory is not a git repository
/// `enabled` is false and pipelines proceed without commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitState {
    pub enabled: bool,
    /// Branch checked out before init, best-effort; irrelevant in worktree mode.
    pub original_branch: Option<String>,
    /// Spec branch of the form `spec/<slug>-<shortid>`.
    pub branch: Option<String>,
    /// Directory pipelines execute in: the worktree path, or the project dir.
    pub working_dir: PathBuf,
    pub worktree: bool,
    pub base_branch: String,
}

impl GitState {
    /// State for a directory that is not a git repository.
    pub fn disabled(dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: false,
            original_branch: None,
            branch: None,
            working_dir: dir.into(),
            worktree: false,
            base_branch: "main".to_string(),
        }
    }
}

/// Audit record of a review outcome. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewLog {
    pub id: Id,
    pub chunk_id: Id,
    pub status: ReviewStatus,
    pub feedback: Option<String>,
    pub model: String,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of orchestrator capacity, surfaced to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerStats {
    pub active: usize,
    pub max: usize,
    pub queue_len: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn id_short_is_seven_chars() {
        let id = Id::from_string("0193a1b2-aaaa-bbbb-cccc-ddddeeeeffff");
        assert_eq!(id.short(), "0193a1b");
        let tiny = Id::from_string("abc");
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn spec_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&SpecStatus::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&ChunkStatus::NeedsFix).unwrap(),
            "\"needs_fix\""
        );
    }

    #[test]
    fn chunk_status_terminal_states() {
        assert!(ChunkStatus::Completed.is_terminal());
        assert!(ChunkStatus::Failed.is_terminal());
        assert!(ChunkStatus::NeedsFix.is_terminal());
        assert!(ChunkStatus::Skipped.is_terminal());
        assert!(!ChunkStatus::Pending.is_terminal());
        assert!(!ChunkStatus::Running.is_terminal());
    }

    #[test]
    fn worker_status_terminal_states() {
        assert!(WorkerStatus::Completed.is_terminal());
        assert!(WorkerStatus::Cancelled.is_terminal());
        assert!(!WorkerStatus::Running.is_terminal());
        assert!(!WorkerStatus::Paused.is_terminal());
        assert!(!WorkerStatus::Idle.is_terminal());
    }

    #[test]
    fn tool_call_status_terminal_states() {
        assert!(ToolCallStatus::Completed.is_terminal());
        assert!(ToolCallStatus::Error.is_terminal());
        assert!(!ToolCallStatus::Pending.is_terminal());
        assert!(!ToolCallStatus::Running.is_terminal());
    }

    #[test]
    fn only_merged_spec_is_terminal() {
        assert!(SpecStatus::Merged.is_terminal());
        assert!(!SpecStatus::Completed.is_terminal());
        assert!(!SpecStatus::Failed.is_terminal());
    }

    #[test]
    fn chunk_is_committed_requires_hash() {
        let mut chunk = Chunk {
            id: Id::new(),
            spec_id: Id::new(),
            title: "t".to_string(),
            description: "d".to_string(),
            ordinal: 0,
            status: ChunkStatus::Completed,
            output: None,
            error: None,
            review_status: None,
            review_feedback: None,
            depends_on: Vec::new(),
            parent_chunk_id: None,
            commit_hash: None,
            attempts: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!chunk.is_committed());
        chunk.commit_hash = Some("abc123".to_string());
        assert!(chunk.is_committed());
        chunk.commit_hash = None;
        chunk.status = ChunkStatus::Skipped;
        assert!(chunk.is_committed());
    }

    #[test]
    fn git_state_disabled_defaults() {
        let state = GitState::disabled("/tmp/project");
        assert!(!state.enabled);
        assert!(!state.worktree);
        assert_eq!(state.base_branch, "main");
        assert_eq!(state.working_dir, PathBuf::from("/tmp/project"));
    }
}
