//! Event types for the per-spec subscription stream.
//!
//! The sequencer and pipeline emit these in order as a spec runs; the
//! service layer fans them out to subscribers over broadcast channels.
//! Subscribers receive only future events, there is no replay.

use crate::types::{ChunkStatus, Id, ReviewStatus, ToolCallStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SpecStart,
    ChunkStart,
    ChunkComplete,
    ChunkSkipped,
    DependencyBlocked,
    ToolCall,
    Text,
    ValidationStart,
    ValidationComplete,
    ReviewStart,
    ReviewComplete,
    GitWorkflowInit,
    GitReset,
    GitCommit,
    GitPush,
    PrCreated,
    FinalReviewStart,
    FinalReviewComplete,
    FinalReviewFixChunks,
    SpecComplete,
    SpecAborted,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecStart => "SPEC_START",
            Self::ChunkStart => "CHUNK_START",
            Self::ChunkComplete => "CHUNK_COMPLETE",
            Self::ChunkSkipped => "CHUNK_SKIPPED",
            Self::DependencyBlocked => "DEPENDENCY_BLOCKED",
            Self::ToolCall => "TOOL_CALL",
            Self::Text => "TEXT",
            Self::ValidationStart => "VALIDATION_START",
            Self::ValidationComplete => "VALIDATION_COMPLETE",
            Self::ReviewStart => "REVIEW_START",
            Self::ReviewComplete => "REVIEW_COMPLETE",
            Self::GitWorkflowInit => "GIT_WORKFLOW_INIT",
            Self::GitReset => "GIT_RESET",
            Self::GitCommit => "GIT_COMMIT",
            Self::GitPush => "GIT_PUSH",
            Self::PrCreated => "PR_CREATED",
            Self::FinalReviewStart => "FINAL_REVIEW_START",
            Self::FinalReviewComplete => "FINAL_REVIEW_COMPLETE",
            Self::FinalReviewFixChunks => "FINAL_REVIEW_FIX_CHUNKS",
            Self::SpecComplete => "SPEC_COMPLETE",
            Self::SpecAborted => "SPEC_ABORTED",
            Self::Error => "ERROR",
        }
    }
}

/// Payload for `SPEC_START`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecStartPayload {
    pub spec_id: Id,
    pub total_chunks: usize,
}

/// Payload for `CHUNK_START`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkStartPayload {
    pub chunk_id: Id,
    pub title: String,
    pub attempt: i64,
}

/// Payload for `CHUNK_COMPLETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkCompletePayload {
    pub chunk_id: Id,
    pub status: ChunkStatus,
    pub commit_hash: Option<String>,
}

/// Payload for `CHUNK_SKIPPED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSkippedPayload {
    pub chunk_id: Id,
    pub reason: String,
}

/// Payload for `DEPENDENCY_BLOCKED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyBlockedPayload {
    pub chunk_id: Id,
    /// The predecessor that never reached a committed state.
    pub blocked_on: Id,
}

/// Payload for `TOOL_CALL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub chunk_id: Id,
    pub call_id: String,
    pub name: String,
    pub status: ToolCallStatus,
}

/// Payload for `TEXT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPayload {
    pub chunk_id: Id,
    pub text: String,
}

/// Payload for `VALIDATION_START`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStartPayload {
    pub chunk_id: Id,
}

/// Payload for `VALIDATION_COMPLETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationCompletePayload {
    pub chunk_id: Id,
    pub files_changed: usize,
    pub build_success: Option<bool>,
    pub auto_failed: bool,
}

/// Payload for `REVIEW_START`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewStartPayload {
    pub chunk_id: Id,
}

/// Payload for `REVIEW_COMPLETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewCompletePayload {
    pub chunk_id: Id,
    pub status: ReviewStatus,
    pub feedback: Option<String>,
}

/// Payload for `GIT_WORKFLOW_INIT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitWorkflowInitPayload {
    pub spec_id: Id,
    pub branch: Option<String>,
    pub worktree: bool,
    pub working_dir: String,
}

/// Payload for `GIT_RESET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitResetPayload {
    pub chunk_id: Id,
    /// Snapshot commit the worktree was reset to.
    pub head: String,
}

/// Payload for `GIT_COMMIT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCommitPayload {
    pub chunk_id: Id,
    pub hash: String,
    pub files_changed: usize,
}

/// Payload for `GIT_PUSH`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitPushPayload {
    pub spec_id: Id,
    pub branch: String,
}

/// Payload for `PR_CREATED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrCreatedPayload {
    pub spec_id: Id,
    pub number: i64,
    pub url: String,
}

/// Payload for `FINAL_REVIEW_START`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReviewStartPayload {
    pub spec_id: Id,
    pub pass: u32,
}

/// Payload for `FINAL_REVIEW_COMPLETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReviewCompletePayload {
    pub spec_id: Id,
    pub pass: u32,
    pub status: ReviewStatus,
}

/// Payload for `FINAL_REVIEW_FIX_CHUNKS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReviewFixChunksPayload {
    pub spec_id: Id,
    pub chunk_ids: Vec<Id>,
}

/// Per-spec completion statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecStats {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub commits: usize,
    pub duration_ms: u64,
}

/// Payload for `SPEC_COMPLETE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecCompletePayload {
    pub spec_id: Id,
    pub stats: SpecStats,
}

/// Payload for `SPEC_ABORTED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecAbortedPayload {
    pub spec_id: Id,
    pub reason: String,
}

/// Payload for `ERROR`.
///
/// Carries a stable kind tag, a short human message, and optional
/// remediation so the UI can surface something actionable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Union type for all event payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    SpecStart(SpecStartPayload),
    ChunkStart(ChunkStartPayload),
    ChunkComplete(ChunkCompletePayload),
    ChunkSkipped(ChunkSkippedPayload),
    DependencyBlocked(DependencyBlockedPayload),
    ToolCall(ToolCallPayload),
    Text(TextPayload),
    ValidationStart(ValidationStartPayload),
    ValidationComplete(ValidationCompletePayload),
    ReviewStart(ReviewStartPayload),
    ReviewComplete(ReviewCompletePayload),
    GitWorkflowInit(GitWorkflowInitPayload),
    GitReset(GitResetPayload),
    GitCommit(GitCommitPayload),
    GitPush(GitPushPayload),
    PrCreated(PrCreatedPayload),
    FinalReviewStart(FinalReviewStartPayload),
    FinalReviewComplete(FinalReviewCompletePayload),
    FinalReviewFixChunks(FinalReviewFixChunksPayload),
    SpecComplete(SpecCompletePayload),
    SpecAborted(SpecAbortedPayload),
    Error(ErrorPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SpecStart(_) => EventType::SpecStart,
            Self::ChunkStart(_) => EventType::ChunkStart,
            Self::ChunkComplete(_) => EventType::ChunkComplete,
            Self::ChunkSkipped(_) => EventType::ChunkSkipped,
            Self::DependencyBlocked(_) => EventType::DependencyBlocked,
            Self::ToolCall(_) => EventType::ToolCall,
            Self::Text(_) => EventType::Text,
            Self::ValidationStart(_) => EventType::ValidationStart,
            Self::ValidationComplete(_) => EventType::ValidationComplete,
            Self::ReviewStart(_) => EventType::ReviewStart,
            Self::ReviewComplete(_) => EventType::ReviewComplete,
            Self::GitWorkflowInit(_) => EventType::GitWorkflowInit,
            Self::GitReset(_) => EventType::GitReset,
            Self::GitCommit(_) => EventType::GitCommit,
            Self::GitPush(_) => EventType::GitPush,
            Self::PrCreated(_) => EventType::PrCreated,
            Self::FinalReviewStart(_) => EventType::FinalReviewStart,
            Self::FinalReviewComplete(_) => EventType::FinalReviewComplete,
            Self::FinalReviewFixChunks(_) => EventType::FinalReviewFixChunks,
            Self::SpecComplete(_) => EventType::SpecComplete,
            Self::SpecAborted(_) => EventType::SpecAborted,
            Self::Error(_) => EventType::Error,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An event on a spec's subscription stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecEvent {
    pub spec_id: Id,
    pub chunk_id: Option<Id>,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl SpecEvent {
    pub fn new(spec_id: Id, chunk_id: Option<Id>, payload: EventPayload) -> Self {
        Self {
            spec_id,
            chunk_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}
