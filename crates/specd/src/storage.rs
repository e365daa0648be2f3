//! SQLite storage for the orchestrator daemon.
//!
//! Persists projects, specs, chunks, tool calls, queue items, workers, and
//! review logs. Chunk status updates publish a change notification consumed
//! by the event fan-out.

use chrono::{DateTime, Utc};
use spec_core::{
    Chunk, ChunkStatus, Id, Project, QueueItem, ReviewLog, ReviewStatus, Spec, SpecStatus,
    ToolCall, ToolCallStatus, Worker, WorkerStatus,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;
use tokio::sync::broadcast;

/// Explicit column list for chunk queries.
/// Using explicit columns instead of SELECT * keeps the mapping stable
/// regardless of column order after ALTER TABLE migrations.
const CHUNK_COLUMNS: &str = "id, spec_id, title, description, ordinal, status, output, error, \
    review_status, review_feedback, depends_on, parent_chunk_id, commit_hash, attempts, \
    created_at, updated_at";

const SPEC_COLUMNS: &str = "id, project_id, title, content, status, branch_name, pr_number, \
    pr_url, version, error, created_at, updated_at";

/// Buffer for the chunk-change broadcast; lagging receivers drop old entries.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("project not found: {0}")]
    ProjectNotFound(String),
    #[error("spec not found: {0}")]
    SpecNotFound(String),
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),
    #[error("tool call not found: {0}")]
    ToolCallNotFound(String),
    #[error("worker not found: {0}")]
    WorkerNotFound(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Notification published when a chunk's status changes.
#[derive(Debug, Clone)]
pub struct ChunkChange {
    pub chunk_id: Id,
    pub spec_id: Id,
    pub status: ChunkStatus,
}

/// Partial update to a chunk. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ChunkPatch {
    pub status: Option<ChunkStatus>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub review_feedback: Option<String>,
    pub commit_hash: Option<String>,
    pub attempts: Option<i64>,
}

/// Storage backend for the daemon.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<ChunkChange>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self { pool, changes })
    }

    /// Run embedded migrations, tolerating already-applied statements.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    /// Subscribe to chunk status change notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChunkChange> {
        self.changes.subscribe()
    }

    fn publish_change(&self, chunk: &Chunk) {
        // No receivers is fine; the send result is deliberately ignored.
        let _ = self.changes.send(ChunkChange {
            chunk_id: chunk.id.clone(),
            spec_id: chunk.spec_id.clone(),
            status: chunk.status,
        });
    }

    // --- Project operations ---

    pub async fn create_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            "INSERT INTO projects (id, name, path, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(project.id.as_ref())
        .bind(&project.name)
        .bind(&project.path)
        .bind(project.created_at.timestamp_millis())
        .bind(project.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, id: &Id) -> Result<Project> {
        let row = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, path, created_at, updated_at FROM projects WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::ProjectNotFound(id.to_string()))?;
        Ok(row.into_project())
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>(
            "SELECT id, name, path, created_at, updated_at FROM projects ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ProjectRow::into_project).collect())
    }

    /// Delete a project and everything it owns, in one transaction.
    pub async fn delete_project(&self, id: &Id) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM tool_calls WHERE chunk_id IN \
             (SELECT c.id FROM chunks c JOIN specs s ON c.spec_id = s.id WHERE s.project_id = ?1)",
        )
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM review_logs WHERE chunk_id IN \
             (SELECT c.id FROM chunks c JOIN specs s ON c.spec_id = s.id WHERE s.project_id = ?1)",
        )
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM chunks WHERE spec_id IN (SELECT id FROM specs WHERE project_id = ?1)",
        )
        .bind(id.as_ref())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_items WHERE project_id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM specs WHERE project_id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM projects WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ProjectNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Spec operations ---

    pub async fn insert_spec(&self, spec: &Spec) -> Result<()> {
        sqlx::query(
            "INSERT INTO specs (id, project_id, title, content, status, branch_name, pr_number, \
             pr_url, version, error, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(spec.id.as_ref())
        .bind(spec.project_id.as_ref())
        .bind(&spec.title)
        .bind(&spec.content)
        .bind(spec.status.as_str())
        .bind(&spec.branch_name)
        .bind(spec.pr_number)
        .bind(&spec.pr_url)
        .bind(spec.version)
        .bind(&spec.error)
        .bind(spec.created_at.timestamp_millis())
        .bind(spec.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_spec(&self, id: &Id) -> Result<Spec> {
        let query = format!("SELECT {SPEC_COLUMNS} FROM specs WHERE id = ?1");
        let row = sqlx::query_as::<_, SpecRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::SpecNotFound(id.to_string()))?;
        Ok(row.into_spec())
    }

    pub async fn list_specs(&self, project_id: &Id) -> Result<Vec<Spec>> {
        let query =
            format!("SELECT {SPEC_COLUMNS} FROM specs WHERE project_id = ?1 ORDER BY created_at");
        let rows = sqlx::query_as::<_, SpecRow>(&query)
            .bind(project_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(SpecRow::into_spec).collect())
    }

    pub async fn update_spec_status(
        &self,
        id: &Id,
        status: SpecStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Replace the spec content, bumping the version counter.
    pub async fn update_spec_content(&self, id: &Id, content: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET content = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(content)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_spec_branch(&self, id: &Id, branch: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result =
            sqlx::query("UPDATE specs SET branch_name = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(branch)
                .bind(now)
                .bind(id.as_ref())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn set_spec_pr(&self, id: &Id, number: i64, url: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE specs SET pr_number = ?1, pr_url = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(number)
        .bind(url)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::SpecNotFound(id.to_string()));
        }
        Ok(())
    }

    // --- Chunk operations ---

    /// Insert a new chunk, rejecting cycles in the spec's dependency graph.
    pub async fn create_chunk(&self, chunk: &Chunk) -> Result<()> {
        let existing = self.get_chunks_by_spec(&chunk.spec_id).await?;
        validate_dependencies(chunk, &existing)?;

        self.insert_chunk_raw(chunk).await?;
        self.publish_change(chunk);
        Ok(())
    }

    async fn insert_chunk_raw(&self, chunk: &Chunk) -> Result<()> {
        let depends_on = serde_json::to_string(&chunk.depends_on)?;
        sqlx::query(
            "INSERT INTO chunks (id, spec_id, title, description, ordinal, status, output, \
             error, review_status, review_feedback, depends_on, parent_chunk_id, commit_hash, \
             attempts, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(chunk.id.as_ref())
        .bind(chunk.spec_id.as_ref())
        .bind(&chunk.title)
        .bind(&chunk.description)
        .bind(chunk.ordinal)
        .bind(chunk.status.as_str())
        .bind(&chunk.output)
        .bind(&chunk.error)
        .bind(chunk.review_status.map(|s| s.as_str()))
        .bind(&chunk.review_feedback)
        .bind(depends_on)
        .bind(chunk.parent_chunk_id.as_ref().map(Id::as_ref))
        .bind(&chunk.commit_hash)
        .bind(chunk.attempts)
        .bind(chunk.created_at.timestamp_millis())
        .bind(chunk.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_chunk(&self, id: &Id) -> Result<Chunk> {
        let query = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1");
        let row = sqlx::query_as::<_, ChunkRow>(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::ChunkNotFound(id.to_string()))?;
        row.into_chunk()
    }

    /// Chunks of a spec in ordinal order (id as the tiebreak).
    pub async fn get_chunks_by_spec(&self, spec_id: &Id) -> Result<Vec<Chunk>> {
        let query =
            format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE spec_id = ?1 ORDER BY ordinal, id");
        let rows = sqlx::query_as::<_, ChunkRow>(&query)
            .bind(spec_id.as_ref())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ChunkRow::into_chunk).collect()
    }

    /// Apply a partial update to a chunk and return the updated row.
    pub async fn update_chunk(&self, id: &Id, patch: ChunkPatch) -> Result<Chunk> {
        let mut chunk = self.get_chunk(id).await?;

        if let Some(status) = patch.status {
            chunk.status = status;
        }
        if let Some(output) = patch.output {
            chunk.output = Some(output);
        }
        if let Some(error) = patch.error {
            chunk.error = Some(error);
        }
        if let Some(review_status) = patch.review_status {
            chunk.review_status = Some(review_status);
        }
        if let Some(feedback) = patch.review_feedback {
            chunk.review_feedback = Some(feedback);
        }
        if let Some(hash) = patch.commit_hash {
            chunk.commit_hash = Some(hash);
        }
        if let Some(attempts) = patch.attempts {
            chunk.attempts = attempts;
        }
        chunk.updated_at = Utc::now();

        let result = sqlx::query(
            "UPDATE chunks SET status = ?1, output = ?2, error = ?3, review_status = ?4, \
             review_feedback = ?5, commit_hash = ?6, attempts = ?7, updated_at = ?8 WHERE id = ?9",
        )
        .bind(chunk.status.as_str())
        .bind(&chunk.output)
        .bind(&chunk.error)
        .bind(chunk.review_status.map(|s| s.as_str()))
        .bind(&chunk.review_feedback)
        .bind(&chunk.commit_hash)
        .bind(chunk.attempts)
        .bind(chunk.updated_at.timestamp_millis())
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ChunkNotFound(id.to_string()));
        }

        self.publish_change(&chunk);
        Ok(chunk)
    }

    /// Reorder all chunks of a spec in a single transaction.
    ///
    /// The id set must match the spec's chunks exactly; ordinals are
    /// reassigned 0..n following the given order.
    pub async fn reorder_chunks(&self, spec_id: &Id, ordered_ids: &[Id]) -> Result<()> {
        let existing = self.get_chunks_by_spec(spec_id).await?;
        let existing_ids: HashSet<&str> = existing.iter().map(|c| c.id.as_ref()).collect();
        let given_ids: HashSet<&str> = ordered_ids.iter().map(Id::as_ref).collect();

        if existing_ids != given_ids || ordered_ids.len() != existing.len() {
            return Err(StorageError::InvariantViolation(format!(
                "reorder for spec {spec_id} must cover exactly its {} chunks",
                existing.len()
            )));
        }

        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for (ordinal, id) in ordered_ids.iter().enumerate() {
            sqlx::query("UPDATE chunks SET ordinal = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(ordinal as i64)
                .bind(now)
                .bind(id.as_ref())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Atomically create a fix chunk and link it to its parent.
    ///
    /// The fix chunk takes the parent's ordinal (so it runs on the next
    /// selection pass) and, unless overridden, inherits the parent's
    /// dependencies.
    pub async fn insert_fix_chunk(
        &self,
        parent_id: &Id,
        title: &str,
        description: &str,
        depends_on: Option<Vec<Id>>,
    ) -> Result<Chunk> {
        let parent = self.get_chunk(parent_id).await?;
        let now = Utc::now();
        let chunk = Chunk {
            id: Id::new(),
            spec_id: parent.spec_id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            ordinal: parent.ordinal,
            status: ChunkStatus::Pending,
            output: None,
            error: None,
            review_status: None,
            review_feedback: None,
            depends_on: depends_on.unwrap_or_else(|| parent.depends_on.clone()),
            parent_chunk_id: Some(parent.id.clone()),
            commit_hash: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };

        let existing = self.get_chunks_by_spec(&chunk.spec_id).await?;
        validate_dependencies(&chunk, &existing)?;

        self.insert_chunk_raw(&chunk).await?;
        self.publish_change(&chunk);
        Ok(chunk)
    }

    // --- Tool call operations ---

    pub async fn insert_tool_call(&self, call: &ToolCall) -> Result<()> {
        sqlx::query(
            "INSERT INTO tool_calls (id, chunk_id, call_id, name, input, status, output, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(call.id.as_ref())
        .bind(call.chunk_id.as_ref())
        .bind(&call.call_id)
        .bind(&call.name)
        .bind(serde_json::to_string(&call.input)?)
        .bind(call.status.as_str())
        .bind(
            call.output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(call.created_at.timestamp_millis())
        .bind(call.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance a tool call's state. Terminal tool calls are append-only:
    /// mutating one is an invariant violation, never silently corrected.
    pub async fn update_tool_call(
        &self,
        chunk_id: &Id,
        call_id: &str,
        status: ToolCallStatus,
        output: Option<&serde_json::Value>,
    ) -> Result<()> {
        let existing = sqlx::query_as::<_, ToolCallRow>(
            "SELECT id, chunk_id, call_id, name, input, status, output, created_at, updated_at \
             FROM tool_calls WHERE chunk_id = ?1 AND call_id = ?2",
        )
        .bind(chunk_id.as_ref())
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::ToolCallNotFound(call_id.to_string()))?;

        let current = parse_tool_call_status(&existing.status);
        if current.is_terminal() {
            return Err(StorageError::InvariantViolation(format!(
                "tool call {call_id} already terminal ({})",
                current.as_str()
            )));
        }

        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE tool_calls SET status = ?1, output = COALESCE(?2, output), updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(output.map(serde_json::to_string).transpose()?)
        .bind(now)
        .bind(&existing.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Tool calls for a chunk in insertion order.
    pub async fn get_tool_calls_by_chunk(&self, chunk_id: &Id) -> Result<Vec<ToolCall>> {
        let rows = sqlx::query_as::<_, ToolCallRow>(
            "SELECT id, chunk_id, call_id, name, input, status, output, created_at, updated_at \
             FROM tool_calls WHERE chunk_id = ?1 ORDER BY created_at, id",
        )
        .bind(chunk_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ToolCallRow::into_tool_call).collect()
    }

    /// Close every non-terminal tool call of a chunk as errored.
    /// Used on cancellation so partially written calls end consistent.
    pub async fn close_open_tool_calls(&self, chunk_id: &Id) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE tool_calls SET status = 'error', updated_at = ?1 \
             WHERE chunk_id = ?2 AND status IN ('pending', 'running')",
        )
        .bind(now)
        .bind(chunk_id.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    // --- Queue operations ---

    /// Enqueue a spec, updating priority if it is already queued.
    pub async fn enqueue_item(&self, item: &QueueItem) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_items (id, spec_id, project_id, priority, enqueued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(spec_id) DO UPDATE SET priority = excluded.priority",
        )
        .bind(item.id.as_ref())
        .bind(item.spec_id.as_ref())
        .bind(item.project_id.as_ref())
        .bind(item.priority)
        .bind(item.enqueued_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_queue_item(&self, spec_id: &Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_items WHERE spec_id = ?1")
            .bind(spec_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Queue items in dispatch order: priority desc, enqueued_at asc.
    pub async fn list_queue_items(&self) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query_as::<_, QueueItemRow>(
            "SELECT id, spec_id, project_id, priority, enqueued_at FROM queue_items \
             ORDER BY priority DESC, enqueued_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(QueueItemRow::into_item).collect())
    }

    // --- Worker operations ---

    pub async fn insert_worker(&self, worker: &Worker) -> Result<()> {
        // One live worker per spec.
        if self.get_live_worker(&worker.spec_id).await?.is_some() {
            return Err(StorageError::InvariantViolation(format!(
                "spec {} already has a live worker",
                worker.spec_id
            )));
        }

        sqlx::query(
            "INSERT INTO workers (id, spec_id, status, current_chunk_id, error, started_at, \
             updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(worker.id.as_ref())
        .bind(worker.spec_id.as_ref())
        .bind(worker.status.as_str())
        .bind(worker.current_chunk_id.as_ref().map(Id::as_ref))
        .bind(&worker.error)
        .bind(worker.started_at.timestamp_millis())
        .bind(worker.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_worker(
        &self,
        id: &Id,
        status: WorkerStatus,
        current_chunk_id: Option<&Id>,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE workers SET status = ?1, current_chunk_id = ?2, error = ?3, updated_at = ?4 \
             WHERE id = ?5",
        )
        .bind(status.as_str())
        .bind(current_chunk_id.map(Id::as_ref))
        .bind(error)
        .bind(now)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::WorkerNotFound(id.to_string()));
        }
        Ok(())
    }

    /// The non-terminal worker for a spec, if one exists.
    pub async fn get_live_worker(&self, spec_id: &Id) -> Result<Option<Worker>> {
        let row = sqlx::query_as::<_, WorkerRow>(
            "SELECT id, spec_id, status, current_chunk_id, error, started_at, updated_at \
             FROM workers WHERE spec_id = ?1 AND status IN ('idle', 'running', 'paused') \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(spec_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(WorkerRow::into_worker))
    }

    pub async fn count_live_workers(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workers WHERE status IN ('idle', 'running', 'paused')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as usize)
    }

    /// Reconcile workers left live by a previous process.
    ///
    /// Called at daemon startup: a restart drops in-flight workers, so any
    /// live row in persistence is marked failed. Returns how many were fixed.
    pub async fn reconcile_interrupted_workers(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "UPDATE workers SET status = 'failed', error = 'orchestrator restart', \
             updated_at = ?1 WHERE status IN ('idle', 'running', 'paused')",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    // --- Review log operations ---

    pub async fn insert_review_log(&self, log: &ReviewLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO review_logs (id, chunk_id, status, feedback, model, duration_ms, \
             created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(log.id.as_ref())
        .bind(log.chunk_id.as_ref())
        .bind(log.status.as_str())
        .bind(&log.feedback)
        .bind(&log.model)
        .bind(log.duration_ms)
        .bind(log.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_review_logs(&self, chunk_id: &Id) -> Result<Vec<ReviewLog>> {
        let rows = sqlx::query_as::<_, ReviewLogRow>(
            "SELECT id, chunk_id, status, feedback, model, duration_ms, created_at \
             FROM review_logs WHERE chunk_id = ?1 ORDER BY created_at, id",
        )
        .bind(chunk_id.as_ref())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ReviewLogRow::into_log).collect())
    }
}

/// Reject dependencies that reference other specs, unknown chunks, the chunk
/// itself, or that would close a cycle in the spec's dependency graph.
fn validate_dependencies(chunk: &Chunk, existing: &[Chunk]) -> Result<()> {
    let by_id: HashMap<&str, &Chunk> = existing.iter().map(|c| (c.id.as_ref(), c)).collect();

    for dep in &chunk.depends_on {
        if dep == &chunk.id {
            return Err(StorageError::InvariantViolation(format!(
                "chunk {} depends on itself",
                chunk.id
            )));
        }
        if !by_id.contains_key(dep.as_ref()) {
            return Err(StorageError::InvariantViolation(format!(
                "chunk {} depends on unknown chunk {dep} (dependencies must stay within the spec)",
                chunk.id
            )));
        }
    }

    // DFS from the new chunk's dependencies; reaching the new chunk closes a
    // cycle. Existing chunks are assumed acyclic (enforced at their creation).
    let mut stack: Vec<&str> = chunk.depends_on.iter().map(Id::as_ref).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == chunk.id.as_ref() {
            return Err(StorageError::InvariantViolation(format!(
                "dependency cycle through chunk {}",
                chunk.id
            )));
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(node) = by_id.get(current) {
            stack.extend(node.depends_on.iter().map(Id::as_ref));
        }
    }
    Ok(())
}

fn parse_spec_status(s: &str) -> SpecStatus {
    match s {
        "draft" => SpecStatus::Draft,
        "ready" => SpecStatus::Ready,
        "running" => SpecStatus::Running,
        "review" => SpecStatus::Review,
        "completed" => SpecStatus::Completed,
        "merged" => SpecStatus::Merged,
        _ => SpecStatus::Failed,
    }
}

fn parse_chunk_status(s: &str) -> ChunkStatus {
    match s {
        "pending" => ChunkStatus::Pending,
        "running" => ChunkStatus::Running,
        "completed" => ChunkStatus::Completed,
        "needs_fix" => ChunkStatus::NeedsFix,
        "skipped" => ChunkStatus::Skipped,
        _ => ChunkStatus::Failed,
    }
}

fn parse_review_status(s: &str) -> ReviewStatus {
    match s {
        "pass" => ReviewStatus::Pass,
        "needs_fix" => ReviewStatus::NeedsFix,
        "fail" => ReviewStatus::Fail,
        "skipped" => ReviewStatus::Skipped,
        _ => ReviewStatus::Error,
    }
}

fn parse_tool_call_status(s: &str) -> ToolCallStatus {
    match s {
        "pending" => ToolCallStatus::Pending,
        "running" => ToolCallStatus::Running,
        "completed" => ToolCallStatus::Completed,
        _ => ToolCallStatus::Error,
    }
}

fn parse_worker_status(s: &str) -> WorkerStatus {
    match s {
        "idle" => WorkerStatus::Idle,
        "running" => WorkerStatus::Running,
        "paused" => WorkerStatus::Paused,
        "completed" => WorkerStatus::Completed,
        "cancelled" => WorkerStatus::Cancelled,
        _ => WorkerStatus::Failed,
    }
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    path: String,
    created_at: i64,
    updated_at: i64,
}

impl ProjectRow {
    fn into_project(self) -> Project {
        Project {
            id: Id::from_string(self.id),
            name: self.name,
            path: self.path,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct SpecRow {
    id: String,
    project_id: String,
    title: String,
    content: String,
    status: String,
    branch_name: Option<String>,
    pr_number: Option<i64>,
    pr_url: Option<String>,
    version: i64,
    error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl SpecRow {
    fn into_spec(self) -> Spec {
        Spec {
            id: Id::from_string(self.id),
            project_id: Id::from_string(self.project_id),
            title: self.title,
            content: self.content,
            status: parse_spec_status(&self.status),
            branch_name: self.branch_name,
            pr_number: self.pr_number,
            pr_url: self.pr_url,
            version: self.version,
            error: self.error,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChunkRow {
    id: String,
    spec_id: String,
    title: String,
    description: String,
    ordinal: i64,
    status: String,
    output: Option<String>,
    error: Option<String>,
    review_status: Option<String>,
    review_feedback: Option<String>,
    depends_on: String,
    parent_chunk_id: Option<String>,
    commit_hash: Option<String>,
    attempts: i64,
    created_at: i64,
    updated_at: i64,
}

impl ChunkRow {
    fn into_chunk(self) -> Result<Chunk> {
        let depends_on: Vec<Id> = serde_json::from_str(&self.depends_on)?;
        Ok(Chunk {
            id: Id::from_string(self.id),
            spec_id: Id::from_string(self.spec_id),
            title: self.title,
            description: self.description,
            ordinal: self.ordinal,
            status: parse_chunk_status(&self.status),
            output: self.output,
            error: self.error,
            review_status: self.review_status.as_deref().map(parse_review_status),
            review_feedback: self.review_feedback,
            depends_on,
            parent_chunk_id: self.parent_chunk_id.map(Id::from_string),
            commit_hash: self.commit_hash,
            attempts: self.attempts,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ToolCallRow {
    id: String,
    chunk_id: String,
    call_id: String,
    name: String,
    input: String,
    status: String,
    output: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl ToolCallRow {
    fn into_tool_call(self) -> Result<ToolCall> {
        Ok(ToolCall {
            id: Id::from_string(self.id),
            chunk_id: Id::from_string(self.chunk_id),
            call_id: self.call_id,
            name: self.name,
            input: serde_json::from_str(&self.input)?,
            status: parse_tool_call_status(&self.status),
            output: self
                .output
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct QueueItemRow {
    id: String,
    spec_id: String,
    project_id: String,
    priority: i64,
    enqueued_at: i64,
}

impl QueueItemRow {
    fn into_item(self) -> QueueItem {
        QueueItem {
            id: Id::from_string(self.id),
            spec_id: Id::from_string(self.spec_id),
            project_id: Id::from_string(self.project_id),
            priority: self.priority,
            enqueued_at: DateTime::from_timestamp_millis(self.enqueued_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    id: String,
    spec_id: String,
    status: String,
    current_chunk_id: Option<String>,
    error: Option<String>,
    started_at: i64,
    updated_at: i64,
}

impl WorkerRow {
    fn into_worker(self) -> Worker {
        Worker {
            id: Id::from_string(self.id),
            spec_id: Id::from_string(self.spec_id),
            status: parse_worker_status(&self.status),
            current_chunk_id: self.current_chunk_id.map(Id::from_string),
            error: self.error,
            started_at: DateTime::from_timestamp_millis(self.started_at).unwrap_or_default(),
            updated_at: DateTime::from_timestamp_millis(self.updated_at).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReviewLogRow {
    id: String,
    chunk_id: String,
    status: String,
    feedback: Option<String>,
    model: String,
    duration_ms: i64,
    created_at: i64,
}

impl ReviewLogRow {
    fn into_log(self) -> ReviewLog {
        ReviewLog {
            id: Id::from_string(self.id),
            chunk_id: Id::from_string(self.chunk_id),
            status: parse_review_status(&self.status),
            feedback: self.feedback,
            model: self.model,
            duration_ms: self.duration_ms,
            created_at: DateTime::from_timestamp_millis(self.created_at).unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir, // Keep alive to prevent cleanup
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage { storage, _dir: dir }
    }

    fn test_project() -> Project {
        let now = Utc::now();
        Project {
            id: Id::new(),
            name: "test-project".to_string(),
            path: "/workspace".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn test_spec(project_id: &Id) -> Spec {
        let now = Utc::now();
        Spec {
            id: Id::new(),
            project_id: project_id.clone(),
            title: "Test Spec".to_string(),
            content: "# spec".to_string(),
            status: SpecStatus::Ready,
            branch_name: None,
            pr_number: None,
            pr_url: None,
            version: 1,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_chunk(spec_id: &Id, ordinal: i64) -> Chunk {
        let now = Utc::now();
        Chunk {
            id: Id::new(),
            spec_id: spec_id.clone(),
            title: format!("chunk-{ordinal}"),
            description: "do the thing".to_string(),
            ordinal,
            status: ChunkStatus::Pending,
            output: None,
            error: None,
            review_status: None,
            review_feedback: None,
            depends_on: Vec::new(),
            parent_chunk_id: None,
            commit_hash: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    async fn seed_spec(ts: &TestStorage) -> Spec {
        let project = test_project();
        ts.storage.create_project(&project).await.unwrap();
        let spec = test_spec(&project.id);
        ts.storage.insert_spec(&spec).await.unwrap();
        spec
    }

    #[tokio::test]
    async fn insert_and_get_spec() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        let retrieved = ts.storage.get_spec(&spec.id).await.unwrap();
        assert_eq!(retrieved.id, spec.id);
        assert_eq!(retrieved.title, "Test Spec");
        assert_eq!(retrieved.status, SpecStatus::Ready);
        assert_eq!(retrieved.version, 1);
    }

    #[tokio::test]
    async fn update_spec_content_bumps_version() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        ts.storage
            .update_spec_content(&spec.id, "# new body")
            .await
            .unwrap();
        let updated = ts.storage.get_spec(&spec.id).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.content, "# new body");
    }

    #[tokio::test]
    async fn delete_project_cascades() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;
        let chunk = test_chunk(&spec.id, 0);
        ts.storage.create_chunk(&chunk).await.unwrap();

        ts.storage.delete_project(&spec.project_id).await.unwrap();

        assert!(matches!(
            ts.storage.get_spec(&spec.id).await,
            Err(StorageError::SpecNotFound(_))
        ));
        assert!(matches!(
            ts.storage.get_chunk(&chunk.id).await,
            Err(StorageError::ChunkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn chunks_ordered_by_ordinal() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        for ordinal in [2, 0, 1] {
            ts.storage
                .create_chunk(&test_chunk(&spec.id, ordinal))
                .await
                .unwrap();
        }

        let chunks = ts.storage.get_chunks_by_spec(&spec.id).await.unwrap();
        let ordinals: Vec<i64> = chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn create_chunk_rejects_cycle() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        let a = test_chunk(&spec.id, 0);
        ts.storage.create_chunk(&a).await.unwrap();

        let mut b = test_chunk(&spec.id, 1);
        b.depends_on = vec![a.id.clone()];
        ts.storage.create_chunk(&b).await.unwrap();

        // Self-dependency.
        let mut c = test_chunk(&spec.id, 2);
        c.depends_on = vec![c.id.clone()];
        assert!(matches!(
            ts.storage.create_chunk(&c).await,
            Err(StorageError::InvariantViolation(_))
        ));

        // Unknown dependency (cross-spec by construction).
        let mut d = test_chunk(&spec.id, 3);
        d.depends_on = vec![Id::new()];
        assert!(matches!(
            ts.storage.create_chunk(&d).await,
            Err(StorageError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn update_chunk_applies_patch() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;
        let chunk = test_chunk(&spec.id, 0);
        ts.storage.create_chunk(&chunk).await.unwrap();

        let updated = ts
            .storage
            .update_chunk(
                &chunk.id,
                ChunkPatch {
                    status: Some(ChunkStatus::Completed),
                    output: Some("done".to_string()),
                    commit_hash: Some("abc1234".to_string()),
                    ..ChunkPatch::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, ChunkStatus::Completed);
        assert_eq!(updated.output.as_deref(), Some("done"));
        assert_eq!(updated.commit_hash.as_deref(), Some("abc1234"));
        // Unpatched fields untouched.
        assert_eq!(updated.attempts, 0);
    }

    #[tokio::test]
    async fn update_chunk_publishes_change() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;
        let chunk = test_chunk(&spec.id, 0);
        let mut rx = ts.storage.subscribe_changes();
        ts.storage.create_chunk(&chunk).await.unwrap();

        let change = rx.recv().await.unwrap();
        assert_eq!(change.chunk_id, chunk.id);
        assert_eq!(change.status, ChunkStatus::Pending);

        ts.storage
            .update_chunk(
                &chunk.id,
                ChunkPatch {
                    status: Some(ChunkStatus::Running),
                    ..ChunkPatch::default()
                },
            )
            .await
            .unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.status, ChunkStatus::Running);
    }

    #[tokio::test]
    async fn reorder_chunks_is_total() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        let mut ids = Vec::new();
        for ordinal in 0..4 {
            let chunk = test_chunk(&spec.id, ordinal);
            ids.push(chunk.id.clone());
            ts.storage.create_chunk(&chunk).await.unwrap();
        }

        ids.reverse();
        ts.storage.reorder_chunks(&spec.id, &ids).await.unwrap();

        let chunks = ts.storage.get_chunks_by_spec(&spec.id).await.unwrap();
        let got: Vec<Id> = chunks.into_iter().map(|c| c.id).collect();
        assert_eq!(got, ids);
    }

    #[tokio::test]
    async fn reorder_rejects_partial_id_set() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        let a = test_chunk(&spec.id, 0);
        let b = test_chunk(&spec.id, 1);
        ts.storage.create_chunk(&a).await.unwrap();
        ts.storage.create_chunk(&b).await.unwrap();

        let result = ts.storage.reorder_chunks(&spec.id, &[a.id.clone()]).await;
        assert!(matches!(result, Err(StorageError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn insert_fix_chunk_links_parent() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        let dep = test_chunk(&spec.id, 0);
        ts.storage.create_chunk(&dep).await.unwrap();
        let mut parent = test_chunk(&spec.id, 1);
        parent.depends_on = vec![dep.id.clone()];
        ts.storage.create_chunk(&parent).await.unwrap();

        let fix = ts
            .storage
            .insert_fix_chunk(&parent.id, "Fix: chunk-1", "address review feedback", None)
            .await
            .unwrap();

        assert_eq!(fix.parent_chunk_id.as_ref(), Some(&parent.id));
        assert_eq!(fix.ordinal, parent.ordinal);
        assert_eq!(fix.depends_on, vec![dep.id.clone()]);
        assert_eq!(fix.status, ChunkStatus::Pending);
    }

    #[tokio::test]
    async fn tool_calls_retrieved_in_insertion_order() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;
        let chunk = test_chunk(&spec.id, 0);
        ts.storage.create_chunk(&chunk).await.unwrap();

        for i in 0..3 {
            let now = Utc::now();
            let call = ToolCall {
                id: Id::new(),
                chunk_id: chunk.id.clone(),
                call_id: format!("call-{i}"),
                name: "bash".to_string(),
                input: serde_json::json!({"command": format!("step {i}")}),
                status: ToolCallStatus::Pending,
                output: None,
                created_at: now,
                updated_at: now,
            };
            ts.storage.insert_tool_call(&call).await.unwrap();
        }

        let calls = ts.storage.get_tool_calls_by_chunk(&chunk.id).await.unwrap();
        let call_ids: Vec<String> = calls.iter().map(|c| c.call_id.clone()).collect();
        assert_eq!(call_ids, vec!["call-0", "call-1", "call-2"]);
    }

    #[tokio::test]
    async fn terminal_tool_call_is_append_only() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;
        let chunk = test_chunk(&spec.id, 0);
        ts.storage.create_chunk(&chunk).await.unwrap();

        let now = Utc::now();
        let call = ToolCall {
            id: Id::new(),
            chunk_id: chunk.id.clone(),
            call_id: "call-1".to_string(),
            name: "edit".to_string(),
            input: serde_json::json!({}),
            status: ToolCallStatus::Running,
            output: None,
            created_at: now,
            updated_at: now,
        };
        ts.storage.insert_tool_call(&call).await.unwrap();

        ts.storage
            .update_tool_call(&chunk.id, "call-1", ToolCallStatus::Completed, None)
            .await
            .unwrap();

        let result = ts
            .storage
            .update_tool_call(&chunk.id, "call-1", ToolCallStatus::Error, None)
            .await;
        assert!(matches!(result, Err(StorageError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn close_open_tool_calls_errors_them() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;
        let chunk = test_chunk(&spec.id, 0);
        ts.storage.create_chunk(&chunk).await.unwrap();

        let now = Utc::now();
        for (i, status) in [
            ToolCallStatus::Pending,
            ToolCallStatus::Running,
            ToolCallStatus::Completed,
        ]
        .iter()
        .enumerate()
        {
            let call = ToolCall {
                id: Id::new(),
                chunk_id: chunk.id.clone(),
                call_id: format!("call-{i}"),
                name: "bash".to_string(),
                input: serde_json::json!({}),
                status: *status,
                output: None,
                created_at: now,
                updated_at: now,
            };
            ts.storage.insert_tool_call(&call).await.unwrap();
        }

        let closed = ts.storage.close_open_tool_calls(&chunk.id).await.unwrap();
        assert_eq!(closed, 2);

        let calls = ts.storage.get_tool_calls_by_chunk(&chunk.id).await.unwrap();
        assert!(calls
            .iter()
            .all(|c| matches!(c.status, ToolCallStatus::Completed | ToolCallStatus::Error)));
    }

    #[tokio::test]
    async fn queue_items_ordered_by_priority_then_age() {
        let ts = create_test_storage().await;
        let project = test_project();
        ts.storage.create_project(&project).await.unwrap();

        for (i, priority) in [1i64, 5, 3].iter().enumerate() {
            let spec = test_spec(&project.id);
            ts.storage.insert_spec(&spec).await.unwrap();
            let item = QueueItem {
                id: Id::new(),
                spec_id: spec.id,
                project_id: project.id.clone(),
                priority: *priority,
                enqueued_at: DateTime::from_timestamp_millis(1_700_000_000_000 + i as i64)
                    .unwrap(),
            };
            ts.storage.enqueue_item(&item).await.unwrap();
        }

        let items = ts.storage.list_queue_items().await.unwrap();
        let priorities: Vec<i64> = items.iter().map(|i| i.priority).collect();
        assert_eq!(priorities, vec![5, 3, 1]);
    }

    #[tokio::test]
    async fn enqueue_is_unique_per_spec() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        let item = QueueItem {
            id: Id::new(),
            spec_id: spec.id.clone(),
            project_id: spec.project_id.clone(),
            priority: 1,
            enqueued_at: Utc::now(),
        };
        ts.storage.enqueue_item(&item).await.unwrap();

        let again = QueueItem {
            id: Id::new(),
            priority: 9,
            ..item
        };
        ts.storage.enqueue_item(&again).await.unwrap();

        let items = ts.storage.list_queue_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].priority, 9);
    }

    #[tokio::test]
    async fn one_live_worker_per_spec() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        let now = Utc::now();
        let worker = Worker {
            id: Id::new(),
            spec_id: spec.id.clone(),
            status: WorkerStatus::Running,
            current_chunk_id: None,
            error: None,
            started_at: now,
            updated_at: now,
        };
        ts.storage.insert_worker(&worker).await.unwrap();

        let duplicate = Worker {
            id: Id::new(),
            ..worker.clone()
        };
        assert!(matches!(
            ts.storage.insert_worker(&duplicate).await,
            Err(StorageError::InvariantViolation(_))
        ));

        // A terminal worker frees the spec.
        ts.storage
            .update_worker(&worker.id, WorkerStatus::Completed, None, None)
            .await
            .unwrap();
        ts.storage.insert_worker(&duplicate).await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_marks_live_workers_failed() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;

        let now = Utc::now();
        let worker = Worker {
            id: Id::new(),
            spec_id: spec.id.clone(),
            status: WorkerStatus::Running,
            current_chunk_id: None,
            error: None,
            started_at: now,
            updated_at: now,
        };
        ts.storage.insert_worker(&worker).await.unwrap();

        let fixed = ts.storage.reconcile_interrupted_workers().await.unwrap();
        assert_eq!(fixed, 1);
        assert!(ts
            .storage
            .get_live_worker(&spec.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn review_logs_round_trip() {
        let ts = create_test_storage().await;
        let spec = seed_spec(&ts).await;
        let chunk = test_chunk(&spec.id, 0);
        ts.storage.create_chunk(&chunk).await.unwrap();

        let log = ReviewLog {
            id: Id::new(),
            chunk_id: chunk.id.clone(),
            status: ReviewStatus::NeedsFix,
            feedback: Some("missing tests".to_string()),
            model: "claude-sonnet-4".to_string(),
            duration_ms: 1234,
            created_at: Utc::now(),
        };
        ts.storage.insert_review_log(&log).await.unwrap();

        let logs = ts.storage.list_review_logs(&chunk.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ReviewStatus::NeedsFix);
        assert_eq!(logs[0].feedback.as_deref(), Some("missing tests"));
    }

    #[tokio::test]
    async fn migrate_embedded_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        storage.migrate_embedded().await.unwrap();

        let project = test_project();
        storage.create_project(&project).await.unwrap();
    }
}
