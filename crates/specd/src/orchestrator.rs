//! The multi-spec orchestrator.
//!
//! Caps concurrently running workers at a configured bound and schedules
//! queued specs by (priority desc, enqueued-at asc). Dispatch happens on
//! enqueue and whenever a worker terminates. A sequencer outcome is always a
//! value; a worker failure is recorded, never propagated as a panic.

use crate::events::EventHub;
use crate::sequencer::{SpecRunOutcome, SpecSequencer};
use crate::storage::{Storage, StorageError};
use chrono::Utc;
use spec_core::{Id, QueueItem, SpecStatus, Worker, WorkerStats, WorkerStatus};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default maximum concurrent workers.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The capacity sentinel: callers should enqueue instead.
    #[error("at capacity ({0} workers running); enqueue the spec instead")]
    AtCapacity(usize),
    #[error("spec {0} already has a live worker")]
    AlreadyRunning(Id),
    #[error("spec {0} is merged; its chunks are not re-run")]
    Merged(Id),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Heap entry ordered by (priority desc, enqueued-at asc, spec id asc).
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i64,
    enqueued_at: i64,
    spec_id: Id,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.spec_id.cmp(&self.spec_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct WorkerHandle {
    worker_id: Id,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    queue: BinaryHeap<QueueEntry>,
    workers: HashMap<String, WorkerHandle>,
}

/// Process-wide orchestrator with explicit start/stop lifecycle.
#[derive(Debug)]
pub struct Orchestrator {
    storage: Arc<Storage>,
    sequencer: Arc<SpecSequencer>,
    hub: Arc<EventHub>,
    max_concurrency: usize,
    inner: Mutex<Inner>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        storage: Arc<Storage>,
        sequencer: Arc<SpecSequencer>,
        hub: Arc<EventHub>,
        max_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            sequencer,
            hub,
            max_concurrency,
            inner: Mutex::new(Inner::default()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Boot-time recovery: live workers from a previous process are marked
    /// failed, and persisted queue items are loaded back into the heap.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let reconciled = self.storage.reconcile_interrupted_workers().await?;
        if reconciled > 0 {
            warn!(count = reconciled, "reconciled workers from previous run");
        }

        let items = self.storage.list_queue_items().await?;
        let mut inner = self.inner.lock().await;
        for item in items {
            inner.queue.push(QueueEntry {
                priority: item.priority,
                enqueued_at: item.enqueued_at.timestamp_millis(),
                spec_id: item.spec_id,
            });
        }
        drop(inner);

        self.process_queue().await;
        Ok(())
    }

    /// Cancel all workers and stop dispatching.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let inner = self.inner.lock().await;
        for handle in inner.workers.values() {
            handle.cancel.cancel();
        }
    }

    pub async fn worker_stats(&self) -> WorkerStats {
        let inner = self.inner.lock().await;
        WorkerStats {
            active: inner.workers.len(),
            max: self.max_concurrency,
            queue_len: inner.queue.len(),
        }
    }

    /// Direct start, bypassing the queue. Fails with the capacity sentinel
    /// when no slot is free.
    pub async fn start_worker(self: &Arc<Self>, spec_id: &Id) -> Result<()> {
        let spec = self.storage.get_spec(spec_id).await?;
        if spec.status == SpecStatus::Merged {
            return Err(OrchestratorError::Merged(spec_id.clone()));
        }

        let mut inner = self.inner.lock().await;
        if inner.workers.contains_key(spec_id.as_ref()) {
            return Err(OrchestratorError::AlreadyRunning(spec_id.clone()));
        }
        if inner.workers.len() >= self.max_concurrency {
            return Err(OrchestratorError::AtCapacity(inner.workers.len()));
        }
        self.spawn_worker(&mut inner, spec_id).await?;
        Ok(())
    }

    /// Admit a spec to the queue (updating priority if already queued),
    /// then try to dispatch.
    pub async fn enqueue(self: &Arc<Self>, spec_id: &Id, priority: i64) -> Result<QueueItem> {
        let spec = self.storage.get_spec(spec_id).await?;
        if spec.status == SpecStatus::Merged {
            return Err(OrchestratorError::Merged(spec_id.clone()));
        }

        let item = QueueItem {
            id: Id::new(),
            spec_id: spec_id.clone(),
            project_id: spec.project_id.clone(),
            priority,
            enqueued_at: Utc::now(),
        };
        self.storage.enqueue_item(&item).await?;

        {
            let mut inner = self.inner.lock().await;
            // Unique per spec: replace any stale entry.
            inner.queue.retain(|e| e.spec_id != item.spec_id);
            inner.queue.push(QueueEntry {
                priority: item.priority,
                enqueued_at: item.enqueued_at.timestamp_millis(),
                spec_id: item.spec_id.clone(),
            });
        }

        info!(spec_id = %spec_id, priority, "spec enqueued");
        self.process_queue().await;
        Ok(item)
    }

    /// Abort a spec: cancel its worker if one is live, or drop it from the
    /// queue. A no-op for specs in terminal states.
    pub async fn abort_spec(&self, spec_id: &Id) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.workers.get(spec_id.as_ref()) {
            info!(spec_id = %spec_id, "aborting running spec");
            handle.cancel.cancel();
            return Ok(());
        }
        inner.queue.retain(|e| &e.spec_id != spec_id);
        drop(inner);
        let removed = self.storage.remove_queue_item(spec_id).await?;
        if removed {
            info!(spec_id = %spec_id, "dequeued spec on abort");
        }
        Ok(())
    }

    /// True when the spec currently holds a worker slot.
    pub async fn is_running(&self, spec_id: &Id) -> bool {
        let inner = self.inner.lock().await;
        inner.workers.contains_key(spec_id.as_ref())
    }

    /// Dispatch queued specs while capacity is free.
    ///
    /// Pops the head, re-verifies eligibility (the spec may have been
    /// deleted, merged, or started directly since it was queued), and starts
    /// a worker. Ineligible heads are discarded.
    pub async fn process_queue(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut inner = self.inner.lock().await;
        while inner.workers.len() < self.max_concurrency {
            let Some(entry) = inner.queue.pop() else {
                break;
            };

            if let Err(e) = self.storage.remove_queue_item(&entry.spec_id).await {
                warn!(spec_id = %entry.spec_id, error = %e, "failed to remove queue item");
            }

            let eligible = match self.storage.get_spec(&entry.spec_id).await {
                Ok(spec) => {
                    spec.status != SpecStatus::Merged
                        && !inner.workers.contains_key(entry.spec_id.as_ref())
                }
                Err(_) => false,
            };
            if !eligible {
                info!(spec_id = %entry.spec_id, "discarding ineligible queue entry");
                continue;
            }

            if let Err(e) = self.spawn_worker(&mut inner, &entry.spec_id).await {
                warn!(spec_id = %entry.spec_id, error = %e, "failed to dispatch queued spec");
            }
        }
    }

    /// Start a worker for a spec. The caller holds the inner lock and has
    /// verified capacity.
    async fn spawn_worker(self: &Arc<Self>, inner: &mut Inner, spec_id: &Id) -> Result<()> {
        let now = Utc::now();
        let worker = Worker {
            id: Id::new(),
            spec_id: spec_id.clone(),
            status: WorkerStatus::Running,
            current_chunk_id: None,
            error: None,
            started_at: now,
            updated_at: now,
        };
        // The storage insert enforces the one-live-worker-per-spec invariant
        // even against callers that bypassed this orchestrator.
        self.storage.insert_worker(&worker).await?;

        let cancel = self.shutdown.child_token();
        inner.workers.insert(
            spec_id.to_string(),
            WorkerHandle {
                worker_id: worker.id.clone(),
                cancel: cancel.clone(),
            },
        );

        info!(spec_id = %spec_id, worker_id = %worker.id, "worker started");

        let orchestrator = Arc::clone(self);
        let spec_id = spec_id.clone();
        let worker_id = worker.id;
        tokio::spawn(async move {
            let emitter = orchestrator.hub.emitter(&spec_id);
            let outcome = orchestrator
                .sequencer
                .run(&spec_id, Some(&worker_id), &emitter, &cancel)
                .await;

            let (status, error) = match &outcome {
                SpecRunOutcome::Completed => (WorkerStatus::Completed, None),
                SpecRunOutcome::Failed(reason) => (WorkerStatus::Failed, Some(reason.clone())),
                SpecRunOutcome::Cancelled => (WorkerStatus::Cancelled, None),
            };
            if let Err(e) = orchestrator
                .storage
                .update_worker(&worker_id, status, None, error.as_deref())
                .await
            {
                warn!(worker_id = %worker_id, error = %e, "failed to persist worker outcome");
            }
            info!(
                spec_id = %spec_id,
                worker_id = %worker_id,
                status = status.as_str(),
                "worker finished"
            );

            orchestrator.finish_worker(&spec_id).await;
        });

        Ok(())
    }

    /// Release a worker's slot and drain the queue.
    async fn finish_worker(self: &Arc<Self>, spec_id: &Id) {
        {
            let mut inner = self.inner.lock().await;
            inner.workers.remove(spec_id.as_ref());
        }
        self.process_queue().await;
    }
}
