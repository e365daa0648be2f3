//! End-to-end scenarios against a stub executor backend, a scripted
//! reviewer CLI, and throwaway git repositories.

use chrono::Utc;
use spec_core::{
    Chunk, ChunkStatus, Config, Id, Project, ReviewStatus, Spec, SpecStatus, WorkerStatus,
};
use specd::events::EventHub;
use specd::executor::ExecutorClient;
use specd::orchestrator::Orchestrator;
use specd::pipeline::{ChunkPipeline, PipelineConfig};
use specd::reviewer::ReviewerClient;
use specd::sequencer::{SequencerConfig, SpecSequencer};
use specd::service::SpecService;
use specd::storage::Storage;
use specd::workspace::GitWorkspace;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

// --- Stub executor backend ---
//
// A minimal HTTP server speaking just enough of the executor protocol:
// session creation, prompt_async, abort, message readback, and the global
// SSE event feed. Prompt text drives behavior:
//   - contains "HANG": no events are emitted (the session never goes idle)
//   - contains "boom": the session reports an error status
//   - otherwise: a file is written into the session directory, then a text
//     part and session.idle are emitted.

struct StubExecutor {
    endpoint: String,
}

impl StubExecutor {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let events = Arc::new(broadcast::channel::<String>(256).0);
        let counter = Arc::new(AtomicU64::new(0));

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let events = Arc::clone(&events);
                let counter = Arc::clone(&counter);
                tokio::spawn(handle_connection(stream, events, counter));
            }
        });

        Self {
            endpoint: format!("http://{addr}"),
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    events: Arc<broadcast::Sender<String>>,
    counter: Arc<AtomicU64>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let mut head = String::new();
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
            if line == "\r\n" || line == "\n" {
                break;
            }
            head.push_str(&line);
        }

        let request_line = head.lines().next().unwrap_or("").to_string();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let target = parts.next().unwrap_or("").to_string();

        let content_length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        let mut body = vec![0u8; content_length];
        if content_length > 0 && reader.read_exact(&mut body).await.is_err() {
            return;
        }

        if method == "GET" && target == "/global/event" {
            let header = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n";
            if write_half.write_all(header.as_bytes()).await.is_err() {
                return;
            }
            let mut rx = events.subscribe();
            while let Ok(frame) = rx.recv().await {
                if write_half.write_all(frame.as_bytes()).await.is_err() {
                    return;
                }
            }
            return;
        }

        let (status_line, response_body) =
            route(&method, &target, &body, &events, &counter);
        let response = format!(
            "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{response_body}",
            response_body.len()
        );
        if write_half.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn route(
    method: &str,
    target: &str,
    body: &[u8],
    events: &Arc<broadcast::Sender<String>>,
    counter: &Arc<AtomicU64>,
) -> (String, String) {
    let ok = "HTTP/1.1 200 OK".to_string();
    let path = target.split('?').next().unwrap_or(target);

    if method == "GET" && path == "/global/health" {
        return (ok, r#"{"healthy":true,"version":"stub"}"#.to_string());
    }
    if method == "POST" && path == "/session" {
        let id = counter.fetch_add(1, Ordering::SeqCst) + 1;
        return (ok, format!(r#"{{"id":"sess-{id}"}}"#));
    }
    if method == "GET" && path.ends_with("/status") {
        return (ok, r#"{"status":"idle"}"#.to_string());
    }
    if method == "POST" && path.ends_with("/abort") {
        return (ok, "{}".to_string());
    }
    if method == "DELETE" && path.starts_with("/session/") {
        return (ok, "{}".to_string());
    }
    if method == "GET" && path.ends_with("/message") {
        return (
            ok,
            r#"[{"role":"assistant","parts":[{"type":"text","text":"Implemented the task."}]}]"#
                .to_string(),
        );
    }
    if method == "POST" && path.ends_with("/prompt_async") {
        let session_id = path
            .trim_start_matches("/session/")
            .trim_end_matches("/prompt_async")
            .to_string();
        let directory = target
            .split_once("directory=")
            .map(|(_, d)| urlencoding::decode(d).unwrap_or_default().to_string())
            .unwrap_or_default();
        let text = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("parts")?
                    .get(0)?
                    .get("text")
                    .and_then(|t| t.as_str().map(String::from))
            })
            .unwrap_or_default();

        let events = Arc::clone(events);
        tokio::spawn(async move {
            // Wait until the event feed is attached before emitting.
            for _ in 0..100 {
                if events.receiver_count() > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;

            if text.contains("HANG") {
                return;
            }
            if text.contains("boom") {
                let _ = events.send(format!(
                    "data: {{\"payload\":{{\"type\":\"session.status\",\"properties\":{{\"sessionID\":\"{session_id}\",\"status\":\"error\"}}}}}}\n\n"
                ));
                return;
            }

            // Simulate the executor editing the working tree.
            if !directory.is_empty() {
                let _ = std::fs::write(
                    Path::new(&directory).join(format!("{session_id}.txt")),
                    "generated",
                );
            }
            let _ = events.send(format!(
                "data: {{\"payload\":{{\"type\":\"message.part.updated\",\"properties\":{{\"part\":{{\"sessionID\":\"{session_id}\",\"type\":\"text\",\"text\":\"Implemented the task.\"}}}}}}}}\n\n"
            ));
            let _ = events.send(format!(
                "data: {{\"payload\":{{\"type\":\"session.idle\",\"properties\":{{\"sessionID\":\"{session_id}\"}}}}}}\n\n"
            ));
        });

        return ("HTTP/1.1 204 No Content".to_string(), String::new());
    }

    ("HTTP/1.1 404 Not Found".to_string(), "{}".to_string())
}

// --- Scripted reviewers ---

#[cfg(unix)]
fn write_script(dir: &Path, name: &str, content: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

#[cfg(unix)]
fn pass_reviewer(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "pass-reviewer",
        r#"#!/bin/sh
echo '{"type":"assistant","subtype":"content_block_delta","delta":{"type":"text_delta","text":"{\"status\": \"pass\", \"feedback\": \"looks good\"}"}}'
echo '{"type":"result","total_cost_usd":0.01,"input_tokens":10,"output_tokens":5}'
exit 0
"#,
    )
}

/// Reviewer that requests a fix on its first call and passes afterwards.
#[cfg(unix)]
fn flip_reviewer(dir: &Path) -> PathBuf {
    let state = dir.join("flip-state");
    let content = format!(
        r#"#!/bin/sh
if [ -f "{state}" ]; then
  echo '{{"type":"assistant","subtype":"content_block_delta","delta":{{"type":"text_delta","text":"{{\"status\": \"pass\", \"feedback\": \"fixed\"}}"}}}}'
else
  touch "{state}"
  echo '{{"type":"assistant","subtype":"content_block_delta","delta":{{"type":"text_delta","text":"{{\"status\": \"needs_fix\", \"feedback\": \"missing edge case\", \"fixChunk\": {{\"title\": \"Handle the edge case\", \"description\": \"Cover the empty input path\"}}}}"}}}}'
fi
exit 0
"#,
        state = state.display()
    );
    write_script(dir, "flip-reviewer", &content)
}

// --- Harness ---

struct Harness {
    storage: Arc<Storage>,
    service: Arc<SpecService>,
    orchestrator: Arc<Orchestrator>,
    hub: Arc<EventHub>,
    project: Project,
    repo: PathBuf,
    _dir: TempDir,
}

fn setup_repo(container: &Path) -> PathBuf {
    let repo = container.join("project");
    std::fs::create_dir_all(&repo).unwrap();
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test"],
    ] {
        Command::new("git")
            .args(&args)
            .current_dir(&repo)
            .output()
            .unwrap();
    }
    std::fs::write(repo.join("README.md"), "# Test").unwrap();
    Command::new("git")
        .args(["add", "."])
        .current_dir(&repo)
        .output()
        .unwrap();
    Command::new("git")
        .args(["commit", "-m", "Initial commit"])
        .current_dir(&repo)
        .output()
        .unwrap();
    repo
}

async fn harness(
    executor_endpoint: &str,
    reviewer_path: &Path,
    max_concurrency: usize,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let repo = setup_repo(dir.path());

    let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let storage = Arc::new(storage);

    let mut config = Config::default();
    config.executor.endpoint = executor_endpoint.to_string();
    config.reviewer.cli_path = reviewer_path.to_string_lossy().to_string();
    config.max_concurrency = max_concurrency;

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
        sequencer,
        Arc::clone(&hub),
        config.max_concurrency,
    );
    let service = SpecService::new(
        Arc::clone(&storage),
        Arc::clone(&orchestrator),
        Arc::clone(&hub),
        pipeline,
        reviewer,
        workspace,
        config,
    );

    let now = Utc::now();
    let project = Project {
        id: Id::new(),
        name: "test-project".to_string(),
        path: repo.to_string_lossy().to_string(),
        created_at: now,
        updated_at: now,
    };
    storage.create_project(&project).await.unwrap();

    Harness {
        storage,
        service,
        orchestrator,
        hub,
        project,
        repo,
        _dir: dir,
    }
}

impl Harness {
    async fn create_spec(&self, title: &str) -> Spec {
        let now = Utc::now();
        let spec = Spec {
            id: Id::new(),
            project_id: self.project.id.clone(),
            title: title.to_string(),
            content: format!("# {title}"),
            status: SpecStatus::Ready,
            branch_name: None,
            pr_number: None,
            pr_url: None,
            version: 1,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_spec(&spec).await.unwrap();
        spec
    }

    async fn create_chunk(
        &self,
        spec: &Spec,
        title: &str,
        description: &str,
        ordinal: i64,
        depends_on: Vec<Id>,
    ) -> Chunk {
        let now = Utc::now();
        let chunk = Chunk {
            id: Id::new(),
            spec_id: spec.id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            ordinal,
            status: ChunkStatus::Pending,
            output: None,
            error: None,
            review_status: None,
            review_feedback: None,
            depends_on,
            parent_chunk_id: None,
            commit_hash: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        };
        self.storage.create_chunk(&chunk).await.unwrap();
        chunk
    }

    async fn wait_for_spec_terminal(&self, spec_id: &Id, timeout: Duration) -> Spec {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let spec = self.storage.get_spec(spec_id).await.unwrap();
            if matches!(
                spec.status,
                SpecStatus::Completed | SpecStatus::Review | SpecStatus::Failed
            ) && self.storage.get_live_worker(spec_id).await.unwrap().is_none()
            {
                return spec;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "spec {spec_id} did not reach a terminal state in time (status {})",
                spec.status.as_str()
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn commits_on_branch(&self, branch: &str) -> usize {
        let output = Command::new("git")
            .args(["rev-list", "--count", &format!("main..{branch}")])
            .current_dir(&self.repo)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .unwrap_or(0)
    }
}

// --- Scenarios ---

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn sequential_happy_path() {
    let stub = StubExecutor::start().await;
    let scripts = TempDir::new().unwrap();
    let reviewer = pass_reviewer(scripts.path());
    let h = harness(&stub.endpoint, &reviewer, 3).await;

    let spec = h.create_spec("Happy Path").await;
    let a = h.create_chunk(&spec, "chunk-a", "Write the first part", 0, vec![]).await;
    let b = h
        .create_chunk(&spec, "chunk-b", "Write the second part", 1, vec![a.id.clone()])
        .await;
    let c = h
        .create_chunk(&spec, "chunk-c", "Write the third part", 2, vec![b.id.clone()])
        .await;

    let mut sub = h.hub.subscribe(&spec.id);

    let response = h.service.start_spec(&spec.id).await.unwrap();
    assert!(response.accepted);

    let done = h.wait_for_spec_terminal(&spec.id, Duration::from_secs(60)).await;
    // No origin remote, so push fails non-fatally and no PR opens.
    assert_eq!(done.status, SpecStatus::Completed);

    let chunks = h.storage.get_chunks_by_spec(&spec.id).await.unwrap();
    assert_eq!(chunks.len(), 3);
    for chunk in &chunks {
        assert_eq!(chunk.status, ChunkStatus::Completed, "chunk {}", chunk.title);
        assert!(chunk.commit_hash.is_some(), "chunk {}", chunk.title);
        assert_eq!(chunk.review_status, Some(ReviewStatus::Pass));
    }

    // Three commits landed on the spec branch; worktree retained.
    let branch = done.branch_name.clone().unwrap();
    assert_eq!(h.commits_on_branch(&branch), 3);
    assert!(GitWorkspace::worktree_path(&h.repo, &spec.id).exists());

    // Chunks started in dependency order.
    let mut start_order = Vec::new();
    while let Ok(event) = sub.rx.try_recv() {
        if let spec_core::EventPayload::ChunkStart(payload) = event.payload {
            start_order.push(payload.chunk_id);
        }
    }
    assert_eq!(start_order, vec![a.id, b.id, c.id]);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn dependency_block_on_failed_predecessor() {
    let stub = StubExecutor::start().await;
    let scripts = TempDir::new().unwrap();
    let reviewer = pass_reviewer(scripts.path());
    let h = harness(&stub.endpoint, &reviewer, 3).await;

    let spec = h.create_spec("Blocked Spec").await;
    let a = h.create_chunk(&spec, "chunk-a", "Write the groundwork", 0, vec![]).await;
    // "boom" makes the stub executor report a session error.
    let b = h
        .create_chunk(&spec, "chunk-b", "boom", 1, vec![a.id.clone()])
        .await;
    let c = h
        .create_chunk(&spec, "chunk-c", "Write the follow-up", 2, vec![b.id.clone()])
        .await;

    h.service.start_spec(&spec.id).await.unwrap();
    let done = h.wait_for_spec_terminal(&spec.id, Duration::from_secs(60)).await;
    assert_eq!(done.status, SpecStatus::Failed);

    let chunk_a = h.storage.get_chunk(&a.id).await.unwrap();
    assert_eq!(chunk_a.status, ChunkStatus::Completed);
    assert!(chunk_a.commit_hash.is_some());

    let chunk_b = h.storage.get_chunk(&b.id).await.unwrap();
    assert_eq!(chunk_b.status, ChunkStatus::Failed);

    let chunk_c = h.storage.get_chunk(&c.id).await.unwrap();
    assert_eq!(chunk_c.status, ChunkStatus::Failed);
    assert_eq!(chunk_c.error.as_deref(), Some("dependency blocked"));

    // A's commit still landed on the branch.
    let branch = done.branch_name.unwrap();
    assert_eq!(h.commits_on_branch(&branch), 1);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn needs_fix_loop_converges() {
    let stub = StubExecutor::start().await;
    let scripts = TempDir::new().unwrap();
    let reviewer = flip_reviewer(scripts.path());
    let h = harness(&stub.endpoint, &reviewer, 3).await;

    let spec = h.create_spec("Fix Loop").await;
    let x = h.create_chunk(&spec, "chunk-x", "Write the feature", 0, vec![]).await;

    h.service.start_spec(&spec.id).await.unwrap();
    let done = h.wait_for_spec_terminal(&spec.id, Duration::from_secs(60)).await;
    assert_eq!(done.status, SpecStatus::Completed);

    let chunks = h.storage.get_chunks_by_spec(&spec.id).await.unwrap();
    assert_eq!(chunks.len(), 2);

    let parent = chunks.iter().find(|c| c.id == x.id).unwrap();
    assert_eq!(parent.status, ChunkStatus::NeedsFix);
    assert_eq!(parent.review_status, Some(ReviewStatus::NeedsFix));
    assert!(parent.commit_hash.is_none());
    assert_eq!(parent.attempts, 1);

    let fix = chunks.iter().find(|c| c.id != x.id).unwrap();
    assert_eq!(fix.status, ChunkStatus::Completed);
    assert_eq!(fix.parent_chunk_id.as_ref(), Some(&x.id));
    assert_eq!(fix.title, "Handle the edge case");
    assert!(fix.commit_hash.is_some());

    // Exactly one commit: the fix chunk's, carrying the parent's work.
    let branch = done.branch_name.unwrap();
    assert_eq!(h.commits_on_branch(&branch), 1);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn queue_saturation_dispatches_by_priority() {
    let stub = StubExecutor::start().await;
    let scripts = TempDir::new().unwrap();
    let reviewer = pass_reviewer(scripts.path());
    let h = harness(&stub.endpoint, &reviewer, 3).await;

    // Six specs whose single chunk hangs in execution.
    let mut specs = Vec::new();
    for i in 1..=6i64 {
        let spec = h.create_spec(&format!("Queued Spec {i}")).await;
        h.create_chunk(&spec, "chunk", "HANG", 0, vec![]).await;
        specs.push(spec);
    }

    // Enqueue all six "at the same instant": seed the persisted queue
    // first, then let boot-time dispatch drain it in priority order.
    for (i, spec) in specs.iter().enumerate() {
        let item = spec_core::QueueItem {
            id: Id::new(),
            spec_id: spec.id.clone(),
            project_id: h.project.id.clone(),
            priority: (i + 1) as i64,
            enqueued_at: Utc::now(),
        };
        h.storage.enqueue_item(&item).await.unwrap();
    }
    h.orchestrator.start().await.unwrap();

    // The three highest-priority specs (6, 5, 4) get the worker slots.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = h.service.worker_stats().await;
        if stats.active == 3 && stats.queue_len == 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "saturation not reached");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for spec in &specs[3..] {
        assert!(h.orchestrator.is_running(&spec.id).await, "high priority spec should run");
    }
    for spec in &specs[..3] {
        assert!(!h.orchestrator.is_running(&spec.id).await, "low priority spec should wait");
    }

    // Drain: drop the queued specs first so they are not dispatched when
    // the running ones release their slots, then abort the running three.
    for spec in &specs[..3] {
        h.service.abort_spec(&spec.id).await.unwrap();
    }
    for spec in &specs[3..] {
        h.service.abort_spec(&spec.id).await.unwrap();
        let done = h.wait_for_spec_terminal(&spec.id, Duration::from_secs(15)).await;
        assert_eq!(done.status, SpecStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("aborted"));
    }

    let stats = h.service.worker_stats().await;
    assert_eq!(stats.active, 0);
    assert_eq!(stats.queue_len, 0);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn cancellation_mid_execution() {
    let stub = StubExecutor::start().await;
    let scripts = TempDir::new().unwrap();
    let reviewer = pass_reviewer(scripts.path());
    let h = harness(&stub.endpoint, &reviewer, 3).await;

    let spec = h.create_spec("Cancelled Spec").await;
    let chunk = h.create_chunk(&spec, "chunk", "HANG", 0, vec![]).await;

    h.service.start_spec(&spec.id).await.unwrap();

    // Wait until the chunk is actually executing.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let current = h.storage.get_chunk(&chunk.id).await.unwrap();
        if current.status == ChunkStatus::Running {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "chunk never started");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let abort_at = tokio::time::Instant::now();
    h.service.abort_spec(&spec.id).await.unwrap();

    let done = h.wait_for_spec_terminal(&spec.id, Duration::from_secs(10)).await;
    assert!(abort_at.elapsed() <= Duration::from_secs(10));
    assert_eq!(done.status, SpecStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("aborted"));

    let cancelled = h.storage.get_chunk(&chunk.id).await.unwrap();
    assert_eq!(cancelled.status, ChunkStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled"));
    assert!(cancelled.commit_hash.is_none());

    // Zero commits: the worktree was removed on cleanup.
    assert!(!GitWorkspace::worktree_path(&h.repo, &spec.id).exists());

    // Aborting a finished spec is a no-op success.
    h.service.abort_spec(&spec.id).await.unwrap();
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn direct_start_hits_capacity_sentinel() {
    let stub = StubExecutor::start().await;
    let scripts = TempDir::new().unwrap();
    let reviewer = pass_reviewer(scripts.path());
    let h = harness(&stub.endpoint, &reviewer, 1).await;

    let first = h.create_spec("Running Spec").await;
    h.create_chunk(&first, "chunk", "HANG", 0, vec![]).await;
    let second = h.create_spec("Waiting Spec").await;
    h.create_chunk(&second, "chunk", "HANG", 0, vec![]).await;

    assert!(h.service.start_spec(&first.id).await.unwrap().accepted);

    // A second direct start is told to enqueue instead.
    let response = h.service.start_spec(&second.id).await.unwrap();
    assert!(!response.accepted);
    assert_eq!(response.reason.as_deref(), Some("capacity"));

    // Restarting the running spec is rejected too.
    let response = h.service.start_spec(&first.id).await.unwrap();
    assert!(!response.accepted);

    h.service.abort_spec(&first.id).await.unwrap();
    h.wait_for_spec_terminal(&first.id, Duration::from_secs(15)).await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn worker_reconciled_after_restart() {
    let stub = StubExecutor::start().await;
    let scripts = TempDir::new().unwrap();
    let reviewer = pass_reviewer(scripts.path());
    let h = harness(&stub.endpoint, &reviewer, 3).await;

    let spec = h.create_spec("Interrupted Spec").await;
    let now = Utc::now();
    let worker = spec_core::Worker {
        id: Id::new(),
        spec_id: spec.id.clone(),
        status: WorkerStatus::Running,
        current_chunk_id: None,
        error: None,
        started_at: now,
        updated_at: now,
    };
    h.storage.insert_worker(&worker).await.unwrap();

    // Boot recovery marks the stale worker failed.
    h.orchestrator.start().await.unwrap();
    assert!(h.storage.get_live_worker(&spec.id).await.unwrap().is_none());
}
