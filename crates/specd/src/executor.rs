//! Streaming client for the long-running executor backend.
//!
//! The executor (an opencode server) exposes session lifecycle endpoints and
//! a single global SSE event feed. One background task owns the feed,
//! demultiplexes events by session id, and forwards them to per-session
//! subscribers. Transport drops reconnect with linear backoff; events missed
//! while reconnecting are recovered by re-reading the session's messages.

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use spec_core::ToolCallStatus;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reconnect attempts before the event feed gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Linear backoff unit between reconnect attempts.
const RECONNECT_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("executor not reachable at {addr}\n  → start the opencode server or point executor.endpoint at it")]
    ConnectionFailed { addr: String },
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ExecutorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ExecutorError::ConnectionFailed { addr }
        } else {
            ExecutorError::Http {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Session state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Busy,
    Idle,
    Error,
}

/// Executor health probe result.
#[derive(Debug, Clone)]
pub struct Health {
    pub healthy: bool,
    pub version: Option<String>,
}

/// A tool-call update carried on the event stream.
#[derive(Debug, Clone)]
pub struct ToolCallUpdate {
    pub call_id: String,
    pub name: String,
    pub status: ToolCallStatus,
    pub input: Value,
    pub output: Option<Value>,
}

/// Events delivered to a session subscriber, in stream order.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    Status(SessionStatus),
    ToolCall(ToolCallUpdate),
    Text(String),
    FileEdited(String),
    Idle,
    /// Event-feed connection state changed (false on drop, true on reconnect).
    Connection(bool),
}

/// Prompt payload for `send_prompt`.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub text: String,
    pub model: String,
    pub system_prompt: Option<String>,
}

type SessionSenders = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ExecutorEvent>>>>;

/// Subscription to one session's event stream.
///
/// Dropping the subscription unregisters it from the demultiplexer.
#[derive(Debug)]
pub struct SessionSubscription {
    session_id: String,
    pub rx: mpsc::UnboundedReceiver<ExecutorEvent>,
    senders: SessionSenders,
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(&self.session_id);
        }
    }
}

/// Typed client for the executor backend.
#[derive(Debug)]
pub struct ExecutorClient {
    base_url: String,
    http: reqwest::Client,
    senders: SessionSenders,
    feed: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ExecutorClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            base_url: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            senders: Arc::new(Mutex::new(HashMap::new())),
            feed: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    /// GET /global/health.
    pub async fn check_health(&self) -> Result<Health> {
        let url = format!("{}/global/health", self.base_url);
        let response = self.http.get(&url).send().await?;
        let healthy = response.status().is_success();
        let version = response
            .json::<Value>()
            .await
            .ok()
            .and_then(|v| v.get("version").and_then(Value::as_str).map(String::from));
        Ok(Health { healthy, version })
    }

    /// POST /session?directory=… — create a session rooted in `dir`.
    pub async fn create_session(&self, dir: &str, title: &str) -> Result<String> {
        let url = format!(
            "{}/session?directory={}",
            self.base_url,
            urlencoding::encode(dir)
        );
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        body.get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| ExecutorError::InvalidResponse("session response missing id".into()))
    }

    /// DELETE /session/{id}.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/session/{session_id}", self.base_url);
        self.http.delete(&url).send().await?.error_for_status()?;
        Ok(())
    }

    /// GET /session/{id}/status.
    pub async fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let url = format!("{}/session/{session_id}/status", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let status = body
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ExecutorError::InvalidResponse("status response missing status".into()))?;
        parse_session_status(status)
            .ok_or_else(|| ExecutorError::InvalidResponse(format!("unknown status {status}")))
    }

    /// POST /session/{id}/prompt_async — returns immediately with 204;
    /// results arrive on the event stream.
    pub async fn send_prompt(
        &self,
        session_id: &str,
        dir: &str,
        request: &PromptRequest,
    ) -> Result<()> {
        let url = format!(
            "{}/session/{session_id}/prompt_async?directory={}",
            self.base_url,
            urlencoding::encode(dir)
        );
        let mut body = serde_json::json!({
            "parts": [{ "type": "text", "text": request.text }],
            "model": request.model,
        });
        if let Some(system) = &request.system_prompt {
            body["systemPrompt"] = Value::String(system.clone());
        }

        let response = self.http.post(&url).json(&body).send().await?;
        if response.status().as_u16() != 204 && !response.status().is_success() {
            return Err(ExecutorError::Http {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// POST /session/{id}/abort.
    pub async fn abort_session(&self, session_id: &str) -> Result<()> {
        let url = format!("{}/session/{session_id}/abort", self.base_url);
        self.http.post(&url).send().await?.error_for_status()?;
        Ok(())
    }

    /// GET /session/{id}/message — the full message trail.
    pub async fn session_messages(&self, session_id: &str) -> Result<Vec<Value>> {
        let url = format!("{}/session/{session_id}/message", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match body {
            Value::Array(messages) => Ok(messages),
            other => Err(ExecutorError::InvalidResponse(format!(
                "expected message array, got {other}"
            ))),
        }
    }

    /// Subscribe to one session's slice of the global event feed.
    ///
    /// Starts the feed task on first use.
    pub fn subscribe(&self, session_id: &str) -> SessionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .expect("session sender lock poisoned")
            .insert(session_id.to_string(), tx);
        self.ensure_feed();
        SessionSubscription {
            session_id: session_id.to_string(),
            rx,
            senders: Arc::clone(&self.senders),
        }
    }

    /// Spawn the global SSE feed task if it is not already running.
    fn ensure_feed(&self) {
        let mut feed = self.feed.lock().expect("feed lock poisoned");
        if let Some(handle) = feed.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let base_url = self.base_url.clone();
        let http = self.http.clone();
        let senders = Arc::clone(&self.senders);
        *feed = Some(tokio::spawn(run_event_feed(base_url, http, senders)));
    }
}

/// The global event feed loop.
///
/// Connects to GET /global/event and dispatches frames until the transport
/// drops, then reconnects with linear backoff (1 s × attempt). After five
/// consecutive failures the feed stops; in-flight pipelines hit their own
/// stage timeouts and surface the failure from there.
async fn run_event_feed(base_url: String, http: reqwest::Client, senders: SessionSenders) {
    let url = format!("{base_url}/global/event");
    let mut attempt: u32 = 0;

    loop {
        match http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                attempt = 0;
                broadcast_connection(&senders, true);

                let mut buffer = String::new();
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            buffer.push_str(&String::from_utf8_lossy(&bytes));
                            for data in drain_sse_frames(&mut buffer) {
                                dispatch_frame(&senders, &data);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "executor event stream error");
                            break;
                        }
                    }
                }
                broadcast_connection(&senders, false);
            }
            Ok(response) => {
                warn!(status = %response.status(), "executor event feed rejected");
                broadcast_connection(&senders, false);
            }
            Err(e) => {
                warn!(error = %e, "executor event feed connect failed");
                broadcast_connection(&senders, false);
            }
        }

        attempt += 1;
        if attempt > MAX_RECONNECT_ATTEMPTS {
            warn!(
                attempts = MAX_RECONNECT_ATTEMPTS,
                "executor event feed giving up"
            );
            return;
        }
        tokio::time::sleep(RECONNECT_BACKOFF * attempt).await;
    }
}

fn broadcast_connection(senders: &SessionSenders, connected: bool) {
    if let Ok(senders) = senders.lock() {
        for tx in senders.values() {
            let _ = tx.send(ExecutorEvent::Connection(connected));
        }
    }
}

/// Pull complete `data: <json>` frames out of the SSE buffer.
///
/// Frames are separated by a blank line; the trailing partial frame stays in
/// the buffer for the next read.
fn drain_sse_frames(buffer: &mut String) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer.find("\n\n") {
        let frame: String = buffer.drain(..pos + 2).collect();
        let mut data = String::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
            }
        }
        if !data.is_empty() {
            frames.push(data);
        }
    }
    frames
}

fn dispatch_frame(senders: &SessionSenders, data: &str) {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        debug!(frame = %data, "dropping malformed SSE frame");
        return;
    };
    let Some((session_id, event)) = map_event(&value) else {
        debug!("dropping unrecognised SSE event");
        return;
    };
    if let Ok(senders) = senders.lock() {
        if let Some(tx) = senders.get(&session_id) {
            let _ = tx.send(event);
        }
    }
}

/// Map one decoded frame to a session-scoped event.
///
/// Frames carry `{payload: {type, properties}}`. Unknown types yield `None`
/// and are dropped by the caller.
fn map_event(value: &Value) -> Option<(String, ExecutorEvent)> {
    let payload = value.get("payload")?;
    let event_type = payload.get("type")?.as_str()?;
    let properties = payload.get("properties")?;

    match event_type {
        "session.status" => {
            let session_id = properties.get("sessionID")?.as_str()?.to_string();
            let status = parse_session_status(properties.get("status")?.as_str()?)?;
            Some((session_id, ExecutorEvent::Status(status)))
        }
        "session.idle" => {
            let session_id = properties.get("sessionID")?.as_str()?.to_string();
            Some((session_id, ExecutorEvent::Idle))
        }
        "file.edited" => {
            let session_id = properties.get("sessionID")?.as_str()?.to_string();
            let file = properties.get("file")?.as_str()?.to_string();
            Some((session_id, ExecutorEvent::FileEdited(file)))
        }
        "message.part.updated" => {
            let part = properties.get("part")?;
            let session_id = part
                .get("sessionID")
                .or_else(|| properties.get("sessionID"))?
                .as_str()?
                .to_string();
            match part.get("type")?.as_str()? {
                "text" => {
                    let text = part.get("text")?.as_str()?.to_string();
                    Some((session_id, ExecutorEvent::Text(text)))
                }
                "tool" => {
                    let name = part
                        .get("tool")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string();
                    let call_id = part
                        .get("callID")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| {
                            // Backends occasionally omit the call id.
                            format!("{name}-{}", chrono::Utc::now().timestamp_millis())
                        });
                    let state = part.get("state").cloned().unwrap_or(Value::Null);
                    let status = match state.get("status").and_then(Value::as_str) {
                        Some("pending") => ToolCallStatus::Pending,
                        Some("running") => ToolCallStatus::Running,
                        Some("completed") => ToolCallStatus::Completed,
                        _ => ToolCallStatus::Error,
                    };
                    let input = state.get("input").cloned().unwrap_or(Value::Null);
                    let output = state.get("output").cloned().filter(|v| !v.is_null());
                    Some((
                        session_id,
                        ExecutorEvent::ToolCall(ToolCallUpdate {
                            call_id,
                            name,
                            status,
                            input,
                            output,
                        }),
                    ))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

fn parse_session_status(s: &str) -> Option<SessionStatus> {
    match s {
        "busy" => Some(SessionStatus::Busy),
        "idle" => Some(SessionStatus::Idle),
        "error" => Some(SessionStatus::Error),
        _ => None,
    }
}

/// Assemble the final output text from a session's message trail.
///
/// Concatenates text parts of assistant messages in order.
pub fn assemble_output(messages: &[Value]) -> String {
    let mut output = String::new();
    for message in messages {
        let role = message
            .get("role")
            .or_else(|| message.get("info").and_then(|i| i.get("role")))
            .and_then(Value::as_str);
        if role != Some("assistant") {
            continue;
        }
        if let Some(parts) = message.get("parts").and_then(Value::as_array) {
            for part in parts {
                if part.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        if !output.is_empty() {
                            output.push('\n');
                        }
                        output.push_str(text);
                    }
                }
            }
        }
    }
    output
}
