//! Individual session
//!
//! One tracked invocation of an external command, from launch through
//! eviction. Holds the replayable buffer, the optional live consumer, and the
//! process handles while the process is alive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use super::buffer::OutputBuffer;
use crate::process::{
    InputWriter, LaunchError, LaunchMode, LaunchSpec, ProcessControl, ProcessExit, Signal,
    TerminalSize,
};

const SGR_RESET: &str = "\x1b[0m";
const SGR_GREEN: &str = "\x1b[32m";
const SGR_RED: &str = "\x1b[31m";

/// Errors that can occur during session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionTarget),

    #[error("Session {0} does not accept input")]
    SessionNotWritable(SessionId),

    #[error("Failed to write input: {0}")]
    WriteFailed(String),

    #[error("Session {0} did not accept input in time")]
    InputTimeout(SessionId),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Opaque session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Address of a session: its id, or the OS pid of its process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTarget {
    SessionId(SessionId),
    Pid(u32),
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionTarget::SessionId(id) => write!(f, "session {}", id),
            SessionTarget::Pid(pid) => write!(f, "pid {}", pid),
        }
    }
}

impl From<SessionId> for SessionTarget {
    fn from(id: SessionId) -> Self {
        SessionTarget::SessionId(id)
    }
}

/// Interactive sessions (tools, terminals) vs one-shot commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Interactive,
    Command,
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Registered, process not yet attached
    Launching,
    /// Process alive, output flowing
    Running,
    /// Trailer written, waiting out the grace delay
    Exited,
    /// Buffer freed and registry entry removed
    Evicted,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Process terminated on its own
    Exited,
    /// Terminated by an explicit cancel request
    Cancelled,
    /// Killed after exceeding its wall-clock ceiling
    TimedOut,
    /// The OS refused to start the process
    SpawnFailed,
    /// The executable could not be resolved
    ToolUnavailable,
}

impl ExitReason {
    fn label(self) -> &'static str {
        match self {
            ExitReason::Exited => "Process exited",
            ExitReason::Cancelled => "Process cancelled",
            ExitReason::TimedOut => "Process timed out",
            ExitReason::SpawnFailed => "Spawn failed",
            ExitReason::ToolUnavailable => "Tool unavailable",
        }
    }
}

/// Final status of a session, rendered into its trailer line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitRecord {
    pub reason: ExitReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ExitRecord {
    /// Record for a process that never started
    pub fn launch_failure(error: &LaunchError) -> Self {
        let (reason, detail) = match error {
            LaunchError::ToolUnavailable(tool) => (ExitReason::ToolUnavailable, tool.clone()),
            other => (ExitReason::SpawnFailed, other.to_string()),
        };
        Self {
            reason,
            code: None,
            signal: None,
            detail: Some(detail),
        }
    }

    pub fn success(&self) -> bool {
        self.reason == ExitReason::Exited && self.code == Some(0) && self.signal.is_none()
    }

    /// Single human-readable line, preceded by a newline so it never joins
    /// a partial output line
    pub fn trailer(&self) -> String {
        let color = if self.success() { SGR_GREEN } else { SGR_RED };
        let detail = self
            .detail
            .as_deref()
            .map(|d| format!(" {}", d))
            .unwrap_or_default();
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let signal = self.signal.as_deref().unwrap_or("none");

        format!(
            "\n{}[{}]{} code={} signal={}{}\n",
            color,
            self.reason.label(),
            detail,
            code,
            signal,
            SGR_RESET
        )
    }
}

/// Startup banner seeded into every buffer
pub fn banner(command_line: &str, cwd: &Path) -> String {
    format!(
        "\x1b[36m>>> {}{}\n\x1b[90m    cwd: {}{}\n",
        command_line,
        SGR_RESET,
        cwd.display(),
        SGR_RESET
    )
}

/// Snapshot of a session for status queries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub kind: SessionKind,
    pub mode: LaunchMode,
    pub command: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_len: Option<usize>,
}

/// A single tracked command invocation
pub struct Session {
    id: SessionId,
    kind: SessionKind,
    spec: LaunchSpec,
    command_line: String,
    started_at: DateTime<Utc>,
    timeout: Option<Duration>,
    state: RwLock<SessionState>,
    pid: RwLock<Option<u32>>,
    size: RwLock<TerminalSize>,
    buffer: OutputBuffer,
    /// The one caller receiving pushed output, if still attached
    live: Mutex<Option<mpsc::Sender<String>>>,
    /// Present iff the process is alive and accepts input
    input: Mutex<Option<InputWriter>>,
    control: Mutex<Option<ProcessControl>>,
    exit: RwLock<Option<ExitRecord>>,
    cancel_requested: AtomicBool,
    timed_out: AtomicBool,
    purge_on_exit: AtomicBool,
}

impl Session {
    /// Create a session in `Launching` with its banner already buffered
    /// (and pushed to `live`, when given)
    pub(crate) fn new(
        kind: SessionKind,
        spec: LaunchSpec,
        command_line: String,
        timeout: Option<Duration>,
        live: Option<mpsc::Sender<String>>,
    ) -> Self {
        let banner = banner(&command_line, &spec.cwd);
        let live = live.filter(|tx| tx.try_send(banner.clone()).is_ok());

        Self {
            id: SessionId::new(),
            kind,
            size: RwLock::new(spec.size),
            spec,
            command_line,
            started_at: Utc::now(),
            timeout,
            state: RwLock::new(SessionState::Launching),
            pid: RwLock::new(None),
            buffer: OutputBuffer::with_banner(&banner),
            live: Mutex::new(live),
            input: Mutex::new(None),
            control: Mutex::new(None),
            exit: RwLock::new(None),
            cancel_requested: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            purge_on_exit: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// OS pid of the process group leader, when a process was ever spawned.
    /// Such a session can also be addressed and signalled by pid.
    pub async fn os_process(&self) -> Option<u32> {
        *self.pid.read().await
    }

    pub async fn exit_record(&self) -> Option<ExitRecord> {
        self.exit.read().await.clone()
    }

    pub async fn info(&self) -> SessionInfo {
        let size = *self.size.read().await;
        SessionInfo {
            session_id: self.id,
            pid: self.os_process().await,
            kind: self.kind,
            mode: self.spec.mode.effective(),
            command: self.command_line.clone(),
            cwd: self.spec.cwd.display().to_string(),
            cols: size.cols,
            rows: size.rows,
            state: self.state().await,
            started_at: self.started_at,
            exit: self.exit_record().await,
            output_len: self.buffer.len().await,
        }
    }

    /// Hand the live process over to the session: `Launching` → `Running`
    pub(crate) async fn attach(&self, pid: Option<u32>, input: InputWriter, control: ProcessControl) {
        *self.pid.write().await = pid;
        *self.input.lock().await = Some(input);
        *self.control.lock().await = Some(control);
        *self.state.write().await = SessionState::Running;
    }

    /// Append to the buffer and push the same text to the live consumer.
    ///
    /// Returns false once the buffer no longer accepts output.
    pub(crate) async fn emit(&self, text: &str) -> bool {
        let mut live = self.live.lock().await;
        if let Err(e) = self.buffer.append(text).await {
            debug!("Session {} dropped {} bytes: {}", self.id, text.len(), e);
            return false;
        }

        if let Some(tx) = live.as_ref() {
            match tx.try_send(text.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Session {} live consumer fell behind, detaching", self.id);
                    *live = None;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Session {} live consumer detached", self.id);
                    *live = None;
                }
            }
        }
        true
    }

    /// Route `data` to the process's standard input
    pub async fn write_input(&self, data: &[u8]) -> SessionResult<usize> {
        let mut input = self.input.lock().await;
        let writer = input
            .as_mut()
            .ok_or(SessionError::SessionNotWritable(self.id))?;

        writer.write_all(data).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                SessionError::SessionNotWritable(self.id)
            } else {
                SessionError::WriteFailed(e.to_string())
            }
        })?;
        Ok(data.len())
    }

    /// Resize the terminal of a running PTY session
    pub async fn resize(&self, size: TerminalSize) -> SessionResult<()> {
        let mut control = self.control.lock().await;
        let control = control.as_mut().ok_or(LaunchError::NotResizable)?;
        control.resize(size)?;
        *self.size.write().await = size;
        Ok(())
    }

    /// Signal the process group; false when no process is attached
    pub(crate) async fn signal(&self, signal: Signal) -> bool {
        let mut control = self.control.lock().await;
        match control.as_mut() {
            Some(control) => {
                if let Err(e) = control.signal(signal) {
                    warn!("Session {}: {}", self.id, e);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_cancel_requested(&self, purge: bool) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if purge {
            self.purge_on_exit.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    pub(crate) fn purge_on_exit(&self) -> bool {
        self.purge_on_exit.load(Ordering::SeqCst)
    }

    /// Translate an OS exit status into the session's exit record
    pub(crate) fn record_for(&self, exit: ProcessExit) -> ExitRecord {
        let (reason, sent, detail) = if self.timed_out.load(Ordering::SeqCst) {
            let detail = self
                .timeout
                .map(|t| format!("after {}s", t.as_secs_f64()));
            (ExitReason::TimedOut, Some(Signal::Kill), detail)
        } else if self.cancel_requested.load(Ordering::SeqCst) {
            (ExitReason::Cancelled, Some(Signal::Terminate), None)
        } else {
            (ExitReason::Exited, None, None)
        };

        ExitRecord {
            reason,
            code: exit.code,
            signal: exit
                .signal
                .or_else(|| sent.map(|s| s.name().to_string())),
            detail,
        }
    }

    /// `Running`/`Launching` → `Exited`, exactly once.
    ///
    /// Drops the input route and process handles, seals the buffer with the
    /// trailer, and closes the live stream. Returns false if the session had
    /// already exited.
    pub(crate) async fn finish(&self, record: ExitRecord) -> bool {
        {
            let mut state = self.state.write().await;
            if matches!(*state, SessionState::Exited | SessionState::Evicted) {
                return false;
            }
            *self.exit.write().await = Some(record.clone());
            *state = SessionState::Exited;
        }

        self.input.lock().await.take();
        self.control.lock().await.take();

        let trailer = record.trailer();
        let mut live = self.live.lock().await;
        if let Err(e) = self.buffer.seal(&trailer).await {
            warn!("Session {} trailer not written: {}", self.id, e);
        }
        if let Some(tx) = live.take() {
            let _ = tx.try_send(trailer);
        }
        true
    }

    /// `Exited` → `Evicted`; frees the buffer
    pub(crate) async fn evict(&self) {
        *self.state.write().await = SessionState::Evicted;
        self.live.lock().await.take();
        self.buffer.evict().await;
    }

    /// Wait until the session has exited; `None` if it was evicted without
    /// an exit record
    pub async fn wait_exit(&self) -> Option<ExitRecord> {
        let mut rx = self.buffer.subscribe();
        loop {
            if let Some(record) = self.exit_record().await {
                return Some(record);
            }
            if self.state().await == SessionState::Evicted || rx.changed().await.is_err() {
                return self.exit_record().await;
            }
        }
    }
}
