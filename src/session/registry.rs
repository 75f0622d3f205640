//! Session registry
//!
//! Process-wide table of sessions, addressable by session id or by the OS pid
//! of their process. Starts sessions, routes input and cancellation, and
//! hands out read cursors. Each session's mutable state sits behind its own
//! locks; the table lock is only held for lookups and membership changes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::bridge::StreamBridge;
use super::reaper::Reaper;
use super::replay::Tail;
use super::{
    ExitRecord, Session, SessionError, SessionId, SessionInfo, SessionKind, SessionResult,
    SessionState, SessionTarget,
};
use crate::config::BridgeConfig;
use crate::process::{
    LaunchMode, LaunchSpec, ProcessLauncher, Signal, SpawnedProcess, TerminalSize,
};

/// Chunks a live consumer may lag behind before it is detached
const LIVE_STREAM_CAPACITY: usize = 1024;

/// What to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandSpec {
    /// A configured tool preset
    Tool {
        name: String,
        #[serde(default)]
        prompt: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        permissive: bool,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A program with an explicit argument vector
    Exec {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// A raw command line run through the login shell
    Shell { command: String },
    /// An interactive login shell
    Terminal,
}

impl CommandSpec {
    pub fn kind(&self) -> SessionKind {
        match self {
            CommandSpec::Tool { .. } | CommandSpec::Terminal => SessionKind::Interactive,
            CommandSpec::Exec { .. } | CommandSpec::Shell { .. } => SessionKind::Command,
        }
    }
}

/// Parameters for starting a session
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub command: CommandSpec,
    /// Falls back to the configured default working directory
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub size: Option<TerminalSize>,
    /// Forces PTY or pipes instead of the default for the session kind
    pub mode: Option<LaunchMode>,
    /// Wall-clock ceiling after which the process group is killed
    pub timeout: Option<Duration>,
    /// Attach the caller as the live consumer
    pub live: bool,
}

impl StartRequest {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            cwd: None,
            env: HashMap::new(),
            size: None,
            mode: None,
            timeout: None,
            live: true,
        }
    }
}

/// Result of a start request
#[derive(Debug)]
pub struct StartedSession {
    pub info: SessionInfo,
    /// Pushed output, banner first and trailer last; `None` when the request
    /// did not ask for a live stream. A consumer that falls too far behind is
    /// detached and the stream closes early; the buffer still has the rest.
    pub live: Option<mpsc::Receiver<String>>,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Terminate signal delivered to the process group
    Cancelled,
    /// Session already exited, evicted or never known
    NothingToCancel,
}

/// Single offset poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRead {
    pub output: String,
    pub offset: usize,
    pub reset: bool,
    /// False once the trailer is in the buffer
    pub running: bool,
}

/// Result of a helper invocation
#[derive(Debug, Clone)]
pub struct HelperOutput {
    pub session_id: SessionId,
    pub output: String,
    pub exit: ExitRecord,
}

/// Sessions by id, with a secondary pid index
#[derive(Default)]
pub(crate) struct SessionTable {
    by_id: HashMap<SessionId, Arc<Session>>,
    by_pid: HashMap<u32, SessionId>,
}

impl SessionTable {
    fn insert(&mut self, session: Arc<Session>) {
        self.by_id.insert(session.id(), session);
    }

    fn index_pid(&mut self, pid: u32, id: SessionId) {
        if let Some(previous) = self.by_pid.insert(pid, id) {
            if previous != id {
                debug!("Pid {} reassigned from session {} to {}", pid, previous, id);
            }
        }
    }

    fn lookup(&self, target: SessionTarget) -> Option<Arc<Session>> {
        let id = match target {
            SessionTarget::SessionId(id) => id,
            SessionTarget::Pid(pid) => *self.by_pid.get(&pid)?,
        };
        self.by_id.get(&id).cloned()
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<Arc<Session>> {
        self.by_pid.retain(|_, owner| *owner != id);
        self.by_id.remove(&id)
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        self.by_id.values().cloned().collect()
    }
}

struct LaunchPlan {
    kind: SessionKind,
    spec: LaunchSpec,
    command_line: String,
}

/// Owns every session the bridge knows about
#[derive(Clone)]
pub struct SessionRegistry {
    table: Arc<RwLock<SessionTable>>,
    launcher: ProcessLauncher,
    config: Arc<BridgeConfig>,
    reaper: Reaper,
}

impl SessionRegistry {
    pub fn new(config: BridgeConfig) -> Self {
        let table = Arc::new(RwLock::new(SessionTable::default()));
        let launcher = ProcessLauncher::new(config.launcher.search_path());
        let reaper = Reaper::new(Arc::clone(&table), config.sessions.clone());
        Self {
            table,
            launcher,
            config: Arc::new(config),
            reaper,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Number of sessions not yet evicted
    pub async fn session_count(&self) -> usize {
        self.table.read().await.by_id.len()
    }

    /// Start a session.
    ///
    /// Only malformed requests fail here. A command that cannot be resolved
    /// or spawned still yields a session: its buffer holds the banner and the
    /// failure trailer, it is already `Exited`, and it has no pid.
    pub async fn start(&self, request: StartRequest) -> SessionResult<StartedSession> {
        let live = request.live;
        let (live_tx, live_rx) = if live {
            let (tx, rx) = mpsc::channel(LIVE_STREAM_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let session = self.launch(request, live_tx).await?;
        Ok(StartedSession {
            info: session.info().await,
            live: live_rx,
        })
    }

    async fn launch(
        &self,
        request: StartRequest,
        live: Option<mpsc::Sender<String>>,
    ) -> SessionResult<Arc<Session>> {
        let plan = self.plan(&request)?;
        let session = Arc::new(Session::new(
            plan.kind,
            plan.spec,
            plan.command_line,
            request.timeout,
            live,
        ));
        let id = session.id();
        self.table.write().await.insert(Arc::clone(&session));

        match self.launcher.launch(session.spec()) {
            Ok(spawned) => {
                let SpawnedProcess {
                    pid,
                    program,
                    mode,
                    output,
                    input,
                    control,
                    exit,
                } = spawned;

                session.attach(pid, input, control).await;
                if let Some(pid) = pid {
                    self.table.write().await.index_pid(pid, id);
                }
                info!(
                    "Session {} started: {} ({:?}, pid {:?})",
                    id,
                    program.display(),
                    mode,
                    pid
                );

                let bridge = StreamBridge::new(
                    Arc::clone(&session),
                    output,
                    exit,
                    self.config.sessions.drain_timeout(),
                );
                let reaper = self.reaper.clone();
                let task_session = Arc::clone(&session);
                tokio::spawn(async move {
                    let status = bridge.run().await;
                    let record = task_session.record_for(status);
                    reaper.finalize(&task_session, record).await;
                });
            }
            Err(e) => {
                warn!("Session {} failed to launch: {}", id, e);
                self.reaper
                    .finalize(&session, ExitRecord::launch_failure(&e))
                    .await;
            }
        }

        Ok(session)
    }

    fn plan(&self, request: &StartRequest) -> SessionResult<LaunchPlan> {
        let launcher = &self.config.launcher;
        let size = request.size.unwrap_or_else(|| launcher.default_size());
        if size.cols == 0 || size.rows == 0 {
            return Err(SessionError::InvalidRequest(format!(
                "terminal size must be positive, got {}x{}",
                size.cols, size.rows
            )));
        }

        let (program, args) = match &request.command {
            CommandSpec::Tool {
                name,
                prompt,
                model,
                permissive,
                args,
            } => {
                let preset = self
                    .config
                    .tool(name)
                    .ok_or_else(|| SessionError::UnknownTool(name.clone()))?;
                let args =
                    preset.command_args(prompt.as_deref(), model.as_deref(), *permissive, args);
                (preset.command, args)
            }
            CommandSpec::Exec { program, args } => {
                if program.trim().is_empty() {
                    return Err(SessionError::InvalidRequest("program is empty".to_string()));
                }
                (program.clone(), args.clone())
            }
            CommandSpec::Shell { command } => {
                if command.trim().is_empty() {
                    return Err(SessionError::InvalidRequest("command is empty".to_string()));
                }
                (
                    launcher.shell(),
                    vec!["-l".to_string(), "-c".to_string(), command.clone()],
                )
            }
            CommandSpec::Terminal => (
                launcher.shell(),
                vec!["-i".to_string(), "-l".to_string()],
            ),
        };

        let kind = request.command.kind();
        let mode = request.mode.unwrap_or(match kind {
            SessionKind::Interactive if launcher.pty => LaunchMode::Pty,
            _ => LaunchMode::Pipes,
        });
        let command_line = match &request.command {
            CommandSpec::Shell { command } => command.clone(),
            _ => display_command(&program, &args),
        };

        Ok(LaunchPlan {
            kind,
            spec: LaunchSpec {
                program,
                args,
                cwd: request.cwd.clone().unwrap_or_else(|| launcher.default_cwd()),
                env: request.env.clone(),
                size,
                mode,
            },
            command_line,
        })
    }

    /// Look up a live or recently exited session
    pub async fn get(&self, target: SessionTarget) -> SessionResult<Arc<Session>> {
        self.table
            .read()
            .await
            .lookup(target)
            .ok_or(SessionError::SessionNotFound(target))
    }

    /// Route input to a session's process.
    ///
    /// A process that stops reading its input fails the write with
    /// `InputTimeout` once the input timeout elapses.
    pub async fn write_input(&self, target: SessionTarget, data: &[u8]) -> SessionResult<usize> {
        let session = self.get(target).await?;
        let written = timeout(self.config.sessions.input_timeout(), session.write_input(data))
            .await
            .map_err(|_| SessionError::InputTimeout(session.id()))??;
        debug!("Routed {} bytes to session {}", written, session.id());
        Ok(written)
    }

    /// Terminate a running session's process group.
    ///
    /// Escalates to SIGKILL if the group outlives the escalation delay. With
    /// `purge`, the session is evicted as soon as its exit is recorded (or
    /// immediately, if it already exited).
    pub async fn cancel(&self, target: SessionTarget, purge: bool) -> SessionResult<CancelOutcome> {
        let session = match self.table.read().await.lookup(target) {
            Some(session) => session,
            None => return Ok(CancelOutcome::NothingToCancel),
        };

        match session.state().await {
            SessionState::Exited => {
                if purge {
                    self.reaper.evict(&session).await;
                }
                return Ok(CancelOutcome::NothingToCancel);
            }
            SessionState::Evicted => return Ok(CancelOutcome::NothingToCancel),
            SessionState::Launching | SessionState::Running => {}
        }

        session.mark_cancel_requested(purge);
        if !session.signal(Signal::Terminate).await {
            return Ok(CancelOutcome::NothingToCancel);
        }
        info!("Session {} cancelled", session.id());

        let escalation = self.config.sessions.kill_escalation();
        tokio::spawn(async move {
            tokio::time::sleep(escalation).await;
            if session.state().await == SessionState::Running {
                warn!(
                    "Session {} ignored SIGTERM for {:?}, sending SIGKILL",
                    session.id(),
                    escalation
                );
                session.signal(Signal::Kill).await;
            }
        });

        Ok(CancelOutcome::Cancelled)
    }

    /// One offset poll
    pub async fn read_output(&self, target: SessionTarget, offset: usize) -> SessionResult<OutputRead> {
        let session = self.get(target).await?;
        let sealed = session.buffer().is_sealed().await;
        let chunk = session
            .buffer()
            .read_from(offset)
            .await
            .map_err(|_| SessionError::SessionNotFound(target))?;

        Ok(OutputRead {
            output: chunk.output,
            offset: chunk.offset,
            reset: chunk.reset,
            running: !sealed,
        })
    }

    /// Open a read cursor at `offset`; pid-addressed cursors also probe the
    /// process for liveness
    pub async fn tail(&self, target: SessionTarget, offset: usize) -> SessionResult<Tail> {
        let session = self.get(target).await?;
        let probe_pid = match target {
            SessionTarget::Pid(pid) => Some(pid),
            SessionTarget::SessionId(_) => None,
        };

        Ok(Tail::new(
            session,
            offset,
            probe_pid,
            self.config.sessions.poll_interval(),
            self.config.sessions.drain_timeout(),
        ))
    }

    pub async fn resize(&self, target: SessionTarget, size: TerminalSize) -> SessionResult<()> {
        if size.cols == 0 || size.rows == 0 {
            return Err(SessionError::InvalidRequest(format!(
                "terminal size must be positive, got {}x{}",
                size.cols, size.rows
            )));
        }
        let session = self.get(target).await?;
        session.resize(size).await?;
        debug!("Session {} resized to {}x{}", session.id(), size.cols, size.rows);
        Ok(())
    }

    pub async fn status(&self, target: SessionTarget) -> SessionResult<SessionInfo> {
        Ok(self.get(target).await?.info().await)
    }

    /// All sessions, oldest first
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.table.read().await.sessions();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by_key(|info| info.started_at);
        infos
    }

    /// Run a short-lived helper to completion under the helper timeout
    pub async fn run_helper(
        &self,
        program: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
    ) -> SessionResult<HelperOutput> {
        let mut request = StartRequest::new(CommandSpec::Exec { program, args });
        request.cwd = cwd;
        request.timeout = Some(self.config.sessions.helper_timeout());
        request.live = false;

        let session = self.launch(request, None).await?;
        let target = SessionTarget::SessionId(session.id());
        let exit = session
            .wait_exit()
            .await
            .ok_or(SessionError::SessionNotFound(target))?;
        let output = session
            .buffer()
            .snapshot()
            .await
            .ok_or(SessionError::SessionNotFound(target))?;

        Ok(HelperOutput {
            session_id: session.id(),
            output,
            exit,
        })
    }

    /// Terminate every running session; used on server shutdown
    pub async fn shutdown_all(&self) {
        let sessions = self.table.read().await.sessions();
        for session in sessions {
            if session.state().await == SessionState::Running {
                session.mark_cancel_requested(false);
                session.signal(Signal::Terminate).await;
            }
        }
    }
}

/// Command line as shown to users; arguments with whitespace or quotes are
/// single-quoted
fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
            line.push('\'');
            line.push_str(&arg.replace('\'', r"'\''"));
            line.push('\'');
        } else {
            line.push_str(arg);
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{banner, ExitReason, TailEvent};
    use tempfile::TempDir;

    fn test_registry(grace_ms: u64) -> SessionRegistry {
        let mut config = BridgeConfig::default();
        config.sessions.interactive_grace_ms = grace_ms;
        config.sessions.command_grace_ms = grace_ms;
        config.sessions.poll_interval_ms = 20;
        config.sessions.drain_timeout_ms = 200;
        config.sessions.kill_escalation_ms = 500;
        config.launcher.shell = Some("/bin/sh".to_string());
        SessionRegistry::new(config)
    }

    fn exec(program: &str, args: &[&str], cwd: &TempDir) -> StartRequest {
        let mut request = StartRequest::new(CommandSpec::Exec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        });
        request.cwd = Some(cwd.path().to_path_buf());
        request
    }

    async fn wait_exit(session: &Session) -> ExitRecord {
        timeout(Duration::from_secs(10), session.wait_exit())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_display_command_quotes() {
        let args = vec!["-p".to_string(), "fix the bug".to_string()];
        assert_eq!(display_command("claude", &args), "claude -p 'fix the bug'");
    }

    #[test]
    fn test_command_spec_wire_format() {
        let spec: CommandSpec =
            serde_json::from_str(r#"{"kind": "tool", "name": "claude", "prompt": "hi"}"#).unwrap();
        assert_eq!(spec.kind(), SessionKind::Interactive);
        let spec: CommandSpec = serde_json::from_str(r#"{"kind": "terminal"}"#).unwrap();
        assert_eq!(spec, CommandSpec::Terminal);
    }

    #[tokio::test]
    async fn test_echo_buffer_is_banner_output_trailer() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry.start(exec("echo", &["hello"], &dir)).await.unwrap();
        let session = registry
            .get(started.info.session_id.into())
            .await
            .unwrap();

        let record = wait_exit(&session).await;
        assert!(record.success());
        assert_eq!(record.code, Some(0));

        let expected = format!(
            "{}hello\n{}",
            banner("echo hello", dir.path()),
            record.trailer()
        );
        assert_eq!(session.buffer().snapshot().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_live_stream_matches_buffer() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry
            .start(exec("sh", &["-c", "echo out; echo err >&2"], &dir))
            .await
            .unwrap();
        let mut live = started.live.unwrap();

        let mut pushed = String::new();
        while let Some(text) = timeout(Duration::from_secs(10), live.recv()).await.unwrap() {
            pushed.push_str(&text);
        }

        let session = registry.get(started.info.session_id.into()).await.unwrap();
        assert_eq!(session.buffer().snapshot().await.unwrap(), pushed);
        assert!(pushed.contains("out\n"));
        assert!(pushed.contains("\x1b[31merr\n\x1b[0m"));
    }

    #[tokio::test]
    async fn test_missing_tool_exits_in_band() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry
            .start(exec("definitely-not-a-real-tool-4f1c", &[], &dir))
            .await
            .unwrap();

        assert_eq!(started.info.state, SessionState::Exited);
        assert_eq!(started.info.pid, None);
        let exit = started.info.exit.unwrap();
        assert_eq!(exit.reason, ExitReason::ToolUnavailable);

        let session = registry.get(started.info.session_id.into()).await.unwrap();
        let text = session.buffer().snapshot().await.unwrap();
        assert_eq!(text.matches("[Tool unavailable]").count(), 1);
        assert!(text.ends_with(&exit.trailer()));
    }

    #[tokio::test]
    async fn test_missing_cwd_is_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let mut request = exec("echo", &["x"], &dir);
        request.cwd = Some(dir.path().join("nope"));

        let started = registry.start(request).await.unwrap();
        assert_eq!(started.info.exit.unwrap().reason, ExitReason::SpawnFailed);
    }

    #[tokio::test]
    async fn test_malformed_requests_create_no_session() {
        let registry = test_registry(10_000);
        let unknown = StartRequest::new(CommandSpec::Tool {
            name: "nope".to_string(),
            prompt: None,
            model: None,
            permissive: false,
            args: Vec::new(),
        });
        assert!(matches!(
            registry.start(unknown).await,
            Err(SessionError::UnknownTool(_))
        ));

        let mut bad_size = StartRequest::new(CommandSpec::Terminal);
        bad_size.size = Some(TerminalSize::new(0, 24));
        assert!(matches!(
            registry.start(bad_size).await,
            Err(SessionError::InvalidRequest(_))
        ));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_addressable_by_pid() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry.start(exec("sleep", &["5"], &dir)).await.unwrap();
        let pid = started.info.pid.unwrap();

        let by_pid = registry.get(SessionTarget::Pid(pid)).await.unwrap();
        assert_eq!(by_pid.id(), started.info.session_id);
        assert_eq!(by_pid.os_process().await, Some(pid));

        registry
            .cancel(SessionTarget::Pid(pid), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_exits_once_with_failure() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry.start(exec("sleep", &["30"], &dir)).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();

        assert_eq!(
            registry.cancel(target, false).await.unwrap(),
            CancelOutcome::Cancelled
        );
        let session = registry.get(target).await.unwrap();
        let record = wait_exit(&session).await;

        assert_eq!(record.reason, ExitReason::Cancelled);
        assert!(!record.success());
        assert_eq!(
            registry.cancel(target, false).await.unwrap(),
            CancelOutcome::NothingToCancel
        );

        let text = session.buffer().snapshot().await.unwrap();
        assert_eq!(text.matches("[Process cancelled]").count(), 1);
        assert!(text.ends_with(&record.trailer()));
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_nothing_to_cancel() {
        let registry = test_registry(10_000);
        let outcome = registry
            .cancel(SessionTarget::SessionId(SessionId::new()), false)
            .await
            .unwrap();
        assert_eq!(outcome, CancelOutcome::NothingToCancel);
    }

    #[tokio::test]
    async fn test_purge_evicts_after_exit() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(60_000);
        let started = registry.start(exec("sleep", &["30"], &dir)).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();
        let session = registry.get(target).await.unwrap();

        registry.cancel(target, true).await.unwrap();
        wait_exit(&session).await;

        timeout(Duration::from_secs(5), async {
            while registry.get(target).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(session.buffer().read_from(0).await.is_err());
    }

    #[tokio::test]
    async fn test_write_after_exit_is_not_writable() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry.start(exec("true", &[], &dir)).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();
        wait_exit(&registry.get(target).await.unwrap()).await;

        let result = registry.write_input(target, b"hello\n").await;
        assert!(matches!(result, Err(SessionError::SessionNotWritable(_))));

        let unknown = registry
            .write_input(SessionTarget::SessionId(SessionId::new()), b"x")
            .await;
        assert!(matches!(unknown, Err(SessionError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_garbage_input_does_not_break_bridge() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry.start(exec("cat", &[], &dir)).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();

        let mut garbage: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
        garbage.extend_from_slice(b"\nmarker\n");
        let written = registry.write_input(target, &garbage).await.unwrap();
        assert_eq!(written, garbage.len());

        let session = registry.get(target).await.unwrap();
        timeout(Duration::from_secs(10), async {
            loop {
                let text = session.buffer().snapshot().await.unwrap();
                if text.contains("marker\n") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.state().await, SessionState::Running);

        registry.cancel(target, false).await.unwrap();
        assert_eq!(wait_exit(&session).await.reason, ExitReason::Cancelled);
    }

    #[tokio::test]
    async fn test_pty_session_accepts_oversized_input() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let mut request = exec("cat", &[], &dir);
        request.mode = Some(LaunchMode::Pty);
        let started = registry.start(request).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();

        let input: String = (0..256)
            .map(|i| format!("line-{:04} {}\n", i, "x".repeat(48)))
            .collect();
        assert!(input.len() > 8 * 1024);
        let written = registry.write_input(target, input.as_bytes()).await.unwrap();
        assert_eq!(written, input.len());

        let session = registry.get(target).await.unwrap();
        timeout(Duration::from_secs(10), async {
            loop {
                let text = session.buffer().snapshot().await.unwrap();
                if text.contains("line-0255") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(session.state().await, SessionState::Running);

        registry.cancel(target, false).await.unwrap();
        let record = wait_exit(&session).await;
        assert_eq!(record.reason, ExitReason::Cancelled);
        assert!(matches!(
            registry.write_input(target, b"late\n").await,
            Err(SessionError::SessionNotWritable(_))
        ));
    }

    #[tokio::test]
    async fn test_pty_cancel_records_signal() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let mut request = exec("sleep", &["30"], &dir);
        request.mode = Some(LaunchMode::Pty);
        let started = registry.start(request).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();
        tokio::time::sleep(Duration::from_millis(100)).await;

        registry.cancel(target, false).await.unwrap();
        let session = registry.get(target).await.unwrap();
        let record = wait_exit(&session).await;
        assert_eq!(record.reason, ExitReason::Cancelled);
        assert_eq!(record.code, None);
        assert_eq!(record.signal.as_deref(), Some("SIGTERM"));
        assert!(record.trailer().contains("code=unknown signal=SIGTERM"));
    }

    #[tokio::test]
    async fn test_pty_signal_death_reaches_trailer() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let mut request = exec("sh", &["-c", "kill -KILL $$"], &dir);
        request.mode = Some(LaunchMode::Pty);
        let started = registry.start(request).await.unwrap();

        let session = registry.get(started.info.session_id.into()).await.unwrap();
        let record = wait_exit(&session).await;
        assert_eq!(record.reason, ExitReason::Exited);
        assert_eq!(record.code, None);
        assert_eq!(record.signal.as_deref(), Some("SIGKILL"));
        assert!(session
            .buffer()
            .snapshot()
            .await
            .unwrap()
            .contains("[Process exited] code=unknown signal=SIGKILL"));
    }

    #[tokio::test]
    async fn test_stalled_input_times_out() {
        let dir = TempDir::new().unwrap();
        let mut config = BridgeConfig::default();
        config.sessions.input_timeout_ms = 200;
        config.sessions.drain_timeout_ms = 200;
        let registry = SessionRegistry::new(config);
        let started = registry.start(exec("sleep", &["30"], &dir)).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();

        // Far more than a pipe holds, and nobody reads it
        let flood = vec![b'x'; 1024 * 1024];
        let result = timeout(Duration::from_secs(3), registry.write_input(target, &flood))
            .await
            .unwrap();
        assert!(matches!(result, Err(SessionError::InputTimeout(_))));

        let result = timeout(Duration::from_secs(2), registry.write_input(target, b"hi"))
            .await
            .unwrap();
        assert!(matches!(result, Err(SessionError::InputTimeout(_))));

        assert_eq!(
            registry.cancel(target, false).await.unwrap(),
            CancelOutcome::Cancelled
        );
        let session = registry.get(target).await.unwrap();
        assert_eq!(wait_exit(&session).await.reason, ExitReason::Cancelled);
    }

    #[tokio::test]
    async fn test_polls_are_idempotent_and_monotonic() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry
            .start(exec("sh", &["-c", "for i in 1 2 3; do echo $i; sleep 0.05; done"], &dir))
            .await
            .unwrap();
        let target: SessionTarget = started.info.session_id.into();

        let mut offset = 0;
        let mut last_len = 0;
        loop {
            let read = registry.read_output(target, offset).await.unwrap();
            assert!(read.offset >= last_len);
            last_len = read.offset;
            offset = read.offset;
            if !read.running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let first = registry.read_output(target, 0).await.unwrap();
        let second = registry.read_output(target, 0).await.unwrap();
        assert_eq!(first, second);

        let stale = registry.read_output(target, offset + 1000).await.unwrap();
        assert!(stale.reset);
        assert_eq!(stale.output, first.output);
    }

    #[tokio::test]
    async fn test_tails_converge() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let started = registry
            .start(exec("sh", &["-c", "sleep 0.1; echo one; sleep 0.1; echo two"], &dir))
            .await
            .unwrap();
        let target: SessionTarget = started.info.session_id.into();
        let midway = registry.read_output(target, 0).await.unwrap().offset;

        let mut texts = Vec::new();
        for offset in [0, midway] {
            let mut tail = registry.tail(target, offset).await.unwrap();
            let mut text = String::new();
            loop {
                match timeout(Duration::from_secs(10), tail.next()).await.unwrap() {
                    Some(TailEvent::Output(chunk)) => text.push_str(&chunk.output),
                    Some(TailEvent::Ended { exit }) => {
                        assert!(exit.unwrap().success());
                        break;
                    }
                    other => panic!("unexpected event: {:?}", other),
                }
            }
            texts.push(text);
        }

        let full = registry.read_output(target, 0).await.unwrap().output;
        assert_eq!(texts[0], full);
        assert_eq!(texts[1], full[midway..]);
    }

    #[tokio::test]
    async fn test_eviction_after_grace() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(100);
        let started = registry.start(exec("true", &[], &dir)).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();
        let session = registry.get(target).await.unwrap();
        wait_exit(&session).await;

        assert!(registry.read_output(target, 0).await.is_ok());
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(matches!(
            registry.read_output(target, 0).await,
            Err(SessionError::SessionNotFound(_))
        ));
        assert_eq!(session.state().await, SessionState::Evicted);
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let mut request = exec("sleep", &["30"], &dir);
        request.timeout = Some(Duration::from_millis(200));

        let started = registry.start(request).await.unwrap();
        let session = registry.get(started.info.session_id.into()).await.unwrap();
        let record = wait_exit(&session).await;

        assert_eq!(record.reason, ExitReason::TimedOut);
        assert_eq!(record.signal.as_deref(), Some("SIGKILL"));
    }

    #[tokio::test]
    async fn test_run_helper_returns_output() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let result = registry
            .run_helper(
                "echo".to_string(),
                vec!["helper".to_string()],
                Some(dir.path().to_path_buf()),
            )
            .await
            .unwrap();

        assert!(result.exit.success());
        assert!(result.output.contains("helper\n"));
        assert!(result.output.ends_with(&result.exit.trailer()));
    }

    #[tokio::test]
    async fn test_shell_command_runs_through_shell() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let mut request = StartRequest::new(CommandSpec::Shell {
            command: "echo shell-ok && exit 3".to_string(),
        });
        request.cwd = Some(dir.path().to_path_buf());

        let started = registry.start(request).await.unwrap();
        assert_eq!(started.info.command, "echo shell-ok && exit 3");
        let session = registry.get(started.info.session_id.into()).await.unwrap();
        let record = wait_exit(&session).await;

        assert_eq!(record.code, Some(3));
        assert!(session
            .buffer()
            .snapshot()
            .await
            .unwrap()
            .contains("shell-ok"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_session_resize() {
        let dir = TempDir::new().unwrap();
        let registry = test_registry(10_000);
        let mut request = exec("sleep", &["5"], &dir);
        request.mode = Some(LaunchMode::Pty);

        let started = registry.start(request).await.unwrap();
        let target: SessionTarget = started.info.session_id.into();
        registry
            .resize(target, TerminalSize::new(132, 40))
            .await
            .unwrap();

        let info = registry.status(target).await.unwrap();
        assert_eq!((info.cols, info.rows), (132, 40));
        assert_eq!(info.mode, LaunchMode::Pty);
        registry.cancel(target, true).await.unwrap();
    }
}
