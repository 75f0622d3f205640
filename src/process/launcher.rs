//! Process launching
//!
//! Spawns a resolved command either under a native pseudo-terminal
//! (interactive tools, shells) or with plain pipes (one-shot commands), and
//! hands back uniform handles:
//! - a channel of raw output chunks tagged by stream
//! - an input writer
//! - a control handle for signals and resize
//! - a one-shot receiver for the exit status

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use super::resolve::SearchPath;
use super::signal::{signal_group, signal_name, Signal};

/// Chunks buffered between the readers and the stream bridge
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Read size for both PTY and pipe readers
const READ_CHUNK_SIZE: usize = 4096;

/// Input writes queued for the PTY writer thread
const INPUT_QUEUE_CAPACITY: usize = 16;

/// Errors that can occur while launching or controlling a process
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Tool unavailable: {0} was not found on the search path")]
    ToolUnavailable(String),

    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to signal process: {0}")]
    SignalFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("Process has no terminal to resize")]
    NotResizable,
}

/// Result type for launcher operations
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// How the child's standard streams are wired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    /// Native pseudo-terminal; stdout and stderr arrive merged
    Pty,
    /// Plain pipes; stderr arrives separately
    Pipes,
}

impl LaunchMode {
    /// Downgrade to pipes where no PTY implementation exists
    pub fn effective(self) -> Self {
        if self == LaunchMode::Pty && !pty_supported() {
            LaunchMode::Pipes
        } else {
            self
        }
    }
}

/// Whether the native PTY backend is available on this platform
pub const fn pty_supported() -> bool {
    cfg!(any(unix, windows))
}

/// Which standard stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Raw bytes read from the child
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

/// Exit status as reported by the OS
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code if the process exited normally
    pub code: Option<i32>,
    /// Signal name if the process was killed by a signal
    pub signal: Option<String>,
}

impl ProcessExit {
    fn from_std(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().map(signal_name)
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    /// portable-pty reports a signal death as code 1 and only names the
    /// signal in its `Display` output
    fn from_pty(status: &portable_pty::ExitStatus) -> Self {
        match status.to_string().strip_prefix("Terminated by ") {
            Some(signal) => Self {
                code: None,
                signal: Some(signal.to_string()),
            },
            None => Self {
                code: i32::try_from(status.exit_code()).ok(),
                signal: None,
            },
        }
    }

    #[cfg(unix)]
    fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            Self {
                code: None,
                signal: Some(signal_name(libc::WTERMSIG(status))),
            }
        } else {
            Self {
                code: libc::WIFEXITED(status).then_some(libc::WEXITSTATUS(status)),
                signal: None,
            }
        }
    }

    #[cfg(test)]
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

/// Everything needed to start one process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Command name or path, resolved against the search path at launch
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Overrides applied on top of the inherited environment
    pub env: HashMap<String, String>,
    pub size: TerminalSize,
    pub mode: LaunchMode,
}

/// One queued write for the PTY writer thread
pub struct PtyWrite {
    data: Vec<u8>,
    done: oneshot::Sender<std::io::Result<()>>,
}

/// Writer half routed to the child's standard input
pub enum InputWriter {
    Pty(mpsc::Sender<PtyWrite>),
    Pipe(ChildStdin),
}

impl InputWriter {
    /// Write and flush `data`.
    ///
    /// Dropping the future abandons the wait but not a PTY write already
    /// handed to the writer thread.
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            InputWriter::Pty(requests) => {
                let (done, result) = oneshot::channel();
                let request = PtyWrite {
                    data: data.to_vec(),
                    done,
                };
                requests
                    .send(request)
                    .await
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
                result
                    .await
                    .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?
            }
            InputWriter::Pipe(stdin) => {
                stdin.write_all(data).await?;
                stdin.flush().await
            }
        }
    }
}

enum Killer {
    Pty(Box<dyn ChildKiller + Send + Sync>),
    Pipe(Arc<Notify>),
}

/// Signal and resize handle for a running process
pub struct ProcessControl {
    pid: Option<u32>,
    killer: Killer,
    master: Option<Box<dyn MasterPty + Send>>,
    size: TerminalSize,
}

impl ProcessControl {
    #[cfg(test)]
    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Deliver `signal` to the whole process group, falling back to a
    /// direct kill of the child where groups are unavailable.
    pub fn signal(&mut self, signal: Signal) -> LaunchResult<()> {
        if let Some(pid) = self.pid {
            match signal_group(pid, signal) {
                Ok(()) => return Ok(()),
                #[cfg(unix)]
                Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                    debug!("Process group {} already gone", pid);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Group signal {} to {} failed ({}), killing child directly",
                        signal.name(),
                        pid,
                        e
                    );
                }
            }
        }

        match &mut self.killer {
            Killer::Pty(killer) => killer
                .kill()
                .map_err(|e| LaunchError::SignalFailed(e.to_string())),
            Killer::Pipe(notify) => {
                notify.notify_one();
                Ok(())
            }
        }
    }

    /// Resize the terminal; pipe-mode processes have none
    pub fn resize(&mut self, size: TerminalSize) -> LaunchResult<()> {
        let master = self.master.as_ref().ok_or(LaunchError::NotResizable)?;
        master
            .resize(size.to_pty_size())
            .map_err(|e| LaunchError::ResizeFailed(e.to_string()))?;
        self.size = size;
        Ok(())
    }
}

/// Handles for a freshly spawned process
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    /// Absolute path the command resolved to
    pub program: PathBuf,
    pub mode: LaunchMode,
    pub output: mpsc::Receiver<OutputChunk>,
    pub input: InputWriter,
    pub control: ProcessControl,
    pub exit: oneshot::Receiver<ProcessExit>,
}

/// Resolves and spawns commands with a controlled environment
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    search_path: SearchPath,
}

impl ProcessLauncher {
    pub fn new(search_path: SearchPath) -> Self {
        Self { search_path }
    }

    /// Resolve the executable, then spawn it.
    ///
    /// Resolution happens first so a missing tool is reported as
    /// [`LaunchError::ToolUnavailable`] rather than an OS spawn error.
    pub fn launch(&self, spec: &LaunchSpec) -> LaunchResult<SpawnedProcess> {
        let program = self.search_path.resolve(&spec.program, &spec.cwd)?;

        if !spec.cwd.is_dir() {
            return Err(LaunchError::SpawnFailed(format!(
                "working directory does not exist: {}",
                spec.cwd.display()
            )));
        }

        let env = self.child_env(spec);
        match spec.mode.effective() {
            LaunchMode::Pty => spawn_pty(program, spec, env),
            LaunchMode::Pipes => spawn_pipes(program, spec, env),
        }
    }

    fn child_env(&self, spec: &LaunchSpec) -> Vec<(String, OsString)> {
        let mut env: Vec<(String, OsString)> = vec![
            ("PATH".to_string(), self.search_path.to_env_value()),
            ("TERM".to_string(), "xterm-256color".into()),
            ("FORCE_COLOR".to_string(), "1".into()),
            ("COLUMNS".to_string(), spec.size.cols.to_string().into()),
            ("LINES".to_string(), spec.size.rows.to_string().into()),
        ];
        env.extend(
            spec.env
                .iter()
                .map(|(key, value)| (key.clone(), OsString::from(value))),
        );
        env
    }
}

fn spawn_pty(
    program: PathBuf,
    spec: &LaunchSpec,
    env: Vec<(String, OsString)>,
) -> LaunchResult<SpawnedProcess> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(spec.size.to_pty_size())
        .map_err(|e| LaunchError::OpenFailed(e.to_string()))?;

    let mut cmd = CommandBuilder::new(&program);
    cmd.args(&spec.args);
    cmd.cwd(&spec.cwd);
    for (key, value) in &env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| LaunchError::SpawnFailed(e.to_string()))?;

    // Only the child keeps the slave open, so the master sees EOF on exit
    drop(pair.slave);

    let pid = child.process_id();
    let killer = child.clone_killer();

    let handles = pair
        .master
        .try_clone_reader()
        .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
    let (reader, writer) = match handles {
        Ok(handles) => handles,
        Err(e) => {
            let _ = child.kill();
            return Err(LaunchError::OpenFailed(e.to_string()));
        }
    };

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel();

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);

    std::thread::spawn(move || pty_reader_loop(reader, output_tx));
    // Not the blocking pool: a stuck write must not hold up runtime shutdown
    std::thread::spawn(move || pty_writer_loop(writer, input_rx));

    std::thread::spawn(move || {
        let exit = wait_pty_child(child);
        let _ = exit_tx.send(exit);
    });

    debug!("Spawned {} under PTY (pid {:?})", program.display(), pid);

    Ok(SpawnedProcess {
        pid,
        program,
        mode: LaunchMode::Pty,
        output: output_rx,
        input: InputWriter::Pty(input_tx),
        control: ProcessControl {
            pid,
            killer: Killer::Pty(killer),
            master: Some(pair.master),
            size: spec.size,
        },
        exit: exit_rx,
    })
}

/// Blocking reader over the PTY master, run on its own thread
fn pty_reader_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<OutputChunk>) {
    let mut buffer = [0u8; READ_CHUNK_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream: StreamKind::Stdout,
                    data: buffer[..n].to_vec(),
                };
                if output_tx.blocking_send(chunk).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            // EIO once the slave side closes
            Err(_) => break,
        }
    }
}

/// Blocking writer over the PTY master; exits once the input route is dropped
fn pty_writer_loop(mut writer: Box<dyn Write + Send>, mut requests: mpsc::Receiver<PtyWrite>) {
    while let Some(PtyWrite { data, done }) = requests.blocking_recv() {
        let result = writer
            .write_all(&data)
            .and_then(|()| writer.flush())
            .map_err(closed_terminal);
        let _ = done.send(result);
    }
}

/// The master reports EIO once the child side of the terminal is gone
fn closed_terminal(e: std::io::Error) -> std::io::Error {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EIO) {
        return std::io::Error::new(std::io::ErrorKind::BrokenPipe, e);
    }
    e
}

/// Reap the PTY child ourselves so a signal death keeps its signal
fn wait_pty_child(mut child: Box<dyn portable_pty::Child + Send + Sync>) -> ProcessExit {
    #[cfg(unix)]
    if let Some(pid) = child.process_id() {
        match reap(pid) {
            Ok(exit) => return exit,
            Err(e) => debug!("waitpid({}) failed: {}", pid, e),
        }
    }

    match child.wait() {
        Ok(status) => ProcessExit::from_pty(&status),
        Err(e) => {
            warn!("Failed to wait for PTY child: {}", e);
            ProcessExit::default()
        }
    }
}

#[cfg(unix)]
fn reap(pid: u32) -> std::io::Result<ProcessExit> {
    let pid = libc::pid_t::try_from(pid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
    })?;
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: `status` is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return Ok(ProcessExit::from_wait_status(status));
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn spawn_pipes(
    program: PathBuf,
    spec: &LaunchSpec,
    env: Vec<(String, OsString)>,
) -> LaunchResult<SpawnedProcess> {
    let mut cmd = Command::new(&program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| LaunchError::SpawnFailed(e.to_string()))?;

    let pid = child.id();
    let stdin = match child.stdin.take() {
        Some(stdin) => stdin,
        None => {
            let _ = child.start_kill();
            return Err(LaunchError::SpawnFailed("stdin was not captured".to_string()));
        }
    };

    let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    spawn_pipe_reader(child.stdout.take(), StreamKind::Stdout, output_tx.clone());
    spawn_pipe_reader(child.stderr.take(), StreamKind::Stderr, output_tx);

    let kill = Arc::new(Notify::new());
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(wait_pipe_child(child, Arc::clone(&kill), exit_tx));

    debug!("Spawned {} with pipes (pid {:?})", program.display(), pid);

    Ok(SpawnedProcess {
        pid,
        program,
        mode: LaunchMode::Pipes,
        output: output_rx,
        input: InputWriter::Pipe(stdin),
        control: ProcessControl {
            pid,
            killer: Killer::Pipe(kill),
            master: None,
            size: spec.size,
        },
        exit: exit_rx,
    })
}

fn spawn_pipe_reader<R>(reader: Option<R>, stream: StreamKind, output_tx: mpsc::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(mut reader) = reader else {
        return;
    };

    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk {
                        stream,
                        data: buffer[..n].to_vec(),
                    };
                    if output_tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{:?} reader stopped: {}", stream, e);
                    break;
                }
            }
        }
    });
}

async fn wait_pipe_child(mut child: Child, kill: Arc<Notify>, exit_tx: oneshot::Sender<ProcessExit>) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = kill.notified() => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill child: {}", e);
                }
            }
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::from_std(status),
        Err(e) => {
            warn!("Failed to wait for child: {}", e);
            ProcessExit::default()
        }
    };
    let _ = exit_tx.send(exit);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spec(program: &str, args: &[&str], cwd: &Path, mode: LaunchMode) -> LaunchSpec {
        LaunchSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            cwd: cwd.to_path_buf(),
            env: HashMap::new(),
            size: TerminalSize::default(),
            mode,
        }
    }

    fn launcher() -> ProcessLauncher {
        ProcessLauncher::new(SearchPath::augmented(&[]))
    }

    async fn collect_output(process: &mut SpawnedProcess) -> String {
        let mut text = String::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(5), process.output.recv()).await {
            text.push_str(&String::from_utf8_lossy(&chunk.data));
        }
        text
    }

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_launch_mode_effective() {
        assert_eq!(LaunchMode::Pipes.effective(), LaunchMode::Pipes);
        if pty_supported() {
            assert_eq!(LaunchMode::Pty.effective(), LaunchMode::Pty);
        }
    }

    #[tokio::test]
    async fn test_missing_tool_fails_before_spawn() {
        let result = launcher().launch(&spec(
            "agelum-no-such-tool",
            &[],
            Path::new("/tmp"),
            LaunchMode::Pipes,
        ));
        assert!(matches!(result, Err(LaunchError::ToolUnavailable(_))));
    }

    #[tokio::test]
    async fn test_missing_cwd_fails() {
        let result = launcher().launch(&spec(
            "echo",
            &["hi"],
            Path::new("/nonexistent/agelum/dir"),
            LaunchMode::Pipes,
        ));
        assert!(matches!(result, Err(LaunchError::SpawnFailed(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipes_separate_streams() {
        let mut process = launcher()
            .launch(&spec(
                "sh",
                &["-c", "echo out; echo err 1>&2"],
                Path::new("/tmp"),
                LaunchMode::Pipes,
            ))
            .unwrap();
        assert!(process.pid.is_some());

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Ok(Some(chunk)) = timeout(Duration::from_secs(5), process.output.recv()).await {
            let text = String::from_utf8_lossy(&chunk.data).to_string();
            match chunk.stream {
                StreamKind::Stdout => stdout.push_str(&text),
                StreamKind::Stderr => stderr.push_str(&text),
            }
        }
        assert_eq!(stdout, "out\n");
        assert_eq!(stderr, "err\n");

        let exit = timeout(Duration::from_secs(5), process.exit).await.unwrap().unwrap();
        assert!(exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_spawn_echo() {
        let mut process = launcher()
            .launch(&spec("echo", &["hello"], Path::new("/tmp"), LaunchMode::Pty))
            .unwrap();
        assert_eq!(process.mode, LaunchMode::Pty);

        let text = collect_output(&mut process).await;
        assert!(text.contains("hello"));

        let exit = timeout(Duration::from_secs(5), process.exit).await.unwrap().unwrap();
        assert_eq!(exit.code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_with_env() {
        let mut env_spec = spec(
            "sh",
            &["-c", "echo $AGELUM_TEST_VAR $COLUMNS"],
            Path::new("/tmp"),
            LaunchMode::Pipes,
        );
        env_spec.env.insert("AGELUM_TEST_VAR".to_string(), "test_value".to_string());
        env_spec.size = TerminalSize::new(132, 40);

        let mut process = launcher().launch(&env_spec).unwrap();
        let text = collect_output(&mut process).await;
        assert_eq!(text, "test_value 132\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipe_input_roundtrip() {
        let mut process = launcher()
            .launch(&spec("cat", &[], Path::new("/tmp"), LaunchMode::Pipes))
            .unwrap();

        process.input.write_all(b"test input\n").await.unwrap();
        let chunk = timeout(Duration::from_secs(5), process.output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk.data, b"test input\n");

        process.control.signal(Signal::Terminate).unwrap();
        let exit = timeout(Duration::from_secs(5), process.exit).await.unwrap().unwrap();
        assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_signal_death_keeps_signal() {
        let mut process = launcher()
            .launch(&spec("sh", &["-c", "kill -KILL $$"], Path::new("/tmp"), LaunchMode::Pty))
            .unwrap();
        let _ = collect_output(&mut process).await;

        let exit = timeout(Duration::from_secs(5), process.exit).await.unwrap().unwrap();
        assert_eq!(
            exit,
            ProcessExit {
                code: None,
                signal: Some("SIGKILL".to_string()),
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_terminate_reports_sigterm() {
        let mut process = launcher()
            .launch(&spec("sleep", &["30"], Path::new("/tmp"), LaunchMode::Pty))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        process.control.signal(Signal::Terminate).unwrap();
        let exit = timeout(Duration::from_secs(5), process.exit).await.unwrap().unwrap();
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal.as_deref(), Some("SIGTERM"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_input_is_echoed() {
        let mut process = launcher()
            .launch(&spec("cat", &[], Path::new("/tmp"), LaunchMode::Pty))
            .unwrap();

        process.input.write_all(b"over the terminal\n").await.unwrap();
        let mut text = String::new();
        while !text.contains("over the terminal") {
            let chunk = timeout(Duration::from_secs(5), process.output.recv())
                .await
                .unwrap()
                .unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk.data));
        }

        process.control.signal(Signal::Kill).unwrap();
        assert!(timeout(Duration::from_secs(5), process.exit).await.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_closed_terminal_reads_as_broken_pipe() {
        let err = closed_terminal(std::io::Error::from_raw_os_error(libc::EIO));
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);

        let err = closed_terminal(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_resize() {
        let mut process = launcher()
            .launch(&spec("cat", &[], Path::new("/tmp"), LaunchMode::Pty))
            .unwrap();
        assert_eq!(process.control.size(), TerminalSize::default());

        process.control.resize(TerminalSize::new(120, 40)).unwrap();
        assert_eq!(process.control.size(), TerminalSize::new(120, 40));

        process.control.signal(Signal::Kill).unwrap();
        assert!(timeout(Duration::from_secs(5), process.exit).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pipes_not_resizable() {
        let mut process = launcher()
            .launch(&spec("cat", &[], Path::new("/tmp"), LaunchMode::Pipes))
            .unwrap();
        assert!(matches!(
            process.control.resize(TerminalSize::new(100, 30)),
            Err(LaunchError::NotResizable)
        ));
        process.control.signal(Signal::Kill).unwrap();
    }
}
