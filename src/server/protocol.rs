//! Protocol message definitions
//!
//! Defines the message types exchanged between clients and the bridge server.
//! All messages are JSON-encoded and include version information for compatibility.
//!
//! Messages that address an existing session carry its target flattened into
//! the message body: either `"session_id": "<uuid>"` or `"pid": <u32>`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::process::{LaunchError, LaunchMode};
use crate::session::{
    CommandSpec, ExitRecord, ReplayChunk, SessionError, SessionId, SessionInfo, SessionKind,
    SessionTarget,
};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum terminal dimensions
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Maximum input length (1MB)
pub const MAX_INPUT_LENGTH: usize = 1024 * 1024;

/// Maximum path length
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum tool and program name length
pub const MAX_NAME_LENGTH: usize = 256;

/// Maximum wall-clock ceiling a client may request (one day)
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
/// Includes version for compatibility checking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Protocol envelope wrapping all server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// Protocol version used by the server
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ServerMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    /// Create a new client envelope with the current protocol version
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate the envelope and its contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }

        self.message.validate()
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerEnvelope {
    /// Create a new server envelope with the current protocol version
    pub fn new(message: ServerMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server envelope from JSON (primarily for testing)
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// Start a session; the sender becomes its live consumer
    StartSession {
        /// What to run
        command: CommandSpec,
        /// Working directory (server default when omitted)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        /// Environment overrides
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        /// Force PTY or pipes
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<LaunchMode>,
        /// Kill the process group after this many seconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },

    /// Write to a session's standard input
    SendInput {
        #[serde(flatten)]
        target: SessionTarget,
        /// Text to write, passed through unmodified
        data: String,
    },

    /// Follow a session's output from an offset until it ends
    TailLogs {
        #[serde(flatten)]
        target: SessionTarget,
        #[serde(default)]
        offset: usize,
    },

    /// Stop one of this connection's tails
    StopTail { session_id: SessionId },

    /// Single offset poll
    ReadOutput {
        #[serde(flatten)]
        target: SessionTarget,
        #[serde(default)]
        offset: usize,
    },

    /// Terminate a session's process group
    CancelSession {
        #[serde(flatten)]
        target: SessionTarget,
        /// Evict as soon as the exit is recorded
        #[serde(default)]
        purge: bool,
    },

    /// Resize a PTY session's terminal
    ResizeTerminal {
        #[serde(flatten)]
        target: SessionTarget,
        /// New terminal width in columns
        cols: u16,
        /// New terminal height in rows
        rows: u16,
    },

    /// List all known sessions
    ListSessions,

    /// Request one session's status
    GetSessionStatus {
        #[serde(flatten)]
        target: SessionTarget,
    },

    /// Run a short helper command to completion
    RunHelper {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
}

fn validate_cols(cols: u16) -> ProtocolResult<()> {
    if cols == 0 || cols > MAX_TERMINAL_COLS {
        return Err(ProtocolError::ValidationError(format!(
            "cols must be between 1 and {}",
            MAX_TERMINAL_COLS
        )));
    }
    Ok(())
}

fn validate_rows(rows: u16) -> ProtocolResult<()> {
    if rows == 0 || rows > MAX_TERMINAL_ROWS {
        return Err(ProtocolError::ValidationError(format!(
            "rows must be between 1 and {}",
            MAX_TERMINAL_ROWS
        )));
    }
    Ok(())
}

fn validate_cwd(cwd: &Option<String>) -> ProtocolResult<()> {
    if let Some(cwd) = cwd {
        if cwd.is_empty() {
            return Err(ProtocolError::ValidationError(
                "cwd cannot be empty when specified".to_string(),
            ));
        }
        if cwd.len() > MAX_PATH_LENGTH {
            return Err(ProtocolError::ValidationError(format!(
                "cwd exceeds maximum length of {} characters",
                MAX_PATH_LENGTH
            )));
        }
    }
    Ok(())
}

fn validate_name(field: &str, value: &str) -> ProtocolResult<()> {
    if value.trim().is_empty() {
        return Err(ProtocolError::ValidationError(format!(
            "{} cannot be empty",
            field
        )));
    }
    if value.len() > MAX_NAME_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "{} exceeds maximum length of {} characters",
            field, MAX_NAME_LENGTH
        )));
    }
    Ok(())
}

fn validate_input(field: &str, value: &str) -> ProtocolResult<()> {
    if value.len() > MAX_INPUT_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "{} exceeds maximum length of {} bytes",
            field, MAX_INPUT_LENGTH
        )));
    }
    Ok(())
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::Ping { .. } => Ok(()),

            ClientMessage::StartSession {
                command,
                cwd,
                cols,
                rows,
                env,
                timeout_secs,
                ..
            } => {
                match command {
                    CommandSpec::Tool { name, prompt, .. } => {
                        validate_name("tool name", name)?;
                        if let Some(prompt) = prompt {
                            validate_input("prompt", prompt)?;
                        }
                    }
                    CommandSpec::Exec { program, .. } => validate_name("program", program)?,
                    CommandSpec::Shell { command } => {
                        if command.trim().is_empty() {
                            return Err(ProtocolError::ValidationError(
                                "shell command cannot be empty".to_string(),
                            ));
                        }
                        validate_input("shell command", command)?;
                    }
                    CommandSpec::Terminal => {}
                }

                validate_cwd(cwd)?;
                if let Some(c) = cols {
                    validate_cols(*c)?;
                }
                if let Some(r) = rows {
                    validate_rows(*r)?;
                }

                if let Some(key) = env.keys().find(|k| k.is_empty() || k.contains('=')) {
                    return Err(ProtocolError::ValidationError(format!(
                        "invalid environment variable name {:?}",
                        key
                    )));
                }

                if let Some(secs) = timeout_secs {
                    if *secs == 0 || *secs > MAX_TIMEOUT_SECS {
                        return Err(ProtocolError::ValidationError(format!(
                            "timeout_secs must be between 1 and {}",
                            MAX_TIMEOUT_SECS
                        )));
                    }
                }

                Ok(())
            }

            ClientMessage::SendInput { data, .. } => validate_input("input", data),

            ClientMessage::ResizeTerminal { cols, rows, .. } => {
                validate_cols(*cols)?;
                validate_rows(*rows)
            }

            ClientMessage::RunHelper { program, cwd, .. } => {
                validate_name("program", program)?;
                validate_cwd(cwd)
            }

            ClientMessage::TailLogs { .. }
            | ClientMessage::StopTail { .. }
            | ClientMessage::ReadOutput { .. }
            | ClientMessage::CancelSession { .. }
            | ClientMessage::ListSessions
            | ClientMessage::GetSessionStatus { .. } => Ok(()),
        }
    }

    /// Create a Ping message
    pub fn ping(seq: u64) -> Self {
        ClientMessage::Ping { seq }
    }

    /// Create a StartSession message with server defaults
    pub fn start_session(command: CommandSpec) -> Self {
        ClientMessage::StartSession {
            command,
            cwd: None,
            cols: None,
            rows: None,
            env: HashMap::new(),
            mode: None,
            timeout_secs: None,
        }
    }

    /// Create a SendInput message
    pub fn send_input(target: impl Into<SessionTarget>, data: impl Into<String>) -> Self {
        ClientMessage::SendInput {
            target: target.into(),
            data: data.into(),
        }
    }

    /// Create a TailLogs message
    pub fn tail_logs(target: impl Into<SessionTarget>, offset: usize) -> Self {
        ClientMessage::TailLogs {
            target: target.into(),
            offset,
        }
    }

    /// Create a CancelSession message
    pub fn cancel_session(target: impl Into<SessionTarget>) -> Self {
        ClientMessage::CancelSession {
            target: target.into(),
            purge: false,
        }
    }

    /// Create a ResizeTerminal message
    pub fn resize_terminal(target: impl Into<SessionTarget>, cols: u16, rows: u16) -> Self {
        ClientMessage::ResizeTerminal {
            target: target.into(),
            cols,
            rows,
        }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        /// Server protocol version
        version: u32,
        /// Server identifier/name
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },

    /// Response to Ping
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    /// Session registered; live output follows
    SessionStarted {
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        kind: SessionKind,
        mode: LaunchMode,
        command: String,
        cwd: String,
        cols: u16,
        rows: u16,
    },

    /// Live output pushed to the session's starter
    SessionOutput {
        session_id: SessionId,
        /// Output text (may contain ANSI escape sequences)
        data: String,
    },

    /// End of the live stream
    SessionExited {
        session_id: SessionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit: Option<ExitRecord>,
    },

    /// New text for a tail
    TailOutput {
        session_id: SessionId,
        output: String,
        /// Offset to resume from after a reconnect
        offset: usize,
        /// The requested offset was stale and output restarts at 0
        reset: bool,
    },

    /// A tail finished
    TailEnded {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit: Option<ExitRecord>,
    },

    /// Response to ReadOutput
    OutputChunk {
        #[serde(flatten)]
        target: SessionTarget,
        output: String,
        offset: usize,
        reset: bool,
        running: bool,
    },

    /// Input written to the process
    InputAccepted {
        #[serde(flatten)]
        target: SessionTarget,
        bytes: usize,
    },

    /// Response to CancelSession
    Cancelled {
        #[serde(flatten)]
        target: SessionTarget,
        /// False when there was nothing left to cancel
        success: bool,
    },

    /// Terminal resized
    SessionResized {
        #[serde(flatten)]
        target: SessionTarget,
        cols: u16,
        rows: u16,
    },

    /// All known sessions
    SessionList { sessions: Vec<SessionInfo> },

    /// Status of one session
    SessionStatus { session: SessionInfo },

    /// Completed helper invocation
    HelperResult {
        session_id: SessionId,
        /// Full buffer, banner and trailer included
        output: String,
        exit: ExitRecord,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
        /// Related session if applicable
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format or contents
    InvalidMessage,
    /// No session for the given id or pid
    SessionNotFound,
    /// Session has no open input route
    SessionNotWritable,
    /// Process did not accept input within the input timeout
    InputTimeout,
    /// Tool name has no preset
    UnknownTool,
    /// Session has no terminal
    NotResizable,
    /// Internal server error
    InternalError,
    /// Unsupported protocol version
    UnsupportedVersion,
}

impl ServerMessage {
    /// Create a Welcome message
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server_id: None,
        }
    }

    /// Create a Pong message
    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    /// Create a SessionStarted message
    pub fn session_started(info: &SessionInfo) -> Self {
        ServerMessage::SessionStarted {
            session_id: info.session_id,
            pid: info.pid,
            kind: info.kind,
            mode: info.mode,
            command: info.command.clone(),
            cwd: info.cwd.clone(),
            cols: info.cols,
            rows: info.rows,
        }
    }

    /// Create a SessionOutput message
    pub fn session_output(session_id: SessionId, data: impl Into<String>) -> Self {
        ServerMessage::SessionOutput {
            session_id,
            data: data.into(),
        }
    }

    /// Create a SessionExited message
    pub fn session_exited(session_id: SessionId, exit: Option<ExitRecord>) -> Self {
        ServerMessage::SessionExited { session_id, exit }
    }

    /// Create a TailOutput message
    pub fn tail_output(session_id: SessionId, chunk: ReplayChunk) -> Self {
        ServerMessage::TailOutput {
            session_id,
            output: chunk.output,
            offset: chunk.offset,
            reset: chunk.reset,
        }
    }

    /// Create a TailEnded message
    pub fn tail_ended(
        session_id: Option<SessionId>,
        message: Option<String>,
        exit: Option<ExitRecord>,
    ) -> Self {
        ServerMessage::TailEnded {
            session_id,
            message,
            exit,
        }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: None,
        }
    }

    /// Create an Error message for a specific session
    pub fn session_error(session_id: SessionId, message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
            session_id: Some(session_id),
        }
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

impl From<SessionError> for ServerMessage {
    fn from(err: SessionError) -> Self {
        let code = match &err {
            SessionError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            SessionError::SessionNotWritable(_) => ErrorCode::SessionNotWritable,
            SessionError::InputTimeout(_) => ErrorCode::InputTimeout,
            SessionError::UnknownTool(_) => ErrorCode::UnknownTool,
            SessionError::InvalidRequest(_) => ErrorCode::InvalidMessage,
            SessionError::Launch(LaunchError::NotResizable) => ErrorCode::NotResizable,
            SessionError::WriteFailed(_) | SessionError::Launch(_) => ErrorCode::InternalError,
        };

        match &err {
            SessionError::SessionNotWritable(id)
            | SessionError::InputTimeout(id)
            | SessionError::SessionNotFound(SessionTarget::SessionId(id)) => {
                ServerMessage::session_error(*id, err.to_string(), code)
            }
            _ => ServerMessage::error_with_code(err.to_string(), code),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
