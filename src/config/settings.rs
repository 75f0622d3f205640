//! Bridge settings
//!
//! Loads bridge configuration from a TOML file. Every section is optional and
//! a missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::process::{SearchPath, TerminalSize};
use crate::session::SessionKind;

/// Configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "agelum-bridge.toml";

/// Directory and file name under the user config dir
pub const USER_CONFIG_DIR: &str = "agelum";
pub const USER_CONFIG_FILE: &str = "bridge.toml";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
        }
    }
}

/// `[sessions]` section: lifecycle timings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Eviction delay after exit for tool and terminal sessions
    pub interactive_grace_ms: u64,
    /// Eviction delay after exit for one-shot commands
    pub command_grace_ms: u64,
    /// Upper bound on how long a tail sleeps between checks
    pub poll_interval_ms: u64,
    /// How long to keep reading output after the process exited
    pub drain_timeout_ms: u64,
    /// Delay between SIGTERM and SIGKILL on cancel
    pub kill_escalation_ms: u64,
    /// Wall-clock ceiling for helper invocations
    pub helper_timeout_secs: u64,
    /// How long one input write may wait for the process to accept it
    pub input_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            interactive_grace_ms: 10_000,
            command_grace_ms: 10_000,
            poll_interval_ms: 100,
            drain_timeout_ms: 500,
            kill_escalation_ms: 5_000,
            helper_timeout_secs: 30,
            input_timeout_ms: 5_000,
        }
    }
}

impl SessionSettings {
    /// Eviction delay for a session kind
    pub fn grace_for(&self, kind: SessionKind) -> Duration {
        match kind {
            SessionKind::Interactive => Duration::from_millis(self.interactive_grace_ms),
            SessionKind::Command => Duration::from_millis(self.command_grace_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn kill_escalation(&self) -> Duration {
        Duration::from_millis(self.kill_escalation_ms)
    }

    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_timeout_secs)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_millis(self.input_timeout_ms)
    }
}

/// `[launcher]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherSettings {
    /// Use a PTY for interactive sessions where the platform allows it
    pub pty: bool,
    /// Shell for `shell` and `terminal` sessions; `$SHELL` when unset
    pub shell: Option<String>,
    /// Searched after the standard dirs, before the inherited `PATH`
    pub extra_search_paths: Vec<PathBuf>,
    pub default_cols: u16,
    pub default_rows: u16,
    /// Working directory for requests that name none; the bridge's own cwd
    /// when unset
    pub default_cwd: Option<PathBuf>,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            pty: true,
            shell: None,
            extra_search_paths: Vec::new(),
            default_cols: 80,
            default_rows: 24,
            default_cwd: None,
        }
    }
}

impl LauncherSettings {
    pub fn shell(&self) -> String {
        self.shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }

    pub fn search_path(&self) -> SearchPath {
        SearchPath::augmented(&self.extra_search_paths)
    }

    pub fn default_size(&self) -> TerminalSize {
        TerminalSize::new(self.default_cols, self.default_rows)
    }

    pub fn default_cwd(&self) -> PathBuf {
        self.default_cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"))
    }
}

/// How to invoke a named tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolPreset {
    /// Name used in start requests
    pub name: String,
    /// Executable to resolve
    pub command: String,
    /// Arguments placed before everything else
    #[serde(default)]
    pub args: Vec<String>,
    /// Flag (or subcommand) preceding the prompt
    pub prompt_flag: Option<String>,
    /// Flag preceding the model name; models are ignored when unset
    pub model_flag: Option<String>,
    /// Arguments added when the request asks for permissive mode
    #[serde(default)]
    pub permissive_args: Vec<String>,
}

impl ToolPreset {
    fn new(name: &str, command: &str, prompt_flag: &str, model_flag: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            prompt_flag: Some(prompt_flag.to_string()),
            model_flag: model_flag.map(str::to_string),
            permissive_args: Vec::new(),
        }
    }

    fn with_permissive(mut self, args: &[&str]) -> Self {
        self.permissive_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Build the argument vector for one invocation
    pub fn command_args(
        &self,
        prompt: Option<&str>,
        model: Option<&str>,
        permissive: bool,
        extra: &[String],
    ) -> Vec<String> {
        let mut args = self.args.clone();
        if permissive {
            args.extend(self.permissive_args.iter().cloned());
        }
        if let Some(prompt) = prompt {
            if let Some(flag) = &self.prompt_flag {
                args.push(flag.clone());
            }
            args.push(prompt.to_string());
        }
        if let (Some(flag), Some(model)) = (&self.model_flag, model) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        args.extend(extra.iter().cloned());
        args
    }
}

/// Presets available without any configuration
pub fn builtin_tools() -> Vec<ToolPreset> {
    vec![
        ToolPreset::new("claude", "claude", "-p", None)
            .with_permissive(&["--dangerously-skip-permissions"]),
        ToolPreset::new("opencode", "opencode", "run", Some("--model")),
        ToolPreset::new("cursor", "cursor-agent", "-p", Some("--model"))
            .with_permissive(&["--force"]),
        ToolPreset::new("trae", "trae-cli", "run", Some("--model")),
    ]
}

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerSettings,
    pub sessions: SessionSettings,
    pub launcher: LauncherSettings,
    /// Presets from the file; these shadow built-ins of the same name
    pub tools: Vec<ToolPreset>,
}

impl BridgeConfig {
    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// First existing file among `./agelum-bridge.toml` and
    /// `<config dir>/agelum/bridge.toml`
    pub fn default_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.is_file() {
            return Some(local);
        }

        dirs::config_dir()
            .map(|dir| dir.join(USER_CONFIG_DIR).join(USER_CONFIG_FILE))
            .filter(|path| path.is_file())
    }

    /// Load from the default location, or fall back to defaults
    pub fn load_default() -> Result<(Self, Option<PathBuf>), ConfigError> {
        match Self::default_path() {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.launcher.default_cols == 0 || self.launcher.default_rows == 0 {
            return Err(ConfigError::Invalid(
                "launcher.default_cols and default_rows must be positive".to_string(),
            ));
        }
        if self.sessions.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "sessions.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.sessions.input_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sessions.input_timeout_ms must be positive".to_string(),
            ));
        }
        if let Some(tool) = self
            .tools
            .iter()
            .find(|t| t.name.is_empty() || t.command.is_empty())
        {
            return Err(ConfigError::Invalid(format!(
                "tool preset {:?} needs a name and a command",
                tool.name
            )));
        }
        Ok(())
    }

    /// Look up a tool preset by name
    pub fn tool(&self, name: &str) -> Option<ToolPreset> {
        self.tools
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .or_else(|| builtin_tools().into_iter().find(|t| t.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.sessions.grace_for(SessionKind::Command), Duration::from_secs(10));
        assert_eq!(config.sessions.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.sessions.input_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[server]
port = 9100

[sessions]
interactive_grace_ms = 60000

[launcher]
pty = false
extra_search_paths = ["/opt/tools/bin"]
"#,
        )
        .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(
            config.sessions.grace_for(SessionKind::Interactive),
            Duration::from_secs(60)
        );
        assert_eq!(config.sessions.command_grace_ms, 10_000);
        assert!(!config.launcher.pty);
        assert!(config
            .launcher
            .search_path()
            .dirs()
            .contains(&PathBuf::from("/opt/tools/bin")));
    }

    #[test]
    fn test_custom_tool_shadows_builtin() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"
[[tools]]
name = "claude"
command = "/usr/local/bin/claude-wrapper"
prompt_flag = "--prompt"
"#,
        )
        .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        let claude = config.tool("claude").unwrap();
        assert_eq!(claude.command, "/usr/local/bin/claude-wrapper");
        assert!(config.tool("opencode").is_some());
        assert!(config.tool("nope").is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[launcher]\ndefault_cols = 0\n").unwrap();
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "[sessions]\ninput_timeout_ms = 0\n").unwrap();
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(BridgeConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_tool_command_args() {
        let opencode = BridgeConfig::default().tool("opencode").unwrap();
        let args = opencode.command_args(Some("fix it"), Some("gpt-5"), false, &[]);
        assert_eq!(args, vec!["run", "fix it", "--model", "gpt-5"]);

        let claude = BridgeConfig::default().tool("claude").unwrap();
        let args = claude.command_args(Some("hi"), Some("ignored"), true, &[]);
        assert_eq!(args, vec!["--dangerously-skip-permissions", "-p", "hi"]);

        let bare = claude.command_args(None, None, false, &[]);
        assert!(bare.is_empty());
    }
}
