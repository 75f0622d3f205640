//! Executable resolution over an augmented search path
//!
//! Desktop launches inherit a minimal `PATH`, so tools installed through
//! Homebrew, cargo, bun or npm would otherwise be invisible. The search path
//! puts the usual install locations in front of whatever was inherited.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::LaunchError;

/// System locations searched before anything else
pub const STANDARD_SEARCH_DIRS: &[&str] = &[
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];

/// Per-user tool install directories, relative to `$HOME`
pub const HOME_TOOL_DIRS: &[&str] = &[
    ".local/bin",
    ".cargo/bin",
    ".bun/bin",
    ".npm-global/bin",
    ".opencode/bin",
    ".deno/bin",
];

/// Ordered list of directories used both for resolution and as the child's `PATH`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    dirs: Vec<PathBuf>,
}

impl SearchPath {
    /// Standard dirs, home tool dirs, `extra`, then the inherited `PATH`
    pub fn augmented(extra: &[PathBuf]) -> Self {
        let mut dirs: Vec<PathBuf> = STANDARD_SEARCH_DIRS.iter().map(PathBuf::from).collect();

        if let Some(home) = dirs::home_dir() {
            dirs.extend(HOME_TOOL_DIRS.iter().map(|d| home.join(d)));
        }

        dirs.extend(extra.iter().cloned());

        if let Some(inherited) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&inherited));
        }

        Self::from_dirs(dirs)
    }

    /// Build from an explicit list, dropping empty entries and duplicates
    pub fn from_dirs(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut unique: Vec<PathBuf> = Vec::new();
        for dir in dirs {
            if dir.as_os_str().is_empty() || unique.contains(&dir) {
                continue;
            }
            unique.push(dir);
        }
        Self { dirs: unique }
    }

    #[cfg(test)]
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Value suitable for the child's `PATH` variable
    pub fn to_env_value(&self) -> OsString {
        // join_paths only fails on entries containing the separator itself;
        // skip those rather than losing the whole path.
        let usable = self
            .dirs
            .iter()
            .filter(|d| std::env::join_paths([d.as_path()]).is_ok());
        std::env::join_paths(usable).unwrap_or_default()
    }

    /// Resolve `command` to an executable path.
    ///
    /// Bare names are looked up in the search path; anything containing a
    /// path separator is taken verbatim (relative to `cwd`) if it is
    /// executable. Fails with [`LaunchError::ToolUnavailable`] otherwise.
    pub fn resolve(&self, command: &str, cwd: &Path) -> Result<PathBuf, LaunchError> {
        if command.trim().is_empty() {
            return Err(LaunchError::ToolUnavailable(
                "empty command name".to_string(),
            ));
        }

        which::which_in(command, Some(self.to_env_value()), cwd)
            .map_err(|_| LaunchError::ToolUnavailable(command.to_string()))
    }
}
