//! Locating the developer-tool CLI.

use std::path::{Path, PathBuf};

use remote_automator_core::ConnectionError;

/// Where the CLI lives on a stock install.
#[cfg(target_os = "macos")]
pub const DEFAULT_CLI_PATH: &str = "/Applications/wechatwebdevtools.app/Contents/MacOS/cli";
#[cfg(windows)]
pub const DEFAULT_CLI_PATH: &str = r"C:\Program Files (x86)\Tencent\微信web开发者工具\cli.bat";
#[cfg(not(any(target_os = "macos", windows)))]
pub const DEFAULT_CLI_PATH: &str = "cli";

/// Resolve the CLI to an executable path.
///
/// The search order is:
/// 1. Explicit paths (absolute or containing a separator) must exist.
/// 2. Bare names are looked up on `PATH` via `which`.
///
/// # Errors
/// Returns `ExecutableNotFound` when nothing matches.
pub async fn resolve_cli_path(cli_path: Option<&str>) -> Result<PathBuf, ConnectionError> {
    let candidate = cli_path.map_or(DEFAULT_CLI_PATH, str::trim);
    if candidate.is_empty() {
        return Err(ConnectionError::ExecutableNotFound(String::new()));
    }

    let path = Path::new(candidate);
    if path.is_absolute() || path.components().count() > 1 {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(ConnectionError::ExecutableNotFound(candidate.to_string()))
        };
    }

    which_async(candidate)
        .await
        .ok_or_else(|| ConnectionError::ExecutableNotFound(candidate.to_string()))
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}
