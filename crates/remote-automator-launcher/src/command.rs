//! Launch command construction.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use remote_automator_core::LaunchOptions;
use tokio::process::Command;

/// Automation port used when none is configured.
pub const DEFAULT_PORT: u16 = 9420;

/// CLI invocation that starts the target in automation mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// CLI as configured, before resolution.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub port: u16,
}

impl LaunchCommand {
    /// Build the invocation for `options`.
    ///
    /// Produces `auto --project <path> --auto-port <port>`, then the optional
    /// account, ticket and trust flags, then the caller's extra arguments.
    #[must_use]
    pub fn from_options(options: &LaunchOptions) -> Self {
        let port = options.port.unwrap_or(DEFAULT_PORT);
        let mut args = vec![
            "auto".to_string(),
            "--project".to_string(),
            options.project_path.clone(),
            "--auto-port".to_string(),
            port.to_string(),
        ];
        if let Some(account) = &options.account {
            args.extend(["--auto-account".to_string(), account.clone()]);
        }
        if let Some(ticket) = &options.ticket {
            args.extend(["--ticket".to_string(), ticket.clone()]);
        }
        if options.trust_project {
            args.push("--trust-project".to_string());
        }
        args.extend(options.args.iter().cloned());

        Self {
            program: options.cli_path.clone(),
            args,
            cwd: options.cwd.as_ref().map(PathBuf::from),
            port,
        }
    }

    /// Endpoint the target listens on once started.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    /// Shell-quoted rendering for logs.
    #[must_use]
    pub fn display(&self, executable: &Path) -> String {
        let program = executable.to_string_lossy();
        let parts = std::iter::once(program.as_ref()).chain(self.args.iter().map(String::as_str));
        shlex::try_join(parts.clone()).unwrap_or_else(|_| parts.collect::<Vec<_>>().join(" "))
    }

    /// Process builder for the resolved `executable`.
    #[must_use]
    pub fn to_command(&self, executable: &Path) -> Command {
        let mut command = Command::new(executable);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}
