//! Layered connection configuration.
//!
//! Configuration is merged from three layers in ascending precedence:
//! the previous session's meaningful fields, the environment snapshot and
//! the caller's overrides. Mode is inferred after the merge and the result
//! is validated before it is handed to the session manager.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    env::EnvSnapshot,
    error::{ConfigLayer, ConfigurationError},
};

/// How a session reaches the automation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Spawn the target; the session owns its lifecycle.
    Launch,
    /// Attach to an already running target.
    Connect,
}

impl ConnectionMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Connect => "connect",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "launch" => Ok(Self::Launch),
            "connect" => Ok(Self::Connect),
            other => Err(format!("expected `launch` or `connect`, got `{other}`")),
        }
    }
}

impl<'de> Deserialize<'de> for ConnectionMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Sparse, per-layer connection configuration.
///
/// Absence of a field is meaningful: it lets a lower layer supply it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConnectionOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ConnectionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_project: Option<bool>,
    /// Either a whitespace-delimited string or a list of strings.
    #[serde(
        default,
        deserialize_with = "deserialize_args",
        skip_serializing_if = "Option::is_none"
    )]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_close: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArgsInput {
    Line(String),
    List(Vec<String>),
}

fn deserialize_args<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<String>>, D::Error> {
    Ok(Option::<ArgsInput>::deserialize(deserializer)?.map(|input| match input {
        ArgsInput::Line(line) => split_args(&line),
        ArgsInput::List(list) => list,
    }))
}

/// Split a whitespace-delimited argument line.
#[must_use]
pub fn split_args(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_owned).collect()
}

impl ConnectionOverrides {
    /// Parse caller-supplied JSON overrides.
    ///
    /// # Errors
    /// Returns error if the value does not match the overrides schema.
    pub fn from_json(value: Value) -> Result<Self, ConfigurationError> {
        serde_json::from_value(value).map_err(|e| ConfigurationError::InvalidOverrides(e.to_string()))
    }

    /// Trim strings, check numeric ranges and normalise `args`.
    ///
    /// # Errors
    /// Returns error naming the offending field and layer.
    pub fn normalize(self, layer: ConfigLayer) -> Result<Self, ConfigurationError> {
        let text = |field: &'static str, value: Option<String>| -> Result<Option<String>, ConfigurationError> {
            match value {
                None => Ok(None),
                Some(raw) => {
                    let trimmed = raw.trim();
                    if trimmed.is_empty() {
                        Err(ConfigurationError::invalid(layer, field, "must not be empty"))
                    } else {
                        Ok(Some(trimmed.to_owned()))
                    }
                }
            }
        };

        if self.timeout == Some(0) {
            return Err(ConfigurationError::invalid(layer, "timeout", "must be a positive integer"));
        }
        if self.port == Some(0) {
            return Err(ConfigurationError::invalid(layer, "port", "must be a positive integer"));
        }

        Ok(Self {
            mode: self.mode,
            cli_path: text("cliPath", self.cli_path)?,
            project_path: text("projectPath", self.project_path)?,
            ws_endpoint: text("wsEndpoint", self.ws_endpoint)?,
            timeout: self.timeout,
            port: self.port,
            account: text("account", self.account)?,
            ticket: text("ticket", self.ticket)?,
            trust_project: self.trust_project,
            args: normalize_args(self.args),
            cwd: text("cwd", self.cwd)?,
            auto_close: self.auto_close,
        })
    }

    /// Fields of a resolved config worth carrying into the next call.
    ///
    /// Mode is left out; it only acts as the inference fallback.
    #[must_use]
    pub fn carried_from(previous: &ResolvedConfig) -> Self {
        let text = |value: &Option<String>| value.clone().filter(|s| !s.trim().is_empty());
        Self {
            mode: None,
            cli_path: text(&previous.cli_path),
            project_path: text(&previous.project_path),
            ws_endpoint: text(&previous.ws_endpoint),
            timeout: previous.timeout.filter(|t| *t > 0),
            port: previous.port.filter(|p| *p > 0),
            account: text(&previous.account),
            ticket: text(&previous.ticket),
            trust_project: previous.trust_project.filter(|b| *b),
            args: normalize_args(previous.args.clone()),
            cwd: text(&previous.cwd),
            auto_close: previous.auto_close.filter(|b| *b),
        }
    }

    /// Overlay `upper` on top of `self`; every field `upper` defines wins.
    #[must_use]
    pub fn overlay(self, upper: Self) -> Self {
        Self {
            mode: upper.mode.or(self.mode),
            cli_path: upper.cli_path.or(self.cli_path),
            project_path: upper.project_path.or(self.project_path),
            ws_endpoint: upper.ws_endpoint.or(self.ws_endpoint),
            timeout: upper.timeout.or(self.timeout),
            port: upper.port.or(self.port),
            account: upper.account.or(self.account),
            ticket: upper.ticket.or(self.ticket),
            trust_project: upper.trust_project.or(self.trust_project),
            args: upper.args.or(self.args),
            cwd: upper.cwd.or(self.cwd),
            auto_close: upper.auto_close.or(self.auto_close),
        }
    }
}

fn normalize_args(args: Option<Vec<String>>) -> Option<Vec<String>> {
    let args: Vec<String> = args?
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .map(str::to_owned)
        .collect();
    (!args.is_empty()).then_some(args)
}

/// Configuration actually used to open or reuse a session.
///
/// Equality is structural and order-sensitive for `args`; it drives the
/// reuse decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub mode: ConnectionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cli_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_project: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_close: Option<bool>,
}

impl ResolvedConfig {
    fn from_parts(mode: ConnectionMode, merged: ConnectionOverrides) -> Self {
        Self {
            mode,
            cli_path: merged.cli_path,
            project_path: merged.project_path,
            ws_endpoint: merged.ws_endpoint,
            timeout: merged.timeout,
            port: merged.port,
            account: merged.account,
            ticket: merged.ticket,
            trust_project: merged.trust_project,
            args: merged.args,
            cwd: merged.cwd,
            auto_close: merged.auto_close,
        }
    }

    /// Check the mandatory field for the mode.
    ///
    /// # Errors
    /// Returns error naming the missing field.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        match self.mode {
            ConnectionMode::Connect if self.ws_endpoint.is_none() => {
                Err(ConfigurationError::MissingWsEndpoint)
            }
            ConnectionMode::Launch if self.project_path.is_none() => {
                Err(ConfigurationError::MissingProjectPath)
            }
            _ => Ok(()),
        }
    }

    /// Whether the session should be torn down after each operation.
    #[must_use]
    pub fn auto_close(&self) -> bool {
        self.auto_close.unwrap_or(false)
    }

    /// Connect/launch timeout, if configured.
    #[must_use]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }

    /// What to dial or spawn for this configuration.
    ///
    /// # Errors
    /// Returns error if the mandatory field for the mode is missing.
    pub fn target(&self) -> Result<ConnectionTarget, ConfigurationError> {
        match self.mode {
            ConnectionMode::Connect => Ok(ConnectionTarget::Connect {
                ws_endpoint: self
                    .ws_endpoint
                    .clone()
                    .ok_or(ConfigurationError::MissingWsEndpoint)?,
                timeout: self.timeout_duration(),
            }),
            ConnectionMode::Launch => Ok(ConnectionTarget::Launch(LaunchOptions {
                cli_path: self.cli_path.clone(),
                project_path: self
                    .project_path
                    .clone()
                    .ok_or(ConfigurationError::MissingProjectPath)?,
                timeout: self.timeout_duration(),
                port: self.port,
                account: self.account.clone(),
                ticket: self.ticket.clone(),
                trust_project: self.trust_project.unwrap_or(false),
                args: self.args.clone().unwrap_or_default(),
                cwd: self.cwd.clone(),
            })),
        }
    }
}

/// Options for spawning an owned automation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    pub cli_path: Option<String>,
    pub project_path: String,
    pub timeout: Option<Duration>,
    pub port: Option<u16>,
    pub account: Option<String>,
    pub ticket: Option<String>,
    pub trust_project: bool,
    pub args: Vec<String>,
    pub cwd: Option<String>,
}

/// Connection recipe derived from a [`ResolvedConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Connect {
        ws_endpoint: String,
        timeout: Option<Duration>,
    },
    Launch(LaunchOptions),
}

/// Merge, infer and validate.
///
/// Pure function of its three inputs.
///
/// # Errors
/// Returns error if any layer fails schema validation or the mandatory
/// field for the inferred mode is missing.
pub fn resolve(
    overrides: Option<&ConnectionOverrides>,
    previous: Option<&ResolvedConfig>,
    env: &EnvSnapshot,
) -> Result<ResolvedConfig, ConfigurationError> {
    let carried = previous.map(ConnectionOverrides::carried_from).unwrap_or_default();
    let from_env = env.to_overrides()?.normalize(ConfigLayer::Environment)?;
    let from_caller = overrides
        .cloned()
        .unwrap_or_default()
        .normalize(ConfigLayer::Overrides)?;

    let merged = carried.overlay(from_env).overlay(from_caller);
    let mode = infer_mode(&merged, previous);
    let resolved = ResolvedConfig::from_parts(mode, merged);
    resolved.validate()?;
    Ok(resolved)
}

/// [`resolve`] against a fresh snapshot of the process environment.
///
/// # Errors
/// See [`resolve`].
pub fn resolve_from_env(
    overrides: Option<&ConnectionOverrides>,
    previous: Option<&ResolvedConfig>,
) -> Result<ResolvedConfig, ConfigurationError> {
    resolve(overrides, previous, &EnvSnapshot::capture())
}

fn infer_mode(merged: &ConnectionOverrides, previous: Option<&ResolvedConfig>) -> ConnectionMode {
    if let Some(mode) = merged.mode {
        mode
    } else if merged.ws_endpoint.is_some() {
        ConnectionMode::Connect
    } else {
        previous.map_or(ConnectionMode::Launch, |p| p.mode)
    }
}
