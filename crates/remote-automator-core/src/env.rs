//! Process environment snapshot.
//!
//! The only place that reads ambient process state. Everything downstream
//! works on an [`EnvSnapshot`] value.

use std::collections::BTreeMap;

use crate::{
    config::{ConnectionMode, ConnectionOverrides, split_args},
    error::{ConfigLayer, ConfigurationError},
};

pub const ENV_MODE: &str = "AUTOMATOR_MODE";
pub const ENV_CLI_PATH: &str = "AUTOMATOR_CLI_PATH";
pub const ENV_WS_ENDPOINT: &str = "AUTOMATOR_WS_ENDPOINT";
pub const ENV_TIMEOUT: &str = "AUTOMATOR_TIMEOUT";
pub const ENV_PORT: &str = "AUTOMATOR_PORT";
pub const ENV_ACCOUNT: &str = "AUTOMATOR_ACCOUNT";
pub const ENV_TICKET: &str = "AUTOMATOR_TICKET";
pub const ENV_TRUST_PROJECT: &str = "AUTOMATOR_TRUST_PROJECT";
pub const ENV_ARGS: &str = "AUTOMATOR_ARGS";
pub const ENV_CWD: &str = "AUTOMATOR_CWD";
pub const ENV_AUTO_CLOSE: &str = "AUTOMATOR_AUTO_CLOSE";

/// Every variable consulted during resolution.
pub const ENV_VARS: [&str; 11] = [
    ENV_MODE,
    ENV_CLI_PATH,
    ENV_WS_ENDPOINT,
    ENV_TIMEOUT,
    ENV_PORT,
    ENV_ACCOUNT,
    ENV_TICKET,
    ENV_TRUST_PROJECT,
    ENV_ARGS,
    ENV_CWD,
    ENV_AUTO_CLOSE,
];

/// Raw values of the designated environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    values: BTreeMap<&'static str, String>,
}

impl EnvSnapshot {
    /// Read the designated variables from the current process.
    #[must_use]
    pub fn capture() -> Self {
        Self::from_pairs(
            ENV_VARS
                .iter()
                .filter_map(|name| std::env::var(name).ok().map(|value| (*name, value))),
        )
    }

    /// Build a snapshot from explicit pairs.
    ///
    /// Names outside [`ENV_VARS`] are ignored. Blank values are kept so that
    /// resolution rejects them like blank caller overrides.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut values = BTreeMap::new();
        for (key, value) in pairs {
            let Some(name) = ENV_VARS.iter().copied().find(|n| *n == key.as_ref()) else {
                continue;
            };
            values.insert(name, value.into());
        }
        Self { values }
    }

    /// Raw value of a variable.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Coerce the raw text into typed overrides.
    ///
    /// # Errors
    /// Returns error naming the variable whose value cannot be coerced.
    pub fn to_overrides(&self) -> Result<ConnectionOverrides, ConfigurationError> {
        let text = |name: &str| self.get(name).map(str::to_owned);

        let mode = self
            .get(ENV_MODE)
            .map(|raw| {
                raw.parse::<ConnectionMode>()
                    .map_err(|reason| ConfigurationError::invalid(ConfigLayer::Environment, ENV_MODE, reason))
            })
            .transpose()?;

        let timeout = self
            .get(ENV_TIMEOUT)
            .map(|raw| parse_positive(ENV_TIMEOUT, raw))
            .transpose()?;

        let port = self
            .get(ENV_PORT)
            .map(|raw| {
                parse_positive(ENV_PORT, raw).and_then(|p| {
                    u16::try_from(p).map_err(|_| {
                        ConfigurationError::invalid(ConfigLayer::Environment, ENV_PORT, format!("{p} is not a valid port"))
                    })
                })
            })
            .transpose()?;

        Ok(ConnectionOverrides {
            mode,
            cli_path: text(ENV_CLI_PATH),
            project_path: None,
            ws_endpoint: text(ENV_WS_ENDPOINT),
            timeout,
            port,
            account: text(ENV_ACCOUNT),
            ticket: text(ENV_TICKET),
            trust_project: self
                .get(ENV_TRUST_PROJECT)
                .map(|raw| parse_bool(ENV_TRUST_PROJECT, raw))
                .transpose()?,
            args: self.get(ENV_ARGS).map(split_args),
            cwd: text(ENV_CWD),
            auto_close: self
                .get(ENV_AUTO_CLOSE)
                .map(|raw| parse_bool(ENV_AUTO_CLOSE, raw))
                .transpose()?,
        })
    }
}

fn parse_positive(name: &'static str, raw: &str) -> Result<u64, ConfigurationError> {
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigurationError::invalid(
            ConfigLayer::Environment,
            name,
            format!("`{}` is not a positive integer", raw.trim()),
        )),
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigurationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigurationError::invalid(
            ConfigLayer::Environment,
            name,
            format!("`{other}` is not a boolean"),
        )),
    }
}
