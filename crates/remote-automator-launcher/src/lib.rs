//! Developer-tool automation target.
//!
//! Provides:
//! - CLI discovery
//! - Launch command construction
//! - `Connector`/`Connection` implementations over the websocket transport

pub mod cli;
pub mod command;
pub mod connector;

pub use cli::{DEFAULT_CLI_PATH, resolve_cli_path};
pub use command::{DEFAULT_PORT, LaunchCommand};
pub use connector::{DEFAULT_LAUNCH_TIMEOUT, DevtoolsConnection, DevtoolsConnector, PageInfo};
