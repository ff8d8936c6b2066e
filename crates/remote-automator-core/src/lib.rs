//! Core abstractions for automation target sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `resolve` - Layered configuration merge, mode inference and validation
//! - `EnvSnapshot` - Isolated read of the process environment
//! - `LogBuffer` - Bounded event log with live broadcast
//! - `Connector` and `Connection` traits

pub mod config;
pub mod env;
pub mod error;
pub mod event;
pub mod log_buffer;
pub mod traits;

pub use config::{
    ConnectionMode, ConnectionOverrides, ConnectionTarget, LaunchOptions, ResolvedConfig, resolve,
    resolve_from_env,
};
pub use env::EnvSnapshot;
pub use error::{ConfigLayer, ConfigurationError, SessionError};
pub use event::{EventValue, TargetEvent};
pub use log_buffer::{LOG_CAPACITY, LogBuffer, LogEntry};
pub use traits::{Connection, ConnectionError, Connector};
