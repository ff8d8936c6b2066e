//! Seams to the automation target.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::{config::LaunchOptions, event::TargetEvent};

/// Connection error.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Target error: {0}")]
    Target(String),
    #[error("Connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An established session with the automation target.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Page/view context handed to page-scoped operations.
    type Page: Send + 'static;

    /// Subscribe to console and exception events.
    ///
    /// Dropping the receiver unsubscribes.
    fn events(&self) -> broadcast::Receiver<TargetEvent>;

    /// Top of the navigation stack, or `None` when the stack is empty.
    async fn current_page(&self) -> Result<Option<Self::Page>, ConnectionError>;

    /// Terminate an owned (launched) target.
    async fn close(&self) -> Result<(), ConnectionError>;

    /// Detach from a target this process does not own.
    async fn disconnect(&self) -> Result<(), ConnectionError>;
}

/// Factory for connections.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Attach to a running target.
    async fn connect(
        &self,
        ws_endpoint: &str,
        timeout: Option<Duration>,
    ) -> Result<Self::Connection, ConnectionError>;

    /// Spawn a target and attach to it.
    async fn launch(&self, options: &LaunchOptions) -> Result<Self::Connection, ConnectionError>;
}
