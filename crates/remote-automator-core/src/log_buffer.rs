//! Bounded, ordered log of target events with live broadcast.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::wrappers::BroadcastStream;

use crate::event::TargetEvent;

/// Maximum number of retained entries.
pub const LOG_CAPACITY: usize = 1000;

/// One captured target event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Console method (`log`, `warn`, ...) or `exception`.
    pub kind: String,
    pub message: String,
    /// Unix epoch milliseconds at capture.
    pub timestamp: i64,
    /// JSON-safe serialisation of the full payload.
    pub data: Value,
}

impl LogEntry {
    /// Build an entry from an event observed at `timestamp`.
    #[must_use]
    pub fn from_event(event: &TargetEvent, timestamp: i64) -> Self {
        Self {
            kind: event.kind().to_owned(),
            message: event.message(),
            timestamp,
            data: event.payload().to_json_safe(),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Log buffer with FIFO eviction and live listeners.
///
/// Shared between the session manager and the forwarding task of the
/// active connection.
pub struct LogBuffer {
    history: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
    sender: broadcast::Sender<LogEntry>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    /// Create a buffer holding [`LOG_CAPACITY`] entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    /// Create a buffer with a custom capacity (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(1024);
        Self {
            history: RwLock::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            sender,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&self, entry: LogEntry) {
        {
            let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
            while history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }
        let _ = self.sender.send(entry); // live listeners
    }

    /// Capture an event with the current time.
    pub fn record(&self, event: &TargetEvent) {
        self.push(LogEntry::from_event(event, now_millis()));
    }

    /// Copy of the retained entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all retained entries. Live listeners are unaffected.
    pub fn clear(&self) {
        self.history.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Receiver for entries pushed from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    /// Stream that yields retained history first, then live entries.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, LogEntry> {
        let (history, rx) = (self.entries(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }

    /// Pump a connection's event stream into this buffer.
    ///
    /// Runs until the sender side closes or the task is aborted. Aborting the
    /// task drops the receiver, which unsubscribes from the connection.
    pub fn spawn_forwarder(self: Arc<Self>, mut events: broadcast::Receiver<TargetEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.record(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "log forwarder lagged behind target events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
