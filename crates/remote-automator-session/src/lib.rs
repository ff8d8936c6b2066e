//! Session orchestration for automation targets.
//!
//! Provides:
//! - `SessionManager` - Reuse-or-reconnect lifecycle around a single connection
//! - `ConnectionRequest` - Per-call overrides and reconnect flag

pub mod manager;

pub use manager::{ConnectionRequest, PageOf, SessionManager};
