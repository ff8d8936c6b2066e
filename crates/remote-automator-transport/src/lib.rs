//! Transport layer to the automation target.
//!
//! Provides:
//! - Wire protocol (JSON requests, responses and events)
//! - Websocket RPC client with response correlation and event broadcast

pub mod client;
pub mod protocol;

pub use client::{TransportError, WsClient};
pub use protocol::{Event, Incoming, RemoteError, Request, Response};
