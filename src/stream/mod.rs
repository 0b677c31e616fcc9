//! Push channel client.
//!
//! One duplex connection per dashboard session, carrying JSON envelopes in
//! both directions.
//!
//! ## Architecture
//!
//! - `protocol`: envelope format, inbound type mapping, outbound commands
//! - `listeners`: per-client event bus (`on` / `off` / `emit`)
//! - `transport`: connector seam and the WebSocket implementation
//! - `client`: connection lifecycle, dispatch and bounded reconnection

mod client;
mod listeners;
pub mod protocol;
mod transport;

use std::sync::Arc;

use crate::config::AppConfig;

pub use client::{ConnectionState, EventStreamClient, ReconnectPolicy};
pub use listeners::{EventBus, ListenerId};
pub use protocol::{Command, EventKind, MessageType, StreamEvent};
pub use transport::{Connection, Connector, WebSocketConnector};

/// Build a WebSocket-backed client for the configured push endpoint and session.
pub fn create_client(config: &AppConfig) -> EventStreamClient {
    let connector = Arc::new(
        WebSocketConnector::new(config.push_endpoint())
            .with_connect_timeout(config.request_timeout()),
    );
    EventStreamClient::new(connector, ReconnectPolicy::from(config))
}
