//! Gateway: WebSocket server, protocol dispatch, session and conversation
//! registries, ingest pipeline, shutdown coordination.
//!
//! Lifecycle:
//! 1. Load config, open the store pool
//! 2. Build registries and shared state
//! 3. Start the HTTP server (health, WebSocket upgrade at `/ws`)
//! 4. Per connection: handshake → reader/writer/heartbeat tasks
//! 5. On shutdown: stop accepting, close clients, drain within grace
//!
//! Durable semantics (seq allocation, idempotency) live in `arc-store`;
//! credential verification lives in `arc-auth`. This crate wires them to
//! the wire protocol.

pub mod dispatch;
pub mod ingest;
pub mod registry;
pub mod server;
pub mod sessions;
pub mod state;
pub mod ws;

/// Fresh id for a server-originated envelope.
pub(crate) fn envelope_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
