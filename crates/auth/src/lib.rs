//! Access verification for the realtime core.
//!
//! This crate provides:
//! - `AccessBinding`: the capability the gateway consumes at handshake and
//!   membership checks
//! - `SqliteAccessBinding`: sessions-table implementation with ULID session
//!   ids and an optional dev-mode anonymous path
//! - `RevocationBus`: broadcast of revoked user ids so the gateway can close
//!   live connections
//!
//! Token issuance and the identity surface live outside the core; only the
//! verification seam is here.

pub mod sqlite;

use {async_trait::async_trait, thiserror::Error, tokio::sync::broadcast};

pub use sqlite::SqliteAccessBinding;

/// The identity attached to a connection after a successful handshake.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub user_id: String,
    pub session_id: String,
    pub expires_at: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid, expired, or revoked credential")]
    Unauthorized,

    #[error("database error")]
    Db(#[from] sqlx::Error),
}

#[async_trait]
pub trait AccessBinding: Send + Sync {
    /// Verify a bearer credential. `token` is opaque to the gateway.
    async fn verify_access(
        &self,
        token: Option<&str>,
        now_ms: i64,
    ) -> Result<AccessGrant, AuthError>;

    /// Membership check for private conversations; public conversations
    /// bypass this.
    async fn is_member(&self, conversation_id: &str, user_id: &str) -> Result<bool, AuthError>;
}

// ── Revocation bus ───────────────────────────────────────────────────────────

/// Fan-out of revoked user ids. The gateway subscribes at boot and closes
/// every LiveClient belonging to a revoked user.
#[derive(Clone)]
pub struct RevocationBus {
    tx: broadcast::Sender<String>,
}

impl Default for RevocationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Notify subscribers. Lagging or absent receivers are fine; durable
    /// revocation already happened in the store.
    pub fn notify(&self, user_id: &str) {
        let _ = self.tx.send(user_id.to_string());
    }
}
