//! Shared gateway runtime state.

use std::sync::Arc;

use {tokio_util::sync::CancellationToken, tokio_util::task::TaskTracker};

use {
    arc_auth::AccessBinding,
    arc_config::GatewayConfig,
    arc_store::MessageStore,
};

use crate::{registry::ConversationRegistry, sessions::SessionRegistry};

/// Everything the connection tasks and dispatcher share. Constructed once at
/// boot, torn down by the shutdown coordinator.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub store: Arc<dyn MessageStore>,
    pub auth: Arc<dyn AccessBinding>,
    pub sessions: SessionRegistry,
    pub conversations: ConversationRegistry,
    /// Global shutdown signal; each connection derives a child token.
    pub shutdown: CancellationToken,
    /// Tracks per-connection tasks so shutdown can wait for the drain.
    pub connections: TaskTracker,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn MessageStore>,
        auth: Arc<dyn AccessBinding>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            auth,
            sessions: SessionRegistry::default(),
            conversations: ConversationRegistry::default(),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        })
    }
}
