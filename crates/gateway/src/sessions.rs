//! Live session registry: one [`LiveClient`] per authenticated connection.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use {
    tokio::sync::{Mutex, RwLock, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use arc_protocol::{Envelope, error_codes};

use crate::envelope_id;

// ── Outbound queue items ─────────────────────────────────────────────────────

/// What the per-connection writer task drains.
#[derive(Debug)]
pub enum Outbound {
    /// A serialized envelope, sent as a text frame.
    Frame(String),
    /// Heartbeat ping, sent as a control frame.
    Ping,
}

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deliver {
    Ok,
    /// Queue full; the backpressure policy closes this client.
    Dropped,
    /// Connection already torn down.
    Closed,
}

// ── Live client ──────────────────────────────────────────────────────────────

/// An authenticated connection. Owned by the session registry; the gateway
/// holds it only for the duration of the connection tasks.
pub struct LiveClient {
    pub session_id: String,
    pub user_id: String,
    sender: mpsc::Sender<Outbound>,
    /// Cancelling this ends the connection's reader/writer/heartbeat.
    pub cancel: CancellationToken,
    /// Conversations this client has successfully joined.
    pub joined: Mutex<HashSet<String>>,
    pub connected_at: Instant,
}

impl LiveClient {
    pub fn new(
        session_id: String,
        user_id: String,
        sender: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            user_id,
            sender,
            cancel,
            joined: Mutex::new(HashSet::new()),
            connected_at: Instant::now(),
        }
    }

    /// Enqueue a serialized envelope without blocking.
    pub fn deliver(&self, frame: String) -> Deliver {
        match self.sender.try_send(Outbound::Frame(frame)) {
            Ok(()) => Deliver::Ok,
            Err(mpsc::error::TrySendError::Full(_)) => Deliver::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Deliver::Closed,
        }
    }

    /// Enqueue a heartbeat ping.
    pub fn ping(&self) -> Deliver {
        match self.sender.try_send(Outbound::Ping) {
            Ok(()) => Deliver::Ok,
            Err(mpsc::error::TrySendError::Full(_)) => Deliver::Dropped,
            Err(mpsc::error::TrySendError::Closed(_)) => Deliver::Closed,
        }
    }

    /// Close the connection: queue a final `error` envelope best-effort,
    /// then cancel the connection tasks.
    pub fn close(&self, code: &str, message: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let env = Envelope::error(envelope_id(), code, message);
        let _ = self.sender.try_send(Outbound::Frame(env.to_json()));
        debug!(session_id = %self.session_id, code, "closing client");
        self.cancel.cancel();
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SessionRegistry {
    clients: RwLock<HashMap<String, Arc<LiveClient>>>,
}

impl SessionRegistry {
    pub async fn register(&self, client: Arc<LiveClient>) {
        let session_id = client.session_id.clone();
        let displaced = self
            .clients
            .write()
            .await
            .insert(session_id.clone(), client);
        if let Some(prev) = displaced {
            warn!(session_id = %session_id, "session superseded by a new connection");
            prev.close(
                error_codes::UNAUTHORIZED,
                "session superseded by a new connection",
            );
        }
    }

    pub async fn unregister(&self, session_id: &str) -> Option<Arc<LiveClient>> {
        self.clients.write().await.remove(session_id)
    }

    /// Remove `client` only if it is still the registered entry for its
    /// session. A superseded connection must not tear down its successor.
    pub async fn unregister_client(&self, client: &Arc<LiveClient>) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(&client.session_id) {
            Some(current) if Arc::ptr_eq(current, client) => {
                clients.remove(&client.session_id);
                true
            },
            _ => false,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<LiveClient>> {
        self.clients.read().await.get(session_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Close every LiveClient belonging to `user_id` (logout-all, token
    /// revocation).
    pub async fn revoke_user(&self, user_id: &str) -> usize {
        let targets: Vec<_> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|c| c.user_id == user_id)
                .cloned()
                .collect()
        };
        for client in &targets {
            client.close(error_codes::UNAUTHORIZED, "session revoked");
        }
        if !targets.is_empty() {
            info!(user_id, sessions = targets.len(), "revoked live sessions");
        }
        targets.len()
    }

    /// Close every client with the given reason (shutdown coordinator).
    pub async fn close_all(&self, code: &str, message: &str) {
        let targets: Vec<_> = self.clients.read().await.values().cloned().collect();
        for client in targets {
            client.close(code, message);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn client(session_id: &str, user_id: &str, capacity: usize) -> (Arc<LiveClient>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let c = Arc::new(LiveClient::new(
            session_id.into(),
            user_id.into(),
            tx,
            CancellationToken::new(),
        ));
        (c, rx)
    }

    #[tokio::test]
    async fn deliver_reports_queue_state() {
        let (c, mut rx) = client("s1", "alice", 1);
        assert_eq!(c.deliver("a".into()), Deliver::Ok);
        assert_eq!(c.deliver("b".into()), Deliver::Dropped);

        rx.recv().await.unwrap();
        assert_eq!(c.deliver("c".into()), Deliver::Ok);

        drop(rx);
        assert_eq!(c.deliver("d".into()), Deliver::Closed);
    }

    #[tokio::test]
    async fn close_queues_error_then_cancels() {
        let (c, mut rx) = client("s1", "alice", 4);
        c.close(error_codes::SERVER_SHUTDOWN, "bye");
        assert!(c.cancel.is_cancelled());
        let Some(Outbound::Frame(frame)) = rx.recv().await else {
            panic!("expected a frame");
        };
        let env: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(env["type"], "error");
        assert_eq!(env["payload"]["code"], "server_shutdown");
    }

    #[tokio::test]
    async fn revoke_user_closes_only_matching_clients() {
        let registry = SessionRegistry::default();
        let (a, _rx_a) = client("s1", "alice", 4);
        let (b, _rx_b) = client("s2", "alice", 4);
        let (m, _rx_m) = client("s3", "mallory", 4);
        registry.register(Arc::clone(&a)).await;
        registry.register(Arc::clone(&b)).await;
        registry.register(Arc::clone(&m)).await;

        assert_eq!(registry.revoke_user("alice").await, 2);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert!(!m.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn register_supersedes_existing_session() {
        let registry = SessionRegistry::default();
        let (old, _rx_old) = client("s1", "alice", 4);
        let (new, _rx_new) = client("s1", "alice", 4);
        registry.register(Arc::clone(&old)).await;
        registry.register(Arc::clone(&new)).await;

        assert!(old.cancel.is_cancelled());
        assert!(!new.cancel.is_cancelled());
        assert_eq!(registry.count().await, 1);
    }
}
