//! Conversation registry: per-conversation subscriber sets and fan-out.
//!
//! Subscriber sets hold session ids, not client handles; clients are
//! resolved through the session registry at publish time. The slot lock is
//! released before any delivery, so a slow subscriber cannot stall
//! siblings.

use std::{collections::HashSet, sync::Arc};

use {
    dashmap::DashMap,
    tokio::sync::{Mutex, OwnedMutexGuard},
    tracing::warn,
};

use {
    arc_protocol::{Envelope, error_codes},
    arc_store::ConversationMeta,
};

use crate::sessions::{Deliver, SessionRegistry};

#[derive(Default)]
pub struct ConversationSlot {
    subscribers: Mutex<HashSet<String>>,
    meta: Mutex<Option<ConversationMeta>>,
    /// Serializes the allocate-then-publish section of the ingest pipeline,
    /// so fan-out order matches seq order. Never nested inside the
    /// subscriber lock.
    ingest: Arc<Mutex<()>>,
}

#[derive(Default)]
pub struct ConversationRegistry {
    slots: DashMap<String, Arc<ConversationSlot>>,
}

impl ConversationRegistry {
    fn slot(&self, conversation_id: &str) -> Arc<ConversationSlot> {
        self.slots
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Add a subscriber and cache the conversation metadata. Idempotent.
    pub async fn join(&self, conversation_id: &str, session_id: &str, meta: ConversationMeta) {
        let slot = self.slot(conversation_id);
        *slot.meta.lock().await = Some(meta);
        slot.subscribers
            .lock()
            .await
            .insert(session_id.to_string());
    }

    /// Remove a subscriber. Empty slots are retained; they are cheap.
    pub async fn leave(&self, conversation_id: &str, session_id: &str) {
        let slot = self
            .slots
            .get(conversation_id)
            .map(|s| Arc::clone(s.value()));
        if let Some(slot) = slot {
            slot.subscribers.lock().await.remove(session_id);
        }
    }

    /// Take the conversation's ingest lock. Held by the sender across the
    /// durable append and the fan-out, which keeps publish order equal to
    /// seq order under concurrent senders.
    pub async fn ingest_lock(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let ingest = Arc::clone(&self.slot(conversation_id).ingest);
        ingest.lock_owned().await
    }

    /// Metadata cached at join time, if any subscriber has joined.
    pub async fn cached_meta(&self, conversation_id: &str) -> Option<ConversationMeta> {
        let slot = self
            .slots
            .get(conversation_id)
            .map(|s| Arc::clone(s.value()))?;
        let meta = slot.meta.lock().await;
        meta.clone()
    }

    pub async fn is_subscriber(&self, conversation_id: &str, session_id: &str) -> bool {
        let slot = self
            .slots
            .get(conversation_id)
            .map(|s| Arc::clone(s.value()));
        match slot {
            Some(slot) => slot.subscribers.lock().await.contains(session_id),
            None => false,
        }
    }

    /// Fan one envelope out to every current subscriber.
    ///
    /// The subscriber set is snapshotted under the slot lock and the lock
    /// released before delivery. Delivery is non-blocking; a full queue
    /// closes that subscriber (`slow_consumer`) and the publisher moves on.
    pub async fn publish(
        &self,
        sessions: &SessionRegistry,
        conversation_id: &str,
        env: &Envelope,
    ) {
        let slot = self
            .slots
            .get(conversation_id)
            .map(|s| Arc::clone(s.value()));
        let Some(slot) = slot else {
            return;
        };
        let snapshot: Vec<String> = slot.subscribers.lock().await.iter().cloned().collect();
        let json = env.to_json();

        for session_id in snapshot {
            let Some(client) = sessions.get(&session_id).await else {
                continue;
            };
            match client.deliver(json.clone()) {
                Deliver::Ok | Deliver::Closed => {},
                Deliver::Dropped => {
                    warn!(
                        session_id = %session_id,
                        conversation_id,
                        "subscriber queue full, closing slow consumer"
                    );
                    client.close(error_codes::SLOW_CONSUMER, "outbound queue full");
                },
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        tokio::sync::mpsc,
        tokio_util::sync::CancellationToken,
    };

    use {
        arc_protocol::types,
        arc_store::{ConversationKind, Visibility},
    };

    use super::*;
    use crate::sessions::{LiveClient, Outbound};

    fn meta(id: &str) -> ConversationMeta {
        ConversationMeta {
            id: id.into(),
            kind: ConversationKind::Room,
            visibility: Visibility::Public,
        }
    }

    fn client(session_id: &str, capacity: usize) -> (Arc<LiveClient>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let c = Arc::new(LiveClient::new(
            session_id.into(),
            "alice".into(),
            tx,
            CancellationToken::new(),
        ));
        (c, rx)
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<Outbound>) -> serde_json::Value {
        match rx.recv().await.unwrap() {
            Outbound::Frame(f) => serde_json::from_str(&f).unwrap(),
            Outbound::Ping => panic!("unexpected ping"),
        }
    }

    #[tokio::test]
    async fn join_leave_subscriber_tracking() {
        let registry = ConversationRegistry::default();
        registry.join("room-1", "s1", meta("room-1")).await;
        assert!(registry.is_subscriber("room-1", "s1").await);
        assert!(!registry.is_subscriber("room-1", "s2").await);
        assert!(!registry.is_subscriber("room-2", "s1").await);

        registry.leave("room-1", "s1").await;
        assert!(!registry.is_subscriber("room-1", "s1").await);
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let sessions = SessionRegistry::default();
        let registry = ConversationRegistry::default();
        let (a, mut rx_a) = client("s1", 4);
        let (b, mut rx_b) = client("s2", 4);
        sessions.register(a).await;
        sessions.register(b).await;
        registry.join("room-1", "s1", meta("room-1")).await;
        registry.join("room-1", "s2", meta("room-1")).await;

        let env = Envelope::new(types::MESSAGE_NEW, "m1", serde_json::json!({"seq": 1}));
        registry.publish(&sessions, "room-1", &env).await;

        assert_eq!(recv_frame(&mut rx_a).await["payload"]["seq"], 1);
        assert_eq!(recv_frame(&mut rx_b).await["payload"]["seq"], 1);
    }

    #[tokio::test]
    async fn slow_subscriber_is_closed_without_stalling_siblings() {
        let sessions = SessionRegistry::default();
        let registry = ConversationRegistry::default();
        let (slow, _rx_slow) = client("s1", 1);
        let (fast, mut rx_fast) = client("s2", 4);
        sessions.register(Arc::clone(&slow)).await;
        sessions.register(fast).await;
        registry.join("room-1", "s1", meta("room-1")).await;
        registry.join("room-1", "s2", meta("room-1")).await;

        // Fill the slow client's queue, then publish.
        assert_eq!(slow.deliver("filler".into()), Deliver::Ok);
        let env = Envelope::new(types::MESSAGE_NEW, "m1", serde_json::json!({"seq": 1}));
        registry.publish(&sessions, "room-1", &env).await;

        assert!(slow.cancel.is_cancelled());
        assert_eq!(recv_frame(&mut rx_fast).await["payload"]["seq"], 1);
    }
}
