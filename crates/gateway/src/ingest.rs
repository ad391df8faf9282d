//! Ingest pipeline: validated send intent → durable append → ack → fan-out.
//!
//! Nothing is observable before the store transaction commits. A committed
//! message whose broadcast is cut short stays durable and reaches clients
//! through history fetches.

use std::{sync::Arc, time::Duration};

use tracing::debug;

use {
    arc_protocol::{
        Envelope, MessageAckPayload, MessageNewPayload, MessageSendPayload, error_codes, now_ms,
        types,
    },
    arc_store::{AppendOutcome, AppendRequest, StoreError},
};

use crate::{
    dispatch::WireError,
    envelope_id,
    sessions::{Deliver, LiveClient},
    state::GatewayState,
};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

pub async fn ingest_send(
    state: &Arc<GatewayState>,
    client: &Arc<LiveClient>,
    p: MessageSendPayload,
) -> Result<(), WireError> {
    let req = AppendRequest {
        conversation_id: p.conversation_id.clone(),
        client_msg_id: p.client_msg_id.clone(),
        sender_session_id: client.session_id.clone(),
        sender_user_id: client.user_id.clone(),
        text: p.text.clone(),
        server_ts: now_ms(),
    };

    // Serialize allocate+publish per conversation: without this, a sender
    // that commits seq N+1 could fan out before the sender that committed
    // seq N, and subscribers would observe out-of-order seqs.
    let _ordering = state.conversations.ingest_lock(&p.conversation_id).await;

    let outcome = append_with_retry(state, req).await?;

    let ack = MessageAckPayload {
        conversation_id: p.conversation_id.clone(),
        client_msg_id: p.client_msg_id.clone(),
        server_msg_id: outcome.server_msg_id.clone(),
        seq: outcome.seq,
    };
    let env = Envelope::new(
        types::MESSAGE_ACK,
        envelope_id(),
        serde_json::to_value(ack).unwrap_or_default(),
    );
    if client.deliver(env.to_json()) == Deliver::Dropped {
        client.close(error_codes::SLOW_CONSUMER, "outbound queue full");
    }

    // Duplicate submits are acked with the original ids but never
    // re-broadcast.
    if outcome.already_existed {
        debug!(
            conversation_id = %p.conversation_id,
            client_msg_id = %p.client_msg_id,
            seq = outcome.seq,
            "duplicate send suppressed"
        );
        return Ok(());
    }

    let new = MessageNewPayload {
        conversation_id: p.conversation_id.clone(),
        client_msg_id: p.client_msg_id,
        server_msg_id: outcome.server_msg_id,
        seq: outcome.seq,
        sender_session_id: client.session_id.clone(),
        text: p.text,
        server_ts: outcome.server_ts,
    };
    let env = Envelope::new(
        types::MESSAGE_NEW,
        envelope_id(),
        serde_json::to_value(new).unwrap_or_default(),
    );
    state
        .conversations
        .publish(&state.sessions, &p.conversation_id, &env)
        .await;
    Ok(())
}

/// One initial attempt plus up to `MAX_RETRIES` retries on transient
/// failures.
async fn append_with_retry(
    state: &Arc<GatewayState>,
    req: AppendRequest,
) -> Result<AppendOutcome, WireError> {
    let mut backoff = INITIAL_BACKOFF;
    let mut retries = 0;
    loop {
        match state.store.append_message(req.clone()).await {
            Ok(outcome) => return Ok(outcome),
            Err(StoreError::Transient(reason)) if retries < MAX_RETRIES => {
                retries += 1;
                debug!(retry = retries, reason = %reason, "transient append failure, backing off");
                tokio::time::sleep(jitter(backoff)).await;
                backoff *= 2;
            },
            Err(err) => return Err(WireError::from(err)),
        }
    }
}

/// ±25% around the nominal backoff.
fn jitter(d: Duration) -> Duration {
    let factor = 0.75 + rand::random::<f64>() * 0.5;
    Duration::from_millis((d.as_millis() as f64 * factor) as u64)
}
