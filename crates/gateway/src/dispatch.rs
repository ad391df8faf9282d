//! Protocol dispatcher: envelope decode, strike accounting, per-type
//! handlers, and the deterministic error-code mapping.

use std::sync::Arc;

use {serde::de::DeserializeOwned, tracing::{debug, error, warn}};

use {
    arc_auth::AuthError,
    arc_protocol::{
        self as protocol, ConversationHistoryChunkPayload, ConversationHistoryFetchPayload,
        ConversationJoinPayload, Envelope, HistoryMessage, MessageSendPayload, error_codes, types,
    },
    arc_store::{ConversationKind, MAX_TEXT_CHARS, StoreError, Visibility},
};

use crate::{
    envelope_id,
    ingest,
    sessions::{Deliver, LiveClient},
    state::GatewayState,
};

// ── Wire errors ──────────────────────────────────────────────────────────────

/// A failure already mapped to its wire code. Fatal errors close the
/// connection after the `error` envelope is sent.
#[derive(Debug)]
pub struct WireError {
    pub code: &'static str,
    pub message: String,
    pub fatal: bool,
}

impl WireError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: true,
        }
    }
}

impl From<StoreError> for WireError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TextEmpty => Self::new(error_codes::TEXT_EMPTY, "text must not be empty"),
            StoreError::TextTooLong => Self::new(
                error_codes::TEXT_TOO_LONG,
                format!("text exceeds {MAX_TEXT_CHARS} characters"),
            ),
            StoreError::Forbidden => Self::new(
                error_codes::FORBIDDEN,
                "not permitted in this conversation",
            ),
            StoreError::UnknownConversation => {
                Self::new(error_codes::FORBIDDEN, "unknown conversation")
            },
            StoreError::Transient(_) => {
                Self::new(error_codes::SERVER_BUSY, "storage busy, try again")
            },
            StoreError::Db(source) => {
                error!(error = %source, "store failure");
                Self::fatal(error_codes::INTERNAL, "internal error")
            },
        }
    }
}

impl From<AuthError> for WireError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => {
                Self::fatal(error_codes::UNAUTHORIZED, "credential rejected")
            },
            AuthError::Db(source) => {
                error!(error = %source, "auth failure");
                Self::fatal(error_codes::INTERNAL, "internal error")
            },
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

/// What the reader loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Handle one text frame from an `Active` connection.
pub async fn dispatch_frame(
    state: &Arc<GatewayState>,
    client: &Arc<LiveClient>,
    text: &str,
    strikes: &mut u32,
) -> Flow {
    let env = match protocol::decode(text, state.config.read_limit_bytes) {
        Ok(env) => env,
        Err(e) => {
            *strikes += 1;
            debug!(
                session_id = %client.session_id,
                strikes = *strikes,
                error = %e,
                "rejected frame"
            );
            send_error(client, e.wire_code(), &e.to_string());
            if *strikes >= state.config.strike_limit {
                warn!(session_id = %client.session_id, "strike limit reached, closing");
                return Flow::Close;
            }
            return Flow::Continue;
        },
    };

    let env_id = env.id.clone();
    let result = match env.r#type.as_str() {
        types::CONVERSATION_JOIN => on_join(state, client, env).await,
        types::MESSAGE_SEND => on_send(state, client, env).await,
        types::HISTORY_FETCH => on_history(state, client, env).await,
        other => Err(WireError::new(
            error_codes::UNSUPPORTED_TYPE,
            format!("unsupported type: {other}"),
        )),
    };

    match result {
        Ok(()) => Flow::Continue,
        Err(e) => {
            if e.code == error_codes::INTERNAL {
                error!(
                    session_id = %client.session_id,
                    envelope_id = %env_id,
                    code = e.code,
                    "request failed"
                );
            } else {
                debug!(
                    session_id = %client.session_id,
                    envelope_id = %env_id,
                    code = e.code,
                    "request rejected"
                );
            }
            send_error(client, e.code, &e.message);
            if e.fatal { Flow::Close } else { Flow::Continue }
        },
    }
}

/// Queue an `error` envelope; a full queue invokes the slow-consumer policy.
pub fn send_error(client: &LiveClient, code: &str, message: &str) {
    let env = Envelope::error(envelope_id(), code, message);
    if client.deliver(env.to_json()) == Deliver::Dropped {
        client.close(error_codes::SLOW_CONSUMER, "outbound queue full");
    }
}

fn payload<T: DeserializeOwned>(env: &Envelope) -> Result<T, WireError> {
    serde_json::from_value(env.payload.clone()).map_err(|e| {
        WireError::new(error_codes::INVALID_ENVELOPE, format!("invalid payload: {e}"))
    })
}

fn reply(client: &LiveClient, r#type: &str, payload: serde_json::Value) {
    let env = Envelope::new(r#type, envelope_id(), payload);
    if client.deliver(env.to_json()) == Deliver::Dropped {
        client.close(error_codes::SLOW_CONSUMER, "outbound queue full");
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn on_join(
    state: &Arc<GatewayState>,
    client: &Arc<LiveClient>,
    env: Envelope,
) -> Result<(), WireError> {
    let p: ConversationJoinPayload = payload(&env)?;
    if p.conversation_id.is_empty() {
        return Err(WireError::new(
            error_codes::INVALID_ENVELOPE,
            "empty conversation_id",
        ));
    }

    let meta = state.store.conversation_meta(&p.conversation_id).await?;
    let meta = match meta {
        Some(meta) => meta,
        None if state.config.dev_allow_anon => {
            // Dev mode: a join naming a kind creates the room, public.
            let kind = match p.kind.as_deref() {
                Some(raw) => ConversationKind::parse(raw).ok_or_else(|| {
                    WireError::new(
                        error_codes::INVALID_ENVELOPE,
                        format!("unknown conversation kind: {raw}"),
                    )
                })?,
                None => {
                    return Err(WireError::new(
                        error_codes::FORBIDDEN,
                        "unknown conversation",
                    ));
                },
            };
            state
                .store
                .ensure_conversation(&p.conversation_id, kind, Visibility::Public)
                .await?;
            state
                .store
                .conversation_meta(&p.conversation_id)
                .await?
                .ok_or_else(|| WireError::fatal(error_codes::INTERNAL, "internal error"))?
        },
        None => {
            return Err(WireError::new(
                error_codes::FORBIDDEN,
                "unknown conversation",
            ));
        },
    };

    if meta.visibility == Visibility::Private
        && !state
            .auth
            .is_member(&p.conversation_id, &client.user_id)
            .await?
    {
        return Err(WireError::new(
            error_codes::NOT_MEMBER,
            "not a member of this conversation",
        ));
    }

    state
        .conversations
        .join(&p.conversation_id, &client.session_id, meta.clone())
        .await;
    client
        .joined
        .lock()
        .await
        .insert(p.conversation_id.clone());

    // Echo with canonical metadata.
    let echo = ConversationJoinPayload {
        conversation_id: p.conversation_id,
        kind: Some(meta.kind.as_str().to_string()),
    };
    reply(
        client,
        types::CONVERSATION_JOIN,
        serde_json::to_value(echo).unwrap_or_default(),
    );
    Ok(())
}

async fn on_send(
    state: &Arc<GatewayState>,
    client: &Arc<LiveClient>,
    env: Envelope,
) -> Result<(), WireError> {
    let p: MessageSendPayload = payload(&env)?;
    if p.conversation_id.is_empty() || p.client_msg_id.is_empty() {
        return Err(WireError::new(
            error_codes::INVALID_ENVELOPE,
            "empty conversation_id or client_msg_id",
        ));
    }

    // Senders must be current subscribers.
    if !state
        .conversations
        .is_subscriber(&p.conversation_id, &client.session_id)
        .await
    {
        return Err(WireError::new(
            error_codes::NOT_MEMBER,
            "join the conversation before sending",
        ));
    }

    if p.text.is_empty() {
        return Err(WireError::new(
            error_codes::TEXT_EMPTY,
            "text must not be empty",
        ));
    }
    if p.text.chars().count() > MAX_TEXT_CHARS {
        return Err(WireError::new(
            error_codes::TEXT_TOO_LONG,
            format!("text exceeds {MAX_TEXT_CHARS} characters"),
        ));
    }

    match tokio::time::timeout(state.config.send_timeout, ingest::ingest_send(state, client, p))
        .await
    {
        Ok(result) => result,
        Err(_) => Err(WireError::new(error_codes::SERVER_BUSY, "send timed out")),
    }
}

async fn on_history(
    state: &Arc<GatewayState>,
    client: &Arc<LiveClient>,
    env: Envelope,
) -> Result<(), WireError> {
    let p: ConversationHistoryFetchPayload = payload(&env)?;
    if p.conversation_id.is_empty() {
        return Err(WireError::new(
            error_codes::INVALID_ENVELOPE,
            "empty conversation_id",
        ));
    }

    // Subscribers already proved membership at join; everyone else gets the
    // same checks a join would.
    if !state
        .conversations
        .is_subscriber(&p.conversation_id, &client.session_id)
        .await
    {
        let meta = match state.conversations.cached_meta(&p.conversation_id).await {
            Some(meta) => meta,
            None => state
                .store
                .conversation_meta(&p.conversation_id)
                .await?
                .ok_or_else(|| WireError::new(error_codes::FORBIDDEN, "unknown conversation"))?,
        };
        if meta.visibility == Visibility::Private
            && !state
                .auth
                .is_member(&p.conversation_id, &client.user_id)
                .await?
        {
            return Err(WireError::new(
                error_codes::NOT_MEMBER,
                "not a member of this conversation",
            ));
        }
    }

    let limit = p.limit.unwrap_or(protocol::DEFAULT_HISTORY_LIMIT);
    let page = match tokio::time::timeout(
        state.config.fetch_timeout,
        state.store.fetch_history(&p.conversation_id, p.after_seq, limit),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            return Err(WireError::new(
                error_codes::SERVER_BUSY,
                "history fetch timed out",
            ));
        },
    };

    let chunk = ConversationHistoryChunkPayload {
        conversation_id: p.conversation_id,
        messages: page
            .messages
            .into_iter()
            .map(|m| HistoryMessage {
                seq: m.seq,
                server_msg_id: m.server_msg_id,
                client_msg_id: m.client_msg_id,
                sender_session_id: m.sender_session_id,
                text: m.text,
                server_ts: m.server_ts,
            })
            .collect(),
        has_more: page.has_more,
    };
    reply(
        client,
        types::HISTORY_CHUNK,
        serde_json::to_value(chunk).unwrap_or_default(),
    );
    Ok(())
}
