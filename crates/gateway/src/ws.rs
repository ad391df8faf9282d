//! Per-connection lifecycle: handshake (with auth) → reader, writer, and
//! heartbeat tasks → cleanup.
//!
//! The three tasks share one child cancel token; all of them terminate
//! before the LiveClient is unregistered and removed from subscriber sets.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use {
    axum::extract::ws::{Message, WebSocket},
    bytes::Bytes,
    futures::{
        SinkExt,
        stream::{SplitSink, SplitStream, StreamExt},
    },
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {
    arc_auth::AuthError,
    arc_protocol::{self as protocol, Envelope, HelloAckPayload, HelloPayload, error_codes, now_ms, types},
};

use crate::{
    dispatch::{self, Flow},
    envelope_id,
    sessions::{Deliver, LiveClient, Outbound},
    state::GatewayState,
};

/// Drive one WebSocket connection from upgrade to close.
pub async fn handle_connection(
    socket: WebSocket,
    state: Arc<GatewayState>,
    remote_addr: SocketAddr,
) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, remote = %remote_addr, "ws: new connection");

    let cancel = state.shutdown.child_token();
    let (ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(state.config.outbound_queue);

    let writer = spawn_writer(
        ws_tx,
        out_rx,
        cancel.clone(),
        state.config.write_timeout,
        conn_id.clone(),
    );

    // ── Handshake ────────────────────────────────────────────────────────

    let hello = tokio::time::timeout(
        state.config.hello_timeout,
        wait_for_hello(&mut ws_rx, state.config.read_limit_bytes),
    )
    .await;

    let grant = match hello {
        Ok(Ok(p)) => match state.auth.verify_access(p.token.as_deref(), now_ms()).await {
            Ok(grant) => Some(grant),
            Err(AuthError::Unauthorized) => {
                warn!(conn_id = %conn_id, "ws: credential rejected");
                queue_error(&out_tx, error_codes::UNAUTHORIZED, "credential rejected");
                None
            },
            Err(e) => {
                warn!(conn_id = %conn_id, error = %e, "ws: auth failure");
                queue_error(&out_tx, error_codes::INTERNAL, "internal error");
                None
            },
        },
        Ok(Err(e)) => {
            warn!(conn_id = %conn_id, error = %e, "ws: handshake failed");
            queue_error(&out_tx, error_codes::UNAUTHORIZED, "handshake failed");
            None
        },
        Err(_) => {
            warn!(conn_id = %conn_id, "ws: handshake timeout");
            queue_error(&out_tx, error_codes::UNAUTHORIZED, "handshake timeout");
            None
        },
    };

    let Some(grant) = grant else {
        // The writer flushes the queued error envelope before closing.
        cancel.cancel();
        let _ = writer.await;
        return;
    };

    let client = Arc::new(LiveClient::new(
        grant.session_id.clone(),
        grant.user_id.clone(),
        out_tx.clone(),
        cancel.clone(),
    ));
    state.sessions.register(Arc::clone(&client)).await;

    let ack = HelloAckPayload {
        session_id: grant.session_id.clone(),
    };
    let env = Envelope::new(
        types::HELLO_ACK,
        envelope_id(),
        serde_json::to_value(ack).unwrap_or_default(),
    );
    let _ = out_tx.try_send(Outbound::Frame(env.to_json()));

    info!(
        conn_id = %conn_id,
        session_id = %client.session_id,
        user_id = %client.user_id,
        "ws: handshake complete"
    );

    // ── Heartbeat ────────────────────────────────────────────────────────

    let last_pong = Arc::new(AtomicI64::new(now_ms()));
    let heartbeat = spawn_heartbeat(
        Arc::clone(&client),
        cancel.clone(),
        state.config.ping_interval,
        state.config.pong_timeout,
        Arc::clone(&last_pong),
        conn_id.clone(),
    );

    // ── Reader loop ──────────────────────────────────────────────────────

    let mut strikes = 0u32;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => match msg {
                Some(m) => m,
                None => break,
            },
        };
        match msg {
            Ok(Message::Text(t)) => {
                let text = t.to_string();
                match dispatch::dispatch_frame(&state, &client, &text, &mut strikes).await {
                    Flow::Continue => {},
                    Flow::Close => break,
                }
            },
            Ok(Message::Pong(_)) => {
                last_pong.store(now_ms(), Ordering::Relaxed);
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {},
            Err(e) => {
                debug!(conn_id = %conn_id, error = %e, "ws: read error");
                break;
            },
        }
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    cancel.cancel();
    let _ = heartbeat.await;
    let _ = writer.await;

    let joined: Vec<String> = client.joined.lock().await.drain().collect();
    for conversation_id in &joined {
        state
            .conversations
            .leave(conversation_id, &client.session_id)
            .await;
    }
    state.sessions.unregister_client(&client).await;

    info!(
        conn_id = %conn_id,
        session_id = %client.session_id,
        duration_secs = client.connected_at.elapsed().as_secs(),
        "ws: connection closed"
    );
}

/// Wait for the first `hello` envelope.
async fn wait_for_hello(
    rx: &mut SplitStream<WebSocket>,
    read_limit: usize,
) -> anyhow::Result<HelloPayload> {
    while let Some(msg) = rx.next().await {
        let text = match msg? {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => anyhow::bail!("connection closed before hello"),
            _ => continue,
        };
        let env = protocol::decode(&text, read_limit).map_err(|e| anyhow::anyhow!("{e}"))?;
        if env.r#type != types::HELLO {
            anyhow::bail!("first envelope must be 'hello', got '{}'", env.r#type);
        }
        let p: HelloPayload = serde_json::from_value(env.payload)
            .map_err(|e| anyhow::anyhow!("invalid hello payload: {e}"))?;
        return Ok(p);
    }
    anyhow::bail!("connection closed before hello")
}

fn queue_error(out_tx: &mpsc::Sender<Outbound>, code: &str, message: &str) {
    let env = Envelope::error(envelope_id(), code, message);
    let _ = out_tx.try_send(Outbound::Frame(env.to_json()));
}

/// Writer task: drains the outbound queue onto the socket, one deadline per
/// envelope. On cancel it flushes frames already queued (final error
/// envelopes) before closing the sink.
fn spawn_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    write_timeout: Duration,
    conn_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = out_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            if !write_item(&mut ws_tx, item, write_timeout, &conn_id, &cancel).await {
                return;
            }
        }
        while let Ok(item) = out_rx.try_recv() {
            if !write_item(&mut ws_tx, item, write_timeout, &conn_id, &cancel).await {
                return;
            }
        }
        let _ = ws_tx.close().await;
    })
}

async fn write_item(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    item: Outbound,
    write_timeout: Duration,
    conn_id: &str,
    cancel: &CancellationToken,
) -> bool {
    let msg = match item {
        Outbound::Frame(text) => Message::Text(text.into()),
        Outbound::Ping => Message::Ping(Bytes::new()),
    };
    match tokio::time::timeout(write_timeout, ws_tx.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(conn_id = %conn_id, error = %e, "ws: write failed");
            cancel.cancel();
            false
        },
        Err(_) => {
            warn!(conn_id = %conn_id, "ws: write timed out");
            cancel.cancel();
            false
        },
    }
}

/// Heartbeat task: pings at the configured cadence and closes the
/// connection once pongs stop arriving.
fn spawn_heartbeat(
    client: Arc<LiveClient>,
    cancel: CancellationToken,
    ping_interval: Duration,
    pong_timeout: Duration,
    last_pong: Arc<AtomicI64>,
    conn_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(ping_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {},
            }
            let stale_ms = now_ms() - last_pong.load(Ordering::Relaxed);
            if stale_ms > pong_timeout.as_millis() as i64 {
                warn!(conn_id = %conn_id, stale_ms, "ws: pong timeout, closing");
                cancel.cancel();
                break;
            }
            match client.ping() {
                Deliver::Ok => {},
                Deliver::Dropped => {
                    warn!(conn_id = %conn_id, "ws: outbound queue full at ping, closing");
                    client.close(error_codes::SLOW_CONSUMER, "outbound queue full");
                    break;
                },
                Deliver::Closed => break,
            }
        }
    })
}
