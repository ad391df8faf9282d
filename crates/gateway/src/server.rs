//! HTTP server: router, WebSocket upgrade, boot, and the shutdown
//! coordinator.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        http::StatusCode,
        response::IntoResponse,
        routing::get,
    },
    tokio::{net::TcpListener, sync::broadcast},
    tower_http::trace::TraceLayer,
    tracing::{info, warn},
};

use {
    arc_auth::{RevocationBus, SqliteAccessBinding},
    arc_config::GatewayConfig,
    arc_protocol::{PROTOCOL_VERSION, SUBPROTOCOL, error_codes},
    arc_store::SqliteMessageStore,
};

use crate::{state::GatewayState, ws};

/// Build the gateway router (shared between production startup and tests).
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "protocol": PROTOCOL_VERSION,
        "clients": state.sessions.count().await,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let read_limit = state.config.read_limit_bytes;
    ws.protocols([SUBPROTOCOL])
        .max_message_size(read_limit)
        .on_upgrade(move |socket| {
            let tracker = state.connections.clone();
            tracker.track_future(ws::handle_connection(socket, state, addr))
        })
        .into_response()
}

/// React to external revocations by closing live sessions of the user.
pub fn spawn_revocation_listener(state: &Arc<GatewayState>, revocations: &RevocationBus) {
    let state = Arc::clone(state);
    let mut rx = revocations.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(user_id) => {
                        state.sessions.revoke_user(&user_id).await;
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "revocation listener lagged");
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Boot the gateway and serve until shutdown.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let pool = SqliteMessageStore::connect(&config.db_url).await?;
    SqliteMessageStore::init(&pool).await?;
    SqliteAccessBinding::init(&pool).await?;

    let revocations = RevocationBus::new();
    let store = Arc::new(
        SqliteMessageStore::new(pool.clone()).with_max_history_limit(config.max_history_limit),
    );
    let auth = Arc::new(
        SqliteAccessBinding::new(pool.clone(), revocations.clone())
            .with_dev_allow_anon(config.dev_allow_anon),
    );
    let state = GatewayState::new(config.clone(), store, auth);

    spawn_revocation_listener(&state, &revocations);

    let listener = TcpListener::bind(&config.http_addr).await?;
    info!(addr = %listener.local_addr()?, dev = config.dev_allow_anon, "gateway listening");

    let router = build_router(Arc::clone(&state));
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
    .await?;

    // No new connections past this point; wait out the drain, then close
    // the store.
    state.connections.close();
    if tokio::time::timeout(state.config.shutdown_grace, state.connections.wait())
        .await
        .is_err()
    {
        warn!(
            grace_secs = state.config.shutdown_grace.as_secs(),
            "connection drain exceeded shutdown grace"
        );
    }
    pool.close().await;
    info!("gateway stopped");
    Ok(())
}

/// Resolves when shutdown is requested, after telling every client. The
/// cancel cascades into per-connection tokens, which lets the serve loop
/// finish its in-flight upgrades.
async fn shutdown_signal(state: Arc<GatewayState>) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        _ = state.shutdown.cancelled() => {},
    }
    info!("draining connections");
    state
        .sessions
        .close_all(error_codes::SERVER_SHUTDOWN, "server shutting down")
        .await;
    state.shutdown.cancel();
}
