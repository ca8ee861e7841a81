//! WebSocket push channel for display clients, plus `/health` and `/status`.
//!
//! Every socket registers with the `Dispatcher`, receives its welcome frame and
//! then whatever patches the poll loop broadcasts. Clients never send anything
//! meaningful; inbound frames are only read to notice a close.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use lib_common::ingestors::PollStatsSnapshot;

use crate::monitor_logic::config::Settings;
use crate::monitor_logic::state::AppState;

#[derive(Serialize)]
struct StatusBody {
    clients: usize,
    #[serde(flatten)]
    poller: PollStatsSnapshot,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run(
    settings: Settings,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some(tls) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(&tls.cert, &tls.key)
            .await
            .with_context(|| format!("failed to load TLS configuration from {}", tls.cert.display()))?;

        let handle = axum_server::Handle::new();
        let signal_handle = handle.clone();
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            let _ = shutdown.recv().await;
            tracing::info!("Downstream server shutting down.");
            dispatcher.close_all();
            signal_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });

        tracing::info!(%addr, "Downstream server listening (wss)");
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router(state).into_make_service_with_connect_info::<SocketAddr>())
            .await?;
        Ok(())
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        tracing::info!(%addr, "Downstream server listening (ws)");
        serve(listener, state, shutdown).await
    }
}

/// Serves plain WebSocket/HTTP on an already bound listener until `shutdown`.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let dispatcher = state.dispatcher.clone();
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
        tracing::info!("Downstream server shutting down.");
        dispatcher.close_all();
    })
    .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusBody> {
    Json(StatusBody {
        clients: state.dispatcher.client_count(),
        poller: state.stats.snapshot(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, addr: SocketAddr) {
    let (client_id, mut rx) = state.dispatcher.register(&addr.to_string());
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    // Dropped by the hub (too slow) or shutting down.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let send = sink.send(Message::Text(frame.payload.clone().into()));
                match tokio::time::timeout(state.send_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(client_id, error = %e, "socket write failed");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(client_id, peer = %addr, "socket write timed out, closing");
                        break;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Push-only channel.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.dispatcher.unregister(client_id);
}
