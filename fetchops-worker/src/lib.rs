pub mod fetcher;
pub mod service;

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use fetchops_core::{MAX_FRAME_BYTES, MessageType, decode_frame, encode_frame};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{error, info, warn};

pub use fetcher::{CacheFetcher, FetchError, Fetcher};
pub use service::{LocalWorker, serve_request};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct WorkerStats {
    pub connections: u64,
    pub requests_served: u64,
    pub requests_dropped: u64,
}

#[derive(Clone)]
pub struct AppState {
    fetcher: Arc<dyn Fetcher>,
    stats: Arc<RwLock<WorkerStats>>,
}

impl AppState {
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
        }
    }

    pub async fn stats(&self) -> WorkerStats {
        *self.stats.read().await
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "worker listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.stats().await;
    Json(serde_json::json!({"ok": true, "stats": stats}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("client session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half only flush when the write half sends, so
    // an idle connection still needs periodic writes to stay alive.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    state.stats.write().await.connections += 1;
    info!("client bound");

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if data.len() > MAX_FRAME_BYTES {
                    warn!("dropping oversized frame ({} bytes)", data.len());
                    state.stats.write().await.requests_dropped += 1;
                    continue;
                }

                let envelope = match decode_frame(&data) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!("failed to decode frame: {}", err);
                        state.stats.write().await.requests_dropped += 1;
                        continue;
                    }
                };

                if envelope.what() != MessageType::Request {
                    warn!("ignoring non-request frame");
                    state.stats.write().await.requests_dropped += 1;
                    continue;
                }

                // Each request runs independently; replies go out in completion order.
                let state = state.clone();
                let outbound_tx = outbound_tx.clone();
                tokio::spawn(async move {
                    let Some(reply) = serve_request(Arc::clone(&state.fetcher), envelope).await
                    else {
                        state.stats.write().await.requests_dropped += 1;
                        return;
                    };

                    match encode_frame(&reply) {
                        Ok(frame) => {
                            state.stats.write().await.requests_served += 1;
                            let _ = outbound_tx.send(Message::Binary(frame.into()));
                        }
                        Err(err) => error!("failed to serialize reply: {}", err),
                    }
                });
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    send_task.abort();
    info!("client unbound");
    Ok(())
}
