use std::{sync::Arc, time::Duration};

use fetchops_core::{Envelope, MessageType, decode_frame, encode_frame};
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::channel::{
    ChannelError, ChannelState, OperationChannel, ReplyHandler, ReplySlot, finish_binding,
};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const BACKOFF_BASE_MS: u64 = 200;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Channel to a `fetchops-worker` server over a websocket.
pub struct WsChannel {
    worker_url: String,
    state: Arc<watch::Sender<ChannelState>>,
    replies: ReplySlot,
    outbound: Option<mpsc::UnboundedSender<Envelope>>,
    connection: Option<JoinHandle<()>>,
}

impl WsChannel {
    pub fn new(worker_url: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ChannelState::Unbound);
        Self {
            worker_url: worker_url.into(),
            state: Arc::new(state),
            replies: ReplySlot::default(),
            outbound: None,
            connection: None,
        }
    }

    pub fn worker_url(&self) -> &str {
        &self.worker_url
    }
}

impl OperationChannel for WsChannel {
    fn bind(&mut self) {
        if self.state() != ChannelState::Unbound {
            return;
        }
        if let Some(stale) = self.connection.take() {
            stale.abort();
        }
        self.state.send_replace(ChannelState::Binding);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        self.outbound = Some(outbound_tx);
        self.connection = Some(tokio::spawn(run_connection(
            self.worker_url.clone(),
            Arc::clone(&self.state),
            self.replies.clone(),
            outbound_rx,
        )));
    }

    fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Bound {
            return Err(ChannelError::NotBound);
        }
        let outbound = self.outbound.as_ref().ok_or(ChannelError::NotBound)?;
        outbound.send(envelope).map_err(|_| ChannelError::NotBound)
    }

    fn on_reply(&mut self, handler: ReplyHandler) {
        self.replies.set(handler);
    }

    fn unbind(&mut self) {
        self.state.send_replace(ChannelState::Unbound);
        self.outbound = None;
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}

async fn run_connection(
    worker_url: String,
    state: Arc<watch::Sender<ChannelState>>,
    replies: ReplySlot,
    outbound_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    let Some(ws_stream) = connect_with_retry(&worker_url).await else {
        finish_binding(&state, ChannelState::Unbound);
        return;
    };

    if !finish_binding(&state, ChannelState::Bound) {
        return;
    }
    info!(worker_url = %worker_url, "bound to worker");

    let (write_half, read_half) = ws_stream.split();
    tokio::select! {
        _ = network_send_task(write_half, outbound_rx) => {}
        _ = network_receive_task(read_half, replies) => {}
    }

    state.send_replace(ChannelState::Unbound);
    warn!(worker_url = %worker_url, "worker connection closed");
}

async fn connect_with_retry(worker_url: &str) -> Option<WsStream> {
    let mut attempt: u32 = 1;
    loop {
        info!(
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            worker_url = %worker_url,
            "connecting"
        );

        match timeout(CONNECT_TIMEOUT, connect_async(worker_url)).await {
            Ok(Ok((stream, _))) => return Some(stream),
            Ok(Err(err)) => {
                error!(attempt, worker_url = %worker_url, "connect failed: {err}");
            }
            Err(_) => {
                error!(
                    attempt,
                    worker_url = %worker_url,
                    "connect timed out after {:?}",
                    CONNECT_TIMEOUT
                );
            }
        }

        if attempt >= MAX_CONNECT_ATTEMPTS {
            return None;
        }
        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

async fn network_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, Message>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = outgoing_rx.recv().await {
        match encode_frame(&envelope) {
            Ok(frame) => {
                if ws_write.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing frame: {}", err),
        }
    }
}

async fn network_receive_task(mut ws_read: futures::stream::SplitStream<WsStream>, replies: ReplySlot) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("read failed: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                let envelope = match decode_frame(&data) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!("decode frame failed: {}", err);
                        continue;
                    }
                };
                if envelope.what() != MessageType::Reply {
                    warn!("ignoring non-reply frame from worker");
                    continue;
                }
                replies.deliver(envelope);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}
