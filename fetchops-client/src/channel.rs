use std::sync::{Arc, Mutex, PoisonError};

use fetchops_core::Envelope;
use fetchops_worker::{Fetcher, LocalWorker};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Connection state of an [`OperationChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unbound,
    Binding,
    Bound,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is not bound")]
    NotBound,
}

/// Receives every reply envelope the transport delivers.
pub type ReplyHandler = mpsc::UnboundedSender<Envelope>;

/// Asynchronous request transport between the client and a worker.
///
/// None of the methods block: `bind` finishes in the background, `send` only
/// queues, and replies arrive later through the handler given to `on_reply`.
/// Implementations that spawn tasks must be used inside a tokio runtime.
pub trait OperationChannel: Send {
    /// Starts binding. A no-op while already binding or bound.
    fn bind(&mut self);

    /// Queues `envelope` for the worker. Fails unless the channel is bound.
    fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError>;

    /// Registers the reply handler, replacing any earlier one.
    fn on_reply(&mut self, handler: ReplyHandler);

    /// Drops the connection. Replies still on their way may be lost.
    fn unbind(&mut self);

    fn state(&self) -> ChannelState;

    fn watch_state(&self) -> watch::Receiver<ChannelState>;
}

/// The single reply handler slot shared with a channel's background tasks.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReplySlot {
    handler: Arc<Mutex<Option<ReplyHandler>>>,
}

impl ReplySlot {
    pub(crate) fn set(&self, handler: ReplyHandler) {
        // The slot only ever holds a sender, so a poisoned lock is still usable.
        let mut slot = self.handler.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(handler);
    }

    /// Hands `envelope` to the registered handler. Returns false when it was dropped.
    pub(crate) fn deliver(&self, envelope: Envelope) -> bool {
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler.send(envelope).is_ok(),
            None => {
                warn!("reply arrived with no handler registered; dropping");
                false
            }
        }
    }
}

/// Moves `state` from `Binding` to `next`; any other current state is kept.
pub(crate) fn finish_binding(state: &watch::Sender<ChannelState>, next: ChannelState) -> bool {
    state.send_if_modified(|current| {
        if *current == ChannelState::Binding {
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Channel to a worker hosted on the client's own runtime.
pub struct LocalChannel {
    fetcher: Arc<dyn Fetcher>,
    state: Arc<watch::Sender<ChannelState>>,
    replies: ReplySlot,
    worker: Option<LocalWorker>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalChannel {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        let (state, _) = watch::channel(ChannelState::Unbound);
        Self {
            fetcher,
            state: Arc::new(state),
            replies: ReplySlot::default(),
            worker: None,
            tasks: Vec::new(),
        }
    }

    fn stop_worker(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
    }
}

impl OperationChannel for LocalChannel {
    fn bind(&mut self) {
        if self.state() != ChannelState::Unbound {
            debug!("local bind ignored; already {:?}", self.state());
            return;
        }
        self.stop_worker();
        self.state.send_replace(ChannelState::Binding);

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Envelope>();
        self.worker = Some(LocalWorker::spawn(Arc::clone(&self.fetcher), reply_tx));

        let replies = self.replies.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(envelope) = reply_rx.recv().await {
                replies.deliver(envelope);
            }
        }));

        let state = Arc::clone(&self.state);
        self.tasks.push(tokio::spawn(async move {
            if finish_binding(&state, ChannelState::Bound) {
                debug!("local worker bound");
            }
        }));
    }

    fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Bound {
            return Err(ChannelError::NotBound);
        }
        match &self.worker {
            Some(worker) if worker.submit(envelope) => Ok(()),
            _ => Err(ChannelError::NotBound),
        }
    }

    fn on_reply(&mut self, handler: ReplyHandler) {
        self.replies.set(handler);
    }

    fn unbind(&mut self) {
        self.state.send_replace(ChannelState::Unbound);
        self.stop_worker();
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
