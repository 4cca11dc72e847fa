#![allow(dead_code)]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use fetchops_client::{ChannelError, ChannelState, OperationChannel, ReplyHandler};
use fetchops_core::{Envelope, Request, decode_request};
use tokio::sync::watch;

/// Test-side view of a [`ScriptedChannel`] after it has been boxed away.
#[derive(Clone)]
pub struct Probe {
    sent: Arc<Mutex<Vec<Envelope>>>,
    handler: Arc<Mutex<Option<ReplyHandler>>>,
    state: Arc<watch::Sender<ChannelState>>,
    binds: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
}

impl Probe {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ChannelState::Unbound);
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            handler: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
            binds: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A fresh channel sharing this probe.
    pub fn channel(&self, auto_bind: bool) -> Box<dyn OperationChannel> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedChannel {
            probe: self.clone(),
            auto_bind,
        })
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().expect("sent lock").clone()
    }

    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent()
            .iter()
            .map(|envelope| decode_request(envelope).expect("sent envelope is a request"))
            .collect()
    }

    /// Plays the worker: pushes `envelope` through the registered reply handler.
    pub fn reply(&self, envelope: Envelope) {
        let handler = self.handler.lock().expect("handler lock").clone();
        handler
            .expect("controller registered a reply handler")
            .send(envelope)
            .expect("controller is listening");
    }

    pub fn complete_bind(&self) {
        self.state.send_replace(ChannelState::Bound);
    }

    pub fn fail_bind(&self) {
        self.state.send_replace(ChannelState::Unbound);
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn bind_calls(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn channels_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

struct ScriptedChannel {
    probe: Probe,
    auto_bind: bool,
}

impl OperationChannel for ScriptedChannel {
    fn bind(&mut self) {
        self.probe.binds.fetch_add(1, Ordering::SeqCst);
        if self.state() != ChannelState::Unbound {
            return;
        }
        let next = if self.auto_bind {
            ChannelState::Bound
        } else {
            ChannelState::Binding
        };
        self.probe.state.send_replace(next);
    }

    fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Bound {
            return Err(ChannelError::NotBound);
        }
        self.probe.sent.lock().expect("sent lock").push(envelope);
        Ok(())
    }

    fn on_reply(&mut self, handler: ReplyHandler) {
        *self.probe.handler.lock().expect("handler lock") = Some(handler);
    }

    fn unbind(&mut self) {
        self.probe.state.send_replace(ChannelState::Unbound);
    }

    fn state(&self) -> ChannelState {
        self.probe.state()
    }

    fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.probe.state.subscribe()
    }
}
