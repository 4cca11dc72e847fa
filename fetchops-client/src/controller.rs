use fetchops_core::{CoreError, Envelope, OperationKind, RequestId, decode_reply, encode_request};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, ChannelState, OperationChannel};
use crate::registry::RetainedStateRegistry;

/// Registry key the controller is retained under.
pub const CONTROLLER_KEY: &str = "operation_controller";

/// Outcomes surfaced to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Succeeded {
        request_id: RequestId,
        result_locator: String,
        source_locator: Option<String>,
    },
    Failed {
        request_id: RequestId,
    },
}

pub type UiSink = mpsc::UnboundedSender<UiEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    AwaitingBind,
    Ready,
    RequestInFlight,
    Unbound,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerError {
    #[error("invalid request: {0}")]
    InvalidArgument(#[from] CoreError),
    #[error("operation channel is not bound")]
    NotBound,
    #[error("a request is already in flight")]
    Busy,
}

impl From<ChannelError> for ControllerError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotBound => ControllerError::NotBound,
        }
    }
}

/// Client side of the request/reply protocol.
///
/// At most one request is outstanding at a time. Replies are matched against it
/// by request id; anything else is a stale reply and is dropped without
/// reaching the UI. After [`unbind_service`](Self::unbind_service) the
/// controller can no longer send, but it keeps its last outcome so a rebuilt UI
/// can still show it.
pub struct OperationController {
    channel: Box<dyn OperationChannel>,
    replies: mpsc::UnboundedReceiver<Envelope>,
    ui: Option<UiSink>,
    in_flight: Option<RequestId>,
    next_request_id: RequestId,
    unbound: bool,
    last_event: Option<UiEvent>,
}

impl OperationController {
    pub fn new(mut channel: Box<dyn OperationChannel>, ui: UiSink) -> Self {
        let (reply_tx, replies) = mpsc::unbounded_channel();
        channel.on_reply(reply_tx);
        Self {
            channel,
            replies,
            ui: Some(ui),
            in_flight: None,
            next_request_id: 1,
            unbound: false,
            last_event: None,
        }
    }

    /// Sets the id the next request will carry.
    #[must_use]
    pub fn with_first_request_id(mut self, request_id: RequestId) -> Self {
        self.next_request_id = request_id;
        self
    }

    pub fn state(&self) -> ControllerState {
        if self.unbound {
            return ControllerState::Unbound;
        }
        if self.in_flight.is_some() {
            return ControllerState::RequestInFlight;
        }
        match self.channel.state() {
            ChannelState::Unbound => ControllerState::Idle,
            ChannelState::Binding => ControllerState::AwaitingBind,
            ChannelState::Bound => ControllerState::Ready,
        }
    }

    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight
    }

    pub fn last_outcome(&self) -> Option<&UiEvent> {
        self.last_event.as_ref()
    }

    pub fn bind_service(&mut self) {
        if self.unbound {
            warn!("bind requested on an unbound controller; ignoring");
            return;
        }
        self.channel.bind();
    }

    /// Resolves once binding settles: `Ok` when bound, `NotBound` when the bind
    /// failed or was never started.
    pub async fn wait_until_bound(&self) -> Result<(), ControllerError> {
        if self.unbound {
            return Err(ControllerError::NotBound);
        }
        let mut state = self.channel.watch_state();
        let settled = state
            .wait_for(|state| *state != ChannelState::Binding)
            .await
            .map(|state| *state)
            .map_err(|_| ControllerError::NotBound)?;
        match settled {
            ChannelState::Bound => Ok(()),
            _ => Err(ControllerError::NotBound),
        }
    }

    pub fn submit_request(&mut self, locator: &str) -> Result<RequestId, ControllerError> {
        if self.unbound {
            return Err(ControllerError::NotBound);
        }
        if let Some(outstanding) = self.in_flight {
            debug!(outstanding, "rejecting request while another is in flight");
            return Err(ControllerError::Busy);
        }

        let request_id = self.next_request_id;
        let envelope = encode_request(OperationKind::FetchResource, locator, request_id)?;
        self.channel.send(envelope)?;

        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.in_flight = Some(request_id);
        info!(request_id, locator, "request submitted");
        Ok(request_id)
    }

    /// Processes one reply envelope. Returns true when it completed the
    /// outstanding request and an outcome reached the UI.
    pub fn handle_reply(&mut self, envelope: &Envelope) -> bool {
        let reply = match decode_reply(envelope) {
            Ok(reply) => reply,
            Err(err) => {
                warn!("dropping malformed reply: {}", err);
                return false;
            }
        };

        if self.unbound {
            debug!(request_id = reply.request_id, "discarding reply after unbind");
            return false;
        }
        if self.in_flight != Some(reply.request_id) {
            debug!(
                request_id = reply.request_id,
                outstanding = ?self.in_flight,
                "discarding stale reply"
            );
            return false;
        }

        self.in_flight = None;
        let event = match reply.result_locator {
            Some(result_locator) => {
                info!(request_id = reply.request_id, result = %result_locator, "request succeeded");
                UiEvent::Succeeded {
                    request_id: reply.request_id,
                    result_locator,
                    source_locator: reply.source_locator,
                }
            }
            None => {
                info!(request_id = reply.request_id, "request failed");
                UiEvent::Failed {
                    request_id: reply.request_id,
                }
            }
        };
        self.publish(event);
        true
    }

    /// Waits for the next reply and handles it on the caller's task.
    ///
    /// Returns `None` if the reply source is gone. There is no timeout here; an
    /// unanswered request stays in flight until a reply or an unbind.
    pub async fn dispatch_next_reply(&mut self) -> Option<bool> {
        let envelope = self.replies.recv().await?;
        Some(self.handle_reply(&envelope))
    }

    /// Submits `locator` and waits on the caller's task for its own outcome.
    ///
    /// Stale replies that arrive first are discarded as usual. The outcome is
    /// also published to the UI sink. Like `dispatch_next_reply` this has no
    /// timeout; wrap it in one to bound the wait.
    pub async fn submit_and_wait(&mut self, locator: &str) -> Result<UiEvent, ControllerError> {
        let request_id = self.submit_request(locator)?;
        loop {
            let Some(completed) = self.dispatch_next_reply().await else {
                warn!(request_id, "reply source closed while waiting");
                return Err(ControllerError::NotBound);
            };
            if completed {
                break;
            }
        }
        self.last_event.clone().ok_or(ControllerError::NotBound)
    }

    /// Handles every reply already queued, without waiting.
    pub fn dispatch_pending_replies(&mut self) -> usize {
        let mut surfaced = 0;
        while let Ok(envelope) = self.replies.try_recv() {
            if self.handle_reply(&envelope) {
                surfaced += 1;
            }
        }
        surfaced
    }

    pub fn unbind_service(&mut self) {
        if self.unbound {
            return;
        }
        self.channel.unbind();
        self.unbound = true;
        if let Some(request_id) = self.in_flight.take() {
            info!(request_id, "unbound with a request in flight; its reply will be ignored");
        }
    }

    /// Points UI events at a rebuilt UI component and replays the last outcome.
    pub fn reattach(&mut self, ui: UiSink) {
        if let Some(event) = self.last_event.clone() {
            if ui.send(event).is_err() {
                debug!("reattached ui is already gone; replay skipped");
            }
        }
        self.ui = Some(ui);
    }

    pub fn detach_ui(&mut self) {
        self.ui = None;
    }

    fn publish(&mut self, event: UiEvent) {
        self.last_event = Some(event.clone());
        match &self.ui {
            Some(ui) => {
                if ui.send(event).is_err() {
                    debug!("ui is gone; outcome kept for the next attach");
                }
            }
            None => debug!("no ui attached; outcome kept for the next attach"),
        }
    }
}

/// How the controller was obtained when a UI component started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStart {
    /// First start of the session; a new controller was created and bound.
    Fresh,
    /// A rebuild; the retained controller was picked up again.
    Restored,
    /// A rebuild that found no retained controller; a new one was created.
    Rebuilt,
}

/// Creates or restores the session's controller in `registry`.
pub fn on_session_start<F>(
    registry: &mut RetainedStateRegistry,
    ui: UiSink,
    make_channel: F,
) -> SessionStart
where
    F: FnOnce() -> Box<dyn OperationChannel>,
{
    if registry.first_time_in() {
        debug!(session_id = registry.session_id(), "first start in session");
        install_controller(registry, ui, make_channel);
        return SessionStart::Fresh;
    }

    match registry.get_mut::<OperationController>(CONTROLLER_KEY) {
        Some(controller) => {
            debug!("restoring retained controller");
            controller.reattach(ui);
            SessionStart::Restored
        }
        None => {
            warn!(
                session_id = registry.session_id(),
                "retained controller missing; creating a new one"
            );
            install_controller(registry, ui, make_channel);
            SessionStart::Rebuilt
        }
    }
}

fn install_controller<F>(registry: &mut RetainedStateRegistry, ui: UiSink, make_channel: F)
where
    F: FnOnce() -> Box<dyn OperationChannel>,
{
    let mut controller = OperationController::new(make_channel(), ui);
    controller.bind_service();
    registry.put(CONTROLLER_KEY, controller);
}
