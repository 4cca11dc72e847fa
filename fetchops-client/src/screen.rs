use fetchops_core::RequestId;
use tracing::debug;

use crate::channel::OperationChannel;
use crate::controller::{
    CONTROLLER_KEY, ControllerError, OperationController, SessionStart, UiSink, on_session_start,
};
use crate::registry::RetainedStateRegistry;

/// Why a screen is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// The screen will be rebuilt (e.g. a rotation); retained state stays live.
    Rebuild,
    /// The user left the screen for good; the controller is unbound.
    Finish,
}

/// The logical lifetime spanning every rebuild of one screen.
#[derive(Debug, Default)]
pub struct Session {
    registry: RetainedStateRegistry,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &RetainedStateRegistry {
        &self.registry
    }

    /// Builds a screen on top of this session's registry.
    pub fn screen<F>(&mut self, ui: UiSink, make_channel: F) -> Screen<'_>
    where
        F: FnOnce() -> Box<dyn OperationChannel>,
    {
        Screen::create(&mut self.registry, ui, make_channel)
    }

    /// Ends the session, dropping everything it retained.
    pub fn end(self) {
        debug!(session_id = self.registry.session_id(), "session finished");
    }
}

/// A short-lived UI component. It never owns the controller; it looks it up in
/// the registry it was handed at construction.
#[derive(Debug)]
pub struct Screen<'s> {
    registry: &'s mut RetainedStateRegistry,
    start: SessionStart,
}

impl<'s> Screen<'s> {
    fn create<F>(registry: &'s mut RetainedStateRegistry, ui: UiSink, make_channel: F) -> Self
    where
        F: FnOnce() -> Box<dyn OperationChannel>,
    {
        debug!(session_id = registry.session_id(), "on_create");
        let start = on_session_start(registry, ui, make_channel);
        debug!(?start, "controller ready");
        Self { registry, start }
    }

    pub fn start(&self) -> SessionStart {
        self.start
    }

    pub fn controller(&mut self) -> Option<&mut OperationController> {
        self.registry.get_mut::<OperationController>(CONTROLLER_KEY)
    }

    pub fn submit(&mut self, locator: &str) -> Result<RequestId, ControllerError> {
        self.controller()
            .ok_or(ControllerError::NotBound)?
            .submit_request(locator)
    }

    pub fn on_destroy(mut self, teardown: Teardown) {
        debug!(?teardown, "on_destroy");
        let Some(controller) = self.controller() else {
            return;
        };
        match teardown {
            Teardown::Rebuild => controller.detach_ui(),
            Teardown::Finish => controller.unbind_service(),
        }
    }
}
