pub mod channel;
pub mod config;
pub mod controller;
pub mod logging;
pub mod registry;
pub mod screen;
pub mod ws_channel;

pub use channel::{ChannelError, ChannelState, LocalChannel, OperationChannel, ReplyHandler};
pub use controller::{
    CONTROLLER_KEY, ControllerError, ControllerState, OperationController, SessionStart, UiEvent,
    UiSink, on_session_start,
};
pub use registry::RetainedStateRegistry;
pub use screen::{Screen, Session, Teardown};
pub use ws_channel::WsChannel;
