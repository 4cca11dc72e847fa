use std::{sync::Arc, time::Duration};

use fetchops_client::{
    ChannelState, ControllerError, ControllerState, OperationChannel, OperationController,
    UiEvent, WsChannel,
};
use fetchops_worker::{AppState, FetchError, Fetcher, build_router};
use tokio::{net::TcpListener, sync::{mpsc, oneshot}, time::timeout};

#[tokio::test]
async fn fetch_round_trips_through_a_worker_server() {
    let (worker_url, shutdown_tx) = start_worker().await;
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    let mut controller = OperationController::new(Box::new(WsChannel::new(worker_url)), ui_tx);

    controller.bind_service();
    timeout(Duration::from_secs(5), controller.wait_until_bound())
        .await
        .expect("bind in time")
        .expect("bound to worker");
    assert_eq!(controller.state(), ControllerState::Ready);

    let request_id = controller
        .submit_request("http://example.test/img.png")
        .expect("submit");
    let completed = timeout(Duration::from_secs(2), controller.dispatch_next_reply())
        .await
        .expect("reply in time");
    assert_eq!(completed, Some(true));
    assert_eq!(controller.state(), ControllerState::Ready);

    assert_eq!(
        ui_rx.try_recv().expect("outcome"),
        UiEvent::Succeeded {
            request_id,
            result_locator: "file:///cache/img.png".to_owned(),
            source_locator: Some("http://example.test/img.png".to_owned()),
        }
    );

    let failed_id = controller
        .submit_request("http://example.test/missing")
        .expect("submit after completion");
    let completed = timeout(Duration::from_secs(2), controller.dispatch_next_reply())
        .await
        .expect("reply in time");
    assert_eq!(completed, Some(true));
    assert_eq!(
        ui_rx.try_recv().expect("outcome"),
        UiEvent::Failed {
            request_id: failed_id
        }
    );

    let outcome = timeout(
        Duration::from_secs(2),
        controller.submit_and_wait("http://example.test/next.png"),
    )
    .await
    .expect("reply in time")
    .expect("outcome");
    assert!(matches!(
        outcome,
        UiEvent::Succeeded { ref result_locator, .. } if result_locator == "file:///cache/next.png"
    ));

    controller.unbind_service();
    assert_eq!(controller.state(), ControllerState::Unbound);
    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn unreachable_worker_leaves_channel_unbound() {
    // Nothing listens on the discard port in the test environment.
    let mut channel = WsChannel::new("ws://127.0.0.1:9/ws");
    channel.bind();
    assert_eq!(channel.state(), ChannelState::Binding);

    let (ui_tx, _ui_rx) = mpsc::unbounded_channel();
    let mut controller = OperationController::new(Box::new(channel), ui_tx);
    assert_eq!(controller.state(), ControllerState::AwaitingBind);

    let outcome = timeout(Duration::from_secs(10), controller.wait_until_bound())
        .await
        .expect("bind settles");
    assert_eq!(outcome, Err(ControllerError::NotBound));
    assert_eq!(controller.state(), ControllerState::Idle);
    assert_eq!(
        controller.submit_request("http://example.test/img.png"),
        Err(ControllerError::NotBound)
    );
}

#[tokio::test]
async fn bind_while_binding_is_a_no_op() {
    let (worker_url, shutdown_tx) = start_worker().await;
    let mut channel = WsChannel::new(worker_url);
    let mut state = channel.watch_state();

    channel.bind();
    channel.bind();
    let settled = timeout(
        Duration::from_secs(5),
        state.wait_for(|state| *state != ChannelState::Binding),
    )
    .await
    .expect("bind in time")
    .map(|state| *state)
    .expect("state sender alive");
    assert_eq!(settled, ChannelState::Bound);

    channel.bind();
    assert_eq!(channel.state(), ChannelState::Bound);

    channel.unbind();
    assert_eq!(channel.state(), ChannelState::Unbound);
    let _ = shutdown_tx.send(());
}

fn scripted_fetcher() -> Arc<dyn Fetcher> {
    Arc::new(|locator: &str| -> Result<String, FetchError> {
        if locator.ends_with("missing") {
            return Err(FetchError::InvalidLocator(locator.to_owned()));
        }
        let name = locator.rsplit('/').next().unwrap_or_default();
        Ok(format!("file:///cache/{name}"))
    })
}

async fn start_worker() -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral worker socket");
    let address = listener.local_addr().expect("worker local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, build_router(AppState::new(scripted_fetcher())))
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("ws://{}/ws", address), shutdown_tx)
}
