use std::sync::Arc;

use fetchops_core::{Envelope, decode_request, encode_reply};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info, warn};

use crate::fetcher::Fetcher;

/// Services one request envelope and builds the matching reply.
///
/// Malformed requests are logged and dropped (`None`). Fetch failures, including
/// a panicking fetcher, turn into failure replies that still echo the request id.
pub async fn serve_request(fetcher: Arc<dyn Fetcher>, envelope: Envelope) -> Option<Envelope> {
    let request = match decode_request(&envelope) {
        Ok(request) => request,
        Err(err) => {
            warn!("dropping malformed request: {}", err);
            return None;
        }
    };

    let locator = request.locator.clone();
    let outcome = tokio::task::spawn_blocking(move || fetcher.fetch(&locator)).await;

    let result = match outcome {
        Ok(Ok(result)) => {
            info!(
                request_id = request.request_id,
                locator = %request.locator,
                result = %result,
                "fetch succeeded"
            );
            Some(result)
        }
        Ok(Err(err)) => {
            warn!(
                request_id = request.request_id,
                locator = %request.locator,
                "fetch failed: {}",
                err
            );
            None
        }
        Err(err) => {
            error!(request_id = request.request_id, "fetch task aborted: {}", err);
            None
        }
    };

    Some(encode_reply(
        result.as_deref(),
        request.request_id,
        Some(&request.locator),
    ))
}

/// A worker running inside the client process.
#[derive(Debug)]
pub struct LocalWorker {
    requests: mpsc::UnboundedSender<Envelope>,
    task: JoinHandle<()>,
}

impl LocalWorker {
    /// Starts the worker loop on the current runtime. Replies are pushed to
    /// `replies` in the order fetches complete.
    pub fn spawn(fetcher: Arc<dyn Fetcher>, replies: mpsc::UnboundedSender<Envelope>) -> Self {
        let (requests, mut request_rx) = mpsc::unbounded_channel::<Envelope>();

        let task = tokio::spawn(async move {
            while let Some(envelope) = request_rx.recv().await {
                let fetcher = Arc::clone(&fetcher);
                let replies = replies.clone();
                tokio::spawn(async move {
                    if let Some(reply) = serve_request(fetcher, envelope).await {
                        let _ = replies.send(reply);
                    }
                });
            }
        });

        Self { requests, task }
    }

    /// Queues a request. Returns false once the worker has stopped.
    pub fn submit(&self, envelope: Envelope) -> bool {
        self.requests.send(envelope).is_ok()
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fetchops_core::{OperationKind, StatusCode, decode_reply, encode_request};
    use tokio::time::timeout;

    use super::*;
    use crate::fetcher::FetchError;

    fn cache_hit() -> Arc<dyn Fetcher> {
        Arc::new(|locator: &str| -> Result<String, FetchError> {
            let name = locator.rsplit('/').next().unwrap_or_default();
            Ok(format!("file:///cache/{name}"))
        })
    }

    #[tokio::test]
    async fn reply_echoes_request_id_and_source() {
        let request =
            encode_request(OperationKind::FetchResource, "http://example.test/img.png", 7)
                .unwrap();
        let reply = serve_request(cache_hit(), request).await.expect("reply");
        let reply = decode_reply(&reply).unwrap();
        assert_eq!(reply.request_id, 7);
        assert_eq!(reply.status, StatusCode::Success);
        assert_eq!(reply.result_locator.as_deref(), Some("file:///cache/img.png"));
        assert_eq!(
            reply.source_locator.as_deref(),
            Some("http://example.test/img.png")
        );
    }

    #[tokio::test]
    async fn fetch_error_becomes_failure_reply() {
        let failing: Arc<dyn Fetcher> = Arc::new(|_: &str| -> Result<String, FetchError> {
            Err(FetchError::UnsupportedScheme("gopher".to_owned()))
        });
        let request =
            encode_request(OperationKind::FetchResource, "gopher://example.test/x", 3).unwrap();
        let reply = decode_reply(&serve_request(failing, request).await.expect("reply")).unwrap();
        assert_eq!(reply.request_id, 3);
        assert_eq!(reply.status, StatusCode::Failure);
        assert!(reply.result_locator.is_none());
    }

    #[tokio::test]
    async fn panicking_fetcher_still_replies() {
        let panicking: Arc<dyn Fetcher> =
            Arc::new(|_: &str| -> Result<String, FetchError> { panic!("fetcher blew up") });
        let request =
            encode_request(OperationKind::FetchResource, "http://example.test/a", 5).unwrap();
        let reply = decode_reply(&serve_request(panicking, request).await.expect("reply")).unwrap();
        assert_eq!(reply.status, StatusCode::Failure);
        assert_eq!(reply.request_id, 5);
    }

    #[tokio::test]
    async fn malformed_request_is_dropped() {
        let reply_shaped = encode_reply(None, 1, None);
        assert!(serve_request(cache_hit(), reply_shaped).await.is_none());
    }

    #[tokio::test]
    async fn local_worker_delivers_replies() {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let worker = LocalWorker::spawn(cache_hit(), reply_tx);

        let request =
            encode_request(OperationKind::FetchResource, "http://example.test/b.png", 12)
                .unwrap();
        assert!(worker.submit(request));

        let reply = timeout(Duration::from_secs(2), reply_rx.recv())
            .await
            .expect("reply in time")
            .expect("channel open");
        assert_eq!(reply.request_id(), Some(12));
        worker.shutdown();
    }
}
