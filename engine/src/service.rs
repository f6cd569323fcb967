use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::requests::Request;

/// Depth of the per-service input and output queues. Traffic beyond this
/// applies back-pressure to the producer instead of growing without bound.
const SERVICE_QUEUE_DEPTH: usize = 1000;

/// The port every data source implements toward the engine.
///
/// A service is an independent worker with an input queue the engine
/// submits requests to, an output stream the engine drains into the
/// pipeline source, and a done signal observed during shutdown. The
/// engine never reaches past this surface into a source's internals.
#[async_trait]
pub trait Service: Send + Sync {
    /// Unique identifier of the service, used for attribution in the graph.
    fn name(&self) -> &str;

    /// Human-readable identity shown in logs.
    fn description(&self) -> String {
        self.name().to_string()
    }

    /// Type filter consulted before fan-in; a request the service does not
    /// handle is never submitted to it.
    fn handles_request(&self, req: &Request) -> bool;

    /// Fan-in of one request. Blocks under back-pressure and fails with
    /// `ContextExpired` when `ctx` is cancelled first.
    async fn submit(&self, ctx: &CancellationToken, req: Request) -> Result<()>;

    /// The stream of requests this service produces.
    fn output(&self) -> flume::Receiver<Request>;

    /// Cancelled once the service has fully stopped.
    fn done(&self) -> CancellationToken;

    /// Start the service worker.
    async fn start(&self) -> Result<()>;

    /// Stop the service worker and release its resources. Idempotent.
    async fn stop(&self) -> Result<()>;
}

/// Channel plumbing shared by service implementations.
///
/// Owns both sides of the input and output queues; the worker reads
/// `input()` and writes through `send_output`, while the engine submits
/// through `submit` and drains `output()`.
pub struct ServiceBase {
    name: String,
    input_tx: flume::Sender<Request>,
    input_rx: flume::Receiver<Request>,
    output_tx: flume::Sender<Request>,
    output_rx: flume::Receiver<Request>,
    done: CancellationToken,
}

impl ServiceBase {
    pub fn new(name: &str) -> Self {
        let (input_tx, input_rx) = flume::bounded(SERVICE_QUEUE_DEPTH);
        // The output queue is bounded too: once the engine stops draining
        // a source (no refill demand), the source's emissions block until
        // demand returns.
        let (output_tx, output_rx) = flume::bounded(SERVICE_QUEUE_DEPTH);
        Self {
            name: name.to_string(),
            input_tx,
            input_rx,
            output_tx,
            output_rx,
            done: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receiver side of the input queue, read by the service worker.
    pub fn input(&self) -> flume::Receiver<Request> {
        self.input_rx.clone()
    }

    pub fn output(&self) -> flume::Receiver<Request> {
        self.output_rx.clone()
    }

    /// Sender handed to worker internals that emit discoveries.
    pub fn output_sender(&self) -> flume::Sender<Request> {
        self.output_tx.clone()
    }

    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Signal termination to everyone holding the done token. Idempotent.
    pub fn mark_done(&self) {
        self.done.cancel();
    }

    /// Enqueue a request for the worker, observing cancellation.
    pub async fn submit(&self, ctx: &CancellationToken, req: Request) -> Result<()> {
        tokio::select! {
            _ = ctx.cancelled() => Err(EngineError::ContextExpired),
            _ = self.done.cancelled() => Err(EngineError::validation_error("service stopped")),
            sent = self.input_tx.send_async(req) => {
                sent.map_err(|e| EngineError::validation_error(&e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::{DnsRequest, Tag};

    #[tokio::test]
    async fn submit_fails_once_the_context_expires() {
        let base = ServiceBase::new("stub");
        let ctx = CancellationToken::new();

        let req = Request::Dns(DnsRequest::new("www.example.com", "example.com", Tag::Dns, "stub"));
        base.submit(&ctx, req.clone()).await.unwrap();
        assert_eq!(base.input().len(), 1);

        ctx.cancel();
        // Queue is drained by nobody here; a cancelled context must win over
        // a send that would otherwise succeed eventually.
        for _ in 0..SERVICE_QUEUE_DEPTH {
            if base.submit(&ctx, req.clone()).await.is_err() {
                return;
            }
        }
        panic!("cancelled context never rejected the submission");
    }

    #[tokio::test]
    async fn outputs_flow_from_worker_to_engine() {
        let base = ServiceBase::new("stub");
        let sender = base.output_sender();
        sender
            .send_async(Request::Dns(DnsRequest::new(
                "app.example.com",
                "example.com",
                Tag::Api,
                "stub",
            )))
            .await
            .unwrap();

        let received = base.output().recv_async().await.unwrap();
        assert_eq!(received.source(), "stub");
        assert_eq!(received.tag(), Tag::Api);
    }
}
