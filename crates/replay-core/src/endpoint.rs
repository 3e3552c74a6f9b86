use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::request::{Job, Response};
use crate::stats::EndpointStats;
use crate::transport::TransportFactory;

/// One configured destination: address, worker count, bounded request queue,
/// and its own stats aggregator.
///
/// The queue depth bounds how far the sequencer can run ahead of this
/// endpoint before blocking, which is what propagates backpressure from the
/// slowest endpoint to the input stream.
pub struct Endpoint {
    pub address: String,
    pub concurrency: usize,
    pub timeout: Duration,
    queue_tx: async_channel::Sender<Job>,
    queue_rx: async_channel::Receiver<Job>,
    pub stats: Arc<EndpointStats>,
}

impl Endpoint {
    /// A concurrency below 1 is coerced to 1.
    pub fn new(address: impl Into<String>, concurrency: usize, timeout: Duration) -> Self {
        let concurrency = concurrency.max(1);
        let (queue_tx, queue_rx) = async_channel::bounded(2 * concurrency);
        Self {
            address: address.into(),
            concurrency,
            timeout,
            queue_tx,
            queue_rx,
            stats: Arc::new(EndpointStats::new()),
        }
    }

    pub(crate) fn queue(&self) -> &async_channel::Sender<Job> {
        &self.queue_tx
    }

    #[cfg(test)]
    pub(crate) fn receiver(&self) -> async_channel::Receiver<Job> {
        self.queue_rx.clone()
    }

    /// Run this endpoint's worker pool until every worker has exited.
    ///
    /// Each worker builds its own transport; a construction failure is the
    /// pool's result and stops the sibling workers. Cancellation and shutdown
    /// messages both end a worker cleanly.
    pub async fn serve(
        &self,
        token: CancellationToken,
        factory: Arc<dyn TransportFactory>,
        out: mpsc::Sender<Response>,
    ) -> Result<()> {
        debug!(
            endpoint = %self.address,
            concurrency = self.concurrency,
            "starting endpoint workers"
        );

        let pool_token = token.child_token();
        let mut workers = JoinSet::new();
        for _ in 0..self.concurrency {
            let worker_token = pool_token.clone();
            let queue = self.queue_rx.clone();
            let stats = self.stats.clone();
            let out = out.clone();
            let factory = factory.clone();
            let address = self.address.clone();
            let timeout = self.timeout;
            workers.spawn(async move {
                run_worker(worker_token, queue, stats, out, factory, address, timeout).await
            });
        }

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            let worker_result = joined.context("endpoint worker panicked")?;
            if let Err(e) = worker_result {
                if result.is_ok() {
                    result = Err(e);
                }
                // First failure wins; stop the remaining workers promptly.
                pool_token.cancel();
            }
        }
        result
    }
}

async fn run_worker(
    token: CancellationToken,
    queue: async_channel::Receiver<Job>,
    stats: Arc<EndpointStats>,
    out: mpsc::Sender<Response>,
    factory: Arc<dyn TransportFactory>,
    address: String,
    timeout: Duration,
) -> Result<()> {
    let transport = factory
        .build(&address, timeout)
        .with_context(|| format!("Failed to build transport for {address}"))?;

    loop {
        let job = tokio::select! {
            _ = token.cancelled() => {
                debug!(endpoint = %address, "aborting worker");
                return Ok(());
            }
            job = queue.recv() => match job {
                Ok(job) => job,
                // All senders dropped, nothing left to drain.
                Err(_) => return Ok(()),
            },
        };

        let req = match job {
            Job::Shutdown => {
                debug!(endpoint = %address, "received shutdown message, stopping worker");
                return Ok(());
            }
            Job::Request(req) => req,
        };

        let resp = transport.execute(&req).await;
        stats.record(resp.err.as_deref(), resp.elapsed);

        // A response is never dropped: fall back to a blocking send when the
        // reporter cannot keep up.
        match out.try_send(resp) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(resp)) => {
                warn!(endpoint = %address, "response channel overloaded");
                out.send(resp)
                    .await
                    .map_err(|_| anyhow::anyhow!("response channel closed"))?;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                anyhow::bail!("response channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use crate::transport::{MockTransportFactory, Transport};
    use std::time::Instant;
    use tokio::time::timeout;

    struct FailingFactory;

    impl TransportFactory for FailingFactory {
        fn build(&self, address: &str, _timeout: Duration) -> Result<Arc<dyn Transport>> {
            anyhow::bail!("no transport for {address}")
        }
    }

    fn mock_factory() -> Arc<dyn TransportFactory> {
        Arc::new(MockTransportFactory::new(Duration::ZERO))
    }

    fn request(id: u64) -> Job {
        Job::Request(Request {
            id,
            line: b"payload".to_vec(),
            timestamp: Instant::now(),
        })
    }

    #[tokio::test]
    async fn test_shutdown_message_per_worker_ends_pool() {
        let endpoint = Endpoint::new("mock://a", 3, Duration::from_secs(1));
        let (out_tx, _out_rx) = mpsc::channel(16);
        let token = CancellationToken::new();

        for _ in 0..endpoint.concurrency {
            endpoint.queue().send(Job::Shutdown).await.unwrap();
        }

        let result = timeout(
            Duration::from_secs(5),
            endpoint.serve(token, mock_factory(), out_tx),
        )
        .await
        .expect("pool did not terminate");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_workers() {
        let endpoint = Endpoint::new("mock://a", 2, Duration::from_secs(1));
        let (out_tx, _out_rx) = mpsc::channel(16);
        let token = CancellationToken::new();

        token.cancel();

        let result = timeout(
            Duration::from_secs(5),
            endpoint.serve(token, mock_factory(), out_tx),
        )
        .await
        .expect("pool did not terminate");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_construction_failure_is_pool_error() {
        let endpoint = Endpoint::new("mock://a", 2, Duration::from_secs(1));
        let (out_tx, _out_rx) = mpsc::channel(16);
        let token = CancellationToken::new();

        let result = timeout(
            Duration::from_secs(5),
            endpoint.serve(token, Arc::new(FailingFactory), out_tx),
        )
        .await
        .expect("pool did not terminate");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_no_response_loss_under_overload() {
        let endpoint = Endpoint::new("mock://a", 1, Duration::from_secs(1));
        // Output buffer of one, so the non-blocking send path saturates.
        let (out_tx, mut out_rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let queue = endpoint.queue().clone();

        let serve = tokio::spawn({
            let factory = mock_factory();
            async move { endpoint.serve(token, factory, out_tx).await }
        });

        let producer = tokio::spawn(async move {
            for id in 1..=10 {
                queue.send(request(id)).await.unwrap();
            }
            queue.send(Job::Shutdown).await.unwrap();
        });

        // Drain slowly so workers hit the blocking fallback.
        let mut received = 0u64;
        while let Some(_resp) = out_rx.recv().await {
            received += 1;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        producer.await.unwrap();
        serve.await.unwrap().unwrap();
        assert_eq!(received, 10);
    }

    #[tokio::test]
    async fn test_requests_recorded_in_stats() {
        let endpoint = Endpoint::new("mock://a", 2, Duration::from_secs(1));
        let stats = endpoint.stats.clone();
        let concurrency = endpoint.concurrency;
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let queue = endpoint.queue().clone();

        let serve = tokio::spawn({
            let factory = mock_factory();
            async move { endpoint.serve(token, factory, out_tx).await }
        });

        for id in 1..=4 {
            queue.send(request(id)).await.unwrap();
        }
        for _ in 0..concurrency {
            queue.send(Job::Shutdown).await.unwrap();
        }

        serve.await.unwrap().unwrap();

        let mut received = 0u64;
        while out_rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 4);

        let summary = stats.summary();
        assert_eq!(summary.num_total, 4);
        assert_eq!(summary.num_errors, 0);
    }

    #[test]
    fn test_concurrency_coerced_to_one() {
        let endpoint = Endpoint::new("mock://a", 0, Duration::from_secs(1));
        assert_eq!(endpoint.concurrency, 1);
    }
}
