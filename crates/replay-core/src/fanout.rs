use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::request::{Job, Request, Response};
use crate::transport::TransportFactory;

/// Error returned by [`Endpoints::send`] when the run is canceled while a
/// broadcast is blocked on a full endpoint queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

impl std::fmt::Display for Canceled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "send canceled")
    }
}

impl std::error::Error for Canceled {}

/// Ordered set of endpoints plus the run-global sequence counter.
///
/// Every payload is broadcast to every endpoint under the same sequence
/// number, in endpoint order, so per-endpoint statistics stay comparable.
pub struct Endpoints {
    endpoints: Vec<Arc<Endpoint>>,
    next_id: AtomicU64,
}

impl Endpoints {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build one endpoint per `[[endpoint]]` config entry, applying the
    /// `[run]` defaults where an entry has no override.
    pub fn from_config(config: &Config) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .map(|e| {
                Endpoint::new(
                    e.url.clone(),
                    e.concurrency.unwrap_or(config.run.concurrency),
                    Duration::from_millis(e.timeout_ms.unwrap_or(config.run.timeout_ms)),
                )
            })
            .collect();
        Self::new(endpoints)
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Broadcast one payload to every endpoint, in order, under the next
    /// sequence number. The counter is atomic, so concurrent producers
    /// never observe a lost or duplicated id.
    ///
    /// Blocks whenever an endpoint queue is full; the slowest endpoint
    /// throttles the whole input stream. If `token` fires while blocked,
    /// returns [`Canceled`]. Endpoints reached before the cancellation keep
    /// their copy, since this is a broadcast rather than a transaction.
    pub async fn send(&self, token: &CancellationToken, line: Vec<u8>) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timestamp = Instant::now();

        for endpoint in &self.endpoints {
            let job = Job::Request(Request {
                id,
                line: line.clone(),
                timestamp,
            });
            tokio::select! {
                _ = token.cancelled() => return Err(Canceled.into()),
                sent = endpoint.queue().send(job) => {
                    sent.map_err(|_| {
                        anyhow::anyhow!("request queue for {} closed", endpoint.address)
                    })?;
                }
            }
        }
        Ok(id)
    }

    /// Signal the end of the input stream: exactly one shutdown message per
    /// worker, per endpoint, so every worker exits cleanly. May block while
    /// queues drain remaining traffic; only meant to run after input ends.
    pub async fn finalize(&self) -> Result<()> {
        for endpoint in &self.endpoints {
            debug!(endpoint = %endpoint.address, "signaling end of stream");
            for _ in 0..endpoint.concurrency {
                endpoint.queue().send(Job::Shutdown).await.map_err(|_| {
                    anyhow::anyhow!("request queue for {} closed", endpoint.address)
                })?;
            }
        }
        Ok(())
    }

    /// Start every endpoint's worker pool concurrently and wait for all of
    /// them. The first pool to fail cancels the shared token, so sibling
    /// pools observe the cancellation and exit promptly; that first error is
    /// the result. A clean shutdown yields `Ok(())`.
    pub async fn serve(
        &self,
        token: CancellationToken,
        factory: Arc<dyn TransportFactory>,
        out: mpsc::Sender<Response>,
    ) -> Result<()> {
        let mut pools = JoinSet::new();
        for endpoint in &self.endpoints {
            let endpoint = endpoint.clone();
            let token = token.clone();
            let factory = factory.clone();
            let out = out.clone();
            pools.spawn(async move { endpoint.serve(token, factory, out).await });
        }
        drop(out);

        let mut result = Ok(());
        while let Some(joined) = pools.join_next().await {
            let pool_result = joined.context("endpoint pool panicked")?;
            if let Err(e) = pool_result {
                if result.is_ok() {
                    result = Err(e);
                }
                token.cancel();
            }
        }
        result
    }
}
