use anyhow::Result;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::request::{Request, Response};

/// Trait for the protocol-layer object that performs one request/response
/// exchange against an endpoint.
///
/// Execution itself never fails; failure is encoded in [`Response::err`].
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute<'a>(
        &'a self,
        req: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>>;
}

/// Builds one transport per worker, bound to an endpoint address and
/// per-request timeout. A construction failure is fatal to that worker's
/// pool.
pub trait TransportFactory: Send + Sync {
    fn build(&self, address: &str, timeout: Duration) -> Result<Arc<dyn Transport>>;
}

/// HTTP transport: POSTs the raw payload bytes to the endpoint address.
pub struct HttpTransport {
    client: reqwest::Client,
    address: String,
}

impl HttpTransport {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            address: address.to_string(),
        })
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn execute<'a>(
        &'a self,
        req: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>> {
        Box::pin(async move {
            let start = Instant::now();

            match self
                .client
                .post(self.address.as_str())
                .body(req.line.clone())
                .send()
                .await
            {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                    let err = if status.is_success() {
                        None
                    } else {
                        Some(format!("status {}", status.as_u16()))
                    };
                    Response {
                        endpoint: self.address.clone(),
                        id: req.id,
                        err,
                        elapsed: start.elapsed(),
                        status: Some(status.as_u16()),
                        body,
                    }
                }
                Err(e) => Response {
                    endpoint: self.address.clone(),
                    id: req.id,
                    err: Some(e.to_string()),
                    elapsed: start.elapsed(),
                    status: None,
                    body: Vec::new(),
                },
            }
        })
    }
}

pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn build(&self, address: &str, timeout: Duration) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(HttpTransport::new(address, timeout)?))
    }
}

/// Mock transport for testing (configurable delay, optional fixed error).
pub struct MockTransport {
    address: String,
    delay: Duration,
    error: Option<String>,
}

impl MockTransport {
    pub fn new(address: &str, delay: Duration, error: Option<String>) -> Self {
        Self {
            address: address.to_string(),
            delay,
            error,
        }
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn execute<'a>(
        &'a self,
        req: &'a Request,
    ) -> Pin<Box<dyn Future<Output = Response> + Send + 'a>> {
        Box::pin(async move {
            let start = Instant::now();
            sleep(self.delay).await;

            Response {
                endpoint: self.address.clone(),
                id: req.id,
                err: self.error.clone(),
                elapsed: start.elapsed(),
                status: None,
                body: Vec::new(),
            }
        })
    }
}

/// Factory producing [`MockTransport`] instances. Specific addresses can be
/// configured to always fail their requests with a fixed error message.
#[derive(Default)]
pub struct MockTransportFactory {
    delay: Duration,
    failures: HashMap<String, String>,
}

impl MockTransportFactory {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failures: HashMap::new(),
        }
    }

    pub fn failing_address(mut self, address: &str, error: &str) -> Self {
        self.failures.insert(address.to_string(), error.to_string());
        self
    }
}

impl TransportFactory for MockTransportFactory {
    fn build(&self, address: &str, _timeout: Duration) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(MockTransport::new(
            address,
            self.delay,
            self.failures.get(address).cloned(),
        )))
    }
}
