use std::time::{Duration, Instant};

/// One replayed input payload, fanned out to every endpoint.
#[derive(Debug, Clone)]
pub struct Request {
    /// Globally monotonic sequence number, starting at 1. The same id is
    /// assigned to every endpoint's copy of a given payload.
    pub id: u64,
    /// Opaque payload bytes, identical across endpoints for a given id.
    pub line: Vec<u8>,
    /// Enqueue time, for request-age visibility only.
    pub timestamp: Instant,
}

/// One message on an endpoint's request queue.
///
/// `finalize` sends exactly one `Shutdown` per worker, so every worker
/// consumes precisely one and exits cleanly.
#[derive(Debug, Clone)]
pub enum Job {
    Request(Request),
    Shutdown,
}

/// Outcome of one execution attempt against one endpoint.
#[derive(Debug, Clone)]
pub struct Response {
    /// Address of the endpoint that served the request.
    pub endpoint: String,
    /// Sequence number of the request that produced this response.
    pub id: u64,
    /// Present if the attempt failed; `None` on success.
    pub err: Option<String>,
    /// Wall-clock duration of the attempt.
    pub elapsed: Duration,
    /// Transport-specific status, passed through unexamined.
    pub status: Option<u16>,
    /// Transport-specific body, passed through unexamined.
    pub body: Vec<u8>,
}
