use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct StatsInner {
    num_total: u64,
    num_errors: u64,
    time_total: Duration,
    time_errors: Duration,
    errors_by_message: HashMap<String, u64>,
}

/// Thread-safe latency and error accumulator for one endpoint's traffic.
///
/// Both `record` and `render` take the same mutex, so a rendered report is
/// a consistent snapshot rather than a best-effort read.
#[derive(Debug, Default)]
pub struct EndpointStats {
    inner: Mutex<StatsInner>,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self::default()
    }

    // Counter updates cannot panic mid-write, so a poisoned lock still
    // holds consistent data and is safe to keep using.
    fn locked(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the outcome of one execution attempt. Error durations
    /// accumulate into both `time_errors` and `time_total`.
    pub fn record(&self, err: Option<&str>, elapsed: Duration) {
        let mut inner = self.locked();

        inner.num_total += 1;
        if let Some(msg) = err {
            inner.num_errors += 1;
            inner.time_errors += elapsed;
            *inner.errors_by_message.entry(msg.to_string()).or_insert(0) += 1;
        }
        inner.time_total += elapsed;
    }

    /// Write a human-readable summary.
    ///
    /// With zero recorded requests this reports "No requests." and returns
    /// before any ratio is computed; every derived metric is guarded against
    /// a zero denominator independently.
    pub fn render(&self, w: &mut impl Write) -> std::io::Result<()> {
        let inner = self.locked();

        if inner.num_total == 0 {
            writeln!(w, "   No requests.")?;
            return Ok(());
        }

        let total_secs = inner.time_total.as_secs_f64();
        let rps = if total_secs > 0.0 {
            inner.num_total as f64 / total_secs
        } else {
            0.0
        };
        write!(w, "   Requests/Sec: {rps:.2}")?;
        if inner.num_errors > 0 && inner.num_errors != inner.num_total {
            let err_avg =
                Duration::from_secs_f64(inner.time_errors.as_secs_f64() / inner.num_errors as f64);
            write!(w, ", {} per error", format_duration(err_avg))?;
        }
        writeln!(w)?;

        let req_avg =
            Duration::from_secs_f64(inner.time_total.as_secs_f64() / inner.num_total as f64);
        let err_rate = inner.num_errors as f64 * 100.0 / inner.num_total as f64;
        writeln!(w, "   Average:      {}", format_duration(req_avg))?;
        writeln!(w, "   Errors:       {err_rate:.2}%")?;

        for (msg, num) in &inner.errors_by_message {
            writeln!(w, "   * [{num}] {msg:?}")?;
        }

        Ok(())
    }

    /// Consistent snapshot of the counters, for machine-readable output.
    pub fn summary(&self) -> StatsSummary {
        let inner = self.locked();
        StatsSummary {
            num_total: inner.num_total,
            num_errors: inner.num_errors,
            time_total_ms: inner.time_total.as_millis() as u64,
            time_errors_ms: inner.time_errors.as_millis() as u64,
            errors_by_message: inner.errors_by_message.clone(),
        }
    }
}

/// Render a duration with a unit picked for readability.
fn format_duration(d: Duration) -> String {
    if d >= Duration::from_secs(1) {
        format!("{:.2}s", d.as_secs_f64())
    } else if d >= Duration::from_millis(1) {
        format!("{:.2}ms", d.as_secs_f64() * 1e3)
    } else {
        format!("{}µs", d.as_micros())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub num_total: u64,
    pub num_errors: u64,
    pub time_total_ms: u64,
    pub time_errors_ms: u64,
    pub errors_by_message: HashMap<String, u64>,
}
