use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Default worker count per endpoint (coerced to at least 1).
    pub concurrency: usize,
    /// Default per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Buffer size of the shared response stream.
    pub output_buffer: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout_ms: 10_000,
            output_buffer: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Destination URL.
    pub url: String,
    /// Worker count override for this endpoint.
    pub concurrency: Option<usize>,
    /// Per-request timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}
