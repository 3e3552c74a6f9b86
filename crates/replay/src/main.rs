use anyhow::{Context, Result};
use clap::Parser;
use replay_core::{
    Canceled, Config, EndpointConfig, Endpoints, HttpTransportFactory, MockTransportFactory,
    Response, RunConfig, StatsSummary, TransportFactory,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "replay")]
#[command(about = "Replays a stream of request payloads against multiple endpoints")]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Endpoint URL (repeatable; used when no config file is given)
    #[arg(long = "endpoint")]
    endpoints: Vec<String>,

    /// Workers per endpoint
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Per-request timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Transport mode: http or mock
    #[arg(long, default_value = "http")]
    mode: String,

    /// Input file with one payload per line (defaults to stdin)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Write a machine-readable run summary to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    timestamp: String,
    duration_ms: u64,
    lines_sent: u64,
    responses: u64,
    endpoints: Vec<EndpointSummary>,
}

#[derive(Debug, Serialize)]
struct EndpointSummary {
    address: String,
    concurrency: usize,
    #[serde(flatten)]
    stats: StatsSummary,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let factory: Arc<dyn TransportFactory> = match args.mode.as_str() {
        "http" => Arc::new(HttpTransportFactory),
        "mock" => Arc::new(MockTransportFactory::new(Duration::from_millis(5))),
        _ => anyhow::bail!("Invalid mode: {}, must be 'http' or 'mock'", args.mode),
    };

    let endpoints = Arc::new(Endpoints::from_config(&config));
    info!(
        endpoints = endpoints.endpoints().len(),
        mode = %args.mode,
        "starting replay"
    );

    let token = CancellationToken::new();
    let (out_tx, mut out_rx) = mpsc::channel::<Response>(config.run.output_buffer);

    // External reporter: drains the shared response stream.
    let reporter = tokio::spawn(async move {
        let mut responses = 0u64;
        while let Some(resp) = out_rx.recv().await {
            responses += 1;
            debug!(
                endpoint = %resp.endpoint,
                id = resp.id,
                elapsed = ?resp.elapsed,
                err = resp.err.as_deref(),
                "response"
            );
        }
        responses
    });

    let serve = tokio::spawn({
        let endpoints = endpoints.clone();
        let token = token.clone();
        async move { endpoints.serve(token, factory, out_tx).await }
    });

    let start = Instant::now();
    let feed_result = feed_input(&args, &endpoints, &token).await;

    if feed_result.is_ok() {
        // Skip the shutdown protocol when the run is already canceled: a
        // failed pool no longer drains its queue.
        tokio::select! {
            _ = token.cancelled() => {}
            finalized = endpoints.finalize() => finalized?,
        }
    }

    let serve_result = serve.await.context("orchestrator panicked")?;
    let responses = reporter.await.context("reporter panicked")?;
    serve_result?;
    let lines_sent = feed_result?;
    let elapsed = start.elapsed();

    info!(
        lines = lines_sent,
        responses, elapsed = ?elapsed, "run complete"
    );

    let mut stdout = std::io::stdout();
    for endpoint in endpoints.endpoints() {
        println!("\n=== {} ===", endpoint.address);
        endpoint.stats.render(&mut stdout)?;
    }
    println!();

    if let Some(path) = &args.summary_json {
        write_summary(path, &endpoints, lines_sent, responses, elapsed)?;
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    if let Some(path) = &args.config {
        return Config::from_file(path)
            .with_context(|| format!("Failed to load config from {path:?}"));
    }

    if args.endpoints.is_empty() {
        anyhow::bail!("No endpoints: pass --config or at least one --endpoint");
    }

    Ok(Config {
        run: RunConfig {
            concurrency: args.concurrency,
            timeout_ms: args.timeout_ms,
            ..RunConfig::default()
        },
        endpoints: args
            .endpoints
            .iter()
            .map(|url| EndpointConfig {
                url: url.clone(),
                concurrency: None,
                timeout_ms: None,
            })
            .collect(),
    })
}

async fn feed_input(
    args: &Args,
    endpoints: &Endpoints,
    token: &CancellationToken,
) -> Result<u64> {
    match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open input file {path:?}"))?;
            send_lines(BufReader::new(file), endpoints, token).await
        }
        None => send_lines(BufReader::new(tokio::io::stdin()), endpoints, token).await,
    }
}

async fn send_lines<R: AsyncBufRead + Unpin>(
    reader: R,
    endpoints: &Endpoints,
    token: &CancellationToken,
) -> Result<u64> {
    let mut lines = reader.lines();
    let mut sent = 0u64;
    loop {
        // An idle input (stdin, typically) must not outlive a canceled run:
        // reading and cancellation race here, just as in `Endpoints::send`.
        let line = tokio::select! {
            _ = token.cancelled() => return Err(Canceled.into()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.is_empty() {
            continue;
        }
        endpoints.send(token, line.into_bytes()).await?;
        sent += 1;
    }
    Ok(sent)
}

fn endpoint_summaries(endpoints: &Endpoints) -> Vec<EndpointSummary> {
    endpoints
        .endpoints()
        .iter()
        .map(|endpoint| EndpointSummary {
            address: endpoint.address.clone(),
            concurrency: endpoint.concurrency,
            stats: endpoint.stats.summary(),
        })
        .collect()
}

fn write_summary(
    path: &PathBuf,
    endpoints: &Endpoints,
    lines_sent: u64,
    responses: u64,
    elapsed: Duration,
) -> Result<()> {
    let summary = RunSummary {
        timestamp: chrono::Utc::now().to_rfc3339(),
        duration_ms: elapsed.as_millis() as u64,
        lines_sent,
        responses,
        endpoints: endpoint_summaries(endpoints),
    };

    let json = serde_json::to_string_pretty(&summary)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write summary to {path:?}"))?;
    info!("Summary written to {path:?}");
    Ok(())
}
