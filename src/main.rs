//! playground-executor
//!
//! Runs untrusted programs in disposable sandboxes. Serves an MCP `execute`
//! tool over stdio, or executes a single request document and prints the
//! result.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use playground_executor::config::{BackendType, Config};
use playground_executor::orchestrator::Orchestrator;
use playground_executor::{backend, mcp};

#[derive(Parser, Debug)]
#[command(name = "playground-executor")]
#[command(about = "Run untrusted programs in disposable sandboxes")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long, conflicts_with = "request")]
    stdio: bool,

    /// Execute one request document (a path, or - for stdin) and print the result
    #[arg(long, value_name = "PATH")]
    request: Option<String>,

    /// JSON config file (default: PLAYGROUND_CONFIG or built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the isolation backend
    #[arg(long, value_enum)]
    backend: Option<BackendType>,

    /// Override the number of concurrently live sandboxes
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Override the run timeout (0 disables it)
    #[arg(long)]
    timeout_seconds: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::from_env()?,
        };
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(n) = self.max_concurrent {
            config.max_concurrent = n;
        }
        if let Some(secs) = self.timeout_seconds {
            config.timeout_seconds = secs;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol and results)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.load_config().context("Failed to load configuration")?;

    info!(
        backend = ?config.backend,
        max_concurrent = config.max_concurrent,
        timeout_seconds = config.timeout_seconds,
        "Loaded configuration"
    );

    let isolation = backend::from_config(&config).context("Failed to initialize backend")?;
    let orchestrator = Orchestrator::new(isolation, config);

    if args.stdio {
        let sweeper = orchestrator.start_sweeper();
        let served = mcp::serve_stdio(orchestrator).await;
        sweeper.abort();
        served?;
    } else if let Some(source) = &args.request {
        let body = read_request(source).await?;
        let result = orchestrator.execute_request(&body).await;
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        anyhow::bail!("Pass --stdio to serve MCP, or --request <PATH|-> to run one request");
    }

    Ok(())
}

async fn read_request(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut body = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut body)
            .await
            .context("Failed to read request from stdin")?;
        Ok(body)
    } else {
        tokio::fs::read(source)
            .await
            .with_context(|| format!("Failed to read request file {source}"))
    }
}
