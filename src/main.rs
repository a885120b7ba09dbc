use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::RatewardenConfig;
use ratewarden::gate::{PolicyStatus, RateLimitGate, RequestContext};
use ratewarden::ratelimit::{build_backend, LoggingErrorHandler, RateLimiterBackend, SystemClock};
use ratewarden::request::{RequestDescriptor, Route};

/// Evaluate gateway requests read as JSON lines from stdin.
#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// One request to evaluate.
#[derive(Debug, Deserialize)]
struct Evaluation {
    request: RequestDescriptor,
    #[serde(default)]
    route: Option<Route>,
    /// Handler duration; when present the quota is charged after admission
    #[serde(default)]
    elapsed_ms: Option<u64>,
}

/// The decision printed for each request.
#[derive(Debug, Serialize)]
struct Decision {
    allowed: bool,
    statuses: Vec<PolicyStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    completed: Vec<PolicyStatus>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RatewardenConfig::from_file(path)?,
        None => RatewardenConfig::default(),
    };

    init_tracing(
        args.log_level.as_deref().unwrap_or(&config.logging.level),
        args.json_logs || config.logging.json,
    );

    info!("Starting ratewarden");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        enabled = config.rate_limit.enabled,
        repository = ?config.rate_limit.repository,
        default_policies = config.rate_limit.default_policies.len(),
        routes = config.rate_limit.policies.len(),
        "Configuration loaded"
    );

    let backend = build_backend(
        &config.rate_limit,
        &config.redis,
        Arc::new(SystemClock),
        Arc::new(LoggingErrorHandler),
    )
    .await?;
    let gate = RateLimitGate::new(&config.rate_limit, backend);

    tokio::select! {
        result = evaluate_lines(&gate) => result?,
        _ = shutdown_signal() => {}
    }

    info!("ratewarden stopped");
    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Evaluate requests until stdin closes.
async fn evaluate_lines(gate: &RateLimitGate<dyn RateLimiterBackend>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let evaluation: Evaluation = match serde_json::from_str(&line) {
            Ok(evaluation) => evaluation,
            Err(e) => {
                warn!(error = %e, "Skipping malformed request line");
                continue;
            }
        };

        let decision = evaluate(gate, evaluation).await;
        let mut output = serde_json::to_vec(&decision)?;
        output.push(b'\n');
        stdout.write_all(&output).await?;
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

async fn evaluate(gate: &RateLimitGate<dyn RateLimiterBackend>, evaluation: Evaluation) -> Decision {
    let mut ctx = RequestContext::new(evaluation.request, evaluation.route);

    match gate.admit(&mut ctx).await {
        Ok(statuses) => {
            let completed = match evaluation.elapsed_ms {
                Some(elapsed) => gate.complete(&ctx, elapsed).await,
                None => Vec::new(),
            };
            Decision {
                allowed: true,
                statuses,
                completed,
            }
        }
        Err(exceeded) => Decision {
            allowed: false,
            statuses: exceeded.statuses,
            completed: Vec::new(),
        },
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
