//! Strategy Sandbox CLI
//!
//! Scans, probes and runs untrusted strategy scripts, or serves the sandbox
//! over newline-delimited JSON-RPC on stdio.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandbox_runtime::monitor::{baseline, ProcFsProbe};
use sandbox_runtime::tier::{select_tier, TierCapabilities};
use sandbox_runtime::{install_signal_handlers, Closeable, ExecutionRequest, SandboxConfig, SandboxOrchestrator};
use serde_json::json;
use strategy_sandbox::cli::{parse_param, EXIT_FAILED, EXIT_UNSAFE};
use strategy_sandbox::serve::{serve_until, ServeContext};
use threat_scanner::ThreatScanner;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (defaults to config/sandbox.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Statically scan a script file and print the threat report
    Scan {
        /// Script to scan
        file: PathBuf,
    },
    /// Probe isolation capabilities and print the selected tier
    Probe,
    /// Run one entry point of a stored script
    Run {
        /// Script reference, relative to the storage root (e.g. alice/momentum.py)
        #[arg(long)]
        script: String,

        /// Entry point to call
        #[arg(long)]
        entry: String,

        /// Submitting user
        #[arg(long)]
        user: String,

        /// Parameter as name=value; repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Timeout in seconds
        #[arg(long, default_value_t = 10.0)]
        timeout: f64,
    },
    /// Serve JSON-RPC requests on stdin/stdout
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init_tracing(&args.log_level)?;

    info!("🥷 Starting Strategy Sandbox v{}", env!("CARGO_PKG_VERSION"));
    let config = SandboxConfig::load(args.config.as_deref()).context("loading configuration")?;
    info!("✅ Configuration loaded successfully");

    match args.command {
        Command::Scan { file } => scan(&config, file),
        Command::Probe => probe(&config).await,
        Command::Run {
            script,
            entry,
            user,
            params,
            timeout,
        } => run(config, script, entry, user, params, timeout).await,
        Command::Serve => serve_stdio(config).await,
    }
}

fn scan(config: &SandboxConfig, file: PathBuf) -> Result<()> {
    let code = std::fs::read_to_string(&file)
        .with_context(|| format!("reading {}", file.display()))?;
    let filename = file.display().to_string();
    let report = ThreatScanner::new(config.scanner_config()).analyze(&code, &filename);
    println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    if !report.is_safe() {
        warn!("🚫 {}", report.summary());
        std::process::exit(EXIT_UNSAFE);
    }
    Ok(())
}

async fn probe(config: &SandboxConfig) -> Result<()> {
    let capabilities = TierCapabilities::probe(config).await;
    let selected = select_tier(config.preferred_tier, &capabilities);
    let base = baseline::capture(&ProcFsProbe::new());
    let output = json!({
        "capabilities": capabilities,
        "selected_tier": selected.as_ref().ok(),
        "error": selected.as_ref().err().map(ToString::to_string),
        "baseline": base,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    config: SandboxConfig,
    script: String,
    entry: String,
    user: String,
    params: Vec<String>,
    timeout: f64,
) -> Result<()> {
    let mut request = ExecutionRequest::new(script, entry, user).with_timeout(timeout);
    for raw in &params {
        let (name, value) = parse_param(raw)?;
        request = request.with_param(name, value);
    }

    let sandbox = SandboxOrchestrator::builder(config)
        .build()
        .await
        .context("initializing sandbox")?;
    let result = sandbox.run(request).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    sandbox.close().await;
    if !result.success {
        std::process::exit(EXIT_FAILED);
    }
    Ok(())
}

async fn serve_stdio(config: SandboxConfig) -> Result<()> {
    let grace = Duration::from_secs(config.container.teardown_timeout_secs);
    let sandbox = Arc::new(
        SandboxOrchestrator::builder(config)
            .build()
            .await
            .context("initializing sandbox")?,
    );

    let shutdown = CancellationToken::new();
    let on_signal = Arc::clone(&sandbox);
    let stop_serving = shutdown.clone();
    install_signal_handlers(move |reason| {
        let cancelled = on_signal.emergency_stop(reason);
        info!("🛑 Emergency stop cancelled {} execution(s)", cancelled);
        stop_serving.cancel();
    });

    info!("📡 Serving JSON-RPC on stdio (tier {})", sandbox.tier_kind());
    let ctx = Arc::new(ServeContext::new(Arc::clone(&sandbox)));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    if let Err(e) = serve_until(ctx, stdin, tokio::io::stdout(), shutdown.clone()).await {
        error!("💥 Protocol loop failed: {:?}", e);
    }

    info!("🛑 Shutting down Strategy Sandbox...");
    sandbox.shutdown(grace).await;
    info!("✅ Strategy Sandbox shut down gracefully");
    if shutdown.is_cancelled() {
        // The runtime would otherwise wait on stdin's blocking read.
        std::process::exit(0);
    }
    Ok(())
}

/// JSON logs to stderr and a daily rolling file. Stdout carries only
/// command output and protocol responses.
fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let file_appender = tracing_appender::rolling::daily("logs", "strategy-sandbox.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let level_filter = match log_level.to_lowercase().as_str() {
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(EnvFilter::from_default_env().add_directive(level_filter.into()));

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(EnvFilter::from_default_env().add_directive(level_filter.into()));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    // The guard flushes the file writer; it must live as long as the process.
    Box::leak(Box::new(guard));

    Ok(())
}
