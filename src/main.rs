use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use traffic::agent::{Agent, AgentOptions};
use traffic::config::{Config, SinkConfig};
use traffic::export::health::{HealthMetrics, Role};
use traffic::receiver::{self, TrafficSink};
use traffic::sink::grpc::GrpcDispatcher;

/// Kernel connection-event pump and central aggregation sink.
///
/// Both roles are configured through environment variables.
#[derive(Parser)]
#[command(name = "traffic", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture connection events on this node and ship them to the sink.
    Pump,
    /// Receive and log batches from pumps.
    Sink,
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("traffic {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Command::Pump => {
            let cfg = Config::from_env().context("loading pump configuration")?;
            rt.block_on(run_pump(cfg))
        }
        Command::Sink => {
            let cfg = SinkConfig::from_env().context("loading sink configuration")?;
            rt.block_on(run_sink(cfg))
        }
        Command::Version => Ok(()),
    }
}

/// Cancels the returned token on SIGINT or SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        token.cancel();
    });

    cancel
}

async fn start_metrics(role: Role, addr: &str) -> Result<Arc<HealthMetrics>> {
    let health = Arc::new(HealthMetrics::new(role, addr).context("registering metrics")?);
    if health.is_enabled() {
        health.start().await.context("starting metrics server")?;
    }
    Ok(health)
}

async fn run_pump(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        node_id = %cfg.node_id,
        sink = %cfg.sink_address,
        "starting traffic pump",
    );

    let cancel = shutdown_on_signal();
    let health = start_metrics(Role::Pump, &cfg.metrics_address).await?;

    let source = open_source(&cfg, &health)?;
    let dispatcher = GrpcDispatcher::connect(&cfg.sink_address, cfg.dispatch_timeout).await?;

    let mut agent =
        Agent::new(AgentOptions::from(&cfg), source, dispatcher).with_health(Arc::clone(&health));
    let result = agent.run(cancel).await;

    health.stop();
    result?;
    tracing::info!("traffic pump stopped");

    Ok(())
}

#[cfg(feature = "bpf")]
fn open_source(cfg: &Config, health: &HealthMetrics) -> Result<traffic::tracer::bpf::BpfSource> {
    let source = traffic::tracer::bpf::BpfSource::open(&cfg.bpf_object)?;

    let stats = source.attachment_stats();
    health
        .bpf_programs_attached
        .with_label_values(&["tracepoint"])
        .set(f64::from(stats.tracepoints_attached));
    health
        .bpf_programs_attached
        .with_label_values(&["kprobe"])
        .set(f64::from(stats.kprobes_attached));
    health
        .bpf_programs_failed
        .with_label_values(&["tracepoint"])
        .set(f64::from(stats.tracepoints_failed));
    health
        .bpf_programs_failed
        .with_label_values(&["kprobe"])
        .set(f64::from(stats.kprobes_failed));

    Ok(source)
}

#[cfg(not(feature = "bpf"))]
fn open_source(_cfg: &Config, _health: &HealthMetrics) -> Result<traffic::tracer::ReplaySource> {
    anyhow::bail!("this build has no BPF support (rebuild with --features bpf)")
}

async fn run_sink(cfg: SinkConfig) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        listen = %cfg.listen_address,
        "starting traffic sink",
    );

    let cancel = shutdown_on_signal();
    let health = start_metrics(Role::Sink, &cfg.metrics_address).await?;

    let sink = TrafficSink::new().with_health(Arc::clone(&health));
    let result = receiver::serve(&cfg.listen_address, sink, cancel).await;

    health.stop();

    result
}
