use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::sink::buffer::{DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_EVENTS};

const DEFAULT_SINK_ADDRESS: &str = "localhost:9090";
const DEFAULT_BPF_OBJECT: &str = "/app/traffic_pump.o";
const DEFAULT_LISTEN_ADDRESS: &str = ":9090";
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_BACKOFF: Duration = Duration::from_millis(100);
const HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

/// Largest accepted `BATCH_SIZE`.
pub const MAX_BATCH_SIZE: usize = 100_000;
/// Largest accepted value for any of the duration settings.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Pump configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity attached to every event (`NODE_ID`, default: host name).
    pub node_id: String,
    /// Sink gRPC address (`SINK_ADDRESS`).
    pub sink_address: String,
    /// Compiled BPF object (`BPF_OBJECT`).
    pub bpf_object: PathBuf,
    /// Count flush threshold (`BATCH_SIZE`).
    pub batch_size: usize,
    /// Time flush interval (`FLUSH_INTERVAL`).
    pub flush_interval: Duration,
    /// Bound on sending a batch and receiving its ack (`DISPATCH_TIMEOUT`).
    pub dispatch_timeout: Duration,
    /// Sleep after an empty read (`POLL_BACKOFF`).
    pub poll_backoff: Duration,
    /// Prometheus listener (`METRICS_ADDRESS`). Empty disables it.
    pub metrics_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            sink_address: DEFAULT_SINK_ADDRESS.to_string(),
            bpf_object: PathBuf::from(DEFAULT_BPF_OBJECT),
            batch_size: DEFAULT_MAX_EVENTS,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            poll_backoff: DEFAULT_POLL_BACKOFF,
            metrics_address: String::new(),
        }
    }
}

impl Config {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup` and validate. Unset and empty variables fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let batch_size = match get("BATCH_SIZE") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("parsing BATCH_SIZE={raw:?}"))?,
            None => defaults.batch_size,
        };

        let cfg = Self {
            node_id: get("NODE_ID").unwrap_or(defaults.node_id),
            sink_address: get("SINK_ADDRESS").unwrap_or(defaults.sink_address),
            bpf_object: get("BPF_OBJECT")
                .map(PathBuf::from)
                .unwrap_or(defaults.bpf_object),
            batch_size,
            flush_interval: duration_var(&get, "FLUSH_INTERVAL", defaults.flush_interval)?,
            dispatch_timeout: duration_var(&get, "DISPATCH_TIMEOUT", defaults.dispatch_timeout)?,
            poll_backoff: duration_var(&get, "POLL_BACKOFF", defaults.poll_backoff)?,
            metrics_address: get("METRICS_ADDRESS").unwrap_or_default(),
        };

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("NODE_ID must not be empty");
        }

        if self.sink_address.is_empty() {
            bail!("SINK_ADDRESS is required");
        }

        if self.bpf_object.as_os_str().is_empty() {
            bail!("BPF_OBJECT is required");
        }

        if self.batch_size == 0 {
            bail!("BATCH_SIZE must be positive");
        }

        if self.batch_size > MAX_BATCH_SIZE {
            bail!("BATCH_SIZE must not exceed {MAX_BATCH_SIZE}");
        }

        for (name, value) in [
            ("FLUSH_INTERVAL", self.flush_interval),
            ("DISPATCH_TIMEOUT", self.dispatch_timeout),
            ("POLL_BACKOFF", self.poll_backoff),
        ] {
            if value.is_zero() {
                bail!("{name} must be positive");
            }
            if value > MAX_DURATION {
                bail!("{name} must not exceed 24h");
            }
        }

        Ok(())
    }
}

/// Sink configuration.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// gRPC listener (`LISTEN_ADDRESS`); `:port` means all interfaces.
    pub listen_address: String,
    /// Prometheus listener (`SINK_METRICS_ADDRESS`). Empty disables it.
    pub metrics_address: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            metrics_address: String::new(),
        }
    }
}

impl SinkConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through `lookup` and validate. An empty `LISTEN_ADDRESS` is
    /// treated like an unset one and falls back to `:9090`; it is never
    /// passed to the listener as an empty address.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let cfg = Self {
            listen_address: get("LISTEN_ADDRESS")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string()),
            metrics_address: get("SINK_METRICS_ADDRESS").unwrap_or_default(),
        };

        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_address == ":" {
            bail!("LISTEN_ADDRESS needs a port");
        }

        if !self.metrics_address.is_empty() && self.metrics_address == self.listen_address {
            bail!("SINK_METRICS_ADDRESS must differ from LISTEN_ADDRESS");
        }

        Ok(())
    }
}

/// Expands the `:port` shorthand to an all-interfaces bind address.
pub fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn duration_var<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("parsing {key}={raw:?}")),
        None => Ok(default),
    }
}

/// Host name from the kernel, or "unknown".
fn default_node_id() -> String {
    std::fs::read_to_string(HOSTNAME_PATH)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
