use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the relay.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Statsd ingest listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Downstream collector forwarding configuration.
    #[serde(default)]
    pub downstream: DownstreamConfig,

    /// Adaptive sampler configuration.
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Zero-value elision configuration.
    #[serde(default)]
    pub elide: ElideConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Statsd ingest listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// UDP listen address. Default: "127.0.0.1:8125".
    #[serde(default = "default_bind")]
    pub udp_bind: String,

    /// TCP listen address. Default: "127.0.0.1:8125".
    #[serde(default = "default_bind")]
    pub tcp_bind: String,

    /// Per-connection TCP read buffer in bytes. Default: 8192.
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,

    /// Ingest line channel capacity. Default: 65536.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// TCP read timeout. Default: 62s.
    #[serde(default = "default_tcp_read_timeout", with = "humantime_serde")]
    pub tcp_read_timeout: Duration,
}

/// Downstream collector forwarding configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamConfig {
    /// UDP address of the downstream collector (host:port).
    #[serde(default)]
    pub endpoint: String,

    /// Maximum time a packed line waits before the datagram is sent.
    /// Default: 1s.
    #[serde(default = "default_forward_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Adaptive sampler configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Observations per window above which a key starts sampling.
    /// Negative values are rejected. Default: 100.
    #[serde(default = "default_threshold")]
    pub threshold: i64,

    /// Sampling window: time between flushes. Default: 10s.
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    /// Maximum number of distinct keys tracked; new keys beyond the limit
    /// are flagged. Default: 10000.
    #[serde(default = "default_cardinality")]
    pub cardinality: usize,

    /// Timer reservoir allocation per key; must be at least the
    /// threshold. Default: 100.
    #[serde(default = "default_reservoir_size")]
    pub reservoir_size: usize,

    /// Emit the window min/max of sampled timers at flush. Default: false.
    #[serde(default)]
    pub timer_flush_min_max: bool,

    /// Seconds between bucket expiry passes; -1 disables. Default: 120.
    #[serde(default = "default_expiry_frequency")]
    pub expiry_frequency: i64,

    /// Seconds an idle bucket survives; -1 disables expiry. Default: 300.
    #[serde(default = "default_bucket_ttl")]
    pub ttl: i64,
}

/// Zero-value elision configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ElideConfig {
    /// Forward one zero report out of every `skip`. Default: 10.
    #[serde(default = "default_skip")]
    pub skip: u64,

    /// Seconds between elision GC passes; -1 disables. Default: 60.
    #[serde(default = "default_gc_frequency")]
    pub gc_frequency: i64,

    /// Seconds an untouched elision entry survives. Default: 3600.
    #[serde(default = "default_elide_ttl")]
    pub ttl: u64,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: "127.0.0.1:9102". Empty disables the
    /// server.
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:8125".to_string()
}

fn default_read_buffer() -> usize {
    8192
}

fn default_channel_capacity() -> usize {
    65536
}

fn default_tcp_read_timeout() -> Duration {
    Duration::from_secs(62)
}

fn default_forward_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_threshold() -> i64 {
    100
}

fn default_window() -> Duration {
    Duration::from_secs(10)
}

fn default_cardinality() -> usize {
    10000
}

fn default_reservoir_size() -> usize {
    100
}

fn default_expiry_frequency() -> i64 {
    120
}

fn default_bucket_ttl() -> i64 {
    300
}

fn default_skip() -> u64 {
    10
}

fn default_gc_frequency() -> i64 {
    60
}

fn default_elide_ttl() -> u64 {
    3600
}

fn default_health_addr() -> String {
    "127.0.0.1:9102".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            downstream: DownstreamConfig::default(),
            sampler: SamplerConfig::default(),
            elide: ElideConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_bind: default_bind(),
            tcp_bind: default_bind(),
            read_buffer: default_read_buffer(),
            channel_capacity: default_channel_capacity(),
            tcp_read_timeout: default_tcp_read_timeout(),
        }
    }
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            flush_interval: default_forward_interval(),
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            window: default_window(),
            cardinality: default_cardinality(),
            reservoir_size: default_reservoir_size(),
            timer_flush_min_max: false,
            expiry_frequency: default_expiry_frequency(),
            ttl: default_bucket_ttl(),
        }
    }
}

impl Default for ElideConfig {
    fn default() -> Self {
        Self {
            skip: default_skip(),
            gc_frequency: default_gc_frequency(),
            ttl: default_elide_ttl(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.downstream.endpoint.is_empty() {
            bail!("downstream.endpoint is required");
        }

        if self.server.udp_bind.is_empty() && self.server.tcp_bind.is_empty() {
            bail!("at least one of server.udp_bind / server.tcp_bind is required");
        }

        if self.server.channel_capacity == 0 {
            bail!("server.channel_capacity must be positive");
        }

        if self.sampler.threshold < 0 {
            bail!("sampler.threshold must be non-negative");
        }

        if self.sampler.reservoir_size < self.sampler.threshold as usize {
            bail!("sampler.reservoir_size must be at least sampler.threshold");
        }

        if self.sampler.cardinality == 0 {
            bail!("sampler.cardinality must be positive");
        }

        if self.sampler.window.as_secs() == 0 {
            bail!("sampler.window must be at least one second");
        }

        if self.elide.skip == 0 {
            bail!("elide.skip must be positive");
        }

        Ok(())
    }
}
