//! Engine configuration.
//!
//! All knobs are command-line flags with environment overrides
//! (`SLIPSTREAM_*`), validated once at startup; the running engine treats
//! configuration as immutable.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use slipstream_core::{Error, Result};

/// Slipstream — admission-controlled load balancer for inference backends.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Address to listen on.
    #[arg(
        short,
        long,
        default_value = "0.0.0.0:8080",
        env = "SLIPSTREAM_LISTEN_ADDR"
    )]
    pub listen_addr: SocketAddr,

    /// Path of the durable node store document.
    #[arg(
        long,
        default_value = "slipstream-nodes.json",
        env = "SLIPSTREAM_STORE_PATH"
    )]
    pub store_path: PathBuf,

    /// Admissions allowed per client IP per rolling second.
    #[arg(
        long,
        default_value_t = 5,
        env = "SLIPSTREAM_REQUEST_LIMIT_PER_SECOND"
    )]
    pub request_limit_per_second: u32,

    /// How long a request may wait in the admission queue, in seconds.
    #[arg(long, default_value_t = 30, env = "SLIPSTREAM_QUEUE_TIMEOUT_SECONDS")]
    pub queue_timeout_seconds: u64,

    /// Cadence of the health-monitor pass, in seconds.
    #[arg(
        long,
        default_value_t = 5,
        env = "SLIPSTREAM_HEALTH_CHECK_INTERVAL_SECONDS"
    )]
    pub health_check_interval_seconds: u64,

    /// Minimum age of a node's last probe before it is probed again,
    /// in milliseconds.
    #[arg(long, default_value_t = 5000, env = "SLIPSTREAM_PROBE_MIN_AGE_MS")]
    pub probe_min_age_ms: u64,

    /// Timeout of a single health or capacity probe, in seconds.
    #[arg(long, default_value_t = 2, env = "SLIPSTREAM_PROBE_TIMEOUT_SECONDS")]
    pub probe_timeout_seconds: u64,

    /// Timeout of a forwarded completion request, in seconds.
    #[arg(
        long,
        default_value_t = 120,
        env = "SLIPSTREAM_UPSTREAM_TIMEOUT_SECONDS"
    )]
    pub upstream_timeout_seconds: u64,

    /// Whether an accepted probe restores a node's availability.
    #[arg(
        long,
        action = clap::ArgAction::Set,
        default_value_t = true,
        env = "SLIPSTREAM_PROBE_RECOVERY"
    )]
    pub probe_recovery: bool,

    /// Whether selection prefers a client's previously used node.
    #[arg(long, default_value_t = false, env = "SLIPSTREAM_AFFINITY")]
    pub affinity: bool,

    /// Log filter, e.g. `info` or `slipstream_proxy=debug`.
    #[arg(long, default_value = "info", env = "SLIPSTREAM_LOG_LEVEL")]
    pub log_level: String,
}

impl Config {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.request_limit_per_second == 0 {
            return Err(Error::config("request limit must be at least 1 per second"));
        }
        if self.queue_timeout_seconds == 0 {
            return Err(Error::config("queue timeout must be at least 1 second"));
        }
        if self.health_check_interval_seconds == 0 {
            return Err(Error::config(
                "health check interval must be at least 1 second",
            ));
        }
        if self.probe_timeout_seconds == 0 || self.upstream_timeout_seconds == 0 {
            return Err(Error::config("timeouts must be at least 1 second"));
        }
        Ok(())
    }

    /// Queue wait timeout as a duration.
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_seconds)
    }

    /// Health-monitor cadence as a duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    /// Probe timeout as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    /// Forwarded-request timeout as a duration.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().expect("valid default address"),
            store_path: PathBuf::from("slipstream-nodes.json"),
            request_limit_per_second: 5,
            queue_timeout_seconds: 30,
            health_check_interval_seconds: 5,
            probe_min_age_ms: 5000,
            probe_timeout_seconds: 2,
            upstream_timeout_seconds: 120,
            probe_recovery: true,
            affinity: false,
            log_level: "info".to_string(),
        }
    }
}
