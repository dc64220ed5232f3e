//! Command-line configuration for the gateway binary
//!
//! Everything that describes providers and queues lives in the gateway file (see
//! [`queuekeeper::gateway`]); the flags here only cover the process itself.
use anyhow::anyhow;
use clap::Parser;
use queuekeeper::client::PoolSettings;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the gateway will listen.
    #[arg(short = 'p', long, default_value_t = 3000)]
    pub port: u16,

    /// The port on which the metrics server will listen.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, default_value_t = true)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, default_value = "queuekeeper")]
    pub metrics_prefix: String,

    /// The gateway file describing providers, models, failover and queues.
    #[arg(short = 'f', long, env = "QUEUEKEEPER_CONFIG")]
    pub config: PathBuf,

    /// Prefix of every key written to the backing store.
    #[arg(long, default_value = "queuekeeper")]
    pub key_prefix: String,

    /// Maximum number of idle HTTP connections to keep alive per provider host.
    #[arg(long, default_value_t = 100)]
    pub pool_max_idle_per_host: usize,

    /// How long (in seconds) to keep idle HTTP connections alive.
    #[arg(long, default_value_t = 90)]
    pub pool_idle_timeout_secs: u64,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if !self.config.exists() {
            return Err(anyhow!(
                "Config file '{}' does not exist",
                self.config.display()
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(anyhow!("Key prefix must not be empty"));
        }
        if self.metrics && self.metrics_port == self.port {
            return Err(anyhow!(
                "Metrics port {} clashes with the gateway port",
                self.metrics_port
            ));
        }
        Ok(self)
    }

    pub fn pool(&self) -> PoolSettings {
        PoolSettings {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}
