//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults.
//! The config file path comes from the `--config` CLI arg, then the
//! CONFIG_PATH env var, then `key-server.toml` in the working directory.

use key_pool::PoolSettings;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, used when neither CLI nor env names one.
pub const DEFAULT_CONFIG_PATH: &str = "key-server.toml";

/// Upper bound for every duration setting (one year).
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Key pool sizing and timing
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            lifetime_secs: default_lifetime_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            batch_size: self.batch_size,
            lease_duration: Duration::from_secs(self.lease_secs),
            key_lifetime: Duration::from_secs(self.lifetime_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4567))
}

fn default_max_connections() -> usize {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_lease_secs() -> u64 {
    60
}

fn default_lifetime_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    5
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Load from `path` if it exists, otherwise start from built-in defaults.
    ///
    /// Only used for the implicit default path; a file named explicitly by the
    /// operator must exist.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Config::default().finish()
        }
    }

    /// Apply env overrides and validate.
    fn finish(mut self) -> common::Result<Self> {
        if let Ok(addr) = std::env::var("LISTEN_ADDR") {
            self.server.listen_addr = addr.parse().map_err(|e| {
                common::Error::Config(format!("invalid LISTEN_ADDR {addr:?}: {e}"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> common::Result<()> {
        let checks = [
            ("max_connections", self.server.max_connections as u64),
            ("batch_size", self.pool.batch_size as u64),
            ("lease_secs", self.pool.lease_secs),
            ("lifetime_secs", self.pool.lifetime_secs),
            ("sweep_interval_secs", self.pool.sweep_interval_secs),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        let durations = [
            ("lease_secs", self.pool.lease_secs),
            ("lifetime_secs", self.pool.lifetime_secs),
            ("sweep_interval_secs", self.pool.sweep_interval_secs),
        ];
        for (name, value) in durations {
            if value > MAX_DURATION_SECS {
                return Err(common::Error::Config(format!(
                    "{name} must be at most {MAX_DURATION_SECS} seconds, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    ///
    /// Returns the path and whether it was named explicitly.
    pub fn resolve_path(cli_path: Option<&str>) -> (PathBuf, bool) {
        if let Some(p) = cli_path {
            return (PathBuf::from(p), true);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return (PathBuf::from(p), true);
        }
        (PathBuf::from(DEFAULT_CONFIG_PATH), false)
    }
}
