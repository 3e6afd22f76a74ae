use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Access log template used when `[access_log].format` is not set.
pub const DEFAULT_ACCESS_LOG_FORMAT: &str = ":Xip - :userID [:endDate] \":method :url :protocol/:httpVersion\" :statusCode :contentLength \":referer\" \":userAgent\"";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub access_log: AccessLogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Largest accepted request body, in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    /// Upper bound on a single response write. `0` waits forever.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_size: default_max_body_size(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn write_timeout(&self) -> Option<Duration> {
        match self.write_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_max_body_size() -> usize {
    4 * 1024
}
fn default_write_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Rows fetched per round-trip while a cursor is drained.
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            page_size: default_page_size(),
        }
    }
}

fn default_max_connections() -> u32 {
    8
}
fn default_page_size() -> i64 {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccessLogConfig {
    #[serde(default = "default_access_log_format")]
    pub format: String,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            format: default_access_log_format(),
        }
    }
}

fn default_access_log_format() -> String {
    DEFAULT_ACCESS_LOG_FORMAT.to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate server
    if config.server.max_body_size == 0 {
        anyhow::bail!("server.max_body_size must be > 0");
    }
    config
        .server
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("server.bind is not a socket address: {}", config.server.bind))?;

    // Validate index
    if config.index.max_connections == 0 {
        anyhow::bail!("index.max_connections must be > 0");
    }
    if config.index.page_size < 1 {
        anyhow::bail!("index.page_size must be >= 1");
    }

    if config.access_log.format.trim().is_empty() {
        anyhow::bail!("access_log.format must not be empty");
    }

    Ok(())
}
