use serde::{Deserialize, Serialize};

use crate::error::{Result, TroupeError};

/// Service configuration, read from the environment at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// 32 bytes, hex- or raw-encoded. Validated here; consumed by the
    /// external credential vault. Never serialized.
    #[serde(skip)]
    pub encryption_key: [u8; 32],
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    #[serde(default = "default_timeout_seconds")]
    pub default_execution_timeout_seconds: u64,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_retention_cron")]
    pub retention_cron: String,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_database_url() -> String {
    "troupe.db".into()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_max_concurrent() -> usize {
    100
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_retention_days() -> u32 {
    30
}

fn default_retention_cron() -> String {
    // sec min hour dom month dow — daily at 02:00.
    "0 0 2 * * *".into()
}

fn default_heartbeat_seconds() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        let encryption_key = parse_encryption_key(
            &std::env::var("ENCRYPTION_KEY")
                .map_err(|_| TroupeError::Config("ENCRYPTION_KEY is required".into()))?,
        )?;

        let config = Self {
            database_url: env_or("DATABASE_URL", default_database_url()),
            bind_addr: env_or("BIND_ADDR", default_bind_addr()),
            encryption_key,
            max_concurrent_executions: env_parsed(
                "MAX_CONCURRENT_EXECUTIONS",
                default_max_concurrent(),
            )?,
            default_execution_timeout_seconds: env_parsed(
                "DEFAULT_EXECUTION_TIMEOUT_SECONDS",
                default_timeout_seconds(),
            )?,
            retention_days: env_parsed("RETENTION_DAYS", default_retention_days())?,
            retention_cron: env_or("RETENTION_CRON", default_retention_cron()),
            heartbeat_seconds: env_parsed("HEARTBEAT_SECONDS", default_heartbeat_seconds())?,
            log_level: env_or("LOG_LEVEL", default_log_level()),
        };
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        if self.max_concurrent_executions == 0 {
            return Err(TroupeError::Config(
                "MAX_CONCURRENT_EXECUTIONS must be at least 1".into(),
            ));
        }
        if self.default_execution_timeout_seconds == 0
            || self.default_execution_timeout_seconds > crate::types::MAX_TIMEOUT_SECONDS
        {
            return Err(TroupeError::Config(format!(
                "DEFAULT_EXECUTION_TIMEOUT_SECONDS must be within 1-{}",
                crate::types::MAX_TIMEOUT_SECONDS
            )));
        }
        if self.retention_days == 0 {
            return Err(TroupeError::Config("RETENTION_DAYS must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_or(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| TroupeError::Config(format!("{name} is not a valid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

/// Accept a 64-char hex string or a raw 32-byte string.
fn parse_encryption_key(raw: &str) -> Result<[u8; 32]> {
    let bytes: Vec<u8> = if raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        (0..raw.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).unwrap_or(0))
            .collect()
    } else {
        raw.as_bytes().to_vec()
    };
    bytes.try_into().map_err(|_| {
        TroupeError::Config("ENCRYPTION_KEY must be exactly 32 bytes (or 64 hex chars)".into())
    })
}
