use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use tracing::Level;

use crate::poller::DEFAULT_POLL_INTERVAL;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub poll_interval: Duration,
    pub qr_ttl: chrono::Duration,
}

impl Config {
    /// Reads settings from the environment, after loading `.env` if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set to a production Postgres instance")?,
            max_connections: try_load("DATABASE_MAX_CONNECTIONS", 5)?,
            poll_interval: Duration::from_secs(load_positive(
                "POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL.as_secs(),
            )?),
            qr_ttl: chrono::Duration::seconds(load_positive("QR_TTL_SECS", 300)?),
        })
    }
}

/// Log level only, so logging can start before the database is configured.
pub fn log_level() -> Level {
    dotenvy::dotenv().ok();
    try_load("LOG_LEVEL", Level::INFO).unwrap_or(Level::INFO)
}

fn try_load<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} value {raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Like `try_load`, but zero and negative values are rejected.
fn load_positive<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr + PartialOrd + Default + Display,
    T::Err: Display,
{
    let value = try_load(key, default)?;
    if value <= T::default() {
        anyhow::bail!("invalid {key} value {value}: must be greater than zero");
    }
    Ok(value)
}
