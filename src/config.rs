use std::{fmt::Display, net::SocketAddr, str::FromStr};

use anyhow::{anyhow, Context};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub db_max_connections: u32,
    /// Frames a connection may have queued before it is treated as stalled.
    pub ws_outbox_capacity: usize,
    /// Empty means any origin.
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// Reads the environment, loading `.env` first when present.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;

        Ok(Self {
            database_url,
            bind_addr: parse_or(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 16)?,
            ws_outbox_capacity: parse_or(&lookup, "WS_OUTBOX_CAPACITY", 64)?,
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid {key}={value:?}: {err}")),
        None => Ok(default),
    }
}
