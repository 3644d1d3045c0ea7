//! Configuration: environment variables, with an optional TOML file overlay
//! for local development. Environment variables always win, so a
//! container/orchestrator deployment can override a checked-in file.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config key {0} (env var or config file)")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Parser)]
#[command(name = "markerhubd", about = "Real-time spatial event broadcasting service")]
pub struct Cli {
    /// Optional TOML file providing defaults; environment variables still
    /// take precedence over anything set here.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Mirrors `Config` field-for-field but with everything optional, used only
/// to overlay a TOML file underneath the environment.
#[derive(Debug, Default, Deserialize)]
struct FileOverlay {
    listen_port: Option<u16>,
    upstream_events_url: Option<String>,
    pubsub_host: Option<String>,
    pubsub_port: Option<u16>,
    pubsub_password: Option<String>,
    batch_interval_ms: Option<u64>,
    idle_timeout_sec: Option<u64>,
    outbound_queue_cap: Option<usize>,
    hydrate_retries: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub upstream_events_url: String,
    pub pubsub_host: String,
    pub pubsub_port: u16,
    pub pubsub_password: Option<String>,
    pub batch_interval: Duration,
    pub idle_timeout: Duration,
    pub outbound_queue_cap: usize,
    pub hydrate_retries: u32,
}

impl Config {
    pub fn from_env_with_overlay(cli: &Cli) -> Result<Self, ConfigError> {
        let overlay = match &cli.config {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::ParseFile {
                    path: path.clone(),
                    source,
                })?
            }
            None => FileOverlay::default(),
        };

        let listen_port = env_or("LISTEN_PORT", overlay.listen_port, 8080)?;
        let upstream_events_url = env_string_or(
            "UPSTREAM_EVENTS_URL",
            overlay.upstream_events_url,
            "UPSTREAM_EVENTS_URL",
        )?;
        let pubsub_host = env::var("PUBSUB_HOST")
            .ok()
            .or(overlay.pubsub_host)
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let pubsub_port = env_or("PUBSUB_PORT", overlay.pubsub_port, 6379)?;
        let pubsub_password = env::var("PUBSUB_PASSWORD").ok().or(overlay.pubsub_password);
        let batch_interval_ms = env_or("BATCH_INTERVAL_MS", overlay.batch_interval_ms, 50)?;
        let idle_timeout_sec = env_or("IDLE_TIMEOUT_SEC", overlay.idle_timeout_sec, 300)?;
        let outbound_queue_cap = env_or("OUTBOUND_QUEUE_CAP", overlay.outbound_queue_cap, 256)?;
        let hydrate_retries = env_or("HYDRATE_RETRIES", overlay.hydrate_retries, 5)?;

        Ok(Config {
            listen_port,
            upstream_events_url,
            pubsub_host,
            pubsub_port,
            pubsub_password,
            batch_interval: Duration::from_millis(batch_interval_ms),
            idle_timeout: Duration::from_secs(idle_timeout_sec),
            outbound_queue_cap,
            hydrate_retries,
        })
    }
}

fn env_string_or(
    key: &'static str,
    overlay: Option<String>,
    missing_name: &'static str,
) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .or(overlay)
        .ok_or(ConfigError::Missing(missing_name))
}

fn env_or<T>(key: &'static str, overlay: Option<T>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw.clone(),
        }),
        Err(_) => Ok(overlay.unwrap_or(default)),
    }
}
