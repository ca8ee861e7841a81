//! Layered configuration: defaults, then the JSON config file, then
//! environment variables and CLI flags (handled together by clap).

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use lib_common::core::ParticipationMetric;

const DEFAULT_CONFIG_FILE: &str = "consensus_monitor.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Cosmos consensus monitor: pushes live prevote/precommit participation to WebSocket clients", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(short = 'a', long, env = "CONSENSUS_API", help = "Cosmos SDK REST API base URL, e.g. https://api.example.com.")]
    pub api: Option<String>,

    #[clap(short = 'r', long, env = "CONSENSUS_RPC", help = "CometBFT RPC base URL, e.g. https://rpc.example.com.")]
    pub rpc: Option<String>,

    #[clap(short = 'p', long, env = "CONSENSUS_PORT", help = "Port to listen on for WebSocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "CONSENSUS_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CONSENSUS_POLL_INTERVAL_MS", help = "Poll interval in milliseconds.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "CONSENSUS_REQUEST_TIMEOUT_FRACTION", help = "Per-source request timeout as a fraction of the poll interval, in (0, 1].")]
    pub request_timeout_fraction: Option<f64>,

    #[clap(long, env = "CONSENSUS_SEND_TIMEOUT_MS", help = "Milliseconds a client may take to accept a frame before it is dropped.")]
    pub send_timeout_ms: Option<u64>,

    #[clap(long, env = "CONSENSUS_CLIENT_BUFFER", help = "Frames queued per client before it counts as slow.")]
    pub client_buffer: Option<usize>,

    #[clap(long, env = "CONSENSUS_METRIC", help = "Participation metric: voting-power or count.")]
    pub metric: Option<ParticipationMetric>,

    #[clap(long, env = "CONSENSUS_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "CONSENSUS_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("'{key}' must be an http(s) URL, got '{value}'")]
    InvalidUrl { key: &'static str, value: String },

    #[error("'{0}' must be greater than zero")]
    Zero(&'static str),

    #[error("'requestTimeoutFraction' must be in (0, 1], got {0}")]
    InvalidFraction(f64),

    #[error("TLS needs both a certificate and a key path")]
    IncompleteTls,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Certificate and key of the WSS listener.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Validated runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api: String,
    pub rpc: String,
    pub port: u16,
    pub poll_interval: Duration,
    /// Deadline of each upstream source within one cycle.
    pub request_timeout: Duration,
    pub send_timeout: Duration,
    pub client_buffer: usize,
    pub metric: ParticipationMetric,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub tls: Option<TlsPaths>,
    /// The config file that was merged, if any.
    pub config_file: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            api: other.api.or(self.api),
            rpc: other.rpc.or(self.rpc),
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            request_timeout_fraction: other.request_timeout_fraction.or(self.request_timeout_fraction),
            send_timeout_ms: other.send_timeout_ms.or(self.send_timeout_ms),
            client_buffer: other.client_buffer.or(self.client_buffer),
            metric: other.metric.or(self.metric),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9001),
            poll_interval_ms: Some(1000),
            request_timeout_fraction: Some(0.8),
            send_timeout_ms: Some(250),
            client_buffer: Some(16),
            metric: Some(ParticipationMetric::VotingPower),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            ..Default::default()
        }
    }

    /// Validates the merged configuration.
    pub fn resolve(self, config_file: Option<PathBuf>) -> Result<Settings, ConfigError> {
        let api = upstream_url("api", self.api)?;
        let rpc = upstream_url("rpc", self.rpc)?;

        let poll_interval_ms = self.poll_interval_ms.unwrap_or(1000);
        if poll_interval_ms == 0 {
            return Err(ConfigError::Zero("pollIntervalMs"));
        }
        let fraction = self.request_timeout_fraction.unwrap_or(0.8);
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::InvalidFraction(fraction));
        }
        let send_timeout_ms = self.send_timeout_ms.unwrap_or(250);
        if send_timeout_ms == 0 {
            return Err(ConfigError::Zero("sendTimeoutMs"));
        }
        let client_buffer = self.client_buffer.unwrap_or(16);
        if client_buffer == 0 {
            return Err(ConfigError::Zero("clientBuffer"));
        }

        let tls = match (self.tls_cert_path, self.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let poll_interval = Duration::from_millis(poll_interval_ms);
        Ok(Settings {
            api,
            rpc,
            port: self.port.unwrap_or(9001),
            poll_interval,
            request_timeout: poll_interval.mul_f64(fraction),
            send_timeout: Duration::from_millis(send_timeout_ms),
            client_buffer,
            metric: self.metric.unwrap_or_default(),
            log_dir: self.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            tls,
            config_file,
        })
    }
}

fn upstream_url(key: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    let value = value
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))?;
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(ConfigError::InvalidUrl { key, value });
    }
    Ok(value)
}

/// Merges defaults, the config file and `cli` (which already carries the
/// environment) and validates the result.
///
/// `tls_fallback` is used only when no layer configured a TLS path.
pub fn load_from(cli: Config, tls_fallback: Option<TlsPaths>) -> Result<Settings, ConfigError> {
    let explicit = cli.config_path.clone();
    let config_file_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    let mut merged_file = None;

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path).map_err(|source| ConfigError::Read {
            path: config_file_path.clone(),
            source,
        })?;
        let file_config = serde_json::from_str::<Config>(&config_str).map_err(|source| ConfigError::Parse {
            path: config_file_path.clone(),
            source,
        })?;
        current_config = current_config.merge(file_config);
        merged_file = Some(config_file_path);
    } else if explicit.is_some() {
        return Err(ConfigError::Read {
            path: config_file_path,
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }

    let mut merged = current_config.merge(cli);
    if merged.tls_cert_path.is_none() && merged.tls_key_path.is_none() {
        if let Some(fallback) = tls_fallback {
            merged.tls_cert_path = Some(fallback.cert);
            merged.tls_key_path = Some(fallback.key);
        }
    }
    merged.resolve(merged_file)
}

/// The LetsEncrypt pair under `~/.letsencrypt`, if both files exist.
fn letsencrypt_pair() -> Option<TlsPaths> {
    let letsencrypt_dir = dirs::home_dir()?.join(".letsencrypt");
    let cert = letsencrypt_dir.join("fullchain.pem");
    let key = letsencrypt_dir.join("privkey.pem");
    (cert.exists() && key.exists()).then_some(TlsPaths { cert, key })
}

/// Loads `.env`, parses the command line and resolves the settings.
///
/// When no layer configures TLS paths and a LetsEncrypt pair exists under
/// `~/.letsencrypt`, it is used.
pub fn load_config() -> Result<Settings, ConfigError> {
    dotenvy::dotenv().ok();
    load_from(Config::parse(), letsencrypt_pair())
}
