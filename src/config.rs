//! Configuration for the facilitator server.
//!
//! Loaded from a JSON file (path via `--config` or the `CONFIG` env var,
//! default `config.json`), with host/port falling back to `HOST`/`PORT`
//! environment variables. Malformed configuration aborts startup.

use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::chain::ChainId;
use crate::session::UptoConfig;

/// CLI arguments of the facilitator server.
#[derive(Parser, Debug)]
#[command(name = "x402-facilitator")]
#[command(about = "x402 payment facilitator with upto payment sessions")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "config_defaults::default_port")]
    port: u16,
    #[serde(default = "config_defaults::default_host")]
    host: IpAddr,
    #[serde(default)]
    chains: Vec<Eip155ChainConfig>,
    #[serde(default)]
    upto: UptoConfig,
}

/// Configuration of one EIP-155 chain the facilitator settles on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Eip155ChainConfig {
    /// CAIP-2 identifier, e.g. `eip155:8453`.
    pub chain_id: ChainId,
    pub rpc_url: Url,
    /// Hex-encoded private keys of the gas-paying signers.
    pub signers: Vec<String>,
    #[serde(default = "config_defaults::default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
}

pub mod config_defaults {
    use std::env;
    use std::net::IpAddr;

    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 30;

    /// $PORT env var, then 8080.
    pub fn default_port() -> u16 {
        env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }

    /// $HOST env var, then "0.0.0.0".
    pub fn default_host() -> IpAddr {
        env::var("HOST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(IpAddr::V4(DEFAULT_HOST.parse().expect("valid address literal")))
    }

    pub fn default_receipt_timeout_secs() -> u64 {
        DEFAULT_RECEIPT_TIMEOUT_SECS
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn chains(&self) -> &[Eip155ChainConfig] {
        &self.chains
    }

    pub fn upto(&self) -> &UptoConfig {
        &self.upto
    }

    /// Load configuration from CLI arguments and the JSON file they point
    /// at.
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config.clone(), e))?;
        let content =
            fs::read_to_string(&config_path).map_err(|e| ConfigError::FileRead(config_path, e))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }
}
