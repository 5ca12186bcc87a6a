//! Bootstrap configuration: CLI flags, enabled networks, data directory.
//!
//! The reference daemon reads a TOML config file merged with CLI overrides; this service keeps
//! the same "file folder + flags" shape but, per spec §6.5, everything that matters is a flag.

use crate::networks::NetworkId;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "watchtower", about = "Bitcoin vault watchtower")]
struct Cli {
    /// Port to bind the HTTP registration/ack surface to. 0 means pick a random free port.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Folder holding per-network SQLite files (created if missing). Defaults to this OS's
    /// standard data directory.
    #[arg(long)]
    db_folder: Option<PathBuf>,

    #[arg(long)]
    disable_bitcoin: bool,

    #[arg(long)]
    disable_testnet: bool,

    #[arg(long)]
    disable_tape: bool,

    /// Enable regtest monitoring against the given Esplora-compatible base URL.
    #[arg(long)]
    enable_regtest: Option<String>,

    /// Require commitment authorization at registration time (spec §4.2).
    #[arg(long)]
    with_commitments: bool,

    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no network is enabled: pass at least one of bitcoin/testnet/tape, or --enable-regtest <url>")]
    NoNetworkEnabled,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_folder: PathBuf,
    pub enabled_networks: Vec<NetworkId>,
    pub regtest_url: Option<String>,
    pub with_commitments: bool,
    pub log_level: log::LevelFilter,
}

/// The OS's standard data directory, joined with our own subfolder name, used when
/// `--db-folder` isn't given. Falls back to `./watchtower` if the OS data dir can't be found
/// (e.g. `$HOME` unset).
fn default_db_folder() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("watchtower"))
        .unwrap_or_else(|| PathBuf::from("./watchtower"))
}

impl Config {
    pub fn from_args() -> Result<Self, ConfigError> {
        Self::from_cli(Cli::parse())
    }

    fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let mut enabled_networks = Vec::new();
        if !cli.disable_bitcoin {
            enabled_networks.push(NetworkId::Bitcoin);
        }
        if !cli.disable_testnet {
            enabled_networks.push(NetworkId::Testnet);
        }
        if !cli.disable_tape {
            enabled_networks.push(NetworkId::Tape);
        }
        if cli.enable_regtest.is_some() {
            enabled_networks.push(NetworkId::Regtest);
        }

        if enabled_networks.is_empty() {
            return Err(ConfigError::NoNetworkEnabled);
        }

        Ok(Config {
            port: cli.port,
            db_folder: cli.db_folder.unwrap_or_else(default_db_folder),
            enabled_networks,
            regtest_url: cli.enable_regtest,
            with_commitments: cli.with_commitments,
            log_level: cli.log_level,
        })
    }

    /// Base URL for the chain client of a given network: the compiled-in default, or the
    /// operator-supplied regtest URL.
    pub fn base_url(&self, network: NetworkId) -> Option<String> {
        match network {
            NetworkId::Regtest => self.regtest_url.clone(),
            other => other.default_base_url().map(str::to_string),
        }
    }
}
