//! Configuration for the relay server and the command-line client.
//!
//! Both read `RELAYDROP_*` environment variables. The client also takes CLI
//! arguments, which take precedence over the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::queue::DEFAULT_MAX_CONCURRENT;
use crate::rate_limit::DEFAULT_RATE_CAP;
use crate::relay::RelayConfig;
use crate::relay_client::RelayClientConfig;
use crate::session_store::DEFAULT_STORAGE_LIMIT;

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 60;

/// Chunked file transfer through a relaydrop relay.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "relaydrop", version, about)]
pub struct Cli {
    /// Relay base URL [env: RELAYDROP_RELAY_URL] [default: http://127.0.0.1:8080]
    #[arg(long, short = 'r', global = true)]
    pub relay_url: Option<String>,

    /// Peer id presented to the relay [env: RELAYDROP_PEER_ID]
    #[arg(long, global = true)]
    pub peer_id: Option<String>,

    /// Concurrent chunk transfers per direction [env: RELAYDROP_MAX_CONCURRENT] [default: 3]
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Client-side rate cap in bytes per second, 0 for none [env: RELAYDROP_RATE_LIMIT_BPS]
    #[arg(long, global = true)]
    pub rate_limit_bps: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the relay's status.
    Status,
    /// Stage a file on the relay for a peer.
    Send {
        file: PathBuf,
        /// Recipient peer id.
        #[arg(long)]
        peer: String,
    },
    /// Download a staged file and verify its digest.
    Fetch {
        /// The sender's session id.
        #[arg(long)]
        session: String,
        #[arg(long)]
        file: String,
        #[arg(long, short = 'o')]
        out: PathBuf,
        /// Expected SHA-256 (hex) printed by `send`.
        #[arg(long)]
        digest: Option<String>,
    },
}

pub struct ClientSettings {
    pub relay_url: String,
    pub peer_id: String,
    pub max_concurrent: usize,
    pub rate_limit_bps: u64,
}

impl ClientSettings {
    pub fn from_cli_and_env(cli: &Cli) -> Self {
        let relay_url = cli
            .relay_url
            .clone()
            .or_else(|| env::var("RELAYDROP_RELAY_URL").ok())
            .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string());

        let peer_id = cli
            .peer_id
            .clone()
            .or_else(|| env::var("RELAYDROP_PEER_ID").ok())
            .unwrap_or_else(|| format!("peer-{:08x}", rand::random::<u32>()));

        let max_concurrent = cli
            .max_concurrent
            .unwrap_or_else(|| env_usize("RELAYDROP_MAX_CONCURRENT", DEFAULT_MAX_CONCURRENT));

        let rate_limit_bps = cli
            .rate_limit_bps
            .unwrap_or_else(|| env_u64("RELAYDROP_RATE_LIMIT_BPS", DEFAULT_RATE_CAP));

        Self {
            relay_url,
            peer_id,
            max_concurrent,
            rate_limit_bps,
        }
    }

    pub fn client_config(&self) -> RelayClientConfig {
        let mut config = RelayClientConfig::new(&self.relay_url, &self.peer_id);
        config.max_concurrent = self.max_concurrent;
        config.rate_limit_bps = self.rate_limit_bps;
        config
    }
}

pub struct RelayServerConfig {
    pub bind_addr: String,
    pub data_dir: Option<PathBuf>,
    pub relay: RelayConfig,
}

impl RelayServerConfig {
    pub fn from_env() -> Self {
        let relay = RelayConfig {
            storage_limit: env_u64("RELAYDROP_STORAGE_LIMIT_BYTES", DEFAULT_STORAGE_LIMIT),
            rate_limit_bps: env_u64("RELAYDROP_RATE_LIMIT_BPS", DEFAULT_RATE_CAP),
            stats_interval: Duration::from_secs(env_u64(
                "RELAYDROP_STATS_INTERVAL_SECS",
                DEFAULT_STATS_INTERVAL_SECS,
            )),
            ..RelayConfig::default()
        };
        Self {
            bind_addr: env::var("RELAYDROP_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string()),
            data_dir: env::var("RELAYDROP_DATA_DIR").ok().map(PathBuf::from),
            relay,
        }
    }
}

fn env_u64(key: &str, default_value: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}

fn env_usize(key: &str, default_value: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fetch_subcommand() {
        let cli = Cli::try_parse_from([
            "relaydrop",
            "--relay-url",
            "http://relay:9000",
            "fetch",
            "--session",
            "session_1_ab",
            "--file",
            "file_1_cd",
            "-o",
            "out.bin",
        ])
        .unwrap();
        let settings = ClientSettings::from_cli_and_env(&cli);
        assert_eq!(settings.relay_url, "http://relay:9000");
        assert!(matches!(
            cli.command,
            Command::Fetch { ref session, digest: None, .. } if session == "session_1_ab"
        ));
    }

    #[test]
    fn cli_overrides_defaults() {
        let cli = Cli::try_parse_from([
            "relaydrop",
            "--peer-id",
            "alice",
            "--max-concurrent",
            "5",
            "--rate-limit-bps",
            "0",
            "status",
        ])
        .unwrap();
        let config = ClientSettings::from_cli_and_env(&cli).client_config();
        assert_eq!(config.peer_id, "alice");
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.rate_limit_bps, 0);
    }

    #[test]
    fn env_parsing_falls_back_on_garbage() {
        assert_eq!(env_u64("RELAYDROP_TEST_UNSET_VARIABLE", 7), 7);
    }
}
