//! Process configuration: CLI arguments with environment fallbacks, resolved
//! once at startup into an immutable [`Config`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::chain::ScriptHash;
use crate::invoke::RelayPolicy;

const DEFAULT_API_PORT: u16 = 8090;
const DEFAULT_GAS_ASSET: &str = "NEOGas";
const DEFAULT_TRANSFER_ASSET: &str = "neo";
const CONFIRM_POLL_PERIOD: Duration = Duration::from_secs(5);
const CONFIRM_MAX_AGE: Duration = Duration::from_secs(120);
const FAILED_HISTORY_LIMIT: usize = 64;

#[derive(Debug, Parser)]
#[command(name = "idchain-gateway", version)]
pub struct ConfigArgs {
    /// Script hash of the identity contract, 40 hex chars.
    #[arg(long, env = "IDCHAIN_CONTRACT_HASH")]
    pub contract: String,

    /// Path to the operator wallet file.
    #[arg(long, env = "IDCHAIN_WALLET_FILE")]
    pub wallet_file: PathBuf,

    #[arg(long, env = "IDCHAIN_WALLET_PWD", hide_env_values = true)]
    pub wallet_pwd: String,

    /// JSON-RPC endpoint of the wallet-enabled chain node.
    #[arg(long, env = "IDCHAIN_NODE_RPC")]
    pub node_rpc: String,

    /// Base URL of the node's notification REST plugin. Without it the
    /// gateway cannot observe committed contract events.
    #[arg(long, env = "IDCHAIN_NOTIFICATIONS_URL")]
    pub notifications_url: Option<String>,

    #[arg(long, env = "IDCHAIN_API_ADDRESS")]
    pub api_address: Option<IpAddr>,

    #[arg(long, env = "IDCHAIN_API_PORT")]
    pub api_port: Option<u16>,

    /// Bearer token every API request must present.
    #[arg(long, env = "IDCHAIN_API_AUTH_TOKEN", hide_env_values = true)]
    pub api_auth_token: String,

    /// Name of the asset whose balance gates committing invocations.
    #[arg(long, env = "IDCHAIN_GAS_ASSET")]
    pub gas_asset: Option<String>,

    /// Asset used for relayed transfers and order payments.
    #[arg(long, env = "IDCHAIN_TRANSFER_ASSET")]
    pub transfer_asset: Option<String>,

    /// Also act on contract events surfaced by dry runs. Costs real funds on
    /// every dry run of a transfer-emitting method; test networks only.
    #[arg(long, env = "IDCHAIN_RELAY_DRY_RUNS")]
    pub relay_dry_runs: bool,

    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<tracing::level_filters::LevelFilter>,
}

impl ConfigArgs {
    pub fn build(self) -> anyhow::Result<Config> {
        let contract: ScriptHash = self
            .contract
            .parse()
            .with_context(|| format!("invalid contract hash: {}", self.contract))?;
        let address = self
            .api_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = self.api_port.unwrap_or(DEFAULT_API_PORT);
        Ok(Config {
            contract,
            wallet_path: self.wallet_file,
            wallet_passphrase: self.wallet_pwd,
            node_rpc_url: self.node_rpc,
            notifications_url: self.notifications_url,
            socket: SocketAddr::new(address, port),
            auth_token: self.api_auth_token,
            gas_asset: self.gas_asset.unwrap_or_else(|| DEFAULT_GAS_ASSET.into()),
            transfer_asset: self
                .transfer_asset
                .unwrap_or_else(|| DEFAULT_TRANSFER_ASSET.into()),
            relay_dry_runs: self.relay_dry_runs,
            confirm_poll_period: CONFIRM_POLL_PERIOD,
            confirm_max_age: CONFIRM_MAX_AGE,
            failed_history_limit: FAILED_HISTORY_LIMIT,
            log_level: self.log_level,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub contract: ScriptHash,
    pub wallet_path: PathBuf,
    pub wallet_passphrase: String,
    pub node_rpc_url: String,
    pub notifications_url: Option<String>,
    pub socket: SocketAddr,
    pub auth_token: String,
    pub gas_asset: String,
    pub transfer_asset: String,
    pub relay_dry_runs: bool,
    pub confirm_poll_period: Duration,
    pub confirm_max_age: Duration,
    pub failed_history_limit: usize,
    pub log_level: Option<tracing::level_filters::LevelFilter>,
}

impl Config {
    pub fn relay_policy(&self) -> RelayPolicy {
        if self.relay_dry_runs {
            RelayPolicy::IncludeDryRuns
        } else {
            RelayPolicy::CommittedOnly
        }
    }
}

pub fn set_logger(level: Option<tracing::level_filters::LevelFilter>) {
    static LOGGER_SET: AtomicBool = AtomicBool::new(false);
    if LOGGER_SET
        .compare_exchange(
            false,
            true,
            std::sync::atomic::Ordering::Release,
            std::sync::atomic::Ordering::SeqCst,
        )
        .is_err()
    {
        return;
    }

    let default = level.unwrap_or(tracing::level_filters::LevelFilter::INFO);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
