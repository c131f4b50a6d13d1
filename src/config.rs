use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use ethers::types::Address;
use serde::Deserialize;
use url::Url;

use crate::ethereum::contract::PLANET_ID_BYTES;
use crate::nine::NcgAmount;
use crate::secret::Secret;

/// Layered configuration: an optional TOML file overridden by
/// `BRIDGE__`-prefixed environment variables
/// (e.g. `BRIDGE__ETHEREUM__PROVIDER`). Missing required keys fail
/// startup.
pub fn load(config_file_path: Option<&Path>) -> anyhow::Result<Config> {
    let mut settings = config::Config::builder();

    if let Some(path) = config_file_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix("BRIDGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    settings
        .try_deserialize::<Config>()
        .context("invalid bridge configuration")
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub nine_chronicles: NineChroniclesConfig,
    pub ethereum: EthereumConfig,
    pub signer: SignerConfig,
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub pager: Option<PagerConfig>,
    #[serde(default)]
    pub chat: Option<ChatConfig>,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NineChroniclesConfig {
    /// GraphQL endpoint of the primary node; all reads and the
    /// unsigned-transaction build go here.
    pub graphql_endpoint: Secret<Url>,

    /// Additional nodes signed transactions are broadcast to, on top of
    /// the primary.
    #[serde(default)]
    pub stage_endpoints: Vec<Secret<Url>>,

    /// Minter of the on-chain NCG currency; part of the currency
    /// description in every transfer action.
    pub ncg_minter: Address,

    #[serde(default = "default::nine_explorer_url")]
    pub explorer_url: Url,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EthereumConfig {
    /// JSON-RPC endpoint.
    pub provider: Secret<Url>,

    /// Address of the wNCG ERC-20 contract.
    pub wncg_address: Address,

    /// Planet id prefix expected in burn recipient tags, hex.
    #[serde(default = "default::planet_id")]
    pub planet_id: String,

    /// Multiplier on the provider gas price, e.g. 1.5 for +50%.
    #[serde(default = "default::gas_tip_ratio")]
    pub gas_tip_ratio: f64,

    /// Hard ceiling on the offered gas price, in GWei.
    #[serde(default = "default::gas_price_cap_gwei")]
    pub gas_price_cap_gwei: f64,

    /// Priority fee offered on fee-market networks, in GWei.
    #[serde(default = "default::priority_fee_gwei")]
    pub priority_fee_gwei: f64,

    /// Timeout for getting a mint transaction into the mempool.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::send_timeout")]
    pub send_timeout: Duration,

    /// Timeout for a mint transaction to be mined.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::mine_timeout")]
    pub mine_timeout: Duration,

    #[serde(default = "default::ethereum_explorer_url")]
    pub explorer_url: Url,
}

impl EthereumConfig {
    pub fn planet_id(&self) -> anyhow::Result<[u8; PLANET_ID_BYTES]> {
        let digits = self.planet_id.trim_start_matches("0x");
        let bytes = hex::decode(digits).context("planet id is not hex")?;
        bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("planet id must be {PLANET_ID_BYTES} bytes"))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SignerConfig {
    /// Base URL of the custodial signing service.
    pub endpoint: Secret<Url>,

    /// Key the service signs with.
    pub key_id: String,

    /// Expected address of that key on both chains. A mismatch with the
    /// service's answer aborts startup.
    pub address: Address,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExchangeConfig {
    /// Smallest deposit that will be exchanged instead of refunded.
    pub minimum_amount: NcgAmount,

    /// Largest amount exchanged per deposit; anything above comes back.
    pub maximum_amount: NcgAmount,

    /// Exchange fee as a ratio, e.g. 0.01 for 1%.
    pub fee_ratio: f64,

    /// Senders whose deposits are rejected outright.
    #[serde(default)]
    pub banned_addresses: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MonitorConfig {
    /// Blocks past a target block before it counts as final.
    #[serde(default = "default::confirmations")]
    pub confirmations: u64,

    /// Pause between polls when a monitor has caught up with the tip.
    #[serde(with = "humantime_serde")]
    #[serde(default = "default::poll_delay")]
    pub poll_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            confirmations: default::confirmations(),
            poll_delay: default::poll_delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    /// SQLite file holding the per-monitor cursors.
    pub cursor_path: PathBuf,

    /// SQLite file holding the exchange history.
    pub history_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PagerConfig {
    pub routing_key: Secret<String>,

    #[serde(default = "default::pager_endpoint")]
    pub endpoint: Url,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatConfig {
    pub webhook_url: Secret<Url>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuditConfig {
    pub endpoint: Secret<Url>,
    pub index: String,
    pub username: String,
    pub password: Secret<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Listen address of the health/metrics endpoint.
    pub address: SocketAddr,
}

mod default {
    use std::time::Duration;
    use url::Url;

    pub fn nine_explorer_url() -> Url {
        Url::parse("https://9cscan.com").unwrap()
    }

    pub fn ethereum_explorer_url() -> Url {
        Url::parse("https://etherscan.io").unwrap()
    }

    pub fn planet_id() -> String {
        "0x100000000001".to_owned()
    }

    pub fn gas_tip_ratio() -> f64 {
        1.0
    }

    pub fn gas_price_cap_gwei() -> f64 {
        300.0
    }

    pub fn priority_fee_gwei() -> f64 {
        1.0
    }

    pub fn send_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn mine_timeout() -> Duration {
        Duration::from_secs(300)
    }

    pub fn confirmations() -> u64 {
        10
    }

    pub fn poll_delay() -> Duration {
        Duration::from_secs(15)
    }

    pub fn pager_endpoint() -> Url {
        Url::parse("https://events.pagerduty.com/v2/enqueue").unwrap()
    }
}
