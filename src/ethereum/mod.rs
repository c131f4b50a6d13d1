//! Ethereum side of the bridge: provider wiring, the confirmed-block
//! reader feeding the burn monitor, and the wNCG minter.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::contract::ContractError;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::signers::Signer;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Filter, H256, U256, U64};
use futures::{try_join, FutureExt};
use once_cell::sync::Lazy;
use prometheus::{exponential_buckets, register_histogram, register_int_counter, Histogram, IntCounter};
use thiserror::Error as ThisError;
use tokio::time::timeout;
use tracing::{info, instrument};
use url::Url;

use crate::monitor::BlockReader;
use crate::secret::Secret;

pub mod contract;
pub mod gas;

pub use contract::{parse_burn_log, parse_recipient_tag, BurnEvent, WrappedNcg};
use contract::BurnFilter;
use ethers::contract::EthEvent;
use gas::GasPricePolicy;

static MINT_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("bridge_mint_count", "Number of mint transactions sent.").unwrap()
});
static MINT_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "bridge_mint_latency_seconds",
        "Mint transaction inclusion latency in seconds.",
        exponential_buckets(0.1, 1.5, 25).unwrap()
    )
    .unwrap()
});

pub type ProviderStack = SignerMiddleware<Provider<Http>, crate::signer::RemoteWallet>;

#[derive(Debug, ThisError)]
pub enum MintError {
    #[error("error reading gas price: {0}")]
    GasPrice(#[source] Box<dyn Error + Send + Sync + 'static>),

    #[error("timeout while sending mint transaction")]
    SendTimeout,

    #[error("error sending mint transaction: {0}")]
    Send(#[source] Box<dyn Error + Send + Sync + 'static>),

    #[error("timeout while waiting for mint confirmation")]
    ConfirmationTimeout,

    #[error("error waiting for mint confirmation: {0}")]
    Confirmation(#[source] ProviderError),

    #[error("mint transaction {0:?} dropped from mempool")]
    Dropped(H256),

    #[error("mint transaction {0:?} reverted")]
    Reverted(H256),
}

#[derive(Debug, Clone)]
pub struct MintReceipt {
    pub tx_hash: H256,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
}

/// The counter-chain emission of the deposit observer. Behind a trait so
/// the observer can be exercised against a recording fake.
#[async_trait]
pub trait MintClient: Send + Sync {
    async fn mint(&self, to: Address, amount: U256) -> Result<MintReceipt, MintError>;
}

/// Connection to the Ethereum provider, probed once at startup for its
/// chain id and fee-market support.
#[derive(Debug, Clone)]
pub struct Ethereum {
    read: Arc<Provider<Http>>,
    write: Arc<ProviderStack>,
    eip1559: bool,
}

impl Ethereum {
    #[instrument(name = "Ethereum::new", level = "debug", skip_all)]
    pub async fn new(
        url: &Secret<Url>,
        wallet: crate::signer::RemoteWallet,
    ) -> anyhow::Result<Self> {
        let provider = Provider::new(Http::new(url.url().clone()));

        let (version, chain_id, eip1559) = try_join!(
            provider.client_version(),
            provider.get_chainid(),
            provider
                .fee_history(1, BlockNumber::Latest, &[])
                .map(|result| Ok(result.is_ok())),
        )?;
        info!(%version, %chain_id, %eip1559, "connected to Ethereum provider");

        let wallet = wallet.with_chain_id(chain_id.as_u64());
        let read = Arc::new(provider.clone());
        let write = Arc::new(SignerMiddleware::new(provider, wallet));
        Ok(Self {
            read,
            write,
            eip1559,
        })
    }

    pub fn read(&self) -> Arc<Provider<Http>> {
        self.read.clone()
    }

    pub fn address(&self) -> Address {
        self.write.signer().address()
    }
}

/// Sends `mint` calls and blocks until they are mined. Gas pricing is the
/// provider's current price run through the configured policy chain, with
/// the priority fee pinned to its floor on fee-market networks.
pub struct WncgMinter {
    contract: WrappedNcg<ProviderStack>,
    provider: Arc<ProviderStack>,
    gas_policy: Box<dyn GasPricePolicy>,
    priority_fee: U256,
    eip1559: bool,
    send_timeout: Duration,
    mine_timeout: Duration,
}

impl WncgMinter {
    pub fn new(
        ethereum: &Ethereum,
        contract_address: Address,
        gas_policy: Box<dyn GasPricePolicy>,
        priority_fee: U256,
        send_timeout: Duration,
        mine_timeout: Duration,
    ) -> Self {
        Self {
            contract: WrappedNcg::new(contract_address, ethereum.write.clone()),
            provider: ethereum.write.clone(),
            gas_policy,
            priority_fee,
            eip1559: ethereum.eip1559,
            send_timeout,
            mine_timeout,
        }
    }
}

#[async_trait]
impl MintClient for WncgMinter {
    #[instrument(level = "info", skip(self))]
    async fn mint(&self, to: Address, amount: U256) -> Result<MintReceipt, MintError> {
        let base = self
            .provider
            .get_gas_price()
            .await
            .map_err(|error| MintError::GasPrice(Box::new(error)))?;
        let price = self.gas_policy.calculate(base);

        let mut call = self.contract.mint(to, amount);
        if self.eip1559 {
            if let TypedTransaction::Eip1559(inner) = &mut call.tx {
                inner.max_fee_per_gas = Some(price);
                inner.max_priority_fee_per_gas = Some(self.priority_fee.min(price));
            }
        } else {
            call = call.legacy();
            call.tx.set_gas_price(price);
        }

        info!(%base, %price, "sending mint transaction");
        MINT_COUNT.inc();
        let timer = MINT_LATENCY.start_timer();

        let pending = timeout(self.send_timeout, call.send())
            .await
            .map_err(|_| MintError::SendTimeout)?
            .map_err(boxed_contract_error)?;
        let tx_hash: H256 = *pending;
        info!(?tx_hash, "mint transaction in mempool");

        let receipt = timeout(self.mine_timeout, pending)
            .await
            .map_err(|_| MintError::ConfirmationTimeout)?
            .map_err(MintError::Confirmation)?
            .ok_or(MintError::Dropped(tx_hash))?;
        timer.observe_duration();

        if receipt.status != Some(U64::from(1_u64)) {
            return Err(MintError::Reverted(tx_hash));
        }
        info!(?tx_hash, block_number = ?receipt.block_number, "mint transaction mined");
        Ok(MintReceipt {
            tx_hash,
            block_number: receipt.block_number.map(|number| number.as_u64()),
            gas_used: receipt.gas_used,
        })
    }
}

fn boxed_contract_error(error: ContractError<ProviderStack>) -> MintError {
    MintError::Send(Box::new(error))
}

/// Feeds the generic monitor with confirmed Ethereum blocks and the wNCG
/// burns they carry.
pub struct EthereumReader {
    provider: Arc<Provider<Http>>,
    contract_address: Address,
    confirmations: u64,
}

impl EthereumReader {
    pub fn new(provider: Arc<Provider<Http>>, contract_address: Address, confirmations: u64) -> Self {
        Self {
            provider,
            contract_address,
            confirmations,
        }
    }
}

#[async_trait]
impl BlockReader for EthereumReader {
    type Event = BurnEvent;

    const NAME: &'static str = "ethereum";

    async fn tip_index(&self) -> anyhow::Result<u64> {
        let tip = self.provider.get_block_number().await?;
        Ok(tip.as_u64().saturating_sub(self.confirmations))
    }

    async fn block_hash(&self, index: u64) -> anyhow::Result<String> {
        let block = self
            .provider
            .get_block(index)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no block at index {index}"))?;
        let hash = block
            .hash
            .ok_or_else(|| anyhow::anyhow!("block {index} carries no hash"))?;
        Ok(format!("{hash:?}"))
    }

    async fn block_index(&self, block_hash: &str) -> anyhow::Result<Option<u64>> {
        let hash: H256 = block_hash.parse()?;
        let Some(block) = self.provider.get_block(hash).await? else {
            return Ok(None);
        };
        Ok(block.number.map(|number| number.as_u64()))
    }

    async fn events_in(&self, index: u64) -> anyhow::Result<Vec<BurnEvent>> {
        let filter = Filter::new()
            .address(self.contract_address)
            .topic0(BurnFilter::signature())
            .from_block(index)
            .to_block(index);
        let logs = self.provider.get_logs(&filter).await?;
        let mut events = logs
            .iter()
            .map(parse_burn_log)
            .collect::<anyhow::Result<Vec<_>>>()?;
        // Intra-block order follows the log index.
        events.sort_by_key(|event| event.log_index);
        Ok(events)
    }
}
