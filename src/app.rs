//! Wiring and the run loop: connects every collaborator, verifies the
//! custodial key, then drives the two monitor/observer pairs until a
//! fatal error.

use std::sync::Arc;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ethers::types::{u256_from_f64_saturating, U256};
use futures::{pin_mut, StreamExt};
use tracing::{error, info, instrument};

use crate::config::Config;
use crate::ethereum::gas::{CompositePolicy, GasPricePolicy, LimitPolicy, TipPolicy};
use crate::ethereum::{Ethereum, EthereumReader, MintClient, WncgMinter};
use crate::monitor::{
    BlockReader, ChainEvent, EventEnvelope, HeadlessMonitor, TransactionLocation,
};
use crate::nine::transfer::{NcgTransfer, NineNode, TransferClient};
use crate::nine::{NineChroniclesClient, NineChroniclesReader};
use crate::observer::{BurnEventObserver, EventObserver, ExplorerUrls, NcgTransferObserver};
use crate::policy::ExchangePolicy;
use crate::signer::{public_key_address, RemoteWallet, SignerClient};
use crate::store::{CursorStore, HistoryStore};
use crate::{notify, server};

pub struct App {
    config: Config,
    cursors: Arc<CursorStore>,
    history: Arc<HistoryStore>,
    nine_client: Arc<NineChroniclesClient>,
    ethereum: Ethereum,
    minter: Arc<dyn MintClient>,
    transfer: Arc<dyn TransferClient>,
    chat: Arc<notify::chat::Chat>,
    pager: Arc<notify::pager::Pager>,
    audit: Arc<notify::audit::AuditSink>,
}

impl App {
    #[instrument(name = "App::new", level = "debug", skip_all)]
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pager = Arc::new(match &config.pager {
            Some(pager_config) => notify::pager::Pager::new(pager_config)?,
            None => notify::pager::Pager::disabled(),
        });
        let chat = Arc::new(match &config.chat {
            Some(chat_config) => notify::chat::Chat::new(chat_config.webhook_url.clone())?,
            None => notify::chat::Chat::disabled(),
        });
        let audit = Arc::new(match &config.audit {
            Some(audit_config) => notify::audit::AuditSink::new(audit_config)?,
            None => notify::audit::AuditSink::disabled(),
        });

        let cursors = Arc::new(
            CursorStore::open(&config.store.cursor_path)
                .await
                .context("opening cursor store")?,
        );
        let history = Arc::new(
            HistoryStore::open(&config.store.history_path)
                .await
                .context("opening exchange history store")?,
        );

        // The custodial key must resolve to the configured address before
        // anything is monitored, let alone signed.
        let signer = Arc::new(SignerClient::new(&config.signer)?);
        let public_key = signer
            .public_key()
            .await
            .context("resolving custodial public key")?;
        let custodian = public_key_address(&public_key)?;
        if custodian != config.signer.address {
            anyhow::bail!(
                "custodial key {} resolves to {custodian:?}, configured address is {:?}",
                config.signer.key_id,
                config.signer.address,
            );
        }
        info!(address = ?custodian, "custodial key verified");

        let wallet = RemoteWallet::new(signer.clone(), custodian);
        let ethereum = Ethereum::new(&config.ethereum.provider, wallet).await?;

        let gas_policy = CompositePolicy::new(vec![
            Box::new(TipPolicy::from_ratio(config.ethereum.gas_tip_ratio)?),
            Box::new(LimitPolicy::new(gwei(config.ethereum.gas_price_cap_gwei))),
        ]);
        let minter = Arc::new(WncgMinter::new(
            &ethereum,
            config.ethereum.wncg_address,
            Box::new(gas_policy) as Box<dyn GasPricePolicy>,
            gwei(config.ethereum.priority_fee_gwei),
            config.ethereum.send_timeout,
            config.ethereum.mine_timeout,
        ));

        let nine_client = Arc::new(
            NineChroniclesClient::new(config.nine_chronicles.graphql_endpoint.clone())
                .context("building Nine Chronicles client")?,
        );
        let mut stage_nodes: Vec<Arc<dyn NineNode>> = vec![nine_client.clone()];
        for endpoint in &config.nine_chronicles.stage_endpoints {
            stage_nodes.push(Arc::new(
                NineChroniclesClient::new(endpoint.clone())
                    .context("building stage node client")?,
            ));
        }
        let transfer = Arc::new(NcgTransfer::new(
            nine_client.clone(),
            stage_nodes,
            signer,
            custodian,
            BASE64.encode(&public_key),
            config.nine_chronicles.ncg_minter,
        ));

        Ok(Self {
            config,
            cursors,
            history,
            nine_client,
            ethereum,
            minter,
            transfer,
            chat,
            pager,
            audit,
        })
    }

    /// Runs both monitors until one of them fails fatally.
    pub async fn run(self) -> anyhow::Result<()> {
        let policy = Arc::new(ExchangePolicy::new(&self.config.exchange)?);
        let planet_id = self.config.ethereum.planet_id()?;
        let urls = ExplorerUrls {
            nine_chronicles: self.config.nine_chronicles.explorer_url.clone(),
            ethereum: self.config.ethereum.explorer_url.clone(),
        };
        let custodian = self.config.signer.address;

        let ncg_observer = NcgTransferObserver::new(
            self.history.clone(),
            self.minter.clone(),
            self.transfer.clone(),
            policy,
            self.chat.clone(),
            self.pager.clone(),
            self.audit.clone(),
            urls.clone(),
        );
        let burn_observer = BurnEventObserver::new(
            self.history.clone(),
            self.transfer.clone(),
            planet_id,
            self.chat.clone(),
            self.pager.clone(),
            self.audit.clone(),
            urls,
        );

        let confirmations = self.config.monitor.confirmations;
        let poll_delay = self.config.monitor.poll_delay;

        let nine_reader = Arc::new(NineChroniclesReader::new(
            self.nine_client.clone(),
            custodian,
            confirmations,
        ));
        let ethereum_reader = Arc::new(EthereumReader::new(
            self.ethereum.read(),
            self.config.ethereum.wncg_address,
            confirmations,
        ));

        let nine_cursor = self
            .cursors
            .load(<NineChroniclesReader as BlockReader>::NAME)
            .await?;
        let ethereum_cursor = self
            .cursors
            .load(<EthereumReader as BlockReader>::NAME)
            .await?;

        let nine_monitor =
            HeadlessMonitor::new(nine_reader, nine_cursor, poll_delay, self.pager.clone());
        let ethereum_monitor = HeadlessMonitor::new(
            ethereum_reader,
            ethereum_cursor,
            poll_delay,
            self.pager.clone(),
        );

        if let Some(server_config) = &self.config.server {
            let address = server_config.address;
            tokio::spawn(async move {
                if let Err(server_error) = server::serve(address).await {
                    error!(?server_error, "health server exited");
                }
            });
        }

        info!("bridge started");
        tokio::try_join!(
            Self::drive(nine_monitor, ncg_observer, self.cursors.clone()),
            Self::drive(ethereum_monitor, burn_observer, self.cursors.clone()),
        )?;
        Ok(())
    }

    /// Drains one monitor into its observer, persisting the cursor after
    /// each non-empty envelope. Only fatal monitor and cursor errors
    /// surface; everything else is absorbed upstream.
    async fn drive<R, O>(
        monitor: HeadlessMonitor<R>,
        observer: O,
        cursors: Arc<CursorStore>,
    ) -> anyhow::Result<()>
    where
        R: BlockReader,
        O: EventObserver<R::Event>,
    {
        let stream = monitor.into_stream();
        pin_mut!(stream);
        while let Some(envelope) = stream.next().await {
            let envelope: EventEnvelope<R::Event> = envelope?;
            observer.observe(&envelope).await;
            let Some(last_event) = envelope.events.last() else {
                continue;
            };
            let location = TransactionLocation {
                block_hash: envelope.block_hash.clone(),
                tx_id: last_event.tx_id().to_owned(),
            };
            cursors
                .save(R::NAME, &location)
                .await
                .with_context(|| format!("persisting {} cursor", R::NAME))?;
        }
        anyhow::bail!("{} monitor stream ended", R::NAME)
    }
}

fn gwei(value: f64) -> U256 {
    u256_from_f64_saturating(value * 1e9)
}
