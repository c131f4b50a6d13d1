//! Observer for NCG deposits into the custodial account: validates the
//! deposit, takes the exchange fee, mints wNCG on Ethereum and refunds
//! whatever could not be exchanged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::{EventObserver, ExplorerUrls};
use crate::ethereum::MintClient;
use crate::monitor::EventEnvelope;
use crate::nine::transfer::TransferClient;
use crate::nine::{NcgAmount, NcgTransferredEvent};
use crate::notify::audit::AuditSink;
use crate::notify::chat::Chat;
use crate::notify::pager::{Pager, Severity};
use crate::policy::{ClampOutcome, ExchangePolicy};
use crate::store::{HistoryRecord, HistoryStore, Network, RecordKind, RecordStatus};

pub struct NcgTransferObserver {
    history: Arc<HistoryStore>,
    minter: Arc<dyn MintClient>,
    refunder: Arc<dyn TransferClient>,
    policy: Arc<ExchangePolicy>,
    chat: Arc<Chat>,
    pager: Arc<Pager>,
    audit: Arc<AuditSink>,
    urls: ExplorerUrls,
}

#[async_trait]
impl EventObserver<NcgTransferredEvent> for NcgTransferObserver {
    async fn observe(&self, envelope: &EventEnvelope<NcgTransferredEvent>) {
        for event in &envelope.events {
            self.process(event).await;
        }
    }
}

impl NcgTransferObserver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        history: Arc<HistoryStore>,
        minter: Arc<dyn MintClient>,
        refunder: Arc<dyn TransferClient>,
        policy: Arc<ExchangePolicy>,
        chat: Arc<Chat>,
        pager: Arc<Pager>,
        audit: Arc<AuditSink>,
        urls: ExplorerUrls,
    ) -> Self {
        Self {
            history,
            minter,
            refunder,
            policy,
            chat,
            pager,
            audit,
            urls,
        }
    }

    #[instrument(level = "info", skip(self, event), fields(tx_id = %event.tx_id))]
    async fn process(&self, event: &NcgTransferredEvent) {
        match self
            .history
            .exists(Network::NineChronicles, &event.tx_id, 0)
            .await
        {
            Ok(true) => {
                debug!("deposit already processed, skipping");
                return;
            }
            Ok(false) => {}
            Err(error) => {
                // Without the history verdict this deposit cannot be
                // processed exactly once, so it is left for the operator.
                error!(?error, "could not consult exchange history");
                self.pager
                    .page(
                        Severity::Critical,
                        "exchange history unavailable, deposit skipped",
                        json!({ "tx_id": event.tx_id }),
                    )
                    .await;
                return;
            }
        }

        if self.policy.is_banned(&event.sender) {
            warn!(sender = ?event.sender, "deposit from banned address");
            if self
                .record(event, RecordKind::Exchange, None, NcgAmount::ZERO, RecordStatus::Rejected)
                .await
                .is_ok()
            {
                self.chat
                    .send(&format!(
                        "Deposit from banned address {:?} rejected, no refund issued.\n- deposit: {}",
                        event.sender,
                        self.urls.nine_chronicles_tx(&event.tx_id),
                    ))
                    .await;
            }
            return;
        }

        let Some(recipient) = parse_recipient_memo(event.memo.as_deref()) else {
            warn!(memo = ?event.memo, "deposit memo is not an Ethereum address");
            self.reject_and_refund(event, "invalid recipient").await;
            return;
        };

        let (effective, excess) = match self.policy.clamp(event.amount) {
            ClampOutcome::BelowMinimum => {
                warn!(amount = %event.amount, minimum = %self.policy.minimum(), "deposit below minimum");
                self.reject_and_refund(event, "amount below minimum").await;
                return;
            }
            ClampOutcome::Within(amount) => (amount, None),
            ClampOutcome::AboveMaximum { capped, excess } => {
                info!(amount = %event.amount, maximum = %self.policy.maximum(), "deposit above maximum, capping");
                (capped, Some(excess))
            }
        };

        let fee = self.policy.fee(effective);
        let send_amount = effective.saturating_sub(fee);
        if self
            .record(event, RecordKind::Exchange, Some(recipient), send_amount, RecordStatus::Emitted)
            .await
            .is_err()
        {
            return;
        }

        match self.minter.mint(recipient, send_amount.to_wei()).await {
            Ok(receipt) => {
                let mint_tx = format!("{:?}", receipt.tx_hash);
                if let Err(error) = self
                    .history
                    .attach_counter_tx(
                        Network::NineChronicles,
                        &event.tx_id,
                        0,
                        RecordKind::Exchange,
                        &mint_tx,
                    )
                    .await
                {
                    error!(?error, mint_tx, "could not attach mint transaction to history");
                }
                info!(mint_tx, sent = %send_amount, "wNCG minted");
                self.chat
                    .send(&format!(
                        "{send_amount} wNCG minted for a deposit of {} NCG.\n- deposit: {}\n- mint: {}",
                        event.amount,
                        self.urls.nine_chronicles_tx(&event.tx_id),
                        self.urls.ethereum_tx(&mint_tx),
                    ))
                    .await;
                self.audit
                    .index_document(json!({
                        "kind": "wrap",
                        "source_network": Network::NineChronicles.as_str(),
                        "source_tx_id": event.tx_id,
                        "destination_tx_id": mint_tx,
                        "sender": format!("{:?}", event.sender),
                        "recipient": format!("{recipient:?}"),
                        "requested": event.amount.to_string(),
                        "sent": send_amount.to_string(),
                        "fee": fee.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }))
                    .await;
            }
            Err(error) => {
                // The deposit is custodied but nothing was minted; this
                // needs a human, not a blind retry.
                error!(?error, "mint failed after history record");
                self.pager
                    .page(
                        Severity::Critical,
                        "wNCG mint failed, deposit held without mint",
                        json!({
                            "tx_id": event.tx_id,
                            "sender": format!("{:?}", event.sender),
                            "amount": event.amount.to_string(),
                            "error": error.to_string(),
                        }),
                    )
                    .await;
            }
        }

        if let Some(excess) = excess {
            self.refund(event, excess, "exceeds maximum exchangeable amount")
                .await;
        }
    }

    /// Terminal rejection of the whole deposit, returning the full amount.
    async fn reject_and_refund(&self, event: &NcgTransferredEvent, reason: &str) {
        if self
            .record(event, RecordKind::Exchange, None, NcgAmount::ZERO, RecordStatus::Rejected)
            .await
            .is_err()
        {
            return;
        }
        self.chat
            .send(&format!(
                "Deposit of {} NCG rejected ({reason}), refunding.\n- deposit: {}",
                event.amount,
                self.urls.nine_chronicles_tx(&event.tx_id),
            ))
            .await;
        self.refund(event, event.amount, reason).await;
    }

    async fn refund(&self, event: &NcgTransferredEvent, amount: NcgAmount, reason: &str) {
        // Deliberately withheld rather than re-emitted; see the exchange
        // policy on banned senders.
        if self.policy.is_banned(&event.sender) {
            warn!(sender = ?event.sender, %amount, "refund to banned address withheld");
            return;
        }

        let record = HistoryRecord {
            network: Network::NineChronicles,
            tx_id: event.tx_id.clone(),
            log_index: 0,
            kind: RecordKind::Refund,
            sender: format!("{:?}", event.sender),
            recipient: format!("{:?}", event.sender),
            requested: amount.to_string(),
            sent: amount.to_string(),
            requested_base_units: None,
            status: RecordStatus::Refunded,
        };
        if let Err(error) = self.history.insert(&record).await {
            error!(?error, "could not record refund, refund withheld");
            self.pager
                .page(
                    Severity::Critical,
                    "refund could not be recorded, funds held",
                    json!({ "tx_id": event.tx_id, "amount": amount.to_string() }),
                )
                .await;
            return;
        }

        let memo = format!("refund of {} ({reason})", event.tx_id);
        match self.refunder.transfer(event.sender, amount, Some(&memo)).await {
            Ok(refund_tx) => {
                if let Err(error) = self
                    .history
                    .attach_counter_tx(
                        Network::NineChronicles,
                        &event.tx_id,
                        0,
                        RecordKind::Refund,
                        &refund_tx,
                    )
                    .await
                {
                    error!(?error, refund_tx, "could not attach refund transaction to history");
                }
                info!(refund_tx, %amount, "deposit refunded");
                self.chat
                    .send(&format!(
                        "Refunded {amount} NCG to {:?} ({reason}).\n- deposit: {}\n- refund: {}",
                        event.sender,
                        self.urls.nine_chronicles_tx(&event.tx_id),
                        self.urls.nine_chronicles_tx(&refund_tx),
                    ))
                    .await;
                self.audit
                    .index_document(json!({
                        "kind": "refund",
                        "source_network": Network::NineChronicles.as_str(),
                        "source_tx_id": event.tx_id,
                        "destination_tx_id": refund_tx,
                        "sender": format!("{:?}", event.sender),
                        "recipient": format!("{:?}", event.sender),
                        "requested": amount.to_string(),
                        "sent": amount.to_string(),
                        "reason": reason,
                        "timestamp": Utc::now().to_rfc3339(),
                    }))
                    .await;
            }
            Err(error) => {
                error!(?error, %amount, "refund transfer failed");
                self.pager
                    .page(
                        Severity::Error,
                        "NCG refund failed",
                        json!({
                            "tx_id": event.tx_id,
                            "amount": amount.to_string(),
                            "error": error.to_string(),
                        }),
                    )
                    .await;
            }
        }
    }

    /// Writes the principal leg. Failure pages and aborts the event: no
    /// emission may happen without its record.
    async fn record(
        &self,
        event: &NcgTransferredEvent,
        kind: RecordKind,
        recipient: Option<Address>,
        sent: NcgAmount,
        status: RecordStatus,
    ) -> Result<(), ()> {
        let record = HistoryRecord {
            network: Network::NineChronicles,
            tx_id: event.tx_id.clone(),
            log_index: 0,
            kind,
            sender: format!("{:?}", event.sender),
            recipient: recipient
                .map(|recipient| format!("{recipient:?}"))
                .unwrap_or_else(|| event.memo.clone().unwrap_or_default()),
            requested: event.amount.to_string(),
            sent: sent.to_string(),
            requested_base_units: None,
            status,
        };
        if let Err(error) = self.history.insert(&record).await {
            error!(?error, "could not record deposit, skipping emission");
            self.pager
                .page(
                    Severity::Critical,
                    "exchange history write failed, deposit skipped",
                    json!({ "tx_id": event.tx_id }),
                )
                .await;
            return Err(());
        }
        Ok(())
    }
}

/// A deposit memo names the Ethereum recipient: a 20-byte address in hex,
/// `0x`-prefixed or bare.
fn parse_recipient_memo(memo: Option<&str>) -> Option<Address> {
    let memo = memo?.trim();
    let digits = memo.strip_prefix("0x").unwrap_or(memo);
    if digits.len() != 40 {
        return None;
    }
    let bytes = hex::decode(digits).ok()?;
    Some(Address::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeConfig;
    use crate::ethereum::{MintError, MintReceipt};
    use crate::nine::transfer::TransferError;
    use ethers::types::{H256, U256};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use test_case::test_case;

    struct FakeMinter {
        mints: Mutex<Vec<(Address, U256)>>,
        fail: AtomicBool,
    }

    impl FakeMinter {
        fn new() -> Self {
            Self {
                mints: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl MintClient for FakeMinter {
        async fn mint(&self, to: Address, amount: U256) -> Result<MintReceipt, MintError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MintError::SendTimeout);
            }
            self.mints.lock().unwrap().push((to, amount));
            Ok(MintReceipt {
                tx_hash: H256::from([0x11; 32]),
                block_number: Some(1),
                gas_used: None,
            })
        }
    }

    struct FakeTransfer {
        transfers: Mutex<Vec<(Address, NcgAmount, Option<String>)>>,
    }

    impl FakeTransfer {
        fn new() -> Self {
            Self {
                transfers: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TransferClient for FakeTransfer {
        async fn transfer(
            &self,
            recipient: Address,
            amount: NcgAmount,
            memo: Option<&str>,
        ) -> Result<String, TransferError> {
            let mut transfers = self.transfers.lock().unwrap();
            transfers.push((recipient, amount, memo.map(str::to_owned)));
            Ok(format!("ncg-tx-{}", transfers.len()))
        }
    }

    struct Fixture {
        observer: NcgTransferObserver,
        history: Arc<HistoryStore>,
        minter: Arc<FakeMinter>,
        refunder: Arc<FakeTransfer>,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(
            HistoryStore::open(&dir.path().join("history.db"))
                .await
                .unwrap(),
        );
        let minter = Arc::new(FakeMinter::new());
        let refunder = Arc::new(FakeTransfer::new());
        let policy = Arc::new(
            ExchangePolicy::new(&ExchangeConfig {
                minimum_amount: "1.00".parse().unwrap(),
                maximum_amount: "100.00".parse().unwrap(),
                fee_ratio: 0.01,
                banned_addresses: vec![banned_sender()],
            })
            .unwrap(),
        );
        let observer = NcgTransferObserver::new(
            history.clone(),
            minter.clone(),
            refunder.clone(),
            policy,
            Arc::new(Chat::disabled()),
            Arc::new(Pager::disabled()),
            Arc::new(AuditSink::disabled()),
            ExplorerUrls {
                nine_chronicles: "https://9cscan.com".parse().unwrap(),
                ethereum: "https://etherscan.io".parse().unwrap(),
            },
        );
        Fixture {
            observer,
            history,
            minter,
            refunder,
            _dir: dir,
        }
    }

    fn banned_sender() -> Address {
        Address::from([0xba; 20])
    }

    fn recipient() -> Address {
        "0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22".parse().unwrap()
    }

    fn deposit(tx_id: &str, amount: &str, memo: Option<&str>) -> NcgTransferredEvent {
        NcgTransferredEvent {
            tx_id: tx_id.into(),
            block_hash: "b1".into(),
            sender: Address::from([0x01; 20]),
            amount: amount.parse().unwrap(),
            memo: memo.map(str::to_owned),
        }
    }

    fn envelope(events: Vec<NcgTransferredEvent>) -> EventEnvelope<NcgTransferredEvent> {
        EventEnvelope {
            block_hash: "b1".into(),
            events,
        }
    }

    #[test_case(Some("0x9093Dd48EC53cc80910FfcEE2B8fDee4cdaf9a22"), true; "prefixed checksum memo")]
    #[test_case(Some("9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"), true; "bare memo")]
    #[test_case(Some(" 0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22 "), true; "surrounding spaces")]
    #[test_case(Some("0x9093"), false; "too short")]
    #[test_case(Some("helloworldhelloworldhelloworldhelloworld"), false; "not hex")]
    #[test_case(None, false; "missing")]
    fn memo_parsing(memo: Option<&str>, ok: bool) {
        assert_eq!(parse_recipient_memo(memo).is_some(), ok);
    }

    #[tokio::test]
    async fn happy_deposit_mints_amount_minus_fee() {
        let fixture = fixture().await;
        let event = deposit(
            "tx-1",
            "100.00",
            Some("0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"),
        );
        fixture.observer.observe(&envelope(vec![event])).await;

        let mints = fixture.minter.mints.lock().unwrap().clone();
        let sent: NcgAmount = "99.00".parse().unwrap();
        assert_eq!(mints, vec![(recipient(), sent.to_wei())]);
        assert!(fixture
            .history
            .exists(Network::NineChronicles, "tx-1", 0)
            .await
            .unwrap());
        assert!(fixture.refunder.transfers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replayed_deposit_is_not_minted_twice() {
        let fixture = fixture().await;
        let event = deposit(
            "tx-1",
            "10.00",
            Some("0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"),
        );
        fixture
            .observer
            .observe(&envelope(vec![event.clone()]))
            .await;
        fixture.observer.observe(&envelope(vec![event])).await;

        assert_eq!(fixture.minter.mints.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn banned_sender_gets_neither_mint_nor_refund() {
        let fixture = fixture().await;
        let mut event = deposit(
            "tx-ban",
            "10.00",
            Some("0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"),
        );
        event.sender = banned_sender();
        fixture.observer.observe(&envelope(vec![event])).await;

        assert!(fixture.minter.mints.lock().unwrap().is_empty());
        assert!(fixture.refunder.transfers.lock().unwrap().is_empty());
        assert!(fixture
            .history
            .exists(Network::NineChronicles, "tx-ban", 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn invalid_memo_refunds_full_amount() {
        let fixture = fixture().await;
        let event = deposit("tx-memo", "10.00", Some("see you on the other side"));
        fixture.observer.observe(&envelope(vec![event.clone()])).await;

        assert!(fixture.minter.mints.lock().unwrap().is_empty());
        let transfers = fixture.refunder.transfers.lock().unwrap().clone();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].0, event.sender);
        assert_eq!(transfers[0].1, "10.00".parse().unwrap());
        assert!(transfers[0].2.as_deref().unwrap().contains("tx-memo"));
    }

    #[tokio::test]
    async fn below_minimum_refunds_full_amount() {
        let fixture = fixture().await;
        let event = deposit(
            "tx-dust",
            "0.50",
            Some("0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"),
        );
        fixture.observer.observe(&envelope(vec![event])).await;

        assert!(fixture.minter.mints.lock().unwrap().is_empty());
        let transfers = fixture.refunder.transfers.lock().unwrap().clone();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].1, "0.50".parse().unwrap());
    }

    #[tokio::test]
    async fn above_maximum_mints_cap_and_refunds_excess() {
        let fixture = fixture().await;
        let event = deposit(
            "tx-max",
            "150.00",
            Some("0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"),
        );
        fixture.observer.observe(&envelope(vec![event])).await;

        // 100.00 capped, 1% fee => 99.00 minted; 50.00 returned.
        let mints = fixture.minter.mints.lock().unwrap().clone();
        let sent: NcgAmount = "99.00".parse().unwrap();
        assert_eq!(mints, vec![(recipient(), sent.to_wei())]);

        let transfers = fixture.refunder.transfers.lock().unwrap().clone();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].1, "50.00".parse().unwrap());

        // Both legs share the source transaction id.
        assert!(fixture
            .history
            .exists(Network::NineChronicles, "tx-max", 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn failed_mint_keeps_record_and_does_not_retry() {
        let fixture = fixture().await;
        fixture.minter.fail.store(true, Ordering::SeqCst);
        let event = deposit(
            "tx-fail",
            "10.00",
            Some("0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"),
        );
        fixture
            .observer
            .observe(&envelope(vec![event.clone()]))
            .await;

        assert!(fixture
            .history
            .exists(Network::NineChronicles, "tx-fail", 0)
            .await
            .unwrap());

        // A replay after the failure must not attempt a second mint.
        fixture.minter.fail.store(false, Ordering::SeqCst);
        fixture.observer.observe(&envelope(vec![event])).await;
        assert!(fixture.minter.mints.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn intra_block_order_is_preserved() {
        let fixture = fixture().await;
        let first = deposit(
            "tx-a",
            "2.00",
            Some("0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"),
        );
        let second = deposit(
            "tx-b",
            "3.00",
            Some("0x9093dd48ec53cc80910ffcee2b8fdee4cdaf9a22"),
        );
        fixture
            .observer
            .observe(&envelope(vec![first, second]))
            .await;

        let mints = fixture.minter.mints.lock().unwrap().clone();
        let first_sent: NcgAmount = "1.98".parse().unwrap();
        let second_sent: NcgAmount = "2.97".parse().unwrap();
        assert_eq!(
            mints,
            vec![
                (recipient(), first_sent.to_wei()),
                (recipient(), second_sent.to_wei()),
            ]
        );
    }
}
