//! Observer for wNCG burns: parses the recipient tag, scales the burned
//! base units down to NCG precision and dispatches the native transfer.
//! Burns destroy the wrapped token up front, so nothing can be refunded
//! here; anything unprocessable is recorded and paged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ethers::types::Address;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use super::{EventObserver, ExplorerUrls};
use crate::ethereum::contract::{parse_recipient_tag, BurnEvent, PLANET_ID_BYTES};
use crate::monitor::EventEnvelope;
use crate::nine::transfer::TransferClient;
use crate::nine::NcgAmount;
use crate::notify::audit::AuditSink;
use crate::notify::chat::Chat;
use crate::notify::pager::{Pager, Severity};
use crate::store::{HistoryRecord, HistoryStore, Network, RecordKind, RecordStatus};

pub struct BurnEventObserver {
    history: Arc<HistoryStore>,
    transfer: Arc<dyn TransferClient>,
    planet_id: [u8; PLANET_ID_BYTES],
    chat: Arc<Chat>,
    pager: Arc<Pager>,
    audit: Arc<AuditSink>,
    urls: ExplorerUrls,
}

#[async_trait]
impl EventObserver<BurnEvent> for BurnEventObserver {
    async fn observe(&self, envelope: &EventEnvelope<BurnEvent>) {
        for event in &envelope.events {
            self.process(event).await;
        }
    }
}

impl BurnEventObserver {
    pub fn new(
        history: Arc<HistoryStore>,
        transfer: Arc<dyn TransferClient>,
        planet_id: [u8; PLANET_ID_BYTES],
        chat: Arc<Chat>,
        pager: Arc<Pager>,
        audit: Arc<AuditSink>,
        urls: ExplorerUrls,
    ) -> Self {
        Self {
            history,
            transfer,
            planet_id,
            chat,
            pager,
            audit,
            urls,
        }
    }

    #[instrument(
        level = "info",
        skip(self, event),
        fields(tx_id = %event.tx_id, log_index = event.log_index)
    )]
    async fn process(&self, event: &BurnEvent) {
        match self
            .history
            .exists(Network::Ethereum, &event.tx_id, event.log_index)
            .await
        {
            Ok(true) => {
                debug!("burn already processed, skipping");
                return;
            }
            Ok(false) => {}
            Err(error) => {
                error!(?error, "could not consult exchange history");
                self.pager
                    .page(
                        Severity::Critical,
                        "exchange history unavailable, burn skipped",
                        json!({ "tx_id": event.tx_id, "log_index": event.log_index }),
                    )
                    .await;
                return;
            }
        }

        let recipient = match parse_recipient_tag(&event.to, &self.planet_id) {
            Ok(recipient) => recipient,
            Err(tag_error) => {
                warn!(?tag_error, to = %hex::encode(event.to), "unparseable recipient tag");
                self.reject(event, None, &tag_error.to_string()).await;
                return;
            }
        };

        let amount = match NcgAmount::from_wei_floor(event.amount) {
            Some(amount) if !amount.is_zero() => amount,
            Some(_) => {
                warn!(burned = %event.amount, "burned amount rounds down to nothing");
                self.reject(event, Some(recipient), "amount rounds down to zero")
                    .await;
                return;
            }
            None => {
                warn!(burned = %event.amount, "burned amount exceeds the NCG range");
                self.reject(event, Some(recipient), "amount out of range")
                    .await;
                return;
            }
        };

        let record = HistoryRecord {
            network: Network::Ethereum,
            tx_id: event.tx_id.clone(),
            log_index: event.log_index,
            kind: RecordKind::Exchange,
            sender: format!("{:?}", event.sender),
            recipient: format!("{recipient:?}"),
            requested: amount.to_string(),
            sent: amount.to_string(),
            requested_base_units: Some(event.amount.to_string()),
            status: RecordStatus::Emitted,
        };
        if let Err(error) = self.history.insert(&record).await {
            error!(?error, "could not record burn, skipping emission");
            self.pager
                .page(
                    Severity::Critical,
                    "exchange history write failed, burn skipped",
                    json!({ "tx_id": event.tx_id, "log_index": event.log_index }),
                )
                .await;
            return;
        }

        match self
            .transfer
            .transfer(recipient, amount, Some(&event.tx_id))
            .await
        {
            Ok(transfer_tx) => {
                if let Err(error) = self
                    .history
                    .attach_counter_tx(
                        Network::Ethereum,
                        &event.tx_id,
                        event.log_index,
                        RecordKind::Exchange,
                        &transfer_tx,
                    )
                    .await
                {
                    error!(?error, transfer_tx, "could not attach transfer to history");
                }
                info!(transfer_tx, %amount, "NCG transferred for burn");
                self.chat
                    .send(&format!(
                        "{amount} NCG transferred for a wNCG burn.\n- burn: {}\n- transfer: {}",
                        self.urls.ethereum_tx(&event.tx_id),
                        self.urls.nine_chronicles_tx(&transfer_tx),
                    ))
                    .await;
                self.audit
                    .index_document(json!({
                        "kind": "unwrap",
                        "source_network": Network::Ethereum.as_str(),
                        "source_tx_id": event.tx_id,
                        "log_index": event.log_index,
                        "destination_tx_id": transfer_tx,
                        "sender": format!("{:?}", event.sender),
                        "recipient": format!("{recipient:?}"),
                        "requested": amount.to_string(),
                        "sent": amount.to_string(),
                        "burned_base_units": event.amount.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }))
                    .await;
            }
            Err(error) => {
                // The wrapped token is already burned; the recipient is
                // owed NCG until an operator steps in.
                error!(?error, "NCG transfer failed after history record");
                self.pager
                    .page(
                        Severity::Critical,
                        "NCG transfer for burn failed, recipient unpaid",
                        json!({
                            "tx_id": event.tx_id,
                            "log_index": event.log_index,
                            "recipient": format!("{recipient:?}"),
                            "amount": amount.to_string(),
                            "error": error.to_string(),
                        }),
                    )
                    .await;
            }
        }
    }

    /// Terminal rejection; the burn is unrecoverable, so the record and
    /// the page are all that happens.
    async fn reject(&self, event: &BurnEvent, recipient: Option<Address>, reason: &str) {
        let record = HistoryRecord {
            network: Network::Ethereum,
            tx_id: event.tx_id.clone(),
            log_index: event.log_index,
            kind: RecordKind::Exchange,
            sender: format!("{:?}", event.sender),
            recipient: recipient
                .map(|recipient| format!("{recipient:?}"))
                .unwrap_or_else(|| hex::encode(event.to)),
            requested: NcgAmount::from_wei_floor(event.amount)
                .unwrap_or(NcgAmount::ZERO)
                .to_string(),
            sent: NcgAmount::ZERO.to_string(),
            requested_base_units: Some(event.amount.to_string()),
            status: RecordStatus::Rejected,
        };
        if let Err(error) = self.history.insert(&record).await {
            error!(?error, "could not record rejected burn");
        }
        self.pager
            .page(
                Severity::Error,
                "wNCG burn rejected, no NCG transferred",
                json!({
                    "tx_id": event.tx_id,
                    "log_index": event.log_index,
                    "burned": event.amount.to_string(),
                    "reason": reason,
                }),
            )
            .await;
        self.chat
            .send(&format!(
                "wNCG burn rejected ({reason}), no NCG transferred.\n- burn: {}",
                self.urls.ethereum_tx(&event.tx_id),
            ))
            .await;
    }
}
