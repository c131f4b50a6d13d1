//! Client for the Nine Chronicles GraphQL node: chain reads for the
//! deposit monitor and the unsigned-transaction/staging operations used by
//! the transfer path.

use std::time::Duration;

use ethers::types::Address;
use serde_json::{json, Value as Json};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;
use url::Url;

use crate::monitor::{BlockReader, ChainEvent};
use crate::secret::Secret;

pub mod action;
pub mod amount;
pub mod bencodex;
pub mod transfer;

pub use amount::NcgAmount;

/// Per-call budget; transient node failures are retried this many times
/// with doubling backoff before the error surfaces to the caller.
const RPC_ATTEMPTS: u32 = 5;
const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum GraphqlError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("node answered with status {0}")]
    Status(reqwest::StatusCode),

    #[error("node answered with errors: {0}")]
    Response(String),

    #[error("malformed response, missing {0}")]
    MissingField(&'static str),

    #[error("malformed {field}: {message}")]
    Malformed {
        field: &'static str,
        message: String,
    },
}

/// An incoming NCG transfer to the custodial bridge account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NcgTransferredEvent {
    pub tx_id: String,
    pub block_hash: String,
    pub sender: Address,
    pub amount: NcgAmount,
    pub memo: Option<String>,
}

impl ChainEvent for NcgTransferredEvent {
    fn tx_id(&self) -> &str {
        &self.tx_id
    }
}

#[derive(Debug)]
pub struct NineChroniclesClient {
    client: reqwest::Client,
    endpoint: Secret<Url>,
}

impl NineChroniclesClient {
    pub fn new(endpoint: Secret<Url>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(Self { client, endpoint })
    }

    pub async fn tip_index(&self) -> Result<u64, GraphqlError> {
        let data = self
            .execute(
                "tip_index",
                "query { nodeStatus { tip { index } } }",
                json!({}),
            )
            .await?;
        field_u64(&data, "/nodeStatus/tip/index", "tip index")
    }

    pub async fn block_hash(&self, index: u64) -> Result<String, GraphqlError> {
        let data = self
            .execute(
                "block_hash",
                "query($index: ID!) { chainQuery { blockQuery { block(index: $index) { hash } } } }",
                json!({ "index": index }),
            )
            .await?;
        field_string(&data, "/chainQuery/blockQuery/block/hash", "block hash")
    }

    pub async fn block_index(&self, hash: &str) -> Result<Option<u64>, GraphqlError> {
        let data = self
            .execute(
                "block_index",
                "query($hash: ID!) { chainQuery { blockQuery { block(hash: $hash) { index } } } }",
                json!({ "hash": hash }),
            )
            .await?;
        match data.pointer("/chainQuery/blockQuery/block") {
            None | Some(Json::Null) => Ok(None),
            Some(block) => field_u64(block, "/index", "block index").map(Some),
        }
    }

    /// NCG transfers received by `recipient` in the given block.
    pub async fn transfer_events(
        &self,
        block_hash: &str,
        recipient: Address,
    ) -> Result<Vec<NcgTransferredEvent>, GraphqlError> {
        let data = self
            .execute(
                "transfer_events",
                "query($blockHash: ByteString!, $recipient: Address!) { \
                 transferNCGHistories(blockHash: $blockHash, recipient: $recipient) { \
                 blockHash txId sender amount memo } }",
                json!({ "blockHash": block_hash, "recipient": format!("{recipient:?}") }),
            )
            .await?;
        let histories = data
            .pointer("/transferNCGHistories")
            .and_then(Json::as_array)
            .ok_or(GraphqlError::MissingField("transferNCGHistories"))?;
        histories.iter().map(parse_transfer_event).collect()
    }

    /// Asks the node to build an unsigned transaction wrapping the given
    /// base64 plain value for the holder of `public_key`. Returns hex.
    pub async fn unsigned_transaction(
        &self,
        plain_value: &str,
        public_key: &str,
    ) -> Result<String, GraphqlError> {
        let data = self
            .execute(
                "unsigned_transaction",
                "query($publicKey: String!, $plainValue: String!) { \
                 transaction { unsignedTransaction(publicKey: $publicKey, plainValue: $plainValue) } }",
                json!({ "publicKey": public_key, "plainValue": plain_value }),
            )
            .await?;
        field_string(
            &data,
            "/transaction/unsignedTransaction",
            "unsigned transaction",
        )
    }

    /// Folds a detached signature into the unsigned transaction. Returns
    /// the signed transaction as hex.
    pub async fn attach_signature(
        &self,
        unsigned_transaction: &str,
        signature: &str,
    ) -> Result<String, GraphqlError> {
        let data = self
            .execute(
                "attach_signature",
                "query($unsignedTransaction: String!, $signature: String!) { \
                 transaction { signTransaction(unsignedTransaction: $unsignedTransaction, signature: $signature) } }",
                json!({ "unsignedTransaction": unsigned_transaction, "signature": signature }),
            )
            .await?;
        field_string(&data, "/transaction/signTransaction", "signed transaction")
    }

    /// Submits a signed transaction (base64) to this node's mempool.
    pub async fn stage_transaction(&self, payload: &str) -> Result<(), GraphqlError> {
        self.execute(
            "stage_transaction",
            "mutation($payload: String!) { stageTransaction(payload: $payload) }",
            json!({ "payload": payload }),
        )
        .await?;
        Ok(())
    }

    async fn execute(
        &self,
        operation: &'static str,
        query: &'static str,
        variables: Json,
    ) -> Result<Json, GraphqlError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.execute_once(query, &variables).await {
                Ok(data) => return Ok(data),
                Err(error) if attempt < RPC_ATTEMPTS => {
                    warn!(operation, attempt, ?error, "GraphQL call failed, retrying");
                    sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn execute_once(&self, query: &str, variables: &Json) -> Result<Json, GraphqlError> {
        let response = self
            .client
            .post(self.endpoint.url().clone())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GraphqlError::Status(status));
        }
        let body: Json = response.json().await?;
        if let Some(errors) = body.get("errors") {
            if errors.as_array().is_some_and(|list| !list.is_empty()) {
                return Err(GraphqlError::Response(errors.to_string()));
            }
        }
        body.get("data")
            .cloned()
            .ok_or(GraphqlError::MissingField("data"))
    }
}

fn parse_transfer_event(history: &Json) -> Result<NcgTransferredEvent, GraphqlError> {
    let sender = field_string(history, "/sender", "sender")?;
    let sender = sender
        .parse::<Address>()
        .map_err(|error| GraphqlError::Malformed {
            field: "sender",
            message: error.to_string(),
        })?;
    let amount = field_string(history, "/amount", "amount")?;
    let amount = amount
        .parse::<NcgAmount>()
        .map_err(|error| GraphqlError::Malformed {
            field: "amount",
            message: error.to_string(),
        })?;
    let memo = match history.pointer("/memo") {
        None | Some(Json::Null) => None,
        Some(Json::String(memo)) if memo.is_empty() => None,
        Some(Json::String(memo)) => Some(memo.clone()),
        Some(other) => {
            return Err(GraphqlError::Malformed {
                field: "memo",
                message: other.to_string(),
            })
        }
    };
    Ok(NcgTransferredEvent {
        tx_id: field_string(history, "/txId", "txId")?,
        block_hash: field_string(history, "/blockHash", "blockHash")?,
        sender,
        amount,
        memo,
    })
}

fn field_string(data: &Json, pointer: &str, name: &'static str) -> Result<String, GraphqlError> {
    data.pointer(pointer)
        .and_then(Json::as_str)
        .map(str::to_owned)
        .ok_or(GraphqlError::MissingField(name))
}

fn field_u64(data: &Json, pointer: &str, name: &'static str) -> Result<u64, GraphqlError> {
    let value = data
        .pointer(pointer)
        .ok_or(GraphqlError::MissingField(name))?;
    // Explorer schemas answer Long fields as either numbers or strings.
    match value {
        Json::Number(number) => number.as_u64().ok_or(GraphqlError::Malformed {
            field: name,
            message: number.to_string(),
        }),
        Json::String(raw) => raw.parse().map_err(|_| GraphqlError::Malformed {
            field: name,
            message: raw.clone(),
        }),
        other => Err(GraphqlError::Malformed {
            field: name,
            message: other.to_string(),
        }),
    }
}

/// Feeds the generic monitor with confirmed Nine Chronicles blocks and the
/// NCG transfers they carry.
pub struct NineChroniclesReader {
    client: std::sync::Arc<NineChroniclesClient>,
    recipient: Address,
    confirmations: u64,
}

impl NineChroniclesReader {
    pub fn new(
        client: std::sync::Arc<NineChroniclesClient>,
        recipient: Address,
        confirmations: u64,
    ) -> Self {
        Self {
            client,
            recipient,
            confirmations,
        }
    }
}

#[async_trait::async_trait]
impl BlockReader for NineChroniclesReader {
    type Event = NcgTransferredEvent;

    const NAME: &'static str = "nine-chronicles";

    async fn tip_index(&self) -> anyhow::Result<u64> {
        let tip = self.client.tip_index().await?;
        Ok(tip.saturating_sub(self.confirmations))
    }

    async fn block_hash(&self, index: u64) -> anyhow::Result<String> {
        Ok(self.client.block_hash(index).await?)
    }

    async fn block_index(&self, block_hash: &str) -> anyhow::Result<Option<u64>> {
        Ok(self.client.block_index(block_hash).await?)
    }

    async fn events_in(&self, index: u64) -> anyhow::Result<Vec<Self::Event>> {
        let block_hash = self.client.block_hash(index).await?;
        Ok(self
            .client
            .transfer_events(&block_hash, self.recipient)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transfer_history() {
        let history = json!({
            "blockHash": "64f4",
            "txId": "a1b2",
            "sender": "0x2734048eC2892d111b4fbAB224400847544FC872",
            "amount": "150.00",
            "memo": "0x9093dd48ec53Cc80910FFcee2B8fDEE4cDaf9a22",
        });
        let event = parse_transfer_event(&history).unwrap();
        assert_eq!(event.tx_id, "a1b2");
        assert_eq!(event.amount, NcgAmount::from_hundredths(15_000));
        assert_eq!(
            event.memo.as_deref(),
            Some("0x9093dd48ec53Cc80910FFcee2B8fDEE4cDaf9a22")
        );
    }

    #[test]
    fn empty_memo_becomes_none() {
        let history = json!({
            "blockHash": "64f4",
            "txId": "a1b2",
            "sender": "0x2734048eC2892d111b4fbAB224400847544FC872",
            "amount": "1.00",
            "memo": "",
        });
        assert_eq!(parse_transfer_event(&history).unwrap().memo, None);
    }

    #[test]
    fn rejects_unparseable_amount() {
        let history = json!({
            "blockHash": "64f4",
            "txId": "a1b2",
            "sender": "0x2734048eC2892d111b4fbAB224400847544FC872",
            "amount": "1.234",
        });
        assert!(matches!(
            parse_transfer_event(&history),
            Err(GraphqlError::Malformed { field: "amount", .. })
        ));
    }
}
