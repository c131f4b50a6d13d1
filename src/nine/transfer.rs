//! The serialized Nine Chronicles transfer path. Every outgoing NCG
//! transfer and refund goes through one instance of [`NcgTransfer`]: the
//! sender nonce is assigned by the node when the unsigned transaction is
//! built, so concurrent builds would collide. A single mutex spanning
//! build, sign and stage keeps the account consistent.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ethers::types::Address;
use futures::future::join_all;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use super::{action, bencodex, GraphqlError, NcgAmount, NineChroniclesClient};
use crate::signer::{SignerClient, SignerError};

/// Write operations of a Nine Chronicles node, as the transfer path uses
/// them.
#[async_trait]
pub trait NineNode: Send + Sync {
    async fn unsigned_transaction(
        &self,
        plain_value: &str,
        public_key: &str,
    ) -> Result<String, GraphqlError>;

    async fn attach_signature(
        &self,
        unsigned_transaction: &str,
        signature: &str,
    ) -> Result<String, GraphqlError>;

    async fn stage_transaction(&self, payload: &str) -> Result<(), GraphqlError>;
}

#[async_trait]
impl NineNode for NineChroniclesClient {
    async fn unsigned_transaction(
        &self,
        plain_value: &str,
        public_key: &str,
    ) -> Result<String, GraphqlError> {
        NineChroniclesClient::unsigned_transaction(self, plain_value, public_key).await
    }

    async fn attach_signature(
        &self,
        unsigned_transaction: &str,
        signature: &str,
    ) -> Result<String, GraphqlError> {
        NineChroniclesClient::attach_signature(self, unsigned_transaction, signature).await
    }

    async fn stage_transaction(&self, payload: &str) -> Result<(), GraphqlError> {
        NineChroniclesClient::stage_transaction(self, payload).await
    }
}

#[async_trait]
pub trait PayloadSigner: Send + Sync {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SignerError>;
}

#[async_trait]
impl PayloadSigner for SignerClient {
    async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SignerError> {
        SignerClient::sign(self, payload).await
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("node error: {0}")]
    Graphql(#[from] GraphqlError),

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("node answered with invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("every node rejected the staged transaction")]
    StageFailed,
}

/// Counter-chain emission towards Nine Chronicles, shared by both
/// observers. Behind a trait so observers can be exercised against a
/// recording fake.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Transfers `amount` NCG from the custodial account, returning the
    /// transaction id.
    async fn transfer(
        &self,
        recipient: Address,
        amount: NcgAmount,
        memo: Option<&str>,
    ) -> Result<String, TransferError>;
}

pub struct NcgTransfer {
    node: Arc<dyn NineNode>,
    stage_nodes: Vec<Arc<dyn NineNode>>,
    signer: Arc<dyn PayloadSigner>,
    sender: Address,
    public_key: String,
    minter: Address,
    lock: Mutex<()>,
}

impl NcgTransfer {
    /// `stage_nodes` is the full broadcast set, primary included.
    pub fn new(
        node: Arc<dyn NineNode>,
        stage_nodes: Vec<Arc<dyn NineNode>>,
        signer: Arc<dyn PayloadSigner>,
        sender: Address,
        public_key_base64: String,
        minter: Address,
    ) -> Self {
        Self {
            node,
            stage_nodes,
            signer,
            sender,
            public_key: public_key_base64,
            minter,
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TransferClient for NcgTransfer {
    #[instrument(level = "info", skip(self))]
    async fn transfer(
        &self,
        recipient: Address,
        amount: NcgAmount,
        memo: Option<&str>,
    ) -> Result<String, TransferError> {
        let _guard = self.lock.lock().await;

        let plain_value = action::transfer_asset(self.sender, recipient, amount, self.minter, memo);
        let plain_value = BASE64.encode(bencodex::encode(&plain_value));

        let unsigned_hex = self
            .node
            .unsigned_transaction(&plain_value, &self.public_key)
            .await?;
        let unsigned = hex::decode(&unsigned_hex)?;

        let signature = self.signer.sign(&unsigned).await?;

        let signed_hex = self
            .node
            .attach_signature(&unsigned_hex, &hex::encode(signature))
            .await?;
        let signed = hex::decode(&signed_hex)?;

        let tx_id = hex::encode(Sha256::digest(&signed));
        let payload = BASE64.encode(&signed);

        // Staging tolerates partial failure; one accepting node is enough
        // for the transaction to spread.
        let results = join_all(
            self.stage_nodes
                .iter()
                .map(|node| node.stage_transaction(&payload)),
        )
        .await;
        let mut accepted = 0;
        for (endpoint, result) in results.into_iter().enumerate() {
            match result {
                Ok(()) => accepted += 1,
                Err(error) => {
                    warn!(endpoint, tx_id, ?error, "node rejected staged transaction");
                }
            }
        }
        if accepted == 0 {
            return Err(TransferError::StageFailed);
        }
        info!(tx_id, accepted, total = self.stage_nodes.len(), "staged transfer");
        Ok(tx_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    struct FakeNode {
        in_flight_builds: AtomicUsize,
        max_in_flight_builds: AtomicUsize,
        builds: AtomicUsize,
        reject_stage: AtomicBool,
    }

    impl FakeNode {
        fn new() -> Self {
            Self {
                in_flight_builds: AtomicUsize::new(0),
                max_in_flight_builds: AtomicUsize::new(0),
                builds: AtomicUsize::new(0),
                reject_stage: AtomicBool::new(false),
            }
        }

        fn rejecting() -> Self {
            let node = Self::new();
            node.reject_stage.store(true, Ordering::SeqCst);
            node
        }
    }

    #[async_trait]
    impl NineNode for FakeNode {
        async fn unsigned_transaction(
            &self,
            _plain_value: &str,
            _public_key: &str,
        ) -> Result<String, GraphqlError> {
            let concurrent = self.in_flight_builds.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight_builds
                .fetch_max(concurrent, Ordering::SeqCst);
            sleep(Duration::from_millis(5)).await;
            self.in_flight_builds.fetch_sub(1, Ordering::SeqCst);
            let nonce = self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(hex::encode(format!("unsigned-{nonce}")))
        }

        async fn attach_signature(
            &self,
            unsigned_transaction: &str,
            signature: &str,
        ) -> Result<String, GraphqlError> {
            Ok(format!("{unsigned_transaction}{signature}"))
        }

        async fn stage_transaction(&self, _payload: &str) -> Result<(), GraphqlError> {
            if self.reject_stage.load(Ordering::SeqCst) {
                return Err(GraphqlError::Response("staging disabled".into()));
            }
            Ok(())
        }
    }

    struct FakeSigner;

    #[async_trait]
    impl PayloadSigner for FakeSigner {
        async fn sign(&self, _payload: &[u8]) -> Result<Vec<u8>, SignerError> {
            Ok(vec![0xab; 70])
        }
    }

    fn transfer_with(node: Arc<FakeNode>, stage_nodes: Vec<Arc<dyn NineNode>>) -> NcgTransfer {
        NcgTransfer::new(
            node,
            stage_nodes,
            Arc::new(FakeSigner),
            Address::from([0x01; 20]),
            "AtestKey".into(),
            Address::from([0x02; 20]),
        )
    }

    #[tokio::test]
    async fn returns_sha256_of_signed_transaction() {
        let node = Arc::new(FakeNode::new());
        let transfer = transfer_with(node.clone(), vec![node.clone() as Arc<dyn NineNode>]);

        let tx_id = transfer
            .transfer(Address::from([0x03; 20]), "10.00".parse().unwrap(), None)
            .await
            .unwrap();

        let unsigned_hex = hex::encode("unsigned-0");
        let signed_hex = format!("{unsigned_hex}{}", hex::encode(vec![0xab; 70]));
        let signed = hex::decode(signed_hex).unwrap();
        assert_eq!(tx_id, hex::encode(Sha256::digest(&signed)));
    }

    #[tokio::test]
    async fn concurrent_transfers_build_one_at_a_time() {
        let node = Arc::new(FakeNode::new());
        let transfer = Arc::new(transfer_with(
            node.clone(),
            vec![node.clone() as Arc<dyn NineNode>],
        ));

        let mut handles = Vec::new();
        for seat in 0..8u8 {
            let transfer = transfer.clone();
            handles.push(tokio::spawn(async move {
                transfer
                    .transfer(
                        Address::from([seat; 20]),
                        "1.00".parse().unwrap(),
                        None,
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(node.builds.load(Ordering::SeqCst), 8);
        assert_eq!(node.max_in_flight_builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_accepting_node_is_success() {
        let node = Arc::new(FakeNode::new());
        let stage_nodes: Vec<Arc<dyn NineNode>> = vec![
            Arc::new(FakeNode::rejecting()),
            Arc::new(FakeNode::rejecting()),
            node.clone(),
        ];
        let transfer = transfer_with(node, stage_nodes);

        assert!(transfer
            .transfer(Address::from([0x03; 20]), "5.00".parse().unwrap(), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn all_nodes_rejecting_is_stage_failure() {
        let node = Arc::new(FakeNode::new());
        let stage_nodes: Vec<Arc<dyn NineNode>> =
            vec![Arc::new(FakeNode::rejecting()), Arc::new(FakeNode::rejecting())];
        let transfer = transfer_with(node, stage_nodes);

        let result = transfer
            .transfer(Address::from([0x03; 20]), "5.00".parse().unwrap(), None)
            .await;
        assert!(matches!(result, Err(TransferError::StageFailed)));
    }
}
