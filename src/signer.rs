//! HTTP facade over the custodial key service. The same secp256k1 key
//! signs on both chains: opaque detached signatures for Nine Chronicles
//! transactions and recoverable digest signatures backing the Ethereum
//! wallet. The service never releases the private key; the bridge verifies
//! at startup that the key's address matches the configured custodian.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::core::k256::PublicKey;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::transaction::eip712::Eip712;
use ethers::types::{Address, Signature, H256, U256};
use ethers::utils::{hash_message, keccak256};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;
use url::Url;

use crate::config::SignerConfig;
use crate::secret::Secret;

const SIGN_ATTEMPTS: u32 = 5;
const SIGN_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("signing service answered with status {status}: {message}")]
    Service { status: StatusCode, message: String },

    #[error("malformed signing service response: {0}")]
    Malformed(String),

    #[error("unsupported public key encoding")]
    PublicKey,

    #[error("could not hash typed data: {0}")]
    TypedData(String),
}

#[derive(Debug, Deserialize)]
struct PublicKeyResponse {
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct DigestSignatureResponse {
    r: String,
    s: String,
    recovery_id: u8,
}

#[derive(Debug)]
pub struct SignerClient {
    client: reqwest::Client,
    endpoint: Secret<Url>,
    key_id: String,
}

impl SignerClient {
    pub fn new(config: &SignerConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(SIGN_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            key_id: config.key_id.clone(),
        })
    }

    /// SEC1-encoded public key of the custodial key.
    pub async fn public_key(&self) -> Result<Vec<u8>, SignerError> {
        let response: PublicKeyResponse = self
            .request("public_key", |client, url| client.get(url))
            .await?;
        hex::decode(response.public_key.trim_start_matches("0x"))
            .map_err(|error| SignerError::Malformed(error.to_string()))
    }

    /// Detached DER signature over the given payload, as the Nine
    /// Chronicles node expects it alongside the unsigned transaction.
    pub async fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, SignerError> {
        let body = serde_json::json!({ "payload": hex::encode(payload) });
        let response: SignResponse = self
            .request("sign", |client, url| client.post(url).json(&body))
            .await?;
        hex::decode(response.signature.trim_start_matches("0x"))
            .map_err(|error| SignerError::Malformed(error.to_string()))
    }

    /// Recoverable signature over a 32-byte digest, for Ethereum
    /// transaction signing.
    pub async fn sign_digest(&self, digest: H256) -> Result<(U256, U256, u8), SignerError> {
        let body = serde_json::json!({ "digest": hex::encode(digest.as_bytes()) });
        let response: DigestSignatureResponse = self
            .request("sign_digest", |client, url| client.post(url).json(&body))
            .await?;
        let r = parse_component(&response.r)?;
        let s = parse_component(&response.s)?;
        if response.recovery_id > 1 {
            return Err(SignerError::Malformed(format!(
                "recovery id {} out of range",
                response.recovery_id
            )));
        }
        Ok((r, s, response.recovery_id))
    }

    async fn request<T, F>(&self, operation: &'static str, build: F) -> Result<T, SignerError>
    where
        T: for<'de> Deserialize<'de>,
        F: Fn(&reqwest::Client, Url) -> reqwest::RequestBuilder,
    {
        let url = self.operation_url(operation)?;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.request_once(&build, url.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) if attempt < SIGN_ATTEMPTS => {
                    warn!(operation, attempt, ?error, "signing call failed, retrying");
                    sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn request_once<T, F>(&self, build: &F, url: Url) -> Result<T, SignerError>
    where
        T: for<'de> Deserialize<'de>,
        F: Fn(&reqwest::Client, Url) -> reqwest::RequestBuilder,
    {
        let response = build(&self.client, url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SignerError::Service { status, message });
        }
        Ok(response.json().await?)
    }

    fn operation_url(&self, operation: &'static str) -> Result<Url, SignerError> {
        let path = match operation {
            "public_key" => format!("keys/{}", self.key_id),
            "sign" => format!("keys/{}/sign", self.key_id),
            _ => format!("keys/{}/sign-digest", self.key_id),
        };
        self.endpoint
            .url()
            .join(&path)
            .map_err(|error| SignerError::Malformed(error.to_string()))
    }
}

fn parse_component(raw: &str) -> Result<U256, SignerError> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|error| SignerError::Malformed(error.to_string()))?;
    if bytes.len() > 32 {
        return Err(SignerError::Malformed(format!(
            "signature component of {} bytes",
            bytes.len()
        )));
    }
    Ok(U256::from_big_endian(&bytes))
}

/// Address controlled by a SEC1-encoded secp256k1 public key, derived the
/// same way on both chains (keccak-160 of the uncompressed point).
pub fn public_key_address(sec1: &[u8]) -> Result<Address, SignerError> {
    let key = PublicKey::from_sec1_bytes(sec1).map_err(|_| SignerError::PublicKey)?;
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    Ok(Address::from_slice(&hash[12..]))
}

/// `ethers` signer backed by the remote service; used by the mint path
/// through `SignerMiddleware`.
#[derive(Debug, Clone)]
pub struct RemoteWallet {
    client: Arc<SignerClient>,
    address: Address,
    chain_id: u64,
}

impl RemoteWallet {
    pub fn new(client: Arc<SignerClient>, address: Address) -> Self {
        Self {
            client,
            address,
            chain_id: 1,
        }
    }

    async fn sign_digest_with_v(&self, digest: H256) -> Result<Signature, SignerError> {
        let (r, s, recovery_id) = self.client.sign_digest(digest).await?;
        Ok(Signature {
            r,
            s,
            v: u64::from(recovery_id) + 27,
        })
    }
}

#[async_trait]
impl ethers::signers::Signer for RemoteWallet {
    type Error = SignerError;

    async fn sign_message<S: Send + Sync + AsRef<[u8]>>(
        &self,
        message: S,
    ) -> Result<Signature, Self::Error> {
        self.sign_digest_with_v(hash_message(message)).await
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> Result<Signature, Self::Error> {
        let mut tx = tx.clone();
        let chain_id = tx
            .chain_id()
            .map_or(self.chain_id, |chain_id| chain_id.as_u64());
        tx.set_chain_id(chain_id);

        let mut signature = self.sign_digest_with_v(tx.sighash()).await?;
        let recovery_id = signature.v - 27;
        if let TypedTransaction::Legacy(_) = tx {
            signature.v = recovery_id + 35 + chain_id * 2;
        } else {
            // Typed transactions carry the bare y-parity.
            signature.v = recovery_id;
        }
        Ok(signature)
    }

    async fn sign_typed_data<T: Eip712 + Send + Sync>(
        &self,
        payload: &T,
    ) -> Result<Signature, Self::Error> {
        let digest = payload
            .encode_eip712()
            .map_err(|error| SignerError::TypedData(error.to_string()))?;
        self.sign_digest_with_v(H256::from(digest)).await
    }

    fn address(&self) -> Address {
        self.address
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn with_chain_id<T: Into<u64>>(mut self, chain_id: T) -> Self {
        self.chain_id = chain_id.into();
        self
    }
}
