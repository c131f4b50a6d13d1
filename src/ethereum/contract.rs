#![allow(clippy::extra_unused_lifetimes)]

use anyhow::Context;
use ethers::abi::RawLog;
use ethers::contract::{abigen, EthEvent};
use ethers::types::{Address, Log, U256};
use thiserror::Error;

use crate::monitor::ChainEvent;

abigen!(
    WrappedNcg,
    r#"[
        event Burn(address indexed _sender, bytes32 indexed _to, uint256 amount)
        function mint(address _to, uint256 _amount) public
        function balanceOf(address account) public view returns (uint256)
        function totalSupply() public view returns (uint256)
    ]"#
);

/// Number of bytes of the planet id prefix in a burn's recipient tag.
pub const PLANET_ID_BYTES: usize = 6;

/// A confirmed `Burn` on the wNCG contract. `to` is the raw 32-byte
/// recipient tag; it is parsed (and possibly rejected) by the observer,
/// not here, so malformed tags still get a history record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnEvent {
    pub tx_id: String,
    pub block_hash: String,
    pub log_index: u32,
    pub sender: Address,
    pub amount: U256,
    pub to: [u8; 32],
}

impl ChainEvent for BurnEvent {
    fn tx_id(&self) -> &str {
        &self.tx_id
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecipientTagError {
    #[error("planet id mismatch: expected 0x{expected}, got 0x{actual}")]
    PlanetMismatch { expected: String, actual: String },

    #[error("recipient tag carries data past the address")]
    Padding,
}

/// Splits a burn's 32-byte recipient tag into its parts: a planet id
/// prefix, a 20-byte Nine Chronicles address, and zero padding.
pub fn parse_recipient_tag(
    to: &[u8; 32],
    planet_id: &[u8; PLANET_ID_BYTES],
) -> Result<Address, RecipientTagError> {
    if &to[..PLANET_ID_BYTES] != planet_id {
        return Err(RecipientTagError::PlanetMismatch {
            expected: hex::encode(planet_id),
            actual: hex::encode(&to[..PLANET_ID_BYTES]),
        });
    }
    let recipient = Address::from_slice(&to[PLANET_ID_BYTES..PLANET_ID_BYTES + 20]);
    if to[PLANET_ID_BYTES + 20..].iter().any(|byte| *byte != 0) {
        return Err(RecipientTagError::Padding);
    }
    Ok(recipient)
}

pub fn parse_burn_log(log: &Log) -> anyhow::Result<BurnEvent> {
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };
    let burn = BurnFilter::decode_log(&raw).context("undecodable Burn log")?;
    let tx_hash = log
        .transaction_hash
        .context("Burn log carries no transaction hash")?;
    let block_hash = log.block_hash.context("Burn log carries no block hash")?;
    let log_index = log
        .log_index
        .context("Burn log carries no log index")?
        .as_u32();
    Ok(BurnEvent {
        tx_id: format!("{tx_hash:?}"),
        block_hash: format!("{block_hash:?}"),
        log_index,
        sender: burn.sender,
        amount: burn.amount,
        to: burn.to,
    })
}
