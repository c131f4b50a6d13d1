use std::collections::BTreeMap;

use ethers::types::Address;

use super::amount::NcgAmount;
use super::bencodex::{Key, Value};

/// Builds the `transfer_asset3` action plain value moving `amount` NCG from
/// `sender` to `recipient`. The currency description must match the on-chain
/// NCG definition exactly (two decimal places, single minter), otherwise the
/// node rejects the transfer as an unknown asset.
pub fn transfer_asset(
    sender: Address,
    recipient: Address,
    amount: NcgAmount,
    minter: Address,
    memo: Option<&str>,
) -> Value {
    let mut currency = BTreeMap::new();
    currency.insert(
        Key::Text("decimalPlaces".into()),
        Value::binary(vec![0x02]),
    );
    currency.insert(
        Key::Text("minters".into()),
        Value::List(vec![Value::binary(minter.as_bytes().to_vec())]),
    );
    currency.insert(Key::Text("ticker".into()), Value::text("NCG"));

    let mut values = BTreeMap::new();
    values.insert(
        Key::Text("amount".into()),
        Value::List(vec![
            Value::Dictionary(currency),
            Value::Integer(i128::from(amount.hundredths())),
        ]),
    );
    if let Some(memo) = memo {
        values.insert(Key::Text("memo".into()), Value::text(memo));
    }
    values.insert(
        Key::Text("recipient".into()),
        Value::binary(recipient.as_bytes().to_vec()),
    );
    values.insert(
        Key::Text("sender".into()),
        Value::binary(sender.as_bytes().to_vec()),
    );

    let mut action = BTreeMap::new();
    action.insert(Key::Text("type_id".into()), Value::text("transfer_asset3"));
    action.insert(Key::Text("values".into()), Value::Dictionary(values));
    Value::Dictionary(action)
}
