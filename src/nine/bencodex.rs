//! Canonical dictionary encoding used by the Nine Chronicles chain for
//! action plain values. Dictionaries encode with their keys sorted, binary
//! keys before text keys, so equal values always serialize to equal bytes.
//! Only the value kinds that appear in bridge actions are modeled.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Key {
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Binary(Vec<u8>),
    Text(String),
    Integer(i128),
    List(Vec<Value>),
    Dictionary(BTreeMap<Key, Value>),
}

impl Value {
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    pub fn binary(value: impl Into<Vec<u8>>) -> Self {
        Value::Binary(value.into())
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut buffer = Vec::new();
    encode_into(value, &mut buffer);
    buffer
}

fn encode_into(value: &Value, buffer: &mut Vec<u8>) {
    match value {
        Value::Binary(bytes) => encode_binary(bytes, buffer),
        Value::Text(text) => encode_text(text, buffer),
        Value::Integer(number) => {
            buffer.push(b'i');
            buffer.extend_from_slice(number.to_string().as_bytes());
            buffer.push(b'e');
        }
        Value::List(items) => {
            buffer.push(b'l');
            for item in items {
                encode_into(item, buffer);
            }
            buffer.push(b'e');
        }
        Value::Dictionary(entries) => {
            // BTreeMap iteration order matches the canonical key order:
            // binary keys first, then text keys, each lexicographically.
            buffer.push(b'd');
            for (key, item) in entries {
                match key {
                    Key::Binary(bytes) => encode_binary(bytes, buffer),
                    Key::Text(text) => encode_text(text, buffer),
                }
                encode_into(item, buffer);
            }
            buffer.push(b'e');
        }
    }
}

fn encode_binary(bytes: &[u8], buffer: &mut Vec<u8>) {
    buffer.extend_from_slice(bytes.len().to_string().as_bytes());
    buffer.push(b':');
    buffer.extend_from_slice(bytes);
}

fn encode_text(text: &str, buffer: &mut Vec<u8>) {
    buffer.push(b'u');
    buffer.extend_from_slice(text.len().to_string().as_bytes());
    buffer.push(b':');
    buffer.extend_from_slice(text.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_atoms() {
        assert_eq!(encode(&Value::Integer(0)), b"i0e");
        assert_eq!(encode(&Value::Integer(-42)), b"i-42e");
        assert_eq!(encode(&Value::text("NCG")), b"u3:NCG");
        assert_eq!(encode(&Value::binary(vec![0x02])), b"1:\x02");
        assert_eq!(encode(&Value::Binary(Vec::new())), b"0:");
    }

    #[test]
    fn encodes_list() {
        let value = Value::List(vec![Value::Integer(1), Value::text("a")]);
        assert_eq!(encode(&value), b"li1eu1:ae");
    }

    #[test]
    fn dictionary_orders_binary_keys_before_text() {
        let mut entries = BTreeMap::new();
        entries.insert(Key::Text("a".into()), Value::Integer(1));
        entries.insert(Key::Binary(vec![0xff]), Value::Integer(2));
        entries.insert(Key::Text("b".into()), Value::Integer(3));
        let encoded = encode(&Value::Dictionary(entries));
        assert_eq!(encoded, b"d1:\xffi2eu1:ai1eu1:bi3ee");
    }

    #[test]
    fn equal_dictionaries_encode_identically() {
        let build = |order: &[(&str, i128)]| {
            let mut entries = BTreeMap::new();
            for (key, value) in order {
                entries.insert(Key::Text((*key).into()), Value::Integer(*value));
            }
            encode(&Value::Dictionary(entries))
        };
        assert_eq!(
            build(&[("sender", 1), ("amount", 2)]),
            build(&[("amount", 2), ("sender", 1)])
        );
    }

    #[test]
    fn text_length_counts_bytes() {
        // Multi-byte characters are measured in UTF-8 bytes.
        assert_eq!(encode(&Value::text("é")), b"u2:\xc3\xa9");
    }
}
