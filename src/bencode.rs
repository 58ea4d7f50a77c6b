// SPDX-FileCopyrightText: 2026 The ebbtide Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Bencode decoding and canonical encoding.
//!
//! The encoder is deterministic: dictionary keys are emitted in ascending
//! raw-byte order, so re-encoding a decoded "info" dictionary reproduces
//! the exact bytes the info-hash is computed over.

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BencodeError {
    #[error("bencode: unexpected end of input")]
    UnexpectedEof,
    #[error("bencode: unexpected prefix byte {0:#04x}")]
    BadPrefix(u8),
    #[error("bencode: string length is negative")]
    NegativeLength,
    #[error("bencode: string shorter than its declared length")]
    TruncatedString,
    #[error("bencode: malformed integer")]
    InvalidInteger,
    #[error("bencode: trailing data after top-level value")]
    TrailingData,
}

/// A decoded bencode value.
///
/// Dictionary keys are raw byte strings; they are kept sorted so that
/// encoding is canonical by construction. Duplicate keys in the input
/// overwrite (last wins).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// UTF-8 view of a byte string, lossless only.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Dictionary lookup; `None` for non-dicts and missing keys.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict().and_then(|map| map.get(key))
    }
}

/// Decodes a single top-level value, rejecting trailing bytes.
pub fn from_bytes(input: &[u8]) -> Result<Value, BencodeError> {
    let (value, rest) = decode(input)?;
    if !rest.is_empty() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Consumes exactly one value from `input`, returning it together with
/// the unread remainder.
pub fn decode(input: &[u8]) -> Result<(Value, &[u8]), BencodeError> {
    match input.first() {
        None => Err(BencodeError::UnexpectedEof),
        Some(b'i') => decode_int(&input[1..]),
        Some(b'l') => decode_list(&input[1..]),
        Some(b'd') => decode_dict(&input[1..]),
        Some(b'0'..=b'9') => decode_bytes(input),
        Some(b'-') => Err(BencodeError::NegativeLength),
        Some(&other) => Err(BencodeError::BadPrefix(other)),
    }
}

/// Canonical encoding of `value`.
///
/// Byte-identical for semantically identical inputs; dictionary keys are
/// written in ascending raw-byte order.
pub fn to_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Value::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (key, val) in map {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

fn decode_int(input: &[u8]) -> Result<(Value, &[u8]), BencodeError> {
    let end = input
        .iter()
        .position(|&b| b == b'e')
        .ok_or(BencodeError::UnexpectedEof)?;
    let n = parse_i64(&input[..end])?;
    Ok((Value::Int(n), &input[end + 1..]))
}

fn parse_i64(digits: &[u8]) -> Result<i64, BencodeError> {
    let (negative, magnitude) = match digits.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, digits),
    };

    if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidInteger);
    }
    // No leading zeros, and "-0" is not a valid integer.
    if magnitude[0] == b'0' && (negative || magnitude.len() > 1) {
        return Err(BencodeError::InvalidInteger);
    }

    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidInteger)
}

fn decode_bytes(input: &[u8]) -> Result<(Value, &[u8]), BencodeError> {
    let colon = input
        .iter()
        .position(|&b| b == b':')
        .ok_or(BencodeError::UnexpectedEof)?;

    let length_digits = &input[..colon];
    if !length_digits.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidInteger);
    }
    let length: u64 = std::str::from_utf8(length_digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidInteger)?;

    let rest = &input[colon + 1..];
    if (rest.len() as u64) < length {
        return Err(BencodeError::TruncatedString);
    }

    let length = length as usize;
    Ok((Value::Bytes(rest[..length].to_vec()), &rest[length..]))
}

fn decode_list(mut input: &[u8]) -> Result<(Value, &[u8]), BencodeError> {
    let mut items = Vec::new();
    loop {
        match input.first() {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => return Ok((Value::List(items), &input[1..])),
            _ => {
                let (value, rest) = decode(input)?;
                items.push(value);
                input = rest;
            }
        }
    }
}

fn decode_dict(mut input: &[u8]) -> Result<(Value, &[u8]), BencodeError> {
    let mut map = BTreeMap::new();
    loop {
        match input.first() {
            None => return Err(BencodeError::UnexpectedEof),
            Some(b'e') => return Ok((Value::Dict(map), &input[1..])),
            Some(b'0'..=b'9') => {
                let (key, rest) = decode_bytes(input)?;
                let Value::Bytes(key) = key else {
                    unreachable!("decode_bytes only yields byte strings");
                };
                let (value, rest) = decode(rest)?;
                map.insert(key, value);
                input = rest;
            }
            Some(b'-') => return Err(BencodeError::NegativeLength),
            // Keys must be byte strings.
            Some(&other) => return Err(BencodeError::BadPrefix(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    fn dict(entries: Vec<(&str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect(),
        )
    }

    #[test]
    fn round_trips_a_dictionary() {
        let input = b"d3:bar4:spam3:fooi42ee";

        let value = from_bytes(input).unwrap();
        assert_eq!(
            value,
            dict(vec![("bar", bytes("spam")), ("foo", Value::Int(42))])
        );
        assert_eq!(to_bytes(&value), input);
    }

    #[test]
    fn rejects_negative_string_length() {
        assert_eq!(from_bytes(b"-1:"), Err(BencodeError::NegativeLength));
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(from_bytes(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(from_bytes(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(from_bytes(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(
            from_bytes(b"i9223372036854775807e").unwrap(),
            Value::Int(i64::MAX)
        );
    }

    #[test]
    fn rejects_malformed_integers() {
        for input in [&b"ie"[..], b"i-0e", b"i03e", b"i-e", b"i1x2e"] {
            assert_eq!(
                from_bytes(input),
                Err(BencodeError::InvalidInteger),
                "{input:?}"
            );
        }
    }

    #[test]
    fn decodes_strings_without_transcoding() {
        assert_eq!(from_bytes(b"4:spam").unwrap(), bytes("spam"));
        assert_eq!(from_bytes(b"0:").unwrap(), Value::Bytes(vec![]));
        // Arbitrary bytes, not UTF-8.
        assert_eq!(
            from_bytes(b"3:\xff\x00\x80").unwrap(),
            Value::Bytes(vec![0xff, 0x00, 0x80])
        );
    }

    #[test]
    fn rejects_truncated_string() {
        assert_eq!(from_bytes(b"5:spam"), Err(BencodeError::TruncatedString));
    }

    #[test]
    fn rejects_trailing_data() {
        assert_eq!(from_bytes(b"i1ei2e"), Err(BencodeError::TrailingData));
    }

    #[test]
    fn decode_returns_remainder() {
        let (value, rest) = decode(b"4:spami42e").unwrap();
        assert_eq!(value, bytes("spam"));
        assert_eq!(rest, b"i42e");
    }

    #[test]
    fn rejects_bad_prefix() {
        assert_eq!(from_bytes(b"x"), Err(BencodeError::BadPrefix(b'x')));
    }

    #[test]
    fn rejects_unterminated_containers() {
        assert_eq!(from_bytes(b"l4:spam"), Err(BencodeError::UnexpectedEof));
        assert_eq!(from_bytes(b"d3:foo"), Err(BencodeError::UnexpectedEof));
        assert_eq!(from_bytes(b""), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn rejects_non_string_dict_keys() {
        assert_eq!(from_bytes(b"di1ei2ee"), Err(BencodeError::BadPrefix(b'i')));
    }

    #[test]
    fn duplicate_dict_keys_last_wins() {
        let value = from_bytes(b"d1:ai1e1:ai2ee").unwrap();
        assert_eq!(value.get(b"a"), Some(&Value::Int(2)));
    }

    #[test]
    fn encoder_sorts_dict_keys_by_raw_bytes() {
        let value = dict(vec![
            ("zz", Value::Int(1)),
            ("a", Value::Int(2)),
            ("ab", Value::Int(3)),
        ]);
        assert_eq!(to_bytes(&value), b"d1:ai2e2:abi3e2:zzi1ee");
    }

    #[test]
    fn decodes_nested_structures() {
        let value = from_bytes(b"d4:listl4:spam4:eggsi42ee5:emptydee").unwrap();
        assert_eq!(
            value.get(b"list"),
            Some(&Value::List(vec![
                bytes("spam"),
                bytes("eggs"),
                Value::Int(42)
            ]))
        );
        assert_eq!(value.get(b"empty"), Some(&Value::Dict(BTreeMap::new())));
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            proptest::collection::vec(any::<u8>(), 0..24).prop_map(Value::Bytes),
            any::<i64>().prop_map(Value::Int),
        ];
        leaf.prop_recursive(3, 32, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::btree_map(
                    proptest::collection::vec(any::<u8>(), 0..12),
                    inner,
                    0..6
                )
                .prop_map(Value::Dict),
            ]
        })
    }

    proptest! {
        // Canonical encoding is a fixed point of encode ∘ decode.
        #[test]
        fn canonical_round_trip(value in value_strategy()) {
            let encoded = to_bytes(&value);
            let decoded = from_bytes(&encoded).unwrap();
            prop_assert_eq!(&decoded, &value);
            prop_assert_eq!(to_bytes(&decoded), encoded);
        }

        #[test]
        fn dict_keys_encode_in_strictly_ascending_order(
            map in proptest::collection::btree_map(
                proptest::collection::vec(any::<u8>(), 0..12),
                any::<i64>().prop_map(Value::Int),
                2..8,
            )
        ) {
            let encoded = to_bytes(&Value::Dict(map.clone()));
            let decoded = from_bytes(&encoded).unwrap();
            let keys: Vec<_> = decoded.as_dict().unwrap().keys().cloned().collect();
            prop_assert!(keys.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
