// Copyright (C) 2025 Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

/// Bencode codec for nREPL messages
///
/// This module handles encoding and decoding of nREPL messages using bencode format.
///
/// Bencode format:
/// - Strings: `<length>:<string>` (e.g., "4:spam")
/// - Integers: `i<number>e` (e.g., "i42e")
/// - Lists: `l<items>e` (e.g., "l4:spam4:eggse")
/// - Dictionaries: `d<key><value>...e` (e.g., "d3:cow3:moo4:spam4:eggse")
use crate::error::{NReplError, Result};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum allowed length for a single bencode string (100MB)
/// This prevents malicious clients from causing OOM by sending extremely large length values
pub const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// Maximum nesting of lists and dictionaries within one message
pub const MAX_NESTING_DEPTH: usize = 512;

/// A decoded top-level message
pub type Dict = BTreeMap<String, Value>;

/// The bencode data model
///
/// Dictionaries are kept in a `BTreeMap`, so encoding always emits keys in
/// byte order regardless of how the dictionary was built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Integer(i64),
    List(Vec<Value>),
    Dict(Dict),
}

/// Discriminant of a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    String,
    Integer,
    List,
    Dict,
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::String(_) => Kind::String,
            Value::Integer(_) => Kind::Integer,
            Value::List(_) => Kind::List,
            Value::Dict(_) => Kind::Dict,
        }
    }

    /// Encode anything that has a canonical textual form as a byte string
    ///
    /// This is the fallback for symbolic values (keywords, enum-like tokens)
    /// that have no bencode representation of their own.
    pub fn from_display(value: impl fmt::Display) -> Self {
        Value::String(value.to_string())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(dict) => Some(dict),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::from_display(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Dict> for Value {
    fn from(dict: Dict) -> Self {
        Value::Dict(dict)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::String(s) => serializer.serialize_str(s),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Dict(dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (key, value) in dict {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

/// Append the bencode form of `value` to `out`, depth-first
pub fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::String(s) => encode_str(s, out),
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, item) in dict {
                encode_str(key, out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(s.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(s.as_bytes());
}

/// Decode one top-level dictionary
///
/// Running out of input inside a dictionary or list closes it implicitly;
/// running out in the middle of a string or integer is an error.
pub fn decode(data: &[u8]) -> Result<Dict> {
    let mut reader = Reader::new(data);
    match reader.peek() {
        Some(b'd') => reader.read_dict(),
        Some(b) => Err(NReplError::protocol_with_preview(
            format!("Expected 'd', got 0x{:02x}", b),
            0,
            data,
        )),
        None => Err(NReplError::protocol("Expected 'd', got end of input", 0)),
    }
}

/// Decode a single value of any kind, returning it with the bytes consumed
pub fn decode_value(data: &[u8]) -> Result<(Value, usize)> {
    let mut reader = Reader::new(data);
    let value = reader.read_value()?;
    Ok((value, reader.pos))
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Enter a container, failing once the nesting limit is passed
    fn descend(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(NReplError::format(
                format!("Nesting depth exceeds maximum of {}", MAX_NESTING_DEPTH),
                self.pos,
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_value(&mut self) -> Result<Value> {
        match self.peek() {
            None => Err(NReplError::TruncatedInput {
                position: self.pos,
                expected: 1,
                available: 0,
            }),
            Some(b'd') => self.read_dict().map(Value::Dict),
            Some(b'l') => self.read_list(),
            Some(b'i') => self.read_int(),
            Some(_) => self.read_string().map(Value::String),
        }
    }

    fn read_dict(&mut self) -> Result<Dict> {
        self.descend()?;
        self.pos += 1; // Skip 'd'
        let mut dict = Dict::new();
        loop {
            match self.peek() {
                None => break,
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let key = self.read_string()?;
                    let value = self.read_value()?;
                    dict.insert(key, value);
                }
            }
        }
        self.depth -= 1;
        Ok(dict)
    }

    fn read_list(&mut self) -> Result<Value> {
        self.descend()?;
        self.pos += 1; // Skip 'l'
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => break,
                Some(b'e') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => items.push(self.read_value()?),
            }
        }
        self.depth -= 1;
        Ok(Value::List(items))
    }

    fn read_int(&mut self) -> Result<Value> {
        self.pos += 1; // Skip 'i'
        let start = self.pos;
        let Some(len) = self.data[start..].iter().position(|&b| b == b'e') else {
            return Err(NReplError::TruncatedInput {
                position: self.data.len(),
                expected: 1,
                available: 0,
            });
        };
        self.pos = start + len + 1;

        std::str::from_utf8(&self.data[start..start + len])
            .ok()
            .and_then(|digits| digits.parse::<i64>().ok())
            .map(Value::Integer)
            .ok_or_else(|| {
                NReplError::format(
                    format!(
                        "Invalid integer: {:?}",
                        String::from_utf8_lossy(&self.data[start..start + len])
                    ),
                    start,
                )
            })
    }

    fn read_string(&mut self) -> Result<String> {
        let start = self.pos;
        let Some(colon) = self.data[start..].iter().position(|&b| b == b':') else {
            return Err(NReplError::TruncatedInput {
                position: self.data.len(),
                expected: 1,
                available: 0,
            });
        };
        let len_bytes = &self.data[start..start + colon];
        let len = std::str::from_utf8(len_bytes)
            .ok()
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<usize>().ok())
            .ok_or_else(|| {
                NReplError::format(
                    format!(
                        "Invalid string length: {:?}",
                        String::from_utf8_lossy(len_bytes)
                    ),
                    start,
                )
            })?;

        if len > MAX_STRING_LENGTH {
            return Err(NReplError::format(
                format!(
                    "String length {} exceeds maximum allowed size of {} bytes",
                    len, MAX_STRING_LENGTH
                ),
                start,
            ));
        }

        let body_start = start + colon + 1;
        let available = self.data.len() - body_start;
        if len > available {
            return Err(NReplError::TruncatedInput {
                position: body_start,
                expected: len,
                available,
            });
        }

        self.pos = body_start + len;
        Ok(String::from_utf8_lossy(&self.data[body_start..self.pos]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dict(entries: &[(&str, Value)]) -> Dict {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::from("spam")), b"4:spam");
        assert_eq!(encode(&Value::from("")), b"0:");
        assert_eq!(encode(&Value::Integer(42)), b"i42e");
        assert_eq!(encode(&Value::Integer(-7)), b"i-7e");
        assert_eq!(encode(&Value::Integer(0)), b"i0e");
    }

    #[test]
    fn test_encode_uses_utf8_byte_length() {
        // "é" is two bytes in UTF-8
        assert_eq!(encode(&Value::from("é")), "2:é".as_bytes());
    }

    #[test]
    fn test_encode_dict_keys_are_sorted() {
        let value = Value::Dict(dict(&[
            ("status", Value::from(vec!["done"])),
            ("id", Value::from("1")),
            ("session", Value::from("s")),
        ]));
        assert_eq!(encode(&value), b"d2:id1:17:session1:s6:statusl4:doneee");
    }

    #[test]
    fn test_display_fallback_encodes_as_string() {
        #[derive(Debug)]
        enum Status {
            EvalError,
        }
        impl fmt::Display for Status {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    Status::EvalError => write!(f, "eval-error"),
                }
            }
        }

        let value = Value::from_display(Status::EvalError);
        assert_eq!(value.kind(), Kind::String);
        assert_eq!(encode(&value), b"10:eval-error");
        assert_eq!(encode(&Value::from(true)), b"4:true");
    }

    #[test]
    fn test_decode_request() {
        let bencode = b"d4:code9:(+ 1 2 3)2:idi1e2:op4:evale";

        let decoded = decode(bencode).expect("decoding failed");

        assert_eq!(decoded["op"], Value::from("eval"));
        assert_eq!(decoded["id"], Value::Integer(1));
        assert_eq!(decoded["code"], Value::from("(+ 1 2 3)"));
    }

    #[test]
    fn test_decode_nested() {
        let bencode = b"d4:listl1:ai2e1:ce4:metad4:linei10eee";

        let decoded = decode(bencode).expect("decoding failed");

        assert_eq!(
            decoded["list"],
            Value::List(vec![Value::from("a"), Value::Integer(2), Value::from("c")])
        );
        let meta = decoded["meta"].as_dict().expect("meta should be a dict");
        assert_eq!(meta["line"].as_int(), Some(10));
    }

    #[test]
    fn test_decode_rejects_non_dict() {
        let result = decode(b"l4:spame");
        match result {
            Err(NReplError::Protocol {
                position,
                buffer_preview,
                ..
            }) => {
                assert_eq!(position, 0);
                assert!(buffer_preview.is_some());
            }
            other => panic!("Expected Protocol error, got: {:?}", other),
        }

        assert!(matches!(decode(b""), Err(NReplError::Protocol { .. })));
    }

    #[test]
    fn test_decode_end_of_input_closes_containers() {
        let decoded = decode(b"d2:op4:eval4:listl1:a").expect("decoding failed");
        assert_eq!(decoded["op"], Value::from("eval"));

        let decoded = decode(b"d2:op4:evale").expect("decoding failed");
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_decode_invalid_integer() {
        match decode(b"d2:idi12x4ee") {
            Err(NReplError::Format { message, position }) => {
                assert!(message.contains("Invalid integer"), "got: {}", message);
                assert_eq!(position, 6);
            }
            other => panic!("Expected Format error, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_invalid_string_length() {
        assert!(matches!(
            decode(b"d2:op4x:evale"),
            Err(NReplError::Format { .. })
        ));
        // A key must be a string
        assert!(matches!(decode(b"di1e2:ope"), Err(NReplError::Format { .. })));
    }

    #[test]
    fn test_decode_truncated_string() {
        match decode(b"d4:code20:(+ 1e") {
            Err(NReplError::TruncatedInput {
                expected,
                available,
                ..
            }) => {
                assert_eq!(expected, 20);
                assert_eq!(available, 5);
            }
            other => panic!("Expected TruncatedInput error, got: {:?}", other),
        }
    }

    fn nested(depth: usize) -> Vec<u8> {
        let mut data = b"d1:a".to_vec();
        data.extend(std::iter::repeat_n(b'l', depth));
        data.extend(std::iter::repeat_n(b'e', depth + 1));
        data
    }

    #[test]
    fn test_decode_deep_nesting_rejected() {
        // would overflow the stack without a limit
        match decode(&nested(100_000)) {
            Err(NReplError::Format { message, .. }) => {
                assert!(message.contains("Nesting depth"), "message: {}", message);
            }
            other => panic!("Expected Format error, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_nesting_at_limit() {
        // the top-level dict counts as one level
        let dict = decode(&nested(MAX_NESTING_DEPTH - 1)).expect("within the limit");
        assert_eq!(dict["a"].kind(), Kind::List);
        assert!(decode(&nested(MAX_NESTING_DEPTH)).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let bencode = format!("d4:code{}:xe", MAX_STRING_LENGTH + 1);
        match decode(bencode.as_bytes()) {
            Err(NReplError::Format { message, .. }) => {
                assert!(message.contains("exceeds maximum"), "got: {}", message);
            }
            other => panic!("Expected Format error, got: {:?}", other),
        }
    }

    #[test]
    fn test_decode_value_reports_consumed() {
        let (value, consumed) = decode_value(b"i-12etrailing").expect("decoding failed");
        assert_eq!(value, Value::Integer(-12));
        assert_eq!(consumed, 5);
    }

    #[test]
    fn test_encode_matches_serde_bencode() {
        let value = Value::Dict(dict(&[
            ("op", Value::from("eval")),
            ("id", Value::Integer(7)),
            ("zz", Value::from(vec![Value::from("a"), Value::Integer(-1)])),
            ("ns", Value::Dict(dict(&[("b", Value::from("")), ("a", Value::Integer(0))]))),
        ]));

        let ours = encode(&value);
        let theirs = serde_bencode::to_bytes(&value).expect("serde_bencode failed");
        assert_eq!(ours, theirs);
    }

    #[test]
    fn test_decode_serde_bencode_output() {
        let mut message: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
        message.insert("numbers", vec![1, -2, i64::MAX]);
        let bytes = serde_bencode::to_bytes(&message).expect("serde_bencode failed");

        let decoded = decode(&bytes).expect("decoding failed");
        assert_eq!(
            decoded["numbers"],
            Value::from(vec![1i64, -2, i64::MAX])
        );
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Integer),
            ".{0,16}".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                prop::collection::btree_map(".{0,8}", inner, 0..6).prop_map(Value::Dict),
            ]
        })
    }

    proptest! {
        #[test]
        fn test_roundtrip(entries in prop::collection::btree_map(".{0,8}", arb_value(), 0..8)) {
            let value = Value::Dict(entries.clone());
            let decoded = decode(&encode(&value)).expect("decoding failed");
            prop_assert_eq!(decoded, entries);
        }
    }
}
