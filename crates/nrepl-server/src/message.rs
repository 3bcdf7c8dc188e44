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

use crate::codec::{Dict, Value};

/// Correlation token used when a request carries no usable `id`
pub const UNKNOWN_ID: &str = "unknown";

/// A decoded request
///
/// Only `op`, `id`, `session` and the op-specific fields are ever read;
/// every other key is kept as-is and never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    fields: Dict,
}

impl Request {
    pub fn new(fields: Dict) -> Self {
        Self { fields }
    }

    pub fn op(&self) -> Option<&str> {
        self.str_field("op")
    }

    /// The `id` as a string; integers are stringified
    pub fn id(&self) -> String {
        match self.fields.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Integer(i)) => i.to_string(),
            _ => UNKNOWN_ID.to_string(),
        }
    }

    pub fn session(&self) -> Option<&str> {
        self.str_field("session")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn int_field(&self, key: &str) -> Option<i64> {
        match self.fields.get(key)? {
            Value::Integer(i) => Some(*i),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// First non-empty string among `keys`
    pub fn first_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .filter_map(|key| self.str_field(key))
            .find(|value| !value.is_empty())
    }

    /// Symbol prefix a `complete` request asks about
    ///
    /// Explicit fields win. Otherwise the prefix is the trailing symbol token
    /// of the line (or buffer) up to the cursor position.
    pub fn completion_prefix(&self) -> String {
        if let Some(prefix) = self.first_str(&["symbol", "prefix", "sym", "text"]) {
            return prefix.to_string();
        }

        let Some(source) = self.first_str(&["line", "buffer", "code", "text"]) else {
            return String::new();
        };
        let cursor = ["pos", "cursor", "cursor-pos", "column"]
            .iter()
            .find_map(|key| self.int_field(key));

        let slice: String = match cursor {
            Some(pos) => source
                .chars()
                .take(usize::try_from(pos.max(0)).unwrap_or(0))
                .collect(),
            None => source.to_string(),
        };
        trailing_token(&slice).to_string()
    }

    pub fn fields(&self) -> &Dict {
        &self.fields
    }
}

impl From<Dict> for Request {
    fn from(fields: Dict) -> Self {
        Self::new(fields)
    }
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || "_-+*?!$<>=.:/\\'".contains(c)
}

fn trailing_token(s: &str) -> &str {
    let start = s
        .char_indices()
        .rev()
        .take_while(|&(_, c)| is_token_char(c))
        .last()
        .map_or(s.len(), |(i, _)| i);
    &s[start..]
}

/// A reply being built
///
/// Every reply starts with `id` and `session`; `status` is added by the
/// handler when the op contract calls for one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    fields: Dict,
}

impl Response {
    pub fn new(id: impl Into<String>, session: impl Into<String>) -> Self {
        let mut fields = Dict::new();
        fields.insert("id".to_string(), Value::String(id.into()));
        fields.insert("session".to_string(), Value::String(session.into()));
        Self { fields }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Set a field only when a value is present
    pub fn with_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.with(key, value),
            None => self,
        }
    }

    pub fn status(self, status: &[&str]) -> Self {
        let tokens: Vec<Value> = status.iter().map(|s| Value::from(*s)).collect();
        self.with("status", Value::List(tokens))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn status_tokens(&self) -> Vec<&str> {
        self.fields
            .get("status")
            .and_then(Value::as_list)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn into_value(self) -> Value {
        Value::Dict(self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, encode};

    fn request(bencode: &[u8]) -> Request {
        Request::new(decode(bencode).expect("decoding failed"))
    }

    #[test]
    fn test_id_is_stringified() {
        assert_eq!(request(b"d2:idi42e2:op4:evale").id(), "42");
        assert_eq!(request(b"d2:id5:msg-12:op4:evale").id(), "msg-1");
        assert_eq!(request(b"d2:op4:evale").id(), UNKNOWN_ID);
        assert_eq!(request(b"d2:idle2:op4:evale").id(), UNKNOWN_ID);
    }

    #[test]
    fn test_unrecognised_keys_are_preserved() {
        let req = request(b"d2:op4:eval5:extrali1eee");
        assert_eq!(req.op(), Some("eval"));
        assert_eq!(
            req.get("extra"),
            Some(&Value::List(vec![Value::Integer(1)]))
        );
        assert_eq!(req.fields().len(), 2);
    }

    #[test]
    fn test_first_str_skips_empty() {
        let req = request(b"d6:prefix0:3:sym3:mape");
        assert_eq!(req.first_str(&["prefix", "sym"]), Some("map"));
        assert_eq!(req.first_str(&["symbol"]), None);
    }

    #[test]
    fn test_completion_prefix_explicit() {
        let req = request(b"d6:prefix3:red3:sym3:mape");
        assert_eq!(req.completion_prefix(), "red");
    }

    #[test]
    fn test_completion_prefix_from_line_and_cursor() {
        let req = request(b"d4:line16:(map inc (fil 0)6:columni13ee");
        assert_eq!(req.completion_prefix(), "fil");

        let req = request(b"d4:line9:(str/joine");
        assert_eq!(req.completion_prefix(), "str/join");

        let req = request(b"d2:op8:completee");
        assert_eq!(req.completion_prefix(), "");
    }

    #[test]
    fn test_response_envelope() {
        let response = Response::new("1", "s1")
            .with("value", "6")
            .with_opt::<String>("ns", None)
            .status(&["done"]);

        assert_eq!(response.status_tokens(), vec!["done"]);
        assert!(response.get("ns").is_none());
        assert_eq!(
            encode(&response.into_value()),
            b"d2:id1:17:session2:s16:statusl4:donee5:value1:6e"
        );
    }
}
