//! Core data models shared by the store, the runners and the components.
//!
//! A [`Payload`] is what components produce and consume. The store only
//! ever sees its encoded bytes; decoding back to a typed value happens on
//! read, given the collection's [`PayloadKind`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The declared content type of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Json,
    #[serde(alias = "bytes")]
    Binary,
    Text,
}

impl PayloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::Json => "json",
            PayloadKind::Binary => "binary",
            PayloadKind::Text => "text",
        }
    }

    /// HTTP `Content-Type` used when a handler returns this kind.
    pub fn content_type(self) -> &'static str {
        match self {
            PayloadKind::Json => "application/json",
            PayloadKind::Binary => "application/octet-stream",
            PayloadKind::Text => "text/plain; charset=utf-8",
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(PayloadKind::Json),
            "binary" | "bytes" => Ok(PayloadKind::Binary),
            "text" => Ok(PayloadKind::Text),
            other => Err(PayloadError::UnknownKind(other.to_string())),
        }
    }
}

/// Errors raised while encoding or decoding payload bytes.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("unknown payload kind '{0}' (expected json, binary or text)")]
    UnknownKind(String),
    #[error("malformed json payload: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("text payload is not valid utf-8")]
    MalformedText,
    #[error("expected a {expected} payload, got {actual}")]
    KindMismatch {
        expected: PayloadKind,
        actual: PayloadKind,
    },
}

/// A typed value produced by a collector, harvester or handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(serde_json::Value),
    Binary(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Json(_) => PayloadKind::Json,
            Payload::Binary(_) => PayloadKind::Binary,
            Payload::Text(_) => PayloadKind::Text,
        }
    }

    /// Serialize to the bytes handed to the store.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Payload::Json(value) => value.to_string().into_bytes(),
            Payload::Binary(bytes) => bytes.clone(),
            Payload::Text(text) => text.as_bytes().to_vec(),
        }
    }

    /// Decode stored bytes according to the collection's kind.
    pub fn decode(kind: PayloadKind, bytes: &[u8]) -> Result<Self, PayloadError> {
        match kind {
            PayloadKind::Json => Ok(Payload::Json(serde_json::from_slice(bytes)?)),
            PayloadKind::Binary => Ok(Payload::Binary(bytes.to_vec())),
            PayloadKind::Text => String::from_utf8(bytes.to_vec())
                .map(Payload::Text)
                .map_err(|_| PayloadError::MalformedText),
        }
    }

    /// Fails with [`PayloadError::KindMismatch`] unless this payload is of `expected` kind.
    pub fn expect_kind(&self, expected: PayloadKind) -> Result<(), PayloadError> {
        if self.kind() == expected {
            Ok(())
        } else {
            Err(PayloadError::KindMismatch {
                expected,
                actual: self.kind(),
            })
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// SHA-256 hex digest used as the deduplication key.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// One row of a collection as returned by a store query.
///
/// Copies are already resolved: `data` holds the materialized bytes whether
/// the row owns them or references an earlier identical payload. `data` is
/// `None` for "computed but empty" rows and when the query skipped data.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredItem {
    pub id: i64,
    pub collection: String,
    pub timestamp: i64,
    pub kind: PayloadKind,
    pub hash: Option<String>,
    pub data: Option<Vec<u8>>,
}

impl StoredItem {
    /// Decode the materialized bytes into a typed payload.
    pub fn payload(&self) -> Result<Option<Payload>, PayloadError> {
        self.data
            .as_deref()
            .map(|bytes| Payload::decode(self.kind, bytes))
            .transpose()
    }

    pub fn into_record(self) -> Result<Record, PayloadError> {
        Ok(Record {
            timestamp: self.timestamp,
            payload: self.payload()?,
        })
    }
}

/// A decoded row handed to harvesters: a timestamp and its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub timestamp: i64,
    pub payload: Option<Payload>,
}

impl Record {
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref().and_then(Payload::as_json)
    }
}

/// Summary line for `collections()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub kind: PayloadKind,
    pub min_timestamp: Option<i64>,
    pub max_timestamp: Option<i64>,
    pub count: i64,
    /// Rows that own their bytes; `count - blobs` rows are copies or empty.
    pub blobs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_roundtrip_is_compact() {
        let payload = Payload::Json(json!({"line": "12", "vehicles": [1, 2]}));
        let bytes = payload.to_bytes();
        assert!(!bytes.contains(&b'\n'));
        let decoded = Payload::decode(PayloadKind::Json, &bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let err = Payload::decode(PayloadKind::Json, b"{not json").unwrap_err();
        assert!(matches!(err, PayloadError::MalformedJson(_)));
    }

    #[test]
    fn test_invalid_utf8_text_is_an_error() {
        let err = Payload::decode(PayloadKind::Text, &[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, PayloadError::MalformedText));
    }

    #[test]
    fn test_kind_parsing_accepts_bytes_alias() {
        assert_eq!("bytes".parse::<PayloadKind>().unwrap(), PayloadKind::Binary);
        assert_eq!("json".parse::<PayloadKind>().unwrap(), PayloadKind::Json);
        assert!("xml".parse::<PayloadKind>().is_err());
    }

    #[test]
    fn test_expect_kind() {
        let text = Payload::Text("hello".into());
        assert!(text.expect_kind(PayloadKind::Text).is_ok());
        assert!(matches!(
            text.expect_kind(PayloadKind::Json),
            Err(PayloadError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"abc").len(), 64);
    }

    #[test]
    fn test_empty_item_has_no_payload() {
        let item = StoredItem {
            id: 1,
            collection: "c".into(),
            timestamp: 10,
            kind: PayloadKind::Json,
            hash: None,
            data: None,
        };
        assert_eq!(item.payload().unwrap(), None);
    }
}
