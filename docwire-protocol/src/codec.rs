//! Document codec seam.
//!
//! The wire protocol never interprets document contents beyond a handful of
//! well-known fields. Encoding and decoding are delegated to a
//! [`DocumentCodec`]. Every encoded document starts with its own total length
//! as a little-endian `i32`, so message parsers can split a run of documents
//! without understanding the payload.

use crate::error::ProtocolError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// An ordered document.
pub type Document = Map<String, Value>;

/// Options controlling how decoded values are promoted to native types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Return 64-bit integers as plain numbers.
    pub promote_longs: bool,
    /// Return wrapped scalar values as plain numbers.
    pub promote_values: bool,
    /// Return binary values as raw buffers.
    pub promote_buffers: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            promote_longs: true,
            promote_values: true,
            promote_buffers: false,
        }
    }
}

/// Encodes and decodes documents carried in wire messages.
pub trait DocumentCodec: Send + Sync + fmt::Debug {
    /// Encodes a document, including its length prefix.
    fn encode(&self, doc: &Document) -> Result<Bytes, ProtocolError>;

    /// Decodes one length-prefixed document occupying all of `bytes`.
    fn decode(&self, bytes: &[u8], opts: &DecodeOptions) -> Result<Document, ProtocolError>;
}

/// Reads the length prefix of the document starting at `buf`.
pub fn document_len(buf: &[u8]) -> Result<usize, ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::Truncated {
            needed: 4 - buf.len(),
        });
    }
    let len = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len < 5 {
        return Err(ProtocolError::InvalidDocument(format!(
            "document length {} is too small",
            len
        )));
    }
    let len = len as usize;
    if len > buf.len() {
        return Err(ProtocolError::Truncated {
            needed: len - buf.len(),
        });
    }
    Ok(len)
}

/// Converts a JSON value into a document.
pub fn to_document(value: Value) -> Result<Document, ProtocolError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ProtocolError::InvalidDocument(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Length-prefixed JSON documents.
///
/// With `promote_longs` disabled, integers outside the 32-bit range decode as
/// `{"$numberLong": "<digits>"}`. With `promote_values` disabled, every
/// integer is wrapped (`$numberInt` or `$numberLong`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl DocumentCodec for JsonCodec {
    fn encode(&self, doc: &Document) -> Result<Bytes, ProtocolError> {
        let body = serde_json::to_vec(doc)?;
        let total = body.len() + 4;
        let prefix = i32::try_from(total).map_err(|_| ProtocolError::DocumentTooLarge {
            size: total,
            max: i32::MAX as usize,
        })?;
        let mut buf = BytesMut::with_capacity(total);
        buf.put_i32_le(prefix);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    fn decode(&self, bytes: &[u8], opts: &DecodeOptions) -> Result<Document, ProtocolError> {
        let len = document_len(bytes)?;
        if len != bytes.len() {
            return Err(ProtocolError::InvalidDocument(format!(
                "length prefix {} does not match {} available bytes",
                len,
                bytes.len()
            )));
        }
        let value: Value = serde_json::from_slice(&bytes[4..])?;
        let value = if opts.promote_values && opts.promote_longs {
            value
        } else {
            demote(value, opts)
        };
        to_document(value)
    }
}

fn demote(value: Value, opts: &DecodeOptions) -> Value {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) if i32::try_from(i).is_err() => {
                let mut wrapped = Map::new();
                wrapped.insert("$numberLong".to_string(), Value::String(i.to_string()));
                Value::Object(wrapped)
            }
            Some(i) if !opts.promote_values => {
                let mut wrapped = Map::new();
                wrapped.insert("$numberInt".to_string(), Value::String(i.to_string()));
                Value::Object(wrapped)
            }
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(|v| demote(v, opts)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, demote(v, opts)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        to_document(value).unwrap()
    }

    #[test]
    fn test_json_codec_prefix() {
        let codec = JsonCodec::new();
        let encoded = codec.encode(&doc(json!({"a": 1}))).unwrap();
        assert_eq!(document_len(&encoded).unwrap(), encoded.len());
        assert_eq!(&encoded[4..], br#"{"a":1}"#);
    }

    #[test]
    fn test_json_codec_preserves_key_order() {
        let codec = JsonCodec::new();
        let original = doc(json!({"$query": {}, "$orderby": {"b": 1, "a": -1}}));
        let encoded = codec.encode(&original).unwrap();
        let decoded = codec.decode(&encoded, &DecodeOptions::default()).unwrap();
        let keys: Vec<_> = decoded.keys().cloned().collect();
        assert_eq!(keys, vec!["$query", "$orderby"]);
        let sort_keys: Vec<_> = decoded["$orderby"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(sort_keys, vec!["b", "a"]);
    }

    #[test]
    fn test_decode_length_mismatch() {
        let codec = JsonCodec::new();
        let mut encoded = codec.encode(&doc(json!({"a": 1}))).unwrap().to_vec();
        encoded.push(b' ');
        let result = codec.decode(&encoded, &DecodeOptions::default());
        assert!(matches!(result, Err(ProtocolError::InvalidDocument(_))));
    }

    #[test]
    fn test_decode_without_promote_longs() {
        let codec = JsonCodec::new();
        let encoded = codec
            .encode(&doc(json!({"big": 9_000_000_000i64, "small": 7})))
            .unwrap();
        let opts = DecodeOptions {
            promote_longs: false,
            ..DecodeOptions::default()
        };
        let decoded = codec.decode(&encoded, &opts).unwrap();
        assert_eq!(decoded["big"], json!({"$numberLong": "9000000000"}));
        assert_eq!(decoded["small"], json!(7));
    }

    #[test]
    fn test_decode_without_promote_values() {
        let codec = JsonCodec::new();
        let encoded = codec.encode(&doc(json!({"n": [1, "x"]}))).unwrap();
        let opts = DecodeOptions {
            promote_values: false,
            ..DecodeOptions::default()
        };
        let decoded = codec.decode(&encoded, &opts).unwrap();
        assert_eq!(decoded["n"], json!([{"$numberInt": "1"}, "x"]));
    }

    #[test]
    fn test_document_len_errors() {
        assert!(matches!(
            document_len(&[1, 0]),
            Err(ProtocolError::Truncated { needed: 2 })
        ));
        assert!(matches!(
            document_len(&[2, 0, 0, 0]),
            Err(ProtocolError::InvalidDocument(_))
        ));
        assert!(matches!(
            document_len(&[10, 0, 0, 0, b'{']),
            Err(ProtocolError::Truncated { needed: 5 })
        ));
    }

    #[test]
    fn test_to_document_rejects_scalars() {
        assert!(to_document(json!(5)).is_err());
        assert!(to_document(json!({})).unwrap().is_empty());
    }
}
