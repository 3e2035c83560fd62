// dynamotool/src/record.rs
//! Item model and the artifact line codec.
//!
//! Artifacts hold one item per line in DynamoDB attribute-value JSON, e.g.
//! `{"id":{"S":"a"},"count":{"N":"3"}}`.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    S(String),
    N(String),
    B(Vec<u8>),
    Bool(bool),
    Null,
    L(Vec<AttrValue>),
    M(BTreeMap<String, AttrValue>),
    Ss(Vec<String>),
    Ns(Vec<String>),
    Bs(Vec<Vec<u8>>),
}

pub type Record = BTreeMap<String, AttrValue>;

/// How binary attribute values are written into an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryEncoding {
    /// JSON array of byte values.
    Raw,
    #[default]
    Base64,
}

fn encode_binary(bytes: &[u8], encoding: BinaryEncoding) -> Value {
    match encoding {
        BinaryEncoding::Base64 => Value::String(BASE64.encode(bytes)),
        BinaryEncoding::Raw => Value::Array(bytes.iter().map(|b| json!(b)).collect()),
    }
}

/// Accepts base64 strings, plain byte arrays and `{"type":"Buffer","data":[..]}`.
fn decode_binary(value: &Value) -> Result<Vec<u8>> {
    match value {
        Value::String(s) => BASE64
            .decode(s)
            .map_err(|e| AppError::Codec(format!("invalid base64 binary value: {}", e))),
        Value::Array(items) => decode_byte_array(items),
        Value::Object(buffer) if buffer.get("type").and_then(Value::as_str) == Some("Buffer") => {
            match buffer.get("data") {
                Some(Value::Array(items)) => decode_byte_array(items),
                _ => Err(AppError::Codec(format!("buffer value without byte data: {}", value))),
            }
        }
        other => Err(AppError::Codec(format!("unsupported binary value: {}", other))),
    }
}

fn decode_byte_array(items: &[Value]) -> Result<Vec<u8>> {
    items
        .iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| AppError::Codec(format!("invalid byte in binary value: {}", v)))
        })
        .collect()
}

impl AttrValue {
    pub fn to_json(&self, encoding: BinaryEncoding) -> Value {
        match self {
            AttrValue::S(s) => json!({ "S": s }),
            AttrValue::N(n) => json!({ "N": n }),
            AttrValue::B(b) => json!({ "B": encode_binary(b, encoding) }),
            AttrValue::Bool(b) => json!({ "BOOL": b }),
            AttrValue::Null => json!({ "NULL": true }),
            AttrValue::L(items) => {
                json!({ "L": items.iter().map(|v| v.to_json(encoding)).collect::<Vec<_>>() })
            }
            AttrValue::M(map) => json!({ "M": map_to_json(map, encoding) }),
            AttrValue::Ss(items) => json!({ "SS": items }),
            AttrValue::Ns(items) => json!({ "NS": items }),
            AttrValue::Bs(items) => json!({
                "BS": items.iter().map(|b| encode_binary(b, encoding)).collect::<Vec<_>>()
            }),
        }
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| AppError::Codec(format!("expected a single-key type descriptor, got {}", value)))?;
        let (tag, inner) = obj
            .iter()
            .next()
            .ok_or_else(|| AppError::Codec("empty type descriptor".to_string()))?;

        let value = match tag.as_str() {
            "S" => AttrValue::S(expect_str(inner)?.to_string()),
            "N" => AttrValue::N(expect_str(inner)?.to_string()),
            "B" => AttrValue::B(decode_binary(inner)?),
            "BOOL" => AttrValue::Bool(
                inner
                    .as_bool()
                    .ok_or_else(|| AppError::Codec(format!("BOOL expects a boolean, got {}", inner)))?,
            ),
            "NULL" => AttrValue::Null,
            "L" => AttrValue::L(
                expect_array(inner)?
                    .iter()
                    .map(AttrValue::from_json)
                    .collect::<Result<_>>()?,
            ),
            "M" => AttrValue::M(map_from_json(inner)?),
            "SS" => AttrValue::Ss(string_set(inner)?),
            "NS" => AttrValue::Ns(string_set(inner)?),
            "BS" => AttrValue::Bs(
                expect_array(inner)?
                    .iter()
                    .map(decode_binary)
                    .collect::<Result<_>>()?,
            ),
            other => return Err(AppError::Codec(format!("unknown attribute type '{}'", other))),
        };
        Ok(value)
    }
}

fn expect_str(value: &Value) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| AppError::Codec(format!("expected a string, got {}", value)))
}

fn expect_array(value: &Value) -> Result<&Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| AppError::Codec(format!("expected an array, got {}", value)))
}

fn string_set(value: &Value) -> Result<Vec<String>> {
    expect_array(value)?
        .iter()
        .map(|v| expect_str(v).map(str::to_string))
        .collect()
}

fn map_to_json(map: &Record, encoding: BinaryEncoding) -> Value {
    let mut out = Map::with_capacity(map.len());
    for (name, value) in map {
        out.insert(name.clone(), value.to_json(encoding));
    }
    Value::Object(out)
}

fn map_from_json(value: &Value) -> Result<Record> {
    let obj = value
        .as_object()
        .ok_or_else(|| AppError::Codec(format!("expected an object, got {}", value)))?;
    obj.iter()
        .map(|(name, v)| Ok((name.clone(), AttrValue::from_json(v)?)))
        .collect()
}

/// Serialises one item as an artifact line, newline included.
pub fn encode_line(record: &Record, encoding: BinaryEncoding) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(&map_to_json(record, encoding))?;
    line.push(b'\n');
    Ok(line)
}

/// Parses one artifact line. Blank lines yield `None`.
pub fn decode_line(line: &str) -> Result<Option<Record>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    map_from_json(&value).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        let mut nested = Record::new();
        nested.insert("flag".into(), AttrValue::Bool(true));
        nested.insert("nothing".into(), AttrValue::Null);

        let mut record = Record::new();
        record.insert("id".into(), AttrValue::S("user#1".into()));
        record.insert("age".into(), AttrValue::N("42".into()));
        record.insert("avatar".into(), AttrValue::B(vec![0, 159, 255]));
        record.insert("tags".into(), AttrValue::Ss(vec!["a".into(), "b".into()]));
        record.insert("scores".into(), AttrValue::Ns(vec!["1".into(), "2.5".into()]));
        record.insert("blobs".into(), AttrValue::Bs(vec![vec![1], vec![2, 3]]));
        record.insert(
            "history".into(),
            AttrValue::L(vec![AttrValue::S("x".into()), AttrValue::M(nested.clone())]),
        );
        record.insert("meta".into(), AttrValue::M(nested));
        record
    }

    #[test]
    fn test_base64_binary_is_written_as_a_string() -> anyhow::Result<()> {
        let mut record = Record::new();
        record.insert("b".into(), AttrValue::B(vec![0, 159, 255]));
        let line = encode_line(&record, BinaryEncoding::Base64)?;
        assert_eq!(std::str::from_utf8(&line)?, "{\"b\":{\"B\":\"AJ//\"}}\n");
        Ok(())
    }

    #[test]
    fn test_raw_binary_is_written_as_byte_array() -> anyhow::Result<()> {
        let mut record = Record::new();
        record.insert("b".into(), AttrValue::B(vec![1, 2]));
        let line = encode_line(&record, BinaryEncoding::Raw)?;
        assert_eq!(std::str::from_utf8(&line)?, "{\"b\":{\"B\":[1,2]}}\n");
        Ok(())
    }

    #[test]
    fn test_both_binary_encodings_decode_to_the_same_item() -> anyhow::Result<()> {
        let record = sample();
        for encoding in [BinaryEncoding::Base64, BinaryEncoding::Raw] {
            let line = encode_line(&record, encoding)?;
            let decoded = decode_line(std::str::from_utf8(&line)?)?;
            assert_eq!(decoded, Some(record.clone()));
        }
        Ok(())
    }

    #[test]
    fn test_buffer_shaped_binary_values_are_accepted() -> anyhow::Result<()> {
        let line = r#"{"b":{"B":{"type":"Buffer","data":[0,159,255]}}}"#;
        let decoded = decode_line(line)?.expect("one item");
        assert_eq!(decoded.get("b"), Some(&AttrValue::B(vec![0, 159, 255])));

        let bad = r#"{"b":{"B":{"type":"Buffer","data":"AJ//"}}}"#;
        assert!(matches!(decode_line(bad), Err(AppError::Codec(_))));
        Ok(())
    }

    #[test]
    fn test_blank_lines_are_ignored() -> anyhow::Result<()> {
        assert_eq!(decode_line("   ")?, None);
        assert_eq!(decode_line("")?, None);
        Ok(())
    }

    #[test]
    fn test_malformed_lines_are_codec_errors() {
        assert!(matches!(
            decode_line("{\"id\":{\"X\":\"1\"}}"),
            Err(AppError::Codec(_))
        ));
        assert!(matches!(
            decode_line("{\"id\":{\"S\":\"1\",\"N\":\"2\"}}"),
            Err(AppError::Codec(_))
        ));
        assert!(matches!(
            decode_line("{\"id\":{\"B\":[300]}}"),
            Err(AppError::Codec(_))
        ));
        assert!(matches!(decode_line("not json"), Err(AppError::SerdeJson(_))));
    }

    #[test]
    fn test_binary_encoding_deserialises_from_lowercase_names() -> anyhow::Result<()> {
        let raw: BinaryEncoding = serde_json::from_str("\"raw\"")?;
        let b64: BinaryEncoding = serde_json::from_str("\"base64\"")?;
        assert_eq!(raw, BinaryEncoding::Raw);
        assert_eq!(b64, BinaryEncoding::Base64);
        Ok(())
    }
}
