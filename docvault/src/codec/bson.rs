//! Document dump codec.
//!
//! The stream is a plain concatenation of documents, one per record, using
//! the BSON element layout so each document is length-prefixed and
//! self-describing:
//!
//! - document: `i32` total length (little-endian, includes itself) + elements + `0x00`
//! - element: 1-byte type tag + NUL-terminated key + payload
//!
//! Every document starts with `_id` (string) and `_updated_at` (UTC datetime),
//! followed by the record's fields in order. Nested objects and arrays are
//! preserved exactly; this is the only lossless format.

use chrono::{DateTime, TimeZone, Utc};

use super::{reject_reserved, Codec, ExportContext, FormatKind};
use crate::record::{Document, Record, Value, ID_FIELD, UPDATED_AT_FIELD};
use crate::utils::errors::{Result, VaultError};

/// Maximum nesting of objects and arrays inside one document.
pub const MAX_DEPTH: usize = 100;

/// Type tags for element payloads.
mod tags {
    pub const DOUBLE: u8 = 0x01;
    pub const STRING: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BOOL: u8 = 0x08;
    pub const DATETIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const INT64: u8 = 0x12;
}

pub struct BsonCodec;

impl Codec for BsonCodec {
    fn kind(&self) -> FormatKind {
        FormatKind::Bson
    }

    fn encode(&self, _ctx: &ExportContext<'_>, records: &[Record]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for record in records {
            reject_reserved(FormatKind::Bson, record)?;
            encode_record(record, &mut buf)?;
        }
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Record>> {
        let mut reader = Reader::new(bytes);
        let mut records = Vec::new();
        while !reader.is_empty() {
            let doc = reader.read_document(0)?;
            records.push(into_record(doc)?);
        }
        Ok(records)
    }
}

fn encode_record(record: &Record, buf: &mut Vec<u8>) -> Result<()> {
    let start = begin_document(buf);
    encode_element(ID_FIELD, &Value::String(record.id.clone()), buf, 0)?;
    encode_element(UPDATED_AT_FIELD, &Value::Timestamp(record.updated_at), buf, 0)?;
    for (key, value) in record.fields.iter() {
        encode_element(key, value, buf, 0)?;
    }
    end_document(buf, start)
}

/// Reserve the length prefix and return its offset.
fn begin_document(buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    start
}

/// Write the trailing NUL and patch the length prefix.
fn end_document(buf: &mut Vec<u8>, start: usize) -> Result<()> {
    buf.push(0x00);
    let len = i32::try_from(buf.len() - start)
        .map_err(|_| VaultError::format("bson", "document exceeds 2 GiB"))?;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

fn encode_element(key: &str, value: &Value, buf: &mut Vec<u8>, depth: usize) -> Result<()> {
    if key.as_bytes().contains(&0) {
        return Err(VaultError::format(
            "bson",
            format!("field name {:?} contains a NUL byte", key),
        ));
    }

    let tag = match value {
        Value::Null => tags::NULL,
        Value::Bool(_) => tags::BOOL,
        Value::Int(_) => tags::INT64,
        Value::Float(_) => tags::DOUBLE,
        Value::String(_) => tags::STRING,
        Value::Timestamp(_) => tags::DATETIME,
        Value::Object(_) => tags::DOCUMENT,
        Value::Array(_) => tags::ARRAY,
    };
    buf.push(tag);
    buf.extend_from_slice(key.as_bytes());
    buf.push(0x00);

    match value {
        Value::Null => {}
        Value::Bool(b) => buf.push(u8::from(*b)),
        Value::Int(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Float(f) => buf.extend_from_slice(&f.to_le_bytes()),
        Value::String(s) => {
            let len = i32::try_from(s.len() + 1)
                .map_err(|_| VaultError::format("bson", "string exceeds 2 GiB"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            buf.push(0x00);
        }
        Value::Timestamp(ts) => buf.extend_from_slice(&ts.timestamp_millis().to_le_bytes()),
        Value::Object(doc) => {
            check_depth(depth + 1)?;
            let start = begin_document(buf);
            for (k, v) in doc.iter() {
                encode_element(k, v, buf, depth + 1)?;
            }
            end_document(buf, start)?;
        }
        Value::Array(items) => {
            check_depth(depth + 1)?;
            let start = begin_document(buf);
            for (idx, item) in items.iter().enumerate() {
                encode_element(&idx.to_string(), item, buf, depth + 1)?;
            }
            end_document(buf, start)?;
        }
    }
    Ok(())
}

fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(VaultError::format(
            "bson",
            format!("value nesting exceeds {} levels", MAX_DEPTH),
        ));
    }
    Ok(())
}

fn into_record(mut doc: Document) -> Result<Record> {
    let id = match doc.remove(ID_FIELD) {
        Some(Value::String(s)) => s,
        _ => return Err(VaultError::corrupt("document without a string '_id'")),
    };
    let updated_at = match doc.remove(UPDATED_AT_FIELD) {
        Some(Value::Timestamp(ts)) => ts,
        _ => {
            return Err(VaultError::corrupt(format!(
                "document '{}' without an '_updated_at' datetime",
                id
            )))
        }
    };
    Ok(Record {
        id,
        updated_at,
        fields: doc,
    })
}

/// Bounds-checked cursor over the encoded stream.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| {
                VaultError::corrupt(format!(
                    "unexpected end of document stream at byte {}",
                    self.pos
                ))
            })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(i32::from_le_bytes(raw))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(raw))
    }

    fn f64(&mut self) -> Result<f64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(raw))
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| VaultError::corrupt("unterminated field name"))?;
        let raw = self.take(nul + 1)?;
        String::from_utf8(raw[..nul].to_vec())
            .map_err(|_| VaultError::corrupt("field name is not UTF-8"))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.i32()?;
        if len < 1 {
            return Err(VaultError::corrupt(format!("invalid string length {}", len)));
        }
        let raw = self.take(len as usize)?;
        if raw[raw.len() - 1] != 0 {
            return Err(VaultError::corrupt("string is not NUL-terminated"));
        }
        String::from_utf8(raw[..raw.len() - 1].to_vec())
            .map_err(|_| VaultError::corrupt("string is not UTF-8"))
    }

    fn read_document(&mut self, depth: usize) -> Result<Document> {
        if depth > MAX_DEPTH {
            return Err(VaultError::corrupt("document nesting too deep"));
        }
        let start = self.pos;
        let len = self.i32()?;
        if len < 5 {
            return Err(VaultError::corrupt(format!("invalid document length {}", len)));
        }
        let end = start + len as usize;
        if end > self.bytes.len() {
            return Err(VaultError::corrupt(format!(
                "document at byte {} claims {} bytes but only {} remain",
                start,
                len,
                self.bytes.len() - start
            )));
        }

        let mut doc = Document::new();
        loop {
            let tag = self.u8()?;
            if tag == 0x00 {
                break;
            }
            let key = self.cstring()?;
            let value = self.read_value(tag, depth)?;
            doc.insert(key, value);
            if self.pos >= end {
                return Err(VaultError::corrupt("document overruns its declared length"));
            }
        }

        if self.pos != end {
            return Err(VaultError::corrupt(format!(
                "document at byte {} has length mismatch",
                start
            )));
        }
        Ok(doc)
    }

    fn read_value(&mut self, tag: u8, depth: usize) -> Result<Value> {
        Ok(match tag {
            tags::NULL => Value::Null,
            tags::BOOL => match self.u8()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(VaultError::corrupt(format!("invalid bool byte {}", other))),
            },
            tags::INT64 => Value::Int(self.i64()?),
            tags::DOUBLE => Value::Float(self.f64()?),
            tags::STRING => Value::String(self.string()?),
            tags::DATETIME => {
                let millis = self.i64()?;
                Value::Timestamp(datetime_from_millis(millis)?)
            }
            tags::DOCUMENT => Value::Object(self.read_document(depth + 1)?),
            tags::ARRAY => {
                let doc = self.read_document(depth + 1)?;
                Value::Array(doc.iter().map(|(_, v)| v.clone()).collect())
            }
            other => {
                return Err(VaultError::corrupt(format!(
                    "unknown element type 0x{:02x}",
                    other
                )))
            }
        })
    }
}

fn datetime_from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| VaultError::corrupt(format!("datetime {} out of range", millis)))
}
