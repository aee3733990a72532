//! # Document Binary Codec
//!
//! Deterministic, self-delimiting encoding for documents. The layout is
//! element-oriented:
//!
//! ```text
//! document := total_len:u32  element*  0x00
//! element  := type:u8  name:cstring  payload
//! ```
//!
//! `total_len` covers the whole encoding including itself and the trailing
//! terminator, so a decoder (and the catalog loader) can size a document from
//! its first four bytes. All integers are little-endian.
//!
//! ## Element types
//!
//! | Byte | Type      | Payload                                   |
//! |------|-----------|-------------------------------------------|
//! | 0x01 | Double    | f64 bits                                  |
//! | 0x02 | String    | u32 len (incl. NUL) + bytes + 0x00        |
//! | 0x03 | Document  | nested document                           |
//! | 0x04 | Array     | document keyed "0", "1", ...              |
//! | 0x05 | Binary    | u32 len + subtype u8 + bytes              |
//! | 0x07 | ObjectId  | 12 bytes                                  |
//! | 0x08 | Bool      | 0x00 / 0x01                               |
//! | 0x09 | DateTime  | i64 millis                                |
//! | 0x0A | Null      | none                                      |
//! | 0x0B | Regex     | pattern cstring + options cstring         |
//! | 0x10 | Int32     | i32                                       |
//! | 0x11 | Timestamp | u32 increment + u32 seconds               |
//! | 0x12 | Int64     | i64                                       |
//! | 0x7F | MaxKey    | none                                      |
//! | 0xFF | MinKey    | none                                      |
//!
//! Index keys reuse the same payload encoding without the name, via
//! `encode_value` (one type byte then the payload).

use eyre::{bail, ensure, Result};

use super::{Document, ObjectId, Value};

const TYPE_DOUBLE: u8 = 0x01;
const TYPE_STRING: u8 = 0x02;
const TYPE_DOCUMENT: u8 = 0x03;
const TYPE_ARRAY: u8 = 0x04;
const TYPE_BINARY: u8 = 0x05;
const TYPE_OBJECT_ID: u8 = 0x07;
const TYPE_BOOL: u8 = 0x08;
const TYPE_DATETIME: u8 = 0x09;
const TYPE_NULL: u8 = 0x0A;
const TYPE_REGEX: u8 = 0x0B;
const TYPE_INT32: u8 = 0x10;
const TYPE_TIMESTAMP: u8 = 0x11;
const TYPE_INT64: u8 = 0x12;
const TYPE_MAX_KEY: u8 = 0x7F;
const TYPE_MIN_KEY: u8 = 0xFF;

/// Encodes a document to its canonical byte form.
pub fn encode_document(doc: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    write_document(&mut buf, doc)?;
    Ok(buf)
}

/// Reads the declared length of an encoded document from its leading u32.
pub fn encoded_len(bytes: &[u8]) -> Result<usize> {
    ensure!(bytes.len() >= 4, "document encoding shorter than 4 bytes");
    Ok(u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize)
}

/// Decodes a document from bytes produced by [`encode_document`].
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    let len = encoded_len(bytes)?;
    ensure!(
        len >= 5 && len <= bytes.len(),
        "declared document length {} out of range (buffer {})",
        len,
        bytes.len()
    );
    let mut cursor = Cursor {
        buf: &bytes[..len],
        pos: 4,
    };
    let doc = read_document_body(&mut cursor)?;
    Ok(doc)
}

/// Encodes a bare value (type byte + payload, no field name). This is the
/// unit of index key construction.
pub fn encode_value(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    buf.push(type_byte(value));
    write_payload(buf, value)
}

fn type_byte(value: &Value) -> u8 {
    match value {
        Value::Double(_) => TYPE_DOUBLE,
        Value::String(_) => TYPE_STRING,
        Value::Document(_) => TYPE_DOCUMENT,
        Value::Array(_) => TYPE_ARRAY,
        Value::Binary(..) => TYPE_BINARY,
        Value::ObjectId(_) => TYPE_OBJECT_ID,
        Value::Bool(_) => TYPE_BOOL,
        Value::DateTime(_) => TYPE_DATETIME,
        Value::Null => TYPE_NULL,
        Value::Regex(..) => TYPE_REGEX,
        Value::Int32(_) => TYPE_INT32,
        Value::Timestamp(..) => TYPE_TIMESTAMP,
        Value::Int64(_) => TYPE_INT64,
        Value::MaxKey => TYPE_MAX_KEY,
        Value::MinKey => TYPE_MIN_KEY,
    }
}

fn write_document(buf: &mut Vec<u8>, doc: &Document) -> Result<()> {
    let start = buf.len();
    buf.extend_from_slice(&0u32.to_le_bytes());
    for (name, value) in doc.iter() {
        buf.push(type_byte(value));
        write_cstring(buf, name)?;
        write_payload(buf, value)?;
    }
    buf.push(0x00);
    let total = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&total.to_le_bytes());
    Ok(())
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    ensure!(
        !s.as_bytes().contains(&0),
        "field name contains a NUL byte: {:?}",
        s
    );
    buf.extend_from_slice(s.as_bytes());
    buf.push(0x00);
    Ok(())
}

fn write_payload(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null | Value::MinKey | Value::MaxKey => {}
        Value::Bool(b) => buf.push(*b as u8),
        Value::Int32(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Int64(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Double(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::DateTime(v) => buf.extend_from_slice(&v.to_le_bytes()),
        Value::Timestamp(inc, secs) => {
            buf.extend_from_slice(&inc.to_le_bytes());
            buf.extend_from_slice(&secs.to_le_bytes());
        }
        Value::String(s) => {
            let len = (s.len() + 1) as u32;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
            buf.push(0x00);
        }
        Value::Binary(subtype, data) => {
            buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
            buf.push(*subtype);
            buf.extend_from_slice(data);
        }
        Value::ObjectId(oid) => buf.extend_from_slice(oid.bytes()),
        Value::Regex(pattern, options) => {
            write_cstring(buf, pattern)?;
            write_cstring(buf, options)?;
        }
        Value::Document(doc) => write_document(buf, doc)?,
        Value::Array(items) => {
            let mut as_doc = Document::new();
            for (i, item) in items.iter().enumerate() {
                as_doc.insert(i.to_string(), item.clone());
            }
            write_document(buf, &as_doc)?;
        }
    }
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.buf.len(),
            "truncated document: need {} bytes at offset {}, have {}",
            n,
            self.pos,
            self.buf.len() - self.pos
        );
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn cstring(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| eyre::eyre!("unterminated cstring at offset {}", self.pos))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| eyre::eyre!("invalid utf-8 in cstring: {}", e))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }
}

fn read_document_body(cursor: &mut Cursor<'_>) -> Result<Document> {
    let mut doc = Document::new();
    loop {
        let ty = cursor.u8()?;
        if ty == 0x00 {
            return Ok(doc);
        }
        let name = cursor.cstring()?;
        let value = read_payload(cursor, ty)?;
        doc.insert(name, value);
    }
}

fn read_payload(cursor: &mut Cursor<'_>, ty: u8) -> Result<Value> {
    let value = match ty {
        TYPE_NULL => Value::Null,
        TYPE_MIN_KEY => Value::MinKey,
        TYPE_MAX_KEY => Value::MaxKey,
        TYPE_BOOL => Value::Bool(cursor.u8()? != 0),
        TYPE_INT32 => Value::Int32(cursor.i32()?),
        TYPE_INT64 => Value::Int64(cursor.i64()?),
        TYPE_DOUBLE => Value::Double(f64::from_le_bytes(cursor.take(8)?.try_into().unwrap())),
        TYPE_DATETIME => Value::DateTime(cursor.i64()?),
        TYPE_TIMESTAMP => {
            let inc = cursor.u32()?;
            let secs = cursor.u32()?;
            Value::Timestamp(inc, secs)
        }
        TYPE_STRING => {
            let len = cursor.u32()? as usize;
            ensure!(len >= 1, "string length must include the terminator");
            let bytes = cursor.take(len)?;
            ensure!(bytes[len - 1] == 0, "string missing NUL terminator");
            let s = std::str::from_utf8(&bytes[..len - 1])
                .map_err(|e| eyre::eyre!("invalid utf-8 in string: {}", e))?;
            Value::String(s.to_string())
        }
        TYPE_BINARY => {
            let len = cursor.u32()? as usize;
            let subtype = cursor.u8()?;
            Value::Binary(subtype, cursor.take(len)?.to_vec())
        }
        TYPE_OBJECT_ID => {
            let bytes: [u8; 12] = cursor.take(12)?.try_into().unwrap();
            Value::ObjectId(ObjectId::from_bytes(bytes))
        }
        TYPE_REGEX => {
            let pattern = cursor.cstring()?;
            let options = cursor.cstring()?;
            Value::Regex(pattern, options)
        }
        TYPE_DOCUMENT => {
            let len = cursor.u32()? as usize;
            ensure!(len >= 5, "nested document too short: {}", len);
            // The cursor already consumed the length prefix; the body is
            // len - 4 bytes including the terminator.
            let body_end = cursor.pos + len - 4;
            ensure!(
                body_end <= cursor.buf.len(),
                "nested document overruns buffer"
            );
            let doc = read_document_body(cursor)?;
            ensure!(
                cursor.pos == body_end,
                "nested document length mismatch: declared end {}, read to {}",
                body_end,
                cursor.pos
            );
            Value::Document(doc)
        }
        TYPE_ARRAY => {
            let len = cursor.u32()? as usize;
            ensure!(len >= 5, "array encoding too short: {}", len);
            let body_end = cursor.pos + len - 4;
            ensure!(body_end <= cursor.buf.len(), "array overruns buffer");
            let doc = read_document_body(cursor)?;
            ensure!(cursor.pos == body_end, "array length mismatch");
            let mut items = Vec::with_capacity(doc.len());
            for (_, v) in doc.iter() {
                items.push(v.clone());
            }
            Value::Array(items)
        }
        other => bail!("unknown element type 0x{:02X}", other),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn round_trip(doc: &Document) -> Document {
        let bytes = encode_document(doc).unwrap();
        decode_document(&bytes).unwrap()
    }

    #[test]
    fn empty_document_round_trips() {
        let doc = Document::new();
        let bytes = encode_document(&doc).unwrap();

        assert_eq!(bytes.len(), 5);
        assert_eq!(encoded_len(&bytes).unwrap(), 5);
        assert_eq!(round_trip(&doc), doc);
    }

    #[test]
    fn scalar_fields_round_trip() {
        let doc = doc! {
            "null" => Value::Null,
            "bool" => true,
            "i32" => 42,
            "i64" => Value::Int64(1 << 40),
            "f64" => 2.5,
            "str" => "hello",
            "date" => Value::DateTime(1_700_000_000_000),
            "ts" => Value::Timestamp(7, 1_700_000_000),
            "min" => Value::MinKey,
            "max" => Value::MaxKey,
        };

        assert_eq!(round_trip(&doc), doc);
    }

    #[test]
    fn nested_structures_round_trip() {
        let doc = doc! {
            "inner" => doc! { "a" => 1, "b" => "two" },
            "list" => vec![Value::Int32(1), Value::String("x".into()),
                           Value::Document(doc! { "deep" => true })],
            "bin" => Value::Binary(0, vec![1, 2, 3, 255]),
            "re" => Value::Regex("^a.*b$".into(), "i".into()),
        };

        assert_eq!(round_trip(&doc), doc);
    }

    #[test]
    fn object_id_round_trips() {
        let oid = ObjectId::generate();
        let doc = doc! { "_id" => oid };

        assert_eq!(round_trip(&doc).get("_id"), Some(&Value::ObjectId(oid)));
    }

    #[test]
    fn field_order_survives_round_trip() {
        let doc = doc! { "z" => 1, "a" => 2, "m" => 3 };
        let decoded = round_trip(&doc);

        let keys: Vec<&str> = decoded.keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn encoding_is_deterministic() {
        let doc = doc! { "a" => 1, "b" => doc! { "c" => "x" } };

        assert_eq!(encode_document(&doc).unwrap(), encode_document(&doc).unwrap());
    }

    #[test]
    fn declared_length_matches_buffer() {
        let doc = doc! { "a" => 1, "s" => "abc" };
        let bytes = encode_document(&doc).unwrap();

        assert_eq!(encoded_len(&bytes).unwrap(), bytes.len());
    }

    #[test]
    fn truncated_buffer_fails() {
        let doc = doc! { "a" => 1 };
        let bytes = encode_document(&doc).unwrap();

        assert!(decode_document(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn unknown_type_byte_fails() {
        let doc = doc! { "a" => 1 };
        let mut bytes = encode_document(&doc).unwrap();
        bytes[4] = 0x63;

        assert!(decode_document(&bytes).is_err());
    }

    #[test]
    fn nul_in_field_name_is_rejected() {
        let mut doc = Document::new();
        doc.insert("bad\0name", 1);

        assert!(encode_document(&doc).is_err());
    }

    #[test]
    fn bare_value_encoding_differs_by_type() {
        let mut a = Vec::new();
        let mut b = Vec::new();
        encode_value(&mut a, &Value::Int32(1)).unwrap();
        encode_value(&mut b, &Value::Int64(1)).unwrap();

        assert_ne!(a, b);
    }
}
