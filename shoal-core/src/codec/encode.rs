//! Canonical encoder.

use bytes::BufMut;

use super::value::Value;

/// Encodes a value into canonical bytes.
///
/// Encoding is infallible: every `Value` has exactly one canonical form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(number) => {
            buf.put_u8(b'i');
            buf.put_slice(number.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(bytes) => encode_bytes(bytes, buf),
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Map(map) => {
            // BTreeMap iteration is already ascending by raw key bytes
            buf.put_u8(b'd');
            for (key, item) in map {
                encode_bytes(key, buf);
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}
