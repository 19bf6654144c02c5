//! Canonical decoder: one left-to-right scan dispatched on the lookahead byte.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::CodecError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes exactly one value occupying the whole input.
///
/// # Errors
///
/// - `CodecError::TrailingData` - If bytes remain after the first value
/// - Any error from [`decode_prefix`]
pub fn decode(data: &[u8]) -> Result<Value, CodecError> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(CodecError::TrailingData {
            remaining: data.len() - consumed,
        });
    }
    Ok(value)
}

/// Decodes the first value in `data`, returning it with the number of bytes consumed.
///
/// # Errors
///
/// - `CodecError::UnexpectedEof` - If a value runs past the end of the buffer
/// - `CodecError::InvalidInteger` - If an integer is empty, non-numeric, zero-padded or `-0`
/// - `CodecError::InvalidStringLength` - If a length prefix is malformed
/// - `CodecError::UnexpectedByte` - If an unknown lead byte or a non-string map key is found
/// - `CodecError::UnsortedKeys` / `CodecError::DuplicateKey` - If a map is not canonical
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), CodecError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, CodecError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEof { offset: self.pos })
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::NestingTooDeep {
                max_depth: MAX_DEPTH,
            });
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.map(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            byte => Err(CodecError::UnexpectedByte {
                offset: self.pos,
                byte,
            }),
        }
    }

    /// Scans up to `terminator`, returning the bytes in between and skipping the terminator.
    fn take_until(&mut self, terminator: u8) -> Result<&'a [u8], CodecError> {
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&byte| byte == terminator)
            .map(|relative| start + relative)
            .ok_or(CodecError::UnexpectedEof {
                offset: self.data.len(),
            })?;
        self.pos = end + 1;
        Ok(&self.data[start..end])
    }

    fn integer(&mut self) -> Result<Value, CodecError> {
        let offset = self.pos;
        self.pos += 1;
        let digits = self.take_until(b'e')?;

        let invalid = |reason| CodecError::InvalidInteger { offset, reason };
        let magnitude = match digits {
            [] => return Err(invalid("empty")),
            [b'-', rest @ ..] => rest,
            rest => rest,
        };
        if magnitude.is_empty() || !magnitude.iter().all(u8::is_ascii_digit) {
            return Err(invalid("non-digit"));
        }
        if magnitude[0] == b'0' && magnitude.len() > 1 {
            return Err(invalid("leading zero"));
        }
        if digits[0] == b'-' && magnitude == b"0" {
            return Err(invalid("negative zero"));
        }

        // Only ASCII digits and an optional sign remain, so this is valid UTF-8
        let text = std::str::from_utf8(digits).map_err(|_| invalid("non-digit"))?;
        text.parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("out of range"))
    }

    fn bytes(&mut self) -> Result<Bytes, CodecError> {
        let offset = self.pos;
        let digits = self.take_until(b':')?;

        let invalid = CodecError::InvalidStringLength { offset };
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(invalid);
        }
        if digits[0] == b'0' && digits.len() > 1 {
            return Err(invalid);
        }
        let length: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or(invalid)?;

        let end = self
            .pos
            .checked_add(length)
            .filter(|&end| end <= self.data.len())
            .ok_or(CodecError::UnexpectedEof {
                offset: self.data.len(),
            })?;
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }

    fn list(&mut self, depth: usize) -> Result<Value, CodecError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn map(&mut self, depth: usize) -> Result<Value, CodecError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        let mut previous: Option<Bytes> = None;

        while self.peek()? != b'e' {
            let key_offset = self.pos;
            let lead = self.peek()?;
            if !lead.is_ascii_digit() {
                return Err(CodecError::UnexpectedByte {
                    offset: key_offset,
                    byte: lead,
                });
            }
            let key = self.bytes()?;

            if let Some(previous) = &previous {
                if key == *previous {
                    return Err(CodecError::DuplicateKey { offset: key_offset });
                }
                if key < *previous {
                    return Err(CodecError::UnsortedKeys { offset: key_offset });
                }
            }

            let value = self.value(depth + 1)?;
            previous = Some(key.clone());
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Map(map))
    }
}
