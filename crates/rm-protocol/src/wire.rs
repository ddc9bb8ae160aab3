//! Self-delimiting binary encoding of [`Value`] trees.
//!
//! # Head byte
//!
//! ```text
//! +------------+-------------------+------------------------------------------+
//! |  bits 7..5 |       bit 4       |                bits 3..0                 |
//! +------------+-------------------+------------------------------------------+
//! |  type tag  | size is in-line   | size (0-15), or byte length of the       |
//! |            |                   | big-endian size integer that follows     |
//! +------------+-------------------+------------------------------------------+
//! ```
//!
//! The size field means: payload byte count for BINARY/STRING, truth value for
//! BOOLEAN, `(byte_len << 1) | sign` for INTEGER, float width for NUMBER, and
//! element/pair count for ITERABLE/MAPPING. Because every value announces its
//! own extent, a whole message is one value and the decoder knows exactly
//! where it ends -- that is the transport framing.
//!
//! The decoder is incremental: [`WireError::Incomplete`] means "keep the
//! buffered bytes and wait for more", every other error means the input can
//! never become a valid value.

use crate::value::Value;

const TAG_NULL: u8 = 0;
const TAG_BINARY: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_BOOLEAN: u8 = 3;
const TAG_INTEGER: u8 = 4;
const TAG_NUMBER: u8 = 5;
const TAG_MAPPING: u8 = 6;
const TAG_ITERABLE: u8 = 7;

const SMALL_FLAG: u8 = 0b0001_0000;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The buffer ends mid-value. Not fatal: more bytes may arrive.
    #[error("input ends mid-value")]
    Incomplete,
    #[error("bad null size {0}")]
    BadNull(u64),
    #[error("bad boolean size {0}")]
    BadBoolean(u64),
    #[error("integer wider than 8 bytes")]
    IntegerOverflow,
    #[error("bad float width {0}")]
    BadNumber(u64),
    #[error("size header wider than 8 bytes")]
    OversizedHeader,
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("mapping key is not a string")]
    NonStringKey,
    #[error("collection announces {0} entries")]
    OversizedCollection(u64),
}

/// Encode a value tree into `out`.
pub fn encode(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => push_head(out, TAG_NULL, 0),
        Value::Binary(b) => {
            push_head(out, TAG_BINARY, b.len() as u64);
            out.extend_from_slice(b);
        }
        Value::Str(s) => {
            push_head(out, TAG_STRING, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bool(b) => push_head(out, TAG_BOOLEAN, u64::from(*b)),
        Value::Int(i) => {
            if *i == 0 {
                push_head(out, TAG_INTEGER, 0);
            } else {
                let sign = u64::from(*i < 0);
                let magnitude = i.unsigned_abs();
                let bytes = magnitude.to_be_bytes();
                let skip = magnitude.leading_zeros() as usize / 8;
                let width = (8 - skip) as u64;
                push_head(out, TAG_INTEGER, (width << 1) | sign);
                out.extend_from_slice(&bytes[skip..]);
            }
        }
        Value::Num(n) => {
            push_head(out, TAG_NUMBER, 4);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Value::Map(entries) => {
            push_head(out, TAG_MAPPING, entries.len() as u64);
            for (key, val) in entries {
                encode(&Value::Str(key.clone()), out);
                encode(val, out);
            }
        }
        Value::List(items) => {
            push_head(out, TAG_ITERABLE, items.len() as u64);
            for item in items {
                encode(item, out);
            }
        }
    }
}

/// Encode a value tree into a fresh buffer.
pub fn to_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode(value, &mut out);
    out
}

/// Decode one value from the front of `buf`, returning it together with the
/// number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(Value, usize), WireError> {
    let mut cursor = Cursor { buf, pos: 0 };
    let value = decode_value(&mut cursor)?;
    Ok((value, cursor.pos))
}

fn push_head(out: &mut Vec<u8>, tag: u8, size: u64) {
    if size < 16 {
        out.push((tag << 5) | SMALL_FLAG | (size as u8));
    } else {
        let bytes = size.to_be_bytes();
        let skip = size.leading_zeros() as usize / 8;
        out.push((tag << 5) | ((8 - skip) as u8));
        out.extend_from_slice(&bytes[skip..]);
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < n {
            return Err(WireError::Incomplete);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_byte(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }
}

fn decode_value(cursor: &mut Cursor<'_>) -> Result<Value, WireError> {
    let head = cursor.take_byte()?;
    let tag = (head & 0b1110_0000) >> 5;
    let size = if head & SMALL_FLAG != 0 {
        u64::from(head & 0b0000_1111)
    } else {
        let width = usize::from(head & 0b0000_1111);
        if width > 8 {
            return Err(WireError::OversizedHeader);
        }
        let mut size: u64 = 0;
        for byte in cursor.take(width)? {
            size = (size << 8) | u64::from(*byte);
        }
        size
    };

    match tag {
        TAG_NULL => {
            if size != 0 {
                return Err(WireError::BadNull(size));
            }
            Ok(Value::Null)
        }
        TAG_BINARY => Ok(Value::Binary(cursor.take(usize_of(size)?)?.to_vec())),
        TAG_STRING => {
            let bytes = cursor.take(usize_of(size)?)?;
            let s = std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)?;
            Ok(Value::Str(s.to_owned()))
        }
        TAG_BOOLEAN => match size {
            0 => Ok(Value::Bool(false)),
            1 => Ok(Value::Bool(true)),
            _ => Err(WireError::BadBoolean(size)),
        },
        TAG_INTEGER => decode_integer(cursor, size),
        TAG_NUMBER => {
            if size != 4 {
                return Err(WireError::BadNumber(size));
            }
            let bytes: [u8; 4] = cursor.take(4)?.try_into().unwrap();
            Ok(Value::Num(f32::from_be_bytes(bytes)))
        }
        TAG_MAPPING => {
            let count = checked_count(size)?;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = match decode_value(cursor)? {
                    Value::Str(s) => s,
                    _ => return Err(WireError::NonStringKey),
                };
                let val = decode_value(cursor)?;
                entries.push((key, val));
            }
            Ok(Value::Map(entries))
        }
        TAG_ITERABLE => {
            let count = checked_count(size)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(cursor)?);
            }
            Ok(Value::List(items))
        }
        _ => unreachable!("tag is three bits"),
    }
}

fn decode_integer(cursor: &mut Cursor<'_>, size: u64) -> Result<Value, WireError> {
    if size == 0 {
        return Ok(Value::Int(0));
    }
    let negative = size & 1 == 1;
    let width = usize_of(size >> 1)?;
    if width > 8 {
        return Err(WireError::IntegerOverflow);
    }
    let mut magnitude: u64 = 0;
    for byte in cursor.take(width)? {
        magnitude = (magnitude << 8) | u64::from(*byte);
    }
    if negative {
        if magnitude > (i64::MAX as u64) + 1 {
            return Err(WireError::IntegerOverflow);
        }
        Ok(Value::Int((magnitude as i128).wrapping_neg() as i64))
    } else {
        if magnitude > i64::MAX as u64 {
            return Err(WireError::IntegerOverflow);
        }
        Ok(Value::Int(magnitude as i64))
    }
}

fn usize_of(size: u64) -> Result<usize, WireError> {
    usize::try_from(size).map_err(|_| WireError::OversizedCollection(size))
}

// Collection counts are bounded before allocation so a corrupt head byte
// cannot request a multi-gigabyte Vec up front.
fn checked_count(size: u64) -> Result<usize, WireError> {
    if size > 1 << 24 {
        return Err(WireError::OversizedCollection(size));
    }
    Ok(size as usize)
}
