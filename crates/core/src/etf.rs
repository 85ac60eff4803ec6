//! Erlang External Term Format codec
//!
//! Compact, self-describing binary encoding used as the alternative wire
//! format on the streaming connection. A well-formed buffer is a single
//! version byte (131) followed by exactly one tagged term; containers nest
//! recursively. All multi-byte integers are big-endian on the wire.
//!
//! Encode and decode are stateless: each call operates on one fresh
//! buffer/value pair, there is no atom cache across calls. Big integers are
//! limited to 8 bytes of magnitude; wider terms are rejected as a parse
//! error rather than silently truncated.

use thiserror::Error;
use tracing::trace;

use crate::value::Value;

/// ETF format version byte
pub const FORMAT_VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// ETF decode failures
///
/// A malformed buffer never becomes well-formed, so these are never retried;
/// they propagate straight to the caller.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EtfError {
    #[error("Read past end of buffer while decoding {0}")]
    UnexpectedEnd(&'static str),

    #[error("Incorrect format version: expected 131, found {0}")]
    WrongVersion(u8),

    #[error("Unknown term tag: {0}")]
    UnknownTag(u8),

    #[error("Big integer of {0} bytes exceeds the 8-byte limit")]
    BigIntegerTooLarge(usize),

    #[error("Negative big integer does not fit a 64-bit signed value")]
    BigIntegerOutOfRange,

    #[error("Invalid UTF-8 in {0} term")]
    InvalidUtf8(&'static str),

    #[error("Map key is not a string term")]
    InvalidMapKey,

    #[error("List term is not nil-terminated")]
    ImproperList,
}

pub type Result<T> = std::result::Result<T, EtfError>;

/// Encode a value to ETF bytes, version byte included
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(FORMAT_VERSION);
    encode_term(value, &mut out);
    out
}

fn encode_term(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => append_atom(out, "nil"),
        Value::Bool(true) => append_atom(out, "true"),
        Value::Bool(false) => append_atom(out, "false"),
        Value::Uint(v) => append_uint(out, *v),
        Value::Int(v) => append_int(out, *v),
        Value::Float(v) => {
            out.push(NEW_FLOAT_EXT);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::String(s) => append_binary(out, s.as_bytes()),
        Value::Array(values) => {
            out.push(LIST_EXT);
            out.extend_from_slice(&(values.len() as u32).to_be_bytes());
            for value in values {
                encode_term(value, out);
            }
            // Proper lists carry a nil tail on the wire
            out.push(NIL_EXT);
        }
        Value::Map(pairs) => {
            out.push(MAP_EXT);
            out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
            for (key, value) in pairs {
                append_binary(out, key.as_bytes());
                encode_term(value, out);
            }
        }
    }
}

fn append_atom(out: &mut Vec<u8>, name: &str) {
    out.push(SMALL_ATOM_UTF8_EXT);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

fn append_binary(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(BINARY_EXT);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn append_uint(out: &mut Vec<u8>, value: u64) {
    if value <= u8::MAX as u64 {
        out.push(SMALL_INTEGER_EXT);
        out.push(value as u8);
    } else if value <= i32::MAX as u64 {
        out.push(INTEGER_EXT);
        out.extend_from_slice(&(value as i32).to_be_bytes());
    } else {
        append_small_big(out, value, 0);
    }
}

fn append_int(out: &mut Vec<u8>, value: i64) {
    if value >= 0 {
        append_uint(out, value as u64);
    } else if value >= i32::MIN as i64 {
        out.push(INTEGER_EXT);
        out.extend_from_slice(&(value as i32).to_be_bytes());
    } else {
        append_small_big(out, value.unsigned_abs(), 1);
    }
}

/// Sign byte, then little-endian magnitude bytes with the count up front
fn append_small_big(out: &mut Vec<u8>, magnitude: u64, sign: u8) {
    let bytes = magnitude.to_le_bytes();
    let count = (8 - magnitude.leading_zeros() as usize / 8).max(1);
    out.push(SMALL_BIG_EXT);
    out.push(count as u8);
    out.push(sign);
    out.extend_from_slice(&bytes[..count]);
}

/// Decode one value from ETF bytes, version byte included
pub fn decode(buffer: &[u8]) -> Result<Value> {
    trace!(bytes = buffer.len(), "decoding etf buffer");
    let mut decoder = Decoder {
        buffer,
        offset: 0,
    };
    let version = decoder.read_u8("version")?;
    if version != FORMAT_VERSION {
        return Err(EtfError::WrongVersion(version));
    }
    decoder.decode_term()
}

struct Decoder<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    fn read_u8(&mut self, context: &'static str) -> Result<u8> {
        Ok(self.read_bytes(1, context)?[0])
    }

    fn read_u16(&mut self, context: &'static str) -> Result<u16> {
        let bytes = self.read_bytes(2, context)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self, context: &'static str) -> Result<u32> {
        let bytes = self.read_bytes(4, context)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self, context: &'static str) -> Result<u64> {
        let bytes = self.read_bytes(8, context)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    /// Bounds-checked slice read; out-of-bounds is always a hard error
    fn read_bytes(&mut self, count: usize, context: &'static str) -> Result<&'a [u8]> {
        if self.offset + count > self.buffer.len() {
            return Err(EtfError::UnexpectedEnd(context));
        }
        let bytes = &self.buffer[self.offset..self.offset + count];
        self.offset += count;
        Ok(bytes)
    }

    fn decode_term(&mut self) -> Result<Value> {
        let tag = self.read_u8("term tag")?;
        match tag {
            NEW_FLOAT_EXT => {
                let bits = self.read_u64("float")?;
                Ok(Value::Float(f64::from_bits(bits)))
            }
            SMALL_INTEGER_EXT => Ok(Value::Uint(self.read_u8("small integer")? as u64)),
            INTEGER_EXT => {
                let value = self.read_u32("integer")? as i32;
                if value >= 0 {
                    Ok(Value::Uint(value as u64))
                } else {
                    Ok(Value::Int(value as i64))
                }
            }
            ATOM_EXT | ATOM_UTF8_EXT => {
                let length = self.read_u16("atom length")? as usize;
                self.decode_atom(length)
            }
            SMALL_ATOM_EXT | SMALL_ATOM_UTF8_EXT => {
                let length = self.read_u8("atom length")? as usize;
                self.decode_atom(length)
            }
            SMALL_TUPLE_EXT => {
                let arity = self.read_u8("tuple arity")? as usize;
                self.decode_tuple(arity)
            }
            LARGE_TUPLE_EXT => {
                let arity = self.read_u32("tuple arity")? as usize;
                self.decode_tuple(arity)
            }
            NIL_EXT => Ok(Value::Array(Vec::new())),
            STRING_EXT => {
                let length = self.read_u16("string length")? as usize;
                let bytes = self.read_bytes(length, "string")?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| EtfError::InvalidUtf8("string"))?;
                Ok(Value::String(text.to_string()))
            }
            LIST_EXT => {
                let length = self.read_u32("list length")? as usize;
                let mut values = Vec::with_capacity(length.min(4096));
                for _ in 0..length {
                    values.push(self.decode_term()?);
                }
                if self.read_u8("list tail")? != NIL_EXT {
                    return Err(EtfError::ImproperList);
                }
                Ok(Value::Array(values))
            }
            BINARY_EXT => {
                let length = self.read_u32("binary length")? as usize;
                let bytes = self.read_bytes(length, "binary")?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| EtfError::InvalidUtf8("binary"))?;
                Ok(Value::String(text.to_string()))
            }
            SMALL_BIG_EXT => {
                let count = self.read_u8("big integer size")? as usize;
                self.decode_big(count)
            }
            LARGE_BIG_EXT => {
                let count = self.read_u32("big integer size")? as usize;
                self.decode_big(count)
            }
            MAP_EXT => {
                let length = self.read_u32("map length")? as usize;
                let mut pairs = Vec::with_capacity(length.min(4096));
                for _ in 0..length {
                    let key = match self.decode_term()? {
                        Value::String(key) => key,
                        _ => return Err(EtfError::InvalidMapKey),
                    };
                    let value = self.decode_term()?;
                    pairs.push((key, value));
                }
                Ok(Value::Map(pairs))
            }
            other => Err(EtfError::UnknownTag(other)),
        }
    }

    /// Atoms carry the literal text of keywords: "nil"/"null" and the two
    /// booleans come back as their tagged values, anything else is a string
    fn decode_atom(&mut self, length: usize) -> Result<Value> {
        let bytes = self.read_bytes(length, "atom")?;
        let text =
            std::str::from_utf8(bytes).map_err(|_| EtfError::InvalidUtf8("atom"))?;
        Ok(match text {
            "nil" | "null" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => Value::String(other.to_string()),
        })
    }

    /// Tuples have no counterpart in the generic value; they flatten to arrays
    fn decode_tuple(&mut self, arity: usize) -> Result<Value> {
        let mut values = Vec::with_capacity(arity.min(4096));
        for _ in 0..arity {
            values.push(self.decode_term()?);
        }
        Ok(Value::Array(values))
    }

    fn decode_big(&mut self, count: usize) -> Result<Value> {
        if count > 8 {
            return Err(EtfError::BigIntegerTooLarge(count));
        }
        let sign = self.read_u8("big integer sign")?;
        let bytes = self.read_bytes(count, "big integer")?;
        let mut magnitude: u64 = 0;
        for (index, byte) in bytes.iter().enumerate() {
            magnitude |= (*byte as u64) << (8 * index);
        }
        if sign == 0 {
            Ok(Value::Uint(magnitude))
        } else if magnitude <= i64::MAX as u64 {
            Ok(Value::Int(-(magnitude as i64)))
        } else if magnitude == i64::MAX as u64 + 1 {
            Ok(Value::Int(i64::MIN))
        } else {
            Err(EtfError::BigIntegerOutOfRange)
        }
    }
}
