//! Typed values and the transcoder seam.
//!
//! A [`Value`] is what callers store and fetch; a [`Transcoder`] turns it
//! into a [`Payload`] (bytes plus a 32-bit type flag the server keeps
//! verbatim) and back. The default transcoder assigns one flag per
//! primitive type and serializes composites with bincode behind
//! [`Value::packed`].
//!
//! # Flag table
//!
//! | flag | type        | flag | type  |
//! |------|-------------|------|-------|
//! | 1    | utf-8 string| 9    | u32   |
//! | 2    | raw bytes   | 10   | i64   |
//! | 3    | bool        | 11   | u64   |
//! | 4    | i8          | 12   | i128  |
//! | 5    | u8          | 13   | u128  |
//! | 6    | i16         | 14   | char  |
//! | 7    | u16         | 20   | f32   |
//! | 8    | i32         | 21   | f64   |
//! |      |             | 32   | packed|
//!
//! Numeric payloads are big-endian; floats travel as their IEEE-754 bit
//! patterns. Decoding a payload whose flag the transcoder does not know
//! fails instead of guessing, and the raw payload stays reachable on the
//! result object.

use std::fmt;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use ember_core::Payload;

/// Type flags of the default transcoder.
mod flag {
    pub const UTF8: u32 = 1;
    pub const RAW: u32 = 2;
    pub const BOOL: u32 = 3;
    pub const I8: u32 = 4;
    pub const U8: u32 = 5;
    pub const I16: u32 = 6;
    pub const U16: u32 = 7;
    pub const I32: u32 = 8;
    pub const U32: u32 = 9;
    pub const I64: u32 = 10;
    pub const U64: u32 = 11;
    pub const I128: u32 = 12;
    pub const U128: u32 = 13;
    pub const CHAR: u32 = 14;
    pub const F32: u32 = 20;
    pub const F64: u32 = 21;
    pub const PACKED: u32 = 32;
}

/// Errors raised while converting values to payloads and back.
#[derive(Debug, Error)]
pub enum TranscodeError {
    /// The payload's flag names no type this transcoder knows.
    #[error("unknown type flag {flag:#010x}")]
    UnknownFlag {
        /// The flag word from the wire.
        flag: u32,
    },

    /// The payload body has the wrong length for its flag.
    #[error("payload of {actual} bytes does not fit {kind} (need {need})")]
    Length {
        /// The type named by the flag.
        kind: &'static str,
        /// The required body length.
        need: usize,
        /// The actual body length.
        actual: usize,
    },

    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid utf-8")]
    Utf8,

    /// A char payload was not a valid scalar value.
    #[error("char payload is not a valid scalar value")]
    Char,

    /// A packed composite failed to serialize or deserialize.
    #[error("packed value error: {message}")]
    Packed {
        /// The serializer's diagnostic.
        message: String,
    },

    /// [`Value::unpack`] called on a non-packed variant.
    #[error("value is not a packed composite")]
    NotPacked,
}

/// A typed cache value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A UTF-8 string.
    Utf8(String),
    /// Raw bytes, stored as-is.
    Raw(Bytes),
    /// A boolean.
    Bool(bool),
    /// Signed 8-bit integer.
    I8(i8),
    /// Unsigned 8-bit integer.
    U8(u8),
    /// Signed 16-bit integer.
    I16(i16),
    /// Unsigned 16-bit integer.
    U16(u16),
    /// Signed 32-bit integer.
    I32(i32),
    /// Unsigned 32-bit integer.
    U32(u32),
    /// Signed 64-bit integer.
    I64(i64),
    /// Unsigned 64-bit integer.
    U64(u64),
    /// Signed 128-bit integer.
    I128(i128),
    /// Unsigned 128-bit integer.
    U128(u128),
    /// A single character.
    Char(char),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// A serde composite, serialized with bincode.
    Packed(Bytes),
}

impl Value {
    /// Packs a serde-serializable composite.
    ///
    /// # Errors
    /// Returns an error when serialization fails.
    pub fn packed<T: Serialize>(value: &T) -> Result<Self, TranscodeError> {
        let data = bincode::serialize(value).map_err(|e| TranscodeError::Packed {
            message: e.to_string(),
        })?;
        Ok(Self::Packed(Bytes::from(data)))
    }

    /// Unpacks a composite stored with [`Value::packed`].
    ///
    /// # Errors
    /// Returns an error when this is not a packed value or when
    /// deserialization fails.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, TranscodeError> {
        let Self::Packed(data) = self else {
            return Err(TranscodeError::NotPacked);
        };
        bincode::deserialize(data).map_err(|e| TranscodeError::Packed {
            message: e.to_string(),
        })
    }

    /// The string, when this is a UTF-8 value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// The bytes, when this is a raw value.
    #[must_use]
    pub const fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Raw(b) => Some(b),
            _ => None,
        }
    }

    /// The boolean, when this is a bool value.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer, when this is an i64 value.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(n) => Some(*n),
            _ => None,
        }
    }

    /// The integer, when this is a u64 value.
    #[must_use]
    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(n) => Some(*n),
            _ => None,
        }
    }

    /// The float, when this is an f64 value.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Utf8(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Utf8(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Raw(Bytes::from(b))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::Raw(b)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<char> for Value {
    fn from(c: char) -> Self {
        Self::Char(c)
    }
}

macro_rules! value_from_num {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(n: $ty) -> Self {
                Self::$variant(n)
            }
        })*
    };
}

value_from_num! {
    i8 => I8, u8 => U8, i16 => I16, u16 => U16, i32 => I32, u32 => U32,
    i64 => I64, u64 => U64, i128 => I128, u128 => U128, f32 => F32, f64 => F64,
}

/// Converts typed values to wire payloads and back.
///
/// Implementations must satisfy `decode(encode(v)) == v` for every value
/// they encode, and must fail on flags they do not recognize.
pub trait Transcoder: Send + Sync + fmt::Debug {
    /// Encodes a value into a payload.
    ///
    /// # Errors
    /// Returns an error when the value cannot be serialized.
    fn encode(&self, value: &Value) -> Result<Payload, TranscodeError>;

    /// Decodes a payload back into a value.
    ///
    /// # Errors
    /// Returns an error on unknown flags or malformed bodies; the caller
    /// keeps the raw payload.
    fn decode(&self, payload: &Payload) -> Result<Value, TranscodeError>;
}

/// The default transcoder: fixed flag table, big-endian numerics, bincode
/// composites.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTranscoder;

impl Transcoder for DefaultTranscoder {
    fn encode(&self, value: &Value) -> Result<Payload, TranscodeError> {
        let payload = match value {
            Value::Utf8(s) => Payload::new(flag::UTF8, s.clone().into_bytes()),
            Value::Raw(b) => Payload::new(flag::RAW, b.clone()),
            Value::Bool(b) => Payload::new(flag::BOOL, vec![u8::from(*b)]),
            Value::I8(n) => Payload::new(flag::I8, n.to_be_bytes().to_vec()),
            Value::U8(n) => Payload::new(flag::U8, n.to_be_bytes().to_vec()),
            Value::I16(n) => Payload::new(flag::I16, n.to_be_bytes().to_vec()),
            Value::U16(n) => Payload::new(flag::U16, n.to_be_bytes().to_vec()),
            Value::I32(n) => Payload::new(flag::I32, n.to_be_bytes().to_vec()),
            Value::U32(n) => Payload::new(flag::U32, n.to_be_bytes().to_vec()),
            Value::I64(n) => Payload::new(flag::I64, n.to_be_bytes().to_vec()),
            Value::U64(n) => Payload::new(flag::U64, n.to_be_bytes().to_vec()),
            Value::I128(n) => Payload::new(flag::I128, n.to_be_bytes().to_vec()),
            Value::U128(n) => Payload::new(flag::U128, n.to_be_bytes().to_vec()),
            Value::Char(c) => Payload::new(flag::CHAR, u32::from(*c).to_be_bytes().to_vec()),
            Value::F32(n) => Payload::new(flag::F32, n.to_bits().to_be_bytes().to_vec()),
            Value::F64(n) => Payload::new(flag::F64, n.to_bits().to_be_bytes().to_vec()),
            Value::Packed(b) => Payload::new(flag::PACKED, b.clone()),
        };
        Ok(payload)
    }

    fn decode(&self, payload: &Payload) -> Result<Value, TranscodeError> {
        let data = &payload.data;
        let value = match payload.flags {
            flag::UTF8 => Value::Utf8(
                String::from_utf8(data.to_vec()).map_err(|_| TranscodeError::Utf8)?,
            ),
            flag::RAW => Value::Raw(data.clone()),
            flag::BOOL => {
                let [b] = fixed::<1>("bool", data)?;
                Value::Bool(b != 0)
            }
            flag::I8 => Value::I8(i8::from_be_bytes(fixed("i8", data)?)),
            flag::U8 => Value::U8(u8::from_be_bytes(fixed("u8", data)?)),
            flag::I16 => Value::I16(i16::from_be_bytes(fixed("i16", data)?)),
            flag::U16 => Value::U16(u16::from_be_bytes(fixed("u16", data)?)),
            flag::I32 => Value::I32(i32::from_be_bytes(fixed("i32", data)?)),
            flag::U32 => Value::U32(u32::from_be_bytes(fixed("u32", data)?)),
            flag::I64 => Value::I64(i64::from_be_bytes(fixed("i64", data)?)),
            flag::U64 => Value::U64(u64::from_be_bytes(fixed("u64", data)?)),
            flag::I128 => Value::I128(i128::from_be_bytes(fixed("i128", data)?)),
            flag::U128 => Value::U128(u128::from_be_bytes(fixed("u128", data)?)),
            flag::CHAR => {
                let code = u32::from_be_bytes(fixed("char", data)?);
                Value::Char(char::from_u32(code).ok_or(TranscodeError::Char)?)
            }
            flag::F32 => Value::F32(f32::from_bits(u32::from_be_bytes(fixed("f32", data)?))),
            flag::F64 => Value::F64(f64::from_bits(u64::from_be_bytes(fixed("f64", data)?))),
            flag::PACKED => Value::Packed(data.clone()),
            other => return Err(TranscodeError::UnknownFlag { flag: other }),
        };
        Ok(value)
    }
}

fn fixed<const N: usize>(kind: &'static str, data: &Bytes) -> Result<[u8; N], TranscodeError> {
    <[u8; N]>::try_from(data.as_ref()).map_err(|_| TranscodeError::Length {
        kind,
        need: N,
        actual: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[test]
    fn test_primitive_roundtrips() {
        let transcoder = DefaultTranscoder;
        let values = [
            Value::Utf8("hello".into()),
            Value::Raw(Bytes::from_static(b"\x00\x01\xFF")),
            Value::Bool(true),
            Value::Bool(false),
            Value::I8(-5),
            Value::U8(200),
            Value::I16(-3000),
            Value::U16(60_000),
            Value::I32(-2_000_000),
            Value::U32(4_000_000_000),
            Value::I64(65_432_123_456),
            Value::U64(u64::MAX),
            Value::I128(-1),
            Value::U128(u128::MAX),
            Value::Char('\u{1F980}'),
            Value::F32(1.5),
            Value::F64(-2.25),
        ];
        for value in values {
            let payload = transcoder.encode(&value).unwrap();
            let decoded = transcoder.decode(&payload).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_flag_assignments() {
        let transcoder = DefaultTranscoder;
        assert_eq!(transcoder.encode(&Value::Utf8("x".into())).unwrap().flags, 1);
        assert_eq!(transcoder.encode(&Value::I8(0)).unwrap().flags, 4);
        assert_eq!(transcoder.encode(&Value::F64(0.0)).unwrap().flags, 21);
    }

    #[test]
    fn test_unknown_flag_fails() {
        let transcoder = DefaultTranscoder;
        let payload = Payload::new(0x4000, &b"??"[..]);
        let err = transcoder.decode(&payload).unwrap_err();
        assert!(matches!(err, TranscodeError::UnknownFlag { flag: 0x4000 }));
    }

    #[test]
    fn test_wrong_length_fails() {
        let transcoder = DefaultTranscoder;
        let payload = Payload::new(10, &b"\x01\x02"[..]); // i64 wants 8 bytes
        let err = transcoder.decode(&payload).unwrap_err();
        assert!(matches!(err, TranscodeError::Length { need: 8, actual: 2, .. }));
    }

    #[test]
    fn test_packed_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Profile {
            name: String,
            stamp: i64,
            active: bool,
        }

        let original = Profile {
            name: "Hello".into(),
            stamp: 19_810_619,
            active: true,
        };
        let value = Value::packed(&original).unwrap();
        let transcoder = DefaultTranscoder;
        let payload = transcoder.encode(&value).unwrap();
        assert_eq!(payload.flags, 32);

        let decoded = transcoder.decode(&payload).unwrap();
        assert_eq!(decoded.unpack::<Profile>().unwrap(), original);
    }

    #[test]
    fn test_unpack_non_packed_fails() {
        let err = Value::Bool(true).unpack::<bool>().unwrap_err();
        assert!(matches!(err, TranscodeError::NotPacked));
    }
}
