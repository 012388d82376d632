//! Byte-level codec for the Parley wire format.
//!
//! A [`Reader`] and [`Writer`] pair implement the primitive and `VARY`
//! read/write operations over a byte cursor. All multi-byte integers are
//! little-endian. This crate knows nothing about message framing or
//! signatures — it is the leaf of the dependency graph.

use std::fmt;

use bytes::{BufMut, BytesMut};

/// One of the nine primitive wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    I8 = 0x00,
    U8 = 0x01,
    I16 = 0x02,
    U16 = 0x03,
    I32 = 0x04,
    U32 = 0x05,
    I64 = 0x06,
    U64 = 0x07,
    Vary = 0x08,
}

impl TypeTag {
    /// Wire size in bytes, or `None` for `VARY` (which is length-prefixed).
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            TypeTag::I8 | TypeTag::U8 => Some(1),
            TypeTag::I16 | TypeTag::U16 => Some(2),
            TypeTag::I32 | TypeTag::U32 => Some(4),
            TypeTag::I64 | TypeTag::U64 => Some(8),
            TypeTag::Vary => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for TypeTag {
    type Error = CodecError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0x00 => TypeTag::I8,
            0x01 => TypeTag::U8,
            0x02 => TypeTag::I16,
            0x03 => TypeTag::U16,
            0x04 => TypeTag::I32,
            0x05 => TypeTag::U32,
            0x06 => TypeTag::I64,
            0x07 => TypeTag::U64,
            0x08 => TypeTag::Vary,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

/// A value of one of the eight fixed-width primitive types.
///
/// `VARY` values are represented separately as plain `Vec<u8>` (see
/// [`Reader::read_vary`]) since they don't fit a fixed-width slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
}

impl PrimitiveValue {
    pub fn tag(self) -> TypeTag {
        match self {
            PrimitiveValue::I8(_) => TypeTag::I8,
            PrimitiveValue::U8(_) => TypeTag::U8,
            PrimitiveValue::I16(_) => TypeTag::I16,
            PrimitiveValue::U16(_) => TypeTag::U16,
            PrimitiveValue::I32(_) => TypeTag::I32,
            PrimitiveValue::U32(_) => TypeTag::U32,
            PrimitiveValue::I64(_) => TypeTag::I64,
            PrimitiveValue::U64(_) => TypeTag::U64,
        }
    }

    /// Widen to `i64`. Useful for call sites that just want "the number".
    pub fn as_i64(self) -> i64 {
        match self {
            PrimitiveValue::I8(v) => v as i64,
            PrimitiveValue::U8(v) => v as i64,
            PrimitiveValue::I16(v) => v as i64,
            PrimitiveValue::U16(v) => v as i64,
            PrimitiveValue::I32(v) => v as i64,
            PrimitiveValue::U32(v) => v as i64,
            PrimitiveValue::I64(v) => v,
            PrimitiveValue::U64(v) => v as i64,
        }
    }
}

/// Errors raised by the codec layer. These are local (host-side) errors;
/// callers map them onto the wire `ErrorCode` set (`BROKEN_MSG`,
/// `TOO_LONG`, `NO_SUPPORT`) at the point they cross the endpoint boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Not enough bytes remained to satisfy a read.
    ShortRead { needed: usize, available: usize },
    /// A `VARY` payload requested a write of 256 bytes or more.
    PayloadTooLong { len: usize },
    /// A byte didn't match any known `TypeTag`.
    UnknownTag(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::ShortRead { needed, available } => write!(
                f,
                "short read: needed {needed} byte(s), {available} available"
            ),
            CodecError::PayloadTooLong { len } => {
                write!(f, "VARY payload of {len} bytes exceeds the 255-byte limit")
            }
            CodecError::UnknownTag(tag) => write!(f, "unknown type tag 0x{tag:02x}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Forward-only reader over a borrowed byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    /// Bytes remaining after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::ShortRead {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read one raw byte, without tag interpretation. Used for header fields.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u16`. Used for header fields (message id).
    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read `size(tag)` little-endian bytes and interpret them per `tag`.
    ///
    /// # Panics
    /// Never — `VARY` is rejected with [`CodecError::UnknownTag`]; use
    /// [`Reader::read_vary`] for variable-length payloads.
    pub fn read_primitive(&mut self, tag: TypeTag) -> Result<PrimitiveValue, CodecError> {
        Ok(match tag {
            TypeTag::I8 => PrimitiveValue::I8(self.take(1)?[0] as i8),
            TypeTag::U8 => PrimitiveValue::U8(self.take(1)?[0]),
            TypeTag::I16 => {
                let b = self.take(2)?;
                PrimitiveValue::I16(i16::from_le_bytes([b[0], b[1]]))
            }
            TypeTag::U16 => {
                let b = self.take(2)?;
                PrimitiveValue::U16(u16::from_le_bytes([b[0], b[1]]))
            }
            TypeTag::I32 => {
                let b = self.take(4)?;
                PrimitiveValue::I32(i32::from_le_bytes(b.try_into().unwrap()))
            }
            TypeTag::U32 => {
                let b = self.take(4)?;
                PrimitiveValue::U32(u32::from_le_bytes(b.try_into().unwrap()))
            }
            TypeTag::I64 => {
                let b = self.take(8)?;
                PrimitiveValue::I64(i64::from_le_bytes(b.try_into().unwrap()))
            }
            TypeTag::U64 => {
                let b = self.take(8)?;
                PrimitiveValue::U64(u64::from_le_bytes(b.try_into().unwrap()))
            }
            TypeTag::Vary => return Err(CodecError::UnknownTag(TypeTag::Vary.as_u8())),
        })
    }

    /// Read a `U8` length prefix followed by that many bytes.
    pub fn read_vary(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read exactly `len` bytes with no length prefix. Used for fixed-width
    /// values whose size is already known from a signature.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }
}

/// Forward-only writer appending to an owned buffer.
#[derive(Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: BytesMut::new() }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_slice(&v.to_le_bytes());
    }

    /// Append `size(value.tag())` little-endian bytes. Range checks are the
    /// caller's responsibility — the value must already fit the tag's width.
    pub fn write_primitive(&mut self, value: PrimitiveValue) {
        match value {
            PrimitiveValue::I8(v) => self.buf.put_slice(&v.to_le_bytes()),
            PrimitiveValue::U8(v) => self.buf.put_slice(&v.to_le_bytes()),
            PrimitiveValue::I16(v) => self.buf.put_slice(&v.to_le_bytes()),
            PrimitiveValue::U16(v) => self.buf.put_slice(&v.to_le_bytes()),
            PrimitiveValue::I32(v) => self.buf.put_slice(&v.to_le_bytes()),
            PrimitiveValue::U32(v) => self.buf.put_slice(&v.to_le_bytes()),
            PrimitiveValue::I64(v) => self.buf.put_slice(&v.to_le_bytes()),
            PrimitiveValue::U64(v) => self.buf.put_slice(&v.to_le_bytes()),
        }
    }

    /// Append `bytes` with no length prefix. Used for fixed-width values
    /// whose size is already known from a signature.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a `U8` length prefix followed by `data`. Fails if `data` is
    /// 256 bytes or longer.
    pub fn write_vary(&mut self, data: &[u8]) -> Result<(), CodecError> {
        if data.len() >= 256 {
            return Err(CodecError::PayloadTooLong { len: data.len() });
        }
        self.buf.put_u8(data.len() as u8);
        self.buf.put_slice(data);
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
