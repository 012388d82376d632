//! Message framing for the Parley wire format: the header layouts, the
//! five message kinds, and the error code table.
//!
//! Layout B is normative and is the only layout [`Header::encode`] ever
//! produces. Layout A (the older `u-rpc` header shape, with a 16-bit magic
//! number and a separate version byte) is accepted on read only, for
//! compatibility with legacy peers.

use std::fmt;

use parley_codec::{CodecError, Reader, Writer};

/// `(MAGIC << 4) | VERSION` discriminant used by Layout B.
pub const MAGIC: u8 = 10;
pub const VERSION: u8 = 1;

/// 16-bit magic number used by the legacy Layout A header.
const LEGACY_MAGIC: u16 = 29301;

/// Conservative upper bound on a single frame: header + a CALL with the
/// largest representable signature and argument list (256 args, each up to
/// 8 bytes wide, with a 256-byte VARY thrown in for good measure).
pub const MAX_FRAME_LEN: usize = 4 + 1 + 256 + 1 + 256 + 8 * 256;

/// One of the five message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Error = 0,
    FuncQuery = 1,
    FuncResp = 2,
    Call = 3,
    CallResult = 4,
}

impl MessageType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => MessageType::Error,
            1 => MessageType::FuncQuery,
            2 => MessageType::FuncResp,
            3 => MessageType::Call,
            4 => MessageType::CallResult,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

/// The closed set of wire-level error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0x00,
    SigIncorrect = 0x20,
    Nonexist = 0x21,
    NoSupport = 0x22,
    NoMemory = 0x23,
    BrokenMsg = 0x24,
    Exception = 0x25,
    TooLong = 0x26,
}

impl ErrorCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0x00 => ErrorCode::Ok,
            0x20 => ErrorCode::SigIncorrect,
            0x21 => ErrorCode::Nonexist,
            0x22 => ErrorCode::NoSupport,
            0x23 => ErrorCode::NoMemory,
            0x24 => ErrorCode::BrokenMsg,
            0x25 => ErrorCode::Exception,
            0x26 => ErrorCode::TooLong,
            other => return Err(WireError::UnknownErrorCode(other)),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::SigIncorrect => "signature does not match the registered function",
            ErrorCode::Nonexist => "no function registered under that name or handle",
            ErrorCode::NoSupport => "unsupported type tag or message shape",
            ErrorCode::NoMemory => "function table is full",
            ErrorCode::BrokenMsg => "malformed or truncated frame",
            ErrorCode::Exception => "the called function raised an exception",
            ErrorCode::TooLong => "a VARY payload or frame exceeded its size limit",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for ErrorCode {}

/// Errors raised while framing or parsing a message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    Codec(CodecError),
    UnknownMessageType(u8),
    UnknownErrorCode(u8),
    /// Neither Layout B's discriminant byte nor Layout A's 16-bit magic
    /// number matched.
    BadMagic,
    /// Layout B's magic nibble matched but the version nibble didn't.
    VersionMismatch { got: u8 },
    FrameTooLong { len: usize },
}

impl From<CodecError> for WireError {
    fn from(e: CodecError) -> Self {
        WireError::Codec(e)
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Codec(e) => write!(f, "{e}"),
            WireError::UnknownMessageType(t) => write!(f, "unknown message type {t}"),
            WireError::UnknownErrorCode(c) => write!(f, "unknown error code 0x{c:02x}"),
            WireError::BadMagic => write!(f, "frame matches neither header layout"),
            WireError::VersionMismatch { got } => {
                write!(f, "unsupported protocol version {got}")
            }
            WireError::FrameTooLong { len } => {
                write!(f, "frame of {len} bytes exceeds MAX_FRAME_LEN")
            }
        }
    }
}

impl std::error::Error for WireError {}

/// Which header layout a frame was parsed with. Only [`HeaderLayout::B`] is
/// ever produced by [`Header::encode`]; [`HeaderLayout::A`] is recognized
/// for legacy-peer compatibility on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLayout {
    A,
    B,
}

/// The parsed frame header: message kind and the 16-bit message id used to
/// pair a response with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MessageType,
    pub msg_id: u16,
}

impl Header {
    /// Encode using Layout B, the only layout this crate ever emits.
    pub fn encode(self, w: &mut Writer) {
        w.write_u8((MAGIC << 4) | VERSION);
        w.write_u16(self.msg_id);
        w.write_u8(self.msg_type.as_u8());
    }

    /// Parse a header, accepting either Layout B (preferred) or the legacy
    /// Layout A. Returns the header and which layout matched.
    ///
    /// The two nibbles of Layout B's first byte are checked independently:
    /// a high nibble that doesn't match `MAGIC` means this isn't a Layout-B
    /// frame at all, so parsing falls back to Layout A; a high nibble that
    /// does match but a low nibble that doesn't is a real Layout-B frame at
    /// an unsupported version, reported distinctly rather than folded into
    /// the "not Layout B" case.
    pub fn decode(r: &mut Reader<'_>) -> Result<(Header, HeaderLayout), WireError> {
        let first = r.read_u8()?;
        if first >> 4 == MAGIC {
            let version = first & 0x0f;
            if version != VERSION {
                return Err(WireError::VersionMismatch { got: version });
            }
            let msg_id = r.read_u16()?;
            let msg_type = MessageType::try_from(r.read_u8()?)?;
            return Ok((Header { msg_type, msg_id }, HeaderLayout::B));
        }

        // Layout A: the byte just read is the low byte of a u16 magic,
        // followed by its high byte, then a separate version byte.
        let high = r.read_u8()?;
        let magic = u16::from_le_bytes([first, high]);
        if magic != LEGACY_MAGIC {
            return Err(WireError::BadMagic);
        }
        let _version = r.read_u8()?;
        let msg_id = r.read_u16()?;
        let msg_type = MessageType::try_from(r.read_u8()?)?;
        Ok((Header { msg_type, msg_id }, HeaderLayout::A))
    }
}

/// Reject a frame before attempting to parse its header at all, as a sanity
/// ceiling independent of any single protocol field.
pub fn check_frame_len(len: usize) -> Result<(), WireError> {
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLong { len });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_b_roundtrip() {
        let header = Header {
            msg_type: MessageType::Call,
            msg_id: 4242,
        };
        let mut w = Writer::new();
        header.encode(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], (MAGIC << 4) | VERSION);

        let mut r = Reader::new(&bytes);
        let (decoded, layout) = Header::decode(&mut r).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(layout, HeaderLayout::B);
    }

    #[test]
    fn layout_a_legacy_header_parses() {
        // U16 magic (LE), U8 version, U16 msg id, U8 msg type.
        let mut w = Writer::new();
        w.write_u16(29301);
        w.write_u8(1);
        w.write_u16(7);
        w.write_u8(MessageType::CallResult.as_u8());
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        let (decoded, layout) = Header::decode(&mut r).unwrap();
        assert_eq!(layout, HeaderLayout::A);
        assert_eq!(decoded.msg_type, MessageType::CallResult);
        assert_eq!(decoded.msg_id, 7);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = [0xffu8, 0xff, 0, 0, 0];
        let mut r = Reader::new(&bytes);
        assert_eq!(Header::decode(&mut r).unwrap_err(), WireError::BadMagic);
    }

    #[test]
    fn right_magic_wrong_version_is_version_mismatch() {
        // High nibble matches MAGIC, low nibble doesn't match VERSION: a
        // real Layout-B frame at an unsupported version, not a frame that
        // merely fails to look like Layout B at all.
        let bytes = [(MAGIC << 4) | 2, 0, 0, 0];
        let mut r = Reader::new(&bytes);
        assert_eq!(
            Header::decode(&mut r).unwrap_err(),
            WireError::VersionMismatch { got: 2 }
        );
    }

    #[test]
    fn message_type_roundtrip() {
        for raw in 0u8..=4 {
            let mt = MessageType::try_from(raw).unwrap();
            assert_eq!(mt.as_u8(), raw);
        }
        assert_eq!(
            MessageType::try_from(5).unwrap_err(),
            WireError::UnknownMessageType(5)
        );
    }

    #[test]
    fn error_code_roundtrip() {
        let codes = [
            ErrorCode::Ok,
            ErrorCode::SigIncorrect,
            ErrorCode::Nonexist,
            ErrorCode::NoSupport,
            ErrorCode::NoMemory,
            ErrorCode::BrokenMsg,
            ErrorCode::Exception,
            ErrorCode::TooLong,
        ];
        for c in codes {
            assert_eq!(ErrorCode::try_from(c.as_u8()).unwrap(), c);
        }
        assert_eq!(
            ErrorCode::try_from(0x10).unwrap_err(),
            WireError::UnknownErrorCode(0x10)
        );
    }

    #[test]
    fn frame_len_ceiling_enforced() {
        assert!(check_frame_len(MAX_FRAME_LEN).is_ok());
        assert_eq!(
            check_frame_len(MAX_FRAME_LEN + 1).unwrap_err(),
            WireError::FrameTooLong {
                len: MAX_FRAME_LEN + 1
            }
        );
    }
}
