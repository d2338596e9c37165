//! # Core Types
//!
//! Identifiers, tags and the variable-length integer codec shared by the
//! frame, packet and handshake layers.

#![forbid(unsafe_code)]

use core::fmt;

use bytes::BufMut;

// ============================================================================
// Variable-Length Integer Encoding
// ============================================================================

/// Variable-length integer value (62-bit unsigned)
pub type VarInt = u64;

/// Maximum value representable by [`VarIntCodec`]
pub const VARINT_MAX: VarInt = (1 << 62) - 1;

/// Variable-length integer codec.
///
/// The two most significant bits of the first byte select a 1, 2, 4 or
/// 8 byte big-endian encoding; the remaining bits carry the value.
pub struct VarIntCodec;

impl VarIntCodec {
    /// Decode a VarInt, returning `(value, bytes_consumed)`.
    ///
    /// Returns `None` if the buffer is shorter than the encoded length.
    pub fn decode(buf: &[u8]) -> Option<(VarInt, usize)> {
        let first = *buf.first()?;
        let len = 1usize << (first >> 6);
        if buf.len() < len {
            return None;
        }

        let mut value = (first & 0x3f) as u64;
        for byte in &buf[1..len] {
            value = (value << 8) | *byte as u64;
        }
        Some((value, len))
    }

    /// Encode a VarInt into `buf`, returning bytes written.
    ///
    /// Returns `None` if the value exceeds [`VARINT_MAX`] or the buffer is
    /// too small.
    pub fn encode(value: VarInt, buf: &mut [u8]) -> Option<usize> {
        let len = Self::size(value)?;
        if buf.len() < len {
            return None;
        }

        let tag: u8 = match len {
            1 => 0b00,
            2 => 0b01,
            4 => 0b10,
            _ => 0b11,
        };
        for (i, slot) in buf[..len].iter_mut().enumerate() {
            *slot = (value >> (8 * (len - 1 - i))) as u8;
        }
        buf[0] |= tag << 6;
        Some(len)
    }

    /// Append a VarInt to a growable buffer.
    pub fn put<B: BufMut>(value: VarInt, buf: &mut B) -> Option<usize> {
        let mut scratch = [0u8; 8];
        let len = Self::encode(value, &mut scratch)?;
        buf.put_slice(&scratch[..len]);
        Some(len)
    }

    /// Encoded size of a value, `None` if it is out of range.
    pub fn size(value: VarInt) -> Option<usize> {
        match value {
            0..=63 => Some(1),
            64..=16_383 => Some(2),
            16_384..=1_073_741_823 => Some(4),
            1_073_741_824..=VARINT_MAX => Some(8),
            _ => None,
        }
    }
}

// ============================================================================
// Identifiers
// ============================================================================

/// Packet number
pub type PacketNumber = u64;

/// Byte offset within a stream
pub type StreamOffset = u64;

/// Stream identifier.
///
/// Id 0 names the connection itself in WINDOW_UPDATE and BLOCKED frames,
/// id 1 is reserved for the crypto handshake. Client-initiated streams are
/// odd, server-initiated streams are even.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    /// Connection-level pseudo stream for flow control frames
    pub const CONNECTION: StreamId = StreamId(0);

    /// Reserved stream carrying handshake messages
    pub const HANDSHAKE: StreamId = StreamId(1);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn is_handshake(self) -> bool {
        self == Self::HANDSHAKE
    }

    /// Which side opens streams with this id.
    pub fn initiator(self) -> Perspective {
        if self.0 % 2 == 1 {
            Perspective::Client
        } else {
            Perspective::Server
        }
    }

    /// First stream id an endpoint may open itself.
    pub fn first_local(perspective: Perspective) -> Self {
        match perspective {
            Perspective::Client => StreamId(3),
            Perspective::Server => StreamId(2),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        StreamId(id)
    }
}

/// 64-bit connection identifier chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Which end of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Perspective {
    Client,
    Server,
}

impl Perspective {
    pub fn is_client(self) -> bool {
        matches!(self, Perspective::Client)
    }

    pub fn opposite(self) -> Self {
        match self {
            Perspective::Client => Perspective::Server,
            Perspective::Server => Perspective::Client,
        }
    }
}

// ============================================================================
// Tags
// ============================================================================

/// Four-byte tag naming handshake messages, their entries and versions.
///
/// Tags order by their little-endian integer value, which is the order
/// entries take inside a handshake message.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub [u8; 4]);

impl Tag {
    /// Client hello
    pub const CHLO: Tag = Tag(*b"CHLO");
    /// Server hello
    pub const SHLO: Tag = Tag(*b"SHLO");
    /// Public reset
    pub const PRST: Tag = Tag(*b"PRST");
    /// Server name indication
    pub const SNI: Tag = Tag(*b"SNI\0");
    /// Version list
    pub const VER: Tag = Tag(*b"VER\0");
    /// Public reset nonce proof
    pub const RNON: Tag = Tag(*b"RNON");
    /// Rejected packet number
    pub const RSEQ: Tag = Tag(*b"RSEQ");

    /// Little-endian integer form used when sorting message entries.
    pub fn as_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub fn from_u32(value: u32) -> Self {
        Tag(value.to_le_bytes())
    }
}

impl Ord for Tag {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.as_u32().cmp(&other.as_u32())
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else if b != 0 {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({})", self)
    }
}

/// The single protocol version spoken by this implementation.
pub const SUPPORTED_VERSION: Tag = Tag(*b"Q039");

#[cfg(test)]
mod tests {
    use super::*;

    mod varint_tests {
        use super::*;

        #[test]
        fn test_varint_boundaries() {
            for (value, len) in [
                (0u64, 1usize),
                (63, 1),
                (64, 2),
                (16_383, 2),
                (16_384, 4),
                (1_073_741_823, 4),
                (1_073_741_824, 8),
                (VARINT_MAX, 8),
            ] {
                let mut buf = [0u8; 8];
                assert_eq!(VarIntCodec::encode(value, &mut buf), Some(len));
                assert_eq!(VarIntCodec::decode(&buf[..len]), Some((value, len)));
            }
        }

        #[test]
        fn test_varint_rejects_out_of_range() {
            let mut buf = [0u8; 8];
            assert_eq!(VarIntCodec::encode(VARINT_MAX + 1, &mut buf), None);
            assert_eq!(VarIntCodec::size(u64::MAX), None);
        }

        #[test]
        fn test_varint_truncated_input() {
            assert_eq!(VarIntCodec::decode(&[]), None);
            assert_eq!(VarIntCodec::decode(&[0x40]), None);
            assert_eq!(VarIntCodec::decode(&[0x80, 0, 0]), None);
        }

        #[test]
        fn test_varint_known_encoding() {
            // 0x8000 needs the four byte form
            let mut buf = [0u8; 8];
            let len = VarIntCodec::encode(0x8000, &mut buf).unwrap();
            assert_eq!(&buf[..len], &[0x80, 0x00, 0x80, 0x00]);
        }
    }

    mod id_tests {
        use super::*;

        #[test]
        fn test_stream_initiator() {
            assert_eq!(StreamId(3).initiator(), Perspective::Client);
            assert_eq!(StreamId(2).initiator(), Perspective::Server);
            assert!(StreamId::HANDSHAKE.is_handshake());
        }

        #[test]
        fn test_first_local_stream() {
            assert_eq!(StreamId::first_local(Perspective::Client), StreamId(3));
            assert_eq!(StreamId::first_local(Perspective::Server), StreamId(2));
        }

        #[test]
        fn test_tag_display() {
            assert_eq!(Tag::CHLO.to_string(), "CHLO");
            assert_eq!(Tag::SNI.to_string(), "SNI");
            assert_eq!(Tag::from_u32(Tag::PRST.as_u32()), Tag::PRST);
        }
    }
}
