//! # Public Header and Public Reset
//!
//! ```text
//! +-------+--------------------+-------------+-----------------------+
//! | flags | connection id (8)? | version (4)?| packet number (1-6)   |
//! +-------+--------------------+-------------+-----------------------+
//! ```
//!
//! Packet numbers are written in full using the smallest of the four
//! widths that fits, so no reconstruction against the largest acknowledged
//! packet is needed on receipt.

#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, Error, Result};
use crate::handshake::HandshakeMessage;
use crate::types::{ConnectionId, PacketNumber, Tag};

pub const FLAG_VERSION: u8 = 0x01;
pub const FLAG_RESET: u8 = 0x02;
pub const FLAG_CONNECTION_ID: u8 = 0x08;
pub const PACKET_NUMBER_LEN_MASK: u8 = 0x30;

/// Largest packet number a 6-byte field can carry.
pub const MAX_PACKET_NUMBER: PacketNumber = (1 << 48) - 1;

type DecodeResult<T> = core::result::Result<T, DecodeError>;

/// Public (unencrypted) packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicHeader {
    pub connection_id: Option<ConnectionId>,
    pub version: Option<Tag>,
    pub reset: bool,
    /// Meaningless for public resets
    pub packet_number: PacketNumber,
}

impl PublicHeader {
    /// Header for a regular packet.
    pub fn new(connection_id: ConnectionId, packet_number: PacketNumber, version: Option<Tag>) -> Self {
        Self {
            connection_id: Some(connection_id),
            version,
            reset: false,
            packet_number,
        }
    }

    fn packet_number_len(packet_number: PacketNumber) -> (usize, u8) {
        match packet_number {
            0..=0xff => (1, 0x00),
            0x100..=0xffff => (2, 0x10),
            0x1_0000..=0xffff_ffff => (4, 0x20),
            _ => (6, 0x30),
        }
    }

    /// Parse a header from the front of a datagram, returning the header and
    /// its encoded length.
    pub fn parse(buf: &[u8]) -> DecodeResult<(Self, usize)> {
        let flags = *buf.first().ok_or(DecodeError::UnexpectedEnd)?;
        if flags & 0xc0 != 0 {
            return Err(DecodeError::InvalidHeader("reserved flag bits set"));
        }

        let reset = flags & FLAG_RESET != 0;
        let has_version = flags & FLAG_VERSION != 0;
        if reset && has_version {
            return Err(DecodeError::InvalidHeader("public reset with version"));
        }

        let mut pos = 1;
        let connection_id = if flags & FLAG_CONNECTION_ID != 0 {
            let raw = buf.get(pos..pos + 8).ok_or(DecodeError::UnexpectedEnd)?;
            pos += 8;
            let mut id = [0u8; 8];
            id.copy_from_slice(raw);
            Some(ConnectionId(u64::from_be_bytes(id)))
        } else {
            None
        };

        let version = if has_version {
            let raw = buf.get(pos..pos + 4).ok_or(DecodeError::UnexpectedEnd)?;
            pos += 4;
            Some(Tag([raw[0], raw[1], raw[2], raw[3]]))
        } else {
            None
        };

        let packet_number = if reset {
            0
        } else {
            let len = match flags & PACKET_NUMBER_LEN_MASK {
                0x00 => 1,
                0x10 => 2,
                0x20 => 4,
                _ => 6,
            };
            let raw = buf.get(pos..pos + len).ok_or(DecodeError::UnexpectedEnd)?;
            pos += len;
            raw.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
        };

        Ok((
            PublicHeader {
                connection_id,
                version,
                reset,
                packet_number,
            },
            pos,
        ))
    }

    /// Append the encoded header to `buf`.
    pub fn write(&self, buf: &mut BytesMut) -> Result<()> {
        if self.packet_number > MAX_PACKET_NUMBER {
            return Err(Error::Encode("packet number exceeds 48 bits"));
        }

        let mut flags = 0u8;
        if self.connection_id.is_some() {
            flags |= FLAG_CONNECTION_ID;
        }
        if self.version.is_some() {
            flags |= FLAG_VERSION;
        }
        let (pn_len, pn_flags) = Self::packet_number_len(self.packet_number);
        if self.reset {
            flags |= FLAG_RESET;
        } else {
            flags |= pn_flags;
        }

        buf.put_u8(flags);
        if let Some(id) = self.connection_id {
            buf.put_u64(id.0);
        }
        if let Some(version) = self.version {
            buf.put_slice(&version.0);
        }
        if !self.reset {
            let be = self.packet_number.to_be_bytes();
            buf.put_slice(&be[8 - pn_len..]);
        }
        Ok(())
    }

    /// Encoded length of this header.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1;
        if self.connection_id.is_some() {
            len += 8;
        }
        if self.version.is_some() {
            len += 4;
        }
        if !self.reset {
            len += Self::packet_number_len(self.packet_number).0;
        }
        len
    }
}

/// Public reset: an unencrypted notice that the sender abandoned the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicReset {
    pub connection_id: ConnectionId,
    pub nonce_proof: u64,
    pub rejected_packet_number: PacketNumber,
}

impl PublicReset {
    /// Full datagram: header followed by a PRST message.
    pub fn encode(&self) -> Result<Bytes> {
        let header = PublicHeader {
            connection_id: Some(self.connection_id),
            version: None,
            reset: true,
            packet_number: 0,
        };
        let message = HandshakeMessage::new(Tag::PRST)
            .with(Tag::RNON, self.nonce_proof.to_le_bytes().to_vec())
            .with(Tag::RSEQ, self.rejected_packet_number.to_le_bytes().to_vec());

        let mut buf = BytesMut::with_capacity(header.encoded_len() + message.encoded_len());
        header.write(&mut buf)?;
        message.write(&mut buf);
        Ok(buf.freeze())
    }

    /// Decode the body that follows a header carrying the reset flag.
    pub fn decode(connection_id: ConnectionId, body: &[u8]) -> DecodeResult<Self> {
        let (message, _) = HandshakeMessage::parse(body)?;
        if message.tag != Tag::PRST {
            return Err(DecodeError::InvalidHandshakeMessage("expected PRST"));
        }

        let read_u64 = |tag: Tag| -> DecodeResult<u64> {
            let value = message
                .get(tag)
                .ok_or(DecodeError::InvalidHandshakeMessage("missing public reset field"))?;
            let raw: [u8; 8] = value[..]
                .try_into()
                .map_err(|_| DecodeError::InvalidHandshakeMessage("public reset field is not 8 bytes"))?;
            Ok(u64::from_le_bytes(raw))
        };

        Ok(PublicReset {
            connection_id,
            nonce_proof: read_u64(Tag::RNON)?,
            rejected_packet_number: read_u64(Tag::RSEQ)?,
        })
    }
}
