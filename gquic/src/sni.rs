//! SNI extraction from a client's first packet.
//!
//! Stateless: a front end can peek at the server name of a new connection
//! without creating a session. Only the null packet protection is
//! understood, so the payload starts after a fixed 12-byte hash.

#![forbid(unsafe_code)]

use bytes::Bytes;
use thiserror::Error;

use crate::error::DecodeError;
use crate::frames::{DefaultFrameParser, Frame, FrameIterator};
use crate::handshake::{HandshakeMessage, NULL_AEAD_TAG_LEN};
use crate::packet::PublicHeader;
use crate::types::Tag;

/// Shortest datagram that can hold a client hello packet.
const MIN_INITIAL_PACKET_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SniError {
    #[error("packet too short")]
    PacketTooShort,

    #[error("not an initial client packet")]
    NotInitialPacket,

    #[error("invalid public header: {0}")]
    Header(DecodeError),

    #[error("packet carries no frames")]
    NoFrames,

    #[error("invalid frame: {0}")]
    Frame(DecodeError),
}

/// Return the SNI of the first CHLO found in `packet`.
///
/// `Ok(None)` means the packet is a well-formed initial packet whose
/// handshake data carries no server name.
pub fn parse_client_hello_sni(packet: &[u8]) -> Result<Option<String>, SniError> {
    if packet.len() < MIN_INITIAL_PACKET_LEN {
        return Err(SniError::PacketTooShort);
    }

    let (header, header_len) = PublicHeader::parse(packet).map_err(SniError::Header)?;
    if header.reset || header.version.is_none() {
        return Err(SniError::NotInitialPacket);
    }

    let body = packet
        .get(header_len + NULL_AEAD_TAG_LEN..)
        .filter(|body| !body.is_empty())
        .ok_or(SniError::NoFrames)?;

    let parser = DefaultFrameParser;
    let mut frames_seen = 0usize;
    for frame in FrameIterator::new(&parser, Bytes::copy_from_slice(body)) {
        frames_seen += 1;
        let Frame::Stream(frame) = frame.map_err(SniError::Frame)? else {
            continue;
        };
        let Ok((message, _)) = HandshakeMessage::parse(&frame.data) else {
            continue;
        };
        if message.tag != Tag::CHLO {
            continue;
        }
        if let Some(sni) = message.get(Tag::SNI) {
            return Ok(Some(String::from_utf8_lossy(sni).into_owned()));
        }
    }

    if frames_seen == 0 {
        return Err(SniError::NoFrames);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{DefaultFrameSerializer, FrameSerializer, StreamFrame};
    use crate::handshake::NullAead;
    use crate::types::{ConnectionId, StreamId, SUPPORTED_VERSION};
    use bytes::BytesMut;

    fn initial_packet(frames: &[Frame], version: bool) -> Vec<u8> {
        let header = PublicHeader::new(ConnectionId(0x1234), 1, version.then_some(SUPPORTED_VERSION));
        let mut raw_header = BytesMut::new();
        header.write(&mut raw_header).unwrap();

        let mut payload = BytesMut::new();
        for frame in frames {
            DefaultFrameSerializer.serialize_frame(frame, &mut payload).unwrap();
        }
        let mut packet = raw_header.to_vec();
        packet.extend_from_slice(&NullAead.seal(&raw_header, &payload));
        packet
    }

    fn handshake_frame(message: HandshakeMessage) -> Frame {
        Frame::Stream(StreamFrame {
            stream_id: StreamId::HANDSHAKE,
            offset: 0,
            data: message.to_bytes(),
            fin: false,
        })
    }

    #[test]
    fn test_extracts_sni() {
        let chlo = HandshakeMessage::new(Tag::CHLO).with(Tag::SNI, &b"quic.example"[..]);
        let packet = initial_packet(&[handshake_frame(chlo)], true);
        assert_eq!(parse_client_hello_sni(&packet), Ok(Some("quic.example".to_string())));
    }

    #[test]
    fn test_chlo_without_sni() {
        let chlo = HandshakeMessage::new(Tag::CHLO).with(Tag::VER, &b"Q039"[..]);
        let packet = initial_packet(&[Frame::Ping, handshake_frame(chlo)], true);
        assert_eq!(parse_client_hello_sni(&packet), Ok(None));
    }

    #[test]
    fn test_ignores_other_messages() {
        let shlo = HandshakeMessage::new(Tag::SHLO).with(Tag::SNI, &b"wrong"[..]);
        let chlo = HandshakeMessage::new(Tag::CHLO).with(Tag::SNI, &b"right"[..]);
        let packet = initial_packet(&[handshake_frame(shlo), handshake_frame(chlo)], true);
        assert_eq!(parse_client_hello_sni(&packet), Ok(Some("right".to_string())));
    }

    #[test]
    fn test_too_short() {
        assert_eq!(parse_client_hello_sni(&[0x09; 10]), Err(SniError::PacketTooShort));
    }

    #[test]
    fn test_requires_version() {
        let chlo = HandshakeMessage::new(Tag::CHLO).with(Tag::SNI, &b"quic.example"[..]);
        let packet = initial_packet(&[handshake_frame(chlo)], false);
        assert_eq!(parse_client_hello_sni(&packet), Err(SniError::NotInitialPacket));
    }

    #[test]
    fn test_no_frames() {
        // header and hash only
        let packet = initial_packet(&[], true);
        assert!(packet.len() >= MIN_INITIAL_PACKET_LEN);
        assert_eq!(parse_client_hello_sni(&packet), Err(SniError::NoFrames));
    }

    #[test]
    fn test_bad_frame() {
        let mut packet = initial_packet(&[Frame::Ping], true);
        packet.push(0x3f);
        assert!(matches!(parse_client_hello_sni(&packet), Err(SniError::Frame(_))));
    }
}
