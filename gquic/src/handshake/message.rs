//! Handshake message encoding.
//!
//! ```text
//! +--------+---------+---------+----------------------------+--------+
//! | tag(4) | count(2)| pad(2)  | count * (tag(4), end(4))   | values |
//! +--------+---------+---------+----------------------------+--------+
//! ```
//!
//! Integers are little-endian. Entries are sorted by tag and each `end` is
//! the offset one past the entry's value inside the values block.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::types::Tag;

/// Upper bound on entries in one message.
pub const MAX_ENTRIES: usize = 128;

/// Upper bound on the encoded size of one message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

const FIXED_HEADER_LEN: usize = 8;
const INDEX_ENTRY_LEN: usize = 8;

/// A tagged handshake message with its tag/value entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub tag: Tag,
    pub entries: BTreeMap<Tag, Bytes>,
}

impl HandshakeMessage {
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            entries: BTreeMap::new(),
        }
    }

    /// Builder-style entry insertion.
    pub fn with(mut self, tag: Tag, value: impl Into<Bytes>) -> Self {
        self.entries.insert(tag, value.into());
        self
    }

    pub fn get(&self, tag: Tag) -> Option<&Bytes> {
        self.entries.get(&tag)
    }

    /// Parse one message from the front of `buf`.
    ///
    /// Returns [`DecodeError::UnexpectedEnd`] when `buf` holds only a prefix
    /// of a message, so callers accumulating a byte stream can wait for more.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(DecodeError::UnexpectedEnd);
        }

        let tag = Tag([buf[0], buf[1], buf[2], buf[3]]);
        let count = u16::from_le_bytes([buf[4], buf[5]]) as usize;
        if count > MAX_ENTRIES {
            return Err(DecodeError::InvalidHandshakeMessage("too many entries"));
        }

        let index_end = FIXED_HEADER_LEN + count * INDEX_ENTRY_LEN;
        if buf.len() < index_end {
            return Err(DecodeError::UnexpectedEnd);
        }

        let mut index = Vec::with_capacity(count);
        let mut prev_end = 0usize;
        let mut prev_tag: Option<Tag> = None;
        for chunk in buf[FIXED_HEADER_LEN..index_end].chunks_exact(INDEX_ENTRY_LEN) {
            let entry_tag = Tag([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let end = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as usize;
            if end < prev_end {
                return Err(DecodeError::InvalidHandshakeMessage("end offsets decrease"));
            }
            if prev_tag.is_some_and(|p| p >= entry_tag) {
                return Err(DecodeError::InvalidHandshakeMessage("tags out of order"));
            }
            if index_end + end > MAX_MESSAGE_SIZE {
                return Err(DecodeError::InvalidHandshakeMessage("message too large"));
            }
            index.push((entry_tag, prev_end, end));
            prev_end = end;
            prev_tag = Some(entry_tag);
        }

        let total = index_end + prev_end;
        if buf.len() < total {
            return Err(DecodeError::UnexpectedEnd);
        }

        let values = &buf[index_end..total];
        let entries = index
            .into_iter()
            .map(|(t, start, end)| (t, Bytes::copy_from_slice(&values[start..end])))
            .collect();

        Ok((HandshakeMessage { tag, entries }, total))
    }

    /// Append the encoded message to `buf`.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.tag.0);
        buf.put_u16_le(self.entries.len() as u16);
        buf.put_u16_le(0);

        let mut end = 0u32;
        for (tag, value) in &self.entries {
            end += value.len() as u32;
            buf.put_u32_le(tag.as_u32());
            buf.put_u32_le(end);
        }
        for value in self.entries.values() {
            buf.put_slice(value);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write(&mut buf);
        buf.freeze()
    }

    pub fn encoded_len(&self) -> usize {
        FIXED_HEADER_LEN
            + self.entries.len() * INDEX_ENTRY_LEN
            + self.entries.values().map(Bytes::len).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encoding_is_stable() {
        let msg = HandshakeMessage::new(Tag::CHLO)
            .with(Tag::SNI, &b"example.org"[..])
            .with(Tag::VER, &b"Q039"[..]);
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[..4], b"CHLO");
        assert_eq!(bytes.len(), msg.encoded_len());

        let (parsed, consumed) = HandshakeMessage::parse(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(parsed, msg);
        assert_eq!(parsed.get(Tag::SNI).map(|v| &v[..]), Some(&b"example.org"[..]));
    }

    #[test]
    fn test_entries_sorted_by_integer_tag() {
        let msg = HandshakeMessage::new(Tag::PRST)
            .with(Tag::RSEQ, vec![1u8; 8])
            .with(Tag::RNON, vec![2u8; 8]);
        let bytes = msg.to_bytes();
        let first = Tag([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let second = Tag([bytes[16], bytes[17], bytes[18], bytes[19]]);
        assert!(first < second);
    }

    #[test]
    fn test_empty_message() {
        let (msg, consumed) = HandshakeMessage::parse(b"4242\0\0\0\0").unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(msg.tag, Tag(*b"4242"));
        assert!(msg.entries.is_empty());
    }

    #[test]
    fn test_prefix_is_incomplete() {
        let bytes = HandshakeMessage::new(Tag::CHLO)
            .with(Tag::SNI, &b"host"[..])
            .to_bytes();
        for cut in 0..bytes.len() {
            assert_eq!(
                HandshakeMessage::parse(&bytes[..cut]),
                Err(DecodeError::UnexpectedEnd),
                "prefix of length {}",
                cut
            );
        }
    }

    #[test]
    fn test_rejects_too_many_entries() {
        let mut raw = b"CHLO".to_vec();
        raw.extend_from_slice(&(MAX_ENTRIES as u16 + 1).to_le_bytes());
        raw.extend_from_slice(&[0, 0]);
        assert!(matches!(
            HandshakeMessage::parse(&raw),
            Err(DecodeError::InvalidHandshakeMessage(_))
        ));
    }

    #[test]
    fn test_rejects_decreasing_offsets() {
        let mut raw = b"CHLO".to_vec();
        raw.extend_from_slice(&2u16.to_le_bytes());
        raw.extend_from_slice(&[0, 0]);
        raw.extend_from_slice(&Tag::SNI.0);
        raw.extend_from_slice(&4u32.to_le_bytes());
        raw.extend_from_slice(&Tag::VER.0);
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(b"abcd");
        assert!(matches!(
            HandshakeMessage::parse(&raw),
            Err(DecodeError::InvalidHandshakeMessage(_))
        ));
    }
}
