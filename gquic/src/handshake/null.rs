//! Null crypto: an unauthenticated handshake and an integrity-only AEAD.
//!
//! The hello exchange carries no key material. Packets are protected by a
//! 96-bit FNV-1a hash over header and plaintext, which detects corruption
//! but offers no confidentiality.

#![forbid(unsafe_code)]

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::{CryptoSetup, HandshakeMessage, HandshakeOutput};
use crate::error::{DecodeError, HandshakeError};
use crate::types::{PacketNumber, Perspective, Tag, SUPPORTED_VERSION};

// ============================================================================
// Null AEAD
// ============================================================================

const FNV_OFFSET_BASIS: u128 = 0x6c62_272e_07bb_0142_62b8_2175_6295_c58d;
const FNV_PRIME: u128 = 0x0000_0000_0100_0000_0000_0000_0000_013b;

/// Length of the authentication hash prepended to each payload.
pub const NULL_AEAD_TAG_LEN: usize = 12;

fn fnv1a_128(parts: &[&[u8]]) -> u128 {
    let mut hash = FNV_OFFSET_BASIS;
    for part in parts {
        for &byte in *part {
            hash ^= byte as u128;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

/// Integrity-only packet protection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAead;

impl NullAead {
    fn tag(associated_data: &[u8], plaintext: &[u8]) -> [u8; NULL_AEAD_TAG_LEN] {
        let hash = fnv1a_128(&[associated_data, plaintext]).to_le_bytes();
        let mut tag = [0u8; NULL_AEAD_TAG_LEN];
        tag.copy_from_slice(&hash[..NULL_AEAD_TAG_LEN]);
        tag
    }

    pub fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(NULL_AEAD_TAG_LEN + plaintext.len());
        out.put_slice(&Self::tag(associated_data, plaintext));
        out.put_slice(plaintext);
        out.freeze()
    }

    pub fn open(&self, associated_data: &[u8], ciphertext: &Bytes) -> Result<Bytes, DecodeError> {
        if ciphertext.len() < NULL_AEAD_TAG_LEN {
            return Err(DecodeError::AuthenticationFailed);
        }
        let plaintext = ciphertext.slice(NULL_AEAD_TAG_LEN..);
        if Self::tag(associated_data, &plaintext)[..] != ciphertext[..NULL_AEAD_TAG_LEN] {
            return Err(DecodeError::AuthenticationFailed);
        }
        Ok(plaintext)
    }
}

// ============================================================================
// Null Crypto Setup
// ============================================================================

/// Hello exchange without key agreement.
///
/// The client opens with a CHLO carrying SNI and version; the server must
/// see a CHLO first, answers with SHLO and both sides are complete.
#[derive(Debug)]
pub struct NullCryptoSetup {
    perspective: Perspective,
    server_name: Option<String>,
    complete: bool,
    aead: NullAead,
}

impl NullCryptoSetup {
    pub fn server() -> Self {
        Self {
            perspective: Perspective::Server,
            server_name: None,
            complete: false,
            aead: NullAead,
        }
    }

    pub fn client(server_name: impl Into<String>) -> Self {
        Self {
            perspective: Perspective::Client,
            server_name: Some(server_name.into()),
            complete: false,
            aead: NullAead,
        }
    }

    /// SNI sent (client) or received (server).
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    fn client_hello(&self) -> HandshakeMessage {
        let mut chlo = HandshakeMessage::new(Tag::CHLO)
            .with(Tag::VER, Bytes::copy_from_slice(&SUPPORTED_VERSION.0));
        if let Some(name) = &self.server_name {
            chlo = chlo.with(Tag::SNI, Bytes::copy_from_slice(name.as_bytes()));
        }
        chlo
    }
}

impl CryptoSetup for NullCryptoSetup {
    fn initial_messages(&mut self) -> Vec<HandshakeMessage> {
        match self.perspective {
            Perspective::Client => vec![self.client_hello()],
            Perspective::Server => Vec::new(),
        }
    }

    fn handle_message(&mut self, message: HandshakeMessage) -> Result<HandshakeOutput, HandshakeError> {
        if self.complete {
            return Err(HandshakeError::UnexpectedMessage(message.tag.to_string()));
        }

        match self.perspective {
            Perspective::Server => {
                if message.tag != Tag::CHLO {
                    return Err(HandshakeError::ExpectedInitialMessage);
                }
                self.server_name = message
                    .get(Tag::SNI)
                    .map(|v| String::from_utf8_lossy(v).into_owned());
                debug!(sni = ?self.server_name, "received client hello");

                self.complete = true;
                let shlo = HandshakeMessage::new(Tag::SHLO)
                    .with(Tag::VER, Bytes::copy_from_slice(&SUPPORTED_VERSION.0));
                Ok(HandshakeOutput {
                    replies: vec![shlo],
                    complete: true,
                })
            }
            Perspective::Client => {
                if message.tag != Tag::SHLO {
                    return Err(HandshakeError::ExpectedServerHello);
                }
                self.complete = true;
                Ok(HandshakeOutput {
                    replies: Vec::new(),
                    complete: true,
                })
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }

    fn seal(&self, _packet_number: PacketNumber, associated_data: &[u8], plaintext: &[u8]) -> Bytes {
        self.aead.seal(associated_data, plaintext)
    }

    fn open(
        &self,
        _packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &Bytes,
    ) -> Result<Bytes, DecodeError> {
        self.aead.open(associated_data, ciphertext)
    }

    fn seal_overhead(&self) -> usize {
        NULL_AEAD_TAG_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_aead_round_trip() {
        let sealed = NullAead.seal(b"header", b"payload");
        assert_eq!(sealed.len(), NULL_AEAD_TAG_LEN + 7);
        assert_eq!(&NullAead.open(b"header", &sealed).unwrap()[..], b"payload");
    }

    #[test]
    fn test_null_aead_detects_tampering() {
        let sealed = NullAead.seal(b"header", b"payload");
        let mut tampered = sealed.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert_eq!(
            NullAead.open(b"header", &Bytes::from(tampered)),
            Err(DecodeError::AuthenticationFailed)
        );
        assert_eq!(
            NullAead.open(b"other", &sealed),
            Err(DecodeError::AuthenticationFailed)
        );
        assert_eq!(
            NullAead.open(b"header", &Bytes::from_static(b"short")),
            Err(DecodeError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_server_requires_client_hello_first() {
        let mut server = NullCryptoSetup::server();
        let err = server
            .handle_message(HandshakeMessage::new(Tag(*b"4242")))
            .unwrap_err();
        assert_eq!(err, HandshakeError::ExpectedInitialMessage);
        assert!(!server.is_complete());
    }

    #[test]
    fn test_hello_exchange() {
        let mut client = NullCryptoSetup::client("quic.example");
        let mut server = NullCryptoSetup::server();

        let chlo = client.initial_messages().pop().unwrap();
        let out = server.handle_message(chlo).unwrap();
        assert!(out.complete);
        assert_eq!(server.server_name(), Some("quic.example"));

        let shlo = out.replies.into_iter().next().unwrap();
        assert!(client.handle_message(shlo).unwrap().complete);
        assert!(client.is_complete());
    }

    #[test]
    fn test_client_rejects_unexpected_reply() {
        let mut client = NullCryptoSetup::client("quic.example");
        let err = client
            .handle_message(HandshakeMessage::new(Tag::CHLO))
            .unwrap_err();
        assert_eq!(err, HandshakeError::ExpectedServerHello);
    }
}
