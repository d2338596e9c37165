//! # Handshake
//!
//! The session treats the cryptographic handshake as a black box behind
//! [`CryptoSetup`]: it consumes complete handshake messages, produces
//! replies and protects packets. [`HandshakeAdapter`] sits between that box
//! and the reserved handshake stream, turning a raw byte stream into
//! messages and messages back into bytes.

#![forbid(unsafe_code)]

mod message;
mod null;

pub use message::{HandshakeMessage, MAX_ENTRIES, MAX_MESSAGE_SIZE};
pub use null::{NullAead, NullCryptoSetup, NULL_AEAD_TAG_LEN};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::{DecodeError, HandshakeError};
use crate::types::PacketNumber;

/// Result of handing one message to a [`CryptoSetup`].
#[derive(Debug, Clone, Default)]
pub struct HandshakeOutput {
    /// Messages to send to the peer on the handshake stream
    pub replies: Vec<HandshakeMessage>,
    /// Whether the handshake finished with this message
    pub complete: bool,
}

/// Crypto Setup Trait
///
/// Message-in/message-out handshake plus packet protection. Implementations
/// never see raw stream bytes; framing is the adapter's job.
pub trait CryptoSetup: Send {
    /// Messages this endpoint sends before hearing from the peer.
    fn initial_messages(&mut self) -> Vec<HandshakeMessage>;

    /// Process one complete message from the peer.
    fn handle_message(&mut self, message: HandshakeMessage) -> Result<HandshakeOutput, HandshakeError>;

    fn is_complete(&self) -> bool;

    /// Protect `plaintext`, returning the bytes that follow the header.
    fn seal(&self, packet_number: PacketNumber, associated_data: &[u8], plaintext: &[u8]) -> Bytes;

    /// Remove packet protection.
    fn open(
        &self,
        packet_number: PacketNumber,
        associated_data: &[u8],
        ciphertext: &Bytes,
    ) -> Result<Bytes, DecodeError>;

    /// Bytes `seal` adds to every payload.
    fn seal_overhead(&self) -> usize;
}

/// What the adapter reports after each batch of handshake bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeProgress {
    NeedMoreData,
    Complete,
    Failed(HandshakeError),
}

/// Handshake Adapter
///
/// Accumulates bytes from the handshake stream, cuts them into messages for
/// the [`CryptoSetup`] and buffers encoded replies until the session writes
/// them back onto the same stream.
pub struct HandshakeAdapter {
    crypto: Box<dyn CryptoSetup>,
    inbound: BytesMut,
    outbound: BytesMut,
    messages_received: usize,
    failure: Option<HandshakeError>,
}

impl HandshakeAdapter {
    pub fn new(crypto: Box<dyn CryptoSetup>) -> Self {
        Self {
            crypto,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            messages_received: 0,
            failure: None,
        }
    }

    /// Queue the crypto setup's opening messages.
    pub fn start(&mut self) {
        for message in self.crypto.initial_messages() {
            trace!(tag = %message.tag, "queueing initial handshake message");
            message.write(&mut self.outbound);
        }
    }

    /// Feed bytes read from the handshake stream.
    ///
    /// Once failed, the adapter keeps reporting the same failure.
    pub fn feed(&mut self, data: &[u8]) -> HandshakeProgress {
        if let Some(err) = &self.failure {
            return HandshakeProgress::Failed(err.clone());
        }
        self.inbound.extend_from_slice(data);

        loop {
            match HandshakeMessage::parse(&self.inbound) {
                Ok((message, consumed)) => {
                    self.inbound.advance(consumed);
                    self.messages_received += 1;
                    debug!(tag = %message.tag, "handshake message received");

                    match self.crypto.handle_message(message) {
                        Ok(output) => {
                            for reply in output.replies {
                                reply.write(&mut self.outbound);
                            }
                        }
                        Err(err) => return self.fail(err),
                    }
                }
                Err(DecodeError::UnexpectedEnd) => break,
                Err(err) => return self.fail(HandshakeError::Malformed(err)),
            }
        }

        if self.inbound.len() > MAX_MESSAGE_SIZE {
            return self.fail(HandshakeError::MessageTooLarge(MAX_MESSAGE_SIZE));
        }

        if self.crypto.is_complete() {
            HandshakeProgress::Complete
        } else {
            HandshakeProgress::NeedMoreData
        }
    }

    fn fail(&mut self, err: HandshakeError) -> HandshakeProgress {
        self.failure = Some(err.clone());
        HandshakeProgress::Failed(err)
    }

    /// Encoded messages waiting to be written to the handshake stream.
    pub fn take_outgoing(&mut self) -> Option<Bytes> {
        if self.outbound.is_empty() {
            None
        } else {
            Some(self.outbound.split().freeze())
        }
    }

    /// Whether any complete message has arrived from the peer.
    pub fn has_received_message(&self) -> bool {
        self.messages_received > 0
    }

    pub fn is_complete(&self) -> bool {
        self.crypto.is_complete()
    }

    pub fn crypto(&self) -> &dyn CryptoSetup {
        self.crypto.as_ref()
    }
}
