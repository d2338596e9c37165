//! Error Types
//!
//! Three layers of errors flow through the engine:
//! - **DecodeError**: malformed bytes on the wire (headers, frames, handshake messages)
//! - **HandshakeError**: failures reported by the crypto setup
//! - **Error**: everything a session, a stream or a caller can observe
//!
//! `Error` is `Clone` because a single terminal error is fanned out to every
//! stream of a closing session, and each blocked reader must see the exact
//! same value.

#![forbid(unsafe_code)]

use std::io;

use thiserror::Error;

use crate::types::StreamId;

/// Result type for session and stream operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Connection error codes carried in CONNECTION_CLOSE frames.
///
/// Values follow the gQUIC `QuicErrorCode` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0,
    InternalError = 1,
    InvalidPacketHeader = 3,
    InvalidFrameData = 4,
    InvalidRstStreamData = 6,
    PeerGoingAway = 16,
    InvalidStreamId = 17,
    TooManyOpenStreams = 18,
    PublicReset = 19,
    NetworkIdleTimeout = 25,
    PacketWriteError = 27,
    HandshakeFailed = 28,
    InvalidStreamData = 46,
    InvalidWindowUpdateData = 57,
    FlowControlReceivedTooMuchData = 59,
    HandshakeTimeout = 67,
}

impl ErrorCode {
    /// Maps a wire value back to a known code, if any.
    pub fn from_u32(value: u32) -> Option<Self> {
        let code = match value {
            0 => Self::NoError,
            1 => Self::InternalError,
            3 => Self::InvalidPacketHeader,
            4 => Self::InvalidFrameData,
            6 => Self::InvalidRstStreamData,
            16 => Self::PeerGoingAway,
            17 => Self::InvalidStreamId,
            18 => Self::TooManyOpenStreams,
            19 => Self::PublicReset,
            25 => Self::NetworkIdleTimeout,
            27 => Self::PacketWriteError,
            28 => Self::HandshakeFailed,
            46 => Self::InvalidStreamData,
            57 => Self::InvalidWindowUpdateData,
            59 => Self::FlowControlReceivedTooMuchData,
            67 => Self::HandshakeTimeout,
            _ => return None,
        };
        Some(code)
    }
}

/// Errors produced while decoding bytes received from the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),

    #[error("invalid public header: {0}")]
    InvalidHeader(&'static str),

    #[error("unsupported version {0}")]
    UnsupportedVersion(String),

    #[error("packet authentication failed")]
    AuthenticationFailed,

    #[error("invalid handshake message: {0}")]
    InvalidHandshakeMessage(&'static str),
}

/// Failures reported by a [`CryptoSetup`](crate::handshake::CryptoSetup).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The first message from the client was not a CHLO.
    #[error("expected initial handshake message")]
    ExpectedInitialMessage,

    /// The server answered the CHLO with something other than SHLO.
    #[error("expected server hello")]
    ExpectedServerHello,

    #[error("unexpected handshake message {0} after completion")]
    UnexpectedMessage(String),

    #[error("malformed handshake message: {0}")]
    Malformed(DecodeError),

    #[error("handshake message exceeds {0} bytes")]
    MessageTooLarge(usize),
}

/// Errors observable by sessions, streams and their callers.
///
/// Blocked readers and writers receive the precise variant so that a
/// graceful shutdown can be told apart from a peer reset or a protocol
/// violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // ------------------------------------------------------------------
    // Per-stream
    // ------------------------------------------------------------------
    #[error("RST_STREAM received with code {code}")]
    ResetByPeer { code: u32 },

    #[error("stream reset locally with code {code}")]
    StreamReset { code: u32 },

    #[error("write on a finished stream")]
    WriteAfterFinish,

    #[error("reopening streams is not allowed")]
    ReopeningStream,

    #[error("stream {0} already exists")]
    StreamExists(StreamId),

    #[error("stream data beyond the final offset")]
    InvalidFinalOffset,

    #[error("stream id {0} is reserved")]
    ReservedStreamId(StreamId),

    #[error("peer referenced stream {0}, which only this side may open")]
    UnopenedLocalStream(StreamId),

    // ------------------------------------------------------------------
    // Frame routing
    // ------------------------------------------------------------------
    #[error("RST_STREAM received for an invalid stream")]
    RstStreamOnInvalidStream,

    #[error("WINDOW_UPDATE received for an invalid stream")]
    WindowUpdateOnInvalidStream,

    // ------------------------------------------------------------------
    // Decode / encode
    // ------------------------------------------------------------------
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(&'static str),

    // ------------------------------------------------------------------
    // Session-fatal
    // ------------------------------------------------------------------
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("flow control violation: data beyond the receive window")]
    FlowControlViolation,

    #[error("peer exceeded the limit of {0} open streams")]
    TooManyOpenStreams(usize),

    #[error("network write failed: {0}")]
    Network(String),

    #[error("peer closed the connection with code {code}: {reason}")]
    PeerClosed { code: u32, reason: String },

    #[error("public reset received (rejected packet {rejected_packet_number})")]
    PublicReset { rejected_packet_number: u64 },

    #[error("no network activity within the idle timeout")]
    IdleTimeout,

    #[error("handshake did not complete in time")]
    HandshakeTimeout,

    #[error("closed by application with code {code}: {reason}")]
    Application { code: u32, reason: String },

    #[error("session closed")]
    SessionClosed,
}

impl Error {
    /// Whether this error must tear the whole session down.
    ///
    /// Per-stream and frame-routing errors are reported to the caller but do
    /// not close the session on their own.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ResetByPeer { .. }
                | Error::StreamReset { .. }
                | Error::WriteAfterFinish
                | Error::ReopeningStream
                | Error::StreamExists(_)
                | Error::ReservedStreamId(_)
                | Error::UnopenedLocalStream(_)
                | Error::RstStreamOnInvalidStream
                | Error::WindowUpdateOnInvalidStream
                | Error::Decode(_)
        )
    }

    /// Whether closing with this error may answer the peer with a public
    /// reset. Only protocol violations qualify; timeouts, application
    /// closes and peer-initiated endings never do.
    pub fn warrants_public_reset(&self) -> bool {
        !matches!(
            self,
            Error::IdleTimeout
                | Error::HandshakeTimeout
                | Error::Application { .. }
                | Error::SessionClosed
                | Error::PeerClosed { .. }
                | Error::PublicReset { .. }
                | Error::Network(_)
        )
    }

    /// Error code sent in a CONNECTION_CLOSE frame for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ResetByPeer { .. } | Error::StreamReset { .. } => ErrorCode::InvalidRstStreamData,
            Error::WriteAfterFinish | Error::InvalidFinalOffset => ErrorCode::InvalidStreamData,
            Error::ReopeningStream
            | Error::StreamExists(_)
            | Error::ReservedStreamId(_)
            | Error::UnopenedLocalStream(_) => ErrorCode::InvalidStreamId,
            Error::TooManyOpenStreams(_) => ErrorCode::TooManyOpenStreams,
            Error::RstStreamOnInvalidStream => ErrorCode::InvalidRstStreamData,
            Error::WindowUpdateOnInvalidStream => ErrorCode::InvalidWindowUpdateData,
            Error::Decode(DecodeError::InvalidHeader(_)) => ErrorCode::InvalidPacketHeader,
            Error::Decode(_) => ErrorCode::InvalidFrameData,
            Error::Encode(_) => ErrorCode::InternalError,
            Error::Handshake(_) => ErrorCode::HandshakeFailed,
            Error::FlowControlViolation => ErrorCode::FlowControlReceivedTooMuchData,
            Error::Network(_) => ErrorCode::PacketWriteError,
            Error::PeerClosed { .. } => ErrorCode::PeerGoingAway,
            Error::PublicReset { .. } => ErrorCode::PublicReset,
            Error::IdleTimeout => ErrorCode::NetworkIdleTimeout,
            Error::HandshakeTimeout => ErrorCode::HandshakeTimeout,
            Error::Application { .. } => ErrorCode::PeerGoingAway,
            Error::SessionClosed => ErrorCode::NoError,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::ResetByPeer { .. } | Error::StreamReset { .. } => io::ErrorKind::ConnectionReset,
            Error::SessionClosed | Error::PeerClosed { .. } | Error::PublicReset { .. } => {
                io::ErrorKind::ConnectionAborted
            }
            Error::IdleTimeout | Error::HandshakeTimeout => io::ErrorKind::TimedOut,
            Error::WriteAfterFinish => io::ErrorKind::BrokenPipe,
            Error::ReservedStreamId(_) | Error::StreamExists(_) => io::ErrorKind::InvalidInput,
            Error::Decode(_) | Error::InvalidFinalOffset => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_message_carries_code() {
        let err = Error::ResetByPeer { code: 42 };
        assert_eq!(err.to_string(), "RST_STREAM received with code 42");
    }

    #[test]
    fn test_handshake_error_is_transparent() {
        let err: Error = HandshakeError::ExpectedInitialMessage.into();
        assert_eq!(err.to_string(), "expected initial handshake message");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_routing_errors_are_not_fatal() {
        assert!(!Error::RstStreamOnInvalidStream.is_fatal());
        assert!(!Error::WindowUpdateOnInvalidStream.is_fatal());
        assert!(!Error::ReopeningStream.is_fatal());
        assert!(Error::FlowControlViolation.is_fatal());
    }

    #[test]
    fn test_public_reset_only_for_protocol_violations() {
        assert!(Error::FlowControlViolation.warrants_public_reset());
        assert!(Error::Handshake(HandshakeError::ExpectedInitialMessage).warrants_public_reset());
        assert!(!Error::IdleTimeout.warrants_public_reset());
        assert!(!Error::HandshakeTimeout.warrants_public_reset());
        assert!(!Error::Application {
            code: 7,
            reason: String::new()
        }
        .warrants_public_reset());
        assert!(!Error::SessionClosed.warrants_public_reset());
    }

    #[test]
    fn test_error_code_round_trip() {
        for code in [ErrorCode::NoError, ErrorCode::HandshakeFailed, ErrorCode::HandshakeTimeout] {
            assert_eq!(ErrorCode::from_u32(code as u32), Some(code));
        }
        assert_eq!(ErrorCode::from_u32(9999), None);
    }

    #[test]
    fn test_io_error_preserves_source() {
        let io_err: io::Error = Error::ResetByPeer { code: 7 }.into();
        assert_eq!(io_err.kind(), io::ErrorKind::ConnectionReset);
        let inner = io_err.get_ref().and_then(|e| e.downcast_ref::<Error>());
        assert_eq!(inner, Some(&Error::ResetByPeer { code: 7 }));
    }
}
