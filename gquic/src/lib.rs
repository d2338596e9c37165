//! gquic: Connection Engine for a gQUIC-Style Transport
//!
//! This crate implements the per-connection core of a Google-QUIC era
//! transport: one [`Session`] per connection that demultiplexes packets into
//! ordered byte streams, enforces flow control, schedules transmission and
//! tears everything down exactly once.
//!
//! # Architecture
//!
//! - **Single task per session**: all connection state is owned by the task
//!   running [`Session::run`]; other tasks talk to it through a
//!   [`SessionHandle`]
//! - **Zero-copy payloads**: received stream data stays in `bytes::Bytes`
//!   slices of the original datagram until the application reads it
//! - **Coalesced sending**: writes and inbound packets set one flag, the
//!   session drains it in bounded rounds
//! - **Pluggable collaborators**: crypto, packet accounting and the network
//!   writer are trait objects
//!
//! # Module Organization
//!
//! - `types`: identifiers, tags and the varint codec
//! - `frames`: frame values, parser and serializer
//! - `packet`: public header and public reset
//! - `handshake`: crypto setup trait, message codec, handshake adapter
//! - `recovery`: sent/received packet accounting
//! - `flow_control`: stream and connection windows
//! - `stream`: stream handles, reassembly, the stream table
//! - `session`: the state machine, its handle and the send scheduler
//! - `sni`: stateless SNI extraction from a client's first packet

pub mod config;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod handshake;
pub mod packet;
pub mod recovery;
pub mod session;
pub mod sni;
pub mod stream;
pub mod types;

// Re-export key types
pub use config::SessionConfig;
pub use error::{DecodeError, Error, ErrorCode, HandshakeError, Result};
pub use handshake::{CryptoSetup, NullCryptoSetup};
pub use session::{
    ClosedCallback, ConnectionWriter, Session, SessionHandle, SessionState, SessionStats, StreamCallback,
};
pub use stream::Stream;
pub use types::{ConnectionId, Perspective, StreamId};
