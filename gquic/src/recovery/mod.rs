//! # Packet Accounting
//!
//! The session does not reimplement acknowledgement or loss bookkeeping; it
//! calls into a [`SentPacketHandler`] and a [`ReceivedPacketHandler`] and
//! treats them as opaque accounting objects. Retransmission and congestion
//! control live behind these traits, outside the connection engine.

#![forbid(unsafe_code)]

mod received;
mod sent;

pub use received::DefaultReceivedPacketHandler;
pub use sent::DefaultSentPacketHandler;

use core::time::Duration;

use tokio::time::Instant;

use crate::error::Result;
use crate::frames::AckFrame;
use crate::types::PacketNumber;

/// Metadata of a packet handed to the network.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub packet_number: PacketNumber,
    pub length: usize,
    /// Whether the peer must acknowledge it
    pub retransmittable: bool,
    pub sent_time: Instant,
}

/// Sent packet accounting.
pub trait SentPacketHandler: Send {
    /// Register a packet that was just written.
    fn sent_packet(&mut self, packet: SentPacket) -> Result<()>;

    /// Apply an ACK received from the peer.
    fn received_ack(&mut self, ack: &AckFrame, now: Instant) -> Result<()>;

    /// Bytes of retransmittable packets not yet acknowledged.
    fn bytes_in_flight(&self) -> u64;

    /// Number of packets awaiting acknowledgement.
    fn outstanding(&self) -> usize;

    fn largest_acked(&self) -> Option<PacketNumber>;

    /// Most recent round-trip sample.
    fn latest_rtt(&self) -> Option<Duration>;
}

/// Received packet accounting and ACK generation.
pub trait ReceivedPacketHandler: Send {
    /// Register a received packet. Returns `false` for duplicates, which
    /// the caller must not process again.
    fn received_packet(&mut self, packet_number: PacketNumber, retransmittable: bool, now: Instant) -> bool;

    /// The ACK frame to send, if one is due. Taking it clears the due flag.
    fn ack_frame(&mut self, now: Instant) -> Option<AckFrame>;

    /// Whether an ACK is currently owed to the peer.
    fn ack_due(&self) -> bool;

    fn largest_observed(&self) -> Option<PacketNumber>;
}
