//! Sent packet tracking.

#![forbid(unsafe_code)]

use core::time::Duration;
use std::collections::BTreeMap;

use tokio::time::Instant;
use tracing::trace;

use super::{SentPacket, SentPacketHandler};
use crate::error::{DecodeError, Error, Result};
use crate::frames::AckFrame;
use crate::types::PacketNumber;

/// Keeps every unacknowledged packet keyed by packet number.
#[derive(Debug, Default)]
pub struct DefaultSentPacketHandler {
    sent_packets: BTreeMap<PacketNumber, SentPacket>,
    largest_sent: Option<PacketNumber>,
    largest_acked: Option<PacketNumber>,
    bytes_in_flight: u64,
    latest_rtt: Option<Duration>,
}

impl DefaultSentPacketHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SentPacketHandler for DefaultSentPacketHandler {
    fn sent_packet(&mut self, packet: SentPacket) -> Result<()> {
        if self.largest_sent.is_some_and(|largest| packet.packet_number <= largest) {
            return Err(Error::Encode("packet numbers must increase"));
        }
        self.largest_sent = Some(packet.packet_number);
        if packet.retransmittable {
            self.bytes_in_flight += packet.length as u64;
        }
        self.sent_packets.insert(packet.packet_number, packet);
        Ok(())
    }

    fn received_ack(&mut self, ack: &AckFrame, now: Instant) -> Result<()> {
        if self.largest_sent.map_or(true, |largest| ack.largest_observed > largest) {
            return Err(Error::Decode(DecodeError::InvalidFrame(
                "ack for a packet that was never sent",
            )));
        }

        if self.largest_acked.map_or(true, |largest| ack.largest_observed > largest) {
            self.largest_acked = Some(ack.largest_observed);
            if let Some(packet) = self.sent_packets.get(&ack.largest_observed) {
                let rtt = now
                    .saturating_duration_since(packet.sent_time)
                    .saturating_sub(ack.ack_delay);
                self.latest_rtt = Some(rtt);
            }
        }

        let acked: Vec<PacketNumber> = self
            .sent_packets
            .range(ack.lowest_acked()..=ack.largest_observed)
            .filter(|(pn, _)| ack.acks(**pn))
            .map(|(pn, _)| *pn)
            .collect();
        for pn in acked {
            if let Some(packet) = self.sent_packets.remove(&pn) {
                if packet.retransmittable {
                    self.bytes_in_flight = self.bytes_in_flight.saturating_sub(packet.length as u64);
                }
                trace!(packet_number = pn, "packet acknowledged");
            }
        }
        Ok(())
    }

    fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    fn outstanding(&self) -> usize {
        self.sent_packets.len()
    }

    fn largest_acked(&self) -> Option<PacketNumber> {
        self.largest_acked
    }

    fn latest_rtt(&self) -> Option<Duration> {
        self.latest_rtt
    }
}
