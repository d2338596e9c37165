//! Received packet tracking.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use tokio::time::Instant;

use super::ReceivedPacketHandler;
use crate::frames::{AckFrame, AckRange};
use crate::types::PacketNumber;

/// Packet numbers remembered for duplicate detection and ACK ranges.
const MAX_TRACKED_PACKETS: usize = 1024;

/// Ranges carried in one ACK frame.
const MAX_ACK_RANGES: usize = 64;

/// Tracks received packet numbers in a bounded ordered set.
///
/// An ACK becomes due whenever a retransmittable packet arrives and stays
/// due until [`ack_frame`](ReceivedPacketHandler::ack_frame) hands it out.
#[derive(Debug)]
pub struct DefaultReceivedPacketHandler {
    received: BTreeSet<PacketNumber>,
    largest_observed: Option<(PacketNumber, Instant)>,
    ack_due: bool,
}

impl Default for DefaultReceivedPacketHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultReceivedPacketHandler {
    pub fn new() -> Self {
        Self {
            received: BTreeSet::new(),
            largest_observed: None,
            ack_due: false,
        }
    }

    fn ranges(&self) -> Vec<AckRange> {
        let mut ranges: Vec<AckRange> = Vec::new();
        for &pn in self.received.iter().rev() {
            match ranges.last_mut() {
                Some(range) if range.first == pn + 1 => range.first = pn,
                _ => {
                    if ranges.len() == MAX_ACK_RANGES {
                        break;
                    }
                    ranges.push(AckRange { first: pn, last: pn });
                }
            }
        }
        ranges
    }
}

impl ReceivedPacketHandler for DefaultReceivedPacketHandler {
    fn received_packet(&mut self, packet_number: PacketNumber, retransmittable: bool, now: Instant) -> bool {
        let below_window = self.received.len() >= MAX_TRACKED_PACKETS
            && self.received.first().is_some_and(|&lowest| packet_number < lowest);
        if below_window || !self.received.insert(packet_number) {
            return false;
        }

        while self.received.len() > MAX_TRACKED_PACKETS {
            self.received.pop_first();
        }

        if self.largest_observed.map_or(true, |(largest, _)| packet_number > largest) {
            self.largest_observed = Some((packet_number, now));
        }
        if retransmittable {
            self.ack_due = true;
        }
        true
    }

    fn ack_frame(&mut self, now: Instant) -> Option<AckFrame> {
        if !self.ack_due {
            return None;
        }
        let (largest, received_at) = self.largest_observed?;
        self.ack_due = false;

        Some(AckFrame {
            largest_observed: largest,
            ack_delay: now.saturating_duration_since(received_at),
            ranges: self.ranges(),
        })
    }

    fn ack_due(&self) -> bool {
        self.ack_due
    }

    fn largest_observed(&self) -> Option<PacketNumber> {
        self.largest_observed.map(|(pn, _)| pn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_ack_before_any_packet() {
        let mut handler = DefaultReceivedPacketHandler::new();
        assert!(handler.ack_frame(Instant::now()).is_none());
        assert_eq!(handler.largest_observed(), None);
    }

    #[test]
    fn test_ack_due_after_retransmittable_packet() {
        let mut handler = DefaultReceivedPacketHandler::new();
        let now = Instant::now();
        assert!(handler.received_packet(1, true, now));

        let ack = handler.ack_frame(now).unwrap();
        assert_eq!(ack.largest_observed, 1);
        assert_eq!(ack.ranges, vec![AckRange { first: 1, last: 1 }]);
        // handed out once
        assert!(handler.ack_frame(now).is_none());
    }

    #[test]
    fn test_ack_only_packets_do_not_elicit_ack() {
        let mut handler = DefaultReceivedPacketHandler::new();
        handler.received_packet(1, false, Instant::now());
        assert!(!handler.ack_due());
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut handler = DefaultReceivedPacketHandler::new();
        let now = Instant::now();
        assert!(handler.received_packet(7, true, now));
        assert!(!handler.received_packet(7, true, now));
    }

    #[test]
    fn test_ranges_describe_gaps() {
        let mut handler = DefaultReceivedPacketHandler::new();
        let now = Instant::now();
        for pn in [1, 2, 3, 6, 7, 10] {
            handler.received_packet(pn, true, now);
        }
        let ack = handler.ack_frame(now).unwrap();
        assert_eq!(ack.largest_observed, 10);
        assert_eq!(
            ack.ranges,
            vec![
                AckRange { first: 10, last: 10 },
                AckRange { first: 6, last: 7 },
                AckRange { first: 1, last: 3 },
            ]
        );
    }

    #[test]
    fn test_tracking_is_bounded() {
        let mut handler = DefaultReceivedPacketHandler::new();
        let now = Instant::now();
        for pn in 1..=(MAX_TRACKED_PACKETS as u64 + 10) {
            handler.received_packet(pn, false, now);
        }
        assert_eq!(handler.received.len(), MAX_TRACKED_PACKETS);
        // forgotten packets are treated as duplicates
        assert!(!handler.received_packet(1, true, now));
    }
}
