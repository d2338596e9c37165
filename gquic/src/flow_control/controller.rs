//! Window accounting for one stream or for the whole connection.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::types::{StreamId, StreamOffset};

/// Flow Controller
///
/// Tracks both directions of one flow-controlled entity:
///
/// - **send**: the offset the peer allows us to send up to, and how much we
///   have sent.
/// - **receive**: the offset we allow the peer to send up to, the highest
///   offset it has actually reached, and how much the application consumed.
///
/// Windows only ever move forward.
#[derive(Debug, Clone)]
pub struct FlowController {
    stream_id: StreamId,

    send_window: StreamOffset,
    bytes_sent: u64,
    /// Send window value at which BLOCKED was last reported
    last_blocked_at: Option<StreamOffset>,

    receive_window: StreamOffset,
    receive_window_increment: u64,
    highest_received: StreamOffset,
    bytes_read: u64,
    /// Set once the application will never read the rest of the data
    abandoned: bool,
}

impl FlowController {
    pub fn new(stream_id: StreamId, send_window: u64, receive_window: u64) -> Self {
        Self {
            stream_id,
            send_window,
            bytes_sent: 0,
            last_blocked_at: None,
            receive_window,
            receive_window_increment: receive_window,
            highest_received: 0,
            bytes_read: 0,
            abandoned: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    // ------------------------------------------------------------------
    // Send side
    // ------------------------------------------------------------------

    /// Bytes we may still send.
    pub fn send_window_size(&self) -> u64 {
        self.send_window.saturating_sub(self.bytes_sent)
    }

    pub fn send_window(&self) -> StreamOffset {
        self.send_window
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
    }

    /// Raise the send window. Returns `true` if it moved.
    pub fn update_send_window(&mut self, offset: StreamOffset) -> bool {
        if offset > self.send_window {
            self.send_window = offset;
            true
        } else {
            false
        }
    }

    /// Whether a BLOCKED frame should be sent now.
    ///
    /// Fires once per exhausted window: after reporting, it stays quiet until
    /// the peer raises the window and we run dry again.
    pub fn should_send_blocked(&mut self) -> bool {
        if self.send_window_size() > 0 || self.last_blocked_at == Some(self.send_window) {
            return false;
        }
        self.last_blocked_at = Some(self.send_window);
        true
    }

    // ------------------------------------------------------------------
    // Receive side
    // ------------------------------------------------------------------

    pub fn receive_window(&self) -> StreamOffset {
        self.receive_window
    }

    pub fn highest_received(&self) -> StreamOffset {
        self.highest_received
    }

    /// Record that the peer sent data up to `offset`.
    ///
    /// Returns how far the highest received offset advanced, which the
    /// connection-level controller accounts on top of its own.
    pub fn update_highest_received(&mut self, offset: StreamOffset) -> Result<u64> {
        if offset > self.receive_window {
            return Err(Error::FlowControlViolation);
        }
        let increment = offset.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(offset);
        Ok(increment)
    }

    pub fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read += n;
    }

    /// Treat everything received so far as read, returning how many bytes
    /// that released. Later reads are ignored.
    pub fn abandon(&mut self) -> u64 {
        let unread = self.highest_received.saturating_sub(self.bytes_read);
        self.bytes_read = self.highest_received;
        self.abandoned = true;
        unread
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// New receive window to advertise, once the application has consumed
    /// at least half of the window increment.
    pub fn maybe_window_update(&mut self) -> Option<StreamOffset> {
        let remaining = self.receive_window.saturating_sub(self.bytes_read);
        if remaining > self.receive_window_increment / 2 {
            return None;
        }
        self.receive_window = self.bytes_read + self.receive_window_increment;
        Some(self.receive_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> FlowController {
        FlowController::new(StreamId(5), 100, 100)
    }

    #[test]
    fn test_send_window_never_decreases() {
        let mut fc = controller();
        assert!(fc.update_send_window(0x8000));
        assert!(!fc.update_send_window(50));
        assert!(!fc.update_send_window(0x8000));
        assert_eq!(fc.send_window(), 0x8000);
    }

    #[test]
    fn test_send_window_size_tracks_sent_bytes() {
        let mut fc = controller();
        fc.add_bytes_sent(60);
        assert_eq!(fc.send_window_size(), 40);
        fc.add_bytes_sent(40);
        assert_eq!(fc.send_window_size(), 0);
    }

    #[test]
    fn test_blocked_reported_once_per_window() {
        let mut fc = controller();
        assert!(!fc.should_send_blocked());
        fc.add_bytes_sent(100);
        assert!(fc.should_send_blocked());
        assert!(!fc.should_send_blocked());

        fc.update_send_window(150);
        fc.add_bytes_sent(50);
        assert!(fc.should_send_blocked());
    }

    #[test]
    fn test_receive_beyond_window_is_violation() {
        let mut fc = controller();
        assert_eq!(fc.update_highest_received(60).unwrap(), 60);
        // retransmission below the highest offset adds nothing
        assert_eq!(fc.update_highest_received(30).unwrap(), 0);
        assert_eq!(fc.update_highest_received(101), Err(Error::FlowControlViolation));
    }

    #[test]
    fn test_abandon_releases_unread_bytes() {
        let mut fc = controller();
        fc.update_highest_received(80).unwrap();
        fc.add_bytes_read(30);
        assert_eq!(fc.abandon(), 50);
        assert!(fc.is_abandoned());
        assert_eq!(fc.abandon(), 0);
    }

    #[test]
    fn test_window_update_after_half_consumed() {
        let mut fc = controller();
        fc.update_highest_received(100).unwrap();
        fc.add_bytes_read(49);
        assert_eq!(fc.maybe_window_update(), None);
        fc.add_bytes_read(1);
        assert_eq!(fc.maybe_window_update(), Some(150));
        assert_eq!(fc.receive_window(), 150);
        assert_eq!(fc.maybe_window_update(), None);
    }
}
