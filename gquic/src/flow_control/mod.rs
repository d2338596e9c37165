//! # Flow Control
//!
//! Credit-based flow control at two levels:
//! - **Stream-level**: bytes on one stream, one [`FlowController`] each
//! - **Connection-level**: bytes across all streams
//!
//! Credit is granted with WINDOW_UPDATE frames (stream id 0 for the
//! connection) and exhaustion is signalled with BLOCKED. The handshake stream
//! has its own stream-level window but is not counted against the
//! connection.

#![forbid(unsafe_code)]

mod controller;

pub use controller::FlowController;

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::frames::{BlockedFrame, WindowUpdateFrame};
use crate::types::{StreamId, StreamOffset};

/// Flow Control Manager
///
/// Coordinates the connection-level controller with one controller per
/// live stream.
#[derive(Debug)]
pub struct FlowControlManager {
    connection: FlowController,
    streams: HashMap<StreamId, FlowController>,
    stream_send_window: u64,
    stream_receive_window: u64,
}

impl FlowControlManager {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            connection: FlowController::new(
                StreamId::CONNECTION,
                config.initial_connection_send_window,
                config.initial_connection_receive_window,
            ),
            streams: HashMap::new(),
            stream_send_window: config.initial_stream_send_window,
            stream_receive_window: config.initial_stream_receive_window,
        }
    }

    /// Create the controller for a newly opened stream.
    pub fn new_stream(&mut self, stream_id: StreamId) {
        self.streams.entry(stream_id).or_insert_with(|| {
            FlowController::new(stream_id, self.stream_send_window, self.stream_receive_window)
        });
    }

    pub fn remove_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Account data the peer sent on `stream_id` up to `offset`.
    pub fn update_highest_received(&mut self, stream_id: StreamId, offset: StreamOffset) -> Result<()> {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            trace!(stream_id = %stream_id, "no flow controller for stream");
            return Ok(());
        };

        let increment = stream.update_highest_received(offset)?;
        if increment == 0 {
            return Ok(());
        }
        // nobody will read it, so it is consumed on arrival
        let discarded = stream.is_abandoned();
        if discarded {
            stream.add_bytes_read(increment);
        }
        if !stream_id.is_handshake() {
            let connection_offset = self.connection.highest_received() + increment;
            self.connection.update_highest_received(connection_offset)?;
            if discarded {
                self.connection.add_bytes_read(increment);
            }
        }
        Ok(())
    }

    /// Account bytes handed to the application.
    pub fn add_bytes_read(&mut self, stream_id: StreamId, n: u64) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.is_abandoned() {
                return;
            }
            stream.add_bytes_read(n);
            if !stream_id.is_handshake() {
                self.connection.add_bytes_read(n);
            }
        }
    }

    /// Stop waiting for the application to read `stream_id`.
    ///
    /// Received bytes it never consumed are credited to the connection so a
    /// reset or collected stream cannot shrink the connection window.
    /// Returns the number of bytes credited.
    pub fn abandon_stream(&mut self, stream_id: StreamId) -> u64 {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return 0;
        };
        let unread = stream.abandon();
        if stream_id.is_handshake() {
            return 0;
        }
        if unread > 0 {
            trace!(stream_id = %stream_id, unread, "crediting unread bytes to the connection");
            self.connection.add_bytes_read(unread);
        }
        unread
    }

    /// Bytes `stream_id` may send right now, bounded by both levels.
    pub fn send_window_size(&self, stream_id: StreamId) -> u64 {
        let Some(stream) = self.streams.get(&stream_id) else {
            return 0;
        };
        if stream_id.is_handshake() {
            stream.send_window_size()
        } else {
            stream.send_window_size().min(self.connection.send_window_size())
        }
    }

    pub fn connection_send_window_size(&self) -> u64 {
        self.connection.send_window_size()
    }

    pub fn add_bytes_sent(&mut self, stream_id: StreamId, n: u64) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.add_bytes_sent(n);
            if !stream_id.is_handshake() {
                self.connection.add_bytes_sent(n);
            }
        }
    }

    /// Apply a WINDOW_UPDATE for a stream. Returns `true` if the window grew.
    pub fn update_send_window(&mut self, stream_id: StreamId, offset: StreamOffset) -> Result<bool> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::WindowUpdateOnInvalidStream)?;
        let updated = stream.update_send_window(offset);
        if updated {
            debug!(stream_id = %stream_id, offset, "stream send window raised");
        }
        Ok(updated)
    }

    /// Apply a WINDOW_UPDATE for the connection.
    pub fn update_connection_send_window(&mut self, offset: StreamOffset) -> bool {
        let updated = self.connection.update_send_window(offset);
        if updated {
            debug!(offset, "connection send window raised");
        }
        updated
    }

    /// WINDOW_UPDATE frames that are due, connection first, then by stream id.
    pub fn window_updates(&mut self) -> Vec<WindowUpdateFrame> {
        let mut updates = Vec::new();
        if let Some(byte_offset) = self.connection.maybe_window_update() {
            updates.push(WindowUpdateFrame {
                stream_id: StreamId::CONNECTION,
                byte_offset,
            });
        }

        let mut stream_updates: Vec<WindowUpdateFrame> = self
            .streams
            .iter_mut()
            .filter(|(_, fc)| !fc.is_abandoned())
            .filter_map(|(&stream_id, fc)| {
                fc.maybe_window_update()
                    .map(|byte_offset| WindowUpdateFrame { stream_id, byte_offset })
            })
            .collect();
        stream_updates.sort_by_key(|f| f.stream_id);
        updates.extend(stream_updates);
        updates
    }

    /// BLOCKED frame to report for `stream_id`, if its data is stuck.
    ///
    /// The stream's own window is reported before the connection's.
    pub fn blocked_frame(&mut self, stream_id: StreamId) -> Option<BlockedFrame> {
        let stream = self.streams.get_mut(&stream_id)?;
        if stream.should_send_blocked() {
            return Some(BlockedFrame { stream_id });
        }
        if stream.send_window_size() > 0 && !stream_id.is_handshake() && self.connection.should_send_blocked() {
            return Some(BlockedFrame {
                stream_id: StreamId::CONNECTION,
            });
        }
        None
    }
}
