//! # Packet Dispatch
//!
//! Inbound: open a packet, decode its frames and route each frame to the
//! stream table, flow control, the handshake adapter or packet accounting.
//!
//! Outbound: assemble packets from control frames and stream data, seal
//! them and hand them to the [`ConnectionWriter`](super::ConnectionWriter).

#![forbid(unsafe_code)]

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::Session;
use crate::error::{DecodeError, Error, ErrorCode, HandshakeError, Result};
use crate::frames::{
    ConnectionCloseFrame, Frame, FrameIterator, FrameSerializer, RstStreamFrame, StreamFrame,
    WindowUpdateFrame,
};
use crate::handshake::HandshakeProgress;
use crate::packet::{PublicHeader, PublicReset};
use crate::recovery::SentPacket;
use crate::stream::Stream;
use crate::types::{PacketNumber, StreamId, Tag, SUPPORTED_VERSION, VARINT_MAX};

/// Longest reason phrase put in a CONNECTION_CLOSE frame.
const MAX_CLOSE_REASON_LEN: usize = 256;

impl Session {
    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process the payload of one regular packet.
    ///
    /// Frames are applied in wire order. Per-stream errors do not stop the
    /// remaining frames; the first one is returned once all were applied.
    pub(super) fn handle_packet(&mut self, header: &PublicHeader, raw_header: &[u8], payload: Bytes) -> Result<()> {
        let frames = match self.decode_payload(header.packet_number, raw_header, &payload) {
            Ok(frames) => frames,
            Err(err) => {
                self.shared.stats.lock().packets_dropped += 1;
                // nothing but garbage from the peer so far
                if !self.handshake.has_received_message() {
                    return Err(HandshakeError::Malformed(err).into());
                }
                return Err(err.into());
            }
        };

        let now = Instant::now();
        let retransmittable = frames.iter().any(Frame::is_retransmittable);
        if !self
            .received_packets
            .received_packet(header.packet_number, retransmittable, now)
        {
            trace!(packet_number = header.packet_number, "dropping duplicate packet");
            self.shared.stats.lock().packets_dropped += 1;
            return Ok(());
        }
        self.largest_received_packet_number = self.largest_received_packet_number.max(header.packet_number);
        self.last_activity = now;

        trace!(
            packet_number = header.packet_number,
            frames = frames.len(),
            "packet received"
        );

        let mut first_error = None;
        for frame in frames {
            match self.handle_frame(frame) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(packet_number = header.packet_number, error = %err, "frame rejected");
                    first_error.get_or_insert(err);
                }
            }
            if self.closed {
                return Ok(());
            }
        }

        self.garbage_collect_streams();
        self.scheduler.schedule();
        first_error.map_or(Ok(()), Err)
    }

    fn decode_payload(
        &self,
        packet_number: PacketNumber,
        raw_header: &[u8],
        payload: &Bytes,
    ) -> core::result::Result<Vec<Frame>, DecodeError> {
        let plaintext = self.handshake.crypto().open(packet_number, raw_header, payload)?;
        FrameIterator::new(&self.parser, plaintext).collect()
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Stream(frame) => self.handle_stream_frame(&frame),
            Frame::RstStream(frame) => self.handle_rst_stream_frame(&frame),
            Frame::WindowUpdate(frame) => self.handle_window_update_frame(&frame),
            Frame::Ack(ack) => self.sent_packets.received_ack(&ack, Instant::now()),
            Frame::ConnectionClose(frame) => {
                info!(code = frame.error_code, reason = %frame.reason, "peer closed the connection");
                self.close(
                    Some(Error::PeerClosed {
                        code: frame.error_code,
                        reason: frame.reason,
                    }),
                    false,
                );
                Ok(())
            }
            Frame::Blocked(frame) => {
                debug!(stream_id = %frame.stream_id, "peer is blocked by flow control");
                Ok(())
            }
            Frame::Ping | Frame::Padding(_) => Ok(()),
        }
    }

    /// Route stream data, creating the stream on first sight.
    pub(super) fn handle_stream_frame(&mut self, frame: &StreamFrame) -> Result<()> {
        let id = frame.stream_id;
        if id == StreamId::CONNECTION {
            return Err(Error::ReservedStreamId(id));
        }
        if self.streams.is_tombstoned(id) {
            return Err(Error::ReopeningStream);
        }

        let stream = match self.streams.get(id) {
            Some(stream) => stream.clone(),
            None => {
                self.check_incoming_stream(id)?;
                let stream = self.create_stream(id)?;
                debug!(stream_id = %id, "peer opened stream");
                if let Some(callback) = self.stream_callback.as_mut() {
                    callback(&self.handle, stream.clone());
                }
                stream
            }
        };

        self.flow_control.update_highest_received(id, frame.end_offset())?;
        stream.add_frame(frame)?;

        if id.is_handshake() {
            self.drive_handshake(&stream)?;
        }
        Ok(())
    }

    /// Whether the peer may open `id`.
    fn check_incoming_stream(&self, id: StreamId) -> Result<()> {
        if !id.is_handshake() && id.initiator() == self.perspective() {
            return Err(Error::UnopenedLocalStream(id));
        }
        let limit = self.config.max_incoming_streams;
        let open = self
            .streams
            .live()
            .filter(|stream| !stream.id().is_handshake() && stream.id().initiator() != self.perspective())
            .count();
        if open >= limit {
            warn!(stream_id = %id, limit, "peer opened too many streams");
            return Err(Error::TooManyOpenStreams(limit));
        }
        Ok(())
    }

    /// Feed new handshake stream bytes to the adapter and queue its replies.
    ///
    /// A handshake failure closes the session right here.
    fn drive_handshake(&mut self, stream: &Stream) -> Result<()> {
        let data = stream.read_available();
        if data.is_empty() {
            return Ok(());
        }

        let was_complete = self.handshake.is_complete();
        match self.handshake.feed(&data) {
            HandshakeProgress::NeedMoreData => {}
            HandshakeProgress::Complete => {
                if !was_complete {
                    info!(connection_id = %self.connection_id(), "handshake complete");
                }
            }
            HandshakeProgress::Failed(err) => {
                error!(connection_id = %self.connection_id(), error = %err, "handshake failed");
                self.close(Some(err.into()), true);
                return Ok(());
            }
        }

        if let Some(reply) = self.handshake.take_outgoing() {
            stream.write(&reply)?;
        }
        Ok(())
    }

    pub(super) fn handle_rst_stream_frame(&mut self, frame: &RstStreamFrame) -> Result<()> {
        let stream = self
            .streams
            .get(frame.stream_id)
            .cloned()
            .ok_or(Error::RstStreamOnInvalidStream)?;
        self.flow_control
            .update_highest_received(frame.stream_id, frame.byte_offset)?;

        debug!(stream_id = %frame.stream_id, code = frame.error_code, "stream reset by peer");
        stream.close_with_error(Error::ResetByPeer {
            code: frame.error_code,
        });
        if self.flow_control.abandon_stream(frame.stream_id) > 0 {
            self.scheduler.schedule();
        }
        Ok(())
    }

    pub(super) fn handle_window_update_frame(&mut self, frame: &WindowUpdateFrame) -> Result<()> {
        if frame.stream_id == StreamId::CONNECTION {
            if self.flow_control.update_connection_send_window(frame.byte_offset) {
                self.scheduler.schedule();
            }
            return Ok(());
        }

        let pending = self
            .streams
            .get(frame.stream_id)
            .map(Stream::has_pending_send)
            .ok_or(Error::WindowUpdateOnInvalidStream)?;
        if self.flow_control.update_send_window(frame.stream_id, frame.byte_offset)? && pending {
            self.scheduler.schedule();
        }
        Ok(())
    }

    /// Tombstone every stream that is done in both directions.
    ///
    /// Whatever a collected stream received but did not report as read is
    /// credited to the connection first.
    pub(super) fn garbage_collect_streams(&mut self) {
        let mut credited = 0;
        for id in self.streams.collect_garbage() {
            credited += self.flow_control.abandon_stream(id);
            self.flow_control.remove_stream(id);
        }
        if credited > 0 {
            self.scheduler.schedule();
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send packets until nothing is left or the per-round cap is hit.
    pub(super) fn send_round(&mut self) {
        let mut sent = 0;
        loop {
            if sent == self.config.max_packets_per_round {
                // yield to inbound work, come back for the rest
                self.scheduler.schedule();
                break;
            }
            match self.send_packet() {
                Ok(true) => sent += 1,
                Ok(false) => break,
                Err(err) => {
                    error!(error = %err, "failed to send packet");
                    self.close(Some(err), false);
                    return;
                }
            }
        }
        self.garbage_collect_streams();
    }

    /// Assemble and send one packet. Returns `false` if there was nothing
    /// to send.
    pub(super) fn send_packet(&mut self) -> Result<bool> {
        let now = Instant::now();
        let packet_number = self.next_packet_number;
        let header = PublicHeader::new(self.connection_id(), packet_number, self.outgoing_version());
        let mut budget = self
            .config
            .max_packet_size
            .saturating_sub(header.encoded_len() + self.handshake.crypto().seal_overhead());

        self.collect_control_frames();

        let mut frames = Vec::new();
        if let Some(ack) = self.received_packets.ack_frame(now) {
            let ack = Frame::Ack(ack);
            let len = self.serializer.frame_len(&ack);
            if len <= budget {
                budget -= len;
                frames.push(ack);
            }
        }

        while let Some(frame) = self.control_frames.front() {
            let len = self.serializer.frame_len(frame);
            if len > budget {
                break;
            }
            budget -= len;
            if let Some(frame) = self.control_frames.pop_front() {
                frames.push(frame);
            }
        }

        let sending: Vec<Stream> = self
            .streams
            .live()
            .filter(|stream| stream.has_pending_send())
            .cloned()
            .collect();
        for stream in sending {
            let id = stream.id();
            let frame_overhead = StreamFrame::header_len(id, VARINT_MAX, budget);
            if budget <= frame_overhead {
                break;
            }

            let window = self.flow_control.send_window_size(id);
            if window == 0 && stream.has_pending_data() {
                if let Some(blocked) = self.flow_control.blocked_frame(id) {
                    let blocked = Frame::Blocked(blocked);
                    let len = self.serializer.frame_len(&blocked);
                    if len <= budget {
                        budget -= len;
                        frames.push(blocked);
                    }
                }
                continue;
            }

            let max_data = (budget - frame_overhead).min(usize::try_from(window).unwrap_or(usize::MAX));
            if let Some(frame) = stream.pop_frame(max_data) {
                self.flow_control.add_bytes_sent(id, frame.data.len() as u64);
                let frame = Frame::Stream(frame);
                budget = budget.saturating_sub(self.serializer.frame_len(&frame));
                frames.push(frame);
            }
        }

        if frames.is_empty() {
            return Ok(false);
        }

        let retransmittable = frames.iter().any(Frame::is_retransmittable);
        let datagram = self.seal_packet(&header, &frames)?;
        self.next_packet_number += 1;
        self.sent_packets.sent_packet(SentPacket {
            packet_number,
            length: datagram.len(),
            retransmittable,
            sent_time: now,
        })?;
        self.write_datagram(&datagram)?;

        trace!(packet_number, frames = frames.len(), bytes = datagram.len(), "packet sent");
        Ok(true)
    }

    /// Move due window updates, local resets and consumed-byte accounting
    /// into the control frame queue.
    fn collect_control_frames(&mut self) {
        for stream in self.streams.live() {
            let consumed = stream.take_consumed();
            if consumed > 0 {
                self.flow_control.add_bytes_read(stream.id(), consumed);
            }
        }
        for update in self.flow_control.window_updates() {
            self.control_frames.push_back(Frame::WindowUpdate(update));
        }
        for stream in self.streams.live() {
            if let Some(reset) = stream.take_reset() {
                self.control_frames.push_back(Frame::RstStream(reset));
            }
        }
    }

    /// Client packets carry the version until the handshake is done.
    fn outgoing_version(&self) -> Option<Tag> {
        if self.perspective().is_client() && !self.handshake.is_complete() {
            Some(SUPPORTED_VERSION)
        } else {
            None
        }
    }

    fn seal_packet(&self, header: &PublicHeader, frames: &[Frame]) -> Result<Bytes> {
        let mut packet = BytesMut::with_capacity(self.config.max_packet_size);
        header.write(&mut packet)?;

        let mut payload = BytesMut::new();
        for frame in frames {
            self.serializer.serialize_frame(frame, &mut payload)?;
        }

        let sealed = self
            .handshake
            .crypto()
            .seal(header.packet_number, &packet, &payload);
        packet.extend_from_slice(&sealed);
        Ok(packet.freeze())
    }

    fn write_datagram(&mut self, datagram: &[u8]) -> Result<()> {
        self.conn
            .write(datagram)
            .map_err(|err| Error::Network(err.to_string()))?;
        let mut stats = self.shared.stats.lock();
        stats.packets_sent += 1;
        stats.bytes_sent += datagram.len() as u64;
        Ok(())
    }

    /// Send a public reset naming `rejected_packet_number`.
    pub(super) fn send_public_reset(&mut self, rejected_packet_number: PacketNumber) -> Result<()> {
        let reset = PublicReset {
            connection_id: self.connection_id(),
            nonce_proof: 0,
            rejected_packet_number,
        };
        let datagram = reset.encode()?;
        debug!(rejected_packet_number, "sending public reset");
        self.write_datagram(&datagram)
    }

    /// Best-effort CONNECTION_CLOSE carrying `error` (none for a graceful
    /// close).
    pub(super) fn send_connection_close(&mut self, error: Option<&Error>) -> Result<()> {
        let frame = ConnectionCloseFrame {
            error_code: error.map_or(ErrorCode::NoError, Error::code) as u32,
            reason: error
                .map(|err| err.to_string().chars().take(MAX_CLOSE_REASON_LEN).collect())
                .unwrap_or_default(),
        };

        let packet_number = self.next_packet_number;
        let header = PublicHeader::new(self.connection_id(), packet_number, self.outgoing_version());
        let datagram = self.seal_packet(&header, &[Frame::ConnectionClose(frame)])?;
        self.next_packet_number += 1;
        self.write_datagram(&datagram)
    }
}
