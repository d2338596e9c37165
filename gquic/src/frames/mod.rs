//! # Frames
//!
//! Typed frame values exchanged inside packet payloads. Stream data is held
//! as [`Bytes`] so fragments can be sliced out of a received datagram and
//! parked in a reassembly buffer without copying.

#![forbid(unsafe_code)]

mod parse;

pub use parse::{
    DefaultFrameParser, DefaultFrameSerializer, FrameIterator, FrameParser, FrameSerializer,
};

use core::time::Duration;

use bytes::Bytes;

use crate::types::{PacketNumber, StreamId, StreamOffset, VarIntCodec};

// ============================================================================
// Frame Type Constants
// ============================================================================

pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_RST_STREAM: u8 = 0x01;
pub const FRAME_TYPE_CONNECTION_CLOSE: u8 = 0x02;
pub const FRAME_TYPE_WINDOW_UPDATE: u8 = 0x04;
pub const FRAME_TYPE_BLOCKED: u8 = 0x05;
pub const FRAME_TYPE_PING: u8 = 0x07;
pub const FRAME_TYPE_ACK: u8 = 0x40;

/// Any type byte with the high bit set is a STREAM frame.
pub const STREAM_FRAME_BIT: u8 = 0x80;
pub const STREAM_FRAME_BIT_FIN: u8 = 0x40;
pub const STREAM_FRAME_BIT_OFF: u8 = 0x04;
pub const STREAM_FRAME_BIT_LEN: u8 = 0x02;

// ============================================================================
// Frame Values
// ============================================================================

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Padding up to the end of the packet; carries the padded length.
    Padding(usize),
    Ping,
    Stream(StreamFrame),
    RstStream(RstStreamFrame),
    ConnectionClose(ConnectionCloseFrame),
    WindowUpdate(WindowUpdateFrame),
    Blocked(BlockedFrame),
    Ack(AckFrame),
}

impl Frame {
    /// Whether receiving this frame obliges the peer to acknowledge.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::Padding(_))
    }
}

/// STREAM frame: a fragment of stream data, optionally carrying FIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: StreamOffset,
    pub data: Bytes,
    pub fin: bool,
}

impl StreamFrame {
    /// Offset one past the last byte of this fragment.
    pub fn end_offset(&self) -> StreamOffset {
        self.offset + self.data.len() as u64
    }

    /// Bytes taken by everything except the data itself.
    pub fn header_len(stream_id: StreamId, offset: StreamOffset, data_len: usize) -> usize {
        let offset_len = if offset > 0 {
            VarIntCodec::size(offset).unwrap_or(8)
        } else {
            0
        };
        1 + VarIntCodec::size(stream_id.value()).unwrap_or(8)
            + offset_len
            + VarIntCodec::size(data_len as u64).unwrap_or(8)
    }
}

/// RST_STREAM: the sender abandons the stream at `byte_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStreamFrame {
    pub stream_id: StreamId,
    pub byte_offset: StreamOffset,
    pub error_code: u32,
}

/// CONNECTION_CLOSE: the sender tears the connection down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionCloseFrame {
    pub error_code: u32,
    pub reason: String,
}

/// WINDOW_UPDATE: raise the send window of a stream (or of the connection
/// when `stream_id` is 0) to `byte_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub byte_offset: StreamOffset,
}

/// BLOCKED: the sender has data but no flow-control credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedFrame {
    pub stream_id: StreamId,
}

/// A contiguous block of acknowledged packet numbers, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckRange {
    pub first: PacketNumber,
    pub last: PacketNumber,
}

/// ACK frame.
///
/// `ranges` are ordered from the highest block down and never overlap. The
/// first range always ends at `largest_observed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub largest_observed: PacketNumber,
    pub ack_delay: Duration,
    pub ranges: Vec<AckRange>,
}

impl AckFrame {
    /// Whether `pn` is covered by one of the ranges.
    pub fn acks(&self, pn: PacketNumber) -> bool {
        self.ranges.iter().any(|r| r.first <= pn && pn <= r.last)
    }

    /// Lowest packet number acknowledged.
    pub fn lowest_acked(&self) -> PacketNumber {
        self.ranges
            .last()
            .map(|r| r.first)
            .unwrap_or(self.largest_observed)
    }
}
