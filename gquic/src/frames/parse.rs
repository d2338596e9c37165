//! # Frame Parsing and Serialization
//!
//! Zero-copy parsing of packet payloads into [`Frame`] values, and the
//! inverse serialization used when assembling outgoing packets.

#![forbid(unsafe_code)]

use core::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::*;
use crate::error::{DecodeError, Error, Result};
use crate::types::{StreamId, VarIntCodec};

type DecodeResult<T> = core::result::Result<T, DecodeError>;

// ============================================================================
// Parsing
// ============================================================================

/// Frame Parser Trait
///
/// Parses one frame from the front of `buf`, returning the frame and the
/// number of bytes it occupied.
pub trait FrameParser {
    fn parse_frame(&self, buf: &Bytes) -> DecodeResult<(Frame, usize)>;
}

/// Iterates the frames of a payload in wire order.
///
/// Yields `Err` at most once: iteration stops after the first decode error.
pub struct FrameIterator<'p, P: FrameParser + ?Sized> {
    parser: &'p P,
    remaining: Bytes,
    failed: bool,
}

impl<'p, P: FrameParser + ?Sized> FrameIterator<'p, P> {
    pub fn new(parser: &'p P, payload: Bytes) -> Self {
        Self {
            parser,
            remaining: payload,
            failed: false,
        }
    }
}

impl<P: FrameParser + ?Sized> Iterator for FrameIterator<'_, P> {
    type Item = DecodeResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining.is_empty() {
            return None;
        }
        match self.parser.parse_frame(&self.remaining) {
            Ok((frame, consumed)) => {
                self.remaining.advance(consumed);
                Some(Ok(frame))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Parser for the frame layout used by this implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFrameParser;

fn read_varint(buf: &[u8], pos: &mut usize) -> DecodeResult<u64> {
    let (value, consumed) = VarIntCodec::decode(&buf[*pos..]).ok_or(DecodeError::UnexpectedEnd)?;
    *pos += consumed;
    Ok(value)
}

fn read_error_code(buf: &[u8], pos: &mut usize) -> DecodeResult<u32> {
    u32::try_from(read_varint(buf, pos)?).map_err(|_| DecodeError::InvalidFrame("error code out of range"))
}

impl FrameParser for DefaultFrameParser {
    fn parse_frame(&self, buf: &Bytes) -> DecodeResult<(Frame, usize)> {
        let frame_type = *buf.first().ok_or(DecodeError::UnexpectedEnd)?;

        if frame_type & STREAM_FRAME_BIT != 0 {
            let (frame, consumed) = Self::parse_stream_frame(frame_type, buf)?;
            return Ok((Frame::Stream(frame), consumed));
        }

        let mut pos = 1;
        let frame = match frame_type {
            FRAME_TYPE_PADDING => {
                pos = buf.len();
                Frame::Padding(buf.len())
            }
            FRAME_TYPE_PING => Frame::Ping,
            FRAME_TYPE_RST_STREAM => Frame::RstStream(Self::parse_rst_stream_frame(buf, &mut pos)?),
            FRAME_TYPE_CONNECTION_CLOSE => {
                Frame::ConnectionClose(Self::parse_connection_close_frame(buf, &mut pos)?)
            }
            FRAME_TYPE_WINDOW_UPDATE => Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId(read_varint(buf, &mut pos)?),
                byte_offset: read_varint(buf, &mut pos)?,
            }),
            FRAME_TYPE_BLOCKED => Frame::Blocked(BlockedFrame {
                stream_id: StreamId(read_varint(buf, &mut pos)?),
            }),
            FRAME_TYPE_ACK => Frame::Ack(Self::parse_ack_frame(buf, &mut pos)?),
            other => return Err(DecodeError::UnknownFrameType(other)),
        };
        Ok((frame, pos))
    }
}

impl DefaultFrameParser {
    /// Parse STREAM frame
    ///
    /// Without the LEN bit the data runs to the end of the payload.
    fn parse_stream_frame(frame_type: u8, buf: &Bytes) -> DecodeResult<(StreamFrame, usize)> {
        let has_offset = frame_type & STREAM_FRAME_BIT_OFF != 0;
        let has_length = frame_type & STREAM_FRAME_BIT_LEN != 0;
        let fin = frame_type & STREAM_FRAME_BIT_FIN != 0;

        let mut pos = 1;
        let stream_id = StreamId(read_varint(buf, &mut pos)?);
        if stream_id == StreamId::CONNECTION {
            return Err(DecodeError::InvalidFrame("stream frame on stream 0"));
        }

        let offset = if has_offset { read_varint(buf, &mut pos)? } else { 0 };

        let length = if has_length {
            let length = read_varint(buf, &mut pos)?;
            if length > (buf.len() - pos) as u64 {
                return Err(DecodeError::UnexpectedEnd);
            }
            length as usize
        } else {
            buf.len() - pos
        };

        if offset.checked_add(length as u64).is_none() {
            return Err(DecodeError::InvalidFrame("stream offset overflow"));
        }

        let data = buf.slice(pos..pos + length);
        pos += length;

        Ok((
            StreamFrame {
                stream_id,
                offset,
                data,
                fin,
            },
            pos,
        ))
    }

    fn parse_rst_stream_frame(buf: &[u8], pos: &mut usize) -> DecodeResult<RstStreamFrame> {
        let stream_id = StreamId(read_varint(buf, pos)?);
        let byte_offset = read_varint(buf, pos)?;
        let error_code = read_error_code(buf, pos)?;
        Ok(RstStreamFrame {
            stream_id,
            byte_offset,
            error_code,
        })
    }

    fn parse_connection_close_frame(buf: &[u8], pos: &mut usize) -> DecodeResult<ConnectionCloseFrame> {
        let error_code = read_error_code(buf, pos)?;
        let reason_len = read_varint(buf, pos)?;
        if reason_len > (buf.len() - *pos) as u64 {
            return Err(DecodeError::UnexpectedEnd);
        }
        let end = *pos + reason_len as usize;
        let reason = std::str::from_utf8(&buf[*pos..end])
            .map_err(|_| DecodeError::InvalidFrame("close reason is not UTF-8"))?
            .to_owned();
        *pos = end;
        Ok(ConnectionCloseFrame { error_code, reason })
    }

    /// Parse ACK frame
    ///
    /// Each additional range is encoded as `(gap, length)` relative to the
    /// previous (higher) range, the same way RFC 9000 ACK ranges are.
    fn parse_ack_frame(buf: &[u8], pos: &mut usize) -> DecodeResult<AckFrame> {
        let largest_observed = read_varint(buf, pos)?;
        let ack_delay = Duration::from_micros(read_varint(buf, pos)?);
        let range_count = read_varint(buf, pos)?;
        let first_range = read_varint(buf, pos)?;

        let first = largest_observed
            .checked_sub(first_range)
            .ok_or(DecodeError::InvalidFrame("ack range below zero"))?;

        // Every extra range takes at least two bytes
        if range_count > (buf.len() - *pos) as u64 / 2 {
            return Err(DecodeError::UnexpectedEnd);
        }

        let mut ranges = Vec::with_capacity(range_count as usize + 1);
        ranges.push(AckRange {
            first,
            last: largest_observed,
        });

        let mut lowest = first;
        for _ in 0..range_count {
            let gap = read_varint(buf, pos)?;
            let len = read_varint(buf, pos)?;
            let last = lowest
                .checked_sub(gap)
                .and_then(|v| v.checked_sub(2))
                .ok_or(DecodeError::InvalidFrame("ack gap below zero"))?;
            let first = last
                .checked_sub(len)
                .ok_or(DecodeError::InvalidFrame("ack range below zero"))?;
            ranges.push(AckRange { first, last });
            lowest = first;
        }

        Ok(AckFrame {
            largest_observed,
            ack_delay,
            ranges,
        })
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Frame Serializer Trait
pub trait FrameSerializer {
    /// Append `frame` to `buf`, returning bytes written.
    fn serialize_frame(&self, frame: &Frame, buf: &mut BytesMut) -> Result<usize>;

    /// Bytes `frame` will occupy once serialized.
    fn frame_len(&self, frame: &Frame) -> usize;
}

/// Serializer matching [`DefaultFrameParser`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFrameSerializer;

fn put_varint(value: u64, buf: &mut BytesMut) -> Result<usize> {
    VarIntCodec::put(value, buf).ok_or(Error::Encode("value exceeds varint range"))
}

fn varint_len(value: u64) -> usize {
    VarIntCodec::size(value).unwrap_or(8)
}

impl FrameSerializer for DefaultFrameSerializer {
    fn serialize_frame(&self, frame: &Frame, buf: &mut BytesMut) -> Result<usize> {
        let start = buf.len();
        match frame {
            Frame::Padding(len) => buf.put_bytes(0, (*len).max(1)),
            Frame::Ping => buf.put_u8(FRAME_TYPE_PING),
            Frame::Stream(f) => {
                let mut frame_type = STREAM_FRAME_BIT | STREAM_FRAME_BIT_LEN;
                if f.fin {
                    frame_type |= STREAM_FRAME_BIT_FIN;
                }
                if f.offset > 0 {
                    frame_type |= STREAM_FRAME_BIT_OFF;
                }
                buf.put_u8(frame_type);
                put_varint(f.stream_id.value(), buf)?;
                if f.offset > 0 {
                    put_varint(f.offset, buf)?;
                }
                put_varint(f.data.len() as u64, buf)?;
                buf.put_slice(&f.data);
            }
            Frame::RstStream(f) => {
                buf.put_u8(FRAME_TYPE_RST_STREAM);
                put_varint(f.stream_id.value(), buf)?;
                put_varint(f.byte_offset, buf)?;
                put_varint(f.error_code as u64, buf)?;
            }
            Frame::ConnectionClose(f) => {
                buf.put_u8(FRAME_TYPE_CONNECTION_CLOSE);
                put_varint(f.error_code as u64, buf)?;
                put_varint(f.reason.len() as u64, buf)?;
                buf.put_slice(f.reason.as_bytes());
            }
            Frame::WindowUpdate(f) => {
                buf.put_u8(FRAME_TYPE_WINDOW_UPDATE);
                put_varint(f.stream_id.value(), buf)?;
                put_varint(f.byte_offset, buf)?;
            }
            Frame::Blocked(f) => {
                buf.put_u8(FRAME_TYPE_BLOCKED);
                put_varint(f.stream_id.value(), buf)?;
            }
            Frame::Ack(f) => Self::serialize_ack_frame(f, buf)?,
        }
        Ok(buf.len() - start)
    }

    fn frame_len(&self, frame: &Frame) -> usize {
        match frame {
            Frame::Padding(len) => (*len).max(1),
            Frame::Ping => 1,
            Frame::Stream(f) => StreamFrame::header_len(f.stream_id, f.offset, f.data.len()) + f.data.len(),
            Frame::RstStream(f) => {
                1 + varint_len(f.stream_id.value()) + varint_len(f.byte_offset) + varint_len(f.error_code as u64)
            }
            Frame::ConnectionClose(f) => {
                1 + varint_len(f.error_code as u64) + varint_len(f.reason.len() as u64) + f.reason.len()
            }
            Frame::WindowUpdate(f) => 1 + varint_len(f.stream_id.value()) + varint_len(f.byte_offset),
            Frame::Blocked(f) => 1 + varint_len(f.stream_id.value()),
            Frame::Ack(f) => {
                let mut len = 1
                    + varint_len(f.largest_observed)
                    + varint_len(f.ack_delay.as_micros() as u64)
                    + varint_len(f.ranges.len().saturating_sub(1) as u64);
                let mut lowest = f.largest_observed;
                for (i, range) in f.ranges.iter().enumerate() {
                    if i == 0 {
                        len += varint_len(range.last - range.first);
                    } else {
                        len += varint_len(lowest.saturating_sub(range.last + 2));
                        len += varint_len(range.last - range.first);
                    }
                    lowest = range.first;
                }
                len
            }
        }
    }
}

impl DefaultFrameSerializer {
    fn serialize_ack_frame(frame: &AckFrame, buf: &mut BytesMut) -> Result<()> {
        let (head, rest) = frame
            .ranges
            .split_first()
            .ok_or(Error::Encode("ack frame without ranges"))?;
        if head.last != frame.largest_observed || head.first > head.last {
            return Err(Error::Encode("first ack range must end at largest observed"));
        }

        buf.put_u8(FRAME_TYPE_ACK);
        put_varint(frame.largest_observed, buf)?;
        put_varint(frame.ack_delay.as_micros() as u64, buf)?;
        put_varint(rest.len() as u64, buf)?;
        put_varint(head.last - head.first, buf)?;

        let mut lowest = head.first;
        for range in rest {
            if range.first > range.last || range.last + 2 > lowest {
                return Err(Error::Encode("ack ranges must descend with gaps"));
            }
            put_varint(lowest - range.last - 2, buf)?;
            put_varint(range.last - range.first, buf)?;
            lowest = range.first;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        let written = DefaultFrameSerializer.serialize_frame(frame, &mut buf).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(DefaultFrameSerializer.frame_len(frame), written);
        buf
    }

    fn decode_one(bytes: &[u8]) -> DecodeResult<(Frame, usize)> {
        DefaultFrameParser.parse_frame(&Bytes::copy_from_slice(bytes))
    }

    mod stream_frame_tests {
        use super::*;

        #[test]
        fn test_stream_frame_with_offset_and_fin() {
            let frame = Frame::Stream(StreamFrame {
                stream_id: StreamId(5),
                offset: 0x1000,
                data: Bytes::from_static(b"foobar"),
                fin: true,
            });
            let buf = encode(&frame);
            let (decoded, consumed) = decode_one(&buf).unwrap();
            assert_eq!(decoded, frame);
            assert_eq!(consumed, buf.len());
        }

        #[test]
        fn test_stream_frame_without_length_runs_to_end() {
            // STREAM | FIN, stream 3, no offset, no length
            let bytes = [0x80 | 0x40, 0x03, b'h', b'i'];
            let (frame, consumed) = decode_one(&bytes).unwrap();
            assert_eq!(consumed, 4);
            match frame {
                Frame::Stream(f) => {
                    assert_eq!(f.stream_id, StreamId(3));
                    assert_eq!(&f.data[..], b"hi");
                    assert!(f.fin);
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }

        #[test]
        fn test_stream_frame_length_exceeds_buffer() {
            let bytes = [0x80 | 0x02, 0x03, 0x05, b'a'];
            assert_eq!(decode_one(&bytes), Err(DecodeError::UnexpectedEnd));
        }

        #[test]
        fn test_stream_frame_on_connection_id_rejected() {
            let bytes = [0x80 | 0x02, 0x00, 0x00];
            assert!(matches!(decode_one(&bytes), Err(DecodeError::InvalidFrame(_))));
        }

        #[test]
        fn test_empty_fin_frame() {
            let frame = Frame::Stream(StreamFrame {
                stream_id: StreamId(7),
                offset: 12,
                data: Bytes::new(),
                fin: true,
            });
            let buf = encode(&frame);
            assert_eq!(decode_one(&buf).unwrap().0, frame);
        }
    }

    mod control_frame_tests {
        use super::*;

        #[test]
        fn test_rst_stream_frame() {
            let frame = Frame::RstStream(RstStreamFrame {
                stream_id: StreamId(5),
                byte_offset: 100,
                error_code: 42,
            });
            assert_eq!(decode_one(&encode(&frame)).unwrap().0, frame);
        }

        #[test]
        fn test_window_update_frame() {
            let frame = Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId(5),
                byte_offset: 0x8000,
            });
            let buf = encode(&frame);
            assert_eq!(&buf[..], &[0x04, 0x05, 0x80, 0x00, 0x80, 0x00]);
            assert_eq!(decode_one(&buf).unwrap().0, frame);
        }

        #[test]
        fn test_connection_close_frame() {
            let frame = Frame::ConnectionClose(ConnectionCloseFrame {
                error_code: 16,
                reason: "going away".into(),
            });
            assert_eq!(decode_one(&encode(&frame)).unwrap().0, frame);
        }

        #[test]
        fn test_connection_close_rejects_bad_utf8() {
            let bytes = [0x02, 0x00, 0x02, 0xff, 0xfe];
            assert!(matches!(decode_one(&bytes), Err(DecodeError::InvalidFrame(_))));
        }

        #[test]
        fn test_padding_consumes_rest() {
            let (frame, consumed) = decode_one(&[0, 0, 0, 0]).unwrap();
            assert_eq!(frame, Frame::Padding(4));
            assert_eq!(consumed, 4);
        }

        #[test]
        fn test_unknown_frame_type() {
            assert_eq!(decode_one(&[0x3f]), Err(DecodeError::UnknownFrameType(0x3f)));
        }
    }

    mod ack_frame_tests {
        use super::*;

        #[test]
        fn test_ack_frame_with_gaps() {
            let frame = Frame::Ack(AckFrame {
                largest_observed: 20,
                ack_delay: Duration::from_micros(250),
                ranges: vec![
                    AckRange { first: 18, last: 20 },
                    AckRange { first: 10, last: 15 },
                    AckRange { first: 1, last: 1 },
                ],
            });
            let (decoded, _) = decode_one(&encode(&frame)).unwrap();
            assert_eq!(decoded, frame);
            if let Frame::Ack(ack) = decoded {
                assert!(ack.acks(19));
                assert!(!ack.acks(16));
                assert!(ack.acks(1));
                assert_eq!(ack.lowest_acked(), 1);
            }
        }

        #[test]
        fn test_ack_range_underflow_rejected() {
            // largest 1, first range 5
            let bytes = [0x40, 0x01, 0x00, 0x00, 0x05];
            assert!(matches!(decode_one(&bytes), Err(DecodeError::InvalidFrame(_))));
        }

        #[test]
        fn test_ack_without_ranges_cannot_be_encoded() {
            let frame = Frame::Ack(AckFrame {
                largest_observed: 3,
                ack_delay: Duration::ZERO,
                ranges: Vec::new(),
            });
            let mut buf = BytesMut::new();
            assert!(DefaultFrameSerializer.serialize_frame(&frame, &mut buf).is_err());
        }
    }

    mod iterator_tests {
        use super::*;

        #[test]
        fn test_iterator_yields_in_wire_order() {
            let mut buf = BytesMut::new();
            let frames = [
                Frame::Ping,
                Frame::Blocked(BlockedFrame { stream_id: StreamId(3) }),
                Frame::Stream(StreamFrame {
                    stream_id: StreamId(3),
                    offset: 0,
                    data: Bytes::from_static(b"abc"),
                    fin: false,
                }),
            ];
            for f in &frames {
                DefaultFrameSerializer.serialize_frame(f, &mut buf).unwrap();
            }
            let decoded: Vec<_> = FrameIterator::new(&DefaultFrameParser, buf.freeze())
                .collect::<DecodeResult<_>>()
                .unwrap();
            assert_eq!(decoded, frames);
        }

        #[test]
        fn test_iterator_stops_after_error() {
            let payload = Bytes::from_static(&[0x07, 0x3f, 0x07]);
            let items: Vec<_> = FrameIterator::new(&DefaultFrameParser, payload).collect();
            assert_eq!(items.len(), 2);
            assert!(items[0].is_ok());
            assert!(items[1].is_err());
        }
    }
}
