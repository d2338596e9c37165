//! # Streams
//!
//! A [`Stream`] is a cheap, cloneable handle to one bidirectional byte
//! channel. The session task and the application share its state behind a
//! mutex:
//!
//! - the session pushes received fragments in and pulls outgoing frames out
//! - the application reads in offset order and appends writes
//!
//! Writes never block; they land in a send buffer and poke the
//! [`SendScheduler`]. Reads suspend on a registered waker until the gap at
//! the read offset is filled, the stream ends, or an error is set.

#![forbid(unsafe_code)]

mod buffer;
mod table;

pub use buffer::ReassemblyBuffer;
pub use table::{StreamSlot, StreamTable};

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::frames::{RstStreamFrame, StreamFrame};
use crate::session::SendScheduler;
use crate::types::{StreamId, StreamOffset};

/// Handle to one stream of a session.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

struct StreamShared {
    id: StreamId,
    state: Mutex<StreamState>,
    scheduler: SendScheduler,
}

#[derive(Default)]
struct StreamState {
    // receive side
    recv: ReassemblyBuffer,
    read_waker: Option<Waker>,
    /// Bytes handed to the reader that flow control has not seen yet
    consumed_unreported: u64,

    /// Terminal error, shared by both directions
    error: Option<Error>,

    // send side
    send_buf: BytesMut,
    write_offset: StreamOffset,
    fin_requested: bool,
    fin_sent: bool,
    pending_reset: Option<u32>,
}

impl StreamState {
    fn wake_reader(&mut self) -> Option<Waker> {
        self.read_waker.take()
    }
}

impl Stream {
    pub(crate) fn new(id: StreamId, scheduler: SendScheduler) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                id,
                state: Mutex::new(StreamState::default()),
                scheduler,
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    // ------------------------------------------------------------------
    // Application API
    // ------------------------------------------------------------------

    /// Read the next contiguous bytes into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream. A terminal error is returned even
    /// if unread data remains.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.poll_read_inner(cx, buf)).await
    }

    fn poll_read_inner(&self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<Result<usize>> {
        let mut state = self.shared.state.lock();
        if let Some(err) = &state.error {
            return Poll::Ready(Err(err.clone()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = state.recv.read(buf);
        if n > 0 {
            state.consumed_unreported += n as u64;
            drop(state);
            // the session may owe the peer a window update
            self.shared.scheduler.schedule();
            return Poll::Ready(Ok(n));
        }
        if state.recv.is_eof() {
            return Poll::Ready(Ok(0));
        }

        state.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Queue `data` for sending. Never blocks.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut state = self.shared.state.lock();
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        if state.fin_requested {
            return Err(Error::WriteAfterFinish);
        }
        state.send_buf.extend_from_slice(data);
        drop(state);

        if !data.is_empty() {
            self.shared.scheduler.schedule();
        }
        Ok(data.len())
    }

    /// Close the write direction; FIN goes out with the last queued byte.
    pub fn finish(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(err) = &state.error {
            return Err(err.clone());
        }
        if state.fin_requested {
            return Ok(());
        }
        state.fin_requested = true;
        drop(state);

        self.shared.scheduler.schedule();
        Ok(())
    }

    /// Abort the stream in both directions and tell the peer with
    /// RST_STREAM carrying `code`.
    pub fn reset(&self, code: u32) {
        let waker = {
            let mut state = self.shared.state.lock();
            if state.error.is_some() {
                return;
            }
            state.error = Some(Error::StreamReset { code });
            state.pending_reset = Some(code);
            state.send_buf.clear();
            state.wake_reader()
        };
        debug!(stream_id = %self.id(), code, "stream reset locally");

        if let Some(waker) = waker {
            waker.wake();
        }
        self.shared.scheduler.schedule();
    }

    /// Set the terminal error for both directions. Only the first error
    /// sticks; a blocked reader is woken to observe it.
    pub fn close_with_error(&self, err: Error) {
        let waker = {
            let mut state = self.shared.state.lock();
            if state.error.is_some() {
                return;
            }
            trace!(stream_id = %self.id(), error = %err, "closing stream");
            state.error = Some(err);
            state.send_buf.clear();
            state.wake_reader()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// The terminal error, if one is set.
    pub fn error(&self) -> Option<Error> {
        self.shared.state.lock().error.clone()
    }

    // ------------------------------------------------------------------
    // Session API
    // ------------------------------------------------------------------

    /// Insert a received STREAM frame.
    pub(crate) fn add_frame(&self, frame: &StreamFrame) -> Result<()> {
        let waker = {
            let mut state = self.shared.state.lock();
            if state.error.is_some() {
                return Ok(());
            }
            state.recv.insert(frame.offset, frame.data.clone(), frame.fin)?;
            if state.recv.has_readable() || state.recv.is_eof() {
                state.wake_reader()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        Ok(())
    }

    /// Drain all readable bytes without waiting.
    pub(crate) fn read_available(&self) -> Bytes {
        let mut state = self.shared.state.lock();
        let data = state.recv.read_available();
        state.consumed_unreported += data.len() as u64;
        data
    }

    /// Bytes read since the last call, for flow control accounting.
    pub(crate) fn take_consumed(&self) -> u64 {
        std::mem::take(&mut self.shared.state.lock().consumed_unreported)
    }

    pub(crate) fn read_offset(&self) -> StreamOffset {
        self.shared.state.lock().recv.read_offset()
    }

    /// Whether data or a FIN is waiting to be sent.
    pub(crate) fn has_pending_send(&self) -> bool {
        let state = self.shared.state.lock();
        state.error.is_none() && (!state.send_buf.is_empty() || (state.fin_requested && !state.fin_sent))
    }

    /// Whether queued data (not just a FIN) is waiting to be sent.
    pub(crate) fn has_pending_data(&self) -> bool {
        let state = self.shared.state.lock();
        state.error.is_none() && !state.send_buf.is_empty()
    }

    /// Cut the next outgoing frame carrying at most `max_data` bytes.
    ///
    /// A bare FIN is produced once everything before it was sent, even when
    /// `max_data` is zero.
    pub(crate) fn pop_frame(&self, max_data: usize) -> Option<StreamFrame> {
        let mut state = self.shared.state.lock();
        if state.error.is_some() {
            return None;
        }

        if state.send_buf.is_empty() {
            if state.fin_requested && !state.fin_sent {
                state.fin_sent = true;
                return Some(StreamFrame {
                    stream_id: self.id(),
                    offset: state.write_offset,
                    data: Bytes::new(),
                    fin: true,
                });
            }
            return None;
        }
        if max_data == 0 {
            return None;
        }

        let n = max_data.min(state.send_buf.len());
        let data = state.send_buf.split_to(n).freeze();
        let offset = state.write_offset;
        state.write_offset += n as u64;
        let fin = state.fin_requested && state.send_buf.is_empty();
        if fin {
            state.fin_sent = true;
        }

        Some(StreamFrame {
            stream_id: self.id(),
            offset,
            data,
            fin,
        })
    }

    /// RST_STREAM owed to the peer after a local reset.
    pub(crate) fn take_reset(&self) -> Option<RstStreamFrame> {
        let mut state = self.shared.state.lock();
        let code = state.pending_reset.take()?;
        Some(RstStreamFrame {
            stream_id: self.id(),
            byte_offset: state.write_offset,
            error_code: code,
        })
    }

    /// Both directions are done and the stream can be collected.
    pub(crate) fn is_finished(&self) -> bool {
        let state = self.shared.state.lock();
        let errored = state.error.is_some();
        let read_done = errored || state.recv.is_eof();
        let write_done =
            (errored && state.pending_reset.is_none()) || (state.fin_sent && state.send_buf.is_empty());
        read_done && write_done
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id()).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();
        match self.poll_read_inner(cx, unfilled) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(self.write(buf).map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the session flushes on its own schedule
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.finish().map_err(io::Error::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn stream(id: u64) -> (Stream, SendScheduler) {
        let scheduler = SendScheduler::new();
        (Stream::new(StreamId(id), scheduler.clone()), scheduler)
    }

    fn frame(id: u64, offset: u64, data: &'static [u8], fin: bool) -> StreamFrame {
        StreamFrame {
            stream_id: StreamId(id),
            offset,
            data: Bytes::from_static(data),
            fin,
        }
    }

    mod read_tests {
        use super::*;

        #[tokio::test]
        async fn test_read_waits_for_gap() {
            let (stream, _) = stream(5);
            stream.add_frame(&frame(5, 2, &[0xfb, 0xad], false)).unwrap();

            let reader = stream.clone();
            let task = tokio::spawn(async move {
                let mut buf = [0u8; 4];
                let n = reader.read(&mut buf).await.unwrap();
                (n, buf)
            });
            tokio::task::yield_now().await;
            assert!(!task.is_finished());

            stream.add_frame(&frame(5, 0, &[0xde, 0xca], false)).unwrap();
            let (n, buf) = tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 4);
            assert_eq!(buf, [0xde, 0xca, 0xfb, 0xad]);
        }

        #[tokio::test]
        async fn test_eof_after_fin() {
            let (stream, _) = stream(5);
            stream.add_frame(&frame(5, 0, b"ab", true)).unwrap();
            let mut buf = [0u8; 8];
            assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
            assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        }

        #[tokio::test]
        async fn test_error_wakes_blocked_reader() {
            let (stream, _) = stream(5);
            let reader = stream.clone();
            let task = tokio::spawn(async move { reader.read(&mut [0u8; 1]).await });
            tokio::task::yield_now().await;

            stream.close_with_error(Error::SessionClosed);
            let result = tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(result, Err(Error::SessionClosed));
        }

        #[tokio::test]
        async fn test_error_takes_precedence_over_data() {
            let (stream, _) = stream(5);
            stream.add_frame(&frame(5, 0, b"ab", false)).unwrap();
            stream.close_with_error(Error::ResetByPeer { code: 42 });
            assert_eq!(
                stream.read(&mut [0u8; 2]).await,
                Err(Error::ResetByPeer { code: 42 })
            );
        }

        #[tokio::test]
        async fn test_read_reports_consumed_bytes() {
            let (stream, scheduler) = stream(5);
            stream.add_frame(&frame(5, 0, b"abc", false)).unwrap();
            stream.read(&mut [0u8; 3]).await.unwrap();
            assert!(scheduler.take());
            assert_eq!(stream.take_consumed(), 3);
            assert_eq!(stream.take_consumed(), 0);
        }

        #[tokio::test]
        async fn test_async_read_maps_errors() {
            let (mut stream, _) = stream(5);
            stream.close_with_error(Error::ResetByPeer { code: 3 });
            let err = stream.read_u8().await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        }
    }

    mod write_tests {
        use super::*;

        #[test]
        fn test_write_schedules_and_frames() {
            let (stream, scheduler) = stream(3);
            assert_eq!(stream.write(b"foobar").unwrap(), 6);
            assert!(scheduler.is_pending());

            let first = stream.pop_frame(4).unwrap();
            assert_eq!((first.offset, &first.data[..], first.fin), (0, &b"foob"[..], false));
            let second = stream.pop_frame(100).unwrap();
            assert_eq!((second.offset, &second.data[..]), (4, &b"ar"[..]));
            assert!(stream.pop_frame(100).is_none());
        }

        #[test]
        fn test_fin_rides_on_last_frame() {
            let (stream, _) = stream(3);
            stream.write(b"ab").unwrap();
            stream.finish().unwrap();
            let frame = stream.pop_frame(100).unwrap();
            assert!(frame.fin);
            assert!(stream.pop_frame(100).is_none());
            assert_eq!(stream.write(b"c"), Err(Error::WriteAfterFinish));
        }

        #[test]
        fn test_bare_fin_without_window() {
            let (stream, _) = stream(3);
            stream.finish().unwrap();
            let frame = stream.pop_frame(0).unwrap();
            assert!(frame.fin && frame.data.is_empty());
        }

        #[test]
        fn test_write_after_error() {
            let (stream, _) = stream(3);
            stream.close_with_error(Error::SessionClosed);
            assert_eq!(stream.write(&[]), Err(Error::SessionClosed));
            assert!(!stream.has_pending_send());
        }

        #[test]
        fn test_first_error_wins() {
            let (stream, _) = stream(3);
            stream.close_with_error(Error::ResetByPeer { code: 1 });
            stream.close_with_error(Error::SessionClosed);
            assert_eq!(stream.error(), Some(Error::ResetByPeer { code: 1 }));
        }

        #[test]
        fn test_local_reset_queues_rst_stream() {
            let (stream, _) = stream(3);
            stream.write(b"abc").unwrap();
            stream.pop_frame(100).unwrap();
            stream.reset(7);

            assert_eq!(stream.write(b"x"), Err(Error::StreamReset { code: 7 }));
            assert!(!stream.is_finished());
            let rst = stream.take_reset().unwrap();
            assert_eq!((rst.byte_offset, rst.error_code), (3, 7));
            assert!(stream.take_reset().is_none());
            assert!(stream.is_finished());
        }

        #[tokio::test]
        async fn test_async_write_shutdown_finishes() {
            let (mut stream, _) = stream(3);
            stream.write_all(b"hi").await.unwrap();
            stream.shutdown().await.unwrap();
            let frame = stream.pop_frame(100).unwrap();
            assert!(frame.fin);
        }
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test]
        async fn test_finished_after_both_directions_end() {
            let (stream, _) = stream(5);
            stream.add_frame(&frame(5, 0, b"ab", true)).unwrap();
            stream.read(&mut [0u8; 2]).await.unwrap();
            assert!(!stream.is_finished());

            stream.finish().unwrap();
            assert!(!stream.is_finished());
            stream.pop_frame(100).unwrap();
            assert!(stream.is_finished());
        }

        #[test]
        fn test_finished_after_error() {
            let (stream, _) = stream(5);
            stream.close_with_error(Error::SessionClosed);
            assert!(stream.is_finished());
        }
    }
}
