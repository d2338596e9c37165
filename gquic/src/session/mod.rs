//! # Session
//!
//! One [`Session`] per connection. It owns every piece of per-connection
//! state (stream table, flow control, handshake adapter, packet accounting)
//! and is driven by a single task running [`Session::run`]. Everything else
//! talks to it through a [`SessionHandle`]:
//!
//! ```text
//!  socket ──datagrams──▶ ┌─────────┐ ──datagrams──▶ ConnectionWriter
//!  app ────commands────▶ │ Session │
//!  streams ──schedule──▶ └─────────┘ ──callbacks──▶ app
//! ```
//!
//! The lifecycle is `Running → Closing → Closed`. Closing happens exactly
//! once, whether it is triggered by the peer, a protocol error, a timer or
//! the application.

#![forbid(unsafe_code)]

mod dispatch;
mod handle;
mod scheduler;


pub use handle::SessionHandle;
pub use scheduler::SendScheduler;

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::flow_control::FlowControlManager;
use crate::frames::{DefaultFrameParser, DefaultFrameSerializer, Frame};
use crate::handshake::{CryptoSetup, HandshakeAdapter};
use crate::packet::{PublicHeader, PublicReset};
use crate::recovery::{
    DefaultReceivedPacketHandler, DefaultSentPacketHandler, ReceivedPacketHandler, SentPacketHandler,
};
use crate::stream::{Stream, StreamTable};
use crate::types::{ConnectionId, PacketNumber, Perspective, StreamId, SUPPORTED_VERSION};

/// Timer fallback when neither the idle nor the handshake timeout is armed.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Sink for outgoing datagrams.
///
/// Only the session task ever calls it.
pub trait ConnectionWriter: Send {
    fn write(&mut self, datagram: &[u8]) -> io::Result<()>;
}

/// Invoked once for every stream the peer opens.
pub type StreamCallback = Box<dyn FnMut(&SessionHandle, Stream) + Send>;

/// Invoked once when the session closes, with the terminal error (`None`
/// for a graceful close).
pub type ClosedCallback = Box<dyn FnOnce(Option<&Error>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Closing,
    Closed,
}

/// Traffic counters, readable from any handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub streams_opened: u64,
}

#[derive(Debug)]
struct CloseRequest {
    error: Option<Error>,
    send_public_reset: bool,
}

/// State visible to both the session task and its handles.
#[derive(Debug)]
struct Shared {
    connection_id: ConnectionId,
    perspective: Perspective,
    /// Set by whichever side requests the close first
    closing: AtomicBool,
    close_request: Mutex<Option<CloseRequest>>,
    close_notify: Notify,
    stats: Mutex<SessionStats>,
    terminal_error: Mutex<Option<Error>>,
}

impl Shared {
    /// Claim the close. Returns `false` if someone else already did.
    fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }
}

enum Command {
    OpenStream {
        id: Option<StreamId>,
        reply: oneshot::Sender<Result<Stream>>,
    },
}

/// Per-connection state machine.
pub struct Session {
    shared: Arc<Shared>,
    handle: SessionHandle,
    config: SessionConfig,
    conn: Box<dyn ConnectionWriter>,

    streams: StreamTable,
    flow_control: FlowControlManager,
    handshake: HandshakeAdapter,
    parser: DefaultFrameParser,
    serializer: DefaultFrameSerializer,
    sent_packets: Box<dyn SentPacketHandler>,
    received_packets: Box<dyn ReceivedPacketHandler>,
    scheduler: SendScheduler,

    next_packet_number: PacketNumber,
    largest_received_packet_number: PacketNumber,
    control_frames: VecDeque<Frame>,
    next_local_stream_id: u64,

    stream_callback: Option<StreamCallback>,
    closed_callback: Option<ClosedCallback>,
    closed: bool,
    created_at: Instant,
    last_activity: Instant,

    state_tx: watch::Sender<SessionState>,
    datagram_rx: mpsc::Receiver<Bytes>,
    command_rx: mpsc::UnboundedReceiver<Command>,
}

impl Session {
    /// Create a session and the handle used to feed and control it.
    ///
    /// The crypto setup's opening messages are queued on the handshake
    /// stream right away; they go out on the first send round.
    pub fn new(
        connection_id: ConnectionId,
        perspective: Perspective,
        config: SessionConfig,
        conn: Box<dyn ConnectionWriter>,
        crypto: Box<dyn CryptoSetup>,
    ) -> (Session, SessionHandle) {
        let shared = Arc::new(Shared {
            connection_id,
            perspective,
            closing: AtomicBool::new(false),
            close_request: Mutex::new(None),
            close_notify: Notify::new(),
            stats: Mutex::new(SessionStats::default()),
            terminal_error: Mutex::new(None),
        });

        let (datagram_tx, datagram_rx) = mpsc::channel(config.max_queued_packets.max(1));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Running);
        let handle = SessionHandle::new(shared.clone(), datagram_tx, command_tx, state_rx);

        let scheduler = SendScheduler::new();
        let mut streams = StreamTable::new();
        let mut flow_control = FlowControlManager::new(&config);
        let handshake_stream = Stream::new(StreamId::HANDSHAKE, scheduler.clone());
        // a fresh table cannot hold the handshake id yet
        let _ = streams.insert(handshake_stream.clone());
        flow_control.new_stream(StreamId::HANDSHAKE);

        let mut handshake = HandshakeAdapter::new(crypto);
        handshake.start();
        if let Some(hello) = handshake.take_outgoing() {
            let _ = handshake_stream.write(&hello);
        }

        let now = Instant::now();
        let session = Session {
            shared,
            handle: handle.clone(),
            config,
            conn,
            streams,
            flow_control,
            handshake,
            parser: DefaultFrameParser,
            serializer: DefaultFrameSerializer,
            sent_packets: Box::new(DefaultSentPacketHandler::new()),
            received_packets: Box::new(DefaultReceivedPacketHandler::new()),
            scheduler,
            next_packet_number: 1,
            largest_received_packet_number: 0,
            control_frames: VecDeque::new(),
            next_local_stream_id: StreamId::first_local(perspective).value(),
            stream_callback: None,
            closed_callback: None,
            closed: false,
            created_at: now,
            last_activity: now,
            state_tx,
            datagram_rx,
            command_rx,
        };
        (session, handle)
    }

    pub fn with_stream_callback(mut self, callback: StreamCallback) -> Self {
        self.stream_callback = Some(callback);
        self
    }

    pub fn with_closed_callback(mut self, callback: ClosedCallback) -> Self {
        self.closed_callback = Some(callback);
        self
    }

    /// Replace the default packet accounting.
    pub fn with_packet_handlers(
        mut self,
        sent: Box<dyn SentPacketHandler>,
        received: Box<dyn ReceivedPacketHandler>,
    ) -> Self {
        self.sent_packets = sent;
        self.received_packets = received;
        self
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    pub fn perspective(&self) -> Perspective {
        self.shared.perspective
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Open the next locally initiated stream.
    pub fn open_stream(&mut self) -> Result<Stream> {
        self.check_open()?;
        let id = StreamId(self.next_local_stream_id);
        self.open_stream_with_id(id)
    }

    /// Open a stream with an explicit id.
    pub fn open_stream_with_id(&mut self, id: StreamId) -> Result<Stream> {
        self.check_open()?;
        if id == StreamId::CONNECTION {
            return Err(Error::ReservedStreamId(id));
        }
        let stream = self.create_stream(id)?;
        if id.initiator() == self.perspective() && id.value() >= self.next_local_stream_id {
            self.next_local_stream_id = id.value() + 2;
        }
        debug!(stream_id = %id, "stream opened locally");
        Ok(stream)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(self.terminal_error())
        } else {
            Ok(())
        }
    }

    fn create_stream(&mut self, id: StreamId) -> Result<Stream> {
        let stream = Stream::new(id, self.scheduler.clone());
        self.streams.insert(stream.clone())?;
        self.flow_control.new_stream(id);
        self.shared.stats.lock().streams_opened += 1;
        Ok(stream)
    }

    /// Error streams and callers observe once the session is closed.
    fn terminal_error(&self) -> Error {
        self.shared
            .terminal_error
            .lock()
            .clone()
            .unwrap_or(Error::SessionClosed)
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Drive the session until it closes.
    ///
    /// Returns `Ok(())` after a graceful close and the terminal error
    /// otherwise.
    pub async fn run(mut self) -> Result<()> {
        info!(
            connection_id = %self.connection_id(),
            perspective = ?self.perspective(),
            "session started"
        );
        // flush the opening handshake messages
        self.scheduler.schedule();

        while !self.closed {
            let deadline = self.next_deadline();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + FAR_FUTURE);

            tokio::select! {
                biased;

                _ = self.shared.close_notify.notified() => {
                    self.handle_close_request();
                }
                Some(datagram) = self.datagram_rx.recv() => {
                    self.handle_datagram(datagram);
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command);
                }
                _ = self.scheduler.wait() => {
                    self.send_round();
                }
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    self.handle_timeout();
                }
            }
        }

        let stats = *self.shared.stats.lock();
        info!(
            connection_id = %self.connection_id(),
            packets_sent = stats.packets_sent,
            packets_received = stats.packets_received,
            packets_dropped = stats.packets_dropped,
            "session finished"
        );

        match self.shared.terminal_error.lock().clone() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::OpenStream { id, reply } => {
                let result = match id {
                    Some(id) => self.open_stream_with_id(id),
                    None => self.open_stream(),
                };
                // the caller may have given up waiting
                let _ = reply.send(result);
            }
        }
    }

    /// Process one datagram from the socket.
    pub(crate) fn handle_datagram(&mut self, datagram: Bytes) {
        {
            let mut stats = self.shared.stats.lock();
            stats.packets_received += 1;
            stats.bytes_received += datagram.len() as u64;
        }

        let (header, header_len) = match PublicHeader::parse(&datagram) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "dropping datagram with invalid public header");
                self.shared.stats.lock().packets_dropped += 1;
                return;
            }
        };

        if header.connection_id.is_some_and(|id| id != self.connection_id()) {
            debug!(connection_id = ?header.connection_id, "dropping datagram for another connection");
            self.shared.stats.lock().packets_dropped += 1;
            return;
        }

        if header.reset {
            match PublicReset::decode(self.connection_id(), &datagram[header_len..]) {
                Ok(reset) => {
                    warn!(
                        rejected_packet_number = reset.rejected_packet_number,
                        "public reset received"
                    );
                    self.close(
                        Some(Error::PublicReset {
                            rejected_packet_number: reset.rejected_packet_number,
                        }),
                        false,
                    );
                }
                Err(err) => {
                    warn!(error = %err, "dropping malformed public reset");
                    self.shared.stats.lock().packets_dropped += 1;
                }
            }
            return;
        }

        if let Some(version) = header.version {
            if version != SUPPORTED_VERSION {
                warn!(version = %version, "dropping packet with unsupported version");
                self.shared.stats.lock().packets_dropped += 1;
                return;
            }
        }

        let raw_header = datagram.slice(..header_len);
        let payload = datagram.slice(header_len..);
        match self.handle_packet(&header, &raw_header, payload) {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                let send_public_reset = !self.handshake.is_complete();
                error!(
                    packet_number = header.packet_number,
                    error = %err,
                    "closing session after fatal error"
                );
                self.close(Some(err), send_public_reset);
            }
            Err(err) => {
                warn!(packet_number = header.packet_number, error = %err, "error while handling packet");
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let idle = self.config.idle_timeout().map(|t| self.last_activity + t);
        let handshake = if self.handshake.is_complete() {
            None
        } else {
            self.config.handshake_timeout().map(|t| self.created_at + t)
        };
        match (idle, handshake) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_timeout(&mut self) {
        let now = Instant::now();
        let handshake_expired = !self.handshake.is_complete()
            && self
                .config
                .handshake_timeout()
                .is_some_and(|t| self.created_at + t <= now);
        if handshake_expired {
            warn!(connection_id = %self.connection_id(), "handshake timed out");
            self.close(Some(Error::HandshakeTimeout), false);
            return;
        }

        let idle_expired = self
            .config
            .idle_timeout()
            .is_some_and(|t| self.last_activity + t <= now);
        if idle_expired {
            info!(connection_id = %self.connection_id(), "idle timeout");
            self.close(Some(Error::IdleTimeout), false);
        }
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Close the session. Only the first close, from here or from any
    /// handle, takes effect.
    pub fn close(&mut self, error: Option<Error>, send_public_reset: bool) {
        if self.closed {
            return;
        }
        let request = if self.shared.begin_close() {
            CloseRequest {
                error,
                send_public_reset,
            }
        } else {
            // a handle got there first; its request wins
            self.shared.close_request.lock().take().unwrap_or(CloseRequest {
                error,
                send_public_reset,
            })
        };
        self.teardown(request);
    }

    fn handle_close_request(&mut self) {
        if self.closed {
            return;
        }
        let request = self.shared.close_request.lock().take();
        if let Some(request) = request {
            self.teardown(request);
        }
    }

    fn teardown(&mut self, request: CloseRequest) {
        let CloseRequest {
            error,
            send_public_reset,
        } = request;
        self.closed = true;
        self.state_tx.send_replace(SessionState::Closing);

        match &error {
            None => info!(connection_id = %self.connection_id(), "closing session"),
            Some(err) => info!(connection_id = %self.connection_id(), error = %err, "closing session with error"),
        }

        match &error {
            Some(err) if send_public_reset && err.warrants_public_reset() => {
                if let Err(err) = self.send_public_reset(self.largest_received_packet_number) {
                    debug!(error = %err, "failed to send public reset");
                }
            }
            Some(Error::PeerClosed { .. } | Error::PublicReset { .. } | Error::Network(_)) => {}
            _ => {
                if let Err(err) = self.send_connection_close(error.as_ref()) {
                    debug!(error = %err, "failed to send connection close");
                }
            }
        }

        self.close_streams_with_error(error.clone().unwrap_or(Error::SessionClosed));
        *self.shared.terminal_error.lock() = error.clone();

        if let Some(callback) = self.closed_callback.take() {
            callback(error.as_ref());
        }
        self.state_tx.send_replace(SessionState::Closed);
    }

    /// Deliver `err` to every live stream.
    pub(crate) fn close_streams_with_error(&mut self, err: Error) {
        for stream in self.streams.live() {
            stream.close_with_error(err.clone());
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            // the task went away without closing; unblock readers
            self.shared.closing.store(true, Ordering::Release);
            self.close_streams_with_error(Error::SessionClosed);
            self.state_tx.send_replace(SessionState::Closed);
        }
    }
}
