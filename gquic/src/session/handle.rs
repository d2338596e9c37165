//! Cloneable control surface of a running session.

#![forbid(unsafe_code)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::warn;

use super::{CloseRequest, Command, SessionState, SessionStats, Shared};
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::types::{ConnectionId, Perspective, StreamId};

/// Session Handle
///
/// Feeds datagrams to the session task, opens streams and requests the
/// close. All operations are safe to call from any task.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    datagram_tx: mpsc::Sender<Bytes>,
    command_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub(super) fn new(
        shared: Arc<Shared>,
        datagram_tx: mpsc::Sender<Bytes>,
        command_tx: mpsc::UnboundedSender<Command>,
        state_rx: watch::Receiver<SessionState>,
    ) -> Self {
        Self {
            shared,
            datagram_tx,
            command_tx,
            state_rx,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    pub fn perspective(&self) -> Perspective {
        self.shared.perspective
    }

    /// Hand a received datagram to the session.
    ///
    /// Returns `false` if it was dropped because the queue is full or the
    /// session is gone.
    pub fn queue_datagram(&self, datagram: Bytes) -> bool {
        match self.datagram_tx.try_send(datagram) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %self.connection_id(), "datagram queue full, dropping packet");
                self.shared.stats.lock().packets_dropped += 1;
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Open the next locally initiated stream.
    pub async fn open_stream(&self) -> Result<Stream> {
        self.request_stream(None).await
    }

    pub async fn open_stream_with_id(&self, id: StreamId) -> Result<Stream> {
        self.request_stream(Some(id)).await
    }

    async fn request_stream(&self, id: Option<StreamId>) -> Result<Stream> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(Command::OpenStream { id, reply })
            .map_err(|_| self.closed_error())?;
        response.await.map_err(|_| self.closed_error())?
    }

    /// Ask the session to close. Returns `false` if a close was already
    /// requested, in which case this call has no effect.
    pub fn close(&self, error: Option<Error>, send_public_reset: bool) -> bool {
        {
            let mut slot = self.shared.close_request.lock();
            if !self.shared.begin_close() {
                return false;
            }
            *slot = Some(CloseRequest {
                error,
                send_public_reset,
            });
        }
        self.shared.close_notify.notify_one();
        true
    }

    /// Wait until the session is closed, returning its terminal error.
    pub async fn closed(&self) -> Option<Error> {
        let mut state_rx = self.state_rx.clone();
        // an error here means the session was dropped, which also ends it
        let _ = state_rx.wait_for(|state| *state == SessionState::Closed).await;
        self.terminal_error()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    pub fn terminal_error(&self) -> Option<Error> {
        self.shared.terminal_error.lock().clone()
    }

    pub fn stats(&self) -> SessionStats {
        *self.shared.stats.lock()
    }

    fn closed_error(&self) -> Error {
        self.terminal_error().unwrap_or(Error::SessionClosed)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.shared.connection_id)
            .field("state", &self.state())
            .finish()
    }
}
