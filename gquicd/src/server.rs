//! Single-connection UDP host.
//!
//! The first datagram that parses as a client packet picks the peer and the
//! connection id; the socket is then connected to that peer and every
//! further datagram is handed to the one server session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use gquic::packet::PublicHeader;
use gquic::{
    ConnectionId, ConnectionWriter, NullCryptoSetup, Perspective, Session, SessionHandle, Stream,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;

/// Receive buffer size; larger than any packet the engine builds.
const MAX_DATAGRAM_SIZE: usize = 1500;

/// Writes session datagrams to the connected socket without blocking.
pub struct UdpWriter {
    socket: Arc<UdpSocket>,
}

impl ConnectionWriter for UdpWriter {
    fn write(&mut self, datagram: &[u8]) -> io::Result<()> {
        match self.socket.try_send(datagram) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                warn!(len = datagram.len(), "socket busy, dropping datagram");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

/// Serve one client until it goes away or Ctrl-C is received.
pub async fn run(config: ServerConfig) -> Result<()> {
    let bind_addr = config
        .network
        .socket_addr()
        .map_err(anyhow::Error::msg)
        .context("invalid bind address")?;
    let socket = UdpSocket::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(local_addr = %socket.local_addr()?, "listening for a client");

    let (first, peer, connection_id) = tokio::select! {
        accepted = accept_first(&socket, config.sni.as_deref()) => accepted?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received before any client connected");
            return Ok(());
        }
    };
    socket
        .connect(peer)
        .await
        .with_context(|| format!("failed to connect to {}", peer))?;
    info!(%peer, %connection_id, "client connected");

    let socket = Arc::new(socket);
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let (session, handle) = Session::new(
        connection_id,
        Perspective::Server,
        config.session.clone(),
        Box::new(UdpWriter {
            socket: socket.clone(),
        }),
        Box::new(NullCryptoSetup::server()),
    );
    let session = session
        .with_stream_callback(Box::new(move |_handle: &SessionHandle, stream: Stream| {
            let _ = accepted_tx.send(stream);
        }))
        .with_closed_callback(Box::new(|err: Option<&gquic::Error>| match err {
            None => info!("session closed"),
            Some(err) => warn!(error = %err, "session closed with error"),
        }));

    tokio::spawn(drain_streams(accepted_rx));
    handle.queue_datagram(first);
    let session_task = tokio::spawn(session.run());
    let reader = tokio::spawn(read_loop(socket, handle.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            handle.close(None, false);
        }
        _ = handle.closed() => {}
    }

    let result = session_task.await.context("session task panicked")?;
    reader.abort();

    let stats = handle.stats();
    info!(
        packets_sent = stats.packets_sent,
        packets_received = stats.packets_received,
        packets_dropped = stats.packets_dropped,
        bytes_sent = stats.bytes_sent,
        bytes_received = stats.bytes_received,
        streams_opened = stats.streams_opened,
        "session finished"
    );
    if let Err(err) = result {
        warn!(error = %err, "session ended with an error");
    }
    Ok(())
}

/// Wait for the first client packet that carries a connection id and, when
/// an SNI is configured, names this server.
async fn accept_first(socket: &UdpSocket, sni: Option<&str>) -> Result<(Bytes, SocketAddr, ConnectionId)> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, peer) = socket.recv_from(&mut buf).await.context("recv_from failed")?;
        let datagram = &buf[..len];

        let connection_id = match PublicHeader::parse(datagram) {
            Ok((PublicHeader { reset: false, connection_id: Some(id), .. }, _)) => id,
            Ok(_) => {
                debug!(%peer, "ignoring datagram without connection id");
                continue;
            }
            Err(err) => {
                debug!(%peer, error = %err, "ignoring datagram with invalid header");
                continue;
            }
        };

        if let Some(expected) = sni {
            match gquic::sni::parse_client_hello_sni(datagram) {
                Ok(Some(name)) if name == expected => {}
                Ok(name) => {
                    warn!(%peer, sni = ?name, expected, "rejecting client for another server name");
                    continue;
                }
                Err(err) => {
                    debug!(%peer, error = %err, "ignoring datagram that is not a client hello");
                    continue;
                }
            }
        }

        return Ok((Bytes::copy_from_slice(datagram), peer, connection_id));
    }
}

async fn read_loop(socket: Arc<UdpSocket>, handle: SessionHandle) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                if !handle.queue_datagram(Bytes::copy_from_slice(&buf[..len])) && handle.is_closed() {
                    break;
                }
            }
            // ICMP unreachable surfaces here on a connected socket
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                debug!("peer port unreachable");
            }
            Err(err) => {
                error!(error = %err, "socket receive failed");
                handle.close(Some(gquic::Error::Network(err.to_string())), false);
                break;
            }
        }
    }
}

/// Consume every accepted stream, logging how much each one carried.
async fn drain_streams(mut accepted: mpsc::UnboundedReceiver<Stream>) {
    while let Some(stream) = accepted.recv().await {
        tokio::spawn(async move {
            let id = stream.id();
            let mut buf = vec![0u8; 4096];
            let mut total = 0u64;
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => {
                        info!(stream_id = %id, bytes = total, "stream finished");
                        if let Err(err) = stream.finish() {
                            debug!(stream_id = %id, error = %err, "could not finish stream");
                        }
                        break;
                    }
                    Ok(n) => total += n as u64,
                    Err(err) => {
                        info!(stream_id = %id, bytes = total, error = %err, "stream closed");
                        break;
                    }
                }
            }
        });
    }
}
