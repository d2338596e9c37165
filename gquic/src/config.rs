//! Session configuration.
//!
//! All values can be overridden from the host's TOML file under
//! `[session]`; missing fields fall back to the defaults below.
//!
//! ```toml
//! [session]
//! max_packet_size = 1350
//! initial_stream_receive_window = 16384
//! idle_timeout_secs = 30
//! ```

#![forbid(unsafe_code)]

use core::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest packet that still fits a header, the AEAD tag and a frame.
const MIN_PACKET_SIZE: usize = 64;

/// Largest packet the engine will build.
const MAX_PACKET_SIZE: usize = 1452;

/// Per-session tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on an outgoing datagram (bytes)
    pub max_packet_size: usize,

    /// Receive window granted to each new stream (bytes)
    pub initial_stream_receive_window: u64,

    /// Receive window granted to the whole connection (bytes)
    pub initial_connection_receive_window: u64,

    /// Send window assumed for each new stream until the peer updates it
    pub initial_stream_send_window: u64,

    /// Send window assumed for the connection until the peer updates it
    pub initial_connection_send_window: u64,

    /// Packets assembled per send round before yielding
    pub max_packets_per_round: usize,

    /// Datagrams buffered between the socket and the session task
    pub max_queued_packets: usize,

    /// Streams the peer may have open at once
    pub max_incoming_streams: usize,

    /// Close the session after this much silence (`None` disables)
    pub idle_timeout_secs: Option<u64>,

    /// Close the session if the handshake has not finished by then
    pub handshake_timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1350,
            initial_stream_receive_window: 16 * 1024,
            initial_connection_receive_window: 24 * 1024,
            initial_stream_send_window: 16 * 1024,
            initial_connection_send_window: 24 * 1024,
            max_packets_per_round: 16,
            max_queued_packets: 256,
            max_incoming_streams: 100,
            idle_timeout_secs: Some(30),
            handshake_timeout_secs: Some(10),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    /// Check that every knob is usable, collecting all problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.max_packet_size) {
            errors.push(format!(
                "max_packet_size must be between {} and {} (got {})",
                MIN_PACKET_SIZE, MAX_PACKET_SIZE, self.max_packet_size
            ));
        }

        for (name, value) in [
            ("initial_stream_receive_window", self.initial_stream_receive_window),
            ("initial_connection_receive_window", self.initial_connection_receive_window),
            ("initial_stream_send_window", self.initial_stream_send_window),
            ("initial_connection_send_window", self.initial_connection_send_window),
        ] {
            if value == 0 {
                errors.push(format!("{} must be greater than 0", name));
            }
        }

        if self.initial_connection_receive_window < self.initial_stream_receive_window {
            errors.push(
                "initial_connection_receive_window must not be smaller than initial_stream_receive_window"
                    .to_string(),
            );
        }

        if self.max_packets_per_round == 0 {
            errors.push("max_packets_per_round must be greater than 0".to_string());
        }

        if self.max_queued_packets == 0 {
            errors.push("max_queued_packets must be greater than 0".to_string());
        }

        if self.max_incoming_streams == 0 {
            errors.push("max_incoming_streams must be greater than 0".to_string());
        }

        if self.idle_timeout_secs == Some(0) {
            errors.push("idle_timeout_secs must be greater than 0 when set".to_string());
        }

        if self.handshake_timeout_secs == Some(0) {
            errors.push("handshake_timeout_secs must be greater than 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_collects_every_problem() {
        let config = SessionConfig {
            max_packet_size: 10,
            max_packets_per_round: 0,
            idle_timeout_secs: Some(0),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str("max_packet_size = 1200\nidle_timeout_secs = 5").unwrap();
        assert_eq!(config.max_packet_size, 1200);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.initial_stream_receive_window, 16 * 1024);
    }
}
