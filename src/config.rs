use std::time::Duration;

use crate::{CHUNK_SIZE, COMPLETION_GRACE, DEFAULT_RELAY_ADDR, DEFAULT_RELAY_PORT};

/// How long a session may spend between acceptance and channel-open.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
}

impl RelayConfig {
    pub fn on_port(port: u16) -> Self {
        RelayConfig {
            bind_addr: format!("0.0.0.0:{}", port),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self::on_port(DEFAULT_RELAY_PORT)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_addr: String,
    pub display_name: String,
    /// Bytes per chunk on the direct channel, at most [`CHUNK_SIZE`].
    pub chunk_size: usize,
    /// Delay between a session ending and its reset to idle.
    pub completion_grace: Duration,
    pub handshake_timeout: Duration,
}

impl ClientConfig {
    pub fn new(relay_addr: impl Into<String>, display_name: impl Into<String>) -> Self {
        ClientConfig {
            relay_addr: relay_addr.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, CHUNK_SIZE);
        self
    }

    pub fn with_completion_grace(mut self, grace: Duration) -> Self {
        self.completion_grace = grace;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            relay_addr: DEFAULT_RELAY_ADDR.to_string(),
            display_name: String::from("anonymous"),
            chunk_size: CHUNK_SIZE,
            completion_grace: COMPLETION_GRACE,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}
