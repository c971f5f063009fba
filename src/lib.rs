pub mod chunks;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod handshake;
pub mod messages;
pub mod networking;
pub mod registry;
pub mod relay_utils;
pub mod router;
pub mod session;
pub mod transport;

use std::time::Duration;

pub use error::{Error, Result};

/// Largest slice of file bytes written to a direct channel in one message.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Upper bound on a single relay frame. Larger frames close the connection.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// How long a finished session stays visible before it is reset to idle.
pub const COMPLETION_GRACE: Duration = Duration::from_secs(3);

pub const MAX_IDENTITY_LEN: usize = 64;

pub const DEFAULT_RELAY_PORT: u16 = 8080;
pub const DEFAULT_RELAY_ADDR: &str = "127.0.0.1:8080";
