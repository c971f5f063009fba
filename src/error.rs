//! Error types shared by the relay and the endpoint.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Display identity was empty, too long, or contained control characters.
    #[error("invalid display identity: {0:?}")]
    InvalidIdentity(String),

    /// The counterpart is no longer registered with the relay.
    #[error("peer is no longer connected")]
    PeerGone,

    /// Direct channel setup failed.
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),

    /// The direct channel failed mid-transfer.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The counterpart rejected the transfer request.
    #[error("peer declined")]
    Declined,

    /// This endpoint abandoned the transfer.
    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// A session event arrived in a state that does not accept it.
    #[error("cannot {event} while {state}")]
    InvalidTransition {
        state: &'static str,
        event: &'static str,
    },

    /// Relay framing could not be trusted any more.
    #[error("frame error: {0}")]
    Frame(String),

    #[error("relay rejected request: {0}")]
    Rejected(String),

    #[error("client is shut down")]
    ClientClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
