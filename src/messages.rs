use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::MAX_IDENTITY_LEN;

/// Relay-assigned identity of one relay connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        ConnectionId(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ConnectionId(Uuid::parse_str(s)?))
    }
}

/// One online participant as published in every `peer-list`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub connection_id: ConnectionId,
    pub display_name: String,
}

/// Trim and validate a display identity.
///
/// Returns the stored form (trimmed) or `InvalidIdentity`.
pub fn validate_identity(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty()
        || trimmed.chars().count() > MAX_IDENTITY_LEN
        || trimmed.chars().any(char::is_control)
    {
        return Err(Error::InvalidIdentity(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Metadata the sender declares up front. `size` is the only completion signal
/// the receiver has.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    /// Lowercase hex SHA-256 of the whole file, when the sender computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl FileMeta {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let mime_type = mime_for_name(&name).to_string();
        FileMeta {
            name,
            size,
            mime_type,
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: String) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidFile(format!("{} is empty", self.name)));
        }
        if self.name.trim().is_empty() {
            return Err(Error::InvalidFile("file name is empty".to_string()));
        }
        Ok(())
    }

    /// Base name safe to join onto a local directory.
    pub fn safe_name(&self) -> String {
        Path::new(&self.name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "..")
            .unwrap_or("download")
            .to_string()
    }
}

pub fn mime_for_name(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt") | Some("md") | Some("log") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Opaque local session parameters produced by the direct-channel primitive.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct SessionDescription(pub String);

/// Opaque connectivity candidate produced by the direct-channel primitive.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct IceCandidate(pub String);

/// The six point-to-point kinds the relay forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    TransferRequest { file: FileMeta },
    TransferAccept,
    TransferReject,
    Offer { description: SessionDescription },
    Answer { description: SessionDescription },
    IceCandidate { candidate: IceCandidate },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::TransferRequest { .. } => "transfer-request",
            Signal::TransferAccept => "transfer-accept",
            Signal::TransferReject => "transfer-reject",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice-candidate",
        }
    }
}

/// Client to relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join { display_name: String },
    UpdateIdentity { display_name: String },
    TransferRequest { to: ConnectionId, file: FileMeta },
    TransferAccept { to: ConnectionId },
    TransferReject { to: ConnectionId },
    Offer { to: ConnectionId, description: SessionDescription },
    Answer { to: ConnectionId, description: SessionDescription },
    IceCandidate { to: ConnectionId, candidate: IceCandidate },
}

impl ClientMessage {
    pub fn signal(to: ConnectionId, signal: Signal) -> Self {
        match signal {
            Signal::TransferRequest { file } => ClientMessage::TransferRequest { to, file },
            Signal::TransferAccept => ClientMessage::TransferAccept { to },
            Signal::TransferReject => ClientMessage::TransferReject { to },
            Signal::Offer { description } => ClientMessage::Offer { to, description },
            Signal::Answer { description } => ClientMessage::Answer { to, description },
            Signal::IceCandidate { candidate } => ClientMessage::IceCandidate { to, candidate },
        }
    }

    /// Split a routable message into its recipient and typed payload.
    /// Registry messages (`join`, `update-identity`) return `None`.
    pub fn into_routed(self) -> Option<(ConnectionId, Signal)> {
        match self {
            ClientMessage::Join { .. } | ClientMessage::UpdateIdentity { .. } => None,
            ClientMessage::TransferRequest { to, file } => {
                Some((to, Signal::TransferRequest { file }))
            }
            ClientMessage::TransferAccept { to } => Some((to, Signal::TransferAccept)),
            ClientMessage::TransferReject { to } => Some((to, Signal::TransferReject)),
            ClientMessage::Offer { to, description } => Some((to, Signal::Offer { description })),
            ClientMessage::Answer { to, description } => {
                Some((to, Signal::Answer { description }))
            }
            ClientMessage::IceCandidate { to, candidate } => {
                Some((to, Signal::IceCandidate { candidate }))
            }
        }
    }
}

/// Relay to client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome { connection_id: ConnectionId },
    PeerList { peers: Vec<Peer> },
    Error { message: String },
    TransferRequest {
        from: ConnectionId,
        sender_identity: String,
        file: FileMeta,
    },
    TransferAccept { from: ConnectionId },
    TransferReject { from: ConnectionId },
    Offer { from: ConnectionId, description: SessionDescription },
    Answer { from: ConnectionId, description: SessionDescription },
    IceCandidate { from: ConnectionId, candidate: IceCandidate },
}

impl ServerMessage {
    /// Build the forwarded form of a signal. `sender_identity` is only
    /// carried by `transfer-request`.
    pub fn forward(from: ConnectionId, sender_identity: &str, signal: Signal) -> Self {
        match signal {
            Signal::TransferRequest { file } => ServerMessage::TransferRequest {
                from,
                sender_identity: sender_identity.to_string(),
                file,
            },
            Signal::TransferAccept => ServerMessage::TransferAccept { from },
            Signal::TransferReject => ServerMessage::TransferReject { from },
            Signal::Offer { description } => ServerMessage::Offer { from, description },
            Signal::Answer { description } => ServerMessage::Answer { from, description },
            Signal::IceCandidate { candidate } => ServerMessage::IceCandidate { from, candidate },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // Identity Validation Tests
    // ============================================================================

    #[test]
    fn test_validate_identity_trims() {
        assert_eq!(validate_identity("  Brave Otter ").unwrap(), "Brave Otter");
    }

    #[test]
    fn test_validate_identity_rejects_empty_and_control() {
        assert!(matches!(validate_identity(""), Err(Error::InvalidIdentity(_))));
        assert!(matches!(validate_identity("   "), Err(Error::InvalidIdentity(_))));
        assert!(matches!(validate_identity("a\u{7}b"), Err(Error::InvalidIdentity(_))));
        let long = "x".repeat(MAX_IDENTITY_LEN + 1);
        assert!(validate_identity(&long).is_err());
        assert!(validate_identity(&"x".repeat(MAX_IDENTITY_LEN)).is_ok());
    }

    // ============================================================================
    // File Metadata Tests
    // ============================================================================

    #[test]
    fn test_file_meta_rejects_zero_size() {
        assert!(FileMeta::new("a.txt", 0).validate().is_err());
        assert!(FileMeta::new("a.txt", 1).validate().is_ok());
    }

    #[test]
    fn test_file_meta_mime_and_safe_name() {
        let meta = FileMeta::new("../../etc/Photo.JPG", 10);
        assert_eq!(meta.mime_type, "image/jpeg");
        assert_eq!(meta.safe_name(), "Photo.JPG");
        assert_eq!(FileMeta::new("blob", 1).mime_type, "application/octet-stream");
        assert_eq!(FileMeta::new("..", 1).safe_name(), "download");
    }

    // ============================================================================
    // Wire Shape Tests
    // ============================================================================

    #[test]
    fn test_client_message_wire_shape() {
        let to = ConnectionId::new();
        let msg = ClientMessage::signal(
            to,
            Signal::TransferRequest {
                file: FileMeta::new("a.txt", 70000),
            },
        );
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "transfer-request");
        assert_eq!(json["to"], to.to_string());
        assert_eq!(json["file"]["size"], 70000);
        assert!(json["file"].get("checksum").is_none());
    }

    #[test]
    fn test_server_message_parses_from_json() {
        let from = ConnectionId::new();
        let raw = format!(r#"{{"type":"ice-candidate","from":"{}","candidate":"127.0.0.1:9"}}"#, from);
        let msg: ServerMessage = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            msg,
            ServerMessage::IceCandidate {
                from,
                candidate: IceCandidate("127.0.0.1:9".to_string())
            }
        );
    }

    #[test]
    fn test_registry_messages_are_not_routed() {
        let join = ClientMessage::Join {
            display_name: "x".to_string(),
        };
        assert!(join.into_routed().is_none());
        let to = ConnectionId::new();
        let (dest, signal) = ClientMessage::TransferAccept { to }.into_routed().unwrap();
        assert_eq!(dest, to);
        assert_eq!(signal.kind(), "transfer-accept");
    }

    #[test]
    fn test_forward_attaches_identity_only_to_requests() {
        let from = ConnectionId::new();
        let fwd = ServerMessage::forward(
            from,
            "Brave Otter",
            Signal::TransferRequest {
                file: FileMeta::new("a.txt", 5),
            },
        );
        match fwd {
            ServerMessage::TransferRequest { sender_identity, .. } => {
                assert_eq!(sender_identity, "Brave Otter")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            ServerMessage::forward(from, "ignored", Signal::TransferReject),
            ServerMessage::TransferReject { from }
        );
    }
}
