//! Relay-side table of who is online.
//!
//! The registry is owned by the relay manager task, which is the only place
//! that mutates it, so every broadcast snapshot reflects exactly the latest
//! mutation. Each mutation publishes the full membership to every registered
//! peer; there is no incremental diff.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver};
use tokio::sync::Notify;

use crate::error::Result;
use crate::messages::{validate_identity, ConnectionId, Peer, ServerMessage};

/// Messages a relay connection may have queued before it is cut off.
pub const OUTBOX_CAPACITY: usize = 256;

/// Outbound queue of one relay connection. A dedicated writer task drains it,
/// so everything pushed here reaches that peer in push order. A peer that
/// stops reading fills its queue and gets disconnected.
#[derive(Clone)]
pub struct Outbox {
    queue: mpsc::Sender<ServerMessage>,
    overflow: Arc<Notify>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The writer is gone; the connection is closing.
    Closed,
    /// The queue is full; the connection has been told to close.
    Full,
}

/// Fires once the matching [`Outbox`] overflowed.
pub struct Overflow(Arc<Notify>);

impl Overflow {
    pub async fn wait(&self) {
        self.0.notified().await
    }
}

/// Create a connection's outbox with room for `capacity` messages.
pub fn outbox(capacity: usize) -> (Outbox, Receiver<ServerMessage>, Overflow) {
    let (queue, rx) = mpsc::channel(capacity);
    let overflow = Arc::new(Notify::new());
    (
        Outbox {
            queue,
            overflow: Arc::clone(&overflow),
        },
        rx,
        Overflow(overflow),
    )
}

impl Outbox {
    pub fn push(&self, message: ServerMessage) -> std::result::Result<(), PushError> {
        match self.queue.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("Outbox full, dropping connection");
                self.overflow.notify_one();
                Err(PushError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(PushError::Closed),
        }
    }
}

struct PeerEntry {
    display_name: String,
    outbox: Outbox,
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<ConnectionId, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a peer, then broadcast.
    pub fn register(&mut self, id: ConnectionId, display_name: &str, outbox: Outbox) -> Result<()> {
        let display_name = validate_identity(display_name)?;
        info!("Registered {} as {:?}", id, display_name);
        self.peers.insert(id, PeerEntry { display_name, outbox });
        self.broadcast();
        Ok(())
    }

    /// Rename a registered peer. Unknown ids are ignored.
    pub fn update_identity(&mut self, id: ConnectionId, display_name: &str) -> Result<()> {
        let Some(entry) = self.peers.get_mut(&id) else {
            debug!("Ignoring identity update from unregistered {}", id);
            return Ok(());
        };
        entry.display_name = validate_identity(display_name)?;
        debug!("{} is now {:?}", id, entry.display_name);
        self.broadcast();
        Ok(())
    }

    /// Idempotent. Returns whether the peer was present.
    pub fn remove(&mut self, id: &ConnectionId) -> bool {
        if self.peers.remove(id).is_some() {
            info!("Removed {}", id);
            self.broadcast();
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .iter()
            .map(|(id, entry)| Peer {
                connection_id: *id,
                display_name: entry.display_name.clone(),
            })
            .collect();
        peers.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.connection_id.cmp(&b.connection_id))
        });
        peers
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn display_name(&self, id: &ConnectionId) -> Option<&str> {
        self.peers.get(id).map(|entry| entry.display_name.as_str())
    }

    pub fn outbox(&self, id: &ConnectionId) -> Option<&Outbox> {
        self.peers.get(id).map(|entry| &entry.outbox)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn broadcast(&self) {
        let peers = self.snapshot();
        for (id, entry) in &self.peers {
            // A closed or full outbox means the connection is going away;
            // its reader will report the disconnect.
            if let Err(e) = entry.outbox.push(ServerMessage::PeerList {
                peers: peers.clone(),
            }) {
                debug!("Peer list not delivered to {}: {:?}", id, e);
            }
        }
    }
}
