use std::collections::HashMap;
use std::net::SocketAddr;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::error::Result;
use crate::messages::{validate_identity, ClientMessage, ConnectionId, ServerMessage};
use crate::networking::{receive_message, send_message};
use crate::registry::{outbox, Outbox, PeerRegistry, OUTBOX_CAPACITY};
use crate::router::{route, RouteOutcome};

/// Events from connection tasks to the manager.
pub enum Message {
    Connected { id: ConnectionId, outbox: Outbox },
    Inbound { id: ConnectionId, message: ClientMessage },
    Disconnected { id: ConnectionId },
}

/// Owns the registry. Running as a single task serializes every registry
/// mutation and every routing decision.
pub struct ConnectionManager {
    pub registry: PeerRegistry,
    /// Connections that have not joined yet.
    pub pending: HashMap<ConnectionId, Outbox>,
    pub receiver_channel: Receiver<Message>,
}

impl ConnectionManager {
    pub fn new(receiver_channel: Receiver<Message>) -> Self {
        ConnectionManager {
            registry: PeerRegistry::new(),
            pending: HashMap::new(),
            receiver_channel,
        }
    }

    pub fn handle(&mut self, message: Message) {
        match message {
            Message::Connected { id, outbox } => {
                self.pending.insert(id, outbox);
            }
            Message::Inbound { id, message } => self.handle_inbound(id, message),
            Message::Disconnected { id } => {
                self.pending.remove(&id);
                self.registry.remove(&id);
            }
        }
    }

    fn handle_inbound(&mut self, id: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Join { display_name } => self.join(id, &display_name),
            ClientMessage::UpdateIdentity { display_name } => {
                if let Err(e) = self.registry.update_identity(id, &display_name) {
                    warn!("Rejected identity update from {}: {}", id, e);
                    self.reply(id, ServerMessage::Error { message: e.to_string() });
                }
            }
            routed => {
                if let Some((to, signal)) = routed.into_routed() {
                    let outcome = route(&self.registry, id, to, signal);
                    if outcome != RouteOutcome::Delivered {
                        debug!("Route from {} to {} ended as {:?}", id, to, outcome);
                    }
                }
            }
        }
    }

    fn join(&mut self, id: ConnectionId, display_name: &str) {
        if let Err(e) = validate_identity(display_name) {
            warn!("Rejected join from {}: {}", id, e);
            self.reply(id, ServerMessage::Error { message: e.to_string() });
            return;
        }
        let outbox = match self.pending.remove(&id) {
            Some(outbox) => {
                // Welcome goes out before the first peer list on the same queue.
                let _ = outbox.push(ServerMessage::Welcome { connection_id: id });
                outbox
            }
            None => match self.registry.outbox(&id) {
                Some(outbox) => outbox.clone(),
                None => {
                    debug!("Join from vanished connection {}", id);
                    return;
                }
            },
        };
        if let Err(e) = self.registry.register(id, display_name, outbox) {
            warn!("Rejected join from {}: {}", id, e);
        }
    }

    fn reply(&self, id: ConnectionId, message: ServerMessage) {
        let outbox = self.pending.get(&id).or_else(|| self.registry.outbox(&id));
        if let Some(outbox) = outbox {
            let _ = outbox.push(message);
        }
    }
}

pub async fn relay_manager(mut manager: ConnectionManager) {
    while let Some(message) = manager.receiver_channel.recv().await {
        manager.handle(message);
    }
    debug!("Relay manager channel closed");
}

/// Accept connections forever, one reader and one writer task per client.
pub async fn serve(listener: TcpListener) -> Result<()> {
    let (sender_channel, receiver_channel) = mpsc::channel::<Message>(1024);
    tokio::spawn(relay_manager(ConnectionManager::new(receiver_channel)));

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("New client connection from: {}", addr);
        tokio::spawn(handle_new_connection(stream, addr, sender_channel.clone()));
    }
}

pub async fn handle_new_connection(stream: TcpStream, addr: SocketAddr, manager_channel: Sender<Message>) {
    let id = ConnectionId::new();
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", addr, e);
    }
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbox, mut outbound, overflow) = outbox(OUTBOX_CAPACITY);

    if manager_channel
        .send(Message::Connected { id, outbox })
        .await
        .is_err()
    {
        error!("Relay manager is gone, dropping {}", addr);
        return;
    }

    // Writer: drains this connection's outbox in order.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = send_message(&mut write_half, &message).await {
                debug!("Write to {} failed: {}", id, e);
                break;
            }
        }
    });

    let mut overflowed = false;
    loop {
        let received = tokio::select! {
            received = receive_message::<_, ClientMessage>(&mut read_half) => received,
            _ = overflow.wait() => {
                warn!("Closing {} ({}): not reading its messages", id, addr);
                overflowed = true;
                break;
            }
        };
        match received {
            Ok(Some(message)) => {
                if manager_channel
                    .send(Message::Inbound { id, message })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                info!("Client {} ({}) disconnected", id, addr);
                break;
            }
            Err(e) => {
                warn!("Closing {} ({}): {}", id, addr, e);
                break;
            }
        }
    }

    let _ = manager_channel.send(Message::Disconnected { id }).await;
    if overflowed {
        // A peer that stopped reading would stall the flush.
        writer.abort();
    } else {
        // The registry dropped our outbox, so the writer finishes after flushing.
        let _ = writer.await;
    }
}
