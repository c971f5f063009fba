//! Endpoint agent: one relay connection, one session per counterpart.
//!
//! All session state lives in a single task, so relay messages, commands
//! from the application and events from per-session tasks are applied in
//! the order they arrive. Applications talk to it through a cloneable
//! [`Client`] handle and observe it through a stream of [`ClientEvent`]s.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::chunks::{describe_file, Payload};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::handshake::{EventSink, SessionTask, SignalInput, TaskEvent, TaskEventKind, Work};
use crate::messages::{validate_identity, ClientMessage, ConnectionId, FileMeta, Peer, ServerMessage, Signal};
use crate::networking::{establish_connection, receive_message, send_message};
use crate::session::{FailureReason, Role, SessionStatus, TransferRequest, TransferSession};
use crate::transport::PeerConnector;

/// What the application sees. Every event names the counterpart it concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    PeerList(Vec<Peer>),
    IncomingRequest {
        from: ConnectionId,
        sender_identity: String,
        file: FileMeta,
    },
    StatusChanged {
        peer: ConnectionId,
        status: SessionStatus,
    },
    Progress {
        peer: ConnectionId,
        transferred: u64,
        total: u64,
    },
    FileReceived {
        peer: ConnectionId,
        file: FileMeta,
        data: Vec<u8>,
    },
    TransferCompleted {
        peer: ConnectionId,
        role: Role,
    },
    TransferFailed {
        peer: ConnectionId,
        reason: FailureReason,
    },
    /// The session's grace period ended and it is idle again.
    SessionReset { peer: ConnectionId },
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Peers(Reply<Vec<Peer>>),
    SetDisplayName(String, Reply<()>),
    SendFile {
        to: ConnectionId,
        payload: Payload,
        file: FileMeta,
        reply: Reply<()>,
    },
    Accept(ConnectionId, Reply<()>),
    Reject(ConnectionId, Reply<()>),
    Cancel(ConnectionId, Reply<()>),
}

#[derive(Clone)]
pub struct Client {
    id: ConnectionId,
    commands: UnboundedSender<Command>,
}

impl Client {
    /// Join the relay and start the agent. The returned receiver yields the
    /// initial peer list first; it ends once the relay connection is gone.
    pub async fn connect<C: PeerConnector>(
        config: ClientConfig,
        connector: C,
    ) -> Result<(Client, UnboundedReceiver<ClientEvent>)> {
        let display_name = validate_identity(&config.display_name)?;
        let connection = establish_connection(&config.relay_addr, &display_name).await?;
        let id = connection.connection_id;
        info!("Joined relay {} as {} ({})", config.relay_addr, display_name, id);

        let (outgoing_tx, mut outgoing_rx) = unbounded_channel::<ClientMessage>();
        let mut write_half = connection.write_half;
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = send_message(&mut write_half, &message).await {
                    warn!("Failed to write to relay: {}", e);
                    break;
                }
            }
        });

        let (inbound_tx, inbound_rx) = unbounded_channel::<ServerMessage>();
        let mut read_half = connection.read_half;
        tokio::spawn(async move {
            loop {
                match receive_message(&mut read_half).await {
                    Ok(Some(message)) => {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
        });

        let (events_tx, events_rx) = unbounded_channel();
        let (commands_tx, commands_rx) = unbounded_channel();
        let (task_tx, task_rx) = unbounded_channel();
        let (reset_tx, reset_rx) = unbounded_channel();

        let _ = events_tx.send(ClientEvent::PeerList(connection.initial_peers.clone()));
        let agent = Agent {
            id,
            config,
            connector: Arc::new(connector),
            outgoing: outgoing_tx,
            events: events_tx,
            task_tx,
            reset_tx,
            peers: connection.initial_peers,
            sessions: HashMap::new(),
            next_epoch: 0,
        };
        tokio::spawn(agent.run(inbound_rx, commands_rx, task_rx, reset_rx));

        Ok((
            Client {
                id,
                commands: commands_tx,
            },
            events_rx,
        ))
    }

    /// Our connection id on the relay.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| Error::ClientClosed)?;
        rx.await.map_err(|_| Error::ClientClosed)?
    }

    /// The most recent peer list from the relay.
    pub async fn peers(&self) -> Result<Vec<Peer>> {
        self.request(Command::Peers).await
    }

    pub async fn set_display_name(&self, display_name: &str) -> Result<()> {
        let display_name = validate_identity(display_name)?;
        self.request(|reply| Command::SetDisplayName(display_name, reply))
            .await
    }

    /// Issue a transfer request. An existing session with `to` is replaced.
    pub async fn send_file(&self, to: ConnectionId, payload: Payload, file: FileMeta) -> Result<()> {
        self.request(|reply| Command::SendFile {
            to,
            payload,
            file,
            reply,
        })
        .await
    }

    /// Describe `path` (size, checksum, MIME type) and offer it to `to`.
    pub async fn send_path(&self, to: ConnectionId, path: &Path) -> Result<FileMeta> {
        let file = describe_file(path).await?;
        self.send_file(to, Payload::File(path.to_path_buf()), file.clone())
            .await?;
        Ok(file)
    }

    pub async fn accept(&self, from: ConnectionId) -> Result<()> {
        self.request(|reply| Command::Accept(from, reply)).await
    }

    pub async fn reject(&self, from: ConnectionId) -> Result<()> {
        self.request(|reply| Command::Reject(from, reply)).await
    }

    /// Abandon the session with `peer`, whatever stage it is in.
    pub async fn cancel(&self, peer: ConnectionId) -> Result<()> {
        self.request(|reply| Command::Cancel(peer, reply)).await
    }
}

struct SessionEntry {
    session: TransferSession,
    epoch: u64,
    payload: Option<Payload>,
    signals: Option<UnboundedSender<SignalInput>>,
    task: Option<JoinHandle<()>>,
}

impl SessionEntry {
    fn stop_task(&mut self) {
        self.signals = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Agent<C: PeerConnector> {
    id: ConnectionId,
    config: ClientConfig,
    connector: Arc<C>,
    outgoing: UnboundedSender<ClientMessage>,
    events: UnboundedSender<ClientEvent>,
    task_tx: UnboundedSender<TaskEvent>,
    reset_tx: UnboundedSender<(ConnectionId, u64)>,
    peers: Vec<Peer>,
    sessions: HashMap<ConnectionId, SessionEntry>,
    next_epoch: u64,
}

impl<C: PeerConnector> Agent<C> {
    async fn run(
        mut self,
        mut inbound: UnboundedReceiver<ServerMessage>,
        mut commands: UnboundedReceiver<Command>,
        mut tasks: UnboundedReceiver<TaskEvent>,
        mut resets: UnboundedReceiver<(ConnectionId, u64)>,
    ) {
        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.handle_server_message(message),
                    None => {
                        info!("Relay connection closed");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = tasks.recv() => self.handle_task_event(event),
                Some((peer, epoch)) = resets.recv() => self.handle_reset(peer, epoch),
            }
        }
        self.shutdown();
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn peer_present(&self, peer: &ConnectionId) -> bool {
        self.peers.iter().any(|p| &p.connection_id == peer)
    }

    /// Send a control message, unless the counterpart already left.
    fn send_control(&self, to: ConnectionId, signal: Signal) -> Result<()> {
        if !self.peer_present(&to) {
            return Err(Error::PeerGone);
        }
        debug!("Sending {} to {}", signal.kind(), to);
        self.outgoing
            .send(ClientMessage::signal(to, signal))
            .map_err(|_| Error::ClientClosed)
    }

    // ------------------------------------------------------------------
    // Relay messages
    // ------------------------------------------------------------------

    fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { .. } => {}
            ServerMessage::Error { message } => warn!("Relay error: {}", message),
            ServerMessage::PeerList { peers } => self.on_peer_list(peers),
            ServerMessage::TransferRequest {
                from,
                sender_identity,
                file,
            } => self.on_transfer_request(from, sender_identity, file),
            ServerMessage::TransferAccept { from } => self.on_transfer_accept(from),
            ServerMessage::TransferReject { from } => self.on_transfer_reject(from),
            ServerMessage::Offer { from, description } => {
                self.forward_signal(from, SignalInput::Offer(description), |s| {
                    s.remote_description_received()
                })
            }
            ServerMessage::Answer { from, description } => {
                self.forward_signal(from, SignalInput::Answer(description), |s| {
                    s.remote_description_received()
                })
            }
            ServerMessage::IceCandidate { from, candidate } => {
                self.forward_signal(from, SignalInput::Candidate(candidate), |s| {
                    s.candidate_applied()
                })
            }
        }
    }

    fn on_peer_list(&mut self, peers: Vec<Peer>) {
        debug!("Peer list updated: {} peers", peers.len());
        self.peers = peers;
        let gone: Vec<ConnectionId> = self
            .sessions
            .iter()
            .filter(|(peer, entry)| entry.session.is_active() && !self.peer_present(peer))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in gone {
            info!("Counterpart {} left the relay", peer);
            self.fail_session(peer, FailureReason::PeerGone);
        }
        self.emit(ClientEvent::PeerList(self.peers.clone()));
    }

    fn on_transfer_request(&mut self, from: ConnectionId, sender_identity: String, file: FileMeta) {
        let request = TransferRequest {
            from,
            to: self.id,
            file: file.clone(),
        };
        let session = match TransferSession::inbound(request) {
            Ok(session) => session,
            Err(e) => {
                warn!("Refusing request from {}: {}", from, e);
                let _ = self.send_control(from, Signal::TransferReject);
                return;
            }
        };
        if self.sessions.contains_key(&from) {
            debug!("New request from {} replaces its previous session", from);
        }
        self.install(from, session, None);
        self.emit(ClientEvent::IncomingRequest {
            from,
            sender_identity,
            file,
        });
        self.emit_status(from);
    }

    fn on_transfer_accept(&mut self, from: ConnectionId) {
        let Some(entry) = self.sessions.get_mut(&from) else {
            debug!("Accept from {} without a session", from);
            return;
        };
        if let Err(e) = entry.session.peer_accepted() {
            warn!("Ignoring accept from {}: {}", from, e);
            return;
        }
        let Some(payload) = entry.payload.take() else {
            self.fail_session(from, FailureReason::Cancelled);
            return;
        };
        self.emit_status(from);
        self.start_task(from, Work::Send(payload));
    }

    fn on_transfer_reject(&mut self, from: ConnectionId) {
        let Some(entry) = self.sessions.get_mut(&from) else {
            return;
        };
        match entry.session.peer_rejected() {
            Ok(()) => {
                let status = entry.session.status().clone();
                if let SessionStatus::Failed(reason) = status {
                    info!("Session with {} ended: {}", from, reason);
                    entry.stop_task();
                    self.emit_status(from);
                    self.emit(ClientEvent::TransferFailed { peer: from, reason });
                    self.schedule_reset(from);
                }
            }
            Err(e) => debug!("Ignoring reject from {}: {}", from, e),
        }
    }

    /// Record a negotiation message on the session and hand it to the task.
    fn forward_signal(
        &mut self,
        from: ConnectionId,
        input: SignalInput,
        record: impl FnOnce(&mut TransferSession) -> Result<()>,
    ) {
        let Some(entry) = self.sessions.get_mut(&from) else {
            debug!("Dropping negotiation message from {} without a session", from);
            return;
        };
        if let Err(e) = record(&mut entry.session) {
            debug!("Dropping negotiation message from {}: {}", from, e);
            return;
        }
        if let Some(signals) = &entry.signals {
            let _ = signals.send(input);
        }
    }

    // ------------------------------------------------------------------
    // Application commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Peers(reply) => {
                let _ = reply.send(Ok(self.peers.clone()));
            }
            Command::SetDisplayName(display_name, reply) => {
                let result = self
                    .outgoing
                    .send(ClientMessage::UpdateIdentity { display_name })
                    .map_err(|_| Error::ClientClosed);
                let _ = reply.send(result);
            }
            Command::SendFile {
                to,
                payload,
                file,
                reply,
            } => {
                let _ = reply.send(self.start_request(to, payload, file));
            }
            Command::Accept(from, reply) => {
                let _ = reply.send(self.accept(from));
            }
            Command::Reject(from, reply) => {
                let _ = reply.send(self.reject(from));
            }
            Command::Cancel(peer, reply) => {
                let _ = reply.send(self.cancel(peer));
            }
        }
    }

    fn start_request(&mut self, to: ConnectionId, payload: Payload, file: FileMeta) -> Result<()> {
        if to == self.id {
            return Err(Error::InvalidFile("cannot send to ourselves".to_string()));
        }
        let session = TransferSession::outbound(TransferRequest {
            from: self.id,
            to,
            file: file.clone(),
        })?;
        self.install(to, session, Some(payload));
        self.emit_status(to);
        self.send_control(to, Signal::TransferRequest { file })
            .map_err(|e| self.control_failed(to, e))
    }

    fn accept(&mut self, from: ConnectionId) -> Result<()> {
        let entry = self.sessions.get_mut(&from).ok_or(Error::InvalidTransition {
            state: "idle",
            event: "accept",
        })?;
        entry.session.accept()?;
        self.emit_status(from);
        self.send_control(from, Signal::TransferAccept)
            .map_err(|e| self.control_failed(from, e))?;
        self.start_task(from, Work::Receive);
        Ok(())
    }

    fn reject(&mut self, from: ConnectionId) -> Result<()> {
        let entry = self.sessions.get_mut(&from).ok_or(Error::InvalidTransition {
            state: "idle",
            event: "reject",
        })?;
        entry.session.reject()?;
        self.emit_status(from);
        // Nothing to show for a declined request, so no grace period.
        if let Some(mut entry) = self.sessions.remove(&from) {
            entry.session.reset();
            self.emit(ClientEvent::SessionReset { peer: from });
        }
        self.send_control(from, Signal::TransferReject)
    }

    fn cancel(&mut self, peer: ConnectionId) -> Result<()> {
        let entry = self.sessions.get(&peer).ok_or(Error::InvalidTransition {
            state: "idle",
            event: "cancel",
        })?;
        if !entry.session.is_active() {
            return Err(Error::InvalidTransition {
                state: entry.session.status().name(),
                event: "cancel",
            });
        }
        if matches!(
            entry.session.status(),
            SessionStatus::Requesting | SessionStatus::Receiving
        ) {
            // Let the counterpart unwind too; a departed one needs no notice.
            let _ = self.send_control(peer, Signal::TransferReject);
        }
        self.fail_session(peer, FailureReason::Cancelled);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session task events
    // ------------------------------------------------------------------

    fn handle_task_event(&mut self, event: TaskEvent) {
        let TaskEvent { peer, epoch, kind } = event;
        let current = self
            .sessions
            .get(&peer)
            .is_some_and(|entry| entry.epoch == epoch && entry.session.is_active());
        if !current {
            return;
        }

        let result = match kind {
            TaskEventKind::Outgoing(signal) => self.on_outgoing(peer, signal),
            TaskEventKind::ChannelOpen => self.on_channel_open(peer),
            TaskEventKind::Progress(bytes) => self.on_progress(peer, bytes).map(|_| ()),
            TaskEventKind::Received(data) => self.on_received(peer, data),
            TaskEventKind::Failed(e) => Err(e),
        };
        if let Err(e) = result {
            self.fail_session(peer, FailureReason::from(e));
        }
    }

    fn on_outgoing(&mut self, peer: ConnectionId, signal: Signal) -> Result<()> {
        let entry = self.sessions.get_mut(&peer).ok_or(Error::PeerGone)?;
        let moves_state = match &signal {
            Signal::Offer { .. } | Signal::Answer { .. } => {
                entry.session.local_description_sent()?;
                true
            }
            Signal::IceCandidate { .. } => {
                entry.session.candidate_sent()?;
                false
            }
            other => {
                warn!("Session task produced unexpected {}", other.kind());
                return Ok(());
            }
        };
        self.send_control(peer, signal)?;
        if moves_state {
            self.emit_status(peer);
        }
        Ok(())
    }

    fn on_channel_open(&mut self, peer: ConnectionId) -> Result<()> {
        let entry = self.sessions.get_mut(&peer).ok_or(Error::PeerGone)?;
        entry.session.channel_open()?;
        self.emit_status(peer);
        Ok(())
    }

    /// Returns whether the session completed.
    fn on_progress(&mut self, peer: ConnectionId, bytes: u64) -> Result<bool> {
        let entry = self.sessions.get_mut(&peer).ok_or(Error::PeerGone)?;
        let completed = entry.session.record_progress(bytes)?;
        let role = entry.session.role();
        let transferred = entry.session.transferred_bytes();
        let total = entry.session.total_bytes();
        self.emit(ClientEvent::Progress {
            peer,
            transferred,
            total,
        });
        if completed {
            info!("Transfer with {} completed", peer);
            self.emit_status(peer);
            self.emit(ClientEvent::TransferCompleted { peer, role });
            self.schedule_reset(peer);
        }
        Ok(completed)
    }

    fn on_received(&mut self, peer: ConnectionId, data: Vec<u8>) -> Result<()> {
        let entry = self.sessions.get(&peer).ok_or(Error::PeerGone)?;
        let remaining = entry.session.total_bytes() - entry.session.transferred_bytes();
        let file = entry.session.request().file.clone();
        if data.len() as u64 != entry.session.total_bytes() {
            return Err(Error::TransportError(format!(
                "received {} of {} bytes",
                data.len(),
                file.size
            )));
        }
        // FileReceived goes out before the completion it leads to.
        self.emit(ClientEvent::FileReceived { peer, file, data });
        self.on_progress(peer, remaining)?;
        Ok(())
    }

    /// A control message could not go out: the session fails and the caller
    /// gets the same error.
    fn control_failed(&mut self, peer: ConnectionId, error: Error) -> Error {
        let reason = match &error {
            Error::PeerGone => FailureReason::PeerGone,
            other => FailureReason::Transport(other.to_string()),
        };
        self.fail_session(peer, reason);
        error
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Replace any previous session with `peer`.
    fn install(&mut self, peer: ConnectionId, session: TransferSession, payload: Option<Payload>) {
        self.next_epoch += 1;
        let entry = SessionEntry {
            session,
            epoch: self.next_epoch,
            payload,
            signals: None,
            task: None,
        };
        if let Some(mut previous) = self.sessions.insert(peer, entry) {
            previous.stop_task();
        }
    }

    fn start_task(&mut self, peer: ConnectionId, work: Work) {
        let Some(entry) = self.sessions.get_mut(&peer) else {
            return;
        };
        let (signals_tx, signals_rx) = unbounded_channel();
        let task = SessionTask {
            connector: Arc::clone(&self.connector),
            file: entry.session.request().file.clone(),
            work,
            chunk_size: self.config.chunk_size,
            handshake_timeout: self.config.handshake_timeout,
            signals: signals_rx,
            events: EventSink::new(peer, entry.epoch, self.task_tx.clone()),
        };
        entry.signals = Some(signals_tx);
        entry.task = Some(tokio::spawn(task.run()));
    }

    /// Force the session to `Failed`, releasing its channel and connection.
    fn fail_session(&mut self, peer: ConnectionId, reason: FailureReason) {
        let Some(entry) = self.sessions.get_mut(&peer) else {
            return;
        };
        if !entry.session.fail(reason.clone()) {
            return;
        }
        warn!("Transfer with {} failed: {}", peer, reason);
        entry.stop_task();
        entry.payload = None;
        self.emit_status(peer);
        self.emit(ClientEvent::TransferFailed { peer, reason });
        self.schedule_reset(peer);
    }

    fn schedule_reset(&self, peer: ConnectionId) {
        let Some(entry) = self.sessions.get(&peer) else {
            return;
        };
        let epoch = entry.epoch;
        let grace = self.config.completion_grace;
        let reset_tx = self.reset_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = reset_tx.send((peer, epoch));
        });
    }

    fn handle_reset(&mut self, peer: ConnectionId, epoch: u64) {
        let Some(entry) = self.sessions.get_mut(&peer) else {
            return;
        };
        if entry.epoch != epoch || !entry.session.reset() {
            return;
        }
        entry.stop_task();
        self.sessions.remove(&peer);
        self.emit(ClientEvent::SessionReset { peer });
    }

    fn emit_status(&self, peer: ConnectionId) {
        if let Some(entry) = self.sessions.get(&peer) {
            self.emit(ClientEvent::StatusChanged {
                peer,
                status: entry.session.status().clone(),
            });
        }
    }

    fn shutdown(&mut self) {
        let peers: Vec<ConnectionId> = self.sessions.keys().copied().collect();
        for peer in peers {
            self.fail_session(peer, FailureReason::Transport("relay connection lost".to_string()));
            if let Some(mut entry) = self.sessions.remove(&peer) {
                entry.stop_task();
            }
        }
        debug!("Client {} stopped", self.id);
    }
}
