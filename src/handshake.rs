//! Per-session task that negotiates the direct channel and runs the transfer.
//!
//! The task owns the peer connection. Relay traffic goes through the client:
//! the task emits outgoing signals as [`TaskEvent`]s and receives the
//! counterpart's negotiation messages as [`SignalInput`]s. Every suspension
//! point (waiting for the offer or answer, for channel-open, for chunk
//! acceptance) is an `.await` here, never a callback.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::chunks::{receive_file, send_file, Payload};
use crate::error::{Error, Result};
use crate::messages::{ConnectionId, FileMeta, IceCandidate, SessionDescription, Signal};
use crate::transport::{DataChannel, PeerConnection, PeerConnector};

/// Negotiation messages forwarded from the relay into a session task.
#[derive(Debug, Clone)]
pub enum SignalInput {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug)]
pub enum TaskEventKind {
    /// Send this signal to the counterpart through the relay.
    Outgoing(Signal),
    ChannelOpen,
    Progress(u64),
    /// Receive path finished with the whole, verified file. Accounts for
    /// every byte not yet reported through `Progress`.
    Received(Vec<u8>),
    Failed(Error),
}

/// Tagged with the session it belongs to; `epoch` tells a replaced session's
/// leftovers apart from the current one.
#[derive(Debug)]
pub struct TaskEvent {
    pub peer: ConnectionId,
    pub epoch: u64,
    pub kind: TaskEventKind,
}

#[derive(Clone)]
pub struct EventSink {
    peer: ConnectionId,
    epoch: u64,
    tx: UnboundedSender<TaskEvent>,
}

impl EventSink {
    pub fn new(peer: ConnectionId, epoch: u64, tx: UnboundedSender<TaskEvent>) -> Self {
        EventSink { peer, epoch, tx }
    }

    fn emit(&self, kind: TaskEventKind) {
        // The client only drops its receiver while shutting down.
        let _ = self.tx.send(TaskEvent {
            peer: self.peer,
            epoch: self.epoch,
            kind,
        });
    }
}

pub enum Work {
    Send(Payload),
    Receive,
}

pub struct SessionTask<C: PeerConnector> {
    pub connector: Arc<C>,
    pub file: FileMeta,
    pub work: Work,
    pub chunk_size: usize,
    pub handshake_timeout: Duration,
    pub signals: UnboundedReceiver<SignalInput>,
    pub events: EventSink,
}

impl<C: PeerConnector> SessionTask<C> {
    pub async fn run(self) {
        let events = self.events.clone();
        if let Err(e) = self.drive().await {
            debug!("Session task with {} failed: {}", events.peer, e);
            events.emit(TaskEventKind::Failed(e));
        }
    }

    async fn drive(mut self) -> Result<()> {
        let connection = self.connector.create().await?;
        let opened = tokio::time::timeout(self.handshake_timeout, self.negotiate(&connection)).await;
        let mut channel = match opened {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                connection.close();
                return Err(e);
            }
            Err(_) => {
                connection.close();
                return Err(Error::HandshakeFailure("timed out opening direct channel".to_string()));
            }
        };
        self.events.emit(TaskEventKind::ChannelOpen);

        let result = self.transfer(&mut channel).await;
        channel.close().await;
        connection.close();
        result
    }

    async fn negotiate(&mut self, connection: &C::Connection) -> Result<<C::Connection as PeerConnection>::Channel> {
        match self.work {
            Work::Send(_) => {
                let offer = connection.create_offer().await?;
                self.events.emit(TaskEventKind::Outgoing(Signal::Offer { description: offer }));
            }
            Work::Receive => {
                let offer = self.await_offer(connection).await?;
                let answer = connection.create_answer(offer).await?;
                self.events.emit(TaskEventKind::Outgoing(Signal::Answer { description: answer }));
            }
        }
        self.flush_candidates(connection);

        let open = connection.open_data_channel();
        tokio::pin!(open);
        loop {
            tokio::select! {
                channel = &mut open => return channel,
                input = self.signals.recv() => {
                    let input = input.ok_or(Error::ClientClosed)?;
                    self.apply(connection, input).await?;
                    self.flush_candidates(connection);
                }
            }
        }
    }

    /// Answerer: apply early candidates until the offer shows up.
    async fn await_offer(&mut self, connection: &C::Connection) -> Result<SessionDescription> {
        loop {
            match self.signals.recv().await.ok_or(Error::ClientClosed)? {
                SignalInput::Offer(offer) => return Ok(offer),
                SignalInput::Candidate(candidate) => {
                    connection.add_remote_candidate(candidate).await?;
                }
                SignalInput::Answer(_) => warn!("Answerer ignoring unexpected answer"),
            }
        }
    }

    async fn apply(&self, connection: &C::Connection, input: SignalInput) -> Result<()> {
        match (input, &self.work) {
            (SignalInput::Answer(answer), Work::Send(_)) => connection.apply_answer(answer).await,
            (SignalInput::Candidate(candidate), _) => connection.add_remote_candidate(candidate).await,
            (other, _) => {
                warn!("Ignoring out-of-place {:?}", other);
                Ok(())
            }
        }
    }

    fn flush_candidates(&self, connection: &C::Connection) {
        for candidate in connection.take_local_candidates() {
            self.events
                .emit(TaskEventKind::Outgoing(Signal::IceCandidate { candidate }));
        }
    }

    async fn transfer(&mut self, channel: &mut <C::Connection as PeerConnection>::Channel) -> Result<()> {
        let events = self.events.clone();
        match &self.work {
            Work::Send(payload) => {
                let mut source = payload.open().await?;
                send_file(&mut source, channel, self.file.size, self.chunk_size, |n| {
                    events.emit(TaskEventKind::Progress(n))
                })
                .await
                .map_err(into_transport)?;
            }
            Work::Receive => {
                // The final chunk is reported through `Received`, after the
                // checksum passed, so completion is never signalled early.
                let total = self.file.size;
                let mut seen = 0u64;
                let data = receive_file(channel, &self.file, |n| {
                    seen += n;
                    if seen < total {
                        events.emit(TaskEventKind::Progress(n));
                    }
                })
                .await
                .map_err(into_transport)?;
                events.emit(TaskEventKind::Received(data));
            }
        }
        Ok(())
    }
}

fn into_transport(error: Error) -> Error {
    match error {
        Error::TransportError(_) => error,
        other => Error::TransportError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryNetwork;
    use tokio::sync::mpsc::unbounded_channel;

    struct Harness {
        signals: UnboundedSender<SignalInput>,
        events: UnboundedReceiver<TaskEvent>,
    }

    fn spawn_task(network: &MemoryNetwork, work: Work, file: FileMeta) -> Harness {
        spawn_task_with_timeout(network, work, file, Duration::from_secs(5))
    }

    fn spawn_task_with_timeout(
        network: &MemoryNetwork,
        work: Work,
        file: FileMeta,
        handshake_timeout: Duration,
    ) -> Harness {
        let (signal_tx, signal_rx) = unbounded_channel();
        let (event_tx, event_rx) = unbounded_channel();
        let task = SessionTask {
            connector: Arc::new(network.clone()),
            file,
            work,
            chunk_size: 1000,
            handshake_timeout,
            signals: signal_rx,
            events: EventSink::new(ConnectionId::new(), 1, event_tx),
        };
        tokio::spawn(task.run());
        Harness {
            signals: signal_tx,
            events: event_rx,
        }
    }

    /// Shuttle outgoing signals between two tasks until both finish.
    async fn pump(sender: &mut Harness, receiver: &mut Harness) -> (Vec<TaskEventKind>, Vec<TaskEventKind>) {
        let mut sender_log = Vec::new();
        let mut receiver_log = Vec::new();
        let mut done = (false, false);
        while !(done.0 && done.1) {
            tokio::select! {
                Some(ev) = sender.events.recv(), if !done.0 => {
                    if let TaskEventKind::Outgoing(signal) = &ev.kind {
                        let _ = receiver.signals.send(to_input(signal.clone()));
                    }
                    done.0 = matches!(ev.kind, TaskEventKind::Failed(_))
                        || sender_progress_done(&sender_log, &ev.kind, 2500);
                    sender_log.push(ev.kind);
                }
                Some(ev) = receiver.events.recv(), if !done.1 => {
                    if let TaskEventKind::Outgoing(signal) = &ev.kind {
                        let _ = sender.signals.send(to_input(signal.clone()));
                    }
                    done.1 = matches!(ev.kind, TaskEventKind::Received(_) | TaskEventKind::Failed(_));
                    receiver_log.push(ev.kind);
                }
            }
        }
        (sender_log, receiver_log)
    }

    fn sender_progress_done(log: &[TaskEventKind], next: &TaskEventKind, total: u64) -> bool {
        let sum: u64 = log
            .iter()
            .chain(std::iter::once(next))
            .filter_map(|k| match k {
                TaskEventKind::Progress(n) => Some(*n),
                _ => None,
            })
            .sum();
        sum == total
    }

    fn to_input(signal: Signal) -> SignalInput {
        match signal {
            Signal::Offer { description } => SignalInput::Offer(description),
            Signal::Answer { description } => SignalInput::Answer(description),
            Signal::IceCandidate { candidate } => SignalInput::Candidate(candidate),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offerer_and_answerer_complete_transfer() {
        let network = MemoryNetwork::new();
        let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let file = FileMeta::new("x.bin", 2500);
        let mut sender = spawn_task(&network, Work::Send(Payload::Memory(data.clone())), file.clone());
        let mut receiver = spawn_task(&network, Work::Receive, file);

        let (sender_log, receiver_log) = pump(&mut sender, &mut receiver).await;

        assert!(matches!(sender_log[0], TaskEventKind::Outgoing(Signal::Offer { .. })));
        assert!(sender_log.iter().any(|k| matches!(k, TaskEventKind::ChannelOpen)));
        assert!(receiver_log
            .iter()
            .any(|k| matches!(k, TaskEventKind::Outgoing(Signal::Answer { .. }))));
        match receiver_log.last() {
            Some(TaskEventKind::Received(got)) => assert_eq!(got, &data),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(network.channels_opened(), 2);
    }

    #[tokio::test]
    async fn test_channel_open_failure_is_handshake_failure() {
        let network = MemoryNetwork::new();
        network.fail_open(true);
        let file = FileMeta::new("x.bin", 10);
        let mut sender = spawn_task(&network, Work::Send(Payload::Memory(vec![0; 10])), file.clone());
        let mut receiver = spawn_task(&network, Work::Receive, file);

        let (sender_log, receiver_log) = pump(&mut sender, &mut receiver).await;
        assert!(matches!(
            sender_log.last(),
            Some(TaskEventKind::Failed(Error::HandshakeFailure(_)))
        ));
        assert!(matches!(
            receiver_log.last(),
            Some(TaskEventKind::Failed(Error::HandshakeFailure(_)))
        ));
    }

    #[tokio::test]
    async fn test_mid_transfer_break_is_transport_error() {
        let network = MemoryNetwork::new();
        network.fail_after_bytes(1500);
        let file = FileMeta::new("x.bin", 2500);
        let mut sender = spawn_task(&network, Work::Send(Payload::Memory(vec![1; 2500])), file.clone());
        let mut receiver = spawn_task(&network, Work::Receive, file);

        let (sender_log, receiver_log) = pump(&mut sender, &mut receiver).await;
        assert!(matches!(
            sender_log.last(),
            Some(TaskEventKind::Failed(Error::TransportError(_)))
        ));
        assert!(matches!(
            receiver_log.last(),
            Some(TaskEventKind::Failed(Error::TransportError(_)))
        ));
        assert!(!receiver_log.iter().any(|k| matches!(k, TaskEventKind::Received(_))));
    }

    #[tokio::test]
    async fn test_dropped_signal_input_aborts_answerer() {
        let network = MemoryNetwork::new();
        let Harness { signals, mut events } =
            spawn_task(&network, Work::Receive, FileMeta::new("x.bin", 10));
        drop(signals);
        let ev = events.recv().await.unwrap();
        assert!(matches!(ev.kind, TaskEventKind::Failed(Error::ClientClosed)));
    }

    #[tokio::test]
    async fn test_answerer_without_offer_times_out() {
        let network = MemoryNetwork::new();
        let mut harness = spawn_task_with_timeout(
            &network,
            Work::Receive,
            FileMeta::new("x.bin", 10),
            Duration::from_millis(50),
        );
        let ev = tokio::time::timeout(Duration::from_secs(5), harness.events.recv())
            .await
            .expect("task did not give up")
            .unwrap();
        // the signal sender is still held, so this is not a shutdown
        assert!(matches!(ev.kind, TaskEventKind::Failed(Error::HandshakeFailure(_))));
    }

    #[tokio::test]
    async fn test_offerer_without_answer_times_out() {
        let network = MemoryNetwork::new();
        let mut harness = spawn_task_with_timeout(
            &network,
            Work::Send(Payload::Memory(vec![0; 10])),
            FileMeta::new("x.bin", 10),
            Duration::from_millis(50),
        );
        let mut kinds = Vec::new();
        while let Some(ev) = tokio::time::timeout(Duration::from_secs(5), harness.events.recv())
            .await
            .expect("task did not give up")
        {
            let failed = matches!(ev.kind, TaskEventKind::Failed(_));
            kinds.push(ev.kind);
            if failed {
                break;
            }
        }
        assert!(matches!(kinds[0], TaskEventKind::Outgoing(Signal::Offer { .. })));
        assert!(matches!(
            kinds.last(),
            Some(TaskEventKind::Failed(Error::HandshakeFailure(_)))
        ));
        assert!(!kinds.iter().any(|k| matches!(k, TaskEventKind::ChannelOpen)));
    }
}
