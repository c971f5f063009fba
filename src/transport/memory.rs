//! In-process transport for tests and demos.
//!
//! A [`MemoryNetwork`] pairs offerers and answerers through a token carried
//! in the offer. Channels are bounded queues of one chunk, so `send` only
//! resolves after the previous chunk was taken off the queue. Faults can be
//! injected per network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::{DataChannel, PeerConnection, PeerConnector};
use crate::error::{Error, Result};
use crate::messages::{IceCandidate, SessionDescription};

#[derive(Default)]
struct NetworkInner {
    /// Offer token -> where to deliver the offerer's end of the channel.
    waiting: Mutex<HashMap<String, oneshot::Sender<MemoryDataChannel>>>,
    fail_open: AtomicBool,
    stall_open: AtomicBool,
    /// Sends fail once this many bytes were accepted on a channel. 0 = never.
    fail_after_bytes: AtomicU64,
    channels_opened: AtomicUsize,
    candidates_applied: AtomicUsize,
}

/// Shared in-process "network". Cloning shares the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent channel open fail with a handshake failure.
    pub fn fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Channels opened while this is set never open.
    pub fn stall_open(&self, stall: bool) {
        self.inner.stall_open.store(stall, Ordering::SeqCst);
    }

    /// Break each channel's send path after `bytes` bytes have been accepted.
    pub fn fail_after_bytes(&self, bytes: u64) {
        self.inner.fail_after_bytes.store(bytes, Ordering::SeqCst);
    }

    pub fn channels_opened(&self) -> usize {
        self.inner.channels_opened.load(Ordering::SeqCst)
    }

    pub fn candidates_applied(&self) -> usize {
        self.inner.candidates_applied.load(Ordering::SeqCst)
    }
}

impl PeerConnector for MemoryNetwork {
    type Connection = MemoryPeerConnection;

    async fn create(&self) -> Result<MemoryPeerConnection> {
        Ok(MemoryPeerConnection {
            network: self.clone(),
            pending: tokio::sync::Mutex::new(None),
            local_candidates: Mutex::new(Vec::new()),
        })
    }
}

enum Pending {
    /// Offerer waiting for the answerer to hand over its end.
    Offered(oneshot::Receiver<MemoryDataChannel>),
    /// Answerer holding its end until the channel is opened.
    Answered(MemoryDataChannel),
}

pub struct MemoryPeerConnection {
    network: MemoryNetwork,
    pending: tokio::sync::Mutex<Option<Pending>>,
    local_candidates: Mutex<Vec<IceCandidate>>,
}

impl MemoryPeerConnection {
    fn gather_candidate(&self, token: &str) {
        if let Ok(mut candidates) = self.local_candidates.lock() {
            candidates.push(IceCandidate(format!("memory:{}", token)));
        }
    }
}

impl PeerConnection for MemoryPeerConnection {
    type Channel = MemoryDataChannel;

    async fn create_offer(&self) -> Result<SessionDescription> {
        let token = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.network
            .inner
            .waiting
            .lock()
            .map_err(|e| Error::HandshakeFailure(e.to_string()))?
            .insert(token.clone(), tx);
        *self.pending.lock().await = Some(Pending::Offered(rx));
        self.gather_candidate(&token);
        Ok(SessionDescription(token))
    }

    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let waiter = self
            .network
            .inner
            .waiting
            .lock()
            .map_err(|e| Error::HandshakeFailure(e.to_string()))?
            .remove(&offer.0)
            .ok_or_else(|| Error::HandshakeFailure(format!("unknown offer {}", offer.0)))?;

        let fail_after = self.network.inner.fail_after_bytes.load(Ordering::SeqCst);
        let (ours, theirs) = MemoryDataChannel::pair(fail_after);
        waiter
            .send(theirs)
            .map_err(|_| Error::HandshakeFailure("offerer went away".to_string()))?;
        *self.pending.lock().await = Some(Pending::Answered(ours));
        self.gather_candidate(&offer.0);
        Ok(SessionDescription(format!("answer:{}", offer.0)))
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        if answer.0.starts_with("answer:") {
            Ok(())
        } else {
            Err(Error::HandshakeFailure(format!("bad answer {}", answer.0)))
        }
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !candidate.0.starts_with("memory:") {
            return Err(Error::HandshakeFailure(format!("bad candidate {}", candidate.0)));
        }
        self.network.inner.candidates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn take_local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates
            .lock()
            .map(|mut candidates| std::mem::take(&mut *candidates))
            .unwrap_or_default()
    }

    async fn open_data_channel(&self) -> Result<MemoryDataChannel> {
        if self.network.inner.fail_open.load(Ordering::SeqCst) {
            return Err(Error::HandshakeFailure("channel refused to open".to_string()));
        }
        if self.network.inner.stall_open.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let pending = self.pending.lock().await.take();
        let channel = match pending {
            Some(Pending::Offered(rx)) => rx
                .await
                .map_err(|_| Error::HandshakeFailure("answerer went away".to_string()))?,
            Some(Pending::Answered(channel)) => channel,
            None => return Err(Error::HandshakeFailure("no offer or answer yet".to_string())),
        };
        self.network.inner.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }

    fn close(&self) {
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.take();
        }
    }
}

pub struct MemoryDataChannel {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
    accepted: u64,
    fail_after: u64,
}

impl MemoryDataChannel {
    /// Two connected ends.
    pub fn pair(fail_after: u64) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(1);
        let (b_tx, b_rx) = mpsc::channel(1);
        (
            MemoryDataChannel {
                tx: Some(a_tx),
                rx: b_rx,
                accepted: 0,
                fail_after,
            },
            MemoryDataChannel {
                tx: Some(b_tx),
                rx: a_rx,
                accepted: 0,
                fail_after,
            },
        )
    }
}

impl DataChannel for MemoryDataChannel {
    async fn send(&mut self, chunk: Vec<u8>) -> Result<()> {
        let len = chunk.len() as u64;
        if self.fail_after > 0 && self.accepted + len > self.fail_after {
            // Simulate a broken link: the remote sees the channel close.
            self.tx = None;
            return Err(Error::TransportError("injected channel failure".to_string()));
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::TransportError("channel closed".to_string()))?;
        tx.send(chunk)
            .await
            .map_err(|_| Error::TransportError("remote closed the channel".to_string()))?;
        self.accepted += len;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
