//! Direct-channel primitives consumed by the endpoint.
//!
//! Implemented by [`tcp::TcpConnector`] (real sockets) and
//! [`memory::MemoryNetwork`] (in-process, for tests and demos). Connection
//! methods take `&self` so remote candidates can be applied while a channel
//! open is still pending.

pub mod memory;
pub mod tcp;

use std::future::Future;

use crate::error::Result;
use crate::messages::{IceCandidate, SessionDescription};

/// Creates one peer connection per transfer session.
pub trait PeerConnector: Send + Sync + 'static {
    type Connection: PeerConnection;

    fn create(&self) -> impl Future<Output = Result<Self::Connection>> + Send;
}

pub trait PeerConnection: Send + Sync + 'static {
    type Channel: DataChannel;

    /// Offerer side: prepare the data channel and describe local parameters.
    fn create_offer(&self) -> impl Future<Output = Result<SessionDescription>> + Send;

    /// Answerer side: apply the remote offer and describe local parameters.
    fn create_answer(
        &self,
        offer: SessionDescription,
    ) -> impl Future<Output = Result<SessionDescription>> + Send;

    /// Offerer side: apply the remote answer.
    fn apply_answer(&self, answer: SessionDescription) -> impl Future<Output = Result<()>> + Send;

    fn add_remote_candidate(&self, candidate: IceCandidate) -> impl Future<Output = Result<()>> + Send;

    /// Candidates gathered since the last call.
    fn take_local_candidates(&self) -> Vec<IceCandidate>;

    /// Resolves once the data channel is open.
    fn open_data_channel(&self) -> impl Future<Output = Result<Self::Channel>> + Send;

    fn close(&self);
}

/// Ordered, reliable, message-oriented channel for file bytes.
pub trait DataChannel: Send + 'static {
    /// Resolves once the channel has accepted the chunk locally.
    fn send(&mut self, chunk: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// `Ok(None)` once the remote side closed the channel.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
