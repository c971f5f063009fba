//! Direct channel over plain TCP.
//!
//! The offerer listens and describes its reachable addresses; the answerer
//! dials each address it learns (from the offer, then from candidates) until
//! one connects. The dialer proves it is the negotiated peer by sending the
//! offer's token as its first frame.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use super::{DataChannel, PeerConnection, PeerConnector};
use crate::error::{Error, Result};
use crate::messages::{IceCandidate, SessionDescription};
use crate::networking::{read_frame, write_frame};

/// Addresses an offerer can be reached on.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAddresses {
    pub external_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    #[serde(default)]
    pub token: String,
}

impl PeerAddresses {
    fn encode(&self) -> Result<SessionDescription> {
        Ok(SessionDescription(serde_json::to_string(self)?))
    }

    fn decode(description: &SessionDescription) -> Result<Self> {
        serde_json::from_str(&description.0)
            .map_err(|e| Error::HandshakeFailure(format!("bad session description: {}", e)))
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub bind_ip: IpAddr,
    /// Address to advertise when the bind address is not what peers should dial.
    pub advertise_ip: Option<IpAddr>,
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        TcpConnector {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_ip: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl PeerConnector for TcpConnector {
    type Connection = TcpPeerConnection;

    async fn create(&self) -> Result<TcpPeerConnection> {
        let (remote_tx, remote_rx) = unbounded_channel();
        Ok(TcpPeerConnection {
            config: self.clone(),
            listener: Mutex::new(None),
            token: Mutex::new(String::new()),
            local_candidates: Mutex::new(Vec::new()),
            remote_tx,
            remote_rx: tokio::sync::Mutex::new(remote_rx),
        })
    }
}

pub struct TcpPeerConnection {
    config: TcpConnector,
    listener: Mutex<Option<TcpListener>>,
    token: Mutex<String>,
    local_candidates: Mutex<Vec<IceCandidate>>,
    remote_tx: UnboundedSender<SocketAddr>,
    remote_rx: tokio::sync::Mutex<UnboundedReceiver<SocketAddr>>,
}

fn handshake_error(e: impl std::fmt::Display) -> Error {
    Error::HandshakeFailure(e.to_string())
}

impl TcpPeerConnection {
    fn push_remote(&self, addr: SocketAddr) {
        // The receiver lives in self, so this cannot fail while we exist.
        let _ = self.remote_tx.send(addr);
    }

    async fn accept_peer(&self, listener: TcpListener) -> Result<TcpDataChannel> {
        let token = self.token.lock().map_err(handshake_error)?.clone();
        loop {
            let (stream, addr) = listener.accept().await.map_err(handshake_error)?;
            let (mut reader, writer) = stream.into_split();
            match read_frame(&mut reader).await {
                Ok(Some(presented)) if presented == token.as_bytes() => {
                    debug!("Direct channel accepted from {}", addr);
                    return Ok(TcpDataChannel::new(reader, writer));
                }
                _ => warn!("Dropping unauthenticated direct connection from {}", addr),
            }
        }
    }

    async fn dial_peer(&self) -> Result<TcpDataChannel> {
        let token = self.token.lock().map_err(handshake_error)?.clone();
        let mut remote = self.remote_rx.lock().await;
        loop {
            let addr = remote
                .recv()
                .await
                .ok_or_else(|| Error::HandshakeFailure("no reachable address".to_string()))?;
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    let (reader, mut writer) = stream.into_split();
                    write_frame(&mut writer, token.as_bytes()).await?;
                    debug!("Direct channel connected to {}", addr);
                    return Ok(TcpDataChannel::new(reader, writer));
                }
                Ok(Err(e)) => debug!("Direct connect to {} failed: {}", addr, e),
                Err(_) => debug!("Direct connect to {} timed out", addr),
            }
        }
    }
}

impl PeerConnection for TcpPeerConnection {
    type Channel = TcpDataChannel;

    async fn create_offer(&self) -> Result<SessionDescription> {
        let listener = TcpListener::bind((self.config.bind_ip, 0))
            .await
            .map_err(handshake_error)?;
        let port = listener.local_addr().map_err(handshake_error)?.port();
        let local_ip = if self.config.bind_ip.is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.config.bind_ip
        };
        let addresses = PeerAddresses {
            external_addr: self.config.advertise_ip.map(|ip| SocketAddr::new(ip, port)),
            local_addr: Some(SocketAddr::new(local_ip, port)),
            token: Uuid::new_v4().to_string(),
        };
        debug!("Listening for direct channel on port {}", port);

        *self.token.lock().map_err(handshake_error)? = addresses.token.clone();
        *self.listener.lock().map_err(handshake_error)? = Some(listener);
        if self.config.advertise_ip.is_some() && !self.config.bind_ip.is_unspecified() {
            // Reachable on the bind address as well; offer it as a fallback.
            self.local_candidates
                .lock()
                .map_err(handshake_error)?
                .push(IceCandidate(SocketAddr::new(self.config.bind_ip, port).to_string()));
        }
        addresses.encode()
    }

    async fn create_answer(&self, offer: SessionDescription) -> Result<SessionDescription> {
        let offered = PeerAddresses::decode(&offer)?;
        *self.token.lock().map_err(handshake_error)? = offered.token.clone();
        for addr in offered.external_addr.into_iter().chain(offered.local_addr) {
            self.push_remote(addr);
        }
        PeerAddresses::default().encode()
    }

    async fn apply_answer(&self, answer: SessionDescription) -> Result<()> {
        PeerAddresses::decode(&answer).map(|_| ())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let addr: SocketAddr = candidate
            .0
            .parse()
            .map_err(|e| Error::HandshakeFailure(format!("bad candidate {:?}: {}", candidate.0, e)))?;
        self.push_remote(addr);
        Ok(())
    }

    fn take_local_candidates(&self) -> Vec<IceCandidate> {
        self.local_candidates
            .lock()
            .map(|mut candidates| std::mem::take(&mut *candidates))
            .unwrap_or_default()
    }

    async fn open_data_channel(&self) -> Result<TcpDataChannel> {
        let listener = self.listener.lock().map_err(handshake_error)?.take();
        match listener {
            Some(listener) => self.accept_peer(listener).await,
            None => self.dial_peer().await,
        }
    }

    fn close(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            listener.take();
        }
    }
}

pub struct TcpDataChannel {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl TcpDataChannel {
    fn new(reader: OwnedReadHalf, writer: OwnedWriteHalf) -> Self {
        TcpDataChannel { reader, writer }
    }
}

impl DataChannel for TcpDataChannel {
    async fn send(&mut self, chunk: Vec<u8>) -> Result<()> {
        write_frame(&mut self.writer, &chunk)
            .await
            .map_err(|e| Error::TransportError(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        read_frame(&mut self.reader)
            .await
            .map_err(|e| Error::TransportError(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> TcpConnector {
        TcpConnector {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..TcpConnector::default()
        }
    }

    #[tokio::test]
    async fn test_offer_answer_opens_channel() {
        let connector = loopback();
        let offerer = connector.create().await.unwrap();
        let answerer = connector.create().await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        let answer = answerer.create_answer(offer).await.unwrap();
        offerer.apply_answer(answer).await.unwrap();

        let (a, b) = tokio::join!(offerer.open_data_channel(), answerer.open_data_channel());
        let (mut a, mut b) = (a.unwrap(), b.unwrap());

        a.send(b"hello".to_vec()).await.unwrap();
        a.send(vec![7u8; 70_000]).await.unwrap();
        a.close().await;
        assert_eq!(b.recv().await.unwrap().unwrap(), b"hello");
        assert_eq!(b.recv().await.unwrap().unwrap().len(), 70_000);
        assert!(b.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_candidates_are_dialed_after_bad_offer_address() {
        let connector = loopback();
        let offerer = connector.create().await.unwrap();
        let answerer = connector.create().await.unwrap();

        let offer = offerer.create_offer().await.unwrap();
        let mut addresses = PeerAddresses::decode(&offer).unwrap();
        let real = addresses.local_addr.take().unwrap();
        // nothing listens on port 1
        addresses.local_addr = Some(SocketAddr::new(real.ip(), 1));
        answerer.create_answer(addresses.encode().unwrap()).await.unwrap();
        answerer
            .add_remote_candidate(IceCandidate(real.to_string()))
            .await
            .unwrap();

        let (a, b) = tokio::join!(offerer.open_data_channel(), answerer.open_data_channel());
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_bad_descriptions_are_handshake_failures() {
        let connection = loopback().create().await.unwrap();
        let result = connection
            .create_answer(SessionDescription("not json".to_string()))
            .await;
        assert!(matches!(result, Err(Error::HandshakeFailure(_))));
        let result = connection
            .add_remote_candidate(IceCandidate("nowhere".to_string()))
            .await;
        assert!(matches!(result, Err(Error::HandshakeFailure(_))));
    }

    #[test]
    fn test_advertised_address_is_external() {
        let addresses = PeerAddresses {
            external_addr: Some("203.0.113.9:4000".parse().unwrap()),
            local_addr: Some("192.168.1.10:4000".parse().unwrap()),
            token: "t".to_string(),
        };
        let round = PeerAddresses::decode(&addresses.encode().unwrap()).unwrap();
        assert_eq!(round, addresses);
    }
}
