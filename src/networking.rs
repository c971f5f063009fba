use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::messages::{ClientMessage, ConnectionId, Peer, ServerMessage};
use crate::MAX_FRAME_SIZE;

/// Write one length-prefixed frame: a big-endian u32 byte count, then the bytes.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(Error::Frame(format!(
            "refusing to write {} byte frame",
            payload.len()
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(Error::Frame(format!("{} byte frame exceeds limit", len)));
    }
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await?;
    Ok(Some(buffer))
}

pub async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = serde_json::to_vec(message)?;
    write_frame(writer, &encoded).await
}

pub fn decode_message<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(frame)?)
}

/// Read frames until one decodes. Malformed frames are logged and skipped;
/// the length prefix keeps the stream aligned.
pub async fn receive_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let Some(frame) = read_frame(reader).await? else {
            return Ok(None);
        };
        match decode_message(&frame) {
            Ok(message) => return Ok(Some(message)),
            Err(e) => warn!("Dropping malformed frame ({} bytes): {}", frame.len(), e),
        }
    }
}

/// A joined relay connection, split for the client's reader and writer tasks.
pub struct RelayConnection {
    pub connection_id: ConnectionId,
    pub initial_peers: Vec<Peer>,
    pub read_half: OwnedReadHalf,
    pub write_half: OwnedWriteHalf,
}

/// Connect to the relay, join under `display_name` and wait for the welcome.
pub async fn establish_connection(relay_addr: &str, display_name: &str) -> Result<RelayConnection> {
    let stream = TcpStream::connect(relay_addr).await?;
    stream.set_nodelay(true)?;
    debug!("Connected to relay server at {}", relay_addr);
    let (mut read_half, mut write_half) = stream.into_split();

    send_message(
        &mut write_half,
        &ClientMessage::Join {
            display_name: display_name.to_string(),
        },
    )
    .await?;

    let mut connection_id = None;
    loop {
        let message: ServerMessage = receive_message(&mut read_half)
            .await?
            .ok_or_else(|| Error::Frame("relay closed connection during join".to_string()))?;
        match message {
            ServerMessage::Welcome { connection_id: id } => {
                debug!("Relay assigned connection id {}", id);
                connection_id = Some(id);
            }
            // The first peer list follows the welcome and always contains us.
            ServerMessage::PeerList { peers } => {
                if let Some(connection_id) = connection_id {
                    return Ok(RelayConnection {
                        connection_id,
                        initial_peers: peers,
                        read_half,
                        write_half,
                    });
                }
            }
            ServerMessage::Error { message } => return Err(Error::Rejected(message)),
            other => debug!("Ignoring {:?} before join completed", other),
        }
    }
}
