use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::messages::FileMeta;
use crate::transport::DataChannel;
use crate::CHUNK_SIZE;

/// A readable source of file bytes, opened only when the channel is ready.
pub type DataSource = Box<dyn AsyncRead + Send + Unpin>;

/// What an initiator is offering to send.
#[derive(Debug, Clone)]
pub enum Payload {
    File(PathBuf),
    Memory(Vec<u8>),
}

impl Payload {
    pub async fn open(&self) -> Result<DataSource> {
        match self {
            Payload::File(path) => Ok(Box::new(File::open(path).await?)),
            Payload::Memory(data) => Ok(Box::new(io::Cursor::new(data.clone()))),
        }
    }
}

/// Read up to `max` bytes, filling the buffer unless the source ends first.
///
/// Every chunk but the last is exactly `max` bytes. An empty vector means the
/// source is exhausted.
pub async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, max: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; max];
    let mut filled = 0;
    while filled < max {
        let n = source.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

/// Lowercase hex SHA-256.
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Build metadata for a file on disk, including its checksum.
pub async fn describe_file(path: &Path) -> Result<FileMeta> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidFile(format!("{} has no file name", path.display())))?
        .to_string();
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        return Err(Error::InvalidFile(format!("{} is not a regular file", path.display())));
    }

    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    loop {
        let chunk = read_chunk(&mut file, CHUNK_SIZE).await?;
        if chunk.is_empty() {
            break;
        }
        size += chunk.len() as u64;
        hasher.update(&chunk);
    }

    let meta = FileMeta::new(name, size).with_checksum(format!("{:x}", hasher.finalize()));
    meta.validate()?;
    Ok(meta)
}

/// Collects arriving chunks until the declared size is reached.
///
/// Position is the cumulative byte count; chunks carry no ids.
#[derive(Debug)]
pub struct Reassembler {
    expected: u64,
    received: u64,
    parts: Vec<Vec<u8>>,
}

impl Reassembler {
    pub fn new(expected: u64) -> Self {
        Reassembler {
            expected,
            received: 0,
            parts: Vec::new(),
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Append one chunk. Returns the whole artifact when the count reaches
    /// the expected size.
    pub fn push(&mut self, chunk: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let received = self.received + chunk.len() as u64;
        if received > self.expected {
            return Err(Error::TransportError(format!(
                "received {} bytes, declared size is {}",
                received, self.expected
            )));
        }
        self.received = received;
        if !chunk.is_empty() {
            self.parts.push(chunk);
        }
        if self.received == self.expected {
            return Ok(Some(std::mem::take(&mut self.parts).concat()));
        }
        Ok(None)
    }
}

/// Send path: stream `source` over `channel`, one chunk in flight at a time.
///
/// `on_progress` is called with each accepted chunk's length. Fails if the
/// source is shorter or longer than `total`.
pub async fn send_file<R, C, F>(
    source: &mut R,
    channel: &mut C,
    total: u64,
    chunk_size: usize,
    mut on_progress: F,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    C: DataChannel,
    F: FnMut(u64),
{
    let chunk_size = chunk_size.clamp(1, CHUNK_SIZE);
    let mut sent = 0u64;
    let mut chunk_count = 0u64;

    while sent < total {
        let chunk = read_chunk(source, chunk_size).await?;
        if chunk.is_empty() {
            return Err(Error::InvalidFile(format!(
                "source ended after {} of {} bytes",
                sent, total
            )));
        }
        let len = chunk.len() as u64;
        if sent + len > total {
            return Err(Error::InvalidFile(format!(
                "source is longer than declared {} bytes",
                total
            )));
        }
        channel.send(chunk).await?;
        sent += len;
        chunk_count += 1;
        on_progress(len);
    }

    debug!("Sent {} chunks, {} bytes", chunk_count, sent);
    Ok(sent)
}

/// Receive path: reassemble until `file.size` bytes arrived, then verify the
/// checksum if one was declared. Nothing is returned on failure.
pub async fn receive_file<C, F>(channel: &mut C, file: &FileMeta, mut on_progress: F) -> Result<Vec<u8>>
where
    C: DataChannel,
    F: FnMut(u64),
{
    let mut reassembler = Reassembler::new(file.size);
    loop {
        let Some(chunk) = channel.recv().await? else {
            return Err(Error::TransportError(format!(
                "channel closed after {} of {} bytes",
                reassembler.received(),
                file.size
            )));
        };
        let len = chunk.len() as u64;
        let done = reassembler.push(chunk)?;
        on_progress(len);
        if let Some(data) = done {
            if let Some(expected) = &file.checksum {
                if &checksum(&data) != expected {
                    return Err(Error::TransportError("checksum mismatch".to_string()));
                }
            }
            debug!("Reassembled {} ({} bytes)", file.name, data.len());
            return Ok(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryDataChannel;
    use std::io::Cursor;
    use std::io::Write;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    // ============================================================================
    // Chunk Reading Tests
    // ============================================================================

    #[tokio::test]
    async fn test_read_chunk_fills_to_max() {
        let mut cursor = Cursor::new(pattern(CHUNK_SIZE * 2 + 5));
        assert_eq!(read_chunk(&mut cursor, CHUNK_SIZE).await.unwrap().len(), CHUNK_SIZE);
        assert_eq!(read_chunk(&mut cursor, CHUNK_SIZE).await.unwrap().len(), CHUNK_SIZE);
        assert_eq!(read_chunk(&mut cursor, CHUNK_SIZE).await.unwrap().len(), 5);
        assert!(read_chunk(&mut cursor, CHUNK_SIZE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_chunk_handles_short_reads() {
        // a reader that yields 3 bytes at a time still produces full chunks
        let (mut writer, mut reader) = tokio::io::duplex(3);
        let data = pattern(20);
        let expected = data.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            writer.write_all(&data).await.unwrap();
        });
        let chunk = read_chunk(&mut reader, 16).await.unwrap();
        assert_eq!(chunk, expected[..16]);
    }

    // ============================================================================
    // Reassembly Tests
    // ============================================================================

    #[test]
    fn test_reassembler_completes_on_exact_count() {
        let mut r = Reassembler::new(10);
        assert!(r.push(vec![1; 4]).unwrap().is_none());
        assert!(r.push(Vec::new()).unwrap().is_none());
        let data = r.push(vec![2; 6]).unwrap().unwrap();
        assert_eq!(data.len(), 10);
        assert_eq!(&data[..4], &[1; 4]);
    }

    #[test]
    fn test_reassembler_rejects_overflow() {
        let mut r = Reassembler::new(5);
        r.push(vec![0; 3]).unwrap();
        assert!(matches!(r.push(vec![0; 3]), Err(Error::TransportError(_))));
        assert_eq!(r.received(), 3);
    }

    // ============================================================================
    // Driver Round Trip Tests
    // ============================================================================

    async fn round_trip(len: usize) -> Vec<u8> {
        let data = pattern(len);
        let meta = FileMeta::new("blob.bin", len as u64).with_checksum(checksum(&data));
        let (mut tx, mut rx) = MemoryDataChannel::pair(0);

        let source = data.clone();
        let sender = tokio::spawn(async move {
            let mut progress = Vec::new();
            let mut cursor = Cursor::new(source);
            let sent = send_file(&mut cursor, &mut tx, len as u64, CHUNK_SIZE, |n| progress.push(n))
                .await
                .unwrap();
            (sent, progress)
        });

        let mut received = 0;
        let out = receive_file(&mut rx, &meta, |n| received += n).await.unwrap();
        let (sent, progress) = sender.await.unwrap();

        assert_eq!(sent, len as u64);
        assert_eq!(received, len as u64);
        assert!(progress.iter().all(|n| *n as usize <= CHUNK_SIZE));
        assert_eq!(progress.len(), len.div_ceil(CHUNK_SIZE));
        assert_eq!(out, data);
        out
    }

    #[tokio::test]
    async fn test_round_trip_smaller_than_chunk() {
        round_trip(100).await;
    }

    #[tokio::test]
    async fn test_round_trip_exact_chunk_boundary() {
        round_trip(CHUNK_SIZE).await;
        round_trip(CHUNK_SIZE * 2).await;
    }

    #[tokio::test]
    async fn test_round_trip_many_chunks_short_tail() {
        round_trip(CHUNK_SIZE * 5 + 123).await;
    }

    #[tokio::test]
    async fn test_short_source_fails() {
        let (mut tx, _rx) = MemoryDataChannel::pair(0);
        let mut cursor = Cursor::new(vec![0u8; 10]);
        let result = send_file(&mut cursor, &mut tx, 20, CHUNK_SIZE, |_| {}).await;
        assert!(matches!(result, Err(Error::InvalidFile(_))));
    }

    #[tokio::test]
    async fn test_long_source_fails() {
        let (mut tx, _rx) = MemoryDataChannel::pair(0);
        let mut cursor = Cursor::new(vec![0u8; 30]);
        let result = send_file(&mut cursor, &mut tx, 20, CHUNK_SIZE, |_| {}).await;
        assert!(matches!(result, Err(Error::InvalidFile(_))));
    }

    #[tokio::test]
    async fn test_early_close_discards_partial() {
        let (mut tx, mut rx) = MemoryDataChannel::pair(0);
        let meta = FileMeta::new("a.bin", 10);
        tokio::spawn(async move {
            tx.send(vec![0; 4]).await.unwrap();
            tx.close().await;
        });
        let result = receive_file(&mut rx, &meta, |_| {}).await;
        assert!(matches!(result, Err(Error::TransportError(_))));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let (mut tx, mut rx) = MemoryDataChannel::pair(0);
        let meta = FileMeta::new("a.bin", 3).with_checksum(checksum(b"abc"));
        tokio::spawn(async move {
            tx.send(b"abd".to_vec()).await.unwrap();
        });
        let result = receive_file(&mut rx, &meta, |_| {}).await;
        assert!(matches!(result, Err(Error::TransportError(e)) if e == "checksum mismatch"));
    }

    // ============================================================================
    // File Description Tests
    // ============================================================================

    #[tokio::test]
    async fn test_describe_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();
        let meta = describe_file(file.path()).await.unwrap();
        assert_eq!(meta.size, 13);
        assert_eq!(meta.checksum.as_deref(), Some(checksum(b"Hello, World!").as_str()));
    }

    #[tokio::test]
    async fn test_describe_empty_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            describe_file(file.path()).await,
            Err(Error::InvalidFile(_))
        ));
    }

    #[tokio::test]
    async fn test_payload_opens_file_lazily() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&pattern(300)).unwrap();
        let payload = Payload::File(file.path().to_path_buf());
        let mut source = payload.open().await.unwrap();
        let chunk = read_chunk(&mut source, 1000).await.unwrap();
        assert_eq!(chunk, pattern(300));
    }
}
