use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::coordinator::{FinalizeOutcome, TransferCoordinator};
use crate::error::TransferError;
use crate::protocol::{write_ack, ChunkHeader};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What one chunk connection accomplished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub content_hash: String,
    pub idx: u64,
    pub bytes: u64,
    pub remaining: u64,
    /// Set when this receipt emptied the missing set and a merge was attempted.
    pub finalize: Option<FinalizeOutcome>,
}

impl ChunkReceipt {
    fn already_completed(content_hash: String, idx: u64) -> Self {
        Self {
            content_hash,
            idx,
            bytes: 0,
            remaining: 0,
            finalize: Some(FinalizeOutcome::AlreadyCompleted),
        }
    }
}

/// Server side of the data plane: one connection per chunk.
pub struct ChunkReceiver {
    coordinator: TransferCoordinator,
    read_timeout: Duration,
    max_connections: usize,
}

impl ChunkReceiver {
    pub fn new(coordinator: TransferCoordinator, read_timeout: Duration, max_connections: usize) -> Self {
        Self {
            coordinator,
            read_timeout,
            max_connections: max_connections.max(1),
        }
    }

    pub fn from_config(coordinator: TransferCoordinator, config: &ServerConfig) -> Self {
        Self::new(coordinator, config.read_timeout(), config.max_connections)
    }

    /// Accepts chunk connections until the listener fails irrecoverably.
    /// Each connection is handled on its own task; a failing connection is
    /// logged and never takes the loop down.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<(), TransferError> {
        let permits = Arc::new(Semaphore::new(self.max_connections));
        info!("Chunk receiver listening on {}", listener.local_addr()?);

        loop {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| TransferError::ProtocolError("connection limiter closed".to_string()))?;

            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept chunk connection: {}", e);
                    sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            debug!("Accepted chunk connection from: {}", peer_addr);

            let receiver = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match receiver.handle(stream).await {
                    Ok(receipt) => debug!(
                        "Chunk {} of {} from {} stored ({} bytes, {} remaining)",
                        receipt.idx, receipt.content_hash, peer_addr, receipt.bytes, receipt.remaining
                    ),
                    Err(e) => warn!("Chunk connection from {} failed: {}", peer_addr, e),
                }
            });
        }
    }

    /// Parses the header, persists the chunk, records it and, when this
    /// receipt leaves nothing missing, tries to finalize the session.
    #[instrument(skip(self, stream))]
    pub async fn handle<S>(&self, mut stream: S) -> Result<ChunkReceipt, TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let header = timeout(self.read_timeout, ChunkHeader::read_from_stream(&mut stream))
            .await??
            .ok_or_else(|| TransferError::ProtocolError("connection closed before chunk header".to_string()))?;
        let content_hash = header.content_hash;
        let idx = header.idx;

        let meta = self.coordinator.require_metadata(&content_hash).await?;
        if idx >= meta.chunk_count {
            return Err(TransferError::Validation(format!(
                "chunk index {} out of range for {} ({} chunks)",
                idx, content_hash, meta.chunk_count
            )));
        }
        if meta.is_completed {
            debug!("Ignoring chunk {} of completed session {}", idx, content_hash);
            self.acknowledge(&mut stream).await;
            return Ok(ChunkReceipt::already_completed(content_hash, idx));
        }

        let bytes = self
            .coordinator
            .chunk_store()
            .write_chunk(&content_hash, idx, meta.chunk_len(idx), &mut stream, self.read_timeout)
            .await?;

        // The session may have been merged while this chunk was in flight.
        if self.coordinator.require_metadata(&content_hash).await?.is_completed {
            debug!("Session {} completed while chunk {} was written", content_hash, idx);
            self.acknowledge(&mut stream).await;
            return Ok(ChunkReceipt::already_completed(content_hash, idx));
        }

        let remaining = self.coordinator.mark_received(&content_hash, idx).await?;
        // The sender may move on once acked; the merge may take a while.
        self.acknowledge(&mut stream).await;
        drop(stream);

        let finalize = if remaining == 0 {
            match self.coordinator.finalize(&content_hash).await {
                Ok(outcome) => {
                    if let FinalizeOutcome::Merged(path) = &outcome {
                        info!("Transfer {} completed: {}", content_hash, path.display());
                    }
                    Some(outcome)
                }
                Err(e) => {
                    error!("Merge of {} failed: {}", content_hash, e);
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(ChunkReceipt {
            content_hash,
            idx,
            bytes,
            remaining,
            finalize,
        })
    }

    async fn acknowledge<S>(&self, stream: &mut S)
    where
        S: AsyncWrite + Unpin,
    {
        match timeout(self.read_timeout, write_ack(stream)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to acknowledge chunk: {}", e),
            Err(_) => debug!("Timed out acknowledging chunk"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::ChunkStore;
    use crate::coordinator::{SessionSettings, SessionState};
    use crate::identity::{digest_hex, FileMetaData};
    use crate::protocol::CHUNK_ACK;
    use crate::store::MemoryStore;
    use tempfile::{tempdir, TempDir};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn receiver(temp_dir: &TempDir) -> (ChunkReceiver, TransferCoordinator) {
        let coordinator = TransferCoordinator::new(
            Arc::new(MemoryStore::new()),
            ChunkStore::new(temp_dir.path()),
            SessionSettings::default(),
        );
        let receiver = ChunkReceiver::new(coordinator.clone(), Duration::from_secs(5), 8);
        (receiver, coordinator)
    }

    async fn deliver(receiver: &ChunkReceiver, hash: &str, idx: u64, payload: &[u8]) -> Result<ChunkReceipt, TransferError> {
        let (mut client, server) = duplex(payload.len() + 1024);
        ChunkHeader::new(hash, idx).write_to_stream(&mut client).await.unwrap();
        client.write_all(payload).await.unwrap();
        drop(client);
        receiver.handle(server).await
    }

    /// Sends one chunk with the write side half-closed and returns what the
    /// receiver wrote back before closing.
    async fn exchange(receiver: &ChunkReceiver, hash: &str, idx: u64, payload: &[u8]) -> (Result<ChunkReceipt, TransferError>, Vec<u8>) {
        let (mut client, server) = duplex(payload.len() + 1024);
        ChunkHeader::new(hash, idx).write_to_stream(&mut client).await.unwrap();
        client.write_all(payload).await.unwrap();
        client.shutdown().await.unwrap();
        let result = receiver.handle(server).await;
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        (result, reply)
    }

    #[tokio::test]
    async fn test_receive_until_merged() {
        let temp_dir = tempdir().unwrap();
        let (receiver, coordinator) = receiver(&temp_dir);
        let data = b"abcdefghij".to_vec();
        let meta = FileMetaData::new("letters.txt".to_string(), digest_hex(&data), 10, 4);
        coordinator.register(meta.clone()).await.unwrap();

        let receipt = deliver(&receiver, &meta.content_hash, 2, b"ij").await.unwrap();
        assert_eq!((receipt.bytes, receipt.remaining, receipt.finalize), (2, 2, None));

        deliver(&receiver, &meta.content_hash, 0, b"abcd").await.unwrap();
        let last = deliver(&receiver, &meta.content_hash, 1, b"efgh").await.unwrap();

        assert_eq!(last.remaining, 0);
        let Some(FinalizeOutcome::Merged(path)) = last.finalize else {
            panic!("expected the last receipt to merge, got {:?}", last.finalize);
        };
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert_eq!(coordinator.state(&meta.content_hash).await.unwrap(), SessionState::Completed);

        let late = deliver(&receiver, &meta.content_hash, 1, b"efgh").await.unwrap();
        assert_eq!(late.finalize, Some(FinalizeOutcome::AlreadyCompleted));
    }

    #[tokio::test]
    async fn test_payload_beyond_boundary_is_ignored() {
        let temp_dir = tempdir().unwrap();
        let (receiver, coordinator) = receiver(&temp_dir);
        let meta = FileMetaData::new("x".to_string(), "aa".to_string(), 10, 4);
        coordinator.register(meta.clone()).await.unwrap();

        let receipt = deliver(&receiver, "aa", 0, b"abcdEXTRA").await.unwrap();

        assert_eq!(receipt.bytes, 4);
        assert_eq!(std::fs::read(coordinator.chunk_store().chunk_path("aa", 0)).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let temp_dir = tempdir().unwrap();
        let (receiver, _coordinator) = receiver(&temp_dir);

        let result = deliver(&receiver, "beef", 0, b"data").await;
        assert!(matches!(result, Err(TransferError::UnknownSession(_))));
    }

    #[tokio::test]
    async fn test_out_of_range_index_rejected() {
        let temp_dir = tempdir().unwrap();
        let (receiver, coordinator) = receiver(&temp_dir);
        coordinator
            .register(FileMetaData::new("x".to_string(), "aa".to_string(), 10, 4))
            .await
            .unwrap();

        let result = deliver(&receiver, "aa", 3, b"").await;
        assert!(matches!(result, Err(TransferError::Validation(_))));
    }

    #[tokio::test]
    async fn test_truncated_chunk_stays_missing() {
        let temp_dir = tempdir().unwrap();
        let (receiver, coordinator) = receiver(&temp_dir);
        let meta = FileMetaData::new("x".to_string(), "aa".to_string(), 10, 4);
        coordinator.register(meta.clone()).await.unwrap();

        let result = deliver(&receiver, "aa", 1, b"ef").await;

        assert!(matches!(result, Err(TransferError::Io(_))));
        assert_eq!(coordinator.register(meta).await.unwrap().unreceived, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_missing_header_is_protocol_error() {
        let temp_dir = tempdir().unwrap();
        let (receiver, _coordinator) = receiver(&temp_dir);
        let (client, server) = duplex(64);
        drop(client);

        let result = receiver.handle(server).await;
        assert!(matches!(result, Err(TransferError::ProtocolError(_))));
    }

    #[tokio::test]
    async fn test_recorded_chunk_is_acknowledged() {
        let temp_dir = tempdir().unwrap();
        let (receiver, coordinator) = receiver(&temp_dir);
        let meta = FileMetaData::new("x".to_string(), "aa".to_string(), 10, 4);
        coordinator.register(meta).await.unwrap();

        let (result, reply) = exchange(&receiver, "aa", 0, b"abcd").await;

        assert_eq!(result.unwrap().remaining, 2);
        assert_eq!(reply, vec![CHUNK_ACK]);
    }

    #[tokio::test]
    async fn test_rejected_chunk_is_not_acknowledged() {
        let temp_dir = tempdir().unwrap();
        let (receiver, coordinator) = receiver(&temp_dir);
        coordinator
            .register(FileMetaData::new("x".to_string(), "aa".to_string(), 10, 4))
            .await
            .unwrap();

        let (unknown, reply) = exchange(&receiver, "beef", 0, b"data").await;
        assert!(matches!(unknown, Err(TransferError::UnknownSession(_))));
        assert!(reply.is_empty());

        let (short, reply) = exchange(&receiver, "aa", 1, b"ef").await;
        assert!(matches!(short, Err(TransferError::Io(_))));
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_after_merge_is_acknowledged_without_blob() {
        let temp_dir = tempdir().unwrap();
        let (receiver, coordinator) = receiver(&temp_dir);
        let data = b"abcdefgh".to_vec();
        let meta = FileMetaData::new("two.txt".to_string(), digest_hex(&data), 8, 4);
        coordinator.register(meta.clone()).await.unwrap();
        deliver(&receiver, &meta.content_hash, 0, b"abcd").await.unwrap();
        deliver(&receiver, &meta.content_hash, 1, b"efgh").await.unwrap();

        let (late, reply) = exchange(&receiver, &meta.content_hash, 0, b"abcd").await;

        assert_eq!(late.unwrap().finalize, Some(FinalizeOutcome::AlreadyCompleted));
        assert_eq!(reply, vec![CHUNK_ACK]);
        assert!(!coordinator.chunk_store().chunk_dir(&meta.content_hash).exists());
    }
}
