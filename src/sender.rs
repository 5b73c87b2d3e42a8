use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use indicatif::ProgressBar;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::error::TransferError;
use crate::identity::FileMetaData;
use crate::protocol::{read_ack, ChunkHeader};

#[derive(Debug, Default)]
pub struct SendReport {
    pub sent: Vec<u64>,
    pub failed: Vec<(u64, TransferError)>,
    /// Tasks that died without reporting; their chunks stay missing server-side.
    pub aborted: usize,
    pub bytes_sent: u64,
}

impl SendReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.aborted == 0
    }
}

/// Client side of the data plane: one fresh connection per chunk, with at
/// most `max_in_flight` chunks open at once.
#[derive(Clone)]
pub struct ChunkSender {
    data_address: String,
    buffer_size: usize,
    max_in_flight: usize,
    io_timeout: Duration,
    progress: Option<ProgressBar>,
}

impl ChunkSender {
    pub fn new(data_address: impl Into<String>, buffer_size: usize, max_in_flight: usize, io_timeout: Duration) -> Self {
        Self {
            data_address: data_address.into(),
            buffer_size: buffer_size.max(1),
            max_in_flight: max_in_flight.max(1),
            io_timeout,
            progress: None,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            config.data_address(),
            config.buffer_size as usize,
            config.parallel_streams,
            config.timeout(),
        )
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Sends every listed chunk on its own task. A failing chunk never aborts
    /// its siblings; it is reported and left for the next registration round.
    pub async fn send_all(&self, source: &Path, meta: &FileMetaData, missing: &[u64]) -> SendReport {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let source: Arc<PathBuf> = Arc::new(source.to_path_buf());
        let meta = Arc::new(meta.clone());
        let mut report = SendReport::default();
        let mut tasks = JoinSet::new();

        for &idx in missing {
            if idx >= meta.chunk_count {
                report.failed.push((
                    idx,
                    TransferError::Validation(format!("chunk index {} out of range ({} chunks)", idx, meta.chunk_count)),
                ));
                continue;
            }

            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    report.failed.push((idx, TransferError::ProtocolError("send limiter closed".to_string())));
                    continue;
                }
            };

            let sender = self.clone();
            let source = source.clone();
            let meta = meta.clone();
            tasks.spawn(async move {
                let _permit = permit;
                (idx, sender.send_one(&source, &meta, idx).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Ok(bytes))) => {
                    report.sent.push(idx);
                    report.bytes_sent += bytes;
                }
                Ok((idx, Err(e))) => {
                    warn!("Failed to send chunk {} of {}: {}", idx, meta.content_hash, e);
                    report.failed.push((idx, e));
                }
                Err(e) => {
                    error!("Chunk send task failed: {}", e);
                    report.aborted += 1;
                }
            }
        }

        report.sent.sort_unstable();
        report.failed.sort_by_key(|(idx, _)| *idx);
        report
    }

    /// Streams one chunk over a fresh connection, reading the source through
    /// its own file handle.
    pub async fn send_one(&self, source: &Path, meta: &FileMetaData, idx: u64) -> Result<u64, TransferError> {
        let range = meta.chunk_range(idx);
        let chunk_len = range.end - range.start;

        let mut stream = timeout(self.io_timeout, TcpStream::connect(&self.data_address)).await??;
        stream.set_nodelay(true)?;

        timeout(
            self.io_timeout,
            ChunkHeader::new(meta.content_hash.as_str(), idx).write_to_stream(&mut stream),
        )
        .await??;

        let mut file = File::open(source).await?;
        file.seek(SeekFrom::Start(range.start)).await?;
        let mut reader = file.take(chunk_len);

        let mut buffer = BytesMut::with_capacity(self.buffer_size);
        let mut sent = 0u64;
        loop {
            buffer.clear();
            let n = reader.read_buf(&mut buffer).await?;
            if n == 0 {
                break;
            }
            timeout(self.io_timeout, stream.write_all(&buffer)).await??;
            sent += n as u64;
            if let Some(progress) = &self.progress {
                progress.inc(n as u64);
            }
        }

        if sent != chunk_len {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended after {} of {} bytes of chunk {}", sent, chunk_len, idx),
            )));
        }

        timeout(self.io_timeout, stream.shutdown()).await??;

        if !timeout(self.io_timeout, read_ack(&mut stream)).await?? {
            return Err(TransferError::ProtocolError(format!(
                "chunk {} of {} was not acknowledged",
                idx, meta.content_hash
            )));
        }

        debug!("Sent chunk {} ({} bytes) of {}", idx, sent, meta.content_hash);
        Ok(sent)
    }
}
