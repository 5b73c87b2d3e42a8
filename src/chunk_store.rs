//! On-disk layout of received chunks.
//!
//! ```text
//! <root>/<contentHash>/.chunks/<idx>  one blob per received chunk
//! <root>/<contentHash>/.merging       merge in progress
//! <root>/<contentHash>/<name>         merged output
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::TransferError;
use crate::identity::{CHUNK_DIR_NAME, MERGE_FILE_NAME};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, content_hash: &str) -> PathBuf {
        self.root.join(content_hash)
    }

    pub fn chunk_dir(&self, content_hash: &str) -> PathBuf {
        self.session_dir(content_hash).join(CHUNK_DIR_NAME)
    }

    pub fn chunk_path(&self, content_hash: &str, idx: u64) -> PathBuf {
        self.chunk_dir(content_hash).join(idx.to_string())
    }

    pub fn output_path(&self, content_hash: &str, name: &str) -> PathBuf {
        self.session_dir(content_hash).join(name)
    }

    pub fn merge_path(&self, content_hash: &str) -> PathBuf {
        self.session_dir(content_hash).join(MERGE_FILE_NAME)
    }

    pub async fn create_session_dir(&self, content_hash: &str) -> Result<(), TransferError> {
        fs::create_dir_all(self.chunk_dir(content_hash)).await?;
        Ok(())
    }

    /// Copies exactly `expected_len` bytes from `reader` into the blob for
    /// `idx`. The blob only appears under its final name once it is complete
    /// and synced; a short or stalled stream leaves no blob behind.
    ///
    /// The chunk directory must already exist: it is created at registration
    /// and removed after a merge, so a late chunk fails instead of leaving an
    /// orphan blob.
    pub async fn write_chunk<R>(
        &self,
        content_hash: &str,
        idx: u64,
        expected_len: u64,
        reader: &mut R,
        idle_timeout: Duration,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let dir = self.chunk_dir(content_hash);

        // Unique part name so duplicate deliveries of one index never share a file.
        let part_path = dir.join(format!("{}.{}.part", idx, Uuid::new_v4().simple()));
        let result = copy_exact(reader, &part_path, expected_len, idle_timeout).await;

        match result {
            Ok(written) => {
                fs::rename(&part_path, self.chunk_path(content_hash, idx)).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&part_path).await;
                Err(e)
            }
        }
    }

    pub async fn open_chunk(&self, content_hash: &str, idx: u64) -> Result<File, TransferError> {
        Ok(File::open(self.chunk_path(content_hash, idx)).await?)
    }

    /// Indices of durably written blobs, ascending.
    pub async fn list_chunks(&self, content_hash: &str) -> Result<Vec<u64>, TransferError> {
        let mut entries = match fs::read_dir(self.chunk_dir(content_hash)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(idx) = entry.file_name().to_str().and_then(|name| name.parse::<u64>().ok()) {
                indices.push(idx);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    pub async fn remove_chunks(&self, content_hash: &str) -> Result<(), TransferError> {
        match fs::remove_dir_all(self.chunk_dir(content_hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn copy_exact<R>(
    reader: &mut R,
    path: &Path,
    expected_len: u64,
    idle_timeout: Duration,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(path).await?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;

    while written < expected_len {
        let want = (expected_len - written).min(buffer.len() as u64) as usize;
        let n = timeout(idle_timeout, reader.read(&mut buffer[..want])).await??;
        if n == 0 {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("chunk stream ended after {} of {} bytes", written, expected_len),
            )));
        }
        file.write_all(&buffer[..n]).await?;
        written += n as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}
