//! Content identity and chunk layout of a file transfer.
//!
//! A transfer is keyed by the SHA-256 digest of the full file content, so two
//! uploads of byte-identical files collapse onto the same session.

use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::TransferError;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Directory holding chunk blobs inside a session's namespace.
pub const CHUNK_DIR_NAME: &str = ".chunks";

/// Merge output before its digest is verified.
pub const MERGE_FILE_NAME: &str = ".merging";

/// Identity and layout of one logical file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetaData {
    pub name: String,
    pub content_hash: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    #[serde(default)]
    pub is_transmitted: bool,
    #[serde(default)]
    pub is_completed: bool,
}

impl FileMetaData {
    pub fn new(name: String, content_hash: String, file_size: u64, chunk_size: u64) -> Self {
        Self {
            name,
            content_hash,
            file_size,
            chunk_size,
            chunk_count: chunk_count(file_size, chunk_size),
            is_transmitted: false,
            is_completed: false,
        }
    }

    /// Byte range `[idx*chunkSize, min((idx+1)*chunkSize, fileSize))`.
    pub fn chunk_range(&self, idx: u64) -> Range<u64> {
        let start = idx.saturating_mul(self.chunk_size).min(self.file_size);
        let end = start.saturating_add(self.chunk_size).min(self.file_size);
        start..end
    }

    pub fn chunk_len(&self, idx: u64) -> u64 {
        let range = self.chunk_range(idx);
        range.end - range.start
    }

    /// Rejects metadata that would corrupt the session or escape the output
    /// directory.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::Validation("chunkSize must be positive".to_string()));
        }
        if self.content_hash.is_empty()
            || !self.content_hash.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(TransferError::Validation(format!(
                "contentHash must be a hex digest, got {:?}",
                self.content_hash
            )));
        }
        if !is_plain_file_name(&self.name) {
            return Err(TransferError::Validation(format!(
                "name must be a plain file name, got {:?}",
                self.name
            )));
        }
        let expected = chunk_count(self.file_size, self.chunk_size);
        if self.chunk_count != expected {
            return Err(TransferError::Validation(format!(
                "chunkCount {} does not match fileSize {} / chunkSize {} (expected {})",
                self.chunk_count, self.file_size, self.chunk_size, expected
            )));
        }
        Ok(())
    }
}

/// `ceil(file_size / chunk_size)`, with a zero-length file carried as one
/// empty chunk. Returns 0 for a zero chunk size.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size).max(1)
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != CHUNK_DIR_NAME
        && name != MERGE_FILE_NAME
        && !name.contains(['/', '\\', '\0'])
}

/// Streams the whole file once to compute its digest and layout.
pub async fn compute_metadata(
    path: &Path,
    chunk_size: u64,
    name: Option<String>,
) -> Result<FileMetaData, TransferError> {
    let mut file = File::open(path).await?;
    let file_size = file.metadata().await?.len();

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut hashed = 0u64;
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        hashed += n as u64;
    }

    if hashed != file_size {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} changed while hashing ({} of {} bytes)", path.display(), hashed, file_size),
        )));
    }

    let name = match name {
        Some(name) => name,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::FileNotFound(path.to_path_buf()))?,
    };

    Ok(FileMetaData::new(name, hex::encode(hasher.finalize()), file_size, chunk_size))
}

/// Hex SHA-256 of an in-memory buffer.
pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
