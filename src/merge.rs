use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::chunk_store::ChunkStore;
use crate::coordinator::{load_metadata, save_metadata};
use crate::error::TransferError;
use crate::identity::FileMetaData;
use crate::store::SessionStore;

const MERGE_BUFFER_SIZE: usize = 256 * 1024;

/// Concatenates persisted chunks, in index order, into the final file.
#[derive(Clone)]
pub struct MergeEngine {
    store: Arc<dyn SessionStore>,
    chunks: ChunkStore,
    completed_ttl: Duration,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn SessionStore>, chunks: ChunkStore, completed_ttl: Duration) -> Self {
        Self {
            store,
            chunks,
            completed_ttl,
        }
    }

    /// Merges every chunk of `content_hash` into `<hash>/<output_name>` and
    /// records completion.
    ///
    /// The output is assembled as `<hash>/.merging` and renamed only after its
    /// digest matches `content_hash`, so rerunning a failed merge is safe.
    pub async fn merge(&self, content_hash: &str, output_name: &str) -> Result<PathBuf, TransferError> {
        let mut meta = load_metadata(self.store.as_ref(), content_hash)
            .await?
            .ok_or_else(|| TransferError::UnknownSession(content_hash.to_string()))?;

        let present = self.chunks.list_chunks(content_hash).await?;
        let absent: Vec<u64> = (0..meta.chunk_count)
            .filter(|idx| present.binary_search(idx).is_err())
            .collect();
        if !absent.is_empty() {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("missing chunk blobs {:?} for {}", absent, content_hash),
            )));
        }

        let output_path = self.chunks.output_path(content_hash, output_name);
        let part_path = self.chunks.merge_path(content_hash);

        let digest = match self.write_merged(content_hash, &meta, &part_path).await {
            Ok(digest) => digest,
            Err(e) => {
                let _ = fs::remove_file(&part_path).await;
                return Err(e);
            }
        };

        if !digest.eq_ignore_ascii_case(content_hash) {
            let _ = fs::remove_file(&part_path).await;
            return Err(TransferError::IntegrityMismatch {
                expected: content_hash.to_string(),
                actual: digest,
            });
        }

        fs::rename(&part_path, &output_path).await?;

        meta.is_transmitted = true;
        meta.is_completed = true;
        save_metadata(self.store.as_ref(), &meta, Some(self.completed_ttl)).await?;

        info!("File merged: {} ({} chunks, {} bytes)", output_path.display(), meta.chunk_count, meta.file_size);
        Ok(output_path)
    }

    async fn write_merged(
        &self,
        content_hash: &str,
        meta: &FileMetaData,
        part_path: &Path,
    ) -> Result<String, TransferError> {
        let mut output = File::create(part_path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; MERGE_BUFFER_SIZE];

        for idx in 0..meta.chunk_count {
            let mut chunk = self.chunks.open_chunk(content_hash, idx).await?;
            let actual_len = chunk.metadata().await?.len();
            let expected_len = meta.chunk_len(idx);
            if actual_len != expected_len {
                return Err(TransferError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("chunk {} holds {} bytes, expected {}", idx, actual_len, expected_len),
                )));
            }

            debug!("Merging chunk {} of {}", idx, content_hash);
            loop {
                let n = chunk.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
                output.write_all(&buffer[..n]).await?;
            }
        }

        output.flush().await?;
        output.sync_all().await?;
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::metadata_key;
    use crate::identity::digest_hex;
    use crate::store::MemoryStore;
    use rand::seq::SliceRandom;
    use rand::RngCore;
    use tempfile::tempdir;

    const IDLE: Duration = Duration::from_secs(5);

    async fn setup(data: &[u8], chunk_size: u64) -> (MergeEngine, Arc<MemoryStore>, ChunkStore, FileMetaData, tempfile::TempDir) {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let chunks = ChunkStore::new(temp_dir.path());
        let meta = FileMetaData::new("out.bin".to_string(), digest_hex(data), data.len() as u64, chunk_size);
        save_metadata(store.as_ref(), &meta, None).await.unwrap();
        chunks.create_session_dir(&meta.content_hash).await.unwrap();
        let engine = MergeEngine::new(store.clone(), chunks.clone(), Duration::from_secs(60));
        (engine, store, chunks, meta, temp_dir)
    }

    async fn write_chunk(chunks: &ChunkStore, meta: &FileMetaData, data: &[u8], idx: u64) {
        let range = meta.chunk_range(idx);
        let mut slice = &data[range.start as usize..range.end as usize];
        chunks
            .write_chunk(&meta.content_hash, idx, meta.chunk_len(idx), &mut slice, IDLE)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_merge_in_index_order() {
        let mut data = vec![0u8; 10_000];
        rand::thread_rng().fill_bytes(&mut data);
        let (engine, store, chunks, meta, _temp_dir) = setup(&data, 999).await;

        let mut order: Vec<u64> = (0..meta.chunk_count).collect();
        order.shuffle(&mut rand::thread_rng());
        for idx in order {
            write_chunk(&chunks, &meta, &data, idx).await;
        }

        let path = engine.merge(&meta.content_hash, &meta.name).await.unwrap();

        let merged = std::fs::read(&path).unwrap();
        assert_eq!(merged, data);
        assert_eq!(digest_hex(&merged), meta.content_hash);

        let stored = load_metadata(store.as_ref(), &meta.content_hash).await.unwrap().unwrap();
        assert!(stored.is_completed);
        assert!(stored.is_transmitted);
    }

    #[tokio::test]
    async fn test_merge_rerun_is_deterministic() {
        let data = b"hello chunked world".to_vec();
        let (engine, _store, chunks, meta, _temp_dir) = setup(&data, 4).await;
        for idx in 0..meta.chunk_count {
            write_chunk(&chunks, &meta, &data, idx).await;
        }

        let first = engine.merge(&meta.content_hash, &meta.name).await.unwrap();
        let second = engine.merge(&meta.content_hash, &meta.name).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), data);
    }

    #[tokio::test]
    async fn test_missing_chunk_aborts_merge() {
        let data = vec![7u8; 100];
        let (engine, store, chunks, meta, _temp_dir) = setup(&data, 30).await;
        for idx in [0u64, 1, 3] {
            write_chunk(&chunks, &meta, &data, idx).await;
        }

        let result = engine.merge(&meta.content_hash, &meta.name).await;

        assert!(matches!(result, Err(TransferError::Io(_))));
        assert!(!chunks.output_path(&meta.content_hash, &meta.name).exists());
        let stored = load_metadata(store.as_ref(), &meta.content_hash).await.unwrap().unwrap();
        assert!(!stored.is_completed);
    }

    #[tokio::test]
    async fn test_corrupted_chunk_fails_integrity_check() {
        let data = vec![1u8; 64];
        let (engine, store, chunks, meta, _temp_dir) = setup(&data, 16).await;
        for idx in 0..meta.chunk_count {
            let mut corrupt: &[u8] = &[2u8; 16];
            chunks
                .write_chunk(&meta.content_hash, idx, 16, &mut corrupt, IDLE)
                .await
                .unwrap();
        }

        let result = engine.merge(&meta.content_hash, &meta.name).await;

        assert!(matches!(result, Err(TransferError::IntegrityMismatch { .. })));
        assert!(!chunks.output_path(&meta.content_hash, &meta.name).exists());
        let stored = load_metadata(store.as_ref(), &meta.content_hash).await.unwrap().unwrap();
        assert!(!stored.is_completed);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = MergeEngine::new(store.clone(), ChunkStore::new(temp_dir.path()), Duration::from_secs(60));

        assert!(!store.exists(&metadata_key("ff")).await.unwrap());
        let result = engine.merge("ff", "x").await;
        assert!(matches!(result, Err(TransferError::UnknownSession(_))));
    }
}
