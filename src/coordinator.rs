//! Per-file session state machine.
//!
//! ```text
//! NEW -> REGISTERED -> IN_PROGRESS -> TRANSMITTED -> MERGING -> COMPLETED
//! ```
//!
//! All state lives in the [`SessionStore`] under the content hash, so any
//! number of coordinator and receiver instances can share one session.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk_store::ChunkStore;
use crate::config::ServerConfig;
use crate::error::TransferError;
use crate::identity::FileMetaData;
use crate::merge::MergeEngine;
use crate::store::SessionStore;

const REGISTER_LOCK_TTL: Duration = Duration::from_secs(10);
const REGISTER_ATTEMPTS: u32 = 50;
const REGISTER_RETRY_DELAY: Duration = Duration::from_millis(20);
const MIN_LOCK_RENEW_INTERVAL: Duration = Duration::from_millis(10);

pub fn metadata_key(content_hash: &str) -> String {
    format!("FileMetaData:{content_hash}")
}

pub fn missing_set_key(content_hash: &str) -> String {
    format!("FileTransferInfo:{content_hash}")
}

pub fn merge_lock_key(content_hash: &str) -> String {
    format!("MergeLock:{content_hash}")
}

pub fn register_lock_key(content_hash: &str) -> String {
    format!("RegisterLock:{content_hash}")
}

pub(crate) async fn load_metadata(
    store: &dyn SessionStore,
    content_hash: &str,
) -> Result<Option<FileMetaData>, TransferError> {
    match store.get_record(&metadata_key(content_hash)).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub(crate) async fn save_metadata(
    store: &dyn SessionStore,
    meta: &FileMetaData,
    ttl: Option<Duration>,
) -> Result<(), TransferError> {
    let json = serde_json::to_string(meta)?;
    store.set_record(&metadata_key(&meta.content_hash), &json, ttl).await
}

/// Chunk indices only mean the same bytes when both sides agree on the layout.
fn check_same_layout(existing: &FileMetaData, incoming: &FileMetaData) -> Result<(), TransferError> {
    if existing.file_size == incoming.file_size
        && existing.chunk_size == incoming.chunk_size
        && existing.chunk_count == incoming.chunk_count
    {
        return Ok(());
    }
    Err(TransferError::Validation(format!(
        "{} is registered as {} bytes in {} chunks of {}, not {} bytes in {} chunks of {}",
        existing.content_hash,
        existing.file_size,
        existing.chunk_count,
        existing.chunk_size,
        incoming.file_size,
        incoming.chunk_count,
        incoming.chunk_size
    )))
}

/// Answer to a registration: which chunks the client still has to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferInfo {
    pub content_hash: String,
    pub unreceived: Vec<u64>,
}

impl TransferInfo {
    fn nothing_to_send(content_hash: &str) -> Self {
        Self {
            content_hash: content_hash.to_string(),
            unreceived: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Registered,
    InProgress,
    Transmitted,
    Merging,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// This caller held the merge lock and produced the output file.
    Merged(PathBuf),
    /// Another finalizer holds the merge lock.
    Contended,
    AlreadyCompleted,
    /// Chunks are still missing; nothing to merge yet.
    Pending { remaining: u64 },
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub session_ttl: Duration,
    pub completed_ttl: Duration,
    pub merge_lock_ttl: Duration,
    pub retain_chunks: bool,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            session_ttl: Duration::from_secs(config.session_ttl_seconds),
            completed_ttl: Duration::from_secs(config.completed_ttl_seconds),
            merge_lock_ttl: Duration::from_secs(config.merge_lock_ttl_seconds),
            retain_chunks: config.retain_chunks,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

#[derive(Clone)]
pub struct TransferCoordinator {
    store: Arc<dyn SessionStore>,
    chunks: ChunkStore,
    merger: MergeEngine,
    settings: SessionSettings,
}

impl TransferCoordinator {
    pub fn new(store: Arc<dyn SessionStore>, chunks: ChunkStore, settings: SessionSettings) -> Self {
        let merger = MergeEngine::new(store.clone(), chunks.clone(), settings.completed_ttl);
        Self {
            store,
            chunks,
            merger,
            settings,
        }
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub async fn metadata(&self, content_hash: &str) -> Result<Option<FileMetaData>, TransferError> {
        load_metadata(self.store.as_ref(), content_hash).await
    }

    pub async fn require_metadata(&self, content_hash: &str) -> Result<FileMetaData, TransferError> {
        self.metadata(content_hash)
            .await?
            .ok_or_else(|| TransferError::UnknownSession(content_hash.to_string()))
    }

    /// Registers a transfer, or resumes the existing session for its content
    /// hash. Always safe to call again.
    pub async fn register(&self, meta: FileMetaData) -> Result<TransferInfo, TransferError> {
        meta.validate()?;
        let content_hash = meta.content_hash.clone();

        for _ in 0..REGISTER_ATTEMPTS {
            if let Some(existing) = self.metadata(&content_hash).await? {
                return self.resume(existing, &meta).await;
            }

            let lock_key = register_lock_key(&content_hash);
            let owner = Uuid::new_v4().to_string();
            if self
                .store
                .acquire_lock_if_absent(&lock_key, &owner, REGISTER_LOCK_TTL)
                .await?
            {
                let result = self.create_session(&meta).await;
                if let Err(e) = self.store.release_lock(&lock_key, &owner).await {
                    warn!("Failed to release registration lock for {}: {}", content_hash, e);
                }
                return result;
            }

            tokio::time::sleep(REGISTER_RETRY_DELAY).await;
        }

        Err(TransferError::Storage(format!(
            "registration of {} is held by another caller",
            content_hash
        )))
    }

    async fn create_session(&self, meta: &FileMetaData) -> Result<TransferInfo, TransferError> {
        // Another registrar may have finished between our check and the lock.
        if let Some(existing) = self.metadata(&meta.content_hash).await? {
            return self.resume(existing, meta).await;
        }

        let content_hash = meta.content_hash.as_str();
        self.chunks.create_session_dir(content_hash).await?;

        let all: Vec<u64> = (0..meta.chunk_count).collect();
        let set_key = missing_set_key(content_hash);
        self.store.delete_key(&set_key).await?;
        self.store.set_add(&set_key, &all).await?;
        self.store.expire(&set_key, self.settings.session_ttl).await?;

        // The record goes last: a session exists only once its missing set does.
        let mut record = meta.clone();
        record.is_transmitted = false;
        record.is_completed = false;
        save_metadata(self.store.as_ref(), &record, Some(self.settings.session_ttl)).await?;

        info!(
            "Registered {} ({}, {} bytes, {} chunks)",
            content_hash, meta.name, meta.file_size, meta.chunk_count
        );
        Ok(TransferInfo {
            content_hash: content_hash.to_string(),
            unreceived: all,
        })
    }

    async fn resume(&self, existing: FileMetaData, incoming: &FileMetaData) -> Result<TransferInfo, TransferError> {
        let content_hash = existing.content_hash.clone();
        if existing.is_completed {
            debug!("Session {} already completed", content_hash);
            return Ok(TransferInfo::nothing_to_send(&content_hash));
        }
        check_same_layout(&existing, incoming)?;

        self.touch(&content_hash).await?;
        let unreceived = self.store.set_members(&missing_set_key(&content_hash)).await?;

        if existing.is_transmitted || unreceived.is_empty() {
            info!("Session {} fully received but not merged; triggering merge", content_hash);
            self.spawn_finalize(content_hash.clone());
            return Ok(TransferInfo::nothing_to_send(&content_hash));
        }

        debug!("Session {} resumed with {} chunks outstanding", content_hash, unreceived.len());
        Ok(TransferInfo {
            content_hash,
            unreceived,
        })
    }

    /// Renews the session TTL while chunks are still missing. A session with
    /// no missing set is merged or merging and keeps the TTL finalize gave it.
    async fn touch(&self, content_hash: &str) -> Result<bool, TransferError> {
        let ttl = self.settings.session_ttl;
        if !self.store.expire(&missing_set_key(content_hash), ttl).await? {
            return Ok(false);
        }
        self.store.expire(&metadata_key(content_hash), ttl).await
    }

    /// Records a durably written chunk and returns how many are still missing.
    pub async fn mark_received(&self, content_hash: &str, idx: u64) -> Result<u64, TransferError> {
        let set_key = missing_set_key(content_hash);
        if !self.store.set_remove(&set_key, idx).await? {
            debug!("Chunk {} of {} was already recorded", idx, content_hash);
        }
        self.touch(content_hash).await?;
        self.store.set_cardinality(&set_key).await
    }

    fn spawn_finalize(&self, content_hash: String) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            match coordinator.finalize(&content_hash).await {
                Ok(outcome) => debug!("Background finalize of {}: {:?}", content_hash, outcome),
                Err(e) => error!("Background finalize of {} failed: {}", content_hash, e),
            }
        });
    }

    /// Merges the session if this caller wins the merge lock.
    ///
    /// Losing the lock is the expected outcome for all but one concurrent
    /// caller and is reported as [`FinalizeOutcome::Contended`], not an error.
    pub async fn finalize(&self, content_hash: &str) -> Result<FinalizeOutcome, TransferError> {
        let lock_key = merge_lock_key(content_hash);
        let owner = Uuid::new_v4().to_string();

        if !self
            .store
            .acquire_lock_if_absent(&lock_key, &owner, self.settings.merge_lock_ttl)
            .await?
        {
            debug!("Merge lock for {} is held elsewhere", content_hash);
            return Ok(FinalizeOutcome::Contended);
        }

        let result = self.finalize_locked(content_hash, &owner).await;

        match self.store.release_lock(&lock_key, &owner).await {
            Ok(true) => {}
            Ok(false) => warn!("Merge lock for {} expired before release", content_hash),
            Err(e) => warn!("Failed to release merge lock for {}: {}", content_hash, e),
        }
        result
    }

    async fn finalize_locked(&self, content_hash: &str, owner: &str) -> Result<FinalizeOutcome, TransferError> {
        let mut meta = self.require_metadata(content_hash).await?;
        if meta.is_completed {
            return Ok(FinalizeOutcome::AlreadyCompleted);
        }

        let set_key = missing_set_key(content_hash);
        let remaining = self.store.set_cardinality(&set_key).await?;
        if remaining > 0 {
            return Ok(FinalizeOutcome::Pending { remaining });
        }

        if !meta.is_transmitted {
            meta.is_transmitted = true;
            save_metadata(self.store.as_ref(), &meta, Some(self.settings.session_ttl)).await?;
            info!("All {} chunks of {} received", meta.chunk_count, content_hash);
        }

        match self.merge_with_lease(content_hash, &meta.name, owner).await {
            Ok(path) => {
                self.store.delete_key(&set_key).await?;
                if !self.settings.retain_chunks {
                    if let Err(e) = self.chunks.remove_chunks(content_hash).await {
                        warn!("Failed to remove chunk blobs of {}: {}", content_hash, e);
                    }
                }
                Ok(FinalizeOutcome::Merged(path))
            }
            Err(e @ TransferError::IntegrityMismatch { .. }) => {
                error!("Merged content of {} is corrupt; reopening session", content_hash);
                self.reopen(meta).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the merge while periodically extending the merge lock, so a long
    /// merge does not lose its lock to expiry.
    async fn merge_with_lease(&self, content_hash: &str, name: &str, owner: &str) -> Result<PathBuf, TransferError> {
        let lock_key = merge_lock_key(content_hash);
        let ttl = self.settings.merge_lock_ttl;
        let mut ticker = tokio::time::interval((ttl / 3).max(MIN_LOCK_RENEW_INTERVAL));
        ticker.tick().await;

        let merge = self.merger.merge(content_hash, name);
        tokio::pin!(merge);

        loop {
            tokio::select! {
                result = &mut merge => return result,
                _ = ticker.tick() => {
                    match self.store.renew_lock(&lock_key, owner, ttl).await {
                        Ok(true) => debug!("Renewed merge lock for {}", content_hash),
                        Ok(false) => warn!("Merge lock for {} was lost during merge", content_hash),
                        Err(e) => warn!("Failed to renew merge lock for {}: {}", content_hash, e),
                    }
                }
            }
        }
    }

    /// Marks every chunk missing again after a corrupt merge.
    async fn reopen(&self, mut meta: FileMetaData) -> Result<(), TransferError> {
        let content_hash = meta.content_hash.clone();
        self.chunks.remove_chunks(&content_hash).await?;
        self.chunks.create_session_dir(&content_hash).await?;

        let set_key = missing_set_key(&content_hash);
        let all: Vec<u64> = (0..meta.chunk_count).collect();
        self.store.set_add(&set_key, &all).await?;
        self.store.expire(&set_key, self.settings.session_ttl).await?;

        meta.is_transmitted = false;
        meta.is_completed = false;
        save_metadata(self.store.as_ref(), &meta, Some(self.settings.session_ttl)).await
    }

    pub async fn state(&self, content_hash: &str) -> Result<SessionState, TransferError> {
        let Some(meta) = self.metadata(content_hash).await? else {
            return Ok(SessionState::New);
        };
        if meta.is_completed {
            return Ok(SessionState::Completed);
        }
        if self.store.exists(&merge_lock_key(content_hash)).await? {
            return Ok(SessionState::Merging);
        }
        if meta.is_transmitted {
            return Ok(SessionState::Transmitted);
        }

        let remaining = self.store.set_cardinality(&missing_set_key(content_hash)).await?;
        if remaining == meta.chunk_count {
            Ok(SessionState::Registered)
        } else {
            Ok(SessionState::InProgress)
        }
    }
}
