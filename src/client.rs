use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::coordinator::{TransferCoordinator, TransferInfo};
use crate::error::TransferError;
use crate::identity::{compute_metadata, FileMetaData};
use crate::sender::ChunkSender;
use crate::utils::RetryManager;

/// Control-plane call that registers a file and returns its missing chunks.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, meta: &FileMetaData) -> Result<TransferInfo, TransferError>;
}

#[async_trait]
impl Registrar for TransferCoordinator {
    async fn register(&self, meta: &FileMetaData) -> Result<TransferInfo, TransferError> {
        TransferCoordinator::register(self, meta.clone()).await
    }
}

#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub content_hash: String,
    pub file_size: u64,
    pub chunk_count: u64,
    pub chunks_sent: u64,
    pub bytes_sent: u64,
    pub rounds: u32,
    pub elapsed: Duration,
}

impl TransferSummary {
    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_sent as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Drives one file through register, send, re-register until the server
/// reports nothing left to receive.
pub struct ClientTransferManager {
    file_path: PathBuf,
    config: Arc<ClientConfig>,
    registrar: Arc<dyn Registrar>,
    retry_manager: RetryManager,
    meta: FileMetaData,
    pub progress_bar: Option<ProgressBar>,
}

impl ClientTransferManager {
    pub async fn new(
        file_path: PathBuf,
        config: Arc<ClientConfig>,
        registrar: Arc<dyn Registrar>,
        multi_progress: MultiProgress,
    ) -> Result<Self, TransferError> {
        if !file_path.is_file() {
            return Err(TransferError::FileNotFound(file_path));
        }

        let meta = compute_metadata(&file_path, config.chunk_size, None).await?;
        meta.validate()?;
        info!(
            "Prepared {} ({} bytes, {} chunks, hash {})",
            meta.name, meta.file_size, meta.chunk_count, meta.content_hash
        );

        let progress_bar = if config.progress_bar_enabled {
            let pb = multi_progress.add(ProgressBar::new(meta.file_size));
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) ETA: {eta} - {msg}")
                .map(|style| style.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb.set_message(format!("Sending: {}", file_path.display()));
            Some(pb)
        } else {
            None
        };

        Ok(Self {
            file_path,
            retry_manager: RetryManager::from_config(&config),
            config,
            registrar,
            meta,
            progress_bar,
        })
    }

    pub fn metadata(&self) -> &FileMetaData {
        &self.meta
    }

    async fn register(&self) -> Result<TransferInfo, TransferError> {
        let registrar = self.registrar.clone();
        let meta = Arc::new(self.meta.clone());
        let info = self
            .retry_manager
            .execute_with_retry(
                move || {
                    let registrar = registrar.clone();
                    let meta = meta.clone();
                    Box::pin(async move { registrar.register(&meta).await })
                },
                TransferError::is_retryable,
            )
            .await?;

        if info.content_hash != self.meta.content_hash {
            return Err(TransferError::ProtocolError(format!(
                "server answered for {} while registering {}",
                info.content_hash, self.meta.content_hash
            )));
        }
        Ok(info)
    }

    fn outstanding_bytes(&self, unreceived: &[u64]) -> u64 {
        unreceived
            .iter()
            .filter(|idx| **idx < self.meta.chunk_count)
            .map(|idx| self.meta.chunk_len(*idx))
            .sum()
    }

    /// Sends until registration returns an empty list. Rounds that make no
    /// progress count against `retry_attempts`.
    pub async fn run_transfer(&mut self) -> Result<TransferSummary, TransferError> {
        let start_time = Instant::now();
        let mut sender = ChunkSender::from_config(&self.config);
        if let Some(pb) = &self.progress_bar {
            sender = sender.with_progress(pb.clone());
        }

        let mut rounds = 0u32;
        let mut stalled = 0u32;
        let mut chunks_sent = 0u64;
        let mut bytes_sent = 0u64;
        let mut previous_missing: Option<usize> = None;

        loop {
            let info = self.register().await?;
            rounds += 1;

            if let Some(pb) = &self.progress_bar {
                pb.set_position(self.meta.file_size - self.outstanding_bytes(&info.unreceived).min(self.meta.file_size));
            }

            if info.unreceived.is_empty() {
                info!(
                    "Transfer of {} acknowledged by server after {} round(s)",
                    self.meta.name, rounds
                );
                break;
            }

            let unreceived: Vec<u64> = info
                .unreceived
                .iter()
                .copied()
                .collect::<BTreeSet<u64>>()
                .into_iter()
                .collect();
            if previous_missing.is_some_and(|previous| unreceived.len() >= previous) {
                stalled += 1;
                if stalled > self.retry_manager.max_retries() {
                    return Err(TransferError::ProtocolError(format!(
                        "Transfer incomplete: {} chunks still missing after {} rounds",
                        unreceived.len(),
                        rounds
                    )));
                }
                let delay = self.retry_manager.delay_for(stalled - 1);
                warn!("No progress on {}; retrying in {:?}", self.meta.name, delay);
                tokio::time::sleep(delay).await;
            }
            previous_missing = Some(unreceived.len());

            debug!("Round {}: sending {} chunks of {}", rounds, unreceived.len(), self.meta.name);
            let report = sender.send_all(&self.file_path, &self.meta, &unreceived).await;
            chunks_sent += report.sent.len() as u64;
            bytes_sent += report.bytes_sent;

            if let Some((idx, e)) = report.failed.first() {
                warn!(
                    "{} of {} chunks failed this round (first: chunk {}: {})",
                    report.failed.len(),
                    unreceived.len(),
                    idx,
                    e
                );
            }
        }

        Ok(TransferSummary {
            content_hash: self.meta.content_hash.clone(),
            file_size: self.meta.file_size,
            chunk_count: self.meta.chunk_count,
            chunks_sent,
            bytes_sent,
            rounds,
            elapsed: start_time.elapsed(),
        })
    }
}
