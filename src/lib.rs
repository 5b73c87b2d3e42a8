pub mod chunk_store;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod identity;
pub mod merge;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod store;
pub mod utils;

pub use chunk_store::ChunkStore;
pub use client::{ClientTransferManager, Registrar, TransferSummary};
pub use config::Config;
pub use coordinator::{FinalizeOutcome, SessionState, TransferCoordinator, TransferInfo};
pub use error::TransferError;
pub use identity::{compute_metadata, FileMetaData};
pub use merge::MergeEngine;
pub use protocol::ChunkHeader;
pub use receiver::{ChunkReceipt, ChunkReceiver};
pub use sender::{ChunkSender, SendReport};
pub use store::{MemoryStore, SessionStore};
