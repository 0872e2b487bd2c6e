//! Unified error handling for the sync layer.

use crate::config::ConfigError;
use tidemark_engine::{PeerId, TableName};

/// Sync error type.
///
/// A round that returns any of these committed no watermark; it can be retried
/// as is.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Engine error: {0}")]
    Engine(#[from] tidemark_engine::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unauthorized for peer {0}")]
    Unauthorized(PeerId),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Round cancelled")]
    Cancelled,

    #[error("Watermark for {peer}/{table} cannot advance within {limit} rows")]
    WatermarkStalled {
        peer: PeerId,
        table: TableName,
        limit: usize,
    },

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Corrupt stored row: {0}")]
    Corrupt(String),
}

impl SyncError {
    /// Whether running the same round again can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Storage(_)
                | SyncError::Transport(_)
                | SyncError::Timeout(_)
                | SyncError::Cancelled
                | SyncError::Scheduler(_)
        )
    }
}

/// Result type alias for the sync layer.
pub type Result<T> = std::result::Result<T, SyncError>;
