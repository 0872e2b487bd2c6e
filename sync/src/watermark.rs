//! Watermark tracking per (peer, table).
//!
//! The tracker owns one fence per pair. A round holds the fence from its
//! first read to its commit, so two rounds for the same pair never
//! interleave while distinct pairs proceed independently.

use crate::error::Result;
use crate::storage::{ApplyBatch, ApplyOutcome, ChangeBatch, Storage, WatermarkAdvance};
use dashmap::DashMap;
use std::sync::Arc;
use tidemark_engine::{
    get_sync_time_range, PeerId, SyncTimeRange, TableName, UpdateWaterMark, Watermarks,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Exclusive access to one pair's watermarks.
///
/// Dropping the fence releases the pair for the next round.
#[derive(Debug)]
pub struct PairFence {
    peer: PeerId,
    table: TableName,
    _guard: OwnedMutexGuard<()>,
}

impl PairFence {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Reads and commits watermarks through the storage collaborator.
pub struct WatermarkTracker {
    storage: Arc<dyn Storage>,
    fences: DashMap<(PeerId, TableName), Arc<Mutex<()>>>,
}

impl WatermarkTracker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            fences: DashMap::new(),
        }
    }

    /// Wait for exclusive access to a pair.
    pub async fn acquire(&self, peer: &str, table: &str) -> PairFence {
        let lock = self
            .fences
            .entry((peer.to_string(), table.to_string()))
            .or_default()
            .clone();
        PairFence {
            peer: peer.to_string(),
            table: table.to_string(),
            _guard: lock.lock_owned().await,
        }
    }

    /// Whether a round currently holds the pair.
    pub fn is_busy(&self, peer: &str, table: &str) -> bool {
        self.fences
            .get(&(peer.to_string(), table.to_string()))
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    pub async fn read(&self, peer: &str, table: &str) -> Result<Watermarks> {
        self.storage.read_watermarks(peer, table).await
    }

    /// Range covered by a scanned batch and whether each lane may advance.
    pub fn time_range(batch: &ChangeBatch, prior: Watermarks) -> (SyncTimeRange, UpdateWaterMark) {
        get_sync_time_range(&batch.rows, prior.live, prior.tombstone, batch.truncation)
    }

    /// Apply `batch` and advance the pair's watermarks in one transaction.
    ///
    /// A batch without writes is a watermark-only transaction.
    pub async fn commit(
        &self,
        fence: &PairFence,
        prior: Watermarks,
        range: SyncTimeRange,
        update: UpdateWaterMark,
        batch: ApplyBatch,
    ) -> Result<ApplyOutcome> {
        let target = prior.advance(&range, update);
        let advance = WatermarkAdvance {
            peer: fence.peer.clone(),
            target,
        };
        let outcome = self
            .storage
            .apply_batch(&fence.table, batch.with_watermark(Some(advance)))
            .await?;

        tracing::debug!(
            peer = %fence.peer,
            table = %fence.table,
            live = target.live,
            tombstone = target.tombstone,
            "Committed watermarks"
        );
        Ok(outcome)
    }

    /// Apply `batch` for a fenced pair without touching watermarks.
    pub async fn apply(&self, fence: &PairFence, batch: ApplyBatch) -> Result<ApplyOutcome> {
        if batch.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        self.storage.apply_batch(&fence.table, batch).await
    }
}
