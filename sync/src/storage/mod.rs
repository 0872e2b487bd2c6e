//! Storage collaborators.
//!
//! A [`Storage`] owns one replica's rows, their [`LogInfo`] and the
//! watermarks it keeps for each peer. Every mutation goes through
//! [`Storage::apply_batch`], which must be atomic: either all writes and the
//! watermark advance land, or none do.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::error::Result;
use crate::transport::Receipt;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tidemark_engine::{
    BookkeepingWrite, ChangeRow, LocalWrite, LogFlags, LogInfo, Origin, PeerId, RecordKey,
    Timestamp, Truncation, Watermarks,
};

/// Rows returned by a delta scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    /// Live rows then tombstones, each ordered by `write_timestamp`
    pub rows: Vec<ChangeRow>,
    /// Lanes that hit the row cap
    pub truncation: Truncation,
}

impl ChangeBatch {
    pub fn keys(&self) -> Vec<RecordKey> {
        self.rows.iter().map(|row| row.key().clone()).collect()
    }
}

/// One mutation inside an [`ApplyBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WriteOp {
    /// Adopt an incoming row value
    Data(LocalWrite),
    /// Metadata-only update
    Bookkeeping(BookkeepingWrite),
    /// Upload confirmation from the peer
    Receipt(Receipt),
}

impl WriteOp {
    pub fn key(&self) -> &RecordKey {
        match self {
            WriteOp::Data(write) => write.row.key(),
            WriteOp::Bookkeeping(write) => write.key(),
            WriteOp::Receipt(receipt) => &receipt.key,
        }
    }
}

/// Watermark targets committed together with a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkAdvance {
    pub peer: PeerId,
    pub target: Watermarks,
}

/// Writes applied in one storage transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyBatch {
    /// Which kind of replica produced the incoming rows
    pub source: Origin,
    pub writes: Vec<WriteOp>,
    pub watermark: Option<WatermarkAdvance>,
}

impl ApplyBatch {
    pub fn new(source: Origin, writes: Vec<WriteOp>) -> Self {
        Self {
            source,
            writes,
            watermark: None,
        }
    }

    /// A transaction that only moves watermarks.
    pub fn watermark_only(advance: WatermarkAdvance) -> Self {
        Self {
            source: Origin::Device,
            writes: Vec::new(),
            watermark: Some(advance),
        }
    }

    #[must_use]
    pub fn with_watermark(mut self, advance: Option<WatermarkAdvance>) -> Self {
        self.watermark = advance;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.watermark.is_none()
    }
}

/// What an [`ApplyBatch`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    /// Writes that changed a stored row or its metadata
    pub applied: usize,
    /// Writes dropped because the row changed after they were decided
    pub stale: usize,
    /// Watermarks after the commit, if the batch carried an advance
    pub watermarks: Option<Watermarks>,
}

/// One replica's persistent state.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The kind of replica this storage backs.
    fn origin(&self) -> Origin;

    /// Rows of `table` with `write_timestamp` at or above the lane's
    /// watermark, at most `limit` per lane.
    async fn scan_changes(&self, table: &str, since: Watermarks, limit: usize)
        -> Result<ChangeBatch>;

    async fn get_log_info(&self, table: &str, key: &str) -> Result<Option<LogInfo>>;

    /// Rows for the keys that exist. Missing keys are left out.
    async fn get_rows(&self, table: &str, keys: &[RecordKey]) -> Result<Vec<ChangeRow>>;

    /// Apply writes and an optional watermark advance atomically.
    /// Watermarks never move back.
    async fn apply_batch(&self, table: &str, batch: ApplyBatch) -> Result<ApplyOutcome>;

    async fn read_watermarks(&self, peer: &str, table: &str) -> Result<Watermarks>;
}

/// Whether the stored row moved on since `op` was decided.
///
/// Every value change stamps a fresh `write_timestamp`, so a mismatch with the
/// metadata the decision saw means a newer write landed in between. The row
/// keeps that stamp and is scanned again by the next round. Receipts only
/// carry upload bookkeeping and always apply.
pub(crate) fn is_stale(current: Option<&ChangeRow>, op: &WriteOp) -> bool {
    let stored = current.map(|row| row.info.write_timestamp);
    match op {
        WriteOp::Data(write) => {
            stored != write.existing.as_ref().map(|info| info.write_timestamp)
        }
        WriteOp::Bookkeeping(write) => {
            stored.is_some_and(|stamp| stamp != write.existing.write_timestamp)
        }
        WriteOp::Receipt(_) => false,
    }
}

/// The stored row after `op`, or `None` when `op` leaves it alone.
///
/// `stamp` is only consumed by data writes that change the row.
pub(crate) fn written_row(
    current: Option<&ChangeRow>,
    op: &WriteOp,
    source: Origin,
    stamp: Timestamp,
) -> Option<ChangeRow> {
    match op {
        WriteOp::Data(write) => {
            let existing = current.map(|row| &row.info);
            let info = LogInfo::adopted(existing, &write.row.info, write.tag, source, stamp);
            let payload = if info.is_deleted() {
                None
            } else {
                write.row.payload.clone()
            };
            Some(ChangeRow { info, payload })
        }
        WriteOp::Bookkeeping(write) => current.map(|row| ChangeRow {
            info: row.info.with_bookkeeping(write.tag, &write.remote),
            payload: row.payload.clone(),
        }),
        WriteOp::Receipt(receipt) => current.map(|row| ChangeRow {
            info: row.info.acknowledged(&receipt.cloud_gid, receipt.version),
            payload: row.payload.clone(),
        }),
    }
}

/// The stored row after an application write on this replica.
///
/// Upload bookkeeping survives the edit; `None` as payload writes a tombstone.
pub(crate) fn local_edit(
    current: Option<&ChangeRow>,
    key: &str,
    timestamp: Timestamp,
    stamp: Timestamp,
    payload: Option<serde_json::Value>,
) -> ChangeRow {
    let mut info = LogInfo::new(key, timestamp, stamp).with_flags(LogFlags::LOCAL);
    if let Some(row) = current {
        info.cloud_gid = row.info.cloud_gid.clone();
        info.sharing_resource = row.info.sharing_resource.clone();
        info.version = row.info.version;
        info.cloud_flags = row.info.cloud_flags;
        info.status = row.info.status;
    }
    match payload {
        Some(value) => ChangeRow::live(info, value),
        None => ChangeRow::tombstone(info),
    }
}

/// Current wall time in milliseconds.
pub(crate) fn now_millis() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
