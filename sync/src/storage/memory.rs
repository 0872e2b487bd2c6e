//! In-memory storage, used by tests and in-process setups.

use super::{
    is_stale, local_edit, now_millis, written_row, ApplyBatch, ApplyOutcome, ChangeBatch, Storage,
};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tidemark_engine::{
    ChangeRow, HybridClock, Lane, LogInfo, LogStatus, Origin, RecordKey, TableName, Timestamp,
    Truncation, WatermarkTable, Watermarks,
};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    tables: HashMap<TableName, BTreeMap<RecordKey, ChangeRow>>,
    marks: WatermarkTable,
    clock: HybridClock,
}

impl State {
    fn table(&mut self, table: &str) -> &mut BTreeMap<RecordKey, ChangeRow> {
        self.tables.entry(table.to_string()).or_default()
    }
}

/// A replica held in process memory.
///
/// One mutex guards rows, watermarks and the clock, so every batch is atomic.
#[derive(Debug)]
pub struct MemoryStorage {
    origin: Origin,
    state: Mutex<State>,
}

impl MemoryStorage {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            state: Mutex::new(State::default()),
        }
    }

    /// Write a row as the application would, stamped with the wall clock.
    pub async fn write_local(
        &self,
        table: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> ChangeRow {
        self.write_local_at(table, key, now_millis(), Some(payload))
            .await
    }

    /// Tombstone a row as the application would.
    pub async fn delete_local(&self, table: &str, key: &str) -> ChangeRow {
        self.write_local_at(table, key, now_millis(), None).await
    }

    /// Application write with an explicit apparent write time.
    pub async fn write_local_at(
        &self,
        table: &str,
        key: &str,
        timestamp: Timestamp,
        payload: Option<serde_json::Value>,
    ) -> ChangeRow {
        let mut state = self.state.lock().await;
        let stamp = state.clock.tick(now_millis());
        let rows = state.table(table);
        let row = local_edit(rows.get(key), key, timestamp, stamp, payload);
        rows.insert(key.to_string(), row.clone());
        row
    }

    /// Lock or unlock a row. Returns false when the row does not exist.
    ///
    /// Unlocking stamps a fresh `write_timestamp` so the row is scanned again.
    pub async fn set_status(&self, table: &str, key: &str, status: LogStatus) -> bool {
        let mut state = self.state.lock().await;
        let stamp = state.clock.tick(now_millis());
        match state.table(table).get_mut(key) {
            Some(row) => {
                if row.info.is_locked() && status == LogStatus::Normal {
                    row.info.write_timestamp = stamp;
                }
                row.info.status = status;
                true
            }
            None => false,
        }
    }

    /// Insert a row exactly as given, bypassing the clock.
    pub async fn put_raw(&self, table: &str, row: ChangeRow) {
        let mut state = self.state.lock().await;
        state.clock.observe(row.info.write_timestamp);
        state.table(table).insert(row.key().clone(), row);
    }

    pub async fn row(&self, table: &str, key: &str) -> Option<ChangeRow> {
        let mut state = self.state.lock().await;
        state.table(table).get(key).cloned()
    }

    /// All rows of a table in key order.
    pub async fn rows(&self, table: &str) -> Vec<ChangeRow> {
        let mut state = self.state.lock().await;
        state.table(table).values().cloned().collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn origin(&self) -> Origin {
        self.origin
    }

    async fn scan_changes(
        &self,
        table: &str,
        since: Watermarks,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let mut state = self.state.lock().await;
        let rows = state.table(table);

        let mut batch = ChangeBatch::default();
        let mut truncation = Truncation::NONE;
        for lane in Lane::BOTH {
            let mut lane_rows: Vec<&ChangeRow> = rows
                .values()
                .filter(|row| Lane::of(row) == lane && row.info.write_timestamp >= since.get(lane))
                .collect();
            lane_rows.sort_by(|a, b| {
                (a.info.write_timestamp, a.key()).cmp(&(b.info.write_timestamp, b.key()))
            });
            if lane_rows.len() > limit {
                lane_rows.truncate(limit);
                match lane {
                    Lane::Live => truncation.live = true,
                    Lane::Tombstone => truncation.tombstone = true,
                }
            }
            batch.rows.extend(lane_rows.into_iter().cloned());
        }
        batch.truncation = truncation;
        Ok(batch)
    }

    async fn get_log_info(&self, table: &str, key: &str) -> Result<Option<LogInfo>> {
        let mut state = self.state.lock().await;
        Ok(state.table(table).get(key).map(|row| row.info.clone()))
    }

    async fn get_rows(&self, table: &str, keys: &[RecordKey]) -> Result<Vec<ChangeRow>> {
        let mut state = self.state.lock().await;
        let rows = state.table(table);
        Ok(keys.iter().filter_map(|key| rows.get(key).cloned()).collect())
    }

    async fn apply_batch(&self, table: &str, batch: ApplyBatch) -> Result<ApplyOutcome> {
        let mut state = self.state.lock().await;
        let mut outcome = ApplyOutcome::default();

        for op in &batch.writes {
            let stamp = state.clock.tick(now_millis());
            let rows = state.table(table);
            let current = rows.get(op.key());
            if is_stale(current, op) {
                tracing::debug!(key = %op.key(), "Row changed since the round read it");
                outcome.stale += 1;
                continue;
            }
            if let Some(row) = written_row(current, op, batch.source, stamp) {
                if current != Some(&row) {
                    outcome.applied += 1;
                    rows.insert(row.key().clone(), row);
                }
            }
        }

        if let Some(advance) = &batch.watermark {
            let marks = state.marks.advance(&advance.peer, table, advance.target);
            outcome.watermarks = Some(marks);
        }
        Ok(outcome)
    }

    async fn read_watermarks(&self, peer: &str, table: &str) -> Result<Watermarks> {
        let state = self.state.lock().await;
        Ok(state.marks.read(peer, table))
    }
}
