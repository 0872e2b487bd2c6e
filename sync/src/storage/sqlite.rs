//! SQLite storage.
//!
//! Rows and their metadata live in `sync_log`, one row per (table, key).
//! Watermarks live in `sync_watermark`, one row per (peer, table, lane).

use super::{
    is_stale, local_edit, now_millis, written_row, ApplyBatch, ApplyOutcome, ChangeBatch, Storage,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::str::FromStr;
use tidemark_engine::{
    ChangeRow, CloudFlags, HybridClock, Lane, LogFlags, LogInfo, LogStatus, Origin, RecordKey,
    Timestamp, Truncation, Watermarks,
};
use tokio::sync::Mutex;

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS sync_log (
        table_name TEXT NOT NULL,
        record_key TEXT NOT NULL,
        timestamp INTEGER NOT NULL,
        write_timestamp INTEGER NOT NULL,
        flags INTEGER NOT NULL,
        cloud_flags INTEGER NOT NULL,
        status TEXT NOT NULL,
        cloud_gid TEXT NOT NULL DEFAULT '',
        sharing_resource TEXT NOT NULL DEFAULT '',
        version INTEGER NOT NULL DEFAULT 0,
        content_digest TEXT,
        needs_asset_refresh INTEGER NOT NULL DEFAULT 0,
        payload TEXT,
        PRIMARY KEY (table_name, record_key)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sync_log_scan
        ON sync_log(table_name, write_timestamp, record_key)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sync_watermark (
        peer TEXT NOT NULL,
        table_name TEXT NOT NULL,
        lane TEXT NOT NULL,
        value INTEGER NOT NULL,
        PRIMARY KEY (peer, table_name, lane)
    )
    "#,
];

const ROW_COLUMNS: &str = "record_key, timestamp, write_timestamp, flags, cloud_flags, status, \
     cloud_gid, sharing_resource, version, content_digest, needs_asset_refresh, payload";

/// A stored row from `sync_log`.
#[derive(Debug)]
struct StoredRow {
    record_key: String,
    timestamp: i64,
    write_timestamp: i64,
    flags: i64,
    cloud_flags: i64,
    status: String,
    cloud_gid: String,
    sharing_resource: String,
    version: i64,
    content_digest: Option<String>,
    needs_asset_refresh: bool,
    payload: Option<String>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredRow {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredRow {
            record_key: row.try_get("record_key")?,
            timestamp: row.try_get("timestamp")?,
            write_timestamp: row.try_get("write_timestamp")?,
            flags: row.try_get("flags")?,
            cloud_flags: row.try_get("cloud_flags")?,
            status: row.try_get("status")?,
            cloud_gid: row.try_get("cloud_gid")?,
            sharing_resource: row.try_get("sharing_resource")?,
            version: row.try_get("version")?,
            content_digest: row.try_get("content_digest")?,
            needs_asset_refresh: row.try_get("needs_asset_refresh")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl StoredRow {
    /// Convert a database row to a tidemark-engine ChangeRow.
    fn into_change_row(self) -> Result<ChangeRow> {
        let status = match self.status.as_str() {
            "normal" => LogStatus::Normal,
            "locked" => LogStatus::Locked,
            other => {
                return Err(SyncError::Corrupt(format!(
                    "unknown status '{other}' for '{}'",
                    self.record_key
                )))
            }
        };
        let info = LogInfo {
            timestamp: from_sql(self.timestamp)?,
            write_timestamp: from_sql(self.write_timestamp)?,
            flags: LogFlags::from_bits(from_sql(self.flags)?)?,
            cloud_flags: CloudFlags::from_bits(from_sql(self.cloud_flags)?)?,
            status,
            cloud_gid: self.cloud_gid,
            sharing_resource: self.sharing_resource,
            version: from_sql(self.version)?,
            content_digest: self.content_digest,
            needs_asset_refresh: self.needs_asset_refresh,
            record_identity: self.record_key,
        };
        let payload = self
            .payload
            .map(|text| serde_json::from_str(&text))
            .transpose()?;
        Ok(ChangeRow { info, payload })
    }
}

fn status_name(status: LogStatus) -> &'static str {
    match status {
        LogStatus::Normal => "normal",
        LogStatus::Locked => "locked",
    }
}

fn to_sql(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| SyncError::Corrupt(format!("value {value} exceeds SQLite integer range")))
}

fn from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| SyncError::Corrupt(format!("negative stored value {value}")))
}

/// A replica persisted in SQLite.
pub struct SqliteStorage {
    pool: SqlitePool,
    origin: Origin,
    /// Writers hold the clock for the whole transaction so stamps commit in order.
    clock: Mutex<HybridClock>,
}

impl SqliteStorage {
    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str, origin: Origin) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::open(pool, origin).await
    }

    /// Wrap an existing pool, creating the sync tables if needed.
    pub async fn open(pool: SqlitePool, origin: Origin) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        let last: Option<i64> = sqlx::query_scalar("SELECT MAX(write_timestamp) FROM sync_log")
            .fetch_one(&pool)
            .await?;
        let clock = HybridClock::starting_at(from_sql(last.unwrap_or(0))?);

        tracing::debug!(origin = ?origin, last_stamp = clock.current(), "Opened SQLite storage");

        Ok(Self {
            pool,
            origin,
            clock: Mutex::new(clock),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Write a row as the application would, stamped with the wall clock.
    pub async fn write_local(
        &self,
        table: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<ChangeRow> {
        self.write_local_at(table, key, now_millis(), Some(payload))
            .await
    }

    /// Tombstone a row as the application would.
    pub async fn delete_local(&self, table: &str, key: &str) -> Result<ChangeRow> {
        self.write_local_at(table, key, now_millis(), None).await
    }

    /// Application write with an explicit apparent write time.
    pub async fn write_local_at(
        &self,
        table: &str,
        key: &str,
        timestamp: Timestamp,
        payload: Option<serde_json::Value>,
    ) -> Result<ChangeRow> {
        let mut clock = self.clock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current = fetch_row(&mut tx, table, key).await?;
        let row = local_edit(
            current.as_ref(),
            key,
            timestamp,
            clock.tick(now_millis()),
            payload,
        );
        upsert_row(&mut tx, table, &row).await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Lock or unlock a row. Returns false when the row does not exist.
    ///
    /// Unlocking stamps a fresh `write_timestamp` so the row is scanned again.
    pub async fn set_status(&self, table: &str, key: &str, status: LogStatus) -> Result<bool> {
        let mut clock = self.clock.lock().await;
        let mut tx = self.pool.begin().await?;

        let Some(mut row) = fetch_row(&mut tx, table, key).await? else {
            return Ok(false);
        };
        if row.info.is_locked() && status == LogStatus::Normal {
            row.info.write_timestamp = clock.tick(now_millis());
        }
        row.info.status = status;
        upsert_row(&mut tx, table, &row).await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn row(&self, table: &str, key: &str) -> Result<Option<ChangeRow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_row(&mut conn, table, key).await
    }

    /// All rows of a table in key order.
    pub async fn rows(&self, table: &str) -> Result<Vec<ChangeRow>> {
        let query = format!(
            "SELECT {ROW_COLUMNS} FROM sync_log WHERE table_name = ? ORDER BY record_key"
        );
        sqlx::query_as::<_, StoredRow>(&query)
            .bind(table)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StoredRow::into_change_row)
            .collect()
    }

    async fn scan_lane(
        &self,
        table: &str,
        lane: Lane,
        since: Timestamp,
        limit: usize,
    ) -> Result<(Vec<ChangeRow>, bool)> {
        let query = format!(
            r#"
            SELECT {ROW_COLUMNS}
            FROM sync_log
            WHERE table_name = ? AND (flags & 1) = ? AND write_timestamp >= ?
            ORDER BY write_timestamp ASC, record_key ASC
            LIMIT ?
            "#
        );
        let deleted_bit = match lane {
            Lane::Live => 0i64,
            Lane::Tombstone => 1i64,
        };
        // One extra row tells whether the lane was cut short.
        let fetch = i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX);

        let stored = sqlx::query_as::<_, StoredRow>(&query)
            .bind(table)
            .bind(deleted_bit)
            .bind(to_sql(since)?)
            .bind(fetch)
            .fetch_all(&self.pool)
            .await?;

        let truncated = stored.len() > limit;
        let rows = stored
            .into_iter()
            .take(limit)
            .map(StoredRow::into_change_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((rows, truncated))
    }
}

async fn fetch_row(
    conn: &mut SqliteConnection,
    table: &str,
    key: &str,
) -> Result<Option<ChangeRow>> {
    let query =
        format!("SELECT {ROW_COLUMNS} FROM sync_log WHERE table_name = ? AND record_key = ?");
    sqlx::query_as::<_, StoredRow>(&query)
        .bind(table)
        .bind(key)
        .fetch_optional(conn)
        .await?
        .map(StoredRow::into_change_row)
        .transpose()
}

async fn upsert_row(conn: &mut SqliteConnection, table: &str, row: &ChangeRow) -> Result<()> {
    let info = &row.info;
    let payload = row
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO sync_log (
            table_name, record_key, timestamp, write_timestamp, flags, cloud_flags,
            status, cloud_gid, sharing_resource, version, content_digest,
            needs_asset_refresh, payload
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(table_name, record_key) DO UPDATE SET
            timestamp = excluded.timestamp,
            write_timestamp = excluded.write_timestamp,
            flags = excluded.flags,
            cloud_flags = excluded.cloud_flags,
            status = excluded.status,
            cloud_gid = excluded.cloud_gid,
            sharing_resource = excluded.sharing_resource,
            version = excluded.version,
            content_digest = excluded.content_digest,
            needs_asset_refresh = excluded.needs_asset_refresh,
            payload = excluded.payload
        "#,
    )
    .bind(table)
    .bind(&info.record_identity)
    .bind(to_sql(info.timestamp)?)
    .bind(to_sql(info.write_timestamp)?)
    .bind(to_sql(info.flags.bits())?)
    .bind(to_sql(info.cloud_flags.bits())?)
    .bind(status_name(info.status))
    .bind(&info.cloud_gid)
    .bind(&info.sharing_resource)
    .bind(to_sql(info.version)?)
    .bind(&info.content_digest)
    .bind(info.needs_asset_refresh)
    .bind(&payload)
    .execute(conn)
    .await?;

    Ok(())
}

async fn read_marks(conn: &mut SqliteConnection, peer: &str, table: &str) -> Result<Watermarks> {
    let stored: Vec<(String, i64)> =
        sqlx::query_as("SELECT lane, value FROM sync_watermark WHERE peer = ? AND table_name = ?")
            .bind(peer)
            .bind(table)
            .fetch_all(conn)
            .await?;

    let mut marks = Watermarks::default();
    for (lane, value) in stored {
        let lane = Lane::parse(&lane)
            .ok_or_else(|| SyncError::Corrupt(format!("unknown watermark lane '{lane}'")))?;
        marks.set(lane, from_sql(value)?);
    }
    Ok(marks)
}

#[async_trait]
impl Storage for SqliteStorage {
    fn origin(&self) -> Origin {
        self.origin
    }

    async fn scan_changes(
        &self,
        table: &str,
        since: Watermarks,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let (mut rows, live) = self.scan_lane(table, Lane::Live, since.live, limit).await?;
        let (tombstones, tombstone) = self
            .scan_lane(table, Lane::Tombstone, since.tombstone, limit)
            .await?;
        rows.extend(tombstones);

        Ok(ChangeBatch {
            rows,
            truncation: Truncation { live, tombstone },
        })
    }

    async fn get_log_info(&self, table: &str, key: &str) -> Result<Option<LogInfo>> {
        Ok(self.row(table, key).await?.map(|row| row.info))
    }

    async fn get_rows(&self, table: &str, keys: &[RecordKey]) -> Result<Vec<ChangeRow>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders: Vec<&str> = keys.iter().map(|_| "?").collect();
        let query = format!(
            "SELECT {ROW_COLUMNS} FROM sync_log WHERE table_name = ? AND record_key IN ({})",
            placeholders.join(", ")
        );

        let mut q = sqlx::query_as::<_, StoredRow>(&query).bind(table);
        for key in keys {
            q = q.bind(key);
        }
        q.fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(StoredRow::into_change_row)
            .collect()
    }

    async fn apply_batch(&self, table: &str, batch: ApplyBatch) -> Result<ApplyOutcome> {
        let mut clock = self.clock.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut outcome = ApplyOutcome::default();

        for op in &batch.writes {
            let current = fetch_row(&mut tx, table, op.key()).await?;
            if is_stale(current.as_ref(), op) {
                tracing::debug!(key = %op.key(), "Row changed since the round read it");
                outcome.stale += 1;
                continue;
            }
            let stamp = clock.tick(now_millis());
            if let Some(row) = written_row(current.as_ref(), op, batch.source, stamp) {
                if current.as_ref() != Some(&row) {
                    upsert_row(&mut tx, table, &row).await?;
                    outcome.applied += 1;
                }
            }
        }

        if let Some(advance) = &batch.watermark {
            for lane in Lane::BOTH {
                sqlx::query(
                    r#"
                    INSERT INTO sync_watermark (peer, table_name, lane, value)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(peer, table_name, lane) DO UPDATE SET
                        value = MAX(value, excluded.value)
                    "#,
                )
                .bind(&advance.peer)
                .bind(table)
                .bind(lane.as_str())
                .bind(to_sql(advance.target.get(lane))?)
                .execute(&mut *tx)
                .await?;
            }
            outcome.watermarks = Some(read_marks(&mut tx, &advance.peer, table).await?);
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn read_watermarks(&self, peer: &str, table: &str) -> Result<Watermarks> {
        let mut conn = self.pool.acquire().await?;
        read_marks(&mut conn, peer, table).await
    }
}
