//! Inbound apply: the receiving side of an exchange.
//!
//! A [`Replica`] resolves rows a peer sent against its own storage, applies
//! the outcome in one transaction and answers with receipts carrying the
//! upload bookkeeping. A cloud replica hands out global ids.

use crate::error::Result;
use crate::storage::{ApplyBatch, Storage, WriteOp};
use crate::transport::{Receipt, SendAck, SendBatch};
use std::collections::HashMap;
use std::sync::Arc;
use tidemark_engine::{Candidate, ChangeRow, LocalWrite, Origin, RecordKey, Reconciler};

/// One replica's receiving endpoint.
pub struct Replica {
    storage: Arc<dyn Storage>,
}

impl Replica {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn origin(&self) -> Origin {
        self.storage.origin()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// This replica's rows for `keys`, keyed by record key.
    pub async fn fetch_log_info(
        &self,
        table: &str,
        keys: &[RecordKey],
    ) -> Result<HashMap<RecordKey, ChangeRow>> {
        let rows = self.storage.get_rows(table, keys).await?;
        Ok(rows.into_iter().map(|row| (row.key().clone(), row)).collect())
    }

    /// Resolve and apply rows sent by a peer.
    ///
    /// Delivering the same batch twice applies nothing the second time and
    /// returns the same receipts.
    pub async fn receive(&self, batch: SendBatch) -> Result<SendAck> {
        let SendBatch {
            table,
            origin,
            strategy,
            rows,
        } = batch;
        let keys: Vec<RecordKey> = rows.iter().map(|row| row.key().clone()).collect();

        let local = self.storage.get_rows(&table, &keys).await?;
        let plan = Reconciler::new(strategy, false).plan(Candidate::join(local, rows))?;

        let mut writes = Vec::with_capacity(plan.local_writes.len() + plan.bookkeeping.len());
        for write in plan.local_writes {
            writes.push(WriteOp::Data(self.assign_identity(write)));
        }
        writes.extend(plan.bookkeeping.into_iter().map(WriteOp::Bookkeeping));

        let outcome = self
            .storage
            .apply_batch(&table, ApplyBatch::new(origin, writes))
            .await?;

        tracing::debug!(
            table = %table,
            received = keys.len(),
            applied = outcome.applied,
            skipped = plan.skipped.len(),
            "Applied inbound batch"
        );

        let mut receipts = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(info) = self.storage.get_log_info(&table, &key).await? {
                receipts.push(Receipt {
                    key,
                    cloud_gid: info.cloud_gid,
                    version: info.version,
                });
            }
        }
        Ok(SendAck { receipts })
    }

    /// On a cloud replica, give rows without a global id a fresh one and bump
    /// the upload generation.
    fn assign_identity(&self, mut write: LocalWrite) -> LocalWrite {
        if self.origin() != Origin::Cloud {
            return write;
        }
        let existing_gid = write
            .existing
            .as_ref()
            .map(|info| info.cloud_gid.clone())
            .unwrap_or_default();
        let info = &mut write.row.info;
        if !info.has_global_id() {
            info.cloud_gid = if existing_gid.is_empty() {
                uuid::Uuid::new_v4().to_string()
            } else {
                existing_gid
            };
        }
        let previous = write.existing.as_ref().map_or(0, |info| info.version);
        info.version = info.version.max(previous) + 1;
        write
    }
}
