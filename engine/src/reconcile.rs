//! Batch planning for one reconciliation round.
//!
//! The [`Reconciler`] pairs each local row with the peer's copy of the same
//! key, asks the strategy for a tag and sorts the outcome into the buckets a
//! driver acts on.
//!
//! # Algorithm
//!
//! 1. Validate every candidate; one malformed row fails the whole plan
//! 2. Order candidates by key so the plan is deterministic
//! 3. Resolve each pair that has a peer copy
//! 4. Route the tag: data write, bookkeeping or skip
//! 5. Queue the local row for upload when the peer lacks it or the local
//!    edit is newer and was not overwritten

use crate::{
    error::{Error, Result},
    ChangeRow, LogInfo, OperationTag, RecordKey, SyncStrategy, TagClass,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One key with whatever each side holds for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub key: RecordKey,
    /// This replica's row; `None` when it does not exist here
    pub local: Option<ChangeRow>,
    /// The peer's row; `None` when the peer has no copy
    pub remote: Option<ChangeRow>,
}

impl Candidate {
    /// Pair rows by key. Keys present on one side only get `None` on the other.
    pub fn join(
        local: impl IntoIterator<Item = ChangeRow>,
        remote: impl IntoIterator<Item = ChangeRow>,
    ) -> Vec<Candidate> {
        let mut pairs: BTreeMap<RecordKey, Candidate> = BTreeMap::new();
        for row in local {
            let key = row.key().clone();
            pairs
                .entry(key.clone())
                .or_insert_with(|| Candidate::empty(key))
                .local = Some(row);
        }
        for row in remote {
            let key = row.key().clone();
            pairs
                .entry(key.clone())
                .or_insert_with(|| Candidate::empty(key))
                .remote = Some(row);
        }
        pairs.into_values().collect()
    }

    fn empty(key: RecordKey) -> Self {
        Self {
            key,
            local: None,
            remote: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.local.is_none() && self.remote.is_none() {
            return Err(Error::EmptyCandidate(self.key.clone()));
        }
        for row in self.local.iter().chain(self.remote.iter()) {
            row.validate()?;
            if row.key() != &self.key {
                return Err(Error::MalformedRow {
                    key: self.key.clone(),
                    reason: format!("row for '{}' filed under the wrong key", row.key()),
                });
            }
        }
        Ok(())
    }
}

/// A write that changes the local row value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalWrite {
    /// Insert, UpdateLocal or Delete
    pub tag: OperationTag,
    /// The incoming row to adopt
    pub row: ChangeRow,
    /// Local metadata the decision was made against
    pub existing: Option<LogInfo>,
}

/// A metadata-only update. The local row value is untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookkeepingWrite {
    /// ClearGlobalId, OnlyUpdateGlobalId or RefreshTimestamp
    pub tag: OperationTag,
    pub existing: LogInfo,
    pub remote: LogInfo,
}

impl BookkeepingWrite {
    pub fn key(&self) -> &RecordKey {
        &self.existing.record_identity
    }
}

/// Everything one round decided.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePlan {
    pub local_writes: Vec<LocalWrite>,
    pub bookkeeping: Vec<BookkeepingWrite>,
    /// Local rows the peer should receive
    pub remote_writes: Vec<ChangeRow>,
    /// Keys left alone, with Skip or SkipLocked
    pub skipped: Vec<(RecordKey, OperationTag)>,
}

impl ReconcilePlan {
    /// Plan that only uploads, used by a force push source.
    pub fn push_all(rows: Vec<ChangeRow>) -> Self {
        Self {
            remote_writes: rows,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local_writes.is_empty()
            && self.bookkeeping.is_empty()
            && self.remote_writes.is_empty()
    }

    /// Rows skipped because they were locked.
    pub fn locked(&self) -> usize {
        self.skipped
            .iter()
            .filter(|(_, tag)| *tag == OperationTag::SkipLocked)
            .count()
    }

    /// Tag decided for `key`, if the key took part in resolution.
    pub fn tag_for(&self, key: &str) -> Option<OperationTag> {
        self.local_writes
            .iter()
            .find(|w| w.row.key() == key)
            .map(|w| w.tag)
            .or_else(|| {
                self.bookkeeping
                    .iter()
                    .find(|b| b.key() == key)
                    .map(|b| b.tag)
            })
            .or_else(|| {
                self.skipped
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, tag)| *tag)
            })
    }
}

/// Turns candidate pairs into a [`ReconcilePlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reconciler {
    strategy: SyncStrategy,
    remote_is_authoritative: bool,
}

impl Reconciler {
    pub fn new(strategy: SyncStrategy, remote_is_authoritative: bool) -> Self {
        Self {
            strategy,
            remote_is_authoritative,
        }
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    /// Build the plan for a batch. Fails without a partial plan when any
    /// candidate is malformed.
    pub fn plan(&self, mut candidates: Vec<Candidate>) -> Result<ReconcilePlan> {
        for candidate in &candidates {
            candidate.validate()?;
        }
        candidates.sort_by(|a, b| a.key.cmp(&b.key));

        let mut plan = ReconcilePlan::default();
        for candidate in candidates {
            self.plan_one(candidate, &mut plan);
        }
        Ok(plan)
    }

    fn plan_one(&self, candidate: Candidate, plan: &mut ReconcilePlan) {
        let Candidate { key, local, remote } = candidate;

        let Some(remote) = remote else {
            // The peer has no copy. Tombstones it never saw stay here.
            match local {
                Some(row) if self.strategy.should_upload() && !never_uploaded_tombstone(&row) => {
                    plan.remote_writes.push(row)
                }
                _ => plan.skipped.push((key, OperationTag::Skip)),
            }
            return;
        };

        let exists_locally = local.is_some();
        let local_info = local.as_ref().map(|row| row.info.clone()).unwrap_or_default();
        let tag = self.strategy.resolve(
            exists_locally,
            self.remote_is_authoritative,
            &local_info,
            &remote.info,
        );

        if let Some(row) = &local {
            if self.strategy.should_upload()
                && !tag.is_data_write()
                && self.strategy.locally_newer(&row.info, &remote.info)
            {
                let mut upload = row.clone();
                if tag.is_bookkeeping() {
                    upload.info = upload.info.with_bookkeeping(tag, &remote.info);
                }
                plan.remote_writes.push(upload);
            }
        }

        match tag.class() {
            TagClass::DataWrite => plan.local_writes.push(LocalWrite {
                tag,
                row: remote,
                existing: local.map(|row| row.info),
            }),
            TagClass::Bookkeeping => plan.bookkeeping.push(BookkeepingWrite {
                tag,
                existing: local_info,
                remote: remote.info,
            }),
            TagClass::Skip => plan.skipped.push((key, tag)),
        }
    }
}

fn never_uploaded_tombstone(row: &ChangeRow) -> bool {
    row.info.is_deleted() && !row.info.has_global_id()
}
