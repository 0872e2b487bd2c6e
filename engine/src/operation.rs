//! Merge decisions.
//!
//! An [`OperationTag`] is what a strategy decides for one record in one round.
//! Tags are recomputed every round from fresh metadata and never persisted.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The merge decision for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationTag {
    /// Insert the remote row locally.
    Insert,
    /// Overwrite the local row with the remote row.
    UpdateLocal,
    /// Tombstone the local row.
    Delete,
    /// Detach the local global id so a later edit re-inserts cleanly.
    ClearGlobalId,
    /// Record the remote global id without touching the row value.
    OnlyUpdateGlobalId,
    /// Both sides are tombstones; align the timestamp only.
    RefreshTimestamp,
    /// Nothing to do.
    Skip,
    /// The local row is locked; retried once it is unlocked.
    SkipLocked,
}

/// Bucket a tag falls into when a batch is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    DataWrite,
    Bookkeeping,
    Skip,
}

impl OperationTag {
    /// All tags, in declaration order.
    pub const ALL: [OperationTag; 8] = [
        OperationTag::Insert,
        OperationTag::UpdateLocal,
        OperationTag::Delete,
        OperationTag::ClearGlobalId,
        OperationTag::OnlyUpdateGlobalId,
        OperationTag::RefreshTimestamp,
        OperationTag::Skip,
        OperationTag::SkipLocked,
    ];

    pub fn class(self) -> TagClass {
        match self {
            OperationTag::Insert | OperationTag::UpdateLocal | OperationTag::Delete => {
                TagClass::DataWrite
            }
            OperationTag::ClearGlobalId
            | OperationTag::OnlyUpdateGlobalId
            | OperationTag::RefreshTimestamp => TagClass::Bookkeeping,
            OperationTag::Skip | OperationTag::SkipLocked => TagClass::Skip,
        }
    }

    /// Insert, UpdateLocal or Delete: the local row value changes.
    pub fn is_data_write(self) -> bool {
        self.class() == TagClass::DataWrite
    }

    pub fn is_bookkeeping(self) -> bool {
        self.class() == TagClass::Bookkeeping
    }

    pub fn is_skip(self) -> bool {
        self.class() == TagClass::Skip
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationTag::Insert => "insert",
            OperationTag::UpdateLocal => "update_local",
            OperationTag::Delete => "delete",
            OperationTag::ClearGlobalId => "clear_global_id",
            OperationTag::OnlyUpdateGlobalId => "only_update_global_id",
            OperationTag::RefreshTimestamp => "refresh_timestamp",
            OperationTag::Skip => "skip",
            OperationTag::SkipLocked => "skip_locked",
        }
    }
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
