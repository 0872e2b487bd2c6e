//! Per-record conflict resolution.
//!
//! A strategy maps `(exists_locally, remote_is_authoritative, local, remote)`
//! to an [`OperationTag`]. Resolution is pure: no I/O, no hidden state, and the
//! same inputs always give the same tag, so it is safe to run on independent
//! records in parallel.
//!
//! # Variants
//!
//! - [`MergeStrategy`]: bidirectional merge. Protects newer local edits,
//!   propagates tombstones and fills back global ids after lost acks.
//! - [`ForcePushStrategy`]: one-directional. The incoming side always wins, so
//!   replicas converge on the push source whatever their local edits were.

use crate::{CloudFlags, LogFlags, LogInfo, OperationTag};
use serde::{Deserialize, Serialize};

/// Which consistency domain the rows belong to.
///
/// The two domains mark "this is a newer local edit" differently: single-value
/// KV rows are newer unless the cloud wrote them last, relational rows are
/// newer only if they were authored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scene {
    #[default]
    KvStore,
    Relational,
}

/// Bidirectional merge strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStrategy {
    pub scene: Scene,
}

/// One-directional strategy: the incoming row always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ForcePushStrategy {}

/// The strategy used for a sync round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum SyncStrategy {
    Merge(MergeStrategy),
    ForcePush(ForcePushStrategy),
}

impl Default for SyncStrategy {
    fn default() -> Self {
        SyncStrategy::Merge(MergeStrategy::default())
    }
}

impl SyncStrategy {
    pub fn merge(scene: Scene) -> Self {
        SyncStrategy::Merge(MergeStrategy::new(scene))
    }

    pub fn force_push() -> Self {
        SyncStrategy::ForcePush(ForcePushStrategy {})
    }

    /// Decide what to do with one record.
    ///
    /// Both `LogInfo`s must have passed [`LogInfo::validate`]. When the record
    /// does not exist locally, `local` is ignored by every rule that matters
    /// and may be `LogInfo::default()`.
    pub fn resolve(
        &self,
        exists_locally: bool,
        remote_is_authoritative: bool,
        local: &LogInfo,
        remote: &LogInfo,
    ) -> OperationTag {
        match self {
            SyncStrategy::Merge(s) => {
                s.resolve(exists_locally, remote_is_authoritative, local, remote)
            }
            SyncStrategy::ForcePush(s) => s.resolve(exists_locally, local, remote),
        }
    }

    /// Whether locally newer rows are sent to the peer.
    pub fn should_upload(&self) -> bool {
        match self {
            SyncStrategy::Merge(_) | SyncStrategy::ForcePush(_) => true,
        }
    }

    /// Whether the round adopts the peer's changes locally.
    ///
    /// A force push is one-directional: the source sends every scanned row
    /// and the receiver resolves them with this strategy.
    pub fn should_download(&self) -> bool {
        match self {
            SyncStrategy::Merge(_) => true,
            SyncStrategy::ForcePush(_) => false,
        }
    }

    /// Whether a successful round advances the watermarks.
    pub fn should_update_cursor(&self) -> bool {
        match self {
            SyncStrategy::Merge(_) | SyncStrategy::ForcePush(_) => true,
        }
    }

    /// The "local edit is newer" test used when deciding uploads.
    pub fn locally_newer(&self, local: &LogInfo, remote: &LogInfo) -> bool {
        match self {
            SyncStrategy::Merge(s) => s.locally_newer(local, remote),
            SyncStrategy::ForcePush(_) => false,
        }
    }
}

impl MergeStrategy {
    pub fn new(scene: Scene) -> Self {
        Self { scene }
    }

    pub fn resolve(
        &self,
        exists_locally: bool,
        remote_is_authoritative: bool,
        local: &LogInfo,
        remote: &LogInfo,
    ) -> OperationTag {
        let remote_deleted = remote.is_deleted();
        let local_deleted = local.is_deleted();

        if remote_is_authoritative {
            return remote_wins(local, remote);
        }
        if local.is_locked() {
            return OperationTag::SkipLocked;
        }
        if !exists_locally {
            // A tombstone for a row we never had is unrelated data.
            return if remote_deleted {
                OperationTag::Skip
            } else {
                OperationTag::Insert
            };
        }
        if local.is_ignore_update() {
            return OperationTag::Skip;
        }
        if self.locally_newer(local, remote) {
            return locally_newer_tag(local, remote);
        }
        if remote_deleted {
            return if local_deleted {
                OperationTag::RefreshTimestamp
            } else {
                OperationTag::Delete
            };
        }
        if local_deleted {
            return OperationTag::Insert;
        }
        // The upload went through but its ack was lost: only fill back the id.
        let same_time = local.timestamp == remote.timestamp
            && local.write_timestamp == remote.write_timestamp;
        if same_time
            && (!local.has_global_id() || local.sharing_resource != remote.sharing_resource)
        {
            return OperationTag::OnlyUpdateGlobalId;
        }
        if !local.needs_asset_refresh && local.same_content(remote) {
            return OperationTag::Skip;
        }
        self.login_user_update(local, remote)
    }

    /// `local.timestamp > remote.timestamp`, qualified per scene.
    pub fn locally_newer(&self, local: &LogInfo, remote: &LogInfo) -> bool {
        if local.timestamp <= remote.timestamp {
            return false;
        }
        match self.scene {
            Scene::KvStore => !local.flags.contains(LogFlags::CLOUD_WRITE),
            Scene::Relational => local.flags.contains(LogFlags::LOCAL),
        }
    }

    /// In a KV store, another account's newer edit is left alone.
    fn login_user_update(&self, local: &LogInfo, remote: &LogInfo) -> OperationTag {
        if self.scene == Scene::KvStore
            && !local.flags.contains(LogFlags::LOCAL)
            && !local.cloud_flags.contains(CloudFlags::LOGIN_USER)
            && local.timestamp > remote.timestamp
        {
            return OperationTag::Skip;
        }
        update_local(local, remote)
    }
}

impl ForcePushStrategy {
    pub fn resolve(&self, exists_locally: bool, local: &LogInfo, remote: &LogInfo) -> OperationTag {
        if remote.is_deleted() {
            if local.is_deleted() {
                OperationTag::RefreshTimestamp
            } else if exists_locally {
                OperationTag::Delete
            } else {
                OperationTag::Skip
            }
        } else if !exists_locally || local.is_deleted() {
            OperationTag::Insert
        } else {
            OperationTag::UpdateLocal
        }
    }
}

fn remote_wins(local: &LogInfo, remote: &LogInfo) -> OperationTag {
    match (remote.is_deleted(), local.is_deleted()) {
        (true, true) => OperationTag::RefreshTimestamp,
        (true, false) => OperationTag::Delete,
        (false, true) => OperationTag::Insert,
        (false, false) => update_local(local, remote),
    }
}

fn locally_newer_tag(local: &LogInfo, remote: &LogInfo) -> OperationTag {
    if !local.has_global_id() {
        return if remote.is_deleted() {
            OperationTag::Skip
        } else if local.is_deleted() {
            OperationTag::Insert
        } else {
            OperationTag::OnlyUpdateGlobalId
        };
    }
    if remote.is_deleted() {
        // Remote deleted a row we uploaded before; a later edit re-inserts it.
        return OperationTag::ClearGlobalId;
    }
    if remote.bookkeeping_ahead_of(local) {
        return OperationTag::OnlyUpdateGlobalId;
    }
    OperationTag::Skip
}

fn update_local(local: &LogInfo, remote: &LogInfo) -> OperationTag {
    if !local.needs_asset_refresh
        && local.same_content(remote)
        && local.timestamp == remote.timestamp
    {
        return OperationTag::Skip;
    }
    OperationTag::UpdateLocal
}
