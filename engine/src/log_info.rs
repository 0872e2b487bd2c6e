//! Per-record replication metadata.
//!
//! A [`LogInfo`] travels with every row that takes part in sync. It carries
//! the two timestamps used for ordering, the flag sets that tell where the
//! last write came from, and the cloud bookkeeping (global id, sharing
//! resource, version) written back after a successful upload.

use crate::{
    error::{Error, Result},
    OperationTag, RecordKey, Timestamp,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::BitOr;

macro_rules! named_flags {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $( $(#[$fmeta:meta])* $flag:ident = $bit:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "u64", into = "u64")]
        pub struct $name(u64);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: Self = Self($bit); )+

            /// Every bit this type knows about.
            pub const ALL: Self = Self(0 $( | $bit )+);

            /// No bits set.
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Raw bit value.
            pub const fn bits(self) -> u64 {
                self.0
            }

            /// Parse raw bits, rejecting any bit outside [`Self::ALL`].
            pub fn from_bits(bits: u64) -> Result<Self> {
                if bits & !Self::ALL.0 != 0 {
                    return Err(Error::InvalidFlags {
                        field: $field,
                        bits: bits & !Self::ALL.0,
                    });
                }
                Ok(Self(bits))
            }

            /// Check whether every bit of `other` is set.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Copy with the bits of `other` set.
            #[must_use]
            pub const fn with(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// Copy with the bits of `other` cleared.
            #[must_use]
            pub const fn without(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.with(rhs)
            }
        }

        impl TryFrom<u64> for $name {
            type Error = Error;

            fn try_from(bits: u64) -> Result<Self> {
                Self::from_bits(bits)
            }
        }

        impl From<$name> for u64 {
            fn from(flags: $name) -> u64 {
                flags.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut names = Vec::new();
                $( if self.contains(Self::$flag) { names.push(stringify!($flag)); } )+
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}

named_flags! {
    /// Flags describing who wrote a row last and whether it is a tombstone.
    LogFlags, "flags" {
        /// Tombstone: the row keeps its key but not its value.
        DELETED = 0x01,
        /// Authored on this replica.
        LOCAL = 0x02,
        /// Excluded from incoming updates while a migration runs.
        IGNORE_UPDATE = 0x04,
        /// The last write came from the cloud.
        CLOUD_WRITE = 0x200,
    }
}

named_flags! {
    /// Flags tied to the cloud identity that authored a row.
    CloudFlags, "cloud_flags" {
        /// Authored by the currently signed-in cloud identity.
        LOGIN_USER = 0x01,
    }
}

/// Lock state of a row. Locked rows are left alone by normal merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogStatus {
    #[default]
    Normal,
    Locked,
}

/// Which kind of replica produced a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Origin {
    /// A peer device.
    #[default]
    Device,
    /// The cloud backend.
    Cloud,
}

/// Replication metadata for one record.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogInfo {
    /// Stable hash of the record key
    pub record_identity: RecordKey,
    /// Apparent write time, monotonic per device
    pub timestamp: Timestamp,
    /// Log insertion time on the replica holding this copy
    pub write_timestamp: Timestamp,
    pub flags: LogFlags,
    pub cloud_flags: CloudFlags,
    pub status: LogStatus,
    /// Global id assigned on first upload; empty if never uploaded
    pub cloud_gid: String,
    pub sharing_resource: String,
    /// Upload bookkeeping generation, bumped by the id-assigning side
    pub version: u64,
    /// SHA-256 of the payload; `None` when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    /// Binary asset fields must be fetched again
    pub needs_asset_refresh: bool,
}

impl LogInfo {
    /// Create metadata for a live row with no flags set.
    pub fn new(
        record_identity: impl Into<RecordKey>,
        timestamp: Timestamp,
        write_timestamp: Timestamp,
    ) -> Self {
        Self {
            record_identity: record_identity.into(),
            timestamp,
            write_timestamp,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: LogFlags) -> Self {
        self.flags = self.flags.with(flags);
        self
    }

    #[must_use]
    pub fn with_cloud_flags(mut self, flags: CloudFlags) -> Self {
        self.cloud_flags = self.cloud_flags.with(flags);
        self
    }

    #[must_use]
    pub fn with_gid(mut self, gid: impl Into<String>) -> Self {
        self.cloud_gid = gid.into();
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: LogStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.content_digest = Some(digest.into());
        self
    }

    /// Mark as tombstone. The content digest goes with the value.
    #[must_use]
    pub fn tombstoned(mut self) -> Self {
        self.flags.insert(LogFlags::DELETED);
        self.content_digest = None;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(LogFlags::DELETED)
    }

    pub fn is_locked(&self) -> bool {
        self.status == LogStatus::Locked
    }

    pub fn has_global_id(&self) -> bool {
        !self.cloud_gid.is_empty()
    }

    pub fn is_ignore_update(&self) -> bool {
        self.flags.contains(LogFlags::IGNORE_UPDATE)
    }

    /// Check the invariants the strategies rely on.
    pub fn validate(&self) -> Result<()> {
        if self.record_identity.is_empty() {
            return Err(self.malformed("empty record identity"));
        }
        if self.is_deleted() && self.needs_asset_refresh {
            return Err(self.malformed("tombstone cannot require an asset refresh"));
        }
        if self.is_deleted() && self.content_digest.is_some() {
            return Err(self.malformed("tombstone cannot carry a content digest"));
        }
        Ok(())
    }

    fn malformed(&self, reason: &str) -> Error {
        Error::MalformedLogInfo {
            key: self.record_identity.clone(),
            reason: reason.to_string(),
        }
    }

    /// Field equality ignoring bookkeeping columns. Unknown digests never match.
    pub fn same_content(&self, other: &LogInfo) -> bool {
        match (&self.content_digest, &other.content_digest) {
            (Some(a), Some(b)) => a == b && self.is_deleted() == other.is_deleted(),
            _ => false,
        }
    }

    /// Whether `self` (the remote copy) carries upload bookkeeping that
    /// `local` has not recorded yet.
    pub fn bookkeeping_ahead_of(&self, local: &LogInfo) -> bool {
        self.version > local.version
            || (self.has_global_id() && self.cloud_gid != local.cloud_gid)
            || self.sharing_resource != local.sharing_resource
    }

    /// Metadata after a data write adopted `remote` on top of `existing`.
    ///
    /// `stamp` is the local log insertion time. It is only consumed when the
    /// write changes the row; re-applying an identical row keeps the previous
    /// `write_timestamp` so the row does not re-enter the next delta scan.
    pub fn adopted(
        existing: Option<&LogInfo>,
        remote: &LogInfo,
        tag: OperationTag,
        from: Origin,
        stamp: Timestamp,
    ) -> LogInfo {
        let mut info = remote.clone();
        info.flags.remove(LogFlags::LOCAL | LogFlags::IGNORE_UPDATE);
        match from {
            Origin::Cloud => info.flags.insert(LogFlags::CLOUD_WRITE),
            Origin::Device => info.flags.remove(LogFlags::CLOUD_WRITE),
        }
        if tag == OperationTag::Delete {
            info = info.tombstoned();
            info.needs_asset_refresh = false;
        } else {
            info.flags.remove(LogFlags::DELETED);
        }

        match existing {
            Some(prev) => {
                if !info.has_global_id() {
                    info.cloud_gid = prev.cloud_gid.clone();
                    info.version = info.version.max(prev.version);
                }
                info.status = prev.status;
                let unchanged = prev.timestamp == info.timestamp
                    && prev.is_deleted() == info.is_deleted()
                    && prev.content_digest == info.content_digest;
                info.write_timestamp = if unchanged {
                    prev.write_timestamp
                } else {
                    stamp
                };
            }
            None => {
                info.status = LogStatus::Normal;
                info.write_timestamp = stamp;
            }
        }
        info
    }

    /// Metadata after a bookkeeping-only update. `write_timestamp` is kept.
    pub fn with_bookkeeping(&self, tag: OperationTag, remote: &LogInfo) -> LogInfo {
        let mut info = self.clone();
        match tag {
            OperationTag::OnlyUpdateGlobalId => {
                if remote.has_global_id() {
                    info.cloud_gid = remote.cloud_gid.clone();
                }
                info.version = info.version.max(remote.version);
                info.sharing_resource = remote.sharing_resource.clone();
            }
            OperationTag::ClearGlobalId => {
                info.cloud_gid.clear();
                info.sharing_resource.clear();
                info.version = 0;
            }
            OperationTag::RefreshTimestamp => {
                info.timestamp = info.timestamp.max(remote.timestamp);
            }
            _ => {}
        }
        info
    }

    /// Metadata after the peer confirmed an upload. `write_timestamp` is kept.
    pub fn acknowledged(&self, cloud_gid: &str, version: u64) -> LogInfo {
        let mut info = self.clone();
        if !cloud_gid.is_empty() {
            info.cloud_gid = cloud_gid.to_string();
        }
        info.version = info.version.max(version);
        info
    }
}

/// Hex SHA-256 of a payload's canonical JSON encoding.
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let digest = Sha256::digest(payload.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A row as exchanged between the driver and its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow {
    pub info: LogInfo,
    /// Row value; always `None` for tombstones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ChangeRow {
    /// A live row. The content digest is computed from the payload.
    pub fn live(mut info: LogInfo, payload: serde_json::Value) -> Self {
        info.flags.remove(LogFlags::DELETED);
        info.content_digest = Some(payload_digest(&payload));
        Self {
            info,
            payload: Some(payload),
        }
    }

    /// A tombstone for `info`'s key.
    pub fn tombstone(info: LogInfo) -> Self {
        Self {
            info: info.tombstoned(),
            payload: None,
        }
    }

    pub fn key(&self) -> &RecordKey {
        &self.info.record_identity
    }

    pub fn validate(&self) -> Result<()> {
        self.info.validate()?;
        if self.info.is_deleted() && self.payload.is_some() {
            return Err(Error::MalformedRow {
                key: self.key().clone(),
                reason: "tombstone carries a payload".to_string(),
            });
        }
        Ok(())
    }
}
