//! # Tidemark Engine
//!
//! Deterministic conflict resolution and watermark math for replicated
//! datastores.
//!
//! This crate decides what happens to each record when two replicas of the
//! same table meet. It never touches storage or the network: callers hand it
//! metadata, it hands back decisions.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine knows nothing about files, sockets or runtimes
//! - **Deterministic**: the same inputs always produce the same decision
//! - **Fail fast**: malformed metadata is rejected before any decision is made
//!
//! ## Core Concepts
//!
//! ### Log info
//!
//! Every synced row carries a [`LogInfo`]: an apparent write time
//! (`timestamp`), the time the row entered this replica's log
//! (`write_timestamp`), [`LogFlags`], [`CloudFlags`] and the cloud
//! bookkeeping written back after an upload.
//!
//! ### Strategies
//!
//! A [`SyncStrategy`] maps one local/remote pair to an [`OperationTag`]:
//! - [`MergeStrategy`] - bidirectional merge with lost-update protection
//! - [`ForcePushStrategy`] - the incoming row always wins
//!
//! ### Watermarks
//!
//! Delta scans are bounded per lane (live rows and tombstones) by a
//! [`Watermark`]. [`get_sync_time_range`] and [`Watermarks::advance`] decide
//! how far a round may move them without skipping rows.
//!
//! ### Planning
//!
//! The [`Reconciler`] resolves a whole batch and partitions it into local
//! writes, bookkeeping updates, uploads and skips.
//!
//! ## Quick Start
//!
//! ```rust
//! use tidemark_engine::{
//!     Candidate, ChangeRow, LogFlags, LogInfo, OperationTag, Reconciler, Scene, SyncStrategy,
//! };
//! use serde_json::json;
//!
//! // A local edit that was never uploaded, and a newer copy from the peer.
//! let local = ChangeRow::live(
//!     LogInfo::new("user-1", 100, 100).with_flags(LogFlags::LOCAL),
//!     json!({"name": "Alice"}),
//! );
//! let remote = ChangeRow::live(
//!     LogInfo::new("user-1", 200, 7).with_gid("g-1"),
//!     json!({"name": "Alicia"}),
//! );
//!
//! let reconciler = Reconciler::new(SyncStrategy::merge(Scene::Relational), false);
//! let plan = reconciler
//!     .plan(Candidate::join(vec![local], vec![remote]))
//!     .unwrap();
//!
//! assert_eq!(plan.tag_for("user-1"), Some(OperationTag::UpdateLocal));
//! assert!(plan.remote_writes.is_empty());
//! ```

pub mod clock;
pub mod error;
pub mod log_info;
pub mod operation;
pub mod reconcile;
pub mod strategy;
pub mod watermark;

// Re-export main types at crate root
pub use clock::HybridClock;
pub use error::Error;
pub use log_info::{payload_digest, ChangeRow, CloudFlags, LogFlags, LogInfo, LogStatus, Origin};
pub use operation::{OperationTag, TagClass};
pub use reconcile::{BookkeepingWrite, Candidate, LocalWrite, ReconcilePlan, Reconciler};
pub use strategy::{ForcePushStrategy, MergeStrategy, Scene, SyncStrategy};
pub use watermark::{
    get_sync_time_range, Lane, SyncTimeRange, Truncation, UpdateWaterMark, Watermark,
    WatermarkKey, WatermarkTable, Watermarks,
};

/// Type aliases for clarity
pub type RecordKey = String;
pub type TableName = String;
pub type PeerId = String;
pub type Timestamp = u64;
