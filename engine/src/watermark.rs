//! Watermarks bounding delta scans.
//!
//! Every (peer, table) pair keeps two logical cursors over `write_timestamp`:
//! one for live rows and one for tombstones. They are separate so a burst of
//! deletes cannot starve inserts and updates, or the other way round.
//!
//! # Boundary rule
//!
//! Scans are half-open: a stored watermark `w` selects rows with
//! `write_timestamp >= w`. Many rows written in one transaction can share a
//! `write_timestamp`, so a watermark bounds *candidates*; it never identifies
//! a row. When a scan was truncated the cursor only moves up to the largest
//! value it saw, which re-includes every row sharing that value.

use crate::{ChangeRow, PeerId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A logical cursor over `write_timestamp`.
pub type Watermark = Timestamp;

/// Which cursor a row is bounded by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lane {
    Live,
    Tombstone,
}

impl Lane {
    pub const BOTH: [Lane; 2] = [Lane::Live, Lane::Tombstone];

    pub fn of(row: &ChangeRow) -> Lane {
        if row.info.is_deleted() {
            Lane::Tombstone
        } else {
            Lane::Live
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Live => "live",
            Lane::Tombstone => "tombstone",
        }
    }

    pub fn parse(value: &str) -> Option<Lane> {
        match value {
            "live" => Some(Lane::Live),
            "tombstone" => Some(Lane::Tombstone),
            _ => None,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both cursors of one (peer, table) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermarks {
    pub live: Watermark,
    pub tombstone: Watermark,
}

impl Watermarks {
    pub fn new(live: Watermark, tombstone: Watermark) -> Self {
        Self { live, tombstone }
    }

    pub fn get(&self, lane: Lane) -> Watermark {
        match lane {
            Lane::Live => self.live,
            Lane::Tombstone => self.tombstone,
        }
    }

    pub fn set(&mut self, lane: Lane, value: Watermark) {
        match lane {
            Lane::Live => self.live = value,
            Lane::Tombstone => self.tombstone = value,
        }
    }

    /// Commit targets after processing `range`.
    ///
    /// A lane allowed to update moves to the end of the range. A lane that was
    /// truncated only moves to the largest `write_timestamp` observed, so rows
    /// sharing that value are scanned again. Neither lane ever moves back.
    pub fn advance(&self, range: &SyncTimeRange, update: UpdateWaterMark) -> Watermarks {
        let mut next = *self;
        for lane in Lane::BOTH {
            let (begin, end) = range.bounds(lane);
            let target = if update.get(lane) || end == begin {
                end
            } else {
                end - 1
            };
            next.set(lane, self.get(lane).max(target));
        }
        next
    }
}

/// Whether each lane's cursor may move past the batch's largest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateWaterMark {
    pub live: bool,
    pub tombstone: bool,
}

impl UpdateWaterMark {
    pub fn get(&self, lane: Lane) -> bool {
        match lane {
            Lane::Live => self.live,
            Lane::Tombstone => self.tombstone,
        }
    }
}

/// Which lanes a scan cut short because of its row or size cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Truncation {
    pub live: bool,
    pub tombstone: bool,
}

impl Truncation {
    pub const NONE: Truncation = Truncation {
        live: false,
        tombstone: false,
    };

    pub fn get(&self, lane: Lane) -> bool {
        match lane {
            Lane::Live => self.live,
            Lane::Tombstone => self.tombstone,
        }
    }

    pub fn any(&self) -> bool {
        self.live || self.tombstone
    }
}

/// Half-open `write_timestamp` intervals covered by one batch, per lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTimeRange {
    pub begin: Timestamp,
    pub end: Timestamp,
    pub begin_delete: Timestamp,
    pub end_delete: Timestamp,
}

impl SyncTimeRange {
    /// `(begin, end)` for one lane.
    pub fn bounds(&self, lane: Lane) -> (Timestamp, Timestamp) {
        match lane {
            Lane::Live => (self.begin, self.end),
            Lane::Tombstone => (self.begin_delete, self.end_delete),
        }
    }

    fn set_bounds(&mut self, lane: Lane, begin: Timestamp, end: Timestamp) {
        match lane {
            Lane::Live => {
                self.begin = begin;
                self.end = end;
            }
            Lane::Tombstone => {
                self.begin_delete = begin;
                self.end_delete = end;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end && self.begin_delete == self.end_delete
    }
}

/// Compute the range a batch covers and whether each lane may advance past it.
///
/// `begin` is the smaller of the prior watermark and the lane's smallest
/// `write_timestamp`; `end` is one past the lane's largest value, or `begin`
/// when the lane is empty. A lane's update flag is false exactly when the scan
/// was truncated for it; an empty, untruncated batch still reports true.
pub fn get_sync_time_range(
    batch: &[ChangeRow],
    prior_live: Watermark,
    prior_tombstone: Watermark,
    truncation: Truncation,
) -> (SyncTimeRange, UpdateWaterMark) {
    let mut range = SyncTimeRange::default();
    for lane in Lane::BOTH {
        let prior = match lane {
            Lane::Live => prior_live,
            Lane::Tombstone => prior_tombstone,
        };
        let stamps = batch
            .iter()
            .filter(|row| Lane::of(row) == lane)
            .map(|row| row.info.write_timestamp);
        let (min, max) = stamps.fold((None::<Timestamp>, None::<Timestamp>), |(lo, hi), ts| {
            (
                Some(lo.map_or(ts, |v| v.min(ts))),
                Some(hi.map_or(ts, |v| v.max(ts))),
            )
        });
        match (min, max) {
            (Some(min), Some(max)) => {
                range.set_bounds(lane, prior.min(min), max.saturating_add(1).max(prior))
            }
            _ => range.set_bounds(lane, prior, prior),
        }
    }

    let update = UpdateWaterMark {
        live: !truncation.live,
        tombstone: !truncation.tombstone,
    };
    (range, update)
}

/// Identifies one stored cursor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatermarkKey {
    pub peer: PeerId,
    pub table: TableName,
    pub lane: Lane,
}

impl WatermarkKey {
    pub fn new(peer: impl Into<PeerId>, table: impl Into<TableName>, lane: Lane) -> Self {
        Self {
            peer: peer.into(),
            table: table.into(),
            lane,
        }
    }
}

/// An in-memory, monotonic watermark table keyed by (peer, table, lane).
///
/// Storage adapters without a metadata area of their own keep their cursors
/// here. Uses BTreeMap for deterministic iteration and serialization order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkTable {
    marks: BTreeMap<WatermarkKey, Watermark>,
}

impl WatermarkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursors of a pair; zero when never committed.
    pub fn read(&self, peer: &str, table: &str) -> Watermarks {
        let mut marks = Watermarks::default();
        for lane in Lane::BOTH {
            let key = WatermarkKey::new(peer, table, lane);
            marks.set(lane, self.marks.get(&key).copied().unwrap_or(0));
        }
        marks
    }

    /// Raise the cursors of a pair. Lower values are ignored.
    pub fn advance(&mut self, peer: &str, table: &str, target: Watermarks) -> Watermarks {
        for lane in Lane::BOTH {
            let entry = self
                .marks
                .entry(WatermarkKey::new(peer, table, lane))
                .or_insert(0);
            *entry = (*entry).max(target.get(lane));
        }
        self.read(peer, table)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogInfo;
    use serde_json::json;

    fn live(key: &str, wts: Timestamp) -> ChangeRow {
        ChangeRow::live(LogInfo::new(key, wts, wts), json!({"k": key}))
    }

    fn tomb(key: &str, wts: Timestamp) -> ChangeRow {
        ChangeRow::tombstone(LogInfo::new(key, wts, wts))
    }

    #[test]
    fn range_splits_lanes() {
        let batch = vec![live("a", 12), live("b", 15), tomb("c", 40), live("d", 13)];
        let (range, update) = get_sync_time_range(&batch, 10, 30, Truncation::NONE);

        assert_eq!(range.bounds(Lane::Live), (10, 16));
        assert_eq!(range.bounds(Lane::Tombstone), (30, 41));
        assert!(update.live && update.tombstone);
    }

    #[test]
    fn empty_batch_still_updates() {
        let (range, update) = get_sync_time_range(&[], 7, 9, Truncation::NONE);
        assert_eq!(range.bounds(Lane::Live), (7, 7));
        assert_eq!(range.bounds(Lane::Tombstone), (9, 9));
        assert!(range.is_empty());
        assert!(update.live && update.tombstone);

        let marks = Watermarks::new(7, 9).advance(&range, update);
        assert_eq!(marks, Watermarks::new(7, 9));
    }

    #[test]
    fn truncated_lane_does_not_update() {
        let batch = vec![live("a", 12), live("b", 15), tomb("c", 40)];
        let truncation = Truncation {
            live: true,
            tombstone: false,
        };
        let (range, update) = get_sync_time_range(&batch, 10, 30, truncation);
        assert!(!update.live);
        assert!(update.tombstone);

        // Live stops on the largest value seen, so rows sharing it are rescanned.
        let marks = Watermarks::new(10, 30).advance(&range, update);
        assert_eq!(marks, Watermarks::new(15, 41));
    }

    #[test]
    fn shared_write_timestamp_is_rescanned_after_truncation() {
        // Three rows written in one transaction; only two fit the batch.
        let batch = vec![live("a", 20), live("b", 20)];
        let truncation = Truncation {
            live: true,
            tombstone: false,
        };
        let (range, update) = get_sync_time_range(&batch, 5, 0, truncation);
        let marks = Watermarks::new(5, 0).advance(&range, update);

        // The third row at 20 is still >= the new cursor.
        assert_eq!(marks.live, 20);
        assert!(20 >= marks.live);
    }

    #[test]
    fn advance_never_moves_back() {
        let range = SyncTimeRange {
            begin: 3,
            end: 5,
            begin_delete: 0,
            end_delete: 0,
        };
        let update = UpdateWaterMark {
            live: true,
            tombstone: true,
        };
        let marks = Watermarks::new(50, 60).advance(&range, update);
        assert_eq!(marks, Watermarks::new(50, 60));
    }

    #[test]
    fn stale_rows_widen_begin() {
        let batch = vec![live("a", 3)];
        let (range, _) = get_sync_time_range(&batch, 10, 0, Truncation::NONE);
        assert_eq!(range.bounds(Lane::Live), (3, 10));
    }

    #[test]
    fn table_is_keyed_per_peer_table_lane() {
        let mut table = WatermarkTable::new();
        table.advance("cloud", "users", Watermarks::new(10, 4));
        table.advance("cloud", "notes", Watermarks::new(99, 0));
        table.advance("phone", "users", Watermarks::new(1, 1));

        assert_eq!(table.read("cloud", "users"), Watermarks::new(10, 4));
        assert_eq!(table.read("cloud", "notes"), Watermarks::new(99, 0));
        assert_eq!(table.read("phone", "users"), Watermarks::new(1, 1));
        assert_eq!(table.read("tablet", "users"), Watermarks::default());
        assert_eq!(table.len(), 6);
    }

    #[test]
    fn lane_names_roundtrip() {
        for lane in Lane::BOTH {
            assert_eq!(Lane::parse(lane.as_str()), Some(lane));
        }
        assert_eq!(Lane::parse("other"), None);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_commits_are_monotonic(
                commits in prop::collection::vec((0u64..1000, 0u64..1000), 1..20),
            ) {
                let mut table = WatermarkTable::new();
                let mut previous = Watermarks::default();
                for (live, tombstone) in commits {
                    let now = table.advance("peer", "t", Watermarks::new(live, tombstone));
                    prop_assert!(now.live >= previous.live);
                    prop_assert!(now.tombstone >= previous.tombstone);
                    previous = now;
                }
            }

            #[test]
            fn prop_truncated_scan_keeps_omitted_rows(
                mut stamps in prop::collection::vec(5u64..50, 2..40),
                cut in 1usize..40,
                prior in 0u64..5,
            ) {
                stamps.sort_unstable();
                let cut = cut.min(stamps.len() - 1);
                let batch: Vec<_> = stamps[..cut]
                    .iter()
                    .enumerate()
                    .map(|(i, ts)| live(&format!("r{i}"), *ts))
                    .collect();
                let truncation = Truncation { live: true, tombstone: false };

                let (range, update) = get_sync_time_range(&batch, prior, 0, truncation);
                let marks = Watermarks::new(prior, 0).advance(&range, update);

                for omitted in &stamps[cut..] {
                    prop_assert!(*omitted >= marks.live);
                }
            }
        }
    }
}
