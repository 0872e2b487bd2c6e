//! Integration tests for reconciliation rounds.
//!
//! Device and cloud replicas are wired together in process through
//! `LoopbackTransport`; SQLite tests use in-memory databases.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidemark_engine::{
    ChangeRow, LogFlags, LogInfo, LogStatus, Origin, RecordKey, Scene, SyncStrategy, Watermarks,
};
use tidemark_sync::{
    DriverOptions, LoopbackTransport, MemoryStorage, ReconciliationDriver, Replica, SendAck,
    SendBatch, SqliteStorage, SyncError, Transport,
};
use tokio_util::sync::CancellationToken;

const TABLE: &str = "notes";

/// Test helper: a device and a cloud replica with a driver in each direction.
struct Mesh {
    device: Arc<MemoryStorage>,
    cloud: Arc<MemoryStorage>,
    up: ReconciliationDriver,
    down: ReconciliationDriver,
}

fn options() -> DriverOptions {
    DriverOptions {
        strategy: SyncStrategy::merge(Scene::KvStore),
        ..DriverOptions::default()
    }
}

fn cloud_link(cloud: &Arc<MemoryStorage>) -> LoopbackTransport {
    LoopbackTransport::new("cloud", Arc::new(Replica::new(cloud.clone())))
}

fn mesh(options: DriverOptions) -> Mesh {
    let device = Arc::new(MemoryStorage::new(Origin::Device));
    let cloud = Arc::new(MemoryStorage::new(Origin::Cloud));
    let to_device = LoopbackTransport::new("device", Arc::new(Replica::new(device.clone())));
    Mesh {
        up: ReconciliationDriver::new(device.clone(), Arc::new(cloud_link(&cloud)), options),
        down: ReconciliationDriver::new(cloud.clone(), Arc::new(to_device), options),
        device,
        cloud,
    }
}

impl Mesh {
    async fn sync(&self) {
        let cancel = CancellationToken::new();
        self.up.run_round("cloud", TABLE, &cancel).await.unwrap();
        self.down.run_round("device", TABLE, &cancel).await.unwrap();
    }
}

fn payloads(rows: Vec<ChangeRow>) -> BTreeMap<RecordKey, Option<Value>> {
    rows.into_iter()
        .map(|row| (row.info.record_identity, row.payload))
        .collect()
}

/// Fails every `send` while `failing` is set.
struct FlakyTransport {
    inner: LoopbackTransport,
    failing: AtomicBool,
}

#[async_trait]
impl Transport for FlakyTransport {
    fn peer_origin(&self, peer: &str) -> Origin {
        self.inner.peer_origin(peer)
    }

    async fn fetch_remote_log_info(
        &self,
        peer: &str,
        table: &str,
        keys: &[RecordKey],
    ) -> tidemark_sync::Result<HashMap<RecordKey, ChangeRow>> {
        self.inner.fetch_remote_log_info(peer, table, keys).await
    }

    async fn send(&self, peer: &str, batch: SendBatch) -> tidemark_sync::Result<SendAck> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("connection reset".into()));
        }
        self.inner.send(peer, batch).await
    }
}

#[cfg(test)]
mod convergence_tests {
    use super::*;

    #[tokio::test]
    async fn test_device_and_cloud_converge() {
        let mesh = mesh(options());
        mesh.device.write_local_at(TABLE, "a", 100, Some(json!({"title": "a"}))).await;
        mesh.device.write_local_at(TABLE, "b", 100, Some(json!({"title": "b"}))).await;
        mesh.cloud.write_local_at(TABLE, "c", 100, Some(json!({"title": "c"}))).await;

        mesh.sync().await;
        mesh.sync().await;

        let device = payloads(mesh.device.rows(TABLE).await);
        let cloud = payloads(mesh.cloud.rows(TABLE).await);
        assert_eq!(device.len(), 3);
        assert_eq!(device, cloud);

        // Uploaded rows carry the id the cloud handed out.
        let a_device = mesh.device.row(TABLE, "a").await.unwrap();
        let a_cloud = mesh.cloud.row(TABLE, "a").await.unwrap();
        assert!(!a_device.info.cloud_gid.is_empty());
        assert_eq!(a_device.info.cloud_gid, a_cloud.info.cloud_gid);
    }

    #[tokio::test]
    async fn test_quiet_after_convergence() {
        let mesh = mesh(options());
        mesh.device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;
        mesh.sync().await;
        mesh.sync().await;

        let cancel = CancellationToken::new();
        let up = mesh.up.run_round("cloud", TABLE, &cancel).await.unwrap();
        let down = mesh.down.run_round("device", TABLE, &cancel).await.unwrap();
        assert_eq!(up.scanned + down.scanned, 0);
    }

    #[tokio::test]
    async fn test_newer_edit_wins_both_ways() {
        let mesh = mesh(options());
        mesh.device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;
        mesh.sync().await;

        mesh.cloud.write_local_at(TABLE, "a", 200, Some(json!({"v": 2}))).await;
        mesh.sync().await;
        assert_eq!(
            mesh.device.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": 2}))
        );

        mesh.device.write_local_at(TABLE, "a", 300, Some(json!({"v": 3}))).await;
        mesh.sync().await;
        assert_eq!(
            mesh.cloud.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": 3}))
        );
    }

    #[tokio::test]
    async fn test_delete_propagates_as_tombstone() {
        let mesh = mesh(options());
        mesh.device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;
        mesh.sync().await;

        mesh.device.write_local_at(TABLE, "a", 200, None).await;
        mesh.sync().await;

        let cloud = mesh.cloud.row(TABLE, "a").await.unwrap();
        assert!(cloud.info.is_deleted());
        assert_eq!(cloud.payload, None);
    }

    #[tokio::test]
    async fn test_sqlite_replicas_converge() {
        let device = Arc::new(
            SqliteStorage::connect("sqlite::memory:", Origin::Device)
                .await
                .unwrap(),
        );
        let cloud = Arc::new(
            SqliteStorage::connect("sqlite::memory:", Origin::Cloud)
                .await
                .unwrap(),
        );
        let to_cloud = LoopbackTransport::new("cloud", Arc::new(Replica::new(cloud.clone())));
        let to_device = LoopbackTransport::new("device", Arc::new(Replica::new(device.clone())));
        let up = ReconciliationDriver::new(device.clone(), Arc::new(to_cloud), options());
        let down = ReconciliationDriver::new(cloud.clone(), Arc::new(to_device), options());

        device
            .write_local_at(TABLE, "a", 100, Some(json!({"v": "device"})))
            .await
            .unwrap();
        cloud
            .write_local_at(TABLE, "b", 100, Some(json!({"v": "cloud"})))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        for _ in 0..2 {
            up.run_round("cloud", TABLE, &cancel).await.unwrap();
            down.run_round("device", TABLE, &cancel).await.unwrap();
        }

        let device_rows = payloads(device.rows(TABLE).await.unwrap());
        let cloud_rows = payloads(cloud.rows(TABLE).await.unwrap());
        assert_eq!(device_rows.len(), 2);
        assert_eq!(device_rows, cloud_rows);

        let marks = up.tracker().read("cloud", TABLE).await.unwrap();
        assert!(marks.live > 0);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_send_failure_keeps_watermark_and_local_writes() {
        let device = Arc::new(MemoryStorage::new(Origin::Device));
        let cloud = Arc::new(MemoryStorage::new(Origin::Cloud));
        let transport = Arc::new(FlakyTransport {
            inner: cloud_link(&cloud),
            failing: AtomicBool::new(true),
        });
        let driver = ReconciliationDriver::new(device.clone(), transport.clone(), options());

        device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;
        device.write_local_at(TABLE, "b", 100, Some(json!({"v": 1}))).await;
        cloud.write_local_at(TABLE, "a", 200, Some(json!({"v": 2}))).await;

        let cancel = CancellationToken::new();
        let err = driver.run_round("cloud", TABLE, &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert!(err.is_retryable());

        // The local write landed; the watermark did not move.
        assert_eq!(
            device.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": 2}))
        );
        assert_eq!(
            driver.tracker().read("cloud", TABLE).await.unwrap(),
            Watermarks::default()
        );
        assert!(cloud.row(TABLE, "b").await.is_none());

        transport.failing.store(false, Ordering::SeqCst);
        let report = driver.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(report.local_writes, 0);
        assert_eq!(report.remote_writes, 1);
        assert!(cloud.row(TABLE, "b").await.is_some());
    }

    #[tokio::test]
    async fn test_timeout_fails_round() {
        let device = Arc::new(MemoryStorage::new(Origin::Device));
        let cloud = Arc::new(MemoryStorage::new(Origin::Cloud));
        let slow = cloud_link(&cloud).with_latency(Duration::from_millis(300));
        let driver = ReconciliationDriver::new(
            device.clone(),
            Arc::new(slow),
            DriverOptions {
                transport_timeout: Duration::from_millis(30),
                ..options()
            },
        );
        device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;

        let err = driver
            .run_round("cloud", TABLE, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout("fetch")));
        assert!(err.is_retryable());
        assert_eq!(
            driver.tracker().read("cloud", TABLE).await.unwrap(),
            Watermarks::default()
        );
        assert!(cloud.rows(TABLE).await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_exchange() {
        let device = Arc::new(MemoryStorage::new(Origin::Device));
        let cloud = Arc::new(MemoryStorage::new(Origin::Cloud));
        let slow = cloud_link(&cloud).with_latency(Duration::from_millis(500));
        let driver = ReconciliationDriver::new(device.clone(), Arc::new(slow), options());
        device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;

        let cancel = CancellationToken::new();
        let round = {
            let driver = driver.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { driver.run_round("cloud", TABLE, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let err = round.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(
            driver.tracker().read("cloud", TABLE).await.unwrap(),
            Watermarks::default()
        );
    }

    #[tokio::test]
    async fn test_unauthorized_peer_is_refused() {
        let mesh = mesh(options());
        mesh.device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;

        let err = mesh
            .up
            .run_round("someone-else", TABLE, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized(_)));
        assert!(!err.is_retryable());
    }
}

#[cfg(test)]
mod watermark_tests {
    use super::*;

    fn raw(key: &str, wts: u64) -> ChangeRow {
        ChangeRow::live(
            LogInfo::new(key, 100, wts).with_flags(LogFlags::LOCAL),
            json!({ "key": key }),
        )
    }

    #[tokio::test]
    async fn test_stalled_lane_widens_then_errors() {
        let device = Arc::new(MemoryStorage::new(Origin::Device));
        let cloud = Arc::new(MemoryStorage::new(Origin::Cloud));
        for key in ["a", "b", "c"] {
            device.put_raw(TABLE, raw(key, 10)).await;
        }
        let narrow = DriverOptions {
            batch_limit: 1,
            max_batch_limit: 2,
            ..options()
        };
        let driver =
            ReconciliationDriver::new(device.clone(), Arc::new(cloud_link(&cloud)), narrow);
        let cancel = CancellationToken::new();

        // The first truncated scan can still move up to the shared stamp.
        let first = driver.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(first.scanned, 1);
        assert_eq!(first.committed, Some(Watermarks::new(10, 0)));

        let err = driver.run_round("cloud", TABLE, &cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::WatermarkStalled { limit: 2, .. }));

        let wide = ReconciliationDriver::new(
            device.clone(),
            Arc::new(cloud_link(&cloud)),
            DriverOptions {
                max_batch_limit: 4,
                ..narrow
            },
        );
        let report = wide.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.committed, Some(Watermarks::new(11, 0)));
        assert_eq!(cloud.rows(TABLE).await.len(), 3);
    }

    #[tokio::test]
    async fn test_tombstone_burst_does_not_starve_live_rows() {
        let mesh = mesh(DriverOptions {
            batch_limit: 2,
            ..options()
        });
        for i in 0..6 {
            let key = format!("d{i}");
            mesh.device.write_local_at(TABLE, &key, 100, Some(json!({}))).await;
        }
        mesh.sync().await;
        mesh.sync().await;
        mesh.sync().await;
        for i in 0..6 {
            mesh.device.write_local_at(TABLE, &format!("d{i}"), 200, None).await;
        }
        mesh.device.write_local_at(TABLE, "fresh", 200, Some(json!({"v": 1}))).await;

        let report = mesh
            .up
            .run_round("cloud", TABLE, &CancellationToken::new())
            .await
            .unwrap();
        // Each lane is capped on its own.
        assert_eq!(report.scanned, 3);
        assert!(mesh.cloud.row(TABLE, "fresh").await.is_some());
    }

    #[tokio::test]
    async fn test_same_pair_rounds_are_serialized() {
        let mesh = mesh(options());
        mesh.device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;
        let fence = mesh.up.tracker().acquire("cloud", TABLE).await;

        let round = {
            let driver = mesh.up.clone();
            tokio::spawn(async move {
                driver
                    .run_round("cloud", TABLE, &CancellationToken::new())
                    .await
            })
        };

        // A different table is not held up.
        let other = tokio::time::timeout(
            Duration::from_secs(2),
            mesh.up.run_round("cloud", "users", &CancellationToken::new()),
        )
        .await;
        assert!(other.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!round.is_finished());
        assert!(mesh.cloud.rows(TABLE).await.is_empty());

        drop(fence);
        let report = round.await.unwrap().unwrap();
        assert_eq!(report.remote_writes, 1);
    }
}

#[cfg(test)]
mod strategy_tests {
    use super::*;

    #[tokio::test]
    async fn test_force_push_overwrites_peer() {
        let mesh = mesh(DriverOptions {
            strategy: SyncStrategy::force_push(),
            ..options()
        });
        mesh.device.write_local_at(TABLE, "a", 100, Some(json!({"v": "mine"}))).await;
        mesh.cloud.write_local_at(TABLE, "a", 500, Some(json!({"v": "theirs"}))).await;

        let report = mesh
            .up
            .run_round("cloud", TABLE, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.remote_writes, 1);
        assert_eq!(report.local_writes, 0);
        assert_eq!(
            mesh.cloud.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": "mine"}))
        );
        assert_eq!(
            mesh.device.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": "mine"}))
        );
    }

    #[tokio::test]
    async fn test_locked_row_retried_after_unlock() {
        let mesh = mesh(options());
        mesh.device.write_local_at(TABLE, "a", 100, Some(json!({"v": 1}))).await;
        mesh.cloud.write_local_at(TABLE, "a", 200, Some(json!({"v": 2}))).await;
        assert!(mesh.device.set_status(TABLE, "a", LogStatus::Locked).await);

        let cancel = CancellationToken::new();
        let report = mesh.up.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(report.locked, 1);
        assert_eq!(
            mesh.device.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": 1}))
        );

        assert!(mesh.device.set_status(TABLE, "a", LogStatus::Normal).await);
        let report = mesh.up.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(report.local_writes, 1);
        assert_eq!(
            mesh.device.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": 2}))
        );
    }

    #[tokio::test]
    async fn test_authoritative_remote_overrides_newer_local_edit() {
        let mesh = mesh(DriverOptions {
            remote_is_authoritative: true,
            ..options()
        });
        mesh.cloud.write_local_at(TABLE, "a", 100, Some(json!({"v": "cloud"}))).await;
        mesh.device.write_local_at(TABLE, "a", 300, Some(json!({"v": "device"}))).await;

        mesh.up
            .run_round("cloud", TABLE, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            mesh.device.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": "cloud"}))
        );
    }
}

#[cfg(test)]
mod in_flight_tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq)]
    enum EditPoint {
        Fetch,
        Send,
    }

    /// Edits the device's `a` once, while the round waits on the exchange.
    struct EditingTransport {
        inner: LoopbackTransport,
        device: Arc<MemoryStorage>,
        at: EditPoint,
        armed: AtomicBool,
    }

    impl EditingTransport {
        async fn edit(&self, point: EditPoint) {
            if point == self.at && self.armed.swap(false, Ordering::SeqCst) {
                self.device
                    .write_local_at(TABLE, "a", 30, Some(json!({"v": "device-new"})))
                    .await;
            }
        }
    }

    #[async_trait]
    impl Transport for EditingTransport {
        fn peer_origin(&self, peer: &str) -> Origin {
            self.inner.peer_origin(peer)
        }

        async fn fetch_remote_log_info(
            &self,
            peer: &str,
            table: &str,
            keys: &[RecordKey],
        ) -> tidemark_sync::Result<HashMap<RecordKey, ChangeRow>> {
            let remote = self.inner.fetch_remote_log_info(peer, table, keys).await?;
            self.edit(EditPoint::Fetch).await;
            Ok(remote)
        }

        async fn send(&self, peer: &str, batch: SendBatch) -> tidemark_sync::Result<SendAck> {
            self.edit(EditPoint::Send).await;
            self.inner.send(peer, batch).await
        }
    }

    fn editing_driver(
        device: &Arc<MemoryStorage>,
        cloud: &Arc<MemoryStorage>,
        at: EditPoint,
    ) -> ReconciliationDriver {
        let transport = EditingTransport {
            inner: cloud_link(cloud),
            device: device.clone(),
            at,
            armed: AtomicBool::new(true),
        };
        ReconciliationDriver::new(device.clone(), Arc::new(transport), options())
    }

    #[tokio::test]
    async fn test_edit_during_fetch_is_not_overwritten() {
        let device = Arc::new(MemoryStorage::new(Origin::Device));
        let cloud = Arc::new(MemoryStorage::new(Origin::Cloud));
        device
            .write_local_at(TABLE, "a", 10, Some(json!({"v": "device-old"})))
            .await;
        cloud
            .put_raw(
                TABLE,
                ChangeRow::live(LogInfo::new("a", 20, 20).with_gid("g"), json!({"v": "cloud"})),
            )
            .await;
        let driver = editing_driver(&device, &cloud, EditPoint::Fetch);
        let cancel = CancellationToken::new();

        // The round decided to adopt the cloud value against the ts 10 row.
        let report = driver.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(report.local_writes, 1);
        assert_eq!(report.stale, 1);

        let row = device.row(TABLE, "a").await.unwrap();
        assert_eq!(row.info.timestamp, 30);
        assert_eq!(row.payload, Some(json!({"v": "device-new"})));

        // The edit sits above the committed watermark and goes up next round.
        let report = driver.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.remote_writes, 1);
        assert_eq!(report.stale, 0);
        assert_eq!(
            cloud.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": "device-new"}))
        );
        assert_eq!(
            device.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": "device-new"}))
        );
    }

    #[tokio::test]
    async fn test_edit_during_send_survives_receipt() {
        let device = Arc::new(MemoryStorage::new(Origin::Device));
        let cloud = Arc::new(MemoryStorage::new(Origin::Cloud));
        device
            .write_local_at(TABLE, "a", 10, Some(json!({"v": "device-old"})))
            .await;
        let driver = editing_driver(&device, &cloud, EditPoint::Send);
        let cancel = CancellationToken::new();

        let report = driver.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(report.remote_writes, 1);
        assert_eq!(
            cloud.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": "device-old"}))
        );

        // The receipt only fills in the upload bookkeeping.
        let row = device.row(TABLE, "a").await.unwrap();
        let uploaded = cloud.row(TABLE, "a").await.unwrap();
        assert_eq!(row.payload, Some(json!({"v": "device-new"})));
        assert_eq!(row.info.timestamp, 30);
        assert_eq!(row.info.cloud_gid, uploaded.info.cloud_gid);
        assert!(row.info.flags.contains(LogFlags::LOCAL));
        let committed = report.committed.unwrap();
        assert!(row.info.write_timestamp >= committed.live);

        let report = driver.run_round("cloud", TABLE, &cancel).await.unwrap();
        assert_eq!(report.remote_writes, 1);
        assert_eq!(
            cloud.row(TABLE, "a").await.unwrap().payload,
            Some(json!({"v": "device-new"}))
        );
    }
}
