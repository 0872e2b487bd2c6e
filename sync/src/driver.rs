//! Reconciliation rounds.
//!
//! A round reconciles one (peer, table) pair: it scans local changes above
//! the pair's watermarks, resolves them against the peer's copies, applies
//! the local side, ships the rest and finally commits the watermarks.
//!
//! ```text
//! Idle -> Scanning -> Resolving -> Applying -> Committing -> Idle
//!            \            \            \            \
//!             +------------+------------+------------+--> Failed
//! ```
//!
//! A failed round stays `Failed` until the pair's next round starts.
//!
//! Cancellation and transport deadlines are honoured up to the commit. The
//! commit runs in its own task, so once it starts nothing interrupts it.

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::scheduler::Scheduler;
use crate::storage::{ApplyBatch, ApplyOutcome, ChangeBatch, Storage, WriteOp};
use crate::transport::{SendBatch, Transport};
use crate::watermark::{PairFence, WatermarkTracker};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tidemark_engine::{
    Candidate, Lane, PeerId, ReconcilePlan, Reconciler, SyncStrategy, SyncTimeRange, TableName,
    UpdateWaterMark, Watermarks,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Tunables for a driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverOptions {
    /// Rows per lane in one scan
    pub batch_limit: usize,
    /// Ceiling for widening a stalled scan
    pub max_batch_limit: usize,
    /// Deadline for each transport call
    pub transport_timeout: Duration,
    pub strategy: SyncStrategy,
    pub remote_is_authoritative: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            batch_limit: 500,
            max_batch_limit: 8000,
            transport_timeout: Duration::from_secs(10),
            strategy: SyncStrategy::default(),
            remote_is_authoritative: false,
        }
    }
}

impl From<&Config> for DriverOptions {
    fn from(config: &Config) -> Self {
        Self {
            batch_limit: config.batch_limit,
            max_batch_limit: config.max_batch_limit,
            transport_timeout: config.transport_timeout,
            strategy: config.strategy,
            remote_is_authoritative: config.remote_is_authoritative,
        }
    }
}

/// Where a pair's current round is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundPhase {
    Idle,
    Scanning,
    Resolving,
    Applying,
    Committing,
    Failed,
}

/// Summary of one finished round.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundReport {
    pub round_id: Uuid,
    pub peer: PeerId,
    pub table: TableName,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Rows returned by the scan
    pub scanned: usize,
    pub local_writes: usize,
    pub bookkeeping: usize,
    pub remote_writes: usize,
    pub skipped: usize,
    /// Skipped rows that were locked
    pub locked: usize,
    /// Writes dropped because the row was edited while the round ran
    pub stale: usize,
    /// Watermarks after the commit; `None` when the strategy keeps no cursor
    pub committed: Option<Watermarks>,
}

#[derive(Clone)]
struct Round {
    id: Uuid,
    peer: PeerId,
    table: TableName,
    started_at: DateTime<Utc>,
}

/// A scan whose watermarks can advance.
struct Scan {
    batch: ChangeBatch,
    prior: Watermarks,
    range: SyncTimeRange,
    update: UpdateWaterMark,
}

/// Drives reconciliation rounds for one local replica.
///
/// Cloning is cheap; clones share fences and phase tracking.
#[derive(Clone)]
pub struct ReconciliationDriver {
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    tracker: Arc<WatermarkTracker>,
    options: DriverOptions,
    phases: Arc<DashMap<(PeerId, TableName), (Uuid, RoundPhase)>>,
}

impl ReconciliationDriver {
    pub fn new(
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        options: DriverOptions,
    ) -> Self {
        Self {
            tracker: Arc::new(WatermarkTracker::new(storage.clone())),
            storage,
            transport,
            options,
            phases: Arc::new(DashMap::new()),
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn tracker(&self) -> &Arc<WatermarkTracker> {
        &self.tracker
    }

    /// Phase of the latest round for a pair.
    ///
    /// `Idle` once a round finished, `Failed` after an error until the next
    /// round for the pair starts.
    pub fn phase(&self, peer: &str, table: &str) -> RoundPhase {
        self.phases
            .get(&(peer.to_string(), table.to_string()))
            .map_or(RoundPhase::Idle, |entry| entry.1)
    }

    /// Hand a round to `scheduler`. The receiver resolves when it finishes.
    pub fn submit(
        &self,
        scheduler: &dyn Scheduler,
        peer: impl Into<PeerId>,
        table: impl Into<TableName>,
        cancel: CancellationToken,
    ) -> Result<oneshot::Receiver<Result<RoundReport>>> {
        let (tx, rx) = oneshot::channel();
        let driver = self.clone();
        let (peer, table) = (peer.into(), table.into());
        scheduler.run_now(Box::pin(async move {
            let result = driver.run_round(&peer, &table, &cancel).await;
            // The submitter may have stopped listening.
            let _ = tx.send(result);
        }))?;
        Ok(rx)
    }

    /// Run one round for `(peer, table)` and wait for it.
    ///
    /// A second round for the same pair waits until the first has finished.
    /// On error no watermark was committed and the round can be retried.
    pub async fn run_round(
        &self,
        peer: &str,
        table: &str,
        cancel: &CancellationToken,
    ) -> Result<RoundReport> {
        let round = Round {
            id: Uuid::new_v4(),
            peer: peer.to_string(),
            table: table.to_string(),
            started_at: Utc::now(),
        };
        let span = tracing::info_span!("round", round_id = %round.id, peer = %peer, table = %table);

        async {
            let result = self.execute(&round, cancel).await;
            match &result {
                Ok(report) => {
                    tracing::info!(
                        scanned = report.scanned,
                        local_writes = report.local_writes,
                        remote_writes = report.remote_writes,
                        skipped = report.skipped,
                        stale = report.stale,
                        "Round finished"
                    );
                    self.leave(&round);
                }
                Err(e) => {
                    self.mark_failed(&round);
                    tracing::warn!(error = %e, retryable = e.is_retryable(), "Round failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, round: &Round, cancel: &CancellationToken) -> Result<RoundReport> {
        let fence = cancellable(cancel, async {
            Ok(self.tracker.acquire(&round.peer, &round.table).await)
        })
        .await?;
        tracing::debug!("Round started");

        self.enter(round, RoundPhase::Scanning);
        let prior = self.tracker.read(&round.peer, &round.table).await?;
        let scan = cancellable(cancel, self.scan(&fence, prior)).await?;
        let scanned = scan.batch.rows.len();

        self.enter(round, RoundPhase::Resolving);
        let strategy = self.options.strategy;
        let Scan {
            batch,
            prior,
            range,
            update,
        } = scan;
        let plan = if strategy.should_download() {
            let keys = batch.keys();
            let remote = self
                .exchange(
                    "fetch",
                    cancel,
                    self.transport
                        .fetch_remote_log_info(&round.peer, &round.table, &keys),
                )
                .await?;
            Reconciler::new(strategy, self.options.remote_is_authoritative)
                .plan(Candidate::join(batch.rows, remote.into_values()))?
        } else {
            ReconcilePlan::push_all(batch.rows)
        };

        let mut report = RoundReport {
            round_id: round.id,
            peer: round.peer.clone(),
            table: round.table.clone(),
            started_at: round.started_at,
            finished_at: round.started_at,
            scanned,
            local_writes: plan.local_writes.len(),
            bookkeeping: plan.bookkeeping.len(),
            remote_writes: plan.remote_writes.len(),
            skipped: plan.skipped.len(),
            locked: plan.locked(),
            stale: 0,
            committed: None,
        };
        if report.locked > 0 {
            tracing::debug!(locked = report.locked, "Locked rows left for a later round");
        }

        self.enter(round, RoundPhase::Applying);
        let source = self.transport.peer_origin(&round.peer);
        let local: Vec<WriteOp> = plan
            .local_writes
            .into_iter()
            .map(WriteOp::Data)
            .chain(plan.bookkeeping.into_iter().map(WriteOp::Bookkeeping))
            .collect();

        let final_writes = if plan.remote_writes.is_empty() {
            ApplyBatch::new(source, local)
        } else {
            let applied = self
                .tracker
                .apply(&fence, ApplyBatch::new(source, local))
                .await?;
            report.stale += applied.stale;
            let outgoing = SendBatch {
                table: round.table.clone(),
                origin: self.storage.origin(),
                strategy,
                rows: plan.remote_writes,
            };
            let ack = self
                .exchange("send", cancel, self.transport.send(&round.peer, outgoing))
                .await?;
            let receipts = ack.receipts.into_iter().map(WriteOp::Receipt).collect();
            ApplyBatch::new(source, receipts)
        };

        self.enter(round, RoundPhase::Committing);
        let outcome = self
            .commit(fence, prior, range, update, final_writes)
            .await?;

        report.stale += outcome.stale;
        report.committed = outcome.watermarks;
        if report.stale > 0 {
            tracing::info!(stale = report.stale, "Rows edited mid-round left for the next round");
        }
        report.finished_at = Utc::now();
        Ok(report)
    }

    /// Scan above `prior`, widening the cap while a truncated lane cannot
    /// advance.
    async fn scan(&self, fence: &PairFence, prior: Watermarks) -> Result<Scan> {
        let mut limit = self.options.batch_limit;
        loop {
            let batch = self.storage.scan_changes(fence.table(), prior, limit).await?;
            let (range, update) = WatermarkTracker::time_range(&batch, prior);
            if !stalled(prior, &range, update) {
                return Ok(Scan {
                    batch,
                    prior,
                    range,
                    update,
                });
            }
            if limit >= self.options.max_batch_limit {
                return Err(SyncError::WatermarkStalled {
                    peer: fence.peer().to_string(),
                    table: fence.table().to_string(),
                    limit,
                });
            }
            limit = limit.saturating_mul(2).min(self.options.max_batch_limit);
            tracing::debug!(limit, "Widening stalled scan");
        }
    }

    /// Apply the round's last writes and advance the watermarks.
    ///
    /// Runs in its own task and owns the fence, so it completes even when the
    /// round's future is dropped.
    async fn commit(
        &self,
        fence: PairFence,
        prior: Watermarks,
        range: SyncTimeRange,
        update: UpdateWaterMark,
        batch: ApplyBatch,
    ) -> Result<ApplyOutcome> {
        let tracker = self.tracker.clone();
        let advance = self.options.strategy.should_update_cursor();
        let task = tokio::spawn(
            async move {
                let outcome = if advance {
                    tracker.commit(&fence, prior, range, update, batch).await
                } else {
                    tracker.apply(&fence, batch).await
                };
                drop(fence);
                outcome
            }
            .in_current_span(),
        );
        task.await
            .map_err(|e| SyncError::Scheduler(e.to_string()))?
    }

    /// Run a transport call under the round's deadline and cancellation.
    async fn exchange<T>(
        &self,
        what: &'static str,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let deadline = self.options.transport_timeout;
        cancellable(cancel, async move {
            tokio::time::timeout(deadline, call)
                .await
                .map_err(|_| SyncError::Timeout(what))?
        })
        .await
    }

    fn enter(&self, round: &Round, phase: RoundPhase) {
        tracing::debug!(phase = ?phase, "Round phase");
        self.phases
            .insert((round.peer.clone(), round.table.clone()), (round.id, phase));
    }

    /// Record the failure unless a queued round for the pair already started.
    fn mark_failed(&self, round: &Round) {
        let key = (round.peer.clone(), round.table.clone());
        let mut entry = self.phases.entry(key).or_insert((round.id, RoundPhase::Failed));
        if entry.0 == round.id {
            entry.1 = RoundPhase::Failed;
            tracing::debug!(phase = ?RoundPhase::Failed, "Round phase");
        }
    }

    /// Back to idle, unless a queued round for the pair already started.
    fn leave(&self, round: &Round) {
        let key = (round.peer.clone(), round.table.clone());
        self.phases.remove_if(&key, |_, (id, _)| *id == round.id);
    }
}

/// A truncated lane whose watermark would not move.
fn stalled(prior: Watermarks, range: &SyncTimeRange, update: UpdateWaterMark) -> bool {
    let next = prior.advance(range, update);
    Lane::BOTH
        .into_iter()
        .any(|lane| !update.get(lane) && next.get(lane) == prior.get(lane))
}

/// Race `work` against cancellation. Cancellation wins ties.
async fn cancellable<T>(
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = work => result,
    }
}
