//! Batch planning and the scheduler state machine.
//!
//! `Idle -> Planning -> Running -> Draining -> (Planning | Done)`, with a
//! stop request returning to `Idle` from anywhere.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::client::RemoteClient;
use crate::dedup::DedupGate;
use crate::engine::ScanOptions;
use crate::events::{BatchProgress, EventSink, LogLevel};
use crate::worker::{ScanWorker, WorkCompleted, WorkerReport};

/// Identifiers handed to one worker per batch.
pub const BLOCK_SIZE: u64 = 100;

/// Inclusive descending range `start..=end`, `start >= end >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    /// Number of identifiers covered; never zero.
    pub fn count(&self) -> u64 {
        self.start - self.end + 1
    }

    pub fn contains(&self, id: u64) -> bool {
        (self.end..=self.start).contains(&id)
    }

    /// Identifiers in scan order, highest first.
    pub fn iter_desc(&self) -> impl Iterator<Item = u64> {
        (self.end..=self.start).rev()
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Planning,
    Running,
    Draining,
    Done,
}

impl SchedulerState {
    /// Terminal states accept a fresh start.
    pub fn is_terminal(self) -> bool {
        matches!(self, SchedulerState::Idle | SchedulerState::Done)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub blocks: Vec<BlockRange>,
    /// Pointer for the next batch; 0 once every identifier is assigned.
    pub next_remaining: u64,
}

/// Split the top of `1..=remaining` into at most `workers` blocks.
///
/// Identifier 0 is never assigned.
pub fn plan_batch(remaining: u64, workers: usize, block_size: u64) -> BatchPlan {
    let block_size = block_size.max(1);
    let blocks = remaining.div_ceil(block_size);
    let active = blocks.min(workers.max(1) as u64);

    let mut ranges = Vec::with_capacity(active as usize);
    let mut top = remaining;
    for _ in 0..active {
        let floor = top.saturating_sub(block_size - 1).max(1);
        ranges.push(BlockRange {
            start: top,
            end: floor,
        });
        top = floor - 1;
    }

    BatchPlan {
        blocks: ranges,
        next_remaining: top,
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Every identifier down to 1 was handed out and worked.
    Exhausted,
    /// A stop request ended the run early.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub batches: u32,
    pub resolved: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Lowest identifier not yet handed to a worker.
    pub remaining: u64,
}

/// Drives successive batches of [`ScanWorker`]s until the identifier space
/// is exhausted or the run is cancelled.
pub struct BatchScheduler {
    run_id: Uuid,
    top_id: u64,
    workers: usize,
    interval: Duration,
    options: ScanOptions,
    client: Arc<dyn RemoteClient>,
    dedup: Arc<DedupGate>,
    events: EventSink,
    state: Arc<watch::Sender<SchedulerState>>,
    cancel: CancellationToken,
}

struct BatchContext {
    batch: u32,
    ranges: Vec<BlockRange>,
    completed: usize,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: Uuid,
        top_id: u64,
        workers: usize,
        interval: Duration,
        options: ScanOptions,
        client: Arc<dyn RemoteClient>,
        dedup: Arc<DedupGate>,
        events: EventSink,
        state: Arc<watch::Sender<SchedulerState>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            top_id,
            workers,
            interval,
            options,
            client,
            dedup,
            events,
            state,
            cancel,
        }
    }

    fn set_state(&self, state: SchedulerState) {
        debug!(run_id = %self.run_id, ?state, "scheduler state");
        self.state.send_replace(state);
    }

    fn publish(&self, state: SchedulerState, ctx: &BatchContext, remaining: u64) {
        self.events.progress(BatchProgress {
            run_id: self.run_id,
            batch: ctx.batch,
            state,
            ranges: ctx.ranges.clone(),
            active_workers: ctx.ranges.len(),
            completed_workers: ctx.completed,
            remaining,
        });
    }

    #[instrument(skip_all, fields(run_id = %self.run_id, top_id = self.top_id))]
    pub async fn run(self) -> RunSummary {
        let mut summary = RunSummary {
            outcome: RunOutcome::Stopped,
            batches: 0,
            resolved: 0,
            skipped: 0,
            failed: 0,
            remaining: self.top_id,
        };

        loop {
            if self.cancel.is_cancelled() {
                return self.stopped(summary);
            }

            self.set_state(SchedulerState::Planning);
            let plan = plan_batch(
                summary.remaining,
                self.workers,
                self.options.block_size,
            );
            if plan.blocks.is_empty() {
                return self.exhausted(summary);
            }

            summary.batches += 1;
            summary.remaining = plan.next_remaining;
            let mut ctx = BatchContext {
                batch: summary.batches,
                ranges: plan.blocks,
                completed: 0,
            };
            let listing: Vec<String> = ctx.ranges.iter().map(|r| r.to_string()).collect();
            self.events.info(
                None,
                format!(
                    "batch {} planned: {} worker(s) on {}",
                    ctx.batch,
                    ctx.ranges.len(),
                    listing.join(", ")
                ),
            );
            self.publish(SchedulerState::Planning, &ctx, summary.remaining);

            let (done_tx, mut done_rx) = mpsc::unbounded_channel::<WorkCompleted>();
            let mut set = JoinSet::new();
            for (k, range) in ctx.ranges.iter().enumerate() {
                let worker = ScanWorker::new(
                    k,
                    *range,
                    self.interval,
                    self.client.clone(),
                    self.dedup.clone(),
                    self.events.clone(),
                    self.cancel.clone(),
                );
                set.spawn(worker.run(done_tx.clone()));
            }
            drop(done_tx);

            self.set_state(SchedulerState::Running);
            self.publish(SchedulerState::Running, &ctx, summary.remaining);

            while ctx.completed < ctx.ranges.len() {
                tokio::select! {
                    msg = done_rx.recv() => match msg {
                        Some(done) => {
                            ctx.completed += 1;
                            self.on_completed(&done);
                            self.publish(SchedulerState::Running, &ctx, summary.remaining);
                        }
                        // every notice sender is gone; nothing more will arrive
                        None => break,
                    },
                    _ = self.cancel.cancelled() => break,
                }
            }

            if self.cancel.is_cancelled() {
                self.shutdown(&mut set, &mut summary).await;
                return self.stopped(summary);
            }

            self.set_state(SchedulerState::Draining);
            self.publish(SchedulerState::Draining, &ctx, summary.remaining);
            self.drain(&mut set, &mut summary).await;
            self.events.info(None, format!("batch {} finished", ctx.batch));

            if summary.remaining == 0 {
                return self.exhausted(summary);
            }

            tokio::select! {
                _ = time::sleep(self.options.batch_delay) => {}
                _ = self.cancel.cancelled() => return self.stopped(summary),
            }
        }
    }

    fn on_completed(&self, done: &WorkCompleted) {
        let level = if done.unwound {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        let last = done
            .report
            .last_processed
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".into());
        self.events.log(
            level,
            Some(done.worker),
            format!(
                "worker {} completed {} (last processed: {}, resolved {}, skipped {}, failed {}{})",
                done.worker,
                done.range,
                last,
                done.report.resolved,
                done.report.skipped,
                done.report.failed,
                if done.unwound { ", unwound abnormally" } else { "" },
            ),
        );
    }

    fn absorb(&self, joined: Result<WorkerReport, tokio::task::JoinError>, summary: &mut RunSummary) {
        match joined {
            Ok(report) => {
                summary.resolved += report.resolved;
                summary.skipped += report.skipped;
                summary.failed += report.failed;
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => self
                .events
                .log(LogLevel::Error, None, format!("worker task failed: {}", err)),
        }
    }

    /// Reap finished worker handles, polling until the set is empty or the
    /// drain timeout passes. Stragglers are aborted.
    async fn drain(&self, set: &mut JoinSet<WorkerReport>, summary: &mut RunSummary) {
        let deadline = Instant::now() + self.options.drain_timeout;
        while !set.is_empty() {
            if Instant::now() >= deadline {
                self.events.warn(
                    None,
                    format!("{} worker(s) still active after drain timeout; aborting", set.len()),
                );
                set.abort_all();
                while let Some(joined) = set.join_next().await {
                    self.absorb(joined, summary);
                }
                break;
            }
            match time::timeout(self.options.drain_poll, set.join_next()).await {
                Ok(Some(joined)) => self.absorb(joined, summary),
                Ok(None) => break,
                Err(_) => debug!(active = set.len(), "workers still unwinding"),
            }
        }
    }

    /// Wait for cancelled workers to exit, bounded by the join timeout.
    async fn shutdown(&self, set: &mut JoinSet<WorkerReport>, summary: &mut RunSummary) {
        let joined = time::timeout(self.options.join_timeout, async {
            let mut reports = Vec::new();
            while let Some(joined) = set.join_next().await {
                reports.push(joined);
            }
            reports
        })
        .await;
        match joined {
            Ok(reports) => {
                for r in reports {
                    self.absorb(r, summary);
                }
            }
            Err(_) => {
                self.events.warn(
                    None,
                    format!("{} worker(s) did not exit within join timeout; aborting", set.len()),
                );
                set.abort_all();
            }
        }
    }

    fn stopped(&self, mut summary: RunSummary) -> RunSummary {
        summary.outcome = RunOutcome::Stopped;
        self.set_state(SchedulerState::Idle);
        self.events.info(None, "scan stopped");
        summary
    }

    fn exhausted(&self, mut summary: RunSummary) -> RunSummary {
        summary.outcome = RunOutcome::Exhausted;
        summary.remaining = 0;
        self.set_state(SchedulerState::Done);
        self.events.info(
            None,
            format!(
                "all identifiers processed ({} batch(es), {} resolved, {} skipped, {} failed)",
                summary.batches, summary.resolved, summary.skipped, summary.failed
            ),
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_blocks(top: u64, workers: usize) -> Vec<BlockRange> {
        let mut remaining = top;
        let mut out = Vec::new();
        loop {
            let plan = plan_batch(remaining, workers, BLOCK_SIZE);
            if plan.blocks.is_empty() {
                break;
            }
            assert!(plan.blocks.len() <= workers);
            out.extend(plan.blocks);
            remaining = plan.next_remaining;
        }
        out
    }

    #[test]
    fn first_batch_for_250_with_three_workers() {
        let plan = plan_batch(250, 3, BLOCK_SIZE);
        assert_eq!(
            plan.blocks,
            vec![
                BlockRange { start: 250, end: 151 },
                BlockRange { start: 150, end: 51 },
                BlockRange { start: 50, end: 1 },
            ]
        );
        assert_eq!(plan.next_remaining, 0);
    }

    #[test]
    fn workers_capped_by_block_count() {
        let plan = plan_batch(120, 8, BLOCK_SIZE);
        assert_eq!(plan.blocks.len(), 2);
        assert_eq!(plan.blocks[1], BlockRange { start: 20, end: 1 });
    }

    #[test]
    fn remaining_carries_to_next_batch() {
        let plan = plan_batch(1000, 2, BLOCK_SIZE);
        assert_eq!(plan.blocks[1], BlockRange { start: 900, end: 801 });
        assert_eq!(plan.next_remaining, 800);
    }

    #[test]
    fn zero_and_one() {
        assert!(plan_batch(0, 3, BLOCK_SIZE).blocks.is_empty());
        let plan = plan_batch(1, 3, BLOCK_SIZE);
        assert_eq!(plan.blocks, vec![BlockRange { start: 1, end: 1 }]);
        assert_eq!(plan.next_remaining, 0);
    }

    #[test]
    fn partition_covers_every_id_exactly_once() {
        for &(top, workers) in &[(1u64, 1usize), (99, 4), (100, 1), (101, 1), (250, 3), (1234, 5), (10_001, 7)] {
            let blocks = all_blocks(top, workers);
            let mut expected = top;
            for b in &blocks {
                assert!(b.count() <= BLOCK_SIZE);
                assert!(b.end >= 1);
                assert_eq!(b.start, expected, "gap or overlap at {:?} for top {}", b, top);
                expected = b.end - 1;
            }
            assert_eq!(expected, 0, "not covered down to 1 for top {}", top);
            let total: u64 = blocks.iter().map(BlockRange::count).sum();
            assert_eq!(total, top);
        }
    }

    #[test]
    fn range_helpers() {
        let r = BlockRange { start: 5, end: 3 };
        assert_eq!(r.iter_desc().collect::<Vec<_>>(), vec![5, 4, 3]);
        assert!(r.contains(4));
        assert!(!r.contains(2));
        assert_eq!(r.to_string(), "[5-3]");
    }
}
