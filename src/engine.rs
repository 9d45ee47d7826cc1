//! Engine facade: the only surface a consumer drives.
//!
//! `start` validates and spawns a [`BatchScheduler`]; results, log lines and
//! batch progress arrive on the receivers returned by [`Engine::open`].

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::client::{ClientError, RemoteConnector};
use crate::config;
use crate::db::Pool;
use crate::dedup::DedupGate;
use crate::events::{self, EngineOutputs, EventSink};
use crate::model::Credentials;
use crate::scheduler::{BatchScheduler, RunSummary, SchedulerState, BLOCK_SIZE};

pub type RunId = Uuid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("missing credentials: cookie and token are required")]
    MissingCredentials,
    #[error("invalid top identifier {0}: must be >= 0")]
    InvalidTopId(i64),
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,
    #[error("a scan is already running")]
    AlreadyRunning,
    #[error("cannot build remote client: {0}")]
    Connect(#[from] ClientError),
}

/// Scheduler tuning, usually derived from the `scan` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub block_size: u64,
    pub batch_delay: Duration,
    pub join_timeout: Duration,
    pub drain_poll: Duration,
    pub drain_timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            batch_delay: Duration::from_secs(1),
            join_timeout: Duration::from_secs(5),
            drain_poll: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(3),
        }
    }
}

impl From<&config::Scan> for ScanOptions {
    fn from(scan: &config::Scan) -> Self {
        Self {
            block_size: BLOCK_SIZE,
            batch_delay: scan.batch_delay(),
            join_timeout: scan.join_timeout(),
            drain_poll: scan.drain_poll(),
            drain_timeout: scan.drain_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Highest identifier to scan; the run walks down to 1.
    pub top_id: i64,
    /// Pause between requests made by one worker.
    pub interval: Duration,
    pub workers: usize,
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// `None` when there was nothing to stop.
    pub run_id: Option<RunId>,
    pub summary: Option<RunSummary>,
    /// The scheduler had to be aborted after the join timeout.
    pub timed_out: bool,
}

struct ActiveRun {
    run_id: RunId,
    cancel: CancellationToken,
    handle: JoinHandle<RunSummary>,
}

pub struct Engine {
    connector: Arc<dyn RemoteConnector>,
    options: ScanOptions,
    dedup: Arc<DedupGate>,
    events: EventSink,
    state: Arc<watch::Sender<SchedulerState>>,
    shutdown: CancellationToken,
    active: Mutex<Option<ActiveRun>>,
}

impl Engine {
    /// Build an engine over `pool`, warming the dedup cache from it.
    #[instrument(skip_all)]
    pub async fn open(
        pool: Pool,
        connector: Arc<dyn RemoteConnector>,
        options: ScanOptions,
    ) -> Result<(Self, EngineOutputs)> {
        let dedup = Arc::new(DedupGate::load(pool).await?);
        let (events, outputs) = events::channel();
        let (state, _) = watch::channel(SchedulerState::Idle);
        info!(known_ids = dedup.len(), "engine ready");
        Ok((
            Self {
                connector,
                options,
                dedup,
                events,
                state: Arc::new(state),
                shutdown: CancellationToken::new(),
                active: Mutex::new(None),
            },
            outputs,
        ))
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn dedup(&self) -> &DedupGate {
        &self.dedup
    }

    /// Validate the request and launch a run. Nothing is spawned on error.
    #[instrument(skip_all, fields(top_id = req.top_id, workers = req.workers))]
    pub async fn start(&self, req: StartRequest) -> Result<RunId, EngineError> {
        if !req.credentials.is_complete() {
            return Err(EngineError::MissingCredentials);
        }
        if req.top_id < 0 {
            return Err(EngineError::InvalidTopId(req.top_id));
        }
        if req.workers == 0 {
            return Err(EngineError::InvalidWorkerCount);
        }

        let mut active = self.active.lock().await;
        if let Some(run) = active.as_ref() {
            if !run.handle.is_finished() {
                return Err(EngineError::AlreadyRunning);
            }
        }

        let client = self.connector.connect(&req.credentials)?;
        let run_id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        let events = self.events.for_run(run_id);
        events.info(
            None,
            format!(
                "scan started: top id {}, {} worker(s), interval {:?}",
                req.top_id, req.workers, req.interval
            ),
        );

        // Leave the terminal state before returning so `wait` sees the run.
        self.state.send_replace(SchedulerState::Planning);
        let scheduler = BatchScheduler::new(
            run_id,
            req.top_id as u64,
            req.workers,
            req.interval,
            self.options.clone(),
            client,
            self.dedup.clone(),
            events,
            self.state.clone(),
            cancel.clone(),
        );
        let handle = tokio::spawn(scheduler.run());
        *active = Some(ActiveRun {
            run_id,
            cancel,
            handle,
        });
        Ok(run_id)
    }

    /// Cancel the current run and wait for it, bounded by the join timeout.
    #[instrument(skip_all)]
    pub async fn stop(&self) -> StopReport {
        let Some(mut run) = self.active.lock().await.take() else {
            return StopReport {
                run_id: None,
                summary: None,
                timed_out: false,
            };
        };

        run.cancel.cancel();
        let mut report = StopReport {
            run_id: Some(run.run_id),
            summary: None,
            timed_out: false,
        };
        match time::timeout(self.options.join_timeout, &mut run.handle).await {
            Ok(Ok(summary)) => report.summary = Some(summary),
            Ok(Err(err)) => error!(run_id = %run.run_id, %err, "scheduler task failed"),
            Err(_) => {
                warn!(run_id = %run.run_id, "scheduler did not stop within join timeout; aborting");
                run.handle.abort();
                report.timed_out = true;
            }
        }
        if !self.state().is_terminal() {
            self.state.send_replace(SchedulerState::Idle);
        }
        report
    }

    /// Wait for the current run to end on its own (or be stopped elsewhere).
    pub async fn wait(&self) -> Option<RunSummary> {
        let mut rx = self.state.subscribe();
        let ended = rx.wait_for(|s| s.is_terminal()).await.is_ok();
        if !ended {
            return None;
        }
        let run = self.active.lock().await.take()?;
        match run.handle.await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(run_id = %run.run_id, %err, "scheduler task failed");
                None
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_scan_config() {
        let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
        let opts = ScanOptions::from(&cfg.scan);
        assert_eq!(opts.block_size, BLOCK_SIZE);
        assert_eq!(opts.join_timeout, Duration::from_secs(5));
        assert_eq!(opts.drain_poll, Duration::from_millis(100));
    }
}
