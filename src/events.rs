//! Output channels from the engine to its consumer.
//!
//! Workers and the scheduler only ever send; the consumer owns the receivers
//! and may live on a different thread.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::parser::Signal;
use crate::scheduler::{BlockRange, SchedulerState};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub run_id: Option<Uuid>,
    pub level: LogLevel,
    pub worker: Option<usize>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// One resolved identifier.
#[derive(Debug, Clone, Serialize)]
pub struct ScanRecord {
    pub run_id: Uuid,
    pub worker: usize,
    pub account_id: u64,
    pub signal: Signal,
    /// All fetched pages merged into the first page's body.
    pub response: Value,
    pub pages_fetched: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub run_id: Uuid,
    pub batch: u32,
    pub state: SchedulerState,
    pub ranges: Vec<BlockRange>,
    pub active_workers: usize,
    pub completed_workers: usize,
    /// Highest identifier not yet assigned to any batch; 0 when exhausted.
    pub remaining: u64,
}

/// Receiving ends handed to the consumer once, at engine construction.
#[derive(Debug)]
pub struct EngineOutputs {
    pub results: UnboundedReceiver<ScanRecord>,
    pub logs: UnboundedReceiver<LogLine>,
    pub progress: UnboundedReceiver<BatchProgress>,
}

/// Sending ends shared by the scheduler and every worker.
#[derive(Debug, Clone)]
pub struct EventSink {
    results: UnboundedSender<ScanRecord>,
    logs: UnboundedSender<LogLine>,
    progress: UnboundedSender<BatchProgress>,
    run_id: Option<Uuid>,
}

pub fn channel() -> (EventSink, EngineOutputs) {
    let (results_tx, results) = mpsc::unbounded_channel();
    let (logs_tx, logs) = mpsc::unbounded_channel();
    let (progress_tx, progress) = mpsc::unbounded_channel();
    (
        EventSink {
            results: results_tx,
            logs: logs_tx,
            progress: progress_tx,
            run_id: None,
        },
        EngineOutputs {
            results,
            logs,
            progress,
        },
    )
}

impl EventSink {
    pub fn for_run(&self, run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            ..self.clone()
        }
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    // A dropped receiver only means nobody is listening; the scan carries on.

    pub fn result(&self, record: ScanRecord) {
        let _ = self.results.send(record);
    }

    pub fn progress(&self, progress: BatchProgress) {
        debug!(batch = progress.batch, state = ?progress.state, "batch progress");
        let _ = self.progress.send(progress);
    }

    /// Mirror the line to tracing, then hand it to the consumer.
    pub fn log(&self, level: LogLevel, worker: Option<usize>, message: impl Into<String>) {
        let message = message.into();
        let run_id = self.run_id.map(|id| id.to_string()).unwrap_or_default();
        match level {
            LogLevel::Debug => debug!(run_id = %run_id, worker = ?worker, "{}", message),
            LogLevel::Info => info!(run_id = %run_id, worker = ?worker, "{}", message),
            LogLevel::Warn => warn!(run_id = %run_id, worker = ?worker, "{}", message),
            LogLevel::Error => error!(run_id = %run_id, worker = ?worker, "{}", message),
        }
        let _ = self.logs.send(LogLine {
            run_id: self.run_id,
            level,
            worker,
            message,
            at: Utc::now(),
        });
    }

    pub fn info(&self, worker: Option<usize>, message: impl Into<String>) {
        self.log(LogLevel::Info, worker, message);
    }

    pub fn warn(&self, worker: Option<usize>, message: impl Into<String>) {
        self.log(LogLevel::Warn, worker, message);
    }
}
