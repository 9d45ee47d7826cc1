//! A single scan worker walking one block of identifiers, highest first.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::client::RemoteClient;
use crate::dedup::DedupGate;
use crate::events::{EventSink, ScanRecord};
use crate::parser::extract_signal;
use crate::scheduler::BlockRange;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub resolved: u64,
    pub skipped: u64,
    pub failed: u64,
    pub last_processed: Option<u64>,
    pub cancelled: bool,
}

/// Sent exactly once per worker, however it exits.
#[derive(Debug, Clone)]
pub struct WorkCompleted {
    pub worker: usize,
    pub range: BlockRange,
    pub report: WorkerReport,
    /// The worker did not reach its normal exit (panic or abort).
    pub unwound: bool,
}

/// Drop guard that delivers the worker's `WorkCompleted`.
struct CompletionNotice {
    tx: UnboundedSender<WorkCompleted>,
    worker: usize,
    range: BlockRange,
    report: WorkerReport,
    finished: bool,
}

impl CompletionNotice {
    fn finish(&mut self) -> WorkerReport {
        self.finished = true;
        self.report.clone()
    }
}

impl Drop for CompletionNotice {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkCompleted {
            worker: self.worker,
            range: self.range,
            report: self.report.clone(),
            unwound: !self.finished,
        });
    }
}

enum Step {
    Skipped,
    Failed,
    Resolved,
}

pub struct ScanWorker {
    id: usize,
    range: BlockRange,
    interval: Duration,
    client: Arc<dyn RemoteClient>,
    dedup: Arc<DedupGate>,
    events: EventSink,
    cancel: CancellationToken,
}

impl ScanWorker {
    pub fn new(
        id: usize,
        range: BlockRange,
        interval: Duration,
        client: Arc<dyn RemoteClient>,
        dedup: Arc<DedupGate>,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            range,
            interval,
            client,
            dedup,
            events,
            cancel,
        }
    }

    #[instrument(skip_all, fields(worker = self.id, range = %self.range))]
    pub async fn run(self, done: UnboundedSender<WorkCompleted>) -> WorkerReport {
        let mut notice = CompletionNotice {
            tx: done,
            worker: self.id,
            range: self.range,
            report: WorkerReport::default(),
            finished: false,
        };
        self.events.info(
            Some(self.id),
            format!("worker {} scanning {}", self.id, self.range),
        );

        for id in self.range.iter_desc() {
            if self.cancel.is_cancelled() {
                notice.report.cancelled = true;
                break;
            }
            let step = self.scan_one(id).await;
            notice.report.last_processed = Some(id);
            match step {
                Step::Skipped => {
                    notice.report.skipped += 1;
                    continue;
                }
                Step::Failed => notice.report.failed += 1,
                Step::Resolved => notice.report.resolved += 1,
            }
            if !self.pause().await {
                notice.report.cancelled = true;
                break;
            }
        }

        if notice.report.cancelled {
            self.events
                .info(Some(self.id), format!("worker {} stopping on request", self.id));
        }
        notice.finish()
    }

    async fn scan_one(&self, id: u64) -> Step {
        if self.dedup.seen(id) {
            self.events
                .info(Some(self.id), format!("ID {} already requested, skipping", id));
            return Step::Skipped;
        }

        let first = match self.client.fetch_account_page(id, 1).await {
            Ok(page) => page,
            Err(err) => {
                self.events
                    .warn(Some(self.id), format!("ID {} request failed: {}", id, err));
                return Step::Failed;
            }
        };

        let total_pages = first.total_pages();
        let mut merged = first.raw;
        let mut pages_fetched = 1u32;
        for page in 2..=total_pages {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.client.fetch_account_page(id, page).await {
                Ok(next) => {
                    append_rows(&mut merged, next.data);
                    pages_fetched += 1;
                }
                Err(err) => {
                    // a failed page moves straight on, no pause
                    self.events.warn(
                        Some(self.id),
                        format!("ID {} page {}/{} failed: {}", id, page, total_pages, err),
                    );
                    continue;
                }
            }
            if !self.pause().await {
                break;
            }
        }

        let signal = extract_signal(&merged.to_string());
        if let Err(err) = self.dedup.record(id, &signal).await {
            self.events.warn(
                Some(self.id),
                format!("ID {} result not persisted: {:#}", id, err),
            );
        }
        self.events.info(
            Some(self.id),
            format!(
                "ID {} request finished ({} page(s)): {}",
                id, pages_fetched, signal.display_text
            ),
        );
        self.events.result(ScanRecord {
            run_id: self.events.run_id().unwrap_or_else(Uuid::nil),
            worker: self.id,
            account_id: id,
            signal,
            response: merged,
            pages_fetched,
            at: Utc::now(),
        });
        Step::Resolved
    }

    /// Sleep for the request interval. `false` when cancelled instead.
    async fn pause(&self) -> bool {
        if self.interval.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = time::sleep(self.interval) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

/// Append a later page's rows to `data.data` of the first page's body.
fn append_rows(merged: &mut Value, rows: Vec<Value>) {
    if let Some(data) = merged.pointer_mut("/data/data").and_then(Value::as_array_mut) {
        data.extend(rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_rows_keeps_page_order() {
        let mut merged = json!({ "data": { "data": [1, 2], "limit": 2 }, "params": { "id": 9 } });
        append_rows(&mut merged, vec![json!(3), json!(4)]);
        append_rows(&mut merged, vec![json!(5)]);
        assert_eq!(merged["data"]["data"], json!([1, 2, 3, 4, 5]));
        assert_eq!(merged["params"]["id"], 9);
    }

    #[tokio::test]
    async fn notice_reports_unwound_when_dropped_early() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let range = BlockRange { start: 10, end: 1 };
        {
            let mut notice = CompletionNotice {
                tx: tx.clone(),
                worker: 2,
                range,
                report: WorkerReport::default(),
                finished: false,
            };
            notice.report.last_processed = Some(7);
        }
        let done = rx.recv().await.unwrap();
        assert!(done.unwound);
        assert_eq!(done.worker, 2);
        assert_eq!(done.report.last_processed, Some(7));

        {
            let mut notice = CompletionNotice {
                tx,
                worker: 0,
                range,
                report: WorkerReport::default(),
                finished: false,
            };
            notice.finish();
        }
        assert!(!rx.recv().await.unwrap().unwound);
    }
}
