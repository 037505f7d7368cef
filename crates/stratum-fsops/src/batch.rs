//! Bounded fan-out over the sub-items of one operation.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use stratum_core::{CancelSignal, OperationOutcome};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::error::{FsOpsError, FsOpsResult};

/// Launch limits for one batch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) parallel: usize,
    pub(crate) stop_on_error: bool,
}

/// Aggregated per-item results.
#[derive(Debug, Default)]
pub(crate) struct BatchReport {
    pub(crate) succeeded: Vec<String>,
    pub(crate) failed: Vec<String>,
    pub(crate) bytes: u64,
    pub(crate) not_started: usize,
    pub(crate) cancelled: bool,
}

impl BatchReport {
    /// Record a failure discovered before any work starts.
    pub(crate) fn fail(&mut self, label: &str, err: &FsOpsError) {
        self.failed.push(format!("{label}: {}", err.reason()));
    }

    /// Turn the report into a handler result.
    pub(crate) fn into_outcome(mut self, operation: &'static str) -> FsOpsResult<OperationOutcome> {
        if self.cancelled {
            return Err(FsOpsError::Cancelled { operation });
        }
        self.succeeded.sort();
        self.failed.sort();
        let done = self.succeeded.len();
        let mut outcome = OperationOutcome::from_items(self.succeeded, self.failed, self.bytes);
        if outcome.is_success() {
            outcome = outcome.with_message(format!("{operation}: {done} item(s), {} bytes", self.bytes));
        } else if self.not_started > 0 {
            warn!(
                operation,
                not_started = self.not_started,
                "stopped launching after first failure"
            );
        }
        Ok(outcome)
    }
}

/// Run `work` over `items`, at most `limits.parallel` at a time.
///
/// Cancellation and `stop_on_error` only stop new launches; items already in
/// flight run to completion (and observe the signal themselves).
pub(crate) async fn run_bounded<T, F, Fut>(
    items: Vec<(String, T)>,
    limits: Limits,
    cancel: &CancelSignal,
    report: &mut BatchReport,
    work: F,
) where
    F: Fn(T) -> Fut,
    Fut: Future<Output = FsOpsResult<u64>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limits.parallel.max(1)));
    let failed = Arc::new(AtomicBool::new(false));
    let mut tasks = JoinSet::new();
    let total = items.len();
    let mut launched = 0_usize;

    for (label, item) in items {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        if limits.stop_on_error && failed.load(Ordering::SeqCst) {
            break;
        }
        let flag = Arc::clone(&failed);
        let future = work(item);
        tasks.spawn(async move {
            let result = future.await;
            if result.is_err() {
                flag.store(true, Ordering::SeqCst);
            }
            drop(permit);
            (label, result)
        });
        launched += 1;
    }
    report.not_started = total - launched;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((label, Ok(bytes))) => {
                report.bytes += bytes;
                report.succeeded.push(label);
            }
            Ok((label, Err(err))) => {
                if matches!(err, FsOpsError::Cancelled { .. }) {
                    report.cancelled = true;
                }
                warn!(item = %label, error = %err.reason(), "sub-operation failed");
                report.fail(&label, &err);
            }
            Err(join_err) => {
                error!(error = %join_err, "sub-operation task aborted");
                report.failed.push(format!("task: {join_err}"));
            }
        }
    }
}
