//! Scheduler loop and worker tasks.
//!
//! One scheduler task per active queue pops operations in priority order and
//! runs each on a worker inside a [`JoinSet`]. The loop sleeps on a
//! [`Notify`] that submit, resume, stop, and worker completion signal, with
//! `idle_poll` as a fallback timer. It exits when stopped, or when there is
//! nothing it could dispatch and nothing in flight; `submit` and `resume`
//! start a fresh one.
//!
//! A worker that panics is reaped by the scheduler, which records the
//! operation as FAILED and frees its slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use stratum_core::{
    CancelSignal, OperationId, OperationKind, OperationOutcome, OperationPayload,
    OperationStatus, ProgressCallback, ProgressUpdate, cancel_pair,
};
use stratum_events::{Event, EventBus};
use stratum_telemetry::Metrics;
use tokio::sync::Notify;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::state::QueueState;
use crate::router::OperationRouter;

/// State shared by the queue handle, the scheduler, and every worker.
pub(super) struct Shared {
    state: Mutex<QueueState>,
    pub(super) wake: Notify,
}

impl Shared {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            error!("operation queue mutex poisoned; continuing with recovered state");
            poisoned.into_inner()
        })
    }
}

/// Optional event and metric sinks.
#[derive(Clone, Default)]
pub(super) struct Sinks {
    pub(super) events: Option<EventBus>,
    pub(super) metrics: Option<Metrics>,
}

impl Sinks {
    pub(super) fn publish(&self, event: Event) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    pub(super) fn gauges(&self, state: &QueueState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_queue_depth(state.pending.len());
            metrics.set_operations_running(state.running.len());
        }
    }
}

/// Everything a scheduler run needs.
pub(super) struct Dispatcher {
    pub(super) shared: Arc<Shared>,
    pub(super) router: Arc<OperationRouter>,
    pub(super) sinks: Sinks,
    pub(super) max_concurrent: usize,
    pub(super) idle_poll: Duration,
}

struct Dispatch {
    id: OperationId,
    kind: OperationKind,
    payload: OperationPayload,
    signal: CancelSignal,
    progress: Option<ProgressCallback>,
}

enum Decision {
    Dispatch(Vec<Dispatch>),
    Wait,
    Exit,
}

impl Dispatcher {
    pub(super) async fn run(self: Arc<Self>) {
        info!(max_concurrent = self.max_concurrent, "operation scheduler started");
        let mut workers = JoinSet::new();
        let mut in_flight: HashMap<TaskId, (OperationId, OperationKind)> = HashMap::new();
        loop {
            match self.decide(workers.is_empty()) {
                Decision::Exit => break,
                Decision::Dispatch(batch) => {
                    for dispatch in batch {
                        let owner = (dispatch.id, dispatch.kind);
                        let dispatcher = Arc::clone(&self);
                        let task = workers.spawn(async move { dispatcher.work(dispatch).await });
                        in_flight.insert(task.id(), owner);
                    }
                    continue;
                }
                Decision::Wait => {}
            }

            tokio::select! {
                () = self.shared.wake.notified() => {}
                Some(joined) = workers.join_next_with_id(), if !workers.is_empty() => {
                    self.reap(&mut in_flight, joined);
                }
                () = sleep(self.idle_poll) => {}
            }
        }

        while let Some(joined) = workers.join_next_with_id().await {
            self.reap(&mut in_flight, joined);
        }
        info!("operation scheduler exited");
    }

    fn reap(
        &self,
        in_flight: &mut HashMap<TaskId, (OperationId, OperationKind)>,
        joined: Result<(TaskId, ()), JoinError>,
    ) {
        let err = match joined {
            Ok((task, ())) => {
                in_flight.remove(&task);
                return;
            }
            Err(err) => err,
        };
        let Some((id, kind)) = in_flight.remove(&err.id()) else {
            error!(error = %err, "untracked operation worker aborted");
            return;
        };
        let message = panic_message(err);
        error!(operation_id = %id, kind = %kind, error = %message, "operation worker aborted");
        self.finish(id, kind, Err(message));
    }

    fn decide(&self, no_workers: bool) -> Decision {
        let mut state = self.shared.lock();
        if state.should_stop {
            state.is_processing = false;
            return Decision::Exit;
        }

        let mut batch = Vec::new();
        while !state.is_paused && state.running.len() < self.max_concurrent {
            let (handle, signal) = cancel_pair();
            let Some(record) = state.start_next(handle) else {
                break;
            };
            batch.push(Dispatch {
                id: record.snapshot.id,
                kind: record.snapshot.kind,
                payload: record.snapshot.payload.clone(),
                signal,
                progress: record.progress.clone(),
            });
        }
        if !batch.is_empty() {
            self.sinks.gauges(&state);
            return Decision::Dispatch(batch);
        }

        let dispatchable = !state.is_paused && !state.pending.is_empty();
        if !dispatchable && state.running.is_empty() && no_workers {
            state.is_processing = false;
            return Decision::Exit;
        }
        Decision::Wait
    }

    async fn work(self: Arc<Self>, dispatch: Dispatch) {
        let Dispatch {
            id,
            kind,
            payload,
            signal,
            progress,
        } = dispatch;

        info!(operation_id = %id, kind = %kind, "operation started");
        self.sinks.publish(Event::OperationStarted {
            operation_id: id,
            kind: kind.to_string(),
        });
        if let Some(callback) = &progress {
            callback(
                id,
                &ProgressUpdate::Started {
                    kind,
                    item_count: payload.item_count(),
                },
            );
        }

        let result = self
            .router
            .execute(&payload, signal)
            .await
            .map_err(|err| err.operation_message());
        self.finish(id, kind, result);
    }

    /// Record the terminal state of `id` and run the side effects once.
    fn finish(&self, id: OperationId, kind: OperationKind, result: Result<OperationOutcome, String>) {
        let completion = {
            let mut state = self.shared.lock();
            let completion = state.complete(id, result);
            self.sinks.gauges(&state);
            completion
        };
        self.shared.wake.notify_one();

        let Some(completion) = completion else {
            warn!(operation_id = %id, "finished operation no longer tracked");
            return;
        };
        match completion.status {
            OperationStatus::Completed => {
                info!(operation_id = %id, kind = %kind, "operation completed");
            }
            OperationStatus::Cancelled => {
                info!(operation_id = %id, kind = %kind, "cancelled operation returned");
            }
            _ => {
                warn!(
                    operation_id = %id,
                    kind = %kind,
                    error = completion.error.as_deref().unwrap_or_default(),
                    "operation failed"
                );
            }
        }

        let bytes_moved = completion
            .outcome
            .as_ref()
            .map_or(0, |outcome| outcome.bytes_moved);
        if let Some(metrics) = &self.sinks.metrics {
            metrics.inc_operation(completion.status.as_str());
            metrics.add_bytes_processed(bytes_moved);
        }
        self.sinks.publish(Event::OperationFinished {
            operation_id: id,
            status: completion.status,
            bytes_moved,
            message: completion.error.clone(),
        });
        if let Some(callback) = completion.progress {
            callback(
                id,
                &ProgressUpdate::Finished {
                    status: completion.status,
                    outcome: completion.outcome,
                    error: completion.error,
                    duration: completion.duration,
                },
            );
        }
        debug!(operation_id = %id, "worker released slot");
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "operation worker aborted".to_string();
    }
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("handler panicked: {detail}")
}
