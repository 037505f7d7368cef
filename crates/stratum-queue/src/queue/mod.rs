//! Priority queue of bulk operations with bounded concurrent execution.
//!
//! # Design
//! - All bookkeeping sits behind one mutex; progress callbacks, events, and
//!   metrics run after the lock is released.
//! - The scheduler is started lazily and owns its workers, so [`OperationQueue::stop`]
//!   can await every in-flight operation.
//! - Cancelling a running operation marks it CANCELLED immediately and
//!   signals the handler's [`CancelSignal`](stratum_core::CancelSignal); the
//!   slot is freed once the handler returns.
//! - Operations live in memory only and are lost on restart.

mod scheduler;
mod state;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratum_config::QueueConfig;
use stratum_config::defaults;
use stratum_core::{
    OperationId, OperationPayload, OperationSnapshot, OperationStatus, Priority,
    ProgressCallback, ProgressUpdate, QueueStats,
};
use stratum_events::{Event, EventBus};
use stratum_telemetry::Metrics;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use self::scheduler::{Dispatcher, Shared, Sinks};
use self::state::QueueState;
use crate::error::{QueueError, QueueResult};
use crate::router::OperationRouter;

/// Scheduling knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Upper bound on RUNNING operations.
    pub max_concurrent: usize,
    /// Priority used when a submission names none.
    pub default_priority: Priority,
    /// Fallback recheck interval of the scheduler.
    pub idle_poll: Duration,
}

impl QueueSettings {
    /// Read the knobs from the `queue` section.
    #[must_use]
    pub const fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            default_priority: config.default_priority,
            idle_poll: config.idle_poll(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::MAX_CONCURRENT,
            default_priority: Priority::default(),
            idle_poll: Duration::from_millis(defaults::IDLE_POLL_MS),
        }
    }
}

/// Optional attributes of a submission.
#[derive(Clone, Default)]
pub struct SubmitOptions {
    priority: Option<Priority>,
    tags: BTreeSet<String>,
    owner_id: Option<String>,
    progress: Option<ProgressCallback>,
}

impl SubmitOptions {
    /// Override the queue's default priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Attach a filter label.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Record the submitting user or system.
    #[must_use]
    pub fn owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Receive [`ProgressUpdate`]s for this operation.
    #[must_use]
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }
}

/// Conjunctive filter for [`OperationQueue::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationFilter {
    /// Keep only this status.
    pub status: Option<OperationStatus>,
    /// Keep only this owner.
    pub owner_id: Option<String>,
    /// Keep operations carrying at least one of these tags.
    pub tags: Vec<String>,
}

impl OperationFilter {
    /// Filter on status.
    #[must_use]
    pub fn with_status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter on owner.
    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    /// Filter on any of `tags`.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    fn matches(&self, snapshot: &OperationSnapshot) -> bool {
        self.status.is_none_or(|status| snapshot.status == status)
            && self
                .owner_id
                .as_ref()
                .is_none_or(|owner| snapshot.owner_id.as_ref() == Some(owner))
            && (self.tags.is_empty() || self.tags.iter().any(|tag| snapshot.tags.contains(tag)))
    }
}

/// In-memory operation queue.
pub struct OperationQueue {
    shared: Arc<Shared>,
    router: Arc<OperationRouter>,
    settings: QueueSettings,
    sinks: Sinks,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("settings", &self.settings)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Queue dispatching through `router`.
    ///
    /// A `max_concurrent` of zero is raised to one.
    #[must_use]
    pub fn new(router: OperationRouter, mut settings: QueueSettings) -> Self {
        settings.max_concurrent = settings.max_concurrent.max(1);
        Self {
            shared: Arc::new(Shared::new()),
            router: Arc::new(router),
            settings,
            sinks: Sinks::default(),
            scheduler: Mutex::new(None),
        }
    }

    /// Publish lifecycle events on `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.sinks.events = Some(events);
        self
    }

    /// Record queue gauges and counters in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.sinks.metrics = Some(metrics);
        self
    }

    /// Active scheduling knobs.
    #[must_use]
    pub const fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Validate and enqueue `payload`; starts the scheduler when idle.
    ///
    /// Must be called from within a Tokio runtime for the operation to be
    /// dispatched; otherwise it stays QUEUED until [`OperationQueue::resume`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Validation`] when the payload is malformed.
    pub fn submit(
        &self,
        payload: OperationPayload,
        options: SubmitOptions,
    ) -> QueueResult<OperationId> {
        payload
            .validate()
            .map_err(|source| QueueError::Validation { source })?;

        let id = Uuid::new_v4();
        let kind = payload.kind();
        let priority = options.priority.unwrap_or(self.settings.default_priority);
        let start = {
            let mut state = self.shared.lock();
            state.enqueue(
                id,
                payload,
                priority,
                options.tags,
                options.owner_id,
                options.progress,
            );
            self.sinks.gauges(&state);
            Self::claim_scheduler(&mut state)
        };

        info!(operation_id = %id, kind = %kind, priority = %priority, "operation queued");
        self.sinks.publish(Event::OperationQueued {
            operation_id: id,
            kind: kind.to_string(),
            priority: priority.to_string(),
        });
        if start {
            self.spawn_scheduler();
        }
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cancel a QUEUED or RUNNING operation. Returns `false` for unknown or
    /// already terminal operations.
    pub fn cancel(&self, id: OperationId) -> bool {
        let cancelled = {
            let mut state = self.shared.lock();
            let cancelled = state.cancel(id);
            self.sinks.gauges(&state);
            cancelled
        };
        let Some((previous, progress)) = cancelled else {
            return false;
        };

        info!(operation_id = %id, previous = previous.as_str(), "operation cancelled");
        self.sinks
            .publish(Event::OperationCancelled { operation_id: id });
        if previous == OperationStatus::Queued
            && let Some(callback) = progress
        {
            callback(
                id,
                &ProgressUpdate::Finished {
                    status: OperationStatus::Cancelled,
                    outcome: None,
                    error: None,
                    duration: None,
                },
            );
        }
        self.shared.wake.notify_one();
        true
    }

    /// Like [`OperationQueue::cancel`] but reports why nothing happened.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for unknown ids and
    /// [`QueueError::OperationNotAllowed`] for terminal operations.
    pub fn try_cancel(&self, id: OperationId) -> QueueResult<()> {
        if self.cancel(id) {
            return Ok(());
        }
        match self.get(id) {
            None => Err(QueueError::NotFound { operation_id: id }),
            Some(snapshot) => Err(QueueError::OperationNotAllowed {
                operation_id: id,
                status: snapshot.status,
            }),
        }
    }

    /// Stop dispatching new work; RUNNING operations continue.
    pub fn pause(&self) {
        self.shared.lock().is_paused = true;
        info!("operation queue paused");
        self.sinks.publish(Event::QueuePaused);
        self.shared.wake.notify_one();
    }

    /// Resume dispatching, clearing a previous pause or stop.
    pub fn resume(&self) {
        let start = {
            let mut state = self.shared.lock();
            state.is_paused = false;
            state.should_stop = false;
            Self::claim_scheduler(&mut state)
        };
        info!("operation queue resumed");
        self.sinks.publish(Event::QueueResumed);
        if start {
            self.spawn_scheduler();
        }
        self.shared.wake.notify_one();
    }

    /// Ask the scheduler to exit and wait until every in-flight worker has
    /// returned. QUEUED operations stay QUEUED.
    pub async fn stop(&self) {
        self.shared.lock().should_stop = true;
        self.shared.wake.notify_one();

        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(|poisoned| {
                error!("scheduler handle mutex poisoned");
                poisoned.into_inner()
            })
            .take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            error!(error = %err, "operation scheduler aborted");
        }
        info!("operation queue stopped");
        self.sinks.publish(Event::QueueStopped);
    }

    /// Snapshot of one operation.
    #[must_use]
    pub fn get(&self, id: OperationId) -> Option<OperationSnapshot> {
        self.shared.lock().snapshot(id)
    }

    /// Operations matching `filter`, most recently created first.
    #[must_use]
    pub fn list(&self, filter: &OperationFilter) -> Vec<OperationSnapshot> {
        self.shared.lock().list(filter)
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        self.shared.lock().stats(self.settings.max_concurrent)
    }

    /// Forget terminal operations; returns how many were removed.
    pub fn clear_completed(&self) -> usize {
        let removed = self.shared.lock().clear_completed();
        if removed > 0 {
            info!(removed, "cleared finished operations");
        }
        removed
    }

    fn claim_scheduler(state: &mut QueueState) -> bool {
        if state.is_processing || state.is_paused || state.should_stop || state.pending.is_empty()
        {
            return false;
        }
        state.is_processing = true;
        true
    }

    fn spawn_scheduler(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime; operations stay queued until resume");
            self.shared.lock().is_processing = false;
            return;
        };
        let dispatcher = Arc::new(Dispatcher {
            shared: Arc::clone(&self.shared),
            router: Arc::clone(&self.router),
            sinks: self.sinks.clone(),
            max_concurrent: self.settings.max_concurrent,
            idle_poll: self.settings.idle_poll,
        });
        let handle = runtime.spawn(dispatcher.run());
        let mut slot = self.scheduler.lock().unwrap_or_else(|poisoned| {
            error!("scheduler handle mutex poisoned");
            poisoned.into_inner()
        });
        if let Some(previous) = slot.replace(handle)
            && !previous.is_finished()
        {
            warn!("replaced a scheduler handle that was still draining");
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.shared.lock().should_stop = true;
        self.shared.wake.notify_one();
    }
}
