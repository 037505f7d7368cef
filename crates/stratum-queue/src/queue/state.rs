//! Bookkeeping guarded by the queue mutex.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;
use stratum_core::{
    CancelHandle, OperationId, OperationOutcome, OperationPayload, OperationSnapshot,
    OperationStatus, Priority, ProgressCallback, QueueStats,
};

use super::OperationFilter;

pub(super) struct OperationRecord {
    pub(super) snapshot: OperationSnapshot,
    pub(super) sequence: u64,
    pub(super) progress: Option<ProgressCallback>,
    pub(super) cancel: Option<CancelHandle>,
}

/// Everything the scheduler and workers mutate.
///
/// `pending` holds QUEUED ids in dispatch order; `running` holds ids whose
/// worker has not returned yet, including ones already marked CANCELLED.
#[derive(Default)]
pub(super) struct QueueState {
    pub(super) operations: HashMap<OperationId, OperationRecord>,
    pub(super) pending: Vec<OperationId>,
    pub(super) running: HashSet<OperationId>,
    pub(super) total_processed: u64,
    pub(super) total_failed: u64,
    pub(super) total_bytes: u64,
    pub(super) is_processing: bool,
    pub(super) is_paused: bool,
    pub(super) should_stop: bool,
    next_sequence: u64,
}

/// Terminal bookkeeping handed back to the worker for side effects.
pub(super) struct Completion {
    pub(super) status: OperationStatus,
    pub(super) outcome: Option<OperationOutcome>,
    pub(super) error: Option<String>,
    pub(super) progress: Option<ProgressCallback>,
    pub(super) duration: Option<std::time::Duration>,
}

impl QueueState {
    /// Record a new QUEUED operation ahead of the first strictly lower priority.
    pub(super) fn enqueue(
        &mut self,
        id: OperationId,
        payload: OperationPayload,
        priority: Priority,
        tags: BTreeSet<String>,
        owner_id: Option<String>,
        progress: Option<ProgressCallback>,
    ) {
        let position = self
            .pending
            .iter()
            .position(|queued| {
                self.operations
                    .get(queued)
                    .is_some_and(|record| record.snapshot.priority < priority)
            })
            .unwrap_or(self.pending.len());
        self.pending.insert(position, id);

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.operations.insert(
            id,
            OperationRecord {
                snapshot: OperationSnapshot {
                    id,
                    kind: payload.kind(),
                    payload,
                    priority,
                    status: OperationStatus::Queued,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    outcome: None,
                    error_message: None,
                    tags,
                    owner_id,
                },
                sequence,
                progress,
                cancel: None,
            },
        );
    }

    /// Pop the head of the pending list and mark it RUNNING.
    pub(super) fn start_next(&mut self, cancel: CancelHandle) -> Option<&OperationRecord> {
        if self.pending.is_empty() {
            return None;
        }
        let id = self.pending.remove(0);
        let record = self.operations.get_mut(&id)?;
        record.snapshot.status = OperationStatus::Running;
        record.snapshot.started_at = Some(Utc::now());
        record.cancel = Some(cancel);
        self.running.insert(id);
        Some(record)
    }

    /// Apply a worker result. A CANCELLED status set while running is kept.
    /// Returns `None` unless `id` still holds a worker slot, so a result is
    /// applied at most once.
    pub(super) fn complete(
        &mut self,
        id: OperationId,
        result: Result<OperationOutcome, String>,
    ) -> Option<Completion> {
        if !self.running.remove(&id) {
            return None;
        }
        let record = self.operations.get_mut(&id)?;
        record.cancel = None;
        let snapshot = &mut record.snapshot;

        let (outcome, error) = match result {
            Ok(outcome) => {
                self.total_bytes += outcome.bytes_moved;
                let error = (!outcome.is_success()).then(|| outcome.failure_message());
                (Some(outcome), error)
            }
            Err(message) => (None, Some(message)),
        };

        if snapshot.status == OperationStatus::Running {
            snapshot.status = if error.is_none() {
                self.total_processed += 1;
                OperationStatus::Completed
            } else {
                self.total_failed += 1;
                OperationStatus::Failed
            };
            snapshot.completed_at = Some(Utc::now());
            snapshot.error_message.clone_from(&error);
        }
        snapshot.outcome.clone_from(&outcome);

        Some(Completion {
            status: snapshot.status,
            outcome,
            error,
            progress: record.progress.clone(),
            duration: snapshot.duration(),
        })
    }

    /// Cancel a QUEUED or RUNNING operation; `None` when unknown or terminal.
    pub(super) fn cancel(&mut self, id: OperationId) -> Option<(OperationStatus, Option<ProgressCallback>)> {
        let record = self.operations.get_mut(&id)?;
        let previous = record.snapshot.status;
        match previous {
            OperationStatus::Queued => {
                self.pending.retain(|queued| *queued != id);
            }
            OperationStatus::Running => {
                if let Some(handle) = &record.cancel {
                    handle.cancel();
                }
            }
            _ => return None,
        }
        record.snapshot.status = OperationStatus::Cancelled;
        record.snapshot.completed_at = Some(Utc::now());
        Some((previous, record.progress.clone()))
    }

    /// Drop terminal operations whose worker has returned.
    pub(super) fn clear_completed(&mut self) -> usize {
        let before = self.operations.len();
        let running = &self.running;
        self.operations.retain(|id, record| {
            !record.snapshot.status.is_terminal() || running.contains(id)
        });
        before - self.operations.len()
    }

    pub(super) fn snapshot(&self, id: OperationId) -> Option<OperationSnapshot> {
        self.operations.get(&id).map(|record| record.snapshot.clone())
    }

    /// Matching operations, newest first.
    pub(super) fn list(&self, filter: &OperationFilter) -> Vec<OperationSnapshot> {
        let mut matching: Vec<&OperationRecord> = self
            .operations
            .values()
            .filter(|record| filter.matches(&record.snapshot))
            .collect();
        matching.sort_by(|a, b| {
            b.snapshot
                .created_at
                .cmp(&a.snapshot.created_at)
                .then(b.sequence.cmp(&a.sequence))
        });
        matching
            .into_iter()
            .map(|record| record.snapshot.clone())
            .collect()
    }

    pub(super) fn stats(&self, max_concurrent: usize) -> QueueStats {
        let mut stats = QueueStats {
            total_operations: self.operations.len(),
            in_flight: self.running.len(),
            total_processed: self.total_processed,
            total_failed: self.total_failed,
            total_bytes_processed: self.total_bytes,
            is_processing: self.is_processing,
            is_paused: self.is_paused,
            max_concurrent,
            queue_length: self.pending.len() + self.running.len(),
            ..QueueStats::default()
        };
        for record in self.operations.values() {
            match record.snapshot.status {
                OperationStatus::Queued => stats.queued += 1,
                OperationStatus::Running => stats.running += 1,
                OperationStatus::Completed => stats.completed += 1,
                OperationStatus::Failed => stats.failed += 1,
                OperationStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}
