//! Durable delivery queue.
//!
//! Owns every [`Task`] and its persisted representation. The central
//! invariant: at most one task is `processing` at any instant — enforced by
//! [`DurableQueue::dequeue`], which refuses to hand out work while the
//! in-flight slot is occupied. Many producers may enqueue concurrently with
//! the single consumer; a single async mutex around the mutable state is
//! the only shared-mutable boundary in the pipeline core.
//!
//! Persistence failures never block the in-memory queue: they are logged
//! and retried implicitly on the next mutating call.

pub mod store;

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::message::InboundMessage;
use crate::models::rule::Rule;
use crate::models::task::{FailureReason, Task, TaskStatus};
use crate::{AppError, Result};

use store::QueueStore;

/// Terminal outcome the relay worker reports for a task.
#[derive(Debug, Clone)]
pub enum TaskResolution {
    /// Delivery succeeded; the payload is the relayed reply text.
    Replied(String),
    /// Delivery failed with the given reason.
    Failed(FailureReason),
}

/// What recovery found in the persisted state at startup.
///
/// Restarts never auto-resume in-flight work, so pending or failed tasks
/// found here must be surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pending tasks reloaded from the queue file.
    pub pending: usize,
    /// Failed tasks found across the history files.
    pub failed: usize,
    /// Whether an interrupted in-flight task was reinstated at the head of
    /// the pending list.
    pub reinstated: bool,
}

impl RecoveryReport {
    /// Whether the operator should be warned about unfinished work.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        self.pending > 0 || self.failed > 0 || self.reinstated
    }
}

/// Point-in-time queue counters for status views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    /// Tasks waiting for delivery.
    pub pending: usize,
    /// Whether a delivery is in flight.
    pub processing: bool,
    /// Terminal tasks retained across all rule histories.
    pub history: usize,
}

struct QueueState {
    pending: VecDeque<Task>,
    in_flight: Option<Task>,
    is_processing: bool,
    /// Per-rule terminal tasks, oldest first, capped at `history_cap`.
    history: HashMap<String, Vec<Task>>,
}

impl QueueState {
    fn history_len(&self) -> usize {
        self.history.values().map(Vec::len).sum()
    }
}

/// File-backed FIFO queue with at-most-one in-flight delivery.
pub struct DurableQueue {
    state: Mutex<QueueState>,
    store: QueueStore,
    history_cap: usize,
}

impl DurableQueue {
    /// Open the queue, recovering persisted state.
    ///
    /// A task left `processing` by a crash is reinstated at the head of the
    /// pending list — visible to the operator, never silently resumed —
    /// and the stale processing flag is cleared so the restart cannot
    /// deadlock the queue.
    #[must_use]
    pub fn open(store: QueueStore, history_cap: usize) -> (Self, RecoveryReport) {
        let loaded = store.load();

        let mut pending: VecDeque<Task> = loaded.pending.into();
        let reinstated = match loaded.in_flight {
            Some(mut task) => {
                info!(task_id = task.id, "reinstating interrupted in-flight task as pending");
                task.status = TaskStatus::Pending;
                pending.push_front(task);
                true
            }
            None => false,
        };

        let failed = loaded
            .history
            .values()
            .flatten()
            .filter(|task| task.status == TaskStatus::Failed)
            .count();

        let report = RecoveryReport {
            pending: pending.len(),
            failed,
            reinstated,
        };

        let queue = Self {
            state: Mutex::new(QueueState {
                pending,
                in_flight: None,
                is_processing: false,
                history: loaded.history,
            }),
            store,
            history_cap,
        };
        (queue, report)
    }

    /// Create one pending task per matched rule and persist before
    /// returning. Returns the new task ids, in rule order.
    ///
    /// Persistence failure is logged, not fatal: the in-memory state stays
    /// authoritative until the next successful save.
    pub async fn enqueue(&self, message: &InboundMessage, rules: Vec<Rule>) -> Vec<String> {
        let mut state = self.state.lock().await;
        let mut ids = Vec::with_capacity(rules.len());
        for rule in rules {
            let task = Task::new(message, rule);
            debug!(
                task_id = task.id,
                rule = task.rule.name,
                "task enqueued"
            );
            ids.push(task.id.clone());
            state.pending.push_back(task);
        }
        self.persist_queue(&state);
        ids
    }

    /// Remove and return the head of the pending list, marking it
    /// processing — but only when nothing else is in flight.
    ///
    /// Never blocks; returns `None` immediately when the queue is empty or
    /// a delivery is already underway.
    pub async fn dequeue(&self) -> Option<Task> {
        let mut state = self.state.lock().await;
        if state.is_processing {
            return None;
        }
        let mut task = state.pending.pop_front()?;
        task.status = TaskStatus::Processing;
        state.in_flight = Some(task.clone());
        state.is_processing = true;
        self.persist_queue(&state);
        debug!(task_id = task.id, "task dequeued for delivery");
        Some(task)
    }

    /// Record a task's terminal outcome, move it into the per-rule history
    /// (oldest-evicted past the cap), clear the in-flight slot, persist.
    pub async fn complete(&self, mut task: Task, resolution: TaskResolution) {
        match resolution {
            TaskResolution::Replied(reply) => task.mark_completed(reply),
            TaskResolution::Failed(reason) => {
                warn!(task_id = task.id, %reason, "task failed");
                task.mark_failed(reason);
            }
        }

        let mut state = self.state.lock().await;
        state.in_flight = None;
        state.is_processing = false;

        let rule = task.rule.clone();
        let entries = state.history.entry(rule.id.clone()).or_default();
        entries.push(task);
        while entries.len() > self.history_cap {
            entries.remove(0);
        }

        self.persist_queue(&state);
        self.persist_rule_history(&state, &rule);
        self.persist_legacy(&state);
    }

    /// Evict oldest history entries first, then oldest pending entries,
    /// until `pending + history ≤ max_total`.
    pub async fn trim(&self, max_total: usize) {
        let mut state = self.state.lock().await;
        let total = state.pending.len() + state.history_len();
        if total <= max_total {
            return;
        }
        let mut excess = total - max_total;
        info!(excess, max_total, "trimming queue");

        let mut touched_rules: Vec<Rule> = Vec::new();
        while excess > 0 {
            let Some(oldest_rule_id) = oldest_history_rule(&state.history) else {
                break;
            };
            if let Some(entries) = state.history.get_mut(&oldest_rule_id) {
                let removed = entries.remove(0);
                if !touched_rules.iter().any(|rule| rule.id == removed.rule.id) {
                    touched_rules.push(removed.rule);
                }
                if entries.is_empty() {
                    state.history.remove(&oldest_rule_id);
                }
            }
            excess -= 1;
        }

        // History alone was insufficient; drop the oldest pending work.
        while excess > 0 && state.pending.pop_front().is_some() {
            excess -= 1;
        }

        self.persist_queue(&state);
        for rule in &touched_rules {
            self.persist_rule_history(&state, rule);
        }
        self.persist_legacy(&state);
    }

    /// Current queue counters.
    pub async fn status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            pending: state.pending.len(),
            processing: state.is_processing,
            history: state.history_len(),
        }
    }

    /// Copies of the pending tasks in delivery order.
    pub async fn pending_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        state.pending.iter().cloned().collect()
    }

    /// Merged history view across all rules: ordered by completion time,
    /// deduplicated by task id.
    pub async fn history_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut merged: Vec<Task> = state.history.values().flatten().cloned().collect();
        merged.sort_by_key(|task| task.completed_at);
        let mut seen = std::collections::HashSet::new();
        merged.retain(|task| seen.insert(task.id.clone()));
        merged
    }

    /// Requeue a failed task from history as pending, bumping its retry
    /// count. Operator-triggered; there is no automatic retry.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no failed task has `task_id`.
    pub async fn retry_failed(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut found: Option<Task> = None;
        for entries in state.history.values_mut() {
            if let Some(pos) = entries
                .iter()
                .position(|task| task.id == task_id && task.status == TaskStatus::Failed)
            {
                found = Some(entries.remove(pos));
                break;
            }
        }
        let Some(mut task) = found else {
            return Err(AppError::NotFound(format!("failed task {task_id}")));
        };

        let rule = task.rule.clone();
        task.status = TaskStatus::Pending;
        task.retry_count += 1;
        task.failure_reason = None;
        task.completed_at = None;
        info!(task_id = task.id, retries = task.retry_count, "failed task requeued");
        state.pending.push_back(task);

        self.persist_queue(&state);
        self.persist_rule_history(&state, &rule);
        self.persist_legacy(&state);
        Ok(())
    }

    /// Delete a task from the pending list or from history.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no task has `task_id`.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(pos) = state.pending.iter().position(|task| task.id == task_id) {
            state.pending.remove(pos);
            self.persist_queue(&state);
            return Ok(());
        }

        let mut removed_rule: Option<Rule> = None;
        for entries in state.history.values_mut() {
            if let Some(pos) = entries.iter().position(|task| task.id == task_id) {
                removed_rule = Some(entries.remove(pos).rule);
                break;
            }
        }
        match removed_rule {
            Some(rule) => {
                self.persist_rule_history(&state, &rule);
                self.persist_legacy(&state);
                Ok(())
            }
            None => Err(AppError::NotFound(format!("task {task_id}"))),
        }
    }

    /// Drop all history entries, keeping pending work untouched.
    pub async fn clear_history(&self) {
        let mut state = self.state.lock().await;
        let rules: Vec<Rule> = state
            .history
            .values()
            .filter_map(|entries| entries.first().map(|task| task.rule.clone()))
            .collect();
        state.history.clear();
        for rule in &rules {
            self.persist_rule_history(&state, rule);
        }
        self.persist_legacy(&state);
    }

    fn persist_queue(&self, state: &QueueState) {
        let pending: Vec<Task> = state.pending.iter().cloned().collect();
        if let Err(err) =
            self.store
                .save_queue(&pending, state.in_flight.as_ref(), state.is_processing)
        {
            warn!(%err, "queue file save failed; in-memory state stays authoritative");
        }
    }

    fn persist_rule_history(&self, state: &QueueState, rule: &Rule) {
        let empty = Vec::new();
        let entries = state.history.get(&rule.id).unwrap_or(&empty);
        if let Err(err) = self.store.save_rule_history(rule, entries, self.history_cap) {
            warn!(rule = rule.name, %err, "rule history save failed");
        }
    }

    fn persist_legacy(&self, state: &QueueState) {
        if let Err(err) = self
            .store
            .save_legacy_history(&state.history, self.history_cap)
        {
            warn!(%err, "legacy history save failed");
        }
    }
}

/// Rule id owning the globally oldest history entry.
fn oldest_history_rule(history: &HashMap<String, Vec<Task>>) -> Option<String> {
    history
        .iter()
        .filter_map(|(rule_id, entries)| entries.first().map(|task| (rule_id, task.completed_at)))
        .min_by_key(|(_, completed_at)| *completed_at)
        .map(|(rule_id, _)| rule_id.clone())
}
