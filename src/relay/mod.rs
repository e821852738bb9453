//! Relay pipeline service.
//!
//! [`RelayService`] owns the shared pieces — rule table, durable queue,
//! loop guard, endpoint driver — as an injected service object, and starts
//! or stops the forwarding session: one ingest consumer feeding the queue
//! and exactly one relay worker draining it. Operator mutations (retry,
//! delete, clear history) pass through to the queue and never require a
//! restart.

pub mod guard;
pub mod ingest;
pub mod worker;

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::CourierConfig;
use crate::driver::EndpointDriver;
use crate::models::message::InboundMessage;
use crate::models::task::Task;
use crate::queue::{DurableQueue, QueueStatus};
use crate::rules::RuleTable;
use crate::{AppError, Result};

use guard::ReplyGuard;
use worker::RelayWorker;

/// Background tasks of one forwarding session.
struct ForwardingSession {
    cancel: CancellationToken,
    ingest: JoinHandle<()>,
    worker: JoinHandle<()>,
}

/// Owner of the relay pipeline.
pub struct RelayService {
    config: Arc<CourierConfig>,
    rules: Arc<RuleTable>,
    queue: Arc<DurableQueue>,
    driver: Arc<dyn EndpointDriver>,
    guard: Arc<ReplyGuard>,
    session: Mutex<Option<ForwardingSession>>,
}

impl RelayService {
    /// Assemble the service from its injected collaborators.
    #[must_use]
    pub fn new(
        config: Arc<CourierConfig>,
        rules: Arc<RuleTable>,
        queue: Arc<DurableQueue>,
        driver: Arc<dyn EndpointDriver>,
    ) -> Self {
        let guard = Arc::new(ReplyGuard::new(
            config.guard.recent_replies,
            config.guard.similarity_threshold,
        ));
        Self {
            config,
            rules,
            queue,
            driver,
            guard,
            session: Mutex::new(None),
        }
    }

    /// Start forwarding: validate the rule set, then spawn the ingest
    /// consumer and the relay worker on a fresh cancellation token.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] when the rule set fails validation or
    /// forwarding is already running.
    pub async fn start_forwarding(
        &self,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Result<()> {
        self.rules.validate()?;

        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(AppError::Config("forwarding is already running".into()));
        }

        let cancel = CancellationToken::new();

        let ingest = ingest::spawn_ingest_consumer(
            inbound_rx,
            Arc::clone(&self.rules),
            Arc::clone(&self.queue),
            Arc::clone(&self.guard),
            self.config.queue.max_total,
            cancel.clone(),
        );

        let relay_worker = RelayWorker::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.driver),
            Arc::clone(&self.guard),
            self.config.detection.clone(),
            self.config.queue.idle_poll(),
            cancel.clone(),
        );
        let worker = tokio::spawn(relay_worker.run());

        *session = Some(ForwardingSession {
            cancel,
            ingest,
            worker,
        });
        info!(rules = self.rules.len(), "forwarding started");
        Ok(())
    }

    /// Stop forwarding. The worker and any in-progress detection wait exit
    /// at their next check point; a task caught mid-delivery stays
    /// persisted as in-flight and resurfaces through recovery.
    pub async fn stop_forwarding(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        session.cancel.cancel();
        if let Err(err) = session.ingest.await {
            warn!(%err, "ingest consumer join failed");
        }
        if let Err(err) = session.worker.await {
            warn!(%err, "relay worker join failed");
        }
        info!("forwarding stopped");
    }

    /// Whether a forwarding session is active.
    pub async fn is_forwarding(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// The shared rule table.
    #[must_use]
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Current queue counters.
    pub async fn queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    /// Pending tasks in delivery order.
    pub async fn pending_tasks(&self) -> Vec<Task> {
        self.queue.pending_tasks().await
    }

    /// Merged terminal-task history.
    pub async fn history_tasks(&self) -> Vec<Task> {
        self.queue.history_tasks().await
    }

    /// Requeue a failed task for another delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no failed task has `task_id`.
    pub async fn retry_failed(&self, task_id: &str) -> Result<()> {
        self.queue.retry_failed(task_id).await
    }

    /// Delete a task from the queue or its history.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotFound`] when no task has `task_id`.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        self.queue.delete_task(task_id).await
    }

    /// Drop all history entries.
    pub async fn clear_history(&self) {
        self.queue.clear_history().await;
    }
}
