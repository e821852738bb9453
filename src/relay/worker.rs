//! Relay worker — the single serialized consumer of the durable queue.
//!
//! Pulls one task at a time, delivers it to the rule's target, waits for
//! the asynchronous reply when the target is an assistant endpoint, and
//! relays the copied reply back to the task's origin. Every failure is
//! caught and recorded on the task; one task failing never halts the loop.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::config::DetectionConfig;
use crate::detector::{CompletionDetector, DetectionOutcome, SnapshotSource};
use crate::driver::EndpointDriver;
use crate::models::rule::EndpointKind;
use crate::models::snapshot::Snapshot;
use crate::models::task::{FailureReason, Task};
use crate::queue::{DurableQueue, TaskResolution};
use crate::relay::guard::ReplyGuard;
use crate::Result;

/// Reply note recorded for targets that do not produce asynchronous
/// replies: the delivery itself is the whole job.
pub const FORWARDED_NOTE: &str = "message forwarded";

/// How one delivery attempt ended.
enum DeliveryOutcome {
    /// Delivered; payload is the relayed reply (or [`FORWARDED_NOTE`]).
    Completed(String),
    /// Failed with a reason for the task record.
    Failed(FailureReason),
    /// Forwarding stopped mid-delivery. The task stays in-flight on disk
    /// and surfaces through recovery at the next start.
    Cancelled,
}

/// Single-loop delivery driver.
pub struct RelayWorker {
    queue: Arc<DurableQueue>,
    driver: Arc<dyn EndpointDriver>,
    guard: Arc<ReplyGuard>,
    detection: DetectionConfig,
    idle_poll: Duration,
    cancel: CancellationToken,
}

impl RelayWorker {
    /// Construct a worker bound to the shared queue and driver.
    #[must_use]
    pub fn new(
        queue: Arc<DurableQueue>,
        driver: Arc<dyn EndpointDriver>,
        guard: Arc<ReplyGuard>,
        detection: DetectionConfig,
        idle_poll: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            driver,
            guard,
            detection,
            idle_poll,
            cancel,
        }
    }

    /// Run the delivery loop until forwarding stops.
    pub async fn run(self) {
        info!("relay worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.queue.dequeue().await {
                Some(task) => {
                    let task_id = task.id.clone();
                    self.process(task)
                        .instrument(info_span!("delivery", task_id))
                        .await;
                }
                None => {
                    // Idle wait between empty dequeue attempts.
                    tokio::select! {
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(self.idle_poll) => {}
                    }
                }
            }
        }
        info!("relay worker stopped");
    }

    /// Deliver one task and record its outcome.
    async fn process(&self, task: Task) {
        info!(
            rule = task.rule.name,
            target = task.rule.target.identifier,
            "processing task"
        );
        match self.deliver(&task).await {
            DeliveryOutcome::Completed(reply) => {
                self.queue.complete(task, TaskResolution::Replied(reply)).await;
            }
            DeliveryOutcome::Failed(reason) => {
                self.queue.complete(task, TaskResolution::Failed(reason)).await;
            }
            DeliveryOutcome::Cancelled => {
                info!("delivery interrupted by forwarding stop; task left for recovery");
            }
        }
    }

    async fn deliver(&self, task: &Task) -> DeliveryOutcome {
        let target = &task.rule.target;
        let rendered = render_content(task);

        if let Err(err) = self
            .driver
            .send(target.kind, &target.identifier, &rendered)
            .await
        {
            return DeliveryOutcome::Failed(FailureReason::Delivery {
                detail: err.to_string(),
            });
        }
        debug!(target = target.identifier, "message delivered to target");

        if !target.kind.expects_async_reply() {
            return DeliveryOutcome::Completed(FORWARDED_NOTE.to_owned());
        }

        // The detector needs the destination window to exist before it can
        // capture anything.
        match self
            .driver
            .find_window(target.kind, &target.identifier)
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                return DeliveryOutcome::Failed(FailureReason::Delivery {
                    detail: format!("window for '{}' not found", target.identifier),
                });
            }
            Err(err) => {
                return DeliveryOutcome::Failed(FailureReason::Delivery {
                    detail: err.to_string(),
                });
            }
        }

        let detector = CompletionDetector::new(
            self.detection.initial_delay(),
            self.detection.poll_interval(),
            self.detection.timeout(),
            self.detection.stability_threshold,
            self.cancel.clone(),
        );
        let source = RegionSource {
            driver: Arc::clone(&self.driver),
            kind: target.kind,
            identifier: target.identifier.clone(),
        };

        match detector.wait_for_stable(&source).await {
            Ok(DetectionOutcome::Stable(_)) => {}
            Ok(DetectionOutcome::TimedOut) => {
                return DeliveryOutcome::Failed(FailureReason::DetectionTimeout);
            }
            Ok(DetectionOutcome::Cancelled) => return DeliveryOutcome::Cancelled,
            Err(err) => {
                return DeliveryOutcome::Failed(FailureReason::Delivery {
                    detail: format!("baseline capture failed: {err}"),
                });
            }
        }

        let reply = match self.driver.copy_reply(target.kind, &target.identifier).await {
            Ok(reply) => reply,
            Err(err) => {
                return DeliveryOutcome::Failed(FailureReason::Extraction {
                    detail: err.to_string(),
                });
            }
        };
        let reply = reply.trim();
        if reply.is_empty() {
            return DeliveryOutcome::Failed(FailureReason::Extraction {
                detail: "copied reply was empty".into(),
            });
        }

        // Remember the reply before relaying it back, so its echo through
        // the listener path is recognized and dropped.
        self.guard.record(reply);

        if let Err(err) = self
            .driver
            .send(task.origin_kind, &task.origin_identifier, reply)
            .await
        {
            return DeliveryOutcome::Failed(FailureReason::Delivery {
                detail: format!("reply relay to origin failed: {err}"),
            });
        }
        info!(origin = task.origin_identifier, "reply relayed back to origin");

        DeliveryOutcome::Completed(reply.to_owned())
    }
}

/// Original text prefixed with its provenance.
fn render_content(task: &Task) -> String {
    format!(
        "[from {}] {}: {}",
        task.origin_identifier, task.sender_name, task.content
    )
}

/// [`SnapshotSource`] binding the endpoint driver to one destination.
struct RegionSource {
    driver: Arc<dyn EndpointDriver>,
    kind: EndpointKind,
    identifier: String,
}

impl SnapshotSource for RegionSource {
    fn capture(&self) -> Pin<Box<dyn Future<Output = Result<Snapshot>> + Send + '_>> {
        Box::pin(async move {
            self.driver
                .capture_reply_region(self.kind, &self.identifier)
                .await
        })
    }
}
