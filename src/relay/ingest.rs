//! Inbound message ingestion.
//!
//! One consumer task drains the driver's inbound channel: self-authored
//! and loop-guard-matched messages are dropped, everything else is matched
//! against the rule table and fans out into one queued task per match,
//! after which the queue is trimmed back under its configured cap.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::message::InboundMessage;
use crate::queue::DurableQueue;
use crate::relay::guard::ReplyGuard;
use crate::rules::RuleTable;

/// Spawn the ingest consumer task.
///
/// Runs until `cancel` fires or the inbound channel closes.
#[must_use]
pub fn spawn_ingest_consumer(
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    rules: Arc<RuleTable>,
    queue: Arc<DurableQueue>,
    guard: Arc<ReplyGuard>,
    max_total: usize,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("ingest consumer started");
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => {
                    info!("ingest consumer shutting down");
                    break;
                }
                maybe_message = inbound_rx.recv() => {
                    let Some(message) = maybe_message else {
                        info!("inbound channel closed");
                        break;
                    };
                    message
                }
            };

            if message.self_authored {
                debug!(origin = message.origin_identifier, "self-authored message skipped");
                continue;
            }
            if guard.is_recent_reply(&message.content) {
                debug!(
                    origin = message.origin_identifier,
                    "message matches a recent relayed reply, skipped"
                );
                continue;
            }

            let matched = rules.match_rules(
                &message.content,
                &message.origin_identifier,
                message.origin_kind,
            );
            if matched.is_empty() {
                debug!(origin = message.origin_identifier, "no rule matched, skipped");
                continue;
            }

            let ids = queue.enqueue(&message, matched).await;
            info!(
                origin = message.origin_identifier,
                sender = message.sender_name,
                tasks = ids.len(),
                "inbound message enqueued"
            );
            queue.trim(max_total).await;
        }
    })
}
