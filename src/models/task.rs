//! Queued delivery task model.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::message::InboundMessage;
use crate::models::rule::{EndpointKind, Rule};

/// Lifecycle state of a queued task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,
    /// Currently being delivered by the relay worker. At most one task is
    /// ever in this state.
    Processing,
    /// Delivered; `reply_text` holds the relayed reply.
    Completed,
    /// Delivery failed; `failure_reason` records why.
    Failed,
}

impl TaskStatus {
    /// Whether the task has reached a terminal state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a task failed, recorded on the task for the operator.
///
/// The variants are deliberately distinct: a detection timeout means the
/// destination never went visually quiet, while an extraction failure means
/// the visual signal succeeded but the reply text could not be retrieved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Send failed or the destination window was not found.
    Delivery {
        /// Driver-reported detail.
        detail: String,
    },
    /// The reply region never stabilized before the detection timeout.
    DetectionTimeout,
    /// Copying the finished reply returned nothing.
    Extraction {
        /// What went wrong during retrieval.
        detail: String,
    },
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delivery { detail } => write!(f, "delivery failed: {detail}"),
            Self::DetectionTimeout => write!(f, "reply detection timed out"),
            Self::Extraction { detail } => write!(f, "reply extraction failed: {detail}"),
        }
    }
}

/// One queued delivery attempt for a single (message, rule) pair.
///
/// The matched rule is stored by value so the task survives later rule
/// edits or deletion unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    /// Unique identifier derived from creation time, a content hash, and
    /// the matched rule id — distinct even when one message fans out to
    /// several rules.
    pub id: String,
    /// Original message body.
    pub content: String,
    /// Display name of the original sender.
    pub sender_name: String,
    /// Chat the message arrived in.
    pub origin_identifier: String,
    /// Endpoint kind the message arrived on.
    pub origin_kind: EndpointKind,
    /// Copy of the rule that matched this message.
    pub rule: Rule,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Number of operator-triggered retries.
    #[serde(default)]
    pub retry_count: u32,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Why the task failed, when `status` is `Failed`.
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
    /// The relayed reply, when `status` is `Completed`.
    #[serde(default)]
    pub reply_text: Option<String>,
}

impl Task {
    /// Create a pending task for `message` matched by `rule`.
    #[must_use]
    pub fn new(message: &InboundMessage, rule: Rule) -> Self {
        let created_at = Utc::now();
        let id = derive_id(&message.content, &rule.id, created_at);
        Self {
            id,
            content: message.content.clone(),
            sender_name: message.sender_name.clone(),
            origin_identifier: message.origin_identifier.clone(),
            origin_kind: message.origin_kind,
            rule,
            created_at,
            status: TaskStatus::Pending,
            retry_count: 0,
            completed_at: None,
            failure_reason: None,
            reply_text: None,
        }
    }

    /// Transition to `Completed` with the relayed reply text.
    pub fn mark_completed(&mut self, reply_text: String) {
        self.status = TaskStatus::Completed;
        self.reply_text = Some(reply_text);
        self.failure_reason = None;
        self.completed_at = Some(Utc::now());
    }

    /// Transition to `Failed` with the triggering condition.
    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.status = TaskStatus::Failed;
        self.failure_reason = Some(reason);
        self.completed_at = Some(Utc::now());
    }
}

/// Derive a task id from creation time, a content hash, and the rule id.
fn derive_id(content: &str, rule_id: &str, created_at: DateTime<Utc>) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let hash_prefix: String = digest
        .iter()
        .take(4)
        .fold(String::with_capacity(8), |mut acc, byte| {
            use std::fmt::Write as _;
            let _ = write!(acc, "{byte:02x}");
            acc
        });
    format!(
        "{}_{hash_prefix}_{rule_id}",
        created_at.timestamp_millis()
    )
}
