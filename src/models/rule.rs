//! Forwarding rule model.
//!
//! A rule binds a source endpoint (kind + chat identifier + content filter)
//! to a target endpoint. Rules are mutable configuration owned by the
//! [`RuleTable`](crate::rules::RuleTable); each queued task carries its own
//! copy of the matched rule so the task stays replayable even if the rule is
//! later edited or deleted. That duplication is deliberate, not aliasing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which chat application an endpoint belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Personal messenger — the side that originates relayed messages.
    Messenger,
    /// Assistant-backed workspace app whose replies are generated
    /// asynchronously after a delivery.
    Assistant,
}

impl EndpointKind {
    /// Whether deliveries to this endpoint produce an asynchronous reply
    /// that must be awaited with the completion detector.
    #[must_use]
    pub fn expects_async_reply(self) -> bool {
        matches!(self, Self::Assistant)
    }

    /// Stable lowercase label used in history filenames and logs.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Messenger => "messenger",
            Self::Assistant => "assistant",
        }
    }
}

/// Content filter applied to inbound messages on the rule's source side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum ContentFilter {
    /// Every message matches.
    All,
    /// Matches when `start_marker` appears in the message and `end_marker`
    /// appears after it in the same body.
    Range {
        /// Opening marker substring.
        start_marker: String,
        /// Closing marker substring, searched after the opening marker.
        end_marker: String,
    },
    /// Matches when the message mentions the configured operator name,
    /// either as `@name` or with a full-width `＠name`.
    MentionsTarget,
}

impl ContentFilter {
    /// Evaluate the filter against a message body.
    ///
    /// `operator_name` is the mention target for [`ContentFilter::MentionsTarget`];
    /// an empty name never matches a mention.
    #[must_use]
    pub fn matches(&self, content: &str, operator_name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Range {
                start_marker,
                end_marker,
            } => match content.find(start_marker.as_str()) {
                Some(pos) => content[pos + start_marker.len()..].contains(end_marker.as_str()),
                None => false,
            },
            Self::MentionsTarget => {
                if operator_name.is_empty() {
                    return false;
                }
                content.contains(&format!("@{operator_name}"))
                    || content.contains(&format!("＠{operator_name}"))
            }
        }
    }
}

/// Source side of a forwarding rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleSource {
    /// Endpoint kind the message must originate from.
    pub kind: EndpointKind,
    /// Source chat identifier; an empty string matches any chat of `kind`.
    #[serde(default)]
    pub identifier: String,
    /// Content filter the message body must satisfy.
    #[serde(flatten)]
    pub filter: ContentFilter,
}

/// Target side of a forwarding rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuleTarget {
    /// Endpoint kind the message is delivered to.
    pub kind: EndpointKind,
    /// Target chat identifier.
    pub identifier: String,
}

/// A single forwarding rule.
///
/// Identity is `id`, stable across edits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    /// Unique rule identifier (UUID v4). Generated when the configuration
    /// omits it.
    #[serde(default = "generate_rule_id")]
    pub id: String,
    /// Operator-facing display name.
    pub name: String,
    /// Disabled rules are skipped by the matcher.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Source endpoint and content filter.
    pub source: RuleSource,
    /// Target endpoint.
    pub target: RuleTarget,
}

fn default_enabled() -> bool {
    true
}

fn generate_rule_id() -> String {
    Uuid::new_v4().to_string()
}

impl Rule {
    /// Construct an enabled rule with a generated identifier.
    #[must_use]
    pub fn new(name: impl Into<String>, source: RuleSource, target: RuleTarget) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            enabled: true,
            source,
            target,
        }
    }
}
