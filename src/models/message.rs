//! Inbound message model delivered by an endpoint driver's listener path.

use crate::models::rule::EndpointKind;

/// A message observed in a monitored source chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Raw message body.
    pub content: String,
    /// Display name of the sender inside the chat.
    pub sender_name: String,
    /// Identifier of the chat the message arrived in.
    pub origin_identifier: String,
    /// Endpoint kind the message arrived on.
    pub origin_kind: EndpointKind,
    /// Set by the driver when the message was authored by the relay's own
    /// account. Self-authored messages are never forwarded.
    pub self_authored: bool,
}
