//! Domain models shared across the relay pipeline.

pub mod message;
pub mod rule;
pub mod snapshot;
pub mod task;

pub use message::InboundMessage;
pub use rule::{ContentFilter, EndpointKind, Rule, RuleSource, RuleTarget};
pub use snapshot::Snapshot;
pub use task::{FailureReason, Task, TaskStatus};
