//! Unit tests for the task model and its lifecycle transitions.

use chat_courier::models::{FailureReason, Task, TaskStatus};

use super::common::{forward_rule, inbound};

#[test]
fn new_task_starts_pending() {
    let rule = forward_rule("ops", "Ops Chat", "Helper");
    let task = Task::new(&inbound("hello", "Ops Chat"), rule.clone());

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.content, "hello");
    assert_eq!(task.sender_name, "bob");
    assert_eq!(task.origin_identifier, "Ops Chat");
    assert_eq!(task.rule.id, rule.id);
    assert_eq!(task.retry_count, 0);
    assert!(task.completed_at.is_none());
    assert!(task.reply_text.is_none());
    assert!(task.failure_reason.is_none());
}

#[test]
fn fan_out_tasks_get_distinct_ids() {
    let message = inbound("same message", "Ops Chat");
    let first = Task::new(&message, forward_rule("a", "Ops Chat", "Helper"));
    let second = Task::new(&message, forward_rule("b", "Ops Chat", "Helper"));

    assert_ne!(first.id, second.id, "same message under two rules must differ");
}

#[test]
fn task_id_embeds_timestamp_hash_and_rule() {
    let rule = forward_rule("ops", "Ops Chat", "Helper");
    let task = Task::new(&inbound("hello", "Ops Chat"), rule.clone());

    let mut parts = task.id.splitn(3, '_');
    let millis = parts.next().expect("timestamp part");
    let hash = parts.next().expect("hash part");
    let rule_part = parts.next().expect("rule part");

    assert!(millis.parse::<i64>().is_ok(), "timestamp must be numeric: {millis}");
    assert_eq!(hash.len(), 8, "hash prefix is four bytes in hex");
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(rule_part, rule.id);
}

#[test]
fn same_content_same_hash_prefix() {
    let rule = forward_rule("ops", "Ops Chat", "Helper");
    let first = Task::new(&inbound("identical", "Ops Chat"), rule.clone());
    let second = Task::new(&inbound("identical", "Other Chat"), rule);

    let hash_of = |id: &str| id.splitn(3, '_').nth(1).map(str::to_owned);
    assert_eq!(hash_of(&first.id), hash_of(&second.id));
}

#[test]
fn mark_completed_records_reply_and_time() {
    let mut task = Task::new(
        &inbound("hello", "Ops Chat"),
        forward_rule("ops", "Ops Chat", "Helper"),
    );
    task.mark_completed("hi there".to_owned());

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.status.is_terminal());
    assert_eq!(task.reply_text.as_deref(), Some("hi there"));
    assert!(task.completed_at.is_some());
    assert!(task.failure_reason.is_none());
}

#[test]
fn mark_failed_records_reason() {
    let mut task = Task::new(
        &inbound("hello", "Ops Chat"),
        forward_rule("ops", "Ops Chat", "Helper"),
    );
    task.mark_failed(FailureReason::DetectionTimeout);

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.status.is_terminal());
    assert_eq!(task.failure_reason, Some(FailureReason::DetectionTimeout));
    assert!(task.completed_at.is_some());
    assert!(task.reply_text.is_none());
}

#[test]
fn non_terminal_statuses() {
    assert!(!TaskStatus::Pending.is_terminal());
    assert!(!TaskStatus::Processing.is_terminal());
}

#[test]
fn failure_reason_display() {
    assert_eq!(
        FailureReason::Delivery { detail: "window gone".into() }.to_string(),
        "delivery failed: window gone"
    );
    assert_eq!(
        FailureReason::DetectionTimeout.to_string(),
        "reply detection timed out"
    );
    assert_eq!(
        FailureReason::Extraction { detail: "empty clipboard".into() }.to_string(),
        "reply extraction failed: empty clipboard"
    );
}

#[test]
fn task_serialization_round_trips() {
    let mut task = Task::new(
        &inbound("hello", "Ops Chat"),
        forward_rule("ops", "Ops Chat", "Helper"),
    );
    task.mark_completed("hi".to_owned());

    let json = serde_json::to_string(&task).expect("serializes");
    let back: Task = serde_json::from_str(&json).expect("deserializes");
    assert_eq!(back, task);
}
