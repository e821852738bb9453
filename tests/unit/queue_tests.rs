//! Unit tests for the durable queue: FIFO order, the single in-flight
//! invariant, history capping, trimming, and operator mutations.

use chat_courier::models::{FailureReason, TaskStatus};
use chat_courier::queue::store::QueueStore;
use chat_courier::queue::{DurableQueue, TaskResolution};
use chat_courier::AppError;

use super::common::{forward_rule, inbound};

fn open_queue(dir: &tempfile::TempDir, history_cap: usize) -> DurableQueue {
    let store = QueueStore::new(dir.path()).expect("store in tempdir");
    DurableQueue::open(store, history_cap).0
}

#[tokio::test]
async fn enqueue_fans_out_one_task_per_rule() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);

    let rules = vec![
        forward_rule("a", "Ops Chat", "Helper"),
        forward_rule("b", "Ops Chat", "Other"),
    ];
    let ids = queue.enqueue(&inbound("hello", "Ops Chat"), rules).await;

    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
    let status = queue.status().await;
    assert_eq!(status.pending, 2);
    assert!(!status.processing);
}

#[tokio::test]
async fn dequeue_is_fifo() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    queue.enqueue(&inbound("first", "Ops Chat"), vec![rule.clone()]).await;
    queue.enqueue(&inbound("second", "Ops Chat"), vec![rule]).await;

    let task = queue.dequeue().await.expect("first task");
    assert_eq!(task.content, "first");
    assert_eq!(task.status, TaskStatus::Processing);
}

#[tokio::test]
async fn at_most_one_task_is_in_flight() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    queue.enqueue(&inbound("first", "Ops Chat"), vec![rule.clone()]).await;
    queue.enqueue(&inbound("second", "Ops Chat"), vec![rule]).await;

    let first = queue.dequeue().await.expect("first task");
    assert!(
        queue.dequeue().await.is_none(),
        "second dequeue must refuse while a delivery is in flight"
    );

    queue.complete(first, TaskResolution::Replied("ok".into())).await;

    let second = queue.dequeue().await.expect("released after completion");
    assert_eq!(second.content, "second");
}

#[tokio::test]
async fn dequeue_on_empty_returns_none_immediately() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    assert!(queue.dequeue().await.is_none());
}

#[tokio::test]
async fn complete_moves_task_into_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    queue.enqueue(&inbound("hello", "Ops Chat"), vec![rule]).await;
    let task = queue.dequeue().await.expect("task");
    let task_id = task.id.clone();
    queue.complete(task, TaskResolution::Replied("hi".into())).await;

    let status = queue.status().await;
    assert_eq!(status.pending, 0);
    assert!(!status.processing);
    assert_eq!(status.history, 1);

    let history = queue.history_tasks().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, task_id);
    assert_eq!(history[0].status, TaskStatus::Completed);
    assert_eq!(history[0].reply_text.as_deref(), Some("hi"));
}

#[tokio::test]
async fn history_cap_evicts_oldest_entries() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 2);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    for n in 0..4 {
        queue
            .enqueue(&inbound(&format!("message {n}"), "Ops Chat"), vec![rule.clone()])
            .await;
        let task = queue.dequeue().await.expect("task");
        queue.complete(task, TaskResolution::Replied("ok".into())).await;
    }

    let history = queue.history_tasks().await;
    assert_eq!(history.len(), 2, "history must stay at the cap");
    assert_eq!(history[0].content, "message 2");
    assert_eq!(history[1].content, "message 3");
}

#[tokio::test]
async fn trim_evicts_history_before_pending() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    // Two terminal tasks, then three pending ones.
    for n in 0..2 {
        queue
            .enqueue(&inbound(&format!("done {n}"), "Ops Chat"), vec![rule.clone()])
            .await;
        let task = queue.dequeue().await.expect("task");
        queue.complete(task, TaskResolution::Replied("ok".into())).await;
    }
    for n in 0..3 {
        queue
            .enqueue(&inbound(&format!("waiting {n}"), "Ops Chat"), vec![rule.clone()])
            .await;
    }

    queue.trim(3).await;

    let status = queue.status().await;
    assert_eq!(status.history, 0, "history is evicted first");
    assert_eq!(status.pending, 3, "pending survives while history suffices");

    queue.trim(2).await;
    let pending = queue.pending_tasks().await;
    assert_eq!(pending.len(), 2, "then the oldest pending goes");
    assert_eq!(pending[0].content, "waiting 1");
}

#[tokio::test]
async fn trim_within_bound_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");
    queue.enqueue(&inbound("hello", "Ops Chat"), vec![rule]).await;

    queue.trim(10).await;
    assert_eq!(queue.status().await.pending, 1);
}

#[tokio::test]
async fn retry_failed_requeues_with_bumped_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    queue.enqueue(&inbound("hello", "Ops Chat"), vec![rule]).await;
    let task = queue.dequeue().await.expect("task");
    let task_id = task.id.clone();
    queue
        .complete(task, TaskResolution::Failed(FailureReason::DetectionTimeout))
        .await;

    queue.retry_failed(&task_id).await.expect("retry succeeds");

    let status = queue.status().await;
    assert_eq!(status.pending, 1);
    assert_eq!(status.history, 0);

    let requeued = queue.dequeue().await.expect("requeued task");
    assert_eq!(requeued.id, task_id);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.failure_reason.is_none());
}

#[tokio::test]
async fn retry_rejects_unknown_and_completed_tasks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    queue.enqueue(&inbound("hello", "Ops Chat"), vec![rule]).await;
    let task = queue.dequeue().await.expect("task");
    let completed_id = task.id.clone();
    queue.complete(task, TaskResolution::Replied("ok".into())).await;

    assert!(matches!(
        queue.retry_failed("no-such-task").await,
        Err(AppError::NotFound(_))
    ));
    assert!(
        matches!(queue.retry_failed(&completed_id).await, Err(AppError::NotFound(_))),
        "completed tasks are not retryable"
    );
}

#[tokio::test]
async fn delete_task_from_pending_and_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    let ids = queue.enqueue(&inbound("hello", "Ops Chat"), vec![rule.clone()]).await;
    queue.delete_task(&ids[0]).await.expect("delete pending");
    assert_eq!(queue.status().await.pending, 0);

    queue.enqueue(&inbound("again", "Ops Chat"), vec![rule]).await;
    let task = queue.dequeue().await.expect("task");
    let history_id = task.id.clone();
    queue.complete(task, TaskResolution::Replied("ok".into())).await;
    queue.delete_task(&history_id).await.expect("delete from history");
    assert_eq!(queue.status().await.history, 0);

    assert!(matches!(
        queue.delete_task("no-such-task").await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn clear_history_keeps_pending_work() {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = open_queue(&dir, 100);
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    queue.enqueue(&inbound("done", "Ops Chat"), vec![rule.clone()]).await;
    let task = queue.dequeue().await.expect("task");
    queue.complete(task, TaskResolution::Replied("ok".into())).await;
    queue.enqueue(&inbound("waiting", "Ops Chat"), vec![rule]).await;

    queue.clear_history().await;

    let status = queue.status().await;
    assert_eq!(status.history, 0);
    assert_eq!(status.pending, 1);
}

#[tokio::test]
async fn reopening_reinstates_interrupted_in_flight_task() {
    let dir = tempfile::tempdir().expect("tempdir");
    let rule = forward_rule("ops", "Ops Chat", "Helper");

    let in_flight_id = {
        let queue = open_queue(&dir, 100);
        queue.enqueue(&inbound("caught mid-flight", "Ops Chat"), vec![rule.clone()]).await;
        queue.enqueue(&inbound("still waiting", "Ops Chat"), vec![rule]).await;
        // Dequeue and drop the queue without completing, as a crash would.
        queue.dequeue().await.expect("task").id
    };

    let store = QueueStore::new(dir.path()).expect("store");
    let (queue, report) = DurableQueue::open(store, 100);

    assert!(report.reinstated);
    assert_eq!(report.pending, 2);
    assert!(report.needs_attention());

    let status = queue.status().await;
    assert!(!status.processing, "stale processing flag must be cleared");

    let head = queue.dequeue().await.expect("reinstated task");
    assert_eq!(head.id, in_flight_id, "interrupted task returns at the head");
}
