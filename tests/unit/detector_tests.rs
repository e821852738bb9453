//! Unit tests for visual-stability completion detection.
//!
//! Feeds scripted snapshot sequences through [`SnapshotSource`] with short
//! real intervals; no endpoint driver is involved.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use chat_courier::detector::{CompletionDetector, DetectionOutcome, SnapshotSource};
use chat_courier::models::Snapshot;
use chat_courier::{AppError, Result};

/// Source that replays a scripted capture sequence, then repeats the
/// fallback snapshot forever.
struct ScriptedSource {
    script: Mutex<VecDeque<Result<Snapshot>>>,
    fallback: Snapshot,
}

impl ScriptedSource {
    fn new(script: Vec<Result<Snapshot>>, fallback: &str) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Snapshot::from(fallback),
        }
    }
}

impl SnapshotSource for ScriptedSource {
    fn capture(&self) -> Pin<Box<dyn Future<Output = Result<Snapshot>> + Send + '_>> {
        Box::pin(async move {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        })
    }
}

/// Source whose every capture differs from the last.
struct EverChangingSource {
    counter: AtomicU32,
}

impl SnapshotSource for EverChangingSource {
    fn capture(&self) -> Pin<Box<dyn Future<Output = Result<Snapshot>> + Send + '_>> {
        Box::pin(async move {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(Snapshot::new(n.to_string().into_bytes()))
        })
    }
}

fn fast_detector(threshold: u32, timeout_ms: u64) -> (CompletionDetector, CancellationToken) {
    let ct = CancellationToken::new();
    let detector = CompletionDetector::new(
        Duration::from_millis(1),
        Duration::from_millis(5),
        Duration::from_millis(timeout_ms),
        threshold,
        ct.clone(),
    );
    (detector, ct)
}

#[tokio::test]
async fn unchanged_capture_is_stable_after_one_interval() {
    let source = ScriptedSource::new(vec![Ok(Snapshot::from("reply"))], "reply");
    let (detector, _ct) = fast_detector(1, 500);

    let outcome = detector.wait_for_stable(&source).await.expect("no capture error");
    assert_eq!(outcome, DetectionOutcome::Stable(Snapshot::from("reply")));
}

#[tokio::test]
async fn changed_capture_resets_the_baseline() {
    // Baseline "partial", then "full" twice: the change resets stability,
    // the repeat declares it.
    let source = ScriptedSource::new(
        vec![Ok(Snapshot::from("partial")), Ok(Snapshot::from("full"))],
        "full",
    );
    let (detector, _ct) = fast_detector(1, 500);

    let outcome = detector.wait_for_stable(&source).await.expect("no capture error");
    assert_eq!(outcome, DetectionOutcome::Stable(Snapshot::from("full")));
}

#[tokio::test]
async fn threshold_two_needs_two_unchanged_intervals() {
    let source = ScriptedSource::new(vec![Ok(Snapshot::from("reply"))], "reply");
    let (detector, _ct) = fast_detector(2, 500);

    let outcome = detector.wait_for_stable(&source).await.expect("no capture error");
    assert_eq!(outcome, DetectionOutcome::Stable(Snapshot::from("reply")));
}

#[tokio::test]
async fn never_stabilizing_region_times_out() {
    let source = EverChangingSource {
        counter: AtomicU32::new(0),
    };
    let (detector, _ct) = fast_detector(1, 60);

    let outcome = detector.wait_for_stable(&source).await.expect("no capture error");
    assert_eq!(outcome, DetectionOutcome::TimedOut);
}

#[tokio::test]
async fn cancellation_during_initial_delay() {
    let source = ScriptedSource::new(Vec::new(), "reply");
    let ct = CancellationToken::new();
    let detector = CompletionDetector::new(
        Duration::from_secs(30),
        Duration::from_millis(5),
        Duration::from_secs(60),
        1,
        ct.clone(),
    );
    ct.cancel();

    let outcome = detector.wait_for_stable(&source).await.expect("no capture error");
    assert_eq!(outcome, DetectionOutcome::Cancelled);
}

#[tokio::test]
async fn cancellation_mid_poll() {
    let source = EverChangingSource {
        counter: AtomicU32::new(0),
    };
    let ct = CancellationToken::new();
    let detector = CompletionDetector::new(
        Duration::from_millis(1),
        Duration::from_millis(20),
        Duration::from_secs(60),
        1,
        ct.clone(),
    );

    let cancel = ct.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
    });

    let outcome = detector.wait_for_stable(&source).await.expect("no capture error");
    assert_eq!(outcome, DetectionOutcome::Cancelled);
}

#[tokio::test]
async fn baseline_capture_failure_is_an_error() {
    let source = ScriptedSource::new(
        vec![Err(AppError::Driver("capture broke".into()))],
        "unused",
    );
    let (detector, _ct) = fast_detector(1, 500);

    let err = detector.wait_for_stable(&source).await.expect_err("baseline error propagates");
    assert!(matches!(err, AppError::Driver(_)), "got {err:?}");
}

#[tokio::test]
async fn poll_capture_failure_is_skipped() {
    // Baseline ok, one failed poll, then a matching capture: the failure
    // must not abort detection or disturb the baseline.
    let source = ScriptedSource::new(
        vec![
            Ok(Snapshot::from("reply")),
            Err(AppError::Driver("transient".into())),
        ],
        "reply",
    );
    let (detector, _ct) = fast_detector(1, 500);

    let outcome = detector.wait_for_stable(&source).await.expect("no fatal error");
    assert_eq!(outcome, DetectionOutcome::Stable(Snapshot::from("reply")));
}
