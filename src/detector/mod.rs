//! Visual-stability completion detection.
//!
//! After a delivery to an assistant endpoint, the destination renders its
//! reply incrementally and offers no cooperative completion signal. The
//! detector's proxy for "generation finished" is stability: it repeatedly
//! captures the destination's reply region and declares completion once a
//! capture stops changing for a configured number of poll intervals.
//!
//! The detector is an explicit state machine — `Waiting` (initial delay) →
//! `Polling` → `Stable` | `TimedOut` — rather than nested timers, so it can
//! be unit-tested by feeding a scripted snapshot sequence instead of real
//! captures. Every wait point also honors the forwarding-stopped token, so
//! cancellation takes effect within one poll interval.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::snapshot::Snapshot;
use crate::Result;

/// Producer of reply-region snapshots for one destination.
///
/// The relay worker binds an endpoint driver and a target to this trait;
/// tests substitute a scripted sequence.
pub trait SnapshotSource: Send + Sync {
    /// Capture the destination's reply region.
    fn capture(&self) -> Pin<Box<dyn Future<Output = Result<Snapshot>> + Send + '_>>;
}

/// How a detection run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// The reply region stopped changing; the final snapshot is returned
    /// for reply extraction.
    Stable(Snapshot),
    /// The region never stabilized before the timeout elapsed.
    TimedOut,
    /// Forwarding was stopped mid-wait.
    Cancelled,
}

/// Phase of a detection run, used for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Polling,
}

/// Polls a [`SnapshotSource`] until its output stabilizes or a deadline
/// passes.
pub struct CompletionDetector {
    initial_delay: Duration,
    poll_interval: Duration,
    timeout: Duration,
    stability_threshold: u32,
    cancel: CancellationToken,
}

impl CompletionDetector {
    /// Construct a detector.
    ///
    /// `stability_threshold` is the number of consecutive unchanged
    /// intervals required; the conventional value is 1 — a single unchanged
    /// interval after the initial delay is sufficient.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        poll_interval: Duration,
        timeout: Duration,
        stability_threshold: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            initial_delay,
            poll_interval,
            timeout,
            stability_threshold,
            cancel,
        }
    }

    /// Run the detection state machine against `source`.
    ///
    /// Capture failures while polling are logged and skipped — the baseline
    /// is kept and the next interval tries again. A failed baseline capture
    /// is an error, since without it there is nothing to compare against.
    ///
    /// # Errors
    ///
    /// Returns the underlying error when the baseline capture fails.
    pub async fn wait_for_stable(&self, source: &dyn SnapshotSource) -> Result<DetectionOutcome> {
        debug!(
            phase = ?Phase::Waiting,
            delay_secs = self.initial_delay.as_secs_f64(),
            "detection started"
        );

        if self.sleep_cancellable(self.initial_delay).await {
            return Ok(DetectionOutcome::Cancelled);
        }

        let mut baseline = source.capture().await?;
        let started = Instant::now();
        let mut stable_count: u32 = 0;
        let mut poll_count: u32 = 0;
        debug!(phase = ?Phase::Polling, "baseline captured, polling");

        while started.elapsed() < self.timeout {
            if self.sleep_cancellable(self.poll_interval).await {
                info!("detection cancelled by forwarding stop");
                return Ok(DetectionOutcome::Cancelled);
            }
            poll_count += 1;

            let current = match source.capture().await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(poll_count, %err, "capture failed, keeping baseline");
                    continue;
                }
            };

            if current == baseline {
                stable_count += 1;
                debug!(poll_count, stable_count, "region unchanged");
                if stable_count >= self.stability_threshold {
                    info!(
                        poll_count,
                        elapsed_secs = started.elapsed().as_secs_f64(),
                        "reply region stable"
                    );
                    return Ok(DetectionOutcome::Stable(current));
                }
            } else {
                debug!(poll_count, "region changed, resetting stability counter");
                stable_count = 0;
                baseline = current;
            }
        }

        info!(
            poll_count,
            timeout_secs = self.timeout.as_secs_f64(),
            "detection timed out"
        );
        Ok(DetectionOutcome::TimedOut)
    }

    /// Sleep for `duration`; returns `true` when cancelled mid-sleep.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => true,
            () = tokio::time::sleep(duration) => false,
        }
    }
}
