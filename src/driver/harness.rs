//! Child-process endpoint harness driver.
//!
//! The platform-specific automation layer (UI traversal, screen capture,
//! clipboard access) lives in an external *harness* process. The relay
//! spawns it with `kill_on_drop` and speaks newline-delimited JSON over its
//! stdio:
//!
//! - **Requests** (relay → harness): `{"id", "op", "endpoint", "chat", …}`.
//!   The harness answers each with a response frame carrying the same `id`.
//! - **Events** (harness → relay): unsolicited frames such as
//!   `{"event": "message", …}` for inbound chat messages, which feed the
//!   ingest channel.
//!
//! Snapshot payloads cross the wire as opaque strings — typically a digest
//! of the captured region — and are only ever compared for equality.
//!
//! | Op            | Response payload          |
//! |---------------|---------------------------|
//! | `send`        | ack only                  |
//! | `capture`     | `data`: snapshot string   |
//! | `copy`        | `text`: reply text        |
//! | `find_window` | `handle`: u64 or absent   |

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HarnessConfig;
use crate::driver::{DriverFuture, EndpointDriver, WindowHandle};
use crate::models::message::InboundMessage;
use crate::models::rule::EndpointKind;
use crate::models::snapshot::Snapshot;
use crate::{AppError, Result};

/// Maximum accepted NDJSON line length from the harness: 4 MiB.
///
/// Capture payloads are the largest frames; anything beyond this indicates
/// a misbehaving harness and fails the pending request instead of letting
/// the relay allocate unbounded memory.
const MAX_LINE_BYTES: usize = 4 * 1_048_576;

/// Buffered inbound messages awaiting the ingest consumer.
const INBOUND_BUFFER: usize = 64;

#[derive(Debug, Serialize)]
struct RequestFrame<'a> {
    id: u64,
    op: &'static str,
    endpoint: &'static str,
    chat: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ResponseFrame {
    id: u64,
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    handle: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EventFrame {
    event: String,
    #[serde(default)]
    endpoint: Option<EndpointKind>,
    #[serde(default)]
    chat: String,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    text: String,
    #[serde(default, rename = "self")]
    self_authored: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Response(ResponseFrame),
    Event(EventFrame),
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseFrame>>>>;

/// [`EndpointDriver`] backed by a spawned harness process.
pub struct HarnessDriver {
    writer_tx: mpsc::Sender<String>,
    pending: PendingMap,
    next_id: AtomicU64,
    request_timeout: Duration,
    /// Keeps the child alive; `kill_on_drop` cleans it up with the driver.
    _child: Mutex<Child>,
}

impl HarnessDriver {
    /// Spawn the harness process and wire up its stdio tasks.
    ///
    /// Waits up to the configured startup timeout for the harness's ready
    /// event (its first stdout line) before returning. The second element
    /// of the returned pair is the channel of inbound chat messages the
    /// harness observes in monitored chats.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`] when the process cannot be spawned,
    /// exits before its ready line, or stays silent past the startup
    /// timeout.
    pub async fn spawn(
        config: &HarnessConfig,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundMessage>)> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AppError::Driver(format!("failed to spawn harness '{}': {err}", config.command))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Driver("harness stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Driver("harness stdout unavailable".into()))?;

        let mut frames = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

        // The first stdout line is the ready signal.
        let ready = tokio::time::timeout(config.startup_timeout(), frames.next())
            .await
            .map_err(|_| {
                AppError::Driver(format!(
                    "harness startup timeout after {}s",
                    config.startup_timeout_seconds
                ))
            })?;
        match ready {
            Some(Ok(line)) => debug!(line, "harness ready"),
            Some(Err(err)) => {
                return Err(AppError::Driver(format!("harness ready line unreadable: {err}")))
            }
            None => return Err(AppError::Driver("harness exited before ready line".into())),
        }
        info!(command = config.command, "harness process started");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, writer_rx) = mpsc::channel::<String>(INBOUND_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel::<InboundMessage>(INBOUND_BUFFER);

        tokio::spawn(run_writer(stdin, writer_rx, cancel.clone()));
        tokio::spawn(run_reader(
            frames,
            Arc::clone(&pending),
            inbound_tx,
            cancel,
        ));

        let driver = Arc::new(Self {
            writer_tx,
            pending,
            next_id: AtomicU64::new(1),
            request_timeout: config.request_timeout(),
            _child: Mutex::new(child),
        });
        Ok((driver, inbound_rx))
    }

    /// Issue one request frame and await its response.
    async fn request(
        &self,
        op: &'static str,
        kind: EndpointKind,
        chat: &str,
        text: Option<&str>,
    ) -> Result<ResponseFrame> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame {
            id,
            op,
            endpoint: kind.label(),
            chat,
            text,
        };
        let line = serde_json::to_string(&frame)
            .map_err(|err| AppError::Driver(format!("request serialization: {err}")))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.writer_tx.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AppError::Driver("harness connection closed".into()));
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(AppError::Driver("harness closed mid-request".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(AppError::Driver(format!(
                    "harness {op} request timed out after {}s",
                    self.request_timeout.as_secs()
                )));
            }
        };

        if response.ok {
            Ok(response)
        } else {
            Err(AppError::Driver(
                response
                    .error
                    .unwrap_or_else(|| format!("harness {op} request failed")),
            ))
        }
    }
}

impl EndpointDriver for HarnessDriver {
    fn send<'a>(
        &'a self,
        kind: EndpointKind,
        identifier: &'a str,
        text: &'a str,
    ) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.request("send", kind, identifier, Some(text)).await?;
            Ok(())
        })
    }

    fn capture_reply_region<'a>(
        &'a self,
        kind: EndpointKind,
        identifier: &'a str,
    ) -> DriverFuture<'a, Snapshot> {
        Box::pin(async move {
            let response = self.request("capture", kind, identifier, None).await?;
            let data = response
                .data
                .ok_or_else(|| AppError::Driver("capture response missing data".into()))?;
            Ok(Snapshot::new(data.into_bytes()))
        })
    }

    fn copy_reply<'a>(
        &'a self,
        kind: EndpointKind,
        identifier: &'a str,
    ) -> DriverFuture<'a, String> {
        Box::pin(async move {
            let response = self.request("copy", kind, identifier, None).await?;
            response
                .text
                .ok_or_else(|| AppError::Driver("copy response missing text".into()))
        })
    }

    fn find_window<'a>(
        &'a self,
        kind: EndpointKind,
        identifier: &'a str,
    ) -> DriverFuture<'a, Option<WindowHandle>> {
        Box::pin(async move {
            let response = self.request("find_window", kind, identifier, None).await?;
            Ok(response.handle.map(WindowHandle))
        })
    }
}

/// Writer task — forwards request lines to the harness's stdin as NDJSON.
async fn run_writer(
    mut stdin: ChildStdin,
    mut writer_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("harness writer: cancellation received, stopping");
                break;
            }

            line = writer_rx.recv() => {
                let Some(mut line) = line else {
                    debug!("harness writer: request channel closed, stopping");
                    break;
                };
                line.push('\n');
                if let Err(err) = stdin.write_all(line.as_bytes()).await {
                    warn!(%err, "harness writer: write failed, stopping");
                    break;
                }
            }
        }
    }
}

/// Reader task — dispatches response frames to pending requests and message
/// events to the ingest channel.
async fn run_reader(
    mut frames: FramedRead<ChildStdout, LinesCodec>,
    pending: PendingMap,
    inbound_tx: mpsc::Sender<InboundMessage>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => {
                debug!("harness reader: cancellation received, stopping");
                break;
            }
            next = frames.next() => match next {
                Some(Ok(line)) => line,
                Some(Err(err)) => {
                    warn!(%err, "harness reader: framing error, stopping");
                    break;
                }
                None => {
                    info!("harness stdout closed");
                    break;
                }
            },
        };

        match serde_json::from_str::<InboundFrame>(&line) {
            Ok(InboundFrame::Response(response)) => {
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(response);
                } else {
                    debug!(id = response.id, "response for unknown request dropped");
                }
            }
            Ok(InboundFrame::Event(event)) => {
                dispatch_event(event, &inbound_tx).await;
            }
            Err(err) => {
                warn!(%err, "unparseable harness frame skipped");
            }
        }
    }

    // Fail any requests still waiting so callers do not sit out the full
    // request timeout.
    pending.lock().await.clear();
}

async fn dispatch_event(event: EventFrame, inbound_tx: &mpsc::Sender<InboundMessage>) {
    match event.event.as_str() {
        "message" => {
            let Some(kind) = event.endpoint else {
                warn!("message event missing endpoint kind, skipped");
                return;
            };
            let message = InboundMessage {
                content: event.text,
                sender_name: event.sender,
                origin_identifier: event.chat,
                origin_kind: kind,
                self_authored: event.self_authored,
            };
            if inbound_tx.send(message).await.is_err() {
                debug!("inbound channel closed, message event dropped");
            }
        }
        "ready" => {}
        other => {
            debug!(event = other, "unknown harness event skipped");
        }
    }
}
