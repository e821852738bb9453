//! Endpoint driver abstraction.
//!
//! The [`EndpointDriver`] trait decouples the relay core (rule matching,
//! queueing, completion detection) from the mechanics of driving a chat
//! application — window lookup, keystroke injection, reply-region capture,
//! clipboard extraction. Both endpoint kinds are served through the same
//! surface; the pipeline never learns how a capture or a send is actually
//! performed.

pub mod harness;

use std::future::Future;
use std::pin::Pin;

use crate::models::rule::EndpointKind;
use crate::models::snapshot::Snapshot;
use crate::Result;

/// Boxed future returned by driver methods.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Opaque native window handle reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHandle(pub u64);

/// Uniform interface between the relay core and a chat application.
pub trait EndpointDriver: Send + Sync {
    /// Deliver `text` into the chat identified by `identifier` on `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) when the
    /// destination is unreachable or injection fails.
    fn send<'a>(
        &'a self,
        kind: EndpointKind,
        identifier: &'a str,
        text: &'a str,
    ) -> DriverFuture<'a, ()>;

    /// Capture an opaque snapshot of the destination's reply region.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) when the
    /// capture cannot be produced.
    fn capture_reply_region<'a>(
        &'a self,
        kind: EndpointKind,
        identifier: &'a str,
    ) -> DriverFuture<'a, Snapshot>;

    /// Extract the finished reply text from the destination.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) when the reply
    /// cannot be retrieved. An empty string is a valid return; the caller
    /// decides whether emptiness is a failure.
    fn copy_reply<'a>(
        &'a self,
        kind: EndpointKind,
        identifier: &'a str,
    ) -> DriverFuture<'a, String>;

    /// Locate the chat window for `identifier`, if it is open.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Driver`](crate::AppError::Driver) when the
    /// lookup itself fails; an absent window is `Ok(None)`.
    fn find_window<'a>(
        &'a self,
        kind: EndpointKind,
        identifier: &'a str,
    ) -> DriverFuture<'a, Option<WindowHandle>>;
}
