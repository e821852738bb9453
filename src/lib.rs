#![forbid(unsafe_code)]

//! chat-courier — rule-driven relay between two chat endpoints.
//!
//! An inbound message is matched against the forwarding rule table, fans out
//! into one queued task per matching rule, and is delivered by a single
//! serialized relay worker. Deliveries to an assistant endpoint wait for the
//! destination's reply region to stop changing (visual stability), copy the
//! finished reply, and relay it back to the originating chat.

pub mod config;
pub mod detector;
pub mod driver;
pub mod errors;
pub mod models;
pub mod queue;
pub mod relay;
pub mod rules;

pub use config::CourierConfig;
pub use errors::{AppError, Result};
