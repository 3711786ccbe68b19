//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - [`QueueClient`]: lazily asserted queue with publish/pull/subscribe
//! - [`Payload`]: text or structured message bodies
//!
//! ## Architecture
//!
//! ```text
//! QueueClient → ConnectionManager → Transport (lapin | in-memory)
//! ```

pub mod client;
pub mod payload;

pub use crate::broker::QueueOptions;
pub use client::{ClientState, QueueClient, Subscription};
pub use payload::Payload;
