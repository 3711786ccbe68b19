//! MqRelay - self-healing RabbitMQ queue client with an HTTP relay.
//!
//! This library provides the shared modules for the two MqRelay binaries:
//! - `mqrelay-web`: HTTP server that publishes a request and waits for a reply
//! - `mqrelay-responder`: answers requests on the response queue
//!
//! ## Architecture
//!
//! ```text
//! GET / → Web Server → reqQueue → Responder → resQueue → Web Server → response
//! ```
//!
//! Both sides use [`QueueClient`], which lazily connects through a
//! [`ConnectionManager`] and re-declares its queue after any channel loss.

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod queue;
pub mod responder;
pub mod web;

// Re-export commonly used types
pub use broker::{AmqpTransport, DeliveryToken, Message, QueueOptions, Transport};
pub use config::{BrokerConfig, Config};
pub use connection::{ChannelLease, ConnectionManager};
pub use error::{QueueError, Result, TransportError};
pub use queue::{ClientState, Payload, QueueClient, Subscription};
pub use web::AppState;
