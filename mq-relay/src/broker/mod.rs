//! Broker transport seam.
//!
//! This module provides:
//! - The [`Transport`] and [`BrokerChannel`] traits the connection manager
//!   and queue client are written against
//! - The [`Message`] model and link events
//! - [`AmqpTransport`]: the lapin-backed AMQP 0-9-1 transport
//! - `MemoryBroker`: an in-process broker, built for tests only

pub mod amqp;
pub mod events;
#[cfg(test)]
pub mod memory;
pub mod options;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::TransportError;

pub use amqp::AmqpTransport;
pub use events::{EventSink, Link, LinkEvent, LinkEventKind, LinkStatus};
#[cfg(test)]
pub use memory::MemoryBroker;
pub use options::QueueOptions;

/// Opaque broker-assigned token used to acknowledge a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryToken(pub u64);

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub token: DeliveryToken,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>, token: DeliveryToken) -> Self {
        Self {
            payload: payload.into(),
            token,
        }
    }

    /// Payload as UTF-8 text, invalid sequences replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Payload decoded as JSON.
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Empty JSON object handed to subscribers for absent or undecodable messages.
pub fn empty_mapping() -> Value {
    Value::Object(Map::new())
}

/// Queue state returned by a declare or a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueInfo {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Stream of deliveries for one consumer. Ends when the consumer is
/// cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Message, TransportError>>;

/// Opens connections and channels to a broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Channel: BrokerChannel;

    /// Open a transport connection. Errors and closes on the connection are
    /// reported to `events`.
    async fn connect(&self, uri: &str, events: EventSink) -> Result<Self::Connection, TransportError>;

    /// Open one channel on `connection`, reporting its events to `events`.
    async fn create_channel(
        &self,
        connection: &Self::Connection,
        events: EventSink,
    ) -> Result<Self::Channel, TransportError>;

    /// Close a connection that is being discarded or shut down.
    async fn close(&self, connection: Self::Connection) -> Result<(), TransportError>;
}

/// Queue operations on one open channel.
#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    /// Whether the channel can still carry operations.
    fn is_open(&self) -> bool;

    /// Declare the queue if absent.
    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> Result<QueueInfo, TransportError>;

    /// Passive declare. `TransportError::NotFound` when the queue is missing.
    async fn check_queue(&self, queue: &str) -> Result<QueueInfo, TransportError>;

    /// Publish bytes to `queue` through the default exchange. Returns whether
    /// the channel accepted the message.
    async fn send_to_queue(&self, queue: &str, payload: &[u8]) -> Result<bool, TransportError>;

    /// Fetch a single message without acknowledgment.
    async fn get(&self, queue: &str) -> Result<Option<Message>, TransportError>;

    /// Register an auto-ack consumer.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, TransportError>;

    async fn ack(&self, token: DeliveryToken) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
