//! Queue client: one named queue on top of a [`ConnectionManager`].
//!
//! Every operation first guarantees a live channel and an asserted queue,
//! reconnecting and re-declaring as needed, then performs the broker call.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::payload::Payload;
use crate::broker::{
    empty_mapping, BrokerChannel, DeliveryToken, Message, QueueInfo, QueueOptions, Transport,
};
use crate::connection::{ChannelLease, ConnectionManager};
use crate::error::{QueueError, Result, TransportError};

/// Lifecycle of a queue client. There is no terminal state: a client that
/// lost its channel goes back to `Unconnected` and recovers on next use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unconnected,
    Connecting,
    Asserting,
    Ready,
}

#[derive(Debug)]
struct QueueState {
    phase: ClientState,
    /// Connection epoch in which the queue was last asserted.
    asserted_epoch: Option<u64>,
    message_count: u32,
    consumer_count: u32,
}

/// A named queue bound to a connection manager.
///
/// Several clients may share one manager; each tracks its own assert state.
pub struct QueueClient<T: Transport> {
    manager: Arc<ConnectionManager<T>>,
    name: String,
    options: QueueOptions,
    assert_lock: tokio::sync::Mutex<()>,
    state: Mutex<QueueState>,
}

impl<T: Transport> QueueClient<T> {
    pub fn new(manager: Arc<ConnectionManager<T>>, name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            manager,
            name: name.into(),
            options,
            assert_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(QueueState {
                phase: ClientState::Unconnected,
                asserted_epoch: None,
                message_count: 0,
                consumer_count: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<T>> {
        &self.manager
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether the queue was asserted on the channel that is still live.
    pub fn is_asserted(&self) -> bool {
        let asserted = self.lock().asserted_epoch;
        asserted == Some(self.manager.epoch()) && self.manager.is_connected()
    }

    pub fn state(&self) -> ClientState {
        let phase = self.lock().phase;
        if phase == ClientState::Ready && !self.is_asserted() {
            ClientState::Unconnected
        } else {
            phase
        }
    }

    /// Ready messages as of the last declare or check.
    pub fn message_count(&self) -> u32 {
        self.lock().message_count
    }

    /// Consumers as of the last declare or check.
    pub fn consumer_count(&self) -> u32 {
        self.lock().consumer_count
    }

    fn set_phase(&self, phase: ClientState) {
        self.lock().phase = phase;
        debug!(queue = %self.name, phase = ?phase, "queue_client_phase");
    }

    fn record(&self, info: QueueInfo) {
        let mut state = self.lock();
        state.message_count = info.message_count;
        state.consumer_count = info.consumer_count;
    }

    fn invalidate(&self) {
        let mut state = self.lock();
        state.asserted_epoch = None;
        state.phase = ClientState::Unconnected;
    }

    /// Invalidate only if the assert state still belongs to `epoch`; a
    /// failure on a replaced channel leaves a newer assert alone.
    fn invalidate_epoch(&self, epoch: u64) {
        let mut state = self.lock();
        if state.asserted_epoch.map_or(true, |asserted| asserted == epoch) {
            state.asserted_epoch = None;
            state.phase = ClientState::Unconnected;
        }
    }

    /// Declare the queue unless it is already asserted on the live channel.
    pub async fn ensure_queue(&self) -> Result<()> {
        self.ready_channel().await.map(|_| ())
    }

    async fn ready_channel(&self) -> Result<ChannelLease<T::Channel>> {
        if self.is_asserted() {
            if let Ok(channel) = self.manager.channel().await {
                return Ok(channel);
            }
        }

        let _guard = self.assert_lock.lock().await;

        // Another caller may have asserted while we waited.
        if self.is_asserted() {
            if let Ok(channel) = self.manager.channel().await {
                return Ok(channel);
            }
        }

        self.set_phase(ClientState::Connecting);
        let channel = match self.manager.ensure_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.invalidate();
                return Err(e);
            }
        };
        let epoch = channel.epoch();

        self.set_phase(ClientState::Asserting);
        let info = match self
            .call(&channel, "declare", channel.declare_queue(&self.name, &self.options))
            .await
        {
            Ok(info) => info,
            Err(e) => {
                self.invalidate();
                return Err(e);
            }
        };

        {
            let mut state = self.lock();
            state.asserted_epoch = Some(epoch);
            state.phase = ClientState::Ready;
            state.message_count = info.message_count;
            state.consumer_count = info.consumer_count;
        }

        info!(
            queue = %self.name,
            durable = self.options.durable,
            message_count = info.message_count,
            consumer_count = info.consumer_count,
            "rabbitmq_queue_asserted"
        );
        Ok(channel)
    }

    /// Run one broker call on `channel`, bounded by the operation timeout.
    /// A missing queue becomes [`QueueError::QueueGone`] and clears the
    /// assert state. Failures are reported against the link the call ran on.
    async fn call<F, O>(&self, channel: &ChannelLease<T::Channel>, operation: &'static str, fut: F) -> Result<O>
    where
        F: Future<Output = std::result::Result<O, TransportError>>,
    {
        match self.manager.timed(operation, fut).await? {
            Ok(value) => Ok(value),
            Err(TransportError::NotFound(reason)) => {
                self.invalidate_epoch(channel.epoch());
                warn!(queue = %self.name, operation, reason = %reason, "rabbitmq_queue_gone");
                Err(QueueError::QueueGone {
                    queue: self.name.clone(),
                })
            }
            Err(e) => {
                if matches!(e, TransportError::Closed(_)) {
                    self.invalidate_epoch(channel.epoch());
                }
                warn!(
                    queue = %self.name,
                    operation,
                    epoch = channel.epoch(),
                    error = %e,
                    "rabbitmq_operation_failed"
                );
                Err(channel.fail(operation, e))
            }
        }
    }

    /// Query the broker for the queue's current state without declaring it.
    pub async fn check(&self) -> Result<QueueInfo> {
        let channel = self.manager.ensure_channel().await?;
        let info = self.call(&channel, "check", channel.check_queue(&self.name)).await?;
        self.record(info);
        Ok(info)
    }

    /// Publish text or a structured value. Returns whether the channel
    /// accepted the message into its buffer; this is flow control, not a
    /// delivery guarantee.
    pub async fn publish(&self, message: impl Into<Payload>) -> Result<bool> {
        let body = message.into().into_bytes()?;
        let channel = self.ready_channel().await?;

        let accepted = self
            .call(&channel, "publish", channel.send_to_queue(&self.name, &body))
            .await?;

        if accepted {
            debug!(queue = %self.name, body_length = body.len(), "rabbitmq_published");
        } else {
            warn!(queue = %self.name, body_length = body.len(), "rabbitmq_publish_refused");
        }
        Ok(accepted)
    }

    /// Publish any serializable value as JSON.
    pub async fn publish_json<S: Serialize + ?Sized>(&self, value: &S) -> Result<bool> {
        self.publish(Payload::json(value)?).await
    }

    /// Fetch one message without acknowledgment, if any is ready.
    pub async fn pull(&self) -> Result<Option<Message>> {
        let channel = self.ready_channel().await?;
        let message = self.call(&channel, "get", channel.get(&self.name)).await?;
        if let Some(message) = &message {
            debug!(queue = %self.name, body_length = message.payload.len(), "rabbitmq_pulled");
        }
        Ok(message)
    }

    /// Register an auto-ack consumer.
    ///
    /// The handler gets every delivery decoded as JSON. Undecodable payloads
    /// are logged and delivered as an empty object. When the consumer ends
    /// (channel closed, consumer cancelled) the handler is called once more
    /// with an empty object and no message.
    pub async fn subscribe<F>(&self, handler: F) -> Result<Subscription>
    where
        F: FnMut(Value, Option<Message>) + Send + 'static,
    {
        let channel = self.ready_channel().await?;
        let consumer_tag = format!("{}-{:08x}", self.name, rand::random::<u32>());

        let deliveries = self
            .call(&channel, "consume", channel.consume(&self.name, &consumer_tag))
            .await?;

        info!(queue = %self.name, consumer_tag = %consumer_tag, "rabbitmq_consumer_started");

        let queue = self.name.clone();
        let tag = consumer_tag.clone();
        let task = tokio::spawn(async move {
            let mut handler = handler;
            let mut deliveries = deliveries;

            while let Some(delivery) = deliveries.next().await {
                match delivery {
                    Ok(message) => {
                        let data = decode(&queue, &message);
                        handler(data, Some(message));
                    }
                    Err(e) => {
                        warn!(queue = %queue, consumer_tag = %tag, error = %e, "rabbitmq_delivery_error");
                        break;
                    }
                }
            }

            info!(queue = %queue, consumer_tag = %tag, "rabbitmq_consumer_closed");
            handler(empty_mapping(), None);
        });

        Ok(Subscription { consumer_tag, task })
    }

    /// Acknowledge a delivery through the shared connection manager.
    pub async fn acknowledge(&self, token: DeliveryToken) -> Result<()> {
        self.manager.acknowledge(token).await
    }
}

/// Decode a delivery as JSON, falling back to an empty object.
fn decode(queue: &str, message: &Message) -> Value {
    if message.payload.is_empty() {
        return empty_mapping();
    }
    match message.json() {
        Ok(value) => value,
        Err(e) => {
            warn!(
                queue = %queue,
                body_length = message.payload.len(),
                error = %e,
                "rabbitmq_payload_decode_failed"
            );
            empty_mapping()
        }
    }
}

/// A registered consumer. It lives until its channel closes; dropping the
/// handle does not cancel it.
#[derive(Debug)]
pub struct Subscription {
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait until the consumer has ended and its handler has seen the
    /// final absent-message call.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            warn!(consumer_tag = %self.consumer_tag, error = %e, "rabbitmq_consumer_task_failed");
        }
    }
}
