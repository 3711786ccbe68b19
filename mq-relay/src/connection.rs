//! Connection manager: one broker connection and one channel over it.
//!
//! The channel is a cache. Error and close events from the transport clear
//! the `connected` flag, and the next [`ConnectionManager::ensure_channel`]
//! opens a fresh connection and channel instead of reusing the dead ones.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::broker::{
    BrokerChannel, DeliveryToken, EventSink, Link, LinkEvent, LinkStatus, Transport,
};
use crate::config::BrokerConfig;
use crate::error::{QueueError, Result, TransportError};

const EVENT_CAPACITY: usize = 64;

struct Session<T: Transport> {
    connection: T::Connection,
    channel: ChannelLease<T::Channel>,
}

/// A channel together with the sink of the link it was opened on.
///
/// Failures seen on the channel are reported through that sink, so a call
/// that fails on a replaced channel cannot take down the current one.
#[derive(Clone)]
pub struct ChannelLease<C> {
    channel: C,
    events: EventSink,
}

impl<C> ChannelLease<C> {
    /// Connection epoch the channel belongs to.
    pub fn epoch(&self) -> u64 {
        self.events.epoch()
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Map a transport failure of a call made on this channel. A closed
    /// channel invalidates its own link so the next call reconnects.
    pub(crate) fn fail(&self, operation: &'static str, err: TransportError) -> QueueError {
        match err {
            TransportError::Closed(reason) => {
                self.events.closed(Link::Channel, reason);
                QueueError::ChannelClosed { operation }
            }
            TransportError::NotFound(reason) | TransportError::Other(reason) => {
                QueueError::Broker { operation, reason }
            }
        }
    }
}

impl<C> Deref for ChannelLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.channel
    }
}

impl<C> fmt::Debug for ChannelLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLease")
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Owns the connection and channel for one broker/vhost pair.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    config: BrokerConfig,
    vhost: String,
    session: RwLock<Option<Session<T>>>,
    status: Arc<LinkStatus>,
    events: broadcast::Sender<LinkEvent>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, config: BrokerConfig, vhost: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            config,
            vhost: vhost.into(),
            session: RwLock::new(None),
            status: Arc::new(LinkStatus::default()),
            events,
        }
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Whether the last established channel is still usable.
    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Incremented every time a new connection is attempted. Anything cached
    /// against an older epoch is stale.
    pub fn epoch(&self) -> u64 {
        self.status.epoch()
    }

    /// Subscribe to error/close events of the current and future links.
    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Sink bound to the current link, for injecting events.
    pub fn event_sink(&self) -> EventSink {
        EventSink::new(self.status.clone(), self.status.epoch(), self.events.clone())
    }

    /// Return the live channel, opening a connection and channel first if
    /// needed. On failure the manager stays disconnected.
    pub async fn ensure_channel(&self) -> Result<ChannelLease<T::Channel>> {
        if let Some(channel) = self.live_channel().await {
            return Ok(channel);
        }

        let mut session = self.session.write().await;

        // Double-check after acquiring write lock
        if let Some(current) = session.as_ref() {
            if self.status.is_connected() && current.channel.is_open() {
                return Ok(current.channel.clone());
            }
        }

        if let Some(stale) = session.take() {
            self.discard(stale).await;
        }

        let epoch = self.status.begin_epoch();
        let sink = EventSink::new(self.status.clone(), epoch, self.events.clone());
        let uri = self.config.uri(&self.vhost).map_err(|e| {
            QueueError::Connection(TransportError::Other(format!("invalid broker address: {e}")))
        })?;

        info!(host = %self.config.host, vhost = %self.vhost, epoch, "rabbitmq_connecting");

        let connection = self
            .timed("connect", self.transport.connect(&uri, sink.clone()))
            .await?
            .map_err(|e| {
                warn!(host = %self.config.host, error = %e, "rabbitmq_connect_failed");
                QueueError::Connection(e)
            })?;

        let channel = match self
            .timed("create_channel", self.transport.create_channel(&connection, sink.clone()))
            .await
        {
            Ok(Ok(channel)) => ChannelLease {
                channel,
                events: sink,
            },
            Ok(Err(e)) => {
                warn!(error = %e, "rabbitmq_channel_failed");
                self.close_quietly(connection).await;
                return Err(QueueError::Channel(e));
            }
            Err(timeout) => {
                self.close_quietly(connection).await;
                return Err(timeout);
            }
        };

        *session = Some(Session {
            connection,
            channel: channel.clone(),
        });
        self.status.mark_connected(epoch);

        info!(vhost = %self.vhost, epoch, "rabbitmq_channel_ready");
        Ok(channel)
    }

    /// The current channel if it is still live. Never connects.
    pub async fn channel(&self) -> Result<ChannelLease<T::Channel>> {
        self.live_channel().await.ok_or(QueueError::NotConnected)
    }

    async fn live_channel(&self) -> Option<ChannelLease<T::Channel>> {
        let session = self.session.read().await;
        let current = session.as_ref()?;
        if self.status.is_connected() && current.channel.is_open() {
            Some(current.channel.clone())
        } else {
            None
        }
    }

    /// Acknowledge a delivery on the live channel.
    pub async fn acknowledge(&self, token: DeliveryToken) -> Result<()> {
        let channel = self.channel().await?;
        self.timed("ack", channel.ack(token))
            .await?
            .map_err(|e| channel.fail("ack", e))
    }

    /// Bound a broker call by the configured operation timeout.
    pub(crate) async fn timed<F, O>(&self, operation: &'static str, fut: F) -> Result<O>
    where
        F: Future<Output = O>,
    {
        let limit = self.config.operation_timeout;
        tokio::time::timeout(limit, fut).await.map_err(|_| {
            warn!(operation, timeout_ms = limit.as_millis() as u64, "rabbitmq_operation_timeout");
            QueueError::Timeout {
                operation,
                timeout_ms: limit.as_millis() as u64,
            }
        })
    }

    /// Close channel and connection gracefully.
    pub async fn close(&self) {
        let mut session = self.session.write().await;
        self.status.begin_epoch();

        if let Some(current) = session.take() {
            match self.timed("close_channel", current.channel.close()).await {
                Ok(Err(e)) => warn!(error = %e, "rabbitmq_channel_close_error"),
                Err(e) => warn!(error = %e, "rabbitmq_channel_close_error"),
                Ok(Ok(())) => {}
            }
            match self.timed("close_connection", self.transport.close(current.connection)).await {
                Ok(Err(e)) => warn!(error = %e, "rabbitmq_connection_close_error"),
                Err(e) => warn!(error = %e, "rabbitmq_connection_close_error"),
                Ok(Ok(())) => {}
            }
        }

        info!(vhost = %self.vhost, "rabbitmq_connection_closed");
    }

    async fn discard(&self, stale: Session<T>) {
        debug!(vhost = %self.vhost, "rabbitmq_discarding_stale_session");
        self.close_quietly(stale.connection).await;
    }

    async fn close_quietly(&self, connection: T::Connection) {
        match self.timed("close_connection", self.transport.close(connection)).await {
            Ok(Err(e)) => debug!(error = %e, "rabbitmq_stale_connection_close_error"),
            Err(e) => debug!(error = %e, "rabbitmq_stale_connection_close_error"),
            Ok(Ok(())) => {}
        }
    }
}
