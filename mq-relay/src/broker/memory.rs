//! In-process broker used by tests.
//!
//! Implements [`Transport`] over shared in-memory queues. Every call is
//! recorded in an operation log, and faults (refused connections, refused
//! channels, channel closes, deleted queues) can be injected so the
//! connect/assert/recover paths run deterministically.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;

use super::{
    BrokerChannel, DeliveryStream, DeliveryToken, EventSink, Link, Message, QueueInfo,
    QueueOptions, Transport,
};
use crate::error::TransportError;

#[derive(Default)]
struct MemoryQueue {
    ready: VecDeque<Vec<u8>>,
    consumers: Vec<mpsc::UnboundedSender<Message>>,
    next_consumer: usize,
}

impl MemoryQueue {
    fn live_consumers(&mut self) -> usize {
        self.consumers.retain(|tx| !tx.is_closed());
        self.consumers.len()
    }

    fn info(&mut self) -> QueueInfo {
        QueueInfo {
            message_count: self.ready.len() as u32,
            consumer_count: self.live_consumers() as u32,
        }
    }
}

/// Liveness of one channel. `open` is what the client sees; a severed
/// channel still looks open until a call on it fails.
#[derive(Debug)]
struct ChannelFlags {
    open: AtomicBool,
    severed: AtomicBool,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    channels: Vec<(Arc<ChannelFlags>, EventSink)>,
    operations: Vec<String>,
    refuse_connections: bool,
    refuse_channels: bool,
    refuse_publishes: bool,
    cancel_consumers: bool,
}

/// Shared in-memory broker. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_tag: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not wedge the other tests.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, op: String) {
        self.state().operations.push(op);
    }

    /// Every broker call so far, e.g. `connect`, `declare:reqQueue`.
    pub fn operations(&self) -> Vec<String> {
        self.state().operations.clone()
    }

    /// Number of recorded calls equal to `op`.
    pub fn count(&self, op: &str) -> usize {
        self.state().operations.iter().filter(|o| *o == op).count()
    }

    pub fn clear_operations(&self) {
        self.state().operations.clear();
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    pub fn refuse_channels(&self, refuse: bool) {
        self.state().refuse_channels = refuse;
    }

    /// Make publishes report a full buffer.
    pub fn refuse_publishes(&self, refuse: bool) {
        self.state().refuse_publishes = refuse;
    }

    /// Have the broker cancel every new consumer right after registering it.
    pub fn cancel_consumers(&self, cancel: bool) {
        self.state().cancel_consumers = cancel;
    }

    /// Close every open channel, as a broker-side channel error would, and
    /// drop their consumers.
    pub fn close_channels(&self, reason: &str) {
        let channels = {
            let mut state = self.state();
            for queue in state.queues.values_mut() {
                queue.consumers.clear();
            }
            std::mem::take(&mut state.channels)
        };
        for (flags, events) in channels {
            if flags.open.swap(false, Ordering::SeqCst) {
                events.closed(Link::Channel, reason);
            }
        }
    }

    /// Kill every channel without reporting it. The channels still look
    /// open; the next call on one fails as closed, the way a lapin channel
    /// lost under a running operation does.
    pub fn sever_channels(&self) {
        let mut state = self.state();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        for (flags, _) in &state.channels {
            flags.severed.store(true, Ordering::SeqCst);
        }
    }

    /// Delete a queue behind the clients' backs.
    pub fn delete_queue(&self, queue: &str) {
        self.state().queues.remove(queue);
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    /// Ready messages waiting in `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    fn token(&self) -> DeliveryToken {
        DeliveryToken(self.next_tag.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Connection handle for [`MemoryBroker`].
pub struct MemoryConnection {
    uri: String,
}

impl MemoryConnection {
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    type Connection = MemoryConnection;
    type Channel = MemoryChannel;

    async fn connect(&self, uri: &str, _events: EventSink) -> Result<MemoryConnection, TransportError> {
        let mut state = self.state();
        state.operations.push("connect".to_string());
        if state.refuse_connections {
            return Err(TransportError::Other("connection refused".to_string()));
        }
        Ok(MemoryConnection {
            uri: uri.to_string(),
        })
    }

    async fn create_channel(
        &self,
        _connection: &MemoryConnection,
        events: EventSink,
    ) -> Result<MemoryChannel, TransportError> {
        let mut state = self.state();
        state.operations.push("create_channel".to_string());
        if state.refuse_channels {
            return Err(TransportError::Other("channel refused".to_string()));
        }
        let flags = Arc::new(ChannelFlags {
            open: AtomicBool::new(true),
            severed: AtomicBool::new(false),
        });
        state.channels.push((flags.clone(), events));
        Ok(MemoryChannel {
            broker: self.clone(),
            flags,
        })
    }

    async fn close(&self, _connection: MemoryConnection) -> Result<(), TransportError> {
        self.record("close_connection".to_string());
        Ok(())
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.len())
            .field("channels", &state.channels.len())
            .finish()
    }
}

/// Channel handle for [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    flags: Arc<ChannelFlags>,
}

impl MemoryChannel {
    fn guard(&self) -> Result<(), TransportError> {
        if self.flags.open.load(Ordering::SeqCst) && !self.flags.severed.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed("channel closed".to_string()))
        }
    }
}

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("open", &self.flags.open.load(Ordering::SeqCst))
            .field("severed", &self.flags.severed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.flags.open.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &str, _options: &QueueOptions) -> Result<QueueInfo, TransportError> {
        self.guard()?;
        let mut state = self.broker.state();
        state.operations.push(format!("declare:{queue}"));
        Ok(state.queues.entry(queue.to_string()).or_default().info())
    }

    async fn check_queue(&self, queue: &str) -> Result<QueueInfo, TransportError> {
        self.guard()?;
        let mut state = self.broker.state();
        state.operations.push(format!("check:{queue}"));
        match state.queues.get_mut(queue) {
            Some(q) => Ok(q.info()),
            None => Err(TransportError::NotFound(format!("no queue '{queue}'"))),
        }
    }

    async fn send_to_queue(&self, queue: &str, payload: &[u8]) -> Result<bool, TransportError> {
        self.guard()?;
        let token = self.broker.token();
        let mut state = self.broker.state();
        state.operations.push(format!("publish:{queue}"));
        if state.refuse_publishes {
            return Ok(false);
        }
        // Publishing to a missing queue through the default exchange drops the message.
        let Some(q) = state.queues.get_mut(queue) else {
            return Ok(true);
        };
        if q.live_consumers() == 0 {
            q.ready.push_back(payload.to_vec());
            return Ok(true);
        }
        let index = q.next_consumer % q.consumers.len();
        q.next_consumer = q.next_consumer.wrapping_add(1);
        if let Err(mpsc::error::SendError(message)) =
            q.consumers[index].send(Message::new(payload, token))
        {
            q.ready.push_back(message.payload);
        }
        Ok(true)
    }

    async fn get(&self, queue: &str) -> Result<Option<Message>, TransportError> {
        self.guard()?;
        let token = self.broker.token();
        let mut state = self.broker.state();
        state.operations.push(format!("get:{queue}"));
        match state.queues.get_mut(queue) {
            Some(q) => Ok(q.ready.pop_front().map(|payload| Message::new(payload, token))),
            None => Err(TransportError::NotFound(format!("no queue '{queue}'"))),
        }
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, TransportError> {
        self.guard()?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state();
            state.operations.push(format!("consume:{queue}"));
            let cancel = state.cancel_consumers;
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(TransportError::NotFound(format!("no queue '{queue}'")));
            };
            if cancel {
                return Ok(futures::stream::empty::<Result<Message, TransportError>>().boxed());
            }
            while let Some(payload) = q.ready.pop_front() {
                let _ = tx.send(Message::new(payload, self.broker.token()));
            }
            q.consumers.push(tx);
        }

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|message| (Ok(message), rx))
        });
        Ok(stream.boxed())
    }

    async fn ack(&self, token: DeliveryToken) -> Result<(), TransportError> {
        self.guard()?;
        self.broker.record(format!("ack:{}", token.0));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.flags.open.store(false, Ordering::SeqCst);
        self.broker.record("close_channel".to_string());
        Ok(())
    }
}
