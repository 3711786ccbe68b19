//! Link events: asynchronous error and close notifications from the broker.
//!
//! Transports report through an [`EventSink`]. Emitting an event logs it,
//! clears the shared `connected` flag and broadcasts it to subscribers. An
//! event emitted by a sink whose link has since been replaced only logs, as
//! does a repeat report for a link that is already down.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

/// Which half of the session produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Connection,
    Channel,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Link::Connection => f.write_str("connection"),
            Link::Channel => f.write_str("channel"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    Error,
    Closed,
}

/// An error or close notification for the current link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    pub link: Link,
    pub kind: LinkEventKind,
    pub reason: String,
    /// Epoch of the link that produced the event.
    pub epoch: u64,
}

/// Connected flag and link epoch shared between a connection manager and
/// the sinks it hands to the transport.
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
    epoch: AtomicU64,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_epoch(&self) -> u64 {
        self.connected.store(false, Ordering::SeqCst);
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn mark_connected(&self, epoch: u64) {
        if self.epoch() == epoch {
            self.connected.store(true, Ordering::SeqCst);
        }
    }

    /// Mark the link of `epoch` down. True only for the report that took a
    /// live current link down.
    fn invalidate(&self, epoch: u64) -> bool {
        self.epoch() == epoch && self.connected.swap(false, Ordering::SeqCst)
    }
}

/// Handle a transport uses to report events for one link.
#[derive(Clone)]
pub struct EventSink {
    status: Arc<LinkStatus>,
    epoch: u64,
    tx: broadcast::Sender<LinkEvent>,
}

impl EventSink {
    pub(crate) fn new(status: Arc<LinkStatus>, epoch: u64, tx: broadcast::Sender<LinkEvent>) -> Self {
        Self { status, epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn error(&self, link: Link, reason: impl Into<String>) {
        self.emit(link, LinkEventKind::Error, reason.into());
    }

    pub fn closed(&self, link: Link, reason: impl Into<String>) {
        self.emit(link, LinkEventKind::Closed, reason.into());
    }

    fn emit(&self, link: Link, kind: LinkEventKind, reason: String) {
        let current = self.status.invalidate(self.epoch);

        warn!(
            link = %link,
            kind = ?kind,
            reason = %reason,
            epoch = self.epoch,
            current,
            "rabbitmq_link_event"
        );

        if current {
            // No subscribers is fine.
            let _ = self.tx.send(LinkEvent {
                link,
                kind,
                reason,
                epoch: self.epoch,
            });
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("epoch", &self.epoch).finish()
    }
}
