//! Reply inbox: a single consumer on the response queue shared by all
//! HTTP requests.
//!
//! The consumer is registered on first use and re-registered only after it
//! ends. Requests wait for the next reply with a deadline.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::broker::Transport;
use crate::error::QueueError;
use crate::queue::{QueueClient, Subscription};

#[derive(Error, Debug)]
pub enum ReplyError {
    #[error("no reply within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Default)]
struct Inbox {
    receiver: Option<mpsc::UnboundedReceiver<Value>>,
    subscription: Option<Subscription>,
}

pub struct ReplyInbox<T: Transport> {
    queue: Arc<QueueClient<T>>,
    inbox: Mutex<Inbox>,
}

impl<T: Transport> ReplyInbox<T> {
    pub fn new(queue: Arc<QueueClient<T>>) -> Self {
        Self {
            queue,
            inbox: Mutex::new(Inbox::default()),
        }
    }

    pub fn queue(&self) -> &Arc<QueueClient<T>> {
        &self.queue
    }

    /// Wait for the next reply. Absent-message notifications are skipped;
    /// if the consumer ends while waiting it is registered again.
    pub async fn next_reply(&self, wait: Duration) -> Result<Value, ReplyError> {
        let deadline = Instant::now() + wait;
        let mut inbox = self.inbox.lock().await;

        let timed_out = || ReplyError::Timeout {
            timeout_ms: wait.as_millis() as u64,
        };

        loop {
            if inbox.receiver.is_none() {
                // A consumer that keeps ending must not outlive the deadline.
                if Instant::now() >= deadline {
                    return Err(timed_out());
                }
                let (tx, rx) = mpsc::unbounded_channel();
                let subscription = self
                    .queue
                    .subscribe(move |data, message| {
                        if message.is_some() {
                            let _ = tx.send(data);
                        }
                    })
                    .await?;
                info!(
                    queue = %self.queue.name(),
                    consumer_tag = %subscription.consumer_tag(),
                    "reply_inbox_registered"
                );
                inbox.subscription = Some(subscription);
                inbox.receiver = Some(rx);
            }

            let Some(receiver) = inbox.receiver.as_mut() else {
                continue;
            };

            match timeout_at(deadline, receiver.recv()).await {
                Ok(Some(reply)) => return Ok(reply),
                Ok(None) => {
                    debug!(queue = %self.queue.name(), "reply_inbox_consumer_ended");
                    inbox.receiver = None;
                    inbox.subscription = None;
                }
                Err(_) => return Err(timed_out()),
            }
        }
    }
}
