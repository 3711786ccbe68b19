//! Broker-side responder: answers every request with a reply on the
//! response queue.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::broker::{Message, Transport};
use crate::error::Result;
use crate::queue::{QueueClient, Subscription};

/// Reply published for one request.
pub fn reply_for(request: &Message) -> Value {
    json!({
        "tag": "success",
        "data": {
            "request": request.text(),
            "handled_by": "mqrelay-responder",
        }
    })
}

/// Subscribe to `requests` and publish a reply to `responses` for each
/// delivery, in delivery order. Runs until the request consumer ends.
pub async fn serve<T: Transport>(
    requests: Arc<QueueClient<T>>,
    responses: Arc<QueueClient<T>>,
) -> Result<Subscription> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let subscription = requests
        .subscribe(move |_data, message| match message {
            Some(message) => {
                let _ = tx.send(message);
            }
            None => debug!("responder_request_consumer_ended"),
        })
        .await?;

    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match responses.publish(reply_for(&request)).await {
                Ok(true) => debug!(queue = %responses.name(), "responder_reply_published"),
                Ok(false) => warn!(queue = %responses.name(), "responder_reply_refused"),
                Err(e) => error!(queue = %responses.name(), error = %e, "responder_reply_failed"),
            }
        }
    });

    Ok(subscription)
}
