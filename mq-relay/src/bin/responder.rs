//! MqRelay Responder - answers relay requests.
//!
//! This binary:
//! 1. Consumes requests from the request queue
//! 2. Publishes a `{"tag": "success", "data": {...}}` reply for each one
//!    to the response queue
//!
//! When the request consumer ends (channel closed, broker restart) it is
//! registered again after a short pause.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mqrelay::{responder, AmqpTransport, Config, ConnectionManager, QueueClient, QueueOptions};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("responder_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        environment = %config.environment,
        request_queue = %config.request_queue,
        response_queue = %config.response_queue,
        "config_loaded"
    );

    let manager = Arc::new(ConnectionManager::new(
        AmqpTransport::new(),
        config.broker.clone(),
        config.vhost.clone(),
    ));
    let options = QueueOptions::default().durable(config.queue_durable);
    let requests = Arc::new(QueueClient::new(
        manager.clone(),
        config.request_queue.clone(),
        options.clone(),
    ));
    let responses = Arc::new(QueueClient::new(
        manager.clone(),
        config.response_queue.clone(),
        options,
    ));

    // Create shutdown signal future
    let shutdown = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = terminate => info!("Received SIGTERM"),
        }
    };

    // Pin the shutdown future
    tokio::pin!(shutdown);

    // Keep a request consumer registered until shutdown
    loop {
        let subscription = match responder::serve(requests.clone(), responses.clone()).await {
            Ok(subscription) => {
                info!(consumer_tag = %subscription.consumer_tag(), "responder_ready");
                Some(subscription)
            }
            Err(e) => {
                error!(error = %e, retryable = e.is_retryable(), "responder_subscribe_failed");
                None
            }
        };

        tokio::select! {
            _ = &mut shutdown => {
                info!("responder_stopping");
                break;
            }
            _ = async {
                if let Some(subscription) = subscription {
                    subscription.finished().await;
                    warn!("responder_consumer_ended");
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            } => {}
        }
    }

    manager.close().await;

    info!("responder_shutdown_complete");
    Ok(())
}
