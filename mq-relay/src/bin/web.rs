//! MqRelay Web Server - HTTP request/reply relay over RabbitMQ.
//!
//! This binary provides a thin web server that:
//! - Publishes a request message to the request queue on `GET /`
//! - Waits for the next reply on the response queue
//! - Responds with the reply, or 504 when none arrives in time

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mqrelay::web::router;
use mqrelay::{AmqpTransport, AppState, Config, ConnectionManager, QueueClient, QueueOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        environment = %config.environment,
        port = config.port,
        broker = ?config.broker,
        vhost = %config.vhost,
        request_queue = %config.request_queue,
        response_queue = %config.response_queue,
        reply_timeout_ms = config.reply_timeout.as_millis() as u64,
        "config_loaded"
    );

    // One connection per process, shared by both queues
    let manager = Arc::new(ConnectionManager::new(
        AmqpTransport::new(),
        config.broker.clone(),
        config.vhost.clone(),
    ));
    let options = QueueOptions::default().durable(config.queue_durable);
    let requests = QueueClient::new(manager.clone(), config.request_queue.clone(), options.clone());
    let responses = QueueClient::new(manager.clone(), config.response_queue.clone(), options);

    let state = AppState::new(requests, responses, config.reply_timeout);
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Close broker connection
    manager.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
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

    info!("web_server_shutting_down");
}
