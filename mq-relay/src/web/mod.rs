//! Web server module for the request/reply relay.
//!
//! This module provides a thin HTTP surface that:
//! - Publishes a request to the request queue
//! - Waits, with a deadline, for the next reply on the response queue
//! - Answers with `{"tag": "success", "data": <reply>}`

pub mod handlers;
pub mod inbox;

pub use handlers::{health, relay, router, AppState, HealthResponse, RelayResponse, RELAY_MESSAGE};
pub use inbox::{ReplyError, ReplyInbox};
