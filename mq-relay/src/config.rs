//! Configuration module for environment variable parsing.
//!
//! Values are keyed by deployment environment: with `APP_ENV=production`,
//! `PRODUCTION_MQ_HOST` wins over `MQ_HOST`.

use std::env;
use std::fmt;
use std::time::Duration;

use tracing::warn;
use url::Url;

/// Broker connection settings handed to each connection manager.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker `host[:port]`
    pub host: String,
    pub user: String,
    pub password: String,
    /// Heartbeat interval requested from the broker
    pub heartbeat_secs: u16,
    /// Upper bound on every broker call
    pub operation_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost:5672".to_string(),
            user: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat_secs: 1,
            operation_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI for `vhost`. The vhost is sent as one percent-encoded path
    /// segment (`/` becomes `%2F`). An empty vhost selects the broker default.
    pub fn uri(&self, vhost: &str) -> Result<String, url::ParseError> {
        let mut uri = Url::parse(&format!("amqp://{}", self.host))?;

        // Only fails for URLs without a host, which `parse` above rejects.
        let _ = uri.set_username(&self.user);
        let _ = uri.set_password(Some(&self.password));

        if !vhost.is_empty() {
            if let Ok(mut segments) = uri.path_segments_mut() {
                segments.clear().push(vhost);
            }
        }
        uri.set_query(Some(&format!("heartbeat={}", self.heartbeat_secs)));

        Ok(uri.to_string())
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("heartbeat_secs", &self.heartbeat_secs)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Deployment environment (`APP_ENV`)
    pub environment: String,

    pub broker: BrokerConfig,

    /// Virtual host for both queues
    pub vhost: String,

    /// Whether declared queues are durable
    pub queue_durable: bool,

    /// Queue the relay publishes requests to
    pub request_queue: String,

    /// Queue the relay waits on for replies
    pub response_queue: String,

    /// How long an HTTP request waits for a reply
    pub reply_timeout: Duration,

    /// Port for the web server to listen on
    pub port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let environment = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let lookup = EnvLookup::new(&environment);

        Config {
            broker: BrokerConfig {
                host: lookup.string("MQ_HOST", "localhost:5672"),
                user: lookup.string("MQ_USER", "guest"),
                password: lookup.string("MQ_PASSWORD", "guest"),
                heartbeat_secs: lookup.parsed("MQ_HEARTBEAT_SECS", 1),
                operation_timeout: Duration::from_millis(
                    lookup.parsed("MQ_OPERATION_TIMEOUT_MS", 10_000),
                ),
            },

            vhost: lookup.string("MQ_VHOST", ""),

            queue_durable: lookup.parsed("MQ_QUEUE_DURABLE", true),

            request_queue: lookup.string("REQUEST_QUEUE", "reqQueue"),

            response_queue: lookup.string("RESPONSE_QUEUE", "resQueue"),

            reply_timeout: Duration::from_millis(lookup.parsed("REPLY_TIMEOUT_MS", 30_000)),

            port: lookup.parsed("PORT", 3000),

            environment,
        }
    }
}

/// Environment-prefixed variable lookup.
struct EnvLookup {
    prefix: String,
}

impl EnvLookup {
    fn new(environment: &str) -> Self {
        Self {
            prefix: environment.trim().to_uppercase(),
        }
    }

    fn raw(&self, name: &str) -> Option<String> {
        if !self.prefix.is_empty() {
            if let Ok(value) = env::var(format!("{}_{}", self.prefix, name)) {
                return Some(value);
            }
        }
        env::var(name).ok()
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        match self.raw(name) {
            Some(raw) => match raw.trim().parse() {
                Ok(value) => value,
                Err(_) => {
                    warn!(env_var = name, value = %raw, "Invalid value, using default");
                    default
                }
            },
            None => default,
        }
    }
}
