//! Queue declaration options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Options passed with every queue assert.
///
/// The typed fields cover the common `x-` arguments; anything else goes
/// in `arguments` and is sent as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Queue survives broker restarts
    pub durable: bool,
    /// Queue is private to the declaring connection
    pub exclusive: bool,
    /// Queue is deleted once its last consumer goes away
    pub auto_delete: bool,
    /// Per-message TTL in milliseconds (`x-message-ttl`)
    pub message_ttl: Option<u32>,
    /// Idle queue expiry in milliseconds (`x-expires`)
    pub expires: Option<u32>,
    /// Maximum ready messages (`x-max-length`)
    pub max_length: Option<u32>,
    /// Exchange for rejected/expired messages (`x-dead-letter-exchange`)
    pub dead_letter_exchange: Option<String>,
    /// Extra declare arguments
    pub arguments: BTreeMap<String, Value>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            message_ttl: None,
            expires: None,
            max_length: None,
            dead_letter_exchange: None,
            arguments: BTreeMap::new(),
        }
    }
}

impl QueueOptions {
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    /// All declare arguments, typed fields first, `arguments` overriding.
    pub fn declare_arguments(&self) -> BTreeMap<String, Value> {
        let mut args = BTreeMap::new();
        if let Some(ttl) = self.message_ttl {
            args.insert("x-message-ttl".to_string(), Value::from(ttl));
        }
        if let Some(expires) = self.expires {
            args.insert("x-expires".to_string(), Value::from(expires));
        }
        if let Some(max) = self.max_length {
            args.insert("x-max-length".to_string(), Value::from(max));
        }
        if let Some(dlx) = &self.dead_letter_exchange {
            args.insert("x-dead-letter-exchange".to_string(), Value::from(dlx.clone()));
        }
        for (key, value) in &self.arguments {
            args.insert(key.clone(), value.clone());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_durable() {
        let options = QueueOptions::default();
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);
        assert!(options.declare_arguments().is_empty());
    }

    #[test]
    fn test_declare_arguments_merge() {
        let mut options = QueueOptions {
            message_ttl: Some(60_000),
            dead_letter_exchange: Some("dlx".to_string()),
            ..Default::default()
        };
        options
            .arguments
            .insert("x-max-priority".to_string(), Value::from(5));

        let args = options.declare_arguments();
        assert_eq!(args.get("x-message-ttl"), Some(&Value::from(60_000)));
        assert_eq!(args.get("x-dead-letter-exchange"), Some(&Value::from("dlx")));
        assert_eq!(args.get("x-max-priority"), Some(&Value::from(5)));
    }

    #[test]
    fn test_deserialize_partial_options() {
        let options: QueueOptions =
            serde_json::from_str(r#"{"exclusive": true, "max_length": 10}"#).unwrap();
        assert!(options.durable);
        assert!(options.exclusive);
        assert_eq!(options.max_length, Some(10));
    }
}
