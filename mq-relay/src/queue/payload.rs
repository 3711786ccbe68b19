//! Publishable message bodies.

use serde::Serialize;
use serde_json::Value;

/// Either raw text or a structured value. Both go out as UTF-8 bytes;
/// structured values as their JSON text.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
}

impl Payload {
    /// Encode any serializable value as a structured payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    pub fn into_bytes(self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Json(value) => serde_json::to_vec(&value),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_is_sent_verbatim() {
        let bytes = Payload::from("lalalalala").into_bytes().unwrap();
        assert_eq!(bytes, b"lalalalala");
    }

    #[test]
    fn test_structured_value_is_json_encoded() {
        let bytes = Payload::from(json!({"tag": "success"})).into_bytes().unwrap();
        assert_eq!(bytes, br#"{"tag":"success"}"#);
    }

    #[test]
    fn test_json_from_serialize() {
        #[derive(Serialize)]
        struct Ping {
            seq: u32,
        }
        let payload = Payload::json(&Ping { seq: 3 }).unwrap();
        assert_eq!(payload, Payload::Json(json!({"seq": 3})));
    }
}
