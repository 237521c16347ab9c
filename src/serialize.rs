//! Message body serialization. JSON with the usual envelope properties:
//! content type, a fresh message id and a publish timestamp.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::errors::Result;
use crate::transport::MessageProperties;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Body bytes plus wire properties, ready to hand to a publish action.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn serialize<T: Serialize>(&self, message: &T) -> Result<RawMessage> {
        let body = serde_json::to_vec(message)?;
        let properties = MessageProperties {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            message_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(Utc::now()),
            persistent: true,
            ..MessageProperties::default()
        };
        Ok(RawMessage { body, properties })
    }

    pub fn deserialize<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(body)?)
    }
}
