//! Event envelope and wire codec.
//!
//! The wire format is a UTF-8 JSON object in the message body. Envelope
//! metadata travels in the AMQP basic properties:
//!
//! | Envelope field   | AMQP property      |
//! |------------------|--------------------|
//! | `event_type`     | `type`             |
//! | `content_type`   | `content-type`     |
//! | `message_id`     | `message-id`       |
//! | `correlation_id` | `correlation-id`   |
//! | `persistent`     | `delivery-mode = 2`|
//!
//! Decoding ignores unknown JSON fields and fails on missing required ones,
//! following the serde derive of the target type.

use bytes::Bytes;
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::broker::Message;

/// Content type for JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode for messages that survive a broker restart.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Errors that can occur while encoding or decoding envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Failed to deserialize payload: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("Failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Unsupported content type '{0}'")]
    UnsupportedContentType(String),

    #[error("Invalid message id '{0}'")]
    InvalidMessageId(String),

    #[error("Invalid correlation id '{0}'")]
    InvalidCorrelationId(String),

    #[error("Message carries no event type")]
    MissingEventType,
}

/// Immutable unit of publication.
///
/// `message_id` is assigned once when the envelope is created and is the
/// consumer-side deduplication key. A delivery that arrived without a
/// producer id gets a fresh id on every decode and `generated_message_id`
/// set; such an id identifies nothing and must not be used for deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_type: String,
    pub payload: Bytes,
    pub content_type: String,
    pub message_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub persistent: bool,
    pub generated_message_id: bool,
}

impl EventEnvelope {
    /// Wrap an already serialized JSON payload.
    pub fn new(event_type: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: payload.into(),
            content_type: JSON_CONTENT_TYPE.to_string(),
            message_id: Uuid::new_v4(),
            correlation_id: None,
            persistent: true,
            generated_message_id: false,
        }
    }

    /// Serialize a typed event into a new envelope.
    pub fn encode<T: Serialize>(event_type: impl Into<String>, event: &T) -> Result<Self, CodecError> {
        let payload = serde_json::to_vec(event).map_err(CodecError::Serialize)?;
        Ok(Self::new(event_type, payload))
    }

    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self.generated_message_id = false;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Deserialize the payload into a typed event.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let text = std::str::from_utf8(&self.payload)?;
        serde_json::from_str(text).map_err(CodecError::Deserialize)
    }

    /// Build the broker message for this envelope.
    pub fn to_message(&self) -> Message {
        let mut properties = BasicProperties::default()
            .with_content_type(self.content_type.as_str().into())
            .with_type(self.event_type.as_str().into())
            .with_message_id(self.message_id.to_string().into())
            .with_timestamp(chrono::Utc::now().timestamp().max(0) as u64);

        if let Some(correlation_id) = self.correlation_id {
            properties = properties.with_correlation_id(correlation_id.to_string().into());
        }
        if self.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        Message {
            properties,
            body: self.payload.to_vec(),
        }
    }

    /// Decode an envelope from a received message.
    ///
    /// `fallback_event_type` is used when the producer did not set the AMQP
    /// `type` property; consumers pass the event type of their registration.
    /// A missing message id is replaced by a random one and flagged as
    /// generated.
    pub fn from_message(message: &Message, fallback_event_type: Option<&str>) -> Result<Self, CodecError> {
        let properties = &message.properties;

        let content_type = match properties.content_type() {
            Some(ct) => {
                let ct = ct.as_str();
                if !is_json_content_type(ct) {
                    return Err(CodecError::UnsupportedContentType(ct.to_string()));
                }
                ct.to_string()
            }
            None => JSON_CONTENT_TYPE.to_string(),
        };

        let text = std::str::from_utf8(&message.body)?;
        let value: serde_json::Value = serde_json::from_str(text).map_err(CodecError::Deserialize)?;
        if !value.is_object() {
            return Err(CodecError::NotAnObject);
        }

        let event_type = properties
            .kind()
            .as_ref()
            .map(|k| k.as_str().to_string())
            .filter(|k| !k.is_empty())
            .or_else(|| fallback_event_type.map(str::to_string))
            .ok_or(CodecError::MissingEventType)?;

        let (message_id, generated_message_id) = match properties.message_id() {
            Some(id) => (
                Uuid::parse_str(id.as_str())
                    .map_err(|_| CodecError::InvalidMessageId(id.as_str().to_string()))?,
                false,
            ),
            None => (Uuid::new_v4(), true),
        };

        let correlation_id = match properties.correlation_id() {
            Some(id) => Some(
                Uuid::parse_str(id.as_str())
                    .map_err(|_| CodecError::InvalidCorrelationId(id.as_str().to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            event_type,
            payload: Bytes::copy_from_slice(&message.body),
            content_type,
            message_id,
            correlation_id,
            persistent: *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
            generated_message_id,
        })
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == JSON_CONTENT_TYPE || essence.ends_with("+json")
}
