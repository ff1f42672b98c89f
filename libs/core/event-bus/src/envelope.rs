//! Versioned message envelope
//!
//! Every message is published as
//! `{"version":1,"id":"<uuid>","event":"<name>","published_at":"<rfc3339>","payload":<json>}`.
//! Bodies without an envelope (a bare JSON payload, as sent by older
//! publishers) are accepted as version 0. Versions newer than
//! [`SCHEMA_VERSION`] are rejected.

use crate::event::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Highest envelope version this crate understands
pub const SCHEMA_VERSION: u32 = 1;

/// Wire format of a published event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub id: Uuid,
    pub event: String,
    pub published_at: DateTime<Utc>,
    pub payload: Value,
}

impl Envelope {
    /// Wrap an event with a fresh id and the current time
    pub fn wrap(event: &Event) -> Self {
        Self {
            version: SCHEMA_VERSION,
            id: Uuid::new_v4(),
            event: event.name().to_string(),
            published_at: Utc::now(),
            payload: event.payload().clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A decoded message body
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// 0 for bodies without an envelope
    pub version: u32,
    pub id: Option<Uuid>,
    pub event: Option<String>,
    pub payload: Value,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Unsupported envelope version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },

    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Decode a message body, accepting both enveloped and bare payloads
pub fn decode(body: &[u8]) -> Result<Decoded, DecodeError> {
    let value: Value = serde_json::from_slice(body)?;

    let Some(version) = envelope_version(&value) else {
        return Ok(Decoded {
            version: 0,
            id: None,
            event: None,
            payload: value,
        });
    };

    if version > u64::from(SCHEMA_VERSION) {
        return Err(DecodeError::UnsupportedVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    let envelope: Envelope =
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    Ok(Decoded {
        version: envelope.version,
        id: Some(envelope.id),
        event: Some(envelope.event),
        payload: envelope.payload,
    })
}

/// An object is treated as an envelope when it carries a numeric `version`
/// next to `event` and `payload`.
fn envelope_version(value: &Value) -> Option<u64> {
    let object = value.as_object()?;
    if !object.contains_key("event") || !object.contains_key("payload") {
        return None;
    }
    object.get("version")?.as_u64()
}
