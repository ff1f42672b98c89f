//! Event payloads.
//!
//! Field names are PascalCase on the wire, matching what the user and task
//! services publish.

use crate::names::EventName;
use event_bus::{Event, EventBusError, HandlerError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

/// A payload bound to one event name.
pub trait DomainEvent: Serialize + DeserializeOwned + Validate + Send + Sync {
    const NAME: EventName;

    /// Build the bus event for this payload
    fn to_event(&self) -> Result<Event, EventBusError> {
        Event::new(Self::NAME.as_str(), self)
    }
}

/// Decode and validate a delivery payload.
///
/// Both failures are permanent: the same body will not decode on redelivery.
pub fn decode_payload<E: DomainEvent>(payload: Value) -> Result<E, HandlerError> {
    let event: E = serde_json::from_value(payload)?;
    event.validate().map_err(|e| {
        HandlerError::permanent(format!("Invalid {} payload: {}", E::NAME, e))
    })?;
    Ok(event)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
pub struct UserSignedUp {
    #[validate(length(min = 1))]
    pub user_id: String,
    #[validate(email)]
    pub email: String,
}

impl DomainEvent for UserSignedUp {
    const NAME: EventName = EventName::UserSignuped;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
pub struct TaskCreated {
    #[validate(length(min = 1))]
    pub task_id: String,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    #[validate(length(min = 1))]
    pub owner_id: String,
}

impl DomainEvent for TaskCreated {
    const NAME: EventName = EventName::TaskCreated;
}

/// Only the fields that changed are present
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase")]
pub struct TaskUpdated {
    #[validate(length(min = 1))]
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 255))]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

impl DomainEvent for TaskUpdated {
    const NAME: EventName = EventName::TaskUpdated;
}
