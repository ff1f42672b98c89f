use crate::error::EventBusError;
use serde::Serialize;
use serde_json::Value;

/// A named payload ready to publish.
///
/// The routing key defaults to the event name, so an event reaches the queue
/// of the same name when that queue is bound with its own name.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    name: String,
    payload: Value,
    routing_key: String,
}

impl Event {
    /// Serialize `data` into a new event. Fails without side effects if `data`
    /// cannot be represented as JSON.
    pub fn new<T>(name: impl Into<String>, data: &T) -> Result<Self, EventBusError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(data)?;
        Ok(Self::from_value(name, payload))
    }

    pub fn from_value(name: impl Into<String>, payload: Value) -> Self {
        let name = name.into();
        Self {
            routing_key: name.clone(),
            name,
            payload,
        }
    }

    /// Override the routing key (defaults to the event name)
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[derive(Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct Signup {
        user_id: String,
        email: String,
    }

    #[test]
    fn test_event_from_struct() {
        let event = Event::new(
            "user-signuped",
            &Signup {
                user_id: "u1".into(),
                email: "a@b.c".into(),
            },
        )
        .unwrap();

        assert_eq!(event.name(), "user-signuped");
        assert_eq!(event.routing_key(), "user-signuped");
        assert_eq!(event.payload(), &json!({"UserId": "u1", "Email": "a@b.c"}));
    }

    #[test]
    fn test_custom_routing_key() {
        let event = Event::from_value("task-created", json!({})).with_routing_key("tasks.created");
        assert_eq!(event.name(), "task-created");
        assert_eq!(event.routing_key(), "tasks.created");
    }

    #[test]
    fn test_unrepresentable_payload() {
        // JSON object keys must be strings
        let mut data = HashMap::new();
        data.insert((1u8, 2u8), "pair");

        let err = Event::new("bad", &data).unwrap_err();
        assert!(matches!(err, EventBusError::Serialization(_)));
    }
}
