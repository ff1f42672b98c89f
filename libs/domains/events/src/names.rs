use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Events published by the user and task services.
///
/// Each event is routed with its own name as routing key, and each has a
/// durable queue of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum EventName {
    /// A user finished sign-up (wire name kept as published by the user service)
    #[strum(serialize = "user-signuped")]
    UserSignuped,
    TaskCreated,
    TaskUpdated,
}

impl EventName {
    /// Get all event names.
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    /// Routing key and queue name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::UserSignuped => "user-signuped",
            EventName::TaskCreated => "task-created",
            EventName::TaskUpdated => "task-updated",
        }
    }

    /// Queues are durable so events survive a broker restart
    pub fn durable(&self) -> bool {
        true
    }
}
