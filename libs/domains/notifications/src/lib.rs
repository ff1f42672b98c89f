//! Notifications Domain
//!
//! Event handlers that turn domain events into user-facing notifications.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Event Consumer │  ← user-signuped, task-created, task-updated queues
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Handlers     │  ← WelcomeEmailHandler, TaskActivityHandler
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │      Ports      │  ← EmailSender, TaskNotifier
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{NotificationHandlers, LogEmailSender, LogTaskNotifier};
//!
//! let registry = NotificationHandlers::new(Arc::new(LogEmailSender), Arc::new(LogTaskNotifier))?
//!     .register(QueueRegistry::builder())
//!     .build()?;
//! ```

pub mod error;
mod handlers;
mod ports;
pub mod templates;

pub use error::{NotificationError, NotificationResult};
pub use handlers::{TaskActivityHandler, WelcomeEmailHandler, WelcomeEmailSettings};
pub use ports::{
    EmailContent, EmailSender, LogEmailSender, LogTaskNotifier, TaskActivity, TaskActivityKind,
    TaskNotifier,
};
pub use templates::TemplateEngine;

use domain_events::EventName;
use event_bus::QueueRegistryBuilder;
use std::sync::Arc;

/// Handler set of the notification service, one queue per event.
pub struct NotificationHandlers {
    email_sender: Arc<dyn EmailSender>,
    task_notifier: Arc<dyn TaskNotifier>,
    templates: TemplateEngine,
    welcome: WelcomeEmailSettings,
}

impl NotificationHandlers {
    pub fn new(
        email_sender: Arc<dyn EmailSender>,
        task_notifier: Arc<dyn TaskNotifier>,
    ) -> NotificationResult<Self> {
        Ok(Self {
            email_sender,
            task_notifier,
            templates: TemplateEngine::new()?,
            welcome: WelcomeEmailSettings::default(),
        })
    }

    pub fn with_welcome_settings(mut self, settings: WelcomeEmailSettings) -> Self {
        self.welcome = settings;
        self
    }

    /// Add the `user-signuped`, `task-created` and `task-updated` queues
    pub fn register(self, builder: QueueRegistryBuilder) -> QueueRegistryBuilder {
        let signuped = EventName::UserSignuped;
        let created = EventName::TaskCreated;
        let updated = EventName::TaskUpdated;

        builder
            .register(
                signuped.as_str(),
                signuped.durable(),
                WelcomeEmailHandler::new(self.email_sender, self.templates, self.welcome),
            )
            .register(
                created.as_str(),
                created.durable(),
                TaskActivityHandler::created(self.task_notifier.clone()),
            )
            .register(
                updated.as_str(),
                updated.durable(),
                TaskActivityHandler::updated(self.task_notifier),
            )
    }
}
