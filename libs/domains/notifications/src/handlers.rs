//! Event handlers of the notification service.

use crate::ports::{EmailContent, EmailSender, TaskActivity, TaskActivityKind, TaskNotifier};
use crate::templates::{TemplateEngine, WelcomeEmailData};
use async_trait::async_trait;
use domain_events::{TaskCreated, TaskUpdated, UserSignedUp, decode_payload};
use event_bus::{EventHandler, HandlerError};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Settings of the welcome email that do not come from the event.
#[derive(Debug, Clone)]
pub struct WelcomeEmailSettings {
    pub dashboard_url: String,
    pub company_name: String,
}

impl Default for WelcomeEmailSettings {
    fn default() -> Self {
        Self {
            dashboard_url: "http://localhost:3000/dashboard".to_string(),
            company_name: "Zerg".to_string(),
        }
    }
}

/// Sends a welcome email for every `user-signuped` event.
pub struct WelcomeEmailHandler {
    sender: Arc<dyn EmailSender>,
    templates: TemplateEngine,
    settings: WelcomeEmailSettings,
}

impl WelcomeEmailHandler {
    pub fn new(
        sender: Arc<dyn EmailSender>,
        templates: TemplateEngine,
        settings: WelcomeEmailSettings,
    ) -> Self {
        Self {
            sender,
            templates,
            settings,
        }
    }
}

#[async_trait]
impl EventHandler for WelcomeEmailHandler {
    async fn handle(&self, payload: Value) -> Result<(), HandlerError> {
        let event: UserSignedUp = decode_payload(payload)?;

        let rendered = self.templates.render_welcome(&WelcomeEmailData {
            user_id: event.user_id.clone(),
            user_email: event.email.clone(),
            dashboard_url: self.settings.dashboard_url.clone(),
            company_name: self.settings.company_name.clone(),
        })?;

        self.sender
            .send(&EmailContent {
                to_email: event.email,
                subject: rendered.subject,
                html_body: rendered.html,
                text_body: rendered.text,
            })
            .await?;

        info!(user_id = %event.user_id, "Welcome email sent");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "welcome_email"
    }
}

/// Forwards task lifecycle events to the task notifier.
///
/// One instance serves one queue; use [`TaskActivityHandler::created`] for
/// `task-created` and [`TaskActivityHandler::updated`] for `task-updated`.
pub struct TaskActivityHandler {
    kind: TaskActivityKind,
    notifier: Arc<dyn TaskNotifier>,
}

impl TaskActivityHandler {
    pub fn created(notifier: Arc<dyn TaskNotifier>) -> Self {
        Self {
            kind: TaskActivityKind::Created,
            notifier,
        }
    }

    pub fn updated(notifier: Arc<dyn TaskNotifier>) -> Self {
        Self {
            kind: TaskActivityKind::Updated,
            notifier,
        }
    }

    fn activity(&self, payload: Value) -> Result<TaskActivity, HandlerError> {
        let activity = match self.kind {
            TaskActivityKind::Created => {
                let event: TaskCreated = decode_payload(payload)?;
                TaskActivity {
                    kind: self.kind,
                    task_id: event.task_id,
                    title: Some(event.title),
                    status: None,
                    actor: Some(event.owner_id),
                }
            }
            TaskActivityKind::Updated => {
                let event: TaskUpdated = decode_payload(payload)?;
                TaskActivity {
                    kind: self.kind,
                    task_id: event.task_id,
                    title: event.title,
                    status: event.status,
                    actor: event.updated_by,
                }
            }
        };
        Ok(activity)
    }
}

#[async_trait]
impl EventHandler for TaskActivityHandler {
    async fn handle(&self, payload: Value) -> Result<(), HandlerError> {
        let activity = self.activity(payload)?;
        self.notifier.notify(&activity).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        match self.kind {
            TaskActivityKind::Created => "task_created",
            TaskActivityKind::Updated => "task_updated",
        }
    }
}
