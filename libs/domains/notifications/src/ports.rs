//! Outbound ports of the notifications domain and their logging adapters.

use crate::error::NotificationResult;
use async_trait::async_trait;
use strum::{AsRefStr, Display};
use tracing::info;

/// Email content ready for sending.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmailContent {
    pub to_email: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Sends rendered emails (SMTP relay, SendGrid, ...).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &EmailContent) -> NotificationResult<()>;

    /// Sender name for logging.
    fn name(&self) -> &'static str;
}

/// Writes emails to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, email: &EmailContent) -> NotificationResult<()> {
        info!(
            to = %email.to_email,
            subject = %email.subject,
            text_len = email.text_body.len(),
            "Email sent (log sender)"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TaskActivityKind {
    Created,
    Updated,
}

/// A task change worth telling the owner about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskActivity {
    pub kind: TaskActivityKind,
    pub task_id: String,
    pub title: Option<String>,
    pub status: Option<String>,
    /// Owner on creation, editor on update (when known).
    pub actor: Option<String>,
}

/// Delivers task notifications (in-app feed, push, ...).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskNotifier: Send + Sync {
    async fn notify(&self, activity: &TaskActivity) -> NotificationResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogTaskNotifier;

#[async_trait]
impl TaskNotifier for LogTaskNotifier {
    async fn notify(&self, activity: &TaskActivity) -> NotificationResult<()> {
        info!(
            kind = %activity.kind,
            task_id = %activity.task_id,
            title = ?activity.title,
            status = ?activity.status,
            actor = ?activity.actor,
            "Task notification recorded"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_adapters_succeed() {
        LogEmailSender
            .send(&EmailContent {
                to_email: "a@b.com".into(),
                subject: "Hi".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(LogEmailSender.name(), "log");

        LogTaskNotifier
            .notify(&TaskActivity {
                kind: TaskActivityKind::Created,
                task_id: "t-1".into(),
                title: Some("Write docs".into()),
                status: None,
                actor: Some("u-1".into()),
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_activity_kind_display() {
        assert_eq!(TaskActivityKind::Created.to_string(), "created");
        assert_eq!(TaskActivityKind::Updated.as_ref(), "updated");
    }
}
