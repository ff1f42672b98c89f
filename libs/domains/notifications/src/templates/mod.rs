//! Email template rendering engine.
//!
//! Handlebars templates for the emails sent in reaction to domain events.

use crate::error::{NotificationError, NotificationResult};
use handlebars::Handlebars;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Rendered email content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Variables of the welcome email.
#[derive(Debug, Clone, Serialize)]
pub struct WelcomeEmailData {
    pub user_id: String,
    pub user_email: String,
    pub dashboard_url: String,
    pub company_name: String,
}

/// Template engine for rendering email templates.
#[derive(Clone)]
pub struct TemplateEngine {
    handlebars: Arc<Handlebars<'static>>,
}

impl TemplateEngine {
    /// Create a new template engine with all templates registered.
    pub fn new() -> NotificationResult<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(true);

        for (name, source) in [
            ("welcome_html", WELCOME_HTML_TEMPLATE),
            ("welcome_text", WELCOME_TEXT_TEMPLATE),
        ] {
            handlebars
                .register_template_string(name, source)
                .map_err(|e| NotificationError::Template(format!("Failed to register {}: {}", name, e)))?;
        }

        Ok(Self {
            handlebars: Arc::new(handlebars),
        })
    }

    fn render<T: Serialize>(&self, template_name: &str, data: &T) -> NotificationResult<String> {
        Ok(self.handlebars.render(template_name, data)?)
    }

    /// Render a welcome email.
    pub fn render_welcome(&self, data: &WelcomeEmailData) -> NotificationResult<RenderedEmail> {
        debug!(user_id = %data.user_id, "Rendering welcome email");

        Ok(RenderedEmail {
            subject: format!("Welcome to {}!", data.company_name),
            html: self.render("welcome_html", data)?,
            text: self.render("welcome_text", data)?,
        })
    }
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("templates", &self.handlebars.get_templates().len())
            .finish()
    }
}

const WELCOME_HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="UTF-8">
  <title>Welcome to {{company_name}}</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background-color: #f4f4f5;">
  <table role="presentation" width="100%" cellspacing="0" cellpadding="0" style="max-width: 600px; margin: 0 auto; padding: 40px 20px;">
    <tr>
      <td style="background-color: #ffffff; border-radius: 8px; padding: 40px;">
        <h1 style="color: #18181b; font-size: 24px; font-weight: 600; margin: 0 0 16px 0; text-align: center;">
          Welcome to {{company_name}}!
        </h1>
        <p style="color: #52525b; font-size: 16px; line-height: 24px; margin: 0 0 24px 0; text-align: center;">
          Your account <strong>{{user_email}}</strong> is ready. Start by creating your first task.
        </p>
        <p style="text-align: center;">
          <a href="{{dashboard_url}}" style="display: inline-block; background-color: #18181b; color: #ffffff; font-size: 16px; padding: 12px 32px; text-decoration: none; border-radius: 6px;">
            Go to Dashboard
          </a>
        </p>
      </td>
    </tr>
  </table>
</body>
</html>"#;

const WELCOME_TEXT_TEMPLATE: &str = r#"Welcome to {{company_name}}!

Your account {{user_email}} is ready. Start by creating your first task.

Go to your dashboard: {{dashboard_url}}"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> WelcomeEmailData {
        WelcomeEmailData {
            user_id: "abc".to_string(),
            user_email: "a@b.com".to_string(),
            dashboard_url: "https://example.com/dashboard".to_string(),
            company_name: "Zerg".to_string(),
        }
    }

    #[test]
    fn test_template_engine_creation() {
        assert!(TemplateEngine::new().is_ok());
    }

    #[test]
    fn test_render_welcome_email() {
        let engine = TemplateEngine::new().unwrap();

        let rendered = engine.render_welcome(&data()).unwrap();

        assert_eq!(rendered.subject, "Welcome to Zerg!");
        assert!(rendered.html.contains("a@b.com"));
        assert!(rendered.html.contains("https://example.com/dashboard"));
        assert!(rendered.text.contains("a@b.com"));
    }
}
