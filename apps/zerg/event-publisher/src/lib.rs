//! Operator CLI that publishes a single event to the bus.
//!
//! ```text
//! event-publisher publish task-created --data '{"TaskId":"t-1","Title":"Docs","OwnerId":"u-1"}'
//! event-publisher user-signuped --user-id abc --email a@b.com
//! ```
//!
//! Broker settings come from the same environment variables as the worker
//! (`RABBITMQ_URL`, `EVENTS_EXCHANGE`, `BROKER_RETRY_*`).

use clap::{Parser, Subcommand};
use core_config::{Environment, FromEnv};
use domain_events::{DomainEvent, EventName, UserSignedUp};
use event_bus::{
    AmqpConnector, BrokerConfig, Event, EventPublisher, PublisherConfig, RetryPolicy, Supervisor,
};
use eyre::{Result, WrapErr, eyre};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use validator::Validate;

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish one event to the event bus")]
pub struct Cli {
    /// Also declare and bind the event's own queue, so the message is kept
    /// even if no consumer has started yet. `user-signuped` is always bound.
    #[arg(long, global = true)]
    pub bind: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Publish an arbitrary JSON payload under an event name
    Publish {
        /// Event name, used as routing key
        event: String,

        /// JSON payload
        #[arg(short, long)]
        data: String,
    },

    /// Publish a `user-signuped` event
    UserSignuped {
        #[arg(long)]
        user_id: String,

        #[arg(long)]
        email: String,
    },
}

impl Command {
    /// Build the event to publish, validating typed payloads
    pub fn to_event(&self) -> Result<Event> {
        match self {
            Command::Publish { event, data } => {
                if event.trim().is_empty() {
                    return Err(eyre!("Event name must not be empty"));
                }
                let payload: Value =
                    serde_json::from_str(data).wrap_err("--data is not valid JSON")?;
                Ok(Event::from_value(event.clone(), payload))
            }
            Command::UserSignuped { user_id, email } => {
                let event = UserSignedUp {
                    user_id: user_id.clone(),
                    email: email.clone(),
                };
                event.validate().wrap_err("Invalid user-signuped payload")?;
                Ok(event.to_event()?)
            }
        }
    }
}

/// Publisher settings for `event`: the default bindings, plus the event's
/// own queue with `--bind`
pub fn publisher_config(broker: &BrokerConfig, event: &Event, bind: bool) -> PublisherConfig {
    let config = PublisherConfig::for_broker(broker).with_app_id(env!("CARGO_PKG_NAME"));
    if bind {
        config.with_binding(event.routing_key())
    } else {
        config
    }
}

/// Connect, publish, dispose.
pub async fn run(cli: Cli) -> Result<()> {
    core_config::tracing::init_tracing(&Environment::from_env());

    let event = cli.command.to_event()?;

    let broker = BrokerConfig::from_env().wrap_err("Failed to load broker configuration")?;
    let retry_policy = RetryPolicy::from_env().wrap_err("Failed to load retry policy")?;

    let config = publisher_config(&broker, &event, cli.bind);

    let connector = AmqpConnector::new(broker.url.clone()).with_connection_name("event-publisher");
    let publisher = EventPublisher::new(Arc::new(connector), config);

    publisher
        .connect_with_retry(&Supervisor::new(retry_policy))
        .await
        .wrap_err_with(|| format!("Failed to connect to {}", broker.redacted_url()))?;

    let result = publisher.publish(&event).await;
    publisher.dispose().await;
    let id = result.wrap_err_with(|| format!("Failed to publish {}", event.name()))?;

    let known = EventName::all().any(|name| name.as_str() == event.name());
    info!(event = %event.name(), id = %id, known, exchange = %broker.exchange, "Event published");
    println!("{}", id);
    Ok(())
}
