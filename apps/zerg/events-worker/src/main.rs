//! Events Worker Service - Entry Point
//!
//! Consumes domain events from RabbitMQ and dispatches them to the notification handlers.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_events_worker::run().await
}
