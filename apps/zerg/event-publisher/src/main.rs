use clap::Parser;
use zerg_event_publisher::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();

    zerg_event_publisher::run(Cli::parse()).await
}
