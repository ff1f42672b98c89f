//! Logging setup shared by the worker and the publisher CLI

use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install the color-eyre report hook. Later calls are ignored.
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Filter used when `RUST_LOG` is unset.
///
/// Production keeps handler outcomes and connection changes; development adds
/// per-delivery detail. The AMQP client crates stay quiet in both.
pub fn default_directives(environment: &Environment) -> &'static str {
    if environment.is_production() {
        "info,lapin=warn,amq_protocol=warn,tower_http=warn"
    } else {
        "debug,lapin=info,amq_protocol=warn,pinky_swear=warn"
    }
}

fn filter_for(environment: &Environment) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(environment)))
}

/// Initialize tracing for `environment`.
///
/// Production logs flattened JSON without targets; development logs the pretty
/// format with targets. Both carry an `ErrorLayer` so eyre reports include span
/// traces. `RUST_LOG` overrides [`default_directives`].
///
/// A second call leaves the existing subscriber in place.
pub fn init_tracing(environment: &Environment) {
    // Must precede ErrorLayer for reports to carry span traces
    install_color_eyre();

    let filter = filter_for(environment);

    let result = if environment.is_production() {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(()) => info!(environment = ?environment, "Tracing initialized"),
        Err(_) => debug!("Tracing already initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_quiet_amqp_client() {
        let production = default_directives(&Environment::Production);
        assert!(production.starts_with("info,"));
        assert!(production.contains("lapin=warn"));

        let development = default_directives(&Environment::Development);
        assert!(development.starts_with("debug,"));
        assert!(development.contains("amq_protocol=warn"));
    }

    #[test]
    fn test_rust_log_overrides_default_directives() {
        temp_env::with_var("RUST_LOG", Some("warn"), || {
            assert_eq!(filter_for(&Environment::Production).to_string(), "warn");
        });
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing(&Environment::Development);
        init_tracing(&Environment::Production);
    }
}
