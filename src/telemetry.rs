use std::io::{self, IsTerminal};
use std::sync::OnceLock;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use strum_macros::{Display, EnumString};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::TelemetryError;

static TRACING_INITIALISED: OnceLock<Result<(), TelemetryError>> = OnceLock::new();

/// How log lines are rendered on stderr.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable output when stderr is a terminal, JSON otherwise.
    #[default]
    Auto,
    Pretty,
    Json,
}

impl LogFormat {
    fn is_pretty(self) -> bool {
        match self {
            Self::Auto => io::stderr().is_terminal(),
            Self::Pretty => true,
            Self::Json => false,
        }
    }
}

/// Initialises structured logging and OpenTelemetry tracing support.
///
/// Only the first call installs a subscriber; later calls return its outcome.
/// The filter comes from `RUST_LOG` and defaults to `warn`.
pub fn initialise_tracing(
    service_name: &str,
    format: LogFormat,
) -> Result<(), &'static TelemetryError> {
    TRACING_INITIALISED
        .get_or_init(|| initialise_tracing_once(service_name, format))
        .as_ref()
        .copied()
}

fn initialise_tracing_once(service_name: &str, format: LogFormat) -> Result<(), TelemetryError> {
    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder().build();
    let tracer = tracer_provider.tracer(service_name.to_owned());
    global::set_tracer_provider(tracer_provider);

    let log_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    if format.is_pretty() {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(false)
                    .with_writer(io::stderr)
                    .with_filter(log_filter),
            )
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(io::stderr)
                    .with_filter(log_filter),
            )
            .with(OpenTelemetryLayer::new(tracer))
            .try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("auto", LogFormat::Auto)]
    #[case("pretty", LogFormat::Pretty)]
    #[case("json", LogFormat::Json)]
    fn log_format_parses_snake_case(#[case] raw: &str, #[case] expected: LogFormat) {
        assert_eq!(Ok(expected), LogFormat::from_str(raw));
        assert_eq!(raw, expected.to_string());
    }

    #[test]
    fn repeated_initialisation_returns_first_outcome() {
        let first = initialise_tracing("gattlink-test", LogFormat::Json).is_ok();
        let second = initialise_tracing("gattlink-test", LogFormat::Pretty).is_ok();
        assert_eq!(first, second);
    }
}
