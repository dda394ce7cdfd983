//! Console tracing initialization.
//!
//! One global subscriber, configured once at process start. Exporter
//! plumbing (OTLP and friends) hangs off this seam when a deployment needs
//! it; the core only requires structured console output with an env-style
//! filter.

use clap::Args;
use snafu::{ResultExt, Snafu};
use tracing_subscriber::{EnvFilter, filter::ParseError, util::TryInitError};

#[derive(Debug, Snafu)]
pub enum TelemetryError {
    #[snafu(display("the log filter is not valid"))]
    InvalidFilter { source: ParseError },

    #[snafu(display("a global tracing subscriber is already installed"))]
    AlreadyInitialized { source: TryInitError },
}

/// Telemetry flags shared by every control plane binary.
#[derive(Clone, Debug, PartialEq, Eq, Args)]
pub struct TelemetryOptions {
    /// Log filter, `tracing_subscriber::EnvFilter` syntax.
    #[arg(long, env = "RADIUS_LOG_FILTER", default_value = "info")]
    pub log_filter: String,

    /// Include span targets in log lines.
    #[arg(long, env = "RADIUS_LOG_TARGETS", default_value_t = false)]
    pub log_targets: bool,
}

impl TelemetryOptions {
    /// Installs the global subscriber. Call once, before anything logs.
    pub fn init(&self) -> Result<(), TelemetryError> {
        use tracing_subscriber::util::SubscriberInitExt;

        let filter = EnvFilter::try_new(&self.log_filter).context(InvalidFilterSnafu)?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.log_targets)
            .finish()
            .try_init()
            .context(AlreadyInitializedSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        telemetry: TelemetryOptions,
    }

    #[test]
    fn defaults_and_overrides_parse() {
        let cli = Cli::parse_from(["ucpd"]);
        assert_eq!(cli.telemetry.log_filter, "info");
        assert!(!cli.telemetry.log_targets);

        let cli = Cli::parse_from(["ucpd", "--log-filter", "radius_armrpc=debug,info"]);
        assert_eq!(cli.telemetry.log_filter, "radius_armrpc=debug,info");
    }

    #[test]
    fn invalid_filters_are_rejected() {
        let options = TelemetryOptions {
            log_filter: "!!!not-a-filter!!!".into(),
            log_targets: false,
        };
        assert!(matches!(
            options.init(),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }
}
