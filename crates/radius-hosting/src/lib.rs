//! Hosting runtime for long-lived control plane processes: supervised
//! services under a shared cancellation scope, asynchronously produced
//! dependencies, shutdown signals and telemetry initialization.

pub mod async_value;
pub mod host;
pub mod signal;
pub mod telemetry;

pub use async_value::{AsyncValue, AsyncValueSetter};
pub use host::{Host, Service, ServiceError};
pub use signal::watch_shutdown_signals;
pub use telemetry::TelemetryOptions;
