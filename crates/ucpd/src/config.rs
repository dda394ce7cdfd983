//! Configuration of the control plane daemon.
//!
//! Everything has a serde default so a minimal (or absent) config file runs
//! a single-node embedded instance. The shutdown grace period and the
//! worker's dequeue ceiling are deliberately configuration, not constants.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {path}"))]
    ReadFile { source: std::io::Error, path: String },

    #[snafu(display("failed to parse config file {path}"))]
    ParseFile {
        source: serde_yaml::Error,
        path: String,
    },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UcpConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub recipes: RecipesConfig,
    #[serde(default)]
    pub host: HostConfig,
}

impl UcpConfig {
    /// Loads the file at `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path: &display })?;
        serde_yaml::from_str(&raw).context(ParseFileSnafu { path: &display })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8080
}

/// Which driver backs the state and secret stores.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageProvider {
    /// In-process single-node store; state does not survive restarts.
    #[default]
    Embedded,
    /// Documents as custom resources in a Kubernetes namespace.
    Kubernetes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::default(),
            namespace: default_namespace(),
        }
    }
}

fn default_namespace() -> String {
    "radius-system".to_owned()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueProvider {
    #[default]
    InMemory,
    Kubernetes,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QueueConfig {
    #[serde(default)]
    pub provider: QueueProvider,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: QueueProvider::default(),
            namespace: default_namespace(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Queue visibility lease in seconds.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// Deliveries after which an operation is poisoned.
    #[serde(default = "default_max_dequeue_count")]
    pub max_dequeue_count: u32,
    #[serde(default = "default_retry_base_seconds")]
    pub retry_base_seconds: u64,
    #[serde(default = "default_retry_cap_seconds")]
    pub retry_cap_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lease_seconds: default_lease_seconds(),
            max_dequeue_count: default_max_dequeue_count(),
            retry_base_seconds: default_retry_base_seconds(),
            retry_cap_seconds: default_retry_cap_seconds(),
        }
    }
}

impl WorkerConfig {
    pub fn options(&self) -> radius_armrpc::WorkerOptions {
        radius_armrpc::WorkerOptions {
            concurrency: self.concurrency,
            lease: Duration::from_secs(self.lease_seconds),
            max_dequeue_count: self.max_dequeue_count,
            retry_base: Duration::from_secs(self.retry_base_seconds),
            retry_cap: Duration::from_secs(self.retry_cap_seconds),
            ..radius_armrpc::WorkerOptions::default()
        }
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_lease_seconds() -> u64 {
    60
}

fn default_max_dequeue_count() -> u32 {
    5
}

fn default_retry_base_seconds() -> u64 {
    5
}

fn default_retry_cap_seconds() -> u64 {
    600
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkloadRuntimeKind {
    #[default]
    Kubernetes,
    /// Log-only; for running the control plane without cluster access.
    Disabled,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecipesConfig {
    /// Base URL of the Bicep deployment engine.
    #[serde(default = "default_deployment_engine_url")]
    pub deployment_engine_url: String,
    #[serde(default = "default_terraform_binary")]
    pub terraform_binary: String,
    /// Per-process root for Terraform working directories.
    #[serde(default = "default_terraform_root")]
    pub terraform_root: String,
    #[serde(default)]
    pub workload_runtime: WorkloadRuntimeKind,
}

impl Default for RecipesConfig {
    fn default() -> Self {
        Self {
            deployment_engine_url: default_deployment_engine_url(),
            terraform_binary: default_terraform_binary(),
            terraform_root: default_terraform_root(),
            workload_runtime: WorkloadRuntimeKind::default(),
        }
    }
}

fn default_deployment_engine_url() -> String {
    "http://localhost:5017".to_owned()
}

fn default_terraform_binary() -> String {
    "terraform".to_owned()
}

fn default_terraform_root() -> String {
    "/var/run/radius/terraform".to_owned()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HostConfig {
    /// Seconds the host waits for services to drain on shutdown.
    #[serde(default = "default_grace_seconds")]
    pub graceful_shutdown_seconds: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            graceful_shutdown_seconds: default_grace_seconds(),
        }
    }
}

impl HostConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_seconds)
    }
}

fn default_grace_seconds() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        let config: UcpConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, UcpConfig::default());
        assert_eq!(config.worker.max_dequeue_count, 5);
        assert_eq!(config.host.grace_period(), Duration::from_secs(30));
    }

    #[test]
    fn partial_config_overrides_in_place() {
        let config: UcpConfig = serde_yaml::from_str(
            r"
server:
  port: 9000
storage:
  provider: kubernetes
  namespace: radius
worker:
  maxDequeueCount: 3
",
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.storage.provider, StorageProvider::Kubernetes);
        assert_eq!(config.storage.namespace, "radius");
        assert_eq!(config.worker.max_dequeue_count, 3);
        // Untouched sections keep their defaults.
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<UcpConfig, _> = serde_yaml::from_str("serverr: {}");
        assert!(result.is_err());
    }

    #[test]
    fn default_config_roundtrips_through_yaml() {
        let rendered = serde_yaml::to_string(&UcpConfig::default()).unwrap();
        let parsed: UcpConfig = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed, UcpConfig::default());
    }
}
