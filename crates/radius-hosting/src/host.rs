//! Supervision of long-lived services.
//!
//! All services share one cancellation scope. The first fatal service error
//! or an external cancellation tears the scope down; the host then waits a
//! bounded grace period for the rest to drain.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::Snafu;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
#[snafu(display("service {name} failed: {message}"))]
pub struct ServiceError {
    pub name: &'static str,
    pub message: String,
}

impl ServiceError {
    pub fn new(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }
}

#[derive(Debug, Snafu)]
pub enum HostError {
    #[snafu(display("service {name} reported a fatal error: {message}"))]
    ServiceFailed { name: &'static str, message: String },

    #[snafu(display("{count} service(s) did not stop within the grace period"))]
    GracePeriodExceeded { count: usize },
}

/// A long-lived unit of the process. `run` must return promptly once the
/// token is cancelled.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self, cancellation: CancellationToken) -> Result<(), ServiceError>;
}

pub struct Host {
    services: Vec<Arc<dyn Service>>,
    grace_period: Duration,
}

impl Host {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            services: Vec::new(),
            grace_period,
        }
    }

    pub fn service(mut self, service: impl Service) -> Self {
        self.services.push(Arc::new(service));
        self
    }

    /// Runs every service until `root` is cancelled or one of them fails,
    /// then cancels the shared scope and waits out the grace period.
    pub async fn run(self, root: CancellationToken) -> Result<(), HostError> {
        let scope = root.child_token();
        let mut tasks = JoinSet::new();

        for service in self.services {
            let scope = scope.clone();
            tasks.spawn(async move {
                let name = service.name();
                tracing::info!(service = name, "service starting");
                let result = service.run(scope).await;
                tracing::info!(service = name, "service stopped");
                (name, result)
            });
        }

        // Wait for the first shutdown trigger.
        let mut failure: Option<(&'static str, String)> = None;
        tokio::select! {
            () = root.cancelled() => {
                tracing::info!("shutdown requested");
            }
            joined = tasks.join_next() => match joined {
                Some(Ok((name, Err(error)))) => {
                    tracing::error!(service = name, %error, "service failed");
                    failure = Some((name, error.message));
                }
                Some(Ok((name, Ok(())))) => {
                    // A service finishing early without a cancellation is a
                    // shutdown condition too.
                    tracing::warn!(service = name, "service exited early");
                }
                Some(Err(join_error)) => {
                    failure = Some(("unknown", join_error.to_string()));
                }
                None => {}
            }
        }

        scope.cancel();

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((name, Err(error))) = joined {
                    tracing::warn!(service = name, %error, "service failed during shutdown");
                }
            }
        };
        let graceful = tokio::time::timeout(self.grace_period, drain).await.is_ok();

        if let Some((name, message)) = failure {
            return Err(HostError::ServiceFailed { name, message });
        }
        if !graceful {
            let count = tasks.len();
            tasks.abort_all();
            return Err(HostError::GracePeriodExceeded { count });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    struct WellBehaved {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for WellBehaved {
        fn name(&self) -> &'static str {
            "well-behaved"
        }

        async fn run(&self, cancellation: CancellationToken) -> Result<(), ServiceError> {
            cancellation.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Faulty;

    #[async_trait]
    impl Service for Faulty {
        fn name(&self) -> &'static str {
            "faulty"
        }

        async fn run(&self, _cancellation: CancellationToken) -> Result<(), ServiceError> {
            Err(ServiceError::new("faulty", "boom"))
        }
    }

    #[tokio::test]
    async fn cancellation_stops_all_services() {
        let stopped = Arc::new(AtomicBool::new(false));
        let host = Host::new(Duration::from_secs(1)).service(WellBehaved {
            stopped: stopped.clone(),
        });

        let root = CancellationToken::new();
        let handle = tokio::spawn(host.run(root.clone()));
        tokio::task::yield_now().await;

        root.cancel();
        handle.await.unwrap().unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn a_failing_service_cancels_its_siblings() {
        let stopped = Arc::new(AtomicBool::new(false));
        let host = Host::new(Duration::from_secs(1))
            .service(WellBehaved {
                stopped: stopped.clone(),
            })
            .service(Faulty);

        let result = host.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(HostError::ServiceFailed { name: "faulty", .. })));
        assert!(stopped.load(Ordering::SeqCst));
    }
}
