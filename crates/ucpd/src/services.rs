//! The two long-lived services of the daemon: the HTTP front-end and the
//! async worker pool.
//!
//! The worker depends on the front-end being up: operation statuses must be
//! pollable before the first operation can complete. The dependency is
//! handed over through an [`AsyncValue`] carrying the front-end's actual
//! bound address.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use radius_armrpc::Worker;
use radius_hosting::{AsyncValue, AsyncValueSetter, Service, ServiceError};
use tokio_util::sync::CancellationToken;

pub struct FrontendService {
    pub router: axum::Router,
    pub bind_address: String,
    /// Publishes the address the listener actually bound (which differs from
    /// `bind_address` when the configured port is 0).
    pub bound_address: AsyncValueSetter<SocketAddr>,
}

#[async_trait]
impl Service for FrontendService {
    fn name(&self) -> &'static str {
        "frontend"
    }

    async fn run(&self, cancellation: CancellationToken) -> Result<(), ServiceError> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address)
            .await
            .map_err(|error| {
                ServiceError::new("frontend", format!("failed to bind {}: {error}", self.bind_address))
            })?;
        let address = listener.local_addr().map_err(|error| {
            ServiceError::new("frontend", format!("failed to read the bound address: {error}"))
        })?;

        self.bound_address.set(address);
        tracing::info!(%address, "frontend listening");

        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(cancellation.cancelled_owned())
            .await
            .map_err(|error| ServiceError::new("frontend", error.to_string()))
    }
}

pub struct WorkerService {
    pub worker: Arc<Worker>,
    /// Produced by [`FrontendService`] once it is serving.
    pub frontend_address: AsyncValue<SocketAddr>,
}

#[async_trait]
impl Service for WorkerService {
    fn name(&self) -> &'static str {
        "worker"
    }

    async fn run(&self, cancellation: CancellationToken) -> Result<(), ServiceError> {
        let address = tokio::select! {
            () = cancellation.cancelled() => return Ok(()),
            address = self.frontend_address.get() => address,
        };
        let Some(address) = address else {
            // The front-end went away without ever serving; the host is
            // already tearing the process down.
            return Ok(());
        };
        tracing::debug!(frontend = %address, "front-end is serving, starting the worker pool");

        Arc::clone(&self.worker).run(cancellation).await;
        Ok(())
    }
}
