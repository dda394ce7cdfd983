//! The resource provider framework of the Radius Universal Control Plane.
//!
//! Providers declare their resource types, API versions, validators and
//! async controllers against [`builder::ResourceProviderBuilder`]; the
//! result is mounted into a plane-aware [`router`] serving the ARM-style
//! wire API. The synchronous front-end persists desired state and enqueues
//! operations; the [`worker`] pool executes them with per-resource mutual
//! exclusion.

pub mod builder;
pub mod context;
pub mod convert;
pub mod frontend;
pub mod operations;
pub mod rest;
pub mod router;
pub mod worker;

pub use builder::{BuildError, ResourceProviderBuilder, ResourceType, UcpRouterBuilder};
pub use context::RequestContext;
pub use convert::{ConversionError, InternalPayload, VersionCodec};
pub use frontend::{ResourceValidator, ValidationContext};
pub use operations::OperationStatusManager;
pub use rest::ArmErrorBody;
pub use worker::{
    AsyncController, ControllerResult, OperationContext, OperationOutput, Worker, WorkerOptions,
};
