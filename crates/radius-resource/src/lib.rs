//! Core data model of the Radius Universal Control Plane.
//!
//! This crate contains the types every other UCP crate builds on: ARM-style
//! [`ResourceId`]s and their plane model, the persisted resource envelope,
//! provisioning and operation state machines, output resources and the
//! connection model. It carries no I/O; stores, queues and controllers live
//! in their own crates.

pub mod connection;
pub mod document;
pub mod id;
pub mod operation;
pub mod output;
pub mod state;
pub mod system_data;

pub use connection::{Connection, ConnectionKind, SecretReference};
pub use document::{InternalMetadata, ResourceEnvelope, ResourceStatus};
pub use id::{PlaneKind, ResourceId, ScopeSegment, TypeSegment};
pub use operation::{ErrorCode, ErrorDetail, OperationKind, OperationStatus};
pub use output::{OutputResource, OutputResourceIdentity};
pub use state::ProvisioningState;
pub use system_data::{IdentityType, SystemData};
