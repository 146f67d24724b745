//! Configuration control plane for network virtualization
//!
//! Scarce identifiers (network ids, security-group ids, tag codes,
//! addresses) are allocated against a coordination service, and every
//! configuration change runs through a [`pipeline::MutationPipeline`] that
//! compensates partial work with a per-request undo stack.

pub mod allocator;
pub mod audit;
pub mod composite;
pub mod config;
pub mod control_plane;
pub mod coordination;
pub mod error;
pub mod ipam;
pub mod metrics;
pub mod notify;
pub mod observability;
pub mod patterns;
pub mod pipeline;
pub mod resource;
pub mod resources;
pub mod store;
pub mod transaction;

pub use control_plane::{ControlPlane, ControlPlaneBuilder};
pub use error::{NetcfgError, NetcfgResult};
pub use resource::{Reference, Resource, ResourceType, ResourceUpdate};
