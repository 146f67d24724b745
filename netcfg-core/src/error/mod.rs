//! Error handling for the netcfg control plane
//!
//! Every fallible operation in the allocation and mutation pipeline returns
//! [`NetcfgResult`]. The error variants follow the failure classes the
//! pipeline reacts to differently:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    netcfg Error Taxonomy                     │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Rejections           │  Scarcity            │  Transient     │
//! │  • Validation         │  • ResourceExhausted │  • Temporary   │
//! │  • AlreadyExists      │  • SubnetExhausted   │  • Session     │
//! │  • Conflict           │                      │  • Timeout     │
//! │  • NotFound           │                      │                │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Infrastructure: Storage, Serialization, Io, Internal        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rejections and scarcity errors unwind the request's undo stack and are
//! surfaced unchanged. Transient errors are retried inside the coordination
//! client boundary and only surface once retries are exhausted.

pub mod constructors;
pub mod conversions;
pub mod types;

pub use types::{format_errors, NetcfgError, NetcfgResult, Result};
