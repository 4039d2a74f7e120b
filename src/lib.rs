//! aegis-control: control plane for per-tenant sandboxed agent runtimes.
//!
//! Provisions one isolated agent-runtime container per tenant on either a
//! Docker engine or a Kubernetes cluster, derives all tenant secrets from a
//! single master key, and drives provisioning through a five-step pipeline
//! with bounded retries.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod provision;
pub mod secrets;
pub mod store;

pub use error::{Error, Result};

/// Port the agent-runtime gateway listens on inside its container.
pub const DEFAULT_CONTAINER_PORT: u16 = 18789;
