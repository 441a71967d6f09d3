//! Cluster bootstrap orchestration.
//!
//! Resolves a declarative topology into role groups, then drives a fixed
//! table of idempotent stages over every host: base bootstrap, internal
//! PKI, hypervisor tuning, mesh-MTU discovery and policy, consistent-store
//! formation, config propagation, a rolling daemon restart, and a one-time
//! post-bootstrap step. Re-running against a converged cluster changes
//! nothing.

pub mod audit;
pub mod configstore;
pub mod context;
pub mod orchestrate;
pub mod pipeline;
pub mod pki;
pub mod runner;
pub mod topology;
pub mod vars;

pub use context::{Ctx, RunConfig, RunContext};
pub use meshboot_shared::{MeshbootError, MeshbootResult};
