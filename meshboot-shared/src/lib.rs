//! Types shared across meshboot crates.

pub mod errors;

pub use errors::{MeshbootError, MeshbootResult};
