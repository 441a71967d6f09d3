//! Error taxonomy for the bootstrap orchestrator.
//!
//! The split between `Transient` and `Fatal` matters: transient errors are
//! retried with bounded backoff by the host runner and only escalate to
//! `Fatal` once retries are exhausted. Everything else fails immediately.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshbootError {
    /// Missing or invalid operator input. User-facing, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed or ambiguous role assignment in the topology.
    #[error("topology error: {0}")]
    Topology(String),

    /// Retryable remote failure (lock contention, flaky network).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unexpected remote failure. Aborts the stage or run per stage policy.
    #[error("fatal execution failure: {0}")]
    Fatal(String),

    /// Certificate generation or signing failure.
    #[error("pki error: {0}")]
    Pki(String),

    /// Read-back verification found missing or mismatched keys.
    #[error("config verification failed for keys: {}", keys.join(", "))]
    ConfigMismatch { keys: Vec<String> },

    /// Observed mesh MTU is below the permitted floor.
    #[error("mesh MTU {observed} is below the minimum of {floor} (use the override flag to proceed anyway)")]
    MtuPolicy { observed: u32, floor: u32 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Orchestrator bug (broken stage ordering, missing context value).
    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshbootError {
    /// Whether the host runner may retry the operation that produced this.
    pub fn is_transient(&self) -> bool {
        matches!(self, MeshbootError::Transient(_))
    }
}

pub type MeshbootResult<T> = Result<T, MeshbootError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(MeshbootError::Transient("apt lock".into()).is_transient());
        assert!(!MeshbootError::Fatal("boom".into()).is_transient());
    }

    #[test]
    fn mismatch_lists_keys() {
        let err = MeshbootError::ConfigMismatch {
            keys: vec!["DNS_SERVER".into(), "HTTP_PROXY".into()],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("DNS_SERVER"));
        assert!(rendered.contains("HTTP_PROXY"));
    }
}
