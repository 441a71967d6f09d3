//! Per-stage host tasks.
//!
//! Each task targets one host, runs named idempotent operations through
//! the host runner, and reports whether anything actually changed.

mod bootstrap;
mod etcd;
mod mtu;
mod pki;
mod post;
mod propagate;
mod restart;
mod tuning;

pub use bootstrap::BootstrapTask;
pub use etcd::EtcdMemberTask;
pub use mtu::{MtuFloorTask, MtuProbeTask};
pub use pki::{PkiLeafTask, PkiRootTask};
pub use post::PostBootstrapTask;
pub use propagate::ConfigPropagateTask;
pub use restart::RollingRestartTask;
pub use tuning::HypervisorTuningTask;

use crate::runner::{Operation, Outcome, RemoteCommand};

/// Per-node service daemon restarted by the rolling-restart stage.
pub const NODE_DAEMON_UNIT: &str = "meshd";

/// `Applied` wins: a task that changed anything reports `Applied`.
pub(crate) fn fold_outcomes(outcomes: &[Outcome]) -> Outcome {
    if outcomes.iter().any(|o| *o == Outcome::Applied) {
        Outcome::Applied
    } else {
        Outcome::AlreadySatisfied
    }
}

/// Idempotent line-presence operation: check with an exact-line grep,
/// apply by appending and running an optional reload command.
pub(crate) fn line_in_file(
    name: impl Into<String>,
    path: &str,
    line: &str,
    reload: Option<&str>,
) -> Operation {
    let mut apply = format!(
        "mkdir -p $(dirname {path}) && printf '%s\\n' '{line}' >> {path}"
    );
    if let Some(reload) = reload {
        apply.push_str(" && ");
        apply.push_str(reload);
    }
    Operation::new(name, RemoteCommand::shell(apply))
        .check(RemoteCommand::new(["grep", "-qxF", line, path]))
}
