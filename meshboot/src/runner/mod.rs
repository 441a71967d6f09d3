//! Host task runner.
//!
//! Executes named idempotent operations against one host at a time. The
//! check-first contract is the universal idempotence mechanism: when an
//! operation carries a check command and the check passes, the mutation is
//! skipped entirely and `AlreadySatisfied` is returned. Failures whose
//! output matches the operation's transient patterns are retried with
//! bounded backoff before escalating.

mod transport;

pub use transport::{ExecOutput, LocalTransport, RemoteCommand, SshTransport, Transport};

#[cfg(test)]
pub use transport::testing;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use meshboot_shared::{MeshbootError, MeshbootResult};

use crate::topology::Node;

/// Tri-state result of an operation (failure is carried as `Err`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation ran and changed the host.
    Applied,
    /// The idempotency check passed; nothing was done.
    AlreadySatisfied,
}

/// Classifier for retryable failures, matched against command output.
#[derive(Debug, Clone)]
pub struct TransientMatcher {
    patterns: Vec<String>,
}

impl TransientMatcher {
    pub fn none() -> Self {
        Self { patterns: Vec::new() }
    }

    pub fn patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(|p| p.into().to_lowercase()).collect(),
        }
    }

    /// Package-manager lock contention, the one transient failure every
    /// freshly booted cloud image reliably produces.
    pub fn package_locks() -> Self {
        Self::patterns([
            "could not get lock",
            "unable to acquire the dpkg frontend lock",
            "unable to lock the administration directory",
            "resource temporarily unavailable",
        ])
    }

    pub fn matches(&self, output: &str) -> bool {
        let lowered = output.to_lowercase();
        self.patterns.iter().any(|p| lowered.contains(p))
    }
}

/// One named idempotent unit of work against a host.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    /// Evaluated first; exit 0 means the desired state already holds.
    pub check: Option<RemoteCommand>,
    /// Alternatives tried in order until one succeeds (rescue chain).
    pub attempts: Vec<RemoteCommand>,
    pub transient: TransientMatcher,
}

impl Operation {
    pub fn new(name: impl Into<String>, command: RemoteCommand) -> Self {
        Self {
            name: name.into(),
            check: None,
            attempts: vec![command],
            transient: TransientMatcher::none(),
        }
    }

    pub fn check(mut self, check: RemoteCommand) -> Self {
        self.check = Some(check);
        self
    }

    /// Add a fallback tried only if every earlier alternative failed.
    pub fn fallback(mut self, command: RemoteCommand) -> Self {
        self.attempts.push(command);
        self
    }

    pub fn transient(mut self, matcher: TransientMatcher) -> Self {
        self.transient = matcher;
        self
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        // attempt is 1-based; doubles each round.
        self.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Audit transcript entry for one operation run.
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub host: String,
    pub operation: String,
    pub outcome: TranscriptOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptOutcome {
    Applied,
    AlreadySatisfied,
    Failed,
}

/// Runs operations against hosts over a transport. Holds no per-host
/// state beyond the transcript.
pub struct HostRunner {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    transcript: Mutex<Vec<TranscriptEntry>>,
}

impl HostRunner {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Run one operation against one host.
    pub async fn run(&self, node: &Node, operation: &Operation) -> MeshbootResult<Outcome> {
        if let Some(check) = &operation.check {
            let output = self.transport.exec(node, check).await?;
            if output.ok() {
                tracing::debug!(host = %node.name, operation = %operation.name, "already satisfied");
                self.record(node, operation, TranscriptOutcome::AlreadySatisfied, "");
                return Ok(Outcome::AlreadySatisfied);
            }
        }

        let mut last_detail = String::new();
        for (alt, command) in operation.attempts.iter().enumerate() {
            match self.exec_with_retry(node, operation, command).await {
                Ok(()) => {
                    if alt > 0 {
                        tracing::info!(
                            host = %node.name,
                            operation = %operation.name,
                            alternative = alt,
                            "fallback alternative succeeded"
                        );
                    }
                    self.record(node, operation, TranscriptOutcome::Applied, "");
                    return Ok(Outcome::Applied);
                }
                Err(detail) => {
                    last_detail = detail;
                }
            }
        }

        self.record(node, operation, TranscriptOutcome::Failed, &last_detail);
        Err(MeshbootError::Fatal(format!(
            "operation '{}' failed on {}: {last_detail}",
            operation.name, node.name
        )))
    }

    /// Execute one alternative, retrying while the failure classifies as
    /// transient. Returns the final failure detail on exhaustion.
    async fn exec_with_retry(
        &self,
        node: &Node,
        operation: &Operation,
        command: &RemoteCommand,
    ) -> Result<(), String> {
        for attempt in 1..=self.retry.max_attempts {
            let output = match self.transport.exec(node, command).await {
                Ok(output) => output,
                // Channel-level failure (cannot even reach the host).
                Err(e) => return Err(e.to_string()),
            };

            if output.ok() {
                return Ok(());
            }

            let detail = output.failure_detail().to_string();
            if attempt < self.retry.max_attempts && operation.transient.matches(&detail) {
                let backoff = self.retry.backoff(attempt);
                tracing::warn!(
                    host = %node.name,
                    operation = %operation.name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                continue;
            }

            return Err(format!("exit {}: {detail}", output.status));
        }
        Err("retry budget exhausted".to_string())
    }

    fn record(&self, node: &Node, operation: &Operation, outcome: TranscriptOutcome, detail: &str) {
        self.transcript.lock().push(TranscriptEntry {
            host: node.name.clone(),
            operation: operation.name.clone(),
            outcome,
            detail: detail.to_string(),
        });
    }

    /// Snapshot of everything run so far, in order.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript.lock().clone()
    }
}
