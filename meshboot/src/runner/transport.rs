//! Remote execution transport.
//!
//! The runner talks to hosts through the `Transport` trait so the channel
//! can be substituted per target environment (ssh for real clusters, a
//! local shell for coordinator-side work, an in-memory fake in tests).

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use meshboot_shared::{MeshbootError, MeshbootResult};

use crate::topology::Node;

/// A command to run on a target host: argv plus environment pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl RemoteCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// A `sh -c` wrapped shell fragment, for pipelines and redirections.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Render as a single shell line (env prefix + quoted argv), suitable
    /// for handing to `ssh host '<line>'` or `sh -c '<line>'`.
    pub fn rendered(&self) -> String {
        let mut parts: Vec<String> = self
            .env
            .iter()
            .map(|(k, v)| format!("{k}={}", sh_quote(v)))
            .collect();
        parts.extend(self.argv.iter().map(|a| sh_quote(a)));
        parts.join(" ")
    }
}

/// Quote one shell word. Plain words pass through untouched.
fn sh_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Result of one remote execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }

    /// stderr if non-empty, else stdout. Used for failure attribution.
    pub fn failure_detail(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Abstract secure remote-execution channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a command on the host, capturing exit status and output.
    async fn exec(&self, node: &Node, command: &RemoteCommand) -> MeshbootResult<ExecOutput>;

    /// Place a file on the host at `remote_path` with the given mode.
    async fn upload(
        &self,
        node: &Node,
        contents: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> MeshbootResult<()>;
}

/// ssh-based transport. Drives the system `ssh` binary via tokio so the
/// coordinator needs no embedded client; credentials come from the
/// invocation environment.
pub struct SshTransport {
    user: Option<String>,
    identity: Option<PathBuf>,
}

impl SshTransport {
    pub fn new(user: Option<String>, identity: Option<PathBuf>) -> Self {
        Self { user, identity }
    }

    fn target(&self, node: &Node) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", node.mesh_ip),
            None => node.mesh_ip.to_string(),
        }
    }

    fn base_command(&self, node: &Node) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(self.target(node));
        cmd
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, node: &Node, command: &RemoteCommand) -> MeshbootResult<ExecOutput> {
        let output = self
            .base_command(node)
            .arg(command.rendered())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn upload(
        &self,
        node: &Node,
        contents: &[u8],
        remote_path: &str,
        mode: u32,
    ) -> MeshbootResult<()> {
        // Stream over stdin rather than scp: one channel, no temp files.
        let script = format!(
            "mkdir -p $(dirname {path}) && cat > {path} && chmod {mode:o} {path}",
            path = sh_quote(remote_path)
        );
        let mut child = self
            .base_command(node)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| MeshbootError::Internal("ssh stdin not captured".into()))?;
        stdin.write_all(contents).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(MeshbootError::Fatal(format!(
                "upload to {}:{remote_path} failed: {}",
                node.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Shell transport for the coordinator's own host. Ignores the node
/// address and runs through `sh -c` locally.
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn exec(&self, _node: &Node, command: &RemoteCommand) -> MeshbootResult<ExecOutput> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command.rendered())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn upload(
        &self,
        _node: &Node,
        contents: &[u8],
        remote_path: &str,
        _mode: u32,
    ) -> MeshbootResult<()> {
        let path = std::path::Path::new(remote_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }
}
